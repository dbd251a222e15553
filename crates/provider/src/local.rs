//! Local control plane backed by SQLite
//!
//! Behaves like the remote API as far as the handlers can observe: whole
//! documents, asynchronous writes that settle after a number of polls,
//! nested resources that require their enclosing resource, cascading deletes.

use std::path::Path;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use ruleplane_common::db::OperationRow;
use ruleplane_common::{Database, Error, FirewallPolicy, Result, RuleCollectionGroup};

use crate::client::{
    from_remote, to_remote, ControlPlane, OperationHandle, OperationKind, OperationStatus, ParentDocument,
    RemoteDocument,
};
use crate::identity::ResourceId;

const IN_PROGRESS: &str = "InProgress";
const SUCCEEDED: &str = "Succeeded";
const FAILED: &str = "Failed";
const NOT_FOUND: &str = "NotFound";

#[derive(Default)]
struct Faults {
    read: Option<String>,
    write: Option<String>,
}

/// SQLite-backed control plane
pub struct LocalControlPlane {
    db: Database,
    settle_polls: RwLock<u32>,
    faults: Mutex<Faults>,
}

impl LocalControlPlane {
    pub fn new(db: Database, settle_polls: u32) -> Self {
        Self {
            db,
            settle_polls: RwLock::new(settle_polls),
            faults: Mutex::new(Faults::default()),
        }
    }

    /// Open the store at `path`
    pub fn open(path: impl AsRef<Path>, settle_polls: u32) -> Result<Self> {
        Ok(Self::new(Database::open(path)?, settle_polls))
    }

    /// In-memory store whose operations settle on the first poll
    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(Database::open_memory()?, 1))
    }

    /// Number of polls an operation stays in progress
    pub fn set_settle_polls(&self, polls: u32) {
        *self.settle_polls.write() = polls;
    }

    /// Make the next read fail with a transient error
    pub fn fail_next_read(&self, message: impl Into<String>) {
        self.faults.lock().read = Some(message.into());
    }

    /// Make the next submitted write end in a failed operation
    pub fn fail_next_write(&self, message: impl Into<String>) {
        self.faults.lock().write = Some(message.into());
    }

    /// Store a document directly, bypassing operations
    pub fn seed<P: ParentDocument>(&self, id: &ResourceId, document: &P) -> Result<()> {
        let remote = to_remote(document)?;
        self.db.put_document(&id.to_string(), &remote.kind, &remote.body)?;
        Ok(())
    }

    /// Delete a document (and everything nested below it) out of band
    pub fn remove(&self, id: &ResourceId) -> Result<bool> {
        let key = id.to_string();
        self.db.delete_nested_documents(&key)?;
        self.db.delete_document(&key)
    }

    /// Inspect a stored document directly
    pub fn document<P: ParentDocument>(&self, id: &ResourceId) -> Result<Option<P>> {
        match self.read_document(id)? {
            Some(document) => Ok(Some(from_remote(id, document)?)),
            None => Ok(None),
        }
    }

    fn read_document(&self, id: &ResourceId) -> Result<Option<RemoteDocument>> {
        let Some(row) = self.db.get_document(&id.to_string())? else {
            return Ok(None);
        };

        let mut body = row.body;
        if row.kind == FirewallPolicy::KIND {
            body["rule_collection_groups"] = serde_json::json!(self.nested_group_ids(id)?);
        }

        Ok(Some(RemoteDocument {
            kind: row.kind,
            body,
            etag: Some(row.etag),
        }))
    }

    fn nested_group_ids(&self, policy: &ResourceId) -> Result<Vec<String>> {
        let prefix = format!("{}/", policy);
        Ok(self
            .db
            .list_documents(Some(RuleCollectionGroup::KIND))?
            .into_iter()
            .map(|row| row.id)
            .filter(|id| id.starts_with(&prefix))
            .collect())
    }

    fn record(&self, id: &ResourceId, kind: OperationKind, document: Option<RemoteDocument>) -> Result<OperationHandle> {
        let target = id.to_string();
        let failure = match kind {
            OperationKind::Write => self.faults.lock().write.take(),
            OperationKind::Delete => None,
        };

        let row = OperationRow {
            id: uuid::Uuid::new_v4().to_string(),
            target: target.clone(),
            kind: match kind {
                OperationKind::Write => "put".to_string(),
                OperationKind::Delete => "delete".to_string(),
            },
            document_kind: document.as_ref().map(|d| d.kind.clone()),
            body: document.map(|d| d.body),
            existed_at_submit: self.db.document_exists(&target)?,
            state: if failure.is_some() { FAILED } else { IN_PROGRESS }.to_string(),
            polls_remaining: i64::from(*self.settle_polls.read()),
            error: failure,
        };
        self.db.insert_operation(&row)?;

        debug!("Accepted {} operation {} for {}", row.kind, row.id, target);
        Ok(OperationHandle {
            id: row.id,
            target: id.clone(),
            kind,
        })
    }

    /// Apply a settled operation to the document table
    fn settle(&self, op: &OperationRow) -> Result<(&'static str, Option<String>)> {
        let exists = self.db.document_exists(&op.target)?;

        match op.kind.as_str() {
            "put" => {
                if op.existed_at_submit && !exists {
                    warn!("{} was deleted while operation {} was running", op.target, op.id);
                    return Ok((NOT_FOUND, None));
                }
                let kind = op.document_kind.as_deref().unwrap_or_default();
                let body = op.body.clone().unwrap_or(serde_json::Value::Null);
                self.db.put_document(&op.target, kind, &body)?;
                Ok((SUCCEEDED, None))
            }
            "delete" => {
                if !exists {
                    return Ok((NOT_FOUND, None));
                }
                self.db.delete_nested_documents(&op.target)?;
                self.db.delete_document(&op.target)?;
                Ok((SUCCEEDED, None))
            }
            other => Ok((FAILED, Some(format!("unknown operation kind {}", other)))),
        }
    }
}

fn status_of(state: &str, error: Option<String>) -> OperationStatus {
    match state {
        IN_PROGRESS => OperationStatus::InProgress,
        SUCCEEDED => OperationStatus::Succeeded,
        NOT_FOUND => OperationStatus::NotFound,
        _ => OperationStatus::Failed(error.unwrap_or_else(|| "operation failed".to_string())),
    }
}

#[async_trait]
impl ControlPlane for LocalControlPlane {
    async fn get(&self, id: &ResourceId) -> Result<Option<RemoteDocument>> {
        if let Some(message) = self.faults.lock().read.take() {
            return Err(Error::Remote(message));
        }
        self.read_document(id)
    }

    async fn create_or_update(&self, id: &ResourceId, document: RemoteDocument) -> Result<OperationHandle> {
        if let Some(parent) = id.parent() {
            if !self.db.document_exists(&parent.to_string())? {
                return Err(Error::not_found(parent.resource_type(), parent.to_string()));
            }
        }
        self.record(id, OperationKind::Write, Some(document))
    }

    async fn delete(&self, id: &ResourceId) -> Result<OperationHandle> {
        self.record(id, OperationKind::Delete, None)
    }

    async fn poll(&self, operation: &OperationHandle) -> Result<OperationStatus> {
        let op = self
            .db
            .get_operation(&operation.id)?
            .ok_or_else(|| Error::not_found("operation", &operation.id))?;

        if op.state != IN_PROGRESS {
            return Ok(status_of(&op.state, op.error));
        }

        if op.polls_remaining > 1 {
            self.db
                .update_operation(&op.id, IN_PROGRESS, op.polls_remaining - 1, None)?;
            return Ok(OperationStatus::InProgress);
        }

        let (state, error) = self.settle(&op)?;
        self.db.update_operation(&op.id, state, 0, error.as_deref())?;
        info!("Operation {} on {} settled: {}", op.id, op.target, state);
        Ok(status_of(state, error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ruleplane_common::Firewall;

    fn fw(name: &str) -> Firewall {
        serde_json::from_value(serde_json::json!({"name": name, "location": "westeurope"})).unwrap()
    }

    #[tokio::test]
    async fn test_write_settles_after_polls() {
        let plane = LocalControlPlane::in_memory().unwrap();
        plane.set_settle_polls(3);
        let id = ResourceId::firewall("sub", "rg", "fw1").unwrap();

        let op = plane.create_or_update(&id, to_remote(&fw("fw1")).unwrap()).await.unwrap();
        assert_eq!(plane.poll(&op).await.unwrap(), OperationStatus::InProgress);
        assert_eq!(plane.poll(&op).await.unwrap(), OperationStatus::InProgress);
        assert!(plane.get(&id).await.unwrap().is_none());

        assert_eq!(plane.poll(&op).await.unwrap(), OperationStatus::Succeeded);
        // terminal status is sticky
        assert_eq!(plane.poll(&op).await.unwrap(), OperationStatus::Succeeded);

        let stored = plane.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.kind, "firewall");
        assert!(stored.etag.is_some());
    }

    #[tokio::test]
    async fn test_update_of_vanished_document_is_not_found() {
        let plane = LocalControlPlane::in_memory().unwrap();
        let id = ResourceId::firewall("sub", "rg", "fw1").unwrap();
        plane.seed(&id, &fw("fw1")).unwrap();

        let op = plane.create_or_update(&id, to_remote(&fw("fw1")).unwrap()).await.unwrap();
        assert!(plane.remove(&id).unwrap());

        assert_eq!(plane.poll(&op).await.unwrap(), OperationStatus::NotFound);
        assert!(plane.get(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_cascades_and_reports_missing() {
        let plane = LocalControlPlane::in_memory().unwrap();
        let policy = ResourceId::firewall_policy("sub", "rg", "p1").unwrap();
        let group = policy.nested("ruleCollectionGroups", "g1").unwrap();
        plane
            .seed(
                &policy,
                &serde_json::from_value::<FirewallPolicy>(
                    serde_json::json!({"name": "p1", "location": "westeurope"}),
                )
                .unwrap(),
            )
            .unwrap();
        plane
            .seed(&group, &RuleCollectionGroup { name: "g1".into(), priority: 100, rule_collections: vec![] })
            .unwrap();

        let listed: FirewallPolicy = plane.document(&policy).unwrap().unwrap();
        assert_eq!(listed.rule_collection_groups, vec![group.to_string()]);

        let op = plane.delete(&policy).await.unwrap();
        assert_eq!(plane.poll(&op).await.unwrap(), OperationStatus::Succeeded);
        assert!(plane.get(&group).await.unwrap().is_none());

        let again = plane.delete(&policy).await.unwrap();
        assert_eq!(plane.poll(&again).await.unwrap(), OperationStatus::NotFound);
    }

    #[tokio::test]
    async fn test_nested_write_requires_parent() {
        let plane = LocalControlPlane::in_memory().unwrap();
        let group = ResourceId::firewall_policy("sub", "rg", "missing")
            .unwrap()
            .nested("ruleCollectionGroups", "g1")
            .unwrap();
        let doc = RuleCollectionGroup { name: "g1".into(), priority: 100, rule_collections: vec![] };

        let err = plane.create_or_update(&group, to_remote(&doc).unwrap()).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_fault_hooks_fire_once() {
        let plane = LocalControlPlane::in_memory().unwrap();
        let id = ResourceId::firewall("sub", "rg", "fw1").unwrap();

        plane.fail_next_read("connection reset");
        assert!(matches!(plane.get(&id).await, Err(Error::Remote(_))));
        assert!(plane.get(&id).await.unwrap().is_none());

        plane.fail_next_write("conflicting priority");
        let op = plane.create_or_update(&id, to_remote(&fw("fw1")).unwrap()).await.unwrap();
        assert_eq!(
            plane.poll(&op).await.unwrap(),
            OperationStatus::Failed("conflicting priority".to_string())
        );
        let op = plane.create_or_update(&id, to_remote(&fw("fw1")).unwrap()).await.unwrap();
        assert_eq!(plane.poll(&op).await.unwrap(), OperationStatus::Succeeded);
    }
}

//! Control plane client interface
//!
//! The control plane stores whole parent documents and applies writes
//! asynchronously: a write or delete returns an operation handle which is
//! polled until it reaches a terminal status.

use std::future::Future;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use tokio::time::Instant;
use tracing::debug;

use ruleplane_common::{Error, Firewall, FirewallPolicy, Result, RuleCollectionGroup};

use crate::identity::ResourceId;

/// A document as the control plane stores it
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteDocument {
    pub kind: String,
    pub body: serde_json::Value,
    /// Version marker of the snapshot this document was read from
    pub etag: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Write,
    Delete,
}

/// Handle of a submitted long-running operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationHandle {
    pub id: String,
    pub target: ResourceId,
    pub kind: OperationKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationStatus {
    InProgress,
    Succeeded,
    Failed(String),
    /// The target disappeared before the operation could settle
    NotFound,
}

/// Remote control plane
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Fetch the current document, `None` when it does not exist
    async fn get(&self, id: &ResourceId) -> Result<Option<RemoteDocument>>;

    /// Submit a full replacement of the document at `id`
    async fn create_or_update(&self, id: &ResourceId, document: RemoteDocument) -> Result<OperationHandle>;

    /// Submit deletion of the document at `id`
    async fn delete(&self, id: &ResourceId) -> Result<OperationHandle>;

    /// Current status of a submitted operation
    async fn poll(&self, operation: &OperationHandle) -> Result<OperationStatus>;
}

/// A document type that owns shared collections
pub trait ParentDocument: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Kind tag stored alongside the document
    const KIND: &'static str;
}

impl ParentDocument for Firewall {
    const KIND: &'static str = "firewall";
}

impl ParentDocument for FirewallPolicy {
    const KIND: &'static str = "firewall_policy";
}

impl ParentDocument for RuleCollectionGroup {
    const KIND: &'static str = "rule_collection_group";
}

/// Run a remote call, failing with a timeout once `deadline` passes
pub async fn with_deadline<T, F>(deadline: Instant, what: impl Into<String>, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let started = Instant::now();
    match tokio::time::timeout_at(deadline, call).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout {
            waiting_on: what.into(),
            seconds: started.elapsed().as_secs(),
        }),
    }
}

/// Serialize a typed document for the control plane
pub fn to_remote<P: ParentDocument>(document: &P) -> Result<RemoteDocument> {
    Ok(RemoteDocument {
        kind: P::KIND.to_string(),
        body: serde_json::to_value(document)?,
        etag: None,
    })
}

/// Decode a fetched document, checking it is of the expected kind
pub fn from_remote<P: ParentDocument>(id: &ResourceId, document: RemoteDocument) -> Result<P> {
    if document.kind != P::KIND {
        return Err(Error::Remote(format!(
            "{} is a {} document, expected {}",
            id,
            document.kind,
            P::KIND
        )));
    }
    Ok(serde_json::from_value(document.body)?)
}

/// Fetch a fresh copy of a parent document
pub async fn fetch<P: ParentDocument>(
    client: &dyn ControlPlane,
    id: &ResourceId,
    deadline: Instant,
) -> Result<Option<P>> {
    let fetched = with_deadline(deadline, format!("reading {}", id), client.get(id)).await?;
    match fetched {
        Some(document) => {
            debug!("Fetched {} (etag {:?})", id, document.etag);
            Ok(Some(from_remote(id, document)?))
        }
        None => Ok(None),
    }
}

/// Submit a full write of a parent document
pub async fn submit_write<P: ParentDocument>(
    client: &dyn ControlPlane,
    id: &ResourceId,
    document: &P,
    deadline: Instant,
) -> Result<OperationHandle> {
    let remote = to_remote(document)?;
    with_deadline(deadline, format!("submitting write of {}", id), client.create_or_update(id, remote)).await
}

/// Submit deletion of a document
pub async fn submit_delete(client: &dyn ControlPlane, id: &ResourceId, deadline: Instant) -> Result<OperationHandle> {
    with_deadline(deadline, format!("submitting delete of {}", id), client.delete(id)).await
}

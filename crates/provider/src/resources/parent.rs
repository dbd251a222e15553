//! Parent document handler
//!
//! Firewalls, firewall policies and rule collection groups are managed as
//! whole documents. They take the same lock their child collections use, and
//! never touch the collections child resources own.

use std::marker::PhantomData;

use tokio::time::Instant;
use tracing::info;

use ruleplane_common::{Error, Result, ResultExt};

use crate::client::{self, ParentDocument};
use crate::config::{Operation, Timeouts};
use crate::convergence::{self, Intent};
use crate::identity::ResourceId;
use crate::locks::{LockKey, LockSet};
use crate::state::{prune_nulls, DynamicValue};

use super::{state_id, Backend, Resource};

/// A kind of whole-document resource
pub trait ParentKind: Send + Sync + 'static {
    type Document: ParentDocument;

    const TYPE_NAME: &'static str;
    /// State attributes derived from the identity rather than the document
    const IDENTITY_ATTRS: &'static [&'static str];

    fn parse_id(input: &str) -> Result<ResourceId>;

    /// Identity of the resource described by `config`
    fn resource_id(subscription_id: &str, config: &DynamicValue) -> Result<ResourceId>;

    /// Values for `IDENTITY_ATTRS`
    fn identity_state(id: &ResourceId) -> Vec<(&'static str, String)>;

    /// Primary lock and any further shared resources the write touches
    fn lock_keys(id: &ResourceId, document: &Self::Document) -> Result<(LockKey, Vec<LockKey>)>;

    /// Take child-owned collections from `current`, or clear them when there is none
    fn carry_children(current: Option<&Self::Document>, desired: &mut Self::Document);

    fn validate(_document: &Self::Document) -> Result<()> {
        Ok(())
    }
}

/// Handler for a whole-document resource
pub struct ParentResource<K: ParentKind> {
    backend: Backend,
    timeouts: Timeouts,
    _kind: PhantomData<fn() -> K>,
}

impl<K: ParentKind> ParentResource<K> {
    pub fn new(backend: Backend, timeouts: Timeouts) -> Self {
        Self {
            backend,
            timeouts,
            _kind: PhantomData,
        }
    }

    async fn lock(&self, id: &ResourceId, document: &K::Document, deadline: Instant) -> Result<LockSet> {
        let (primary, secondary) = K::lock_keys(id, document)?;
        self.backend.locks.acquire_all(&primary, &secondary, deadline).await
    }

    async fn fetch(&self, id: &ResourceId, deadline: Instant) -> Result<Option<K::Document>> {
        client::fetch::<K::Document>(&*self.backend.client, id, deadline).await
    }

    /// Create the document; fails if one already exists at `id`
    pub async fn create_parent(&self, id: &ResourceId, document: K::Document) -> Result<K::Document> {
        self.create_locked(id, document)
            .await
            .with_context(|| format!("creating {} {}", K::TYPE_NAME, id))
    }

    async fn create_locked(&self, id: &ResourceId, mut document: K::Document) -> Result<K::Document> {
        K::validate(&document)?;
        let deadline = self.timeouts.deadline(Operation::Create);

        let _locks = self.lock(id, &document, deadline).await?;
        if self.fetch(id, deadline).await?.is_some() {
            return Err(Error::already_exists(K::TYPE_NAME, id.to_string()));
        }

        K::carry_children(None, &mut document);
        convergence::commit(
            &*self.backend.client,
            id,
            &document,
            Intent::Upsert,
            deadline,
            self.backend.poll_interval,
        )
        .await?;

        info!("Created {} {}", K::TYPE_NAME, id);
        self.fetch(id, deadline)
            .await?
            .ok_or_else(|| Error::not_found(K::TYPE_NAME, id.to_string()))
    }

    pub async fn read_parent(&self, id: &ResourceId) -> Result<Option<K::Document>> {
        let deadline = self.timeouts.deadline(Operation::Read);
        self.fetch(id, deadline)
            .await
            .with_context(|| format!("reading {} {}", K::TYPE_NAME, id))
    }

    /// Replace the document, keeping collections owned by child resources
    pub async fn update_parent(&self, id: &ResourceId, document: K::Document) -> Result<K::Document> {
        self.update_locked(id, document)
            .await
            .with_context(|| format!("updating {} {}", K::TYPE_NAME, id))
    }

    async fn update_locked(&self, id: &ResourceId, mut document: K::Document) -> Result<K::Document> {
        K::validate(&document)?;
        let deadline = self.timeouts.deadline(Operation::Update);

        let _locks = self.lock(id, &document, deadline).await?;
        let current = self
            .fetch(id, deadline)
            .await?
            .ok_or_else(|| Error::not_found(K::TYPE_NAME, id.to_string()))?;

        K::carry_children(Some(&current), &mut document);
        convergence::commit(
            &*self.backend.client,
            id,
            &document,
            Intent::Upsert,
            deadline,
            self.backend.poll_interval,
        )
        .await?;

        info!("Updated {} {}", K::TYPE_NAME, id);
        self.fetch(id, deadline)
            .await?
            .ok_or_else(|| Error::not_found(K::TYPE_NAME, id.to_string()))
    }

    /// Delete the document and everything nested in it
    pub async fn delete_parent(&self, id: &ResourceId) -> Result<()> {
        self.delete_locked(id)
            .await
            .with_context(|| format!("deleting {} {}", K::TYPE_NAME, id))
    }

    async fn delete_locked(&self, id: &ResourceId) -> Result<()> {
        let deadline = self.timeouts.deadline(Operation::Delete);

        // the lock set depends on what the document references
        let Some(current) = self.fetch(id, deadline).await? else {
            info!("{} {} is already gone", K::TYPE_NAME, id);
            return Ok(());
        };

        let _locks = self.lock(id, &current, deadline).await?;
        if self.fetch(id, deadline).await?.is_none() {
            info!("{} {} was deleted while waiting for its lock", K::TYPE_NAME, id);
            return Ok(());
        }
        convergence::commit_delete(&*self.backend.client, id, deadline, self.backend.poll_interval).await?;

        info!("Deleted {} {}", K::TYPE_NAME, id);
        Ok(())
    }

    pub fn expand(config: &DynamicValue) -> Result<K::Document> {
        let mut value = prune_nulls(config.clone().into());
        if let Some(map) = value.as_object_mut() {
            map.remove("id");
            for attr in K::IDENTITY_ATTRS {
                map.remove(*attr);
            }
        }
        serde_json::from_value(value).map_err(|e| Error::InvalidConfig(format!("{}: {}", K::TYPE_NAME, e)))
    }

    pub fn flatten(id: &ResourceId, document: &K::Document) -> Result<DynamicValue> {
        let mut value = serde_json::to_value(document)?;
        let map = value
            .as_object_mut()
            .ok_or_else(|| Error::Internal(format!("{} did not serialize to an object", K::TYPE_NAME)))?;
        map.insert("id".to_string(), id.to_string().into());
        for (attr, attr_value) in K::identity_state(id) {
            map.insert(attr.to_string(), attr_value.into());
        }
        Ok(value.into())
    }
}

#[async_trait::async_trait]
impl<K: ParentKind> Resource for ParentResource<K> {
    fn type_name(&self) -> &'static str {
        K::TYPE_NAME
    }

    async fn create(&self, config: &DynamicValue) -> Result<DynamicValue> {
        let id = K::resource_id(&self.backend.subscription_id, config)?;
        let document = Self::expand(config)?;
        let created = self.create_parent(&id, document).await?;
        Self::flatten(&id, &created)
    }

    async fn read(&self, state: &DynamicValue) -> Result<Option<DynamicValue>> {
        let id = K::parse_id(&state_id(state)?)?;
        match self.read_parent(&id).await? {
            Some(document) => Ok(Some(Self::flatten(&id, &document)?)),
            None => Ok(None),
        }
    }

    async fn update(&self, state: &DynamicValue, config: &DynamicValue) -> Result<DynamicValue> {
        let id = K::parse_id(&state_id(state)?)?;
        let desired = K::resource_id(id.subscription_id(), config)?;
        if desired != id {
            return Err(Error::InvalidConfig(format!(
                "{} cannot move from {} to {}",
                K::TYPE_NAME,
                id,
                desired
            )));
        }
        let updated = self.update_parent(&id, Self::expand(config)?).await?;
        Self::flatten(&id, &updated)
    }

    async fn delete(&self, state: &DynamicValue) -> Result<()> {
        let id = K::parse_id(&state_id(state)?)?;
        self.delete_parent(&id).await
    }
}

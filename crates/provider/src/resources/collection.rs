//! Child collection handler
//!
//! One generic handler serves every rule collection kind. Each mutating
//! operation runs a full cycle under the parent's lock: fetch the parent,
//! reconcile the single element, write the whole parent back, wait for it
//! to converge.

use std::marker::PhantomData;

use tokio::time::Instant;
use tracing::{debug, info};

use ruleplane_common::{Error, Named, Result, ResultExt};

use crate::client;
use crate::config::{Operation, Timeouts};
use crate::convergence::{self, Intent};
use crate::identity::{ChildId, ResourceId};
use crate::locks::LockSet;
use crate::reconcile::{self, ChildKind};
use crate::state::{prune_nulls, require_string_attr, DynamicValue};

use super::{state_id, Backend, Resource};

/// Handler for one kind of shared-collection element
pub struct CollectionResource<K: ChildKind> {
    backend: Backend,
    timeouts: Timeouts,
    _kind: PhantomData<fn() -> K>,
}

impl<K: ChildKind> CollectionResource<K> {
    pub fn new(backend: Backend, timeouts: Timeouts) -> Self {
        Self {
            backend,
            timeouts,
            _kind: PhantomData,
        }
    }

    /// Parse a persisted locator of this kind
    pub fn parse_id(input: &str) -> Result<ChildId> {
        let id = ChildId::parse_in(input, K::COLLECTION)?;
        if !id.parent().is_type(K::PARENT_TYPE) {
            return Err(Error::malformed(
                input,
                format!("{} elements live on {}, not {}", K::COLLECTION, K::PARENT_TYPE, id.parent().resource_type()),
            ));
        }
        Ok(id)
    }

    /// Parse the parent locator of this kind
    pub fn parse_parent(input: &str) -> Result<ResourceId> {
        ResourceId::parse_typed(input, K::PARENT_TYPE)
    }

    async fn lock(&self, parent: &ResourceId, deadline: Instant) -> Result<LockSet> {
        self.backend
            .locks
            .acquire_all(&K::lock_key(parent), &K::secondary_lock_keys(parent), deadline)
            .await
    }

    async fn fetch_parent(&self, parent: &ResourceId, deadline: Instant) -> Result<Option<K::Parent>> {
        client::fetch::<K::Parent>(&*self.backend.client, parent, deadline).await
    }

    async fn require_parent(&self, parent: &ResourceId, deadline: Instant) -> Result<K::Parent> {
        self.fetch_parent(parent, deadline)
            .await?
            .ok_or_else(|| Error::not_found(K::PARENT_TYPE, parent.to_string()))
    }

    /// Add a new element to the parent's collection
    pub async fn create_child(&self, parent_id: &ResourceId, element: K::Element) -> Result<ChildId> {
        let child_id = ChildId::new(parent_id.clone(), K::COLLECTION, element.name())?;
        self.create_locked(parent_id, element)
            .await
            .with_context(|| format!("creating {} {}", K::TYPE_NAME, child_id))
    }

    async fn create_locked(&self, parent_id: &ResourceId, element: K::Element) -> Result<ChildId> {
        K::validate(&element)?;
        let deadline = self.timeouts.deadline(Operation::Create);
        let name = element.name().to_string();

        let _locks = self.lock(parent_id, deadline).await?;
        let parent = self.require_parent(parent_id, deadline).await?;

        let upserted = reconcile::reconcile_upsert::<K>(parent, parent_id, element, true)?;
        convergence::commit(
            &*self.backend.client,
            parent_id,
            &upserted.parent,
            Intent::Upsert,
            deadline,
            self.backend.poll_interval,
        )
        .await?;

        // the canonical locator comes from the converged document
        let refreshed = self.require_parent(parent_id, deadline).await?;
        if reconcile::position::<K>(&refreshed, &name).is_none() {
            return Err(Error::not_found(K::TYPE_NAME, upserted.child_id.to_string()));
        }

        info!("Created {} {}", K::TYPE_NAME, upserted.child_id);
        Ok(upserted.child_id)
    }

    /// Current configuration of the element, `None` when it or its parent is gone
    pub async fn read_child(&self, id: &ChildId) -> Result<Option<K::Element>> {
        let deadline = self.timeouts.deadline(Operation::Read);
        let parent = self
            .fetch_parent(id.parent(), deadline)
            .await
            .with_context(|| format!("reading {} {}", K::TYPE_NAME, id))?;

        let Some(parent) = parent else {
            debug!("Parent of {} is gone", id);
            return Ok(None);
        };
        Ok(reconcile::find::<K>(&parent, id.name()).cloned())
    }

    /// Replace the element in place
    pub async fn update_child(&self, id: &ChildId, element: K::Element) -> Result<()> {
        self.update_locked(id, element)
            .await
            .with_context(|| format!("updating {} {}", K::TYPE_NAME, id))
    }

    async fn update_locked(&self, id: &ChildId, element: K::Element) -> Result<()> {
        if element.name() != id.name() {
            return Err(Error::InvalidConfig(format!(
                "name cannot change from {:?} to {:?}",
                id.name(),
                element.name()
            )));
        }
        K::validate(&element)?;
        let deadline = self.timeouts.deadline(Operation::Update);

        let _locks = self.lock(id.parent(), deadline).await?;
        let parent = self.require_parent(id.parent(), deadline).await?;

        let upserted = reconcile::reconcile_upsert::<K>(parent, id.parent(), element, false)?;
        convergence::commit(
            &*self.backend.client,
            id.parent(),
            &upserted.parent,
            Intent::Upsert,
            deadline,
            self.backend.poll_interval,
        )
        .await?;

        info!("Updated {} {} at position {}", K::TYPE_NAME, id, upserted.position);
        Ok(())
    }

    /// Remove the element; succeeds when it or its parent is already gone
    pub async fn delete_child(&self, id: &ChildId) -> Result<()> {
        self.delete_locked(id)
            .await
            .with_context(|| format!("deleting {} {}", K::TYPE_NAME, id))
    }

    async fn delete_locked(&self, id: &ChildId) -> Result<()> {
        let deadline = self.timeouts.deadline(Operation::Delete);

        let _locks = self.lock(id.parent(), deadline).await?;
        let Some(parent) = self.fetch_parent(id.parent(), deadline).await? else {
            info!("Parent of {} is already gone", id);
            return Ok(());
        };

        let (parent, found) = reconcile::reconcile_delete::<K>(parent, id.name());
        if !found {
            info!("{} {} is already gone", K::TYPE_NAME, id);
            return Ok(());
        }

        convergence::commit(
            &*self.backend.client,
            id.parent(),
            &parent,
            Intent::Delete,
            deadline,
            self.backend.poll_interval,
        )
        .await?;

        info!("Deleted {} {}", K::TYPE_NAME, id);
        Ok(())
    }

    pub async fn child_exists(&self, id: &ChildId) -> Result<bool> {
        Ok(self.read_child(id).await?.is_some())
    }

    /// Split configuration into the parent locator and the element
    pub fn expand(config: &DynamicValue) -> Result<(ResourceId, K::Element)> {
        let parent = Self::parse_parent(&require_string_attr(config, K::PARENT_ATTR)?)?;

        let mut value = prune_nulls(config.clone().into());
        if let Some(map) = value.as_object_mut() {
            map.remove("id");
            map.remove(K::PARENT_ATTR);
        }
        let element: K::Element = serde_json::from_value(value)
            .map_err(|e| Error::InvalidConfig(format!("{}: {}", K::TYPE_NAME, e)))?;
        Ok((parent, element))
    }

    /// State for an element at `id`
    pub fn flatten(id: &ChildId, element: &K::Element) -> Result<DynamicValue> {
        let mut value = serde_json::to_value(element)?;
        let map = value
            .as_object_mut()
            .ok_or_else(|| Error::Internal(format!("{} did not serialize to an object", K::TYPE_NAME)))?;
        map.insert("id".to_string(), id.to_string().into());
        map.insert(K::PARENT_ATTR.to_string(), id.parent().to_string().into());
        Ok(value.into())
    }

    async fn read_back(&self, id: &ChildId) -> Result<DynamicValue> {
        let element = self
            .read_child(id)
            .await?
            .ok_or_else(|| Error::not_found(K::TYPE_NAME, id.to_string()))?;
        Self::flatten(id, &element)
    }
}

#[async_trait::async_trait]
impl<K: ChildKind> Resource for CollectionResource<K> {
    fn type_name(&self) -> &'static str {
        K::TYPE_NAME
    }

    async fn create(&self, config: &DynamicValue) -> Result<DynamicValue> {
        let (parent, element) = Self::expand(config)?;
        let id = self.create_child(&parent, element).await?;
        self.read_back(&id).await
    }

    async fn read(&self, state: &DynamicValue) -> Result<Option<DynamicValue>> {
        let id = Self::parse_id(&state_id(state)?)?;
        match self.read_child(&id).await? {
            Some(element) => Ok(Some(Self::flatten(&id, &element)?)),
            None => Ok(None),
        }
    }

    async fn update(&self, state: &DynamicValue, config: &DynamicValue) -> Result<DynamicValue> {
        let id = Self::parse_id(&state_id(state)?)?;
        let (parent, element) = Self::expand(config)?;
        if &parent != id.parent() {
            return Err(Error::InvalidConfig(format!(
                "{} cannot move from {} to {}",
                K::TYPE_NAME,
                id.parent(),
                parent
            )));
        }
        self.update_child(&id, element).await?;
        self.read_back(&id).await
    }

    async fn delete(&self, state: &DynamicValue) -> Result<()> {
        let id = Self::parse_id(&state_id(state)?)?;
        self.delete_child(&id).await
    }

    async fn exists(&self, state: &DynamicValue) -> Result<bool> {
        let id = Self::parse_id(&state_id(state)?)?;
        self.child_exists(&id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::firewall::{NatRuleCollectionKind, NetworkRuleCollectionKind};
    use crate::state::to_state;
    use ruleplane_common::{FilterAction, NetworkProtocol};

    type Network = CollectionResource<NetworkRuleCollectionKind>;

    const FW: &str = "/subscriptions/sub/resourceGroups/rg/providers/Microsoft.Network/azureFirewalls/fw1";

    #[test]
    fn test_expand_flatten() {
        let config = to_state(&serde_json::json!({
            "firewall_id": FW,
            "name": "r1",
            "priority": 100,
            "action": "Allow",
            "description": null,
            "rules": [{"name": "dns", "destination_ports": ["53"], "protocols": ["UDP"], "description": null}]
        }))
        .unwrap();

        let (parent, element) = Network::expand(&config).unwrap();
        assert_eq!(parent.to_string(), FW);
        assert_eq!(element.name, "r1");
        assert_eq!(element.priority, 100);
        assert_eq!(element.action, FilterAction::Allow);
        assert_eq!(element.rules[0].destination_ports, vec!["53"]);
        assert_eq!(element.rules[0].protocols, vec![NetworkProtocol::Udp]);

        let id = ChildId::new(parent, "networkRuleCollections", "r1").unwrap();
        let state = Network::flatten(&id, &element).unwrap();
        assert_eq!(state_id(&state).unwrap(), format!("{}/networkRuleCollections/r1", FW));
        assert_eq!(require_string_attr(&state, "firewall_id").unwrap(), FW);
    }

    #[test]
    fn test_expand_requires_parent() {
        let config = to_state(&serde_json::json!({"name": "r1", "priority": 100, "action": "Allow"})).unwrap();
        assert!(matches!(Network::expand(&config), Err(Error::InvalidConfig(_))));

        let config = to_state(&serde_json::json!({
            "firewall_id": "/subscriptions/sub/resourceGroups/rg/providers/Microsoft.Network/firewallPolicies/p1",
            "name": "r1", "priority": 100, "action": "Allow"
        }))
        .unwrap();
        assert!(matches!(Network::expand(&config), Err(Error::MalformedIdentity { .. })));
    }

    #[test]
    fn test_parse_id_checks_collection_and_parent() {
        assert!(Network::parse_id(&format!("{}/networkRuleCollections/r1", FW)).is_ok());
        assert!(Network::parse_id(&format!("{}/natRuleCollections/r1", FW)).is_err());
        assert!(CollectionResource::<NatRuleCollectionKind>::parse_id(&format!("{}/natRuleCollections/r1", FW)).is_ok());
        assert!(Network::parse_id(
            "/subscriptions/sub/resourceGroups/rg/providers/Microsoft.Network/firewallPolicies/p1/networkRuleCollections/r1"
        )
        .is_err());
    }
}

//! Resource Implementations
//!
//! Implements the CRUD operations for each resource type. Child resources
//! are elements of a shared collection on a parent document; parent
//! resources are the documents themselves.

pub mod collection;
pub mod firewall;
pub mod parent;
pub mod policy;

use std::sync::Arc;
use std::time::Duration;

use ruleplane_common::Result;

use crate::client::ControlPlane;
use crate::config::ProviderConfig;
use crate::locks::NamedLocks;
use crate::state::{require_string_attr, DynamicValue};

pub use collection::CollectionResource;
pub use parent::ParentResource;

/// What every handler talks to
#[derive(Clone)]
pub struct Backend {
    pub client: Arc<dyn ControlPlane>,
    pub locks: Arc<NamedLocks>,
    pub poll_interval: Duration,
    /// Subscription parents are created in
    pub subscription_id: String,
}

impl Backend {
    pub fn new(client: Arc<dyn ControlPlane>, config: &ProviderConfig) -> Self {
        Self {
            client,
            locks: NamedLocks::shared(),
            poll_interval: config.poll_interval(),
            subscription_id: config.subscription_id.clone(),
        }
    }

    /// Use a private lock registry instead of the process-wide one
    pub fn with_locks(mut self, locks: Arc<NamedLocks>) -> Self {
        self.locks = locks;
        self
    }
}

/// Trait for resource operations
#[async_trait::async_trait]
pub trait Resource: Send + Sync {
    /// Resource type name
    fn type_name(&self) -> &'static str;

    /// Create a new resource
    async fn create(&self, config: &DynamicValue) -> Result<DynamicValue>;

    /// Read an existing resource; `None` when it is gone
    async fn read(&self, state: &DynamicValue) -> Result<Option<DynamicValue>>;

    /// Update an existing resource
    async fn update(&self, state: &DynamicValue, config: &DynamicValue) -> Result<DynamicValue>;

    /// Delete a resource; deleting something already gone succeeds
    async fn delete(&self, state: &DynamicValue) -> Result<()>;

    /// Whether the resource currently exists
    async fn exists(&self, state: &DynamicValue) -> Result<bool> {
        Ok(self.read(state).await?.is_some())
    }
}

/// The persisted identity of a resource
pub fn state_id(state: &DynamicValue) -> Result<String> {
    require_string_attr(state, "id")
}

/// One handler per supported resource type
pub fn registry(backend: &Backend, config: &ProviderConfig) -> Vec<Box<dyn Resource>> {
    use firewall::{ApplicationRuleCollectionKind, FirewallKind, NatRuleCollectionKind, NetworkRuleCollectionKind};
    use policy::{FirewallPolicyKind, PolicyRuleCollectionKind, RuleCollectionGroupKind};

    fn child_handler<K: crate::reconcile::ChildKind>(backend: &Backend, config: &ProviderConfig) -> Box<dyn Resource> {
        Box::new(CollectionResource::<K>::new(backend.clone(), config.timeouts_for(K::TYPE_NAME)))
    }

    fn parent_handler<K: parent::ParentKind>(backend: &Backend, config: &ProviderConfig) -> Box<dyn Resource> {
        Box::new(ParentResource::<K>::new(backend.clone(), config.timeouts_for(K::TYPE_NAME)))
    }

    vec![
        parent_handler::<FirewallKind>(backend, config),
        child_handler::<ApplicationRuleCollectionKind>(backend, config),
        child_handler::<NetworkRuleCollectionKind>(backend, config),
        child_handler::<NatRuleCollectionKind>(backend, config),
        parent_handler::<FirewallPolicyKind>(backend, config),
        parent_handler::<RuleCollectionGroupKind>(backend, config),
        child_handler::<PolicyRuleCollectionKind>(backend, config),
    ]
}

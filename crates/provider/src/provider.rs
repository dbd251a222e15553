//! Ruleplane Provider Implementation
//!
//! Dispatches host-runtime calls to the resource handlers by type name and
//! turns handler failures into diagnostics.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, error, info};

use ruleplane_common::{Error, Result};

use crate::client::ControlPlane;
use crate::config::ProviderConfig;
use crate::locks::NamedLocks;
use crate::resources::{self, Backend, Resource};
use crate::state::{
    decode_dynamic_value, decode_json_value, encode_dynamic_value, get_optional_string_attr, get_string_attr,
    make_state, string_value, DynamicValue,
};

/// A state value as exchanged with the host
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EncodedValue {
    pub msgpack: Vec<u8>,
    pub json: Vec<u8>,
}

impl EncodedValue {
    pub fn encode(value: &DynamicValue) -> Result<Self> {
        Ok(Self {
            msgpack: encode_dynamic_value(value)?,
            json: vec![],
        })
    }

    pub fn from_json(json: impl Into<Vec<u8>>) -> Self {
        Self {
            msgpack: vec![],
            json: json.into(),
        }
    }

    pub fn decode(&self) -> Result<DynamicValue> {
        if !self.msgpack.is_empty() {
            decode_dynamic_value(&self.msgpack)
        } else {
            decode_json_value(&self.json)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub summary: String,
    pub detail: String,
}

impl Diagnostic {
    fn error(summary: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            summary: summary.into(),
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Default)]
pub struct ReadResponse {
    pub new_state: Option<EncodedValue>,
    pub diagnostics: Vec<Diagnostic>,
}

#[derive(Debug, Default)]
pub struct ApplyResponse {
    pub new_state: Option<EncodedValue>,
    pub diagnostics: Vec<Diagnostic>,
}

#[derive(Debug)]
pub struct ImportedResource {
    pub type_name: String,
    pub state: EncodedValue,
}

#[derive(Debug, Default)]
pub struct ImportResponse {
    pub imported_resources: Vec<ImportedResource>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Ruleplane provider
pub struct RuleplaneProvider {
    client: Arc<dyn ControlPlane>,
    locks: Arc<NamedLocks>,
    config: RwLock<ProviderConfig>,
    resources: RwLock<HashMap<&'static str, Box<dyn Resource>>>,
}

impl RuleplaneProvider {
    pub fn new(client: Arc<dyn ControlPlane>, config: ProviderConfig) -> Self {
        Self::with_locks(client, config, NamedLocks::shared())
    }

    /// Provider with its own lock registry
    pub fn with_locks(client: Arc<dyn ControlPlane>, config: ProviderConfig, locks: Arc<NamedLocks>) -> Self {
        let resources = Self::build(&client, &locks, &config);
        Self {
            client,
            locks,
            config: RwLock::new(config),
            resources: RwLock::new(resources),
        }
    }

    fn build(
        client: &Arc<dyn ControlPlane>,
        locks: &Arc<NamedLocks>,
        config: &ProviderConfig,
    ) -> HashMap<&'static str, Box<dyn Resource>> {
        let backend = Backend::new(client.clone(), config).with_locks(locks.clone());
        resources::registry(&backend, config)
            .into_iter()
            .map(|r| (r.type_name(), r))
            .collect()
    }

    pub async fn resource_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.resources.read().await.keys().copied().collect();
        types.sort_unstable();
        types
    }

    pub async fn config(&self) -> ProviderConfig {
        self.config.read().await.clone()
    }

    /// Apply provider-level configuration from the host
    pub async fn configure(&self, config: Option<&EncodedValue>) -> Vec<Diagnostic> {
        info!("ConfigureProvider called");

        let value = match config.map(EncodedValue::decode).transpose() {
            Ok(value) => value.unwrap_or_default(),
            Err(e) => return vec![Diagnostic::error("Invalid provider configuration", e.to_string())],
        };

        let mut current = self.config.write().await;
        let mut candidate = current.clone();
        if let Some(subscription_id) = get_optional_string_attr(&value, "subscription_id") {
            candidate.subscription_id = subscription_id;
        }
        if let Some(interval) = value.get("poll_interval_ms").and_then(|v| v.as_i64()) {
            match u64::try_from(interval) {
                Ok(ms) => candidate.poll_interval_ms = ms,
                Err(_) => {
                    return vec![Diagnostic::error(
                        "Invalid provider configuration",
                        format!("poll_interval_ms must not be negative, got {}", interval),
                    )]
                }
            }
        }

        *self.resources.write().await = Self::build(&self.client, &self.locks, &candidate);
        *current = candidate;
        debug!("Provider configured for subscription {}", current.subscription_id);
        vec![]
    }

    pub async fn read_resource(&self, type_name: &str, current_state: Option<&EncodedValue>) -> Result<ReadResponse> {
        info!("ReadResource called for {}", type_name);
        let resources = self.resources.read().await;
        let resource = lookup(&resources, type_name)?;

        let current = current_state.map(EncodedValue::decode).transpose()?.unwrap_or_default();

        match resource.read(&current).await {
            Ok(Some(state)) => Ok(ReadResponse {
                new_state: Some(EncodedValue::encode(&state)?),
                diagnostics: vec![],
            }),
            Ok(None) => {
                info!("{} {} no longer exists", type_name, get_string_attr(&current, "id"));
                Ok(ReadResponse::default())
            }
            Err(e) if e.is_not_found() => Ok(ReadResponse::default()),
            Err(e) => {
                error!("Reading {} failed: {}", type_name, e);
                Ok(ReadResponse {
                    new_state: current_state.cloned(),
                    diagnostics: vec![Diagnostic::error("Failed to read resource", e.to_string())],
                })
            }
        }
    }

    /// Create, update or delete, inferred from the prior and planned states
    pub async fn apply_resource_change(
        &self,
        type_name: &str,
        prior_state: Option<&EncodedValue>,
        planned_state: Option<&EncodedValue>,
    ) -> Result<ApplyResponse> {
        info!("ApplyResourceChange called for {}", type_name);
        let resources = self.resources.read().await;
        let resource = lookup(&resources, type_name)?;

        let prior = prior_state.map(EncodedValue::decode).transpose()?;
        let planned = planned_state.map(EncodedValue::decode).transpose()?;

        let result = match (prior.as_ref(), planned.as_ref()) {
            // Create
            (None, Some(planned)) | (Some(DynamicValue::Null), Some(planned)) if !planned.is_null() => {
                resource.create(planned).await.map(Some)
            }
            // Update
            (Some(prior), Some(planned)) if !prior.is_null() && !planned.is_null() => {
                resource.update(prior, planned).await.map(Some)
            }
            // Delete
            (Some(prior), _) if !prior.is_null() => resource.delete(prior).await.map(|_| None),
            // No change
            _ => Ok(None),
        };

        match result {
            Ok(Some(state)) => Ok(ApplyResponse {
                new_state: Some(EncodedValue::encode(&state)?),
                diagnostics: vec![],
            }),
            Ok(None) => Ok(ApplyResponse::default()),
            Err(e) => {
                error!("Applying {} failed: {}", type_name, e);
                // a failed create records nothing; otherwise the prior state stays
                Ok(ApplyResponse {
                    new_state: prior_state.filter(|_| prior.as_ref().is_some_and(|p| !p.is_null())).cloned(),
                    diagnostics: vec![Diagnostic::error("Failed to apply resource change", e.to_string())],
                })
            }
        }
    }

    pub async fn import_resource_state(&self, type_name: &str, id: &str) -> Result<ImportResponse> {
        info!("ImportResourceState called for {} with ID {}", type_name, id);
        let resources = self.resources.read().await;
        let resource = lookup(&resources, type_name)?;

        let initial_state = make_state(vec![("id", string_value(id))]);
        match resource.read(&initial_state).await {
            Ok(Some(state)) => Ok(ImportResponse {
                imported_resources: vec![ImportedResource {
                    type_name: type_name.to_string(),
                    state: EncodedValue::encode(&state)?,
                }],
                diagnostics: vec![],
            }),
            Ok(None) => Ok(ImportResponse {
                imported_resources: vec![],
                diagnostics: vec![Diagnostic::error(
                    "Cannot import non-existent remote object",
                    format!("{} {} does not exist", type_name, id),
                )],
            }),
            Err(e) => Ok(ImportResponse {
                imported_resources: vec![],
                diagnostics: vec![Diagnostic::error("Failed to import resource", e.to_string())],
            }),
        }
    }
}

fn lookup<'a>(
    resources: &'a HashMap<&'static str, Box<dyn Resource>>,
    type_name: &str,
) -> Result<&'a dyn Resource> {
    resources
        .get(type_name)
        .map(|r| r.as_ref())
        .ok_or_else(|| Error::not_found("resource type", type_name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalControlPlane;

    fn provider() -> RuleplaneProvider {
        let plane = Arc::new(LocalControlPlane::in_memory().unwrap());
        let config = ProviderConfig {
            poll_interval_ms: 1,
            ..ProviderConfig::default()
        };
        RuleplaneProvider::with_locks(plane, config, Arc::new(NamedLocks::new()))
    }

    #[tokio::test]
    async fn test_registered_types() {
        let types = provider().resource_types().await;
        assert_eq!(
            types,
            vec![
                "ruleplane_firewall",
                "ruleplane_firewall_application_rule_collection",
                "ruleplane_firewall_nat_rule_collection",
                "ruleplane_firewall_network_rule_collection",
                "ruleplane_firewall_policy",
                "ruleplane_firewall_policy_rule_collection",
                "ruleplane_firewall_policy_rule_collection_group",
            ]
        );
    }

    #[tokio::test]
    async fn test_unknown_type() {
        let err = provider().read_resource("ruleplane_router", None).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_configure_overrides_subscription() {
        let provider = provider();
        let config = EncodedValue::encode(&make_state(vec![("subscription_id", string_value("sub-42"))])).unwrap();
        assert!(provider.configure(Some(&config)).await.is_empty());
        assert_eq!(provider.config().await.subscription_id, "sub-42");

        let bad = EncodedValue::from_json(r#"{"poll_interval_ms": -5}"#);
        assert_eq!(provider.configure(Some(&bad)).await.len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_configure_changes_nothing() {
        let provider = provider();
        let before = provider.config().await;

        let bad = EncodedValue::from_json(r#"{"subscription_id": "sub-new", "poll_interval_ms": -5}"#);
        assert_eq!(provider.configure(Some(&bad)).await.len(), 1);

        let after = provider.config().await;
        assert_eq!(after.subscription_id, before.subscription_id);
        assert_eq!(after.poll_interval_ms, before.poll_interval_ms);
    }

    #[tokio::test]
    async fn test_failed_create_records_nothing() {
        let provider = provider();
        let planned = EncodedValue::from_json(
            r#"{"name": "r1", "priority": 100, "action": "Allow",
                "firewall_id": "/subscriptions/sub/resourceGroups/rg/providers/Microsoft.Network/azureFirewalls/missing"}"#,
        );

        let response = provider
            .apply_resource_change("ruleplane_firewall_network_rule_collection", None, Some(&planned))
            .await
            .unwrap();
        assert!(response.new_state.is_none());
        assert_eq!(response.diagnostics.len(), 1);
        assert!(response.diagnostics[0].detail.contains("not found"));
    }
}

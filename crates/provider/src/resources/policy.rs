//! Firewall policies, rule collection groups and policy rule collections
//!
//! Writers of a group lock its policy first, then the group itself.

use ruleplane_common::{Error, FirewallPolicy, PolicyRuleCollection, Result, RuleCollectionGroup};

use crate::identity::{ResourceId, FIREWALL_POLICIES, RULE_COLLECTION_GROUPS};
use crate::locks::LockKey;
use crate::reconcile::ChildKind;
use crate::state::{require_string_attr, DynamicValue};

use super::firewall::check_priority;
use super::parent::ParentKind;

pub const POLICY_TYPE: &str = "ruleplane_firewall_policy";
pub const GROUP_TYPE: &str = "ruleplane_firewall_policy_rule_collection_group";

pub fn policy_lock(policy: &ResourceId) -> LockKey {
    LockKey::new(POLICY_TYPE, policy.name())
}

/// Group names are only unique within their policy
pub fn group_lock(group: &ResourceId) -> LockKey {
    match group.parent() {
        Some(policy) => LockKey::new(GROUP_TYPE, format!("{}/{}", policy.name(), group.name())),
        None => LockKey::new(GROUP_TYPE, group.name()),
    }
}

fn group_lock_keys(group: &ResourceId) -> (LockKey, Vec<LockKey>) {
    let primary = match group.parent() {
        Some(policy) => policy_lock(&policy),
        None => group_lock(group),
    };
    (primary, vec![group_lock(group)])
}

pub struct FirewallPolicyKind;

impl ParentKind for FirewallPolicyKind {
    type Document = FirewallPolicy;

    const TYPE_NAME: &'static str = POLICY_TYPE;
    const IDENTITY_ATTRS: &'static [&'static str] = &["resource_group_name"];

    fn parse_id(input: &str) -> Result<ResourceId> {
        ResourceId::parse_typed(input, FIREWALL_POLICIES)
    }

    fn resource_id(subscription_id: &str, config: &DynamicValue) -> Result<ResourceId> {
        ResourceId::firewall_policy(
            subscription_id,
            &require_string_attr(config, "resource_group_name")?,
            &require_string_attr(config, "name")?,
        )
    }

    fn identity_state(id: &ResourceId) -> Vec<(&'static str, String)> {
        vec![("resource_group_name", id.resource_group().to_string())]
    }

    fn lock_keys(id: &ResourceId, _document: &FirewallPolicy) -> Result<(LockKey, Vec<LockKey>)> {
        Ok((policy_lock(id), Vec::new()))
    }

    // group ids are computed by the control plane
    fn carry_children(current: Option<&FirewallPolicy>, desired: &mut FirewallPolicy) {
        desired.rule_collection_groups = current.map(|c| c.rule_collection_groups.clone()).unwrap_or_default();
    }

    fn validate(document: &FirewallPolicy) -> Result<()> {
        if document.location.is_empty() {
            return Err(Error::InvalidConfig(format!(
                "firewall policy {} needs a location",
                document.name
            )));
        }
        if let Some(base) = document.base_policy_id.as_deref() {
            ResourceId::parse_typed(base, FIREWALL_POLICIES)?;
        }
        Ok(())
    }
}

pub struct RuleCollectionGroupKind;

impl ParentKind for RuleCollectionGroupKind {
    type Document = RuleCollectionGroup;

    const TYPE_NAME: &'static str = GROUP_TYPE;
    const IDENTITY_ATTRS: &'static [&'static str] = &["firewall_policy_id"];

    fn parse_id(input: &str) -> Result<ResourceId> {
        let id = ResourceId::parse_typed(input, RULE_COLLECTION_GROUPS)?;
        match id.parent() {
            Some(policy) if policy.is_type(FIREWALL_POLICIES) => Ok(id),
            _ => Err(Error::malformed(input, "rule collection groups live on a firewall policy")),
        }
    }

    fn resource_id(_subscription_id: &str, config: &DynamicValue) -> Result<ResourceId> {
        let policy = ResourceId::parse_typed(&require_string_attr(config, "firewall_policy_id")?, FIREWALL_POLICIES)?;
        policy.nested(RULE_COLLECTION_GROUPS, require_string_attr(config, "name")?)
    }

    fn identity_state(id: &ResourceId) -> Vec<(&'static str, String)> {
        id.parent()
            .map(|policy| vec![("firewall_policy_id", policy.to_string())])
            .unwrap_or_default()
    }

    fn lock_keys(id: &ResourceId, _document: &RuleCollectionGroup) -> Result<(LockKey, Vec<LockKey>)> {
        Ok(group_lock_keys(id))
    }

    fn carry_children(current: Option<&RuleCollectionGroup>, desired: &mut RuleCollectionGroup) {
        desired.rule_collections = current.map(|c| c.rule_collections.clone()).unwrap_or_default();
    }

    fn validate(document: &RuleCollectionGroup) -> Result<()> {
        check_priority(GROUP_TYPE, &document.name, document.priority)
    }
}

pub struct PolicyRuleCollectionKind;

impl ChildKind for PolicyRuleCollectionKind {
    type Parent = RuleCollectionGroup;
    type Element = PolicyRuleCollection;

    const TYPE_NAME: &'static str = "ruleplane_firewall_policy_rule_collection";
    const COLLECTION: &'static str = "ruleCollections";
    const PARENT_ATTR: &'static str = "rule_collection_group_id";
    const PARENT_TYPE: &'static str = RULE_COLLECTION_GROUPS;

    fn collection(parent: &RuleCollectionGroup) -> &[PolicyRuleCollection] {
        &parent.rule_collections
    }

    fn collection_mut(parent: &mut RuleCollectionGroup) -> &mut Vec<PolicyRuleCollection> {
        &mut parent.rule_collections
    }

    fn lock_key(parent: &ResourceId) -> LockKey {
        group_lock_keys(parent).0
    }

    fn secondary_lock_keys(parent: &ResourceId) -> Vec<LockKey> {
        group_lock_keys(parent).1
    }

    fn validate(element: &PolicyRuleCollection) -> Result<()> {
        use ruleplane_common::Named;

        check_priority(Self::TYPE_NAME, element.name(), element.priority())?;
        element.check_rules().map_err(Error::InvalidConfig)
    }
}

//! Firewall and its classic rule collections
//!
//! A firewall carries three rule collection arrays. Each array element is
//! managed as its own resource; all of them, and the firewall itself, share
//! the firewall's lock.

use ruleplane_common::{
    ApplicationRuleCollection, Error, Firewall, NatRuleCollection, NetworkRuleCollection, Result,
};

use crate::identity::{ResourceId, AZURE_FIREWALLS, SUBNETS};
use crate::locks::LockKey;
use crate::reconcile::ChildKind;
use crate::state::{require_string_attr, DynamicValue};

use super::parent::ParentKind;

pub const FIREWALL_TYPE: &str = "ruleplane_firewall";
pub const VIRTUAL_NETWORK_LOCK: &str = "ruleplane_virtual_network";

pub const MIN_PRIORITY: i64 = 100;
pub const MAX_PRIORITY: i64 = 65000;

/// Lock shared by a firewall and every collection on it
pub fn firewall_lock(firewall: &ResourceId) -> LockKey {
    LockKey::new(FIREWALL_TYPE, firewall.name())
}

pub(crate) fn check_priority(kind: &str, name: &str, priority: i64) -> Result<()> {
    if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&priority) {
        return Err(Error::InvalidConfig(format!(
            "{} {}: priority {} is outside {}..={}",
            kind, name, priority, MIN_PRIORITY, MAX_PRIORITY
        )));
    }
    Ok(())
}

fn check_has_rules(kind: &str, name: &str, count: usize) -> Result<()> {
    if count == 0 {
        return Err(Error::InvalidConfig(format!("{} {} needs at least one rule", kind, name)));
    }
    Ok(())
}

pub struct FirewallKind;

impl ParentKind for FirewallKind {
    type Document = Firewall;

    const TYPE_NAME: &'static str = FIREWALL_TYPE;
    const IDENTITY_ATTRS: &'static [&'static str] = &["resource_group_name"];

    fn parse_id(input: &str) -> Result<ResourceId> {
        ResourceId::parse_typed(input, AZURE_FIREWALLS)
    }

    fn resource_id(subscription_id: &str, config: &DynamicValue) -> Result<ResourceId> {
        ResourceId::firewall(
            subscription_id,
            &require_string_attr(config, "resource_group_name")?,
            &require_string_attr(config, "name")?,
        )
    }

    fn identity_state(id: &ResourceId) -> Vec<(&'static str, String)> {
        vec![("resource_group_name", id.resource_group().to_string())]
    }

    /// The firewall first, then the virtual networks its subnets belong to
    fn lock_keys(id: &ResourceId, document: &Firewall) -> Result<(LockKey, Vec<LockKey>)> {
        let mut networks = Vec::new();
        for ip in &document.ip_configurations {
            let Some(subnet) = ip.subnet_id.as_deref() else {
                continue;
            };
            let subnet = ResourceId::parse_typed(subnet, SUBNETS)?;
            let network = subnet
                .parent()
                .ok_or_else(|| Error::malformed(subnet.to_string(), "subnet has no virtual network"))?;
            networks.push(LockKey::new(VIRTUAL_NETWORK_LOCK, network.name()));
        }
        Ok((firewall_lock(id), networks))
    }

    fn carry_children(current: Option<&Firewall>, desired: &mut Firewall) {
        match current {
            Some(current) => {
                desired.application_rule_collections = current.application_rule_collections.clone();
                desired.network_rule_collections = current.network_rule_collections.clone();
                desired.nat_rule_collections = current.nat_rule_collections.clone();
            }
            None => {
                desired.application_rule_collections.clear();
                desired.network_rule_collections.clear();
                desired.nat_rule_collections.clear();
            }
        }
    }

    fn validate(document: &Firewall) -> Result<()> {
        if document.location.is_empty() {
            return Err(Error::InvalidConfig(format!("firewall {} needs a location", document.name)));
        }
        Ok(())
    }
}

pub struct ApplicationRuleCollectionKind;

impl ChildKind for ApplicationRuleCollectionKind {
    type Parent = Firewall;
    type Element = ApplicationRuleCollection;

    const TYPE_NAME: &'static str = "ruleplane_firewall_application_rule_collection";
    const COLLECTION: &'static str = "applicationRuleCollections";
    const PARENT_ATTR: &'static str = "firewall_id";
    const PARENT_TYPE: &'static str = AZURE_FIREWALLS;

    fn collection(parent: &Firewall) -> &[ApplicationRuleCollection] {
        &parent.application_rule_collections
    }

    fn collection_mut(parent: &mut Firewall) -> &mut Vec<ApplicationRuleCollection> {
        &mut parent.application_rule_collections
    }

    fn lock_key(parent: &ResourceId) -> LockKey {
        firewall_lock(parent)
    }

    fn validate(element: &ApplicationRuleCollection) -> Result<()> {
        check_priority(Self::TYPE_NAME, &element.name, element.priority)?;
        check_has_rules(Self::TYPE_NAME, &element.name, element.rules.len())?;
        for rule in &element.rules {
            if rule.fqdn_tags.is_empty() && rule.target_fqdns.is_empty() {
                return Err(Error::InvalidConfig(format!(
                    "application rule {} needs `fqdn_tags` or `target_fqdns`",
                    rule.name
                )));
            }
            if !rule.fqdn_tags.is_empty() && !rule.protocols.is_empty() {
                return Err(Error::InvalidConfig(format!(
                    "application rule {} can't combine `fqdn_tags` with `protocols`",
                    rule.name
                )));
            }
        }
        Ok(())
    }
}

pub struct NetworkRuleCollectionKind;

impl ChildKind for NetworkRuleCollectionKind {
    type Parent = Firewall;
    type Element = NetworkRuleCollection;

    const TYPE_NAME: &'static str = "ruleplane_firewall_network_rule_collection";
    const COLLECTION: &'static str = "networkRuleCollections";
    const PARENT_ATTR: &'static str = "firewall_id";
    const PARENT_TYPE: &'static str = AZURE_FIREWALLS;

    fn collection(parent: &Firewall) -> &[NetworkRuleCollection] {
        &parent.network_rule_collections
    }

    fn collection_mut(parent: &mut Firewall) -> &mut Vec<NetworkRuleCollection> {
        &mut parent.network_rule_collections
    }

    fn lock_key(parent: &ResourceId) -> LockKey {
        firewall_lock(parent)
    }

    fn validate(element: &NetworkRuleCollection) -> Result<()> {
        check_priority(Self::TYPE_NAME, &element.name, element.priority)
    }
}

pub struct NatRuleCollectionKind;

impl ChildKind for NatRuleCollectionKind {
    type Parent = Firewall;
    type Element = NatRuleCollection;

    const TYPE_NAME: &'static str = "ruleplane_firewall_nat_rule_collection";
    const COLLECTION: &'static str = "natRuleCollections";
    const PARENT_ATTR: &'static str = "firewall_id";
    const PARENT_TYPE: &'static str = AZURE_FIREWALLS;

    fn collection(parent: &Firewall) -> &[NatRuleCollection] {
        &parent.nat_rule_collections
    }

    fn collection_mut(parent: &mut Firewall) -> &mut Vec<NatRuleCollection> {
        &mut parent.nat_rule_collections
    }

    fn lock_key(parent: &ResourceId) -> LockKey {
        firewall_lock(parent)
    }

    fn validate(element: &NatRuleCollection) -> Result<()> {
        check_priority(Self::TYPE_NAME, &element.name, element.priority)?;
        check_has_rules(Self::TYPE_NAME, &element.name, element.rules.len())?;
        for rule in &element.rules {
            rule.check_translation().map_err(Error::InvalidConfig)?;
        }
        Ok(())
    }
}

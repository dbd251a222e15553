//! Remote document types for Ruleplane
//!
//! These mirror the shapes the control plane stores: a parent document owns
//! one or more ordered collections, and every collection element is named.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Anything that lives in a shared collection and is addressed by name
pub trait Named {
    fn name(&self) -> &str;
}

/// Action of a filter (application/network) rule collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterAction {
    Allow,
    Deny,
}

/// Action of a NAT rule collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NatAction {
    Dnat,
    Snat,
}

/// Application-level protocol matched by an application rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplicationProtocolType {
    Http,
    Https,
    Mssql,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationProtocol {
    #[serde(rename = "type")]
    pub protocol_type: ApplicationProtocolType,
    pub port: u16,
}

/// Transport protocol matched by network and NAT rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkProtocol {
    Any,
    #[serde(rename = "TCP")]
    Tcp,
    #[serde(rename = "UDP")]
    Udp,
    #[serde(rename = "ICMP")]
    Icmp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkuTier {
    Basic,
    Standard,
    Premium,
}

impl Default for SkuTier {
    fn default() -> Self {
        Self::Standard
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThreatIntelMode {
    Off,
    Alert,
    Deny,
}

impl Default for ThreatIntelMode {
    fn default() -> Self {
        Self::Alert
    }
}

// ============================================================================
// Classic firewall rule collections
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationRule {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub source_addresses: Vec<String>,
    #[serde(default)]
    pub source_ip_groups: Vec<String>,
    #[serde(default)]
    pub fqdn_tags: Vec<String>,
    #[serde(default)]
    pub target_fqdns: Vec<String>,
    #[serde(default)]
    pub protocols: Vec<ApplicationProtocol>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationRuleCollection {
    pub name: String,
    pub priority: i64,
    pub action: FilterAction,
    #[serde(default)]
    pub rules: Vec<ApplicationRule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkRule {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub source_addresses: Vec<String>,
    #[serde(default)]
    pub source_ip_groups: Vec<String>,
    #[serde(default)]
    pub destination_addresses: Vec<String>,
    #[serde(default)]
    pub destination_ip_groups: Vec<String>,
    #[serde(default)]
    pub destination_fqdns: Vec<String>,
    #[serde(default)]
    pub destination_ports: Vec<String>,
    #[serde(default)]
    pub protocols: Vec<NetworkProtocol>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkRuleCollection {
    pub name: String,
    pub priority: i64,
    pub action: FilterAction,
    #[serde(default)]
    pub rules: Vec<NetworkRule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NatRule {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub source_addresses: Vec<String>,
    #[serde(default)]
    pub source_ip_groups: Vec<String>,
    #[serde(default)]
    pub destination_addresses: Vec<String>,
    #[serde(default)]
    pub destination_ports: Vec<String>,
    #[serde(default)]
    pub protocols: Vec<NetworkProtocol>,
    #[serde(default)]
    pub translated_address: Option<String>,
    #[serde(default)]
    pub translated_fqdn: Option<String>,
    pub translated_port: String,
}

impl NatRule {
    /// A NAT rule translates to exactly one of an address or an FQDN
    pub fn check_translation(&self) -> Result<(), String> {
        let has_address = self.translated_address.as_deref().is_some_and(|s| !s.is_empty());
        let has_fqdn = self.translated_fqdn.as_deref().is_some_and(|s| !s.is_empty());
        match (has_address, has_fqdn) {
            (true, true) => Err(format!(
                "can't specify both `translated_address` and `translated_fqdn` in rule {}",
                self.name
            )),
            (false, false) => Err(format!(
                "should specify either `translated_address` or `translated_fqdn` in rule {}",
                self.name
            )),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NatRuleCollection {
    pub name: String,
    pub priority: i64,
    pub action: NatAction,
    #[serde(default)]
    pub rules: Vec<NatRule>,
}

impl Named for ApplicationRuleCollection {
    fn name(&self) -> &str {
        &self.name
    }
}

impl Named for NetworkRuleCollection {
    fn name(&self) -> &str {
        &self.name
    }
}

impl Named for NatRuleCollection {
    fn name(&self) -> &str {
        &self.name
    }
}

// ============================================================================
// Firewall
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpConfiguration {
    pub name: String,
    pub subnet_id: Option<String>,
    pub public_ip_address_id: Option<String>,
    #[serde(default)]
    pub private_ip_address: Option<String>,
}

/// Firewall document. The three rule collection lists are managed by
/// separate child resources and travel with every write of the firewall.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Firewall {
    pub name: String,
    pub location: String,
    #[serde(default)]
    pub sku_tier: SkuTier,
    #[serde(default)]
    pub threat_intel_mode: ThreatIntelMode,
    #[serde(default)]
    pub ip_configurations: Vec<IpConfiguration>,
    #[serde(default)]
    pub firewall_policy_id: Option<String>,
    #[serde(default)]
    pub zones: Vec<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub application_rule_collections: Vec<ApplicationRuleCollection>,
    #[serde(default)]
    pub network_rule_collections: Vec<NetworkRuleCollection>,
    #[serde(default)]
    pub nat_rule_collections: Vec<NatRuleCollection>,
}

// ============================================================================
// Firewall policy
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirewallPolicy {
    pub name: String,
    pub location: String,
    #[serde(default)]
    pub sku_tier: SkuTier,
    #[serde(default)]
    pub threat_intel_mode: ThreatIntelMode,
    #[serde(default)]
    pub base_policy_id: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Populated by the control plane
    #[serde(default)]
    pub rule_collection_groups: Vec<String>,
}

/// A rule inside a policy rule collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule_type", rename_all = "snake_case")]
pub enum PolicyRule {
    Application(ApplicationRule),
    Network(NetworkRule),
    Nat(NatRule),
}

impl Named for PolicyRule {
    fn name(&self) -> &str {
        match self {
            PolicyRule::Application(r) => &r.name,
            PolicyRule::Network(r) => &r.name,
            PolicyRule::Nat(r) => &r.name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyFilterRuleCollection {
    pub name: String,
    pub priority: i64,
    pub action: FilterAction,
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyNatRuleCollection {
    pub name: String,
    pub priority: i64,
    pub action: NatAction,
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
}

/// Element of a rule collection group's single `rule_collections` array
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule_collection_type", rename_all = "snake_case")]
pub enum PolicyRuleCollection {
    Filter(PolicyFilterRuleCollection),
    Nat(PolicyNatRuleCollection),
}

impl PolicyRuleCollection {
    pub fn priority(&self) -> i64 {
        match self {
            PolicyRuleCollection::Filter(c) => c.priority,
            PolicyRuleCollection::Nat(c) => c.priority,
        }
    }

    pub fn rules(&self) -> &[PolicyRule] {
        match self {
            PolicyRuleCollection::Filter(c) => &c.rules,
            PolicyRuleCollection::Nat(c) => &c.rules,
        }
    }

    /// Filter collections carry application or network rules; NAT
    /// collections carry only NAT rules with a single translation target.
    pub fn check_rules(&self) -> Result<(), String> {
        match self {
            PolicyRuleCollection::Filter(c) => {
                if let Some(rule) = c.rules.iter().find(|r| matches!(r, PolicyRule::Nat(_))) {
                    return Err(format!(
                        "filter rule collection {} cannot contain NAT rule {}",
                        c.name,
                        rule.name()
                    ));
                }
                Ok(())
            }
            PolicyRuleCollection::Nat(c) => {
                for rule in &c.rules {
                    match rule {
                        PolicyRule::Nat(nat) => nat.check_translation()?,
                        other => {
                            return Err(format!(
                                "NAT rule collection {} can only contain NAT rules, found {}",
                                c.name,
                                other.name()
                            ))
                        }
                    }
                }
                Ok(())
            }
        }
    }
}

impl Named for PolicyRuleCollection {
    fn name(&self) -> &str {
        match self {
            PolicyRuleCollection::Filter(c) => &c.name,
            PolicyRuleCollection::Nat(c) => &c.name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleCollectionGroup {
    pub name: String,
    pub priority: i64,
    #[serde(default)]
    pub rule_collections: Vec<PolicyRuleCollection>,
}

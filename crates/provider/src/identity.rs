//! Resource and child identities
//!
//! A parent is addressed by an ARM-style path:
//! `/subscriptions/{sub}/resourceGroups/{rg}/providers/{namespace}/{type}/{name}[/{type}/{name}...]`.
//! A child element of one of its collections appends `/{collection}/{child}`.
//! Neither segment type nor name may be empty or contain `/`.

use std::fmt;
use std::str::FromStr;

use ruleplane_common::{Error, Result};

pub const NETWORK_NAMESPACE: &str = "Microsoft.Network";
pub const AZURE_FIREWALLS: &str = "azureFirewalls";
pub const FIREWALL_POLICIES: &str = "firewallPolicies";
pub const RULE_COLLECTION_GROUPS: &str = "ruleCollectionGroups";
pub const VIRTUAL_NETWORKS: &str = "virtualNetworks";
pub const SUBNETS: &str = "subnets";

/// Identity of a remote resource
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceId {
    subscription_id: String,
    resource_group: String,
    namespace: String,
    /// (type, name) pairs, outermost first; never empty
    segments: Vec<(String, String)>,
}

fn check_segment(input: &str, what: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::malformed(input, format!("{} segment is empty", what)));
    }
    if value.contains('/') {
        return Err(Error::malformed(input, format!("{} segment {:?} contains '/'", what, value)));
    }
    Ok(())
}

impl ResourceId {
    pub fn new(
        subscription_id: impl Into<String>,
        resource_group: impl Into<String>,
        namespace: impl Into<String>,
        resource_type: impl Into<String>,
        name: impl Into<String>,
    ) -> Result<Self> {
        let id = Self {
            subscription_id: subscription_id.into(),
            resource_group: resource_group.into(),
            namespace: namespace.into(),
            segments: vec![(resource_type.into(), name.into())],
        };
        id.validate()?;
        Ok(id)
    }

    pub fn firewall(subscription_id: &str, resource_group: &str, name: &str) -> Result<Self> {
        Self::new(subscription_id, resource_group, NETWORK_NAMESPACE, AZURE_FIREWALLS, name)
    }

    pub fn firewall_policy(subscription_id: &str, resource_group: &str, name: &str) -> Result<Self> {
        Self::new(subscription_id, resource_group, NETWORK_NAMESPACE, FIREWALL_POLICIES, name)
    }

    /// Identity of a resource nested below this one
    pub fn nested(&self, resource_type: impl Into<String>, name: impl Into<String>) -> Result<Self> {
        let mut id = self.clone();
        id.segments.push((resource_type.into(), name.into()));
        id.validate()?;
        Ok(id)
    }

    fn validate(&self) -> Result<()> {
        let rendered = self.to_string();
        check_segment(&rendered, "subscription", &self.subscription_id)?;
        check_segment(&rendered, "resource group", &self.resource_group)?;
        check_segment(&rendered, "provider namespace", &self.namespace)?;
        for (resource_type, name) in &self.segments {
            check_segment(&rendered, "resource type", resource_type)?;
            check_segment(&rendered, "resource name", name)?;
        }
        Ok(())
    }

    pub fn subscription_id(&self) -> &str {
        &self.subscription_id
    }

    pub fn resource_group(&self) -> &str {
        &self.resource_group
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Type of the innermost resource
    pub fn resource_type(&self) -> &str {
        self.segments.last().map_or("", |(kind, _)| kind.as_str())
    }

    /// Name of the innermost resource
    pub fn name(&self) -> &str {
        self.segments.last().map_or("", |(_, name)| name.as_str())
    }

    /// The enclosing resource, if this one is nested
    pub fn parent(&self) -> Option<ResourceId> {
        if self.segments.len() < 2 {
            return None;
        }
        let mut parent = self.clone();
        parent.segments.pop();
        Some(parent)
    }

    /// Whether the innermost resource is of `resource_type` (case-insensitive)
    pub fn is_type(&self, resource_type: &str) -> bool {
        self.resource_type().eq_ignore_ascii_case(resource_type)
    }

    /// Parse and require the innermost resource type
    pub fn parse_typed(input: &str, resource_type: &str) -> Result<Self> {
        let id: ResourceId = input.parse()?;
        if !id.is_type(resource_type) {
            return Err(Error::malformed(
                input,
                format!("expected a {} id, got {}", resource_type, id.resource_type()),
            ));
        }
        Ok(id)
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "/subscriptions/{}/resourceGroups/{}/providers/{}",
            self.subscription_id, self.resource_group, self.namespace
        )?;
        for (resource_type, name) in &self.segments {
            write!(f, "/{}/{}", resource_type, name)?;
        }
        Ok(())
    }
}

impl FromStr for ResourceId {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self> {
        let rest = input
            .strip_prefix('/')
            .ok_or_else(|| Error::malformed(input, "must start with '/'"))?;
        let parts: Vec<&str> = rest.split('/').collect();

        if parts.iter().any(|p| p.is_empty()) {
            return Err(Error::malformed(input, "contains an empty segment"));
        }
        if parts.len() < 8 || parts.len() % 2 != 0 {
            return Err(Error::malformed(
                input,
                "expected /subscriptions/{sub}/resourceGroups/{rg}/providers/{namespace} followed by type/name pairs",
            ));
        }

        let expect_key = |index: usize, key: &str| -> Result<()> {
            if parts[index].eq_ignore_ascii_case(key) {
                Ok(())
            } else {
                Err(Error::malformed(
                    input,
                    format!("expected segment {:?} but found {:?}", key, parts[index]),
                ))
            }
        };
        expect_key(0, "subscriptions")?;
        expect_key(2, "resourceGroups")?;
        expect_key(4, "providers")?;

        let segments = parts[6..]
            .chunks(2)
            .map(|pair| (pair[0].to_string(), pair[1].to_string()))
            .collect();

        Ok(Self {
            subscription_id: parts[1].to_string(),
            resource_group: parts[3].to_string(),
            namespace: parts[5].to_string(),
            segments,
        })
    }
}

/// Identity of one element inside a parent's named collection
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChildId {
    parent: ResourceId,
    collection: String,
    name: String,
}

impl ChildId {
    pub fn new(parent: ResourceId, collection: impl Into<String>, name: impl Into<String>) -> Result<Self> {
        let id = Self {
            parent,
            collection: collection.into(),
            name: name.into(),
        };
        let rendered = id.to_string();
        check_segment(&rendered, "collection", &id.collection)?;
        check_segment(&rendered, "child name", &id.name)?;
        Ok(id)
    }

    pub fn parent(&self) -> &ResourceId {
        &self.parent
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parse and require a specific collection kind (case-insensitive)
    pub fn parse_in(input: &str, collection: &str) -> Result<Self> {
        let id: ChildId = input.parse()?;
        if !id.collection.eq_ignore_ascii_case(collection) {
            return Err(Error::malformed(
                input,
                format!("expected a {} element, got {}", collection, id.collection),
            ));
        }
        Ok(id)
    }
}

impl fmt::Display for ChildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.parent, self.collection, self.name)
    }
}

impl FromStr for ChildId {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self> {
        let mut full: ResourceId = input.parse()?;
        let (collection, name) = match full.segments.pop() {
            Some(last) if !full.segments.is_empty() => last,
            _ => {
                return Err(Error::malformed(
                    input,
                    "expected a parent resource followed by {collection}/{name}",
                ))
            }
        };
        Ok(Self {
            parent: full,
            collection,
            name,
        })
    }
}

/// Render the persisted identity of a child element
pub fn format_child_id(parent: &ResourceId, collection: &str, name: &str) -> Result<String> {
    Ok(ChildId::new(parent.clone(), collection, name)?.to_string())
}

/// Split a persisted child identity back into its parts
pub fn parse_child_id(input: &str) -> Result<(ResourceId, String, String)> {
    let id: ChildId = input.parse()?;
    Ok((id.parent, id.collection, id.name))
}

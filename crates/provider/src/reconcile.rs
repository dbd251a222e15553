//! Collection reconciliation
//!
//! Pure transformations of a freshly fetched parent document: upsert one
//! named element into a shared collection, or sweep it out. Every element
//! other than the target is carried over untouched and in order.

use std::fmt::{self, Debug};

use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use ruleplane_common::{Error, Named, Result};

use crate::client::ParentDocument;
use crate::identity::{ChildId, ResourceId};
use crate::locks::LockKey;

/// A kind of element living in a shared collection of a parent document
pub trait ChildKind: Send + Sync + 'static {
    type Parent: ParentDocument;
    type Element: Named + Clone + PartialEq + Debug + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Handler type name, e.g. `ruleplane_firewall_nat_rule_collection`
    const TYPE_NAME: &'static str;
    /// Collection segment used in child identities
    const COLLECTION: &'static str;
    /// State attribute referencing the parent
    const PARENT_ATTR: &'static str;
    /// Resource type the parent id must have
    const PARENT_TYPE: &'static str;

    fn collection(parent: &Self::Parent) -> &[Self::Element];

    fn collection_mut(parent: &mut Self::Parent) -> &mut Vec<Self::Element>;

    /// Lock serializing every writer of this parent
    fn lock_key(parent: &ResourceId) -> LockKey;

    /// Further keys taken after the primary one
    fn secondary_lock_keys(_parent: &ResourceId) -> Vec<LockKey> {
        Vec::new()
    }

    /// Local checks run before any lock is taken
    fn validate(_element: &Self::Element) -> Result<()> {
        Ok(())
    }
}

/// Result of an upsert
pub struct Upserted<K: ChildKind> {
    pub parent: K::Parent,
    pub child_id: ChildId,
    /// Index of the element in the rewritten collection
    pub position: usize,
    /// Whether an existing element was replaced
    pub replaced: bool,
}

impl<K: ChildKind> fmt::Debug for Upserted<K>
where
    K::Parent: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Upserted")
            .field("parent", &self.parent)
            .field("child_id", &self.child_id)
            .field("position", &self.position)
            .field("replaced", &self.replaced)
            .finish()
    }
}

/// Position of the element called `name`
pub fn position<K: ChildKind>(parent: &K::Parent, name: &str) -> Option<usize> {
    K::collection(parent).iter().position(|e| e.name() == name)
}

/// Find the element called `name`
pub fn find<'a, K: ChildKind>(parent: &'a K::Parent, name: &str) -> Option<&'a K::Element> {
    K::collection(parent).iter().find(|e| e.name() == name)
}

/// Insert or replace `desired` in the parent's collection.
///
/// With `is_new`, an element of the same name already being present is an
/// import collision and nothing is changed. Without it, the element must
/// already be present.
pub fn reconcile_upsert<K: ChildKind>(
    mut parent: K::Parent,
    parent_id: &ResourceId,
    desired: K::Element,
    is_new: bool,
) -> Result<Upserted<K>> {
    let name = desired.name().to_string();
    let child_id = ChildId::new(parent_id.clone(), K::COLLECTION, &name)?;
    let existing = position::<K>(&parent, &name);

    let (position, replaced) = match (existing, is_new) {
        (Some(_), true) => {
            return Err(Error::already_exists(K::TYPE_NAME, child_id.to_string()));
        }
        (None, false) => {
            return Err(Error::not_found(K::TYPE_NAME, child_id.to_string()));
        }
        (Some(index), false) => {
            K::collection_mut(&mut parent)[index] = desired;
            (index, true)
        }
        (None, true) => {
            let elements = K::collection_mut(&mut parent);
            elements.push(desired);
            (elements.len() - 1, false)
        }
    };

    debug!(
        "{} {} at position {} of {}",
        if replaced { "Replaced" } else { "Appended" },
        name,
        position,
        parent_id
    );

    Ok(Upserted {
        parent,
        child_id,
        position,
        replaced,
    })
}

/// Remove every element called `name`; reports whether any was present
pub fn reconcile_delete<K: ChildKind>(mut parent: K::Parent, name: &str) -> (K::Parent, bool) {
    let elements = K::collection_mut(&mut parent);
    let before = elements.len();
    elements.retain(|e| e.name() != name);
    let found = elements.len() != before;
    (parent, found)
}

//! Ruleplane Provider
//!
//! Resource handlers for firewalls, firewall policies and the rule
//! collections that live inside them. Rule collections are managed one by
//! one while the control plane only stores whole parent documents, so every
//! change is a locked read-modify-write of the parent.

pub mod client;
pub mod config;
pub mod convergence;
pub mod identity;
pub mod local;
pub mod locks;
pub mod provider;
pub mod reconcile;
pub mod resources;
pub mod state;

pub use client::{ControlPlane, ParentDocument};
pub use identity::{format_child_id, parse_child_id, ChildId, ResourceId};
pub use local::LocalControlPlane;
pub use locks::{LockKey, NamedLocks};
pub use provider::RuleplaneProvider;

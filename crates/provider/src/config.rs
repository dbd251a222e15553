//! Provider configuration

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use ruleplane_common::{Error, Result};

/// Provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Subscription new parents are created in
    pub subscription_id: String,

    /// Directory holding the local control plane database
    pub store_path: PathBuf,

    /// Delay between convergence polls
    pub poll_interval_ms: u64,

    /// Polls before a local operation settles
    pub settle_polls: u32,

    /// Per resource type timeout overrides
    pub timeouts: HashMap<String, Timeouts>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            subscription_id: "00000000-0000-0000-0000-000000000000".to_string(),
            store_path: ruleplane_common::default_store_path(),
            poll_interval_ms: 10_000,
            settle_polls: 1,
            timeouts: HashMap::new(),
        }
    }
}

impl ProviderConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)
                .map_err(|e| Error::InvalidConfig(format!("{}: {}", path.display(), e)))?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn db_path(&self) -> PathBuf {
        self.store_path.join("control-plane.db")
    }

    /// Timeouts for a resource type, falling back to its defaults
    pub fn timeouts_for(&self, type_name: &str) -> Timeouts {
        self.timeouts
            .get(type_name)
            .copied()
            .unwrap_or_else(|| Timeouts::default_for(type_name))
    }
}

/// Operation being timed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Create,
    Read,
    Update,
    Delete,
}

/// Timeout budget per operation, in seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub create: u64,
    pub read: u64,
    pub update: u64,
    pub delete: u64,
}

/// Ceiling on any single operation budget
pub const MAX_BUDGET: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

impl Default for Timeouts {
    fn default() -> Self {
        Self::minutes(30, 5, 30, 30)
    }
}

impl Timeouts {
    pub const fn minutes(create: u64, read: u64, update: u64, delete: u64) -> Self {
        Self {
            create: create * 60,
            read: read * 60,
            update: update * 60,
            delete: delete * 60,
        }
    }

    pub fn default_for(type_name: &str) -> Self {
        match type_name {
            "ruleplane_firewall" => Self::minutes(90, 5, 90, 90),
            _ => Self::default(),
        }
    }

    pub fn budget(&self, op: Operation) -> Duration {
        let secs = match op {
            Operation::Create => self.create,
            Operation::Read => self.read,
            Operation::Update => self.update,
            Operation::Delete => self.delete,
        };
        Duration::from_secs(secs).min(MAX_BUDGET)
    }

    /// Deadline for an operation starting now
    pub fn deadline(&self, op: Operation) -> Instant {
        let now = Instant::now();
        now.checked_add(self.budget(op)).unwrap_or(now)
    }
}

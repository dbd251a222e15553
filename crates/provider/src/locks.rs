//! Process-wide named locks
//!
//! Every read-modify-write of a shared parent document runs while holding the
//! lock named after that parent. Locks are created on first use and never
//! removed; the key space is one entry per managed parent.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{debug, trace};

use ruleplane_common::{Error, Result};

static SHARED: Lazy<Arc<NamedLocks>> = Lazy::new(|| Arc::new(NamedLocks::new()));

/// Lock name: the resource type tag of the parent plus its logical name
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LockKey {
    kind: String,
    name: String,
}

impl LockKey {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.kind, self.name)
    }
}

/// Registry of named mutexes
#[derive(Default)]
pub struct NamedLocks {
    locks: DashMap<LockKey, Arc<Mutex<()>>>,
}

impl NamedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry shared by every handler in this process
    pub fn shared() -> Arc<NamedLocks> {
        SHARED.clone()
    }

    fn slot(&self, key: &LockKey) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }

    /// Block until `key` is free or `deadline` passes
    pub async fn acquire(&self, key: &LockKey, deadline: Instant) -> Result<ScopedLock> {
        let slot = self.slot(key);
        let started = Instant::now();

        trace!("Waiting for lock {}", key);
        match tokio::time::timeout_at(deadline, slot.lock_owned()).await {
            Ok(guard) => {
                debug!("Acquired lock {} after {:?}", key, started.elapsed());
                Ok(ScopedLock {
                    key: key.clone(),
                    acquired_at: Instant::now(),
                    _guard: guard,
                })
            }
            Err(_) => Err(Error::Timeout {
                waiting_on: format!("lock {}", key),
                seconds: started.elapsed().as_secs(),
            }),
        }
    }

    /// Acquire the primary key, then the secondary keys in sorted order.
    ///
    /// Every caller goes through this ordering, so two operations sharing any
    /// subset of keys can never wait on each other in a cycle.
    pub async fn acquire_all(
        &self,
        primary: &LockKey,
        secondary: &[LockKey],
        deadline: Instant,
    ) -> Result<LockSet> {
        let mut rest: Vec<&LockKey> = secondary.iter().filter(|k| *k != primary).collect();
        rest.sort();
        rest.dedup();

        let mut held = Vec::with_capacity(rest.len() + 1);
        held.push(self.acquire(primary, deadline).await?);
        for key in rest {
            // on error the locks taken so far drop here, newest first
            held.push(self.acquire(key, deadline).await?);
        }

        Ok(LockSet { held })
    }

    /// Number of distinct keys ever locked
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Held lock; released on drop
pub struct ScopedLock {
    key: LockKey,
    acquired_at: Instant,
    _guard: OwnedMutexGuard<()>,
}

impl ScopedLock {
    pub fn key(&self) -> &LockKey {
        &self.key
    }
}

impl Drop for ScopedLock {
    fn drop(&mut self) {
        debug!("Released lock {} after {:?}", self.key, self.acquired_at.elapsed());
    }
}

/// Several held locks, released in reverse acquisition order
pub struct LockSet {
    held: Vec<ScopedLock>,
}

impl LockSet {
    pub fn keys(&self) -> impl Iterator<Item = &LockKey> {
        self.held.iter().map(|l| l.key())
    }
}

impl Drop for LockSet {
    fn drop(&mut self) {
        while let Some(lock) = self.held.pop() {
            drop(lock);
        }
    }
}

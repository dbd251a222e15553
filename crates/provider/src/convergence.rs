//! Write-back and convergence waiting
//!
//! A submitted write is only done once the control plane reports a terminal
//! status. Waiting happens while the caller still holds the parent lock.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use ruleplane_common::{Error, Result};

use crate::client::{self, ControlPlane, OperationHandle, OperationStatus, ParentDocument};
use crate::identity::ResourceId;

/// What the write-back is meant to achieve
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    /// The element must exist afterwards
    Upsert,
    /// The element must be gone afterwards
    Delete,
}

fn timed_out(operation: &OperationHandle, started: Instant) -> Error {
    Error::ConvergenceTimeout {
        operation: format!("{} ({})", operation.target, operation.id),
        seconds: started.elapsed().as_secs(),
    }
}

/// Poll `operation` until it settles or `deadline` passes
pub async fn wait(
    client: &dyn ControlPlane,
    operation: &OperationHandle,
    intent: Intent,
    deadline: Instant,
    poll_interval: Duration,
) -> Result<()> {
    let started = Instant::now();
    let mut polls = 0u32;

    loop {
        let status = match tokio::time::timeout_at(deadline, client.poll(operation)).await {
            Ok(status) => status?,
            Err(_) => return Err(timed_out(operation, started)),
        };
        polls += 1;

        match status {
            OperationStatus::Succeeded => {
                info!(
                    "{} converged after {} polls in {:?}",
                    operation.target,
                    polls,
                    started.elapsed()
                );
                return Ok(());
            }
            OperationStatus::Failed(message) => {
                warn!("Operation {} on {} failed: {}", operation.id, operation.target, message);
                return Err(Error::OperationFailed {
                    operation: operation.target.to_string(),
                    message,
                });
            }
            OperationStatus::NotFound => {
                return match intent {
                    Intent::Delete => {
                        debug!("{} already gone", operation.target);
                        Ok(())
                    }
                    Intent::Upsert => Err(Error::not_found(
                        operation.target.resource_type(),
                        operation.target.to_string(),
                    )),
                };
            }
            OperationStatus::InProgress => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(timed_out(operation, started));
                }
                let next = now.checked_add(poll_interval).map_or(deadline, |next| next.min(deadline));
                tokio::time::sleep_until(next).await;
            }
        }
    }
}

/// Submit the full parent document and wait for it to converge
pub async fn commit<P: ParentDocument>(
    client: &dyn ControlPlane,
    id: &ResourceId,
    document: &P,
    intent: Intent,
    deadline: Instant,
    poll_interval: Duration,
) -> Result<()> {
    let operation = client::submit_write(client, id, document, deadline).await?;
    debug!("Submitted write of {} as operation {}", id, operation.id);
    wait(client, &operation, intent, deadline, poll_interval).await
}

/// Submit deletion of the whole document and wait for it to settle
pub async fn commit_delete(
    client: &dyn ControlPlane,
    id: &ResourceId,
    deadline: Instant,
    poll_interval: Duration,
) -> Result<()> {
    let operation = client::submit_delete(client, id, deadline).await?;
    debug!("Submitted delete of {} as operation {}", id, operation.id);
    wait(client, &operation, Intent::Delete, deadline, poll_interval).await
}

//! Sequential dimmer dispatch.
//!
//! Loads are walked in configuration order and at most one dimmer request is
//! in flight at any time: the next load is only started once the previous
//! request answered, failed or timed out. A command identical to the last one
//! the dimmer accepted is not sent again.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use crate::domain::{DimmerClient, DimmerCommand, DispatchError, Load, RpcOutcome};

/// Per-cycle dispatch tally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub sent: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl DispatchReport {
    pub fn attempted(&self) -> usize {
        self.sent + self.skipped + self.failed
    }
}

pub struct DispatchSequencer {
    client: Arc<dyn DimmerClient>,
    timeout: Duration,
    transition_seconds: f64,
}

impl DispatchSequencer {
    pub fn new(
        client: Arc<dyn DimmerClient>,
        timeout: Duration,
        transition_seconds: f64,
    ) -> Self {
        Self {
            client,
            timeout,
            transition_seconds,
        }
    }

    /// The command a load's current relay decision translates to.
    pub fn command_for(&self, load: &Load) -> DimmerCommand {
        DimmerCommand::new(
            load.spec.address.clone(),
            load.dispatch.relay_on,
            load.dispatch.brightness,
            self.transition_seconds,
        )
    }

    /// Send every load's command in order. Failures are recorded on the load
    /// and never stop the sequence.
    pub async fn dispatch(&self, loads: &mut [Load]) -> DispatchReport {
        let mut report = DispatchReport::default();

        for load in loads.iter_mut() {
            if let Some(reason) = &load.fault {
                debug!(load = %load.spec.name, %reason, "not dispatched, allocation fault");
                load.dispatch.outcome = RpcOutcome::Failed;
                load.dispatch.last_sent = None;
                report.failed += 1;
                continue;
            }

            let command = self.command_for(load);
            if load.dispatch.last_sent.as_ref() == Some(&command) {
                debug!(load = %load.spec.name, %command, "unchanged, skipped");
                load.dispatch.outcome = RpcOutcome::Skipped;
                report.skipped += 1;
                continue;
            }

            load.dispatch.outcome = RpcOutcome::Pending;
            match self.send(&command).await {
                Ok(()) => {
                    debug!(load = %load.spec.name, %command, "dimmer updated");
                    load.dispatch.outcome = RpcOutcome::Success;
                    load.dispatch.last_sent = Some(command);
                    report.sent += 1;
                }
                Err(e) => {
                    warn!(load = %load.spec.name, error = %e, "dimmer command failed");
                    load.dispatch.outcome = RpcOutcome::Failed;
                    // forget it so the same command is retried next cycle
                    load.dispatch.last_sent = None;
                    report.failed += 1;
                }
            }
        }

        report
    }

    async fn send(&self, command: &DimmerCommand) -> Result<(), DispatchError> {
        match tokio::time::timeout(self.timeout, self.client.send(command)).await {
            Ok(result) => result,
            Err(_) => Err(DispatchError::Timeout(self.timeout)),
        }
    }
}

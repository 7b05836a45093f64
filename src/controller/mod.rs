pub mod admin;
pub mod allocator;
pub mod dispatch;
pub mod firing;
pub mod overrides;
pub mod pid;
pub mod relay;
pub mod state;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::domain::{BypassSwitch, DimmerClient, GridMeter, GridReading, TelemetryError};
use crate::hardware::feed::FeedPublisher;
use crate::telemetry::VerbosityHandle;

pub use admin::AdminCommand;
pub use allocator::LoadAllocator;
pub use dispatch::{DispatchReport, DispatchSequencer};
pub use firing::FiringDelayTable;
pub use overrides::{OverrideRegistry, OverrideSource};
pub use pid::PidController;
pub use relay::RelayHysteresis;
pub use state::{ControllerState, StatusSnapshot};

/// Batch of administrative commands applied between two cycles. The reply
/// carries the snapshot taken right after they were applied.
pub struct AdminRequest {
    pub commands: Vec<AdminCommand>,
    pub reply: oneshot::Sender<StatusSnapshot>,
}

/// Handles shared with the HTTP layer.
#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<Config>,
    pub admin: mpsc::Sender<AdminRequest>,
    pub status: watch::Receiver<StatusSnapshot>,
    /// Present when the grid source is the push feed
    pub feed: Option<FeedPublisher>,
}

impl AppState {
    /// Apply commands on the control loop and wait for the resulting status.
    pub async fn submit(&self, commands: Vec<AdminCommand>) -> Result<StatusSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.admin
            .send(AdminRequest { commands, reply })
            .await
            .context("control loop is not running")?;
        rx.await.context("control loop dropped the request")
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.status.borrow().clone()
    }
}

/// Devices the loop talks to.
#[derive(Clone)]
pub struct Devices {
    pub meter: Arc<dyn GridMeter>,
    pub dimmer: Arc<dyn DimmerClient>,
    pub bypass_switch: Option<Arc<dyn BypassSwitch>>,
    pub override_source: Option<Arc<dyn OverrideSource>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed(DispatchReport),
    TelemetryFailed,
}

pub struct ControlLoop {
    state: ControllerState,
    devices: Devices,
    overrides: OverrideRegistry,
    allocator: LoadAllocator,
    relay: RelayHysteresis,
    sequencer: DispatchSequencer,
    telemetry_timeout: Duration,
    verbosity: Option<VerbosityHandle>,
    status_tx: watch::Sender<StatusSnapshot>,
}

impl ControlLoop {
    pub fn new(cfg: Arc<Config>, devices: Devices) -> Result<Self> {
        let load_names: Vec<&str> = cfg.enabled_loads().map(|l| l.name.as_str()).collect();
        let overrides = OverrideRegistry::from_config(&cfg.overrides, &load_names)
            .map_err(|e| anyhow::anyhow!("override {}: {e}", e.path()))?;
        for disabled in cfg.loads.iter().filter(|l| !l.is_enabled()) {
            info!(load = %disabled.name, "resistance is 0, load disabled");
        }

        let table = FiringDelayTable::new(cfg.grid.semi_period_us);
        let sequencer = DispatchSequencer::new(
            devices.dimmer.clone(),
            cfg.control.dispatch_timeout(),
            cfg.control.transition_seconds,
        );
        let state = ControllerState::new(cfg.clone());
        let (status_tx, _) = watch::channel(state.snapshot());

        Ok(Self {
            overrides,
            allocator: LoadAllocator::new(table),
            relay: RelayHysteresis::new(cfg.bypass.mode, table),
            sequencer,
            telemetry_timeout: cfg.grid.request_timeout(),
            verbosity: None,
            status_tx,
            devices,
            state,
        })
    }

    pub fn with_verbosity(mut self, handle: VerbosityHandle) -> Self {
        self.verbosity = Some(handle);
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.status_tx.subscribe()
    }

    pub fn state(&self) -> &ControllerState {
        &self.state
    }

    /// Run cycles on a fixed period and serve administrative requests in
    /// between, until every request sender is dropped.
    pub async fn run(mut self, period: Duration, mut admin_rx: mpsc::Receiver<AdminRequest>) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            period_ms = period.as_millis() as u64,
            loads = self.state.loads.len(),
            "control loop started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let started = Instant::now();
                    self.tick().await;
                    // ticks that came due while the cycle was running are skipped
                    let overrun = started.elapsed().as_nanos() / period.as_nanos().max(1);
                    if overrun > 0 {
                        self.state.stats.dropped_ticks += overrun as u64;
                        debug!(dropped = overrun as u64, "cycle overran its period");
                    }
                }
                request = admin_rx.recv() => match request {
                    Some(request) => self.handle_admin(request),
                    None => break,
                },
            }
        }
        info!("control loop stopped");
    }

    pub fn handle_admin(&mut self, request: AdminRequest) {
        for command in &request.commands {
            command.apply(&mut self.state);
            if let AdminCommand::Debug(level) = command {
                if let Some(verbosity) = &self.verbosity {
                    if let Err(e) = verbosity.set_level(*level) {
                        warn!(error = %e, "failed to change log level");
                    }
                }
            }
        }
        let snapshot = self.publish();
        // the caller may have given up waiting
        let _ = request.reply.send(snapshot);
    }

    /// One full control cycle. Cycles cannot overlap: `run` awaits each one
    /// before taking the next tick.
    pub async fn tick(&mut self) -> CycleOutcome {
        let outcome = self.cycle().await;
        self.publish();
        outcome
    }

    async fn cycle(&mut self) -> CycleOutcome {
        if let Some(source) = &self.devices.override_source {
            if !self.overrides.is_empty() {
                let failures = self.overrides.refresh(source.as_ref(), &mut self.state).await;
                self.state.stats.override_failures += failures.len() as u64;
            }
        }

        let reading = match self.read_grid().await {
            Ok(reading) => reading,
            Err(e) => {
                warn!(error = %e, "telemetry unavailable, cycle skipped");
                self.state.stats.telemetry_failures += 1;
                return CycleOutcome::TelemetryFailed;
            }
        };
        self.state.grid = Some(reading);

        let (gains, tuning) = self
            .state
            .schedule
            .select(reading.power_w, self.state.pid.setpoint());
        self.state.pid.set_tuning(tuning);
        self.state.active_gains = gains;
        let budget = self.state.pid.update(reading.power_w);
        let terms = self.state.pid.terms();
        info!(
            grid_w = reading.power_w,
            voltage_v = reading.voltage_v,
            %gains,
            p = terms.proportional,
            i = terms.integral,
            d = terms.derivative,
            output_w = budget,
            "pid updated"
        );

        self.poll_bypass_switch().await;

        self.allocator
            .allocate(budget, reading.voltage_v, &mut self.state.loads);
        let now = Instant::now();
        for load in &mut self.state.loads {
            self.relay.decide(load, now);
        }
        let report = self.sequencer.dispatch(&mut self.state.loads).await;

        let stats = &mut self.state.stats;
        stats.cycles += 1;
        stats.last_cycle_at = Some(chrono::Utc::now());
        stats.last_dispatch = report;
        CycleOutcome::Completed(report)
    }

    async fn read_grid(&self) -> Result<GridReading, TelemetryError> {
        let reading = tokio::time::timeout(self.telemetry_timeout, self.devices.meter.read())
            .await
            .map_err(|_| TelemetryError::Timeout(self.telemetry_timeout))??;
        reading.checked()
    }

    /// Apply the switch position to every load: ON holds them all in bypass,
    /// OFF releases any bypass, including one set from the admin endpoint.
    async fn poll_bypass_switch(&mut self) {
        let Some(switch) = &self.devices.bypass_switch else {
            return;
        };
        let on = match switch.is_on().await {
            Ok(on) => on,
            Err(e) => {
                warn!(error = %e, "bypass switch unreadable, keeping previous state");
                return;
            }
        };
        if self.state.bypass_switch != Some(on) {
            info!(switch_on = on, "bypass switch changed");
        }
        self.state.bypass_switch = Some(on);

        for load in &mut self.state.loads {
            let flipped = if on {
                load.engage_bypass()
            } else {
                load.release_bypass()
            };
            if flipped {
                debug!(load = %load.spec.name, bypass = on, "bypass applied from switch");
            }
        }
    }

    fn publish(&self) -> StatusSnapshot {
        let snapshot = self.state.snapshot();
        self.status_tx.send_replace(snapshot.clone());
        snapshot
    }
}

/// Start the control loop task. Returns the handles the HTTP layer needs.
pub fn spawn_controller_tasks(
    cfg: Arc<Config>,
    devices: Devices,
    feed: Option<FeedPublisher>,
    verbosity: Option<VerbosityHandle>,
) -> Result<AppState> {
    let mut control = ControlLoop::new(cfg.clone(), devices)?;
    if let Some(handle) = verbosity {
        control = control.with_verbosity(handle);
    }
    let status = control.subscribe();
    let (admin_tx, admin_rx) = mpsc::channel(16);
    let period = cfg.control.tick();

    tokio::spawn(control.run(period, admin_rx));

    Ok(AppState {
        cfg,
        admin: admin_tx,
        status,
        feed,
    })
}

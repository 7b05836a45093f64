//! Full control cycles against in-memory devices.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use figment::providers::{Format, Toml};
use figment::Figment;
use power_diverter::config::Config;
use power_diverter::controller::overrides::{OverrideSource, OverrideValue, SourceId};
use power_diverter::controller::{AdminCommand, AdminRequest, ControlLoop, CycleOutcome, Devices};
use power_diverter::domain::{
    BypassSwitch, DimmerClient, DimmerCommand, DispatchError, GridMeter, GridReading, LoadMode,
    Resume, RpcOutcome, SwitchError, TelemetryError,
};
use power_diverter::hardware::{feed_channel, FeedChannel};
use tokio::sync::oneshot;

const CONFIG: &str = r#"
    [server]
    host = "127.0.0.1"
    port = 0

    [grid]
    source = "feed"

    [bypass]
    mode = "api"

    [pid]
    setpoint = -100.0

    [pid.high]
    kp = 0.2
    ki = 0.4
    kd = 0.02
    out_min = -300.0
    out_max = 3000.0

    [[loads]]
    name = "boiler"
    address = "10.0.0.30"
    resistance = 85.0
    use_phase_lut = false

    [[loads]]
    name = "pool"
    address = "10.0.0.31"
    resistance = 40.0
    use_phase_lut = false
"#;

fn config(extra: &str) -> Arc<Config> {
    let toml = format!("{CONFIG}\n{extra}");
    Arc::new(Config::from_figment(Figment::new().merge(Toml::string(&toml))).unwrap())
}

struct Meter(Mutex<GridReading>);

impl Meter {
    fn set(&self, power_w: f64) {
        self.0.lock().unwrap().power_w = power_w;
    }
}

#[async_trait]
impl GridMeter for Meter {
    async fn read(&self) -> Result<GridReading, TelemetryError> {
        Ok(*self.0.lock().unwrap())
    }
}

#[derive(Default)]
struct Dimmers {
    sent: Mutex<Vec<DimmerCommand>>,
    failing: Mutex<Vec<String>>,
}

impl Dimmers {
    fn take(&self) -> Vec<DimmerCommand> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }
}

#[async_trait]
impl DimmerClient for Dimmers {
    async fn send(&self, command: &DimmerCommand) -> Result<(), DispatchError> {
        self.sent.lock().unwrap().push(command.clone());
        if self.failing.lock().unwrap().contains(&command.address) {
            return Err(DispatchError::Transport("connection reset".into()));
        }
        Ok(())
    }
}

fn control(cfg: Arc<Config>, power_w: f64) -> (ControlLoop, Arc<Meter>, Arc<Dimmers>) {
    let meter = Arc::new(Meter(Mutex::new(GridReading::new(230.0, power_w))));
    let dimmers = Arc::new(Dimmers::default());
    let devices = Devices {
        meter: meter.clone(),
        dimmer: dimmers.clone(),
        bypass_switch: None,
        override_source: None,
    };
    (ControlLoop::new(cfg, devices).unwrap(), meter, dimmers)
}

fn admin(control: &mut ControlLoop, query: &[(&str, &str)]) {
    let pairs: Vec<(String, String)> = query
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    control.handle_admin(AdminRequest {
        commands: AdminCommand::parse_query(&pairs),
        reply: oneshot::channel().0,
    });
}

#[tokio::test]
async fn test_first_cycle_budget_goes_to_first_load() {
    let (mut control, _, dimmers) = control(config(""), -800.0);
    let outcome = control.tick().await;
    assert!(matches!(outcome, CycleOutcome::Completed(r) if r.sent == 2));

    // first sample: only the integral acts, 0.4 * (-100 + 800) = 280 W
    let state = control.state();
    assert!((state.pid.output() - 280.0).abs() < 1e-9);
    let boiler = &state.loads[0];
    assert_eq!(boiler.metrics.power_to_divert_w, 280.0);
    assert!((boiler.metrics.max_power_w - 622.35).abs() < 0.01);
    assert_eq!(state.loads[1].metrics.power_to_divert_w, 0.0);

    let sent = dimmers.take();
    assert_eq!(sent[0], DimmerCommand::new("10.0.0.30", true, 45, 0.5));
    assert_eq!(sent[1], DimmerCommand::new("10.0.0.31", false, 0, 0.5));
}

#[tokio::test]
async fn test_overflow_spills_to_next_load() {
    let (mut control, _, _) = control(config(""), -20_000.0);
    control.tick().await;

    let state = control.state();
    assert_eq!(state.pid.output(), 3000.0);
    assert_eq!(state.loads[0].metrics.duty_cycle, 1.0);
    let pool = &state.loads[1].metrics;
    // 230^2 / 40 = 1322.5 W capacity, 3000 - 622 left for it
    assert_eq!(pool.duty_cycle, 1.0);
    assert_eq!(pool.power_to_divert_w, pool.max_power_w);
}

#[tokio::test]
async fn test_unchanged_commands_are_skipped() {
    let (mut control, _, dimmers) = control(config(""), -20_000.0);
    control.tick().await;
    dimmers.take();

    let outcome = control.tick().await;
    assert!(matches!(outcome, CycleOutcome::Completed(r) if r.skipped == 2 && r.sent == 0));
    assert!(dimmers.take().is_empty());
    assert!(control
        .state()
        .loads
        .iter()
        .all(|l| l.dispatch.outcome == RpcOutcome::Skipped));
}

#[tokio::test]
async fn test_failed_dimmer_is_retried_next_cycle() {
    let (mut control, _, dimmers) = control(config(""), -20_000.0);
    dimmers.failing.lock().unwrap().push("10.0.0.30".into());

    control.tick().await;
    assert_eq!(control.state().loads[0].dispatch.outcome, RpcOutcome::Failed);
    assert_eq!(control.state().loads[1].dispatch.outcome, RpcOutcome::Success);
    dimmers.take();

    dimmers.failing.lock().unwrap().clear();
    control.tick().await;
    let sent = dimmers.take();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].address, "10.0.0.30");
    assert_eq!(control.state().loads[0].dispatch.outcome, RpcOutcome::Success);
}

#[tokio::test]
async fn test_admin_bypass_and_standby() {
    let (mut control, _, dimmers) = control(config(""), 500.0);
    admin(&mut control, &[("boiler", "bypass"), ("pool", "standby")]);
    control.tick().await;

    let state = control.state();
    assert!(state.loads[0].mode.is_bypass());
    assert_eq!(state.loads[0].metrics.duty_cycle, 1.0);
    assert_eq!(state.loads[0].metrics.thdi, 0.0);
    assert_eq!(state.loads[1].mode, LoadMode::Standby);

    let sent = dimmers.take();
    assert_eq!(sent[0], DimmerCommand::new("10.0.0.30", true, 100, 0.5));
    assert_eq!(sent[1], DimmerCommand::new("10.0.0.31", false, 0, 0.5));
}

#[tokio::test]
async fn test_contactor_bypass_turns_dimmer_off() {
    let mut cfg = config("").as_ref().clone();
    cfg.bypass.mode = power_diverter::config::BypassMode::Contactor;
    let (mut control, _, dimmers) = control(Arc::new(cfg), 500.0);
    admin(&mut control, &[("all", "bypass")]);
    control.tick().await;

    let boiler = &control.state().loads[0];
    assert_eq!(boiler.metrics.power_to_divert_w, boiler.metrics.max_power_w);
    assert!(dimmers.take().iter().all(|c| !c.on && c.brightness == 0));
}

struct Switch(AtomicBool);

#[async_trait]
impl BypassSwitch for Switch {
    async fn is_on(&self) -> Result<bool, SwitchError> {
        Ok(self.0.load(Ordering::SeqCst))
    }
}

#[tokio::test]
async fn test_bypass_switch_applies_on_every_cycle() {
    let mut cfg = config("").as_ref().clone();
    cfg.bypass.mode = power_diverter::config::BypassMode::Virtual;
    let meter = Arc::new(Meter(Mutex::new(GridReading::new(230.0, 500.0))));
    let switch = Arc::new(Switch(AtomicBool::new(true)));
    let devices = Devices {
        meter,
        dimmer: Arc::new(Dimmers::default()),
        bypass_switch: Some(switch.clone()),
        override_source: None,
    };
    let mut control = ControlLoop::new(Arc::new(cfg), devices).unwrap();

    control.tick().await;
    admin(&mut control, &[("boiler", "auto")]);
    control.tick().await;
    let boiler = &control.state().loads[0];
    assert_eq!(boiler.mode, LoadMode::Bypass { resume: Resume::Auto });
    assert_eq!(boiler.dispatch.brightness, 100);

    switch.0.store(false, Ordering::SeqCst);
    control.tick().await;
    admin(&mut control, &[("pool", "bypass")]);
    control.tick().await;
    assert!(control.state().loads.iter().all(|l| l.mode == LoadMode::Auto));
    assert_eq!(control.state().bypass_switch, Some(false));
}

#[tokio::test]
async fn test_reset_returns_to_first_sample() {
    let (mut control, meter, _) = control(config(""), -800.0);
    control.tick().await;
    meter.set(-600.0);
    control.tick().await;
    admin(&mut control, &[("reset", "")]);
    assert!(control.state().pid.terms().previous_input.is_none());

    // identical to a fresh first cycle
    meter.set(-800.0);
    control.tick().await;
    assert!((control.state().pid.output() - 280.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_feed_source_waits_for_both_values() {
    let cfg = config("");
    let (publisher, meter) = feed_channel();
    let dimmers = Arc::new(Dimmers::default());
    let devices = Devices {
        meter: Arc::new(meter),
        dimmer: dimmers.clone(),
        bypass_switch: None,
        override_source: None,
    };
    let mut control = ControlLoop::new(cfg, devices).unwrap();

    publisher.publish(FeedChannel::Power, -800.0);
    assert_eq!(control.tick().await, CycleOutcome::TelemetryFailed);
    assert!(dimmers.take().is_empty());

    publisher.publish(FeedChannel::Voltage, 230.0);
    assert!(matches!(control.tick().await, CycleOutcome::Completed(_)));
    assert_eq!(control.state().stats.telemetry_failures, 1);
    assert_eq!(control.state().stats.cycles, 1);
}

struct Components(HashMap<u32, OverrideValue>);

#[async_trait]
impl OverrideSource for Components {
    async fn fetch(&self, source: SourceId) -> anyhow::Result<OverrideValue> {
        self.0
            .get(&source.id)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("{source} not found"))
    }
}

#[tokio::test]
async fn test_overrides_apply_before_the_cycle() {
    let cfg = config(
        r#"
        [overrides]
        address = "10.0.0.20"

        [overrides.bindings]
        "pid.setpoint" = "number:200"
        "loads.boiler.power_limit" = "number:201"
        "loads.pool.duty_max" = "number:202"
        "#,
    );
    let meter = Arc::new(Meter(Mutex::new(GridReading::new(230.0, -800.0))));
    let devices = Devices {
        meter,
        dimmer: Arc::new(Dimmers::default()),
        bypass_switch: None,
        override_source: Some(Arc::new(Components(HashMap::from([
            (200, OverrideValue::Number(0.0)),
            (201, OverrideValue::Number(100.0)),
        ])))),
    };
    let mut control = ControlLoop::new(cfg, devices).unwrap();
    control.tick().await;

    let state = control.state();
    assert_eq!(state.pid.setpoint(), 0.0);
    // 0.4 * 800 = 320 W, boiler capped at 100, pool takes the rest
    assert_eq!(state.loads[0].metrics.power_to_divert_w, 100.0);
    assert_eq!(state.loads[1].metrics.power_to_divert_w, 220.0);
    assert_eq!(state.loads[1].spec.duty_max, 100);
    assert_eq!(state.stats.override_failures, 1);
}

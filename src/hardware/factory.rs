use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::config::{Config, GridSource};
use crate::controller::overrides::OverrideSource;
use crate::controller::Devices;
use crate::domain::{BypassSwitch, GridMeter};
use crate::hardware::feed::{feed_channel, FeedPublisher};
use crate::hardware::shelly::{
    MeterKind, ShellyDimmer, ShellyMeter, ShellyRpc, ShellySwitch, ShellyVirtualComponents,
};

/// Builds the device clients a configuration asks for.
pub struct DeviceFactory<'a> {
    config: &'a Config,
}

impl<'a> DeviceFactory<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }

    /// Device set, plus the feed publisher when telemetry is pushed.
    pub fn build(&self) -> Result<(Devices, Option<FeedPublisher>)> {
        let cfg = self.config;
        let rpc = ShellyRpc::new(cfg.grid.request_timeout())?;

        let (meter, feed) = match cfg.grid.source {
            GridSource::Feed => {
                let (publisher, meter) = feed_channel();
                (Arc::new(meter) as Arc<dyn GridMeter>, Some(publisher))
            }
            source => {
                let address = cfg
                    .grid
                    .address
                    .clone()
                    .with_context(|| format!("grid source {source} requires grid.address"))?;
                let kind = if source == GridSource::ThreeEm {
                    MeterKind::ThreePhase
                } else {
                    MeterKind::SinglePhase
                };
                (
                    Arc::new(ShellyMeter::new(rpc.clone(), address, kind)) as Arc<dyn GridMeter>,
                    None,
                )
            }
        };
        info!(source = %cfg.grid.source, "grid meter ready");

        let bypass_switch = cfg.bypass.switch_target(&cfg.grid).map(|(address, id)| {
            info!(%address, id, mode = %cfg.bypass.mode, "polling bypass switch");
            Arc::new(ShellySwitch::new(rpc.clone(), address, id)) as Arc<dyn BypassSwitch>
        });

        let override_source = match (&cfg.overrides.address, cfg.overrides.bindings.is_empty()) {
            (_, true) => None,
            (Some(address), false) => Some(address.clone()),
            (None, false) => cfg.grid.address.clone(),
        }
        .map(|address| {
            Arc::new(ShellyVirtualComponents::new(rpc.clone(), address)) as Arc<dyn OverrideSource>
        });

        let devices = Devices {
            meter,
            dimmer: Arc::new(ShellyDimmer::new(rpc)),
            bypass_switch,
            override_source,
        };
        Ok((devices, feed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::state::tests::config_with_loads;
    use crate::config::BypassMode;

    #[test]
    fn test_feed_source_has_publisher_and_no_switch() {
        let cfg = config_with_loads(&["boiler"]);
        let (devices, feed) = DeviceFactory::new(&cfg).build().unwrap();
        assert!(feed.is_some());
        assert!(devices.bypass_switch.is_none());
        assert!(devices.override_source.is_none());
    }

    #[test]
    fn test_meter_source_polls_switch() {
        let mut cfg = config_with_loads(&["boiler"]);
        cfg.grid.source = GridSource::Em;
        cfg.grid.address = Some("192.168.1.20".into());
        let (devices, feed) = DeviceFactory::new(&cfg).build().unwrap();
        assert!(feed.is_none());
        assert!(devices.bypass_switch.is_some());

        cfg.bypass.mode = BypassMode::Api;
        let (devices, _) = DeviceFactory::new(&cfg).build().unwrap();
        assert!(devices.bypass_switch.is_none());
    }
}

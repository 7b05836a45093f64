pub mod factory;
pub mod feed;
pub mod shelly;

pub use factory::DeviceFactory;
pub use feed::{feed_channel, FeedChannel, FeedMeter, FeedPublisher};
pub use shelly::{ShellyDimmer, ShellyMeter, ShellyRpc, ShellySwitch, ShellyVirtualComponents};

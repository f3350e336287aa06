//! Channels: configured upstream endpoints and their live state

mod model;
mod registry;
mod source;
mod stats;

pub use model::{Channel, ChannelConfig, ChannelStatus};
pub use registry::{ChannelEntry, ChannelRegistry, ChannelSnapshot, FailureKind, Outcome};
pub use source::{ChannelSource, StaticChannelSource};
pub use stats::{ChannelStats, InFlightGuard};

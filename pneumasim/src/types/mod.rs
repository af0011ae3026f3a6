//! Value types shared by the controller and the registry.

mod channel;
mod progress;

pub use channel::{ChannelError, ChannelSet, ChannelTarget, ALL_CHANNELS, CHANNEL_COUNT};
pub use progress::{FnSink, Progress, ProgressSink, SinkClosed};

pub(crate) use progress::{report, Monotonic, Scaled};

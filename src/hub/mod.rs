//! Connection and channel state coordinator

mod coordinator;
mod messages;
mod stats;
mod types;

pub use coordinator::Hub;
pub use stats::Stats;
pub use types::{ChannelMessage, ClientHandle, ClientId, HubError};

//! Point-in-time hub statistics

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Snapshot of the coordinator state.
///
/// Built inside the coordinator loop, so the counts are consistent with each
/// other. The value is owned by the caller and never changes afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    /// Number of registered clients
    pub connections: usize,
    /// Subscriber count for every channel the hub has seen
    pub subscription_counts: HashMap<String, usize>,
}

impl Stats {
    /// Subscriber count of a channel, zero for unknown channels
    pub fn subscription_count(&self, channel: &str) -> usize {
        self.subscription_counts.get(channel).copied().unwrap_or(0)
    }

    pub fn total_subscriptions(&self) -> usize {
        self.subscription_counts.values().sum()
    }
}

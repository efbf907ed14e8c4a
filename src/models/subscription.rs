//! Subscription source records

use serde::{Deserialize, Serialize};

/// Detected wire format of a subscription payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionFormat {
    /// Scheme-prefixed share links, one per line.
    Links,
    /// Engine-native JSON with an `outbounds` array.
    Native,
    /// Base64 wrapper around one of the above.
    Base64,
    Unknown,
}

impl Default for SubscriptionFormat {
    fn default() -> Self {
        SubscriptionFormat::Unknown
    }
}

/// A remote list of outbounds tracked by provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionSource {
    pub id: String,
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub format: SubscriptionFormat,
    /// Epoch seconds of the last successful refresh.
    #[serde(default)]
    pub last_update: u64,
    /// Outbounds currently attributed to this subscription. Used for
    /// scoped cleanup on delete/refresh; survives process restarts.
    #[serde(default)]
    pub member_tags: Vec<String>,
    #[serde(default)]
    pub node_count: usize,
    #[serde(default)]
    pub auto_update: bool,
    /// Refresh interval in hours when `auto_update` is set.
    #[serde(default = "default_update_interval")]
    pub update_interval: u32,
}

fn default_update_interval() -> u32 {
    12
}

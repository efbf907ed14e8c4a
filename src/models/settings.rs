//! Free-form operator settings

use serde::{Deserialize, Serialize};

/// Pin of a routing target onto a specific outbound tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutePin {
    pub target_id: String,
    pub outbound: String,
}

/// Settings document; one JSON file, whole-file writes only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// cron-style auto-update schedule, empty to disable.
    #[serde(default)]
    pub schedule: String,
    #[serde(default = "default_tun_interface")]
    pub tun_interface: String,
    /// Packet mark applied to classified connections.
    #[serde(default = "default_mark")]
    pub mark: u32,
    /// Dedicated policy-routing table id.
    #[serde(default = "default_table")]
    pub route_table: u32,
    #[serde(default = "default_priority")]
    pub rule_priority: u32,
    /// TTL for resolver-populated set elements, in seconds.
    #[serde(default = "default_dynamic_ttl")]
    pub dynamic_ttl_secs: u32,
    /// Operator-chosen default outbound; overrides first-tunnel order.
    #[serde(default)]
    pub active_outbound: Option<String>,
}

fn default_tun_interface() -> String {
    "tun1".to_string()
}

fn default_mark() -> u32 {
    0x100
}

fn default_table() -> u32 {
    100
}

fn default_priority() -> u32 {
    100
}

fn default_dynamic_ttl() -> u32 {
    3600
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            schedule: String::new(),
            tun_interface: default_tun_interface(),
            mark: default_mark(),
            route_table: default_table(),
            rule_priority: default_priority(),
            dynamic_ttl_secs: default_dynamic_ttl(),
            active_outbound: None,
        }
    }
}

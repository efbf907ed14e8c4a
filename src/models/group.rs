//! Outbound group definitions (urltest / selector aggregation)

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupKind {
    UrlTest,
    Selector,
}

/// Aggregates existing outbounds under one selectable tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupDef {
    pub id: String,
    pub name: String,
    pub kind: GroupKind,
    /// Member outbound tags, in preference order.
    #[serde(default)]
    pub members: Vec<String>,
    /// Probe interval for urltest groups, engine duration syntax.
    #[serde(default = "default_interval")]
    pub interval: String,
    /// Latency tolerance in milliseconds for urltest groups.
    #[serde(default = "default_tolerance")]
    pub tolerance: u16,
}

fn default_interval() -> String {
    "5m".to_string()
}

fn default_tolerance() -> u16 {
    50
}

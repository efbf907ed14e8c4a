//! Routing targets: the services, custom services and devices whose
//! enabled entries feed the classification store.

use serde::{Deserialize, Serialize};

/// A preset service with curated domains plus operator additions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub enabled: bool,
    /// Curated preset domains.
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub custom_domains: Vec<String>,
    /// Curated static CIDR ranges.
    #[serde(default)]
    pub ip_ranges: Vec<String>,
    #[serde(default)]
    pub custom_ips: Vec<String>,
}

/// An operator-defined service: just domains and addresses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomService {
    pub id: String,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub ips: Vec<String>,
}

fn default_true() -> bool {
    true
}

/// Per-device routing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceMode {
    /// Follow the global service classification.
    Default,
    /// Every packet from this device goes through the tunnel.
    AllTunnel,
    /// Every packet from this device bypasses classification.
    AllDirect,
    /// Only this device's chosen service set is tunneled.
    CustomServiceSet,
}

impl Default for DeviceMode {
    fn default() -> Self {
        DeviceMode::Default
    }
}

/// A LAN device identified by address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub enabled: bool,
    pub ip: String,
    #[serde(default)]
    pub mac: Option<String>,
    #[serde(default)]
    pub mode: DeviceMode,
    /// Service ids selected when `mode == CustomServiceSet`.
    #[serde(default)]
    pub services: Vec<String>,
}

/// Union over the three target kinds, as handed to the classification
/// store. Only enabled targets are ever passed in.
#[derive(Debug, Clone, PartialEq)]
pub enum RoutingTarget {
    Service(Service),
    Custom(CustomService),
    Device(Device),
}

impl RoutingTarget {
    pub fn id(&self) -> &str {
        match self {
            RoutingTarget::Service(s) => &s.id,
            RoutingTarget::Custom(c) => &c.id,
            RoutingTarget::Device(d) => &d.id,
        }
    }

    pub fn enabled(&self) -> bool {
        match self {
            RoutingTarget::Service(s) => s.enabled,
            RoutingTarget::Custom(c) => c.enabled,
            RoutingTarget::Device(d) => d.enabled,
        }
    }

    /// Domains this target wants resolved into the dynamic set.
    pub fn domains(&self) -> Vec<&str> {
        match self {
            RoutingTarget::Service(s) => s
                .domains
                .iter()
                .chain(s.custom_domains.iter())
                .map(|d| d.as_str())
                .collect(),
            RoutingTarget::Custom(c) => c.domains.iter().map(|d| d.as_str()).collect(),
            RoutingTarget::Device(_) => Vec::new(),
        }
    }

    /// Static addresses this target wants in the CIDR set.
    pub fn static_entries(&self) -> Vec<&str> {
        match self {
            RoutingTarget::Service(s) => s
                .ip_ranges
                .iter()
                .chain(s.custom_ips.iter())
                .map(|d| d.as_str())
                .collect(),
            RoutingTarget::Custom(c) => c.ips.iter().map(|d| d.as_str()).collect(),
            RoutingTarget::Device(_) => Vec::new(),
        }
    }
}

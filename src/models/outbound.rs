//! Outbound descriptor model
//!
//! Canonical representation of a single proxy endpoint (or group) the
//! tunnel engine can route traffic through. Protocol-specific material
//! lives in a tagged union validated at parse time.

use serde::{Deserialize, Serialize};

/// Recorded origin of an outbound, used for scoped cleanup when a
/// subscription is deleted or refreshed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Provenance {
    Manual,
    Subscription(String),
    GroupMember,
}

impl Provenance {
    pub fn as_string(&self) -> String {
        match self {
            Provenance::Manual => "manual".to_string(),
            Provenance::Subscription(id) => format!("subscription:{}", id),
            Provenance::GroupMember => "group-member".to_string(),
        }
    }

    pub fn from_string(s: &str) -> Provenance {
        match s {
            "manual" => Provenance::Manual,
            "group-member" => Provenance::GroupMember,
            other => match other.strip_prefix("subscription:") {
                Some(id) => Provenance::Subscription(id.to_string()),
                None => Provenance::Manual,
            },
        }
    }
}

impl Serialize for Provenance {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.as_string())
    }
}

impl<'de> Deserialize<'de> for Provenance {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Provenance::from_string(&s))
    }
}

impl Default for Provenance {
    fn default() -> Self {
        Provenance::Manual
    }
}

/// TLS mode attached to an outbound.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsKind {
    Tls,
    Reality,
}

/// TLS descriptor shared by all TLS-capable protocols.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TlsConfig {
    pub kind: TlsKind,
    pub server_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(default)]
    pub insecure: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alpn: Vec<String>,
    /// Reality key material; only meaningful when `kind == Reality`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub short_id: Option<String>,
}

/// Stream transport carried under the TLS layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Ws {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        host: Option<String>,
    },
    Grpc { service_name: String },
}

impl Default for Transport {
    fn default() -> Self {
        Transport::Tcp
    }
}

/// Protocol-specific configuration, validated when the share link is
/// parsed rather than when the config is generated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum ProtocolConfig {
    Direct,
    Vless {
        uuid: String,
        #[serde(default)]
        flow: String,
        #[serde(default = "default_encryption")]
        encryption: String,
    },
    Vmess {
        uuid: String,
        #[serde(default)]
        alter_id: u16,
        #[serde(default = "default_security")]
        security: String,
    },
    Shadowsocks {
        method: String,
        password: String,
    },
    Trojan {
        password: String,
    },
    Hysteria2 {
        password: String,
        #[serde(default)]
        obfs_type: String,
        #[serde(default)]
        obfs_password: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        up_mbps: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        down_mbps: Option<u32>,
    },
    #[serde(rename = "urltest-group")]
    UrlTestGroup {
        members: Vec<String>,
        #[serde(default = "default_probe_url")]
        url: String,
        #[serde(default = "default_probe_interval")]
        interval: String,
        #[serde(default)]
        tolerance: u16,
    },
    #[serde(rename = "selector-group")]
    SelectorGroup { members: Vec<String> },
}

fn default_encryption() -> String {
    "none".to_string()
}

fn default_security() -> String {
    "auto".to_string()
}

fn default_probe_url() -> String {
    "https://www.gstatic.com/generate_204".to_string()
}

fn default_probe_interval() -> String {
    "5m".to_string()
}

impl ProtocolConfig {
    /// Wire name of this protocol as the tunnel engine spells it.
    pub fn type_name(&self) -> &'static str {
        match self {
            ProtocolConfig::Direct => "direct",
            ProtocolConfig::Vless { .. } => "vless",
            ProtocolConfig::Vmess { .. } => "vmess",
            ProtocolConfig::Shadowsocks { .. } => "shadowsocks",
            ProtocolConfig::Trojan { .. } => "trojan",
            ProtocolConfig::Hysteria2 { .. } => "hysteria2",
            ProtocolConfig::UrlTestGroup { .. } => "urltest",
            ProtocolConfig::SelectorGroup { .. } => "selector",
        }
    }

    pub fn is_group(&self) -> bool {
        matches!(
            self,
            ProtocolConfig::UrlTestGroup { .. } | ProtocolConfig::SelectorGroup { .. }
        )
    }

    /// A tunnel protocol carries traffic to a remote server; `direct`
    /// and group aggregations do not.
    pub fn is_tunnel(&self) -> bool {
        !matches!(self, ProtocolConfig::Direct) && !self.is_group()
    }
}

/// One configured endpoint of the tunnel engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundDescriptor {
    /// Unique within one engine configuration.
    pub tag: String,
    #[serde(default)]
    pub server: String,
    #[serde(default)]
    pub port: u16,
    #[serde(flatten)]
    pub protocol: ProtocolConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,
    #[serde(default)]
    pub transport: Transport,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub provenance: Provenance,
}

fn default_true() -> bool {
    true
}

impl OutboundDescriptor {
    pub fn direct() -> OutboundDescriptor {
        OutboundDescriptor {
            tag: "direct".to_string(),
            server: String::new(),
            port: 0,
            protocol: ProtocolConfig::Direct,
            tls: None,
            transport: Transport::Tcp,
            enabled: true,
            provenance: Provenance::Manual,
        }
    }

    pub fn is_direct(&self) -> bool {
        matches!(self.protocol, ProtocolConfig::Direct)
    }

    pub fn is_group(&self) -> bool {
        self.protocol.is_group()
    }

    pub fn is_tunnel(&self) -> bool {
        self.protocol.is_tunnel()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provenance_round_trip() {
        for p in [
            Provenance::Manual,
            Provenance::Subscription("ab12cd34".to_string()),
            Provenance::GroupMember,
        ] {
            assert_eq!(Provenance::from_string(&p.as_string()), p);
        }
    }

    #[test]
    fn unknown_provenance_defaults_to_manual() {
        assert_eq!(Provenance::from_string("weird"), Provenance::Manual);
    }

    #[test]
    fn descriptor_serde_round_trip() {
        let desc = OutboundDescriptor {
            tag: "vless-test".to_string(),
            server: "example.net".to_string(),
            port: 443,
            protocol: ProtocolConfig::Vless {
                uuid: "8f4a7e8e-1111-2222-3333-444455556666".to_string(),
                flow: "xtls-rprx-vision".to_string(),
                encryption: "none".to_string(),
            },
            tls: Some(TlsConfig {
                kind: TlsKind::Reality,
                server_name: "google.com".to_string(),
                fingerprint: Some("chrome".to_string()),
                insecure: false,
                alpn: vec![],
                public_key: Some("pubkey".to_string()),
                short_id: Some("f4".to_string()),
            }),
            transport: Transport::Tcp,
            enabled: true,
            provenance: Provenance::Subscription("s1".to_string()),
        };
        let json = serde_json::to_string(&desc).unwrap();
        let back: OutboundDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(back, desc);
    }
}

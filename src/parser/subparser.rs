//! Subscription payload parsing
//!
//! A fetched payload can be a plain share-link list, an engine-native
//! JSON config, or a base64 wrapper around either. The format is
//! detected from the content, never from headers or the URL.

use log::{debug, warn};
use serde_json::Value;

use crate::models::{
    OutboundDescriptor, ProtocolConfig, Provenance, SubscriptionFormat, TlsConfig, TlsKind,
    Transport,
};
use crate::utils::base64::base64_decode;

use super::explodes::explode;

const LINK_SCHEMES: &[&str] = &[
    "vless://",
    "vmess://",
    "ss://",
    "trojan://",
    "hysteria2://",
    "hy2://",
];

/// Engine-internal outbound types that never map to a descriptor.
const SKIPPED_TYPES: &[&str] = &["direct", "block", "dns", "selector", "urltest"];

/// Result of parsing one subscription payload. Failures are counted
/// per item; a bad line never aborts the batch.
#[derive(Debug, Default)]
pub struct ParsedSubscription {
    pub format: SubscriptionFormat,
    pub outbounds: Vec<OutboundDescriptor>,
    pub failed: usize,
}

/// Parse a subscription payload, auto-detecting its format. At most
/// one layer of base64 wrapping is unwrapped.
pub fn parse_subscription(payload: &str) -> ParsedSubscription {
    let trimmed = payload.trim();

    if let Some(parsed) = try_direct(trimmed) {
        return parsed;
    }

    // One decode attempt, then the same two detections again.
    let decoded = {
        let std = base64_decode(trimmed, false);
        if std.is_empty() {
            base64_decode(trimmed, true)
        } else {
            std
        }
    };
    if !decoded.is_empty() {
        if let Some(mut parsed) = try_direct(decoded.trim()) {
            parsed.format = SubscriptionFormat::Base64;
            return parsed;
        }
    }

    warn!("subscription payload not recognized as links, config or base64");
    ParsedSubscription {
        format: SubscriptionFormat::Unknown,
        ..Default::default()
    }
}

fn try_direct(content: &str) -> Option<ParsedSubscription> {
    if looks_like_links(content) {
        return Some(parse_link_list(content));
    }
    if content.starts_with('{') {
        return Some(parse_native_config(content));
    }
    None
}

fn looks_like_links(content: &str) -> bool {
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .any(|l| LINK_SCHEMES.iter().any(|s| l.starts_with(s)))
}

fn parse_link_list(content: &str) -> ParsedSubscription {
    let mut outbounds = Vec::new();
    let mut failed = 0;
    for line in content.lines().map(str::trim).filter(|l| !l.is_empty()) {
        match explode(line) {
            Some(out) => outbounds.push(out),
            None => {
                debug!("skipping unparseable share link: {:.40}", line);
                failed += 1;
            }
        }
    }
    ParsedSubscription {
        format: SubscriptionFormat::Links,
        outbounds,
        failed,
    }
}

fn parse_native_config(content: &str) -> ParsedSubscription {
    let mut parsed = ParsedSubscription {
        format: SubscriptionFormat::Native,
        ..Default::default()
    };

    let root: Value = match serde_json::from_str(content) {
        Ok(v) => v,
        Err(e) => {
            debug!("native config payload is not valid json: {}", e);
            parsed.format = SubscriptionFormat::Unknown;
            return parsed;
        }
    };

    let outbounds = match root.get("outbounds").and_then(|v| v.as_array()) {
        Some(list) => list,
        None => return parsed,
    };

    for entry in outbounds {
        let kind = entry.get("type").and_then(|v| v.as_str()).unwrap_or("");
        if SKIPPED_TYPES.contains(&kind) {
            continue;
        }
        match native_outbound(entry) {
            Some(out) => parsed.outbounds.push(out),
            None => parsed.failed += 1,
        }
    }
    parsed
}

/// Convert one engine-native outbound object into a descriptor.
fn native_outbound(entry: &Value) -> Option<OutboundDescriptor> {
    let kind = entry.get("type")?.as_str()?;
    let tag = entry.get("tag")?.as_str()?.to_string();
    let server = entry
        .get("server")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let port = entry
        .get("server_port")
        .and_then(|v| v.as_u64())
        .and_then(|v| u16::try_from(v).ok())
        .unwrap_or(0);
    if server.is_empty() || port == 0 {
        return None;
    }

    let protocol = match kind {
        "vless" => ProtocolConfig::Vless {
            uuid: entry.get("uuid")?.as_str()?.to_string(),
            flow: str_field(entry, "flow"),
            encryption: "none".to_string(),
        },
        "vmess" => ProtocolConfig::Vmess {
            uuid: entry.get("uuid")?.as_str()?.to_string(),
            alter_id: entry
                .get("alter_id")
                .and_then(|v| v.as_u64())
                .and_then(|v| u16::try_from(v).ok())
                .unwrap_or(0),
            security: entry
                .get("security")
                .and_then(|v| v.as_str())
                .unwrap_or("auto")
                .to_string(),
        },
        "shadowsocks" => ProtocolConfig::Shadowsocks {
            method: entry.get("method")?.as_str()?.to_string(),
            password: entry.get("password")?.as_str()?.to_string(),
        },
        "trojan" => ProtocolConfig::Trojan {
            password: entry.get("password")?.as_str()?.to_string(),
        },
        "hysteria2" => ProtocolConfig::Hysteria2 {
            password: entry.get("password")?.as_str()?.to_string(),
            obfs_type: entry
                .get("obfs")
                .and_then(|o| o.get("type"))
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            obfs_password: entry
                .get("obfs")
                .and_then(|o| o.get("password"))
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            up_mbps: entry
                .get("up_mbps")
                .and_then(|v| v.as_u64())
                .and_then(|v| u32::try_from(v).ok()),
            down_mbps: entry
                .get("down_mbps")
                .and_then(|v| v.as_u64())
                .and_then(|v| u32::try_from(v).ok()),
        },
        _ => return None,
    };

    Some(OutboundDescriptor {
        tag,
        server,
        port,
        protocol,
        tls: native_tls(entry.get("tls")),
        transport: native_transport(entry.get("transport")),
        enabled: true,
        provenance: Provenance::Manual,
    })
}

fn native_tls(tls: Option<&Value>) -> Option<TlsConfig> {
    let tls = tls?;
    if !tls.get("enabled").and_then(|v| v.as_bool()).unwrap_or(false) {
        return None;
    }

    let reality = tls
        .get("reality")
        .filter(|r| r.get("enabled").and_then(|v| v.as_bool()).unwrap_or(false));

    Some(TlsConfig {
        kind: if reality.is_some() {
            TlsKind::Reality
        } else {
            TlsKind::Tls
        },
        server_name: str_field(tls, "server_name"),
        fingerprint: tls
            .get("utls")
            .and_then(|u| u.get("fingerprint"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        insecure: tls.get("insecure").and_then(|v| v.as_bool()).unwrap_or(false),
        alpn: tls
            .get("alpn")
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str())
                    .map(|s| s.to_string())
                    .collect()
            })
            .unwrap_or_default(),
        public_key: reality
            .and_then(|r| r.get("public_key"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        short_id: reality
            .and_then(|r| r.get("short_id"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
    })
}

fn native_transport(transport: Option<&Value>) -> Transport {
    let transport = match transport {
        Some(t) => t,
        None => return Transport::Tcp,
    };
    match transport.get("type").and_then(|v| v.as_str()) {
        Some("ws") => Transport::Ws {
            path: transport
                .get("path")
                .and_then(|v| v.as_str())
                .unwrap_or("/")
                .to_string(),
            host: transport
                .get("headers")
                .and_then(|h| h.get("Host"))
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
        },
        Some("grpc") => Transport::Grpc {
            service_name: str_field(transport, "service_name"),
        },
        _ => Transport::Tcp,
    }
}

fn str_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

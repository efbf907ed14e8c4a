//! `hysteria2://` (and `hy2://`) share link parsing

use crate::models::{
    OutboundDescriptor, ProtocolConfig, Provenance, TlsConfig, TlsKind, Transport,
};
use crate::utils::{url_decode, url_encode};

use super::{format_host, split_link, LinkParts};

/// Parse a Hysteria2 share link:
/// `hysteria2://password@host:port?sni=...&obfs=salamander&obfs-password=...#name`
pub fn explode_hysteria2(link: &str) -> Option<OutboundDescriptor> {
    let body = link
        .strip_prefix("hysteria2://")
        .or_else(|| link.strip_prefix("hy2://"))?;
    let LinkParts {
        auth,
        host,
        port,
        params,
        fragment,
    } = split_link(body)?;

    let password = url_decode(&auth);
    if password.is_empty() {
        return None;
    }

    let tls = TlsConfig {
        kind: TlsKind::Tls,
        server_name: params.get("sni").cloned().unwrap_or_else(|| host.clone()),
        fingerprint: None,
        insecure: params.get("insecure").map(|v| v == "1").unwrap_or(false),
        alpn: Vec::new(),
        public_key: None,
        short_id: None,
    };

    let obfs_type = params.get("obfs").cloned().unwrap_or_default();
    let obfs_password = params.get("obfs-password").cloned().unwrap_or_default();

    Some(OutboundDescriptor {
        tag: fragment.unwrap_or_else(|| format!("hysteria2-{}", host)),
        server: host,
        port,
        protocol: ProtocolConfig::Hysteria2 {
            password,
            obfs_type,
            obfs_password,
            up_mbps: params.get("up").and_then(|v| parse_mbps(v)),
            down_mbps: params.get("down").and_then(|v| parse_mbps(v)),
        },
        tls: Some(tls),
        transport: Transport::Tcp,
        enabled: true,
        provenance: Provenance::Manual,
    })
}

/// Bandwidth hints come as `50`, `50 mbps` or `50mbps`.
fn parse_mbps(value: &str) -> Option<u32> {
    let digits: String = value.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse::<u32>().ok()
}

/// Serialize a Hysteria2 descriptor back to share-link form.
pub(crate) fn hysteria2_link(out: &OutboundDescriptor) -> Option<String> {
    let (password, obfs_type, obfs_password, up, down) = match &out.protocol {
        ProtocolConfig::Hysteria2 {
            password,
            obfs_type,
            obfs_password,
            up_mbps,
            down_mbps,
        } => (password, obfs_type, obfs_password, up_mbps, down_mbps),
        _ => return None,
    };

    let mut params: Vec<(String, String)> = Vec::new();
    if let Some(tls) = &out.tls {
        params.push(("sni".to_string(), tls.server_name.clone()));
        if tls.insecure {
            params.push(("insecure".to_string(), "1".to_string()));
        }
    }
    if !obfs_type.is_empty() {
        params.push(("obfs".to_string(), obfs_type.clone()));
        params.push(("obfs-password".to_string(), obfs_password.clone()));
    }
    if let Some(up) = up {
        params.push(("up".to_string(), up.to_string()));
    }
    if let Some(down) = down {
        params.push(("down".to_string(), down.to_string()));
    }

    let query = params
        .iter()
        .map(|(k, v)| format!("{}={}", k, url_encode(v)))
        .collect::<Vec<_>>()
        .join("&");

    Some(format!(
        "hysteria2://{}@{}:{}?{}#{}",
        url_encode(password),
        format_host(&out.server),
        out.port,
        query,
        url_encode(&out.tag)
    ))
}

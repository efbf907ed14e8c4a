mod hysteria2;
mod ss;
mod trojan;
mod vless;
mod vmess;

pub use hysteria2::explode_hysteria2;
pub use ss::explode_ss;
pub use trojan::explode_trojan;
pub use vless::explode_vless;
pub use vmess::explode_vmess;

use std::collections::HashMap;

use regex::Regex;

use crate::models::OutboundDescriptor;
use crate::utils::url_decode;

/// Parse any supported share link into a descriptor.
///
/// Returns `None` for unknown schemes or malformed links; callers treat
/// that as a per-item failure, never as a batch abort.
pub fn explode(link: &str) -> Option<OutboundDescriptor> {
    let link = link.trim();

    if link.starts_with("vless://") {
        explode_vless(link)
    } else if link.starts_with("vmess://") {
        explode_vmess(link)
    } else if link.starts_with("ss://") {
        explode_ss(link)
    } else if link.starts_with("trojan://") {
        explode_trojan(link)
    } else if link.starts_with("hysteria2://") || link.starts_with("hy2://") {
        explode_hysteria2(link)
    } else {
        None
    }
}

/// Serialize a descriptor back into its scheme's share-link form.
/// Groups and the direct outbound have no link representation.
pub fn share_link(out: &OutboundDescriptor) -> Option<String> {
    use crate::models::ProtocolConfig;

    match &out.protocol {
        ProtocolConfig::Vless { .. } => vless::vless_link(out),
        ProtocolConfig::Vmess { .. } => vmess::vmess_link(out),
        ProtocolConfig::Shadowsocks { .. } => ss::ss_link(out),
        ProtocolConfig::Trojan { .. } => trojan::trojan_link(out),
        ProtocolConfig::Hysteria2 { .. } => hysteria2::hysteria2_link(out),
        _ => None,
    }
}

/// Decomposed `auth@host:port?query#fragment` share link body.
pub(crate) struct LinkParts {
    pub auth: String,
    pub host: String,
    pub port: u16,
    pub params: HashMap<String, String>,
    pub fragment: Option<String>,
}

/// Split the body of a userinfo-form link. The auth part is returned
/// verbatim (individual parsers decide whether to decode it).
pub(crate) fn split_link(body: &str) -> Option<LinkParts> {
    let (body, fragment) = match body.rsplit_once('#') {
        Some((rest, frag)) if !frag.is_empty() => (rest, Some(url_decode(frag))),
        Some((rest, _)) => (rest, None),
        None => (body, None),
    };

    let (body, query) = match body.split_once('?') {
        Some((rest, q)) => (rest, Some(q)),
        None => (body, None),
    };

    let mut params = HashMap::new();
    if let Some(query) = query {
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            params.insert(key.to_string(), value.to_string());
        }
    }

    // auth may itself contain '@' (e.g. hysteria2 passwords), so split
    // on the last occurrence.
    let (auth, server_port) = match body.rsplit_once('@') {
        Some((a, sp)) => (a.to_string(), sp),
        None => (String::new(), body),
    };

    let (host, port) = split_host_port(server_port)?;

    Some(LinkParts {
        auth,
        host,
        port,
        params,
        fragment,
    })
}

/// Split `host:port`, accepting the `[v6addr]:port` bracket form.
pub(crate) fn split_host_port(s: &str) -> Option<(String, u16)> {
    if s.starts_with('[') {
        let re = Regex::new(r"^\[([^\]]+)\]:(\d+)$").ok()?;
        let caps = re.captures(s)?;
        let host = caps.get(1)?.as_str().to_string();
        let port = caps.get(2)?.as_str().parse::<u16>().ok()?;
        if port == 0 {
            return None;
        }
        return Some((host, port));
    }
    let (host, port) = s.rsplit_once(':')?;
    let port = port.parse::<u16>().ok()?;
    if host.is_empty() || port == 0 {
        return None;
    }
    Some((host.to_string(), port))
}

/// Format a host for link output, re-bracketing IPv6 addresses.
pub(crate) fn format_host(host: &str) -> String {
    if host.contains(':') {
        format!("[{}]", host)
    } else {
        host.to_string()
    }
}

//! `ss://` share link parsing (SIP002 and the legacy whole-body base64)

use crate::models::{OutboundDescriptor, ProtocolConfig, Provenance, Transport};
use crate::utils::base64::{base64_decode, url_safe_base64_decode};
use crate::utils::{url_decode, url_encode};

use super::{format_host, split_host_port, split_link, LinkParts};

use base64::{engine::general_purpose, Engine as _};

/// Parse a Shadowsocks share link. SIP002 form first
/// (`ss://base64(method:password)@host:port#name`), falling back to the
/// legacy form where the whole body is base64.
pub fn explode_ss(link: &str) -> Option<OutboundDescriptor> {
    let body = link.strip_prefix("ss://")?;

    if let Some(out) = parse_sip002(body) {
        return Some(out);
    }
    parse_legacy(body)
}

fn parse_sip002(body: &str) -> Option<OutboundDescriptor> {
    if !body.contains('@') {
        return None;
    }
    let LinkParts {
        auth,
        host,
        port,
        params: _,
        fragment,
    } = split_link(body)?;

    let userinfo = url_decode(&auth);
    // Userinfo is usually base64(method:password) but some emitters
    // leave it plain.
    let (method, password) = if let Some(pair) = userinfo.split_once(':') {
        (pair.0.to_string(), pair.1.to_string())
    } else {
        let decoded = url_safe_base64_decode(&userinfo);
        let (m, p) = decoded.split_once(':')?;
        (m.to_string(), p.to_string())
    };
    if method.is_empty() || password.is_empty() {
        return None;
    }

    Some(descriptor(method, password, host, port, fragment))
}

fn parse_legacy(body: &str) -> Option<OutboundDescriptor> {
    let (body, fragment) = match body.rsplit_once('#') {
        Some((rest, frag)) if !frag.is_empty() => (rest, Some(url_decode(frag))),
        Some((rest, _)) => (rest, None),
        None => (body, None),
    };

    let decoded = url_safe_base64_decode(body);
    let (userinfo, server_port) = decoded.rsplit_once('@')?;
    let (method, password) = userinfo.split_once(':')?;
    let (host, port) = split_host_port(server_port)?;
    if method.is_empty() || password.is_empty() {
        return None;
    }

    Some(descriptor(
        method.to_string(),
        password.to_string(),
        host,
        port,
        fragment,
    ))
}

fn descriptor(
    method: String,
    password: String,
    host: String,
    port: u16,
    fragment: Option<String>,
) -> OutboundDescriptor {
    OutboundDescriptor {
        tag: fragment.unwrap_or_else(|| format!("ss-{}", host)),
        server: host,
        port,
        protocol: ProtocolConfig::Shadowsocks { method, password },
        tls: None,
        transport: Transport::Tcp,
        enabled: true,
        provenance: Provenance::Manual,
    }
}

/// Serialize a Shadowsocks descriptor to SIP002 form.
pub(crate) fn ss_link(out: &OutboundDescriptor) -> Option<String> {
    let (method, password) = match &out.protocol {
        ProtocolConfig::Shadowsocks { method, password } => (method, password),
        _ => return None,
    };
    let userinfo =
        general_purpose::URL_SAFE_NO_PAD.encode(format!("{}:{}", method, password));
    Some(format!(
        "ss://{}@{}:{}#{}",
        userinfo,
        format_host(&out.server),
        out.port,
        url_encode(&out.tag)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sip002_link_parses() {
        let userinfo = general_purpose::URL_SAFE_NO_PAD.encode("chacha20-ietf-poly1305:pass123");
        let link = format!("ss://{}@ss.example.com:8388#Tokyo", userinfo);
        let out = explode_ss(&link).unwrap();
        assert_eq!(out.tag, "Tokyo");
        assert_eq!(out.server, "ss.example.com");
        assert_eq!(out.port, 8388);
        assert_eq!(
            out.protocol,
            ProtocolConfig::Shadowsocks {
                method: "chacha20-ietf-poly1305".to_string(),
                password: "pass123".to_string(),
            }
        );
    }

    #[test]
    fn plain_userinfo_parses() {
        let out = explode_ss("ss://aes-256-gcm:secret@ss.example.com:443#plain").unwrap();
        assert_eq!(
            out.protocol,
            ProtocolConfig::Shadowsocks {
                method: "aes-256-gcm".to_string(),
                password: "secret".to_string(),
            }
        );
    }

    #[test]
    fn legacy_whole_body_base64_parses() {
        let body =
            general_purpose::STANDARD_NO_PAD.encode("rc4-md5:passwd@legacy.example.com:8388");
        let out = explode_ss(&format!("ss://{}#Legacy", body)).unwrap();
        assert_eq!(out.tag, "Legacy");
        assert_eq!(out.server, "legacy.example.com");
        assert_eq!(out.port, 8388);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(explode_ss("ss://!!!").is_none());
    }

    #[test]
    fn link_round_trips() {
        let out = descriptor(
            "chacha20-ietf-poly1305".to_string(),
            "p@ss:word".to_string(),
            "ss.example.com".to_string(),
            8388,
            Some("edge case".to_string()),
        );
        let back = explode_ss(&ss_link(&out).unwrap()).unwrap();
        assert_eq!(back, out);
    }
}

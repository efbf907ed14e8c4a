//! `trojan://` share link parsing

use crate::models::{
    OutboundDescriptor, ProtocolConfig, Provenance, TlsConfig, TlsKind, Transport,
};
use crate::utils::{url_decode, url_encode};

use super::vless::{
    push_transport_params, render_query, split_alpn, transport_from_params,
};
use super::{format_host, split_link, LinkParts};

/// Parse a Trojan share link:
/// `trojan://password@host:port?sni=...&allowInsecure=1#name`
///
/// Trojan always runs over TLS; the layer is attached even when no
/// `sni` parameter is present.
pub fn explode_trojan(link: &str) -> Option<OutboundDescriptor> {
    let body = link.strip_prefix("trojan://")?;
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
        fingerprint: params.get("fp").cloned(),
        insecure: params.get("allowInsecure").map(|v| v == "1").unwrap_or(false),
        alpn: split_alpn(params.get("alpn")),
        public_key: None,
        short_id: None,
    };

    let transport = transport_from_params(&params);

    Some(OutboundDescriptor {
        tag: fragment.unwrap_or_else(|| format!("trojan-{}", host)),
        server: host,
        port,
        protocol: ProtocolConfig::Trojan { password },
        tls: Some(tls),
        transport,
        enabled: true,
        provenance: Provenance::Manual,
    })
}

/// Serialize a Trojan descriptor back to share-link form.
pub(crate) fn trojan_link(out: &OutboundDescriptor) -> Option<String> {
    let password = match &out.protocol {
        ProtocolConfig::Trojan { password } => password,
        _ => return None,
    };

    let mut params: Vec<(String, String)> = Vec::new();
    if let Some(tls) = &out.tls {
        params.push(("sni".to_string(), tls.server_name.clone()));
        if tls.insecure {
            params.push(("allowInsecure".to_string(), "1".to_string()));
        }
        if let Some(fp) = &tls.fingerprint {
            params.push(("fp".to_string(), fp.clone()));
        }
        if !tls.alpn.is_empty() {
            params.push(("alpn".to_string(), tls.alpn.join(",")));
        }
    }
    push_transport_params(&mut params, &out.transport);

    Some(format!(
        "trojan://{}@{}:{}?{}#{}",
        url_encode(password),
        format_host(&out.server),
        out.port,
        render_query(&params),
        url_encode(&out.tag)
    ))
}

//! `vless://` share link parsing

use crate::models::{
    OutboundDescriptor, ProtocolConfig, Provenance, TlsConfig, TlsKind, Transport,
};
use crate::utils::{url_decode, url_encode};

use super::{format_host, split_link, LinkParts};

/// Parse a VLESS share link:
/// `vless://uuid@host:port?security=reality&pbk=...&sid=...#name`
pub fn explode_vless(link: &str) -> Option<OutboundDescriptor> {
    let body = link.strip_prefix("vless://")?;
    let LinkParts {
        auth,
        host,
        port,
        params,
        fragment,
    } = split_link(body)?;

    let uuid = url_decode(&auth);
    if uuid.is_empty() {
        return None;
    }

    let flow = params.get("flow").cloned().unwrap_or_default();
    let encryption = params
        .get("encryption")
        .cloned()
        .unwrap_or_else(|| "none".to_string());

    let tls = match params.get("security").map(|s| s.as_str()) {
        Some("reality") => Some(TlsConfig {
            kind: TlsKind::Reality,
            server_name: params.get("sni").cloned().unwrap_or_else(|| host.clone()),
            fingerprint: params.get("fp").cloned(),
            insecure: false,
            alpn: split_alpn(params.get("alpn")),
            public_key: params.get("pbk").cloned(),
            short_id: params.get("sid").cloned(),
        }),
        Some("tls") | Some("xtls") => Some(TlsConfig {
            kind: TlsKind::Tls,
            server_name: params.get("sni").cloned().unwrap_or_else(|| host.clone()),
            fingerprint: params.get("fp").cloned(),
            insecure: params.get("allowInsecure").map(|v| v == "1").unwrap_or(false),
            alpn: split_alpn(params.get("alpn")),
            public_key: None,
            short_id: None,
        }),
        _ => None,
    };

    let transport = transport_from_params(&params);

    Some(OutboundDescriptor {
        tag: fragment.unwrap_or_else(|| format!("vless-{}", host)),
        server: host,
        port,
        protocol: ProtocolConfig::Vless {
            uuid,
            flow,
            encryption,
        },
        tls,
        transport,
        enabled: true,
        provenance: Provenance::Manual,
    })
}

/// Serialize a VLESS descriptor back to share-link form.
pub(crate) fn vless_link(out: &OutboundDescriptor) -> Option<String> {
    let (uuid, flow, encryption) = match &out.protocol {
        ProtocolConfig::Vless {
            uuid,
            flow,
            encryption,
        } => (uuid, flow, encryption),
        _ => return None,
    };

    let mut params: Vec<(String, String)> =
        vec![("encryption".to_string(), encryption.clone())];
    if !flow.is_empty() {
        params.push(("flow".to_string(), flow.clone()));
    }
    push_tls_params(&mut params, out.tls.as_ref());
    push_transport_params(&mut params, &out.transport);

    Some(format!(
        "vless://{}@{}:{}?{}#{}",
        uuid,
        format_host(&out.server),
        out.port,
        render_query(&params),
        url_encode(&out.tag)
    ))
}

pub(crate) fn split_alpn(value: Option<&String>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

pub(crate) fn transport_from_params(
    params: &std::collections::HashMap<String, String>,
) -> Transport {
    match params.get("type").map(|s| s.as_str()) {
        Some("ws") => Transport::Ws {
            path: params
                .get("path")
                .cloned()
                .unwrap_or_else(|| "/".to_string()),
            host: params.get("host").cloned(),
        },
        Some("grpc") => Transport::Grpc {
            service_name: params.get("serviceName").cloned().unwrap_or_default(),
        },
        _ => Transport::Tcp,
    }
}

pub(crate) fn push_tls_params(params: &mut Vec<(String, String)>, tls: Option<&TlsConfig>) {
    let tls = match tls {
        Some(t) => t,
        None => return,
    };
    match tls.kind {
        TlsKind::Reality => {
            params.push(("security".to_string(), "reality".to_string()));
            params.push(("sni".to_string(), tls.server_name.clone()));
            if let Some(pbk) = &tls.public_key {
                params.push(("pbk".to_string(), pbk.clone()));
            }
            if let Some(sid) = &tls.short_id {
                params.push(("sid".to_string(), sid.clone()));
            }
        }
        TlsKind::Tls => {
            params.push(("security".to_string(), "tls".to_string()));
            params.push(("sni".to_string(), tls.server_name.clone()));
            if tls.insecure {
                params.push(("allowInsecure".to_string(), "1".to_string()));
            }
        }
    }
    if let Some(fp) = &tls.fingerprint {
        params.push(("fp".to_string(), fp.clone()));
    }
    if !tls.alpn.is_empty() {
        params.push(("alpn".to_string(), tls.alpn.join(",")));
    }
}

pub(crate) fn push_transport_params(params: &mut Vec<(String, String)>, transport: &Transport) {
    match transport {
        Transport::Tcp => {}
        Transport::Ws { path, host } => {
            params.push(("type".to_string(), "ws".to_string()));
            params.push(("path".to_string(), path.clone()));
            if let Some(h) = host {
                params.push(("host".to_string(), h.clone()));
            }
        }
        Transport::Grpc { service_name } => {
            params.push(("type".to_string(), "grpc".to_string()));
            params.push(("serviceName".to_string(), service_name.clone()));
        }
    }
}

pub(crate) fn render_query(params: &[(String, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, url_encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

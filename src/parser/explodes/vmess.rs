//! `vmess://` share link parsing (base64 JSON body)

use serde_json::{json, Value};

use crate::models::{
    OutboundDescriptor, ProtocolConfig, Provenance, TlsConfig, TlsKind, Transport,
};
use crate::utils::base64::{base64_decode, base64_encode};

/// Parse a VMess share link. The body is base64 of a JSON object in the
/// widely copied `{"v":"2","ps":...,"add":...}` layout.
pub fn explode_vmess(link: &str) -> Option<OutboundDescriptor> {
    let body = link.strip_prefix("vmess://")?;
    // Providers emit both alphabets; try standard first.
    let body = body.trim();
    let mut decoded = base64_decode(body, false);
    if decoded.is_empty() {
        decoded = base64_decode(body, true);
    }
    if decoded.is_empty() {
        return None;
    }

    let value: Value = serde_json::from_str(&decoded).ok()?;
    let obj = value.as_object()?;

    let server = obj.get("add")?.as_str()?.to_string();
    let port = flexible_port(obj.get("port")?)?;
    let uuid = obj.get("id")?.as_str()?.to_string();
    if server.is_empty() || uuid.is_empty() {
        return None;
    }

    let alter_id = obj
        .get("aid")
        .and_then(flexible_u16)
        .unwrap_or(0);
    let security = obj
        .get("scy")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("auto")
        .to_string();

    let tag = obj
        .get("ps")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("vmess-{}", server));

    let net = obj.get("net").and_then(|v| v.as_str()).unwrap_or("tcp");
    let transport = match net {
        "ws" => Transport::Ws {
            path: obj
                .get("path")
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .unwrap_or("/")
                .to_string(),
            host: obj
                .get("host")
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string()),
        },
        "grpc" => Transport::Grpc {
            service_name: obj
                .get("path")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
        },
        _ => Transport::Tcp,
    };

    let tls = match obj.get("tls").and_then(|v| v.as_str()) {
        Some("tls") => Some(TlsConfig {
            kind: TlsKind::Tls,
            server_name: obj
                .get("sni")
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .unwrap_or(&server)
                .to_string(),
            fingerprint: None,
            insecure: false,
            alpn: Vec::new(),
            public_key: None,
            short_id: None,
        }),
        _ => None,
    };

    Some(OutboundDescriptor {
        tag,
        server,
        port,
        protocol: ProtocolConfig::Vmess {
            uuid,
            alter_id,
            security,
        },
        tls,
        transport,
        enabled: true,
        provenance: Provenance::Manual,
    })
}

/// Serialize a VMess descriptor back to the base64 JSON link form.
pub(crate) fn vmess_link(out: &OutboundDescriptor) -> Option<String> {
    let (uuid, alter_id, security) = match &out.protocol {
        ProtocolConfig::Vmess {
            uuid,
            alter_id,
            security,
        } => (uuid, *alter_id, security),
        _ => return None,
    };

    let mut obj = json!({
        "v": "2",
        "ps": out.tag,
        "add": out.server,
        "port": out.port.to_string(),
        "id": uuid,
        "aid": alter_id.to_string(),
        "scy": security,
        "net": "tcp",
        "tls": "",
    });

    match &out.transport {
        Transport::Tcp => {}
        Transport::Ws { path, host } => {
            obj["net"] = json!("ws");
            obj["path"] = json!(path);
            if let Some(h) = host {
                obj["host"] = json!(h);
            }
        }
        Transport::Grpc { service_name } => {
            obj["net"] = json!("grpc");
            obj["path"] = json!(service_name);
        }
    }

    if let Some(tls) = &out.tls {
        obj["tls"] = json!("tls");
        obj["sni"] = json!(tls.server_name);
    }

    Some(format!("vmess://{}", base64_encode(&obj.to_string())))
}

/// Ports arrive as either a JSON number or a string.
fn flexible_port(value: &Value) -> Option<u16> {
    let port = flexible_u16(value)?;
    if port == 0 {
        None
    } else {
        Some(port)
    }
}

fn flexible_u16(value: &Value) -> Option<u16> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|v| u16::try_from(v).ok()),
        Value::String(s) => s.parse::<u16>().ok(),
        _ => None,
    }
}

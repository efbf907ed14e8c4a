//! Engine configuration synthesis
//!
//! Builds the complete sing-box JSON document from the persisted
//! outbounds, groups, pins and settings. The document is regenerated
//! from scratch on every apply; nothing is ever patched in place.

use std::collections::HashSet;
use std::path::Path;

use log::{info, warn};
use serde_json::{json, Map, Value};

use crate::error::Result;
use crate::models::{
    GroupDef, GroupKind, OutboundDescriptor, ProtocolConfig, RoutePin, RoutingTarget, Settings,
    TlsKind, Transport,
};
use crate::store::{backup_existing, write_atomic};
use crate::utils::version::ver_greater_equal;

/// The release that renamed the TUN `inet4_address` field.
const TUN_ADDRESS_CUTOFF: &str = "1.10.0";

const TUN_TAG: &str = "tun-in";
const TUN_CIDR: &str = "10.0.0.1/30";
const TUN_MTU: u32 = 1400;

/// Everything the synthesizer reads. Outbounds arrive in discovery
/// order; disabled ones are filtered here.
pub struct SynthesisInput<'a> {
    pub outbounds: &'a [OutboundDescriptor],
    pub groups: &'a [GroupDef],
    pub settings: &'a Settings,
    pub pins: &'a [RoutePin],
    pub targets: &'a [RoutingTarget],
    /// Installed engine version; `None` when the binary is missing or
    /// its banner is unreadable.
    pub engine_version: Option<&'a str>,
}

/// Build the full engine configuration document.
///
/// The output always contains exactly one `direct` outbound and one
/// TUN inbound, even when no tunnels are configured.
pub fn synthesize(input: &SynthesisInput) -> Value {
    let tunnels: Vec<&OutboundDescriptor> = input
        .outbounds
        .iter()
        .filter(|o| o.enabled && o.is_tunnel())
        .collect();

    // Tags must be unique in the final document. Collisions keep the
    // first occurrence and suffix the rest.
    let mut seen: HashSet<String> = HashSet::new();
    seen.insert("direct".to_string());

    let mut rendered: Vec<Value> = Vec::new();
    let mut tunnel_tags: Vec<String> = Vec::new();
    for out in &tunnels {
        let tag = unique_tag(&mut seen, &out.tag);
        rendered.push(render_outbound(out, &tag));
        tunnel_tags.push(tag);
    }

    rendered.push(json!({"type": "direct", "tag": "direct"}));

    let mut live: HashSet<String> = tunnel_tags.iter().cloned().collect();
    live.insert("direct".to_string());

    for group in input.groups {
        let members: Vec<&String> = group.members.iter().filter(|m| live.contains(*m)).collect();
        if members.is_empty() {
            warn!("group '{}' has no live members, skipping", group.name);
            continue;
        }
        let tag = unique_tag(&mut seen, &group.name);
        rendered.push(render_group(group, &tag, &members));
        live.insert(tag);
    }

    let final_tag = match &input.settings.active_outbound {
        Some(tag) if live.contains(tag) => tag.clone(),
        Some(tag) => {
            warn!("active outbound '{}' is gone, falling back", tag);
            default_final(&tunnel_tags)
        }
        None => default_final(&tunnel_tags),
    };

    let mut route = Map::new();
    route.insert("final".to_string(), json!(final_tag));
    route.insert("auto_detect_interface".to_string(), json!(true));
    let rules = pin_rules(input.pins, input.targets, &live);
    if !rules.is_empty() {
        route.insert("rules".to_string(), Value::Array(rules));
    }

    json!({
        "log": {"level": "warn", "timestamp": true},
        "inbounds": [tun_inbound(&input.settings.tun_interface, input.engine_version)],
        "outbounds": rendered,
        "route": route,
    })
}

/// Write the document to the engine config path, keeping a backup of
/// the previous one.
pub fn persist_config(path: &Path, config: &Value) -> Result<()> {
    if let Some(backup) = backup_existing(path)? {
        info!("previous engine config saved to {}", backup.display());
    }
    write_atomic(path, &serde_json::to_string_pretty(config)?)
}

/// Reserve a unique tag derived from `base`.
pub fn unique_tag(seen: &mut HashSet<String>, base: &str) -> String {
    let base = if base.is_empty() { "outbound" } else { base };
    if seen.insert(base.to_string()) {
        return base.to_string();
    }
    let mut n = 1;
    loop {
        let candidate = format!("{}_{}", base, n);
        if seen.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}

fn default_final(tunnel_tags: &[String]) -> String {
    tunnel_tags
        .first()
        .cloned()
        .unwrap_or_else(|| "direct".to_string())
}

/// TUN inbound, shaped for the installed engine version. 1.10 renamed
/// `inet4_address` to `address`; an unknown version gets the modern
/// spelling.
fn tun_inbound(interface: &str, engine_version: Option<&str>) -> Value {
    let mut inbound = json!({
        "type": "tun",
        "tag": TUN_TAG,
        "interface_name": interface,
        "mtu": TUN_MTU,
        "auto_route": false,
        "stack": "gvisor",
        "sniff": true,
    });
    let modern = engine_version
        .map(|v| ver_greater_equal(v, TUN_ADDRESS_CUTOFF))
        .unwrap_or(true);
    if modern {
        inbound["address"] = json!([TUN_CIDR]);
    } else {
        inbound["inet4_address"] = json!([TUN_CIDR]);
    }
    inbound
}

fn render_group(group: &GroupDef, tag: &str, members: &[&String]) -> Value {
    let members: Vec<&str> = members.iter().map(|m| m.as_str()).collect();
    match group.kind {
        GroupKind::UrlTest => json!({
            "type": "urltest",
            "tag": tag,
            "outbounds": members,
            "url": "https://www.gstatic.com/generate_204",
            "interval": group.interval,
            "tolerance": group.tolerance,
        }),
        GroupKind::Selector => json!({
            "type": "selector",
            "tag": tag,
            "outbounds": members,
            "default": members[0],
        }),
    }
}

/// Domain rules for pinned routing targets. A pin whose outbound tag
/// no longer exists is kept in the store but omitted here.
fn pin_rules(pins: &[RoutePin], targets: &[RoutingTarget], live: &HashSet<String>) -> Vec<Value> {
    let mut rules = Vec::new();
    for pin in pins {
        if !live.contains(&pin.outbound) {
            warn!(
                "pin for '{}' points at missing outbound '{}', skipping",
                pin.target_id, pin.outbound
            );
            continue;
        }
        let target = match targets.iter().find(|t| t.id() == pin.target_id) {
            Some(t) if t.enabled() => t,
            _ => continue,
        };
        // Exact names match themselves plus subdomains; wildcard and
        // dot-prefixed entries are suffix-only.
        let mut exact: Vec<String> = Vec::new();
        let mut suffixes: Vec<String> = Vec::new();
        for domain in target.domains() {
            if let Some(rest) = domain.strip_prefix("*.") {
                suffixes.push(format!(".{}", rest));
            } else if domain.starts_with('.') {
                suffixes.push(domain.to_string());
            } else {
                exact.push(domain.to_string());
                suffixes.push(format!(".{}", domain));
            }
        }
        if exact.is_empty() && suffixes.is_empty() {
            continue;
        }
        let mut rule = Map::new();
        if !exact.is_empty() {
            rule.insert("domain".to_string(), json!(exact));
        }
        if !suffixes.is_empty() {
            rule.insert("domain_suffix".to_string(), json!(suffixes));
        }
        rule.insert("outbound".to_string(), json!(pin.outbound));
        rules.push(Value::Object(rule));
    }
    rules
}

fn render_outbound(out: &OutboundDescriptor, tag: &str) -> Value {
    let mut obj = json!({
        "type": out.protocol.type_name(),
        "tag": tag,
        "server": out.server,
        "server_port": out.port,
    });

    match &out.protocol {
        ProtocolConfig::Vless { uuid, flow, .. } => {
            obj["uuid"] = json!(uuid);
            if !flow.is_empty() {
                obj["flow"] = json!(flow);
            }
        }
        ProtocolConfig::Vmess {
            uuid,
            alter_id,
            security,
        } => {
            obj["uuid"] = json!(uuid);
            obj["alter_id"] = json!(alter_id);
            obj["security"] = json!(security);
        }
        ProtocolConfig::Shadowsocks { method, password } => {
            obj["method"] = json!(method);
            obj["password"] = json!(password);
        }
        ProtocolConfig::Trojan { password } => {
            obj["password"] = json!(password);
        }
        ProtocolConfig::Hysteria2 {
            password,
            obfs_type,
            obfs_password,
            up_mbps,
            down_mbps,
        } => {
            obj["password"] = json!(password);
            if !obfs_type.is_empty() {
                obj["obfs"] = json!({"type": obfs_type, "password": obfs_password});
            }
            if let Some(up) = up_mbps {
                obj["up_mbps"] = json!(up);
            }
            if let Some(down) = down_mbps {
                obj["down_mbps"] = json!(down);
            }
        }
        // Groups and direct are rendered elsewhere.
        _ => {}
    }

    if let Some(tls) = &out.tls {
        let mut tls_obj = json!({
            "enabled": true,
            "server_name": tls.server_name,
        });
        if tls.insecure {
            tls_obj["insecure"] = json!(true);
        }
        if !tls.alpn.is_empty() {
            tls_obj["alpn"] = json!(tls.alpn);
        }
        if let Some(fp) = &tls.fingerprint {
            tls_obj["utls"] = json!({"enabled": true, "fingerprint": fp});
        }
        if tls.kind == TlsKind::Reality {
            tls_obj["reality"] = json!({
                "enabled": true,
                "public_key": tls.public_key.clone().unwrap_or_default(),
                "short_id": tls.short_id.clone().unwrap_or_default(),
            });
        }
        obj["tls"] = tls_obj;
    }

    match &out.transport {
        Transport::Tcp => {}
        Transport::Ws { path, host } => {
            let mut t = json!({"type": "ws", "path": path});
            if let Some(h) = host {
                t["headers"] = json!({"Host": h});
            }
            obj["transport"] = t;
        }
        Transport::Grpc { service_name } => {
            obj["transport"] = json!({"type": "grpc", "service_name": service_name});
        }
    }

    obj
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Provenance, Service, TlsConfig};

    fn tunnel(tag: &str) -> OutboundDescriptor {
        OutboundDescriptor {
            tag: tag.to_string(),
            server: "example.net".to_string(),
            port: 443,
            protocol: ProtocolConfig::Trojan {
                password: "pw".to_string(),
            },
            tls: Some(TlsConfig {
                kind: TlsKind::Tls,
                server_name: "example.net".to_string(),
                fingerprint: None,
                insecure: false,
                alpn: vec![],
                public_key: None,
                short_id: None,
            }),
            transport: Transport::Tcp,
            enabled: true,
            provenance: Provenance::Manual,
        }
    }

    fn input_defaults() -> Settings {
        Settings::default()
    }

    fn tags(config: &Value) -> Vec<String> {
        config["outbounds"]
            .as_array()
            .unwrap()
            .iter()
            .map(|o| o["tag"].as_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn empty_input_still_yields_direct_and_tun() {
        let settings = input_defaults();
        let config = synthesize(&SynthesisInput {
            outbounds: &[],
            groups: &[],
            settings: &settings,
            pins: &[],
            targets: &[],
            engine_version: Some("1.11.0"),
        });
        assert_eq!(tags(&config), vec!["direct"]);
        assert_eq!(config["route"]["final"], "direct");
        let inbounds = config["inbounds"].as_array().unwrap();
        assert_eq!(inbounds.len(), 1);
        assert_eq!(inbounds[0]["type"], "tun");
    }

    #[test]
    fn tunnels_precede_direct_and_first_is_final() {
        let outs = vec![tunnel("a"), tunnel("b")];
        let settings = input_defaults();
        let config = synthesize(&SynthesisInput {
            outbounds: &outs,
            groups: &[],
            settings: &settings,
            pins: &[],
            targets: &[],
            engine_version: Some("1.11.0"),
        });
        assert_eq!(tags(&config), vec!["a", "b", "direct"]);
        assert_eq!(config["route"]["final"], "a");
    }

    #[test]
    fn colliding_tags_get_numeric_suffixes() {
        let outs = vec![tunnel("node"), tunnel("node"), tunnel("node")];
        let settings = input_defaults();
        let config = synthesize(&SynthesisInput {
            outbounds: &outs,
            groups: &[],
            settings: &settings,
            pins: &[],
            targets: &[],
            engine_version: None,
        });
        assert_eq!(tags(&config), vec!["node", "node_1", "node_2", "direct"]);
    }

    #[test]
    fn disabled_outbounds_are_dropped() {
        let mut off = tunnel("off");
        off.enabled = false;
        let outs = vec![off, tunnel("on")];
        let settings = input_defaults();
        let config = synthesize(&SynthesisInput {
            outbounds: &outs,
            groups: &[],
            settings: &settings,
            pins: &[],
            targets: &[],
            engine_version: Some("1.11.0"),
        });
        assert_eq!(tags(&config), vec!["on", "direct"]);
    }

    #[test]
    fn old_engine_gets_legacy_tun_field() {
        let settings = input_defaults();
        let legacy = synthesize(&SynthesisInput {
            outbounds: &[],
            groups: &[],
            settings: &settings,
            pins: &[],
            targets: &[],
            engine_version: Some("1.9.7"),
        });
        let inbound = &legacy["inbounds"][0];
        assert_eq!(inbound["inet4_address"], json!(["10.0.0.1/30"]));
        assert!(inbound.get("address").is_none());

        let modern = synthesize(&SynthesisInput {
            outbounds: &[],
            groups: &[],
            settings: &settings,
            pins: &[],
            targets: &[],
            engine_version: None,
        });
        assert_eq!(modern["inbounds"][0]["address"], json!(["10.0.0.1/30"]));
    }

    #[test]
    fn groups_render_after_direct_with_dead_members_dropped() {
        let outs = vec![tunnel("a"), tunnel("b")];
        let groups = vec![GroupDef {
            id: "g1".to_string(),
            name: "auto".to_string(),
            kind: GroupKind::UrlTest,
            members: vec!["a".to_string(), "gone".to_string(), "b".to_string()],
            interval: "5m".to_string(),
            tolerance: 50,
        }];
        let settings = input_defaults();
        let config = synthesize(&SynthesisInput {
            outbounds: &outs,
            groups: &groups,
            settings: &settings,
            pins: &[],
            targets: &[],
            engine_version: Some("1.11.0"),
        });
        assert_eq!(tags(&config), vec!["a", "b", "direct", "auto"]);
        assert_eq!(
            config["outbounds"][3]["outbounds"],
            json!(["a", "b"])
        );
    }

    #[test]
    fn active_outbound_overrides_final_when_alive() {
        let outs = vec![tunnel("a"), tunnel("b")];
        let mut settings = input_defaults();
        settings.active_outbound = Some("b".to_string());
        let config = synthesize(&SynthesisInput {
            outbounds: &outs,
            groups: &[],
            settings: &settings,
            pins: &[],
            targets: &[],
            engine_version: Some("1.11.0"),
        });
        assert_eq!(config["route"]["final"], "b");

        settings.active_outbound = Some("missing".to_string());
        let config = synthesize(&SynthesisInput {
            outbounds: &outs,
            groups: &[],
            settings: &settings,
            pins: &[],
            targets: &[],
            engine_version: Some("1.11.0"),
        });
        assert_eq!(config["route"]["final"], "a");
    }

    #[test]
    fn pins_become_domain_rules_unless_tag_is_dead() {
        let outs = vec![tunnel("a")];
        let targets = vec![RoutingTarget::Service(Service {
            id: "svc1".to_string(),
            name: "Example".to_string(),
            enabled: true,
            domains: vec!["example.com".to_string()],
            custom_domains: vec![],
            ip_ranges: vec![],
            custom_ips: vec![],
        })];
        let settings = input_defaults();
        let pins = vec![
            RoutePin {
                target_id: "svc1".to_string(),
                outbound: "a".to_string(),
            },
            RoutePin {
                target_id: "svc1".to_string(),
                outbound: "dead".to_string(),
            },
        ];
        let config = synthesize(&SynthesisInput {
            outbounds: &outs,
            groups: &[],
            settings: &settings,
            pins: &pins,
            targets: &targets,
            engine_version: Some("1.11.0"),
        });
        let rules = config["route"]["rules"].as_array().unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0]["outbound"], "a");
        assert_eq!(rules[0]["domain"], json!(["example.com"]));
        assert_eq!(rules[0]["domain_suffix"], json!([".example.com"]));
    }

    #[test]
    fn no_dns_outbound_is_emitted() {
        let outs = vec![tunnel("a")];
        let settings = input_defaults();
        let config = synthesize(&SynthesisInput {
            outbounds: &outs,
            groups: &[],
            settings: &settings,
            pins: &[],
            targets: &[],
            engine_version: Some("1.11.0"),
        });
        assert!(!tags(&config).iter().any(|t| t == "dns"));
        assert!(config.get("dns").is_none());
    }
}

//! Packet classification
//!
//! Two kernel sets decide which destinations are tunneled. The dynamic
//! set is fed by the resolver as clients look up watched domains; the
//! static set holds CIDR ranges known up front. Domain watching works
//! by rewriting a resolver directives file and restarting the resolver.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use log::{info, warn};
use once_cell::sync::OnceCell;

use crate::adapters::{ProcessSupervisor, Shell};
use crate::error::{AppError, Result};
use crate::models::{Device, DeviceMode, RoutingTarget};
use crate::store::write_atomic;
use crate::utils::net::Cidr;

pub const NFT_TABLE: &str = "pinroute";
pub const DYNAMIC_SET: &str = "tunnel_ips";
pub const STATIC_SET: &str = "tunnel_nets";
const DEVICE_SET_PREFIX: &str = "device_";

/// Name of the per-device destination set for a device routing its own
/// service selection.
pub fn device_set_name(device_id: &str) -> String {
    format!("{}{}", DEVICE_SET_PREFIX, device_id.replace('-', "_"))
}

pub struct ClassificationStore {
    shell: Arc<dyn Shell>,
    directives_path: PathBuf,
    dynamic_ttl_secs: u32,
    /// Whether the resolver build supports destination-set directives.
    resolver_feature: OnceCell<bool>,
    /// Serializes flush-and-repopulate cycles.
    lock: Mutex<()>,
}

impl ClassificationStore {
    pub fn new(
        shell: Arc<dyn Shell>,
        directives_path: impl Into<PathBuf>,
        dynamic_ttl_secs: u32,
    ) -> ClassificationStore {
        ClassificationStore {
            shell,
            directives_path: directives_path.into(),
            dynamic_ttl_secs,
            resolver_feature: OnceCell::new(),
            lock: Mutex::new(()),
        }
    }

    /// Rebuild both sets and the resolver directives from the enabled
    /// targets. Safe to call with an empty list; that clears
    /// everything.
    pub fn load(&self, targets: &[RoutingTarget]) -> Result<()> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| AppError::Classifier("classification lock poisoned".to_string()))?;

        let enabled: Vec<&RoutingTarget> = targets.iter().filter(|t| t.enabled()).collect();

        self.ensure_sets()?;
        self.write_directives(&enabled)?;
        self.populate_static(&enabled)?;
        self.sync_device_sets(targets, &enabled)?;
        self.flush_dynamic()?;

        info!(
            "classification loaded: {} enabled targets",
            enabled.len()
        );
        Ok(())
    }

    /// True when the resolver understands destination-set directives.
    /// Probed once per process; a resolver without the feature degrades
    /// domain watching but static ranges keep working.
    pub fn resolver_supported(&self) -> bool {
        *self.resolver_feature.get_or_init(|| {
            match self.shell.try_run("dnsmasq", &["--version"]) {
                Ok(out) if out.success => {
                    let supported = out.stdout.contains("nftset");
                    if !supported {
                        warn!("resolver lacks nftset support, domain watching disabled");
                    }
                    supported
                }
                _ => {
                    warn!("resolver version probe failed, domain watching disabled");
                    false
                }
            }
        })
    }

    fn ensure_sets(&self) -> Result<()> {
        self.nft(&["add", "table", "inet", NFT_TABLE])?;
        let timeout = format!(
            "{{ type ipv4_addr; flags timeout; timeout {}s; }}",
            self.dynamic_ttl_secs
        );
        self.nft(&["add", "set", "inet", NFT_TABLE, DYNAMIC_SET, &timeout])?;
        self.nft(&[
            "add",
            "set",
            "inet",
            NFT_TABLE,
            STATIC_SET,
            "{ type ipv4_addr; flags interval; }",
        ])?;
        Ok(())
    }

    /// One `nftset=` line per watched domain, with the `www.` variant
    /// mirrored so both spellings land in the dynamic set.
    fn write_directives(&self, targets: &[&RoutingTarget]) -> Result<()> {
        if !self.resolver_supported() {
            return Ok(());
        }

        let mut domains: BTreeSet<String> = BTreeSet::new();
        for target in targets {
            for domain in target.domains() {
                let domain = domain.trim().trim_end_matches('.').to_ascii_lowercase();
                if domain.is_empty() {
                    continue;
                }
                match domain.strip_prefix("www.") {
                    Some(bare) => {
                        domains.insert(bare.to_string());
                        domains.insert(domain.clone());
                    }
                    None => {
                        domains.insert(format!("www.{}", domain));
                        domains.insert(domain);
                    }
                }
            }
        }

        let mut content = String::new();
        for domain in &domains {
            content.push_str(&format!(
                "nftset=/{}/4#inet#{}#{}\n",
                domain, NFT_TABLE, DYNAMIC_SET
            ));
        }
        write_atomic(&self.directives_path, &content)?;

        ProcessSupervisor::new(self.shell.as_ref())
            .restart_resolver()
            .map_err(|e| AppError::Classifier(e.to_string()))?;
        Ok(())
    }

    /// Flush and refill the static CIDR set. Invalid entries are
    /// skipped with a warning, never fatal.
    fn populate_static(&self, targets: &[&RoutingTarget]) -> Result<()> {
        self.nft(&["flush", "set", "inet", NFT_TABLE, STATIC_SET])?;

        let mut entries: Vec<&str> = Vec::new();
        for target in targets {
            entries.extend(target.static_entries());
        }
        let nets = collect_cidrs(&entries);
        if nets.is_empty() {
            return Ok(());
        }

        self.add_elements(STATIC_SET, &nets)
    }

    fn add_elements(&self, set: &str, nets: &BTreeSet<Cidr>) -> Result<()> {
        let elements = nets
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        let spec = format!("{{ {} }}", elements);
        self.nft(&["add", "element", "inet", NFT_TABLE, set, &spec])
    }

    /// One destination set per enabled device that routes its own
    /// service selection, filled from the selected services' static
    /// ranges. Sets of removed or re-moded devices are dropped
    /// best-effort; one still referenced by a marking rule goes away
    /// on the next routing start.
    fn sync_device_sets(
        &self,
        all_targets: &[RoutingTarget],
        enabled: &[&RoutingTarget],
    ) -> Result<()> {
        let devices: Vec<&Device> = enabled
            .iter()
            .filter_map(|t| match t {
                RoutingTarget::Device(d) if d.mode == DeviceMode::CustomServiceSet => Some(d),
                _ => None,
            })
            .collect();

        let wanted: BTreeSet<String> = devices.iter().map(|d| device_set_name(&d.id)).collect();
        self.drop_stale_device_sets(&wanted);

        for device in devices {
            let name = device_set_name(&device.id);
            self.nft(&[
                "add",
                "set",
                "inet",
                NFT_TABLE,
                &name,
                "{ type ipv4_addr; flags interval; }",
            ])?;
            self.nft(&["flush", "set", "inet", NFT_TABLE, &name])?;

            // The selection may name services that are globally
            // disabled; a per-device pick works either way.
            let mut entries: Vec<&str> = Vec::new();
            for target in all_targets {
                if device.services.iter().any(|id| id == target.id()) {
                    entries.extend(target.static_entries());
                }
            }
            let nets = collect_cidrs(&entries);
            if !nets.is_empty() {
                self.add_elements(&name, &nets)?;
            }
        }
        Ok(())
    }

    fn drop_stale_device_sets(&self, wanted: &BTreeSet<String>) {
        let listing = match self.shell.try_run("nft", &["list", "sets", "inet", NFT_TABLE]) {
            Ok(out) if out.success => out.stdout,
            _ => return,
        };
        for line in listing.lines() {
            let name = match line.trim().strip_prefix("set ") {
                Some(rest) => rest.split_whitespace().next().unwrap_or(""),
                None => continue,
            };
            if name.starts_with(DEVICE_SET_PREFIX) && !wanted.contains(name) {
                if let Err(e) = self
                    .shell
                    .try_run("nft", &["delete", "set", "inet", NFT_TABLE, name])
                {
                    warn!("could not drop stale device set {}: {}", name, e);
                }
            }
        }
    }

    /// Drop resolver-learned addresses so entries for unwatched domains
    /// age out immediately rather than at TTL expiry.
    fn flush_dynamic(&self) -> Result<()> {
        self.nft(&["flush", "set", "inet", NFT_TABLE, DYNAMIC_SET])
    }

    /// Element count of a set, for health reporting.
    pub fn set_cardinality(&self, set: &str) -> Option<usize> {
        let out = self
            .shell
            .try_run("nft", &["list", "set", "inet", NFT_TABLE, set])
            .ok()?;
        if !out.success {
            return None;
        }
        let start = out.stdout.find("elements = {")?;
        let rest = &out.stdout[start + "elements = {".len()..];
        let end = rest.find('}')?;
        let body = rest[..end].trim();
        if body.is_empty() {
            return Some(0);
        }
        Some(body.split(',').count())
    }

    fn nft(&self, args: &[&str]) -> Result<()> {
        self.shell
            .run("nft", args)
            .map_err(|e| AppError::Classifier(e.to_string()))?;
        Ok(())
    }
}

/// Normalize raw address entries into set elements. Invalid entries
/// and private or loopback ranges are skipped with a warning; the
/// marking chains exclude those destinations, so an element there
/// could never match.
fn collect_cidrs(entries: &[&str]) -> BTreeSet<Cidr> {
    let mut nets = BTreeSet::new();
    for entry in entries {
        match Cidr::parse(entry) {
            Some(cidr) if cidr.is_private_or_loopback() => {
                warn!("skipping private or loopback entry '{}'", entry)
            }
            Some(cidr) => {
                nets.insert(cidr);
            }
            None => warn!("skipping invalid address entry '{}'", entry),
        }
    }
    nets
}

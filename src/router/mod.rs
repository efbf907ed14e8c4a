//! Policy routing
//!
//! Marks connections whose destination sits in one of the
//! classification sets, then steers marked packets through a dedicated
//! routing table whose only route is the tunnel interface. Marks are
//! promoted to conntrack and back so established flows stay on their
//! path in both directions.

use std::sync::Arc;

use log::{info, warn};

use crate::adapters::{ProcessSupervisor, Shell};
use crate::classify::{device_set_name, DYNAMIC_SET, NFT_TABLE, STATIC_SET};
use crate::error::{AppError, Result};
use crate::models::{Device, DeviceMode, Settings};

/// Networks a mark must never be applied to.
const EXCLUDED_DST: &str = "{ 10.0.0.0/8, 172.16.0.0/12, 192.168.0.0/16, 127.0.0.0/8 }";

const MARK_CHAINS: [(&str, &str); 2] = [
    ("prerouting", "type filter hook prerouting priority mangle; policy accept;"),
    ("output", "type filter hook output priority mangle; policy accept;"),
];
const FORWARD_CHAIN: (&str, &str) =
    ("forward", "type filter hook forward priority mangle; policy accept;");

pub struct PolicyRouter {
    shell: Arc<dyn Shell>,
}

impl PolicyRouter {
    pub fn new(shell: Arc<dyn Shell>) -> PolicyRouter {
        PolicyRouter { shell }
    }

    /// Install the full marking and routing stack. Any failure tears
    /// down whatever was installed before returning the error; the
    /// host is never left half-routed.
    pub fn start(&self, settings: &Settings, devices: &[Device]) -> Result<()> {
        let sup = ProcessSupervisor::new(self.shell.as_ref());
        if !sup.interface_exists(&settings.tun_interface) {
            return Err(AppError::Route(format!(
                "tunnel interface {} does not exist",
                settings.tun_interface
            )));
        }

        if let Err(e) = self.install(settings, devices) {
            warn!("routing install failed, rolling back: {}", e);
            self.teardown(settings);
            return Err(e);
        }
        info!(
            "policy routing active: mark {:#x} via table {}",
            settings.mark, settings.route_table
        );
        Ok(())
    }

    /// Remove every routing artifact. Failures of individual removals
    /// are ignored; missing pieces mean routing was already down.
    pub fn stop(&self, settings: &Settings) -> Result<()> {
        self.teardown(settings);
        info!("policy routing stopped");
        Ok(())
    }

    /// True when the fwmark rule is installed.
    pub fn is_active(&self, settings: &Settings) -> bool {
        match self.shell.try_run("ip", &["rule", "list"]) {
            Ok(out) if out.success => {
                let needle = format!("fwmark {:#x}", settings.mark);
                out.stdout.contains(&needle)
                    || out.stdout.contains(&format!("fwmark {}", settings.mark))
            }
            _ => false,
        }
    }

    /// Rule count per marking chain, for health reporting. `None` when
    /// the table or a chain is absent.
    pub fn chain_rule_counts(&self) -> Option<std::collections::BTreeMap<String, usize>> {
        let mut counts = std::collections::BTreeMap::new();
        for chain in ["prerouting", "output", "forward"] {
            let out = self
                .shell
                .try_run("nft", &["list", "chain", "inet", NFT_TABLE, chain])
                .ok()?;
            if !out.success {
                return None;
            }
            let rules = out
                .stdout
                .lines()
                .map(str::trim)
                .filter(|l| {
                    !l.is_empty()
                        && !l.starts_with("table ")
                        && !l.starts_with("chain ")
                        && !l.starts_with("type ")
                        && *l != "}"
                })
                .count();
            counts.insert(chain.to_string(), rules);
        }
        Some(counts)
    }

    fn install(&self, settings: &Settings, devices: &[Device]) -> Result<()> {
        let mark = format!("{:#x}", settings.mark);

        self.nft(&["add", "table", "inet", NFT_TABLE])?;

        for (chain, spec) in MARK_CHAINS {
            let spec_arg = format!("{{ {} }}", spec);
            self.nft(&["add", "chain", "inet", NFT_TABLE, chain, &spec_arg])?;
            self.nft(&["flush", "chain", "inet", NFT_TABLE, chain])?;

            // Private and loopback destinations leave the chain before
            // any mark can be applied.
            self.nft_rule(chain, &format!("ip daddr {} return", EXCLUDED_DST))?;
            self.nft_rule(chain, &format!("ct mark {} meta mark set {}", mark, mark))?;
            // LAN sources only ever enter through prerouting.
            if chain == "prerouting" {
                self.device_rules(chain, devices, &mark)?;
            }
            self.nft_rule(
                chain,
                &format!("ct state new ip daddr @{} meta mark set {}", DYNAMIC_SET, mark),
            )?;
            self.nft_rule(
                chain,
                &format!("ct state new ip daddr @{} meta mark set {}", STATIC_SET, mark),
            )?;
            self.nft_rule(chain, &format!("meta mark {} ct mark set {}", mark, mark))?;
        }

        // Forwarded replies only need the mark restored.
        let (chain, spec) = FORWARD_CHAIN;
        let spec_arg = format!("{{ {} }}", spec);
        self.nft(&["add", "chain", "inet", NFT_TABLE, chain, &spec_arg])?;
        self.nft(&["flush", "chain", "inet", NFT_TABLE, chain])?;
        self.nft_rule(chain, &format!("ct mark {} meta mark set {}", mark, mark))?;

        let table = settings.route_table.to_string();
        let priority = settings.rule_priority.to_string();

        // Replace any stale rule from a previous run.
        let _ = self.shell.try_run(
            "ip",
            &["rule", "del", "fwmark", &mark, "table", &table, "priority", &priority],
        );
        self.ip(&["rule", "add", "fwmark", &mark, "table", &table, "priority", &priority])?;
        self.ip(&[
            "route",
            "replace",
            "default",
            "dev",
            &settings.tun_interface,
            "table",
            &table,
        ])?;
        Ok(())
    }

    /// Per-device overrides, evaluated before the global set rules.
    /// All-direct devices leave the chain unmarked; all-tunnel devices
    /// mark every new connection. A device with its own service
    /// selection marks against its own set and must save that mark to
    /// conntrack before its skip-global return.
    fn device_rules(&self, chain: &str, devices: &[Device], mark: &str) -> Result<()> {
        let enabled = |mode: DeviceMode| {
            devices
                .iter()
                .filter(move |d| d.enabled && d.mode == mode)
        };

        for device in enabled(DeviceMode::AllDirect) {
            self.nft_rule(chain, &format!("ip saddr {} return", device.ip))?;
        }
        for device in enabled(DeviceMode::AllTunnel) {
            self.nft_rule(
                chain,
                &format!("ip saddr {} ct state new meta mark set {}", device.ip, mark),
            )?;
        }
        for device in enabled(DeviceMode::CustomServiceSet) {
            let set = device_set_name(&device.id);
            self.nft_rule(
                chain,
                &format!(
                    "ip saddr {} ct state new ip daddr @{} meta mark set {}",
                    device.ip, set, mark
                ),
            )?;
            self.nft_rule(
                chain,
                &format!("ip saddr {} meta mark {} ct mark set {}", device.ip, mark, mark),
            )?;
            self.nft_rule(chain, &format!("ip saddr {} return", device.ip))?;
        }
        Ok(())
    }

    fn teardown(&self, settings: &Settings) {
        let mark = format!("{:#x}", settings.mark);
        let table = settings.route_table.to_string();
        let priority = settings.rule_priority.to_string();

        let _ = self.shell.try_run(
            "ip",
            &["rule", "del", "fwmark", &mark, "table", &table, "priority", &priority],
        );
        let _ = self
            .shell
            .try_run("ip", &["route", "flush", "table", &table]);
        // The chains go but the table stays: the classification sets
        // live in the same table and must survive a routing stop.
        for chain in ["prerouting", "output", "forward"] {
            let _ = self
                .shell
                .try_run("nft", &["delete", "chain", "inet", NFT_TABLE, chain]);
        }
    }

    fn nft_rule(&self, chain: &str, rule: &str) -> Result<()> {
        let mut args = vec!["add", "rule", "inet", NFT_TABLE, chain];
        args.extend(rule.split_whitespace());
        self.nft(&args)
    }

    fn nft(&self, args: &[&str]) -> Result<()> {
        self.shell
            .run("nft", args)
            .map_err(|e| AppError::Route(e.to_string()))?;
        Ok(())
    }

    fn ip(&self, args: &[&str]) -> Result<()> {
        self.shell
            .run("ip", args)
            .map_err(|e| AppError::Route(e.to_string()))?;
        Ok(())
    }
}

//! Derived health reporting
//!
//! Every field is observed at request time from the kernel and the
//! running processes; nothing here is ever persisted, so the report
//! can not go stale or disagree with the host.

use std::sync::Arc;

use serde::Serialize;

use crate::adapters::{ProcessSupervisor, Shell};
use crate::classify::{ClassificationStore, DYNAMIC_SET, NFT_TABLE, STATIC_SET};
use crate::error::Result;
use crate::orchestrator::{ApplyState, Orchestrator, Stores};
use crate::router::PolicyRouter;

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub apply_state: ApplyState,
    pub engine_running: bool,
    pub engine_version: Option<String>,
    pub interface_up: bool,
    pub routing_active: bool,
    pub resolver_running: bool,
    pub resolver_feature: bool,
    pub nft_table_present: bool,
    /// Rule count per marking chain, absent when routing is down.
    pub chain_rules: Option<std::collections::BTreeMap<String, usize>>,
    pub dynamic_set_size: Option<usize>,
    pub static_set_size: Option<usize>,
    pub enabled_targets: usize,
}

pub struct StatusReporter {
    shell: Arc<dyn Shell>,
    stores: Arc<Stores>,
    classifier: Arc<ClassificationStore>,
    router: Arc<PolicyRouter>,
}

impl StatusReporter {
    pub fn new(
        shell: Arc<dyn Shell>,
        stores: Arc<Stores>,
        classifier: Arc<ClassificationStore>,
        router: Arc<PolicyRouter>,
    ) -> StatusReporter {
        StatusReporter {
            shell,
            stores,
            classifier,
            router,
        }
    }

    pub fn report(&self, orchestrator: &Orchestrator) -> Result<HealthReport> {
        let settings = self.stores.settings.load()?;
        let sup = ProcessSupervisor::new(self.shell.as_ref());

        let enabled_targets = self
            .stores
            .collect_targets()?
            .iter()
            .filter(|t| t.enabled())
            .count();

        Ok(HealthReport {
            apply_state: orchestrator.state(),
            engine_running: sup.engine_running(),
            engine_version: orchestrator.engine_version(),
            interface_up: sup.interface_exists(&settings.tun_interface),
            routing_active: self.router.is_active(&settings),
            resolver_running: self.resolver_running(),
            resolver_feature: self.classifier.resolver_supported(),
            nft_table_present: self.nft_table_present(),
            chain_rules: self.router.chain_rule_counts(),
            dynamic_set_size: self.classifier.set_cardinality(DYNAMIC_SET),
            static_set_size: self.classifier.set_cardinality(STATIC_SET),
            enabled_targets,
        })
    }

    fn resolver_running(&self) -> bool {
        matches!(
            self.shell.try_run("pidof", &["dnsmasq"]),
            Ok(out) if out.success && !out.stdout.trim().is_empty()
        )
    }

    fn nft_table_present(&self) -> bool {
        matches!(
            self.shell.try_run("nft", &["list", "table", "inet", NFT_TABLE]),
            Ok(out) if out.success
        )
    }
}

//! Apply orchestration
//!
//! One entry point turns the persisted documents into a running
//! system: synthesize the engine config, bounce the engine, wait for
//! its interface, reload classification, then bring up policy routing.
//! There is no rollback; a stage failure leaves the earlier stages
//! standing and records which stage broke.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{info, warn};
use once_cell::sync::OnceCell;
use serde::Serialize;

use crate::adapters::{ProcessSupervisor, Shell};
use crate::classify::ClassificationStore;
use crate::error::{AppError, Result};
use crate::generator::{persist_config, synthesize, SynthesisInput};
use crate::models::{
    CustomService, Device, GroupDef, OutboundDescriptor, RoutePin, RoutingTarget, Service,
    Settings,
};
use crate::router::PolicyRouter;
use crate::store::JsonStore;

const IFACE_POLL_ATTEMPTS: u32 = 5;
const IFACE_POLL_DELAY: Duration = Duration::from_secs(1);

/// Lifecycle of the applied configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ApplyState {
    Stopped,
    Initializing,
    Applying,
    Ready,
    /// A stage failed; earlier stages remain in effect.
    Degraded { stage: String },
}

pub struct Stores {
    pub outbounds: Arc<JsonStore<Vec<OutboundDescriptor>>>,
    pub groups: Arc<JsonStore<Vec<GroupDef>>>,
    pub settings: Arc<JsonStore<Settings>>,
    pub pins: Arc<JsonStore<Vec<RoutePin>>>,
    pub services: Arc<JsonStore<Vec<Service>>>,
    pub custom_services: Arc<JsonStore<Vec<CustomService>>>,
    pub devices: Arc<JsonStore<Vec<Device>>>,
}

impl Stores {
    /// All routing targets, enabled or not. Filtering happens at the
    /// consumer.
    pub fn collect_targets(&self) -> Result<Vec<RoutingTarget>> {
        let mut targets: Vec<RoutingTarget> = Vec::new();
        targets.extend(self.services.load()?.into_iter().map(RoutingTarget::Service));
        targets.extend(
            self.custom_services
                .load()?
                .into_iter()
                .map(RoutingTarget::Custom),
        );
        targets.extend(self.devices.load()?.into_iter().map(RoutingTarget::Device));
        Ok(targets)
    }
}

pub struct Orchestrator {
    shell: Arc<dyn Shell>,
    stores: Arc<Stores>,
    classifier: Arc<ClassificationStore>,
    router: Arc<PolicyRouter>,
    engine_config: PathBuf,
    engine_version: OnceCell<Option<String>>,
    state: Mutex<ApplyState>,
}

impl Orchestrator {
    pub fn new(
        shell: Arc<dyn Shell>,
        stores: Arc<Stores>,
        classifier: Arc<ClassificationStore>,
        router: Arc<PolicyRouter>,
        engine_config: impl Into<PathBuf>,
    ) -> Orchestrator {
        Orchestrator {
            shell,
            stores,
            classifier,
            router,
            engine_config: engine_config.into(),
            engine_version: OnceCell::new(),
            state: Mutex::new(ApplyState::Stopped),
        }
    }

    pub fn state(&self) -> ApplyState {
        self.state
            .lock()
            .map(|s| s.clone())
            .unwrap_or(ApplyState::Degraded {
                stage: "state".to_string(),
            })
    }

    fn set_state(&self, state: ApplyState) {
        if let Ok(mut s) = self.state.lock() {
            *s = state;
        }
    }

    /// Installed engine version, probed once per process.
    pub fn engine_version(&self) -> Option<String> {
        self.engine_version
            .get_or_init(|| ProcessSupervisor::new(self.shell.as_ref()).engine_version())
            .clone()
    }

    /// Run the full apply pipeline.
    pub async fn apply(&self) -> Result<ApplyState> {
        match self.run_stages().await {
            Ok(()) => {
                self.set_state(ApplyState::Ready);
                info!("apply complete");
                Ok(ApplyState::Ready)
            }
            Err(AppError::ApplyStage { stage, message }) => {
                warn!("apply degraded at stage {}: {}", stage, message);
                let state = ApplyState::Degraded {
                    stage: stage.clone(),
                };
                self.set_state(state.clone());
                Err(AppError::ApplyStage { stage, message })
            }
            Err(e) => {
                self.set_state(ApplyState::Degraded {
                    stage: "unknown".to_string(),
                });
                Err(e)
            }
        }
    }

    async fn run_stages(&self) -> Result<()> {
        // Initializing covers getting the engine and its interface up;
        // Applying covers pushing classification and routing onto it.
        self.set_state(ApplyState::Initializing);
        self.synthesize_stage()
            .map_err(|e| AppError::apply_stage("synthesize", e))?;
        self.engine_stage()
            .await
            .map_err(|e| AppError::apply_stage("engine", e))?;
        self.set_state(ApplyState::Applying);
        self.classify_stage()
            .map_err(|e| AppError::apply_stage("classify", e))?;
        self.route_stage()
            .map_err(|e| AppError::apply_stage("route", e))?;
        Ok(())
    }

    fn synthesize_stage(&self) -> Result<()> {
        let outbounds = self.stores.outbounds.load()?;
        let groups = self.stores.groups.load()?;
        let settings = self.stores.settings.load()?;
        let pins = self.stores.pins.load()?;
        let targets = self.stores.collect_targets()?;
        let version = self.engine_version();

        let config = synthesize(&SynthesisInput {
            outbounds: &outbounds,
            groups: &groups,
            settings: &settings,
            pins: &pins,
            targets: &targets,
            engine_version: version.as_deref(),
        });
        persist_config(&self.engine_config, &config)
    }

    async fn engine_stage(&self) -> Result<()> {
        let settings = self.stores.settings.load()?;
        let sup = ProcessSupervisor::new(self.shell.as_ref());
        sup.restart_engine()?;

        for attempt in 1..=IFACE_POLL_ATTEMPTS {
            if sup.interface_exists(&settings.tun_interface) {
                info!(
                    "interface {} up after {} poll(s)",
                    settings.tun_interface, attempt
                );
                return Ok(());
            }
            tokio::time::sleep(IFACE_POLL_DELAY).await;
        }
        Err(AppError::Supervisor(format!(
            "interface {} did not appear within {}s",
            settings.tun_interface, IFACE_POLL_ATTEMPTS
        )))
    }

    fn classify_stage(&self) -> Result<()> {
        let targets = self.stores.collect_targets()?;
        self.classifier.load(&targets)
    }

    fn route_stage(&self) -> Result<()> {
        let settings = self.stores.settings.load()?;
        let devices = self.stores.devices.load()?;
        self.router.start(&settings, &devices)
    }

    /// Reload classification only, for target edits that do not touch
    /// the engine config.
    pub fn reload_classification(&self) -> Result<()> {
        self.classify_stage()
    }

    /// Bring routing up without a full apply.
    pub fn start_routing(&self) -> Result<()> {
        self.route_stage()
    }

    /// Synthesize and persist the engine config without touching the
    /// running system.
    pub fn persist_engine_config(&self) -> Result<()> {
        self.synthesize_stage()
    }

    /// Tear down policy routing. The engine keeps running; traffic
    /// simply stops being steered through it.
    pub fn stop(&self) -> Result<()> {
        let settings = self.stores.settings.load()?;
        self.router.stop(&settings)?;
        self.set_state(ApplyState::Stopped);
        Ok(())
    }

    /// Routing teardown without touching the lifecycle state.
    pub fn stop_routing(&self) -> Result<()> {
        let settings = self.stores.settings.load()?;
        self.router.stop(&settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::ScriptedShell;
    use tempfile::tempdir;

    fn stores(dir: &std::path::Path) -> Arc<Stores> {
        Arc::new(Stores {
            outbounds: Arc::new(JsonStore::new(dir.join("outbounds.json"))),
            groups: Arc::new(JsonStore::new(dir.join("groups.json"))),
            settings: Arc::new(JsonStore::new(dir.join("settings.json"))),
            pins: Arc::new(JsonStore::new(dir.join("pins.json"))),
            services: Arc::new(JsonStore::new(dir.join("services.json"))),
            custom_services: Arc::new(JsonStore::new(dir.join("custom.json"))),
            devices: Arc::new(JsonStore::new(dir.join("devices.json"))),
        })
    }

    fn orchestrator(shell: Arc<ScriptedShell>, dir: &std::path::Path) -> Orchestrator {
        let stores = stores(dir);
        let classifier = Arc::new(ClassificationStore::new(
            shell.clone(),
            dir.join("pinroute.conf"),
            3600,
        ));
        let router = Arc::new(PolicyRouter::new(shell.clone()));
        Orchestrator::new(shell, stores, classifier, router, dir.join("config.json"))
    }

    fn happy_shell() -> ScriptedShell {
        ScriptedShell::new()
            .respond("sing-box version", true, "sing-box version 1.11.3\n")
            .respond("dnsmasq --version", true, "options: nftset\n")
    }

    #[tokio::test]
    async fn apply_reaches_ready_and_writes_config() {
        let dir = tempdir().unwrap();
        let shell = Arc::new(happy_shell());
        let orch = orchestrator(shell.clone(), dir.path());

        assert_eq!(orch.apply().await.unwrap(), ApplyState::Ready);
        assert_eq!(orch.state(), ApplyState::Ready);

        let config: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join("config.json")).unwrap())
                .unwrap();
        assert_eq!(config["route"]["final"], "direct");

        let calls = shell.recorded();
        let restart = calls
            .iter()
            .position(|c| c == "/etc/init.d/sing-box restart")
            .unwrap();
        let route = calls
            .iter()
            .position(|c| c.starts_with("ip rule add"))
            .unwrap();
        assert!(restart < route);
    }

    #[tokio::test(start_paused = true)]
    async fn apply_initializes_while_waiting_for_the_interface() {
        let dir = tempdir().unwrap();
        let shell = Arc::new(happy_shell().respond("ip link show tun1", false, ""));
        let orch = Arc::new(orchestrator(shell, dir.path()));

        let task = tokio::spawn({
            let orch = orch.clone();
            async move { orch.apply().await }
        });
        // The pipeline is now inside the interface poll loop.
        tokio::task::yield_now().await;
        assert_eq!(orch.state(), ApplyState::Initializing);

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, AppError::ApplyStage { ref stage, .. } if stage == "engine"));
        assert_eq!(
            orch.state(),
            ApplyState::Degraded {
                stage: "engine".to_string()
            }
        );
    }

    #[tokio::test]
    async fn engine_failure_degrades_at_engine_stage() {
        let dir = tempdir().unwrap();
        let shell = Arc::new(
            ScriptedShell::new()
                .respond("sing-box version", true, "sing-box version 1.11.3\n")
                .respond("/etc/init.d/sing-box restart", false, ""),
        );
        let orch = orchestrator(shell, dir.path());

        let err = orch.apply().await.unwrap_err();
        assert!(matches!(err, AppError::ApplyStage { ref stage, .. } if stage == "engine"));
        assert_eq!(
            orch.state(),
            ApplyState::Degraded {
                stage: "engine".to_string()
            }
        );
        // The synthesized config survives the failed stage.
        assert!(dir.path().join("config.json").exists());
    }

    #[tokio::test]
    async fn stop_removes_routing_but_leaves_the_engine() {
        let dir = tempdir().unwrap();
        let shell = Arc::new(happy_shell());
        let orch = orchestrator(shell.clone(), dir.path());
        orch.apply().await.unwrap();
        orch.stop().unwrap();
        assert_eq!(orch.state(), ApplyState::Stopped);

        let calls = shell.recorded();
        assert!(calls.iter().any(|c| c.starts_with("ip rule del fwmark")));
        assert!(!calls.iter().any(|c| c == "/etc/init.d/sing-box stop"));
    }
}

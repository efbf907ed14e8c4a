//! HTTP interface
//!
//! JSON endpoints over actix-web. Every response uses the same
//! envelope: `{"success": true, "data": ...}` or
//! `{"success": false, "error": "..."}`.

pub mod interfaces;

use std::sync::Arc;

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde::Serialize;
use serde_json::json;

use crate::adapters::Shell;
use crate::classify::ClassificationStore;
use crate::error::AppError;
use crate::health::StatusReporter;
use crate::models::SubscriptionSource;
use crate::orchestrator::{Orchestrator, Stores};
use crate::router::PolicyRouter;
use crate::store::JsonStore;
use crate::subscriptions::SubscriptionManager;

/// Shared application state handed to every handler.
pub struct AppState {
    pub stores: Arc<Stores>,
    pub subscriptions_store: Arc<JsonStore<Vec<SubscriptionSource>>>,
    pub shell: Arc<dyn Shell>,
    pub subscriptions: SubscriptionManager,
    pub classifier: Arc<ClassificationStore>,
    pub router: Arc<PolicyRouter>,
    pub orchestrator: Arc<Orchestrator>,
    pub reporter: StatusReporter,
}

impl AppState {
    /// Wire up every component over one data directory. The engine
    /// config and resolver directives live wherever the host expects
    /// them, outside the data directory.
    pub fn build(
        data_dir: &std::path::Path,
        engine_config: std::path::PathBuf,
        resolver_conf: std::path::PathBuf,
        shell: Arc<dyn Shell>,
    ) -> crate::error::Result<Arc<AppState>> {
        let stores = Arc::new(Stores {
            outbounds: Arc::new(JsonStore::new(data_dir.join("outbounds.json"))),
            groups: Arc::new(JsonStore::new(data_dir.join("groups.json"))),
            settings: Arc::new(JsonStore::new(data_dir.join("settings.json"))),
            pins: Arc::new(JsonStore::new(data_dir.join("pins.json"))),
            services: Arc::new(JsonStore::new(data_dir.join("services.json"))),
            custom_services: Arc::new(JsonStore::new(data_dir.join("custom_services.json"))),
            devices: Arc::new(JsonStore::new(data_dir.join("devices.json"))),
        });
        let subscriptions_store: Arc<JsonStore<Vec<SubscriptionSource>>> =
            Arc::new(JsonStore::new(data_dir.join("subscriptions.json")));

        let settings = stores.settings.load()?;
        let classifier = Arc::new(ClassificationStore::new(
            shell.clone(),
            resolver_conf,
            settings.dynamic_ttl_secs,
        ));
        let router = Arc::new(PolicyRouter::new(shell.clone()));
        let orchestrator = Arc::new(Orchestrator::new(
            shell.clone(),
            stores.clone(),
            classifier.clone(),
            router.clone(),
            engine_config,
        ));
        let reporter = StatusReporter::new(
            shell.clone(),
            stores.clone(),
            classifier.clone(),
            router.clone(),
        );
        let subscriptions = SubscriptionManager::new(
            subscriptions_store.clone(),
            stores.outbounds.clone(),
            data_dir.join("cache"),
        )?;

        Ok(Arc::new(AppState {
            stores,
            subscriptions_store,
            shell,
            subscriptions,
            classifier,
            router,
            orchestrator,
            reporter,
        }))
    }
}

pub(crate) fn ok_json(data: impl Serialize) -> HttpResponse {
    HttpResponse::Ok().json(json!({"success": true, "data": data}))
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Parse(_) | AppError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code())
            .json(json!({"success": false, "error": self.to_string()}))
    }
}

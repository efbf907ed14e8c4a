use std::sync::Arc;
use std::time::{Duration, Instant};

use actix_web::{web, HttpResponse};
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{AppError, Result};
use crate::models::{
    CustomService, Device, GroupDef, OutboundDescriptor, Provenance, RoutePin, Service, Settings,
    SubscriptionSource,
};
use crate::parser::{explode, share_link};

use super::{ok_json, AppState};

const LATENCY_TIMEOUT: Duration = Duration::from_secs(5);

type State = web::Data<Arc<AppState>>;

// ---- status ----

async fn status_handler(state: State) -> Result<HttpResponse> {
    let report = state.reporter.report(&state.orchestrator)?;
    Ok(ok_json(report))
}

// ---- outbounds ----

async fn list_outbounds(state: State) -> Result<HttpResponse> {
    Ok(ok_json(state.stores.outbounds.load()?))
}

async fn create_outbound(
    state: State,
    body: web::Json<OutboundDescriptor>,
) -> Result<HttpResponse> {
    let mut out = body.into_inner();
    out.provenance = Provenance::Manual;
    if out.tag.trim().is_empty() {
        return Err(AppError::InvalidArgument("outbound tag is empty".to_string()));
    }
    state.stores.outbounds.update(|outs| {
        if outs.iter().any(|o| o.tag == out.tag) {
            return Err(AppError::InvalidArgument(format!(
                "outbound '{}' already exists",
                out.tag
            )));
        }
        outs.push(out.clone());
        Ok(())
    })?;
    Ok(ok_json(out))
}

async fn update_outbound(
    state: State,
    path: web::Path<String>,
    body: web::Json<OutboundDescriptor>,
) -> Result<HttpResponse> {
    let tag = path.into_inner();
    let updated = body.into_inner();
    let new_tag = updated.tag.clone();
    state.stores.outbounds.update(|outs| {
        // A rename must not land on another outbound's tag.
        if new_tag != tag && outs.iter().any(|o| o.tag == new_tag) {
            return Err(AppError::InvalidArgument(format!(
                "outbound '{}' already exists",
                new_tag
            )));
        }
        let slot = outs
            .iter_mut()
            .find(|o| o.tag == tag)
            .ok_or_else(|| AppError::NotFound(format!("outbound {}", tag)))?;
        // Provenance is never editable from outside.
        let provenance = slot.provenance.clone();
        *slot = updated.clone();
        slot.provenance = provenance;
        Ok(())
    })?;
    Ok(ok_json(json!({"tag": new_tag})))
}

async fn toggle_outbound(state: State, path: web::Path<String>) -> Result<HttpResponse> {
    let tag = path.into_inner();
    let enabled = state.stores.outbounds.update(|outs| {
        let slot = outs
            .iter_mut()
            .find(|o| o.tag == tag)
            .ok_or_else(|| AppError::NotFound(format!("outbound {}", tag)))?;
        slot.enabled = !slot.enabled;
        Ok(slot.enabled)
    })?;
    Ok(ok_json(json!({"tag": tag, "enabled": enabled})))
}

async fn delete_outbound(state: State, path: web::Path<String>) -> Result<HttpResponse> {
    let tag = path.into_inner();
    state.stores.outbounds.update(|outs| {
        let before = outs.len();
        outs.retain(|o| o.tag != tag);
        if outs.len() == before {
            return Err(AppError::NotFound(format!("outbound {}", tag)));
        }
        Ok(())
    })?;
    Ok(ok_json(json!({"deleted": tag})))
}

#[derive(Deserialize)]
struct ImportLink {
    link: String,
}

async fn import_link(state: State, body: web::Json<ImportLink>) -> Result<HttpResponse> {
    let out = explode(&body.link)
        .ok_or_else(|| AppError::Parse("unrecognized or malformed share link".to_string()))?;
    let out = push_imported(&state, out)?;
    Ok(ok_json(out))
}

#[derive(Deserialize)]
struct ImportBatch {
    content: String,
}

/// Import a pasted block of share links, one per line. Bad lines are
/// skipped and counted.
async fn import_batch(state: State, body: web::Json<ImportBatch>) -> Result<HttpResponse> {
    let mut imported = Vec::new();
    let mut failed = 0;
    for line in body.content.lines().map(str::trim).filter(|l| !l.is_empty()) {
        match explode(line) {
            Some(out) => match push_imported(&state, out) {
                Ok(out) => imported.push(out.tag),
                Err(_) => failed += 1,
            },
            None => failed += 1,
        }
    }
    Ok(ok_json(json!({"imported": imported, "failed": failed})))
}

fn push_imported(state: &AppState, mut out: OutboundDescriptor) -> Result<OutboundDescriptor> {
    out.provenance = Provenance::Manual;
    state.stores.outbounds.update(|outs| {
        let mut seen: std::collections::HashSet<String> =
            outs.iter().map(|o| o.tag.clone()).collect();
        out.tag = crate::generator::unique_tag(&mut seen, &out.tag);
        outs.push(out.clone());
        Ok(())
    })?;
    Ok(out)
}

/// Re-serialize every link-representable outbound for sharing.
async fn export_links(state: State) -> Result<HttpResponse> {
    let links: Vec<String> = state
        .stores
        .outbounds
        .load()?
        .iter()
        .filter_map(share_link)
        .collect();
    Ok(ok_json(links))
}

/// Measure a TCP connect to the outbound's server. Runs only when
/// asked for; never on the request path of anything else.
async fn check_outbound(state: State, path: web::Path<String>) -> Result<HttpResponse> {
    let tag = path.into_inner();
    let out = state
        .stores
        .outbounds
        .load()?
        .into_iter()
        .find(|o| o.tag == tag)
        .ok_or_else(|| AppError::NotFound(format!("outbound {}", tag)))?;
    if !out.is_tunnel() {
        return Err(AppError::InvalidArgument(format!(
            "outbound '{}' has no server to probe",
            tag
        )));
    }

    let addr = format!("{}:{}", out.server, out.port);
    let started = Instant::now();
    let result = tokio::time::timeout(LATENCY_TIMEOUT, tokio::net::TcpStream::connect(&addr)).await;
    match result {
        Ok(Ok(_)) => Ok(ok_json(json!({
            "tag": tag,
            "reachable": true,
            "latency_ms": started.elapsed().as_millis() as u64,
        }))),
        Ok(Err(e)) => Ok(ok_json(json!({
            "tag": tag,
            "reachable": false,
            "error": e.to_string(),
        }))),
        Err(_) => Ok(ok_json(json!({
            "tag": tag,
            "reachable": false,
            "error": format!("timed out after {}s", LATENCY_TIMEOUT.as_secs()),
        }))),
    }
}

// ---- subscriptions ----

async fn list_subscriptions(state: State) -> Result<HttpResponse> {
    Ok(ok_json(state.subscriptions.list()?))
}

#[derive(Deserialize)]
struct NewSubscription {
    name: String,
    url: String,
}

async fn add_subscription(state: State, body: web::Json<NewSubscription>) -> Result<HttpResponse> {
    let outcome = state.subscriptions.add(&body.name, &body.url).await?;
    Ok(ok_json(json!({
        "id": outcome.id,
        "node_count": outcome.node_count,
        "fetched": outcome.fetched,
    })))
}

async fn refresh_subscription(state: State, path: web::Path<String>) -> Result<HttpResponse> {
    let outcome = state.subscriptions.refresh(&path.into_inner()).await?;
    Ok(ok_json(json!({
        "id": outcome.id,
        "node_count": outcome.node_count,
        "fetched": outcome.fetched,
        "failed_items": outcome.failed_items,
    })))
}

async fn refresh_all_subscriptions(state: State) -> Result<HttpResponse> {
    let outcomes = state.subscriptions.refresh_all().await?;
    let summary: Vec<_> = outcomes
        .iter()
        .map(|o| json!({"id": o.id, "node_count": o.node_count, "fetched": o.fetched}))
        .collect();
    Ok(ok_json(summary))
}

async fn delete_subscription(state: State, path: web::Path<String>) -> Result<HttpResponse> {
    let id = path.into_inner();
    state.subscriptions.delete(&id)?;
    Ok(ok_json(json!({"deleted": id})))
}

// ---- groups ----

async fn list_groups(state: State) -> Result<HttpResponse> {
    Ok(ok_json(state.stores.groups.load()?))
}

async fn create_group(state: State, body: web::Json<GroupDef>) -> Result<HttpResponse> {
    let group = body.into_inner();
    if group.members.is_empty() {
        return Err(AppError::InvalidArgument("group has no members".to_string()));
    }
    state.stores.groups.update(|groups| {
        if groups.iter().any(|g| g.id == group.id) {
            return Err(AppError::InvalidArgument(format!(
                "group '{}' already exists",
                group.id
            )));
        }
        groups.push(group.clone());
        Ok(())
    })?;
    Ok(ok_json(group))
}

async fn delete_group(state: State, path: web::Path<String>) -> Result<HttpResponse> {
    let id = path.into_inner();
    state.stores.groups.update(|groups| {
        let before = groups.len();
        groups.retain(|g| g.id != id);
        if groups.len() == before {
            return Err(AppError::NotFound(format!("group {}", id)));
        }
        Ok(())
    })?;
    Ok(ok_json(json!({"deleted": id})))
}

// ---- pins and settings ----

async fn get_pins(state: State) -> Result<HttpResponse> {
    Ok(ok_json(state.stores.pins.load()?))
}

async fn put_pins(state: State, body: web::Json<Vec<RoutePin>>) -> Result<HttpResponse> {
    let pins = body.into_inner();
    state.stores.pins.save(&pins)?;
    Ok(ok_json(pins))
}

async fn get_settings(state: State) -> Result<HttpResponse> {
    Ok(ok_json(state.stores.settings.load()?))
}

async fn put_settings(state: State, body: web::Json<Settings>) -> Result<HttpResponse> {
    let settings = body.into_inner();
    state.stores.settings.save(&settings)?;
    Ok(ok_json(settings))
}

// ---- routing targets ----

async fn list_services(state: State) -> Result<HttpResponse> {
    Ok(ok_json(state.stores.services.load()?))
}

async fn put_services(state: State, body: web::Json<Vec<Service>>) -> Result<HttpResponse> {
    state.stores.services.save(&body)?;
    reload_classification(&state);
    Ok(ok_json(json!({"count": body.len()})))
}

async fn toggle_service(state: State, path: web::Path<String>) -> Result<HttpResponse> {
    let id = path.into_inner();
    let enabled = state.stores.services.update(|services| {
        let svc = services
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| AppError::NotFound(format!("service {}", id)))?;
        svc.enabled = !svc.enabled;
        Ok(svc.enabled)
    })?;
    reload_classification(&state);
    Ok(ok_json(json!({"id": id, "enabled": enabled})))
}

async fn list_custom_services(state: State) -> Result<HttpResponse> {
    Ok(ok_json(state.stores.custom_services.load()?))
}

async fn put_custom_services(
    state: State,
    body: web::Json<Vec<CustomService>>,
) -> Result<HttpResponse> {
    state.stores.custom_services.save(&body)?;
    reload_classification(&state);
    Ok(ok_json(json!({"count": body.len()})))
}

async fn list_devices(state: State) -> Result<HttpResponse> {
    Ok(ok_json(state.stores.devices.load()?))
}

async fn put_devices(state: State, body: web::Json<Vec<Device>>) -> Result<HttpResponse> {
    state.stores.devices.save(&body)?;
    reload_classification(&state);
    Ok(ok_json(json!({"count": body.len()})))
}

/// Target edits refresh the kernel sets right away; a failure here is
/// reported in the log and surfaced by the next health report, not by
/// failing the edit that was already persisted.
fn reload_classification(state: &AppState) {
    if let Err(e) = state.orchestrator.reload_classification() {
        warn!("classification reload after target edit failed: {}", e);
    }
}

// ---- lifecycle ----

async fn apply_handler(state: State) -> Result<HttpResponse> {
    let final_state = state.orchestrator.apply().await?;
    Ok(ok_json(final_state))
}

/// Persist the current config, then bounce the engine on it.
async fn restart_engine(state: State) -> Result<HttpResponse> {
    state.orchestrator.persist_engine_config()?;
    crate::adapters::ProcessSupervisor::new(state.shell.as_ref()).restart_engine()?;
    Ok(ok_json(json!({"restarted": true})))
}

async fn stop_handler(state: State) -> Result<HttpResponse> {
    state.orchestrator.stop()?;
    Ok(ok_json(state.orchestrator.state()))
}

async fn start_routing(state: State) -> Result<HttpResponse> {
    state.orchestrator.start_routing()?;
    Ok(ok_json(json!({"routing": "started"})))
}

async fn stop_routing(state: State) -> Result<HttpResponse> {
    state.orchestrator.stop_routing()?;
    Ok(ok_json(json!({"routing": "stopped"})))
}

// ---- export / import ----

const BUNDLE_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct Bundle {
    version: u32,
    outbounds: Vec<OutboundDescriptor>,
    subscriptions: Vec<SubscriptionSource>,
    services: Vec<Service>,
    custom_services: Vec<CustomService>,
    devices: Vec<Device>,
    groups: Vec<GroupDef>,
    pins: Vec<RoutePin>,
    settings: Settings,
}

async fn export_bundle(state: State) -> Result<HttpResponse> {
    let bundle = Bundle {
        version: BUNDLE_VERSION,
        outbounds: state.stores.outbounds.load()?,
        subscriptions: state.subscriptions.list()?,
        services: state.stores.services.load()?,
        custom_services: state.stores.custom_services.load()?,
        devices: state.stores.devices.load()?,
        groups: state.stores.groups.load()?,
        pins: state.stores.pins.load()?,
        settings: state.stores.settings.load()?,
    };
    Ok(ok_json(bundle))
}

async fn import_bundle(state: State, body: web::Json<Bundle>) -> Result<HttpResponse> {
    let bundle = body.into_inner();
    if bundle.version != BUNDLE_VERSION {
        return Err(AppError::InvalidArgument(format!(
            "unsupported bundle version {}",
            bundle.version
        )));
    }
    state.stores.outbounds.save(&bundle.outbounds)?;
    state.subscriptions_store.save(&bundle.subscriptions)?;
    state.stores.services.save(&bundle.services)?;
    state.stores.custom_services.save(&bundle.custom_services)?;
    state.stores.devices.save(&bundle.devices)?;
    state.stores.groups.save(&bundle.groups)?;
    state.stores.pins.save(&bundle.pins)?;
    state.stores.settings.save(&bundle.settings)?;
    Ok(ok_json(json!({"imported": true})))
}

/// Register the API endpoints with Actix Web.
pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.route("/api/status", web::get().to(status_handler))
        .route("/api/outbounds", web::get().to(list_outbounds))
        .route("/api/outbounds", web::post().to(create_outbound))
        .route("/api/outbounds/import", web::post().to(import_link))
        .route("/api/outbounds/import-batch", web::post().to(import_batch))
        .route("/api/outbounds/export", web::get().to(export_links))
        .route("/api/outbounds/{tag}", web::put().to(update_outbound))
        .route("/api/outbounds/{tag}", web::delete().to(delete_outbound))
        .route("/api/outbounds/{tag}/toggle", web::post().to(toggle_outbound))
        .route("/api/outbounds/{tag}/check", web::post().to(check_outbound))
        .route("/api/subscriptions", web::get().to(list_subscriptions))
        .route("/api/subscriptions", web::post().to(add_subscription))
        .route(
            "/api/subscriptions/refresh-all",
            web::post().to(refresh_all_subscriptions),
        )
        .route(
            "/api/subscriptions/{id}/refresh",
            web::post().to(refresh_subscription),
        )
        .route(
            "/api/subscriptions/{id}",
            web::delete().to(delete_subscription),
        )
        .route("/api/groups", web::get().to(list_groups))
        .route("/api/groups", web::post().to(create_group))
        .route("/api/groups/{id}", web::delete().to(delete_group))
        .route("/api/pins", web::get().to(get_pins))
        .route("/api/pins", web::put().to(put_pins))
        .route("/api/settings", web::get().to(get_settings))
        .route("/api/settings", web::put().to(put_settings))
        .route("/api/services", web::get().to(list_services))
        .route("/api/services", web::put().to(put_services))
        .route("/api/services/{id}/toggle", web::post().to(toggle_service))
        .route("/api/custom-services", web::get().to(list_custom_services))
        .route("/api/custom-services", web::put().to(put_custom_services))
        .route("/api/devices", web::get().to(list_devices))
        .route("/api/devices", web::put().to(put_devices))
        .route("/api/apply", web::post().to(apply_handler))
        .route("/api/restart", web::post().to(restart_engine))
        .route("/api/stop", web::post().to(stop_handler))
        .route("/api/routing/start", web::post().to(start_routing))
        .route("/api/routing/stop", web::post().to(stop_routing))
        .route("/api/export", web::get().to(export_bundle))
        .route("/api/import", web::post().to(import_bundle));
}

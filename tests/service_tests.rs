//! End-to-end flows over the assembled application state, with the
//! host boundary scripted.

use std::sync::Arc;

use actix_web::{test, web, App};
use pinroute::adapters::ScriptedShell;
use pinroute::models::{
    Device, DeviceMode, OutboundDescriptor, ProtocolConfig, Provenance, Service,
    SubscriptionSource, Transport,
};
use pinroute::web_handlers::{interfaces, AppState};
use tempfile::tempdir;

fn scripted_shell() -> ScriptedShell {
    ScriptedShell::new()
        .respond("sing-box version", true, "sing-box version 1.11.3\n")
        .respond("dnsmasq --version", true, "Compile time options: nftset\n")
}

fn build_state(dir: &std::path::Path, shell: Arc<ScriptedShell>) -> Arc<AppState> {
    AppState::build(
        dir,
        dir.join("engine-config.json"),
        dir.join("pinroute.conf"),
        shell,
    )
    .unwrap()
}

fn tunnel(tag: &str, provenance: Provenance) -> OutboundDescriptor {
    OutboundDescriptor {
        tag: tag.to_string(),
        server: "srv.example.com".to_string(),
        port: 443,
        protocol: ProtocolConfig::Trojan {
            password: "pw".to_string(),
        },
        tls: None,
        transport: Transport::Tcp,
        enabled: true,
        provenance,
    }
}

#[actix_web::test]
async fn enabling_a_service_updates_resolver_directives() {
    let dir = tempdir().unwrap();
    let shell = Arc::new(scripted_shell());
    let state = build_state(dir.path(), shell.clone());

    state
        .stores
        .services
        .save(&vec![Service {
            id: "example".to_string(),
            name: "Example".to_string(),
            enabled: false,
            domains: vec!["example.com".to_string()],
            custom_domains: vec![],
            ip_ranges: vec![],
            custom_ips: vec![],
        }])
        .unwrap();

    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .configure(interfaces::config),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/api/services/example/toggle")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    let directives = std::fs::read_to_string(dir.path().join("pinroute.conf")).unwrap();
    assert!(directives.contains("nftset=/example.com/4#inet#pinroute#tunnel_ips"));
    assert!(directives.contains("nftset=/www.example.com/4#inet#pinroute#tunnel_ips"));

    // Toggling back off empties the directives again.
    let req = test::TestRequest::post()
        .uri("/api/services/example/toggle")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    let directives = std::fs::read_to_string(dir.path().join("pinroute.conf")).unwrap();
    assert!(directives.is_empty());
}

#[actix_web::test]
async fn imported_link_lands_in_the_store_with_a_unique_tag() {
    let dir = tempdir().unwrap();
    let state = build_state(dir.path(), Arc::new(scripted_shell()));
    state
        .stores
        .outbounds
        .save(&vec![tunnel("tr", Provenance::Manual)])
        .unwrap();

    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .configure(interfaces::config),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/api/outbounds/import")
        .set_json(serde_json::json!({
            "link": "trojan://pw@tr.example.com:443?sni=tr.example.com#tr"
        }))
        .to_request();
    let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["tag"], "tr_1");

    let outs = state.stores.outbounds.load().unwrap();
    assert_eq!(outs.len(), 2);
}

#[actix_web::test]
async fn deleting_a_subscription_only_removes_its_outbounds() {
    let dir = tempdir().unwrap();
    let state = build_state(dir.path(), Arc::new(scripted_shell()));

    state
        .stores
        .outbounds
        .save(&vec![
            tunnel("mine", Provenance::Manual),
            tunnel("sub-a", Provenance::Subscription("s1".to_string())),
            tunnel("sub-b", Provenance::Subscription("s1".to_string())),
            tunnel("other", Provenance::Subscription("s2".to_string())),
        ])
        .unwrap();
    state
        .subscriptions_store
        .save(&vec![
            SubscriptionSource {
                id: "s1".to_string(),
                name: "One".to_string(),
                url: "https://example.com/sub1".to_string(),
                format: Default::default(),
                last_update: 0,
                member_tags: vec!["sub-a".to_string(), "sub-b".to_string()],
                node_count: 2,
                auto_update: false,
                update_interval: 12,
            },
            SubscriptionSource {
                id: "s2".to_string(),
                name: "Two".to_string(),
                url: "https://example.com/sub2".to_string(),
                format: Default::default(),
                last_update: 0,
                member_tags: vec!["other".to_string()],
                node_count: 1,
                auto_update: false,
                update_interval: 12,
            },
        ])
        .unwrap();

    state.subscriptions.delete("s1").unwrap();

    let remaining: Vec<String> = state
        .stores
        .outbounds
        .load()
        .unwrap()
        .into_iter()
        .map(|o| o.tag)
        .collect();
    assert_eq!(remaining, vec!["mine", "other"]);
    let subs = state.subscriptions.list().unwrap();
    assert_eq!(subs.len(), 1);
    assert_eq!(subs[0].id, "s2");
}

#[actix_web::test]
async fn degenerate_payload_keeps_previous_subscription_outbounds() {
    let dir = tempdir().unwrap();
    let state = build_state(dir.path(), Arc::new(scripted_shell()));

    state
        .stores
        .outbounds
        .save(&vec![tunnel(
            "old-node",
            Provenance::Subscription("s1".to_string()),
        )])
        .unwrap();
    state
        .subscriptions_store
        .save(&vec![SubscriptionSource {
            id: "s1".to_string(),
            name: "One".to_string(),
            url: "https://example.com/sub".to_string(),
            format: Default::default(),
            last_update: 0,
            member_tags: vec!["old-node".to_string()],
            node_count: 1,
            auto_update: false,
            update_interval: 12,
        }])
        .unwrap();

    // A server answering 200 with an empty body, then with an error
    // page. Neither may touch the stored outbounds.
    for payload in ["", "<!doctype html><html>gateway timeout</html>"] {
        let outcome = state.subscriptions.ingest("s1", payload).unwrap();
        assert!(!outcome.fetched);
        assert_eq!(outcome.node_count, 0);

        let tags: Vec<String> = state
            .stores
            .outbounds
            .load()
            .unwrap()
            .into_iter()
            .map(|o| o.tag)
            .collect();
        assert_eq!(tags, vec!["old-node"]);
    }
    assert_eq!(state.subscriptions.list().unwrap()[0].node_count, 0);

    // A real payload still swaps.
    let outcome = state
        .subscriptions
        .ingest("s1", "trojan://pw@tr.example.com:443?sni=tr.example.com#fresh\n")
        .unwrap();
    assert!(outcome.fetched);
    assert_eq!(outcome.node_count, 1);
    let tags: Vec<String> = state
        .stores
        .outbounds
        .load()
        .unwrap()
        .into_iter()
        .map(|o| o.tag)
        .collect();
    assert_eq!(tags, vec!["fresh"]);
}

#[actix_web::test]
async fn renaming_an_outbound_onto_an_existing_tag_is_rejected() {
    let dir = tempdir().unwrap();
    let state = build_state(dir.path(), Arc::new(scripted_shell()));
    state
        .stores
        .outbounds
        .save(&vec![tunnel("a", Provenance::Manual), tunnel("b", Provenance::Manual)])
        .unwrap();

    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .configure(interfaces::config),
    )
    .await;

    let req = test::TestRequest::put()
        .uri("/api/outbounds/a")
        .set_json(tunnel("b", Provenance::Manual))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status().as_u16(), 400);

    let tags: Vec<String> = state
        .stores
        .outbounds
        .load()
        .unwrap()
        .into_iter()
        .map(|o| o.tag)
        .collect();
    assert_eq!(tags, vec!["a", "b"]);

    // A rename to a fresh tag still works.
    let req = test::TestRequest::put()
        .uri("/api/outbounds/a")
        .set_json(tunnel("c", Provenance::Manual))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    let tags: Vec<String> = state
        .stores
        .outbounds
        .load()
        .unwrap()
        .into_iter()
        .map(|o| o.tag)
        .collect();
    assert_eq!(tags, vec!["c", "b"]);
}

#[actix_web::test]
async fn device_modes_reach_the_kernel_rules_on_apply() {
    let dir = tempdir().unwrap();
    let shell = Arc::new(scripted_shell());
    let state = build_state(dir.path(), shell.clone());
    state
        .stores
        .devices
        .save(&vec![Device {
            id: "laptop".to_string(),
            name: "Laptop".to_string(),
            enabled: true,
            ip: "192.168.1.50".to_string(),
            mac: None,
            mode: DeviceMode::AllTunnel,
            services: vec![],
        }])
        .unwrap();

    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .configure(interfaces::config),
    )
    .await;

    let req = test::TestRequest::post().uri("/api/apply").to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    assert!(shell
        .recorded()
        .iter()
        .any(|c| c.contains("ip saddr 192.168.1.50 ct state new meta mark set 0x100")));
}

#[actix_web::test]
async fn restart_endpoint_persists_the_config_first() {
    let dir = tempdir().unwrap();
    let shell = Arc::new(scripted_shell());
    let state = build_state(dir.path(), shell.clone());
    state
        .stores
        .outbounds
        .save(&vec![tunnel("a", Provenance::Manual)])
        .unwrap();

    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .configure(interfaces::config),
    )
    .await;

    let req = test::TestRequest::post().uri("/api/restart").to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    let config: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(dir.path().join("engine-config.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(config["route"]["final"], "a");
    assert!(shell
        .recorded()
        .iter()
        .any(|c| c == "/etc/init.d/sing-box restart"));
}

#[actix_web::test]
async fn apply_endpoint_reports_ready_and_status_reflects_it() {
    let dir = tempdir().unwrap();
    let shell = Arc::new(scripted_shell());
    let state = build_state(dir.path(), shell.clone());
    state
        .stores
        .outbounds
        .save(&vec![tunnel("a", Provenance::Manual)])
        .unwrap();

    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .configure(interfaces::config),
    )
    .await;

    let req = test::TestRequest::post().uri("/api/apply").to_request();
    let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["state"], "ready");

    let config: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(dir.path().join("engine-config.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(config["route"]["final"], "a");

    let req = test::TestRequest::get().uri("/api/status").to_request();
    let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["data"]["apply_state"]["state"], "ready");
}

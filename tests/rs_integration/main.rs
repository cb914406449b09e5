//! Uses the single integration test approach.
//!
//! This improves parallelism when running the tests, and reduces the number of binaries that have to be built (and linked)
#![expect(
    clippy::tests_outside_test_module,
    reason = "This is the integration test binary, so it's expected that tests are outside of a test module"
)]
#![expect(clippy::shadow_unrelated, reason = "This is a common pattern in tests")]
#![expect(clippy::indexing_slicing, reason = "This is not problematic in tests")]
#![expect(clippy::unwrap_used, reason = "Using unwrap in tests is fine")]

extern crate alloc;
extern crate core;

mod common;

use core::time::Duration;
use std::fs;

use reqwest::{Client, StatusCode, header, redirect::Policy};
use serde_json::Value;
use tokio::time;

use common::{fake_host, get_free_port, local_domain, spawn_gateway, write_config};

const LOCAL_ADMIN: &str = r#"admin_allowlist = ["127.0.0.1/32"]"#;

fn client() -> Client {
    Client::builder().redirect(Policy::none()).build().unwrap()
}

#[tokio::test]
async fn gateway_config_loads() {
    let gateway = spawn_gateway("", "").await;
    let resp = client().get(gateway.url("/nowhere")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn entry_redirects_once_the_host_answers() {
    let probe_port = get_free_port();
    let gateway = spawn_gateway(
        "",
        &local_domain("nas", probe_port, r#"policy = "on_demand""#),
    )
    .await;
    let client = client();

    let resp = client.get(gateway.url("/nas")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(resp.headers()[header::RETRY_AFTER], "3");
    let status: Value = resp.json().await.unwrap();
    assert_eq!(status["state"], "waking");

    let _host = fake_host(probe_port).await;

    let mut location = None;
    for _ in 0..30 {
        let resp = client.get(gateway.url("/nas")).send().await.unwrap();
        if resp.status() == StatusCode::TEMPORARY_REDIRECT {
            location = Some(resp.headers()[header::LOCATION].to_str().unwrap().to_string());
            break;
        }
        time::sleep(Duration::from_millis(200)).await;
    }
    assert_eq!(location.as_deref(), Some("https://nas.example.org/"));
}

#[tokio::test]
async fn domain_allowlist_is_enforced() {
    let gateway = spawn_gateway(
        "",
        &local_domain(
            "nas",
            get_free_port(),
            r#"
            policy = "on_demand"
            allowlist = ["10.0.0.0/8"]
            "#,
        ),
    )
    .await;
    let client = client();

    let resp = client.get(gateway.url("/nas")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    let resp = client
        .post(gateway.url("/api/wake/nas"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn admin_endpoints_follow_the_admin_allowlist() {
    let domains = local_domain("nas", get_free_port(), r#"policy = "on_demand""#);
    let closed = spawn_gateway(r#"admin_allowlist = ["10.0.0.0/8"]"#, &domains).await;
    let resp = client()
        .get(closed.url("/api/domains"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let open = spawn_gateway(LOCAL_ADMIN, &domains).await;
    let resp = client().get(open.url("/api/domains")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body[0]["domain"], "nas");
    assert_eq!(body[0]["state"], "offline");
}

#[tokio::test]
async fn reload_applies_valid_and_rejects_invalid_files() {
    let nas = local_domain("nas", get_free_port(), r#"policy = "on_demand""#);
    let gateway = spawn_gateway(LOCAL_ADMIN, &nas).await;
    let client = client();

    let media = local_domain("media", get_free_port(), r#"policy = "always_on""#);
    write_config(
        &gateway.config_path(),
        gateway.port,
        LOCAL_ADMIN,
        &format!("{nas}\n{media}"),
    );
    let resp = client
        .post(gateway.url("/api/reload"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    // the file watcher may have applied it already
    assert!(body["result"] == "applied" || body["result"] == "unchanged");

    let resp = client
        .get(gateway.url("/api/status/media"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    fs::write(gateway.config_path(), "[server\nport = ").unwrap();
    let resp = client
        .post(gateway.url("/api/reload"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "config_error");

    // the previous snapshot stays active
    let resp = client
        .get(gateway.url("/api/status/media"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn logs_are_persisted() {
    let probe_port = get_free_port();
    let gateway = spawn_gateway(
        LOCAL_ADMIN,
        &format!(
            "[db]\npath = \"./hall.db\"\n{}",
            local_domain("nas", probe_port, r#"policy = "on_demand""#)
        ),
    )
    .await;
    let client = client();

    let resp = client
        .post(gateway.url("/api/wake/nas"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::ACCEPTED);

    let mut actions = Vec::new();
    for _ in 0..20 {
        let logs: Value = client
            .get(gateway.url("/api/logs?limit=10"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        actions = logs
            .as_array()
            .unwrap()
            .iter()
            .map(|entry| entry["action"].as_str().unwrap().to_string())
            .collect();
        if actions.iter().any(|a| a == "wake") {
            break;
        }
        time::sleep(Duration::from_millis(100)).await;
    }
    assert!(actions.iter().any(|a| a == "wake"), "{actions:?}");
    assert!(gateway.dir.path().join("hall.db").exists());
}

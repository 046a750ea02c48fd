//! Integration tests for alyx-core
//!
//! These tests verify the full Alyx wiring works end-to-end: config in,
//! catalog loaded, webhook endpoints bound, invocations logged.

use alyx_core::types::TriggerType;
use alyx_core::{Alyx, AlyxConfig};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn create_test_config(temp_dir: &TempDir) -> AlyxConfig {
    let root = temp_dir.path();
    fs::create_dir_all(root.join("functions")).unwrap();
    fs::create_dir_all(root.join("storage")).unwrap();
    let toml = format!(
        r#"
[functions]
dir = "{root}/functions"

[functions.env]
STAGE = "test"

[database]
path = "{root}/alyx.db"

[storage]
spool_dir = "{root}/spool"

[storage.backends.local]
type = "filesystem"
base_path = "{root}/storage"

[storage.buckets.media]
backend = "local"

[webhooks]
max_attempts = 3
base_delay_ms = 50
allow_private_endpoints = true
"#,
        root = root.display()
    );
    toml::from_str(&toml).unwrap()
}

fn create_function(functions_dir: &Path, name: &str, manifest_extra: &str) {
    let dir = functions_dir.join(name);
    fs::create_dir_all(&dir).unwrap();
    let entry = dir.join("main");
    fs::write(
        &entry,
        r#"#!/bin/sh
read line
id=$(printf '%s' "$line" | sed -n 's/.*"request_id":"\([^"]*\)".*/\1/p')
printf '{"request_id":"%s","success":true,"output":{"ok":true}}' "$id"
"#,
    )
    .unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&entry, fs::Permissions::from_mode(0o755)).unwrap();
    }
    fs::write(
        dir.join("manifest.yaml"),
        format!(
            "name: {}\nruntime: binary\ntimeout: 5s\n{}",
            name, manifest_extra
        ),
    )
    .unwrap();
}

#[tokio::test]
async fn test_alyx_with_empty_functions_dir() {
    let temp_dir = TempDir::new().unwrap();
    let config = create_test_config(&temp_dir);

    let alyx = Alyx::from_config(config).await.unwrap();
    assert!(alyx.registry().is_empty().await);
    alyx.shutdown().await;
}

#[tokio::test]
async fn test_catalog_loads_and_skips_invalid() {
    let temp_dir = TempDir::new().unwrap();
    let functions = temp_dir.path().join("functions");
    fs::create_dir_all(&functions).unwrap();
    create_function(&functions, "good", "");

    let bad = functions.join("bad");
    fs::create_dir_all(&bad).unwrap();
    fs::write(bad.join("manifest.yaml"), "name: bad\nruntime: cobol\n").unwrap();

    let config = create_test_config(&temp_dir);
    let alyx = Alyx::from_config(config).await.unwrap();

    assert_eq!(alyx.registry().len().await, 1);
    assert!(alyx.registry().get("good").await.is_some());
    assert!(alyx.registry().get("bad").await.is_none());
    alyx.shutdown().await;
}

#[tokio::test]
async fn test_webhook_endpoints_bound_at_load() {
    let temp_dir = TempDir::new().unwrap();
    let functions = temp_dir.path().join("functions");
    fs::create_dir_all(&functions).unwrap();
    create_function(
        &functions,
        "hooked",
        r#"hooks:
  - type: webhook
    config:
      path: /webhooks/github
      methods: POST,PUT
    verification:
      type: hmac-sha256
      header: X-Hub-Signature-256
      secret: gh-secret
"#,
    );

    let config = create_test_config(&temp_dir);
    let alyx = Alyx::from_config(config).await.unwrap();

    let endpoint = alyx
        .gateway()
        .lookup("/webhooks/github")
        .await
        .expect("endpoint bound by registrar");
    assert_eq!(endpoint.function_name, "hooked");
    assert_eq!(endpoint.methods, vec!["POST", "PUT"]);
    assert!(endpoint.verification.is_some());
    alyx.shutdown().await;
}

#[tokio::test]
async fn test_reload_replaces_endpoint_bindings() {
    let temp_dir = TempDir::new().unwrap();
    let functions = temp_dir.path().join("functions");
    fs::create_dir_all(&functions).unwrap();
    create_function(
        &functions,
        "hooked",
        r#"hooks:
  - type: webhook
    config:
      path: /webhooks/v1
    verification:
      type: hmac-sha256
      header: X-Sig
      secret: s
"#,
    );

    let config = create_test_config(&temp_dir);
    let alyx = Alyx::from_config(config).await.unwrap();
    assert!(alyx.gateway().lookup("/webhooks/v1").await.is_some());

    // Rewrite the manifest to move the endpoint, then reload
    fs::write(
        functions.join("hooked/manifest.yaml"),
        r#"name: hooked
runtime: binary
timeout: 5s
hooks:
  - type: webhook
    config:
      path: /webhooks/v2
    verification:
      type: hmac-sha256
      header: X-Sig
      secret: s
"#,
    )
    .unwrap();
    alyx.reload().await.unwrap();

    assert!(alyx.gateway().lookup("/webhooks/v1").await.is_none());
    assert!(alyx.gateway().lookup("/webhooks/v2").await.is_some());
    alyx.shutdown().await;
}

#[cfg(unix)]
#[tokio::test]
async fn test_invoke_through_facade() {
    let temp_dir = TempDir::new().unwrap();
    let functions = temp_dir.path().join("functions");
    fs::create_dir_all(&functions).unwrap();
    create_function(&functions, "hello", "");

    let config = create_test_config(&temp_dir);
    let alyx = Alyx::from_config(config).await.unwrap();

    let response = alyx
        .service()
        .invoke(
            "hello",
            serde_json::json!({"name": "world"}),
            None,
            TriggerType::Http,
            None,
        )
        .await
        .unwrap();
    assert!(response.success);

    let executions = alyx.store().list_executions(Some("hello"), 10).await.unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].status, "succeeded");
    alyx.shutdown().await;
}

#[tokio::test]
async fn test_workers_start_and_stop() {
    let temp_dir = TempDir::new().unwrap();
    let config = create_test_config(&temp_dir);
    let alyx = Alyx::from_config(config).await.unwrap();

    alyx.start_workers().await.unwrap();
    // Shutdown is clean and idempotent even right after start
    alyx.shutdown().await;
    alyx.shutdown().await;
}

//! HTTP surface tests driven through `axum-test`.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use assistant_orchestrator::AppState;
use assistant_orchestrator::llm::{LlmSettings, ProviderKind};
use assistant_orchestrator::server::{APOLOGY, router};
use assistant_orchestrator::tenant::{DefaultResourceFactory, TenantDefaults, TenantResourceManager, YamlTenantSource};
use axum::http::StatusCode;
use axum_test::TestServer;
use serde_json::{Value, json};

const TENANTS: &str = r#"
tenants:
  - tenant_id: tenant_http
    routing_key: "+15559001"
    vector_store: in_memory
    metadata:
      name: Front desk
"#;

async fn test_server() -> (TestServer, TenantResourceManager, tempfile::NamedTempFile) {
    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    file.write_all(TENANTS.as_bytes()).unwrap();

    let settings = LlmSettings {
        kind: ProviderKind::Mock,
        ..LlmSettings::default()
    };
    let manager = TenantResourceManager::load(
        Arc::new(YamlTenantSource::new(file.path())),
        Arc::new(DefaultResourceFactory::new(settings, 2)),
        TenantDefaults::default(),
    )
    .await
    .unwrap();

    let app = router(AppState {
        manager: manager.clone(),
        request_timeout: Duration::from_secs(30),
    });
    (TestServer::new(app).unwrap(), manager, file)
}

#[tokio::test]
async fn test_health_reports_tenant_stats() {
    let (server, _manager, _file) = test_server().await;

    let response = server.get("/health").await;
    response.assert_status_ok();
    let body = response.json::<Value>();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["tenants"]["total_tenants"], 1);
    assert_eq!(body["tenants"]["active_storage"], 0);
}

#[tokio::test]
async fn test_list_tenants_hides_connection_details() {
    let (server, _manager, _file) = test_server().await;

    let body = server.get("/v1/tenants").await.json::<Value>();
    let tenants = body.as_array().unwrap();
    assert_eq!(tenants.len(), 1);
    assert_eq!(tenants[0]["tenant_id"], "tenant_http");
    assert_eq!(tenants[0]["routing_key"], "+15559001");
    assert!(tenants[0].get("db_dsn").is_none());
}

#[tokio::test]
async fn test_turn_returns_reply_and_metadata() {
    let (server, _manager, _file) = test_server().await;
    let user = uuid::Uuid::new_v4();

    let response = server
        .post("/v1/turns")
        .json(&json!({ "routing_key": "+15559001", "user_id": user, "text": "hi there" }))
        .await;
    response.assert_status_ok();

    let body = response.json::<Value>();
    assert_eq!(body["tenant_id"], "tenant_http");
    assert_eq!(body["user_id"], user.to_string());
    assert_eq!(body["status"], "answered");
    assert!(body["reply"].as_str().unwrap().starts_with("Mock reply"));
    assert_eq!(body["metadata"]["kind"], "conversational");
}

#[tokio::test]
async fn test_unknown_routing_key_is_not_found() {
    let (server, _manager, _file) = test_server().await;

    let response = server
        .post("/v1/turns")
        .json(&json!({ "routing_key": "+10000000", "text": "hello" }))
        .await;
    response.assert_status(StatusCode::NOT_FOUND);

    let body = response.json::<Value>();
    assert!(body["error"].as_str().unwrap().contains("+10000000"));
    assert!(body.get("reply").is_none());
}

#[tokio::test]
async fn test_closed_manager_answers_with_apology() {
    let (server, manager, _file) = test_server().await;
    manager.close().await.unwrap();

    let response = server
        .post("/v1/turns")
        .json(&json!({ "routing_key": "+15559001", "text": "hello" }))
        .await;
    response.assert_status(StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.json::<Value>()["reply"], APOLOGY);
}

#[tokio::test]
async fn test_admin_reload_picks_up_file_changes() {
    let (server, _manager, file) = test_server().await;

    let updated = format!("{TENANTS}  - tenant_id: tenant_second\n    routing_key: \"+15559002\"\n    vector_store: in_memory\n");
    std::fs::write(file.path(), updated).unwrap();

    let response = server.post("/v1/admin/reload").await;
    response.assert_status_ok();
    assert_eq!(response.json::<Value>()["total_tenants"], 2);

    let body = server.get("/v1/tenants").await.json::<Value>();
    assert_eq!(body.as_array().unwrap().len(), 2);
}

//! HTTP surface tests against a fully assembled gateway.

use axum_test::TestServer;
use tokio::sync::mpsc;

use aog::config::AppConfig;

async fn test_server() -> (TestServer, tempfile::TempDir) {
    let root = tempfile::tempdir().unwrap();
    let mut config = AppConfig::default();
    config.paths.root_dir = root.path().to_path_buf();
    config.ensure_dirs().unwrap();

    let (shutdown_tx, _shutdown_rx) = mpsc::channel(1);
    let state = aog::server::build_state(config, shutdown_tx).await.unwrap();
    let router = aog::api::create_router(state);
    (TestServer::new(router).unwrap(), root)
}

#[tokio::test]
async fn health_and_version() {
    let (server, _root) = test_server().await;

    let response = server.get("/health").await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["code"], 20000);
    assert_eq!(body["data"]["status"], "ok");

    let response = server.get("/version").await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["data"]["spec_version"], "v0.2");
}

#[tokio::test]
async fn service_install_and_list() {
    let (server, _root) = test_server().await;

    let response = server
        .post("/aog/v0.2/service/install")
        .json(&serde_json::json!({"service_name": "chat"}))
        .await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["data"]["name"], "chat");
    assert_eq!(body["data"]["local_provider"], "local_ollama");

    // Installing binds the built-in provider row.
    let response = server.get("/aog/v0.2/service_provider").await;
    let body: serde_json::Value = response.json();
    let providers = body["data"].as_array().unwrap();
    assert!(providers
        .iter()
        .any(|p| p["provider_name"] == "local_ollama" && p["service_name"] == "chat"));

    let response = server.get("/aog/v0.2/service").await;
    let body: serde_json::Value = response.json();
    assert_eq!(body["data"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn install_rejects_unknown_service() {
    let (server, _root) = test_server().await;

    let response = server
        .post("/aog/v0.2/service/install")
        .json(&serde_json::json!({"service_name": "telepathy"}))
        .await;
    response.assert_status(axum::http::StatusCode::BAD_REQUEST);
    let body: serde_json::Value = response.json();
    assert_eq!(body["code"], 40000);
}

#[tokio::test]
async fn invoke_without_models_is_404() {
    let (server, _root) = test_server().await;

    let response = server
        .post("/aog/v0.2/services/chat")
        .json(&serde_json::json!({"messages": []}))
        .await;
    response.assert_status(axum::http::StatusCode::NOT_FOUND);
    let body: serde_json::Value = response.json();
    assert_eq!(body["code"], 40402, "model_not_found envelope: {body}");
}

#[tokio::test]
async fn model_catalogs_are_served() {
    let (server, _root) = test_server().await;

    let response = server.get("/aog/v0.2/model/recommend").await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert!(body["data"]["chat"].as_array().is_some_and(|a| !a.is_empty()));

    let response = server
        .get("/aog/v0.2/model/support")
        .add_query_param("service_name", "chat")
        .await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert!(body["data"].as_array().is_some_and(|a| !a.is_empty()));
}

#[tokio::test]
async fn export_then_import_round_trips() {
    let (server, _root) = test_server().await;

    server
        .post("/aog/v0.2/service/install")
        .json(&serde_json::json!({"service_name": "chat"}))
        .await
        .assert_status_ok();

    let exported: serde_json::Value = server.post("/aog/v0.2/service/export").await.json();
    let bundle = exported["data"].clone();
    assert!(bundle["services"].as_array().is_some());

    let response = server.post("/aog/v0.2/service/import").json(&bundle).await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["data"]["services"], 1);
}

use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use netsweep::store::{JobStore, MemoryStore};
use netsweep::{ScanConfig, ScanOrchestrator};

fn app() -> (Router, Arc<dyn JobStore>) {
    let store: Arc<dyn JobStore> = Arc::new(MemoryStore::new());
    let orchestrator = Arc::new(ScanOrchestrator::new(store.clone(), ScanConfig::default()));
    (netsweep::server::router(orchestrator), store)
}

async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let req = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(match body {
            Some(v) => Body::from(v.to_string()),
            None => Body::empty(),
        })
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn wait_for_status(app: &Router, id: u64, want: &str) -> Value {
    for _ in 0..200 {
        let (code, job) = call(app, Method::GET, &format!("/api/scans/{id}"), None).await;
        assert_eq!(code, StatusCode::OK);
        if job["status"] == want {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("scan {id} never reached {want}");
}

#[tokio::test]
async fn demo_scan_over_http() {
    let (app, _store) = app();
    let (code, accepted) = call(
        &app,
        Method::POST,
        "/api/scans",
        Some(json!({"ip_range": "192.168.1.0/24", "ports": [22, 80, 443], "demo": true})),
    )
    .await;
    assert_eq!(code, StatusCode::ACCEPTED);
    assert_eq!(accepted["status"], "queued");
    let id = accepted["scan_id"].as_u64().unwrap();

    let job = wait_for_status(&app, id, "completed").await;
    assert_eq!(job["mode"], "demo");
    assert_eq!(job["hosts"][0]["ip_address"], "192.168.1.10");
    assert_eq!(job["hosts"][0]["open_ports"], json!([22, 80]));
    assert_eq!(job["hosts"][1]["ip_address"], "192.168.1.20");
    assert_eq!(job["hosts"][1]["open_ports"], json!([443]));

    let (code, list) = call(&app, Method::GET, "/api/scans", None).await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(list.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn invalid_ports_are_rejected_before_a_job_exists() {
    let (app, store) = app();
    for port in [0, 65536] {
        let (code, body) = call(
            &app,
            Method::POST,
            "/api/scans",
            Some(json!({"ip_range": "192.168.1.0/24", "ports": [22, port]})),
        )
        .await;
        assert_eq!(code, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("port"));
    }
    assert!(store.list_jobs().await.unwrap().is_empty());
}

#[tokio::test]
async fn gateway_outside_range_is_rejected() {
    let (app, store) = app();
    let (code, _) = call(
        &app,
        Method::POST,
        "/api/scans",
        Some(json!({"ip_range": "192.168.1.0/24", "gateway": "10.0.0.1"})),
    )
    .await;
    assert_eq!(code, StatusCode::BAD_REQUEST);
    assert!(store.list_jobs().await.unwrap().is_empty());
}

#[tokio::test]
async fn restricted_scan_completes_empty() {
    let (app, _store) = app();
    let (code, accepted) = call(
        &app,
        Method::POST,
        "/api/scans",
        Some(json!({"ip_range": "10.1.0.0/24"})),
    )
    .await;
    assert_eq!(code, StatusCode::ACCEPTED);
    let id = accepted["scan_id"].as_u64().unwrap();

    let job = wait_for_status(&app, id, "completed").await;
    assert_eq!(job["mode"], "restricted");
    assert_eq!(job["hosts"], json!([]));
    assert_eq!(job["ports_requested"], json!([22, 80, 443]));
    assert!(job["failure"].is_null());
}

#[tokio::test]
async fn delete_removes_finished_scans() {
    let (app, _store) = app();
    let (_, accepted) = call(
        &app,
        Method::POST,
        "/api/scans",
        Some(json!({"ip_range": "192.168.1.0/24", "demo": true})),
    )
    .await;
    let id = accepted["scan_id"].as_u64().unwrap();
    wait_for_status(&app, id, "completed").await;

    let (code, _) = call(&app, Method::POST, &format!("/api/scans/{id}/cancel"), None).await;
    assert_eq!(code, StatusCode::CONFLICT);

    let (code, _) = call(&app, Method::DELETE, &format!("/api/scans/{id}"), None).await;
    assert_eq!(code, StatusCode::NO_CONTENT);
    let (code, _) = call(&app, Method::GET, &format!("/api/scans/{id}"), None).await;
    assert_eq!(code, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unknown_scan_is_not_found() {
    let (app, _store) = app();
    let (code, body) = call(&app, Method::GET, "/api/scans/999", None).await;
    assert_eq!(code, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("999"));
}

use std::{collections::HashMap, sync::Arc};

use schema::{base64_payload, manifest_builder, sha256_hex};
use serde_json::{Value, json};
use store::{SessionStore, StoreConfig};
use tempfile::TempDir;

use super::*;

fn sample_runtime(dir: &TempDir) -> SharedRuntime {
    UpgradeRuntime::shared(SessionStore::new(StoreConfig {
        auto_save_interval: None,
        ..StoreConfig::in_dir(dir.path())
    }))
}

fn request(method: &str, target: &str, body: Option<Value>) -> HttpRequest {
    HttpRequest {
        method: method.to_string(),
        target: target.to_string(),
        headers: HashMap::new(),
        body: body.map(|value| value.to_string().into_bytes()).unwrap_or_default(),
    }
}

fn body_json(response: &HttpResponse) -> Value {
    serde_json::from_str(&response.body).unwrap()
}

fn create_body(session_id: &str) -> Value {
    json!({
        "session_id": session_id,
        "manifest": manifest_builder("1.0.0", &[("main", 8)]),
    })
}

fn chunk_body(session_id: &str, index: u32, total: u32, payload: &[u8]) -> Value {
    json!({
        "session_id": session_id,
        "component_name": "main",
        "chunk_index": index,
        "total_chunks": total,
        "target_address": "0x08000000",
        "chunk_size": payload.len(),
        "chunk_offset": u64::from(index) * payload.len() as u64,
        "checksum": sha256_hex(payload),
        "data": base64_payload::encode(payload),
    })
}

#[test]
fn session_lifecycle_over_routes() {
    let dir = TempDir::new().unwrap();
    let runtime = sample_runtime(&dir);

    let created = handle_request(&runtime, &request("POST", "/v1/sessions", Some(create_body("S1"))));
    assert_eq!(created.status, 200);
    assert_eq!(body_json(&created)["status"], "active");

    let first = handle_request(&runtime, &request("POST", "/v1/chunks", Some(chunk_body("S1", 0, 2, b"abcd"))));
    assert_eq!(first.status, 200);
    assert_eq!(body_json(&first)["component_progress"], 50);

    let status = handle_request(&runtime, &request("GET", "/v1/sessions/S1", None));
    let status = body_json(&status);
    assert_eq!(status["components"][0]["received_indices"], json!([0]));
    assert_eq!(status["components"][0]["missing_indices"], json!([1]));

    let second = handle_request(&runtime, &request("POST", "/v1/chunks", Some(chunk_body("S1", 1, 2, b"efgh"))));
    assert_eq!(body_json(&second)["is_component_complete"], true);

    let completed = handle_request(&runtime, &request("POST", "/v1/sessions/S1/complete", None));
    assert_eq!(completed.status, 200);
    assert_eq!(body_json(&completed)["status"], "completed");

    let gone = handle_request(&runtime, &request("GET", "/v1/sessions/S1", None));
    assert_eq!(gone.status, 404);
    assert_eq!(body_json(&gone)["code"], "SESSION_NOT_FOUND");
}

#[test]
fn duplicate_session_maps_to_conflict() {
    let dir = TempDir::new().unwrap();
    let runtime = sample_runtime(&dir);
    handle_request(&runtime, &request("POST", "/v1/sessions", Some(create_body("dup"))));

    let again = handle_request(&runtime, &request("POST", "/v1/sessions", Some(create_body("dup"))));
    assert_eq!(again.status, 409);
    assert_eq!(body_json(&again)["code"], "CONFLICT");
}

#[test]
fn chunk_errors_carry_codes() {
    let dir = TempDir::new().unwrap();
    let runtime = sample_runtime(&dir);
    handle_request(&runtime, &request("POST", "/v1/sessions", Some(create_body("S"))));

    let mut corrupted = chunk_body("S", 0, 2, b"abcd");
    corrupted["checksum"] = json!(sha256_hex(b"zzzz"));
    let response = handle_request(&runtime, &request("POST", "/v1/chunks", Some(corrupted)));
    assert_eq!(response.status, 400);
    assert_eq!(body_json(&response)["code"], "CHECKSUM_MISMATCH");

    let mut missing = chunk_body("S", 0, 2, b"abcd");
    missing.as_object_mut().unwrap().remove("chunk_offset");
    let response = handle_request(&runtime, &request("POST", "/v1/chunks", Some(missing)));
    assert_eq!(response.status, 400);
    assert_eq!(body_json(&response)["code"], "BAD_REQUEST");

    let unknown = handle_request(&runtime, &request("POST", "/v1/chunks", Some(chunk_body("nope", 0, 1, b"abcd"))));
    assert_eq!(unknown.status, 404);
    assert_eq!(body_json(&unknown)["code"], "SESSION_NOT_FOUND");

    let metrics = handle_request(&runtime, &request("GET", "/metrics", None));
    assert!(metrics.body.contains("fwup_chunks_rejected_total 3"));
    assert!(metrics.body.contains("fwup_chunks_accepted_total 0"));
}

#[test]
fn malformed_json_is_bad_request() {
    let dir = TempDir::new().unwrap();
    let runtime = sample_runtime(&dir);
    let mut broken = request("POST", "/v1/sessions", None);
    broken.body = b"{\"session_id\":".to_vec();

    let response = handle_request(&runtime, &broken);
    assert_eq!(response.status, 400);
    assert!(body_json(&response)["error"]
        .as_str()
        .unwrap()
        .starts_with("invalid JSON body"));
}

#[test]
fn maintenance_routes_report_counts() {
    let dir = TempDir::new().unwrap();
    let runtime = sample_runtime(&dir);
    for id in ["a", "b"] {
        handle_request(&runtime, &request("POST", "/v1/sessions", Some(create_body(id))));
    }

    let expired = handle_request(
        &runtime,
        &request("POST", "/v1/maintenance/cleanup-expired?max_age_ms=3600000", None),
    );
    assert_eq!(body_json(&expired)["removed"], 0);

    let bad_query = handle_request(
        &runtime,
        &request("POST", "/v1/maintenance/cleanup-expired?max_age_ms=soon", None),
    );
    assert_eq!(bad_query.status, 400);

    let saved = handle_request(&runtime, &request("POST", "/v1/maintenance/save", None));
    assert_eq!(body_json(&saved)["written"], true);
    assert_eq!(body_json(&saved)["sessions"], 2);

    let listed = handle_request(&runtime, &request("GET", "/v1/sessions", None));
    assert_eq!(body_json(&listed)["count"], 2);

    let cleared = handle_request(&runtime, &request("DELETE", "/v1/sessions", None));
    assert_eq!(body_json(&cleared)["removed"], 2);
    assert_eq!(runtime.store().session_count(), 0);
}

#[test]
fn session_ids_are_percent_decoded() {
    let dir = TempDir::new().unwrap();
    let runtime = sample_runtime(&dir);
    handle_request(&runtime, &request("POST", "/v1/sessions", Some(create_body("dev 1/a"))));

    let status = handle_request(&runtime, &request("GET", "/v1/sessions/dev%201%2Fa", None));
    assert_eq!(status.status, 200);
    assert_eq!(body_json(&status)["session_id"], "dev 1/a");

    let deleted = handle_request(&runtime, &request("DELETE", "/v1/sessions/dev%201%2Fa", None));
    assert_eq!(body_json(&deleted)["removed"], true);
}

#[test]
fn unknown_route_and_wrong_method() {
    let dir = TempDir::new().unwrap();
    let runtime = sample_runtime(&dir);

    assert_eq!(handle_request(&runtime, &request("GET", "/v2/nothing", None)).status, 404);
    assert_eq!(handle_request(&runtime, &request("PUT", "/v1/chunks", None)).status, 405);
    assert_eq!(handle_request(&runtime, &request("GET", "/health", None)).status, 200);
}

#[test]
fn parse_request_bytes_rejects_length_mismatch() {
    let raw = b"POST /v1/chunks HTTP/1.1\r\nContent-Length: 10\r\n\r\n{}";
    let runtime = sample_runtime(&TempDir::new().unwrap());
    assert_eq!(
        handle_http_request_bytes(&runtime, raw),
        Err("content-length does not match body size".to_string())
    );
}

#[test]
fn runtime_is_shareable_across_threads() {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<UpgradeRuntime>();
    let dir = TempDir::new().unwrap();
    let runtime = sample_runtime(&dir);
    let clone = Arc::clone(&runtime);
    std::thread::spawn(move || clone.metrics_text()).join().unwrap();
}

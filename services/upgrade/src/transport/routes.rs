use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::json;

use super::{
    HttpRequest, HttpResponse, SharedRuntime, json_response, request::RequestTarget,
    store_result_response,
};

pub(crate) fn handle_request(runtime: &SharedRuntime, request: &HttpRequest) -> HttpResponse {
    let target = match RequestTarget::parse(&request.target) {
        Ok(target) => target,
        Err(err) => return HttpResponse::bad_request(&err),
    };
    let segments = target.segments();

    match (request.method.as_str(), segments.as_slice()) {
        ("GET", ["health"]) => json_response(&json!({ "status": "ok" })),
        ("GET", ["metrics"]) => HttpResponse::ok_text(runtime.metrics_text()),

        ("GET", ["v1", "sessions"]) => json_response(&runtime.list_sessions()),
        ("POST", ["v1", "sessions"]) => match parse_body(request) {
            Ok(body) => store_result_response(runtime.create_session(body)),
            Err(response) => response,
        },
        ("DELETE", ["v1", "sessions"]) => store_result_response(runtime.clear_all()),

        ("GET", ["v1", "sessions", session_id]) => {
            store_result_response(runtime.store().get_status(session_id))
        }
        ("DELETE", ["v1", "sessions", session_id]) => {
            store_result_response(runtime.store().cleanup_session(session_id).map(|removed| {
                json!({ "session_id": session_id, "removed": removed })
            }))
        }
        ("POST", ["v1", "sessions", session_id, "complete"]) => {
            store_result_response(runtime.complete_session(session_id))
        }
        ("POST", ["v1", "sessions", session_id, "abort"]) => {
            store_result_response(runtime.abort_session(session_id))
        }

        ("POST", ["v1", "chunks"]) => match parse_body(request) {
            Ok(body) => store_result_response(runtime.upload_chunk(body)),
            Err(response) => response,
        },

        ("POST", ["v1", "maintenance", "cleanup-completed"]) => {
            store_result_response(runtime.cleanup_completed())
        }
        ("POST", ["v1", "maintenance", "cleanup-expired"]) => {
            match target.query_u64("max_age_ms") {
                Ok(max_age_ms) => store_result_response(
                    runtime.cleanup_expired(max_age_ms.map(Duration::from_millis)),
                ),
                Err(err) => HttpResponse::bad_request(&err),
            }
        }
        ("POST", ["v1", "maintenance", "save"]) => store_result_response(runtime.force_save()),

        (_, path) if is_known_route(path) => {
            HttpResponse::method_not_allowed(&format!("method {} not allowed", request.method))
        }
        _ => HttpResponse::not_found("route not found"),
    }
}

fn is_known_route(segments: &[&str]) -> bool {
    matches!(
        segments,
        ["health"]
            | ["metrics"]
            | ["v1", "sessions"]
            | ["v1", "sessions", _]
            | ["v1", "sessions", _, "complete" | "abort"]
            | ["v1", "chunks"]
            | ["v1", "maintenance", "cleanup-completed" | "cleanup-expired" | "save"]
    )
}

fn parse_body<T: DeserializeOwned>(request: &HttpRequest) -> Result<T, HttpResponse> {
    if request.body.is_empty() {
        return Err(HttpResponse::bad_request("request body is required"));
    }
    serde_json::from_slice(&request.body)
        .map_err(|err| HttpResponse::bad_request(&format!("invalid JSON body: {err}")))
}

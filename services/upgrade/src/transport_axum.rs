use std::collections::HashMap;

use axum::{
    Router,
    body::{Body, to_bytes},
    extract::State,
    http::{HeaderValue, Request, Response, StatusCode, header::CONTENT_TYPE},
    response::IntoResponse,
    routing::any,
};
use tracing::info;

use crate::transport::{
    HttpRequest, HttpResponse, MAX_HTTP_BODY_BYTES, SharedRuntime, handle_request,
};

#[derive(Clone)]
struct AppState {
    runtime: SharedRuntime,
}

/// Serves the same routes as the std transport on a tokio runtime.
pub fn serve_http_with_axum(
    runtime: SharedRuntime,
    bind_addr: &str,
    worker_threads: usize,
) -> Result<(), String> {
    let worker_threads = worker_threads.max(1);
    let tokio_runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()
        .map_err(|e| format!("failed to build tokio runtime: {e}"))?;

    let bind_addr = bind_addr.to_string();
    tokio_runtime.block_on(async move {
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .map_err(|e| format!("failed to bind {bind_addr}: {e}"))?;
        info!(bind_addr, worker_threads, "upgrade axum transport listening");

        axum::serve(listener, router(runtime))
            .await
            .map_err(|e| format!("axum server failed: {e}"))
    })
}

fn router(runtime: SharedRuntime) -> Router {
    Router::new()
        .fallback(any(dispatch))
        .with_state(AppState { runtime })
        .layer(axum::extract::DefaultBodyLimit::max(MAX_HTTP_BODY_BYTES))
}

async fn dispatch(State(state): State<AppState>, request: Request<Body>) -> impl IntoResponse {
    let method = request.method().to_string();
    let target = request
        .uri()
        .path_and_query()
        .map(|value| value.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());

    let mut headers = HashMap::new();
    for (name, value) in request.headers() {
        if let Ok(value) = value.to_str() {
            headers.insert(name.as_str().to_ascii_lowercase(), value.to_string());
        }
    }

    let body = match to_bytes(request.into_body(), MAX_HTTP_BODY_BYTES).await {
        Ok(bytes) => bytes.to_vec(),
        Err(err) => {
            return response_from_transport(HttpResponse::bad_request(&format!(
                "request body error: {err}"
            )));
        }
    };

    let request = HttpRequest {
        method,
        target,
        headers,
        body,
    };

    // Store calls block on disk writes; keep them off the async workers.
    let runtime = state.runtime.clone();
    let response = tokio::task::spawn_blocking(move || handle_request(&runtime, &request))
        .await
        .unwrap_or_else(|err| {
            HttpResponse::internal_server_error(&format!("request handler failed: {err}"))
        });
    response_from_transport(response)
}

fn response_from_transport(response: HttpResponse) -> Response<Body> {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut out = Response::new(Body::from(response.body));
    *out.status_mut() = status;
    out.headers_mut().insert(
        CONTENT_TYPE,
        response
            .content_type
            .parse()
            .unwrap_or(HeaderValue::from_static("application/json")),
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::UpgradeRuntime;
    use schema::manifest_builder;
    use store::{SessionStore, StoreConfig};
    use tempfile::TempDir;

    fn sample_state(dir: &TempDir) -> AppState {
        AppState {
            runtime: UpgradeRuntime::shared(SessionStore::new(StoreConfig {
                auto_save_interval: None,
                ..StoreConfig::in_dir(dir.path())
            })),
        }
    }

    async fn body_text(response: Response<Body>) -> String {
        let bytes = to_bytes(response.into_body(), MAX_HTTP_BODY_BYTES)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn dispatch_health_returns_ok_json() {
        let dir = TempDir::new().unwrap();
        let request = Request::builder()
            .method("GET")
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let response = dispatch(State(sample_state(&dir)), request)
            .await
            .into_response();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_text(response).await;
        assert!(body.contains("\"status\":\"ok\""));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn dispatch_create_session_then_conflict() {
        let dir = TempDir::new().unwrap();
        let state = sample_state(&dir);
        let body = serde_json::json!({
            "session_id": "axum-1",
            "manifest": manifest_builder("1.0.0", &[("main", 16)]),
        })
        .to_string();

        let first = Request::builder()
            .method("POST")
            .uri("/v1/sessions")
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body.clone()))
            .unwrap();
        let response = dispatch(State(state.clone()), first).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let second = Request::builder()
            .method("POST")
            .uri("/v1/sessions")
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .unwrap();
        let response = dispatch(State(state.clone()), second).await.into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let metrics = Request::builder()
            .method("GET")
            .uri("/metrics")
            .body(Body::empty())
            .unwrap();
        let response = dispatch(State(state), metrics).await.into_response();
        let body = body_text(response).await;
        assert!(body.contains("fwup_sessions_created_total 1"));
        assert!(body.contains("fwup_session_create_failed_total 1"));
    }
}

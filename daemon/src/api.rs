//! The control API: the HTTP/JSON surface through which the external driver
//! publishes routing tables and search paths.
//!
//! Every mutation is pushed through the interceptor queue and, once applied,
//! followed by a host DNS-cache flush so stale answers die with the old
//! tables.

use crate::interceptor::Interceptor;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use intercept_model::Table;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

#[derive(Clone)]
struct ApiState {
    interceptor: Interceptor,
    /// Invoked by `POST /api/shutdown`; delivers an interrupt to the daemon.
    interrupt: Arc<dyn Fn() + Send + Sync>,
}

/// Serves the API until `shutdown` fires, then drains in-flight requests.
pub async fn serve(
    listener: TcpListener,
    interceptor: Interceptor,
    shutdown: oneshot::Receiver<()>,
) -> std::io::Result<()> {
    let app = router(interceptor, || {
        if let Err(e) = nix::sys::signal::raise(nix::sys::signal::Signal::SIGINT) {
            tracing::error!("failed to deliver shutdown interrupt: {e}");
        }
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = shutdown.await;
        })
        .await
}

fn router(interceptor: Interceptor, interrupt: impl Fn() + Send + Sync + 'static) -> Router {
    Router::new()
        .route("/healthz", get(|| async { StatusCode::OK }))
        .route("/api/tables/", get(list_tables).post(post_tables))
        .route("/api/tables/{name}", get(get_table).delete(delete_table))
        .route("/api/search", get(get_search).post(post_search))
        .route("/api/shutdown", post(shutdown))
        .with_state(ApiState {
            interceptor,
            interrupt: Arc::new(interrupt),
        })
}

async fn list_tables(State(state): State<ApiState>) -> Response {
    match state.interceptor.render(None).await {
        Ok(Some(json)) => json_response(json),
        Ok(None) => internal_error("render returned no snapshot"),
        Err(e) => internal_error(e),
    }
}

async fn get_table(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
    match state.interceptor.render(Some(name.clone())).await {
        Ok(Some(json)) => json_response(json),
        Ok(None) => (StatusCode::NOT_FOUND, format!("no table named {name}\n")).into_response(),
        Err(e) => internal_error(e),
    }
}

async fn post_tables(State(state): State<ApiState>, body: Bytes) -> Response {
    let tables: Vec<Table> = match serde_json::from_slice(&body) {
        Ok(tables) => tables,
        Err(e) => return (StatusCode::BAD_REQUEST, format!("{e}\n")).into_response(),
    };

    for table in tables {
        if let Err(e) = state.interceptor.update(table).await {
            return internal_error(e);
        }
    }
    dns_control::flush_caches().await;

    StatusCode::OK.into_response()
}

/// Always 200, present or not.
async fn delete_table(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
    if let Err(e) = state.interceptor.delete(name).await {
        return internal_error(e);
    }
    dns_control::flush_caches().await;

    StatusCode::OK.into_response()
}

async fn get_search(State(state): State<ApiState>) -> Json<Vec<String>> {
    Json(state.interceptor.search_path())
}

async fn post_search(State(state): State<ApiState>, body: Bytes) -> Response {
    let paths: Vec<String> = match serde_json::from_slice(&body) {
        Ok(paths) => paths,
        Err(e) => return (StatusCode::BAD_REQUEST, format!("{e}\n")).into_response(),
    };

    if let Err(e) = state.interceptor.set_search_path(paths).await {
        return internal_error(e);
    }
    dns_control::flush_caches().await;

    StatusCode::OK.into_response()
}

async fn shutdown(State(state): State<ApiState>) -> &'static str {
    tracing::info!("shutdown requested over the control API");
    (state.interrupt)();

    // The response outlives the interrupt: the server drains in-flight
    // requests before it stops.
    "Goodbye!\n"
}

fn json_response(json: String) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        json,
    )
        .into_response()
}

fn internal_error(e: impl ToString) -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, format!("{}\n", e.to_string())).into_response()
}

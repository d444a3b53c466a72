use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::{DefaultOnFailure, DefaultOnResponse, TraceLayer};
use tracing::{error, info, Level};

use crate::batch::{Batcher, FatalReceiver};
use crate::metrics::Metrics;
use crate::payload::Payload;

/// Shared state for axum handlers.
pub struct AppState {
    pub batcher: Arc<Batcher>,
    pub metrics: Arc<Metrics>,
}

/// Builds the full router: `/v1/log`, `/v1/healthz` and `/metrics`, wrapped
/// in request logging and panic recovery.
pub fn router(state: Arc<AppState>, development: bool) -> Router {
    let v1 = Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/log", post(log_handler));

    let app = Router::new()
        .nest("/v1", v1)
        .route("/metrics", get(metrics_handler))
        .with_state(state);

    with_middleware(app, development)
}

/// Adds request logging and panic recovery to `app`.
///
/// Panic details are only logged in development mode.
pub fn with_middleware(app: Router, development: bool) -> Router {
    app.layer(CatchPanicLayer::custom(
        move |err: Box<dyn Any + Send + 'static>| panic_response(err, development),
    ))
    .layer(
        TraceLayer::new_for_http()
            .on_response(DefaultOnResponse::new().level(Level::INFO))
            .on_failure(DefaultOnFailure::new().level(Level::ERROR)),
    )
}

/// Binds the HTTP listener on all interfaces.
pub async fn bind(port: u16) -> Result<TcpListener> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("listening on {addr}"))
}

/// Serves `app` until `ctx` is cancelled.
pub async fn serve(listener: TcpListener, app: Router, ctx: CancellationToken) -> Result<()> {
    let local_addr = listener.local_addr().context("getting local address")?;
    info!(addr = %local_addr, "http server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            ctx.cancelled().await;
        })
        .await
        .context("serving http")
}

/// Serves `app` until `ctx` is cancelled or a batch delivery fails fatally.
///
/// A fatal delivery error cancels `ctx` and is returned as the error.
pub async fn run(
    listener: TcpListener,
    app: Router,
    ctx: CancellationToken,
    mut fatal: FatalReceiver,
) -> Result<()> {
    let serve = serve(listener, app, ctx.clone());
    tokio::pin!(serve);

    tokio::select! {
        res = &mut serve => res,
        Some(err) = fatal.recv() => {
            error!(error = %err, "batch delivery failed permanently, exiting");
            ctx.cancel();
            Err(anyhow::Error::new(err))
        }
    }
}

/// POST /v1/log - Accepts one payload into the batch buffer.
///
/// An empty body is accepted as a payload with every field zeroed.
async fn log_handler(State(state): State<Arc<AppState>>, body: Bytes) -> (StatusCode, &'static str) {
    let decoded = if body.is_empty() {
        Ok(Payload::default())
    } else {
        serde_json::from_slice::<Payload>(&body)
    };

    match decoded {
        Ok(payload) => {
            state.metrics.payloads_received.inc();
            state.batcher.add(payload).await;
            (StatusCode::OK, "Webhook received")
        }
        Err(e) => {
            state.metrics.payloads_rejected.inc();
            error!(error = %e, "failed to bind payload");
            (StatusCode::BAD_REQUEST, "Invalid payload")
        }
    }
}

/// GET /v1/healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "OK"
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.metrics.encode_text() {
        Ok(text) => (StatusCode::OK, text).into_response(),
        Err(e) => {
            error!(error = %e, "encoding metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "encoding error").into_response()
        }
    }
}

fn panic_response(err: Box<dyn Any + Send + 'static>, development: bool) -> Response {
    if development {
        let detail = if let Some(s) = err.downcast_ref::<String>() {
            s.as_str()
        } else if let Some(s) = err.downcast_ref::<&str>() {
            s
        } else {
            "unknown panic payload"
        };
        error!(panic = detail, "panic recovered");
    } else {
        error!("panic recovered");
    }

    (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
}

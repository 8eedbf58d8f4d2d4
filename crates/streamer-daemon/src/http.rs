/// HTTP control API.
///
/// One route per action (any method), plus `GET /radio/status`.  Verb errors
/// become a 500 carrying the error text; success is an empty 200.  Handler
/// panics are turned into a 500 and forwarded to the fatal channel.
use std::any::Any;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use streamer_proto::protocol::Action;
use tokio_util::sync::CancellationToken;
use tower_http::catch_panic::CatchPanicLayer;
use tracing::{info, warn};

use crate::recover::{forward_panic, FatalSender};
use crate::service::{ControlService, ServiceError};

#[derive(Clone)]
struct ApiState {
    service: Arc<ControlService>,
    step: f64,
}

pub fn router(service: Arc<ControlService>, step: f64, fatal: FatalSender) -> Router {
    with_recovery(routes(), fatal).with_state(ApiState { service, step })
}

fn routes() -> Router<ApiState> {
    let mut routes = Router::new().route("/radio/status", get(status));
    for action in Action::ALL {
        routes = routes.route(
            action.route(),
            any(move |State(state): State<ApiState>| async move {
                respond(action, state.service.perform(action, state.step).await)
            }),
        );
    }
    routes
}

fn with_recovery(routes: Router<ApiState>, fatal: FatalSender) -> Router<ApiState> {
    routes.layer(CatchPanicLayer::custom(
        move |payload: Box<dyn Any + Send + 'static>| {
            let message = forward_panic(&fatal, "http", &*payload);
            (StatusCode::INTERNAL_SERVER_ERROR, message).into_response()
        },
    ))
}

fn respond(action: Action, result: Result<(), ServiceError>) -> Response {
    match result {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => {
            warn!("http: {:?} failed: {}", action, e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn status(State(state): State<ApiState>) -> Response {
    match state.service.status().await {
        Ok(status) => Json(status).into_response(),
        Err(e) => {
            warn!("http: status failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// Serves until `shutdown` is cancelled.
pub async fn serve(address: &str, app: Router, shutdown: CancellationToken) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(address)
        .await
        .with_context(|| format!("cannot bind HTTP API on {}", address))?;
    info!("HTTP API listening on http://{}", address);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("HTTP API server failed")?;

    info!("HTTP API stopped");
    Ok(())
}

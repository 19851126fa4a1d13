use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use stockchat_core::{AppContext, PredictOutcome, ResponseStatus, handle_question};
use tracing::{error, info};

#[derive(Debug, Deserialize)]
struct Question {
    session_id: i64,
    question: String,
}

#[derive(Debug, Serialize)]
struct PredictResponse {
    status: &'static str,
    response: String,
}

#[derive(Debug, Serialize)]
struct ApiHealth {
    status: &'static str,
}

pub fn router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/predict", post(predict))
        .route("/api/health", get(api_health))
        .with_state(ctx)
}

pub async fn serve(bind_addr: &str, ctx: Arc<AppContext>) -> Result<()> {
    let app = router(ctx);
    let addr: SocketAddr = bind_addr
        .parse()
        .with_context(|| format!("invalid bind address: {bind_addr}"))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("listening on {addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown signal received");
    }
}

async fn api_health() -> Json<ApiHealth> {
    Json(ApiHealth { status: "ok" })
}

async fn predict(
    State(ctx): State<Arc<AppContext>>,
    Json(payload): Json<Question>,
) -> (StatusCode, Json<PredictResponse>) {
    let session_id = payload.session_id;
    let question = payload.question;

    // The pipeline blocks on the provider and the engine; keep it off the
    // request-accepting workers.
    let outcome =
        tokio::task::spawn_blocking(move || handle_question(&ctx, session_id, &question)).await;

    match outcome {
        Ok(outcome) => respond(outcome),
        Err(err) => {
            error!("predict task failed for session {session_id}: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(PredictResponse {
                    status: ResponseStatus::Error.as_str(),
                    response: "Internal server error. Please retry later.".to_string(),
                }),
            )
        }
    }
}

fn respond(outcome: PredictOutcome) -> (StatusCode, Json<PredictResponse>) {
    let code = match outcome.status {
        // Handled fallbacks are successes; only a failed fallback is a 500.
        ResponseStatus::Success => StatusCode::OK,
        ResponseStatus::Error => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        code,
        Json(PredictResponse {
            status: outcome.status.as_str(),
            response: outcome.response,
        }),
    )
}

//! Mock Ollama engine for testing the model puller.
//!
//! Emulates the three endpoints the puller touches:
//!
//! - `POST /api/pull` - newline-delimited JSON progress stream
//! - `GET /api/tags` - models pulled so far
//! - `DELETE /api/delete` - forget a model
//!
//! Failure injection by model name: names starting with `fail:` emit an
//! error frame mid-stream; names starting with `eof:` end the stream
//! without a success record.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::Utc;
use clap::Parser;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "mock-ollama")]
#[command(about = "Mock Ollama engine for testing")]
struct Args {
    /// Port to listen on (0 for dynamic allocation)
    #[arg(short, long, default_value = "11434")]
    port: u16,

    /// Delay between progress frames (ms)
    #[arg(long, default_value = "5")]
    frame_delay_ms: u64,
}

#[derive(Debug, Clone)]
struct PulledModel {
    size: i64,
    digest: String,
    modified_at: String,
}

struct MockState {
    models: RwLock<HashMap<String, PulledModel>>,
    frame_delay_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("mock_ollama=debug")
        .init();

    let args = Args::parse();
    let state = Arc::new(MockState {
        models: RwLock::new(HashMap::new()),
        frame_delay_ms: args.frame_delay_ms,
    });

    let app = Router::new()
        .route("/api/pull", post(pull))
        .route("/api/tags", get(tags))
        .route("/api/delete", delete(delete_model))
        .with_state(state);

    let listener = TcpListener::bind(format!("0.0.0.0:{}", args.port)).await?;
    let actual_port = listener.local_addr()?.port();
    info!(port = actual_port, "mock Ollama engine listening");

    // Readiness signal for the test harness.
    println!("READY {actual_port}");

    axum::serve(listener, app).await?;
    Ok(())
}

#[derive(Deserialize)]
struct PullRequest {
    name: String,
}

async fn pull(
    State(state): State<Arc<MockState>>,
    Json(request): Json<PullRequest>,
) -> impl IntoResponse {
    let name = request.name.clone();
    let digest = format!("sha256:{:032x}", name.len() as u128 * 7919);
    let total: i64 = 4096;
    let delay = std::time::Duration::from_millis(state.frame_delay_ms);

    let fail = name.starts_with("fail:");
    let eof_early = name.starts_with("eof:");

    let stream = async_stream_frames(state, name, digest, total, delay, fail, eof_early);
    Body::from_stream(stream)
}

fn async_stream_frames(
    state: Arc<MockState>,
    name: String,
    digest: String,
    total: i64,
    delay: std::time::Duration,
    fail: bool,
    eof_early: bool,
) -> impl futures::Stream<Item = Result<String, Infallible>> {
    async_stream(move |tx| async move {
        let frame = |value: serde_json::Value| format!("{value}\n");

        let _ = tx
            .send(Ok(frame(json!({"status": "pulling manifest"}))))
            .await;
        tokio::time::sleep(delay).await;

        for step in 1..=4u32 {
            if fail && step == 3 {
                let _ = tx
                    .send(Ok(frame(json!({"error": "injected pull failure"}))))
                    .await;
                return;
            }
            if eof_early && step == 3 {
                return;
            }
            let completed = total * i64::from(step) / 4;
            let _ = tx
                .send(Ok(frame(json!({
                    "status": "downloading",
                    "digest": digest,
                    "total": total,
                    "completed": completed,
                }))))
                .await;
            tokio::time::sleep(delay).await;
        }

        let _ = tx
            .send(Ok(frame(json!({"status": "verifying sha256 digest"}))))
            .await;

        state.models.write().await.insert(
            name,
            PulledModel {
                size: total,
                digest,
                modified_at: Utc::now().to_rfc3339(),
            },
        );

        let _ = tx.send(Ok(frame(json!({"status": "success"})))).await;
    })
}

/// Tiny channel-backed stream helper (avoids an async-generator dependency).
fn async_stream<F, Fut>(producer: F) -> tokio_stream::wrappers::ReceiverStream<Result<String, Infallible>>
where
    F: FnOnce(tokio::sync::mpsc::Sender<Result<String, Infallible>>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let (tx, rx) = tokio::sync::mpsc::channel(8);
    tokio::spawn(producer(tx));
    tokio_stream::wrappers::ReceiverStream::new(rx)
}

async fn tags(State(state): State<Arc<MockState>>) -> impl IntoResponse {
    let models = state.models.read().await;
    let entries: Vec<_> = models
        .iter()
        .map(|(name, model)| {
            json!({
                "name": name,
                "size": model.size,
                "digest": model.digest,
                "modified_at": model.modified_at,
            })
        })
        .collect();
    Json(json!({ "models": entries }))
}

#[derive(Deserialize)]
struct DeleteRequest {
    name: String,
}

async fn delete_model(
    State(state): State<Arc<MockState>>,
    Json(request): Json<DeleteRequest>,
) -> impl IntoResponse {
    let mut models = state.models.write().await;
    if models.remove(&request.name).is_some() {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}

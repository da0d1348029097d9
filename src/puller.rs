//! Ollama model puller.
//!
//! A pull is a long-lived HTTP response from the engine whose body is a
//! sequence of newline-delimited JSON progress records. The puller runs as
//! a producer task that decodes the stream and pushes structured events
//! into a bounded channel; the HTTP handler consumes the other end. If the
//! subscriber goes away the producer keeps draining the upstream so the
//! engine-side outcome (model downloaded or not) stays deterministic - only
//! event delivery is abandoned.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ApiError;
use crate::store::Store;
use crate::types::{Instance, ModelStatus};

/// Progress frame as emitted by the engine and forwarded to subscribers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PullProgress {
    #[serde(default)]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: String,
    #[serde(default)]
    size: Option<i64>,
    #[serde(default)]
    digest: Option<String>,
    #[serde(default)]
    modified_at: Option<String>,
}

pub struct ModelPuller {
    store: Arc<Store>,
    client: reqwest::Client,
    default_hostname: String,
}

impl ModelPuller {
    pub fn new(store: Arc<Store>, default_hostname: String) -> Self {
        Self {
            store,
            client: reqwest::Client::new(),
            default_hostname,
        }
    }

    fn base_url(&self, instance: &Instance) -> String {
        let host = instance
            .config
            .hostname
            .clone()
            .unwrap_or_else(|| self.default_hostname.clone());
        format!("http://{host}:{}", instance.port)
    }

    /// Start pulling `model` into `instance`. Returns the subscriber end of
    /// the progress channel; the transfer itself runs detached.
    pub async fn pull(
        &self,
        instance: &Instance,
        model: &str,
    ) -> Result<mpsc::Receiver<PullProgress>, ApiError> {
        if model.trim().is_empty() {
            return Err(ApiError::Validation(
                "modelName must not be empty".to_string(),
            ));
        }

        self.store
            .upsert_model(instance.id, model, ModelStatus::Downloading, None, None, None)
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?;

        let (tx, rx) = mpsc::channel(32);
        let store = Arc::clone(&self.store);
        let client = self.client.clone();
        let base_url = self.base_url(instance);
        let instance_id = instance.id;
        let model = model.to_string();

        tokio::spawn(async move {
            run_pull(store, client, base_url, instance_id, model, tx).await;
        });

        Ok(rx)
    }

    /// Delete a model from the engine, then drop its record. A model the
    /// engine has already forgotten still gets its record removed.
    pub async fn delete_model(&self, instance: &Instance, model: &str) -> Result<(), ApiError> {
        let url = format!("{}/api/delete", self.base_url(instance));
        let response = self
            .client
            .delete(&url)
            .json(&serde_json::json!({ "name": model }))
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| ApiError::Driver(format!("engine delete failed: {e}")))?;

        if !response.status().is_success() && response.status() != reqwest::StatusCode::NOT_FOUND
        {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Driver(format!(
                "engine delete returned {status}: {body}"
            )));
        }

        match self.store.delete_model(instance.id, model).await {
            Ok(()) => Ok(()),
            Err(crate::store::StoreError::NotFound) => {
                Err(ApiError::NotFound(format!("model {model}")))
            }
            Err(e) => Err(ApiError::Internal(e.to_string())),
        }
    }
}

async fn run_pull(
    store: Arc<Store>,
    client: reqwest::Client,
    base_url: String,
    instance_id: Uuid,
    model: String,
    tx: mpsc::Sender<PullProgress>,
) {
    let url = format!("{base_url}/api/pull");
    info!(instance = %instance_id, model = %model, "starting model pull");

    let response = match client
        .post(&url)
        .json(&serde_json::json!({ "name": model, "stream": true }))
        .send()
        .await
    {
        Ok(r) if r.status().is_success() => r,
        Ok(r) => {
            let status = r.status();
            let body = r.text().await.unwrap_or_default();
            fail(&store, instance_id, &model, &tx, format!("engine returned {status}: {body}"))
                .await;
            return;
        }
        Err(e) => {
            fail(&store, instance_id, &model, &tx, format!("engine unreachable: {e}")).await;
            return;
        }
    };

    let mut saw_success = false;
    let mut last_digest: Option<String> = None;
    let mut last_total: Option<i64> = None;
    // Once the subscriber hangs up we stop sending but keep draining.
    let mut delivering = true;
    let mut buffer = Vec::new();

    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                fail(&store, instance_id, &model, &tx, format!("stream error: {e}")).await;
                return;
            }
        };
        buffer.extend_from_slice(&chunk);

        while let Some(newline) = buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let progress: PullProgress = match serde_json::from_str(line) {
                Ok(p) => p,
                Err(e) => {
                    debug!(line, error = %e, "skipping unparseable progress record");
                    continue;
                }
            };

            if let Some(err) = progress.error.clone() {
                if delivering {
                    let _ = tx.send(progress).await;
                }
                fail(&store, instance_id, &model, &tx, err).await;
                return;
            }

            if progress.digest.is_some() {
                last_digest = progress.digest.clone();
            }
            if progress.total.is_some() {
                last_total = progress.total;
            }
            if progress.status == "success" {
                saw_success = true;
            }

            if delivering && tx.send(progress).await.is_err() {
                debug!(model = %model, "subscriber disconnected; continuing pull in background");
                delivering = false;
            }
        }
    }

    if !saw_success {
        fail(
            &store,
            instance_id,
            &model,
            &tx,
            "stream ended without a success record".to_string(),
        )
        .await;
        return;
    }

    // The success frame itself carries no size; fetch the engine's model
    // listing to fill in size/digest/modified time.
    let (size, digest, modified_at) =
        match inspect_model(&client, &base_url, &model).await {
            Some(entry) => entry,
            None => (None, last_digest, None),
        };
    let size = size.or(last_total);

    if let Err(e) = store
        .upsert_model(
            instance_id,
            &model,
            ModelStatus::Ready,
            size,
            digest.as_deref(),
            modified_at,
        )
        .await
    {
        warn!(instance = %instance_id, model = %model, error = %e, "failed to record ready model");
    }
    info!(instance = %instance_id, model = %model, "model pull complete");
}

/// Mark the record failed and push a terminal error frame if anyone is
/// still listening.
async fn fail(
    store: &Store,
    instance_id: Uuid,
    model: &str,
    tx: &mpsc::Sender<PullProgress>,
    reason: String,
) {
    warn!(instance = %instance_id, model = %model, reason = %reason, "model pull failed");
    if let Err(e) = store
        .upsert_model(instance_id, model, ModelStatus::Failed, None, None, None)
        .await
    {
        warn!(instance = %instance_id, model = %model, error = %e, "failed to record pull failure");
    }
    let _ = tx
        .send(PullProgress {
            status: "error".to_string(),
            error: Some(reason),
            ..PullProgress::default()
        })
        .await;
}

async fn inspect_model(
    client: &reqwest::Client,
    base_url: &str,
    model: &str,
) -> Option<(Option<i64>, Option<String>, Option<DateTime<Utc>>)> {
    let url = format!("{base_url}/api/tags");
    let response = client
        .get(&url)
        .timeout(Duration::from_secs(10))
        .send()
        .await
        .ok()?;
    let tags: TagsResponse = response.json().await.ok()?;

    let entry = tags.models.into_iter().find(|m| m.name == model)?;
    let modified_at = entry
        .modified_at
        .as_deref()
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|dt| dt.with_timezone(&Utc));
    Some((entry.size, entry.digest, modified_at))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_parses_engine_frames() {
        let p: PullProgress = serde_json::from_str(r#"{"status":"pulling manifest"}"#).unwrap();
        assert_eq!(p.status, "pulling manifest");
        assert!(p.digest.is_none());

        let p: PullProgress = serde_json::from_str(
            r#"{"status":"downloading","digest":"sha256:ab","total":100,"completed":40}"#,
        )
        .unwrap();
        assert_eq!(p.digest.as_deref(), Some("sha256:ab"));
        assert_eq!(p.total, Some(100));
        assert_eq!(p.completed, Some(40));

        let p: PullProgress = serde_json::from_str(r#"{"error":"boom"}"#).unwrap();
        assert_eq!(p.error.as_deref(), Some("boom"));
    }

    #[test]
    fn tags_response_parses() {
        let raw = r#"{"models":[{"name":"m:1","size":123,"digest":"sha256:ff","modified_at":"2025-06-01T10:00:00Z"}]}"#;
        let tags: TagsResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(tags.models.len(), 1);
        assert_eq!(tags.models[0].name, "m:1");
        assert_eq!(tags.models[0].size, Some(123));
    }
}

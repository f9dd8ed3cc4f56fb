use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{info, warn};

use crate::shared::models::AppState;

/// Periodic stats session: one snapshot per second with the volume's disk
/// usage attached. When the disk limit is breached while the container
/// runs, the container is stopped once for the lifetime of the session.
pub async fn run_stats_loop(
    app: Arc<AppState>,
    container_id: String,
    volume_id: Option<String>,
    out: mpsc::Sender<Message>,
) {
    let disk_limit = match &volume_id {
        Some(volume_id) => app
            .states
            .get(volume_id)
            .await
            .ok()
            .flatten()
            .map(|record| record.disk_limit)
            .unwrap_or(0),
        None => 0,
    };

    let mut auto_stopped = false;
    let mut ticker = interval(Duration::from_secs(1));

    loop {
        ticker.tick().await;

        let payload = match sample(&app, &container_id, volume_id.as_deref(), disk_limit).await {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Stats sample for {} failed: {}", container_id, e);
                json!({ "error": "Failed to fetch stats" })
            }
        };

        let exceeded = payload
            .get("storageExceeded")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        if out
            .send(Message::Text(payload.to_string().into()))
            .await
            .is_err()
        {
            return;
        }

        if exceeded && !auto_stopped {
            match app.docker.is_running(&container_id).await {
                Ok(true) => {
                    info!(
                        "Disk limit breached for {}, stopping container {}",
                        volume_id.as_deref().unwrap_or("?"),
                        container_id
                    );
                    if let Err(e) = app.docker.stop(&container_id, None).await {
                        warn!("Auto-stop of {} failed: {}", container_id, e);
                    } else {
                        auto_stopped = true;
                    }
                }
                Ok(false) => {}
                Err(e) => warn!("Running check for {} failed: {}", container_id, e),
            }
        }
    }
}

async fn sample(
    app: &AppState,
    container_id: &str,
    volume_id: Option<&str>,
    disk_limit: u64,
) -> anyhow::Result<serde_json::Value> {
    let stats = app.docker.stats_once(container_id).await?;

    let volume_size = match volume_id {
        Some(volume_id) => app.volumes.volume_size_mib(volume_id).await.unwrap_or(0),
        None => 0,
    };

    let mut payload = serde_json::to_value(&stats)?;
    let object = payload
        .as_object_mut()
        .ok_or_else(|| anyhow::anyhow!("stats snapshot is not an object"))?;
    object.insert("volumeSize".to_string(), json!(volume_size));
    object.insert("diskLimit".to_string(), json!(disk_limit));
    object.insert(
        "storageExceeded".to_string(),
        json!(storage_exceeded(disk_limit, volume_size)),
    );

    Ok(payload)
}

/// A zero limit disables quota enforcement entirely.
fn storage_exceeded(disk_limit: u64, volume_size: u64) -> bool {
    disk_limit > 0 && volume_size >= disk_limit
}

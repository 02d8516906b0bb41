//! Recording service client - camera control at delivery boundaries
//!
//! Drives the real-time video recorder: start on delivery-open, stop on
//! delivery-close, plus progress-image requests while a delivery runs.
//! Every call is best-effort with a bounded timeout; a failure is logged
//! and swallowed, never surfaced to the ledger path that already committed.

use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

pub struct RecordingClient {
    base_url: String,
    topic: String,
    client: Option<reqwest::Client>,
    metrics: Arc<Metrics>,
}

impl RecordingClient {
    pub fn new(config: &Config, metrics: Arc<Metrics>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.recording_timeout_ms()))
            .http1_only()
            .build()
            .ok();

        Self {
            base_url: config.recording_base_url().trim_end_matches('/').to_string(),
            topic: config.recording_topic().to_string(),
            client,
            metrics,
        }
    }

    /// Start real-time video recording for a gate
    pub async fn start_recording(&self, gate_id: &str, event_uid: &str) {
        self.post(
            "/event/rt_video/start",
            &[("gate_id", gate_id), ("event_uid", event_uid), ("topic", &self.topic)],
            "recording_start",
        )
        .await;
    }

    /// Stop real-time video recording for a gate
    pub async fn stop_recording(&self, gate_id: &str, event_uid: &str) {
        self.post(
            "/event/rt_video/stop",
            &[("gate_id", gate_id), ("event_uid", event_uid), ("topic", &self.topic)],
            "recording_stop",
        )
        .await;
    }

    /// Request a progress image for an open delivery
    pub async fn request_image(&self, gate_id: &str) {
        self.post("/event/image", &[("gate_id", gate_id)], "image_request").await;
    }

    async fn post(&self, path: &str, params: &[(&str, &str)], op: &'static str) {
        let Some(ref client) = self.client else {
            error!(op = %op, "recording_client_not_initialized");
            self.metrics.record_notify_failure();
            return;
        };

        let url = format!("{}{}", self.base_url, path);
        let request = client.post(&url).header("Accept", "application/json").query(params);

        match request.send().await {
            Ok(response) => {
                info!(
                    op = %op,
                    url = %url,
                    status = %response.status().as_u16(),
                    "recording_request_sent"
                );
            }
            Err(e) => {
                self.metrics.record_notify_failure();
                error!(op = %op, url = %url, error = %e, "recording_request_failed");
            }
        }
    }
}

//! Sync service client - cross-system replication of closed deliveries
//!
//! Pushes a normalized delivery-closed payload to the downstream sync
//! service. Best-effort like the recording client: a failed push is logged
//! and swallowed; the ledger record is already committed either way.

use crate::domain::delivery::Delivery;
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Normalized payload for a closed delivery
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryClosedPayload {
    pub delivery_uid: String,
    pub gate_id: String,
    pub location: String,
    pub start: String,
    pub end: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attributes: Option<crate::domain::delivery::AttributeMap>,
}

impl DeliveryClosedPayload {
    pub fn from_delivery(delivery: &Delivery) -> Self {
        Self {
            delivery_uid: delivery.delivery_uid.clone(),
            gate_id: delivery.gate_id.clone(),
            location: delivery.location.clone(),
            start: delivery.start.to_rfc3339(),
            end: delivery.end.map(|e| e.to_rfc3339()).unwrap_or_default(),
            status: delivery.status.as_str().to_string(),
            attributes: delivery.attributes.clone(),
        }
    }
}

pub struct SyncClient {
    base_url: String,
    enabled: bool,
    client: Option<reqwest::Client>,
    metrics: Arc<Metrics>,
}

impl SyncClient {
    pub fn new(config: &Config, metrics: Arc<Metrics>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.sync_timeout_ms()))
            .http1_only()
            .build()
            .ok();

        Self {
            base_url: config.sync_base_url().trim_end_matches('/').to_string(),
            enabled: config.sync_enabled(),
            client,
            metrics,
        }
    }

    /// Push a closed delivery to the sync service
    pub async fn push_closed(&self, delivery: &Delivery) {
        if !self.enabled {
            debug!(delivery_uid = %delivery.delivery_uid, "sync_disabled_skipped");
            return;
        }

        let Some(ref client) = self.client else {
            error!("sync_client_not_initialized");
            self.metrics.record_notify_failure();
            return;
        };

        let url = format!("{}/data", self.base_url);
        let payload = DeliveryClosedPayload::from_delivery(delivery);

        match client.post(&url).json(&payload).send().await {
            Ok(response) => {
                info!(
                    delivery_uid = %delivery.delivery_uid,
                    gate_id = %delivery.gate_id,
                    status = %response.status().as_u16(),
                    "sync_push_sent"
                );
            }
            Err(e) => {
                self.metrics.record_notify_failure();
                error!(
                    delivery_uid = %delivery.delivery_uid,
                    gate_id = %delivery.gate_id,
                    error = %e,
                    "sync_push_failed"
                );
            }
        }
    }
}

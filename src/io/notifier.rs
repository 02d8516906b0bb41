//! Production notifier - recording + sync behind the capability interface

use crate::domain::delivery::Delivery;
use crate::io::recording::RecordingClient;
use crate::io::sync::SyncClient;
use crate::services::dispatcher::DeliveryNotifier;
use async_trait::async_trait;

/// Drives the recording and sync services at delivery boundaries
pub struct HttpNotifier {
    recording: RecordingClient,
    sync: SyncClient,
}

impl HttpNotifier {
    pub fn new(recording: RecordingClient, sync: SyncClient) -> Self {
        Self { recording, sync }
    }
}

#[async_trait]
impl DeliveryNotifier for HttpNotifier {
    async fn notify_open(&self, delivery: &Delivery) {
        self.recording.start_recording(&delivery.gate_id, &delivery.delivery_uid).await;
    }

    async fn notify_close(&self, delivery: &Delivery) {
        self.recording.stop_recording(&delivery.gate_id, &delivery.delivery_uid).await;
        self.sync.push_closed(delivery).await;
    }

    async fn notify_snapshot(&self, delivery: &Delivery) {
        self.recording.request_image(&delivery.gate_id).await;
    }
}

//! Side-effect dispatcher - decoupled notification of downstream systems
//!
//! The engine emits effect intents into a bounded channel and moves on;
//! this worker drives the actual recording/sync calls so engine latency
//! never depends on downstream availability. All notifications are
//! best-effort: failures are logged inside the notifier and swallowed.
//!
//! While a delivery is open the dispatcher also emits progress snapshots,
//! rate-limited to one per `image_rate` interval per gate.

use crate::domain::delivery::Delivery;
use crate::infra::metrics::Metrics;
use crate::services::ledger::DeliveryLedger;
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Capability interface to the recording/sync collaborators
///
/// Implementations own their transport and error handling; none of these
/// calls can fail from the dispatcher's point of view.
#[async_trait]
pub trait DeliveryNotifier: Send + Sync {
    /// A delivery opened: start recording, announce the occupancy
    async fn notify_open(&self, delivery: &Delivery);
    /// A delivery closed: stop recording, replicate the closed record
    async fn notify_close(&self, delivery: &Delivery);
    /// Periodic progress snapshot for an open delivery
    async fn notify_snapshot(&self, delivery: &Delivery);
}

/// Effect intents emitted by the derivation engine
#[derive(Debug)]
pub enum EffectMessage {
    DeliveryOpened(Delivery),
    DeliveryClosed(Delivery),
}

/// Sender handle for effect intents
///
/// Clone this to share across producers. Non-blocking: if the channel is
/// full the message is dropped and counted, never stalling the engine.
#[derive(Clone)]
pub struct EffectSender {
    tx: mpsc::Sender<EffectMessage>,
    metrics: Arc<Metrics>,
}

impl EffectSender {
    pub fn send_opened(&self, delivery: Delivery) {
        if self.tx.try_send(EffectMessage::DeliveryOpened(delivery)).is_err() {
            self.metrics.record_effect_dropped();
            warn!("effect_channel_full_open_dropped");
        }
    }

    pub fn send_closed(&self, delivery: Delivery) {
        if self.tx.try_send(EffectMessage::DeliveryClosed(delivery)).is_err() {
            self.metrics.record_effect_dropped();
            warn!("effect_channel_full_close_dropped");
        }
    }
}

/// Create an effect channel pair
pub fn create_effect_channel(
    buffer_size: usize,
    metrics: Arc<Metrics>,
) -> (EffectSender, mpsc::Receiver<EffectMessage>) {
    let (tx, rx) = mpsc::channel(buffer_size);
    (EffectSender { tx, metrics }, rx)
}

/// Source of open deliveries for the snapshot tick
///
/// Seam over the ledger so tests can drive the scheduler directly.
pub trait OpenDeliveries: Send + Sync {
    fn open_deliveries(&self) -> Vec<Delivery>;
}

impl OpenDeliveries for DeliveryLedger {
    fn open_deliveries(&self) -> Vec<Delivery> {
        DeliveryLedger::open_deliveries(self)
    }
}

/// Worker that drains effect intents and drives the notifier
pub struct EffectDispatcher {
    rx: mpsc::Receiver<EffectMessage>,
    notifier: Arc<dyn DeliveryNotifier>,
    ledger: Arc<dyn OpenDeliveries>,
    metrics: Arc<Metrics>,
    image_rate: Duration,
    /// gate_id -> last snapshot emission
    last_snapshot: FxHashMap<String, Instant>,
}

impl EffectDispatcher {
    pub fn new(
        rx: mpsc::Receiver<EffectMessage>,
        notifier: Arc<dyn DeliveryNotifier>,
        ledger: Arc<dyn OpenDeliveries>,
        metrics: Arc<Metrics>,
        image_rate: Duration,
    ) -> Self {
        Self { rx, notifier, ledger, metrics, image_rate, last_snapshot: FxHashMap::default() }
    }

    /// Run the dispatcher until shutdown or channel close
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(image_rate_secs = %self.image_rate.as_secs(), "effect_dispatcher_started");
        let mut tick = tokio::time::interval(Duration::from_secs(1));

        loop {
            tokio::select! {
                msg = self.rx.recv() => {
                    match msg {
                        Some(msg) => self.handle_message(msg).await,
                        None => break,
                    }
                }
                _ = tick.tick() => {
                    self.snapshot_pass(Instant::now()).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("effect_dispatcher_stopped");
    }

    async fn handle_message(&mut self, msg: EffectMessage) {
        match msg {
            EffectMessage::DeliveryOpened(delivery) => {
                debug!(
                    gate_id = %delivery.gate_id,
                    delivery_id = %delivery.id,
                    "notify_open"
                );
                self.notifier.notify_open(&delivery).await;
                // An open delivery starts a fresh snapshot window
                self.last_snapshot.insert(delivery.gate_id.clone(), Instant::now());
            }
            EffectMessage::DeliveryClosed(delivery) => {
                debug!(
                    gate_id = %delivery.gate_id,
                    delivery_id = %delivery.id,
                    "notify_close"
                );
                self.notifier.notify_close(&delivery).await;
                self.last_snapshot.remove(&delivery.gate_id);
            }
        }
    }

    /// Emit snapshots for open deliveries whose window has elapsed
    async fn snapshot_pass(&mut self, now: Instant) {
        let open = self.ledger.open_deliveries();

        // Drop stale per-gate entries for gates with no open delivery
        self.last_snapshot.retain(|gate, _| open.iter().any(|d| &d.gate_id == gate));

        for delivery in open {
            let due = match self.last_snapshot.get(&delivery.gate_id) {
                Some(last) => now.duration_since(*last) >= self.image_rate,
                None => true,
            };
            if due {
                self.notifier.notify_snapshot(&delivery).await;
                self.metrics.record_snapshot_emitted();
                self.last_snapshot.insert(delivery.gate_id.clone(), now);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::delivery::{DeliveryId, DeliveryStatus};
    use chrono::{TimeZone, Utc};
    use parking_lot::Mutex;

    /// Notifier that records every call for assertions
    #[derive(Default)]
    struct RecordingNotifier {
        calls: Mutex<Vec<String>>,
    }

    impl RecordingNotifier {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl DeliveryNotifier for RecordingNotifier {
        async fn notify_open(&self, delivery: &Delivery) {
            self.calls.lock().push(format!("open:{}", delivery.gate_id));
        }
        async fn notify_close(&self, delivery: &Delivery) {
            self.calls.lock().push(format!("close:{}", delivery.gate_id));
        }
        async fn notify_snapshot(&self, delivery: &Delivery) {
            self.calls.lock().push(format!("snapshot:{}", delivery.gate_id));
        }
    }

    struct FixedOpen(Vec<Delivery>);

    impl OpenDeliveries for FixedOpen {
        fn open_deliveries(&self) -> Vec<Delivery> {
            self.0.clone()
        }
    }

    fn delivery(gate: &str) -> Delivery {
        let ts = Utc.timestamp_opt(1_000, 0).unwrap();
        Delivery {
            id: DeliveryId(1),
            gate_id: gate.to_string(),
            delivery_uid: "E1".to_string(),
            start: ts,
            end: None,
            status: DeliveryStatus::Open,
            location: gate.to_string(),
            attributes: None,
            created_at: ts,
        }
    }

    fn dispatcher(
        open: Vec<Delivery>,
        image_rate: Duration,
    ) -> (EffectDispatcher, EffectSender, Arc<RecordingNotifier>) {
        let metrics = Arc::new(Metrics::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let (sender, rx) = create_effect_channel(8, metrics.clone());
        let dispatcher = EffectDispatcher::new(
            rx,
            notifier.clone(),
            Arc::new(FixedOpen(open)),
            metrics,
            image_rate,
        );
        (dispatcher, sender, notifier)
    }

    #[tokio::test]
    async fn test_open_and_close_notified_once() {
        let (mut dispatcher, sender, notifier) = dispatcher(vec![], Duration::from_secs(10));

        sender.send_opened(delivery("gate01"));
        sender.send_closed(delivery("gate01"));

        let msg = dispatcher.rx.recv().await.unwrap();
        dispatcher.handle_message(msg).await;
        let msg = dispatcher.rx.recv().await.unwrap();
        dispatcher.handle_message(msg).await;

        assert_eq!(notifier.calls(), vec!["open:gate01", "close:gate01"]);
    }

    #[tokio::test]
    async fn test_snapshot_rate_limited_per_gate() {
        let (mut dispatcher, _sender, notifier) =
            dispatcher(vec![delivery("gate01")], Duration::from_secs(10));

        let t0 = Instant::now();
        dispatcher.snapshot_pass(t0).await; // first is always due
        dispatcher.snapshot_pass(t0 + Duration::from_secs(5)).await; // inside window
        dispatcher.snapshot_pass(t0 + Duration::from_secs(11)).await; // window elapsed

        assert_eq!(notifier.calls(), vec!["snapshot:gate01", "snapshot:gate01"]);
    }

    #[tokio::test]
    async fn test_snapshot_windows_independent_per_gate() {
        let (mut dispatcher, _sender, notifier) =
            dispatcher(vec![delivery("gate01"), delivery("gate02")], Duration::from_secs(10));

        let t0 = Instant::now();
        dispatcher.snapshot_pass(t0).await;

        let calls = notifier.calls();
        assert!(calls.contains(&"snapshot:gate01".to_string()));
        assert!(calls.contains(&"snapshot:gate02".to_string()));
    }

    #[tokio::test]
    async fn test_no_snapshot_without_open_delivery() {
        let (mut dispatcher, _sender, notifier) = dispatcher(vec![], Duration::from_secs(10));

        dispatcher.snapshot_pass(Instant::now()).await;

        assert!(notifier.calls().is_empty());
    }

    #[tokio::test]
    async fn test_close_resets_snapshot_window() {
        let (mut dispatcher, _sender, _notifier) =
            dispatcher(vec![delivery("gate01")], Duration::from_secs(10));

        dispatcher.snapshot_pass(Instant::now()).await;
        assert!(dispatcher.last_snapshot.contains_key("gate01"));

        dispatcher
            .handle_message(EffectMessage::DeliveryClosed(delivery("gate01")))
            .await;
        assert!(!dispatcher.last_snapshot.contains_key("gate01"));
    }

    #[tokio::test]
    async fn test_full_channel_drops_without_blocking() {
        let metrics = Arc::new(Metrics::new());
        let (sender, _rx) = create_effect_channel(1, metrics.clone());

        sender.send_opened(delivery("gate01"));
        sender.send_opened(delivery("gate01")); // dropped, not blocked

        assert_eq!(metrics.report().effects_dropped, 1);
    }
}

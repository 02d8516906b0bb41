//! Delivery derivation engine
//!
//! Converts one presence event into at most one ledger mutation, under the
//! gate's lease. The effective machine state is derived from the ledger on
//! every call - there is no persisted automaton - so replaying an event
//! after a crash always reads the true latest state.

use crate::domain::delivery::Delivery;
use crate::domain::event::{PresenceEvent, PresenceStatus};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::services::dispatcher::EffectSender;
use crate::services::gate_lock::GateLocks;
use crate::services::ledger::{DeliveryLedger, LedgerError};
use crate::services::state_machine::{state_from_ledger, transition, PresenceState};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Engine failure taxonomy
///
/// `retryable()` drives the task queue's retry decision: only lock
/// contention is transient; everything else re-fails identically on replay
/// and is surfaced at once.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Status value outside the Truck/NoTruck alphabet
    #[error("invalid presence status {status:?} for event {event_id}")]
    InvalidEvent { event_id: String, status: String },

    /// Event references a gate that is not registered
    #[error("unknown gate {gate_id} for event {event_id}")]
    UnknownGate { event_id: String, gate_id: String },

    /// Another transition is in flight for the gate
    #[error("gate {gate_id} is locked by another in-flight transition")]
    LockContention { gate_id: String },

    /// Ledger invariant violation - a logic or concurrency bug, not retried
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl EngineError {
    /// Whether the task queue's backoff policy should retry this failure
    pub fn retryable(&self) -> bool {
        matches!(self, EngineError::LockContention { .. })
    }
}

/// What the engine did with an event
#[derive(Debug, Clone)]
pub enum EngineAction {
    Opened(Delivery),
    Closed(Delivery),
    NoOp,
}

impl EngineAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineAction::Opened(_) => "opened",
            EngineAction::Closed(_) => "closed",
            EngineAction::NoOp => "no-op",
        }
    }
}

/// Result summary for one processed event
#[derive(Debug, Clone)]
pub struct EngineOutcome {
    pub action: EngineAction,
    pub message: String,
}

/// Per-event orchestrator: lease + state machine + ledger + effect intents
pub struct DerivationEngine {
    config: Config,
    ledger: Arc<DeliveryLedger>,
    locks: GateLocks,
    effects: EffectSender,
    metrics: Arc<Metrics>,
}

impl DerivationEngine {
    pub fn new(
        config: Config,
        ledger: Arc<DeliveryLedger>,
        locks: GateLocks,
        effects: EffectSender,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { config, ledger, locks, effects, metrics }
    }

    pub fn ledger(&self) -> &Arc<DeliveryLedger> {
        &self.ledger
    }

    /// Process one presence event for its gate
    ///
    /// The lease guard is held for the whole read-then-write section and is
    /// released on every exit path, including ledger failures.
    pub fn handle_event(&self, event: &PresenceEvent) -> Result<EngineOutcome, EngineError> {
        let started = Instant::now();
        let result = self.derive(event);
        self.metrics.record_event_processed(started.elapsed().as_micros() as u64);

        match &result {
            Ok(outcome) => {
                debug!(
                    event_id = %event.event_id,
                    gate_id = %event.gate_id,
                    action = %outcome.action.as_str(),
                    "event_processed"
                );
            }
            Err(e) => self.record_failure(event, e),
        }

        result
    }

    fn derive(&self, event: &PresenceEvent) -> Result<EngineOutcome, EngineError> {
        let status: PresenceStatus =
            event.status.parse().map_err(|_| EngineError::InvalidEvent {
                event_id: event.event_id.clone(),
                status: event.status.clone(),
            })?;

        if !self.config.is_known_gate(&event.gate_id) {
            return Err(EngineError::UnknownGate {
                event_id: event.event_id.clone(),
                gate_id: event.gate_id.clone(),
            });
        }

        let _lease = self
            .locks
            .try_acquire(&event.gate_id)
            .ok_or_else(|| EngineError::LockContention { gate_id: event.gate_id.clone() })?;

        let last = self.ledger.last_delivery(&event.gate_id);
        let current = state_from_ledger(last.as_ref());
        let next = transition(current, status);

        match (current, next) {
            (PresenceState::NoTruck, PresenceState::Truck) => {
                if let Some(last) = &last {
                    if self.is_replayed_open(event, last) {
                        info!(
                            event_id = %event.event_id,
                            gate_id = %event.gate_id,
                            delivery_id = %last.id,
                            "open_replay_absorbed"
                        );
                        return Ok(EngineOutcome {
                            action: EngineAction::NoOp,
                            message: format!(
                                "event {} already recorded as delivery {}",
                                event.event_id, last.id
                            ),
                        });
                    }
                }

                let opened = self.ledger.open_delivery(
                    &event.gate_id,
                    &event.event_id,
                    event.timestamp,
                    &event.gate_id,
                    event.attributes.clone(),
                )?;
                self.metrics.record_delivery_opened();
                self.effects.send_opened(opened.clone());

                Ok(EngineOutcome {
                    message: format!("delivery start at {}", opened.start),
                    action: EngineAction::Opened(opened),
                })
            }
            (PresenceState::Truck, PresenceState::NoTruck) => {
                // current == Truck implies an open last delivery
                let open = last.expect("truck state requires a last delivery");
                let closed = self.ledger.close_delivery(open.id, event.timestamp)?;
                self.metrics.record_delivery_closed();
                self.effects.send_closed(closed.clone());

                Ok(EngineOutcome {
                    message: format!("delivery end at {}", closed.end.unwrap_or(closed.start)),
                    action: EngineAction::Closed(closed),
                })
            }
            _ => {
                self.metrics.record_noop_transition();
                let message = match current {
                    PresenceState::Truck => "delivery on going".to_string(),
                    PresenceState::NoTruck => "no delivery at the moment".to_string(),
                };
                Ok(EngineOutcome { action: EngineAction::NoOp, message })
            }
        }
    }

    /// Redelivery guard: the opening event of an already-closed delivery is
    /// absorbed rather than reopening the gate, as long as its timestamp does
    /// not postdate the close.
    fn is_replayed_open(&self, event: &PresenceEvent, last: &Delivery) -> bool {
        !last.is_open()
            && last.delivery_uid == event.event_id
            && last.end.is_some_and(|end| event.timestamp <= end)
    }

    fn record_failure(&self, event: &PresenceEvent, error: &EngineError) {
        match error {
            EngineError::InvalidEvent { .. } => {
                self.metrics.record_invalid_event();
                warn!(
                    event_id = %event.event_id,
                    gate_id = %event.gate_id,
                    status = %event.status,
                    "invalid_event_rejected"
                );
            }
            EngineError::UnknownGate { .. } => {
                self.metrics.record_unknown_gate();
                warn!(
                    event_id = %event.event_id,
                    gate_id = %event.gate_id,
                    "unknown_gate_rejected"
                );
            }
            EngineError::LockContention { .. } => {
                self.metrics.record_lock_contention();
                debug!(
                    event_id = %event.event_id,
                    gate_id = %event.gate_id,
                    "transition_skipped_lock_held"
                );
            }
            EngineError::Ledger(e) => {
                self.metrics.record_ledger_conflict();
                error!(
                    event_id = %event.event_id,
                    gate_id = %event.gate_id,
                    status = %event.status,
                    timestamp = %event.timestamp,
                    error = %e,
                    "ledger_invariant_violation"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::delivery::DeliveryStatus;
    use crate::services::dispatcher::{create_effect_channel, EffectMessage};
    use chrono::{DateTime, TimeZone, Utc};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn engine() -> (DerivationEngine, mpsc::Receiver<EffectMessage>) {
        let config = Config::default().with_gates(&["gate01", "gate02", "gate03"]);
        let ledger = Arc::new(DeliveryLedger::new());
        let locks = GateLocks::new(Duration::from_secs(30));
        let metrics = Arc::new(Metrics::new());
        let (effects, rx) = create_effect_channel(64, metrics.clone());
        (DerivationEngine::new(config, ledger, locks, effects, metrics), rx)
    }

    fn event(uid: &str, gate: &str, status: &str, at: i64) -> PresenceEvent {
        PresenceEvent::new(uid, gate, status, ts(at))
    }

    #[test]
    fn test_truck_event_opens_delivery() {
        let (engine, mut rx) = engine();

        let outcome = engine.handle_event(&event("E1", "gate03", "Truck", 100)).unwrap();

        let EngineAction::Opened(d) = &outcome.action else {
            panic!("expected Opened, got {:?}", outcome.action);
        };
        assert_eq!(d.delivery_uid, "E1");
        assert_eq!(d.start, ts(100));
        assert_eq!(d.status, DeliveryStatus::Open);

        assert!(matches!(rx.try_recv().unwrap(), EffectMessage::DeliveryOpened(_)));
    }

    #[test]
    fn test_no_truck_event_closes_delivery() {
        let (engine, mut rx) = engine();
        engine.handle_event(&event("E1", "gate03", "Truck", 100)).unwrap();
        let _ = rx.try_recv();

        let outcome = engine.handle_event(&event("E2", "gate03", "NoTruck", 160)).unwrap();

        let EngineAction::Closed(d) = &outcome.action else {
            panic!("expected Closed, got {:?}", outcome.action);
        };
        assert_eq!(d.delivery_uid, "E1");
        assert_eq!(d.end, Some(ts(160)));
        assert_eq!(d.status, DeliveryStatus::Closed);
        assert!(d.start <= d.end.unwrap());

        assert!(matches!(rx.try_recv().unwrap(), EffectMessage::DeliveryClosed(_)));
    }

    #[test]
    fn test_duplicate_truck_is_noop() {
        let (engine, mut rx) = engine();
        engine.handle_event(&event("E1", "gate03", "Truck", 100)).unwrap();
        let _ = rx.try_recv();

        let outcome = engine.handle_event(&event("E2", "gate03", "Truck", 110)).unwrap();

        assert!(matches!(outcome.action, EngineAction::NoOp));
        assert_eq!(engine.ledger().delivery_count(), 1);
        // no side effect for a no-op
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_no_truck_on_idle_gate_is_noop() {
        let (engine, mut rx) = engine();

        let outcome = engine.handle_event(&event("E1", "gate03", "NoTruck", 100)).unwrap();

        assert!(matches!(outcome.action, EngineAction::NoOp));
        assert_eq!(engine.ledger().delivery_count(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_invalid_status_rejected() {
        let (engine, _rx) = engine();

        let err = engine.handle_event(&event("E1", "gate03", "truck", 100)).unwrap_err();

        assert!(matches!(err, EngineError::InvalidEvent { .. }));
        assert!(!err.retryable());
        assert_eq!(engine.ledger().delivery_count(), 0);
    }

    #[test]
    fn test_unknown_gate_rejected() {
        let (engine, _rx) = engine();

        let err = engine.handle_event(&event("E1", "gate99", "Truck", 100)).unwrap_err();

        assert!(matches!(err, EngineError::UnknownGate { .. }));
        assert!(!err.retryable());
        assert_eq!(engine.ledger().delivery_count(), 0);
    }

    #[test]
    fn test_lock_contention_is_retryable() {
        let (engine, _rx) = engine();

        // Hold the gate's lease so the engine loses the race
        let _held = engine.locks.try_acquire("gate03").unwrap();

        let err = engine.handle_event(&event("E1", "gate03", "Truck", 100)).unwrap_err();

        assert!(matches!(err, EngineError::LockContention { .. }));
        assert!(err.retryable());
        assert_eq!(engine.ledger().delivery_count(), 0);
    }

    #[test]
    fn test_lock_released_after_failure() {
        let (engine, _rx) = engine();
        engine.handle_event(&event("E1", "gate03", "Truck", 100)).unwrap();

        // A second Truck is a no-op, but must still release the lease
        engine.handle_event(&event("E2", "gate03", "Truck", 110)).unwrap();
        assert!(engine.locks.try_acquire("gate03").is_some());
    }

    #[test]
    fn test_replayed_open_absorbed() {
        let (engine, _rx) = engine();
        engine.handle_event(&event("E1", "gate03", "Truck", 100)).unwrap();
        engine.handle_event(&event("E2", "gate03", "NoTruck", 160)).unwrap();

        // Redelivery of the opening event with its original timestamp
        let outcome = engine.handle_event(&event("E1", "gate03", "Truck", 100)).unwrap();

        assert!(matches!(outcome.action, EngineAction::NoOp));
        assert_eq!(engine.ledger().delivery_count(), 1);
    }

    #[test]
    fn test_same_uid_later_timestamp_opens_new_delivery() {
        let (engine, _rx) = engine();
        engine.handle_event(&event("E1", "gate03", "Truck", 100)).unwrap();
        engine.handle_event(&event("E2", "gate03", "NoTruck", 160)).unwrap();

        // Same uid but after the close: a genuinely new occupancy
        let outcome = engine.handle_event(&event("E1", "gate03", "Truck", 200)).unwrap();

        assert!(matches!(outcome.action, EngineAction::Opened(_)));
        assert_eq!(engine.ledger().delivery_count(), 2);
    }

    #[test]
    fn test_intervals_never_overlap() {
        let (engine, _rx) = engine();

        // Noisy sequence with duplicates and idle no-ops
        let sequence = [
            ("E1", "Truck", 100),
            ("E2", "Truck", 110),
            ("E3", "NoTruck", 160),
            ("E4", "NoTruck", 170),
            ("E5", "Truck", 200),
            ("E6", "NoTruck", 260),
            ("E7", "Truck", 300),
            ("E8", "Truck", 310),
            ("E9", "NoTruck", 360),
        ];
        for (uid, status, at) in sequence {
            engine.handle_event(&event(uid, "gate03", status, at)).unwrap();
        }

        let upper = Utc::now() + chrono::Duration::days(1);
        let (mut all, total) = engine.ledger().list_range(Some("gate03"), ts(0), upper, 1, 100);
        assert_eq!(total, 3);

        all.sort_by_key(|d| d.start);
        for pair in all.windows(2) {
            let prev_end = pair[0].end.expect("all closed");
            assert!(prev_end <= pair[1].start, "intervals overlap");
        }
    }

    #[test]
    fn test_gates_do_not_interfere() {
        let (engine, _rx) = engine();

        engine.handle_event(&event("A1", "gate01", "Truck", 100)).unwrap();
        engine.handle_event(&event("B1", "gate02", "Truck", 105)).unwrap();
        engine.handle_event(&event("A2", "gate01", "NoTruck", 150)).unwrap();

        assert_eq!(engine.ledger().open_count(), 1);
        assert_eq!(engine.ledger().last_delivery("gate02").unwrap().status, DeliveryStatus::Open);
        assert_eq!(engine.ledger().last_delivery("gate01").unwrap().status, DeliveryStatus::Closed);
    }
}

//! Services - business logic and state management
//!
//! This module contains the core delivery-derivation services:
//! - `engine` - per-event orchestrator (lease + state machine + ledger)
//! - `state_machine` - pure Truck/NoTruck transition function
//! - `ledger` - authoritative append-only delivery store
//! - `gate_lock` - per-gate TTL lease registry
//! - `task_queue` - gate-sharded ingest workers with retry
//! - `dispatcher` - decoupled side-effect notification

pub mod dispatcher;
pub mod engine;
pub mod gate_lock;
pub mod ledger;
pub mod state_machine;
pub mod task_queue;

// Re-export commonly used types
pub use dispatcher::{create_effect_channel, DeliveryNotifier, EffectDispatcher, EffectSender};
pub use engine::{DerivationEngine, EngineAction, EngineError, EngineOutcome};
pub use gate_lock::{GateLockGuard, GateLocks};
pub use ledger::{DeliveryLedger, LedgerError};
pub use state_machine::{state_from_ledger, transition, PresenceState};
pub use task_queue::{create_ingest_workers, IngestSender, IngestTask, RetryPolicy, TaskStatusStore};

//! Delivery ledger - authoritative append-only store of delivery intervals
//!
//! The ledger is the single source of truth: the derivation engine reads the
//! last delivery per gate to reconstruct machine state, and the query API
//! reads ranges for dashboards. Records are never deleted here; archival is
//! an external concern.
//!
//! The interior RwLock guards structure integrity only. The read-then-write
//! race across one gate is serialized by the per-gate lease in the engine,
//! not by this lock.

use crate::domain::delivery::{AttributeMap, Delivery, DeliveryId, DeliveryStatus};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::info;

/// Ledger mutation failures
///
/// Both variants indicate a logic or concurrency bug when reached through the
/// engine (the lease discipline should make them unreachable), so neither is
/// retryable.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// An open delivery already exists for the gate
    #[error("gate {gate_id} already has open delivery {delivery_id}")]
    Conflict { gate_id: String, delivery_id: DeliveryId },

    /// The delivery is not in a state that permits the mutation
    #[error("delivery {delivery_id} is {status}, expected on-going")]
    InvalidState { delivery_id: DeliveryId, status: DeliveryStatus },

    /// Close time earlier than the recorded start
    #[error("delivery {delivery_id} close time precedes start")]
    EndBeforeStart { delivery_id: DeliveryId },

    /// Unknown delivery id
    #[error("delivery {delivery_id} not found")]
    NotFound { delivery_id: DeliveryId },
}

struct LedgerInner {
    deliveries: Vec<Delivery>,
    /// gate_id -> indices into `deliveries`, in creation order
    by_gate: FxHashMap<String, Vec<usize>>,
}

/// Append-only delivery store with per-gate lookup
pub struct DeliveryLedger {
    inner: RwLock<LedgerInner>,
}

impl DeliveryLedger {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(LedgerInner {
                deliveries: Vec::new(),
                by_gate: FxHashMap::default(),
            }),
        }
    }

    /// Most recently created delivery for a gate
    pub fn last_delivery(&self, gate_id: &str) -> Option<Delivery> {
        let inner = self.inner.read();
        let idx = *inner.by_gate.get(gate_id)?.last()?;
        Some(inner.deliveries[idx].clone())
    }

    /// Open a new delivery for a gate
    ///
    /// Fails with `Conflict` if the gate already has an open delivery. The
    /// lease discipline makes that unreachable, but the invariant is checked
    /// here regardless.
    pub fn open_delivery(
        &self,
        gate_id: &str,
        delivery_uid: &str,
        start: DateTime<Utc>,
        location: &str,
        attributes: Option<AttributeMap>,
    ) -> Result<Delivery, LedgerError> {
        let mut inner = self.inner.write();

        if let Some(indices) = inner.by_gate.get(gate_id) {
            if let Some(open) = indices
                .iter()
                .map(|&i| &inner.deliveries[i])
                .find(|d| d.status == DeliveryStatus::Open)
            {
                return Err(LedgerError::Conflict {
                    gate_id: gate_id.to_string(),
                    delivery_id: open.id,
                });
            }
        }

        let id = DeliveryId(inner.deliveries.len() as u64 + 1);
        let delivery = Delivery {
            id,
            gate_id: gate_id.to_string(),
            delivery_uid: delivery_uid.to_string(),
            start,
            end: None,
            status: DeliveryStatus::Open,
            location: location.to_string(),
            attributes,
            created_at: Utc::now(),
        };

        let idx = inner.deliveries.len();
        inner.deliveries.push(delivery.clone());
        inner.by_gate.entry(gate_id.to_string()).or_default().push(idx);

        info!(
            gate_id = %gate_id,
            delivery_id = %id,
            delivery_uid = %delivery_uid,
            start = %start,
            "delivery_opened"
        );

        Ok(delivery)
    }

    /// Close an open delivery, setting its end time
    pub fn close_delivery(
        &self,
        delivery_id: DeliveryId,
        end: DateTime<Utc>,
    ) -> Result<Delivery, LedgerError> {
        let mut inner = self.inner.write();

        let delivery = inner
            .deliveries
            .iter_mut()
            .find(|d| d.id == delivery_id)
            .ok_or(LedgerError::NotFound { delivery_id })?;

        if delivery.status != DeliveryStatus::Open {
            return Err(LedgerError::InvalidState { delivery_id, status: delivery.status });
        }
        if end < delivery.start {
            return Err(LedgerError::EndBeforeStart { delivery_id });
        }

        delivery.end = Some(end);
        delivery.status = DeliveryStatus::Closed;
        let closed = delivery.clone();

        info!(
            gate_id = %closed.gate_id,
            delivery_id = %delivery_id,
            delivery_uid = %closed.delivery_uid,
            end = %end,
            "delivery_closed"
        );

        Ok(closed)
    }

    /// Fetch a delivery by id
    pub fn get(&self, delivery_id: DeliveryId) -> Option<Delivery> {
        let inner = self.inner.read();
        inner.deliveries.iter().find(|d| d.id == delivery_id).cloned()
    }

    /// List deliveries for the query API
    ///
    /// Filters on `created_at` in `[from, to)` (the caller applies the API's
    /// one-day padding before calling), optionally restricted to one gate.
    /// Results are newest first by `start`. Returns the requested page and
    /// the total match count; `page` is 1-based and `page_size` must be > 0.
    pub fn list_range(
        &self,
        gate_id: Option<&str>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        page: usize,
        page_size: usize,
    ) -> (Vec<Delivery>, usize) {
        let inner = self.inner.read();

        let mut matches: Vec<Delivery> = inner
            .deliveries
            .iter()
            .filter(|d| d.created_at >= from && d.created_at < to)
            .filter(|d| gate_id.is_none_or(|g| d.gate_id == g))
            .cloned()
            .collect();

        matches.sort_by(|a, b| b.start.cmp(&a.start));

        let total = matches.len();
        let page = page.max(1);
        let start = (page - 1).saturating_mul(page_size);
        let items = if start >= total {
            Vec::new()
        } else {
            matches[start..(start + page_size).min(total)].to_vec()
        };

        (items, total)
    }

    /// All currently open deliveries (snapshot-scheduler input)
    pub fn open_deliveries(&self) -> Vec<Delivery> {
        let inner = self.inner.read();
        inner.deliveries.iter().filter(|d| d.is_open()).cloned().collect()
    }

    /// Whether any delivery has been recorded for a gate
    pub fn has_deliveries(&self, gate_id: &str) -> bool {
        let inner = self.inner.read();
        inner.by_gate.get(gate_id).is_some_and(|v| !v.is_empty())
    }

    /// Total number of recorded deliveries
    pub fn delivery_count(&self) -> usize {
        self.inner.read().deliveries.len()
    }

    /// Number of currently open deliveries
    pub fn open_count(&self) -> usize {
        let inner = self.inner.read();
        inner.deliveries.iter().filter(|d| d.is_open()).count()
    }
}

impl Default for DeliveryLedger {
    fn default() -> Self {
        Self::new()
    }
}

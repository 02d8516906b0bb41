//! Presence events from the detection pipeline

use crate::domain::delivery::AttributeMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Validated presence signal value
///
/// Anything outside `Truck`/`NoTruck` is invalid input and must be rejected,
/// never coerced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PresenceStatus {
    Truck,
    NoTruck,
}

impl PresenceStatus {
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceStatus::Truck => "Truck",
            PresenceStatus::NoTruck => "NoTruck",
        }
    }
}

impl std::fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error for status values outside the transition alphabet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidStatus(pub String);

impl std::fmt::Display for InvalidStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid presence status {:?}", self.0)
    }
}

impl std::error::Error for InvalidStatus {}

impl std::str::FromStr for PresenceStatus {
    type Err = InvalidStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Truck" => Ok(PresenceStatus::Truck),
            "NoTruck" => Ok(PresenceStatus::NoTruck),
            other => Err(InvalidStatus(other.to_string())),
        }
    }
}

/// A timestamped detection signal for one gate
///
/// `event_id` doubles as the idempotency key: the event that opens a delivery
/// becomes that delivery's `delivery_uid`. The status is kept as the raw wire
/// string; the derivation engine validates it (and nothing downstream of the
/// engine ever sees an unvalidated value).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceEvent {
    pub event_id: String,
    pub gate_id: String,
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub description: Option<String>,
    pub attributes: Option<AttributeMap>,
}

impl PresenceEvent {
    pub fn new(event_id: &str, gate_id: &str, status: &str, timestamp: DateTime<Utc>) -> Self {
        Self {
            event_id: event_id.to_string(),
            gate_id: gate_id.to_string(),
            status: status.to_string(),
            timestamp,
            description: None,
            attributes: None,
        }
    }

    pub fn with_attributes(mut self, attributes: AttributeMap) -> Self {
        self.attributes = Some(attributes);
        self
    }
}

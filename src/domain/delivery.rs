//! Delivery data model - derived truck-occupancy intervals per gate

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// JSON object map carried through from event `meta_info`
pub type AttributeMap = serde_json::Map<String, serde_json::Value>;

/// Generate a new UUIDv7 (time-sortable)
pub fn new_uuid_v7() -> String {
    Uuid::now_v7().to_string()
}

/// Current UTC time
#[inline]
pub fn now_utc() -> DateTime<Utc> {
    Utc::now()
}

/// Newtype wrapper for delivery ordinals to provide type safety
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct DeliveryId(pub u64);

impl std::fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl DeliveryId {
    /// Zero-padded 6-digit form used by the query API
    pub fn padded(&self) -> String {
        format!("{:06}", self.0)
    }
}

/// Delivery lifecycle status
///
/// Wire strings match the upstream consumers: `pending`, `on-going`, `done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryStatus {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "on-going")]
    Open,
    #[serde(rename = "done")]
    Closed,
}

impl DeliveryStatus {
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Open => "on-going",
            DeliveryStatus::Closed => "done",
        }
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One truck-occupancy interval at a gate
///
/// Created `Open` when a truck is first detected at an idle gate, mutated to
/// `Closed` when the truck leaves. Never deleted by this service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delivery {
    /// Ledger-assigned ordinal (1-based)
    pub id: DeliveryId,
    /// Gate this delivery occupies
    pub gate_id: String,
    /// Event id of the presence event that opened the delivery (immutable)
    pub delivery_uid: String,
    /// Occupancy start (UTC, from the opening event's timestamp)
    pub start: DateTime<Utc>,
    /// Occupancy end (UTC); None while the delivery is open
    pub end: Option<DateTime<Utc>>,
    pub status: DeliveryStatus,
    /// Human-readable location label (the gate uid in the current deployments)
    pub location: String,
    /// Opaque attributes from the opening event (snapshot/video dirs etc.)
    pub attributes: Option<AttributeMap>,
    /// When the ledger recorded the delivery
    pub created_at: DateTime<Utc>,
}

impl Delivery {
    #[inline]
    pub fn is_open(&self) -> bool {
        self.status == DeliveryStatus::Open
    }

    /// Occupancy duration; open deliveries are measured against `now`
    pub fn duration_secs(&self, now: DateTime<Utc>) -> i64 {
        let end = self.end.unwrap_or(now);
        (end - self.start).num_seconds()
    }

    /// String attribute lookup (e.g. the `snapshots`/`videos` directories)
    pub fn attribute_str(&self, key: &str) -> Option<&str> {
        self.attributes.as_ref()?.get(key)?.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn delivery(status: DeliveryStatus, end: Option<DateTime<Utc>>) -> Delivery {
        Delivery {
            id: DeliveryId(7),
            gate_id: "gate03".to_string(),
            delivery_uid: "E1".to_string(),
            start: ts(1_000),
            end,
            status,
            location: "gate03".to_string(),
            attributes: None,
            created_at: ts(1_000),
        }
    }

    #[test]
    fn test_status_as_str() {
        assert_eq!(DeliveryStatus::Pending.as_str(), "pending");
        assert_eq!(DeliveryStatus::Open.as_str(), "on-going");
        assert_eq!(DeliveryStatus::Closed.as_str(), "done");
    }

    #[test]
    fn test_padded_id() {
        assert_eq!(DeliveryId(7).padded(), "000007");
        assert_eq!(DeliveryId(123456).padded(), "123456");
    }

    #[test]
    fn test_duration_open_uses_now() {
        let d = delivery(DeliveryStatus::Open, None);
        assert_eq!(d.duration_secs(ts(1_060)), 60);
    }

    #[test]
    fn test_duration_closed_uses_end() {
        let d = delivery(DeliveryStatus::Closed, Some(ts(1_030)));
        assert_eq!(d.duration_secs(ts(9_999)), 30);
    }

    #[test]
    fn test_attribute_str() {
        let mut attrs = AttributeMap::new();
        attrs.insert("snapshots".to_string(), serde_json::json!("/delivery/000007/snaps"));
        attrs.insert("count".to_string(), serde_json::json!(3));

        let mut d = delivery(DeliveryStatus::Open, None);
        d.attributes = Some(attrs);

        assert_eq!(d.attribute_str("snapshots"), Some("/delivery/000007/snaps"));
        assert_eq!(d.attribute_str("count"), None); // not a string
        assert_eq!(d.attribute_str("missing"), None);
    }

    #[test]
    fn test_status_serde_wire_strings() {
        let json = serde_json::to_string(&DeliveryStatus::Open).unwrap();
        assert_eq!(json, "\"on-going\"");
        let back: DeliveryStatus = serde_json::from_str("\"done\"").unwrap();
        assert_eq!(back, DeliveryStatus::Closed);
    }

    #[test]
    fn test_uuid_v7_generation() {
        let a = new_uuid_v7();
        let b = new_uuid_v7();
        assert_eq!(a.len(), 36);
        assert_ne!(a, b);
    }
}

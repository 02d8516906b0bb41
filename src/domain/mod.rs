//! Domain models - core business types for delivery derivation
//!
//! This module contains the canonical data types used throughout the system:
//! - `Delivery` - the primary business entity, one truck-occupancy interval
//! - `DeliveryStatus` - lifecycle of a delivery (pending/on-going/done)
//! - `PresenceEvent` - detection signal from the edge pipeline
//! - `PresenceStatus` - validated Truck/NoTruck signal value

pub mod delivery;
pub mod event;

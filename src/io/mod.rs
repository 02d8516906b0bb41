//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `http_api` - HTTP server for ingestion, queries, and metrics
//! - `recording` - recording service client (rt_video start/stop, images)
//! - `sync` - sync service client for closed-delivery replication
//! - `notifier` - production notifier combining recording + sync
//! - `assets` - media file discovery for the assets endpoint

pub mod assets;
pub mod http_api;
pub mod notifier;
pub mod recording;
pub mod sync;

// Re-export commonly used types
pub use http_api::{start_api_server, ApiContext};
pub use notifier::HttpNotifier;
pub use recording::RecordingClient;
pub use sync::SyncClient;

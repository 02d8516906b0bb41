//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml

use anyhow::Context;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SiteConfig {
    /// Unique site identifier (e.g. the plant name)
    #[serde(default = "default_site_id")]
    pub id: String,
}

fn default_site_id() -> String {
    "plant".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_http_port")]
    pub port: u16,
}

fn default_http_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    8080
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { bind_address: default_http_bind_address(), port: default_http_port() }
    }
}

/// One registered gate
#[derive(Debug, Clone, Deserialize)]
pub struct GateEntry {
    pub uid: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Gate lease TTL in milliseconds
    #[serde(default = "default_lock_ttl_ms")]
    pub lock_ttl_ms: u64,
    /// Max retry attempts for retryable task failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base retry backoff in milliseconds (doubles per attempt)
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Backoff ceiling in milliseconds
    #[serde(default = "default_retry_backoff_cap_ms")]
    pub retry_backoff_cap_ms: u64,
    /// Ingest worker shard count
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Per-shard queue capacity
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_lock_ttl_ms() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_backoff_ms() -> u64 {
    1_000
}

fn default_retry_backoff_cap_ms() -> u64 {
    60_000
}

fn default_workers() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    1_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_ttl_ms: default_lock_ttl_ms(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            retry_backoff_cap_ms: default_retry_backoff_cap_ms(),
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatcherConfig {
    /// Minimum seconds between progress snapshots per gate
    #[serde(default = "default_image_rate_secs")]
    pub image_rate_secs: u64,
    #[serde(default = "default_effect_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_image_rate_secs() -> u64 {
    10
}

fn default_effect_queue_capacity() -> usize {
    256
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            image_rate_secs: default_image_rate_secs(),
            queue_capacity: default_effect_queue_capacity(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecordingConfig {
    #[serde(default = "default_recording_base_url")]
    pub base_url: String,
    /// Topic tag passed to the recording service
    #[serde(default = "default_recording_topic")]
    pub topic: String,
    #[serde(default = "default_outbound_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_recording_base_url() -> String {
    "http://localhost:8020/api/v1".to_string()
}

fn default_recording_topic() -> String {
    "delivery".to_string()
}

fn default_outbound_timeout_ms() -> u64 {
    2_000
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            base_url: default_recording_base_url(),
            topic: default_recording_topic(),
            timeout_ms: default_outbound_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_sync_base_url")]
    pub base_url: String,
    #[serde(default = "default_outbound_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_sync_enabled")]
    pub enabled: bool,
}

fn default_sync_base_url() -> String {
    "http://localhost:8030/api/v1".to_string()
}

fn default_sync_enabled() -> bool {
    true
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_url: default_sync_base_url(),
            timeout_ms: default_outbound_timeout_ms(),
            enabled: default_sync_enabled(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryConfig {
    /// Default page size for the delivery listing
    #[serde(default = "default_items_per_page")]
    pub items_per_page: usize,
    /// Hours added to UTC for display date/time strings
    #[serde(default = "default_display_offset_hours")]
    pub display_offset_hours: i64,
    /// Root directory for per-delivery media assets
    #[serde(default = "default_media_root")]
    pub media_root: String,
}

fn default_items_per_page() -> usize {
    15
}

fn default_display_offset_hours() -> i64 {
    2
}

fn default_media_root() -> String {
    "/media/alarms/delivery".to_string()
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            items_per_page: default_items_per_page(),
            display_offset_hours: default_display_offset_hours(),
            media_root: default_media_root(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval_secs")]
    pub interval_secs: u64,
}

fn default_metrics_interval_secs() -> u64 {
    10
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval_secs() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub gates: Vec<GateEntry>,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub recording: RecordingConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    http_bind_address: String,
    http_port: u16,
    gates: Vec<GateEntry>,
    lock_ttl_ms: u64,
    max_retries: u32,
    retry_backoff_ms: u64,
    retry_backoff_cap_ms: u64,
    workers: usize,
    queue_capacity: usize,
    image_rate_secs: u64,
    effect_queue_capacity: usize,
    recording_base_url: String,
    recording_topic: String,
    recording_timeout_ms: u64,
    sync_base_url: String,
    sync_timeout_ms: u64,
    sync_enabled: bool,
    items_per_page: usize,
    display_offset_hours: i64,
    media_root: String,
    metrics_interval_secs: u64,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            site_id: default_site_id(),
            http_bind_address: default_http_bind_address(),
            http_port: default_http_port(),
            gates: Self::default_gates(),
            lock_ttl_ms: default_lock_ttl_ms(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            retry_backoff_cap_ms: default_retry_backoff_cap_ms(),
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            image_rate_secs: default_image_rate_secs(),
            effect_queue_capacity: default_effect_queue_capacity(),
            recording_base_url: default_recording_base_url(),
            recording_topic: default_recording_topic(),
            recording_timeout_ms: default_outbound_timeout_ms(),
            sync_base_url: default_sync_base_url(),
            sync_timeout_ms: default_outbound_timeout_ms(),
            sync_enabled: default_sync_enabled(),
            items_per_page: default_items_per_page(),
            display_offset_hours: default_display_offset_hours(),
            media_root: default_media_root(),
            metrics_interval_secs: default_metrics_interval_secs(),
            config_file: "default".to_string(),
        }
    }
}

impl Config {
    fn default_gates() -> Vec<GateEntry> {
        ["gate01", "gate02", "gate03", "gate04"]
            .iter()
            .map(|uid| GateEntry { uid: uid.to_string(), description: format!("Gate {uid}") })
            .collect()
    }

    /// Determine config file path from args or environment
    pub fn resolve_config_path(args: &[String]) -> String {
        for (i, arg) in args.iter().enumerate() {
            if arg == "--config" {
                if let Some(path) = args.get(i + 1) {
                    return path.clone();
                }
            }
            if let Some(path) = arg.strip_prefix("--config=") {
                return path.to_string();
            }
        }

        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        "config/dev.toml".to_string()
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Ok(Self {
            site_id: toml_config.site.id,
            http_bind_address: toml_config.http.bind_address,
            http_port: toml_config.http.port,
            gates: toml_config.gates,
            lock_ttl_ms: toml_config.engine.lock_ttl_ms,
            max_retries: toml_config.engine.max_retries,
            retry_backoff_ms: toml_config.engine.retry_backoff_ms,
            retry_backoff_cap_ms: toml_config.engine.retry_backoff_cap_ms,
            workers: toml_config.engine.workers,
            queue_capacity: toml_config.engine.queue_capacity,
            image_rate_secs: toml_config.dispatcher.image_rate_secs,
            effect_queue_capacity: toml_config.dispatcher.queue_capacity,
            recording_base_url: toml_config.recording.base_url,
            recording_topic: toml_config.recording.topic,
            recording_timeout_ms: toml_config.recording.timeout_ms,
            sync_base_url: toml_config.sync.base_url,
            sync_timeout_ms: toml_config.sync.timeout_ms,
            sync_enabled: toml_config.sync.enabled,
            items_per_page: toml_config.query.items_per_page,
            display_offset_hours: toml_config.query.display_offset_hours,
            media_root: toml_config.query.media_root,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            config_file: path.display().to_string(),
        })
    }

    /// Load configuration - tries the TOML file first, falls back to defaults
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Warning: {}. Using defaults.", e);
                Self::default()
            }
        }
    }

    /// Whether a gate uid is registered
    pub fn is_known_gate(&self, gate_id: &str) -> bool {
        self.gates.iter().any(|g| g.uid == gate_id)
    }

    /// Description for a registered gate
    pub fn gate_description(&self, gate_id: &str) -> Option<&str> {
        self.gates.iter().find(|g| g.uid == gate_id).map(|g| g.description.as_str())
    }

    // Getters for all config fields
    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn http_bind_address(&self) -> &str {
        &self.http_bind_address
    }

    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    pub fn gates(&self) -> &[GateEntry] {
        &self.gates
    }

    pub fn lock_ttl_ms(&self) -> u64 {
        self.lock_ttl_ms
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn retry_backoff_ms(&self) -> u64 {
        self.retry_backoff_ms
    }

    pub fn retry_backoff_cap_ms(&self) -> u64 {
        self.retry_backoff_cap_ms
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    pub fn image_rate_secs(&self) -> u64 {
        self.image_rate_secs
    }

    pub fn effect_queue_capacity(&self) -> usize {
        self.effect_queue_capacity
    }

    pub fn recording_base_url(&self) -> &str {
        &self.recording_base_url
    }

    pub fn recording_topic(&self) -> &str {
        &self.recording_topic
    }

    pub fn recording_timeout_ms(&self) -> u64 {
        self.recording_timeout_ms
    }

    pub fn sync_base_url(&self) -> &str {
        &self.sync_base_url
    }

    pub fn sync_timeout_ms(&self) -> u64 {
        self.sync_timeout_ms
    }

    pub fn sync_enabled(&self) -> bool {
        self.sync_enabled
    }

    pub fn items_per_page(&self) -> usize {
        self.items_per_page
    }

    pub fn display_offset_hours(&self) -> i64 {
        self.display_offset_hours
    }

    pub fn media_root(&self) -> &str {
        &self.media_root
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Builder method for tests to set the registered gates
    #[cfg(test)]
    pub fn with_gates(mut self, uids: &[&str]) -> Self {
        self.gates = uids
            .iter()
            .map(|uid| GateEntry { uid: uid.to_string(), description: String::new() })
            .collect();
        self
    }

    /// Builder method for tests to set the display offset
    #[cfg(test)]
    pub fn with_display_offset_hours(mut self, hours: i64) -> Self {
        self.display_offset_hours = hours;
        self
    }

    /// Builder method for tests to set the media root
    #[cfg(test)]
    pub fn with_media_root(mut self, root: &str) -> Self {
        self.media_root = root.to_string();
        self
    }
}

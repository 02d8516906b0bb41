//! HTTP API - ingestion and query endpoints plus metrics
//!
//! Uses hyper for the HTTP/1 server. Routing is a hand-rolled match on
//! (method, path); handlers are plain functions over parsed inputs that
//! return (status, JSON) so they can be unit tested without a socket.
//!
//! Endpoints (all under /api/v1 unless noted):
//! - `POST /delivery/event` - async ingest boundary, returns a task id
//! - `GET /delivery/task/status/{task_id}` - task state and result
//! - `GET /delivery` - paginated delivery listing for dashboards
//! - `GET /delivery/assets/{delivery_id}` - snapshot/video listings
//! - `GET /gate/{gate_id}` - point-in-time gate occupancy
//! - `GET /metrics` (root) - Prometheus text exposition
//! - `GET /health` (root)

use crate::domain::delivery::{new_uuid_v7, now_utc, Delivery};
use crate::domain::event::PresenceEvent;
use crate::infra::config::Config;
use crate::infra::metrics::{Metrics, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS};
use crate::io::assets;
use crate::services::ledger::DeliveryLedger;
use crate::services::task_queue::{IngestSender, IngestTask};
use bytes::Bytes;
use chrono::{DateTime, Datelike, Duration as ChronoDuration, TimeZone, Utc};
use http_body_util::{BodyExt, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

const GREEN_SQUARE: &str = "\u{1F7E9}";
const YELLOW_SQUARE: &str = "\u{1F7E8}";
const ORANGE_SQUARE: &str = "\u{1F7E7}";
const RED_SQUARE: &str = "\u{1F7E5}";

/// Severity level to flag glyph
fn severity_flag(level: u8) -> &'static str {
    match level {
        0 => GREEN_SQUARE,
        1 => YELLOW_SQUARE,
        2 => ORANGE_SQUARE,
        _ => RED_SQUARE,
    }
}

/// Shared state for the request handlers
pub struct ApiContext {
    pub config: Config,
    pub ledger: Arc<DeliveryLedger>,
    pub ingest: IngestSender,
    pub metrics: Arc<Metrics>,
}

/// Ingest request body, validated at the boundary
#[derive(Debug, Deserialize)]
pub struct DeliveryEventRequest {
    pub event_uid: String,
    #[serde(default)]
    pub event_name: String,
    pub location: String,
    pub timestamp: String,
    pub status: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub meta_info: Option<crate::domain::delivery::AttributeMap>,
}

fn error_body(code: &str, description: String, detail: String) -> Value {
    json!({
        "error": {
            "status_code": code,
            "status_description": description,
            "detail": detail,
        }
    })
}

/// Minimal percent-decoding for query values (%XX and '+')
fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
                match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    Some(v) => {
                        out.push(v);
                        i += 3;
                    }
                    None => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).to_string()
}

/// Parse a query string into a key/value map
fn parse_query(query: Option<&str>) -> FxHashMap<String, String> {
    let mut map = FxHashMap::default();
    let Some(query) = query else {
        return map;
    };
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        map.insert(percent_decode(key), percent_decode(value));
    }
    map
}

/// Parse datetime parameters in the accepted wire formats
pub fn parse_datetime_param(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(s, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    if let Ok(date) = chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|naive| Utc.from_utc_datetime(&naive));
    }
    None
}

/// Start of the current UTC day
fn start_of_today() -> DateTime<Utc> {
    let now = now_utc();
    Utc.with_ymd_and_hms(now.year(), now.month(), now.day(), 0, 0, 0)
        .single()
        .unwrap_or(now)
}

/// POST /api/v1/delivery/event
pub fn ingest_event(
    ctx: &ApiContext,
    body: &[u8],
    request_id: Option<String>,
) -> (StatusCode, Value) {
    let request: DeliveryEventRequest = match serde_json::from_slice(body) {
        Ok(r) => r,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                error_body("bad-request", "Malformed delivery event".to_string(), e.to_string()),
            );
        }
    };

    let Some(timestamp) = parse_datetime_param(&request.timestamp) else {
        return (
            StatusCode::BAD_REQUEST,
            error_body(
                "bad-request",
                "Malformed delivery event".to_string(),
                format!("unparseable timestamp {:?}", request.timestamp),
            ),
        );
    };

    let task_id = request_id.unwrap_or_else(new_uuid_v7);
    let event = PresenceEvent {
        event_id: request.event_uid.clone(),
        gate_id: request.location.clone(),
        status: request.status.clone(),
        timestamp,
        description: request.description.clone(),
        attributes: request.meta_info.clone(),
    };

    info!(
        task_id = %task_id,
        event_uid = %request.event_uid,
        event_name = %request.event_name,
        location = %request.location,
        status = %request.status,
        "delivery_event_received"
    );

    let task = IngestTask { task_id: task_id.clone(), event };
    if !ctx.ingest.enqueue(task) {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            error_body(
                "unavailable",
                "Ingest queue is full".to_string(),
                "retry with backoff".to_string(),
            ),
        );
    }

    (StatusCode::OK, json!({"status": "received", "task_id": task_id, "data": {}}))
}

/// GET /api/v1/delivery/task/status/{task_id}
pub fn task_status(ctx: &ApiContext, task_id: &str) -> (StatusCode, Value) {
    let state = ctx.ingest.status_store().get(task_id);
    match serde_json::to_value(&state) {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            error_body("internal", "Internal Server Error".to_string(), e.to_string()),
        ),
    }
}

/// GET /api/v1/delivery
pub fn list_deliveries(ctx: &ApiContext, params: &FxHashMap<String, String>) -> (StatusCode, Value) {
    let items_per_page = match params.get("items_per_page") {
        Some(raw) => match raw.parse::<usize>() {
            Ok(n) => n,
            Err(_) => {
                return (
                    StatusCode::BAD_REQUEST,
                    error_body(
                        "bad request",
                        format!("items_per_page {raw:?} is not a number"),
                        "invalid items_per_page".to_string(),
                    ),
                );
            }
        },
        None => ctx.config.items_per_page(),
    };
    if items_per_page == 0 {
        return (
            StatusCode::BAD_REQUEST,
            error_body(
                "bad request",
                "Bad Request, items_per_page should not be 0".to_string(),
                "division by zero.".to_string(),
            ),
        );
    }

    let page = params
        .get("page")
        .and_then(|p| p.parse::<usize>().ok())
        .unwrap_or(1)
        .max(1);

    let gate_id = params.get("gate_id").map(String::as_str);
    if let Some(gate) = gate_id {
        if !ctx.config.is_known_gate(gate) {
            return (
                StatusCode::NOT_FOUND,
                error_body(
                    "not found",
                    format!("Gate ID {gate} not found"),
                    format!("Gate ID {gate} not found"),
                ),
            );
        }
    }

    let from = params
        .get("from_date")
        .and_then(|s| parse_datetime_param(s))
        .unwrap_or_else(start_of_today);
    let to = params
        .get("to_date")
        .and_then(|s| parse_datetime_param(s))
        .unwrap_or_else(|| from + ChronoDuration::days(1));
    // documented one-day padding; upper bound is exclusive
    let to = to + ChronoDuration::days(1);

    let (deliveries, total) = ctx.ledger.list_range(gate_id, from, to, page, items_per_page);

    let offset = ChronoDuration::hours(ctx.config.display_offset_hours());
    let now = now_utc();
    let items: Vec<Value> = deliveries
        .iter()
        .map(|d| {
            let start = d.start + offset;
            let end = d.end.unwrap_or(now) + offset;
            // severity scoring is an external system; constant until it lands
            let severity_level = 0u8;
            json!({
                "delivery_id": d.id.padded(),
                "date": start.format("%Y-%m-%d").to_string(),
                "start": start.format("%H:%M:%S").to_string(),
                "end": end.format("%H:%M:%S").to_string(),
                "location": d.location,
                "problematic_objects": severity_flag(severity_level),
                "long_objects": severity_flag(severity_level),
                "dust": GREEN_SQUARE,
                "hotspot": GREEN_SQUARE,
            })
        })
        .collect();

    let pages = total.div_ceil(items_per_page);

    (
        StatusCode::OK,
        json!({
            "type": "collection",
            "total_record": total,
            "pages": pages,
            "items": items,
            "flag_interpretation": {
                "normal": {"description": "no anomaly", "color": "green", "hex": "#008000"},
                "low": {"description": "anomaly level is low", "color": "yellow", "hex": "#FFFF00"},
                "medium": {"description": "anomaly level is medium", "color": "orange", "hex": "#FFA500"},
                "high": {"description": "anomaly level is high", "color": "red", "hex": "#FF0000"},
            }
        }),
    )
}

/// GET /api/v1/delivery/assets/{delivery_id}
pub fn delivery_assets(ctx: &ApiContext, delivery_id: &str) -> (StatusCode, Value) {
    if delivery_id == "null" {
        return (
            StatusCode::BAD_REQUEST,
            error_body(
                "bad-request",
                "delivery_id is not supposed to be null".to_string(),
                "please provide a valid delivery_id".to_string(),
            ),
        );
    }
    let Ok(id) = delivery_id.parse::<u64>() else {
        return (
            StatusCode::BAD_REQUEST,
            error_body(
                "bad-request",
                format!("delivery_id is expected a number but got {delivery_id}"),
                "please provide a valid delivery_id".to_string(),
            ),
        );
    };

    let Some(delivery) = ctx.ledger.get(crate::domain::delivery::DeliveryId(id)) else {
        return (
            StatusCode::NOT_FOUND,
            error_body(
                "not-found",
                format!("delivery_id {delivery_id} is not found"),
                "please provide a valid delivery_id".to_string(),
            ),
        );
    };

    let offset = ChronoDuration::hours(ctx.config.display_offset_hours());
    let now_display = (now_utc() + offset).format("%Y-%m-%d %H:%M:%S").to_string();

    let snapshots_dir =
        assets::resolve_media_dir(ctx.config.media_root(), delivery.attribute_str("snapshots"));
    let snapshots = snapshots_dir.as_deref().map(assets::list_snapshots).unwrap_or_default();
    let snapshot_entries = if snapshots.is_empty() {
        vec![assets::placeholder_entry(&now_display)]
    } else {
        snapshots
    };

    let mut items = json!({
        "snapshots": {
            "title": "Activity",
            "type": "image",
            "data": snapshot_entries,
        }
    });

    let videos_dir =
        assets::resolve_media_dir(ctx.config.media_root(), delivery.attribute_str("videos"));
    let videos = videos_dir.as_deref().map(assets::list_videos).unwrap_or_default();
    if !videos.is_empty() {
        items["videos"] = json!({
            "title": "Timelapse recording",
            "type": "video",
            "data": videos,
        });
    }

    (
        StatusCode::OK,
        json!({
            "delivery": {
                "title": "Review",
                "items": items,
            },
            "analytics": {
                "impurity": {"severity_level": 0},
                "long_objects": {"severity_level": 0},
                "dust": {"severity_level": 0},
                "hotspot": {"severity_level": 0},
            },
        }),
    )
}

fn gate_delivery_summary(delivery: &Delivery, gate_id: &str, now: DateTime<Utc>) -> Value {
    let end_display = delivery.end.unwrap_or(now);
    let gate_status =
        if delivery.is_open() { "delivery in progress" } else { "no current delivery" };
    json!({
        "delivery_id": delivery.id.0,
        "delivery_uid": delivery.delivery_uid,
        "delivery_location": gate_id,
        "delivery_start": delivery.start.format("%Y-%m-%d %H:%M:%S").to_string(),
        "delivery_end": end_display.format("%Y-%m-%d %H:%M:%S").to_string(),
        "delivery_status": delivery.status.as_str(),
        "gate_status": gate_status,
        "videos_dir": delivery.attribute_str("videos").unwrap_or(""),
        "snapshots_dir": delivery.attribute_str("snapshots").unwrap_or(""),
    })
}

/// GET /api/v1/gate/{gate_id}
pub fn gate_status(
    ctx: &ApiContext,
    gate_id: &str,
    params: &FxHashMap<String, String>,
) -> (StatusCode, Value) {
    if gate_id == "null" || gate_id.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            error_body(
                "bad-request",
                "gate_id is not supposed to be null".to_string(),
                "please provide a valid gate_id".to_string(),
            ),
        );
    }
    if !ctx.config.is_known_gate(gate_id) {
        return (
            StatusCode::NOT_FOUND,
            error_body(
                "not-found",
                format!("entity_id {gate_id} is not found"),
                "please provide a valid gate_id".to_string(),
            ),
        );
    }
    let Some(last) = ctx.ledger.last_delivery(gate_id) else {
        return (
            StatusCode::NOT_FOUND,
            error_body(
                "not-found",
                format!("delivery for {gate_id} is not found"),
                format!("No delivery has been registered for {gate_id} yet"),
            ),
        );
    };

    let now = now_utc();
    if last.is_open() {
        return (StatusCode::OK, gate_delivery_summary(&last, gate_id, now));
    }

    let timestamp = params
        .get("timestamp")
        .and_then(|s| parse_datetime_param(s))
        .unwrap_or(now);
    let diff = params.get("diff").and_then(|d| d.parse::<i64>().ok()).unwrap_or(60);

    // closed delivery always carries an end
    let end = last.end.unwrap_or(last.start);
    let elapsed = (timestamp - end).num_seconds();
    if elapsed > diff {
        return (
            StatusCode::OK,
            json!({
                "delivery_id": null,
                "delivery_end": end.format("%Y-%m-%d %H:%M:%S").to_string(),
                "timestamp": timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
                "diff": elapsed,
            }),
        );
    }

    (StatusCode::OK, gate_delivery_summary(&last, gate_id, now))
}

/// Write a simple metric (counter or gauge) with site label
fn write_metric(output: &mut String, name: &str, help: &str, typ: &str, site: &str, val: u64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {typ}");
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val}");
}

/// Format metrics in Prometheus text exposition format
pub fn format_prometheus_metrics(ctx: &ApiContext) -> String {
    let summary = ctx.metrics.report();
    let site = ctx.config.site_id();
    let mut output = String::with_capacity(4096);

    write_metric(
        &mut output,
        "delivery_events_received_total",
        "Presence events accepted at the ingest boundary",
        "counter",
        site,
        summary.events_received,
    );
    write_metric(
        &mut output,
        "delivery_events_processed_total",
        "Presence events run through the derivation engine",
        "counter",
        site,
        summary.events_processed,
    );
    write_metric(
        &mut output,
        "delivery_ingest_dropped_total",
        "Events dropped because an ingest shard was full",
        "counter",
        site,
        summary.ingest_dropped,
    );
    write_metric(
        &mut output,
        "delivery_opened_total",
        "Deliveries opened",
        "counter",
        site,
        summary.deliveries_opened,
    );
    write_metric(
        &mut output,
        "delivery_closed_total",
        "Deliveries closed",
        "counter",
        site,
        summary.deliveries_closed,
    );
    write_metric(
        &mut output,
        "delivery_noop_transitions_total",
        "No-op transitions absorbed by the state machine",
        "counter",
        site,
        summary.noop_transitions,
    );
    write_metric(
        &mut output,
        "delivery_invalid_events_total",
        "Events rejected for an invalid status value",
        "counter",
        site,
        summary.invalid_events,
    );
    write_metric(
        &mut output,
        "delivery_unknown_gate_total",
        "Events rejected for an unregistered gate",
        "counter",
        site,
        summary.unknown_gate_events,
    );
    write_metric(
        &mut output,
        "delivery_lock_contention_total",
        "Gate lease acquisition failures",
        "counter",
        site,
        summary.lock_contention,
    );
    write_metric(
        &mut output,
        "delivery_ledger_conflicts_total",
        "Ledger conflict or invalid-state failures",
        "counter",
        site,
        summary.ledger_conflicts,
    );
    write_metric(
        &mut output,
        "delivery_task_retries_total",
        "Ingest task retries scheduled",
        "counter",
        site,
        summary.task_retries,
    );
    write_metric(
        &mut output,
        "delivery_tasks_failed_total",
        "Ingest tasks that ended in failure",
        "counter",
        site,
        summary.tasks_failed,
    );
    write_metric(
        &mut output,
        "delivery_effects_dropped_total",
        "Effect intents dropped on a full channel",
        "counter",
        site,
        summary.effects_dropped,
    );
    write_metric(
        &mut output,
        "delivery_notify_failures_total",
        "Outbound notification failures",
        "counter",
        site,
        summary.notify_failures,
    );
    write_metric(
        &mut output,
        "delivery_snapshots_emitted_total",
        "Progress snapshots emitted",
        "counter",
        site,
        summary.snapshots_emitted,
    );
    write_metric(
        &mut output,
        "delivery_open_deliveries",
        "Currently open deliveries",
        "gauge",
        site,
        ctx.ledger.open_count() as u64,
    );
    write_metric(
        &mut output,
        "delivery_ledger_records",
        "Total recorded deliveries",
        "gauge",
        site,
        ctx.ledger.delivery_count() as u64,
    );

    // engine latency histogram
    let buckets = ctx.metrics.latency_buckets();
    let _ = writeln!(output, "# HELP delivery_engine_latency_us Engine processing latency in microseconds");
    let _ = writeln!(output, "# TYPE delivery_engine_latency_us histogram");
    let mut cumulative = 0u64;
    for (i, &bound) in METRICS_BUCKET_BOUNDS.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(
            output,
            "delivery_engine_latency_us_bucket{{site=\"{site}\",le=\"{bound}\"}} {cumulative}"
        );
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(
        output,
        "delivery_engine_latency_us_bucket{{site=\"{site}\",le=\"+Inf\"}} {cumulative}"
    );
    let _ = writeln!(output, "delivery_engine_latency_us_count{{site=\"{site}\"}} {cumulative}");

    output
}

fn json_response(status: StatusCode, body: Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .expect("static response should not fail")
}

fn text_response(status: StatusCode, content_type: &str, body: String) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", content_type)
        .body(Full::new(Bytes::from(body)))
        .expect("static response should not fail")
}

/// Handle one HTTP request
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    ctx: Arc<ApiContext>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let params = parse_query(req.uri().query());

    let response = match (&method, path.as_str()) {
        (&Method::POST, "/api/v1/delivery/event") => {
            let request_id = req
                .headers()
                .get("x-request-id")
                .and_then(|v| v.to_str().ok())
                .map(String::from);
            match req.into_body().collect().await {
                Ok(collected) => {
                    let body = collected.to_bytes();
                    let (status, value) = ingest_event(&ctx, &body, request_id);
                    json_response(status, value)
                }
                Err(e) => json_response(
                    StatusCode::BAD_REQUEST,
                    error_body("bad-request", "Failed to read body".to_string(), e.to_string()),
                ),
            }
        }
        (&Method::GET, p) if p.starts_with("/api/v1/delivery/task/status/") => {
            let task_id = &p["/api/v1/delivery/task/status/".len()..];
            let (status, value) = task_status(&ctx, task_id);
            json_response(status, value)
        }
        (&Method::GET, p) if p.starts_with("/api/v1/delivery/assets/") => {
            let delivery_id = &p["/api/v1/delivery/assets/".len()..];
            let (status, value) = delivery_assets(&ctx, delivery_id);
            json_response(status, value)
        }
        (&Method::GET, "/api/v1/delivery") => {
            let (status, value) = list_deliveries(&ctx, &params);
            json_response(status, value)
        }
        (&Method::GET, p) if p.starts_with("/api/v1/gate/") => {
            let gate_id = &p["/api/v1/gate/".len()..];
            let (status, value) = gate_status(&ctx, gate_id, &params);
            json_response(status, value)
        }
        (&Method::GET, "/metrics") => {
            let body = format_prometheus_metrics(&ctx);
            text_response(
                StatusCode::OK,
                "text/plain; version=0.0.4; charset=utf-8",
                body,
            )
        }
        (&Method::GET, "/health") => text_response(StatusCode::OK, "text/plain", "ok".to_string()),
        _ => json_response(
            StatusCode::NOT_FOUND,
            error_body("not-found", "Not Found".to_string(), path.clone()),
        ),
    };

    Ok(response)
}

/// Start the API HTTP server
pub async fn start_api_server(
    ctx: Arc<ApiContext>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr: SocketAddr =
        format!("{}:{}", ctx.config.http_bind_address(), ctx.config.http_port()).parse()?;
    let listener = TcpListener::bind(addr).await?;

    info!(addr = %addr, site = %ctx.config.site_id(), "api_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let ctx = ctx.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let ctx = ctx.clone();
                                async move { handle_request(req, ctx).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "api_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "api_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("api_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}

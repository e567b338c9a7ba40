//! HTTP request handlers.

use super::AppState;
use crate::db::{DbError, EventRecord, PingSample, Target};
use crate::insights::{compute_insights, InsightQuery, InsightsError, MAX_SAMPLES};
use crate::probe::{run_traceroute, TraceError, TraceHop};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;

fn db_error(e: DbError) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

/// Lenient RFC 3339 parse for optional query timestamps.
fn parse_time(value: &Option<String>) -> Option<DateTime<Utc>> {
    value
        .as_ref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

// ============================================================================
// Targets
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateTargetRequest {
    pub ip: String,
    #[serde(default)]
    pub frequency: Option<i64>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TargetStatus {
    pub message: String,
    pub id: i64,
}

pub async fn handle_create_target(
    State(state): State<AppState>,
    Json(req): Json<CreateTargetRequest>,
) -> impl IntoResponse {
    let ip: IpAddr = match req.ip.parse() {
        Ok(ip) => ip,
        Err(_) => return (StatusCode::BAD_REQUEST, "Invalid IP address".to_string()).into_response(),
    };

    match state.store.get_target_by_ip(&ip.to_string()) {
        Ok(Some(_)) => {
            return (StatusCode::BAD_REQUEST, "IP already monitored".to_string()).into_response()
        }
        Ok(None) => {}
        Err(e) => return db_error(e).into_response(),
    }

    let mut target = Target {
        ip_address: ip.to_string(),
        frequency_secs: req.frequency.unwrap_or(1).max(1),
        notes: req.notes,
        ..Default::default()
    };

    if let Err(e) = state.store.add_target(&mut target) {
        return db_error(e).into_response();
    }
    if let Err(e) = state.monitor.start(&target) {
        return db_error(e).into_response();
    }

    Json(TargetStatus {
        message: format!("Started tracking {}", target.ip_address),
        id: target.id,
    })
    .into_response()
}

pub async fn handle_list_targets(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.get_targets() {
        Ok(targets) => Json(targets).into_response(),
        Err(e) => db_error(e).into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct UpdateTargetRequest {
    #[serde(default)]
    pub frequency: Option<i64>,
    #[serde(default)]
    pub notes: Option<String>,
}

pub async fn handle_update_target(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateTargetRequest>,
) -> impl IntoResponse {
    let mut target = match state.store.get_target(id) {
        Ok(Some(t)) => t,
        Ok(None) => return (StatusCode::NOT_FOUND, "Target not found".to_string()).into_response(),
        Err(e) => return db_error(e).into_response(),
    };

    if let Some(frequency) = req.frequency {
        target.frequency_secs = frequency.max(1);
    }
    if let Some(notes) = req.notes {
        target.notes = if notes.is_empty() { None } else { Some(notes) };
    }

    match state.store.update_target(&target) {
        Ok(()) => Json(target).into_response(),
        Err(DbError::NotFound) => {
            (StatusCode::NOT_FOUND, "Target not found".to_string()).into_response()
        }
        Err(e) => db_error(e).into_response(),
    }
}

pub async fn handle_pause_target(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    match state.store.get_target(id) {
        Ok(Some(_)) => {}
        Ok(None) => return (StatusCode::NOT_FOUND, "Target not found".to_string()).into_response(),
        Err(e) => return db_error(e).into_response(),
    }

    if let Err(e) = state.store.set_target_active(id, false) {
        return db_error(e).into_response();
    }
    if let Err(e) = state.monitor.stop(id, "Tracking paused") {
        return db_error(e).into_response();
    }

    Json(TargetStatus {
        message: "Tracking paused".to_string(),
        id,
    })
    .into_response()
}

pub async fn handle_resume_target(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    let target = match state.store.get_target(id) {
        Ok(Some(t)) => t,
        Ok(None) => return (StatusCode::NOT_FOUND, "Target not found".to_string()).into_response(),
        Err(e) => return db_error(e).into_response(),
    };

    if let Err(e) = state.store.set_target_active(id, true) {
        return db_error(e).into_response();
    }
    if let Err(e) = state.monitor.start(&target) {
        return db_error(e).into_response();
    }

    Json(TargetStatus {
        message: "Tracking resumed".to_string(),
        id,
    })
    .into_response()
}

pub async fn handle_delete_target(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    match state.store.get_target(id) {
        Ok(Some(_)) => {}
        Ok(None) => return (StatusCode::NOT_FOUND, "Target not found".to_string()).into_response(),
        Err(e) => return db_error(e).into_response(),
    }

    // The loop must be confirmed stopped before its rows disappear.
    if let Err(e) = state.monitor.stop(id, "Tracking stopped and target deleted") {
        return db_error(e).into_response();
    }
    if let Err(e) = state.store.delete_target(id) {
        return db_error(e).into_response();
    }

    Json(TargetStatus {
        message: "Target deleted".to_string(),
        id,
    })
    .into_response()
}

// ============================================================================
// Logs & events
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    #[serde(default)]
    pub limit: Option<i64>,
}

pub async fn handle_get_logs(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<LogsQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(100).clamp(1, 1000);
    match state.store.recent_pings(id, limit) {
        Ok(samples) => Json::<Vec<PingSample>>(samples).into_response(),
        Err(e) => db_error(e).into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
    #[serde(default)]
    pub limit: Option<i64>,
}

pub async fn handle_get_events(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<EventsQuery>,
) -> impl IntoResponse {
    let start = parse_time(&query.start);
    let end = parse_time(&query.end);
    if let (Some(start), Some(end)) = (start, end) {
        if start >= end {
            return (StatusCode::BAD_REQUEST, "start must be before end".to_string())
                .into_response();
        }
    }
    let limit = query.limit.unwrap_or(500).clamp(1, 5000);

    match state.store.get_events(id, start, end, limit) {
        Ok(mut events) => {
            events.reverse(); // oldest first for the caller
            Json::<Vec<EventRecord>>(events).into_response()
        }
        Err(e) => db_error(e).into_response(),
    }
}

// ============================================================================
// Insights
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct InsightsParams {
    #[serde(default)]
    pub window_minutes: Option<i64>,
    #[serde(default)]
    pub bucket_seconds: Option<i64>,
    #[serde(default)]
    pub max_samples: Option<i64>,
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
}

pub async fn handle_get_insights(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(params): Query<InsightsParams>,
) -> impl IntoResponse {
    let query = InsightQuery {
        window_minutes: params.window_minutes.unwrap_or(60),
        bucket_seconds: params.bucket_seconds.unwrap_or(60),
        max_samples: params.max_samples.unwrap_or(MAX_SAMPLES),
        start: parse_time(&params.start),
        end: parse_time(&params.end),
    };

    match compute_insights(&state.store, id, &query) {
        Ok(report) => Json(report).into_response(),
        Err(InsightsError::NotFound) => {
            (StatusCode::NOT_FOUND, "Target not found".to_string()).into_response()
        }
        Err(e @ InsightsError::InvalidWindow(_)) => {
            (StatusCode::BAD_REQUEST, e.to_string()).into_response()
        }
        Err(InsightsError::Db(e)) => db_error(e).into_response(),
    }
}

// ============================================================================
// Traceroute
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct TracerouteQuery {
    #[serde(default)]
    pub max_hops: Option<u32>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct TracerouteResponse {
    pub target_id: i64,
    pub target_ip: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: f64,
    pub hops: Vec<TraceHop>,
}

pub async fn handle_traceroute(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<TracerouteQuery>,
) -> impl IntoResponse {
    let target = match state.store.get_target(id) {
        Ok(Some(t)) => t,
        Ok(None) => return (StatusCode::NOT_FOUND, "Target not found".to_string()).into_response(),
        Err(e) => return db_error(e).into_response(),
    };

    let max_hops = query.max_hops.unwrap_or(20).clamp(1, 64);
    let timeout = Duration::from_secs(query.timeout_secs.unwrap_or(25).clamp(1, 120));

    match run_traceroute(&target.ip_address, max_hops, timeout).await {
        Ok(report) => Json(TracerouteResponse {
            target_id: target.id,
            target_ip: target.ip_address,
            started_at: report.started_at,
            finished_at: report.finished_at,
            duration_ms: report.duration_ms,
            hops: report.hops,
        })
        .into_response(),
        Err(e @ TraceError::Unavailable(_)) => {
            (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response()
        }
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

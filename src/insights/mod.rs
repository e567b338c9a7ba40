//! Windowed insight reports over ping history.
//!
//! A query resolves a UTC time window and a bucket width, picks a data
//! source for that bucket width, and produces summary statistics plus an
//! ordered per-bucket timeline. Coarse buckets are answered from the
//! pre-aggregated rollup table; sub-minute buckets fall back to raw
//! samples. Both paths produce the identical report shape.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::db::{DbError, PingSample, RollupRow, Store, Target};

pub const DEFAULT_WINDOW_MINUTES: i64 = 60;
pub const DEFAULT_BUCKET_SECONDS: i64 = 60;
/// Hard ceiling on raw samples per query; supports multi-day windows
/// without unbounded reads.
pub const MAX_SAMPLES: i64 = 20_000;

const MIN_BUCKET_SECONDS: i64 = 10;
const MIN_SAMPLES: i64 = 100;

#[derive(Error, Debug)]
pub enum InsightsError {
    #[error("target not found")]
    NotFound,
    #[error("invalid window: {0}")]
    InvalidWindow(&'static str),
    #[error(transparent)]
    Db(#[from] DbError),
}

/// Query parameters, before clamping and window resolution.
#[derive(Debug, Clone)]
pub struct InsightQuery {
    /// Look-back from now, used when `start`/`end` are not given.
    pub window_minutes: i64,
    pub bucket_seconds: i64,
    pub max_samples: i64,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl Default for InsightQuery {
    fn default() -> Self {
        Self {
            window_minutes: DEFAULT_WINDOW_MINUTES,
            bucket_seconds: DEFAULT_BUCKET_SECONDS,
            max_samples: MAX_SAMPLES,
            start: None,
            end: None,
        }
    }
}

/// Data source for one query, resolved once from the bucket width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QuerySource {
    /// Hour-granularity rollups, for buckets of an hour and up.
    HourRollup,
    /// Minute-granularity rollups.
    MinuteRollup,
    /// Raw samples; rollups cannot represent sub-minute resolution.
    Raw,
}

fn select_source(bucket_seconds: i64) -> QuerySource {
    if bucket_seconds >= 3600 {
        QuerySource::HourRollup
    } else if bucket_seconds >= 60 {
        QuerySource::MinuteRollup
    } else {
        QuerySource::Raw
    }
}

/// One bucket of the report timeline.
#[derive(Debug, Clone, Serialize)]
pub struct TimelinePoint {
    pub bucket: DateTime<Utc>,
    pub avg_latency_ms: Option<f64>,
    pub min_latency_ms: Option<f64>,
    pub max_latency_ms: Option<f64>,
    pub loss_rate: f64,
    pub sample_count: i64,
}

/// Computed insight report. Ephemeral, never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct InsightReport {
    pub target_id: i64,
    pub target_ip: String,
    pub created_at: DateTime<Utc>,
    /// Resolved span in whole minutes, not necessarily the caller's input.
    pub window_minutes: i64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub sample_count: i64,
    pub loss_count: i64,
    pub uptime_percent: Option<f64>,
    pub latency_avg_ms: Option<f64>,
    pub latency_min_ms: Option<f64>,
    pub latency_max_ms: Option<f64>,
    pub latency_p50_ms: Option<f64>,
    pub latency_p95_ms: Option<f64>,
    pub latency_p99_ms: Option<f64>,
    pub timeline: Vec<TimelinePoint>,
}

/// Compute the insight report for one target over one window.
pub fn compute_insights(
    store: &Store,
    target_id: i64,
    query: &InsightQuery,
) -> Result<InsightReport, InsightsError> {
    let target = store.get_target(target_id)?.ok_or(InsightsError::NotFound)?;

    let window_minutes = query.window_minutes.max(1);
    let bucket_seconds = query.bucket_seconds.max(MIN_BUCKET_SECONDS);
    let max_samples = query.max_samples.clamp(MIN_SAMPLES, MAX_SAMPLES);

    let window_end = query.end.unwrap_or_else(Utc::now);
    let window_start = query
        .start
        .unwrap_or_else(|| window_end - Duration::minutes(window_minutes));
    if window_start >= window_end {
        return Err(InsightsError::InvalidWindow(
            "window start must be before window end",
        ));
    }
    let window_minutes = ((window_end - window_start).num_seconds() / 60).max(1);

    let aggregation = match select_source(bucket_seconds) {
        QuerySource::HourRollup => {
            let rows = store.get_rollups(target_id, 3600, window_start, window_end)?;
            aggregate_rollups(&rows, bucket_seconds)
        }
        QuerySource::MinuteRollup => {
            let rows = store.get_rollups(target_id, 60, window_start, window_end)?;
            aggregate_rollups(&rows, bucket_seconds)
        }
        QuerySource::Raw => {
            // Most recent first so the limit drops the oldest samples.
            let samples =
                store.get_ping_samples(target_id, window_start, window_end, max_samples, true)?;
            aggregate_raw(&samples, bucket_seconds)
        }
    };

    Ok(build_report(
        &target,
        window_start,
        window_end,
        window_minutes,
        aggregation,
    ))
}

/// Common output shape of both aggregation paths.
struct Aggregation {
    sample_count: i64,
    loss_count: i64,
    avg: Option<f64>,
    min: Option<f64>,
    max: Option<f64>,
    p50: Option<f64>,
    p95: Option<f64>,
    p99: Option<f64>,
    timeline: Vec<TimelinePoint>,
}

/// Re-bucket rollup rows to the requested width and summarize.
///
/// Percentiles on this path are approximated from the distribution of
/// per-bucket average latencies rather than individual samples. That is
/// a deliberate accuracy/performance tradeoff for large windows.
fn aggregate_rollups(rows: &[RollupRow], bucket_seconds: i64) -> Aggregation {
    #[derive(Default)]
    struct Accum {
        samples: i64,
        loss: i64,
        weighted_sum: f64,
        has_avg: bool,
        min: Option<f64>,
        max: Option<f64>,
    }

    let mut buckets: BTreeMap<i64, Accum> = BTreeMap::new();

    for row in rows {
        let key = floor_epoch(row.bucket.timestamp(), bucket_seconds);
        let acc = buckets.entry(key).or_default();
        acc.samples += row.samples;
        acc.loss += row.loss_count;
        if let Some(avg) = row.avg_latency_ms {
            acc.weighted_sum += avg * row.samples as f64;
            acc.has_avg = true;
        }
        acc.min = merge_min(acc.min, row.min_latency_ms);
        acc.max = merge_max(acc.max, row.max_latency_ms);
    }

    let mut timeline = Vec::with_capacity(buckets.len());
    let mut bucket_avgs = Vec::new();
    let mut sample_count = 0;
    let mut loss_count = 0;
    let mut min = None;
    let mut max = None;

    for (key, acc) in buckets {
        // Sample-count-weighted mean of the constituent rows' averages.
        let avg = if acc.has_avg && acc.samples > 0 {
            Some(acc.weighted_sum / acc.samples as f64)
        } else {
            None
        };
        if let Some(avg) = avg {
            bucket_avgs.push(avg);
        }

        sample_count += acc.samples;
        loss_count += acc.loss;
        min = merge_min(min, acc.min);
        max = merge_max(max, acc.max);

        let loss_rate = if acc.samples > 0 {
            acc.loss as f64 / acc.samples as f64
        } else {
            0.0
        };

        timeline.push(TimelinePoint {
            bucket: DateTime::from_timestamp(key, 0).unwrap_or_else(Utc::now),
            avg_latency_ms: avg,
            min_latency_ms: acc.min,
            max_latency_ms: acc.max,
            loss_rate,
            sample_count: acc.samples,
        });
    }

    bucket_avgs.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    Aggregation {
        sample_count,
        loss_count,
        avg: mean(&bucket_avgs),
        min,
        max,
        p50: percentile(&bucket_avgs, 0.5),
        p95: percentile(&bucket_avgs, 0.95),
        p99: percentile(&bucket_avgs, 0.99),
        timeline,
    }
}

/// Bucket raw samples and summarize with exact percentiles.
fn aggregate_raw(samples: &[PingSample], bucket_seconds: i64) -> Aggregation {
    #[derive(Default)]
    struct Accum {
        count: i64,
        loss: i64,
        latencies: Vec<f64>,
    }

    let mut buckets: BTreeMap<i64, Accum> = BTreeMap::new();
    let mut valid = Vec::new();
    let mut loss_count = 0;

    for sample in samples {
        let is_loss = sample.lost || sample.latency_ms.is_none();
        if is_loss {
            loss_count += 1;
        }

        let acc = buckets
            .entry(floor_epoch(sample.time.timestamp(), bucket_seconds))
            .or_default();
        acc.count += 1;
        if is_loss {
            acc.loss += 1;
        } else if let Some(latency) = sample.latency_ms {
            acc.latencies.push(latency);
            valid.push(latency);
        }
    }

    let timeline = buckets
        .into_iter()
        .map(|(key, acc)| {
            let loss_rate = if acc.count > 0 {
                acc.loss as f64 / acc.count as f64
            } else {
                0.0
            };
            TimelinePoint {
                bucket: DateTime::from_timestamp(key, 0).unwrap_or_else(Utc::now),
                avg_latency_ms: mean(&acc.latencies),
                min_latency_ms: acc
                    .latencies
                    .iter()
                    .copied()
                    .fold(None, |m, v| merge_min(m, Some(v))),
                max_latency_ms: acc
                    .latencies
                    .iter()
                    .copied()
                    .fold(None, |m, v| merge_max(m, Some(v))),
                loss_rate,
                sample_count: acc.count,
            }
        })
        .collect();

    valid.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    Aggregation {
        sample_count: samples.len() as i64,
        loss_count,
        avg: mean(&valid),
        min: valid.first().copied(),
        max: valid.last().copied(),
        p50: percentile(&valid, 0.5),
        p95: percentile(&valid, 0.95),
        p99: percentile(&valid, 0.99),
        timeline,
    }
}

fn build_report(
    target: &Target,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    window_minutes: i64,
    agg: Aggregation,
) -> InsightReport {
    let uptime_percent = if agg.sample_count > 0 {
        Some((1.0 - agg.loss_count as f64 / agg.sample_count as f64) * 100.0)
    } else {
        None
    };

    InsightReport {
        target_id: target.id,
        target_ip: target.ip_address.clone(),
        created_at: target.created_at,
        window_minutes,
        window_start,
        window_end,
        sample_count: agg.sample_count,
        loss_count: agg.loss_count,
        uptime_percent,
        latency_avg_ms: agg.avg,
        latency_min_ms: agg.min,
        latency_max_ms: agg.max,
        latency_p50_ms: agg.p50,
        latency_p95_ms: agg.p95,
        latency_p99_ms: agg.p99,
        timeline: agg.timeline,
    }
}

/// Floor a UTC timestamp to the start of its bucket, anchored at the epoch.
pub fn floor_to_bucket(ts: DateTime<Utc>, bucket_seconds: i64) -> DateTime<Utc> {
    let floored = floor_epoch(ts.timestamp(), bucket_seconds);
    DateTime::from_timestamp(floored, 0).unwrap_or(ts)
}

fn floor_epoch(epoch_seconds: i64, bucket_seconds: i64) -> i64 {
    epoch_seconds - epoch_seconds.rem_euclid(bucket_seconds)
}

/// Interpolated percentile over an ascending-sorted slice.
///
/// `p` is in `[0, 1]`; values between order statistics are linearly
/// interpolated.
pub fn percentile(sorted: &[f64], p: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    if p <= 0.0 {
        return sorted.first().copied();
    }
    if p >= 1.0 {
        return sorted.last().copied();
    }
    let k = (sorted.len() - 1) as f64 * p;
    let lo = k.floor() as usize;
    let hi = (lo + 1).min(sorted.len() - 1);
    let weight = k - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * weight)
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

fn merge_min(current: Option<f64>, candidate: Option<f64>) -> Option<f64> {
    match (current, candidate) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn merge_max(current: Option<f64>, candidate: Option<f64>) -> Option<f64> {
    match (current, candidate) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

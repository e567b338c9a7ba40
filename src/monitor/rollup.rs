//! Background aggregation pipeline feeding the rollup table.
//!
//! Raw samples are condensed into minute buckets, and minute buckets are
//! cascaded into hour buckets. Each pass advances per-target watermarks
//! and only touches windows that have fully elapsed, so the insights
//! engine always reads complete buckets.

use crate::db::{DbError, RollupRow, Store};
use crate::insights::floor_to_bucket;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::Duration;
use tokio::task::JoinHandle;

pub const MINUTE_SECS: i64 = 60;
pub const HOUR_SECS: i64 = 3600;

/// Wait this long past a window's end before aggregating it, leaving room
/// for in-flight probe writes.
const WINDOW_GRACE_SECS: i64 = 5;

/// Upper bound on windows advanced per target per pass. A target with a
/// long raw backlog catches up over several passes instead of stalling
/// one pass on a huge batch.
const MAX_WINDOWS_PER_PASS: usize = 1440;

/// Periodic driver for rollup aggregation.
pub struct RollupPipeline {
    store: Store,
    interval: Duration,
}

impl RollupPipeline {
    pub fn new(store: Store, interval_secs: u64) -> Self {
        Self {
            store,
            interval: Duration::from_secs(interval_secs.max(1)),
        }
    }

    /// Spawn the background task.
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if let Err(e) = process_rollups(&self.store) {
                    tracing::error!("rollup pass failed: {}", e);
                }
            }
        })
    }
}

/// Run one aggregation pass over every target.
pub fn process_rollups(store: &Store) -> Result<(), DbError> {
    for target in store.get_targets()? {
        process_target_granularity(store, target.id, MINUTE_SECS, None)?;
        process_target_granularity(store, target.id, HOUR_SECS, Some(MINUTE_SECS))?;
    }
    Ok(())
}

/// Advance complete windows of one granularity for one target.
///
/// `source_granularity` of `None` aggregates from raw samples; otherwise
/// finer rollup rows are merged with a sample-count-weighted average.
fn process_target_granularity(
    store: &Store,
    target_id: i64,
    granularity_secs: i64,
    source_granularity: Option<i64>,
) -> Result<(), DbError> {
    let mut window_start = match store.last_rollup_bucket(target_id, granularity_secs)? {
        // The stored bucket is the START of the last finished window.
        Some(last) => last + ChronoDuration::seconds(granularity_secs),
        None => match store.earliest_ping_time(target_id)? {
            Some(earliest) => floor_to_bucket(earliest, granularity_secs),
            None => return Ok(()),
        },
    };

    let cutoff = Utc::now() - ChronoDuration::seconds(WINDOW_GRACE_SECS);
    let mut rows = Vec::new();

    while rows.len() < MAX_WINDOWS_PER_PASS {
        let window_end = window_start + ChronoDuration::seconds(granularity_secs);
        if window_end > cutoff {
            break;
        }

        let row = match source_granularity {
            None => aggregate_raw_window(store, target_id, granularity_secs, window_start, window_end)?,
            Some(source) => {
                aggregate_cascade_window(store, target_id, granularity_secs, source, window_start, window_end)?
            }
        };
        rows.push(row);
        window_start = window_end;
    }

    if !rows.is_empty() {
        let count = rows.len();
        store.upsert_rollups(&rows)?;
        tracing::debug!(
            "rollup: wrote {} {}s buckets for target {}",
            count,
            granularity_secs,
            target_id
        );
    }

    Ok(())
}

fn aggregate_raw_window(
    store: &Store,
    target_id: i64,
    granularity_secs: i64,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<RollupRow, DbError> {
    // Half-open window: a sample at exactly `end` belongs to the next bucket.
    let samples = store.get_ping_samples(
        target_id,
        start,
        end - ChronoDuration::nanoseconds(1),
        i64::MAX,
        false,
    )?;

    let mut loss_count = 0;
    let mut latencies = Vec::new();
    for sample in &samples {
        if sample.lost || sample.latency_ms.is_none() {
            loss_count += 1;
        } else if let Some(latency) = sample.latency_ms {
            latencies.push(latency);
        }
    }

    let avg = if latencies.is_empty() {
        None
    } else {
        Some(latencies.iter().sum::<f64>() / latencies.len() as f64)
    };
    let min = latencies.iter().copied().fold(None, fold_min);
    let max = latencies.iter().copied().fold(None, fold_max);

    // Empty windows still get a row so the watermark advances past gaps.
    Ok(RollupRow {
        bucket: start,
        target_id,
        granularity_secs,
        samples: samples.len() as i64,
        loss_count,
        avg_latency_ms: avg,
        min_latency_ms: min,
        max_latency_ms: max,
    })
}

fn aggregate_cascade_window(
    store: &Store,
    target_id: i64,
    granularity_secs: i64,
    source_granularity: i64,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<RollupRow, DbError> {
    let sub_rows = store.get_rollups(target_id, source_granularity, start, end)?;

    let mut samples = 0;
    let mut loss_count = 0;
    let mut weighted_sum = 0.0;
    let mut valid_weight = 0i64;
    let mut min = None;
    let mut max = None;

    for row in &sub_rows {
        samples += row.samples;
        loss_count += row.loss_count;
        if let Some(avg) = row.avg_latency_ms {
            // Weight each sub-average by its count of measured latencies;
            // losses carry no latency and must not dilute the mean.
            let weight = row.samples - row.loss_count;
            weighted_sum += avg * weight as f64;
            valid_weight += weight;
        }
        min = merge_opt(min, row.min_latency_ms, f64::min);
        max = merge_opt(max, row.max_latency_ms, f64::max);
    }

    let avg = if valid_weight > 0 {
        Some(weighted_sum / valid_weight as f64)
    } else {
        None
    };

    Ok(RollupRow {
        bucket: start,
        target_id,
        granularity_secs,
        samples,
        loss_count,
        avg_latency_ms: avg,
        min_latency_ms: min,
        max_latency_ms: max,
    })
}

fn fold_min(acc: Option<f64>, v: f64) -> Option<f64> {
    Some(acc.map_or(v, |a| a.min(v)))
}

fn fold_max(acc: Option<f64>, v: f64) -> Option<f64> {
    Some(acc.map_or(v, |a| a.max(v)))
}

fn merge_opt(a: Option<f64>, b: Option<f64>, f: fn(f64, f64) -> f64) -> Option<f64> {
    match (a, b) {
        (Some(x), Some(y)) => Some(f(x, y)),
        (x, y) => x.or(y),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{PingSample, Target};
    use tempfile::NamedTempFile;

    fn open_store_with_target() -> (NamedTempFile, Store, i64) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        let mut target = Target {
            ip_address: "192.0.2.50".to_string(),
            ..Default::default()
        };
        let id = store.add_target(&mut target).unwrap();
        (tmp, store, id)
    }

    fn seed_minute(store: &Store, target_id: i64, minute_start: DateTime<Utc>, lost_every: usize) {
        for i in 0..6 {
            let lost = lost_every > 0 && i % lost_every == 0;
            store
                .add_ping(&PingSample {
                    time: minute_start + ChronoDuration::seconds(i as i64 * 10),
                    target_id,
                    latency_ms: if lost { None } else { Some(10.0 + i as f64) },
                    hops: Some(4),
                    lost,
                })
                .unwrap();
        }
    }

    #[test]
    fn test_minute_rollups_from_raw() {
        let (_tmp, store, id) = open_store_with_target();
        let start = floor_to_bucket(Utc::now() - ChronoDuration::minutes(3), 60);
        seed_minute(&store, id, start, 0);
        seed_minute(&store, id, start + ChronoDuration::minutes(1), 3);

        process_rollups(&store).unwrap();

        let rows = store
            .get_rollups(id, MINUTE_SECS, start, start + ChronoDuration::minutes(2))
            .unwrap();
        assert_eq!(rows.len(), 2);

        assert_eq!(rows[0].samples, 6);
        assert_eq!(rows[0].loss_count, 0);
        assert_eq!(rows[0].min_latency_ms, Some(10.0));
        assert_eq!(rows[0].max_latency_ms, Some(15.0));
        assert!((rows[0].avg_latency_ms.unwrap() - 12.5).abs() < 1e-9);

        // Every third sample lost: indexes 0 and 3.
        assert_eq!(rows[1].samples, 6);
        assert_eq!(rows[1].loss_count, 2);
    }

    #[test]
    fn test_pass_is_idempotent() {
        let (_tmp, store, id) = open_store_with_target();
        let start = floor_to_bucket(Utc::now() - ChronoDuration::minutes(2), 60);
        seed_minute(&store, id, start, 0);

        process_rollups(&store).unwrap();
        let first = store
            .get_rollups(id, MINUTE_SECS, start, start + ChronoDuration::minutes(1))
            .unwrap();

        process_rollups(&store).unwrap();
        let second = store
            .get_rollups(id, MINUTE_SECS, start, start + ChronoDuration::minutes(1))
            .unwrap();

        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert_eq!(first[0].samples, second[0].samples);
    }

    #[test]
    fn test_gap_windows_get_empty_rows() {
        let (_tmp, store, id) = open_store_with_target();
        let start = floor_to_bucket(Utc::now() - ChronoDuration::minutes(4), 60);
        seed_minute(&store, id, start, 0);
        // Minute 2 has no samples; minute 3 does.
        seed_minute(&store, id, start + ChronoDuration::minutes(2), 0);

        process_rollups(&store).unwrap();

        let rows = store
            .get_rollups(id, MINUTE_SECS, start, start + ChronoDuration::minutes(3))
            .unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1].samples, 0);
        assert_eq!(rows[1].avg_latency_ms, None);
    }

    #[test]
    fn test_hour_cascade_weighted_average() {
        let (_tmp, store, id) = open_store_with_target();
        let hour_start = floor_to_bucket(Utc::now() - ChronoDuration::hours(2), 3600);

        // Two minute rows with different weights of measured latencies.
        store
            .upsert_rollups(&[
                RollupRow {
                    bucket: hour_start,
                    target_id: id,
                    granularity_secs: MINUTE_SECS,
                    samples: 60,
                    loss_count: 0,
                    avg_latency_ms: Some(10.0),
                    min_latency_ms: Some(8.0),
                    max_latency_ms: Some(14.0),
                },
                RollupRow {
                    bucket: hour_start + ChronoDuration::minutes(1),
                    target_id: id,
                    granularity_secs: MINUTE_SECS,
                    samples: 30,
                    loss_count: 10,
                    avg_latency_ms: Some(40.0),
                    min_latency_ms: Some(25.0),
                    max_latency_ms: Some(80.0),
                },
            ])
            .unwrap();

        let row = aggregate_cascade_window(
            &store,
            id,
            HOUR_SECS,
            MINUTE_SECS,
            hour_start,
            hour_start + ChronoDuration::hours(1),
        )
        .unwrap();

        assert_eq!(row.samples, 90);
        assert_eq!(row.loss_count, 10);
        // (10*60 + 40*20) / 80
        assert!((row.avg_latency_ms.unwrap() - 17.5).abs() < 1e-9);
        assert_eq!(row.min_latency_ms, Some(8.0));
        assert_eq!(row.max_latency_ms, Some(80.0));
    }

    #[test]
    fn test_incomplete_window_not_aggregated() {
        let (_tmp, store, id) = open_store_with_target();
        // Samples in the current, still-open minute.
        let now = Utc::now();
        store
            .add_ping(&PingSample {
                time: now,
                target_id: id,
                latency_ms: Some(9.0),
                hops: None,
                lost: false,
            })
            .unwrap();

        process_rollups(&store).unwrap();

        let rows = store
            .get_rollups(
                id,
                MINUTE_SECS,
                floor_to_bucket(now, 60),
                floor_to_bucket(now, 60) + ChronoDuration::minutes(1),
            )
            .unwrap();
        assert!(rows.is_empty());
    }
}

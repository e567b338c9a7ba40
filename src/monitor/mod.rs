//! Monitor scheduler: one concurrent polling loop per active target.
//!
//! The coordinator owns a map from target id to its running loop and
//! failure-tracking state. Lifecycle operations are idempotent; loops are
//! cancelled by aborting their task, and the caller side removes all
//! bookkeeping so a cancelled loop never has to clean up after itself.

mod rollup;

pub use rollup::*;

use crate::db::{DbError, EventKind, PingSample, Store, Target};
use crate::probe::{PingOutcome, Probe};

use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Consecutive lost probes before a failure event is recorded.
pub const CONSECUTIVE_FAILURE_THRESHOLD: u32 = 5;

/// Per-target failure state. Lives only while the loop runs; a restarted
/// process starts counting from zero again.
#[derive(Debug, Default)]
struct FailureTracking {
    consecutive: u32,
    reporting: bool,
}

struct LoopEntry {
    handle: JoinHandle<()>,
    tracking: Arc<Mutex<FailureTracking>>,
}

/// The scheduling coordinator. Constructed at startup and shared behind
/// an `Arc`; tests build a fresh one per run.
pub struct Monitor {
    store: Store,
    probe: Arc<dyn Probe>,
    loops: Mutex<HashMap<i64, LoopEntry>>,
}

impl Monitor {
    pub fn new(store: Store, probe: Arc<dyn Probe>) -> Self {
        Self {
            store,
            probe,
            loops: Mutex::new(HashMap::new()),
        }
    }

    /// Start monitoring a target. No-op if its loop is already running,
    /// so a double resume cannot spawn duplicate loops.
    ///
    /// The `start` event is written before this returns; the loop itself
    /// runs independently.
    pub fn start(&self, target: &Target) -> Result<(), DbError> {
        {
            let mut loops = self.loops.lock().unwrap();
            if loops.contains_key(&target.id) {
                return Ok(());
            }

            let tracking = Arc::new(Mutex::new(FailureTracking::default()));
            let handle = tokio::spawn(run_monitor_loop(
                self.store.clone(),
                self.probe.clone(),
                target.id,
                target.ip_address.clone(),
                target.frequency_secs.max(1) as u64,
                tracking.clone(),
            ));
            loops.insert(target.id, LoopEntry { handle, tracking });
        }

        tracing::info!("monitor: tracking target {} ({})", target.id, target.ip_address);
        self.store.add_event(
            Some(target.id),
            EventKind::Start,
            &format!("Tracking started for {}", target.ip_address),
        )
    }

    /// Stop monitoring a target and record a `stop` event with the given
    /// message. Safe to call for a target that is not running.
    pub fn stop(&self, target_id: i64, message: &str) -> Result<(), DbError> {
        {
            let mut loops = self.loops.lock().unwrap();
            if let Some(entry) = loops.remove(&target_id) {
                entry.handle.abort();
                tracing::info!("monitor: stopped tracking target {}", target_id);
            }
        }
        self.store.add_event(Some(target_id), EventKind::Stop, message)
    }

    /// Start a loop for every target marked active. Used at process start
    /// to restore monitoring; consecutive-failure counts do not survive a
    /// restart and begin at zero here.
    pub fn load_existing(&self) -> Result<(), DbError> {
        let targets = self.store.get_active_targets()?;
        tracing::info!("monitor: restoring {} active targets", targets.len());
        for target in targets {
            self.start(&target)?;
        }
        Ok(())
    }

    /// Cancel every running loop and clear all bookkeeping. Process
    /// teardown only; no stop events are written.
    pub fn shutdown_all(&self) {
        let mut loops = self.loops.lock().unwrap();
        for (_, entry) in loops.drain() {
            entry.handle.abort();
        }
    }

    pub fn is_running(&self, target_id: i64) -> bool {
        self.loops.lock().unwrap().contains_key(&target_id)
    }

    /// Consecutive-failure count of a running target's loop, if any.
    pub fn failure_streak(&self, target_id: i64) -> Option<u32> {
        self.loops
            .lock()
            .unwrap()
            .get(&target_id)
            .map(|entry| entry.tracking.lock().unwrap().consecutive)
    }

    pub fn running_count(&self) -> usize {
        self.loops.lock().unwrap().len()
    }
}

/// The polling loop for a single target. Runs until aborted.
async fn run_monitor_loop(
    store: Store,
    probe: Arc<dyn Probe>,
    target_id: i64,
    ip: String,
    frequency_secs: u64,
    tracking: Arc<Mutex<FailureTracking>>,
) {
    let interval = Duration::from_secs(frequency_secs.max(1));

    loop {
        let timestamp = Utc::now();

        // A probe that errors out counts as a lost sample; the loop
        // terminates only by cancellation.
        let outcome = match probe.ping(&ip).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!("probe for {} failed: {}", ip, e);
                PingOutcome::unreachable()
            }
        };

        let lost = outcome.lost || outcome.latency_ms.is_none();
        let sample = PingSample {
            time: timestamp,
            target_id,
            latency_ms: if lost { None } else { outcome.latency_ms },
            hops: outcome.hops,
            lost,
        };

        // A write failure loses this iteration's sample but not the loop.
        if let Err(e) = store.add_ping(&sample) {
            tracing::error!("failed to persist sample for {}: {}", ip, e);
        }

        if lost {
            let report_streak = {
                let mut t = tracking.lock().unwrap();
                t.consecutive += 1;
                if t.consecutive >= CONSECUTIVE_FAILURE_THRESHOLD && !t.reporting {
                    t.reporting = true;
                    Some(t.consecutive)
                } else {
                    None
                }
            };
            // Only the first crossing of the threshold records an event.
            if let Some(streak) = report_streak {
                record_loop_event(
                    &store,
                    target_id,
                    EventKind::Failure,
                    &format!("Target {} unreachable - {} consecutive failed pings", ip, streak),
                );
            }
        } else {
            let ended_streak = {
                let mut t = tracking.lock().unwrap();
                let streak = if t.reporting { Some(t.consecutive) } else { None };
                t.consecutive = 0;
                t.reporting = false;
                streak
            };
            if let Some(streak) = ended_streak {
                record_loop_event(
                    &store,
                    target_id,
                    EventKind::Recovery,
                    &format!("Target {} recovered after {} failed pings", ip, streak),
                );
            }
        }

        tokio::time::sleep(interval).await;
    }
}

fn record_loop_event(store: &Store, target_id: i64, kind: EventKind, message: &str) {
    if let Err(e) = store.add_event(Some(target_id), kind, message) {
        tracing::error!("failed to record {} event for target {}: {}", kind.as_str(), target_id, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::NamedTempFile;

    /// Probe whose outcome is scripted by the iteration number.
    struct ScriptedProbe<F: Fn(usize) -> PingOutcome + Send + Sync> {
        calls: AtomicUsize,
        script: F,
    }

    impl<F: Fn(usize) -> PingOutcome + Send + Sync> ScriptedProbe<F> {
        fn new(script: F) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                script,
            }
        }
    }

    #[async_trait]
    impl<F: Fn(usize) -> PingOutcome + Send + Sync> Probe for ScriptedProbe<F> {
        async fn ping(&self, _address: &str) -> Result<PingOutcome, crate::probe::ProbeError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok((self.script)(n))
        }
    }

    fn ok_outcome() -> PingOutcome {
        PingOutcome {
            latency_ms: Some(12.0),
            hops: Some(6),
            lost: false,
        }
    }

    fn setup(probe: Arc<dyn Probe>) -> (NamedTempFile, Store, Monitor, Target) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        let mut target = Target {
            ip_address: "192.0.2.77".to_string(),
            frequency_secs: 1,
            ..Default::default()
        };
        store.add_target(&mut target).unwrap();
        let monitor = Monitor::new(store.clone(), probe);
        (tmp, store, monitor, target)
    }

    fn count_events(store: &Store, target_id: i64, kind: EventKind) -> usize {
        store
            .get_events(target_id, None, None, 1000)
            .unwrap()
            .iter()
            .filter(|e| e.kind == kind)
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent() {
        let probe = Arc::new(ScriptedProbe::new(|_| ok_outcome()));
        let (_tmp, store, monitor, target) = setup(probe);

        monitor.start(&target).unwrap();
        monitor.start(&target).unwrap();

        assert_eq!(monitor.running_count(), 1);
        assert_eq!(count_events(&store, target.id, EventKind::Start), 1);

        monitor.shutdown_all();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_halts_sample_writes() {
        let probe = Arc::new(ScriptedProbe::new(|_| ok_outcome()));
        let (_tmp, store, monitor, target) = setup(probe);

        monitor.start(&target).unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;

        monitor.stop(target.id, "Tracking stopped").unwrap();
        assert!(!monitor.is_running(target.id));

        tokio::time::sleep(Duration::from_millis(50)).await;
        let written = store.recent_pings(target.id, 1000).unwrap().len();
        assert!(written >= 1);

        tokio::time::sleep(Duration::from_secs(5)).await;
        let after = store.recent_pings(target.id, 1000).unwrap().len();
        assert_eq!(written, after, "loop kept writing after stop");

        assert_eq!(count_events(&store, target.id, EventKind::Stop), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_without_loop_is_harmless() {
        let probe = Arc::new(ScriptedProbe::new(|_| ok_outcome()));
        let (_tmp, store, monitor, target) = setup(probe);

        monitor.stop(target.id, "Tracking stopped").unwrap();
        assert_eq!(monitor.running_count(), 0);
        assert_eq!(count_events(&store, target.id, EventKind::Stop), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_failure_event_at_threshold() {
        let probe = Arc::new(ScriptedProbe::new(|_| PingOutcome::unreachable()));
        let (_tmp, store, monitor, target) = setup(probe);

        monitor.start(&target).unwrap();
        // Well past the threshold: still exactly one failure event.
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(count_events(&store, target.id, EventKind::Failure), 1);
        assert_eq!(count_events(&store, target.id, EventKind::Recovery), 0);

        let samples = store.recent_pings(target.id, 1000).unwrap();
        assert!(samples.len() >= 6);
        assert!(samples.iter().all(|s| s.lost && s.latency_ms.is_none()));

        monitor.shutdown_all();
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_event_after_failure() {
        // Six losses, then healthy forever.
        let probe = Arc::new(ScriptedProbe::new(|n| {
            if n < 6 {
                PingOutcome::unreachable()
            } else {
                ok_outcome()
            }
        }));
        let (_tmp, store, monitor, target) = setup(probe);

        monitor.start(&target).unwrap();
        tokio::time::sleep(Duration::from_secs(12)).await;

        assert_eq!(count_events(&store, target.id, EventKind::Failure), 1);
        assert_eq!(count_events(&store, target.id, EventKind::Recovery), 1);

        let events = store.get_events(target.id, None, None, 1000).unwrap();
        let recovery = events.iter().find(|e| e.kind == EventKind::Recovery).unwrap();
        assert!(recovery.message.contains("recovered after 6 failed pings"));

        monitor.shutdown_all();
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_errors_become_lost_samples() {
        struct FailingProbe;

        #[async_trait]
        impl Probe for FailingProbe {
            async fn ping(&self, _: &str) -> Result<PingOutcome, crate::probe::ProbeError> {
                Err(crate::probe::ProbeError::Network("no route".to_string()))
            }
        }

        let (_tmp, store, monitor, target) = setup(Arc::new(FailingProbe));
        monitor.start(&target).unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;

        let samples = store.recent_pings(target.id, 100).unwrap();
        assert!(!samples.is_empty(), "loop died on probe error");
        assert!(samples.iter().all(|s| s.lost));

        monitor.shutdown_all();
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_existing_starts_active_only() {
        let probe = Arc::new(ScriptedProbe::new(|_| ok_outcome()));
        let (_tmp, store, monitor, target) = setup(probe);

        let mut paused = Target {
            ip_address: "192.0.2.78".to_string(),
            is_active: false,
            ..Default::default()
        };
        store.add_target(&mut paused).unwrap();

        monitor.load_existing().unwrap();
        assert!(monitor.is_running(target.id));
        assert!(!monitor.is_running(paused.id));
        assert_eq!(monitor.running_count(), 1);

        monitor.shutdown_all();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_all_writes_no_stop_events() {
        let probe = Arc::new(ScriptedProbe::new(|_| ok_outcome()));
        let (_tmp, store, monitor, target) = setup(probe);

        monitor.start(&target).unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        monitor.shutdown_all();
        assert_eq!(monitor.running_count(), 0);
        assert_eq!(count_events(&store, target.id, EventKind::Stop), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_after_stop_resets_failure_count() {
        let probe = Arc::new(ScriptedProbe::new(|_| PingOutcome::unreachable()));
        let (_tmp, store, monitor, target) = setup(probe);

        monitor.start(&target).unwrap();
        // Three losses: below the threshold, no failure event yet.
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert_eq!(monitor.failure_streak(target.id), Some(3));
        monitor.stop(target.id, "Tracking paused").unwrap();
        assert_eq!(monitor.failure_streak(target.id), None);
        assert_eq!(count_events(&store, target.id, EventKind::Failure), 0);

        // Fresh loop, fresh counter: three more losses still fire nothing.
        monitor.start(&target).unwrap();
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert_eq!(monitor.failure_streak(target.id), Some(3));
        monitor.stop(target.id, "Tracking paused").unwrap();
        assert_eq!(count_events(&store, target.id, EventKind::Failure), 0);
    }
}

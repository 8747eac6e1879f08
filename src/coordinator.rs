//! Distributed work coordination
//!
//! Hands out scalar sub-ranges to remote workers, sweeps timed-out
//! assignments back into the pending queue, and deduplicates completions
//! so the result sink fires at most once per key. Execution is therefore
//! at-least-once while publication stays at-most-once.
//!
//! Transport is out of scope: the public methods are the REGISTER / NEXT /
//! COMPLETE / HEARTBEAT verbs, callable from whatever framing the caller
//! speaks.

use crate::engine::BsgsResult;
use crate::math::U256;
use crate::range::{KeyRange, RangePartitioner};
use anyhow::{bail, Result};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// One contiguous sub-range of work. At most one worker holds an id at a
/// time.
#[derive(Clone, Debug)]
pub struct WorkUnit {
    pub id: u64,
    pub range: KeyRange,
    pub assigned_worker: Option<String>,
    pub assigned_at: Option<Instant>,
    pub completed_at: Option<Instant>,
    pub completed: bool,
    pub result: Option<BsgsResult>,
}

impl WorkUnit {
    fn new(id: u64, range: KeyRange) -> Self {
        Self {
            id,
            range,
            assigned_worker: None,
            assigned_at: None,
            completed_at: None,
            completed: false,
            result: None,
        }
    }
}

/// Bookkeeping for one registered worker.
#[derive(Clone, Debug)]
pub struct WorkerStatus {
    pub id: String,
    pub hostname: String,
    pub device_info: String,
    pub connected: bool,
    pub busy: bool,
    pub work_units_completed: u64,
    pub keys_per_second: u64,
    pub last_heartbeat: Instant,
}

impl WorkerStatus {
    pub fn time_since_heartbeat(&self) -> Duration {
        self.last_heartbeat.elapsed()
    }
}

type CoordinatorSink = Box<dyn Fn(&BsgsResult) + Send + Sync>;

struct CoordState {
    pending: VecDeque<WorkUnit>,
    in_progress: HashMap<u64, WorkUnit>,
    completed: Vec<WorkUnit>,
    workers: HashMap<String, WorkerStatus>,
    published_keys: HashSet<[u8; 32]>,
    total_units: usize,
}

/// Authoritative owner of the pending queue and the in-progress map.
pub struct WorkCoordinator {
    state: Arc<Mutex<CoordState>>,
    work_available: Arc<Condvar>,
    result_sink: Arc<Mutex<Option<CoordinatorSink>>>,
    running: Arc<AtomicBool>,
    work_timeout: Duration,
    sweeper: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl WorkCoordinator {
    pub fn new(work_timeout: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(CoordState {
                pending: VecDeque::new(),
                in_progress: HashMap::new(),
                completed: Vec::new(),
                workers: HashMap::new(),
                published_keys: HashSet::new(),
                total_units: 0,
            })),
            work_available: Arc::new(Condvar::new()),
            result_sink: Arc::new(Mutex::new(None)),
            running: Arc::new(AtomicBool::new(false)),
            work_timeout,
            sweeper: Mutex::new(None),
        }
    }

    /// Partition the range into work units of `unit_size` scalars.
    pub fn initialize(&self, range: &KeyRange, unit_size: &U256) -> Result<()> {
        if unit_size.is_zero() {
            bail!("work unit size must be at least 1");
        }
        let parts = RangePartitioner::split_by_size(range, unit_size);
        let mut state = self.state.lock().expect("coordinator state poisoned");
        if state.total_units != 0 {
            bail!("coordinator already initialized");
        }
        state.pending = parts
            .into_iter()
            .enumerate()
            .map(|(i, r)| WorkUnit::new(i as u64 + 1, r))
            .collect();
        state.total_units = state.pending.len();
        info!(
            "coordinator initialized: {} work units over {range}",
            state.total_units
        );
        self.work_available.notify_all();
        Ok(())
    }

    /// Start the timeout sweeper; 1 Hz is plenty.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        let state = Arc::clone(&self.state);
        let running = Arc::clone(&self.running);
        let work_available = Arc::clone(&self.work_available);
        let timeout = self.work_timeout;

        let handle = std::thread::Builder::new()
            .name("bsgs-coordinator-sweeper".into())
            .spawn(move || {
                while running.load(Ordering::Acquire) {
                    std::thread::sleep(Duration::from_secs(1));
                    let mut state = state.lock().expect("coordinator state poisoned");
                    let expired: Vec<u64> = state
                        .in_progress
                        .values()
                        .filter(|unit| {
                            unit.assigned_at
                                .map(|t| t.elapsed() > timeout)
                                .unwrap_or(false)
                        })
                        .map(|unit| unit.id)
                        .collect();
                    for id in expired {
                        if let Some(mut unit) = state.in_progress.remove(&id) {
                            warn!(
                                "work unit {id} timed out on worker {:?}, requeueing",
                                unit.assigned_worker
                            );
                            unit.assigned_worker = None;
                            unit.assigned_at = None;
                            state.pending.push_back(unit);
                            work_available.notify_one();
                        }
                    }
                }
            })
            .expect("failed to spawn sweeper thread");
        *self.sweeper.lock().expect("sweeper handle poisoned") = Some(handle);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.sweeper.lock().expect("sweeper handle poisoned").take() {
            let _ = handle.join();
        }
    }

    pub fn on_result<F>(&self, sink: F)
    where
        F: Fn(&BsgsResult) + Send + Sync + 'static,
    {
        *self.result_sink.lock().expect("sink poisoned") = Some(Box::new(sink));
    }

    /// REGISTER verb. Idempotent; re-registration refreshes the heartbeat.
    pub fn register_worker(&self, worker_id: &str, hostname: &str, device_info: &str) {
        let mut state = self.state.lock().expect("coordinator state poisoned");
        let entry = state
            .workers
            .entry(worker_id.to_string())
            .or_insert_with(|| WorkerStatus {
                id: worker_id.to_string(),
                hostname: hostname.to_string(),
                device_info: device_info.to_string(),
                connected: true,
                busy: false,
                work_units_completed: 0,
                keys_per_second: 0,
                last_heartbeat: Instant::now(),
            });
        entry.hostname = hostname.to_string();
        entry.device_info = device_info.to_string();
        entry.connected = true;
        entry.last_heartbeat = Instant::now();
        debug!("worker {worker_id} registered from {hostname} ({device_info})");
    }

    pub fn unregister_worker(&self, worker_id: &str) {
        let mut state = self.state.lock().expect("coordinator state poisoned");
        if let Some(worker) = state.workers.get_mut(worker_id) {
            worker.connected = false;
            worker.busy = false;
        }
    }

    /// NEXT verb. Pops the pending head; None when the queue is empty. The
    /// worker id is only used for accounting.
    pub fn get_next_work(&self, worker_id: &str) -> Option<WorkUnit> {
        let mut state = self.state.lock().expect("coordinator state poisoned");
        let mut unit = state.pending.pop_front()?;
        unit.assigned_worker = Some(worker_id.to_string());
        unit.assigned_at = Some(Instant::now());
        state.in_progress.insert(unit.id, unit.clone());
        if let Some(worker) = state.workers.get_mut(worker_id) {
            worker.busy = true;
            worker.last_heartbeat = Instant::now();
        }
        debug!("work unit {} assigned to {worker_id}", unit.id);
        Some(unit)
    }

    /// COMPLETE verb. Unknown ids are stale reassignment echoes and are
    /// ignored; duplicate results are deduplicated by key value.
    pub fn report_completion(&self, work_id: u64, result: Option<BsgsResult>) {
        let mut state = self.state.lock().expect("coordinator state poisoned");

        // the unit may have been swept back to pending before the original
        // worker finished; its completion is still valid work
        let unit = state.in_progress.remove(&work_id).or_else(|| {
            let idx = state.pending.iter().position(|u| u.id == work_id)?;
            state.pending.remove(idx)
        });
        let Some(mut unit) = unit else {
            debug!("ignoring completion of unknown work unit {work_id}");
            return;
        };

        if let Some(worker_id) = unit.assigned_worker.clone() {
            if let Some(worker) = state.workers.get_mut(&worker_id) {
                worker.busy = false;
                worker.work_units_completed += 1;
            }
        }

        unit.completed = true;
        unit.completed_at = Some(Instant::now());
        unit.result = result.clone();
        state.completed.push(unit);

        if let Some(result) = result {
            let key = *result.private_key.as_be_bytes();
            if state.published_keys.insert(key) {
                info!(
                    "coordinator publishing key for unit {work_id}: 0x{}",
                    result.private_key.to_hex()
                );
                // keep holding the state lock: publication order is the
                // lock-acquisition order, and the dedupe set must cover
                // concurrent completions of the same key
                if let Some(sink) = self.result_sink.lock().expect("sink poisoned").as_ref() {
                    sink(&result);
                }
            }
        }
    }

    /// HEARTBEAT verb.
    pub fn heartbeat(&self, worker_id: &str, keys_per_second: u64) {
        let mut state = self.state.lock().expect("coordinator state poisoned");
        if let Some(worker) = state.workers.get_mut(worker_id) {
            worker.keys_per_second = keys_per_second;
            worker.last_heartbeat = Instant::now();
        }
    }

    /// Completed fraction in [0, 1].
    pub fn get_progress(&self) -> f64 {
        let state = self.state.lock().expect("coordinator state poisoned");
        if state.total_units == 0 {
            return 0.0;
        }
        state.completed.len() as f64 / state.total_units as f64
    }

    pub fn get_results(&self) -> Vec<BsgsResult> {
        let state = self.state.lock().expect("coordinator state poisoned");
        state
            .completed
            .iter()
            .filter_map(|unit| unit.result.clone())
            .collect()
    }

    pub fn get_workers(&self) -> Vec<WorkerStatus> {
        let state = self.state.lock().expect("coordinator state poisoned");
        state.workers.values().cloned().collect()
    }

    pub fn get_total_kps(&self) -> u64 {
        let state = self.state.lock().expect("coordinator state poisoned");
        state
            .workers
            .values()
            .filter(|w| w.connected)
            .map(|w| w.keys_per_second)
            .sum()
    }

    pub fn pending_count(&self) -> usize {
        self.state
            .lock()
            .expect("coordinator state poisoned")
            .pending
            .len()
    }

    pub fn in_progress_count(&self) -> usize {
        self.state
            .lock()
            .expect("coordinator state poisoned")
            .in_progress
            .len()
    }

    pub fn completed_count(&self) -> usize {
        self.state
            .lock()
            .expect("coordinator state poisoned")
            .completed
            .len()
    }

    /// The partition-cover invariant: pending, in-progress, and completed
    /// must always account for every unit of the original split.
    pub fn accounted_units(&self) -> usize {
        let state = self.state.lock().expect("coordinator state poisoned");
        state.pending.len() + state.in_progress.len() + state.completed.len()
    }

    pub fn total_units(&self) -> usize {
        self.state
            .lock()
            .expect("coordinator state poisoned")
            .total_units
    }
}

impl Drop for WorkCoordinator {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secret::SecretKey;
    use crate::targets::Target;
    use std::sync::atomic::AtomicUsize;

    fn test_range() -> KeyRange {
        KeyRange::new(U256::from_u64(1), U256::from_u64(1000)).unwrap()
    }

    fn fake_result(key: u64) -> BsgsResult {
        BsgsResult {
            private_key: SecretKey::from_u256(&U256::from_u64(key)),
            target: Target::Hash160([7u8; 20]),
            target_hash: [7u8; 20],
            found_at_ms: 0,
        }
    }

    #[test]
    fn partition_cover_invariant_holds() {
        let coord = WorkCoordinator::new(Duration::from_secs(300));
        coord.initialize(&test_range(), &U256::from_u64(100)).unwrap();
        coord.register_worker("w1", "host-a", "cpu");
        assert_eq!(coord.total_units(), 10);
        assert_eq!(coord.accounted_units(), 10);

        let a = coord.get_next_work("w1").unwrap();
        let b = coord.get_next_work("w1").unwrap();
        assert_eq!(coord.accounted_units(), 10);

        coord.report_completion(a.id, None);
        assert_eq!(coord.accounted_units(), 10);
        coord.report_completion(b.id, Some(fake_result(42)));
        assert_eq!(coord.accounted_units(), 10);
        assert_eq!(coord.completed_count(), 2);
        assert_eq!(coord.pending_count(), 8);
    }

    #[test]
    fn work_units_are_disjoint_and_cover_range() {
        let coord = WorkCoordinator::new(Duration::from_secs(300));
        coord.initialize(&test_range(), &U256::from_u64(64)).unwrap();
        coord.register_worker("w1", "h", "d");

        let mut units = Vec::new();
        while let Some(unit) = coord.get_next_work("w1") {
            units.push(unit);
        }
        units.sort_by(|a, b| a.range.start.cmp(&b.range.start));
        assert_eq!(units.first().unwrap().range.start, U256::from_u64(1));
        assert_eq!(units.last().unwrap().range.end, U256::from_u64(1000));
        for pair in units.windows(2) {
            assert_eq!(
                pair[0].range.end.wrapping_add(&U256::ONE),
                pair[1].range.start
            );
        }
    }

    #[test]
    fn unknown_completion_is_ignored() {
        let coord = WorkCoordinator::new(Duration::from_secs(300));
        coord.initialize(&test_range(), &U256::from_u64(100)).unwrap();
        coord.report_completion(9999, Some(fake_result(1)));
        assert_eq!(coord.completed_count(), 0);
        assert!(coord.get_results().is_empty());
    }

    #[test]
    fn duplicate_keys_publish_once() {
        let coord = WorkCoordinator::new(Duration::from_secs(300));
        coord.initialize(&test_range(), &U256::from_u64(100)).unwrap();
        coord.register_worker("w1", "h", "d");

        let published = Arc::new(AtomicUsize::new(0));
        {
            let published = Arc::clone(&published);
            coord.on_result(move |_| {
                published.fetch_add(1, Ordering::Relaxed);
            });
        }

        let a = coord.get_next_work("w1").unwrap();
        let b = coord.get_next_work("w1").unwrap();
        coord.report_completion(a.id, Some(fake_result(42)));
        coord.report_completion(b.id, Some(fake_result(42)));
        assert_eq!(published.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn at_most_once_under_concurrent_completions() {
        let coord = Arc::new(WorkCoordinator::new(Duration::from_secs(300)));
        coord
            .initialize(&test_range(), &U256::from_u64(10))
            .unwrap();
        coord.register_worker("w1", "h", "d");

        let published = Arc::new(AtomicUsize::new(0));
        {
            let published = Arc::clone(&published);
            coord.on_result(move |_| {
                published.fetch_add(1, Ordering::Relaxed);
            });
        }

        let units: Vec<WorkUnit> = (0..8).filter_map(|_| coord.get_next_work("w1")).collect();
        let mut handles = Vec::new();
        for unit in units {
            let coord = Arc::clone(&coord);
            handles.push(std::thread::spawn(move || {
                coord.report_completion(unit.id, Some(fake_result(1234)));
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(published.load(Ordering::Relaxed), 1);
        assert_eq!(coord.completed_count(), 8);
    }

    #[test]
    fn timed_out_units_are_requeued() {
        let coord = WorkCoordinator::new(Duration::from_millis(10));
        coord.initialize(&test_range(), &U256::from_u64(500)).unwrap();
        coord.register_worker("w1", "h", "d");
        coord.start();

        let unit = coord.get_next_work("w1").unwrap();
        assert_eq!(coord.in_progress_count(), 1);

        // sweeper runs at 1 Hz; give it two ticks
        std::thread::sleep(Duration::from_millis(2500));
        assert_eq!(coord.in_progress_count(), 0);
        assert_eq!(coord.pending_count(), 2);
        assert_eq!(coord.accounted_units(), coord.total_units());

        // the unit can be handed out again
        let again = coord.get_next_work("w1").unwrap();
        assert_eq!(again.id, unit.id);
        coord.stop();
    }

    #[test]
    fn stale_completion_after_requeue_still_counts_once() {
        let coord = WorkCoordinator::new(Duration::from_millis(10));
        coord.initialize(&test_range(), &U256::from_u64(500)).unwrap();
        coord.register_worker("w1", "h", "d");
        coord.start();

        let unit = coord.get_next_work("w1").unwrap();
        std::thread::sleep(Duration::from_millis(2500));
        // unit is back in pending; the slow worker reports anyway
        coord.report_completion(unit.id, Some(fake_result(7)));
        assert_eq!(coord.completed_count(), 1);
        assert_eq!(coord.accounted_units(), coord.total_units());
        // a later echo of the same id is stale and ignored
        coord.report_completion(unit.id, Some(fake_result(7)));
        assert_eq!(coord.completed_count(), 1);
        coord.stop();
    }

    #[test]
    fn heartbeat_updates_worker_stats() {
        let coord = WorkCoordinator::new(Duration::from_secs(300));
        coord.initialize(&test_range(), &U256::from_u64(100)).unwrap();
        coord.register_worker("w1", "host-a", "gpu0");
        coord.register_worker("w2", "host-b", "cpu");
        coord.heartbeat("w1", 5_000_000);
        coord.heartbeat("w2", 1_000_000);
        assert_eq!(coord.get_total_kps(), 6_000_000);

        coord.unregister_worker("w2");
        assert_eq!(coord.get_total_kps(), 5_000_000);
    }
}

//! BSGS search engine
//!
//! Orchestrates the baby-step table build, the giant-step sweep across a
//! scalar range, candidate verification, result publication, progress
//! accounting, and checkpointing. Pure-hash targets fall back to an
//! exhaustive scan guarded by a bloom filter of the target hashes, since
//! baby-step/giant-step needs the public key itself.
//!
//! All state lives in the engine value; tests construct a fresh engine and
//! nothing is process-global.

use crate::backend::{CpuBackend, StepperBackend};
use crate::bloom::{fnv1a64, BloomFilter};
use crate::checkpoint::{CheckpointData, CheckpointProgress, CheckpointResult};
use crate::math::{AffinePoint, JacobianPoint, U256, BETA, LAMBDA, N};
use crate::pool::{TaskPriority, ThreadPool};
use crate::range::KeyRange;
use crate::secret::SecretKey;
use crate::table::{BabyStepTable, BloomConfig};
use crate::targets::{Compression, Target};
use anyhow::{anyhow, bail, Context, Result};
use clap::ValueEnum;
use dashmap::DashMap;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Giant-step sweep order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Default)]
pub enum SearchMode {
    /// Giant steps from the low end upward.
    #[default]
    Sequential,
    /// Giant steps from the high end downward.
    Backward,
    /// Two cursors from opposite ends, meeting in the middle.
    Bothways,
    /// Chunks visited in a seeded pseudo-random order.
    Random,
    /// Direction chosen pseudo-randomly per chunk.
    Dance,
}

impl SearchMode {
    pub(crate) fn tag(self) -> u8 {
        match self {
            SearchMode::Sequential => 0,
            SearchMode::Backward => 1,
            SearchMode::Bothways => 2,
            SearchMode::Random => 3,
            SearchMode::Dance => 4,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Result<Self> {
        Ok(match tag {
            0 => SearchMode::Sequential,
            1 => SearchMode::Backward,
            2 => SearchMode::Bothways,
            3 => SearchMode::Random,
            4 => SearchMode::Dance,
            t => bail!("unknown search mode tag {t}"),
        })
    }
}

impl std::fmt::Display for SearchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SearchMode::Sequential => "sequential",
            SearchMode::Backward => "backward",
            SearchMode::Bothways => "bothways",
            SearchMode::Random => "random",
            SearchMode::Dance => "dance",
        };
        f.write_str(name)
    }
}

/// Search parameters. `m: None` derives ceil(sqrt(N/K)); an explicit m is
/// never silently altered.
#[derive(Clone, Debug)]
pub struct BsgsParams {
    pub range: KeyRange,
    pub m: Option<u64>,
    pub k_factor: u32,
    pub mode: SearchMode,
    pub compression: Compression,
    pub num_threads: usize,
    pub bloom: BloomConfig,
    pub max_memory_bytes: u64,
    pub endomorphism: bool,
    pub rng_seed: u64,
    pub checkpoint_path: Option<PathBuf>,
    pub checkpoint_interval: Duration,
    pub table_path: Option<PathBuf>,
}

impl BsgsParams {
    pub fn new(range: KeyRange) -> Self {
        Self {
            range,
            m: None,
            k_factor: 1,
            mode: SearchMode::Sequential,
            compression: Compression::Compressed,
            num_threads: 0,
            bloom: BloomConfig::default(),
            max_memory_bytes: 0,
            endomorphism: false,
            rng_seed: 0x5DEECE66D,
            checkpoint_path: None,
            checkpoint_interval: Duration::from_secs(300),
            table_path: None,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.k_factor == 0 {
            bail!("K factor must be at least 1");
        }
        if self.bloom.bits_per_item == 0 || self.bloom.bits_per_item > 64 {
            bail!(
                "bloom bits per item must be in 1..=64, got {}",
                self.bloom.bits_per_item
            );
        }
        if let Some(m) = self.m {
            if m == 0 {
                bail!("m must be at least 1");
            }
        }
        if self.range.end >= crate::math::N {
            bail!("range end exceeds the curve group order");
        }
        Ok(())
    }
}

/// A recovered key, as delivered to the result sink.
#[derive(Clone, Debug)]
pub struct BsgsResult {
    pub private_key: SecretKey,
    pub target: Target,
    pub target_hash: [u8; 20],
    pub found_at_ms: u64,
}

/// Progress snapshot. Counters are sampled individually with relaxed
/// ordering; the struct as a whole is an approximation.
#[derive(Clone, Debug)]
pub struct BsgsProgress {
    pub keys_checked: u64,
    pub keys_per_second: u64,
    pub progress_percent: f64,
    pub elapsed: Duration,
    pub current_position: U256,
    pub results_found: usize,
    pub warning: Option<String>,
}

impl BsgsProgress {
    pub fn format_speed(&self) -> String {
        let kps = self.keys_per_second;
        if kps >= 1_000_000_000_000 {
            format!("{} Tkeys/s", kps / 1_000_000_000_000)
        } else if kps >= 1_000_000_000 {
            format!("{} Gkeys/s", kps / 1_000_000_000)
        } else if kps >= 1_000_000 {
            format!("{} Mkeys/s", kps / 1_000_000)
        } else if kps >= 1_000 {
            format!("{} Kkeys/s", kps / 1_000)
        } else {
            format!("{kps} keys/s")
        }
    }

    pub fn format_elapsed(&self) -> String {
        let secs = self.elapsed.as_secs();
        format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}

pub type ResultSink = Box<dyn Fn(&BsgsResult) + Send + Sync>;
pub type ProgressSink = Box<dyn Fn(&BsgsProgress) + Send + Sync>;

/// Claim slot inside one sweep direction.
enum Slot {
    Fwd(u64),
    Bwd(u64),
}

struct DirCursor {
    next: u64,
    frontier: u64,
    done: BTreeSet<u64>,
}

impl DirCursor {
    fn new(start_at: u64) -> Self {
        Self {
            next: start_at,
            frontier: start_at,
            done: BTreeSet::new(),
        }
    }

    /// Mark a position complete; return how far the contiguous frontier
    /// moved.
    fn complete(&mut self, pos: u64) -> std::ops::Range<u64> {
        let from = self.frontier;
        self.done.insert(pos);
        while self.done.remove(&self.frontier) {
            self.frontier += 1;
        }
        from..self.frontier
    }
}

/// Chunk scheduler; claim cursors run ahead, completion frontiers trail
/// and are what checkpoints persist, so an interrupted in-flight chunk is
/// re-executed rather than skipped.
struct Scheduler {
    mode: SearchMode,
    total_chunks: u64,
    fwd: DirCursor,
    bwd: DirCursor,
    order: Option<Vec<u64>>,
    rng: StdRng,
}

impl Scheduler {
    fn new(
        mode: SearchMode,
        total_chunks: u64,
        seed: u64,
        resume_fwd: u64,
        resume_bwd: u64,
    ) -> Self {
        let order = match mode {
            SearchMode::Random => {
                let mut order: Vec<u64> = (0..total_chunks).collect();
                order.shuffle(&mut StdRng::seed_from_u64(seed));
                Some(order)
            }
            _ => None,
        };
        Self {
            mode,
            total_chunks,
            fwd: DirCursor::new(resume_fwd),
            bwd: DirCursor::new(resume_bwd),
            order,
            rng: StdRng::seed_from_u64(seed ^ 0xD1CE),
        }
    }

    fn exhausted(&self) -> bool {
        self.fwd.next + self.bwd.next >= self.total_chunks
    }

    /// Claim the next chunk id, or None when the sweep is fully claimed.
    fn claim(&mut self) -> Option<(u64, Slot)> {
        if self.exhausted() {
            return None;
        }
        let use_bwd = match self.mode {
            SearchMode::Sequential | SearchMode::Random => false,
            SearchMode::Backward => true,
            SearchMode::Bothways => (self.fwd.next + self.bwd.next) % 2 == 1,
            SearchMode::Dance => self.rng.gen_bool(0.5),
        };

        if use_bwd {
            let pos = self.bwd.next;
            self.bwd.next += 1;
            Some((self.total_chunks - 1 - pos, Slot::Bwd(pos)))
        } else {
            let pos = self.fwd.next;
            self.fwd.next += 1;
            let chunk = match &self.order {
                Some(order) => order[pos as usize],
                None => pos,
            };
            Some((chunk, Slot::Fwd(pos)))
        }
    }

    /// Mark a slot complete; returns the chunk ids newly passed by the
    /// completion frontier.
    fn complete(&mut self, slot: Slot) -> Vec<u64> {
        match slot {
            Slot::Fwd(pos) => {
                let advanced = self.fwd.complete(pos);
                advanced
                    .map(|p| match &self.order {
                        Some(order) => order[p as usize],
                        None => p,
                    })
                    .collect()
            }
            Slot::Bwd(pos) => {
                let advanced = self.bwd.complete(pos);
                advanced.map(|p| self.total_chunks - 1 - p).collect()
            }
        }
    }
}

/// What a sweep chunk iterates over.
enum PlanKind {
    Bsgs {
        table: Arc<BabyStepTable>,
        targets: Vec<(Target, JacobianPoint)>,
        /// scalars advanced per giant step: m, or 2m+1 with endomorphism
        stride: u64,
        /// -stride*G, the per-step increment
        neg_giant: AffinePoint,
        /// scalar at giant step 0: lo, or lo+m with endomorphism
        base_scalar: U256,
        endomorphism: bool,
        lambda_sqr: U256,
        m: u64,
    },
    Scan {
        filter: BloomFilter,
        hashes: HashSet<[u8; 20]>,
        targets: Vec<Target>,
        step: AffinePoint,
    },
}

struct SearchPlan {
    kind: PlanKind,
    compression: Compression,
    range: KeyRange,
    /// giant steps (or keys) per chunk
    chunk_units: u64,
    total_chunks: u64,
    /// scalars covered per full chunk
    span: u128,
    n_clamped: u128,
    target_count: usize,
}

impl SearchPlan {
    /// Scalars covered by one specific chunk (the top chunk may be short).
    fn chunk_coverage(&self, chunk: u64) -> u64 {
        let lo = chunk as u128 * self.span;
        let hi = ((chunk + 1) as u128 * self.span).min(self.n_clamped);
        hi.saturating_sub(lo).min(u64::MAX as u128) as u64
    }

    /// Closed-form coverage of the two contiguous frontiers plus the
    /// random-order prefix.
    fn coverage_at(&self, fwd_chunks: u64, bwd_chunks: u64, order: Option<&[u64]>) -> u64 {
        let fwd = match order {
            Some(order) => order
                .iter()
                .take(fwd_chunks as usize)
                .map(|&c| self.chunk_coverage(c) as u128)
                .sum::<u128>(),
            None => (fwd_chunks as u128 * self.span).min(self.n_clamped),
        };
        let bwd = if bwd_chunks == 0 {
            0
        } else {
            let from = (self.total_chunks - bwd_chunks) as u128 * self.span;
            self.n_clamped.saturating_sub(from)
        };
        (fwd + bwd).min(u64::MAX as u128) as u64
    }
}

struct Shared {
    stop: AtomicBool,
    paused: AtomicBool,
    running: AtomicBool,
    pause_lock: Mutex<()>,
    pause_cv: Condvar,
    done: Mutex<bool>,
    done_cv: Condvar,
    keys_checked: AtomicU64,
    elapsed_base_ms: AtomicU64,
    started_at: Mutex<Option<Instant>>,
    sched: Mutex<Option<Scheduler>>,
    results: Mutex<Vec<BsgsResult>>,
    dedupe: DashMap<[u8; 32], ()>,
    found_targets: DashMap<[u8; 20], ()>,
    result_sink: Mutex<Option<ResultSink>>,
    progress_sink: Mutex<Option<ProgressSink>>,
    last_progress: Mutex<Instant>,
    checkpoint_disabled: AtomicBool,
    active_workers: AtomicUsize,
}

impl Shared {
    fn new() -> Self {
        Self {
            stop: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            running: AtomicBool::new(false),
            pause_lock: Mutex::new(()),
            pause_cv: Condvar::new(),
            done: Mutex::new(true),
            done_cv: Condvar::new(),
            keys_checked: AtomicU64::new(0),
            elapsed_base_ms: AtomicU64::new(0),
            started_at: Mutex::new(None),
            sched: Mutex::new(None),
            results: Mutex::new(Vec::new()),
            dedupe: DashMap::new(),
            found_targets: DashMap::new(),
            result_sink: Mutex::new(None),
            progress_sink: Mutex::new(None),
            last_progress: Mutex::new(Instant::now()),
            checkpoint_disabled: AtomicBool::new(false),
            active_workers: AtomicUsize::new(0),
        }
    }

    fn elapsed_ms(&self) -> u64 {
        let base = self.elapsed_base_ms.load(Ordering::Relaxed);
        let live = self
            .started_at
            .lock()
            .expect("started_at poisoned")
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0);
        base + live
    }
}

/// The search engine. Owns its table, pool, and counters for the lifetime
/// of a search.
pub struct BsgsEngine {
    params: BsgsParams,
    targets: Vec<Target>,
    backend: Arc<dyn StepperBackend>,
    shared: Arc<Shared>,
    pool: Option<Arc<ThreadPool>>,
    plan: Option<Arc<SearchPlan>>,
    checkpoint_thread: Option<std::thread::JoinHandle<()>>,
    restored: Option<CheckpointProgress>,
}

impl BsgsEngine {
    pub fn new(params: BsgsParams) -> Self {
        Self::with_backend(params, Arc::new(CpuBackend::new()))
    }

    pub fn with_backend(params: BsgsParams, backend: Arc<dyn StepperBackend>) -> Self {
        Self {
            params,
            targets: Vec::new(),
            backend,
            shared: Arc::new(Shared::new()),
            pool: None,
            plan: None,
            checkpoint_thread: None,
            restored: None,
        }
    }

    /// Set the search targets. All targets must be of one kind: public
    /// keys drive the BSGS walk, hash160s the exhaustive scan.
    pub fn initialize(&mut self, targets: Vec<Target>) -> Result<()> {
        if targets.is_empty() {
            bail!("no targets given");
        }
        let pubkeys = targets.iter().filter(|t| t.is_pubkey()).count();
        if pubkeys != 0 && pubkeys != targets.len() {
            bail!(
                "mixed target kinds: {pubkeys} public keys and {} hashes; \
                 run them as separate searches",
                targets.len() - pubkeys
            );
        }
        self.targets = targets;
        Ok(())
    }

    pub fn set_params(&mut self, params: BsgsParams) -> Result<()> {
        params.validate()?;
        self.params = params;
        Ok(())
    }

    pub fn params(&self) -> &BsgsParams {
        &self.params
    }

    pub fn set_result_sink<F>(&self, sink: F)
    where
        F: Fn(&BsgsResult) + Send + Sync + 'static,
    {
        *self.shared.result_sink.lock().expect("sink poisoned") = Some(Box::new(sink));
    }

    pub fn set_progress_sink<F>(&self, sink: F)
    where
        F: Fn(&BsgsProgress) + Send + Sync + 'static,
    {
        *self.shared.progress_sink.lock().expect("sink poisoned") = Some(Box::new(sink));
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Request shutdown; workers exit at the next chunk boundary.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.pause_cv.notify_all();
    }

    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.shared.paused.store(false, Ordering::Release);
        self.shared.pause_cv.notify_all();
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::Acquire)
    }

    pub fn get_results(&self) -> Vec<BsgsResult> {
        self.shared.results.lock().expect("results poisoned").clone()
    }

    pub fn get_progress(&self) -> BsgsProgress {
        self.build_progress(None)
    }

    /// Total giant steps (or scan keys) the current plan sweeps; None
    /// before `start()`.
    pub fn planned_giant_steps(&self) -> Option<u64> {
        self.plan.as_ref().map(|p| total_steps_of(p))
    }

    /// Re-enable checkpoints after an I/O failure disabled them.
    pub fn enable_checkpoints(&self) {
        self.shared
            .checkpoint_disabled
            .store(false, Ordering::Release);
    }

    /// Start the search; returns once the table is built and workers are
    /// dispatched.
    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            bail!("engine already running");
        }
        self.params.validate()?;
        if self.targets.is_empty() {
            bail!("initialize() must be called with targets before start()");
        }

        let pool = Arc::new(ThreadPool::new(self.params.num_threads));
        let plan = Arc::new(self.build_plan(&pool)?);

        let restored = self.restored.take();
        let (resume_fwd_chunks, resume_bwd_chunks) = match &restored {
            Some(progress) => {
                let fwd = progress.next_giant_step / plan.chunk_units;
                let bwd = progress.next_giant_step_back / plan.chunk_units;
                (fwd.min(plan.total_chunks), bwd.min(plan.total_chunks))
            }
            None => (0, 0),
        };

        let scheduler = Scheduler::new(
            self.params.mode,
            plan.total_chunks,
            self.params.rng_seed,
            resume_fwd_chunks,
            resume_bwd_chunks,
        );

        // derive the counter from the frontiers so an interrupted run
        // resumes with exactly the coverage an uninterrupted run would have
        let initial_keys = plan.coverage_at(
            resume_fwd_chunks,
            resume_bwd_chunks,
            scheduler.order.as_deref(),
        );
        self.shared.keys_checked.store(initial_keys, Ordering::Relaxed);
        if let Some(progress) = &restored {
            self.shared
                .elapsed_base_ms
                .store(progress.elapsed_ms, Ordering::Relaxed);
        }

        *self.shared.sched.lock().expect("scheduler poisoned") = Some(scheduler);
        *self.shared.started_at.lock().expect("started_at poisoned") = Some(Instant::now());
        self.shared.stop.store(false, Ordering::Release);
        self.shared.running.store(true, Ordering::Release);
        *self.shared.done.lock().expect("done poisoned") = false;

        let workers = pool.size();
        self.shared.active_workers.store(workers, Ordering::Release);
        info!(
            "starting search: backend={}, workers={workers}, chunks={}, mode={:?}",
            self.backend.name(),
            plan.total_chunks,
            self.params.mode
        );

        for _ in 0..workers {
            let shared = Arc::clone(&self.shared);
            let plan = Arc::clone(&plan);
            let backend = Arc::clone(&self.backend);
            pool.submit(TaskPriority::Normal, move || {
                worker_loop(&shared, &plan, backend.as_ref());
            });
        }

        if let Some(path) = self.params.checkpoint_path.clone() {
            if !self.params.checkpoint_interval.is_zero() {
                self.checkpoint_thread = Some(self.spawn_checkpoint_writer(path, &plan));
            }
        }

        self.pool = Some(pool);
        self.plan = Some(plan);
        Ok(())
    }

    /// Block until the sweep finishes or `stop()` takes effect.
    pub fn wait(&mut self) {
        {
            let mut done = self.shared.done.lock().expect("done poisoned");
            while !*done {
                done = self.shared.done_cv.wait(done).expect("done poisoned");
            }
        }
        if let Some(handle) = self.checkpoint_thread.take() {
            let _ = handle.join();
        }
    }

    /// Blocking convenience: start, wait, return the results found.
    pub fn run(&mut self) -> Result<Vec<BsgsResult>> {
        self.start()?;
        self.wait();
        Ok(self.get_results())
    }

    /// Snapshot the current state to a checkpoint file.
    pub fn save_checkpoint(&self, path: &Path) -> Result<()> {
        let plan = self
            .plan
            .as_ref()
            .ok_or_else(|| anyhow!("nothing to checkpoint: engine has not started"))?;
        let data = self.snapshot(plan);
        match data.save(path) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.shared
                    .checkpoint_disabled
                    .store(true, Ordering::Release);
                warn!("checkpoint write failed, further attempts disabled: {e:#}");
                Err(e)
            }
        }
    }

    /// Restore parameters, targets, cursors, and results from a
    /// checkpoint. Must be called before `start()`.
    pub fn load_checkpoint(&mut self, path: &Path) -> Result<()> {
        if self.is_running() {
            bail!("cannot load a checkpoint into a running engine");
        }
        let data = CheckpointData::load(path)?;

        self.params.range = data.range;
        self.params.m = Some(data.m);
        self.params.k_factor = data.k_factor;
        self.params.mode = data.mode;
        self.params.compression = data.compression;
        self.params.rng_seed = data.progress.rng_seed;
        self.targets = data.targets;

        for result in &data.results {
            self.shared.dedupe.insert(result.private_key, ());
            self.shared.found_targets.insert(result.target_hash, ());
            let restored = BsgsResult {
                private_key: SecretKey::from_be_bytes(result.private_key),
                target: Target::Hash160(result.target_hash),
                target_hash: result.target_hash,
                found_at_ms: result.found_at_ms,
            };
            self.shared
                .results
                .lock()
                .expect("results poisoned")
                .push(restored);
        }

        self.restored = Some(data.progress);
        info!(
            "checkpoint loaded: range {}, m={}, {} results",
            self.params.range, data.m, data.results.len()
        );
        Ok(())
    }

    fn snapshot(&self, plan: &SearchPlan) -> CheckpointData {
        let (fwd_chunks, bwd_chunks) = {
            let sched = self.shared.sched.lock().expect("scheduler poisoned");
            match sched.as_ref() {
                Some(s) => (s.fwd.frontier, s.bwd.frontier),
                None => (0, 0),
            }
        };

        let (m, k_factor) = match &plan.kind {
            PlanKind::Bsgs { m, .. } => (*m, self.params.k_factor),
            PlanKind::Scan { .. } => (0, self.params.k_factor),
        };

        let results = self
            .shared
            .results
            .lock()
            .expect("results poisoned")
            .iter()
            .map(|r| CheckpointResult {
                private_key: *r.private_key.as_be_bytes(),
                target_hash: r.target_hash,
                found_at_ms: r.found_at_ms,
            })
            .collect();

        CheckpointData {
            mode: self.params.mode,
            compression: self.params.compression,
            m,
            k_factor,
            range: self.params.range,
            targets: self.targets.clone(),
            progress: CheckpointProgress {
                next_giant_step: fwd_chunks * plan.chunk_units,
                next_giant_step_back: bwd_chunks * plan.chunk_units,
                rng_seed: self.params.rng_seed,
                keys_checked: self.shared.keys_checked.load(Ordering::Relaxed),
                elapsed_ms: self.shared.elapsed_ms(),
            },
            results,
        }
    }

    fn spawn_checkpoint_writer(
        &self,
        path: PathBuf,
        plan: &Arc<SearchPlan>,
    ) -> std::thread::JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        let plan = Arc::clone(plan);
        let params = self.params.clone();
        let targets = self.targets.clone();
        let interval = self.params.checkpoint_interval;

        std::thread::Builder::new()
            .name("bsgs-checkpoint".into())
            .spawn(move || {
                let mut last_write = Instant::now();
                loop {
                    std::thread::sleep(Duration::from_millis(200));
                    if !shared.running.load(Ordering::Acquire) {
                        break;
                    }
                    if last_write.elapsed() < interval
                        || shared.checkpoint_disabled.load(Ordering::Acquire)
                    {
                        continue;
                    }
                    last_write = Instant::now();
                    let data = snapshot_standalone(&shared, &plan, &params, &targets);
                    if let Err(e) = data.save(&path) {
                        shared.checkpoint_disabled.store(true, Ordering::Release);
                        warn!("periodic checkpoint failed, disabled until re-enabled: {e:#}");
                    } else {
                        debug!("checkpoint written to {}", path.display());
                    }
                }
            })
            .expect("failed to spawn checkpoint thread")
    }

    fn build_progress(&self, warning: Option<String>) -> BsgsProgress {
        let keys = self.shared.keys_checked.load(Ordering::Relaxed);
        let elapsed_ms = self.shared.elapsed_ms();
        let elapsed = Duration::from_millis(elapsed_ms);
        let kps = if elapsed_ms == 0 {
            0
        } else {
            keys.saturating_mul(1000) / elapsed_ms
        };

        let (percent, position) = match &self.plan {
            Some(plan) => {
                let total = plan.n_clamped.max(1) as f64;
                let fwd = {
                    let sched = self.shared.sched.lock().expect("scheduler poisoned");
                    sched.as_ref().map(|s| s.fwd.frontier).unwrap_or(0)
                };
                let position = self
                    .params
                    .range
                    .start
                    .wrapping_add(&U256::from_u128(fwd as u128 * plan.span));
                ((keys as f64 / total * 100.0).min(100.0), position)
            }
            None => (0.0, self.params.range.start),
        };

        BsgsProgress {
            keys_checked: keys,
            keys_per_second: kps,
            progress_percent: percent,
            elapsed,
            current_position: position,
            results_found: self.shared.results.lock().expect("results poisoned").len(),
            warning,
        }
    }

    /// Derive m honoring K, the range size, and the memory budget.
    fn derive_m(&self) -> Result<u64> {
        let n = self.params.range.size();

        if let Some(m) = self.params.m {
            if U256::from_u64(m) > n {
                bail!(
                    "m = {m} exceeds the range size 0x{}; lower m or widen the range",
                    n.to_hex()
                );
            }
            if m > u32::MAX as u64 {
                bail!("m = {m} exceeds the table index space (max {})", u32::MAX);
            }
            if self.params.max_memory_bytes > 0 {
                let needed = BabyStepTable::estimated_memory(m, &self.params.bloom);
                if needed > self.params.max_memory_bytes {
                    bail!(
                        "explicit m = {m} needs ~{} MiB but the budget is {} MiB",
                        needed / (1024 * 1024),
                        self.params.max_memory_bytes / (1024 * 1024)
                    );
                }
            }
            return Ok(m);
        }

        let (n_over_k, _) = n.div_rem_u64(self.params.k_factor as u64);
        let root = n_over_k.isqrt();
        // round the square root up
        let sq = root.mul_wide(&root);
        let root_is_exact = sq[8..].iter().all(|&l| l == 0) && {
            let mut low = [0u32; 8];
            low.copy_from_slice(&sq[..8]);
            U256::new(low) == n_over_k
        };
        let mut m = root.to_u128_saturating() + if root_is_exact { 0 } else { 1 };

        if U256::from_u128(m) > n {
            m = n.to_u128_saturating();
        }
        let mut m = m.min(u32::MAX as u128) as u64;
        m = m.max(1);

        if self.params.max_memory_bytes > 0 {
            let mut reduced = false;
            while m > 1024
                && BabyStepTable::estimated_memory(m, &self.params.bloom)
                    > self.params.max_memory_bytes
            {
                m /= 2;
                reduced = true;
            }
            if reduced {
                let note = format!(
                    "baby-step table reduced to m={m} to fit the {} MiB memory budget",
                    self.params.max_memory_bytes / (1024 * 1024)
                );
                warn!("{note}");
                self.emit_warning(note);
            }
        }
        Ok(m)
    }

    fn emit_warning(&self, warning: String) {
        let progress = self.build_progress(Some(warning));
        if let Some(sink) = self
            .shared
            .progress_sink
            .lock()
            .expect("sink poisoned")
            .as_ref()
        {
            sink(&progress);
        }
    }

    fn build_plan(&self, pool: &ThreadPool) -> Result<SearchPlan> {
        let range = self.params.range;
        let n = range.size();
        let n_clamped = n.to_u128_saturating();
        let workers = pool.size() as u64;

        if self.targets[0].is_pubkey() {
            let m = self.derive_m()?;

            let table = match &self.params.table_path {
                Some(path) if path.exists() => {
                    let table = BabyStepTable::load(path)
                        .with_context(|| format!("load baby table {}", path.display()))?;
                    if table.m() != m {
                        bail!(
                            "baby table file has m={} but the search derives m={m}; \
                             delete {} to rebuild",
                            table.m(),
                            path.display()
                        );
                    }
                    table
                }
                other => {
                    let table = BabyStepTable::build(m, &self.params.bloom, pool)?;
                    if let Some(path) = other {
                        table
                            .save(path)
                            .with_context(|| format!("save baby table {}", path.display()))?;
                    }
                    table
                }
            };

            let endo = self.params.endomorphism;
            let stride = if endo { 2 * m + 1 } else { m };
            let base_scalar = if endo {
                range.start.wrapping_add(&U256::from_u64(m))
            } else {
                range.start
            };

            let (steps_q, steps_r) = n.div_rem_u64(stride);
            let total_steps_wide = steps_q.to_u128_saturating() + if steps_r != 0 { 1 } else { 0 };
            if total_steps_wide > u64::MAX as u128 {
                bail!(
                    "range 0x{} needs more than 2^64 giant steps at m={m}; raise m or K",
                    n.to_hex()
                );
            }
            let total_steps = total_steps_wide as u64;

            let neg_giant = JacobianPoint::mul_generator(&U256::from_u64(stride))
                .negate()
                .to_affine();

            let targets = self
                .targets
                .iter()
                .map(|t| match t {
                    Target::PubKey(p) => (t.clone(), JacobianPoint::from_affine(p)),
                    Target::Hash160(_) => unreachable!("validated in initialize"),
                })
                .collect();

            let chunk_units = (total_steps / (workers * 8).max(1)).clamp(16, 8192).min(total_steps.max(1));
            let total_chunks = total_steps.div_ceil(chunk_units);

            info!(
                "giant-step plan: m={m}, stride={stride}, steps={total_steps}, \
                 chunks={total_chunks} x {chunk_units}, endomorphism={endo}"
            );

            Ok(SearchPlan {
                kind: PlanKind::Bsgs {
                    table: Arc::new(table),
                    targets,
                    stride,
                    neg_giant,
                    base_scalar,
                    endomorphism: endo,
                    lambda_sqr: LAMBDA.mul_mod(&LAMBDA, &N),
                    m,
                },
                compression: self.params.compression,
                range,
                chunk_units,
                total_chunks,
                span: chunk_units as u128 * stride as u128,
                n_clamped,
                target_count: self.targets.len(),
            })
        } else {
            // hash-only targets: exhaustive scan behind an address-hash bloom
            if n_clamped > 1u128 << 62 {
                bail!(
                    "range 0x{} is too large for an exhaustive hash scan; \
                     provide public keys to enable BSGS",
                    n.to_hex()
                );
            }

            let mut filter = BloomFilter::with_capacity(self.targets.len() as u64, 0.0001);
            let mut hashes = HashSet::with_capacity(self.targets.len());
            for target in &self.targets {
                if let Target::Hash160(h) = target {
                    filter.add(fnv1a64(h));
                    hashes.insert(*h);
                }
            }

            let chunk_units = 16_384u64.min(n_clamped.max(1) as u64);
            let total_chunks = (n_clamped as u64).div_ceil(chunk_units);

            info!(
                "scan plan: {} target hashes, {} chunks x {chunk_units} keys",
                hashes.len(),
                total_chunks
            );

            Ok(SearchPlan {
                kind: PlanKind::Scan {
                    filter,
                    hashes,
                    targets: self.targets.clone(),
                    step: JacobianPoint::GENERATOR.to_affine(),
                },
                compression: self.params.compression,
                range,
                chunk_units,
                total_chunks,
                span: chunk_units as u128,
                n_clamped,
                target_count: self.targets.len(),
            })
        }
    }
}

impl Drop for BsgsEngine {
    fn drop(&mut self) {
        self.stop();
        if let Some(handle) = self.checkpoint_thread.take() {
            let _ = handle.join();
        }
        // the pool's Drop joins the workers, which exit on the stop flag
    }
}

fn snapshot_standalone(
    shared: &Shared,
    plan: &SearchPlan,
    params: &BsgsParams,
    targets: &[Target],
) -> CheckpointData {
    let (fwd_chunks, bwd_chunks) = {
        let sched = shared.sched.lock().expect("scheduler poisoned");
        match sched.as_ref() {
            Some(s) => (s.fwd.frontier, s.bwd.frontier),
            None => (0, 0),
        }
    };
    let m = match &plan.kind {
        PlanKind::Bsgs { m, .. } => *m,
        PlanKind::Scan { .. } => 0,
    };
    let results = shared
        .results
        .lock()
        .expect("results poisoned")
        .iter()
        .map(|r| CheckpointResult {
            private_key: *r.private_key.as_be_bytes(),
            target_hash: r.target_hash,
            found_at_ms: r.found_at_ms,
        })
        .collect();

    CheckpointData {
        mode: params.mode,
        compression: params.compression,
        m,
        k_factor: params.k_factor,
        range: params.range,
        targets: targets.to_vec(),
        progress: CheckpointProgress {
            next_giant_step: fwd_chunks * plan.chunk_units,
            next_giant_step_back: bwd_chunks * plan.chunk_units,
            rng_seed: params.rng_seed,
            keys_checked: shared.keys_checked.load(Ordering::Relaxed),
            elapsed_ms: shared.elapsed_ms(),
        },
        results,
    }
}

fn worker_loop(shared: &Shared, plan: &SearchPlan, backend: &dyn StepperBackend) {
    loop {
        if shared.stop.load(Ordering::Acquire) {
            break;
        }
        if shared.paused.load(Ordering::Acquire) {
            let mut guard = shared.pause_lock.lock().expect("pause lock poisoned");
            while shared.paused.load(Ordering::Acquire) && !shared.stop.load(Ordering::Acquire) {
                guard = shared.pause_cv.wait(guard).expect("pause lock poisoned");
            }
            continue;
        }

        let claimed = {
            let mut sched = shared.sched.lock().expect("scheduler poisoned");
            sched.as_mut().and_then(|s| s.claim())
        };
        let Some((chunk, slot)) = claimed else {
            break;
        };

        if let Err(e) = execute_chunk(shared, plan, backend, chunk) {
            // drop the chunk like a failed task; the frontier keeps it
            // uncounted so a checkpoint resume re-runs it
            warn!("chunk {chunk} failed and was dropped: {e:#}");
            continue;
        }

        let finalized = {
            let mut sched = shared.sched.lock().expect("scheduler poisoned");
            sched.as_mut().map(|s| s.complete(slot)).unwrap_or_default()
        };
        let newly_covered: u64 = finalized.iter().map(|&c| plan.chunk_coverage(c)).sum();
        if newly_covered > 0 {
            shared.keys_checked.fetch_add(newly_covered, Ordering::Relaxed);
        }
        maybe_emit_progress(shared, plan);
    }

    if shared.active_workers.fetch_sub(1, Ordering::AcqRel) == 1 {
        shared.running.store(false, Ordering::Release);
        emit_progress(shared, plan);
        let mut done = shared.done.lock().expect("done poisoned");
        *done = true;
        shared.done_cv.notify_all();
    }
}

fn execute_chunk(
    shared: &Shared,
    plan: &SearchPlan,
    backend: &dyn StepperBackend,
    chunk: u64,
) -> Result<()> {
    match &plan.kind {
        PlanKind::Bsgs {
            table,
            targets,
            stride,
            neg_giant,
            base_scalar,
            endomorphism,
            lambda_sqr,
            m: _,
        } => {
            let step_lo = chunk * plan.chunk_units;
            let step_hi = (step_lo + plan.chunk_units).min(total_steps_of(plan));
            if step_hi <= step_lo {
                return Ok(());
            }
            let count = (step_hi - step_lo) as usize;

            let start_offset =
                base_scalar.wrapping_add(&U256::from_u128(step_lo as u128 * *stride as u128));
            // C = T - offset*G, then one mixed add per giant step
            let offset_point = JacobianPoint::mul_generator(&start_offset).negate();

            for (target, t_point) in targets {
                let cursor = t_point.add(&offset_point);
                let points = backend.walk(&cursor, neg_giant, count)?;

                for (off, point) in points.iter().enumerate() {
                    let j = step_lo + off as u64;
                    let base_j = base_scalar
                        .wrapping_add(&U256::from_u128(j as u128 * *stride as u128));

                    if point.infinity {
                        try_candidate(shared, plan, target, &base_j);
                        continue;
                    }

                    let x_bytes = point.x.to_be_bytes();
                    if let Some(i) = table.lookup_x(&x_bytes) {
                        let k = base_j.add_mod(&U256::from_u64(i), &N);
                        try_candidate(shared, plan, target, &k);
                        if *endomorphism {
                            let k = base_j.sub_mod(&U256::from_u64(i), &N);
                            try_candidate(shared, plan, target, &k);
                        }
                    }

                    if *endomorphism {
                        // phi(C) = (beta*x, y) equals (lambda*c)*G, so a hit
                        // at row i means c = +-i * lambda^-1 = +-i * lambda^2
                        let phi_x = point.x.mul(&BETA).to_be_bytes();
                        if let Some(i) = table.lookup_x(&phi_x) {
                            let v = lambda_sqr.mul_u64_mod(i, &N);
                            try_candidate(shared, plan, target, &base_j.add_mod(&v, &N));
                            try_candidate(shared, plan, target, &base_j.sub_mod(&v, &N));
                        }
                    }
                }
            }
            Ok(())
        }
        PlanKind::Scan {
            filter,
            hashes,
            targets,
            step,
        } => {
            let key_lo = chunk as u128 * plan.span;
            let key_hi = ((chunk + 1) as u128 * plan.span).min(plan.n_clamped);
            let count = (key_hi - key_lo) as usize;
            if count == 0 {
                return Ok(());
            }

            let first = plan.range.start.wrapping_add(&U256::from_u128(key_lo));
            let start_point = JacobianPoint::mul_generator(&first);
            let points = backend.walk(&start_point, step, count)?;

            let check_compressed = matches!(
                plan.compression,
                Compression::Compressed | Compression::Both
            );
            let check_uncompressed = matches!(
                plan.compression,
                Compression::Uncompressed | Compression::Both
            );

            for (off, point) in points.iter().enumerate() {
                if point.infinity {
                    continue;
                }
                let k = first.wrapping_add(&U256::from_u64(off as u64));

                if check_compressed {
                    let h = crate::targets::hash160_of(&point.to_compressed());
                    if filter.test(fnv1a64(&h)) && hashes.contains(&h) {
                        publish_scan_hit(shared, plan, targets, &k, h);
                    }
                }
                if check_uncompressed {
                    let h = crate::targets::hash160_of(&point.to_uncompressed());
                    if filter.test(fnv1a64(&h)) && hashes.contains(&h) {
                        publish_scan_hit(shared, plan, targets, &k, h);
                    }
                }
            }
            Ok(())
        }
    }
}

fn total_steps_of(plan: &SearchPlan) -> u64 {
    match &plan.kind {
        PlanKind::Bsgs { stride, .. } => {
            let last = plan.n_clamped.div_ceil(*stride as u128);
            last.min(u64::MAX as u128) as u64
        }
        PlanKind::Scan { .. } => plan.n_clamped.min(u64::MAX as u128) as u64,
    }
}

/// Verify a candidate scalar against its target and publish on success.
fn try_candidate(shared: &Shared, plan: &SearchPlan, target: &Target, k: &U256) {
    if k.is_zero() || shared.dedupe.contains_key(&k.to_be_bytes()) {
        return;
    }
    let point = JacobianPoint::mul_generator(k).to_affine();
    if !target.matches_point(&point, plan.compression) {
        return;
    }
    publish(shared, plan, target.clone(), k);
}

fn publish_scan_hit(
    shared: &Shared,
    plan: &SearchPlan,
    targets: &[Target],
    k: &U256,
    hash: [u8; 20],
) {
    let target = targets
        .iter()
        .find(|t| matches!(t, Target::Hash160(h) if *h == hash))
        .cloned()
        .unwrap_or(Target::Hash160(hash));
    publish(shared, plan, target, k);
}

/// Serialize publication: dedupe by key value, deliver to the sink in
/// lock-acquisition order, stop the sweep once every target has a result.
fn publish(shared: &Shared, plan: &SearchPlan, target: Target, k: &U256) {
    let key_bytes = k.to_be_bytes();
    let mut results = shared.results.lock().expect("results poisoned");
    if shared.dedupe.insert(key_bytes, ()).is_some() {
        return;
    }

    let target_hash = target.id_hash(plan.compression);
    let result = BsgsResult {
        private_key: SecretKey::from_be_bytes(key_bytes),
        target,
        target_hash,
        found_at_ms: shared.elapsed_ms(),
    };

    info!(
        "key found: 0x{} (target {})",
        result.private_key.to_hex(),
        hex::encode(target_hash)
    );

    if let Some(sink) = shared.result_sink.lock().expect("sink poisoned").as_ref() {
        sink(&result);
    }
    results.push(result);
    shared.found_targets.insert(target_hash, ());

    if shared.found_targets.len() >= plan.target_count {
        // every target has a key; end the sweep
        shared.stop.store(true, Ordering::Release);
        shared.pause_cv.notify_all();
    }
}

fn maybe_emit_progress(shared: &Shared, plan: &SearchPlan) {
    {
        let mut last = shared.last_progress.lock().expect("progress poisoned");
        if last.elapsed() < Duration::from_secs(1) {
            return;
        }
        *last = Instant::now();
    }
    emit_progress(shared, plan);
}

fn emit_progress(shared: &Shared, plan: &SearchPlan) {
    let sink = shared.progress_sink.lock().expect("sink poisoned");
    let Some(sink) = sink.as_ref() else {
        return;
    };

    let keys = shared.keys_checked.load(Ordering::Relaxed);
    let elapsed_ms = shared.elapsed_ms();
    let fwd = {
        let sched = shared.sched.lock().expect("scheduler poisoned");
        sched.as_ref().map(|s| s.fwd.frontier).unwrap_or(0)
    };
    let progress = BsgsProgress {
        keys_checked: keys,
        keys_per_second: if elapsed_ms == 0 {
            0
        } else {
            keys.saturating_mul(1000) / elapsed_ms
        },
        progress_percent: (keys as f64 / plan.n_clamped.max(1) as f64 * 100.0).min(100.0),
        elapsed: Duration::from_millis(elapsed_ms),
        current_position: plan
            .range
            .start
            .wrapping_add(&U256::from_u128(fwd as u128 * plan.span)),
        results_found: shared.results.lock().expect("results poisoned").len(),
        warning: None,
    };
    sink(&progress);
}

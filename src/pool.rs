//! Priority worker pool for CPU-bound search tasks
//!
//! A max-heap queue on a 2-bit priority with FIFO order inside each level.
//! Workers block on a condition variable when idle and re-check the paused
//! flag before every pop, so queued tasks wait out a pause.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracing::warn;

/// Task priority levels, highest first out of the queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum TaskPriority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Critical = 3,
}

type Job = Box<dyn FnOnce() + Send + 'static>;

struct QueuedTask {
    priority: TaskPriority,
    seq: u64,
    submitted: Instant,
    job: Job,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        // higher priority first; earlier sequence first within a level
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Cumulative pool counters; relaxed atomics, snapshot is approximate.
#[derive(Debug, Default)]
pub struct PoolStats {
    pub tasks_submitted: AtomicU64,
    pub tasks_completed: AtomicU64,
    pub tasks_pending: AtomicU64,
    pub total_wait_ns: AtomicU64,
    pub total_exec_ns: AtomicU64,
}

impl PoolStats {
    pub fn avg_wait_ms(&self) -> f64 {
        let completed = self.tasks_completed.load(AtomicOrdering::Relaxed);
        if completed == 0 {
            return 0.0;
        }
        self.total_wait_ns.load(AtomicOrdering::Relaxed) as f64 / (completed as f64 * 1e6)
    }

    pub fn avg_exec_ms(&self) -> f64 {
        let completed = self.tasks_completed.load(AtomicOrdering::Relaxed);
        if completed == 0 {
            return 0.0;
        }
        self.total_exec_ns.load(AtomicOrdering::Relaxed) as f64 / (completed as f64 * 1e6)
    }

    pub fn reset(&self) {
        self.tasks_submitted.store(0, AtomicOrdering::Relaxed);
        self.tasks_completed.store(0, AtomicOrdering::Relaxed);
        self.tasks_pending.store(0, AtomicOrdering::Relaxed);
        self.total_wait_ns.store(0, AtomicOrdering::Relaxed);
        self.total_exec_ns.store(0, AtomicOrdering::Relaxed);
    }
}

struct Queue {
    tasks: BinaryHeap<QueuedTask>,
    stop: bool,
}

struct PoolInner {
    queue: Mutex<Queue>,
    work_available: Condvar,
    work_done: Condvar,
    paused: AtomicBool,
    active: AtomicUsize,
    next_seq: AtomicU64,
    stats: PoolStats,
}

/// Fixed-size pool of OS worker threads.
pub struct ThreadPool {
    inner: Arc<PoolInner>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl ThreadPool {
    /// Spawn a pool with `num_threads` workers; 0 means one per CPU.
    pub fn new(num_threads: usize) -> Self {
        let num_threads = if num_threads == 0 {
            thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
        } else {
            num_threads
        };

        let inner = Arc::new(PoolInner {
            queue: Mutex::new(Queue {
                tasks: BinaryHeap::new(),
                stop: false,
            }),
            work_available: Condvar::new(),
            work_done: Condvar::new(),
            paused: AtomicBool::new(false),
            active: AtomicUsize::new(0),
            next_seq: AtomicU64::new(0),
            stats: PoolStats::default(),
        });

        let workers = (0..num_threads)
            .map(|i| {
                let inner = Arc::clone(&inner);
                thread::Builder::new()
                    .name(format!("bsgs-worker-{i}"))
                    .spawn(move || worker_loop(&inner))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        Self { inner, workers }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    pub fn submit<F>(&self, priority: TaskPriority, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.enqueue(vec![(priority, Box::new(job) as Job)]);
    }

    pub fn submit_batch(&self, priority: TaskPriority, jobs: Vec<Job>) {
        self.enqueue(jobs.into_iter().map(|j| (priority, j)).collect());
    }

    fn enqueue(&self, jobs: Vec<(TaskPriority, Job)>) {
        let count = jobs.len() as u64;
        {
            let mut queue = self.inner.queue.lock().expect("pool queue poisoned");
            assert!(!queue.stop, "cannot submit to a stopped pool");
            let now = Instant::now();
            for (priority, job) in jobs {
                let seq = self.inner.next_seq.fetch_add(1, AtomicOrdering::Relaxed);
                queue.tasks.push(QueuedTask {
                    priority,
                    seq,
                    submitted: now,
                    job,
                });
            }
        }
        self.inner
            .stats
            .tasks_submitted
            .fetch_add(count, AtomicOrdering::Relaxed);
        self.inner
            .stats
            .tasks_pending
            .fetch_add(count, AtomicOrdering::Relaxed);
        if count == 1 {
            self.inner.work_available.notify_one();
        } else {
            self.inner.work_available.notify_all();
        }
    }

    /// Block until the queue is empty and no task is executing.
    pub fn wait(&self) {
        let mut queue = self.inner.queue.lock().expect("pool queue poisoned");
        while !(queue.tasks.is_empty() && self.inner.active.load(AtomicOrdering::Acquire) == 0) {
            queue = self
                .inner
                .work_done
                .wait(queue)
                .expect("pool queue poisoned");
        }
    }

    /// Like [`wait`](Self::wait) with a deadline; false on timeout.
    /// Outstanding tasks keep running either way.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut queue = self.inner.queue.lock().expect("pool queue poisoned");
        loop {
            if queue.tasks.is_empty() && self.inner.active.load(AtomicOrdering::Acquire) == 0 {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, result) = self
                .inner
                .work_done
                .wait_timeout(queue, deadline - now)
                .expect("pool queue poisoned");
            queue = guard;
            if result.timed_out()
                && !(queue.tasks.is_empty()
                    && self.inner.active.load(AtomicOrdering::Acquire) == 0)
            {
                return false;
            }
        }
    }

    /// Queued tasks stop being popped; running tasks finish.
    pub fn pause(&self) {
        self.inner.paused.store(true, AtomicOrdering::Release);
    }

    pub fn resume(&self) {
        self.inner.paused.store(false, AtomicOrdering::Release);
        self.inner.work_available.notify_all();
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(AtomicOrdering::Acquire)
    }

    pub fn pending(&self) -> usize {
        self.inner
            .queue
            .lock()
            .expect("pool queue poisoned")
            .tasks
            .len()
    }

    pub fn active(&self) -> usize {
        self.inner.active.load(AtomicOrdering::Acquire)
    }

    pub fn stats(&self) -> &PoolStats {
        &self.inner.stats
    }

    /// Drain remaining tasks and join all workers.
    pub fn shutdown(&mut self) {
        {
            let mut queue = self.inner.queue.lock().expect("pool queue poisoned");
            if queue.stop {
                return;
            }
            queue.stop = true;
        }
        // a paused pool must still drain on shutdown
        self.inner.paused.store(false, AtomicOrdering::Release);
        self.inner.work_available.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(inner: &PoolInner) {
    loop {
        let task = {
            let mut queue = inner.queue.lock().expect("pool queue poisoned");
            loop {
                if queue.stop && queue.tasks.is_empty() {
                    return;
                }
                if !queue.tasks.is_empty() && !inner.paused.load(AtomicOrdering::Acquire) {
                    break;
                }
                queue = inner
                    .work_available
                    .wait(queue)
                    .expect("pool queue poisoned");
            }
            inner.active.fetch_add(1, AtomicOrdering::AcqRel);
            queue.tasks.pop().expect("non-empty queue")
        };

        inner
            .stats
            .tasks_pending
            .fetch_sub(1, AtomicOrdering::Relaxed);
        inner.stats.total_wait_ns.fetch_add(
            task.submitted.elapsed().as_nanos() as u64,
            AtomicOrdering::Relaxed,
        );

        let exec_start = Instant::now();
        if let Err(panic) = catch_unwind(AssertUnwindSafe(task.job)) {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            warn!("worker task panicked, dropping task: {msg}");
        }
        inner.stats.total_exec_ns.fetch_add(
            exec_start.elapsed().as_nanos() as u64,
            AtomicOrdering::Relaxed,
        );

        inner.active.fetch_sub(1, AtomicOrdering::AcqRel);
        inner
            .stats
            .tasks_completed
            .fetch_add(1, AtomicOrdering::Relaxed);
        inner.work_done.notify_all();
    }
}

/// Run `f(i)` for every i in [start, end) across the pool and block until
/// all chunks finish. Chunk size 0 picks max(1, total / (workers * 4)).
pub fn parallel_for<F>(pool: &ThreadPool, start: u64, end: u64, chunk_size: u64, f: F)
where
    F: Fn(u64) + Send + Sync + 'static,
{
    if start >= end {
        return;
    }
    let total = end - start;
    let chunk = if chunk_size == 0 {
        (total / (pool.size() as u64 * 4)).max(1)
    } else {
        chunk_size
    };

    let f = Arc::new(f);
    let num_chunks = total.div_ceil(chunk);
    let latch = Arc::new((Mutex::new(num_chunks), Condvar::new()));

    let mut jobs: Vec<Job> = Vec::with_capacity(num_chunks as usize);
    let mut lo = start;
    while lo < end {
        let hi = (lo + chunk).min(end);
        let f = Arc::clone(&f);
        let latch = Arc::clone(&latch);
        jobs.push(Box::new(move || {
            for i in lo..hi {
                f(i);
            }
            let (remaining, done) = &*latch;
            let mut left = remaining.lock().expect("latch poisoned");
            *left -= 1;
            if *left == 0 {
                done.notify_all();
            }
        }));
        lo = hi;
    }
    pool.submit_batch(TaskPriority::Normal, jobs);

    let (remaining, done) = &*latch;
    let mut left = remaining.lock().expect("latch poisoned");
    while *left > 0 {
        left = done.wait(left).expect("latch poisoned");
    }
}

/// Map each index, combine per-chunk accumulators, then fold the chunk
/// results sequentially in index order.
pub fn parallel_reduce<T, M, R>(
    pool: &ThreadPool,
    start: u64,
    end: u64,
    chunk_size: u64,
    identity: T,
    map: M,
    reduce: R,
) -> T
where
    T: Clone + Send + 'static,
    M: Fn(u64) -> T + Send + Sync + 'static,
    R: Fn(T, T) -> T + Send + Sync + 'static,
{
    if start >= end {
        return identity;
    }
    let total = end - start;
    let chunk = if chunk_size == 0 {
        (total / (pool.size() as u64 * 4)).max(1)
    } else {
        chunk_size
    };
    let num_chunks = total.div_ceil(chunk) as usize;

    let map = Arc::new(map);
    let reduce = Arc::new(reduce);
    let results: Arc<Mutex<Vec<Option<T>>>> = Arc::new(Mutex::new(vec![None; num_chunks]));
    let latch = Arc::new((Mutex::new(num_chunks), Condvar::new()));

    let mut jobs: Vec<Job> = Vec::with_capacity(num_chunks);
    let mut lo = start;
    let mut index = 0usize;
    while lo < end {
        let hi = (lo + chunk).min(end);
        let map = Arc::clone(&map);
        let reduce = Arc::clone(&reduce);
        let results = Arc::clone(&results);
        let latch = Arc::clone(&latch);
        let identity = identity.clone();
        jobs.push(Box::new(move || {
            let mut acc = identity;
            for i in lo..hi {
                acc = reduce(acc, map(i));
            }
            results.lock().expect("reduce results poisoned")[index] = Some(acc);
            let (remaining, done) = &*latch;
            let mut left = remaining.lock().expect("latch poisoned");
            *left -= 1;
            if *left == 0 {
                done.notify_all();
            }
        }));
        lo = hi;
        index += 1;
    }
    pool.submit_batch(TaskPriority::Normal, jobs);

    {
        let (remaining, done) = &*latch;
        let mut left = remaining.lock().expect("latch poisoned");
        while *left > 0 {
            left = done.wait(left).expect("latch poisoned");
        }
    }

    let mut acc = identity;
    let collected = results.lock().expect("reduce results poisoned");
    for chunk_result in collected.iter() {
        acc = reduce(acc, chunk_result.clone().expect("missing chunk result"));
    }
    acc
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn executes_all_submitted_tasks() {
        let pool = ThreadPool::new(4);
        let counter = Arc::new(AtomicU32::new(0));
        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            pool.submit(TaskPriority::Normal, move || {
                counter.fetch_add(1, AtomicOrdering::Relaxed);
            });
        }
        pool.wait();
        assert_eq!(counter.load(AtomicOrdering::Relaxed), 100);
        assert_eq!(pool.stats().tasks_completed.load(AtomicOrdering::Relaxed), 100);
    }

    #[test]
    fn priority_orders_queued_tasks() {
        let pool = ThreadPool::new(1);
        pool.pause();

        let order = Arc::new(Mutex::new(Vec::new()));
        for (priority, tag) in [
            (TaskPriority::Low, "low"),
            (TaskPriority::Critical, "critical"),
            (TaskPriority::Normal, "normal-1"),
            (TaskPriority::Normal, "normal-2"),
            (TaskPriority::High, "high"),
        ] {
            let order = Arc::clone(&order);
            pool.submit(priority, move || {
                order.lock().unwrap().push(tag);
            });
        }

        pool.resume();
        pool.wait();
        let order = order.lock().unwrap();
        assert_eq!(
            *order,
            vec!["critical", "high", "normal-1", "normal-2", "low"]
        );
    }

    #[test]
    fn pause_holds_queued_tasks() {
        let pool = ThreadPool::new(2);
        pool.pause();
        let counter = Arc::new(AtomicU32::new(0));
        {
            let counter = Arc::clone(&counter);
            pool.submit(TaskPriority::Normal, move || {
                counter.fetch_add(1, AtomicOrdering::Relaxed);
            });
        }
        thread::sleep(Duration::from_millis(50));
        assert_eq!(counter.load(AtomicOrdering::Relaxed), 0);
        pool.resume();
        pool.wait();
        assert_eq!(counter.load(AtomicOrdering::Relaxed), 1);
    }

    #[test]
    fn wait_for_times_out_without_cancelling() {
        let pool = ThreadPool::new(1);
        let counter = Arc::new(AtomicU32::new(0));
        {
            let counter = Arc::clone(&counter);
            pool.submit(TaskPriority::Normal, move || {
                thread::sleep(Duration::from_millis(200));
                counter.fetch_add(1, AtomicOrdering::Relaxed);
            });
        }
        assert!(!pool.wait_for(Duration::from_millis(20)));
        pool.wait();
        assert_eq!(counter.load(AtomicOrdering::Relaxed), 1);
    }

    #[test]
    fn panicking_task_does_not_kill_pool() {
        let pool = ThreadPool::new(2);
        pool.submit(TaskPriority::Normal, || panic!("deliberate test panic"));
        pool.wait();

        let counter = Arc::new(AtomicU32::new(0));
        {
            let counter = Arc::clone(&counter);
            pool.submit(TaskPriority::Normal, move || {
                counter.fetch_add(1, AtomicOrdering::Relaxed);
            });
        }
        pool.wait();
        assert_eq!(counter.load(AtomicOrdering::Relaxed), 1);
    }

    #[test]
    fn parallel_for_matches_sequential_side_effects() {
        let pool = ThreadPool::new(4);
        let seen = Arc::new(Mutex::new(HashSet::new()));
        {
            let seen = Arc::clone(&seen);
            parallel_for(&pool, 10, 500, 0, move |i| {
                assert!(seen.lock().unwrap().insert(i), "index {i} visited twice");
            });
        }
        let seen = seen.lock().unwrap();
        let expected: HashSet<u64> = (10..500).collect();
        assert_eq!(*seen, expected);
    }

    #[test]
    fn parallel_reduce_sums() {
        let pool = ThreadPool::new(4);
        let sum = parallel_reduce(&pool, 1, 1001, 0, 0u64, |i| i, |a, b| a + b);
        assert_eq!(sum, 500_500);
    }

    #[test]
    fn parallel_for_empty_range_is_noop() {
        let pool = ThreadPool::new(2);
        parallel_for(&pool, 5, 5, 0, |_| panic!("must not run"));
    }
}

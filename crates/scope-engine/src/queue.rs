//! Generic background work queue with retry logic.
//!
//! A bounded pool of workers consumes a FIFO of work items. Stage-specific
//! behavior plugs in through [`StageWorker`]; the queue owns retry
//! accounting, exponential backoff, status-message plumbing, lifetime
//! stats, and shutdown. Retries re-enter through the same FIFO so workers
//! stay fair across items.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use citrascope_core::settings::Settings;
use citrascope_core::task::Task;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

/// Retry tuning shared by all queues.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_retries: settings.max_task_retries,
            initial_delay: Duration::from_secs_f64(settings.initial_retry_delay_s),
            max_delay: Duration::from_secs_f64(settings.max_retry_delay_s),
        }
    }

    /// `min(initial * 2^count, max)`.
    fn backoff(&self, retry_count: u32) -> Duration {
        let exp = 2f64.powi(retry_count.min(31) as i32);
        let delay = self.initial_delay.as_secs_f64() * exp;
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }
}

/// Stage-specific hooks a queue drives.
#[async_trait]
pub trait StageWorker: Send + Sync + 'static {
    type Item: Send + 'static;
    type Output: Send + 'static;

    /// Human-visible stage name ("Imaging", "Processing", "Upload").
    fn stage_name(&self) -> &'static str;

    /// Do the work. `Ok((false, _))` and `Err(_)` both count as a failed
    /// attempt and go through the retry path.
    async fn execute(&self, item: &Self::Item) -> anyhow::Result<(bool, Option<Self::Output>)>;

    async fn on_success(&self, item: Self::Item, output: Option<Self::Output>);

    /// Called after the retry budget is exhausted.
    async fn on_permanent_failure(&self, item: Self::Item);

    /// The task behind an item, for status propagation. `None` for items
    /// without one (e.g. manual captures).
    fn task_of(&self, item: &Self::Item) -> Option<Arc<Task>>;
}

/// Marker error that bypasses the retry budget: the attempt counts, but
/// the item goes straight to `on_permanent_failure`. Used for operator
/// cancellation and other terminal rejections where retrying is useless.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct FatalWorkError(pub String);

enum Envelope<T> {
    Work { task_id: String, item: T },
    Poison,
}

#[derive(Debug, Default)]
struct StatsInner {
    attempts: AtomicU64,
    successes: AtomicU64,
    permanent_failures: AtomicU64,
    queued: AtomicUsize,
    active: AtomicUsize,
}

/// Lifetime counters for one queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub attempts: u64,
    pub successes: u64,
    pub permanent_failures: u64,
    pub queued: usize,
    pub active: usize,
}

/// Cheap handle for submitting into a queue and probing idleness.
pub struct QueueHandle<T> {
    tx: mpsc::UnboundedSender<Envelope<T>>,
    stats: Arc<StatsInner>,
}

impl<T> Clone for QueueHandle<T> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone(), stats: self.stats.clone() }
    }
}

impl<T: Send + 'static> QueueHandle<T> {
    pub fn submit(&self, task_id: impl Into<String>, item: T) {
        self.stats.queued.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(Envelope::Work { task_id: task_id.into(), item }).is_err() {
            self.stats.queued.fetch_sub(1, Ordering::SeqCst);
            tracing::warn!("work submitted to a stopped queue, dropping");
        }
    }

    /// Queue empty and no worker mid-attempt.
    pub fn is_idle(&self) -> bool {
        self.stats.queued.load(Ordering::SeqCst) == 0
            && self.stats.active.load(Ordering::SeqCst) == 0
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            attempts: self.stats.attempts.load(Ordering::SeqCst),
            successes: self.stats.successes.load(Ordering::SeqCst),
            permanent_failures: self.stats.permanent_failures.load(Ordering::SeqCst),
            queued: self.stats.queued.load(Ordering::SeqCst),
            active: self.stats.active.load(Ordering::SeqCst),
        }
    }
}

#[derive(Debug, Default)]
struct RetryRecord {
    count: u32,
    #[allow(dead_code)]
    last_failure: Option<Instant>,
}

struct Shared<S: StageWorker> {
    worker: S,
    policy: RetryPolicy,
    stats: Arc<StatsInner>,
    tx: mpsc::UnboundedSender<Envelope<S::Item>>,
    retry: Mutex<HashMap<String, RetryRecord>>,
    stopping: AtomicBool,
}

/// A running worker pool for one pipeline stage.
pub struct WorkQueue<S: StageWorker> {
    shared: Arc<Shared<S>>,
    num_workers: usize,
    join: Mutex<Option<JoinSet<()>>>,
}

impl<S: StageWorker> WorkQueue<S> {
    /// Spawn `num_workers` workers immediately.
    pub fn start(worker: S, num_workers: usize, policy: RetryPolicy) -> Self {
        let num_workers = num_workers.max(1);
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            worker,
            policy,
            stats: Arc::new(StatsInner::default()),
            tx,
            retry: Mutex::new(HashMap::new()),
            stopping: AtomicBool::new(false),
        });

        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let mut join = JoinSet::new();
        for idx in 0..num_workers {
            tracing::debug!(stage = shared.worker.stage_name(), worker = idx, "worker started");
            let shared = shared.clone();
            let rx = rx.clone();
            join.spawn(async move {
                worker_loop(idx, shared, rx).await;
            });
        }

        Self { shared, num_workers, join: Mutex::new(Some(join)) }
    }

    pub fn handle(&self) -> QueueHandle<S::Item> {
        QueueHandle { tx: self.shared.tx.clone(), stats: self.shared.stats.clone() }
    }

    pub fn is_idle(&self) -> bool {
        self.handle().is_idle()
    }

    pub fn stats(&self) -> QueueStats {
        self.handle().stats()
    }

    /// Stop the pool: one poison per worker, then a bounded join.
    pub async fn stop(&self) {
        let stage = self.shared.worker.stage_name();
        tracing::info!(stage, "stopping queue");
        self.shared.stopping.store(true, Ordering::SeqCst);
        for _ in 0..self.num_workers {
            let _ = self.shared.tx.send(Envelope::Poison);
        }

        let join = self.join.lock().expect("join lock").take();
        if let Some(mut join) = join {
            let deadline = Duration::from_secs(5);
            if tokio::time::timeout(deadline, async {
                while join.join_next().await.is_some() {}
            })
            .await
            .is_err()
            {
                tracing::warn!(stage, "queue workers did not stop in time, abandoning");
            }
        }
        tracing::info!(stage, "queue stopped");
    }
}

async fn worker_loop<S: StageWorker>(
    worker_idx: usize,
    shared: Arc<Shared<S>>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Envelope<S::Item>>>>,
) {
    loop {
        let envelope = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        let (task_id, item) = match envelope {
            None | Some(Envelope::Poison) => break,
            Some(Envelope::Work { task_id, item }) => (task_id, item),
        };

        shared.stats.queued.fetch_sub(1, Ordering::SeqCst);
        shared.stats.active.fetch_add(1, Ordering::SeqCst);
        shared.stats.attempts.fetch_add(1, Ordering::SeqCst);

        let task = shared.worker.task_of(&item);
        if let Some(task) = &task {
            task.set_executing(true);
        }

        let outcome = shared.worker.execute(&item).await;

        // Cleared on every exit from the attempt: success, retry, or error.
        if let Some(task) = &task {
            task.set_executing(false);
        }

        match outcome {
            Ok((true, output)) => {
                shared.retry.lock().expect("retry lock").remove(&task_id);
                if let Some(task) = &task {
                    task.set_retry_at(None);
                }
                shared.stats.successes.fetch_add(1, Ordering::SeqCst);
                shared.worker.on_success(item, output).await;
            }
            Ok((false, _)) => {
                handle_failure(&shared, task_id, item, task, None).await;
            }
            Err(err) if err.downcast_ref::<FatalWorkError>().is_some() => {
                tracing::warn!(
                    stage = shared.worker.stage_name(),
                    worker = worker_idx,
                    "terminal work error, skipping retries: {err:#}"
                );
                shared.retry.lock().expect("retry lock").remove(&task_id);
                shared.stats.permanent_failures.fetch_add(1, Ordering::SeqCst);
                shared.worker.on_permanent_failure(item).await;
            }
            Err(err) => {
                tracing::error!(
                    stage = shared.worker.stage_name(),
                    worker = worker_idx,
                    "worker error: {err:#}"
                );
                handle_failure(&shared, task_id, item, task, Some(err)).await;
            }
        }

        shared.stats.active.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn handle_failure<S: StageWorker>(
    shared: &Arc<Shared<S>>,
    task_id: String,
    item: S::Item,
    task: Option<Arc<Task>>,
    _error: Option<anyhow::Error>,
) {
    let stage = shared.worker.stage_name();
    let (retry_count, should_retry) = {
        let mut retry = shared.retry.lock().expect("retry lock");
        let record = retry.entry(task_id.clone()).or_default();
        if record.count < shared.policy.max_retries {
            record.count += 1;
            record.last_failure = Some(Instant::now());
            (record.count, true)
        } else {
            let count = record.count;
            retry.remove(&task_id);
            (count, false)
        }
    };

    if !should_retry {
        tracing::error!(
            stage,
            task_id,
            retries = retry_count,
            "work permanently failed after retries"
        );
        shared.stats.permanent_failures.fetch_add(1, Ordering::SeqCst);
        shared.worker.on_permanent_failure(item).await;
        return;
    }

    let backoff = shared.policy.backoff(retry_count - 1);
    let max_retries = shared.policy.max_retries;
    tracing::warn!(
        stage,
        task_id,
        attempt = retry_count,
        max_retries,
        backoff_s = backoff.as_secs_f64(),
        "work failed, scheduling retry"
    );

    if let Some(task) = &task {
        task.set_status_msg(format!(
            "{stage} failed (attempt {retry_count}/{max_retries}), retrying in {:.0}s...",
            backoff.as_secs_f64()
        ));
        let retry_epoch = chrono::Utc::now().timestamp() as f64 + backoff.as_secs_f64();
        task.set_retry_at(Some(retry_epoch));
    }

    // Delayed resubmission through the same FIFO keeps worker fairness.
    let shared = shared.clone();
    tokio::spawn(async move {
        tokio::time::sleep(backoff).await;
        if shared.stopping.load(Ordering::SeqCst) {
            return;
        }
        let task = shared.worker.task_of(&item);
        if let Some(task) = &task {
            task.set_retry_at(None);
            task.set_status_msg(format!(
                "Retrying {}...",
                shared.worker.stage_name().to_lowercase()
            ));
        }
        shared.stats.queued.fetch_add(1, Ordering::SeqCst);
        if shared.tx.send(Envelope::Work { task_id, item }).is_err() {
            shared.stats.queued.fetch_sub(1, Ordering::SeqCst);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
        }
    }

    fn test_task() -> Arc<Task> {
        Arc::new(Task::new(
            "t1".into(),
            "s1".into(),
            "SAT".into(),
            "tel".into(),
            "Tel".into(),
            "gs".into(),
            "GS".into(),
            0,
            600,
            None,
        ))
    }

    /// Fails the first `fail_first` attempts (by error when `by_error`),
    /// then succeeds.
    struct ScriptedStage {
        task: Arc<Task>,
        fail_first: u32,
        by_error: bool,
        /// Only meaningful with a single worker; concurrent attempts share
        /// one task and would race on the flag.
        assert_executing: bool,
        executions: AtomicU64,
        successes: Mutex<Vec<String>>,
        failures: Mutex<Vec<String>>,
    }

    impl ScriptedStage {
        fn new(fail_first: u32, by_error: bool) -> Self {
            Self {
                task: test_task(),
                fail_first,
                by_error,
                assert_executing: true,
                executions: AtomicU64::new(0),
                successes: Mutex::new(Vec::new()),
                failures: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl StageWorker for Arc<ScriptedStage> {
        type Item = String;
        type Output = u64;

        fn stage_name(&self) -> &'static str {
            "Imaging"
        }

        async fn execute(&self, _item: &String) -> anyhow::Result<(bool, Option<u64>)> {
            if self.assert_executing {
                assert!(self.task.executing(), "executing flag set during attempt");
            }
            let n = self.executions.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first as u64 {
                if self.by_error {
                    anyhow::bail!("scripted failure {n}");
                }
                return Ok((false, None));
            }
            Ok((true, Some(n)))
        }

        async fn on_success(&self, item: String, output: Option<u64>) {
            self.successes.lock().unwrap().push(format!("{item}:{}", output.unwrap()));
        }

        async fn on_permanent_failure(&self, item: String) {
            self.failures.lock().unwrap().push(item);
        }

        fn task_of(&self, _item: &String) -> Option<Arc<Task>> {
            Some(self.task.clone())
        }
    }

    async fn wait_idle<S: StageWorker>(queue: &WorkQueue<S>) {
        for _ in 0..500 {
            if queue.is_idle() {
                // Idle can be observed between a failure and its delayed
                // resubmission; settle briefly.
                tokio::time::sleep(Duration::from_millis(60)).await;
                if queue.is_idle() {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("queue never went idle");
    }

    #[tokio::test]
    async fn first_try_success() {
        let stage = Arc::new(ScriptedStage::new(0, false));
        let queue = WorkQueue::start(stage.clone(), 1, policy());
        assert!(queue.is_idle());

        queue.handle().submit("t1", "item".to_string());
        wait_idle(&queue).await;

        assert_eq!(stage.executions.load(Ordering::SeqCst), 1);
        assert_eq!(stage.successes.lock().unwrap().as_slice(), ["item:0"]);
        assert!(stage.failures.lock().unwrap().is_empty());
        let stats = queue.stats();
        assert_eq!((stats.attempts, stats.successes, stats.permanent_failures), (1, 1, 0));
        assert!(!stage.task.executing());

        queue.stop().await;
    }

    #[tokio::test]
    async fn retry_then_success() {
        let stage = Arc::new(ScriptedStage::new(1, false));
        let queue = WorkQueue::start(stage.clone(), 1, policy());

        queue.handle().submit("t1", "item".to_string());
        wait_idle(&queue).await;

        assert_eq!(stage.executions.load(Ordering::SeqCst), 2);
        assert_eq!(stage.successes.lock().unwrap().len(), 1);
        assert!(stage.failures.lock().unwrap().is_empty());
        assert_eq!(stage.task.retry_at(), None, "retry time cleared on success");

        queue.stop().await;
    }

    #[tokio::test]
    async fn error_failures_exhaust_into_permanent_failure() {
        let stage = Arc::new(ScriptedStage::new(u32::MAX, true));
        let queue = WorkQueue::start(stage.clone(), 1, policy());

        queue.handle().submit("t1", "item".to_string());
        wait_idle(&queue).await;

        // max_retries + 1 total attempts, then exactly one terminal call.
        assert_eq!(stage.executions.load(Ordering::SeqCst), 4);
        assert!(stage.successes.lock().unwrap().is_empty());
        assert_eq!(stage.failures.lock().unwrap().as_slice(), ["item"]);
        let stats = queue.stats();
        assert_eq!(stats.permanent_failures, 1);
        assert_eq!(stats.attempts, 4);

        queue.stop().await;
    }

    #[tokio::test]
    async fn retry_status_messages_are_user_readable() {
        let stage = Arc::new(ScriptedStage::new(1, false));
        let queue = WorkQueue::start(stage.clone(), 1, policy());

        queue.handle().submit("t1", "item".to_string());

        // Catch the between-attempt status.
        let mut saw_retry_msg = false;
        for _ in 0..200 {
            if let Some(msg) = stage.task.status_msg() {
                if msg.starts_with("Imaging failed (attempt 1/3)") || msg == "Retrying imaging..."
                {
                    saw_retry_msg = true;
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(saw_retry_msg, "no retry status observed");

        wait_idle(&queue).await;
        queue.stop().await;
    }

    #[tokio::test]
    async fn backoff_grows_and_caps() {
        let p = policy();
        assert_eq!(p.backoff(0), Duration::from_millis(10));
        assert_eq!(p.backoff(1), Duration::from_millis(20));
        assert_eq!(p.backoff(2), Duration::from_millis(40));
        assert_eq!(p.backoff(3), Duration::from_millis(40), "capped at max_delay");
    }

    #[tokio::test]
    async fn stop_drains_workers() {
        let stage = Arc::new(ScriptedStage::new(0, false));
        let queue = WorkQueue::start(stage.clone(), 2, policy());
        queue.stop().await;
        // Work submitted after stop is never executed.
        queue.handle().submit("t1", "late".to_string());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(stage.executions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn parallel_workers_share_the_fifo() {
        let mut inner = ScriptedStage::new(0, false);
        inner.assert_executing = false;
        let stage = Arc::new(inner);
        let queue = WorkQueue::start(stage.clone(), 3, policy());
        for i in 0..6 {
            queue.handle().submit(format!("t{i}"), format!("item{i}"));
        }
        wait_idle(&queue).await;
        assert_eq!(stage.executions.load(Ordering::SeqCst), 6);
        assert_eq!(stage.successes.lock().unwrap().len(), 6);
        queue.stop().await;
    }
}

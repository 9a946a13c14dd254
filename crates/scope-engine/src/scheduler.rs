//! Time-ordered task scheduler.
//!
//! Two cooperating activities around one piece of state: a **poller** that
//! reconciles the local schedule against the server's authoritative task
//! list every 30 s, and a **runner** that launches due tasks every second,
//! gated on pause state, automated-scheduling, the safety monitor, and the
//! long-running routine managers.
//!
//! A task id lives in exactly one place at a time: the start-time min-heap
//! while scheduled, or one stage bucket (imaging / processing / uploading)
//! once dispatched.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use citrascope_core::task::{Task, TaskStage, parse_epoch};

use crate::api::{CitraApi, TaskDto, TerminalStatus};
use crate::managers::RoutineGate;
use crate::safety::{ActionKind, SafetyMonitor};

/// Server statuses that make a task schedulable.
const SCHEDULABLE: [&str; 2] = ["Pending", "Scheduled"];

type HeapKey = (i64, i64, String);

struct SchedState {
    /// Min-heap on `(start_epoch, stop_epoch, id)`; the id tiebreak keeps
    /// iteration deterministic.
    heap: BinaryHeap<Reverse<HeapKey>>,
    /// Tasks currently in the heap.
    scheduled: HashMap<String, Arc<Task>>,
    /// Stage bucket per dispatched task.
    stages: HashMap<String, (Arc<Task>, TaskStage)>,
    current_task_id: Option<String>,
    paused: bool,
}

/// Shared scheduling state. The poller and runner tasks (see
/// [`spawn_poller`] / [`spawn_runner`]) drive it; the web layer reads it.
pub struct Scheduler {
    state: Mutex<SchedState>,
    automated_scheduling: AtomicBool,
}

impl Scheduler {
    pub fn new(automated_scheduling: bool) -> Self {
        Self {
            state: Mutex::new(SchedState {
                heap: BinaryHeap::new(),
                scheduled: HashMap::new(),
                stages: HashMap::new(),
                current_task_id: None,
                paused: false,
            }),
            automated_scheduling: AtomicBool::new(automated_scheduling),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SchedState> {
        self.state.lock().expect("scheduler lock")
    }

    // Poller side ---------------------------------------------------------

    /// Reconcile against the server's task list.
    ///
    /// New schedulable tasks with a future stop enter the heap; heap
    /// entries the server no longer lists are dropped silently. The
    /// currently-executing task and anything already in a stage bucket are
    /// never touched by polling.
    pub fn reconcile(&self, dtos: &[TaskDto], now: i64) {
        let mut api_task_map: HashMap<&str, &TaskDto> = HashMap::new();
        for dto in dtos {
            if SCHEDULABLE.contains(&dto.status.as_str()) {
                api_task_map.insert(dto.id.as_str(), dto);
            }
        }

        let mut state = self.lock();
        let mut added = 0usize;

        for (id, dto) in &api_task_map {
            let id = id.to_string();
            if state.scheduled.contains_key(&id)
                || state.stages.contains_key(&id)
                || state.current_task_id.as_deref() == Some(id.as_str())
            {
                continue;
            }
            let (start_epoch, stop_epoch) =
                match (parse_epoch(&dto.task_start), parse_epoch(&dto.task_stop)) {
                    (Ok(start), Ok(stop)) => (start, stop),
                    _ => {
                        tracing::warn!(task_id = id, "could not parse task start/stop, skipping");
                        continue;
                    }
                };
            // A stop at or before now is already expired.
            if stop_epoch <= now {
                tracing::debug!(task_id = id, "skipping past task");
                continue;
            }

            let task = Arc::new(Task::new(
                id.clone(),
                dto.satellite_id.clone(),
                dto.satellite_name.clone(),
                dto.telescope_id.clone(),
                dto.telescope_name.clone(),
                dto.ground_station_id.clone(),
                dto.ground_station_name.clone(),
                start_epoch,
                stop_epoch,
                dto.assigned_filter_name.clone(),
            ));
            state.heap.push(Reverse((start_epoch, stop_epoch, id.clone())));
            state.scheduled.insert(id, task);
            added += 1;
        }

        // Drop heap entries the server no longer lists.
        let current = state.current_task_id.clone();
        let before = state.heap.len();
        state.heap.retain(|Reverse((_, _, id))| {
            api_task_map.contains_key(id.as_str()) || current.as_deref() == Some(id.as_str())
        });
        let removed = before - state.heap.len();
        if removed > 0 {
            let keep: Vec<String> =
                state.heap.iter().map(|Reverse((_, _, id))| id.clone()).collect();
            state.scheduled.retain(|id, _| keep.contains(id));
        }

        if added > 0 || removed > 0 {
            tracing::info!(added, removed, scheduled = state.heap.len(), "poll reconciled");
        } else {
            tracing::debug!(scheduled = state.heap.len(), "poll reconciled, no change");
        }
    }

    // Runner side ---------------------------------------------------------

    /// Pop every scheduled task whose stop has already passed.
    pub fn take_expired(&self, now: i64) -> Vec<Arc<Task>> {
        let mut state = self.lock();
        let mut expired = Vec::new();
        // Expired entries aren't necessarily at the heap root (ordering is
        // by start), so sweep by id.
        let ids: Vec<String> = state
            .scheduled
            .iter()
            .filter(|(_, task)| task.stop_epoch <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in ids {
            state.heap.retain(|Reverse((_, _, hid))| *hid != id);
            if let Some(task) = state.scheduled.remove(&id) {
                expired.push(task);
            }
        }
        expired
    }

    /// Pop the earliest task that is due, moving it into the imaging
    /// bucket and designating it current. Returns `None` when nothing is
    /// due.
    pub fn take_due(&self, now: i64) -> Option<Arc<Task>> {
        let mut state = self.lock();
        let due = matches!(state.heap.peek(), Some(Reverse((start, _, _))) if *start <= now);
        if !due {
            return None;
        }
        let Reverse((_, _, id)) = state.heap.pop()?;
        let task = state.scheduled.remove(&id)?;
        state.stages.insert(id.clone(), (task.clone(), TaskStage::Imaging));
        state.current_task_id = Some(id);
        Some(task)
    }

    /// Start instant of the earliest scheduled task.
    pub fn next_start(&self) -> Option<i64> {
        self.lock().heap.peek().map(|Reverse((start, _, _))| *start)
    }

    // Stage buckets -------------------------------------------------------

    pub fn update_stage(&self, task_id: &str, stage: TaskStage) {
        let mut state = self.lock();
        if let Some(entry) = state.stages.get_mut(task_id) {
            entry.1 = stage;
        }
    }

    pub fn stage_of(&self, task_id: &str) -> Option<TaskStage> {
        self.lock().stages.get(task_id).map(|(_, stage)| *stage)
    }

    pub fn task_in_stages(&self, task_id: &str) -> Option<Arc<Task>> {
        self.lock().stages.get(task_id).map(|(task, _)| task.clone())
    }

    /// Remove a finished task from every stage bucket.
    pub fn remove_from_stages(&self, task_id: &str) {
        let mut state = self.lock();
        state.stages.remove(task_id);
        if state.current_task_id.as_deref() == Some(task_id) {
            state.current_task_id = None;
        }
    }

    pub fn current_task_id(&self) -> Option<String> {
        self.lock().current_task_id.clone()
    }

    pub fn clear_current(&self) {
        self.lock().current_task_id = None;
    }

    // Pause / automation --------------------------------------------------

    pub fn pause(&self) {
        self.lock().paused = true;
        tracing::info!("scheduler paused");
    }

    pub fn resume(&self) {
        self.lock().paused = false;
        tracing::info!("scheduler resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.lock().paused
    }

    pub fn automated_scheduling(&self) -> bool {
        self.automated_scheduling.load(Ordering::SeqCst)
    }

    pub fn set_automated_scheduling(&self, enabled: bool) {
        self.automated_scheduling.store(enabled, Ordering::SeqCst);
    }

    /// Drop every scheduled (not yet dispatched) task; returns how many
    /// were removed. Stage buckets and the current task are untouched.
    pub fn clear_pending_tasks(&self) -> usize {
        let mut state = self.lock();
        let removed = state.heap.len();
        state.heap.clear();
        state.scheduled.clear();
        removed
    }

    /// `(scheduled, in-stages)` counts, for status reporting.
    pub fn counts(&self) -> (usize, usize) {
        let state = self.lock();
        (state.heap.len(), state.stages.len())
    }

    /// True when the id is tracked anywhere (heap or a stage bucket).
    pub fn knows(&self, task_id: &str) -> bool {
        let state = self.lock();
        state.scheduled.contains_key(task_id) || state.stages.contains_key(task_id)
    }
}

/// Spawn the 30 s reconciliation poller.
pub fn spawn_poller(
    scheduler: Arc<Scheduler>,
    api: Arc<dyn CitraApi>,
    telescope_id: String,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            match api.telescope_tasks(&telescope_id).await {
                Ok(dtos) => {
                    scheduler.reconcile(&dtos, chrono::Utc::now().timestamp());
                }
                Err(err) => {
                    tracing::warn!("task poll failed: {err:#}");
                }
            }
        }
    })
}

/// Everything the runner tick needs.
pub struct RunnerDeps {
    pub scheduler: Arc<Scheduler>,
    pub api: Arc<dyn CitraApi>,
    pub monitor: Arc<SafetyMonitor>,
    pub managers: Vec<Arc<dyn RoutineGate>>,
    /// Submits a dispatched task to the imaging queue.
    pub dispatch: Box<dyn Fn(Arc<Task>) + Send + Sync>,
    /// Imaging-queue idleness, gating corrective actions.
    pub imaging_idle: Box<dyn Fn() -> bool + Send + Sync>,
}

/// Spawn the 1 s runner. Every iteration is fully wrapped; nothing that
/// happens inside a tick can kill the loop.
pub fn spawn_runner(deps: RunnerDeps, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            runner_tick(&deps).await;
        }
    })
}

async fn runner_tick(deps: &RunnerDeps) {
    let now = chrono::Utc::now().timestamp();

    // Tasks whose window closed while held back are abandoned as failed.
    for task in deps.scheduler.take_expired(now) {
        tracing::warn!(task_id = task.id, "observation window missed, abandoning");
        task.set_status_msg("Observation window missed");
        if let Err(err) = deps.api.set_task_status(&task.id, TerminalStatus::Failed).await {
            tracing::error!(task_id = task.id, "failed to report missed window: {err:#}");
        }
    }

    // Between-task slot for operator/scheduled routines.
    for manager in &deps.managers {
        manager.check_and_execute().await;
    }

    // Third defense layer: cooperative evaluation between tasks, and the
    // trigger for corrective actions like a cable unwind.
    let monitor = deps.monitor.clone();
    let evaluated = tokio::task::spawn_blocking(move || monitor.evaluate()).await;
    if let Ok((action, Some(check))) = evaluated {
        if action == crate::safety::SafetyAction::QueueStop
            && check.has_corrective_action()
            && (deps.imaging_idle)()
        {
            tracing::warn!(check = check.name(), "running corrective safety action");
            let _ = tokio::task::spawn_blocking(move || check.execute_action()).await;
        }
    }

    loop {
        if deps.scheduler.is_paused() || !deps.scheduler.automated_scheduling() {
            break;
        }
        if deps.managers.iter().any(|m| m.is_running() || m.is_requested()) {
            break;
        }
        if !deps.monitor.is_action_safe(ActionKind::Slew) {
            break;
        }
        let Some(task) = deps.scheduler.take_due(now) else { break };
        tracing::info!(task_id = task.id, satellite = task.satellite_name, "dispatching task");
        (deps.dispatch)(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dto(id: &str, status: &str, start: i64, stop: i64) -> TaskDto {
        TaskDto {
            id: id.to_string(),
            status: status.to_string(),
            satellite_id: "s1".into(),
            satellite_name: "SAT".into(),
            task_start: chrono::DateTime::from_timestamp(start, 0).unwrap().to_rfc3339(),
            task_stop: chrono::DateTime::from_timestamp(stop, 0).unwrap().to_rfc3339(),
            telescope_id: "tel".into(),
            telescope_name: "Tel".into(),
            ground_station_id: "gs".into(),
            ground_station_name: "GS".into(),
            assigned_filter_name: None,
        }
    }

    const NOW: i64 = 1_700_000_000;

    #[test]
    fn poll_adds_pending_and_scheduled() {
        let sched = Scheduler::new(true);
        sched.reconcile(
            &[
                dto("t1", "Pending", NOW + 60, NOW + 360),
                dto("t2", "Scheduled", NOW + 120, NOW + 420),
                dto("t3", "Succeeded", NOW + 60, NOW + 360),
                dto("t4", "Cancelled", NOW + 60, NOW + 360),
            ],
            NOW,
        );
        let (scheduled, staged) = sched.counts();
        assert_eq!(scheduled, 2);
        assert_eq!(staged, 0);
        assert!(sched.knows("t1") && sched.knows("t2"));
        assert!(!sched.knows("t3") && !sched.knows("t4"));
    }

    #[test]
    fn expired_task_never_enters_heap() {
        let sched = Scheduler::new(true);
        // Stop in the past, and stop exactly at now: both rejected.
        sched.reconcile(
            &[dto("past", "Pending", NOW - 300, NOW - 10), dto("edge", "Pending", NOW - 60, NOW)],
            NOW,
        );
        assert_eq!(sched.counts().0, 0);
    }

    #[test]
    fn double_poll_is_idempotent() {
        let sched = Scheduler::new(true);
        let dtos = [dto("t1", "Pending", NOW + 60, NOW + 360)];
        sched.reconcile(&dtos, NOW);
        sched.reconcile(&dtos, NOW);
        assert_eq!(sched.counts().0, 1);
    }

    #[test]
    fn poll_removes_tasks_the_server_dropped() {
        let sched = Scheduler::new(true);
        sched.reconcile(
            &[
                dto("t1", "Pending", NOW + 60, NOW + 360),
                dto("t2", "Pending", NOW + 90, NOW + 360),
            ],
            NOW,
        );
        assert_eq!(sched.counts().0, 2);

        sched.reconcile(&[dto("t2", "Pending", NOW + 90, NOW + 360)], NOW);
        assert_eq!(sched.counts().0, 1);
        assert!(!sched.knows("t1"));
        assert!(sched.knows("t2"));
    }

    #[test]
    fn status_flip_evicts_from_heap() {
        let sched = Scheduler::new(true);
        sched.reconcile(&[dto("t1", "Pending", NOW + 60, NOW + 360)], NOW);
        sched.reconcile(&[dto("t1", "Cancelled", NOW + 60, NOW + 360)], NOW);
        assert!(!sched.knows("t1"));
    }

    #[test]
    fn dispatched_task_is_immune_to_polling() {
        let sched = Scheduler::new(true);
        sched.reconcile(&[dto("t1", "Pending", NOW - 10, NOW + 360)], NOW - 20);
        let task = sched.take_due(NOW).unwrap();
        assert_eq!(task.id, "t1");
        assert_eq!(sched.stage_of("t1"), Some(TaskStage::Imaging));

        // Server stops listing it mid-flight: it stays in its bucket.
        sched.reconcile(&[], NOW);
        assert_eq!(sched.stage_of("t1"), Some(TaskStage::Imaging));
        assert_eq!(sched.current_task_id().as_deref(), Some("t1"));

        // And polling doesn't re-add it while it executes either.
        sched.reconcile(&[dto("t1", "Pending", NOW - 10, NOW + 360)], NOW);
        assert_eq!(sched.counts(), (0, 1));
    }

    #[test]
    fn heap_orders_by_start_then_stop_then_id() {
        let sched = Scheduler::new(true);
        sched.reconcile(
            &[
                dto("b", "Pending", NOW - 5, NOW + 400),
                dto("a", "Pending", NOW - 5, NOW + 400),
                dto("c", "Pending", NOW - 5, NOW + 300),
                dto("d", "Pending", NOW - 30, NOW + 400),
            ],
            NOW - 60,
        );
        let order: Vec<String> =
            std::iter::from_fn(|| sched.take_due(NOW).map(|t| t.id.clone())).collect();
        assert_eq!(order, ["d", "c", "a", "b"]);
    }

    #[test]
    fn task_id_lives_in_exactly_one_place() {
        let sched = Scheduler::new(true);
        sched.reconcile(&[dto("t1", "Pending", NOW - 10, NOW + 360)], NOW - 20);
        assert!(sched.knows("t1"));
        assert_eq!(sched.stage_of("t1"), None, "scheduled, not staged");

        let task = sched.take_due(NOW).unwrap();
        assert_eq!(sched.counts(), (0, 1), "moved from heap to bucket atomically");

        sched.update_stage(&task.id, TaskStage::Processing);
        assert_eq!(sched.stage_of("t1"), Some(TaskStage::Processing));
        sched.update_stage(&task.id, TaskStage::Uploading);
        assert_eq!(sched.stage_of("t1"), Some(TaskStage::Uploading));

        sched.remove_from_stages("t1");
        assert!(!sched.knows("t1"));
        assert_eq!(sched.current_task_id(), None);
    }

    #[test]
    fn take_expired_sweeps_overdue_entries() {
        let sched = Scheduler::new(true);
        sched.reconcile(
            &[
                dto("live", "Pending", NOW + 60, NOW + 600),
                dto("dead", "Pending", NOW - 120, NOW + 10),
            ],
            NOW,
        );
        let expired = sched.take_expired(NOW + 30);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, "dead");
        assert!(sched.knows("live"));
        assert!(!sched.knows("dead"));
    }

    #[test]
    fn nothing_due_before_start() {
        let sched = Scheduler::new(true);
        sched.reconcile(&[dto("t1", "Pending", NOW + 60, NOW + 600)], NOW);
        assert!(sched.take_due(NOW).is_none());
        assert!(sched.take_due(NOW + 60).is_some());
    }

    #[test]
    fn clear_pending_keeps_dispatched_work() {
        let sched = Scheduler::new(true);
        sched.reconcile(
            &[
                dto("t1", "Pending", NOW - 10, NOW + 600),
                dto("t2", "Pending", NOW + 60, NOW + 600),
                dto("t3", "Pending", NOW + 90, NOW + 600),
            ],
            NOW - 20,
        );
        let _running = sched.take_due(NOW).unwrap();
        assert_eq!(sched.clear_pending_tasks(), 2);
        assert_eq!(sched.counts(), (0, 1));
        assert_eq!(sched.current_task_id().as_deref(), Some("t1"));
    }

    #[test]
    fn pause_and_automation_flags() {
        let sched = Scheduler::new(false);
        assert!(!sched.automated_scheduling());
        sched.set_automated_scheduling(true);
        assert!(sched.automated_scheduling());
        assert!(!sched.is_paused());
        sched.pause();
        assert!(sched.is_paused());
        sched.resume();
        assert!(!sched.is_paused());
    }
}

//! Step-driven task scheduling with a serial execution queue.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::{EngineError, Result};
use crate::limiter::panic_message;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StepContext {
    pub step_count: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Steps,
    Time,
    Cron,
}

impl TriggerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Steps => "steps",
            Self::Time => "time",
            Self::Cron => "cron",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TriggerInfo {
    pub task_id: String,
    pub spec: String,
    pub kind: TriggerKind,
}

pub type TaskFuture = BoxFuture<'static, Result<()>>;
pub type StepCallback = Arc<dyn Fn(StepContext) -> TaskFuture + Send + Sync>;
pub type TriggerCallback = Arc<dyn Fn(TriggerInfo) + Send + Sync>;

struct StepTask {
    every: u64,
    last_triggered: u64,
    callback: StepCallback,
}

type Listeners = Mutex<BTreeMap<u64, StepCallback>>;

/// Removes an `on_step` listener when [`unsubscribe`](Self::unsubscribe) is called.
pub struct ListenerHandle {
    id: u64,
    listeners: Weak<Listeners>,
}

impl ListenerHandle {
    pub fn unsubscribe(self) -> bool {
        self.listeners
            .upgrade()
            .is_some_and(|l| l.lock().remove(&self.id).is_some())
    }
}

enum Job {
    Run(TaskFuture),
    Barrier(oneshot::Sender<()>),
}

pub struct Scheduler {
    step_tasks: Mutex<BTreeMap<String, StepTask>>,
    listeners: Arc<Listeners>,
    next_listener: AtomicU64,
    jobs: mpsc::UnboundedSender<Job>,
    on_trigger: Option<TriggerCallback>,
}

impl Scheduler {
    /// Must be called inside a Tokio runtime; the queue worker is spawned here.
    pub fn new() -> Self {
        Self::build(None)
    }

    pub fn with_trigger(on_trigger: TriggerCallback) -> Self {
        Self::build(Some(on_trigger))
    }

    fn build(on_trigger: Option<TriggerCallback>) -> Self {
        let (jobs, rx) = mpsc::unbounded_channel();
        let _ = tokio::spawn(run_queue(rx));
        Self {
            step_tasks: Mutex::new(BTreeMap::new()),
            listeners: Arc::new(Mutex::new(BTreeMap::new())),
            next_listener: AtomicU64::new(0),
            jobs,
            on_trigger,
        }
    }

    /// Run `callback` whenever at least `every` steps passed since it last fired.
    pub fn every_steps(&self, every: u64, callback: StepCallback) -> Result<String> {
        if every == 0 {
            return Err(EngineError::InvalidArgument(
                "every_steps: interval must be positive".into(),
            ));
        }
        let id = format!("steps-{}", uuid::Uuid::now_v7());
        let _ = self.step_tasks.lock().insert(
            id.clone(),
            StepTask {
                every,
                last_triggered: 0,
                callback,
            },
        );
        Ok(id)
    }

    pub fn on_step(&self, callback: StepCallback) -> ListenerHandle {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        let _ = self.listeners.lock().insert(id, callback);
        ListenerHandle {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    /// Queue `task` behind everything already queued. Failures are logged.
    pub fn enqueue(&self, task: TaskFuture) {
        if self.jobs.send(Job::Run(task)).is_err() {
            warn!("scheduler queue closed, task dropped");
        }
    }

    /// Wait until every task queued so far has finished.
    pub async fn idle(&self) {
        let (tx, rx) = oneshot::channel();
        if self.jobs.send(Job::Barrier(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn notify_step(&self, step_count: u64) {
        let ctx = StepContext { step_count };
        let listeners: Vec<StepCallback> = self.listeners.lock().values().cloned().collect();
        for listener in listeners {
            self.enqueue(listener(ctx));
        }

        let mut fired = Vec::new();
        {
            let mut tasks = self.step_tasks.lock();
            for (id, task) in tasks.iter_mut() {
                if step_count.saturating_sub(task.last_triggered) < task.every {
                    continue;
                }
                task.last_triggered = step_count;
                fired.push((id.clone(), task.every, Arc::clone(&task.callback)));
            }
        }
        for (task_id, every, callback) in fired {
            debug!(task_id = %task_id, step_count, "step task triggered");
            self.enqueue(callback(ctx));
            self.trigger(TriggerInfo {
                task_id,
                spec: format!("steps:{every}"),
                kind: TriggerKind::Steps,
            });
        }
    }

    pub fn cancel(&self, task_id: &str) -> bool {
        self.step_tasks.lock().remove(task_id).is_some()
    }

    pub fn clear(&self) {
        self.step_tasks.lock().clear();
        self.listeners.lock().clear();
    }

    pub fn task_count(&self) -> usize {
        self.step_tasks.lock().len()
    }

    /// Report a trigger that originated outside the step counter.
    pub fn notify_external_trigger(&self, info: TriggerInfo) {
        self.trigger(info);
    }

    fn trigger(&self, info: TriggerInfo) {
        if let Some(on_trigger) = &self.on_trigger {
            on_trigger(info);
        }
    }
}

async fn run_queue(mut rx: mpsc::UnboundedReceiver<Job>) {
    while let Some(job) = rx.recv().await {
        match job {
            Job::Run(task) => match AssertUnwindSafe(task).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "scheduled task failed"),
                Err(panic) => warn!(panic = %panic_message(&panic), "scheduled task panicked"),
            },
            Job::Barrier(done) => {
                let _ = done.send(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<u64>>>, StepCallback) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: StepCallback = Arc::new(move |ctx: StepContext| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().push(ctx.step_count);
                Ok(())
            }
            .boxed()
        });
        (seen, callback)
    }

    #[tokio::test]
    async fn every_steps_fires_on_interval() {
        let triggers = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&triggers);
        let scheduler = Scheduler::with_trigger(Arc::new(move |info| sink.lock().push(info)));
        let (seen, callback) = recorder();
        let id = scheduler.every_steps(2, callback).unwrap();
        assert!(id.starts_with("steps-"));

        for step in 1..=5 {
            scheduler.notify_step(step);
        }
        scheduler.idle().await;
        assert_eq!(*seen.lock(), vec![2, 4]);

        let triggers = triggers.lock().clone();
        assert_eq!(triggers.len(), 2);
        assert_eq!(triggers[0].spec, "steps:2");
        assert_eq!(triggers[0].kind, TriggerKind::Steps);
        assert_eq!(triggers[0].task_id, id);
    }

    #[tokio::test]
    async fn zero_interval_is_rejected() {
        let scheduler = Scheduler::new();
        let (_, callback) = recorder();
        assert!(matches!(
            scheduler.every_steps(0, callback),
            Err(EngineError::InvalidArgument(msg)) if msg.contains("interval must be positive")
        ));
    }

    #[tokio::test]
    async fn listeners_unsubscribe_and_cancel() {
        let scheduler = Scheduler::new();
        let (steps, listener) = recorder();
        let handle = scheduler.on_step(listener);
        let (fired, task) = recorder();
        let id = scheduler.every_steps(1, task).unwrap();

        scheduler.notify_step(1);
        scheduler.idle().await;
        assert!(handle.unsubscribe());
        assert!(scheduler.cancel(&id));
        assert!(!scheduler.cancel(&id));
        scheduler.notify_step(2);
        scheduler.idle().await;

        assert_eq!(*steps.lock(), vec![1]);
        assert_eq!(*fired.lock(), vec![1]);
    }

    fn trip() -> bool {
        true
    }

    #[tokio::test]
    async fn queue_is_serial_and_survives_failures() {
        let scheduler = Scheduler::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let slow = Arc::clone(&order);
        scheduler.enqueue(
            async move {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                slow.lock().push("slow");
                Ok(())
            }
            .boxed(),
        );
        scheduler.enqueue(async { Err(EngineError::Internal("boom".into())) }.boxed());
        scheduler.enqueue(
            async {
                if trip() {
                    panic!("scheduled panic");
                }
                Ok(())
            }
            .boxed(),
        );
        let fast = Arc::clone(&order);
        scheduler.enqueue(
            async move {
                fast.lock().push("fast");
                Ok(())
            }
            .boxed(),
        );
        scheduler.idle().await;
        assert_eq!(*order.lock(), vec!["slow", "fast"]);
    }

    #[tokio::test]
    async fn clear_drops_tasks_and_listeners() {
        let scheduler = Scheduler::new();
        let (seen, callback) = recorder();
        let _ = scheduler.on_step(Arc::clone(&callback));
        let _ = scheduler.every_steps(1, callback).unwrap();
        scheduler.clear();
        scheduler.notify_step(3);
        scheduler.idle().await;
        assert!(seen.lock().is_empty());
        assert_eq!(scheduler.task_count(), 0);
    }

    #[tokio::test]
    async fn external_triggers_reach_callback() {
        let triggers = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&triggers);
        let scheduler = Scheduler::with_trigger(Arc::new(move |info| sink.lock().push(info)));
        scheduler.notify_external_trigger(TriggerInfo {
            task_id: "cron-1".into(),
            spec: "0 9 * * *".into(),
            kind: TriggerKind::Cron,
        });
        assert_eq!(triggers.lock()[0].kind.as_str(), "cron");
    }
}

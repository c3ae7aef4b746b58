//! Wall-clock timers whose ticks run on a [`Scheduler`] queue.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveTime, TimeDelta};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{EngineError, Result};
use crate::scheduler::{Scheduler, TaskFuture, TriggerInfo, TriggerKind};

pub const DEFAULT_DRIFT_TOLERANCE: Duration = Duration::from_secs(5);

pub type TimerCallback = Arc<dyn Fn() -> TaskFuture + Send + Sync>;

pub struct TimeBridge {
    scheduler: Arc<Scheduler>,
    drift_tolerance: Duration,
    timers: Mutex<HashMap<String, AbortHandle>>,
}

impl TimeBridge {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self {
            scheduler,
            drift_tolerance: DEFAULT_DRIFT_TOLERANCE,
            timers: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_drift_tolerance(mut self, tolerance: Duration) -> Self {
        self.drift_tolerance = tolerance;
        self
    }

    pub fn every_minutes(&self, minutes: u64, callback: TimerCallback) -> Result<String> {
        if minutes == 0 {
            return Err(EngineError::InvalidArgument(
                "every_minutes: interval must be positive".into(),
            ));
        }
        let interval = Duration::from_secs(minutes * 60);
        let id = format!("minutes-{}", uuid::Uuid::now_v7());
        let spec = format!("every:{minutes}m");
        Ok(self.start(id, spec, TriggerKind::Time, callback, move || interval))
    }

    /// Daily timer from a `"M H * * *"` expression. Only numeric minute and
    /// hour fields are supported.
    pub fn cron(&self, expr: &str, callback: TimerCallback) -> Result<String> {
        let at = parse_cron(expr)?;
        let id = format!("cron-{}", uuid::Uuid::now_v7());
        Ok(self.start(id, expr.trim().to_string(), TriggerKind::Cron, callback, move || {
            until_next(at)
        }))
    }

    pub fn stop(&self, id: &str) -> bool {
        match self.timers.lock().remove(id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn dispose(&self) {
        for (_, handle) in self.timers.lock().drain() {
            handle.abort();
        }
    }

    pub fn len(&self) -> usize {
        self.timers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn start(
        &self,
        id: String,
        spec: String,
        kind: TriggerKind,
        callback: TimerCallback,
        next_delay: impl Fn() -> Duration + Send + 'static,
    ) -> String {
        let scheduler = Arc::clone(&self.scheduler);
        let tolerance = self.drift_tolerance;
        let timer_id = id.clone();
        let task = tokio::spawn(async move {
            loop {
                let due = Instant::now() + next_delay();
                tokio::time::sleep_until(due).await;

                let callback = Arc::clone(&callback);
                let trigger_scheduler = Arc::clone(&scheduler);
                let info = TriggerInfo {
                    task_id: timer_id.clone(),
                    spec: spec.clone(),
                    kind,
                };
                scheduler.enqueue(
                    async move {
                        let drift = Instant::now().saturating_duration_since(due);
                        if drift > tolerance {
                            warn!(
                                timer = %info.task_id,
                                drift_ms = drift.as_millis() as u64,
                                spec = %info.spec,
                                "timer drift"
                            );
                        }
                        callback().await?;
                        trigger_scheduler.notify_external_trigger(info);
                        Ok(())
                    }
                    .boxed(),
                );
            }
        });
        debug!(timer = %id, "timer started");
        let _ = self.timers.lock().insert(id.clone(), task.abort_handle());
        id
    }
}

impl Drop for TimeBridge {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn parse_cron(expr: &str) -> Result<NaiveTime> {
    let unsupported = || EngineError::InvalidArgument(format!("Unsupported cron expression: {expr}"));
    let parts: Vec<&str> = expr.split_whitespace().collect();
    if parts.len() != 5 || parts[2..].iter().any(|p| *p != "*") {
        return Err(unsupported());
    }
    let numeric = || {
        EngineError::InvalidArgument(format!(
            "Cron expression must be numeric minutes/hours: {expr}"
        ))
    };
    let minute: u32 = parts[0].parse().map_err(|_| numeric())?;
    let hour: u32 = parts[1].parse().map_err(|_| numeric())?;
    NaiveTime::from_hms_opt(hour, minute, 0).ok_or_else(unsupported)
}

/// Time until the next local occurrence of `at`, tomorrow if already past.
fn until_next(at: NaiveTime) -> Duration {
    let now = Local::now().naive_local();
    let mut next = now.date().and_time(at);
    if next <= now {
        next += TimeDelta::days(1);
    }
    (next - now).to_std().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, TimerCallback) {
        let count = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&count);
        let callback: TimerCallback = Arc::new(move || {
            let sink = Arc::clone(&sink);
            async move {
                let _ = sink.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            .boxed()
        });
        (count, callback)
    }

    #[tokio::test(start_paused = true)]
    async fn every_minutes_ticks_through_scheduler() {
        let triggers = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&triggers);
        let scheduler = Arc::new(Scheduler::with_trigger(Arc::new(move |info| sink.lock().push(info))));
        let bridge = TimeBridge::new(Arc::clone(&scheduler));
        let (count, callback) = counter();
        let id = bridge.every_minutes(1, callback).unwrap();

        tokio::time::sleep(Duration::from_secs(125)).await;
        scheduler.idle().await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
        let triggers = triggers.lock().clone();
        assert_eq!(triggers.len(), 2);
        assert_eq!(triggers[0].spec, "every:1m");
        assert_eq!(triggers[0].kind, TriggerKind::Time);

        assert!(bridge.stop(&id));
        assert!(!bridge.stop(&id));
        tokio::time::sleep(Duration::from_secs(120)).await;
        scheduler.idle().await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn rejects_bad_arguments() {
        let bridge = TimeBridge::new(Arc::new(Scheduler::new()));
        let (_, callback) = counter();
        assert!(bridge.every_minutes(0, Arc::clone(&callback)).is_err());
        for expr in ["0 9 * *", "*/5 9 * * *", "0 9 1 * *", "61 9 * * *", "0 24 * * *"] {
            assert!(bridge.cron(expr, Arc::clone(&callback)).is_err(), "{expr}");
        }
        assert!(bridge.is_empty());
    }

    #[tokio::test]
    async fn cron_registers_and_dispose_stops_all() {
        let bridge = TimeBridge::new(Arc::new(Scheduler::new()));
        let (_, callback) = counter();
        let id = bridge.cron("30 9 * * *", Arc::clone(&callback)).unwrap();
        assert!(id.starts_with("cron-"));
        let _ = bridge.every_minutes(5, callback).unwrap();
        assert_eq!(bridge.len(), 2);
        bridge.dispose();
        assert!(bridge.is_empty());
    }

    #[test]
    fn next_occurrence_is_within_a_day() {
        let at = NaiveTime::from_hms_opt(9, 30, 0).unwrap();
        let delay = until_next(at);
        assert!(delay <= Duration::from_secs(24 * 60 * 60));
        assert_eq!(parse_cron(" 30  9 * * * ").unwrap(), at);
    }
}

// Time sources and timer scheduling
// Abstracted so the refresh timer can run against a virtual clock

use chrono::Utc;
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Source of the current wall-clock time
pub trait Clock: Send + Sync {
    /// Current time in epoch milliseconds
    fn now_ms(&self) -> i64;
}

/// Real wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    pub fn new(now_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(now_ms),
        }
    }

    pub fn set(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        let by_ms = i64::try_from(by.as_millis()).unwrap_or(i64::MAX);
        self.now_ms.fetch_add(by_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// Cancels a scheduled task when invoked
pub struct TimerHandle {
    cancel: Box<dyn FnOnce() + Send + Sync>,
}

impl TimerHandle {
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Box::new(cancel),
        }
    }

    /// Handle for a task that was never scheduled
    pub fn noop() -> Self {
        Self::new(|| {})
    }

    pub fn cancel(self) {
        (self.cancel)()
    }
}

/// Runs a future once after a delay
pub trait Scheduler: Send + Sync {
    fn schedule(&self, delay: Duration, task: BoxFuture<'static, ()>) -> TimerHandle;
}

/// Scheduler backed by `tokio::spawn` + `tokio::time::sleep`
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, task: BoxFuture<'static, ()>) -> TimerHandle {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("No tokio runtime available, refresh timer not scheduled");
            return TimerHandle::noop();
        };

        let handle = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
        });

        TimerHandle::new(move || handle.abort())
    }
}

struct ManualTask {
    delay: Duration,
    task: BoxFuture<'static, ()>,
    cancelled: Arc<AtomicBool>,
}

/// Scheduler that queues tasks until they are fired explicitly
#[derive(Default)]
pub struct ManualScheduler {
    tasks: Mutex<Vec<ManualTask>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays of the tasks still waiting to fire, in scheduling order
    pub fn pending(&self) -> Vec<Duration> {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.retain(|t| !t.cancelled.load(Ordering::SeqCst));
        tasks.iter().map(|t| t.delay).collect()
    }

    /// Run the oldest live task to completion; returns its delay
    pub async fn fire_next(&self) -> Option<Duration> {
        let next = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.retain(|t| !t.cancelled.load(Ordering::SeqCst));
            if tasks.is_empty() {
                None
            } else {
                Some(tasks.remove(0))
            }
        };

        let ManualTask { delay, task, .. } = next?;
        task.await;
        Some(delay)
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, task: BoxFuture<'static, ()>) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(ManualTask {
                delay,
                task,
                cancelled: cancelled.clone(),
            });

        TimerHandle::new(move || cancelled.store(true, Ordering::SeqCst))
    }
}

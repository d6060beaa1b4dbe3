//! Cooperative worker loop: interval polling, early wake, graceful stop.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// What a step learned about the queue it serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StepHint {
    /// More work is likely waiting; come back after a minimal pause.
    Continue,
    /// Caught up; sleep out the rest of the interval.
    Satisfied,
}

/// Floor for every sleep, so a hot loop still yields.
const MIN_SLEEP: Duration = Duration::from_millis(5);

type StepFn = Box<dyn FnMut() -> BoxFuture<'static, StepHint> + Send>;

struct WorkerState {
    running: AtomicBool,
    notify: Notify,
}

/// One long-running cooperative loop. States: stopped → running → stopping →
/// stopped. `notify()` wakes a pending sleep (or stores a permit that skips
/// the next one); `stop()` flips the flag, wakes the sleep, and awaits the
/// step in flight.
pub(crate) struct Worker {
    interval: Duration,
    state: Arc<WorkerState>,
    step: Mutex<Option<StepFn>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    pub fn new<F, Fut>(interval: Duration, mut step: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = StepHint> + Send + 'static,
    {
        Self {
            interval,
            state: Arc::new(WorkerState {
                running: AtomicBool::new(false),
                notify: Notify::new(),
            }),
            step: Mutex::new(Some(Box::new(move || Box::pin(step())))),
            handle: Mutex::new(None),
        }
    }

    /// Start the loop. Starting twice is idempotent; a worker cannot be
    /// restarted after `stop()`.
    pub fn start(&self) {
        if self.state.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(mut step) = self.step.lock().expect("step lock poisoned").take() else {
            self.state.running.store(false, Ordering::SeqCst);
            return;
        };

        let state = self.state.clone();
        let interval = self.interval;

        let handle = tokio::spawn(async move {
            while state.running.load(Ordering::SeqCst) {
                let started = Instant::now();
                let hint = step().await;
                if !state.running.load(Ordering::SeqCst) {
                    break;
                }

                let sleep_for = match hint {
                    StepHint::Continue => MIN_SLEEP,
                    StepHint::Satisfied => interval
                        .saturating_sub(started.elapsed())
                        .max(MIN_SLEEP),
                };

                tokio::select! {
                    _ = state.notify.notified() => {
                        // woken early; still yield for the minimum pause
                        tokio::time::sleep(MIN_SLEEP).await;
                    }
                    _ = tokio::time::sleep(sleep_for) => {}
                }
            }
        });

        *self.handle.lock().expect("handle lock poisoned") = Some(handle);
    }

    /// Wake the loop early. A no-op while stopped.
    pub fn notify(&self) {
        if self.state.running.load(Ordering::SeqCst) {
            self.state.notify.notify_one();
        }
    }

    /// A detached handle that can wake this worker, usable from completion
    /// callbacks that outlive the borrow of the worker itself.
    pub fn notifier(&self) -> Notifier {
        Notifier(self.state.clone())
    }

    /// Stop the loop and await the step in flight. Idempotent.
    pub async fn stop(&self) {
        if !self.state.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.state.notify.notify_one();
        let handle = self.handle.lock().expect("handle lock poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

/// Cloneable wake handle for a [`Worker`]. No-ops once the worker stops.
#[derive(Clone)]
pub(crate) struct Notifier(Arc<WorkerState>);

impl Notifier {
    pub fn notify(&self) {
        if self.0.running.load(Ordering::SeqCst) {
            self.0.notify.notify_one();
        }
    }
}

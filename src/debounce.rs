//! Coalesces bursts of notifications.
//!
//! Every call records the latest argument and resets the idle timer; the
//! first call of a burst arms the max-wait timer. The wrapped function fires
//! when either timer elapses, always with the most recent argument, and both
//! timers reset together.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

pub(crate) struct Debounced<T> {
    tx: mpsc::UnboundedSender<T>,
    handle: JoinHandle<()>,
}

impl<T: Send + 'static> Debounced<T> {
    pub fn new<F>(mut f: F, idle: Duration, max: Duration) -> Self
    where
        F: FnMut(T) + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<T>();

        let handle = tokio::spawn(async move {
            loop {
                // wait for the first call of a burst
                let Some(mut latest) = rx.recv().await else {
                    return;
                };

                let max_deadline = Instant::now() + max;
                loop {
                    let deadline = (Instant::now() + idle).min(max_deadline);
                    tokio::select! {
                        received = rx.recv() => match received {
                            Some(value) => latest = value,
                            None => {
                                // sender gone mid-burst: deliver the pending call
                                f(latest);
                                return;
                            }
                        },
                        _ = sleep_until(deadline) => {
                            f(latest);
                            break;
                        }
                    }
                }
            }
        });

        Self { tx, handle }
    }

    pub fn call(&self, value: T) {
        // receiver only goes away when the debouncer is dropped
        let _ = self.tx.send(value);
    }

    /// A detached caller feeding the same window. Calls after the owning
    /// [`Debounced`] is dropped are silently discarded.
    pub fn handle(&self) -> DebouncedHandle<T> {
        DebouncedHandle {
            tx: self.tx.clone(),
        }
    }
}

pub(crate) struct DebouncedHandle<T> {
    tx: mpsc::UnboundedSender<T>,
}

impl<T> Clone for DebouncedHandle<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> DebouncedHandle<T> {
    pub fn call(&self, value: T) {
        let _ = self.tx.send(value);
    }
}

impl<T> Drop for Debounced<T> {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

//! Time-and-size window accumulator for task resolutions.
//!
//! Items accumulate until either `max_size` is reached (the full buffer is
//! drained) or `max_time` has elapsed since the first queued item. Flushes
//! are serialized; items added while a flush is in flight land in the next
//! window. `flush()` drains everything pending for graceful shutdown.

use std::future::Future;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

/// An accumulated item, stamped with the time it spent queued.
#[derive(Debug, Clone)]
pub(crate) struct BatchItem<T> {
    pub item: T,
    /// Milliseconds between enqueue and flush.
    pub delta_ms: u64,
}

enum Command<T> {
    Add(T, Instant),
    Flush(oneshot::Sender<()>),
}

pub(crate) struct Batcher<T> {
    tx: mpsc::UnboundedSender<Command<T>>,
    handle: JoinHandle<()>,
}

impl<T: Send + 'static> Batcher<T> {
    pub fn new<F, Fut>(mut flush_batch: F, max_size: usize, max_time: Duration) -> Self
    where
        F: FnMut(Vec<BatchItem<T>>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Command<T>>();

        let handle = tokio::spawn(async move {
            let mut buf: Vec<(T, Instant)> = Vec::new();

            loop {
                let Some(command) = rx.recv().await else {
                    // batcher dropped: deliver whatever is left
                    if !buf.is_empty() {
                        flush_batch(Self::stamp(std::mem::take(&mut buf))).await;
                    }
                    return;
                };

                match command {
                    Command::Flush(ack) => {
                        let acks = Self::drain_pending(&mut rx, &mut buf, ack);
                        if !buf.is_empty() {
                            flush_batch(Self::stamp(std::mem::take(&mut buf))).await;
                        }
                        for ack in acks {
                            let _ = ack.send(());
                        }
                    }
                    Command::Add(item, at) => {
                        buf.push((item, at));
                        // first item opens the window
                        let deadline = at + max_time;
                        loop {
                            if buf.len() >= max_size {
                                flush_batch(Self::stamp(std::mem::take(&mut buf))).await;
                                break;
                            }
                            tokio::select! {
                                command = rx.recv() => match command {
                                    Some(Command::Add(item, at)) => buf.push((item, at)),
                                    Some(Command::Flush(ack)) => {
                                        let acks = Self::drain_pending(&mut rx, &mut buf, ack);
                                        flush_batch(Self::stamp(std::mem::take(&mut buf))).await;
                                        for ack in acks {
                                            let _ = ack.send(());
                                        }
                                        break;
                                    }
                                    None => {
                                        flush_batch(Self::stamp(std::mem::take(&mut buf))).await;
                                        return;
                                    }
                                },
                                _ = sleep_until(deadline) => {
                                    flush_batch(Self::stamp(std::mem::take(&mut buf))).await;
                                    break;
                                }
                            }
                        }
                    }
                }
            }
        });

        Self { tx, handle }
    }

    /// Queue an item into the current (or next) window.
    pub fn add(&self, item: T) {
        let _ = self.tx.send(Command::Add(item, Instant::now()));
    }

    /// Drain all pending items, returning once they have been handed to the
    /// flush function.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Command::Flush(ack_tx)).is_err() {
            return;
        }
        let _ = ack_rx.await;
    }

    fn stamp(buf: Vec<(T, Instant)>) -> Vec<BatchItem<T>> {
        let now = Instant::now();
        buf.into_iter()
            .map(|(item, at)| BatchItem {
                item,
                delta_ms: now.saturating_duration_since(at).as_millis() as u64,
            })
            .collect()
    }

    /// Pull everything already sitting in the channel so an explicit flush
    /// observes all prior `add` calls. Returns every flush ack encountered.
    fn drain_pending(
        rx: &mut mpsc::UnboundedReceiver<Command<T>>,
        buf: &mut Vec<(T, Instant)>,
        first_ack: oneshot::Sender<()>,
    ) -> Vec<oneshot::Sender<()>> {
        let mut acks = vec![first_ack];
        while let Ok(command) = rx.try_recv() {
            match command {
                Command::Add(item, at) => buf.push((item, at)),
                Command::Flush(ack) => acks.push(ack),
            }
        }
        acks
    }
}

impl<T> Drop for Batcher<T> {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

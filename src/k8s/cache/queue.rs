/**
 * Event dispatch queue
 *
 * Serializes the events of every mirror into one processing stream with a
 * single consumer. A task whose handler chain fails is pushed back after a
 * fixed delay, without blocking the tasks behind it, and is retried until it
 * succeeds or the queue is stopped.
 *
 * Ordering is FIFO across all resource kinds, but a retried task rejoins at
 * the back: fresher events for the same object may be processed before it.
 */
use super::chain::ChainHandler;
use super::config::RETRY_DELAY_SECONDS;
use super::mirror::key_func;
use crate::error::Result;
use crate::model::Event;
use kube::{Resource, ResourceExt};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type Apply = Arc<dyn Fn(Event) -> Result<()> + Send + Sync>;

/// One queued unit of work: an object, the event observed on it and the chain to run
#[derive(Clone)]
pub struct Task {
    key: String,
    event: Event,
    attempt: u32,
    apply: Apply,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("key", &self.key)
            .field("event", &self.event)
            .field("attempt", &self.attempt)
            .finish_non_exhaustive()
    }
}

impl Task {
    #[must_use]
    pub fn new<K>(chain: Arc<ChainHandler<K>>, obj: Arc<K>, event: Event) -> Self
    where
        K: Resource + Send + Sync + 'static,
        <K as Resource>::DynamicType: Default,
    {
        let key = format!(
            "{}/{}",
            K::kind(&K::DynamicType::default()),
            key_func(&obj.name_any(), &obj.namespace().unwrap_or_default())
        );
        Self {
            key,
            event,
            attempt: 0,
            apply: Arc::new(move |event| chain.apply(&obj, event)),
        }
    }

    /// A task running an arbitrary closure, keyed for logging only
    #[cfg(test)]
    pub(crate) fn from_fn<F>(key: &str, event: Event, f: F) -> Self
    where
        F: Fn(Event) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            key: key.to_string(),
            event,
            attempt: 0,
            apply: Arc::new(f),
        }
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[must_use]
    pub const fn event(&self) -> Event {
        self.event
    }

    fn run(&self) -> Result<()> {
        (self.apply)(self.event)
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    pub succeeded: u64,
    pub retried: u64,
}

#[derive(Debug, Default)]
struct Counters {
    succeeded: AtomicU64,
    retried: AtomicU64,
}

pub struct Queue {
    tx: mpsc::UnboundedSender<Task>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Task>>>,
    retry_delay: Duration,
    counters: Arc<Counters>,
}

impl Default for Queue {
    fn default() -> Self {
        Self::new(Duration::from_secs(RETRY_DELAY_SECONDS))
    }
}

impl Queue {
    #[must_use]
    pub fn new(retry_delay: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            retry_delay,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Enqueue without blocking; safe from any number of producers
    pub fn push(&self, task: Task) {
        if let Err(e) = self.tx.send(task) {
            debug!("Dispatch queue stopped, dropping task {}", e.0.key);
        }
    }

    /// Process tasks until `cancel` fires. Only one consumer may run at a time.
    pub async fn run(&self, cancel: CancellationToken) {
        let Some(mut rx) = self.rx.lock().await.take() else {
            warn!("Dispatch queue is already running, ignoring second consumer");
            return;
        };

        info!("📡 Dispatch queue started (retry delay {:?})", self.retry_delay);

        loop {
            let task = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                task = rx.recv() => match task {
                    Some(task) => task,
                    None => break,
                },
            };

            match task.run() {
                Ok(()) => {
                    self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
                    debug!("✅ Task {} ({}) done after {} attempt(s)", task.key, task.event, task.attempt + 1);
                }
                Err(e) => {
                    if e.is_transient() {
                        debug!("⏳ Task {} ({}) deferred: {}", task.key, task.event, e);
                    } else {
                        warn!(
                            "🔄 Task {} ({}) failed on attempt {}: {}, retrying in {:?}",
                            task.key,
                            task.event,
                            task.attempt + 1,
                            e,
                            self.retry_delay
                        );
                    }
                    self.counters.retried.fetch_add(1, Ordering::Relaxed);
                    self.requeue(task, cancel.clone());
                }
            }
        }

        // Hand the receiver back so tasks pushed meanwhile survive a restart
        *self.rx.lock().await = Some(rx);
        info!("📡 Dispatch queue stopped");
    }

    fn requeue(&self, mut task: Task, cancel: CancellationToken) {
        task.attempt += 1;
        let tx = self.tx.clone();
        let delay = self.retry_delay;
        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                () = sleep(delay) => {
                    let _ = tx.send(task);
                }
            }
        });
    }

    #[must_use]
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            retried: self.counters.retried.load(Ordering::Relaxed),
        }
    }
}

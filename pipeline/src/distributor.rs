use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt};
use motion_relay_common::config::DistributorConfig;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Errors surfaced by the upstream sequence a distributor pulls from.
pub type SourceError = Box<dyn std::error::Error + Send + Sync>;

type SourceFactory<T> = dyn Fn() -> BoxStream<'static, Result<T, SourceError>> + Send + Sync;

#[derive(Debug, thiserror::Error)]
pub enum DistributorError {
    /// The producer worker died (source error or exhaustion). Blocked
    /// consumers receive this instead of hanging.
    #[error("producer worker failed: {0}")]
    ProducerFailed(Arc<str>),
}

/// Producer worker lifecycle, broadcast over a watch channel so registration
/// barriers and blocked receivers both observe transitions.
#[derive(Debug, Clone)]
enum Lifecycle {
    /// No worker running: initial state, or stopped after idle timeout.
    Stopped,
    /// Worker running, first value not yet published.
    Warming,
    /// Worker running and at least one value published.
    Publishing,
    /// Worker died; consumers see the reason.
    Failed(Arc<str>),
}

/// Per-consumer registration record.
struct ConsumerSlot {
    id: u64,
    /// Set when a fresh value awaits this consumer, cleared on consumption.
    ready: AtomicBool,
    notify: Notify,
    /// When `ready` last went from clear to set; drives dead-consumer pruning.
    last_signaled: Mutex<Instant>,
    /// Set once the worker has unregistered this consumer as dead.
    pruned: AtomicBool,
}

struct Registry<T> {
    /// The latest published value. Replaced wholesale on publish, never
    /// mutated, so consumers can hold the previous `Arc` safely.
    latest: Option<Arc<T>>,
    slots: Vec<Arc<ConsumerSlot>>,
    next_slot_id: u64,
    worker_running: bool,
}

struct Inner<T> {
    registry: Mutex<Registry<T>>,
    lifecycle: watch::Sender<Lifecycle>,
    /// Last time any consumer registered or asked for a value.
    last_access: Mutex<Instant>,
    dead_consumer_timeout: Duration,
    idle_timeout: Option<Duration>,
    source_factory: Box<SourceFactory<T>>,
}

/// Single-producer, multi-consumer latest-value broadcaster.
///
/// One background worker pulls from the source and republishes each value to
/// every registered consumer; a consumer that falls behind skips straight to
/// the newest value rather than queueing history. The worker starts on the
/// first registration and, if an idle timeout is configured, stops itself
/// when nobody has asked for a value in that long. The source factory is
/// invoked afresh on every start, and the worker drops the stream on every
/// exit path, so a stopped distributor holds no acquisition resources.
pub struct Distributor<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Distributor<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// A registered consumer's handle. Dropping it unregisters the consumer.
pub struct Receiver<T> {
    inner: Arc<Inner<T>>,
    slot: Arc<ConsumerSlot>,
}

impl<T> std::fmt::Debug for Receiver<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Receiver").finish_non_exhaustive()
    }
}

impl<T: Send + Sync + 'static> Distributor<T> {
    pub fn new<F, S>(config: &DistributorConfig, source_factory: F) -> Self
    where
        F: Fn() -> S + Send + Sync + 'static,
        S: Stream<Item = Result<T, SourceError>> + Send + 'static,
    {
        let (lifecycle, _) = watch::channel(Lifecycle::Stopped);
        Self {
            inner: Arc::new(Inner {
                registry: Mutex::new(Registry {
                    latest: None,
                    slots: Vec::new(),
                    next_slot_id: 0,
                    worker_running: false,
                }),
                lifecycle,
                last_access: Mutex::new(Instant::now()),
                dead_consumer_timeout: config.dead_consumer_timeout(),
                idle_timeout: config.idle_timeout(),
                source_factory: Box::new(move || source_factory().boxed()),
            }),
        }
    }

    /// Register a new consumer.
    ///
    /// Starts the producer worker if none is running (including after a
    /// previous failure) and blocks until the first value has been
    /// published, so the very first registration pays the warm-up cost for
    /// everyone who joins right after it.
    pub async fn register(&self) -> Result<Receiver<T>, DistributorError> {
        self.inner.touch();
        let slot = self.inner.add_slot();
        self.inner.ensure_worker(true);

        let mut lifecycle = self.inner.lifecycle.subscribe();
        loop {
            let state = {
                let Ok(state) = lifecycle
                    .wait_for(|state| !matches!(state, Lifecycle::Warming))
                    .await
                else {
                    self.inner.remove_slot(slot.id);
                    return Err(DistributorError::ProducerFailed(Arc::from(
                        "distributor dropped",
                    )));
                };
                state.clone()
            };
            match state {
                Lifecycle::Publishing => {
                    return Ok(Receiver {
                        inner: Arc::clone(&self.inner),
                        slot,
                    });
                }
                Lifecycle::Failed(reason) => {
                    self.inner.remove_slot(slot.id);
                    return Err(DistributorError::ProducerFailed(reason));
                }
                // The worker idle-stopped between our start and the first
                // publish; start it again.
                Lifecycle::Stopped => self.inner.ensure_worker(true),
                Lifecycle::Warming => unreachable!("wait_for excludes Warming"),
            }
        }
    }

    /// Number of currently registered consumers.
    pub fn consumer_count(&self) -> usize {
        self.inner.registry.lock().unwrap().slots.len()
    }
}

impl<T: Send + Sync + 'static> Receiver<T> {
    /// Wait for the next published value and return it.
    ///
    /// Returns the value current at the time of the wake-up, which may skip
    /// arbitrarily many intermediate publishes if this consumer is slower
    /// than the producer. Never hangs on a dead producer: a failed worker
    /// surfaces as `ProducerFailed`, and a worker that idle-stopped is
    /// restarted. Cancel-safe; dropping the future consumes nothing.
    pub async fn latest(&mut self) -> Result<Arc<T>, DistributorError> {
        self.inner.touch();
        let mut lifecycle = self.inner.lifecycle.subscribe();
        loop {
            // The worker may have pruned us while we were away; rejoin.
            if self.slot.pruned.swap(false, Ordering::AcqRel) {
                debug!(consumer = self.slot.id, "re-registering pruned consumer");
                self.inner.re_add_slot(&self.slot);
            }

            if self.slot.ready.swap(false, Ordering::AcqRel) {
                let latest = self.inner.registry.lock().unwrap().latest.clone();
                if let Some(value) = latest {
                    return Ok(value);
                }
                // Signaled but nothing stored: the worker restarted since.
                // Fall through and wait for the next publish.
            }

            let state = lifecycle.borrow_and_update().clone();
            match state {
                Lifecycle::Failed(reason) => {
                    return Err(DistributorError::ProducerFailed(reason));
                }
                Lifecycle::Stopped => {
                    self.inner.ensure_worker(false);
                    continue;
                }
                Lifecycle::Warming | Lifecycle::Publishing => {}
            }

            tokio::select! {
                _ = self.slot.notify.notified() => {}
                changed = lifecycle.changed() => {
                    if changed.is_err() {
                        return Err(DistributorError::ProducerFailed(Arc::from(
                            "distributor dropped",
                        )));
                    }
                }
            }
        }
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        self.inner.remove_slot(self.slot.id);
        debug!(consumer = self.slot.id, "consumer unregistered");
    }
}

impl<T> Inner<T> {
    fn touch(&self) {
        *self.last_access.lock().unwrap() = Instant::now();
    }

    fn add_slot(&self) -> Arc<ConsumerSlot> {
        let mut registry = self.registry.lock().unwrap();
        let slot = Arc::new(ConsumerSlot {
            id: registry.next_slot_id,
            ready: AtomicBool::new(false),
            notify: Notify::new(),
            last_signaled: Mutex::new(Instant::now()),
            pruned: AtomicBool::new(false),
        });
        registry.next_slot_id += 1;
        registry.slots.push(Arc::clone(&slot));
        debug!(consumer = slot.id, total = registry.slots.len(), "consumer registered");
        slot
    }

    fn re_add_slot(&self, slot: &Arc<ConsumerSlot>) {
        let mut registry = self.registry.lock().unwrap();
        if registry.slots.iter().any(|s| s.id == slot.id) {
            return;
        }
        slot.ready.store(false, Ordering::Release);
        *slot.last_signaled.lock().unwrap() = Instant::now();
        registry.slots.push(Arc::clone(slot));
    }

    fn remove_slot(&self, id: u64) {
        let mut registry = self.registry.lock().unwrap();
        registry.slots.retain(|slot| slot.id != id);
    }
}

impl<T: Send + Sync + 'static> Inner<T> {
    /// Start the producer worker unless one is already running. `restart_failed`
    /// lets a fresh registration retry after a failure, while plain polls keep
    /// observing the failure.
    fn ensure_worker(self: &Arc<Self>, restart_failed: bool) {
        let mut registry = self.registry.lock().unwrap();
        if registry.worker_running {
            return;
        }
        let failed = matches!(&*self.lifecycle.borrow(), Lifecycle::Failed(_));
        if failed && !restart_failed {
            return;
        }
        registry.worker_running = true;
        registry.latest = None;
        drop(registry);

        self.lifecycle.send_replace(Lifecycle::Warming);
        info!("starting producer worker");
        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.run_worker().await });
    }

    async fn run_worker(self: Arc<Self>) {
        let mut source = (self.source_factory)();
        debug!("producer worker pulling from source");
        loop {
            match source.next().await {
                Some(Ok(value)) => self.publish(value),
                Some(Err(e)) => {
                    self.fail(format!("source error: {e}"));
                    return;
                }
                None => {
                    self.fail("source ended".to_string());
                    return;
                }
            }

            if let Some(idle_timeout) = self.idle_timeout {
                let idle_for = self.last_access.lock().unwrap().elapsed();
                if idle_for > idle_timeout {
                    self.stop(idle_for);
                    // Returning drops `source` and with it whatever the
                    // stream holds open.
                    return;
                }
            }
        }
    }

    fn publish(&self, value: T) {
        let now = Instant::now();
        let timeout = self.dead_consumer_timeout;
        let mut registry = self.registry.lock().unwrap();
        registry.latest = Some(Arc::new(value));
        registry.slots.retain(|slot| {
            if !slot.ready.swap(true, Ordering::AcqRel) {
                *slot.last_signaled.lock().unwrap() = now;
                slot.notify.notify_one();
                return true;
            }
            // Signal still set from an earlier publish: the consumer has
            // not come back for it. Past the timeout it is assumed gone.
            let stale_for = now.duration_since(*slot.last_signaled.lock().unwrap());
            if stale_for > timeout {
                warn!(consumer = slot.id, ?stale_for, "unregistering dead consumer");
                slot.pruned.store(true, Ordering::Release);
                false
            } else {
                true
            }
        });
        drop(registry);

        self.lifecycle.send_if_modified(|state| {
            if matches!(state, Lifecycle::Warming) {
                *state = Lifecycle::Publishing;
                true
            } else {
                false
            }
        });
    }

    fn fail(&self, reason: String) {
        error!(reason = %reason, "producer worker failed, releasing consumers");
        let reason: Arc<str> = Arc::from(reason.as_str());
        let slots = {
            let mut registry = self.registry.lock().unwrap();
            registry.worker_running = false;
            registry.slots.clone()
        };
        self.lifecycle.send_replace(Lifecycle::Failed(reason));
        // notify_one stores a permit when nobody is waiting yet, so a
        // consumer racing into its wait still wakes and sees the failure.
        for slot in slots {
            slot.notify.notify_one();
        }
    }

    fn stop(&self, idle_for: Duration) {
        info!(?idle_for, "no consumer activity, stopping producer worker");
        {
            let mut registry = self.registry.lock().unwrap();
            registry.worker_running = false;
        }
        self.lifecycle.send_replace(Lifecycle::Stopped);
    }
}

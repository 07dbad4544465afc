//! Keyed event loop - delivers watch events to the dispatcher.
//!
//! Each resource identity gets its own worker task fed by a bounded channel,
//! so events for one identity are handled strictly in arrival order while
//! different identities proceed concurrently. Workers that have drained
//! their queue are reaped periodically.
//!
//! The router never waits on a worker. When an identity's queue is full the
//! newest event is parked in a one-slot cell behind the queue, replacing any
//! event already parked there. Every event carries the full resource state,
//! so only the latest one matters.
//!
//! Requeue policy lives here, not in the dispatcher:
//! - version conflict: re-observe the resource and dispatch the fresh copy
//! - store unavailable / controller failure: retry the same event with
//!   exponential backoff
//!
//! Both are bounded by `max_retries`.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{Mutex, broadcast, mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::{MissedTickBehavior, interval, sleep};
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, error, info, warn};

use crate::dispatcher::{DispatchError, EventDispatcher};
use crate::model::{Action, ResourceKey};
use crate::store::{ResourceLookup, WatchEvent};

/// Event loop settings.
#[derive(Debug, Clone)]
pub struct EventLoopConfig {
    /// Buffered events per identity before later ones are coalesced.
    pub queue_capacity: usize,
    /// Attempts after the first before an event is abandoned.
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// How often drained workers are reaped.
    pub reap_interval: Duration,
}

impl Default for EventLoopConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            max_retries: 5,
            backoff_base: Duration::from_millis(100),
            backoff_cap: Duration::from_secs(10),
            reap_interval: Duration::from_secs(30),
        }
    }
}

impl EventLoopConfig {
    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.backoff_base.saturating_mul(factor).min(self.backoff_cap)
    }
}

/// Counters for a running loop.
#[derive(Debug, Default)]
pub struct LoopStats {
    received: AtomicU64,
    handled: AtomicU64,
    requeued: AtomicU64,
    abandoned: AtomicU64,
    coalesced: AtomicU64,
}

impl LoopStats {
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Events that ended in a successful dispatch.
    pub fn handled(&self) -> u64 {
        self.handled.load(Ordering::Relaxed)
    }

    /// Retries scheduled (re-observations and backoffs).
    pub fn requeued(&self) -> u64 {
        self.requeued.load(Ordering::Relaxed)
    }

    /// Events given up on after exhausting retries.
    pub fn abandoned(&self) -> u64 {
        self.abandoned.load(Ordering::Relaxed)
    }

    /// Events superseded by a newer one for the same identity before a
    /// worker picked them up.
    pub fn coalesced(&self) -> u64 {
        self.coalesced.load(Ordering::Relaxed)
    }
}

/// Newest event for an identity whose queue was full.
type LatestSlot = Arc<Mutex<Option<WatchEvent>>>;

struct WorkerHandle {
    tx: mpsc::Sender<WatchEvent>,
    latest: LatestSlot,
    /// Events routed (queued or parked) but not yet fully processed.
    pending: Arc<AtomicUsize>,
}

/// Shared state cloned into every worker.
#[derive(Clone)]
struct Worker {
    dispatcher: Arc<EventDispatcher>,
    lookup: Arc<dyn ResourceLookup>,
    config: EventLoopConfig,
    stats: Arc<LoopStats>,
}

impl Worker {
    async fn run(
        self,
        key: ResourceKey,
        mut rx: mpsc::Receiver<WatchEvent>,
        latest: LatestSlot,
        pending: Arc<AtomicUsize>,
    ) {
        debug!(%key, "Worker started");
        while let Some(event) = Self::next(&mut rx, &latest).await {
            self.process(event).await;
            pending.fetch_sub(1, Ordering::SeqCst);
        }
        debug!(%key, "Worker stopped");
    }

    /// Queued events first, then the parked one. The parked event is always
    /// newer than anything queued.
    async fn next(rx: &mut mpsc::Receiver<WatchEvent>, latest: &LatestSlot) -> Option<WatchEvent> {
        {
            // The router parks under this lock, so queue and slot are read
            // consistently while it is held.
            let mut parked = latest.lock().await;
            match rx.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Disconnected) => return parked.take(),
                Err(TryRecvError::Empty) => {
                    if let Some(event) = parked.take() {
                        return Some(event);
                    }
                }
            }
        }
        match rx.recv().await {
            Some(event) => Some(event),
            None => latest.lock().await.take(),
        }
    }

    async fn process(&self, event: WatchEvent) {
        let WatchEvent {
            mut action,
            mut resource,
        } = event;
        let mut attempt = 0;

        loop {
            // The dispatcher mutates its input; keep `resource` pristine for retries.
            let mut snapshot = resource.clone();
            let err = match self.dispatcher.handle(action, &mut snapshot).await {
                Ok(disposition) => {
                    debug!(resource = %snapshot.identifier(), ?disposition, "Event handled");
                    self.stats.handled.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(err) => err,
            };

            attempt += 1;
            if attempt > self.config.max_retries {
                error!(key = %err.key(), error = %err, attempts = attempt, "Giving up on event");
                self.stats.abandoned.fetch_add(1, Ordering::Relaxed);
                return;
            }
            self.stats.requeued.fetch_add(1, Ordering::Relaxed);

            if err.needs_reobserve() {
                info!(key = %err.key(), error = %err, "Re-observing resource after conflict");
                match self.lookup.get(err.key()).await {
                    Ok(Some(latest)) => {
                        action = Action::Modified;
                        resource = latest;
                        continue;
                    }
                    Ok(None) => {
                        info!(key = %err.key(), "Resource gone, dropping event");
                        return;
                    }
                    Err(e) => {
                        warn!(key = %err.key(), error = %e, "Failed to re-observe resource");
                    }
                }
            } else {
                warn!(key = %err.key(), error = %err, attempt, "Dispatch failed, retrying");
            }

            if let DispatchError::Controller { source, .. } = &err {
                debug!(error = ?source, "Controller error detail");
            }
            sleep(self.config.backoff(attempt)).await;
        }
    }
}

/// Routes watch events to per-identity workers.
pub struct EventLoop {
    worker: Worker,
}

impl EventLoop {
    pub fn new(
        dispatcher: Arc<EventDispatcher>,
        lookup: Arc<dyn ResourceLookup>,
        config: EventLoopConfig,
    ) -> Self {
        Self {
            worker: Worker {
                dispatcher,
                lookup,
                config,
                stats: Arc::new(LoopStats::default()),
            },
        }
    }

    pub fn stats(&self) -> Arc<LoopStats> {
        Arc::clone(&self.worker.stats)
    }

    /// Consume `events` until the stream ends, then wait for every worker to drain.
    pub async fn run<S>(&self, events: S)
    where
        S: Stream<Item = WatchEvent> + Unpin,
    {
        let mut events = events;
        let mut workers: HashMap<ResourceKey, WorkerHandle> = HashMap::new();
        let mut tasks = JoinSet::new();
        let mut reap = interval(self.worker.config.reap_interval);
        reap.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Event loop started");
        loop {
            tokio::select! {
                next = events.next() => {
                    let Some(event) = next else { break };
                    self.worker.stats.received.fetch_add(1, Ordering::Relaxed);
                    self.route(event, &mut workers, &mut tasks).await;
                }
                _ = reap.tick() => {
                    Self::reap(&mut workers);
                }
                Some(result) = tasks.join_next() => {
                    if let Err(e) = result {
                        error!(error = %e, "Worker task failed");
                    }
                }
            }
        }

        // Dropping the senders lets each worker finish its queue and exit.
        workers.clear();
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Worker task failed");
            }
        }
        info!(
            received = self.worker.stats.received(),
            handled = self.worker.stats.handled(),
            abandoned = self.worker.stats.abandoned(),
            "Event loop stopped"
        );
    }

    async fn route(
        &self,
        event: WatchEvent,
        workers: &mut HashMap<ResourceKey, WorkerHandle>,
        tasks: &mut JoinSet<()>,
    ) {
        let key = event.key();
        let handle = workers.entry(key.clone()).or_insert_with(|| {
            let (tx, rx) = mpsc::channel(self.worker.config.queue_capacity.max(1));
            let latest = LatestSlot::default();
            let pending = Arc::new(AtomicUsize::new(0));
            tasks.spawn(self.worker.clone().run(
                key.clone(),
                rx,
                Arc::clone(&latest),
                Arc::clone(&pending),
            ));
            WorkerHandle { tx, latest, pending }
        });

        let worker_gone = {
            let mut latest = handle.latest.lock().await;
            if latest.is_some() {
                // Once an event is parked, later ones must not overtake it
                // through the queue.
                if event.action == Action::Error {
                    debug!(%key, "Dropping error event behind a parked event");
                } else {
                    debug!(%key, "Replacing parked event with a newer one");
                    *latest = Some(event);
                }
                self.worker.stats.coalesced.fetch_add(1, Ordering::Relaxed);
                return;
            }

            handle.pending.fetch_add(1, Ordering::SeqCst);
            match handle.tx.try_send(event) {
                Ok(()) => false,
                Err(TrySendError::Full(event)) => {
                    debug!(%key, "Worker queue full, parking event");
                    *latest = Some(event);
                    false
                }
                Err(TrySendError::Closed(_)) => {
                    handle.pending.fetch_sub(1, Ordering::SeqCst);
                    true
                }
            }
        };

        if worker_gone {
            // Only happens if the worker panicked.
            error!(%key, "Worker for resource is gone, dropping event");
            workers.remove(&key);
        }
    }

    /// Drop workers with nothing in flight. Only this loop adds work, so a zero
    /// count cannot race with a send.
    fn reap(workers: &mut HashMap<ResourceKey, WorkerHandle>) {
        let before = workers.len();
        workers.retain(|_, w| w.pending.load(Ordering::SeqCst) > 0);
        let reaped = before - workers.len();
        if reaped > 0 {
            debug!(reaped, active = workers.len(), "Reaped idle workers");
        }
    }
}

/// Forward store watch events into `tx` until `shutdown` fires, the store
/// closes its channel, or the consumer goes away.
pub async fn forward_watch(
    mut watch: broadcast::Receiver<WatchEvent>,
    tx: mpsc::Sender<WatchEvent>,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            received = watch.recv() => match received {
                Ok(event) => {
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Watch lagged, events lost until next change");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
    debug!("Watch forwarder stopped");
}

//! Controller host - wires a controller to the in-memory store.
//!
//! The host subscribes to the store before seeding it, so the initial
//! resources arrive as ADDED events like any later change. It then waits for
//! the store to go quiet, requests the configured deletions, waits again and
//! shuts the event loop down.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use opkit_core::{
    Controller, DeleteOutcome, DispatchObserver, DispatcherConfig, EventDispatcher, EventLoop,
    EventLoopConfig, LoopStats, MemoryStore, ResourceInstance, ResourceKey, ResourceLookup,
    StoreError, WatchEvent, forward_watch,
};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::timeout;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::manifest::DEFAULT_NAMESPACE;

/// A `namespace/name` (or bare `name`) deletion request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteTarget {
    pub namespace: String,
    pub name: String,
}

impl DeleteTarget {
    pub fn key(&self, kind: &str) -> ResourceKey {
        ResourceKey::new(kind, &self.namespace, &self.name)
    }
}

impl FromStr for DeleteTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (namespace, name) = match s.split_once('/') {
            Some((namespace, name)) => (namespace, name),
            None => (DEFAULT_NAMESPACE, s),
        };
        if namespace.is_empty() || name.is_empty() || name.contains('/') {
            return Err(format!("expected <namespace>/<name> or <name>, got '{s}'"));
        }
        Ok(Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        })
    }
}

impl fmt::Display for DeleteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Host settings.
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub kind: String,
    pub dispatcher: DispatcherConfig,
    pub event_loop: EventLoopConfig,
    /// Watch events buffered per subscriber.
    pub watch_capacity: usize,
    /// How long the store must stay unchanged before the host moves on.
    pub idle_timeout: Duration,
    pub deletions: Vec<DeleteTarget>,
}

/// What a completed run left behind.
#[derive(Debug)]
pub struct HostReport {
    pub stats: Arc<LoopStats>,
    pub resources: Vec<ResourceInstance>,
}

pub struct ControllerHost {
    store: Arc<MemoryStore>,
    controller: Arc<dyn Controller>,
    observer: Arc<dyn DispatchObserver>,
    config: HostConfig,
}

impl ControllerHost {
    pub fn new(
        controller: Arc<dyn Controller>,
        observer: Arc<dyn DispatchObserver>,
        config: HostConfig,
    ) -> Self {
        Self {
            store: Arc::new(MemoryStore::new(config.watch_capacity)),
            controller,
            observer,
            config,
        }
    }

    pub fn store(&self) -> Arc<MemoryStore> {
        Arc::clone(&self.store)
    }

    /// Seed the store, drive the controller until the store settles, apply
    /// deletions and settle again.
    pub async fn run(&self, seed: Vec<ResourceInstance>) -> Result<HostReport> {
        let mut quiet = self.store.subscribe();

        let (tx, rx) = mpsc::channel::<WatchEvent>(self.config.watch_capacity.max(1));
        let (stop_tx, stop_rx) = oneshot::channel();
        let forwarder = tokio::spawn(forward_watch(self.store.subscribe(), tx, stop_rx));

        let dispatcher = Arc::new(EventDispatcher::new(
            Arc::clone(&self.controller),
            self.store.clone(),
            Arc::clone(&self.observer),
            self.config.dispatcher.clone(),
        ));
        let event_loop = EventLoop::new(
            dispatcher,
            self.store.clone() as Arc<dyn ResourceLookup>,
            self.config.event_loop.clone(),
        );
        let stats = event_loop.stats();
        let loop_handle = tokio::spawn(async move {
            event_loop.run(ReceiverStream::new(rx)).await;
        });

        self.seed(seed).await?;
        self.wait_quiet(&mut quiet, "initial sync").await;

        if !self.config.deletions.is_empty() {
            self.request_deletions().await;
            self.wait_quiet(&mut quiet, "deletions").await;
        }

        let _ = stop_tx.send(());
        forwarder.await.context("Watch forwarder task failed")?;
        loop_handle.await.context("Event loop task failed")?;

        Ok(HostReport {
            stats,
            resources: self.store.list().await,
        })
    }

    async fn seed(&self, seed: Vec<ResourceInstance>) -> Result<()> {
        let total = seed.len();
        for resource in seed {
            let identifier = resource.identifier();
            match self.store.create(resource).await {
                Ok(created) => debug!(resource = %created.identifier(), "Seeded resource"),
                Err(StoreError::AlreadyExists(key)) => {
                    warn!(%key, "Duplicate resource in manifest, skipping");
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to seed {identifier}"));
                }
            }
        }
        info!(total, kind = %self.config.kind, "Store seeded");
        Ok(())
    }

    async fn request_deletions(&self) {
        for target in &self.config.deletions {
            let key = target.key(&self.config.kind);
            match self.store.delete(&key).await {
                Ok(DeleteOutcome::MarkedForDeletion(r)) => {
                    info!(resource = %r.identifier(), finalizers = ?r.finalizers(), "Marked for deletion");
                }
                Ok(DeleteOutcome::Removed(_)) => info!(%key, "Removed"),
                Err(e) => warn!(%key, error = %e, "Delete request failed"),
            }
        }
    }

    /// Return once no store change was seen for `idle_timeout`.
    async fn wait_quiet(&self, changes: &mut broadcast::Receiver<WatchEvent>, phase: &str) {
        let mut seen = 0u64;
        loop {
            match timeout(self.config.idle_timeout, changes.recv()).await {
                Ok(Ok(_)) => seen += 1,
                Ok(Err(RecvError::Lagged(skipped))) => seen += skipped,
                Ok(Err(RecvError::Closed)) | Err(_) => break,
            }
        }
        info!(phase, changes = seen, "Store settled");
    }
}

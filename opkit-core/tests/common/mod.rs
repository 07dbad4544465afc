//! Shared test utilities for opkit-core integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use opkit_core::{
    Controller, DispatcherConfig, EventDispatcher, EventLoop, EventLoopConfig, LoopStats,
    MemoryStore, NoopObserver, ResourceInstance, ResourceKey, ResourceLookup, forward_watch,
};
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

pub const KIND: &str = "Widget";

pub fn widget(name: &str, size: u64) -> ResourceInstance {
    ResourceInstance::new(KIND, "default", name).with_spec(json!({ "size": size }))
}

pub fn key(name: &str) -> ResourceKey {
    ResourceKey::new(KIND, "default", name)
}

/// Mirrors `spec` into `status` and reports `Ready`. Cleanup always completes.
#[derive(Default)]
pub struct StatusController {
    pub deleted: Mutex<Vec<String>>,
    pub updates: AtomicUsize,
}

impl StatusController {
    pub fn desired_status(resource: &ResourceInstance) -> serde_json::Value {
        json!({ "phase": "Ready", "observed": resource.spec })
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }
}

#[async_trait]
impl Controller for StatusController {
    async fn create_or_update(&self, resource: &ResourceInstance) -> Result<Option<ResourceInstance>> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        let desired = Self::desired_status(resource);
        if resource.status.as_ref() == Some(&desired) {
            return Ok(None);
        }
        let mut updated = resource.clone();
        updated.status = Some(desired);
        Ok(Some(updated))
    }

    async fn delete(&self, resource: &ResourceInstance) -> Result<bool> {
        self.deleted.lock().unwrap().push(resource.name().to_string());
        Ok(true)
    }
}

/// Sleeps in every call and records whether two calls for one identity overlapped.
#[derive(Default)]
pub struct OverlapController {
    in_flight: Mutex<HashSet<ResourceKey>>,
    pub overlaps: AtomicUsize,
    pub max_concurrent: AtomicUsize,
    pub calls: AtomicUsize,
}

impl OverlapController {
    async fn enter(&self, resource: &ResourceInstance) {
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            if !in_flight.insert(resource.key()) {
                self.overlaps.fetch_add(1, Ordering::SeqCst);
            }
            self.max_concurrent.fetch_max(in_flight.len(), Ordering::SeqCst);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.in_flight.lock().unwrap().remove(&resource.key());
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Controller for OverlapController {
    async fn create_or_update(&self, resource: &ResourceInstance) -> Result<Option<ResourceInstance>> {
        self.enter(resource).await;
        Ok(None)
    }

    async fn delete(&self, resource: &ResourceInstance) -> Result<bool> {
        self.enter(resource).await;
        Ok(true)
    }
}

pub fn fast_config() -> EventLoopConfig {
    EventLoopConfig {
        queue_capacity: 16,
        max_retries: 10,
        backoff_base: Duration::from_millis(10),
        backoff_cap: Duration::from_millis(20),
        reap_interval: Duration::from_millis(50),
    }
}

pub fn dispatcher(controller: Arc<dyn Controller>, store: Arc<MemoryStore>) -> Arc<EventDispatcher> {
    Arc::new(EventDispatcher::new(
        controller,
        store,
        Arc::new(NoopObserver),
        DispatcherConfig::default(),
    ))
}

/// A running event loop fed by the store's watch channel.
pub struct TestLoop {
    pub store: Arc<MemoryStore>,
    pub stats: Arc<LoopStats>,
    shutdown_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl TestLoop {
    pub fn spawn(controller: Arc<dyn Controller>, store: Arc<MemoryStore>) -> Self {
        let event_loop = EventLoop::new(
            dispatcher(controller, store.clone()),
            store.clone() as Arc<dyn ResourceLookup>,
            fast_config(),
        );
        let stats = event_loop.stats();

        let (tx, rx) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        tokio::spawn(forward_watch(store.subscribe(), tx, shutdown_rx));
        let handle = tokio::spawn(async move {
            event_loop.run(ReceiverStream::new(rx)).await;
        });

        Self {
            store,
            stats,
            shutdown_tx,
            handle,
        }
    }

    /// Stop watching and wait for every queued event to be handled.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("event loop did not stop")
            .expect("event loop panicked");
    }
}

/// Poll the store until `pred` holds for the resource (or its absence).
pub async fn wait_for<F>(store: &MemoryStore, key: &ResourceKey, pred: F) -> Option<ResourceInstance>
where
    F: Fn(Option<&ResourceInstance>) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let current = store.get(key).await.unwrap();
        if pred(current.as_ref()) {
            return current;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("condition not reached for {key}, last seen: {current:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

//! Shared helpers for the engine integration tests.

#![allow(dead_code)]

use datasync_engine::{MockApi, SyncConfig, SyncEngine, SyncEvent};
use datasync_protocol::{AnyModel, MutationSync, SyncMetadata};
use datasync_storage::InMemoryStorage;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing_subscriber::EnvFilter;

pub const TIMEOUT: Duration = Duration::from_secs(10);

/// Installs a test subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

pub struct Harness {
    pub storage: Arc<InMemoryStorage>,
    pub api: Arc<MockApi>,
    pub engine: Arc<SyncEngine>,
    pub events: UnboundedReceiver<SyncEvent>,
}

pub fn harness(config: SyncConfig) -> Harness {
    harness_with(config, Arc::new(InMemoryStorage::new()), Arc::new(MockApi::new()))
}

pub fn harness_with(config: SyncConfig, storage: Arc<InMemoryStorage>, api: Arc<MockApi>) -> Harness {
    init_tracing();
    let engine = Arc::new(SyncEngine::new(config, storage.clone(), api.clone()));
    let events = engine.subscribe();
    Harness {
        storage,
        api,
        engine,
        events,
    }
}

pub fn post(id: &str, title: &str) -> AnyModel {
    AnyModel::new("Post", id, json!({ "id": id, "title": title }))
}

pub fn comment(id: &str, body: &str) -> AnyModel {
    AnyModel::new("Comment", id, json!({ "id": id, "body": body }))
}

pub fn remote(model: AnyModel, version: u32, deleted: bool) -> MutationSync {
    let metadata = SyncMetadata::new(model.model_name.clone(), model.id.clone(), version)
        .with_deleted(deleted);
    MutationSync::new(model, metadata)
}

/// Waits for the next event matching `predicate`, skipping the others.
pub async fn next_matching(
    events: &mut UnboundedReceiver<SyncEvent>,
    predicate: impl Fn(&SyncEvent) -> bool,
) -> SyncEvent {
    tokio::time::timeout(TIMEOUT, async {
        loop {
            let event = events.recv().await.expect("event hub closed");
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for sync event")
}

/// Waits until `count` mutations were acknowledged.
pub async fn processed(events: &mut UnboundedReceiver<SyncEvent>, count: usize) {
    for _ in 0..count {
        next_matching(events, |e| matches!(e, SyncEvent::OutboxMutationProcessed { .. })).await;
    }
}

/// Polls `condition` until it holds.
pub async fn eventually<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(TIMEOUT, async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never held");
}

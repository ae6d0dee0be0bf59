//! Historical sync of one model.

use super::queue::ModelReconciliationQueue;
use crate::api::GraphQLApi;
use crate::config::SyncConfig;
use crate::error::SyncResult;
use chrono::{DateTime, Utc};
use datasync_protocol::{ModelSyncMetadata, SyncQueryRequest};
use datasync_storage::StorageAdapter;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Fetches every page of a model's history and feeds it to its queue.
///
/// A delta sync is requested when the stored checkpoint is younger than the
/// configured sync interval; otherwise the full history is fetched. The
/// checkpoint is advanced to the server's start time once every page has
/// been fetched.
pub(crate) async fn run_initial_sync(
    api: &dyn GraphQLApi,
    storage: &dyn StorageAdapter,
    config: &SyncConfig,
    queue: &Arc<ModelReconciliationQueue>,
) -> SyncResult<usize> {
    let model_name = queue.model_name();
    let checkpoint = storage.model_sync_metadata(model_name).await?;
    let last_sync = checkpoint
        .and_then(|checkpoint| checkpoint.last_sync)
        .filter(|last_sync| is_recent(*last_sync, config.sync_interval));
    debug!(model = %model_name, delta = last_sync.is_some(), "starting initial sync");

    let mut request = SyncQueryRequest::new(model_name, config.sync_page_size, last_sync);
    let mut started_at = None;
    let mut count = 0;
    loop {
        let page = api.sync(request.clone()).await?;
        started_at = started_at.or(page.started_at);
        count += page.items.len();
        for item in page.items {
            queue.enqueue(item);
        }
        match page.next_token {
            Some(token) => request = request.next_page(token),
            None => break,
        }
    }

    storage
        .save_model_sync_metadata(ModelSyncMetadata::new(
            model_name,
            Some(started_at.unwrap_or_else(Utc::now)),
        ))
        .await?;
    info!(model = %model_name, count, "initial sync fetched");
    Ok(count)
}

fn is_recent(last_sync: DateTime<Utc>, interval: Duration) -> bool {
    match chrono::Duration::from_std(interval) {
        Ok(interval) => Utc::now() - last_sync < interval,
        Err(_) => true,
    }
}

//! Remote API abstraction.

use crate::error::{ApiError, ApiResult};
use async_trait::async_trait;
use datasync_protocol::{
    AnyModel, GraphQLError, GraphQLRequest, GraphQLResponse, MutationSync, MutationType,
    PaginatedList, SubscriptionRequest, SyncMetadata, SyncQueryRequest,
};
use futures::channel::mpsc;
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

/// A response to a mutation, before status validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    /// HTTP status code.
    pub status: u16,
    /// Decoded GraphQL body.
    pub body: GraphQLResponse,
}

impl ApiResponse {
    /// A 200 response carrying the acknowledged record.
    pub fn ok(mutation_sync: MutationSync) -> Self {
        Self {
            status: 200,
            body: Ok(mutation_sync),
        }
    }

    /// A 200 response carrying GraphQL errors.
    pub fn errors(errors: Vec<GraphQLError>) -> Self {
        Self {
            status: 200,
            body: Err(errors),
        }
    }
}

/// Connection state of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// The subscription is being established.
    Connecting,
    /// The subscription is live.
    Connected,
    /// The subscription closed.
    Disconnected,
}

/// An item of a subscription stream.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent {
    /// The connection state changed.
    Connection(ConnectionState),
    /// A remote change.
    Data(MutationSync),
    /// The subscription failed and will not produce more items.
    Failed(ApiError),
}

/// Stream of subscription items.
pub type SubscriptionStream = BoxStream<'static, SubscriptionEvent>;

/// The remote GraphQL service.
///
/// This trait abstracts the network layer, allowing for different
/// implementations (AppSync over HTTP and WebSocket, mock for testing, etc.).
#[async_trait]
pub trait GraphQLApi: Send + Sync {
    /// Sends a mutation.
    async fn mutate(&self, request: GraphQLRequest) -> ApiResult<ApiResponse>;

    /// Fetches one page of a historical sync.
    async fn sync(&self, request: SyncQueryRequest) -> ApiResult<PaginatedList>;

    /// Opens a live subscription for one model.
    async fn subscribe(&self, request: SubscriptionRequest) -> ApiResult<SubscriptionStream>;
}

/// An in-memory GraphQL service for testing.
///
/// By default every mutation succeeds and is acknowledged with the next
/// server version of the record. Responses can be scripted, the service can
/// be taken offline, and optimistic version checks can be enabled.
#[derive(Debug, Default)]
pub struct MockApi {
    requests: Mutex<Vec<GraphQLRequest>>,
    scripted: Mutex<VecDeque<ApiResult<ApiResponse>>>,
    records: Mutex<HashMap<(String, String), MutationSync>>,
    latency: Mutex<Duration>,
    offline: AtomicBool,
    version_checks: AtomicBool,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    request_notify: Notify,
    sync_pages: Mutex<HashMap<String, VecDeque<ApiResult<PaginatedList>>>>,
    sync_requests: Mutex<Vec<SyncQueryRequest>>,
    subscriptions: Mutex<HashMap<String, mpsc::UnboundedSender<SubscriptionEvent>>>,
    subscription_failures: Mutex<HashMap<String, ApiError>>,
}

impl MockApi {
    /// Creates a new mock service.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a response for the next mutation.
    pub fn push_response(&self, response: ApiResult<ApiResponse>) {
        self.scripted.lock().push_back(response);
    }

    /// Delays every mutation response.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Makes mutations fail with a retryable network error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Rejects updates and deletes whose version is not the server's.
    pub fn set_version_checks(&self, enabled: bool) {
        self.version_checks.store(enabled, Ordering::SeqCst);
    }

    /// Sets the server copy of a record.
    pub fn seed_record(&self, record: MutationSync) {
        let key = (record.model.model_name.clone(), record.model.id.clone());
        self.records.lock().insert(key, record);
    }

    /// Returns the server copy of a record.
    pub fn record(&self, model_name: &str, id: &str) -> Option<MutationSync> {
        self.records
            .lock()
            .get(&(model_name.to_string(), id.to_string()))
            .cloned()
    }

    /// Returns every mutation received, in arrival order.
    pub fn requests(&self) -> Vec<GraphQLRequest> {
        self.requests.lock().clone()
    }

    /// Returns the number of mutations received.
    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Returns the highest number of mutations that were in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Waits until at least `count` mutations were received.
    pub async fn wait_for_requests(&self, count: usize, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.request_notify.notified();
                if self.request_count() >= count {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok()
    }

    /// Queues a page for the next sync query of `model_name`.
    pub fn push_sync_page(&self, model_name: &str, page: ApiResult<PaginatedList>) {
        self.sync_pages
            .lock()
            .entry(model_name.to_string())
            .or_default()
            .push_back(page);
    }

    /// Returns every sync query received.
    pub fn sync_requests(&self) -> Vec<SyncQueryRequest> {
        self.sync_requests.lock().clone()
    }

    /// Makes the next subscription to `model_name` fail.
    pub fn fail_subscription(&self, model_name: &str, error: ApiError) {
        self.subscription_failures
            .lock()
            .insert(model_name.to_string(), error);
    }

    /// Returns true if `model_name` has an open subscription.
    pub fn has_subscription(&self, model_name: &str) -> bool {
        self.subscriptions
            .lock()
            .get(model_name)
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Pushes an item into the open subscription for `model_name`.
    pub fn emit_subscription(&self, model_name: &str, event: SubscriptionEvent) -> bool {
        self.subscriptions
            .lock()
            .get(model_name)
            .is_some_and(|tx| tx.unbounded_send(event).is_ok())
    }

    /// Ends the subscription for `model_name`.
    pub fn close_subscription(&self, model_name: &str) {
        self.subscriptions.lock().remove(model_name);
    }

    fn acknowledge(&self, request: &GraphQLRequest) -> ApiResponse {
        let (Some(mutation_type), Some(id)) = (request.mutation_type(), request.model_id()) else {
            return ApiResponse::errors(vec![GraphQLError::new("request is not a mutation")]);
        };
        let key = (request.model_name.clone(), id.to_string());
        let mut records = self.records.lock();
        let current = records.get(&key);

        if self.version_checks.load(Ordering::SeqCst) && mutation_type != MutationType::Create {
            if let Some(current) = current {
                if request.version() != Some(current.sync_metadata.version) {
                    let error = GraphQLError::with_error_type("Conflict resolver rejects mutation.", "ConflictUnhandled")
                        .with_data(current.to_graphql_object());
                    return ApiResponse::errors(vec![error]);
                }
            }
        }

        let version = current.map_or(1, |c| c.sync_metadata.version + 1);
        let instance = match (mutation_type, current) {
            (MutationType::Delete, Some(current)) => current.model.instance.clone(),
            _ => {
                let mut input = request.input().cloned().unwrap_or(Value::Null);
                if let Some(object) = input.as_object_mut() {
                    object.remove("_version");
                }
                input
            }
        };
        let acknowledged = MutationSync::new(
            AnyModel::new(request.model_name.clone(), id, instance),
            SyncMetadata::new(request.model_name.clone(), id, version)
                .with_deleted(mutation_type == MutationType::Delete)
                .with_last_changed_at(chrono::Utc::now().timestamp_millis()),
        );
        records.insert(key, acknowledged.clone());
        ApiResponse::ok(acknowledged)
    }
}

#[async_trait]
impl GraphQLApi for MockApi {
    async fn mutate(&self, request: GraphQLRequest) -> ApiResult<ApiResponse> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.requests.lock().push(request.clone());
        self.request_notify.notify_waiters();

        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let scripted = self.scripted.lock().pop_front();
        let result = if let Some(response) = scripted {
            response
        } else if self.offline.load(Ordering::SeqCst) {
            Err(ApiError::network_retryable("service unreachable"))
        } else {
            Ok(self.acknowledge(&request))
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn sync(&self, request: SyncQueryRequest) -> ApiResult<PaginatedList> {
        self.sync_requests.lock().push(request.clone());
        let page = self
            .sync_pages
            .lock()
            .get_mut(&request.model_name)
            .and_then(VecDeque::pop_front);
        page.unwrap_or_else(|| {
            Ok(PaginatedList {
                items: Vec::new(),
                next_token: None,
                started_at: Some(chrono::Utc::now()),
            })
        })
    }

    async fn subscribe(&self, request: SubscriptionRequest) -> ApiResult<SubscriptionStream> {
        if let Some(error) = self.subscription_failures.lock().remove(&request.model_name) {
            return Err(error);
        }
        let (tx, rx) = mpsc::unbounded();
        let _ = tx.unbounded_send(SubscriptionEvent::Connection(ConnectionState::Connecting));
        let _ = tx.unbounded_send(SubscriptionEvent::Connection(ConnectionState::Connected));
        self.subscriptions.lock().insert(request.model_name, tx);
        Ok(rx.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn post(id: &str, title: &str) -> AnyModel {
        AnyModel::new("Post", id, json!({ "id": id, "title": title }))
    }

    #[tokio::test]
    async fn acknowledges_with_increasing_versions() {
        let api = MockApi::new();

        let created = api
            .mutate(GraphQLRequest::create_mutation(&post("1", "a")))
            .await
            .unwrap();
        let created = created.body.unwrap();
        assert_eq!(created.sync_metadata.version, 1);
        assert_eq!(created.model.field("title"), Some(&json!("a")));

        let updated = api
            .mutate(GraphQLRequest::update_mutation(&post("1", "b"), Some(1)))
            .await
            .unwrap()
            .body
            .unwrap();
        assert_eq!(updated.sync_metadata.version, 2);
        assert!(updated.model.field("_version").is_none());

        let deleted = api
            .mutate(GraphQLRequest::delete_mutation(&post("1", "b"), Some(2)))
            .await
            .unwrap()
            .body
            .unwrap();
        assert!(deleted.sync_metadata.deleted);
        assert_eq!(deleted.sync_metadata.version, 3);
        assert_eq!(deleted.model.field("title"), Some(&json!("b")));
        assert_eq!(api.request_count(), 3);
    }

    #[tokio::test]
    async fn version_checks_reject_stale_writes() {
        let api = MockApi::new();
        api.set_version_checks(true);
        api.seed_record(MutationSync::new(
            post("1", "server"),
            SyncMetadata::new("Post", "1", 4),
        ));

        let response = api
            .mutate(GraphQLRequest::update_mutation(&post("1", "local"), Some(2)))
            .await
            .unwrap();
        let errors = response.body.unwrap_err();
        let remote = errors[0].remote_model().unwrap().unwrap();
        assert_eq!(remote.sync_metadata.version, 4);
        assert_eq!(remote.model.field("title"), Some(&json!("server")));
    }

    #[tokio::test]
    async fn scripted_and_offline_responses() {
        let api = MockApi::new();
        api.push_response(Err(ApiError::from_status(500, "boom")));
        api.set_offline(true);

        let first = api.mutate(GraphQLRequest::create_mutation(&post("1", "a"))).await;
        assert_eq!(first.unwrap_err(), ApiError::from_status(500, "boom"));

        let second = api.mutate(GraphQLRequest::create_mutation(&post("1", "a"))).await;
        assert!(second.unwrap_err().is_retryable());
    }

    #[tokio::test]
    async fn subscriptions_report_connection_then_data() {
        let api = MockApi::new();
        let mut stream = api.subscribe(SubscriptionRequest::new("Post")).await.unwrap();
        assert!(api.has_subscription("Post"));

        let remote = MutationSync::new(post("9", "x"), SyncMetadata::new("Post", "9", 1));
        assert!(api.emit_subscription("Post", SubscriptionEvent::Data(remote.clone())));
        api.close_subscription("Post");

        let items: Vec<_> = stream.by_ref().collect().await;
        assert_eq!(
            items,
            vec![
                SubscriptionEvent::Connection(ConnectionState::Connecting),
                SubscriptionEvent::Connection(ConnectionState::Connected),
                SubscriptionEvent::Data(remote),
            ]
        );
    }

    #[tokio::test]
    async fn failed_subscriptions() {
        let api = MockApi::new();
        api.fail_subscription("Post", ApiError::Unauthorized("no".into()));
        let result = api.subscribe(SubscriptionRequest::new("Post")).await;
        assert!(result.is_err());
        // Only the next attempt fails.
        assert!(api.subscribe(SubscriptionRequest::new("Post")).await.is_ok());
    }
}

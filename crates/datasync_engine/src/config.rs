//! Configuration for the sync engine.

use crate::error::SyncError;
use datasync_protocol::{AnyModel, MutationSync};
use rand::Rng;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Callback invoked for errors that cannot be surfaced to a caller.
pub type ErrorHandler = Arc<dyn Fn(&SyncError) + Send + Sync>;

/// Configuration for sync operations.
#[derive(Clone)]
pub struct SyncConfig {
    /// Names of the synced models.
    pub models: Vec<String>,
    /// Per-model predicates restricting which remote records are kept.
    pub sync_expressions: HashMap<String, SyncExpression>,
    /// Resolves conflicts between local and remote state.
    pub conflict_handler: Arc<dyn ConflictHandler>,
    /// Receives errors from background work.
    pub error_handler: ErrorHandler,
    /// Retry configuration for outgoing mutations.
    pub retry: RetryConfig,
    /// Page size for initial sync queries.
    pub sync_page_size: u32,
    /// A stored checkpoint older than this triggers a full sync.
    pub sync_interval: Duration,
}

impl SyncConfig {
    /// Creates a new sync configuration for the given models.
    pub fn new<I, S>(models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            models: models.into_iter().map(Into::into).collect(),
            sync_expressions: HashMap::new(),
            conflict_handler: Arc::new(DefaultConflictHandler),
            error_handler: Arc::new(|error| tracing::error!(%error, "unhandled sync error")),
            retry: RetryConfig::default(),
            sync_page_size: 1000,
            sync_interval: Duration::from_secs(24 * 60 * 60),
        }
    }

    /// Adds a model.
    pub fn with_model(mut self, model_name: impl Into<String>) -> Self {
        self.models.push(model_name.into());
        self
    }

    /// Restricts a model to the records matching `expression`.
    pub fn with_sync_expression(mut self, expression: SyncExpression) -> Self {
        self.sync_expressions
            .insert(expression.model_name.clone(), expression);
        self
    }

    /// Sets the conflict handler.
    pub fn with_conflict_handler(mut self, handler: impl ConflictHandler + 'static) -> Self {
        self.conflict_handler = Arc::new(handler);
        self
    }

    /// Sets the error handler.
    pub fn with_error_handler(
        mut self,
        handler: impl Fn(&SyncError) + Send + Sync + 'static,
    ) -> Self {
        self.error_handler = Arc::new(handler);
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the initial sync page size.
    pub fn with_sync_page_size(mut self, size: u32) -> Self {
        self.sync_page_size = size;
        self
    }

    /// Sets the full sync interval.
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    /// Returns true if a remote record for `model` is within the configured scope.
    pub fn in_scope(&self, model: &AnyModel) -> bool {
        self.sync_expressions
            .get(&model.model_name)
            .map_or(true, |expression| expression.evaluate(model))
    }

    pub(crate) fn report(&self, error: &SyncError) {
        (self.error_handler)(error);
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new(Vec::<String>::new())
    }
}

impl fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncConfig")
            .field("models", &self.models)
            .field("sync_expressions", &self.sync_expressions.keys())
            .field("retry", &self.retry)
            .field("sync_page_size", &self.sync_page_size)
            .field("sync_interval", &self.sync_interval)
            .finish_non_exhaustive()
    }
}

/// A predicate selecting which records of a model are synced.
#[derive(Clone)]
pub struct SyncExpression {
    /// Model the predicate applies to.
    pub model_name: String,
    predicate: Arc<dyn Fn(&AnyModel) -> bool + Send + Sync>,
}

impl SyncExpression {
    /// Creates a predicate for `model_name`.
    pub fn new(
        model_name: impl Into<String>,
        predicate: impl Fn(&AnyModel) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            model_name: model_name.into(),
            predicate: Arc::new(predicate),
        }
    }

    /// Evaluates the predicate.
    pub fn evaluate(&self, model: &AnyModel) -> bool {
        (self.predicate)(model)
    }
}

impl fmt::Debug for SyncExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncExpression")
            .field("model_name", &self.model_name)
            .finish_non_exhaustive()
    }
}

/// Where a conflict was detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictOrigin {
    /// The service rejected a local mutation.
    Outgoing,
    /// A remote change arrived while a local change was still pending.
    Incoming,
}

/// The two sides of a conflict.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictData {
    /// Where the conflict was detected.
    pub origin: ConflictOrigin,
    /// The local version of the record.
    pub local: AnyModel,
    /// The remote version of the record.
    pub remote: MutationSync,
}

/// How a conflict is resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum ConflictResolution {
    /// Overwrite local state with the remote record.
    ApplyRemote,
    /// Keep the local record and send it again against the remote version.
    RetryLocal,
    /// Send the given record against the remote version.
    Retry(AnyModel),
}

/// Decides how conflicts are resolved.
pub trait ConflictHandler: Send + Sync {
    /// Resolves one conflict.
    fn resolve(&self, conflict: &ConflictData) -> ConflictResolution;
}

impl<F> ConflictHandler for F
where
    F: Fn(&ConflictData) -> ConflictResolution + Send + Sync,
{
    fn resolve(&self, conflict: &ConflictData) -> ConflictResolution {
        self(conflict)
    }
}

/// Applies remote state for rejected mutations and keeps pending local
/// changes when a newer remote change arrives.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultConflictHandler;

impl ConflictHandler for DefaultConflictHandler {
    fn resolve(&self, conflict: &ConflictData) -> ConflictResolution {
        match conflict.origin {
            ConflictOrigin::Outgoing => ConflictResolution::ApplyRemote,
            ConflictOrigin::Incoming => ConflictResolution::RetryLocal,
        }
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of delivery attempts per mutation.
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Disables jitter.
    pub fn without_jitter(mut self) -> Self {
        self.add_jitter = false;
        self
    }

    /// Calculates the delay before retry number `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_delay = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            // Up to 25% jitter
            let jitter = delay_secs * 0.25 * rand::thread_rng().gen::<f64>();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datasync_protocol::SyncMetadata;
    use serde_json::json;

    fn post(id: &str, status: &str) -> AnyModel {
        AnyModel::new("Post", id, json!({ "id": id, "status": status }))
    }

    #[test]
    fn sync_config_builder() {
        let config = SyncConfig::new(["Post", "Comment"])
            .with_model("Author")
            .with_sync_page_size(50)
            .with_sync_interval(Duration::from_secs(60))
            .with_retry(RetryConfig::no_retry());

        assert_eq!(config.models, vec!["Post", "Comment", "Author"]);
        assert_eq!(config.sync_page_size, 50);
        assert_eq!(config.sync_interval, Duration::from_secs(60));
        assert_eq!(config.retry.max_attempts, 1);
    }

    #[test]
    fn sync_expressions_filter_by_model() {
        let config = SyncConfig::new(["Post", "Comment"]).with_sync_expression(
            SyncExpression::new("Post", |model| {
                model.field("status") == Some(&json!("published"))
            }),
        );

        assert!(config.in_scope(&post("1", "published")));
        assert!(!config.in_scope(&post("2", "draft")));
        // No expression means everything is in scope.
        let comment = AnyModel::new("Comment", "c1", json!({ "id": "c1" }));
        assert!(config.in_scope(&comment));
    }

    #[test]
    fn default_conflict_handler() {
        let remote = MutationSync::new(post("1", "remote"), SyncMetadata::new("Post", "1", 3));
        let mut conflict = ConflictData {
            origin: ConflictOrigin::Outgoing,
            local: post("1", "local"),
            remote,
        };
        assert_eq!(
            DefaultConflictHandler.resolve(&conflict),
            ConflictResolution::ApplyRemote
        );
        conflict.origin = ConflictOrigin::Incoming;
        assert_eq!(
            DefaultConflictHandler.resolve(&conflict),
            ConflictResolution::RetryLocal
        );
    }

    #[test]
    fn closures_are_conflict_handlers() {
        let config = SyncConfig::new(["Post"])
            .with_conflict_handler(|_: &ConflictData| ConflictResolution::RetryLocal);
        let conflict = ConflictData {
            origin: ConflictOrigin::Outgoing,
            local: post("1", "a"),
            remote: MutationSync::new(post("1", "b"), SyncMetadata::new("Post", "1", 2)),
        };
        assert_eq!(
            config.conflict_handler.resolve(&conflict),
            ConflictResolution::RetryLocal
        );
    }

    #[test]
    fn retry_config_no_retry() {
        let config = RetryConfig::no_retry();
        assert_eq!(config.max_attempts, 1);
        assert_eq!(config.delay_for_attempt(1), Duration::ZERO);
    }

    #[test]
    fn retry_delay_calculation() {
        let config = RetryConfig::new(5)
            .with_initial_delay(Duration::from_millis(100))
            .with_backoff_multiplier(2.0);

        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);

        let delay1 = config.delay_for_attempt(1);
        assert!(delay1 >= Duration::from_millis(100));
        assert!(delay1 <= Duration::from_millis(125));

        let delay2 = config.delay_for_attempt(2);
        assert!(delay2 >= Duration::from_millis(200));
    }

    #[test]
    fn retry_delay_respects_max() {
        let config = RetryConfig::new(10)
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5))
            .with_backoff_multiplier(10.0)
            .without_jitter();

        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(5));
    }
}

//! Configuration for replicators.

use crate::endpoint::{Authenticator, Endpoint};
use crate::error::{ReplicatorError, ReplicatorResult};
use crate::status::DocumentFlags;
use crate::transport::Connector;
use docsync_core::{Database, Document};
use docsync_protocol::DEFAULT_MAX_FRAME_LEN;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Decides whether a document takes part in replication.
///
/// Any state the filter needs is captured by the closure.
pub type ReplicationFilter = dyn Fn(&Document, DocumentFlags) -> bool + Send + Sync;

/// Which way changes flow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ReplicatorType {
    /// Both directions.
    #[default]
    PushAndPull,
    /// Local changes to the peer only.
    Push,
    /// Peer changes to the local database only.
    Pull,
}

impl ReplicatorType {
    /// True if local changes are sent.
    pub fn is_push(self) -> bool {
        matches!(self, ReplicatorType::Push | ReplicatorType::PushAndPull)
    }

    /// True if peer changes are received.
    pub fn is_pull(self) -> bool {
        matches!(self, ReplicatorType::Pull | ReplicatorType::PushAndPull)
    }
}

/// Configuration for a [`Replicator`](crate::Replicator).
#[derive(Clone)]
pub struct ReplicatorConfiguration {
    /// Local database.
    pub database: Database,
    /// Where to replicate to.
    pub endpoint: Endpoint,
    /// Direction.
    pub replicator_type: ReplicatorType,
    /// Keep running and replicate new changes as they happen.
    pub continuous: bool,
    /// Credentials for the handshake.
    pub authenticator: Option<Authenticator>,
    /// DER certificate the peer must present.
    pub pinned_certificate: Option<Vec<u8>>,
    /// Extra handshake headers.
    pub headers: BTreeMap<String, String>,
    /// Channels to pull from (all if empty).
    pub channels: Vec<String>,
    /// Documents to replicate (all if empty).
    pub document_ids: Vec<String>,
    /// Decides which local documents are pushed.
    pub push_filter: Option<Arc<ReplicationFilter>>,
    /// Decides which pulled revisions are stored.
    pub pull_filter: Option<Arc<ReplicationFilter>>,
    /// Maximum number of changes per batch.
    pub batch_size: u32,
    /// Maximum number of history entries sent with a revision.
    pub max_history: usize,
    /// Retry configuration.
    pub retry: RetryConfig,
    /// How often a continuous replicator polls the peer while idle.
    pub poll_interval: Duration,
    /// Connect and request timeout.
    pub timeout: Duration,
    /// Maximum frame payload size.
    pub max_frame_len: usize,
    /// Connector override; chosen from the endpoint if unset.
    pub connector: Option<Arc<dyn Connector>>,
}

impl ReplicatorConfiguration {
    /// Creates a one-shot push-and-pull configuration.
    pub fn new(database: Database, endpoint: Endpoint) -> Self {
        let max_history = database.config().max_history;
        Self {
            database,
            endpoint,
            replicator_type: ReplicatorType::default(),
            continuous: false,
            authenticator: None,
            pinned_certificate: None,
            headers: BTreeMap::new(),
            channels: Vec::new(),
            document_ids: Vec::new(),
            push_filter: None,
            pull_filter: None,
            batch_size: 100,
            max_history,
            retry: RetryConfig::default(),
            poll_interval: Duration::from_secs(5),
            timeout: Duration::from_secs(30),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            connector: None,
        }
    }

    /// Sets the direction.
    pub fn with_type(mut self, replicator_type: ReplicatorType) -> Self {
        self.replicator_type = replicator_type;
        self
    }

    /// Sets continuous mode.
    pub fn with_continuous(mut self, continuous: bool) -> Self {
        self.continuous = continuous;
        self
    }

    /// Sets the authenticator.
    pub fn with_authenticator(mut self, authenticator: Authenticator) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    /// Pins the peer's DER certificate.
    pub fn with_pinned_certificate(mut self, der: Vec<u8>) -> Self {
        self.pinned_certificate = Some(der);
        self
    }

    /// Adds a handshake header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Restricts pulls to these channels.
    pub fn with_channels<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.channels = channels.into_iter().map(Into::into).collect();
        self
    }

    /// Restricts replication to these documents.
    pub fn with_document_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.document_ids = ids.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the push filter.
    pub fn with_push_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Document, DocumentFlags) -> bool + Send + Sync + 'static,
    {
        self.push_filter = Some(Arc::new(filter));
        self
    }

    /// Sets the pull filter.
    pub fn with_pull_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Document, DocumentFlags) -> bool + Send + Sync + 'static,
    {
        self.pull_filter = Some(Arc::new(filter));
        self
    }

    /// Sets the batch size.
    pub fn with_batch_size(mut self, size: u32) -> Self {
        self.batch_size = size;
        self
    }

    /// Sets the maximum history sent per revision.
    pub fn with_max_history(mut self, max_history: usize) -> Self {
        self.max_history = max_history;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the idle poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the connect and request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the maximum frame size.
    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    /// Uses a custom connector.
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Checks the configuration for errors.
    pub fn validate(&self) -> ReplicatorResult<()> {
        if self.batch_size == 0 {
            return Err(ReplicatorError::InvalidConfig(
                "batch size must be positive".into(),
            ));
        }
        if self.max_history == 0 {
            return Err(ReplicatorError::InvalidConfig(
                "max history must be positive".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ReplicatorError::InvalidConfig(
                "retry max attempts must be positive".into(),
            ));
        }
        if self.poll_interval.is_zero() || self.timeout.is_zero() {
            return Err(ReplicatorError::InvalidConfig(
                "poll interval and timeout must be positive".into(),
            ));
        }
        if let Endpoint::LocalDatabase(target) = &self.endpoint {
            if target.same_database(&self.database) {
                return Err(ReplicatorError::InvalidConfig(
                    "cannot replicate a database with itself".into(),
                ));
            }
        }
        if self.headers.keys().any(|name| name.trim().is_empty()) {
            return Err(ReplicatorError::InvalidConfig("empty header name".into()));
        }
        if self.document_ids.iter().any(String::is_empty) {
            return Err(ReplicatorError::InvalidConfig("empty document ID".into()));
        }
        Ok(())
    }
}

impl fmt::Debug for ReplicatorConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicatorConfiguration")
            .field("database", &self.database.name())
            .field("endpoint", &self.endpoint.to_string())
            .field("replicator_type", &self.replicator_type)
            .field("continuous", &self.continuous)
            .field("authenticator", &self.authenticator)
            .field("pinned_certificate", &self.pinned_certificate.is_some())
            .field("channels", &self.channels)
            .field("document_ids", &self.document_ids)
            .field("push_filter", &self.push_filter.is_some())
            .field("pull_filter", &self.pull_filter.is_some())
            .field("batch_size", &self.batch_size)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

/// Configuration for retry behavior.
///
/// One-shot replicators give up after `max_attempts` failed connection
/// attempts in a row; continuous replicators retry forever, waiting
/// [`delay_for_attempt`](Self::delay_for_attempt) between attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts for one-shot replication.
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
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(300),
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

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, add_jitter: bool) -> Self {
        self.add_jitter = add_jitter;
        self
    }

    /// True if another attempt is allowed after `failures` failed ones.
    pub fn should_retry(&self, failures: u32, continuous: bool) -> bool {
        continuous || failures < self.max_attempts
    }

    /// Calculates the delay before a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let base_delay = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);

        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            // Up to 25% on top.
            let jitter = delay_secs * 0.25 * rand_jitter();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(10)
    }
}

/// Pseudo-random value in `[0, 1)` from the clock.
fn rand_jitter() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    f64::from(nanos % 1000) / 1000.0
}

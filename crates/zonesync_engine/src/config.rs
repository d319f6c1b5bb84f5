//! Store options and retry behavior.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use zonesync_protocol::{
    Clock, ConflictPolicy, RemoteRecord, SystemClock, DEFAULT_SUBSCRIPTION_ID, DEFAULT_ZONE_NAME,
};

/// Caller-supplied conflict resolution: `(local, remote) -> record`.
///
/// The returned record becomes the new truth on both sides. An `Err` leaves
/// the local pending state untouched and is reported for that record.
pub type ResolveCallback =
    Arc<dyn Fn(&RemoteRecord, &RemoteRecord) -> Result<RemoteRecord, String> + Send + Sync>;

/// Options selected when a store session opens. Immutable afterwards.
#[derive(Clone)]
pub struct StoreOptions {
    /// How conflicts are resolved.
    pub conflict_policy: ConflictPolicy,
    /// Resolution callback; required for [`ConflictPolicy::AskCaller`].
    pub resolver: Option<ResolveCallback>,
    /// Remote zone holding the store's records.
    pub zone_name: String,
    /// Identifier of the zone change subscription.
    pub subscription_id: String,
    /// Records per save or delete batch, clamped to the remote limit.
    pub push_batch_size: usize,
    /// Records per change-feed page.
    pub fetch_limit: u32,
    /// Retry behavior for whole-run transient failures.
    pub retry: RetryConfig,
    /// Whether loading the store triggers a sync.
    pub sync_on_open: bool,
    /// Source of local edit timestamps.
    pub clock: Arc<dyn Clock>,
}

impl StoreOptions {
    /// Creates options with the defaults.
    pub fn new() -> Self {
        Self {
            conflict_policy: ConflictPolicy::default(),
            resolver: None,
            zone_name: DEFAULT_ZONE_NAME.to_string(),
            subscription_id: DEFAULT_SUBSCRIPTION_ID.to_string(),
            push_batch_size: 400,
            fetch_limit: 200,
            retry: RetryConfig::default(),
            sync_on_open: true,
            clock: Arc::new(SystemClock),
        }
    }

    /// Sets the conflict policy.
    pub fn with_conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }

    /// Sets the resolution callback.
    pub fn with_resolver<F>(mut self, resolver: F) -> Self
    where
        F: Fn(&RemoteRecord, &RemoteRecord) -> Result<RemoteRecord, String>
            + Send
            + Sync
            + 'static,
    {
        self.resolver = Some(Arc::new(resolver));
        self
    }

    /// Sets the zone name.
    pub fn with_zone_name(mut self, zone: impl Into<String>) -> Self {
        self.zone_name = zone.into();
        self
    }

    /// Sets the subscription identifier.
    pub fn with_subscription_id(mut self, id: impl Into<String>) -> Self {
        self.subscription_id = id.into();
        self
    }

    /// Sets the push batch size.
    pub fn with_push_batch_size(mut self, size: usize) -> Self {
        self.push_batch_size = size;
        self
    }

    /// Sets the change-feed page size.
    pub fn with_fetch_limit(mut self, limit: u32) -> Self {
        self.fetch_limit = limit;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets whether loading the store triggers a sync.
    pub fn with_sync_on_open(mut self, sync: bool) -> Self {
        self.sync_on_open = sync;
        self
    }

    /// Sets the clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Checks the options for consistency.
    ///
    /// # Errors
    ///
    /// Returns a description of the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        if self.conflict_policy.requires_callback() && self.resolver.is_none() {
            return Err("AskCaller policy requires a resolver callback".into());
        }
        if self.zone_name.is_empty() {
            return Err("zone name must not be empty".into());
        }
        if self.subscription_id.is_empty() {
            return Err("subscription id must not be empty".into());
        }
        if self.push_batch_size == 0 {
            return Err("push batch size must be positive".into());
        }
        if self.fetch_limit == 0 {
            return Err("fetch limit must be positive".into());
        }
        Ok(())
    }
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StoreOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreOptions")
            .field("conflict_policy", &self.conflict_policy)
            .field("resolver", &self.resolver.is_some())
            .field("zone_name", &self.zone_name)
            .field("subscription_id", &self.subscription_id)
            .field("push_batch_size", &self.push_batch_size)
            .field("fetch_limit", &self.fetch_limit)
            .field("retry", &self.retry)
            .field("sync_on_open", &self.sync_on_open)
            .finish()
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, the first one included.
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
    /// Creates a retry configuration.
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

    /// Calculates the delay before a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let base_delay = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            // Up to 25% extra.
            let jitter = delay_secs * 0.25 * jitter_fraction();
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

fn jitter_fraction() -> f64 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    f64::from(nanos % 1000) / 1000.0
}

use std::{
    cmp::Ordering,
    fmt,
    sync::Arc,
    time::Duration,
};

use models_sync_types::{
    backoff::Backoff,
    default_order,
    mutation_id_equality,
    EventComparator,
};

const DEFAULT_HISTORY_PAGE_SIZE: u32 = 100;
const DEFAULT_MESSAGE_RETENTION_PERIOD: Duration = Duration::from_secs(2 * 60);
const DEFAULT_OPTIMISTIC_TIMEOUT: Duration = Duration::from_millis(120_000);
const DEFAULT_RETRY_INITIAL: Duration = Duration::from_secs(2);
const DEFAULT_RETRY_MAX: Duration = Duration::from_secs(8);
const DEFAULT_RETRY_BUDGET: u32 = 3;

/// Maps a 1-based attempt number to the delay before retrying, or `None` to
/// give up.
pub type RetryStrategy = Arc<dyn Fn(u32) -> Option<Duration> + Send + Sync>;

/// Orders two message ids. Drives both sliding-window reordering and the
/// history seek boundary comparison.
pub type EventOrderer = Arc<dyn Fn(&str, &str) -> Ordering + Send + Sync>;

/// 2s, 4s, 8s, then give up.
pub fn default_retry_strategy() -> RetryStrategy {
    let backoff = Backoff::with_budget(DEFAULT_RETRY_INITIAL, DEFAULT_RETRY_MAX, DEFAULT_RETRY_BUDGET);
    Arc::new(move |attempt| backoff.delay_for(attempt))
}

/// Numeric when both ids parse as numbers, lexicographic otherwise.
pub fn default_event_orderer() -> EventOrderer {
    Arc::new(default_order)
}

#[derive(Clone)]
pub struct SyncOptions {
    /// Page size used when seeking through channel history.
    pub history_page_size: u32,
    /// How long the channel retains messages; informs whether a sync is
    /// viable from history at all.
    pub message_retention_period: Duration,
    pub retry_strategy: RetryStrategy,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            history_page_size: DEFAULT_HISTORY_PAGE_SIZE,
            message_retention_period: DEFAULT_MESSAGE_RETENTION_PERIOD,
            retry_strategy: default_retry_strategy(),
        }
    }
}

impl fmt::Debug for SyncOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncOptions")
            .field("history_page_size", &self.history_page_size)
            .field("message_retention_period", &self.message_retention_period)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct OptimisticEventOptions {
    /// Confirmation deadline for an optimistic event.
    pub timeout: Duration,
    /// Decides whether a confirmed event confirms a pending optimistic one.
    pub event_comparator: EventComparator,
}

impl Default for OptimisticEventOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_OPTIMISTIC_TIMEOUT,
            event_comparator: Arc::new(mutation_id_equality),
        }
    }
}

impl fmt::Debug for OptimisticEventOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptimisticEventOptions")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct EventBufferOptions {
    /// Sliding-window length for reordering live messages. Zero disables
    /// buffering entirely.
    pub buffer: Duration,
    pub event_orderer: EventOrderer,
}

impl Default for EventBufferOptions {
    fn default() -> Self {
        Self {
            buffer: Duration::ZERO,
            event_orderer: default_event_orderer(),
        }
    }
}

impl fmt::Debug for EventBufferOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBufferOptions")
            .field("buffer", &self.buffer)
            .finish_non_exhaustive()
    }
}

/// Client-wide options; per-model and per-call overrides layer on top.
#[derive(Clone, Debug, Default)]
pub struct ClientOptions {
    pub sync: SyncOptions,
    pub optimistic: OptimisticEventOptions,
    pub event_buffer: EventBufferOptions,
}

/// Call-site overrides for a single optimistic submission.
#[derive(Clone, Debug, Default)]
pub struct OptimisticOverrides {
    pub timeout: Option<Duration>,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_defaults_table() {
        let options = ClientOptions::default();
        assert_eq!(options.sync.history_page_size, 100);
        assert_eq!(options.sync.message_retention_period, Duration::from_secs(120));
        assert_eq!(options.optimistic.timeout, Duration::from_millis(120_000));
        assert_eq!(options.event_buffer.buffer, Duration::ZERO);
    }

    #[test]
    fn test_default_retry_schedule() {
        let retry = default_retry_strategy();
        assert_eq!(retry(1), Some(Duration::from_secs(2)));
        assert_eq!(retry(2), Some(Duration::from_secs(4)));
        assert_eq!(retry(3), Some(Duration::from_secs(8)));
        assert_eq!(retry(4), None);
    }

    #[test]
    fn test_default_orderer_is_numeric_else_lex() {
        let orderer = default_event_orderer();
        assert_eq!(orderer("9", "10"), Ordering::Less);
        assert_eq!(orderer("b", "a"), Ordering::Greater);
    }
}

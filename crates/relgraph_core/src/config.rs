//! Context and channel configuration.

use relgraph_sync_protocol::MergePolicy;

/// SQL generation settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlConfig {
    /// Quote table and column names.
    pub quote_identifiers: bool,
    /// Quote character used when quoting is on.
    pub quote_char: char,
    /// Emit `LIMIT`/`OFFSET` clauses. When off, paging happens in memory.
    pub supports_limit: bool,
}

impl Default for SqlConfig {
    fn default() -> Self {
        Self {
            quote_identifiers: false,
            quote_char: '"',
            supports_limit: true,
        }
    }
}

impl SqlConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets identifier quoting.
    #[must_use]
    pub const fn quote_identifiers(mut self, value: bool) -> Self {
        self.quote_identifiers = value;
        self
    }

    /// Sets the quote character.
    #[must_use]
    pub const fn quote_char(mut self, value: char) -> Self {
        self.quote_char = value;
        self
    }

    /// Sets whether `LIMIT`/`OFFSET` is emitted.
    #[must_use]
    pub const fn supports_limit(mut self, value: bool) -> Self {
        self.supports_limit = value;
        self
    }
}

/// Large-object write settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LobConfig {
    /// Write LOB values in two phases: placeholder on insert/update, then
    /// stream through a handle on the row selected `FOR UPDATE`.
    pub two_phase: bool,
    /// Placeholder for binary LOB columns.
    pub binary_placeholder: String,
    /// Placeholder for character LOB columns.
    pub character_placeholder: String,
    /// Bytes per streamed chunk.
    pub chunk_size: usize,
}

impl Default for LobConfig {
    fn default() -> Self {
        Self {
            two_phase: false,
            binary_placeholder: "EMPTY_BLOB()".to_string(),
            character_placeholder: "EMPTY_CLOB()".to_string(),
            chunk_size: 8 * 1024, // 8 KB
        }
    }
}

impl LobConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables or disables two-phase writes.
    #[must_use]
    pub fn two_phase(mut self, value: bool) -> Self {
        self.two_phase = value;
        self
    }

    /// Sets the chunk size.
    #[must_use]
    pub fn chunk_size(mut self, value: usize) -> Self {
        self.chunk_size = value;
        self
    }

    /// Sets both placeholder functions.
    #[must_use]
    pub fn placeholders(mut self, binary: impl Into<String>, character: impl Into<String>) -> Self {
        self.binary_placeholder = binary.into();
        self.character_placeholder = character.into();
        self
    }
}

/// How the channel hands committed events to peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    /// Deliver on the committing thread before `commit` returns.
    #[default]
    Synchronous,
    /// Deliver on a dispatcher thread, in commit order.
    Background,
}

/// Configuration for a synchronization channel.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Event delivery mode.
    pub delivery: DeliveryMode,
    /// Number of published events kept for `events_since`.
    pub max_history: usize,
    /// SQL generation settings for this store.
    pub sql: SqlConfig,
    /// Large-object settings for this store.
    pub lob: LobConfig,
    /// The store checks foreign keys at commit time, so commit ordering may
    /// break cycles instead of failing.
    pub deferred_constraints: bool,
    /// First value handed out by the default key generator.
    pub pk_start: i64,
    /// Keys reserved per generator refill.
    pub pk_cache_size: i64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            delivery: DeliveryMode::Synchronous,
            max_history: 1000,
            sql: SqlConfig::default(),
            lob: LobConfig::default(),
            deferred_constraints: false,
            pk_start: 200,
            pk_cache_size: 20,
        }
    }
}

impl ChannelConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the delivery mode.
    #[must_use]
    pub fn delivery(mut self, mode: DeliveryMode) -> Self {
        self.delivery = mode;
        self
    }

    /// Sets the history size.
    #[must_use]
    pub fn max_history(mut self, value: usize) -> Self {
        self.max_history = value;
        self
    }

    /// Sets SQL generation settings.
    #[must_use]
    pub fn sql(mut self, sql: SqlConfig) -> Self {
        self.sql = sql;
        self
    }

    /// Sets large-object settings.
    #[must_use]
    pub fn lob(mut self, lob: LobConfig) -> Self {
        self.lob = lob;
        self
    }

    /// Declares deferred constraint checking.
    #[must_use]
    pub fn deferred_constraints(mut self, value: bool) -> Self {
        self.deferred_constraints = value;
        self
    }

    /// Sets the key generator start and refill size.
    #[must_use]
    pub fn pk_sequence(mut self, start: i64, cache_size: i64) -> Self {
        self.pk_start = start;
        self.pk_cache_size = cache_size;
        self
    }
}

/// Configuration for one context.
#[derive(Debug, Clone, Default)]
pub struct ContextConfig {
    /// Policy for peer changes that hit local uncommitted work when the
    /// delegate does not decide.
    pub merge_policy: MergePolicy,
}

impl ContextConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the merge policy.
    #[must_use]
    pub const fn merge_policy(mut self, policy: MergePolicy) -> Self {
        self.merge_policy = policy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ChannelConfig::default();
        assert_eq!(config.delivery, DeliveryMode::Synchronous);
        assert_eq!(config.pk_start, 200);
        assert!(!config.lob.two_phase);
        assert!(!config.sql.quote_identifiers);
        assert_eq!(ContextConfig::default().merge_policy, MergePolicy::KeepLocal);
    }

    #[test]
    fn builder() {
        let config = ChannelConfig::new()
            .delivery(DeliveryMode::Background)
            .max_history(5)
            .deferred_constraints(true)
            .lob(LobConfig::new().two_phase(true).chunk_size(4))
            .sql(SqlConfig::new().quote_identifiers(true).quote_char('`'));
        assert_eq!(config.delivery, DeliveryMode::Background);
        assert_eq!(config.max_history, 5);
        assert!(config.deferred_constraints);
        assert_eq!(config.lob.chunk_size, 4);
        assert_eq!(config.sql.quote_char, '`');
    }
}

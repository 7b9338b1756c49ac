//! Configuration loading and constants.
//!
//! Loads engine configuration from TOML files and defines constants for
//! wire-protocol limits, history batching, pool timeouts, ingest flow
//! control, and default paths. `AppConfig` is the root configuration struct
//! containing all settings.

use const_format::formatcp;
use serde::Deserialize;
use std::path::{Path, PathBuf};

// =============================================================================
// NNTP Wire Limits
// =============================================================================
// Line caps bound memory per connection. A peer exceeding a cap gets its
// connection closed; see wire::ReadKind for which cap applies to which read.

/// Maximum lines accepted for a full article multiline read
pub const LINES_CAP_ARTICLE: usize = 262144;

/// Maximum lines accepted for a headers-only multiline read
pub const LINES_CAP_HEADERS: usize = 1024;

/// Maximum lines accepted for a body-only multiline read
pub const LINES_CAP_BODY: usize = LINES_CAP_ARTICLE - LINES_CAP_HEADERS;

/// Maximum lines accepted for any other multiline read (LIST, XOVER, ...)
pub const LINES_CAP_OTHER: usize = 500000;

/// Hard limit on header lines in a received article
pub const MAX_HEADER_LINES: usize = 1024;

/// Hard limit on total lines in a received article
pub const MAX_ARTICLE_LINES: usize = 16384;

// =============================================================================
// XOVER / XHDR Batching
// =============================================================================

/// Maximum overview/header lines per XOVER or XHDR request when the caller
/// asks for range clamping (bounds latency and backing-store impact)
pub const MAX_XOVER_BATCH: u64 = 100;

// =============================================================================
// Connection Pool
// =============================================================================

/// Seconds a `get` waits for a pooled connection before failing
pub const POOL_GET_TIMEOUT_SECS: u64 = 30;

/// Interval in seconds between idle-connection sweeps
pub const POOL_SWEEP_INTERVAL_SECS: u64 = 8;

/// Error text for a pool checkout timeout
pub const POOL_TIMEOUT_MSG: &str = formatcp!(
    "timeout waiting for connection from pool after {}s",
    POOL_GET_TIMEOUT_SECS
);

// =============================================================================
// History Store
// =============================================================================

/// Number of shard database files
pub const SHARD_DB_COUNT: usize = 16;

/// Capacity of the history writer queue
pub const HISTORY_QUEUE_CAPACITY: usize = 4096;

/// Writer flushes after this many queued entries
pub const HISTORY_FLUSH_BATCH: usize = 64;

/// Writer flushes after this many milliseconds even if the batch is short
pub const HISTORY_FLUSH_INTERVAL_MS: u64 = 250;

/// Bounded retries for a failed index update before the writer poisons
pub const HISTORY_INDEX_RETRIES: usize = 3;

/// Warn when the observed collision rate exceeds this fraction
pub const HISTORY_COLLISION_WARN_RATE: f64 = 0.05;

/// History log file name inside the history directory
pub const HISTORY_LOG_FILE: &str = "history.dat";

/// Lock file recording the short hash length and shard mode
pub const HISTORY_LOCK_FILE: &str = "history.lock.json";

// =============================================================================
// MessageId Cache
// =============================================================================

/// Number of cache buckets (first-byte hash shards the map)
pub const MSGID_CACHE_BUCKETS: usize = 64;

/// Seconds a freshly locked record stays alive before the cleaner may evict
pub const MSGID_LOCK_TTL_SECS: u64 = 15;

/// Interval in seconds between cache cleanup passes
pub const MSGID_CLEANUP_INTERVAL_SECS: u64 = 15;

/// TTL in seconds for the negative cache (article definitely unavailable)
pub const LOCAL430_TTL_SECS: u64 = 60;

/// Maximum entries in the negative cache
pub const LOCAL430_CAPACITY: u64 = 65536;

/// TTL in seconds for the per-group membership cache
pub const MEMBERSHIP_TTL_SECS: u64 = 300;

/// Maximum entries in the per-group membership cache
pub const MEMBERSHIP_CAPACITY: u64 = 131072;

// =============================================================================
// Server Session
// =============================================================================

/// Delay in milliseconds before every error response (resists probing)
pub const ERROR_DELAY_MS: u64 = 1000;

/// Rolling read deadline in seconds for inbound sessions
pub const SESSION_READ_DEADLINE_SECS: u64 = 60;

// =============================================================================
// Ingest Flow Control
// =============================================================================

/// Liveness ticker period in milliseconds
pub const LIVENESS_TICK_MS: u64 = 100;

/// A liveness window with no progress lasts this many seconds
pub const LIVENESS_WINDOW_SECS: u64 = 5;

/// Dead windows tolerated before a group download is abandoned
pub const MAX_DEAD_WINDOWS: u32 = 4;

// =============================================================================
// Validation Limits
// =============================================================================

/// Minimum syntactic length of a message-id, including angle brackets
pub const MSGID_MIN_LEN: usize = 5;

/// Maximum syntactic length of a message-id, including angle brackets
pub const MSGID_MAX_LEN: usize = 255;

/// Articles dated further than this many seconds in the future are rejected
pub const MAX_FUTURE_DATE_SECS: i64 = 25 * 3600;

// =============================================================================
// Default Paths and Strings
// =============================================================================

/// Default configuration file path
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Default log filter when RUST_LOG is not set
pub const DEFAULT_LOG_FILTER: &str = "newspool=debug";

/// Default log format (text or json)
pub const DEFAULT_LOG_FORMAT: &str = "text";

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Inbound NNTP server configuration
    pub server: ServerConfig,
    /// History store configuration
    pub history: HistoryConfig,
    /// Ingest pipeline settings
    #[serde(default)]
    pub ingest: IngestConfig,
    /// Upstream providers articles are pulled from
    #[serde(default)]
    pub provider: Vec<ProviderConfig>,
    /// Peers allowed to connect and feed
    #[serde(default)]
    pub peer: Vec<PeerConfig>,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Inbound NNTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Local hostname used for Path header synthesis and the greeting
    pub hostname: String,
    /// Whether POST/IHAVE/TAKETHIS are advertised and accepted
    #[serde(default)]
    pub posting_enabled: bool,
    /// Require AUTHINFO before POST
    #[serde(default)]
    pub auth_required_for_post: bool,
    /// Require AUTHINFO before LIST
    #[serde(default)]
    pub auth_required_for_list: bool,
    /// Static reader credentials (username -> password)
    #[serde(default)]
    pub users: std::collections::HashMap<String, String>,
}

/// History store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct HistoryConfig {
    /// Directory holding history.dat, the lock file, and the shard databases
    pub dir: PathBuf,
    /// Hex chars beyond the 3-char routing prefix used as a shard-table key.
    /// Locked on first initialization; valid range 2..=7.
    #[serde(default = "HistoryConfig::default_short_hash_len")]
    pub use_short_hash_len: usize,
    /// Writer flush batch size
    #[serde(default = "HistoryConfig::default_flush_batch")]
    pub flush_batch: usize,
    /// Writer flush interval in milliseconds
    #[serde(default = "HistoryConfig::default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

impl HistoryConfig {
    fn default_short_hash_len() -> usize {
        7
    }

    fn default_flush_batch() -> usize {
        HISTORY_FLUSH_BATCH
    }

    fn default_flush_interval_ms() -> u64 {
        HISTORY_FLUSH_INTERVAL_MS
    }
}

/// Ingest pipeline settings
#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// Articles planned per download window (also the per-group batch
    /// channel capacity)
    #[serde(default = "IngestConfig::default_max_batch")]
    pub max_batch: u64,
    /// Maximum groups downloading concurrently
    #[serde(default = "IngestConfig::default_download_max_par")]
    pub download_max_par: usize,
    /// Download windows attempted per group per invocation
    #[serde(default = "IngestConfig::default_loops_per_group")]
    pub loops_per_group: u32,
    /// Maximum groups an accepted article may be crossposted to
    #[serde(default = "IngestConfig::default_max_crossposts")]
    pub max_crossposts: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_batch: Self::default_max_batch(),
            download_max_par: Self::default_download_max_par(),
            loops_per_group: Self::default_loops_per_group(),
            max_crossposts: Self::default_max_crossposts(),
        }
    }
}

impl IngestConfig {
    fn default_max_batch() -> u64 {
        100
    }

    fn default_download_max_par() -> usize {
        16
    }

    fn default_loops_per_group() -> u32 {
        1
    }

    fn default_max_crossposts() -> usize {
        10
    }
}

/// SOCKS5 proxy settings for an upstream provider
#[derive(Debug, Clone, Deserialize)]
pub struct SocksConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Configuration for a single upstream provider
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    /// Provider name (used for logging and checkpoint keys)
    pub name: String,
    /// Upstream hostname
    pub host: String,
    /// Upstream port
    pub port: u16,
    /// Connect with TLS
    #[serde(default)]
    pub tls: bool,
    /// Optional SOCKS5 proxy; `.onion` hosts require one
    pub socks: Option<SocksConfig>,
    /// Username for AUTHINFO
    pub username: Option<String>,
    /// Password for AUTHINFO
    pub password: Option<String>,
    /// Maximum pooled connections (default: 4)
    pub max_conns: Option<usize>,
    /// Seconds an idle pooled connection stays reusable (default: 120)
    pub idle_timeout_seconds: Option<u64>,
    /// Connect timeout in seconds (default: 30)
    pub timeout_seconds: Option<u64>,
    /// Newsgroups replicated from this provider
    #[serde(default)]
    pub groups: Vec<String>,
}

impl ProviderConfig {
    /// Get maximum pooled connections (default: 4)
    pub fn max_conns(&self) -> usize {
        self.max_conns.unwrap_or(4)
    }

    /// Get idle timeout (default: 120s)
    pub fn idle_timeout_seconds(&self) -> u64 {
        self.idle_timeout_seconds.unwrap_or(120)
    }

    /// Get connect timeout (default: 30s)
    pub fn timeout_seconds(&self) -> u64 {
        self.timeout_seconds.unwrap_or(30)
    }

    /// Check if credentials are configured (both username and password)
    pub fn has_credentials(&self) -> bool {
        self.username.is_some() && self.password.is_some()
    }
}

/// Configuration for a single peer (inbound ACL + outbound feed policy)
#[derive(Debug, Clone, Deserialize)]
pub struct PeerConfig {
    /// Peer name (used for logging and identification)
    pub name: String,
    /// Peer hostname, checked via forward-confirmed reverse DNS when set
    pub hostname: Option<String>,
    /// Static IPv4 addresses
    #[serde(default)]
    pub ipv4: Vec<String>,
    /// Static IPv6 addresses
    #[serde(default)]
    pub ipv6: Vec<String>,
    /// CIDR ranges
    #[serde(default)]
    pub cidr: Vec<String>,
    /// Feed patterns: groups we send
    #[serde(default)]
    pub send: Vec<String>,
    /// Feed patterns: groups we accept
    #[serde(default)]
    pub accept: Vec<String>,
    /// Feed patterns: groups pruned from the send set (`!` list)
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Feed patterns: groups rejecting the whole article (`@` list)
    #[serde(default)]
    pub reject: Vec<String>,
    /// Whether this peer may connect at all
    #[serde(default = "PeerConfig::default_enabled")]
    pub enabled: bool,
    /// Maximum articles per session (0 = unlimited)
    #[serde(default)]
    pub max_articles_per_session: u64,
    /// Credentials this peer authenticates with, if any
    pub username: Option<String>,
    pub password: Option<String>,
    /// Require TLS from this peer
    #[serde(default)]
    pub require_tls: bool,
}

impl PeerConfig {
    fn default_enabled() -> bool {
        true
    }
}

/// DNS settings for peer ACL checks
#[derive(Debug, Clone, Deserialize)]
pub struct DnsConfig {
    /// Concurrent DNS queries allowed (serialized by default)
    #[serde(default = "DnsConfig::default_parallel")]
    pub parallel: usize,
    /// Per-query timeout in seconds
    #[serde(default = "DnsConfig::default_timeout")]
    pub timeout_seconds: u64,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            parallel: Self::default_parallel(),
            timeout_seconds: Self::default_timeout(),
        }
    }
}

impl DnsConfig {
    fn default_parallel() -> usize {
        1
    }

    fn default_timeout() -> u64 {
        30
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "text" (human-readable, default) or "json" (structured)
    #[serde(default = "LoggingConfig::default_format")]
    pub format: String,
    /// DNS query limits for peer ACL checks
    #[serde(default)]
    pub dns: DnsConfig,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: DEFAULT_LOG_FORMAT.to_string(),
            dns: DnsConfig::default(),
        }
    }
}

impl LoggingConfig {
    fn default_format() -> String {
        DEFAULT_LOG_FORMAT.to_string()
    }
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.server.hostname.is_empty() {
            return Err(ConfigError::Validation(
                "server.hostname must be set (used for Path headers and the greeting)".to_string(),
            ));
        }
        if !(2..=7).contains(&self.history.use_short_hash_len) {
            return Err(ConfigError::Validation(format!(
                "history.use_short_hash_len must be in 2..=7, got {}",
                self.history.use_short_hash_len
            )));
        }
        for provider in &self.provider {
            if provider.host.ends_with(".onion") && provider.socks.is_none() {
                return Err(ConfigError::Validation(format!(
                    "provider {}: .onion hosts require a [provider.socks] proxy",
                    provider.name
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Configuration error: {0}")]
    Validation(String),
}

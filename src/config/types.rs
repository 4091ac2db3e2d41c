use serde::Deserialize;

/// Main configuration structure for crawl-keeper
///
/// Every section is optional in the TOML file; missing sections fall back to
/// their defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub browser: BrowserConfig,
    #[serde(default)]
    pub jobs: JobDefaults,
    #[serde(default)]
    pub throttle: ThrottleConfig,
    #[serde(default)]
    pub rules: Vec<RuleEntry>,
}

/// Engine-wide concurrency and lease settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of browser sessions leased at the same time
    #[serde(rename = "max-sessions")]
    pub max_sessions: u32,

    /// Maximum number of units being worked on across all jobs
    #[serde(rename = "max-workers")]
    pub max_workers: u32,

    /// How long a worker waits for a session before the unit is requeued (milliseconds)
    #[serde(rename = "acquire-timeout-ms")]
    pub acquire_timeout_ms: u64,

    /// Lease lifetime after which a session is force-reclaimed (milliseconds)
    #[serde(rename = "lease-ttl-ms")]
    pub lease_ttl_ms: u64,

    /// How often expired leases are reclaimed (milliseconds)
    #[serde(rename = "reap-interval-ms")]
    pub reap_interval_ms: u64,

    /// Delay before a unit that found the pool exhausted is offered again (milliseconds)
    #[serde(rename = "pool-retry-delay-ms")]
    pub pool_retry_delay_ms: u64,

    /// How often a halted job probes the checkpoint store (milliseconds)
    #[serde(rename = "halt-probe-interval-ms")]
    pub halt_probe_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_sessions: 4,
            max_workers: 8,
            acquire_timeout_ms: 10_000,
            lease_ttl_ms: 120_000,
            reap_interval_ms: 5_000,
            pool_retry_delay_ms: 250,
            halt_probe_interval_ms: 2_000,
        }
    }
}

/// Backoff applied to failed units
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Delay before the first retry (milliseconds)
    #[serde(rename = "base-delay-ms")]
    pub base_delay_ms: u64,

    /// Upper bound for any single retry delay (milliseconds)
    #[serde(rename = "max-delay-ms")]
    pub max_delay_ms: u64,

    /// Factor applied to the delay for each further attempt
    pub multiplier: f64,

    /// Maximum random jitter added to each delay (milliseconds)
    #[serde(rename = "jitter-ms")]
    pub jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 5_000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
            jitter_ms: 250,
        }
    }
}

/// Checkpoint persistence settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// When false, progress lives in memory only and jobs restart from scratch after a crash
    pub enabled: bool,

    /// Path to the SQLite database file
    #[serde(rename = "database-path")]
    pub database_path: String,

    /// Upper bound on a single checkpoint write (milliseconds)
    #[serde(rename = "save-timeout-ms")]
    pub save_timeout_ms: u64,

    /// Hours a terminal job is kept before it is archived
    #[serde(rename = "retention-hours")]
    pub retention_hours: u64,

    /// How often the retention sweep runs (seconds)
    #[serde(rename = "sweep-interval-secs")]
    pub sweep_interval_secs: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            database_path: "crawl-keeper.db".to_string(),
            save_timeout_ms: 5_000,
            retention_hours: 168,
            sweep_interval_secs: 3_600,
        }
    }
}

/// Which rendering backend sessions are opened with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderEngine {
    /// Headless Chromium driven over the DevTools protocol
    Chromium,
    /// Plain HTTP fetches, no script execution
    Http,
}

/// Browser and renderer settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    pub engine: RenderEngine,

    /// Run Chromium without a visible window
    pub headless: bool,

    /// Explicit Chromium executable; autodetected when absent
    #[serde(rename = "chrome-path")]
    pub chrome_path: Option<String>,

    /// User agent sent with every page load
    #[serde(rename = "user-agent")]
    pub user_agent: String,

    /// Timeout for browser protocol requests (milliseconds)
    #[serde(rename = "request-timeout-ms")]
    pub request_timeout_ms: u64,

    #[serde(rename = "window-width")]
    pub window_width: u32,

    #[serde(rename = "window-height")]
    pub window_height: u32,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            engine: RenderEngine::Chromium,
            headless: true,
            chrome_path: None,
            user_agent: format!("crawl-keeper/{}", env!("CARGO_PKG_VERSION")),
            request_timeout_ms: 30_000,
            window_width: 1920,
            window_height: 1080,
        }
    }
}

/// Defaults applied to job submissions that leave a constraint unset
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JobDefaults {
    /// Extraction rule for job files that do not name one
    pub rule: String,

    #[serde(rename = "max-concurrency")]
    pub max_concurrency: u32,

    /// Retries allowed per unit after its first attempt
    #[serde(rename = "retry-budget")]
    pub retry_budget: u32,

    /// Render timeout per unit (milliseconds)
    #[serde(rename = "unit-timeout-ms")]
    pub unit_timeout_ms: u64,

    /// Fraction of permanently failed units above which a job is failed
    #[serde(rename = "poison-threshold")]
    pub poison_threshold: f64,

    /// Cap on frontier size, including discovered links
    #[serde(rename = "max-units")]
    pub max_units: usize,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            rule: "document".to_string(),
            max_concurrency: 2,
            retry_budget: 3,
            unit_timeout_ms: 30_000,
            poison_threshold: 0.5,
            max_units: 1_000,
        }
    }
}

/// Per-host politeness delays
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    pub enabled: bool,

    /// Lower bound of the random delay between two dispatches to one host (milliseconds)
    #[serde(rename = "min-delay-ms")]
    pub min_delay_ms: u64,

    /// Upper bound of the random delay between two dispatches to one host (milliseconds)
    #[serde(rename = "max-delay-ms")]
    pub max_delay_ms: u64,

    /// Take a long pause after this many dispatches to one host (0 disables)
    #[serde(rename = "long-pause-every")]
    pub long_pause_every: u32,

    #[serde(rename = "long-pause-min-ms")]
    pub long_pause_min_ms: u64,

    #[serde(rename = "long-pause-max-ms")]
    pub long_pause_max_ms: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_delay_ms: 2_000,
            max_delay_ms: 5_000,
            long_pause_every: 10,
            long_pause_min_ms: 13_000,
            long_pause_max_ms: 27_000,
        }
    }
}

/// The shape of an extraction rule entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleKind {
    /// Title, description and visible text of the page
    Document,
    /// One record per outgoing link
    Links,
    /// One record built from named fields
    Selectors,
    /// One record per element matching `item`, fields relative to it
    Listing,
}

/// An extraction rule declared in the configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RuleEntry {
    /// Identifier jobs refer to
    pub id: String,

    pub kind: RuleKind,

    /// Item selector for listing rules
    #[serde(default)]
    pub item: Option<String>,

    #[serde(default)]
    pub fields: Vec<FieldEntry>,

    /// Feed discovered links back into the job's frontier
    #[serde(rename = "follow-links", default)]
    pub follow_links: bool,

    /// Host patterns discovered links must match; defaults to the page's own host
    #[serde(rename = "allowed-hosts", default)]
    pub allowed_hosts: Vec<String>,
}

/// A named field of a selectors or listing rule
#[derive(Debug, Clone, Deserialize)]
pub struct FieldEntry {
    pub name: String,

    /// Primary CSS selector
    pub selector: String,

    /// Selectors tried in order when the primary one yields nothing
    #[serde(default)]
    pub fallback: Vec<String>,

    /// Read this attribute instead of the element text
    #[serde(default)]
    pub attr: Option<String>,

    /// Collect every match into an array
    #[serde(default)]
    pub multiple: bool,

    /// Fail the unit when no selector yields a value
    #[serde(default)]
    pub required: bool,
}

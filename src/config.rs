use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::OutputFormat;

/// Application-level constants
pub const APP_NAME: &str = "folio";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prefix of every environment override.
pub const ENV_PREFIX: &str = "FOLIO_";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },

    #[error("Cannot determine a data directory; set FOLIO_DATA_DIR")]
    NoDataDir,

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),
}

impl ConfigError {
    fn invalid(key: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// Get the application data directory: `<local data>/folio`.
pub fn app_data_dir() -> Result<PathBuf, ConfigError> {
    dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .map(|base| base.join(APP_NAME))
        .ok_or(ConfigError::NoDataDir)
}

// ═══════════════════════════════════════════
// Policy sections
// ═══════════════════════════════════════════

/// Retry/backoff policy. Delay for attempt `n` is `base_delay * multiplier^n`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityThresholds {
    /// Pages scoring below this are low-confidence.
    pub min_confidence: f32,
    /// Documents whose aggregate falls below this are quarantined.
    pub manual_review: f32,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            min_confidence: 0.7,
            manual_review: 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnsembleStrategy {
    PrimaryOnly,
    FastPrimaryThenFallback,
    BestOfBoth,
}

impl FromStr for EnsembleStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "primary_only" => Ok(Self::PrimaryOnly),
            "fast_primary_then_fallback" => Ok(Self::FastPrimaryThenFallback),
            "best_of_both" => Ok(Self::BestOfBoth),
            other => Err(ConfigError::invalid(
                "ensemble strategy",
                format!("unknown strategy '{other}'"),
            )),
        }
    }
}

/// One recognition backend, chosen at construction time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    Tesseract {
        binary: PathBuf,
        language: String,
        max_concurrency: Option<usize>,
    },
    OllamaVision {
        endpoint: String,
        model: String,
        timeout_secs: u64,
        /// A local Ollama instance serves one vision request at a time.
        max_concurrency: Option<usize>,
    },
}

impl BackendConfig {
    pub fn tesseract() -> Self {
        Self::Tesseract {
            binary: PathBuf::from("tesseract"),
            language: "eng".into(),
            max_concurrency: None,
        }
    }

    pub fn ollama_vision() -> Self {
        Self::OllamaVision {
            endpoint: "http://localhost:11434".into(),
            model: "llava:7b".into(),
            timeout_secs: 300,
            max_concurrency: Some(1),
        }
    }

    /// Parse a backend selector as used in `FOLIO_PRIMARY` / `FOLIO_SECONDARY`.
    /// `none` disables the slot.
    pub fn from_selector(key: &str, value: &str) -> Result<Option<Self>, ConfigError> {
        match value.trim() {
            "tesseract" => Ok(Some(Self::tesseract())),
            "ollama" | "ollama_vision" => Ok(Some(Self::ollama_vision())),
            "none" | "" => Ok(None),
            other => Err(ConfigError::invalid(key, format!("unknown backend '{other}'"))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Tesseract { .. } => "tesseract",
            Self::OllamaVision { .. } => "ollama_vision",
        }
    }

    pub fn max_concurrency(&self) -> Option<usize> {
        match self {
            Self::Tesseract {
                max_concurrency, ..
            }
            | Self::OllamaVision {
                max_concurrency, ..
            } => *max_concurrency,
        }
    }

    fn validate(&self, key: &str) -> Result<(), ConfigError> {
        if self.max_concurrency() == Some(0) {
            return Err(ConfigError::invalid(key, "max_concurrency must be at least 1"));
        }
        match self {
            Self::Tesseract { binary, language, .. } => {
                if binary.as_os_str().is_empty() {
                    return Err(ConfigError::invalid(key, "tesseract binary path is empty"));
                }
                if language.trim().is_empty() {
                    return Err(ConfigError::invalid(key, "tesseract language is empty"));
                }
            }
            Self::OllamaVision { endpoint, model, timeout_secs, .. } => {
                if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
                    return Err(ConfigError::invalid(
                        key,
                        format!("endpoint must be an http(s) URL, got '{endpoint}'"),
                    ));
                }
                if model.trim().is_empty() {
                    return Err(ConfigError::invalid(key, "vision model name is empty"));
                }
                if *timeout_secs == 0 {
                    return Err(ConfigError::invalid(key, "timeout must be positive"));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleConfig {
    pub strategy: EnsembleStrategy,
    /// Primary results at or above this skip the fallback.
    pub high_confidence: f32,
    /// Pages of one document recognized concurrently (1 = sequential).
    pub batch_parallelism: usize,
    pub primary: Option<BackendConfig>,
    pub secondary: Option<BackendConfig>,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            strategy: EnsembleStrategy::FastPrimaryThenFallback,
            high_confidence: 0.9,
            batch_parallelism: 1,
            primary: Some(BackendConfig::tesseract()),
            secondary: None,
        }
    }
}

// ═══════════════════════════════════════════
// Pipeline configuration
// ═══════════════════════════════════════════

/// Every tunable of a run. Built from defaults, then environment, then CLI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub data_dir: PathBuf,
    /// Local catalog root scanned by `sync` and read by the local fetcher.
    pub source_dir: PathBuf,
    pub db_path: PathBuf,
    pub output_dir: PathBuf,
    /// Root under which each job gets its own scratch directory.
    pub scratch_dir: PathBuf,
    /// Rolling log files are written here when set.
    pub log_dir: Option<PathBuf>,
    pub workers: usize,
    pub batch_size: usize,
    pub max_pages_per_document: u32,
    /// Finished jobs between memory reclamation passes, per worker.
    pub reclaim_interval: u64,
    /// How often a running pool re-stamps the jobs it holds.
    pub heartbeat_interval: Duration,
    /// In-flight jobs with no heartbeat for longer than this are orphans at
    /// startup. Must comfortably exceed `heartbeat_interval`.
    pub orphan_grace: Duration,
    pub stats_window: Duration,
    pub catalog_chunk_size: usize,
    pub output_formats: Vec<OutputFormat>,
    pub retry: RetryPolicy,
    pub quality: QualityThresholds,
    pub ensemble: EnsembleConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let data_dir = app_data_dir().unwrap_or_else(|_| PathBuf::from(".folio"));
        Self::with_data_dir(&data_dir)
    }
}

impl PipelineConfig {
    /// Defaults with every path placed under `data_dir`.
    pub fn with_data_dir(data_dir: &Path) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            source_dir: data_dir.join("inbox"),
            db_path: data_dir.join("ledger.db"),
            output_dir: data_dir.join("output"),
            scratch_dir: data_dir.join("scratch"),
            log_dir: Some(data_dir.join("logs")),
            workers: 4,
            batch_size: 16,
            max_pages_per_document: 1000,
            reclaim_interval: 100,
            heartbeat_interval: Duration::from_secs(30),
            orphan_grace: Duration::from_secs(300),
            stats_window: Duration::from_secs(3600),
            catalog_chunk_size: 100,
            output_formats: vec![OutputFormat::Txt, OutputFormat::Json],
            retry: RetryPolicy::default(),
            quality: QualityThresholds::default(),
            ensemble: EnsembleConfig::default(),
        }
    }

    /// Defaults overlaid with `FOLIO_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) over an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            let key = format!("{ENV_PREFIX}{name}");
            lookup(&key).map(|value| (key, value))
        };

        let mut config = match get("DATA_DIR") {
            Some((_, dir)) => Self::with_data_dir(Path::new(&dir)),
            None => Self::default(),
        };

        if let Some((_, v)) = get("SOURCE_DIR") {
            config.source_dir = PathBuf::from(v);
        }
        if let Some((_, v)) = get("DB") {
            config.db_path = PathBuf::from(v);
        }
        if let Some((_, v)) = get("OUTPUT_DIR") {
            config.output_dir = PathBuf::from(v);
        }
        if let Some((_, v)) = get("SCRATCH_DIR") {
            config.scratch_dir = PathBuf::from(v);
        }
        if let Some((_, v)) = get("LOG_DIR") {
            config.log_dir = match v.as_str() {
                "" | "none" => None,
                dir => Some(PathBuf::from(dir)),
            };
        }
        if let Some((k, v)) = get("WORKERS") {
            config.workers = parse(&k, &v)?;
        }
        if let Some((k, v)) = get("BATCH_SIZE") {
            config.batch_size = parse(&k, &v)?;
        }
        if let Some((k, v)) = get("MAX_PAGES") {
            config.max_pages_per_document = parse(&k, &v)?;
        }
        if let Some((k, v)) = get("RECLAIM_INTERVAL") {
            config.reclaim_interval = parse(&k, &v)?;
        }
        if let Some((k, v)) = get("HEARTBEAT_SECS") {
            config.heartbeat_interval = Duration::from_secs(parse(&k, &v)?);
        }
        if let Some((k, v)) = get("ORPHAN_GRACE_SECS") {
            config.orphan_grace = Duration::from_secs(parse(&k, &v)?);
        }
        if let Some((k, v)) = get("STATS_WINDOW_SECS") {
            config.stats_window = Duration::from_secs(parse(&k, &v)?);
        }
        if let Some((k, v)) = get("CATALOG_CHUNK") {
            config.catalog_chunk_size = parse(&k, &v)?;
        }
        if let Some((k, v)) = get("OUTPUT_FORMATS") {
            config.output_formats = OutputFormat::parse_list(&v)
                .map_err(|e| ConfigError::invalid(&k, e.to_string()))?;
        }

        if let Some((k, v)) = get("MAX_RETRIES") {
            config.retry.max_retries = parse(&k, &v)?;
        }
        if let Some((k, v)) = get("RETRY_DELAY_SECS") {
            config.retry.base_delay = Duration::from_secs(parse(&k, &v)?);
        }
        if let Some((k, v)) = get("BACKOFF") {
            config.retry.backoff_multiplier = parse(&k, &v)?;
        }

        if let Some((k, v)) = get("MIN_CONFIDENCE") {
            config.quality.min_confidence = parse(&k, &v)?;
        }
        if let Some((k, v)) = get("MANUAL_REVIEW_THRESHOLD") {
            config.quality.manual_review = parse(&k, &v)?;
        }

        if let Some((_, v)) = get("ENSEMBLE") {
            config.ensemble.strategy = v.parse()?;
        }
        if let Some((k, v)) = get("HIGH_CONFIDENCE") {
            config.ensemble.high_confidence = parse(&k, &v)?;
        }
        if let Some((k, v)) = get("BATCH_PARALLELISM") {
            config.ensemble.batch_parallelism = parse(&k, &v)?;
        }
        if let Some((k, v)) = get("PRIMARY") {
            config.ensemble.primary = BackendConfig::from_selector(&k, &v)?;
        }
        if let Some((k, v)) = get("SECONDARY") {
            config.ensemble.secondary = BackendConfig::from_selector(&k, &v)?;
        }

        for slot in [&mut config.ensemble.primary, &mut config.ensemble.secondary]
            .into_iter()
            .flatten()
        {
            match slot {
                BackendConfig::Tesseract { binary, language, .. } => {
                    if let Some((_, v)) = get("TESSERACT_BIN") {
                        *binary = PathBuf::from(v);
                    }
                    if let Some((_, v)) = get("TESSERACT_LANG") {
                        *language = v;
                    }
                }
                BackendConfig::OllamaVision { endpoint, model, .. } => {
                    if let Some((_, v)) = get("OLLAMA_URL") {
                        *endpoint = v;
                    }
                    if let Some((_, v)) = get("OLLAMA_MODEL") {
                        *model = v;
                    }
                }
            }
        }

        Ok(config)
    }

    /// Reject configurations that cannot run. Called before any claim.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::invalid("workers", "must be at least 1"));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::invalid("batch_size", "must be at least 1"));
        }
        if self.max_pages_per_document == 0 {
            return Err(ConfigError::invalid("max_pages_per_document", "must be at least 1"));
        }
        if self.reclaim_interval == 0 {
            return Err(ConfigError::invalid("reclaim_interval", "must be at least 1"));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::invalid("heartbeat_interval", "must be positive"));
        }
        if self.orphan_grace < self.heartbeat_interval * 2 {
            return Err(ConfigError::invalid(
                "orphan_grace",
                "must be at least twice heartbeat_interval",
            ));
        }
        if self.catalog_chunk_size == 0 {
            return Err(ConfigError::invalid("catalog_chunk_size", "must be at least 1"));
        }
        if self.stats_window.is_zero() {
            return Err(ConfigError::invalid("stats_window", "must be positive"));
        }
        if self.output_formats.is_empty() {
            return Err(ConfigError::invalid("output_formats", "at least one format is required"));
        }

        let retry = &self.retry;
        if !(retry.backoff_multiplier.is_finite() && retry.backoff_multiplier >= 1.0) {
            return Err(ConfigError::invalid(
                "backoff_multiplier",
                format!("must be >= 1.0, got {}", retry.backoff_multiplier),
            ));
        }

        check_unit("min_confidence", self.quality.min_confidence)?;
        check_unit("manual_review", self.quality.manual_review)?;
        check_unit("high_confidence", self.ensemble.high_confidence)?;
        if self.quality.manual_review > self.quality.min_confidence {
            return Err(ConfigError::invalid(
                "manual_review",
                "must not exceed min_confidence",
            ));
        }

        if self.ensemble.batch_parallelism == 0 {
            return Err(ConfigError::invalid("batch_parallelism", "must be at least 1"));
        }
        Ok(())
    }

    /// Backend selection checks, needed only by contexts that recognize.
    pub fn validate_backends(&self) -> Result<(), ConfigError> {
        match (&self.ensemble.primary, &self.ensemble.secondary) {
            (None, Some(_)) => {
                return Err(ConfigError::invalid(
                    "secondary backend",
                    "configured without a primary backend",
                ))
            }
            (None, None) => {
                return Err(ConfigError::invalid("primary backend", "no backend configured"))
            }
            (Some(primary), secondary) => {
                primary.validate("primary backend")?;
                if let Some(secondary) = secondary {
                    secondary.validate("secondary backend")?;
                }
            }
        }
        Ok(())
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::invalid(key, format!("'{value}': {e}")))
}

fn check_unit(key: &str, value: f32) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::invalid(key, format!("must be within [0, 1], got {value}")))
    }
}

//! Configuration management
//!
//! Everything is read from the environment once at start-up (an optional
//! `.env` is loaded by the binary first). Tunables fall back to the defaults
//! the components declare; credentials and endpoints have no defaults.

use appharvest_common::env::{env_bool, env_list, env_parse, env_string};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{HarvestError, Result};
use crate::framework::category::DEFAULT_RANK_COLLECTION;
use crate::framework::coordinator::OrchestratorConfig;
use crate::framework::resources::HealthPolicy;
use crate::framework::sink::SinkConfig;
use crate::framework::throttle::ThrottleConfig;
use crate::framework::worker::WorkerConfig;
use crate::store::rest::DEFAULT_STORE_TIMEOUT_SECS;
use crate::upstream::http::{DEFAULT_REVIEW_PAGE_SIZE, DEFAULT_UPSTREAM_TIMEOUT_SECS};

// ============================================================================
// Configuration Constants
// ============================================================================

/// Default directory for the progress ledger.
pub const DEFAULT_LEDGER_DIR: &str = "./logs/ledger";

/// Scraper sidecar address used by dry runs when `SCRAPER_URL` is unset.
pub const DEFAULT_SCRAPER_URL: &str = "http://127.0.0.1:3000";

pub const DEFAULT_LANGUAGE: &str = "en";
pub const DEFAULT_COUNTRY: &str = "us";

/// Every store category harvested when none are configured.
pub const DEFAULT_CATEGORIES: &[&str] = &[
    "ART_AND_DESIGN",
    "AUTO_AND_VEHICLES",
    "BEAUTY",
    "BOOKS_AND_REFERENCE",
    "BUSINESS",
    "COMICS",
    "COMMUNICATION",
    "DATING",
    "EDUCATION",
    "ENTERTAINMENT",
    "EVENTS",
    "FINANCE",
    "FOOD_AND_DRINK",
    "HEALTH_AND_FITNESS",
    "HOUSE_AND_HOME",
    "LIBRARIES_AND_DEMO",
    "LIFESTYLE",
    "MAPS_AND_NAVIGATION",
    "MEDICAL",
    "MUSIC_AND_AUDIO",
    "NEWS_AND_MAGAZINES",
    "PARENTING",
    "PERSONALIZATION",
    "PHOTOGRAPHY",
    "PRODUCTIVITY",
    "SHOPPING",
    "SOCIAL",
    "SPORTS",
    "TOOLS",
    "TRAVEL_AND_LOCAL",
    "VIDEO_PLAYERS",
    "WEATHER",
];

/// Downstream REST store
#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    pub url: Option<String>,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

/// Scraper sidecar
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamConfig {
    pub url: String,
    pub timeout: Duration,
    pub page_size: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HarvestConfig {
    pub store: StoreConfig,
    pub upstream: UpstreamConfig,
    pub sink: SinkConfig,
    pub throttle: ThrottleConfig,
    pub worker: WorkerConfig,
    pub orchestrator: OrchestratorConfig,
    pub ledger_dir: PathBuf,
    pub categories: Vec<String>,
    pub collect_metadata: bool,
    /// Chart the listing order is stored under; `None` disables rank rows
    pub rank_collection: Option<String>,
    /// Skip apps with no ledger record that already have stored reviews
    pub skip_stored_apps: bool,
    /// Write to an in-memory store instead of the REST store
    pub dry_run: bool,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig {
                url: None,
                api_key: None,
                timeout: Duration::from_secs(DEFAULT_STORE_TIMEOUT_SECS),
            },
            upstream: UpstreamConfig {
                url: DEFAULT_SCRAPER_URL.to_string(),
                timeout: Duration::from_secs(DEFAULT_UPSTREAM_TIMEOUT_SECS),
                page_size: DEFAULT_REVIEW_PAGE_SIZE,
            },
            sink: SinkConfig::default(),
            throttle: ThrottleConfig::default(),
            worker: WorkerConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            ledger_dir: PathBuf::from(DEFAULT_LEDGER_DIR),
            categories: DEFAULT_CATEGORIES.iter().map(|c| c.to_string()).collect(),
            collect_metadata: false,
            rank_collection: Some(DEFAULT_RANK_COLLECTION.to_string()),
            skip_stored_apps: true,
            dry_run: false,
        }
    }
}

fn millis(name: &str, default: Duration) -> Result<Duration> {
    Ok(Duration::from_millis(env_parse(name, default.as_millis() as u64)?))
}

fn secs(name: &str, default: Duration) -> Result<Duration> {
    Ok(Duration::from_secs(env_parse(name, default.as_secs())?))
}

impl HarvestConfig {
    /// Load configuration from the environment and validate it
    pub fn from_env(dry_run: bool) -> Result<Self> {
        let d = Self::default();

        let scraper_url = env_string("SCRAPER_URL");
        if scraper_url.is_none() && !dry_run {
            return Err(HarvestError::FatalConfig(
                "SCRAPER_URL must be set (or use --dry-run)".to_string(),
            ));
        }

        let config = Self {
            store: StoreConfig {
                url: env_string("SUPABASE_URL"),
                api_key: env_string("SUPABASE_KEY"),
                timeout: secs("HARVEST_STORE_TIMEOUT_SECS", d.store.timeout)?,
            },
            upstream: UpstreamConfig {
                url: scraper_url.unwrap_or(d.upstream.url),
                timeout: secs("HARVEST_UPSTREAM_TIMEOUT_SECS", d.upstream.timeout)?,
                page_size: env_parse("HARVEST_REVIEW_PAGE_SIZE", d.upstream.page_size)?,
            },
            sink: SinkConfig {
                chunk_size: env_parse("HARVEST_CHUNK_SIZE", d.sink.chunk_size)?,
                max_retries: env_parse("HARVEST_SINK_MAX_RETRIES", d.sink.max_retries)?,
                base_delay: millis("HARVEST_SINK_BASE_DELAY_MS", d.sink.base_delay)?,
                inter_chunk_delay: millis("HARVEST_INTER_CHUNK_DELAY_MS", d.sink.inter_chunk_delay)?,
                reviews_table: env_string("HARVEST_REVIEWS_TABLE").unwrap_or(d.sink.reviews_table),
                metadata_table: env_string("HARVEST_METADATA_TABLE").unwrap_or(d.sink.metadata_table),
                ranks_table: env_string("HARVEST_RANKS_TABLE").unwrap_or(d.sink.ranks_table),
            },
            throttle: ThrottleConfig {
                base_delay: millis("HARVEST_BASE_DELAY_MS", d.throttle.base_delay)?,
                min_delay: millis("HARVEST_MIN_DELAY_MS", d.throttle.min_delay)?,
                max_delay: millis("HARVEST_MAX_DELAY_MS", d.throttle.max_delay)?,
                high_water_rpm: env_parse("HARVEST_HIGH_WATER_RPM", d.throttle.high_water_rpm)?,
                low_water_rpm: env_parse("HARVEST_LOW_WATER_RPM", d.throttle.low_water_rpm)?,
                abort_after_errors: env_parse("HARVEST_ABORT_AFTER_ERRORS", d.throttle.abort_after_errors)?,
            },
            worker: WorkerConfig {
                buffer_size: env_parse("HARVEST_BUFFER_SIZE", d.worker.buffer_size)?,
                max_records_per_unit: env_parse(
                    "HARVEST_MAX_RECORDS_PER_UNIT",
                    d.worker.max_records_per_unit,
                )?,
                page_max_retries: env_parse("HARVEST_PAGE_MAX_RETRIES", d.worker.page_max_retries)?,
                retry_delay: millis("HARVEST_RETRY_DELAY_MS", d.worker.retry_delay)?,
                rate_limit_pause: millis("HARVEST_RATE_LIMIT_PAUSE_MS", d.worker.rate_limit_pause)?,
                memory_check_every: env_parse("HARVEST_MEMORY_CHECK_EVERY", d.worker.memory_check_every)?,
                memory_limit_mb: env_parse("HARVEST_MEMORY_LIMIT_MB", d.worker.memory_limit_mb)?,
                language: env_string("HARVEST_LANGUAGE").unwrap_or(d.worker.language),
                country: env_string("HARVEST_COUNTRY").unwrap_or(d.worker.country),
            },
            orchestrator: OrchestratorConfig {
                min_concurrent: env_parse("HARVEST_MIN_CONCURRENT", d.orchestrator.min_concurrent)?,
                max_concurrent: env_parse("HARVEST_MAX_CONCURRENT", d.orchestrator.max_concurrent)?,
                tick: secs("HARVEST_TICK_SECS", d.orchestrator.tick)?,
                stagger: secs("HARVEST_STAGGER_SECS", d.orchestrator.stagger)?,
                health: HealthPolicy {
                    unhealthy_memory_pct: env_parse(
                        "HARVEST_UNHEALTHY_MEMORY_PCT",
                        d.orchestrator.health.unhealthy_memory_pct,
                    )?,
                    severe_memory_pct: env_parse(
                        "HARVEST_SEVERE_MEMORY_PCT",
                        d.orchestrator.health.severe_memory_pct,
                    )?,
                    load_per_cpu_limit: env_parse(
                        "HARVEST_LOAD_PER_CPU_LIMIT",
                        d.orchestrator.health.load_per_cpu_limit,
                    )?,
                },
                retry_failed: env_bool("HARVEST_RETRY_FAILED", d.orchestrator.retry_failed)?,
                strict: env_bool("HARVEST_STRICT", d.orchestrator.strict)?,
            },
            ledger_dir: env_string("HARVEST_LEDGER_DIR").map_or(d.ledger_dir, PathBuf::from),
            categories: {
                let listed = env_list("HARVEST_CATEGORIES");
                if listed.is_empty() {
                    d.categories
                } else {
                    listed
                }
            },
            collect_metadata: env_bool("HARVEST_COLLECT_METADATA", d.collect_metadata)?,
            rank_collection: if env_bool("HARVEST_COLLECT_RANKS", d.rank_collection.is_some())? {
                env_string("HARVEST_RANK_COLLECTION").or(d.rank_collection)
            } else {
                None
            },
            skip_stored_apps: env_bool("HARVEST_SKIP_STORED_APPS", d.skip_stored_apps)?,
            dry_run,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        fn fail(message: String) -> Result<()> {
            Err(HarvestError::FatalConfig(message))
        }

        if !self.dry_run {
            if self.store.url.is_none() {
                return fail("SUPABASE_URL must be set (or use --dry-run)".to_string());
            }
            if self.store.api_key.is_none() {
                return fail("SUPABASE_KEY must be set (or use --dry-run)".to_string());
            }
        }

        if self.sink.chunk_size == 0 {
            return fail("chunk size must be greater than 0".to_string());
        }
        if self.worker.buffer_size == 0 {
            return fail("buffer size must be greater than 0".to_string());
        }
        if self.worker.max_records_per_unit == 0 {
            return fail("max records per unit must be greater than 0".to_string());
        }
        if self.upstream.page_size == 0 {
            return fail("review page size must be greater than 0".to_string());
        }

        let t = &self.throttle;
        if t.min_delay > t.base_delay || t.base_delay > t.max_delay {
            return fail(format!(
                "throttle delays must satisfy min <= base <= max (got {}ms / {}ms / {}ms)",
                t.min_delay.as_millis(),
                t.base_delay.as_millis(),
                t.max_delay.as_millis()
            ));
        }
        if t.low_water_rpm > t.high_water_rpm {
            return fail(format!(
                "low water rate ({}) cannot exceed high water rate ({})",
                t.low_water_rpm, t.high_water_rpm
            ));
        }

        let o = &self.orchestrator;
        if o.min_concurrent == 0 {
            return fail("min concurrent must be greater than 0".to_string());
        }
        if o.min_concurrent > o.max_concurrent {
            return fail(format!(
                "min concurrent ({}) cannot be greater than max concurrent ({})",
                o.min_concurrent, o.max_concurrent
            ));
        }
        if o.tick.is_zero() {
            return fail("tick interval must be greater than 0".to_string());
        }

        let h = &o.health;
        let valid_pct = |p: f64| (0.0..=100.0).contains(&p);
        if !valid_pct(h.unhealthy_memory_pct) || !valid_pct(h.severe_memory_pct) {
            return fail("memory thresholds must be percentages between 0 and 100".to_string());
        }
        if h.unhealthy_memory_pct > h.severe_memory_pct {
            return fail(format!(
                "unhealthy memory threshold ({}) cannot exceed severe threshold ({})",
                h.unhealthy_memory_pct, h.severe_memory_pct
            ));
        }
        if h.load_per_cpu_limit <= 0.0 {
            return fail("load per CPU limit must be positive".to_string());
        }

        if self.categories.is_empty() {
            return fail("no categories configured".to_string());
        }

        Ok(())
    }
}

use crate::sources::twelvedata::TWELVE_DATA_REST_URL;
use crate::sources::twelvedata_ws::TWELVE_DATA_WS_URL;
use std::env;
use std::time::Duration;

/// Monitor cadence and retry budget.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub contract_interval: Duration,
    pub loan_interval: Duration,
    /// Pause between loans inside one accrual cycle.
    pub loan_processing_delay: Duration,
    pub loan_max_retries: u32,
    pub robot_interval: Duration,
    /// `None` leaves option expiry to the lazy per-user sweep.
    pub option_sweep_interval: Option<Duration>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            contract_interval: Duration::from_millis(5000),
            loan_interval: Duration::from_millis(10_000),
            loan_processing_delay: Duration::from_millis(200),
            loan_max_retries: 3,
            robot_interval: Duration::from_millis(10_000),
            option_sweep_interval: None,
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub database_path: String,
    pub twelve_data_api_key: Option<String>,
    pub twelve_data_rest_url: String,
    pub twelve_data_ws_url: String,
    /// Upper bound on any single quote fetch.
    pub quote_timeout: Duration,
    pub monitors: MonitorConfig,
    /// Shared secret for `/ws/admin/trades`; the feed is closed when unset.
    pub admin_feed_token: Option<String>,
}

fn env_ms(key: &str, default: u64) -> Duration {
    Duration::from_millis(
        env::var(key)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default),
    )
}

fn env_non_empty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let defaults = MonitorConfig::default();
        let option_sweep = env_ms("OPTION_SWEEP_INTERVAL_MS", 0);

        Self {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(3001),
            database_path: env::var("DATABASE_PATH")
                .unwrap_or_else(|_| "data/tradeledger.db".to_string()),
            twelve_data_api_key: env_non_empty("TWELVE_DATA_API_KEY"),
            twelve_data_rest_url: env::var("TWELVE_DATA_REST_URL")
                .unwrap_or_else(|_| TWELVE_DATA_REST_URL.to_string()),
            twelve_data_ws_url: env::var("TWELVE_DATA_WS_URL")
                .unwrap_or_else(|_| TWELVE_DATA_WS_URL.to_string()),
            quote_timeout: env_ms("QUOTE_TIMEOUT_MS", 5000),
            monitors: MonitorConfig {
                contract_interval: env_ms("CONTRACT_MONITOR_INTERVAL_MS", 5000),
                loan_interval: env_ms("LOAN_MONITOR_INTERVAL_MS", 10_000),
                loan_processing_delay: env_ms("LOAN_PROCESSING_DELAY_MS", 200),
                loan_max_retries: env::var("LOAN_MAX_RETRIES")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .filter(|n| *n > 0)
                    .unwrap_or(defaults.loan_max_retries),
                robot_interval: env_ms("ROBOT_MONITOR_INTERVAL_MS", 10_000),
                option_sweep_interval: (!option_sweep.is_zero()).then_some(option_sweep),
            },
            admin_feed_token: env_non_empty("ADMIN_FEED_TOKEN"),
        }
    }
}

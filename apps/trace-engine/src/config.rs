use std::{
    env,
    net::{AddrParseError, SocketAddr},
    time::Duration,
};

use thiserror::Error;

use crate::billing::types::PricingTable;
use crate::bulk::BulkPollPolicy;
use crate::provider::ProviderSettings;
use crate::trace::service::PollPolicy;

#[derive(Clone, Debug)]
pub struct Config {
    pub service_name: String,
    pub bind_addr: SocketAddr,
    pub db_url: Option<String>,
    pub provider_base_url: Option<String>,
    pub provider_api_key: Option<String>,
    pub provider_timeout_ms: u64,
    pub provider_min_batch_size: usize,
    pub dedup_window_days: i64,
    pub single_poll_initial_delay_ms: u64,
    pub single_poll_interval_ms: u64,
    pub single_poll_max_attempts: u32,
    pub bulk_poll_interval_ms: u64,
    pub bulk_poll_max_attempts: u32,
    pub bulk_max_records: usize,
    pub bulk_supervisor_enabled: bool,
    pub pricing: PricingTable,
    pub webhook_url: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid TRACE_BIND_ADDR: {0}")]
    BindAddrParse(#[from] AddrParseError),
    #[error("invalid provider config: {0}")]
    InvalidProviderConfig(String),
    #[error("invalid polling config: {0}")]
    InvalidPollingConfig(String),
    #[error("invalid bulk config: {0}")]
    InvalidBulkConfig(String),
    #[error("invalid pricing config: {0}")]
    InvalidPricingConfig(String),
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: "trace-engine".to_string(),
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 4200)),
            db_url: None,
            provider_base_url: None,
            provider_api_key: None,
            provider_timeout_ms: 15_000,
            provider_min_batch_size: 2,
            dedup_window_days: 90,
            single_poll_initial_delay_ms: 8_000,
            single_poll_interval_ms: 3_000,
            single_poll_max_attempts: 10,
            bulk_poll_interval_ms: 15_000,
            bulk_poll_max_attempts: 480,
            bulk_max_records: 10_000,
            bulk_supervisor_enabled: true,
            pricing: PricingTable::default(),
            webhook_url: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let bind_addr = lookup("TRACE_BIND_ADDR")
            .unwrap_or_else(|| defaults.bind_addr.to_string())
            .parse::<SocketAddr>()?;
        let service_name =
            non_empty(lookup("TRACE_SERVICE_NAME")).unwrap_or(defaults.service_name);
        let db_url = non_empty(lookup("DB_URL")).or_else(|| non_empty(lookup("DATABASE_URL")));

        let provider_base_url = non_empty(lookup("TRACE_PROVIDER_BASE_URL"));
        let provider_api_key = non_empty(lookup("TRACE_PROVIDER_API_KEY"));
        let provider_timeout_ms = parse_u64_env_lookup(
            &lookup,
            "TRACE_PROVIDER_TIMEOUT_MS",
            defaults.provider_timeout_ms,
            250,
            120_000,
        )
        .map_err(ConfigError::InvalidProviderConfig)?;
        let provider_min_batch_size = parse_u64_env_lookup(
            &lookup,
            "TRACE_PROVIDER_MIN_BATCH_SIZE",
            defaults.provider_min_batch_size as u64,
            1,
            100,
        )
        .map_err(ConfigError::InvalidProviderConfig)? as usize;

        let dedup_window_days = parse_u64_env_lookup(
            &lookup,
            "TRACE_DEDUP_WINDOW_DAYS",
            defaults.dedup_window_days as u64,
            1,
            3_650,
        )
        .map_err(ConfigError::InvalidPollingConfig)? as i64;
        let single_poll_initial_delay_ms = parse_u64_env_lookup(
            &lookup,
            "TRACE_SINGLE_POLL_INITIAL_DELAY_MS",
            defaults.single_poll_initial_delay_ms,
            0,
            300_000,
        )
        .map_err(ConfigError::InvalidPollingConfig)?;
        let single_poll_interval_ms = parse_u64_env_lookup(
            &lookup,
            "TRACE_SINGLE_POLL_INTERVAL_MS",
            defaults.single_poll_interval_ms,
            10,
            300_000,
        )
        .map_err(ConfigError::InvalidPollingConfig)?;
        let single_poll_max_attempts = parse_u64_env_lookup(
            &lookup,
            "TRACE_SINGLE_POLL_MAX_ATTEMPTS",
            u64::from(defaults.single_poll_max_attempts),
            1,
            1_000,
        )
        .map_err(ConfigError::InvalidPollingConfig)? as u32;

        let bulk_poll_interval_ms = parse_u64_env_lookup(
            &lookup,
            "TRACE_BULK_POLL_INTERVAL_MS",
            defaults.bulk_poll_interval_ms,
            10,
            3_600_000,
        )
        .map_err(ConfigError::InvalidBulkConfig)?;
        let bulk_poll_max_attempts = parse_u64_env_lookup(
            &lookup,
            "TRACE_BULK_POLL_MAX_ATTEMPTS",
            u64::from(defaults.bulk_poll_max_attempts),
            1,
            100_000,
        )
        .map_err(ConfigError::InvalidBulkConfig)? as u32;
        let bulk_max_records = parse_u64_env_lookup(
            &lookup,
            "TRACE_BULK_MAX_RECORDS",
            defaults.bulk_max_records as u64,
            1,
            10_000,
        )
        .map_err(ConfigError::InvalidBulkConfig)? as usize;
        let bulk_supervisor_enabled = parse_bool_env_lookup(
            &lookup,
            "TRACE_BULK_SUPERVISOR_ENABLED",
            defaults.bulk_supervisor_enabled,
        )
        .map_err(ConfigError::InvalidBulkConfig)?;

        let pricing = PricingTable {
            standard_rate_cents: parse_i64_env_lookup(
                &lookup,
                "TRACE_RATE_STANDARD_CENTS",
                defaults.pricing.standard_rate_cents,
                1,
                100_000,
            )
            .map_err(ConfigError::InvalidPricingConfig)?,
            premium_rate_cents: parse_i64_env_lookup(
                &lookup,
                "TRACE_RATE_PREMIUM_CENTS",
                defaults.pricing.premium_rate_cents,
                1,
                100_000,
            )
            .map_err(ConfigError::InvalidPricingConfig)?,
            provider_cost_cents: parse_i64_env_lookup(
                &lookup,
                "TRACE_PROVIDER_COST_CENTS",
                defaults.pricing.provider_cost_cents,
                0,
                100_000,
            )
            .map_err(ConfigError::InvalidPricingConfig)?,
        };
        if pricing.premium_rate_cents > pricing.standard_rate_cents {
            return Err(ConfigError::InvalidPricingConfig(
                "TRACE_RATE_PREMIUM_CENTS must not exceed TRACE_RATE_STANDARD_CENTS".to_string(),
            ));
        }

        Ok(Self {
            service_name,
            bind_addr,
            db_url,
            provider_base_url,
            provider_api_key,
            provider_timeout_ms,
            provider_min_batch_size,
            dedup_window_days,
            single_poll_initial_delay_ms,
            single_poll_interval_ms,
            single_poll_max_attempts,
            bulk_poll_interval_ms,
            bulk_poll_max_attempts,
            bulk_max_records,
            bulk_supervisor_enabled,
            pricing,
            webhook_url: non_empty(lookup("TRACE_WEBHOOK_URL")),
        })
    }

    pub fn provider_settings(&self) -> ProviderSettings {
        ProviderSettings {
            base_url: self.provider_base_url.clone(),
            api_key: self.provider_api_key.clone(),
            timeout_ms: self.provider_timeout_ms,
            min_batch_size: self.provider_min_batch_size,
        }
    }

    pub fn single_poll_policy(&self) -> PollPolicy {
        PollPolicy {
            initial_delay: Duration::from_millis(self.single_poll_initial_delay_ms),
            interval: Duration::from_millis(self.single_poll_interval_ms),
            max_attempts: self.single_poll_max_attempts,
        }
    }

    /// Age after which a record or bulk job still `pending` is treated as
    /// abandoned: twice the provider request timeout.
    pub fn pending_timeout(&self) -> Duration {
        Duration::from_millis(self.provider_timeout_ms.saturating_mul(2))
    }

    pub fn bulk_poll_policy(&self) -> BulkPollPolicy {
        BulkPollPolicy {
            interval: Duration::from_millis(self.bulk_poll_interval_ms),
            max_attempts: self.bulk_poll_max_attempts,
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_u64_env_lookup(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: u64,
    min: u64,
    max: u64,
) -> Result<u64, String> {
    parse_with_lookup(lookup, key, default, |raw| {
        raw.trim()
            .parse::<u64>()
            .map_err(|error| format!("{key}: {error}"))
            .map(|value| value.clamp(min, max))
    })
}

fn parse_i64_env_lookup(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: i64,
    min: i64,
    max: i64,
) -> Result<i64, String> {
    parse_with_lookup(lookup, key, default, |raw| {
        raw.trim()
            .parse::<i64>()
            .map_err(|error| format!("{key}: {error}"))
            .map(|value| value.clamp(min, max))
    })
}

fn parse_bool_env_lookup(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: bool,
) -> Result<bool, String> {
    parse_with_lookup(lookup, key, default, |raw| {
        match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => Err(format!("{key}: {other}")),
        }
    })
}

fn parse_with_lookup<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
    parser: impl FnOnce(String) -> Result<T, String>,
) -> Result<T, String> {
    match lookup(key) {
        Some(raw) => parser(raw),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::{Config, ConfigError};

    fn config_from(values: &HashMap<&str, &str>) -> Result<Config, ConfigError> {
        Config::from_lookup(|key| values.get(key).map(ToString::to_string))
    }

    #[test]
    fn defaults_apply_without_env() {
        let config = config_from(&HashMap::new()).expect("defaults parse");
        assert_eq!(config.bind_addr.to_string(), "127.0.0.1:4200");
        assert_eq!(config.service_name, "trace-engine");
        assert!(config.db_url.is_none());
        assert_eq!(config.dedup_window_days, 90);
        assert_eq!(config.single_poll_initial_delay_ms, 8_000);
        assert_eq!(config.single_poll_interval_ms, 3_000);
        assert_eq!(config.bulk_max_records, 10_000);
        assert!(config.bulk_supervisor_enabled);
        assert_eq!(config.pricing.standard_rate_cents, 11);
        assert_eq!(config.pricing.premium_rate_cents, 7);
        assert_eq!(config.pricing.provider_cost_cents, 4);
    }

    #[test]
    fn overrides_are_parsed_and_clamped() {
        let values = HashMap::from([
            ("TRACE_BIND_ADDR", "0.0.0.0:8080"),
            ("DATABASE_URL", "postgres://localhost/trace"),
            ("TRACE_PROVIDER_BASE_URL", " https://provider.test/api "),
            ("TRACE_PROVIDER_TIMEOUT_MS", "5"),
            ("TRACE_BULK_MAX_RECORDS", "250000"),
            ("TRACE_BULK_SUPERVISOR_ENABLED", "off"),
            ("TRACE_RATE_STANDARD_CENTS", "15"),
            ("TRACE_WEBHOOK_URL", ""),
        ]);
        let config = config_from(&values).expect("config parse");
        assert_eq!(config.bind_addr.port(), 8080);
        assert_eq!(config.db_url.as_deref(), Some("postgres://localhost/trace"));
        assert_eq!(
            config.provider_base_url.as_deref(),
            Some("https://provider.test/api")
        );
        assert_eq!(config.provider_timeout_ms, 250);
        assert_eq!(config.bulk_max_records, 10_000);
        assert!(!config.bulk_supervisor_enabled);
        assert_eq!(config.pricing.standard_rate_cents, 15);
        assert!(config.webhook_url.is_none());
    }

    #[test]
    fn invalid_values_name_the_key() {
        let values = HashMap::from([("TRACE_SINGLE_POLL_MAX_ATTEMPTS", "many")]);
        match config_from(&values) {
            Err(ConfigError::InvalidPollingConfig(message)) => {
                assert!(message.contains("TRACE_SINGLE_POLL_MAX_ATTEMPTS"));
            }
            other => panic!("unexpected result: {other:?}"),
        }

        let values = HashMap::from([("TRACE_BIND_ADDR", "not-an-addr")]);
        assert!(matches!(
            config_from(&values),
            Err(ConfigError::BindAddrParse(_))
        ));
    }

    #[test]
    fn success_rates_are_clamped_to_at_least_one_cent() {
        let values = HashMap::from([
            ("TRACE_RATE_STANDARD_CENTS", "0"),
            ("TRACE_RATE_PREMIUM_CENTS", "0"),
            ("TRACE_PROVIDER_COST_CENTS", "0"),
        ]);
        let config = config_from(&values).expect("config parse");
        assert_eq!(config.pricing.standard_rate_cents, 1);
        assert_eq!(config.pricing.premium_rate_cents, 1);
        assert_eq!(config.pricing.provider_cost_cents, 0);
    }

    #[test]
    fn premium_rate_above_standard_is_rejected() {
        let values = HashMap::from([
            ("TRACE_RATE_STANDARD_CENTS", "5"),
            ("TRACE_RATE_PREMIUM_CENTS", "9"),
        ]);
        assert!(matches!(
            config_from(&values),
            Err(ConfigError::InvalidPricingConfig(_))
        ));
    }
}

use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

use crate::options::RetryPolicy;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "query_cache".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Defaults for the per-key [`QueryOptions`](crate::QueryOptions).
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct CacheDefaults {
    /// How long a successful result is considered fresh.
    ///
    /// `0s` refetches on every attach, `null` never refetches automatically.
    #[serde(with = "humantime_serde")]
    pub fresh_for: Option<Duration>,
    /// How long an entry is kept after its last subscriber detached.
    #[serde(with = "humantime_serde")]
    pub gc_time: Duration,
    /// The same as `gc_time`, for mutations.
    ///
    /// Defaults to `0s`, which removes a mutation as soon as nobody is interested in it anymore.
    #[serde(with = "humantime_serde")]
    pub mutation_gc_time: Duration,
    /// Retries of failed queries.
    pub retry: RetryPolicy,
    /// Whether a new subscriber refetches an entry that failed, even if it is still fresh.
    pub refetch_on_error_attach: bool,
}

impl Default for CacheDefaults {
    fn default() -> Self {
        Self {
            fresh_for: Some(Duration::from_secs(5)),
            gc_time: Duration::from_secs(5 * 60),
            mutation_gc_time: Duration::ZERO,
            retry: RetryPolicy::default(),
            refetch_on_error_attach: true,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration.
    pub logging: Logging,
    /// Metrics configuration.
    pub metrics: Metrics,
    /// Defaults for every entry in the cache.
    pub defaults: CacheDefaults,
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_config() {
        // It should be possible to set individual values in reasonable units without
        // affecting the other defaults.
        let cfg = Config::get(None).unwrap();
        assert_eq!(cfg.defaults, CacheDefaults::default());

        let yaml = r#"
            defaults:
              gc_time: 30s
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.defaults.gc_time, Duration::from_secs(30));
        assert_eq!(cfg.defaults.fresh_for, Some(Duration::from_secs(5)));
        assert_eq!(cfg.defaults.retry, RetryPolicy::default());

        let yaml = r#"
            defaults:
              retry:
                retries: 1
                delay: 250ms
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.defaults.retry.retries, 1);
        assert_eq!(cfg.defaults.retry.delay, Duration::from_millis(250));
        assert_eq!(cfg.defaults.retry.max_delay, Duration::from_secs(30));
    }

    #[test]
    fn test_never_stale() {
        // It should be possible to set `fresh_for` to `None` meaning "never refetch".
        let yaml = r#"
            defaults:
              fresh_for: null
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.defaults.fresh_for, None);
        assert_eq!(cfg.defaults.gc_time, CacheDefaults::default().gc_time);
    }

    #[test]
    fn test_always_stale() {
        let yaml = r#"
            defaults:
              fresh_for: 0s
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.defaults.fresh_for, Some(Duration::ZERO));
    }

    #[test]
    fn test_logging() {
        let yaml = r#"
            logging:
              level: debug
              format: json
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.logging.level, LevelFilter::DEBUG);
        assert_eq!(cfg.logging.format, LogFormat::Json);

        let yaml = r#"
            logging:
              level: loud
        "#;
        assert!(Config::from_reader(yaml.as_bytes()).is_err());
    }

    #[test]
    fn test_unknown_fields() {
        // Unknown fields should not cause failure
        let yaml = r#"
            defaults:
              not_an_option: 1h
        "#;
        let cfg = Config::from_reader(yaml.as_bytes());
        assert!(cfg.is_ok());
    }

    #[test]
    fn test_empty_file() {
        // Empty files aren't supported
        let yaml = r#""#;
        let result = Config::from_reader(yaml.as_bytes());
        assert!(result.is_err());
    }
}

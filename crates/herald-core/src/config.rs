//! Configuration: defaults, then an optional JSON file, then `HERALD_*`
//! environment overrides.
//!
//! Durations are written in milliseconds in the file (`*_ms` keys).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::BackoffPolicy;
use crate::ports::MailSettings;

pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const DEFAULT_TOPIC: &str = "notifications";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("environment variable {var} has invalid value {value:?}")]
    Env { var: &'static str, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    /// Rows claimed per cycle.
    pub batch_size: usize,
    /// Idle time between cycles.
    #[serde(rename = "poll_interval_ms", with = "millis")]
    pub poll_interval: Duration,
    /// Concurrent producer loops.
    pub instances: usize,
    /// Upper bound on waiting for publish acknowledgements at shutdown.
    #[serde(rename = "flush_timeout_ms", with = "millis")]
    pub flush_timeout: Duration,
    #[serde(rename = "backoff_cap_ms", with = "millis")]
    pub backoff_cap: Duration,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval: Duration::from_secs(3),
            instances: 1,
            flush_timeout: Duration::from_secs(10),
            backoff_cap: BackoffPolicy::DEFAULT_CAP,
        }
    }
}

impl ProducerConfig {
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.backoff_cap)
    }

    pub(crate) fn check(&self, problems: &mut Vec<&'static str>) {
        if self.batch_size == 0 {
            problems.push("producer.batch_size must be at least 1");
        }
        if self.instances == 0 {
            problems.push("producer.instances must be at least 1");
        }
        if self.backoff_cap.is_zero() {
            problems.push("producer.backoff_cap_ms must be positive");
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Topic the consumer group subscribes to.
    pub topic: String,
    #[serde(rename = "poll_timeout_ms", with = "millis")]
    pub poll_timeout: Duration,
    /// Pause after a deferred message or a failed cycle, so an undeliverable
    /// message is not retried in a hot loop.
    #[serde(rename = "error_pause_ms", with = "millis")]
    pub error_pause: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            topic: DEFAULT_TOPIC.to_string(),
            poll_timeout: Duration::from_secs(1),
            error_pause: Duration::from_secs(1),
        }
    }
}

impl ConsumerConfig {
    pub(crate) fn check(&self, problems: &mut Vec<&'static str>) {
        if self.topic.trim().is_empty() {
            problems.push("consumer.topic must not be empty");
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    #[serde(rename = "interval_ms", with = "millis")]
    pub interval: Duration,
    /// A `Producing` row older than this is assumed abandoned.
    #[serde(rename = "claim_timeout_ms", with = "millis")]
    pub claim_timeout: Duration,
}

impl ReaperConfig {
    pub(crate) fn check(&self, problems: &mut Vec<&'static str>) {
        if self.claim_timeout.is_zero() {
            problems.push("reaper.claim_timeout_ms must be positive");
        }
    }
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            claim_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeraldConfig {
    /// Default tracing filter; `RUST_LOG` wins when set.
    pub log_level: String,
    pub log_json: bool,
    /// SQLite file. `None` runs on the in-memory store.
    pub database_path: Option<PathBuf>,
    /// Partitions of the in-process broker.
    pub broker_partitions: usize,
    pub producer: ProducerConfig,
    pub consumer: ConsumerConfig,
    pub reaper: ReaperConfig,
    pub mail: MailSettings,
}

impl Default for HeraldConfig {
    fn default() -> Self {
        Self {
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            log_json: false,
            database_path: None,
            broker_partitions: 3,
            producer: ProducerConfig::default(),
            consumer: ConsumerConfig::default(),
            reaper: ReaperConfig::default(),
            mail: MailSettings::default(),
        }
    }
}

impl HeraldConfig {
    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.load_from_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Read `path` (missing keys take defaults), then apply the environment.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.load_from_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn load_from_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|var| std::env::var(var).ok())
    }

    /// Apply `HERALD_*` overrides looked up through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("HERALD_LOG_LEVEL") {
            self.log_level = v;
        }
        if let Some(v) = lookup("HERALD_LOG_JSON") {
            self.log_json = parse_env("HERALD_LOG_JSON", v)?;
        }
        if let Some(v) = lookup("HERALD_DATABASE_PATH") {
            self.database_path = (!v.is_empty()).then(|| PathBuf::from(v));
        }
        if let Some(v) = lookup("HERALD_BROKER_PARTITIONS") {
            self.broker_partitions = parse_env("HERALD_BROKER_PARTITIONS", v)?;
        }
        if let Some(v) = lookup("HERALD_PRODUCER_BATCH_SIZE") {
            self.producer.batch_size = parse_env("HERALD_PRODUCER_BATCH_SIZE", v)?;
        }
        if let Some(v) = lookup("HERALD_PRODUCER_INSTANCES") {
            self.producer.instances = parse_env("HERALD_PRODUCER_INSTANCES", v)?;
        }
        if let Some(v) = lookup("HERALD_PRODUCER_POLL_INTERVAL_MS") {
            self.producer.poll_interval =
                Duration::from_millis(parse_env("HERALD_PRODUCER_POLL_INTERVAL_MS", v)?);
        }
        if let Some(v) = lookup("HERALD_CONSUMER_TOPIC") {
            self.consumer.topic = v;
        }
        if let Some(v) = lookup("HERALD_MAIL_ENDPOINT") {
            self.mail.endpoint = v;
        }
        if let Some(v) = lookup("HERALD_MAIL_PORT") {
            self.mail.port = parse_env("HERALD_MAIL_PORT", v)?;
        }
        if let Some(v) = lookup("HERALD_MAIL_USERNAME") {
            self.mail.username = v;
        }
        if let Some(v) = lookup("HERALD_MAIL_PASSWORD") {
            self.mail.password = v;
        }
        if let Some(v) = lookup("HERALD_MAIL_SENDER_ADDRESS") {
            self.mail.sender_address = v;
        }
        if let Some(v) = lookup("HERALD_MAIL_SENDER_NAME") {
            self.mail.sender_name = v;
        }
        Ok(())
    }

    /// Fail fast on settings the loops cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();
        self.producer.check(&mut problems);
        self.consumer.check(&mut problems);
        self.reaper.check(&mut problems);
        if self.broker_partitions == 0 {
            problems.push("broker_partitions must be at least 1");
        }
        into_result(problems)
    }
}

pub(crate) fn into_result(problems: Vec<&'static str>) -> Result<(), ConfigError> {
    if problems.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::Invalid(problems.join("; ")))
    }
}

fn parse_env<T: std::str::FromStr>(var: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Env { var, value })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn defaults_match_documented_values() {
        let config = HeraldConfig::default();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.database_path, None);
        assert_eq!(config.producer.batch_size, 100);
        assert_eq!(config.producer.poll_interval, Duration::from_secs(3));
        assert_eq!(config.producer.flush_timeout, Duration::from_secs(10));
        assert_eq!(config.producer.backoff_cap, Duration::from_secs(64));
        assert_eq!(config.consumer.poll_timeout, Duration::from_secs(1));
        assert_eq!(config.reaper.claim_timeout, Duration::from_secs(120));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("herald.json");
        std::fs::write(
            &path,
            r#"{
                "database_path": "/var/lib/herald/outbox.db",
                "producer": { "batch_size": 10, "poll_interval_ms": 250 },
                "mail": { "endpoint": "smtp.example.com", "sender_address": "noreply@example.com" }
            }"#,
        )
        .unwrap();

        let config = HeraldConfig::load_from_file(&path).unwrap();
        assert_eq!(
            config.database_path,
            Some(PathBuf::from("/var/lib/herald/outbox.db"))
        );
        assert_eq!(config.producer.batch_size, 10);
        assert_eq!(config.producer.poll_interval, Duration::from_millis(250));
        assert_eq!(config.producer.instances, 1);
        assert_eq!(config.mail.port, 587);
        assert_eq!(config.consumer.topic, DEFAULT_TOPIC);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempdir().unwrap();
        let err = HeraldConfig::load_from_file(&dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn overrides_apply_and_reject_garbage() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("HERALD_LOG_LEVEL", "debug"),
            ("HERALD_PRODUCER_INSTANCES", "4"),
            ("HERALD_MAIL_PASSWORD", "s3cret"),
            ("HERALD_DATABASE_PATH", ""),
        ]);
        let mut config = HeraldConfig {
            database_path: Some(PathBuf::from("x.db")),
            ..HeraldConfig::default()
        };
        config
            .apply_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.log_level, "debug");
        assert_eq!(config.producer.instances, 4);
        assert_eq!(config.mail.password, "s3cret");
        assert_eq!(config.database_path, None);

        let err = config
            .apply_overrides(|k| (k == "HERALD_MAIL_PORT").then(|| "smtp".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { var: "HERALD_MAIL_PORT", .. }));
    }

    #[test]
    fn validate_reports_every_problem() {
        let mut config = HeraldConfig::default();
        config.producer.batch_size = 0;
        config.producer.instances = 0;

        let ConfigError::Invalid(msg) = config.validate().unwrap_err() else {
            panic!("expected Invalid");
        };
        assert!(msg.contains("batch_size"));
        assert!(msg.contains("instances"));
    }

    #[test]
    fn password_is_not_written_back() {
        let mut config = HeraldConfig::default();
        config.mail.password = "s3cret".into();
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("s3cret"));
    }
}

// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Republisher configuration.
//!
//! Supports both programmatic and file-based configuration.
//!
//! ```toml
//! name = "plant-repub"
//!
//! [source]
//! endpoints = ["tcp://source:1883"]
//! topics = ["sensors/#"]
//!
//! [sink]
//! endpoints = ["tcp://sink:9092"]
//! max_pending = 10000
//! overflow = "drop_oldest"
//!
//! [sink.schemas]
//! "readings" = "schemas/reading.avsc"
//!
//! [[rules]]
//! match = { topic = "sensors/+" }
//! template = '{"v": {value}}'
//! destination = "out/%topic%"
//! ```

use crate::error::ConfigError;
use crate::listener::ListenerOptions;
use crate::pool::PoolOptions;
use crate::queue::OverflowPolicy;
use crate::rules::FieldMatcher;
use crate::schema::Schema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Republisher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepubConfig {
    /// Instance name (for identification).
    #[serde(default = "default_name")]
    pub name: String,

    /// Where messages come from.
    #[serde(default)]
    pub source: SourceConfig,

    /// Where messages go.
    #[serde(default)]
    pub sink: SinkConfig,

    /// Rules, evaluated in order.
    #[serde(default)]
    pub rules: Vec<RuleConfig>,

    /// Statistics reporting interval (seconds, 0 = off).
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,

    /// Log level.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Inbound side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default)]
    pub endpoints: Vec<String>,

    /// Subscription filters (MQTT wildcards allowed).
    #[serde(default = "default_topics")]
    pub topics: Vec<String>,

    /// Deliveries buffered ahead of rule evaluation.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    #[serde(default = "default_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,

    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
}

/// Outbound side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    #[serde(default)]
    pub endpoints: Vec<String>,

    #[serde(default = "default_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_timeout_ms")]
    pub send_timeout_ms: u64,

    /// Per-destination queue bound (0 = unbounded).
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,

    #[serde(default)]
    pub overflow: OverflowPolicy,

    /// First reconnect delay (0 = reconnect only on the next produce).
    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,

    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,

    /// Destination -> `.avsc` schema file.
    #[serde(default)]
    pub schemas: BTreeMap<String, PathBuf>,
}

/// One rule as written in the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Field path -> pattern. Empty matches everything.
    #[serde(rename = "match", default)]
    pub matches: BTreeMap<String, serde_json::Value>,

    /// Value template; absent forwards the inbound record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,

    /// Destination template (`%field%` placeholders).
    pub destination: String,
}

fn default_name() -> String {
    "hdds-repub".to_string()
}

fn default_stats_interval() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_topics() -> Vec<String> {
    vec!["#".to_string()]
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_max_pending() -> usize {
    10_000
}

fn default_reconnect_initial_ms() -> u64 {
    500
}

fn default_reconnect_max_ms() -> u64 {
    30_000
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            topics: default_topics(),
            channel_capacity: default_channel_capacity(),
            connect_timeout_ms: default_timeout_ms(),
            reconnect_initial_ms: default_reconnect_initial_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
        }
    }
}

impl SourceConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn listener_options(&self) -> ListenerOptions {
        ListenerOptions {
            channel_capacity: self.channel_capacity,
            reconnect_initial: Duration::from_millis(self.reconnect_initial_ms),
            reconnect_max: Duration::from_millis(self.reconnect_max_ms),
        }
    }
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            connect_timeout_ms: default_timeout_ms(),
            send_timeout_ms: default_timeout_ms(),
            max_pending: default_max_pending(),
            overflow: OverflowPolicy::default(),
            reconnect_initial_ms: default_reconnect_initial_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            schemas: BTreeMap::new(),
        }
    }
}

impl SinkConfig {
    pub fn pool_options(&self) -> PoolOptions {
        PoolOptions {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            send_timeout: Duration::from_millis(self.send_timeout_ms),
            max_pending: (self.max_pending > 0).then_some(self.max_pending),
            overflow: self.overflow,
            reconnect_initial: Duration::from_millis(self.reconnect_initial_ms),
            reconnect_max: Duration::from_millis(self.reconnect_max_ms),
        }
    }

    /// Load every configured schema.
    pub fn load_schemas(&self) -> Result<Vec<(String, Schema)>, ConfigError> {
        self.schemas
            .iter()
            .map(|(destination, path)| {
                Schema::from_file(path)
                    .map(|schema| (destination.clone(), schema))
                    .map_err(|source| ConfigError::Schema {
                        destination: destination.clone(),
                        source,
                    })
            })
            .collect()
    }
}

impl RuleConfig {
    /// Create a passthrough rule matching everything.
    pub fn new(destination: impl Into<String>) -> Self {
        Self {
            matches: BTreeMap::new(),
            template: None,
            destination: destination.into(),
        }
    }

    /// Add a match condition.
    pub fn matching(mut self, field: impl Into<String>, pattern: impl Into<serde_json::Value>) -> Self {
        self.matches.insert(field.into(), pattern.into());
        self
    }

    /// Set the value template.
    pub fn template(mut self, template: impl Into<String>) -> Self {
        self.template = Some(template.into());
        self
    }
}

impl Default for RepubConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            source: SourceConfig::default(),
            sink: SinkConfig::default(),
            rules: Vec::new(),
            stats_interval_secs: default_stats_interval(),
            log_level: default_log_level(),
        }
    }
}

impl RepubConfig {
    /// Load configuration from a TOML file.
    ///
    /// Relative schema paths are resolved against the file's directory.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::parse(&content)?;

        if let Some(base) = path.parent() {
            for schema_path in config.sink.schemas.values_mut() {
                if schema_path.is_relative() {
                    *schema_path = base.join(&*schema_path);
                }
            }
        }
        Ok(config)
    }

    /// Parse and validate TOML text.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Example configuration written by `gen-config`.
    pub fn example() -> Self {
        Self {
            name: "plant-repub".to_string(),
            source: SourceConfig {
                topics: vec!["sensors/#".to_string(), "alarms/#".to_string()],
                ..Default::default()
            },
            rules: vec![
                RuleConfig::new("out/%topic%")
                    .matching("topic", "sensors/+")
                    .template(r#"{"v": {value}}"#),
                RuleConfig::new("alerts/%site%")
                    .matching("topic", "alarms/#")
                    .matching("severity", "re:^(major|critical)$"),
            ],
            ..Default::default()
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rules.is_empty() {
            return Err(ConfigError::Invalid("No rules configured".into()));
        }

        if self.source.topics.is_empty() {
            return Err(ConfigError::Invalid("No source topics configured".into()));
        }
        if let Some(i) = self.source.topics.iter().position(|t| t.is_empty()) {
            return Err(ConfigError::Invalid(format!("Source topic {} is empty", i)));
        }
        if self.source.channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "source.channel_capacity must be greater than 0".into(),
            ));
        }

        for (what, ms) in [
            ("source.connect_timeout_ms", self.source.connect_timeout_ms),
            ("sink.connect_timeout_ms", self.sink.connect_timeout_ms),
            ("sink.send_timeout_ms", self.sink.send_timeout_ms),
        ] {
            if ms == 0 {
                return Err(ConfigError::Invalid(format!("{} must be greater than 0", what)));
            }
        }
        if self.sink.reconnect_max_ms < self.sink.reconnect_initial_ms
            || self.source.reconnect_max_ms < self.source.reconnect_initial_ms
        {
            return Err(ConfigError::Invalid(
                "reconnect_max_ms must not be below reconnect_initial_ms".into(),
            ));
        }

        for (i, rule) in self.rules.iter().enumerate() {
            if rule.destination.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "Rule {} has empty destination",
                    i
                )));
            }
            for (field, pattern) in &rule.matches {
                if field.is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "Rule {} has an empty match field",
                        i
                    )));
                }
                FieldMatcher::compile(pattern)?;
            }
        }

        if let Some((dest, _)) = self.sink.schemas.iter().find(|(d, _)| d.is_empty()) {
            return Err(ConfigError::Invalid(format!(
                "Schema mapping '{}' has empty destination",
                dest
            )));
        }

        Ok(())
    }
}

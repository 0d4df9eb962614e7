// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types.
//!
//! Only configuration and startup errors ever reach callers of the public
//! API. Encoding, transport and rule failures are recovered inside the pool
//! and the listener; the types exist so that the recovery paths can be
//! logged and tested.

use std::time::Duration;
use thiserror::Error;

/// A value could not be turned into a wire payload.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EncodingError {
    #[error("missing required field '{0}'")]
    MissingField(String),

    #[error("field '{field}': expected {expected}, found {found}")]
    TypeMismatch {
        field: String,
        expected: String,
        found: String,
    },

    #[error("field '{field}': {value} is out of range for {expected}")]
    OutOfRange {
        field: String,
        value: String,
        expected: String,
    },

    #[error("field '{field}': '{symbol}' is not a symbol of enum {name}")]
    UnknownSymbol {
        field: String,
        symbol: String,
        name: String,
    },

    #[error("field '{0}': value matches no branch of the union")]
    NoUnionBranch(String),

    #[error("JSON error: {0}")]
    Json(String),
}

/// A schema definition could not be parsed.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid schema: {0}")]
    Invalid(String),
}

/// Errors reported by a broker client.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Broker unreachable or the connection dropped mid-operation.
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    /// Initial connection attempt failed.
    #[error("connection failed: {0}")]
    Connect(String),

    /// Operation did not complete in time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Broker refused this particular message (permanent for that message).
    #[error("rejected by broker: {0}")]
    Rejected(String),
}

impl TransportError {
    /// True when the error means the connection itself is gone.
    ///
    /// Such errors reset the supervisor and requeue the record; anything
    /// else is attributed to the message.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Self::Unavailable(_) | Self::Connect(_) | Self::Timeout(_)
        )
    }
}

/// A rule failed to produce output for one message.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RuleError {
    #[error("rule {rule}: placeholder '{field}' not present in message")]
    MissingField { rule: usize, field: String },

    #[error("rule {rule}: transform failed: {reason}")]
    Transform { rule: usize, reason: String },

    #[error("rule {rule}: destination rendered empty")]
    EmptyDestination { rule: usize },
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("Invalid pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Schema for '{destination}': {source}")]
    Schema {
        destination: String,
        #[source]
        source: SchemaError,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level error for running the republisher.
#[derive(Debug, Error)]
pub enum RepubError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Listener already running")]
    AlreadyRunning,
}

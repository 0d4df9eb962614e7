// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Republishing rules.
//!
//! A [`Rule`] pairs a predicate over message fields with a value transform
//! and a destination template. The [`RuleEngine`] runs every rule in order
//! against one inbound message and collects the outputs. Evaluation is pure:
//! the engine holds no per-message state.
//!
//! # Match patterns
//!
//! | Pattern              | Meaning                                  |
//! |----------------------|------------------------------------------|
//! | `42`, `true`, `"x"`  | exact equality                           |
//! | `"sensors/+"`, `"a/#"` | MQTT topic wildcard                    |
//! | `"temp_*"`           | glob (`*` any run, `?` one character)    |
//! | `"re:^dev-[0-9]+$"`  | regular expression                       |
//!
//! Field names may be dot paths (`meta.region`).
//!
//! # Templates
//!
//! Value templates use `{field}` placeholders, destinations use `%field%`:
//!
//! ```text
//! template    = "{\"v\": {value}}"
//! destination = "out/%topic%"
//! ```

use crate::config::RuleConfig;
use crate::error::{ConfigError, RuleError};
use crate::listener::InboundMessage;
use crate::queue::Destination;
use crate::transport::{is_wildcard_filter, topic_matches};
use regex::Regex;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Field map of an inbound message.
pub type Record = serde_json::Map<String, Value>;

/// Signature of a programmatic transform.
pub type TransformFn = dyn Fn(&Record) -> Result<Value, String> + Send + Sync;

/// Resolve a dot-separated field path.
pub fn resolve_field<'a>(record: &'a Record, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = record.get(parts.next()?)?;
    for part in parts {
        current = current.get(part)?;
    }
    Some(current)
}

/// Text form of a scalar, as used by glob and regex patterns.
fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Predicate on one field.
#[derive(Debug, Clone)]
pub enum FieldMatcher {
    Exact(Value),
    Topic(String),
    /// Glob, compiled to an anchored regex.
    Glob(Regex),
    Regex(Regex),
}

impl FieldMatcher {
    /// Build a matcher from a configured pattern value.
    pub fn compile(pattern: &Value) -> Result<Self, ConfigError> {
        let Value::String(text) = pattern else {
            return Ok(Self::Exact(pattern.clone()));
        };

        if let Some(expr) = text.strip_prefix("re:") {
            return Regex::new(expr)
                .map(Self::Regex)
                .map_err(|source| ConfigError::Pattern {
                    pattern: text.clone(),
                    source,
                });
        }
        if is_wildcard_filter(text) {
            return Ok(Self::Topic(text.clone()));
        }
        if text.contains(['*', '?']) {
            return glob_regex(text)
                .map(Self::Glob)
                .map_err(|source| ConfigError::Pattern {
                    pattern: text.clone(),
                    source,
                });
        }
        Ok(Self::Exact(pattern.clone()))
    }

    /// Test a field value; a missing field never matches.
    pub fn matches(&self, value: Option<&Value>) -> bool {
        let Some(value) = value else {
            return false;
        };
        match self {
            Self::Exact(expected) => value == expected,
            Self::Topic(filter) => value.as_str().is_some_and(|t| topic_matches(filter, t)),
            Self::Glob(re) | Self::Regex(re) => {
                scalar_text(value).is_some_and(|t| re.is_match(&t))
            }
        }
    }
}

/// Translate a glob (`*` and `?`) into an anchored regex.
///
/// Matching field values taken from inbound payloads must stay linear in
/// their length, which the regex engine guarantees.
fn glob_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let mut expr = String::with_capacity(pattern.len() + 8);
    expr.push_str("(?s)^");
    let mut buf = [0u8; 4];
    for c in pattern.chars() {
        match c {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            c => expr.push_str(&regex::escape(c.encode_utf8(&mut buf))),
        }
    }
    expr.push('$');
    Regex::new(&expr)
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Field(String),
}

/// Text with field placeholders.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
}

impl Template {
    /// Parse a value template (`{field}` placeholders).
    pub fn value(source: &str) -> Self {
        Self::parse(source, '{', '}')
    }

    /// Parse a destination template (`%field%` placeholders).
    pub fn destination(source: &str) -> Self {
        Self::parse(source, '%', '%')
    }

    // A placeholder is open + identifier (letters, digits, '_', '.') + close.
    // Anything else, such as the braces of a JSON object, stays literal.
    fn parse(source: &str, open: char, close: char) -> Self {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut rest = source;

        while let Some(start) = rest.find(open) {
            let after = &rest[start + open.len_utf8()..];
            let ident_len = after
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '.'))
                .unwrap_or(after.len());
            let ident = &after[..ident_len];
            let valid = !ident.is_empty()
                && !ident.starts_with(|c: char| c.is_ascii_digit() || c == '.')
                && after[ident_len..].starts_with(close);

            if valid {
                literal.push_str(&rest[..start]);
                if !literal.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut literal)));
                }
                segments.push(Segment::Field(ident.to_string()));
                rest = &after[ident_len + close.len_utf8()..];
            } else {
                literal.push_str(&rest[..start + open.len_utf8()]);
                rest = after;
            }
        }
        literal.push_str(rest);
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Self {
            source: source.to_string(),
            segments,
        }
    }

    /// The template text as written.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Field paths referenced by the template.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Field(f) => Some(f.as_str()),
            Segment::Literal(_) => None,
        })
    }

    fn render_with(
        &self,
        record: &Record,
        render: impl Fn(&Value) -> String,
    ) -> Result<String, String> {
        let mut out = String::with_capacity(self.source.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Field(path) => {
                    let value = resolve_field(record, path).ok_or_else(|| path.clone())?;
                    out.push_str(&render(value));
                }
            }
        }
        Ok(out)
    }

    /// Render as a JSON value.
    ///
    /// Strings are inserted JSON-escaped without quotes, everything else as
    /// JSON text. Output that parses as JSON becomes that value, otherwise
    /// it becomes a JSON string. Errors carry the missing field path.
    pub fn render_value(&self, record: &Record) -> Result<Value, String> {
        let text = self.render_with(record, |value| match value {
            Value::String(s) => {
                let quoted = Value::String(s.clone()).to_string();
                quoted[1..quoted.len() - 1].to_string()
            }
            other => other.to_string(),
        })?;
        Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    }

    /// Render as plain text. Errors carry the missing field path.
    pub fn render_text(&self, record: &Record) -> Result<String, String> {
        self.render_with(record, |value| match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }
}

/// How a matching message becomes an output value.
#[derive(Clone, Default)]
pub enum Transform {
    /// Forward the inbound record unchanged.
    #[default]
    Passthrough,
    /// Render a value template.
    Template(Template),
    /// Caller-supplied function.
    Custom(Arc<TransformFn>),
}

impl Transform {
    /// Wrap a closure.
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&Record) -> Result<Value, String> + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(f))
    }
}

impl fmt::Debug for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Passthrough => f.write_str("Passthrough"),
            Self::Template(t) => f.debug_tuple("Template").field(&t.source).finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// One match -> transform -> destination rule.
#[derive(Debug, Clone)]
pub struct Rule {
    matchers: Vec<(String, FieldMatcher)>,
    transform: Transform,
    destination: Template,
}

impl Rule {
    /// Create a rule that matches every message.
    pub fn new(destination: &str, transform: Transform) -> Self {
        Self {
            matchers: Vec::new(),
            transform,
            destination: Template::destination(destination),
        }
    }

    /// Add a field condition; all conditions must hold.
    pub fn with_match(mut self, field: impl Into<String>, matcher: FieldMatcher) -> Self {
        self.matchers.push((field.into(), matcher));
        self
    }

    /// Build a rule from its configuration.
    pub fn from_config(config: &RuleConfig) -> Result<Self, ConfigError> {
        let transform = match &config.template {
            Some(t) => Transform::Template(Template::value(t)),
            None => Transform::Passthrough,
        };
        let mut rule = Self::new(&config.destination, transform);
        for (field, pattern) in &config.matches {
            rule = rule.with_match(field.clone(), FieldMatcher::compile(pattern)?);
        }
        Ok(rule)
    }

    /// Destination template.
    pub fn destination(&self) -> &Template {
        &self.destination
    }

    /// Check the predicate.
    pub fn matches(&self, record: &Record) -> bool {
        self.matchers
            .iter()
            .all(|(field, matcher)| matcher.matches(resolve_field(record, field)))
    }

    /// Evaluate against one record.
    ///
    /// `Ok(None)` when the predicate does not hold. `index` only labels
    /// errors.
    pub fn apply(
        &self,
        index: usize,
        record: &Record,
    ) -> Result<Option<(Destination, Value)>, RuleError> {
        if !self.matches(record) {
            return Ok(None);
        }

        let value = match &self.transform {
            Transform::Passthrough => Value::Object(record.clone()),
            Transform::Template(template) => template
                .render_value(record)
                .map_err(|field| RuleError::MissingField { rule: index, field })?,
            Transform::Custom(f) => {
                f(record).map_err(|reason| RuleError::Transform { rule: index, reason })?
            }
        };

        let destination = self
            .destination
            .render_text(record)
            .map_err(|field| RuleError::MissingField { rule: index, field })?;
        if destination.is_empty() {
            return Err(RuleError::EmptyDestination { rule: index });
        }

        Ok(Some((Destination::from(destination), value)))
    }
}

/// Ordered rule set.
#[derive(Debug, Clone, Default)]
pub struct RuleEngine {
    rules: Vec<Rule>,
}

impl RuleEngine {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    /// Compile configured rules.
    pub fn from_config(configs: &[RuleConfig]) -> Result<Self, ConfigError> {
        let rules = configs
            .iter()
            .map(Rule::from_config)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(rules))
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Publish instructions for one message, in rule order.
    ///
    /// A failing rule is logged and skipped.
    pub fn evaluate(&self, message: &InboundMessage) -> Vec<(Destination, Value)> {
        let mut out = Vec::new();
        for (index, rule) in self.rules.iter().enumerate() {
            match rule.apply(index, &message.record) {
                Ok(Some(instruction)) => out.push(instruction),
                Ok(None) => {}
                Err(err) => {
                    let record = Value::Object(message.record.clone());
                    tracing::warn!(
                        "Rule skipped ({}) for message on '{}': {}",
                        err,
                        message.topic,
                        record
                    );
                }
            }
        }
        out
    }
}

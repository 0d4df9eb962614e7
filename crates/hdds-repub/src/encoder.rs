// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Payload encoding.
//!
//! Turns an application value into the bytes handed to the broker:
//!
//! - raw bytes pass through unchanged
//! - records with a schema are encoded in Avro binary format
//! - records without a schema are stringified (strings as-is, anything else
//!   as compact JSON) and sent as UTF-8
//!
//! Encoding is a pure function of the value and the schema.

use crate::error::EncodingError;
use crate::schema::Schema;
use byteorder::{ByteOrder, LittleEndian};
use serde_json::Value;
use std::sync::Arc;

/// A value handed to the producer pool.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundValue {
    /// Already-encoded payload.
    Bytes(Vec<u8>),
    /// Structured value.
    Record(Value),
}

impl From<Vec<u8>> for OutboundValue {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<&[u8]> for OutboundValue {
    fn from(bytes: &[u8]) -> Self {
        Self::Bytes(bytes.to_vec())
    }
}

impl From<Value> for OutboundValue {
    fn from(value: Value) -> Self {
        Self::Record(value)
    }
}

impl From<&str> for OutboundValue {
    fn from(text: &str) -> Self {
        Self::Record(Value::String(text.to_string()))
    }
}

/// Encoder for one destination.
#[derive(Debug, Clone, Default)]
pub struct MessageEncoder {
    schema: Option<Arc<Schema>>,
}

impl MessageEncoder {
    /// Create an encoder, schema-based if `schema` is set.
    pub fn new(schema: Option<Schema>) -> Self {
        Self {
            schema: schema.map(Arc::new),
        }
    }

    /// Encoder without a schema.
    pub fn plain() -> Self {
        Self::default()
    }

    /// Encoder for `schema`.
    pub fn with_schema(schema: Schema) -> Self {
        Self::new(Some(schema))
    }

    /// Encode a value into a wire payload.
    pub fn encode(&self, value: &OutboundValue) -> Result<Vec<u8>, EncodingError> {
        match (value, self.schema.as_deref()) {
            (OutboundValue::Bytes(bytes), _) => Ok(bytes.clone()),
            (OutboundValue::Record(record), Some(schema)) => {
                let mut buf = Vec::new();
                encode_avro(schema, record, "$", &mut buf)?;
                Ok(buf)
            }
            (OutboundValue::Record(Value::String(text)), None) => Ok(text.as_bytes().to_vec()),
            (OutboundValue::Record(record), None) => {
                serde_json::to_vec(record).map_err(|e| EncodingError::Json(e.to_string()))
            }
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "float number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn mismatch(path: &str, schema: &Schema, value: &Value) -> EncodingError {
    EncodingError::TypeMismatch {
        field: path.to_string(),
        expected: schema.type_name(),
        found: json_type_name(value).to_string(),
    }
}

/// Zigzag + ULEB128, as Avro encodes `int` and `long`.
fn write_long(buf: &mut Vec<u8>, value: i64) {
    let mut n = ((value << 1) ^ (value >> 63)) as u64;
    loop {
        let byte = (n & 0x7F) as u8;
        n >>= 7;
        if n == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

fn write_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    write_long(buf, bytes.len() as i64);
    buf.extend_from_slice(bytes);
}

fn integer(path: &str, schema: &Schema, value: &Value) -> Result<i64, EncodingError> {
    match value {
        Value::Number(n) => n.as_i64().ok_or_else(|| {
            if n.is_u64() {
                EncodingError::OutOfRange {
                    field: path.to_string(),
                    value: n.to_string(),
                    expected: schema.type_name(),
                }
            } else {
                mismatch(path, schema, value)
            }
        }),
        _ => Err(mismatch(path, schema, value)),
    }
}

fn byte_array(path: &str, schema: &Schema, value: &Value) -> Result<Vec<u8>, EncodingError> {
    match value {
        Value::String(s) => Ok(s.as_bytes().to_vec()),
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(i, item)| {
                item.as_u64()
                    .and_then(|b| u8::try_from(b).ok())
                    .ok_or_else(|| EncodingError::OutOfRange {
                        field: format!("{}[{}]", path, i),
                        value: item.to_string(),
                        expected: "byte".into(),
                    })
            })
            .collect(),
        _ => Err(mismatch(path, schema, value)),
    }
}

/// Whether a union branch can hold `value`.
fn branch_accepts(schema: &Schema, value: &Value) -> bool {
    match (schema, value) {
        (Schema::Null, Value::Null) => true,
        (Schema::Boolean, Value::Bool(_)) => true,
        (Schema::Int, Value::Number(n)) => n
            .as_i64()
            .map(|i| i32::try_from(i).is_ok())
            .unwrap_or(false),
        (Schema::Long, Value::Number(n)) => n.as_i64().is_some(),
        (Schema::Float | Schema::Double, Value::Number(_)) => true,
        (Schema::String | Schema::Bytes, Value::String(_)) => true,
        (Schema::Bytes, Value::Array(_)) => true,
        (Schema::Enum { symbols, .. }, Value::String(s)) => symbols.contains(s),
        (Schema::Array(_), Value::Array(_)) => true,
        (Schema::Record(_) | Schema::Map(_), Value::Object(_)) => true,
        _ => false,
    }
}

fn encode_avro(
    schema: &Schema,
    value: &Value,
    path: &str,
    buf: &mut Vec<u8>,
) -> Result<(), EncodingError> {
    match schema {
        Schema::Null => match value {
            Value::Null => Ok(()),
            _ => Err(mismatch(path, schema, value)),
        },
        Schema::Boolean => match value {
            Value::Bool(b) => {
                buf.push(u8::from(*b));
                Ok(())
            }
            _ => Err(mismatch(path, schema, value)),
        },
        Schema::Int => {
            let n = integer(path, schema, value)?;
            if i32::try_from(n).is_err() {
                return Err(EncodingError::OutOfRange {
                    field: path.to_string(),
                    value: n.to_string(),
                    expected: schema.type_name(),
                });
            }
            write_long(buf, n);
            Ok(())
        }
        Schema::Long => {
            write_long(buf, integer(path, schema, value)?);
            Ok(())
        }
        Schema::Float => {
            let f = value.as_f64().ok_or_else(|| mismatch(path, schema, value))?;
            let mut bytes = [0u8; 4];
            LittleEndian::write_f32(&mut bytes, f as f32);
            buf.extend_from_slice(&bytes);
            Ok(())
        }
        Schema::Double => {
            let f = value.as_f64().ok_or_else(|| mismatch(path, schema, value))?;
            let mut bytes = [0u8; 8];
            LittleEndian::write_f64(&mut bytes, f);
            buf.extend_from_slice(&bytes);
            Ok(())
        }
        Schema::Bytes => {
            write_bytes(buf, &byte_array(path, schema, value)?);
            Ok(())
        }
        Schema::String => match value {
            Value::String(s) => {
                write_bytes(buf, s.as_bytes());
                Ok(())
            }
            _ => Err(mismatch(path, schema, value)),
        },
        Schema::Record(record) => {
            let obj = value
                .as_object()
                .ok_or_else(|| mismatch(path, schema, value))?;
            for field in &record.fields {
                let field_path = format!("{}.{}", path, field.name);
                match obj.get(&field.name).or(field.default.as_ref()) {
                    Some(field_value) => {
                        encode_avro(&field.schema, field_value, &field_path, buf)?
                    }
                    None => return Err(EncodingError::MissingField(field_path)),
                }
            }
            Ok(())
        }
        Schema::Enum { name, symbols } => {
            let symbol = value.as_str().ok_or_else(|| mismatch(path, schema, value))?;
            let index = symbols.iter().position(|s| s == symbol).ok_or_else(|| {
                EncodingError::UnknownSymbol {
                    field: path.to_string(),
                    symbol: symbol.to_string(),
                    name: name.clone(),
                }
            })?;
            write_long(buf, index as i64);
            Ok(())
        }
        Schema::Array(items) => {
            let values = value
                .as_array()
                .ok_or_else(|| mismatch(path, schema, value))?;
            if !values.is_empty() {
                write_long(buf, values.len() as i64);
                for (i, item) in values.iter().enumerate() {
                    encode_avro(items, item, &format!("{}[{}]", path, i), buf)?;
                }
            }
            write_long(buf, 0);
            Ok(())
        }
        Schema::Map(values) => {
            let obj = value
                .as_object()
                .ok_or_else(|| mismatch(path, schema, value))?;
            if !obj.is_empty() {
                write_long(buf, obj.len() as i64);
                for (key, item) in obj {
                    write_bytes(buf, key.as_bytes());
                    encode_avro(values, item, &format!("{}.{}", path, key), buf)?;
                }
            }
            write_long(buf, 0);
            Ok(())
        }
        Schema::Union(branches) => {
            let index = branches
                .iter()
                .position(|branch| branch_accepts(branch, value))
                .ok_or_else(|| EncodingError::NoUnionBranch(path.to_string()))?;
            write_long(buf, index as i64);
            encode_avro(&branches[index], value, path, buf)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn reading_schema() -> Schema {
        Schema::parse(&json!({
            "type": "record",
            "name": "Reading",
            "fields": [
                {"name": "sensor", "type": "string"},
                {"name": "value", "type": "long"},
                {"name": "unit", "type": ["null", "string"], "default": null}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_bytes_pass_through() {
        let payload = vec![0xde, 0xad, 0xbe, 0xef];
        let value = OutboundValue::from(payload.clone());

        assert_eq!(MessageEncoder::plain().encode(&value).unwrap(), payload);
        assert_eq!(
            MessageEncoder::with_schema(reading_schema())
                .encode(&value)
                .unwrap(),
            payload
        );
    }

    #[test]
    fn test_plain_stringifies() {
        let encoder = MessageEncoder::plain();
        assert_eq!(encoder.encode(&"hello".into()).unwrap(), b"hello");
        assert_eq!(
            encoder.encode(&json!({"a": 1}).into()).unwrap(),
            br#"{"a":1}"#
        );
        assert_eq!(encoder.encode(&json!(42).into()).unwrap(), b"42");
    }

    #[test]
    fn test_zigzag_longs() {
        let cases: [(i64, &[u8]); 6] = [
            (0, &[0x00]),
            (-1, &[0x01]),
            (1, &[0x02]),
            (-64, &[0x7f]),
            (64, &[0x80, 0x01]),
            (-65, &[0x81, 0x01]),
        ];
        for (value, expected) in cases {
            let mut buf = Vec::new();
            write_long(&mut buf, value);
            assert_eq!(buf, expected, "encoding {}", value);
        }
    }

    #[test]
    fn test_record_encoding() {
        let encoder = MessageEncoder::with_schema(reading_schema());
        let bytes = encoder
            .encode(&json!({"sensor": "foo", "value": 1, "unit": "C"}).into())
            .unwrap();

        // "foo" | 1 | union branch 1 | "C"
        assert_eq!(bytes, vec![0x06, b'f', b'o', b'o', 0x02, 0x02, 0x02, b'C']);
    }

    #[test]
    fn test_record_default_used_for_missing_field() {
        let encoder = MessageEncoder::with_schema(reading_schema());
        let bytes = encoder
            .encode(&json!({"sensor": "a", "value": -1}).into())
            .unwrap();

        // "a" | -1 | union branch 0 (null)
        assert_eq!(bytes, vec![0x02, b'a', 0x01, 0x00]);
    }

    #[test]
    fn test_missing_required_field() {
        let encoder = MessageEncoder::with_schema(reading_schema());
        let err = encoder.encode(&json!({"sensor": "a"}).into()).unwrap_err();
        assert_eq!(err, EncodingError::MissingField("$.value".into()));
    }

    #[test]
    fn test_wrong_type() {
        let encoder = MessageEncoder::with_schema(reading_schema());
        let err = encoder
            .encode(&json!({"sensor": "a", "value": "high"}).into())
            .unwrap_err();
        assert!(matches!(err, EncodingError::TypeMismatch { ref field, .. } if field == "$.value"));

        let err = encoder.encode(&json!([1, 2]).into()).unwrap_err();
        assert!(matches!(err, EncodingError::TypeMismatch { .. }));
    }

    #[test]
    fn test_int_range_checked() {
        let encoder = MessageEncoder::with_schema(Schema::Int);
        assert!(encoder.encode(&json!(2_147_483_647).into()).is_ok());
        assert!(matches!(
            encoder.encode(&json!(2_147_483_648i64).into()),
            Err(EncodingError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_double_little_endian() {
        let encoder = MessageEncoder::with_schema(Schema::Double);
        let bytes = encoder.encode(&json!(1.0).into()).unwrap();
        assert_eq!(bytes, 1.0f64.to_le_bytes().to_vec());
    }

    #[test]
    fn test_array_and_map_blocks() {
        let encoder = MessageEncoder::with_schema(Schema::Array(Box::new(Schema::Int)));
        assert_eq!(
            encoder.encode(&json!([1, 2]).into()).unwrap(),
            vec![0x04, 0x02, 0x04, 0x00]
        );
        assert_eq!(encoder.encode(&json!([]).into()).unwrap(), vec![0x00]);

        let encoder = MessageEncoder::with_schema(Schema::Map(Box::new(Schema::Boolean)));
        assert_eq!(
            encoder.encode(&json!({"k": true}).into()).unwrap(),
            vec![0x02, 0x02, b'k', 0x01, 0x00]
        );
    }

    #[test]
    fn test_enum_symbols() {
        let encoder = MessageEncoder::with_schema(Schema::Enum {
            name: "Level".into(),
            symbols: vec!["LOW".into(), "HIGH".into()],
        });
        assert_eq!(encoder.encode(&"HIGH".into()).unwrap(), vec![0x02]);
        assert!(matches!(
            encoder.encode(&"MEDIUM".into()),
            Err(EncodingError::UnknownSymbol { .. })
        ));
    }

    #[test]
    fn test_union_without_matching_branch() {
        let encoder =
            MessageEncoder::with_schema(Schema::Union(vec![Schema::Null, Schema::Long]));
        assert!(matches!(
            encoder.encode(&"text".into()),
            Err(EncodingError::NoUnionBranch(_))
        ));
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let encoder = MessageEncoder::with_schema(reading_schema());
        let value: OutboundValue = json!({"sensor": "s", "value": 7}).into();
        assert_eq!(encoder.encode(&value).unwrap(), encoder.encode(&value).unwrap());
    }
}

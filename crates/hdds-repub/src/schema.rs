// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Avro-style schema definitions.
//!
//! Schemas are written in the Avro JSON schema language (`.avsc`). The
//! supported subset covers every primitive, records with field defaults,
//! enums, arrays, maps and unions. Named types may be referenced after their
//! definition; recursive types and `fixed` are not supported.
//!
//! ```json
//! {
//!   "type": "record",
//!   "name": "Reading",
//!   "fields": [
//!     {"name": "sensor", "type": "string"},
//!     {"name": "value", "type": "double"},
//!     {"name": "unit", "type": ["null", "string"], "default": null}
//!   ]
//! }
//! ```

use crate::error::SchemaError;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;

/// A parsed schema.
#[derive(Debug, Clone, PartialEq)]
pub enum Schema {
    Null,
    Boolean,
    Int,
    Long,
    Float,
    Double,
    Bytes,
    String,
    Record(RecordSchema),
    Enum { name: String, symbols: Vec<String> },
    Array(Box<Schema>),
    Map(Box<Schema>),
    Union(Vec<Schema>),
}

/// A record type.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordSchema {
    pub name: String,
    pub fields: Vec<Field>,
}

/// One field of a record.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub schema: Schema,
    /// Value used when the field is absent from the encoded value.
    pub default: Option<Value>,
}

impl Schema {
    /// Load a schema from an `.avsc` file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, SchemaError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse_str(&content)
    }

    /// Parse a schema from JSON text.
    pub fn parse_str(text: &str) -> Result<Self, SchemaError> {
        let json: Value = serde_json::from_str(text)?;
        Self::parse(&json)
    }

    /// Parse a schema from a JSON value.
    pub fn parse(json: &Value) -> Result<Self, SchemaError> {
        let mut names = HashMap::new();
        parse_schema(json, &mut names)
    }

    /// Short type name used in error messages.
    pub fn type_name(&self) -> String {
        match self {
            Self::Null => "null".into(),
            Self::Boolean => "boolean".into(),
            Self::Int => "int".into(),
            Self::Long => "long".into(),
            Self::Float => "float".into(),
            Self::Double => "double".into(),
            Self::Bytes => "bytes".into(),
            Self::String => "string".into(),
            Self::Record(r) => format!("record {}", r.name),
            Self::Enum { name, .. } => format!("enum {}", name),
            Self::Array(_) => "array".into(),
            Self::Map(_) => "map".into(),
            Self::Union(branches) => {
                let names: Vec<_> = branches.iter().map(|b| b.type_name()).collect();
                format!("union [{}]", names.join(", "))
            }
        }
    }
}

fn primitive(name: &str) -> Option<Schema> {
    Some(match name {
        "null" => Schema::Null,
        "boolean" => Schema::Boolean,
        "int" => Schema::Int,
        "long" => Schema::Long,
        "float" => Schema::Float,
        "double" => Schema::Double,
        "bytes" => Schema::Bytes,
        "string" => Schema::String,
        _ => return None,
    })
}

fn parse_schema(json: &Value, names: &mut HashMap<String, Schema>) -> Result<Schema, SchemaError> {
    match json {
        Value::String(name) => primitive(name)
            .or_else(|| names.get(name).cloned())
            .ok_or_else(|| SchemaError::Invalid(format!("unknown type '{}'", name))),
        Value::Array(branches) => {
            if branches.is_empty() {
                return Err(SchemaError::Invalid("empty union".into()));
            }
            let mut parsed = Vec::with_capacity(branches.len());
            for branch in branches {
                let schema = parse_schema(branch, names)?;
                if matches!(schema, Schema::Union(_)) {
                    return Err(SchemaError::Invalid(
                        "unions may not immediately contain unions".into(),
                    ));
                }
                parsed.push(schema);
            }
            Ok(Schema::Union(parsed))
        }
        Value::Object(obj) => {
            let type_name = obj
                .get("type")
                .ok_or_else(|| SchemaError::Invalid("missing 'type' attribute".into()))?;

            let type_name = match type_name {
                Value::String(s) => s.as_str(),
                // {"type": {...}} or {"type": [...]} wraps another schema
                other => return parse_schema(other, names),
            };

            match type_name {
                "record" => parse_record(obj, names),
                "enum" => {
                    let name = required_name(obj)?;
                    let symbols = obj
                        .get("symbols")
                        .and_then(Value::as_array)
                        .ok_or_else(|| {
                            SchemaError::Invalid(format!("enum {} has no symbols", name))
                        })?
                        .iter()
                        .map(|s| {
                            s.as_str().map(str::to_string).ok_or_else(|| {
                                SchemaError::Invalid(format!(
                                    "enum {} has a non-string symbol",
                                    name
                                ))
                            })
                        })
                        .collect::<Result<Vec<_>, _>>()?;
                    let schema = Schema::Enum {
                        name: name.clone(),
                        symbols,
                    };
                    names.insert(name, schema.clone());
                    Ok(schema)
                }
                "array" => {
                    let items = obj
                        .get("items")
                        .ok_or_else(|| SchemaError::Invalid("array without 'items'".into()))?;
                    Ok(Schema::Array(Box::new(parse_schema(items, names)?)))
                }
                "map" => {
                    let values = obj
                        .get("values")
                        .ok_or_else(|| SchemaError::Invalid("map without 'values'".into()))?;
                    Ok(Schema::Map(Box::new(parse_schema(values, names)?)))
                }
                "fixed" => Err(SchemaError::Invalid("fixed types are not supported".into())),
                other => primitive(other)
                    .or_else(|| names.get(other).cloned())
                    .ok_or_else(|| SchemaError::Invalid(format!("unknown type '{}'", other))),
            }
        }
        other => Err(SchemaError::Invalid(format!(
            "unexpected schema element: {}",
            other
        ))),
    }
}

fn required_name(obj: &serde_json::Map<String, Value>) -> Result<String, SchemaError> {
    obj.get("name")
        .and_then(Value::as_str)
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .ok_or_else(|| SchemaError::Invalid("named type without 'name'".into()))
}

fn parse_record(
    obj: &serde_json::Map<String, Value>,
    names: &mut HashMap<String, Schema>,
) -> Result<Schema, SchemaError> {
    let name = required_name(obj)?;
    let fields_json = obj
        .get("fields")
        .and_then(Value::as_array)
        .ok_or_else(|| SchemaError::Invalid(format!("record {} has no fields", name)))?;

    let mut fields = Vec::with_capacity(fields_json.len());
    for field in fields_json {
        let field_name = field
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| SchemaError::Invalid(format!("record {}: field without name", name)))?;
        if fields.iter().any(|f: &Field| f.name == field_name) {
            return Err(SchemaError::Invalid(format!(
                "record {}: duplicate field '{}'",
                name, field_name
            )));
        }
        let field_type = field.get("type").ok_or_else(|| {
            SchemaError::Invalid(format!("record {}: field '{}' has no type", name, field_name))
        })?;
        fields.push(Field {
            name: field_name.to_string(),
            schema: parse_schema(field_type, names)?,
            default: field.get("default").cloned(),
        });
    }

    let schema = Schema::Record(RecordSchema {
        name: name.clone(),
        fields,
    });
    names.insert(name, schema.clone());
    Ok(schema)
}

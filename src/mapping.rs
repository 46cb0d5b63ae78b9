//! Declarative remote-to-local record mapping.
//!
//! Each entity is described by an ordered table of [`FieldSpec`]s
//! (`source field → target column, transform kind`). A single generic
//! routine, [`map_record`], walks the table and produces a
//! [`MappedRecord`]. The mapper is pure: no I/O, no dependency on local
//! state.
//!
//! # Transform rules
//!
//! | Kind | Absent / null | Malformed | Otherwise |
//! |------|---------------|-----------|-----------|
//! | `Identifier` | error | error | string (integers rendered as text) |
//! | `Text` | null | compact JSON | string, numbers and booleans as text |
//! | `Integer` / `Float` | null | null | number, numeric strings parsed |
//! | `Boolean` | `false` | `false` | bool, `"true"`/`"false"` strings parsed |
//! | `DateTime` | null | null | parsed ISO-8601 (`Z` → `+00:00`) |
//! | `LookupId` / `LookupName` / `LookupEmail` | null | null | sub-field of the embedded object |
//! | `JsonList` | null | compact JSON | compact JSON, empty list → null |
//! | `Json` | null | n/a | compact JSON, empty object/list/string → null |

use serde_json::Value;

use crate::error::MappingError;
use crate::models::{ColumnValue, MappedRecord};
use crate::timefmt::parse_timestamp;

/// How a remote value is turned into a column value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Identifier,
    Text,
    Integer,
    Float,
    Boolean,
    DateTime,
    LookupId,
    LookupName,
    LookupEmail,
    JsonList,
    Json,
}

impl FieldKind {
    /// SQLite column type used when the column is created.
    pub fn sql_type(&self) -> &'static str {
        match self {
            FieldKind::Integer | FieldKind::Boolean => "INTEGER",
            FieldKind::Float => "REAL",
            _ => "TEXT",
        }
    }
}

/// One row of an entity mapping table.
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub source: &'static str,
    pub column: &'static str,
    pub kind: FieldKind,
}

/// Shorthand used by the mapping tables in [`crate::entities`].
pub const fn field(source: &'static str, column: &'static str, kind: FieldKind) -> FieldSpec {
    FieldSpec {
        source,
        column,
        kind,
    }
}

/// Map one remote record through `table`.
///
/// The table must contain exactly one `Identifier` entry whose column is
/// `id`; it becomes [`MappedRecord::id`]. Every other entry becomes a
/// column in table order.
///
/// # Errors
///
/// Fails only when the record is not a JSON object or its identifier is
/// missing or malformed.
pub fn map_record(table: &[FieldSpec], record: &Value) -> Result<MappedRecord, MappingError> {
    let obj = record
        .as_object()
        .ok_or_else(|| MappingError::NotAnObject(truncate(&record.to_string(), 80)))?;

    let mut id = None;
    let mut columns = Vec::with_capacity(table.len());

    for spec in table {
        let raw = obj.get(spec.source).unwrap_or(&Value::Null);
        if spec.kind == FieldKind::Identifier {
            id = Some(map_identifier(spec.source, raw)?);
            continue;
        }
        columns.push((spec.column, map_value(spec.kind, raw)));
    }

    let id = id.ok_or(MappingError::MissingIdentifier { field: "id" })?;
    Ok(MappedRecord { id, columns })
}

/// Unique remote field names in table order, for the fetch field list.
pub fn source_fields(table: &[FieldSpec]) -> Vec<&'static str> {
    let mut fields: Vec<&'static str> = Vec::with_capacity(table.len());
    for spec in table {
        if !fields.contains(&spec.source) {
            fields.push(spec.source);
        }
    }
    fields
}

fn map_identifier(field: &'static str, raw: &Value) -> Result<String, MappingError> {
    match raw {
        Value::String(s) if !s.trim().is_empty() => Ok(s.clone()),
        Value::Number(n) if n.is_i64() || n.is_u64() => Ok(n.to_string()),
        Value::Null => Err(MappingError::MissingIdentifier { field }),
        Value::String(_) => Err(MappingError::MissingIdentifier { field }),
        other => Err(MappingError::InvalidIdentifier {
            field,
            found: truncate(&other.to_string(), 80),
        }),
    }
}

/// Transform a single remote value. Never fails.
pub fn map_value(kind: FieldKind, raw: &Value) -> ColumnValue {
    match kind {
        FieldKind::Identifier | FieldKind::Text => map_text(raw),
        FieldKind::Integer => map_integer(raw),
        FieldKind::Float => map_float(raw),
        FieldKind::Boolean => ColumnValue::Bool(map_bool(raw)),
        FieldKind::DateTime => raw
            .as_str()
            .and_then(parse_timestamp)
            .map(ColumnValue::Timestamp)
            .unwrap_or(ColumnValue::Null),
        FieldKind::LookupId => lookup(raw, "id"),
        FieldKind::LookupName => lookup(raw, "name"),
        FieldKind::LookupEmail => lookup(raw, "email"),
        FieldKind::JsonList => match raw {
            Value::Null => ColumnValue::Null,
            Value::Array(items) if items.is_empty() => ColumnValue::Null,
            other => ColumnValue::Text(other.to_string()),
        },
        FieldKind::Json => {
            if is_blank_json(raw) {
                ColumnValue::Null
            } else {
                ColumnValue::Text(raw.to_string())
            }
        }
    }
}

fn map_text(raw: &Value) -> ColumnValue {
    match raw {
        Value::Null => ColumnValue::Null,
        Value::String(s) => ColumnValue::Text(s.clone()),
        Value::Number(n) => ColumnValue::Text(n.to_string()),
        Value::Bool(b) => ColumnValue::Text(b.to_string()),
        other => ColumnValue::Text(other.to_string()),
    }
}

fn map_integer(raw: &Value) -> ColumnValue {
    match raw {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64))
            .map(ColumnValue::Integer)
            .unwrap_or(ColumnValue::Null),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| {
                    s.parse::<f64>()
                        .ok()
                        .filter(|f| f.is_finite())
                        .map(|f| f.trunc() as i64)
                })
                .map(ColumnValue::Integer)
                .unwrap_or(ColumnValue::Null)
        }
        _ => ColumnValue::Null,
    }
}

fn map_float(raw: &Value) -> ColumnValue {
    let parsed = match raw {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed
        .filter(|f| f.is_finite())
        .map(ColumnValue::Real)
        .unwrap_or(ColumnValue::Null)
}

fn map_bool(raw: &Value) -> bool {
    match raw {
        Value::Bool(b) => *b,
        Value::String(s) => s.trim().eq_ignore_ascii_case("true"),
        _ => false,
    }
}

fn lookup(raw: &Value, key: &str) -> ColumnValue {
    match raw.as_object().and_then(|o| o.get(key)) {
        Some(Value::String(s)) => ColumnValue::Text(s.clone()),
        Some(Value::Number(n)) => ColumnValue::Text(n.to_string()),
        _ => ColumnValue::Null,
    }
}

fn is_blank_json(raw: &Value) -> bool {
    match raw {
        Value::Null => true,
        Value::Object(o) => o.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(max).collect();
        out.push('…');
        out
    }
}

//! Patch operations
//!
//! A patch is a JSON object. A field whose value is `{"__op__": "add",
//! "value": n}` is a counter increment; any other value replaces the field
//! (`null` removes it). Integer arithmetic is exact (i128) and falls back to
//! f64 only when a float is involved or the result leaves the i64/u64 range.

use serde_json::{Map, Number, Value};

use super::errors::{CrdtError, CrdtResult};

/// Field naming the operation of a CRDT update
pub const OP_KEY: &str = "__op__";

/// Field holding the operand
pub const OPERAND_KEY: &str = "value";

/// The only operation with a defined inverse
pub const ADD_OP: &str = "add";

/// One field of a patch
#[derive(Debug, Clone, PartialEq)]
pub enum FieldUpdate {
    /// Replace the field (`Null` removes it)
    Set(Value),
    /// Add to a numeric field
    Add(Value),
}

impl FieldUpdate {
    /// Back to patch JSON
    pub fn to_value(&self) -> Value {
        match self {
            FieldUpdate::Set(value) => value.clone(),
            FieldUpdate::Add(operand) => add_op(operand.clone()),
        }
    }
}

/// `{"__op__": "add", "value": operand}`
pub fn add_op(operand: Value) -> Value {
    let mut map = Map::new();
    map.insert(OP_KEY.to_string(), Value::String(ADD_OP.to_string()));
    map.insert(OPERAND_KEY.to_string(), operand);
    Value::Object(map)
}

/// Classify one patch field
pub fn parse_update(field: &str, value: &Value) -> CrdtResult<FieldUpdate> {
    let Value::Object(map) = value else {
        return Ok(FieldUpdate::Set(value.clone()));
    };
    let Some(op) = map.get(OP_KEY) else {
        return Ok(FieldUpdate::Set(value.clone()));
    };
    match op.as_str() {
        Some(ADD_OP) => {
            let operand = map.get(OPERAND_KEY).cloned().unwrap_or(Value::Null);
            if !operand.is_number() {
                return Err(CrdtError::InvalidOperand {
                    field: field.to_string(),
                    reason: format!("add operand {} is not a number", operand),
                });
            }
            Ok(FieldUpdate::Add(operand))
        }
        Some(other) => Err(CrdtError::UnsupportedOperation(other.to_string())),
        None => Err(CrdtError::UnsupportedOperation(op.to_string())),
    }
}

/// Parse every field of a patch
pub fn parse_patch(patch: &Map<String, Value>) -> CrdtResult<Vec<(String, FieldUpdate)>> {
    patch
        .iter()
        .map(|(field, value)| Ok((field.clone(), parse_update(field, value)?)))
        .collect()
}

fn as_i128(number: &Number) -> Option<i128> {
    number
        .as_i64()
        .map(i128::from)
        .or_else(|| number.as_u64().map(i128::from))
}

fn from_i128(value: i128) -> Option<Value> {
    if let Ok(v) = i64::try_from(value) {
        return Some(Value::from(v));
    }
    u64::try_from(value).ok().map(Value::from)
}

fn from_f64(field: &str, value: f64) -> CrdtResult<Value> {
    Number::from_f64(value)
        .map(Value::Number)
        .ok_or_else(|| CrdtError::InvalidOperand {
            field: field.to_string(),
            reason: format!("result {} is not finite", value),
        })
}

/// `left + right`; `Null` counts as zero
pub fn add_values(field: &str, left: &Value, right: &Value) -> CrdtResult<Value> {
    let zero = Number::from(0);
    let number = |value: &Value| -> CrdtResult<Number> {
        match value {
            Value::Null => Ok(zero.clone()),
            Value::Number(n) => Ok(n.clone()),
            other => Err(CrdtError::InvalidOperand {
                field: field.to_string(),
                reason: format!("{} is not a number", other),
            }),
        }
    };
    let (a, b) = (number(left)?, number(right)?);
    if let (Some(x), Some(y)) = (as_i128(&a), as_i128(&b)) {
        if let Some(value) = x.checked_add(y).and_then(from_i128) {
            return Ok(value);
        }
    }
    let x = a.as_f64().unwrap_or(0.0);
    let y = b.as_f64().unwrap_or(0.0);
    from_f64(field, x + y)
}

/// `-value`
pub fn negate(field: &str, value: &Value) -> CrdtResult<Value> {
    match value {
        Value::Number(n) => {
            if let Some(x) = as_i128(n) {
                if let Some(value) = from_i128(-x) {
                    return Ok(value);
                }
            }
            from_f64(field, -n.as_f64().unwrap_or(0.0))
        }
        Value::Null => Ok(Value::from(0)),
        other => Err(CrdtError::InvalidOperand {
            field: field.to_string(),
            reason: format!("{} is not a number", other),
        }),
    }
}

/// Apply a patch to `base` (a missing or non-object base starts empty)
pub fn apply_patch(base: Option<&Value>, patch: &Map<String, Value>) -> CrdtResult<Value> {
    let mut record = match base {
        Some(Value::Object(map)) => map.clone(),
        _ => Map::new(),
    };
    for (field, update) in parse_patch(patch)? {
        match update {
            FieldUpdate::Set(Value::Null) => {
                record.remove(&field);
            }
            FieldUpdate::Set(value) => {
                record.insert(field, value);
            }
            FieldUpdate::Add(operand) => {
                let current = record.get(&field).cloned().unwrap_or(Value::Null);
                let sum = add_values(&field, &current, &operand)?;
                record.insert(field, sum);
            }
        }
    }
    Ok(Value::Object(record))
}

/// Rebuild `update` as if it had been applied before `newer`.
///
/// - add followed by add composes into one add
/// - a plain value followed by an add becomes the plain sum
/// - a field the newer update overwrites is dropped, or carries the newer
///   value when `full` is set
/// - fields only in `newer` are kept only when `full` is set
pub fn rebuild_update_before(
    update: &Map<String, Value>,
    newer: &Map<String, Value>,
    full: bool,
) -> CrdtResult<Map<String, Value>> {
    let mut rebuilt = Map::new();
    for (field, older_value) in update {
        let older = parse_update(field, older_value)?;
        let Some(newer_value) = newer.get(field) else {
            rebuilt.insert(field.clone(), older_value.clone());
            continue;
        };
        match (older, parse_update(field, newer_value)?) {
            (FieldUpdate::Add(a), FieldUpdate::Add(b)) => {
                rebuilt.insert(field.clone(), add_op(add_values(field, &a, &b)?));
            }
            (FieldUpdate::Set(value), FieldUpdate::Add(b)) => {
                rebuilt.insert(field.clone(), add_values(field, &value, &b)?);
            }
            (_, FieldUpdate::Set(value)) => {
                if full {
                    rebuilt.insert(field.clone(), value);
                }
            }
        }
    }
    if full {
        for (field, newer_value) in newer {
            if !update.contains_key(field) {
                parse_update(field, newer_value)?;
                rebuilt.insert(field.clone(), newer_value.clone());
            }
        }
    }
    Ok(rebuilt)
}

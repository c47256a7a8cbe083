//! The JSON0 transformer: apply, invert, append.
//!
//! `apply` runs an operation list strictly in order against a working
//! clone, so a failure partway through never leaves the caller's value
//! half-mutated. `invert` produces the list that maps the post-state back
//! to the pre-state. `append` grows a pending list for queue compaction.
//!
//! Reference: the JSON0 OT type as shipped by ShareDB
//! (`https://github.com/ottypes/json0`).

use serde_json::{Number, Value};

use crate::error::OtError;
use crate::op::{JsonOp, OpKind};
use crate::path::{format_path, walk_mut, PathSegment};
use crate::text0::{self, TextOp};

/// Apply `ops` to `value`, producing the new value.
///
/// Strict list order, no internal reordering. All-or-nothing: on error the
/// returned `Err` is the only effect.
pub fn apply(value: &Value, ops: &[JsonOp]) -> Result<Value, OtError> {
    let mut out = value.clone();
    for op in ops {
        apply_one(&mut out, op)?;
    }
    Ok(out)
}

/// Invert an operation list: reversed order, each op rewritten to undo
/// itself. Applying the result to the post-state yields the pre-state.
pub fn invert(ops: &[JsonOp]) -> Result<Vec<JsonOp>, OtError> {
    ops.iter().rev().map(invert_one).collect()
}

/// Append `op` to a pending list such that the list stays equivalent to
/// applying its members in sequence.
///
/// Concatenation is already correct; the one compaction taken is merging
/// consecutive numeric adds on an identical path.
pub fn append(list: &mut Vec<JsonOp>, op: JsonOp) {
    if let Some(last) = list.last_mut() {
        if last.path == op.path {
            if let (OpKind::NumberAdd { amount: a }, OpKind::NumberAdd { amount: b }) =
                (&last.kind, &op.kind)
            {
                if let Ok(sum) = add_numbers(a, b, &op.path) {
                    last.kind = OpKind::NumberAdd { amount: sum };
                    return;
                }
            }
        }
    }
    list.push(op);
}

fn apply_one(root: &mut Value, op: &JsonOp) -> Result<(), OtError> {
    let Some((last, parents)) = op.path.split_last() else {
        // Every form, subtype dispatch included, needs a terminal token.
        return Err(OtError::InvalidPath(format_path(&op.path)));
    };

    match &op.kind {
        OpKind::ObjectInsert { value } => {
            let (map, key) = object_parent(root, parents, last, &op.path)?;
            if let Some(found) = map.get(key) {
                return Err(OtError::OldDataMismatch {
                    path: format_path(&op.path),
                    expected: Value::Null,
                    found: found.clone(),
                });
            }
            map.insert(key.to_string(), value.clone());
        }
        OpKind::ObjectDelete { old } => {
            let (map, key) = object_parent(root, parents, last, &op.path)?;
            check_pre_image(map.get(key), old, &op.path)?;
            map.remove(key);
        }
        OpKind::ObjectReplace { value, old } => {
            let (map, key) = object_parent(root, parents, last, &op.path)?;
            check_pre_image(map.get(key), old, &op.path)?;
            map.insert(key.to_string(), value.clone());
        }
        OpKind::ListInsert { value } => {
            let (arr, index) = array_parent(root, parents, last, &op.path)?;
            if index > arr.len() {
                return Err(OtError::InvalidPath(format_path(&op.path)));
            }
            arr.insert(index, value.clone());
        }
        OpKind::ListDelete { old } => {
            let (arr, index) = array_parent(root, parents, last, &op.path)?;
            if index >= arr.len() {
                return Err(OtError::IndexOutOfRange {
                    path: format_path(&op.path),
                    index,
                    len: arr.len(),
                });
            }
            check_pre_image(Some(&arr[index]), old, &op.path)?;
            arr.remove(index);
        }
        OpKind::ListReplace { value, old } => {
            let (arr, index) = array_parent(root, parents, last, &op.path)?;
            if index >= arr.len() {
                return Err(OtError::IndexOutOfRange {
                    path: format_path(&op.path),
                    index,
                    len: arr.len(),
                });
            }
            check_pre_image(Some(&arr[index]), old, &op.path)?;
            arr[index] = value.clone();
        }
        OpKind::NumberAdd { amount } => {
            let target = walk_mut(root, &op.path)?;
            let Value::Number(current) = target else {
                return Err(OtError::InvalidJsonData(format!(
                    "na target at {} is not a number",
                    format_path(&op.path)
                )));
            };
            *current = add_numbers(current, amount, &op.path)?;
        }
        OpKind::StringInsert { text } => {
            let (s, offset) = string_parent(root, parents, last, &op.path)?;
            text0::insert_at(s, offset, text).map_err(|e| at_path(e, &op.path))?;
        }
        OpKind::StringDelete { text } => {
            let (s, offset) = string_parent(root, parents, last, &op.path)?;
            text0::delete_at(s, offset, text).map_err(|e| at_path(e, &op.path))?;
        }
        OpKind::Subtype { name, op: inner } => {
            if name != text0::SUBTYPE {
                return Err(OtError::UnsupportedSubtype(name.clone()));
            }
            let target = walk_mut(root, &op.path)?;
            let Value::String(current) = target else {
                return Err(OtError::InvalidJsonData(format!(
                    "text0 target at {} is not a string",
                    format_path(&op.path)
                )));
            };
            let edits: Vec<TextOp> = serde_json::from_value(inner.clone())
                .map_err(|e| OtError::InvalidJsonData(format!("malformed text0 op: {e}")))?;
            let edited = text0::apply(current, &edits).map_err(|e| at_path(e, &op.path))?;
            *target = Value::String(edited);
        }
    }
    Ok(())
}

fn invert_one(op: &JsonOp) -> Result<JsonOp, OtError> {
    let kind = match &op.kind {
        OpKind::ObjectInsert { value } => OpKind::ObjectDelete { old: value.clone() },
        OpKind::ObjectDelete { old } => OpKind::ObjectInsert { value: old.clone() },
        OpKind::ObjectReplace { value, old } => OpKind::ObjectReplace {
            value: old.clone(),
            old: value.clone(),
        },
        OpKind::ListInsert { value } => OpKind::ListDelete { old: value.clone() },
        OpKind::ListDelete { old } => OpKind::ListInsert { value: old.clone() },
        OpKind::ListReplace { value, old } => OpKind::ListReplace {
            value: old.clone(),
            old: value.clone(),
        },
        OpKind::NumberAdd { amount } => OpKind::NumberAdd {
            amount: negate(amount, &op.path)?,
        },
        OpKind::StringInsert { text } => OpKind::StringDelete { text: text.clone() },
        OpKind::StringDelete { text } => OpKind::StringInsert { text: text.clone() },
        OpKind::Subtype { name, op: inner } => {
            if name != text0::SUBTYPE {
                return Err(OtError::UnsupportedSubtype(name.clone()));
            }
            let edits: Vec<TextOp> = serde_json::from_value(inner.clone())
                .map_err(|e| OtError::InvalidJsonData(format!("malformed text0 op: {e}")))?;
            let inverted = serde_json::to_value(text0::invert(&edits))
                .map_err(|e| OtError::InvalidJsonData(e.to_string()))?;
            OpKind::Subtype {
                name: name.clone(),
                op: inverted,
            }
        }
    };
    Ok(JsonOp {
        path: op.path.clone(),
        kind,
    })
}

fn object_parent<'a, 'b>(
    root: &'a mut Value,
    parents: &[PathSegment],
    last: &'b PathSegment,
    full: &[PathSegment],
) -> Result<(&'a mut serde_json::Map<String, Value>, &'b str), OtError> {
    let parent = walk_mut(root, parents)?;
    match (parent, last) {
        (Value::Object(map), PathSegment::Key(key)) => Ok((map, key.as_str())),
        _ => Err(OtError::InvalidPath(format_path(full))),
    }
}

fn array_parent<'a>(
    root: &'a mut Value,
    parents: &[PathSegment],
    last: &PathSegment,
    full: &[PathSegment],
) -> Result<(&'a mut Vec<Value>, usize), OtError> {
    let parent = walk_mut(root, parents)?;
    match (parent, last) {
        (Value::Array(arr), PathSegment::Index(i)) => Ok((arr, *i)),
        _ => Err(OtError::InvalidPath(format_path(full))),
    }
}

fn string_parent<'a>(
    root: &'a mut Value,
    parents: &[PathSegment],
    last: &PathSegment,
    full: &[PathSegment],
) -> Result<(&'a mut String, usize), OtError> {
    let parent = walk_mut(root, parents)?;
    match (parent, last) {
        (Value::String(s), PathSegment::Index(offset)) => Ok((s, *offset)),
        _ => Err(OtError::InvalidPath(format_path(full))),
    }
}

fn check_pre_image(
    found: Option<&Value>,
    expected: &Value,
    path: &[PathSegment],
) -> Result<(), OtError> {
    match found {
        Some(v) if v == expected => Ok(()),
        other => Err(OtError::OldDataMismatch {
            path: format_path(path),
            expected: expected.clone(),
            found: other.cloned().unwrap_or(Value::Null),
        }),
    }
}

fn add_numbers(current: &Number, amount: &Number, path: &[PathSegment]) -> Result<Number, OtError> {
    if let (Some(a), Some(b)) = (current.as_i64(), amount.as_i64()) {
        return a
            .checked_add(b)
            .map(Number::from)
            .ok_or_else(|| OtError::InvalidJsonData(format!("integer overflow at {}", format_path(path))));
    }
    if let (Some(a), Some(b)) = (current.as_u64(), amount.as_u64()) {
        return a
            .checked_add(b)
            .map(Number::from)
            .ok_or_else(|| OtError::InvalidJsonData(format!("integer overflow at {}", format_path(path))));
    }
    if current.is_f64() && amount.is_f64() {
        let sum = current.as_f64().unwrap_or_default() + amount.as_f64().unwrap_or_default();
        return Number::from_f64(sum).ok_or_else(|| {
            OtError::InvalidJsonData(format!("non-finite sum at {}", format_path(path)))
        });
    }
    // Kinds are preserved: int onto decimal (or vice versa) is rejected.
    Err(OtError::InvalidJsonData(format!(
        "numeric kind mismatch at {}",
        format_path(path)
    )))
}

fn negate(amount: &Number, path: &[PathSegment]) -> Result<Number, OtError> {
    if let Some(i) = amount.as_i64() {
        return i
            .checked_neg()
            .map(Number::from)
            .ok_or_else(|| OtError::InvalidJsonData(format!("integer overflow at {}", format_path(path))));
    }
    if amount.is_f64() {
        let f = amount.as_f64().unwrap_or_default();
        return Number::from_f64(-f).ok_or_else(|| {
            OtError::InvalidJsonData(format!("non-finite negation at {}", format_path(path)))
        });
    }
    Err(OtError::InvalidJsonData(format!(
        "cannot negate {amount} at {}",
        format_path(path)
    )))
}

fn at_path(e: OtError, path: &[PathSegment]) -> OtError {
    match e {
        OtError::IndexOutOfRange { index, len, .. } => OtError::IndexOutOfRange {
            path: format_path(path),
            index,
            len,
        },
        OtError::OldDataMismatch { expected, found, .. } => OtError::OldDataMismatch {
            path: format_path(path),
            expected,
            found,
        },
        other => other,
    }
}

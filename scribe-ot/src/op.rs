//! The JSON0 operation model.
//!
//! On the wire every operation is a JSON object carrying `p` (a path)
//! plus exactly one keyed form: `oi`/`od` for mappings, `li`/`ld` for
//! sequences, `na` for numeric add, `si`/`sd` for string splices, and
//! `t`+`o` for an embedded subtype. In memory that is a path plus a
//! payload sum; the wire shape round-trips through [`serde`].

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Number, Value};

use crate::error::OtError;
use crate::path::{Path, PathSegment};

/// A single JSON0 operation: a path and one keyed payload form.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonOp {
    pub path: Path,
    pub kind: OpKind,
}

/// The mutually exclusive payload forms of a JSON0 operation.
#[derive(Debug, Clone, PartialEq)]
pub enum OpKind {
    /// `oi`: set a mapping key that is currently absent.
    ObjectInsert { value: Value },
    /// `od`: remove a mapping key whose current value matches the pre-image.
    ObjectDelete { old: Value },
    /// `oi` + `od`: replace a mapping key, checking the pre-image.
    ObjectReplace { value: Value, old: Value },
    /// `li`: insert into a sequence at the path's terminal index.
    ListInsert { value: Value },
    /// `ld`: remove from a sequence, checking the pre-image.
    ListDelete { old: Value },
    /// `li` + `ld`: replace a sequence element, checking the pre-image.
    ListReplace { value: Value, old: Value },
    /// `na`: add to the number at the path; kinds must match.
    NumberAdd { amount: Number },
    /// `si`: insert text into the string whose offset is the terminal index.
    StringInsert { text: String },
    /// `sd`: delete text, checking the substring at the offset.
    StringDelete { text: String },
    /// `t` + `o`: hand the value at the path to a registered subtype.
    Subtype { name: String, op: Value },
}

impl JsonOp {
    pub fn object_insert(path: Path, value: Value) -> Self {
        JsonOp { path, kind: OpKind::ObjectInsert { value } }
    }

    pub fn object_delete(path: Path, old: Value) -> Self {
        JsonOp { path, kind: OpKind::ObjectDelete { old } }
    }

    pub fn object_replace(path: Path, value: Value, old: Value) -> Self {
        JsonOp { path, kind: OpKind::ObjectReplace { value, old } }
    }

    pub fn list_insert(path: Path, value: Value) -> Self {
        JsonOp { path, kind: OpKind::ListInsert { value } }
    }

    pub fn list_delete(path: Path, old: Value) -> Self {
        JsonOp { path, kind: OpKind::ListDelete { old } }
    }

    pub fn list_replace(path: Path, value: Value, old: Value) -> Self {
        JsonOp { path, kind: OpKind::ListReplace { value, old } }
    }

    pub fn number_add(path: Path, amount: Number) -> Self {
        JsonOp { path, kind: OpKind::NumberAdd { amount } }
    }

    pub fn string_insert(path: Path, offset: usize, text: impl Into<String>) -> Self {
        let mut path = path;
        path.push(PathSegment::Index(offset));
        JsonOp { path, kind: OpKind::StringInsert { text: text.into() } }
    }

    pub fn string_delete(path: Path, offset: usize, text: impl Into<String>) -> Self {
        let mut path = path;
        path.push(PathSegment::Index(offset));
        JsonOp { path, kind: OpKind::StringDelete { text: text.into() } }
    }

    pub fn subtype(path: Path, name: impl Into<String>, op: Value) -> Self {
        JsonOp { path, kind: OpKind::Subtype { name: name.into(), op } }
    }
}

#[derive(Serialize, Deserialize, Default)]
struct RawOp {
    p: Path,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    oi: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    od: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    li: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    ld: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    na: Option<Number>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    si: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    sd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    t: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    o: Option<Value>,
}

impl From<&JsonOp> for RawOp {
    fn from(op: &JsonOp) -> Self {
        let mut raw = RawOp {
            p: op.path.clone(),
            ..RawOp::default()
        };
        match &op.kind {
            OpKind::ObjectInsert { value } => raw.oi = Some(value.clone()),
            OpKind::ObjectDelete { old } => raw.od = Some(old.clone()),
            OpKind::ObjectReplace { value, old } => {
                raw.oi = Some(value.clone());
                raw.od = Some(old.clone());
            }
            OpKind::ListInsert { value } => raw.li = Some(value.clone()),
            OpKind::ListDelete { old } => raw.ld = Some(old.clone()),
            OpKind::ListReplace { value, old } => {
                raw.li = Some(value.clone());
                raw.ld = Some(old.clone());
            }
            OpKind::NumberAdd { amount } => raw.na = Some(amount.clone()),
            OpKind::StringInsert { text } => raw.si = Some(text.clone()),
            OpKind::StringDelete { text } => raw.sd = Some(text.clone()),
            OpKind::Subtype { name, op } => {
                raw.t = Some(name.clone());
                raw.o = Some(op.clone());
            }
        }
        raw
    }
}

impl TryFrom<RawOp> for JsonOp {
    type Error = OtError;

    fn try_from(raw: RawOp) -> Result<Self, OtError> {
        let RawOp { p, oi, od, li, ld, na, si, sd, t, o } = raw;

        let groups = [
            oi.is_some() || od.is_some(),
            li.is_some() || ld.is_some(),
            na.is_some(),
            si.is_some(),
            sd.is_some(),
            t.is_some() || o.is_some(),
        ];
        if groups.iter().filter(|present| **present).count() != 1 {
            return Err(OtError::UnsupportedOperation(
                "op must carry exactly one keyed form".to_string(),
            ));
        }

        let kind = if let Some(amount) = na {
            OpKind::NumberAdd { amount }
        } else if let Some(text) = si {
            OpKind::StringInsert { text }
        } else if let Some(text) = sd {
            OpKind::StringDelete { text }
        } else if oi.is_some() || od.is_some() {
            match (oi, od) {
                (Some(value), Some(old)) => OpKind::ObjectReplace { value, old },
                (Some(value), None) => OpKind::ObjectInsert { value },
                (None, Some(old)) => OpKind::ObjectDelete { old },
                (None, None) => unreachable!(),
            }
        } else if li.is_some() || ld.is_some() {
            match (li, ld) {
                (Some(value), Some(old)) => OpKind::ListReplace { value, old },
                (Some(value), None) => OpKind::ListInsert { value },
                (None, Some(old)) => OpKind::ListDelete { old },
                (None, None) => unreachable!(),
            }
        } else {
            match (t, o) {
                (Some(name), Some(op)) => OpKind::Subtype { name, op },
                _ => {
                    return Err(OtError::UnsupportedOperation(
                        "subtype op requires both t and o".to_string(),
                    ))
                }
            }
        };

        Ok(JsonOp { path: p, kind })
    }
}

impl Serialize for JsonOp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        RawOp::from(self).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for JsonOp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawOp::deserialize(deserializer)?;
        JsonOp::try_from(raw).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_round_trip_all_forms() {
        let ops = vec![
            JsonOp::object_insert(vec!["a".into()], json!(1)),
            JsonOp::object_delete(vec!["a".into()], json!(1)),
            JsonOp::object_replace(vec!["a".into()], json!(2), json!(1)),
            JsonOp::list_insert(vec!["xs".into(), 0.into()], json!("x")),
            JsonOp::list_delete(vec!["xs".into(), 0.into()], json!("x")),
            JsonOp::list_replace(vec!["xs".into(), 0.into()], json!("y"), json!("x")),
            JsonOp::number_add(vec!["n".into()], 3.into()),
            JsonOp::string_insert(vec!["s".into()], 0, "hi"),
            JsonOp::string_delete(vec!["s".into()], 0, "hi"),
            JsonOp::subtype(vec!["s".into()], "text0", json!([{"p": [0], "i": "x"}])),
        ];
        for op in ops {
            let wire = serde_json::to_value(&op).unwrap();
            let back: JsonOp = serde_json::from_value(wire).unwrap();
            assert_eq!(back, op);
        }
    }

    #[test]
    fn wire_shape_replace() {
        let op = JsonOp::object_replace(vec!["numClicks".into()], json!(6), json!(5));
        assert_eq!(
            serde_json::to_value(&op).unwrap(),
            json!({"p": ["numClicks"], "oi": 6, "od": 5})
        );
    }

    #[test]
    fn rejects_zero_or_many_forms() {
        assert!(serde_json::from_value::<JsonOp>(json!({"p": ["a"]})).is_err());
        assert!(serde_json::from_value::<JsonOp>(json!({"p": ["a"], "oi": 1, "li": 2})).is_err());
        assert!(serde_json::from_value::<JsonOp>(json!({"p": ["a"], "si": "x", "sd": "y"})).is_err());
        assert!(serde_json::from_value::<JsonOp>(json!({"p": ["a"], "t": "text0"})).is_err());
    }

    #[test]
    fn string_splice_offset_lands_in_path() {
        let op = JsonOp::string_insert(vec!["title".into()], 4, "!");
        assert_eq!(
            serde_json::to_value(&op).unwrap(),
            json!({"p": ["title", 4], "si": "!"})
        );
    }
}

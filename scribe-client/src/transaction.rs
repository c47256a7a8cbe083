//! The change proxy: path-addressed mutators that collect JSON0 ops.
//!
//! A [`ChangeContext`] holds a working copy of the snapshot plus the op
//! list built so far. Every mutator first applies its op to the working
//! copy — an op whose preconditions fail is rejected on the spot and
//! never recorded — so later mutators in the same transaction see the
//! effects of earlier ones, and the submitted list is guaranteed to apply
//! cleanly to the document it was built against.

use serde::Serialize;
use serde_json::{Number, Value};

use scribe_ot::{format_path, json0, lookup, JsonOp, OtError, Path, PathSegment};

use crate::error::ClientError;

/// One transaction's worth of edits against a document snapshot.
pub struct ChangeContext {
    working: Value,
    ops: Vec<JsonOp>,
}

impl ChangeContext {
    pub(crate) fn new(base: Value) -> Self {
        ChangeContext {
            working: base,
            ops: Vec::new(),
        }
    }

    /// Address the document root.
    pub fn root(&mut self) -> Slot<'_> {
        Slot {
            ctx: self,
            path: Vec::new(),
        }
    }

    /// Address a top-level mapping key.
    pub fn key(&mut self, key: &str) -> Slot<'_> {
        self.root().key(key)
    }

    /// Address a top-level sequence index.
    pub fn index(&mut self, index: usize) -> Slot<'_> {
        self.root().index(index)
    }

    pub(crate) fn into_parts(self) -> (Vec<JsonOp>, Value) {
        (self.ops, self.working)
    }

    fn record(&mut self, op: JsonOp) -> Result<(), ClientError> {
        self.working = json0::apply(&self.working, std::slice::from_ref(&op))?;
        json0::append(&mut self.ops, op);
        Ok(())
    }
}

/// An addressable slot in the document: a path plus the transaction it
/// feeds. Navigation consumes the slot; mutators consume it and record
/// one op.
pub struct Slot<'c> {
    ctx: &'c mut ChangeContext,
    path: Path,
}

impl<'c> Slot<'c> {
    /// Descend into a mapping key.
    pub fn key(mut self, key: &str) -> Slot<'c> {
        self.path.push(PathSegment::Key(key.to_string()));
        self
    }

    /// Descend into a sequence index.
    pub fn index(mut self, index: usize) -> Slot<'c> {
        self.path.push(PathSegment::Index(index));
        self
    }

    /// The slot's current value in the working copy.
    pub fn current(&self) -> Option<&Value> {
        lookup(&self.ctx.working, &self.path).ok().flatten()
    }

    /// Set the slot to a new value: a replace where something already
    /// lives here (recording the pre-image), an insert otherwise.
    pub fn set<T: Serialize>(self, value: T) -> Result<(), ClientError> {
        let value =
            serde_json::to_value(value).map_err(|e| ClientError::EntityEncode(e.to_string()))?;
        let Some((last, parents)) = self.path.split_last() else {
            return Err(OtError::InvalidPath(format_path(&self.path)).into());
        };
        let parent = lookup(&self.ctx.working, parents)?
            .ok_or_else(|| OtError::InvalidPath(format_path(&self.path)))?;
        let op = match (parent, last) {
            (Value::Object(map), PathSegment::Key(key)) => match map.get(key) {
                Some(old) => JsonOp::object_replace(self.path.clone(), value, old.clone()),
                None => JsonOp::object_insert(self.path.clone(), value),
            },
            (Value::Array(arr), PathSegment::Index(index)) => {
                if *index < arr.len() {
                    JsonOp::list_replace(self.path.clone(), value, arr[*index].clone())
                } else if *index == arr.len() {
                    JsonOp::list_insert(self.path.clone(), value)
                } else {
                    return Err(OtError::InvalidPath(format_path(&self.path)).into());
                }
            }
            _ => return Err(OtError::InvalidPath(format_path(&self.path)).into()),
        };
        self.ctx.record(op)
    }

    /// Remove the slot from its parent container, recording the pre-image.
    pub fn remove(self) -> Result<(), ClientError> {
        let Some((last, parents)) = self.path.split_last() else {
            return Err(OtError::InvalidPath(format_path(&self.path)).into());
        };
        let parent = lookup(&self.ctx.working, parents)?
            .ok_or_else(|| OtError::InvalidPath(format_path(&self.path)))?;
        let op = match (parent, last) {
            (Value::Object(map), PathSegment::Key(key)) => {
                let old = map
                    .get(key)
                    .ok_or_else(|| OtError::InvalidPath(format_path(&self.path)))?;
                JsonOp::object_delete(self.path.clone(), old.clone())
            }
            (Value::Array(arr), PathSegment::Index(index)) => {
                let old = arr.get(*index).ok_or(OtError::IndexOutOfRange {
                    path: format_path(&self.path),
                    index: *index,
                    len: arr.len(),
                })?;
                JsonOp::list_delete(self.path.clone(), old.clone())
            }
            _ => return Err(OtError::InvalidPath(format_path(&self.path)).into()),
        };
        self.ctx.record(op)
    }

    /// Insert into the sequence this slot addresses an element of
    /// (`slot.index(i).insert(v)` shifts the tail right).
    pub fn insert<T: Serialize>(self, value: T) -> Result<(), ClientError> {
        let value =
            serde_json::to_value(value).map_err(|e| ClientError::EntityEncode(e.to_string()))?;
        self.ctx.record(JsonOp::list_insert(self.path, value))
    }

    /// Append to the sequence this slot addresses.
    pub fn push<T: Serialize>(self, value: T) -> Result<(), ClientError> {
        let value =
            serde_json::to_value(value).map_err(|e| ClientError::EntityEncode(e.to_string()))?;
        let len = match self.current() {
            Some(Value::Array(arr)) => arr.len(),
            _ => return Err(OtError::InvalidPath(format_path(&self.path)).into()),
        };
        let mut path = self.path.clone();
        path.push(PathSegment::Index(len));
        self.ctx.record(JsonOp::list_insert(path, value))
    }

    /// Add to the integer at this slot.
    pub fn add(self, amount: i64) -> Result<(), ClientError> {
        let path = self.path.clone();
        self.ctx.record(JsonOp::number_add(path, Number::from(amount)))
    }

    /// Add to the decimal at this slot.
    pub fn add_f64(self, amount: f64) -> Result<(), ClientError> {
        let amount = Number::from_f64(amount)
            .ok_or_else(|| OtError::InvalidJsonData("non-finite add amount".into()))?;
        let path = self.path.clone();
        self.ctx.record(JsonOp::number_add(path, amount))
    }

    /// Insert text into the string at this slot. Offsets count UTF-16
    /// code units.
    pub fn splice_insert(self, offset: usize, text: &str) -> Result<(), ClientError> {
        let path = self.path.clone();
        self.ctx
            .record(JsonOp::string_insert(path, offset, text))
    }

    /// Delete `len` UTF-16 code units from the string at this slot,
    /// recording the removed text as the pre-image.
    pub fn splice_delete(self, offset: usize, len: usize) -> Result<(), ClientError> {
        let removed = {
            let Some(Value::String(s)) = self.current() else {
                return Err(OtError::InvalidPath(format_path(&self.path)).into());
            };
            scribe_ot::text0::slice_utf16(s, offset, len)?.to_string()
        };
        let path = self.path.clone();
        self.ctx.record(JsonOp::string_delete(path, offset, removed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(base: Value) -> ChangeContext {
        ChangeContext::new(base)
    }

    #[test]
    fn set_emits_replace_with_pre_image() {
        let mut c = ctx(json!({"numClicks": 5}));
        c.key("numClicks").set(6).unwrap();
        let (ops, working) = c.into_parts();
        assert_eq!(working, json!({"numClicks": 6}));
        assert_eq!(
            serde_json::to_value(&ops).unwrap(),
            json!([{"p": ["numClicks"], "oi": 6, "od": 5}])
        );
    }

    #[test]
    fn set_emits_insert_for_absent_key() {
        let mut c = ctx(json!({}));
        c.key("label").set("clicks").unwrap();
        let (ops, _) = c.into_parts();
        assert_eq!(
            serde_json::to_value(&ops).unwrap(),
            json!([{"p": ["label"], "oi": "clicks"}])
        );
    }

    #[test]
    fn later_mutators_see_earlier_effects() {
        let mut c = ctx(json!({}));
        c.key("xs").set(json!([])).unwrap();
        c.key("xs").push("a").unwrap();
        c.key("xs").push("b").unwrap();
        let (ops, working) = c.into_parts();
        assert_eq!(working, json!({"xs": ["a", "b"]}));
        assert_eq!(ops.len(), 3);
    }

    #[test]
    fn list_set_chooses_replace_or_append() {
        let mut c = ctx(json!({"xs": [1, 2]}));
        c.key("xs").index(1).set(9).unwrap();
        c.key("xs").index(2).set(3).unwrap();
        let (ops, working) = c.into_parts();
        assert_eq!(working, json!({"xs": [1, 9, 3]}));
        assert_eq!(
            serde_json::to_value(&ops).unwrap(),
            json!([
                {"p": ["xs", 1], "li": 9, "ld": 2},
                {"p": ["xs", 2], "li": 3},
            ])
        );
    }

    #[test]
    fn set_past_end_is_rejected() {
        let mut c = ctx(json!({"xs": [1]}));
        assert!(c.key("xs").index(5).set(9).is_err());
        let (ops, _) = c.into_parts();
        assert!(ops.is_empty());
    }

    #[test]
    fn remove_records_pre_image() {
        let mut c = ctx(json!({"a": 1, "xs": ["x", "y"]}));
        c.key("a").remove().unwrap();
        c.key("xs").index(0).remove().unwrap();
        let (ops, working) = c.into_parts();
        assert_eq!(working, json!({"xs": ["y"]}));
        assert_eq!(
            serde_json::to_value(&ops).unwrap(),
            json!([
                {"p": ["a"], "od": 1},
                {"p": ["xs", 0], "ld": "x"},
            ])
        );
    }

    #[test]
    fn remove_of_absent_slot_is_rejected() {
        let mut c = ctx(json!({}));
        assert!(c.key("gone").remove().is_err());
    }

    #[test]
    fn add_validates_numeric_kind() {
        let mut c = ctx(json!({"i": 5, "f": 2.5}));
        c.key("i").add(2).unwrap();
        // Integer add onto a decimal never records an op.
        assert!(c.key("f").add(1).is_err());
        c.key("f").add_f64(0.5).unwrap();
        let (ops, working) = c.into_parts();
        assert_eq!(working, json!({"i": 7, "f": 3.0}));
        assert_eq!(ops.len(), 2);
    }

    #[test]
    fn consecutive_adds_compact() {
        let mut c = ctx(json!({"n": 0}));
        c.key("n").add(1).unwrap();
        c.key("n").add(1).unwrap();
        c.key("n").add(1).unwrap();
        let (ops, working) = c.into_parts();
        assert_eq!(working, json!({"n": 3}));
        assert_eq!(
            serde_json::to_value(&ops).unwrap(),
            json!([{"p": ["n"], "na": 3}])
        );
    }

    #[test]
    fn splice_helpers() {
        let mut c = ctx(json!({"title": "hello world"}));
        c.key("title").splice_delete(5, 6).unwrap();
        c.key("title").splice_insert(5, "!").unwrap();
        let (ops, working) = c.into_parts();
        assert_eq!(working, json!({"title": "hello!"}));
        assert_eq!(
            serde_json::to_value(&ops).unwrap(),
            json!([
                {"p": ["title", 5], "sd": " world"},
                {"p": ["title", 5], "si": "!"},
            ])
        );
    }

    #[test]
    fn root_set_is_rejected() {
        let mut c = ctx(json!({}));
        assert!(c.root().set(json!({"x": 1})).is_err());
    }

    #[test]
    fn failed_mutator_leaves_transaction_clean() {
        let mut c = ctx(json!({"a": 1}));
        c.key("b").set(2).unwrap();
        assert!(c.key("missing").index(0).set(1).is_err());
        let (ops, working) = c.into_parts();
        assert_eq!(ops.len(), 1);
        assert_eq!(working, json!({"a": 1, "b": 2}));
    }
}

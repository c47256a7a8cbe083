//! The TEXT0 string subtype.
//!
//! TEXT0 operations are flat edit lists against a plain string. Each
//! component addresses a single offset (its `p` is a one-element path)
//! and either inserts or deletes text there:
//!
//! ```text
//! {"p": [5], "i": "world"}     insert "world" at offset 5
//! {"p": [0], "d": "hello "}    delete "hello " at offset 0
//! ```
//!
//! Offsets count UTF-16 code units, matching how JavaScript-origin
//! ShareDB peers index strings. An offset past the end of the string, or
//! one that lands inside a surrogate pair, is an
//! [`IndexOutOfRange`](OtError::IndexOutOfRange) error.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::OtError;

/// Name this subtype registers under in JSON0 `t`/`o` dispatch.
pub const SUBTYPE: &str = "text0";

/// A single TEXT0 edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextOp {
    /// Offset in UTF-16 code units.
    pub offset: usize,
    pub edit: TextEdit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextEdit {
    Insert(String),
    Delete(String),
}

impl TextOp {
    pub fn insert(offset: usize, text: impl Into<String>) -> Self {
        TextOp {
            offset,
            edit: TextEdit::Insert(text.into()),
        }
    }

    pub fn delete(offset: usize, text: impl Into<String>) -> Self {
        TextOp {
            offset,
            edit: TextEdit::Delete(text.into()),
        }
    }

    /// The op that undoes this one.
    pub fn inverted(&self) -> TextOp {
        let edit = match &self.edit {
            TextEdit::Insert(s) => TextEdit::Delete(s.clone()),
            TextEdit::Delete(s) => TextEdit::Insert(s.clone()),
        };
        TextOp {
            offset: self.offset,
            edit,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct RawTextOp {
    p: Vec<usize>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    i: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    d: Option<String>,
}

impl Serialize for TextOp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let (i, d) = match &self.edit {
            TextEdit::Insert(s) => (Some(s.clone()), None),
            TextEdit::Delete(s) => (None, Some(s.clone())),
        };
        RawTextOp {
            p: vec![self.offset],
            i,
            d,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for TextOp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawTextOp::deserialize(deserializer)?;
        let [offset] = raw.p[..] else {
            return Err(D::Error::custom("text0 op path must be a single offset"));
        };
        let edit = match (raw.i, raw.d) {
            (Some(text), None) => TextEdit::Insert(text),
            (None, Some(text)) => TextEdit::Delete(text),
            _ => return Err(D::Error::custom("text0 op must carry exactly one of i/d")),
        };
        Ok(TextOp { offset, edit })
    }
}

/// Apply an edit list to a string, in list order.
pub fn apply(value: &str, ops: &[TextOp]) -> Result<String, OtError> {
    let mut out = value.to_string();
    for op in ops {
        match &op.edit {
            TextEdit::Insert(text) => insert_at(&mut out, op.offset, text)?,
            TextEdit::Delete(text) => delete_at(&mut out, op.offset, text)?,
        }
    }
    Ok(out)
}

/// Invert an edit list: reversed order, inserts and deletes swapped.
pub fn invert(ops: &[TextOp]) -> Vec<TextOp> {
    ops.iter().rev().map(TextOp::inverted).collect()
}

/// Length of a string in UTF-16 code units.
pub fn utf16_len(s: &str) -> usize {
    s.chars().map(char::len_utf16).sum()
}

/// Map a UTF-16 offset to a byte index into `s`.
fn byte_index(s: &str, offset: usize) -> Result<usize, OtError> {
    let mut units = 0usize;
    for (byte, ch) in s.char_indices() {
        if units == offset {
            return Ok(byte);
        }
        units += ch.len_utf16();
        if units > offset {
            // Landed inside a surrogate pair.
            return Err(OtError::IndexOutOfRange {
                path: format!("/{offset}"),
                index: offset,
                len: utf16_len(s),
            });
        }
    }
    if units == offset {
        Ok(s.len())
    } else {
        Err(OtError::IndexOutOfRange {
            path: format!("/{offset}"),
            index: offset,
            len: units,
        })
    }
}

/// The substring covering `len` UTF-16 code units starting at `offset`.
pub fn slice_utf16(s: &str, offset: usize, len: usize) -> Result<&str, OtError> {
    let start = byte_index(s, offset)?;
    let end = byte_index(s, offset + len)?;
    Ok(&s[start..end])
}

pub(crate) fn insert_at(s: &mut String, offset: usize, text: &str) -> Result<(), OtError> {
    let at = byte_index(s, offset)?;
    s.insert_str(at, text);
    Ok(())
}

pub(crate) fn delete_at(s: &mut String, offset: usize, expected: &str) -> Result<(), OtError> {
    let start = byte_index(s, offset)?;
    let end_units = offset + utf16_len(expected);
    let end = match byte_index(s, end_units) {
        Ok(b) => b,
        // Shorter document than the op expected: a stale pre-image.
        Err(_) => {
            return Err(OtError::OldDataMismatch {
                path: format!("/{offset}"),
                expected: expected.into(),
                found: s[start..].into(),
            })
        }
    };
    if &s[start..end] != expected {
        return Err(OtError::OldDataMismatch {
            path: format!("/{offset}"),
            expected: expected.into(),
            found: s[start..end].into(),
        });
    }
    s.replace_range(start..end, "");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn insert_and_delete() {
        let out = apply(
            "hello world",
            &[TextOp::delete(5, " world"), TextOp::insert(5, ", scribe")],
        )
        .unwrap();
        assert_eq!(out, "hello, scribe");
    }

    #[test]
    fn insert_at_end() {
        assert_eq!(apply("ab", &[TextOp::insert(2, "c")]).unwrap(), "abc");
    }

    #[test]
    fn insert_past_end_is_out_of_range() {
        assert!(matches!(
            apply("ab", &[TextOp::insert(3, "c")]),
            Err(OtError::IndexOutOfRange { .. })
        ));
    }

    #[test]
    fn delete_with_stale_text_mismatches() {
        assert!(matches!(
            apply("hello", &[TextOp::delete(0, "help")]),
            Err(OtError::OldDataMismatch { .. })
        ));
    }

    #[test]
    fn delete_overrunning_the_string_mismatches() {
        assert!(matches!(
            apply("hi", &[TextOp::delete(1, "ii")]),
            Err(OtError::OldDataMismatch { .. })
        ));
    }

    #[test]
    fn offsets_are_utf16_units() {
        // '𝄞' is one char but two UTF-16 code units.
        let s = "𝄞x";
        assert_eq!(utf16_len(s), 3);
        assert_eq!(apply(s, &[TextOp::insert(2, "!")]).unwrap(), "𝄞!x");
        // Offset 1 splits the surrogate pair.
        assert!(matches!(
            apply(s, &[TextOp::insert(1, "!")]),
            Err(OtError::IndexOutOfRange { .. })
        ));
    }

    #[test]
    fn invert_round_trips() {
        let ops = vec![TextOp::delete(0, "hi "), TextOp::insert(0, "yo ")];
        let applied = apply("hi there", &ops).unwrap();
        assert_eq!(applied, "yo there");
        let back = apply(&applied, &invert(&ops)).unwrap();
        assert_eq!(back, "hi there");
    }

    #[test]
    fn wire_shape() {
        let op = TextOp::insert(5, "world");
        assert_eq!(serde_json::to_value(&op).unwrap(), json!({"p": [5], "i": "world"}));
        let op = TextOp::delete(0, "x");
        assert_eq!(serde_json::to_value(&op).unwrap(), json!({"p": [0], "d": "x"}));
    }

    #[test]
    fn wire_rejects_malformed() {
        assert!(serde_json::from_value::<TextOp>(json!({"p": [1, 2], "i": "x"})).is_err());
        assert!(serde_json::from_value::<TextOp>(json!({"p": [1]})).is_err());
        assert!(serde_json::from_value::<TextOp>(json!({"p": [1], "i": "a", "d": "b"})).is_err());
    }
}

//! Path addressing over JSON values.
//!
//! A path is an ordered list of segments, each either a mapping key or a
//! sequence index, exactly as JSON0 serializes it: `["players", 0, "name"]`.
//!
//! Walking distinguishes two failure shapes: a missing or wrong-kind
//! *parent* is an [`OtError::InvalidPath`], while a missing *terminal*
//! element reads back as `None` (the undefined sentinel — it never hits
//! the wire).

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::OtError;

/// One step of a path: a key into a mapping or an index into a sequence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Index(usize),
    Key(String),
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Index(i) => write!(f, "{i}"),
            PathSegment::Key(k) => write!(f, "{k}"),
        }
    }
}

impl From<usize> for PathSegment {
    fn from(i: usize) -> Self {
        PathSegment::Index(i)
    }
}

impl From<&str> for PathSegment {
    fn from(k: &str) -> Self {
        PathSegment::Key(k.to_string())
    }
}

impl From<String> for PathSegment {
    fn from(k: String) -> Self {
        PathSegment::Key(k)
    }
}

/// A full path from the document root.
pub type Path = Vec<PathSegment>;

/// Render a path for error messages: `/players/0/name`.
pub fn format_path(path: &[PathSegment]) -> String {
    if path.is_empty() {
        return "/".to_string();
    }
    let mut out = String::new();
    for seg in path {
        out.push('/');
        out.push_str(&seg.to_string());
    }
    out
}

/// Walk to the value a path's prefix addresses. Every segment must land on
/// an existing element of the right container kind.
pub(crate) fn walk<'a>(root: &'a Value, path: &[PathSegment]) -> Result<&'a Value, OtError> {
    let mut cur = root;
    for (depth, seg) in path.iter().enumerate() {
        cur = match (cur, seg) {
            (Value::Object(map), PathSegment::Key(k)) => map
                .get(k)
                .ok_or_else(|| OtError::InvalidPath(format_path(&path[..=depth])))?,
            (Value::Array(arr), PathSegment::Index(i)) => arr
                .get(*i)
                .ok_or_else(|| OtError::InvalidPath(format_path(&path[..=depth])))?,
            _ => return Err(OtError::InvalidPath(format_path(&path[..=depth]))),
        };
    }
    Ok(cur)
}

/// Mutable variant of [`walk`].
pub(crate) fn walk_mut<'a>(
    root: &'a mut Value,
    path: &[PathSegment],
) -> Result<&'a mut Value, OtError> {
    let mut cur = root;
    for (depth, seg) in path.iter().enumerate() {
        cur = match (cur, seg) {
            (Value::Object(map), PathSegment::Key(k)) => map
                .get_mut(k)
                .ok_or_else(|| OtError::InvalidPath(format_path(&path[..=depth])))?,
            (Value::Array(arr), PathSegment::Index(i)) => arr
                .get_mut(*i)
                .ok_or_else(|| OtError::InvalidPath(format_path(&path[..=depth])))?,
            _ => return Err(OtError::InvalidPath(format_path(&path[..=depth]))),
        };
    }
    Ok(cur)
}

/// Read the value a path addresses.
///
/// The terminal element may be absent: a missing mapping key or an index
/// at (or past) the end of a sequence reads as `Ok(None)`. Anything wrong
/// *above* the terminal is `InvalidPath`.
pub fn lookup<'a>(root: &'a Value, path: &[PathSegment]) -> Result<Option<&'a Value>, OtError> {
    let Some((last, parents)) = path.split_last() else {
        return Ok(Some(root));
    };
    let parent = walk(root, parents)?;
    match (parent, last) {
        (Value::Object(map), PathSegment::Key(k)) => Ok(map.get(k)),
        (Value::Array(arr), PathSegment::Index(i)) => Ok(arr.get(*i)),
        _ => Err(OtError::InvalidPath(format_path(path))),
    }
}

/// Write the value a path addresses, creating or replacing the terminal
/// element in its parent container.
///
/// Parents must already exist and be the right container kind. A sequence
/// index equal to the length appends; anything past that is `InvalidPath`.
/// An empty path replaces the root wholesale.
pub fn write(root: &mut Value, path: &[PathSegment], new: Value) -> Result<(), OtError> {
    let Some((last, parents)) = path.split_last() else {
        *root = new;
        return Ok(());
    };
    let parent = walk_mut(root, parents)?;
    match (parent, last) {
        (Value::Object(map), PathSegment::Key(k)) => {
            map.insert(k.clone(), new);
            Ok(())
        }
        (Value::Array(arr), PathSegment::Index(i)) => {
            if *i < arr.len() {
                arr[*i] = new;
                Ok(())
            } else if *i == arr.len() {
                arr.push(new);
                Ok(())
            } else {
                Err(OtError::InvalidPath(format_path(path)))
            }
        }
        _ => Err(OtError::InvalidPath(format_path(path))),
    }
}

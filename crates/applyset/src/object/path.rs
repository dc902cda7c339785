//! Field paths into unstructured objects.
//!
//! Manifests flow through the engine as semi-structured JSON, so field access
//! happens through parsed paths instead of typed structs. The accepted syntax
//! is the subset of JSONPath the mutation annotation actually uses: an
//! optional leading `$.`, dotted field names, bracketed indices (`[0]`) and
//! bracketed quoted keys (`['key.with.dots']`).

use std::{fmt, str::FromStr};

use kube::core::DynamicObject;
use serde_json::Value;
use snafu::Snafu;

#[derive(Debug, PartialEq, Snafu)]
pub enum Error {
    #[snafu(display("field path is empty"))]
    Empty,

    #[snafu(display("unexpected character {found:?} at offset {offset} in field path {path:?}"))]
    UnexpectedCharacter {
        path: String,
        offset: usize,
        found: char,
    },

    #[snafu(display("unterminated bracket segment in field path {path:?}"))]
    UnterminatedBracket { path: String },

    #[snafu(display("invalid index {index:?} in field path {path:?}"))]
    InvalidIndex { path: String, index: String },
}

/// One step of a [`FieldPath`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PathSegment {
    Field(String),
    Index(usize),
}

/// A parsed path into an unstructured object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldPath {
    segments: Vec<PathSegment>,
}

impl FieldPath {
    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    /// Resolves the path against a JSON value, returning `None` when any
    /// intermediate step is absent or of the wrong shape.
    pub fn lookup<'a>(&self, root: &'a Value) -> Option<&'a Value> {
        let mut current = root;
        for segment in &self.segments {
            current = match segment {
                PathSegment::Field(field) => current.as_object()?.get(field)?,
                PathSegment::Index(index) => current.as_array()?.get(*index)?,
            };
        }
        Some(current)
    }

    /// Writes `new` at the path, creating intermediate objects for missing
    /// field segments. Index segments must resolve into an existing array
    /// slot or the position one past its end.
    pub fn set(&self, root: &mut Value, new: Value) -> bool {
        let mut current = root;
        let (last, prefix) = match self.segments.split_last() {
            Some(split) => split,
            None => return false,
        };

        for segment in prefix {
            current = match segment {
                PathSegment::Field(field) => {
                    if !current.is_object() {
                        return false;
                    }
                    current
                        .as_object_mut()
                        .expect("checked object above")
                        .entry(field.clone())
                        .or_insert_with(|| Value::Object(serde_json::Map::new()))
                }
                PathSegment::Index(index) => {
                    let array = match current.as_array_mut() {
                        Some(array) => array,
                        None => return false,
                    };
                    if *index >= array.len() {
                        return false;
                    }
                    &mut array[*index]
                }
            };
        }

        match last {
            PathSegment::Field(field) => {
                let object = match current.as_object_mut() {
                    Some(object) => object,
                    None => return false,
                };
                object.insert(field.clone(), new);
                true
            }
            PathSegment::Index(index) => {
                let array = match current.as_array_mut() {
                    Some(array) => array,
                    None => return false,
                };
                if *index < array.len() {
                    array[*index] = new;
                    true
                } else if *index == array.len() {
                    array.push(new);
                    true
                } else {
                    false
                }
            }
        }
    }
}

impl FromStr for FieldPath {
    type Err = Error;

    fn from_str(path: &str) -> Result<Self, Self::Err> {
        let trimmed = path.strip_prefix("$.").or_else(|| path.strip_prefix('$')).unwrap_or(path);
        let trimmed = trimmed.strip_prefix('.').unwrap_or(trimmed);
        if trimmed.is_empty() {
            return EmptySnafu.fail();
        }

        let mut segments = Vec::new();
        let mut chars = trimmed.char_indices().peekable();
        let mut field = String::new();

        let flush = |field: &mut String, segments: &mut Vec<PathSegment>| {
            if !field.is_empty() {
                segments.push(PathSegment::Field(std::mem::take(field)));
            }
        };

        while let Some((offset, c)) = chars.next() {
            match c {
                '.' => {
                    if field.is_empty() && !matches!(segments.last(), Some(PathSegment::Index(_))) {
                        return UnexpectedCharacterSnafu {
                            path,
                            offset,
                            found: c,
                        }
                        .fail();
                    }
                    flush(&mut field, &mut segments);
                }
                '[' => {
                    flush(&mut field, &mut segments);
                    let mut inner = String::new();
                    let mut closed = false;
                    for (_, c) in chars.by_ref() {
                        if c == ']' {
                            closed = true;
                            break;
                        }
                        inner.push(c);
                    }
                    if !closed {
                        return UnterminatedBracketSnafu { path }.fail();
                    }

                    if let Some(quoted) = strip_quotes(&inner) {
                        segments.push(PathSegment::Field(quoted.to_owned()));
                    } else {
                        let index = inner.parse().map_err(|_| Error::InvalidIndex {
                            path: path.to_owned(),
                            index: inner.clone(),
                        })?;
                        segments.push(PathSegment::Index(index));
                    }
                }
                ']' => {
                    return UnexpectedCharacterSnafu {
                        path,
                        offset,
                        found: c,
                    }
                    .fail();
                }
                _ => field.push(c),
            }
        }
        flush(&mut field, &mut segments);

        if segments.is_empty() {
            return EmptySnafu.fail();
        }

        Ok(Self { segments })
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "$")?;
        for segment in &self.segments {
            match segment {
                PathSegment::Field(field) => write!(f, ".{field}")?,
                PathSegment::Index(index) => write!(f, "[{index}]")?,
            }
        }
        Ok(())
    }
}

fn strip_quotes(inner: &str) -> Option<&str> {
    inner
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .or_else(|| inner.strip_prefix('"').and_then(|s| s.strip_suffix('"')))
}

/// Reads a field path out of a dynamic object.
pub fn lookup(object: &DynamicObject, path: &FieldPath) -> Option<Value> {
    let root = serde_json::to_value(object).ok()?;
    path.lookup(&root).cloned()
}

/// Writes a field path into a dynamic object through a serialize round-trip.
///
/// Returns `false` when the path does not resolve to a writable location.
pub fn set(object: &mut DynamicObject, path: &FieldPath, new: Value) -> bool {
    let Ok(mut root) = serde_json::to_value(&*object) else {
        return false;
    };
    if !path.set(&mut root, new) {
        return false;
    }
    match serde_json::from_value(root) {
        Ok(updated) => {
            *object = updated;
            true
        }
        Err(_) => false,
    }
}

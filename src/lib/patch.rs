//! RFC 6902 JSON Patch over `serde_json::Value` trees.
//!
//! Operations are applied to a private copy of the document and the copy is
//! only handed back once every operation succeeded, so a failing batch never
//! leaves a partial mutation behind. Each applied operation is returned with
//! the value it displaced (`oldValue`), which is what [`invert`] uses to build
//! an undo patch.

use std::{fmt, mem, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchOp {
    Add,
    Remove,
    Replace,
    Move,
    Copy,
    Test,
}

impl PatchOp {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Remove => "remove",
            Self::Replace => "replace",
            Self::Move => "move",
            Self::Copy => "copy",
            Self::Test => "test",
        }
    }
}

impl fmt::Display for PatchOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PatchOp {
    type Err = PatchErrorKind;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "add" => Ok(Self::Add),
            "remove" => Ok(Self::Remove),
            "replace" => Ok(Self::Replace),
            "move" => Ok(Self::Move),
            "copy" => Ok(Self::Copy),
            "test" => Ok(Self::Test),
            other => Err(PatchErrorKind::UnknownOp(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchOperation {
    pub op: PatchOp,
    pub path: String,
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    /// Filled in by [`apply_patch`]; callers never supply it.
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub old_value: Option<Value>,
}

impl PatchOperation {
    fn new(op: PatchOp, path: impl Into<String>) -> Self {
        Self {
            op,
            path: path.into(),
            value: None,
            from: None,
            old_value: None,
        }
    }

    pub fn add(path: impl Into<String>, value: Value) -> Self {
        Self {
            value: Some(value),
            ..Self::new(PatchOp::Add, path)
        }
    }

    pub fn remove(path: impl Into<String>) -> Self {
        Self::new(PatchOp::Remove, path)
    }

    pub fn replace(path: impl Into<String>, value: Value) -> Self {
        Self {
            value: Some(value),
            ..Self::new(PatchOp::Replace, path)
        }
    }

    pub fn move_from(from: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            from: Some(from.into()),
            ..Self::new(PatchOp::Move, path)
        }
    }

    pub fn copy_from(from: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            from: Some(from.into()),
            ..Self::new(PatchOp::Copy, path)
        }
    }

    pub fn test(path: impl Into<String>, value: Value) -> Self {
        Self {
            value: Some(value),
            ..Self::new(PatchOp::Test, path)
        }
    }
}

/// Keeps an explicit `null` distinct from an absent member.
fn present<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("patch operation #{index} failed at '{path}': {kind}")]
pub struct PatchError {
    pub index: usize,
    pub path: String,
    pub kind: PatchErrorKind,
}

impl PatchError {
    pub fn new(index: usize, path: impl Into<String>, kind: PatchErrorKind) -> Self {
        Self {
            index,
            path: path.into(),
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatchErrorKind {
    #[error("unknown operation '{0}'")]
    UnknownOp(String),
    #[error("malformed JSON pointer: {0}")]
    InvalidPointer(String),
    #[error("path does not exist")]
    PathNotFound,
    #[error("array index {index} is out of bounds for length {len}")]
    IndexOutOfBounds { index: usize, len: usize },
    #[error("'{0}' is not a valid array index")]
    InvalidIndex(String),
    #[error("test failed: value at path does not match")]
    TestFailed,
    #[error("operation is missing its '{0}' member")]
    MissingMember(&'static str),
    #[error("target parent is neither an object nor an array")]
    NotAContainer,
    #[error("cannot move a value into one of its own children")]
    MoveIntoDescendant,
    #[error("the document root cannot be removed")]
    RootRemoval,
    #[error("malformed operation: {0}")]
    Malformed(String),
    #[error("patched document does not fit the aggregate: {0}")]
    Materialize(String),
    #[error("'{0}' cannot be changed by a patch")]
    ImmutableField(String),
}

/// Parses a raw JSON array of operations, reporting unknown `op` names and
/// missing members as [`PatchError`]s rather than serde errors.
pub fn parse_operations(raw: &Value) -> Result<Vec<PatchOperation>, PatchError> {
    let entries = raw.as_array().ok_or_else(|| {
        PatchError::new(
            0,
            "",
            PatchErrorKind::Malformed("patch must be a JSON array".into()),
        )
    })?;

    entries
        .iter()
        .enumerate()
        .map(|(index, entry)| {
            let object = entry.as_object().ok_or_else(|| {
                PatchError::new(
                    index,
                    "",
                    PatchErrorKind::Malformed("operation must be a JSON object".into()),
                )
            })?;
            let path = object
                .get("path")
                .and_then(Value::as_str)
                .ok_or_else(|| PatchError::new(index, "", PatchErrorKind::MissingMember("path")))?
                .to_string();
            let op_name = object
                .get("op")
                .and_then(Value::as_str)
                .ok_or_else(|| PatchError::new(index, &path, PatchErrorKind::MissingMember("op")))?;
            let op = op_name
                .parse::<PatchOp>()
                .map_err(|kind| PatchError::new(index, &path, kind))?;
            let from = match object.get("from") {
                Some(Value::String(from)) => Some(from.clone()),
                Some(_) => {
                    return Err(PatchError::new(
                        index,
                        &path,
                        PatchErrorKind::Malformed("'from' must be a string".into()),
                    ));
                }
                None => None,
            };

            Ok(PatchOperation {
                op,
                path,
                value: object.get("value").cloned(),
                from,
                old_value: None,
            })
        })
        .collect()
}

/// Applies `operations` to a copy of `document`. On success returns the new
/// document and the operations annotated with the values they displaced.
pub fn apply_patch(
    document: &Value,
    operations: &[PatchOperation],
) -> Result<(Value, Vec<PatchOperation>), PatchError> {
    let mut working = document.clone();
    let mut applied = Vec::with_capacity(operations.len());

    for (index, operation) in operations.iter().enumerate() {
        let effect = apply_one(&mut working, operation)
            .map_err(|kind| PatchError::new(index, &operation.path, kind))?;
        let mut recorded = operation.clone();
        recorded.old_value = effect.displaced;
        // `-` names a different slot once the array grows; keep the one used.
        if let Some(slot) = effect.appended_at {
            let parent = operation.path.strip_suffix('-').unwrap_or(operation.path.as_str());
            recorded.path = format!("{parent}{slot}");
        }
        applied.push(recorded);
    }

    Ok((working, applied))
}

/// Round-trips a typed aggregate through the generic tree, applies the patch
/// and materializes the result back into the aggregate type.
pub fn apply_to<T>(aggregate: &T, operations: &[PatchOperation]) -> Result<(T, Vec<PatchOperation>), PatchError>
where
    T: Serialize + DeserializeOwned,
{
    let document = serde_json::to_value(aggregate)
        .map_err(|err| PatchError::new(0, "", PatchErrorKind::Materialize(err.to_string())))?;
    let (patched, applied) = apply_patch(&document, operations)?;
    let materialized = serde_json::from_value(patched).map_err(|err| {
        PatchError::new(
            operations.len().saturating_sub(1),
            "",
            PatchErrorKind::Materialize(err.to_string()),
        )
    })?;
    Ok((materialized, applied))
}

/// Builds the patch that undoes `applied` (operations as returned by
/// [`apply_patch`]). The result is in reverse order.
pub fn invert(applied: &[PatchOperation]) -> Vec<PatchOperation> {
    applied
        .iter()
        .rev()
        .filter_map(|operation| match operation.op {
            PatchOp::Add => Some(match &operation.old_value {
                Some(previous) => PatchOperation::replace(&operation.path, previous.clone()),
                None => PatchOperation::remove(&operation.path),
            }),
            PatchOp::Remove => operation
                .old_value
                .clone()
                .map(|previous| PatchOperation::add(&operation.path, previous)),
            PatchOp::Replace => operation
                .old_value
                .clone()
                .map(|previous| PatchOperation::replace(&operation.path, previous)),
            PatchOp::Move => operation
                .from
                .as_ref()
                .map(|from| PatchOperation::move_from(&operation.path, from)),
            PatchOp::Copy => Some(PatchOperation::remove(&operation.path)),
            PatchOp::Test => None,
        })
        .collect()
}

/// What one operation did to the document.
#[derive(Default)]
struct Effect {
    /// The value the operation replaced or removed.
    displaced: Option<Value>,
    /// Index an `-` token resolved to.
    appended_at: Option<usize>,
}

impl Effect {
    fn displaced(value: Value) -> Self {
        Self {
            displaced: Some(value),
            appended_at: None,
        }
    }
}

fn apply_one(document: &mut Value, operation: &PatchOperation) -> Result<Effect, PatchErrorKind> {
    let path = parse_pointer(&operation.path)?;
    match operation.op {
        PatchOp::Add => {
            let value = required_value(operation)?;
            add(document, &path, value)
        }
        PatchOp::Remove => remove(document, &path).map(Effect::displaced),
        PatchOp::Replace => {
            let value = required_value(operation)?;
            let target = resolve_mut(document, &path)?;
            Ok(Effect::displaced(mem::replace(target, value)))
        }
        PatchOp::Move => {
            let from = parse_pointer(required_from(operation)?)?;
            if from == path {
                resolve(document, &from)?;
                return Ok(Effect::default());
            }
            if path.len() > from.len() && path.starts_with(&from) {
                return Err(PatchErrorKind::MoveIntoDescendant);
            }
            let moved = remove(document, &from)?;
            let placed = add(document, &path, moved.clone())?;
            Ok(Effect {
                displaced: Some(moved),
                appended_at: placed.appended_at,
            })
        }
        PatchOp::Copy => {
            let from = parse_pointer(required_from(operation)?)?;
            let copied = resolve(document, &from)?.clone();
            let placed = add(document, &path, copied)?;
            Ok(Effect {
                displaced: None,
                appended_at: placed.appended_at,
            })
        }
        PatchOp::Test => {
            let expected = operation
                .value
                .as_ref()
                .ok_or(PatchErrorKind::MissingMember("value"))?;
            if resolve(document, &path)? == expected {
                Ok(Effect::default())
            } else {
                Err(PatchErrorKind::TestFailed)
            }
        }
    }
}

fn required_value(operation: &PatchOperation) -> Result<Value, PatchErrorKind> {
    operation
        .value
        .clone()
        .ok_or(PatchErrorKind::MissingMember("value"))
}

fn required_from(operation: &PatchOperation) -> Result<&str, PatchErrorKind> {
    operation
        .from
        .as_deref()
        .ok_or(PatchErrorKind::MissingMember("from"))
}

/// Splits a JSON Pointer into unescaped reference tokens. `""` is the root.
pub fn parse_pointer(pointer: &str) -> Result<Vec<String>, PatchErrorKind> {
    if pointer.is_empty() {
        return Ok(Vec::new());
    }
    let Some(rest) = pointer.strip_prefix('/') else {
        return Err(PatchErrorKind::InvalidPointer(format!(
            "'{pointer}' must start with '/'"
        )));
    };
    rest.split('/').map(unescape_token).collect()
}

fn unescape_token(token: &str) -> Result<String, PatchErrorKind> {
    let mut result = String::with_capacity(token.len());
    let mut chars = token.chars();
    while let Some(ch) = chars.next() {
        if ch != '~' {
            result.push(ch);
            continue;
        }
        match chars.next() {
            Some('0') => result.push('~'),
            Some('1') => result.push('/'),
            _ => {
                return Err(PatchErrorKind::InvalidPointer(format!(
                    "invalid escape in token '{token}'"
                )));
            }
        }
    }
    Ok(result)
}

/// Exact key first, then the first case-insensitive match.
fn object_key(map: &Map<String, Value>, token: &str) -> Option<String> {
    if map.contains_key(token) {
        return Some(token.to_string());
    }
    let folded = token.to_lowercase();
    map.keys()
        .find(|key| key.eq_ignore_ascii_case(token) || key.to_lowercase() == folded)
        .cloned()
}

fn array_index(token: &str) -> Result<usize, PatchErrorKind> {
    let well_formed = !token.is_empty()
        && token.bytes().all(|b| b.is_ascii_digit())
        && (token == "0" || !token.starts_with('0'));
    if !well_formed {
        return Err(PatchErrorKind::InvalidIndex(token.to_string()));
    }
    token
        .parse()
        .map_err(|_| PatchErrorKind::InvalidIndex(token.to_string()))
}

fn resolve<'a>(document: &'a Value, path: &[String]) -> Result<&'a Value, PatchErrorKind> {
    let mut current = document;
    for token in path {
        current = match current {
            Value::Object(map) => {
                let key = object_key(map, token).ok_or(PatchErrorKind::PathNotFound)?;
                &map[&key]
            }
            Value::Array(items) => {
                let index = array_index(token)?;
                items.get(index).ok_or(PatchErrorKind::IndexOutOfBounds {
                    index,
                    len: items.len(),
                })?
            }
            _ => return Err(PatchErrorKind::PathNotFound),
        };
    }
    Ok(current)
}

fn resolve_mut<'a>(document: &'a mut Value, path: &[String]) -> Result<&'a mut Value, PatchErrorKind> {
    let mut current = document;
    for token in path {
        current = match current {
            Value::Object(map) => {
                let key = object_key(map, token).ok_or(PatchErrorKind::PathNotFound)?;
                map.get_mut(&key).ok_or(PatchErrorKind::PathNotFound)?
            }
            Value::Array(items) => {
                let index = array_index(token)?;
                let len = items.len();
                items
                    .get_mut(index)
                    .ok_or(PatchErrorKind::IndexOutOfBounds { index, len })?
            }
            _ => return Err(PatchErrorKind::PathNotFound),
        };
    }
    Ok(current)
}

fn add(document: &mut Value, path: &[String], value: Value) -> Result<Effect, PatchErrorKind> {
    let Some((last, parent_path)) = path.split_last() else {
        return Ok(Effect::displaced(mem::replace(document, value)));
    };
    match resolve_mut(document, parent_path)? {
        Value::Object(map) => {
            let key = object_key(map, last).unwrap_or_else(|| last.clone());
            Ok(Effect {
                displaced: map.insert(key, value),
                appended_at: None,
            })
        }
        Value::Array(items) => {
            if last == "-" {
                items.push(value);
                return Ok(Effect {
                    displaced: None,
                    appended_at: Some(items.len() - 1),
                });
            }
            let index = array_index(last)?;
            if index > items.len() {
                return Err(PatchErrorKind::IndexOutOfBounds {
                    index,
                    len: items.len(),
                });
            }
            items.insert(index, value);
            Ok(Effect::default())
        }
        _ => Err(PatchErrorKind::NotAContainer),
    }
}

fn remove(document: &mut Value, path: &[String]) -> Result<Value, PatchErrorKind> {
    let Some((last, parent_path)) = path.split_last() else {
        return Err(PatchErrorKind::RootRemoval);
    };
    match resolve_mut(document, parent_path)? {
        Value::Object(map) => {
            let key = object_key(map, last).ok_or(PatchErrorKind::PathNotFound)?;
            map.remove(&key).ok_or(PatchErrorKind::PathNotFound)
        }
        Value::Array(items) => {
            let index = array_index(last)?;
            if index >= items.len() {
                return Err(PatchErrorKind::IndexOutOfBounds {
                    index,
                    len: items.len(),
                });
            }
            Ok(items.remove(index))
        }
        _ => Err(PatchErrorKind::PathNotFound),
    }
}

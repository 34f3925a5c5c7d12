//! JSON-patch engine used to apply server-confirmed session changes
//!
//! The channel actor only depends on the [`PatchApplier`] trait; [`JsonPatch`]
//! is the default RFC 6902 implementation over `serde_json::Value`.

use serde_json::Value;
use studyrun_protocol::PatchOp;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum PatchError {
    #[error("invalid JSON pointer: {0}")]
    InvalidPointer(String),

    #[error("path not found: {0}")]
    PathNotFound(String),

    #[error("invalid array index in {0}")]
    InvalidIndex(String),

    #[error("test failed at {0}")]
    TestFailed(String),

    #[error("cannot move {from} into its own child {path}")]
    MoveIntoChild { from: String, path: String },
}

/// Applies a list of patch operations to a document.
///
/// Application is all-or-nothing: on error the input is left untouched.
pub trait PatchApplier: Send + Sync + 'static {
    fn apply(&self, doc: &Value, ops: &[PatchOp]) -> Result<Value, PatchError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonPatch;

impl PatchApplier for JsonPatch {
    fn apply(&self, doc: &Value, ops: &[PatchOp]) -> Result<Value, PatchError> {
        let mut out = doc.clone();
        for op in ops {
            apply_one(&mut out, op)?;
        }
        Ok(out)
    }
}

fn apply_one(doc: &mut Value, op: &PatchOp) -> Result<(), PatchError> {
    match op {
        PatchOp::Add { path, value } => add(doc, path, value.clone()),
        PatchOp::Remove { path } => remove(doc, path).map(drop),
        PatchOp::Replace { path, value } => {
            let target = doc
                .pointer_mut(checked(path)?)
                .ok_or_else(|| PatchError::PathNotFound(path.clone()))?;
            *target = value.clone();
            Ok(())
        }
        PatchOp::Copy { from, path } => {
            let value = find(doc, from)
                .cloned()
                .ok_or_else(|| PatchError::PathNotFound(from.clone()))?;
            add(doc, path, value)
        }
        PatchOp::Move { from, path } => {
            if from == path {
                return Ok(());
            }
            if path.starts_with(&format!("{from}/")) {
                return Err(PatchError::MoveIntoChild {
                    from: from.clone(),
                    path: path.clone(),
                });
            }
            let value = remove(doc, from)?;
            add(doc, path, value)
        }
        PatchOp::Test { path, value } => match find(doc, path) {
            Some(actual) if actual == value => Ok(()),
            _ => Err(PatchError::TestFailed(path.clone())),
        },
    }
}

/// Read the value at `pointer`; `""` addresses the whole document.
pub fn find<'a>(doc: &'a Value, pointer: &str) -> Option<&'a Value> {
    if !pointer.is_empty() && !pointer.starts_with('/') {
        return None;
    }
    doc.pointer(pointer)
}

fn checked(pointer: &str) -> Result<&str, PatchError> {
    if pointer.is_empty() || pointer.starts_with('/') {
        Ok(pointer)
    } else {
        Err(PatchError::InvalidPointer(pointer.to_string()))
    }
}

fn unescape(token: &str) -> String {
    token.replace("~1", "/").replace("~0", "~")
}

/// Split a pointer into its parent pointer and the unescaped last token.
fn split(pointer: &str) -> Result<(&str, String), PatchError> {
    let pointer = checked(pointer)?;
    match pointer.rfind('/') {
        Some(idx) => Ok((&pointer[..idx], unescape(&pointer[idx + 1..]))),
        None => Err(PatchError::InvalidPointer(pointer.to_string())),
    }
}

fn array_index(token: &str, len: usize, path: &str) -> Result<usize, PatchError> {
    let valid = !token.is_empty()
        && token.bytes().all(|b| b.is_ascii_digit())
        && (token == "0" || !token.starts_with('0'));
    let index: usize = if valid {
        token
            .parse()
            .map_err(|_| PatchError::InvalidIndex(path.to_string()))?
    } else {
        return Err(PatchError::InvalidIndex(path.to_string()));
    };
    if index > len {
        return Err(PatchError::InvalidIndex(path.to_string()));
    }
    Ok(index)
}

fn add(doc: &mut Value, path: &str, value: Value) -> Result<(), PatchError> {
    if path.is_empty() {
        *doc = value;
        return Ok(());
    }
    let (parent, token) = split(path)?;
    let target = doc
        .pointer_mut(parent)
        .ok_or_else(|| PatchError::PathNotFound(path.to_string()))?;
    match target {
        Value::Object(map) => {
            map.insert(token, value);
            Ok(())
        }
        Value::Array(items) => {
            if token == "-" {
                items.push(value);
            } else {
                let index = array_index(&token, items.len(), path)?;
                items.insert(index, value);
            }
            Ok(())
        }
        _ => Err(PatchError::PathNotFound(path.to_string())),
    }
}

fn remove(doc: &mut Value, path: &str) -> Result<Value, PatchError> {
    if path.is_empty() {
        return Ok(std::mem::replace(doc, Value::Object(Default::default())));
    }
    let (parent, token) = split(path)?;
    let target = doc
        .pointer_mut(parent)
        .ok_or_else(|| PatchError::PathNotFound(path.to_string()))?;
    match target {
        Value::Object(map) => map
            .remove(&token)
            .ok_or_else(|| PatchError::PathNotFound(path.to_string())),
        Value::Array(items) => {
            let index = array_index(&token, items.len(), path)?;
            if index == items.len() {
                return Err(PatchError::InvalidIndex(path.to_string()));
            }
            Ok(items.remove(index))
        }
        _ => Err(PatchError::PathNotFound(path.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn op(value: Value) -> PatchOp {
        serde_json::from_value(value).expect("valid patch op")
    }

    #[test]
    fn applies_a_sequence_of_operations() {
        let doc = json!({"a": 1, "list": [1, 2]});
        let ops = vec![
            op(json!({"op": "add", "path": "/b", "value": {"c": true}})),
            op(json!({"op": "add", "path": "/list/-", "value": 3})),
            op(json!({"op": "add", "path": "/list/0", "value": 0})),
            op(json!({"op": "replace", "path": "/a", "value": "one"})),
            op(json!({"op": "copy", "from": "/b", "path": "/b2"})),
            op(json!({"op": "move", "from": "/b2/c", "path": "/moved"})),
            op(json!({"op": "remove", "path": "/list/1"})),
            op(json!({"op": "test", "path": "/moved", "value": true})),
        ];

        let out = JsonPatch.apply(&doc, &ops).expect("patch applies");
        assert_eq!(
            out,
            json!({
                "a": "one",
                "b": {"c": true},
                "b2": {},
                "moved": true,
                "list": [0, 2, 3]
            })
        );
    }

    #[test]
    fn failure_leaves_input_untouched() {
        let doc = json!({"a": 1});
        let ops = vec![
            op(json!({"op": "add", "path": "/b", "value": 2})),
            op(json!({"op": "remove", "path": "/missing"})),
        ];
        assert_eq!(
            JsonPatch.apply(&doc, &ops),
            Err(PatchError::PathNotFound("/missing".to_string()))
        );
        assert_eq!(doc, json!({"a": 1}));
    }

    #[test]
    fn escaped_keys_round_trip_through_pointers() {
        let doc = json!({});
        let out = JsonPatch
            .apply(
                &doc,
                &[op(json!({"op": "add", "path": "/a~1b~0c", "value": 1}))],
            )
            .expect("add escaped key");
        assert_eq!(out, json!({"a/b~c": 1}));
        assert_eq!(find(&out, "/a~1b~0c"), Some(&json!(1)));
    }

    #[test]
    fn rejects_bad_array_indices_and_pointers() {
        let doc = json!({"list": [1]});
        assert!(matches!(
            JsonPatch.apply(&doc, &[op(json!({"op": "add", "path": "/list/01", "value": 1}))]),
            Err(PatchError::InvalidIndex(_))
        ));
        assert!(matches!(
            JsonPatch.apply(&doc, &[op(json!({"op": "remove", "path": "/list/1"}))]),
            Err(PatchError::InvalidIndex(_))
        ));
        assert!(matches!(
            JsonPatch.apply(&doc, &[op(json!({"op": "add", "path": "list", "value": 1}))]),
            Err(PatchError::InvalidPointer(_))
        ));
        assert!(matches!(
            JsonPatch.apply(&doc, &[op(json!({"op": "move", "from": "/list", "path": "/list/0"}))]),
            Err(PatchError::MoveIntoChild { .. })
        ));
    }

    #[test]
    fn whole_document_replace() {
        let out = JsonPatch
            .apply(
                &json!({"old": 1}),
                &[op(json!({"op": "replace", "path": "", "value": {"new": 2}}))],
            )
            .expect("root replace");
        assert_eq!(out, json!({"new": 2}));
    }
}

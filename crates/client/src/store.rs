//! Shared session data store
//!
//! The replica is written only by the owning channel actor and only with
//! server-confirmed data. Readers get lock-free snapshots through
//! [`SessionView`]; every accessor returns a deep copy.

use std::sync::Arc;

use arc_swap::ArcSwap;
use serde_json::{Map, Value};
use studyrun_protocol::{pointer_segment, PatchOp};

use crate::channel::ChannelHandle;
use crate::error::{StudyError, StudyResult};
use crate::patch::{self, PatchApplier, PatchError};

fn empty() -> Value {
    Value::Object(Map::new())
}

/// Immutable copy of a replica at one version
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub data: Value,
    pub version: Option<u64>,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            data: empty(),
            version: None,
        }
    }
}

/// Write side of a batch or group session replica
#[derive(Debug, Clone, PartialEq)]
pub struct SessionReplica {
    data: Value,
    version: Option<u64>,
}

impl Default for SessionReplica {
    fn default() -> Self {
        Self {
            data: empty(),
            version: None,
        }
    }
}

impl SessionReplica {
    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn version(&self) -> Option<u64> {
        self.version
    }

    pub fn set_version(&mut self, version: u64) {
        self.version = Some(version);
    }

    /// Replace the whole replica with a server snapshot; `null` means empty.
    pub fn replace(&mut self, data: Value) {
        self.data = if data.is_null() { empty() } else { data };
    }

    pub fn clear(&mut self) {
        self.data = empty();
        self.version = None;
    }

    /// Apply server patches one by one. A root `remove` discards the replica
    /// instead of being patched. On error the replica keeps the state before
    /// the failing operation.
    pub fn apply(&mut self, applier: &dyn PatchApplier, ops: &[PatchOp]) -> Result<(), PatchError> {
        for op in ops {
            if op.is_root_remove() {
                self.data = empty();
                continue;
            }
            self.data = applier.apply(&self.data, std::slice::from_ref(op))?;
        }
        Ok(())
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            data: self.data.clone(),
            version: self.version,
        }
    }
}

/// Lock-free read side of a replica (cheap to Clone)
#[derive(Clone, Default)]
pub struct SessionView {
    snapshot: Arc<ArcSwap<SessionSnapshot>>,
}

impl SessionView {
    pub(crate) fn publish(&self, snapshot: SessionSnapshot) {
        self.snapshot.store(Arc::new(snapshot));
    }

    pub fn snapshot(&self) -> Arc<SessionSnapshot> {
        self.snapshot.load_full()
    }

    pub fn version(&self) -> Option<u64> {
        self.snapshot.load().version
    }

    /// Top-level field by name
    pub fn get(&self, name: &str) -> Option<Value> {
        self.snapshot.load().data.get(name).cloned()
    }

    pub fn get_all(&self) -> Value {
        self.snapshot.load().data.clone()
    }

    pub fn find(&self, pointer: &str) -> Option<Value> {
        patch::find(&self.snapshot.load().data, pointer).cloned()
    }

    pub fn test(&self, pointer: &str, value: &Value) -> bool {
        patch::find(&self.snapshot.load().data, pointer) == Some(value)
    }

    pub fn defined(&self, pointer: &str) -> bool {
        patch::find(&self.snapshot.load().data, pointer).is_some()
    }
}

fn pointer(path: &str) -> StudyResult<String> {
    if path.starts_with('/') {
        Ok(path.to_string())
    } else {
        Err(StudyError::InvalidPatch(format!(
            "path must be a JSON pointer starting with '/': {path}"
        )))
    }
}

/// Batch or group session data: synchronous reads of the local replica,
/// asynchronous mutations confirmed by the server.
#[derive(Clone)]
pub struct SharedSession {
    channel: ChannelHandle,
}

impl SharedSession {
    pub fn new(channel: ChannelHandle) -> Self {
        Self { channel }
    }

    pub fn view(&self) -> &SessionView {
        self.channel.view()
    }

    pub fn version(&self) -> Option<u64> {
        self.view().version()
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.view().get(name)
    }

    pub fn get_all(&self) -> Value {
        self.view().get_all()
    }

    pub fn find(&self, pointer: &str) -> Option<Value> {
        self.view().find(pointer)
    }

    pub fn test(&self, pointer: &str, value: &Value) -> bool {
        self.view().test(pointer, value)
    }

    pub fn defined(&self, pointer: &str) -> bool {
        self.view().defined(pointer)
    }

    /// Submit several operations as one action
    pub async fn patch(&self, ops: Vec<PatchOp>) -> StudyResult<()> {
        self.channel.submit_patches(ops).await
    }

    pub async fn add(&self, path: &str, value: Value) -> StudyResult<()> {
        let path = pointer(path)?;
        self.patch(vec![PatchOp::Add { path, value }]).await
    }

    /// Set a top-level field
    pub async fn set(&self, name: &str, value: Value) -> StudyResult<()> {
        let path = format!("/{}", pointer_segment(name));
        self.patch(vec![PatchOp::Add { path, value }]).await
    }

    /// Replace the whole session data
    pub async fn set_all(&self, value: Value) -> StudyResult<()> {
        if !value.is_object() {
            return Err(StudyError::InvalidPatch(
                "session data must be a JSON object".to_string(),
            ));
        }
        self.patch(vec![PatchOp::Replace {
            path: String::new(),
            value,
        }])
        .await
    }

    pub async fn remove(&self, path: &str) -> StudyResult<()> {
        let path = pointer(path)?;
        self.patch(vec![PatchOp::Remove { path }]).await
    }

    /// Remove everything; receivers discard their whole replica.
    pub async fn clear(&self) -> StudyResult<()> {
        self.patch(vec![PatchOp::Remove {
            path: "/".to_string(),
        }])
        .await
    }

    pub async fn replace(&self, path: &str, value: Value) -> StudyResult<()> {
        let path = pointer(path)?;
        self.patch(vec![PatchOp::Replace { path, value }]).await
    }

    pub async fn copy(&self, from: &str, path: &str) -> StudyResult<()> {
        let from = pointer(from)?;
        let path = pointer(path)?;
        self.patch(vec![PatchOp::Copy { from, path }]).await
    }

    pub async fn move_to(&self, from: &str, path: &str) -> StudyResult<()> {
        let from = pointer(from)?;
        let path = pointer(path)?;
        self.patch(vec![PatchOp::Move { from, path }]).await
    }
}

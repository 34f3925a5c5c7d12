//! Core types shared across the protocol

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Which of the two duplex channels a frame belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Batch,
    Group,
}

impl ChannelKind {
    /// Path of the channel endpoint, relative to the run base URL
    pub fn endpoint(self) -> &'static str {
        match self {
            ChannelKind::Batch => "batch/open",
            ChannelKind::Group => "group/join",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChannelKind::Batch => "batch",
            ChannelKind::Group => "group",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One RFC 6902 JSON-patch operation, addressed by JSON pointer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOp {
    Add { path: String, value: Value },
    Remove { path: String },
    Replace { path: String, value: Value },
    Copy { from: String, path: String },
    Move { from: String, path: String },
    Test { path: String, value: Value },
}

impl PatchOp {
    pub fn path(&self) -> &str {
        match self {
            PatchOp::Add { path, .. }
            | PatchOp::Remove { path }
            | PatchOp::Replace { path, .. }
            | PatchOp::Copy { path, .. }
            | PatchOp::Move { path, .. }
            | PatchOp::Test { path, .. } => path,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PatchOp::Add { .. } => "add",
            PatchOp::Remove { .. } => "remove",
            PatchOp::Replace { .. } => "replace",
            PatchOp::Copy { .. } => "copy",
            PatchOp::Move { .. } => "move",
            PatchOp::Test { .. } => "test",
        }
    }

    /// A `remove` of the whole document. The receiver discards its replica
    /// instead of patching.
    pub fn is_root_remove(&self) -> bool {
        matches!(self, PatchOp::Remove { path } if path.is_empty() || path == "/")
    }
}

/// Escape a single key so it can be used as a JSON-pointer segment.
pub fn pointer_segment(key: &str) -> String {
    key.replace('~', "~0").replace('/', "~1")
}

/// Group member identifier. The server sends these as numbers or strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "RawMemberId", into = "String")]
pub struct MemberId(String);

impl MemberId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<MemberId> for String {
    fn from(id: MemberId) -> Self {
        id.0
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawMemberId {
    Text(String),
    Number(u64),
}

impl From<RawMemberId> for MemberId {
    fn from(raw: RawMemberId) -> Self {
        match raw {
            RawMemberId::Text(s) => MemberId(s),
            RawMemberId::Number(n) => MemberId(n.to_string()),
        }
    }
}

/// Whether a group still accepts new members
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GroupState {
    Started,
    Fixed,
    Finished,
}

/// Study properties as returned by `initData`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StudyProperties {
    pub id: u64,
    pub uuid: String,
    pub title: String,
    pub description: Option<String>,
    pub study_input: Value,
}

/// Batch properties as returned by `initData`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BatchProperties {
    pub id: u64,
    pub title: String,
    pub max_active_members: Option<u32>,
    pub max_total_members: Option<u32>,
    pub max_total_workers: Option<u32>,
    pub batch_input: Value,
}

/// Properties of the component currently running
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ComponentProperties {
    pub id: u64,
    pub uuid: String,
    pub title: String,
    pub position: usize,
    pub reloadable: bool,
    pub component_input: Value,
}

/// One entry of the study's ordered component list
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ComponentSummary {
    pub id: u64,
    pub uuid: String,
    pub title: String,
    pub position: usize,
    pub active: bool,
    pub reloadable: bool,
}

/// Response of the `initData` endpoint
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InitData {
    pub study_result_id: Option<u64>,
    pub component_result_id: Option<u64>,
    /// Study session data, serialized as a JSON string by the server
    pub study_session_data: Option<String>,
    pub study_properties: StudyProperties,
    pub batch_properties: BatchProperties,
    pub component_list: Vec<ComponentSummary>,
    pub component_properties: ComponentProperties,
}

impl InitData {
    /// Parse the embedded study session data; empty or invalid input yields `{}`.
    pub fn parsed_study_session_data(&self) -> Value {
        self.study_session_data
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .and_then(|s| serde_json::from_str::<Value>(s).ok())
            .filter(Value::is_object)
            .unwrap_or_else(|| Value::Object(Default::default()))
    }
}

//! Server → Client channel frames
//!
//! A frame is a union of independently optional fields. The batch channel
//! names its session fields `patches`, `data`, `version` and `id`; the group
//! channel uses `sessionPatches`, `sessionData`, `sessionVersion` and
//! `sessionActionId`. Both spellings parse into the same struct.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::types::{GroupState, MemberId, PatchOp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Heartbeat {
    Ping,
    Pong,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelAction {
    Session,
    SessionAck,
    SessionFail,
    Fixed,
    Error,
    Opened,
    Closed,
    Joined,
    Left,
    /// Any action this client does not know
    #[serde(other)]
    Unknown,
}

/// Frame received on a batch or group channel
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundFrame {
    #[serde(default)]
    pub heartbeat: Option<Heartbeat>,
    #[serde(default, alias = "sessionPatches")]
    pub patches: Option<Vec<PatchOp>>,
    /// Full session snapshot. `Some(Value::Null)` when the server sent an
    /// explicit `null`, `None` when the field was absent.
    #[serde(default, alias = "sessionData", deserialize_with = "present")]
    pub data: Option<Value>,
    #[serde(default, alias = "sessionVersion")]
    pub version: Option<u64>,
    #[serde(default)]
    pub action: Option<ChannelAction>,
    #[serde(default, alias = "sessionActionId")]
    pub id: Option<u64>,
    #[serde(default)]
    pub member_id: Option<MemberId>,
    #[serde(default, alias = "groupResultId")]
    pub group_id: Option<u64>,
    #[serde(default)]
    pub group_state: Option<GroupState>,
    #[serde(default)]
    pub members: Option<Vec<MemberId>>,
    #[serde(default)]
    pub channels: Option<Vec<MemberId>>,
    #[serde(default)]
    pub error_msg: Option<String>,
    #[serde(default, deserialize_with = "present")]
    pub msg: Option<Value>,
    #[serde(default)]
    pub recipient: Option<MemberId>,
}

impl InboundFrame {
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    pub fn is_pong(&self) -> bool {
        self.heartbeat == Some(Heartbeat::Pong)
    }
}

fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

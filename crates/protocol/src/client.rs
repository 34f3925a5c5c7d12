//! Client → Server channel frames

use serde_json::{json, Map, Value};

use crate::types::{ChannelKind, MemberId, PatchOp};

/// Frames a client sends over a batch or group channel
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    /// Channel liveness ping, answered by `{"heartbeat":"pong"}`
    Ping,
    /// A session-data mutation awaiting `SESSION_ACK` / `SESSION_FAIL`
    Session {
        id: u64,
        patches: Vec<PatchOp>,
        version: Option<u64>,
        versioning: bool,
    },
    /// Ask the server to close the group to new members
    Fixed,
    /// Message to every other group member
    Broadcast { msg: Value },
    /// Message to a single group member
    Direct { recipient: MemberId, msg: Value },
}

impl OutboundFrame {
    /// Build the JSON value for this frame using the field names of `kind`.
    pub fn to_value(&self, kind: ChannelKind) -> Value {
        match self {
            OutboundFrame::Ping => json!({ "heartbeat": "ping" }),
            OutboundFrame::Session {
                id,
                patches,
                version,
                versioning,
            } => {
                let (id_key, patches_key, version_key) = match kind {
                    ChannelKind::Batch => ("id", "patches", "version"),
                    ChannelKind::Group => ("sessionActionId", "sessionPatches", "sessionVersion"),
                };
                let mut frame = Map::new();
                frame.insert("action".into(), json!("SESSION"));
                frame.insert(id_key.into(), json!(id));
                frame.insert(patches_key.into(), json!(patches));
                frame.insert(version_key.into(), json!(version));
                frame.insert("versioning".into(), json!(versioning));
                Value::Object(frame)
            }
            OutboundFrame::Fixed => json!({ "action": "FIXED" }),
            OutboundFrame::Broadcast { msg } => json!({ "msg": msg }),
            OutboundFrame::Direct { recipient, msg } => {
                json!({ "recipient": recipient, "msg": msg })
            }
        }
    }

    pub fn encode(&self, kind: ChannelKind) -> String {
        self.to_value(kind).to_string()
    }

    pub fn name(&self) -> &'static str {
        match self {
            OutboundFrame::Ping => "ping",
            OutboundFrame::Session { .. } => "session",
            OutboundFrame::Fixed => "fixed",
            OutboundFrame::Broadcast { .. } => "broadcast",
            OutboundFrame::Direct { .. } => "direct",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add_x() -> Vec<PatchOp> {
        vec![PatchOp::Add {
            path: "/x".to_string(),
            value: json!(5),
        }]
    }

    #[test]
    fn batch_session_frame_uses_short_field_names() {
        let frame = OutboundFrame::Session {
            id: 0,
            patches: add_x(),
            version: Some(3),
            versioning: true,
        };
        assert_eq!(
            frame.to_value(ChannelKind::Batch),
            json!({
                "action": "SESSION",
                "id": 0,
                "patches": [{"op": "add", "path": "/x", "value": 5}],
                "version": 3,
                "versioning": true
            })
        );
    }

    #[test]
    fn group_session_frame_uses_session_prefixed_names() {
        let frame = OutboundFrame::Session {
            id: 4,
            patches: add_x(),
            version: Some(8),
            versioning: false,
        };
        let value = frame.to_value(ChannelKind::Group);
        assert_eq!(value["sessionActionId"], 4);
        assert_eq!(value["sessionVersion"], 8);
        assert_eq!(value["sessionPatches"][0]["path"], "/x");
        assert_eq!(value["versioning"], false);
        assert!(value.get("id").is_none());
    }

    #[test]
    fn direct_message_names_its_recipient() {
        let frame = OutboundFrame::Direct {
            recipient: MemberId::new("12"),
            msg: json!("hi"),
        };
        assert_eq!(
            frame.to_value(ChannelKind::Group),
            json!({"recipient": "12", "msg": "hi"})
        );
        assert_eq!(OutboundFrame::Ping.encode(ChannelKind::Batch), r#"{"heartbeat":"ping"}"#);
    }
}

//! Duplex batch and group channels
//!
//! Each channel is an actor ([`ChannelHandle`]) driving the pure state
//! machine in [`transition`] over a [`transport::Transport`].

mod actor;
pub mod backoff;
pub mod transition;
pub mod transport;

use serde_json::Value;
use studyrun_protocol::{GroupState, MemberId};

pub use actor::ChannelHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Closed,
    Connecting,
    /// Socket is up, waiting for the first session version
    AwaitingVersion,
    Open,
}

/// A group leave or reassign request is in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupBusy {
    Leaving,
    Reassigning,
}

/// Membership of the joined group, replaced wholesale by server frames
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupMembership {
    pub member_id: Option<MemberId>,
    pub group_id: Option<u64>,
    pub group_state: Option<GroupState>,
    pub members: Vec<MemberId>,
    /// Members that currently hold an open group channel
    pub channels: Vec<MemberId>,
}

impl GroupMembership {
    pub fn is_joined(&self) -> bool {
        self.member_id.is_some()
    }

    pub fn has_channel(&self, member: &MemberId) -> bool {
        self.channels.contains(member)
    }

    pub fn is_fixed(&self) -> bool {
        self.group_state == Some(GroupState::Fixed)
    }

    /// Every member holds an open group channel.
    pub fn is_group_open(&self) -> bool {
        self.is_joined() && self.members.iter().all(|m| self.channels.contains(m))
    }

    pub fn is_max_active_member_reached(&self, max_active_members: Option<u32>) -> bool {
        max_active_members.is_some_and(|max| self.members.len() >= max as usize)
    }

    /// The group is full and every member has its channel open.
    pub fn is_max_active_member_open(&self, max_active_members: Option<u32>) -> bool {
        max_active_members.is_some_and(|max| self.channels.len() >= max as usize)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberChange {
    Opened,
    Closed,
    Joined,
    Left,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Opened,
    Closed,
    /// Liveness restored after a missed heartbeat
    Connected,
    /// A heartbeat went unanswered
    Disconnected,
    /// A server snapshot replaced the whole replica
    SessionReplaced,
    SessionChanged { op: String, path: String },
    Member {
        change: MemberChange,
        member_id: MemberId,
        is_self: bool,
    },
    /// Membership fields changed
    Update,
    Fixed,
    Message { msg: Value },
    Error { message: String },
    /// The server rejected the run; nothing may be sent any more
    RunInvalidated,
}

/// Lock-free status snapshot published after every transition
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelStatus {
    pub phase: Phase,
    pub disconnected: bool,
    pub versioning: bool,
    pub busy: Option<GroupBusy>,
    pub pending_actions: usize,
    pub membership: GroupMembership,
}

impl Default for ChannelStatus {
    fn default() -> Self {
        Self {
            phase: Phase::Closed,
            disconnected: false,
            versioning: true,
            busy: None,
            pending_actions: 0,
            membership: GroupMembership::default(),
        }
    }
}

//! Pure channel state machine
//!
//! Every channel decision lives here as a synchronous function:
//! `transition(state, input, applier) -> (state, effects)`. Timers, sockets
//! and reply plumbing are effects carried out by the actor.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::Value;
use studyrun_protocol::{ChannelAction, ChannelKind, InboundFrame, MemberId, OutboundFrame, PatchOp};

use super::backoff::Backoff;
use super::{ChannelEvent, GroupBusy, GroupMembership, MemberChange, Phase};
use crate::config::ChannelConfig;
use crate::error::StudyError;
use crate::patch::PatchApplier;
use crate::store::SessionReplica;

/// Close code the server uses when the study run no longer exists
pub const POLICY_VIOLATION: u16 = 1008;

// ---------------------------------------------------------------------------
// ChannelState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingAction {
    Session { versioned: bool },
    Fixed,
}

#[derive(Debug, Clone)]
pub struct ChannelState {
    pub kind: ChannelKind,
    pub phase: Phase,
    /// The channel should be kept open (drives automatic reopen)
    pub wanted: bool,
    /// A caller is waiting for the current open attempt
    pub caller_opening: bool,
    pub terminated: bool,
    pub busy: Option<GroupBusy>,
    pub versioning: bool,
    pub disconnected: bool,
    pub awaiting_pong: bool,
    pub pong_epoch: u64,
    pub connect_epoch: u64,
    pub reopen_epoch: u64,
    pub reopen_scheduled: bool,
    pub backoff: Backoff,
    pub replica: SessionReplica,
    pub membership: GroupMembership,
    pub next_action_id: u64,
    pub pending: BTreeMap<u64, PendingAction>,
}

impl ChannelState {
    pub fn new(kind: ChannelKind, config: &ChannelConfig) -> Self {
        Self {
            kind,
            phase: Phase::Closed,
            wanted: false,
            caller_opening: false,
            terminated: false,
            busy: None,
            versioning: true,
            disconnected: false,
            awaiting_pong: false,
            pong_epoch: 0,
            connect_epoch: 0,
            reopen_epoch: 0,
            reopen_scheduled: false,
            backoff: Backoff::new(config.backoff_min, config.backoff_max),
            replica: SessionReplica::default(),
            membership: GroupMembership::default(),
            next_action_id: 0,
            pending: BTreeMap::new(),
        }
    }

    fn versioned_in_flight(&self) -> bool {
        self.pending
            .values()
            .any(|p| matches!(p, PendingAction::Session { versioned: true }))
    }

    fn fixed_in_flight(&self) -> bool {
        self.pending.values().any(|p| *p == PendingAction::Fixed)
    }

    fn is_up(&self) -> bool {
        matches!(self.phase, Phase::AwaitingVersion | Phase::Open)
    }
}

// ---------------------------------------------------------------------------
// Input
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    Patches(Vec<PatchOp>),
    Fixed,
    Broadcast(Value),
    Direct { recipient: MemberId, msg: Value },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    // -- caller commands
    Open,
    Close,
    Terminate,
    SetBusy(Option<GroupBusy>),
    SetVersioning(bool),
    Submit(Submission),

    // -- transport
    Connected { epoch: u64 },
    ConnectFailed { epoch: u64, error: String },
    Frame(String),
    TransportClosed { code: Option<u16>, reason: String },
    TransportError(String),

    // -- timers
    HeartbeatTick,
    PongTimeout { epoch: u64 },
    ClosedCheck { transport_open: bool },
    ReopenDue { epoch: u64 },
    ActionTimeout { id: u64 },
}

// ---------------------------------------------------------------------------
// Effects
// ---------------------------------------------------------------------------

/// What the caller of a command should get back
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Done,
    AwaitOpen,
    AwaitAction(u64),
    Refused(StudyError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Connect { epoch: u64 },
    Disconnect,
    Send(OutboundFrame),
    StartHeartbeat,
    StopHeartbeat,
    ArmPongTimeout { epoch: u64 },
    ScheduleReopen { epoch: u64, delay: Duration },
    ArmActionTimeout { id: u64 },
    Reply(Outcome),
    SettleOpen(Result<(), StudyError>),
    SettleAction { id: u64, result: Result<(), StudyError> },
    Emit(ChannelEvent),
    PublishSession,
    ProtocolError(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Loss {
    Closed { code: Option<u16> },
    Errored,
    HeartbeatTimeout,
    ClosedPoll,
    Resync,
}

// ---------------------------------------------------------------------------
// transition
// ---------------------------------------------------------------------------

/// Pure, synchronous channel transition.
pub fn transition(
    mut state: ChannelState,
    input: Input,
    applier: &dyn PatchApplier,
) -> (ChannelState, Vec<Effect>) {
    let mut effects = Vec::new();
    let kind = state.kind;

    match input {
        Input::Open => {
            let refusal = if state.terminated {
                Some(StudyError::InvalidRun)
            } else if state.busy.is_some() {
                Some(StudyError::GroupBusy)
            } else {
                match state.phase {
                    Phase::Open => Some(StudyError::AlreadyOpen(kind)),
                    Phase::Connecting | Phase::AwaitingVersion => {
                        Some(StudyError::AlreadyOpening(kind))
                    }
                    Phase::Closed => None,
                }
            };
            match refusal {
                Some(err) => effects.push(Effect::Reply(Outcome::Refused(err))),
                None => {
                    state.wanted = true;
                    state.caller_opening = true;
                    state.reopen_scheduled = false;
                    begin_connect(&mut state, &mut effects);
                    effects.push(Effect::Reply(Outcome::AwaitOpen));
                }
            }
        }

        Input::Close => {
            shut(&mut state, &mut effects);
            effects.push(Effect::Reply(Outcome::Done));
        }

        Input::Terminate => {
            state.terminated = true;
            shut(&mut state, &mut effects);
            effects.push(Effect::Reply(Outcome::Done));
        }

        Input::SetBusy(busy) => {
            if busy.is_some() && state.busy.is_some() {
                effects.push(Effect::Reply(Outcome::Refused(StudyError::GroupBusy)));
            } else {
                state.busy = busy;
                effects.push(Effect::Reply(Outcome::Done));
            }
        }

        Input::SetVersioning(versioning) => {
            state.versioning = versioning;
            effects.push(Effect::Reply(Outcome::Done));
        }

        Input::Submit(submission) => {
            let outcome = submit(&mut state, submission, &mut effects);
            effects.push(Effect::Reply(outcome));
        }

        Input::Connected { epoch } => {
            if epoch == state.connect_epoch && state.phase == Phase::Connecting {
                state.phase = Phase::AwaitingVersion;
                effects.push(Effect::StartHeartbeat);
            }
            // otherwise a stale attempt; the actor drops its socket
        }

        Input::ConnectFailed { epoch, error } => {
            if epoch == state.connect_epoch && state.phase == Phase::Connecting {
                let caller_opening = state.caller_opening;
                effects.push(Effect::ProtocolError(format!(
                    "{kind} channel connect failed: {error}"
                )));
                go_down(&mut state, &mut effects, StudyError::Transport(error));
                if kind == ChannelKind::Group && caller_opening {
                    state.wanted = false;
                } else {
                    schedule_reopen(&mut state, &mut effects);
                }
            }
        }

        Input::Frame(text) => {
            if state.is_up() {
                match InboundFrame::parse(&text) {
                    Ok(frame) => handle_frame(&mut state, frame, applier, &mut effects),
                    Err(err) => effects.push(Effect::ProtocolError(format!(
                        "unparsable {kind} frame: {err}"
                    ))),
                }
            }
        }

        Input::TransportClosed { code, reason } => {
            if state.is_up() || state.phase == Phase::Connecting {
                if !reason.is_empty() {
                    effects.push(Effect::ProtocolError(format!(
                        "{kind} channel closed by server: {reason}"
                    )));
                }
                lose(&mut state, Loss::Closed { code }, &mut effects);
            }
        }

        Input::TransportError(error) => {
            if state.is_up() || state.phase == Phase::Connecting {
                effects.push(Effect::ProtocolError(format!(
                    "{kind} channel transport error: {error}"
                )));
                lose(&mut state, Loss::Errored, &mut effects);
            }
        }

        Input::HeartbeatTick => {
            if state.is_up() && !state.awaiting_pong {
                state.awaiting_pong = true;
                state.pong_epoch += 1;
                effects.push(Effect::Send(OutboundFrame::Ping));
                effects.push(Effect::ArmPongTimeout {
                    epoch: state.pong_epoch,
                });
            }
        }

        Input::PongTimeout { epoch } => {
            if state.awaiting_pong && epoch == state.pong_epoch && state.is_up() {
                state.awaiting_pong = false;
                if !state.disconnected {
                    state.disconnected = true;
                    effects.push(Effect::Emit(ChannelEvent::Disconnected));
                }
                lose(&mut state, Loss::HeartbeatTimeout, &mut effects);
            }
        }

        Input::ClosedCheck { transport_open } => {
            if state.terminated {
                // nothing to watch
            } else if state.is_up() && !transport_open {
                lose(&mut state, Loss::ClosedPoll, &mut effects);
            } else if state.phase == Phase::Closed && state.wanted {
                schedule_reopen(&mut state, &mut effects);
            }
        }

        Input::ReopenDue { epoch } => {
            if state.reopen_scheduled && epoch == state.reopen_epoch {
                state.reopen_scheduled = false;
                if state.wanted && !state.terminated && state.phase == Phase::Closed {
                    begin_connect(&mut state, &mut effects);
                }
            }
        }

        Input::ActionTimeout { id } => {
            if state.pending.remove(&id).is_some() {
                effects.push(Effect::SettleAction {
                    id,
                    result: Err(StudyError::Timeout(format!(
                        "no answer to {kind} action {id}"
                    ))),
                });
            }
        }
    }

    (state, effects)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn begin_connect(state: &mut ChannelState, effects: &mut Vec<Effect>) {
    state.phase = Phase::Connecting;
    state.connect_epoch += 1;
    effects.push(Effect::Connect {
        epoch: state.connect_epoch,
    });
}

fn schedule_reopen(state: &mut ChannelState, effects: &mut Vec<Effect>) {
    if state.terminated || !state.wanted || state.reopen_scheduled {
        return;
    }
    state.reopen_epoch += 1;
    state.reopen_scheduled = true;
    effects.push(Effect::ScheduleReopen {
        epoch: state.reopen_epoch,
        delay: state.backoff.next_delay(),
    });
}

/// Caller-driven close: no reopen afterwards.
fn shut(state: &mut ChannelState, effects: &mut Vec<Effect>) {
    state.wanted = false;
    state.reopen_scheduled = false;
    let kind = state.kind;
    go_down(state, effects, StudyError::ChannelClosed(kind));
}

/// Drop the connection and everything derived from it. Actions sent on it
/// can no longer be answered and fail right away.
fn go_down(state: &mut ChannelState, effects: &mut Vec<Effect>, open_error: StudyError) {
    let was = state.phase;
    if was == Phase::Closed {
        return;
    }
    let kind = state.kind;
    state.phase = Phase::Closed;
    state.awaiting_pong = false;
    state.replica.clear();
    state.membership = GroupMembership::default();

    effects.push(Effect::StopHeartbeat);
    effects.push(Effect::Disconnect);
    effects.push(Effect::PublishSession);

    for id in std::mem::take(&mut state.pending).into_keys() {
        effects.push(Effect::SettleAction {
            id,
            result: Err(StudyError::ChannelClosed(kind)),
        });
    }

    if state.caller_opening {
        state.caller_opening = false;
        effects.push(Effect::SettleOpen(Err(open_error)));
    }
    if was == Phase::Open {
        effects.push(Effect::Emit(ChannelEvent::Closed));
    }
}

fn lose(state: &mut ChannelState, loss: Loss, effects: &mut Vec<Effect>) {
    let kind = state.kind;
    go_down(state, effects, StudyError::ChannelClosed(kind));

    match loss {
        Loss::Closed {
            code: Some(POLICY_VIOLATION),
        } if kind == ChannelKind::Batch => {
            state.terminated = true;
            state.wanted = false;
            state.reopen_scheduled = false;
            effects.push(Effect::Emit(ChannelEvent::RunInvalidated));
        }
        Loss::Closed { .. } | Loss::Errored if kind == ChannelKind::Group => {
            // Reconnecting a group after a transport failure is the caller's call
            state.wanted = false;
        }
        _ => schedule_reopen(state, effects),
    }
}

fn submit(state: &mut ChannelState, submission: Submission, effects: &mut Vec<Effect>) -> Outcome {
    let kind = state.kind;
    if state.terminated {
        return Outcome::Refused(StudyError::InvalidRun);
    }
    if state.phase != Phase::Open {
        return Outcome::Refused(StudyError::NoOpenChannel(kind));
    }

    match submission {
        Submission::Patches(patches) => {
            if patches.is_empty() {
                return Outcome::Refused(StudyError::InvalidPatch(
                    "no patch operations".to_string(),
                ));
            }
            if state.versioning && state.versioned_in_flight() {
                return Outcome::Refused(StudyError::SendOneAtATime(kind));
            }
            let id = take_action_id(state);
            state.pending.insert(
                id,
                PendingAction::Session {
                    versioned: state.versioning,
                },
            );
            effects.push(Effect::Send(OutboundFrame::Session {
                id,
                patches,
                version: state.replica.version(),
                versioning: state.versioning,
            }));
            effects.push(Effect::ArmActionTimeout { id });
            Outcome::AwaitAction(id)
        }
        Submission::Fixed => {
            if state.fixed_in_flight() {
                return Outcome::Refused(StudyError::FixedPending);
            }
            let id = take_action_id(state);
            state.pending.insert(id, PendingAction::Fixed);
            effects.push(Effect::Send(OutboundFrame::Fixed));
            effects.push(Effect::ArmActionTimeout { id });
            Outcome::AwaitAction(id)
        }
        Submission::Broadcast(msg) => {
            effects.push(Effect::Send(OutboundFrame::Broadcast { msg }));
            Outcome::Done
        }
        Submission::Direct { recipient, msg } => {
            effects.push(Effect::Send(OutboundFrame::Direct { recipient, msg }));
            Outcome::Done
        }
    }
}

fn take_action_id(state: &mut ChannelState) -> u64 {
    let id = state.next_action_id;
    state.next_action_id += 1;
    id
}

fn settle(state: &mut ChannelState, id: u64, result: Result<(), StudyError>, effects: &mut Vec<Effect>) {
    if state.pending.remove(&id).is_some() {
        effects.push(Effect::SettleAction { id, result });
    } else {
        effects.push(Effect::ProtocolError(format!(
            "{} answer for unknown action {id}",
            state.kind
        )));
    }
}

fn handle_frame(
    state: &mut ChannelState,
    frame: InboundFrame,
    applier: &dyn PatchApplier,
    effects: &mut Vec<Effect>,
) {
    let kind = state.kind;

    if frame.is_pong() {
        state.awaiting_pong = false;
        if state.disconnected {
            state.disconnected = false;
            effects.push(Effect::Emit(ChannelEvent::Connected));
        }
    }

    // Membership first: a JOINED frame may also carry the snapshot and version
    if kind == ChannelKind::Group && update_membership(state, &frame, effects) {
        effects.push(Effect::Emit(ChannelEvent::Update));
    }

    if let Some(data) = frame.data {
        state.replica.replace(data);
        effects.push(Effect::PublishSession);
        effects.push(Effect::Emit(ChannelEvent::SessionReplaced));
    }

    if let Some(patches) = frame.patches.filter(|p| !p.is_empty()) {
        for op in &patches {
            if let Err(err) = state.replica.apply(applier, std::slice::from_ref(op)) {
                effects.push(Effect::PublishSession);
                effects.push(Effect::ProtocolError(format!(
                    "{kind} session patch failed, resyncing: {err}"
                )));
                lose(state, Loss::Resync, effects);
                return;
            }
            effects.push(Effect::Emit(ChannelEvent::SessionChanged {
                op: op.name().to_string(),
                path: op.path().to_string(),
            }));
        }
        effects.push(Effect::PublishSession);
    }

    if let Some(version) = frame.version {
        state.replica.set_version(version);
        effects.push(Effect::PublishSession);
        if state.phase == Phase::AwaitingVersion {
            state.phase = Phase::Open;
            state.backoff.reset();
            if state.caller_opening {
                state.caller_opening = false;
                effects.push(Effect::SettleOpen(Ok(())));
            }
            effects.push(Effect::Emit(ChannelEvent::Opened));
            if state.disconnected {
                state.disconnected = false;
                effects.push(Effect::Emit(ChannelEvent::Connected));
            }
        }
    }

    match frame.action {
        Some(ChannelAction::SessionAck) => match frame.id {
            Some(id) => settle(state, id, Ok(()), effects),
            None => effects.push(Effect::ProtocolError(format!("{kind} SESSION_ACK without id"))),
        },
        Some(ChannelAction::SessionFail) => match frame.id {
            Some(id) => settle(state, id, Err(StudyError::SessionFail { kind, id }), effects),
            None => effects.push(Effect::ProtocolError(format!("{kind} SESSION_FAIL without id"))),
        },
        Some(ChannelAction::Unknown) => {
            effects.push(Effect::ProtocolError(format!("{kind} frame with unknown action")));
        }
        Some(ChannelAction::Fixed) => {
            let fixed: Vec<u64> = state
                .pending
                .iter()
                .filter(|(_, p)| **p == PendingAction::Fixed)
                .map(|(id, _)| *id)
                .collect();
            for id in fixed {
                settle(state, id, Ok(()), effects);
            }
            effects.push(Effect::Emit(ChannelEvent::Fixed));
        }
        Some(ChannelAction::Error) => {
            let message = frame
                .error_msg
                .unwrap_or_else(|| "unspecified server error".to_string());
            match frame.id.filter(|id| state.pending.contains_key(id)) {
                Some(id) => settle(state, id, Err(StudyError::Server(message)), effects),
                None => {
                    effects.push(Effect::ProtocolError(format!("{kind} server error: {message}")));
                    effects.push(Effect::Emit(ChannelEvent::Error { message }));
                }
            }
        }
        Some(
            action @ (ChannelAction::Opened
            | ChannelAction::Closed
            | ChannelAction::Joined
            | ChannelAction::Left),
        ) if kind == ChannelKind::Group => {
            if let Some(member_id) = frame.member_id {
                let change = match action {
                    ChannelAction::Opened => MemberChange::Opened,
                    ChannelAction::Closed => MemberChange::Closed,
                    ChannelAction::Joined => MemberChange::Joined,
                    _ => MemberChange::Left,
                };
                let is_self = state.membership.member_id.as_ref() == Some(&member_id);
                effects.push(Effect::Emit(ChannelEvent::Member {
                    change,
                    member_id,
                    is_self,
                }));
            }
        }
        _ => {}
    }

    if let Some(msg) = frame.msg {
        if kind == ChannelKind::Group {
            effects.push(Effect::Emit(ChannelEvent::Message { msg }));
        }
    }
}

/// Returns true when any membership field changed.
fn update_membership(state: &mut ChannelState, frame: &InboundFrame, effects: &mut Vec<Effect>) -> bool {
    let before = state.membership.clone();
    let membership = &mut state.membership;

    if frame.action == Some(ChannelAction::Joined)
        && membership.member_id.is_none()
        && state.phase == Phase::AwaitingVersion
    {
        membership.member_id = frame.member_id.clone();
    }
    if let Some(group_id) = frame.group_id {
        membership.group_id = Some(group_id);
    }
    if let Some(group_state) = frame.group_state {
        membership.group_state = Some(group_state);
    }
    if let Some(members) = &frame.members {
        membership.members = members.clone();
    }
    if let Some(channels) = &frame.channels {
        membership.channels = channels.clone();
    }
    if let Some(stray) = membership
        .channels
        .iter()
        .find(|c| !membership.members.contains(c))
    {
        effects.push(Effect::ProtocolError(format!(
            "group channel {stray} belongs to no member"
        )));
    }

    *membership != before
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::JsonPatch;
    use serde_json::json;
    use studyrun_protocol::GroupState;

    fn config() -> ChannelConfig {
        ChannelConfig {
            backoff_min: Duration::from_secs(1),
            backoff_max: Duration::from_secs(120),
            ..ChannelConfig::default()
        }
    }

    fn step(state: ChannelState, input: Input) -> (ChannelState, Vec<Effect>) {
        transition(state, input, &JsonPatch)
    }

    fn frame(value: Value) -> Input {
        Input::Frame(value.to_string())
    }

    /// Drive a channel to Open with the given snapshot.
    fn open(kind: ChannelKind, data: Value, version: u64) -> ChannelState {
        let state = ChannelState::new(kind, &config());
        let (state, _) = step(state, Input::Open);
        let (state, _) = step(state, Input::Connected { epoch: 1 });
        let (state, _) = match kind {
            ChannelKind::Batch => step(state, frame(json!({"data": data, "version": version}))),
            ChannelKind::Group => step(
                state,
                frame(json!({
                    "action": "JOINED",
                    "memberId": "m1",
                    "groupResultId": 7,
                    "groupState": "STARTED",
                    "members": ["m1"],
                    "channels": ["m1"],
                    "sessionData": data,
                    "sessionVersion": version
                })),
            ),
        };
        assert_eq!(state.phase, Phase::Open);
        state
    }

    fn sent(effects: &[Effect]) -> Vec<OutboundFrame> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Send(frame) => Some(frame.clone()),
                _ => None,
            })
            .collect()
    }

    fn emitted(effects: &[Effect]) -> Vec<ChannelEvent> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Emit(event) => Some(event.clone()),
                _ => None,
            })
            .collect()
    }

    fn reopen_delay(effects: &[Effect]) -> Option<Duration> {
        effects.iter().find_map(|e| match e {
            Effect::ScheduleReopen { delay, .. } => Some(*delay),
            _ => None,
        })
    }

    fn patch_add(path: &str, value: Value) -> Vec<PatchOp> {
        vec![PatchOp::Add {
            path: path.to_string(),
            value,
        }]
    }

    #[test]
    fn open_resolves_only_after_version_arrives() {
        let state = ChannelState::new(ChannelKind::Batch, &config());
        let (state, effects) = step(state, Input::Open);
        assert_eq!(state.phase, Phase::Connecting);
        assert!(effects.contains(&Effect::Connect { epoch: 1 }));
        assert!(effects.contains(&Effect::Reply(Outcome::AwaitOpen)));

        let (state, effects) = step(state, Input::Connected { epoch: 1 });
        assert_eq!(state.phase, Phase::AwaitingVersion);
        assert!(effects.contains(&Effect::StartHeartbeat));

        let (state, effects) = step(state, frame(json!({"data": {"a": 1}})));
        assert_eq!(state.phase, Phase::AwaitingVersion);
        assert!(!effects.iter().any(|e| matches!(e, Effect::SettleOpen(_))));

        let (state, effects) = step(state, frame(json!({"version": 3})));
        assert_eq!(state.phase, Phase::Open);
        assert_eq!(state.replica.data(), &json!({"a": 1}));
        assert_eq!(state.replica.version(), Some(3));
        assert!(effects.contains(&Effect::SettleOpen(Ok(()))));
        assert!(emitted(&effects).contains(&ChannelEvent::Opened));
    }

    #[test]
    fn second_open_is_refused_without_connecting() {
        let state = ChannelState::new(ChannelKind::Group, &config());
        let (state, _) = step(state, Input::Open);
        let (state, effects) = step(state, Input::Open);
        assert_eq!(
            effects,
            vec![Effect::Reply(Outcome::Refused(StudyError::AlreadyOpening(
                ChannelKind::Group
            )))]
        );

        let state = open(ChannelKind::Group, json!({}), 1);
        let (_, effects) = step(state, Input::Open);
        assert_eq!(
            effects,
            vec![Effect::Reply(Outcome::Refused(StudyError::AlreadyOpen(
                ChannelKind::Group
            )))]
        );
    }

    #[test]
    fn versioned_patches_go_one_at_a_time() {
        let state = open(ChannelKind::Batch, json!({}), 5);
        let (state, effects) = step(
            state,
            Input::Submit(Submission::Patches(patch_add("/a", json!(1)))),
        );
        assert!(effects.contains(&Effect::Reply(Outcome::AwaitAction(0))));
        assert_eq!(
            sent(&effects),
            vec![OutboundFrame::Session {
                id: 0,
                patches: patch_add("/a", json!(1)),
                version: Some(5),
                versioning: true,
            }]
        );

        let (state, effects) = step(
            state,
            Input::Submit(Submission::Patches(patch_add("/b", json!(2)))),
        );
        assert_eq!(
            effects,
            vec![Effect::Reply(Outcome::Refused(StudyError::SendOneAtATime(
                ChannelKind::Batch
            )))]
        );

        let (state, effects) = step(state, frame(json!({"action": "SESSION_ACK", "id": 0})));
        assert!(effects.contains(&Effect::SettleAction {
            id: 0,
            result: Ok(())
        }));
        assert_eq!(state.replica.data(), &json!({}));

        let (_, effects) = step(
            state,
            Input::Submit(Submission::Patches(patch_add("/b", json!(2)))),
        );
        assert!(effects.contains(&Effect::Reply(Outcome::AwaitAction(1))));
    }

    #[test]
    fn unversioned_patches_may_overlap() {
        let state = open(ChannelKind::Batch, json!({}), 1);
        let (state, _) = step(state, Input::SetVersioning(false));
        let (state, _) = step(
            state,
            Input::Submit(Submission::Patches(patch_add("/a", json!(1)))),
        );
        let (state, effects) = step(
            state,
            Input::Submit(Submission::Patches(patch_add("/b", json!(2)))),
        );
        assert!(effects.contains(&Effect::Reply(Outcome::AwaitAction(1))));
        assert_eq!(state.pending.len(), 2);
    }

    #[test]
    fn session_fail_and_timeout_settle_with_errors() {
        let state = open(ChannelKind::Batch, json!({}), 1);
        let (state, _) = step(
            state,
            Input::Submit(Submission::Patches(patch_add("/a", json!(1)))),
        );
        let (state, effects) = step(state, frame(json!({"action": "SESSION_FAIL", "id": 0})));
        assert!(effects.contains(&Effect::SettleAction {
            id: 0,
            result: Err(StudyError::SessionFail {
                kind: ChannelKind::Batch,
                id: 0
            })
        }));

        let (state, _) = step(
            state,
            Input::Submit(Submission::Patches(patch_add("/a", json!(1)))),
        );
        let (state, effects) = step(state, Input::ActionTimeout { id: 1 });
        assert!(matches!(
            effects.as_slice(),
            [Effect::SettleAction {
                id: 1,
                result: Err(StudyError::Timeout(_))
            }]
        ));

        // a late ack is only reported
        let (_, effects) = step(state, frame(json!({"action": "SESSION_ACK", "id": 1})));
        assert!(matches!(effects.as_slice(), [Effect::ProtocolError(_)]));
    }

    #[test]
    fn submitting_on_a_closed_channel_fails_locally() {
        let state = ChannelState::new(ChannelKind::Batch, &config());
        let (_, effects) = step(
            state,
            Input::Submit(Submission::Patches(patch_add("/a", json!(1)))),
        );
        assert_eq!(
            effects,
            vec![Effect::Reply(Outcome::Refused(StudyError::NoOpenChannel(
                ChannelKind::Batch
            )))]
        );
    }

    #[test]
    fn server_patches_update_the_replica_and_notify_per_operation() {
        let state = open(ChannelKind::Batch, json!({"a": 1}), 1);
        let (state, effects) = step(
            state,
            frame(json!({
                "action": "SESSION",
                "patches": [
                    {"op": "add", "path": "/b", "value": 2},
                    {"op": "remove", "path": "/a"}
                ],
                "version": 2
            })),
        );
        assert_eq!(state.replica.data(), &json!({"b": 2}));
        assert_eq!(state.replica.version(), Some(2));
        assert_eq!(
            emitted(&effects),
            vec![
                ChannelEvent::SessionChanged {
                    op: "add".to_string(),
                    path: "/b".to_string()
                },
                ChannelEvent::SessionChanged {
                    op: "remove".to_string(),
                    path: "/a".to_string()
                },
            ]
        );
    }

    #[test]
    fn root_remove_from_server_clears_replica() {
        let state = open(ChannelKind::Batch, json!({"a": 1, "b": [1]}), 1);
        let (state, _) = step(
            state,
            frame(json!({"patches": [{"op": "remove", "path": "/"}], "version": 2})),
        );
        assert_eq!(state.replica.data(), &json!({}));
    }

    #[test]
    fn failing_server_patch_forces_a_resync() {
        let state = open(ChannelKind::Group, json!({}), 1);
        let (state, effects) = step(
            state,
            frame(json!({"sessionPatches": [{"op": "replace", "path": "/missing", "value": 1}]})),
        );
        assert_eq!(state.phase, Phase::Closed);
        assert!(state.wanted);
        assert!(effects.contains(&Effect::Disconnect));
        assert_eq!(reopen_delay(&effects), Some(Duration::from_secs(1)));
        assert_eq!(state.replica.data(), &json!({}));
    }

    #[test]
    fn heartbeat_timeout_reopens_with_doubling_backoff() {
        let state = open(ChannelKind::Batch, json!({}), 1);
        let (state, effects) = step(state, Input::HeartbeatTick);
        assert_eq!(sent(&effects), vec![OutboundFrame::Ping]);

        let (state, effects) = step(state, Input::PongTimeout { epoch: 1 });
        assert!(emitted(&effects).contains(&ChannelEvent::Disconnected));
        assert_eq!(reopen_delay(&effects), Some(Duration::from_secs(1)));
        assert_eq!(state.phase, Phase::Closed);

        // the reopen fails: next delay doubles
        let (state, effects) = step(state, Input::ReopenDue { epoch: 1 });
        assert!(effects.contains(&Effect::Connect { epoch: 2 }));
        let (state, effects) = step(
            state,
            Input::ConnectFailed {
                epoch: 2,
                error: "refused".to_string(),
            },
        );
        assert_eq!(reopen_delay(&effects), Some(Duration::from_secs(2)));

        // a successful reopen resets the backoff and reports reconnection
        let (state, _) = step(state, Input::ReopenDue { epoch: 2 });
        let (state, _) = step(state, Input::Connected { epoch: 3 });
        let (state, effects) = step(state, frame(json!({"data": {}, "version": 9})));
        assert!(emitted(&effects).contains(&ChannelEvent::Connected));
        assert_eq!(state.backoff.peek(), Duration::from_secs(1));
    }

    #[test]
    fn pong_cancels_the_timeout() {
        let state = open(ChannelKind::Batch, json!({}), 1);
        let (state, _) = step(state, Input::HeartbeatTick);
        let (state, _) = step(state, frame(json!({"heartbeat": "pong"})));
        let (state, effects) = step(state, Input::PongTimeout { epoch: 1 });
        assert!(effects.is_empty());
        assert_eq!(state.phase, Phase::Open);
    }

    #[test]
    fn batch_reconnects_after_close_but_group_does_not() {
        let batch = open(ChannelKind::Batch, json!({"a": 1}), 1);
        let (batch, effects) = step(
            batch,
            Input::TransportClosed {
                code: Some(1006),
                reason: String::new(),
            },
        );
        assert_eq!(batch.replica.data(), &json!({}));
        assert!(emitted(&effects).contains(&ChannelEvent::Closed));
        assert!(reopen_delay(&effects).is_some());

        let group = open(ChannelKind::Group, json!({}), 1);
        let (group, effects) = step(
            group,
            Input::TransportClosed {
                code: Some(1006),
                reason: String::new(),
            },
        );
        assert!(!group.wanted);
        assert!(reopen_delay(&effects).is_none());
        assert_eq!(group.membership, GroupMembership::default());
    }

    #[test]
    fn closed_poll_reopens_a_silently_dead_group_channel() {
        let group = open(ChannelKind::Group, json!({}), 1);
        let (group, effects) = step(group, Input::ClosedCheck { transport_open: true });
        assert!(effects.is_empty());
        let (group, effects) = step(group, Input::ClosedCheck { transport_open: false });
        assert_eq!(group.phase, Phase::Closed);
        assert!(reopen_delay(&effects).is_some());
    }

    #[test]
    fn policy_violation_invalidates_the_run() {
        let batch = open(ChannelKind::Batch, json!({}), 1);
        let (batch, effects) = step(
            batch,
            Input::TransportClosed {
                code: Some(POLICY_VIOLATION),
                reason: "run is gone".to_string(),
            },
        );
        assert!(batch.terminated);
        assert!(emitted(&effects).contains(&ChannelEvent::RunInvalidated));
        assert!(reopen_delay(&effects).is_none());

        let (_, effects) = step(batch, Input::Open);
        assert_eq!(
            effects,
            vec![Effect::Reply(Outcome::Refused(StudyError::InvalidRun))]
        );
    }

    #[test]
    fn stale_reopen_timer_is_ignored_after_close() {
        let batch = open(ChannelKind::Batch, json!({}), 1);
        let (batch, _) = step(
            batch,
            Input::TransportClosed {
                code: None,
                reason: String::new(),
            },
        );
        let (batch, _) = step(batch, Input::Close);
        let (batch, effects) = step(batch, Input::ReopenDue { epoch: 1 });
        assert!(effects.is_empty());
        assert_eq!(batch.phase, Phase::Closed);
    }

    #[test]
    fn group_membership_and_member_events() {
        let group = open(ChannelKind::Group, json!({}), 1);
        assert_eq!(group.membership.member_id, Some(MemberId::new("m1")));
        assert_eq!(group.membership.group_id, Some(7));

        let (group, effects) = step(
            group,
            frame(json!({
                "action": "JOINED",
                "memberId": "m2",
                "members": ["m1", "m2"],
                "channels": ["m1"]
            })),
        );
        assert_eq!(group.membership.member_id, Some(MemberId::new("m1")));
        assert_eq!(
            emitted(&effects),
            vec![
                ChannelEvent::Update,
                ChannelEvent::Member {
                    change: MemberChange::Joined,
                    member_id: MemberId::new("m2"),
                    is_self: false
                }
            ]
        );

        let (group, effects) = step(group, frame(json!({"msg": {"hi": 1}})));
        assert_eq!(
            emitted(&effects),
            vec![ChannelEvent::Message { msg: json!({"hi": 1}) }]
        );

        let (_, effects) = step(
            group,
            frame(json!({"action": "OPENED", "memberId": "m2", "channels": ["m1", "m2"]})),
        );
        assert!(emitted(&effects).contains(&ChannelEvent::Member {
            change: MemberChange::Opened,
            member_id: MemberId::new("m2"),
            is_self: false
        }));
    }

    #[test]
    fn fixed_is_one_at_a_time_and_settled_by_the_fixed_frame() {
        let group = open(ChannelKind::Group, json!({}), 1);
        let (group, effects) = step(group, Input::Submit(Submission::Fixed));
        assert_eq!(sent(&effects), vec![OutboundFrame::Fixed]);
        let (group, effects) = step(group, Input::Submit(Submission::Fixed));
        assert_eq!(
            effects,
            vec![Effect::Reply(Outcome::Refused(StudyError::FixedPending))]
        );

        let (group, effects) = step(
            group,
            frame(json!({"action": "FIXED", "groupState": "FIXED"})),
        );
        assert!(effects.contains(&Effect::SettleAction {
            id: 0,
            result: Ok(())
        }));
        assert!(emitted(&effects).contains(&ChannelEvent::Fixed));
        assert_eq!(group.membership.group_state, Some(GroupState::Fixed));
    }

    #[test]
    fn busy_group_refuses_to_open() {
        let state = ChannelState::new(ChannelKind::Group, &config());
        let (state, _) = step(state, Input::SetBusy(Some(GroupBusy::Leaving)));
        let (state, effects) = step(state, Input::Open);
        assert_eq!(
            effects,
            vec![Effect::Reply(Outcome::Refused(StudyError::GroupBusy))]
        );
        let (state, effects) = step(state, Input::SetBusy(Some(GroupBusy::Reassigning)));
        assert_eq!(
            effects,
            vec![Effect::Reply(Outcome::Refused(StudyError::GroupBusy))]
        );
        let (state, _) = step(state, Input::SetBusy(None));
        let (_, effects) = step(state, Input::Open);
        assert!(effects.contains(&Effect::Reply(Outcome::AwaitOpen)));
    }

    #[test]
    fn connection_loss_fails_pending_actions() {
        let state = open(ChannelKind::Batch, json!({}), 1);
        let (state, _) = step(
            state,
            Input::Submit(Submission::Patches(patch_add("/a", json!(1)))),
        );
        let (state, effects) = step(state, Input::TransportError("reset".to_string()));
        assert!(effects.contains(&Effect::SettleAction {
            id: 0,
            result: Err(StudyError::ChannelClosed(ChannelKind::Batch))
        }));
        assert!(state.pending.is_empty());

        let (state, _) = step(state, Input::ReopenDue { epoch: 1 });
        let (state, _) = step(state, Input::Connected { epoch: 2 });
        let (state, _) = step(state, frame(json!({"data": {}, "version": 2})));
        assert_eq!(state.phase, Phase::Open);

        let (state, effects) = step(
            state,
            Input::Submit(Submission::Patches(patch_add("/b", json!(2)))),
        );
        assert!(effects.contains(&Effect::Reply(Outcome::AwaitAction(1))));

        // the timer of the failed action fires into nothing
        let (_, effects) = step(state, Input::ActionTimeout { id: 0 });
        assert!(effects.is_empty());
    }

    #[test]
    fn unknown_action_is_reported_and_the_rest_applies() {
        let state = ChannelState::new(ChannelKind::Batch, &config());
        let (state, _) = step(state, Input::Open);
        let (state, _) = step(state, Input::Connected { epoch: 1 });
        let (state, effects) = step(
            state,
            frame(json!({"action": "SOMETHING_NEW", "data": {"a": 1}, "version": 4})),
        );
        assert_eq!(state.phase, Phase::Open);
        assert_eq!(state.replica.data(), &json!({"a": 1}));
        assert!(effects.contains(&Effect::SettleOpen(Ok(()))));
        assert!(effects.iter().any(|e| matches!(e, Effect::ProtocolError(_))));
    }

    #[test]
    fn caller_close_settles_a_pending_open() {
        let state = ChannelState::new(ChannelKind::Group, &config());
        let (state, _) = step(state, Input::Open);
        let (state, effects) = step(state, Input::Close);
        assert!(effects.contains(&Effect::SettleOpen(Err(StudyError::ChannelClosed(
            ChannelKind::Group
        )))));

        // the connect attempt finishing late is discarded
        let (state, effects) = step(state, Input::Connected { epoch: 1 });
        assert!(effects.is_empty());
        assert_eq!(state.phase, Phase::Closed);
    }
}

//! Channel actor
//!
//! One task per channel owns the [`ChannelState`] and the live socket.
//! Callers talk to it through [`ChannelHandle`]; timers and the connect task
//! post their inputs back into the same queue through weak senders, so the
//! actor stops once every handle is dropped.

use std::collections::HashMap;
use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde_json::Value;
use studyrun_protocol::{ChannelKind, MemberId, PatchOp};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::transition::{transition, ChannelState, Effect, Input, Outcome, Submission};
use super::transport::{Connection, Transport, TransportEvent};
use super::{ChannelEvent, ChannelStatus, GroupBusy, GroupMembership, Phase};
use crate::callback::spawn_listener;
use crate::config::ChannelConfig;
use crate::error::{StudyError, StudyResult};
use crate::patch::PatchApplier;
use crate::store::SessionView;

type Reply = oneshot::Sender<StudyResult<()>>;

enum Command {
    Call { input: Input, reply: Reply },
    Connected {
        epoch: u64,
        result: Result<Connection, StudyError>,
    },
    Timer(Input),
    ClosedCheck,
}

/// Handle to a running channel actor (cheap to Clone).
#[derive(Clone)]
pub struct ChannelHandle {
    kind: ChannelKind,
    command_tx: mpsc::UnboundedSender<Command>,
    view: SessionView,
    status: Arc<ArcSwap<ChannelStatus>>,
    events: broadcast::Sender<ChannelEvent>,
}

impl ChannelHandle {
    /// Spawn a closed channel that connects to `url` when opened.
    pub fn spawn(
        kind: ChannelKind,
        url: String,
        config: ChannelConfig,
        transport: Arc<dyn Transport>,
        applier: Arc<dyn PatchApplier>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(256);
        let view = SessionView::default();
        let status = Arc::new(ArcSwap::from_pointee(ChannelStatus::default()));

        let io = ActorIo {
            kind,
            url,
            config: config.clone(),
            transport,
            applier,
            self_tx: command_tx.downgrade(),
            conn: None,
            heartbeat: None,
            closed_check: None,
            open_waiters: Vec::new(),
            action_replies: HashMap::new(),
            view: view.clone(),
            status: status.clone(),
            events: events.clone(),
        };
        tokio::spawn(actor_loop(ChannelState::new(kind, &config), io, command_rx));

        Self {
            kind,
            command_tx,
            view,
            status,
            events,
        }
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn view(&self) -> &SessionView {
        &self.view
    }

    /// Lock-free status read
    pub fn status(&self) -> Arc<ChannelStatus> {
        self.status.load_full()
    }

    pub fn is_open(&self) -> bool {
        self.status.load().phase == Phase::Open
    }

    pub fn is_opening(&self) -> bool {
        matches!(
            self.status.load().phase,
            Phase::Connecting | Phase::AwaitingVersion
        )
    }

    pub fn membership(&self) -> GroupMembership {
        self.status.load().membership.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    /// Register a listener closure for every channel event.
    pub fn on_event<L>(&self, listener: L) -> JoinHandle<()>
    where
        L: FnMut(ChannelEvent) + Send + 'static,
    {
        spawn_listener(self.events.subscribe(), listener)
    }

    /// Connect and wait for the first session version.
    pub async fn open(&self) -> StudyResult<()> {
        self.call(Input::Open).await
    }

    pub async fn close(&self) -> StudyResult<()> {
        self.call(Input::Close).await
    }

    /// Close for good: the channel refuses every later operation.
    pub async fn terminate(&self) -> StudyResult<()> {
        self.call(Input::Terminate).await
    }

    pub async fn set_busy(&self, busy: Option<GroupBusy>) -> StudyResult<()> {
        self.call(Input::SetBusy(busy)).await
    }

    pub async fn set_versioning(&self, versioning: bool) -> StudyResult<()> {
        self.call(Input::SetVersioning(versioning)).await
    }

    /// Send patches and wait for the server's acknowledgement.
    pub async fn submit_patches(&self, patches: Vec<PatchOp>) -> StudyResult<()> {
        self.call(Input::Submit(Submission::Patches(patches))).await
    }

    pub async fn set_fixed(&self) -> StudyResult<()> {
        self.call(Input::Submit(Submission::Fixed)).await
    }

    pub async fn send_msg(&self, msg: Value) -> StudyResult<()> {
        self.call(Input::Submit(Submission::Broadcast(msg))).await
    }

    pub async fn send_msg_to(&self, recipient: MemberId, msg: Value) -> StudyResult<()> {
        self.call(Input::Submit(Submission::Direct { recipient, msg }))
            .await
    }

    async fn call(&self, input: Input) -> StudyResult<()> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(Command::Call { input, reply })
            .map_err(|_| StudyError::ChannelClosed(self.kind))?;
        rx.await
            .map_err(|_| StudyError::ChannelClosed(self.kind))?
    }
}

struct ActorIo {
    kind: ChannelKind,
    url: String,
    config: ChannelConfig,
    transport: Arc<dyn Transport>,
    applier: Arc<dyn PatchApplier>,
    self_tx: mpsc::WeakUnboundedSender<Command>,
    conn: Option<Connection>,
    heartbeat: Option<JoinHandle<()>>,
    closed_check: Option<JoinHandle<()>>,
    open_waiters: Vec<Reply>,
    action_replies: HashMap<u64, Reply>,
    view: SessionView,
    status: Arc<ArcSwap<ChannelStatus>>,
    events: broadcast::Sender<ChannelEvent>,
}

async fn next_transport_event(conn: &mut Option<Connection>) -> Option<TransportEvent> {
    match conn {
        Some(conn) => conn.inbound.recv().await,
        None => pending().await,
    }
}

enum Wake {
    Command(Option<Command>),
    Transport(Option<TransportEvent>),
}

async fn actor_loop(
    mut state: ChannelState,
    mut io: ActorIo,
    mut command_rx: mpsc::UnboundedReceiver<Command>,
) {
    loop {
        let wake = tokio::select! {
            command = command_rx.recv() => Wake::Command(command),
            event = next_transport_event(&mut io.conn) => Wake::Transport(event),
        };

        let (input, reply) = match wake {
            Wake::Command(None) => break,
            Wake::Command(Some(Command::Call { input, reply })) => (input, Some(reply)),
            Wake::Command(Some(Command::Timer(input))) => (input, None),
            Wake::Command(Some(Command::ClosedCheck)) => {
                let transport_open = io.conn.as_ref().is_some_and(|c| c.ready.is_open());
                (Input::ClosedCheck { transport_open }, None)
            }
            Wake::Command(Some(Command::Connected { epoch, result })) => match result {
                Ok(conn) => {
                    if epoch != state.connect_epoch || state.phase != Phase::Connecting {
                        debug!(
                            component = "channel",
                            event = "channel.connect.stale",
                            kind = %io.kind,
                            epoch,
                            "Dropping socket of a superseded connect attempt"
                        );
                        continue;
                    }
                    io.conn = Some(conn);
                    (Input::Connected { epoch }, None)
                }
                Err(err) => (
                    Input::ConnectFailed {
                        epoch,
                        error: err.to_string(),
                    },
                    None,
                ),
            },
            Wake::Transport(Some(TransportEvent::Text(text))) => (Input::Frame(text), None),
            Wake::Transport(Some(TransportEvent::Closed { code, reason })) => {
                (Input::TransportClosed { code, reason }, None)
            }
            Wake::Transport(Some(TransportEvent::Error(error))) => {
                (Input::TransportError(error), None)
            }
            Wake::Transport(None) => {
                io.conn = None;
                (
                    Input::TransportClosed {
                        code: None,
                        reason: String::new(),
                    },
                    None,
                )
            }
        };

        let (next, effects) = transition(state, input, io.applier.as_ref());
        state = next;
        io.execute(&state, effects, reply);
        io.publish_status(&state);
    }

    io.shutdown();
}

impl ActorIo {
    fn execute(&mut self, state: &ChannelState, effects: Vec<Effect>, mut reply: Option<Reply>) {
        let kind = self.kind;
        for effect in effects {
            match effect {
                Effect::Connect { epoch } => self.connect(epoch),
                Effect::Disconnect => {
                    if self.conn.take().is_some() {
                        debug!(
                            component = "channel",
                            event = "channel.socket.dropped",
                            kind = %kind,
                            "Socket dropped"
                        );
                    }
                }
                Effect::Send(frame) => match &self.conn {
                    Some(conn) => {
                        debug!(
                            component = "channel",
                            event = "channel.frame.sent",
                            kind = %kind,
                            frame = frame.name(),
                            "Frame sent"
                        );
                        if conn.outbound.send(frame.encode(kind)).is_err() {
                            conn.ready.mark_closed();
                        }
                    }
                    None => warn!(
                        component = "channel",
                        event = "channel.frame.unsent",
                        kind = %kind,
                        frame = frame.name(),
                        "No socket for outgoing frame"
                    ),
                },
                Effect::StartHeartbeat => {
                    self.stop_heartbeat();
                    let period = self.config.heartbeat_interval;
                    self.heartbeat = Some(self.ticker(period, || Command::Timer(Input::HeartbeatTick)));
                }
                Effect::StopHeartbeat => self.stop_heartbeat(),
                Effect::ArmPongTimeout { epoch } => {
                    self.after(self.config.heartbeat_timeout, Input::PongTimeout { epoch });
                }
                Effect::ScheduleReopen { epoch, delay } => {
                    info!(
                        component = "channel",
                        event = "channel.reopen.scheduled",
                        kind = %kind,
                        delay_ms = delay.as_millis() as u64,
                        "Channel reopen scheduled"
                    );
                    self.after(delay, Input::ReopenDue { epoch });
                }
                Effect::ArmActionTimeout { id } => {
                    self.after(self.config.sending_timeout, Input::ActionTimeout { id });
                }
                Effect::Reply(outcome) => {
                    let Some(reply) = reply.take() else { continue };
                    match outcome {
                        Outcome::Done => {
                            let _ = reply.send(Ok(()));
                        }
                        Outcome::AwaitOpen => self.open_waiters.push(reply),
                        Outcome::AwaitAction(id) => {
                            self.action_replies.insert(id, reply);
                        }
                        Outcome::Refused(err) => {
                            debug!(
                                component = "channel",
                                event = "channel.command.refused",
                                kind = %kind,
                                error = %err,
                                "Command refused"
                            );
                            let _ = reply.send(Err(err));
                        }
                    }
                }
                Effect::SettleOpen(result) => {
                    for waiter in self.open_waiters.drain(..) {
                        let _ = waiter.send(result.clone());
                    }
                }
                Effect::SettleAction { id, result } => {
                    if let Some(reply) = self.action_replies.remove(&id) {
                        let _ = reply.send(result);
                    }
                }
                Effect::Emit(event) => {
                    match &event {
                        ChannelEvent::Opened | ChannelEvent::Closed | ChannelEvent::RunInvalidated => {
                            info!(
                                component = "channel",
                                event = "channel.state",
                                kind = %kind,
                                channel_event = ?event,
                                "Channel state changed"
                            );
                        }
                        ChannelEvent::Disconnected => warn!(
                            component = "channel",
                            event = "channel.heartbeat.missed",
                            kind = %kind,
                            "Channel heartbeat unanswered"
                        ),
                        _ => {}
                    }
                    let _ = self.events.send(event);
                }
                Effect::PublishSession => self.view.publish(state.replica.snapshot()),
                Effect::ProtocolError(message) => warn!(
                    component = "channel",
                    event = "channel.protocol",
                    kind = %kind,
                    message = %message,
                    "Channel protocol issue"
                ),
            }
        }
    }

    fn connect(&mut self, epoch: u64) {
        if self.closed_check.is_none() {
            let period = self.config.closed_check_interval;
            self.closed_check = Some(self.ticker(period, || Command::ClosedCheck));
        }
        info!(
            component = "channel",
            event = "channel.connect",
            kind = %self.kind,
            epoch,
            url = %self.url,
            "Opening channel"
        );
        let connecting = self.transport.connect(&self.url);
        let deadline = self.config.connect_timeout;
        let self_tx = self.self_tx.clone();
        tokio::spawn(async move {
            let result = tokio::time::timeout(deadline, connecting)
                .await
                .unwrap_or_else(|_| {
                    Err(StudyError::Timeout(format!(
                        "no connection after {}ms",
                        deadline.as_millis()
                    )))
                });
            if let Some(tx) = self_tx.upgrade() {
                let _ = tx.send(Command::Connected { epoch, result });
            }
        });
    }

    /// Post `input` back into the actor after `delay`.
    fn after(&self, delay: Duration, input: Input) {
        let self_tx = self.self_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tx) = self_tx.upgrade() {
                let _ = tx.send(Command::Timer(input));
            }
        });
    }

    /// Post a command every `period`, first one after a full period.
    fn ticker<F>(&self, period: Duration, command: F) -> JoinHandle<()>
    where
        F: Fn() -> Command + Send + 'static,
    {
        let self_tx = self.self_tx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(tx) = self_tx.upgrade() else { return };
                if tx.send(command()).is_err() {
                    return;
                }
            }
        })
    }

    fn stop_heartbeat(&mut self) {
        if let Some(task) = self.heartbeat.take() {
            task.abort();
        }
    }

    fn publish_status(&self, state: &ChannelState) {
        let status = ChannelStatus {
            phase: state.phase,
            disconnected: state.disconnected,
            versioning: state.versioning,
            busy: state.busy,
            pending_actions: state.pending.len(),
            membership: state.membership.clone(),
        };
        if **self.status.load() != status {
            self.status.store(Arc::new(status));
        }
    }

    fn shutdown(&mut self) {
        self.stop_heartbeat();
        if let Some(task) = self.closed_check.take() {
            task.abort();
        }
        self.conn = None;
        debug!(
            component = "channel",
            event = "channel.actor.stopped",
            kind = %self.kind,
            "Channel actor stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::transport::fake::{FakeTransport, ServerEnd};
    use crate::channel::MemberChange;
    use crate::patch::JsonPatch;
    use serde_json::json;

    fn spawn(kind: ChannelKind, config: ChannelConfig) -> (ChannelHandle, FakeTransport, mpsc::UnboundedReceiver<ServerEnd>) {
        let (transport, servers) = FakeTransport::new();
        let handle = ChannelHandle::spawn(
            kind,
            format!("ws://h/publix/run-1/{}", kind.endpoint()),
            config,
            Arc::new(transport.clone()),
            Arc::new(JsonPatch),
        );
        (handle, transport, servers)
    }

    async fn next_non_ping(server: &mut ServerEnd) -> Value {
        loop {
            let frame = server.next_frame().await.expect("client frame");
            if frame != json!({"heartbeat": "ping"}) {
                return frame;
            }
        }
    }

    async fn wait_for(events: &mut broadcast::Receiver<ChannelEvent>, wanted: ChannelEvent) {
        loop {
            if events.recv().await.expect("event stream") == wanted {
                return;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn open_submit_and_receive_patches() {
        let (batch, _, mut servers) = spawn(ChannelKind::Batch, ChannelConfig::default());

        let opening = {
            let batch = batch.clone();
            tokio::spawn(async move { batch.open().await })
        };
        let mut server = servers.recv().await.expect("connect");
        assert_eq!(server.url, "ws://h/publix/run-1/batch/open");
        server.send(json!({"data": {"a": 1}, "version": 1}));
        opening.await.expect("open task").expect("open");

        assert!(batch.is_open());
        assert_eq!(batch.view().get("a"), Some(json!(1)));

        let submitting = {
            let batch = batch.clone();
            tokio::spawn(async move {
                batch
                    .submit_patches(vec![PatchOp::Add {
                        path: "/b".to_string(),
                        value: json!(2),
                    }])
                    .await
            })
        };
        let frame = next_non_ping(&mut server).await;
        assert_eq!(frame["action"], json!("SESSION"));
        assert_eq!(frame["id"], json!(0));
        assert_eq!(frame["version"], json!(1));

        // the replica only changes once the server broadcasts the patch
        assert_eq!(batch.view().get("b"), None);
        server.send(json!({"action": "SESSION_ACK", "id": 0}));
        submitting.await.expect("submit task").expect("ack");

        let mut events = batch.subscribe();
        server.send(json!({
            "action": "SESSION",
            "patches": [{"op": "add", "path": "/b", "value": 2}],
            "version": 2
        }));
        wait_for(
            &mut events,
            ChannelEvent::SessionChanged {
                op: "add".to_string(),
                path: "/b".to_string(),
            },
        )
        .await;
        assert_eq!(batch.view().get_all(), json!({"a": 1, "b": 2}));
        assert_eq!(batch.view().version(), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn missed_pong_reconnects_with_backoff() {
        let config = ChannelConfig {
            heartbeat_interval: Duration::from_secs(1),
            heartbeat_timeout: Duration::from_secs(1),
            ..ChannelConfig::default()
        };
        let (batch, transport, mut servers) = spawn(ChannelKind::Batch, config);
        let mut events = batch.subscribe();

        let opening = {
            let batch = batch.clone();
            tokio::spawn(async move { batch.open().await })
        };
        let mut first = servers.recv().await.expect("first connect");
        first.send(json!({"data": {}, "version": 1}));
        opening.await.expect("open task").expect("open");

        assert_eq!(first.next_frame().await, Some(json!({"heartbeat": "ping"})));
        wait_for(&mut events, ChannelEvent::Disconnected).await;

        let second = servers.recv().await.expect("reconnect");
        assert_eq!(transport.attempts(), 2);
        second.send(json!({"data": {"x": true}, "version": 5}));
        wait_for(&mut events, ChannelEvent::Connected).await;
        assert_eq!(batch.view().get("x"), Some(json!(true)));
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_connect_gives_up_and_retries() {
        let config = ChannelConfig {
            connect_timeout: Duration::from_secs(3),
            ..ChannelConfig::default()
        };
        let (batch, transport, mut servers) = spawn(ChannelKind::Batch, config);
        let mut events = batch.subscribe();
        transport.hang_next(1);

        let opening = {
            let batch = batch.clone();
            tokio::spawn(async move { batch.open().await })
        };
        assert!(matches!(
            opening.await.expect("open task"),
            Err(StudyError::Transport(_))
        ));
        assert!(!batch.is_opening());

        let server = servers.recv().await.expect("second connect");
        assert_eq!(transport.attempts(), 2);
        server.send(json!({"data": {}, "version": 1}));
        wait_for(&mut events, ChannelEvent::Opened).await;
        assert!(batch.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn policy_close_invalidates_the_run() {
        let (batch, _, mut servers) = spawn(ChannelKind::Batch, ChannelConfig::default());
        let mut events = batch.subscribe();

        let opening = {
            let batch = batch.clone();
            tokio::spawn(async move { batch.open().await })
        };
        let server = servers.recv().await.expect("connect");
        server.send(json!({"data": {}, "version": 1}));
        opening.await.expect("open task").expect("open");

        server.close(Some(1008));
        wait_for(&mut events, ChannelEvent::RunInvalidated).await;
        assert_eq!(batch.open().await, Err(StudyError::InvalidRun));
    }

    #[tokio::test(start_paused = true)]
    async fn group_join_and_messages() {
        let (group, _, mut servers) = spawn(ChannelKind::Group, ChannelConfig::default());
        let mut events = group.subscribe();

        let joining = {
            let group = group.clone();
            tokio::spawn(async move { group.open().await })
        };
        let mut server = servers.recv().await.expect("connect");
        assert!(server.url.ends_with("/group/join"));

        // a second join while the first is in flight never reaches the network
        assert_eq!(
            group.open().await,
            Err(StudyError::AlreadyOpening(ChannelKind::Group))
        );

        server.send(json!({
            "action": "JOINED",
            "memberId": 11,
            "groupResultId": 3,
            "groupState": "STARTED",
            "members": [11, 12],
            "channels": [11, 12],
            "sessionData": {"round": 1},
            "sessionVersion": 4
        }));
        joining.await.expect("join task").expect("joined");
        wait_for(
            &mut events,
            ChannelEvent::Member {
                change: MemberChange::Joined,
                member_id: MemberId::new("11"),
                is_self: true,
            },
        )
        .await;

        let membership = group.membership();
        assert_eq!(membership.member_id, Some(MemberId::new("11")));
        assert!(membership.is_group_open());
        assert_eq!(group.view().get("round"), Some(json!(1)));

        group.send_msg(json!({"hello": "all"})).await.expect("broadcast");
        assert_eq!(next_non_ping(&mut server).await, json!({"msg": {"hello": "all"}}));

        group
            .send_msg_to(MemberId::new("12"), json!("psst"))
            .await
            .expect("direct");
        assert_eq!(
            next_non_ping(&mut server).await,
            json!({"recipient": "12", "msg": "psst"})
        );

        server.close(Some(1000));
        wait_for(&mut events, ChannelEvent::Closed).await;
        assert!(!group.is_open());
        assert_eq!(group.membership(), GroupMembership::default());
    }
}

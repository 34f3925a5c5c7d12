//! Study session facade
//!
//! `StudySession` is the explicit context of one component page inside one
//! study run. It owns the delivery queue, the heartbeat emitter and both
//! channel actors, and it enforces the lifecycle: every way of leaving the
//! page (start another component, end, abort) drains the delivery queue
//! first and navigates exactly once.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};

use bytes::Bytes;
use serde_json::Value;
use studyrun_protocol::{
    BatchProperties, ChannelKind, ComponentProperties, ComponentSummary, InitData, MemberId,
    StudyProperties,
};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channel::transport::{Transport, WsTransport};
use crate::channel::{ChannelEvent, ChannelHandle, GroupBusy, GroupMembership};
use crate::config::ClientConfig;
use crate::delivery::{DeliveryQueue, DeliveryRequest, DeliveryTicket};
use crate::error::{StudyError, StudyResult};
use crate::heartbeat::{HeartbeatEmitter, HeartbeatStart};
use crate::http::{send_expecting_ok, HttpMethod, HttpRequest, HttpResponse, HttpSend, ReqwestSender};
use crate::identity::RunUrls;
use crate::lifecycle::{Exit, Lifecycle, Phase};
use crate::patch::{JsonPatch, PatchApplier};
use crate::store::SharedSession;
use crate::ux::Ux;

/// Result data is sent as text; JSON is serialized first.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultData {
    Text(String),
    Json(Value),
}

impl ResultData {
    fn into_body(self) -> (String, &'static str) {
        match self {
            ResultData::Text(text) => (text, "text/plain; charset=utf-8"),
            ResultData::Json(value) => (value.to_string(), "application/json"),
        }
    }
}

impl From<&str> for ResultData {
    fn from(text: &str) -> Self {
        ResultData::Text(text.to_string())
    }
}

impl From<String> for ResultData {
    fn from(text: String) -> Self {
        ResultData::Text(text)
    }
}

impl From<Value> for ResultData {
    fn from(value: Value) -> Self {
        ResultData::Json(value)
    }
}

/// Which component to start next
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComponentTarget {
    Id(u64),
    Uuid(String),
    /// 1-based position in the component list
    Position(usize),
    Title(String),
    Next,
    Last,
}

impl fmt::Display for ComponentTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComponentTarget::Id(id) => write!(f, "component id {id}"),
            ComponentTarget::Uuid(uuid) => write!(f, "component uuid {uuid}"),
            ComponentTarget::Position(pos) => write!(f, "component at position {pos}"),
            ComponentTarget::Title(title) => write!(f, "component titled {title:?}"),
            ComponentTarget::Next => f.write_str("next component"),
            ComponentTarget::Last => f.write_str("last component"),
        }
    }
}

/// Capabilities a session runs on
#[derive(Clone)]
pub struct SessionDeps {
    pub http: Arc<dyn HttpSend>,
    pub transport: Arc<dyn Transport>,
    pub applier: Arc<dyn PatchApplier>,
    pub ux: Arc<dyn Ux>,
}

impl SessionDeps {
    /// reqwest + tokio-tungstenite + the built-in patch engine
    pub fn live(ux: Arc<dyn Ux>) -> StudyResult<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|err| StudyError::Transport(err.to_string()))?;
        Ok(Self {
            http: Arc::new(ReqwestSender::new(client)),
            transport: Arc::new(WsTransport),
            applier: Arc::new(JsonPatch),
            ux,
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Inner {
    id: Uuid,
    config: ClientConfig,
    urls: RunUrls,
    deps: SessionDeps,
    delivery: DeliveryQueue,
    lifecycle: Mutex<Lifecycle>,
    init_data: OnceLock<InitData>,
    study_session_data: Mutex<Value>,
    heartbeat: Mutex<Option<HeartbeatEmitter>>,
    batch: ChannelHandle,
    group: ChannelHandle,
}

/// Handle to one study session (cheap to Clone).
///
/// Must be created inside a Tokio runtime.
#[derive(Clone)]
pub struct StudySession {
    inner: Arc<Inner>,
}

impl StudySession {
    pub fn new(config: ClientConfig, urls: RunUrls, deps: SessionDeps) -> StudyResult<Self> {
        let batch = ChannelHandle::spawn(
            ChannelKind::Batch,
            urls.channel(ChannelKind::Batch)?,
            config.channel.clone(),
            deps.transport.clone(),
            deps.applier.clone(),
        );
        let group = ChannelHandle::spawn(
            ChannelKind::Group,
            urls.channel(ChannelKind::Group)?,
            config.channel.clone(),
            deps.transport.clone(),
            deps.applier.clone(),
        );
        let delivery = DeliveryQueue::spawn(deps.http.clone());
        let id = Uuid::new_v4();

        info!(
            component = "session",
            event = "session.created",
            session_id = %id,
            run_id = %urls.run_id(),
            component_id = %urls.component_id(),
            "Study session created"
        );

        let inner = Arc::new(Inner {
            id,
            config,
            urls,
            deps,
            delivery,
            lifecycle: Mutex::new(Lifecycle::default()),
            init_data: OnceLock::new(),
            study_session_data: Mutex::new(Value::Object(Default::default())),
            heartbeat: Mutex::new(None),
            batch,
            group,
        });
        watch_batch(Arc::downgrade(&inner), inner.batch.subscribe());
        Ok(Self { inner })
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        lock(&self.inner.lifecycle)
    }

    fn loaded(&self) -> StudyResult<&InitData> {
        self.inner.init_data.get().ok_or(StudyError::NotInitialized)
    }

    // -- initialisation ------------------------------------------------------

    /// Load `initData`, start the heartbeat and open the batch channel.
    ///
    /// The batch channel gets a bounded wait; a channel that is still
    /// reconnecting does not fail initialisation.
    pub async fn init(&self) -> StudyResult<()> {
        if !self.lifecycle().begin_init()? {
            return Ok(());
        }
        if let Err(err) = self.load().await {
            self.lifecycle().init_failed();
            warn!(
                component = "session",
                event = "session.init.failed",
                session_id = %self.inner.id,
                error = %err,
                "Loading init data failed"
            );
            return Err(err);
        }
        self.lifecycle().init_done();

        let wait = self.inner.config.batch_open_wait;
        match tokio::time::timeout(wait, self.inner.batch.open()).await {
            Ok(Ok(())) => debug!(
                component = "session",
                event = "session.batch.opened",
                session_id = %self.inner.id,
                "Batch channel open"
            ),
            Ok(Err(err)) => warn!(
                component = "session",
                event = "session.batch.open_failed",
                session_id = %self.inner.id,
                error = %err,
                "Batch channel not open, reconnecting in background"
            ),
            Err(_) => warn!(
                component = "session",
                event = "session.batch.open_slow",
                session_id = %self.inner.id,
                wait_ms = wait.as_millis() as u64,
                "Batch channel still opening"
            ),
        }

        info!(
            component = "session",
            event = "session.ready",
            session_id = %self.inner.id,
            "Study session ready"
        );
        Ok(())
    }

    async fn load(&self) -> StudyResult<()> {
        let response = self
            .request(HttpMethod::Get, self.inner.urls.init_data())
            .await?;
        let init: InitData = serde_json::from_slice(&response.body)?;
        *lock(&self.inner.study_session_data) = init.parsed_study_session_data();
        let _ = self.inner.init_data.set(init);

        let emitter = HeartbeatEmitter::spawn(
            self.inner.deps.http.clone(),
            HeartbeatStart {
                run_id: self.inner.urls.run_id().to_string(),
                url: self.inner.urls.heartbeat(),
                period: None,
            },
            self.inner.config.heartbeat_period,
        );
        *lock(&self.inner.heartbeat) = Some(emitter);

        if self.inner.config.before_unload_warning {
            self.inner.deps.ux.set_before_unload_warning(true);
        }
        Ok(())
    }

    // -- identity and metadata -----------------------------------------------

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn urls(&self) -> &RunUrls {
        &self.inner.urls
    }

    pub fn phase(&self) -> Phase {
        self.lifecycle().phase()
    }

    pub fn is_run_invalid(&self) -> bool {
        self.lifecycle().is_run_invalid()
    }

    pub fn init_data(&self) -> StudyResult<&InitData> {
        self.loaded()
    }

    pub fn study_result_id(&self) -> StudyResult<Option<u64>> {
        Ok(self.loaded()?.study_result_id)
    }

    pub fn component_result_id(&self) -> StudyResult<Option<u64>> {
        Ok(self.loaded()?.component_result_id)
    }

    pub fn study_properties(&self) -> StudyResult<&StudyProperties> {
        Ok(&self.loaded()?.study_properties)
    }

    pub fn batch_properties(&self) -> StudyResult<&BatchProperties> {
        Ok(&self.loaded()?.batch_properties)
    }

    pub fn component_properties(&self) -> StudyResult<&ComponentProperties> {
        Ok(&self.loaded()?.component_properties)
    }

    pub fn component_list(&self) -> StudyResult<&[ComponentSummary]> {
        Ok(&self.loaded()?.component_list)
    }

    pub fn study_input(&self) -> StudyResult<Value> {
        Ok(self.loaded()?.study_properties.study_input.clone())
    }

    pub fn batch_input(&self) -> StudyResult<Value> {
        Ok(self.loaded()?.batch_properties.batch_input.clone())
    }

    pub fn component_input(&self) -> StudyResult<Value> {
        Ok(self.loaded()?.component_properties.component_input.clone())
    }

    /// 1-based position of the running component
    pub fn component_position(&self) -> StudyResult<usize> {
        let init = self.loaded()?;
        let current = &init.component_properties;
        if current.position > 0 {
            return Ok(current.position);
        }
        init.component_list
            .iter()
            .position(|c| c.id == current.id && c.uuid == current.uuid)
            .map(|index| index + 1)
            .ok_or_else(|| StudyError::UnknownComponent(format!("component id {}", current.id)))
    }

    pub fn is_last_component(&self) -> StudyResult<bool> {
        Ok(self.component_position()? == self.loaded()?.component_list.len())
    }

    /// URL path id of the target component
    fn resolve(&self, target: &ComponentTarget) -> StudyResult<String> {
        let list = &self.loaded()?.component_list;
        let at = |position: usize| position.checked_sub(1).and_then(|i| list.get(i));
        let found = match target {
            ComponentTarget::Id(id) => list.iter().find(|c| c.id == *id),
            ComponentTarget::Uuid(uuid) => list.iter().find(|c| c.uuid == *uuid),
            ComponentTarget::Position(position) => at(*position),
            ComponentTarget::Title(title) => list.iter().find(|c| c.title == *title),
            ComponentTarget::Next => at(self.component_position()? + 1),
            ComponentTarget::Last => list.last(),
        };
        let component = found.ok_or_else(|| StudyError::UnknownComponent(target.to_string()))?;
        if !component.active {
            return Err(StudyError::UnknownComponent(format!("{target} is inactive")));
        }
        Ok(if component.uuid.is_empty() {
            component.id.to_string()
        } else {
            component.uuid.clone()
        })
    }

    // -- leaving the page ----------------------------------------------------

    /// Flush result and study session data, then open `target`.
    ///
    /// Only one component start (or end) can be in progress; a second call
    /// fails at once without touching the network.
    pub async fn start_component(
        &self,
        target: ComponentTarget,
        result_data: Option<ResultData>,
        message: Option<&str>,
    ) -> StudyResult<()> {
        self.lifecycle().ensure_ready()?;
        let url = self
            .inner
            .urls
            .start_component(&self.resolve(&target)?, message);
        self.exit(Exit::StartComponent, result_data, true).await?;
        self.navigate(&url);
        Ok(())
    }

    pub async fn end_study(
        &self,
        result_data: Option<ResultData>,
        successful: bool,
        message: Option<&str>,
    ) -> StudyResult<()> {
        let url = self.inner.urls.end(successful, message);
        self.exit(Exit::End, result_data, true).await?;
        self.navigate(&url);
        Ok(())
    }

    /// End the study in the background, then go to `redirect_url`.
    pub async fn end_study_and_redirect(
        &self,
        redirect_url: &str,
        result_data: Option<ResultData>,
        successful: bool,
        message: Option<&str>,
    ) -> StudyResult<()> {
        let url = self.inner.urls.end(successful, message);
        self.exit(Exit::End, result_data, true).await?;
        if let Err(err) = self.request(HttpMethod::Get, url).await {
            warn!(
                component = "session",
                event = "session.end.failed",
                session_id = %self.inner.id,
                error = %err,
                "End request failed, redirecting anyway"
            );
        }
        self.navigate(redirect_url);
        Ok(())
    }

    /// End the study without leaving the page.
    pub async fn end_study_ajax(
        &self,
        result_data: Option<ResultData>,
        successful: bool,
        message: Option<&str>,
    ) -> StudyResult<()> {
        let url = self.inner.urls.end(successful, message);
        self.exit(Exit::End, result_data, true).await?;
        let result = self.request(HttpMethod::Get, url).await.map(|_| ());
        self.lifecycle().finish();
        result
    }

    pub async fn abort_study(&self, message: Option<&str>) -> StudyResult<()> {
        let url = self.inner.urls.abort(message);
        self.exit(Exit::End, None, false).await?;
        self.navigate(&url);
        Ok(())
    }

    pub async fn abort_study_ajax(&self, message: Option<&str>) -> StudyResult<()> {
        let url = self.inner.urls.abort(message);
        self.exit(Exit::End, None, false).await?;
        let result = self.request(HttpMethod::Get, url).await.map(|_| ());
        self.lifecycle().finish();
        result
    }

    /// Claim the exit, enqueue the final data, drain and release resources.
    async fn exit(
        &self,
        exit: Exit,
        result_data: Option<ResultData>,
        flush_session_data: bool,
    ) -> StudyResult<()> {
        self.lifecycle().begin_exit(exit)?;
        info!(
            component = "session",
            event = "session.exit",
            session_id = %self.inner.id,
            exit = ?exit,
            "Leaving component"
        );
        if let Some(data) = result_data {
            drop(self.enqueue_result_data(HttpMethod::Put, data));
        }
        if flush_session_data {
            drop(self.enqueue_study_session_data());
        }
        self.drain().await;
        self.release().await;
        Ok(())
    }

    /// Wait for the delivery queue; show the overlay if that takes a while.
    async fn drain(&self) {
        let idle = self.inner.delivery.idle();
        tokio::pin!(idle);
        if tokio::time::timeout(self.inner.config.overlay_delay, &mut idle)
            .await
            .is_err()
        {
            let ux = &self.inner.deps.ux;
            ux.show_overlay(&self.inner.config.overlay_text);
            idle.await;
            ux.hide_overlay();
        }
    }

    async fn release(&self) {
        let heartbeat = lock(&self.inner.heartbeat).take();
        if let Some(heartbeat) = heartbeat {
            heartbeat.stop();
        }
        self.inner.deps.ux.set_before_unload_warning(false);
        let _ = self.inner.batch.terminate().await;
        let _ = self.inner.group.terminate().await;
    }

    fn navigate(&self, url: &str) {
        info!(
            component = "session",
            event = "session.navigate",
            session_id = %self.inner.id,
            url,
            "Navigating away"
        );
        self.lifecycle().finish();
        self.inner.deps.ux.navigate(url);
    }

    async fn invalidate(&self) {
        self.lifecycle().invalidate();
        warn!(
            component = "session",
            event = "session.run_invalid",
            session_id = %self.inner.id,
            run_id = %self.inner.urls.run_id(),
            "Study run is invalid"
        );
        let heartbeat = lock(&self.inner.heartbeat).take();
        if let Some(heartbeat) = heartbeat {
            heartbeat.stop();
        }
        self.inner.deps.ux.set_before_unload_warning(false);
        self.inner.deps.ux.show_invalid_run();
        let _ = self.inner.group.terminate().await;
    }

    // -- result data, files and log --------------------------------------------

    /// Replace the component's result data.
    pub async fn submit_result_data(&self, data: impl Into<ResultData>) -> StudyResult<()> {
        self.lifecycle().ensure_ready()?;
        self.enqueue_result_data(HttpMethod::Put, data.into()).await?;
        Ok(())
    }

    pub async fn append_result_data(&self, data: impl Into<ResultData>) -> StudyResult<()> {
        self.lifecycle().ensure_ready()?;
        self.enqueue_result_data(HttpMethod::Post, data.into()).await?;
        Ok(())
    }

    pub async fn upload_result_file(&self, name: &str, bytes: impl Into<Bytes>) -> StudyResult<()> {
        self.lifecycle().ensure_ready()?;
        let request = HttpRequest::new(
            HttpMethod::Post,
            self.inner.urls.file(name),
            self.inner.config.http.timeout,
        )
        .file(name, bytes.into());
        self.enqueue(request).await?;
        Ok(())
    }

    /// Fetch a result file directly, bypassing the delivery queue.
    pub async fn download_result_file(&self, name: &str, component_id: Option<&str>) -> StudyResult<Bytes> {
        self.lifecycle().ensure_ready()?;
        let response = self
            .request(HttpMethod::Get, self.inner.urls.file_download(name, component_id))
            .await?;
        Ok(response.body)
    }

    /// Fire-and-forget log line stored with the component result.
    pub fn log(&self, message: &str) -> StudyResult<()> {
        self.lifecycle().ensure_ready()?;
        let request = HttpRequest::new(
            HttpMethod::Post,
            self.inner.urls.log(),
            self.inner.config.http.timeout,
        )
        .text(message, "text/plain; charset=utf-8");
        drop(self.enqueue(request));
        Ok(())
    }

    fn enqueue(&self, request: HttpRequest) -> DeliveryTicket {
        self.inner
            .delivery
            .enqueue(DeliveryRequest::new(request, &self.inner.config.http))
    }

    fn enqueue_result_data(&self, method: HttpMethod, data: ResultData) -> DeliveryTicket {
        let (content, content_type) = data.into_body();
        let request = HttpRequest::new(method, self.inner.urls.result_data(), self.inner.config.http.timeout)
            .text(content, content_type);
        self.enqueue(request)
    }

    fn enqueue_study_session_data(&self) -> DeliveryTicket {
        let body = lock(&self.inner.study_session_data).to_string();
        let request = HttpRequest::new(
            HttpMethod::Post,
            self.inner.urls.study_session_data(),
            self.inner.config.http.timeout,
        )
        .text(body, "application/json");
        self.enqueue(request)
    }

    async fn request(&self, method: HttpMethod, url: String) -> StudyResult<HttpResponse> {
        let request = HttpRequest::new(method, url, self.inner.config.http.timeout);
        Ok(send_expecting_ok(self.inner.deps.http.as_ref(), request).await?)
    }

    // -- study session data ----------------------------------------------------

    pub fn study_session_data(&self) -> Value {
        lock(&self.inner.study_session_data).clone()
    }

    /// Replace the study session data locally and send it to the server.
    pub async fn set_study_session_data(&self, value: Value) -> StudyResult<()> {
        self.lifecycle().ensure_ready()?;
        if !value.is_object() {
            return Err(StudyError::Json(
                "study session data must be a JSON object".to_string(),
            ));
        }
        *lock(&self.inner.study_session_data) = value;
        self.enqueue_study_session_data().await?;
        Ok(())
    }

    // -- batch and group channels ------------------------------------------------

    pub fn batch_channel(&self) -> &ChannelHandle {
        &self.inner.batch
    }

    pub fn group_channel(&self) -> &ChannelHandle {
        &self.inner.group
    }

    pub fn batch_session(&self) -> SharedSession {
        SharedSession::new(self.inner.batch.clone())
    }

    pub fn group_session(&self) -> SharedSession {
        SharedSession::new(self.inner.group.clone())
    }

    pub async fn join_group(&self) -> StudyResult<()> {
        self.lifecycle().ensure_ready()?;
        self.inner.group.open().await
    }

    /// Tell the server this member leaves, then close the group channel.
    pub async fn leave_group(&self) -> StudyResult<()> {
        self.lifecycle().ensure_ready()?;
        let group = &self.inner.group;
        if !group.membership().is_joined() {
            return Err(StudyError::NotJoined);
        }
        group.set_busy(Some(GroupBusy::Leaving)).await?;
        let left = self
            .request(HttpMethod::Get, self.inner.urls.group_leave())
            .await;
        let closed = group.close().await;
        group.set_busy(None).await?;
        left?;
        closed
    }

    /// Ask the server for another group; the new membership arrives over the channel.
    pub async fn reassign_group(&self) -> StudyResult<()> {
        self.lifecycle().ensure_ready()?;
        let group = &self.inner.group;
        if !group.membership().is_joined() {
            return Err(StudyError::NotJoined);
        }
        group.set_busy(Some(GroupBusy::Reassigning)).await?;
        let reassigned = self
            .request(HttpMethod::Get, self.inner.urls.group_reassign())
            .await;
        group.set_busy(None).await?;
        reassigned.map(|_| ())
    }

    pub async fn set_group_fixed(&self) -> StudyResult<()> {
        self.lifecycle().ensure_ready()?;
        self.inner.group.set_fixed().await
    }

    pub async fn send_group_msg(&self, msg: Value) -> StudyResult<()> {
        self.lifecycle().ensure_ready()?;
        self.inner.group.send_msg(msg).await
    }

    pub async fn send_group_msg_to(&self, recipient: MemberId, msg: Value) -> StudyResult<()> {
        self.lifecycle().ensure_ready()?;
        self.inner.group.send_msg_to(recipient, msg).await
    }

    pub fn group_membership(&self) -> GroupMembership {
        self.inner.group.membership()
    }

    pub fn is_max_active_member_reached(&self) -> bool {
        let max = self
            .loaded()
            .ok()
            .and_then(|init| init.batch_properties.max_active_members);
        self.group_membership().is_max_active_member_reached(max)
    }

    pub fn is_max_active_member_open(&self) -> bool {
        let max = self
            .loaded()
            .ok()
            .and_then(|init| init.batch_properties.max_active_members);
        self.group_membership().is_max_active_member_open(max)
    }
}

/// Turn a server-side run invalidation on the batch channel into a
/// session-wide terminal state.
fn watch_batch(inner: Weak<Inner>, mut events: broadcast::Receiver<ChannelEvent>) {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ChannelEvent::RunInvalidated) => {
                    if let Some(inner) = inner.upgrade() {
                        StudySession { inner }.invalidate().await;
                    }
                    return;
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    });
}

//! Session registry: reference-counted sandbox lifetimes per page instance.
//!
//! Each [`PageId`] with at least one attached stream owns a session. The
//! first attach provisions the sandbox (store plus one process per watched or
//! interactive widget), the last detach tears it down. All lifecycle
//! transitions of a session run under that session's async lock, so attach,
//! detach and dispatch for the same page instance are serialized while
//! different page instances proceed independently.
//!
//! Sandbox output never takes the lifecycle lock: it goes through the
//! session's [`Room`], which fans updates out to the attached streams with
//! non-blocking sends. A stream that cannot keep up is dropped from the room,
//! which ends the client's channel; the gateway then detaches it.

use crate::catalog::{Catalog, Page, Widget, WidgetKind};
use crate::error::RegistryError;
use crate::executor::{ExecutorError, Origin, ProcessEvent, ProcessSpec, SandboxExecutor, WatchEvent};
use crate::ids::{image_name, resource_name, PageId, WidgetId};
use crate::protocol::{Payload, Update};
use bytes::Bytes;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Number of watcher error lines kept per widget.
const ERROR_WINDOW: usize = 5;
/// Bytes of recent terminal output replayed to a stream that joins late.
const TERMINAL_BACKLOG: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Prefix of volume and container names.
    pub resource_prefix: String,
    /// Prefix of per-page image names.
    pub image_prefix: String,
    /// Image running the file monitor for text, image and editor widgets.
    pub monitor_image: String,
    /// Bytes of output retained per button execution.
    pub button_output_limit: usize,
    /// Outbound queue depth per attached stream.
    pub stream_buffer: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            resource_prefix: "playground".to_string(),
            image_prefix: "playground-page".to_string(),
            monitor_image: "playground-monitor".to_string(),
            button_output_limit: 1024 * 1024,
            stream_buffer: 256,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(u64);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream-{}", self.0)
    }
}

/// A registered client stream. Dropping `updates` does not detach; callers
/// must call [`SessionRegistry::detach`] (see [`DetachGuard`]).
#[derive(Debug)]
pub struct Attachment {
    pub page_id: PageId,
    pub stream_id: StreamId,
    pub updates: mpsc::Receiver<Update>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub page_url: String,
    pub session_id: String,
    pub streams: usize,
    pub state: &'static str,
    pub active_secs: u64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Output of a running button command. Exists only while the command runs.
#[derive(Debug, Default)]
struct ButtonExecution {
    records: Vec<(Origin, Bytes)>,
    retained: usize,
    truncated: bool,
}

impl ButtonExecution {
    /// Retains as much of `chunk` as the limit allows and returns the part
    /// that was kept.
    fn record(&mut self, origin: Origin, chunk: Bytes, limit: usize) -> Option<Bytes> {
        if self.truncated {
            return None;
        }
        let room = limit.saturating_sub(self.retained);
        let kept = if chunk.len() > room {
            self.truncated = true;
            chunk.slice(..room)
        } else {
            chunk
        };
        if kept.is_empty() {
            return None;
        }
        self.retained += kept.len();
        self.records.push((origin, kept.clone()));
        Some(kept)
    }
}

/// Most recent output of a terminal, at most [`TERMINAL_BACKLOG`] bytes.
#[derive(Debug, Default)]
struct TerminalLog {
    chunks: VecDeque<Bytes>,
    len: usize,
}

impl TerminalLog {
    fn push(&mut self, chunk: Bytes) {
        let chunk = if chunk.len() > TERMINAL_BACKLOG {
            chunk.slice(chunk.len() - TERMINAL_BACKLOG..)
        } else {
            chunk
        };
        self.len += chunk.len();
        self.chunks.push_back(chunk);
        while self.len > TERMINAL_BACKLOG {
            match self.chunks.pop_front() {
                Some(old) => self.len -= old.len(),
                None => break,
            }
        }
    }
}

#[derive(Default)]
struct RoomState {
    streams: BTreeMap<StreamId, mpsc::Sender<Update>>,
    /// Latest state of watched widgets, replayed to late joiners.
    snapshots: BTreeMap<usize, Update>,
    terminals: BTreeMap<usize, TerminalLog>,
    buttons: BTreeMap<usize, ButtonExecution>,
}

impl RoomState {
    fn broadcast(&mut self, update: &Update) {
        let mut dropped = Vec::new();
        for (id, tx) in &self.streams {
            if let Err(e) = tx.try_send(update.clone()) {
                dropped.push((*id, matches!(e, mpsc::error::TrySendError::Full(_))));
            }
        }
        for (id, slow) in dropped {
            self.streams.remove(&id);
            if slow {
                warn!(stream_id = %id, "Client cannot keep up, disconnecting");
            } else {
                debug!(stream_id = %id, "Client stream closed");
            }
        }
    }
}

/// Fan-out point of one session.
#[derive(Default)]
struct Room {
    state: Mutex<RoomState>,
}

impl Room {
    fn join(&self, id: StreamId, tx: mpsc::Sender<Update>) {
        let mut state = lock(&self.state);
        let mut replay: Vec<Update> = state.snapshots.values().cloned().collect();
        for (index, log) in &state.terminals {
            replay.extend(log.chunks.iter().map(|chunk| Update::terminal(*index, chunk)));
        }
        for (index, execution) in &state.buttons {
            replay.extend(
                execution
                    .records
                    .iter()
                    .map(|(origin, chunk)| Update::button_chunk(*index, *origin, chunk)),
            );
        }
        for update in replay {
            if tx.try_send(update).is_err() {
                warn!(stream_id = %id, "Client cannot take the initial state, disconnecting");
                return;
            }
        }
        state.streams.insert(id, tx);
    }

    fn leave(&self, id: StreamId) {
        lock(&self.state).streams.remove(&id);
    }

    fn broadcast(&self, update: Update) {
        lock(&self.state).broadcast(&update);
    }

    fn publish_snapshot(&self, update: Update) {
        let mut state = lock(&self.state);
        state.broadcast(&update);
        state.snapshots.insert(update.widget_index, update);
    }

    fn terminal_output(&self, index: usize, chunk: Bytes) {
        let mut state = lock(&self.state);
        state.broadcast(&Update::terminal(index, &chunk));
        state.terminals.entry(index).or_default().push(chunk);
    }

    /// Reports an editor failure without wiping the contents clients show.
    fn editor_error(&self, index: usize, message: &str) {
        let mut state = lock(&self.state);
        let mut update = state
            .snapshots
            .get(&index)
            .cloned()
            .unwrap_or_else(|| Update::editor(index, b"", Vec::new()));
        if let Payload::Editor(contents) = &mut update.payload {
            contents.errors.push(message.to_string());
        }
        state.broadcast(&update);
    }

    fn begin_button(&self, index: usize) -> Result<(), RegistryError> {
        let mut state = lock(&self.state);
        if state.buttons.contains_key(&index) {
            return Err(RegistryError::AlreadyRunning(index));
        }
        state.buttons.insert(index, ButtonExecution::default());
        Ok(())
    }

    fn button_output(&self, index: usize, origin: Origin, chunk: Bytes, limit: usize) {
        let mut state = lock(&self.state);
        let Some(execution) = state.buttons.get_mut(&index) else {
            return;
        };
        if let Some(kept) = execution.record(origin, chunk, limit) {
            state.broadcast(&Update::button_chunk(index, origin, &kept));
        }
    }

    /// Ends a button execution. The entry is removed before the completion
    /// event goes out, so a client reacting to it can click again.
    fn finish_button(&self, index: usize, exit_code: Option<i32>) {
        let mut state = lock(&self.state);
        let truncated = state
            .buttons
            .remove(&index)
            .map(|execution| execution.truncated)
            .unwrap_or(false);
        state.broadcast(&Update::button_finished(index, exit_code, truncated));
    }

    fn fail_button(&self, index: usize, message: String) {
        let mut state = lock(&self.state);
        state.buttons.remove(&index);
        state.broadcast(&Update::button_error(index, message));
    }

    fn reset(&self) {
        let mut state = lock(&self.state);
        state.snapshots.clear();
        state.terminals.clear();
        state.buttons.clear();
    }

    fn close(&self) {
        lock(&self.state).streams.clear();
    }
}

struct ActiveSandbox {
    store: String,
    cancel: CancellationToken,
    tasks: TaskTracker,
    /// Input channels of editor and terminal widgets, by widget index.
    inputs: HashMap<usize, mpsc::UnboundedSender<Bytes>>,
    since: Instant,
}

enum SandboxState {
    Inactive,
    Active(ActiveSandbox),
}

struct Lifecycle {
    /// Set once the incarnation has been torn down (or failed to start). A
    /// retired session is no longer in the registry table.
    retired: bool,
    streams: HashSet<StreamId>,
    sandbox: SandboxState,
}

impl Lifecycle {
    fn check(&self) {
        debug_assert_eq!(
            matches!(self.sandbox, SandboxState::Active(_)),
            !self.streams.is_empty(),
            "sandbox must be active exactly while streams are attached"
        );
    }

    fn active(&self) -> Option<&ActiveSandbox> {
        match &self.sandbox {
            SandboxState::Active(active) if !self.retired => Some(active),
            _ => None,
        }
    }
}

struct Session {
    page_id: PageId,
    page: Arc<Page>,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
    room: Arc<Room>,
}

pub struct SessionRegistry {
    catalog: Arc<Catalog>,
    executor: Arc<dyn SandboxExecutor>,
    config: RegistryConfig,
    sessions: Mutex<HashMap<PageId, Arc<Session>>>,
    next_stream: AtomicU64,
}

impl SessionRegistry {
    pub fn new(
        catalog: Arc<Catalog>,
        executor: Arc<dyn SandboxExecutor>,
        config: RegistryConfig,
    ) -> Self {
        Self {
            catalog,
            executor,
            config,
            sessions: Mutex::new(HashMap::new()),
            next_stream: AtomicU64::new(1),
        }
    }

    pub fn catalog(&self) -> Arc<Catalog> {
        self.catalog.clone()
    }

    fn interactive_page(&self, url: &str) -> Result<Arc<Page>, RegistryError> {
        let page = self
            .catalog
            .get_page(url)
            .ok_or_else(|| RegistryError::PageNotFound(url.to_string()))?;
        if !page.is_interactive {
            return Err(RegistryError::NotInteractive(url.to_string()));
        }
        Ok(page)
    }

    /// Resolves the widget addressed by `widget_id` and checks its type.
    fn widget(&self, widget_id: &WidgetId, expected: WidgetKind) -> Result<Widget, RegistryError> {
        let url = widget_id.page().url();
        let page = self.interactive_page(url)?;
        let widget = page
            .widget(widget_id.index())
            .ok_or_else(|| RegistryError::UnknownWidget {
                url: url.to_string(),
                index: widget_id.index(),
            })?;
        if widget.kind() != expected {
            return Err(RegistryError::WrongWidgetType {
                index: widget_id.index(),
                expected,
                actual: widget.kind(),
            });
        }
        Ok(widget.clone())
    }

    fn entry(&self, page_id: &PageId, page: &Arc<Page>) -> Arc<Session> {
        lock(&self.sessions)
            .entry(page_id.clone())
            .or_insert_with(|| {
                Arc::new(Session {
                    page_id: page_id.clone(),
                    page: page.clone(),
                    lifecycle: tokio::sync::Mutex::new(Lifecycle {
                        retired: false,
                        streams: HashSet::new(),
                        sandbox: SandboxState::Inactive,
                    }),
                    room: Arc::new(Room::default()),
                })
            })
            .clone()
    }

    fn existing(&self, page_id: &PageId) -> Option<Arc<Session>> {
        lock(&self.sessions).get(page_id).cloned()
    }

    /// Drops `session` from the table unless a newer incarnation replaced it.
    fn retire(&self, session: &Arc<Session>) {
        let mut sessions = lock(&self.sessions);
        if sessions
            .get(&session.page_id)
            .is_some_and(|current| Arc::ptr_eq(current, session))
        {
            sessions.remove(&session.page_id);
        }
    }

    /// Registers a new stream for `page_id`, provisioning the sandbox when it
    /// is the first one. Returns once the sandbox is ready; on failure no
    /// stream is registered.
    ///
    /// The transition runs on its own task. A caller that gives up while the
    /// sandbox is being provisioned leaves the session consistent: the
    /// stream it would have received is detached again.
    pub async fn attach(self: &Arc<Self>, page_id: &PageId) -> Result<Attachment, RegistryError> {
        let page = self.interactive_page(page_id.url())?;
        let (tx, rx) = oneshot::channel();
        let registry = self.clone();
        let target = page_id.clone();
        tokio::spawn(async move {
            let result = registry.register(&target, page).await.map(|attachment| {
                let guard = DetachGuard::new(
                    registry.clone(),
                    attachment.page_id.clone(),
                    attachment.stream_id,
                );
                (attachment, guard)
            });
            // Undelivered results drop their guard, which detaches the stream.
            let _ = tx.send(result);
        });
        match rx.await {
            Ok(Ok((attachment, guard))) => {
                guard.disarm();
                Ok(attachment)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(RegistryError::SandboxUnavailable(ExecutorError::Unavailable(
                "attach task failed".to_string(),
            ))),
        }
    }

    async fn register(&self, page_id: &PageId, page: Arc<Page>) -> Result<Attachment, RegistryError> {
        loop {
            let session = self.entry(page_id, &page);
            let mut lifecycle = session.lifecycle.lock().await;
            if lifecycle.retired {
                // Torn down while we waited for the lock; start a new incarnation.
                continue;
            }

            if lifecycle.streams.is_empty() {
                match self.activate(&session).await {
                    Ok(active) => lifecycle.sandbox = SandboxState::Active(active),
                    Err(e) => {
                        warn!(page_id = %page_id, "Failed to activate session: {}", e);
                        lifecycle.retired = true;
                        self.retire(&session);
                        return Err(e);
                    }
                }
            }

            let stream_id = StreamId(self.next_stream.fetch_add(1, Ordering::Relaxed));
            let (tx, rx) = mpsc::channel(self.config.stream_buffer.max(1));
            session.room.join(stream_id, tx);
            lifecycle.streams.insert(stream_id);
            lifecycle.check();
            info!(
                page_id = %page_id,
                stream_id = %stream_id,
                streams = lifecycle.streams.len(),
                "Stream attached"
            );
            return Ok(Attachment {
                page_id: page_id.clone(),
                stream_id,
                updates: rx,
            });
        }
    }

    /// Removes a stream; the last one out tears the sandbox down. Unknown
    /// streams are ignored.
    pub async fn detach(&self, page_id: &PageId, stream_id: StreamId) {
        let Some(session) = self.existing(page_id) else {
            return;
        };
        let mut lifecycle = session.lifecycle.lock().await;
        if lifecycle.retired || !lifecycle.streams.remove(&stream_id) {
            return;
        }
        session.room.leave(stream_id);
        info!(
            page_id = %page_id,
            stream_id = %stream_id,
            streams = lifecycle.streams.len(),
            "Stream detached"
        );

        if lifecycle.streams.is_empty() {
            if let SandboxState::Active(active) =
                std::mem::replace(&mut lifecycle.sandbox, SandboxState::Inactive)
            {
                self.deactivate(&session, active).await;
            }
            lifecycle.retired = true;
            self.retire(&session);
        }
        lifecycle.check();
    }

    async fn activate(&self, session: &Session) -> Result<ActiveSandbox, RegistryError> {
        let store = resource_name(&self.config.resource_prefix, &session.page_id);
        self.executor
            .create_store(&store)
            .await
            .map_err(RegistryError::SandboxUnavailable)?;

        let cancel = CancellationToken::new();
        let tasks = TaskTracker::new();
        let mut inputs = HashMap::new();
        for (index, widget) in session.page.widgets.iter().enumerate() {
            match self
                .start_widget(session, &store, index, widget, &cancel, &tasks)
                .await
            {
                Ok(Some(input)) => {
                    inputs.insert(index, input);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(page_id = %session.page_id, widget_index = index, "Failed to start widget: {}", e);
                    cancel.cancel();
                    tasks.close();
                    tasks.wait().await;
                    session.room.reset();
                    if let Err(e) = self.executor.remove_store(&store).await {
                        warn!(store = %store, "Failed to remove store after failed activation: {}", e);
                    }
                    return Err(RegistryError::SandboxUnavailable(e));
                }
            }
        }

        info!(page_id = %session.page_id, store = %store, "Session activated");
        Ok(ActiveSandbox {
            store,
            cancel,
            tasks,
            inputs,
            since: Instant::now(),
        })
    }

    /// Stops every process of the session, waits until they are gone, then
    /// removes the store.
    async fn deactivate(&self, session: &Session, active: ActiveSandbox) {
        let ActiveSandbox {
            store,
            cancel,
            tasks,
            inputs,
            since,
        } = active;
        drop(inputs);
        cancel.cancel();
        tasks.close();
        tasks.wait().await;
        session.room.reset();
        if let Err(e) = self.executor.remove_store(&store).await {
            warn!(store = %store, "Failed to remove store: {}", e);
        }
        info!(
            page_id = %session.page_id,
            store = %store,
            active_secs = since.elapsed().as_secs(),
            "Session deactivated"
        );
    }

    fn process_spec(&self, store: &str, widget_id: &WidgetId, image: String) -> ProcessSpec {
        ProcessSpec {
            store: store.to_string(),
            image,
            container: resource_name(&self.config.resource_prefix, widget_id),
        }
    }

    /// Starts the long-lived process of a widget, if it has one. Returns the
    /// widget's input channel for editors and terminals.
    async fn start_widget(
        &self,
        session: &Session,
        store: &str,
        index: usize,
        widget: &Widget,
        cancel: &CancellationToken,
        tasks: &TaskTracker,
    ) -> Result<Option<mpsc::UnboundedSender<Bytes>>, ExecutorError> {
        let widget_id = session.page_id.widget(index);
        let room = session.room.clone();
        match widget {
            Widget::Text { file } | Widget::Image { file } | Widget::Editor { file } => {
                let writable = matches!(widget, Widget::Editor { .. });
                let spec =
                    self.process_spec(store, &widget_id, self.config.monitor_image.clone());
                let watched = self
                    .executor
                    .run_watched(spec, file, writable, cancel.child_token())
                    .await?;
                tasks.spawn(forward_watch(room, index, widget.kind(), watched.events));
                Ok(watched.input)
            }
            Widget::Terminal { working_directory } => {
                let image = image_name(&self.config.image_prefix, session.page_id.url());
                let spec = self.process_spec(store, &widget_id, image);
                let terminal_cancel = cancel.child_token();
                let interactive = self
                    .executor
                    .run_interactive(spec, working_directory, terminal_cancel.clone())
                    .await?;
                tasks.spawn(forward_terminal(
                    room,
                    index,
                    interactive.output,
                    terminal_cancel,
                ));
                Ok(Some(interactive.input))
            }
            Widget::Markdown { .. } | Widget::Button { .. } => Ok(None),
        }
    }

    /// Starts the widget's command unless it is already running. Output is
    /// streamed to every attached client; the call returns once the command
    /// has been handed to a worker task.
    pub async fn dispatch_button_click(&self, widget_id: &WidgetId) -> Result<(), RegistryError> {
        let command = match self.widget(widget_id, WidgetKind::Button)? {
            Widget::Button { command, .. } => command,
            other => {
                return Err(RegistryError::WrongWidgetType {
                    index: widget_id.index(),
                    expected: WidgetKind::Button,
                    actual: other.kind(),
                })
            }
        };
        let page_id = widget_id.page();
        let session = self
            .existing(page_id)
            .ok_or_else(|| RegistryError::SessionNotActive(page_id.to_string()))?;
        let lifecycle = session.lifecycle.lock().await;
        let active = lifecycle
            .active()
            .ok_or_else(|| RegistryError::SessionNotActive(page_id.to_string()))?;

        let index = widget_id.index();
        session.room.begin_button(index)?;
        info!(widget_id = %widget_id, command = %command, "Button clicked");

        let image = image_name(&self.config.image_prefix, page_id.url());
        let run = ButtonRun {
            executor: self.executor.clone(),
            room: session.room.clone(),
            index,
            spec: self.process_spec(&active.store, widget_id, image),
            command,
            cancel: active.cancel.child_token(),
            limit: self.config.button_output_limit,
        };
        active.tasks.spawn(run.run());
        Ok(())
    }

    pub async fn dispatch_editor_write(
        &self,
        widget_id: &WidgetId,
        contents: Bytes,
    ) -> Result<(), RegistryError> {
        self.widget(widget_id, WidgetKind::Editor)?;
        self.forward_input(widget_id, contents).await
    }

    pub async fn dispatch_terminal_input(
        &self,
        widget_id: &WidgetId,
        data: Bytes,
    ) -> Result<(), RegistryError> {
        self.widget(widget_id, WidgetKind::Terminal)?;
        self.forward_input(widget_id, data).await
    }

    /// Queues bytes on a widget's input channel. Queuing happens under the
    /// session lock, so writes arrive in the order they were accepted.
    async fn forward_input(&self, widget_id: &WidgetId, data: Bytes) -> Result<(), RegistryError> {
        let page_id = widget_id.page();
        let session = self
            .existing(page_id)
            .ok_or_else(|| RegistryError::SessionNotActive(page_id.to_string()))?;
        let lifecycle = session.lifecycle.lock().await;
        let active = lifecycle
            .active()
            .ok_or_else(|| RegistryError::SessionNotActive(page_id.to_string()))?;

        let index = widget_id.index();
        let delivered = active
            .inputs
            .get(&index)
            .is_some_and(|input| input.send(data).is_ok());
        if !delivered {
            warn!(widget_id = %widget_id, "Widget process is gone, input dropped");
            match session.page.widget(index).map(Widget::kind) {
                Some(WidgetKind::Terminal) => session
                    .room
                    .broadcast(Update::terminal_error(index, "terminal is not running")),
                _ => session.room.editor_error(index, "editor is not running"),
            }
        } else {
            debug!(widget_id = %widget_id, "Input forwarded");
        }
        Ok(())
    }

    /// Sends `update` to every stream attached to `page_id`.
    pub fn broadcast(&self, page_id: &PageId, update: Update) {
        if let Some(session) = self.existing(page_id) {
            session.room.broadcast(update);
        }
    }

    pub async fn is_active(&self, page_id: &PageId) -> bool {
        match self.existing(page_id) {
            Some(session) => session.lifecycle.lock().await.active().is_some(),
            None => false,
        }
    }

    pub async fn stream_count(&self, page_id: &PageId) -> usize {
        match self.existing(page_id) {
            Some(session) => {
                let lifecycle = session.lifecycle.lock().await;
                if lifecycle.retired {
                    0
                } else {
                    lifecycle.streams.len()
                }
            }
            None => 0,
        }
    }

    /// Snapshot of the session table. Sessions in the middle of a transition
    /// are reported as such instead of being waited for.
    pub fn sessions(&self) -> Vec<SessionInfo> {
        let sessions: Vec<Arc<Session>> = lock(&self.sessions).values().cloned().collect();
        let mut infos: Vec<SessionInfo> = sessions
            .iter()
            .map(|session| {
                let mut info = SessionInfo {
                    page_url: session.page_id.url().to_string(),
                    session_id: session.page_id.session().to_string(),
                    streams: 0,
                    state: "transitioning",
                    active_secs: 0,
                };
                if let Ok(lifecycle) = session.lifecycle.try_lock() {
                    if !lifecycle.retired {
                        info.streams = lifecycle.streams.len();
                    }
                    if let Some(active) = lifecycle.active() {
                        info.state = "active";
                        info.active_secs = active.since.elapsed().as_secs();
                    } else {
                        info.state = "inactive";
                    }
                }
                info
            })
            .collect();
        infos.sort_by(|a, b| (&a.page_url, &a.session_id).cmp(&(&b.page_url, &b.session_id)));
        infos
    }

    /// Tears down every session. Attached streams are closed.
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<Session>> = lock(&self.sessions).drain().map(|(_, s)| s).collect();
        for session in sessions {
            let mut lifecycle = session.lifecycle.lock().await;
            if lifecycle.retired {
                continue;
            }
            session.room.close();
            lifecycle.streams.clear();
            if let SandboxState::Active(active) =
                std::mem::replace(&mut lifecycle.sandbox, SandboxState::Inactive)
            {
                self.deactivate(&session, active).await;
            }
            lifecycle.retired = true;
        }
        info!("All sessions shut down");
    }
}

/// Detaches a stream when dropped. Held by the gateway for the lifetime of a
/// client connection so abrupt disconnects are cleaned up too.
pub struct DetachGuard {
    registry: Arc<SessionRegistry>,
    page_id: PageId,
    stream_id: StreamId,
    armed: bool,
}

impl DetachGuard {
    pub fn new(registry: Arc<SessionRegistry>, page_id: PageId, stream_id: StreamId) -> Self {
        Self {
            registry,
            page_id,
            stream_id,
            armed: true,
        }
    }

    /// Hands responsibility for the stream back to the holder.
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for DetachGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        debug!(page_id = %self.page_id, stream_id = %self.stream_id, "Releasing stream");
        let registry = self.registry.clone();
        let page_id = self.page_id.clone();
        let stream_id = self.stream_id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { registry.detach(&page_id, stream_id).await });
            }
            Err(_) => warn!(page_id = %page_id, stream_id = %stream_id, "No runtime to detach stream"),
        }
    }
}

struct ButtonRun {
    executor: Arc<dyn SandboxExecutor>,
    room: Arc<Room>,
    index: usize,
    spec: ProcessSpec,
    command: String,
    cancel: CancellationToken,
    limit: usize,
}

impl ButtonRun {
    async fn run(self) {
        let container = self.spec.container.clone();
        let mut events = match self
            .executor
            .run_once(self.spec, &self.command, self.cancel)
            .await
        {
            Ok(events) => events,
            Err(e) => {
                warn!(container = %container, "Button command failed to start: {}", e);
                self.room.fail_button(self.index, e.to_string());
                return;
            }
        };

        let mut exit_code = None;
        while let Some(event) = events.recv().await {
            match event {
                ProcessEvent::Output { origin, chunk } => {
                    self.room.button_output(self.index, origin, chunk, self.limit)
                }
                ProcessEvent::Exited(code) => exit_code = code,
            }
        }
        info!(container = %container, exit_code = ?exit_code, "Button command finished");
        self.room.finish_button(self.index, exit_code);
    }
}

async fn forward_watch(
    room: Arc<Room>,
    index: usize,
    kind: WidgetKind,
    mut events: mpsc::Receiver<WatchEvent>,
) {
    let mut contents: Option<Bytes> = None;
    let mut errors: VecDeque<String> = VecDeque::with_capacity(ERROR_WINDOW);
    while let Some(event) = events.recv().await {
        match event {
            WatchEvent::Contents(next) => {
                if contents.as_ref() == Some(&next) {
                    continue;
                }
                contents = Some(next);
            }
            WatchEvent::Error(message) => {
                warn!(widget_index = index, "Watcher error: {}", message);
                if errors.len() == ERROR_WINDOW {
                    errors.pop_front();
                }
                errors.push_back(message);
            }
        }
        let current = contents.as_deref().unwrap_or_default();
        let errors: Vec<String> = errors.iter().cloned().collect();
        let update = match kind {
            WidgetKind::Image => Update::image(index, current, errors),
            WidgetKind::Editor => Update::editor(index, current, errors),
            _ => Update::text(index, current, errors),
        };
        room.publish_snapshot(update);
    }
    debug!(widget_index = index, "Watcher stream ended");
}

async fn forward_terminal(
    room: Arc<Room>,
    index: usize,
    mut output: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
) {
    while let Some(chunk) = output.recv().await {
        room.terminal_output(index, chunk);
    }
    if !cancel.is_cancelled() {
        warn!(widget_index = index, "Terminal exited");
        room.broadcast(Update::terminal_error(index, "terminal exited"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn button_output_is_bounded() {
        let mut execution = ButtonExecution::default();
        let kept = execution.record(Origin::Stdout, Bytes::from_static(b"12345"), 8);
        assert_eq!(kept.as_deref(), Some(&b"12345"[..]));
        let kept = execution.record(Origin::Stderr, Bytes::from_static(b"67890"), 8);
        assert_eq!(kept.as_deref(), Some(&b"678"[..]));
        assert!(execution.truncated);
        assert_eq!(execution.record(Origin::Stdout, Bytes::from_static(b"x"), 8), None);
        assert_eq!(execution.retained, 8);
        assert_eq!(execution.records.len(), 2);
    }

    #[test]
    fn late_joiner_gets_snapshots_and_running_output() {
        let room = Room::default();
        room.publish_snapshot(Update::text(1, b"v1", vec![]));
        room.publish_snapshot(Update::text(1, b"v2", vec![]));
        room.begin_button(2).unwrap();
        room.button_output(2, Origin::Stdout, Bytes::from_static(b"out"), 1024);

        let (tx, mut rx) = mpsc::channel(8);
        room.join(StreamId(7), tx);
        assert_eq!(rx.try_recv().unwrap(), Update::text(1, b"v2", vec![]));
        assert_eq!(
            rx.try_recv().unwrap(),
            Update::button_chunk(2, Origin::Stdout, b"out")
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn second_click_is_rejected_until_finished() {
        let room = Room::default();
        room.begin_button(0).unwrap();
        assert!(matches!(
            room.begin_button(0),
            Err(RegistryError::AlreadyRunning(0))
        ));
        room.finish_button(0, Some(0));
        room.begin_button(0).unwrap();
    }

    #[test]
    fn full_stream_is_dropped_from_the_room() {
        let room = Room::default();
        let (slow_tx, _slow_rx) = mpsc::channel(1);
        let (fast_tx, mut fast_rx) = mpsc::channel(16);
        room.join(StreamId(1), slow_tx);
        room.join(StreamId(2), fast_tx);
        for i in 0..3u8 {
            room.broadcast(Update::terminal(0, &[i]));
        }
        for i in 0..3u8 {
            assert_eq!(fast_rx.try_recv().unwrap(), Update::terminal(0, &[i]));
        }
        let state = lock(&room.state);
        assert!(state.streams.contains_key(&StreamId(2)));
        assert!(!state.streams.contains_key(&StreamId(1)));
    }

    #[test]
    fn late_joiner_gets_recent_terminal_output() {
        let room = Room::default();
        room.terminal_output(3, Bytes::from_static(b"$ ls\r\n"));
        room.terminal_output(3, Bytes::from_static(b"main.py\r\n"));

        let (tx, mut rx) = mpsc::channel(8);
        room.join(StreamId(1), tx);
        assert_eq!(rx.try_recv().unwrap(), Update::terminal(3, b"$ ls\r\n"));
        assert_eq!(rx.try_recv().unwrap(), Update::terminal(3, b"main.py\r\n"));
        assert!(rx.try_recv().is_err());

        room.reset();
        let (tx, mut rx) = mpsc::channel(8);
        room.join(StreamId(2), tx);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn terminal_backlog_keeps_only_the_tail() {
        let mut log = TerminalLog::default();
        log.push(Bytes::from(vec![b'a'; TERMINAL_BACKLOG - 10]));
        log.push(Bytes::from(vec![b'b'; 20]));
        assert_eq!(log.len, 20);
        assert_eq!(log.chunks.len(), 1);

        log.push(Bytes::from(vec![b'c'; TERMINAL_BACKLOG + 5]));
        assert_eq!(log.len, TERMINAL_BACKLOG);
        assert_eq!(log.chunks.len(), 1);
        assert!(log.chunks[0].iter().all(|b| *b == b'c'));
    }

    #[test]
    fn retired_session_reports_no_streams() {
        let catalog = Catalog::from_json(
            r#"{"pages": [{"url": "/run", "isInteractive": true, "widgets": []}]}"#,
        )
        .unwrap();
        let registry = SessionRegistry::new(
            Arc::new(catalog),
            Arc::new(crate::sandbox::DockerExecutor::default()),
            RegistryConfig::default(),
        );
        let page_id = PageId::new("/run", crate::ids::SessionId::generate()).unwrap();
        let page = registry.interactive_page("/run").unwrap();
        let session = registry.entry(&page_id, &page);
        {
            let mut lifecycle = session.lifecycle.try_lock().unwrap();
            lifecycle.streams.insert(StreamId(9));
            lifecycle.retired = true;
        }

        let infos = registry.sessions();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].streams, 0);
        assert_eq!(infos[0].state, "inactive");
    }
}

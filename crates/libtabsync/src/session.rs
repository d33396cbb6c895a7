use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use tabsync_protocol::{
    ClientMessage, CreateTabParams, CreateTerminalParams, RequestId, ServerMessage, TabId,
    TabInfo, TerminalId, TerminalInfo, TerminalStatus,
};

use crate::config::ClientConfig;
use crate::connection::{CloseAction, CloseOutcome, ConnectionManager, ConnectionStatus};
use crate::error::SyncError;
use crate::optimistic::{Confirmed, EntityKind, OptimisticEngine, PendingOperation};
use crate::router::{AttachCallback, AttachRouter, DetachHandle, Viewer, ViewerInput};
use crate::scrollback::ScrollbackStore;
use crate::store::{SessionStore, Tab, Terminal, ViewerId};
use crate::view_state::ViewState;

/// Notifications for the host application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    Connected,
    /// Resync finished; the store mirrors the server.
    Ready,
    Disconnected {
        was_connected: bool,
        retry_in: Option<Duration>,
    },
    Offline,
    Confirmed {
        kind: EntityKind,
        temp_id: String,
        id: String,
        is_new: bool,
    },
    OperationRejected {
        kind: EntityKind,
        request_id: RequestId,
        temp_id: String,
        message: String,
    },
    TerminalExited {
        id: TerminalId,
        exit_code: Option<i32>,
        /// False while the user is already looking at this terminal.
        notify: bool,
    },
    TerminalFailed {
        id: TerminalId,
        message: String,
    },
    TerminalRemoved {
        id: TerminalId,
    },
    TabRemoved {
        id: TabId,
    },
    /// The viewer lost its binding because another viewer took the terminal.
    ViewerDetached {
        id: TerminalId,
        viewer: ViewerId,
    },
}

/// Point-in-time copy of the mirror for the host.
#[derive(Debug, Clone, Serialize)]
pub struct StoreSnapshot {
    pub status: ConnectionStatus,
    pub ready: bool,
    pub offline: bool,
    pub pending: usize,
    pub tabs: Vec<TabView>,
    pub task_terminals: Vec<TerminalView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TabView {
    pub info: TabInfo,
    pub pending: bool,
    pub terminals: Vec<TerminalView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TerminalView {
    pub info: TerminalInfo,
    pub pending: bool,
    pub attached: bool,
}

impl From<&Terminal> for TerminalView {
    fn from(terminal: &Terminal) -> Self {
        Self {
            info: terminal.info.clone(),
            pending: terminal.pending,
            attached: terminal.attachment.is_some(),
        }
    }
}

/// Single-threaded owner of all synchronization state. Every mutation goes
/// through one of its methods, in message arrival order.
pub struct SyncCore {
    store: SessionStore,
    engine: OptimisticEngine,
    router: AttachRouter,
    scrollback: ScrollbackStore,
    view: ViewState,
    connection: ConnectionManager,
    pending_timeout: Duration,
    outbox: Vec<ClientMessage>,
    events: Vec<SyncEvent>,
}

impl SyncCore {
    pub fn new(config: &ClientConfig) -> Self {
        Self::with_parts(
            config.scrollback_dir(),
            config.scrollback_max_bytes,
            ConnectionManager::new(config.reconnect_policy()),
            config.pending_timeout(),
        )
    }

    fn with_parts(
        scrollback_dir: PathBuf,
        scrollback_max_bytes: usize,
        connection: ConnectionManager,
        pending_timeout: Duration,
    ) -> Self {
        Self {
            store: SessionStore::new(),
            engine: OptimisticEngine::new(),
            router: AttachRouter::new(),
            scrollback: ScrollbackStore::new(scrollback_dir, scrollback_max_bytes),
            view: ViewState::default(),
            connection,
            pending_timeout,
            outbox: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn scrollback(&self) -> &ScrollbackStore {
        &self.scrollback
    }

    pub fn view(&self) -> &ViewState {
        &self.view
    }

    pub fn pending_count(&self) -> usize {
        self.engine.len()
    }

    pub fn take_outbox(&mut self) -> Vec<ClientMessage> {
        std::mem::take(&mut self.outbox)
    }

    pub fn take_events(&mut self) -> Vec<SyncEvent> {
        std::mem::take(&mut self.events)
    }

    fn send(&mut self, message: ClientMessage) {
        if let Some(message) = self.connection.gate(message) {
            self.outbox.push(message);
        }
    }

    fn send_all(&mut self, messages: Vec<ClientMessage>) {
        for message in messages {
            self.send(message);
        }
    }

    // ---- connection lifecycle ----

    pub fn on_connecting(&mut self) {
        self.connection.on_connecting();
    }

    pub fn on_open(&mut self) {
        self.connection.on_open();
        self.events.push(SyncEvent::Connected);
    }

    pub fn on_close(&mut self) -> CloseOutcome {
        let outcome = self.connection.on_close();
        if outcome.was_connected {
            let stale = self.engine.clear_stale(&mut self.store);
            for op in &stale {
                debug!(request_id = %op.request_id, temp_id = %op.temp_id, "stale optimistic create dropped");
                self.forget_terminal_state(&op.temp_id);
            }
        }
        let retry_in = match outcome.action {
            CloseAction::Reconnect { after, .. } => Some(after),
            CloseAction::Offline => None,
        };
        self.events.push(SyncEvent::Disconnected {
            was_connected: outcome.was_connected,
            retry_in,
        });
        if outcome.action == CloseAction::Offline {
            self.events.push(SyncEvent::Offline);
        }
        outcome
    }

    pub fn reset_reconnect(&mut self) {
        self.connection.reset_attempts();
    }

    // ---- inbound ----

    /// Decode one frame. Undecodable frames are logged and dropped.
    pub fn handle_line(&mut self, line: &str) {
        match serde_json::from_str::<ServerMessage>(line) {
            Ok(message) => self.handle_server_message(message),
            Err(err) => {
                let preview: String = line.chars().take(120).collect();
                warn!("dropping malformed server message: {err} ({preview})");
            }
        }
    }

    pub fn handle_server_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::TerminalsList(list) => self.resync_terminals(list),
            ServerMessage::TabsList(list) => self.resync_tabs(list),
            ServerMessage::TerminalCreated {
                request_id,
                temp_id,
                terminal,
                is_new,
            } => self.on_terminal_created(&request_id, &temp_id, terminal, is_new),
            ServerMessage::TerminalDestroyed { id } => self.remove_terminal(&id),
            ServerMessage::TerminalOutput { id, data } => {
                self.router
                    .on_output(&self.store, &mut self.scrollback, &id, data);
            }
            ServerMessage::TerminalAttached { id, buffer } => {
                self.router
                    .on_attached(&self.store, &mut self.scrollback, &id, buffer);
            }
            ServerMessage::TerminalRenamed { id, name } => {
                if let Some(terminal) = self.store.terminals.get_mut(&id) {
                    terminal.info.name = name;
                }
            }
            ServerMessage::TerminalTabAssigned {
                id,
                tab_id,
                position,
            } => {
                if let Some(terminal) = self.store.terminals.get_mut(&id) {
                    terminal.info.tab_id = tab_id;
                    terminal.info.position = position;
                }
            }
            ServerMessage::TerminalBufferCleared { id } => {
                self.scrollback.clear(&id);
                self.router.on_buffer_cleared(&self.store, &id);
            }
            ServerMessage::TerminalExit { id, exit_code } => self.on_terminal_exit(&id, exit_code),
            ServerMessage::TerminalError {
                id,
                request_id,
                temp_id,
                message,
            } => self.on_terminal_error(id, request_id, temp_id, message),
            ServerMessage::TabCreated {
                request_id,
                temp_id,
                tab,
                is_new,
            } => self.on_tab_created(&request_id, &temp_id, tab, is_new),
            ServerMessage::TabUpdated(info) => match self.store.tabs.get_mut(&info.id) {
                Some(tab) => tab.info = info,
                None => {
                    self.store.tabs.add(Tab::confirmed(info));
                }
            },
            ServerMessage::TabDeleted { id } => self.remove_tab(&id),
            ServerMessage::TabReordered { tabs } => {
                for entry in tabs {
                    if let Some(tab) = self.store.tabs.get_mut(&entry.id) {
                        tab.info.position = entry.position;
                    }
                }
            }
            ServerMessage::SyncStale {
                id,
                request_id,
                temp_id,
            } => self.on_stale(id, request_id, temp_id),
        }
    }

    fn resync_terminals(&mut self, list: Vec<TerminalInfo>) {
        let gone: Vec<TerminalId> = self
            .store
            .terminals
            .values()
            .filter(|t| !t.pending && !list.iter().any(|info| info.id == t.info.id))
            .map(|t| t.info.id.clone())
            .collect();

        self.router.forget_all();
        self.store
            .terminals
            .replace_all(list.into_iter().map(Terminal::confirmed));
        for id in gone {
            self.scrollback.forget(&id);
            self.view.forget(&id);
            self.events.push(SyncEvent::TerminalRemoved { id });
        }
        let ids: Vec<TerminalId> = self.store.terminals.values().map(|t| t.info.id.clone()).collect();
        for id in &ids {
            self.scrollback.restore(id);
        }
        info!(terminals = ids.len(), "terminals resynced");
        if self.connection.on_terminals_synced() {
            self.events.push(SyncEvent::Ready);
        }
    }

    fn resync_tabs(&mut self, list: Vec<TabInfo>) {
        self.store.tabs.replace_all(list.into_iter().map(Tab::confirmed));
        info!(tabs = self.store.tabs.len(), "tabs resynced");
        if self.connection.on_tabs_synced() {
            self.events.push(SyncEvent::Ready);
        }
    }

    fn on_terminal_created(
        &mut self,
        request_id: &str,
        temp_id: &str,
        terminal: TerminalInfo,
        is_new: bool,
    ) {
        if self.engine.take_cancelled(request_id) {
            self.on_cancelled_created(EntityKind::Terminal, terminal.id, is_new);
            return;
        }
        if self.engine.get(request_id).is_none() {
            // Another client's create, or one we already gave up on.
            debug!(terminal_id = %terminal.id, "terminal created elsewhere");
            let id = terminal.id.clone();
            if self.store.terminals.add(Terminal::confirmed(terminal)) {
                self.scrollback.restore(&id);
            }
            return;
        }
        let Some(confirmed) =
            self.engine
                .confirm_terminal(&mut self.store, request_id, temp_id, terminal, is_new)
        else {
            return;
        };

        let mut out = Vec::new();
        if confirmed.transferred {
            if let Some(previous) = confirmed.displaced {
                self.router.forget(&confirmed.real_id);
                info!(terminal_id = %confirmed.real_id, viewer = previous.viewer, "viewer displaced by confirmed create");
                self.events.push(SyncEvent::ViewerDetached {
                    id: confirmed.real_id.clone(),
                    viewer: previous.viewer,
                });
            }
            self.router
                .transfer(&confirmed.temp_id, &confirmed.real_id, &mut out);
        } else {
            self.router.forget(&confirmed.temp_id);
        }
        self.send_all(out);
        self.view.retarget(&confirmed.temp_id, &confirmed.real_id);
        self.scrollback.restore(&confirmed.real_id);
        info!(temp_id = %confirmed.temp_id, terminal_id = %confirmed.real_id, is_new, "terminal confirmed");
        self.push_confirmed(confirmed);
    }

    fn on_tab_created(&mut self, request_id: &str, temp_id: &str, tab: TabInfo, is_new: bool) {
        if self.engine.take_cancelled(request_id) {
            self.on_cancelled_created(EntityKind::Tab, tab.id, is_new);
            return;
        }
        if self.engine.get(request_id).is_none() {
            debug!(tab_id = %tab.id, "tab created elsewhere");
            self.store.tabs.add(Tab::confirmed(tab));
            return;
        }
        if let Some(mut confirmed) =
            self.engine
                .confirm_tab(&mut self.store, request_id, temp_id, tab, is_new)
        {
            info!(temp_id = %confirmed.temp_id, tab_id = %confirmed.real_id, is_new, "tab confirmed");
            let released = std::mem::take(&mut confirmed.released);
            self.push_confirmed(confirmed);
            self.send_all(released);
        }
    }

    /// The server finished a create this client withdrew. A fresh entity is
    /// removed again; a deduplicated one belongs to an earlier create and
    /// is left alone.
    fn on_cancelled_created(&mut self, kind: EntityKind, id: String, is_new: bool) {
        if !is_new {
            debug!(id = %id, "withdrawn create resolved to an existing entity");
            return;
        }
        info!(id = %id, "removing entity created after its create was withdrawn");
        match kind {
            EntityKind::Terminal => self.send(ClientMessage::TerminalDestroy { id }),
            EntityKind::Tab => self.send(ClientMessage::TabDelete { id }),
        }
    }

    fn push_confirmed(&mut self, confirmed: Confirmed) {
        self.events.push(SyncEvent::Confirmed {
            kind: confirmed.kind,
            temp_id: confirmed.temp_id,
            id: confirmed.real_id,
            is_new: confirmed.is_new,
        });
    }

    fn on_terminal_exit(&mut self, id: &str, exit_code: Option<i32>) {
        let Some(terminal) = self.store.terminals.get_mut(id) else {
            debug!(terminal_id = %id, "exit for unknown terminal ignored");
            return;
        };
        terminal.info.status = TerminalStatus::Exited;
        terminal.info.exit_code = exit_code;
        self.scrollback.persist(id);
        info!(terminal_id = %id, exit_code = ?exit_code, "terminal exited");
        self.events.push(SyncEvent::TerminalExited {
            id: id.to_string(),
            exit_code,
            notify: self.view.should_notify(id),
        });
    }

    fn on_terminal_error(
        &mut self,
        id: Option<TerminalId>,
        request_id: Option<RequestId>,
        temp_id: Option<String>,
        message: String,
    ) {
        if let Some(request_id) = request_id {
            if self.engine.take_cancelled(&request_id) {
                debug!(request_id = %request_id, "withdrawn create failed on the server: {message}");
                return;
            }
            for op in self
                .engine
                .reject(&mut self.store, &request_id, temp_id.as_deref())
            {
                self.rolled_back(op, message.clone());
            }
            return;
        }
        match id {
            Some(id) => {
                if let Some(terminal) = self.store.terminals.get_mut(&id) {
                    terminal.info.status = TerminalStatus::Error;
                }
                warn!(terminal_id = %id, "terminal error: {message}");
                self.events.push(SyncEvent::TerminalFailed { id, message });
            }
            None => warn!("server error: {message}"),
        }
    }

    fn on_stale(&mut self, id: String, request_id: Option<RequestId>, temp_id: Option<String>) {
        if let Some(request_id) = &request_id
            && self.engine.take_cancelled(request_id)
        {
            return;
        }
        let request_id = request_id.or_else(|| self.engine.request_for_temp_id(&id).cloned());
        if let Some(request_id) = request_id
            && self.engine.get(&request_id).is_some()
        {
            let temp_id = temp_id.unwrap_or_else(|| id.clone());
            let message = format!("{id} no longer exists on the server");
            for op in self.engine.reject(&mut self.store, &request_id, Some(&temp_id)) {
                self.rolled_back(op, message.clone());
            }
            return;
        }
        debug!(id = %id, "server reports stale entity");
        if self.store.terminals.has(&id) {
            self.remove_terminal(&id);
        } else if self.store.tabs.has(&id) {
            self.remove_tab(&id);
        }
    }

    fn rolled_back(&mut self, op: PendingOperation, message: String) {
        warn!(request_id = %op.request_id, temp_id = %op.temp_id, "optimistic create rolled back: {message}");
        self.forget_terminal_state(&op.temp_id);
        self.events.push(SyncEvent::OperationRejected {
            kind: op.kind,
            request_id: op.request_id,
            temp_id: op.temp_id,
            message,
        });
    }

    fn forget_terminal_state(&mut self, id: &str) {
        self.router.forget(id);
        self.view.forget(id);
    }

    fn remove_terminal(&mut self, id: &str) {
        if self.store.terminals.remove(id).is_none() {
            return;
        }
        self.forget_terminal_state(id);
        self.scrollback.forget(id);
        debug!(terminal_id = %id, "terminal removed");
        self.events.push(SyncEvent::TerminalRemoved { id: id.to_string() });
    }

    fn remove_tab(&mut self, id: &str) {
        if self.store.tabs.remove(id).is_none() {
            return;
        }
        for terminal in self.store.terminals.values_mut() {
            if terminal.info.tab_id.as_deref() == Some(id) {
                terminal.info.tab_id = None;
                terminal.info.position = None;
            }
        }
        debug!(tab_id = %id, "tab removed");
        self.events.push(SyncEvent::TabRemoved { id: id.to_string() });
    }

    // ---- local commands ----

    /// Returns the temporary id of the optimistic terminal. Refused while
    /// the channel is down, since the create could not be sent.
    pub fn create_terminal(&mut self, params: CreateTerminalParams) -> Result<TerminalId, SyncError> {
        if !self.connection.is_open() {
            return Err(SyncError::NotConnected);
        }
        if let Some(tab_id) = &params.tab_id
            && !self.store.tabs.has(tab_id)
        {
            return Err(SyncError::UnknownTab(tab_id.clone()));
        }
        let issued = self.engine.create_terminal(&mut self.store, params);
        if let Some(message) = issued.message {
            self.send(message);
        }
        Ok(issued.temp_id)
    }

    pub fn create_tab(&mut self, params: CreateTabParams) -> Result<TabId, SyncError> {
        if !self.connection.is_open() {
            return Err(SyncError::NotConnected);
        }
        let issued = self.engine.create_tab(&mut self.store, params);
        if let Some(message) = issued.message {
            self.send(message);
        }
        Ok(issued.temp_id)
    }

    /// Withdraw a pending create. Terminal creates held for a withdrawn tab
    /// are reported as rejected.
    fn cancel_pending(&mut self, temp_id: &str) {
        for op in self.engine.cancel(&mut self.store, temp_id) {
            if op.temp_id == temp_id {
                self.forget_terminal_state(&op.temp_id);
            } else {
                self.rolled_back(op, format!("tab {temp_id} was deleted before it was created"));
            }
        }
    }

    pub fn destroy_terminal(&mut self, id: &str) -> Result<(), SyncError> {
        if !self.store.terminals.has(id) {
            return Err(SyncError::UnknownTerminal(id.to_string()));
        }
        if self.engine.request_for_temp_id(id).is_some() {
            self.cancel_pending(id);
            return Ok(());
        }
        self.send(ClientMessage::TerminalDestroy { id: id.to_string() });
        self.remove_terminal(id);
        Ok(())
    }

    pub fn rename_terminal(&mut self, id: &str, name: String) -> Result<(), SyncError> {
        self.require_terminal(id)?;
        self.send(ClientMessage::TerminalRename {
            id: id.to_string(),
            name,
        });
        Ok(())
    }

    pub fn assign_tab(
        &mut self,
        id: &str,
        tab_id: Option<TabId>,
        position: Option<u32>,
    ) -> Result<(), SyncError> {
        self.require_terminal(id)?;
        if let Some(tab_id) = &tab_id
            && !self.store.tabs.get(tab_id).is_some_and(|tab| !tab.pending)
        {
            return Err(SyncError::UnknownTab(tab_id.clone()));
        }
        self.send(ClientMessage::TerminalAssignTab {
            id: id.to_string(),
            tab_id,
            position,
        });
        Ok(())
    }

    pub fn clear_buffer(&mut self, id: &str) -> Result<(), SyncError> {
        self.require_terminal(id)?;
        self.send(ClientMessage::TerminalClearBuffer { id: id.to_string() });
        Ok(())
    }

    pub fn update_tab(
        &mut self,
        id: &str,
        name: Option<String>,
        cwd: Option<PathBuf>,
    ) -> Result<(), SyncError> {
        if !self.store.tabs.has(id) {
            return Err(SyncError::UnknownTab(id.to_string()));
        }
        self.send(ClientMessage::TabUpdate {
            id: id.to_string(),
            name,
            cwd,
        });
        Ok(())
    }

    pub fn delete_tab(&mut self, id: &str) -> Result<(), SyncError> {
        if !self.store.tabs.has(id) {
            return Err(SyncError::UnknownTab(id.to_string()));
        }
        if self.engine.request_for_temp_id(id).is_some() {
            self.cancel_pending(id);
            return Ok(());
        }
        self.send(ClientMessage::TabDelete { id: id.to_string() });
        self.remove_tab(id);
        Ok(())
    }

    pub fn reorder_tabs(&mut self, ids: Vec<TabId>) {
        self.send(ClientMessage::TabReorder { ids });
    }

    fn require_terminal(&self, id: &str) -> Result<(), SyncError> {
        match self.store.terminals.get(id) {
            Some(terminal) if !terminal.pending => Ok(()),
            _ => Err(SyncError::UnknownTerminal(id.to_string())),
        }
    }

    pub fn register_viewer(&mut self, viewer: Box<dyn Viewer>) -> ViewerId {
        self.router.register_viewer(viewer)
    }

    pub fn unregister_viewer(&mut self, viewer: ViewerId) {
        self.router.unregister_viewer(&mut self.store, viewer);
    }

    pub fn attach(
        &mut self,
        terminal_id: &str,
        viewer: ViewerId,
        on_attached: Option<AttachCallback>,
    ) -> Result<DetachHandle, SyncError> {
        let mut out = Vec::new();
        let handle = self
            .router
            .attach(&mut self.store, terminal_id, viewer, on_attached, &mut out)?;
        self.send_all(out);
        Ok(handle)
    }

    pub fn detach(&mut self, handle: DetachHandle) -> bool {
        self.router.detach(&mut self.store, handle)
    }

    pub fn viewer_input(&mut self, viewer: ViewerId, input: ViewerInput) {
        let mut out = Vec::new();
        self.router
            .on_input(&self.store, &mut self.view, viewer, input, &mut out);
        self.send_all(out);
    }

    pub fn resize(&mut self, terminal_id: &str, cols: u16, rows: u16) -> Result<(), SyncError> {
        let mut out = Vec::new();
        self.router
            .resize(&mut self.store, terminal_id, cols, rows, &mut out)?;
        self.send_all(out);
        Ok(())
    }

    pub fn set_route(&mut self, route: Option<String>) {
        self.view.set_route(route);
    }

    pub fn set_visible(&mut self, visible: bool) {
        self.view.set_visible(visible);
    }

    /// Roll back creates the server never answered.
    pub fn expire_pending(&mut self, now: Instant) {
        let expired = self
            .engine
            .expire(&mut self.store, now, self.pending_timeout);
        for op in expired {
            let message = SyncError::PendingTimeout(op.request_id.clone()).to_string();
            self.rolled_back(op, message);
        }
    }

    pub fn persist_scrollback(&self) {
        self.scrollback.persist_all();
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        let tabs = self
            .store
            .tabs
            .sorted()
            .into_iter()
            .map(|tab| TabView {
                info: tab.info.clone(),
                pending: tab.pending,
                terminals: self
                    .store
                    .terminals
                    .by_tab(&tab.info.id)
                    .into_iter()
                    .map(TerminalView::from)
                    .collect(),
            })
            .collect();
        StoreSnapshot {
            status: self.connection.status(),
            ready: self.connection.is_ready(),
            offline: self.connection.is_offline(),
            pending: self.engine.len(),
            tabs,
            task_terminals: self
                .store
                .terminals
                .task_terminals()
                .into_iter()
                .map(TerminalView::from)
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ReconnectPolicy;
    use crate::router::tests::{RecordingViewer, Screen};
    use crate::scrollback::DEFAULT_MAX_BYTES;
    use crate::store::tests::{tab_info, terminal_info};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    struct Harness {
        core: SyncCore,
        _dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mut core = SyncCore::with_parts(
            dir.path().join("scrollback"),
            DEFAULT_MAX_BYTES,
            ConnectionManager::new(ReconnectPolicy::default()),
            Duration::from_secs(30),
        );
        core.on_open();
        core.handle_server_message(ServerMessage::TerminalsList(vec![]));
        core.handle_server_message(ServerMessage::TabsList(vec![]));
        core.take_events();
        Harness { core, _dir: dir }
    }

    fn params() -> CreateTerminalParams {
        CreateTerminalParams {
            name: "agent".to_string(),
            cwd: PathBuf::from("/work"),
            cols: 100,
            rows: 30,
            tab_id: None,
            position: None,
            initial_input: Some("claude\n".to_string()),
        }
    }

    fn tab_params() -> CreateTabParams {
        CreateTabParams {
            name: "work".to_string(),
            cwd: None,
            position: None,
        }
    }

    fn sent_tab_create(core: &mut SyncCore) -> (RequestId, String) {
        match core.take_outbox().last() {
            Some(ClientMessage::TabCreate {
                request_id,
                temp_id,
                ..
            }) => (request_id.clone(), temp_id.clone()),
            other => panic!("expected tab create, got {other:?}"),
        }
    }

    fn sent_create(core: &mut SyncCore) -> (RequestId, String) {
        let outbox = core.take_outbox();
        match outbox.last() {
            Some(ClientMessage::TerminalCreate {
                request_id,
                temp_id,
                ..
            }) => (request_id.clone(), temp_id.clone()),
            other => panic!("expected create, got {other:?}"),
        }
    }

    #[test]
    fn resync_marks_ready() {
        let dir = tempfile::tempdir().unwrap();
        let mut core = SyncCore::with_parts(
            dir.path().to_path_buf(),
            DEFAULT_MAX_BYTES,
            ConnectionManager::new(ReconnectPolicy::default()),
            Duration::from_secs(30),
        );
        core.on_open();
        core.handle_server_message(ServerMessage::TerminalsList(vec![terminal_info("t1", None, None)]));
        assert!(!core.connection().is_ready());
        core.handle_server_message(ServerMessage::TabsList(vec![tab_info("a", 0)]));
        assert!(core.connection().is_ready());
        assert_eq!(
            core.take_events(),
            vec![SyncEvent::Connected, SyncEvent::Ready]
        );
    }

    #[test]
    fn create_then_confirm_with_real_id() {
        let mut h = harness();
        let temp = h.core.create_terminal(params()).unwrap();
        let (request_id, temp_id) = sent_create(&mut h.core);
        assert_eq!(temp, temp_id);

        let mut real = terminal_info("t42", None, None);
        real.cols = 100;
        real.rows = 30;
        h.core.handle_server_message(ServerMessage::TerminalCreated {
            request_id,
            temp_id: temp_id.clone(),
            terminal: real,
            is_new: true,
        });

        assert!(!h.core.store().terminals.has(&temp_id));
        let term = h.core.store().terminals.get("t42").unwrap();
        assert_eq!((term.info.cols, term.info.rows), (100, 30));
        assert_eq!(h.core.pending_count(), 0);
    }

    #[test]
    fn rejection_rolls_back_and_reports() {
        let mut h = harness();
        let before = h.core.store().clone();
        h.core.create_terminal(params()).unwrap();
        let (request_id, temp_id) = sent_create(&mut h.core);

        h.core.handle_server_message(ServerMessage::TerminalError {
            id: None,
            request_id: Some(request_id.clone()),
            temp_id: Some(temp_id.clone()),
            message: "worktree missing".to_string(),
        });

        assert_eq!(h.core.store(), &before);
        assert_eq!(
            h.core.take_events(),
            vec![SyncEvent::OperationRejected {
                kind: EntityKind::Terminal,
                request_id,
                temp_id,
                message: "worktree missing".to_string(),
            }]
        );
    }

    #[test]
    fn sync_stale_rejects_pending_by_temp_id() {
        let mut h = harness();
        let temp = h.core.create_terminal(params()).unwrap();
        h.core.take_outbox();

        h.core.handle_server_message(ServerMessage::SyncStale {
            id: temp.clone(),
            request_id: None,
            temp_id: None,
        });
        assert!(!h.core.store().terminals.has(&temp));
        assert_eq!(h.core.pending_count(), 0);
    }

    #[test]
    fn sync_stale_removes_confirmed_entity() {
        let mut h = harness();
        h.core.handle_server_message(ServerMessage::TerminalsList(vec![terminal_info("t1", None, None)]));
        h.core.handle_server_message(ServerMessage::SyncStale {
            id: "t1".to_string(),
            request_id: None,
            temp_id: None,
        });
        assert!(!h.core.store().terminals.has("t1"));
    }

    #[test]
    fn duplicate_unsolicited_create_is_idempotent() {
        let mut h = harness();
        for _ in 0..2 {
            h.core.handle_server_message(ServerMessage::TerminalCreated {
                request_id: "someone-else".to_string(),
                temp_id: "tmp-x".to_string(),
                terminal: terminal_info("t5", None, None),
                is_new: true,
            });
        }
        assert_eq!(h.core.store().terminals.len(), 1);
    }

    #[test]
    fn disconnect_clears_pending_and_resync_converges() {
        let mut h = harness();
        let temp = h.core.create_terminal(params()).unwrap();
        h.core.take_outbox();

        let outcome = h.core.on_close();
        assert!(outcome.was_connected);
        assert!(!h.core.store().terminals.has(&temp));
        assert_eq!(h.core.pending_count(), 0);

        h.core.on_open();
        h.core.handle_server_message(ServerMessage::TerminalsList(vec![]));
        h.core.handle_server_message(ServerMessage::TabsList(vec![]));
        assert!(h.core.connection().is_ready());
        assert!(h.core.store().terminals.is_empty());
    }

    #[test]
    fn sends_are_dropped_while_disconnected() {
        let mut h = harness();
        h.core
            .handle_server_message(ServerMessage::TerminalsList(vec![terminal_info("t1", None, None)]));
        h.core.on_close();
        h.core.rename_terminal("t1", "renamed".to_string()).unwrap();
        assert!(h.core.take_outbox().is_empty());
    }

    #[test]
    fn create_refused_while_disconnected() {
        let mut h = harness();
        h.core.on_close();
        let before = h.core.store().clone();

        assert!(matches!(
            h.core.create_terminal(params()),
            Err(SyncError::NotConnected)
        ));
        assert!(matches!(
            h.core.create_tab(CreateTabParams {
                name: "work".to_string(),
                cwd: None,
                position: None,
            }),
            Err(SyncError::NotConnected)
        ));
        assert_eq!(h.core.store(), &before);
        assert_eq!(h.core.pending_count(), 0);

        h.core.on_open();
        h.core.handle_server_message(ServerMessage::TerminalsList(vec![]));
        h.core.handle_server_message(ServerMessage::TabsList(vec![]));
        assert_eq!(h.core.snapshot().pending, 0);
        assert!(h.core.take_outbox().is_empty());
    }

    #[test]
    fn malformed_line_is_dropped() {
        let mut h = harness();
        h.core.handle_line("{not json");
        h.core.handle_line(r#"{"type":"terminal:output","payload":{"id":5}}"#);
        assert!(h.core.take_events().is_empty());
        assert!(h.core.connection().is_open());
    }

    #[test]
    fn output_and_replay_reach_viewer() {
        let mut h = harness();
        h.core
            .handle_server_message(ServerMessage::TerminalsList(vec![terminal_info("t1", None, None)]));
        let screen = Arc::new(Mutex::new(Screen::default()));
        let viewer = h
            .core
            .register_viewer(Box::new(RecordingViewer(Arc::clone(&screen))));
        h.core.attach("t1", viewer, None).unwrap();
        assert_eq!(
            h.core.take_outbox(),
            vec![ClientMessage::TerminalAttach {
                id: "t1".to_string()
            }]
        );

        h.core.handle_server_message(ServerMessage::TerminalAttached {
            id: "t1".to_string(),
            buffer: b"$ ".to_vec(),
        });
        h.core.handle_server_message(ServerMessage::TerminalOutput {
            id: "t1".to_string(),
            data: b"ls\r\n".to_vec(),
        });

        assert_eq!(screen.lock().unwrap().bytes, b"$ ls\r\n");
        assert_eq!(h.core.scrollback().contents("t1"), b"$ ls\r\n");
    }

    #[test]
    fn attachment_follows_confirmation() {
        let mut h = harness();
        let temp = h.core.create_terminal(params()).unwrap();
        let (request_id, temp_id) = sent_create(&mut h.core);
        let viewer = h
            .core
            .register_viewer(Box::new(RecordingViewer(Arc::default())));
        h.core.attach(&temp, viewer, None).unwrap();
        assert!(h.core.take_outbox().is_empty());

        h.core.handle_server_message(ServerMessage::TerminalCreated {
            request_id,
            temp_id,
            terminal: terminal_info("t7", None, None),
            is_new: true,
        });

        assert_eq!(
            h.core.store().terminals.get("t7").unwrap().attachment.map(|a| a.viewer),
            Some(viewer)
        );
        assert_eq!(
            h.core.take_outbox(),
            vec![ClientMessage::TerminalAttach {
                id: "t7".to_string()
            }]
        );
        h.core.viewer_input(viewer, ViewerInput::Data(b"y".to_vec()));
        assert_eq!(
            h.core.take_outbox(),
            vec![ClientMessage::TerminalInput {
                id: "t7".to_string(),
                data: b"y".to_vec()
            }]
        );
    }

    #[test]
    fn exit_notification_respects_focus() {
        let mut h = harness();
        h.core.handle_server_message(ServerMessage::TerminalsList(vec![
            terminal_info("t1", None, None),
            terminal_info("t2", None, None),
        ]));
        let viewer = h
            .core
            .register_viewer(Box::new(RecordingViewer(Arc::default())));
        h.core.attach("t1", viewer, None).unwrap();
        h.core.viewer_input(viewer, ViewerInput::Focus);
        h.core
            .set_route(Some(crate::view_state::TERMINALS_ROUTE.to_string()));
        h.core.take_events();

        h.core.handle_server_message(ServerMessage::TerminalExit {
            id: "t1".to_string(),
            exit_code: Some(0),
        });
        h.core.handle_server_message(ServerMessage::TerminalExit {
            id: "t2".to_string(),
            exit_code: Some(1),
        });

        let events = h.core.take_events();
        assert!(events.contains(&SyncEvent::TerminalExited {
            id: "t1".to_string(),
            exit_code: Some(0),
            notify: false,
        }));
        assert!(events.contains(&SyncEvent::TerminalExited {
            id: "t2".to_string(),
            exit_code: Some(1),
            notify: true,
        }));
        assert_eq!(
            h.core.store().terminals.get("t1").unwrap().info.status,
            TerminalStatus::Exited
        );
    }

    #[test]
    fn tab_delete_unassigns_terminals() {
        let mut h = harness();
        h.core.handle_server_message(ServerMessage::TabsList(vec![tab_info("tab-a", 0)]));
        h.core.handle_server_message(ServerMessage::TerminalsList(vec![terminal_info(
            "t1",
            Some("tab-a"),
            Some(0),
        )]));

        h.core.handle_server_message(ServerMessage::TabDeleted {
            id: "tab-a".to_string(),
        });
        assert!(h.core.store().tabs.is_empty());
        assert_eq!(h.core.store().terminals.task_terminals().len(), 1);
    }

    #[test]
    fn pending_create_expires() {
        let mut h = harness();
        let temp = h.core.create_terminal(params()).unwrap();
        h.core.take_events();

        h.core.expire_pending(Instant::now() + Duration::from_secs(31));
        assert!(!h.core.store().terminals.has(&temp));
        assert!(matches!(
            h.core.take_events().as_slice(),
            [SyncEvent::OperationRejected { .. }]
        ));
    }

    #[test]
    fn destroying_pending_terminal_sends_nothing() {
        let mut h = harness();
        let temp = h.core.create_terminal(params()).unwrap();
        h.core.take_outbox();

        h.core.destroy_terminal(&temp).unwrap();
        assert!(h.core.take_outbox().is_empty());
        assert!(h.core.store().terminals.is_empty());
        assert_eq!(h.core.pending_count(), 0);
    }

    #[test]
    fn destroyed_pending_terminal_is_destroyed_when_confirmed_late() {
        let mut h = harness();
        let temp = h.core.create_terminal(params()).unwrap();
        let (request_id, temp_id) = sent_create(&mut h.core);
        h.core.destroy_terminal(&temp).unwrap();
        h.core.take_events();

        h.core.handle_server_message(ServerMessage::TerminalCreated {
            request_id,
            temp_id,
            terminal: terminal_info("t42", None, None),
            is_new: true,
        });

        assert!(h.core.store().terminals.is_empty());
        assert_eq!(
            h.core.take_outbox(),
            vec![ClientMessage::TerminalDestroy {
                id: "t42".to_string()
            }]
        );
        assert!(h.core.take_events().is_empty());
        assert_eq!(h.core.pending_count(), 0);
    }

    #[test]
    fn withdrawn_dedup_create_keeps_shared_terminal() {
        let mut h = harness();
        h.core
            .handle_server_message(ServerMessage::TerminalsList(vec![terminal_info("t10", None, None)]));
        let temp = h.core.create_terminal(params()).unwrap();
        let (request_id, temp_id) = sent_create(&mut h.core);
        h.core.destroy_terminal(&temp).unwrap();

        h.core.handle_server_message(ServerMessage::TerminalCreated {
            request_id,
            temp_id,
            terminal: terminal_info("t10", None, None),
            is_new: false,
        });

        assert!(h.core.take_outbox().is_empty());
        assert!(h.core.store().terminals.has("t10"));
    }

    #[test]
    fn deleted_pending_tab_is_deleted_when_confirmed_late() {
        let mut h = harness();
        let tab = h.core.create_tab(tab_params()).unwrap();
        let (request_id, temp_id) = sent_tab_create(&mut h.core);
        h.core.delete_tab(&tab).unwrap();
        assert!(h.core.take_outbox().is_empty());
        assert!(h.core.store().tabs.is_empty());

        h.core.handle_server_message(ServerMessage::TabCreated {
            request_id,
            temp_id,
            tab: tab_info("tab-9", 0),
            is_new: true,
        });

        assert!(h.core.store().tabs.is_empty());
        assert_eq!(
            h.core.take_outbox(),
            vec![ClientMessage::TabDelete {
                id: "tab-9".to_string()
            }]
        );
    }

    #[test]
    fn terminal_create_waits_for_its_tab() {
        let mut h = harness();
        let tab = h.core.create_tab(tab_params()).unwrap();
        let (tab_request, tab_temp) = sent_tab_create(&mut h.core);
        let mut p = params();
        p.tab_id = Some(tab.clone());
        let term = h.core.create_terminal(p).unwrap();
        assert!(h.core.take_outbox().is_empty());
        assert_eq!(h.core.snapshot().tabs[0].terminals[0].info.id, term);

        h.core.handle_server_message(ServerMessage::TabCreated {
            request_id: tab_request,
            temp_id: tab_temp,
            tab: tab_info("tab-1", 0),
            is_new: true,
        });

        match h.core.take_outbox().as_slice() {
            [ClientMessage::TerminalCreate { temp_id, params, .. }] => {
                assert_eq!(temp_id, &term);
                assert_eq!(params.tab_id.as_deref(), Some("tab-1"));
            }
            other => panic!("expected held create, got {other:?}"),
        }
        assert_eq!(h.core.store().terminals.by_tab("tab-1").len(), 1);
    }

    #[test]
    fn rejected_tab_takes_its_terminals_along() {
        let mut h = harness();
        h.core.create_tab(tab_params()).unwrap();
        let (tab_request, tab_temp) = sent_tab_create(&mut h.core);
        let mut p = params();
        p.tab_id = Some(tab_temp.clone());
        let term = h.core.create_terminal(p).unwrap();
        h.core.take_events();

        h.core.handle_server_message(ServerMessage::TerminalError {
            id: None,
            request_id: Some(tab_request),
            temp_id: Some(tab_temp.clone()),
            message: "tab limit reached".to_string(),
        });

        let snap = h.core.snapshot();
        assert!(snap.tabs.is_empty());
        assert!(snap.task_terminals.is_empty());
        assert!(!h.core.store().terminals.has(&term));
        assert_eq!(h.core.pending_count(), 0);
        let rejected: Vec<String> = h
            .core
            .take_events()
            .into_iter()
            .filter_map(|event| match event {
                SyncEvent::OperationRejected { temp_id, .. } => Some(temp_id),
                _ => None,
            })
            .collect();
        assert_eq!(rejected.len(), 2);
        assert!(rejected.contains(&term) && rejected.contains(&tab_temp));
        assert!(h.core.take_outbox().is_empty());
    }

    #[test]
    fn create_into_unknown_tab_is_refused() {
        let mut h = harness();
        let mut p = params();
        p.tab_id = Some("nope".to_string());
        assert!(matches!(
            h.core.create_terminal(p),
            Err(SyncError::UnknownTab(_))
        ));
        assert_eq!(h.core.pending_count(), 0);
    }

    #[test]
    fn dedup_confirm_moves_viewer_and_replays() {
        let mut h = harness();
        h.core
            .handle_server_message(ServerMessage::TerminalsList(vec![terminal_info("t10", None, None)]));
        let screen_a = Arc::new(Mutex::new(Screen::default()));
        let viewer_a = h
            .core
            .register_viewer(Box::new(RecordingViewer(Arc::clone(&screen_a))));
        h.core.attach("t10", viewer_a, None).unwrap();
        h.core.handle_server_message(ServerMessage::TerminalAttached {
            id: "t10".to_string(),
            buffer: b"old".to_vec(),
        });
        h.core.take_outbox();

        let temp = h.core.create_terminal(params()).unwrap();
        let (request_id, temp_id) = sent_create(&mut h.core);
        let screen_b = Arc::new(Mutex::new(Screen::default()));
        let viewer_b = h
            .core
            .register_viewer(Box::new(RecordingViewer(Arc::clone(&screen_b))));
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        h.core
            .attach(
                &temp,
                viewer_b,
                Some(Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .unwrap();
        h.core.take_events();

        h.core.handle_server_message(ServerMessage::TerminalCreated {
            request_id,
            temp_id,
            terminal: terminal_info("t10", None, None),
            is_new: false,
        });

        assert_eq!(
            h.core.store().terminals.get("t10").unwrap().attachment.map(|a| a.viewer),
            Some(viewer_b)
        );
        assert_eq!(
            h.core.take_outbox(),
            vec![ClientMessage::TerminalAttach {
                id: "t10".to_string()
            }]
        );
        assert!(h.core.take_events().contains(&SyncEvent::ViewerDetached {
            id: "t10".to_string(),
            viewer: viewer_a,
        }));

        h.core.handle_server_message(ServerMessage::TerminalAttached {
            id: "t10".to_string(),
            buffer: b"history".to_vec(),
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(screen_b.lock().unwrap().bytes, b"history");
        assert_eq!(screen_a.lock().unwrap().bytes, b"old");

        h.core.viewer_input(viewer_a, ViewerInput::Data(b"x".to_vec()));
        assert!(h.core.take_outbox().is_empty());
    }

    #[test]
    fn snapshot_groups_terminals_by_tab() {
        let mut h = harness();
        h.core.handle_server_message(ServerMessage::TabsList(vec![tab_info("b", 1), tab_info("a", 0)]));
        h.core.handle_server_message(ServerMessage::TerminalsList(vec![
            terminal_info("t1", Some("a"), Some(1)),
            terminal_info("t2", Some("a"), Some(0)),
            terminal_info("t3", None, None),
        ]));

        let snap = h.core.snapshot();
        assert!(snap.ready);
        assert_eq!(snap.tabs[0].info.id, "a");
        let ids: Vec<&str> = snap.tabs[0].terminals.iter().map(|t| t.info.id.as_str()).collect();
        assert_eq!(ids, vec!["t2", "t1"]);
        assert!(snap.tabs[1].terminals.is_empty());
        assert_eq!(snap.task_terminals.len(), 1);
    }
}

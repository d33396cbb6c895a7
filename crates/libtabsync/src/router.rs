use std::collections::{HashMap, HashSet};

use tracing::{debug, trace};

use tabsync_protocol::{ClientMessage, TerminalId};

use crate::error::SyncError;
use crate::scrollback::ScrollbackStore;
use crate::store::{Attachment, SessionStore, SubscriptionId, ViewerId};
use crate::view_state::ViewState;

/// Byte injected by the multi-line input shortcut instead of the usual `\r`.
pub const NEWLINE: &[u8] = b"\n";

/// A live display for one terminal's raw output.
pub trait Viewer: Send {
    /// Clear the display ahead of a full buffer replay.
    fn reset(&mut self);
    /// Render raw terminal bytes, escape sequences included.
    fn write(&mut self, data: &[u8]);
}

pub type AttachCallback = Box<dyn FnOnce() + Send>;

/// Input produced by a viewer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewerInput {
    /// Keystrokes or paste, forwarded verbatim.
    Data(Vec<u8>),
    /// Multi-line shortcut (e.g. shift+enter).
    Newline,
    Focus,
    Blur,
}

/// Returned by [`AttachRouter::attach`]. Detaching with a handle whose
/// binding is already gone does nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetachHandle {
    pub viewer: ViewerId,
    pub subscription: SubscriptionId,
}

/// Binds viewers to terminals, replays history on attach and routes
/// live output and input.
#[derive(Default)]
pub struct AttachRouter {
    viewers: HashMap<ViewerId, Box<dyn Viewer>>,
    callbacks: HashMap<TerminalId, AttachCallback>,
    /// Terminals whose replay already arrived in the current attach cycle.
    ready: HashSet<TerminalId>,
    /// Pending terminals whose attach request waits for confirmation.
    deferred: HashSet<TerminalId>,
    next_viewer: ViewerId,
    next_subscription: SubscriptionId,
}

impl AttachRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_viewer(&mut self, viewer: Box<dyn Viewer>) -> ViewerId {
        self.next_viewer += 1;
        self.viewers.insert(self.next_viewer, viewer);
        self.next_viewer
    }

    /// Forget a viewer whose UI went away, releasing its binding.
    pub fn unregister_viewer(&mut self, store: &mut SessionStore, viewer: ViewerId) {
        self.viewers.remove(&viewer);
        if let Some(id) = store.terminals.attached_to(viewer).map(|t| t.info.id.clone()) {
            self.unbind(store, &id);
        }
    }

    pub fn attach(
        &mut self,
        store: &mut SessionStore,
        terminal_id: &str,
        viewer: ViewerId,
        on_attached: Option<AttachCallback>,
        out: &mut Vec<ClientMessage>,
    ) -> Result<DetachHandle, SyncError> {
        if !self.viewers.contains_key(&viewer) {
            return Err(SyncError::UnknownViewer(viewer));
        }
        let current = store
            .terminals
            .get(terminal_id)
            .ok_or_else(|| SyncError::UnknownTerminal(terminal_id.to_string()))?
            .attachment;

        if let Some(attachment) = current
            && attachment.viewer == viewer
        {
            trace!(terminal_id = %terminal_id, viewer, "viewer already attached");
            if let Some(callback) = on_attached {
                self.register_callback(terminal_id, callback);
            }
            return Ok(DetachHandle {
                viewer,
                subscription: attachment.subscription,
            });
        }

        // A viewer shows one terminal at a time.
        if let Some(other) = store.terminals.attached_to(viewer).map(|t| t.info.id.clone()) {
            self.unbind(store, &other);
        }
        self.unbind(store, terminal_id);

        self.next_subscription += 1;
        let attachment = Attachment {
            viewer,
            subscription: self.next_subscription,
        };
        let Some(terminal) = store.terminals.get_mut(terminal_id) else {
            return Err(SyncError::UnknownTerminal(terminal_id.to_string()));
        };
        terminal.attachment = Some(attachment);
        let pending = terminal.pending;

        if let Some(callback) = on_attached {
            self.register_callback(terminal_id, callback);
        }
        if pending {
            debug!(terminal_id = %terminal_id, "attach deferred until terminal is confirmed");
            self.deferred.insert(terminal_id.to_string());
        } else {
            out.push(ClientMessage::TerminalAttach {
                id: terminal_id.to_string(),
            });
        }
        debug!(terminal_id = %terminal_id, viewer, subscription = attachment.subscription, "viewer attached");
        Ok(DetachHandle {
            viewer,
            subscription: attachment.subscription,
        })
    }

    /// Store the callback, or run it at once when the replay already came in.
    fn register_callback(&mut self, terminal_id: &str, callback: AttachCallback) {
        if self.ready.contains(terminal_id) {
            callback();
        } else {
            self.callbacks.insert(terminal_id.to_string(), callback);
        }
    }

    pub fn detach(&mut self, store: &mut SessionStore, handle: DetachHandle) -> bool {
        let bound = store
            .terminals
            .values()
            .find(|t| t.attachment.is_some_and(|a| a.subscription == handle.subscription))
            .map(|t| t.info.id.clone());
        match bound {
            Some(id) => {
                self.unbind(store, &id);
                debug!(terminal_id = %id, viewer = handle.viewer, "viewer detached");
                true
            }
            None => false,
        }
    }

    fn unbind(&mut self, store: &mut SessionStore, terminal_id: &str) {
        if let Some(terminal) = store.terminals.get_mut(terminal_id) {
            terminal.attachment = None;
        }
        self.forget(terminal_id);
    }

    /// `terminal:attached`: reset the viewer and replay the server buffer.
    pub fn on_attached(
        &mut self,
        store: &SessionStore,
        scrollback: &mut ScrollbackStore,
        terminal_id: &str,
        buffer: Vec<u8>,
    ) {
        let attachment = store.terminals.get(terminal_id).and_then(|t| t.attachment);
        if let Some(attachment) = attachment
            && let Some(viewer) = self.viewers.get_mut(&attachment.viewer)
        {
            viewer.reset();
            viewer.write(&buffer);
        }
        scrollback.replace(terminal_id, buffer);

        if attachment.is_none() {
            debug!(terminal_id = %terminal_id, "replay for unattached terminal stored only");
            return;
        }
        self.ready.insert(terminal_id.to_string());
        if let Some(callback) = self.callbacks.remove(terminal_id) {
            callback();
        }
    }

    /// Live output is always kept; it is rendered only when a viewer is bound.
    pub fn on_output(
        &mut self,
        store: &SessionStore,
        scrollback: &mut ScrollbackStore,
        terminal_id: &str,
        data: Vec<u8>,
    ) {
        if let Some(attachment) = store.terminals.get(terminal_id).and_then(|t| t.attachment)
            && let Some(viewer) = self.viewers.get_mut(&attachment.viewer)
        {
            viewer.write(&data);
        }
        scrollback.append(terminal_id, data);
    }

    pub fn on_buffer_cleared(&mut self, store: &SessionStore, terminal_id: &str) {
        if let Some(attachment) = store.terminals.get(terminal_id).and_then(|t| t.attachment)
            && let Some(viewer) = self.viewers.get_mut(&attachment.viewer)
        {
            viewer.reset();
        }
    }

    pub fn on_input(
        &mut self,
        store: &SessionStore,
        view: &mut ViewState,
        viewer: ViewerId,
        input: ViewerInput,
        out: &mut Vec<ClientMessage>,
    ) {
        let Some(terminal) = store.terminals.attached_to(viewer) else {
            trace!(viewer, "input from unbound viewer dropped");
            return;
        };
        let id = terminal.info.id.clone();
        let data = match input {
            ViewerInput::Data(data) => data,
            ViewerInput::Newline => NEWLINE.to_vec(),
            ViewerInput::Focus => {
                view.focus(terminal.tab_id(), &id);
                return;
            }
            ViewerInput::Blur => {
                view.blur(&id);
                return;
            }
        };
        if terminal.pending {
            debug!(terminal_id = %id, "input for unconfirmed terminal dropped");
            return;
        }
        out.push(ClientMessage::TerminalInput { id, data });
    }

    pub fn resize(
        &mut self,
        store: &mut SessionStore,
        terminal_id: &str,
        cols: u16,
        rows: u16,
        out: &mut Vec<ClientMessage>,
    ) -> Result<(), SyncError> {
        let terminal = store
            .terminals
            .get_mut(terminal_id)
            .ok_or_else(|| SyncError::UnknownTerminal(terminal_id.to_string()))?;
        terminal.info.cols = cols;
        terminal.info.rows = rows;
        if !terminal.pending {
            out.push(ClientMessage::TerminalResize {
                id: terminal_id.to_string(),
                cols,
                rows,
            });
        }
        Ok(())
    }

    /// Move routing state from a temporary id to the confirmed one. The
    /// binding itself was already moved on the store entity.
    pub fn transfer(&mut self, from: &str, to: &str, out: &mut Vec<ClientMessage>) {
        if let Some(callback) = self.callbacks.remove(from) {
            self.callbacks.insert(to.to_string(), callback);
        }
        if self.ready.remove(from) {
            self.ready.insert(to.to_string());
        }
        if self.deferred.remove(from) {
            out.push(ClientMessage::TerminalAttach { id: to.to_string() });
        }
    }

    pub fn forget(&mut self, terminal_id: &str) {
        self.callbacks.remove(terminal_id);
        self.ready.remove(terminal_id);
        self.deferred.remove(terminal_id);
    }

    pub fn forget_all(&mut self) {
        self.callbacks.clear();
        self.ready.clear();
        self.deferred.clear();
    }

    pub fn viewer_count(&self) -> usize {
        self.viewers.len()
    }
}

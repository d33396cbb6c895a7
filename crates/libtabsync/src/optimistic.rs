use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, warn};

use tabsync_protocol::{
    ClientMessage, CreateTabParams, CreateTerminalParams, RequestId, TabId, TabInfo, TerminalId,
    TerminalInfo,
};

use crate::store::{Attachment, SessionStore, Tab, Terminal};

pub const TEMP_ID_PREFIX: &str = "tmp-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Terminal,
    Tab,
}

/// One step that undoes part of an optimistic mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InverseCommand {
    RemoveTerminal(TerminalId),
    InsertTerminal(Box<Terminal>),
    RemoveTab(TabId),
    InsertTab(Tab),
}

impl InverseCommand {
    fn apply(self, store: &mut SessionStore) {
        match self {
            Self::RemoveTerminal(id) => {
                store.terminals.remove(&id);
            }
            Self::InsertTerminal(terminal) => {
                store.terminals.add(*terminal);
            }
            Self::RemoveTab(id) => {
                store.tabs.remove(&id);
            }
            Self::InsertTab(tab) => {
                store.tabs.add(tab);
            }
        }
    }
}

/// Journal entry for an in-flight optimistic create.
#[derive(Debug, Clone)]
pub struct PendingOperation {
    pub request_id: RequestId,
    pub kind: EntityKind,
    pub temp_id: String,
    pub inverse: Vec<InverseCommand>,
    pub created_at: Instant,
    /// Create message not yet sent because its tab is itself unconfirmed.
    pub held: Option<ClientMessage>,
}

impl PendingOperation {
    fn new(kind: EntityKind, temp_id: String) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            kind,
            temp_id,
            inverse: Vec::new(),
            created_at: Instant::now(),
            held: None,
        }
    }

    fn insert_terminal(&mut self, store: &mut SessionStore, terminal: Terminal) {
        let id = terminal.info.id.clone();
        if let Some(previous) = store.terminals.remove(&id) {
            self.inverse.push(InverseCommand::InsertTerminal(Box::new(previous)));
        }
        store.terminals.add(terminal);
        self.inverse.push(InverseCommand::RemoveTerminal(id));
    }

    fn insert_tab(&mut self, store: &mut SessionStore, tab: Tab) {
        let id = tab.info.id.clone();
        if let Some(previous) = store.tabs.remove(&id) {
            self.inverse.push(InverseCommand::InsertTab(previous));
        }
        store.tabs.add(tab);
        self.inverse.push(InverseCommand::RemoveTab(id));
    }

    /// Undo every recorded step, newest first.
    fn roll_back(&self, store: &mut SessionStore) {
        for command in self.inverse.iter().rev() {
            command.clone().apply(store);
        }
    }

    fn waits_for_tab(&self, tab_id: &str) -> bool {
        matches!(
            &self.held,
            Some(ClientMessage::TerminalCreate { params, .. }) if params.tab_id.as_deref() == Some(tab_id)
        )
    }

    /// Hand out the held create with the tab's confirmed id filled in.
    fn release(&mut self, real_tab_id: &str) -> Option<ClientMessage> {
        match self.held.take()? {
            ClientMessage::TerminalCreate {
                request_id,
                temp_id,
                mut params,
            } => {
                params.tab_id = Some(real_tab_id.to_string());
                Some(ClientMessage::TerminalCreate {
                    request_id,
                    temp_id,
                    params,
                })
            }
            other => Some(other),
        }
    }
}

/// A freshly applied optimistic create. `message` is `None` while the
/// create waits for its tab to be confirmed.
#[derive(Debug, Clone, PartialEq)]
pub struct Issued {
    pub request_id: RequestId,
    pub temp_id: String,
    pub message: Option<ClientMessage>,
}

/// Outcome of a successful confirmation.
#[derive(Debug, Clone, PartialEq)]
pub struct Confirmed {
    pub request_id: RequestId,
    pub kind: EntityKind,
    pub temp_id: String,
    pub real_id: String,
    pub is_new: bool,
    /// Whether the temporary entity's viewer moved to the real one.
    pub transferred: bool,
    /// Binding the real terminal had before the transferred one replaced it.
    pub displaced: Option<Attachment>,
    /// Held child creates, rewritten to the real tab id and ready to send.
    pub released: Vec<ClientMessage>,
}

/// A create withdrawn locally after its message went out. The server may
/// still create the entity, which then has to be removed again.
#[derive(Debug, Clone, Copy)]
struct Tombstone {
    created_at: Instant,
}

/// Applies creates locally first and reconciles them with the server.
#[derive(Debug, Default)]
pub struct OptimisticEngine {
    pending: HashMap<RequestId, PendingOperation>,
    cancelled: HashMap<RequestId, Tombstone>,
}

pub fn new_temp_id() -> String {
    format!("{TEMP_ID_PREFIX}{}", uuid::Uuid::new_v4())
}

impl OptimisticEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn get(&self, request_id: &str) -> Option<&PendingOperation> {
        self.pending.get(request_id)
    }

    pub fn request_for_temp_id(&self, temp_id: &str) -> Option<&RequestId> {
        self.pending
            .values()
            .find(|op| op.temp_id == temp_id)
            .map(|op| &op.request_id)
    }

    fn is_pending_tab(&self, tab_id: &str) -> bool {
        self.pending
            .values()
            .any(|op| op.kind == EntityKind::Tab && op.temp_id == tab_id)
    }

    pub fn create_terminal(
        &mut self,
        store: &mut SessionStore,
        params: CreateTerminalParams,
    ) -> Issued {
        let mut op = PendingOperation::new(EntityKind::Terminal, new_temp_id());
        op.insert_terminal(store, Terminal::optimistic(op.temp_id.clone(), &params));
        let held = params
            .tab_id
            .as_deref()
            .is_some_and(|tab| self.is_pending_tab(tab));
        let message = ClientMessage::TerminalCreate {
            request_id: op.request_id.clone(),
            temp_id: op.temp_id.clone(),
            params,
        };
        let mut issued = Issued {
            request_id: op.request_id.clone(),
            temp_id: op.temp_id.clone(),
            message: None,
        };
        if held {
            debug!(request_id = %op.request_id, temp_id = %op.temp_id, "terminal create held until its tab is confirmed");
            op.held = Some(message);
        } else {
            debug!(request_id = %op.request_id, temp_id = %op.temp_id, "optimistic terminal created");
            issued.message = Some(message);
        }
        self.pending.insert(op.request_id.clone(), op);
        issued
    }

    pub fn create_tab(&mut self, store: &mut SessionStore, params: CreateTabParams) -> Issued {
        let mut op = PendingOperation::new(EntityKind::Tab, new_temp_id());
        let position = store.tabs.next_position();
        op.insert_tab(store, Tab::optimistic(op.temp_id.clone(), &params, position));
        let message = ClientMessage::TabCreate {
            request_id: op.request_id.clone(),
            temp_id: op.temp_id.clone(),
            params,
        };
        debug!(request_id = %op.request_id, temp_id = %op.temp_id, "optimistic tab created");
        let issued = Issued {
            request_id: op.request_id.clone(),
            temp_id: op.temp_id.clone(),
            message: Some(message),
        };
        self.pending.insert(op.request_id.clone(), op);
        issued
    }

    /// Whether a reply's request id, temp id and kind all match what this
    /// client tracks.
    fn matches(&self, request_id: &str, temp_id: Option<&str>, kind: Option<EntityKind>) -> bool {
        let Some(op) = self.pending.get(request_id) else {
            debug!(request_id = %request_id, "reply for untracked request ignored");
            return false;
        };
        if temp_id.is_some_and(|t| t != op.temp_id) || kind.is_some_and(|k| k != op.kind) {
            warn!(
                request_id = %request_id,
                temp_id = ?temp_id,
                tracked = %op.temp_id,
                "reply does not match tracked operation, ignored"
            );
            return false;
        }
        true
    }

    fn take_matching(
        &mut self,
        request_id: &str,
        temp_id: Option<&str>,
        kind: Option<EntityKind>,
    ) -> Option<PendingOperation> {
        if !self.matches(request_id, temp_id, kind) {
            return None;
        }
        self.pending.remove(request_id)
    }

    pub fn confirm_terminal(
        &mut self,
        store: &mut SessionStore,
        request_id: &str,
        temp_id: &str,
        real: TerminalInfo,
        is_new: bool,
    ) -> Option<Confirmed> {
        let op = self.take_matching(request_id, Some(temp_id), Some(EntityKind::Terminal))?;
        let attachment = store
            .terminals
            .get_mut(&op.temp_id)
            .and_then(|t| t.attachment.take());
        store.terminals.remove(&op.temp_id);

        let real_id = real.id.clone();
        if is_new {
            store.terminals.add(Terminal::confirmed(real));
        } else if !store.terminals.has(&real_id) {
            debug!(terminal_id = %real_id, "adopting existing terminal");
            store.terminals.add(Terminal::confirmed(real));
        }

        // One viewer per terminal: the viewer that asked for this create wins.
        let mut transferred = false;
        let mut displaced = None;
        if let Some(attachment) = attachment
            && let Some(terminal) = store.terminals.get_mut(&real_id)
        {
            displaced = terminal.attachment.replace(attachment);
            transferred = true;
        }

        Some(Confirmed {
            request_id: op.request_id,
            kind: EntityKind::Terminal,
            temp_id: op.temp_id,
            real_id,
            is_new,
            transferred,
            displaced,
            released: Vec::new(),
        })
    }

    pub fn confirm_tab(
        &mut self,
        store: &mut SessionStore,
        request_id: &str,
        temp_id: &str,
        real: TabInfo,
        is_new: bool,
    ) -> Option<Confirmed> {
        let op = self.take_matching(request_id, Some(temp_id), Some(EntityKind::Tab))?;
        store.tabs.remove(&op.temp_id);

        let real_id = real.id.clone();
        if is_new || !store.tabs.has(&real_id) {
            store.tabs.add(Tab::confirmed(real));
        }

        // Terminals created optimistically inside the temporary tab follow it.
        for terminal in store.terminals.values_mut() {
            if terminal.info.tab_id.as_deref() == Some(op.temp_id.as_str()) {
                terminal.info.tab_id = Some(real_id.clone());
            }
        }
        let mut waiting: Vec<&mut PendingOperation> = self
            .pending
            .values_mut()
            .filter(|child| child.waits_for_tab(&op.temp_id))
            .collect();
        waiting.sort_by_key(|child| child.created_at);
        let released = waiting
            .into_iter()
            .filter_map(|child| child.release(&real_id))
            .collect();

        Some(Confirmed {
            request_id: op.request_id,
            kind: EntityKind::Tab,
            temp_id: op.temp_id,
            real_id,
            is_new,
            transferred: false,
            displaced: None,
            released,
        })
    }

    /// Fully undo a rejected create, together with any terminal create held
    /// for a rejected tab. Returns the rolled-back operations, newest first.
    pub fn reject(
        &mut self,
        store: &mut SessionStore,
        request_id: &str,
        temp_id: Option<&str>,
    ) -> Vec<PendingOperation> {
        if !self.matches(request_id, temp_id, None) {
            return Vec::new();
        }
        let ids = self.with_children(vec![request_id.to_string()]);
        self.roll_back_all(store, ids)
    }

    /// Withdraw a pending create before the server answered. Creates that
    /// were already sent leave a tombstone; see [`Self::take_cancelled`].
    pub fn cancel(&mut self, store: &mut SessionStore, temp_id: &str) -> Vec<PendingOperation> {
        let Some(request_id) = self.request_for_temp_id(temp_id).cloned() else {
            return Vec::new();
        };
        let ids = self.with_children(vec![request_id]);
        let ops = self.roll_back_all(store, ids);
        for op in ops.iter().filter(|op| op.held.is_none()) {
            debug!(request_id = %op.request_id, temp_id = %op.temp_id, "sent create cancelled");
            self.cancelled.insert(
                op.request_id.clone(),
                Tombstone {
                    created_at: op.created_at,
                },
            );
        }
        ops
    }

    /// Consume the tombstone of a cancelled create. True when the reply
    /// belongs to a create this client withdrew.
    pub fn take_cancelled(&mut self, request_id: &str) -> bool {
        self.cancelled.remove(request_id).is_some()
    }

    pub fn cancelled_len(&self) -> usize {
        self.cancelled.len()
    }

    /// Drop every pending create after the connection was lost; their
    /// server-side outcome is unknown and the next resync decides.
    pub fn clear_stale(&mut self, store: &mut SessionStore) -> Vec<PendingOperation> {
        self.cancelled.clear();
        let stale: Vec<RequestId> = self.pending.keys().cloned().collect();
        self.roll_back_all(store, stale)
    }

    /// Roll back operations that have waited longer than `ttl`. A tab's
    /// held children go with it.
    pub fn expire(
        &mut self,
        store: &mut SessionStore,
        now: Instant,
        ttl: Duration,
    ) -> Vec<PendingOperation> {
        self.cancelled
            .retain(|_, tombstone| now.saturating_duration_since(tombstone.created_at) < ttl);
        let expired: Vec<RequestId> = self
            .pending
            .values()
            .filter(|op| now.saturating_duration_since(op.created_at) >= ttl)
            .map(|op| op.request_id.clone())
            .collect();
        let ids = self.with_children(expired);
        self.roll_back_all(store, ids)
    }

    /// Extend `ids` with the held terminal creates of every tab among them.
    fn with_children(&self, mut ids: Vec<RequestId>) -> Vec<RequestId> {
        let tabs: Vec<String> = ids
            .iter()
            .filter_map(|id| self.pending.get(id))
            .filter(|op| op.kind == EntityKind::Tab)
            .map(|op| op.temp_id.clone())
            .collect();
        for op in self.pending.values() {
            if !ids.contains(&op.request_id) && tabs.iter().any(|tab| op.waits_for_tab(tab)) {
                ids.push(op.request_id.clone());
            }
        }
        ids
    }

    fn roll_back_all(
        &mut self,
        store: &mut SessionStore,
        request_ids: Vec<RequestId>,
    ) -> Vec<PendingOperation> {
        let mut ops: Vec<PendingOperation> = request_ids
            .iter()
            .filter_map(|id| self.pending.remove(id))
            .collect();
        // Newest first so nested creates unwind in order.
        ops.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        for op in &ops {
            op.roll_back(store);
        }
        ops
    }
}

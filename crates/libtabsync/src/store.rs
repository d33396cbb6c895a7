use std::collections::BTreeMap;
use std::time::SystemTime;

use tabsync_protocol::{
    CreateTabParams, CreateTerminalParams, TabId, TabInfo, TerminalId, TerminalInfo,
    TerminalStatus,
};

/// Handle of a registered viewer. Terminals only ever hold this id,
/// never the viewer itself.
pub type ViewerId = u64;
/// Identifies one binding of a viewer's input to a terminal.
pub type SubscriptionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attachment {
    pub viewer: ViewerId,
    pub subscription: SubscriptionId,
}

/// Anything kept in a [`Collection`].
pub trait Entity {
    fn id(&self) -> &str;

    /// Drop any viewer binding before the entity leaves the store.
    fn release(&mut self) -> Option<Attachment> {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Terminal {
    pub info: TerminalInfo,
    /// True while `info.id` is a temporary id awaiting confirmation.
    pub pending: bool,
    pub attachment: Option<Attachment>,
}

impl Terminal {
    pub fn confirmed(info: TerminalInfo) -> Self {
        Self {
            info,
            pending: false,
            attachment: None,
        }
    }

    pub fn optimistic(temp_id: TerminalId, params: &CreateTerminalParams) -> Self {
        Self {
            info: TerminalInfo {
                id: temp_id,
                name: params.name.clone(),
                cwd: params.cwd.clone(),
                status: TerminalStatus::Running,
                exit_code: None,
                cols: params.cols,
                rows: params.rows,
                created_at_epoch_ms: epoch_ms(SystemTime::now()),
                tab_id: params.tab_id.clone(),
                position: params.position,
            },
            pending: true,
            attachment: None,
        }
    }

    pub fn tab_id(&self) -> Option<&str> {
        self.info.tab_id.as_deref()
    }
}

impl Entity for Terminal {
    fn id(&self) -> &str {
        &self.info.id
    }

    fn release(&mut self) -> Option<Attachment> {
        self.attachment.take()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tab {
    pub info: TabInfo,
    pub pending: bool,
}

impl Tab {
    pub fn confirmed(info: TabInfo) -> Self {
        Self {
            info,
            pending: false,
        }
    }

    pub fn optimistic(temp_id: TabId, params: &CreateTabParams, position: u32) -> Self {
        Self {
            info: TabInfo {
                id: temp_id,
                name: params.name.clone(),
                position: params.position.unwrap_or(position),
                cwd: params.cwd.clone(),
            },
            pending: true,
        }
    }
}

impl Entity for Tab {
    fn id(&self) -> &str {
        &self.info.id
    }
}

/// Id-keyed entity collection. Ordered so that equal contents compare equal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collection<T> {
    items: BTreeMap<String, T>,
}

impl<T> Default for Collection<T> {
    fn default() -> Self {
        Self {
            items: BTreeMap::new(),
        }
    }
}

impl<T: Entity> Collection<T> {
    pub fn get(&self, id: &str) -> Option<&T> {
        self.items.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut T> {
        self.items.get_mut(id)
    }

    pub fn has(&self, id: &str) -> bool {
        self.items.contains_key(id)
    }

    /// Insert unless the id is already present. Duplicate delivery from the
    /// network is normal, so this never replaces an existing entry.
    pub fn add(&mut self, entity: T) -> bool {
        if self.items.contains_key(entity.id()) {
            return false;
        }
        self.items.insert(entity.id().to_string(), entity);
        true
    }

    pub fn remove(&mut self, id: &str) -> Option<T> {
        let mut entity = self.items.remove(id)?;
        entity.release();
        Some(entity)
    }

    /// Install a full resync snapshot after releasing every current entity.
    pub fn replace_all(&mut self, entities: impl IntoIterator<Item = T>) {
        self.clear();
        for entity in entities {
            self.add(entity);
        }
    }

    pub fn clear(&mut self) {
        for entity in self.items.values_mut() {
            entity.release();
        }
        self.items.clear();
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.items.values()
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.items.values_mut()
    }
}

impl Collection<Terminal> {
    /// Terminals of one tab ordered by their position in it.
    pub fn by_tab(&self, tab_id: &str) -> Vec<&Terminal> {
        let mut terminals: Vec<&Terminal> = self
            .values()
            .filter(|t| t.tab_id() == Some(tab_id))
            .collect();
        terminals.sort_by_key(|t| {
            (
                t.info.position.unwrap_or(u32::MAX),
                t.info.created_at_epoch_ms,
            )
        });
        terminals
    }

    /// Terminals that belong to no tab, oldest first.
    pub fn task_terminals(&self) -> Vec<&Terminal> {
        let mut terminals: Vec<&Terminal> =
            self.values().filter(|t| t.info.tab_id.is_none()).collect();
        terminals.sort_by_key(|t| t.info.created_at_epoch_ms);
        terminals
    }

    pub fn attached_to(&self, viewer: ViewerId) -> Option<&Terminal> {
        self.values()
            .find(|t| t.attachment.is_some_and(|a| a.viewer == viewer))
    }
}

impl Collection<Tab> {
    pub fn sorted(&self) -> Vec<&Tab> {
        let mut tabs: Vec<&Tab> = self.values().collect();
        tabs.sort_by(|a, b| {
            a.info
                .position
                .cmp(&b.info.position)
                .then_with(|| a.info.id.cmp(&b.info.id))
        });
        tabs
    }

    pub fn first(&self) -> Option<&Tab> {
        self.sorted().into_iter().next()
    }

    pub fn next_position(&self) -> u32 {
        self.values()
            .map(|t| t.info.position.saturating_add(1))
            .max()
            .unwrap_or(0)
    }
}

/// The client's mirror of server terminals and tabs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStore {
    pub terminals: Collection<Terminal>,
    pub tabs: Collection<Tab>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

pub(crate) fn epoch_ms(at: SystemTime) -> u64 {
    at.duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

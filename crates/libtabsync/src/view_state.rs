use std::collections::HashMap;
use std::time::SystemTime;

use tabsync_protocol::{TabId, TerminalId};

/// Route name of the terminal workspace view.
pub const TERMINALS_ROUTE: &str = "terminals";

/// UI focus bookkeeping used for reconnection and notification suppression.
/// Task terminals (no tab) share the `None` scope.
#[derive(Debug, Clone)]
pub struct ViewState {
    last_focused: HashMap<Option<TabId>, TerminalId>,
    focused: Option<TerminalId>,
    route: Option<String>,
    visible: bool,
    updated_at: SystemTime,
}

impl Default for ViewState {
    fn default() -> Self {
        Self {
            last_focused: HashMap::new(),
            focused: None,
            route: None,
            visible: true,
            updated_at: SystemTime::now(),
        }
    }
}

impl ViewState {
    pub fn focus(&mut self, tab_id: Option<&str>, terminal_id: &str) {
        self.last_focused
            .insert(tab_id.map(str::to_string), terminal_id.to_string());
        self.focused = Some(terminal_id.to_string());
        self.touch();
    }

    pub fn blur(&mut self, terminal_id: &str) {
        if self.focused.as_deref() == Some(terminal_id) {
            self.focused = None;
        }
        self.touch();
    }

    pub fn last_focused(&self, tab_id: Option<&str>) -> Option<&TerminalId> {
        self.last_focused.get(&tab_id.map(str::to_string))
    }

    pub fn focused(&self) -> Option<&TerminalId> {
        self.focused.as_ref()
    }

    pub fn set_route(&mut self, route: Option<String>) {
        self.route = route;
        self.touch();
    }

    pub fn set_visible(&mut self, visible: bool) {
        self.visible = visible;
        self.touch();
    }

    pub fn updated_at(&self) -> SystemTime {
        self.updated_at
    }

    /// A notification about a terminal is pointless while the user is
    /// looking straight at it.
    pub fn should_notify(&self, terminal_id: &str) -> bool {
        let watching = self.visible
            && self.route.as_deref() == Some(TERMINALS_ROUTE)
            && self.focused.as_deref() == Some(terminal_id);
        !watching
    }

    pub fn retarget(&mut self, from: &str, to: &str) {
        for id in self.last_focused.values_mut() {
            if id == from {
                *id = to.to_string();
            }
        }
        if self.focused.as_deref() == Some(from) {
            self.focused = Some(to.to_string());
        }
    }

    pub fn forget(&mut self, terminal_id: &str) {
        self.last_focused.retain(|_, id| id != terminal_id);
        if self.focused.as_deref() == Some(terminal_id) {
            self.focused = None;
        }
    }

    fn touch(&mut self) {
        self.updated_at = SystemTime::now();
    }
}

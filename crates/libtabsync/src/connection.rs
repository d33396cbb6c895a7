use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use tabsync_protocol::ClientMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// Exponential reconnect schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub base_interval: Duration,
    pub growth_factor: f64,
    pub max_attempts: u32,
    pub max_interval: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_secs(1),
            growth_factor: 1.5,
            max_attempts: 10,
            max_interval: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    /// `base * growth^attempt`, capped at `max_interval`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let factor = self.growth_factor.max(1.0).powi(exponent);
        let millis = self.base_interval.as_millis() as f64 * factor;
        let capped = millis.min(self.max_interval.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseAction {
    Reconnect { after: Duration, attempt: u32 },
    Offline,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseOutcome {
    /// The channel had been open, so pending creates are now stale.
    pub was_connected: bool,
    pub action: CloseAction,
}

/// Lifecycle of the single duplex channel to the server.
/// `ready` requires an open channel and a completed resync.
#[derive(Debug)]
pub struct ConnectionManager {
    status: ConnectionStatus,
    terminals_synced: bool,
    tabs_synced: bool,
    attempts: u32,
    offline: bool,
    policy: ReconnectPolicy,
}

impl ConnectionManager {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            terminals_synced: false,
            tabs_synced: false,
            attempts: 0,
            offline: false,
            policy,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn is_open(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }

    pub fn is_initialized(&self) -> bool {
        self.terminals_synced && self.tabs_synced
    }

    pub fn is_ready(&self) -> bool {
        self.is_open() && self.is_initialized()
    }

    pub fn is_offline(&self) -> bool {
        self.offline
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn on_connecting(&mut self) {
        self.status = ConnectionStatus::Connecting;
    }

    pub fn on_open(&mut self) {
        info!(attempts = self.attempts, "connected to session server");
        self.status = ConnectionStatus::Connected;
        self.attempts = 0;
        self.offline = false;
        self.terminals_synced = false;
        self.tabs_synced = false;
    }

    /// Returns true when this resync step made the store ready.
    pub fn on_terminals_synced(&mut self) -> bool {
        let was_ready = self.is_ready();
        self.terminals_synced = true;
        !was_ready && self.is_ready()
    }

    pub fn on_tabs_synced(&mut self) -> bool {
        let was_ready = self.is_ready();
        self.tabs_synced = true;
        !was_ready && self.is_ready()
    }

    /// Connection closed or a connect attempt failed.
    pub fn on_close(&mut self) -> CloseOutcome {
        let was_connected = self.status == ConnectionStatus::Connected;
        self.status = ConnectionStatus::Disconnected;
        self.terminals_synced = false;
        self.tabs_synced = false;

        let action = if self.attempts < self.policy.max_attempts {
            let after = self.policy.delay(self.attempts);
            self.attempts += 1;
            debug!(attempt = self.attempts, delay_ms = after.as_millis() as u64, "reconnect scheduled");
            CloseAction::Reconnect {
                after,
                attempt: self.attempts,
            }
        } else {
            warn!(attempts = self.attempts, "giving up on reconnect, offline");
            self.offline = true;
            CloseAction::Offline
        };
        CloseOutcome {
            was_connected,
            action,
        }
    }

    /// Manual retry after going offline.
    pub fn reset_attempts(&mut self) {
        self.attempts = 0;
        self.offline = false;
    }

    /// Outbound messages are dropped, not queued, while the channel is down.
    pub fn gate(&self, message: ClientMessage) -> Option<ClientMessage> {
        if self.is_open() {
            Some(message)
        } else {
            debug!(target_id = %message.target_id(), "channel not open, dropping outbound message");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ReconnectPolicy {
        ReconnectPolicy {
            base_interval: Duration::from_millis(100),
            growth_factor: 2.0,
            max_attempts: 3,
            max_interval: Duration::from_secs(60),
        }
    }

    #[test]
    fn delay_grows_and_caps() {
        let p = ReconnectPolicy {
            max_interval: Duration::from_millis(500),
            ..policy()
        };
        assert_eq!(p.delay(0), Duration::from_millis(100));
        assert_eq!(p.delay(1), Duration::from_millis(200));
        assert_eq!(p.delay(2), Duration::from_millis(400));
        assert_eq!(p.delay(3), Duration::from_millis(500));
        assert_eq!(p.delay(u32::MAX), Duration::from_millis(500));
    }

    #[test]
    fn ready_needs_both_resync_lists() {
        let mut conn = ConnectionManager::new(policy());
        conn.on_connecting();
        assert_eq!(conn.status(), ConnectionStatus::Connecting);
        conn.on_open();
        assert!(conn.is_open());
        assert!(!conn.is_ready());

        assert!(!conn.on_terminals_synced());
        assert!(conn.on_tabs_synced());
        assert!(conn.is_ready());
        assert!(!conn.on_tabs_synced());
    }

    #[test]
    fn close_after_open_reports_was_connected() {
        let mut conn = ConnectionManager::new(policy());
        conn.on_open();
        conn.on_terminals_synced();
        conn.on_tabs_synced();

        let outcome = conn.on_close();
        assert!(outcome.was_connected);
        assert!(!conn.is_initialized());
        assert_eq!(
            outcome.action,
            CloseAction::Reconnect {
                after: Duration::from_millis(100),
                attempt: 1
            }
        );
    }

    #[test]
    fn goes_offline_after_max_attempts() {
        let mut conn = ConnectionManager::new(policy());
        for expected in 1..=3 {
            let outcome = conn.on_close();
            assert!(!outcome.was_connected);
            assert!(matches!(outcome.action, CloseAction::Reconnect { attempt, .. } if attempt == expected));
        }
        assert_eq!(conn.on_close().action, CloseAction::Offline);
        assert!(conn.is_offline());

        conn.reset_attempts();
        assert!(!conn.is_offline());
        assert_eq!(conn.attempts(), 0);
    }

    #[test]
    fn open_resets_attempts() {
        let mut conn = ConnectionManager::new(policy());
        conn.on_close();
        conn.on_close();
        assert_eq!(conn.attempts(), 2);
        conn.on_open();
        assert_eq!(conn.attempts(), 0);
    }

    #[test]
    fn gate_drops_while_closed() {
        let mut conn = ConnectionManager::new(policy());
        let msg = ClientMessage::TerminalAttach {
            id: "t1".to_string(),
        };
        assert!(conn.gate(msg.clone()).is_none());
        conn.on_open();
        assert_eq!(conn.gate(msg.clone()), Some(msg));
    }
}

use thiserror::Error;
use tabsync_protocol::{RequestId, TabId, TerminalId};

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("terminal not found: {0}")]
    UnknownTerminal(TerminalId),

    #[error("tab not found: {0}")]
    UnknownTab(TabId),

    #[error("viewer not registered: {0}")]
    UnknownViewer(u64),

    #[error("request {request_id} rejected by server: {message}")]
    Rejected {
        request_id: RequestId,
        message: String,
    },

    #[error("request {0} timed out waiting for the server")]
    PendingTimeout(RequestId),

    #[error("not connected to the session server")]
    NotConnected,

    #[error("sync runtime is not running")]
    ChannelClosed,

    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Errors that resolve themselves through reconnect and resync.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::NotConnected | Self::ChannelClosed | Self::Io(_) | Self::PendingTimeout(_)
        )
    }
}

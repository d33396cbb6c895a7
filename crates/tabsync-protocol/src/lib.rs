pub mod paths;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Unique identifier for a terminal (server-assigned or temporary).
pub type TerminalId = String;
/// Unique identifier for a tab.
pub type TabId = String;
/// Correlates an optimistic create with the server's reply.
pub type RequestId = String;

/// Upper bound for a single JSON frame.
pub const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// Lifecycle state of a terminal's process.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TerminalStatus {
    #[default]
    Running,
    Exited,
    Error,
}

/// Server snapshot of a terminal.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TerminalInfo {
    pub id: TerminalId,
    pub name: String,
    pub cwd: PathBuf,
    #[serde(default)]
    pub status: TerminalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_rows")]
    pub rows: u16,
    #[serde(default)]
    pub created_at_epoch_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tab_id: Option<TabId>,
    /// Position within the owning tab.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<u32>,
}

/// Server snapshot of a tab.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TabInfo {
    pub id: TabId,
    pub name: String,
    #[serde(default)]
    pub position: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
}

/// Parameters forwarded to the terminal process adapter on creation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CreateTerminalParams {
    pub name: String,
    pub cwd: PathBuf,
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_rows")]
    pub rows: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tab_id: Option<TabId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<u32>,
    /// Startup commands written to the shell once it is running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_input: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CreateTabParams {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<u32>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TabPosition {
    pub id: TabId,
    pub position: u32,
}

/// Client-to-server messages, framed as `{ "type": ..., "payload": ... }`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    #[serde(rename = "terminal:create")]
    TerminalCreate {
        request_id: RequestId,
        temp_id: TerminalId,
        params: CreateTerminalParams,
    },
    #[serde(rename = "terminal:destroy")]
    TerminalDestroy { id: TerminalId },
    #[serde(rename = "terminal:input")]
    TerminalInput {
        id: TerminalId,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    #[serde(rename = "terminal:attach")]
    TerminalAttach { id: TerminalId },
    #[serde(rename = "terminal:resize")]
    TerminalResize { id: TerminalId, cols: u16, rows: u16 },
    #[serde(rename = "terminal:rename")]
    TerminalRename { id: TerminalId, name: String },
    #[serde(rename = "terminal:assignTab")]
    TerminalAssignTab {
        id: TerminalId,
        tab_id: Option<TabId>,
        position: Option<u32>,
    },
    #[serde(rename = "terminal:clearBuffer")]
    TerminalClearBuffer { id: TerminalId },
    #[serde(rename = "tab:create")]
    TabCreate {
        request_id: RequestId,
        temp_id: TabId,
        params: CreateTabParams,
    },
    #[serde(rename = "tab:update")]
    TabUpdate {
        id: TabId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<PathBuf>,
    },
    #[serde(rename = "tab:delete")]
    TabDelete { id: TabId },
    #[serde(rename = "tab:reorder")]
    TabReorder { ids: Vec<TabId> },
}

/// Server-to-client messages, framed as `{ "type": ..., "payload": ... }`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    #[serde(rename = "terminals:list")]
    TerminalsList(Vec<TerminalInfo>),
    #[serde(rename = "tabs:list")]
    TabsList(Vec<TabInfo>),
    #[serde(rename = "terminal:created")]
    TerminalCreated {
        request_id: RequestId,
        temp_id: TerminalId,
        terminal: TerminalInfo,
        #[serde(default = "default_true")]
        is_new: bool,
    },
    #[serde(rename = "terminal:destroyed")]
    TerminalDestroyed { id: TerminalId },
    #[serde(rename = "terminal:output")]
    TerminalOutput {
        id: TerminalId,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    #[serde(rename = "terminal:attached")]
    TerminalAttached {
        id: TerminalId,
        #[serde(with = "base64_bytes")]
        buffer: Vec<u8>,
    },
    #[serde(rename = "terminal:renamed")]
    TerminalRenamed { id: TerminalId, name: String },
    #[serde(rename = "terminal:tabAssigned")]
    TerminalTabAssigned {
        id: TerminalId,
        #[serde(default)]
        tab_id: Option<TabId>,
        #[serde(default)]
        position: Option<u32>,
    },
    #[serde(rename = "terminal:bufferCleared")]
    TerminalBufferCleared { id: TerminalId },
    #[serde(rename = "terminal:exit")]
    TerminalExit {
        id: TerminalId,
        #[serde(default)]
        exit_code: Option<i32>,
    },
    #[serde(rename = "terminal:error")]
    TerminalError {
        #[serde(default)]
        id: Option<TerminalId>,
        #[serde(default)]
        request_id: Option<RequestId>,
        #[serde(default)]
        temp_id: Option<TerminalId>,
        message: String,
    },
    #[serde(rename = "tab:created")]
    TabCreated {
        request_id: RequestId,
        temp_id: TabId,
        tab: TabInfo,
        #[serde(default = "default_true")]
        is_new: bool,
    },
    #[serde(rename = "tab:updated")]
    TabUpdated(TabInfo),
    #[serde(rename = "tab:deleted")]
    TabDeleted { id: TabId },
    #[serde(rename = "tab:reordered")]
    TabReordered { tabs: Vec<TabPosition> },
    #[serde(rename = "sync:stale")]
    SyncStale {
        id: String,
        #[serde(default)]
        request_id: Option<RequestId>,
        #[serde(default)]
        temp_id: Option<String>,
    },
}

impl ClientMessage {
    /// Terminal or tab id this message targets, for log fields.
    pub fn target_id(&self) -> &str {
        match self {
            Self::TerminalCreate { temp_id, .. } | Self::TabCreate { temp_id, .. } => temp_id,
            Self::TerminalDestroy { id }
            | Self::TerminalInput { id, .. }
            | Self::TerminalAttach { id }
            | Self::TerminalResize { id, .. }
            | Self::TerminalRename { id, .. }
            | Self::TerminalAssignTab { id, .. }
            | Self::TerminalClearBuffer { id }
            | Self::TabUpdate { id, .. }
            | Self::TabDelete { id } => id,
            Self::TabReorder { .. } => "",
        }
    }
}

fn default_cols() -> u16 {
    80
}

fn default_rows() -> u16 {
    24
}

fn default_true() -> bool {
    true
}

/// Base64 encoding for byte arrays in JSON.
mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

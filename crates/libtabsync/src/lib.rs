pub mod config;
pub mod connection;
pub mod error;
pub mod optimistic;
pub mod router;
pub mod runtime;
pub mod scrollback;
pub mod session;
pub mod store;
pub mod view_state;

pub use config::ClientConfig;
pub use connection::{ConnectionManager, ConnectionStatus, ReconnectPolicy};
pub use error::SyncError;
pub use optimistic::EntityKind;
pub use router::{AttachCallback, DetachHandle, Viewer, ViewerInput};
pub use runtime::{SyncHandle, SyncRuntime, wait_for_confirmation};
pub use scrollback::{ScrollbackBuffer, ScrollbackStore};
pub use session::{StoreSnapshot, SyncCore, SyncEvent, TabView, TerminalView};
pub use store::{SessionStore, Tab, Terminal, ViewerId};

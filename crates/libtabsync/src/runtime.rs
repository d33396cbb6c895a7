use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, info, trace, warn};

use tabsync_protocol::{CreateTabParams, CreateTerminalParams, TabId, TerminalId};

use crate::config::ClientConfig;
use crate::connection::CloseAction;
use crate::session::{StoreSnapshot, SyncCore, SyncEvent};
use crate::error::SyncError;
use crate::router::{AttachCallback, DetachHandle, Viewer, ViewerInput};
use crate::store::ViewerId;

const EVENT_CAPACITY: usize = 1024;
const COMMAND_CAPACITY: usize = 256;
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

type Apply = Box<dyn FnOnce(&mut SyncCore) + Send>;

enum Command {
    Apply(Apply),
    Reconnect,
}

/// Why a phase of the driver loop ended.
enum Exit {
    Closed,
    Resume,
    Shutdown,
}

/// Owns the driver task. Dropping it stops the driver without waiting for
/// the final scrollback flush.
pub struct SyncRuntime {
    handle: SyncHandle,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SyncRuntime {
    pub fn start(config: &ClientConfig) -> (Self, broadcast::Receiver<SyncEvent>) {
        let core = SyncCore::new(config);
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (events_tx, events_rx) = broadcast::channel(EVENT_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let driver = Driver {
            core,
            socket_path: config.socket_path.clone(),
            max_line_bytes: config.max_line_bytes,
            commands: cmd_rx,
            events: events_tx.clone(),
            shutdown: shutdown_rx,
        };
        let task = tokio::spawn(driver.run());
        info!(socket = %config.socket_path.display(), "sync runtime started");

        let runtime = Self {
            handle: SyncHandle {
                commands: cmd_tx,
                events: events_tx,
            },
            shutdown_tx,
            task,
        };
        (runtime, events_rx)
    }

    pub fn handle(&self) -> SyncHandle {
        self.handle.clone()
    }

    /// Stop the driver and wait until scrollback has been written out.
    pub async fn shutdown(self) {
        self.shutdown_tx.send_replace(true);
        if let Err(err) = self.task.await {
            warn!("sync driver task failed: {err}");
        }
    }
}

/// Cheap, cloneable front door to the single-threaded core.
#[derive(Clone)]
pub struct SyncHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<SyncEvent>,
}

impl SyncHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Run `f` on the core between two inbound messages.
    pub async fn call<R, F>(&self, f: F) -> Result<R, SyncError>
    where
        F: FnOnce(&mut SyncCore) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let apply: Apply = Box::new(move |core| {
            let _ = tx.send(f(core));
        });
        self.commands
            .send(Command::Apply(apply))
            .await
            .map_err(|_| SyncError::ChannelClosed)?;
        rx.await.map_err(|_| SyncError::ChannelClosed)
    }

    /// Returns the temporary id; see [`wait_for_confirmation`].
    pub async fn create_terminal(&self, params: CreateTerminalParams) -> Result<TerminalId, SyncError> {
        self.call(move |core| core.create_terminal(params)).await?
    }

    pub async fn create_tab(&self, params: CreateTabParams) -> Result<TabId, SyncError> {
        self.call(move |core| core.create_tab(params)).await?
    }

    pub async fn destroy_terminal(&self, id: TerminalId) -> Result<(), SyncError> {
        self.call(move |core| core.destroy_terminal(&id)).await?
    }

    pub async fn rename_terminal(&self, id: TerminalId, name: String) -> Result<(), SyncError> {
        self.call(move |core| core.rename_terminal(&id, name)).await?
    }

    pub async fn assign_tab(
        &self,
        id: TerminalId,
        tab_id: Option<TabId>,
        position: Option<u32>,
    ) -> Result<(), SyncError> {
        self.call(move |core| core.assign_tab(&id, tab_id, position))
            .await?
    }

    pub async fn clear_buffer(&self, id: TerminalId) -> Result<(), SyncError> {
        self.call(move |core| core.clear_buffer(&id)).await?
    }

    pub async fn resize(&self, id: TerminalId, cols: u16, rows: u16) -> Result<(), SyncError> {
        self.call(move |core| core.resize(&id, cols, rows)).await?
    }

    pub async fn update_tab(
        &self,
        id: TabId,
        name: Option<String>,
        cwd: Option<PathBuf>,
    ) -> Result<(), SyncError> {
        self.call(move |core| core.update_tab(&id, name, cwd)).await?
    }

    pub async fn delete_tab(&self, id: TabId) -> Result<(), SyncError> {
        self.call(move |core| core.delete_tab(&id)).await?
    }

    pub async fn reorder_tabs(&self, ids: Vec<TabId>) -> Result<(), SyncError> {
        self.call(move |core| core.reorder_tabs(ids)).await
    }

    pub async fn register_viewer(&self, viewer: Box<dyn Viewer>) -> Result<ViewerId, SyncError> {
        self.call(move |core| core.register_viewer(viewer)).await
    }

    pub async fn unregister_viewer(&self, viewer: ViewerId) -> Result<(), SyncError> {
        self.call(move |core| core.unregister_viewer(viewer)).await
    }

    pub async fn attach(
        &self,
        id: TerminalId,
        viewer: ViewerId,
        on_attached: Option<AttachCallback>,
    ) -> Result<DetachHandle, SyncError> {
        self.call(move |core| core.attach(&id, viewer, on_attached))
            .await?
    }

    pub async fn detach(&self, handle: DetachHandle) -> Result<bool, SyncError> {
        self.call(move |core| core.detach(handle)).await
    }

    pub async fn input(&self, viewer: ViewerId, input: ViewerInput) -> Result<(), SyncError> {
        self.call(move |core| core.viewer_input(viewer, input)).await
    }

    pub async fn set_route(&self, route: Option<String>) -> Result<(), SyncError> {
        self.call(move |core| core.set_route(route)).await
    }

    pub async fn set_visible(&self, visible: bool) -> Result<(), SyncError> {
        self.call(move |core| core.set_visible(visible)).await
    }

    pub async fn snapshot(&self) -> Result<StoreSnapshot, SyncError> {
        self.call(|core| core.snapshot()).await
    }

    pub async fn scrollback(&self, id: TerminalId) -> Result<Vec<u8>, SyncError> {
        self.call(move |core| core.scrollback().contents(&id)).await
    }

    /// Reset the backoff and retry at once, also after going offline.
    pub async fn reconnect(&self) -> Result<(), SyncError> {
        self.commands
            .send(Command::Reconnect)
            .await
            .map_err(|_| SyncError::ChannelClosed)
    }
}

/// Wait until the optimistic create behind `temp_id` is confirmed or
/// rolled back. Subscribe before issuing the create.
pub async fn wait_for_confirmation(
    events: &mut broadcast::Receiver<SyncEvent>,
    temp_id: &str,
) -> Result<String, SyncError> {
    loop {
        match events.recv().await {
            Ok(SyncEvent::Confirmed { temp_id: t, id, .. }) if t == temp_id => return Ok(id),
            Ok(SyncEvent::OperationRejected {
                temp_id: t,
                request_id,
                message,
                ..
            }) if t == temp_id => return Err(SyncError::Rejected { request_id, message }),
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "event receiver lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return Err(SyncError::ChannelClosed),
        }
    }
}

struct Driver {
    core: SyncCore,
    socket_path: PathBuf,
    max_line_bytes: usize,
    commands: mpsc::Receiver<Command>,
    events: broadcast::Sender<SyncEvent>,
    shutdown: watch::Receiver<bool>,
}

impl Driver {
    async fn run(mut self) {
        loop {
            self.core.on_connecting();
            let exit = match connect(&self.socket_path).await {
                Ok(stream) => self.drive(stream).await,
                Err(err) => {
                    debug!(socket = %self.socket_path.display(), "connect failed: {err}");
                    Exit::Closed
                }
            };
            if matches!(exit, Exit::Shutdown) {
                break;
            }

            let outcome = self.core.on_close();
            self.publish();
            let wait = match outcome.action {
                CloseAction::Reconnect { after, attempt } => {
                    info!(attempt, delay_ms = after.as_millis() as u64, "reconnecting");
                    Some(after)
                }
                CloseAction::Offline => None,
            };
            if matches!(self.idle(wait).await, Exit::Shutdown) {
                break;
            }
        }
        self.core.persist_scrollback();
        info!("sync runtime stopped");
    }

    /// Serve one open connection until it closes or shutdown is requested.
    async fn drive(&mut self, stream: UnixStream) -> Exit {
        let (read_half, write_half) = stream.into_split();
        let mut reader =
            FramedRead::new(read_half, LinesCodec::new_with_max_length(self.max_line_bytes));
        let mut writer =
            FramedWrite::new(write_half, LinesCodec::new_with_max_length(self.max_line_bytes));
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);

        self.core.on_open();
        loop {
            for message in self.core.take_outbox() {
                let line = match serde_json::to_string(&message) {
                    Ok(line) => line,
                    Err(err) => {
                        warn!("failed to encode outbound message: {err}");
                        continue;
                    }
                };
                trace!(target_id = %message.target_id(), "send");
                if let Err(err) = writer.send(line).await {
                    warn!("write to session server failed: {err}");
                    return Exit::Closed;
                }
            }
            self.publish();

            tokio::select! {
                frame = reader.next() => match frame {
                    Some(Ok(line)) => self.core.handle_line(&line),
                    Some(Err(err)) => {
                        warn!("read from session server failed: {err}");
                        return Exit::Closed;
                    }
                    None => {
                        info!("session server closed the connection");
                        return Exit::Closed;
                    }
                },
                command = self.commands.recv() => match command {
                    Some(Command::Apply(apply)) => apply(&mut self.core),
                    Some(Command::Reconnect) => self.core.reset_reconnect(),
                    None => return Exit::Shutdown,
                },
                _ = sweep.tick() => self.core.expire_pending(Instant::now()),
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        return Exit::Shutdown;
                    }
                }
            }
        }
    }

    /// Keep serving commands while disconnected. `None` waits for an
    /// explicit reconnect.
    async fn idle(&mut self, wait: Option<Duration>) -> Exit {
        let deadline = wait.map(|after| tokio::time::Instant::now() + after);
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            self.publish();
            let retry = async {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                _ = retry => return Exit::Resume,
                command = self.commands.recv() => match command {
                    Some(Command::Apply(apply)) => {
                        apply(&mut self.core);
                        // Nothing can be sent while closed.
                        self.core.take_outbox();
                    }
                    Some(Command::Reconnect) => {
                        self.core.reset_reconnect();
                        return Exit::Resume;
                    }
                    None => return Exit::Shutdown,
                },
                _ = sweep.tick() => self.core.expire_pending(Instant::now()),
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        return Exit::Shutdown;
                    }
                }
            }
        }
    }

    fn publish(&mut self) {
        for event in self.core.take_events() {
            debug!(event = ?event, "sync event");
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
    }
}

async fn connect(socket_path: &Path) -> std::io::Result<UnixStream> {
    UnixStream::connect(socket_path).await
}

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use libtabsync::{
    ClientConfig, SyncEvent, SyncHandle, SyncRuntime, TerminalView, Viewer, ViewerInput,
    wait_for_confirmation,
};
use tabsync_protocol::CreateTerminalParams;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

const READY_TIMEOUT: Duration = Duration::from_secs(10);

pub fn load_config(path: Option<&Path>, socket: Option<PathBuf>) -> anyhow::Result<ClientConfig> {
    let mut config = match path {
        Some(path) => ClientConfig::load_from(path)?,
        None => ClientConfig::load()?,
    };
    if let Some(socket) = socket {
        config.socket_path = socket;
    }
    Ok(config)
}

struct Session {
    runtime: SyncRuntime,
    handle: SyncHandle,
    events: broadcast::Receiver<SyncEvent>,
}

/// Start the runtime and wait for the first full resync.
async fn connect(config: &ClientConfig) -> anyhow::Result<Session> {
    let (runtime, mut events) = SyncRuntime::start(config);
    let socket = config.socket_path.display().to_string();

    let ready = tokio::time::timeout(READY_TIMEOUT, async {
        loop {
            match events.recv().await {
                Ok(SyncEvent::Ready) => return Ok(()),
                Ok(SyncEvent::Offline) => bail!("session server at {socket} is unreachable"),
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => bail!("sync runtime stopped"),
            }
        }
    })
    .await;

    match ready {
        Ok(Ok(())) => Ok(Session {
            handle: runtime.handle(),
            runtime,
            events,
        }),
        Ok(Err(err)) => {
            runtime.shutdown().await;
            Err(err)
        }
        Err(_) => {
            runtime.shutdown().await;
            bail!("timed out waiting for session server at {socket}")
        }
    }
}

/// Renders terminal output straight to stdout.
struct StdoutViewer;

impl Viewer for StdoutViewer {
    fn reset(&mut self) {}

    fn write(&mut self, data: &[u8]) {
        let mut out = std::io::stdout().lock();
        let _ = out.write_all(data);
        let _ = out.flush();
    }
}

/// Routes input only; output is discarded.
struct NullViewer;

impl Viewer for NullViewer {
    fn reset(&mut self) {}
    fn write(&mut self, _data: &[u8]) {}
}

fn print_terminal(terminal: &TerminalView, indent: &str) {
    let status = format!("{:?}", terminal.info.status).to_lowercase();
    let marker = if terminal.pending { " (pending)" } else { "" };
    println!(
        "{indent}{:<38} {:<8} {}x{}  {}{marker}",
        terminal.info.id, status, terminal.info.cols, terminal.info.rows, terminal.info.name
    );
}

pub async fn list(config: &ClientConfig, json: bool) -> anyhow::Result<()> {
    let session = connect(config).await?;
    let snapshot = session.handle.snapshot().await?;
    session.runtime.shutdown().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }
    for tab in &snapshot.tabs {
        println!("{} [{}]", tab.info.name, tab.info.id);
        for terminal in &tab.terminals {
            print_terminal(terminal, "  ");
        }
    }
    if !snapshot.task_terminals.is_empty() {
        println!("(task terminals)");
        for terminal in &snapshot.task_terminals {
            print_terminal(terminal, "  ");
        }
    }
    if snapshot.tabs.is_empty() && snapshot.task_terminals.is_empty() {
        println!("no terminals");
    }
    Ok(())
}

pub async fn create(config: &ClientConfig, params: CreateTerminalParams) -> anyhow::Result<()> {
    let mut session = connect(config).await?;
    let result = async {
        let temp_id = session.handle.create_terminal(params).await?;
        let id = tokio::time::timeout(
            READY_TIMEOUT,
            wait_for_confirmation(&mut session.events, &temp_id),
        )
        .await
        .context("timed out waiting for the server to create the terminal")??;
        anyhow::Ok(id)
    }
    .await;
    session.runtime.shutdown().await;

    println!("{}", result?);
    Ok(())
}

pub async fn tail(config: &ClientConfig, terminal: String) -> anyhow::Result<()> {
    let mut session = connect(config).await?;
    let viewer = session.handle.register_viewer(Box::new(StdoutViewer)).await?;
    if let Err(err) = session.handle.attach(terminal.clone(), viewer, None).await {
        session.runtime.shutdown().await;
        return Err(err.into());
    }

    loop {
        tokio::select! {
            event = session.events.recv() => match event {
                Ok(SyncEvent::TerminalExited { id, exit_code, .. }) if id == terminal => {
                    eprintln!("\n[terminal exited: {}]", exit_code.map_or("?".to_string(), |c| c.to_string()));
                    break;
                }
                Ok(SyncEvent::TerminalRemoved { id }) if id == terminal => {
                    eprintln!("\n[terminal removed]");
                    break;
                }
                Ok(SyncEvent::Offline) => {
                    eprintln!("\n[session server unreachable]");
                    break;
                }
                Ok(SyncEvent::Ready) => {
                    // Resync dropped every binding; re-attach.
                    session.handle.attach(terminal.clone(), viewer, None).await?;
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    session.runtime.shutdown().await;
    Ok(())
}

pub async fn send(
    config: &ClientConfig,
    terminal: String,
    input: String,
    enter: bool,
) -> anyhow::Result<()> {
    let session = connect(config).await?;
    let result = async {
        let viewer = session.handle.register_viewer(Box::new(NullViewer)).await?;
        session.handle.attach(terminal, viewer, None).await?;
        let mut data = input.into_bytes();
        if enter {
            data.push(b'\r');
        }
        session.handle.input(viewer, ViewerInput::Data(data)).await?;
        anyhow::Ok(())
    }
    .await;
    session.runtime.shutdown().await;
    result
}

pub async fn watch(config: &ClientConfig) -> anyhow::Result<()> {
    let (runtime, mut events) = SyncRuntime::start(config);
    let mut stdout = std::io::stdout();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    writeln!(stdout, "{}", serde_json::to_string(&event)?)?;
                    stdout.flush()?;
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "dropped events");
                }
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    runtime.shutdown().await;
    Ok(())
}

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "tabsync", about = "Mirror and drive terminals on a tabsync session server")]
struct Cli {
    /// Session server socket (overrides the config file)
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    /// Config file path
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List tabs and terminals
    List {
        /// Print the snapshot as JSON
        #[arg(long)]
        json: bool,
    },

    /// Create a terminal and wait for the server to confirm it
    Create {
        /// Display name
        #[arg(long)]
        name: String,

        /// Working directory
        #[arg(long)]
        cwd: Option<PathBuf>,

        /// Tab to place the terminal in
        #[arg(long)]
        tab: Option<String>,

        #[arg(long, default_value = "80")]
        cols: u16,

        #[arg(long, default_value = "24")]
        rows: u16,

        /// Input written once the terminal starts
        #[arg(long)]
        init: Option<String>,
    },

    /// Replay a terminal's history, then follow its output
    Tail {
        /// Terminal ID
        terminal: String,
    },

    /// Send input to a terminal
    Send {
        /// Terminal ID
        terminal: String,

        /// Input text to send
        input: String,

        /// Append a carriage return
        #[arg(long)]
        enter: bool,
    },

    /// Stream sync events as JSON lines
    Watch,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tabsync=info,libtabsync=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = commands::load_config(cli.config.as_deref(), cli.socket)?;

    match cli.command {
        Commands::List { json } => commands::list(&config, json).await,
        Commands::Create {
            name,
            cwd,
            tab,
            cols,
            rows,
            init,
        } => {
            let cwd = match cwd {
                Some(cwd) => cwd,
                None => std::env::current_dir()?,
            };
            let params = tabsync_protocol::CreateTerminalParams {
                name,
                cwd,
                cols,
                rows,
                tab_id: tab,
                position: None,
                initial_input: init,
            };
            commands::create(&config, params).await
        }
        Commands::Tail { terminal } => commands::tail(&config, terminal).await,
        Commands::Send {
            terminal,
            input,
            enter,
        } => commands::send(&config, terminal, input, enter).await,
        Commands::Watch => commands::watch(&config).await,
    }
}

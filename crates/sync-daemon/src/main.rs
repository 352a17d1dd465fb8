//! note-sync: Push local sticky notes to a peer and mirror the peer's notes.
//!
//! Connects out to the peer, pushes every local note on connect, and keeps a
//! view of the notes the peer sends back. A small command prompt on stdin
//! drives reconnects and manual syncs.

use anyhow::Result;
use async_trait::async_trait;
use clap::Parser;
use note_sync_core::store::Result as StoreResult;
use note_sync_core::{InMemoryStore, Note, NoteStore, SyncEvent};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use note_sync_daemon::{
    ChannelConfig, FramedChannel, MaterializePolicy, StickyNotesStore, SyncManager, note_summary,
};

#[derive(Parser, Debug)]
#[command(name = "note-sync")]
#[command(about = "Two-peer sticky note sync")]
struct Args {
    /// Peer host name or address
    #[arg(default_value = "localhost")]
    host: String,

    /// Peer port (tries 8080, 3000, 5000, 8000, 9000 if not given)
    #[arg(short, long)]
    port: Option<u16>,

    /// Path to the Sticky Notes database (found automatically if not given)
    #[arg(short, long)]
    store: Option<PathBuf>,

    /// Timeout for each connection attempt
    #[arg(long, default_value_t = 5)]
    connect_timeout_secs: u64,

    /// Socket read timeout; bounds how long a disconnect takes to stop reading
    #[arg(long, default_value_t = 1000)]
    read_timeout_ms: u64,

    /// Forward remote changes to the local store, not just the remote view
    #[arg(long)]
    apply_remote: bool,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

/// The local store picked at start-up.
enum LocalStore {
    StickyNotes(StickyNotesStore),
    Empty(InMemoryStore),
}

#[async_trait]
impl NoteStore for LocalStore {
    async fn list_notes(&self) -> StoreResult<Vec<Note>> {
        match self {
            LocalStore::StickyNotes(store) => store.list_notes().await,
            LocalStore::Empty(store) => store.list_notes().await,
        }
    }

    async fn materialize(&self, event: &SyncEvent) -> StoreResult<()> {
        match self {
            LocalStore::StickyNotes(store) => store.materialize(event).await,
            LocalStore::Empty(store) => store.materialize(event).await,
        }
    }
}

fn open_store(path: Option<PathBuf>) -> LocalStore {
    let store = match path {
        Some(path) if path.exists() => Some(StickyNotesStore::new(path)),
        Some(path) => {
            warn!("Sticky Notes database {} does not exist", path.display());
            None
        }
        None => StickyNotesStore::locate(),
    };

    match store {
        Some(store) => {
            info!("Local notes: {}", store.path().display());
            LocalStore::StickyNotes(store)
        }
        None => {
            warn!("No Sticky Notes database found, starting with no local notes");
            LocalStore::Empty(InMemoryStore::new())
        }
    }
}

const HELP: &str = "Commands: connect, disconnect, sync, status, help, quit";

/// Run one prompt command. Returns false when the user asked to quit.
async fn handle_command(manager: &SyncManager<LocalStore>, line: &str) -> bool {
    match line.trim().to_ascii_lowercase().as_str() {
        "" => {}
        "connect" => {
            if manager.connect().await.is_none() {
                println!("Could not connect to {}", manager.channel().config().host);
            }
        }
        "disconnect" => manager.disconnect().await,
        "sync" => match manager.sync_now().await {
            Ok(report) => println!("Pushed {} of {} note(s)", report.pushed, report.total),
            Err(e) => println!("{e}"),
        },
        "status" => {
            println!("{}", manager.status());
            for note in manager.remote_notes() {
                println!("  {}", note_summary(&note));
            }
        }
        "help" => println!("{HELP}"),
        "quit" | "exit" => return false,
        other => println!("Unknown command: {other}. {HELP}"),
    }
    true
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,note_sync_daemon=debug"
    } else {
        "info,note_sync_daemon=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting note-sync");

    let store = open_store(args.store);

    let config = ChannelConfig {
        port: args.port,
        connect_timeout: Duration::from_secs(args.connect_timeout_secs),
        read_timeout: Duration::from_millis(args.read_timeout_ms),
        ..ChannelConfig::new(args.host)
    };
    let policy = if args.apply_remote {
        MaterializePolicy::Apply
    } else {
        MaterializePolicy::ViewOnly
    };

    let (channel, events) = FramedChannel::new(config);
    let manager = Arc::new(SyncManager::new(store, channel).with_policy(policy));

    let event_loop = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.run(events).await })
    };

    manager.connect().await;
    println!("{HELP}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => {
                match line? {
                    Some(line) => {
                        if !handle_command(&manager, &line).await {
                            break;
                        }
                    }
                    None => {
                        debug!("stdin closed, running until Ctrl+C");
                        stdin_open = false;
                    }
                }
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    info!("Shutting down");
    manager.disconnect().await;
    event_loop.abort();
    Ok(())
}

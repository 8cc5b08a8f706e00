//! Line-oriented console front-end for one kiosk slide session.
//!
//! Reads JSON lines from stdin, each either a session command
//! (`{"command": "drop", "target_id": "..."}`) or a realtime change record
//! (`{"type": "deleted", "id": "..."}`), and prints a JSON snapshot of the
//! console state to stdout after every visible change.

mod config;
mod logging;
mod state;

use std::{process, sync::Arc};

use kiosk_core::{ChangeEvent, SessionCommand};
use kiosk_platform::{FileCacheStorage, ScopedCacheStorage};
use kiosk_runtime::{HttpKioskApi, KioskSessionHandle, SessionPorts, spawn_session};
use serde::Deserialize;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::{broadcast::error::RecvError, mpsc},
};
use tracing::{debug, error, info, warn};

use crate::{config::ConsoleConfig, state::ConsoleState};

const CACHE_NAMESPACE: &str = "kiosk-console";
const REALTIME_BUFFER: usize = 256;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ConsoleInput {
    Command(SessionCommand),
    Change(ChangeEvent),
}

#[tokio::main]
async fn main() {
    logging::init();

    let config = match ConsoleConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("kiosk-console: {err}");
            process::exit(1);
        }
    };

    if let Err(err) = run(config).await {
        error!(error = %err, "kiosk console stopped");
        eprintln!("kiosk-console: {err}");
        process::exit(1);
    }
}

async fn run(config: ConsoleConfig) -> Result<(), Box<dyn std::error::Error>> {
    let storage = FileCacheStorage::open(&config.cache_path)?;
    info!(path = %storage.path().display(), "position cache opened");
    let storage = ScopedCacheStorage::new(storage, CACHE_NAMESPACE);

    let api = HttpKioskApi::new(
        &config.api_base_url,
        config.api_token.clone(),
        config.session.scoreboard_id.clone(),
    )?;

    let (realtime_tx, realtime_rx) = mpsc::channel(REALTIME_BUFFER);
    let ports = SessionPorts {
        api: Arc::new(api),
        storage: Arc::new(storage),
        rasterizer: None,
    };
    let handle = spawn_session(config.session, ports, realtime_rx);
    let mut events = handle.subscribe();

    tokio::spawn(forward_stdin(handle.clone(), realtime_tx));

    let mut state = ConsoleState::default();
    print_snapshot(&state)?;
    loop {
        match events.recv().await {
            Ok(event) => {
                if state.handle_session_event(event) {
                    print_snapshot(&state)?;
                }
                if state.is_closed() {
                    break;
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "console fell behind the session event stream");
            }
            Err(RecvError::Closed) => break,
        }
    }

    info!("session closed");
    Ok(())
}

/// Pump stdin lines into the session until EOF, then shut it down.
async fn forward_stdin(handle: KioskSessionHandle, realtime: mpsc::Sender<ChangeEvent>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                warn!(error = %err, "failed to read stdin");
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match serde_json::from_str::<ConsoleInput>(line) {
            Ok(ConsoleInput::Command(command)) => {
                if handle.send(command).await.is_err() {
                    break;
                }
            }
            Ok(ConsoleInput::Change(change)) => {
                debug!(?change, "forwarding realtime record");
                if realtime.send(change).await.is_err() {
                    break;
                }
            }
            Err(err) => warn!(error = %err, "ignoring malformed input line"),
        }
    }

    let _ = handle.shutdown().await;
}

fn print_snapshot(state: &ConsoleState) -> serde_json::Result<()> {
    let line = serde_json::to_string(&state.snapshot())?;
    println!("{line}");
    Ok(())
}

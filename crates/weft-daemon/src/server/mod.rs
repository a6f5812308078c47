pub mod dispatch;
pub mod shutdown;
pub mod state;

use std::sync::Arc;
use std::time::{Duration, Instant};

use rmpv::Value;
use tokio::net::UnixListener;
use tokio::sync::RwLock;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use weft_proto::RpcMessage;

use crate::client_session;
use crate::errors::DaemonError;
use crate::pty::supervisor::{PtyEvent, kill_and_reap};
use crate::scheduler::Decision;
use crate::types::{COLOR_QUERY_TIMEOUT_MS, DaemonConfig};
use state::ServerState;

/// Shared server context handed to connection tasks.
pub struct ServerHandle {
    pub state: RwLock<ServerState>,
    pub(crate) events_tx: UnboundedSender<PtyEvent>,
}

/// Run the daemon server.
///
/// This is the main entrypoint. It:
/// 1. Claims the socket path (a live listener refuses startup, a stale
///    socket file is removed)
/// 2. Accepts client connections in a loop
/// 3. Drives the PTY event pipeline (dirty signals, frame timers, exits)
/// 4. Handles graceful shutdown on SIGTERM/SIGINT
pub async fn run_server(config: DaemonConfig) -> Result<(), DaemonError> {
    let socket_path = config.socket_path.clone();

    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    if socket_path.exists() {
        match tokio::net::UnixStream::connect(&socket_path).await {
            Ok(_) => {
                return Err(DaemonError::AddressInUse(
                    socket_path.display().to_string(),
                ));
            }
            Err(_) => {
                // No listener behind the file: a previous daemon died
                // without cleanup.
                std::fs::remove_file(&socket_path)?;
            }
        }
    }

    let listener = UnixListener::bind(&socket_path)?;

    info!(
        event = "daemon.server.started",
        pid = std::process::id(),
        socket = %socket_path.display(),
    );

    let (events_tx, mut events_rx) = tokio::sync::mpsc::unbounded_channel();
    let server = Arc::new(ServerHandle {
        state: RwLock::new(ServerState::new(config, events_tx.clone())),
        events_tx,
    });
    let shutdown_token = CancellationToken::new();

    // Spawn signal handler
    let signal_token = shutdown_token.clone();
    tokio::spawn(async move {
        if let Err(e) = shutdown::wait_for_shutdown_signal(signal_token).await {
            error!(
                event = "daemon.server.signal_handler_failed",
                error = %e,
                "SIGTERM/SIGINT will not trigger graceful shutdown.",
            );
        }
    });

    loop {
        tokio::select! {
            accept = listener.accept() => {
                match accept {
                    Ok((stream, _addr)) => {
                        tokio::spawn(client_session::handle_connection(
                            stream,
                            server.clone(),
                            shutdown_token.clone(),
                        ));
                    }
                    Err(e) => {
                        error!(event = "daemon.server.accept_failed", error = %e);
                    }
                }
            }
            Some(event) = events_rx.recv() => {
                handle_pty_event(&server, event).await;
            }
            _ = shutdown_token.cancelled() => {
                info!(event = "daemon.server.shutdown_started");
                break;
            }
        }
    }

    shutdown_all(&server).await;

    if socket_path.exists()
        && let Err(e) = std::fs::remove_file(&socket_path)
    {
        error!(event = "daemon.server.socket_cleanup_failed", error = %e);
    }

    info!(event = "daemon.server.shutdown_completed");
    Ok(())
}

/// One turn of the PTY event pipeline.
async fn handle_pty_event(server: &Arc<ServerHandle>, event: PtyEvent) {
    match event {
        PtyEvent::Dirty { pty_id } => {
            let mut state = server.state.write().await;
            match state.scheduler.on_dirty(pty_id, Instant::now()) {
                Decision::RenderNow => state.render_pass(pty_id, false),
                Decision::Arm(delay) => {
                    let events_tx = server.events_tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = events_tx.send(PtyEvent::RenderDue { pty_id });
                    });
                }
                Decision::Pending => {}
            }
        }

        PtyEvent::RenderDue { pty_id } => {
            let mut state = server.state.write().await;
            state.scheduler.timer_fired(pty_id);
            state.render_pass(pty_id, false);
        }

        PtyEvent::CwdChanged { pty_id } => {
            let mut state = server.state.write().await;
            let cwd = state.pty(pty_id).ok().and_then(|sup| {
                sup.shared
                    .lock_term()
                    .and_then(|term| term.screen().cwd().map(str::to_string))
            });
            if let Some(cwd) = cwd {
                let params = Value::Map(vec![
                    (Value::from("pty_id"), Value::from(pty_id)),
                    (Value::from("cwd"), Value::from(cwd)),
                ]);
                state.broadcast_to_pty(pty_id, &RpcMessage::notification("cwd_changed", params));
            }
        }

        PtyEvent::Da1Queued { pty_id } => {
            // Fallback deadline: if clients never answer the color
            // queries, the DA1 reply goes out after the defer window.
            let events_tx = server.events_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(COLOR_QUERY_TIMEOUT_MS)).await;
                let _ = events_tx.send(PtyEvent::Da1Deadline { pty_id });
            });
        }

        PtyEvent::Da1Deadline { pty_id } => {
            let mut state = server.state.write().await;
            state.maybe_write_da1(pty_id, Instant::now());
        }

        PtyEvent::Eof { pty_id } => {
            let mut state = server.state.write().await;
            {
                let Ok(sup) = state.pty_mut(pty_id) else {
                    return;
                };
                sup.running = false;
                sup.eof_seen = true;
            }
            // Flush whatever the final output burst produced; the exit
            // notification always comes after the last redraw.
            state.render_pass(pty_id, false);

            let job = state
                .pty_mut(pty_id)
                .ok()
                .and_then(|sup| sup.begin_teardown());
            if let Some((child, pid)) = job {
                // Natural exit: reap off the event loop.
                let events_tx = server.events_tx.clone();
                tokio::task::spawn_blocking(move || {
                    let status = kill_and_reap(child, pid);
                    let _ = events_tx.send(PtyEvent::Reaped { pty_id, status });
                });
            } else {
                // close_pty's reap may already have finished; if so,
                // complete the exit now.
                let reaped = state.pty_mut(pty_id).ok().and_then(|sup| sup.exit_status);
                if let Some(status) = reaped {
                    state.finish_pty(pty_id, status);
                }
            }
        }

        PtyEvent::Reaped { pty_id, status } => {
            let mut state = server.state.write().await;
            let eof_seen = {
                let Ok(sup) = state.pty_mut(pty_id) else {
                    return;
                };
                sup.exit_status = Some(status);
                sup.eof_seen
            };
            if eof_seen {
                state.finish_pty(pty_id, status);
            }
        }
    }
}

/// Graceful shutdown: close every client, escalate-kill every child, then
/// join the reader threads.
async fn shutdown_all(server: &Arc<ServerHandle>) {
    let (kills, readers, cancels) = {
        let mut state = server.state.write().await;
        state.drain_for_shutdown()
    };

    for cancel in cancels {
        cancel.cancel();
    }

    let mut reaps = Vec::new();
    for (child, pid) in kills {
        reaps.push(tokio::task::spawn_blocking(move || {
            kill_and_reap(child, pid);
        }));
    }
    for reap in reaps {
        let _ = reap.await;
    }

    let join = tokio::task::spawn_blocking(move || {
        for reader in readers {
            if reader.join().is_err() {
                error!(event = "daemon.server.reader_join_failed");
            }
        }
    });
    let _ = join.await;
}

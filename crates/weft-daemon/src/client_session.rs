//! Per-connection client sessions.
//!
//! Each connection gets a bounded send queue drained by a dedicated writer
//! task, so at most one send is in flight and frames go out in enqueue
//! order. A full queue is the backpressure signal: that client (and only
//! that client) is torn down.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use weft_vt::OptionAsAlt;

use crate::errors::DaemonError;
use crate::server::ServerHandle;
use crate::server::dispatch;
use crate::types::SEND_QUEUE_MAX;

/// Server-side record of one connected client.
pub struct ClientHandle {
    pub id: u64,
    tx: mpsc::Sender<Bytes>,
    /// Cancelling stops the connection's read loop.
    pub cancel: CancellationToken,
    /// PTY IDs this client is attached to.
    pub attached: HashSet<u64>,
    /// macOS Option-as-Alt preference, set on attach/spawn.
    pub option_as_alt: OptionAsAlt,
    /// Set when teardown begins; new sends are dropped.
    pub closing: bool,
}

impl ClientHandle {
    pub fn new(id: u64, tx: mpsc::Sender<Bytes>, cancel: CancellationToken) -> Self {
        Self {
            id,
            tx,
            cancel,
            attached: HashSet::new(),
            option_as_alt: OptionAsAlt::None,
            closing: false,
        }
    }

    /// Queue an encoded frame for this client.
    ///
    /// A closing client silently drops. A full queue is `SendQueueFull`;
    /// a gone writer task reads as a broken pipe. Either error means the
    /// caller tears this client down.
    pub fn send(&self, frame: Bytes) -> Result<(), DaemonError> {
        if self.closing {
            return Ok(());
        }
        self.tx.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => DaemonError::SendQueueFull,
            TrySendError::Closed(_) => DaemonError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "client writer task gone",
            )),
        })
    }
}

/// Handle one client connection for its lifetime.
pub(crate) async fn handle_connection(
    stream: UnixStream,
    server: Arc<ServerHandle>,
    shutdown: CancellationToken,
) {
    let (tx, rx) = mpsc::channel::<Bytes>(SEND_QUEUE_MAX);
    let cancel = CancellationToken::new();

    let client_id = {
        let mut state = server.state.write().await;
        match state.register_client(tx, cancel.clone()) {
            Ok(id) => id,
            Err(e) => {
                warn!(event = "daemon.client.rejected", error = %e);
                return;
            }
        }
    };

    info!(event = "daemon.client.connected", client_id = client_id);

    let (mut read_half, write_half) = stream.into_split();
    let writer = tokio::spawn(writer_task(client_id, write_half, rx));

    let mut acc = BytesMut::with_capacity(4096);
    'conn: loop {
        tokio::select! {
            result = read_half.read_buf(&mut acc) => {
                match result {
                    Ok(0) => {
                        debug!(event = "daemon.client.closed_by_peer", client_id = client_id);
                        break;
                    }
                    Ok(_) => loop {
                        match weft_proto::decode_frame(&acc) {
                            Ok(Some((msg, consumed))) => {
                                acc.advance(consumed);
                                dispatch::handle_message(&server, client_id, msg).await;
                            }
                            Ok(None) => {
                                if acc.len() > weft_proto::MESSAGE_SIZE_MAX {
                                    warn!(
                                        event = "daemon.client.frame_too_large",
                                        client_id = client_id,
                                        buffered = acc.len(),
                                    );
                                    break 'conn;
                                }
                                break;
                            }
                            Err(e) => {
                                warn!(
                                    event = "daemon.client.malformed_frame",
                                    client_id = client_id,
                                    error = %e,
                                );
                                break 'conn;
                            }
                        }
                    },
                    Err(e) => {
                        debug!(
                            event = "daemon.client.read_failed",
                            client_id = client_id,
                            error = %e,
                        );
                        break;
                    }
                }
            }
            _ = cancel.cancelled() => break,
            _ = shutdown.cancelled() => break,
        }
    }

    {
        let mut state = server.state.write().await;
        state.remove_client(client_id);
    }
    // Dropping the handle closed the queue; the writer drains what was
    // already accepted, then shuts the socket down.
    let _ = writer.await;

    info!(event = "daemon.client.disconnected", client_id = client_id);
}

async fn writer_task(client_id: u64, mut half: OwnedWriteHalf, mut rx: mpsc::Receiver<Bytes>) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = half.write_all(&frame).await {
            debug!(
                event = "daemon.client.send_failed",
                client_id = client_id,
                error = %e,
            );
            // Drain and drop whatever is still queued.
            rx.close();
            while rx.try_recv().is_ok() {}
            break;
        }
    }
    let _ = half.shutdown().await;
}

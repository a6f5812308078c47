//! Central server state: the client set, the PTY map, and the render and
//! notification paths that connect them.
//!
//! Only event-loop and dispatch code touches this map (behind the outer
//! RwLock); reader threads reach shared terminal state exclusively through
//! the per-PTY locks in `PtyShared`.

use std::collections::HashMap;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use rmpv::Value;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};
use weft_proto::RpcMessage;
use weft_vt::ColorTarget;

use crate::client_session::ClientHandle;
use crate::errors::DaemonError;
use crate::pty::supervisor::{PtyEvent, PtySupervisor};
use crate::render;
use crate::scheduler::FrameScheduler;
use crate::types::{CLIENTS_MAX, DaemonConfig, PTYS_MAX};

pub struct ServerState {
    config: DaemonConfig,
    /// The pty_validity token: server start time in ms since the epoch.
    pub start_time_ms: u64,
    clients: HashMap<u64, ClientHandle>,
    ptys: HashMap<u64, PtySupervisor>,
    next_client_id: u64,
    next_pty_id: u64,
    pub scheduler: FrameScheduler,
    events_tx: UnboundedSender<PtyEvent>,
}

impl ServerState {
    pub fn new(config: DaemonConfig, events_tx: UnboundedSender<PtyEvent>) -> Self {
        let start_time_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            config,
            start_time_ms,
            clients: HashMap::new(),
            ptys: HashMap::new(),
            next_client_id: 1,
            next_pty_id: 0,
            scheduler: FrameScheduler::new(),
            events_tx,
        }
    }

    // --- Clients ---------------------------------------------------------

    pub fn register_client(
        &mut self,
        tx: tokio::sync::mpsc::Sender<Bytes>,
        cancel: tokio_util::sync::CancellationToken,
    ) -> Result<u64, DaemonError> {
        if self.clients.len() >= CLIENTS_MAX {
            return Err(DaemonError::ClientLimitReached);
        }
        let id = self.next_client_id;
        self.next_client_id += 1;
        self.clients.insert(id, ClientHandle::new(id, tx, cancel));
        Ok(id)
    }

    /// Remove a client entirely, detaching it from every PTY.
    pub fn remove_client(&mut self, client_id: u64) {
        if let Some(handle) = self.clients.remove(&client_id) {
            for pty_id in &handle.attached {
                if let Some(sup) = self.ptys.get_mut(pty_id) {
                    sup.detach_client(client_id);
                }
            }
        }
    }

    /// Begin tearing a client down after a send failure: mark it closing
    /// and cancel its read loop. The connection task finishes the removal.
    pub fn teardown_client(&mut self, client_id: u64) {
        if let Some(handle) = self.clients.get_mut(&client_id) {
            if !handle.closing {
                warn!(event = "daemon.client.teardown", client_id = client_id);
            }
            handle.closing = true;
            handle.cancel.cancel();
        }
    }

    pub fn client_mut(&mut self, client_id: u64) -> Option<&mut ClientHandle> {
        self.clients.get_mut(&client_id)
    }

    pub fn client_option_as_alt(&self, client_id: u64) -> weft_vt::OptionAsAlt {
        self.clients
            .get(&client_id)
            .map(|c| c.option_as_alt)
            .unwrap_or_default()
    }

    // --- PTYs ------------------------------------------------------------

    pub fn pty(&self, pty_id: u64) -> Result<&PtySupervisor, DaemonError> {
        self.ptys
            .get(&pty_id)
            .ok_or(DaemonError::PtyNotFound(pty_id))
    }

    pub fn pty_mut(&mut self, pty_id: u64) -> Result<&mut PtySupervisor, DaemonError> {
        self.ptys
            .get_mut(&pty_id)
            .ok_or(DaemonError::PtyNotFound(pty_id))
    }

    pub fn pty_ids(&self) -> Vec<u64> {
        self.ptys.keys().copied().collect()
    }

    pub fn events_tx(&self) -> &UnboundedSender<PtyEvent> {
        &self.events_tx
    }

    /// Signal the frame pipeline that a PTY changed outside the reader
    /// thread (selection, viewport scroll, resize).
    pub fn mark_dirty(&self, pty_id: u64) {
        let _ = self.events_tx.send(PtyEvent::Dirty { pty_id });
    }

    pub fn spawn_pty(
        &mut self,
        rows: u16,
        cols: u16,
        cwd: Option<&str>,
        env: Option<&[(String, String)]>,
    ) -> Result<u64, DaemonError> {
        if self.ptys.len() >= PTYS_MAX {
            return Err(DaemonError::PtyLimitReached);
        }
        let id = self.next_pty_id;
        let sup = PtySupervisor::spawn(
            id,
            rows,
            cols,
            cwd,
            env,
            &self.config.shell_program(),
            self.config.scrollback_lines,
            self.events_tx.clone(),
        )?;
        self.next_pty_id += 1;
        self.ptys.insert(id, sup);
        Ok(id)
    }

    /// Begin PTY teardown (close_pty and shutdown). The reader thread's
    /// EOF and the reap task drive the rest of the exit path.
    pub fn close_pty(&mut self, pty_id: u64) -> Result<(), DaemonError> {
        let sup = self.pty_mut(pty_id)?;
        if let Some((child, pid)) = sup.begin_teardown() {
            let events_tx = self.events_tx.clone();
            tokio::task::spawn_blocking(move || {
                let status = crate::pty::supervisor::kill_and_reap(child, pid);
                let _ = events_tx.send(PtyEvent::Reaped { pty_id, status });
            });
        }
        Ok(())
    }

    /// Final stage of the exit path: one `pty_exited` per PTY lifetime,
    /// after its last redraw, then release everything.
    pub fn finish_pty(&mut self, pty_id: u64, status: i32) {
        let params = Value::Array(vec![Value::from(pty_id), Value::from(status)]);
        self.broadcast_to_pty(pty_id, &RpcMessage::notification("pty_exited", params));

        let Some(mut sup) = self.ptys.remove(&pty_id) else {
            return;
        };
        self.scheduler.forget(pty_id);
        for client in self.clients.values_mut() {
            client.attached.remove(&pty_id);
        }
        // The reader already saw EOF; the join is immediate.
        if let Some(handle) = sup.take_reader()
            && handle.join().is_err()
        {
            error!(event = "daemon.pty.reader_panicked", pty_id = pty_id);
        }
        info!(
            event = "daemon.pty.exit_completed",
            pty_id = pty_id,
            status = status,
        );
    }

    // --- Sending ---------------------------------------------------------

    pub fn send_message_to_client(&mut self, client_id: u64, msg: &RpcMessage) {
        match weft_proto::encode_frame(msg) {
            Ok(bytes) => self.send_to_client(client_id, Bytes::from(bytes)),
            Err(e) => error!(event = "daemon.server.encode_failed", error = %e),
        }
    }

    pub fn send_to_client(&mut self, client_id: u64, frame: Bytes) {
        let failed = match self.clients.get(&client_id) {
            Some(handle) => match handle.send(frame) {
                Ok(()) => false,
                Err(e) => {
                    warn!(
                        event = "daemon.client.send_rejected",
                        client_id = client_id,
                        error_code = e.error_code(),
                    );
                    true
                }
            },
            None => false,
        };
        if failed {
            self.teardown_client(client_id);
        }
    }

    /// Send to every client attached to a PTY; clients whose queue
    /// overflows or whose writer died are torn down, the rest continue.
    pub fn broadcast_to_pty(&mut self, pty_id: u64, msg: &RpcMessage) {
        let Some(sup) = self.ptys.get(&pty_id) else {
            return;
        };
        let targets = sup.clients.clone();
        let bytes = match weft_proto::encode_frame(msg) {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => {
                error!(event = "daemon.server.encode_failed", error = %e);
                return;
            }
        };
        for client_id in targets {
            self.send_to_client(client_id, bytes.clone());
        }
    }

    // --- Render pipeline -------------------------------------------------

    /// Render one frame for a PTY if it is dirty, broadcast it, then flush
    /// queued color queries and a due DA1 reply.
    pub fn render_pass(&mut self, pty_id: u64, force_full: bool) {
        let now = Instant::now();
        let built: Option<Value> = {
            let Some(sup) = self.ptys.get(&pty_id) else {
                return;
            };
            let Some(mut term) = sup.shared.lock_term() else {
                return;
            };
            // The reader suppresses dirty signals in synchronized-output
            // mode; this check is defense in depth.
            if term.screen().modes().synchronized_output && sup.running {
                None
            } else if !force_full && !term.screen().damage().any() {
                None
            } else {
                Some(render::build_redraw(term.screen_mut(), pty_id, force_full, true))
            }
        };
        self.scheduler.rendered(pty_id, now);

        if let Some(params) = built {
            self.broadcast_to_pty(pty_id, &RpcMessage::notification("redraw", params));
        }

        self.flush_color_queries(pty_id, now);
        self.maybe_write_da1(pty_id, now);
    }

    /// Build a full redraw for one client only, without consuming the
    /// damage other clients still need.
    pub fn send_full_redraw_to(&mut self, pty_id: u64, client_id: u64) {
        let params = {
            let Some(sup) = self.ptys.get(&pty_id) else {
                return;
            };
            let Some(mut term) = sup.shared.lock_term() else {
                return;
            };
            render::build_redraw(term.screen_mut(), pty_id, true, false)
        };
        self.send_message_to_client(client_id, &RpcMessage::notification("redraw", params));
    }

    /// Forward queued OSC color queries to attached clients.
    fn flush_color_queries(&mut self, pty_id: u64, now: Instant) {
        let drained: Vec<ColorTarget> = {
            let Some(sup) = self.ptys.get(&pty_id) else {
                return;
            };
            match sup.shared.queries.lock() {
                Ok(mut queries) => queries.drain_for_send(now),
                Err(e) => {
                    error!(event = "daemon.pty.queries_lock_poisoned", error = %e);
                    return;
                }
            }
        };
        for target in drained {
            let mut map = vec![
                (Value::from("pty_id"), Value::from(pty_id)),
                (Value::from("slot"), Value::from(target.osc_slot())),
            ];
            match target {
                ColorTarget::Palette(index) => {
                    map.push((Value::from("index"), Value::from(index)));
                }
                ColorTarget::Foreground => {
                    map.push((Value::from("kind"), Value::from("foreground")));
                }
                ColorTarget::Background => {
                    map.push((Value::from("kind"), Value::from("background")));
                }
                ColorTarget::Cursor => {
                    map.push((Value::from("kind"), Value::from("cursor")));
                }
            }
            self.broadcast_to_pty(
                pty_id,
                &RpcMessage::notification("color_query", Value::Map(map)),
            );
        }
    }

    /// Write the deferred DA1 reply once every outstanding color query is
    /// answered or the defer window has elapsed.
    pub fn maybe_write_da1(&mut self, pty_id: u64, now: Instant) {
        let Some(sup) = self.ptys.get(&pty_id) else {
            return;
        };
        let due = match sup.shared.queries.lock() {
            Ok(mut queries) => {
                if queries.da1_due(now) {
                    queries.clear_da1();
                    true
                } else {
                    false
                }
            }
            Err(e) => {
                error!(event = "daemon.pty.queries_lock_poisoned", error = %e);
                false
            }
        };
        if due {
            sup.shared.write(b"\x1b[?1;2c");
            debug!(event = "daemon.pty.da1_written", pty_id = pty_id);
        }
    }

    /// Apply a client's `color_response`: write the OSC reply to the
    /// master, then re-check the DA1 gate.
    pub fn handle_color_response(
        &mut self,
        pty_id: u64,
        r: u8,
        g: u8,
        b: u8,
        index: Option<u8>,
        kind: Option<&str>,
    ) {
        let reply = {
            // 16-bit scaled components, the xterm rgb:RRRR/GGGG/BBBB form.
            let (r16, g16, b16) = (
                u16::from(r) * 0x101,
                u16::from(g) * 0x101,
                u16::from(b) * 0x101,
            );
            // When both index and kind arrive, index wins.
            if let Some(index) = index {
                format!("\x1b]4;{};rgb:{:04x}/{:04x}/{:04x}\x1b\\", index, r16, g16, b16)
            } else {
                let slot = match kind {
                    Some("foreground") => 10,
                    Some("background") => 11,
                    Some("cursor") => 12,
                    _ => {
                        debug!(event = "daemon.pty.color_response_ignored", pty_id = pty_id);
                        return;
                    }
                };
                format!("\x1b]{};rgb:{:04x}/{:04x}/{:04x}\x1b\\", slot, r16, g16, b16)
            }
        };

        let Ok(sup) = self.pty(pty_id) else {
            return;
        };
        sup.shared.write(reply.as_bytes());
        if let Ok(mut queries) = sup.shared.queries.lock() {
            queries.note_response();
        }
        self.maybe_write_da1(pty_id, Instant::now());
    }

    /// Collect teardown work for shutdown: kill jobs, reader handles, and
    /// client cancel tokens.
    pub fn drain_for_shutdown(
        &mut self,
    ) -> (
        Vec<(
            Box<dyn portable_pty::Child + Send + Sync>,
            Option<u32>,
        )>,
        Vec<std::thread::JoinHandle<()>>,
        Vec<tokio_util::sync::CancellationToken>,
    ) {
        let mut kills = Vec::new();
        let mut readers = Vec::new();
        for sup in self.ptys.values_mut() {
            if let Some(job) = sup.begin_teardown() {
                kills.push(job);
            }
            if let Some(handle) = sup.take_reader() {
                readers.push(handle);
            }
        }
        let cancels = self
            .clients
            .values_mut()
            .map(|c| {
                c.closing = true;
                c.cancel.clone()
            })
            .collect();
        (kills, readers, cancels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn test_state() -> ServerState {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut config = DaemonConfig::default();
        config.shell = Some("/bin/sh".to_string());
        // Keep the receiver alive for the state's lifetime in tests that
        // trigger dirty events.
        std::mem::forget(_rx);
        ServerState::new(config, tx)
    }

    #[test]
    fn test_pty_validity_is_recent() {
        let state = test_state();
        assert!(state.start_time_ms > 1_600_000_000_000);
    }

    #[test]
    fn test_client_limit() {
        let mut state = test_state();
        for _ in 0..CLIENTS_MAX {
            let (tx, rx) = mpsc::channel(1);
            std::mem::forget(rx);
            state
                .register_client(tx, tokio_util::sync::CancellationToken::new())
                .unwrap();
        }
        let (tx, _rx) = mpsc::channel(1);
        let err = state
            .register_client(tx, tokio_util::sync::CancellationToken::new())
            .unwrap_err();
        assert_eq!(err.error_code(), "client_limit_reached");
    }

    #[tokio::test]
    async fn test_pty_ids_are_monotonic() {
        let mut state = test_state();
        let a = state.spawn_pty(4, 40, None, None).unwrap();
        let b = state.spawn_pty(4, 40, None, None).unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 1);

        for id in [a, b] {
            state.close_pty(id).unwrap();
        }
    }

    #[test]
    fn test_unknown_pty_is_not_found() {
        let state = test_state();
        let err = state.pty(42).unwrap_err();
        assert_eq!(err.to_string(), "PTY not found");
    }

    #[tokio::test]
    async fn test_finish_pty_removes_and_detaches() {
        let mut state = test_state();
        let pty_id = state.spawn_pty(4, 40, None, None).unwrap();

        let (tx, rx) = mpsc::channel(16);
        std::mem::forget(rx);
        let client_id = state
            .register_client(tx, tokio_util::sync::CancellationToken::new())
            .unwrap();
        state.pty_mut(pty_id).unwrap().attach_client(client_id).unwrap();
        state
            .client_mut(client_id)
            .unwrap()
            .attached
            .insert(pty_id);

        // Drive the exit path by hand: teardown, wait for reader EOF via
        // the kill, then finish.
        state.close_pty(pty_id).unwrap();
        // Give the reader a moment to unblock; the join in finish_pty
        // would hang otherwise.
        std::thread::sleep(std::time::Duration::from_millis(500));
        state.finish_pty(pty_id, 0);

        assert!(state.pty(pty_id).is_err());
        assert!(
            !state
                .client_mut(client_id)
                .unwrap()
                .attached
                .contains(&pty_id)
        );
    }
}

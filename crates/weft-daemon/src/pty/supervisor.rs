//! Per-PTY supervision: child process, master fd, reader thread, terminal
//! lock, and the kill-and-reap protocol.
//!
//! One OS thread per PTY blocks in `read` on the master. Everything it
//! learns crosses back to the event loop through the `PtyEvent` channel;
//! shared terminal state lives behind the per-PTY locks in [`PtyShared`].

use std::io::{Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use portable_pty::{Child, CommandBuilder, MasterPty, PtySize, native_pty_system};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info};
use weft_vt::screen::{Terminal, VtEvent};
use weft_vt::selection::{Granularity, Pin};

use crate::errors::DaemonError;
use crate::pty::queries::ColorQueryState;
use crate::types::CLIENTS_MAX;

/// Multi-click window for the selection gesture.
const MULTI_CLICK_MS: u64 = 500;

/// Signals crossing from reader threads and helper tasks into the event
/// loop. The dirty and exit self-signals of the design both travel here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtyEvent {
    /// Output was parsed; a frame may be due.
    Dirty { pty_id: u64 },
    /// A coalescing timer fired.
    RenderDue { pty_id: u64 },
    /// The emulator reported a new working directory.
    CwdChanged { pty_id: u64 },
    /// A DA1 query was deferred; arm its fallback deadline.
    Da1Queued { pty_id: u64 },
    /// The DA1 defer window elapsed.
    Da1Deadline { pty_id: u64 },
    /// The reader drained the master to EOF; begin reaping.
    Eof { pty_id: u64 },
    /// The child has been reaped.
    Reaped { pty_id: u64, status: i32 },
}

/// State shared between the reader thread and the event loop.
pub struct PtyShared {
    /// The terminal lock: serializes output parsing with input-side
    /// mutation. Never held across a write that could block.
    pub term: Mutex<Terminal>,
    /// PTY master writer. `take_writer` is one-shot, so the writer lives
    /// behind its own lock.
    writer: Mutex<Box<dyn Write + Send>>,
    /// Color-query ring and deferred-DA1 flag.
    pub queries: Mutex<ColorQueryState>,
}

impl PtyShared {
    /// Write bytes to the PTY master. Best effort: a dead child is logged,
    /// not an error.
    pub fn write(&self, bytes: &[u8]) {
        let mut writer = match self.writer.lock() {
            Ok(writer) => writer,
            Err(e) => {
                error!(event = "daemon.pty.writer_lock_poisoned", error = %e);
                return;
            }
        };
        if let Err(e) = writer.write_all(bytes).and_then(|()| writer.flush()) {
            debug!(event = "daemon.pty.master_write_failed", error = %e);
        }
    }

    pub fn lock_term(&self) -> Option<MutexGuard<'_, Terminal>> {
        match self.term.lock() {
            Ok(guard) => Some(guard),
            Err(e) => {
                error!(event = "daemon.pty.term_lock_poisoned", error = %e);
                None
            }
        }
    }
}

impl std::fmt::Debug for PtySupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtySupervisor")
            .field("id", &self.id)
            .field("running", &self.running)
            .field("eof_seen", &self.eof_seen)
            .field("exit_status", &self.exit_status)
            .field("clients", &self.clients)
            .field("rows", &self.rows)
            .field("cols", &self.cols)
            .finish_non_exhaustive()
    }
}

/// Handle to one live PTY, owned by the server state.
pub struct PtySupervisor {
    pub id: u64,
    /// Cleared on close/exit; a non-running PTY refuses new clients.
    pub running: bool,
    /// The reader thread drained the master to EOF.
    pub eof_seen: bool,
    pub exit_status: Option<i32>,
    pub shared: Arc<PtyShared>,
    /// Master end; dropped when teardown starts.
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    /// Child handle; taken by the reap task.
    child: Option<Box<dyn Child + Send + Sync>>,
    child_pid: Option<u32>,
    reader: Option<std::thread::JoinHandle<()>>,
    /// Attached client IDs.
    pub clients: Vec<u64>,
    pub rows: u16,
    pub cols: u16,
    /// Pixel metrics from the last resize, used by SGR-pixels mouse
    /// encoding.
    pub cell_width: u16,
    pub cell_height: u16,
    // Local selection gesture state.
    click_count: u8,
    last_click: Option<Instant>,
    sel_anchor: Option<Pin>,
}

impl PtySupervisor {
    /// Create the PTY pair, spawn the shell, and start the reader thread.
    pub fn spawn(
        id: u64,
        rows: u16,
        cols: u16,
        cwd: Option<&str>,
        env: Option<&[(String, String)]>,
        shell: &str,
        scrollback_lines: usize,
        events: UnboundedSender<PtyEvent>,
    ) -> Result<Self, DaemonError> {
        let pty_system = native_pty_system();
        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };
        let pair = pty_system
            .openpty(size)
            .map_err(|e| DaemonError::PtyError(format!("openpty: {}", e)))?;

        let mut cmd = CommandBuilder::new(shell);
        if let Some(env_vars) = env {
            // Client-supplied env replaces the daemon's entirely.
            cmd.env_clear();
            for (key, value) in env_vars {
                cmd.env(key, value);
            }
        }
        cmd.env("TERM", "xterm-256color");
        cmd.env("COLORTERM", "truecolor");
        if let Some(dir) = cwd {
            cmd.cwd(dir);
        }

        info!(
            event = "daemon.pty.spawn_started",
            pty_id = id,
            shell = shell,
            rows = rows,
            cols = cols,
        );

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| DaemonError::PtyError(format!("spawn: {}", e)))?;
        // Drop our copy of the slave fd. The child inherited it during
        // spawn; keeping ours would suppress EOF on the master when the
        // child exits.
        drop(pair.slave);

        let child_pid = child.process_id();

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| DaemonError::PtyError(format!("take writer: {}", e)))?;
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| DaemonError::PtyError(format!("clone reader: {}", e)))?;

        let shared = Arc::new(PtyShared {
            term: Mutex::new(Terminal::new(rows, cols, scrollback_lines)),
            writer: Mutex::new(writer),
            queries: Mutex::new(ColorQueryState::new()),
        });

        let thread_shared = shared.clone();
        let handle = std::thread::spawn(move || reader_loop(id, reader, thread_shared, events));

        info!(
            event = "daemon.pty.spawn_completed",
            pty_id = id,
            pid = ?child_pid,
        );

        Ok(Self {
            id,
            running: true,
            eof_seen: false,
            exit_status: None,
            shared,
            master: Mutex::new(Some(pair.master)),
            child: Some(child),
            child_pid,
            reader: Some(handle),
            clients: Vec::new(),
            rows,
            cols,
            cell_width: 0,
            cell_height: 0,
            click_count: 0,
            last_click: None,
            sel_anchor: None,
        })
    }

    pub fn attach_client(&mut self, client_id: u64) -> Result<(), DaemonError> {
        if !self.running {
            return Err(DaemonError::PtyNotFound(self.id));
        }
        if self.clients.len() >= CLIENTS_MAX {
            return Err(DaemonError::ClientLimitReached);
        }
        if !self.clients.contains(&client_id) {
            self.clients.push(client_id);
        }
        Ok(())
    }

    pub fn detach_client(&mut self, client_id: u64) {
        self.clients.retain(|&c| c != client_id);
    }

    /// Resize the PTY window and the emulator grid. Returns true when the
    /// cell dimensions actually changed.
    pub fn resize(
        &mut self,
        rows: u16,
        cols: u16,
        x_pixel: u16,
        y_pixel: u16,
    ) -> Result<bool, DaemonError> {
        if cols > 0 {
            self.cell_width = x_pixel / cols;
        }
        if rows > 0 {
            self.cell_height = y_pixel / rows;
        }

        let changed = rows != self.rows || cols != self.cols;
        if let Some(master) = self.master.lock().unwrap().as_ref() {
            master
                .resize(PtySize {
                    rows,
                    cols,
                    pixel_width: x_pixel,
                    pixel_height: y_pixel,
                })
                .map_err(|e| DaemonError::PtyError(format!("resize: {}", e)))?;
        }
        if changed {
            self.rows = rows;
            self.cols = cols;
            if let Some(mut term) = self.shared.lock_term() {
                term.screen_mut().resize(rows, cols);
            }
            debug!(
                event = "daemon.pty.resize_completed",
                pty_id = self.id,
                rows = rows,
                cols = cols,
            );
        }
        Ok(changed)
    }

    /// Start teardown: refuse new clients, close our master fd, and hand
    /// the child to the caller for the kill-and-reap task.
    pub fn begin_teardown(&mut self) -> Option<(Box<dyn Child + Send + Sync>, Option<u32>)> {
        self.running = false;
        self.master.lock().unwrap().take();
        self.child.take().map(|child| (child, self.child_pid))
    }

    pub fn take_reader(&mut self) -> Option<std::thread::JoinHandle<()>> {
        self.reader.take()
    }

    // --- Local selection gesture ----------------------------------------

    /// Left press with mouse reporting disabled. Returns true when the
    /// screen needs a redraw.
    pub fn selection_press(&mut self, pin: Pin, now: Instant) -> bool {
        let within_window = self
            .last_click
            .map(|last| now.duration_since(last) <= Duration::from_millis(MULTI_CLICK_MS))
            .unwrap_or(false);
        self.click_count = if within_window {
            if self.click_count >= 3 { 1 } else { self.click_count + 1 }
        } else {
            1
        };
        self.last_click = Some(now);
        self.sel_anchor = Some(pin);

        let Some(mut term) = self.shared.lock_term() else {
            return false;
        };
        match self.click_count {
            1 => term.screen_mut().clear_selection(),
            2 => term.screen_mut().select_word_at(pin),
            _ => term.screen_mut().select_line_at(pin),
        }
        true
    }

    /// Drag sample: re-evaluate the selection from the press anchor with
    /// the press granularity.
    pub fn selection_drag(&mut self, pin: Pin) -> bool {
        let Some(anchor) = self.sel_anchor else {
            return false;
        };
        let granularity = Granularity::from_click_count(self.click_count);
        let Some(mut term) = self.shared.lock_term() else {
            return false;
        };
        term.screen_mut().set_selection(anchor, pin, granularity);
        true
    }

    pub fn selection_release(&mut self) {
        self.sel_anchor = None;
    }
}

/// Reader thread: drain the master into the emulator, surface callbacks,
/// signal dirty, and report EOF.
fn reader_loop(
    pty_id: u64,
    mut reader: Box<dyn Read + Send>,
    shared: Arc<PtyShared>,
    events: UnboundedSender<PtyEvent>,
) {
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => {
                debug!(event = "daemon.pty.reader_eof", pty_id = pty_id);
                break;
            }
            Ok(n) => {
                if !feed(pty_id, &buf[..n], &shared, &events) {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                // EIO is the normal Linux read result after the child exits.
                debug!(event = "daemon.pty.reader_closed", pty_id = pty_id, error = %e);
                break;
            }
        }
    }
    let _ = events.send(PtyEvent::Eof { pty_id });
}

/// Parse one chunk under the terminal lock and dispatch the resulting
/// callbacks with the lock released.
fn feed(
    pty_id: u64,
    bytes: &[u8],
    shared: &Arc<PtyShared>,
    events: &UnboundedSender<PtyEvent>,
) -> bool {
    let (vt_events, suppress_dirty) = {
        let mut term = match shared.term.lock() {
            Ok(guard) => guard,
            Err(e) => {
                error!(event = "daemon.pty.term_lock_poisoned", pty_id = pty_id, error = %e);
                return false;
            }
        };
        term.process(bytes);
        let vt_events = term.screen_mut().take_events();
        let suppress_dirty = term.screen().modes().synchronized_output;
        (vt_events, suppress_dirty)
    };

    let now = Instant::now();
    let mut da1_queued = false;
    let mut cwd_changed = false;
    for event in vt_events {
        match event {
            VtEvent::PtyReply(reply) => shared.write(&reply),
            VtEvent::ColorQuery(target) => {
                if let Ok(mut queries) = shared.queries.lock() {
                    queries.enqueue(target, now);
                }
            }
            VtEvent::PrimaryDeviceAttributes => {
                if let Ok(mut queries) = shared.queries.lock() {
                    queries.arm_da1(now);
                }
                da1_queued = true;
            }
            VtEvent::CwdChanged => cwd_changed = true,
            VtEvent::TitleChanged | VtEvent::Bell => {}
        }
    }

    if da1_queued && events.send(PtyEvent::Da1Queued { pty_id }).is_err() {
        return false;
    }
    if cwd_changed && events.send(PtyEvent::CwdChanged { pty_id }).is_err() {
        return false;
    }
    // One byte in the dirty pipe is enough; the scheduler coalesces.
    if !suppress_dirty && events.send(PtyEvent::Dirty { pty_id }).is_err() {
        return false;
    }
    true
}

/// Kill-and-reap escalation: a grace period for natural exit, then
/// SIGHUP -> SIGTERM -> SIGKILL 100 ms apart, then a blocking reap.
/// SIGKILL cannot be ignored, so the final wait terminates.
pub(crate) fn kill_and_reap(mut child: Box<dyn Child + Send + Sync>, pid: Option<u32>) -> i32 {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    const STAGE_WAIT_MS: u64 = 100;

    if let Some(status) = poll_exit(&mut child, STAGE_WAIT_MS) {
        return status;
    }
    for signal in [Signal::SIGHUP, Signal::SIGTERM, Signal::SIGKILL] {
        if let Some(raw_pid) = pid {
            let _ = kill(Pid::from_raw(raw_pid as i32), signal);
        }
        if let Some(status) = poll_exit(&mut child, STAGE_WAIT_MS) {
            return status;
        }
    }
    match child.wait() {
        Ok(status) => status.exit_code() as i32,
        Err(e) => {
            error!(event = "daemon.pty.reap_failed", error = %e);
            -1
        }
    }
}

fn poll_exit(child: &mut Box<dyn Child + Send + Sync>, wait_ms: u64) -> Option<i32> {
    let deadline = Instant::now() + Duration::from_millis(wait_ms);
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Some(status.exit_code() as i32),
            Ok(None) => {}
            Err(e) => {
                error!(event = "daemon.pty.try_wait_failed", error = %e);
                return Some(-1);
            }
        }
        if Instant::now() >= deadline {
            return None;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

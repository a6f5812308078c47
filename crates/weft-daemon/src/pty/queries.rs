use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::warn;
use weft_vt::ColorTarget;

use crate::types::{COLOR_QUERY_MAX, COLOR_QUERY_TIMEOUT_MS};

/// An OSC color query waiting to be forwarded to clients.
#[derive(Debug, Clone, Copy)]
pub struct PendingQuery {
    pub target: ColorTarget,
    pub queued_at: Instant,
}

/// Per-PTY color-query bookkeeping and the deferred-DA1 flag.
///
/// Guarded by its own mutex with short critical sections; the terminal lock
/// is never required to touch this state.
#[derive(Debug, Default)]
pub struct ColorQueryState {
    queue: VecDeque<PendingQuery>,
    sent: u64,
    received: u64,
    da1_pending: Option<Instant>,
}

impl ColorQueryState {
    pub fn new() -> Self {
        Self::default()
    }

    fn ttl() -> Duration {
        Duration::from_millis(COLOR_QUERY_TIMEOUT_MS)
    }

    fn expire(&mut self, now: Instant) {
        let ttl = Self::ttl();
        self.queue
            .retain(|entry| now.duration_since(entry.queued_at) < ttl);
    }

    /// Queue a query for broadcast. Expired entries are dropped first;
    /// overflow beyond `COLOR_QUERY_MAX` drops the new query.
    pub fn enqueue(&mut self, target: ColorTarget, now: Instant) -> bool {
        self.expire(now);
        if self.queue.len() >= COLOR_QUERY_MAX {
            warn!(
                event = "daemon.pty.color_query_dropped",
                queue_len = self.queue.len(),
            );
            return false;
        }
        self.queue.push_back(PendingQuery {
            target,
            queued_at: now,
        });
        true
    }

    /// Take every queued query for sending, counting them as sent.
    pub fn drain_for_send(&mut self, now: Instant) -> Vec<ColorTarget> {
        self.expire(now);
        let targets: Vec<ColorTarget> = self.queue.drain(..).map(|q| q.target).collect();
        self.sent += targets.len() as u64;
        targets
    }

    pub fn note_response(&mut self) {
        self.received += 1;
    }

    /// Arm the deferred DA1 reply. The first trigger's timestamp sticks.
    pub fn arm_da1(&mut self, now: Instant) {
        if self.da1_pending.is_none() {
            self.da1_pending = Some(now);
        }
    }

    pub fn da1_armed(&self) -> bool {
        self.da1_pending.is_some()
    }

    /// The DA1 reply may be written once every sent query has been answered
    /// and none remain queued, or once the defer window has elapsed.
    pub fn da1_due(&self, now: Instant) -> bool {
        match self.da1_pending {
            None => false,
            Some(armed_at) => {
                (self.received >= self.sent && self.queue.is_empty())
                    || now.duration_since(armed_at) >= Self::ttl()
            }
        }
    }

    pub fn clear_da1(&mut self) {
        self.da1_pending = None;
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enqueue_and_drain() {
        let mut state = ColorQueryState::new();
        let now = Instant::now();
        assert!(state.enqueue(ColorTarget::Background, now));
        assert!(state.enqueue(ColorTarget::Palette(196), now));
        let targets = state.drain_for_send(now);
        assert_eq!(
            targets,
            vec![ColorTarget::Background, ColorTarget::Palette(196)]
        );
        assert_eq!(state.queue_len(), 0);
    }

    #[test]
    fn test_overflow_drops_new_queries() {
        let mut state = ColorQueryState::new();
        let now = Instant::now();
        for i in 0..COLOR_QUERY_MAX {
            assert!(state.enqueue(ColorTarget::Palette(i as u8), now));
        }
        assert!(!state.enqueue(ColorTarget::Foreground, now));
        assert_eq!(state.queue_len(), COLOR_QUERY_MAX);
    }

    #[test]
    fn test_expiry_on_enqueue() {
        let now = Instant::now();
        let Some(old) = now.checked_sub(Duration::from_millis(COLOR_QUERY_TIMEOUT_MS + 1)) else {
            return;
        };
        let mut state = ColorQueryState::new();
        state.enqueue(ColorTarget::Background, old);
        assert_eq!(state.queue_len(), 1);
        state.enqueue(ColorTarget::Cursor, now);
        // The stale entry is gone; only the fresh one remains.
        assert_eq!(state.queue_len(), 1);
        assert_eq!(state.drain_for_send(now), vec![ColorTarget::Cursor]);
    }

    #[test]
    fn test_da1_not_due_until_armed() {
        let state = ColorQueryState::new();
        assert!(!state.da1_due(Instant::now()));
    }

    #[test]
    fn test_da1_due_when_no_outstanding_queries() {
        let mut state = ColorQueryState::new();
        let now = Instant::now();
        state.arm_da1(now);
        assert!(state.da1_due(now));
    }

    #[test]
    fn test_da1_waits_for_responses() {
        let mut state = ColorQueryState::new();
        let now = Instant::now();
        state.enqueue(ColorTarget::Background, now);
        state.arm_da1(now);
        // Still queued: not due.
        assert!(!state.da1_due(now));
        let _ = state.drain_for_send(now);
        // Sent but unanswered: not due.
        assert!(!state.da1_due(now));
        state.note_response();
        assert!(state.da1_due(now));
    }

    #[test]
    fn test_da1_due_after_timeout() {
        let now = Instant::now();
        let Some(old) = now.checked_sub(Duration::from_millis(COLOR_QUERY_TIMEOUT_MS)) else {
            return;
        };
        let mut state = ColorQueryState::new();
        state.enqueue(ColorTarget::Background, old);
        let _ = state.drain_for_send(old);
        state.arm_da1(old);
        // Unanswered, but the defer window has elapsed.
        assert!(state.da1_due(now));
    }

    #[test]
    fn test_clear_da1() {
        let mut state = ColorQueryState::new();
        let now = Instant::now();
        state.arm_da1(now);
        assert!(state.da1_armed());
        state.clear_da1();
        assert!(!state.da1_armed());
        assert!(!state.da1_due(now));
    }
}

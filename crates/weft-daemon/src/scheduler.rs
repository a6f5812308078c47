//! Frame scheduler: dirty signals become at most one frame per
//! `FRAME_TIME_MS` per PTY.
//!
//! Pure decision logic; the event loop owns the actual timers. A pending
//! timer is tracked explicitly so a burst of dirty signals during the
//! cool-down arms exactly one timer.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::types::FRAME_TIME_MS;

#[derive(Debug, PartialEq, Eq)]
pub enum Decision {
    /// Render and broadcast now.
    RenderNow,
    /// Arm a timer for the remainder of the frame interval.
    Arm(Duration),
    /// A timer is already armed; coalesce.
    Pending,
}

#[derive(Debug, Default)]
pub struct FrameScheduler {
    last_render: HashMap<u64, Instant>,
    pending: HashSet<u64>,
}

impl FrameScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn frame_time() -> Duration {
        Duration::from_millis(FRAME_TIME_MS)
    }

    /// A dirty signal arrived for this PTY.
    pub fn on_dirty(&mut self, pty_id: u64, now: Instant) -> Decision {
        if self.pending.contains(&pty_id) {
            return Decision::Pending;
        }
        match self.last_render.get(&pty_id) {
            Some(&last) => {
                let elapsed = now.duration_since(last);
                if elapsed >= Self::frame_time() {
                    Decision::RenderNow
                } else {
                    self.pending.insert(pty_id);
                    Decision::Arm(Self::frame_time() - elapsed)
                }
            }
            None => Decision::RenderNow,
        }
    }

    /// The armed timer fired; the caller renders now.
    pub fn timer_fired(&mut self, pty_id: u64) {
        self.pending.remove(&pty_id);
    }

    /// A frame was rendered (or skipped as clean) for this PTY.
    pub fn rendered(&mut self, pty_id: u64, now: Instant) {
        self.last_render.insert(pty_id, now);
    }

    /// Drop all state for a closing PTY.
    pub fn forget(&mut self, pty_id: u64) {
        self.last_render.remove(&pty_id);
        self.pending.remove(&pty_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_dirty_renders_immediately() {
        let mut sched = FrameScheduler::new();
        assert_eq!(sched.on_dirty(0, Instant::now()), Decision::RenderNow);
    }

    #[test]
    fn test_dirty_within_frame_arms_once() {
        let mut sched = FrameScheduler::new();
        let t0 = Instant::now();
        sched.rendered(0, t0);
        let t1 = t0 + Duration::from_millis(2);
        match sched.on_dirty(0, t1) {
            Decision::Arm(remaining) => {
                assert_eq!(remaining, Duration::from_millis(FRAME_TIME_MS - 2));
            }
            other => panic!("expected Arm, got {:?}", other),
        }
        // Further signals during cool-down coalesce into the armed timer.
        assert_eq!(
            sched.on_dirty(0, t1 + Duration::from_millis(1)),
            Decision::Pending
        );
    }

    #[test]
    fn test_dirty_after_frame_time_renders() {
        let mut sched = FrameScheduler::new();
        let t0 = Instant::now();
        sched.rendered(0, t0);
        let t1 = t0 + Duration::from_millis(FRAME_TIME_MS);
        assert_eq!(sched.on_dirty(0, t1), Decision::RenderNow);
    }

    #[test]
    fn test_timer_fired_resets_pending() {
        let mut sched = FrameScheduler::new();
        let t0 = Instant::now();
        sched.rendered(0, t0);
        let _ = sched.on_dirty(0, t0 + Duration::from_millis(1));
        sched.timer_fired(0);
        sched.rendered(0, t0 + Duration::from_millis(8));
        // Next dirty within the new window arms a fresh timer.
        match sched.on_dirty(0, t0 + Duration::from_millis(9)) {
            Decision::Arm(_) => {}
            other => panic!("expected Arm, got {:?}", other),
        }
    }

    #[test]
    fn test_ptys_schedule_independently() {
        let mut sched = FrameScheduler::new();
        let t0 = Instant::now();
        sched.rendered(0, t0);
        let _ = sched.on_dirty(0, t0 + Duration::from_millis(1));
        // PTY 1 has never rendered; its dirty is immediate.
        assert_eq!(
            sched.on_dirty(1, t0 + Duration::from_millis(1)),
            Decision::RenderNow
        );
    }

    #[test]
    fn test_forget_clears_state() {
        let mut sched = FrameScheduler::new();
        let t0 = Instant::now();
        sched.rendered(0, t0);
        let _ = sched.on_dirty(0, t0 + Duration::from_millis(1));
        sched.forget(0);
        assert_eq!(
            sched.on_dirty(0, t0 + Duration::from_millis(2)),
            Decision::RenderNow
        );
    }
}

//! The timer service (§4.2): three named timers that post typed
//! events onto the replica's event queue on expiry. Arming and
//! stopping a timer never runs protocol logic inline — expiry is
//! always observed as a fresh queued event, guarded at the receiving
//! end by the state machine's own predicates (e.g. a stale
//! `newViewTimer` firing after a view-change is simply ignored because
//! its generation no longer matches).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::bft::async_runtime as rt;
use crate::bft::ordering::SeqNo;

/// Identifies which of the three logical timers fired.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum TimeoutKind {
    /// Armed while a block is outstanding; expiry means the current
    /// primary is suspected and a view-change should begin.
    NewView { view: SeqNo },
    /// Armed while a view-change is in flight; expiry re-broadcasts
    /// the local `ViewChange` message.
    VcResend { view: SeqNo },
    /// Armed while idle; expiry means the primary should propose a
    /// null request, or a backup should suspect the primary.
    NullRequest { view: SeqNo },
}

/// A handle used by the timer service to post timeout events; owned
/// by whatever event queue `core::Replica` wires up.
pub trait TimeoutSink: Send + Sync {
    fn deliver_timeout(&self, kind: TimeoutKind);
}

struct Timer {
    generation: AtomicU64,
    active: AtomicBool,
}

impl Timer {
    fn new() -> Self {
        Self {
            generation: AtomicU64::new(0),
            active: AtomicBool::new(false),
        }
    }

    fn rearm(&self) -> u64 {
        self.active.store(true, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    fn still_current(&self, generation: u64) -> bool {
        self.active.load(Ordering::SeqCst) && self.generation.load(Ordering::SeqCst) == generation
    }
}

/// Tracks the three named timers and arms/disarms them against a
/// background runtime.
pub struct TimeoutsHandle {
    sink: Arc<dyn TimeoutSink>,
    new_view: Arc<Timer>,
    vc_resend: Arc<Timer>,
    null_request: Arc<Timer>,
}

impl TimeoutsHandle {
    pub fn new(sink: Arc<dyn TimeoutSink>) -> Self {
        Self {
            sink,
            new_view: Arc::new(Timer::new()),
            vc_resend: Arc::new(Timer::new()),
            null_request: Arc::new(Timer::new()),
        }
    }

    /// Arms `newViewTimer` only if it is not already armed.
    pub fn soft_arm_new_view(&self, view: SeqNo, timeout: Duration) {
        if !self.new_view.active.load(Ordering::SeqCst) {
            self.arm(&self.new_view, timeout, TimeoutKind::NewView { view });
        }
    }

    /// Unconditionally (re)arms `newViewTimer`, discarding any earlier
    /// pending expiry.
    pub fn hard_arm_new_view(&self, view: SeqNo, timeout: Duration) {
        self.arm(&self.new_view, timeout, TimeoutKind::NewView { view });
    }

    pub fn stop_new_view(&self) {
        self.new_view.stop();
    }

    pub fn arm_vc_resend(&self, view: SeqNo, timeout: Duration) {
        self.arm(&self.vc_resend, timeout, TimeoutKind::VcResend { view });
    }

    pub fn stop_vc_resend(&self) {
        self.vc_resend.stop();
    }

    pub fn arm_null_request(&self, view: SeqNo, timeout: Duration) {
        self.arm(
            &self.null_request,
            timeout,
            TimeoutKind::NullRequest { view },
        );
    }

    pub fn stop_null_request(&self) {
        self.null_request.stop();
    }

    fn arm(&self, timer: &Arc<Timer>, timeout: Duration, kind: TimeoutKind) {
        let generation = timer.rearm();
        let timer = Arc::clone(timer);
        let sink = Arc::clone(&self.sink);
        rt::spawn(async move {
            delay(timeout).await;
            if timer.still_current(generation) {
                sink.deliver_timeout(kind);
            }
        });
    }
}

#[cfg(feature = "async_runtime_tokio")]
async fn delay(timeout: Duration) {
    ::tokio::time::sleep(timeout).await;
}

#[cfg(all(feature = "async_runtime_async_std", not(feature = "async_runtime_tokio")))]
async fn delay(timeout: Duration) {
    ::async_std::task::sleep(timeout).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stopping_a_timer_invalidates_its_generation() {
        let timer = Timer::new();
        let g1 = timer.rearm();
        assert!(timer.still_current(g1));
        timer.stop();
        assert!(!timer.still_current(g1));
    }

    #[test]
    fn rearming_invalidates_the_previous_generation() {
        let timer = Timer::new();
        let g1 = timer.rearm();
        let g2 = timer.rearm();
        assert_ne!(g1, g2);
        assert!(!timer.still_current(g1));
        assert!(timer.still_current(g2));
    }
}

//! Timer scheduling for the session table: one pending deadline per session per timer
//! kind (T1, the T1-retransmit grace sub-timer, T3). Sessions themselves have no notion
//! of wall-clock time -- [`ax25::Session::handle`] only ever returns `Action::StartT1`
//! and friends, asking its caller to arrange the wakeup. This wheel is that caller's
//! bookkeeping: `tick` is called once per coordinator cycle and reports every timer whose
//! deadline has passed, same shape as [`kiss::TransportEvent`] draining on a `sync` call.

use ax25::SessionId;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum TimerKind {
    T1,
    Grace,
    T3,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct TimerId {
    pub session: SessionId,
    pub kind: TimerKind,
}

#[derive(Default)]
pub struct TimerWheel {
    deadlines: HashMap<TimerId, Instant>,
}

impl TimerWheel {
    pub fn new() -> TimerWheel {
        TimerWheel::default()
    }

    pub fn arm(&mut self, session: SessionId, kind: TimerKind, now: Instant, delay: Duration) {
        self.deadlines.insert(TimerId { session, kind }, now + delay);
    }

    pub fn cancel(&mut self, session: SessionId, kind: TimerKind) {
        self.deadlines.remove(&TimerId { session, kind });
    }

    /// Cancels every timer belonging to `session`. Called when a session is destroyed or
    /// force-disconnected, before it is removed from the session table.
    pub fn cancel_session(&mut self, session: SessionId) {
        self.deadlines.retain(|id, _| id.session != session);
    }

    /// The nearest deadline still pending, if any. Lets a caller block until there's
    /// actually something to do instead of polling on a fixed cadence.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.values().min().copied()
    }

    /// Returns (and removes) every timer whose deadline is now due.
    pub fn drain_expired(&mut self, now: Instant) -> Vec<TimerId> {
        let expired: Vec<TimerId> = self
            .deadlines
            .iter()
            .filter(|(_, &deadline)| now >= deadline)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            self.deadlines.remove(id);
        }
        expired
    }
}

//! # Storm Detection
//!
//! Counts consecutive ithread passes on a hardware event without an
//! intervening idle park. Once the count crosses the configured threshold the
//! event is throttled: the servicing thread pauses one tick before re-arming
//! the source, capping a runaway line at roughly one dispatch per tick.
//!
//! Kept as a pure state machine so the threshold crossing and the warning
//! rate limit are testable without threads.

/// What the servicing thread should do after a completed pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StormAction {
    /// Normal operation: re-arm the source immediately.
    Rearm,
    /// Storm threshold crossed: pause one tick before re-arming.
    /// `warn` is set at most once per second.
    Throttle { warn: bool },
}

pub(crate) struct StormState {
    /// Passes since the last idle park (or stray dispatches, which also
    /// count toward the storm).
    count: u32,
    /// Tick of the last emitted warning.
    last_warn: Option<u64>,
    /// Total warnings emitted over the event's lifetime.
    warnings: u64,
}

impl StormState {
    pub(crate) const fn new() -> Self {
        Self {
            count: 0,
            last_warn: None,
            warnings: 0,
        }
    }

    /// Account one completed pass. `threshold == 0` disables detection.
    pub(crate) fn note_pass(
        &mut self,
        threshold: u32,
        now_ticks: u64,
        ticks_per_second: u64,
    ) -> StormAction {
        if threshold == 0 || self.count < threshold {
            self.count = self.count.saturating_add(1);
            return StormAction::Rearm;
        }

        let warn = match self.last_warn {
            None => true,
            Some(t) => now_ticks.saturating_sub(t) >= ticks_per_second,
        };
        if warn {
            self.last_warn = Some(now_ticks);
            self.warnings += 1;
        }
        StormAction::Throttle { warn }
    }

    /// A stray dispatch counts toward the storm: a line stuck asserted with
    /// no owner looks exactly like a storm to the rest of the system.
    pub(crate) fn note_stray(&mut self) {
        self.count = self.count.saturating_add(1);
    }

    /// The event went idle; the storm is over.
    pub(crate) fn reset(&mut self) {
        self.count = 0;
    }

    pub(crate) fn warnings(&self) -> u64 {
        self.warnings
    }
}

//! # Handler Records
//!
//! One registered callback on an interrupt event: a fast non-blocking filter
//! and/or a blocking threaded body, a priority, flags, and the removal
//! protocol state. Records are shared (`Arc`) between the event's handler
//! list, the servicing thread's snapshots, and the driver's opaque handle, so
//! a record can never be freed while any of them still reaches it.

use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};

use arrayvec::ArrayString;
use bitflags::bitflags;
use spin::Mutex;
use static_assertions::const_assert;

use crate::error::{ErrorKind, IntrError, IntrResult};
use crate::event::InterruptEvent;
use crate::ithread::IntrThread;
use crate::sched::{Priority, Scheduler};

/// Budget for a handler's display name, including any description suffix.
pub const HANDLER_NAME_MAX: usize = 32;

const_assert!(HANDLER_NAME_MAX >= 8);

bitflags! {
    /// Registration-time handler flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HandlerFlags: u32 {
        /// Demands sole ownership of the event.
        const EXCLUSIVE = 1 << 0;
        /// The threaded body is reentrant with other handlers; no legacy
        /// serialization lock is taken around it.
        const MPSAFE = 1 << 1;
        /// Dispatches of this handler's event feed the entropy sink.
        const ENTROPY = 1 << 2;
    }
}

bitflags! {
    /// Outcome bits of a filter invocation or a whole dispatch.
    ///
    /// The empty set means *stray*: no handler claimed the interrupt.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FilterOutcome: u32 {
        /// A filter fully serviced the immediate condition.
        const HANDLED = 1 << 0;
        /// Threaded work must be scheduled.
        const SCHEDULE = 1 << 1;
    }
}

/// Architecture trap frame handed to filters for clock-style handlers.
/// The dispatcher treats it as opaque.
#[derive(Debug, Clone, Copy)]
pub struct TrapFrame {
    pub vector: u32,
    pub ip: usize,
}

/// A non-blocking callback invoked in interrupt context. Decides whether the
/// interrupt belongs to it and optionally fully services it.
///
/// Filters must not re-enter registration APIs; they run with the event lock
/// held.
pub trait FilterHandler: Send + Sync {
    fn filter(&self, frame: Option<&TrapFrame>) -> FilterOutcome;
}

impl<F> FilterHandler for F
where
    F: Fn(Option<&TrapFrame>) -> FilterOutcome + Send + Sync,
{
    fn filter(&self, frame: Option<&TrapFrame>) -> FilterOutcome {
        self(frame)
    }
}

/// A possibly-blocking callback deferred to an interrupt thread.
pub trait ThreadedHandler: Send + Sync {
    fn run(&self);
}

impl<F> ThreadedHandler for F
where
    F: Fn() + Send + Sync,
{
    fn run(&self) {
        self()
    }
}

/// The callback variant a record carries. At least one body is always
/// present; registration rejects the empty combination.
pub(crate) enum HandlerBody {
    Filter(Box<dyn FilterHandler>),
    Threaded(Box<dyn ThreadedHandler>),
    Both {
        filter: Box<dyn FilterHandler>,
        threaded: Box<dyn ThreadedHandler>,
    },
}

impl HandlerBody {
    pub(crate) fn from_parts(
        filter: Option<Box<dyn FilterHandler>>,
        threaded: Option<Box<dyn ThreadedHandler>>,
    ) -> IntrResult<Self> {
        match (filter, threaded) {
            (Some(f), Some(t)) => Ok(HandlerBody::Both {
                filter: f,
                threaded: t,
            }),
            (Some(f), None) => Ok(HandlerBody::Filter(f)),
            (None, Some(t)) => Ok(HandlerBody::Threaded(t)),
            (None, None) => Err(IntrError::new(
                ErrorKind::InvalidArgument,
                "handler needs a filter or a threaded body",
            )),
        }
    }

    pub(crate) fn filter(&self) -> Option<&dyn FilterHandler> {
        match self {
            HandlerBody::Filter(f) => Some(f.as_ref()),
            HandlerBody::Both { filter, .. } => Some(filter.as_ref()),
            HandlerBody::Threaded(_) => None,
        }
    }

    pub(crate) fn threaded(&self) -> Option<&dyn ThreadedHandler> {
        match self {
            HandlerBody::Threaded(t) => Some(t.as_ref()),
            HandlerBody::Both { threaded, .. } => Some(threaded.as_ref()),
            HandlerBody::Filter(_) => None,
        }
    }
}

// The callbacks are opaque trait objects; only the variant is printable.
impl fmt::Debug for HandlerBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerBody::Filter(_) => f.write_str("HandlerBody::Filter"),
            HandlerBody::Threaded(_) => f.write_str("HandlerBody::Threaded"),
            HandlerBody::Both { .. } => f.write_str("HandlerBody::Both"),
        }
    }
}

// Runtime state bits, distinct from registration flags: mutated while the
// record sits in a live list and read from the dispatch/thread paths.
const STATE_DEAD: u32 = 1 << 0;
const STATE_NEEDS_RUN: u32 = 1 << 1;

/// One-shot completion, signaled exactly once by the thread that unlinks a
/// dead handler. The remover blocks here instead of sleeping on a raw
/// pointer.
pub(crate) struct Completion {
    done: AtomicBool,
}

impl Completion {
    pub(crate) const fn new() -> Self {
        Self {
            done: AtomicBool::new(false),
        }
    }

    pub(crate) fn signal(&self) {
        self.done.store(true, Ordering::Release);
    }

    pub(crate) fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Block the calling task until signaled. Bounded by the servicing
    /// thread finishing its current drain pass.
    pub(crate) fn wait(&self, sched: &dyn Scheduler) {
        while !self.is_done() {
            sched.yield_now();
        }
    }
}

/// A registered handler.
pub struct HandlerRecord {
    pub(crate) name: Mutex<ArrayString<HANDLER_NAME_MAX>>,
    pub(crate) body: HandlerBody,
    pub(crate) priority: Priority,
    pub(crate) flags: HandlerFlags,
    state: AtomicU32,
    pub(crate) event: Weak<InterruptEvent>,
    pub(crate) removal: Completion,
    /// Dedicated thread in per-handler ownership mode.
    pub(crate) thread: spin::Once<Arc<IntrThread>>,
}

impl HandlerRecord {
    pub(crate) fn new(
        name: &str,
        body: HandlerBody,
        priority: Priority,
        flags: HandlerFlags,
        event: Weak<InterruptEvent>,
    ) -> Self {
        Self {
            name: Mutex::new(bounded(name)),
            body,
            priority,
            flags,
            state: AtomicU32::new(0),
            event,
            removal: Completion::new(),
            thread: spin::Once::new(),
        }
    }

    pub(crate) fn is_dead(&self) -> bool {
        self.state.load(Ordering::Acquire) & STATE_DEAD != 0
    }

    pub(crate) fn mark_dead(&self) {
        self.state.fetch_or(STATE_DEAD, Ordering::AcqRel);
    }

    pub(crate) fn set_needs_run(&self) {
        self.state.fetch_or(STATE_NEEDS_RUN, Ordering::AcqRel);
    }

    /// Consume the needs-run bit, reporting whether it was set.
    pub(crate) fn take_needs_run(&self) -> bool {
        self.state.fetch_and(!STATE_NEEDS_RUN, Ordering::AcqRel) & STATE_NEEDS_RUN != 0
    }

    pub(crate) fn needs_run(&self) -> bool {
        self.state.load(Ordering::Acquire) & STATE_NEEDS_RUN != 0
    }

    /// Append `:text` to the display name if room remains.
    pub(crate) fn describe(&self, text: &str) -> IntrResult<()> {
        let mut name = self.name.lock();
        if name.len() + 1 + text.len() > name.capacity() {
            return Err(IntrError::new(
                ErrorKind::OutOfSpace,
                "handler description does not fit the name budget",
            ));
        }
        // Checked above; the pushes cannot fail.
        let _ = name.try_push(':');
        let _ = name.try_push_str(text);
        Ok(())
    }
}

/// Opaque handle to a registered handler, returned by registration.
///
/// Keeps the record reachable until the driver drops it; the record is
/// unlinked from the event by [`remove`](HandlerHandle::remove) long before
/// the memory goes away.
pub struct HandlerHandle {
    pub(crate) record: Arc<HandlerRecord>,
}

impl HandlerHandle {
    /// Unregister the handler.
    ///
    /// Blocks the calling task (never interrupt context) until the servicing
    /// thread has provably stopped reaching the record. A removal issued
    /// from within the handler's own threaded body completes without
    /// blocking: the thread unlinks the record before parking.
    pub fn remove(self) -> IntrResult<()> {
        let event = self
            .record
            .event
            .upgrade()
            .ok_or(IntrError::new(ErrorKind::NotFound, "event no longer exists"))?;
        event.remove_handler(&self.record)
    }

    /// Append `:text` to the handler's display name, then refresh the
    /// event's aggregate display name.
    pub fn describe(&self, text: &str) -> IntrResult<()> {
        let event = self
            .record
            .event
            .upgrade()
            .ok_or(IntrError::new(ErrorKind::NotFound, "event no longer exists"))?;
        self.record.describe(text)?;
        event.refresh_fullname();
        Ok(())
    }

    /// The opaque source of the owning event, if any.
    pub fn source(&self) -> Option<Arc<dyn crate::event::IntrSource>> {
        self.record.event.upgrade().and_then(|e| e.source())
    }

    /// Priority this handler registered with.
    pub fn priority(&self) -> Priority {
        self.record.priority
    }
}

impl fmt::Debug for HandlerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerHandle")
            .field("name", &self.record.name.lock().as_str())
            .field("priority", &self.record.priority)
            .field("flags", &self.record.flags)
            .finish_non_exhaustive()
    }
}

/// Copy `s` into a bounded name, truncating at the budget.
pub(crate) fn bounded<const N: usize>(s: &str) -> ArrayString<N> {
    let mut out = ArrayString::new();
    for ch in s.chars() {
        if out.try_push(ch).is_err() {
            break;
        }
    }
    out
}

//! # Kestrel Interrupt Event Dispatcher
//!
//! Turns a hardware or software interrupt occurrence into safe, ordered,
//! possibly-deferred execution of registered callback chains. Drivers register
//! handlers (a fast non-blocking *filter*, a blocking *threaded* body, or
//! both) on an interrupt event; the dispatcher runs filters synchronously in
//! interrupt context and defers threaded work to a dedicated worker task.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                        INTERRUPT DISPATCH PATH                      │
//! │                                                                     │
//! │   hardware trigger                 swi_schedule()                   │
//! │         │                                │                          │
//! │         ▼                                ▼                          │
//! │   ┌───────────┐   filters   ┌──────────────────────┐               │
//! │   │ dispatch()│────────────▶│   InterruptEvent     │               │
//! │   └─────┬─────┘  in-order   │  (sorted handlers)   │               │
//! │         │                   └──────────┬───────────┘               │
//! │         │ Handled ─▶ post_filter()     │ ScheduleThread            │
//! │         │                              ▼                           │
//! │         │ pre_ithread() ──▶ ┌──────────────────────┐               │
//! │         └─────────────────▶ │   InterruptThread    │               │
//! │                             │  park ─ drain ─ park │               │
//! │                             └──────────┬───────────┘               │
//! │                                        │ storm throttle            │
//! │                                        ▼ post_ithread()            │
//! │                             threaded handler chain                 │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Invariants
//!
//! 1. **Ordering**: the handler list of an event is always sorted by
//!    non-decreasing priority, and both the filter loop and the threaded
//!    drain execute handlers in that order.
//! 2. **Exclusivity**: at most one handler per event carries
//!    [`HandlerFlags::EXCLUSIVE`], and then it is the only handler.
//! 3. **Removal safety**: a handler marked dead is never invoked again, is
//!    unlinked exactly once, and the remover does not return until the
//!    handler is provably unreachable.
//! 4. **Thread ownership**: exactly one live scheduler task per
//!    [`ithread::IntrThread`]; a terminating thread drains once more, then exits
//!    and frees itself. No other component frees a live thread's state.
//!
//! The host kernel supplies scheduling, time, entropy, and privilege services
//! through the contracts in [`sched`]; the dispatcher never touches scheduler
//! internals directly.

#![no_std]
#![allow(dead_code)]

extern crate alloc;

#[cfg(test)]
extern crate std;

/// Error kinds and result alias.
pub mod error;

/// Host-service contracts (scheduler, clock, entropy, privilege).
pub mod sched;

/// Handler records, flags, and callback traits.
pub mod handler;

/// Interrupt events: handler lists, display names, affinity.
pub mod event;

/// Interrupt-context dispatch (filter loop).
pub mod dispatch;

/// Interrupt worker threads (the ithread service loop).
pub mod ithread;

/// Storm detection policy.
mod storm;

/// Process-wide event registry and observability surface.
pub mod registry;

/// Software interrupt layer.
pub mod swi;

#[cfg(test)]
pub(crate) mod test_support;


pub use dispatch::dispatch;
pub use error::{ErrorKind, IntrError, IntrResult};
pub use event::{EventFlags, InterruptEvent, IntrSource, EVENT_FULLNAME_MAX, EVENT_NAME_MAX};
pub use handler::{
    FilterHandler, FilterOutcome, HandlerFlags, HandlerHandle, ThreadedHandler, TrapFrame,
    HANDLER_NAME_MAX,
};
pub use registry::{
    EventSnapshot, HandlerSnapshot, InterruptCounter, IntrConfig, IntrRegistry, ThreadPolicy,
    DEFAULT_STORM_THRESHOLD,
};
pub use sched::{
    Clock, CpuId, EntropySink, Priority, PrivilegeCheck, Scheduler, Services, TaskId, ThreadBody,
};
pub use swi::{swi_add_handler, swi_create, swi_schedule};

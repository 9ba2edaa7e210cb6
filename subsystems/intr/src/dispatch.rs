//! # Interrupt-Context Dispatch
//!
//! [`dispatch`] is the entry the low-level interrupt glue calls when a
//! hardware event fires. It walks the registered filters in priority order
//! under the event lock; the first filter that claims the interrupt owns
//! this dispatch instance and the remaining filters are skipped. The
//! outcome selects the fast path (a filter fully serviced the interrupt and
//! the source is re-armed), the deferred path (mask the source, wake the
//! interrupt thread(s)), or stray accounting.
//!
//! This path never allocates and never blocks; the only lock taken is the
//! event spin lock, which registration holds only for short list surgery.

use core::sync::atomic::Ordering;

use alloc::sync::Arc;

use crate::error::{ErrorKind, IntrError, IntrResult};
use crate::event::{EventFlags, EventInner, InterruptEvent};
use crate::handler::{FilterOutcome, HandlerRecord, TrapFrame};

/// Stray dispatches logged per event before going quiet.
const STRAY_LOG_MAX: u64 = 5;

/// Dispatch one hardware interrupt occurrence to `event`.
///
/// Returns the claiming filter's outcome, [`FilterOutcome::SCHEDULE`] when
/// no filter claimed but threaded-only handlers exist, or the empty set for
/// a stray dispatch. Software events are never dispatched from hardware and
/// report `InvalidArgument`.
pub fn dispatch(event: &Arc<InterruptEvent>, frame: Option<&TrapFrame>) -> IntrResult<FilterOutcome> {
    if event.is_software() {
        return Err(IntrError::new(
            ErrorKind::InvalidArgument,
            "software events are scheduled, not dispatched",
        ));
    }

    event.dispatches.fetch_add(1, Ordering::Relaxed);
    let services = event.services();
    let sched = services.sched.as_ref();

    let mut inner = event.inner.lock();

    if inner.flags.contains(EventFlags::HAS_ENTROPY) {
        if let Some(entropy) = &services.entropy {
            entropy.harvest(event.irq(), services.clock.now_ticks());
        }
    }

    // Filter pass, in priority order. The first claimant ends the walk.
    let mut outcome = FilterOutcome::empty();
    let mut claimant: Option<&Arc<HandlerRecord>> = None;
    let mut thread_only_seen = false;
    for record in &inner.handlers {
        if record.is_dead() {
            continue;
        }
        match record.body.filter() {
            None => thread_only_seen = true,
            Some(filter) => {
                let claimed = filter.filter(frame);
                if !claimed.is_empty() {
                    outcome = claimed;
                    claimant = Some(record);
                    break;
                }
            },
        }
    }

    match claimant {
        Some(record) => {
            if outcome.contains(FilterOutcome::SCHEDULE) {
                if record.body.threaded().is_none() {
                    panic!("filter requested a thread but the handler has no threaded body");
                }
                mark_thread(record, &inner);
            }
        },
        None if thread_only_seen => {
            // Nobody claimed, but threaded-only handlers may still own the
            // line; every one of them gets a look.
            outcome = FilterOutcome::SCHEDULE;
            for record in &inner.handlers {
                if record.is_dead() || record.body.filter().is_some() {
                    continue;
                }
                mark_thread(record, &inner);
            }
        },
        None => {},
    }

    if outcome.is_empty() {
        let strays = event.strays.fetch_add(1, Ordering::Relaxed) + 1;
        inner.storm.note_stray();
        drop(inner);
        if strays <= STRAY_LOG_MAX {
            log::warn!("stray interrupt on \"{}\"", event.name());
            if strays == STRAY_LOG_MAX {
                log::warn!(
                    "too many stray interrupts on \"{}\"; not logging any more",
                    event.name()
                );
            }
        }
        return Ok(outcome);
    }

    if outcome.contains(FilterOutcome::SCHEDULE) {
        // Mask before waking so the line cannot re-fire into a half-serviced
        // event; the thread re-arms via post_ithread after draining.
        if let Some(source) = event.source() {
            source.pre_ithread();
        }
        if let Some(thread) = &inner.thread {
            if thread.pending() {
                sched.wake(thread.task());
            }
        }
        for record in &inner.handlers {
            if let Some(thread) = record.thread.get() {
                if thread.pending() {
                    sched.wake(thread.task());
                }
            }
        }
    } else if let Some(source) = event.source() {
        // Fully serviced by the claiming filter.
        source.post_filter();
    }

    Ok(outcome)
}

/// Latch work for the thread servicing `record`: its dedicated thread if it
/// has one, the event's shared thread otherwise. A threaded handler with no
/// reachable thread means registration's thread-creation invariant broke.
fn mark_thread(record: &Arc<HandlerRecord>, inner: &spin::MutexGuard<'_, EventInner>) {
    match record.thread.get() {
        Some(thread) => thread.set_need(),
        None => match &inner.thread {
            Some(thread) => thread.set_need(),
            None => panic!("threaded handler registered without a worker thread"),
        },
    }
}

//! # Software Interrupts
//!
//! A software interrupt is an interrupt event with no hardware line behind
//! it: no filters, threaded handlers only, triggered by
//! [`swi_schedule`] instead of a hardware dispatch. Each handler carries its
//! own needs-run latch, so scheduling one handler never runs its neighbors
//! on the same event.

use alloc::boxed::Box;
use alloc::sync::Arc;

use crate::error::{ErrorKind, IntrError, IntrResult};
use crate::event::{EventFlags, InterruptEvent, IntrSource};
use crate::handler::{HandlerFlags, HandlerHandle, ThreadedHandler};
use crate::registry::IntrRegistry;
use crate::sched::{CpuId, Priority};

/// Source for software events. There is no hardware to mask or re-arm, and
/// steering is purely thread affinity, so every callback is a no-op and CPU
/// assignment always succeeds.
struct SwiSource;

impl IntrSource for SwiSource {
    fn assign_cpu(&self, _cpu: Option<CpuId>) -> IntrResult<()> {
        Ok(())
    }
}

/// Create a software interrupt event.
pub fn swi_create(
    registry: &IntrRegistry,
    name: &str,
    base_pri: Priority,
) -> IntrResult<Arc<InterruptEvent>> {
    registry.create_event(
        name,
        None,
        EventFlags::SOFTWARE,
        Some(Arc::new(SwiSource)),
        base_pri,
    )
}

/// Register a threaded handler on a software event.
///
/// Software handlers cannot be entropy sources: their trigger timing is
/// driven by the kernel itself and carries no randomness worth harvesting.
pub fn swi_add_handler(
    event: &Arc<InterruptEvent>,
    name: &str,
    handler: Box<dyn ThreadedHandler>,
    priority: Priority,
    flags: HandlerFlags,
) -> IntrResult<HandlerHandle> {
    if !event.is_software() {
        return Err(IntrError::new(
            ErrorKind::InvalidArgument,
            "handler target is not a software event",
        ));
    }
    if flags.contains(HandlerFlags::ENTROPY) {
        return Err(IntrError::new(
            ErrorKind::InvalidArgument,
            "software handlers cannot be entropy sources",
        ));
    }
    event.add_handler(name, None, Some(handler), priority, flags)
}

/// Trigger a software handler.
///
/// Latches the handler's needs-run bit and, unless `defer` is set, wakes its
/// servicing thread. A deferred schedule runs piggybacked the next time the
/// thread wakes for any other reason.
pub fn swi_schedule(handle: &HandlerHandle, defer: bool) -> IntrResult<()> {
    let record = &handle.record;
    let event = record
        .event
        .upgrade()
        .ok_or(IntrError::new(ErrorKind::NotFound, "event no longer exists"))?;
    if !event.is_software() {
        return Err(IntrError::new(
            ErrorKind::InvalidArgument,
            "only software handlers can be scheduled",
        ));
    }
    if record.is_dead() {
        return Err(IntrError::new(
            ErrorKind::NotFound,
            "handler is being removed",
        ));
    }

    event
        .dispatches
        .fetch_add(1, core::sync::atomic::Ordering::Relaxed);
    record.set_needs_run();
    if defer {
        return Ok(());
    }

    let sched = event.services().sched.clone();
    let thread = match record.thread.get() {
        Some(thread) => Some(thread.clone()),
        None => event.inner.lock().thread.clone(),
    };
    match thread {
        Some(thread) => {
            thread.poke(sched.as_ref());
            Ok(())
        },
        None => panic!("software handler registered without a worker thread"),
    }
}

//! # Event Registry
//!
//! Process-wide table of interrupt events plus the dispatcher configuration.
//! The registry is the construction surface (create/destroy events, bind by
//! IRQ number) and the observability surface: point-in-time snapshots of
//! every event and a flat counter table in the style of classic
//! `intrcnt`/`intrnames` arrays.

use core::sync::atomic::{AtomicU32, Ordering};

use alloc::sync::Arc;
use alloc::vec::Vec;

use arrayvec::ArrayString;
use spin::Mutex;

use crate::error::{ErrorKind, IntrError, IntrResult};
use crate::event::{
    EventFlags, InterruptEvent, IntrSource, EVENT_FULLNAME_MAX, EVENT_NAME_MAX,
};
use crate::handler::{HandlerFlags, HANDLER_NAME_MAX};
use crate::sched::{CpuId, Priority, Services};

/// Consecutive ithread passes before an event is considered storming.
pub const DEFAULT_STORM_THRESHOLD: u32 = 1000;

/// How worker threads map onto handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThreadPolicy {
    /// One thread per event, draining the whole handler chain.
    Shared,
    /// One thread per threaded handler. A slow handler cannot delay an
    /// unrelated one, at the cost of a task per handler.
    #[default]
    PerHandler,
}

/// Dispatcher configuration, shared by every event of a registry.
pub struct IntrConfig {
    /// Fixed at construction; changing it under live events would strand
    /// threads.
    pub thread_policy: ThreadPolicy,
    storm_threshold: AtomicU32,
}

impl IntrConfig {
    pub fn new(thread_policy: ThreadPolicy) -> Self {
        Self {
            thread_policy,
            storm_threshold: AtomicU32::new(DEFAULT_STORM_THRESHOLD),
        }
    }

    /// Current storm threshold; `0` disables detection.
    pub fn storm_threshold(&self) -> u32 {
        self.storm_threshold.load(Ordering::Relaxed)
    }

    /// Runtime-tunable, takes effect on the next ithread pass.
    pub fn set_storm_threshold(&self, threshold: u32) {
        self.storm_threshold.store(threshold, Ordering::Relaxed);
    }
}

impl Default for IntrConfig {
    fn default() -> Self {
        Self::new(ThreadPolicy::default())
    }
}

/// Point-in-time view of one registered handler.
#[derive(Debug, Clone)]
pub struct HandlerSnapshot {
    pub name: ArrayString<HANDLER_NAME_MAX>,
    pub priority: Priority,
    pub flags: HandlerFlags,
    /// Software handler scheduled but not yet run.
    pub pending: bool,
    /// Marked for removal, unlink outstanding.
    pub dead: bool,
}

/// Point-in-time view of one event.
#[derive(Debug, Clone)]
pub struct EventSnapshot {
    pub name: ArrayString<EVENT_NAME_MAX>,
    pub fullname: ArrayString<EVENT_FULLNAME_MAX>,
    pub irq: Option<u32>,
    pub software: bool,
    pub cpu: Option<CpuId>,
    pub has_thread: bool,
    pub storm_warnings: u64,
    pub handlers: Vec<HandlerSnapshot>,
}

/// One row of the flat counter table.
#[derive(Debug, Clone)]
pub struct InterruptCounter {
    pub name: ArrayString<EVENT_FULLNAME_MAX>,
    /// Hardware dispatches or software schedules.
    pub count: u64,
    /// Dispatches no handler claimed.
    pub strays: u64,
}

/// The process-wide event table.
pub struct IntrRegistry {
    services: Services,
    config: Arc<IntrConfig>,
    events: Mutex<Vec<Arc<InterruptEvent>>>,
}

impl IntrRegistry {
    pub fn new(services: Services, config: IntrConfig) -> Self {
        Self {
            services,
            config: Arc::new(config),
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &Arc<IntrConfig> {
        &self.config
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Create an event. `flags` may only carry [`EventFlags::SOFTWARE`]; the
    /// remaining flags are derived state. Names must be unique.
    pub fn create_event(
        &self,
        name: &str,
        irq: Option<u32>,
        flags: EventFlags,
        source: Option<Arc<dyn IntrSource>>,
        base_pri: Priority,
    ) -> IntrResult<Arc<InterruptEvent>> {
        if !flags.difference(EventFlags::SOFTWARE).is_empty() {
            return Err(IntrError::new(
                ErrorKind::InvalidArgument,
                "only the software flag may be given at creation",
            ));
        }
        if name.is_empty() {
            return Err(IntrError::new(
                ErrorKind::InvalidArgument,
                "event name must not be empty",
            ));
        }

        let mut events = self.events.lock();
        if events.iter().any(|e| e.name().as_str() == name) {
            return Err(IntrError::new(
                ErrorKind::InvalidArgument,
                "event name already registered",
            ));
        }
        let event = InterruptEvent::new(
            name,
            irq,
            flags.contains(EventFlags::SOFTWARE),
            source,
            base_pri,
            self.services.clone(),
            self.config.clone(),
        );
        events.push(event.clone());
        Ok(event)
    }

    /// Destroy an event. Fails with `Busy` while handlers remain; otherwise
    /// terminates the event's worker threads and drops it from the table.
    pub fn destroy_event(&self, event: &Arc<InterruptEvent>) -> IntrResult<()> {
        // Held across the teardown so a racing lookup cannot observe a
        // half-destroyed event.
        let mut events = self.events.lock();
        if !events.iter().any(|e| Arc::ptr_eq(e, event)) {
            return Err(IntrError::new(
                ErrorKind::NotFound,
                "event is not registered here",
            ));
        }
        event.shutdown()?;
        events.retain(|e| !Arc::ptr_eq(e, event));
        Ok(())
    }

    /// The hardware event wired to `irq`, if any. Software events and
    /// events with no registered handlers are not candidates.
    pub fn lookup_by_irq(&self, irq: u32) -> Option<Arc<InterruptEvent>> {
        self.events
            .lock()
            .iter()
            .find(|e| {
                !e.is_software()
                    && e.irq() == Some(irq)
                    && !e.inner.lock().handlers.is_empty()
            })
            .cloned()
    }

    /// Bind the hardware event wired to `irq` to `cpu` (`None` unbinds).
    pub fn bind_irq(&self, irq: u32, cpu: Option<CpuId>) -> IntrResult<()> {
        let event = self.lookup_by_irq(irq).ok_or(IntrError::new(
            ErrorKind::NotFound,
            "no event wired to that irq",
        ))?;
        event.bind(cpu)
    }

    /// Point-in-time view of every event and its handler chain.
    pub fn snapshot(&self) -> Vec<EventSnapshot> {
        let events = self.events.lock().clone();
        events
            .iter()
            .map(|event| {
                let inner = event.inner.lock();
                EventSnapshot {
                    name: event.name(),
                    fullname: inner.fullname,
                    irq: event.irq(),
                    software: event.is_software(),
                    cpu: inner.cpu,
                    has_thread: !event.threads_locked(&inner).is_empty(),
                    storm_warnings: inner.storm.warnings(),
                    handlers: inner
                        .handlers
                        .iter()
                        .map(|h| HandlerSnapshot {
                            name: *h.name.lock(),
                            priority: h.priority,
                            flags: h.flags,
                            pending: h.needs_run(),
                            dead: h.is_dead(),
                        })
                        .collect(),
                }
            })
            .collect()
    }

    /// Flat dispatch/stray counter table, one row per event, labeled with
    /// the event's full display name.
    pub fn counters(&self) -> Vec<InterruptCounter> {
        let events = self.events.lock().clone();
        events
            .iter()
            .map(|event| InterruptCounter {
                name: event.fullname(),
                count: event.dispatch_count(),
                strays: event.stray_count(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{self, NoopScheduler};

    fn registry() -> IntrRegistry {
        let services = test_support::noop_services(Arc::new(NoopScheduler::new()));
        IntrRegistry::new(services, IntrConfig::new(ThreadPolicy::Shared))
    }

    #[test]
    fn create_rejects_derived_flags_and_duplicates() {
        let reg = registry();
        let err = reg
            .create_event("bad", None, EventFlags::HAS_ENTROPY, None, Priority(8))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        reg.create_event("irq3", Some(3), EventFlags::empty(), None, Priority(8))
            .unwrap();
        let err = reg
            .create_event("irq3", Some(3), EventFlags::empty(), None, Priority(8))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn destroy_refuses_busy_events() {
        let reg = registry();
        let event = reg
            .create_event("irq5", Some(5), EventFlags::empty(), None, Priority(8))
            .unwrap();
        let h = event
            .add_handler(
                "d",
                Some(alloc::boxed::Box::new(|_: Option<&crate::TrapFrame>| {
                    crate::FilterOutcome::HANDLED
                })),
                None,
                Priority(8),
                HandlerFlags::empty(),
            )
            .unwrap();

        let err = reg.destroy_event(&event).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Busy);

        h.remove().unwrap();
        reg.destroy_event(&event).unwrap();
        assert!(reg.lookup_by_irq(5).is_none());
        // Second destroy no longer finds it.
        assert_eq!(
            reg.destroy_event(&event).unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn lookup_skips_software_and_empty_events() {
        let reg = registry();
        reg.create_event("swi-net", Some(9), EventFlags::SOFTWARE, None, Priority(6))
            .unwrap();
        assert!(reg.lookup_by_irq(9).is_none());

        let hw = reg
            .create_event("irq9", Some(9), EventFlags::empty(), None, Priority(8))
            .unwrap();
        // No handlers yet: the line is not considered wired up.
        assert!(reg.lookup_by_irq(9).is_none());

        hw.add_handler(
            "uhci",
            Some(alloc::boxed::Box::new(|_: Option<&crate::TrapFrame>| {
                crate::FilterOutcome::HANDLED
            })),
            None,
            Priority(8),
            HandlerFlags::empty(),
        )
        .unwrap();
        let found = reg.lookup_by_irq(9).unwrap();
        assert!(Arc::ptr_eq(&hw, &found));
    }

    #[test]
    fn counters_track_dispatches() {
        let reg = registry();
        let event = reg
            .create_event("irq2", Some(2), EventFlags::empty(), None, Priority(8))
            .unwrap();
        event
            .add_handler(
                "nic",
                Some(alloc::boxed::Box::new(|_: Option<&crate::TrapFrame>| {
                    crate::FilterOutcome::HANDLED
                })),
                None,
                Priority(8),
                HandlerFlags::empty(),
            )
            .unwrap();

        for _ in 0..3 {
            crate::dispatch::dispatch(&event, None).unwrap();
        }
        let rows = reg.counters();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].count, 3);
        assert_eq!(rows[0].strays, 0);
        assert_eq!(rows[0].name.as_str(), "irq2 nic");
    }

    #[test]
    fn snapshot_reflects_handler_state() {
        let reg = registry();
        let event = reg
            .create_event("irq4", Some(4), EventFlags::empty(), None, Priority(8))
            .unwrap();
        event
            .add_handler(
                "uart",
                Some(alloc::boxed::Box::new(|_: Option<&crate::TrapFrame>| {
                    crate::FilterOutcome::HANDLED
                })),
                None,
                Priority(3),
                HandlerFlags::ENTROPY,
            )
            .unwrap();

        let snap = reg.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].fullname.as_str(), "irq4 uart");
        assert!(!snap[0].software);
        assert!(!snap[0].has_thread);
        assert_eq!(snap[0].handlers.len(), 1);
        assert_eq!(snap[0].handlers[0].priority, Priority(3));
        assert!(snap[0].handlers[0].flags.contains(HandlerFlags::ENTROPY));
        assert!(!snap[0].handlers[0].dead);
    }
}

//! # Interrupt Events
//!
//! An [`InterruptEvent`] owns an ordered collection of handler records, the
//! worker thread(s) that service them, CPU affinity state, and storm
//! counters. Registration keeps the collection sorted by non-decreasing
//! priority; removal never frees a record the servicing thread might still
//! reach.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use alloc::boxed::Box;
use alloc::format;
use alloc::sync::Arc;
use alloc::vec::Vec;

use arrayvec::ArrayString;
use bitflags::bitflags;
use spin::{Mutex, MutexGuard};

use crate::error::{ErrorKind, IntrError, IntrResult};
use crate::handler::{
    bounded, FilterHandler, HandlerBody, HandlerFlags, HandlerHandle, HandlerRecord,
    ThreadedHandler,
};
use crate::ithread::{IntrThread, ThreadOwner};
use crate::registry::{IntrConfig, ThreadPolicy};
use crate::sched::{CpuId, Priority, Services};
use crate::storm::StormState;

/// Budget for an event's base name.
pub const EVENT_NAME_MAX: usize = 32;

/// Budget for the cached display name (base name plus handler names).
pub const EVENT_FULLNAME_MAX: usize = 96;

bitflags! {
    /// Event flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventFlags: u32 {
        /// Software-triggered event; never dispatched from hardware.
        const SOFTWARE = 1 << 0;
        /// At least one handler is an entropy source.
        const HAS_ENTROPY = 1 << 1;
        /// A worker thread is being created; concurrent creators wait.
        const THREAD_SPAWNING = 1 << 2;
    }
}

/// Source-control callbacks supplied by the interrupt controller driver.
///
/// All callbacks default to no-ops except [`assign_cpu`](Self::assign_cpu),
/// which reports `Unsupported` so binding fails cleanly on sources that
/// cannot steer interrupts.
pub trait IntrSource: Send + Sync {
    /// Mask the source before threaded work is handed off.
    fn pre_ithread(&self) {}

    /// Re-arm the source after a threaded drain pass.
    fn post_ithread(&self) {}

    /// Re-arm the source after a filter fully serviced the interrupt.
    fn post_filter(&self) {}

    /// Steer the source to `cpu` (`None` unbinds).
    fn assign_cpu(&self, _cpu: Option<CpuId>) -> IntrResult<()> {
        Err(IntrError::new(
            ErrorKind::Unsupported,
            "source cannot steer interrupts",
        ))
    }
}

/// State guarded by the event lock.
pub(crate) struct EventInner {
    pub(crate) flags: EventFlags,
    pub(crate) fullname: ArrayString<EVENT_FULLNAME_MAX>,
    pub(crate) cpu: Option<CpuId>,
    /// Always sorted by non-decreasing priority.
    pub(crate) handlers: Vec<Arc<HandlerRecord>>,
    /// Worker thread in shared ownership mode.
    pub(crate) thread: Option<Arc<IntrThread>>,
    pub(crate) storm: StormState,
}

/// One interrupt event: a hardware IRQ line or a software interrupt.
pub struct InterruptEvent {
    pub(crate) name: ArrayString<EVENT_NAME_MAX>,
    pub(crate) irq: Option<u32>,
    pub(crate) software: bool,
    pub(crate) base_pri: Priority,
    pub(crate) source: Option<Arc<dyn IntrSource>>,
    pub(crate) services: Services,
    pub(crate) config: Arc<IntrConfig>,
    pub(crate) inner: Mutex<EventInner>,
    pub(crate) dispatches: AtomicU64,
    pub(crate) strays: AtomicU64,
}

impl fmt::Debug for InterruptEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterruptEvent")
            .field("name", &self.name.as_str())
            .field("irq", &self.irq)
            .field("software", &self.software)
            .finish_non_exhaustive()
    }
}

impl InterruptEvent {
    pub(crate) fn new(
        name: &str,
        irq: Option<u32>,
        software: bool,
        source: Option<Arc<dyn IntrSource>>,
        base_pri: Priority,
        services: Services,
        config: Arc<IntrConfig>,
    ) -> Arc<Self> {
        let name: ArrayString<EVENT_NAME_MAX> = bounded(name);
        let mut flags = EventFlags::empty();
        if software {
            flags.insert(EventFlags::SOFTWARE);
        }
        let mut fullname = ArrayString::new();
        let _ = fullname.try_push_str(name.as_str());
        Arc::new(Self {
            name,
            irq,
            software,
            base_pri,
            source,
            services,
            config,
            inner: Mutex::new(EventInner {
                flags,
                fullname,
                cpu: None,
                handlers: Vec::new(),
                thread: None,
                storm: StormState::new(),
            }),
            dispatches: AtomicU64::new(0),
            strays: AtomicU64::new(0),
        })
    }

    /// The event's base name.
    pub fn name(&self) -> ArrayString<EVENT_NAME_MAX> {
        self.name
    }

    /// The cached display name: base name plus the registered handler names,
    /// truncated with a terminal `+` if they overflow the budget.
    pub fn fullname(&self) -> ArrayString<EVENT_FULLNAME_MAX> {
        self.inner.lock().fullname
    }

    /// Hardware IRQ number, or `None` for software events.
    pub fn irq(&self) -> Option<u32> {
        self.irq
    }

    pub fn is_software(&self) -> bool {
        self.software
    }

    /// Current CPU affinity (`None` means unbound).
    pub fn affinity(&self) -> Option<CpuId> {
        self.inner.lock().cpu
    }

    /// The driver-supplied source, if any.
    pub fn source(&self) -> Option<Arc<dyn IntrSource>> {
        self.source.clone()
    }

    /// Total hardware dispatches and software schedules observed.
    pub fn dispatch_count(&self) -> u64 {
        self.dispatches.load(Ordering::Relaxed)
    }

    /// Dispatches no handler claimed.
    pub fn stray_count(&self) -> u64 {
        self.strays.load(Ordering::Relaxed)
    }

    pub(crate) fn services(&self) -> &Services {
        &self.services
    }

    // -------------------------------------------------------------------
    // Handler registration
    // -------------------------------------------------------------------

    /// Register a handler. At least one of `filter`/`threaded` must be
    /// given. The record is inserted at the position preserving
    /// non-decreasing priority order.
    pub fn add_handler(
        self: &Arc<Self>,
        name: &str,
        filter: Option<Box<dyn FilterHandler>>,
        threaded: Option<Box<dyn ThreadedHandler>>,
        priority: Priority,
        flags: HandlerFlags,
    ) -> IntrResult<HandlerHandle> {
        let body = HandlerBody::from_parts(filter, threaded)?;
        if self.software && body.filter().is_some() {
            return Err(IntrError::new(
                ErrorKind::InvalidArgument,
                "software events take threaded handlers only",
            ));
        }

        // Early exclusivity check; re-validated under the same lock at
        // insertion since thread creation below releases it.
        self.check_exclusive(&self.inner.lock(), flags)?;

        let record = Arc::new(HandlerRecord::new(
            name,
            body,
            priority,
            flags,
            Arc::downgrade(self),
        ));

        if record.body.threaded().is_some()
            && matches!(self.config.thread_policy, ThreadPolicy::PerHandler)
        {
            let wname = format!("intr: {}:{}", self.name, name);
            let thread = IntrThread::spawn(
                self,
                ThreadOwner::PerHandler(Arc::downgrade(&record)),
                &wname,
                priority,
            );
            record.thread.call_once(|| thread);
        }

        // In shared mode the worker must exist before the record becomes
        // visible to dispatch. Re-ensure until it is still there under the
        // lock the insertion happens with: a racing failed registration may
        // have torn an unused worker down in between.
        let needs_shared = record.body.threaded().is_some()
            && matches!(self.config.thread_policy, ThreadPolicy::Shared);
        let mut inner = loop {
            let guard = self.inner.lock();
            if !needs_shared || guard.thread.is_some() {
                break guard;
            }
            drop(guard);
            self.ensure_shared_thread(priority);
        };

        if let Err(e) = self.check_exclusive(&inner, flags) {
            // Undo the eagerly created per-handler thread, plus a shared
            // thread no linked handler needs.
            let spare = if inner.handlers.iter().all(|h| h.body.threaded().is_none()) {
                inner.thread.take()
            } else {
                None
            };
            drop(inner);
            if let Some(thread) = record.thread.get() {
                thread.request_terminate(self.services.sched.as_ref());
            }
            if let Some(thread) = spare {
                thread.request_terminate(self.services.sched.as_ref());
            }
            return Err(e);
        }

        let pos = inner
            .handlers
            .iter()
            .position(|h| h.priority > priority)
            .unwrap_or(inner.handlers.len());
        inner.handlers.insert(pos, record.clone());
        self.handlers_changed(&mut inner);

        Ok(HandlerHandle { record })
    }

    fn check_exclusive(
        &self,
        inner: &MutexGuard<'_, EventInner>,
        flags: HandlerFlags,
    ) -> IntrResult<()> {
        if flags.contains(HandlerFlags::EXCLUSIVE) && !inner.handlers.is_empty() {
            return Err(IntrError::new(
                ErrorKind::InvalidArgument,
                "exclusive handler cannot share an event",
            ));
        }
        if inner
            .handlers
            .iter()
            .any(|h| h.flags.contains(HandlerFlags::EXCLUSIVE))
        {
            return Err(IntrError::new(
                ErrorKind::InvalidArgument,
                "event is owned by an exclusive handler",
            ));
        }
        Ok(())
    }

    /// Create the shared worker thread if none exists yet. The
    /// `THREAD_SPAWNING` flag plus a wait/retry loop guarantees exactly one
    /// thread is created when registrations race.
    fn ensure_shared_thread(self: &Arc<Self>, priority: Priority) {
        loop {
            let mut inner = self.inner.lock();
            if inner.thread.is_some() {
                return;
            }
            if inner.flags.contains(EventFlags::THREAD_SPAWNING) {
                drop(inner);
                self.services.sched.yield_now();
                continue;
            }
            inner.flags.insert(EventFlags::THREAD_SPAWNING);
            drop(inner);

            let wname = format!("intr: {}", self.name);
            let thread = IntrThread::spawn(self, ThreadOwner::Shared, &wname, priority);

            let mut inner = self.inner.lock();
            inner.thread = Some(thread);
            inner.flags.remove(EventFlags::THREAD_SPAWNING);
            return;
        }
    }

    // -------------------------------------------------------------------
    // Handler removal
    // -------------------------------------------------------------------

    /// Unregister `record`, blocking until it is provably unreachable.
    ///
    /// Three paths, in decreasing order of directness:
    /// - the servicing thread is parked or the record has no threaded body:
    ///   unlink under the event lock (nothing can be iterating a snapshot
    ///   that still invokes the record);
    /// - the caller *is* the servicing thread (self-removal): mark dead and
    ///   return, the thread unlinks the record before parking;
    /// - otherwise: mark dead, wake the thread, and block on the record's
    ///   completion until the thread performs the unlink.
    pub(crate) fn remove_handler(&self, record: &Arc<HandlerRecord>) -> IntrResult<()> {
        let sched = self.services.sched.as_ref();
        let mut inner = self.inner.lock();

        if !inner.handlers.iter().any(|h| Arc::ptr_eq(h, record)) {
            return Err(IntrError::new(
                ErrorKind::NotFound,
                "handler already removed",
            ));
        }

        let thread = match self.config.thread_policy {
            ThreadPolicy::Shared => inner.thread.clone(),
            ThreadPolicy::PerHandler => record.thread.get().cloned(),
        };

        let thread = match thread {
            // No thread was ever created for this handler, or the record
            // carries no threaded body: the only invoker is the filter loop,
            // which runs under the lock we hold.
            Some(t) if record.body.threaded().is_some() => t,
            _ => {
                self.unlink_locked(&mut inner, record);
                drop(inner);
                record.removal.signal();
                return Ok(());
            },
        };

        if sched.is_parked(thread.task()) {
            // Parked threads hold no handler snapshot.
            self.unlink_locked(&mut inner, record);
            drop(inner);
            record.removal.signal();
            self.reap_thread(&thread);
            return Ok(());
        }

        if sched.current_task() == Some(thread.task()) {
            // Self-removal from within the handler's own execution: the
            // drain pass unlinks dead records before the thread parks.
            record.mark_dead();
            thread.set_need();
            return Ok(());
        }

        record.mark_dead();
        thread.set_need();
        sched.wake(thread.task());
        drop(inner);

        record.removal.wait(sched);
        self.reap_thread(&thread);
        Ok(())
    }

    /// After a per-handler record is gone, its dedicated thread goes too.
    fn reap_thread(&self, thread: &Arc<IntrThread>) {
        if matches!(thread.owner, ThreadOwner::PerHandler(_)) {
            thread.request_terminate(self.services.sched.as_ref());
        }
    }

    /// Remove `record` from the list and refresh derived state. Caller holds
    /// the event lock and has established that nothing can invoke the record.
    pub(crate) fn unlink_locked(
        &self,
        inner: &mut MutexGuard<'_, EventInner>,
        record: &Arc<HandlerRecord>,
    ) {
        inner.handlers.retain(|h| !Arc::ptr_eq(h, record));
        self.handlers_changed(inner);
    }

    // -------------------------------------------------------------------
    // Derived state
    // -------------------------------------------------------------------

    /// Recompute everything that depends on the handler collection: the
    /// cached display name, the aggregate entropy flag, and the shared
    /// thread's priority.
    pub(crate) fn handlers_changed(&self, inner: &mut MutexGuard<'_, EventInner>) {
        self.update_fullname(inner);

        let has_entropy = inner
            .handlers
            .iter()
            .any(|h| h.flags.contains(HandlerFlags::ENTROPY));
        inner.flags.set(EventFlags::HAS_ENTROPY, has_entropy);

        if let Some(thread) = inner.thread.clone() {
            let pri = inner
                .handlers
                .iter()
                .filter(|h| h.body.threaded().is_some())
                .map(|h| h.priority)
                .min()
                .unwrap_or(self.base_pri);
            self.services.sched.set_priority(thread.task(), pri);
        }
    }

    fn update_fullname(&self, inner: &mut MutexGuard<'_, EventInner>) {
        let mut full: ArrayString<EVENT_FULLNAME_MAX> = ArrayString::new();
        let _ = full.try_push_str(self.name.as_str());

        let mut missed = false;
        for handler in &inner.handlers {
            let hname = handler.name.lock();
            if full.len() + 1 + hname.len() <= full.capacity() {
                let _ = full.try_push(' ');
                let _ = full.try_push_str(hname.as_str());
            } else {
                missed = true;
            }
        }
        if missed {
            if full.try_push('+').is_err() {
                full.pop();
                let _ = full.try_push('+');
            }
        }
        inner.fullname = full;
    }

    /// Refresh the display name after a handler description changed.
    pub(crate) fn refresh_fullname(&self) {
        let mut inner = self.inner.lock();
        self.update_fullname(&mut inner);
    }

    // -------------------------------------------------------------------
    // CPU affinity
    // -------------------------------------------------------------------

    /// Bind the event (and any live worker threads) to `cpu`, or unbind with
    /// `None`. The recorded affinity rolls back if the driver-level callback
    /// rejects the assignment.
    pub fn bind(&self, cpu: Option<CpuId>) -> IntrResult<()> {
        let source = self.source.clone().ok_or(IntrError::new(
            ErrorKind::Unsupported,
            "event has no CPU assignment callback",
        ))?;
        if !self.services.privilege.can_bind_interrupts() {
            return Err(IntrError::new(
                ErrorKind::PermissionDenied,
                "caller may not rebind interrupts",
            ));
        }
        if let Some(c) = cpu {
            if !self.services.sched.cpu_active(c) {
                return Err(IntrError::new(
                    ErrorKind::InvalidArgument,
                    "cpu is absent or inactive",
                ));
            }
        }

        let (old, threads) = {
            let mut inner = self.inner.lock();
            let old = inner.cpu;
            inner.cpu = cpu;
            (old, self.threads_locked(&inner))
        };

        // Migrate live threads first, then ask the driver.
        for thread in &threads {
            self.services.sched.set_affinity(thread.task(), cpu);
        }
        match source.assign_cpu(cpu) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.inner.lock().cpu = old;
                for thread in &threads {
                    self.services.sched.set_affinity(thread.task(), old);
                }
                Err(e)
            },
        }
    }

    pub(crate) fn threads_locked(
        &self,
        inner: &MutexGuard<'_, EventInner>,
    ) -> Vec<Arc<IntrThread>> {
        match self.config.thread_policy {
            ThreadPolicy::Shared => inner.thread.iter().cloned().collect(),
            ThreadPolicy::PerHandler => inner
                .handlers
                .iter()
                .filter_map(|h| h.thread.get().cloned())
                .collect(),
        }
    }

    // -------------------------------------------------------------------
    // Destruction
    // -------------------------------------------------------------------

    /// Tear the event down: fails with `Busy` while handlers remain,
    /// otherwise terminates any owned worker threads. Threads drain once
    /// more and free themselves.
    pub(crate) fn shutdown(&self) -> IntrResult<()> {
        let threads = {
            let mut inner = self.inner.lock();
            if !inner.handlers.is_empty() {
                return Err(IntrError::new(
                    ErrorKind::Busy,
                    "event still has registered handlers",
                ));
            }
            // Take the owned slot first so `threads_locked` cannot report
            // the same thread again.
            let own = inner.thread.take();
            let threads = self.threads_locked(&inner);
            drop(inner);
            threads.into_iter().chain(own).collect::<Vec<_>>()
        };
        for thread in threads {
            thread.request_terminate(self.services.sched.as_ref());
        }
        Ok(())
    }
}

//! # Interrupt Threads
//!
//! A worker task that executes deferred threaded handler work. The loop is
//! park-driven: a dispatch (or software schedule) sets the thread's `need`
//! flag and wakes it; the thread drains the handler chain until `need` stays
//! clear, reaps dead handlers, then parks again.
//!
//! Termination is cooperative: [`IntrThread::request_terminate`] sets a flag
//! and wakes the thread, which performs one final drain, detaches itself from
//! the event, and returns from its body. The thread's state frees itself when
//! the last `Arc` drops; nothing ever frees a live thread from outside.

use core::sync::atomic::{AtomicBool, Ordering};

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use spin::Once;

use crate::event::InterruptEvent;
use crate::handler::{HandlerFlags, HandlerRecord};
use crate::sched::{Priority, Scheduler, Services, TaskId, ThreadBody};
use crate::storm::StormAction;

/// Serializes threaded handlers that did not declare themselves MPSAFE.
/// One global lock, matching the semantics legacy drivers were written for.
static LEGACY_LOCK: spin::Mutex<()> = spin::Mutex::new(());

/// Which handlers a thread services.
pub(crate) enum ThreadOwner {
    /// All threaded handlers of the event.
    Shared,
    /// Exactly one record; the thread dies with it.
    PerHandler(Weak<HandlerRecord>),
}

/// Control block of one interrupt worker thread.
pub struct IntrThread {
    /// Filled in by [`spawn`](Self::spawn) right after worker creation; the
    /// body waits on it before first use.
    task: Once<TaskId>,
    /// Work is pending. Set by dispatch/schedule, consumed by the loop.
    need: AtomicBool,
    terminate: AtomicBool,
    pub(crate) owner: ThreadOwner,
}

impl IntrThread {
    pub(crate) fn spawn(
        event: &Arc<InterruptEvent>,
        owner: ThreadOwner,
        name: &str,
        priority: Priority,
    ) -> Arc<Self> {
        let thread = Arc::new(Self {
            task: Once::new(),
            need: AtomicBool::new(false),
            terminate: AtomicBool::new(false),
            owner,
        });
        let body = Arc::new(IthreadBody {
            event: Arc::downgrade(event),
            services: event.services().clone(),
            thread: thread.clone(),
        });
        let task = event
            .services()
            .sched
            .create_worker(name, priority, body);
        thread.task.call_once(|| task);
        thread
    }

    /// Scheduler identity. Blocks (spins) in the short window between worker
    /// creation and registration if the worker body races us here.
    pub(crate) fn task(&self) -> TaskId {
        *self.task.wait()
    }

    pub(crate) fn set_need(&self) {
        self.need.store(true, Ordering::Release);
    }

    fn take_need(&self) -> bool {
        self.need.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn pending(&self) -> bool {
        self.need.load(Ordering::Acquire)
    }

    /// Mark work pending and wake the worker.
    pub(crate) fn poke(&self, sched: &dyn Scheduler) {
        self.set_need();
        sched.wake(self.task());
    }

    fn should_terminate(&self) -> bool {
        self.terminate.load(Ordering::Acquire)
    }

    pub(crate) fn request_terminate(&self, sched: &dyn Scheduler) {
        self.terminate.store(true, Ordering::Release);
        sched.wake(self.task());
    }
}

/// The body handed to the scheduler. Holds the event weakly so a thread
/// never keeps its event alive on its own.
pub(crate) struct IthreadBody {
    event: Weak<InterruptEvent>,
    services: Services,
    thread: Arc<IntrThread>,
}

impl ThreadBody for IthreadBody {
    fn run(&self) {
        let sched = self.services.sched.as_ref();
        loop {
            let Some(event) = self.event.upgrade() else {
                return;
            };

            if self.thread.should_terminate() {
                self.drain(&event);
                self.detach(&event);
                return;
            }

            while self.thread.take_need() {
                self.drain(&event);
                self.storm_pass(&event);
                if self.thread.should_terminate() {
                    break;
                }
            }

            // Reaping the thread's own record self-sets terminate without a
            // wake permit; parking here would strand the thread forever.
            if self.thread.should_terminate() {
                continue;
            }

            self.note_idle(&event);
            drop(event);
            sched.park_current();
        }
    }
}

impl IthreadBody {
    /// One drain pass: reap dead records, snapshot the survivors this thread
    /// owns, then execute them with no event lock held.
    fn drain(&self, event: &Arc<InterruptEvent>) {
        let snapshot = self.reap_and_snapshot(event);

        for record in &snapshot {
            // Marked dead after the snapshot was taken: never invoke it; the
            // remover set `need`, so the next pass reaps it.
            if record.is_dead() {
                continue;
            }
            let Some(threaded) = record.body.threaded() else {
                continue;
            };
            // Software handlers only run when individually scheduled.
            if event.is_software() && !record.take_needs_run() {
                continue;
            }
            if record.flags.contains(HandlerFlags::MPSAFE) {
                threaded.run();
            } else {
                let _serial = LEGACY_LOCK.lock();
                threaded.run();
            }
        }
    }

    /// Unlink dead records this thread owns and signal their removers, then
    /// snapshot the records to execute. Dead records are unlinked *before*
    /// the snapshot, so a record marked dead is never invoked again.
    fn reap_and_snapshot(&self, event: &Arc<InterruptEvent>) -> Vec<Arc<HandlerRecord>> {
        let mut inner = event.inner.lock();

        let dead: Vec<Arc<HandlerRecord>> = match &self.thread.owner {
            ThreadOwner::Shared => inner
                .handlers
                .iter()
                .filter(|h| h.is_dead())
                .cloned()
                .collect(),
            ThreadOwner::PerHandler(own) => match own.upgrade() {
                Some(rec) if rec.is_dead() => alloc::vec![rec],
                _ => Vec::new(),
            },
        };
        for record in &dead {
            event.unlink_locked(&mut inner, record);
        }

        let snapshot = match &self.thread.owner {
            ThreadOwner::Shared => inner.handlers.clone(),
            ThreadOwner::PerHandler(own) => match own.upgrade() {
                Some(rec) if inner.handlers.iter().any(|h| Arc::ptr_eq(h, &rec)) => {
                    alloc::vec![rec]
                },
                // The owned record is gone; this thread has nothing left.
                _ => {
                    self.thread.terminate.store(true, Ordering::Release);
                    Vec::new()
                },
            },
        };
        drop(inner);

        for record in dead {
            record.removal.signal();
        }
        snapshot
    }

    /// Per-pass storm accounting for hardware events, then source re-arm.
    fn storm_pass(&self, event: &Arc<InterruptEvent>) {
        if !event.is_software() {
            let threshold = event.config.storm_threshold();
            let action = {
                let now = self.services.clock.now_ticks();
                let tps = self.services.clock.ticks_per_second();
                event.inner.lock().storm.note_pass(threshold, now, tps)
            };
            if let StormAction::Throttle { warn } = action {
                if warn {
                    log::warn!(
                        "interrupt storm detected on \"{}\"; throttling interrupt source",
                        event.fullname()
                    );
                }
                self.services.sched.sleep_ticks(1);
            }
            if let Some(source) = event.source() {
                source.post_ithread();
            }
        }
    }

    /// About to park: reap any stragglers and end the storm window.
    fn note_idle(&self, event: &Arc<InterruptEvent>) {
        let dead = {
            let mut inner = event.inner.lock();
            let dead: Vec<Arc<HandlerRecord>> = match &self.thread.owner {
                ThreadOwner::Shared => inner
                    .handlers
                    .iter()
                    .filter(|h| h.is_dead())
                    .cloned()
                    .collect(),
                ThreadOwner::PerHandler(own) => match own.upgrade() {
                    Some(rec) if rec.is_dead() => alloc::vec![rec],
                    _ => Vec::new(),
                },
            };
            for record in &dead {
                event.unlink_locked(&mut inner, record);
            }
            inner.storm.reset();
            dead
        };
        for record in dead {
            record.removal.signal();
        }
    }

    /// A terminating shared thread clears the event's thread slot if it
    /// still points at it.
    fn detach(&self, event: &Arc<InterruptEvent>) {
        if matches!(self.thread.owner, ThreadOwner::Shared) {
            let mut inner = event.inner.lock();
            if let Some(current) = &inner.thread {
                if Arc::ptr_eq(current, &self.thread) {
                    inner.thread = None;
                }
            }
        }
    }
}

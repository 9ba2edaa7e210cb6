//! Host-side fakes for exercising the dispatcher under `cargo test`.
//!
//! [`HostScheduler`] backs worker tasks with real `std::thread`s so the
//! park/wake/removal protocols run against genuine concurrency;
//! [`NoopScheduler`] hands out task ids without running anything, for tests
//! that only poke at registration state.

use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use core::time::Duration;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use std::collections::HashMap;
use std::sync::{Barrier, Mutex as StdMutex};
use std::thread;

use crate::error::IntrResult;
use crate::event::IntrSource;
use crate::sched::{
    Clock, CpuId, EntropySink, Priority, Scheduler, Services, TaskId, ThreadBody,
    UnrestrictedPrivilege,
};

std::thread_local! {
    static CURRENT: core::cell::Cell<Option<u64>> = const { core::cell::Cell::new(None) };
}

struct WorkerSlot {
    thread: thread::Thread,
    /// True only while the worker is blocked inside `park_current`. Set
    /// after the worker has dropped every handler snapshot, so observing
    /// `true` means the worker holds no snapshot.
    parked: Arc<AtomicBool>,
    affinity: Option<CpuId>,
    priority: Priority,
}

/// Scheduler fake backed by `std::thread`. Park/unpark permits come straight
/// from the standard library, which implements exactly the wake-before-park
/// contract the dispatcher requires.
pub(crate) struct HostScheduler {
    slots: StdMutex<HashMap<u64, WorkerSlot>>,
    handles: StdMutex<Vec<thread::JoinHandle<()>>>,
    next_id: AtomicU64,
}

impl HostScheduler {
    pub(crate) fn new() -> Self {
        Self {
            slots: StdMutex::new(HashMap::new()),
            handles: StdMutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Join every worker spawned so far. Call after terminating them.
    pub(crate) fn join_all(&self) {
        let handles: Vec<_> = {
            let mut guard = self.handles.lock().unwrap();
            guard.drain(..).collect()
        };
        for handle in handles {
            handle.join().unwrap();
        }
    }

    pub(crate) fn worker_count(&self) -> usize {
        self.slots.lock().unwrap().len()
    }

    pub(crate) fn affinity_of(&self, task: TaskId) -> Option<CpuId> {
        self.slots.lock().unwrap().get(&task.0).and_then(|s| s.affinity)
    }

    pub(crate) fn priority_of(&self, task: TaskId) -> Option<Priority> {
        self.slots.lock().unwrap().get(&task.0).map(|s| s.priority)
    }

    fn with_current_slot<R>(&self, f: impl FnOnce(&WorkerSlot) -> R) -> Option<R> {
        let id = CURRENT.with(|c| c.get())?;
        let slots = self.slots.lock().unwrap();
        slots.get(&id).map(f)
    }
}

impl Scheduler for HostScheduler {
    fn create_worker(&self, name: &str, priority: Priority, body: Arc<dyn ThreadBody>) -> TaskId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let parked = Arc::new(AtomicBool::new(false));
        // The worker must not touch dispatcher state before its slot is
        // visible to wake/is_parked.
        let gate = Arc::new(Barrier::new(2));

        let worker_gate = gate.clone();
        let handle = thread::Builder::new()
            .name(String::from(name))
            .spawn(move || {
                CURRENT.with(|c| c.set(Some(id)));
                worker_gate.wait();
                body.run();
            })
            .unwrap();

        self.slots.lock().unwrap().insert(
            id,
            WorkerSlot {
                thread: handle.thread().clone(),
                parked,
                affinity: None,
                priority,
            },
        );
        self.handles.lock().unwrap().push(handle);
        gate.wait();
        TaskId(id)
    }

    fn wake(&self, task: TaskId) {
        let slots = self.slots.lock().unwrap();
        if let Some(slot) = slots.get(&task.0) {
            slot.thread.unpark();
        }
    }

    fn set_priority(&self, task: TaskId, priority: Priority) {
        let mut slots = self.slots.lock().unwrap();
        if let Some(slot) = slots.get_mut(&task.0) {
            slot.priority = priority;
        }
    }

    fn park_current(&self) {
        let parked = self.with_current_slot(|slot| slot.parked.clone());
        match parked {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                thread::park();
                flag.store(false, Ordering::SeqCst);
            },
            // Not one of ours (a bare test thread); never parks.
            None => thread::yield_now(),
        }
    }

    fn is_parked(&self, task: TaskId) -> bool {
        let slots = self.slots.lock().unwrap();
        slots
            .get(&task.0)
            .is_some_and(|slot| slot.parked.load(Ordering::SeqCst))
    }

    fn current_task(&self) -> Option<TaskId> {
        CURRENT.with(|c| c.get()).map(TaskId)
    }

    fn yield_now(&self) {
        thread::yield_now();
        thread::sleep(Duration::from_micros(50));
    }

    fn sleep_ticks(&self, ticks: u64) {
        thread::sleep(Duration::from_millis(ticks));
    }

    fn cpu_active(&self, cpu: CpuId) -> bool {
        cpu.0 < 8
    }

    fn set_affinity(&self, task: TaskId, cpu: Option<CpuId>) -> bool {
        let mut slots = self.slots.lock().unwrap();
        match slots.get_mut(&task.0) {
            Some(slot) => {
                slot.affinity = cpu;
                true
            },
            None => false,
        }
    }
}

/// Scheduler fake that creates no threads at all. Worker bodies never run;
/// tests inspect the latched state directly.
pub(crate) struct NoopScheduler {
    next_id: AtomicU64,
    pub(crate) wakes: AtomicUsize,
}

impl NoopScheduler {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            wakes: AtomicUsize::new(0),
        }
    }
}

impl Scheduler for NoopScheduler {
    fn create_worker(&self, _name: &str, _priority: Priority, _body: Arc<dyn ThreadBody>) -> TaskId {
        TaskId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn wake(&self, _task: TaskId) {
        self.wakes.fetch_add(1, Ordering::SeqCst);
    }

    fn set_priority(&self, _task: TaskId, _priority: Priority) {}

    fn park_current(&self) {}

    fn is_parked(&self, _task: TaskId) -> bool {
        false
    }

    fn current_task(&self) -> Option<TaskId> {
        None
    }

    fn yield_now(&self) {}

    fn sleep_ticks(&self, _ticks: u64) {}

    fn cpu_active(&self, cpu: CpuId) -> bool {
        cpu.0 < 4
    }

    fn set_affinity(&self, _task: TaskId, _cpu: Option<CpuId>) -> bool {
        true
    }
}

/// Manually advanced clock, 100 ticks per second.
pub(crate) struct MockClock {
    ticks: AtomicU64,
}

impl MockClock {
    pub(crate) fn new() -> Self {
        Self {
            ticks: AtomicU64::new(0),
        }
    }

    pub(crate) fn advance(&self, ticks: u64) {
        self.ticks.fetch_add(ticks, Ordering::SeqCst);
    }
}

impl Clock for MockClock {
    fn now_ticks(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }

    fn ticks_per_second(&self) -> u64 {
        100
    }
}

/// An [`IntrSource`] that counts its callbacks and optionally rejects CPU
/// assignment.
pub(crate) struct RecordingSource {
    pub(crate) pre_ithread: AtomicUsize,
    pub(crate) post_ithread: AtomicUsize,
    pub(crate) post_filter: AtomicUsize,
    pub(crate) fail_assign: AtomicBool,
    pub(crate) assigned: StdMutex<Option<Option<CpuId>>>,
}

impl RecordingSource {
    pub(crate) fn new() -> Self {
        Self {
            pre_ithread: AtomicUsize::new(0),
            post_ithread: AtomicUsize::new(0),
            post_filter: AtomicUsize::new(0),
            fail_assign: AtomicBool::new(false),
            assigned: StdMutex::new(None),
        }
    }
}

impl IntrSource for RecordingSource {
    fn pre_ithread(&self) {
        self.pre_ithread.fetch_add(1, Ordering::SeqCst);
    }

    fn post_ithread(&self) {
        self.post_ithread.fetch_add(1, Ordering::SeqCst);
    }

    fn post_filter(&self) {
        self.post_filter.fetch_add(1, Ordering::SeqCst);
    }

    fn assign_cpu(&self, cpu: Option<CpuId>) -> IntrResult<()> {
        if self.fail_assign.load(Ordering::SeqCst) {
            return Err(crate::IntrError::new(
                crate::ErrorKind::InvalidArgument,
                "controller refused the assignment",
            ));
        }
        *self.assigned.lock().unwrap() = Some(cpu);
        Ok(())
    }
}

/// Entropy sink that remembers what it was fed.
pub(crate) struct CountingEntropy {
    pub(crate) samples: AtomicUsize,
    pub(crate) last_irq: StdMutex<Option<Option<u32>>>,
}

impl CountingEntropy {
    pub(crate) fn new() -> Self {
        Self {
            samples: AtomicUsize::new(0),
            last_irq: StdMutex::new(None),
        }
    }
}

impl EntropySink for CountingEntropy {
    fn harvest(&self, irq: Option<u32>, _timestamp: u64) {
        self.samples.fetch_add(1, Ordering::SeqCst);
        *self.last_irq.lock().unwrap() = Some(irq);
    }
}

/// Services built around any scheduler, with a fresh clock, no entropy sink,
/// and unrestricted privilege.
pub(crate) fn noop_services(sched: Arc<dyn Scheduler>) -> Services {
    Services {
        sched,
        clock: Arc::new(MockClock::new()),
        entropy: None,
        privilege: Arc::new(UnrestrictedPrivilege),
    }
}

/// Poll `cond` for up to `timeout_ms`, reporting whether it became true.
pub(crate) fn wait_until(timeout_ms: u64, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + Duration::from_millis(timeout_ms);
    while std::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    cond()
}

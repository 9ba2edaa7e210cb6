//! # Host-Service Contracts
//!
//! The dispatcher runs inside a host kernel that owns scheduling, time, and
//! policy. Everything it needs from that host is expressed as a small set of
//! traits collected into a [`Services`] value injected at registry
//! construction. The dispatcher never reaches into scheduler internals.

use alloc::sync::Arc;

/// Identity of a scheduler-visible task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub u64);

/// Scheduling priority. Lower values run first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Priority(pub u8);

/// Default priority for hardware interrupt threads.
pub const DEFAULT_INTR_PRIORITY: Priority = Priority(8);

/// Identity of a processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CpuId(pub u32);

/// Entry point of a worker task created through [`Scheduler::create_worker`].
///
/// Returning from `run` is the worker's exit; the scheduler reaps the task
/// afterwards. An interrupt thread frees its own state by returning.
pub trait ThreadBody: Send + Sync {
    fn run(&self);
}

/// The scheduling capability the dispatcher requires from the host.
///
/// ## Wake/park contract
///
/// [`wake`](Scheduler::wake) grants the target task a park permit:
/// a `wake` delivered while the task is not parked must cause the task's next
/// [`park_current`](Scheduler::park_current) to return immediately. Without
/// this, a wake raced against the thread's park would be lost.
///
/// [`is_parked`](Scheduler::is_parked) must report `true` only while the task
/// is blocked inside `park_current`. The dispatcher uses it to decide whether
/// a handler list can be mutated directly (the thread cannot be iterating it)
/// or whether the deferred dead-handler protocol is required.
pub trait Scheduler: Send + Sync {
    /// Create a worker task that will execute `body.run()` once scheduled.
    fn create_worker(&self, name: &str, priority: Priority, body: Arc<dyn ThreadBody>) -> TaskId;

    /// Wake a task, or enqueue it if it is runnable but descheduled.
    fn wake(&self, task: TaskId);

    /// Adjust a task's scheduling priority.
    fn set_priority(&self, task: TaskId, priority: Priority);

    /// Block the calling task until woken. Consumes a pending park permit.
    fn park_current(&self);

    /// Whether the task is currently blocked in [`park_current`](Self::park_current).
    fn is_parked(&self, task: TaskId) -> bool;

    /// Identity of the calling task, if it was created by this scheduler.
    fn current_task(&self) -> Option<TaskId>;

    /// Yield the processor without blocking.
    fn yield_now(&self);

    /// Block the calling task for roughly `ticks` scheduler ticks.
    fn sleep_ticks(&self, ticks: u64);

    /// Whether `cpu` names a present, active processor.
    fn cpu_active(&self, cpu: CpuId) -> bool;

    /// Migrate a task's affinity. `None` unbinds. Returns `false` on refusal.
    fn set_affinity(&self, task: TaskId, cpu: Option<CpuId>) -> bool;
}

/// Monotonic time, in scheduler ticks.
pub trait Clock: Send + Sync {
    fn now_ticks(&self) -> u64;

    fn ticks_per_second(&self) -> u64;
}

/// Sink for raw interrupt timing/identity samples.
///
/// The dispatcher only forwards `(irq, timestamp)` pairs for events flagged
/// as entropy sources; all whitening and accounting lives in the host.
pub trait EntropySink: Send + Sync {
    fn harvest(&self, irq: Option<u32>, timestamp: u64);
}

/// Privilege gate for operations that mutate interrupt affinity.
pub trait PrivilegeCheck: Send + Sync {
    fn can_bind_interrupts(&self) -> bool;
}

/// A [`PrivilegeCheck`] that grants everything. Suitable for single-domain
/// kernels without a privilege model.
pub struct UnrestrictedPrivilege;

impl PrivilegeCheck for UnrestrictedPrivilege {
    fn can_bind_interrupts(&self) -> bool {
        true
    }
}

/// Aggregate of all host services consumed by the dispatcher.
///
/// Cloned into every event at creation so the dispatch and thread paths
/// never consult global state.
#[derive(Clone)]
pub struct Services {
    pub sched: Arc<dyn Scheduler>,
    pub clock: Arc<dyn Clock>,
    pub entropy: Option<Arc<dyn EntropySink>>,
    pub privilege: Arc<dyn PrivilegeCheck>,
}

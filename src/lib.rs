//! Priority-aware work-stealing scheduler with structured asynchronous
//! tasks.
//!
//! Three tightly coupled layers: a scheduler multiplexing intrusive
//! [`Schedulable`] units over a fixed worker pool (with priority-sorted
//! batches, locality-biased stealing, and a fuzzing mode for test-time
//! interleaving discovery); an async task model ([`AsyncTask`],
//! [`WaitHandle`], composite waits, [`ResourceLimiter`]) whose suspension
//! and resumption the scheduler drives; and a thread-local linear allocator
//! backing short-lived task frames.
//!
//! The scheduler is one process-wide pool, booted lazily on first use or
//! explicitly through [`Scheduler::start`].

pub mod awaitables;
pub mod docket;
pub mod linear;
pub mod parallel_for;
pub mod schedulable;
pub mod scheduler;
pub mod sort;
pub mod stack;
pub mod task;
pub mod utils;

pub use awaitables::{
    yield_now, AwaitAll, AwaitAny, ResourceLimitGuard, ResourceLimiter, ResourceRequest, YieldNow,
};
pub use docket::{Docket, RANDOM_INDEX};
pub use linear::LinearAllocator;
pub use parallel_for::parallel_for;
pub use schedulable::{Schedulable, SchedulableVTable, MAX_PRIORITY, MIN_PRIORITY};
pub use scheduler::{Scheduler, SchedulerConfig, StartError, WORKER_THREAD_FLOOR};
pub use task::{AsyncTask, AsyncTaskDesc, SchedulingFlags, WaitHandle};

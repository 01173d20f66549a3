//! Pool shutdown. Lives alone in this binary: `Scheduler::exit` is one-shot
//! per process.

use std::collections::HashSet;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use weft::{Schedulable, SchedulableVTable, Scheduler};

#[repr(C)]
struct TrackedJob {
    sched: Schedulable,
    executions: Arc<AtomicU32>,
    workers: Arc<Mutex<HashSet<ThreadId>>>,
}

unsafe fn tracked_is_ready(_: NonNull<Schedulable>) -> bool {
    true
}

unsafe fn tracked_execute(this: NonNull<Schedulable>) -> *mut Schedulable {
    let job = this.cast::<TrackedJob>();
    unsafe {
        let job = job.as_ref();
        job.workers
            .lock()
            .unwrap()
            .insert(std::thread::current().id());
        job.executions.fetch_add(1, Ordering::Relaxed);
    }
    ptr::null_mut()
}

static TRACKED_VTABLE: SchedulableVTable = SchedulableVTable {
    is_ready: tracked_is_ready,
    execute: tracked_execute,
};

#[test]
fn exit_joins_workers_after_the_batch_drains() {
    let executions = Arc::new(AtomicU32::new(0));
    let workers = Arc::new(Mutex::new(HashSet::new()));
    let count = Scheduler::worker_count() + 1;

    // W+1 equal-priority jobs fanned out over W workers.
    let mut head: *mut Schedulable = ptr::null_mut();
    for _ in 0..count {
        let job = Box::leak(Box::new(TrackedJob {
            sched: Schedulable::new(0, &TRACKED_VTABLE),
            executions: Arc::clone(&executions),
            workers: Arc::clone(&workers),
        }));
        job.sched.next.set(head);
        head = NonNull::from(&mut job.sched).as_ptr();
    }
    unsafe { Scheduler::schedule_evenly(NonNull::new(head).unwrap()) };

    let start = Instant::now();
    while executions.load(Ordering::Relaxed) < count {
        assert!(
            start.elapsed() < Duration::from_secs(10),
            "batch did not drain"
        );
        std::thread::yield_now();
    }

    // Cooperative stop: workers leave their loop and join.
    Scheduler::exit();

    assert_eq!(executions.load(Ordering::Relaxed), count);
    let distinct = workers.lock().unwrap().len();
    assert!(distinct >= 2, "expected a fan-out, got {distinct} worker(s)");
}

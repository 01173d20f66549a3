//! Deterministic dispatch-order behavior on a single-worker pool.
//!
//! Runs in its own process so it can boot the pool explicitly with one
//! worker: with nobody to steal, batch extraction and requeueing follow a
//! fixed schedule.

use std::ptr::{self, NonNull};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use weft::{Schedulable, SchedulableVTable, Scheduler, SchedulerConfig, StartError};

#[repr(C)]
struct OrderedJob {
    sched: Schedulable,
    id: u32,
    log: Arc<Mutex<Vec<u32>>>,
}

unsafe fn ordered_is_ready(_: NonNull<Schedulable>) -> bool {
    true
}

unsafe fn ordered_execute(this: NonNull<Schedulable>) -> *mut Schedulable {
    let job = this.cast::<OrderedJob>();
    unsafe {
        let job = job.as_ref();
        job.log.lock().unwrap().push(job.id);
    }
    ptr::null_mut()
}

static ORDERED_VTABLE: SchedulableVTable = SchedulableVTable {
    is_ready: ordered_is_ready,
    execute: ordered_execute,
};

#[test]
fn single_worker_executes_sorted_windows() {
    Scheduler::start(SchedulerConfig::new().with_worker_count(1))
        .expect("first start must win");
    assert_eq!(Scheduler::worker_count(), 1);
    assert!(matches!(
        Scheduler::start(SchedulerConfig::new()),
        Err(StartError::AlreadyRunning)
    ));

    let log = Arc::new(Mutex::new(Vec::new()));

    // Chain of six jobs with priorities 0..=5 in arrival order.
    let jobs: Vec<_> = (0..6u32)
        .map(|id| {
            NonNull::from(Box::leak(Box::new(OrderedJob {
                sched: Schedulable::new(id as i32, &ORDERED_VTABLE),
                id,
                log: Arc::clone(&log),
            })))
        })
        .collect();
    for pair in jobs.windows(2) {
        unsafe {
            pair[0]
                .as_ref()
                .sched
                .next
                .set(pair[1].cast::<Schedulable>().as_ptr())
        };
    }
    unsafe { Scheduler::schedule_randomly(jobs[0].cast()) };

    let start = Instant::now();
    while log.lock().unwrap().len() < 6 {
        assert!(start.elapsed() < Duration::from_secs(10), "jobs did not drain");
        std::thread::yield_now();
    }

    // The worker samples half the chain into its window and sorts it by
    // descending priority, then picks up the requeued remainder the same
    // way: [0,1,2] -> 2,1,0; [3,4,5] -> 4,3; [5] -> 5.
    assert_eq!(*log.lock().unwrap(), vec![2, 1, 0, 4, 3, 5]);
}

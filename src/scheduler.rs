//! Process-wide scheduler: worker pool, dispatch loop, scheduling policies.
//!
//! The scheduler is one lazily-initialized instance per process. Work routes
//! through two dockets of equal width — `ready` for schedulables whose next
//! step can run now, `blocked` for those waiting on a dependency — and every
//! worker drains batches from its own stack, stealing from neighbors only
//! after coming up empty twice in a row.

use std::cell::Cell;
use std::hint;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::OnceLock;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use thiserror::Error;

use crate::docket::{Docket, RANDOM_INDEX};
use crate::schedulable::Schedulable;
use crate::sort::sort6;
use crate::stack::last_node;
use crate::utils::random::pcg32;

/// The pool never runs with fewer worker threads than this.
pub const WORKER_THREAD_FLOOR: u32 = 4;

/// Width of the per-worker sorted execution window.
const SORT_WINDOW: usize = 6;

/// Empty loops a worker tolerates before it starts stealing.
const STEAL_PATIENCE: u32 = 2;

/// Empty loops before the worker yields its timeslice to the OS.
const YIELD_THRESHOLD: u32 = 9;

/// Spin-burst lengths for idle backoff; prime so neighboring workers drift
/// out of phase.
const IDLE_SPIN_PRIMES: [u32; 4] = [53, 97, 193, 389];

/// Pool configuration consumed by [`Scheduler::start`].
#[derive(Debug, Clone, Default)]
pub struct SchedulerConfig {
    worker_count: Option<u32>,
    fuzzing: bool,
}

impl SchedulerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the worker count (default `max(4, num_cpus)`).
    pub fn with_worker_count(mut self, count: u32) -> Self {
        self.worker_count = Some(count.max(1));
        self
    }

    /// Starts the pool with fuzzing mode already enabled.
    pub fn with_fuzzing(mut self, enabled: bool) -> Self {
        self.fuzzing = enabled;
        self
    }
}

#[derive(Debug, Error)]
pub enum StartError {
    /// [`Scheduler::start`] was called after the pool had already been
    /// initialized, explicitly or lazily.
    #[error("scheduler pool is already running")]
    AlreadyRunning,
}

struct SchedulerCore {
    ready: Docket,
    blocked: Docket,
    disable_work_stealing: AtomicU32,
    done: AtomicBool,
    fuzzing: AtomicBool,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

static CORE: OnceLock<SchedulerCore> = OnceLock::new();

thread_local! {
    /// The calling thread's docket index: its own slot on pool workers,
    /// [`RANDOM_INDEX`] on threads the pool does not own.
    static PREFERRED_INDEX: Cell<u32> = const { Cell::new(RANDOM_INDEX) };
}

#[inline]
pub(crate) fn preferred_index() -> u32 {
    PREFERRED_INDEX.with(Cell::get)
}

fn default_worker_count() -> u32 {
    (num_cpus::get() as u32).max(WORKER_THREAD_FLOOR)
}

fn core() -> &'static SchedulerCore {
    CORE.get_or_init(|| SchedulerCore::new(SchedulerConfig::default()))
}

impl SchedulerCore {
    fn new(config: SchedulerConfig) -> SchedulerCore {
        let worker_count = config.worker_count.unwrap_or_else(default_worker_count);
        let core = SchedulerCore {
            ready: Docket::new(worker_count),
            blocked: Docket::new(worker_count),
            disable_work_stealing: AtomicU32::new(0),
            done: AtomicBool::new(false),
            fuzzing: AtomicBool::new(config.fuzzing),
            threads: Mutex::new(Vec::with_capacity(worker_count as usize)),
        };
        tracing::debug!(worker_count, fuzzing = config.fuzzing, "starting scheduler pool");

        let mut threads = core.threads.lock();
        for i in 0..worker_count {
            let handle = thread::Builder::new()
                .name(format!("weft-worker-{i}"))
                .spawn(move || {
                    PREFERRED_INDEX.with(|cell| cell.set(i));
                    // Blocks until the pool finishes initializing.
                    worker_main(self::core());
                })
                .expect("failed to spawn scheduler worker thread");
            threads.push(handle);
        }
        drop(threads);
        core
    }
}

/// Facade over the process-wide pool. All operations initialize the pool on
/// first use.
pub struct Scheduler;

impl Scheduler {
    /// Boots the pool with an explicit configuration. Fails if the pool is
    /// already running (a prior `start` or any lazy first use).
    pub fn start(config: SchedulerConfig) -> Result<(), StartError> {
        let mut fresh = false;
        CORE.get_or_init(|| {
            fresh = true;
            SchedulerCore::new(config)
        });
        if fresh {
            Ok(())
        } else {
            Err(StartError::AlreadyRunning)
        }
    }

    /// Synchronously drains `items` on the calling thread: each schedulable
    /// is stepped in turn and any continuation chain it returns is appended
    /// to the remaining work.
    ///
    /// # Safety
    ///
    /// `items` must be a well-formed chain of live, ready schedulables
    /// exclusively owned by the caller.
    pub unsafe fn execute_immediately(items: NonNull<Schedulable>) {
        unsafe {
            let mut items_tail = last_node(items);
            let mut items = Some(items);
            while let Some(item) = items {
                let mut next = NonNull::new(item.as_ref().next.get());
                item.as_ref().next.set(ptr::null_mut());

                if let Some(continuations) = NonNull::new(Schedulable::execute(item)) {
                    if next.is_none() {
                        next = Some(continuations);
                    } else {
                        items_tail.as_ref().next.set(continuations.as_ptr());
                    }
                    items_tail = last_node(continuations);
                }
                items = next;
            }
        }
    }

    /// Routes `items` into a uniformly random worker's dockets.
    ///
    /// # Safety
    ///
    /// `items` must be a well-formed chain of live schedulables exclusively
    /// owned by the caller; ownership transfers to the scheduler.
    pub unsafe fn schedule_randomly(items: NonNull<Schedulable>) {
        unsafe { schedule_items(core(), items, RANDOM_INDEX) };
    }

    /// Routes `items` into the calling worker's own dockets (a random
    /// worker's when the caller is not part of the pool).
    ///
    /// # Safety
    ///
    /// Same contract as [`Scheduler::schedule_randomly`].
    pub unsafe fn schedule_locally(items: NonNull<Schedulable>) {
        unsafe { schedule_items(core(), items, preferred_index()) };
    }

    /// Distributes `items` across distinct workers, holding work stealing
    /// off for the duration so the fan-out is not immediately collapsed.
    ///
    /// # Safety
    ///
    /// Same contract as [`Scheduler::schedule_randomly`].
    pub unsafe fn schedule_evenly(items: NonNull<Schedulable>) {
        let core = core();
        core.disable_work_stealing.fetch_add(1, Ordering::Acquire);

        let mut start_index = pcg32();
        let worker_count = core.blocked.width();
        let mut items = Some(items);
        while let Some(item) = items {
            let next = NonNull::new(unsafe { item.as_ref().next.get() });
            unsafe { item.as_ref().next.set(ptr::null_mut()) };
            start_index = start_index.wrapping_add(1);
            unsafe { schedule_items(core, item, start_index % worker_count) };
            items = next;
        }

        core.disable_work_stealing.fetch_sub(1, Ordering::Release);
    }

    /// Width of the pool (and of both dockets).
    pub fn worker_count() -> u32 {
        core().blocked.width()
    }

    /// Makes placement decisions random until disabled, to shake out
    /// ordering assumptions in tests.
    pub fn enable_fuzzing() {
        core().fuzzing.store(true, Ordering::Relaxed);
        tracing::debug!("scheduling fuzzing enabled");
    }

    pub fn disable_fuzzing() {
        core().fuzzing.store(false, Ordering::Relaxed);
        tracing::debug!("scheduling fuzzing disabled");
    }

    /// Cooperative global stop: workers finish their current step and leave
    /// their loop. When called from outside the pool the worker threads are
    /// joined before returning. Work still queued is abandoned, so drain
    /// outstanding tasks first.
    pub fn exit() {
        let core = core();
        core.done.store(true, Ordering::Relaxed);
        tracing::debug!("scheduler exit requested");

        if preferred_index() == RANDOM_INDEX {
            let mut threads = core.threads.lock();
            for handle in threads.drain(..) {
                let _ = handle.join();
            }
        }
    }
}

/// Accumulates a chain split into ready and blocked sublists, preserving
/// arrival order within each.
struct ReadySplit {
    ready_head: *mut Schedulable,
    ready_tail: *mut Schedulable,
    blocked_head: *mut Schedulable,
    blocked_tail: *mut Schedulable,
}

impl ReadySplit {
    fn new() -> Self {
        ReadySplit {
            ready_head: ptr::null_mut(),
            ready_tail: ptr::null_mut(),
            blocked_head: ptr::null_mut(),
            blocked_tail: ptr::null_mut(),
        }
    }

    /// Unlinks every node of `chain` and appends it to the matching sublist
    /// based on its `is_ready` answer.
    unsafe fn classify_chain(&mut self, chain: *mut Schedulable) {
        let mut node = chain;
        while let Some(current) = NonNull::new(node) {
            unsafe {
                node = current.as_ref().next.get();
                current.as_ref().next.set(ptr::null_mut());

                if Schedulable::is_ready(current) {
                    if let Some(tail) = NonNull::new(self.ready_tail) {
                        tail.as_ref().next.set(current.as_ptr());
                    } else {
                        self.ready_head = current.as_ptr();
                    }
                    self.ready_tail = current.as_ptr();
                } else {
                    if let Some(tail) = NonNull::new(self.blocked_tail) {
                        tail.as_ref().next.set(current.as_ptr());
                    } else {
                        self.blocked_head = current.as_ptr();
                    }
                    self.blocked_tail = current.as_ptr();
                }
            }
        }
    }

    fn ready(&self) -> Option<(NonNull<Schedulable>, NonNull<Schedulable>)> {
        let head = NonNull::new(self.ready_head)?;
        Some((head, NonNull::new(self.ready_tail).unwrap()))
    }

    fn blocked(&self) -> Option<(NonNull<Schedulable>, NonNull<Schedulable>)> {
        let head = NonNull::new(self.blocked_head)?;
        Some((head, NonNull::new(self.blocked_tail).unwrap()))
    }
}

/// Splits `items` by readiness and routes each sublist to the matching
/// docket. Under fuzzing (with stealing allowed) the preferred index is
/// replaced with a random one.
unsafe fn schedule_items(core: &SchedulerCore, items: NonNull<Schedulable>, mut preferred: u32) {
    let stealing_disabled = core.disable_work_stealing.load(Ordering::Relaxed) != 0;
    if !stealing_disabled && core.fuzzing.load(Ordering::Relaxed) {
        preferred = RANDOM_INDEX;
    }

    let mut split = ReadySplit::new();
    unsafe {
        split.classify_chain(items.as_ptr());
        if let Some((head, tail)) = split.ready() {
            core.ready.push_chain(head, tail, preferred);
        }
        if let Some((head, tail)) = split.blocked() {
            core.blocked.push_chain(head, tail, preferred);
        }
    }
}

/// Walks up to `2(N−1)+1` chain nodes, sampling every other one into the
/// local window, and sorts the window by descending priority. Returns the
/// unsampled remainder and its (true) tail for requeueing.
unsafe fn take_sort_and_split(
    local: &mut [Option<NonNull<Schedulable>>; SORT_WINDOW],
    chain: NonNull<Schedulable>,
) -> Option<(NonNull<Schedulable>, NonNull<Schedulable>)> {
    let mut node_count: u32 = 1;
    let mut median = chain;
    let mut processed = chain;
    local[0] = Some(chain);

    unsafe {
        while let Some(next) = NonNull::new(processed.as_ref().next.get()) {
            if node_count % 2 == 0 {
                median = NonNull::new_unchecked(median.as_ref().next.get());
                local[(node_count / 2) as usize] = Some(median);
            }
            processed = next;
            node_count += 1;
            if node_count > (SORT_WINDOW as u32 - 1) * 2 {
                break;
            }
        }
    }

    sort6(priority_order, local);

    unsafe {
        let remainder = NonNull::new(median.as_ref().next.get())?;
        Some((remainder, last_node(processed)))
    }
}

fn priority_order(a: &Option<NonNull<Schedulable>>, b: &Option<NonNull<Schedulable>>) -> bool {
    let priority = |node: &Option<NonNull<Schedulable>>| {
        node.map_or(i32::MIN, |n| unsafe { n.as_ref() }.priority())
    };
    priority(a) > priority(b)
}

fn worker_main(core: &'static SchedulerCore) {
    let own_index = preferred_index();
    tracing::trace!(worker = own_index, "worker online");

    let mut loops_without_any_work: u32 = 0;
    while !core.done.load(Ordering::Relaxed) {
        let mut preferred = own_index;
        let fuzzing = core.fuzzing.load(Ordering::Relaxed);
        let stealing_disabled = core.disable_work_stealing.load(Ordering::Acquire) != 0;
        if !stealing_disabled && fuzzing {
            preferred = RANDOM_INDEX;
        }

        let ready = core.ready.take_chain(
            preferred,
            loops_without_any_work < STEAL_PATIENCE || stealing_disabled,
        );
        if let Some((ready, selected_index)) = ready {
            loops_without_any_work = 0;

            let mut local: [Option<NonNull<Schedulable>>; SORT_WINDOW] = [None; SORT_WINDOW];
            let remainder = unsafe { take_sort_and_split(&mut local, ready) };

            // Stolen remainders go straight back where they were found, so
            // the victim's locality is preserved.
            if own_index != selected_index {
                if let Some((head, tail)) = remainder {
                    unsafe { core.ready.push_chain(head, tail, selected_index) };
                }
            }

            let mut split = ReadySplit::new();
            for slot in local {
                let Some(node) = slot else { break };
                unsafe {
                    node.as_ref().next.set(ptr::null_mut());
                    let continuations = Schedulable::execute(node);
                    if !continuations.is_null() {
                        split.classify_chain(continuations);
                    }
                }
            }

            unsafe {
                if let Some((head, tail)) = split.ready() {
                    core.ready.push_chain(head, tail, preferred);
                }
                if let Some((head, tail)) = split.blocked() {
                    core.blocked.push_chain(head, tail, preferred);
                }
            }

            if own_index == selected_index {
                if let Some((head, tail)) = remainder {
                    unsafe { core.ready.push_chain(head, tail, own_index) };
                }
            }
            continue;
        }

        let blocked_preferred = if loops_without_any_work == 0 {
            preferred
        } else {
            RANDOM_INDEX
        };
        if let Some((blocked, _)) = core.blocked.take_chain(blocked_preferred, stealing_disabled) {
            let mut split = ReadySplit::new();
            unsafe { split.classify_chain(blocked.as_ptr()) };

            unsafe {
                if let Some((head, tail)) = split.ready() {
                    loops_without_any_work = 0;
                    core.ready.push_chain(head, tail, preferred);
                }
                if let Some((head, tail)) = split.blocked() {
                    core.blocked.push_chain(head, tail, preferred);
                }
            }
            continue;
        }

        if loops_without_any_work < YIELD_THRESHOLD {
            let bursts = IDLE_SPIN_PRIMES[(pcg32() as usize) % IDLE_SPIN_PRIMES.len()];
            for _ in 0..bursts {
                for _ in 0..7 {
                    hint::spin_loop();
                }
            }
            loops_without_any_work += 1;
        } else {
            thread::yield_now();
            loops_without_any_work = 0;
        }
    }

    tracing::trace!(worker = own_index, "worker offline");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use super::*;
    use crate::schedulable::SchedulableVTable;

    /// Schedulable test double: counts executions, readiness toggled by a
    /// flag, optional one-shot continuation.
    #[repr(C)]
    struct TestNode {
        sched: Schedulable,
        executions: AtomicU32,
        ready: AtomicBool,
        continuation: Cell<*mut Schedulable>,
    }

    unsafe fn test_is_ready(this: NonNull<Schedulable>) -> bool {
        let node = this.cast::<TestNode>();
        unsafe { node.as_ref().ready.load(Ordering::Relaxed) }
    }

    unsafe fn test_execute(this: NonNull<Schedulable>) -> *mut Schedulable {
        let node = this.cast::<TestNode>();
        unsafe {
            node.as_ref().executions.fetch_add(1, Ordering::Relaxed);
            node.as_ref().continuation.replace(ptr::null_mut())
        }
    }

    static TEST_VTABLE: SchedulableVTable = SchedulableVTable {
        is_ready: test_is_ready,
        execute: test_execute,
    };

    fn make_node(priority: i32, ready: bool) -> NonNull<TestNode> {
        NonNull::from(Box::leak(Box::new(TestNode {
            sched: Schedulable::new(priority, &TEST_VTABLE),
            executions: AtomicU32::new(0),
            ready: AtomicBool::new(ready),
            continuation: Cell::new(ptr::null_mut()),
        })))
    }

    fn sched(node: NonNull<TestNode>) -> NonNull<Schedulable> {
        node.cast()
    }

    unsafe fn link(nodes: &[NonNull<TestNode>]) {
        for pair in nodes.windows(2) {
            unsafe { pair[0].as_ref().sched.next.set(sched(pair[1]).as_ptr()) };
        }
    }

    unsafe fn free(node: NonNull<TestNode>) {
        unsafe {
            node.as_ref().sched.next.set(ptr::null_mut());
            drop(Box::from_raw(node.as_ptr()));
        }
    }

    #[test]
    fn sort_window_takes_sampled_prefix() {
        let nodes: Vec<_> = (0..11).map(|i| make_node(i, true)).collect();
        unsafe { link(&nodes) };

        let mut local = [None; SORT_WINDOW];
        let remainder = unsafe { take_sort_and_split(&mut local, sched(nodes[0])) };

        // Eleven nodes: the first six are sampled, the rest are remainder.
        let window: Vec<i32> = local
            .iter()
            .map(|slot| unsafe { slot.unwrap().as_ref() }.priority())
            .collect();
        assert_eq!(window, vec![5, 4, 3, 2, 1, 0]);

        let (head, tail) = remainder.unwrap();
        assert_eq!(head, sched(nodes[6]));
        assert_eq!(tail, sched(nodes[10]));

        for node in nodes {
            unsafe { free(node) };
        }
    }

    #[test]
    fn short_chain_splits_at_median() {
        let nodes: Vec<_> = (0..6).map(|i| make_node(i, true)).collect();
        unsafe { link(&nodes) };

        let mut local = [None; SORT_WINDOW];
        let remainder = unsafe { take_sort_and_split(&mut local, sched(nodes[0])) };

        // Six nodes: three sampled, three left over.
        let sampled = local.iter().filter(|slot| slot.is_some()).count();
        assert_eq!(sampled, 3);
        let (head, tail) = remainder.unwrap();
        assert_eq!(head, sched(nodes[3]));
        assert_eq!(tail, sched(nodes[5]));

        for node in nodes {
            unsafe { free(node) };
        }
    }

    #[test]
    fn single_node_has_no_remainder() {
        let node = make_node(7, true);
        let mut local = [None; SORT_WINDOW];
        let remainder = unsafe { take_sort_and_split(&mut local, sched(node)) };
        assert!(remainder.is_none());
        assert_eq!(local[0], Some(sched(node)));
        unsafe { free(node) };
    }

    #[test]
    fn classify_chain_partitions_by_readiness() {
        let nodes = [
            make_node(0, true),
            make_node(1, false),
            make_node(2, true),
            make_node(3, false),
        ];
        unsafe { link(&nodes) };

        let mut split = ReadySplit::new();
        unsafe { split.classify_chain(sched(nodes[0]).as_ptr()) };

        let (ready_head, ready_tail) = split.ready().unwrap();
        assert_eq!(ready_head, sched(nodes[0]));
        assert_eq!(ready_tail, sched(nodes[2]));
        let (blocked_head, blocked_tail) = split.blocked().unwrap();
        assert_eq!(blocked_head, sched(nodes[1]));
        assert_eq!(blocked_tail, sched(nodes[3]));

        for node in nodes {
            unsafe { free(node) };
        }
    }

    #[test]
    fn execute_immediately_drains_continuations() {
        let follow_up = make_node(0, true);
        let first = make_node(0, true);
        unsafe {
            first
                .as_ref()
                .continuation
                .set(sched(follow_up).as_ptr());
            Scheduler::execute_immediately(sched(first));

            assert_eq!(first.as_ref().executions.load(Ordering::Relaxed), 1);
            assert_eq!(follow_up.as_ref().executions.load(Ordering::Relaxed), 1);
            free(first);
            free(follow_up);
        }
    }

    #[test]
    fn config_builder_clamps_worker_count() {
        let config = SchedulerConfig::new().with_worker_count(0);
        assert_eq!(config.worker_count, Some(1));
    }
}

//! Asynchronous tasks: frames, handles, and the suspension protocol.
//!
//! A task is a type-erased `Future<Output = ()>` stored in one allocation
//! together with its [`TaskHeader`]. The header's [`Schedulable`] facet is
//! what the dockets link and the workers step; the frame itself lives in the
//! linear allocator for `ShortLived` tasks or on the system heap for
//! `LongLived` ones.
//!
//! Suspension protocol: while a task is being polled, the thread-local stack
//! root points at its header. Crate awaitables that return `Pending` first
//! install a [`DependencyRef`] on that root; the scheduler then parks the
//! task on the blocked docket until the dependency reports done. Awaiting an
//! unscheduled [`AsyncTask`] drives it inline on the awaiting task — any
//! dependency its steps install lands on the *enclosing* task's root, so the
//! whole stack of inline frames blocks and resumes as one unit.

use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::cell::Cell;
use std::future::Future;
use std::mem::ManuallyDrop;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::process;
use std::ptr::{self, NonNull};
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

use crate::awaitables::{Awaitable, DependencyRef};
use crate::linear::TaskFrameAllocator;
use crate::schedulable::{Schedulable, SchedulableVTable};
use crate::scheduler::Scheduler;
use crate::utils::latch::Latch;

/// Frame lifetime class: selects the allocator backing a task's frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SchedulingFlags {
    /// Resolve to the enclosing task's flags when the frame is allocated.
    /// Only valid inside a running task.
    Inherited,
    /// Frame on the system heap.
    #[default]
    LongLived,
    /// Frame in the thread-local linear allocator.
    ShortLived,
}

/// Creation parameters for [`AsyncTask::new`].
#[derive(Clone, Copy, Debug, Default)]
pub struct AsyncTaskDesc {
    pub flags: SchedulingFlags,
    pub priority: i32,
}

thread_local! {
    /// Ambient frame-lifetime class, set while a task executes so nested
    /// `Inherited` creations resolve against their parent.
    static SCHEDULING_FLAGS: Cell<SchedulingFlags> =
        const { Cell::new(SchedulingFlags::Inherited) };

    /// The task currently being polled on this thread; target of dependency
    /// installation during suspension.
    static STACK_ROOT: Cell<Option<NonNull<TaskHeader>>> = const { Cell::new(None) };
}

/// Records `dependency` on the currently executing task.
///
/// Panics when called outside a task step or when the task already holds a
/// dependency; both are protocol violations.
pub(crate) fn install_dependency(dependency: DependencyRef) {
    STACK_ROOT.with(|cell| {
        let root = cell
            .get()
            .expect("suspension outside of a running task");
        unsafe { root.as_ref() }.set_dependency(dependency);
    });
}

/// Shared prefix of every task frame. The concrete `RawTask<F>` stores the
/// future immediately after it; `poll_fn`/`drop_fn` recover the full type.
#[repr(C)]
pub(crate) struct TaskHeader {
    sched: Schedulable,
    flags: Cell<SchedulingFlags>,
    dependency: Cell<Option<DependencyRef>>,
    safely_done: Latch,
    completed: Cell<bool>,
    poll_fn: unsafe fn(NonNull<TaskHeader>) -> Poll<()>,
    drop_fn: unsafe fn(NonNull<TaskHeader>),
}

impl TaskHeader {
    /// At most one dependency may be pending at a time.
    fn set_dependency(&self, dependency: DependencyRef) {
        assert!(
            self.dependency.get().is_none(),
            "task already holds a pending dependency"
        );
        self.dependency.set(Some(dependency));
    }

    fn done(&self) -> bool {
        self.safely_done.try_wait()
    }
}

impl Drop for TaskHeader {
    fn drop(&mut self) {
        assert!(
            self.dependency.get().is_none(),
            "task dropped while a dependency is still pending"
        );
    }
}

#[repr(C)]
struct RawTask<F> {
    header: TaskHeader,
    future: ManuallyDrop<F>,
}

unsafe fn task_is_ready(this: NonNull<Schedulable>) -> bool {
    let header = this.cast::<TaskHeader>();
    let header = unsafe { header.as_ref() };
    match header.dependency.get() {
        None => true,
        Some(dependency) => {
            if unsafe { dependency.done() } {
                header.dependency.set(None);
                true
            } else {
                false
            }
        }
    }
}

unsafe fn task_execute(this: NonNull<Schedulable>) -> *mut Schedulable {
    let header_ptr = this.cast::<TaskHeader>();
    let header = unsafe { header_ptr.as_ref() };
    assert!(
        unsafe { task_is_ready(this) },
        "task executed while not ready"
    );
    assert!(!header.completed.get(), "task executed after completion");

    let poll = {
        let _scope = StackRootScope::enter(header_ptr);
        match catch_unwind(AssertUnwindSafe(|| unsafe { (header.poll_fn)(header_ptr) })) {
            Ok(poll) => poll,
            Err(_) => {
                // A panic escaping a task step is fatal.
                tracing::error!("task step panicked; aborting process");
                process::abort();
            }
        }
    };

    match poll {
        Poll::Ready(()) => {
            header.completed.set(true);
            header.safely_done.release();
            ptr::null_mut()
        }
        Poll::Pending => this.as_ptr(),
    }
}

static TASK_VTABLE: SchedulableVTable = SchedulableVTable {
    is_ready: task_is_ready,
    execute: task_execute,
};

/// Scoped stack root: installs the executing task and its flags into the
/// thread-locals, restoring the empty state on every exit path.
struct StackRootScope;

impl StackRootScope {
    fn enter(root: NonNull<TaskHeader>) -> StackRootScope {
        let flags = unsafe { root.as_ref() }.flags.get();
        assert!(
            flags != SchedulingFlags::Inherited,
            "inherited scheduling flags on an executing task"
        );
        STACK_ROOT.with(|cell| {
            assert!(
                cell.get().is_none(),
                "task execution nested inside another task step"
            );
            cell.set(Some(root));
        });
        SCHEDULING_FLAGS.with(|cell| cell.set(flags));
        StackRootScope
    }
}

impl Drop for StackRootScope {
    fn drop(&mut self) {
        STACK_ROOT.with(|cell| cell.set(None));
        SCHEDULING_FLAGS.with(|cell| cell.set(SchedulingFlags::Inherited));
    }
}

unsafe fn poll_task<F: Future<Output = ()>>(header: NonNull<TaskHeader>) -> Poll<()> {
    let raw = header.cast::<RawTask<F>>();
    unsafe {
        let future_slot = ptr::addr_of_mut!((*raw.as_ptr()).future);
        // The frame never moves once allocated.
        let future = Pin::new_unchecked(&mut **future_slot);
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        future.poll(&mut cx)
    }
}

unsafe fn drop_task<F>(header: NonNull<TaskHeader>) {
    let raw = header.cast::<RawTask<F>>();
    unsafe {
        let future_slot = ptr::addr_of_mut!((*raw.as_ptr()).future);
        ManuallyDrop::drop(&mut *future_slot);

        let flags = (*header.as_ptr()).flags.get();
        ptr::drop_in_place(header.as_ptr());
        release_frame::<F>(raw.cast(), flags);
    }
}

fn frame_layout<F>() -> Layout {
    Layout::new::<RawTask<F>>()
}

fn allocate_frame<F>(flags: SchedulingFlags) -> NonNull<u8> {
    let layout = frame_layout::<F>();
    match flags {
        SchedulingFlags::ShortLived => TaskFrameAllocator::alloc(layout.size(), layout.align()),
        SchedulingFlags::LongLived => {
            let ptr = unsafe { alloc(layout) };
            match NonNull::new(ptr) {
                Some(ptr) => ptr,
                None => handle_alloc_error(layout),
            }
        }
        SchedulingFlags::Inherited => unreachable!("flags resolved before allocation"),
    }
}

unsafe fn release_frame<F>(frame: NonNull<u8>, flags: SchedulingFlags) {
    match flags {
        SchedulingFlags::ShortLived => unsafe { TaskFrameAllocator::free(frame) },
        SchedulingFlags::LongLived => unsafe { dealloc(frame.as_ptr(), frame_layout::<F>()) },
        SchedulingFlags::Inherited => unreachable!("flags resolved before allocation"),
    }
}

/// A created but not yet scheduled task.
///
/// Either hand it to the scheduler ([`AsyncTask::schedule`] /
/// [`AsyncTask::schedule_evenly`]) and join through the returned
/// [`WaitHandle`], or `.await` it to drive the frame inline on the current
/// task. Dropping an unscheduled task releases its frame.
#[derive(Default)]
pub struct AsyncTask {
    raw: Option<NonNull<TaskHeader>>,
}

unsafe impl Send for AsyncTask {}

impl AsyncTask {
    /// Allocates a task frame for `future` according to `desc`.
    pub fn new<F>(desc: AsyncTaskDesc, future: F) -> AsyncTask
    where
        F: Future<Output = ()> + Send + 'static,
    {
        unsafe { AsyncTask::new_unchecked(desc, future) }
    }

    /// Like [`AsyncTask::new`] without the `'static` bound.
    ///
    /// # Safety
    ///
    /// The caller must keep everything `future` borrows alive until the task
    /// has completed and its frame has been released.
    pub(crate) unsafe fn new_unchecked<F>(desc: AsyncTaskDesc, future: F) -> AsyncTask
    where
        F: Future<Output = ()> + Send,
    {
        let mut flags = desc.flags;
        if flags == SchedulingFlags::Inherited {
            flags = SCHEDULING_FLAGS.with(Cell::get);
            assert!(
                flags != SchedulingFlags::Inherited,
                "inherited scheduling flags outside of a running task"
            );
        }

        let frame = allocate_frame::<F>(flags).cast::<RawTask<F>>();
        unsafe {
            ptr::write(
                frame.as_ptr(),
                RawTask {
                    header: TaskHeader {
                        sched: Schedulable::new(desc.priority, &TASK_VTABLE),
                        flags: Cell::new(flags),
                        dependency: Cell::new(None),
                        safely_done: Latch::new(),
                        completed: Cell::new(false),
                        poll_fn: poll_task::<F>,
                        drop_fn: drop_task::<F>,
                    },
                    future: ManuallyDrop::new(future),
                },
            );
        }
        AsyncTask {
            raw: Some(frame.cast::<TaskHeader>()),
        }
    }

    /// Queues the task on the calling worker's docket and returns its join
    /// handle.
    pub fn schedule(mut self) -> WaitHandle {
        let raw = self.raw.take();
        if let Some(header) = raw {
            unsafe { Scheduler::schedule_locally(header.cast::<Schedulable>()) };
        }
        WaitHandle { raw }
    }

    /// Schedules a batch across distinct workers in one operation.
    pub fn schedule_evenly<const N: usize>(tasks: [AsyncTask; N]) -> [WaitHandle; N] {
        let mut group: *mut Schedulable = ptr::null_mut();
        let handles = tasks.map(|mut task| {
            let raw = task.raw.take();
            if let Some(header) = raw {
                let sched = header.cast::<Schedulable>();
                unsafe { sched.as_ref().next.set(group) };
                group = sched.as_ptr();
            }
            WaitHandle { raw }
        });
        if let Some(group) = NonNull::new(group) {
            unsafe { Scheduler::schedule_evenly(group) };
        }
        handles
    }
}

/// Driving an unscheduled task inline: each poll steps the frame once.
/// Dependencies installed by the frame land on the enclosing task's stack
/// root, so a suspended inline task blocks its whole caller chain.
impl Future for AsyncTask {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        let Some(header_ptr) = self.raw else {
            return Poll::Ready(());
        };
        let header = unsafe { header_ptr.as_ref() };
        if header.completed.get() {
            return Poll::Ready(());
        }
        match unsafe { (header.poll_fn)(header_ptr) } {
            Poll::Ready(()) => {
                header.completed.set(true);
                header.safely_done.release();
                Poll::Ready(())
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for AsyncTask {
    fn drop(&mut self) {
        if let Some(header) = self.raw.take() {
            unsafe { (header.as_ref().drop_fn)(header) };
        }
    }
}

/// Join point for a scheduled task. Move-only; owns the task frame and
/// releases it on drop.
///
/// `WaitHandle` is also an awaitable: `handle.await` suspends the current
/// task until the joined task completes, and composite waits
/// ([`crate::AwaitAll`], [`crate::AwaitAny`]) poll slices of handles.
#[derive(Default)]
pub struct WaitHandle {
    raw: Option<NonNull<TaskHeader>>,
}

unsafe impl Send for WaitHandle {}
unsafe impl Sync for WaitHandle {}

impl WaitHandle {
    /// True when this handle owns a task. Default-constructed and moved-from
    /// handles are invalid (and trivially done).
    pub fn valid(&self) -> bool {
        self.raw.is_some()
    }

    /// True once the joined task has completed (or for invalid handles).
    pub fn done(&self) -> bool {
        self.raw.map_or(true, |header| unsafe { header.as_ref() }.done())
    }

    /// Blocks the calling thread until the task completes. Publication is
    /// release/acquire through the completion latch: every write the task
    /// made happens-before `wait` returns.
    pub fn wait(&self) {
        if let Some(header) = self.raw {
            unsafe { header.as_ref() }.safely_done.wait();
        }
    }
}

impl Awaitable for WaitHandle {
    fn done(&self) -> bool {
        WaitHandle::done(self)
    }
}

impl Future for WaitHandle {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        if self.done() {
            return Poll::Ready(());
        }
        install_dependency(DependencyRef::new(&*self));
        Poll::Pending
    }
}

impl Drop for WaitHandle {
    fn drop(&mut self) {
        if let Some(header) = self.raw.take() {
            debug_assert!(
                unsafe { header.as_ref() }.done(),
                "wait handle dropped before its task completed"
            );
            unsafe { (header.as_ref().drop_fn)(header) };
        }
    }
}

unsafe fn noop_clone(_: *const ()) -> RawWaker {
    RawWaker::new(ptr::null(), &NOOP_WAKER_VTABLE)
}

unsafe fn noop(_: *const ()) {}

static NOOP_WAKER_VTABLE: RawWakerVTable = RawWakerVTable::new(noop_clone, noop, noop, noop);

/// Tasks are resumed by docket re-tests, never by wakers.
fn noop_waker() -> Waker {
    unsafe { Waker::from_raw(RawWaker::new(ptr::null(), &NOOP_WAKER_VTABLE)) }
}

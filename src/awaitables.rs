//! Awaitables: the suspension protocol and the join/limit primitives built
//! on it.
//!
//! Anything a task can wait on exposes `done()` — a cheap, re-testable check
//! the blocked docket polls. When one of these futures returns `Pending` it
//! first installs a type-erased [`DependencyRef`] to itself on the current
//! stack root; the pointer stays valid because the awaitable lives inside
//! the suspended task's pinned frame.

use std::cell::Cell;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::task::{Context, Poll};

use crate::task::{install_dependency, WaitHandle};

/// A condition a blocked task is waiting on.
pub(crate) trait Awaitable {
    /// True once the dependency has resolved and the task may resume.
    fn done(&self) -> bool;
}

/// Erased pointer to an [`Awaitable`] inside a suspended task frame.
#[derive(Clone, Copy)]
pub(crate) struct DependencyRef {
    data: *const (),
    done_fn: unsafe fn(*const ()) -> bool,
}

impl DependencyRef {
    pub(crate) fn new<A: Awaitable>(awaitable: &A) -> DependencyRef {
        unsafe fn done_thunk<A: Awaitable>(data: *const ()) -> bool {
            unsafe { (*data.cast::<A>()).done() }
        }
        DependencyRef {
            data: (awaitable as *const A).cast(),
            done_fn: done_thunk::<A>,
        }
    }

    /// # Safety
    ///
    /// The referenced awaitable must still be alive, which the scheduler
    /// guarantees while the owning task sits on the blocked docket.
    pub(crate) unsafe fn done(&self) -> bool {
        unsafe { (self.done_fn)(self.data) }
    }
}

/// Suspends the current task for one scheduling round without installing a
/// dependency, so it is re-queued as ready.
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            Poll::Ready(())
        } else {
            self.yielded = true;
            Poll::Pending
        }
    }
}

/// Resolves once every handle in the slice is done.
///
/// Polls advance a cursor past the already-done prefix, so repeated re-tests
/// only pay for the handles still outstanding.
pub struct AwaitAll<'a> {
    handles: &'a [WaitHandle],
    cursor: Cell<usize>,
}

impl<'a> AwaitAll<'a> {
    pub fn new(handles: &'a [WaitHandle]) -> AwaitAll<'a> {
        AwaitAll {
            handles,
            cursor: Cell::new(0),
        }
    }

    fn scan(&self) -> bool {
        let mut cursor = self.cursor.get();
        while cursor < self.handles.len() {
            if !self.handles[cursor].done() {
                self.cursor.set(cursor);
                return false;
            }
            cursor += 1;
        }
        self.cursor.set(cursor);
        true
    }
}

impl Awaitable for AwaitAll<'_> {
    fn done(&self) -> bool {
        self.scan()
    }
}

impl Future for AwaitAll<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        if self.scan() {
            Poll::Ready(())
        } else {
            install_dependency(DependencyRef::new(&*self));
            Poll::Pending
        }
    }
}

/// Resolves once some valid handle in the slice is done, yielding its index.
///
/// Moved-from (invalid) handles are skipped. The scan resumes from the last
/// hit, so callers draining several completions pay an amortized single
/// pass.
pub struct AwaitAny<'a> {
    handles: &'a [WaitHandle],
    index: Cell<usize>,
}

impl<'a> AwaitAny<'a> {
    pub fn new(handles: &'a [WaitHandle]) -> AwaitAny<'a> {
        AwaitAny {
            handles,
            index: Cell::new(0),
        }
    }

    fn scan(&self) -> bool {
        for i in self.index.get()..self.handles.len() {
            if self.handles[i].valid() && self.handles[i].done() {
                self.index.set(i);
                return true;
            }
        }
        false
    }
}

impl Awaitable for AwaitAny<'_> {
    fn done(&self) -> bool {
        self.scan()
    }
}

impl Future for AwaitAny<'_> {
    type Output = usize;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<usize> {
        if self.scan() {
            Poll::Ready(self.index.get())
        } else {
            install_dependency(DependencyRef::new(&*self));
            Poll::Pending
        }
    }
}

/// Gates concurrent work on a signed resource budget.
///
/// `request(cost)` reserves `cost` up front; the returned future resolves as
/// soon as the reservation fits under the limit and yields a guard that
/// gives the cost back on release or drop. The counter orders nothing — it
/// only gates progress — so all operations are relaxed.
pub struct ResourceLimiter {
    limit: i64,
    resource_limit: AtomicI64,
}

impl ResourceLimiter {
    pub fn new(limit: i64) -> ResourceLimiter {
        let limit = limit.max(1);
        ResourceLimiter {
            limit,
            resource_limit: AtomicI64::new(limit),
        }
    }

    /// Reserves `cost` (clamped to be non-negative) and returns the
    /// awaitable reservation.
    pub fn request(&self, cost: i64) -> ResourceRequest<'_> {
        let cost = cost.max(0);
        self.resource_limit.fetch_sub(cost, Ordering::Relaxed);
        ResourceRequest {
            resource_limit: &self.resource_limit,
            cost,
            state: Cell::new(RequestState::Reserved),
        }
    }
}

impl Drop for ResourceLimiter {
    fn drop(&mut self) {
        let remaining = self.resource_limit.load(Ordering::Relaxed);
        assert!(
            remaining == self.limit,
            "resource limiter dropped with {} of {} units still reserved",
            self.limit - remaining,
            self.limit
        );
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum RequestState {
    /// `request` subtracted the cost; the first poll has not happened yet.
    Reserved,
    /// The first poll gave the cost back and parked; resumption re-takes it.
    Suspended,
    /// A guard owns the reservation.
    Done,
}

/// Pending reservation against a [`ResourceLimiter`].
pub struct ResourceRequest<'a> {
    resource_limit: &'a AtomicI64,
    cost: i64,
    state: Cell<RequestState>,
}

impl Awaitable for ResourceRequest<'_> {
    fn done(&self) -> bool {
        self.resource_limit.load(Ordering::Relaxed) >= self.cost
    }
}

impl<'a> Future for ResourceRequest<'a> {
    type Output = ResourceLimitGuard<'a>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<ResourceLimitGuard<'a>> {
        match self.state.get() {
            RequestState::Reserved => {
                // Give the reservation back while testing: a positive prior
                // value means it fit under the limit. The asymmetry with the
                // `request`-side subtract is load-bearing.
                if self.resource_limit.fetch_add(self.cost, Ordering::Relaxed) > 0 {
                    self.resource_limit.fetch_sub(self.cost, Ordering::Relaxed);
                    self.state.set(RequestState::Done);
                    Poll::Ready(ResourceLimitGuard {
                        resource_limit: self.resource_limit,
                        cost: Cell::new(self.cost),
                    })
                } else {
                    self.state.set(RequestState::Suspended);
                    install_dependency(DependencyRef::new(&*self));
                    Poll::Pending
                }
            }
            RequestState::Suspended => {
                // Resumed after done() observed headroom; re-take the cost.
                self.resource_limit.fetch_sub(self.cost, Ordering::Relaxed);
                self.state.set(RequestState::Done);
                Poll::Ready(ResourceLimitGuard {
                    resource_limit: self.resource_limit,
                    cost: Cell::new(self.cost),
                })
            }
            RequestState::Done => unreachable!("resource request polled after completion"),
        }
    }
}

impl Drop for ResourceRequest<'_> {
    fn drop(&mut self) {
        // Release exactly what this state still holds: the initial
        // reservation before the first poll, nothing while suspended (the
        // first poll already returned it), nothing once a guard owns it.
        if self.state.get() == RequestState::Reserved {
            self.resource_limit.fetch_add(self.cost, Ordering::Relaxed);
        }
    }
}

/// Owned reservation; returns its cost on [`ResourceLimitGuard::release`] or
/// drop, whichever comes first.
pub struct ResourceLimitGuard<'a> {
    resource_limit: &'a AtomicI64,
    cost: Cell<i64>,
}

impl ResourceLimitGuard<'_> {
    /// Gives the reserved cost back. Idempotent.
    pub fn release(&self) {
        let cost = self.cost.replace(0);
        if cost != 0 {
            self.resource_limit.fetch_add(cost, Ordering::Relaxed);
        }
    }
}

impl Drop for ResourceLimitGuard<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use futures_lite::future::block_on;

    use super::*;

    #[test]
    fn request_under_limit_is_immediately_ready() {
        let limiter = ResourceLimiter::new(4);
        let guard = block_on(limiter.request(1));
        assert_eq!(guard.cost.get(), 1);
        drop(guard);
    }

    #[test]
    fn limiter_quiesces_after_guards_release() {
        let limiter = ResourceLimiter::new(4);
        let a = block_on(limiter.request(1));
        let b = block_on(limiter.request(2));
        a.release();
        a.release(); // idempotent
        drop(a);
        drop(b);
        drop(limiter); // would panic if any cost leaked
    }

    #[test]
    fn over_limit_request_reports_not_done() {
        let limiter = ResourceLimiter::new(2);
        let held = block_on(limiter.request(1));

        let pending = limiter.request(2);
        assert!(!Awaitable::done(&pending));

        // Dropping an unpolled request releases its reservation ...
        drop(pending);
        // ... so a follow-up request has room again once the holder is gone.
        drop(held);
        let again = limiter.request(1);
        assert!(Awaitable::done(&again));
        drop(block_on(again));
    }

    #[test]
    fn zero_cost_requests_are_free() {
        let limiter = ResourceLimiter::new(1);
        let a = block_on(limiter.request(0));
        let b = block_on(limiter.request(0));
        drop(a);
        drop(b);
    }

    #[test]
    #[should_panic(expected = "still reserved")]
    fn leaked_reservation_fails_the_limiter_drop() {
        let limiter = ResourceLimiter::new(4);
        let guard = block_on(limiter.request(2));
        std::mem::forget(guard);
        drop(limiter);
    }

    #[test]
    fn await_all_over_invalid_handles_is_ready() {
        let handles = [WaitHandle::default(), WaitHandle::default()];
        block_on(AwaitAll::new(&handles));
    }

    #[test]
    fn await_all_cursor_advances_past_done_prefix() {
        let handles = [WaitHandle::default(), WaitHandle::default()];
        let all = AwaitAll::new(&handles);
        assert!(all.scan());
        assert_eq!(all.cursor.get(), handles.len());
    }

    #[test]
    fn await_any_skips_invalid_handles() {
        let handles = [WaitHandle::default(), WaitHandle::default()];
        let any = AwaitAny::new(&handles);
        // Invalid handles never count as completions.
        assert!(!any.scan());
    }

    #[test]
    fn yield_now_completes_on_second_poll() {
        use std::ptr;
        use std::task::{RawWaker, RawWakerVTable, Waker};

        unsafe fn clone(_: *const ()) -> RawWaker {
            RawWaker::new(ptr::null(), &VTABLE)
        }
        unsafe fn noop(_: *const ()) {}
        static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, noop, noop, noop);

        let waker = unsafe { Waker::from_raw(RawWaker::new(ptr::null(), &VTABLE)) };
        let mut cx = Context::from_waker(&waker);
        let mut yielded = yield_now();
        assert_eq!(Pin::new(&mut yielded).poll(&mut cx), Poll::Pending);
        assert_eq!(Pin::new(&mut yielded).poll(&mut cx), Poll::Ready(()));
    }
}

//! The unit the scheduler manipulates: an intrusive header with a priority,
//! a single `next` link, and a two-entry vtable.
//!
//! Concrete scheduled types embed a [`Schedulable`] as their first field
//! (`#[repr(C)]`) and recover themselves from the header pointer inside
//! their vtable functions, the same header-cast layout the task frame uses.

use std::cell::Cell;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicI32, Ordering};

pub const MIN_PRIORITY: i32 = i32::MIN + 1;
pub const MAX_PRIORITY: i32 = i32::MAX - 1;

/// Exponential adjustment saturates well below the priority clamp so repeated
/// applications keep ordering headroom.
const MAX_ADJUSTMENT: i32 = i32::MAX / 4;
const MIN_ADJUSTMENT: i32 = i32::MIN / 4;

/// Dispatch table for a schedulable unit.
///
/// # Safety
///
/// Both functions receive the pointer to the embedded [`Schedulable`] header;
/// implementations cast back to their containing type. The scheduler
/// guarantees a given node is executed by at most one worker at a time, so
/// neither function needs internal synchronization against itself.
pub struct SchedulableVTable {
    /// Returns true when the next step of this unit can run now.
    pub is_ready: unsafe fn(NonNull<Schedulable>) -> bool,
    /// Runs one step. Returns a chain of continuations to re-queue, or null.
    pub execute: unsafe fn(NonNull<Schedulable>) -> *mut Schedulable,
}

#[repr(C)]
pub struct Schedulable {
    /// Intrusive link. Owned by whichever chain or docket stack currently
    /// holds the node; null whenever the node is unlinked. A schedulable is
    /// threaded through at most one list at a time and must be unlinked
    /// before it is dropped.
    pub next: Cell<*mut Schedulable>,
    priority: AtomicI32,
    priority_adjustment: Cell<i32>,
    vtable: &'static SchedulableVTable,
}

impl Schedulable {
    pub fn new(priority: i32, vtable: &'static SchedulableVTable) -> Self {
        Schedulable {
            next: Cell::new(ptr::null_mut()),
            priority: AtomicI32::new(priority.clamp(MIN_PRIORITY, MAX_PRIORITY)),
            priority_adjustment: Cell::new(1),
            vtable,
        }
    }

    #[inline]
    pub fn priority(&self) -> i32 {
        self.priority.load(Ordering::Relaxed)
    }

    /// Shifts the priority, saturating at the clamp endpoints.
    pub fn adjust_priority(&self, adjustment: i32) {
        let current = self.priority.load(Ordering::Relaxed);
        let adjusted = current
            .saturating_add(adjustment)
            .clamp(MIN_PRIORITY, MAX_PRIORITY);
        self.priority.store(adjusted, Ordering::Relaxed);
    }

    /// Doubles the positive adjustment step and applies it. A direction
    /// change resets the step to 1.
    pub fn exponentially_adjust_priority_up(&self) {
        let step = self.priority_adjustment.get();
        let step = if step > 0 {
            (step * 2).min(MAX_ADJUSTMENT)
        } else {
            1
        };
        self.priority_adjustment.set(step);
        self.adjust_priority(step);
    }

    /// Doubles the negative adjustment step and applies it. A direction
    /// change resets the step to -1.
    pub fn exponentially_adjust_priority_down(&self) {
        let step = self.priority_adjustment.get();
        let step = if step < 0 {
            (step * 2).max(MIN_ADJUSTMENT)
        } else {
            -1
        };
        self.priority_adjustment.set(step);
        self.adjust_priority(step);
    }

    /// # Safety
    ///
    /// `this` must point to a live schedulable not concurrently executed.
    #[inline]
    pub(crate) unsafe fn is_ready(this: NonNull<Schedulable>) -> bool {
        unsafe { (this.as_ref().vtable.is_ready)(this) }
    }

    /// # Safety
    ///
    /// `this` must point to a live, ready schedulable owned by the caller.
    #[inline]
    pub(crate) unsafe fn execute(this: NonNull<Schedulable>) -> *mut Schedulable {
        unsafe { (this.as_ref().vtable.execute)(this) }
    }
}

impl Drop for Schedulable {
    fn drop(&mut self) {
        assert!(
            self.next.get().is_null(),
            "schedulable dropped while still linked into a chain"
        );
    }
}

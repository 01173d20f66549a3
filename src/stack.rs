//! Lock-free intrusive LIFO and chain utilities.
//!
//! Nodes are threaded through the `next` field embedded in every
//! [`Schedulable`]; pushing and popping splice whole chains with a single
//! atomic operation each, so the dispatch hot path never allocates.

use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::schedulable::Schedulable;

/// Single-word atomic stack that transfers entire chains.
///
/// Producers push with release ordering, consumers detach with acquire, so
/// writes into node fields made before [`TransferStack::push_chain`] are
/// visible to whichever worker observes the nodes after
/// [`TransferStack::take_all`].
pub struct TransferStack {
    top: AtomicPtr<Schedulable>,
}

impl TransferStack {
    pub const fn new() -> Self {
        TransferStack {
            top: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Pushes the chain `head..=tail` onto the stack. The previous top
    /// becomes the chain's new tail.
    ///
    /// # Safety
    ///
    /// `head..=tail` must be a well-formed chain exclusively owned by the
    /// caller, with `tail` reachable from `head` and not linked anywhere
    /// else. Ownership of every node transfers to the stack.
    pub unsafe fn push_chain(&self, head: NonNull<Schedulable>, tail: NonNull<Schedulable>) {
        let mut last_top = self.top.load(Ordering::Relaxed);
        loop {
            unsafe { tail.as_ref().next.set(last_top) };
            match self.top.compare_exchange_weak(
                last_top,
                head.as_ptr(),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(current) => last_top = current,
            }
        }
    }

    /// Detaches and returns the entire chain, most recently pushed first.
    pub fn take_all(&self) -> Option<NonNull<Schedulable>> {
        NonNull::new(self.top.swap(ptr::null_mut(), Ordering::Acquire))
    }
}

/// Walks to the final node of a chain.
///
/// # Safety
///
/// `head` must start a well-formed, null-terminated chain owned by the
/// caller.
pub unsafe fn last_node(head: NonNull<Schedulable>) -> NonNull<Schedulable> {
    let mut tail = head;
    unsafe {
        while let Some(next) = NonNull::new(tail.as_ref().next.get()) {
            tail = next;
        }
    }
    tail
}

/// Like [`last_node`], also counting the nodes walked.
///
/// # Safety
///
/// Same contract as [`last_node`].
pub unsafe fn last_node_and_count(head: NonNull<Schedulable>) -> (NonNull<Schedulable>, usize) {
    let mut tail = head;
    let mut count = 1;
    unsafe {
        while let Some(next) = NonNull::new(tail.as_ref().next.get()) {
            tail = next;
            count += 1;
        }
    }
    (tail, count)
}

/// Reverses the links of a chain in place, returning the new head.
///
/// # Safety
///
/// `chain` must be null or start a well-formed chain owned by the caller.
pub unsafe fn reverse_links(chain: *mut Schedulable) -> *mut Schedulable {
    let mut node = chain;
    let mut prev: *mut Schedulable = ptr::null_mut();
    while let Some(current) = NonNull::new(node) {
        unsafe {
            node = current.as_ref().next.get();
            current.as_ref().next.set(prev);
        }
        prev = current.as_ptr();
    }
    prev
}

/// Visits every node of a chain. The successor is read before the callback
/// runs, so the callback may freely relink or consume the node.
///
/// # Safety
///
/// `chain` must be null or start a well-formed chain owned by the caller.
pub unsafe fn for_each_node(chain: *mut Schedulable, mut f: impl FnMut(NonNull<Schedulable>)) {
    let mut node = chain;
    while let Some(current) = NonNull::new(node) {
        node = unsafe { current.as_ref().next.get() };
        f(current);
    }
}

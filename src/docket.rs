//! Per-worker stack array with random placement and spiral work stealing.

use std::ptr::NonNull;

use crossbeam_utils::CachePadded;

use crate::schedulable::Schedulable;
use crate::stack::TransferStack;
use crate::utils::random::pcg32;

/// Sentinel index meaning "pick a stack uniformly at random".
pub const RANDOM_INDEX: u32 = u32::MAX;

/// Fixed-width array of cache-padded transfer stacks, one per worker.
pub struct Docket {
    stacks: Box<[CachePadded<TransferStack>]>,
}

impl Docket {
    pub fn new(width: u32) -> Self {
        assert!(width >= 1, "docket requires at least one stack");
        let stacks = (0..width)
            .map(|_| CachePadded::new(TransferStack::new()))
            .collect();
        Docket { stacks }
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.stacks.len() as u32
    }

    /// Pushes the chain `head..=tail` onto the preferred stack, or a random
    /// one when `preferred` is out of range (including [`RANDOM_INDEX`]).
    ///
    /// # Safety
    ///
    /// Same chain-ownership contract as [`TransferStack::push_chain`].
    pub unsafe fn push_chain(
        &self,
        head: NonNull<Schedulable>,
        tail: NonNull<Schedulable>,
        preferred: u32,
    ) {
        let width = self.width();
        let index = if preferred >= width {
            pcg32() % width
        } else {
            preferred
        };
        unsafe { self.stacks[index as usize].push_chain(head, tail) };
    }

    /// Detaches a chain, trying `preferred` first and returning which stack
    /// it came from.
    ///
    /// When the preferred stack is empty and stealing is allowed, the other
    /// stacks are probed in the order `preferred+1, preferred-1,
    /// preferred+2, ...` — an alternating spiral that spreads contention
    /// while keeping the search biased toward neighbors.
    pub fn take_chain(
        &self,
        preferred: u32,
        disable_work_stealing: bool,
    ) -> Option<(NonNull<Schedulable>, u32)> {
        let width = self.width();
        let preferred = if preferred >= width {
            pcg32() % width
        } else {
            preferred
        };

        if let Some(chain) = self.stacks[preferred as usize].take_all() {
            return Some((chain, preferred));
        }
        if disable_work_stealing {
            return None;
        }

        for i in 0..width {
            let step = (i / 2 + 1) as i64;
            let offset = if i & 1 == 1 { -step } else { step };
            let selected = (preferred as i64 + offset).rem_euclid(width as i64) as u32;
            if let Some(chain) = self.stacks[selected as usize].take_all() {
                return Some((chain, selected));
            }
        }
        None
    }
}

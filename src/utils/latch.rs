use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, Thread};

use parking_lot::Mutex;

/// One-shot completion latch.
///
/// `try_wait` is a single acquire load so it can sit on the blocked-docket
/// re-test path. Blocking waiters register themselves and park; `release`
/// flips the flag under the waiter lock and unparks through cloned thread
/// handles, so after the flag is visible the releaser never dereferences the
/// latch again except to drop the lock — which `Drop` serializes with before
/// the memory can be reused. As with `std::latch`, the latch must not be
/// destroyed while a thread is still blocked in [`Latch::wait`].
pub struct Latch {
    released: AtomicBool,
    waiters: Mutex<Vec<Thread>>,
}

impl Latch {
    pub const fn new() -> Self {
        Latch {
            released: AtomicBool::new(false),
            waiters: Mutex::new(Vec::new()),
        }
    }

    /// Returns true once [`Latch::release`] has happened. Pairs acquire with
    /// the release store so the releasing thread's writes are visible.
    #[inline]
    pub fn try_wait(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Blocks the calling thread until the latch is released.
    pub fn wait(&self) {
        if self.try_wait() {
            return;
        }
        {
            let mut waiters = self.waiters.lock();
            // The flag only flips under this lock; re-testing here closes
            // the register/release race.
            if self.try_wait() {
                return;
            }
            waiters.push(thread::current());
        }
        loop {
            thread::park();
            if self.try_wait() {
                return;
            }
        }
    }

    /// Releases the latch. Must be called at most once.
    pub fn release(&self) {
        let waiters = {
            let mut waiters = self.waiters.lock();
            self.released.store(true, Ordering::Release);
            mem::take(&mut *waiters)
        };
        for waiter in waiters {
            waiter.unpark();
        }
    }
}

impl Drop for Latch {
    fn drop(&mut self) {
        // A releaser may still be letting go of the waiter lock; taking it
        // once makes that hand-off complete before the memory goes away.
        drop(self.waiters.lock());
    }
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

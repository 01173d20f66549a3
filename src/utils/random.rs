use std::cell::UnsafeCell;

use rand::RngCore;

const PCG_MULTIPLIER: u64 = 6364136223846793005;
const PCG_INCREMENT: u64 = 1442695040888963407;

/// Minimal PCG32 (XSH-RR) generator. One lives per thread; all scheduler
/// randomness (stack placement, steal starting points, idle backoff) goes
/// through [`pcg32`].
pub struct Random {
    state: u64,
}

thread_local! {
    static THREAD_RNG: UnsafeCell<Random> = UnsafeCell::new(Random::from_entropy());
}

/// Returns a uniform 32-bit value from the calling thread's generator.
#[inline]
pub fn pcg32() -> u32 {
    THREAD_RNG.with(|r| unsafe { &mut *r.get() }.next_u32())
}

impl Random {
    fn from_entropy() -> Self {
        let mut rng = Random {
            state: rand::thread_rng().next_u64().wrapping_add(PCG_INCREMENT),
        };
        let _ = rng.next_u32();
        rng
    }

    pub fn next_u32(&mut self) -> u32 {
        let old_state = self.state;
        self.state = old_state
            .wrapping_mul(PCG_MULTIPLIER)
            .wrapping_add(PCG_INCREMENT | 1);
        let xorshifted = (((old_state >> 18) ^ old_state) >> 27) as u32;
        let rot = (old_state >> 59) as u32;
        xorshifted.rotate_right(rot)
    }
}

//! A small deterministic pseudo-random generator.
//!
//! Every mutation decision in the crate is drawn from a [`Generator`]. Its whole
//! future is a function of one `u64`, so snapshotting [`Generator::state`] before
//! an execution is enough to rebuild the exact mutant later.

use libafl_bolts::current_nanos;

use crate::constants::{DEFAULT_GENERATOR_STATE, LCG_INCREMENT, LCG_MULTIPLIER};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generator {
    state: u64,
}

impl Default for Generator {
    fn default() -> Self {
        Self::new(DEFAULT_GENERATOR_STATE)
    }
}

impl Generator {
    pub fn new(state: u64) -> Self {
        Self { state }
    }

    /// Seeds a generator from the wall clock, once per fuzzing session.
    pub fn from_wall_clock() -> Self {
        Self::new(current_nanos())
    }

    pub fn set_state(&mut self, state: u64) {
        self.state = state;
    }

    pub fn state(&self) -> u64 {
        self.state
    }

    /// Returns a number in `0..n`.
    ///
    /// Returns 0 without advancing when `n <= 1`. Otherwise the result comes from
    /// one linear-congruential step over the current state, and the state itself
    /// moves on through a SplitMix64 finaliser.
    pub fn below(&mut self, n: u64) -> u64 {
        if n <= 1 {
            return 0;
        }
        let t = self
            .state
            .wrapping_mul(LCG_MULTIPLIER)
            .wrapping_add(LCG_INCREMENT);
        self.state = splitmix64(self.state);
        t % n
    }

    #[inline]
    pub fn below_usize(&mut self, n: usize) -> usize {
        self.below(n as u64) as usize
    }

    /// One fair coin flip, consuming a draw.
    #[inline]
    pub fn coinflip(&mut self) -> bool {
        self.below(2) != 0
    }
}

fn splitmix64(x: u64) -> u64 {
    let mut x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn draws_are_reproducible_from_any_state() {
        for state in [0u64, 1, 4399, 0xDEAD_BEEF, u64::MAX] {
            let mut a = Generator::new(state);
            let mut b = Generator::new(7);
            b.set_state(state);
            let xs: Vec<u64> = (0..256).map(|i| a.below(i + 2)).collect();
            let ys: Vec<u64> = (0..256).map(|i| b.below(i + 2)).collect();
            assert_eq!(xs, ys);
            assert_eq!(a.state(), b.state());
        }
    }

    #[test]
    fn degenerate_bounds_do_not_advance() {
        let mut rng = Generator::new(42);
        assert_eq!(rng.below(0), 0);
        assert_eq!(rng.below(1), 0);
        assert_eq!(rng.state(), 42);
        rng.below(10);
        assert_ne!(rng.state(), 42);
    }

    #[test]
    fn first_draw_matches_lcg_step() {
        let mut rng = Generator::new(4399);
        let expected = 4399u64
            .wrapping_mul(LCG_MULTIPLIER)
            .wrapping_add(LCG_INCREMENT)
            % 1000;
        assert_eq!(rng.below(1000), expected);
        assert_eq!(rng.state(), splitmix64(4399));
    }

    #[test]
    fn zero_state_is_not_a_fixed_point() {
        let mut rng = Generator::new(0);
        rng.below(2);
        assert_ne!(rng.state(), 0);
    }

    #[test]
    fn draws_stay_in_range() {
        let mut rng = Generator::new(1);
        for n in 2..500u64 {
            assert!(rng.below(n) < n);
        }
    }
}

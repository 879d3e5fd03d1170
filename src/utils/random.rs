use rand::{Error, RngCore, SeedableRng};
use serde::{Deserialize, Serialize};

const MULTIPLIER: u64 = 0x5_DEEC_E66D;
const ADDEND: u64 = 0xB;
const MASK: u64 = (1 << 48) - 1;
const DOUBLE_UNIT: f64 = 1.0 / (1u64 << 53) as f64;

/// 48-bit linear congruential generator, bit-compatible with `java.util.Random`.
///
/// Every randomized decision in the crate (cut selection, reservoir
/// replacement) is drawn from one of these, so a run is fully determined by
/// its seed and scores match other implementations driven by the same
/// generator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lcg48 {
    state: u64,
}

impl Lcg48 {
    pub fn new(seed: u64) -> Self {
        Lcg48 {
            state: (seed ^ MULTIPLIER) & MASK,
        }
    }

    pub fn set_seed(&mut self, seed: u64) {
        self.state = (seed ^ MULTIPLIER) & MASK;
    }

    /// Raw internal state, for checkpointing.
    pub fn state(&self) -> u64 {
        self.state
    }

    pub fn from_state(state: u64) -> Self {
        Lcg48 {
            state: state & MASK,
        }
    }

    /// Advance and return the top `bits` bits (1..=32) as a signed 32-bit value.
    pub fn next_bits(&mut self, bits: u32) -> i32 {
        debug_assert!(bits >= 1 && bits <= 32);
        self.state = self.state.wrapping_mul(MULTIPLIER).wrapping_add(ADDEND) & MASK;
        (self.state >> (48 - bits)) as u32 as i32
    }

    pub fn next_int(&mut self) -> i32 {
        self.next_bits(32)
    }

    /// Uniform value in `[0, bound)`. A non-positive bound yields 0.
    pub fn next_int_bounded(&mut self, bound: i32) -> i32 {
        if bound <= 0 {
            return 0;
        }
        if bound & bound.wrapping_neg() == bound {
            return ((bound as i64 * self.next_bits(31) as i64) >> 31) as i32;
        }
        loop {
            let bits = self.next_bits(31);
            let val = bits % bound;
            // rejection on overflow, exactly as the reference generator does
            if bits.wrapping_sub(val).wrapping_add(bound - 1) >= 0 {
                return val;
            }
        }
    }

    pub fn next_long(&mut self) -> i64 {
        let high = (self.next_bits(32) as i64) << 32;
        high.wrapping_add(self.next_bits(32) as i64)
    }

    /// Uniform value in `[0, 1)` with 53 bits of precision.
    pub fn next_double(&mut self) -> f64 {
        let high = (self.next_bits(26) as u64) << 27;
        let low = self.next_bits(27) as u64;
        (high + low) as f64 * DOUBLE_UNIT
    }

    /// Uniform index in `[0, bound)` for bounds that may exceed `i32::MAX`.
    pub fn next_index(&mut self, bound: u64) -> u64 {
        if bound <= i32::MAX as u64 {
            return self.next_int_bounded(bound as i32) as u64;
        }
        ((self.next_double() * bound as f64) as u64).min(bound - 1)
    }
}

impl RngCore for Lcg48 {
    fn next_u32(&mut self) -> u32 {
        self.next_int() as u32
    }

    fn next_u64(&mut self) -> u64 {
        self.next_long() as u64
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for chunk in dest.chunks_mut(8) {
            let bytes = self.next_u64().to_le_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

impl SeedableRng for Lcg48 {
    type Seed = [u8; 8];

    fn from_seed(seed: Self::Seed) -> Self {
        Lcg48::new(u64::from_le_bytes(seed))
    }

    fn seed_from_u64(state: u64) -> Self {
        Lcg48::new(state)
    }
}

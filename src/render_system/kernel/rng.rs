// seed used in place of the sample index when the random sequence is frozen
const FROZEN_SEED: u32 = 0x2545_f491;
const SAMPLE_SEED: u32 = 0x9e37_79b9;

// Construct a float with half-open range [0:1] using low 23 bits.
// All zeroes yields 0.0, all ones yields the next smallest representable value below 1.0.
#[inline]
pub fn float_construct(m: u32) -> f32 {
    const IEEE_MANTISSA: u32 = 0x007F_FFFF; // binary32 mantissa bitmask
    const IEEE_ONE: u32 = 0x3F80_0000; // 1.0 in IEEE binary32

    let m = (m & IEEE_MANTISSA) | IEEE_ONE;
    f32::from_bits(m) - 1.0
}

// accepts a seed, h, and a 32 bit integer, k, and returns a 32 bit integer
// corresponds to the loop in the murmur3 hash algorithm
// the output should be passed to murmur3_finalize before being used
#[inline]
pub fn murmur3_combine(h: u32, k: u32) -> u32 {
    let k = k.wrapping_mul(0x1b87_3593);
    let h = h ^ k;
    let h = h.rotate_left(13);
    h.wrapping_mul(5).wrapping_add(0xe654_6b64)
}

// corresponds to the last part of the murmur3 hash algorithm
#[inline]
pub fn murmur3_finalize(mut h: u32) -> u32 {
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}

/// Seed of a pixel for one frame. Frozen seeds only depend on the pixel.
pub fn pixel_seed(pixel_index: u32, sample_number: u32, freeze_random: bool) -> u32 {
    let h = if freeze_random {
        FROZEN_SEED
    } else {
        murmur3_combine(SAMPLE_SEED, sample_number)
    };
    murmur3_finalize(murmur3_combine(h, pixel_index))
}

#[derive(Clone, Debug)]
pub struct Xorshift32 {
    state: u32,
}

impl Xorshift32 {
    pub fn new(seed: u32) -> Xorshift32 {
        // zero is a fixed point of xorshift
        Xorshift32 {
            state: if seed == 0 { 0x6d2b_79f5 } else { seed },
        }
    }

    #[inline]
    pub fn next_u32(&mut self) -> u32 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.state = x;
        x
    }

    /// Uniform in [0, 1).
    #[inline]
    pub fn next_f32(&mut self) -> f32 {
        float_construct(self.next_u32())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_construct_range() {
        assert_eq!(float_construct(0), 0.0);
        assert!(float_construct(u32::MAX) < 1.0);
    }

    #[test]
    fn frozen_seed_ignores_sample_number() {
        assert_eq!(pixel_seed(17, 0, true), pixel_seed(17, 1000, true));
        assert_ne!(pixel_seed(17, 0, false), pixel_seed(17, 1, false));
        assert_ne!(pixel_seed(17, 0, true), pixel_seed(18, 0, true));
    }

    #[test]
    fn xorshift_mean_is_centered() {
        let mut rng = Xorshift32::new(pixel_seed(3, 4, false));
        let n = 100_000;
        let mean = (0..n).map(|_| rng.next_f32() as f64).sum::<f64>() / n as f64;
        assert!((mean - 0.5).abs() < 0.01);
    }

    #[test]
    fn zero_seed_does_not_stall() {
        let mut rng = Xorshift32::new(0);
        assert_ne!(rng.next_u32(), 0);
    }
}

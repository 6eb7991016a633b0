//! Raw byte mutation.
//!
//! Generic mutation of a flat byte sequence, used on the marshaled parameter
//! area, on a whole command frame, and on the bytes of individual leaves.
//!
//! | Strategy   | Weight (resizing) | Weight (fixed length) |
//! |------------|-------------------|-----------------------|
//! | flip 1 bit | 4/8               | 4/7                   |
//! | flip 2 bits| 2/8               | 2/7                   |
//! | flip 3 bits| 1/8               | 1/7                   |
//! | resize     | 1/8               | never                 |

use serde::{Deserialize, Serialize};

use crate::rng::SimRng;

/// One raw mutation strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RawStrategy {
    FlipOne,
    FlipTwo,
    FlipThree,
    Resize,
}

impl RawStrategy {
    /// Draws a strategy. `Resize` is only drawn when `may_resize` is set.
    pub fn pick(rng: &mut SimRng, may_resize: bool) -> Self {
        let slots = if may_resize { 8 } else { 7 };
        match rng.next_usize(slots) {
            0..=3 => RawStrategy::FlipOne,
            4 | 5 => RawStrategy::FlipTwo,
            6 => RawStrategy::FlipThree,
            _ => RawStrategy::Resize,
        }
    }

    /// Number of bits a flip strategy inverts.
    pub fn flipped_bits(self) -> usize {
        match self {
            RawStrategy::FlipOne => 1,
            RawStrategy::FlipTwo => 2,
            RawStrategy::FlipThree => 3,
            RawStrategy::Resize => 0,
        }
    }
}

/// Mutates a buffer with a randomly drawn strategy.
pub fn fuzz_buffer(buffer: &[u8], rng: &mut SimRng, may_resize: bool) -> (Vec<u8>, RawStrategy) {
    let strategy = RawStrategy::pick(rng, may_resize);
    (apply_strategy(buffer, strategy, rng), strategy)
}

/// Mutates a buffer with the given strategy.
pub fn apply_strategy(buffer: &[u8], strategy: RawStrategy, rng: &mut SimRng) -> Vec<u8> {
    match strategy {
        RawStrategy::Resize => {
            let old = buffer.len();
            let new_len = rng.next_usize_inclusive(1, (old * 2).max(1));
            let breakpoint = rng.next_usize(old.min(new_len));
            splice(buffer, new_len, breakpoint, rng)
        }
        flip => {
            let mut out = buffer.to_vec();
            flip_bits(&mut out, flip.flipped_bits(), rng);
            out
        }
    }
}

/// Inverts `count` distinct bits (fewer if the buffer is smaller).
pub fn flip_bits(buffer: &mut [u8], count: usize, rng: &mut SimRng) {
    let total = buffer.len() * 8;
    let count = count.min(total);
    let mut chosen: Vec<usize> = Vec::with_capacity(count);
    while chosen.len() < count {
        let bit = rng.next_usize(total);
        if !chosen.contains(&bit) {
            chosen.push(bit);
        }
    }
    for bit in chosen {
        buffer[bit / 8] ^= 1 << (bit % 8);
    }
}

/// Changes the length of `buffer` to `new_len` at `breakpoint`.
///
/// Shrinking removes the span starting at the breakpoint; growing inserts
/// random bytes there. Bytes before the breakpoint and after the changed
/// span are kept as they are. Requires `breakpoint <= min(len, new_len)`.
pub fn splice(buffer: &[u8], new_len: usize, breakpoint: usize, rng: &mut SimRng) -> Vec<u8> {
    let old = buffer.len();
    debug_assert!(breakpoint <= old.min(new_len), "breakpoint out of range");
    let mut out = Vec::with_capacity(new_len);
    out.extend_from_slice(&buffer[..breakpoint]);
    if new_len < old {
        out.extend_from_slice(&buffer[breakpoint + (old - new_len)..]);
    } else {
        out.extend_from_slice(&rng.bytes(new_len - old));
        out.extend_from_slice(&buffer[breakpoint..]);
    }
    out
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn hamming(a: &[u8], b: &[u8]) -> u32 {
        a.iter().zip(b).map(|(x, y)| (x ^ y).count_ones()).sum()
    }

    #[test]
    fn fixed_length_never_resizes() {
        let mut rng = SimRng::new(11);
        for _ in 0..2000 {
            assert_ne!(RawStrategy::pick(&mut rng, false), RawStrategy::Resize);
        }
    }

    #[test]
    fn resize_of_empty_buffer_grows_it() {
        let mut rng = SimRng::new(5);
        let out = apply_strategy(&[], RawStrategy::Resize, &mut rng);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn flips_on_empty_buffer_are_noops() {
        let mut rng = SimRng::new(5);
        assert!(apply_strategy(&[], RawStrategy::FlipThree, &mut rng).is_empty());
    }

    proptest! {
        #[test]
        fn flips_preserve_length_and_flip_exact_bits(
            buffer in proptest::collection::vec(any::<u8>(), 1..64),
            seed in any::<u64>(),
            which in 0usize..3,
        ) {
            let strategy = [RawStrategy::FlipOne, RawStrategy::FlipTwo, RawStrategy::FlipThree][which];
            let mut rng = SimRng::new(seed);
            let out = apply_strategy(&buffer, strategy, &mut rng);
            prop_assert_eq!(out.len(), buffer.len());
            let expected = strategy.flipped_bits().min(buffer.len() * 8) as u32;
            prop_assert_eq!(hamming(&out, &buffer), expected);
        }

        #[test]
        fn resize_stays_within_bounds(
            buffer in proptest::collection::vec(any::<u8>(), 0..64),
            seed in any::<u64>(),
        ) {
            let mut rng = SimRng::new(seed);
            let out = apply_strategy(&buffer, RawStrategy::Resize, &mut rng);
            prop_assert!(!out.is_empty());
            prop_assert!(out.len() <= (buffer.len() * 2).max(1));
        }

        #[test]
        fn splice_preserves_prefix_and_suffix(
            buffer in proptest::collection::vec(any::<u8>(), 1..64),
            new_len in 1usize..128,
            cut in any::<usize>(),
            seed in any::<u64>(),
        ) {
            let breakpoint = cut % buffer.len().min(new_len);
            let mut rng = SimRng::new(seed);
            let out = splice(&buffer, new_len, breakpoint, &mut rng);

            prop_assert_eq!(out.len(), new_len);
            prop_assert_eq!(&out[..breakpoint], &buffer[..breakpoint]);
            let suffix = if new_len < buffer.len() {
                buffer.len() - breakpoint - (buffer.len() - new_len)
            } else {
                buffer.len() - breakpoint
            };
            prop_assert_eq!(&out[out.len() - suffix..], &buffer[buffer.len() - suffix..]);
        }
    }
}

//! Bit-error injection for exercising the parity check: with probability
//! `error_p` percent, flip one uniformly-chosen bit in the block.

use bytes::BytesMut;
use rand::{thread_rng, Rng};

/// Returns whether a bit was flipped.
pub(crate) fn flip_random_bit(block: &mut BytesMut, error_p: u8) -> bool {
    if error_p == 0 || block.is_empty() {
        return false;
    }
    let mut rng = thread_rng();
    if rng.gen_range(0..100u32) >= u32::from(error_p) {
        return false;
    }
    let byte = rng.gen_range(0..block.len());
    let bit = rng.gen_range(0..8u8);
    block[byte] ^= 1 << bit;
    true
}

//! Block-interleaved distributed parity, RAID-5 style.
//!
//! A file is carved into stripes of `unit * (drives - 1)` bytes. Each stripe
//! is split into `drives - 1` data blocks of exactly `unit` bytes (the tail
//! zero-padded) plus one parity block, the byte-wise XOR of the data blocks.
//! Parity rotates left across the drives: stripe 0 parks it on the last
//! drive, stripe 1 one position earlier, and so on. Everything in this module
//! is pure math over byte slices; sockets live elsewhere.

use std::fmt;
use std::str::FromStr;

use bytes::{Bytes, BytesMut};

/// Permitted striping units, in bytes.
pub const STRIPING_UNITS: [usize; 4] = [128, 256, 512, 1024];

/// An array needs at least two data drives plus parity.
pub const MIN_DRIVES: usize = 3;

pub fn valid_striping_unit(unit: usize) -> bool {
    STRIPING_UNITS.contains(&unit)
}

/// What a block is to its stripe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Data,
    Parity,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Data => f.write_str("data"),
            Role::Parity => f.write_str("parity"),
        }
    }
}

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "data" => Ok(Role::Data),
            "parity" => Ok(Role::Parity),
            other => Err(UnknownRole {
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownRole {
    pub value: String,
}

impl fmt::Display for UnknownRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown block role {:?}", self.value)
    }
}

impl std::error::Error for UnknownRole {}

/// The shape of one array: drive count and striping unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub drives: usize,
    pub unit: usize,
}

impl Geometry {
    pub const fn data_blocks(&self) -> usize {
        self.drives - 1
    }

    /// Source bytes carried by one full stripe.
    pub const fn stripe_bytes(&self) -> usize {
        self.unit * self.data_blocks()
    }

    /// Stripes needed to hold `len` bytes.
    pub fn stripe_count(&self, len: u64) -> u64 {
        len.div_ceil(self.stripe_bytes() as u64)
    }

    /// Drive index holding stripe `stripe`'s parity block. Left-rotating:
    /// stripe 0 puts parity on the last drive.
    pub fn parity_position(&self, stripe: u64) -> usize {
        self.drives - 1 - (stripe as usize % self.drives)
    }
}

/// Cut one stripe's slice of the source into `drives - 1` blocks of exactly
/// `unit` bytes, zero-padding once the source runs out.
pub fn split_stripe(geometry: &Geometry, source: &[u8]) -> Vec<Bytes> {
    debug_assert!(source.len() <= geometry.stripe_bytes());

    (0..geometry.data_blocks())
        .map(|i| {
            let start = (i * geometry.unit).min(source.len());
            let end = ((i + 1) * geometry.unit).min(source.len());
            let mut block = BytesMut::with_capacity(geometry.unit);
            block.extend_from_slice(&source[start..end]);
            block.resize(geometry.unit, 0);
            block.freeze()
        })
        .collect()
}

/// Byte-wise XOR of a set of equal-length blocks.
pub fn xor_blocks<B: AsRef<[u8]>>(blocks: &[B], unit: usize) -> Bytes {
    let mut acc = BytesMut::zeroed(unit);
    for block in blocks {
        for (a, b) in acc.iter_mut().zip(block.as_ref()) {
            *a ^= *b;
        }
    }
    acc.freeze()
}

/// Pair every drive with the block it stores for this stripe: parity at
/// `parity_position(stripe)`, data blocks filling the remaining drives in
/// increasing order.
pub fn layout_stripe(
    geometry: &Geometry,
    stripe: u64,
    data: Vec<Bytes>,
    parity: Bytes,
) -> Vec<(Role, Bytes)> {
    debug_assert_eq!(data.len(), geometry.data_blocks());

    let parity_pos = geometry.parity_position(stripe);
    let mut data = data.into_iter();
    (0..geometry.drives)
        .map(|drive| {
            if drive == parity_pos {
                (Role::Parity, parity.clone())
            } else {
                (Role::Data, data.next().expect("one data block per drive"))
            }
        })
        .collect()
}

/// A stripe is intact iff the XOR of all of its blocks is the zero block,
/// which is the same check as recomputing parity and comparing.
pub fn verify_stripe<B: AsRef<[u8]>>(blocks: &[B], unit: usize) -> bool {
    xor_blocks(blocks, unit).iter().all(|byte| *byte == 0)
}

/// Rebuild the one missing block of a stripe from the survivors. Works for
/// data and parity alike: either way the missing block is the XOR of the
/// others.
pub fn reconstruct_block<B: AsRef<[u8]>>(surviving: &[B], unit: usize) -> Bytes {
    xor_blocks(surviving, unit)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry(drives: usize, unit: usize) -> Geometry {
        Geometry { drives, unit }
    }

    #[test]
    fn parity_rotates_left() {
        let g = geometry(3, 128);
        assert_eq!(g.parity_position(0), 2);
        assert_eq!(g.parity_position(1), 1);
        assert_eq!(g.parity_position(2), 0);
        assert_eq!(g.parity_position(3), 2);

        let g = geometry(5, 256);
        let positions: Vec<usize> = (0..5).map(|k| g.parity_position(k)).collect();
        assert_eq!(positions, vec![4, 3, 2, 1, 0]);
    }

    #[test]
    fn stripe_counts() {
        let g = geometry(3, 128);
        assert_eq!(g.stripe_bytes(), 256);
        assert_eq!(g.stripe_count(200), 1);
        assert_eq!(g.stripe_count(256), 1);
        assert_eq!(g.stripe_count(257), 2);
        assert_eq!(g.stripe_count(600), 3);
    }

    #[test]
    fn split_pads_the_tail_with_zeros() {
        let g = geometry(3, 4);
        let blocks = split_stripe(&g, b"abcde");
        assert_eq!(blocks.len(), 2);
        assert_eq!(&blocks[0][..], b"abcd");
        assert_eq!(&blocks[1][..], b"e\0\0\0");
    }

    #[test]
    fn split_handles_a_fully_missing_block() {
        let g = geometry(4, 4);
        let blocks = split_stripe(&g, b"abc");
        assert_eq!(&blocks[0][..], b"abc\0");
        assert_eq!(&blocks[1][..], [0u8; 4]);
        assert_eq!(&blocks[2][..], [0u8; 4]);
    }

    #[test]
    fn parity_zeroes_the_stripe() {
        let g = geometry(3, 8);
        let data = split_stripe(&g, b"hello, world?!");
        let parity = xor_blocks(&data, g.unit);

        let mut all = data.clone();
        all.push(parity);
        assert!(verify_stripe(&all, g.unit));
    }

    #[test]
    fn layout_places_parity_and_keeps_data_order() {
        let g = geometry(3, 4);
        let data = split_stripe(&g, b"aaaabbbb");
        let parity = xor_blocks(&data, g.unit);

        let placed = layout_stripe(&g, 0, data.clone(), parity.clone());
        assert_eq!(placed[0], (Role::Data, data[0].clone()));
        assert_eq!(placed[1], (Role::Data, data[1].clone()));
        assert_eq!(placed[2], (Role::Parity, parity.clone()));

        let placed = layout_stripe(&g, 1, data.clone(), parity.clone());
        assert_eq!(placed[0], (Role::Data, data[0].clone()));
        assert_eq!(placed[1], (Role::Parity, parity.clone()));
        assert_eq!(placed[2], (Role::Data, data[1].clone()));

        let placed = layout_stripe(&g, 2, data.clone(), parity);
        assert_eq!(placed[0].0, Role::Parity);
        assert_eq!(placed[1], (Role::Data, data[0].clone()));
        assert_eq!(placed[2], (Role::Data, data[1].clone()));
    }

    #[test]
    fn corruption_fails_verification() {
        let g = geometry(3, 8);
        let data = split_stripe(&g, b"0123456789abcdef");
        let parity = xor_blocks(&data, g.unit);
        let mut all = data;
        all.push(parity);

        let mut bent = all[1].to_vec();
        bent[3] ^= 0x10;
        let blocks = vec![all[0].to_vec(), bent, all[2].to_vec()];
        assert!(!verify_stripe(&blocks, g.unit));
    }

    #[test]
    fn reconstruct_recovers_data_and_parity() {
        let g = geometry(4, 8);
        let data = split_stripe(&g, b"the quick brown fox");
        let parity = xor_blocks(&data, g.unit);
        let placed = layout_stripe(&g, 2, data, parity);

        for missing in 0..g.drives {
            let surviving: Vec<&Bytes> = placed
                .iter()
                .enumerate()
                .filter(|(drive, _)| *drive != missing)
                .map(|(_, (_, block))| block)
                .collect();
            let rebuilt = reconstruct_block(&surviving, g.unit);
            assert_eq!(rebuilt, placed[missing].1, "drive {missing}");
        }
    }

    #[test]
    fn roles_round_trip_their_wire_spelling() {
        assert_eq!("data".parse::<Role>().unwrap(), Role::Data);
        assert_eq!("parity".parse::<Role>().unwrap(), Role::Parity);
        assert_eq!(Role::Data.to_string(), "data");
        assert_eq!(Role::Parity.to_string(), "parity");
        assert!("checksum".parse::<Role>().is_err());
    }

    #[test]
    fn striping_unit_whitelist() {
        for unit in STRIPING_UNITS {
            assert!(valid_striping_unit(unit));
        }
        assert!(!valid_striping_unit(200));
        assert!(!valid_striping_unit(0));
    }
}

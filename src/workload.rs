//! Workload generator
//!
//! Operations are issued in batches. A batch is one pass through the kind
//! list and every operation in it targets the same block range, so a Write
//! followed by a Read in the same batch reads back exactly what it wrote.
//! The range moves at the start of each batch: either to a random address,
//! or forward by the previous batch's count.

use crate::geometry::Geometry;
use crate::protocol::TransactKind;
use crate::rng;
use std::fmt;

/// Longest kind string that is scanned for letters
pub const MAX_KINDS: usize = 32;

/// Kinds used when none are requested
pub const DEFAULT_KINDS: [TransactKind; 2] = [TransactKind::Write, TransactKind::Read];

/// A caller-chosen value or a fresh random draw per batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pick<T> {
    Fixed(T),
    Random,
}

impl<T> Pick<T> {
    pub fn is_random(&self) -> bool {
        matches!(self, Pick::Random)
    }
}

impl fmt::Display for Pick<u64> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pick::Fixed(address) => write!(f, "{}", crate::error::split_address(*address)),
            Pick::Random => write!(f, "*"),
        }
    }
}

impl fmt::Display for Pick<u32> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pick::Fixed(count) => write!(f, "{}", count),
            Pick::Random => write!(f, "*"),
        }
    }
}

/// Translate a kind string such as `"WRFU"` into kinds
///
/// Letters are case-insensitive; anything else is skipped. Only the first
/// [`MAX_KINDS`] characters are looked at. An empty result falls back to
/// [`DEFAULT_KINDS`].
pub fn parse_kinds(letters: &str) -> Vec<TransactKind> {
    let kinds: Vec<TransactKind> = letters
        .chars()
        .take(MAX_KINDS)
        .filter_map(TransactKind::from_letter)
        .collect();
    if kinds.is_empty() {
        DEFAULT_KINDS.to_vec()
    } else {
        kinds
    }
}

/// One operation as decided by the generator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedOp {
    /// Position in the run, starting at 0
    pub index: u32,
    pub kind: TransactKind,
    pub block_address: u64,
    pub block_count: u32,
    /// First operation of a new batch
    pub batch_start: bool,
}

/// Generator state for one run
#[derive(Debug, Clone)]
pub struct Workload {
    kinds: Vec<TransactKind>,
    random_address: bool,
    random_count: bool,
    unit_blocks: u64,
    max_block_count: u32,
    op_count: u32,
    index: u32,
    cursor: usize,
    address: u64,
    count: u32,
    effective_count: u32,
}

impl Workload {
    /// Plan `op_count` operations against a unit with `geometry`
    ///
    /// An empty `kinds` uses [`DEFAULT_KINDS`]; an `op_count` of zero is
    /// treated as 1.
    pub fn new(
        geometry: &Geometry,
        kinds: &[TransactKind],
        address: Pick<u64>,
        count: Pick<u32>,
        op_count: u32,
    ) -> Self {
        let kinds = if kinds.is_empty() {
            DEFAULT_KINDS.to_vec()
        } else {
            kinds.to_vec()
        };
        Workload {
            kinds,
            random_address: address.is_random(),
            random_count: count.is_random(),
            unit_blocks: geometry.block_count,
            max_block_count: geometry.max_block_count(),
            op_count: op_count.max(1),
            index: 0,
            cursor: 0,
            address: match address {
                Pick::Fixed(a) => a,
                Pick::Random => 0,
            },
            count: match count {
                Pick::Fixed(c) => c,
                Pick::Random => 0,
            },
            effective_count: 0,
        }
    }

    pub fn kinds(&self) -> &[TransactKind] {
        &self.kinds
    }

    /// Total operations in the run
    pub fn op_count(&self) -> u32 {
        self.op_count
    }

    /// Decide the next operation, drawing from `seed` at batch boundaries
    ///
    /// Returns `None` once every operation has been planned.
    pub fn next_op(&mut self, seed: &mut u32) -> Option<PlannedOp> {
        if self.index >= self.op_count {
            return None;
        }

        let batch_start = self.cursor == 0;
        if batch_start {
            self.start_batch(seed);
        }

        let op = PlannedOp {
            index: self.index,
            kind: self.kinds[self.index as usize % self.kinds.len()],
            block_address: self.address,
            block_count: self.effective_count,
            batch_start,
        };

        self.index += 1;
        self.cursor = (self.cursor + 1) % self.kinds.len();
        Some(op)
    }

    fn start_batch(&mut self, seed: &mut u32) {
        if self.random_address {
            self.address = rng::next_u64(seed);
        } else if self.index != 0 {
            self.address = self.address.wrapping_add(self.count as u64);
        }
        self.address %= self.unit_blocks;

        if self.random_count {
            self.count = rng::next_u32(seed) % self.max_block_count;
        } else if self.count > self.max_block_count {
            self.count = self.max_block_count;
        }
        if self.count == 0 {
            self.count = 1;
        }

        // never run past the last block; address < unit_blocks here
        let remaining = self.unit_blocks - self.address;
        self.effective_count = if self.count as u64 <= remaining {
            self.count
        } else {
            remaining as u32
        };

        log::debug!(
            "batch at op {}: A={}, C={}",
            self.index,
            crate::error::split_address(self.address),
            self.effective_count
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TransactKind::{Flush, Read, Unmap, Write};

    fn geometry(block_count: u64, max_blocks: u32) -> Geometry {
        Geometry::new(block_count, 512, max_blocks * 512).unwrap()
    }

    fn plan(workload: &mut Workload, seed: &mut u32) -> Vec<(TransactKind, u64, u32)> {
        std::iter::from_fn(|| workload.next_op(seed))
            .map(|op| (op.kind, op.block_address, op.block_count))
            .collect()
    }

    #[test]
    fn test_parse_kinds() {
        assert_eq!(parse_kinds("wRfU"), vec![Write, Read, Flush, Unmap]);
        assert_eq!(parse_kinds("r-x w"), vec![Read, Write]);
        assert_eq!(parse_kinds(""), vec![Write, Read]);
        assert_eq!(parse_kinds("xyz"), vec![Write, Read]);
    }

    #[test]
    fn test_parse_kinds_scans_first_32_characters() {
        let letters = format!("{}{}", "R".repeat(32), "W");
        let kinds = parse_kinds(&letters);
        assert_eq!(kinds.len(), MAX_KINDS);
        assert!(kinds.iter().all(|&k| k == Read));
    }

    #[test]
    fn test_sequential_write_read() {
        let mut workload = Workload::new(&geometry(100, 8), &[Write, Read], Pick::Fixed(0), Pick::Fixed(2), 4);
        let mut seed = 1;
        assert_eq!(
            plan(&mut workload, &mut seed),
            vec![(Write, 0, 2), (Read, 0, 2), (Write, 2, 2), (Read, 2, 2)]
        );
        // fixed address and count never touch the generator
        assert_eq!(seed, 1);
    }

    #[test]
    fn test_zero_op_count_runs_once() {
        let mut workload = Workload::new(&geometry(100, 8), &[], Pick::Fixed(5), Pick::Fixed(1), 0);
        let mut seed = 1;
        assert_eq!(plan(&mut workload, &mut seed), vec![(Write, 5, 1)]);
    }

    #[test]
    fn test_count_clamped_to_max_transfer() {
        let mut workload = Workload::new(&geometry(100, 8), &[Write], Pick::Fixed(0), Pick::Fixed(50), 2);
        let mut seed = 1;
        assert_eq!(plan(&mut workload, &mut seed), vec![(Write, 0, 8), (Write, 8, 8)]);
    }

    #[test]
    fn test_zero_count_becomes_one() {
        let mut workload = Workload::new(&geometry(100, 8), &[Read], Pick::Fixed(3), Pick::Fixed(0), 2);
        let mut seed = 1;
        assert_eq!(plan(&mut workload, &mut seed), vec![(Read, 3, 1), (Read, 4, 1)]);
    }

    #[test]
    fn test_boundary_clamp_and_wrap() {
        // 10 blocks, count 4: 0..4, 4..8, 8..10 (clamped), then 12 % 10 = 2
        let mut workload = Workload::new(&geometry(10, 8), &[Write], Pick::Fixed(0), Pick::Fixed(4), 4);
        let mut seed = 1;
        assert_eq!(
            plan(&mut workload, &mut seed),
            vec![(Write, 0, 4), (Write, 4, 4), (Write, 8, 2), (Write, 2, 4)]
        );
    }

    #[test]
    fn test_boundary_clamp_near_top_of_address_space() {
        let huge = Geometry::new(u64::MAX, 512, 65536).unwrap();
        let mut workload = Workload::new(&huge, &[Write, Read], Pick::Fixed(u64::MAX - 2), Pick::Fixed(8), 4);
        let mut seed = 1;
        assert_eq!(
            plan(&mut workload, &mut seed),
            vec![
                (Write, u64::MAX - 2, 2),
                (Read, u64::MAX - 2, 2),
                // the advance wraps in 64 bits before the modulo
                (Write, 5, 8),
                (Read, 5, 8),
            ]
        );
    }

    #[test]
    fn test_start_address_reduced_modulo_unit() {
        let mut workload = Workload::new(&geometry(10, 8), &[Write], Pick::Fixed(25), Pick::Fixed(1), 1);
        let mut seed = 1;
        assert_eq!(plan(&mut workload, &mut seed), vec![(Write, 5, 1)]);
    }

    #[test]
    fn test_batch_holds_range() {
        let mut workload = Workload::new(
            &geometry(1000, 16),
            &[Write, Flush, Read],
            Pick::Random,
            Pick::Random,
            6,
        );
        let mut seed = 42;
        let ops: Vec<PlannedOp> = std::iter::from_fn(|| workload.next_op(&mut seed)).collect();
        assert_eq!(ops.len(), 6);
        for batch in ops.chunks(3) {
            assert!(batch[0].batch_start);
            assert!(!batch[1].batch_start && !batch[2].batch_start);
            assert!(batch
                .iter()
                .all(|op| op.block_address == batch[0].block_address && op.block_count == batch[0].block_count));
            assert_eq!(
                batch.iter().map(|op| op.kind).collect::<Vec<_>>(),
                vec![Write, Flush, Read]
            );
        }
        for op in &ops {
            assert!(op.block_count >= 1 && op.block_count <= 16);
            assert!(op.block_address + op.block_count as u64 <= 1000);
        }
    }

    #[test]
    fn test_random_draws_are_deterministic() {
        let g = geometry(1 << 20, 128);
        let mut a = Workload::new(&g, &[Write, Read], Pick::Random, Pick::Random, 50);
        let mut b = Workload::new(&g, &[Write, Read], Pick::Random, Pick::Random, 50);
        let (mut seed_a, mut seed_b) = (0xDEAD_BEEF, 0xDEAD_BEEF);
        assert_eq!(plan(&mut a, &mut seed_a), plan(&mut b, &mut seed_b));
        assert_eq!(seed_a, seed_b);
    }

    #[test]
    fn test_random_address_uses_generator() {
        let g = geometry(1000, 8);
        let mut workload = Workload::new(&g, &[Read], Pick::Random, Pick::Fixed(1), 1);
        let mut seed = 9;
        let op = workload.next_op(&mut seed).unwrap();

        let mut expected_seed = 9;
        let expected = rng::next_u64(&mut expected_seed) % 1000;
        assert_eq!(op.block_address, expected);
        assert_eq!(seed, expected_seed);
    }

    #[test]
    fn test_random_count_then_advance() {
        // fixed address advances by the drawn count of the previous batch
        let g = geometry(1 << 30, 64);
        let mut workload = Workload::new(&g, &[Write], Pick::Fixed(0), Pick::Random, 2);
        let mut seed = 3;
        let first = workload.next_op(&mut seed).unwrap();
        let second = workload.next_op(&mut seed).unwrap();
        assert_eq!(first.block_address, 0);
        assert_eq!(second.block_address, first.block_count as u64);
    }

    #[test]
    fn test_pick_display() {
        assert_eq!(Pick::Fixed(0x1_0000_0020u64).to_string(), "1:20");
        assert_eq!(Pick::<u64>::Random.to_string(), "*");
        assert_eq!(Pick::Fixed(16u32).to_string(), "16");
    }
}

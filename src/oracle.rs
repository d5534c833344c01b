//! Content oracle
//!
//! Write payloads are stamped with a pattern derived only from the block
//! address, so a later Read of the same range can be checked without keeping
//! a copy of what was written. Every 8-byte word of block `i` of an operation
//! at address `A` holds `mix(A + i + 1)` in little-endian order. A block that
//! was unmapped must read back as zeros.

use crate::error::{TransactError, TransactResult};
use byteorder::{ByteOrder, LittleEndian};
use std::fmt;

/// What a Read is checked against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyMode {
    /// Every word equals the address pattern
    AfterWrite,
    /// Every word is zero
    AfterUnmap,
}

impl fmt::Display for VerifyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerifyMode::AfterWrite => write!(f, "Write"),
            VerifyMode::AfterUnmap => write!(f, "Unmap"),
        }
    }
}

/// 64-bit finalizer from MurmurHash3
pub fn mix(mut k: u64) -> u64 {
    k ^= k >> 33;
    k = k.wrapping_mul(0xff51_afd7_ed55_8ccd);
    k ^= k >> 33;
    k = k.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    k ^= k >> 33;
    k
}

/// Pattern word for block `index` of an operation at `block_address`
pub fn pattern(block_address: u64, index: u32) -> u64 {
    mix(block_address.wrapping_add(index as u64).wrapping_add(1))
}

/// First word that did not match
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mismatch {
    pub block: u32,
    pub word: usize,
    pub expected: u64,
    pub actual: u64,
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "block {} word {}: expected {}, found {}",
            self.block,
            self.word,
            hex::encode(self.expected.to_le_bytes()),
            hex::encode(self.actual.to_le_bytes())
        )
    }
}

/// Fill the first `block_count` blocks of `buffer` with the address pattern
///
/// Trailing bytes of a block that do not make up a whole word are left
/// untouched.
pub fn stamp(buffer: &mut [u8], block_length: u32, block_address: u64, block_count: u32) {
    for (i, block) in buffer
        .chunks_exact_mut(block_length as usize)
        .take(block_count as usize)
        .enumerate()
    {
        let word = pattern(block_address, i as u32);
        for chunk in block.chunks_exact_mut(8) {
            LittleEndian::write_u64(chunk, word);
        }
    }
}

/// Check the first `block_count` blocks of `buffer` against `mode`
pub fn verify(
    buffer: &[u8],
    block_length: u32,
    block_address: u64,
    block_count: u32,
    mode: VerifyMode,
) -> Result<(), Mismatch> {
    for (i, block) in buffer
        .chunks_exact(block_length as usize)
        .take(block_count as usize)
        .enumerate()
    {
        let expected = match mode {
            VerifyMode::AfterWrite => pattern(block_address, i as u32),
            VerifyMode::AfterUnmap => 0,
        };
        for (word, chunk) in block.chunks_exact(8).enumerate() {
            let actual = LittleEndian::read_u64(chunk);
            if actual != expected {
                return Err(Mismatch {
                    block: i as u32,
                    word,
                    expected,
                    actual,
                });
            }
        }
    }
    Ok(())
}

/// [`verify`] reported as a `TransactError::Corruption`
pub fn check(
    buffer: &[u8],
    block_length: u32,
    block_address: u64,
    block_count: u32,
    mode: VerifyMode,
) -> TransactResult<()> {
    verify(buffer, block_length, block_address, block_count, mode).map_err(|mismatch| {
        TransactError::Corruption {
            mode,
            address: block_address,
            count: block_count,
            detail: mismatch.to_string(),
        }
    })
}

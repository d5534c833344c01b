//! Storage unit geometry
//!
//! The geometry is discovered once when a transport is opened (handshake on
//! the pipe transport, SCSI inquiries on the raw transport) and stays fixed
//! until the transport is closed.

use crate::error::{TransactError, TransactResult};
use crate::protocol::UNMAP_DESCRIPTOR_SIZE;
use byteorder::{ByteOrder, LittleEndian};

/// Size of the geometry handshake message in bytes
pub const GEOMETRY_SIZE: usize = 16;

/// Block count, block length and per-operation transfer limit of a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Number of addressable blocks
    pub block_count: u64,
    /// Bytes per block
    pub block_length: u32,
    /// Largest transfer a single operation may carry, in bytes
    pub max_transfer_length: u32,
}

impl Geometry {
    /// Create a geometry, checking every invariant
    ///
    /// # Errors
    ///
    /// Returns `TransactError::Device` describing the first violated invariant.
    pub fn new(block_count: u64, block_length: u32, max_transfer_length: u32) -> TransactResult<Self> {
        let geometry = Geometry {
            block_count,
            block_length,
            max_transfer_length,
        };
        geometry.validate().map_err(TransactError::Device)?;
        Ok(geometry)
    }

    /// Check the geometry invariants
    ///
    /// Returns a description of the first violation. Callers decide which
    /// error kind the violation becomes (handshake vs. discovery).
    pub fn validate(&self) -> Result<(), String> {
        if self.block_count == 0 {
            return Err("block count is zero".to_string());
        }
        if (self.block_length as usize) < UNMAP_DESCRIPTOR_SIZE {
            return Err(format!(
                "block length {} is smaller than an unmap descriptor ({} bytes)",
                self.block_length, UNMAP_DESCRIPTOR_SIZE
            ));
        }
        if self.max_transfer_length == 0 {
            return Err("max transfer length is zero".to_string());
        }
        if self.max_transfer_length % self.block_length != 0 {
            return Err(format!(
                "max transfer length {} is not a multiple of block length {}",
                self.max_transfer_length, self.block_length
            ));
        }
        Ok(())
    }

    /// Largest block count a single operation may carry
    pub fn max_block_count(&self) -> u32 {
        self.max_transfer_length / self.block_length
    }

    /// Byte length of `block_count` blocks
    pub fn byte_length(&self, block_count: u32) -> usize {
        block_count as usize * self.block_length as usize
    }

    /// Byte offset of a block address
    pub fn byte_offset(&self, block_address: u64) -> u64 {
        block_address.wrapping_mul(self.block_length as u64)
    }

    /// Allocate a zeroed buffer of `header` bytes plus one maximum transfer
    ///
    /// # Errors
    ///
    /// Returns `TransactError::Resource` if the allocation cannot be satisfied.
    pub fn transfer_buffer(&self, header: usize) -> TransactResult<Vec<u8>> {
        let len = header + self.max_transfer_length as usize;
        let mut buf = Vec::new();
        buf.try_reserve_exact(len).map_err(|e| {
            TransactError::Resource(format!("cannot allocate {} byte buffer: {}", len, e))
        })?;
        buf.resize(len, 0);
        Ok(buf)
    }

    /// Parse the handshake message
    ///
    /// Only the length is checked here; invariants are checked by `validate`.
    pub fn from_bytes(buf: &[u8]) -> TransactResult<Self> {
        if buf.len() < GEOMETRY_SIZE {
            return Err(TransactError::Protocol(format!(
                "handshake: got {} bytes, need {}",
                buf.len(),
                GEOMETRY_SIZE
            )));
        }
        Ok(Geometry {
            block_count: LittleEndian::read_u64(&buf[0..8]),
            block_length: LittleEndian::read_u32(&buf[8..12]),
            max_transfer_length: LittleEndian::read_u32(&buf[12..16]),
        })
    }

    /// Serialize to the handshake message layout
    pub fn to_bytes(&self) -> [u8; GEOMETRY_SIZE] {
        let mut buf = [0u8; GEOMETRY_SIZE];
        LittleEndian::write_u64(&mut buf[0..8], self.block_count);
        LittleEndian::write_u32(&mut buf[8..12], self.block_length);
        LittleEndian::write_u32(&mut buf[12..16], self.max_transfer_length);
        buf
    }
}

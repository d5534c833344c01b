//! SCSI passthrough interface and geometry discovery
//!
//! The raw transport never frames requests itself; it talks to the device
//! through plain positioned I/O plus a handful of SCSI commands issued via a
//! passthrough primitive. This module builds those commands, decodes their
//! parameter data and sense data, and reconstructs the unit geometry from
//! READ CAPACITY (16) and the Block Limits VPD page.

use crate::error::{TransactError, TransactResult};
use crate::geometry::Geometry;
use crate::protocol::{UnmapDescriptor, UNMAP_DESCRIPTOR_SIZE};
use byteorder::{BigEndian, ByteOrder};
use std::fmt;

/// Maximum transfer length assumed when the Block Limits page reports none
pub const DEFAULT_MAX_TRANSFER_LENGTH: u32 = 64 * 1024;

/// Allocation length used for discovery commands
const DISCOVERY_ALLOCATION_LENGTH: usize = 255;

/// SCSI command opcodes used by the client
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScsiOpcode {
    Inquiry = 0x12,
    Unmap = 0x42,
    SynchronizeCache16 = 0x91,
    /// READ CAPACITY (16) is a service action of this opcode
    ServiceActionIn16 = 0x9E,
}

impl ScsiOpcode {
    pub fn from_u8(val: u8) -> Option<Self> {
        match val {
            0x12 => Some(ScsiOpcode::Inquiry),
            0x42 => Some(ScsiOpcode::Unmap),
            0x91 => Some(ScsiOpcode::SynchronizeCache16),
            0x9E => Some(ScsiOpcode::ServiceActionIn16),
            _ => None,
        }
    }
}

/// SERVICE ACTION IN (16) service action for READ CAPACITY (16)
pub const SERVICE_ACTION_READ_CAPACITY16: u8 = 0x10;

/// Block Limits VPD page
pub mod vpd {
    pub const BLOCK_LIMITS: u8 = 0xB0;
}

pub mod scsi_status {
    pub const GOOD: u8 = 0x00;
    pub const CHECK_CONDITION: u8 = 0x02;
}

/// Sense keys the client and its test devices report
pub mod sense_key {
    pub const MEDIUM_ERROR: u8 = 0x03;
    pub const ILLEGAL_REQUEST: u8 = 0x05;
}

pub mod asc {
    pub const INVALID_COMMAND_OPERATION_CODE: u8 = 0x20;
    pub const LBA_OUT_OF_RANGE: u8 = 0x21;
    pub const INVALID_FIELD_IN_CDB: u8 = 0x24;
}

/// Decoded SCSI sense data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenseData {
    pub sense_key: u8,
    pub asc: u8,
    pub ascq: u8,
    pub information: Option<u64>,
}

impl SenseData {
    pub fn new(sense_key: u8, asc: u8, ascq: u8) -> Self {
        SenseData {
            sense_key,
            asc,
            ascq,
            information: None,
        }
    }

    pub fn with_info(mut self, info: u64) -> Self {
        self.information = Some(info);
        self
    }

    /// Decode fixed (0x70/0x71) or descriptor (0x72/0x73) format sense data
    ///
    /// Returns `None` for empty or unrecognized buffers.
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        let response_code = buf.first()? & 0x7F;
        match response_code {
            0x70 | 0x71 => {
                if buf.len() < 14 {
                    return None;
                }
                let valid = buf[0] & 0x80 != 0;
                let mut sense = SenseData::new(buf[2] & 0x0F, buf[12], buf[13]);
                if valid {
                    sense.information = Some(BigEndian::read_u32(&buf[3..7]) as u64);
                }
                Some(sense)
            }
            0x72 | 0x73 => {
                if buf.len() < 4 {
                    return None;
                }
                let mut sense = SenseData::new(buf[1] & 0x0F, buf[2], buf[3]);
                // Walk descriptors looking for the Information descriptor (type 0x00).
                let additional = buf.get(7).copied().unwrap_or(0) as usize;
                let end = (8 + additional).min(buf.len());
                let mut at = 8;
                while at + 2 <= end {
                    let kind = buf[at];
                    let len = buf[at + 1] as usize;
                    if kind == 0x00 && len >= 0x0A && at + 12 <= end {
                        sense.information = Some(BigEndian::read_u64(&buf[at + 4..at + 12]));
                        break;
                    }
                    at += 2 + len;
                }
                Some(sense)
            }
            _ => None,
        }
    }

    /// Serialize to fixed format sense data (18 bytes)
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut data = vec![0u8; 18];
        data[0] = 0x70;
        if let Some(info) = self.information {
            data[0] |= 0x80;
            BigEndian::write_u32(&mut data[3..7], info as u32);
        }

        data[2] = self.sense_key & 0x0F;
        data[7] = 10;

        data[12] = self.asc;
        data[13] = self.ascq;

        data
    }
}

impl fmt::Display for SenseData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sense key 0x{:x}, ASC/ASCQ 0x{:02x}/0x{:02x}", self.sense_key, self.asc, self.ascq)?;
        if let Some(info) = self.information {
            write!(f, ", information 0x{:x}", info)?;
        }
        Ok(())
    }
}

/// Data transfer direction of a passthrough command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataDirection {
    None,
    ToDevice,
    FromDevice,
}

/// Result of a passthrough command
#[derive(Debug, Clone, Default)]
pub struct ScsiOutcome {
    /// SCSI status byte
    pub status: u8,
    /// Raw sense bytes returned with the status (empty when none)
    pub sense: Vec<u8>,
    /// Bytes actually transferred
    pub transferred: usize,
}

impl ScsiOutcome {
    pub fn good(transferred: usize) -> Self {
        ScsiOutcome {
            status: scsi_status::GOOD,
            sense: Vec::new(),
            transferred,
        }
    }

    pub fn check_condition(sense: SenseData) -> Self {
        ScsiOutcome {
            status: scsi_status::CHECK_CONDITION,
            sense: sense.to_bytes(),
            transferred: 0,
        }
    }

    pub fn is_good(&self) -> bool {
        self.status == scsi_status::GOOD
    }

    pub fn sense_data(&self) -> Option<SenseData> {
        SenseData::from_bytes(&self.sense)
    }

    fn describe(&self) -> String {
        match self.sense_data() {
            Some(sense) => format!("status 0x{:02x} ({})", self.status, sense),
            None => format!("status 0x{:02x}", self.status),
        }
    }
}

/// SCSI passthrough primitive
///
/// Executes one command descriptor block against a device. `buffer` is the
/// data-in or data-out buffer according to `direction`. Transport-level
/// failures are `Err`; SCSI-level failures are an `Ok` outcome with a
/// non-GOOD status.
pub trait ScsiPassthrough {
    fn execute(
        &mut self,
        cdb: &[u8],
        direction: DataDirection,
        buffer: &mut [u8],
    ) -> std::io::Result<ScsiOutcome>;
}

/// READ CAPACITY (16) CDB
pub fn read_capacity16_cdb(allocation_length: u32) -> [u8; 16] {
    let mut cdb = [0u8; 16];
    cdb[0] = ScsiOpcode::ServiceActionIn16 as u8;
    cdb[1] = SERVICE_ACTION_READ_CAPACITY16;
    BigEndian::write_u32(&mut cdb[10..14], allocation_length);
    cdb
}

/// INQUIRY CDB requesting a vital product data page
pub fn inquiry_vpd_cdb(page_code: u8, allocation_length: u16) -> [u8; 6] {
    let mut cdb = [0u8; 6];
    cdb[0] = ScsiOpcode::Inquiry as u8;
    cdb[1] = 0x01; // EVPD
    cdb[2] = page_code;
    BigEndian::write_u16(&mut cdb[3..5], allocation_length);
    cdb
}

/// SYNCHRONIZE CACHE (16) CDB for a block range
pub fn synchronize_cache16_cdb(lba: u64, blocks: u32) -> [u8; 16] {
    let mut cdb = [0u8; 16];
    cdb[0] = ScsiOpcode::SynchronizeCache16 as u8;
    BigEndian::write_u64(&mut cdb[2..10], lba);
    BigEndian::write_u32(&mut cdb[10..14], blocks);
    cdb
}

/// UNMAP CDB announcing a parameter list of `parameter_length` bytes
pub fn unmap_cdb(parameter_length: u16) -> [u8; 10] {
    let mut cdb = [0u8; 10];
    cdb[0] = ScsiOpcode::Unmap as u8;
    BigEndian::write_u16(&mut cdb[7..9], parameter_length);
    cdb
}

/// UNMAP parameter list: an 8-byte header followed by 16-byte block descriptors
pub fn unmap_parameter_list(descriptors: &[UnmapDescriptor]) -> TransactResult<Vec<u8>> {
    let descriptor_bytes = descriptors.len() * UNMAP_DESCRIPTOR_SIZE;
    let total = 8 + descriptor_bytes;
    if total > u16::MAX as usize {
        return Err(TransactError::Unsupported(format!(
            "{} unmap descriptors exceed one UNMAP parameter list",
            descriptors.len()
        )));
    }
    let mut data = vec![0u8; total];
    BigEndian::write_u16(&mut data[0..2], (total - 2) as u16);
    BigEndian::write_u16(&mut data[2..4], descriptor_bytes as u16);
    for (chunk, descriptor) in data[8..].chunks_exact_mut(UNMAP_DESCRIPTOR_SIZE).zip(descriptors) {
        BigEndian::write_u64(&mut chunk[0..8], descriptor.block_address);
        BigEndian::write_u32(&mut chunk[8..12], descriptor.block_count);
    }
    Ok(data)
}

/// Decode READ CAPACITY (16) parameter data into (last LBA, block length)
pub fn parse_read_capacity16(data: &[u8]) -> TransactResult<(u64, u32)> {
    if data.len() < 12 {
        return Err(TransactError::Device(format!(
            "READ CAPACITY (16) returned {} bytes, need 12",
            data.len()
        )));
    }
    Ok((BigEndian::read_u64(&data[0..8]), BigEndian::read_u32(&data[8..12])))
}

/// Decode MAXIMUM TRANSFER LENGTH (in blocks) from the Block Limits VPD page
///
/// A page too short to carry the field reports zero, which means "no limit
/// reported".
pub fn parse_block_limits(data: &[u8]) -> TransactResult<u32> {
    if data.len() >= 2 && data[1] != vpd::BLOCK_LIMITS {
        return Err(TransactError::Device(format!(
            "INQUIRY returned VPD page 0x{:02x}, expected 0x{:02x}",
            data[1],
            vpd::BLOCK_LIMITS
        )));
    }
    if data.len() < 12 {
        return Ok(0);
    }
    Ok(BigEndian::read_u32(&data[8..12]))
}

/// Run one discovery command and require GOOD status
fn execute_in<P: ScsiPassthrough + ?Sized>(
    device: &mut P,
    cdb: &[u8],
    buffer: &mut [u8],
    what: &str,
) -> TransactResult<usize> {
    let outcome = device
        .execute(cdb, DataDirection::FromDevice, buffer)
        .map_err(TransactError::Io)?;
    if !outcome.is_good() {
        return Err(TransactError::Device(format!("{} failed: {}", what, outcome.describe())));
    }
    Ok(outcome.transferred.min(buffer.len()))
}

/// Discover the geometry of a raw SCSI device
///
/// Issues READ CAPACITY (16) and INQUIRY for the Block Limits page. A device
/// that reports no maximum transfer length gets
/// [`DEFAULT_MAX_TRANSFER_LENGTH`] bytes, rounded down to whole blocks.
///
/// # Errors
///
/// `TransactError::Device` when either command does not complete with GOOD
/// status or the resulting geometry is invalid; `TransactError::Io` when the
/// passthrough itself fails.
pub fn discover_geometry<P: ScsiPassthrough + ?Sized>(device: &mut P) -> TransactResult<Geometry> {
    let mut data = [0u8; DISCOVERY_ALLOCATION_LENGTH];

    let cdb = read_capacity16_cdb(DISCOVERY_ALLOCATION_LENGTH as u32);
    let len = execute_in(device, &cdb, &mut data, "READ CAPACITY (16)")?;
    let (last_lba, block_length) = parse_read_capacity16(&data[..len])?;
    let block_count = last_lba.wrapping_add(1);
    if block_count == 0 || block_length == 0 {
        return Err(TransactError::Device(format!(
            "device reports {} blocks of {} bytes",
            block_count, block_length
        )));
    }

    data.fill(0);
    let cdb = inquiry_vpd_cdb(vpd::BLOCK_LIMITS, DISCOVERY_ALLOCATION_LENGTH as u16);
    let len = execute_in(device, &cdb, &mut data, "INQUIRY (Block Limits)")?;
    let max_blocks = parse_block_limits(&data[..len])?;

    // Keep the limit a whole number of blocks that still fits in 32 bits.
    let max_transfer_length = if max_blocks == 0 {
        (DEFAULT_MAX_TRANSFER_LENGTH / block_length).max(1) as u64 * block_length as u64
    } else {
        (max_blocks as u64 * block_length as u64).min(u32::MAX as u64 / block_length as u64 * block_length as u64)
    };

    log::debug!(
        "Discovered {} blocks of {} bytes, max transfer {} blocks",
        block_count,
        block_length,
        max_blocks
    );

    Geometry::new(block_count, block_length, max_transfer_length as u32)
}

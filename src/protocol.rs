//! Transact wire protocol
//!
//! Requests and responses travel as single messages made of a fixed 48-byte
//! frame header optionally followed by a data payload (write data or unmap
//! descriptors for requests, read data for responses). All integers are
//! little-endian.
//!
//! ```text
//! Request header                         Response header
//!  0  Hint (u64)                          0  Hint (u64)
//!  8  Kind (u8)                           8  Kind (u8)
//!  9  reserved                            9  reserved
//! 16  BlockAddress (u64) | UnmapCount     16 ScsiStatus SenseKey ASC ASCQ
//! 24  BlockCount (u32)                    20 reserved
//! 28  Flags (u32, bit 0 = FUA)            24 Information (u64)
//! 32  reserved                            32 reserved
//!                                         40 Flags (u32, bit 3 = info valid)
//! 48  payload ...                         48 read data ...
//! ```

use crate::error::{TransactError, TransactResult};
use crate::geometry::Geometry;
use crate::scsi::scsi_status;
use byteorder::{ByteOrder, LittleEndian};
use std::fmt;

/// Size of the frame header shared by requests and responses
pub const FRAME_HEADER_SIZE: usize = 48;

/// Size of one unmap descriptor on the wire
pub const UNMAP_DESCRIPTOR_SIZE: usize = 16;

const FLAG_FORCE_UNIT_ACCESS: u32 = 0x01;
const FLAG_INFORMATION_VALID: u32 = 0x08;

/// Operation kind carried in byte 8 of every frame
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactKind {
    Reserved = 0,
    Read = 1,
    Write = 2,
    Flush = 3,
    Unmap = 4,
}

impl TransactKind {
    pub fn from_u8(val: u8) -> Option<Self> {
        match val {
            0 => Some(TransactKind::Reserved),
            1 => Some(TransactKind::Read),
            2 => Some(TransactKind::Write),
            3 => Some(TransactKind::Flush),
            4 => Some(TransactKind::Unmap),
            _ => None,
        }
    }

    /// Map a workload letter (R, W, F, U; any case) to its kind
    pub fn from_letter(c: char) -> Option<Self> {
        match c.to_ascii_uppercase() {
            'R' => Some(TransactKind::Read),
            'W' => Some(TransactKind::Write),
            'F' => Some(TransactKind::Flush),
            'U' => Some(TransactKind::Unmap),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TransactKind::Reserved => "Reserved",
            TransactKind::Read => "Read",
            TransactKind::Write => "Write",
            TransactKind::Flush => "Flush",
            TransactKind::Unmap => "Unmap",
        }
    }
}

impl fmt::Display for TransactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Kind-specific request payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Read {
        block_address: u64,
        block_count: u32,
        force_unit_access: bool,
    },
    Write {
        block_address: u64,
        block_count: u32,
        force_unit_access: bool,
    },
    Flush {
        block_address: u64,
        block_count: u32,
    },
    Unmap {
        descriptor_count: u32,
    },
    Reserved,
}

/// A transact request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    /// Correlation token echoed by the service
    pub hint: u64,
    pub operation: Operation,
}

impl Request {
    pub fn new(hint: u64, operation: Operation) -> Self {
        Request { hint, operation }
    }

    pub fn kind(&self) -> TransactKind {
        match self.operation {
            Operation::Read { .. } => TransactKind::Read,
            Operation::Write { .. } => TransactKind::Write,
            Operation::Flush { .. } => TransactKind::Flush,
            Operation::Unmap { .. } => TransactKind::Unmap,
            Operation::Reserved => TransactKind::Reserved,
        }
    }

    /// Bytes of out-of-band data that travel with this request
    ///
    /// Write carries its block data, Unmap its descriptor array; every other
    /// kind carries nothing.
    pub fn payload_length(&self, geometry: &Geometry) -> usize {
        match self.operation {
            Operation::Write { block_count, .. } => geometry.byte_length(block_count),
            Operation::Unmap { descriptor_count } => descriptor_count as usize * UNMAP_DESCRIPTOR_SIZE,
            _ => 0,
        }
    }

    /// Bytes of read data the caller expects back
    pub fn read_length(&self, geometry: &Geometry) -> usize {
        match self.operation {
            Operation::Read { block_count, .. } => geometry.byte_length(block_count),
            _ => 0,
        }
    }

    /// Serialize the frame header
    pub fn to_bytes(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        LittleEndian::write_u64(&mut buf[0..8], self.hint);
        buf[8] = self.kind() as u8;
        match self.operation {
            Operation::Read {
                block_address,
                block_count,
                force_unit_access,
            }
            | Operation::Write {
                block_address,
                block_count,
                force_unit_access,
            } => {
                LittleEndian::write_u64(&mut buf[16..24], block_address);
                LittleEndian::write_u32(&mut buf[24..28], block_count);
                let flags = if force_unit_access { FLAG_FORCE_UNIT_ACCESS } else { 0 };
                LittleEndian::write_u32(&mut buf[28..32], flags);
            }
            Operation::Flush {
                block_address,
                block_count,
            } => {
                LittleEndian::write_u64(&mut buf[16..24], block_address);
                LittleEndian::write_u32(&mut buf[24..28], block_count);
            }
            Operation::Unmap { descriptor_count } => {
                LittleEndian::write_u32(&mut buf[16..20], descriptor_count);
            }
            Operation::Reserved => {}
        }
        buf
    }

    /// Parse a frame header
    ///
    /// The client never receives requests; this exists for services and test
    /// doubles speaking the same protocol.
    pub fn from_bytes(buf: &[u8]) -> TransactResult<Self> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Err(TransactError::Protocol(format!(
                "request frame too short: {} bytes, need {}",
                buf.len(),
                FRAME_HEADER_SIZE
            )));
        }
        let hint = LittleEndian::read_u64(&buf[0..8]);
        let kind = TransactKind::from_u8(buf[8]).ok_or_else(|| {
            TransactError::Protocol(format!("unknown request kind 0x{:02x}", buf[8]))
        })?;
        let block_address = LittleEndian::read_u64(&buf[16..24]);
        let block_count = LittleEndian::read_u32(&buf[24..28]);
        let force_unit_access = LittleEndian::read_u32(&buf[28..32]) & FLAG_FORCE_UNIT_ACCESS != 0;
        let operation = match kind {
            TransactKind::Read => Operation::Read {
                block_address,
                block_count,
                force_unit_access,
            },
            TransactKind::Write => Operation::Write {
                block_address,
                block_count,
                force_unit_access,
            },
            TransactKind::Flush => Operation::Flush {
                block_address,
                block_count,
            },
            TransactKind::Unmap => Operation::Unmap {
                descriptor_count: LittleEndian::read_u32(&buf[16..20]),
            },
            TransactKind::Reserved => Operation::Reserved,
        };
        Ok(Request { hint, operation })
    }
}

/// A block range to deallocate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnmapDescriptor {
    pub block_address: u64,
    pub block_count: u32,
}

impl UnmapDescriptor {
    pub fn new(block_address: u64, block_count: u32) -> Self {
        UnmapDescriptor {
            block_address,
            block_count,
        }
    }

    /// Serialize into `buf`, which must hold at least one descriptor
    pub fn write_to(&self, buf: &mut [u8]) {
        LittleEndian::write_u64(&mut buf[0..8], self.block_address);
        LittleEndian::write_u32(&mut buf[8..12], self.block_count);
        // reserved
        LittleEndian::write_u32(&mut buf[12..16], 0);
    }

    pub fn from_bytes(buf: &[u8]) -> TransactResult<Self> {
        if buf.len() < UNMAP_DESCRIPTOR_SIZE {
            return Err(TransactError::Protocol(format!(
                "unmap descriptor too short: {} bytes",
                buf.len()
            )));
        }
        Ok(UnmapDescriptor {
            block_address: LittleEndian::read_u64(&buf[0..8]),
            block_count: LittleEndian::read_u32(&buf[8..12]),
        })
    }

    /// Parse `count` consecutive descriptors from a payload
    pub fn parse_list(buf: &[u8], count: u32) -> TransactResult<Vec<Self>> {
        let needed = count as usize * UNMAP_DESCRIPTOR_SIZE;
        if buf.len() < needed {
            return Err(TransactError::Protocol(format!(
                "unmap payload too short: {} bytes for {} descriptors",
                buf.len(),
                count
            )));
        }
        buf[..needed]
            .chunks_exact(UNMAP_DESCRIPTOR_SIZE)
            .map(UnmapDescriptor::from_bytes)
            .collect()
    }
}

/// Completion status of a transact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransactStatus {
    pub scsi_status: u8,
    pub sense_key: u8,
    pub asc: u8,
    pub ascq: u8,
    pub information: u64,
    pub information_valid: bool,
}

impl TransactStatus {
    pub fn good() -> Self {
        TransactStatus::default()
    }

    pub fn is_good(&self) -> bool {
        self.scsi_status == scsi_status::GOOD
    }
}

impl fmt::Display for TransactStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "status=0x{:02x} sense={:x}/{:02x}/{:02x}",
            self.scsi_status, self.sense_key, self.asc, self.ascq
        )
    }
}

/// A transact response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response {
    pub hint: u64,
    pub kind: TransactKind,
    pub status: TransactStatus,
}

impl Response {
    /// A GOOD completion echoing the request's hint and kind
    pub fn good_for(request: &Request) -> Self {
        Response {
            hint: request.hint,
            kind: request.kind(),
            status: TransactStatus::good(),
        }
    }

    /// Serialize the frame header
    pub fn to_bytes(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        LittleEndian::write_u64(&mut buf[0..8], self.hint);
        buf[8] = self.kind as u8;
        buf[16] = self.status.scsi_status;
        buf[17] = self.status.sense_key;
        buf[18] = self.status.asc;
        buf[19] = self.status.ascq;
        LittleEndian::write_u64(&mut buf[24..32], self.status.information);
        let flags = if self.status.information_valid { FLAG_INFORMATION_VALID } else { 0 };
        LittleEndian::write_u32(&mut buf[40..44], flags);
        buf
    }

    /// Parse a frame header
    pub fn from_bytes(buf: &[u8]) -> TransactResult<Self> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Err(TransactError::Protocol(format!(
                "mismatched frame: {} bytes, need at least {}",
                buf.len(),
                FRAME_HEADER_SIZE
            )));
        }
        let kind = TransactKind::from_u8(buf[8]).ok_or_else(|| {
            TransactError::Protocol(format!("unknown response kind 0x{:02x}", buf[8]))
        })?;
        Ok(Response {
            hint: LittleEndian::read_u64(&buf[0..8]),
            kind,
            status: TransactStatus {
                scsi_status: buf[16],
                sense_key: buf[17],
                asc: buf[18],
                ascq: buf[19],
                information: LittleEndian::read_u64(&buf[24..32]),
                information_valid: LittleEndian::read_u32(&buf[40..44]) & FLAG_INFORMATION_VALID != 0,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry() -> Geometry {
        Geometry::new(100, 512, 4096).unwrap()
    }

    #[test]
    fn test_kind_letters() {
        assert_eq!(TransactKind::from_letter('r'), Some(TransactKind::Read));
        assert_eq!(TransactKind::from_letter('W'), Some(TransactKind::Write));
        assert_eq!(TransactKind::from_letter('f'), Some(TransactKind::Flush));
        assert_eq!(TransactKind::from_letter('U'), Some(TransactKind::Unmap));
        assert_eq!(TransactKind::from_letter('x'), None);
    }

    #[test]
    fn test_write_request_layout() {
        let req = Request::new(
            0xAABB_CCDD_0000_0005,
            Operation::Write {
                block_address: 0x10,
                block_count: 3,
                force_unit_access: true,
            },
        );
        let bytes = req.to_bytes();
        assert_eq!(&bytes[0..8], &0xAABB_CCDD_0000_0005u64.to_le_bytes());
        assert_eq!(bytes[8], 2);
        assert_eq!(&bytes[16..24], &0x10u64.to_le_bytes());
        assert_eq!(&bytes[24..28], &3u32.to_le_bytes());
        assert_eq!(bytes[28], 1);
        assert!(bytes[32..].iter().all(|&b| b == 0));
        assert_eq!(Request::from_bytes(&bytes).unwrap(), req);
    }

    #[test]
    fn test_unmap_request_layout() {
        let req = Request::new(7, Operation::Unmap { descriptor_count: 2 });
        let bytes = req.to_bytes();
        assert_eq!(bytes[8], 4);
        assert_eq!(&bytes[16..20], &2u32.to_le_bytes());
        assert_eq!(req.payload_length(&geometry()), 32);
    }

    #[test]
    fn test_payload_lengths() {
        let g = geometry();
        let write = Request::new(1, Operation::Write { block_address: 0, block_count: 4, force_unit_access: false });
        let read = Request::new(1, Operation::Read { block_address: 0, block_count: 4, force_unit_access: false });
        let flush = Request::new(1, Operation::Flush { block_address: 0, block_count: 4 });
        assert_eq!(write.payload_length(&g), 2048);
        assert_eq!(read.payload_length(&g), 0);
        assert_eq!(read.read_length(&g), 2048);
        assert_eq!(flush.payload_length(&g), 0);
    }

    #[test]
    fn test_response_with_sense() {
        let rsp = Response {
            hint: 42,
            kind: TransactKind::Read,
            status: TransactStatus {
                scsi_status: scsi_status::CHECK_CONDITION,
                sense_key: 0x03,
                asc: 0x11,
                ascq: 0x00,
                information: 0x1234,
                information_valid: true,
            },
        };
        let bytes = rsp.to_bytes();
        assert_eq!(bytes[16], 0x02);
        assert_eq!(bytes[40], 0x08);
        let parsed = Response::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, rsp);
        assert!(!parsed.status.is_good());
    }

    #[test]
    fn test_short_response_rejected() {
        let err = Response::from_bytes(&[0u8; FRAME_HEADER_SIZE - 1]).unwrap_err();
        assert!(matches!(err, TransactError::Protocol(_)));
    }

    #[test]
    fn test_unknown_response_kind_rejected() {
        let mut bytes = Response::good_for(&Request::new(1, Operation::Reserved)).to_bytes();
        bytes[8] = 9;
        assert!(Response::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_unmap_descriptors() {
        let mut buf = [0xFFu8; 32];
        UnmapDescriptor::new(5, 9).write_to(&mut buf[0..16]);
        UnmapDescriptor::new(u64::MAX, 1).write_to(&mut buf[16..32]);
        assert!(buf[12..16].iter().all(|&b| b == 0));
        let list = UnmapDescriptor::parse_list(&buf, 2).unwrap();
        assert_eq!(list, vec![UnmapDescriptor::new(5, 9), UnmapDescriptor::new(u64::MAX, 1)]);
        assert!(UnmapDescriptor::parse_list(&buf, 3).is_err());
    }
}

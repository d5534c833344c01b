//! Raw transport
//!
//! Drives a SCSI block device directly. There is no framing: Read and Write
//! become positioned I/O on the device node, and the geometry comes from two
//! SCSI inquiries instead of a handshake. Responses are synthesized locally.
//!
//! Flush and Unmap have no positioned-I/O equivalent. They are translated to
//! SYNCHRONIZE CACHE (16) and UNMAP and sent through the SCSI passthrough, so
//! the response reports whatever status the device returned for them.

use crate::completion;
use crate::error::{TransactError, TransactResult};
use crate::geometry::Geometry;
use crate::protocol::{Operation, Request, Response, TransactStatus, UnmapDescriptor};
use crate::scsi::{self, DataDirection, ScsiOutcome, ScsiPassthrough};
use std::fs::File;
use std::io;
use std::path::Path;

/// A block device reachable through positioned I/O and SCSI passthrough
pub trait RawDevice: ScsiPassthrough {
    /// Read into `buf` starting at byte `offset`, returning the bytes read
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    /// Write `buf` starting at byte `offset`, returning the bytes written
    fn write_at(&mut self, buf: &[u8], offset: u64) -> io::Result<usize>;

    /// Release the device handle
    fn close(self) -> io::Result<()>
    where
        Self: Sized;
}

/// A device node opened for read/write
#[derive(Debug)]
pub struct BlockDeviceFile {
    file: File,
}

impl BlockDeviceFile {
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = std::fs::OpenOptions::new().read(true).write(true).open(path)?;
        Ok(BlockDeviceFile { file })
    }
}

impl ScsiPassthrough for BlockDeviceFile {
    #[cfg(target_os = "linux")]
    fn execute(
        &mut self,
        cdb: &[u8],
        direction: DataDirection,
        buffer: &mut [u8],
    ) -> io::Result<ScsiOutcome> {
        use std::os::fd::AsRawFd;
        crate::sg::execute(self.file.as_raw_fd(), cdb, direction, buffer)
    }

    #[cfg(not(target_os = "linux"))]
    fn execute(
        &mut self,
        _cdb: &[u8],
        _direction: DataDirection,
        _buffer: &mut [u8],
    ) -> io::Result<ScsiOutcome> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "SCSI passthrough is only available on Linux",
        ))
    }
}

#[cfg(unix)]
impl RawDevice for BlockDeviceFile {
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        std::os::unix::fs::FileExt::read_at(&self.file, buf, offset)
    }

    fn write_at(&mut self, buf: &[u8], offset: u64) -> io::Result<usize> {
        std::os::unix::fs::FileExt::write_at(&self.file, buf, offset)
    }

    fn close(self) -> io::Result<()> {
        use std::os::fd::IntoRawFd;
        let fd = self.file.into_raw_fd();
        if unsafe { libc::close(fd) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

/// Client end of the raw transport
pub struct RawTransport<D: RawDevice> {
    device: D,
    geometry: Geometry,
}

#[cfg(unix)]
impl RawTransport<BlockDeviceFile> {
    /// Open the device at `path` and discover its geometry
    ///
    /// # Errors
    ///
    /// `TransactError::Connect` if the device cannot be opened;
    /// `TransactError::Device` if discovery fails.
    pub fn open<P: AsRef<Path>>(path: P) -> TransactResult<Self> {
        let path = path.as_ref();
        let device = BlockDeviceFile::open(path).map_err(TransactError::Connect)?;
        log::info!("Opened raw device {}", path.display());
        Self::new(device)
    }
}

impl<D: RawDevice> RawTransport<D> {
    /// Discover the geometry of an already opened device
    ///
    /// The device is dropped if discovery fails.
    pub fn new(mut device: D) -> TransactResult<Self> {
        let geometry = scsi::discover_geometry(&mut device)?;
        log::info!(
            "Unit geometry: {} blocks x {} bytes, max transfer {} bytes",
            geometry.block_count,
            geometry.block_length,
            geometry.max_transfer_length
        );
        Ok(RawTransport { device, geometry })
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Perform one operation against the device
    ///
    /// Read and Write always complete with GOOD status or fail with an error.
    /// Flush and Unmap return the device's own SCSI status.
    ///
    /// # Errors
    ///
    /// `TransactError::Protocol` when the transfer does not fit `buffer` or the
    /// per-device maximum, `TransactError::Io` when the device I/O fails or is
    /// short, `TransactError::Unsupported` for the Reserved kind.
    pub fn transact(&mut self, request: &Request, buffer: &mut [u8]) -> TransactResult<Response> {
        match request.operation {
            Operation::Read {
                block_address,
                block_count,
                ..
            } => {
                let (offset, len) = self.extent(block_address, block_count, buffer.len())?;
                let device = &mut self.device;
                completion::wait_exact(len, || device.read_at(&mut buffer[..len], offset))?;
                Ok(Response::good_for(request))
            }
            Operation::Write {
                block_address,
                block_count,
                ..
            } => {
                let (offset, len) = self.extent(block_address, block_count, buffer.len())?;
                let device = &mut self.device;
                completion::wait_exact(len, || device.write_at(&buffer[..len], offset))?;
                Ok(Response::good_for(request))
            }
            Operation::Flush {
                block_address,
                block_count,
            } => {
                let cdb = scsi::synchronize_cache16_cdb(block_address, block_count);
                let device = &mut self.device;
                let outcome = completion::wait(|| device.execute(&cdb, DataDirection::None, &mut []))?;
                Ok(synthesize(request, &outcome))
            }
            Operation::Unmap { descriptor_count } => {
                let descriptors = UnmapDescriptor::parse_list(buffer, descriptor_count)?;
                let mut parameters = scsi::unmap_parameter_list(&descriptors)?;
                let cdb = scsi::unmap_cdb(parameters.len() as u16);
                let device = &mut self.device;
                let outcome =
                    completion::wait(|| device.execute(&cdb, DataDirection::ToDevice, &mut parameters))?;
                Ok(synthesize(request, &outcome))
            }
            Operation::Reserved => Err(TransactError::Unsupported(
                "Reserved operation kind on raw transport".to_string(),
            )),
        }
    }

    /// Byte offset and length of a block range, checked against limits
    fn extent(&self, block_address: u64, block_count: u32, buffer_len: usize) -> TransactResult<(u64, usize)> {
        let len = self.geometry.byte_length(block_count);
        if len > buffer_len || len > self.geometry.max_transfer_length as usize {
            return Err(TransactError::Protocol(format!(
                "transfer of {} bytes exceeds buffer ({}) or max transfer ({})",
                len, buffer_len, self.geometry.max_transfer_length
            )));
        }
        Ok((self.geometry.byte_offset(block_address), len))
    }

    /// Release the device
    pub fn close(self) -> TransactResult<()> {
        self.device.close().map_err(TransactError::Close)
    }
}

/// Build a response from a passthrough outcome
fn synthesize(request: &Request, outcome: &ScsiOutcome) -> Response {
    let mut status = TransactStatus {
        scsi_status: outcome.status,
        ..TransactStatus::default()
    };
    if let Some(sense) = outcome.sense_data() {
        status.sense_key = sense.sense_key;
        status.asc = sense.asc;
        status.ascq = sense.ascq;
        status.information = sense.information.unwrap_or(0);
        status.information_valid = sense.information.is_some();
    }
    Response {
        hint: request.hint,
        kind: request.kind(),
        status,
    }
}

//! Linux SCSI generic (`SG_IO`) passthrough
//!
//! Works on `/dev/sgN` nodes and on block devices whose driver accepts
//! `SG_IO` (sd, virtio-scsi, most USB mass storage).

use crate::scsi::{DataDirection, ScsiOutcome};
use std::io;
use std::os::fd::RawFd;

const SG_IO: libc::c_ulong = 0x2285;
const SG_INTERFACE_ID: libc::c_int = b'S' as libc::c_int;

const SG_DXFER_NONE: libc::c_int = -1;
const SG_DXFER_TO_DEV: libc::c_int = -2;
const SG_DXFER_FROM_DEV: libc::c_int = -3;

const SENSE_BUFFER_LENGTH: usize = 32;
const COMMAND_TIMEOUT_MS: libc::c_uint = 60_000;

/// `struct sg_io_hdr` from `<scsi/sg.h>`
#[repr(C)]
struct SgIoHdr {
    interface_id: libc::c_int,
    dxfer_direction: libc::c_int,
    cmd_len: libc::c_uchar,
    mx_sb_len: libc::c_uchar,
    iovec_count: libc::c_ushort,
    dxfer_len: libc::c_uint,
    dxferp: *mut libc::c_void,
    cmdp: *const libc::c_uchar,
    sbp: *mut libc::c_uchar,
    timeout: libc::c_uint,
    flags: libc::c_uint,
    pack_id: libc::c_int,
    usr_ptr: *mut libc::c_void,
    status: libc::c_uchar,
    masked_status: libc::c_uchar,
    msg_status: libc::c_uchar,
    sb_len_wr: libc::c_uchar,
    host_status: libc::c_ushort,
    driver_status: libc::c_ushort,
    resid: libc::c_int,
    duration: libc::c_uint,
    info: libc::c_uint,
}

/// Execute one CDB on `fd` through `SG_IO`
pub(crate) fn execute(
    fd: RawFd,
    cdb: &[u8],
    direction: DataDirection,
    buffer: &mut [u8],
) -> io::Result<ScsiOutcome> {
    if cdb.is_empty() || cdb.len() > u8::MAX as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid CDB length {}", cdb.len()),
        ));
    }
    let dxfer_len = libc::c_uint::try_from(buffer.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "transfer too large for SG_IO"))?;

    let mut sense = [0u8; SENSE_BUFFER_LENGTH];
    let (dxfer_direction, dxfer_len) = match direction {
        DataDirection::None => (SG_DXFER_NONE, 0),
        DataDirection::ToDevice => (SG_DXFER_TO_DEV, dxfer_len),
        DataDirection::FromDevice => (SG_DXFER_FROM_DEV, dxfer_len),
    };

    let mut hdr = SgIoHdr {
        interface_id: SG_INTERFACE_ID,
        dxfer_direction,
        cmd_len: cdb.len() as libc::c_uchar,
        mx_sb_len: SENSE_BUFFER_LENGTH as libc::c_uchar,
        iovec_count: 0,
        dxfer_len,
        dxferp: buffer.as_mut_ptr() as *mut libc::c_void,
        cmdp: cdb.as_ptr(),
        sbp: sense.as_mut_ptr(),
        timeout: COMMAND_TIMEOUT_MS,
        flags: 0,
        pack_id: 0,
        usr_ptr: std::ptr::null_mut(),
        status: 0,
        masked_status: 0,
        msg_status: 0,
        sb_len_wr: 0,
        host_status: 0,
        driver_status: 0,
        resid: 0,
        duration: 0,
        info: 0,
    };

    // SAFETY: every pointer in `hdr` refers to a live buffer of the advertised
    // length for the duration of the call.
    let ret = unsafe { libc::ioctl(fd, SG_IO as _, &mut hdr as *mut SgIoHdr) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    if hdr.host_status != 0 || ((hdr.driver_status & 0x0F) != 0 && hdr.sb_len_wr == 0) {
        return Err(io::Error::new(
            io::ErrorKind::Other,
            format!(
                "SG_IO transport failure: host status 0x{:x}, driver status 0x{:x}",
                hdr.host_status, hdr.driver_status
            ),
        ));
    }

    let sense_len = (hdr.sb_len_wr as usize).min(SENSE_BUFFER_LENGTH);
    let resid = hdr.resid.max(0) as usize;
    Ok(ScsiOutcome {
        status: hdr.status,
        sense: sense[..sense_len].to_vec(),
        transferred: (dxfer_len as usize).saturating_sub(resid),
    })
}

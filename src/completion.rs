//! Blocking completion of single I/O requests
//!
//! Every transact issues exactly one request at a time and waits for it
//! before the next is issued. These helpers give the transports one uniform
//! way to do that: the request closure is retried while the OS reports it was
//! interrupted before completing, and whatever error remains is folded into
//! [`TransactError`].

use crate::error::{TransactError, TransactResult};
use std::io;

/// Issue `op` and block until it completes
///
/// `EINTR` restarts the request; every other failure is returned as
/// `TransactError::Io` with the OS error preserved for the exit code.
pub fn wait<T, F>(mut op: F) -> TransactResult<T>
where
    F: FnMut() -> io::Result<T>,
{
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(TransactError::Io(e)),
        }
    }
}

/// Issue a transfer and require that it moved exactly `expected` bytes
///
/// Used for positioned device I/O, where a short transfer means the request
/// ran past the end of the device or the device misbehaved.
pub fn wait_exact<F>(expected: usize, op: F) -> TransactResult<()>
where
    F: FnMut() -> io::Result<usize>,
{
    let transferred = wait(op)?;
    if transferred != expected {
        return Err(TransactError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("transferred {} of {} bytes", transferred, expected),
        )));
    }
    Ok(())
}

/// Convert the `-1`/errno convention of a raw system call into `io::Result`
#[cfg(unix)]
pub(crate) fn cvt(ret: isize) -> io::Result<usize> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

//! Transact dispatcher
//!
//! A test run talks to exactly one storage unit through exactly one
//! transport. [`Transport`] is the tagged union of the two: the variant is
//! chosen once by [`Transport::open`] and every later call is forwarded by
//! matching on it.

use crate::error::TransactResult;
use crate::geometry::Geometry;
use crate::pipe::{MessageChannel, PipeTransport};
use crate::protocol::{Request, Response};
use crate::raw::{RawDevice, RawTransport};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[cfg(unix)]
use crate::raw::BlockDeviceFile;
#[cfg(unix)]
use crate::seqpacket::SeqPacketChannel;

/// Default wait before retrying a busy pipe
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(3000);

/// What to do when a Read response carries less data than requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShortReadPolicy {
    /// Fill the missing tail with zeros
    #[default]
    ZeroPad,
    /// Fail the transact with a protocol error
    Reject,
}

/// Options applied when opening a transport
#[derive(Debug, Clone)]
pub struct OpenOptions {
    pub connect_timeout: Duration,
    pub short_read_policy: ShortReadPolicy,
}

impl Default for OpenOptions {
    fn default() -> Self {
        OpenOptions {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            short_read_policy: ShortReadPolicy::default(),
        }
    }
}

/// Which transport a target names
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Pipe(PathBuf),
    Raw(PathBuf),
}

impl Target {
    /// Classify a target string
    ///
    /// `pipe:<path>` and `raw:<path>` select the transport explicitly.
    /// Otherwise a path naming a socket is a pipe target and anything else
    /// (including a path that cannot be inspected) is a raw target.
    pub fn parse(target: &str) -> Self {
        if let Some(path) = target.strip_prefix("pipe:") {
            return Target::Pipe(PathBuf::from(path));
        }
        if let Some(path) = target.strip_prefix("raw:") {
            return Target::Raw(PathBuf::from(path));
        }
        let path = PathBuf::from(target);
        if is_socket(&path) {
            Target::Pipe(path)
        } else {
            Target::Raw(path)
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            Target::Pipe(path) | Target::Raw(path) => path,
        }
    }
}

#[cfg(unix)]
fn is_socket(path: &Path) -> bool {
    use std::os::unix::fs::FileTypeExt;
    std::fs::metadata(path)
        .map(|m| m.file_type().is_socket())
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_socket(_path: &Path) -> bool {
    false
}

/// An open storage unit
#[cfg(unix)]
pub enum Transport<C: MessageChannel = SeqPacketChannel, D: RawDevice = BlockDeviceFile> {
    Pipe(PipeTransport<C>),
    Raw(RawTransport<D>),
}

#[cfg(not(unix))]
pub enum Transport<C: MessageChannel, D: RawDevice> {
    Pipe(PipeTransport<C>),
    Raw(RawTransport<D>),
}

#[cfg(unix)]
impl Transport {
    /// Open `target` with the transport it names
    ///
    /// # Errors
    ///
    /// `TransactError::Connect` if the channel or device cannot be opened;
    /// `TransactError::Protocol` (pipe) or `TransactError::Device` (raw) if
    /// the geometry cannot be established.
    pub fn open(target: &Target, options: &OpenOptions) -> TransactResult<Self> {
        match target {
            Target::Pipe(path) => Ok(Transport::Pipe(PipeTransport::connect(path, options)?)),
            Target::Raw(path) => Ok(Transport::Raw(RawTransport::open(path)?)),
        }
    }
}

impl<C: MessageChannel, D: RawDevice> Transport<C, D> {
    pub fn geometry(&self) -> &Geometry {
        match self {
            Transport::Pipe(pipe) => pipe.geometry(),
            Transport::Raw(raw) => raw.geometry(),
        }
    }

    /// Short name of the active transport, for logs
    pub fn name(&self) -> &'static str {
        match self {
            Transport::Pipe(_) => "pipe",
            Transport::Raw(_) => "raw",
        }
    }

    /// Perform one request/response exchange
    pub fn transact(&mut self, request: &Request, buffer: &mut [u8]) -> TransactResult<Response> {
        match self {
            Transport::Pipe(pipe) => pipe.transact(request, buffer),
            Transport::Raw(raw) => raw.transact(request, buffer),
        }
    }

    /// Release the transport
    pub fn close(self) -> TransactResult<()> {
        match self {
            Transport::Pipe(pipe) => pipe.close(),
            Transport::Raw(raw) => raw.close(),
        }
    }
}

//! Pipe transport
//!
//! The pipe transport talks to a storage service over a message-mode duplex
//! channel. The service speaks first: right after the connection is
//! established it sends the unit geometry as one 16-byte message. After that
//! every transact is exactly one request message followed by exactly one
//! response message.
//!
//! # Example
//!
//! ```no_run
//! use transact_tester::pipe::PipeTransport;
//! use transact_tester::protocol::{Operation, Request};
//! use transact_tester::transport::OpenOptions;
//!
//! # fn test() -> Result<(), Box<dyn std::error::Error>> {
//! let mut pipe = PipeTransport::connect("/run/storage/unit0.sock", &OpenOptions::default())?;
//! let mut buffer = pipe.geometry().transfer_buffer(0)?;
//! let request = Request::new(1, Operation::Read {
//!     block_address: 0,
//!     block_count: 1,
//!     force_unit_access: false,
//! });
//! let response = pipe.transact(&request, &mut buffer)?;
//! assert!(response.status.is_good());
//! pipe.close()?;
//! # Ok(())
//! # }
//! ```

use crate::completion;
use crate::error::{TransactError, TransactResult};
use crate::geometry::{Geometry, GEOMETRY_SIZE};
use crate::protocol::{Request, Response, TransactKind, FRAME_HEADER_SIZE};
use crate::transport::{OpenOptions, ShortReadPolicy};
use std::io;
use std::path::Path;
#[cfg(unix)]
use std::time::{Duration, Instant};

/// How often a busy listener is probed while waiting for it
#[cfg(unix)]
const BUSY_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[cfg(unix)]
use crate::seqpacket::{self, SeqPacketChannel};

/// A connected, message-boundary-preserving duplex channel
pub trait MessageChannel {
    /// Send `buf` as one message, returning the bytes accepted
    fn send_message(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Receive one message into `buf`, returning its length
    ///
    /// A message longer than `buf` is truncated to `buf.len()`.
    fn recv_message(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Release the channel, reporting any failure of the release itself
    fn close(self) -> io::Result<()>
    where
        Self: Sized;
}

/// Client end of the pipe transport
pub struct PipeTransport<C: MessageChannel> {
    channel: C,
    geometry: Geometry,
    short_read_policy: ShortReadPolicy,
    frame: Vec<u8>,
}

#[cfg(unix)]
impl PipeTransport<SeqPacketChannel> {
    /// Connect to the storage unit listening at `path` and read its geometry
    ///
    /// If the listener is busy, waits up to `options.connect_timeout` for it
    /// to free up and connects then. A listener still busy at the deadline
    /// fails the open.
    ///
    /// # Errors
    ///
    /// `TransactError::Connect` if the channel cannot be established,
    /// `TransactError::Protocol` if the geometry handshake is short or invalid.
    pub fn connect<P: AsRef<Path>>(path: P, options: &OpenOptions) -> TransactResult<Self> {
        let path = path.as_ref();
        let channel = match SeqPacketChannel::connect(path) {
            Ok(channel) => channel,
            Err(e) if seqpacket::is_busy(&e) => {
                log::warn!(
                    "{} is busy, waiting up to {} ms",
                    path.display(),
                    options.connect_timeout.as_millis()
                );
                connect_when_free(path, options.connect_timeout)?
            }
            Err(e) => return Err(TransactError::Connect(e)),
        };
        log::info!("Connected to {}", path.display());
        Self::handshake(channel, options.short_read_policy)
    }
}

/// Poll a busy listener until it takes the connection or `timeout` runs out
#[cfg(unix)]
fn connect_when_free(path: &Path, timeout: Duration) -> TransactResult<SeqPacketChannel> {
    let deadline = Instant::now() + timeout;
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        std::thread::sleep(left.min(BUSY_POLL_INTERVAL));
        match SeqPacketChannel::connect(path) {
            Err(e) if seqpacket::is_busy(&e) && Instant::now() < deadline => continue,
            result => return result.map_err(TransactError::Connect),
        }
    }
}

impl<C: MessageChannel> PipeTransport<C> {
    /// Read the geometry handshake from an already connected channel
    ///
    /// The channel is dropped (and with it closed) if the handshake fails.
    pub fn handshake(mut channel: C, short_read_policy: ShortReadPolicy) -> TransactResult<Self> {
        let mut buf = [0u8; GEOMETRY_SIZE];
        let received = completion::wait(|| channel.recv_message(&mut buf))?;
        let geometry = Geometry::from_bytes(&buf[..received])?;
        geometry
            .validate()
            .map_err(|e| TransactError::Protocol(format!("handshake: {}", e)))?;

        log::info!(
            "Unit geometry: {} blocks x {} bytes, max transfer {} bytes",
            geometry.block_count,
            geometry.block_length,
            geometry.max_transfer_length
        );

        let frame = geometry.transfer_buffer(FRAME_HEADER_SIZE)?;
        Ok(PipeTransport {
            channel,
            geometry,
            short_read_policy,
            frame,
        })
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Perform one request/response exchange
    ///
    /// `buffer` supplies the Write data or Unmap descriptors and receives the
    /// Read data. A successful Read always leaves exactly
    /// `block_count * block_length` bytes at the front of `buffer`.
    ///
    /// # Errors
    ///
    /// `TransactError::Protocol` for oversized payloads, a response shorter
    /// than a frame header, a hint that does not match the request, or (under
    /// `ShortReadPolicy::Reject`) a Read response carrying too little data.
    /// `TransactError::Io` when the channel itself fails.
    pub fn transact(&mut self, request: &Request, buffer: &mut [u8]) -> TransactResult<Response> {
        let geometry = self.geometry;
        let payload_length = request.payload_length(&geometry);
        if payload_length > buffer.len() || payload_length > geometry.max_transfer_length as usize {
            return Err(TransactError::Protocol(format!(
                "{} payload of {} bytes exceeds buffer ({}) or max transfer ({})",
                request.kind(),
                payload_length,
                buffer.len(),
                geometry.max_transfer_length
            )));
        }

        let message_length = FRAME_HEADER_SIZE + payload_length;
        self.frame[..FRAME_HEADER_SIZE].copy_from_slice(&request.to_bytes());
        self.frame[FRAME_HEADER_SIZE..message_length].copy_from_slice(&buffer[..payload_length]);

        let channel = &mut self.channel;
        let frame = &mut self.frame;
        let sent = completion::wait(|| channel.send_message(&frame[..message_length]))?;
        if sent != message_length {
            return Err(TransactError::Protocol(format!(
                "short send: {} of {} bytes",
                sent, message_length
            )));
        }

        let received = completion::wait(|| channel.recv_message(&mut frame[..]))?;
        if received < FRAME_HEADER_SIZE {
            return Err(TransactError::Protocol(format!(
                "mismatched frame: {} bytes, need at least {}",
                received, FRAME_HEADER_SIZE
            )));
        }
        let response = Response::from_bytes(&frame[..FRAME_HEADER_SIZE])?;
        if response.hint != request.hint {
            return Err(TransactError::Protocol(format!(
                "mismatched frame: hint {:#x}, expected {:#x}",
                response.hint, request.hint
            )));
        }

        if response.kind == TransactKind::Read && response.status.is_good() {
            let expected = request.read_length(&geometry);
            if expected > geometry.max_transfer_length as usize || expected > buffer.len() {
                return Err(TransactError::Protocol(format!(
                    "read of {} bytes exceeds buffer ({}) or max transfer ({})",
                    expected,
                    buffer.len(),
                    geometry.max_transfer_length
                )));
            }
            let delivered = received - FRAME_HEADER_SIZE;
            let copied = delivered.min(expected);
            buffer[..copied].copy_from_slice(&frame[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + copied]);
            if copied < expected {
                match self.short_read_policy {
                    ShortReadPolicy::ZeroPad => {
                        log::debug!("Read delivered {} of {} bytes, zero-padding", copied, expected);
                        buffer[copied..expected].fill(0);
                    }
                    ShortReadPolicy::Reject => {
                        return Err(TransactError::Protocol(format!(
                            "short read payload: {} of {} bytes",
                            copied, expected
                        )));
                    }
                }
            }
        }

        Ok(response)
    }

    /// Release the channel
    pub fn close(self) -> TransactResult<()> {
        self.channel.close().map_err(TransactError::Close)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::protocol::{Operation, TransactStatus, UnmapDescriptor};
    use crate::scsi::scsi_status;
    use std::collections::VecDeque;

    /// Scripted channel: records sent messages, replays queued replies
    #[derive(Default)]
    pub(crate) struct MockChannel {
        pub sent: Vec<Vec<u8>>,
        pub replies: VecDeque<Vec<u8>>,
        pub close_error: bool,
    }

    impl MockChannel {
        pub fn with_geometry(geometry: &Geometry) -> Self {
            let mut channel = MockChannel::default();
            channel.replies.push_back(geometry.to_bytes().to_vec());
            channel
        }

        pub fn reply(&mut self, response: &Response, data: &[u8]) {
            let mut msg = response.to_bytes().to_vec();
            msg.extend_from_slice(data);
            self.replies.push_back(msg);
        }
    }

    impl MessageChannel for MockChannel {
        fn send_message(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.sent.push(buf.to_vec());
            Ok(buf.len())
        }

        fn recv_message(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let msg = self
                .replies
                .pop_front()
                .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))?;
            let n = msg.len().min(buf.len());
            buf[..n].copy_from_slice(&msg[..n]);
            Ok(n)
        }

        fn close(self) -> io::Result<()> {
            if self.close_error {
                Err(io::Error::from_raw_os_error(libc::EBADF))
            } else {
                Ok(())
            }
        }
    }

    fn geometry() -> Geometry {
        Geometry::new(100, 512, 4 * 512).unwrap()
    }

    fn read(hint: u64, block_address: u64, block_count: u32) -> Request {
        Request::new(
            hint,
            Operation::Read {
                block_address,
                block_count,
                force_unit_access: false,
            },
        )
    }

    fn open(channel: MockChannel, policy: ShortReadPolicy) -> PipeTransport<MockChannel> {
        PipeTransport::handshake(channel, policy).unwrap()
    }

    #[test]
    fn test_handshake() {
        let pipe = open(MockChannel::with_geometry(&geometry()), ShortReadPolicy::ZeroPad);
        assert_eq!(*pipe.geometry(), geometry());
    }

    #[test]
    fn test_handshake_short() {
        let mut channel = MockChannel::default();
        channel.replies.push_back(vec![0u8; 12]);
        let err = PipeTransport::handshake(channel, ShortReadPolicy::ZeroPad).err().unwrap();
        assert!(matches!(err, TransactError::Protocol(_)));
    }

    #[test]
    fn test_handshake_invalid_geometry() {
        let bad = Geometry {
            block_count: 10,
            block_length: 512,
            max_transfer_length: 1000,
        };
        let err = PipeTransport::handshake(MockChannel::with_geometry(&bad), ShortReadPolicy::ZeroPad)
            .err()
            .unwrap();
        match err {
            TransactError::Protocol(msg) => assert!(msg.starts_with("handshake"), "{}", msg),
            other => panic!("expected protocol error, got {:?}", other),
        }
    }

    #[test]
    fn test_write_sends_header_and_payload() {
        let g = geometry();
        let mut channel = MockChannel::with_geometry(&g);
        let request = Request::new(
            9,
            Operation::Write {
                block_address: 3,
                block_count: 2,
                force_unit_access: false,
            },
        );
        channel.reply(&Response::good_for(&request), &[]);
        let mut pipe = open(channel, ShortReadPolicy::ZeroPad);

        let mut buffer = vec![0xA5u8; g.max_transfer_length as usize];
        let response = pipe.transact(&request, &mut buffer).unwrap();
        assert_eq!(response.hint, 9);
        assert_eq!(response.kind, TransactKind::Write);

        let sent = &pipe.channel.sent[0];
        assert_eq!(sent.len(), FRAME_HEADER_SIZE + 1024);
        assert_eq!(Request::from_bytes(sent).unwrap(), request);
        assert!(sent[FRAME_HEADER_SIZE..].iter().all(|&b| b == 0xA5));
    }

    #[test]
    fn test_unmap_sends_descriptors() {
        let g = geometry();
        let mut channel = MockChannel::with_geometry(&g);
        let request = Request::new(1, Operation::Unmap { descriptor_count: 1 });
        channel.reply(&Response::good_for(&request), &[]);
        let mut pipe = open(channel, ShortReadPolicy::ZeroPad);

        let mut buffer = vec![0u8; g.max_transfer_length as usize];
        UnmapDescriptor::new(40, 3).write_to(&mut buffer);
        pipe.transact(&request, &mut buffer).unwrap();

        let sent = &pipe.channel.sent[0];
        assert_eq!(sent.len(), FRAME_HEADER_SIZE + 16);
        let descriptors = UnmapDescriptor::parse_list(&sent[FRAME_HEADER_SIZE..], 1).unwrap();
        assert_eq!(descriptors, vec![UnmapDescriptor::new(40, 3)]);
    }

    #[test]
    fn test_read_copies_payload() {
        let g = geometry();
        let mut channel = MockChannel::with_geometry(&g);
        let request = read(5, 0, 2);
        channel.reply(&Response::good_for(&request), &vec![0x3Cu8; 1024]);
        let mut pipe = open(channel, ShortReadPolicy::ZeroPad);

        let mut buffer = vec![0u8; g.max_transfer_length as usize];
        pipe.transact(&request, &mut buffer).unwrap();
        assert!(buffer[..1024].iter().all(|&b| b == 0x3C));
        assert!(buffer[1024..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_read_truncates_excess_payload() {
        let g = geometry();
        let mut channel = MockChannel::with_geometry(&g);
        let request = read(5, 0, 1);
        channel.reply(&Response::good_for(&request), &vec![0x77u8; 2048]);
        let mut pipe = open(channel, ShortReadPolicy::ZeroPad);

        let mut buffer = vec![0u8; g.max_transfer_length as usize];
        pipe.transact(&request, &mut buffer).unwrap();
        assert!(buffer[..512].iter().all(|&b| b == 0x77));
        assert!(buffer[512..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_read_zero_pads_short_payload() {
        let g = geometry();
        let mut channel = MockChannel::with_geometry(&g);
        let request = read(5, 0, 2);
        channel.reply(&Response::good_for(&request), &vec![0x11u8; 100]);
        let mut pipe = open(channel, ShortReadPolicy::ZeroPad);

        let mut buffer = vec![0xFFu8; g.max_transfer_length as usize];
        pipe.transact(&request, &mut buffer).unwrap();
        assert!(buffer[..100].iter().all(|&b| b == 0x11));
        assert!(buffer[100..1024].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_read_rejects_short_payload() {
        let g = geometry();
        let mut channel = MockChannel::with_geometry(&g);
        let request = read(5, 0, 2);
        channel.reply(&Response::good_for(&request), &vec![0x11u8; 100]);
        let mut pipe = open(channel, ShortReadPolicy::Reject);

        let mut buffer = vec![0u8; g.max_transfer_length as usize];
        let err = pipe.transact(&request, &mut buffer).unwrap_err();
        assert!(matches!(err, TransactError::Protocol(_)));
    }

    #[test]
    fn test_failed_read_leaves_buffer_alone() {
        let g = geometry();
        let mut channel = MockChannel::with_geometry(&g);
        let request = read(5, 0, 2);
        let response = Response {
            hint: 5,
            kind: TransactKind::Read,
            status: TransactStatus {
                scsi_status: scsi_status::CHECK_CONDITION,
                sense_key: 0x03,
                asc: 0x11,
                ..TransactStatus::default()
            },
        };
        channel.reply(&response, &[]);
        let mut pipe = open(channel, ShortReadPolicy::Reject);

        let mut buffer = vec![0xEEu8; g.max_transfer_length as usize];
        let got = pipe.transact(&request, &mut buffer).unwrap();
        assert_eq!(got.status.scsi_status, scsi_status::CHECK_CONDITION);
        assert!(buffer.iter().all(|&b| b == 0xEE));
    }

    #[test]
    fn test_mismatched_hint() {
        let g = geometry();
        let mut channel = MockChannel::with_geometry(&g);
        let request = read(5, 0, 1);
        channel.reply(&Response::good_for(&read(6, 0, 1)), &[0u8; 512]);
        let mut pipe = open(channel, ShortReadPolicy::ZeroPad);

        let mut buffer = vec![0u8; g.max_transfer_length as usize];
        match pipe.transact(&request, &mut buffer) {
            Err(TransactError::Protocol(msg)) => assert!(msg.contains("mismatched frame"), "{}", msg),
            other => panic!("expected protocol error, got {:?}", other),
        }
    }

    #[test]
    fn test_truncated_frame() {
        let g = geometry();
        let mut channel = MockChannel::with_geometry(&g);
        channel.replies.push_back(vec![0u8; FRAME_HEADER_SIZE - 1]);
        let mut pipe = open(channel, ShortReadPolicy::ZeroPad);

        let mut buffer = vec![0u8; g.max_transfer_length as usize];
        let err = pipe.transact(&read(1, 0, 1), &mut buffer).unwrap_err();
        assert!(matches!(err, TransactError::Protocol(_)));
    }

    #[test]
    fn test_oversized_write_rejected_before_send() {
        let g = geometry();
        let mut pipe = open(MockChannel::with_geometry(&g), ShortReadPolicy::ZeroPad);
        let request = Request::new(
            1,
            Operation::Write {
                block_address: 0,
                block_count: 5,
                force_unit_access: false,
            },
        );
        let mut buffer = vec![0u8; 8 * 512];
        assert!(pipe.transact(&request, &mut buffer).is_err());
        assert!(pipe.channel.sent.is_empty());
    }

    #[test]
    fn test_oversized_read_rejected() {
        let g = geometry();
        let mut channel = MockChannel::with_geometry(&g);
        let request = read(1, 0, 5);
        channel.reply(&Response::good_for(&request), &[]);
        let mut pipe = open(channel, ShortReadPolicy::ZeroPad);

        let mut buffer = vec![0u8; 8 * 512];
        assert!(matches!(
            pipe.transact(&request, &mut buffer),
            Err(TransactError::Protocol(_))
        ));
    }

    #[test]
    fn test_close_error() {
        let mut channel = MockChannel::with_geometry(&geometry());
        channel.close_error = true;
        let pipe = open(channel, ShortReadPolicy::ZeroPad);
        let err = pipe.close().unwrap_err();
        assert!(matches!(err, TransactError::Close(_)));
        assert_eq!(err.code(), libc::EBADF);
    }
}

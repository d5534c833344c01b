//! A correctness and stress test client for block storage units
//!
//! A storage unit is reached either through a message-mode duplex channel
//! served by a storage service (the pipe transport) or directly as a SCSI
//! block device (the raw transport). Either way the client learns the unit
//! geometry, drives a seeded stream of Read, Write, Flush and Unmap
//! operations against it, and checks what comes back without trusting the
//! unit to report its own errors: written blocks carry an address-derived
//! pattern and unmapped blocks must read back as zeros.
//!
//! # Example
//!
//! ```no_run
//! use transact_tester::{Pick, TestRun};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let summary = TestRun::builder()
//!     .target("/run/storage/unit0.sock")
//!     .op_count(10_000)
//!     .kinds("WRFU")
//!     .address(Pick::Random)
//!     .count(Pick::Random)
//!     .seed(42)
//!     .build()?
//!     .run()?;
//! println!("{}", summary);
//! # Ok(())
//! # }
//! ```

pub mod completion;
pub mod error;
pub mod geometry;
pub mod oracle;
pub mod pipe;
pub mod protocol;
pub mod raw;
pub mod rng;
pub mod runner;
pub mod scsi;
#[cfg(unix)]
pub mod seqpacket;
#[cfg(target_os = "linux")]
mod sg;
pub mod transport;
pub mod workload;

pub use error::{TransactError, TransactResult};
pub use geometry::Geometry;
pub use pipe::{MessageChannel, PipeTransport};
pub use protocol::{Operation, Request, Response, TransactKind, TransactStatus, UnmapDescriptor};
pub use raw::{RawDevice, RawTransport};
pub use runner::{RunSummary, TestRun, TestRunBuilder};
pub use transport::{OpenOptions, ShortReadPolicy, Target, Transport};
pub use workload::Pick;

/// Version of this library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

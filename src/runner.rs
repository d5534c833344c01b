//! Test loop
//!
//! A [`TestRun`] is a fully validated description of one run: where to
//! connect, how many operations, which kinds, where and how large. Running
//! it opens the transport, drives the workload through it, checks every
//! response and every verifiable Read, and always closes the transport
//! again.
//!
//! # Example
//!
//! ```no_run
//! use transact_tester::runner::TestRun;
//! use transact_tester::workload::Pick;
//!
//! # fn test() -> Result<(), Box<dyn std::error::Error>> {
//! let run = TestRun::builder()
//!     .target("pipe:/run/storage/unit0.sock")
//!     .op_count(1000)
//!     .kinds("WRU")
//!     .address(Pick::Random)
//!     .count(Pick::Fixed(8))
//!     .seed(1)
//!     .build()?;
//! let summary = run.run()?;
//! println!("{}", summary);
//! # Ok(())
//! # }
//! ```

use crate::error::{split_address, TransactError, TransactResult};
use crate::oracle::{self, VerifyMode};
use crate::pipe::MessageChannel;
use crate::protocol::{Operation, Request, Response, TransactKind, UnmapDescriptor};
use crate::raw::RawDevice;
use crate::transport::{OpenOptions, ShortReadPolicy, Target, Transport};
use crate::workload::{self, Pick, PlannedOp, Workload, MAX_KINDS};
use std::fmt;
use std::time::Duration;

/// Counters collected over a successful run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub operations: u32,
    pub reads: u32,
    pub writes: u32,
    pub flushes: u32,
    pub unmaps: u32,
    /// Reads checked by the content oracle
    pub verified_reads: u32,
    pub bytes_written: u64,
    pub bytes_read: u64,
    /// Generator state after the last draw
    pub final_seed: u32,
}

impl RunSummary {
    fn record(&mut self, kind: TransactKind, bytes: usize) {
        self.operations += 1;
        match kind {
            TransactKind::Read => {
                self.reads += 1;
                self.bytes_read += bytes as u64;
            }
            TransactKind::Write => {
                self.writes += 1;
                self.bytes_written += bytes as u64;
            }
            TransactKind::Flush => self.flushes += 1,
            TransactKind::Unmap => self.unmaps += 1,
            TransactKind::Reserved => {}
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ops (R={} W={} F={} U={}), {} reads verified, {} bytes written, {} bytes read, seed {}",
            self.operations,
            self.reads,
            self.writes,
            self.flushes,
            self.unmaps,
            self.verified_reads,
            self.bytes_written,
            self.bytes_read,
            self.final_seed
        )
    }
}

/// One configured test run
#[derive(Debug, Clone)]
pub struct TestRun {
    target: Target,
    op_count: u32,
    kinds: Vec<TransactKind>,
    address: Pick<u64>,
    count: Pick<u32>,
    seed: u32,
    hint_base: u64,
    options: OpenOptions,
}

impl TestRun {
    /// Create a new builder for configuring a run
    pub fn builder() -> TestRunBuilder {
        TestRunBuilder::new()
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn seed(&self) -> u32 {
        self.seed
    }

    pub fn kinds(&self) -> &[TransactKind] {
        &self.kinds
    }

    /// Open the target, run the workload and close the target
    ///
    /// # Errors
    ///
    /// The first failure of the run. A failure to close the transport is only
    /// reported when the run itself succeeded.
    #[cfg(unix)]
    pub fn run(&self) -> TransactResult<RunSummary> {
        let transport = Transport::open(&self.target, &self.options)?;
        self.execute(transport)
    }

    /// Run the workload over an already open transport, then close it
    pub fn execute<C: MessageChannel, D: RawDevice>(
        &self,
        mut transport: Transport<C, D>,
    ) -> TransactResult<RunSummary> {
        log::info!(
            "Starting {} ops over {} transport, seed {}",
            self.op_count.max(1),
            transport.name(),
            self.seed
        );

        let result = self.drive(&mut transport);
        let closed = transport.close();

        match result {
            Ok(summary) => {
                closed?;
                log::info!("Run complete: {}", summary);
                Ok(summary)
            }
            Err(e) => {
                if let Err(close_err) = closed {
                    log::error!("close after failed run also failed: {}", close_err);
                }
                Err(e)
            }
        }
    }

    fn drive<C: MessageChannel, D: RawDevice>(
        &self,
        transport: &mut Transport<C, D>,
    ) -> TransactResult<RunSummary> {
        let geometry = *transport.geometry();
        let mut buffer = geometry.transfer_buffer(0)?;
        let mut workload = Workload::new(&geometry, &self.kinds, self.address, self.count, self.op_count);
        let mut seed = self.seed;
        let mut summary = RunSummary::default();

        // last Write or Unmap of the current batch
        let mut expect: Option<VerifyMode> = None;

        while let Some(op) = workload.next_op(&mut seed) {
            if op.batch_start {
                expect = None;
            }

            let request = Request::new(self.hint_base | op.index as u64, operation_for(&op));
            match op.kind {
                TransactKind::Write => {
                    oracle::stamp(&mut buffer, geometry.block_length, op.block_address, op.block_count);
                    expect = Some(VerifyMode::AfterWrite);
                }
                TransactKind::Unmap => {
                    UnmapDescriptor::new(op.block_address, op.block_count).write_to(&mut buffer);
                    expect = Some(VerifyMode::AfterUnmap);
                }
                _ => {}
            }

            log::debug!(
                "op {} {} A={}, C={} hint {:#x}",
                op.index,
                op.kind,
                split_address(op.block_address),
                op.block_count,
                request.hint
            );

            let response = transport.transact(&request, &mut buffer)?;
            check_response(&request, &response, &op)?;

            if response.kind == TransactKind::Read {
                if let Some(mode) = expect {
                    oracle::check(&buffer, geometry.block_length, op.block_address, op.block_count, mode)?;
                    summary.verified_reads += 1;
                }
            }
            summary.record(op.kind, geometry.byte_length(op.block_count));
        }

        summary.final_seed = seed;
        Ok(summary)
    }
}

fn operation_for(op: &PlannedOp) -> Operation {
    match op.kind {
        TransactKind::Read => Operation::Read {
            block_address: op.block_address,
            block_count: op.block_count,
            force_unit_access: false,
        },
        TransactKind::Write => Operation::Write {
            block_address: op.block_address,
            block_count: op.block_count,
            force_unit_access: false,
        },
        TransactKind::Flush => Operation::Flush {
            block_address: op.block_address,
            block_count: op.block_count,
        },
        TransactKind::Unmap => Operation::Unmap { descriptor_count: 1 },
        TransactKind::Reserved => Operation::Reserved,
    }
}

/// Hint echo, kind echo and GOOD status
fn check_response(request: &Request, response: &Response, op: &PlannedOp) -> TransactResult<()> {
    let failure = if response.hint != request.hint {
        Some(format!("hint {:#x} != {:#x}", response.hint, request.hint))
    } else if response.kind != request.kind() {
        Some(format!("kind {} != {}", response.kind, request.kind()))
    } else if !response.status.is_good() {
        Some(format!("{} not GOOD ({})", response.kind, response.status))
    } else {
        None
    };

    match failure {
        Some(condition) => Err(TransactError::Protocol(format!(
            "condition fail: {}: A={}, C={}",
            condition,
            split_address(op.block_address),
            op.block_count
        ))),
        None => Ok(()),
    }
}

/// Builder for configuring a [`TestRun`]
#[derive(Debug, Default)]
pub struct TestRunBuilder {
    target: Option<Target>,
    op_count: Option<u32>,
    kinds: Option<Vec<TransactKind>>,
    address: Option<Pick<u64>>,
    count: Option<Pick<u32>>,
    seed: Option<u32>,
    hint_base: Option<u64>,
    options: OpenOptions,
}

impl TestRunBuilder {
    fn new() -> Self {
        Self::default()
    }

    /// Set the target (`pipe:<path>`, `raw:<path>` or a bare path)
    pub fn target(mut self, target: &str) -> Self {
        self.target = Some(Target::parse(target));
        self
    }

    /// Set an already classified target
    pub fn target_kind(mut self, target: Target) -> Self {
        self.target = Some(target);
        self
    }

    /// Number of operations (default: 1; zero also means 1)
    pub fn op_count(mut self, op_count: u32) -> Self {
        self.op_count = Some(op_count);
        self
    }

    /// Kinds as letters, e.g. `"WRFU"` (default: `"WR"`)
    pub fn kinds(mut self, letters: &str) -> Self {
        self.kinds = Some(workload::parse_kinds(letters));
        self
    }

    /// Kinds as a list
    pub fn kind_list(mut self, kinds: Vec<TransactKind>) -> Self {
        self.kinds = Some(kinds);
        self
    }

    /// Starting block address (default: block 0)
    pub fn address(mut self, address: Pick<u64>) -> Self {
        self.address = Some(address);
        self
    }

    /// Blocks per operation (default: 1)
    pub fn count(mut self, count: Pick<u32>) -> Self {
        self.count = Some(count);
        self
    }

    /// Generator seed (default: random)
    pub fn seed(mut self, seed: u32) -> Self {
        self.seed = Some(seed);
        self
    }

    /// High half of every hint (default: process id << 32)
    pub fn hint_base(mut self, hint_base: u64) -> Self {
        self.hint_base = Some(hint_base);
        self
    }

    /// Wait before retrying a busy pipe (default: 3 s)
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.options.connect_timeout = timeout;
        self
    }

    /// Handling of Read responses shorter than requested (default: zero-pad)
    pub fn short_read_policy(mut self, policy: ShortReadPolicy) -> Self {
        self.options.short_read_policy = policy;
        self
    }

    /// Validate and build the run
    pub fn build(self) -> TransactResult<TestRun> {
        let target = self
            .target
            .ok_or_else(|| TransactError::Config("target is required".to_string()))?;
        if target.path().as_os_str().is_empty() {
            return Err(TransactError::Config("target path is empty".to_string()));
        }

        let kinds = match self.kinds {
            Some(kinds) if kinds.is_empty() => workload::DEFAULT_KINDS.to_vec(),
            Some(kinds) => kinds,
            None => workload::DEFAULT_KINDS.to_vec(),
        };
        if kinds.len() > MAX_KINDS {
            return Err(TransactError::Config(format!(
                "{} kinds given, at most {} allowed",
                kinds.len(),
                MAX_KINDS
            )));
        }
        if kinds.contains(&TransactKind::Reserved) {
            return Err(TransactError::Config(
                "Reserved is not a workload kind".to_string(),
            ));
        }

        let hint_base = self
            .hint_base
            .unwrap_or_else(|| (std::process::id() as u64) << 32);
        if hint_base & 0xFFFF_FFFF != 0 {
            return Err(TransactError::Config(format!(
                "hint base {:#x} must leave the low 32 bits clear",
                hint_base
            )));
        }

        Ok(TestRun {
            target,
            op_count: self.op_count.unwrap_or(1),
            kinds,
            address: self.address.unwrap_or(Pick::Fixed(0)),
            count: self.count.unwrap_or(Pick::Fixed(1)),
            seed: self.seed.unwrap_or_else(rand::random::<u32>),
            hint_base,
            options: self.options,
        })
    }
}

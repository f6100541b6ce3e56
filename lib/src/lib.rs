//! # dlflash
//!
//! A Rust library for flashing Samsung mobile devices that have been placed in "Download Mode"
//! through the proprietary Odin/Loke USB protocol.
//!
//! This library parses a firmware distribution (a TAR archive, optionally nested, optionally
//! carrying per-member LZ4/GZIP compression), matches its members against a Partition
//! Information Table (PIT) retrieved from the device, and writes each member to the correct
//! flash partition over a bounded-memory USB bulk pipeline.
//!
//! ## Main Features
//!
//! - Device enumeration and handshake over the Odin/Loke protocol
//! - PIT (Partition Information Table) parsing, serialization and matching
//! - Streaming TAR archive reading with on-demand, random-access member bodies
//! - Streaming LZ4/GZIP decompression with a bounded accumulation buffer
//! - Progress reporting and event callbacks
//! - Structured error handling distinguishing protocol, I/O and archive failures
//!
//! ## Usage Example
//!
//! ```no_run
//! use dlflash::{Flasher, Event};
//! use std::{path::PathBuf, sync::Arc};
//!
//! let callback = Arc::new(|event: Event| {
//!     match event {
//!         Event::FlashProgress(progress) => {
//!             println!("{}: {:.1}%", progress.member, progress.percent);
//!         }
//!         Event::Step(step) => println!("entering phase: {:?}", step),
//!         _ => {}
//!     }
//! });
//!
//! let mut flasher = Flasher::connect(None, Some(callback.clone()))?;
//! let firmware = flasher.load_firmware(&PathBuf::from("/path/to/firmware.tar.md5"))?;
//! flasher.flash(&firmware, None, true, None, |_progress| {})?;
//! # Ok::<(), dlflash::Error>(())
//! ```
//!
//! ## Device Connection
//!
//! To use this library, the device must be connected via USB and placed in Download Mode
//! (typically Volume Down + Volume Up + Power, then Volume Up to confirm).

mod archive;
mod decompress;
mod firmware;
mod flasher;
mod framing;
mod matcher;
mod pipeline;
mod pit;
mod session;
mod transport;

#[cfg(target_os = "linux")]
mod setup;

/// Configuration types for CLI defaults (timeouts, packet size override, log filter).
pub mod config;

use std::sync::Arc;

pub use archive::{ArchiveReader, Member};
pub use firmware::{Compression, Firmware};
pub use flasher::{FlashProgress, Flasher};
pub use pit::{Pit, PitEntry};
pub use session::{SessionConfig, SessionPhase};
pub use transport::DeviceInfo;

/// A cooperative stop flag shared between a caller and an in-progress [`Flasher::flash`] call.
///
/// Cancellation is honored only at a chunk or member boundary (never mid-block or mid-finalizer)
/// per the session's ordering contract; once observed, the session is driven to `Failed` and
/// [`Error::Cancelled`] is returned.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(std::sync::Arc<std::sync::atomic::AtomicBool>);

impl CancelToken {
  pub fn new() -> Self {
    Self::default()
  }

  /// Record a stop request. Takes effect at the next safe boundary.
  pub fn cancel(&self) {
    self.0.store(true, std::sync::atomic::Ordering::SeqCst);
  }

  pub fn is_cancelled(&self) -> bool {
    self.0.load(std::sync::atomic::Ordering::SeqCst)
  }
}

/// Callback type for receiving flash events.
pub type Callback = Arc<dyn Fn(Event) + Send + Sync>;

/// Events emitted during the flashing process.
#[derive(Debug, Clone)]
pub enum Event {
  /// The tool is searching for a connected device.
  FindingDevice,
  /// The tool is attempting the handshake with a found device.
  Connecting,
  /// A successful handshake and setup completed.
  Connected(DeviceInfo),
  /// Entering a new session phase.
  Step(SessionPhase),
  /// Beginning the transfer of a new member.
  MemberStart { name: String, index: usize, total: usize },
  /// Progress information for the member currently being transferred.
  FlashProgress(FlashProgress),
  /// The session is being closed and, if requested, the device is rebooting.
  Closing,
}

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur while talking to a device in Download Mode.
#[derive(thiserror::Error, Debug)]
pub enum Error {
  /// Error from the USB subsystem.
  #[error("USB error: {0}")]
  UsbError(#[from] rusb::Error),

  /// I/O related error.
  #[error("IO error: {0}")]
  IoError(#[from] std::io::Error),

  /// Error converting slices.
  #[error("slice conversion error: {0}")]
  Bytes(#[from] std::array::TryFromSliceError),

  /// Enumeration found no device matching the expected vendor/product ids.
  #[error("no device found in download mode")]
  NoDevice,

  /// The transport could not claim the device's USB interface/endpoints.
  #[error("could not open device: {0}")]
  UsbOpen(String),

  /// A bulk read exceeded its deadline. `phase` names the operation that timed out.
  #[error("timed out waiting for device during {phase}")]
  Timeout { phase: &'static str },

  /// The four `ODIN` handshake bytes were not answered with `LOKE`.
  #[error("handshake failed, device replied with {0:?}")]
  HandshakeFailed(Vec<u8>),

  /// A reply's `cmd_echo` did not match the command it was supposed to answer.
  #[error("protocol mismatch: expected cmd {expected_cmd}, got cmd {got_cmd} data {got_data}")]
  ProtocolMismatch { expected_cmd: u32, got_cmd: u32, got_data: u32 },

  /// The device refused the previous command (`cmd_echo == 0xFFFFFFFF`).
  #[error("device refused command, error code {0:#X}")]
  Refused(u32),

  /// A command or reply frame had the wrong length.
  #[error("framing error: {0}")]
  Framing(String),

  /// The PIT binary was malformed.
  #[error("invalid PIT: {0}")]
  InvalidPit(String),

  /// The TAR archive was malformed.
  #[error("invalid archive: {0}")]
  ArchiveFormat(String),

  /// The streaming decompressor reported invalid input.
  #[error("decompression failed at stream position {position}: {reason}")]
  Decompression { position: u64, reason: String },

  /// The `total_bytes` declared at session open did not match the sum of finalizer byte counts.
  #[error("byte accounting mismatch: declared {declared}, actually sent {actual}")]
  ByteAccountingMismatch { declared: u64, actual: u64 },

  /// A transfer finalizer was refused by the device.
  #[error("transfer rejected for partition {partition_id}, error code {error_code:#X}")]
  TransferRejected { error_code: u32, partition_id: u32 },

  /// The caller requested cancellation and it was honored at a phase boundary.
  #[error("flash cancelled")]
  Cancelled,

  /// A configuration file could not be parsed.
  #[error("invalid configuration: {0}")]
  Config(String),
}

pub(crate) const VENDOR_ID: u16 = 0x04E8;
pub(crate) const PRODUCT_IDS: [u16; 2] = [0x685D, 0x68C3];

/// Fixed 128 KiB on-wire block size within a transfer chunk.
pub(crate) const FILE_BLOCK_SIZE: usize = 128 * 1024;
/// Maximum bytes sent under a single `(102, 2)` / `(102, 3)` chunk pair.
pub(crate) const MAX_CHUNK: usize = 30 * 1024 * 1024;
/// Size of the single bounded accumulation buffer reused across chunks.
pub(crate) const SEND_BUFFER: usize = 30 * 1024 * 1024;
/// Ceiling on a single decompressed block drawn from the streaming decoder.
pub(crate) const MAX_DECOMPRESSED_BLOCK: usize = 4 * 1024 * 1024;
/// Maximum PIT payload size accepted from the device.
pub(crate) const PIT_MAX_SIZE: u32 = 0x0010_0000;
/// Per-iteration read size while draining the PIT over `(101, 2, counter)`.
pub(crate) const PIT_READ_CHUNK: usize = 500;
/// Device preparation window observed between a chunk header and its first block.
pub(crate) const INTER_PHASE_WAIT: std::time::Duration = std::time::Duration::from_millis(100);
/// Timeout for ordinary control/bulk round trips.
pub(crate) const COMMAND_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);
/// Timeout for a finalizer reply, long enough for the device to commit a flash chunk.
pub(crate) const FINALIZER_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(120);

/// Rough decompressed/compressed size multiplier used to estimate `total_bytes` for the
/// session-open frame when the exact decompressed size of a member is unknown.
pub(crate) const LZ4_SIZE_ESTIMATE_MULTIPLIER: u64 = 4;
pub(crate) const GZIP_SIZE_ESTIMATE_MULTIPLIER: u64 = 3;

/// Set up host environment for USB access (currently only meaningful on Linux).
pub fn host_setup() -> Result<()> {
  #[cfg(target_os = "linux")]
  crate::setup::setup_host_linux()?;

  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn cancel_token_starts_clear_and_latches() {
    let token = CancelToken::new();
    assert!(!token.is_cancelled());
    token.cancel();
    assert!(token.is_cancelled());
  }

  #[test]
  fn cancel_token_clone_shares_state() {
    let token = CancelToken::new();
    let clone = token.clone();
    clone.cancel();
    assert!(token.is_cancelled());
  }
}

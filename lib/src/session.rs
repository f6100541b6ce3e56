//! Odin/Loke session state machine: handshake, version query, part-size negotiation, session
//! open, PIT retrieval/upload, and end-of-session/reboot.

use std::time::Duration;

use crate::{
  framing::{CommandFrame, ReplyFrame},
  transport::Transport,
  Error, Result, COMMAND_TIMEOUT, FINALIZER_TIMEOUT, PIT_MAX_SIZE, PIT_READ_CHUNK,
};

const CMD_HANDSHAKE_REPLY_MAX: usize = 64;

const CMD_SESSION: u32 = 100;
const SUB_VERSION: u32 = 0;
const SUB_PART_SIZE: u32 = 5;
const SUB_SESSION_OPEN: u32 = 2;

const CMD_PIT: u32 = 101;
const SUB_PIT_REQUEST: u32 = 1;
const SUB_PIT_READ: u32 = 2;
const SUB_PIT_END: u32 = 3;

const CMD_END: u32 = 103;
const SUB_END_SESSION: u32 = 0;
const SUB_REBOOT: u32 = 1;

const DEFAULT_PART_SIZE_REQUEST: u32 = 0x10_0000;
const VERSION_QUERY_ARG: u32 = 4;

/// Tunables a caller may override from [`crate::config::Config`]; defaults match the protocol
/// constants named in the wire spec.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
  pub command_timeout: Duration,
  pub finalizer_timeout: Duration,
  /// Part size requested during negotiation when the device expresses a packet-size preference.
  pub part_size_request: u32,
}

impl Default for SessionConfig {
  fn default() -> Self {
    Self {
      command_timeout: COMMAND_TIMEOUT,
      finalizer_timeout: FINALIZER_TIMEOUT,
      part_size_request: DEFAULT_PART_SIZE_REQUEST,
    }
  }
}

impl SessionConfig {
  /// Build a `SessionConfig` from an optional CLI-facing `Config`, falling back to protocol
  /// defaults for anything left unset.
  pub fn from_config(config: Option<&crate::config::Config>) -> Self {
    let mut session_config = Self::default();
    if let Some(config) = config {
      session_config.command_timeout = Duration::from_secs(config.timeouts.command_secs);
      session_config.finalizer_timeout = Duration::from_secs(config.timeouts.finalizer_secs);
      if let Some(packet_size) = config.packet_size_override {
        session_config.part_size_request = packet_size;
      }
    }
    session_config
  }
}

/// Phases of one Odin/Loke session, in the order the protocol moves through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
  Disconnected,
  Handshaking,
  Negotiated,
  Setup,
  Ready,
  Transferring,
  Closing,
  Rebooting,
  Failed,
}

/// Protocol version and preferred packet size recorded from the version query reply.
#[derive(Debug, Clone, Copy)]
pub struct DeviceCapabilities {
  pub protocol_version: u16,
  pub preferred_packet_size: u16,
}

/// Drives one device through the Odin/Loke session state machine over a [`Transport`].
pub struct Session<T: Transport> {
  transport: T,
  phase: SessionPhase,
  capabilities: Option<DeviceCapabilities>,
  config: SessionConfig,
}

impl<T: Transport> Session<T> {
  pub fn new(transport: T) -> Self {
    Self::with_config(transport, SessionConfig::default())
  }

  pub fn with_config(transport: T, config: SessionConfig) -> Self {
    Self { transport, phase: SessionPhase::Disconnected, capabilities: None, config }
  }

  pub fn phase(&self) -> SessionPhase {
    self.phase
  }

  pub fn config(&self) -> SessionConfig {
    self.config
  }

  pub fn capabilities(&self) -> Option<DeviceCapabilities> {
    self.capabilities
  }

  pub fn transport_mut(&mut self) -> &mut T {
    &mut self.transport
  }

  pub(crate) fn fail(&mut self, err: Error) -> Error {
    self.phase = SessionPhase::Failed;
    err
  }

  pub(crate) fn send_command(&mut self, frame: CommandFrame, expected_cmd: u32, timeout: Duration) -> Result<u32> {
    self.transport.write(frame.as_bytes()).map_err(|e| self.fail(e))?;
    let reply = self.transport.read(8, timeout).map_err(|e| self.fail(e))?;
    let reply = ReplyFrame::parse(&reply).map_err(|e| self.fail(e))?;
    reply.expect(expected_cmd).map_err(|e| self.fail(e))
  }

  /// Write exactly `ODIN`; accept only a reply whose first four bytes are `LOKE`.
  pub fn handshake(&mut self) -> Result<()> {
    tracing::debug!("sending handshake");
    self.transport.write(b"ODIN").map_err(|e| self.fail(e))?;
    let reply = self.transport.read(CMD_HANDSHAKE_REPLY_MAX, self.config.command_timeout).map_err(|e| self.fail(e))?;

    if reply.len() < 4 || &reply[0..4] != b"LOKE" {
      return Err(self.fail(Error::HandshakeFailed(reply)));
    }

    self.phase = SessionPhase::Handshaking;
    tracing::info!("handshake accepted");
    Ok(())
  }

  /// Query protocol version and device-preferred packet size, then optionally negotiate a
  /// part size if the device expressed a preference.
  pub fn negotiate(&mut self) -> Result<DeviceCapabilities> {
    let frame = CommandFrame::new(CMD_SESSION, SUB_VERSION).put_u32(8, VERSION_QUERY_ARG);
    let data = self.send_command(frame, CMD_SESSION, self.config.command_timeout)?;

    let capabilities =
      DeviceCapabilities { protocol_version: (data >> 16) as u16, preferred_packet_size: (data & 0xFFFF) as u16 };
    tracing::debug!(?capabilities, "negotiated version");

    if capabilities.preferred_packet_size != 0 {
      let frame = CommandFrame::new(CMD_SESSION, SUB_PART_SIZE).put_u32(8, self.config.part_size_request);
      self.send_command(frame, CMD_SESSION, self.config.command_timeout)?;
    }

    self.capabilities = Some(capabilities);
    self.phase = SessionPhase::Negotiated;
    Ok(capabilities)
  }

  /// Open the session, declaring the exact sum of post-decompression bytes to be transferred.
  pub fn open_session(&mut self, total_bytes: u64) -> Result<()> {
    tracing::debug!(total_bytes, "opening session");
    let frame = CommandFrame::new(CMD_SESSION, SUB_SESSION_OPEN).put_u64(8, total_bytes);
    self.send_command(frame, CMD_SESSION, self.config.command_timeout)?;
    self.phase = SessionPhase::Setup;
    Ok(())
  }

  /// Retrieve the device's PIT. No-op shortcut for protocol version <= 3 is the caller's
  /// decision (based on [`DeviceCapabilities::protocol_version`]); this always performs the
  /// full receive sequence.
  pub fn receive_pit(&mut self) -> Result<Vec<u8>> {
    let request = CommandFrame::new(CMD_PIT, SUB_PIT_REQUEST).put_u32(8, 0);
    let pit_size = self.send_command(request, CMD_PIT, self.config.command_timeout)?;

    if pit_size == 0 || pit_size > PIT_MAX_SIZE {
      return Err(self.fail(Error::InvalidPit(format!("device reported implausible pit_size {pit_size}"))));
    }
    tracing::debug!(pit_size, "receiving pit");

    let mut accumulated = Vec::with_capacity(pit_size as usize);
    let mut counter: u32 = 0;
    while (accumulated.len() as u32) < pit_size {
      let frame = CommandFrame::new(CMD_PIT, SUB_PIT_READ).put_u32(8, counter);
      self.transport.write(frame.as_bytes()).map_err(|e| self.fail(e))?;
      let chunk = self.transport.read(PIT_READ_CHUNK, self.config.command_timeout).map_err(|e| self.fail(e))?;
      if chunk.is_empty() {
        return Err(self.fail(Error::InvalidPit("device returned empty pit chunk before completion".into())));
      }
      accumulated.extend_from_slice(&chunk);
      counter += 1;
    }
    accumulated.truncate(pit_size as usize);

    let end = CommandFrame::new(CMD_PIT, SUB_PIT_END).put_u32(8, 0);
    self.send_command(end, CMD_PIT, self.config.command_timeout)?;

    self.phase = SessionPhase::Ready;
    Ok(accumulated)
  }

  /// Move straight from `Setup` to `Ready` without a PIT exchange, for protocol versions (<= 3)
  /// whose `sendPitInfo` step is a no-op success path.
  pub fn skip_pit(&mut self) {
    self.phase = SessionPhase::Ready;
  }

  /// Upload a PIT (rarely needed: repartitioning flows), streaming it in 1 MiB chunks.
  pub fn upload_pit(&mut self, bytes: &[u8]) -> Result<()> {
    const UPLOAD_CHUNK: usize = 1024 * 1024;

    let request = CommandFrame::new(CMD_PIT, SUB_PIT_REQUEST).put_u32(8, bytes.len() as u32);
    self.send_command(request, CMD_PIT, self.config.command_timeout)?;

    for chunk in bytes.chunks(UPLOAD_CHUNK) {
      self.transport.write(chunk).map_err(|e| self.fail(e))?;
      let reply = self.transport.read(8, self.config.command_timeout).map_err(|e| self.fail(e))?;
      ReplyFrame::parse(&reply).map_err(|e| self.fail(e))?.expect(CMD_PIT).map_err(|e| self.fail(e))?;
    }

    let end = CommandFrame::new(CMD_PIT, SUB_PIT_END).put_u32(8, 0);
    self.send_command(end, CMD_PIT, self.config.command_timeout)?;
    self.phase = SessionPhase::Ready;
    Ok(())
  }

  pub fn begin_transferring(&mut self) {
    self.phase = SessionPhase::Transferring;
  }

  /// End the session. Must be called before an optional reboot.
  pub fn end_session(&mut self) -> Result<()> {
    self.phase = SessionPhase::Closing;
    let frame = CommandFrame::new(CMD_END, SUB_END_SESSION).put_u32(8, 0);
    self.send_command(frame, CMD_END, self.config.command_timeout)?;
    Ok(())
  }

  /// Request a reboot. The device commonly terminates the link mid-reply; that is expected and
  /// not reported as an error.
  pub fn reboot(&mut self) -> Result<()> {
    self.phase = SessionPhase::Rebooting;
    let frame = CommandFrame::new(CMD_END, SUB_REBOOT).put_u32(8, 0);
    self.transport.write(frame.as_bytes())?;
    match self.transport.read(8, self.config.command_timeout) {
      Ok(_) | Err(Error::Timeout { .. }) | Err(Error::UsbError(_)) => {}
      Err(e) => return Err(e),
    }
    self.phase = SessionPhase::Disconnected;
    Ok(())
  }
}

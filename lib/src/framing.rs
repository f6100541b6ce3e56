//! Little-endian command/reply framing for the Odin/Loke wire protocol.
//!
//! Command frames are always exactly [`COMMAND_PACKET_SIZE`] bytes, zero-padded past the
//! payload. Reply frames are always exactly [`REPLY_PACKET_SIZE`] bytes.

use crate::{Error, Result};

/// Fixed size of every command frame sent to the device. Invariant, never negotiated.
pub const COMMAND_PACKET_SIZE: usize = 1024;
/// Fixed size of every reply frame read from the device.
pub const REPLY_PACKET_SIZE: usize = 8;
/// `cmd_echo` value indicating the device refused the previous command.
pub const REFUSAL: u32 = 0xFFFF_FFFF;

/// A 1024-byte outbound command packet: `cmd:u32, sub:u32, payload.., 0-padded`.
#[derive(Clone)]
pub struct CommandFrame {
  buf: [u8; COMMAND_PACKET_SIZE],
}

impl CommandFrame {
  /// Start a new frame with the given command and subcommand at offsets 0 and 4.
  pub fn new(cmd: u32, sub: u32) -> Self {
    let mut buf = [0u8; COMMAND_PACKET_SIZE];
    buf[0..4].copy_from_slice(&cmd.to_le_bytes());
    buf[4..8].copy_from_slice(&sub.to_le_bytes());
    Self { buf }
  }

  /// Write a little-endian `u32` at `offset`.
  pub fn put_u32(mut self, offset: usize, value: u32) -> Self {
    self.buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    self
  }

  /// Write a little-endian `u64` at `offset`.
  pub fn put_u64(mut self, offset: usize, value: u64) -> Self {
    self.buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    self
  }

  pub fn as_bytes(&self) -> &[u8; COMMAND_PACKET_SIZE] {
    &self.buf
  }
}

/// An 8-byte inbound reply: `cmd_echo:u32, data:u32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyFrame {
  pub cmd_echo: u32,
  pub data: u32,
}

impl ReplyFrame {
  /// Parse a reply from the bytes actually read off the transport.
  ///
  /// Any read shorter than [`REPLY_PACKET_SIZE`] is a framing error, per protocol.
  pub fn parse(bytes: &[u8]) -> Result<Self> {
    if bytes.len() < REPLY_PACKET_SIZE {
      return Err(Error::Framing(format!(
        "short reply: expected {REPLY_PACKET_SIZE} bytes, got {}",
        bytes.len()
      )));
    }
    let cmd_echo = u32::from_le_bytes(bytes[0..4].try_into()?);
    let data = u32::from_le_bytes(bytes[4..8].try_into()?);
    Ok(Self { cmd_echo, data })
  }

  /// `true` if the device refused the command this reply answers.
  pub fn is_refusal(&self) -> bool {
    self.cmd_echo == REFUSAL
  }

  /// Validate that this reply answers `expected_cmd`, turning a mismatch or refusal into the
  /// appropriate protocol error.
  pub fn expect(&self, expected_cmd: u32) -> Result<u32> {
    if self.is_refusal() {
      return Err(Error::Refused(self.data));
    }
    if self.cmd_echo != expected_cmd {
      return Err(Error::ProtocolMismatch {
        expected_cmd,
        got_cmd: self.cmd_echo,
        got_data: self.data,
      });
    }
    Ok(self.data)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn command_frame_is_always_1024_bytes() {
    let frame = CommandFrame::new(100, 2).put_u64(8, 12345);
    assert_eq!(frame.as_bytes().len(), COMMAND_PACKET_SIZE);
    assert_eq!(&frame.as_bytes()[0..4], &100u32.to_le_bytes());
    assert_eq!(&frame.as_bytes()[4..8], &2u32.to_le_bytes());
    assert_eq!(&frame.as_bytes()[8..16], &12345u64.to_le_bytes());
    assert!(frame.as_bytes()[16..].iter().all(|&b| b == 0));
  }

  #[test]
  fn reply_frame_rejects_short_reads() {
    let err = ReplyFrame::parse(&[1, 2, 3]).unwrap_err();
    assert!(matches!(err, Error::Framing(_)));
  }

  #[test]
  fn reply_frame_detects_refusal() {
    let mut bytes = REFUSAL.to_le_bytes().to_vec();
    bytes.extend_from_slice(&7u32.to_le_bytes());
    let reply = ReplyFrame::parse(&bytes).unwrap();
    assert!(reply.is_refusal());
    assert_eq!(reply.expect(100).unwrap_err().to_string(), Error::Refused(7).to_string());
  }

  #[test]
  fn reply_frame_matches_expected_cmd() {
    let mut bytes = 100u32.to_le_bytes().to_vec();
    bytes.extend_from_slice(&42u32.to_le_bytes());
    let reply = ReplyFrame::parse(&bytes).unwrap();
    assert_eq!(reply.expect(100).unwrap(), 42);
    assert!(reply.expect(101).is_err());
  }
}

//! Transfer pipeline: activates a partition transfer, then drives the chunk/block/finalizer
//! loop that actually moves one member's bytes to the device.

use crate::{
  framing::CommandFrame, session::Session, transport::Transport, Error, Result, FILE_BLOCK_SIZE, INTER_PHASE_WAIT,
  MAX_CHUNK,
};

const CMD_TRANSFER: u32 = 102;
const SUB_ACTIVATE: u32 = 0;
const SUB_CHUNK: u32 = 2;
const SUB_FINALIZE: u32 = 3;

/// Drives the per-member chunk/block/finalizer protocol over an already-open [`Session`].
pub struct TransferPipeline<'a, T: Transport> {
  session: &'a mut Session<T>,
}

impl<'a, T: Transport> TransferPipeline<'a, T> {
  pub fn new(session: &'a mut Session<T>) -> Self {
    session.begin_transferring();
    Self { session }
  }

  /// Activate a new member transfer. Must precede the first chunk.
  pub fn activate(&mut self) -> Result<()> {
    let frame = CommandFrame::new(CMD_TRANSFER, SUB_ACTIVATE).put_u32(8, 0);
    self.session.send_command(frame, CMD_TRANSFER, self.session.config().command_timeout)?;
    Ok(())
  }

  /// Send one chunk of up to [`MAX_CHUNK`] bytes, blocking it into [`FILE_BLOCK_SIZE`] writes
  /// and finalizing with the given destination metadata. `completion` marks the final chunk of
  /// the member.
  pub fn send_chunk(
    &mut self,
    data: &[u8],
    device_type: u32,
    partition_id: u32,
    completion: bool,
  ) -> Result<()> {
    if data.len() > MAX_CHUNK {
      return Err(self.session.fail(Error::Framing(format!(
        "chunk of {} bytes exceeds MAX_CHUNK ({MAX_CHUNK})",
        data.len()
      ))));
    }

    let command_timeout = self.session.config().command_timeout;

    let header = CommandFrame::new(CMD_TRANSFER, SUB_CHUNK).put_u32(8, data.len() as u32);
    self.session.send_command(header, CMD_TRANSFER, command_timeout)?;
    std::thread::sleep(INTER_PHASE_WAIT);

    // Full blocks are written straight out of `data`; only the trailing partial block is copied,
    // into one reused FILE_BLOCK_SIZE scratch buffer, so peak memory never doubles the chunk.
    let mut scratch = vec![0u8; FILE_BLOCK_SIZE];

    for (index, slice) in data.chunks(FILE_BLOCK_SIZE).enumerate() {
      if index != 0 {
        self.session.transport_mut().zero_length_write()?;
      }

      let block: &[u8] = if slice.len() == FILE_BLOCK_SIZE {
        slice
      } else {
        scratch[..slice.len()].copy_from_slice(slice);
        scratch[slice.len()..].fill(0);
        &scratch
      };

      self.session.transport_mut().write(block)?;
      let reply = self.session.transport_mut().read(8, command_timeout)?;
      crate::framing::ReplyFrame::parse(&reply)?.expect(CMD_TRANSFER)?;
    }

    self.finalize(data.len() as u32, device_type, partition_id, completion)
  }

  fn finalize(&mut self, actual_bytes: u32, device_type: u32, partition_id: u32, completion: bool) -> Result<()> {
    self.session.transport_mut().zero_length_write()?;

    let frame = CommandFrame::new(CMD_TRANSFER, SUB_FINALIZE)
      .put_u32(8, 0) // destination: phone
      .put_u32(12, actual_bytes)
      .put_u32(16, 0)
      .put_u32(20, device_type)
      .put_u32(24, partition_id)
      .put_u32(28, completion as u32);
    self.session.transport_mut().write(frame.as_bytes())?;

    self.session.transport_mut().zero_length_write()?;

    match self.read_finalizer_reply(partition_id) {
      Ok(()) => Ok(()),
      Err(Error::Timeout { .. }) | Err(Error::UsbError(_)) if completion => {
        tracing::debug!("no finalizer reply on final chunk, tolerated");
        Ok(())
      }
      Err(e) => Err(self.session.fail(e)),
    }
  }

  fn read_finalizer_reply(&mut self, partition_id: u32) -> Result<()> {
    let finalizer_timeout = self.session.config().finalizer_timeout;
    let reply = self.session.transport_mut().read(8, finalizer_timeout)?;
    let reply = crate::framing::ReplyFrame::parse(&reply)?;
    if reply.is_refusal() {
      return Err(Error::TransferRejected { error_code: reply.data, partition_id });
    }
    Ok(())
  }
}

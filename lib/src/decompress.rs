//! Streaming decompression wrappers.
//!
//! The LZ4 frame/block format and RFC 1952 GZIP format are owned entirely by `lz4_flex` and
//! `flate2` respectively — this module only enforces the streaming discipline the pipeline
//! needs: read one bounded buffer at a time, hand it to a sink, and never materialize the full
//! decompressed payload.

use std::io::Read;

use flate2::read::GzDecoder;
use lz4_flex::frame::FrameDecoder;

use crate::{Error, Result, MAX_DECOMPRESSED_BLOCK};

/// Drive `reader` to completion, invoking `sink` with each bounded block of decompressed bytes
/// until EOF. `sink` returning `Err` aborts the stream and propagates the error.
fn pump<R: Read>(mut reader: R, mut position: u64, mut sink: impl FnMut(&[u8]) -> Result<()>) -> Result<()> {
  let mut buf = vec![0u8; MAX_DECOMPRESSED_BLOCK];
  loop {
    let read = reader.read(&mut buf).map_err(|e| Error::Decompression { position, reason: e.to_string() })?;
    if read == 0 {
      return Ok(());
    }
    sink(&buf[..read])?;
    position += read as u64;
  }
}

/// Stream-decode an LZ4 frame, delivering decompressed bytes to `sink` in blocks no larger
/// than [`MAX_DECOMPRESSED_BLOCK`].
pub fn decode_lz4(reader: impl Read, sink: impl FnMut(&[u8]) -> Result<()>) -> Result<()> {
  pump(FrameDecoder::new(reader), 0, sink)
}

/// Stream-decode a GZIP stream, delivering decompressed bytes to `sink` in blocks no larger
/// than [`MAX_DECOMPRESSED_BLOCK`].
pub fn decode_gzip(reader: impl Read, sink: impl FnMut(&[u8]) -> Result<()>) -> Result<()> {
  pump(GzDecoder::new(reader), 0, sink)
}

#[cfg(test)]
mod tests {
  use super::*;
  use lz4_flex::frame::FrameEncoder;
  use std::io::{Cursor, Write};

  #[test]
  fn lz4_round_trip_stays_bounded() {
    let original = vec![7u8; 5 * 1024 * 1024];
    let mut compressed = Vec::new();
    {
      let mut encoder = FrameEncoder::new(&mut compressed);
      encoder.write_all(&original).unwrap();
      encoder.finish().unwrap();
    }

    let mut decoded = Vec::new();
    decode_lz4(Cursor::new(compressed), |block| {
      assert!(block.len() <= MAX_DECOMPRESSED_BLOCK);
      decoded.extend_from_slice(block);
      Ok(())
    })
    .unwrap();

    assert_eq!(decoded, original);
  }

  #[test]
  fn gzip_round_trip_stays_bounded() {
    use flate2::{write::GzEncoder, Compression};

    let original = vec![9u8; 1024 * 1024];
    let mut compressed = Vec::new();
    {
      let mut encoder = GzEncoder::new(&mut compressed, Compression::default());
      encoder.write_all(&original).unwrap();
      encoder.finish().unwrap();
    }

    let mut decoded = Vec::new();
    decode_gzip(Cursor::new(compressed), |block| {
      assert!(block.len() <= MAX_DECOMPRESSED_BLOCK);
      decoded.extend_from_slice(block);
      Ok(())
    })
    .unwrap();

    assert_eq!(decoded, original);
  }

  #[test]
  fn invalid_lz4_input_reports_decompression_error() {
    let garbage = vec![1u8, 2, 3, 4, 5, 6, 7, 8];
    let err = decode_lz4(Cursor::new(garbage), |_| Ok(())).unwrap_err();
    assert!(matches!(err, Error::Decompression { .. }));
  }
}

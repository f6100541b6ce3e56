//! Streaming TAR archive reader.
//!
//! Parses a concatenation of 512-byte USTAR headers and data regions without ever reading a
//! member's body during the initial pass — callers draw member bytes later through a
//! random-access handle over the same file. This is hand-rolled rather than built on the
//! generic `tar` crate because that crate exposes a single sequential `Read` pass; here we need
//! repeatable random-access reads into arbitrary byte ranges (including a second pass into a
//! member that is itself a nested TAR).

use std::{
  fs::File,
  io::{Read, Seek, SeekFrom},
  path::Path,
};

use crate::{Error, Result};

const BLOCK_SIZE: u64 = 512;
const NAME_RANGE: std::ops::Range<usize> = 0..100;
const SIZE_RANGE: std::ops::Range<usize> = 124..136;

const NESTED_EXTENSIONS: &[&str] = &[".ap", ".bl", ".cp", ".csc"];

/// A single member discovered while scanning a TAR archive. Owns no bytes; the body is read on
/// demand from `(data_offset, size_bytes)` within the enclosing file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
  pub name: String,
  pub size_bytes: u64,
  pub data_offset: u64,
  pub is_nested_archive: bool,
}

impl Member {
  /// Whether this member's name marks it as a nested archive (recognized by extension).
  fn detect_nested(name: &str) -> bool {
    name.ends_with(".tar") || name.contains(".tar.") || NESTED_EXTENSIONS.iter().any(|ext| name.ends_with(ext))
  }
}

/// A streaming TAR reader over a single on-disk file, or over a nested TAR region starting at
/// `base` within that file.
pub struct ArchiveReader {
  file: File,
  base: u64,
  /// MD5 digest recovered from an optional Samsung `<hex>  <filename>\n` tail line.
  pub outer_md5: Option<String>,
}

impl ArchiveReader {
  pub fn open(path: &Path) -> Result<Self> {
    Ok(Self { file: File::open(path)?, base: 0, outer_md5: None })
  }

  /// Scan the archive region (from `base` to EOF) and return every member header found, in
  /// file order. Stops at the first fully-zero 512-byte block, then looks for an optional
  /// trailing `<32-hex>  <filename>\n` MD5 line. Member offsets are absolute file positions.
  pub fn members(&mut self) -> Result<Vec<Member>> {
    let file_len = self.file.seek(SeekFrom::End(0))?;

    let mut members = Vec::new();
    let mut cursor: u64 = self.base;
    let mut header = [0u8; BLOCK_SIZE as usize];

    loop {
      if cursor + BLOCK_SIZE > file_len {
        break;
      }
      self.file.seek(SeekFrom::Start(cursor))?;
      self.file.read_exact(&mut header)?;

      if header.iter().all(|&b| b == 0) {
        cursor += BLOCK_SIZE;
        break;
      }

      let name = parse_name(&header)?;
      let size = parse_octal_size(&header)?;
      let data_offset = cursor + BLOCK_SIZE;

      members.push(Member { is_nested_archive: Member::detect_nested(&name), name, size_bytes: size, data_offset });

      let padded_size = size.div_ceil(BLOCK_SIZE) * BLOCK_SIZE;
      cursor = data_offset + padded_size;
    }

    self.outer_md5 = self.read_trailing_md5(cursor, file_len)?;
    Ok(members)
  }

  /// Parse the optional Samsung `.tar.md5` tail: a line of `<32-hex>  <filename>\n` that
  /// follows the TAR's terminating zero blocks. Only this tail-line format is recognized;
  /// a header-prefixed MD5 is treated as unsupported.
  fn read_trailing_md5(&mut self, tar_end: u64, file_len: u64) -> Result<Option<String>> {
    if tar_end >= file_len {
      return Ok(None);
    }
    self.file.seek(SeekFrom::Start(tar_end))?;
    let mut tail = Vec::new();
    self.file.read_to_end(&mut tail)?;

    let text = match std::str::from_utf8(&tail) {
      Ok(text) => text,
      Err(_) => return Ok(None),
    };
    let line = text.lines().find(|line| !line.trim().is_empty());
    let Some(line) = line else { return Ok(None) };

    let hex = &line[..line.len().min(32)];
    let is_hex = hex.len() == 32 && hex.chars().all(|c| c.is_ascii_hexdigit());
    if is_hex && line[32..].starts_with("  ") {
      Ok(Some(hex.to_lowercase()))
    } else {
      Ok(None)
    }
  }

  /// Open a random-access reader over one member's byte range.
  pub fn open_member(&self, member: &Member) -> Result<MemberReader> {
    Ok(MemberReader {
      file: self.file.try_clone()?,
      start: member.data_offset,
      len: member.size_bytes,
      pos: 0,
    })
  }

  /// Descend into a member already marked [`Member::is_nested_archive`], scanning it as an
  /// independent TAR region without copying its bytes out of the parent file.
  pub fn open_nested(&self, member: &Member) -> Result<ArchiveReader> {
    Ok(ArchiveReader { file: self.file.try_clone()?, base: member.data_offset, outer_md5: None })
  }
}

fn parse_name(header: &[u8; BLOCK_SIZE as usize]) -> Result<String> {
  let raw = &header[NAME_RANGE];
  let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
  Ok(String::from_utf8_lossy(&raw[..end]).trim().to_string())
}

fn parse_octal_size(header: &[u8; BLOCK_SIZE as usize]) -> Result<u64> {
  let raw = &header[SIZE_RANGE];
  let text = std::str::from_utf8(raw).map_err(|_| Error::ArchiveFormat("size field is not ASCII".into()))?;
  let trimmed = text.trim_matches(|c: char| c == '\0' || c == ' ');
  if trimmed.is_empty() {
    return Ok(0);
  }
  u64::from_str_radix(trimmed, 8).map_err(|e| Error::ArchiveFormat(format!("bad octal size {trimmed:?}: {e}")))
}

/// A random-access byte-range reader over one member's body within the enclosing TAR file.
/// Bounded to exactly `len` bytes regardless of what follows it in the file.
pub struct MemberReader {
  file: File,
  start: u64,
  len: u64,
  pos: u64,
}

impl Read for MemberReader {
  fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
    let remaining = self.len - self.pos;
    if remaining == 0 {
      return Ok(0);
    }
    let want = (buf.len() as u64).min(remaining) as usize;
    self.file.seek(SeekFrom::Start(self.start + self.pos))?;
    let read = self.file.read(&mut buf[..want])?;
    self.pos += read as u64;
    Ok(read)
  }
}

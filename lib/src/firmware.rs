//! Loaded firmware: the member list produced by the archive reader, enriched with compression
//! classification and the skip policy applied before a transfer.

use std::path::{Path, PathBuf};

use crate::{archive::ArchiveReader, pit::Pit, Member, Result};

/// Per-member compression, inferred from its filename.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
  None,
  Lz4,
  Gzip,
}

impl Compression {
  fn from_name(name: &str) -> Self {
    if name.ends_with(".lz4") {
      Compression::Lz4
    } else if name.ends_with(".gz") {
      Compression::Gzip
    } else {
      Compression::None
    }
  }
}

/// What to do with one archive member once the skip policy and PIT-member carve-out have been
/// applied.
#[derive(Debug, Clone)]
pub enum MemberRole {
  /// Upload as partition content.
  Flash { member: Member, compression: Compression },
  /// This member's bytes are a PIT to use for matching/upload, not partition content.
  EmbeddedPit { member: Member },
  /// Silently dropped per the skip policy (`meta-data/`, `.zip`, or zero-length).
  Skipped { member: Member },
}

/// Bound on how deep a chain of nested archives (archive-within-archive) is followed before its
/// members are flattened straight through as ordinary flash content instead.
const MAX_NESTING_DEPTH: u32 = 4;

/// A fully loaded firmware distribution: the archive's member list plus any embedded PIT and
/// outer MD5 digest.
pub struct Firmware {
  pub path: PathBuf,
  pub members: Vec<MemberRole>,
  pub outer_md5: Option<String>,
  pub embedded_pit: Option<Pit>,
}

impl Firmware {
  /// Scan `path` as a TAR (optionally `.tar.md5`) archive and classify every member, descending
  /// into nested archive members (themselves recognized and scanned as independent TAR regions)
  /// so that their contents are flattened into the same flat member list.
  pub fn load(path: &Path) -> Result<Self> {
    let mut reader = ArchiveReader::open(path)?;
    let raw_members = reader.members()?;

    let mut members = Vec::with_capacity(raw_members.len());
    let mut embedded_pit = None;
    classify(&reader, raw_members, 0, &mut members, &mut embedded_pit)?;

    Ok(Self { path: path.to_path_buf(), members, outer_md5: reader.outer_md5.clone(), embedded_pit })
  }

  /// Open a random-access reader over `member`'s body, re-opening the backing archive file.
  pub fn open_member(&self, member: &Member) -> Result<crate::archive::MemberReader> {
    ArchiveReader::open(&self.path)?.open_member(member)
  }

  /// Flashable members only, in archive order.
  pub fn flashable(&self) -> impl Iterator<Item = (&Member, Compression)> {
    self.members.iter().filter_map(|role| match role {
      MemberRole::Flash { member, compression } => Some((member, *compression)),
      _ => None,
    })
  }
}

/// Apply the skip policy, PIT carve-out, and nested-archive descent to one level of `raw_members`,
/// appending the resulting roles to `members` in archive order.
fn classify(
  reader: &ArchiveReader,
  raw_members: Vec<Member>,
  depth: u32,
  members: &mut Vec<MemberRole>,
  embedded_pit: &mut Option<Pit>,
) -> Result<()> {
  for member in raw_members {
    if member.name.contains("meta-data/") || member.name.ends_with(".zip") {
      members.push(MemberRole::Skipped { member });
      continue;
    }
    if member.size_bytes == 0 {
      members.push(MemberRole::Skipped { member });
      continue;
    }
    if member.name.ends_with(".pit") {
      let mut body = Vec::new();
      std::io::Read::read_to_end(&mut reader.open_member(&member)?, &mut body)?;
      *embedded_pit = Some(Pit::parse(&body)?);
      members.push(MemberRole::EmbeddedPit { member });
      continue;
    }
    if member.is_nested_archive && depth < MAX_NESTING_DEPTH {
      let mut nested = reader.open_nested(&member)?;
      let nested_raw = nested.members()?;
      classify(&nested, nested_raw, depth + 1, members, embedded_pit)?;
      continue;
    }

    let compression = Compression::from_name(&member.name);
    members.push(MemberRole::Flash { member, compression });
  }
  Ok(())
}

impl std::fmt::Debug for Firmware {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Firmware")
      .field("members", &self.members.len())
      .field("embedded_pit", &self.embedded_pit.is_some())
      .field("outer_md5", &self.outer_md5)
      .finish()
  }
}

/// Verify the optional outer MD5 digest against the archive's raw bytes.
///
/// Optional verification only — a missing digest is not an error, and callers decide whether a
/// mismatch should abort a flash.
pub fn verify_outer_md5(path: &Path, expected: &str) -> Result<bool> {
  use md5::{Digest, Md5};
  use std::io::Read;

  let mut file = std::fs::File::open(path)?;
  let mut hasher = Md5::new();
  let mut buf = [0u8; 64 * 1024];
  loop {
    let read = file.read(&mut buf)?;
    if read == 0 {
      break;
    }
    hasher.update(&buf[..read]);
  }
  let digest = hex_lower(&hasher.finalize());
  Ok(digest.eq_ignore_ascii_case(expected))
}

fn hex_lower(bytes: &[u8]) -> String {
  bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::{fs::File, io::Write};

  fn header(name: &str, size: u64) -> [u8; 512] {
    let mut block = [0u8; 512];
    block[0..name.len()].copy_from_slice(name.as_bytes());
    let octal = format!("{size:011o}\0");
    block[124..124 + octal.len()].copy_from_slice(octal.as_bytes());
    block
  }

  #[test]
  fn skip_policy_and_pit_carve_out() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("firmware.tar");
    let mut file = File::create(&path).unwrap();

    // meta-data/ member: skipped
    file.write_all(&header("meta-data/foo.txt", 4)).unwrap();
    file.write_all(b"data").unwrap();
    file.write_all(&[0u8; 508]).unwrap();

    // zero-length member: skipped
    file.write_all(&header("empty.bin", 0)).unwrap();

    // flashable member
    file.write_all(&header("boot.img.lz4", 5)).unwrap();
    file.write_all(b"abcde").unwrap();
    file.write_all(&[0u8; 507]).unwrap();

    // embedded pit
    let mut pit_bytes = vec![0u8; 28];
    pit_bytes[0..4].copy_from_slice(&crate::pit::PIT_MAGIC.to_le_bytes());
    file.write_all(&header("device.pit", pit_bytes.len() as u64)).unwrap();
    file.write_all(&pit_bytes).unwrap();
    file.write_all(&vec![0u8; 512 - pit_bytes.len()]).unwrap();

    file.write_all(&[0u8; 1024]).unwrap();
    drop(file);

    let firmware = Firmware::load(&path).unwrap();
    assert_eq!(firmware.flashable().count(), 1);
    assert!(firmware.embedded_pit.is_some());

    let skipped: Vec<_> = firmware
      .members
      .iter()
      .filter(|m| matches!(m, MemberRole::Skipped { .. }))
      .collect();
    assert_eq!(skipped.len(), 2);
  }

  #[test]
  fn nested_archive_is_flattened() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("firmware.tar");
    let mut file = File::create(&path).unwrap();

    // inner tar: one flashable member, properly terminated within its own region.
    let mut inner = Vec::new();
    inner.extend_from_slice(&header("modem.bin.lz4", 4));
    inner.extend_from_slice(b"abcd");
    inner.extend_from_slice(&[0u8; 508]);
    inner.extend_from_slice(&[0u8; 1024]); // terminator

    file.write_all(&header("cache.tar", inner.len() as u64)).unwrap();
    file.write_all(&inner).unwrap();
    file.write_all(&[0u8; 1024]).unwrap(); // outer terminator
    drop(file);

    let firmware = Firmware::load(&path).unwrap();
    let flashable: Vec<_> = firmware.flashable().collect();
    assert_eq!(flashable.len(), 1);
    assert_eq!(flashable[0].0.name, "modem.bin.lz4");
    assert_eq!(flashable[0].1, Compression::Lz4);
  }

  #[test]
  fn compression_inferred_from_extension() {
    assert_eq!(Compression::from_name("boot.img.lz4"), Compression::Lz4);
    assert_eq!(Compression::from_name("system.img.gz"), Compression::Gzip);
    assert_eq!(Compression::from_name("modem.bin"), Compression::None);
  }
}

//! Binary codec for the Partition Information Table (PIT).

use crate::{Error, Result};

/// Fixed PIT header magic.
pub const PIT_MAGIC: u32 = 0x1234_9876;
const HEADER_SIZE: usize = 28;
const ENTRY_SIZE: usize = 132;
const ENTRY_STRING_SIZE: usize = 32;
/// Nine little-endian u32 fields precede the three strings in each entry.
const ENTRY_U32_FIELDS: usize = 9;

/// A single partition's record in the PIT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PitEntry {
  pub binary_type: u32,
  pub device_type: u32,
  pub partition_id: u32,
  pub partition_type: u32,
  pub filesystem: u32,
  pub start_block: u32,
  pub num_blocks: u32,
  pub file_offset: u32,
  pub file_size: u32,
  pub partition_name: String,
  pub flash_filename: String,
  pub fota_filename: String,
}

impl PitEntry {
  fn parse(bytes: &[u8]) -> Result<Self> {
    if bytes.len() < ENTRY_SIZE {
      return Err(Error::InvalidPit(format!(
        "entry truncated: expected {ENTRY_SIZE} bytes, got {}",
        bytes.len()
      )));
    }

    let mut fields = [0u32; ENTRY_U32_FIELDS];
    for (i, field) in fields.iter_mut().enumerate() {
      let offset = i * 4;
      *field = u32::from_le_bytes(bytes[offset..offset + 4].try_into()?);
    }
    let strings_start = ENTRY_U32_FIELDS * 4;

    Ok(Self {
      binary_type: fields[0],
      device_type: fields[1],
      partition_id: fields[2],
      partition_type: fields[3],
      filesystem: fields[4],
      start_block: fields[5],
      num_blocks: fields[6],
      file_offset: fields[7],
      file_size: fields[8],
      partition_name: read_fixed_string(&bytes[strings_start..strings_start + ENTRY_STRING_SIZE]),
      flash_filename: read_fixed_string(&bytes[strings_start + ENTRY_STRING_SIZE..strings_start + 2 * ENTRY_STRING_SIZE]),
      fota_filename: read_fixed_string(&bytes[strings_start + 2 * ENTRY_STRING_SIZE..strings_start + 3 * ENTRY_STRING_SIZE]),
    })
  }

  fn serialize(&self, out: &mut Vec<u8>) {
    for field in [
      self.binary_type,
      self.device_type,
      self.partition_id,
      self.partition_type,
      self.filesystem,
      self.start_block,
      self.num_blocks,
      self.file_offset,
      self.file_size,
    ] {
      out.extend_from_slice(&field.to_le_bytes());
    }
    write_fixed_string(out, &self.partition_name);
    write_fixed_string(out, &self.flash_filename);
    write_fixed_string(out, &self.fota_filename);
  }
}

fn read_fixed_string(bytes: &[u8]) -> String {
  let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
  String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn write_fixed_string(out: &mut Vec<u8>, value: &str) {
  let mut field = [0u8; ENTRY_STRING_SIZE];
  let bytes = value.as_bytes();
  let len = bytes.len().min(ENTRY_STRING_SIZE - 1);
  field[..len].copy_from_slice(&bytes[..len]);
  out.extend_from_slice(&field);
}

/// The parsed Partition Information Table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pit {
  pub entries: Vec<PitEntry>,
}

impl Pit {
  /// Parse a PIT binary, validating the magic and exact entry count.
  pub fn parse(bytes: &[u8]) -> Result<Self> {
    if bytes.len() < HEADER_SIZE {
      return Err(Error::InvalidPit(format!(
        "header truncated: expected at least {HEADER_SIZE} bytes, got {}",
        bytes.len()
      )));
    }

    let magic = u32::from_le_bytes(bytes[0..4].try_into()?);
    if magic != PIT_MAGIC {
      return Err(Error::InvalidPit(format!("bad magic: {magic:#X}")));
    }
    let count = u32::from_le_bytes(bytes[4..8].try_into()?) as usize;

    let required = HEADER_SIZE + count * ENTRY_SIZE;
    if bytes.len() < required {
      return Err(Error::InvalidPit(format!(
        "truncated: header declares {count} entries ({required} bytes), got {}",
        bytes.len()
      )));
    }

    let mut entries = Vec::with_capacity(count);
    for i in 0..count {
      let start = HEADER_SIZE + i * ENTRY_SIZE;
      entries.push(PitEntry::parse(&bytes[start..start + ENTRY_SIZE])?);
    }

    Ok(Self { entries })
  }

  /// Serialize back to the exact binary layout `parse` understands.
  pub fn serialize(&self) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_SIZE + self.entries.len() * ENTRY_SIZE);
    out.extend_from_slice(&PIT_MAGIC.to_le_bytes());
    out.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());
    // remaining header bytes are reserved/unused and stay zero.
    out.resize(HEADER_SIZE, 0);
    for entry in &self.entries {
      entry.serialize(&mut out);
    }
    out
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn sample_entry(name: &str, flash: &str, id: u32) -> PitEntry {
    PitEntry {
      binary_type: 0,
      device_type: 2,
      partition_id: id,
      partition_type: 0,
      filesystem: 0,
      start_block: 0,
      num_blocks: 100,
      file_offset: 0,
      file_size: 0,
      partition_name: name.to_string(),
      flash_filename: flash.to_string(),
      fota_filename: String::new(),
    }
  }

  #[test]
  fn round_trip() {
    let pit = Pit {
      entries: vec![
        sample_entry("BOOTLOADER", "sboot.bin", 80),
        sample_entry("BOOT", "boot.img", 3),
      ],
    };
    let bytes = pit.serialize();
    let parsed = Pit::parse(&bytes).unwrap();
    assert_eq!(parsed, pit);
    assert_eq!(parsed.serialize(), bytes);
  }

  #[test]
  fn rejects_bad_magic() {
    let mut bytes = vec![0u8; HEADER_SIZE];
    bytes[0..4].copy_from_slice(&0xdeadbeefu32.to_le_bytes());
    assert!(matches!(Pit::parse(&bytes), Err(Error::InvalidPit(_))));
  }

  #[test]
  fn rejects_truncated_entries() {
    let mut bytes = vec![0u8; HEADER_SIZE];
    bytes[0..4].copy_from_slice(&PIT_MAGIC.to_le_bytes());
    bytes[4..8].copy_from_slice(&2u32.to_le_bytes());
    // only room for one entry's worth of extra bytes, not two.
    bytes.extend_from_slice(&vec![0u8; ENTRY_SIZE]);
    assert!(matches!(Pit::parse(&bytes), Err(Error::InvalidPit(_))));
  }

  #[test]
  fn scenario_s2_two_named_entries() {
    let mut bytes = vec![0u8; HEADER_SIZE];
    bytes[0..4].copy_from_slice(&PIT_MAGIC.to_le_bytes());
    bytes[4..8].copy_from_slice(&2u32.to_le_bytes());
    let pit = Pit {
      entries: vec![sample_entry("BOOTLOADER", "sboot.bin", 80), sample_entry("BOOT", "boot.img", 3)],
    };
    for entry in &pit.entries {
      entry.serialize(&mut bytes);
    }
    let parsed = Pit::parse(&bytes).unwrap();
    assert_eq!(parsed.entries.len(), 2);
    assert_eq!(parsed.entries[0].partition_name, "BOOTLOADER");
    assert_eq!(parsed.entries[1].partition_name, "BOOT");
    assert_eq!(Pit::parse(&parsed.serialize()).unwrap(), parsed);
  }

  #[test]
  fn truncates_long_strings_and_null_terminates() {
    let long_name = "x".repeat(64);
    let entry = sample_entry(&long_name, "boot.img", 3);
    let mut out = Vec::new();
    entry.serialize(&mut out);
    assert_eq!(out.len(), ENTRY_SIZE);
    let reparsed = PitEntry::parse(&out).unwrap();
    assert_eq!(reparsed.partition_name.len(), ENTRY_STRING_SIZE - 1);
  }
}

//! Maps a firmware archive member's filename to the `(partition_id, device_type)` pair the
//! device expects in a transfer finalizer.

use crate::pit::Pit;

const COMPRESSION_AND_IMAGE_SUFFIXES: &[&str] = &[".lz4", ".gz", ".img", ".bin"];

/// Strip trailing compression/image suffixes from a member name, one at a time, until none
/// remain — `"boot.img.lz4"` strips `.lz4` then `.img` to reach `"boot"`.
pub fn base_name(name: &str) -> &str {
  let mut base = name;
  loop {
    match COMPRESSION_AND_IMAGE_SUFFIXES.iter().find_map(|suffix| base.strip_suffix(suffix)) {
      Some(stripped) => base = stripped,
      None => return base,
    }
  }
}

/// Strip only the `.img`/`.bin` image suffix, leaving any compression suffix untouched.
fn strip_img_bin(name: &str) -> &str {
  name.strip_suffix(".img").or_else(|| name.strip_suffix(".bin")).unwrap_or(name)
}

fn dash_normalize(name: &str) -> String {
  name.replace('-', "_")
}

/// Resolved destination for a partition content upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionTarget {
  pub partition_id: u32,
  pub device_type: u32,
}

/// Match `name` against the PIT, trying each rule in order and returning the first hit.
pub fn match_pit(name: &str, pit: &Pit) -> Option<PartitionTarget> {
  let base = base_name(name);

  for entry in &pit.entries {
    if name.eq_ignore_ascii_case(&entry.flash_filename) {
      return Some(PartitionTarget { partition_id: entry.partition_id, device_type: entry.device_type });
    }
  }
  for entry in &pit.entries {
    if base == strip_img_bin(&entry.flash_filename) {
      return Some(PartitionTarget { partition_id: entry.partition_id, device_type: entry.device_type });
    }
  }
  for entry in &pit.entries {
    if base == entry.partition_name {
      return Some(PartitionTarget { partition_id: entry.partition_id, device_type: entry.device_type });
    }
  }
  let normalized_base = dash_normalize(base);
  for entry in &pit.entries {
    if normalized_base == dash_normalize(&entry.partition_name) {
      return Some(PartitionTarget { partition_id: entry.partition_id, device_type: entry.device_type });
    }
  }

  None
}

/// Filename-based fallback used when no PIT is available.
pub fn match_heuristic(name: &str) -> PartitionTarget {
  let base = base_name(name).to_lowercase();

  let (partition_id, device_type) = if base.contains("recovery") {
    (10, 2)
  } else if base.contains("sboot") || base.contains("bootloader") || base.contains("bl") {
    (80, 2)
  } else if base.contains("boot") {
    (3, 2)
  } else if base.contains("modem") || base.contains("radio") || base.contains("cp") {
    (11, 2)
  } else {
    (0, 2)
  };

  PartitionTarget { partition_id, device_type }
}

/// Resolve the destination for `name`, using `pit` when present and falling back to the
/// filename heuristic otherwise.
pub fn resolve(name: &str, pit: Option<&Pit>) -> PartitionTarget {
  pit.and_then(|pit| match_pit(name, pit)).unwrap_or_else(|| match_heuristic(name))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::pit::PitEntry;

  fn entry(name: &str, flash: &str, id: u32) -> PitEntry {
    PitEntry {
      binary_type: 0,
      device_type: 2,
      partition_id: id,
      partition_type: 0,
      filesystem: 0,
      start_block: 0,
      num_blocks: 0,
      file_offset: 0,
      file_size: 0,
      partition_name: name.to_string(),
      flash_filename: flash.to_string(),
      fota_filename: String::new(),
    }
  }

  #[test]
  fn scenario_s4_matches_via_base_strip_img() {
    let pit = Pit {
      entries: vec![entry("BOOTLOADER", "sboot.bin", 80), entry("BOOT", "boot.img", 3)],
    };
    let target = match_pit("boot.img.lz4", &pit).unwrap();
    assert_eq!(target, PartitionTarget { partition_id: 3, device_type: 2 });
  }

  #[test]
  fn exact_flash_filename_match_wins_first() {
    let pit = Pit { entries: vec![entry("BOOT", "boot.img.lz4", 3), entry("BOOT2", "boot.img", 99)] };
    let target = match_pit("boot.img.lz4", &pit).unwrap();
    assert_eq!(target.partition_id, 3);
  }

  #[test]
  fn partition_name_match() {
    let pit = Pit { entries: vec![entry("CACHE", "cache.img", 20)] };
    let target = match_pit("CACHE.bin", &pit).unwrap();
    assert_eq!(target.partition_id, 20);
  }

  #[test]
  fn dash_underscore_normalization() {
    let pit = Pit { entries: vec![entry("vendor-boot", "vendor_boot.img", 55)] };
    let target = match_pit("vendor_boot.bin", &pit).unwrap();
    assert_eq!(target.partition_id, 55);
  }

  #[test]
  fn no_match_returns_none() {
    let pit = Pit { entries: vec![entry("BOOT", "boot.img", 3)] };
    assert!(match_pit("modem.bin", &pit).is_none());
  }

  #[test]
  fn heuristic_without_pit() {
    assert_eq!(match_heuristic("boot.img"), PartitionTarget { partition_id: 3, device_type: 2 });
    assert_eq!(match_heuristic("recovery.img"), PartitionTarget { partition_id: 10, device_type: 2 });
    assert_eq!(match_heuristic("sboot.bin"), PartitionTarget { partition_id: 80, device_type: 2 });
    assert_eq!(match_heuristic("modem.bin"), PartitionTarget { partition_id: 11, device_type: 2 });
    assert_eq!(match_heuristic("cache.img"), PartitionTarget { partition_id: 0, device_type: 2 });
  }
}

//! COFF object timestamp freshening.
//!
//! Windows incremental-link tooling compares the TimeDateStamp field in
//! the COFF header against its own bookkeeping; an object downloaded from
//! the remote cache carries the remote's build time, which makes the file
//! look stale. After download, the field is rewritten to the current
//! wall-clock time. Only files whose header parses as a COFF object are
//! touched; archives and PDBs pass through untouched.

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Machine magics this rewrite recognises as COFF objects.
const COFF_MACHINES: &[u16] = &[
    0x014c, // i386
    0x8664, // x86-64
    0x01c4, // armnt
    0xaa64, // arm64
];

const ARCHIVE_MAGIC: &[u8] = b"!<arch>\n";

/// Offset of TimeDateStamp within the COFF file header.
const TIMESTAMP_OFFSET: u64 = 4;

/// Whether the first bytes look like a COFF object header.
fn is_coff_object(header: &[u8]) -> bool {
    if header.len() < 8 {
        return false;
    }
    if header.starts_with(ARCHIVE_MAGIC) {
        return false;
    }
    let machine = u16::from_le_bytes([header[0], header[1]]);
    COFF_MACHINES.contains(&machine)
}

/// Rewrite the TimeDateStamp of `path` to `stamp` (seconds since epoch)
/// when the file is a COFF object. Returns whether a rewrite happened.
pub fn freshen_object_timestamp(path: &Path, stamp: u32) -> std::io::Result<bool> {
    let mut file = std::fs::OpenOptions::new().read(true).write(true).open(path)?;
    let mut header = [0u8; 8];
    let n = file.read(&mut header)?;
    if !is_coff_object(&header[..n]) {
        return Ok(false);
    }
    file.seek(SeekFrom::Start(TIMESTAMP_OFFSET))?;
    file.write_all(&stamp.to_le_bytes())?;
    Ok(true)
}

/// Current wall-clock seconds, saturated into the field width.
pub fn now_stamp() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs().min(u32::MAX as u64) as u32)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coff_bytes(machine: u16, stamp: u32) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&machine.to_le_bytes());
        data.extend_from_slice(&2u16.to_le_bytes()); // section count
        data.extend_from_slice(&stamp.to_le_bytes());
        data.extend_from_slice(&[0u8; 32]); // rest of header, truncated
        data
    }

    #[test]
    fn test_rewrites_x64_object() {
        let dir = tempfile::tempdir().unwrap();
        let obj = dir.path().join("a.obj");
        std::fs::write(&obj, coff_bytes(0x8664, 1_000_000)).unwrap();

        let rewritten = freshen_object_timestamp(&obj, 2_000_000).unwrap();
        assert!(rewritten);

        let data = std::fs::read(&obj).unwrap();
        let stamp = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        assert_eq!(stamp, 2_000_000);
    }

    #[test]
    fn test_archive_not_touched() {
        let dir = tempfile::tempdir().unwrap();
        let lib = dir.path().join("a.lib");
        let mut data = ARCHIVE_MAGIC.to_vec();
        data.extend_from_slice(&[0u8; 16]);
        std::fs::write(&lib, &data).unwrap();

        assert!(!freshen_object_timestamp(&lib, 123).unwrap());
        assert_eq!(std::fs::read(&lib).unwrap(), data);
    }

    #[test]
    fn test_elf_object_not_touched() {
        let dir = tempfile::tempdir().unwrap();
        let obj = dir.path().join("a.o");
        let data = b"\x7fELF\x02\x01\x01\x00rest".to_vec();
        std::fs::write(&obj, &data).unwrap();

        assert!(!freshen_object_timestamp(&obj, 123).unwrap());
        assert_eq!(std::fs::read(&obj).unwrap(), data);
    }

    #[test]
    fn test_short_file_not_touched() {
        let dir = tempfile::tempdir().unwrap();
        let tiny = dir.path().join("tiny.o");
        std::fs::write(&tiny, b"\x64\x86").unwrap();
        assert!(!freshen_object_timestamp(&tiny, 123).unwrap());
    }
}

//! On-disk record framing.
//!
//! Every record in a journal or sequence file is framed as:
//!
//! ```text
//! | magic (4) | version (2) | kind (1) | length (4) | payload | crc32 (4) |
//! ```
//!
//! Integers are little-endian. The CRC covers the header and payload.

use crate::error::{JournalError, JournalResult};

/// Magic bytes identifying a contextd record.
pub const RECORD_MAGIC: [u8; 4] = *b"CTXD";

/// Current record format version.
pub const RECORD_VERSION: u16 = 1;

/// Size of the record header.
pub const HEADER_LEN: usize = 11;

/// Size of the CRC trailer.
pub const TRAILER_LEN: usize = 4;

/// What a record's payload holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    /// A canonical CBOR journal entry.
    Entry = 1,
    /// A little-endian u64 counter value.
    Sequence = 2,
}

impl RecordKind {
    /// Converts a byte to a record kind.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Entry),
            2 => Some(Self::Sequence),
            _ => None,
        }
    }
}

/// A validated record inside a scanned buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    /// Byte offset of the record header.
    pub offset: u64,
    /// Record kind.
    pub kind: RecordKind,
    /// Record payload.
    pub payload: &'a [u8],
}

impl Frame<'_> {
    /// Offset one past the end of this record.
    pub fn end(&self) -> u64 {
        self.offset + (HEADER_LEN + self.payload.len() + TRAILER_LEN) as u64
    }
}

/// Result of scanning a file's contents.
#[derive(Debug)]
pub struct Scan<'a> {
    /// Complete, checksummed records in file order.
    pub frames: Vec<Frame<'a>>,
    /// Length of the valid prefix. Anything after it is a torn write.
    pub valid_len: u64,
}

impl Scan<'_> {
    /// Returns true if the scanned buffer ended in a partial record.
    pub fn has_torn_tail(&self, total_len: u64) -> bool {
        self.valid_len < total_len
    }
}

/// Frames a payload as a record.
///
/// # Errors
///
/// Returns an error if the payload does not fit the 4-byte length field.
pub fn encode_record(kind: RecordKind, payload: &[u8]) -> JournalResult<Vec<u8>> {
    let len = u32::try_from(payload.len()).map_err(|_| {
        JournalError::storage(format!("record payload too large: {} bytes", payload.len()))
    })?;

    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len() + TRAILER_LEN);
    buf.extend_from_slice(&RECORD_MAGIC);
    buf.extend_from_slice(&RECORD_VERSION.to_le_bytes());
    buf.push(kind as u8);
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(payload);
    let crc = compute_crc32(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    Ok(buf)
}

/// Splits a buffer into records.
///
/// A record that runs past the end of the buffer, or the final record
/// failing its checksum, marks a torn write and ends the scan. Damage
/// anywhere before the final record is corruption.
///
/// # Errors
///
/// Returns [`JournalError::Corrupted`] for bad magic, unknown versions or
/// kinds, or a checksum mismatch before the final record.
pub fn scan_records(data: &[u8]) -> JournalResult<Scan<'_>> {
    let mut frames = Vec::new();
    let mut pos = 0usize;

    while pos < data.len() {
        let remaining = &data[pos..];
        if remaining.len() < HEADER_LEN {
            break;
        }
        if remaining[..4] != RECORD_MAGIC {
            return Err(JournalError::corrupted(format!("bad magic at offset {pos}")));
        }
        let version = u16::from_le_bytes([remaining[4], remaining[5]]);
        if version != RECORD_VERSION {
            return Err(JournalError::corrupted(format!(
                "unsupported record version {version} at offset {pos}"
            )));
        }
        let kind = RecordKind::from_byte(remaining[6]).ok_or_else(|| {
            JournalError::corrupted(format!("unknown record kind {} at offset {pos}", remaining[6]))
        })?;
        let len = u32::from_le_bytes([remaining[7], remaining[8], remaining[9], remaining[10]]) as usize;
        let total = HEADER_LEN + len + TRAILER_LEN;
        if remaining.len() < total {
            break;
        }

        let body = &remaining[..HEADER_LEN + len];
        let stored = u32::from_le_bytes([
            remaining[HEADER_LEN + len],
            remaining[HEADER_LEN + len + 1],
            remaining[HEADER_LEN + len + 2],
            remaining[HEADER_LEN + len + 3],
        ]);
        if compute_crc32(body) != stored {
            if pos + total == data.len() {
                break;
            }
            return Err(JournalError::corrupted(format!(
                "checksum mismatch at offset {pos}"
            )));
        }

        frames.push(Frame {
            offset: pos as u64,
            kind,
            payload: &remaining[HEADER_LEN..HEADER_LEN + len],
        });
        pos += total;
    }

    Ok(Scan {
        frames,
        valid_len: pos as u64,
    })
}

/// Computes the IEEE CRC32 of `data`.
pub fn compute_crc32(data: &[u8]) -> u32 {
    const TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                crc = if crc & 1 != 0 {
                    (crc >> 1) ^ 0xEDB8_8320
                } else {
                    crc >> 1
                };
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        crc = (crc >> 8) ^ TABLE[((crc ^ u32::from(byte)) & 0xFF) as usize];
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_records() -> Vec<u8> {
        let mut data = encode_record(RecordKind::Entry, b"first").unwrap();
        data.extend(encode_record(RecordKind::Sequence, &7u64.to_le_bytes()).unwrap());
        data
    }

    #[test]
    fn crc32_check_value() {
        assert_eq!(compute_crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn scan_reads_back_records() {
        let data = two_records();
        let scan = scan_records(&data).unwrap();
        assert_eq!(scan.frames.len(), 2);
        assert_eq!(scan.frames[0].kind, RecordKind::Entry);
        assert_eq!(scan.frames[0].payload, b"first");
        assert_eq!(scan.frames[1].offset, scan.frames[0].end());
        assert_eq!(scan.valid_len, data.len() as u64);
        assert!(!scan.has_torn_tail(data.len() as u64));
    }

    #[test]
    fn partial_final_record_is_torn() {
        let mut data = two_records();
        data.truncate(data.len() - 3);
        let scan = scan_records(&data).unwrap();
        assert_eq!(scan.frames.len(), 1);
        assert!(scan.has_torn_tail(data.len() as u64));
    }

    #[test]
    fn bad_checksum_on_last_record_is_torn() {
        let mut data = two_records();
        let last = data.len() - 1;
        data[last] ^= 0xFF;
        let scan = scan_records(&data).unwrap();
        assert_eq!(scan.frames.len(), 1);
    }

    #[test]
    fn bad_checksum_mid_file_is_corruption() {
        let mut data = two_records();
        data[HEADER_LEN] ^= 0xFF;
        assert!(matches!(
            scan_records(&data),
            Err(JournalError::Corrupted(_))
        ));
    }

    #[test]
    fn bad_magic_is_corruption() {
        let mut data = two_records();
        data[0] = b'X';
        assert!(scan_records(&data).is_err());
    }
}

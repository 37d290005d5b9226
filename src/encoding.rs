//! On-disk record framing shared by the write-ahead log and the value log.
//!
//! A record is laid out as
//! `[key_len:u32][value_len:u32][expires_at:u64][flags:u8][key][value][crc:u64]`
//! with all integers big-endian. The checksum covers the key, the value,
//! and the expiry/flags metadata.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

use crate::error::{Error, Result};
use crate::hasher::Hasher;

/// Fixed bytes before the key: two length prefixes, expiry, flags.
pub const RECORD_HEADER_SIZE: usize = 4 + 4 + 8 + 1;

const FLAG_TOMBSTONE: u8 = 0b0000_0001;

/// A key-value mutation as stored in a WAL or value log segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub tombstone: bool,
    pub expires_at: u64,
}

/// Encoded size of a record with the given key and value lengths.
pub fn record_len(key_len: usize, value_len: usize) -> u64 {
    (RECORD_HEADER_SIZE + key_len + value_len + 8) as u64
}

fn record_checksum(key: &[u8], value: &[u8], expires_at: u64, flags: u8) -> u64 {
    let mut hasher = Hasher::new();
    hasher.write(key);
    hasher.write(value);
    let mut meta = [0u8; 9];
    meta[..8].copy_from_slice(&expires_at.to_be_bytes());
    meta[8] = flags;
    hasher.write(&meta);
    hasher.checksum()
}

/// Appends one record to `writer`, returning the number of bytes written.
pub fn write_record<W: Write>(
    writer: &mut W,
    key: &[u8],
    value: &[u8],
    tombstone: bool,
    expires_at: u64,
) -> Result<u32> {
    let flags = if tombstone { FLAG_TOMBSTONE } else { 0 };

    writer.write_u32::<BigEndian>(key.len() as u32)?;
    writer.write_u32::<BigEndian>(value.len() as u32)?;
    writer.write_u64::<BigEndian>(expires_at)?;
    writer.write_u8(flags)?;
    writer.write_all(key)?;
    writer.write_all(value)?;
    writer.write_u64::<BigEndian>(record_checksum(key, value, expires_at, flags))?;

    Ok(record_len(key.len(), value.len()) as u32)
}

fn truncated(err: io::Error, what: &str) -> Error {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        Error::CorruptedLog(format!("unexpected eof while reading {what}"))
    } else {
        Error::Io(err)
    }
}

/// Reads one record from `reader`.
///
/// Returns `Ok(None)` on a clean end of log (EOF at a record boundary).
/// EOF inside a record, or a checksum mismatch, is reported as
/// [`Error::CorruptedLog`].
pub fn read_record<R: Read>(reader: &mut R) -> Result<Option<(LogRecord, u32)>> {
    let key_len = match reader.read_u32::<BigEndian>() {
        Ok(len) => len as usize,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let value_len = reader
        .read_u32::<BigEndian>()
        .map_err(|e| truncated(e, "value length"))? as usize;
    let expires_at = reader
        .read_u64::<BigEndian>()
        .map_err(|e| truncated(e, "expiry"))?;
    let flags = reader.read_u8().map_err(|e| truncated(e, "flags"))?;

    let mut key = vec![0u8; key_len];
    reader
        .read_exact(&mut key)
        .map_err(|e| truncated(e, "key"))?;
    let mut value = vec![0u8; value_len];
    reader
        .read_exact(&mut value)
        .map_err(|e| truncated(e, "value"))?;

    let stored_checksum = reader
        .read_u64::<BigEndian>()
        .map_err(|e| truncated(e, "checksum"))?;
    let computed_checksum = record_checksum(&key, &value, expires_at, flags);
    if stored_checksum != computed_checksum {
        return Err(Error::CorruptedLog(format!(
            "record checksum mismatch: stored={stored_checksum}, computed={computed_checksum}"
        )));
    }

    let record = LogRecord {
        key,
        value,
        tombstone: flags & FLAG_TOMBSTONE != 0,
        expires_at,
    };
    let len = record_len(key_len, value_len) as u32;
    Ok(Some((record, len)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_record_roundtrip() {
        let mut buf = Vec::new();
        let written = write_record(&mut buf, b"key1", b"value1", false, 42).unwrap();
        assert_eq!(written as usize, buf.len());
        assert_eq!(written as u64, record_len(4, 6));

        let (record, len) = read_record(&mut Cursor::new(&buf)).unwrap().unwrap();
        assert_eq!(record.key, b"key1");
        assert_eq!(record.value, b"value1");
        assert_eq!(record.expires_at, 42);
        assert!(!record.tombstone);
        assert_eq!(len, written);
    }

    #[test]
    fn test_tombstone_flag_roundtrip() {
        let mut buf = Vec::new();
        write_record(&mut buf, b"key1", b"", true, 0).unwrap();

        let (record, _) = read_record(&mut Cursor::new(&buf)).unwrap().unwrap();
        assert!(record.tombstone);
        assert!(record.value.is_empty());
    }

    #[test]
    fn test_clean_eof() {
        let buf: Vec<u8> = Vec::new();
        assert!(read_record(&mut Cursor::new(&buf)).unwrap().is_none());
    }

    #[test]
    fn test_truncated_record() {
        let mut buf = Vec::new();
        write_record(&mut buf, b"key1", b"value1", false, 0).unwrap();
        buf.truncate(buf.len() - 3);

        let err = read_record(&mut Cursor::new(&buf)).unwrap_err();
        assert!(matches!(err, Error::CorruptedLog(_)));
    }

    #[test]
    fn test_corrupted_record() {
        let mut buf = Vec::new();
        write_record(&mut buf, b"key1", b"value1", false, 0).unwrap();
        buf[RECORD_HEADER_SIZE + 1] ^= 0xff; // flip a key byte

        let err = read_record(&mut Cursor::new(&buf)).unwrap_err();
        assert!(matches!(err, Error::CorruptedLog(_)));
    }

    #[test]
    fn test_consecutive_records() {
        let mut buf = Vec::new();
        write_record(&mut buf, b"a", b"1", false, 0).unwrap();
        write_record(&mut buf, b"b", b"2", false, 0).unwrap();

        let mut cursor = Cursor::new(&buf);
        let (first, _) = read_record(&mut cursor).unwrap().unwrap();
        let (second, _) = read_record(&mut cursor).unwrap().unwrap();
        assert_eq!(first.key, b"a");
        assert_eq!(second.key, b"b");
        assert!(read_record(&mut cursor).unwrap().is_none());
    }
}

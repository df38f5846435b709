//! Endian-aware helpers for decoding fixed-width integers out of on-disk
//! structures.
//!
//! Most formats in this crate are little-endian; QCOW2, VHD and VMA are
//! big-endian. All multi-byte fields are decoded with explicit byte order,
//! never through in-memory struct casts.

use std::io::{Read, Seek, SeekFrom};

use crate::errors::{Error, Result};

pub fn le_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes(buf[offset..offset + 2].try_into().unwrap())
}

pub fn le_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap())
}

pub fn le_u64(buf: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(buf[offset..offset + 8].try_into().unwrap())
}

pub fn le_i32(buf: &[u8], offset: usize) -> i32 {
    i32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap())
}

pub fn le_i64(buf: &[u8], offset: usize) -> i64 {
    i64::from_le_bytes(buf[offset..offset + 8].try_into().unwrap())
}

pub fn be_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes(buf[offset..offset + 2].try_into().unwrap())
}

pub fn be_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes(buf[offset..offset + 4].try_into().unwrap())
}

pub fn be_u64(buf: &[u8], offset: usize) -> u64 {
    u64::from_be_bytes(buf[offset..offset + 8].try_into().unwrap())
}

pub fn be_i64(buf: &[u8], offset: usize) -> i64 {
    i64::from_be_bytes(buf[offset..offset + 8].try_into().unwrap())
}

/// Seek to `offset` and read exactly `length` bytes.
pub fn read_at<R: Read + Seek + ?Sized>(fh: &mut R, offset: u64, length: usize) -> Result<Vec<u8>> {
    fh.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; length];
    fh.read_exact(&mut buf)
        .map_err(|e| Error::header(format!("short read at offset {:#x}: {}", offset, e)))?;
    Ok(buf)
}

/// Seek to `offset` and read up to `length` bytes, tolerating a short tail.
pub fn read_at_most<R: Read + Seek + ?Sized>(
    fh: &mut R,
    offset: u64,
    length: usize,
) -> Result<Vec<u8>> {
    fh.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; length];
    let mut filled = 0;
    while filled < length {
        let n = fh.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}

/// Reinterpret a byte buffer as a sequence of little-endian `u32` values.
pub fn u32_table_le(buf: &[u8]) -> Vec<u32> {
    buf.chunks_exact(4)
        .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
        .collect()
}

/// Reinterpret a byte buffer as a sequence of little-endian `i32` values.
pub fn i32_table_le(buf: &[u8]) -> Vec<i32> {
    buf.chunks_exact(4)
        .map(|c| i32::from_le_bytes(c.try_into().unwrap()))
        .collect()
}

/// Reinterpret a byte buffer as a sequence of little-endian `u64` values.
pub fn u64_table_le(buf: &[u8]) -> Vec<u64> {
    buf.chunks_exact(8)
        .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
        .collect()
}

/// Reinterpret a byte buffer as a sequence of big-endian `u32` values.
pub fn u32_table_be(buf: &[u8]) -> Vec<u32> {
    buf.chunks_exact(4)
        .map(|c| u32::from_be_bytes(c.try_into().unwrap()))
        .collect()
}

/// Reinterpret a byte buffer as a sequence of big-endian `u64` values.
pub fn u64_table_be(buf: &[u8]) -> Vec<u64> {
    buf.chunks_exact(8)
        .map(|c| u64::from_be_bytes(c.try_into().unwrap()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_endian_decoding() {
        let buf = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
        assert_eq!(le_u16(&buf, 0), 0x0201);
        assert_eq!(be_u16(&buf, 0), 0x0102);
        assert_eq!(le_u32(&buf, 0), 0x04030201);
        assert_eq!(be_u32(&buf, 0), 0x01020304);
        assert_eq!(le_u64(&buf, 0), 0x0807060504030201);
        assert_eq!(be_u64(&buf, 0), 0x0102030405060708);
    }

    #[test]
    fn test_signed_decoding() {
        let buf = (-1i64).to_le_bytes();
        assert_eq!(le_i64(&buf, 0), -1);
        let buf = (-2i32).to_le_bytes();
        assert_eq!(le_i32(&buf, 0), -2);
    }

    #[test]
    fn test_read_at_short_is_an_error() {
        let mut fh = Cursor::new(vec![0u8; 4]);
        assert!(read_at(&mut fh, 0, 8).is_err());
        assert_eq!(read_at(&mut fh, 0, 4).unwrap().len(), 4);
    }

    #[test]
    fn test_read_at_most_truncates() {
        let mut fh = Cursor::new(vec![0xAAu8; 4]);
        let buf = read_at_most(&mut fh, 2, 8).unwrap();
        assert_eq!(buf, vec![0xAA, 0xAA]);
    }

    #[test]
    fn test_typed_tables() {
        let buf = [1u8, 0, 0, 0, 2, 0, 0, 0];
        assert_eq!(u32_table_le(&buf), vec![1, 2]);
        assert_eq!(u32_table_be(&buf), vec![0x01000000, 0x02000000]);
        assert_eq!(u64_table_le(&buf), vec![0x0000000200000001]);
        assert_eq!(i32_table_le(&(-1i32).to_le_bytes()), vec![-1]);
    }
}

//! This module contains functionality for reading Apple Sparse Image Format
//! (ASIF) disk images, introduced in macOS Tahoe for the Virtualization
//! framework and Disk Utility.
//!
//! An ASIF file carries two directories for atomic updates; the one with
//! the highest version number is active. Directory entries point at tables,
//! table entries point at data chunks. The tail of the addressable range is
//! reserved for a metadata block containing a plist.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::num::NonZeroUsize;
use std::path::Path;
use std::rc::Rc;

use log::{debug, info};
use lru::LruCache;

use crate::binread::{be_u16, be_u32, be_u64, read_at, read_at_most, u64_table_be};
use crate::errors::{Error, Result};
use crate::stream::{self, AlignedImage, ReadSeek};

const ASIF_HEADER_SIGNATURE: u32 = 0x73686477; // 'shdw'
const ASIF_META_HEADER_SIGNATURE: u32 = 0x6D657461; // 'meta'

/// Low 55 bits of a table entry hold the chunk number; the top bits are
/// content-dirty, entry-dirty and reserved flags.
const CHUNK_MASK: u64 = 0x7FFFFFFFFFFFFF;

const TABLE_CACHE_SIZE: usize = 128;

/// The fixed ASIF file header (big-endian).
#[derive(Clone, Debug)]
pub struct ASIFHeader {
    pub version: u32,
    pub flags: u32,
    /// File offsets of the two directories.
    pub directory_offsets: [u64; 2],
    pub guid: [u8; 16],
    /// Current virtual size in blocks.
    pub sector_count: u64,
    /// Maximum virtual size in blocks.
    pub max_sector_count: u64,
    /// Data chunk size, typically 1 MiB; always a multiple of `block_size`.
    pub chunk_size: u32,
    /// Logical block size, typically 512.
    pub block_size: u16,
    /// Chunk number of the metadata block, 0 when absent.
    pub metadata_chunk: u64,
}

impl ASIFHeader {
    fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < 80 {
            return Err(Error::header("ASIF header too short"));
        }

        let signature = be_u32(buf, 0);
        if signature != ASIF_HEADER_SIGNATURE {
            return Err(Error::signature(format!(
                "not an ASIF image: expected {:#x}, got {:#x}",
                ASIF_HEADER_SIGNATURE, signature
            )));
        }

        Ok(ASIFHeader {
            version: be_u32(buf, 4),
            flags: be_u32(buf, 12),
            directory_offsets: [be_u64(buf, 16), be_u64(buf, 24)],
            guid: buf[32..48].try_into().unwrap(),
            sector_count: be_u64(buf, 48),
            max_sector_count: be_u64(buf, 56),
            chunk_size: be_u32(buf, 64),
            block_size: be_u16(buf, 68),
            metadata_chunk: be_u64(buf, 72),
        })
    }
}

/// One of the two directories; the active one has the highest version.
#[derive(Clone, Debug)]
struct Directory {
    version: u64,
    /// Chunk numbers of the tables belonging to this directory.
    entries: Vec<u64>,
}

/// Represents an ASIF disk image.
pub struct ASIF {
    fh: Box<dyn ReadSeek>,
    header: ASIFHeader,
    directory: Directory,
    metadata: Option<Vec<u8>>,

    size: u64,
    max_size: u64,
    blocks_per_chunk: u64,
    num_reserved_table_entries: u64,
    num_table_entries: u64,
    size_per_table: u64,

    tables: LruCache<u64, Rc<Vec<u64>>>,
    position: u64,
}

impl std::fmt::Debug for ASIF {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ASIF")
            .field("header", &self.header)
            .field("directory", &self.directory)
            .field("size", &self.size)
            .field("max_size", &self.max_size)
            .field("blocks_per_chunk", &self.blocks_per_chunk)
            .field("num_reserved_table_entries", &self.num_reserved_table_entries)
            .field("num_table_entries", &self.num_table_entries)
            .field("size_per_table", &self.size_per_table)
            .field("position", &self.position)
            .finish()
    }
}

impl ASIF {
    /// Parse an ASIF image from an open stream.
    pub fn new(mut fh: Box<dyn ReadSeek>) -> Result<ASIF> {
        let buf = read_at(&mut fh, 0, 128)?;
        let header = ASIFHeader::parse(&buf)?;

        let chunk_size = header.chunk_size as u64;
        let block_size = header.block_size as u64;
        if block_size == 0 || chunk_size == 0 || chunk_size % block_size != 0 {
            return Err(Error::header(format!(
                "ASIF chunk size {:#x} is not a multiple of block size {:#x}",
                chunk_size, block_size
            )));
        }

        // Table geometry, as computed by diskimagescontroller. A slice of
        // every table is reserved, which shrinks the usable entry count.
        let blocks_per_chunk = chunk_size / block_size;
        let reserved_size = 4 * chunk_size;
        let num_reserved_table_entries = if reserved_size < blocks_per_chunk {
            1
        } else {
            reserved_size / blocks_per_chunk
        };
        let max_table_entries = chunk_size >> 3;
        let num_table_entries =
            max_table_entries - (max_table_entries % (num_reserved_table_entries + 1));
        if num_table_entries == 0 {
            return Err(Error::header("ASIF table geometry collapses to zero entries"));
        }
        let num_reserved_directory_entries =
            (num_reserved_table_entries + num_table_entries) / (num_reserved_table_entries + 1);
        let num_usable_entries = num_table_entries - num_reserved_directory_entries;
        let size_per_table = num_usable_entries * chunk_size;

        let size = header.sector_count * block_size;
        let max_size = header.max_sector_count * block_size;
        let num_directory_entries = max_size.div_ceil(size_per_table).max(1) as usize;

        let mut directories = Vec::with_capacity(2);
        for offset in header.directory_offsets {
            let buf = read_at(&mut fh, offset, 8 + num_directory_entries * 8)?;
            directories.push(Directory {
                version: be_u64(&buf, 0),
                entries: u64_table_be(&buf[8..]),
            });
        }
        directories.sort_by(|a, b| b.version.cmp(&a.version));
        let directory = directories.remove(0);

        debug!(
            "ASIF: size {:#x}, chunk {:#x}, block {:#x}, active directory version {}",
            size, chunk_size, block_size, directory.version
        );

        let mut asif = ASIF {
            fh,
            header,
            directory,
            metadata: None,
            size,
            max_size,
            blocks_per_chunk,
            num_reserved_table_entries,
            num_table_entries,
            size_per_table,
            tables: LruCache::new(NonZeroUsize::new(TABLE_CACHE_SIZE).unwrap()),
            position: 0,
        };

        if asif.header.metadata_chunk != 0 {
            asif.metadata = Some(asif.read_metadata()?);
        }

        Ok(asif)
    }

    /// Open an ASIF image from a file path.
    pub fn open(path: &Path) -> Result<ASIF> {
        let file = File::open(path).map_err(|e| Error::io(e, path))?;
        Self::new(Box::new(file))
    }

    pub fn header(&self) -> &ASIFHeader {
        &self.header
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Raw plist bytes of the metadata block, if the image carries one.
    pub fn metadata(&self) -> Option<&[u8]> {
        self.metadata.as_deref()
    }

    pub fn print_info(&self) {
        info!("ASIF Disk Information:");
        info!("  Disk Size: {} bytes (max {})", self.size, self.max_size);
        info!("  Chunk Size: {} bytes", self.header.chunk_size);
        info!("  Block Size: {} bytes", self.header.block_size);
        info!("  Active Directory Version: {}", self.directory.version);
    }

    fn table(&mut self, index: u64) -> Result<Rc<Vec<u64>>> {
        if let Some(table) = self.tables.get(&index) {
            return Ok(table.clone());
        }

        let chunk = *self
            .directory
            .entries
            .get(index as usize)
            .ok_or_else(|| Error::out_of_range(format!("ASIF table index {} out of range", index)))?;

        let offset = chunk * self.header.chunk_size as u64;
        let buf = read_at(&mut self.fh, offset, self.num_table_entries as usize * 8)?;
        let table = Rc::new(u64_table_be(&buf));
        self.tables.put(index, table.clone());
        Ok(table)
    }

    /// The metadata block lives in the reserved area past `sector_count`.
    fn read_metadata(&mut self) -> Result<Vec<u8>> {
        let metadata_offset = self.header.metadata_chunk * self.header.chunk_size as u64;
        let header_buf = self.read_range(metadata_offset, 28, true)?;
        if header_buf.len() < 28 {
            return Err(Error::header("ASIF metadata chunk outside the reserved area"));
        }

        let signature = be_u32(&header_buf, 0);
        if signature != ASIF_META_HEADER_SIGNATURE {
            return Err(Error::signature(format!(
                "invalid ASIF metadata header: expected {:#x}, got {:#x}",
                ASIF_META_HEADER_SIGNATURE, signature
            )));
        }
        let header_size = be_u32(&header_buf, 8) as u64;
        let data_size = be_u64(&header_buf, 12) as usize;

        self.read_range(metadata_offset + header_size, data_size, true)
    }

    /// Translate and read a logical range; `reserved` unlocks the area
    /// between `sector_count` and `max_sector_count`.
    fn read_range(&mut self, offset: u64, length: usize, reserved: bool) -> Result<Vec<u8>> {
        let limit = if reserved { self.max_size } else { self.size };
        let chunk_size = self.header.chunk_size as u64;
        let mut remaining = (length as u64).min(limit.saturating_sub(offset));
        let mut cursor = offset;
        let mut result = Vec::with_capacity(length);

        while remaining > 0 {
            let table_index = cursor / self.size_per_table;
            let offset_in_chunk = cursor % chunk_size;
            let read_len = (chunk_size - offset_in_chunk).min(remaining);

            let table = self.table(table_index)?;
            let relative_block = cursor / self.header.block_size as u64
                - table_index * (self.size_per_table / self.header.block_size as u64);
            let chunk_in_table = relative_block / self.blocks_per_chunk;
            let data_idx = (chunk_in_table
                + chunk_in_table * self.num_reserved_table_entries)
                / self.num_reserved_table_entries;

            let entry = *table.get(data_idx as usize).ok_or_else(|| {
                Error::out_of_range(format!("ASIF data index {} out of range", data_idx))
            })?;
            let chunk = entry & CHUNK_MASK;

            if chunk == 0 {
                result.resize(result.len() + read_len as usize, 0);
            } else {
                let physical = chunk * chunk_size + offset_in_chunk;
                let buf = read_at_most(&mut self.fh, physical, read_len as usize)?;
                let got = buf.len();
                result.extend_from_slice(&buf);
                if got < read_len as usize {
                    result.resize(result.len() + read_len as usize - got, 0);
                }
            }

            cursor += read_len;
            remaining -= read_len;
        }

        Ok(result)
    }
}

impl AlignedImage for ASIF {
    fn size(&self) -> u64 {
        self.size
    }

    fn align(&self) -> u64 {
        self.header.chunk_size as u64
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn set_position(&mut self, pos: u64) {
        self.position = pos;
    }

    fn read_aligned(&mut self, offset: u64, length: usize) -> Result<Vec<u8>> {
        self.read_range(offset, length, false)
    }
}

impl Read for ASIF {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        stream::read_from(self, buf)
    }
}

impl Seek for ASIF {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        stream::seek_to(self, pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const CHUNK: u64 = 0x100000; // 1 MiB
    const BLOCK: u16 = 512;

    /// Two-chunk logical disk: chunk 0 allocated (pattern), chunk 1 sparse.
    /// Directory 1 (version 1) points everything at sparse entries so a read
    /// only succeeds through directory 2 (version 2).
    fn build_asif() -> Vec<u8> {
        let sector_count = (2 * CHUNK) / BLOCK as u64;
        let mut image = vec![0u8; (3 * CHUNK) as usize];

        image[0..4].copy_from_slice(&ASIF_HEADER_SIGNATURE.to_be_bytes());
        image[4..8].copy_from_slice(&1u32.to_be_bytes());
        image[16..24].copy_from_slice(&4096u64.to_be_bytes()); // directory 1
        image[24..32].copy_from_slice(&8192u64.to_be_bytes()); // directory 2
        image[48..56].copy_from_slice(&sector_count.to_be_bytes());
        image[56..64].copy_from_slice(&sector_count.to_be_bytes());
        image[64..68].copy_from_slice(&(CHUNK as u32).to_be_bytes());
        image[68..70].copy_from_slice(&BLOCK.to_be_bytes());

        // Directory 1: version 1, stale table pointer (sparse chunk 0).
        image[4096..4104].copy_from_slice(&1u64.to_be_bytes());

        // Directory 2: version 2, table stored in chunk 1.
        image[8192..8200].copy_from_slice(&2u64.to_be_bytes());
        image[8200..8208].copy_from_slice(&1u64.to_be_bytes());

        // Table in chunk 1: logical chunk 0 -> data chunk 2 with dirty flags
        // set, logical chunk 1 -> sparse.
        let table_offset = CHUNK as usize;
        let entry0 = 2u64 | (1 << 63) | (1 << 62);
        image[table_offset..table_offset + 8].copy_from_slice(&entry0.to_be_bytes());

        // Data chunk 2.
        let data_offset = (2 * CHUNK) as usize;
        image[data_offset..data_offset + CHUNK as usize].fill(0xAB);

        image
    }

    #[test]
    fn test_rejects_bad_signature() {
        let image = vec![0u8; 4096];
        let err = ASIF::new(Box::new(Cursor::new(image))).unwrap_err();
        assert!(matches!(err, Error::InvalidSignature(_)));
    }

    #[test]
    fn test_highest_version_directory_is_active() {
        let asif = ASIF::new(Box::new(Cursor::new(build_asif()))).unwrap();
        assert_eq!(asif.directory.version, 2);
    }

    #[test]
    fn test_chunk_translation_and_sparse() {
        let mut asif = ASIF::new(Box::new(Cursor::new(build_asif()))).unwrap();
        assert_eq!(asif.size(), 2 * CHUNK);

        let mut chunk0 = vec![0u8; CHUNK as usize];
        asif.read_exact(&mut chunk0).unwrap();
        assert!(chunk0.iter().all(|b| *b == 0xAB));

        let mut chunk1 = vec![0u8; CHUNK as usize];
        asif.read_exact(&mut chunk1).unwrap();
        assert!(chunk1.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_flag_bits_are_masked_off() {
        // The entry for logical chunk 0 carries dirty bits; translation
        // must still land on data chunk 2.
        let mut asif = ASIF::new(Box::new(Cursor::new(build_asif()))).unwrap();
        asif.seek(SeekFrom::Start(123)).unwrap();
        let mut buf = [0u8; 16];
        asif.read_exact(&mut buf).unwrap();
        assert!(buf.iter().all(|b| *b == 0xAB));
    }
}

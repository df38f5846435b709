//! This module contains functionality for reading Hyper-V VHDX volumes.
//!
//! Fixed, dynamic and differencing VHDX files are supported. Differencing
//! files resolve their parent through the parent locator metadata when
//! opened from a path, or accept an already-opened parent stream.
//!
//! References:
//! - [MS-VHDX] https://docs.microsoft.com/en-us/openspecs/windows_protocols/ms-vhdx/83e061f8-f6e2-4de1-91bd-5d518a43d477

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use log::{debug, info};
use lru::LruCache;

use crate::binread::{le_u16, le_u32, le_u64, read_at, read_at_most};
use crate::errors::{Error, Result};
use crate::stream::{self, AlignedImage, ReadSeek};

const ALIGNMENT: u64 = 64 * 1024;
const MB: u64 = 1024 * 1024;

const PAYLOAD_BLOCK_NOT_PRESENT: u64 = 0;
const PAYLOAD_BLOCK_UNDEFINED: u64 = 1;
const PAYLOAD_BLOCK_ZERO: u64 = 2;
const PAYLOAD_BLOCK_UNMAPPED: u64 = 3;
const PAYLOAD_BLOCK_FULLY_PRESENT: u64 = 6;
const PAYLOAD_BLOCK_PARTIALLY_PRESENT: u64 = 7;

const BAT_CACHE_SIZE: usize = 4096;

/// Build the on-disk (little-endian "bytes_le") form of a GUID.
const fn guid(d1: u32, d2: u16, d3: u16, d4: [u8; 8]) -> [u8; 16] {
    let a = d1.to_le_bytes();
    let b = d2.to_le_bytes();
    let c = d3.to_le_bytes();
    [
        a[0], a[1], a[2], a[3], b[0], b[1], c[0], c[1], d4[0], d4[1], d4[2], d4[3], d4[4], d4[5],
        d4[6], d4[7],
    ]
}

const BAT_REGION_GUID: [u8; 16] = guid(
    0x2DC27766,
    0xF623,
    0x4200,
    [0x9D, 0x64, 0x11, 0x5E, 0x9B, 0xFD, 0x4A, 0x08],
);
const METADATA_REGION_GUID: [u8; 16] = guid(
    0x8B7CA206,
    0x4790,
    0x4B9A,
    [0xB8, 0xFE, 0x57, 0x5F, 0x05, 0x0F, 0x88, 0x6E],
);
const FILE_PARAMETERS_GUID: [u8; 16] = guid(
    0xCAA16737,
    0xFA36,
    0x4D43,
    [0xB3, 0xB6, 0x33, 0xF0, 0xAA, 0x44, 0xE7, 0x6B],
);
const VIRTUAL_DISK_SIZE_GUID: [u8; 16] = guid(
    0x2FA54224,
    0xCD1B,
    0x4876,
    [0xB2, 0x11, 0x5D, 0xBE, 0xD8, 0x3B, 0xF4, 0xB8],
);
const LOGICAL_SECTOR_SIZE_GUID: [u8; 16] = guid(
    0x8141BF1D,
    0xA96F,
    0x4709,
    [0xBA, 0x47, 0xF2, 0x33, 0xA8, 0xFA, 0xAB, 0x5F],
);
const VIRTUAL_DISK_ID_GUID: [u8; 16] = guid(
    0xBECA12AB,
    0xB2E6,
    0x4523,
    [0x93, 0xEF, 0xC3, 0x09, 0xE0, 0x00, 0xC7, 0x46],
);
const PARENT_LOCATOR_GUID: [u8; 16] = guid(
    0xA8D35F2D,
    0xB30B,
    0x454D,
    [0xAB, 0xF7, 0xD3, 0xD8, 0x48, 0x34, 0xAB, 0x0C],
);
const VHDX_PARENT_LOCATOR_GUID: [u8; 16] = guid(
    0xB04AEFB7,
    0xD19E,
    0x4A81,
    [0xB7, 0x89, 0x25, 0xB8, 0xE9, 0x44, 0x59, 0x13],
);

/// Payload-block entries and sector-bitmap entries are interleaved in the
/// BAT: after every `chunk_ratio` payload entries comes one bitmap entry.
fn payload_entry_index(block: u64, chunk_ratio: u64) -> u64 {
    block + block / chunk_ratio
}

fn sector_bitmap_entry_index(block: u64, chunk_ratio: u64) -> u64 {
    let chunk = block / chunk_ratio;
    (chunk + 1) * chunk_ratio + chunk
}

/// Expand a sector bitmap slice into `(present, sector_count)` runs,
/// starting at `start_bit`, covering `length` sectors. All-zero and
/// all-one bytes are taken in one step.
fn iter_partial_runs(bitmap: &[u8], start_bit: usize, length: usize) -> Vec<(bool, usize)> {
    let mut runs: Vec<(bool, usize)> = Vec::new();
    let mut remaining = length;
    let mut bit = start_bit;

    for &byte in bitmap {
        if remaining == 0 {
            break;
        }

        if byte == 0x00 || byte == 0xFF {
            let present = byte == 0xFF;
            let take = (8 - bit).min(remaining);
            match runs.last_mut() {
                Some((last, count)) if *last == present => *count += take,
                _ => runs.push((present, take)),
            }
            remaining -= take;
            bit = 0;
            continue;
        }

        while bit < 8 && remaining > 0 {
            let present = byte & (1 << bit) != 0;
            match runs.last_mut() {
                Some((last, count)) if *last == present => *count += 1,
                _ => runs.push((present, 1)),
            }
            bit += 1;
            remaining -= 1;
        }
        bit = 0;
    }

    runs
}

/// The decoded BAT entry of a payload block or sector bitmap.
#[derive(Clone, Copy, Debug)]
struct BatEntry {
    state: u64,
    file_offset_mb: u64,
}

impl BatEntry {
    fn from_raw(raw: u64) -> BatEntry {
        BatEntry {
            state: raw & 0x7,
            file_offset_mb: (raw >> 20) & ((1 << 44) - 1),
        }
    }
}

/// Represents a VHDX virtual disk.
pub struct VHDX {
    fh: Box<dyn ReadSeek>,
    size: u64,
    block_size: u64,
    sector_size: u64,
    sectors_per_block: u64,
    chunk_ratio: u64,
    /// The 128-bit virtual disk identifier.
    pub id: [u8; 16],
    has_parent: bool,
    parent: Option<Box<dyn ReadSeek>>,
    /// Parent locator key/value strings, for differencing files.
    pub parent_locator: Option<HashMap<String, String>>,
    bat_offset: u64,
    bat_entry_count: u64,
    bat_cache: LruCache<u64, u64>,
    position: u64,
}

impl std::fmt::Debug for VHDX {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VHDX")
            .field("size", &self.size)
            .field("block_size", &self.block_size)
            .field("sector_size", &self.sector_size)
            .field("sectors_per_block", &self.sectors_per_block)
            .field("chunk_ratio", &self.chunk_ratio)
            .field("id", &self.id)
            .field("has_parent", &self.has_parent)
            .field("parent_locator", &self.parent_locator)
            .field("bat_offset", &self.bat_offset)
            .field("bat_entry_count", &self.bat_entry_count)
            .field("position", &self.position)
            .finish()
    }
}

impl VHDX {
    /// Parse a VHDX image from an open stream, optionally stacking it on an
    /// opened parent stream (for differencing files).
    pub fn new(mut fh: Box<dyn ReadSeek>, parent: Option<Box<dyn ReadSeek>>) -> Result<VHDX> {
        let identifier = read_at(&mut fh, 0, 8)?;
        if &identifier[..] != b"vhdxfile" {
            return Err(Error::signature("invalid VHDX file identifier signature"));
        }

        // Two headers; the one with the highest sequence number is current.
        let header1 = read_at(&mut fh, ALIGNMENT, 80)?;
        let header2 = read_at(&mut fh, 2 * ALIGNMENT, 80)?;
        let header = if &header1[0..4] == b"head"
            && (&header2[0..4] != b"head" || le_u64(&header1, 8) > le_u64(&header2, 8))
        {
            header1
        } else {
            header2
        };
        if &header[0..4] != b"head" {
            return Err(Error::signature("invalid VHDX header signature"));
        }

        let regions = Self::read_region_table(&mut fh, 3 * ALIGNMENT)?;

        let metadata_entry = regions
            .get(&METADATA_REGION_GUID)
            .ok_or_else(|| Error::header("missing required VHDX metadata region"))?;
        let metadata = Self::read_metadata_table(&mut fh, metadata_entry.0)?;

        let get_item = |guid: &[u8; 16], what: &str, min_len: usize| -> Result<Vec<u8>> {
            let data = metadata.get(guid).cloned().ok_or_else(|| {
                Error::header(format!("missing required VHDX metadata item: {}", what))
            })?;
            if data.len() < min_len {
                return Err(Error::header(format!("VHDX metadata item too short: {}", what)));
            }
            Ok(data)
        };

        let size = le_u64(&get_item(&VIRTUAL_DISK_SIZE_GUID, "virtual disk size", 8)?, 0);
        let file_parameters = get_item(&FILE_PARAMETERS_GUID, "file parameters", 8)?;
        let block_size = le_u32(&file_parameters, 0) as u64;
        let has_parent = le_u32(&file_parameters, 4) & 0x2 != 0;
        let sector_size =
            le_u32(&get_item(&LOGICAL_SECTOR_SIZE_GUID, "logical sector size", 4)?, 0) as u64;
        let id: [u8; 16] = get_item(&VIRTUAL_DISK_ID_GUID, "virtual disk id", 16)?[..16]
            .try_into()
            .unwrap();

        if block_size == 0 || sector_size == 0 || block_size % sector_size != 0 {
            return Err(Error::header(format!(
                "impossible VHDX geometry: block {:#x}, sector {:#x}",
                block_size, sector_size
            )));
        }

        let sectors_per_block = block_size / sector_size;
        let chunk_ratio = ((1u64 << 23) * sector_size) / block_size;

        let parent_locator = if has_parent {
            let raw = get_item(&PARENT_LOCATOR_GUID, "parent locator", 20)?;
            Some(Self::parse_parent_locator(&raw)?)
        } else {
            None
        };

        if has_parent && parent.is_none() {
            return Err(Error::MissingDependency {
                message: format!(
                    "VHDX differencing file requires a parent (locator: {:?})",
                    parent_locator
                ),
                path: None,
            });
        }

        let bat_entry = regions
            .get(&BAT_REGION_GUID)
            .ok_or_else(|| Error::header("missing required VHDX BAT region"))?;

        let pb_count = size.div_ceil(block_size);
        let sb_count = pb_count.div_ceil(chunk_ratio);
        let bat_entry_count = if parent.is_some() {
            sb_count * (chunk_ratio + 1)
        } else {
            pb_count + (pb_count.saturating_sub(1)) / chunk_ratio
        };

        debug!(
            "VHDX: size {:#x}, block {:#x}, sector {:#x}, chunk ratio {}, parent {}",
            size, block_size, sector_size, chunk_ratio, has_parent
        );

        Ok(VHDX {
            fh,
            size,
            block_size,
            sector_size,
            sectors_per_block,
            chunk_ratio,
            id,
            has_parent,
            parent,
            parent_locator,
            bat_offset: bat_entry.0,
            bat_entry_count,
            bat_cache: LruCache::new(NonZeroUsize::new(BAT_CACHE_SIZE).unwrap()),
            position: 0,
        })
    }

    /// Open a VHDX image from a file path, resolving differencing parents
    /// through the parent locator.
    pub fn open(path: &Path) -> Result<VHDX> {
        Self::open_inner(path, &mut Vec::new())
    }

    fn open_inner(path: &Path, chain: &mut Vec<PathBuf>) -> Result<VHDX> {
        let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        if chain.contains(&canonical) {
            return Err(Error::corrupt(format!(
                "cycle in VHDX parent chain at '{}'",
                canonical.display()
            )));
        }
        chain.push(canonical);

        let file = File::open(path).map_err(|e| Error::io(e, path))?;

        // Parse once without a parent to learn the locator, then re-open.
        match VHDX::new(Box::new(file), None) {
            Ok(vhdx) => Ok(vhdx),
            Err(Error::MissingDependency { .. }) => {
                let file = File::open(path).map_err(|e| Error::io(e, path))?;
                let mut probe_fh: Box<dyn ReadSeek> = Box::new(file);
                let locator = Self::probe_parent_locator(&mut probe_fh)?;

                let dir = path.parent().unwrap_or_else(|| Path::new(""));
                let parent_path = Self::resolve_parent_path(dir, &locator)?;
                let parent = VHDX::open_inner(&parent_path, chain)?;

                let file = File::open(path).map_err(|e| Error::io(e, path))?;
                VHDX::new(Box::new(file), Some(Box::new(parent)))
            }
            Err(e) => Err(e),
        }
    }

    /// Extract just the parent locator from a differencing file.
    fn probe_parent_locator(fh: &mut Box<dyn ReadSeek>) -> Result<HashMap<String, String>> {
        let regions = Self::read_region_table(fh, 3 * ALIGNMENT)?;
        let metadata_entry = regions
            .get(&METADATA_REGION_GUID)
            .ok_or_else(|| Error::header("missing required VHDX metadata region"))?;
        let metadata = Self::read_metadata_table(fh, metadata_entry.0)?;
        let raw = metadata
            .get(&PARENT_LOCATOR_GUID)
            .ok_or_else(|| Error::header("missing required VHDX parent locator"))?;
        Self::parse_parent_locator(raw)
    }

    fn resolve_parent_path(dir: &Path, locator: &HashMap<String, String>) -> Result<PathBuf> {
        if let Some(relative) = locator.get("relative_path") {
            let candidate = dir.join(relative.replace('\\', "/"));
            if candidate.exists() {
                return Ok(candidate);
            }
        }
        if let Some(absolute) = locator.get("absolute_win32_path") {
            let candidate = PathBuf::from(absolute.replace('\\', "/"));
            if candidate.exists() {
                return Ok(candidate);
            }
        }
        Err(Error::MissingDependency {
            message: format!("VHDX parent not found with locator {:?}", locator),
            path: None,
        })
    }

    /// Read a region table: GUID -> (file offset, length).
    fn read_region_table(
        fh: &mut Box<dyn ReadSeek>,
        offset: u64,
    ) -> Result<HashMap<[u8; 16], (u64, u64)>> {
        let header = read_at(fh, offset, 16)?;
        if &header[0..4] != b"regi" {
            return Err(Error::signature("invalid VHDX region table signature"));
        }
        let entry_count = le_u32(&header, 8) as usize;

        let buf = read_at(fh, offset + 16, entry_count * 32)?;
        let mut regions = HashMap::new();
        for i in 0..entry_count {
            let at = i * 32;
            let guid: [u8; 16] = buf[at..at + 16].try_into().unwrap();
            regions.insert(guid, (le_u64(&buf, at + 16), le_u32(&buf, at + 24) as u64));
        }
        Ok(regions)
    }

    /// Read the metadata table: item GUID -> raw item bytes.
    fn read_metadata_table(
        fh: &mut Box<dyn ReadSeek>,
        offset: u64,
    ) -> Result<HashMap<[u8; 16], Vec<u8>>> {
        let header = read_at(fh, offset, 32)?;
        if &header[0..8] != b"metadata" {
            return Err(Error::signature("invalid VHDX metadata table signature"));
        }
        let entry_count = le_u16(&header, 10) as usize;

        let buf = read_at(fh, offset + 32, entry_count * 32)?;
        let mut items = HashMap::new();
        for i in 0..entry_count {
            let at = i * 32;
            let item_id: [u8; 16] = buf[at..at + 16].try_into().unwrap();
            let item_offset = le_u32(&buf, at + 16) as u64;
            let item_length = le_u32(&buf, at + 20) as usize;
            let data = read_at(fh, offset + item_offset, item_length)?;
            items.insert(item_id, data);
        }
        Ok(items)
    }

    /// Parse the parent locator item into its key/value strings (UTF-16LE).
    fn parse_parent_locator(raw: &[u8]) -> Result<HashMap<String, String>> {
        if raw.len() < 20 {
            return Err(Error::header("VHDX parent locator too short"));
        }
        let locator_type: [u8; 16] = raw[0..16].try_into().unwrap();
        if locator_type != VHDX_PARENT_LOCATOR_GUID {
            return Err(Error::unsupported("unknown VHDX parent locator type"));
        }

        let decode_utf16le = |buf: &[u8]| -> String {
            let units: Vec<u16> = buf
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes(c.try_into().unwrap()))
                .collect();
            String::from_utf16_lossy(&units)
        };

        let count = le_u16(raw, 18) as usize;
        let mut entries = HashMap::new();
        for i in 0..count {
            let at = 20 + i * 12;
            if at + 12 > raw.len() {
                return Err(Error::header("VHDX parent locator entry out of bounds"));
            }
            let key_offset = le_u32(raw, at) as usize;
            let value_offset = le_u32(raw, at + 4) as usize;
            let key_length = le_u16(raw, at + 8) as usize;
            let value_length = le_u16(raw, at + 10) as usize;
            if key_offset + key_length > raw.len() || value_offset + value_length > raw.len() {
                return Err(Error::header("VHDX parent locator string out of bounds"));
            }
            entries.insert(
                decode_utf16le(&raw[key_offset..key_offset + key_length]),
                decode_utf16le(&raw[value_offset..value_offset + value_length]),
            );
        }
        Ok(entries)
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn print_info(&self) {
        info!("VHDX Disk Information:");
        info!("  Disk Size: {} bytes", self.size);
        info!("  Block Size: {} bytes", self.block_size);
        info!("  Sector Size: {} bytes", self.sector_size);
        info!("  Differencing: {}", self.has_parent);
    }

    fn bat_entry(&mut self, index: u64) -> Result<BatEntry> {
        if index >= self.bat_entry_count {
            return Err(Error::out_of_range(format!(
                "invalid entry for VHDX BAT lookup: {} (max entry is {})",
                index,
                self.bat_entry_count - 1
            )));
        }

        if let Some(raw) = self.bat_cache.get(&index) {
            return Ok(BatEntry::from_raw(*raw));
        }

        let buf = read_at(&mut self.fh, self.bat_offset + index * 8, 8)?;
        let raw = le_u64(&buf, 0);
        self.bat_cache.put(index, raw);
        Ok(BatEntry::from_raw(raw))
    }

    fn payload_block(&mut self, block: u64) -> Result<BatEntry> {
        self.bat_entry(payload_entry_index(block, self.chunk_ratio))
    }

    fn sector_bitmap(&mut self, block: u64) -> Result<BatEntry> {
        self.bat_entry(sector_bitmap_entry_index(block, self.chunk_ratio))
    }

    fn read_parent_sectors(&mut self, sector: u64, count: u64) -> Result<Vec<u8>> {
        let want = (count * self.sector_size) as usize;
        match self.parent.as_mut() {
            Some(parent) => {
                parent.seek(SeekFrom::Start(sector * self.sector_size))?;
                let mut buf = vec![0u8; want];
                let mut filled = 0;
                while filled < want {
                    let n = parent.read(&mut buf[filled..])?;
                    if n == 0 {
                        break;
                    }
                    filled += n;
                }
                Ok(buf)
            }
            None => Ok(vec![0u8; want]),
        }
    }

    fn read_sectors(&mut self, mut sector: u64, mut count: u64) -> Result<Vec<u8>> {
        let mut result = Vec::with_capacity((count * self.sector_size) as usize);

        while count > 0 {
            let block = sector / self.sectors_per_block;
            let sector_in_block = sector % self.sectors_per_block;
            let read_count = count.min(self.sectors_per_block - sector_in_block);
            let read_size = (read_count * self.sector_size) as usize;

            let entry = self.payload_block(block)?;
            match entry.state {
                PAYLOAD_BLOCK_NOT_PRESENT => {
                    // Not in this file: the parent has it, or it is zeros.
                    if self.parent.is_some() {
                        let buf = self.read_parent_sectors(sector, read_count)?;
                        result.extend_from_slice(&buf);
                    } else {
                        result.resize(result.len() + read_size, 0);
                    }
                }
                PAYLOAD_BLOCK_UNDEFINED | PAYLOAD_BLOCK_ZERO | PAYLOAD_BLOCK_UNMAPPED => {
                    result.resize(result.len() + read_size, 0);
                }
                PAYLOAD_BLOCK_FULLY_PRESENT => {
                    let physical =
                        entry.file_offset_mb * MB + sector_in_block * self.sector_size;
                    let buf = read_at_most(&mut self.fh, physical, read_size)?;
                    let got = buf.len();
                    result.extend_from_slice(&buf);
                    if got < read_size {
                        result.resize(result.len() + read_size - got, 0);
                    }
                }
                PAYLOAD_BLOCK_PARTIALLY_PRESENT => {
                    // The sector bitmap of this block's chunk says, per
                    // sector, whether to read this file or the parent.
                    let bitmap_entry = self.sector_bitmap(block)?;
                    let block_in_chunk = block % self.chunk_ratio;
                    let sector_in_chunk =
                        block_in_chunk * self.sectors_per_block + sector_in_block;

                    let byte_idx = sector_in_chunk / 8;
                    let bit_idx = (sector_in_chunk % 8) as usize;
                    let bitmap_bytes = (bit_idx as u64 + read_count).div_ceil(8) as usize;
                    let bitmap = read_at(
                        &mut self.fh,
                        bitmap_entry.file_offset_mb * MB + byte_idx,
                        bitmap_bytes,
                    )?;

                    let mut relative = 0u64;
                    for (present, run_count) in
                        iter_partial_runs(&bitmap, bit_idx, read_count as usize)
                    {
                        let run_count = run_count as u64;
                        if present {
                            let physical = entry.file_offset_mb * MB
                                + (sector_in_block + relative) * self.sector_size;
                            let want = (run_count * self.sector_size) as usize;
                            let buf = read_at_most(&mut self.fh, physical, want)?;
                            let got = buf.len();
                            result.extend_from_slice(&buf);
                            if got < want {
                                result.resize(result.len() + want - got, 0);
                            }
                        } else {
                            let buf = self.read_parent_sectors(sector + relative, run_count)?;
                            result.extend_from_slice(&buf);
                        }
                        relative += run_count;
                    }
                }
                other => {
                    return Err(Error::corrupt(format!(
                        "invalid VHDX payload block state: {}",
                        other
                    )));
                }
            }

            sector += read_count;
            count -= read_count;
        }

        Ok(result)
    }
}

impl AlignedImage for VHDX {
    fn size(&self) -> u64 {
        self.size
    }

    fn align(&self) -> u64 {
        self.sector_size
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn set_position(&mut self, pos: u64) {
        self.position = pos;
    }

    fn read_aligned(&mut self, offset: u64, length: usize) -> Result<Vec<u8>> {
        let capped = (length as u64).min(self.size.saturating_sub(offset));
        let sector = offset / self.sector_size;
        let count = capped.div_ceil(self.sector_size);
        let mut buf = self.read_sectors(sector, count)?;
        buf.truncate(capped as usize);
        Ok(buf)
    }
}

impl Read for VHDX {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        stream::read_from(self, buf)
    }
}

impl Seek for VHDX {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        stream::seek_to(self, pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bat_entry_decoding() {
        let raw = (123u64 << 20) | PAYLOAD_BLOCK_FULLY_PRESENT;
        let entry = BatEntry::from_raw(raw);
        assert_eq!(entry.state, PAYLOAD_BLOCK_FULLY_PRESENT);
        assert_eq!(entry.file_offset_mb, 123);

        // Reserved bits between state and offset are ignored.
        let entry = BatEntry::from_raw(raw | (0x1FFFF << 3));
        assert_eq!(entry.file_offset_mb, 123);
    }

    #[test]
    fn test_bat_interleaving_indices() {
        // chunk_ratio 4: payload entries 0..4 at BAT 0..4, bitmap for the
        // first chunk at 4, payload 4..8 at 5..9, bitmap at 9, ...
        assert_eq!(payload_entry_index(0, 4), 0);
        assert_eq!(payload_entry_index(3, 4), 3);
        assert_eq!(payload_entry_index(4, 4), 5);
        assert_eq!(payload_entry_index(7, 4), 8);
        assert_eq!(payload_entry_index(8, 4), 10);

        assert_eq!(sector_bitmap_entry_index(0, 4), 4);
        assert_eq!(sector_bitmap_entry_index(3, 4), 4);
        assert_eq!(sector_bitmap_entry_index(4, 4), 9);
        assert_eq!(sector_bitmap_entry_index(11, 4), 14);
    }

    #[test]
    fn test_partial_runs_nibble_pattern() {
        let runs = iter_partial_runs(&[0x0F, 0x0F], 0, 16);
        assert_eq!(runs, vec![(true, 4), (false, 4), (true, 4), (false, 4)]);
    }

    #[test]
    fn test_partial_runs_offset_start() {
        let runs = iter_partial_runs(&[0x00, 0xFF], 4, 8);
        assert_eq!(runs, vec![(false, 4), (true, 4)]);
    }

    #[test]
    fn test_partial_runs_fast_paths_merge() {
        let runs = iter_partial_runs(&[0xFF, 0xFF, 0x00], 0, 24);
        assert_eq!(runs, vec![(true, 16), (false, 8)]);
    }

    #[test]
    fn test_partial_runs_length_clamp() {
        let runs = iter_partial_runs(&[0b0000_0101], 0, 3);
        assert_eq!(runs, vec![(true, 1), (false, 1), (true, 1)]);
    }

    #[test]
    fn test_guid_layout() {
        // First three GUID fields are little-endian on disk.
        assert_eq!(
            BAT_REGION_GUID[..8],
            [0x66, 0x77, 0xC2, 0x2D, 0x23, 0xF6, 0x00, 0x42]
        );
    }
}

//! This module contains functionality for reading Veeam Backup (VBK) files.
//!
//! A VBK is a container: a storage header, two snapshot slots (the valid
//! one with the highest version is active), banks of 4 KiB pages, a
//! directory tree of folders and files-in-backup (FIBs), and a block store
//! holding the deduplicated, optionally LZ4-compressed data blocks.
//! Internal FIBs can be opened as random-access streams.
//!
//! Incremental patch items and encrypted backups are not supported.

use std::collections::HashSet;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::num::NonZeroUsize;
use std::path::Path;
use std::rc::Rc;

use log::{debug, info};
use lru::LruCache;

use crate::binread::{le_i64, le_u32, le_u64, read_at};
use crate::compress::{decompress, Compression};
use crate::errors::{Error, Result};
use crate::stream::{self, AlignedImage, ReadSeek};

/// VBK page size.
pub const PAGE_SIZE: u64 = 4096;

const SNAPSHOT_SLOT_HEADER_SIZE: u64 = 8;
const SNAPSHOT_DESCRIPTOR_SIZE: u64 = 108;
const BANKS_GRAIN_SIZE: u64 = 8;
const BANK_DESCRIPTOR_SIZE: u64 = 16;

const DIR_ITEM_RECORD_SIZE: usize = 192;
const META_TABLE_DESCRIPTOR_SIZE: usize = 24;
const STG_BLOCK_DESCRIPTOR_SIZE: usize = 44;
const STG_BLOCK_DESCRIPTOR_V7_SIZE: usize = 60;
const FIB_BLOCK_DESCRIPTOR_SIZE: usize = 30;
const FIB_BLOCK_DESCRIPTOR_V7_SIZE: usize = 46;

/// A `FibMetaSparseTable` covers at most this many blocks per sub-table.
const MAX_ENTRIES_PER_TABLE: u64 = 1088;

const PAGE_CACHE_SIZE: usize = 128;
const TABLE_CACHE_SIZE: usize = 128;

/// Block location types of a FIB block descriptor.
const BLOCK_LOCATION_NORMAL: u8 = 0;
const BLOCK_LOCATION_SPARSE: u8 = 1;

/// Stored-block compression types.
const COMPRESSION_PLAIN: i8 = -1;
const COMPRESSION_LZ4: i8 = 7;

/// The size of the `Lz4BlockHeader` preceding LZ4 payloads.
const LZ4_BLOCK_HEADER_SIZE: usize = 12;

/// The fixed storage header at offset 0.
#[derive(Clone, Debug)]
pub struct StorageHeader {
    pub format_version: u32,
    pub digest_type: String,
    /// Determines the slot CRC algorithm: CRC32C when greater than 5.
    pub snapshot_slot_format: u32,
    pub standard_block_size: u32,
    pub cluster_align: u8,
    pub external_storage_id: [u8; 16],
}

impl StorageHeader {
    fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < 0x130 {
            return Err(Error::header("VBK storage header too short"));
        }

        let digest_type_length = le_u32(buf, 8) as usize;
        let digest_type = String::from_utf8_lossy(&buf[12..12 + digest_type_length.min(251)])
            .trim_end_matches('\0')
            .to_string();

        Ok(StorageHeader {
            format_version: le_u32(buf, 0),
            digest_type,
            snapshot_slot_format: le_u32(buf, 0x107),
            standard_block_size: le_u32(buf, 0x10B),
            cluster_align: buf[0x10F],
            external_storage_id: buf[0x120..0x130].try_into().unwrap(),
        })
    }
}

/// The descriptor stored in a snapshot slot.
#[derive(Clone, Debug, Default)]
struct SnapshotDescriptor {
    /// Sequence number; the valid slot with the highest version is active.
    version: u64,
    storage_eof: u64,
    banks_count: u32,
    directory_root_page: i64,
    directory_count: u64,
    blocks_store_page: i64,
    blocks_store_count: u64,
}

impl SnapshotDescriptor {
    fn parse(buf: &[u8]) -> SnapshotDescriptor {
        SnapshotDescriptor {
            version: le_u64(buf, 0),
            storage_eof: le_u64(buf, 8),
            banks_count: le_u32(buf, 16),
            directory_root_page: le_i64(buf, 20),
            directory_count: le_u64(buf, 28),
            blocks_store_page: le_i64(buf, 36),
            blocks_store_count: le_u64(buf, 44),
        }
    }
}

/// A parsed snapshot slot.
struct SnapshotSlot {
    offset: u64,
    contains_snapshot: bool,
    crc: u32,
    descriptor: SnapshotDescriptor,
    max_banks: u64,
    stored_banks: u32,
    banks: Vec<(u64, u32)>,
    /// The raw bytes covered by the slot CRC.
    crc_region: Vec<u8>,
}

impl SnapshotSlot {
    fn parse(fh: &mut Box<dyn ReadSeek>, offset: u64, slot_format: u32) -> Result<SnapshotSlot> {
        let header = read_at(fh, offset, 8)?;
        let crc = le_u32(&header, 0);
        let contains_snapshot = le_u32(&header, 4) != 0;

        let mut slot = SnapshotSlot {
            offset,
            contains_snapshot,
            crc,
            descriptor: SnapshotDescriptor::default(),
            max_banks: 0,
            stored_banks: 0,
            banks: Vec::new(),
            crc_region: Vec::new(),
        };

        if !contains_snapshot {
            return Ok(slot);
        }

        let fixed = read_at(
            fh,
            offset + SNAPSHOT_SLOT_HEADER_SIZE,
            (SNAPSHOT_DESCRIPTOR_SIZE + BANKS_GRAIN_SIZE) as usize,
        )?;
        slot.descriptor = SnapshotDescriptor::parse(&fixed);

        let grain_at = SNAPSHOT_DESCRIPTOR_SIZE as usize;
        let max_banks = le_u32(&fixed, grain_at) as u64;
        let stored_banks = le_u32(&fixed, grain_at + 4);

        let valid_max_banks: u64 = if slot_format == 0 { 0xF8 } else { 0x7F00 };
        if max_banks > valid_max_banks {
            return Err(Error::corrupt("invalid snapshot slot: MaxBanks is not valid"));
        }
        if stored_banks as u64 > max_banks {
            return Err(Error::corrupt(
                "invalid snapshot slot: StoredBanks is greater than MaxBanks",
            ));
        }
        slot.max_banks = max_banks;
        slot.stored_banks = stored_banks;

        let bank_buf = read_at(
            fh,
            offset + SNAPSHOT_SLOT_HEADER_SIZE + SNAPSHOT_DESCRIPTOR_SIZE + BANKS_GRAIN_SIZE,
            (stored_banks as u64 * BANK_DESCRIPTOR_SIZE) as usize,
        )?;
        for i in 0..stored_banks as usize {
            let at = i * BANK_DESCRIPTOR_SIZE as usize;
            slot.banks
                .push((le_u64(&bank_buf, at + 4), le_u32(&bank_buf, at + 12)));
        }

        // The CRC covers everything from ContainsSnapshot through the full
        // bank descriptor capacity.
        let crc_length =
            4 + SNAPSHOT_DESCRIPTOR_SIZE + BANKS_GRAIN_SIZE + max_banks * BANK_DESCRIPTOR_SIZE;
        slot.crc_region = read_at(fh, offset + 4, crc_length as usize)?;

        Ok(slot)
    }

    /// The slot's size in the file, rounded up to a page boundary.
    fn size(&self, slot_format: u32) -> u64 {
        let banks = if self.contains_snapshot {
            self.max_banks
        } else if slot_format == 0 {
            0xF8
        } else {
            0x7F00
        };
        let raw = SNAPSHOT_SLOT_HEADER_SIZE + SNAPSHOT_DESCRIPTOR_SIZE + banks * BANK_DESCRIPTOR_SIZE;
        raw.div_ceil(PAGE_SIZE) * PAGE_SIZE
    }

    fn verify(&self, slot_format: u32) -> bool {
        if !self.contains_snapshot {
            return false;
        }
        let computed = if slot_format > 5 {
            crc32c::crc32c(&self.crc_region)
        } else {
            crc32fast::hash(&self.crc_region)
        };
        computed == self.crc
    }
}

/// The directory item kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DirItemKind {
    Root,
    SubFolder,
    ExtFib,
    IntFib,
    Patch,
    Increment,
    Other(u32),
}

/// One entry of the directory tree.
#[derive(Clone, Debug)]
pub struct DirItem {
    pub name: String,
    pub kind: DirItemKind,
    props_root_page: i64,
    /// Subfolder child vector root, or FIB blocks vector root.
    root_page: i64,
    count: u64,
    /// FIB size in bytes, for file items.
    pub size: u64,
}

impl DirItem {
    fn parse(buf: &[u8]) -> Result<DirItem> {
        if buf.len() < DIR_ITEM_RECORD_SIZE {
            return Err(Error::corrupt("VBK directory record too short"));
        }

        let raw_type = le_u32(buf, 0);
        let name_length = (le_u32(buf, 4) as usize).min(128);
        let name = String::from_utf8_lossy(&buf[8..8 + name_length]).to_string();
        let props_root_page = le_i64(buf, 136);

        // The union starts at 0x94.
        let u = 148;
        let (kind, root_page, count, size) = match raw_type {
            1 => (
                DirItemKind::SubFolder,
                le_u64(buf, u) as i64,
                le_u32(buf, u + 8) as u64,
                0,
            ),
            2 => (
                DirItemKind::ExtFib,
                le_u64(buf, u + 4) as i64,
                le_u64(buf, u + 12),
                le_u64(buf, u + 20),
            ),
            3 => (
                DirItemKind::IntFib,
                le_u64(buf, u + 4) as i64,
                le_u64(buf, u + 12),
                le_u64(buf, u + 20),
            ),
            4 => (
                DirItemKind::Patch,
                le_u64(buf, u + 4) as i64,
                le_u64(buf, u + 12),
                le_u64(buf, u + 20),
            ),
            5 => (
                DirItemKind::Increment,
                le_u64(buf, u + 4) as i64,
                le_u64(buf, u + 12),
                le_u64(buf, u + 20),
            ),
            other => (DirItemKind::Other(other), -1, 0, 0),
        };

        Ok(DirItem {
            name,
            kind,
            props_root_page,
            root_page,
            count,
            size,
        })
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind, DirItemKind::Root | DirItemKind::SubFolder)
    }

    /// Whether this item can be opened as a file. Only internal FIBs carry
    /// their data inside this VBK; external FIBs live in companion files.
    pub fn is_file(&self) -> bool {
        matches!(self.kind, DirItemKind::IntFib | DirItemKind::ExtFib)
    }

    pub fn is_internal_file(&self) -> bool {
        self.kind == DirItemKind::IntFib
    }

    pub fn is_external_file(&self) -> bool {
        self.kind == DirItemKind::ExtFib
    }
}

/// A property dictionary value.
#[derive(Clone, Debug, PartialEq)]
pub enum PropertyValue {
    UInt32(u32),
    UInt64(u64),
    AString(String),
    WString(String),
    Binary(Vec<u8>),
    Boolean(bool),
}

/// A stored block descriptor from the block store.
#[derive(Clone, Copy, Debug)]
struct StgBlock {
    offset: u64,
    #[allow(dead_code)]
    allocated_size: u32,
    compression_type: i8,
    compressed_size: u32,
    source_size: u32,
}

impl StgBlock {
    fn parse(buf: &[u8]) -> StgBlock {
        StgBlock {
            offset: le_u64(buf, 5),
            allocated_size: le_u32(buf, 13),
            compression_type: buf[34] as i8,
            compressed_size: le_u32(buf, 36),
            source_size: le_u32(buf, 40),
        }
    }
}

/// A FIB block descriptor: where one logical block of a file lives.
#[derive(Clone, Copy, Debug)]
struct FibBlock {
    #[allow(dead_code)]
    block_size: u32,
    location: u8,
    block_id: u64,
}

impl FibBlock {
    fn parse(buf: &[u8]) -> FibBlock {
        FibBlock {
            block_size: le_u32(buf, 0),
            location: buf[4],
            block_id: le_u64(buf, 21),
        }
    }
}

/// Look up the data page holding table entry `idx` of a MetaVector2.
///
/// The table pages have a peculiar header cycle: the first page spends two
/// slots on headers (510 usable), then pages cycle through 508, 511, 511
/// usable slots. This layout is observed, not documented; the synthetic
/// addressing test below pins it down.
fn lookup_page(table: &[i64], idx: u64) -> Result<i64> {
    const SLOTS_PER_PAGE: u64 = PAGE_SIZE / 8; // 512
    const CYCLE: [u64; 3] = [SLOTS_PER_PAGE - 1, SLOTS_PER_PAGE - 4, SLOTS_PER_PAGE - 1];

    let mut idx = idx;
    if idx < SLOTS_PER_PAGE - 2 {
        return table
            .get(idx as usize + 2)
            .copied()
            .ok_or_else(|| Error::out_of_range("MetaVector2 table index out of range"));
    }

    idx -= SLOTS_PER_PAGE - 2;
    let mut table_idx = 1u64;
    loop {
        let max_entries = CYCLE[(table_idx % 3) as usize];
        if idx < max_entries {
            let slot = table_idx * SLOTS_PER_PAGE + (SLOTS_PER_PAGE - max_entries) + idx;
            return table
                .get(slot as usize)
                .copied()
                .ok_or_else(|| Error::out_of_range("MetaVector2 table index out of range"));
        }
        idx -= max_entries;
        table_idx += 1;
    }
}

/// A vector of fixed-size metadata entries, laid out over pages.
///
/// The classic layout chains entry pages directly; version-2 vectors
/// (format >= 12) interpose a table of page numbers.
#[derive(Debug)]
struct MetaVector {
    count: u64,
    entry_size: usize,
    entries_per_page: u64,
    kind: VectorKind,
}

#[derive(Debug)]
enum VectorKind {
    Pages(Vec<i64>),
    Table(Vec<i64>),
}

impl MetaVector {
    fn new(vbk: &mut VBK, entry_size: usize, page: i64, count: u64) -> Result<MetaVector> {
        if vbk.uses_meta_vector2() {
            // The table pages use the same next-page chaining as meta
            // blobs; their payload is one big array of 64-bit page numbers.
            let data = vbk.meta_blob_data(page)?;
            let table = data
                .chunks_exact(8)
                .map(|c| i64::from_le_bytes(c.try_into().unwrap()))
                .collect();
            Ok(MetaVector {
                count,
                entry_size,
                entries_per_page: PAGE_SIZE / entry_size as u64,
                kind: VectorKind::Table(table),
            })
        } else {
            let pages = vbk.meta_blob_pages(page)?;
            Ok(MetaVector {
                count,
                entry_size,
                entries_per_page: (PAGE_SIZE - 8) / entry_size as u64,
                kind: VectorKind::Pages(pages),
            })
        }
    }

    fn get(&self, vbk: &mut VBK, idx: u64) -> Result<Vec<u8>> {
        if idx >= self.count {
            return Err(Error::out_of_range(format!(
                "MetaVector index out of range: {} (count {})",
                idx, self.count
            )));
        }

        let page_idx = idx / self.entries_per_page;
        let entry_in_page = (idx % self.entries_per_page) as usize;

        match &self.kind {
            VectorKind::Pages(pages) => {
                let page = *pages.get(page_idx as usize).ok_or_else(|| {
                    Error::corrupt("MetaVector page chain shorter than its count")
                })?;
                let buf = vbk.page(page as u64)?;
                let offset = 8 + entry_in_page * self.entry_size;
                Ok(buf[offset..offset + self.entry_size].to_vec())
            }
            VectorKind::Table(table) => {
                let page = lookup_page(table, page_idx)?;
                let buf = vbk.page(page as u64)?;
                let offset = entry_in_page * self.entry_size;
                Ok(buf[offset..offset + self.entry_size].to_vec())
            }
        }
    }
}

/// Represents a Veeam Backup file.
pub struct VBK {
    fh: Box<dyn ReadSeek>,
    pub header: StorageHeader,
    active: SnapshotDescriptor,
    banks: Vec<(u64, u32)>,
    page_cache: LruCache<u64, Rc<Vec<u8>>>,
    block_store: Option<MetaVector>,
}

impl std::fmt::Debug for VBK {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VBK")
            .field("header", &self.header)
            .field("active", &self.active)
            .field("banks", &self.banks)
            .finish()
    }
}

impl VBK {
    /// Parse a VBK from an open stream.
    ///
    /// With `verify` set, slot CRCs decide which snapshot slots are valid.
    pub fn new(mut fh: Box<dyn ReadSeek>, verify: bool) -> Result<VBK> {
        let buf = read_at(&mut fh, 0, 0x130)?;
        let header = StorageHeader::parse(&buf)?;

        debug!(
            "VBK: format version {}, block size {:#x}, slot format {}",
            header.format_version, header.standard_block_size, header.snapshot_slot_format
        );

        // The storage header is considered to be one page large, so the
        // first slot starts at PAGE_SIZE.
        let slot1 = SnapshotSlot::parse(&mut fh, PAGE_SIZE, header.snapshot_slot_format)?;
        let slot2 = SnapshotSlot::parse(
            &mut fh,
            PAGE_SIZE + slot1.size(header.snapshot_slot_format),
            header.snapshot_slot_format,
        )?;

        let active = [slot1, slot2]
            .into_iter()
            .filter(|slot| slot.contains_snapshot)
            .filter(|slot| !verify || slot.verify(header.snapshot_slot_format))
            .max_by_key(|slot| slot.descriptor.version)
            .ok_or_else(|| Error::corrupt("no active VBK metadata slot found"))?;

        debug!(
            "VBK: active slot at {:#x}, version {}, {} bank(s)",
            active.offset, active.descriptor.version, active.stored_banks
        );

        let mut vbk = VBK {
            fh,
            banks: active.banks.clone(),
            active: active.descriptor.clone(),
            header,
            page_cache: LruCache::new(NonZeroUsize::new(PAGE_CACHE_SIZE).unwrap()),
            block_store: None,
        };

        let stg_size = if vbk.is_v7() {
            STG_BLOCK_DESCRIPTOR_V7_SIZE
        } else {
            STG_BLOCK_DESCRIPTOR_SIZE
        };
        let (page, count) = (vbk.active.blocks_store_page, vbk.active.blocks_store_count);
        vbk.block_store = Some(MetaVector::new(&mut vbk, stg_size, page, count)?);

        Ok(vbk)
    }

    /// Open a VBK from a file path with verification enabled.
    pub fn open(path: &Path) -> Result<VBK> {
        let file = File::open(path).map_err(|e| Error::io(e, path))?;
        Self::new(Box::new(file), true)
    }

    /// Whether this file uses the "v7" descriptor variants.
    pub fn is_v7(&self) -> bool {
        let v = self.header.format_version;
        v == 7 || v == 0x10008 || v >= 9
    }

    fn uses_meta_vector2(&self) -> bool {
        let v = self.header.format_version;
        v >= 12 && v != 0x10008
    }

    pub fn format_version(&self) -> u32 {
        self.header.format_version
    }

    pub fn block_size(&self) -> u32 {
        self.header.standard_block_size
    }

    pub fn print_info(&self) {
        info!("VBK Backup Information:");
        info!("  Format Version: {}", self.header.format_version);
        info!("  Block Size: {} bytes", self.header.standard_block_size);
        info!("  Active Slot Version: {}", self.active.version);
        info!("  Banks: {}", self.banks.len());
        info!("  Directory Entries: {}", self.active.directory_count);
    }

    /// Read one page. The upper 32 bits of a page number select the bank,
    /// the lower its page within the bank's data area.
    fn page(&mut self, page: u64) -> Result<Rc<Vec<u8>>> {
        if let Some(buf) = self.page_cache.get(&page) {
            return Ok(buf.clone());
        }

        let bank_idx = (page >> 32) as usize;
        let page_in_bank = page & 0xFFFFFFFF;
        let (bank_offset, _) = *self
            .banks
            .get(bank_idx)
            .ok_or_else(|| Error::out_of_range(format!("VBK bank {} out of range", bank_idx)))?;

        // Data pages start one header page into the bank.
        let offset = bank_offset + PAGE_SIZE + page_in_bank * PAGE_SIZE;
        let buf = Rc::new(read_at(&mut self.fh, offset, PAGE_SIZE as usize)?);
        self.page_cache.put(page, buf.clone());
        Ok(buf)
    }

    /// Follow a meta blob's next-page chain, collecting its page numbers.
    fn meta_blob_pages(&mut self, root: i64) -> Result<Vec<i64>> {
        let mut pages = Vec::new();
        let mut seen = HashSet::new();
        let mut page = root;

        while page != -1 {
            if !seen.insert(page) {
                return Err(Error::corrupt("cycle in VBK meta blob page chain"));
            }
            let buf = self.page(page as u64)?;
            pages.push(page);
            page = le_i64(&buf, 0);
        }

        Ok(pages)
    }

    /// The raw concatenated data of a meta blob (page headers included).
    fn meta_blob_data(&mut self, root: i64) -> Result<Vec<u8>> {
        let pages = self.meta_blob_pages(root)?;
        let mut data = Vec::with_capacity(pages.len() * PAGE_SIZE as usize);
        for page in pages {
            data.extend_from_slice(&self.page(page as u64)?);
        }
        Ok(data)
    }

    /// The synthetic root directory item.
    pub fn root(&self) -> DirItem {
        DirItem {
            name: "/".to_string(),
            kind: DirItemKind::Root,
            props_root_page: -1,
            root_page: self.active.directory_root_page,
            count: self.active.directory_count,
            size: 0,
        }
    }

    /// Iterate the children of a directory item.
    pub fn iterdir(&mut self, item: &DirItem) -> Result<Vec<DirItem>> {
        if !item.is_dir() {
            return Err(Error::unsupported(format!(
                "'{}' is not a directory",
                item.name
            )));
        }

        let vector = MetaVector::new(self, DIR_ITEM_RECORD_SIZE, item.root_page, item.count)?;
        let mut entries = Vec::with_capacity(item.count as usize);
        for idx in 0..item.count {
            let buf = vector.get(self, idx)?;
            entries.push(DirItem::parse(&buf)?);
        }
        Ok(entries)
    }

    /// Resolve a `/`-separated path to a directory item. Matching is
    /// case-sensitive on the UTF-8 names.
    pub fn get(&mut self, path: &str) -> Result<DirItem> {
        let mut item = self.root();

        for part in path.split('/') {
            if part.is_empty() {
                continue;
            }

            let entries = self.iterdir(&item)?;
            item = entries
                .into_iter()
                .find(|entry| entry.name == part)
                .ok_or_else(|| Error::out_of_range(format!("file not found: {}", path)))?;
        }

        Ok(item)
    }

    /// The property dictionary of an item, if it carries one.
    pub fn properties(&mut self, item: &DirItem) -> Result<Option<Vec<(String, PropertyValue)>>> {
        if item.props_root_page == -1 {
            return Ok(None);
        }

        let data = self.meta_blob_data(item.props_root_page)?;
        // Skip the meta blob header.
        let mut at = 12usize;
        let mut properties = Vec::new();

        loop {
            if at + 4 > data.len() {
                return Err(Error::corrupt("unterminated VBK property dictionary"));
            }
            let value_type = le_u32(&data, at) as i32;
            at += 4;
            if value_type == -1 {
                break;
            }

            let name_length = le_u32(&data, at) as usize;
            at += 4;
            if at + name_length + 4 > data.len() {
                return Err(Error::corrupt("VBK property name out of bounds"));
            }
            let name = String::from_utf8_lossy(&data[at..at + name_length]).to_string();
            at += name_length;

            let value = match value_type {
                1 => {
                    let v = PropertyValue::UInt32(le_u32(&data, at));
                    at += 4;
                    v
                }
                2 => {
                    let v = PropertyValue::UInt64(le_u64(&data, at));
                    at += 8;
                    v
                }
                3 => {
                    let len = le_u32(&data, at) as usize;
                    at += 4;
                    let v = PropertyValue::AString(
                        String::from_utf8_lossy(&data[at..at + len]).to_string(),
                    );
                    at += len;
                    v
                }
                4 => {
                    let len = le_u32(&data, at) as usize;
                    at += 4;
                    let units: Vec<u16> = data[at..at + len]
                        .chunks_exact(2)
                        .map(|c| u16::from_le_bytes(c.try_into().unwrap()))
                        .collect();
                    at += len;
                    PropertyValue::WString(String::from_utf16_lossy(&units))
                }
                5 => {
                    let len = le_u32(&data, at) as usize;
                    at += 4;
                    let v = PropertyValue::Binary(data[at..at + len].to_vec());
                    at += len;
                    v
                }
                6 => {
                    let v = PropertyValue::Boolean(le_u32(&data, at) != 0);
                    at += 4;
                    v
                }
                other => {
                    return Err(Error::unsupported(format!(
                        "unsupported VBK property type: {}",
                        other
                    )))
                }
            };

            properties.push((name, value));
        }

        Ok(Some(properties))
    }

    fn fib_entry_size(&self) -> usize {
        if self.is_v7() {
            FIB_BLOCK_DESCRIPTOR_V7_SIZE
        } else {
            FIB_BLOCK_DESCRIPTOR_SIZE
        }
    }

    fn stg_block(&mut self, block_id: u64) -> Result<StgBlock> {
        let store = self
            .block_store
            .take()
            .ok_or_else(|| Error::corrupt("VBK block store not loaded"))?;
        let result = store.get(self, block_id);
        self.block_store = Some(store);
        Ok(StgBlock::parse(&result?))
    }

    /// Open an internal FIB as a random-access stream.
    pub fn open_file(&mut self, item: &DirItem) -> Result<FibStream<'_>> {
        if !item.is_internal_file() {
            return Err(Error::unsupported(format!("'{}' is not a file", item.name)));
        }

        let block_size = self.header.standard_block_size as u64;
        if block_size == 0 {
            return Err(Error::header("VBK standard block size is zero"));
        }

        // The blocks vector names sub-tables of up to 1088 blocks each.
        let table_count = item.count.div_ceil(MAX_ENTRIES_PER_TABLE);
        let tables = MetaVector::new(self, META_TABLE_DESCRIPTOR_SIZE, item.root_page, table_count)?;

        Ok(FibStream {
            vbk: self,
            tables,
            table_cache: LruCache::new(NonZeroUsize::new(TABLE_CACHE_SIZE).unwrap()),
            block_count: item.count,
            size: item.size,
            position: 0,
        })
    }
}

/// A stream over one internal file-in-backup.
pub struct FibStream<'a> {
    vbk: &'a mut VBK,
    /// MetaTableDescriptor vector: one entry per 1088-block sub-table.
    tables: MetaVector,
    table_cache: LruCache<i64, Rc<MetaVector>>,
    block_count: u64,
    size: u64,
    position: u64,
}

impl std::fmt::Debug for FibStream<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FibStream")
            .field("tables", &self.tables)
            .field("block_count", &self.block_count)
            .field("size", &self.size)
            .field("position", &self.position)
            .finish()
    }
}

impl FibStream<'_> {
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Fetch the descriptor for one logical block, synthesizing a sparse
    /// descriptor for fully-sparse sub-tables.
    fn block_descriptor(&mut self, block_idx: u64) -> Result<FibBlock> {
        if block_idx >= self.block_count {
            return Err(Error::out_of_range(format!(
                "FIB block {} beyond the sparse table ({})",
                block_idx, self.block_count
            )));
        }

        let table_idx = block_idx / MAX_ENTRIES_PER_TABLE;
        let entry_idx = block_idx % MAX_ENTRIES_PER_TABLE;

        let table_buf = self.tables.get(self.vbk, table_idx)?;
        let table_page = le_i64(&table_buf, 0);
        let table_entries = le_u64(&table_buf, 16);

        if table_page == -1 {
            return Ok(FibBlock {
                block_size: self.vbk.header.standard_block_size,
                location: BLOCK_LOCATION_SPARSE,
                block_id: 0,
            });
        }

        let table = match self.table_cache.get(&table_page) {
            Some(table) => table.clone(),
            None => {
                let entry_size = self.vbk.fib_entry_size();
                let table =
                    Rc::new(MetaVector::new(self.vbk, entry_size, table_page, table_entries)?);
                self.table_cache.put(table_page, table.clone());
                table
            }
        };

        let buf = table.get(self.vbk, entry_idx)?;
        Ok(FibBlock::parse(&buf))
    }
}

impl AlignedImage for FibStream<'_> {
    fn size(&self) -> u64 {
        self.size
    }

    fn align(&self) -> u64 {
        self.vbk.header.standard_block_size as u64
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn set_position(&mut self, pos: u64) {
        self.position = pos;
    }

    fn read_aligned(&mut self, offset: u64, length: usize) -> Result<Vec<u8>> {
        let block_size = self.vbk.header.standard_block_size as u64;
        let mut remaining = (length as u64).min(self.size.saturating_sub(offset));
        let mut cursor = offset;
        let mut result = Vec::with_capacity(length);

        while remaining > 0 {
            let block_idx = cursor / block_size;
            let offset_in_block = (cursor % block_size) as usize;
            let read_size = (block_size - offset_in_block as u64).min(remaining) as usize;

            let descriptor = self.block_descriptor(block_idx)?;
            match descriptor.location {
                BLOCK_LOCATION_SPARSE => {
                    result.resize(result.len() + read_size, 0);
                }
                BLOCK_LOCATION_NORMAL => {
                    let block = self.vbk.stg_block(descriptor.block_id)?;
                    let buf = read_at(
                        &mut self.vbk.fh,
                        block.offset,
                        block.compressed_size as usize,
                    )?;

                    let data = if block.compression_type == COMPRESSION_PLAIN {
                        buf
                    } else if block.compression_type == COMPRESSION_LZ4 {
                        // The payload starts with an Lz4BlockHeader.
                        decompress(
                            Compression::Lz4,
                            &buf[LZ4_BLOCK_HEADER_SIZE..],
                            block.source_size as usize,
                        )?
                    } else {
                        return Err(Error::unsupported(format!(
                            "unsupported VBK compression type: {}",
                            block.compression_type
                        )));
                    };

                    if offset_in_block + read_size > data.len() {
                        return Err(Error::corrupt("VBK stored block shorter than expected"));
                    }
                    result.extend_from_slice(&data[offset_in_block..offset_in_block + read_size]);
                }
                other => {
                    return Err(Error::unsupported(format!(
                        "unsupported VBK block location type: {}",
                        other
                    )));
                }
            }

            cursor += read_size as u64;
            remaining -= read_size as u64;
        }

        Ok(result)
    }
}

impl Read for FibStream<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        stream::read_from(self, buf)
    }
}

impl Seek for FibStream<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        stream::seek_to(self, pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_page_synthetic_table() {
        // Build a synthetic two-level table: page-number slots hold a
        // running counter, header slots hold a sentinel. Looking up entry i
        // must return i for the whole capacity.
        const SLOTS: u64 = PAGE_SIZE / 8;
        let pages = 8u64;
        let mut table = vec![i64::MIN; (pages * SLOTS) as usize];

        let mut counter = 0i64;
        for page in 0..pages {
            let header_slots: u64 = match page {
                0 => 2,
                p if p % 3 == 1 => 4,
                _ => 1,
            };
            for slot in header_slots..SLOTS {
                table[(page * SLOTS + slot) as usize] = counter;
                counter += 1;
            }
        }

        for idx in 0..counter as u64 {
            assert_eq!(lookup_page(&table, idx).unwrap(), idx as i64, "idx {}", idx);
        }
    }

    #[test]
    fn test_lookup_page_capacity_cycle() {
        // The first page holds 510 entries, then the cycle is 508, 511, 511.
        const SLOTS: u64 = PAGE_SIZE / 8;
        let table = vec![7i64; (SLOTS * 5) as usize];

        // Entry 509 is the last on page 0; entry 510 is the first on page 1,
        // which starts with 4 header slots.
        assert!(lookup_page(&table, 509).is_ok());
        assert!(lookup_page(&table, 510).is_ok());
        assert!(lookup_page(&table, 510 + 508 + 511 + 511 - 1).is_ok());
        assert!(lookup_page(&table, 510 + 508 + 511 + 511 + 508).is_err());
    }

    #[test]
    fn test_dir_item_parsing() {
        let mut buf = vec![0u8; DIR_ITEM_RECORD_SIZE];
        buf[0..4].copy_from_slice(&3u32.to_le_bytes()); // IntFib
        buf[4..8].copy_from_slice(&4u32.to_le_bytes()); // name length
        buf[8..12].copy_from_slice(b"disk");
        buf[136..144].copy_from_slice(&(-1i64).to_le_bytes()); // no props
        buf[152..160].copy_from_slice(&42u64.to_le_bytes()); // blocks root page
        buf[160..168].copy_from_slice(&2u64.to_le_bytes()); // blocks count
        buf[168..176].copy_from_slice(&8192u64.to_le_bytes()); // fib size

        let item = DirItem::parse(&buf).unwrap();
        assert_eq!(item.name, "disk");
        assert_eq!(item.kind, DirItemKind::IntFib);
        assert!(item.is_file());
        assert!(item.is_internal_file());
        assert!(!item.is_dir());
        assert_eq!(item.root_page, 42);
        assert_eq!(item.count, 2);
        assert_eq!(item.size, 8192);
    }

    #[test]
    fn test_subfolder_parsing() {
        let mut buf = vec![0u8; DIR_ITEM_RECORD_SIZE];
        buf[0..4].copy_from_slice(&1u32.to_le_bytes()); // SubFolder
        buf[4..8].copy_from_slice(&2u32.to_le_bytes());
        buf[8..10].copy_from_slice(b"vm");
        buf[136..144].copy_from_slice(&(-1i64).to_le_bytes());
        buf[148..156].copy_from_slice(&7u64.to_le_bytes()); // subfolder root
        buf[156..160].copy_from_slice(&3u32.to_le_bytes()); // child count

        let item = DirItem::parse(&buf).unwrap();
        assert_eq!(item.name, "vm");
        assert!(item.is_dir());
        assert!(!item.is_file());
        assert_eq!(item.root_page, 7);
        assert_eq!(item.count, 3);
    }

    #[test]
    fn test_stg_block_parsing() {
        let mut buf = vec![0u8; STG_BLOCK_DESCRIPTOR_V7_SIZE];
        buf[0] = 4; // format
        buf[5..13].copy_from_slice(&0x10000u64.to_le_bytes());
        buf[13..17].copy_from_slice(&4096u32.to_le_bytes());
        buf[34] = (-1i8) as u8; // plain
        buf[36..40].copy_from_slice(&4096u32.to_le_bytes());
        buf[40..44].copy_from_slice(&4096u32.to_le_bytes());

        let block = StgBlock::parse(&buf);
        assert_eq!(block.offset, 0x10000);
        assert_eq!(block.allocated_size, 4096);
        assert_eq!(block.compression_type, COMPRESSION_PLAIN);
        assert_eq!(block.compressed_size, 4096);
        assert_eq!(block.source_size, 4096);
    }

    #[test]
    fn test_fib_block_parsing() {
        let mut buf = vec![0u8; FIB_BLOCK_DESCRIPTOR_V7_SIZE];
        buf[0..4].copy_from_slice(&4096u32.to_le_bytes());
        buf[4] = BLOCK_LOCATION_NORMAL;
        buf[21..29].copy_from_slice(&5u64.to_le_bytes());

        let block = FibBlock::parse(&buf);
        assert_eq!(block.block_size, 4096);
        assert_eq!(block.location, BLOCK_LOCATION_NORMAL);
        assert_eq!(block.block_id, 5);
    }

    #[test]
    fn test_storage_header_parsing() {
        let mut buf = vec![0u8; 0x130];
        buf[0..4].copy_from_slice(&9u32.to_le_bytes());
        buf[8..12].copy_from_slice(&6u32.to_le_bytes());
        buf[12..18].copy_from_slice(b"SHA256");
        buf[0x107..0x10B].copy_from_slice(&6u32.to_le_bytes());
        buf[0x10B..0x10F].copy_from_slice(&0x100000u32.to_le_bytes());

        let header = StorageHeader::parse(&buf).unwrap();
        assert_eq!(header.format_version, 9);
        assert_eq!(header.digest_type, "SHA256");
        assert_eq!(header.snapshot_slot_format, 6);
        assert_eq!(header.standard_block_size, 0x100000);
    }
}

//! This module contains functionality for reading VMDK volumes.
//!
//! Descriptor files, monolithic sparse files (hosted sparse, "KDMV"),
//! ESXi COWD redo logs, SESparse extents and raw flat extents are all
//! supported, including zlib-compressed grains and differencing chains
//! through `parentFileNameHint`.
//!
//! # Known Limitations
//!
//! For the moment VMDK descriptor files not written in UTF-8 encoding are
//! not supported.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::LazyLock;

use log::{debug, info};
use lru::LruCache;
use regex::Regex;

use crate::binread::{le_u32, le_u64, read_at, read_at_most, u32_table_le, u64_table_le};
use crate::compress::{decompress, Compression};
use crate::errors::{Error, Result};
use crate::stream::{self, AlignedImage, ReadSeek};

const SECTOR_SIZE: u64 = 512;

const VMDK_MAGIC: &[u8; 4] = b"KDMV";
const COWD_MAGIC: &[u8; 4] = b"COWD";
// Technically an 8 byte magic, but little-endian: the first four bytes
// carry the value and the rest are zero.
const SESPARSE_MAGIC: [u8; 4] = 0xCAFEBABEu32.to_le_bytes();

const SPARSEFLAG_COMPRESSED: u32 = 0x10000;
const SPARSEFLAG_EMBEDDED_LBA: u32 = 0x20000;

const SESPARSE_GRAIN_TYPE_MASK: u64 = 0xF000000000000000;
const SESPARSE_GRAIN_TYPE_UNALLOCATED: u64 = 0x0000000000000000;
const SESPARSE_GRAIN_TYPE_FALLTHROUGH: u64 = 0x1000000000000000;
const SESPARSE_GRAIN_TYPE_ZERO: u64 = 0x2000000000000000;
const SESPARSE_GRAIN_TYPE_ALLOCATED: u64 = 0x3000000000000000;

const GRAIN_TABLE_CACHE_SIZE: usize = 128;

/// Parses a key-value pair from a descriptor line.
///
/// Returns None if the line does not match the expected key-value format.
fn parse_key_value_pair(line: &str) -> Option<(&str, &str)> {
    static KEY_VALUE_REGEX: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r#"^([\w\.]+)\s*=\s*"?([^"]*)"?$"#).unwrap());
    KEY_VALUE_REGEX.captures(line).map(|captures| {
        (
            captures.get(1).unwrap().as_str(),
            captures.get(2).unwrap().as_str(),
        )
    })
}

/// The extent types a descriptor can declare.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExtentType {
    Flat,
    Sparse,
    Zero,
    Vmfs,
    VmfsSparse,
    VmfsRdm,
    VmfsRaw,
    SeSparse,
}

impl ExtentType {
    fn from_str(s: &str) -> Option<ExtentType> {
        Some(match s {
            "FLAT" => ExtentType::Flat,
            "SPARSE" => ExtentType::Sparse,
            "ZERO" => ExtentType::Zero,
            "VMFS" => ExtentType::Vmfs,
            "VMFSSPARSE" => ExtentType::VmfsSparse,
            "VMFSRDM" => ExtentType::VmfsRdm,
            "VMFSRAW" => ExtentType::VmfsRaw,
            "SESPARSE" => ExtentType::SeSparse,
            _ => return None,
        })
    }
}

/// One extent line of the descriptor.
#[derive(Clone, Debug)]
pub struct ExtentDescriptor {
    /// RW, RDONLY or NOACCESS.
    pub access: String,
    /// Number of sectors in the extent.
    pub sectors: u64,
    pub extent_type: ExtentType,
    /// The extent file name; absent for ZERO extents.
    pub file_name: Option<String>,
    /// The start sector for device-backed extents. Defaults to 0.
    pub start_sector: Option<u64>,
}

/// Represents a parsed VMDK descriptor.
///
/// As defined at: https://github.com/libyal/libvmdk/blob/main/documentation/VMWare%20Virtual%20Disk%20Format%20(VMDK).asciidoc#2-the-descriptor-file
#[derive(Clone, Debug, Default)]
pub struct DiskDescriptor {
    /// Header settings (version, CID, parentCID, createType, ...).
    pub attributes: HashMap<String, String>,
    pub extents: Vec<ExtentDescriptor>,
    /// The disk database (`ddb.*`) settings.
    pub ddb: HashMap<String, String>,
    /// Total declared sectors across all extents.
    pub sectors: u64,
}

impl DiskDescriptor {
    pub fn parse(text: &str) -> Result<DiskDescriptor> {
        static EXTENT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
            Regex::new(
                r#"^(RW|RDONLY|NOACCESS)\s+(\d+)\s+(SPARSE|ZERO|FLAT|VMFS|VMFSSPARSE|VMFSRDM|VMFSRAW|SESPARSE)(\s+"(.+)")?(\s+(\d+))?"#,
            )
            .unwrap()
        });

        let mut descriptor = DiskDescriptor::default();

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some(captures) = EXTENT_REGEX.captures(line) {
                let sectors: u64 = captures.get(2).unwrap().as_str().parse().map_err(|_| {
                    Error::header(format!("invalid extent sector count: {}", line))
                })?;
                let extent_type = ExtentType::from_str(captures.get(3).unwrap().as_str())
                    .ok_or_else(|| Error::header(format!("invalid extent type: {}", line)))?;

                descriptor.sectors += sectors;
                descriptor.extents.push(ExtentDescriptor {
                    access: captures.get(1).unwrap().as_str().to_string(),
                    sectors,
                    extent_type,
                    file_name: captures.get(5).map(|m| m.as_str().to_string()),
                    start_sector: captures.get(7).and_then(|m| m.as_str().parse().ok()),
                });
                continue;
            }

            if let Some((key, value)) = parse_key_value_pair(line) {
                if key.starts_with("ddb.") {
                    descriptor.ddb.insert(key.to_string(), value.to_string());
                } else {
                    descriptor
                        .attributes
                        .insert(key.to_string(), value.to_string());
                }
            }
        }

        Ok(descriptor)
    }

    /// Whether this descriptor references a parent image.
    pub fn has_parent(&self) -> bool {
        self.attributes
            .get("parentCID")
            .map(|cid| cid != "ffffffff")
            .unwrap_or(false)
    }
}

/// The sparse extent header shapes.
#[derive(Clone, Debug)]
enum SparseHeader {
    /// Hosted sparse ("KDMV").
    Hosted {
        flags: u32,
        capacity: u64,
        grain_size: u64,
        descriptor_offset: u64,
        descriptor_size: u64,
        num_gte_per_gt: u32,
        primary_gd_offset: u64,
    },
    /// ESXi COWD redo log.
    Cowd {
        capacity: u64,
        grain_size: u64,
        primary_gd_offset: u32,
        num_gd_entries: u32,
    },
    /// ESXi SESparse.
    SeSparse {
        capacity: u64,
        grain_size: u64,
        grain_table_size: u64,
        grain_directory_offset: u64,
        grain_directory_size: u64,
        grain_tables_offset: u64,
        grains_offset: u64,
    },
}

impl SparseHeader {
    fn parse(buf: &[u8]) -> Result<SparseHeader> {
        if buf.len() < 512 {
            return Err(Error::header("sparse extent header too short"));
        }

        if &buf[0..4] == VMDK_MAGIC {
            Ok(SparseHeader::Hosted {
                flags: le_u32(buf, 8),
                capacity: le_u64(buf, 12),
                grain_size: le_u64(buf, 20),
                descriptor_offset: le_u64(buf, 28),
                descriptor_size: le_u64(buf, 36),
                num_gte_per_gt: le_u32(buf, 44),
                primary_gd_offset: le_u64(buf, 56),
            })
        } else if &buf[0..4] == COWD_MAGIC {
            Ok(SparseHeader::Cowd {
                capacity: le_u32(buf, 12) as u64,
                grain_size: le_u32(buf, 16) as u64,
                primary_gd_offset: le_u32(buf, 20),
                num_gd_entries: le_u32(buf, 24),
            })
        } else if buf[0..4] == SESPARSE_MAGIC && buf[4..8] == [0, 0, 0, 0] {
            Ok(SparseHeader::SeSparse {
                capacity: le_u64(buf, 16),
                grain_size: le_u64(buf, 24),
                grain_table_size: le_u64(buf, 32),
                grain_directory_offset: le_u64(buf, 128),
                grain_directory_size: le_u64(buf, 136),
                grain_tables_offset: le_u64(buf, 144),
                grains_offset: le_u64(buf, 192),
            })
        } else {
            Err(Error::signature("unsupported sparse extent magic"))
        }
    }
}

/// A contiguous run produced by the grain lookup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum GrainRun {
    /// Not in this extent; `sector` is the absolute disk sector for the
    /// parent fallback.
    Absent { sector: u64, count: u64 },
    Zero { count: u64 },
    /// Physically contiguous grain data starting at `grain_sector`,
    /// `offset` sectors into the first grain.
    Data {
        grain_sector: u64,
        offset: u64,
        count: u64,
    },
}

/// A sparse extent file (hosted sparse, COWD or SESparse).
struct SparseDisk {
    fh: Box<dyn ReadSeek>,
    header: SparseHeader,
    /// Embedded descriptor, for monolithic files.
    descriptor: Option<DiskDescriptor>,
    /// Grain size in sectors.
    grain_size: u64,
    capacity_sectors: u64,
    grain_directory: Vec<u64>,
    /// Entries per grain table.
    grain_table_size: u64,
    grain_tables: LruCache<u64, Rc<Vec<u64>>>,
    compressed: bool,
    embedded_lba: bool,
    /// Start sector of this extent within the whole disk.
    sector_offset: u64,
}

impl SparseDisk {
    fn new(mut fh: Box<dyn ReadSeek>) -> Result<SparseDisk> {
        let buf = read_at(&mut fh, 0, 512)?;
        let mut header = SparseHeader::parse(&buf)?;

        // Stream-optimized hosted sparse files keep the real header in a
        // footer 1024 bytes before the end of the file.
        if let SparseHeader::Hosted {
            primary_gd_offset, ..
        } = header
        {
            if primary_gd_offset == u64::MAX {
                let end = fh.seek(SeekFrom::End(0))?;
                let buf = read_at(&mut fh, end - 1024, 512)?;
                header = SparseHeader::parse(&buf)?;
            }
        }

        let mut descriptor = None;
        let (capacity, grain_size, gd_offset, gd_entries, gt_size, compressed, embedded_lba) =
            match header {
                SparseHeader::Hosted {
                    flags,
                    capacity,
                    grain_size,
                    descriptor_offset,
                    descriptor_size,
                    num_gte_per_gt,
                    primary_gd_offset,
                } => {
                    if descriptor_size > 0 {
                        let buf = read_at(
                            &mut fh,
                            descriptor_offset * SECTOR_SIZE,
                            (descriptor_size * SECTOR_SIZE) as usize,
                        )?;
                        let text = buf.split(|b| *b == 0).next().unwrap_or(&[]);
                        descriptor =
                            Some(DiskDescriptor::parse(&String::from_utf8_lossy(text))?);
                    }

                    let coverage = num_gte_per_gt as u64 * grain_size;
                    if coverage == 0 {
                        return Err(Error::header("sparse extent with zero grain coverage"));
                    }
                    (
                        capacity,
                        grain_size,
                        primary_gd_offset,
                        capacity.div_ceil(coverage),
                        num_gte_per_gt as u64,
                        flags & SPARSEFLAG_COMPRESSED != 0,
                        flags & SPARSEFLAG_EMBEDDED_LBA != 0,
                    )
                }
                SparseHeader::Cowd {
                    capacity,
                    grain_size,
                    primary_gd_offset,
                    num_gd_entries,
                } => (
                    capacity,
                    grain_size,
                    primary_gd_offset as u64,
                    num_gd_entries as u64,
                    4096,
                    false,
                    false,
                ),
                SparseHeader::SeSparse {
                    capacity,
                    grain_size,
                    grain_table_size,
                    grain_directory_offset,
                    grain_directory_size,
                    ..
                } => (
                    capacity,
                    grain_size,
                    grain_directory_offset,
                    grain_directory_size * SECTOR_SIZE / 8,
                    grain_table_size * SECTOR_SIZE / 8,
                    false,
                    false,
                ),
            };

        if grain_size == 0 {
            return Err(Error::header("sparse extent with zero grain size"));
        }

        let sesparse = matches!(header, SparseHeader::SeSparse { .. });
        let gd_buf = read_at(
            &mut fh,
            gd_offset * SECTOR_SIZE,
            gd_entries as usize * if sesparse { 8 } else { 4 },
        )?;
        let grain_directory = if sesparse {
            u64_table_le(&gd_buf)
        } else {
            u32_table_le(&gd_buf).into_iter().map(u64::from).collect()
        };

        Ok(SparseDisk {
            fh,
            grain_size,
            capacity_sectors: capacity,
            grain_directory,
            grain_table_size: gt_size,
            grain_tables: LruCache::new(NonZeroUsize::new(GRAIN_TABLE_CACHE_SIZE).unwrap()),
            compressed,
            embedded_lba,
            sector_offset: 0,
            descriptor,
            header,
        })
    }

    fn lookup_grain_table(&mut self, directory: u64) -> Result<Option<Rc<Vec<u64>>>> {
        let gd_entry = match self.grain_directory.get(directory as usize) {
            Some(entry) => *entry,
            None => return Ok(None),
        };

        if let Some(table) = self.grain_tables.get(&directory) {
            return Ok(Some(table.clone()));
        }

        let table = match self.header {
            SparseHeader::SeSparse {
                grain_tables_offset,
                ..
            } => {
                // The top nibble must mark the table as allocated; the low
                // 32 bits index into the grain table area.
                if gd_entry == 0 || gd_entry & 0xFFFFFFFF00000000 != 0x1000000000000000 {
                    return Ok(None);
                }
                let index = gd_entry & 0xFFFFFFFF;
                let table_sector =
                    grain_tables_offset + index * (self.grain_table_size * 8) / SECTOR_SIZE;
                let buf = read_at(
                    &mut self.fh,
                    table_sector * SECTOR_SIZE,
                    self.grain_table_size as usize * 8,
                )?;
                u64_table_le(&buf)
            }
            _ => {
                if gd_entry == 0 {
                    return Ok(None);
                }
                let buf = read_at(
                    &mut self.fh,
                    gd_entry * SECTOR_SIZE,
                    self.grain_table_size as usize * 4,
                )?;
                u32_table_le(&buf).into_iter().map(u64::from).collect()
            }
        };

        let table = Rc::new(table);
        self.grain_tables.put(directory, table.clone());
        Ok(Some(table))
    }

    /// Resolve a grain number to 0 (absent), 1 (zero) or the sector of its
    /// data. SESparse tags are normalized onto the same scheme; a real
    /// grain can never live at sector 0 or 1.
    fn lookup_grain(&mut self, grain: u64) -> Result<u64> {
        let directory = grain / self.grain_table_size;
        let entry_idx = (grain % self.grain_table_size) as usize;

        let table = match self.lookup_grain_table(directory)? {
            Some(table) => table,
            None => return Ok(0),
        };
        let entry = table[entry_idx];

        if let SparseHeader::SeSparse { grains_offset, .. } = self.header {
            return Ok(match entry & SESPARSE_GRAIN_TYPE_MASK {
                SESPARSE_GRAIN_TYPE_UNALLOCATED | SESPARSE_GRAIN_TYPE_FALLTHROUGH => 0,
                SESPARSE_GRAIN_TYPE_ZERO => 1,
                SESPARSE_GRAIN_TYPE_ALLOCATED => {
                    let sector_hi = (entry & 0x0FFF000000000000) >> 48;
                    let sector_lo = (entry & 0x0000FFFFFFFFFFFF) << 12;
                    grains_offset + (sector_hi | sector_lo) * self.grain_size
                }
                _ => {
                    return Err(Error::corrupt(format!(
                        "invalid SESparse grain entry: {:#x}",
                        entry
                    )))
                }
            });
        }

        Ok(entry)
    }

    /// Coalesce the grains covering `count` sectors from `sector`
    /// (extent-relative) into runs.
    fn get_runs(&mut self, sector: u64, count: u64) -> Result<Vec<GrainRun>> {
        let mut runs: Vec<GrainRun> = Vec::new();
        let mut read_sector = sector;
        let mut remaining = count;

        while remaining > 0 {
            let grain = read_sector / self.grain_size;
            let grain_offset = read_sector % self.grain_size;
            let grain_sector = self.lookup_grain(grain)?;
            let read_count = remaining.min(self.grain_size - grain_offset);

            let merged = match (runs.last_mut(), grain_sector) {
                (Some(GrainRun::Absent { count, .. }), 0) => {
                    *count += read_count;
                    true
                }
                (Some(GrainRun::Zero { count }), 1) => {
                    *count += read_count;
                    true
                }
                (
                    Some(GrainRun::Data {
                        grain_sector: start,
                        offset,
                        count,
                    }),
                    _,
                ) if grain_sector > 1 => {
                    // Continues only if physically adjacent to the run so far.
                    let grains_covered = (*offset + *count).div_ceil(self.grain_size);
                    if *start + grains_covered * self.grain_size == grain_sector
                        && grain_offset == 0
                    {
                        *count += read_count;
                        true
                    } else {
                        false
                    }
                }
                _ => false,
            };

            if !merged {
                runs.push(match grain_sector {
                    0 => GrainRun::Absent {
                        sector: self.sector_offset + read_sector,
                        count: read_count,
                    },
                    1 => GrainRun::Zero { count: read_count },
                    _ => GrainRun::Data {
                        grain_sector,
                        offset: grain_offset,
                        count: read_count,
                    },
                });
            }

            remaining -= read_count;
            read_sector += read_count;
        }

        Ok(runs)
    }

    /// Read and decompress one grain that starts at `sector`.
    fn read_compressed_grain(&mut self, sector: u64) -> Result<Vec<u8>> {
        let mut buf = read_at(&mut self.fh, sector * SECTOR_SIZE, SECTOR_SIZE as usize)?;

        let (header_len, compressed_len) = if self.embedded_lba {
            // SparseGrainLBAHeaderOnDisk: lba u64, cmp_size u32.
            (12usize, le_u32(&buf, 8) as usize)
        } else {
            (4usize, le_u32(&buf, 0) as usize)
        };

        if header_len + compressed_len > buf.len() {
            let remaining = header_len + compressed_len - buf.len();
            let more = read_at(&mut self.fh, (sector + 1) * SECTOR_SIZE, remaining)?;
            buf.extend_from_slice(&more);
        }

        decompress(
            Compression::Zlib,
            &buf[header_len..header_len + compressed_len],
            (self.grain_size * SECTOR_SIZE) as usize,
        )
    }

    /// Read sectors, handing `Absent` runs to `parent` (absolute offsets)
    /// or zero-filling without one.
    fn read_sectors(
        &mut self,
        sector: u64,
        count: u64,
        mut parent: Option<&mut Box<dyn ReadSeek>>,
    ) -> Result<Vec<u8>> {
        let mut result = Vec::with_capacity((count * SECTOR_SIZE) as usize);
        let runs = self.get_runs(sector, count)?;

        for run in runs {
            match run {
                GrainRun::Absent { sector, count } => match parent.as_deref_mut() {
                    Some(parent) => {
                        parent.seek(SeekFrom::Start(sector * SECTOR_SIZE))?;
                        let want = (count * SECTOR_SIZE) as usize;
                        let mut buf = vec![0u8; want];
                        let mut filled = 0;
                        while filled < want {
                            let n = parent.read(&mut buf[filled..])?;
                            if n == 0 {
                                break;
                            }
                            filled += n;
                        }
                        result.extend_from_slice(&buf);
                    }
                    None => result.resize(result.len() + (count * SECTOR_SIZE) as usize, 0),
                },
                GrainRun::Zero { count } => {
                    result.resize(result.len() + (count * SECTOR_SIZE) as usize, 0);
                }
                GrainRun::Data {
                    grain_sector,
                    offset,
                    count,
                } => {
                    if !self.compressed {
                        let want = (count * SECTOR_SIZE) as usize;
                        let buf = read_at_most(
                            &mut self.fh,
                            (grain_sector + offset) * SECTOR_SIZE,
                            want,
                        )?;
                        let got = buf.len();
                        result.extend_from_slice(&buf);
                        if got < want {
                            result.resize(result.len() + want - got, 0);
                        }
                        continue;
                    }

                    // Compressed grains cannot be read as one contiguous
                    // range; walk the run grain by grain.
                    let mut grain_sector = grain_sector;
                    let mut offset = offset;
                    let mut remaining = count;
                    while remaining > 0 {
                        let take = remaining.min(self.grain_size - offset);
                        let grain = self.read_compressed_grain(grain_sector)?;
                        let from = (offset * SECTOR_SIZE) as usize;
                        let to = from + (take * SECTOR_SIZE) as usize;
                        result.extend_from_slice(&grain[from..to]);

                        offset = 0;
                        grain_sector += self.grain_size;
                        remaining -= take;
                    }
                }
            }
        }

        Ok(result)
    }
}

/// One extent of the logical disk.
enum Extent {
    Sparse(SparseDisk),
    Raw {
        fh: Box<dyn ReadSeek>,
        start_offset: u64,
    },
    Zero,
}

struct ExtentSlot {
    extent: Extent,
    sector_offset: u64,
    sector_count: u64,
}

/// Represents a VMDK virtual disk: one or more extents stitched together,
/// optionally over a parent disk.
pub struct VMDK {
    extents: Vec<ExtentSlot>,
    /// Start sectors of all extents, for binary search.
    starts: Vec<u64>,
    parent: Option<Box<dyn ReadSeek>>,
    descriptor: Option<DiskDescriptor>,
    size: u64,
    position: u64,
}

impl VMDK {
    /// Parse a single-file VMDK (monolithic sparse, COWD, SESparse or raw)
    /// from an open stream. Descriptor-based multi-extent disks need
    /// [`VMDK::open`] for sibling resolution.
    pub fn new(mut fh: Box<dyn ReadSeek>) -> Result<VMDK> {
        let magic = read_at(&mut fh, 0, 4)?;

        if magic == *VMDK_MAGIC || magic == *COWD_MAGIC || magic[..] == SESPARSE_MAGIC {
            let disk = SparseDisk::new(fh)?;
            let descriptor = disk.descriptor.clone();
            if descriptor.as_ref().map(|d| d.has_parent()).unwrap_or(false) {
                return Err(Error::MissingDependency {
                    message: "VMDK requires a parent but none can be resolved from a raw stream"
                        .to_string(),
                    path: None,
                });
            }

            let sector_count = disk.capacity_sectors;
            return Ok(VMDK {
                size: sector_count * SECTOR_SIZE,
                extents: vec![ExtentSlot {
                    extent: Extent::Sparse(disk),
                    sector_offset: 0,
                    sector_count,
                }],
                starts: vec![0],
                parent: None,
                descriptor,
                position: 0,
            });
        }

        // Anything without a known magic is a raw disk image.
        let size = fh.seek(SeekFrom::End(0))?;
        Ok(VMDK {
            size,
            extents: vec![ExtentSlot {
                extent: Extent::Raw {
                    fh,
                    start_offset: 0,
                },
                sector_offset: 0,
                sector_count: size.div_ceil(SECTOR_SIZE),
            }],
            starts: vec![0],
            parent: None,
            descriptor: None,
            position: 0,
        })
    }

    /// Open a VMDK from a file path. The path may point at a text
    /// descriptor file or at a monolithic sparse file; extents and parents
    /// are resolved next to it.
    pub fn open(path: &Path) -> Result<VMDK> {
        Self::open_inner(path, &mut Vec::new())
    }

    fn open_inner(path: &Path, chain: &mut Vec<PathBuf>) -> Result<VMDK> {
        let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        if chain.contains(&canonical) {
            return Err(Error::corrupt(format!(
                "cycle in VMDK parent chain at '{}'",
                canonical.display()
            )));
        }
        chain.push(canonical);

        debug!("opening and reading VMDK: {}", path.display());
        let mut file = File::open(path).map_err(|e| Error::io(e, path))?;
        let mut magic = [0u8; 4];
        let n = file.read(&mut magic).map_err(|e| Error::io(e, path))?;
        let dir = path.parent().unwrap_or_else(|| Path::new(""));

        if n == 4 && &magic == b"# Di" {
            let text = fs::read_to_string(path).map_err(|e| Error::io(e, path))?;
            let descriptor = DiskDescriptor::parse(&text)?;
            return Self::from_descriptor(descriptor, dir, chain);
        }

        file.seek(SeekFrom::Start(0)).map_err(|e| Error::io(e, path))?;

        if n == 4 && (&magic == VMDK_MAGIC || &magic == COWD_MAGIC || magic == SESPARSE_MAGIC) {
            let disk = SparseDisk::new(Box::new(file))?;
            let descriptor = disk.descriptor.clone();

            let parent = match descriptor.as_ref().filter(|d| d.has_parent()) {
                Some(descriptor) => {
                    let hint =
                        descriptor.attributes.get("parentFileNameHint").ok_or_else(|| {
                            Error::header("VMDK has a parentCID but no parentFileNameHint")
                        })?;
                    Some(Self::open_parent(dir, hint, chain)?)
                }
                None => None,
            };

            let sector_count = disk.capacity_sectors;
            return Ok(VMDK {
                size: sector_count * SECTOR_SIZE,
                extents: vec![ExtentSlot {
                    extent: Extent::Sparse(disk),
                    sector_offset: 0,
                    sector_count,
                }],
                starts: vec![0],
                parent,
                descriptor,
                position: 0,
            });
        }

        VMDK::new(Box::new(File::open(path).map_err(|e| Error::io(e, path))?))
    }

    fn from_descriptor(
        descriptor: DiskDescriptor,
        dir: &Path,
        chain: &mut Vec<PathBuf>,
    ) -> Result<VMDK> {
        let parent = if descriptor.has_parent() {
            let hint = descriptor
                .attributes
                .get("parentFileNameHint")
                .ok_or_else(|| Error::header("VMDK has a parentCID but no parentFileNameHint"))?;
            Some(Self::open_parent(dir, hint, chain)?)
        } else {
            None
        };

        let mut extents = Vec::new();
        let mut starts = Vec::new();
        let mut sector_offset = 0u64;

        for extent in &descriptor.extents {
            let slot = match extent.extent_type {
                ExtentType::Sparse | ExtentType::VmfsSparse | ExtentType::SeSparse => {
                    let name = extent.file_name.as_ref().ok_or_else(|| {
                        Error::header("sparse extent without a file name in descriptor")
                    })?;
                    let extent_path = dir.join(name);
                    let file = File::open(&extent_path).map_err(|e| {
                        Error::missing(format!("cannot open extent file: {}", e), &extent_path)
                    })?;
                    let mut disk = SparseDisk::new(Box::new(file))?;
                    disk.sector_offset = sector_offset;
                    ExtentSlot {
                        extent: Extent::Sparse(disk),
                        sector_offset,
                        sector_count: extent.sectors,
                    }
                }
                ExtentType::Flat | ExtentType::Vmfs => {
                    let name = extent.file_name.as_ref().ok_or_else(|| {
                        Error::header("flat extent without a file name in descriptor")
                    })?;
                    let extent_path = dir.join(name);
                    let file = File::open(&extent_path).map_err(|e| {
                        Error::missing(format!("cannot open extent file: {}", e), &extent_path)
                    })?;
                    ExtentSlot {
                        extent: Extent::Raw {
                            fh: Box::new(file),
                            start_offset: extent.start_sector.unwrap_or(0) * SECTOR_SIZE,
                        },
                        sector_offset,
                        sector_count: extent.sectors,
                    }
                }
                ExtentType::Zero => ExtentSlot {
                    extent: Extent::Zero,
                    sector_offset,
                    sector_count: extent.sectors,
                },
                ExtentType::VmfsRdm | ExtentType::VmfsRaw => {
                    return Err(Error::unsupported(
                        "raw device mapping extents are not supported",
                    ));
                }
            };

            starts.push(sector_offset);
            sector_offset += extent.sectors;
            extents.push(slot);
        }

        if extents.is_empty() {
            return Err(Error::header("VMDK descriptor declares no extents"));
        }

        Ok(VMDK {
            size: sector_offset * SECTOR_SIZE,
            extents,
            starts,
            parent,
            descriptor: Some(descriptor),
            position: 0,
        })
    }

    /// Resolve `parentFileNameHint`, a possibly-backslashed path: try the
    /// hint's basename next to this disk, then the hint's directory name
    /// under this disk's parent directory, then the hint as given.
    fn open_parent(
        dir: &Path,
        hint: &str,
        chain: &mut Vec<PathBuf>,
    ) -> Result<Box<dyn ReadSeek>> {
        let hint = hint.replace('\\', "/");
        let (hint_dir, filename) = match hint.rsplit_once('/') {
            Some((dir, name)) => (dir, name),
            None => ("", hint.as_str()),
        };

        let mut candidate = dir.join(filename);
        if !candidate.exists() {
            let hint_dir_name = hint_dir.rsplit('/').next().unwrap_or("");
            candidate = dir.join("..").join(hint_dir_name).join(filename);
        }
        if !candidate.exists() {
            candidate = PathBuf::from(&hint);
        }
        if !candidate.exists() {
            return Err(Error::missing("VMDK parent disk not found", candidate));
        }

        Ok(Box::new(VMDK::open_inner(&candidate, chain)?))
    }

    pub fn descriptor(&self) -> Option<&DiskDescriptor> {
        self.descriptor.as_ref()
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn get_sector_size(&self) -> u64 {
        SECTOR_SIZE
    }

    pub fn print_info(&self) {
        info!("VMDK Disk Information:");
        info!("  Disk Size: {} bytes", self.size);
        info!("  Extents: {}", self.extents.len());
        if let Some(ref descriptor) = self.descriptor {
            if let Some(create_type) = descriptor.attributes.get("createType") {
                info!("  Disk Type: {}", create_type);
            }
            if let Some(cid) = descriptor.attributes.get("CID") {
                info!("  Disk ID: {}", cid);
            }
        }
        info!("  Differencing: {}", self.parent.is_some());
    }

    fn read_sectors(&mut self, mut sector: u64, mut count: u64) -> Result<Vec<u8>> {
        let mut result = Vec::with_capacity((count * SECTOR_SIZE) as usize);
        let mut idx = self
            .starts
            .partition_point(|start| *start <= sector)
            .saturating_sub(1);

        while count > 0 && idx < self.extents.len() {
            let slot = &mut self.extents[idx];
            let extent_remaining = (slot.sector_offset + slot.sector_count).saturating_sub(sector);
            let read_count = extent_remaining.min(count);
            if read_count == 0 {
                break;
            }

            match &mut slot.extent {
                Extent::Sparse(disk) => {
                    let buf = disk.read_sectors(
                        sector - slot.sector_offset,
                        read_count,
                        self.parent.as_mut(),
                    )?;
                    result.extend_from_slice(&buf);
                }
                Extent::Raw { fh, start_offset } => {
                    let offset = *start_offset + (sector - slot.sector_offset) * SECTOR_SIZE;
                    let want = (read_count * SECTOR_SIZE) as usize;
                    let buf = read_at_most(fh, offset, want)?;
                    let got = buf.len();
                    result.extend_from_slice(&buf);
                    if got < want {
                        result.resize(result.len() + want - got, 0);
                    }
                }
                Extent::Zero => {
                    result.resize(result.len() + (read_count * SECTOR_SIZE) as usize, 0);
                }
            }

            sector += read_count;
            count -= read_count;
            idx += 1;
        }

        // Anything past the last extent reads as zeros.
        if count > 0 {
            result.resize(result.len() + (count * SECTOR_SIZE) as usize, 0);
        }
        Ok(result)
    }
}

impl AlignedImage for VMDK {
    fn size(&self) -> u64 {
        self.size
    }

    fn align(&self) -> u64 {
        SECTOR_SIZE
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn set_position(&mut self, pos: u64) {
        self.position = pos;
    }

    fn read_aligned(&mut self, offset: u64, length: usize) -> Result<Vec<u8>> {
        let capped = (length as u64).min(self.size.saturating_sub(offset));
        let sector = offset / SECTOR_SIZE;
        let count = capped.div_ceil(SECTOR_SIZE);
        let mut buf = self.read_sectors(sector, count)?;
        buf.truncate(capped as usize);
        Ok(buf)
    }
}

impl Read for VMDK {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        stream::read_from(self, buf)
    }
}

impl Seek for VMDK {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        stream::seek_to(self, pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_value_pair() {
        assert_eq!(
            parse_key_value_pair("key1 = value1"),
            Some(("key1", "value1"))
        );
        assert_eq!(
            parse_key_value_pair("key2 = value2 with spaces"),
            Some(("key2", "value2 with spaces"))
        );
        assert_eq!(
            parse_key_value_pair("key3 = \"with quotes\""),
            Some(("key3", "with quotes"))
        );
        assert_eq!(parse_key_value_pair("key4"), None);
        assert_eq!(
            parse_key_value_pair("key.with.periods = aaa"),
            Some(("key.with.periods", "aaa"))
        );
    }

    #[test]
    fn test_parse_descriptor_data() {
        let descriptor_data = r#"
# Disk DescriptorFile
version=1
CID=123a5678
parentCID=ffffffff
createType="2GbMaxExtentSparse"
encoding="UTF-8"
isNativeSnapshot="no"

# Extent description
RW 4192256 SPARSE "disk-s001.vmdk"
RW 4192256 ZERO

# The Disk Data Base
# DDB

ddb.virtualHWVersion = "4"
ddb.geometry.cylinders = "16383"
ddb.geometry.heads = "16"
ddb.geometry.sectors = "63"
ddb.adapterType = "ide"
ddb.toolsVersion = "0"
"#;

        let descriptor = DiskDescriptor::parse(descriptor_data).unwrap();
        assert_eq!(
            descriptor.attributes.get("createType").map(String::as_str),
            Some("2GbMaxExtentSparse")
        );
        assert_eq!(
            descriptor.attributes.get("CID").map(String::as_str),
            Some("123a5678")
        );
        assert!(!descriptor.has_parent());
        assert_eq!(descriptor.extents.len(), 2);
        assert_eq!(descriptor.extents[0].access, "RW");
        assert_eq!(descriptor.extents[0].sectors, 4192256);
        assert_eq!(descriptor.extents[0].extent_type, ExtentType::Sparse);
        assert_eq!(
            descriptor.extents[0].file_name.as_deref(),
            Some("disk-s001.vmdk")
        );
        assert_eq!(descriptor.extents[1].extent_type, ExtentType::Zero);
        assert_eq!(descriptor.extents[1].file_name, None);
        assert_eq!(descriptor.sectors, 2 * 4192256);
        assert_eq!(
            descriptor
                .ddb
                .get("ddb.geometry.cylinders")
                .map(String::as_str),
            Some("16383")
        );
    }

    #[test]
    fn test_parent_cid_detection() {
        let with_parent = DiskDescriptor::parse("parentCID=0000abcd\n").unwrap();
        assert!(with_parent.has_parent());
        let without = DiskDescriptor::parse("parentCID=ffffffff\n").unwrap();
        assert!(!without.has_parent());
    }

    #[test]
    fn test_flat_extent_with_start_sector() {
        let descriptor = DiskDescriptor::parse("RW 1000 FLAT \"disk-f001.vmdk\" 63\n").unwrap();
        assert_eq!(descriptor.extents[0].extent_type, ExtentType::Flat);
        assert_eq!(descriptor.extents[0].start_sector, Some(63));
    }

    fn build_hosted_sparse(capacity_sectors: u64, grain_size: u64, num_gte_per_gt: u32) -> Vec<u8> {
        // Layout: header sector, GD at sector 1, one GT at sector 2,
        // grains from sector 3.
        let mut image = vec![0u8; 3 * SECTOR_SIZE as usize];
        image[0..4].copy_from_slice(VMDK_MAGIC);
        image[4..8].copy_from_slice(&1u32.to_le_bytes());
        image[12..20].copy_from_slice(&capacity_sectors.to_le_bytes());
        image[20..28].copy_from_slice(&grain_size.to_le_bytes());
        image[44..48].copy_from_slice(&num_gte_per_gt.to_le_bytes());
        image[56..64].copy_from_slice(&1u64.to_le_bytes()); // gdOffset

        // Grain directory: one table at sector 2.
        image[512..516].copy_from_slice(&2u32.to_le_bytes());
        image
    }

    #[test]
    fn test_hosted_sparse_grain_read() {
        let grain_size = 2u64; // 1 KiB grains
        let mut image = build_hosted_sparse(8, grain_size, 4);

        // Grain 1 allocated at sector 3.
        image[1024 + 4..1024 + 8].copy_from_slice(&3u32.to_le_bytes());
        image.extend_from_slice(&vec![0x5Au8; 1024]);

        let mut vmdk = VMDK::new(Box::new(io::Cursor::new(image))).unwrap();
        assert_eq!(vmdk.size(), 8 * SECTOR_SIZE);

        let mut out = Vec::new();
        vmdk.read_to_end(&mut out).unwrap();
        assert_eq!(out.len(), 4096);
        assert!(out[..1024].iter().all(|b| *b == 0));
        assert!(out[1024..2048].iter().all(|b| *b == 0x5A));
        assert!(out[2048..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_sesparse_grain_tags() {
        // A SESparse extent with three grains: unallocated, zero, allocated.
        let grain_size = 2u64; // sectors
        let mut image = vec![0u8; 4 * SECTOR_SIZE as usize];
        image[0..4].copy_from_slice(&SESPARSE_MAGIC);
        image[16..24].copy_from_slice(&6u64.to_le_bytes()); // capacity: 3 grains
        image[24..32].copy_from_slice(&grain_size.to_le_bytes());
        image[32..40].copy_from_slice(&1u64.to_le_bytes()); // grain_table_size: 1 sector
        image[128..136].copy_from_slice(&1u64.to_le_bytes()); // gd at sector 1
        image[136..144].copy_from_slice(&1u64.to_le_bytes()); // gd size: 1 sector
        image[144..152].copy_from_slice(&2u64.to_le_bytes()); // grain tables at sector 2
        image[192..200].copy_from_slice(&4u64.to_le_bytes()); // grains at sector 4

        // GD entry 0: table 0 allocated.
        image[512..520].copy_from_slice(&0x1000000000000000u64.to_le_bytes());

        // GT at sector 2: grain 0 unallocated, grain 1 zero, grain 2
        // allocated at cluster sector 0 -> sector 4.
        let gt = 1024;
        image[gt..gt + 8].copy_from_slice(&SESPARSE_GRAIN_TYPE_UNALLOCATED.to_le_bytes());
        image[gt + 8..gt + 16].copy_from_slice(&SESPARSE_GRAIN_TYPE_ZERO.to_le_bytes());
        image[gt + 16..gt + 24].copy_from_slice(&SESPARSE_GRAIN_TYPE_ALLOCATED.to_le_bytes());

        image.extend_from_slice(&vec![0xC3u8; 1024]);

        let mut vmdk = VMDK::new(Box::new(io::Cursor::new(image))).unwrap();
        let mut out = Vec::new();
        vmdk.read_to_end(&mut out).unwrap();
        assert_eq!(out.len(), 3072);
        assert!(out[..2048].iter().all(|b| *b == 0));
        assert!(out[2048..].iter().all(|b| *b == 0xC3));
    }

    #[test]
    fn test_compressed_grain_read() {
        use flate2::write::ZlibEncoder;
        use std::io::Write;

        let grain_size = 2u64;
        let mut image = build_hosted_sparse(4, grain_size, 4);
        // Compressed, with embedded LBA headers.
        let flags = SPARSEFLAG_COMPRESSED | SPARSEFLAG_EMBEDDED_LBA;
        image[8..12].copy_from_slice(&flags.to_le_bytes());

        let grain_data = vec![0x77u8; 1024];
        let mut encoder = ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&grain_data).unwrap();
        let compressed = encoder.finish().unwrap();

        // Grain 0 at sector 3: 12-byte LBA header + deflate payload.
        image[1024..1028].copy_from_slice(&3u32.to_le_bytes());
        let mut grain = vec![0u8; 12];
        grain[8..12].copy_from_slice(&(compressed.len() as u32).to_le_bytes());
        grain.extend_from_slice(&compressed);
        grain.resize(grain.len().div_ceil(512) * 512, 0);
        image.extend_from_slice(&grain);

        let mut vmdk = VMDK::new(Box::new(io::Cursor::new(image))).unwrap();
        let mut out = vec![0u8; 1024];
        vmdk.read_exact(&mut out).unwrap();
        assert!(out.iter().all(|b| *b == 0x77));
    }
}

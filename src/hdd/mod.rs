//! This module contains functionality for reading Parallels HDD virtual
//! disks.
//!
//! A Parallels disk is a `.hdd` directory with a `DiskDescriptor.xml` that
//! maps sector ranges ("storages") onto image files, plus a snapshot tree.
//! Expanding images use the HDS sparse format; plain images are raw files.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use quick_xml::events::Event;
use quick_xml::Reader as XmlReader;

use crate::binread::{le_u32, le_u64, read_at, read_at_most, u32_table_le};
use crate::errors::{Error, Result};
use crate::opener::{resolve_image_path, FileOpener, FsOpener};
use crate::stream::{self, AlignedImage, ReadSeek};

const SECTOR_SIZE: u64 = 512;

const SIGNATURE_V1: &[u8; 16] = b"WithoutFreeSpace";
const SIGNATURE_V2: &[u8; 16] = b"WithouFreSpacExt";
const SIGNATURE_DISK_IN_USE: u32 = 0x746F6E59;

/// Snapshot GUID used when the descriptor does not name a top snapshot.
const DEFAULT_TOP_GUID: &str = "5fbaabe3-6958-40ff-92a7-860e329aab41";
const NULL_GUID: &str = "00000000-0000-0000-0000-000000000000";

/// Strip braces and normalize the case of a GUID string from the descriptor.
fn normalize_guid(guid: &str) -> String {
    guid.trim().trim_matches(|c| c == '{' || c == '}').to_ascii_lowercase()
}

/// The header of an HDS (expanding) image file.
#[derive(Clone, Debug)]
pub struct HDSHeader {
    /// Structured disk version, 1 or 2, from the signature string.
    pub version: u32,
    /// Sectors per track; one BAT entry covers one track (cluster).
    pub sectors_per_track: u32,
    /// Number of BAT entries.
    pub bat_entries: u32,
    /// Disk size in sectors.
    pub size_in_sectors: u64,
    pub disk_in_use: bool,
    /// First data block offset in sectors.
    pub first_block_offset: u32,
}

impl HDSHeader {
    fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < 64 {
            return Err(Error::header("HDS header too short"));
        }

        let version = if &buf[0..16] == SIGNATURE_V1 {
            1
        } else if &buf[0..16] == SIGNATURE_V2 {
            2
        } else {
            return Err(Error::signature("invalid HDS header signature"));
        };

        let sectors_per_track = le_u32(buf, 28);
        if sectors_per_track == 0 {
            return Err(Error::header("HDS sectors-per-track is zero"));
        }

        let size_in_sectors = if version == 1 {
            le_u32(buf, 36) as u64
        } else {
            le_u64(buf, 36)
        };

        Ok(HDSHeader {
            version,
            sectors_per_track,
            bat_entries: le_u32(buf, 32),
            size_in_sectors,
            disk_in_use: le_u32(buf, 44) == SIGNATURE_DISK_IN_USE,
            first_block_offset: le_u32(buf, 48),
        })
    }
}

/// Represents a Parallels HDS (expanding) image, optionally stacked on a
/// parent stream for snapshot chains.
pub struct HDS {
    fh: Box<dyn ReadSeek>,
    header: HDSHeader,
    /// Block allocation table; entry 0 means absent (parent or zeros).
    bat: Vec<u32>,
    /// Multiplier turning a BAT entry into a sector number (v2 semantics).
    bat_multiplier: u64,
    cluster_size: u64,
    size: u64,
    parent: Option<Box<dyn ReadSeek>>,
    position: u64,
}

impl HDS {
    pub fn new(mut fh: Box<dyn ReadSeek>, parent: Option<Box<dyn ReadSeek>>) -> Result<HDS> {
        let buf = read_at(&mut fh, 0, 64)?;
        let header = HDSHeader::parse(&buf)?;

        // V1 BAT entries are sector offsets; v2 entries are cluster numbers
        // that get multiplied by the cluster size in sectors.
        let bat_multiplier = if header.version == 1 {
            1
        } else {
            header.sectors_per_track as u64
        };

        let bat_buf = read_at(&mut fh, 64, header.bat_entries as usize * 4)?;
        let bat = u32_table_le(&bat_buf);

        if header.disk_in_use {
            warn!("HDS image is marked as in use; reads may observe a torn state");
        }

        debug!(
            "HDS: v{}, {} clusters of {:#x} bytes",
            header.version,
            header.bat_entries,
            header.sectors_per_track as u64 * SECTOR_SIZE
        );

        Ok(HDS {
            cluster_size: header.sectors_per_track as u64 * SECTOR_SIZE,
            size: header.size_in_sectors * SECTOR_SIZE,
            bat,
            bat_multiplier,
            header,
            fh,
            parent,
            position: 0,
        })
    }

    pub fn open(path: &Path) -> Result<HDS> {
        let file = File::open(path).map_err(|e| Error::io(e, path))?;
        Self::new(Box::new(file), None)
    }

    pub fn header(&self) -> &HDSHeader {
        &self.header
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

impl AlignedImage for HDS {
    fn size(&self) -> u64 {
        self.size
    }

    fn align(&self) -> u64 {
        self.cluster_size
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn set_position(&mut self, pos: u64) {
        self.position = pos;
    }

    fn read_aligned(&mut self, offset: u64, length: usize) -> Result<Vec<u8>> {
        let mut remaining = (length as u64).min(self.size.saturating_sub(offset));
        let mut result = Vec::with_capacity(length);

        // Coalesce physically-consecutive clusters (and consecutive sparse
        // clusters) into single reads.
        let mut run_offset: Option<u64> = None;
        let mut run_logical = offset;
        let mut run_size = 0u64;
        let mut cursor = offset;

        let flush = |this: &mut Self,
                         run_offset: Option<u64>,
                         run_logical: u64,
                         run_size: u64,
                         result: &mut Vec<u8>|
         -> Result<()> {
            if run_size == 0 {
                return Ok(());
            }
            match run_offset {
                None => {
                    if let Some(parent) = this.parent.as_mut() {
                        parent.seek(SeekFrom::Start(run_logical))?;
                        let mut buf = vec![0u8; run_size as usize];
                        parent.read_exact(&mut buf)?;
                        result.extend_from_slice(&buf);
                    } else {
                        result.resize(result.len() + run_size as usize, 0);
                    }
                }
                Some(physical) => {
                    let buf = read_at_most(&mut this.fh, physical, run_size as usize)?;
                    let got = buf.len();
                    result.extend_from_slice(&buf);
                    if got < run_size as usize {
                        result.resize(result.len() + run_size as usize - got, 0);
                    }
                }
            }
            Ok(())
        };

        while remaining > 0 {
            let cluster_idx = (cursor / self.cluster_size) as usize;
            let offset_in_cluster = cursor % self.cluster_size;
            let read_size = (self.cluster_size - offset_in_cluster).min(remaining);

            let entry = *self.bat.get(cluster_idx).ok_or_else(|| {
                Error::out_of_range(format!("HDS cluster {} beyond BAT", cluster_idx))
            })?;

            let read_offset = if entry == 0 {
                None
            } else {
                Some(entry as u64 * self.bat_multiplier * SECTOR_SIZE + offset_in_cluster)
            };

            let consecutive = match (run_offset, read_offset, run_size) {
                (_, _, 0) => false,
                (None, None, _) => true,
                (Some(run), Some(this), _) => this == run + run_size,
                _ => false,
            };

            if run_size == 0 {
                run_offset = read_offset;
                run_logical = cursor;
                run_size = read_size;
            } else if consecutive {
                run_size += read_size;
            } else {
                flush(self, run_offset, run_logical, run_size, &mut result)?;
                run_offset = read_offset;
                run_logical = cursor;
                run_size = read_size;
            }

            cursor += read_size;
            remaining -= read_size;
        }

        flush(self, run_offset, run_logical, run_size, &mut result)?;
        Ok(result)
    }
}

impl Read for HDS {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        stream::read_from(self, buf)
    }
}

impl Seek for HDS {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        stream::seek_to(self, pos)
    }
}

/// One `Storage` element of the descriptor: a sector range backed by a
/// stack of image files, one per snapshot generation.
#[derive(Clone, Debug)]
pub struct Storage {
    /// First sector covered by this storage.
    pub start: u64,
    /// One past the last sector covered by this storage.
    pub end: u64,
    pub images: Vec<ImageRef>,
}

impl Storage {
    fn find_image(&self, guid: &str) -> Result<&ImageRef> {
        self.images
            .iter()
            .find(|image| image.guid == guid)
            .ok_or_else(|| Error::corrupt(format!("image GUID not found in storage: {}", guid)))
    }
}

/// The image kind named by the descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageKind {
    Plain,
    Compressed,
}

#[derive(Clone, Debug)]
pub struct ImageRef {
    pub guid: String,
    pub kind: ImageKind,
    pub file: String,
}

/// A snapshot tree node.
#[derive(Clone, Debug)]
pub struct Shot {
    pub guid: String,
    pub parent: String,
}

/// The parsed `DiskDescriptor.xml`.
///
/// See also: https://github.com/qemu/qemu/blob/master/docs/interop/prl-xml.txt
#[derive(Clone, Debug, Default)]
pub struct Descriptor {
    pub storages: Vec<Storage>,
    pub top_guid: Option<String>,
    pub shots: Vec<Shot>,
}

impl Descriptor {
    pub fn parse(text: &str) -> Result<Descriptor> {
        let mut reader = XmlReader::from_str(text);
        reader.config_mut().trim_text(true);

        let mut descriptor = Descriptor::default();
        let mut path: Vec<String> = Vec::new();

        let mut storage: Option<Storage> = None;
        let mut image: Option<(String, String, String)> = None;
        let mut shot: Option<(String, String)> = None;

        loop {
            match reader
                .read_event()
                .map_err(|e| Error::header(format!("invalid DiskDescriptor.xml: {}", e)))?
            {
                Event::Start(e) => {
                    let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                    match name.as_str() {
                        "Storage" if path.last().map(String::as_str) == Some("StorageData") => {
                            storage = Some(Storage {
                                start: 0,
                                end: 0,
                                images: Vec::new(),
                            });
                        }
                        "Image" if storage.is_some() => {
                            image = Some((String::new(), String::new(), String::new()));
                        }
                        "Shot" => shot = Some((String::new(), String::new())),
                        _ => {}
                    }
                    path.push(name);
                }
                Event::Text(e) => {
                    let text = e
                        .unescape()
                        .map_err(|e| Error::header(format!("invalid DiskDescriptor.xml: {}", e)))?
                        .to_string();
                    let element = path.last().map(String::as_str).unwrap_or("");
                    if let Some((guid, kind, file)) = image.as_mut() {
                        match element {
                            "GUID" => *guid = text,
                            "Type" => *kind = text,
                            "File" => *file = text,
                            _ => {}
                        }
                    } else if let Some((guid, parent)) = shot.as_mut() {
                        match element {
                            "GUID" => *guid = text,
                            "ParentGUID" => *parent = text,
                            _ => {}
                        }
                    } else if let Some(st) = storage.as_mut() {
                        match element {
                            "Start" => {
                                st.start = text.parse().map_err(|_| {
                                    Error::header("invalid Start sector in DiskDescriptor.xml")
                                })?;
                            }
                            "End" => {
                                st.end = text.parse().map_err(|_| {
                                    Error::header("invalid End sector in DiskDescriptor.xml")
                                })?;
                            }
                            _ => {}
                        }
                    } else if element == "TopGUID" && path.iter().any(|p| p == "Snapshots") {
                        descriptor.top_guid = Some(normalize_guid(&text));
                    }
                }
                Event::End(e) => {
                    let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                    path.pop();
                    match name.as_str() {
                        "Image" => {
                            if let (Some(st), Some((guid, kind, file))) = (storage.as_mut(), image.take()) {
                                let kind = match kind.as_str() {
                                    "Plain" => ImageKind::Plain,
                                    "Compressed" => ImageKind::Compressed,
                                    other => {
                                        return Err(Error::unsupported(format!(
                                            "unsupported Parallels image type: {}",
                                            other
                                        )))
                                    }
                                };
                                st.images.push(ImageRef {
                                    guid: normalize_guid(&guid),
                                    kind,
                                    file,
                                });
                            }
                        }
                        "Storage" => {
                            if let Some(st) = storage.take() {
                                descriptor.storages.push(st);
                            }
                        }
                        "Shot" => {
                            if let Some((guid, parent)) = shot.take() {
                                descriptor.shots.push(Shot {
                                    guid: normalize_guid(&guid),
                                    parent: normalize_guid(&parent),
                                });
                            }
                        }
                        _ => {}
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if descriptor.storages.is_empty() {
            return Err(Error::header("DiskDescriptor.xml contains no storages"));
        }

        Ok(descriptor)
    }

    /// Return the snapshot chain for a GUID, newest first, root last.
    pub fn snapshot_chain(&self, guid: &str) -> Result<Vec<String>> {
        let mut chain = Vec::new();
        let mut current = guid.to_string();

        loop {
            let shot = self
                .shots
                .iter()
                .find(|s| s.guid == current)
                .ok_or_else(|| Error::corrupt(format!("shot GUID not found: {}", current)))?;
            if chain.contains(&shot.guid) {
                return Err(Error::corrupt("cycle in Parallels snapshot chain"));
            }
            chain.push(shot.guid.clone());
            if shot.parent == NULL_GUID {
                break;
            }
            current = shot.parent.clone();
        }

        Ok(chain)
    }
}

/// Represents a Parallels HDD virtual disk directory.
pub struct HDD {
    path: PathBuf,
    descriptor: Descriptor,
}

impl HDD {
    /// Open a `.hdd` directory (or a file inside one).
    pub fn open(path: &Path) -> Result<HDD> {
        let mut root = path.to_path_buf();
        if root.is_file() {
            if let Some(parent) = root.parent() {
                root = parent.to_path_buf();
            }
        }

        let descriptor_path = root.join("DiskDescriptor.xml");
        let text = std::fs::read_to_string(&descriptor_path)
            .map_err(|e| Error::io(e, &descriptor_path))?;
        let descriptor = Descriptor::parse(&text)?;

        Ok(HDD {
            path: root,
            descriptor,
        })
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    /// The snapshot GUIDs present in this disk.
    pub fn snapshots(&self) -> Vec<&str> {
        self.descriptor.shots.iter().map(|s| s.guid.as_str()).collect()
    }

    pub fn print_info(&self) {
        info!("Parallels HDD Information:");
        for storage in &self.descriptor.storages {
            info!(
                "  Storage: sectors [{}, {}), {} image(s)",
                storage.start,
                storage.end,
                storage.images.len()
            );
        }
        info!("  Snapshots: {}", self.descriptor.shots.len());
    }

    /// Open a stream for this disk, optionally for a specific snapshot.
    ///
    /// Without a GUID, the descriptor's top snapshot (or the Parallels
    /// default top GUID) is used.
    pub fn open_stream(&self, guid: Option<&str>) -> Result<StorageStream> {
        self.open_stream_with(&FsOpener, guid)
    }

    pub fn open_stream_with(
        &self,
        opener: &dyn FileOpener,
        guid: Option<&str>,
    ) -> Result<StorageStream> {
        let top = match guid {
            Some(guid) => normalize_guid(guid),
            None => self
                .descriptor
                .top_guid
                .clone()
                .unwrap_or_else(|| DEFAULT_TOP_GUID.to_string()),
        };

        let chain = self.descriptor.snapshot_chain(&top)?;
        debug!("HDD snapshot chain (newest first): {:?}", chain);

        let mut streams = Vec::new();
        for storage in &self.descriptor.storages {
            // Stack the chain oldest-first so each newer image overlays its parent.
            let mut stream: Option<Box<dyn ReadSeek>> = None;
            for guid in chain.iter().rev() {
                let image = storage.find_image(guid)?;
                let image_path = resolve_image_path(&self.path, Path::new(&image.file));
                let fh = opener.open(&image_path).map_err(|e| match e {
                    Error::Io { source, path } => Error::MissingDependency {
                        message: format!("cannot open Parallels image: {}", source),
                        path,
                    },
                    other => other,
                })?;

                stream = Some(match image.kind {
                    ImageKind::Compressed => Box::new(HDS::new(fh, stream.take())?),
                    ImageKind::Plain => fh,
                });
            }

            let stream = stream.ok_or_else(|| Error::corrupt("empty Parallels snapshot chain"))?;
            streams.push((storage.clone(), stream));
        }

        StorageStream::new(streams)
    }
}

/// Stitches the per-storage streams of an HDD into one logical stream.
pub struct StorageStream {
    streams: Vec<(Storage, Box<dyn ReadSeek>)>,
    starts: Vec<u64>,
    size: u64,
    position: u64,
}

impl StorageStream {
    pub fn new(mut streams: Vec<(Storage, Box<dyn ReadSeek>)>) -> Result<StorageStream> {
        streams.sort_by_key(|(storage, _)| storage.start);

        let mut starts = Vec::with_capacity(streams.len());
        let mut size = 0;
        for (storage, _) in &streams {
            starts.push(storage.start);
            size = storage.end;
        }

        Ok(StorageStream {
            streams,
            starts,
            size: size * SECTOR_SIZE,
            position: 0,
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

impl AlignedImage for StorageStream {
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
        let mut sector = offset / SECTOR_SIZE;
        let mut count = capped.div_ceil(SECTOR_SIZE);
        let mut result = Vec::with_capacity(capped as usize);

        let mut idx = self.starts.partition_point(|start| *start <= sector).saturating_sub(1);

        while count > 0 && idx < self.streams.len() {
            let (storage, stream) = &mut self.streams[idx];
            let sectors_remaining = storage.end.saturating_sub(sector);
            let read_sectors = sectors_remaining.min(count);
            if read_sectors == 0 {
                break;
            }

            stream.seek(SeekFrom::Start((sector - storage.start) * SECTOR_SIZE))?;
            let want = (read_sectors * SECTOR_SIZE) as usize;
            let mut buf = vec![0u8; want];
            let mut filled = 0;
            while filled < want {
                let n = stream.read(&mut buf[filled..])?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            result.extend_from_slice(&buf);

            sector += read_sectors;
            count -= read_sectors;
            idx += 1;
        }

        result.truncate(capped as usize);
        Ok(result)
    }
}

impl Read for StorageStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        stream::read_from(self, buf)
    }
}

impl Seek for StorageStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        stream::seek_to(self, pos)
    }
}

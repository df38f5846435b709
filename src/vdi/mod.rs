//! This module contains functionality for reading VirtualBox VDI volumes.
//!
//! Dynamic and fixed images are supported. Differencing images can be read
//! by supplying the opened parent stream; resolving which file that is
//! belongs to the VirtualBox machine registry, which is not parsed here.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use log::{debug, info};

use crate::binread::{i32_table_le, le_u32, le_u64, read_at, read_at_most};
use crate::errors::{Error, Result};
use crate::stream::{self, AlignedImage, ReadSeek};

const VDI_SIGNATURE: u32 = 0xBEDA107F;

/// Block map entry for a block that was never written. Reads fall through
/// to the parent image, or zeros without one.
const UNALLOCATED: i32 = -1;
/// Block map entry for a block that was discarded/zeroed.
const SPARSE: i32 = -2;

/// The VDI pre-header and header descriptor.
///
/// See also: https://www.virtualbox.org/browser/vbox/trunk/src/VBox/Storage/VDICore.h
#[derive(Clone, Debug)]
pub struct VDIHeader {
    /// Image signature, must be 0xBEDA107F.
    pub signature: u32,
    /// Version, usually 1.1.
    pub version: u32,
    pub header_size: u32,
    /// 1 = dynamic, 2 = fixed, 3 = undo, 4 = differencing.
    pub image_type: u32,
    pub image_flags: u32,
    /// File offset of the block map.
    pub blocks_offset: u32,
    /// File offset of the data area.
    pub data_offset: u32,
    pub sector_size: u32,
    /// Logical disk size in bytes.
    pub disk_size: u64,
    /// Size of one block, typically 1 MiB.
    pub block_size: u32,
    /// Number of entries in the block map.
    pub blocks_in_hdd: u32,
    pub blocks_allocated: u32,
    /// UUID of this image.
    pub uuid: [u8; 16],
    /// UUID of the parent image, all zeroes when there is none.
    pub uuid_parent: [u8; 16],
}

impl VDIHeader {
    fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < 456 {
            return Err(Error::header("VDI header too short"));
        }

        let signature = le_u32(buf, 64);
        if signature != VDI_SIGNATURE {
            return Err(Error::signature(format!(
                "invalid VDI signature: {:#010x}",
                signature
            )));
        }

        Ok(VDIHeader {
            signature,
            version: le_u32(buf, 68),
            header_size: le_u32(buf, 72),
            image_type: le_u32(buf, 76),
            image_flags: le_u32(buf, 80),
            blocks_offset: le_u32(buf, 340),
            data_offset: le_u32(buf, 344),
            sector_size: le_u32(buf, 360),
            disk_size: le_u64(buf, 368),
            block_size: le_u32(buf, 376),
            blocks_in_hdd: le_u32(buf, 384),
            blocks_allocated: le_u32(buf, 388),
            uuid: buf[392..408].try_into().unwrap(),
            uuid_parent: buf[440..456].try_into().unwrap(),
        })
    }
}

/// Represents a VDI virtual disk.
pub struct VDI {
    fh: Box<dyn ReadSeek>,
    header: VDIHeader,
    /// Signed 32-bit block map: -1 unallocated, -2 sparse, >= 0 physical block index.
    map: Vec<i32>,
    parent: Option<Box<dyn ReadSeek>>,
    position: u64,
}

impl std::fmt::Debug for VDI {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VDI")
            .field("header", &self.header)
            .field("map", &self.map)
            .field("position", &self.position)
            .finish()
    }
}

impl VDI {
    /// Parse a VDI image from an open stream, optionally with the opened
    /// parent image for differencing disks.
    pub fn new(mut fh: Box<dyn ReadSeek>, parent: Option<Box<dyn ReadSeek>>) -> Result<VDI> {
        let header_buf = read_at(&mut fh, 0, 456)?;
        let header = VDIHeader::parse(&header_buf)?;

        if header.block_size == 0 || !header.block_size.is_power_of_two() {
            return Err(Error::header(format!(
                "VDI block size is not a power of two: {:#x}",
                header.block_size
            )));
        }

        debug!(
            "VDI: {} blocks of {:#x} bytes, map at {:#x}, data at {:#x}",
            header.blocks_in_hdd, header.block_size, header.blocks_offset, header.data_offset
        );

        let map_buf = read_at(
            &mut fh,
            header.blocks_offset as u64,
            header.blocks_in_hdd as usize * 4,
        )?;
        let map = i32_table_le(&map_buf);

        if header.uuid_parent != [0u8; 16] && parent.is_none() {
            debug!("VDI references a parent image but none was supplied; unallocated blocks read as zeros");
        }

        Ok(VDI {
            fh,
            header,
            map,
            parent,
            position: 0,
        })
    }

    /// Open a VDI image from a file path.
    pub fn open(path: &Path) -> Result<VDI> {
        let file = File::open(path).map_err(|e| Error::io(e, path))?;
        Self::new(Box::new(file), None)
    }

    pub fn header(&self) -> &VDIHeader {
        &self.header
    }

    pub fn size(&self) -> u64 {
        self.header.disk_size
    }

    pub fn print_info(&self) {
        info!("VDI Disk Information:");
        info!("  Disk Size: {} bytes", self.header.disk_size);
        info!("  Block Size: {} bytes", self.header.block_size);
        info!("  Blocks: {} ({} allocated)", self.header.blocks_in_hdd, self.header.blocks_allocated);
        info!("  Image Type: {}", self.header.image_type);
    }
}

impl AlignedImage for VDI {
    fn size(&self) -> u64 {
        self.header.disk_size
    }

    fn align(&self) -> u64 {
        self.header.block_size as u64
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn set_position(&mut self, pos: u64) {
        self.position = pos;
    }

    fn read_aligned(&mut self, mut offset: u64, length: usize) -> Result<Vec<u8>> {
        let block_size = self.header.block_size as u64;
        let mut remaining = (length as u64).min(self.size().saturating_sub(offset));
        let mut result = Vec::with_capacity(length);

        while remaining > 0 {
            let block_idx = (offset / block_size) as usize;
            let offset_in_block = offset % block_size;
            let read_len = (block_size - offset_in_block).min(remaining) as usize;

            let entry = *self
                .map
                .get(block_idx)
                .ok_or_else(|| Error::out_of_range(format!("VDI block {} beyond block map", block_idx)))?;

            match entry {
                UNALLOCATED => {
                    if let Some(parent) = self.parent.as_mut() {
                        parent.seek(SeekFrom::Start(offset))?;
                        let mut buf = vec![0u8; read_len];
                        parent.read_exact(&mut buf)?;
                        result.extend_from_slice(&buf);
                    } else {
                        result.resize(result.len() + read_len, 0);
                    }
                }
                SPARSE => result.resize(result.len() + read_len, 0),
                block => {
                    if block < 0 {
                        return Err(Error::corrupt(format!(
                            "VDI block map entry {} is negative but not a sentinel",
                            block
                        )));
                    }
                    let physical = self.header.data_offset as u64
                        + block as u64 * block_size
                        + offset_in_block;
                    let buf = read_at_most(&mut self.fh, physical, read_len)?;
                    let got = buf.len();
                    result.extend_from_slice(&buf);
                    if got < read_len {
                        // Truncated data area; pad the logical tail.
                        result.resize(result.len() + read_len - got, 0);
                    }
                }
            }

            offset += read_len as u64;
            remaining -= read_len as u64;
        }

        Ok(result)
    }
}

impl Read for VDI {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        stream::read_from(self, buf)
    }
}

impl Seek for VDI {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        stream::seek_to(self, pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn build_vdi(disk_size: u64, block_size: u32, map: &[i32], data: &[u8]) -> Vec<u8> {
        let blocks_offset = 512u32;
        let data_offset = 4096u32;
        let mut buf = vec![0u8; data_offset as usize + data.len()];

        buf[64..68].copy_from_slice(&VDI_SIGNATURE.to_le_bytes());
        buf[68..72].copy_from_slice(&0x00010001u32.to_le_bytes());
        buf[72..76].copy_from_slice(&0x190u32.to_le_bytes());
        buf[76..80].copy_from_slice(&1u32.to_le_bytes());
        buf[340..344].copy_from_slice(&blocks_offset.to_le_bytes());
        buf[344..348].copy_from_slice(&data_offset.to_le_bytes());
        buf[360..364].copy_from_slice(&512u32.to_le_bytes());
        buf[368..376].copy_from_slice(&disk_size.to_le_bytes());
        buf[376..380].copy_from_slice(&block_size.to_le_bytes());
        buf[384..388].copy_from_slice(&(map.len() as u32).to_le_bytes());

        for (i, entry) in map.iter().enumerate() {
            let off = blocks_offset as usize + i * 4;
            buf[off..off + 4].copy_from_slice(&entry.to_le_bytes());
        }
        buf[data_offset as usize..].copy_from_slice(data);
        buf
    }

    #[test]
    fn test_rejects_bad_signature() {
        let image = vec![0u8; 512];
        let err = VDI::new(Box::new(Cursor::new(image)), None).unwrap_err();
        assert!(matches!(err, Error::InvalidSignature(_)));
    }

    #[test]
    fn test_block_map_semantics() {
        let block_size = 4096u32;
        // Block 0 allocated (physical block 1), block 1 sparse, block 2 unallocated,
        // block 3 allocated (physical block 0).
        let mut data = vec![0u8; 2 * block_size as usize];
        data[..block_size as usize].fill(0xBB);
        data[block_size as usize..].fill(0xAA);

        let image = build_vdi(4 * block_size as u64, block_size, &[1, SPARSE, UNALLOCATED, 0], &data);
        let mut vdi = VDI::new(Box::new(Cursor::new(image)), None).unwrap();
        assert_eq!(vdi.size(), 4 * block_size as u64);

        let mut out = Vec::new();
        vdi.read_to_end(&mut out).unwrap();
        assert_eq!(out.len(), 4 * block_size as usize);
        assert!(out[..4096].iter().all(|b| *b == 0xAA));
        assert!(out[4096..8192].iter().all(|b| *b == 0));
        assert!(out[8192..12288].iter().all(|b| *b == 0));
        assert!(out[12288..].iter().all(|b| *b == 0xBB));
    }

    #[test]
    fn test_unallocated_falls_back_to_parent() {
        let block_size = 4096u32;
        let parent_content = vec![0x77u8; 2 * block_size as usize];
        let parent = Box::new(Cursor::new(parent_content));

        let image = build_vdi(2 * block_size as u64, block_size, &[UNALLOCATED, SPARSE], &[]);
        let mut vdi = VDI::new(Box::new(Cursor::new(image)), Some(parent)).unwrap();

        let mut out = Vec::new();
        vdi.read_to_end(&mut out).unwrap();
        assert!(out[..4096].iter().all(|b| *b == 0x77));
        assert!(out[4096..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_unaligned_read_matches_slice() {
        let block_size = 4096u32;
        let mut data = vec![0u8; block_size as usize];
        for (i, b) in data.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }

        let image = build_vdi(2 * block_size as u64, block_size, &[0, SPARSE], &data);
        let mut vdi = VDI::new(Box::new(Cursor::new(image)), None).unwrap();

        let mut all = Vec::new();
        vdi.read_to_end(&mut all).unwrap();

        vdi.seek(SeekFrom::Start(1000)).unwrap();
        let mut buf = vec![0u8; 300];
        vdi.read_exact(&mut buf).unwrap();
        assert_eq!(&buf[..], &all[1000..1300]);
        assert_eq!(vdi.stream_position().unwrap(), 1300);
    }
}

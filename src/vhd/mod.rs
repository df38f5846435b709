//! This module contains functionality for reading VHD (Virtual PC / Hyper-V)
//! volumes.
//!
//! Fixed and dynamic disks are supported. Split VHD files are not.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use log::{debug, info};

use crate::binread::{be_u32, be_u64, read_at, read_at_most, u32_table_be};
use crate::errors::{Error, Result};
use crate::stream::{self, AlignedImage, ReadSeek};

const SECTOR_SIZE: u64 = 512;
const FOOTER_COOKIE: &[u8; 8] = b"conectix";
const DYNAMIC_COOKIE: &[u8; 8] = b"cxsparse";

/// BAT entry marking a block that was never allocated.
const BAT_ABSENT: u32 = 0xFFFFFFFF;

/// The VHD footer, stored in the last 512 bytes of the file.
///
/// Versions previous to Microsoft Virtual PC 2004 can have a 511 byte
/// footer; bit 1 of `features` tells the two apart.
#[derive(Clone, Debug)]
pub struct VHDFooter {
    pub features: u32,
    pub version: u32,
    /// Offset of the dynamic header, or 0xFFFFFFFFFFFFFFFF for fixed disks.
    pub data_offset: u64,
    pub original_size: u64,
    /// Logical disk size in bytes.
    pub current_size: u64,
    /// 2 = fixed, 3 = dynamic, 4 = differencing.
    pub disk_type: u32,
    pub unique_id: [u8; 16],
}

impl VHDFooter {
    fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < 84 {
            return Err(Error::header("VHD footer too short"));
        }
        if &buf[0..8] != FOOTER_COOKIE {
            return Err(Error::signature("invalid VHD footer cookie"));
        }

        Ok(VHDFooter {
            features: be_u32(buf, 8),
            version: be_u32(buf, 12),
            data_offset: be_u64(buf, 16),
            original_size: be_u64(buf, 40),
            current_size: be_u64(buf, 48),
            disk_type: be_u32(buf, 60),
            unique_id: buf[68..84].try_into().unwrap(),
        })
    }
}

/// The dynamic disk header pointed at by the footer's `data_offset`.
#[derive(Clone, Debug)]
pub struct VHDDynamicHeader {
    pub table_offset: u64,
    pub max_table_entries: u32,
    pub block_size: u32,
}

impl VHDDynamicHeader {
    fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < 36 {
            return Err(Error::header("VHD dynamic header too short"));
        }
        if &buf[0..8] != DYNAMIC_COOKIE {
            return Err(Error::signature("invalid VHD dynamic header cookie"));
        }

        Ok(VHDDynamicHeader {
            table_offset: be_u64(buf, 16),
            max_table_entries: be_u32(buf, 28),
            block_size: be_u32(buf, 32),
        })
    }
}

#[derive(Debug)]
enum VHDDisk {
    Fixed,
    Dynamic {
        header: VHDDynamicHeader,
        /// Sector offsets of each block; 0xFFFFFFFF = absent.
        bat: Vec<u32>,
        sectors_per_block: u64,
        /// Size of the per-block sector bitmap, in sectors.
        bitmap_sectors: u64,
    },
}

/// Represents a VHD virtual disk.
pub struct VHD {
    fh: Box<dyn ReadSeek>,
    footer: VHDFooter,
    disk: VHDDisk,
    position: u64,
}

impl std::fmt::Debug for VHD {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VHD")
            .field("footer", &self.footer)
            .field("disk", &self.disk)
            .field("position", &self.position)
            .finish()
    }
}

fn read_footer(fh: &mut Box<dyn ReadSeek>) -> Result<VHDFooter> {
    let end = fh.seek(SeekFrom::End(0))?;
    if end < 512 {
        return Err(Error::header("VHD file too small for a footer"));
    }

    let buf = read_at(fh, end - 512, 512)?;
    let footer = VHDFooter::parse(&buf)?;
    if footer.features & 0x00000002 == 0 {
        // Pre-2004 images can carry a 511 byte footer.
        let buf = read_at(fh, end - 511, 511)?;
        return VHDFooter::parse(&buf);
    }
    Ok(footer)
}

impl VHD {
    /// Parse a VHD image from an open stream.
    pub fn new(mut fh: Box<dyn ReadSeek>) -> Result<VHD> {
        let footer = read_footer(&mut fh)?;

        let disk = if footer.data_offset == 0xFFFFFFFFFFFFFFFF {
            debug!("VHD: fixed disk, {} bytes", footer.current_size);
            VHDDisk::Fixed
        } else {
            let buf = read_at(&mut fh, footer.data_offset, 1024)?;
            let header = VHDDynamicHeader::parse(&buf)?;

            if header.block_size == 0 || header.block_size as u64 % SECTOR_SIZE != 0 {
                return Err(Error::header(format!(
                    "VHD block size is not sector aligned: {:#x}",
                    header.block_size
                )));
            }

            let bat_buf = read_at(
                &mut fh,
                header.table_offset,
                header.max_table_entries as usize * 4,
            )?;
            let bat = u32_table_be(&bat_buf);

            let sectors_per_block = header.block_size as u64 / SECTOR_SIZE;
            // Sector bitmaps are padded to sector boundaries.
            let bitmap_sectors = (sectors_per_block / 8).div_ceil(SECTOR_SIZE);

            debug!(
                "VHD: dynamic disk, {} blocks of {:#x} bytes",
                header.max_table_entries, header.block_size
            );

            VHDDisk::Dynamic {
                header,
                bat,
                sectors_per_block,
                bitmap_sectors,
            }
        };

        Ok(VHD {
            fh,
            footer,
            disk,
            position: 0,
        })
    }

    /// Open a VHD image from a file path.
    pub fn open(path: &Path) -> Result<VHD> {
        let file = File::open(path).map_err(|e| Error::io(e, path))?;
        Self::new(Box::new(file))
    }

    pub fn footer(&self) -> &VHDFooter {
        &self.footer
    }

    pub fn size(&self) -> u64 {
        self.footer.current_size
    }

    pub fn print_info(&self) {
        info!("VHD Disk Information:");
        info!("  Disk Size: {} bytes", self.footer.current_size);
        match &self.disk {
            VHDDisk::Fixed => info!("  Disk Type: fixed"),
            VHDDisk::Dynamic { header, .. } => {
                info!("  Disk Type: dynamic");
                info!("  Block Size: {} bytes", header.block_size);
                info!("  Table Entries: {}", header.max_table_entries);
            }
        }
    }
}

impl AlignedImage for VHD {
    fn size(&self) -> u64 {
        self.footer.current_size
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
        let capped = (length as u64).min(self.size().saturating_sub(offset)) as usize;

        match &self.disk {
            VHDDisk::Fixed => read_at_most(&mut self.fh, offset, capped),
            VHDDisk::Dynamic {
                bat,
                sectors_per_block,
                bitmap_sectors,
                ..
            } => {
                let mut sector = offset / SECTOR_SIZE;
                let mut count = (capped as u64).div_ceil(SECTOR_SIZE);
                let mut result = Vec::with_capacity(capped);

                while count > 0 {
                    let block = (sector / sectors_per_block) as usize;
                    let sector_in_block = sector % sectors_per_block;
                    let read_count = count.min(sectors_per_block - sector_in_block);

                    let entry = *bat.get(block).ok_or_else(|| {
                        Error::out_of_range(format!("VHD block {} beyond BAT", block))
                    })?;

                    if entry == BAT_ABSENT {
                        result.resize(result.len() + (read_count * SECTOR_SIZE) as usize, 0);
                    } else {
                        // The sector bitmap before the block marks clean/dirty
                        // sectors; it is irrelevant for read-only access.
                        let physical =
                            (entry as u64 + bitmap_sectors + sector_in_block) * SECTOR_SIZE;
                        let want = (read_count * SECTOR_SIZE) as usize;
                        let buf = read_at_most(&mut self.fh, physical, want)?;
                        let got = buf.len();
                        result.extend_from_slice(&buf);
                        if got < want {
                            result.resize(result.len() + want - got, 0);
                        }
                    }

                    sector += read_count;
                    count -= read_count;
                }

                result.truncate(capped);
                Ok(result)
            }
        }
    }
}

impl Read for VHD {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        stream::read_from(self, buf)
    }
}

impl Seek for VHD {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        stream::seek_to(self, pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn footer_bytes(virtual_size: u64, disk_type: u32, data_offset: u64) -> [u8; 512] {
        let mut footer = [0u8; 512];
        footer[0..8].copy_from_slice(FOOTER_COOKIE);
        footer[8..12].copy_from_slice(&2u32.to_be_bytes());
        footer[12..16].copy_from_slice(&0x00010000u32.to_be_bytes());
        footer[16..24].copy_from_slice(&data_offset.to_be_bytes());
        footer[40..48].copy_from_slice(&virtual_size.to_be_bytes());
        footer[48..56].copy_from_slice(&virtual_size.to_be_bytes());
        footer[60..64].copy_from_slice(&disk_type.to_be_bytes());
        footer
    }

    fn build_fixed(data: &[u8]) -> Vec<u8> {
        let mut image = data.to_vec();
        image.extend_from_slice(&footer_bytes(data.len() as u64, 2, u64::MAX));
        image
    }

    /// One-block dynamic disk: header at 512, BAT at 1536, block at 2048.
    fn build_dynamic(virtual_size: u64, block_size: u32, block0: Option<&[u8]>) -> Vec<u8> {
        let blocks = virtual_size.div_ceil(block_size as u64) as u32;
        let mut image = vec![0u8; 2048];
        image[0..512].copy_from_slice(&footer_bytes(virtual_size, 3, 512));

        image[512..520].copy_from_slice(DYNAMIC_COOKIE);
        image[528..536].copy_from_slice(&1536u64.to_be_bytes()); // table_offset
        image[540..544].copy_from_slice(&blocks.to_be_bytes());
        image[544..548].copy_from_slice(&block_size.to_be_bytes());

        for i in 0..blocks as usize {
            let off = 1536 + i * 4;
            image[off..off + 4].copy_from_slice(&BAT_ABSENT.to_be_bytes());
        }

        if let Some(data) = block0 {
            assert_eq!(data.len(), block_size as usize);
            let sector_offset = (image.len() as u64 / SECTOR_SIZE) as u32;
            image[1536..1540].copy_from_slice(&sector_offset.to_be_bytes());
            // Sector bitmap (all dirty) then the block data.
            image.extend_from_slice(&vec![0xFFu8; SECTOR_SIZE as usize]);
            image.extend_from_slice(data);
        }

        image.extend_from_slice(&footer_bytes(virtual_size, 3, 512));
        image
    }

    #[test]
    fn test_fixed_disk_reads_raw() {
        let mut data = vec![0u8; 64 * 1024];
        data[0..10].copy_from_slice(b"hello vhd!");

        let mut vhd = VHD::new(Box::new(Cursor::new(build_fixed(&data)))).unwrap();
        assert_eq!(vhd.size(), 64 * 1024);

        let mut out = Vec::new();
        vhd.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_dynamic_absent_blocks_read_zero() {
        let mut vhd = VHD::new(Box::new(Cursor::new(build_dynamic(64 * 1024, 16 * 1024, None)))).unwrap();

        let mut out = Vec::new();
        vhd.read_to_end(&mut out).unwrap();
        assert_eq!(out.len(), 64 * 1024);
        assert!(out.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_dynamic_present_block() {
        let block: Vec<u8> = (0..16 * 1024).map(|i| (i % 241) as u8).collect();
        let image = build_dynamic(64 * 1024, 16 * 1024, Some(&block));
        let mut vhd = VHD::new(Box::new(Cursor::new(image))).unwrap();

        let mut out = Vec::new();
        vhd.read_to_end(&mut out).unwrap();
        assert_eq!(&out[..16 * 1024], &block[..]);
        assert!(out[16 * 1024..].iter().all(|b| *b == 0));

        // Reads not on sector boundaries still line up.
        vhd.seek(SeekFrom::Start(777)).unwrap();
        let mut buf = [0u8; 100];
        vhd.read_exact(&mut buf).unwrap();
        assert_eq!(&buf[..], &block[777..877]);
    }

    #[test]
    fn test_rejects_bad_cookie() {
        let mut image = build_fixed(&[0u8; 1024]);
        let len = image.len();
        image[len - 512..len - 504].copy_from_slice(b"notavhd!");
        let err = VHD::new(Box::new(Cursor::new(image))).unwrap_err();
        assert!(matches!(err, Error::InvalidSignature(_)));
    }
}

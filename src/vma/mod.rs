//! This module contains functionality for reading Proxmox VMA backup
//! archives.
//!
//! A VMA is a streamable backup container: a big-endian header with a blob
//! table naming up to 255 devices, followed by extents. Each extent header
//! describes up to 59 clusters (16 blocks of 4 KiB each) with a per-cluster
//! allocation mask; allocated blocks are packed back to back in the extent
//! body. The archive is indexed once at open time so devices can be read
//! randomly afterwards.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use log::{debug, info};

use crate::binread::{be_u16, be_u32, be_u64, le_u16, read_at, read_at_most};
use crate::errors::{Error, Result};
use crate::stream::{self, AlignedImage, ReadSeek};

const VMA_MAGIC: &[u8; 4] = b"VMA\x00";
const VMA_EXTENT_MAGIC: &[u8; 4] = b"VMAE";

const VMA_BLOCK_SIZE: u64 = 4096;
const VMA_CLUSTER_SIZE: u64 = 16 * VMA_BLOCK_SIZE;
const VMA_BLOCKS_PER_EXTENT: usize = 59;
const VMA_EXTENT_HEADER_SIZE: usize = 512;
const VMA_MAX_CONFIGS: usize = 256;

const HEADER_MD5_RANGE: std::ops::Range<usize> = 32..48;
const EXTENT_MD5_RANGE: std::ops::Range<usize> = 24..40;

/// A guest device stored in the archive.
#[derive(Clone, Debug)]
pub struct Device {
    pub id: u8,
    pub name: String,
    /// Device size in bytes.
    pub size: u64,
}

/// One cluster of a device: where its packed blocks start in the archive
/// and which of the 16 blocks are present.
#[derive(Clone, Copy, Debug)]
struct ClusterRef {
    cluster: u32,
    mask: u16,
    /// Archive offset of the first allocated block of this cluster.
    offset: u64,
}

/// Represents a Proxmox VMA backup archive.
pub struct VMA {
    fh: Box<dyn ReadSeek>,
    pub version: u32,
    pub uuid: [u8; 16],
    pub ctime: i64,
    configs: Vec<(String, Vec<u8>)>,
    devices: Vec<Device>,
    clusters: HashMap<u8, Vec<ClusterRef>>,
}

impl std::fmt::Debug for VMA {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VMA")
            .field("version", &self.version)
            .field("uuid", &self.uuid)
            .field("ctime", &self.ctime)
            .field("configs", &self.configs)
            .field("devices", &self.devices)
            .finish()
    }
}

impl VMA {
    /// Parse a VMA archive, indexing every extent.
    ///
    /// With `verify` set, the header and every extent are checked against
    /// their embedded MD5 digests.
    pub fn new(mut fh: Box<dyn ReadSeek>, verify: bool) -> Result<VMA> {
        let fixed = read_at(&mut fh, 0, 60)?;
        if &fixed[0..4] != VMA_MAGIC {
            return Err(Error::signature("invalid VMA header magic"));
        }

        let header_size = be_u32(&fixed, 56) as usize;
        if header_size < 12288 {
            return Err(Error::header(format!(
                "VMA header size too small: {:#x}",
                header_size
            )));
        }
        let mut header = read_at(&mut fh, 0, header_size)?;

        if verify {
            let stored: [u8; 16] = header[HEADER_MD5_RANGE].try_into().unwrap();
            header[HEADER_MD5_RANGE].fill(0);
            if md5::compute(&header).0 != stored {
                return Err(Error::corrupt("VMA header MD5 mismatch"));
            }
            header[HEADER_MD5_RANGE].copy_from_slice(&stored);
        }

        let blob_buffer_offset = be_u32(&header, 48) as usize;
        let blob_buffer_size = be_u32(&header, 52) as usize;
        if blob_buffer_offset + blob_buffer_size > header.len() {
            return Err(Error::header("VMA blob buffer outside the header"));
        }
        let blob = &header[blob_buffer_offset..blob_buffer_offset + blob_buffer_size];

        // Offsets 0 and 1 are sentinels; entries are length-prefixed with a
        // 2-byte little-endian size, in an otherwise big-endian format.
        let mut blob_data: HashMap<u32, Vec<u8>> = HashMap::new();
        let mut blob_offset = 1usize;
        while blob_offset + 2 <= blob.len() {
            let size = le_u16(blob, blob_offset) as usize;
            if blob_offset + 2 + size <= blob.len() {
                blob_data.insert(
                    blob_offset as u32,
                    blob[blob_offset + 2..blob_offset + 2 + size].to_vec(),
                );
            }
            blob_offset += size + 2;
        }

        let blob_string = |offset: u32| -> Result<String> {
            let data = blob_data
                .get(&offset)
                .ok_or_else(|| Error::header(format!("no VMA blob data at offset {}", offset)))?;
            Ok(String::from_utf8_lossy(data)
                .trim_end_matches('\0')
                .to_string())
        };

        let mut configs = Vec::new();
        for i in 0..VMA_MAX_CONFIGS {
            let name_ptr = be_u32(&header, 2044 + i * 4);
            let data_ptr = be_u32(&header, 3068 + i * 4);
            if (name_ptr, data_ptr) == (0, 0) {
                continue;
            }
            let data = blob_data
                .get(&data_ptr)
                .ok_or_else(|| Error::header(format!("no VMA blob data at offset {}", data_ptr)))?;
            configs.push((blob_string(name_ptr)?, data.clone()));
        }

        let mut devices = Vec::new();
        for dev_id in 1..256usize {
            let base = 4096 + dev_id * 32;
            let devname_ptr = be_u32(&header, base);
            if devname_ptr == 0 {
                continue;
            }
            devices.push(Device {
                id: dev_id as u8,
                name: blob_string(devname_ptr)?,
                size: be_u64(&header, base + 8),
            });
        }

        debug!("VMA: {} device(s), {} config(s)", devices.len(), configs.len());

        let mut vma = VMA {
            fh,
            version: be_u32(&header, 4),
            uuid: header[8..24].try_into().unwrap(),
            ctime: i64::from_be_bytes(header[24..32].try_into().unwrap()),
            configs,
            devices,
            clusters: HashMap::new(),
        };
        vma.index_extents(header_size as u64, verify)?;
        Ok(vma)
    }

    /// Open a VMA archive from a file path.
    pub fn open(path: &Path) -> Result<VMA> {
        let file = File::open(path).map_err(|e| Error::io(e, path))?;
        Self::new(Box::new(file), true)
    }

    /// Walk all extents once, recording where every cluster of every device
    /// lives. Consecutive allocated blocks are packed, so a running offset
    /// advances by the popcount of each mask.
    fn index_extents(&mut self, start: u64, verify: bool) -> Result<()> {
        let mut offset = start;

        loop {
            let mut header = match read_at(&mut self.fh, offset, VMA_EXTENT_HEADER_SIZE) {
                Ok(buf) => buf,
                // A short read here is the end of the archive.
                Err(Error::InvalidHeader(_)) => break,
                Err(e) => return Err(e),
            };

            if &header[0..4] != VMA_EXTENT_MAGIC {
                return Err(Error::corrupt(format!(
                    "invalid VMA extent magic at offset {:#x}",
                    offset
                )));
            }

            if verify {
                let stored: [u8; 16] = header[EXTENT_MD5_RANGE].try_into().unwrap();
                header[EXTENT_MD5_RANGE].fill(0);
                if md5::compute(&header).0 != stored {
                    return Err(Error::corrupt(format!(
                        "VMA extent MD5 mismatch at offset {:#x}",
                        offset
                    )));
                }
            }

            let block_count = be_u16(&header, 6) as u64;
            let data_offset = offset + VMA_EXTENT_HEADER_SIZE as u64;

            let mut block_offset = data_offset;
            for i in 0..VMA_BLOCKS_PER_EXTENT {
                let info = be_u64(&header, 40 + i * 8);
                let cluster = (info & 0xFFFFFFFF) as u32;
                let dev_id = ((info >> 32) & 0xFF) as u8;
                let mask = (info >> 48) as u16;

                if dev_id != 0 {
                    self.clusters.entry(dev_id).or_default().push(ClusterRef {
                        cluster,
                        mask,
                        offset: block_offset,
                    });
                }

                block_offset += mask.count_ones() as u64 * VMA_BLOCK_SIZE;
            }

            offset = data_offset + block_count * VMA_BLOCK_SIZE;
        }

        // Extents may deliver clusters out of order.
        for refs in self.clusters.values_mut() {
            refs.sort_by_key(|r| r.cluster);
        }

        Ok(())
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn device(&self, dev_id: u8) -> Result<&Device> {
        self.devices
            .iter()
            .find(|d| d.id == dev_id)
            .ok_or_else(|| Error::out_of_range(format!("no VMA device with id {}", dev_id)))
    }

    /// The VM configuration files stored alongside the devices.
    pub fn configs(&self) -> &[(String, Vec<u8>)] {
        &self.configs
    }

    pub fn print_info(&self) {
        info!("VMA Archive Information:");
        info!("  Version: {}", self.version);
        for device in &self.devices {
            info!("  Device {}: {} ({} bytes)", device.id, device.name, device.size);
        }
    }

    /// Open a random-access stream over one device.
    pub fn open_device(&mut self, dev_id: u8) -> Result<DeviceStream<'_>> {
        let size = self.device(dev_id)?.size;
        Ok(DeviceStream {
            vma: self,
            dev_id,
            size,
            position: 0,
        })
    }

    fn find_cluster(&self, dev_id: u8, cluster: u32) -> Option<ClusterRef> {
        let refs = self.clusters.get(&dev_id)?;
        let idx = refs.binary_search_by_key(&cluster, |r| r.cluster).ok()?;
        Some(refs[idx])
    }
}

/// A readable stream over a single device in the archive.
pub struct DeviceStream<'a> {
    vma: &'a mut VMA,
    dev_id: u8,
    size: u64,
    position: u64,
}

impl DeviceStream<'_> {
    pub fn size(&self) -> u64 {
        self.size
    }
}

impl AlignedImage for DeviceStream<'_> {
    fn size(&self) -> u64 {
        self.size
    }

    fn align(&self) -> u64 {
        VMA_CLUSTER_SIZE
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn set_position(&mut self, pos: u64) {
        self.position = pos;
    }

    fn read_aligned(&mut self, offset: u64, length: usize) -> Result<Vec<u8>> {
        let capped = (length as u64).min(self.size.saturating_sub(offset));
        let mut block_count = capped.div_ceil(VMA_BLOCK_SIZE);
        let mut cluster = (offset / VMA_CLUSTER_SIZE) as u32;
        let mut result = Vec::with_capacity(capped as usize);

        while block_count > 0 {
            let read_count = block_count.min(16);

            match self.vma.find_cluster(self.dev_id, cluster) {
                None => {
                    // Cluster absent from every extent: sparse.
                    result.resize(result.len() + (read_count * VMA_BLOCK_SIZE) as usize, 0);
                }
                Some(cluster_ref) if cluster_ref.mask == 0xFFFF => {
                    let want = (read_count * VMA_BLOCK_SIZE) as usize;
                    let buf = read_at_most(&mut self.vma.fh, cluster_ref.offset, want)?;
                    let got = buf.len();
                    result.extend_from_slice(&buf);
                    if got < want {
                        result.resize(result.len() + want - got, 0);
                    }
                }
                Some(cluster_ref) if cluster_ref.mask == 0 => {
                    result.resize(result.len() + (read_count * VMA_BLOCK_SIZE) as usize, 0);
                }
                Some(cluster_ref) => {
                    let mut file_offset = cluster_ref.offset;
                    for bit in 0..read_count {
                        if cluster_ref.mask & (1 << bit) != 0 {
                            let buf = read_at_most(
                                &mut self.vma.fh,
                                file_offset,
                                VMA_BLOCK_SIZE as usize,
                            )?;
                            let got = buf.len();
                            result.extend_from_slice(&buf);
                            if got < VMA_BLOCK_SIZE as usize {
                                result.resize(
                                    result.len() + VMA_BLOCK_SIZE as usize - got,
                                    0,
                                );
                            }
                            file_offset += VMA_BLOCK_SIZE;
                        } else {
                            result.resize(result.len() + VMA_BLOCK_SIZE as usize, 0);
                        }
                    }
                }
            }

            block_count -= read_count;
            cluster += 1;
        }

        result.truncate(capped as usize);
        Ok(result)
    }
}

impl Read for DeviceStream<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        stream::read_from(self, buf)
    }
}

impl Seek for DeviceStream<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        stream::seek_to(self, pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Builder {
        header: Vec<u8>,
        blob_cursor: usize,
        extents: Vec<u8>,
    }

    impl Builder {
        fn new() -> Builder {
            let header_size = 12288usize;
            let mut header = vec![0u8; header_size];
            header[0..4].copy_from_slice(VMA_MAGIC);
            header[4..8].copy_from_slice(&1u32.to_be_bytes());
            // Blob buffer: last 1024 bytes of the header.
            header[48..52].copy_from_slice(&((header_size - 1024) as u32).to_be_bytes());
            header[52..56].copy_from_slice(&1024u32.to_be_bytes());
            header[56..60].copy_from_slice(&(header_size as u32).to_be_bytes());
            Builder {
                header,
                blob_cursor: 1,
                extents: Vec::new(),
            }
        }

        fn add_blob(&mut self, data: &[u8]) -> u32 {
            let blob_start = self.header.len() - 1024;
            let at = blob_start + self.blob_cursor;
            self.header[at..at + 2].copy_from_slice(&(data.len() as u16).to_le_bytes());
            self.header[at + 2..at + 2 + data.len()].copy_from_slice(data);
            let offset = self.blob_cursor as u32;
            self.blob_cursor += 2 + data.len();
            offset
        }

        fn add_device(&mut self, dev_id: u8, name: &str, size: u64) {
            let ptr = self.add_blob(format!("{}\0", name).as_bytes());
            let base = 4096 + dev_id as usize * 32;
            self.header[base..base + 4].copy_from_slice(&ptr.to_be_bytes());
            self.header[base + 8..base + 16].copy_from_slice(&size.to_be_bytes());
        }

        /// Append an extent with the given (cluster, dev_id, mask) entries
        /// and packed block payloads.
        fn add_extent(&mut self, entries: &[(u32, u8, u16)], payload: &[u8]) {
            assert_eq!(payload.len() % VMA_BLOCK_SIZE as usize, 0);
            let block_count = (payload.len() / VMA_BLOCK_SIZE as usize) as u16;

            let mut header = vec![0u8; VMA_EXTENT_HEADER_SIZE];
            header[0..4].copy_from_slice(VMA_EXTENT_MAGIC);
            header[6..8].copy_from_slice(&block_count.to_be_bytes());
            for (i, (cluster, dev_id, mask)) in entries.iter().enumerate() {
                let info =
                    *cluster as u64 | ((*dev_id as u64) << 32) | ((*mask as u64) << 48);
                header[40 + i * 8..48 + i * 8].copy_from_slice(&info.to_be_bytes());
            }

            let digest = md5::compute(&header).0;
            header[EXTENT_MD5_RANGE].copy_from_slice(&digest);

            self.extents.extend_from_slice(&header);
            self.extents.extend_from_slice(payload);
        }

        fn build(mut self) -> Vec<u8> {
            let digest = md5::compute(&self.header).0;
            self.header[HEADER_MD5_RANGE].copy_from_slice(&digest);
            let mut image = self.header;
            image.extend_from_slice(&self.extents);
            image
        }
    }

    fn block(byte: u8) -> Vec<u8> {
        vec![byte; VMA_BLOCK_SIZE as usize]
    }

    #[test]
    fn test_rejects_bad_magic() {
        let err = VMA::new(Box::new(io::Cursor::new(vec![0u8; 60])), false).unwrap_err();
        assert!(matches!(err, Error::InvalidSignature(_)));
    }

    #[test]
    fn test_header_md5_verification() {
        let mut builder = Builder::new();
        builder.add_device(1, "drive-scsi0", VMA_CLUSTER_SIZE);
        let mut image = builder.build();

        assert!(VMA::new(Box::new(io::Cursor::new(image.clone())), true).is_ok());

        // Flip a header byte: verification must fail, lazy mode must not.
        image[100] ^= 0xFF;
        let err = VMA::new(Box::new(io::Cursor::new(image.clone())), true).unwrap_err();
        assert!(matches!(err, Error::CorruptMetadata(_)));
        assert!(VMA::new(Box::new(io::Cursor::new(image)), false).is_ok());
    }

    #[test]
    fn test_device_table_and_blob_strings() {
        let mut builder = Builder::new();
        builder.add_device(1, "drive-scsi0", 10 * VMA_CLUSTER_SIZE);
        builder.add_device(3, "drive-ide2", VMA_CLUSTER_SIZE);
        let vma = VMA::new(Box::new(io::Cursor::new(builder.build())), true).unwrap();

        assert_eq!(vma.devices().len(), 2);
        assert_eq!(vma.device(1).unwrap().name, "drive-scsi0");
        assert_eq!(vma.device(1).unwrap().size, 10 * VMA_CLUSTER_SIZE);
        assert_eq!(vma.device(3).unwrap().name, "drive-ide2");
        assert!(vma.device(2).is_err());
    }

    #[test]
    fn test_full_and_sparse_masks() {
        let mut builder = Builder::new();
        builder.add_device(1, "drive-scsi0", 3 * VMA_CLUSTER_SIZE);

        // Cluster 0 fully present, cluster 1 fully sparse, cluster 2 absent.
        let mut payload = Vec::new();
        for i in 0..16 {
            payload.extend_from_slice(&block(i as u8 + 1));
        }
        builder.add_extent(&[(0, 1, 0xFFFF), (1, 1, 0x0000)], &payload);

        let mut vma = VMA::new(Box::new(io::Cursor::new(builder.build())), true).unwrap();
        let mut stream = vma.open_device(1).unwrap();

        let mut out = Vec::new();
        stream.read_to_end(&mut out).unwrap();
        assert_eq!(out.len(), 3 * VMA_CLUSTER_SIZE as usize);

        for i in 0..16 {
            let at = i * VMA_BLOCK_SIZE as usize;
            assert!(out[at..at + VMA_BLOCK_SIZE as usize]
                .iter()
                .all(|b| *b == i as u8 + 1));
        }
        assert!(out[VMA_CLUSTER_SIZE as usize..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_partial_mask_packing() {
        let mut builder = Builder::new();
        builder.add_device(1, "drive-scsi0", VMA_CLUSTER_SIZE);

        // Blocks 0, 2 and 3 present: mask 0b1101, payload holds exactly
        // three packed blocks.
        let mut payload = Vec::new();
        payload.extend_from_slice(&block(0xA0));
        payload.extend_from_slice(&block(0xA2));
        payload.extend_from_slice(&block(0xA3));
        builder.add_extent(&[(0, 1, 0b1101)], &payload);

        let mut vma = VMA::new(Box::new(io::Cursor::new(builder.build())), true).unwrap();
        let mut stream = vma.open_device(1).unwrap();

        let mut out = Vec::new();
        stream.read_to_end(&mut out).unwrap();

        let blk = VMA_BLOCK_SIZE as usize;
        assert!(out[0..blk].iter().all(|b| *b == 0xA0));
        assert!(out[blk..2 * blk].iter().all(|b| *b == 0));
        assert!(out[2 * blk..3 * blk].iter().all(|b| *b == 0xA2));
        assert!(out[3 * blk..4 * blk].iter().all(|b| *b == 0xA3));
        assert!(out[4 * blk..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_out_of_order_clusters() {
        let mut builder = Builder::new();
        builder.add_device(1, "drive-scsi0", 2 * VMA_CLUSTER_SIZE);

        // Cluster 1 delivered before cluster 0, in separate extents.
        let mut payload1 = Vec::new();
        for _ in 0..16 {
            payload1.extend_from_slice(&block(0x22));
        }
        builder.add_extent(&[(1, 1, 0xFFFF)], &payload1);

        let mut payload0 = Vec::new();
        for _ in 0..16 {
            payload0.extend_from_slice(&block(0x11));
        }
        builder.add_extent(&[(0, 1, 0xFFFF)], &payload0);

        let mut vma = VMA::new(Box::new(io::Cursor::new(builder.build())), true).unwrap();
        let mut stream = vma.open_device(1).unwrap();

        let mut out = Vec::new();
        stream.read_to_end(&mut out).unwrap();
        assert!(out[..VMA_CLUSTER_SIZE as usize].iter().all(|b| *b == 0x11));
        assert!(out[VMA_CLUSTER_SIZE as usize..].iter().all(|b| *b == 0x22));
    }

    #[test]
    fn test_extent_md5_verification() {
        let mut builder = Builder::new();
        builder.add_device(1, "drive-scsi0", VMA_CLUSTER_SIZE);
        builder.add_extent(&[(0, 1, 0x0000)], &[]);
        let mut image = builder.build();

        // Corrupt a blockinfo byte inside the extent header.
        let extent_at = 12288;
        image[extent_at + 41] ^= 0x01;

        let err = VMA::new(Box::new(io::Cursor::new(image.clone())), true).unwrap_err();
        assert!(matches!(err, Error::CorruptMetadata(_)));
        assert!(VMA::new(Box::new(io::Cursor::new(image)), false).is_ok());
    }
}

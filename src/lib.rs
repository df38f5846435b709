//! Read-only access to the virtual block devices stored inside hypervisor
//! disk images and backup containers.
//!
//! Every supported format exposes the same surface: open the image, get a
//! stream, read guest-visible bytes. Sparse allocation, compression,
//! deduplication and parent chains are resolved behind the stream.

pub mod asif;
pub mod binread;
pub mod compress;
pub mod errors;
pub mod hdd;
pub mod opener;
pub mod qcow2;
pub mod stream;
pub mod vbk;
pub mod vdi;
pub mod vhd;
pub mod vhdx;
pub mod vma;
pub mod vmdk;

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use log::{debug, info};

pub use crate::errors::{Error, Result};
pub use crate::opener::{FileOpener, FsOpener};
pub use crate::stream::{ReadSeek, SliceStream};

use crate::asif::ASIF;
use crate::hdd::{StorageStream, HDD};
use crate::qcow2::QCOW2;
use crate::vdi::VDI;
use crate::vhd::VHD;
use crate::vhdx::VHDX;
use crate::vmdk::VMDK;

/// The disk formats a [`Disk`] can dispatch over.
///
/// Backup containers (VBK, VMA) hold many files/devices rather than one
/// disk; open those through [`vbk::VBK`] and [`vma::VMA`] directly.
pub enum DiskFormat {
    QCOW2 {
        image: QCOW2,
        description: String,
    },
    VHDX {
        image: VHDX,
        description: String,
    },
    VHD {
        image: VHD,
        description: String,
    },
    VDI {
        image: VDI,
        description: String,
    },
    VMDK {
        image: VMDK,
        description: String,
    },
    HDD {
        image: StorageStream,
        description: String,
    },
    ASIF {
        image: ASIF,
        description: String,
    },
    RAW {
        image: File,
        size: u64,
        description: String,
    },
}

/// A virtual disk of any supported format, opened from a path.
pub struct Disk {
    pub path: String,
    pub format: DiskFormat,
}

impl std::fmt::Debug for DiskFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DiskFormat::QCOW2 { .. } => "QCOW2",
            DiskFormat::VHDX { .. } => "VHDX",
            DiskFormat::VHD { .. } => "VHD",
            DiskFormat::VDI { .. } => "VDI",
            DiskFormat::VMDK { .. } => "VMDK",
            DiskFormat::HDD { .. } => "HDD",
            DiskFormat::ASIF { .. } => "ASIF",
            DiskFormat::RAW { .. } => "RAW",
        };
        f.debug_tuple(name).finish()
    }
}

impl std::fmt::Debug for Disk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Disk")
            .field("path", &self.path)
            .field("format", &self.format)
            .finish()
    }
}

impl Disk {
    /// Open a disk image given a file path and a format name.
    /// If the format string is "auto", the image format is detected from
    /// its signatures.
    pub fn new(file_path: String, format: &str) -> Result<Disk> {
        let path = Path::new(&file_path);

        let format = match format {
            "auto" => Self::detect_format(path)?,
            "qcow2" => DiskFormat::QCOW2 {
                image: QCOW2::open(path)?,
                description: "QCOW2 (QEMU Copy-On-Write) image".to_string(),
            },
            "vhdx" => DiskFormat::VHDX {
                image: VHDX::open(path)?,
                description: "VHDX (Hyper-V Virtual Hard Disk) image".to_string(),
            },
            "vhd" => DiskFormat::VHD {
                image: VHD::open(path)?,
                description: "VHD (Virtual PC Hard Disk) image".to_string(),
            },
            "vdi" => DiskFormat::VDI {
                image: VDI::open(path)?,
                description: "VDI (VirtualBox Disk Image) file".to_string(),
            },
            "vmdk" => DiskFormat::VMDK {
                image: VMDK::open(path)?,
                description: "VMDK (Virtual Machine Disk) file".to_string(),
            },
            "hdd" => {
                let hdd = HDD::open(path)?;
                DiskFormat::HDD {
                    image: hdd.open_stream(None)?,
                    description: "Parallels HDD image".to_string(),
                }
            }
            "asif" => DiskFormat::ASIF {
                image: ASIF::open(path)?,
                description: "ASIF (Apple Sparse Image Format) image".to_string(),
            },
            "raw" => {
                let mut image = File::open(path).map_err(|e| Error::io(e, path))?;
                let size = image.seek(SeekFrom::End(0))?;
                image.seek(SeekFrom::Start(0))?;
                DiskFormat::RAW {
                    image,
                    size,
                    description: "Raw image format".to_string(),
                }
            }
            other => {
                return Err(Error::unsupported(format!(
                    "invalid format '{}'; supported formats are \
                     'qcow2', 'vhdx', 'vhd', 'vdi', 'vmdk', 'hdd', 'asif', 'raw' or 'auto'",
                    other
                )))
            }
        };

        Ok(Disk {
            path: file_path,
            format,
        })
    }

    /// Detect the image format from its on-disk signatures.
    fn detect_format(path: &Path) -> Result<DiskFormat> {
        // A Parallels HDD is a directory with a DiskDescriptor.xml.
        if path.is_dir() || path.join("DiskDescriptor.xml").exists() {
            debug!("detected a Parallels HDD directory");
            let hdd = HDD::open(path)?;
            return Ok(DiskFormat::HDD {
                image: hdd.open_stream(None)?,
                description: "Parallels HDD image".to_string(),
            });
        }

        let mut file = File::open(path).map_err(|e| Error::io(e, path))?;
        let mut head = [0u8; 68];
        let n = file.read(&mut head).map_err(|e| Error::io(e, path))?;
        let head = &head[..n];

        if head.len() >= 4 && head[0..4] == [0x51, 0x46, 0x49, 0xFB] {
            info!("detected a QCOW2 disk image");
            return Ok(DiskFormat::QCOW2 {
                image: QCOW2::open(path)?,
                description: "QCOW2 (QEMU Copy-On-Write) image".to_string(),
            });
        }

        if head.len() >= 8 && &head[0..8] == b"vhdxfile" {
            info!("detected a VHDX disk image");
            return Ok(DiskFormat::VHDX {
                image: VHDX::open(path)?,
                description: "VHDX (Hyper-V Virtual Hard Disk) image".to_string(),
            });
        }

        if head.len() >= 4
            && (&head[0..4] == b"KDMV"
                || &head[0..4] == b"COWD"
                || head[0..4] == 0xCAFEBABEu32.to_le_bytes()
                || &head[0..4] == b"# Di")
        {
            info!("detected a VMDK disk image");
            return Ok(DiskFormat::VMDK {
                image: VMDK::open(path)?,
                description: "VMDK (Virtual Machine Disk) file".to_string(),
            });
        }

        if head.len() >= 4 && head[0..4] == 0x73686477u32.to_be_bytes() {
            info!("detected an ASIF disk image");
            return Ok(DiskFormat::ASIF {
                image: ASIF::open(path)?,
                description: "ASIF (Apple Sparse Image Format) image".to_string(),
            });
        }

        if head.len() >= 68 && head[64..68] == 0xBEDA107Fu32.to_le_bytes() {
            info!("detected a VDI disk image");
            return Ok(DiskFormat::VDI {
                image: VDI::open(path)?,
                description: "VDI (VirtualBox Disk Image) file".to_string(),
            });
        }

        if head.len() >= 16
            && (&head[0..16] == b"WithoutFreeSpace" || &head[0..16] == b"WithouFreSpacExt")
        {
            info!("detected a Parallels HDS expanding image");
            let hds = hdd::HDS::open(path)?;
            let storage = hdd::Storage {
                start: 0,
                end: hds.size() / 512,
                images: Vec::new(),
            };
            return Ok(DiskFormat::HDD {
                image: StorageStream::new(vec![(storage, Box::new(hds) as Box<dyn ReadSeek>)])?,
                description: "Parallels HDS expanding image".to_string(),
            });
        }

        // VHD keeps its signature in a footer at the end of the file.
        let end = file.seek(SeekFrom::End(0)).map_err(|e| Error::io(e, path))?;
        if end >= 512 {
            let mut cookie = [0u8; 8];
            file.seek(SeekFrom::End(-512)).map_err(|e| Error::io(e, path))?;
            if file.read(&mut cookie).unwrap_or(0) == 8 && &cookie == b"conectix" {
                info!("detected a VHD disk image");
                return Ok(DiskFormat::VHD {
                    image: VHD::open(path)?,
                    description: "VHD (Virtual PC Hard Disk) image".to_string(),
                });
            }
        }

        info!("no known signature, treating as raw data");
        let size = end;
        file.seek(SeekFrom::Start(0)).map_err(|e| Error::io(e, path))?;
        Ok(DiskFormat::RAW {
            image: file,
            size,
            description: "Raw image format".to_string(),
        })
    }

    /// The logical (guest-visible) size of the disk in bytes.
    pub fn size(&self) -> u64 {
        match &self.format {
            DiskFormat::QCOW2 { image, .. } => image.size(),
            DiskFormat::VHDX { image, .. } => image.size(),
            DiskFormat::VHD { image, .. } => image.size(),
            DiskFormat::VDI { image, .. } => image.size(),
            DiskFormat::VMDK { image, .. } => image.size(),
            DiskFormat::HDD { image, .. } => image.size(),
            DiskFormat::ASIF { image, .. } => image.size(),
            DiskFormat::RAW { size, .. } => *size,
        }
    }

    /// Returns a reference to the format description.
    pub fn format_description(&self) -> &str {
        match &self.format {
            DiskFormat::QCOW2 { description, .. } => description,
            DiskFormat::VHDX { description, .. } => description,
            DiskFormat::VHD { description, .. } => description,
            DiskFormat::VDI { description, .. } => description,
            DiskFormat::VMDK { description, .. } => description,
            DiskFormat::HDD { description, .. } => description,
            DiskFormat::ASIF { description, .. } => description,
            DiskFormat::RAW { description, .. } => description,
        }
    }

    pub fn print_info(&self) {
        info!("Evidence : {}", self.path);
        match &self.format {
            DiskFormat::QCOW2 { image, .. } => image.print_info(),
            DiskFormat::VHDX { image, .. } => image.print_info(),
            DiskFormat::VHD { image, .. } => image.print_info(),
            DiskFormat::VDI { image, .. } => image.print_info(),
            DiskFormat::VMDK { image, .. } => image.print_info(),
            DiskFormat::HDD { .. } => (),
            DiskFormat::ASIF { image, .. } => image.print_info(),
            DiskFormat::RAW { .. } => (),
        }
    }
}

impl Read for Disk {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.format {
            DiskFormat::QCOW2 { image, .. } => image.read(buf),
            DiskFormat::VHDX { image, .. } => image.read(buf),
            DiskFormat::VHD { image, .. } => image.read(buf),
            DiskFormat::VDI { image, .. } => image.read(buf),
            DiskFormat::VMDK { image, .. } => image.read(buf),
            DiskFormat::HDD { image, .. } => image.read(buf),
            DiskFormat::ASIF { image, .. } => image.read(buf),
            DiskFormat::RAW { image, .. } => image.read(buf),
        }
    }
}

impl Seek for Disk {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match &mut self.format {
            DiskFormat::QCOW2 { image, .. } => image.seek(pos),
            DiskFormat::VHDX { image, .. } => image.seek(pos),
            DiskFormat::VHD { image, .. } => image.seek(pos),
            DiskFormat::VDI { image, .. } => image.seek(pos),
            DiskFormat::VMDK { image, .. } => image.seek(pos),
            DiskFormat::HDD { image, .. } => image.seek(pos),
            DiskFormat::ASIF { image, .. } => image.seek(pos),
            DiskFormat::RAW { image, .. } => image.seek(pos),
        }
    }
}

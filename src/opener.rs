//! Locating and opening the sibling files an image may depend on: parent
//! disks, external data files and descriptor-listed extents.

use std::fs::File;
use std::path::{Path, PathBuf};

use log::debug;

use crate::errors::{Error, Result};
use crate::stream::ReadSeek;

/// Opens sibling files on behalf of a format reader.
///
/// Formats never touch the filesystem directly for dependencies; they go
/// through this trait so callers can redirect lookups (evidence mounted
/// elsewhere, archives, in-memory corpora).
pub trait FileOpener {
    fn open(&self, path: &Path) -> Result<Box<dyn ReadSeek>>;
}

/// The default opener: plain filesystem access.
pub struct FsOpener;

impl FileOpener for FsOpener {
    fn open(&self, path: &Path) -> Result<Box<dyn ReadSeek>> {
        debug!("opening dependency: {}", path.display());
        let file = File::open(path).map_err(|e| Error::io(e, path))?;
        Ok(Box::new(file))
    }
}

/// Resolve a possibly-moved absolute image path against the directory the
/// referencing descriptor lives in.
///
/// Images copied off their original host keep absolute paths that no
/// longer exist. Try, in order: the path as given; its basename in the
/// descriptor directory; the same basename under a sibling directory of
/// the same name; the two trailing path components under the grandparent
/// directory (linked clones).
pub fn resolve_image_path(root: &Path, path: &Path) -> PathBuf {
    if !path.is_absolute() {
        return root.join(path);
    }
    if path.exists() {
        return path.to_path_buf();
    }

    let filename = match path.file_name() {
        Some(name) => name,
        None => return path.to_path_buf(),
    };

    let candidate = root.join(filename);
    if candidate.exists() {
        return candidate;
    }

    if let (Some(parent_dir), Some(parent_name)) = (root.parent(), path.parent().and_then(Path::file_name)) {
        let candidate = parent_dir.join(parent_name).join(filename);
        if candidate.exists() {
            return candidate;
        }

        if let (Some(grandparent_dir), Some(grandparent_name)) = (
            parent_dir.parent(),
            path.parent().and_then(Path::parent).and_then(Path::file_name),
        ) {
            let candidate = grandparent_dir
                .join(grandparent_name)
                .join(parent_name)
                .join(filename);
            if candidate.exists() {
                return candidate;
            }
        }
    }

    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_paths_resolve_against_root() {
        let resolved = resolve_image_path(Path::new("/vm/disk.hdd"), Path::new("image.hds"));
        assert_eq!(resolved, PathBuf::from("/vm/disk.hdd/image.hds"));
    }

    #[test]
    fn test_moved_absolute_path_falls_back_to_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("copy.hdd");
        std::fs::create_dir(&root).unwrap();
        std::fs::write(root.join("image.hds"), b"x").unwrap();

        let resolved = resolve_image_path(&root, Path::new("/gone/original.hdd/image.hds"));
        assert_eq!(resolved, root.join("image.hds"));
    }

    #[test]
    fn test_missing_everywhere_returns_original() {
        let dir = tempfile::tempdir().unwrap();
        let original = Path::new("/gone/original.hdd/image.hds");
        let resolved = resolve_image_path(dir.path(), original);
        assert_eq!(resolved, original);
    }

    #[test]
    fn test_fs_opener_missing_file() {
        let err = FsOpener.open(Path::new("/nonexistent/file.img")).unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
    }
}

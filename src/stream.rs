//! Aligned stream plumbing shared by every format reader.
//!
//! Each format resolves reads in whole allocation units (clusters, grains,
//! blocks). The helpers here convert arbitrary `Read`/`Seek` traffic into
//! aligned requests against the format's `read_aligned` implementation, and
//! take care of EOF clamping and position bookkeeping so the formats do not
//! have to.

use std::io::{self, Read, Seek, SeekFrom};

use crate::errors::Result;

/// A byte source. Anything that can `Read` and `Seek` qualifies, including
/// every opened image stream in this crate, so parent chains compose freely.
pub trait ReadSeek: Read + Seek {}

impl<T: Read + Seek + ?Sized> ReadSeek for T {}

impl std::fmt::Debug for dyn ReadSeek {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn ReadSeek").finish()
    }
}

/// Implemented by every format reader. `read_aligned` receives offsets and
/// lengths that are multiples of `align` (except possibly past the end of
/// the image, where a short return is fine).
pub(crate) trait AlignedImage {
    fn size(&self) -> u64;
    fn align(&self) -> u64;
    fn position(&self) -> u64;
    fn set_position(&mut self, pos: u64);
    fn read_aligned(&mut self, offset: u64, length: usize) -> Result<Vec<u8>>;
}

/// Serve a `Read::read` call for an aligned image.
///
/// Reads past the image size return the truncated prefix; the position is
/// clamped to the image size afterwards.
pub(crate) fn read_from<I: AlignedImage>(image: &mut I, buf: &mut [u8]) -> io::Result<usize> {
    let size = image.size();
    let pos = image.position();
    if pos >= size || buf.is_empty() {
        return Ok(0);
    }

    let wanted = (buf.len() as u64).min(size - pos) as usize;
    let align = image.align().max(1);
    let start = pos - pos % align;
    let shift = (pos - start) as usize;
    let end = pos + wanted as u64;
    let aligned_end = end.div_ceil(align) * align;
    let aligned_length = (aligned_end - start) as usize;

    let data = image.read_aligned(start, aligned_length).map_err(io::Error::from)?;

    let available = data.len().saturating_sub(shift).min(wanted);
    buf[..available].copy_from_slice(&data[shift..shift + available]);
    image.set_position(pos + available as u64);
    Ok(available)
}

/// Serve a `Seek::seek` call for an aligned image.
///
/// Seeking beyond the image size is legal; subsequent reads return nothing.
/// Seeking before offset 0 is an error.
pub(crate) fn seek_to<I: AlignedImage>(image: &mut I, pos: SeekFrom) -> io::Result<u64> {
    let new_pos = match pos {
        SeekFrom::Start(offset) => Some(offset),
        SeekFrom::Current(offset) => image.position().checked_add_signed(offset),
        SeekFrom::End(offset) => image.size().checked_add_signed(offset),
    };

    match new_pos {
        Some(offset) => {
            image.set_position(offset);
            Ok(offset)
        }
        None => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "invalid seek to a negative position",
        )),
    }
}

/// A fixed sub-range view over another stream.
///
/// Used wherever a format maps a logical range onto a window of a larger
/// file (raw flat extents, plain storage images).
pub struct SliceStream<R> {
    inner: R,
    start: u64,
    length: u64,
    pos: u64,
}

impl<R: ReadSeek> SliceStream<R> {
    pub fn new(inner: R, start: u64, length: u64) -> Self {
        Self {
            inner,
            start,
            length,
            pos: 0,
        }
    }

    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }
}

impl<R: ReadSeek> Read for SliceStream<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.length {
            return Ok(0);
        }
        let max = (buf.len() as u64).min(self.length - self.pos) as usize;
        self.inner.seek(SeekFrom::Start(self.start + self.pos))?;
        let n = self.inner.read(&mut buf[..max])?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl<R: ReadSeek> Seek for SliceStream<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(offset) => self.pos.checked_add_signed(offset),
            SeekFrom::End(offset) => self.length.checked_add_signed(offset),
        };

        match new_pos {
            Some(offset) => {
                self.pos = offset;
                Ok(offset)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "invalid seek to a negative position",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// A trivial aligned image over an in-memory buffer with a 4-byte unit.
    struct TestImage {
        data: Vec<u8>,
        pos: u64,
    }

    impl AlignedImage for TestImage {
        fn size(&self) -> u64 {
            self.data.len() as u64
        }

        fn align(&self) -> u64 {
            4
        }

        fn position(&self) -> u64 {
            self.pos
        }

        fn set_position(&mut self, pos: u64) {
            self.pos = pos;
        }

        fn read_aligned(&mut self, offset: u64, length: usize) -> Result<Vec<u8>> {
            assert_eq!(offset % 4, 0);
            assert_eq!(length % 4, 0);
            let start = offset as usize;
            let end = (start + length).min(self.data.len());
            Ok(self.data[start.min(self.data.len())..end].to_vec())
        }
    }

    fn test_image() -> TestImage {
        TestImage {
            data: (0u8..=15).collect(),
            pos: 0,
        }
    }

    #[test]
    fn test_unaligned_read() {
        let mut image = test_image();
        image.set_position(3);
        let mut buf = [0u8; 6];
        assert_eq!(read_from(&mut image, &mut buf).unwrap(), 6);
        assert_eq!(buf, [3, 4, 5, 6, 7, 8]);
        assert_eq!(image.position(), 9);
    }

    #[test]
    fn test_read_past_end_truncates() {
        let mut image = test_image();
        image.set_position(14);
        let mut buf = [0u8; 8];
        assert_eq!(read_from(&mut image, &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], &[14, 15]);
        assert_eq!(image.position(), 16);
        assert_eq!(read_from(&mut image, &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_seek_beyond_end_is_legal() {
        let mut image = test_image();
        assert_eq!(seek_to(&mut image, SeekFrom::Start(100)).unwrap(), 100);
        let mut buf = [0u8; 4];
        assert_eq!(read_from(&mut image, &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_seek_negative_fails() {
        let mut image = test_image();
        assert!(seek_to(&mut image, SeekFrom::End(-32)).is_err());
        assert_eq!(seek_to(&mut image, SeekFrom::End(-4)).unwrap(), 12);
    }

    #[test]
    fn test_slice_stream() {
        let inner = Cursor::new((0u8..32).collect::<Vec<_>>());
        let mut slice = SliceStream::new(inner, 8, 8);
        let mut buf = [0u8; 16];
        assert_eq!(slice.read(&mut buf).unwrap(), 8);
        assert_eq!(&buf[..8], &[8, 9, 10, 11, 12, 13, 14, 15]);

        slice.seek(SeekFrom::Start(4)).unwrap();
        assert_eq!(slice.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], &[12, 13, 14, 15]);
    }
}

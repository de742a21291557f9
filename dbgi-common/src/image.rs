//! Bounds-checked access to binary images.
//!
//! See the [`Image`] struct for more documentation.

use std::borrow::Cow;
use std::fmt;
use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::Arc;

use memmap2::Mmap;
use parking_lot::Mutex;
use thiserror::Error;

use crate::cursor::OutOfRange;

/// An error returned when reading from an [`Image`] fails.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ImageError {
    /// The requested range lies outside of the image.
    #[error(transparent)]
    OutOfRange(#[from] OutOfRange),

    /// The backing file or transport failed.
    #[error("failed to read image")]
    Io(#[from] io::Error),

    /// A remote source stopped delivering data before the request was satisfied.
    #[error("remote image returned no data at offset {0:#x}")]
    Truncated(u64),
}

/// A source of byte ranges served by a remote agent.
///
/// Implementations are free to return fewer bytes than requested, which allows them to tolerate
/// high-latency partial transfers. Returning `Ok(0)` for a non-empty buffer signals that no more
/// data is available at that offset.
pub trait RangeSource: Send {
    /// The total size of the remote image in bytes.
    fn size(&self) -> u64;

    /// Reads at most `buf.len()` bytes starting at `offset` into `buf`.
    fn read_some(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;
}

/// The owner of data behind an [`Image`].
enum ImageBacking<'a> {
    Buf(Cow<'a, [u8]>),
    Mmap(Mmap),
    Remote(Mutex<Box<dyn RangeSource>>),
}

impl ImageBacking<'_> {
    fn local(&self) -> Option<&[u8]> {
        match self {
            ImageBacking::Buf(buf) => Some(buf),
            ImageBacking::Mmap(mmap) => Some(mmap),
            ImageBacking::Remote(_) => None,
        }
    }
}

impl fmt::Debug for ImageBacking<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageBacking::Buf(buf) => f.debug_tuple("Buf").field(&buf.len()).finish(),
            ImageBacking::Mmap(mmap) => f.debug_tuple("Mmap").field(&mmap.len()).finish(),
            ImageBacking::Remote(_) => f.debug_tuple("Remote").finish(),
        }
    }
}

/// An immutable, byte-addressable binary blob of known size.
///
/// An `Image` is either backed by local memory (a borrowed or owned buffer, or a memory mapped
/// file), or by a [`RangeSource`] that serves byte ranges on demand. All reads are checked against
/// the image size and fail with [`OutOfRange`] instead of reading adjacent memory.
///
/// Cloning an image is cheap and shares the backing.
///
/// # Example
///
/// ```
/// use std::io::Write;
/// use dbgi_common::Image;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let mut file = tempfile::tempfile()?;
///     file.write_all(b"1234")?;
///
///     let image = Image::map_file(file)?;
///     assert_eq!(&*image.read(1, 2)?, b"23");
///     assert!(image.read(3, 2).is_err());
///     Ok(())
/// }
/// ```
#[derive(Clone, Debug)]
pub struct Image<'a> {
    backing: Arc<ImageBacking<'a>>,
    size: u64,
}

impl<'a> Image<'a> {
    fn with_backing(backing: ImageBacking<'a>, size: u64) -> Self {
        Image {
            backing: Arc::new(backing),
            size,
        }
    }

    /// Constructs an `Image` from a `Cow`.
    pub fn from_cow(cow: Cow<'a, [u8]>) -> Self {
        let size = cow.len() as u64;
        Image::with_backing(ImageBacking::Buf(cow), size)
    }

    /// Constructs an `Image` from a byte slice.
    pub fn from_slice(buffer: &'a [u8]) -> Self {
        Image::from_cow(Cow::Borrowed(buffer))
    }

    /// Constructs an `Image` from a vector of bytes.
    pub fn from_vec(buffer: Vec<u8>) -> Self {
        Image::from_cow(Cow::Owned(buffer))
    }

    /// Constructs an `Image` from an open file handle by memory mapping the file.
    pub fn map_file(file: File) -> Result<Self, io::Error> {
        Self::map_file_ref(&file)
    }

    /// Constructs an `Image` from an open file handle by memory mapping the file.
    ///
    /// Pages are only faulted in once they are read, so opening a large file is cheap.
    pub fn map_file_ref(file: &File) -> Result<Self, io::Error> {
        match unsafe { Mmap::map(file) } {
            Ok(mmap) => {
                let size = mmap.len() as u64;
                Ok(Image::with_backing(ImageBacking::Mmap(mmap), size))
            }
            // this is raised on empty mmaps which we want to ignore
            Err(err) if err.kind() == io::ErrorKind::InvalidInput => {
                Ok(Image::from_slice(b""))
            }
            Err(err) => Err(err),
        }
    }

    /// Constructs an `Image` from a file path by memory mapping the file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, io::Error> {
        let file = File::open(path)?;
        Self::map_file(file)
    }

    /// Constructs an `Image` by consuming an entire reader into an internal buffer.
    pub fn from_reader<R: io::Read>(mut reader: R) -> Result<Self, io::Error> {
        let mut buffer = vec![];
        reader.read_to_end(&mut buffer)?;
        Ok(Image::from_vec(buffer))
    }

    /// Constructs an `Image` whose bytes are fetched on demand from a remote source.
    pub fn remote<S>(source: S) -> Self
    where
        S: RangeSource + 'static,
    {
        let size = source.size();
        let source: Box<dyn RangeSource> = Box::new(source);
        Image::with_backing(ImageBacking::Remote(Mutex::new(source)), size)
    }

    /// The total size of the image in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Returns `true` if the image is served by a remote source.
    pub fn is_remote(&self) -> bool {
        matches!(*self.backing, ImageBacking::Remote(_))
    }

    /// Returns `true` if `len` bytes starting at `offset` lie within the image.
    pub fn valid(&self, offset: u64, len: u64) -> bool {
        offset
            .checked_add(len)
            .map_or(false, |end| end <= self.size)
    }

    fn check(&self, offset: u64, len: u64) -> Result<(), OutOfRange> {
        if self.valid(offset, len) {
            Ok(())
        } else {
            Err(OutOfRange {
                offset,
                len,
                size: self.size,
            })
        }
    }

    /// Reads exactly `len` bytes starting at `offset`.
    ///
    /// Local images return a borrowed slice. Remote images issue as many partial reads as needed
    /// and return an owned buffer.
    pub fn read(&self, offset: u64, len: u64) -> Result<Cow<'_, [u8]>, ImageError> {
        self.check(offset, len)?;

        if let Some(data) = self.backing.local() {
            // `check` guarantees that both bounds fit into the buffer
            let start = offset as usize;
            return Ok(Cow::Borrowed(&data[start..start + len as usize]));
        }

        let mut buffer = vec![0; len as usize];
        let mut filled = 0;
        while filled < buffer.len() {
            let read = self.read_some(offset + filled as u64, &mut buffer[filled..])?;
            if read == 0 {
                return Err(ImageError::Truncated(offset + filled as u64));
            }
            filled += read;
        }

        Ok(Cow::Owned(buffer))
    }

    /// Reads up to `buf.len()` bytes starting at `offset`, returning the number of bytes read.
    ///
    /// Local images always fill the buffer as far as the image extends. Remote images may return
    /// fewer bytes.
    pub fn read_some(&self, offset: u64, buf: &mut [u8]) -> Result<usize, ImageError> {
        self.check(offset, 0)?;
        let available = (self.size - offset).min(buf.len() as u64) as usize;
        let buf = &mut buf[..available];

        match &*self.backing {
            ImageBacking::Remote(source) => {
                let read = source.lock().read_some(offset, buf)?;
                Ok(read.min(available))
            }
            backing => {
                let data = backing.local().unwrap_or_default();
                let start = offset as usize;
                buf.copy_from_slice(&data[start..start + available]);
                Ok(available)
            }
        }
    }

    /// Returns the entire image as a slice if it is backed by local memory.
    pub fn as_local(&self) -> Option<&[u8]> {
        self.backing.local()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;

    use similar_asserts::assert_eq;
    use tempfile::NamedTempFile;

    /// Serves at most `chunk` bytes per request.
    struct ChunkedSource {
        data: Vec<u8>,
        chunk: usize,
    }

    impl RangeSource for ChunkedSource {
        fn size(&self) -> u64 {
            self.data.len() as u64
        }

        fn read_some(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
            let start = offset as usize;
            let len = buf.len().min(self.chunk).min(self.data.len() - start);
            buf[..len].copy_from_slice(&self.data[start..start + len]);
            Ok(len)
        }
    }

    /// Claims a size it cannot deliver.
    struct LyingSource;

    impl RangeSource for LyingSource {
        fn size(&self) -> u64 {
            16
        }

        fn read_some(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
            if offset >= 4 {
                return Ok(0);
            }
            let len = buf.len().min(4 - offset as usize);
            buf[..len].fill(0xaa);
            Ok(len)
        }
    }

    #[test]
    fn test_open_empty_file() -> Result<(), Box<dyn std::error::Error>> {
        let tmp = NamedTempFile::new()?;

        let image = Image::open(tmp.path())?;
        assert_eq!(image.size(), 0);
        assert!(image.valid(0, 0));
        assert!(!image.valid(0, 1));

        Ok(())
    }

    #[test]
    fn test_open_file() -> Result<(), Box<dyn std::error::Error>> {
        let mut tmp = NamedTempFile::new()?;
        tmp.write_all(b"1234")?;

        let image = Image::open(tmp.path())?;
        assert_eq!(&*image.read(0, 4)?, b"1234");
        assert!(!image.is_remote());

        Ok(())
    }

    #[test]
    fn test_read_out_of_range() {
        let image = Image::from_slice(b"1234");

        let err = image.read(2, 3).unwrap_err();
        assert!(matches!(
            err,
            ImageError::OutOfRange(OutOfRange {
                offset: 2,
                len: 3,
                size: 4
            })
        ));

        // overflowing ranges never wrap around
        assert!(!image.valid(u64::MAX, 2));
        assert!(image.read(u64::MAX, 2).is_err());
    }

    #[test]
    fn test_remote_short_reads() -> Result<(), ImageError> {
        let source = ChunkedSource {
            data: (0u8..32).collect(),
            chunk: 3,
        };
        let image = Image::remote(source);

        assert!(image.is_remote());
        assert_eq!(image.size(), 32);
        assert_eq!(&*image.read(5, 10)?, &(5u8..15).collect::<Vec<_>>()[..]);

        let mut buf = [0; 8];
        assert_eq!(image.read_some(30, &mut buf)?, 2);
        assert_eq!(&buf[..2], &[30, 31]);

        Ok(())
    }

    #[test]
    fn test_remote_truncated() {
        let image = Image::remote(LyingSource);
        assert!(image.read(0, 4).is_ok());
        assert!(matches!(image.read(2, 8), Err(ImageError::Truncated(4))));
    }

    #[test]
    fn test_read_some_local() -> Result<(), ImageError> {
        let image = Image::from_vec(b"abcdef".to_vec());
        let mut buf = [0; 4];

        assert_eq!(image.read_some(4, &mut buf)?, 2);
        assert_eq!(&buf[..2], b"ef");
        assert_eq!(image.read_some(6, &mut buf)?, 0);
        assert!(image.read_some(7, &mut buf).is_err());

        Ok(())
    }
}

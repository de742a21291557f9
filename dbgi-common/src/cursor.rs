//! Step-wise, bounds-checked readers over sections of an image.

use std::fmt;

use scroll::{Endian, Pread};
use thiserror::Error;

/// A read extending past the end of the data it was issued against.
///
/// This is the only way a [`Cursor`] read can fail. Whether it is fatal or recoverable is up to
/// the caller.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("read of {len} bytes at offset {offset:#x} exceeds size {size:#x}")]
pub struct OutOfRange {
    /// Offset of the attempted read.
    pub offset: u64,
    /// Length of the attempted read.
    pub len: u64,
    /// The size of the data that was read from.
    pub size: u64,
}

/// The format of a DWARF unit or entry, given by its initial length.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Format {
    /// 32-bit offsets and lengths.
    Dwarf32,
    /// 64-bit offsets and lengths, escaped by an initial length of `0xffff_ffff`.
    Dwarf64,
}

impl Format {
    /// The size of section offsets in this format.
    pub fn offset_size(self) -> u8 {
        match self {
            Format::Dwarf32 => 4,
            Format::Dwarf64 => 8,
        }
    }
}

/// The raw bytes of one section located in an image.
///
/// Besides the data, a section knows its name for diagnostics, the address at which its first byte
/// is loaded (used for PC-relative encodings), and the byte order of the target.
#[derive(Clone, Copy)]
pub struct Section<'a> {
    name: &'static str,
    data: &'a [u8],
    address: u64,
    endian: Endian,
}

impl<'a> Section<'a> {
    /// Creates a section over `data`.
    pub fn new(name: &'static str, data: &'a [u8], endian: Endian) -> Self {
        Section {
            name,
            data,
            address: 0,
            endian,
        }
    }

    /// Creates a section that does not contain any data.
    pub fn empty(name: &'static str, endian: Endian) -> Self {
        Section::new(name, &[], endian)
    }

    /// Sets the address of the first byte of this section.
    pub fn with_address(mut self, address: u64) -> Self {
        self.address = address;
        self
    }

    /// The name of this section, for instance `".debug_info"`.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The raw data of this section.
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    /// The address of the first byte of this section.
    pub fn address(&self) -> u64 {
        self.address
    }

    /// The byte order of this section.
    pub fn endian(&self) -> Endian {
        self.endian
    }

    /// The size of this section in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the section does not contain data.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns a cursor at the start of this section.
    pub fn cursor(&self) -> Cursor<'a> {
        Cursor::new(self.data, self.endian)
    }

    /// Returns a cursor positioned at `offset`.
    pub fn cursor_at(&self, offset: u64) -> Result<Cursor<'a>, OutOfRange> {
        let mut cursor = self.cursor();
        cursor.seek(offset)?;
        Ok(cursor)
    }

    /// Reads a NUL-terminated string at `offset`, as used by string sections.
    pub fn cstr_at(&self, offset: u64) -> Result<&'a [u8], OutOfRange> {
        self.cursor_at(offset)?.read_cstr()
    }
}

impl fmt::Debug for Section<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Section")
            .field("name", &self.name)
            .field("address", &format_args!("{:#x}", self.address))
            .field("len", &format_args!("{:#x}", self.data.len()))
            .finish()
    }
}

/// A cheap, copyable position within a byte range.
///
/// All reads are checked against the end of the range. The "step" reads (`read_*`) decode a value
/// and advance the cursor by its encoded width. Positions are always relative to the start of the
/// outermost data, even for cursors obtained through [`split`](Self::split), so they can be used
/// verbatim in diagnostics.
#[derive(Clone, Copy, Debug)]
pub struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
    end: usize,
    endian: Endian,
}

macro_rules! read_fixed {
    ($(#[$attr:meta])* $name:ident, $ty:ty) => {
        $(#[$attr])*
        pub fn $name(&mut self) -> Result<$ty, OutOfRange> {
            const SIZE: usize = std::mem::size_of::<$ty>();
            self.check(SIZE)?;
            let value = self
                .data
                .pread_with::<$ty>(self.pos, self.endian)
                .map_err(|_| self.out_of_range(SIZE as u64))?;
            self.pos += SIZE;
            Ok(value)
        }
    };
}

impl<'a> Cursor<'a> {
    /// Creates a cursor at the start of `data`.
    pub fn new(data: &'a [u8], endian: Endian) -> Self {
        Cursor {
            data,
            pos: 0,
            end: data.len(),
            endian,
        }
    }

    /// The current position of this cursor.
    pub fn position(&self) -> u64 {
        self.pos as u64
    }

    /// The position one past the last readable byte.
    pub fn end(&self) -> u64 {
        self.end as u64
    }

    /// The number of bytes left to read.
    pub fn remaining(&self) -> usize {
        self.end.saturating_sub(self.pos)
    }

    /// Returns `true` if there is nothing left to read.
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// The byte order used for fixed-width reads.
    pub fn endian(&self) -> Endian {
        self.endian
    }

    /// Returns `true` if `len` more bytes can be read.
    pub fn valid(&self, len: u64) -> bool {
        len <= self.remaining() as u64
    }

    fn out_of_range(&self, len: u64) -> OutOfRange {
        OutOfRange {
            offset: self.pos as u64,
            len,
            size: self.end as u64,
        }
    }

    fn check(&self, len: usize) -> Result<(), OutOfRange> {
        if len <= self.remaining() {
            Ok(())
        } else {
            Err(self.out_of_range(len as u64))
        }
    }

    fn check_len(&self, len: u64) -> Result<usize, OutOfRange> {
        match usize::try_from(len) {
            Ok(len) if len <= self.remaining() => Ok(len),
            _ => Err(self.out_of_range(len)),
        }
    }

    /// Moves the cursor to an absolute position within its range.
    pub fn seek(&mut self, position: u64) -> Result<(), OutOfRange> {
        match usize::try_from(position) {
            Ok(pos) if pos <= self.end => {
                self.pos = pos;
                Ok(())
            }
            _ => Err(OutOfRange {
                offset: position,
                len: 0,
                size: self.end as u64,
            }),
        }
    }

    /// Advances the cursor by `len` bytes.
    pub fn skip(&mut self, len: u64) -> Result<(), OutOfRange> {
        let len = self.check_len(len)?;
        self.pos += len;
        Ok(())
    }

    /// Splits off the next `len` bytes into a separate cursor and advances past them.
    pub fn split(&mut self, len: u64) -> Result<Cursor<'a>, OutOfRange> {
        let len = self.check_len(len)?;
        let sub = Cursor {
            data: self.data,
            pos: self.pos,
            end: self.pos + len,
            endian: self.endian,
        };
        self.pos += len;
        Ok(sub)
    }

    /// Returns a copy of this cursor that ends at the absolute position `end`.
    pub fn truncated(&self, end: u64) -> Result<Cursor<'a>, OutOfRange> {
        let len = end
            .checked_sub(self.pos as u64)
            .ok_or_else(|| self.out_of_range(0))?;
        let mut copy = *self;
        copy.split(len)
    }

    /// Returns the next byte without advancing.
    pub fn peek_u8(&self) -> Result<u8, OutOfRange> {
        self.check(1)?;
        Ok(self.data[self.pos])
    }

    /// Reads a run of `len` bytes.
    pub fn read_bytes(&mut self, len: u64) -> Result<&'a [u8], OutOfRange> {
        let len = self.check_len(len)?;
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    /// Copies bytes into `buf`, filling it completely.
    pub fn copy_to(&mut self, buf: &mut [u8]) -> Result<(), OutOfRange> {
        let bytes = self.read_bytes(buf.len() as u64)?;
        buf.copy_from_slice(bytes);
        Ok(())
    }

    read_fixed!(
        /// Reads an unsigned byte.
        read_u8,
        u8
    );
    read_fixed!(
        /// Reads a signed byte.
        read_i8,
        i8
    );
    read_fixed!(
        /// Reads an unsigned 16-bit integer.
        read_u16,
        u16
    );
    read_fixed!(
        /// Reads a signed 16-bit integer.
        read_i16,
        i16
    );
    read_fixed!(
        /// Reads an unsigned 32-bit integer.
        read_u32,
        u32
    );
    read_fixed!(
        /// Reads a signed 32-bit integer.
        read_i32,
        i32
    );
    read_fixed!(
        /// Reads an unsigned 64-bit integer.
        read_u64,
        u64
    );
    read_fixed!(
        /// Reads a signed 64-bit integer.
        read_i64,
        i64
    );

    /// Reads an unsigned integer of `size` bytes, for instance a target address.
    ///
    /// Sizes above 8 bytes read the full width but only retain the low 64 bits.
    pub fn read_uint(&mut self, size: u8) -> Result<u64, OutOfRange> {
        let bytes = self.read_bytes(u64::from(size))?;
        let mut value = 0u64;
        match self.endian {
            Endian::Little => {
                for &byte in bytes.iter().rev() {
                    value = value.wrapping_shl(8) | u64::from(byte);
                }
            }
            Endian::Big => {
                for &byte in bytes {
                    value = value.wrapping_shl(8) | u64::from(byte);
                }
            }
        }
        Ok(value)
    }

    /// Reads a sign-extended integer of `size` bytes.
    pub fn read_int(&mut self, size: u8) -> Result<i64, OutOfRange> {
        let value = self.read_uint(size)?;
        let bits = u32::from(size.min(8)) * 8;
        if bits == 0 || bits == 64 {
            return Ok(value as i64);
        }
        let shift = 64 - bits;
        Ok(((value << shift) as i64) >> shift)
    }

    /// Reads an unsigned LEB128 integer.
    ///
    /// Bits beyond the 64th are discarded.
    pub fn read_uleb128(&mut self) -> Result<u64, OutOfRange> {
        let mut result = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            if shift < 64 {
                result |= u64::from(byte & 0x7f) << shift;
            }
            shift += 7;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
        }
    }

    /// Reads a signed LEB128 integer.
    pub fn read_sleb128(&mut self) -> Result<i64, OutOfRange> {
        let mut result = 0i64;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            if shift < 64 {
                result |= i64::from(byte & 0x7f) << shift;
            }
            shift += 7;
            if byte & 0x80 == 0 {
                if shift < 64 && byte & 0x40 != 0 {
                    result |= -1i64 << shift;
                }
                return Ok(result);
            }
        }
    }

    /// Reads a NUL-terminated string, returning its bytes without the terminator.
    pub fn read_cstr(&mut self) -> Result<&'a [u8], OutOfRange> {
        let rest = &self.data[self.pos.min(self.end)..self.end];
        match rest.iter().position(|&b| b == 0) {
            Some(len) => {
                let string = &rest[..len];
                self.pos += len + 1;
                Ok(string)
            }
            None => Err(self.out_of_range(rest.len() as u64 + 1)),
        }
    }

    /// Reads a DWARF initial length and the format it implies.
    pub fn read_initial_length(&mut self) -> Result<(u64, Format), OutOfRange> {
        let length = self.read_u32()?;
        if length == 0xffff_ffff {
            Ok((self.read_u64()?, Format::Dwarf64))
        } else {
            Ok((u64::from(length), Format::Dwarf32))
        }
    }

    /// Reads a section offset in the given format.
    pub fn read_offset(&mut self, format: Format) -> Result<u64, OutOfRange> {
        self.read_uint(format.offset_size())
    }
}

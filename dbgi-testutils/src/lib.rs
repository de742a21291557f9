//! Test helpers for `dbgi`.
//!
//! Instead of binary fixtures, tests synthesize the sections they decode with an [`Assembler`].
#![warn(missing_docs)]

use std::collections::HashMap;

pub use scroll::Endian;

/// A byte writer for synthesizing DWARF, CFI and EXIDX sections.
///
/// All writes return `&mut Self` so sections can be written as a chain. Lengths that are only
/// known after the content was written are handled by [`Assembler::length32`], and offsets
/// between entries can be recorded with [`Assembler::label`].
///
/// # Example
///
/// ```
/// use dbgi_testutils::Assembler;
///
/// let mut asm = Assembler::little();
/// asm.length32(|asm| {
///     asm.u16(4).uleb(624485);
/// });
/// assert_eq!(asm.finish(), [5, 0, 0, 0, 4, 0, 0xe5, 0x8e, 0x26]);
/// ```
#[derive(Clone, Debug)]
pub struct Assembler {
    data: Vec<u8>,
    endian: Endian,
    labels: HashMap<&'static str, usize>,
}

impl Assembler {
    /// Creates an empty assembler writing in the given byte order.
    pub fn new(endian: Endian) -> Self {
        Assembler {
            data: Vec::new(),
            endian,
            labels: HashMap::new(),
        }
    }

    /// Creates an empty little-endian assembler.
    pub fn little() -> Self {
        Self::new(Endian::Little)
    }

    /// Creates an empty big-endian assembler.
    pub fn big() -> Self {
        Self::new(Endian::Big)
    }

    /// The byte order of this assembler.
    pub fn endian(&self) -> Endian {
        self.endian
    }

    /// The number of bytes written so far.
    pub fn position(&self) -> usize {
        self.data.len()
    }

    /// Remembers the current position under `name`.
    pub fn label(&mut self, name: &'static str) -> &mut Self {
        self.labels.insert(name, self.data.len());
        self
    }

    /// Returns the position of a label.
    ///
    /// # Panics
    ///
    /// Panics if the label was never set.
    pub fn offset_of(&self, name: &str) -> usize {
        match self.labels.get(name) {
            Some(&offset) => offset,
            None => panic!("unknown label {name}"),
        }
    }

    /// Writes an unsigned integer of `size` bytes.
    pub fn uint(&mut self, size: usize, value: u64) -> &mut Self {
        let bytes = value.to_le_bytes();
        match self.endian {
            Endian::Little => self.data.extend_from_slice(&bytes[..size]),
            Endian::Big => self.data.extend(bytes[..size].iter().rev()),
        }
        self
    }

    /// Writes a byte.
    pub fn u8(&mut self, value: u8) -> &mut Self {
        self.data.push(value);
        self
    }

    /// Writes a 16-bit integer.
    pub fn u16(&mut self, value: u16) -> &mut Self {
        self.uint(2, value.into())
    }

    /// Writes a 32-bit integer.
    pub fn u32(&mut self, value: u32) -> &mut Self {
        self.uint(4, value.into())
    }

    /// Writes a 64-bit integer.
    pub fn u64(&mut self, value: u64) -> &mut Self {
        self.uint(8, value)
    }

    /// Writes a signed 32-bit integer.
    pub fn i32(&mut self, value: i32) -> &mut Self {
        self.u32(value as u32)
    }

    /// Writes an unsigned LEB128 integer.
    pub fn uleb(&mut self, mut value: u64) -> &mut Self {
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                self.data.push(byte);
                return self;
            }
            self.data.push(byte | 0x80);
        }
    }

    /// Writes a signed LEB128 integer.
    pub fn sleb(&mut self, mut value: i64) -> &mut Self {
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            let done = (value == 0 && byte & 0x40 == 0) || (value == -1 && byte & 0x40 != 0);
            if done {
                self.data.push(byte);
                return self;
            }
            self.data.push(byte | 0x80);
        }
    }

    /// Writes a NUL-terminated string.
    pub fn cstr(&mut self, value: &str) -> &mut Self {
        self.data.extend_from_slice(value.as_bytes());
        self.data.push(0);
        self
    }

    /// Writes raw bytes.
    pub fn bytes(&mut self, value: &[u8]) -> &mut Self {
        self.data.extend_from_slice(value);
        self
    }

    /// Writes `count` copies of `value`.
    pub fn fill(&mut self, count: usize, value: u8) -> &mut Self {
        self.data.extend(std::iter::repeat(value).take(count));
        self
    }

    /// Overwrites a 32-bit integer at an earlier position.
    pub fn patch_u32(&mut self, at: usize, value: u32) -> &mut Self {
        let bytes = match self.endian {
            Endian::Little => value.to_le_bytes(),
            Endian::Big => value.to_be_bytes(),
        };
        self.data[at..at + 4].copy_from_slice(&bytes);
        self
    }

    /// Writes a 32-bit length prefix covering everything written by `f`.
    pub fn length32<F>(&mut self, f: F) -> &mut Self
    where
        F: FnOnce(&mut Self),
    {
        let at = self.data.len();
        self.u32(0);
        f(self);
        let length = self.data.len() - at - 4;
        self.patch_u32(at, length as u32)
    }

    /// Writes a 64-bit DWARF length prefix (with `0xffffffff` escape) covering `f`.
    pub fn length64<F>(&mut self, f: F) -> &mut Self
    where
        F: FnOnce(&mut Self),
    {
        self.u32(0xffff_ffff);
        let at = self.data.len();
        self.u64(0);
        f(self);
        let length = (self.data.len() - at - 8) as u64;
        let bytes = match self.endian {
            Endian::Little => length.to_le_bytes(),
            Endian::Big => length.to_be_bytes(),
        };
        self.data[at..at + 8].copy_from_slice(&bytes);
        self
    }

    /// Writes a ULEB128 length prefix covering everything written by `f`.
    ///
    /// The content is assembled separately, so it must not refer to labels of the outer buffer.
    pub fn block<F>(&mut self, f: F) -> &mut Self
    where
        F: FnOnce(&mut Self),
    {
        let mut inner = Assembler::new(self.endian);
        f(&mut inner);
        let inner = inner.finish();
        self.uleb(inner.len() as u64).bytes(&inner)
    }

    /// Returns the written bytes.
    pub fn finish(&self) -> Vec<u8> {
        self.data.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leb128() {
        let mut asm = Assembler::little();
        asm.uleb(127).uleb(128).sleb(-2).sleb(-128).sleb(63).sleb(64);
        assert_eq!(
            asm.finish(),
            [0x7f, 0x80, 0x01, 0x7e, 0x80, 0x7f, 0x3f, 0xc0, 0x00]
        );
    }

    #[test]
    fn test_big_endian() {
        let mut asm = Assembler::big();
        asm.u16(0x0102).u32(0x0304_0506);
        assert_eq!(asm.finish(), [1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_block_and_labels() {
        let mut asm = Assembler::little();
        asm.u8(9).label("block").block(|asm| {
            asm.u8(1).u8(2);
        });
        assert_eq!(asm.offset_of("block"), 1);
        assert_eq!(asm.finish(), [9, 2, 1, 2]);
    }
}

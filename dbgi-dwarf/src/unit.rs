use dbgi_common::{Cursor, Section};

use crate::form::Encoding;
use crate::DwarfError;

/// Whether a unit describes code or a single type.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UnitKind {
    /// A compilation or partial unit in `.debug_info`.
    Compile,
    /// A type unit in `.debug_types`.
    Type {
        /// The signature other units use to refer to the type.
        signature: u64,
        /// The absolute section offset of the type's entry.
        type_offset: u64,
    },
}

/// The header of a unit in `.debug_info` or `.debug_types`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct UnitHeader {
    /// The section offset of the header.
    pub offset: u64,
    /// The section offset one past the last byte of the unit.
    pub end: u64,
    /// The section offset of the first entry.
    pub entries: u64,
    /// Format, version and address size.
    pub encoding: Encoding,
    /// The offset of the unit's abbreviation table in `.debug_abbrev`.
    pub abbrev_offset: u64,
    /// Compile or type unit.
    pub kind: UnitKind,
}

impl UnitHeader {
    /// Parses a unit header at the cursor and advances the cursor past the entire unit.
    ///
    /// If the declared length fits into the section, the cursor is advanced past the unit even if
    /// the rest of the header is malformed, so that the next unit can still be read.
    pub fn parse(cursor: &mut Cursor<'_>, is_types: bool) -> Result<Self, DwarfError> {
        let offset = cursor.position();
        let (length, format) = match cursor.read_initial_length() {
            Ok(initial) => initial,
            Err(error) => {
                // A truncated length leaves nothing that could be read after it.
                cursor.seek(cursor.end())?;
                return Err(error.into());
            }
        };
        if !cursor.valid(length) {
            return Err(DwarfError::LengthExceedsSection {
                length,
                available: cursor.remaining() as u64,
            });
        }

        let mut unit = cursor.split(length)?;
        let end = unit.end();

        let version = unit.read_u16()?;
        if !(2..=4).contains(&version) {
            return Err(DwarfError::UnsupportedVersion(version));
        }

        let abbrev_offset = unit.read_offset(format)?;
        let address_size = unit.read_u8()?;
        if !matches!(address_size, 2 | 4 | 8) {
            return Err(DwarfError::UnsupportedAddressSize(address_size));
        }

        let kind = if is_types {
            let signature = unit.read_u64()?;
            let type_offset = unit.read_offset(format)?;
            UnitKind::Type {
                signature,
                type_offset: offset + type_offset,
            }
        } else {
            UnitKind::Compile
        };

        Ok(UnitHeader {
            offset,
            end,
            entries: unit.position(),
            encoding: Encoding {
                format,
                version,
                address_size,
            },
            abbrev_offset,
            kind,
        })
    }

    /// Returns `true` if `offset` points into the entries of this unit.
    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.entries && offset < self.end
    }
}

/// Iterates the unit headers of a section.
///
/// Each item carries the offset of the header, so failures can be attributed. Iteration stops
/// after a unit whose length cannot be trusted, since the next header cannot be located.
#[derive(Clone, Debug)]
pub struct UnitHeaders<'a> {
    cursor: Cursor<'a>,
    is_types: bool,
    done: bool,
}

impl<'a> UnitHeaders<'a> {
    /// Iterates the units of `.debug_info`, or of `.debug_types` if `is_types` is set.
    pub fn new(section: Section<'a>, is_types: bool) -> Self {
        UnitHeaders {
            cursor: section.cursor(),
            is_types,
            done: false,
        }
    }
}

impl Iterator for UnitHeaders<'_> {
    type Item = (u64, Result<UnitHeader, DwarfError>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.cursor.is_empty() {
            return None;
        }

        let offset = self.cursor.position();
        let result = UnitHeader::parse(&mut self.cursor, self.is_types);
        if self.cursor.position() == offset
            || matches!(result, Err(DwarfError::LengthExceedsSection { .. }))
        {
            self.done = true;
        }

        Some((offset, result))
    }
}

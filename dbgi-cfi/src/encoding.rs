//! Decoding of `DW_EH_PE` encoded pointers.

use dbgi_common::Cursor;
use gimli::constants;

use crate::{CfiError, CfiErrorKind};

/// Base addresses that relative pointer encodings are applied to.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PointerBases {
    /// The address at which the section containing the pointer is loaded.
    pub section: u64,
    /// The address of `.text`, for `DW_EH_PE_textrel`.
    pub text: Option<u64>,
    /// The address of `.got`, for `DW_EH_PE_datarel`.
    pub data: Option<u64>,
}

impl PointerBases {
    /// Creates bases for pointers in a section loaded at `section`.
    pub fn new(section: u64) -> Self {
        PointerBases {
            section,
            ..Self::default()
        }
    }
}

/// Returns `true` if the encoding says no value is present.
pub fn is_omitted(encoding: gimli::DwEhPe) -> bool {
    encoding == constants::DW_EH_PE_omit
}

/// Reads the value of a pointer without applying its base.
fn read_value(
    cursor: &mut Cursor<'_>,
    format: gimli::DwEhPe,
    address_size: u8,
) -> Result<u64, CfiError> {
    let value = match format {
        constants::DW_EH_PE_absptr => cursor.read_uint(address_size)?,
        constants::DW_EH_PE_uleb128 => cursor.read_uleb128()?,
        constants::DW_EH_PE_udata2 => u64::from(cursor.read_u16()?),
        constants::DW_EH_PE_udata4 => u64::from(cursor.read_u32()?),
        constants::DW_EH_PE_udata8 => cursor.read_u64()?,
        constants::DW_EH_PE_sleb128 => cursor.read_sleb128()? as u64,
        constants::DW_EH_PE_sdata2 => i64::from(cursor.read_i16()?) as u64,
        constants::DW_EH_PE_sdata4 => i64::from(cursor.read_i32()?) as u64,
        constants::DW_EH_PE_sdata8 => cursor.read_i64()? as u64,
        _ => return Err(CfiErrorKind::BadPointerEncoding.into()),
    };

    Ok(value)
}

/// Reads a pointer in the given encoding and applies its base.
///
/// Indirect pointers would require reading target memory and are rejected, as are encodings
/// relative to a base that is not known.
pub fn read_encoded_pointer(
    cursor: &mut Cursor<'_>,
    encoding: gimli::DwEhPe,
    bases: &PointerBases,
    address_size: u8,
) -> Result<u64, CfiError> {
    if is_omitted(encoding) || encoding.0 & constants::DW_EH_PE_indirect.0 != 0 {
        return Err(CfiErrorKind::BadPointerEncoding.into());
    }

    let format = gimli::DwEhPe(encoding.0 & 0x0f);
    let application = gimli::DwEhPe(encoding.0 & 0x70);

    if application == constants::DW_EH_PE_aligned {
        let size = u64::from(address_size.max(1));
        let misalign = cursor.position() % size;
        if misalign != 0 {
            cursor.skip(size - misalign)?;
        }
        return Ok(cursor.read_uint(address_size)?);
    }

    let position = cursor.position();
    let value = read_value(cursor, format, address_size)?;

    let base = match application {
        constants::DW_EH_PE_absptr => 0,
        constants::DW_EH_PE_pcrel => bases.section.wrapping_add(position),
        constants::DW_EH_PE_textrel => bases
            .text
            .ok_or(CfiErrorKind::BadPointerEncoding)?,
        constants::DW_EH_PE_datarel => bases
            .data
            .ok_or(CfiErrorKind::BadPointerEncoding)?,
        _ => return Err(CfiErrorKind::BadPointerEncoding.into()),
    };

    let value = base.wrapping_add(value);
    Ok(match address_size {
        4 => value & 0xffff_ffff,
        _ => value,
    })
}

/// Reads an unsigned value in the format part of an encoding, as used for FDE address ranges.
pub fn read_encoded_size(
    cursor: &mut Cursor<'_>,
    encoding: gimli::DwEhPe,
    address_size: u8,
) -> Result<u64, CfiError> {
    read_value(cursor, gimli::DwEhPe(encoding.0 & 0x0f), address_size)
}

/// Returns the number of bytes a pointer occupies, or `None` for variable length encodings.
pub fn encoded_pointer_size(encoding: gimli::DwEhPe, address_size: u8) -> Option<u8> {
    match gimli::DwEhPe(encoding.0 & 0x0f) {
        constants::DW_EH_PE_absptr => Some(address_size),
        constants::DW_EH_PE_udata2 | constants::DW_EH_PE_sdata2 => Some(2),
        constants::DW_EH_PE_udata4 | constants::DW_EH_PE_sdata4 => Some(4),
        constants::DW_EH_PE_udata8 | constants::DW_EH_PE_sdata8 => Some(8),
        _ => None,
    }
}

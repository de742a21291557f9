use dbgi_common::{Cursor, Format};
use gimli::constants;
use gimli::DwForm;

use crate::DwarfError;

/// The parameters of a unit that determine how attribute values are encoded.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Encoding {
    /// 32-bit or 64-bit DWARF.
    pub format: Format,
    /// The DWARF version of the unit.
    pub version: u16,
    /// The size of target addresses in bytes.
    pub address_size: u8,
}

impl Encoding {
    /// The size of `DW_FORM_ref_addr` values, which changed between DWARF 2 and 3.
    fn ref_addr_size(self) -> u8 {
        if self.version <= 2 {
            self.address_size
        } else {
            self.format.offset_size()
        }
    }
}

/// Returns the encoded size of a form if it does not depend on the value.
pub fn fixed_form_size(form: DwForm, encoding: Encoding) -> Option<u32> {
    let size = match form {
        constants::DW_FORM_flag_present => 0,
        constants::DW_FORM_data1 | constants::DW_FORM_ref1 | constants::DW_FORM_flag => 1,
        constants::DW_FORM_data2 | constants::DW_FORM_ref2 => 2,
        constants::DW_FORM_data4 | constants::DW_FORM_ref4 => 4,
        constants::DW_FORM_data8 | constants::DW_FORM_ref8 | constants::DW_FORM_ref_sig8 => 8,
        constants::DW_FORM_addr => encoding.address_size,
        constants::DW_FORM_ref_addr => encoding.ref_addr_size(),
        constants::DW_FORM_strp
        | constants::DW_FORM_sec_offset
        | constants::DW_FORM_GNU_strp_alt
        | constants::DW_FORM_GNU_ref_alt => encoding.format.offset_size(),
        _ => return None,
    };

    Some(u32::from(size))
}

/// The decoded value of an attribute.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum AttrValue<'a> {
    /// A target address.
    Address(u64),
    /// An unsigned constant. Fixed-size data forms decode to this as well.
    Udata(u64),
    /// A signed constant.
    Sdata(i64),
    /// A flag.
    Flag(bool),
    /// A block of bytes, including expression locations.
    Block(&'a [u8]),
    /// A string, either inline or resolved from a string section.
    String(&'a [u8]),
    /// A reference to an entry in the same section, as absolute section offset.
    UnitRef(u64),
    /// A reference into `.debug_info` that may cross unit boundaries.
    InfoRef(u64),
    /// A reference into the alternate debug file.
    AltRef(u64),
    /// A reference to a type unit by its signature.
    Signature(u64),
    /// An offset into another section, such as `.debug_line` or `.debug_loc`.
    SecOffset(u64),
}

impl<'a> AttrValue<'a> {
    /// Returns the value as unsigned integer, if it is a constant or offset.
    pub fn udata(self) -> Option<u64> {
        match self {
            AttrValue::Udata(value) | AttrValue::SecOffset(value) => Some(value),
            AttrValue::Sdata(value) => u64::try_from(value).ok(),
            AttrValue::Flag(value) => Some(value.into()),
            _ => None,
        }
    }

    /// Returns the value as signed integer, if it is a constant.
    pub fn sdata(self) -> Option<i64> {
        match self {
            AttrValue::Sdata(value) => Some(value),
            AttrValue::Udata(value) => Some(value as i64),
            _ => None,
        }
    }

    /// Returns the string contents, if this is a string.
    pub fn string(self) -> Option<&'a [u8]> {
        match self {
            AttrValue::String(string) => Some(string),
            _ => None,
        }
    }

    /// Returns the bytes of a block or expression location.
    pub fn block(self) -> Option<&'a [u8]> {
        match self {
            AttrValue::Block(block) => Some(block),
            _ => None,
        }
    }
}

/// The unit-level context needed to decode attribute values.
#[derive(Clone, Copy, Debug)]
pub struct FormContext<'a> {
    /// The encoding of the unit.
    pub encoding: Encoding,
    /// The section offset of the unit header, used to resolve unit-relative references.
    pub unit_offset: u64,
    /// `.debug_str` of this object.
    pub debug_str: dbgi_common::Section<'a>,
    /// `.debug_str` of the alternate debug file, if any.
    pub alt_debug_str: Option<dbgi_common::Section<'a>>,
}

/// Reads one attribute value of the given form.
pub fn read_attr_value<'a>(
    cursor: &mut Cursor<'a>,
    form: DwForm,
    cx: &FormContext<'a>,
) -> Result<AttrValue<'a>, DwarfError> {
    let encoding = cx.encoding;
    let value = match form {
        constants::DW_FORM_addr => AttrValue::Address(cursor.read_uint(encoding.address_size)?),
        constants::DW_FORM_data1 => AttrValue::Udata(cursor.read_u8()?.into()),
        constants::DW_FORM_data2 => AttrValue::Udata(cursor.read_u16()?.into()),
        constants::DW_FORM_data4 => AttrValue::Udata(cursor.read_u32()?.into()),
        constants::DW_FORM_data8 => AttrValue::Udata(cursor.read_u64()?),
        constants::DW_FORM_udata => AttrValue::Udata(cursor.read_uleb128()?),
        constants::DW_FORM_sdata => AttrValue::Sdata(cursor.read_sleb128()?),
        constants::DW_FORM_flag => AttrValue::Flag(cursor.read_u8()? != 0),
        constants::DW_FORM_flag_present => AttrValue::Flag(true),
        constants::DW_FORM_block1 => {
            let len = cursor.read_u8()?;
            AttrValue::Block(cursor.read_bytes(len.into())?)
        }
        constants::DW_FORM_block2 => {
            let len = cursor.read_u16()?;
            AttrValue::Block(cursor.read_bytes(len.into())?)
        }
        constants::DW_FORM_block4 => {
            let len = cursor.read_u32()?;
            AttrValue::Block(cursor.read_bytes(len.into())?)
        }
        constants::DW_FORM_block | constants::DW_FORM_exprloc => {
            let len = cursor.read_uleb128()?;
            AttrValue::Block(cursor.read_bytes(len)?)
        }
        constants::DW_FORM_string => AttrValue::String(cursor.read_cstr()?),
        constants::DW_FORM_strp => {
            let offset = cursor.read_offset(encoding.format)?;
            AttrValue::String(cx.debug_str.cstr_at(offset)?)
        }
        constants::DW_FORM_GNU_strp_alt => {
            let offset = cursor.read_offset(encoding.format)?;
            match cx.alt_debug_str {
                Some(section) => AttrValue::String(section.cstr_at(offset)?),
                None => AttrValue::String(b""),
            }
        }
        constants::DW_FORM_ref1 => unit_ref(cx, cursor.read_u8()?.into()),
        constants::DW_FORM_ref2 => unit_ref(cx, cursor.read_u16()?.into()),
        constants::DW_FORM_ref4 => unit_ref(cx, cursor.read_u32()?.into()),
        constants::DW_FORM_ref8 => unit_ref(cx, cursor.read_u64()?),
        constants::DW_FORM_ref_udata => unit_ref(cx, cursor.read_uleb128()?),
        constants::DW_FORM_ref_addr => {
            AttrValue::InfoRef(cursor.read_uint(encoding.ref_addr_size())?)
        }
        constants::DW_FORM_GNU_ref_alt => AttrValue::AltRef(cursor.read_offset(encoding.format)?),
        constants::DW_FORM_ref_sig8 => AttrValue::Signature(cursor.read_u64()?),
        constants::DW_FORM_sec_offset => AttrValue::SecOffset(cursor.read_offset(encoding.format)?),
        constants::DW_FORM_indirect => {
            let form = DwForm(read_form_code(cursor)?);
            if form == constants::DW_FORM_indirect {
                return Err(DwarfError::UnsupportedForm(form.0));
            }
            return read_attr_value(cursor, form, cx);
        }
        _ => return Err(DwarfError::UnsupportedForm(form.0)),
    };

    Ok(value)
}

/// Skips one attribute value of the given form without decoding it.
pub fn skip_attr_value(
    cursor: &mut Cursor<'_>,
    form: DwForm,
    encoding: Encoding,
) -> Result<(), DwarfError> {
    if let Some(size) = fixed_form_size(form, encoding) {
        cursor.skip(size.into())?;
        return Ok(());
    }

    match form {
        constants::DW_FORM_udata | constants::DW_FORM_sdata | constants::DW_FORM_ref_udata => {
            cursor.read_uleb128()?;
        }
        constants::DW_FORM_string => {
            cursor.read_cstr()?;
        }
        constants::DW_FORM_block1 => {
            let len = cursor.read_u8()?;
            cursor.skip(len.into())?;
        }
        constants::DW_FORM_block2 => {
            let len = cursor.read_u16()?;
            cursor.skip(len.into())?;
        }
        constants::DW_FORM_block4 => {
            let len = cursor.read_u32()?;
            cursor.skip(len.into())?;
        }
        constants::DW_FORM_block | constants::DW_FORM_exprloc => {
            let len = cursor.read_uleb128()?;
            cursor.skip(len)?;
        }
        constants::DW_FORM_indirect => {
            let form = DwForm(read_form_code(cursor)?);
            if form == constants::DW_FORM_indirect {
                return Err(DwarfError::UnsupportedForm(form.0));
            }
            return skip_attr_value(cursor, form, encoding);
        }
        _ => return Err(DwarfError::UnsupportedForm(form.0)),
    }

    Ok(())
}

fn read_form_code(cursor: &mut Cursor<'_>) -> Result<u16, DwarfError> {
    let code = cursor.read_uleb128()?;
    u16::try_from(code).map_err(|_| DwarfError::UnsupportedForm(u16::MAX))
}

fn unit_ref(cx: &FormContext<'_>, offset: u64) -> AttrValue<'static> {
    AttrValue::UnitRef(cx.unit_offset.wrapping_add(offset))
}

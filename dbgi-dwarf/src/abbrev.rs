use std::collections::HashMap;

use dbgi_common::{Cursor, Section};
use gimli::{DwAt, DwForm, DwTag};
use smallvec::SmallVec;

use crate::form::{fixed_form_size, skip_attr_value, Encoding};
use crate::DwarfError;

/// One `(attribute, form)` pair of an abbreviation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AttributeSpec {
    /// The attribute name.
    pub name: DwAt,
    /// The form its value is encoded with.
    pub form: DwForm,
}

/// The shape of a debugging information entry.
#[derive(Clone, Debug)]
pub struct Abbreviation {
    code: u64,
    tag: DwTag,
    has_children: bool,
    attributes: SmallVec<[AttributeSpec; 8]>,
    fixed_prefix_count: usize,
    fixed_prefix_bytes: u32,
    fixed_size: Option<u32>,
}

impl Abbreviation {
    /// The code entries use to refer to this abbreviation.
    pub fn code(&self) -> u64 {
        self.code
    }

    /// The tag of entries with this abbreviation.
    pub fn tag(&self) -> DwTag {
        self.tag
    }

    /// Whether entries with this abbreviation are followed by children.
    pub fn has_children(&self) -> bool {
        self.has_children
    }

    /// The attributes in encoding order.
    pub fn attributes(&self) -> &[AttributeSpec] {
        &self.attributes
    }

    /// The encoded size of all attributes, if none of them has a variable size.
    pub fn fixed_size(&self) -> Option<u32> {
        self.fixed_size
    }

    fn compute_prefix(&mut self, encoding: Encoding) {
        let mut bytes = 0u32;
        let mut count = 0;
        for spec in &self.attributes {
            match fixed_form_size(spec.form, encoding) {
                Some(size) => {
                    bytes += size;
                    count += 1;
                }
                None => break,
            }
        }

        self.fixed_prefix_count = count;
        self.fixed_prefix_bytes = bytes;
        self.fixed_size = (count == self.attributes.len()).then_some(bytes);
    }

    /// Skips the attributes of an entry with this abbreviation.
    ///
    /// The leading run of fixed-size attributes is skipped in one step.
    pub fn skip_attributes(
        &self,
        cursor: &mut Cursor<'_>,
        encoding: Encoding,
    ) -> Result<(), DwarfError> {
        cursor.skip(self.fixed_prefix_bytes.into())?;
        for spec in &self.attributes[self.fixed_prefix_count..] {
            skip_attr_value(cursor, spec.form, encoding)?;
        }
        Ok(())
    }
}

/// The abbreviations of one unit, keyed by code.
#[derive(Clone, Debug, Default)]
pub struct AbbrevTable {
    entries: HashMap<u64, Abbreviation>,
}

impl AbbrevTable {
    /// Parses the table at `offset` in `.debug_abbrev`.
    ///
    /// The table ends at the first zero code. A code that appears twice keeps its first
    /// definition.
    pub fn parse(
        debug_abbrev: Section<'_>,
        offset: u64,
        encoding: Encoding,
    ) -> Result<Self, DwarfError> {
        let mut cursor = debug_abbrev.cursor_at(offset)?;
        let mut entries = HashMap::new();

        loop {
            let code = cursor.read_uleb128()?;
            if code == 0 {
                break;
            }

            let tag = DwTag(read_tag(&mut cursor)?);
            let has_children = cursor.read_u8()? != 0;

            let mut attributes = SmallVec::new();
            loop {
                let name = cursor.read_uleb128()?;
                let form = cursor.read_uleb128()?;
                if name == 0 && form == 0 {
                    break;
                }
                attributes.push(AttributeSpec {
                    name: DwAt(u16::try_from(name).map_err(|_| {
                        DwarfError::InvalidHeader("attribute name out of range")
                    })?),
                    form: DwForm(
                        u16::try_from(form).map_err(|_| DwarfError::UnsupportedForm(u16::MAX))?,
                    ),
                });
            }

            let mut abbrev = Abbreviation {
                code,
                tag,
                has_children,
                attributes,
                fixed_prefix_count: 0,
                fixed_prefix_bytes: 0,
                fixed_size: None,
            };
            abbrev.compute_prefix(encoding);
            entries.entry(code).or_insert(abbrev);
        }

        Ok(AbbrevTable { entries })
    }

    /// Looks up an abbreviation by code.
    pub fn get(&self, code: u64) -> Result<&Abbreviation, DwarfError> {
        self.entries
            .get(&code)
            .ok_or(DwarfError::UnknownAbbreviation(code))
    }

    /// The number of abbreviations in the table.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the table has no abbreviations.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn read_tag(cursor: &mut Cursor<'_>) -> Result<u16, DwarfError> {
    let value = cursor.read_uleb128()?;
    u16::try_from(value).map_err(|_| DwarfError::InvalidHeader("tag out of range"))
}

#[cfg(test)]
mod tests {
    use super::*;

    use dbgi_common::{Endian, Format};
    use dbgi_testutils::Assembler;
    use gimli::constants;
    use similar_asserts::assert_eq;

    const ENCODING: Encoding = Encoding {
        format: Format::Dwarf32,
        version: 4,
        address_size: 8,
    };

    #[test]
    fn test_fixed_prefix() -> Result<(), DwarfError> {
        let mut asm = Assembler::little();
        asm.fill(3, 0xee) // unrelated table before ours
            .uleb(1)
            .uleb(constants::DW_TAG_member.0.into())
            .u8(0)
            .uleb(constants::DW_AT_type.0.into())
            .uleb(constants::DW_FORM_ref4.0.into())
            .uleb(constants::DW_AT_data_member_location.0.into())
            .uleb(constants::DW_FORM_data1.0.into())
            .uleb(constants::DW_AT_name.0.into())
            .uleb(constants::DW_FORM_string.0.into())
            .uleb(constants::DW_AT_external.0.into())
            .uleb(constants::DW_FORM_flag_present.0.into())
            .u8(0)
            .u8(0)
            .uleb(2)
            .uleb(constants::DW_TAG_base_type.0.into())
            .u8(1)
            .uleb(constants::DW_AT_byte_size.0.into())
            .uleb(constants::DW_FORM_data1.0.into())
            .u8(0)
            .u8(0)
            .u8(0);
        let data = asm.finish();
        let section = Section::new(".debug_abbrev", &data, Endian::Little);

        let table = AbbrevTable::parse(section, 3, ENCODING)?;
        assert_eq!(table.len(), 2);

        let member = table.get(1)?;
        assert_eq!(member.tag(), constants::DW_TAG_member);
        assert!(!member.has_children());
        assert_eq!(member.attributes().len(), 4);
        assert_eq!(member.fixed_prefix_count, 2);
        assert_eq!(member.fixed_prefix_bytes, 5);
        assert_eq!(member.fixed_size(), None);

        let base = table.get(2)?;
        assert!(base.has_children());
        assert_eq!(base.fixed_size(), Some(1));

        assert!(matches!(
            table.get(3),
            Err(DwarfError::UnknownAbbreviation(3))
        ));

        Ok(())
    }

    #[test]
    fn test_skip_attributes() -> Result<(), DwarfError> {
        let mut asm = Assembler::little();
        asm.uleb(1)
            .uleb(constants::DW_TAG_member.0.into())
            .u8(0)
            .uleb(constants::DW_AT_type.0.into())
            .uleb(constants::DW_FORM_ref4.0.into())
            .uleb(constants::DW_AT_name.0.into())
            .uleb(constants::DW_FORM_string.0.into())
            .u8(0)
            .u8(0)
            .u8(0);
        let abbrevs = asm.finish();
        let table = AbbrevTable::parse(
            Section::new(".debug_abbrev", &abbrevs, Endian::Little),
            0,
            ENCODING,
        )?;

        let entry = [0x10, 0, 0, 0, b'a', b'b', 0, 0xff];
        let mut cursor = Cursor::new(&entry, Endian::Little);
        table.get(1)?.skip_attributes(&mut cursor, ENCODING)?;
        assert_eq!(cursor.position(), 7);

        Ok(())
    }
}

use std::collections::HashMap;
use std::rc::Rc;

use dbgi_common::{Cursor, Section};
use gimli::{constants, DwAt, DwTag};
use smallvec::SmallVec;

use crate::abbrev::AbbrevTable;
use crate::form::{read_attr_value, AttrValue, Encoding, FormContext};
use crate::unit::{UnitHeader, UnitKind};
use crate::{DwarfError, DwarfSections};

/// A decoded debugging information entry.
#[derive(Clone, Debug)]
pub struct Die<'a> {
    /// The absolute offset of the entry in its section.
    pub offset: u64,
    /// The tag of the entry.
    pub tag: DwTag,
    /// Whether children follow the entry.
    pub has_children: bool,
    /// The nesting depth, where the unit's root entry is at depth 0.
    pub depth: usize,
    attrs: SmallVec<[(DwAt, AttrValue<'a>); 16]>,
}

impl<'a> Die<'a> {
    /// Returns the value of an attribute.
    pub fn attr(&self, name: DwAt) -> Option<AttrValue<'a>> {
        self.attrs
            .iter()
            .find(|(at, _)| *at == name)
            .map(|(_, value)| *value)
    }

    /// Returns `true` if the entry has the attribute.
    pub fn has_attr(&self, name: DwAt) -> bool {
        self.attrs.iter().any(|(at, _)| *at == name)
    }

    /// Iterates all attributes in encoding order.
    pub fn attrs(&self) -> impl Iterator<Item = (DwAt, AttrValue<'a>)> + '_ {
        self.attrs.iter().copied()
    }

    /// The `DW_AT_name` of the entry.
    pub fn name(&self) -> Option<&'a [u8]> {
        self.attr(constants::DW_AT_name)
            .and_then(AttrValue::string)
            .filter(|name| !name.is_empty())
    }

    /// The linkage name of the entry, including the pre-standard MIPS spelling.
    pub fn linkage_name(&self) -> Option<&'a [u8]> {
        self.attr(constants::DW_AT_linkage_name)
            .or_else(|| self.attr(constants::DW_AT_MIPS_linkage_name))
            .and_then(AttrValue::string)
            .filter(|name| !name.is_empty())
    }

    /// An unsigned constant attribute.
    pub fn udata(&self, name: DwAt) -> Option<u64> {
        self.attr(name).and_then(AttrValue::udata)
    }

    /// A signed constant attribute.
    pub fn sdata(&self, name: DwAt) -> Option<i64> {
        self.attr(name).and_then(AttrValue::sdata)
    }

    /// A flag attribute, `false` if absent.
    pub fn flag(&self, name: DwAt) -> bool {
        matches!(self.attr(name), Some(AttrValue::Flag(true)))
    }

    /// The offset of the next sibling, if it is given as a reference within the unit.
    pub fn sibling(&self) -> Option<u64> {
        match self.attr(constants::DW_AT_sibling) {
            Some(AttrValue::UnitRef(offset)) => Some(offset),
            _ => None,
        }
    }
}

/// Abbreviation tables shared between units that use the same table.
#[derive(Debug, Default)]
pub struct AbbrevCache {
    tables: HashMap<(u64, Encoding), Rc<AbbrevTable>>,
}

impl AbbrevCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the table at `offset`, parsing it on first use.
    pub fn get(
        &mut self,
        debug_abbrev: Section<'_>,
        offset: u64,
        encoding: Encoding,
    ) -> Result<Rc<AbbrevTable>, DwarfError> {
        if let Some(table) = self.tables.get(&(offset, encoding)) {
            return Ok(Rc::clone(table));
        }

        let table = Rc::new(AbbrevTable::parse(debug_abbrev, offset, encoding)?);
        self.tables.insert((offset, encoding), Rc::clone(&table));
        Ok(table)
    }
}

/// Everything needed to decode the entries of one unit.
#[derive(Clone, Debug)]
pub struct UnitContext<'a> {
    /// The unit header.
    pub header: UnitHeader,
    /// The section the unit lives in.
    pub section: Section<'a>,
    /// All DWARF sections of the object.
    pub sections: DwarfSections<'a>,
    abbrevs: Rc<AbbrevTable>,
    form: FormContext<'a>,
    /// The base address for range and location lists, from the root entry's `DW_AT_low_pc`.
    pub base_address: u64,
    /// The compilation directory of the unit, empty if unknown.
    pub comp_dir: &'a [u8],
    /// The name of the unit, empty if unknown.
    pub name: &'a [u8],
    /// The offset of the unit's line program in `.debug_line`.
    pub stmt_list: Option<u64>,
    /// The root entry of the unit.
    pub root: Option<Die<'a>>,
}

impl<'a> UnitContext<'a> {
    /// Loads the abbreviations and the root entry of a unit.
    pub fn new(
        header: UnitHeader,
        sections: DwarfSections<'a>,
        abbrevs: &mut AbbrevCache,
    ) -> Result<Self, DwarfError> {
        let section = match header.kind {
            UnitKind::Compile => sections.debug_info,
            UnitKind::Type { .. } => sections.debug_types,
        };

        let mut context = UnitContext {
            header,
            section,
            sections,
            abbrevs: abbrevs.get(sections.debug_abbrev, header.abbrev_offset, header.encoding)?,
            form: FormContext {
                encoding: header.encoding,
                unit_offset: header.offset,
                debug_str: sections.debug_str,
                alt_debug_str: sections.alt.map(|alt| alt.debug_str),
            },
            base_address: 0,
            comp_dir: b"",
            name: b"",
            stmt_list: None,
            root: None,
        };

        let mut cursor = context.entries()?;
        if let Some(root) = context.read_die(&mut cursor, 0)? {
            context.base_address = match root.attr(constants::DW_AT_low_pc) {
                Some(AttrValue::Address(address)) => address,
                _ => 0,
            };
            context.comp_dir = root
                .attr(constants::DW_AT_comp_dir)
                .and_then(AttrValue::string)
                .unwrap_or_default();
            context.name = root.name().unwrap_or_default();
            context.stmt_list = root.udata(constants::DW_AT_stmt_list);
            context.root = Some(root);
        }

        Ok(context)
    }

    /// The encoding of the unit.
    pub fn encoding(&self) -> Encoding {
        self.header.encoding
    }

    /// Returns a cursor over the entries of the unit.
    pub fn entries(&self) -> Result<Cursor<'a>, DwarfError> {
        let cursor = self.section.cursor_at(self.header.entries)?;
        Ok(cursor.truncated(self.header.end)?)
    }

    /// Reads the entry at the cursor.
    ///
    /// Returns `None` for the null entry that terminates a list of siblings.
    pub fn read_die(
        &self,
        cursor: &mut Cursor<'a>,
        depth: usize,
    ) -> Result<Option<Die<'a>>, DwarfError> {
        let offset = cursor.position();
        let code = cursor.read_uleb128()?;
        if code == 0 {
            return Ok(None);
        }

        let abbrev = self.abbrevs.get(code)?;
        let mut attrs = SmallVec::new();
        for spec in abbrev.attributes() {
            let value = read_attr_value(cursor, spec.form, &self.form)?;
            attrs.push((spec.name, value));
        }

        Ok(Some(Die {
            offset,
            tag: abbrev.tag(),
            has_children: abbrev.has_children(),
            depth,
            attrs,
        }))
    }

    /// Skips over the children of an entry whose attributes have already been read.
    ///
    /// Nested entries are skipped without decoding their attributes.
    pub fn skip_children(&self, cursor: &mut Cursor<'a>) -> Result<(), DwarfError> {
        let mut depth = 1usize;
        while depth > 0 {
            let code = cursor.read_uleb128()?;
            if code == 0 {
                depth -= 1;
                continue;
            }

            let abbrev = self.abbrevs.get(code)?;
            abbrev.skip_attributes(cursor, self.header.encoding)?;
            if abbrev.has_children() {
                depth += 1;
            }
        }
        Ok(())
    }

    /// Reads the entry at an absolute offset within this unit.
    pub fn entry_at(&self, offset: u64) -> Result<Die<'a>, DwarfError> {
        if !self.header.contains(offset) {
            return Err(DwarfError::InvalidReference(offset));
        }

        let mut cursor = self.entries()?;
        cursor.seek(offset)?;
        self.read_die(&mut cursor, 0)?
            .ok_or(DwarfError::InvalidReference(offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use dbgi_common::Endian;
    use dbgi_testutils::Assembler;
    use similar_asserts::assert_eq;

    use crate::unit::UnitHeaders;

    fn abbrevs() -> Vec<u8> {
        let mut asm = Assembler::little();
        asm.uleb(1)
            .uleb(constants::DW_TAG_compile_unit.0.into())
            .u8(1)
            .uleb(constants::DW_AT_name.0.into())
            .uleb(constants::DW_FORM_string.0.into())
            .uleb(constants::DW_AT_low_pc.0.into())
            .uleb(constants::DW_FORM_addr.0.into())
            .uleb(constants::DW_AT_stmt_list.0.into())
            .uleb(constants::DW_FORM_sec_offset.0.into())
            .u8(0)
            .u8(0)
            .uleb(2)
            .uleb(constants::DW_TAG_structure_type.0.into())
            .u8(1)
            .uleb(constants::DW_AT_name.0.into())
            .uleb(constants::DW_FORM_string.0.into())
            .u8(0)
            .u8(0)
            .uleb(3)
            .uleb(constants::DW_TAG_member.0.into())
            .u8(0)
            .uleb(constants::DW_AT_type.0.into())
            .uleb(constants::DW_FORM_ref4.0.into())
            .u8(0)
            .u8(0)
            .u8(0);
        asm.finish()
    }

    fn info() -> Vec<u8> {
        let mut asm = Assembler::little();
        asm.length32(|asm| {
            asm.u16(4).u32(0).u8(8);
            asm.uleb(1).cstr("a.c").u64(0x1000).u32(0x40);
            asm.uleb(2).cstr("S");
            asm.uleb(3).u32(0x0b);
            asm.uleb(3).u32(0x0b);
            asm.u8(0);
            asm.uleb(2).cstr("T").u8(0);
            asm.u8(0);
        });
        asm.finish()
    }

    #[test]
    fn test_root_and_skip() -> Result<(), DwarfError> {
        let abbrev = abbrevs();
        let info = info();
        let mut sections = DwarfSections::empty(Endian::Little);
        sections.debug_abbrev = Section::new(".debug_abbrev", &abbrev, Endian::Little);
        sections.debug_info = Section::new(".debug_info", &info, Endian::Little);

        let (_, header) = UnitHeaders::new(sections.debug_info, false)
            .next()
            .ok_or(DwarfError::InvalidHeader("no unit"))?;
        let unit = UnitContext::new(header?, sections, &mut AbbrevCache::new())?;

        assert_eq!(unit.name, b"a.c");
        assert_eq!(unit.base_address, 0x1000);
        assert_eq!(unit.stmt_list, Some(0x40));

        let mut cursor = unit.entries()?;
        let root = unit.read_die(&mut cursor, 0)?.ok_or(DwarfError::InvalidHeader("root"))?;
        assert_eq!(root.tag, constants::DW_TAG_compile_unit);

        let s = unit.read_die(&mut cursor, 1)?.ok_or(DwarfError::InvalidHeader("S"))?;
        assert_eq!(s.name(), Some(&b"S"[..]));
        unit.skip_children(&mut cursor)?;

        let t = unit.read_die(&mut cursor, 1)?.ok_or(DwarfError::InvalidHeader("T"))?;
        assert_eq!(t.name(), Some(&b"T"[..]));

        let member = unit.entry_at(s.offset + 3)?;
        assert_eq!(member.tag, constants::DW_TAG_member);
        assert_eq!(member.attr(constants::DW_AT_type), Some(AttrValue::UnitRef(0x0b)));

        assert!(matches!(
            unit.entry_at(0x1000),
            Err(DwarfError::InvalidReference(0x1000))
        ));

        Ok(())
    }
}

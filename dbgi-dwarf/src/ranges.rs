use std::ops::Range;

use dbgi_common::{Diagnostics, Section};
use gimli::{constants, DwAt};
use smallvec::SmallVec;

use crate::die::{Die, UnitContext};
use crate::form::AttrValue;
use crate::DwarfError;

/// Address ranges of an entry, usually just one.
pub type RangeList = SmallVec<[Range<u64>; 1]>;

/// Reads a range list from `.debug_ranges`.
///
/// Entries are relative to `base`, which is replaced by base address selection entries. Empty
/// ranges are dropped.
pub fn read_ranges(
    debug_ranges: Section<'_>,
    offset: u64,
    address_size: u8,
    mut base: u64,
) -> Result<RangeList, DwarfError> {
    let mut cursor = debug_ranges.cursor_at(offset)?;
    let selector = max_address(address_size);
    let mut ranges = RangeList::new();

    loop {
        let begin = cursor.read_uint(address_size)?;
        let end = cursor.read_uint(address_size)?;
        if begin == 0 && end == 0 {
            break;
        }
        if begin == selector {
            base = end;
            continue;
        }

        let range = base.wrapping_add(begin)..base.wrapping_add(end);
        if range.start != range.end {
            ranges.push(range);
        }
    }

    Ok(ranges)
}

/// One entry of a location list.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct LocationEntry {
    /// The addresses at which the expression is valid.
    pub range: Range<u64>,
    /// The location expression.
    pub expr: Vec<u8>,
}

/// Where a variable or frame base lives.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum Location {
    /// A single expression valid over the whole scope.
    Expr(Vec<u8>),
    /// A list of expressions, each valid in its own range.
    List(Vec<LocationEntry>),
}

impl Location {
    /// Adds `bias` to all addresses of a location list.
    pub fn rebase(&mut self, bias: u64) {
        if let Location::List(entries) = self {
            for entry in entries {
                entry.range = entry.range.start.wrapping_add(bias)..entry.range.end.wrapping_add(bias);
            }
        }
    }
}

/// Reads a location list from `.debug_loc`.
pub fn read_loclist(
    debug_loc: Section<'_>,
    offset: u64,
    address_size: u8,
    mut base: u64,
) -> Result<Vec<LocationEntry>, DwarfError> {
    let mut cursor = debug_loc.cursor_at(offset)?;
    let selector = max_address(address_size);
    let mut entries = Vec::new();

    loop {
        let begin = cursor.read_uint(address_size)?;
        let end = cursor.read_uint(address_size)?;
        if begin == 0 && end == 0 {
            break;
        }
        if begin == selector {
            base = end;
            continue;
        }

        let len = cursor.read_u16()?;
        let expr = cursor.read_bytes(len.into())?;
        if begin != end {
            entries.push(LocationEntry {
                range: base.wrapping_add(begin)..base.wrapping_add(end),
                expr: expr.to_vec(),
            });
        }
    }

    Ok(entries)
}

fn max_address(address_size: u8) -> u64 {
    match address_size {
        8 => u64::MAX,
        size => (1u64 << (u32::from(size) * 8)) - 1,
    }
}

/// Returns the address ranges covered by an entry, with `bias` applied.
///
/// Uses `DW_AT_low_pc`/`DW_AT_high_pc` if both are present, otherwise `DW_AT_ranges`. A lone
/// `DW_AT_low_pc` is only the base address of the range list. Entries starting at address zero
/// were discarded by the linker and yield no ranges. Inverted ranges are dropped with a warning.
pub fn die_ranges(
    unit: &UnitContext<'_>,
    die: &Die<'_>,
    bias: u64,
    diagnostics: &mut Diagnostics,
) -> Result<RangeList, DwarfError> {
    let mut ranges = RangeList::new();

    let low = match die.attr(constants::DW_AT_low_pc) {
        Some(AttrValue::Address(low)) => Some(low),
        _ => None,
    };
    let high = low.and_then(|low| match die.attr(constants::DW_AT_high_pc) {
        Some(AttrValue::Address(high)) => Some(high),
        Some(value) => value.udata().map(|len| low.wrapping_add(len)),
        None => None,
    });

    if let (Some(low), Some(high)) = (low, high) {
        if low != 0 {
            ranges.push(low..high);
        }
    } else if let Some(offset) = die.udata(constants::DW_AT_ranges) {
        ranges = read_ranges(
            unit.sections.debug_ranges,
            offset,
            unit.encoding().address_size,
            unit.base_address,
        )?;
        ranges.retain(|range| range.start != 0);
    }

    let before = ranges.len();
    ranges.retain(|range| range.start < range.end);
    if ranges.len() != before {
        diagnostics.warn_once(
            "inverted-range",
            unit.section.name(),
            format_args!("entry at {:#x} has an inverted address range", die.offset),
        );
    }

    for range in &mut ranges {
        *range = range.start.wrapping_add(bias)..range.end.wrapping_add(bias);
    }

    Ok(ranges)
}

/// Returns the location described by an attribute.
///
/// Expression blocks are returned as is. Constants and section offsets refer to a location list,
/// which is read relative to the unit's base address. Location lists are not rebased.
pub fn die_location(
    unit: &UnitContext<'_>,
    die: &Die<'_>,
    name: DwAt,
) -> Result<Option<Location>, DwarfError> {
    let location = match die.attr(name) {
        Some(AttrValue::Block(expr)) => Location::Expr(expr.to_vec()),
        Some(AttrValue::SecOffset(offset)) | Some(AttrValue::Udata(offset)) => {
            Location::List(read_loclist(
                unit.sections.debug_loc,
                offset,
                unit.encoding().address_size,
                unit.base_address,
            )?)
        }
        _ => return Ok(None),
    };

    Ok(Some(location))
}

#[cfg(test)]
mod tests {
    use super::*;

    use dbgi_common::Endian;
    use dbgi_testutils::Assembler;
    use similar_asserts::assert_eq;

    #[test]
    fn test_read_ranges() -> Result<(), DwarfError> {
        let mut asm = Assembler::little();
        asm.u32(0xdead)
            .u32(0x10)
            .u32(0x20)
            .u32(0x30)
            .u32(0x30)
            .u32(0xffff_ffff)
            .u32(0x5000)
            .u32(0x0)
            .u32(0x8)
            .u32(0)
            .u32(0);
        let data = asm.finish();
        let section = Section::new(".debug_ranges", &data, Endian::Little);

        let ranges = read_ranges(section, 4, 4, 0x1000)?;
        assert_eq!(ranges.as_slice(), &[0x1010..0x1020, 0x5000..0x5008]);

        Ok(())
    }

    #[test]
    fn test_unterminated_ranges() {
        let data = [0x10, 0, 0, 0, 0x20, 0, 0, 0];
        let section = Section::new(".debug_ranges", &data, Endian::Little);
        assert!(matches!(
            read_ranges(section, 0, 4, 0),
            Err(DwarfError::OutOfRange(_))
        ));
    }

    #[test]
    fn test_read_loclist() -> Result<(), DwarfError> {
        let mut asm = Assembler::little();
        asm.u64(0x0)
            .u64(0x4)
            .u16(1)
            .u8(0x50)
            .u64(u64::MAX)
            .u64(0x2000)
            .u64(0x4)
            .u64(0x10)
            .u16(2)
            .bytes(&[0x91, 0x10])
            .u64(0)
            .u64(0);
        let data = asm.finish();
        let section = Section::new(".debug_loc", &data, Endian::Little);

        let entries = read_loclist(section, 0, 8, 0x1000)?;
        assert_eq!(
            entries,
            [
                LocationEntry {
                    range: 0x1000..0x1004,
                    expr: vec![0x50],
                },
                LocationEntry {
                    range: 0x2004..0x2010,
                    expr: vec![0x91, 0x10],
                },
            ]
        );

        Ok(())
    }
}

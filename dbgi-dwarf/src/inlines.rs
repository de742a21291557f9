use std::ops::Range;

use dbgi_common::{FileId, StrId};
use gimli::constants;

use crate::die::{Die, UnitContext};
use crate::form::AttrValue;
use crate::ranges::{die_ranges, RangeList};
use crate::unit::UnitKind;
use crate::walker::{DieVisitor, Walk, WalkContext};
use crate::DwarfError;

/// The deepest nesting of inlined calls that is recorded.
pub const MAX_INLINE_DEPTH: usize = 64;

/// How many `DW_AT_abstract_origin` or `DW_AT_specification` links are followed to name an
/// inlined function.
pub const MAX_REFERENCE_DEPTH: usize = 8;

/// The name of inlined functions whose declaration cannot be reached.
pub const UNRESOLVED_INLINE: &str = "<unresolved inline>";

/// A range of code inlined from another function.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct InlineRecord {
    /// The inlined code, with load bias applied.
    pub range: Range<u64>,
    /// The name of the inlined function.
    pub name: StrId,
    /// The file containing the call site.
    pub call_file: FileId,
    /// The line of the call site, 0 if unknown.
    pub call_line: u32,
    /// The nesting level, 0 for calls inlined directly into a concrete function.
    pub level: u16,
}

/// Extracts inlined calls.
#[derive(Debug, Default)]
pub struct InlineCollector {
    /// Depths of the open `DW_TAG_inlined_subroutine` entries.
    open: Vec<usize>,
    records: Vec<InlineRecord>,
}

impl InlineCollector {
    /// Creates an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the collected records.
    pub fn finish(self) -> Vec<InlineRecord> {
        self.records
    }
}

/// Finds the name of the function an entry is an instance of.
///
/// Follows `DW_AT_abstract_origin` and `DW_AT_specification` within the unit. Returns `None` if the
/// chain leaves the unit, loops, or ends without a name.
pub fn resolve_function_name<'a>(unit: &UnitContext<'a>, die: &Die<'a>) -> Option<&'a [u8]> {
    let mut current = die.clone();

    for _ in 0..MAX_REFERENCE_DEPTH {
        if let Some(name) = current.name().or_else(|| current.linkage_name()) {
            return Some(name);
        }

        let origin = current
            .attr(constants::DW_AT_abstract_origin)
            .or_else(|| current.attr(constants::DW_AT_specification))?;
        let offset = match origin {
            AttrValue::UnitRef(offset) => offset,
            AttrValue::InfoRef(offset) if unit.header.kind == UnitKind::Compile => offset,
            _ => return None,
        };

        if offset == current.offset || !unit.header.contains(offset) {
            return None;
        }
        current = unit.entry_at(offset).ok()?;
    }

    None
}

impl<'a> DieVisitor<'a> for InlineCollector {
    fn begin_unit(
        &mut self,
        _unit: &UnitContext<'a>,
        _cx: &mut WalkContext<'_>,
    ) -> Result<(), DwarfError> {
        self.open.clear();
        Ok(())
    }

    fn on_inline_die(
        &mut self,
        unit: &UnitContext<'a>,
        die: &Die<'a>,
        cx: &mut WalkContext<'_>,
    ) -> Result<Walk, DwarfError> {
        while matches!(self.open.last(), Some(&depth) if depth >= die.depth) {
            self.open.pop();
        }

        match die.tag {
            constants::DW_TAG_compile_unit
            | constants::DW_TAG_partial_unit
            | constants::DW_TAG_namespace
            | constants::DW_TAG_subprogram
            | constants::DW_TAG_lexical_block => return Ok(Walk::Children),
            constants::DW_TAG_inlined_subroutine => {}
            _ => return Ok(Walk::Skip),
        }

        let level = self.open.len();
        if level >= MAX_INLINE_DEPTH {
            cx.diagnostics.warn_once(
                "inline-depth",
                unit.section.name(),
                format_args!("inlined calls nested deeper than {MAX_INLINE_DEPTH} are dropped"),
            );
            return Ok(Walk::Skip);
        }

        // A call with unreadable ranges still counts as a nesting level for its children.
        let ranges = die_ranges(unit, die, cx.bias, cx.diagnostics).unwrap_or_else(|error| {
            cx.diagnostics.warn(
                unit.section.name(),
                Some(die.offset),
                format_args!("dropping inlined call with bad ranges: {error}"),
            );
            RangeList::new()
        });
        if !ranges.is_empty() {
            let name = match resolve_function_name(unit, die) {
                Some(name) => cx.pools.strings.intern_bytes(name),
                None => {
                    tracing::trace!(offset = die.offset, "unresolved inline function name");
                    cx.pools.strings.intern(UNRESOLVED_INLINE)
                }
            };

            let call_file = die
                .udata(constants::DW_AT_call_file)
                .and_then(|index| cx.files.get(usize::try_from(index).ok()?).copied())
                .unwrap_or(FileId::UNKNOWN);
            let call_line = die.udata(constants::DW_AT_call_line).unwrap_or(0) as u32;

            for range in ranges {
                self.records.push(InlineRecord {
                    range,
                    name,
                    call_file,
                    call_line,
                    level: level as u16,
                });
            }
        }

        self.open.push(die.depth);
        Ok(Walk::Children)
    }

    fn end_unit(&mut self, _unit: &UnitContext<'a>, _cx: &mut WalkContext<'_>) {
        self.open.clear();
    }
}

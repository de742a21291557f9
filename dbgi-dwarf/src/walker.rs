use dbgi_common::{Diagnostics, FileId, Pools};

use crate::die::{Die, UnitContext};
use crate::line::read_file_table;
use crate::DwarfError;

/// The deepest nesting of entries that is walked. Deeper subtrees are skipped.
pub const MAX_DIE_DEPTH: usize = 256;

/// Whether a visitor wants to see the children of an entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Walk {
    /// Descend into the children.
    Children,
    /// The subtree is not interesting.
    Skip,
}

impl Walk {
    fn or(self, other: Walk) -> Walk {
        if self == Walk::Children || other == Walk::Children {
            Walk::Children
        } else {
            Walk::Skip
        }
    }
}

/// Shared state of one decoding pass over an object.
pub struct WalkContext<'p> {
    /// The string and file pools of the object.
    pub pools: &'p mut Pools,
    /// Collected problems.
    pub diagnostics: &'p mut Diagnostics,
    /// The load bias added to every address.
    pub bias: u64,
    /// The file table of the current unit's line program, indexed like `DW_AT_decl_file`.
    pub files: Vec<FileId>,
}

impl<'p> WalkContext<'p> {
    /// Creates a context over the pools and diagnostics of an object.
    pub fn new(pools: &'p mut Pools, diagnostics: &'p mut Diagnostics, bias: u64) -> Self {
        WalkContext {
            pools,
            diagnostics,
            bias,
            files: Vec::new(),
        }
    }

    fn load_files(&mut self, unit: &UnitContext<'_>) {
        self.files.clear();
        let Some(offset) = unit.stmt_list else {
            return;
        };

        match read_file_table(unit.sections.debug_line, offset, unit.comp_dir, self.pools) {
            Ok(files) => self.files = files,
            Err(error) => self.diagnostics.warn(
                ".debug_line",
                Some(offset),
                format_args!("cannot read file table: {error}"),
            ),
        }
    }
}

/// A concern that extracts information from the entries of a unit.
///
/// Every entry is passed to all three `on_*` methods, each visitor picks the tags it is interested
/// in. The children of an entry are walked if any visitor asks for them.
pub trait DieVisitor<'a> {
    /// Called before the first entry of a unit.
    fn begin_unit(
        &mut self,
        _unit: &UnitContext<'a>,
        _cx: &mut WalkContext<'_>,
    ) -> Result<(), DwarfError> {
        Ok(())
    }

    /// Called for every entry, to extract types.
    fn on_type_die(
        &mut self,
        _unit: &UnitContext<'a>,
        _die: &Die<'a>,
        _cx: &mut WalkContext<'_>,
    ) -> Result<Walk, DwarfError> {
        Ok(Walk::Skip)
    }

    /// Called for every entry, to extract variables.
    fn on_variable_die(
        &mut self,
        _unit: &UnitContext<'a>,
        _die: &Die<'a>,
        _cx: &mut WalkContext<'_>,
    ) -> Result<Walk, DwarfError> {
        Ok(Walk::Skip)
    }

    /// Called for every entry, to extract inlined calls.
    fn on_inline_die(
        &mut self,
        _unit: &UnitContext<'a>,
        _die: &Die<'a>,
        _cx: &mut WalkContext<'_>,
    ) -> Result<Walk, DwarfError> {
        Ok(Walk::Skip)
    }

    /// Called after the last entry of a unit, also if the walk failed.
    fn end_unit(&mut self, _unit: &UnitContext<'a>, _cx: &mut WalkContext<'_>) {}
}

/// Walks all entries of a unit depth-first, dispatching each to every visitor.
///
/// The walk follows the byte stream: children directly follow their parent and are terminated by
/// a null entry. Subtrees no visitor asked for are skipped via `DW_AT_sibling` if present, or by
/// skipping entries without decoding them.
pub fn walk_unit<'a>(
    unit: &UnitContext<'a>,
    cx: &mut WalkContext<'_>,
    visitors: &mut [&mut dyn DieVisitor<'a>],
) -> Result<(), DwarfError> {
    cx.load_files(unit);

    let mut result = Ok(());
    for visitor in visitors.iter_mut() {
        result = visitor.begin_unit(unit, cx);
        if result.is_err() {
            break;
        }
    }

    if result.is_ok() {
        result = walk_entries(unit, cx, visitors);
    }

    for visitor in visitors.iter_mut() {
        visitor.end_unit(unit, cx);
    }

    result
}

fn walk_entries<'a>(
    unit: &UnitContext<'a>,
    cx: &mut WalkContext<'_>,
    visitors: &mut [&mut dyn DieVisitor<'a>],
) -> Result<(), DwarfError> {
    let mut cursor = unit.entries()?;
    let mut depth = 0usize;

    while !cursor.is_empty() {
        let Some(die) = unit.read_die(&mut cursor, depth)? else {
            // A null entry closes the current list of siblings. Trailing padding at depth 0 is
            // tolerated.
            depth = depth.saturating_sub(1);
            continue;
        };

        let mut walk = Walk::Skip;
        for visitor in visitors.iter_mut() {
            walk = walk.or(visitor.on_type_die(unit, &die, cx)?);
            walk = walk.or(visitor.on_variable_die(unit, &die, cx)?);
            walk = walk.or(visitor.on_inline_die(unit, &die, cx)?);
        }

        if !die.has_children {
            continue;
        }

        if walk == Walk::Children && depth < MAX_DIE_DEPTH {
            depth += 1;
            continue;
        }

        if depth >= MAX_DIE_DEPTH {
            cx.diagnostics.warn_once(
                "die-depth",
                unit.section.name(),
                format_args!("entries nested deeper than {MAX_DIE_DEPTH} levels are skipped"),
            );
        }

        match die.sibling() {
            Some(sibling) if sibling > cursor.position() && sibling <= unit.header.end => {
                cursor.seek(sibling)?;
            }
            _ => unit.skip_children(&mut cursor)?,
        }
    }

    Ok(())
}

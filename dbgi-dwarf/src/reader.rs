use std::collections::HashSet;

use dbgi_common::{Diagnostics, Pools, Section};

use crate::die::{AbbrevCache, UnitContext};
use crate::inlines::{InlineCollector, InlineRecord};
use crate::line::{sequential_line_programs, LineProgram, LineRow};
use crate::type_collector::TypeCollector;
use crate::types::{DedupOptions, DedupStats, TypeArena};
use crate::unit::UnitHeaders;
use crate::variables::{VariableCollector, VariableRecord};
use crate::walker::{walk_unit, DieVisitor, WalkContext};
use crate::DwarfSections;

/// Controls what [`read_dwarf`] extracts.
#[derive(Clone, Copy, Debug)]
pub struct DwarfOptions {
    /// The load bias added to every address.
    pub bias: u64,
    /// Extract types and variables.
    pub read_types_and_variables: bool,
    /// Extract inlined calls.
    pub read_inlines: bool,
    /// Options for type deduplication.
    pub dedup: DedupOptions,
}

impl Default for DwarfOptions {
    fn default() -> Self {
        DwarfOptions {
            bias: 0,
            read_types_and_variables: false,
            read_inlines: true,
            dedup: DedupOptions::default(),
        }
    }
}

/// Everything extracted from the DWARF sections of one object.
#[derive(Clone, Debug, Default)]
pub struct DwarfOutput {
    /// Line rows of all units, in program order.
    pub lines: Vec<LineRow>,
    /// Inlined calls of all units.
    pub inlines: Vec<InlineRecord>,
    /// Deduplicated and compacted types.
    pub types: TypeArena,
    /// Variables, with types resolved against `types`.
    pub variables: Vec<VariableRecord>,
    /// Statistics of the type deduplication.
    pub dedup: DedupStats,
}

/// The root attributes of a compilation unit needed to find its line program.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct UnitSummary<'a> {
    /// The section offset of the unit header.
    pub offset: u64,
    /// The name of the unit, usually the primary source file.
    pub name: &'a [u8],
    /// The compilation directory.
    pub comp_dir: &'a [u8],
    /// The offset of the unit's line program.
    pub stmt_list: Option<u64>,
}

impl<'a> From<&UnitContext<'a>> for UnitSummary<'a> {
    fn from(unit: &UnitContext<'a>) -> Self {
        UnitSummary {
            offset: unit.header.offset,
            name: unit.name,
            comp_dir: unit.comp_dir,
            stmt_list: unit.stmt_list,
        }
    }
}

/// Loads all units of `.debug_info`, or of `.debug_types` if `is_types` is set.
///
/// Units that cannot be loaded are reported and skipped.
fn load_units<'a>(
    sections: DwarfSections<'a>,
    is_types: bool,
    abbrevs: &mut AbbrevCache,
    diagnostics: &mut Diagnostics,
) -> Vec<UnitContext<'a>> {
    let section = if is_types {
        sections.debug_types
    } else {
        sections.debug_info
    };

    let mut units = Vec::new();
    for (offset, header) in UnitHeaders::new(section, is_types) {
        match header.and_then(|header| UnitContext::new(header, sections, abbrevs)) {
            Ok(unit) => units.push(unit),
            Err(error) => {
                diagnostics.error(
                    section.name(),
                    Some(offset),
                    format_args!("skipping unit: {error}"),
                );
            }
        }
    }

    units
}

/// Collects the summaries of all compilation units.
pub fn unit_summaries<'a>(
    sections: DwarfSections<'a>,
    diagnostics: &mut Diagnostics,
) -> Vec<UnitSummary<'a>> {
    load_units(sections, false, &mut AbbrevCache::new(), diagnostics)
        .iter()
        .map(UnitSummary::from)
        .collect()
}

fn run_program<'a>(
    debug_line: Section<'a>,
    offset: u64,
    comp_dir: &'a [u8],
    bias: u64,
    pools: &mut Pools,
    diagnostics: &mut Diagnostics,
    rows: &mut Vec<LineRow>,
) {
    let result = LineProgram::parse(debug_line, offset)
        .and_then(|program| program.run(comp_dir, bias, pools, diagnostics, rows));
    if let Err(error) = result {
        diagnostics.error(
            debug_line.name(),
            Some(offset),
            format_args!("line program: {error}"),
        );
    }
}

/// Runs the line programs of all units.
///
/// Each distinct program is run once, with the compilation directory of the first unit referring
/// to it. Without units, all programs of `.debug_line` are run in section order.
fn read_lines(
    sections: DwarfSections<'_>,
    summaries: &[UnitSummary<'_>],
    bias: u64,
    pools: &mut Pools,
    diagnostics: &mut Diagnostics,
) -> Vec<LineRow> {
    let debug_line = sections.debug_line;
    let mut rows = Vec::new();

    if summaries.is_empty() {
        let offsets: Vec<u64> = sequential_line_programs(debug_line)
            .map(|(offset, _)| offset)
            .collect();
        for offset in offsets {
            run_program(debug_line, offset, b"", bias, pools, diagnostics, &mut rows);
        }
    } else {
        let mut seen = HashSet::new();
        for summary in summaries {
            let Some(offset) = summary.stmt_list else {
                continue;
            };
            if seen.insert(offset) {
                run_program(
                    debug_line,
                    offset,
                    summary.comp_dir,
                    bias,
                    pools,
                    diagnostics,
                    &mut rows,
                );
            }
        }
    }

    rows
}

/// Walks the entries of the given units, reporting units that fail to decode.
fn walk_units<'a>(
    units: &[UnitContext<'a>],
    cx: &mut WalkContext<'_>,
    visitors: &mut [&mut dyn DieVisitor<'a>],
) {
    for unit in units {
        if let Err(error) = walk_unit(unit, cx, visitors) {
            cx.diagnostics.error(
                unit.section.name(),
                Some(unit.header.offset),
                format_args!("skipping rest of unit: {error}"),
            );
        }
    }
}

/// Extracts lines, inlined calls, types and variables from the DWARF sections of an object.
///
/// Decoding errors never fail the whole object. A unit, line program or sequence that cannot be
/// decoded is reported to `diagnostics` and skipped, everything else is still extracted.
#[tracing::instrument(level = "trace", skip_all)]
pub fn read_dwarf(
    sections: DwarfSections<'_>,
    options: &DwarfOptions,
    pools: &mut Pools,
    diagnostics: &mut Diagnostics,
) -> DwarfOutput {
    let mut abbrevs = AbbrevCache::new();
    let units = load_units(sections, false, &mut abbrevs, diagnostics);
    let summaries: Vec<_> = units.iter().map(UnitSummary::from).collect();
    tracing::debug!(units = units.len(), "loaded compilation units");

    let mut output = DwarfOutput {
        lines: read_lines(sections, &summaries, options.bias, pools, diagnostics),
        ..DwarfOutput::default()
    };

    if !options.read_types_and_variables && !options.read_inlines {
        return output;
    }

    let mut types = TypeCollector::new();
    let mut variables = VariableCollector::new();
    let mut inlines = InlineCollector::new();

    {
        let mut cx = WalkContext::new(pools, diagnostics, options.bias);

        if options.read_types_and_variables {
            let type_units = load_units(sections, true, &mut abbrevs, cx.diagnostics);
            walk_units(&type_units, &mut cx, &mut [&mut types]);
        }

        let mut visitors: Vec<&mut dyn DieVisitor<'_>> = Vec::with_capacity(3);
        if options.read_types_and_variables {
            visitors.push(&mut types);
            visitors.push(&mut variables);
        }
        if options.read_inlines {
            visitors.push(&mut inlines);
        }
        walk_units(&units, &mut cx, &mut visitors);
    }

    output.inlines = inlines.finish();

    if options.read_types_and_variables {
        let mut variables = variables.finish(&types);
        let mut arena = types.finish();
        output.dedup = arena.dedup_with(options.dedup);
        arena.compact();

        for variable in &mut variables {
            variable.ty = arena.resolve(variable.ty);
        }

        output.types = arena;
        output.variables = variables;
    }

    output
}

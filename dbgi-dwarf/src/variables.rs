use dbgi_common::{FileId, StrId};
use gimli::constants;

use crate::die::{Die, UnitContext};
use crate::form::AttrValue;
use crate::ranges::{die_location, die_ranges, Location, RangeList};
use crate::type_collector::{die_key, TypeCollector};
use crate::types::TypeKey;
use crate::walker::{DieVisitor, Walk, WalkContext};
use crate::DwarfError;

/// How many `DW_AT_abstract_origin` or `DW_AT_specification` links are followed to find the name
/// and type of a variable.
const MAX_ORIGIN_CHAIN: usize = 2;

/// A variable or parameter with the address ranges in which it is visible.
#[derive(Clone, Debug, PartialEq)]
pub struct VariableRecord {
    /// The variable name.
    pub name: StrId,
    /// The type of the variable.
    pub ty: TypeKey,
    /// Where the variable is stored.
    pub location: Location,
    /// The frame base of the enclosing function, for locations relative to it.
    pub frame_base: Option<Location>,
    /// The scope nesting level: 0 for globals, 1 for function scope, and one more for every
    /// nested block.
    pub level: u32,
    /// The code ranges in which the variable is in scope, with load bias applied.
    pub ranges: RangeList,
    /// The file of the declaration.
    pub file: FileId,
    /// The line of the declaration, 0 if unknown.
    pub line: u32,
}

/// An open scope during the walk.
#[derive(Debug)]
struct Scope {
    depth: usize,
    ranges: RangeList,
    frame_base: Option<Location>,
    is_function: bool,
}

/// Extracts global and local variables.
#[derive(Debug, Default)]
pub struct VariableCollector {
    scopes: Vec<Scope>,
    records: Vec<VariableRecord>,
    /// Records whose type is referenced by signature.
    signature_types: Vec<(usize, u64)>,
}

impl VariableCollector {
    /// Creates an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the collected records.
    ///
    /// Types referenced by signature are resolved against the type units seen by `types`.
    pub fn finish(mut self, types: &TypeCollector) -> Vec<VariableRecord> {
        for (index, signature) in self.signature_types {
            self.records[index].ty = types.signature_target(signature);
        }
        self.records
    }

    fn open_scope(
        &mut self,
        unit: &UnitContext<'_>,
        die: &Die<'_>,
        cx: &mut WalkContext<'_>,
        is_function: bool,
    ) -> Walk {
        let ranges = match die_ranges(unit, die, cx.bias, cx.diagnostics) {
            Ok(ranges) => ranges,
            Err(error) => {
                cx.diagnostics.warn(
                    unit.section.name(),
                    Some(die.offset),
                    format_args!("skipping variables of scope with bad ranges: {error}"),
                );
                return Walk::Skip;
            }
        };
        let frame_base = if is_function {
            die_location(unit, die, constants::DW_AT_frame_base)
                .ok()
                .flatten()
                .map(|mut location| {
                    location.rebase(cx.bias);
                    location
                })
        } else {
            None
        };

        self.scopes.push(Scope {
            depth: die.depth,
            ranges,
            frame_base,
            is_function,
        });
        Walk::Children
    }

    fn add_variable<'a>(
        &mut self,
        unit: &UnitContext<'a>,
        die: &Die<'a>,
        cx: &mut WalkContext<'_>,
    ) {
        let Some(top) = self.scopes.last() else {
            return;
        };
        let is_global = top.depth == 0;
        if !is_global && top.depth + 1 != die.depth {
            return;
        }

        let mut location = match die_location(unit, die, constants::DW_AT_location) {
            Ok(Some(location)) => location,
            Ok(None) => return,
            Err(error) => {
                cx.diagnostics.warn(
                    unit.section.name(),
                    Some(die.offset),
                    format_args!("skipping variable with bad location: {error}"),
                );
                return;
            }
        };
        location.rebase(cx.bias);
        if matches!(&location, Location::List(entries) if entries.is_empty()) {
            return;
        }

        // Name and type may live on the declaration this entry completes.
        let mut name = die.name();
        let mut ty = die.attr(constants::DW_AT_type);
        let mut current = die.clone();
        for _ in 0..MAX_ORIGIN_CHAIN {
            if name.is_some() && ty.is_some() {
                break;
            }
            let origin = current
                .attr(constants::DW_AT_abstract_origin)
                .or_else(|| current.attr(constants::DW_AT_specification));
            let Some(AttrValue::UnitRef(offset)) = origin else {
                break;
            };
            let Ok(origin) = unit.entry_at(offset) else {
                break;
            };
            name = name.or_else(|| origin.name());
            ty = ty.or_else(|| origin.attr(constants::DW_AT_type));
            current = origin;
        }

        let (Some(name), Some(ty)) = (name, ty) else {
            return;
        };

        let (level, ranges, frame_base) = if is_global {
            let mut ranges = RangeList::new();
            ranges.push(0..u64::MAX);
            (0, ranges, None)
        } else {
            let Some(function) = self.scopes.iter().rev().find(|scope| scope.is_function) else {
                cx.diagnostics.warn_once(
                    "variable-without-function",
                    unit.section.name(),
                    "local variable outside of any function is dropped",
                );
                return;
            };
            if top.ranges.is_empty() {
                return;
            }
            let level = (self.scopes.len() - 1) as u32;
            (level, top.ranges.clone(), function.frame_base.clone())
        };

        let ty = match ty {
            AttrValue::UnitRef(offset) => die_key(unit, offset),
            AttrValue::InfoRef(offset) => TypeKey::info(offset),
            AttrValue::Signature(signature) => {
                self.signature_types.push((self.records.len(), signature));
                TypeKey::UNKNOWN
            }
            _ => TypeKey::UNKNOWN,
        };

        let file = die
            .udata(constants::DW_AT_decl_file)
            .and_then(|index| cx.files.get(usize::try_from(index).ok()?).copied())
            .unwrap_or(FileId::UNKNOWN);

        self.records.push(VariableRecord {
            name: cx.pools.strings.intern_bytes(name),
            ty,
            location,
            frame_base,
            level,
            ranges,
            file,
            line: die.udata(constants::DW_AT_decl_line).unwrap_or(0) as u32,
        });
    }
}

impl<'a> DieVisitor<'a> for VariableCollector {
    fn begin_unit(
        &mut self,
        _unit: &UnitContext<'a>,
        _cx: &mut WalkContext<'_>,
    ) -> Result<(), DwarfError> {
        self.scopes.clear();
        Ok(())
    }

    fn on_variable_die(
        &mut self,
        unit: &UnitContext<'a>,
        die: &Die<'a>,
        cx: &mut WalkContext<'_>,
    ) -> Result<Walk, DwarfError> {
        while matches!(self.scopes.last(), Some(scope) if scope.depth >= die.depth) {
            self.scopes.pop();
        }

        match die.tag {
            constants::DW_TAG_compile_unit | constants::DW_TAG_partial_unit => {
                self.scopes.push(Scope {
                    depth: die.depth,
                    ranges: RangeList::new(),
                    frame_base: None,
                    is_function: false,
                });
                Ok(Walk::Children)
            }
            constants::DW_TAG_namespace => Ok(Walk::Children),
            constants::DW_TAG_subprogram => Ok(self.open_scope(unit, die, cx, true)),
            constants::DW_TAG_lexical_block | constants::DW_TAG_inlined_subroutine => {
                Ok(self.open_scope(unit, die, cx, false))
            }
            constants::DW_TAG_variable | constants::DW_TAG_formal_parameter => {
                self.add_variable(unit, die, cx);
                Ok(Walk::Skip)
            }
            _ => Ok(Walk::Skip),
        }
    }

    fn end_unit(&mut self, _unit: &UnitContext<'a>, _cx: &mut WalkContext<'_>) {
        self.scopes.clear();
    }
}

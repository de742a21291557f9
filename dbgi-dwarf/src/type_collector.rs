use std::collections::HashMap;

use dbgi_common::{Cursor, Endian};
use gimli::constants;

use crate::die::{Die, UnitContext};
use crate::form::AttrValue;
use crate::types::{CompositeKind, PointerKind, Qualifier, TypeArena, TypeKey, TypeKind};
use crate::unit::UnitKind;
use crate::walker::{DieVisitor, Walk, WalkContext};
use crate::DwarfError;

/// Returns the key of the entry at `offset` in the unit's section.
pub fn die_key(unit: &UnitContext<'_>, offset: u64) -> TypeKey {
    match unit.header.kind {
        UnitKind::Compile => TypeKey::info(offset),
        UnitKind::Type { .. } => TypeKey::types(offset),
    }
}

/// Extracts type entities into a [`TypeArena`].
#[derive(Debug, Default)]
pub struct TypeCollector {
    arena: TypeArena,
    /// Open aggregates as `(depth, arena position)`.
    parents: Vec<(usize, usize)>,
    /// Type units by signature.
    signatures: HashMap<u64, TypeKey>,
    /// Signatures referenced so far, with their placeholder keys.
    signature_refs: HashMap<u64, TypeKey>,
}

impl TypeCollector {
    /// Creates an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Converts a type reference into a key.
    ///
    /// A missing reference means `void`. References into the alternate debug file are not
    /// followed.
    pub fn type_ref(&mut self, unit: &UnitContext<'_>, value: Option<AttrValue<'_>>) -> TypeKey {
        match value {
            None => TypeKey::VOID,
            Some(AttrValue::UnitRef(offset)) => die_key(unit, offset),
            Some(AttrValue::InfoRef(offset)) => TypeKey::info(offset),
            Some(AttrValue::Signature(signature)) => {
                let next = self.signature_refs.len() as u64;
                *self
                    .signature_refs
                    .entry(signature)
                    .or_insert_with(|| TypeKey::signature(next))
            }
            Some(_) => TypeKey::UNKNOWN,
        }
    }

    /// Returns the key of the type unit with the given signature.
    pub fn signature_target(&self, signature: u64) -> TypeKey {
        self.signatures
            .get(&signature)
            .copied()
            .unwrap_or(TypeKey::UNKNOWN)
    }

    /// Resolves signature references and returns the collected types.
    pub fn finish(self) -> TypeArena {
        let mut arena = self.arena;
        for (&signature, &placeholder) in &self.signature_refs {
            let target = self
                .signatures
                .get(&signature)
                .copied()
                .unwrap_or(TypeKey::UNKNOWN);
            arena.push(placeholder, TypeKind::Forward(target));
        }

        arena
    }

    fn parent_at(&mut self, depth: usize) -> Option<&mut TypeKind> {
        match self.parents.last() {
            Some(&(parent_depth, index)) if parent_depth + 1 == depth => self.arena.at_mut(index),
            _ => None,
        }
    }

    fn add(&mut self, unit: &UnitContext<'_>, die: &Die<'_>, kind: TypeKind) -> usize {
        self.arena.push(die_key(unit, die.offset), kind)
    }
}

fn member_offset(die: &Die<'_>, endian: Endian) -> Option<u64> {
    match die.attr(constants::DW_AT_data_member_location)? {
        AttrValue::Block(expr) => {
            // Only `DW_OP_plus_uconst N` is a constant offset.
            let mut cursor = Cursor::new(expr, endian);
            if cursor.read_u8().ok()? != constants::DW_OP_plus_uconst.0 {
                return None;
            }
            let offset = cursor.read_uleb128().ok()?;
            cursor.is_empty().then_some(offset)
        }
        value => value.udata(),
    }
}

impl<'a> DieVisitor<'a> for TypeCollector {
    fn begin_unit(
        &mut self,
        unit: &UnitContext<'a>,
        _cx: &mut WalkContext<'_>,
    ) -> Result<(), DwarfError> {
        self.parents.clear();
        if let UnitKind::Type {
            signature,
            type_offset,
        } = unit.header.kind
        {
            self.signatures
                .insert(signature, TypeKey::types(type_offset));
        }
        Ok(())
    }

    fn on_type_die(
        &mut self,
        unit: &UnitContext<'a>,
        die: &Die<'a>,
        cx: &mut WalkContext<'_>,
    ) -> Result<Walk, DwarfError> {
        while matches!(self.parents.last(), Some(&(depth, _)) if depth >= die.depth) {
            self.parents.pop();
        }

        let name = cx.pools.strings.intern_bytes(die.name().unwrap_or_default());
        let size = die.udata(constants::DW_AT_byte_size).unwrap_or(0);
        let target = self.type_ref(unit, die.attr(constants::DW_AT_type));

        let pointer = |kind| TypeKind::Pointer { kind, size, target };
        let qualifier = |qual| TypeKind::Qualifier { qual, target };
        let composite = |kind| TypeKind::Struct {
            name,
            size,
            kind,
            complete: !die.flag(constants::DW_AT_declaration),
            fields: Vec::new(),
        };

        let kind = match die.tag {
            constants::DW_TAG_compile_unit
            | constants::DW_TAG_partial_unit
            | constants::DW_TAG_type_unit
            | constants::DW_TAG_namespace
            | constants::DW_TAG_subprogram
            | constants::DW_TAG_lexical_block => return Ok(Walk::Children),

            constants::DW_TAG_base_type => TypeKind::Base {
                name,
                size,
                encoding: die.udata(constants::DW_AT_encoding).unwrap_or(0) as u8,
            },
            constants::DW_TAG_unspecified_type => TypeKind::Base {
                name,
                size,
                encoding: 0,
            },
            constants::DW_TAG_pointer_type => pointer(PointerKind::Pointer),
            constants::DW_TAG_reference_type => pointer(PointerKind::Reference),
            constants::DW_TAG_rvalue_reference_type => pointer(PointerKind::RvalueReference),
            constants::DW_TAG_ptr_to_member_type => pointer(PointerKind::Member),
            constants::DW_TAG_const_type => qualifier(Qualifier::Const),
            constants::DW_TAG_volatile_type => qualifier(Qualifier::Volatile),
            constants::DW_TAG_restrict_type => qualifier(Qualifier::Restrict),
            constants::DW_TAG_atomic_type => qualifier(Qualifier::Atomic),
            constants::DW_TAG_typedef => TypeKind::Typedef { name, target },
            constants::DW_TAG_structure_type => composite(CompositeKind::Struct),
            constants::DW_TAG_class_type => composite(CompositeKind::Class),
            constants::DW_TAG_union_type => composite(CompositeKind::Union),
            constants::DW_TAG_enumeration_type => TypeKind::Enum {
                name,
                size,
                enumerators: Vec::new(),
            },
            constants::DW_TAG_array_type => TypeKind::Array {
                element: target,
                bounds: Vec::new(),
            },
            constants::DW_TAG_subroutine_type => TypeKind::Function {
                ret: target,
                params: Vec::new(),
                variadic: false,
            },

            constants::DW_TAG_member => {
                let offset = member_offset(die, unit.section.endian());
                let key = die_key(unit, die.offset);
                if let Some(TypeKind::Struct { fields, .. }) = self.parent_at(die.depth) {
                    fields.push(key);
                }
                self.add(unit, die, TypeKind::Field { name, target, offset });
                return Ok(Walk::Skip);
            }
            constants::DW_TAG_enumerator => {
                let value = die.sdata(constants::DW_AT_const_value).unwrap_or(0);
                let key = die_key(unit, die.offset);
                if let Some(TypeKind::Enum { enumerators, .. }) = self.parent_at(die.depth) {
                    enumerators.push(key);
                }
                self.add(unit, die, TypeKind::Enumerator { name, value });
                return Ok(Walk::Skip);
            }
            constants::DW_TAG_subrange_type => {
                let lower = die.sdata(constants::DW_AT_lower_bound).unwrap_or(0);
                let upper = die.sdata(constants::DW_AT_upper_bound).or_else(|| {
                    let count = die.sdata(constants::DW_AT_count)?;
                    lower.checked_add(count)?.checked_sub(1)
                });
                let key = die_key(unit, die.offset);
                if let Some(TypeKind::Array { bounds, .. }) = self.parent_at(die.depth) {
                    bounds.push(key);
                }
                self.add(unit, die, TypeKind::Bound { lower, upper });
                return Ok(Walk::Skip);
            }
            constants::DW_TAG_formal_parameter => {
                if let Some(TypeKind::Function { params, .. }) = self.parent_at(die.depth) {
                    params.push(target);
                }
                return Ok(Walk::Skip);
            }
            constants::DW_TAG_unspecified_parameters => {
                if let Some(TypeKind::Function { variadic, .. }) = self.parent_at(die.depth) {
                    *variadic = true;
                }
                return Ok(Walk::Skip);
            }

            _ => return Ok(Walk::Skip),
        };

        let is_parent = matches!(
            kind,
            TypeKind::Struct { .. }
                | TypeKind::Enum { .. }
                | TypeKind::Array { .. }
                | TypeKind::Function { .. }
        );
        let index = self.add(unit, die, kind);

        if is_parent && die.has_children {
            self.parents.push((die.depth, index));
            Ok(Walk::Children)
        } else {
            Ok(Walk::Skip)
        }
    }
}

//! Decoding of DWARF debugging information.
//!
//! This crate turns the raw `.debug_*` sections of an object into flat records:
//!
//!  - [`LineProgram`] interprets line-number programs into [`LineRow`]s.
//!  - [`walk_unit`] drives a single depth-first traversal over the debugging information entries of
//!    a unit, dispatching every entry to a set of [`DieVisitor`]s. The [`TypeCollector`],
//!    [`VariableCollector`] and [`InlineCollector`] extract types, variables and inlined calls
//!    from the same traversal.
//!  - [`TypeArena`] holds the extracted types and deduplicates structurally identical entities.
//!  - [`read_dwarf`] runs all of the above over the sections of one object, converting errors into
//!    diagnostics at unit and sequence boundaries.
//!
//! # Background
//!
//! DWARF stores debug information per compilation unit. Each unit is a tree of entries whose shape
//! is described by an abbreviation table, so the tree can only be walked by decoding it in order.
//! Line information is stored separately, as a bytecode program for a state machine that emits
//! one row per instruction boundary.
//!
//! Only DWARF versions 2 to 4 are supported. Units of other versions are skipped with a
//! diagnostic.

#![warn(missing_docs)]

use dbgi_common::{Endian, OutOfRange, Section};
use thiserror::Error;

mod abbrev;
mod die;
mod form;
mod inlines;
mod line;
mod ranges;
mod reader;
mod type_collector;
mod types;
mod unit;
mod variables;
mod walker;

pub use crate::abbrev::*;
pub use crate::die::*;
pub use crate::form::*;
pub use crate::inlines::*;
pub use crate::line::*;
pub use crate::ranges::*;
pub use crate::reader::*;
pub use crate::type_collector::*;
pub use crate::types::*;
pub use crate::unit::*;
pub use crate::variables::*;
pub use crate::walker::*;

/// An error raised while decoding DWARF.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum DwarfError {
    /// A read extended past the end of its section or unit.
    #[error("unexpected end of data")]
    OutOfRange(#[from] OutOfRange),

    /// A unit or line program declared a version that is not supported.
    #[error("unsupported DWARF version {0}")]
    UnsupportedVersion(u16),

    /// A declared length runs past the end of the containing section.
    #[error("length {length:#x} exceeds the {available:#x} bytes left in the section")]
    LengthExceedsSection {
        /// The declared length.
        length: u64,
        /// The number of bytes actually available.
        available: u64,
    },

    /// A header field holds an implausible value.
    #[error("invalid header: {0}")]
    InvalidHeader(&'static str),

    /// A unit header declared an address size that cannot be decoded.
    #[error("unsupported address size {0}")]
    UnsupportedAddressSize(u8),

    /// An entry refers to an abbreviation code that is not in the unit's table.
    #[error("unknown abbreviation code {0}")]
    UnknownAbbreviation(u64),

    /// An attribute uses a form that cannot be decoded.
    #[error("unsupported attribute form {0:#x}")]
    UnsupportedForm(u16),

    /// A reference points outside of the data it may refer to.
    #[error("invalid reference to offset {0:#x}")]
    InvalidReference(u64),
}

/// The sections of an alternate debug file referenced through `.gnu_debugaltlink`.
#[derive(Clone, Copy, Debug)]
pub struct AltSections<'a> {
    /// The alternate `.debug_info` section.
    pub debug_info: Section<'a>,
    /// The alternate `.debug_abbrev` section.
    pub debug_abbrev: Section<'a>,
    /// The alternate `.debug_str` section.
    pub debug_str: Section<'a>,
}

/// The DWARF sections of one object.
///
/// Missing sections are represented by empty sections.
#[derive(Clone, Copy, Debug)]
pub struct DwarfSections<'a> {
    /// Debugging information entries of compilation units.
    pub debug_info: Section<'a>,
    /// Debugging information entries of type units.
    pub debug_types: Section<'a>,
    /// Abbreviation tables.
    pub debug_abbrev: Section<'a>,
    /// Strings referenced by `DW_FORM_strp`.
    pub debug_str: Section<'a>,
    /// Line-number programs.
    pub debug_line: Section<'a>,
    /// Non-contiguous address ranges.
    pub debug_ranges: Section<'a>,
    /// Location lists.
    pub debug_loc: Section<'a>,
    /// Sections of the alternate debug file, if one was found.
    pub alt: Option<AltSections<'a>>,
}

impl<'a> DwarfSections<'a> {
    /// Creates a set of empty sections.
    pub fn empty(endian: Endian) -> Self {
        DwarfSections {
            debug_info: Section::empty(".debug_info", endian),
            debug_types: Section::empty(".debug_types", endian),
            debug_abbrev: Section::empty(".debug_abbrev", endian),
            debug_str: Section::empty(".debug_str", endian),
            debug_line: Section::empty(".debug_line", endian),
            debug_ranges: Section::empty(".debug_ranges", endian),
            debug_loc: Section::empty(".debug_loc", endian),
            alt: None,
        }
    }

    /// The byte order of the sections.
    pub fn endian(&self) -> Endian {
        self.debug_info.endian()
    }
}

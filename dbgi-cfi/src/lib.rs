//! Handling of Call Frame Information (stack frame info).
//!
//! The root type exposed by this crate is [`CfiReader`], which interprets the call frame
//! information of an object and summarizes it into [`CfiRecord`]s: address ranges paired with an
//! [`UnwindRecipe`] that tells an unwinder how to recover the caller's registers.
//!
//! # Background
//!
//! Call Frame Information (CFI) is used by unwinders to walk the stack. When the executable was
//! compiled with frame pointer omission, the call stack does not contain sufficient information
//! to resolve frames on its own. CFI contains programs that compute, for every instruction, the
//! canonical frame address (CFA) and where the caller's registers were saved.
//!
//! Two encodings are supported:
//!
//!  - DWARF CFI from `.eh_frame` and `.debug_frame`. Each frame description entry (FDE) carries a
//!    bytecode program that is run by the rule machine in [`CfiMachine`].
//!  - The ARM exception handling index in `.ARM.exidx` and `.ARM.extab`. Its compact unwind
//!    instructions are first expanded into an equivalent DWARF program, then run by the same
//!    machine.
//!
//! Recipes only describe the registers an unwinder needs on the target CPU family: the stack
//! pointer, the frame pointer, the return address and a few architecture specific extras.
//! Expressions that recipes refer to are stored once in an [`ExprPool`].

#![warn(missing_docs)]

use std::error::Error;
use std::fmt;

use dbgi_common::OutOfRange;
use thiserror::Error;

mod encoding;
mod entries;
mod exidx;
mod expr;
mod machine;
mod reader;
mod recipe;

pub use crate::encoding::*;
pub use crate::entries::*;
pub use crate::exidx::*;
pub use crate::expr::*;
pub use crate::machine::*;
pub use crate::reader::*;
pub use crate::recipe::*;

/// The error type for [`CfiError`].
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CfiErrorKind {
    /// An entry extends past the end of its section.
    Truncated,

    /// A common information entry is malformed or has an unsupported version.
    BadCie,

    /// A frame description entry is malformed or refers to a missing CIE.
    BadFde,

    /// A pointer uses an encoding that cannot be decoded.
    BadPointerEncoding,

    /// The augmentation string of a CIE contains an unknown character.
    UnsupportedAugmentation,

    /// A call frame instruction is unknown or has invalid operands.
    BadInstruction,

    /// `DW_CFA_remember_state` was nested deeper than the state stack allows.
    StateStackOverflow,

    /// `DW_CFA_restore_state` was executed without a remembered state.
    StateStackUnderflow,

    /// A DWARF expression cannot be converted or evaluated.
    BadExpression,

    /// An ARM exception index entry is malformed.
    BadExidx,
}

impl fmt::Display for CfiErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => write!(f, "unexpected end of cfi data"),
            Self::BadCie => write!(f, "bad common information entry"),
            Self::BadFde => write!(f, "bad frame description entry"),
            Self::BadPointerEncoding => write!(f, "bad pointer encoding"),
            Self::UnsupportedAugmentation => write!(f, "unsupported augmentation"),
            Self::BadInstruction => write!(f, "bad call frame instruction"),
            Self::StateStackOverflow => write!(f, "state stack overflow"),
            Self::StateStackUnderflow => write!(f, "state stack underflow"),
            Self::BadExpression => write!(f, "bad cfi expression"),
            Self::BadExidx => write!(f, "bad exception index entry"),
        }
    }
}

/// An error returned while decoding call frame information.
#[derive(Debug, Error)]
#[error("{kind}")]
pub struct CfiError {
    kind: CfiErrorKind,
    #[source]
    source: Option<Box<dyn Error + Send + Sync + 'static>>,
}

impl CfiError {
    /// Creates a new CFI error from a known kind of error as well as an arbitrary error payload.
    pub fn new<E>(kind: CfiErrorKind, source: E) -> Self
    where
        E: Into<Box<dyn Error + Send + Sync>>,
    {
        let source = Some(source.into());
        Self { kind, source }
    }

    /// Returns the corresponding [`CfiErrorKind`] for this error.
    pub fn kind(&self) -> CfiErrorKind {
        self.kind
    }
}

impl From<CfiErrorKind> for CfiError {
    fn from(kind: CfiErrorKind) -> Self {
        Self { kind, source: None }
    }
}

impl From<OutOfRange> for CfiError {
    fn from(e: OutOfRange) -> Self {
        Self::new(CfiErrorKind::Truncated, e)
    }
}

/// The longest address range a single record may cover.
///
/// Larger ranges are almost certainly the result of corrupt input.
pub const MAX_CFI_RANGE: u64 = 5_000_000;

/// Options for interpreting call frame information.
#[derive(Clone, Copy, Debug)]
pub struct CfiOptions {
    /// How many rule sets `DW_CFA_remember_state` can save.
    ///
    /// Exceeding the depth stops summarizing the current FDE. Records summarized before that are
    /// kept.
    pub state_stack_depth: usize,
    /// The longest address range a single record may cover.
    pub max_range: u64,
}

impl Default for CfiOptions {
    fn default() -> Self {
        CfiOptions {
            state_stack_depth: 4,
            max_range: MAX_CFI_RANGE,
        }
    }
}

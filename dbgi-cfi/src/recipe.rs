use std::fmt;
use std::ops::Range;

use dbgi_common::CpuFamily;
use smallvec::SmallVec;

use crate::expr::{register_name, CfiExpr, ExprId, ExprPool};
use crate::machine::{CfaRule, FrameParams, RegRule, RuleSet};

/// How the canonical frame address of a frame is computed.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum CfaHow {
    /// The CFA cannot be computed.
    Unknown,
    /// Stack pointer plus offset.
    SpRel(i64),
    /// Frame pointer plus offset.
    FpRel(i64),
    /// Another register plus offset.
    RegRel {
        /// The base register.
        register: u16,
        /// The offset added to the register value.
        offset: i64,
    },
    /// Computed by an expression.
    Expr(ExprId),
}

/// How a register of the calling frame is recovered.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum RegHow {
    /// The value cannot be recovered.
    Unknown,
    /// The register keeps its value.
    Same,
    /// The value is `CFA + offset`.
    CfaRel(i64),
    /// The value is loaded from `CFA + offset`.
    MemCfaRel(i64),
    /// The value is computed by an expression.
    Expr(ExprId),
}

/// Instructions to recover the caller's registers at an address.
///
/// Recipes cover the registers an unwinder needs: the return address, stack pointer, frame pointer
/// and the extra registers of [`CpuFamily::extra_unwind_registers`].
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct UnwindRecipe {
    /// How to compute the CFA.
    pub cfa: CfaHow,
    /// How to recover the return address.
    pub ra: RegHow,
    /// How to recover the stack pointer.
    pub sp: RegHow,
    /// How to recover the frame pointer.
    pub fp: RegHow,
    /// Extra registers that do not keep their value.
    pub extra: SmallVec<[(u16, RegHow); 2]>,
}

impl UnwindRecipe {
    /// The recipe of addresses without call frame information.
    pub fn unknown() -> Self {
        UnwindRecipe {
            cfa: CfaHow::Unknown,
            ra: RegHow::Unknown,
            sp: RegHow::Unknown,
            fp: RegHow::Unknown,
            extra: SmallVec::new(),
        }
    }

    /// Returns `true` if this recipe cannot unwind.
    pub fn is_unknown(&self) -> bool {
        self.cfa == CfaHow::Unknown
    }

    /// Returns a rendering that resolves expressions and register names.
    pub fn display<'a>(&'a self, pool: &'a ExprPool, cpu: CpuFamily) -> RecipeDisplay<'a> {
        RecipeDisplay {
            recipe: self,
            pool: Some(pool),
            cpu,
        }
    }
}

impl Default for UnwindRecipe {
    fn default() -> Self {
        Self::unknown()
    }
}

/// A range of code and how to unwind from it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CfiRecord {
    /// The covered addresses.
    pub range: Range<u64>,
    /// The unwind recipe for all covered addresses.
    pub recipe: UnwindRecipe,
}

/// The reason a rule set cannot be summarized.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SummarizeError {
    /// The range is empty.
    EmptyRange,
    /// The range exceeds the configured maximum.
    RangeTooLarge,
    /// No CFA rule is established.
    NoCfa,
    /// The CFA expression cannot be converted.
    BadCfaExpression,
    /// The return address cannot be recovered.
    UnresolvedReturnAddress,
}

impl fmt::Display for SummarizeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyRange => write!(f, "empty range"),
            Self::RangeTooLarge => write!(f, "implausibly large range"),
            Self::NoCfa => write!(f, "no CFA rule"),
            Self::BadCfaExpression => write!(f, "unsupported CFA expression"),
            Self::UnresolvedReturnAddress => write!(f, "unresolved return address"),
        }
    }
}

/// Maps abstract rules onto the unwind registers of a CPU family.
pub struct Summarizer<'p> {
    cpu: CpuFamily,
    params: FrameParams,
    max_range: u64,
    pool: &'p mut ExprPool,
}

impl<'p> Summarizer<'p> {
    /// Creates a summarizer for frames with the given parameters.
    pub fn new(cpu: CpuFamily, params: FrameParams, max_range: u64, pool: &'p mut ExprPool) -> Self {
        Summarizer {
            cpu,
            params,
            max_range,
            pool,
        }
    }

    fn expression(&mut self, bytes: &[u8], push_cfa: bool) -> Option<ExprId> {
        let params = &self.params;
        match self
            .pool
            .from_dwarf(bytes, params.endian, params.address_size, push_cfa)
        {
            Ok(id) => Some(id),
            Err(error) => {
                tracing::trace!(%error, "unsupported cfi expression");
                None
            }
        }
    }

    /// Converts a register rule, `None` if it cannot be expressed.
    fn convert(&mut self, rule: RegRule<'_>) -> Option<RegHow> {
        Some(match rule {
            RegRule::Undefined | RegRule::Architectural => return None,
            RegRule::SameValue => RegHow::Same,
            RegRule::Offset(offset) => RegHow::MemCfaRel(offset),
            RegRule::ValOffset(offset) => RegHow::CfaRel(offset),
            RegRule::Register(register) => RegHow::Expr(self.pool.insert(CfiExpr::Reg(register))),
            RegRule::Expression(bytes) => {
                let address = self.expression(bytes, true)?;
                RegHow::Expr(self.pool.insert(CfiExpr::Deref(address)))
            }
            RegRule::ValExpression(bytes) => RegHow::Expr(self.expression(bytes, true)?),
        })
    }

    fn cfa(&mut self, rule: CfaRule<'_>) -> Result<CfaHow, SummarizeError> {
        match rule {
            CfaRule::Undefined => Err(SummarizeError::NoCfa),
            CfaRule::RegisterOffset { register, offset } => {
                Ok(if Some(register) == self.cpu.stack_pointer_register() {
                    CfaHow::SpRel(offset)
                } else if Some(register) == self.cpu.frame_pointer_register() {
                    CfaHow::FpRel(offset)
                } else {
                    CfaHow::RegRel { register, offset }
                })
            }
            CfaRule::Expression(bytes) => self
                .expression(bytes, false)
                .map(CfaHow::Expr)
                .ok_or(SummarizeError::BadCfaExpression),
        }
    }

    /// Summarizes the rules in effect over `range`.
    pub fn summarize(
        &mut self,
        range: Range<u64>,
        rules: &RuleSet<'_>,
    ) -> Result<CfiRecord, SummarizeError> {
        let size = range.end.saturating_sub(range.start);
        if size == 0 {
            return Err(SummarizeError::EmptyRange);
        }
        if size > self.max_range {
            return Err(SummarizeError::RangeTooLarge);
        }

        let cfa = self.cfa(rules.cfa)?;

        let ra = match rules.get(self.params.return_address_register) {
            // On x86 the return address column is the instruction pointer, which always changes.
            RegRule::SameValue
                if matches!(self.cpu, CpuFamily::Intel32 | CpuFamily::Amd64) =>
            {
                return Err(SummarizeError::UnresolvedReturnAddress)
            }
            rule => self
                .convert(rule)
                .ok_or(SummarizeError::UnresolvedReturnAddress)?,
        };

        // The caller's stack pointer is the CFA unless a rule says otherwise.
        let sp = match self.cpu.stack_pointer_register().and_then(|r| rules.find(r)) {
            Some(rule) => self.convert(rule).unwrap_or(RegHow::Unknown),
            None => RegHow::CfaRel(0),
        };

        let fp = match self.cpu.frame_pointer_register() {
            Some(register) => self.convert(rules.get(register)).unwrap_or(RegHow::Unknown),
            None => RegHow::Same,
        };

        let mut extra = SmallVec::new();
        for &register in self.cpu.extra_unwind_registers() {
            let how = self.convert(rules.get(register)).unwrap_or(RegHow::Unknown);
            if how != RegHow::Same {
                extra.push((register, how));
            }
        }

        Ok(CfiRecord {
            range,
            recipe: UnwindRecipe {
                cfa,
                ra,
                sp,
                fp,
                extra,
            },
        })
    }
}

/// Renders a recipe, see [`UnwindRecipe::display`].
pub struct RecipeDisplay<'a> {
    recipe: &'a UnwindRecipe,
    pool: Option<&'a ExprPool>,
    cpu: CpuFamily,
}

impl RecipeDisplay<'_> {
    fn expr(&self, f: &mut fmt::Formatter<'_>, id: ExprId) -> fmt::Result {
        match self.pool {
            Some(pool) => write!(f, "{}", pool.display(id, self.cpu)),
            None => write!(f, "{id}"),
        }
    }

    fn reg(&self, f: &mut fmt::Formatter<'_>, how: RegHow) -> fmt::Result {
        match how {
            RegHow::Unknown => write!(f, "?"),
            RegHow::Same => write!(f, "same"),
            RegHow::CfaRel(offset) => write!(f, "cfa{offset:+}"),
            RegHow::MemCfaRel(offset) => write!(f, "*(cfa{offset:+})"),
            RegHow::Expr(id) => self.expr(f, id),
        }
    }
}

impl fmt::Display for RecipeDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let recipe = self.recipe;

        write!(f, "cfa=")?;
        match recipe.cfa {
            CfaHow::Unknown => return write!(f, "?"),
            CfaHow::SpRel(offset) => write!(f, "sp{offset:+}")?,
            CfaHow::FpRel(offset) => write!(f, "fp{offset:+}")?,
            CfaHow::RegRel { register, offset } => {
                write!(f, "{}{offset:+}", register_name(self.cpu, register))?
            }
            CfaHow::Expr(id) => self.expr(f, id)?,
        }

        write!(f, " ra=")?;
        self.reg(f, recipe.ra)?;

        if recipe.sp != RegHow::CfaRel(0) {
            write!(f, " sp=")?;
            self.reg(f, recipe.sp)?;
        }
        if recipe.fp != RegHow::Same {
            write!(f, " fp=")?;
            self.reg(f, recipe.fp)?;
        }
        for &(register, how) in &recipe.extra {
            write!(f, " {}=", register_name(self.cpu, register))?;
            self.reg(f, how)?;
        }

        Ok(())
    }
}

impl fmt::Display for UnwindRecipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let display = RecipeDisplay {
            recipe: self,
            pool: None,
            cpu: CpuFamily::Unknown,
        };
        fmt::Display::fmt(&display, f)
    }
}

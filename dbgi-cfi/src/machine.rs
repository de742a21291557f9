//! The call frame instruction interpreter.

use std::ops::Range;

use dbgi_common::{Cursor, Endian};
use gimli::constants;
use smallvec::SmallVec;

use crate::encoding::{read_encoded_pointer, PointerBases};
use crate::entries::Cie;
use crate::{CfiError, CfiErrorKind, CfiOptions};

/// The number of register columns the machine tracks.
pub const MAX_CFI_REGISTERS: u16 = 128;

/// How the value of a register in the calling frame is recovered.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RegRule<'a> {
    /// The value cannot be recovered.
    Undefined,
    /// The register was not modified by the callee.
    SameValue,
    /// Saved in memory at `CFA + offset`.
    Offset(i64),
    /// The value is `CFA + offset`.
    ValOffset(i64),
    /// Saved in another register.
    Register(u16),
    /// Saved in memory at the address computed by an expression.
    Expression(&'a [u8]),
    /// The value is computed by an expression.
    ValExpression(&'a [u8]),
    /// Defined by the ABI outside of DWARF.
    Architectural,
}

/// How the canonical frame address is computed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CfaRule<'a> {
    /// No CFA rule has been established.
    Undefined,
    /// The CFA is `register + offset`.
    RegisterOffset {
        /// The base register.
        register: u16,
        /// The offset added to the register value.
        offset: i64,
    },
    /// The CFA is computed by an expression.
    Expression(&'a [u8]),
}

/// The rules in effect at one location.
///
/// Registers without an explicit rule keep their value.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RuleSet<'a> {
    /// The CFA rule.
    pub cfa: CfaRule<'a>,
    rules: SmallVec<[(u16, RegRule<'a>); 8]>,
}

impl Default for RuleSet<'_> {
    fn default() -> Self {
        RuleSet {
            cfa: CfaRule::Undefined,
            rules: SmallVec::new(),
        }
    }
}

impl<'a> RuleSet<'a> {
    /// Returns the rule of a register.
    pub fn get(&self, register: u16) -> RegRule<'a> {
        self.find(register).unwrap_or(RegRule::SameValue)
    }

    /// Returns the rule of a register if one was set explicitly.
    pub fn find(&self, register: u16) -> Option<RegRule<'a>> {
        self.rules
            .iter()
            .find(|(r, _)| *r == register)
            .map(|&(_, rule)| rule)
    }

    /// Sets the rule of a register.
    pub fn set(&mut self, register: u16, rule: RegRule<'a>) {
        match self.rules.iter_mut().find(|(r, _)| *r == register) {
            Some(entry) => entry.1 = rule,
            None => self.rules.push((register, rule)),
        }
    }

    /// Restores a register to the rule it has in `initial`.
    fn restore(&mut self, register: u16, initial: &RuleSet<'a>) {
        match initial.find(register) {
            Some(rule) => self.set(register, rule),
            None => self.rules.retain(|(r, _)| *r != register),
        }
    }

    /// Iterates all explicitly set rules.
    pub fn iter(&self) -> impl Iterator<Item = (u16, RegRule<'a>)> + '_ {
        self.rules.iter().copied()
    }
}

/// Parameters of a frame taken from its CIE.
#[derive(Clone, Copy, Debug)]
pub struct FrameParams {
    /// The factor applied to advance instructions.
    pub code_alignment: u64,
    /// The factor applied to offset instructions.
    pub data_alignment: i64,
    /// The column holding the return address.
    pub return_address_register: u16,
    /// The size of target addresses.
    pub address_size: u8,
    /// The byte order of operands.
    pub endian: Endian,
    /// The encoding of `DW_CFA_set_loc` operands.
    pub fde_encoding: gimli::DwEhPe,
    /// Bases for relative `DW_CFA_set_loc` operands.
    pub bases: PointerBases,
}

impl FrameParams {
    /// Takes the parameters of a CIE.
    pub fn from_cie(cie: &Cie<'_>, endian: Endian, bases: PointerBases) -> Self {
        FrameParams {
            code_alignment: cie.code_alignment,
            data_alignment: cie.data_alignment,
            return_address_register: cie.return_address_register,
            address_size: cie.address_size,
            endian,
            fde_encoding: cie.augmentation.fde_encoding,
            bases,
        }
    }
}

/// Runs call frame instructions and reports the rules in effect over each address range.
#[derive(Debug)]
pub struct CfiMachine<'a> {
    params: FrameParams,
    max_stack: usize,
    initial: RuleSet<'a>,
    rules: RuleSet<'a>,
    stack: Vec<RuleSet<'a>>,
}

fn register(value: u64) -> Result<u16, CfiError> {
    match u16::try_from(value) {
        Ok(register) if register < MAX_CFI_REGISTERS => Ok(register),
        _ => Err(CfiError::new(
            CfiErrorKind::BadInstruction,
            format!("register {value} out of range"),
        )),
    }
}

fn block<'a>(cursor: &mut Cursor<'a>) -> Result<&'a [u8], CfiError> {
    let length = cursor.read_uleb128()?;
    Ok(cursor.read_bytes(length)?)
}

impl<'a> CfiMachine<'a> {
    /// Creates a machine for FDEs sharing the given parameters.
    pub fn new(params: FrameParams, options: &CfiOptions) -> Self {
        CfiMachine {
            params,
            max_stack: options.state_stack_depth,
            initial: RuleSet::default(),
            rules: RuleSet::default(),
            stack: Vec::new(),
        }
    }

    /// The current rules.
    pub fn rules(&self) -> &RuleSet<'a> {
        &self.rules
    }

    /// Runs the initial instructions of a CIE.
    ///
    /// The resulting rules are the starting point of every FDE and the target of
    /// `DW_CFA_restore`. Location advances are not allowed.
    pub fn run_initial(&mut self, instructions: &'a [u8]) -> Result<(), CfiError> {
        let mut cursor = Cursor::new(instructions, self.params.endian);
        while !cursor.is_empty() {
            if self.step(&mut cursor, 0)?.is_some() {
                return Err(CfiError::new(
                    CfiErrorKind::BadCie,
                    "location advance in initial instructions",
                ));
            }
        }

        self.initial = self.rules.clone();
        self.stack.clear();
        Ok(())
    }

    /// Runs the instructions of an FDE covering `range`.
    ///
    /// `emit` is called with every non-empty address range and the rules in effect over it, in
    /// ascending address order. Ranges are clipped to `range`. If an instruction fails, ranges
    /// reported before stay valid and the error is returned.
    pub fn run<F>(
        &mut self,
        range: Range<u64>,
        instructions: &'a [u8],
        mut emit: F,
    ) -> Result<(), CfiError>
    where
        F: FnMut(Range<u64>, &RuleSet<'a>),
    {
        self.rules = self.initial.clone();
        self.stack.clear();

        let mut location = range.start;
        let mut cursor = Cursor::new(instructions, self.params.endian);

        while !cursor.is_empty() {
            let Some(next) = self.step(&mut cursor, location)? else {
                continue;
            };

            if next < location {
                return Err(CfiError::new(
                    CfiErrorKind::BadInstruction,
                    format!("location moves backwards to {next:#x}"),
                ));
            }

            let next = next.min(range.end);
            if next > location {
                emit(location..next, &self.rules);
                location = next;
            }
        }

        if location < range.end {
            emit(location..range.end, &self.rules);
        }

        Ok(())
    }

    fn advance(&self, location: u64, delta: u64) -> u64 {
        location.saturating_add(delta.saturating_mul(self.params.code_alignment))
    }

    fn factored(&self, offset: i64) -> i64 {
        offset.wrapping_mul(self.params.data_alignment)
    }

    fn cfa_offset(&mut self, offset: i64) -> Result<(), CfiError> {
        match &mut self.rules.cfa {
            CfaRule::RegisterOffset { offset: current, .. } => {
                *current = offset;
                Ok(())
            }
            _ => Err(CfiError::new(
                CfiErrorKind::BadInstruction,
                "CFA offset without register rule",
            )),
        }
    }

    /// Executes one instruction, returning the new location if it advances.
    fn step(&mut self, cursor: &mut Cursor<'a>, location: u64) -> Result<Option<u64>, CfiError> {
        let op = cursor.read_u8()?;
        let operand = u64::from(op & 0x3f);

        match op & 0xc0 {
            0x40 => return Ok(Some(self.advance(location, operand))),
            0x80 => {
                let offset = self.factored(cursor.read_uleb128()? as i64);
                self.rules.set(register(operand)?, RegRule::Offset(offset));
                return Ok(None);
            }
            0xc0 => {
                self.rules.restore(register(operand)?, &self.initial);
                return Ok(None);
            }
            _ => {}
        }

        match gimli::DwCfa(op) {
            constants::DW_CFA_nop => {}
            constants::DW_CFA_set_loc => {
                let params = &self.params;
                let next = read_encoded_pointer(
                    cursor,
                    params.fde_encoding,
                    &params.bases,
                    params.address_size,
                )?;
                return Ok(Some(next));
            }
            constants::DW_CFA_advance_loc1 => {
                let delta = u64::from(cursor.read_u8()?);
                return Ok(Some(self.advance(location, delta)));
            }
            constants::DW_CFA_advance_loc2 => {
                let delta = u64::from(cursor.read_u16()?);
                return Ok(Some(self.advance(location, delta)));
            }
            constants::DW_CFA_advance_loc4 => {
                let delta = u64::from(cursor.read_u32()?);
                return Ok(Some(self.advance(location, delta)));
            }
            constants::DW_CFA_MIPS_advance_loc8 => {
                let delta = cursor.read_u64()?;
                return Ok(Some(self.advance(location, delta)));
            }
            constants::DW_CFA_offset_extended => {
                let reg = register(cursor.read_uleb128()?)?;
                let offset = self.factored(cursor.read_uleb128()? as i64);
                self.rules.set(reg, RegRule::Offset(offset));
            }
            constants::DW_CFA_offset_extended_sf => {
                let reg = register(cursor.read_uleb128()?)?;
                let offset = self.factored(cursor.read_sleb128()?);
                self.rules.set(reg, RegRule::Offset(offset));
            }
            constants::DW_CFA_GNU_negative_offset_extended => {
                let reg = register(cursor.read_uleb128()?)?;
                let offset = self.factored(cursor.read_uleb128()? as i64);
                self.rules.set(reg, RegRule::Offset(offset.wrapping_neg()));
            }
            constants::DW_CFA_val_offset => {
                let reg = register(cursor.read_uleb128()?)?;
                let offset = self.factored(cursor.read_uleb128()? as i64);
                self.rules.set(reg, RegRule::ValOffset(offset));
            }
            constants::DW_CFA_val_offset_sf => {
                let reg = register(cursor.read_uleb128()?)?;
                let offset = self.factored(cursor.read_sleb128()?);
                self.rules.set(reg, RegRule::ValOffset(offset));
            }
            constants::DW_CFA_restore_extended => {
                let reg = register(cursor.read_uleb128()?)?;
                self.rules.restore(reg, &self.initial);
            }
            constants::DW_CFA_undefined => {
                let reg = register(cursor.read_uleb128()?)?;
                self.rules.set(reg, RegRule::Undefined);
            }
            constants::DW_CFA_same_value => {
                let reg = register(cursor.read_uleb128()?)?;
                self.rules.set(reg, RegRule::SameValue);
            }
            constants::DW_CFA_register => {
                let reg = register(cursor.read_uleb128()?)?;
                let source = register(cursor.read_uleb128()?)?;
                self.rules.set(reg, RegRule::Register(source));
            }
            constants::DW_CFA_expression => {
                let reg = register(cursor.read_uleb128()?)?;
                self.rules.set(reg, RegRule::Expression(block(cursor)?));
            }
            constants::DW_CFA_val_expression => {
                let reg = register(cursor.read_uleb128()?)?;
                self.rules.set(reg, RegRule::ValExpression(block(cursor)?));
            }
            constants::DW_CFA_remember_state => {
                if self.stack.len() >= self.max_stack {
                    return Err(CfiErrorKind::StateStackOverflow.into());
                }
                self.stack.push(self.rules.clone());
            }
            constants::DW_CFA_restore_state => {
                self.rules = self
                    .stack
                    .pop()
                    .ok_or(CfiErrorKind::StateStackUnderflow)?;
            }
            constants::DW_CFA_def_cfa => {
                let reg = register(cursor.read_uleb128()?)?;
                let offset = cursor.read_uleb128()? as i64;
                self.rules.cfa = CfaRule::RegisterOffset {
                    register: reg,
                    offset,
                };
            }
            constants::DW_CFA_def_cfa_sf => {
                let reg = register(cursor.read_uleb128()?)?;
                let offset = self.factored(cursor.read_sleb128()?);
                self.rules.cfa = CfaRule::RegisterOffset {
                    register: reg,
                    offset,
                };
            }
            constants::DW_CFA_def_cfa_register => {
                let reg = register(cursor.read_uleb128()?)?;
                self.rules.cfa = match self.rules.cfa {
                    CfaRule::RegisterOffset { offset, .. } => CfaRule::RegisterOffset {
                        register: reg,
                        offset,
                    },
                    CfaRule::Undefined => CfaRule::RegisterOffset {
                        register: reg,
                        offset: 0,
                    },
                    CfaRule::Expression(_) => {
                        return Err(CfiError::new(
                            CfiErrorKind::BadInstruction,
                            "CFA register with expression rule",
                        ))
                    }
                };
            }
            constants::DW_CFA_def_cfa_offset => {
                let offset = cursor.read_uleb128()? as i64;
                self.cfa_offset(offset)?;
            }
            constants::DW_CFA_def_cfa_offset_sf => {
                let offset = self.factored(cursor.read_sleb128()?);
                self.cfa_offset(offset)?;
            }
            constants::DW_CFA_def_cfa_expression => {
                self.rules.cfa = CfaRule::Expression(block(cursor)?);
            }
            constants::DW_CFA_GNU_args_size => {
                cursor.read_uleb128()?;
            }
            // SPARC register windows and AArch64 return address signing.
            constants::DW_CFA_GNU_window_save => {}
            _ => {
                return Err(CfiError::new(
                    CfiErrorKind::BadInstruction,
                    format!("unknown opcode {op:#x}"),
                ))
            }
        }

        Ok(None)
    }
}

//! The expression sub-language of call frame information.
//!
//! DWARF expressions in `DW_CFA_def_cfa_expression`, `DW_CFA_expression` and
//! `DW_CFA_val_expression` are stack programs. They are converted into trees of [`CfiExpr`] nodes
//! by symbolically running the program, and stored hash-consed in an [`ExprPool`], so that equal
//! expressions share an [`ExprId`] and recipes can be compared by value.

use std::fmt;

use dbgi_common::{CpuFamily, Cursor, Endian, Pool};
use gimli::constants;
use smallvec::SmallVec;

use crate::{CfiError, CfiErrorKind};

/// The depth of the operand stack when converting expressions.
pub const EXPR_STACK_DEPTH: usize = 20;

/// The deepest expression tree that is evaluated.
const MAX_EVAL_DEPTH: usize = 64;

const LIT0: u8 = constants::DW_OP_lit0.0;
const LIT31: u8 = constants::DW_OP_lit31.0;
const REG0: u8 = constants::DW_OP_reg0.0;
const REG31: u8 = constants::DW_OP_reg31.0;
const BREG0: u8 = constants::DW_OP_breg0.0;
const BREG31: u8 = constants::DW_OP_breg31.0;

/// A handle to an expression in an [`ExprPool`].
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ExprId(u32);

impl ExprId {
    /// The index of the expression in its pool.
    pub fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ExprId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "expr#{}", self.0)
    }
}

/// Operators with one operand.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum UnaryOp {
    /// Two's complement negation.
    Neg,
    /// Absolute value of the signed operand.
    Abs,
    /// Bitwise complement.
    Not,
}

/// Operators with two operands.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum BinaryOp {
    /// Wrapping addition.
    Add,
    /// Wrapping subtraction.
    Sub,
    /// Bitwise and.
    And,
    /// Bitwise or.
    Or,
    /// Bitwise exclusive or.
    Xor,
    /// Wrapping multiplication.
    Mul,
    /// Shift left.
    Shl,
    /// Logical shift right.
    Shr,
    /// Arithmetic shift right.
    Sar,
    /// Equality.
    Eq,
    /// Inequality.
    Ne,
    /// Signed less than.
    Lt,
    /// Signed greater than.
    Gt,
    /// Signed less or equal.
    Le,
    /// Signed greater or equal.
    Ge,
}

impl BinaryOp {
    fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::And => "&",
            BinaryOp::Or => "|",
            BinaryOp::Xor => "^",
            BinaryOp::Mul => "*",
            BinaryOp::Shl => "<<",
            BinaryOp::Shr => ">>",
            BinaryOp::Sar => ">>s",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Gt => ">",
            BinaryOp::Le => "<=",
            BinaryOp::Ge => ">=",
        }
    }

    fn apply(self, a: u64, b: u64) -> u64 {
        let (sa, sb) = (a as i64, b as i64);
        match self {
            BinaryOp::Add => a.wrapping_add(b),
            BinaryOp::Sub => a.wrapping_sub(b),
            BinaryOp::And => a & b,
            BinaryOp::Or => a | b,
            BinaryOp::Xor => a ^ b,
            BinaryOp::Mul => a.wrapping_mul(b),
            BinaryOp::Shl => a.checked_shl(b as u32).filter(|_| b < 64).unwrap_or(0),
            BinaryOp::Shr => a.checked_shr(b as u32).filter(|_| b < 64).unwrap_or(0),
            BinaryOp::Sar => (sa >> b.min(63)) as u64,
            BinaryOp::Eq => u64::from(a == b),
            BinaryOp::Ne => u64::from(a != b),
            BinaryOp::Lt => u64::from(sa < sb),
            BinaryOp::Gt => u64::from(sa > sb),
            BinaryOp::Le => u64::from(sa <= sb),
            BinaryOp::Ge => u64::from(sa >= sb),
        }
    }
}

/// A node of a converted expression.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum CfiExpr {
    /// A constant.
    Const(u64),
    /// The canonical frame address of the frame being unwound.
    Cfa,
    /// The value of a register in the frame being unwound.
    Reg(u16),
    /// A pointer-sized load from memory.
    Deref(ExprId),
    /// A unary operation.
    Unop(UnaryOp, ExprId),
    /// A binary operation.
    Binop(BinaryOp, ExprId, ExprId),
    /// A value that cannot be computed.
    Undef,
}

/// Reads target memory while evaluating expressions.
pub trait MemoryReader {
    /// Reads a pointer-sized value at `address`.
    fn read_pointer(&self, address: u64) -> Option<u64>;
}

/// Register values of the frame being unwound.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RegisterValues {
    cfa: Option<u64>,
    values: SmallVec<[(u16, u64); 8]>,
}

impl RegisterValues {
    /// Creates an empty register set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the canonical frame address.
    pub fn set_cfa(&mut self, cfa: u64) {
        self.cfa = Some(cfa);
    }

    /// Returns the canonical frame address, if known.
    pub fn cfa(&self) -> Option<u64> {
        self.cfa
    }

    /// Sets the value of a register.
    pub fn set(&mut self, register: u16, value: u64) {
        match self.values.iter_mut().find(|(r, _)| *r == register) {
            Some(entry) => entry.1 = value,
            None => self.values.push((register, value)),
        }
    }

    /// Returns the value of a register, if known.
    pub fn get(&self, register: u16) -> Option<u64> {
        self.values
            .iter()
            .find(|(r, _)| *r == register)
            .map(|&(_, value)| value)
    }
}

/// Hash-consed storage for expressions.
#[derive(Clone, Debug, Default)]
pub struct ExprPool {
    exprs: Pool<CfiExpr>,
}

impl ExprPool {
    /// Creates an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of distinct expression nodes.
    pub fn len(&self) -> usize {
        self.exprs.len()
    }

    /// Returns `true` if the pool holds no expressions.
    pub fn is_empty(&self) -> bool {
        self.exprs.is_empty()
    }

    /// Inserts an expression node, returning the id of an equal node if one exists.
    pub fn insert(&mut self, expr: CfiExpr) -> ExprId {
        ExprId(self.exprs.insert(expr))
    }

    /// Resolves an expression id.
    pub fn get(&self, id: ExprId) -> Option<&CfiExpr> {
        self.exprs.get(id.0)
    }

    /// Inserts `cfa + offset`.
    pub fn cfa_offset(&mut self, offset: i64) -> ExprId {
        let cfa = self.insert(CfiExpr::Cfa);
        let offset = self.insert(CfiExpr::Const(offset as u64));
        self.insert(CfiExpr::Binop(BinaryOp::Add, cfa, offset))
    }

    /// Converts a DWARF expression into an expression tree.
    ///
    /// With `push_cfa`, the canonical frame address is pushed before the program runs, as required
    /// for `DW_CFA_expression` and `DW_CFA_val_expression`.
    pub fn from_dwarf(
        &mut self,
        bytes: &[u8],
        endian: Endian,
        address_size: u8,
        push_cfa: bool,
    ) -> Result<ExprId, CfiError> {
        let mut stack: SmallVec<[ExprId; EXPR_STACK_DEPTH]> = SmallVec::new();
        if push_cfa {
            stack.push(self.insert(CfiExpr::Cfa));
        }

        let mut cursor = Cursor::new(bytes, endian);
        while !cursor.is_empty() {
            let op = cursor.read_u8()?;

            let pushed = match op {
                LIT0..=LIT31 => Some(self.insert(CfiExpr::Const(u64::from(op - LIT0)))),
                REG0..=REG31 => Some(self.insert(CfiExpr::Reg(u16::from(op - REG0)))),
                BREG0..=BREG31 => {
                    let offset = cursor.read_sleb128()?;
                    Some(self.register_offset(u16::from(op - BREG0), offset))
                }
                _ => self.convert_op(gimli::DwOp(op), &mut cursor, &mut stack, address_size)?,
            };

            if let Some(id) = pushed {
                if stack.len() >= EXPR_STACK_DEPTH {
                    return Err(CfiError::new(CfiErrorKind::BadExpression, "stack overflow"));
                }
                stack.push(id);
            }
        }

        stack
            .pop()
            .ok_or_else(|| CfiError::new(CfiErrorKind::BadExpression, "empty expression"))
    }

    fn register_offset(&mut self, register: u16, offset: i64) -> ExprId {
        let reg = self.insert(CfiExpr::Reg(register));
        if offset == 0 {
            return reg;
        }
        let offset = self.insert(CfiExpr::Const(offset as u64));
        self.insert(CfiExpr::Binop(BinaryOp::Add, reg, offset))
    }

    /// Converts one operation, returning the node it pushes.
    fn convert_op(
        &mut self,
        op: gimli::DwOp,
        cursor: &mut Cursor<'_>,
        stack: &mut SmallVec<[ExprId; EXPR_STACK_DEPTH]>,
        address_size: u8,
    ) -> Result<Option<ExprId>, CfiError> {
        fn pop(stack: &mut SmallVec<[ExprId; EXPR_STACK_DEPTH]>) -> Result<ExprId, CfiError> {
            stack
                .pop()
                .ok_or_else(|| CfiError::new(CfiErrorKind::BadExpression, "stack underflow"))
        }

        fn peek(
            stack: &SmallVec<[ExprId; EXPR_STACK_DEPTH]>,
            index: usize,
        ) -> Result<ExprId, CfiError> {
            stack
                .len()
                .checked_sub(index + 1)
                .map(|i| stack[i])
                .ok_or_else(|| CfiError::new(CfiErrorKind::BadExpression, "stack underflow"))
        }

        let binop = |this: &mut Self, stack: &mut SmallVec<_>, op| {
            let b = pop(stack)?;
            let a = pop(stack)?;
            Ok::<_, CfiError>(Some(this.insert(CfiExpr::Binop(op, a, b))))
        };

        let constant = |this: &mut Self, value: u64| Ok(Some(this.insert(CfiExpr::Const(value))));

        match op {
            constants::DW_OP_nop => Ok(None),
            constants::DW_OP_addr => constant(self, cursor.read_uint(address_size)?),
            constants::DW_OP_const1u => constant(self, u64::from(cursor.read_u8()?)),
            constants::DW_OP_const1s => constant(self, i64::from(cursor.read_i8()?) as u64),
            constants::DW_OP_const2u => constant(self, u64::from(cursor.read_u16()?)),
            constants::DW_OP_const2s => constant(self, i64::from(cursor.read_i16()?) as u64),
            constants::DW_OP_const4u => constant(self, u64::from(cursor.read_u32()?)),
            constants::DW_OP_const4s => constant(self, i64::from(cursor.read_i32()?) as u64),
            constants::DW_OP_const8u => constant(self, cursor.read_u64()?),
            constants::DW_OP_const8s => constant(self, cursor.read_i64()? as u64),
            constants::DW_OP_constu => constant(self, cursor.read_uleb128()?),
            constants::DW_OP_consts => constant(self, cursor.read_sleb128()? as u64),
            constants::DW_OP_regx => {
                let register = u16::try_from(cursor.read_uleb128()?)
                    .map_err(|_| CfiError::new(CfiErrorKind::BadExpression, "register"))?;
                Ok(Some(self.insert(CfiExpr::Reg(register))))
            }
            constants::DW_OP_bregx => {
                let register = u16::try_from(cursor.read_uleb128()?)
                    .map_err(|_| CfiError::new(CfiErrorKind::BadExpression, "register"))?;
                let offset = cursor.read_sleb128()?;
                Ok(Some(self.register_offset(register, offset)))
            }
            constants::DW_OP_call_frame_cfa => Ok(Some(self.insert(CfiExpr::Cfa))),
            constants::DW_OP_dup => Ok(Some(peek(stack, 0)?)),
            constants::DW_OP_over => Ok(Some(peek(stack, 1)?)),
            constants::DW_OP_pick => {
                let index = cursor.read_u8()?;
                Ok(Some(peek(stack, usize::from(index))?))
            }
            constants::DW_OP_drop => {
                pop(stack)?;
                Ok(None)
            }
            constants::DW_OP_swap => {
                let b = pop(stack)?;
                let a = pop(stack)?;
                stack.push(b);
                stack.push(a);
                Ok(None)
            }
            constants::DW_OP_rot => {
                let c = pop(stack)?;
                let b = pop(stack)?;
                let a = pop(stack)?;
                stack.push(c);
                stack.push(a);
                stack.push(b);
                Ok(None)
            }
            constants::DW_OP_deref => {
                let address = pop(stack)?;
                Ok(Some(self.insert(CfiExpr::Deref(address))))
            }
            constants::DW_OP_deref_size => {
                let size = cursor.read_u8()?;
                let address = pop(stack)?;
                let value = self.insert(CfiExpr::Deref(address));
                if size >= 8 {
                    return Ok(Some(value));
                }
                let mask = self.insert(CfiExpr::Const((1u64 << (u32::from(size) * 8)) - 1));
                Ok(Some(self.insert(CfiExpr::Binop(BinaryOp::And, value, mask))))
            }
            constants::DW_OP_neg | constants::DW_OP_abs | constants::DW_OP_not => {
                let unop = match op {
                    constants::DW_OP_neg => UnaryOp::Neg,
                    constants::DW_OP_abs => UnaryOp::Abs,
                    _ => UnaryOp::Not,
                };
                let a = pop(stack)?;
                Ok(Some(self.insert(CfiExpr::Unop(unop, a))))
            }
            constants::DW_OP_plus_uconst => {
                let value = cursor.read_uleb128()?;
                let a = pop(stack)?;
                let b = self.insert(CfiExpr::Const(value));
                Ok(Some(self.insert(CfiExpr::Binop(BinaryOp::Add, a, b))))
            }
            constants::DW_OP_plus => binop(self, stack, BinaryOp::Add),
            constants::DW_OP_minus => binop(self, stack, BinaryOp::Sub),
            constants::DW_OP_and => binop(self, stack, BinaryOp::And),
            constants::DW_OP_or => binop(self, stack, BinaryOp::Or),
            constants::DW_OP_xor => binop(self, stack, BinaryOp::Xor),
            constants::DW_OP_mul => binop(self, stack, BinaryOp::Mul),
            constants::DW_OP_shl => binop(self, stack, BinaryOp::Shl),
            constants::DW_OP_shr => binop(self, stack, BinaryOp::Shr),
            constants::DW_OP_shra => binop(self, stack, BinaryOp::Sar),
            constants::DW_OP_eq => binop(self, stack, BinaryOp::Eq),
            constants::DW_OP_ne => binop(self, stack, BinaryOp::Ne),
            constants::DW_OP_lt => binop(self, stack, BinaryOp::Lt),
            constants::DW_OP_gt => binop(self, stack, BinaryOp::Gt),
            constants::DW_OP_le => binop(self, stack, BinaryOp::Le),
            constants::DW_OP_ge => binop(self, stack, BinaryOp::Ge),
            _ => Err(CfiError::new(
                CfiErrorKind::BadExpression,
                format!("unsupported operation {op}"),
            )),
        }
    }

    /// Evaluates an expression.
    ///
    /// Returns `None` if the expression refers to a register or memory that is not available, or
    /// nests too deeply.
    pub fn evaluate(
        &self,
        id: ExprId,
        registers: &RegisterValues,
        memory: &dyn MemoryReader,
    ) -> Option<u64> {
        self.evaluate_at(id, registers, memory, 0)
    }

    fn evaluate_at(
        &self,
        id: ExprId,
        registers: &RegisterValues,
        memory: &dyn MemoryReader,
        depth: usize,
    ) -> Option<u64> {
        if depth > MAX_EVAL_DEPTH {
            return None;
        }

        let eval = |id| self.evaluate_at(id, registers, memory, depth + 1);
        match *self.get(id)? {
            CfiExpr::Const(value) => Some(value),
            CfiExpr::Cfa => registers.cfa(),
            CfiExpr::Reg(register) => registers.get(register),
            CfiExpr::Deref(address) => memory.read_pointer(eval(address)?),
            CfiExpr::Unop(op, a) => {
                let a = eval(a)?;
                Some(match op {
                    UnaryOp::Neg => a.wrapping_neg(),
                    UnaryOp::Abs => (a as i64).unsigned_abs(),
                    UnaryOp::Not => !a,
                })
            }
            CfiExpr::Binop(op, a, b) => Some(op.apply(eval(a)?, eval(b)?)),
            CfiExpr::Undef => None,
        }
    }

    /// Returns a displayable rendering of an expression with register names of `cpu`.
    pub fn display(&self, id: ExprId, cpu: CpuFamily) -> ExprDisplay<'_> {
        ExprDisplay {
            pool: self,
            id,
            cpu,
        }
    }
}

/// Renders a pooled expression, see [`ExprPool::display`].
pub struct ExprDisplay<'a> {
    pool: &'a ExprPool,
    id: ExprId,
    cpu: CpuFamily,
}

/// Returns the name of a register without the leading `$`, or `r{n}` for unnamed registers.
pub(crate) fn register_name(cpu: CpuFamily, register: u16) -> String {
    match cpu.cfi_register_name(register) {
        Some(name) => name.trim_start_matches('$').to_owned(),
        None => format!("r{register}"),
    }
}

impl ExprDisplay<'_> {
    fn write(&self, f: &mut fmt::Formatter<'_>, id: ExprId, depth: usize) -> fmt::Result {
        if depth > MAX_EVAL_DEPTH {
            return write!(f, "...");
        }

        let Some(expr) = self.pool.get(id) else {
            return write!(f, "{id}");
        };

        match *expr {
            CfiExpr::Const(value) if (value as i64).unsigned_abs() < 0x10000 => {
                write!(f, "{}", value as i64)
            }
            CfiExpr::Const(value) => write!(f, "{value:#x}"),
            CfiExpr::Cfa => write!(f, "cfa"),
            CfiExpr::Reg(register) => write!(f, "{}", register_name(self.cpu, register)),
            CfiExpr::Deref(address) => {
                write!(f, "*")?;
                self.write(f, address, depth + 1)
            }
            CfiExpr::Unop(op, a) => {
                match op {
                    UnaryOp::Neg => write!(f, "-")?,
                    UnaryOp::Abs => write!(f, "abs ")?,
                    UnaryOp::Not => write!(f, "~")?,
                }
                self.write(f, a, depth + 1)
            }
            CfiExpr::Binop(op, a, b) => {
                write!(f, "(")?;
                self.write(f, a, depth + 1)?;
                match (op, self.pool.get(b)) {
                    (BinaryOp::Add, Some(&CfiExpr::Const(c))) if (c as i64) < 0 => {
                        write!(f, " - {}", (c as i64).unsigned_abs())?;
                    }
                    _ => {
                        write!(f, " {} ", op.symbol())?;
                        self.write(f, b, depth + 1)?;
                    }
                }
                write!(f, ")")
            }
            CfiExpr::Undef => write!(f, "undef"),
        }
    }
}

impl fmt::Display for ExprDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write(f, self.id, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;

    use dbgi_testutils::Assembler;
    use similar_asserts::assert_eq;

    struct Memory(HashMap<u64, u64>);

    impl MemoryReader for Memory {
        fn read_pointer(&self, address: u64) -> Option<u64> {
            self.0.get(&address).copied()
        }
    }

    #[test]
    fn test_convert_and_display() -> Result<(), CfiError> {
        let bytes = Assembler::little()
            .u8(constants::DW_OP_breg7.0)
            .sleb(8)
            .u8(constants::DW_OP_deref.0)
            .finish();

        let mut pool = ExprPool::new();
        let id = pool.from_dwarf(&bytes, Endian::Little, 8, false)?;
        assert_eq!(pool.display(id, CpuFamily::Amd64).to_string(), "*(rsp + 8)");
        assert_eq!(pool.display(id, CpuFamily::Unknown).to_string(), "*(r7 + 8)");
        Ok(())
    }

    #[test]
    fn test_hash_consing() -> Result<(), CfiError> {
        let bytes = [constants::DW_OP_lit8.0, constants::DW_OP_minus.0];

        let mut pool = ExprPool::new();
        let first = pool.from_dwarf(&bytes, Endian::Little, 8, true)?;
        let len = pool.len();
        let second = pool.from_dwarf(&bytes, Endian::Little, 8, true)?;

        assert_eq!(first, second);
        assert_eq!(pool.len(), len);
        assert_eq!(pool.display(first, CpuFamily::Amd64).to_string(), "(cfa - 8)");
        Ok(())
    }

    #[test]
    fn test_evaluate() -> Result<(), CfiError> {
        // *(rsp + 8) + (2 << 4)
        let bytes = Assembler::little()
            .u8(constants::DW_OP_breg7.0)
            .sleb(8)
            .u8(constants::DW_OP_deref.0)
            .u8(constants::DW_OP_lit2.0)
            .u8(constants::DW_OP_lit4.0)
            .u8(constants::DW_OP_shl.0)
            .u8(constants::DW_OP_plus.0)
            .finish();

        let mut pool = ExprPool::new();
        let id = pool.from_dwarf(&bytes, Endian::Little, 8, false)?;

        let mut registers = RegisterValues::new();
        registers.set(7, 0x7000);
        let memory = Memory(HashMap::from([(0x7008, 0x100)]));

        assert_eq!(pool.evaluate(id, &registers, &memory), Some(0x120));
        assert_eq!(pool.evaluate(id, &RegisterValues::new(), &memory), None);
        Ok(())
    }

    #[test]
    fn test_signed_comparison() -> Result<(), CfiError> {
        let bytes = Assembler::little()
            .u8(constants::DW_OP_consts.0)
            .sleb(-1)
            .u8(constants::DW_OP_lit0.0)
            .u8(constants::DW_OP_lt.0)
            .finish();

        let mut pool = ExprPool::new();
        let id = pool.from_dwarf(&bytes, Endian::Little, 8, false)?;
        let memory = Memory(HashMap::new());
        assert_eq!(pool.evaluate(id, &RegisterValues::new(), &memory), Some(1));
        Ok(())
    }

    #[test]
    fn test_stack_limits() {
        let mut pool = ExprPool::new();

        let overflow = [constants::DW_OP_lit0.0; EXPR_STACK_DEPTH + 1];
        let error = pool
            .from_dwarf(&overflow, Endian::Little, 8, false)
            .unwrap_err();
        assert_eq!(error.kind(), CfiErrorKind::BadExpression);

        let underflow = [constants::DW_OP_plus.0];
        let error = pool
            .from_dwarf(&underflow, Endian::Little, 8, false)
            .unwrap_err();
        assert_eq!(error.kind(), CfiErrorKind::BadExpression);
    }

    #[test]
    fn test_unsupported_operation() {
        let mut pool = ExprPool::new();
        let bytes = [constants::DW_OP_skip.0, 0, 0];
        let error = pool.from_dwarf(&bytes, Endian::Little, 8, false).unwrap_err();
        assert_eq!(error.kind(), CfiErrorKind::BadExpression);
    }
}

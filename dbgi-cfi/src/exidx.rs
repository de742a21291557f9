//! ARM exception handling index tables.
//!
//! `.ARM.exidx` holds one 8-byte entry per function, sorted by address. The first word is a
//! PC-relative 31-bit offset ("prel31") to the function. The second word either marks the function
//! as not unwindable, holds up to three unwind opcodes inline, or points into `.ARM.extab` where
//! longer opcode sequences live.
//!
//! Unwind opcodes describe how to undo the prologue by moving a virtual stack pointer (`vsp`) and
//! popping registers. They are decoded into an [`ArmFrame`], which is then expressed as a DWARF
//! call frame program and run through the same machine as `.eh_frame`.

use dbgi_common::{Cursor, Endian, Section};
use gimli::constants;
use smallvec::SmallVec;

use crate::encoding::PointerBases;
use crate::machine::FrameParams;
use crate::{CfiError, CfiErrorKind};

/// The second word of an entry that cannot be unwound.
const EXIDX_CANTUNWIND: u32 = 1;

const SP: u16 = 13;
const LR: u16 = 14;
const PC: u16 = 15;

fn bad(message: &'static str) -> CfiError {
    CfiError::new(CfiErrorKind::BadExidx, message)
}

/// Resolves a prel31 offset relative to `place`.
fn prel31(value: u32, place: u64) -> u64 {
    let offset = ((value << 1) as i32 >> 1) as i64;
    place.wrapping_add(offset as u64) & 0xffff_ffff
}

/// Appends the opcode bytes of a word, most significant byte first.
fn push_word(opcodes: &mut Vec<u8>, word: u32, skip: usize) {
    opcodes.extend_from_slice(&word.to_be_bytes()[skip..]);
}

/// How a function is unwound.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ExidxUnwind {
    /// The function cannot be unwound.
    CantUnwind,
    /// Unwind opcodes in execution order.
    Opcodes(Vec<u8>),
}

/// A decoded entry of `.ARM.exidx`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExidxEntry {
    /// The start address of the function.
    pub function: u64,
    /// How to unwind the function.
    pub unwind: ExidxUnwind,
}

/// Iterates the entries of `.ARM.exidx`.
#[derive(Clone, Debug)]
pub struct ExidxEntries<'a> {
    exidx: Section<'a>,
    extab: Section<'a>,
    cursor: Cursor<'a>,
}

impl<'a> ExidxEntries<'a> {
    /// Iterates `exidx`, resolving references into `extab`.
    pub fn new(exidx: Section<'a>, extab: Section<'a>) -> Self {
        ExidxEntries {
            exidx,
            extab,
            cursor: exidx.cursor(),
        }
    }

    fn read_entry(&mut self) -> Result<ExidxEntry, CfiError> {
        let offset = self.cursor.position();
        let place = self.exidx.address().wrapping_add(offset);

        let function_word = self.cursor.read_u32()?;
        let data = self.cursor.read_u32()?;
        if function_word & 0x8000_0000 != 0 {
            return Err(bad("function offset has bit 31 set"));
        }
        let function = prel31(function_word, place);

        let unwind = if data == EXIDX_CANTUNWIND {
            ExidxUnwind::CantUnwind
        } else if data & 0x8000_0000 != 0 {
            if (data >> 24) & 0x0f != 0 {
                return Err(bad("inline entry with long personality"));
            }
            let mut opcodes = Vec::with_capacity(3);
            push_word(&mut opcodes, data, 1);
            ExidxUnwind::Opcodes(opcodes)
        } else {
            let address = prel31(data, place + 4);
            ExidxUnwind::Opcodes(self.read_extab(address)?)
        };

        Ok(ExidxEntry { function, unwind })
    }

    fn read_extab(&self, address: u64) -> Result<Vec<u8>, CfiError> {
        let offset = address
            .checked_sub(self.extab.address())
            .ok_or_else(|| bad("extab reference out of range"))?;
        let mut cursor = self
            .extab
            .cursor_at(offset)
            .map_err(|e| CfiError::new(CfiErrorKind::BadExidx, e))?;

        let mut opcodes = Vec::new();
        let first = cursor.read_u32()?;

        let (word, count) = if first & 0x8000_0000 != 0 {
            match (first >> 24) & 0x0f {
                0 => {
                    push_word(&mut opcodes, first, 1);
                    return Ok(opcodes);
                }
                1 | 2 => {
                    push_word(&mut opcodes, first, 2);
                    return Self::read_more(cursor, opcodes, (first >> 16) & 0xff);
                }
                _ => return Err(bad("unknown personality routine")),
            }
        } else {
            // A generic personality routine, followed by data in the compact layout.
            let word = cursor.read_u32()?;
            (word, word >> 24)
        };

        push_word(&mut opcodes, word, 1);
        Self::read_more(cursor, opcodes, count)
    }

    fn read_more(
        mut cursor: Cursor<'_>,
        mut opcodes: Vec<u8>,
        count: u32,
    ) -> Result<Vec<u8>, CfiError> {
        for _ in 0..count {
            push_word(&mut opcodes, cursor.read_u32()?, 0);
        }
        Ok(opcodes)
    }
}

impl Iterator for ExidxEntries<'_> {
    type Item = (u64, Result<ExidxEntry, CfiError>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor.remaining() < 8 {
            return None;
        }

        let offset = self.cursor.position();
        let result = self.read_entry();
        self.cursor.seek(offset + 8).ok()?;
        Some((offset, result))
    }
}

/// The frame layout described by ARM unwind opcodes.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ArmFrame {
    /// The register the virtual stack pointer is based on.
    pub base: u16,
    /// The final virtual stack pointer relative to `base`, which is the caller's stack pointer.
    pub vsp: i64,
    /// Popped registers and the offset relative to `base` they were saved at.
    pub saved: SmallVec<[(u16, i64); 16]>,
}

impl ArmFrame {
    fn pop(&mut self, register: u16) -> Result<(), CfiError> {
        if register == SP {
            return Err(bad("stack pointer loaded from the stack"));
        }
        if !self.saved.iter().any(|&(r, _)| r == register) {
            self.saved.push((register, self.vsp));
        }
        self.vsp += 4;
        Ok(())
    }

    fn pop_mask(&mut self, mask: u16, first: u16) -> Result<(), CfiError> {
        for bit in 0..16 {
            if mask & (1 << bit) != 0 {
                self.pop(first + bit)?;
            }
        }
        Ok(())
    }

    /// Decodes unwind opcodes.
    pub fn decode(opcodes: &[u8]) -> Result<Self, CfiError> {
        let mut frame = ArmFrame {
            base: SP,
            ..ArmFrame::default()
        };

        let mut cursor = Cursor::new(opcodes, Endian::Big);
        while !cursor.is_empty() {
            let op = cursor.read_u8()?;
            let low = i64::from(op & 0x07);

            match op {
                0x00..=0x3f => frame.vsp += (i64::from(op & 0x3f) << 2) + 4,
                0x40..=0x7f => frame.vsp -= (i64::from(op & 0x3f) << 2) + 4,
                0x80..=0x8f => {
                    let mask = (u16::from(op & 0x0f) << 8) | u16::from(cursor.read_u8()?);
                    if mask == 0 {
                        return Err(bad("refuse to unwind"));
                    }
                    frame.pop_mask(mask, 4)?;
                }
                0x9d | 0x9f => return Err(bad("reserved opcode")),
                0x90..=0x9f => {
                    frame.base = u16::from(op & 0x0f);
                    frame.vsp = 0;
                    frame.saved.clear();
                }
                0xa0..=0xaf => {
                    for register in 4..=4 + u16::from(op & 0x07) {
                        frame.pop(register)?;
                    }
                    if op & 0x08 != 0 {
                        frame.pop(LR)?;
                    }
                }
                0xb0 => break,
                0xb1 => {
                    let mask = cursor.read_u8()?;
                    if mask == 0 || mask & 0xf0 != 0 {
                        return Err(bad("spare opcode"));
                    }
                    frame.pop_mask(u16::from(mask), 0)?;
                }
                0xb2 => {
                    let value = cursor.read_uleb128()?;
                    let value = i64::try_from(value).map_err(|_| bad("vsp increment"))?;
                    frame.vsp = frame.vsp.saturating_add(0x204 + (value << 2));
                }
                0xb3 | 0xc6 | 0xc8 | 0xc9 => {
                    let count = i64::from(cursor.read_u8()? & 0x0f) + 1;
                    // FSTMFDX stores an extra word.
                    let extra = if op == 0xb3 { 4 } else { 0 };
                    frame.vsp += 8 * count + extra;
                }
                0xb8..=0xbf => frame.vsp += 8 * (low + 1) + 4,
                0xc0..=0xc5 | 0xd0..=0xd7 => frame.vsp += 8 * (low + 1),
                0xc7 => {
                    let mask = cursor.read_u8()?;
                    if mask == 0 || mask & 0xf0 != 0 {
                        return Err(bad("spare opcode"));
                    }
                    frame.vsp += 4 * i64::from(mask.count_ones());
                }
                _ => return Err(bad("spare opcode")),
            }
        }

        Ok(frame)
    }

    /// Expresses the frame as call frame instructions for [`exidx_params`].
    ///
    /// The CFA is the caller's stack pointer. Registers are saved relative to it. If the program
    /// counter was popped, its slot holds the return address.
    pub fn to_dwarf(&self) -> Vec<u8> {
        let mut program = Vec::new();
        program.push(constants::DW_CFA_def_cfa_sf.0);
        write_uleb(&mut program, u64::from(self.base));
        write_sleb(&mut program, self.vsp);

        let mut saved: SmallVec<[(u16, i64); 16]> = self
            .saved
            .iter()
            .map(|&(register, offset)| (register, offset - self.vsp))
            .collect();
        // Write the program counter last so its slot wins over the link register.
        saved.sort_by_key(|&(register, _)| register == PC);

        for (register, offset) in saved {
            let column = if register == PC { LR } else { register };
            program.push(constants::DW_CFA_offset_extended_sf.0);
            write_uleb(&mut program, u64::from(column));
            write_sleb(&mut program, offset);
        }

        program
    }
}

fn write_uleb(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

fn write_sleb(buf: &mut Vec<u8>, mut value: i64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        let done = (value == 0 && byte & 0x40 == 0) || (value == -1 && byte & 0x40 != 0);
        if done {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

/// The frame parameters of programs produced by [`ArmFrame::to_dwarf`].
pub fn exidx_params(endian: Endian) -> FrameParams {
    FrameParams {
        code_alignment: 1,
        data_alignment: 1,
        return_address_register: LR,
        address_size: 4,
        endian,
        fde_encoding: constants::DW_EH_PE_absptr,
        bases: PointerBases::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use dbgi_testutils::Assembler;
    use similar_asserts::assert_eq;

    #[test]
    fn test_prel31() {
        assert_eq!(prel31(0x10, 0x1000), 0x1010);
        assert_eq!(prel31(0x7fff_fff0, 0x1000), 0x0ff0);
    }

    #[test]
    fn test_decode_push_frame() -> Result<(), CfiError> {
        // Undoes `push {r4, r7, lr}; add r7, sp, #4`: vsp = r7; vsp -= 4; pop {r4, r7, lr}
        let frame = ArmFrame::decode(&[0x97, 0x40, 0x84, 0x09, 0xb0])?;
        assert_eq!(frame.base, 7);
        assert_eq!(frame.vsp, -4 + 4 + 4 + 4);
        assert_eq!(frame.saved.as_slice(), &[(4, -4), (7, 0), (14, 4)]);
        Ok(())
    }

    #[test]
    fn test_decode_vfp_and_increment() -> Result<(), CfiError> {
        let frame = ArmFrame::decode(&[0xb2, 0x01, 0xc9, 0x01, 0xb8])?;
        assert_eq!(frame.base, SP);
        assert_eq!(frame.vsp, 0x204 + 4 + 16 + 12);
        assert!(frame.saved.is_empty());
        Ok(())
    }

    #[test]
    fn test_decode_errors() {
        let refuse = ArmFrame::decode(&[0x80, 0x00]).unwrap_err();
        assert_eq!(refuse.kind(), CfiErrorKind::BadExidx);

        let reserved = ArmFrame::decode(&[0x9d]).unwrap_err();
        assert_eq!(reserved.kind(), CfiErrorKind::BadExidx);

        let spare = ArmFrame::decode(&[0xb4]).unwrap_err();
        assert_eq!(spare.kind(), CfiErrorKind::BadExidx);

        let truncated = ArmFrame::decode(&[0x84]).unwrap_err();
        assert_eq!(truncated.kind(), CfiErrorKind::Truncated);
    }

    #[test]
    fn test_to_dwarf_pc_slot() -> Result<(), CfiError> {
        // pop {r4-r11, pc}: mask 0x8ff
        let frame = ArmFrame::decode(&[0x88, 0xff])?;
        assert_eq!(frame.vsp, 36);

        let program = frame.to_dwarf();
        let expected = Assembler::little()
            .u8(constants::DW_CFA_def_cfa_sf.0)
            .uleb(13)
            .sleb(36)
            .u8(constants::DW_CFA_offset_extended_sf.0)
            .uleb(4)
            .sleb(-36)
            .finish();
        assert_eq!(&program[..expected.len()], expected.as_slice());

        // The last rule moves the pc slot into the return address column.
        let tail = Assembler::little()
            .u8(constants::DW_CFA_offset_extended_sf.0)
            .uleb(14)
            .sleb(-4)
            .finish();
        assert!(program.ends_with(&tail));
        Ok(())
    }

    #[test]
    fn test_entries() -> Result<(), CfiError> {
        let mut extab = Assembler::little();
        // Personality 1 with one extra word: vsp += 64, pop {r4, lr}, finish
        extab.u32(0x8101_0f00 | 0x00a8).u32(0xb0b0_b0b0);
        let extab = extab.finish();

        let mut exidx = Assembler::little();
        exidx.u32(0x100).u32(0x80a8_b0b0); // inline: pop {r4, lr}
        exidx.u32(0x100).u32(EXIDX_CANTUNWIND);
        // prel31 from 0x8014 to the extab at 0x9000
        exidx.u32(0x100).u32(0x9000 - 0x8014);
        let exidx = exidx.finish();

        let exidx = Section::new(".ARM.exidx", &exidx, Endian::Little).with_address(0x8000);
        let extab = Section::new(".ARM.extab", &extab, Endian::Little).with_address(0x9000);

        let entries: Vec<_> = ExidxEntries::new(exidx, extab)
            .map(|(_, entry)| entry)
            .collect::<Result<_, _>>()?;

        assert_eq!(
            entries,
            vec![
                ExidxEntry {
                    function: 0x8100,
                    unwind: ExidxUnwind::Opcodes(vec![0xa8, 0xb0, 0xb0]),
                },
                ExidxEntry {
                    function: 0x8108,
                    unwind: ExidxUnwind::CantUnwind,
                },
                ExidxEntry {
                    function: 0x8110,
                    unwind: ExidxUnwind::Opcodes(vec![0x0f, 0xa8, 0xb0, 0xb0, 0xb0, 0xb0]),
                },
            ]
        );
        Ok(())
    }
}

//! Common information entries and frame description entries.

use dbgi_common::{Cursor, Format, Section};
use gimli::constants;

use crate::encoding::{
    encoded_pointer_size, read_encoded_pointer, read_encoded_size, PointerBases,
};
use crate::{CfiError, CfiErrorKind};

/// The section flavor of call frame information.
///
/// Both share the same instruction set, but differ in how entries are identified and how FDEs
/// refer to their CIE.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CfiFlavor {
    /// `.eh_frame`, as used for exception handling at runtime.
    EhFrame,
    /// `.debug_frame`, as defined by the DWARF standard.
    DebugFrame,
}

impl CfiFlavor {
    /// Returns `true` if the given entry id marks a CIE.
    fn is_cie_id(self, id: u64, format: Format) -> bool {
        match self {
            CfiFlavor::EhFrame => id == 0,
            CfiFlavor::DebugFrame => match format {
                Format::Dwarf32 => id == 0xffff_ffff,
                Format::Dwarf64 => id == u64::MAX,
            },
        }
    }
}

/// The kind of a raw entry, before its contents are parsed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EntryKind {
    /// A common information entry.
    Cie,
    /// A frame description entry referring to the CIE at the given section offset.
    Fde {
        /// The section offset of the CIE.
        cie_offset: u64,
    },
}

/// An entry of a call frame section whose header has been read.
#[derive(Clone, Copy, Debug)]
pub struct RawEntry<'a> {
    /// The section offset of the entry's length field.
    pub offset: u64,
    /// Whether this is a CIE or an FDE.
    pub kind: EntryKind,
    /// The contents following the entry id.
    pub body: Cursor<'a>,
}

/// Iterates the entries of `.eh_frame` or `.debug_frame`.
///
/// Yields the offset of every entry together with its header. A length running past the end of
/// the section ends the iteration after yielding the error.
#[derive(Clone, Debug)]
pub struct FrameEntries<'a> {
    cursor: Cursor<'a>,
    flavor: CfiFlavor,
    done: bool,
}

impl<'a> FrameEntries<'a> {
    /// Iterates all entries of `section`.
    pub fn new(section: Section<'a>, flavor: CfiFlavor) -> Self {
        FrameEntries {
            cursor: section.cursor(),
            flavor,
            done: false,
        }
    }

    /// Iterates entries starting at the given section offset.
    pub fn at(section: Section<'a>, flavor: CfiFlavor, offset: u64) -> Result<Self, CfiError> {
        Ok(FrameEntries {
            cursor: section.cursor_at(offset)?,
            flavor,
            done: false,
        })
    }

    fn read_entry(&mut self) -> Result<Option<RawEntry<'a>>, CfiError> {
        let (offset, length, format) = loop {
            let offset = self.cursor.position();
            let (length, format) = self.cursor.read_initial_length()?;
            if length != 0 {
                break (offset, length, format);
            }

            // A zero terminator ends `.eh_frame`, `.debug_frame` only pads.
            match self.flavor {
                CfiFlavor::EhFrame => {
                    self.done = true;
                    return Ok(None);
                }
                CfiFlavor::DebugFrame if self.cursor.is_empty() => return Ok(None),
                CfiFlavor::DebugFrame => continue,
            }
        };

        let mut body = self.cursor.split(length)?;
        let id_position = body.position();
        let id = body.read_offset(format)?;

        let kind = if self.flavor.is_cie_id(id, format) {
            EntryKind::Cie
        } else {
            let cie_offset = match self.flavor {
                CfiFlavor::EhFrame => id_position
                    .checked_sub(id)
                    .ok_or(CfiErrorKind::BadFde)?,
                CfiFlavor::DebugFrame => id,
            };
            EntryKind::Fde { cie_offset }
        };

        Ok(Some(RawEntry { offset, kind, body }))
    }
}

impl<'a> Iterator for FrameEntries<'a> {
    type Item = (u64, Result<RawEntry<'a>, CfiError>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.cursor.is_empty() {
            return None;
        }

        let offset = self.cursor.position();
        match self.read_entry() {
            Ok(Some(entry)) => Some((entry.offset, Ok(entry))),
            Ok(None) => None,
            Err(error) => {
                self.done = true;
                Some((offset, Err(error)))
            }
        }
    }
}

/// The parsed augmentation of a CIE.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Augmentation {
    /// The augmentation string starts with `z` and augmentation data follows.
    pub has_data: bool,
    /// The encoding of FDE pointers, from `R`.
    pub fde_encoding: gimli::DwEhPe,
    /// The encoding of language specific data area pointers, from `L`.
    pub lsda_encoding: Option<gimli::DwEhPe>,
    /// A personality routine is present, from `P`.
    pub has_personality: bool,
    /// The FDEs describe signal handler frames, from `S`.
    pub signal_frame: bool,
}

impl Default for Augmentation {
    fn default() -> Self {
        Augmentation {
            has_data: false,
            fde_encoding: constants::DW_EH_PE_absptr,
            lsda_encoding: None,
            has_personality: false,
            signal_frame: false,
        }
    }
}

/// Skips over a pointer without decoding it.
///
/// The personality pointer is commonly indirect, which cannot be resolved statically.
fn skip_encoded_pointer(
    cursor: &mut Cursor<'_>,
    encoding: gimli::DwEhPe,
    address_size: u8,
) -> Result<(), CfiError> {
    if encoding.0 & 0x70 == constants::DW_EH_PE_aligned.0 {
        let size = u64::from(address_size.max(1));
        let misalign = cursor.position() % size;
        if misalign != 0 {
            cursor.skip(size - misalign)?;
        }
        cursor.skip(size)?;
        return Ok(());
    }

    match encoded_pointer_size(encoding, address_size) {
        Some(size) => cursor.skip(u64::from(size))?,
        None => match gimli::DwEhPe(encoding.0 & 0x0f) {
            constants::DW_EH_PE_uleb128 => {
                cursor.read_uleb128()?;
            }
            constants::DW_EH_PE_sleb128 => {
                cursor.read_sleb128()?;
            }
            _ => return Err(CfiErrorKind::BadPointerEncoding.into()),
        },
    }

    Ok(())
}

/// A common information entry, holding what a group of FDEs share.
#[derive(Clone, Copy, Debug)]
pub struct Cie<'a> {
    /// The section offset of this entry.
    pub offset: u64,
    /// The CIE version, 1, 3 or 4.
    pub version: u8,
    /// The parsed augmentation string.
    pub augmentation: Augmentation,
    /// The size of target addresses.
    pub address_size: u8,
    /// The factor applied to advance instructions.
    pub code_alignment: u64,
    /// The factor applied to offset instructions.
    pub data_alignment: i64,
    /// The rule column holding the return address.
    pub return_address_register: u16,
    /// Instructions establishing the initial rules of every FDE.
    pub initial_instructions: &'a [u8],
}

impl<'a> Cie<'a> {
    /// Parses the body of a CIE.
    ///
    /// `address_size` is used unless the CIE specifies its own.
    pub fn parse(entry: &RawEntry<'a>, address_size: u8) -> Result<Self, CfiError> {
        if entry.kind != EntryKind::Cie {
            return Err(CfiErrorKind::BadCie.into());
        }

        let mut cursor = entry.body;
        let version = cursor.read_u8()?;
        if !matches!(version, 1 | 3 | 4) {
            return Err(CfiError::new(
                CfiErrorKind::BadCie,
                format!("unsupported version {version}"),
            ));
        }

        let augmentation_string = cursor.read_cstr()?;
        let mut address_size = address_size;
        if version >= 4 {
            address_size = cursor.read_u8()?;
            let segment_size = cursor.read_u8()?;
            if segment_size != 0 || !matches!(address_size, 2 | 4 | 8) {
                return Err(CfiError::new(
                    CfiErrorKind::BadCie,
                    format!("address size {address_size}, segment size {segment_size}"),
                ));
            }
        }

        // Old GCC augmentation carrying the address of exception tables.
        if augmentation_string == b"eh" {
            cursor.skip(u64::from(address_size))?;
        }

        let code_alignment = cursor.read_uleb128()?;
        let data_alignment = cursor.read_sleb128()?;
        let return_address_register = if version == 1 {
            u64::from(cursor.read_u8()?)
        } else {
            cursor.read_uleb128()?
        };
        let return_address_register = u16::try_from(return_address_register)
            .map_err(|_| CfiError::new(CfiErrorKind::BadCie, "return address register"))?;

        let mut augmentation = Augmentation::default();
        match augmentation_string {
            [] | b"eh" => {}
            [b'z', rest @ ..] => {
                augmentation.has_data = true;
                let length = cursor.read_uleb128()?;
                let mut data = cursor.split(length)?;

                for &c in rest {
                    match c {
                        b'R' => augmentation.fde_encoding = gimli::DwEhPe(data.read_u8()?),
                        b'L' => augmentation.lsda_encoding = Some(gimli::DwEhPe(data.read_u8()?)),
                        b'P' => {
                            let encoding = gimli::DwEhPe(data.read_u8()?);
                            skip_encoded_pointer(&mut data, encoding, address_size)?;
                            augmentation.has_personality = true;
                        }
                        b'S' => augmentation.signal_frame = true,
                        // Branch target identification and memory tagging do not affect rules.
                        b'B' | b'G' => {}
                        _ => {
                            return Err(CfiError::new(
                                CfiErrorKind::UnsupportedAugmentation,
                                format!("augmentation character {:?}", char::from(c)),
                            ))
                        }
                    }
                }
            }
            _ => {
                return Err(CfiError::new(
                    CfiErrorKind::UnsupportedAugmentation,
                    String::from_utf8_lossy(augmentation_string).into_owned(),
                ))
            }
        }

        let initial_instructions = cursor.read_bytes(cursor.remaining() as u64)?;

        Ok(Cie {
            offset: entry.offset,
            version,
            augmentation,
            address_size,
            code_alignment,
            data_alignment,
            return_address_register,
            initial_instructions,
        })
    }
}

/// A frame description entry, describing a range of code.
#[derive(Clone, Copy, Debug)]
pub struct Fde<'a> {
    /// The section offset of this entry.
    pub offset: u64,
    /// The section offset of the CIE this entry refers to.
    pub cie_offset: u64,
    /// The first address covered, before load bias.
    pub initial_location: u64,
    /// The number of bytes covered.
    pub address_range: u64,
    /// The call frame instructions of this entry.
    pub instructions: &'a [u8],
}

impl<'a> Fde<'a> {
    /// Parses the body of an FDE with its CIE.
    pub fn parse(
        entry: &RawEntry<'a>,
        cie: &Cie<'a>,
        bases: &PointerBases,
    ) -> Result<Self, CfiError> {
        let EntryKind::Fde { cie_offset } = entry.kind else {
            return Err(CfiErrorKind::BadFde.into());
        };

        let mut cursor = entry.body;
        let encoding = cie.augmentation.fde_encoding;
        let initial_location = read_encoded_pointer(&mut cursor, encoding, bases, cie.address_size)
            .map_err(|e| CfiError::new(CfiErrorKind::BadFde, e))?;
        let address_range = read_encoded_size(&mut cursor, encoding, cie.address_size)
            .map_err(|e| CfiError::new(CfiErrorKind::BadFde, e))?;

        if cie.augmentation.has_data {
            let length = cursor.read_uleb128()?;
            cursor.skip(length)?;
        }

        let instructions = cursor.read_bytes(cursor.remaining() as u64)?;

        Ok(Fde {
            offset: entry.offset,
            cie_offset,
            initial_location,
            address_range,
            instructions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use dbgi_common::Endian;
    use dbgi_testutils::Assembler;
    use similar_asserts::assert_eq;

    fn eh_frame() -> Vec<u8> {
        let mut asm = Assembler::little();
        asm.length32(|asm| {
            asm.u32(0) // CIE id
                .u8(1)
                .cstr("zPLR")
                .uleb(1)
                .sleb(-8)
                .u8(16)
                .block(|asm| {
                    // Indirect, PC-relative personality.
                    asm.u8(0x9b).u32(0x1234).u8(0x1b).u8(0x1b);
                })
                .u8(constants::DW_CFA_nop.0);
        });
        asm.label("fde").length32(|asm| {
            let id_position = asm.position();
            asm.u32(id_position as u32) // back to the CIE at 0
                .i32(0x100)
                .u32(0x40)
                .uleb(4)
                .u32(0)
                .u8(constants::DW_CFA_nop.0);
        });
        asm.u32(0);
        asm.u32(0xdead_beef);
        asm.finish()
    }

    #[test]
    fn test_eh_frame_entries() -> Result<(), CfiError> {
        let data = eh_frame();
        let section = Section::new(".eh_frame", &data, Endian::Little).with_address(0x8000);
        let entries: Vec<_> = FrameEntries::new(section, CfiFlavor::EhFrame).collect();
        assert_eq!(entries.len(), 2);

        let cie = entries[0].1.as_ref().map_err(|_| CfiErrorKind::BadCie)?;
        let cie = Cie::parse(cie, 8)?;
        assert_eq!(cie.version, 1);
        assert_eq!(cie.data_alignment, -8);
        assert_eq!(cie.return_address_register, 16);
        assert_eq!(
            cie.augmentation,
            Augmentation {
                has_data: true,
                fde_encoding: gimli::DwEhPe(0x1b),
                lsda_encoding: Some(gimli::DwEhPe(0x1b)),
                has_personality: true,
                signal_frame: false,
            }
        );
        assert_eq!(cie.initial_instructions, &[0]);

        let (offset, fde) = &entries[1];
        let fde = fde.as_ref().map_err(|_| CfiErrorKind::BadFde)?;
        assert_eq!(fde.kind, EntryKind::Fde { cie_offset: 0 });

        let fde = Fde::parse(fde, &cie, &PointerBases::new(section.address()))?;
        // The location is relative to its own field, 8 bytes into the FDE.
        assert_eq!(fde.initial_location, 0x8000 + *offset + 8 + 0x100);
        assert_eq!(fde.address_range, 0x40);
        assert_eq!(fde.instructions, &[0]);
        Ok(())
    }

    #[test]
    fn test_debug_frame_cie_v4() -> Result<(), CfiError> {
        let mut asm = Assembler::little();
        asm.length32(|asm| {
            asm.u32(0xffff_ffff)
                .u8(4)
                .cstr("")
                .u8(4)
                .u8(0)
                .uleb(2)
                .sleb(-4)
                .uleb(14);
        });
        asm.length32(|asm| {
            asm.u32(0).u32(0x1000).u32(0x20);
        });
        let data = asm.finish();
        let section = Section::new(".debug_frame", &data, Endian::Little);

        let entries: Vec<_> = FrameEntries::new(section, CfiFlavor::DebugFrame)
            .map(|(_, entry)| entry)
            .collect::<Result<_, _>>()?;
        let cie = Cie::parse(&entries[0], 8)?;
        assert_eq!(cie.address_size, 4);
        assert_eq!(cie.code_alignment, 2);
        assert_eq!(cie.return_address_register, 14);

        let fde = Fde::parse(&entries[1], &cie, &PointerBases::default())?;
        assert_eq!(fde.cie_offset, 0);
        assert_eq!(fde.initial_location, 0x1000);
        assert_eq!(fde.address_range, 0x20);
        Ok(())
    }

    #[test]
    fn test_debug_frame_long_padding() -> Result<(), CfiError> {
        let mut asm = Assembler::little();
        asm.fill(4 << 20, 0);
        let cie_offset = asm.position() as u32;
        asm.length32(|asm| {
            asm.u32(0xffff_ffff)
                .u8(1)
                .cstr("")
                .uleb(1)
                .sleb(-8)
                .u8(16);
        });
        asm.fill(64, 0);
        asm.length32(|asm| {
            asm.u32(cie_offset).u64(0x1000).u64(0x20);
        });
        let data = asm.finish();
        let section = Section::new(".debug_frame", &data, Endian::Little);

        let entries: Vec<_> = FrameEntries::new(section, CfiFlavor::DebugFrame)
            .map(|(_, entry)| entry)
            .collect::<Result<_, _>>()?;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].offset, u64::from(cie_offset));
        assert_eq!(entries[0].kind, EntryKind::Cie);
        assert_eq!(
            entries[1].kind,
            EntryKind::Fde {
                cie_offset: u64::from(cie_offset)
            }
        );

        let cie = Cie::parse(&entries[0], 8)?;
        let fde = Fde::parse(&entries[1], &cie, &PointerBases::default())?;
        assert_eq!(fde.initial_location, 0x1000);
        assert_eq!(fde.address_range, 0x20);
        Ok(())
    }

    #[test]
    fn test_unsupported_augmentation() {
        let mut asm = Assembler::little();
        asm.length32(|asm| {
            asm.u32(0).u8(1).cstr("zX").uleb(1).sleb(-8).u8(16).uleb(0);
        });
        let data = asm.finish();
        let section = Section::new(".eh_frame", &data, Endian::Little);

        let (_, entry) = FrameEntries::new(section, CfiFlavor::EhFrame)
            .next()
            .unwrap();
        let error = Cie::parse(&entry.unwrap(), 8).unwrap_err();
        assert_eq!(error.kind(), CfiErrorKind::UnsupportedAugmentation);
    }

    #[test]
    fn test_bad_version() {
        let mut asm = Assembler::little();
        asm.length32(|asm| {
            asm.u32(0).u8(2).cstr("").uleb(1).sleb(-8).u8(16);
        });
        let data = asm.finish();
        let section = Section::new(".eh_frame", &data, Endian::Little);

        let (_, entry) = FrameEntries::new(section, CfiFlavor::EhFrame)
            .next()
            .unwrap();
        let error = Cie::parse(&entry.unwrap(), 8).unwrap_err();
        assert_eq!(error.kind(), CfiErrorKind::BadCie);
    }

    #[test]
    fn test_truncated_entry_stops() {
        let data = Assembler::little().u32(0x100).u32(0).finish();
        let section = Section::new(".eh_frame", &data, Endian::Little);

        let entries: Vec<_> = FrameEntries::new(section, CfiFlavor::EhFrame).collect();
        assert_eq!(entries.len(), 1);
        let error = entries[0].1.as_ref().unwrap_err();
        assert_eq!(error.kind(), CfiErrorKind::Truncated);
    }
}

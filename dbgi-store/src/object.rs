//! Maps ELF objects onto runtime addresses.
//!
//! The mapper reads the ELF header, program headers and section headers through an [`Image`], so
//! objects served by a remote agent only transfer the parts that are actually needed. It derives
//! memory mappings and section locations, reads the symbol tables, and hands out the raw bytes of
//! debug sections to the decoders.

use std::borrow::Cow;
use std::io::Read;

use dbgi_common::{Arch, Diagnostics, Endian, Image, Section, StringPool};
use flate2::read::ZlibDecoder;
use goblin::container::{Container, Ctx};
use goblin::elf::compression_header::{CompressionHeader, ELFCOMPRESS_ZLIB};
use goblin::elf::dynamic::{Dyn, DT_NULL, DT_SONAME};
use goblin::elf::header::{self, Header};
use goblin::elf::program_header::{self, ProgramHeader};
use goblin::elf::section_header::{self, SectionHeader};
use goblin::elf::sym::{self, Sym};
use goblin::elf::Elf;
use goblin::strtab::Strtab;
use scroll::ctx::{SizeWith, TryFromCtx};
use scroll::Pread;

use crate::error::{ObjectPart, StoreError};
use crate::mappings::{Mapping, Permissions, SectionInfo, SectionKind};
use crate::symbols::Symbol;

const SHF_COMPRESSED: u64 = section_header::SHF_COMPRESSED as u64;

/// The size of the 64-bit ELF header, which is larger than the 32-bit one.
const MAX_HEADER_SIZE: u64 = 64;

/// The most memory reserved up front for a decompressed section.
const MAX_PREALLOCATION: usize = 16 << 20;

/// The note type of GNU build identifiers.
const NT_GNU_BUILD_ID: u32 = 3;

/// The sections read for debug information and call frame information.
pub const DEBUG_SECTIONS: &[&str] = &[
    ".debug_info",
    ".debug_types",
    ".debug_abbrev",
    ".debug_str",
    ".debug_line",
    ".debug_ranges",
    ".debug_loc",
    ".debug_frame",
    ".eh_frame",
    ".ARM.exidx",
    ".ARM.extab",
];

/// Parses a table of fixed-size entries.
fn parse_table<T>(
    bytes: &[u8],
    count: usize,
    entsize: usize,
    ctx: Ctx,
) -> Result<Vec<T>, goblin::error::Error>
where
    T: for<'a> TryFromCtx<'a, Ctx, Error = goblin::error::Error>,
{
    (0..count)
        .map(|index| bytes.pread_with(index * entsize, ctx))
        .collect()
}

/// The contents of a section.
#[derive(Clone, Debug)]
pub struct SectionData<'d> {
    /// The section name.
    pub name: &'static str,
    /// The link-time address of the section, or 0 for sections that are not loaded.
    pub address: u64,
    /// The section contents, decompressed if needed.
    pub data: Cow<'d, [u8]>,
}

impl SectionData<'_> {
    /// Returns a decoder view of the data.
    pub fn section(&self, endian: Endian) -> Section<'_> {
        Section::new(self.name, &self.data, endian).with_address(self.address)
    }
}

/// The target of a `.gnu_debugaltlink` section.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AltLink {
    /// The path of the alternate debug file.
    pub path: String,
    /// The build identifier the alternate debug file must have.
    pub build_id: Vec<u8>,
}

/// An ELF object read through an [`Image`].
#[derive(Debug)]
pub struct ElfObject<'d> {
    image: Image<'d>,
    ctx: Ctx,
    header: Header,
    program_headers: Vec<ProgramHeader>,
    sections: Vec<(String, SectionHeader)>,
}

impl<'d> ElfObject<'d> {
    /// Returns `true` if the data starts with the ELF magic.
    pub fn test(data: &[u8]) -> bool {
        data.starts_with(header::ELFMAG)
    }

    /// Parses the headers of an ELF object.
    pub fn parse(image: Image<'d>) -> Result<Self, StoreError> {
        let prefix = image
            .read(0, image.size().min(MAX_HEADER_SIZE))
            .map_err(|e| StoreError::Image(ObjectPart::Header, e))?;
        if !Self::test(&prefix) {
            return Err(StoreError::NotElf);
        }

        let header =
            Elf::parse_header(&prefix).map_err(|e| StoreError::Malformed(ObjectPart::Header, e))?;
        let container = header
            .container()
            .map_err(|e| StoreError::Malformed(ObjectPart::Header, e))?;
        let endian = header
            .endianness()
            .map_err(|e| StoreError::Malformed(ObjectPart::Header, e))?;
        let ctx = Ctx::new(container, endian);
        drop(prefix);

        let program_headers = Self::read_table(
            &image,
            header.e_phoff,
            header.e_phnum.into(),
            header.e_phentsize.into(),
            ctx,
            ObjectPart::ProgramHeaders,
        )?;
        let section_headers: Vec<SectionHeader> = Self::read_table(
            &image,
            header.e_shoff,
            header.e_shnum.into(),
            header.e_shentsize.into(),
            ctx,
            ObjectPart::SectionHeaders,
        )?;

        let names = match section_headers.get(usize::from(header.e_shstrndx)) {
            Some(strtab) => image
                .read(strtab.sh_offset, strtab.sh_size)
                .map_err(|e| StoreError::Image(ObjectPart::SectionNames, e))?,
            None => Cow::Borrowed(&[][..]),
        };
        let names = Strtab::parse(&names, 0, names.len(), 0)
            .map_err(|e| StoreError::Malformed(ObjectPart::SectionNames, e))?;

        let sections = section_headers
            .into_iter()
            .map(|header| {
                let name = names.get_at(header.sh_name).unwrap_or_default().to_owned();
                (name, header)
            })
            .collect();

        Ok(ElfObject {
            image,
            ctx,
            header,
            program_headers,
            sections,
        })
    }

    fn read_table<T>(
        image: &Image<'_>,
        offset: u64,
        count: usize,
        entsize: usize,
        ctx: Ctx,
        part: ObjectPart,
    ) -> Result<Vec<T>, StoreError>
    where
        T: for<'a> TryFromCtx<'a, Ctx, Error = goblin::error::Error>,
    {
        if count == 0 || offset == 0 {
            return Ok(Vec::new());
        }

        let bytes = image
            .read(offset, (count * entsize) as u64)
            .map_err(|e| StoreError::Image(part, e))?;
        parse_table(&bytes, count, entsize, ctx).map_err(|e| StoreError::Malformed(part, e))
    }

    /// The byte order of the object.
    pub fn endian(&self) -> Endian {
        self.ctx.le
    }

    /// Returns `true` for 64-bit objects.
    pub fn is_64(&self) -> bool {
        self.ctx.container == Container::Big
    }

    /// The CPU architecture of the object.
    pub fn arch(&self) -> Arch {
        match self.header.e_machine {
            header::EM_386 => Arch::X86,
            header::EM_X86_64 => Arch::Amd64,
            header::EM_AARCH64 => Arch::Arm64,
            header::EM_ARM => Arch::Arm,
            header::EM_PPC => Arch::Ppc,
            header::EM_PPC64 => Arch::Ppc64,
            header::EM_MIPS | header::EM_MIPS_RS3_LE => {
                if self.is_64() {
                    Arch::Mips64
                } else {
                    Arch::Mips
                }
            }
            _ => Arch::Unknown,
        }
    }

    /// The link-time address of the first loaded segment.
    ///
    /// For executables this is the address the object is linked at. Shared libraries are usually
    /// linked at 0.
    pub fn load_address(&self) -> u64 {
        self.program_headers
            .iter()
            .find(|phdr| phdr.p_type == program_header::PT_LOAD)
            .map_or(0, |phdr| phdr.p_vaddr)
    }

    /// The memory mappings of all loaded segments.
    pub fn mappings(&self, bias: u64) -> Vec<Mapping> {
        self.program_headers
            .iter()
            .filter(|phdr| phdr.p_type == program_header::PT_LOAD)
            .map(|phdr| Mapping {
                address: phdr.p_vaddr.wrapping_add(bias),
                size: phdr.p_memsz,
                file_offset: phdr.p_offset,
                permissions: Permissions {
                    read: phdr.p_flags & program_header::PF_R != 0,
                    write: phdr.p_flags & program_header::PF_W != 0,
                    execute: phdr.p_flags & program_header::PF_X != 0,
                },
            })
            .collect()
    }

    /// The runtime locations of the well-known sections.
    pub fn section_infos(&self, bias: u64) -> Vec<SectionInfo> {
        self.sections
            .iter()
            .filter_map(|(name, header)| {
                let kind = SectionKind::from_name(name)?;
                Some(SectionInfo {
                    kind,
                    address: header.sh_addr.wrapping_add(bias),
                    size: header.sh_size,
                    bias,
                })
            })
            .collect()
    }

    /// Locates a section with data.
    ///
    /// Returns whether the section is compressed. Sections named `.zdebug_*` are compressed with
    /// the GNU scheme.
    fn find_section(&self, name: &str) -> Option<(bool, &SectionHeader)> {
        for (section_name, header) in &self.sections {
            if header.sh_type == section_header::SHT_NOBITS || header.sh_offset == 0 {
                continue;
            }

            let (compressed, section_name) = match section_name.strip_prefix(".z") {
                Some(rest) => (true, rest),
                None => (
                    header.sh_flags & SHF_COMPRESSED != 0,
                    section_name.get(1..).unwrap_or_default(),
                ),
            };

            if Some(section_name) == name.get(1..) {
                return Some((compressed, header));
            }
        }

        None
    }

    /// Reads the contents of a section.
    ///
    /// Returns `Ok(None)` if the object has no such section.
    pub fn section_data(&self, name: &'static str) -> Result<Option<SectionData<'_>>, StoreError> {
        let Some((compressed, header)) = self.find_section(name) else {
            return Ok(None);
        };

        let data = self
            .image
            .read(header.sh_offset, header.sh_size)
            .map_err(|e| StoreError::Image(ObjectPart::Section(name), e))?;

        let data = if compressed {
            match decompress_section(&data, self.ctx) {
                Some(decompressed) => Cow::Owned(decompressed),
                None => return Err(StoreError::Compression(ObjectPart::Section(name))),
            }
        } else {
            data
        };

        Ok(Some(SectionData {
            name,
            address: header.sh_addr,
            data,
        }))
    }

    /// Reads the symbols of `.symtab` and `.dynsym`.
    ///
    /// Functions and indirect functions become text symbols, data objects become data symbols.
    /// Undefined and unnamed symbols are skipped. A symbol table that cannot be read is reported
    /// and skipped.
    pub fn symbols(
        &self,
        bias: u64,
        strings: &mut StringPool,
        diagnostics: &mut Diagnostics,
    ) -> Vec<Symbol> {
        let mut symbols = Vec::new();

        for (name, header) in &self.sections {
            let section = match header.sh_type {
                section_header::SHT_SYMTAB => ".symtab",
                section_header::SHT_DYNSYM => ".dynsym",
                _ => continue,
            };

            if let Err(error) = self.read_symbols(header, bias, strings, &mut symbols) {
                diagnostics.warn(
                    section,
                    Some(header.sh_offset),
                    format_args!("cannot read symbols of {name}: {error}"),
                );
            }
        }

        symbols
    }

    fn read_symbols(
        &self,
        header: &SectionHeader,
        bias: u64,
        strings: &mut StringPool,
        symbols: &mut Vec<Symbol>,
    ) -> Result<(), StoreError> {
        let part = ObjectPart::Section(".symtab");
        let strtab = self
            .sections
            .get(header.sh_link as usize)
            .map(|(_, strtab)| strtab)
            .ok_or(StoreError::Malformed(
                part,
                goblin::error::Error::Malformed("symbol string table missing".into()),
            ))?;

        let data = self
            .image
            .read(header.sh_offset, header.sh_size)
            .map_err(|e| StoreError::Image(part, e))?;
        let names = self
            .image
            .read(strtab.sh_offset, strtab.sh_size)
            .map_err(|e| StoreError::Image(part, e))?;
        let names =
            Strtab::parse(&names, 0, names.len(), 0).map_err(|e| StoreError::Malformed(part, e))?;

        let entsize = match header.sh_entsize as usize {
            0 => Sym::size_with(&self.ctx),
            size => size,
        };
        let entries: Vec<Sym> = parse_table(&data, data.len() / entsize, entsize, self.ctx)
            .map_err(|e| StoreError::Malformed(part, e))?;

        for entry in entries {
            let (is_text, is_ifunc) = match entry.st_type() {
                sym::STT_FUNC => (true, false),
                sym::STT_GNU_IFUNC => (true, true),
                sym::STT_OBJECT => (false, false),
                _ => continue,
            };

            if entry.st_shndx == section_header::SHN_UNDEF as usize {
                continue;
            }

            let name = names.get_at(entry.st_name).unwrap_or_default();
            if name.is_empty() {
                continue;
            }

            let mut symbol = Symbol::new(
                strings.intern(name),
                entry.st_value.wrapping_add(bias),
                entry.st_size,
                is_text,
            );
            symbol.is_ifunc = is_ifunc;
            symbols.push(symbol);
        }

        Ok(())
    }

    /// Returns the `DT_SONAME` entry of the dynamic section.
    pub fn soname(&self) -> Result<Option<String>, StoreError> {
        let part = ObjectPart::Section(".dynamic");
        let Some((_, header)) = self
            .sections
            .iter()
            .find(|(_, header)| header.sh_type == section_header::SHT_DYNAMIC)
        else {
            return Ok(None);
        };

        let data = self
            .image
            .read(header.sh_offset, header.sh_size)
            .map_err(|e| StoreError::Image(part, e))?;

        let mut offset = 0;
        let mut soname = None;
        while offset < data.len() {
            let entry: Dyn = data
                .gread_with(&mut offset, self.ctx)
                .map_err(|e| StoreError::Malformed(part, e))?;
            match entry.d_tag {
                DT_NULL => break,
                DT_SONAME => soname = Some(entry.d_val),
                _ => (),
            }
        }

        let (Some(soname), Some((_, strtab))) = (soname, self.sections.get(header.sh_link as usize))
        else {
            return Ok(None);
        };

        let names = self
            .image
            .read(strtab.sh_offset, strtab.sh_size)
            .map_err(|e| StoreError::Image(part, e))?;
        let names =
            Strtab::parse(&names, 0, names.len(), 0).map_err(|e| StoreError::Malformed(part, e))?;

        Ok(names.get_at(soname as usize).map(str::to_owned))
    }

    /// Searches the note sections for a GNU build identifier.
    pub fn build_id(&self) -> Option<Vec<u8>> {
        self.sections
            .iter()
            .filter(|(_, header)| header.sh_type == section_header::SHT_NOTE)
            .find_map(|(_, header)| {
                let data = self.image.read(header.sh_offset, header.sh_size).ok()?;
                find_build_id(&data, self.endian()).map(<[u8]>::to_vec)
            })
    }

    /// Reads the `.gnu_debugaltlink` section.
    pub fn alt_link(&self) -> Result<Option<AltLink>, StoreError> {
        let Some(data) = self.section_data(".gnu_debugaltlink")? else {
            return Ok(None);
        };

        let mut cursor = data.section(self.endian()).cursor();
        let path = cursor
            .read_cstr()
            .map_err(|e| StoreError::Image(ObjectPart::Section(data.name), e.into()))?;

        let build_id = cursor
            .read_bytes(cursor.remaining() as u64)
            .map_err(|e| StoreError::Image(ObjectPart::Section(data.name), e.into()))?;

        Ok(Some(AltLink {
            path: String::from_utf8_lossy(path).into_owned(),
            build_id: build_id.to_vec(),
        }))
    }
}

/// Finds the descriptor of an `NT_GNU_BUILD_ID` note owned by `GNU`.
fn find_build_id(data: &[u8], endian: Endian) -> Option<&[u8]> {
    let section = Section::new(".note", data, endian);
    let mut cursor = section.cursor();

    while !cursor.is_empty() {
        let name_size = u64::from(cursor.read_u32().ok()?);
        let desc_size = u64::from(cursor.read_u32().ok()?);
        let note_type = cursor.read_u32().ok()?;

        let name = cursor.read_bytes(name_size).ok()?;
        cursor.skip((4 - name_size % 4) % 4).ok()?;
        let desc = cursor.read_bytes(desc_size).ok()?;
        cursor.skip((4 - desc_size % 4) % 4).ok()?;

        if note_type == NT_GNU_BUILD_ID && name == b"GNU\0" {
            return Some(desc);
        }
    }

    None
}

/// Decompresses section data, if the compression is supported.
///
/// The declared size is only trusted up to the point where the stream ends. A stream that is
/// shorter or longer than declared is rejected.
fn decompress_section(section_data: &[u8], ctx: Ctx) -> Option<Vec<u8>> {
    let (size, compressed) = if section_data.starts_with(b"ZLIB") {
        // "ZLIB" followed by the big-endian 8-byte decompressed size
        let size = section_data.get(4..12)?;
        let mut size_bytes = [0; 8];
        size_bytes.copy_from_slice(size);
        (u64::from_be_bytes(size_bytes), &section_data[12..])
    } else {
        let compression = CompressionHeader::parse(section_data, 0, ctx).ok()?;
        if compression.ch_type != ELFCOMPRESS_ZLIB {
            return None;
        }
        let compressed = section_data.get(CompressionHeader::size(ctx)..)?;
        (compression.ch_size, compressed)
    };

    let capacity = usize::try_from(size).unwrap_or(usize::MAX).min(MAX_PREALLOCATION);
    let mut decompressed = Vec::with_capacity(capacity);
    ZlibDecoder::new(compressed)
        .take(size.saturating_add(1))
        .read_to_end(&mut decompressed)
        .ok()?;

    if decompressed.len() as u64 != size {
        tracing::debug!(
            declared = size,
            actual = decompressed.len(),
            "decompressed size mismatch"
        );
        return None;
    }

    Some(decompressed)
}

use std::io::Write;

use dbgi_common::{Arch, Endian, Image, Section};
use dbgi_dwarf::{DwarfOptions, DwarfSections};
use dbgi_store::{DebugInfo, LoadOptions, ObjectPart, SectionKind, StoreError, Symbol};
use dbgi_testutils::Assembler;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use gimli::constants;
use goblin::elf::header::EM_X86_64;
use goblin::elf::program_header::{PF_R, PF_X, PT_LOAD};
use goblin::elf::section_header::{
    SHF_ALLOC, SHF_COMPRESSED, SHF_EXECINSTR, SHT_NOTE, SHT_PROGBITS, SHT_STRTAB, SHT_SYMTAB,
};
use goblin::elf::sym::{STB_GLOBAL, STT_FUNC, STT_OBJECT};
use similar_asserts::assert_eq;

type Error = Box<dyn std::error::Error>;

/// Where section contents start in the synthesized files.
const DATA_START: usize = 0x200;

struct TestSection {
    name: &'static str,
    kind: u32,
    flags: u64,
    address: u64,
    link: u32,
    entsize: u64,
    data: Vec<u8>,
}

impl TestSection {
    fn new(name: &'static str, kind: u32, data: Vec<u8>) -> Self {
        TestSection {
            name,
            kind,
            flags: 0,
            address: 0,
            link: 0,
            entsize: 0,
            data,
        }
    }

    fn flags(mut self, flags: u32) -> Self {
        self.flags = flags.into();
        self
    }

    fn address(mut self, address: u64) -> Self {
        self.address = address;
        self
    }

    fn link(mut self, link: u32, entsize: u64) -> Self {
        self.link = link;
        self.entsize = entsize;
        self
    }
}

/// Writes a little-endian ELF64 shared object with one executable segment at `0x1000..0x1100`.
///
/// Sections get indexes in the given order, starting at 1. The section name table is appended.
/// Returns the file and the offset of the section header table.
fn build_elf(mut sections: Vec<TestSection>) -> (Vec<u8>, usize) {
    let mut shstrtab = vec![0];
    let mut names = Vec::new();
    for section in &sections {
        names.push(shstrtab.len() as u32);
        shstrtab.extend_from_slice(section.name.as_bytes());
        shstrtab.push(0);
    }
    names.push(shstrtab.len() as u32);
    shstrtab.extend_from_slice(b".shstrtab\0");
    sections.push(TestSection::new(".shstrtab", SHT_STRTAB, shstrtab));

    let mut offsets = Vec::new();
    let mut offset = DATA_START;
    for section in &sections {
        offsets.push(offset);
        offset = (offset + section.data.len() + 7) & !7;
    }
    let shoff = offset;

    let mut asm = Assembler::little();
    asm.bytes(b"\x7fELF").u8(2).u8(1).u8(1).fill(9, 0);
    asm.u16(3)
        .u16(EM_X86_64)
        .u32(1)
        .u64(0x1000)
        .u64(64)
        .u64(shoff as u64)
        .u32(0)
        .u16(64)
        .u16(56)
        .u16(1)
        .u16(64)
        .u16(sections.len() as u16 + 1)
        .u16(sections.len() as u16);

    asm.u32(PT_LOAD)
        .u32(PF_R | PF_X)
        .u64(0)
        .u64(0x1000)
        .u64(0x1000)
        .u64(0x100)
        .u64(0x100)
        .u64(0x1000);

    for (section, &offset) in sections.iter().zip(&offsets) {
        asm.fill(offset - asm.position(), 0).bytes(&section.data);
    }
    asm.fill(shoff - asm.position(), 0);

    asm.fill(64, 0);
    for ((section, &offset), &name) in sections.iter().zip(&offsets).zip(&names) {
        asm.u32(name)
            .u32(section.kind)
            .u64(section.flags)
            .u64(section.address)
            .u64(offset as u64)
            .u64(section.data.len() as u64)
            .u32(section.link)
            .u32(0)
            .u64(1)
            .u64(section.entsize);
    }

    (asm.finish(), shoff)
}

fn symtab() -> (Vec<u8>, Vec<u8>) {
    let mut strtab = Assembler::little();
    strtab.u8(0);
    let mut names = Vec::new();
    for name in ["main", "foo", "foo@@VER_1.0", "counter"] {
        names.push(strtab.position() as u32);
        strtab.cstr(name);
    }

    let mut symtab = Assembler::little();
    symtab.fill(24, 0);
    let symbols = [
        (names[0], STT_FUNC, 0x1000, 0x20),
        (names[1], STT_FUNC, 0x1020, 0x10),
        (names[2], STT_FUNC, 0x1020, 0x10),
        (names[3], STT_OBJECT, 0x3000, 0x4),
    ];
    for (name, kind, value, size) in symbols {
        symtab
            .u32(name)
            .u8((STB_GLOBAL << 4) | kind)
            .u8(0)
            .u16(1)
            .u64(value)
            .u64(size);
    }

    (symtab.finish(), strtab.finish())
}

/// A line program without a compilation unit: `main.c` lines 5 and 7 at `0x1000` and `0x1010`.
fn debug_line() -> Vec<u8> {
    let mut asm = Assembler::little();
    asm.length32(|asm| {
        asm.u16(2);
        let at = asm.position();
        asm.u32(0);
        let start = asm.position();
        asm.u8(1)
            .u8(1)
            .u8((-5i8) as u8)
            .u8(14)
            .u8(13)
            .bytes(&[0, 1, 1, 1, 1, 0, 0, 0, 1, 0, 0, 1])
            .u8(0)
            .cstr("main.c")
            .uleb(0)
            .uleb(0)
            .uleb(0)
            .u8(0);
        let header_length = (asm.position() - start) as u32;
        asm.patch_u32(at, header_length);

        asm.u8(0)
            .uleb(9)
            .u8(constants::DW_LNE_set_address.0)
            .u64(0x1000);
        asm.u8(constants::DW_LNS_advance_line.0).sleb(4);
        asm.u8(constants::DW_LNS_copy.0);
        asm.u8(constants::DW_LNS_advance_pc.0).uleb(0x10);
        asm.u8(constants::DW_LNS_advance_line.0).sleb(2);
        asm.u8(constants::DW_LNS_copy.0);
        asm.u8(constants::DW_LNS_advance_pc.0).uleb(0x10);
        asm.u8(0).uleb(1).u8(constants::DW_LNE_end_sequence.0);
    });
    asm.finish()
}

/// An `.eh_frame` at `0x2000` with one FDE for `0x1000..0x1040`.
fn eh_frame() -> Vec<u8> {
    let mut asm = Assembler::little();
    asm.length32(|asm| {
        asm.u32(0)
            .u8(1)
            .cstr("zR")
            .uleb(1)
            .sleb(-8)
            .u8(16)
            .block(|asm| {
                asm.u8(constants::DW_EH_PE_pcrel.0 | constants::DW_EH_PE_sdata4.0);
            })
            .u8(constants::DW_CFA_def_cfa.0)
            .uleb(7)
            .uleb(8)
            .u8(constants::DW_CFA_offset.0 | 16)
            .uleb(1);
    });
    asm.length32(|asm| {
        let id = asm.position();
        asm.u32(id as u32);
        let place = 0x2000 + asm.position() as i64;
        asm.i32((0x1000 - place) as i32)
            .u32(0x40)
            .uleb(0)
            .u8(constants::DW_CFA_advance_loc.0 | 4)
            .u8(constants::DW_CFA_def_cfa_offset.0)
            .uleb(16)
            .u8(constants::DW_CFA_offset.0 | 6)
            .uleb(2);
    });
    asm.u32(0);
    asm.finish()
}

fn build_id_note() -> Vec<u8> {
    let mut asm = Assembler::little();
    asm.u32(4).u32(8).u32(3).bytes(b"GNU\0");
    asm.bytes(&[1, 2, 3, 4, 5, 6, 7, 8]);
    asm.finish()
}

fn zlib_section(data: &[u8]) -> Result<Vec<u8>, Error> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    let compressed = encoder.finish()?;

    let mut asm = Assembler::little();
    asm.u32(1).u32(0).u64(data.len() as u64).u64(1);
    asm.bytes(&compressed);
    Ok(asm.finish())
}

fn test_sections(debug_line: TestSection) -> Vec<TestSection> {
    let (symtab, strtab) = symtab();
    vec![
        TestSection::new(".text", SHT_PROGBITS, vec![0x90; 0x40])
            .flags(SHF_ALLOC | SHF_EXECINSTR)
            .address(0x1000),
        TestSection::new(".eh_frame", SHT_PROGBITS, eh_frame())
            .flags(SHF_ALLOC)
            .address(0x2000),
        debug_line,
        TestSection::new(".symtab", SHT_SYMTAB, symtab).link(5, 24),
        TestSection::new(".strtab", SHT_STRTAB, strtab),
        TestSection::new(".note.gnu.build-id", SHT_NOTE, build_id_note()).flags(SHF_ALLOC),
    ]
}

fn test_elf() -> Vec<u8> {
    let debug_line = TestSection::new(".debug_line", SHT_PROGBITS, debug_line());
    build_elf(test_sections(debug_line)).0
}

fn symbol_name(info: &DebugInfo, address: u64) -> Option<&str> {
    let symbol = info.lookup_symbol(address)?;
    Some(info.pools().strings.get(symbol.name))
}

fn line(info: &DebugInfo, address: u64) -> Option<(String, u32)> {
    let record = info.lookup_line(address)?;
    Some((info.pools().file_path(record.file), record.line))
}

fn recipe(info: &DebugInfo, address: u64) -> String {
    let recipe = info.lookup_unwind_recipe(address);
    info.display_recipe(recipe).to_string()
}

#[test]
fn test_load_elf() -> Result<(), Error> {
    let mut file = tempfile::NamedTempFile::new()?;
    file.write_all(&test_elf())?;
    file.flush()?;

    let info = DebugInfo::load(Image::open(file.path())?, &LoadOptions::default())?;
    assert!(info.diagnostics().is_empty(), "{:?}", info.diagnostics());

    assert_eq!(info.arch(), Arch::Amd64);
    assert_eq!(info.soname(), None);
    assert_eq!(info.build_id(), Some(&[1, 2, 3, 4, 5, 6, 7, 8][..]));
    insta::assert_debug_snapshot!(info.mappings(), @r###"
    [
        Mapping {
            address: 4096,
            size: 256,
            file_offset: 0,
            permissions: Permissions {
                read: true,
                write: false,
                execute: true,
            },
        },
    ]
    "###);
    assert_eq!(info.mappings()[0].permissions.to_string(), "r-x");

    let text = info
        .sections()
        .iter()
        .find(|section| section.kind == SectionKind::Text)
        .ok_or("no text section")?;
    assert_eq!(text.range(), 0x1000..0x1040);

    assert_eq!(symbol_name(&info, 0x1010), Some("main"));
    assert_eq!(symbol_name(&info, 0x1024), Some("foo"));
    assert_eq!(symbol_name(&info, 0x3003), Some("counter"));
    assert_eq!(symbol_name(&info, 0x1030), None);

    let foo = info.lookup_symbol(0x1020).ok_or("no symbol")?;
    let aliases: Vec<_> = foo
        .aliases
        .iter()
        .map(|&alias| info.pools().strings.get(alias))
        .collect();
    assert_eq!(aliases, vec!["foo@@VER_1.0"]);

    assert_eq!(line(&info, 0x1008), Some(("main.c".into(), 5)));
    assert_eq!(line(&info, 0x1018), Some(("main.c".into(), 7)));
    assert_eq!(line(&info, 0x1020), None);

    assert_eq!(recipe(&info, 0x1002), "cfa=sp+8 ra=*(cfa-8)");
    assert_eq!(recipe(&info, 0x1010), "cfa=sp+16 ra=*(cfa-8) fp=*(cfa-16)");
    assert!(info.lookup_unwind_recipe(0x1080).is_unknown());

    Ok(())
}

#[test]
fn test_load_with_bias() -> Result<(), Error> {
    const BIAS: u64 = 0x5555_0000_0000;

    let options = LoadOptions {
        load_address: Some(BIAS + 0x1000),
        ..LoadOptions::default()
    };
    let info = DebugInfo::load(Image::from_vec(test_elf()), &options)?;

    assert_eq!(info.bias(), BIAS);
    assert_eq!(info.mappings()[0].address, BIAS + 0x1000);
    assert_eq!(symbol_name(&info, BIAS + 0x1010), Some("main"));
    assert_eq!(symbol_name(&info, 0x1010), None);
    assert_eq!(line(&info, BIAS + 0x1018), Some(("main.c".into(), 7)));
    assert_eq!(recipe(&info, BIAS + 0x1010), "cfa=sp+16 ra=*(cfa-8) fp=*(cfa-16)");
    assert!(info.lookup_unwind_recipe(0x1010).is_unknown());

    Ok(())
}

#[test]
fn test_compressed_debug_line() -> Result<(), Error> {
    let debug_line = TestSection::new(".debug_line", SHT_PROGBITS, zlib_section(&debug_line())?)
        .flags(SHF_COMPRESSED);
    let (data, _) = build_elf(test_sections(debug_line));

    let info = DebugInfo::load(Image::from_vec(data), &LoadOptions::default())?;
    assert!(info.diagnostics().is_empty(), "{:?}", info.diagnostics());
    assert_eq!(line(&info, 0x1008), Some(("main.c".into(), 5)));

    Ok(())
}

#[test]
fn test_corrupt_compressed_section() -> Result<(), Error> {
    let mut asm = Assembler::little();
    asm.u32(1).u32(0).u64(0x100).u64(1).bytes(b"not zlib data");
    let debug_line =
        TestSection::new(".debug_line", SHT_PROGBITS, asm.finish()).flags(SHF_COMPRESSED);
    let (data, _) = build_elf(test_sections(debug_line));

    let info = DebugInfo::load(Image::from_vec(data), &LoadOptions::default())?;
    assert!(info.diagnostics().has_errors());
    assert!(info.lines().is_empty());
    assert_eq!(symbol_name(&info, 0x1010), Some("main"));

    Ok(())
}

#[test]
fn test_not_elf() {
    let result = DebugInfo::load(Image::from_slice(b"\0asm\x01\0\0\0"), &LoadOptions::default());
    assert!(matches!(result, Err(StoreError::NotElf)));
}

#[test]
fn test_truncated_section_headers() {
    let (mut data, shoff) = build_elf(test_sections(TestSection::new(
        ".debug_line",
        SHT_PROGBITS,
        debug_line(),
    )));
    data.truncate(shoff + 10);

    let result = DebugInfo::load(Image::from_vec(data), &LoadOptions::default());
    assert!(matches!(
        result,
        Err(StoreError::Image(ObjectPart::SectionHeaders, _))
    ));
}

#[test]
fn test_versioned_symbol_alias() {
    let mut info = DebugInfo::new(Arch::Amd64);
    let versioned = info.pools_mut().strings.intern("foo@@VER_1.0");
    let plain = info.pools_mut().strings.intern("foo");
    info.add_symbol(Symbol::new(versioned, 0x2000, 16, true));
    info.add_symbol(Symbol::new(plain, 0x2000, 16, true));
    info.freeze();

    assert_eq!(info.symbols().len(), 1);
    let symbol = info.lookup_symbol(0x200f).unwrap();
    assert_eq!(symbol.name, plain);
    assert_eq!(symbol.aliases.to_vec(), vec![versioned]);
}

#[test]
fn test_broken_unit_leaves_usable_container() {
    let mut asm = Assembler::little();
    // A unit claiming more bytes than the section holds.
    asm.u32(0x1000).u16(4).u32(0).u8(8);
    let debug_info = asm.finish();

    let mut info = DebugInfo::new(Arch::Amd64);
    let name = info.pools_mut().strings.intern("main");
    info.add_symbol(Symbol::new(name, 0x1000, 0x20, true));

    let sections = DwarfSections {
        debug_info: Section::new(".debug_info", &debug_info, Endian::Little),
        ..DwarfSections::empty(Endian::Little)
    };
    info.add_dwarf(sections, &DwarfOptions::default());
    info.freeze();

    assert!(info.diagnostics().has_errors());
    let diagnostic = info.diagnostics().iter().next().unwrap();
    assert_eq!(diagnostic.section, ".debug_info");

    assert_eq!(symbol_name(&info, 0x1004), Some("main"));
    assert!(info.lookup_line(0x1004).is_none());
    assert!(info.lookup_unwind_recipe(0x1004).is_unknown());
}

#[test]
fn test_cfi_total_over_executable_mapping() -> Result<(), Error> {
    let info = DebugInfo::load(Image::from_vec(test_elf()), &LoadOptions::default())?;

    let mapping = info.mappings()[0].range();
    for address in mapping {
        let recipe = info.lookup_unwind_recipe(address);
        assert_eq!(recipe.is_unknown(), address >= 0x1040, "{address:#x}");
    }

    let entries: Vec<_> = info.cfi().iter().map(|(range, _)| range).collect();
    for pair in entries.windows(2) {
        assert_eq!(pair[0].end, pair[1].start);
    }

    Ok(())
}

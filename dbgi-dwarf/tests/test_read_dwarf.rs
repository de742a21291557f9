use dbgi_common::{Diagnostics, Endian, FileId, Pools, Section};
use dbgi_dwarf::{
    read_dwarf, unit_summaries, DwarfOptions, DwarfSections, Location, TypeKey, UNRESOLVED_INLINE,
};
use dbgi_testutils::Assembler;
use gimli::constants::{self, DwAt, DwForm, DwTag};
use similar_asserts::assert_eq;

type Error = Box<dyn std::error::Error>;

const CU: u64 = 1;
const BASE: u64 = 2;
const STRUCT: u64 = 3;
const MEMBER: u64 = 4;
const POINTER: u64 = 5;
const FUNCTION: u64 = 6;
const LOCAL: u64 = 7;
const ABSTRACT: u64 = 8;
const INLINED: u64 = 9;
const GLOBAL: u64 = 10;
const TYPE_UNIT: u64 = 11;
const BLOB: u64 = 12;
const SIG_GLOBAL: u64 = 13;
const ARRAY: u64 = 14;
const SUBRANGE: u64 = 15;
const RANGES_CU: u64 = 16;
const BLOCK: u64 = 17;
const BASED_BLOCK: u64 = 18;

fn abbrev(asm: &mut Assembler, code: u64, tag: DwTag, children: bool, attrs: &[(DwAt, DwForm)]) {
    asm.uleb(code).uleb(tag.0.into()).u8(children.into());
    for (name, form) in attrs {
        asm.uleb(name.0.into()).uleb(form.0.into());
    }
    asm.u8(0).u8(0);
}

fn debug_abbrev() -> Vec<u8> {
    use constants::*;

    let mut asm = Assembler::little();
    abbrev(
        &mut asm,
        CU,
        DW_TAG_compile_unit,
        true,
        &[
            (DW_AT_name, DW_FORM_string),
            (DW_AT_comp_dir, DW_FORM_string),
            (DW_AT_stmt_list, DW_FORM_sec_offset),
            (DW_AT_low_pc, DW_FORM_addr),
            (DW_AT_high_pc, DW_FORM_data4),
        ],
    );
    abbrev(
        &mut asm,
        BASE,
        DW_TAG_base_type,
        false,
        &[
            (DW_AT_name, DW_FORM_string),
            (DW_AT_byte_size, DW_FORM_data1),
            (DW_AT_encoding, DW_FORM_data1),
        ],
    );
    abbrev(
        &mut asm,
        STRUCT,
        DW_TAG_structure_type,
        true,
        &[(DW_AT_name, DW_FORM_string), (DW_AT_byte_size, DW_FORM_data1)],
    );
    abbrev(
        &mut asm,
        MEMBER,
        DW_TAG_member,
        false,
        &[
            (DW_AT_name, DW_FORM_string),
            (DW_AT_type, DW_FORM_ref4),
            (DW_AT_data_member_location, DW_FORM_data1),
        ],
    );
    abbrev(
        &mut asm,
        POINTER,
        DW_TAG_pointer_type,
        false,
        &[(DW_AT_byte_size, DW_FORM_data1), (DW_AT_type, DW_FORM_ref4)],
    );
    abbrev(
        &mut asm,
        FUNCTION,
        DW_TAG_subprogram,
        true,
        &[
            (DW_AT_name, DW_FORM_string),
            (DW_AT_low_pc, DW_FORM_addr),
            (DW_AT_high_pc, DW_FORM_data4),
            (DW_AT_frame_base, DW_FORM_exprloc),
        ],
    );
    abbrev(
        &mut asm,
        LOCAL,
        DW_TAG_variable,
        false,
        &[
            (DW_AT_name, DW_FORM_string),
            (DW_AT_type, DW_FORM_ref4),
            (DW_AT_location, DW_FORM_exprloc),
            (DW_AT_decl_file, DW_FORM_data1),
            (DW_AT_decl_line, DW_FORM_data1),
        ],
    );
    abbrev(
        &mut asm,
        ABSTRACT,
        DW_TAG_subprogram,
        false,
        &[(DW_AT_name, DW_FORM_string), (DW_AT_inline, DW_FORM_data1)],
    );
    abbrev(
        &mut asm,
        INLINED,
        DW_TAG_inlined_subroutine,
        false,
        &[
            (DW_AT_abstract_origin, DW_FORM_ref4),
            (DW_AT_low_pc, DW_FORM_addr),
            (DW_AT_high_pc, DW_FORM_data4),
            (DW_AT_call_file, DW_FORM_data1),
            (DW_AT_call_line, DW_FORM_data1),
        ],
    );
    abbrev(
        &mut asm,
        GLOBAL,
        DW_TAG_variable,
        false,
        &[
            (DW_AT_name, DW_FORM_string),
            (DW_AT_type, DW_FORM_ref4),
            (DW_AT_location, DW_FORM_exprloc),
        ],
    );
    abbrev(&mut asm, TYPE_UNIT, DW_TAG_type_unit, true, &[]);
    abbrev(
        &mut asm,
        BLOB,
        DW_TAG_structure_type,
        false,
        &[(DW_AT_name, DW_FORM_string), (DW_AT_byte_size, DW_FORM_data1)],
    );
    abbrev(
        &mut asm,
        SIG_GLOBAL,
        DW_TAG_variable,
        false,
        &[
            (DW_AT_name, DW_FORM_string),
            (DW_AT_type, DW_FORM_ref_sig8),
            (DW_AT_location, DW_FORM_exprloc),
        ],
    );
    abbrev(&mut asm, ARRAY, DW_TAG_array_type, true, &[(DW_AT_type, DW_FORM_ref4)]);
    abbrev(
        &mut asm,
        SUBRANGE,
        DW_TAG_subrange_type,
        false,
        &[(DW_AT_lower_bound, DW_FORM_sdata), (DW_AT_count, DW_FORM_sdata)],
    );
    abbrev(
        &mut asm,
        RANGES_CU,
        DW_TAG_compile_unit,
        true,
        &[
            (DW_AT_name, DW_FORM_string),
            (DW_AT_comp_dir, DW_FORM_string),
            (DW_AT_stmt_list, DW_FORM_sec_offset),
            (DW_AT_low_pc, DW_FORM_addr),
            (DW_AT_ranges, DW_FORM_sec_offset),
        ],
    );
    abbrev(
        &mut asm,
        BLOCK,
        DW_TAG_lexical_block,
        true,
        &[(DW_AT_ranges, DW_FORM_sec_offset)],
    );
    abbrev(
        &mut asm,
        BASED_BLOCK,
        DW_TAG_lexical_block,
        true,
        &[(DW_AT_low_pc, DW_FORM_addr), (DW_AT_ranges, DW_FORM_sec_offset)],
    );
    asm.u8(0);
    asm.finish()
}

/// A line program with file `a.c` covering `0x1000..0x1100` with line 1.
fn debug_line() -> Vec<u8> {
    let mut asm = Assembler::little();
    asm.length32(|asm| {
        asm.u16(4);
        let at = asm.position();
        asm.u32(0);
        let start = asm.position();
        asm.u8(1)
            .u8(1)
            .u8(1)
            .u8((-5i8) as u8)
            .u8(14)
            .u8(13)
            .bytes(&[0, 1, 1, 1, 1, 0, 0, 0, 1, 0, 0, 1])
            .u8(0)
            .cstr("a.c")
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
        asm.u8(constants::DW_LNS_copy.0);
        asm.u8(constants::DW_LNS_advance_pc.0).uleb(0x100);
        asm.u8(0).uleb(1).u8(constants::DW_LNE_end_sequence.0);
    });
    asm.finish()
}

const INT: [&str; 2] = ["int0", "int1"];
const POINT: [&str; 2] = ["point0", "point1"];
const POINTER_TO_POINT: [&str; 2] = ["ptr0", "ptr1"];
const HELPER: [&str; 2] = ["helper0", "helper1"];

/// Returns the offset of a label relative to the unit header at `unit`.
fn unit_ref(asm: &Assembler, unit: usize, label: &str) -> u32 {
    (asm.offset_of(label) - unit) as u32
}

/// Writes a compilation unit with `struct point`, a global, and a function `main` that has a local
/// and calls an inlined `helper`.
fn compile_unit(asm: &mut Assembler, index: usize, low_pc: u64) {
    let unit = asm.position();

    asm.length32(|asm| {
        asm.u16(4).u32(0).u8(8);
        asm.uleb(CU)
            .cstr(["first.c", "second.c"][index])
            .cstr("/work")
            .u32(0)
            .u64(low_pc)
            .u32(0x100);

        asm.label(INT[index]);
        asm.uleb(BASE)
            .cstr("int")
            .u8(4)
            .u8(constants::DW_ATE_signed.0);

        asm.label(POINT[index]);
        asm.uleb(STRUCT).cstr("point").u8(8);
        let int = unit_ref(asm, unit, INT[index]);
        asm.uleb(MEMBER).cstr("x").u32(int).u8(0);
        asm.uleb(MEMBER).cstr("y").u32(int).u8(4);
        asm.u8(0);

        asm.label(POINTER_TO_POINT[index]);
        let point = unit_ref(asm, unit, POINT[index]);
        asm.uleb(POINTER).u8(8).u32(point);

        let pointer = unit_ref(asm, unit, POINTER_TO_POINT[index]);
        asm.uleb(GLOBAL)
            .cstr(["g_first", "g_second"][index])
            .u32(pointer)
            .block(|asm| {
                asm.u8(constants::DW_OP_addr.0).u64(0x4000 + 8 * index as u64);
            });

        asm.label(HELPER[index]);
        asm.uleb(ABSTRACT)
            .cstr("helper")
            .u8(constants::DW_INL_inlined.0);

        asm.uleb(FUNCTION)
            .cstr("main")
            .u64(low_pc)
            .u32(0x100)
            .block(|asm| {
                asm.u8(constants::DW_OP_call_frame_cfa.0);
            });
        asm.uleb(LOCAL)
            .cstr("p")
            .u32(pointer)
            .block(|asm| {
                asm.u8(constants::DW_OP_fbreg.0).sleb(-16);
            })
            .u8(1)
            .u8(3);
        let helper = unit_ref(asm, unit, HELPER[index]);
        asm.uleb(INLINED)
            .u32(helper)
            .u64(low_pc + 0x10)
            .u32(0x20)
            .u8(1)
            .u8(7);
        asm.u8(0);

        asm.u8(0);
    });
}

struct Fixture {
    abbrev: Vec<u8>,
    info: Vec<u8>,
    types: Vec<u8>,
    line: Vec<u8>,
    ranges: Vec<u8>,
}

impl Fixture {
    fn new(info: Vec<u8>) -> Self {
        Fixture {
            abbrev: debug_abbrev(),
            info,
            types: Vec::new(),
            line: debug_line(),
            ranges: Vec::new(),
        }
    }

    fn sections(&self) -> DwarfSections<'_> {
        let mut sections = DwarfSections::empty(Endian::Little);
        sections.debug_abbrev = Section::new(".debug_abbrev", &self.abbrev, Endian::Little);
        sections.debug_info = Section::new(".debug_info", &self.info, Endian::Little);
        sections.debug_types = Section::new(".debug_types", &self.types, Endian::Little);
        sections.debug_line = Section::new(".debug_line", &self.line, Endian::Little);
        sections.debug_ranges = Section::new(".debug_ranges", &self.ranges, Endian::Little);
        sections
    }
}

fn two_units() -> Vec<u8> {
    let mut asm = Assembler::little();
    compile_unit(&mut asm, 0, 0x1000);
    compile_unit(&mut asm, 1, 0x2000);
    asm.finish()
}

fn everything() -> DwarfOptions {
    DwarfOptions {
        read_types_and_variables: true,
        ..DwarfOptions::default()
    }
}

#[test]
fn test_lines_and_inlines() -> Result<(), Error> {
    let fixture = Fixture::new(two_units());
    let mut pools = Pools::new();
    let mut diagnostics = Diagnostics::new();

    let output = read_dwarf(
        fixture.sections(),
        &DwarfOptions::default(),
        &mut pools,
        &mut diagnostics,
    );
    assert!(diagnostics.is_empty(), "{:?}", diagnostics);

    // Both units share one line program, which runs once.
    assert_eq!(output.lines.len(), 1);
    let row = output.lines[0];
    assert_eq!((row.address, row.size, row.line), (0x1000, 0x100, 1));
    assert_eq!(pools.file_path(row.file), "/work/a.c");

    let inlines: Vec<_> = output
        .inlines
        .iter()
        .map(|record| {
            (
                record.range.clone(),
                pools.strings.get(record.name),
                pools.file_path(record.call_file),
                record.call_line,
                record.level,
            )
        })
        .collect();
    insta::assert_debug_snapshot!(inlines, @r###"
    [
        (
            4112..4144,
            "helper",
            "/work/a.c",
            7,
            0,
        ),
        (
            8208..8240,
            "helper",
            "/work/a.c",
            7,
            0,
        ),
    ]
    "###);

    // Types and variables are not extracted by default.
    assert!(output.types.is_empty());
    assert!(output.variables.is_empty());

    Ok(())
}

#[test]
fn test_bias_applies_everywhere() -> Result<(), Error> {
    let fixture = Fixture::new(two_units());
    let mut pools = Pools::new();
    let mut diagnostics = Diagnostics::new();

    let options = DwarfOptions {
        bias: 0x10_0000,
        ..everything()
    };
    let output = read_dwarf(fixture.sections(), &options, &mut pools, &mut diagnostics);

    assert_eq!(output.lines[0].address, 0x10_1000);
    assert_eq!(output.inlines[0].range, 0x10_1010..0x10_1030);

    let local = output
        .variables
        .iter()
        .find(|variable| variable.level == 1)
        .ok_or("no local variable")?;
    assert_eq!(local.ranges.as_slice(), [0x10_1000..0x10_1100]);

    Ok(())
}

#[test]
fn test_types_deduplicated_across_units() -> Result<(), Error> {
    let fixture = Fixture::new(two_units());
    let mut pools = Pools::new();
    let mut diagnostics = Diagnostics::new();

    let output = read_dwarf(fixture.sections(), &everything(), &mut pools, &mut diagnostics);
    assert!(diagnostics.is_empty(), "{:?}", diagnostics);

    // void, int, struct point, its two fields and the pointer survive.
    assert_eq!(output.types.len(), 6);
    assert!(output.dedup.collapses >= 5);

    let globals: Vec<_> = output
        .variables
        .iter()
        .filter(|variable| variable.level == 0)
        .collect();
    assert_eq!(globals.len(), 2);
    assert_eq!(globals[0].ty, globals[1].ty);
    assert_eq!(
        output.types.describe(globals[1].ty, &pools.strings),
        "struct point*"
    );
    assert_eq!(pools.strings.get(globals[1].name), "g_second");
    assert_eq!(
        globals[1].location,
        Location::Expr(vec![constants::DW_OP_addr.0, 8, 0x40, 0, 0, 0, 0, 0, 0])
    );
    assert_eq!(globals[1].ranges.as_slice(), [0..u64::MAX]);

    Ok(())
}

#[test]
fn test_local_variables() -> Result<(), Error> {
    let fixture = Fixture::new(two_units());
    let mut pools = Pools::new();
    let mut diagnostics = Diagnostics::new();

    let output = read_dwarf(fixture.sections(), &everything(), &mut pools, &mut diagnostics);

    let locals: Vec<_> = output
        .variables
        .iter()
        .filter(|variable| variable.level == 1)
        .collect();
    assert_eq!(locals.len(), 2);

    let local = locals[0];
    assert_eq!(pools.strings.get(local.name), "p");
    assert_eq!(local.ranges.as_slice(), [0x1000..0x1100]);
    assert_eq!(
        local.frame_base,
        Some(Location::Expr(vec![constants::DW_OP_call_frame_cfa.0]))
    );
    assert_eq!(local.location, Location::Expr(vec![constants::DW_OP_fbreg.0, 0x70]));
    assert_eq!(pools.file_path(local.file), "/work/a.c");
    assert_eq!(local.line, 3);

    Ok(())
}

#[test]
fn test_broken_unit_is_skipped() -> Result<(), Error> {
    let mut asm = Assembler::little();
    compile_unit(&mut asm, 0, 0x1000);
    let broken = asm.position() as u64;
    asm.length32(|asm| {
        asm.u16(4).u32(0).u8(8);
        asm.uleb(99);
    });
    compile_unit(&mut asm, 1, 0x2000);

    let fixture = Fixture::new(asm.finish());
    let mut pools = Pools::new();
    let mut diagnostics = Diagnostics::new();

    let output = read_dwarf(fixture.sections(), &everything(), &mut pools, &mut diagnostics);

    assert!(diagnostics.has_errors());
    let diagnostic = diagnostics.iter().next().ok_or("no diagnostic")?;
    assert_eq!(diagnostic.section, ".debug_info");
    assert_eq!(diagnostic.offset, Some(broken));

    // The units around the broken one are fully extracted.
    assert_eq!(output.inlines.len(), 2);
    assert_eq!(output.variables.len(), 4);

    Ok(())
}

#[test]
fn test_truncated_unit_keeps_earlier_units() -> Result<(), Error> {
    let mut asm = Assembler::little();
    compile_unit(&mut asm, 0, 0x1000);
    // A unit claiming more bytes than the section holds.
    asm.u32(0x1000).u16(4).u32(0).u8(8);

    let fixture = Fixture::new(asm.finish());
    let mut pools = Pools::new();
    let mut diagnostics = Diagnostics::new();

    let output = read_dwarf(fixture.sections(), &everything(), &mut pools, &mut diagnostics);

    assert!(diagnostics.has_errors());
    assert_eq!(output.inlines.len(), 1);
    assert_eq!(output.lines.len(), 1);

    Ok(())
}

#[test]
fn test_unresolved_inline_name() -> Result<(), Error> {
    let mut asm = Assembler::little();
    asm.length32(|asm| {
        asm.u16(4).u32(0).u8(8);
        asm.uleb(CU)
            .cstr("c.c")
            .cstr("/work")
            .u32(0)
            .u64(0x1000)
            .u32(0x100);
        asm.uleb(FUNCTION)
            .cstr("main")
            .u64(0x1000)
            .u32(0x100)
            .block(|asm| {
                asm.u8(constants::DW_OP_call_frame_cfa.0);
            });
        // The origin points back at the inlined entry itself.
        let at = asm.position() as u32;
        asm.uleb(INLINED)
            .u32(at)
            .u64(0x1010)
            .u32(0x10)
            .u8(1)
            .u8(2);
        asm.u8(0);
        asm.u8(0);
    });

    let fixture = Fixture::new(asm.finish());
    let mut pools = Pools::new();
    let mut diagnostics = Diagnostics::new();

    let output = read_dwarf(
        fixture.sections(),
        &DwarfOptions::default(),
        &mut pools,
        &mut diagnostics,
    );

    assert_eq!(output.inlines.len(), 1);
    assert_eq!(pools.strings.get(output.inlines[0].name), UNRESOLVED_INLINE);

    Ok(())
}

#[test]
fn test_array_bounds_overflow() -> Result<(), Error> {
    let mut asm = Assembler::little();
    asm.length32(|asm| {
        asm.u16(4).u32(0).u8(8);
        asm.uleb(CU)
            .cstr("e.c")
            .cstr("/work")
            .u32(0)
            .u64(0x1000)
            .u32(0x100);
        asm.label("int");
        asm.uleb(BASE)
            .cstr("int")
            .u8(4)
            .u8(constants::DW_ATE_signed.0);
        asm.label("array");
        let int = unit_ref(asm, 0, "int");
        asm.uleb(ARRAY).u32(int);
        asm.uleb(SUBRANGE).sleb(i64::MAX).sleb(2);
        asm.uleb(SUBRANGE).sleb(-1).sleb(4);
        asm.uleb(SUBRANGE).sleb(i64::MIN).sleb(-1);
        asm.u8(0);
        let array = unit_ref(asm, 0, "array");
        asm.uleb(GLOBAL)
            .cstr("table")
            .u32(array)
            .block(|asm| {
                asm.u8(constants::DW_OP_addr.0).u64(0x4000);
            });
        asm.u8(0);
    });

    let fixture = Fixture::new(asm.finish());
    let mut pools = Pools::new();
    let mut diagnostics = Diagnostics::new();

    let output = read_dwarf(fixture.sections(), &everything(), &mut pools, &mut diagnostics);
    assert!(diagnostics.is_empty(), "{:?}", diagnostics);

    assert_eq!(output.variables.len(), 1);
    assert_eq!(
        output.types.describe(output.variables[0].ty, &pools.strings),
        "int[][4][]"
    );

    Ok(())
}

/// A unit covering `0x1000..0x1100` and `0x1200..0x1240` through a range list, with a function
/// that holds one block with a broken range list and one with a valid one.
fn unit_with_range_lists() -> (Vec<u8>, Vec<u8>, u64) {
    let mut ranges = Assembler::little();
    ranges.u64(0).u64(0x100).u64(0x200).u64(0x240).u64(0).u64(0);

    let mut bad_block = 0;
    let mut info = Assembler::little();
    info.length32(|asm| {
        asm.u16(4).u32(0).u8(8);
        asm.uleb(RANGES_CU)
            .cstr("r.c")
            .cstr("/work")
            .u32(0)
            .u64(0x1000)
            .u32(0);
        asm.label("int");
        asm.uleb(BASE)
            .cstr("int")
            .u8(4)
            .u8(constants::DW_ATE_signed.0);
        let int = unit_ref(asm, 0, "int");

        asm.uleb(FUNCTION)
            .cstr("main")
            .u64(0x1000)
            .u32(0x240)
            .block(|asm| {
                asm.u8(constants::DW_OP_call_frame_cfa.0);
            });

        bad_block = asm.position() as u64;
        asm.uleb(BLOCK).u32(0x1000);
        asm.uleb(LOCAL)
            .cstr("lost")
            .u32(int)
            .block(|asm| {
                asm.u8(constants::DW_OP_fbreg.0).sleb(-8);
            })
            .u8(1)
            .u8(4);
        asm.u8(0);

        asm.uleb(BASED_BLOCK).u64(0x1000).u32(0);
        asm.uleb(LOCAL)
            .cstr("kept")
            .u32(int)
            .block(|asm| {
                asm.u8(constants::DW_OP_fbreg.0).sleb(-12);
            })
            .u8(1)
            .u8(5);
        asm.u8(0);

        asm.uleb(LOCAL)
            .cstr("p")
            .u32(int)
            .block(|asm| {
                asm.u8(constants::DW_OP_fbreg.0).sleb(-16);
            })
            .u8(1)
            .u8(3);
        asm.u8(0);

        asm.uleb(GLOBAL)
            .cstr("g")
            .u32(int)
            .block(|asm| {
                asm.u8(constants::DW_OP_addr.0).u64(0x4000);
            });
        asm.u8(0);
    });

    (info.finish(), ranges.finish(), bad_block)
}

#[test]
fn test_bad_range_list_skips_only_its_scope() -> Result<(), Error> {
    let (info, ranges, bad_block) = unit_with_range_lists();
    let mut fixture = Fixture::new(info);
    fixture.ranges = ranges;
    let mut pools = Pools::new();
    let mut diagnostics = Diagnostics::new();

    let output = read_dwarf(fixture.sections(), &everything(), &mut pools, &mut diagnostics);

    assert!(!diagnostics.has_errors());
    let diagnostic = diagnostics.iter().next().ok_or("no diagnostic")?;
    assert_eq!(diagnostic.section, ".debug_info");
    assert_eq!(diagnostic.offset, Some(bad_block));

    let variables: Vec<_> = output
        .variables
        .iter()
        .map(|variable| {
            (
                pools.strings.get(variable.name),
                variable.level,
                variable.ranges.to_vec(),
            )
        })
        .collect();
    assert_eq!(
        variables,
        [
            ("kept", 2, vec![0x1000..0x1100, 0x1200..0x1240]),
            ("p", 1, vec![0x1000..0x1240]),
            ("g", 0, vec![0..u64::MAX]),
        ]
    );

    Ok(())
}

#[test]
fn test_low_pc_is_range_list_base() -> Result<(), Error> {
    let (info, ranges, _) = unit_with_range_lists();
    let mut fixture = Fixture::new(info);
    fixture.ranges = ranges;
    let mut pools = Pools::new();
    let mut diagnostics = Diagnostics::new();

    let options = DwarfOptions {
        bias: 0x10_0000,
        ..everything()
    };
    let output = read_dwarf(fixture.sections(), &options, &mut pools, &mut diagnostics);

    let kept = output
        .variables
        .iter()
        .find(|variable| pools.strings.get(variable.name) == "kept")
        .ok_or("block with low_pc and ranges lost its variable")?;
    assert_eq!(
        kept.ranges.as_slice(),
        [0x10_1000..0x10_1100, 0x10_1200..0x10_1240]
    );

    Ok(())
}

#[test]
fn test_type_unit_signature() -> Result<(), Error> {
    const SIGNATURE: u64 = 0xfeed_f00d_dead_beef;

    let mut types = Assembler::little();
    types.length32(|asm| {
        asm.u16(4).u32(0).u8(8).u64(SIGNATURE).u32(24);
        asm.uleb(TYPE_UNIT);
        asm.uleb(BLOB).cstr("blob").u8(4);
        asm.u8(0);
    });

    let mut info = Assembler::little();
    info.length32(|asm| {
        asm.u16(4).u32(0).u8(8);
        asm.uleb(CU)
            .cstr("d.c")
            .cstr("/work")
            .u32(0)
            .u64(0x1000)
            .u32(0x100);
        asm.uleb(SIG_GLOBAL)
            .cstr("g_blob")
            .u64(SIGNATURE)
            .block(|asm| {
                asm.u8(constants::DW_OP_addr.0).u64(0x4000);
            });
        asm.uleb(SIG_GLOBAL)
            .cstr("g_missing")
            .u64(!SIGNATURE)
            .block(|asm| {
                asm.u8(constants::DW_OP_addr.0).u64(0x4008);
            });
        asm.u8(0);
    });

    let mut fixture = Fixture::new(info.finish());
    fixture.types = types.finish();
    let mut pools = Pools::new();
    let mut diagnostics = Diagnostics::new();

    let output = read_dwarf(fixture.sections(), &everything(), &mut pools, &mut diagnostics);
    assert!(diagnostics.is_empty(), "{:?}", diagnostics);

    let described: Vec<_> = output
        .variables
        .iter()
        .map(|variable| {
            (
                pools.strings.get(variable.name),
                output.types.describe(variable.ty, &pools.strings),
            )
        })
        .collect();
    assert_eq!(
        described,
        [
            ("g_blob", "struct blob".to_owned()),
            ("g_missing", "<unknown>".to_owned()),
        ]
    );
    assert_eq!(output.variables[0].ty, TypeKey::types(24));

    Ok(())
}

#[test]
fn test_sequential_line_fallback() -> Result<(), Error> {
    let fixture = Fixture::new(Vec::new());
    let mut pools = Pools::new();
    let mut diagnostics = Diagnostics::new();

    assert!(unit_summaries(fixture.sections(), &mut diagnostics).is_empty());

    let output = read_dwarf(
        fixture.sections(),
        &DwarfOptions::default(),
        &mut pools,
        &mut diagnostics,
    );
    assert!(diagnostics.is_empty());
    assert_eq!(output.lines.len(), 1);
    // Without a unit there is no compilation directory.
    assert_eq!(pools.file_path(output.lines[0].file), "a.c");
    assert_ne!(output.lines[0].file, FileId::UNKNOWN);

    Ok(())
}

#[test]
fn test_unit_summaries() -> Result<(), Error> {
    let fixture = Fixture::new(two_units());
    let mut diagnostics = Diagnostics::new();

    let summaries = unit_summaries(fixture.sections(), &mut diagnostics);
    let names: Vec<_> = summaries
        .iter()
        .map(|summary| (summary.name, summary.comp_dir, summary.stmt_list))
        .collect();
    assert_eq!(
        names,
        [
            (&b"first.c"[..], &b"/work"[..], Some(0)),
            (&b"second.c"[..], &b"/work"[..], Some(0)),
        ]
    );

    Ok(())
}

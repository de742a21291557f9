use std::borrow::Cow;

use dbgi_common::{Cursor, Diagnostics, FileId, Format, Pools, Section};
use gimli::constants;

use crate::DwarfError;

/// The largest line number that is recorded. Rows with larger lines are dropped.
pub const MAX_LINE_NUMBER: u64 = (1 << 20) - 1;

/// The largest address range a single line record may cover. Larger records are dropped.
pub const MAX_LINE_SIZE: u64 = 0xffff;

/// An entry of the file name table in a line program header.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FileEntry<'a> {
    /// The file name, possibly with leading path components.
    pub name: &'a [u8],
    /// Index into the include directories, where 0 is the compilation directory.
    pub dir_index: u64,
    /// Modification time, 0 if unknown.
    pub mtime: u64,
    /// File size in bytes, 0 if unknown.
    pub length: u64,
}

/// The header of a line-number program.
#[derive(Clone, Debug)]
pub struct LineProgramHeader<'a> {
    /// The offset of the program in `.debug_line`.
    pub offset: u64,
    /// The section offset one past the last byte of the program.
    pub end: u64,
    /// 32-bit or 64-bit DWARF.
    pub format: Format,
    /// The DWARF version of the line program.
    pub version: u16,
    /// The size of the smallest target instruction.
    pub minimum_instruction_length: u8,
    /// The initial value of the `is_stmt` register.
    pub default_is_stmt: bool,
    /// The smallest line advance of special opcodes.
    pub line_base: i8,
    /// The number of distinct line advances of special opcodes.
    pub line_range: u8,
    /// The number of the first special opcode.
    pub opcode_base: u8,
    /// The number of ULEB128 operands of each standard opcode.
    pub standard_opcode_lengths: &'a [u8],
    /// The include directories, not including the compilation directory.
    pub include_directories: Vec<&'a [u8]>,
    /// The file name table, indexed from 1.
    pub files: Vec<FileEntry<'a>>,
}

impl<'a> LineProgramHeader<'a> {
    /// Parses the header at `offset` and returns it with a cursor over the opcodes.
    pub fn parse(debug_line: Section<'a>, offset: u64) -> Result<(Self, Cursor<'a>), DwarfError> {
        let mut cursor = debug_line.cursor_at(offset)?;
        let (length, format) = cursor.read_initial_length()?;
        if !cursor.valid(length) {
            return Err(DwarfError::LengthExceedsSection {
                length,
                available: cursor.remaining() as u64,
            });
        }
        let mut unit = cursor.split(length)?;
        let end = unit.end();

        let version = unit.read_u16()?;
        if !(2..=4).contains(&version) {
            return Err(DwarfError::UnsupportedVersion(version));
        }

        let header_length = unit.read_offset(format)?;
        let mut program = unit;
        program.skip(header_length)?;
        let mut header = unit.truncated(program.position())?;

        let minimum_instruction_length = header.read_u8()?;
        if version >= 4 && header.read_u8()? != 1 {
            return Err(DwarfError::InvalidHeader(
                "maximum operations per instruction must be 1",
            ));
        }
        let default_is_stmt = header.read_u8()? != 0;
        let line_base = header.read_i8()?;
        let line_range = header.read_u8()?;
        if line_range == 0 {
            return Err(DwarfError::InvalidHeader("line range is zero"));
        }
        let opcode_base = header.read_u8()?;
        if opcode_base == 0 {
            return Err(DwarfError::InvalidHeader("opcode base is zero"));
        }
        let standard_opcode_lengths = header.read_bytes(u64::from(opcode_base) - 1)?;

        let mut include_directories = Vec::new();
        loop {
            let dir = header.read_cstr()?;
            if dir.is_empty() {
                break;
            }
            include_directories.push(dir);
        }

        let mut files = Vec::new();
        loop {
            let name = header.read_cstr()?;
            if name.is_empty() {
                break;
            }
            files.push(FileEntry {
                name,
                dir_index: header.read_uleb128()?,
                mtime: header.read_uleb128()?,
                length: header.read_uleb128()?,
            });
        }

        let header = LineProgramHeader {
            offset,
            end,
            format,
            version,
            minimum_instruction_length,
            default_is_stmt,
            line_base,
            line_range,
            opcode_base,
            standard_opcode_lengths,
            include_directories,
            files,
        };

        Ok((header, program))
    }

    /// Returns the directory of a file entry, joined onto the compilation directory.
    fn directory(&self, dir_index: u64, comp_dir: &'a [u8]) -> Cow<'a, [u8]> {
        if dir_index == 0 {
            return Cow::Borrowed(comp_dir);
        }

        let dir = usize::try_from(dir_index - 1)
            .ok()
            .and_then(|index| self.include_directories.get(index))
            .copied()
            .unwrap_or_default();
        join_path(comp_dir, dir)
    }

    /// Interns all file entries and returns their ids, indexed like the file register.
    ///
    /// Index 0 maps to [`FileId::UNKNOWN`].
    pub fn file_ids(&self, comp_dir: &'a [u8], pools: &mut Pools) -> Vec<FileId> {
        let mut ids = Vec::with_capacity(self.files.len() + 1);
        ids.push(FileId::UNKNOWN);
        for file in &self.files {
            ids.push(self.intern_file(file, comp_dir, pools));
        }
        ids
    }

    fn intern_file(&self, file: &FileEntry<'a>, comp_dir: &'a [u8], pools: &mut Pools) -> FileId {
        let dir = self.directory(file.dir_index, comp_dir);
        pools.intern_file(file.name, &dir)
    }
}

fn join_path<'a>(base: &'a [u8], path: &'a [u8]) -> Cow<'a, [u8]> {
    if base.is_empty() || path.starts_with(b"/") {
        return Cow::Borrowed(path);
    }
    if path.is_empty() {
        return Cow::Borrowed(base);
    }

    let mut joined = base.to_vec();
    if !joined.ends_with(b"/") {
        joined.push(b'/');
    }
    joined.extend_from_slice(path);
    Cow::Owned(joined)
}

/// Reads only the file table of the line program at `offset`.
pub fn read_file_table<'a>(
    debug_line: Section<'a>,
    offset: u64,
    comp_dir: &'a [u8],
    pools: &mut Pools,
) -> Result<Vec<FileId>, DwarfError> {
    let (header, _) = LineProgramHeader::parse(debug_line, offset)?;
    Ok(header.file_ids(comp_dir, pools))
}

/// A contiguous range of code attributed to one source line.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct LineRow {
    /// The first address of the range.
    pub address: u64,
    /// The size of the range in bytes, at most [`MAX_LINE_SIZE`].
    pub size: u32,
    /// The source file.
    pub file: FileId,
    /// The line number, at most [`MAX_LINE_NUMBER`].
    pub line: u32,
}

/// The registers of the line-number state machine that affect line records.
///
/// Column, basic block and prologue markers are decoded but not tracked.
#[derive(Clone, Copy, Debug)]
struct LineState {
    address: u64,
    file: u64,
    line: u64,
    is_stmt: bool,
}

impl LineState {
    fn new(default_is_stmt: bool) -> Self {
        LineState {
            address: 0,
            file: 1,
            line: 1,
            is_stmt: default_is_stmt,
        }
    }
}

/// The row most recently created while `is_stmt` was set.
#[derive(Clone, Copy, Debug)]
struct PendingRow {
    address: u64,
    file: u64,
    line: u64,
}

/// A line-number program with its header.
#[derive(Clone, Debug)]
pub struct LineProgram<'a> {
    header: LineProgramHeader<'a>,
    program: Cursor<'a>,
}

impl<'a> LineProgram<'a> {
    /// Parses the header of the line program at `offset`.
    pub fn parse(debug_line: Section<'a>, offset: u64) -> Result<Self, DwarfError> {
        let (header, program) = LineProgramHeader::parse(debug_line, offset)?;
        Ok(LineProgram { header, program })
    }

    /// The program header.
    pub fn header(&self) -> &LineProgramHeader<'a> {
        &self.header
    }

    /// Runs the program and appends its rows to `rows`.
    ///
    /// Each row covers the code from one statement boundary to the next and is attributed to the
    /// file and line of the first boundary, so a row is only emitted once the address has moved
    /// past it. Rows are collected per sequence: if decoding fails, rows of the broken sequence are
    /// discarded, rows of earlier sequences are kept, and the error is returned.
    pub fn run(
        &self,
        comp_dir: &'a [u8],
        bias: u64,
        pools: &mut Pools,
        diagnostics: &mut Diagnostics,
        rows: &mut Vec<LineRow>,
    ) -> Result<(), DwarfError> {
        let mut machine = LineMachine {
            header: &self.header,
            comp_dir,
            bias,
            files: self.header.file_ids(comp_dir, pools),
            pools,
            diagnostics,
            rows,
            state: LineState::new(self.header.default_is_stmt),
            pending: None,
            sequence: Vec::new(),
        };

        let mut cursor = self.program;
        while !cursor.is_empty() {
            machine.step(&mut cursor)?;
        }

        Ok(())
    }
}

/// Interprets opcodes and collects the rows of the current sequence.
struct LineMachine<'h, 'a> {
    header: &'h LineProgramHeader<'a>,
    comp_dir: &'a [u8],
    bias: u64,
    files: Vec<FileId>,
    pools: &'h mut Pools,
    diagnostics: &'h mut Diagnostics,
    rows: &'h mut Vec<LineRow>,
    state: LineState,
    pending: Option<PendingRow>,
    sequence: Vec<LineRow>,
}

impl<'h, 'a> LineMachine<'h, 'a> {
    fn advance(&mut self, operation_advance: u64) {
        let step = u64::from(self.header.minimum_instruction_length);
        self.state.address = self
            .state
            .address
            .wrapping_add(operation_advance.wrapping_mul(step));
    }

    /// Creates a row from the current registers.
    fn create_row(&mut self) {
        if self.state.is_stmt {
            if let Some(pending) = self.pending {
                self.emit(pending, self.state.address);
            }
            self.pending = Some(PendingRow {
                address: self.state.address,
                file: self.state.file,
                line: self.state.line,
            });
        }
    }

    fn end_sequence(&mut self) {
        if let Some(pending) = self.pending.take() {
            self.emit(pending, self.state.address);
        }
        self.rows.append(&mut self.sequence);
        self.state = LineState::new(self.header.default_is_stmt);
    }

    fn emit(&mut self, row: PendingRow, end: u64) {
        if end < row.address {
            self.diagnostics.warn_once(
                "line-address-backwards",
                ".debug_line",
                "line program address moves backwards",
            );
            return;
        }

        let size = end - row.address;
        if size == 0 {
            return;
        }
        if size > MAX_LINE_SIZE {
            self.diagnostics.warn_once(
                "line-range-too-large",
                ".debug_line",
                format_args!("line record at {:#x} covers {size:#x} bytes", row.address),
            );
            return;
        }
        if row.line > MAX_LINE_NUMBER {
            self.diagnostics.warn_once(
                "line-number-too-large",
                ".debug_line",
                format_args!("line number {} is too large", row.line),
            );
            return;
        }

        let file = match usize::try_from(row.file).ok().and_then(|i| self.files.get(i)) {
            Some(&file) => file,
            None => {
                self.diagnostics.warn_once(
                    "line-file-index",
                    ".debug_line",
                    format_args!("file index {} is out of range", row.file),
                );
                FileId::UNKNOWN
            }
        };

        self.sequence.push(LineRow {
            address: row.address.wrapping_add(self.bias),
            size: size as u32,
            file,
            line: row.line as u32,
        });
    }

    fn step(&mut self, cursor: &mut Cursor<'a>) -> Result<(), DwarfError> {
        let header = self.header;
        let opcode = cursor.read_u8()?;

        if opcode >= header.opcode_base {
            let adjusted = u64::from(opcode - header.opcode_base);
            let line_range = u64::from(header.line_range);
            self.advance(adjusted / line_range);
            let delta = i64::from(header.line_base) + (adjusted % line_range) as i64;
            self.state.line = self.state.line.wrapping_add_signed(delta);
            self.create_row();
            return Ok(());
        }

        match gimli::DwLns(opcode) {
            constants::DW_LNS_copy => self.create_row(),
            constants::DW_LNS_advance_pc => {
                let advance = cursor.read_uleb128()?;
                self.advance(advance);
            }
            constants::DW_LNS_advance_line => {
                let delta = cursor.read_sleb128()?;
                self.state.line = self.state.line.wrapping_add_signed(delta);
            }
            constants::DW_LNS_set_file => self.state.file = cursor.read_uleb128()?,
            constants::DW_LNS_set_column => {
                cursor.read_uleb128()?;
            }
            constants::DW_LNS_negate_stmt => self.state.is_stmt = !self.state.is_stmt,
            constants::DW_LNS_set_basic_block => {}
            constants::DW_LNS_const_add_pc => {
                let adjusted = 255 - header.opcode_base;
                self.advance(u64::from(adjusted / header.line_range));
            }
            constants::DW_LNS_fixed_advance_pc => {
                let advance = cursor.read_u16()?;
                self.state.address = self.state.address.wrapping_add(advance.into());
            }
            constants::DW_LNS_set_prologue_end | constants::DW_LNS_set_epilogue_begin => {}
            constants::DW_LNS_set_isa => {
                cursor.read_uleb128()?;
            }
            _ if opcode == 0 => self.extended(cursor)?,
            _ => {
                // Unknown standard opcodes declare their operand count in the header.
                let count = header
                    .standard_opcode_lengths
                    .get(usize::from(opcode) - 1)
                    .copied()
                    .unwrap_or(0);
                for _ in 0..count {
                    cursor.read_uleb128()?;
                }
            }
        }

        Ok(())
    }

    fn extended(&mut self, cursor: &mut Cursor<'a>) -> Result<(), DwarfError> {
        let length = cursor.read_uleb128()?;
        let mut operands = cursor.split(length)?;
        let Ok(opcode) = operands.read_u8() else {
            return Ok(());
        };

        match gimli::DwLne(opcode) {
            constants::DW_LNE_end_sequence => self.end_sequence(),
            constants::DW_LNE_set_address => {
                let size = u8::try_from(operands.remaining())
                    .map_err(|_| DwarfError::InvalidHeader("address operand too large"))?;
                self.state.address = operands.read_uint(size)?;
            }
            constants::DW_LNE_define_file => {
                let entry = FileEntry {
                    name: operands.read_cstr()?,
                    dir_index: operands.read_uleb128()?,
                    mtime: operands.read_uleb128()?,
                    length: operands.read_uleb128()?,
                };
                let id = self.header.intern_file(&entry, self.comp_dir, self.pools);
                self.files.push(id);
            }
            // The discriminator and vendor extensions do not affect line records.
            _ => {}
        }

        Ok(())
    }
}

/// Iterates all line programs of `.debug_line` in section order.
///
/// Used when there is no `.debug_info` to locate the programs of each unit. Iteration stops at the
/// first header that cannot be parsed, since the next program cannot be located reliably.
pub fn sequential_line_programs<'a>(
    debug_line: Section<'a>,
) -> impl Iterator<Item = (u64, Result<LineProgram<'a>, DwarfError>)> {
    let mut offset = 0;
    let mut done = false;
    std::iter::from_fn(move || {
        if done || offset >= debug_line.len() as u64 {
            return None;
        }

        let current = offset;
        let result = LineProgram::parse(debug_line, current);
        match &result {
            Ok(program) => offset = program.header.end,
            Err(_) => done = true,
        }
        Some((current, result))
    })
}

use std::collections::HashMap;
use std::ops::Range;

use dbgi_common::{CpuFamily, Diagnostics, Section};

use crate::encoding::PointerBases;
use crate::entries::{Cie, CfiFlavor, EntryKind, Fde, FrameEntries, RawEntry};
use crate::exidx::{exidx_params, ArmFrame, ExidxEntries, ExidxUnwind};
use crate::expr::ExprPool;
use crate::machine::{CfiMachine, FrameParams};
use crate::recipe::{CfiRecord, Summarizer};
use crate::{CfiError, CfiErrorKind, CfiOptions};

/// Reads the call frame information of one object.
///
/// The reader is the explicit context of one decoding pass: it carries the target description,
/// the pool that recipe expressions are interned into, and the diagnostics that broken entries
/// are reported to. Entries that fail to decode are skipped with a warning.
pub struct CfiReader<'p> {
    cpu: CpuFamily,
    address_size: u8,
    bias: u64,
    text: Option<u64>,
    data: Option<u64>,
    options: CfiOptions,
    pool: &'p mut ExprPool,
    diagnostics: &'p mut Diagnostics,
}

impl<'p> CfiReader<'p> {
    /// Creates a reader for objects of the given CPU family.
    pub fn new(cpu: CpuFamily, pool: &'p mut ExprPool, diagnostics: &'p mut Diagnostics) -> Self {
        CfiReader {
            cpu,
            address_size: cpu.pointer_size().unwrap_or(8),
            bias: 0,
            text: None,
            data: None,
            options: CfiOptions::default(),
            pool,
            diagnostics,
        }
    }

    /// Sets the load bias added to all addresses.
    pub fn with_bias(mut self, bias: u64) -> Self {
        self.bias = bias;
        self
    }

    /// Sets the size of target addresses, if it differs from the CPU family's pointer size.
    pub fn with_address_size(mut self, address_size: u8) -> Self {
        self.address_size = address_size;
        self
    }

    /// Sets the base addresses of `.text` and `.got` for relative pointer encodings.
    pub fn with_bases(mut self, text: Option<u64>, data: Option<u64>) -> Self {
        self.text = text;
        self.data = data;
        self
    }

    /// Sets interpretation options.
    pub fn with_options(mut self, options: CfiOptions) -> Self {
        self.options = options;
        self
    }

    fn bases(&self, section: &Section<'_>) -> PointerBases {
        PointerBases {
            section: section.address(),
            text: self.text,
            data: self.data,
        }
    }

    /// Runs a frame program over `range` and appends the summarized records.
    ///
    /// Records summarized before an error are kept.
    fn run_program<'a>(
        &mut self,
        section: &'static str,
        params: FrameParams,
        initial: &'a [u8],
        range: Range<u64>,
        instructions: &'a [u8],
        records: &mut Vec<CfiRecord>,
    ) -> Result<(), CfiError> {
        let mut machine = CfiMachine::new(params, &self.options);
        machine.run_initial(initial)?;

        let bias = self.bias;
        let diagnostics = &mut *self.diagnostics;
        let max_range = self.options.max_range;
        let mut summarizer = Summarizer::new(self.cpu, params, max_range, &mut *self.pool);

        machine.run(range, instructions, |range, rules| {
            match summarizer.summarize(range.clone(), rules) {
                Ok(mut record) => {
                    record.range = record.range.start.wrapping_add(bias)
                        ..record.range.end.wrapping_add(bias);
                    records.push(record);
                }
                Err(reason) => {
                    tracing::trace!(
                        start = range.start,
                        end = range.end,
                        %reason,
                        "cannot summarize cfi rules"
                    );
                    diagnostics.warn_once(
                        "cfi-summarize",
                        section,
                        format_args!("some call frame rules cannot be summarized: {reason}"),
                    );
                }
            }
        })
    }

    fn cie<'a>(
        &self,
        section: Section<'a>,
        flavor: CfiFlavor,
        offset: u64,
    ) -> Result<Cie<'a>, CfiError> {
        let mut entries = FrameEntries::at(section, flavor, offset)
            .map_err(|e| CfiError::new(CfiErrorKind::BadFde, e))?;
        match entries.next() {
            Some((_, Ok(entry))) => Cie::parse(&entry, self.address_size),
            Some((_, Err(error))) => Err(CfiError::new(CfiErrorKind::BadFde, error)),
            None => Err(CfiError::new(CfiErrorKind::BadFde, "missing CIE")),
        }
    }

    fn read_fde<'a>(
        &mut self,
        section: Section<'a>,
        flavor: CfiFlavor,
        entry: &RawEntry<'a>,
        cies: &mut HashMap<u64, Result<Cie<'a>, CfiErrorKind>>,
        records: &mut Vec<CfiRecord>,
    ) -> Result<(), CfiError> {
        let EntryKind::Fde { cie_offset } = entry.kind else {
            return Ok(());
        };

        let cie = match cies.get(&cie_offset) {
            Some(cached) => (*cached)?,
            None => {
                let parsed = self.cie(section, flavor, cie_offset);
                cies.insert(cie_offset, parsed.as_ref().copied().map_err(|e| e.kind()));
                parsed?
            }
        };

        let bases = self.bases(&section);
        let fde = Fde::parse(entry, &cie, &bases)?;
        let end = fde
            .initial_location
            .checked_add(fde.address_range)
            .ok_or_else(|| CfiError::new(CfiErrorKind::BadFde, "address range overflows"))?;

        let params = FrameParams::from_cie(&cie, section.endian(), bases);
        self.run_program(
            section.name(),
            params,
            cie.initial_instructions,
            fde.initial_location..end,
            fde.instructions,
            records,
        )
    }

    /// Reads all FDEs of `.eh_frame` or `.debug_frame`.
    ///
    /// Each FDE produces records for the ranges its rules can be summarized over, in ascending
    /// order. A CIE or FDE that fails to decode is reported and skipped.
    #[tracing::instrument(level = "trace", skip_all, fields(section = section.name()))]
    pub fn read_frame_section(&mut self, section: Section<'_>, flavor: CfiFlavor) -> Vec<CfiRecord> {
        let mut records = Vec::new();
        let mut cies = HashMap::new();

        for (offset, entry) in FrameEntries::new(section, flavor) {
            let result = entry.and_then(|entry| {
                self.read_fde(section, flavor, &entry, &mut cies, &mut records)
            });

            if let Err(error) = result {
                tracing::debug!(offset, %error, "skipping call frame entry");
                self.diagnostics.warn(
                    section.name(),
                    Some(offset),
                    format_args!("skipping call frame entry: {error}"),
                );
            }
        }

        records
    }

    /// Reads the ARM exception index.
    ///
    /// Each function's range ends where the next function starts. The last function ends at
    /// `text_end`, and is skipped if that is not known.
    #[tracing::instrument(level = "trace", skip_all)]
    pub fn read_exidx(
        &mut self,
        exidx: Section<'_>,
        extab: Section<'_>,
        text_end: Option<u64>,
    ) -> Vec<CfiRecord> {
        let entries: Vec<_> = ExidxEntries::new(exidx, extab).collect();
        let params = exidx_params(exidx.endian());
        let mut records = Vec::new();

        for (index, (offset, entry)) in entries.iter().enumerate() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(error) => {
                    self.diagnostics.warn(
                        exidx.name(),
                        Some(*offset),
                        format_args!("skipping exception index entry: {error}"),
                    );
                    continue;
                }
            };

            let opcodes = match &entry.unwind {
                ExidxUnwind::Opcodes(opcodes) => opcodes,
                ExidxUnwind::CantUnwind => {
                    tracing::trace!(function = entry.function, "function cannot unwind");
                    continue;
                }
            };

            let end = entries[index + 1..]
                .iter()
                .find_map(|(_, next)| next.as_ref().ok().map(|next| next.function))
                .or(text_end);
            let range = match end {
                Some(end) if end > entry.function => entry.function..end,
                _ => {
                    tracing::trace!(function = entry.function, "no extent for exidx entry");
                    continue;
                }
            };

            let result = ArmFrame::decode(opcodes).and_then(|frame| {
                let program = frame.to_dwarf();
                self.run_program(exidx.name(), params, &[], range, &program, &mut records)
            });

            if let Err(error) = result {
                self.diagnostics.warn(
                    exidx.name(),
                    Some(*offset),
                    format_args!("skipping exception index entry: {error}"),
                );
            }
        }

        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use dbgi_common::Endian;
    use dbgi_testutils::Assembler;
    use gimli::constants;
    use similar_asserts::assert_eq;

    fn debug_frame() -> Vec<u8> {
        let mut asm = Assembler::little();
        asm.length32(|asm| {
            asm.u32(0xffff_ffff)
                .u8(3)
                .cstr("")
                .uleb(1)
                .sleb(-8)
                .uleb(16)
                .u8(constants::DW_CFA_def_cfa.0)
                .uleb(7)
                .uleb(8)
                .u8(constants::DW_CFA_offset.0 | 16)
                .uleb(1);
        });
        asm.length32(|asm| {
            asm.u32(0)
                .u64(0x1000)
                .u64(0x10)
                .u8(constants::DW_CFA_advance_loc.0 | 1)
                .u8(constants::DW_CFA_def_cfa_offset.0)
                .uleb(16);
        });
        // Refers to a CIE that does not exist.
        asm.length32(|asm| {
            asm.u32(0x400).u64(0x2000).u64(0x10);
        });
        asm.finish()
    }

    #[test]
    fn test_read_debug_frame() {
        let data = debug_frame();
        let section = Section::new(".debug_frame", &data, Endian::Little);

        let mut pool = ExprPool::new();
        let mut diagnostics = Diagnostics::new();
        let records = CfiReader::new(CpuFamily::Amd64, &mut pool, &mut diagnostics)
            .with_bias(0x10_0000)
            .read_frame_section(section, CfiFlavor::DebugFrame);

        let rendered: Vec<_> = records
            .iter()
            .map(|record| format!("{:x?} {}", record.range, record.recipe))
            .collect();
        assert_eq!(
            rendered,
            vec![
                "101000..101001 cfa=sp+8 ra=*(cfa-8)".to_owned(),
                "101001..101010 cfa=sp+16 ra=*(cfa-8)".to_owned(),
            ]
        );

        assert_eq!(diagnostics.len(), 1);
        let diagnostic = diagnostics.iter().next().unwrap();
        assert_eq!(diagnostic.offset, Some(0x2d));
    }
}

use std::ops::Range;

use dbgi_cfi::{CfiFlavor, CfiOptions, CfiReader, RecipeDisplay, UnwindRecipe};
use dbgi_common::{Arch, Diagnostics, Endian, Image, Pools, Section};
use dbgi_dwarf::{
    read_dwarf, AltSections, DedupOptions, DedupStats, DwarfOptions, DwarfSections, InlineRecord,
    TypeArena, VariableRecord,
};

use crate::cfi::CfiTable;
use crate::error::StoreError;
use crate::inlines::InlineTable;
use crate::lines::{LineRecord, LineTable};
use crate::mappings::{ExecutableRanges, Mapping, SectionInfo, SectionKind};
use crate::object::{ElfObject, SectionData, DEBUG_SECTIONS};
use crate::scopes::ScopeTree;
use crate::symbols::{Symbol, SymbolTable};

/// The sections read from an alternate debug file.
const ALT_SECTIONS: &[&str] = &[".debug_info", ".debug_abbrev", ".debug_str"];

/// Options for [`DebugInfo::load`].
#[derive(Clone, Debug)]
pub struct LoadOptions<'a> {
    /// Extract types and variables from `.debug_info`. Defaults to `false`.
    pub read_var_info: bool,
    /// Extract inlined calls from `.debug_info`. Defaults to `true`.
    pub read_inline_info: bool,
    /// The depth of the `DW_CFA_remember_state` stack. Defaults to 4.
    pub cfi_state_stack_depth: usize,
    /// Tuning of the type deduplication.
    pub dedup: DedupOptions,
    /// The image of the alternate debug file named by `.gnu_debugaltlink`.
    pub alt_image: Option<Image<'a>>,
    /// The load bias added to every link-time address.
    ///
    /// If this is not set, the bias is computed from [`load_address`](Self::load_address).
    pub text_bias: Option<u64>,
    /// The runtime address of the first loaded segment.
    pub load_address: Option<u64>,
}

impl Default for LoadOptions<'_> {
    fn default() -> Self {
        LoadOptions {
            read_var_info: false,
            read_inline_info: true,
            cfi_state_stack_depth: CfiOptions::default().state_stack_depth,
            dedup: DedupOptions::default(),
            alt_image: None,
            text_bias: None,
            load_address: None,
        }
    }
}

/// Reads the sections with the given names, reporting the ones that cannot be read.
fn read_sections<'o>(
    object: &'o ElfObject<'_>,
    names: &[&'static str],
    diagnostics: &mut Diagnostics,
) -> Vec<SectionData<'o>> {
    let mut sections = Vec::new();
    for &name in names {
        match object.section_data(name) {
            Ok(Some(data)) => sections.push(data),
            Ok(None) => tracing::trace!(name, "section not present"),
            Err(error) => diagnostics.error(name, None, error),
        }
    }
    sections
}

fn find_section<'s>(
    sections: &'s [SectionData<'_>],
    name: &'static str,
    endian: Endian,
) -> Section<'s> {
    sections
        .iter()
        .find(|data| data.name == name)
        .map_or_else(|| Section::empty(name, endian), |data| data.section(endian))
}

/// The debug information of one loaded object.
///
/// A `DebugInfo` is built in two phases. While it is mutable, decoders append symbols, line
/// records, inlined calls, unwind records and variables in any order. [`freeze`](Self::freeze)
/// then canonicalizes every table once. Lookups are only served after that, and panic on a
/// container that has not been frozen.
///
/// Problems with the input are collected in [`diagnostics`](Self::diagnostics). A container with
/// broken debug information is still usable; it has gaps where the information could not be read.
///
/// # Example
///
/// ```no_run
/// use dbgi_common::Image;
/// use dbgi_store::{DebugInfo, LoadOptions};
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let image = Image::open("libfoo.so")?;
///     let info = DebugInfo::load(image, &LoadOptions::default())?;
///
///     if let Some(symbol) = info.lookup_symbol(0x1234) {
///         println!("{}", info.pools().strings.get(symbol.name));
///     }
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct DebugInfo {
    arch: Arch,
    soname: Option<String>,
    build_id: Option<Vec<u8>>,
    bias: u64,
    cfi_options: CfiOptions,
    mappings: Vec<Mapping>,
    sections: Vec<SectionInfo>,
    pools: Pools,
    symbols: SymbolTable,
    lines: LineTable,
    inlines: InlineTable,
    cfi: CfiTable,
    types: TypeArena,
    variables: Vec<VariableRecord>,
    scopes: ScopeTree,
    dedup: DedupStats,
    diagnostics: Diagnostics,
    has_types: bool,
    frozen: bool,
}

impl DebugInfo {
    /// Creates an empty, mutable container for an object of the given architecture.
    pub fn new(arch: Arch) -> Self {
        DebugInfo {
            arch,
            soname: None,
            build_id: None,
            bias: 0,
            cfi_options: CfiOptions::default(),
            mappings: Vec::new(),
            sections: Vec::new(),
            pools: Pools::new(),
            symbols: SymbolTable::new(),
            lines: LineTable::new(),
            inlines: InlineTable::new(),
            cfi: CfiTable::new(),
            types: TypeArena::default(),
            variables: Vec::new(),
            scopes: ScopeTree::default(),
            dedup: DedupStats::default(),
            diagnostics: Diagnostics::new(),
            has_types: false,
            frozen: false,
        }
    }

    /// Loads the debug information of an ELF object and freezes it.
    ///
    /// Fails only if the ELF headers cannot be read. Damaged debug sections are reported in the
    /// diagnostics of the returned container.
    #[tracing::instrument(level = "trace", skip_all, fields(size = image.size()))]
    pub fn load(image: Image<'_>, options: &LoadOptions<'_>) -> Result<Self, StoreError> {
        let object = ElfObject::parse(image)?;
        let endian = object.endian();
        let bias = match (options.text_bias, options.load_address) {
            (Some(bias), _) => bias,
            (None, Some(address)) => address.wrapping_sub(object.load_address()),
            (None, None) => 0,
        };

        let mut info = DebugInfo::new(object.arch());
        info.set_bias(bias);
        info.cfi_options.state_stack_depth = options.cfi_state_stack_depth;
        info.build_id = object.build_id();
        match object.soname() {
            Ok(soname) => info.soname = soname,
            Err(error) => info.diagnostics.warn(".dynamic", None, error),
        }

        for mapping in object.mappings(bias) {
            info.add_mapping(mapping);
        }
        for section in object.section_infos(bias) {
            info.add_section(section);
        }

        let symbols = object.symbols(bias, &mut info.pools.strings, &mut info.diagnostics);
        tracing::debug!(count = symbols.len(), "read symbols");
        for symbol in symbols {
            info.add_symbol(symbol);
        }

        let loaded = read_sections(&object, DEBUG_SECTIONS, &mut info.diagnostics);

        let alt_object = match &options.alt_image {
            Some(image) => info.open_alt(&object, image.clone()),
            None => None,
        };
        let alt_loaded = match &alt_object {
            Some(alt) => read_sections(alt, ALT_SECTIONS, &mut info.diagnostics),
            None => Vec::new(),
        };
        let alt = alt_object.as_ref().map(|alt| AltSections {
            debug_info: find_section(&alt_loaded, ".debug_info", alt.endian()),
            debug_abbrev: find_section(&alt_loaded, ".debug_abbrev", alt.endian()),
            debug_str: find_section(&alt_loaded, ".debug_str", alt.endian()),
        });

        let section = |name| find_section(&loaded, name, endian);
        let dwarf = DwarfSections {
            debug_info: section(".debug_info"),
            debug_types: section(".debug_types"),
            debug_abbrev: section(".debug_abbrev"),
            debug_str: section(".debug_str"),
            debug_line: section(".debug_line"),
            debug_ranges: section(".debug_ranges"),
            debug_loc: section(".debug_loc"),
            alt,
        };
        info.add_dwarf(
            dwarf,
            &DwarfOptions {
                bias,
                read_types_and_variables: options.read_var_info,
                read_inlines: options.read_inline_info,
                dedup: options.dedup,
            },
        );

        for (name, flavor) in [
            (".debug_frame", CfiFlavor::DebugFrame),
            (".eh_frame", CfiFlavor::EhFrame),
        ] {
            let frame = section(name);
            if !frame.is_empty() {
                info.add_frame_section(frame, flavor);
            }
        }

        let exidx = section(".ARM.exidx");
        if info.arch == Arch::Arm && !exidx.is_empty() {
            let text_end = info.link_range(SectionKind::Text).map(|range| range.end);
            info.add_exidx(exidx, section(".ARM.extab"), text_end);
        }

        info.freeze();
        Ok(info)
    }

    /// Parses the alternate debug file and checks it against the link in `object`.
    fn open_alt<'a>(&mut self, object: &ElfObject<'_>, image: Image<'a>) -> Option<ElfObject<'a>> {
        let alt = match ElfObject::parse(image) {
            Ok(alt) => alt,
            Err(error) => {
                self.diagnostics.warn(".gnu_debugaltlink", None, error);
                return None;
            }
        };

        match object.alt_link() {
            Ok(Some(link)) => {
                if alt.build_id().as_deref() != Some(link.build_id.as_slice()) {
                    self.diagnostics.warn(
                        ".gnu_debugaltlink",
                        None,
                        format_args!("build id of {} does not match the debug link", link.path),
                    );
                }
            }
            Ok(None) => tracing::debug!("alternate image given, but no debug link in object"),
            Err(error) => self.diagnostics.warn(".gnu_debugaltlink", None, error),
        }

        Some(alt)
    }

    fn assert_mutable(&self) {
        assert!(!self.frozen, "DebugInfo modified after freeze");
    }

    fn assert_frozen(&self) {
        assert!(self.frozen, "DebugInfo queried before freeze");
    }

    /// Sets the shared object name.
    pub fn set_soname(&mut self, soname: impl Into<String>) {
        self.soname = Some(soname.into());
    }

    /// Sets the load bias applied by subsequent `add_*` calls.
    pub fn set_bias(&mut self, bias: u64) {
        self.assert_mutable();
        self.bias = bias;
    }

    /// Sets the options used to interpret call frame information.
    pub fn set_cfi_options(&mut self, options: CfiOptions) {
        self.assert_mutable();
        self.cfi_options = options;
    }

    /// Adds a memory mapping of the object.
    ///
    /// Line and unwind records are clipped to the executable mappings.
    pub fn add_mapping(&mut self, mapping: Mapping) {
        self.assert_mutable();
        self.mappings.push(mapping);
    }

    /// Adds the runtime location of a section.
    pub fn add_section(&mut self, section: SectionInfo) {
        self.assert_mutable();
        self.sections.push(section);
    }

    /// Adds a symbol with a runtime address.
    pub fn add_symbol(&mut self, symbol: Symbol) {
        self.assert_mutable();
        self.symbols.push(symbol);
    }

    /// Decodes the DWARF sections of the object.
    ///
    /// Line records and inlined calls accumulate over several calls. Types and variables are only
    /// taken from the first call that reads them.
    pub fn add_dwarf(&mut self, sections: DwarfSections<'_>, options: &DwarfOptions) {
        self.assert_mutable();

        let mut options = *options;
        if options.read_types_and_variables && self.has_types {
            self.diagnostics.warn_once(
                "dwarf-types-twice",
                ".debug_info",
                "types were already read, ignoring types of further sections",
            );
            options.read_types_and_variables = false;
        }

        let output = read_dwarf(sections, &options, &mut self.pools, &mut self.diagnostics);
        tracing::debug!(
            lines = output.lines.len(),
            inlines = output.inlines.len(),
            types = output.types.len(),
            variables = output.variables.len(),
            "read dwarf"
        );

        self.lines.extend(output.lines);
        self.inlines.extend(output.inlines);
        if options.read_types_and_variables {
            self.types = output.types;
            self.variables = output.variables;
            self.dedup = output.dedup;
            self.has_types = true;
        }
    }

    /// Returns the link-time range of a section kind.
    fn link_range(&self, kind: SectionKind) -> Option<Range<u64>> {
        let section = self.sections.iter().find(|section| section.kind == kind)?;
        let start = section.address.wrapping_sub(section.bias);
        Some(start..start.wrapping_add(section.size))
    }

    fn cfi_reader(&mut self) -> CfiReader<'_> {
        let text = self.link_range(SectionKind::Text).map(|range| range.start);
        let got = self.link_range(SectionKind::Got).map(|range| range.start);

        CfiReader::new(
            self.arch.cpu_family(),
            self.cfi.exprs_mut(),
            &mut self.diagnostics,
        )
        .with_bias(self.bias)
        .with_bases(text, got)
        .with_options(self.cfi_options)
    }

    /// Decodes a `.eh_frame` or `.debug_frame` section.
    ///
    /// `section` must carry its link-time address for PC-relative pointers.
    pub fn add_frame_section(&mut self, section: Section<'_>, flavor: CfiFlavor) {
        self.assert_mutable();
        let records = self.cfi_reader().read_frame_section(section, flavor);
        tracing::debug!(section = section.name(), records = records.len(), "read cfi");
        self.cfi.extend(records);
    }

    /// Decodes the ARM exception index and its table.
    ///
    /// `text_end` is the link-time end of the code, which bounds the last function.
    pub fn add_exidx(&mut self, exidx: Section<'_>, extab: Section<'_>, text_end: Option<u64>) {
        self.assert_mutable();
        let records = self.cfi_reader().read_exidx(exidx, extab, text_end);
        tracing::debug!(records = records.len(), "read exidx");
        self.cfi.extend(records);
    }

    /// Canonicalizes all tables and makes the container immutable.
    ///
    /// Calling this more than once has no effect.
    pub fn freeze(&mut self) {
        if self.frozen {
            return;
        }

        let executable = ExecutableRanges::new(&self.mappings);
        if executable.is_empty() {
            tracing::debug!("no executable mappings, records are not clipped");
        }

        let strings = &self.pools.strings;
        let symbols = &mut self.symbols;
        tracing::trace_span!("canonicalize symbols").in_scope(|| symbols.canonicalize(strings));

        let lines = &mut self.lines;
        tracing::trace_span!("canonicalize lines").in_scope(|| lines.canonicalize(&executable));

        let inlines = &mut self.inlines;
        tracing::trace_span!("canonicalize inlines").in_scope(|| inlines.canonicalize());

        let cfi = &mut self.cfi;
        tracing::trace_span!("canonicalize cfi").in_scope(|| cfi.canonicalize(&executable));

        let variables = &self.variables;
        let diagnostics = &mut self.diagnostics;
        self.scopes = tracing::trace_span!("build scopes")
            .in_scope(|| ScopeTree::build(variables, diagnostics));

        self.frozen = true;
    }

    /// Returns `true` once the container has been frozen.
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Finds the symbol containing `address`.
    pub fn lookup_symbol(&self, address: u64) -> Option<&Symbol> {
        self.assert_frozen();
        self.symbols.lookup(address)
    }

    /// Finds the line record containing `address`.
    ///
    /// Use [`Pools::file_path`] to resolve the file of the record.
    pub fn lookup_line(&self, address: u64) -> Option<&LineRecord> {
        self.assert_frozen();
        self.lines.lookup(address)
    }

    /// Returns the inlined calls covering `address`, outermost first.
    pub fn lookup_inline_chain(&self, address: u64) -> Vec<&InlineRecord> {
        self.assert_frozen();
        self.inlines.lookup_chain(address)
    }

    /// Returns the unwind recipe for `address`.
    ///
    /// There is always an answer. Addresses without call frame information get the unknown
    /// recipe.
    pub fn lookup_unwind_recipe(&self, address: u64) -> &UnwindRecipe {
        self.assert_frozen();
        self.cfi.lookup(address)
    }

    /// Returns the variables visible at `address` on one scope level.
    ///
    /// Level 0 holds global variables.
    pub fn lookup_variables(&self, address: u64, level: usize) -> Vec<&VariableRecord> {
        self.assert_frozen();
        self.scopes
            .lookup(address, level)
            .iter()
            .filter_map(|&index| self.variables.get(index as usize))
            .collect()
    }

    /// Formats a recipe of this container with the register names of its architecture.
    pub fn display_recipe<'a>(&'a self, recipe: &'a UnwindRecipe) -> RecipeDisplay<'a> {
        recipe.display(self.cfi.exprs(), self.arch.cpu_family())
    }

    /// The CPU architecture of the object.
    pub fn arch(&self) -> Arch {
        self.arch
    }

    /// The shared object name, if known.
    pub fn soname(&self) -> Option<&str> {
        self.soname.as_deref()
    }

    /// The GNU build identifier, if known.
    pub fn build_id(&self) -> Option<&[u8]> {
        self.build_id.as_deref()
    }

    /// The load bias.
    pub fn bias(&self) -> u64 {
        self.bias
    }

    /// The memory mappings of the object.
    pub fn mappings(&self) -> &[Mapping] {
        &self.mappings
    }

    /// The runtime locations of well-known sections.
    pub fn sections(&self) -> &[SectionInfo] {
        &self.sections
    }

    /// The string and file pools referenced by all tables.
    pub fn pools(&self) -> &Pools {
        &self.pools
    }

    /// Mutable access to the pools, for interning names of added symbols.
    pub fn pools_mut(&mut self) -> &mut Pools {
        self.assert_mutable();
        &mut self.pools
    }

    /// The symbol table.
    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    /// The line table.
    pub fn lines(&self) -> &LineTable {
        &self.lines
    }

    /// The inlined calls.
    pub fn inlines(&self) -> &InlineTable {
        &self.inlines
    }

    /// The unwind table.
    pub fn cfi(&self) -> &CfiTable {
        &self.cfi
    }

    /// The deduplicated types.
    pub fn types(&self) -> &TypeArena {
        &self.types
    }

    /// Statistics of the type deduplication.
    pub fn dedup_stats(&self) -> DedupStats {
        self.dedup
    }

    /// All variables, in the order they were read.
    pub fn variables(&self) -> &[VariableRecord] {
        &self.variables
    }

    /// The variables indexed by scope.
    pub fn scopes(&self) -> &ScopeTree {
        &self.scopes
    }

    /// Problems found while loading.
    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }
}

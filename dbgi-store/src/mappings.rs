use std::fmt;
use std::ops::Range;

/// Access permissions of a memory mapping.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct Permissions {
    /// The mapping is readable.
    pub read: bool,
    /// The mapping is writable.
    pub write: bool,
    /// The mapping contains executable code.
    pub execute: bool,
}

impl fmt::Display for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = |set, c| if set { c } else { '-' };
        write!(
            f,
            "{}{}{}",
            flag(self.read, 'r'),
            flag(self.write, 'w'),
            flag(self.execute, 'x')
        )
    }
}

/// A part of the object file loaded into memory.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Mapping {
    /// The runtime start address.
    pub address: u64,
    /// The size in memory.
    pub size: u64,
    /// The offset of the mapped data in the object file.
    pub file_offset: u64,
    /// Access permissions.
    pub permissions: Permissions,
}

impl Mapping {
    /// The addresses covered by the mapping.
    pub fn range(&self) -> Range<u64> {
        self.address..self.address.saturating_add(self.size)
    }
}

/// The kind of an address-bearing section.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum SectionKind {
    /// Executable code, `.text`.
    Text,
    /// Initialized data, `.data`.
    Data,
    /// Read-only data, `.rodata`.
    Rodata,
    /// Zero-initialized data, `.bss`.
    Bss,
    /// The procedure linkage table, `.plt`.
    Plt,
    /// The global offset table, `.got`.
    Got,
    /// The PowerPC function descriptor table, `.opd`.
    Opd,
}

impl SectionKind {
    /// Returns the kind of the section named `name`.
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            ".text" => SectionKind::Text,
            ".data" => SectionKind::Data,
            ".rodata" => SectionKind::Rodata,
            ".bss" => SectionKind::Bss,
            ".plt" => SectionKind::Plt,
            ".got" => SectionKind::Got,
            ".opd" => SectionKind::Opd,
            _ => return None,
        })
    }
}

/// The location of a section at runtime.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SectionInfo {
    /// Which section this is.
    pub kind: SectionKind,
    /// The runtime address, with `bias` applied.
    pub address: u64,
    /// The size in memory.
    pub size: u64,
    /// The difference between runtime and link-time addresses.
    pub bias: u64,
}

impl SectionInfo {
    /// The runtime addresses covered by the section.
    pub fn range(&self) -> Range<u64> {
        self.address..self.address.saturating_add(self.size)
    }
}

/// The executable address ranges of an object, used to clip code records.
#[derive(Clone, Debug, Default)]
pub(crate) struct ExecutableRanges {
    ranges: Vec<Range<u64>>,
}

impl ExecutableRanges {
    pub fn new(mappings: &[Mapping]) -> Self {
        let mut ranges: Vec<_> = mappings
            .iter()
            .filter(|mapping| mapping.permissions.execute && mapping.size > 0)
            .map(Mapping::range)
            .collect();
        ranges.sort_by_key(|range| range.start);
        ExecutableRanges { ranges }
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Range<u64>> + '_ {
        self.ranges.iter()
    }

    /// Clips `range` to the executable range containing its start.
    ///
    /// Without executable ranges, nothing is clipped. Ranges starting outside of all executable
    /// ranges clip to nothing.
    pub fn clip(&self, range: Range<u64>) -> Option<Range<u64>> {
        if self.ranges.is_empty() {
            return Some(range);
        }

        let index = self
            .ranges
            .partition_point(|mapping| mapping.start <= range.start)
            .checked_sub(1)?;
        let mapping = &self.ranges[index];
        if range.start >= mapping.end {
            return None;
        }

        Some(range.start..range.end.min(mapping.end))
    }
}

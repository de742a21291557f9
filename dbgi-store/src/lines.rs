use dbgi_dwarf::LineRow;

use crate::mappings::ExecutableRanges;

/// A canonical line record: a range of code and its source location.
pub type LineRecord = LineRow;

/// The line table of a [`DebugInfo`](crate::DebugInfo).
#[derive(Clone, Debug, Default)]
pub struct LineTable {
    records: Vec<LineRecord>,
}

impl LineTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends line records in any order.
    pub fn extend<I>(&mut self, records: I)
    where
        I: IntoIterator<Item = LineRecord>,
    {
        self.records.extend(records);
    }

    /// The number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns `true` if there are no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The records, sorted by address after canonicalization.
    pub fn as_slice(&self) -> &[LineRecord] {
        &self.records
    }

    /// Sorts the records and removes overlaps.
    ///
    /// A record overlapping the next one is truncated at its start, and records clipped to an
    /// empty range are dropped. Records are also clipped to the executable mapping containing
    /// their start.
    pub(crate) fn canonicalize(&mut self, executable: &ExecutableRanges) {
        let mut records = std::mem::take(&mut self.records);
        dmsort::sort_by_key(&mut records, |record| record.address);

        let mut dropped = 0;
        let mut canonical = Vec::with_capacity(records.len());
        for (index, record) in records.iter().enumerate() {
            let mut end = record.address.saturating_add(record.size.into());
            if let Some(next) = records.get(index + 1) {
                end = end.min(next.address);
            }

            match executable.clip(record.address..end) {
                Some(range) if !range.is_empty() => canonical.push(LineRecord {
                    // clipping only shrinks the size
                    size: (range.end - range.start) as u32,
                    ..*record
                }),
                _ => dropped += 1,
            }
        }

        tracing::trace!(dropped, "dropped empty line records");
        self.records = canonical;
        self.check_sorted();
    }

    fn check_sorted(&self) {
        for pair in self.records.windows(2) {
            assert!(
                pair[0].address.saturating_add(pair[0].size.into()) <= pair[1].address,
                "line table overlaps at {:#x}",
                pair[1].address,
            );
        }
    }

    /// Finds the record covering `address`.
    pub fn lookup(&self, address: u64) -> Option<&LineRecord> {
        let index = self
            .records
            .partition_point(|record| record.address <= address)
            .checked_sub(1)?;
        let record = &self.records[index];
        (address - record.address < u64::from(record.size)).then_some(record)
    }
}

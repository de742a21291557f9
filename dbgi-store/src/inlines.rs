use dbgi_dwarf::InlineRecord;

/// The inlined calls of a [`DebugInfo`](crate::DebugInfo).
///
/// Records are sorted by start address. Ranges of different levels nest, so they are not clipped
/// against each other. Lookups scan backwards from the address, bounded by the longest range in
/// the table.
#[derive(Clone, Debug, Default)]
pub struct InlineTable {
    records: Vec<InlineRecord>,
    max_len: u64,
}

impl InlineTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends records in any order.
    pub fn extend<I>(&mut self, records: I)
    where
        I: IntoIterator<Item = InlineRecord>,
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

    /// The records, sorted by start address after canonicalization.
    pub fn as_slice(&self) -> &[InlineRecord] {
        &self.records
    }

    /// Sorts the records and drops malformed ranges.
    pub(crate) fn canonicalize(&mut self) {
        let before = self.records.len();
        self.records.retain(|record| record.range.start < record.range.end);
        if self.records.len() != before {
            tracing::trace!(
                dropped = before - self.records.len(),
                "dropped empty inline ranges"
            );
        }

        dmsort::sort_by_key(&mut self.records, |record| (record.range.start, record.level));
        self.max_len = self
            .records
            .iter()
            .map(|record| record.range.end - record.range.start)
            .max()
            .unwrap_or(0);
    }

    /// Returns the chain of inlined calls covering `address`, outermost call first.
    pub fn lookup_chain(&self, address: u64) -> Vec<&InlineRecord> {
        let end = self
            .records
            .partition_point(|record| record.range.start <= address);

        let mut chain: Vec<_> = self.records[..end]
            .iter()
            .rev()
            .take_while(|record| address - record.range.start < self.max_len)
            .filter(|record| record.range.contains(&address))
            .collect();

        chain.sort_by_key(|record| record.level);
        chain
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use dbgi_common::{FileId, StrId, StringPool};
    use similar_asserts::assert_eq;

    fn record(
        strings: &mut StringPool,
        name: &str,
        range: std::ops::Range<u64>,
        level: u16,
    ) -> InlineRecord {
        InlineRecord {
            range,
            name: strings.intern(name),
            call_file: FileId::UNKNOWN,
            call_line: 0,
            level,
        }
    }

    #[test]
    fn test_lookup_chain() {
        let mut strings = StringPool::new();
        let mut table = InlineTable::new();
        table.extend([
            record(&mut strings, "inner", 0x1010..0x1020, 1),
            record(&mut strings, "outer", 0x1000..0x1100, 0),
            record(&mut strings, "sibling", 0x1040..0x1050, 1),
            record(&mut strings, "broken", 0x1060..0x1060, 1),
        ]);
        table.canonicalize();
        assert_eq!(table.len(), 3);

        let chain = |address| -> Vec<&str> {
            table
                .lookup_chain(address)
                .into_iter()
                .map(|record| strings.get(record.name))
                .collect()
        };

        assert_eq!(chain(0x1018), vec!["outer", "inner"]);
        assert_eq!(chain(0x1020), vec!["outer"]);
        assert_eq!(chain(0x1045), vec!["outer", "sibling"]);
        assert_eq!(chain(0x1100), Vec::<&str>::new());
        assert_eq!(chain(0x0fff), Vec::<&str>::new());
        assert_ne!(table.as_slice()[0].name, StrId::EMPTY);
    }
}

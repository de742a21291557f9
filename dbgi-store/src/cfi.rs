use std::ops::Range;

use dbgi_cfi::{CfiRecord, ExprPool, UnwindRecipe};
use dbgi_common::Pool;

use crate::mappings::ExecutableRanges;

/// Indexes into the recipe pool, stored in the smallest width that fits all recipes.
#[derive(Clone, Debug)]
enum RecipeIndex {
    U8(Vec<u8>),
    U16(Vec<u16>),
    U32(Vec<u32>),
}

impl RecipeIndex {
    fn new(indexes: &[u32], recipes: usize) -> Self {
        // the conversions cannot truncate, since every index is below `recipes`
        if recipes <= 1 << 8 {
            RecipeIndex::U8(indexes.iter().map(|&i| i as u8).collect())
        } else if recipes <= 1 << 16 {
            RecipeIndex::U16(indexes.iter().map(|&i| i as u16).collect())
        } else {
            RecipeIndex::U32(indexes.to_vec())
        }
    }

    fn get(&self, index: usize) -> Option<u32> {
        match self {
            RecipeIndex::U8(v) => v.get(index).map(|&i| u32::from(i)),
            RecipeIndex::U16(v) => v.get(index).map(|&i| u32::from(i)),
            RecipeIndex::U32(v) => v.get(index).copied(),
        }
    }

    fn width(&self) -> usize {
        match self {
            RecipeIndex::U8(_) => 1,
            RecipeIndex::U16(_) => 2,
            RecipeIndex::U32(_) => 4,
        }
    }
}

impl Default for RecipeIndex {
    fn default() -> Self {
        RecipeIndex::U8(Vec::new())
    }
}

/// The unwind table of a [`DebugInfo`](crate::DebugInfo).
///
/// The canonical table is an array of start addresses with a parallel array of indexes into a
/// pool of distinct recipes. Every entry extends to the start of the next one. Gaps between
/// records hold the unknown recipe, so every address has an answer.
#[derive(Clone, Debug, Default)]
pub struct CfiTable {
    pending: Vec<CfiRecord>,
    exprs: ExprPool,
    recipes: Pool<UnwindRecipe>,
    bases: Vec<u64>,
    index: RecipeIndex,
    unknown: UnwindRecipe,
}

impl CfiTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// The pool that expressions of all recipes are interned into.
    pub fn exprs(&self) -> &ExprPool {
        &self.exprs
    }

    pub(crate) fn exprs_mut(&mut self) -> &mut ExprPool {
        &mut self.exprs
    }

    /// Appends records in any order. Their expressions must live in [`exprs`](Self::exprs).
    pub fn extend<I>(&mut self, records: I)
    where
        I: IntoIterator<Item = CfiRecord>,
    {
        self.pending.extend(records);
    }

    /// The number of distinct recipes, including the unknown recipe.
    pub fn recipe_count(&self) -> usize {
        self.recipes.len()
    }

    /// The size in bytes of one recipe index.
    pub fn index_width(&self) -> usize {
        self.index.width()
    }

    /// Sorts the records, removes overlaps and compacts them into the lookup arrays.
    ///
    /// Records are clipped to the start of the next record and to the executable mapping containing
    /// their start.
    pub(crate) fn canonicalize(&mut self, executable: &ExecutableRanges) {
        let mut records = std::mem::take(&mut self.pending);
        dmsort::sort_by_key(&mut records, |record| record.range.start);

        let mut recipes = Pool::new();
        let unknown = recipes.insert(UnwindRecipe::unknown());

        let mut bases = Vec::with_capacity(records.len() + 1);
        let mut indexes: Vec<u32> = Vec::with_capacity(records.len() + 1);
        let mut push = |base: u64, index: u32| {
            if indexes.last() != Some(&index) {
                bases.push(base);
                indexes.push(index);
            }
        };

        let mut dropped = 0;
        let mut covered: Option<u64> = None;
        for (position, record) in records.iter().enumerate() {
            let mut end = record.range.end;
            if let Some(next) = records.get(position + 1) {
                end = end.min(next.range.start);
            }

            let range = match executable.clip(record.range.start..end) {
                Some(range) if !range.is_empty() => range,
                _ => {
                    dropped += 1;
                    continue;
                }
            };

            if let Some(gap) = covered.filter(|&covered| covered < range.start) {
                push(gap, unknown);
            }
            push(range.start, recipes.insert(record.recipe.clone()));
            covered = Some(range.end);
        }

        if let Some(end) = covered {
            push(end, unknown);
        }

        tracing::debug!(
            entries = bases.len(),
            recipes = recipes.len(),
            dropped,
            "compacted unwind table"
        );

        for pair in bases.windows(2) {
            assert!(pair[0] < pair[1], "unwind table unsorted at {:#x}", pair[1]);
        }

        self.index = RecipeIndex::new(&indexes, recipes.len());
        self.recipes = recipes;
        self.bases = bases;
    }

    /// Returns the recipe for `address`. Addresses without call frame information resolve to the
    /// unknown recipe.
    pub fn lookup(&self, address: u64) -> &UnwindRecipe {
        let index = self
            .bases
            .partition_point(|&base| base <= address)
            .checked_sub(1)
            .and_then(|entry| self.index.get(entry))
            .unwrap_or(0);

        self.recipes.get(index).unwrap_or(&self.unknown)
    }

    /// Iterates the canonical entries as address ranges with their recipes.
    ///
    /// The last entry always holds the unknown recipe and extends to the end of the address
    /// space.
    pub fn iter(&self) -> impl Iterator<Item = (Range<u64>, &UnwindRecipe)> + '_ {
        self.bases.iter().enumerate().map(move |(entry, &start)| {
            let end = self.bases.get(entry + 1).copied().unwrap_or(u64::MAX);
            let recipe = self
                .index
                .get(entry)
                .and_then(|index| self.recipes.get(index))
                .unwrap_or(&self.unknown);
            (start..end, recipe)
        })
    }
}

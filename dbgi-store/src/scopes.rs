use std::ops::Range;

use dbgi_common::Diagnostics;
use dbgi_dwarf::VariableRecord;

/// The deepest scope nesting level that variables are indexed at.
pub const MAX_SCOPE_LEVEL: u32 = 64;

/// A range of addresses and the variables visible in it at one nesting level.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ScopeNode {
    /// The covered addresses. The last node of a level ends at `u64::MAX`.
    pub range: Range<u64>,
    /// Indexes of the visible variables.
    pub variables: Vec<u32>,
}

/// Variables indexed by address, one partition of the address space per nesting level.
///
/// Level 0 holds globals and is a single node. Every other level splits the address space at the
/// boundaries of its variables' scopes, so each node lists exactly the variables visible in its
/// range.
#[derive(Clone, Debug, Default)]
pub struct ScopeTree {
    levels: Vec<Vec<ScopeNode>>,
}

impl ScopeTree {
    /// Builds the tree from variables with resolved scope ranges.
    ///
    /// Variables nested deeper than [`MAX_SCOPE_LEVEL`] are dropped with a warning.
    pub fn build(variables: &[VariableRecord], diagnostics: &mut Diagnostics) -> Self {
        let depth = variables
            .iter()
            .map(|variable| variable.level)
            .filter(|&level| level <= MAX_SCOPE_LEVEL)
            .max()
            .unwrap_or(0) as usize
            + 1;

        let mut entries: Vec<Vec<(Range<u64>, u32)>> = vec![Vec::new(); depth];
        for (index, variable) in variables.iter().enumerate() {
            if variable.level > MAX_SCOPE_LEVEL {
                diagnostics.warn_once(
                    "scope-level",
                    ".debug_info",
                    format_args!("variables nested deeper than {MAX_SCOPE_LEVEL} scopes"),
                );
                continue;
            }

            let level = &mut entries[variable.level as usize];
            if variable.level == 0 {
                level.push((0..u64::MAX, index as u32));
            } else {
                for range in variable.ranges.iter().filter(|range| !range.is_empty()) {
                    level.push((range.clone(), index as u32));
                }
            }
        }

        let levels = entries.iter().map(|level| partition(level)).collect();
        let tree = ScopeTree { levels };
        tree.check();
        tree
    }

    fn check(&self) {
        for (level, nodes) in self.levels.iter().enumerate() {
            assert_eq!(nodes.first().map(|node| node.range.start), Some(0));
            assert_eq!(nodes.last().map(|node| node.range.end), Some(u64::MAX));
            for pair in nodes.windows(2) {
                assert_eq!(pair[0].range.end, pair[1].range.start, "gap at level {level}");
            }
        }
        if let Some(globals) = self.levels.first() {
            assert_eq!(globals.len(), 1);
        }
    }

    /// The number of levels.
    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    /// The partition of one level.
    pub fn level(&self, level: usize) -> &[ScopeNode] {
        self.levels.get(level).map_or(&[], Vec::as_slice)
    }

    /// Returns the indexes of variables visible at `address` on `level`.
    pub fn lookup(&self, address: u64, level: usize) -> &[u32] {
        let nodes = self.level(level);
        match nodes
            .partition_point(|node| node.range.start <= address)
            .checked_sub(1)
        {
            Some(index) => &nodes[index].variables,
            None => &[],
        }
    }
}

/// Splits the address space at all range boundaries and assigns each variable to the nodes
/// within its ranges. Neighbors with the same variables are merged.
fn partition(entries: &[(Range<u64>, u32)]) -> Vec<ScopeNode> {
    let mut bounds = vec![0];
    for (range, _) in entries {
        bounds.push(range.start);
        if range.end != u64::MAX {
            bounds.push(range.end);
        }
    }
    bounds.sort_unstable();
    bounds.dedup();

    let mut nodes: Vec<ScopeNode> = bounds
        .iter()
        .enumerate()
        .map(|(index, &start)| ScopeNode {
            range: start..bounds.get(index + 1).copied().unwrap_or(u64::MAX),
            variables: Vec::new(),
        })
        .collect();

    for (range, variable) in entries {
        let first = nodes.partition_point(|node| node.range.start < range.start);
        for node in &mut nodes[first..] {
            if node.range.start >= range.end {
                break;
            }
            if node.variables.last() != Some(variable) {
                node.variables.push(*variable);
            }
        }
    }

    let mut merged: Vec<ScopeNode> = Vec::with_capacity(nodes.len());
    for node in nodes {
        match merged.last_mut() {
            Some(last) if last.variables == node.variables => last.range.end = node.range.end,
            _ => merged.push(node),
        }
    }

    merged
}

use std::cmp::{Ordering, Reverse};

use dbgi_common::{StrId, StringPool};
use smallvec::SmallVec;

/// A symbol from the object's symbol tables.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Symbol {
    /// The preferred name of the symbol.
    pub name: StrId,
    /// Other names of symbols at the same address and size, e.g. versioned names.
    pub aliases: SmallVec<[StrId; 1]>,
    /// The start address, with load bias applied.
    pub address: u64,
    /// The size in bytes.
    pub size: u64,
    /// Whether this is a function rather than a data object.
    pub is_text: bool,
    /// Whether this is an indirect function resolved by the dynamic loader.
    pub is_ifunc: bool,
}

impl Symbol {
    /// Creates a symbol without aliases.
    pub fn new(name: StrId, address: u64, size: u64, is_text: bool) -> Self {
        Symbol {
            name,
            aliases: SmallVec::new(),
            address,
            size,
            is_text,
            is_ifunc: false,
        }
    }

    /// The first address after the symbol.
    pub fn end(&self) -> u64 {
        self.address.saturating_add(self.size)
    }

    /// Returns `true` if the symbol covers `address`.
    pub fn contains(&self, address: u64) -> bool {
        address >= self.address && address - self.address < self.size
    }

    fn merge(&mut self, other: Symbol, strings: &StringPool) {
        self.is_ifunc |= other.is_ifunc;

        let mut names = other.aliases;
        names.insert(0, other.name);

        for name in names {
            if name == self.name || self.aliases.contains(&name) {
                continue;
            }

            if compare_names(strings.get(name), strings.get(self.name)) == Ordering::Less {
                let previous = std::mem::replace(&mut self.name, name);
                self.aliases.push(previous);
            } else {
                self.aliases.push(name);
            }
        }
    }
}

/// Orders candidate names of a symbol, better names first.
///
/// Unversioned names beat versioned ones (`foo` over `foo@@VER_1.0`), non-blank names beat blank
/// ones, shorter names beat longer ones, and the remaining ties are broken lexicographically.
pub fn compare_names(a: &str, b: &str) -> Ordering {
    let versioned = |name: &str| name.contains('@');

    versioned(a)
        .cmp(&versioned(b))
        .then_with(|| a.is_empty().cmp(&b.is_empty()))
        .then_with(|| a.len().cmp(&b.len()))
        .then_with(|| a.cmp(b))
}

/// The symbol table of a [`DebugInfo`](crate::DebugInfo).
#[derive(Clone, Debug, Default)]
pub struct SymbolTable {
    symbols: Vec<Symbol>,
    /// The size of the largest symbol, which bounds how far back a lookup scans.
    max_size: u64,
}

impl SymbolTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a symbol. The table must be canonicalized before lookups.
    pub fn push(&mut self, symbol: Symbol) {
        self.symbols.push(symbol);
    }

    /// The number of symbols.
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    /// Returns `true` if there are no symbols.
    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// The symbols, sorted by address after canonicalization.
    pub fn as_slice(&self) -> &[Symbol] {
        &self.symbols
    }

    /// Sorts and deduplicates the table.
    ///
    ///  - Zero-size functions extend to the next symbol. Trailing functions and zero-size data
    ///    objects get size 1.
    ///  - Symbols with the same address, size and kind are merged. The best name according to
    ///    [`compare_names`] becomes the primary name, the others become aliases.
    ///  - Data objects at the address of a function are dropped.
    pub fn canonicalize(&mut self, strings: &StringPool) {
        let mut symbols = std::mem::take(&mut self.symbols);
        let before = symbols.len();

        dmsort::sort_by_key(&mut symbols, |symbol| symbol.address);
        for index in 0..symbols.len() {
            if symbols[index].size != 0 {
                continue;
            }

            let address = symbols[index].address;
            let next = symbols[index + 1..]
                .iter()
                .find(|symbol| symbol.address > address)
                .map(|symbol| symbol.address);

            symbols[index].size = match next {
                Some(next) if symbols[index].is_text => next - address,
                _ => 1,
            };
        }

        dmsort::sort_by_key(&mut symbols, |symbol| {
            (symbol.address, symbol.size, !symbol.is_text)
        });

        let mut merged: Vec<Symbol> = Vec::with_capacity(symbols.len());
        for symbol in symbols {
            match merged.last_mut() {
                Some(last)
                    if last.address == symbol.address
                        && last.size == symbol.size
                        && last.is_text == symbol.is_text =>
                {
                    last.merge(symbol, strings);
                }
                _ => merged.push(symbol),
            }
        }

        let text: Vec<u64> = merged
            .iter()
            .filter(|symbol| symbol.is_text)
            .map(|symbol| symbol.address)
            .collect();
        merged.retain(|symbol| symbol.is_text || text.binary_search(&symbol.address).is_err());

        tracing::debug!(before, after = merged.len(), "canonicalized symbols");
        self.max_size = merged.iter().map(|symbol| symbol.size).max().unwrap_or(0);
        self.symbols = merged;
    }

    /// Finds the symbol covering `address`.
    ///
    /// The symbol starting closest below `address` wins, and the smallest one among symbols
    /// starting at the same address. Symbols enclosing a smaller one that ends before `address`
    /// are found as well.
    pub fn lookup(&self, address: u64) -> Option<&Symbol> {
        let end = self
            .symbols
            .partition_point(|symbol| symbol.address <= address);
        // Symbols starting `max_size` or more below cannot reach `address`.
        let start = self.symbols[..end]
            .partition_point(|symbol| address - symbol.address >= self.max_size);

        self.symbols[start..end]
            .iter()
            .filter(|symbol| symbol.contains(address))
            .min_by_key(|symbol| (Reverse(symbol.address), symbol.size))
    }
}

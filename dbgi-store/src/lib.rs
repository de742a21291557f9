//! The queryable debug information of a loaded object.
//!
//! The central type of this crate is [`DebugInfo`]. It is filled by the decoders of `dbgi-dwarf`
//! and `dbgi-cfi`, usually through [`DebugInfo::load`], which reads an ELF object through an
//! [`Image`](dbgi_common::Image). Once everything has been added, [`DebugInfo::freeze`] brings
//! each table into its canonical form:
//!
//! 1. Symbols
//! 2. Line records
//! 3. Inlined calls
//! 4. Unwind recipes
//! 5. Variable scopes
//!
//! After that, the container is immutable and answers address queries with binary searches.
//!
//! ## Symbols
//!
//! Symbols are sorted by address. Entries at the same address and with the same size are merged
//! into one symbol. The preferred name is kept as [`Symbol::name`], the others become aliases;
//! see [`compare_names`] for the preference. If a function and a data object share an address,
//! the function wins.
//!
//! ## Line Records
//!
//! Line records are sorted by address and truncated where they run into the next record, so the
//! table never overlaps. Records that become empty are dropped.
//!
//! ## Inlined Calls
//!
//! Inlined calls are sorted by address. They nest, so they are never clipped against each other.
//!
//! ## Unwind Recipes
//!
//! The unwind table is compacted into an array of start addresses and a parallel array of recipe
//! indexes of the smallest width that fits. Gaps hold an explicit unknown recipe, so every address
//! resolves to a recipe.
//!
//! ## Variable Scopes
//!
//! For each nesting level, the address space is partitioned into ranges with the same set of
//! visible variables. Level 0 holds the globals and is a single range.
//!
//! # Example
//!
//! ```
//! use dbgi_common::Arch;
//! use dbgi_store::{DebugInfo, Symbol};
//!
//! let mut info = DebugInfo::new(Arch::Amd64);
//! let name = info.pools_mut().strings.intern("main");
//! info.add_symbol(Symbol::new(name, 0x1000, 0x40, true));
//! info.freeze();
//!
//! let symbol = info.lookup_symbol(0x1010).unwrap();
//! assert_eq!(info.pools().strings.get(symbol.name), "main");
//! ```

#![warn(missing_docs)]

mod cfi;
mod container;
mod error;
mod inlines;
mod lines;
mod mappings;
mod object;
mod scopes;
mod symbols;

pub use cfi::*;
pub use container::*;
pub use error::*;
pub use inlines::*;
pub use lines::*;
pub use mappings::*;
pub use object::*;
pub use scopes::*;
pub use symbols::*;

//! `dbgi` is a library to acquire debug information from native objects. It reads DWARF and call
//! frame information from ELF files and turns them into compact, queryable tables that a
//! profiler or debugger can consult for every sampled address.
//!
//! # What's in the package
//!
//! `dbgi` provides the following functionality:
//!
//! - Bounds-checked access to binary images
//!   - Memory mapped files and in-memory buffers
//!   - Images served on demand by a remote byte-range service
//! - DWARF 2 to 4 debug information
//!   - Line tables
//!   - Inlined calls, with names resolved through abstract origins
//!   - Types, deduplicated across compilation units
//!   - Variables with their locations and scopes
//!   - Alternate debug files (`.gnu_debugaltlink`)
//! - Call frame information
//!   - `.eh_frame` and `.debug_frame`
//!   - ARM exception tables (`.ARM.exidx` and `.ARM.extab`)
//!   - Evaluation of unwind recipes against register values
//! - ELF symbol tables, memory mappings, build ids and compressed sections
//!
//! # Usage
//!
//! Add `dbgi` as a dependency to your `Cargo.toml`. The following features are available:
//!
//! - **`store`** (default): The [`DebugInfo`](store::DebugInfo) container, which loads ELF files
//!   and answers address lookups. Implies `cfi` and `dwarf`.
//! - **`dwarf`**: The DWARF decoders, for use without the container.
//! - **`cfi`**: The call frame information interpreter, for use without the container.
//!
//! The [`common`] module is always available.

#![warn(missing_docs)]

#[doc(inline)]
pub use dbgi_common as common;
#[doc(inline)]
#[cfg(feature = "cfi")]
pub use dbgi_cfi as cfi;
#[doc(inline)]
#[cfg(feature = "dwarf")]
pub use dbgi_dwarf as dwarf;
#[doc(inline)]
#[cfg(feature = "store")]
pub use dbgi_store as store;

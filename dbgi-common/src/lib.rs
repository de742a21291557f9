//! Common functionality for `dbgi`.
//!
//! This crate exposes a set of key types:
//!
//!  - [`Image`]: Gives bounds-checked access to a binary image, either in memory, memory mapped
//!    from the file system, or fetched on demand from a remote [`RangeSource`].
//!  - [`Cursor`]: A cheap, copyable reader over a [`Section`] of an image. Every decoder in `dbgi`
//!    is built from its "step" reads.
//!  - [`StringPool`], [`FilePool`] and [`Pool`]: Append-only, content-addressed storage that hands
//!    out small stable indexes.
//!  - [`Diagnostics`]: The per-object list of recoverable problems found while decoding.
//!  - [`CpuFamily`] and [`Arch`]: Architecture information including DWARF register numbers.
//!
//! This module is part of the `dbgi` crate.

#![warn(missing_docs)]

mod cursor;
mod diagnostics;
mod image;
mod pool;
mod types;

pub use crate::cursor::*;
pub use crate::diagnostics::*;
pub use crate::image::*;
pub use crate::pool::*;
pub use crate::types::*;

pub use scroll::Endian;

use std::fmt;

use dbgi_common::ImageError;
use thiserror::Error;

/// The part of an object file that could not be read.
#[doc(hidden)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ObjectPart {
    Header,
    ProgramHeaders,
    SectionHeaders,
    SectionNames,
    Section(&'static str),
}

impl fmt::Display for ObjectPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ObjectPart::Header => write!(f, "ELF header"),
            ObjectPart::ProgramHeaders => write!(f, "program headers"),
            ObjectPart::SectionHeaders => write!(f, "section headers"),
            ObjectPart::SectionNames => write!(f, "section name table"),
            ObjectPart::Section(name) => write!(f, "section {name}"),
        }
    }
}

/// An error returned when loading a [`DebugInfo`](crate::DebugInfo).
///
/// Only problems that leave nothing to load are errors. Broken debug information is reported as a
/// [`Diagnostic`](dbgi_common::Diagnostic) on the container instead.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum StoreError {
    /// The image does not start with an ELF header.
    #[error("not an ELF file")]
    NotElf,

    /// Reading from the image failed.
    #[error("failed to read {0}")]
    Image(ObjectPart, #[source] ImageError),

    /// A structure of the object file is malformed.
    #[error("malformed {0}")]
    Malformed(ObjectPart, #[source] goblin::error::Error),

    /// A compressed section uses an unsupported scheme or its data is corrupt.
    #[error("cannot decompress {0}")]
    Compression(ObjectPart),
}

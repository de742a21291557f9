//! Recoverable problems found while decoding an object.

use std::collections::HashSet;
use std::fmt;

/// How severe a [`Diagnostic`] is.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Severity {
    /// Some entries were dropped or degraded, the rest of the section loaded fine.
    Warning,
    /// A whole unit, sequence or entry could not be decoded.
    Error,
}

/// A single problem attributed to a section of the object.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Diagnostic {
    /// The severity of the problem.
    pub severity: Severity,
    /// The section the problem was found in, for instance `".debug_info"`.
    pub section: &'static str,
    /// The offset within the section, if known.
    pub offset: Option<u64>,
    /// A human readable description.
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let severity = match self.severity {
            Severity::Warning => "warning",
            Severity::Error => "error",
        };

        write!(f, "{severity}: {}", self.section)?;
        if let Some(offset) = self.offset {
            write!(f, "+{offset:#x}")?;
        }
        write!(f, ": {}", self.message)
    }
}

/// The list of diagnostics collected for one object.
///
/// Every entry is also emitted as a `tracing` event. One-time warnings are keyed by a static string
/// and only recorded the first time they are raised.
#[derive(Clone, Debug, Default)]
pub struct Diagnostics {
    items: Vec<Diagnostic>,
    once: HashSet<&'static str>,
}

impl Diagnostics {
    /// Creates an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, diagnostic: Diagnostic) {
        match diagnostic.severity {
            Severity::Warning => tracing::warn!(
                section = diagnostic.section,
                offset = diagnostic.offset,
                "{}",
                diagnostic.message
            ),
            Severity::Error => tracing::error!(
                section = diagnostic.section,
                offset = diagnostic.offset,
                "{}",
                diagnostic.message
            ),
        }
        self.items.push(diagnostic);
    }

    /// Records a warning.
    pub fn warn(&mut self, section: &'static str, offset: Option<u64>, message: impl fmt::Display) {
        self.push(Diagnostic {
            severity: Severity::Warning,
            section,
            offset,
            message: message.to_string(),
        });
    }

    /// Records an error.
    pub fn error(&mut self, section: &'static str, offset: Option<u64>, message: impl fmt::Display) {
        self.push(Diagnostic {
            severity: Severity::Error,
            section,
            offset,
            message: message.to_string(),
        });
    }

    /// Records a warning only the first time `key` is raised.
    pub fn warn_once(&mut self, key: &'static str, section: &'static str, message: impl fmt::Display) {
        if self.once.insert(key) {
            self.warn(section, None, message);
        }
    }

    /// Returns `true` if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// The number of recorded diagnostics.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Iterates recorded diagnostics in the order they were raised.
    pub fn iter(&self) -> std::slice::Iter<'_, Diagnostic> {
        self.items.iter()
    }

    /// Returns `true` if any diagnostic was raised with error severity.
    pub fn has_errors(&self) -> bool {
        self.items.iter().any(|d| d.severity == Severity::Error)
    }

    /// Appends all diagnostics of another list.
    pub fn extend(&mut self, other: Diagnostics) {
        self.items.extend(other.items);
        self.once.extend(other.once);
    }
}

impl<'a> IntoIterator for &'a Diagnostics {
    type Item = &'a Diagnostic;
    type IntoIter = std::slice::Iter<'a, Diagnostic>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

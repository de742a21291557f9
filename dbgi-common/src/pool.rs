//! Append-only, content-addressed storage.
//!
//! Pools hand out small, stable indexes for the values inserted into them. Inserting a value that
//! is already present returns the existing index, so downstream code can compare indexes instead
//! of values.

use std::borrow::Cow;
use std::fmt;
use std::hash::Hash;

use indexmap::IndexSet;

/// An index into a [`StringPool`].
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct StrId(u32);

impl StrId {
    /// The index of the empty string, which is present in every pool.
    pub const EMPTY: StrId = StrId(0);

    /// The raw index.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Deduplicated storage for strings.
#[derive(Clone, Debug)]
pub struct StringPool {
    strings: IndexSet<Box<str>>,
}

impl StringPool {
    /// Creates a pool containing only the empty string.
    pub fn new() -> Self {
        let mut strings = IndexSet::new();
        strings.insert(Box::from(""));
        StringPool { strings }
    }

    /// Inserts a string and returns its index.
    pub fn intern(&mut self, string: &str) -> StrId {
        if let Some(index) = self.strings.get_index_of(string) {
            return StrId(index as u32);
        }

        let (index, _) = self.strings.insert_full(Box::from(string));
        StrId(index as u32)
    }

    /// Inserts raw bytes from a string section, replacing invalid UTF-8 sequences.
    pub fn intern_bytes(&mut self, bytes: &[u8]) -> StrId {
        match String::from_utf8_lossy(bytes) {
            Cow::Borrowed(string) => self.intern(string),
            Cow::Owned(string) => self.intern(&string),
        }
    }

    /// Looks up the index of an already interned string.
    pub fn find(&self, string: &str) -> Option<StrId> {
        self.strings.get_index_of(string).map(|i| StrId(i as u32))
    }

    /// Resolves an index. Unknown indexes resolve to the empty string.
    pub fn get(&self, id: StrId) -> &str {
        self.strings
            .get_index(id.index())
            .map(|s| &**s)
            .unwrap_or_default()
    }

    /// The number of distinct strings, including the empty string.
    pub fn len(&self) -> usize {
        self.strings.len()
    }

    /// Returns `true` if the pool holds nothing but the empty string.
    pub fn is_empty(&self) -> bool {
        self.strings.len() <= 1
    }
}

impl Default for StringPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Deduplicated storage for arbitrary hashable records.
#[derive(Clone)]
pub struct Pool<T> {
    items: IndexSet<T>,
}

impl<T: Hash + Eq> Pool<T> {
    /// Creates an empty pool.
    pub fn new() -> Self {
        Pool {
            items: IndexSet::new(),
        }
    }

    /// Inserts a record and returns its index.
    pub fn insert(&mut self, item: T) -> u32 {
        let (index, _) = self.items.insert_full(item);
        index as u32
    }

    /// Returns the index of a record, if it has been inserted before.
    pub fn find(&self, item: &T) -> Option<u32> {
        self.items.get_index_of(item).map(|i| i as u32)
    }

    /// Resolves an index.
    pub fn get(&self, index: u32) -> Option<&T> {
        self.items.get_index(index as usize)
    }

    /// The number of distinct records.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns `true` if nothing was inserted.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Iterates all records in insertion order.
    pub fn iter(&self) -> impl ExactSizeIterator<Item = &T> + '_ {
        self.items.iter()
    }
}

impl<T: Hash + Eq> Default for Pool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.items.iter()).finish()
    }
}

/// An index into a [`FilePool`].
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct FileId(u32);

impl FileId {
    /// A file with no name, used when the file of a record is not known.
    pub const UNKNOWN: FileId = FileId(0);

    /// The raw index.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A source file name split into its name and directory.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct FileName {
    /// The file name, possibly containing path components.
    pub name: StrId,
    /// The directory the name is relative to.
    pub dir: StrId,
}

/// Deduplicated storage for (file name, directory) pairs.
#[derive(Clone, Debug)]
pub struct FilePool {
    files: Pool<FileName>,
}

impl FilePool {
    /// Creates a pool containing only [`FileId::UNKNOWN`].
    pub fn new() -> Self {
        let mut files = Pool::new();
        files.insert(FileName::default());
        FilePool { files }
    }

    /// Inserts a file name and returns its index.
    pub fn insert(&mut self, file: FileName) -> FileId {
        FileId(self.files.insert(file))
    }

    /// Resolves an index.
    pub fn get(&self, id: FileId) -> FileName {
        self.files.get(id.0).copied().unwrap_or_default()
    }

    /// The number of distinct files, including the unknown file.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Returns `true` if the pool holds nothing but the unknown file.
    pub fn is_empty(&self) -> bool {
        self.files.len() <= 1
    }
}

impl Default for FilePool {
    fn default() -> Self {
        Self::new()
    }
}

/// The string and file pools shared by all tables of one object.
#[derive(Clone, Debug, Default)]
pub struct Pools {
    /// Names of symbols, functions, types and variables, as well as path components.
    pub strings: StringPool,
    /// Source files referenced by line and inline records.
    pub files: FilePool,
}

impl Pools {
    /// Creates empty pools.
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns a file given as raw name and directory bytes.
    pub fn intern_file(&mut self, name: &[u8], dir: &[u8]) -> FileId {
        let name = self.strings.intern_bytes(name);
        let dir = self.strings.intern_bytes(dir);
        self.files.insert(FileName { name, dir })
    }

    /// Resolves a file into its name and directory strings.
    pub fn file(&self, id: FileId) -> (&str, &str) {
        let file = self.files.get(id);
        (self.strings.get(file.name), self.strings.get(file.dir))
    }

    /// Returns the full path of a file.
    ///
    /// Absolute names are returned verbatim, relative names are joined with their directory.
    pub fn file_path(&self, id: FileId) -> String {
        let (name, dir) = self.file(id);
        if dir.is_empty() || name.starts_with('/') {
            name.to_owned()
        } else if dir.ends_with('/') {
            format!("{dir}{name}")
        } else {
            format!("{dir}/{name}")
        }
    }
}

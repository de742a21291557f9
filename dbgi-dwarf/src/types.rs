use std::collections::HashMap;
use std::fmt::{self, Write as _};

use dbgi_common::{StrId, StringPool};

/// Identifies a type entity by where it was declared.
///
/// Keys of entries in `.debug_info` are their section offsets. Entries in `.debug_types` and
/// references by type signature live in separate key spaces above that.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TypeKey(u64);

const TYPES_SPACE: u64 = 1 << 60;
const SIGNATURE_SPACE: u64 = 2 << 60;
const SPACE_MASK: u64 = TYPES_SPACE - 1;

impl TypeKey {
    /// The `void` type, which has no entry of its own.
    pub const VOID: TypeKey = TypeKey(u64::MAX - 1);
    /// A type that could not be resolved.
    pub const UNKNOWN: TypeKey = TypeKey(u64::MAX);

    /// The key of an entry in `.debug_info`.
    pub fn info(offset: u64) -> Self {
        TypeKey(offset & SPACE_MASK)
    }

    /// The key of an entry in `.debug_types`.
    pub fn types(offset: u64) -> Self {
        TypeKey(TYPES_SPACE | (offset & SPACE_MASK))
    }

    /// The key of the `index`-th type signature referenced during a walk.
    pub fn signature(index: u64) -> Self {
        TypeKey(SIGNATURE_SPACE | (index & SPACE_MASK))
    }

    /// The raw value of the key.
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            TypeKey::VOID => f.write_str("void"),
            TypeKey::UNKNOWN => f.write_str("unknown"),
            TypeKey(value) => write!(f, "<{value:#x}>"),
        }
    }
}

/// The flavor of a pointer type.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum PointerKind {
    /// `T*`
    Pointer,
    /// `T&`
    Reference,
    /// `T&&`
    RvalueReference,
    /// A pointer to a member of a class.
    Member,
}

/// The flavor of an aggregate type.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum CompositeKind {
    /// `struct`
    Struct,
    /// `class`
    Class,
    /// `union`
    Union,
}

/// A type qualifier.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Qualifier {
    /// `const`
    Const,
    /// `volatile`
    Volatile,
    /// `restrict`
    Restrict,
    /// `_Atomic`
    Atomic,
}

/// A type entity.
///
/// Entities refer to each other by [`TypeKey`]. Names are interned in the object's string pool.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum TypeKind {
    /// A primitive type.
    Base {
        /// The name, such as `int`.
        name: StrId,
        /// Size in bytes.
        size: u64,
        /// The `DW_ATE_*` encoding.
        encoding: u8,
    },
    /// A pointer or reference.
    Pointer {
        /// Pointer or reference flavor.
        kind: PointerKind,
        /// Size in bytes, 0 if not given.
        size: u64,
        /// The pointee.
        target: TypeKey,
    },
    /// A struct, class or union.
    Struct {
        /// The tag name, empty for anonymous aggregates.
        name: StrId,
        /// Size in bytes.
        size: u64,
        /// Struct, class or union.
        kind: CompositeKind,
        /// `false` for declarations without members.
        complete: bool,
        /// The [`TypeKind::Field`] entities in declaration order.
        fields: Vec<TypeKey>,
    },
    /// An enumeration.
    Enum {
        /// The tag name.
        name: StrId,
        /// Size in bytes.
        size: u64,
        /// The [`TypeKind::Enumerator`] entities in declaration order.
        enumerators: Vec<TypeKey>,
    },
    /// One named value of an enumeration.
    Enumerator {
        /// The name.
        name: StrId,
        /// The value.
        value: i64,
    },
    /// An array.
    Array {
        /// The element type.
        element: TypeKey,
        /// The [`TypeKind::Bound`] entities, one per dimension.
        bounds: Vec<TypeKey>,
    },
    /// The index range of one array dimension.
    Bound {
        /// The lowest index.
        lower: i64,
        /// The highest index, `None` for flexible arrays.
        upper: Option<i64>,
    },
    /// A type alias.
    Typedef {
        /// The alias name.
        name: StrId,
        /// The aliased type.
        target: TypeKey,
    },
    /// A qualified type.
    Qualifier {
        /// The qualifier.
        qual: Qualifier,
        /// The qualified type.
        target: TypeKey,
    },
    /// A function signature.
    Function {
        /// The return type.
        ret: TypeKey,
        /// The parameter types.
        params: Vec<TypeKey>,
        /// Whether further arguments may follow.
        variadic: bool,
    },
    /// A member of an aggregate.
    Field {
        /// The member name, empty for anonymous members.
        name: StrId,
        /// The member type.
        target: TypeKey,
        /// Offset in bytes, `None` if given by an expression or a bit field.
        offset: Option<u64>,
    },
    /// The `void` type.
    Void,
    /// This entity has been merged into or stands for another entity.
    Forward(TypeKey),
}

impl TypeKind {
    fn for_each_ref_mut(&mut self, mut f: impl FnMut(&mut TypeKey)) {
        match self {
            TypeKind::Pointer { target, .. }
            | TypeKind::Typedef { target, .. }
            | TypeKind::Qualifier { target, .. }
            | TypeKind::Field { target, .. }
            | TypeKind::Forward(target) => f(target),
            TypeKind::Struct { fields, .. } => fields.iter_mut().for_each(f),
            TypeKind::Enum { enumerators, .. } => enumerators.iter_mut().for_each(f),
            TypeKind::Array { element, bounds } => {
                f(element);
                bounds.iter_mut().for_each(f);
            }
            TypeKind::Function { ret, params, .. } => {
                f(ret);
                params.iter_mut().for_each(f);
            }
            TypeKind::Base { .. }
            | TypeKind::Enumerator { .. }
            | TypeKind::Bound { .. }
            | TypeKind::Void => {}
        }
    }
}

/// A type entity with its key.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TypeEntity {
    /// The key other entities refer to this one by.
    pub key: TypeKey,
    /// The entity.
    pub kind: TypeKind,
}

/// Tuning for [`TypeArena::dedup_with`].
#[derive(Clone, Copy, Debug)]
pub struct DedupOptions {
    /// Passes stop once a pass changes at most `entities / threshold_divisor` entities.
    pub threshold_divisor: usize,
    /// An upper bound on the number of passes.
    pub max_passes: usize,
}

impl Default for DedupOptions {
    fn default() -> Self {
        DedupOptions {
            threshold_divisor: 1024,
            max_passes: 64,
        }
    }
}

/// Counters of a deduplication run.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DedupStats {
    /// The number of passes run.
    pub passes: usize,
    /// Entities turned into forwarding markers.
    pub collapses: usize,
    /// References redirected through forwarding markers.
    pub rewrites: usize,
}

/// The longest chain of forwarding markers that is followed.
const MAX_FORWARD_CHAIN: usize = 64;

/// The type entities of one object.
#[derive(Clone, Debug)]
pub struct TypeArena {
    entities: Vec<TypeEntity>,
    sorted: bool,
    forwards: HashMap<TypeKey, TypeKey>,
}

impl Default for TypeArena {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeArena {
    /// Creates an arena holding only `void`.
    pub fn new() -> Self {
        TypeArena {
            entities: vec![TypeEntity {
                key: TypeKey::VOID,
                kind: TypeKind::Void,
            }],
            sorted: true,
            forwards: HashMap::new(),
        }
    }

    /// Adds an entity and returns its position, valid until the arena is sorted.
    pub fn push(&mut self, key: TypeKey, kind: TypeKind) -> usize {
        if self.entities.last().map_or(false, |last| last.key >= key) {
            self.sorted = false;
        }
        self.entities.push(TypeEntity { key, kind });
        self.entities.len() - 1
    }

    /// Returns the entity at a position returned by [`push`](Self::push).
    pub fn at_mut(&mut self, index: usize) -> Option<&mut TypeKind> {
        self.entities.get_mut(index).map(|entity| &mut entity.kind)
    }

    /// The number of entities, including forwarding markers.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Returns `true` if the arena holds nothing but `void`.
    pub fn is_empty(&self) -> bool {
        self.entities.len() <= 1
    }

    /// Iterates all entities.
    pub fn iter(&self) -> std::slice::Iter<'_, TypeEntity> {
        self.entities.iter()
    }

    /// Sorts entities by key. Of two entities with the same key, the first one added is kept.
    pub fn sort(&mut self) {
        if self.sorted {
            return;
        }
        dmsort::sort_by_key(&mut self.entities, |entity| entity.key);
        self.entities.dedup_by_key(|entity| entity.key);
        self.sorted = true;
    }

    fn position(&self, key: TypeKey) -> Option<usize> {
        if self.sorted {
            self.entities.binary_search_by_key(&key, |e| e.key).ok()
        } else {
            self.entities.iter().position(|e| e.key == key)
        }
    }

    /// Returns the entity with the given key.
    pub fn get(&self, key: TypeKey) -> Option<&TypeKind> {
        self.position(key).map(|index| &self.entities[index].kind)
    }

    /// Deduplicates structurally identical entities with default options.
    pub fn dedup(&mut self) -> DedupStats {
        self.dedup_with(DedupOptions::default())
    }

    /// Deduplicates structurally identical entities.
    ///
    /// Each pass first collapses every entity that equals an entity with a smaller key into a
    /// forwarding marker, then redirects all references through the markers. Passes repeat until a
    /// pass changes at most `len / threshold_divisor` entities.
    pub fn dedup_with(&mut self, options: DedupOptions) -> DedupStats {
        let span = tracing::trace_span!("dedup_types", entities = self.entities.len());
        let _guard = span.enter();

        self.sort();
        let threshold = self.entities.len() / options.threshold_divisor.max(1);
        let mut stats = DedupStats::default();

        while stats.passes < options.max_passes {
            stats.passes += 1;
            let collapses = self.collapse();
            let rewrites = self.rewrite();
            stats.collapses += collapses;
            stats.rewrites += rewrites;

            tracing::trace!(pass = stats.passes, collapses, rewrites);
            if collapses + rewrites <= threshold {
                break;
            }
        }

        stats
    }

    fn collapse(&mut self) -> usize {
        let mut merges = Vec::new();
        {
            let mut canonical: HashMap<&TypeKind, TypeKey> = HashMap::new();
            for (index, entity) in self.entities.iter().enumerate() {
                if matches!(entity.kind, TypeKind::Forward(_)) {
                    continue;
                }
                match canonical.get(&entity.kind) {
                    Some(&target) => merges.push((index, target)),
                    None => {
                        canonical.insert(&entity.kind, entity.key);
                    }
                }
            }
        }

        for &(index, target) in &merges {
            let entity = &mut self.entities[index];
            entity.kind = TypeKind::Forward(target);
            self.forwards.insert(entity.key, target);
        }

        merges.len()
    }

    fn rewrite(&mut self) -> usize {
        let forwards = &self.forwards;
        let mut rewrites = 0;
        for entity in &mut self.entities {
            entity.kind.for_each_ref_mut(|key| {
                let resolved = chase(forwards, *key);
                if resolved != *key {
                    *key = resolved;
                    rewrites += 1;
                }
            });
        }

        // Keep the forwarding map compressed so later lookups take one step.
        let keys: Vec<_> = self.forwards.keys().copied().collect();
        for key in keys {
            let resolved = chase(&self.forwards, key);
            self.forwards.insert(key, resolved);
        }

        rewrites
    }

    /// Removes all forwarding markers.
    ///
    /// References to markers are redirected to the entity they stand for. References to keys with
    /// no entity become [`TypeKey::UNKNOWN`]. The forwarding map is kept for [`resolve`](Self::resolve).
    pub fn compact(&mut self) {
        self.sort();
        for entity in &self.entities {
            if let TypeKind::Forward(target) = entity.kind {
                self.forwards.insert(entity.key, target);
            }
        }
        let keys: Vec<_> = self.forwards.keys().copied().collect();
        for key in keys {
            let resolved = chase(&self.forwards, key);
            self.forwards.insert(key, resolved);
        }

        self.entities
            .retain(|entity| !matches!(entity.kind, TypeKind::Forward(_)));

        let live: Vec<TypeKey> = self.entities.iter().map(|entity| entity.key).collect();
        let forwards = &self.forwards;
        for entity in &mut self.entities {
            entity.kind.for_each_ref_mut(|key| {
                let resolved = chase(forwards, *key);
                *key = if live.binary_search(&resolved).is_ok() {
                    resolved
                } else {
                    TypeKey::UNKNOWN
                };
            });
        }
    }

    /// Maps a key to the entity it stands for after deduplication.
    ///
    /// Returns [`TypeKey::UNKNOWN`] if the key has no entity.
    pub fn resolve(&self, key: TypeKey) -> TypeKey {
        let resolved = chase(&self.forwards, key);
        match resolved {
            TypeKey::VOID | TypeKey::UNKNOWN => resolved,
            _ => match self.get(resolved) {
                Some(TypeKind::Forward(target)) => chase(&self.forwards, *target),
                Some(_) => resolved,
                None => TypeKey::UNKNOWN,
            },
        }
    }

    /// Renders a type as a C-like declaration, for instance `const char*`.
    pub fn describe(&self, key: TypeKey, strings: &StringPool) -> String {
        let mut out = String::new();
        self.describe_into(self.resolve(key), strings, 0, &mut out);
        out
    }

    fn describe_into(&self, key: TypeKey, strings: &StringPool, depth: usize, out: &mut String) {
        const MAX_DEPTH: usize = 16;
        if depth > MAX_DEPTH {
            out.push_str("...");
            return;
        }

        let name_or = |name: StrId, fallback: &'static str| match strings.get(name) {
            "" => fallback,
            name => name,
        };

        match self.get(key) {
            None if key == TypeKey::UNKNOWN => out.push_str("<unknown>"),
            None => out.push_str("<unresolved>"),
            Some(TypeKind::Void) => out.push_str("void"),
            Some(TypeKind::Base { name, .. }) => out.push_str(name_or(*name, "<base>")),
            Some(TypeKind::Pointer { kind, target, .. }) => {
                self.describe_into(*target, strings, depth + 1, out);
                out.push_str(match kind {
                    PointerKind::Pointer => "*",
                    PointerKind::Reference => "&",
                    PointerKind::RvalueReference => "&&",
                    PointerKind::Member => "::*",
                });
            }
            Some(TypeKind::Struct { name, kind, .. }) => {
                out.push_str(match kind {
                    CompositeKind::Struct => "struct ",
                    CompositeKind::Class => "class ",
                    CompositeKind::Union => "union ",
                });
                out.push_str(name_or(*name, "<anonymous>"));
            }
            Some(TypeKind::Enum { name, .. }) => {
                out.push_str("enum ");
                out.push_str(name_or(*name, "<anonymous>"));
            }
            Some(TypeKind::Typedef { name, .. }) => out.push_str(name_or(*name, "<typedef>")),
            Some(TypeKind::Qualifier { qual, target }) => {
                out.push_str(match qual {
                    Qualifier::Const => "const ",
                    Qualifier::Volatile => "volatile ",
                    Qualifier::Restrict => "restrict ",
                    Qualifier::Atomic => "_Atomic ",
                });
                self.describe_into(*target, strings, depth + 1, out);
            }
            Some(TypeKind::Array { element, bounds }) => {
                self.describe_into(*element, strings, depth + 1, out);
                for bound in bounds {
                    let count = match self.get(*bound) {
                        Some(TypeKind::Bound {
                            lower,
                            upper: Some(upper),
                        }) => upper.checked_sub(*lower).and_then(|n| n.checked_add(1)),
                        _ => None,
                    };
                    match count {
                        Some(count) => {
                            let _ = write!(out, "[{count}]");
                        }
                        None => out.push_str("[]"),
                    }
                }
            }
            Some(TypeKind::Function {
                ret,
                params,
                variadic,
            }) => {
                self.describe_into(*ret, strings, depth + 1, out);
                out.push('(');
                for (index, param) in params.iter().enumerate() {
                    if index > 0 {
                        out.push_str(", ");
                    }
                    self.describe_into(*param, strings, depth + 1, out);
                }
                if *variadic {
                    out.push_str(if params.is_empty() { "..." } else { ", ..." });
                }
                out.push(')');
            }
            Some(TypeKind::Field { name, .. }) | Some(TypeKind::Enumerator { name, .. }) => {
                out.push_str(strings.get(*name));
            }
            Some(TypeKind::Bound { .. }) => out.push_str("<bound>"),
            Some(TypeKind::Forward(target)) => {
                self.describe_into(*target, strings, depth + 1, out)
            }
        }
    }
}

/// Follows forwarding markers from `key` to the entity they end at.
fn chase(forwards: &HashMap<TypeKey, TypeKey>, mut key: TypeKey) -> TypeKey {
    for _ in 0..MAX_FORWARD_CHAIN {
        match forwards.get(&key) {
            Some(&next) if next != key => key = next,
            _ => break,
        }
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    use similar_asserts::assert_eq;

    /// Adds `struct point { int x; }` with all entities starting at `base`.
    fn add_point(arena: &mut TypeArena, strings: &mut StringPool, base: u64) -> TypeKey {
        let int = TypeKey::info(base);
        let field = TypeKey::info(base + 0x10);
        let point = TypeKey::info(base + 0x20);
        let pointer = TypeKey::info(base + 0x30);

        arena.push(
            int,
            TypeKind::Base {
                name: strings.intern("int"),
                size: 4,
                encoding: 5,
            },
        );
        arena.push(
            field,
            TypeKind::Field {
                name: strings.intern("x"),
                target: int,
                offset: Some(0),
            },
        );
        arena.push(
            point,
            TypeKind::Struct {
                name: strings.intern("point"),
                size: 4,
                kind: CompositeKind::Struct,
                complete: true,
                fields: vec![field],
            },
        );
        arena.push(
            pointer,
            TypeKind::Pointer {
                kind: PointerKind::Pointer,
                size: 8,
                target: point,
            },
        );

        pointer
    }

    #[test]
    fn test_dedup_across_units() {
        let mut strings = StringPool::new();
        let mut arena = TypeArena::new();
        let first = add_point(&mut arena, &mut strings, 0x100);
        let second = add_point(&mut arena, &mut strings, 0x800);

        let stats = arena.dedup();
        assert_eq!(stats.collapses, 4);
        assert_eq!(arena.resolve(second), first);
        assert_eq!(arena.resolve(TypeKey::info(0x820)), TypeKey::info(0x120));

        let again = arena.dedup();
        assert_eq!((again.collapses, again.rewrites), (0, 0));

        arena.compact();
        assert_eq!(arena.len(), 5);
        assert_eq!(arena.resolve(second), first);
        assert_eq!(arena.describe(second, &strings), "struct point*");
    }

    #[test]
    fn test_unsorted_insertion() {
        let mut strings = StringPool::new();
        let mut arena = TypeArena::new();
        add_point(&mut arena, &mut strings, 0x800);
        add_point(&mut arena, &mut strings, 0x100);

        arena.dedup();
        arena.compact();

        // The entities with the smaller keys survive.
        let keys: Vec<_> = arena.iter().map(|e| e.key).collect();
        assert_eq!(
            keys,
            [
                TypeKey::info(0x100),
                TypeKey::info(0x110),
                TypeKey::info(0x120),
                TypeKey::info(0x130),
                TypeKey::VOID,
            ]
        );
    }

    #[test]
    fn test_dangling_references() {
        let mut strings = StringPool::new();
        let mut arena = TypeArena::new();
        let typedef = TypeKey::info(0x40);
        arena.push(
            typedef,
            TypeKind::Typedef {
                name: strings.intern("handle"),
                target: TypeKey::info(0x9999),
            },
        );
        arena.push(TypeKey::signature(0), TypeKind::Forward(typedef));
        arena.push(TypeKey::signature(1), TypeKind::Forward(TypeKey::UNKNOWN));

        arena.dedup();
        arena.compact();

        assert_eq!(
            arena.get(typedef),
            Some(&TypeKind::Typedef {
                name: strings.intern("handle"),
                target: TypeKey::UNKNOWN,
            })
        );
        assert_eq!(arena.resolve(TypeKey::signature(0)), typedef);
        assert_eq!(arena.resolve(TypeKey::signature(1)), TypeKey::UNKNOWN);
        assert_eq!(arena.resolve(TypeKey::info(0x1234)), TypeKey::UNKNOWN);
    }

    #[test]
    fn test_describe() {
        let mut strings = StringPool::new();
        let mut arena = TypeArena::new();
        let char_ = TypeKey::info(1);
        let konst = TypeKey::info(2);
        let pointer = TypeKey::info(3);
        let bound = TypeKey::info(4);
        let array = TypeKey::info(5);
        let function = TypeKey::info(6);

        arena.push(
            char_,
            TypeKind::Base {
                name: strings.intern("char"),
                size: 1,
                encoding: 6,
            },
        );
        arena.push(
            konst,
            TypeKind::Qualifier {
                qual: Qualifier::Const,
                target: char_,
            },
        );
        arena.push(
            pointer,
            TypeKind::Pointer {
                kind: PointerKind::Pointer,
                size: 8,
                target: konst,
            },
        );
        arena.push(
            bound,
            TypeKind::Bound {
                lower: 0,
                upper: Some(15),
            },
        );
        arena.push(
            array,
            TypeKind::Array {
                element: char_,
                bounds: vec![bound],
            },
        );
        arena.push(
            function,
            TypeKind::Function {
                ret: TypeKey::VOID,
                params: vec![pointer],
                variadic: true,
            },
        );

        assert_eq!(arena.describe(pointer, &strings), "const char*");
        assert_eq!(arena.describe(array, &strings), "char[16]");
        assert_eq!(arena.describe(function, &strings), "void(const char*, ...)");
        assert_eq!(arena.describe(TypeKey::UNKNOWN, &strings), "<unknown>");
    }
}

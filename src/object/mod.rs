//! Polymorphic Value Objects
//!
//! Every value stored in the keyspace is wrapped in an [`Object`]: a small
//! fixed-shape header carrying the logical kind of the value, the physical
//! encoding chosen for it, a reference count, 24 bits of eviction metadata
//! and the payload itself.
//!
//! ## Kinds and Encodings
//!
//! A logical kind can be represented by more than one physical encoding,
//! picked adaptively to minimize memory:
//!
//! | kind       | encodings              |
//! |------------|------------------------|
//! | string     | raw, int, embstr       |
//! | list       | quicklist, ziplist     |
//! | set        | hashtable, intset      |
//! | hash       | hashtable, ziplist     |
//! | zset       | skiplist, ziplist      |
//! | module     | module                 |
//!
//! The payload is a single closed enum with one variant per legal
//! (kind, encoding) pair, so an illegal combination cannot be constructed
//! and the free path needs no fallible dispatch. The enum is flat rather
//! than nested per kind to keep the discriminant to one byte: the whole
//! header, including an embedded short string, must stay within a 64-byte
//! allocator slab.
//!
//! ## Reference Counting
//!
//! Values are handled as `Arc<Object>`, and the header carries an explicit
//! logical refcount on top: it is what `OBJECT REFCOUNT` reports, and the
//! sentinel [`SHARED_REFCOUNT`] marks immortal singletons that every
//! mutation path must leave alone. The `Arc` supplies the actual
//! deallocation; payload disposal is the payload's `Drop`.
//!
//! ## Submodules
//!
//! - [`string`]: string construction, adaptive re-encoding, coercions
//! - [`shared`]: the immortal shared-singleton registry
//! - [`size`]: the sampling per-value memory estimator

pub mod shared;
pub mod size;
pub mod string;

use std::any::Any;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use crate::ds::{Dict, DynStr, IntSet, QuickList, SkipList, ZipList};
use crate::eviction;

/// Longest string stored inline in the header allocation.
///
/// Chosen so header plus string metadata plus bytes fill a 64-byte slab.
pub const EMBSTR_LIMIT: usize = 44;

/// The shared-singleton registry holds one immortal value for every
/// integer in `[0, SHARED_INT_LIMIT)`.
pub const SHARED_INT_LIMIT: i64 = 10_000;

/// Sentinel refcount of immortal values. `incr_ref` and `decr_ref` do not
/// touch objects carrying it, so they are freely aliasable across threads.
pub const SHARED_REFCOUNT: u32 = i32::MAX as u32;

/// A handle to a value object.
pub type Obj = Arc<Object>;

/// Logical kind of a stored value, as reported by `TYPE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjKind {
    String,
    List,
    Set,
    Hash,
    SortedSet,
    Module,
}

impl ObjKind {
    pub fn name(&self) -> &'static str {
        match self {
            ObjKind::String => "string",
            ObjKind::List => "list",
            ObjKind::Set => "set",
            ObjKind::Hash => "hash",
            ObjKind::SortedSet => "zset",
            ObjKind::Module => "module",
        }
    }
}

/// Physical encoding of a stored value, as reported by `OBJECT ENCODING`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjEncoding {
    Raw,
    Int,
    EmbStr,
    Table,
    QuickList,
    ZipList,
    IntSet,
    SkipList,
    Module,
}

impl ObjEncoding {
    /// The user-visible encoding name. These spellings are part of the
    /// wire contract.
    pub fn name(&self) -> &'static str {
        match self {
            ObjEncoding::Raw => "raw",
            ObjEncoding::Int => "int",
            ObjEncoding::EmbStr => "embstr",
            ObjEncoding::Table => "hashtable",
            ObjEncoding::QuickList => "quicklist",
            ObjEncoding::ZipList => "ziplist",
            ObjEncoding::IntSet => "intset",
            ObjEncoding::SkipList => "skiplist",
            ObjEncoding::Module => "module",
        }
    }
}

// ============================================================================
// Payload variants
// ============================================================================

/// A short string embedded directly in the header allocation.
///
/// The bytes are immutable for the life of the header; growing the string
/// always re-encodes to raw first.
#[derive(Clone)]
pub struct EmbStr {
    len: u8,
    buf: [u8; EMBSTR_LIMIT],
}

impl EmbStr {
    /// Builds an embedded string from `bytes`, or zero-filled when `None`.
    /// Callers guarantee `len <= EMBSTR_LIMIT`.
    pub fn new(bytes: Option<&[u8]>, len: usize) -> Self {
        debug_assert!(len <= EMBSTR_LIMIT);
        let mut buf = [0u8; EMBSTR_LIMIT];
        if let Some(src) = bytes {
            buf[..len].copy_from_slice(&src[..len]);
        }
        Self {
            len: len as u8,
            buf,
        }
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len as usize]
    }
}

impl std::fmt::Debug for EmbStr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EmbStr({:?})", String::from_utf8_lossy(self.as_bytes()))
    }
}

/// Full sorted-set representation: the skip list orders by (score, member)
/// while the dict maps member to score for O(1) score lookup. The two share
/// the element set.
#[derive(Debug, Default)]
pub struct ZSetPair {
    pub index: Dict<Bytes, f64>,
    pub skip: SkipList,
}

/// Opaque payload attached by a module, plus its type descriptor.
pub struct ModulePayload {
    mtype: &'static ModuleType,
    blob: Option<Box<dyn Any + Send + Sync>>,
}

/// Descriptor of a module value type: how to dispose of the blob and,
/// optionally, how to estimate its memory footprint.
pub struct ModuleType {
    pub name: &'static str,
    pub free: fn(Box<dyn Any + Send + Sync>),
    pub mem_usage: Option<fn(&(dyn Any + Send + Sync)) -> usize>,
}

impl ModulePayload {
    pub fn new(mtype: &'static ModuleType, blob: Box<dyn Any + Send + Sync>) -> Self {
        Self {
            mtype,
            blob: Some(blob),
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.mtype.name
    }

    /// Delegates to the type's memory-usage callback; 0 when the type does
    /// not support estimation.
    pub fn mem_usage(&self) -> usize {
        match (self.mtype.mem_usage, &self.blob) {
            (Some(f), Some(blob)) => f(blob.as_ref()),
            _ => 0,
        }
    }
}

impl Drop for ModulePayload {
    fn drop(&mut self) {
        if let Some(blob) = self.blob.take() {
            (self.mtype.free)(blob);
        }
    }
}

impl std::fmt::Debug for ModulePayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ModulePayload({})", self.mtype.name)
    }
}

/// The owned payload of a value. One variant per legal (kind, encoding)
/// pair from the table in the module docs.
#[derive(Debug)]
pub enum Payload {
    /// string/int: the integer lives in the slot, no heap allocation.
    Int(i64),
    /// string/embstr: bytes share the header allocation.
    Emb(EmbStr),
    /// string/raw: independently allocated dynamic string.
    Raw(DynStr),
    /// list/quicklist
    ListQuick(Box<QuickList>),
    /// list/ziplist
    ListZip(Box<ZipList>),
    /// set/hashtable
    SetTable(Box<Dict<Bytes, ()>>),
    /// set/intset
    SetInt(Box<IntSet>),
    /// hash/hashtable: field -> value
    HashTable(Box<Dict<Bytes, Bytes>>),
    /// hash/ziplist: flattened field, value, field, value...
    HashZip(Box<ZipList>),
    /// zset/skiplist
    ZSetSkip(Box<ZSetPair>),
    /// zset/ziplist: flattened member, score, member, score...
    ZSetZip(Box<ZipList>),
    /// module blob with its type descriptor
    Module(Box<ModulePayload>),
}

impl Payload {
    pub fn kind(&self) -> ObjKind {
        match self {
            Payload::Int(_) | Payload::Emb(_) | Payload::Raw(_) => ObjKind::String,
            Payload::ListQuick(_) | Payload::ListZip(_) => ObjKind::List,
            Payload::SetTable(_) | Payload::SetInt(_) => ObjKind::Set,
            Payload::HashTable(_) | Payload::HashZip(_) => ObjKind::Hash,
            Payload::ZSetSkip(_) | Payload::ZSetZip(_) => ObjKind::SortedSet,
            Payload::Module(_) => ObjKind::Module,
        }
    }

    pub fn encoding(&self) -> ObjEncoding {
        match self {
            Payload::Int(_) => ObjEncoding::Int,
            Payload::Emb(_) => ObjEncoding::EmbStr,
            Payload::Raw(_) => ObjEncoding::Raw,
            Payload::ListQuick(_) => ObjEncoding::QuickList,
            Payload::ListZip(_) | Payload::HashZip(_) | Payload::ZSetZip(_) => ObjEncoding::ZipList,
            Payload::SetTable(_) | Payload::HashTable(_) => ObjEncoding::Table,
            Payload::SetInt(_) => ObjEncoding::IntSet,
            Payload::ZSetSkip(_) => ObjEncoding::SkipList,
            Payload::Module(_) => ObjEncoding::Module,
        }
    }
}

// ============================================================================
// The value header
// ============================================================================

/// The fixed-shape value header: payload plus refcount and eviction
/// metadata. See the module docs for the lifetime rules.
#[derive(Debug)]
pub struct Object {
    refcount: AtomicU32,
    meta: AtomicU32,
    payload: Payload,
}

impl Object {
    /// Wraps `payload` in a fresh header with refcount 1 and the eviction
    /// metadata stamped for the current policy.
    pub fn new(payload: Payload) -> Obj {
        Arc::new(Object {
            refcount: AtomicU32::new(1),
            meta: AtomicU32::new(eviction::initial_meta()),
            payload,
        })
    }

    pub fn kind(&self) -> ObjKind {
        self.payload.kind()
    }

    pub fn encoding(&self) -> ObjEncoding {
        self.payload.encoding()
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Relaxed)
    }

    pub fn is_shared(&self) -> bool {
        self.refcount() == SHARED_REFCOUNT
    }

    /// Raw 24-bit eviction metadata.
    pub fn meta(&self) -> u32 {
        self.meta.load(Ordering::Relaxed)
    }

    /// Re-stamps the eviction metadata for an access under the current
    /// policy. Shared singletons are skipped: their metadata is frozen.
    pub fn touch(&self) {
        if !self.is_shared() {
            self.meta
                .store(eviction::touch_meta(self.meta()), Ordering::Relaxed);
        }
    }

    /// Exclusive access to the payload for in-place mutation.
    ///
    /// Only legal while the caller holds the single handle; an aliased or
    /// shared value reaching this path is a bug, not bad input.
    pub fn payload_mut(this: &mut Obj) -> &mut Payload {
        if this.is_shared() {
            panic!("payload mutation on a shared value");
        }
        match Arc::get_mut(this) {
            Some(inner) => &mut inner.payload,
            None => panic!("payload mutation on an aliased value"),
        }
    }
}

// ============================================================================
// Lifetime manager
// ============================================================================

/// Registers one more alias of `o` and returns the new handle.
///
/// Shared singletons are left untouched; their handle is still cloned.
pub fn incr_ref(o: &Obj) -> Obj {
    if !o.is_shared() {
        o.refcount.fetch_add(1, Ordering::Relaxed);
    }
    Arc::clone(o)
}

/// Releases one alias of `o`, freeing payload and header when the last
/// reference goes.
///
/// # Panics
///
/// Panics when called on a value whose refcount is already 0: a
/// double-release is a bug, not a runtime condition.
pub fn decr_ref(o: Obj) {
    match o.refcount() {
        SHARED_REFCOUNT => {}
        0 => panic!("decr_ref against refcount <= 0"),
        n => {
            o.refcount.store(n - 1, Ordering::Relaxed);
        }
    }
    // Dropping the handle releases the header (and payload, via Drop)
    // once the last alias is gone.
}

/// Sets the refcount to 0 without freeing, handing the value to a function
/// that will `incr_ref` it before the caller touches it again.
pub fn reset_ref(o: Obj) -> Obj {
    o.refcount.store(0, Ordering::Relaxed);
    o
}

/// Marks a freshly built value as an immortal shared singleton.
pub fn make_shared(o: Obj) -> Obj {
    assert_eq!(o.refcount(), 1, "only fresh values can become shared");
    o.refcount.store(SHARED_REFCOUNT, Ordering::Relaxed);
    o
}

// ============================================================================
// Aggregate constructors
// ============================================================================

/// New empty list in the general quicklist encoding.
pub fn create_list() -> Obj {
    Object::new(Payload::ListQuick(Box::new(QuickList::new())))
}

/// New empty list in the compact ziplist encoding.
pub fn create_ziplist_list() -> Obj {
    Object::new(Payload::ListZip(Box::new(ZipList::new())))
}

/// New empty set in the hash-table encoding.
pub fn create_set() -> Obj {
    Object::new(Payload::SetTable(Box::new(Dict::new())))
}

/// New empty set in the integer-set encoding.
pub fn create_intset() -> Obj {
    Object::new(Payload::SetInt(Box::new(IntSet::new())))
}

/// New empty hash in the compact ziplist encoding.
pub fn create_hash() -> Obj {
    Object::new(Payload::HashZip(Box::new(ZipList::new())))
}

/// New empty sorted set in the full skiplist encoding.
pub fn create_sorted_set() -> Obj {
    Object::new(Payload::ZSetSkip(Box::new(ZSetPair::default())))
}

/// New empty sorted set in the compact ziplist encoding.
pub fn create_ziplist_sorted_set() -> Obj {
    Object::new(Payload::ZSetZip(Box::new(ZipList::new())))
}

/// New module value wrapping an opaque blob with its type descriptor.
pub fn create_module(mtype: &'static ModuleType, blob: Box<dyn Any + Send + Sync>) -> Obj {
    Object::new(Payload::Module(Box::new(ModulePayload::new(mtype, blob))))
}

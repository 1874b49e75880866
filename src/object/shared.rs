//! Shared-Singleton Registry
//!
//! A process-wide table of immortal values built once at startup and never
//! written again. Small non-negative integers are by far the most common
//! values in a cache workload, so one frozen object per integer in
//! `[0, SHARED_INT_LIMIT)` lets every key holding such a value alias the
//! same header instead of allocating its own.
//!
//! Because the records are immutable and their refcount is the shared
//! sentinel, the table is read from any thread without synchronization.

use std::sync::OnceLock;

use super::{make_shared, Obj, Object, Payload, SHARED_INT_LIMIT};

/// The well-known reply and error strings used across the command surface.
pub mod msg {
    pub const OK: &str = "OK";
    pub const PONG: &str = "PONG";
    pub const WRONG_TYPE: &str =
        "WRONGTYPE Operation against a key holding the wrong kind of value";
    pub const NOT_INTEGER: &str = "ERR value is not an integer or out of range";
    pub const NOT_FLOAT: &str = "ERR value is not a valid float";
    pub const SYNTAX: &str = "ERR syntax error";
}

/// The frozen singleton table.
pub struct SharedObjects {
    integers: Vec<Obj>,
}

static SHARED: OnceLock<SharedObjects> = OnceLock::new();

impl SharedObjects {
    fn build() -> Self {
        let integers = (0..SHARED_INT_LIMIT)
            .map(|v| make_shared(Object::new(Payload::Int(v))))
            .collect();
        Self { integers }
    }
}

/// Returns the registry, building it on first use.
pub fn shared() -> &'static SharedObjects {
    SHARED.get_or_init(SharedObjects::build)
}

/// The immortal object for integer `v`. Callers guarantee
/// `0 <= v < SHARED_INT_LIMIT`.
pub fn integer(v: i64) -> &'static Obj {
    debug_assert!((0..SHARED_INT_LIMIT).contains(&v));
    &shared().integers[v as usize]
}

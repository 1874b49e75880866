//! # emberkv - An In-Memory Key-Value Database
//!
//! emberkv is a RESP-compatible, in-memory key-value store whose center of
//! gravity is the **polymorphic value object layer**: every stored value is
//! wrapped in a small header that picks among multiple physical encodings
//! to minimize memory, counts references so small immutable values can be
//! aliased safely, and answers per-key and per-instance memory questions.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          emberkv                             │
//! │                                                              │
//! │  ┌──────────┐   ┌────────────┐   ┌───────────────────────┐   │
//! │  │ TCP      │──>│ Connection │──>│ CommandHandler        │   │
//! │  │ Listener │   │ Handler    │   │  strings/keys/        │   │
//! │  └──────────┘   └────────────┘   │  aggregates/OBJECT/   │   │
//! │                                  │  MEMORY               │   │
//! │                                  └──────────┬────────────┘   │
//! │                                             ▼                │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │ Storage: per-db keyspace of key -> Object              │  │
//! │  │                                                        │  │
//! │  │   Object = kind + encoding + refcount + eviction meta  │  │
//! │  │     string: raw | embstr | int (+ shared singletons)   │  │
//! │  │     list:   quicklist | ziplist                        │  │
//! │  │     set:    hashtable | intset                         │  │
//! │  │     hash:   hashtable | ziplist                        │  │
//! │  │     zset:   skiplist  | ziplist                        │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Overview
//!
//! - [`object`]: the value header, string encoder, shared singletons and
//!   the sampling size estimator
//! - [`ds`]: the container representations behind the aggregate encodings
//! - [`storage`]: the keyspace (main dict + expires dict) and the sweeper
//! - [`commands`]: command dispatch, including `OBJECT` and `MEMORY`
//! - [`memory`]: instance-wide overhead report and the memory doctor
//! - [`protocol`]: RESP values, serializer and request parser
//! - [`connection`]: per-client tasks and the client buffer registry
//! - [`alloc`]: the tracking global allocator
//! - [`eviction`]: the LRU clock and LFU counter behind the 24-bit
//!   eviction metadata

pub mod alloc;
pub mod commands;
pub mod connection;
pub mod ds;
pub mod eviction;
pub mod memory;
pub mod object;
pub mod protocol;
pub mod storage;

pub use commands::{CommandHandler, ServerContext};
pub use connection::{handle_connection, ClientRegistry};
pub use object::{Obj, ObjEncoding, ObjKind, Object};
pub use protocol::{ParseError, RespValue};
pub use storage::{start_expiry_sweeper, Storage};

/// The default port emberkv listens on.
pub const DEFAULT_PORT: u16 = 6379;

/// The default host emberkv binds to.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default number of databases.
pub const DEFAULT_DATABASES: usize = 16;

/// Version of emberkv.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

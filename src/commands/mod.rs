//! Command Layer
//!
//! Receives parsed RESP commands, validates them and executes them
//! against the keyspace through the value-object layer. Replies are
//! always `RespValue`s; user mistakes (wrong type, bad numbers, wrong
//! arity) become error replies here and never propagate as Rust errors.
//!
//! - [`handler`]: dispatch plus the string, key and aggregate commands
//! - [`introspect`]: the `OBJECT` and `MEMORY` command surfaces

pub mod handler;
pub mod introspect;

pub use handler::CommandHandler;

use std::sync::Arc;

use crate::connection::ClientRegistry;
use crate::storage::Storage;

/// Everything a command can reach: the databases and the client registry
/// feeding the memory report.
#[derive(Debug)]
pub struct ServerContext {
    pub storage: Arc<Storage>,
    pub clients: Arc<ClientRegistry>,
}

impl ServerContext {
    pub fn new(databases: usize) -> Self {
        Self {
            storage: Arc::new(Storage::new(databases)),
            clients: Arc::new(ClientRegistry::new()),
        }
    }
}

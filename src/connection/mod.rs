//! Client Connections
//!
//! One tokio task per connected client: read bytes, parse a command,
//! execute, write the reply. Every connection registers itself in the
//! [`ClientRegistry`] with its current buffer sizes, which is where the
//! memory overhead report gets its per-client numbers.

pub mod handler;

pub use handler::{handle_connection, ClientKind, ClientRegistry, ConnectionHandler};

//! Storage Layer
//!
//! Holds the numbered databases. Each database is guarded by its own
//! `RwLock`; commands run against one database at a time, so the object
//! layer's single-writer assumptions hold per keyspace while independent
//! databases stay concurrent.
//!
//! - [`db`]: the keyspace itself (main dict + expires dict)
//! - [`expiry`]: the background sweeper reclaiming expired keys

pub mod db;
pub mod expiry;

pub use db::{now_ms, Db};
pub use expiry::{start_expiry_sweeper, ExpirySweeper};

use std::sync::RwLock;

/// All databases of one server instance.
#[derive(Debug)]
pub struct Storage {
    dbs: Vec<RwLock<Db>>,
}

impl Storage {
    /// Creates `count` empty databases.
    pub fn new(count: usize) -> Self {
        Self {
            dbs: (0..count).map(|id| RwLock::new(Db::new(id))).collect(),
        }
    }

    pub fn db_count(&self) -> usize {
        self.dbs.len()
    }

    /// The lock guarding database `index`.
    pub fn db(&self, index: usize) -> &RwLock<Db> {
        &self.dbs[index]
    }

    pub fn dbs(&self) -> impl Iterator<Item = &RwLock<Db>> {
        self.dbs.iter()
    }

    /// Keys across every database.
    pub fn total_keys(&self) -> usize {
        self.dbs
            .iter()
            .map(|db| db.read().unwrap().key_count())
            .sum()
    }

    /// Releases every key in every database.
    pub fn flush_all(&self) {
        for db in &self.dbs {
            db.write().unwrap().flush();
        }
    }

    /// One sweep pass over all databases. Returns reclaimed key count.
    pub fn sweep_expired(&self) -> usize {
        self.dbs
            .iter()
            .map(|db| db.write().unwrap().sweep_expired())
            .sum()
    }
}

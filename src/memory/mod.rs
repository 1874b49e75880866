//! Instance-Wide Memory Accounting
//!
//! Builds the overhead report behind `MEMORY STATS` and `MEMORY DOCTOR`:
//! how much the allocator holds, how much of that is bookkeeping (key
//! tables, client buffers, per-value headers) and how much is actual
//! dataset. Per-value sizing lives in [`crate::object::size`]; this module
//! aggregates the instance.

pub mod doctor;

pub use doctor::doctor_report;

use crate::alloc;
use crate::connection::ClientRegistry;
use crate::storage::Storage;

/// Bookkeeping bytes of one database's tables.
#[derive(Debug, Clone, Copy)]
pub struct DbOverhead {
    pub id: usize,
    pub main_bytes: usize,
    pub expires_bytes: usize,
    pub keys: usize,
}

/// Snapshot of where the instance's memory goes.
#[derive(Debug, Clone)]
pub struct MemoryOverhead {
    pub total_allocated: usize,
    pub startup_allocated: usize,
    pub peak_allocated: usize,
    pub fragmentation: f64,

    /// Replication backlog bytes. Structurally present; this server does
    /// not replicate, so it reports 0.
    pub repl_backlog: usize,
    pub clients_replicas: usize,
    pub replica_count: usize,
    pub clients_normal: usize,
    pub normal_count: usize,
    /// Persistence (rewrite/flush) buffer bytes; 0 without persistence.
    pub persist_buffer: usize,

    pub dbs: Vec<DbOverhead>,
    pub total_keys: usize,

    pub overhead_total: usize,
    pub dataset: usize,
    pub dataset_perc: f64,
    pub bytes_per_key: usize,
    pub peak_perc: f64,
}

/// Collects the overhead snapshot from the live instance.
pub fn collect(storage: &Storage, clients: &ClientRegistry) -> MemoryOverhead {
    let used = alloc::used_bytes();
    let startup = alloc::startup_bytes();
    let peak = alloc::peak_bytes().max(1);

    let totals = clients.buffer_totals();
    let mut overhead_total = startup + totals.normal_bytes + totals.replica_bytes;

    let mut dbs = Vec::new();
    let mut total_keys = 0usize;
    for db_lock in storage.dbs() {
        let db = db_lock.read().unwrap();
        if db.key_count() == 0 {
            continue;
        }
        let entry = DbOverhead {
            id: db.id(),
            main_bytes: db.main_overhead_bytes(),
            expires_bytes: db.expires_overhead_bytes(),
            keys: db.key_count(),
        };
        overhead_total += entry.main_bytes + entry.expires_bytes;
        total_keys += entry.keys;
        dbs.push(entry);
    }

    let dataset = used.saturating_sub(overhead_total);
    let net_usage = used.saturating_sub(startup).max(1);

    MemoryOverhead {
        total_allocated: used,
        startup_allocated: startup,
        peak_allocated: peak,
        fragmentation: alloc::fragmentation_ratio(),
        repl_backlog: 0,
        clients_replicas: totals.replica_bytes,
        replica_count: totals.replica_count,
        clients_normal: totals.normal_bytes,
        normal_count: totals.normal_count,
        persist_buffer: 0,
        dbs,
        total_keys,
        overhead_total,
        dataset,
        dataset_perc: dataset as f64 * 100.0 / net_usage as f64,
        bytes_per_key: if total_keys > 0 {
            net_usage / total_keys
        } else {
            0
        },
        peak_perc: used as f64 * 100.0 / peak as f64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::string::make_string;
    use bytes::Bytes;

    #[test]
    fn test_collect_counts_keys_per_db() {
        let storage = Storage::new(3);
        let clients = ClientRegistry::new();
        for i in 0..50 {
            storage.db(1).write().unwrap().set_value(
                Bytes::from(format!("k{}", i)),
                make_string(b"value"),
                false,
            );
        }
        let mh = collect(&storage, &clients);
        assert_eq!(mh.total_keys, 50);
        assert_eq!(mh.dbs.len(), 1);
        assert_eq!(mh.dbs[0].id, 1);
        assert!(mh.dbs[0].main_bytes > 0);
        assert!(mh.overhead_total >= mh.dbs[0].main_bytes);
    }

    #[test]
    fn test_collect_skips_empty_dbs() {
        let storage = Storage::new(4);
        let clients = ClientRegistry::new();
        let mh = collect(&storage, &clients);
        assert!(mh.dbs.is_empty());
        assert_eq!(mh.total_keys, 0);
        assert_eq!(mh.bytes_per_key, 0);
    }

    #[test]
    fn test_derived_figures_are_consistent() {
        let storage = Storage::new(1);
        let clients = ClientRegistry::new();
        let mh = collect(&storage, &clients);
        assert!(mh.total_allocated >= mh.dataset);
        assert!(mh.peak_allocated >= 1);
        assert!(mh.peak_perc > 0.0);
        assert!(mh.fragmentation > 0.0);
    }
}

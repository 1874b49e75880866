//! Background Expiry Sweeper
//!
//! Lazy expiry only reclaims a key when something reads it; a key that
//! expires and is never touched again would otherwise pin its value
//! forever. The sweeper closes that gap: a tokio task that periodically
//! walks the expires tables and releases overdue keys, which also keeps
//! the refcount ledger balanced for values nobody will ask for again.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info};

use super::Storage;

/// Interval between sweep passes.
const SWEEP_INTERVAL: Duration = Duration::from_millis(100);

/// Handle to the running sweeper; dropping it stops the task.
#[derive(Debug)]
pub struct ExpirySweeper {
    shutdown_tx: watch::Sender<bool>,
}

impl ExpirySweeper {
    /// Spawns the sweeper over `storage`.
    pub fn start(storage: Arc<Storage>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(sweep_loop(storage, shutdown_rx));
        info!("expiry sweeper started");
        Self { shutdown_tx }
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Drop for ExpirySweeper {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn sweep_loop(storage: Arc<Storage>, mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(SWEEP_INTERVAL) => {}
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    debug!("expiry sweeper shutting down");
                    return;
                }
            }
        }
        let reclaimed = storage.sweep_expired();
        if reclaimed > 0 {
            debug!(reclaimed, "expired keys reclaimed");
        }
    }
}

/// Starts the sweeper with the default interval.
pub fn start_expiry_sweeper(storage: Arc<Storage>) -> ExpirySweeper {
    ExpirySweeper::start(storage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::string::make_string;
    use crate::storage::now_ms;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_sweeper_reclaims_expired_keys() {
        let storage = Arc::new(Storage::new(1));
        {
            let mut db = storage.db(0).write().unwrap();
            for i in 0..10 {
                let key = Bytes::from(format!("k{}", i));
                db.set_value(key.clone(), make_string(b"v"), false);
                db.set_expire(&key, now_ms() + 20);
            }
            db.set_value(Bytes::from("stay"), make_string(b"v"), false);
        }

        let _sweeper = ExpirySweeper::start(Arc::clone(&storage));
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(storage.total_keys(), 1);
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_drop() {
        let storage = Arc::new(Storage::new(1));
        {
            let _sweeper = ExpirySweeper::start(Arc::clone(&storage));
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        // With the sweeper gone, an overdue key stays until accessed.
        {
            let mut db = storage.db(0).write().unwrap();
            db.set_value(Bytes::from("k"), make_string(b"v"), false);
            db.set_expire(&Bytes::from("k"), now_ms().saturating_sub(1));
        }
        tokio::time::sleep(Duration::from_millis(150)).await;
        // Lazy expiry still reclaims it on read.
        assert!(storage
            .db(0)
            .write()
            .unwrap()
            .lookup_read(&Bytes::from("k"))
            .is_none());
    }
}

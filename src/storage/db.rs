//! Keyspace
//!
//! A database is two tables: the main dict mapping keys to value objects,
//! and the expires dict mapping keys to their deadline. Values enter the
//! main table at refcount 1 (ownership transfers from the constructor) and
//! are released through `decr_ref` when replaced or deleted, so the
//! refcount discipline of the object layer is enforced at exactly two
//! choke points.
//!
//! Expired keys are reclaimed lazily on access and by the background
//! sweeper. Read lookups also touch the value's eviction metadata, which
//! is what makes `OBJECT IDLETIME` and `OBJECT FREQ` meaningful.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;

use crate::ds::Dict;
use crate::object::string::{get_decoded, make_raw_string};
use crate::object::{decr_ref, Obj, ObjEncoding, Object, Payload};

/// Milliseconds since the unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// One numbered database: keyspace plus expiry deadlines.
#[derive(Debug)]
pub struct Db {
    id: usize,
    dict: Dict<Bytes, Obj>,
    expires: Dict<Bytes, u64>,
}

impl Db {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            dict: Dict::new(),
            expires: Dict::new(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn key_count(&self) -> usize {
        self.dict.len()
    }

    pub fn expires_count(&self) -> usize {
        self.expires.len()
    }

    fn is_expired(&self, key: &Bytes) -> bool {
        match self.expires.get(key) {
            Some(&deadline) => now_ms() >= deadline,
            None => false,
        }
    }

    /// Drops the key if its deadline has passed. Returns true when it did.
    fn expire_if_due(&mut self, key: &Bytes) -> bool {
        if self.is_expired(key) {
            self.remove(key);
            true
        } else {
            false
        }
    }

    /// Looks a key up for a read, reclaiming it if expired and touching
    /// the value's eviction metadata.
    pub fn lookup_read(&mut self, key: &Bytes) -> Option<&Obj> {
        if self.expire_if_due(key) {
            return None;
        }
        let obj = self.dict.get(key)?;
        obj.touch();
        Some(obj)
    }

    /// Looks a key up without updating eviction metadata. `OBJECT` uses
    /// this so inspecting a key does not count as an access.
    pub fn lookup_no_touch(&mut self, key: &Bytes) -> Option<&Obj> {
        if self.expire_if_due(key) {
            return None;
        }
        self.dict.get(key)
    }

    /// Exclusive handle to a live value, for in-place aggregate mutation.
    pub fn lookup_write(&mut self, key: &Bytes) -> Option<&mut Obj> {
        if self.expire_if_due(key) {
            return None;
        }
        let obj = self.dict.get_mut(key)?;
        obj.touch();
        Some(obj)
    }

    /// Stores `value` under `key`, releasing any previous value. Keeps an
    /// existing expiry only when `keep_ttl` asks for it.
    pub fn set_value(&mut self, key: Bytes, value: Obj, keep_ttl: bool) {
        if !keep_ttl {
            self.expires.remove(&key);
        }
        if let Some(old) = self.dict.insert(key, value) {
            decr_ref(old);
        }
    }

    /// Deletes a key. Returns true when it existed.
    pub fn remove(&mut self, key: &Bytes) -> bool {
        self.expires.remove(key);
        match self.dict.remove(key) {
            Some(old) => {
                decr_ref(old);
                true
            }
            None => false,
        }
    }

    pub fn contains(&mut self, key: &Bytes) -> bool {
        !self.expire_if_due(key) && self.dict.contains(key)
    }

    /// Sets the expiry deadline of an existing key. Returns false when the
    /// key does not exist.
    pub fn set_expire(&mut self, key: &Bytes, deadline_ms: u64) -> bool {
        if self.expire_if_due(key) || !self.dict.contains(key) {
            return false;
        }
        self.expires.insert(key.clone(), deadline_ms);
        true
    }

    /// Remaining time to live: `None` when the key does not exist,
    /// `Some(-1)` when it has no expiry.
    pub fn ttl_ms(&mut self, key: &Bytes) -> Option<i64> {
        if self.expire_if_due(key) || !self.dict.contains(key) {
            return None;
        }
        match self.expires.get(key) {
            Some(&deadline) => Some(deadline.saturating_sub(now_ms()) as i64),
            None => Some(-1),
        }
    }

    /// Removes the expiry from a key. Returns true when one was removed.
    pub fn persist(&mut self, key: &Bytes) -> bool {
        if self.expire_if_due(key) {
            return false;
        }
        self.expires.remove(key).is_some()
    }

    /// Releases every key in this database.
    pub fn flush(&mut self) {
        let keys: Vec<Bytes> = self.dict.iter().map(|(k, _)| k.clone()).collect();
        for key in keys {
            if let Some(old) = self.dict.remove(&key) {
                decr_ref(old);
            }
        }
        self.expires.clear();
    }

    /// Reclaims all keys past their deadline. Returns how many went.
    pub fn sweep_expired(&mut self) -> usize {
        let now = now_ms();
        let due: Vec<Bytes> = self
            .expires
            .iter()
            .filter(|(_, &deadline)| now >= deadline)
            .map(|(k, _)| k.clone())
            .collect();
        let count = due.len();
        for key in due {
            self.remove(&key);
        }
        count
    }

    /// Rewrites a string value so it is safe to mutate in place: aliased
    /// or non-raw values are replaced by a private raw copy.
    pub fn unshare_string_value(&mut self, key: &Bytes) {
        let needs_copy = match self.dict.get(key) {
            Some(obj) => obj.refcount() > 1 || obj.encoding() != ObjEncoding::Raw,
            None => return,
        };
        if needs_copy {
            let obj = self.dict.get_mut(key).unwrap();
            let decoded = get_decoded(obj);
            let fresh = match decoded.payload() {
                Payload::Emb(e) => make_raw_string(e.as_bytes()),
                Payload::Raw(s) => make_raw_string(s.as_bytes()),
                _ => unreachable!(),
            };
            decr_ref(decoded);
            let old = std::mem::replace(obj, fresh);
            decr_ref(old);
        }
    }

    /// Bookkeeping bytes of the main table: entries, bucket array and one
    /// value header per key.
    pub fn main_overhead_bytes(&self) -> usize {
        self.dict.len() * Dict::<Bytes, Obj>::entry_overhead()
            + self.dict.bucket_bytes()
            + self.dict.len() * std::mem::size_of::<Object>()
    }

    /// Bookkeeping bytes of the expires table.
    pub fn expires_overhead_bytes(&self) -> usize {
        self.expires.len() * Dict::<Bytes, u64>::entry_overhead() + self.expires.bucket_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::string::{make_from_int, make_string, string_len};
    use crate::object::SHARED_REFCOUNT;

    fn key(s: &str) -> Bytes {
        Bytes::from(s.to_string())
    }

    #[test]
    fn test_set_and_lookup() {
        let mut db = Db::new(0);
        db.set_value(key("name"), make_string(b"ember"), false);
        let obj = db.lookup_read(&key("name")).unwrap();
        assert_eq!(string_len(obj), 5);
        assert_eq!(db.key_count(), 1);
    }

    #[test]
    fn test_replace_releases_old_value() {
        let mut db = Db::new(0);
        db.set_value(key("k"), make_string(b"first"), false);
        db.set_value(key("k"), make_string(b"second"), false);
        assert_eq!(db.key_count(), 1);
        let obj = db.lookup_read(&key("k")).unwrap();
        assert_eq!(obj.refcount(), 1);
    }

    #[test]
    fn test_remove() {
        let mut db = Db::new(0);
        db.set_value(key("k"), make_string(b"v"), false);
        assert!(db.remove(&key("k")));
        assert!(!db.remove(&key("k")));
        assert!(db.lookup_read(&key("k")).is_none());
    }

    #[test]
    fn test_expiry_is_lazy() {
        let mut db = Db::new(0);
        db.set_value(key("k"), make_string(b"v"), false);
        assert!(db.set_expire(&key("k"), now_ms().saturating_sub(1)));
        assert!(db.lookup_read(&key("k")).is_none());
        assert_eq!(db.key_count(), 0);
    }

    #[test]
    fn test_ttl_reporting() {
        let mut db = Db::new(0);
        assert_eq!(db.ttl_ms(&key("missing")), None);
        db.set_value(key("k"), make_string(b"v"), false);
        assert_eq!(db.ttl_ms(&key("k")), Some(-1));
        db.set_expire(&key("k"), now_ms() + 10_000);
        let ttl = db.ttl_ms(&key("k")).unwrap();
        assert!(ttl > 0 && ttl <= 10_000);
        assert!(db.persist(&key("k")));
        assert_eq!(db.ttl_ms(&key("k")), Some(-1));
    }

    #[test]
    fn test_sweep_expired() {
        let mut db = Db::new(0);
        db.set_value(key("a"), make_string(b"1"), false);
        db.set_value(key("b"), make_string(b"2"), false);
        db.set_value(key("c"), make_string(b"3"), false);
        db.set_expire(&key("a"), now_ms().saturating_sub(1));
        db.set_expire(&key("b"), now_ms().saturating_sub(1));
        assert_eq!(db.sweep_expired(), 2);
        assert_eq!(db.key_count(), 1);
    }

    #[test]
    fn test_unshare_string_value_copies_shared_singleton() {
        let mut db = Db::new(0);
        db.set_value(key("n"), make_from_int(42), false);
        assert_eq!(
            db.lookup_read(&key("n")).unwrap().refcount(),
            SHARED_REFCOUNT
        );
        db.unshare_string_value(&key("n"));
        let obj = db.lookup_read(&key("n")).unwrap();
        assert_eq!(obj.refcount(), 1);
        assert_eq!(obj.encoding(), ObjEncoding::Raw);
    }

    #[test]
    fn test_overhead_grows_with_keys() {
        let mut db = Db::new(0);
        let empty = db.main_overhead_bytes();
        for i in 0..100 {
            db.set_value(key(&format!("k{}", i)), make_string(b"v"), false);
        }
        assert!(db.main_overhead_bytes() > empty);
        db.set_expire(&key("k1"), now_ms() + 60_000);
        assert!(db.expires_overhead_bytes() > 0);
    }
}

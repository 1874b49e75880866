//! OBJECT and MEMORY Commands
//!
//! The two windows into the value layer: `OBJECT` projects a single
//! value's header fields (refcount, encoding, eviction metadata) into
//! replies, `MEMORY` exposes the per-key size estimator and the
//! instance-wide overhead report. Key lookups here deliberately skip the
//! eviction-metadata touch: inspecting a key must not count as an access.

use bytes::Bytes;

use crate::alloc;
use crate::ds::Dict;
use crate::eviction;
use crate::memory::{self, doctor_report};
use crate::object::size::{compute_size, DEFAULT_SIZE_SAMPLES};
use crate::object::shared::msg;
use crate::object::Obj;
use crate::protocol::RespValue;

use super::handler::CommandHandler;

const IDLETIME_UNDER_LFU: &str =
    "ERR An LFU maxmemory policy is selected, idle time not tracked. Please note that when \
     switching between maxmemory policies at runtime LRU and LFU data will take some time \
     to adjust.";

const FREQ_UNDER_LRU: &str =
    "ERR An LFU maxmemory policy is not selected, access frequency not tracked. Please note \
     that when switching between maxmemory policies at runtime LRU and LFU data will take \
     some time to adjust.";

fn arg_bytes(value: &RespValue) -> Option<Bytes> {
    match value {
        RespValue::BulkString(b) => Some(b.clone()),
        RespValue::SimpleString(s) => Some(Bytes::from(s.clone())),
        _ => None,
    }
}

fn pair(name: &str, value: RespValue) -> [RespValue; 2] {
    [RespValue::bulk_string(Bytes::from(name.to_string())), value]
}

impl CommandHandler {
    /// OBJECT <HELP|REFCOUNT|ENCODING|IDLETIME|FREQ> [key]
    pub(crate) fn cmd_object(&self, args: &[RespValue]) -> RespValue {
        let sub = match args.first().and_then(|a| a.as_str()) {
            Some(s) => s.to_lowercase(),
            None => return RespValue::error("ERR wrong number of arguments for 'object' command"),
        };

        if sub == "help" && args.len() == 1 {
            return RespValue::array(vec![
                RespValue::simple_string("OBJECT <subcommand> key. Subcommands:"),
                RespValue::simple_string(
                    "refcount -- Return the number of references of the value associated \
                     with the specified key.",
                ),
                RespValue::simple_string(
                    "encoding -- Return the kind of internal representation used in order \
                     to store the value associated with a key.",
                ),
                RespValue::simple_string(
                    "idletime -- Return the idle time of the key, that is the approximated \
                     number of seconds elapsed since the last access to the key.",
                ),
                RespValue::simple_string(
                    "freq -- Return the access frequency index of the key. The returned \
                     integer is proportional to the logarithm of the real access frequency.",
                ),
            ]);
        }

        if args.len() != 2 {
            return RespValue::error(format!(
                "ERR Unknown subcommand or wrong number of arguments for '{}'. Try OBJECT HELP",
                sub
            ));
        }
        let key = match arg_bytes(&args[1]) {
            Some(k) => k,
            None => return RespValue::error(msg::SYNTAX),
        };

        let db = self.db();
        let mut db = db.write().unwrap();
        let obj: &Obj = match db.lookup_no_touch(&key) {
            Some(obj) => obj,
            None => return RespValue::null(),
        };

        match sub.as_str() {
            "refcount" => RespValue::integer(obj.refcount() as i64),
            "encoding" => {
                RespValue::bulk_string(Bytes::from(obj.encoding().name().to_string()))
            }
            "idletime" => {
                if eviction::uses_lfu() {
                    RespValue::error(IDLETIME_UNDER_LFU)
                } else {
                    RespValue::integer(eviction::idle_seconds(obj.meta()) as i64)
                }
            }
            "freq" => {
                if !eviction::uses_lfu() {
                    RespValue::error(FREQ_UNDER_LRU)
                } else {
                    // Decay first: metadata is only re-stamped on access, so
                    // a long-cold key must not report its last hot counter.
                    RespValue::integer(eviction::lfu_decayed_counter(obj.meta()) as i64)
                }
            }
            _ => RespValue::error(format!(
                "ERR Unknown subcommand or wrong number of arguments for '{}'. Try OBJECT HELP",
                sub
            )),
        }
    }

    /// MEMORY <USAGE|STATS|DOCTOR|PURGE|MALLOC-STATS|HELP>
    pub(crate) fn cmd_memory(&self, args: &[RespValue]) -> RespValue {
        let sub = match args.first().and_then(|a| a.as_str()) {
            Some(s) => s.to_lowercase(),
            None => return RespValue::error("ERR wrong number of arguments for 'memory' command"),
        };

        match sub.as_str() {
            "usage" if args.len() >= 2 => self.memory_usage(&args[1..]),
            "stats" if args.len() == 1 => self.memory_stats(),
            "doctor" if args.len() == 1 => {
                let mh = memory::collect(&self.context().storage, &self.context().clients);
                RespValue::bulk_string(Bytes::from(doctor_report(&mh)))
            }
            "purge" if args.len() == 1 => {
                // The system allocator has no dirty-page release hook.
                RespValue::ok()
            }
            "malloc-stats" if args.len() == 1 => {
                RespValue::bulk_string(Bytes::from(alloc::stats_report()))
            }
            "help" if args.len() == 1 => RespValue::array(vec![
                RespValue::bulk_string(Bytes::from_static(
                    b"MEMORY DOCTOR                        - Outputs memory problems report",
                )),
                RespValue::bulk_string(Bytes::from_static(
                    b"MEMORY USAGE <key> [SAMPLES <count>] - Estimate memory usage of key",
                )),
                RespValue::bulk_string(Bytes::from_static(
                    b"MEMORY STATS                         - Show memory usage details",
                )),
                RespValue::bulk_string(Bytes::from_static(
                    b"MEMORY PURGE                         - Ask the allocator to release memory",
                )),
                RespValue::bulk_string(Bytes::from_static(
                    b"MEMORY MALLOC-STATS                  - Show allocator internal stats",
                )),
            ]),
            _ => RespValue::error("ERR Syntax error. Try MEMORY HELP"),
        }
    }

    /// MEMORY USAGE <key> [SAMPLES n] — the value estimate plus what the
    /// keyspace itself spends on the key: its string bytes and one main
    /// table entry.
    fn memory_usage(&self, args: &[RespValue]) -> RespValue {
        let key = match arg_bytes(&args[0]) {
            Some(k) => k,
            None => return RespValue::error(msg::SYNTAX),
        };
        let mut samples = DEFAULT_SIZE_SAMPLES;
        let mut i = 1;
        while i < args.len() {
            let is_samples = args[i]
                .as_str()
                .map(|s| s.eq_ignore_ascii_case("samples"))
                .unwrap_or(false);
            if is_samples && i + 1 < args.len() {
                match args[i + 1]
                    .as_str()
                    .and_then(|s| s.parse::<i64>().ok())
                {
                    Some(n) if n >= 0 => samples = n as usize,
                    _ => return RespValue::error(msg::SYNTAX),
                }
                i += 2;
            } else {
                return RespValue::error(msg::SYNTAX);
            }
        }

        let db = self.db();
        let mut db = db.write().unwrap();
        match db.lookup_no_touch(&key) {
            Some(obj) => {
                let usage = compute_size(obj, samples)
                    + alloc::alloc_size(key.len())
                    + Dict::<Bytes, Obj>::entry_overhead();
                RespValue::integer(usage as i64)
            }
            None => RespValue::null(),
        }
    }

    fn memory_stats(&self) -> RespValue {
        let mh = memory::collect(&self.context().storage, &self.context().clients);
        let mut out = Vec::new();
        out.extend(pair(
            "peak.allocated",
            RespValue::integer(mh.peak_allocated as i64),
        ));
        out.extend(pair(
            "total.allocated",
            RespValue::integer(mh.total_allocated as i64),
        ));
        out.extend(pair(
            "startup.allocated",
            RespValue::integer(mh.startup_allocated as i64),
        ));
        out.extend(pair(
            "replication.backlog",
            RespValue::integer(mh.repl_backlog as i64),
        ));
        out.extend(pair(
            "clients.slaves",
            RespValue::integer(mh.clients_replicas as i64),
        ));
        out.extend(pair(
            "clients.normal",
            RespValue::integer(mh.clients_normal as i64),
        ));
        out.extend(pair(
            "persistence.buffer",
            RespValue::integer(mh.persist_buffer as i64),
        ));
        for db in &mh.dbs {
            out.push(RespValue::bulk_string(Bytes::from(format!("db.{}", db.id))));
            out.push(RespValue::array(vec![
                RespValue::bulk_string(Bytes::from_static(b"overhead.hashtable.main")),
                RespValue::integer(db.main_bytes as i64),
                RespValue::bulk_string(Bytes::from_static(b"overhead.hashtable.expires")),
                RespValue::integer(db.expires_bytes as i64),
            ]));
        }
        out.extend(pair(
            "overhead.total",
            RespValue::integer(mh.overhead_total as i64),
        ));
        out.extend(pair("keys.count", RespValue::integer(mh.total_keys as i64)));
        out.extend(pair(
            "keys.bytes-per-key",
            RespValue::integer(mh.bytes_per_key as i64),
        ));
        out.extend(pair(
            "dataset.bytes",
            RespValue::integer(mh.dataset as i64),
        ));
        out.extend(pair(
            "dataset.percentage",
            RespValue::double(mh.dataset_perc),
        ));
        out.extend(pair("peak.percentage", RespValue::double(mh.peak_perc)));
        out.extend(pair("fragmentation", RespValue::double(mh.fragmentation)));
        RespValue::array(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::ServerContext;
    use crate::eviction::{set_policy, EvictionPolicy, TEST_POLICY_LOCK};
    use crate::object::SHARED_REFCOUNT;
    use std::sync::Arc;

    fn handler() -> CommandHandler {
        CommandHandler::new(Arc::new(ServerContext::new(16)))
    }

    fn run(h: &CommandHandler, parts: &[&str]) -> RespValue {
        h.execute(RespValue::array(
            parts
                .iter()
                .map(|p| RespValue::bulk_string(Bytes::copy_from_slice(p.as_bytes())))
                .collect(),
        ))
    }

    #[test]
    fn test_object_refcount_reports_shared_sentinel() {
        let h = handler();
        run(&h, &["SET", "n", "42"]);
        assert_eq!(
            run(&h, &["OBJECT", "REFCOUNT", "n"]),
            RespValue::integer(SHARED_REFCOUNT as i64)
        );
        run(&h, &["SET", "s", "plain text"]);
        assert_eq!(
            run(&h, &["OBJECT", "REFCOUNT", "s"]),
            RespValue::integer(1)
        );
    }

    #[test]
    fn test_object_encoding_names() {
        let h = handler();
        run(&h, &["SET", "s", "hello"]);
        run(&h, &["RPUSH", "l", "a"]);
        run(&h, &["SADD", "is", "7"]);
        run(&h, &["HSET", "h", "f", "v"]);
        for (key, want) in [
            ("s", "embstr"),
            ("l", "quicklist"),
            ("is", "intset"),
            ("h", "ziplist"),
        ] {
            assert_eq!(
                run(&h, &["OBJECT", "ENCODING", key]),
                RespValue::bulk_string(Bytes::from(want)),
            );
        }
    }

    #[test]
    fn test_object_missing_key_is_null() {
        let h = handler();
        assert_eq!(run(&h, &["OBJECT", "REFCOUNT", "nope"]), RespValue::null());
        assert_eq!(run(&h, &["OBJECT", "ENCODING", "nope"]), RespValue::null());
    }

    #[test]
    fn test_object_unknown_subcommand() {
        let h = handler();
        run(&h, &["SET", "k", "v"]);
        assert!(run(&h, &["OBJECT", "WAT", "k"]).is_error());
        assert!(run(&h, &["OBJECT", "REFCOUNT"]).is_error());
    }

    #[test]
    fn test_object_help() {
        let h = handler();
        if let RespValue::Array(lines) = run(&h, &["OBJECT", "HELP"]) {
            assert!(lines.len() >= 5);
        } else {
            unreachable!();
        }
    }

    #[test]
    fn test_policy_dependent_subcommands() {
        let _guard = TEST_POLICY_LOCK.lock().unwrap();
        let h = handler();
        run(&h, &["SET", "k", "v"]);

        set_policy(EvictionPolicy::NoEviction);
        if let RespValue::Integer(idle) = run(&h, &["OBJECT", "IDLETIME", "k"]) {
            assert!(idle >= 0);
        } else {
            unreachable!();
        }
        assert!(run(&h, &["OBJECT", "FREQ", "k"]).is_error());

        set_policy(EvictionPolicy::AllKeysLfu);
        run(&h, &["SET", "lfu", "v"]);
        if let RespValue::Integer(freq) = run(&h, &["OBJECT", "FREQ", "lfu"]) {
            assert!(freq >= 0);
        } else {
            unreachable!();
        }
        assert!(run(&h, &["OBJECT", "IDLETIME", "lfu"]).is_error());
        set_policy(EvictionPolicy::NoEviction);
    }

    #[test]
    fn test_memory_usage_scales_with_value() {
        let h = handler();
        run(&h, &["SET", "small", "v"]);
        let big: String = "x".repeat(10_000);
        run(&h, &["SET", "big", &big]);
        let small = match run(&h, &["MEMORY", "USAGE", "small"]) {
            RespValue::Integer(n) => n,
            _ => unreachable!(),
        };
        let big = match run(&h, &["MEMORY", "USAGE", "big"]) {
            RespValue::Integer(n) => n,
            _ => unreachable!(),
        };
        assert!(small > 0);
        assert!(big > small + 9_000);
        assert_eq!(run(&h, &["MEMORY", "USAGE", "missing"]), RespValue::null());
    }

    #[test]
    fn test_memory_usage_samples_option() {
        let h = handler();
        for i in 0..100 {
            run(&h, &["SADD", "s", &format!("member-{}", i)]);
        }
        assert!(matches!(
            run(&h, &["MEMORY", "USAGE", "s", "SAMPLES", "0"]),
            RespValue::Integer(_)
        ));
        assert!(matches!(
            run(&h, &["MEMORY", "USAGE", "s", "samples", "3"]),
            RespValue::Integer(_)
        ));
        assert!(run(&h, &["MEMORY", "USAGE", "s", "SAMPLES", "-1"]).is_error());
        assert!(run(&h, &["MEMORY", "USAGE", "s", "BOGUS"]).is_error());
    }

    #[test]
    fn test_memory_stats_shape() {
        let h = handler();
        run(&h, &["SET", "k", "v"]);
        if let RespValue::Array(items) = run(&h, &["MEMORY", "STATS"]) {
            // Name/value pairs plus one nested entry per populated db.
            let names: Vec<&str> = items.iter().filter_map(|i| i.as_str()).collect();
            for want in [
                "peak.allocated",
                "total.allocated",
                "startup.allocated",
                "replication.backlog",
                "clients.slaves",
                "clients.normal",
                "overhead.total",
                "keys.count",
                "dataset.bytes",
                "fragmentation",
                "db.0",
            ] {
                assert!(names.contains(&want), "missing {}", want);
            }
        } else {
            unreachable!();
        }
    }

    #[test]
    fn test_memory_doctor_and_friends() {
        let h = handler();
        assert!(matches!(
            run(&h, &["MEMORY", "DOCTOR"]),
            RespValue::BulkString(_)
        ));
        assert_eq!(run(&h, &["MEMORY", "PURGE"]), RespValue::ok());
        assert!(matches!(
            run(&h, &["MEMORY", "MALLOC-STATS"]),
            RespValue::BulkString(_)
        ));
        if let RespValue::Array(lines) = run(&h, &["MEMORY", "HELP"]) {
            assert_eq!(lines.len(), 5);
        } else {
            unreachable!();
        }
        assert!(run(&h, &["MEMORY", "NOPE"]).is_error());
    }
}

//! Command Dispatch and Execution
//!
//! The handler receives one parsed command (a RESP array), validates its
//! shape and runs it against database 0. Type-specific commands go
//! through [`check_kind`] first and answer the shared wrong-type error on
//! a mismatch.
//!
//! Aggregate commands also own the encoding transitions: a hash or sorted
//! set starts in the compact ziplist form and is converted to its full
//! representation here once it crosses the configured thresholds; the
//! value layer only records the resulting encoding.

use std::sync::{Arc, RwLock};

use bytes::Bytes;

use crate::ds::{Dict, QuickList, ZipList};
use crate::object::shared::msg;
use crate::object::string::{
    as_f64, as_int, fmt_f64, get_decoded, make_from_f64, make_from_int, make_raw_string,
    make_string, parse_f64_strict, parse_i64_strict, string_len, try_encode,
};
use crate::object::{create_hash, create_intset, create_list, create_ziplist_sorted_set};
use crate::object::{Obj, ObjKind, Object, Payload, ZSetPair};
use crate::protocol::RespValue;
use crate::storage::{now_ms, Db};

use super::ServerContext;

/// A hash converts from ziplist to hashtable past this many fields.
pub const HASH_MAX_ZIPLIST_ENTRIES: usize = 128;
/// ...or when any field or value exceeds this many bytes.
pub const HASH_MAX_ZIPLIST_VALUE: usize = 64;
/// A sorted set converts from ziplist to skiplist past this many members.
pub const ZSET_MAX_ZIPLIST_ENTRIES: usize = 128;
/// ...or when any member exceeds this many bytes.
pub const ZSET_MAX_ZIPLIST_VALUE: usize = 64;
/// A set of integers converts from intset to hashtable past this size.
pub const SET_MAX_INTSET_ENTRIES: usize = 512;

/// Executes commands against the server context.
#[derive(Clone)]
pub struct CommandHandler {
    ctx: Arc<ServerContext>,
}

/// Emits the wrong-type error when `obj` is not of the expected kind.
/// Returns `Some(reply)` exactly when the caller must bail out.
pub fn check_kind(obj: &Obj, expected: ObjKind) -> Option<RespValue> {
    if obj.kind() != expected {
        Some(RespValue::error(msg::WRONG_TYPE))
    } else {
        None
    }
}

fn wrong_arity(cmd: &str) -> RespValue {
    RespValue::error(format!(
        "ERR wrong number of arguments for '{}' command",
        cmd.to_lowercase()
    ))
}

fn arg_bytes(value: &RespValue) -> Option<Bytes> {
    match value {
        RespValue::BulkString(b) => Some(b.clone()),
        RespValue::SimpleString(s) => Some(Bytes::from(s.clone())),
        _ => None,
    }
}

fn arg_i64(value: &RespValue) -> Option<i64> {
    match value {
        RespValue::Integer(n) => Some(*n),
        _ => parse_i64_strict(&arg_bytes(value)?),
    }
}

fn arg_f64(value: &RespValue) -> Option<f64> {
    parse_f64_strict(&arg_bytes(value)?)
}

/// A decoded copy of a string value's bytes.
fn string_value_bytes(obj: &Obj) -> Bytes {
    let decoded = get_decoded(obj);
    let bytes = match decoded.payload() {
        Payload::Emb(e) => Bytes::copy_from_slice(e.as_bytes()),
        Payload::Raw(s) => Bytes::copy_from_slice(s.as_bytes()),
        _ => unreachable!(),
    };
    crate::object::decr_ref(decoded);
    bytes
}

impl CommandHandler {
    pub fn new(ctx: Arc<ServerContext>) -> Self {
        Self { ctx }
    }

    pub(crate) fn context(&self) -> &ServerContext {
        &self.ctx
    }

    pub(crate) fn db(&self) -> &RwLock<Db> {
        self.ctx.storage.db(0)
    }

    /// Validates the outer command shape and dispatches by name.
    pub fn execute(&self, command: RespValue) -> RespValue {
        let args = match command {
            RespValue::Array(args) => args,
            _ => return RespValue::error("ERR invalid command format"),
        };
        if args.is_empty() {
            return RespValue::error("ERR empty command");
        }
        let name = match args[0].as_str() {
            Some(s) => s.to_uppercase(),
            None => return RespValue::error("ERR invalid command name"),
        };
        self.dispatch(&name, &args[1..])
    }

    fn dispatch(&self, cmd: &str, args: &[RespValue]) -> RespValue {
        match cmd {
            // strings
            "SET" => self.cmd_set(args),
            "GET" => self.cmd_get(args),
            "GETSET" => self.cmd_getset(args),
            "APPEND" => self.cmd_append(args),
            "STRLEN" => self.cmd_strlen(args),
            "INCR" => self.cmd_incr_by(args, 1, true, "incr"),
            "DECR" => self.cmd_incr_by(args, -1, true, "decr"),
            "INCRBY" => self.cmd_incr_by(args, 1, false, "incrby"),
            "DECRBY" => self.cmd_incr_by(args, -1, false, "decrby"),
            "INCRBYFLOAT" => self.cmd_incr_by_float(args),

            // keys
            "DEL" => self.cmd_del(args),
            "EXISTS" => self.cmd_exists(args),
            "TYPE" => self.cmd_type(args),
            "EXPIRE" => self.cmd_expire(args),
            "TTL" => self.cmd_ttl(args),
            "PERSIST" => self.cmd_persist(args),
            "DBSIZE" => self.cmd_dbsize(args),
            "FLUSHDB" => self.cmd_flushdb(args),

            // lists
            "LPUSH" => self.cmd_push(args, true),
            "RPUSH" => self.cmd_push(args, false),
            "LLEN" => self.cmd_llen(args),
            "LRANGE" => self.cmd_lrange(args),

            // sets
            "SADD" => self.cmd_sadd(args),
            "SCARD" => self.cmd_scard(args),
            "SISMEMBER" => self.cmd_sismember(args),

            // hashes
            "HSET" => self.cmd_hset(args),
            "HGET" => self.cmd_hget(args),
            "HLEN" => self.cmd_hlen(args),

            // sorted sets
            "ZADD" => self.cmd_zadd(args),
            "ZCARD" => self.cmd_zcard(args),
            "ZSCORE" => self.cmd_zscore(args),

            // introspection
            "OBJECT" => self.cmd_object(args),
            "MEMORY" => self.cmd_memory(args),

            // server
            "PING" => match args.first().and_then(arg_bytes) {
                Some(m) => RespValue::bulk_string(m),
                None => RespValue::simple_string(msg::PONG),
            },
            "ECHO" => match args.first().and_then(arg_bytes) {
                Some(m) => RespValue::bulk_string(m),
                None => wrong_arity("echo"),
            },
            "QUIT" => RespValue::ok(),

            _ => RespValue::error(format!("ERR unknown command '{}'", cmd)),
        }
    }

    // ========================================================================
    // String commands
    // ========================================================================

    /// SET key value [EX seconds] [PX millis] [NX|XX] [KEEPTTL]
    fn cmd_set(&self, args: &[RespValue]) -> RespValue {
        if args.len() < 2 {
            return wrong_arity("set");
        }
        let (key, value) = match (arg_bytes(&args[0]), arg_bytes(&args[1])) {
            (Some(k), Some(v)) => (k, v),
            _ => return RespValue::error(msg::SYNTAX),
        };

        let mut expire_at: Option<u64> = None;
        let mut nx = false;
        let mut xx = false;
        let mut keep_ttl = false;
        let mut i = 2;
        while i < args.len() {
            let opt = match args[i].as_str() {
                Some(s) => s.to_uppercase(),
                None => return RespValue::error(msg::SYNTAX),
            };
            match opt.as_str() {
                "EX" | "PX" => {
                    i += 1;
                    let amount = match args.get(i).and_then(arg_i64) {
                        Some(n) if n > 0 => n as u64,
                        _ => return RespValue::error("ERR invalid expire time in 'set' command"),
                    };
                    let millis = if opt == "EX" { amount * 1000 } else { amount };
                    expire_at = Some(now_ms() + millis);
                }
                "NX" => nx = true,
                "XX" => xx = true,
                "KEEPTTL" => keep_ttl = true,
                _ => return RespValue::error(msg::SYNTAX),
            }
            i += 1;
        }

        let mut db = self.db().write().unwrap();
        let exists = db.contains(&key);
        if (nx && exists) || (xx && !exists) {
            return RespValue::null();
        }

        // Fresh values get one shot at a better encoding before storage.
        let obj = try_encode(make_string(&value));
        db.set_value(key.clone(), obj, keep_ttl);
        if let Some(at) = expire_at {
            db.set_expire(&key, at);
        }
        RespValue::ok()
    }

    fn cmd_get(&self, args: &[RespValue]) -> RespValue {
        if args.len() != 1 {
            return wrong_arity("get");
        }
        let key = match arg_bytes(&args[0]) {
            Some(k) => k,
            None => return RespValue::error(msg::SYNTAX),
        };
        let mut db = self.db().write().unwrap();
        match db.lookup_read(&key) {
            Some(obj) => {
                if let Some(err) = check_kind(obj, ObjKind::String) {
                    return err;
                }
                RespValue::bulk_string(string_value_bytes(obj))
            }
            None => RespValue::null(),
        }
    }

    fn cmd_getset(&self, args: &[RespValue]) -> RespValue {
        if args.len() != 2 {
            return wrong_arity("getset");
        }
        let (key, value) = match (arg_bytes(&args[0]), arg_bytes(&args[1])) {
            (Some(k), Some(v)) => (k, v),
            _ => return RespValue::error(msg::SYNTAX),
        };
        let mut db = self.db().write().unwrap();
        let old = match db.lookup_read(&key) {
            Some(obj) => {
                if let Some(err) = check_kind(obj, ObjKind::String) {
                    return err;
                }
                Some(string_value_bytes(obj))
            }
            None => None,
        };
        db.set_value(key, try_encode(make_string(&value)), false);
        match old {
            Some(bytes) => RespValue::bulk_string(bytes),
            None => RespValue::null(),
        }
    }

    fn cmd_append(&self, args: &[RespValue]) -> RespValue {
        if args.len() != 2 {
            return wrong_arity("append");
        }
        let (key, value) = match (arg_bytes(&args[0]), arg_bytes(&args[1])) {
            (Some(k), Some(v)) => (k, v),
            _ => return RespValue::error(msg::SYNTAX),
        };
        let mut db = self.db().write().unwrap();
        match db.lookup_read(&key) {
            Some(obj) => {
                if let Some(err) = check_kind(obj, ObjKind::String) {
                    return err;
                }
            }
            None => {
                let len = value.len();
                db.set_value(key, make_raw_string(&value), false);
                return RespValue::integer(len as i64);
            }
        }
        // Growing in place requires a private raw payload.
        db.unshare_string_value(&key);
        let obj = db.lookup_write(&key).unwrap();
        if let Payload::Raw(s) = Object::payload_mut(obj) {
            s.cat(&value);
            RespValue::integer(s.len() as i64)
        } else {
            unreachable!("unshare produced a non-raw string")
        }
    }

    fn cmd_strlen(&self, args: &[RespValue]) -> RespValue {
        if args.len() != 1 {
            return wrong_arity("strlen");
        }
        let key = match arg_bytes(&args[0]) {
            Some(k) => k,
            None => return RespValue::error(msg::SYNTAX),
        };
        let mut db = self.db().write().unwrap();
        match db.lookup_read(&key) {
            Some(obj) => match check_kind(obj, ObjKind::String) {
                Some(err) => err,
                None => RespValue::integer(string_len(obj) as i64),
            },
            None => RespValue::integer(0),
        }
    }

    /// Shared body of INCR/DECR/INCRBY/DECRBY. `implicit` commands take no
    /// amount argument and use 1.
    fn cmd_incr_by(&self, args: &[RespValue], sign: i64, implicit: bool, name: &str) -> RespValue {
        let expected = if implicit { 1 } else { 2 };
        if args.len() != expected {
            return wrong_arity(name);
        }
        let key = match arg_bytes(&args[0]) {
            Some(k) => k,
            None => return RespValue::error(msg::SYNTAX),
        };
        let amount = if implicit {
            1
        } else {
            match arg_i64(&args[1]) {
                Some(n) => n,
                None => return RespValue::error(msg::NOT_INTEGER),
            }
        };
        let delta = match amount.checked_mul(sign) {
            Some(d) => d,
            None => return RespValue::error(msg::NOT_INTEGER),
        };

        let mut db = self.db().write().unwrap();
        let current = match db.lookup_read(&key) {
            Some(obj) => {
                if let Some(err) = check_kind(obj, ObjKind::String) {
                    return err;
                }
                match as_int(obj) {
                    Ok(v) => v,
                    Err(_) => return RespValue::error(msg::NOT_INTEGER),
                }
            }
            None => 0,
        };
        let next = match current.checked_add(delta) {
            Some(v) => v,
            None => return RespValue::error("ERR increment or decrement would overflow"),
        };
        db.set_value(key, make_from_int(next), true);
        RespValue::integer(next)
    }

    fn cmd_incr_by_float(&self, args: &[RespValue]) -> RespValue {
        if args.len() != 2 {
            return wrong_arity("incrbyfloat");
        }
        let key = match arg_bytes(&args[0]) {
            Some(k) => k,
            None => return RespValue::error(msg::SYNTAX),
        };
        let delta = match arg_f64(&args[1]) {
            Some(v) => v,
            None => return RespValue::error(msg::NOT_FLOAT),
        };
        let mut db = self.db().write().unwrap();
        let current = match db.lookup_read(&key) {
            Some(obj) => {
                if let Some(err) = check_kind(obj, ObjKind::String) {
                    return err;
                }
                match as_f64(obj) {
                    Ok(v) => v,
                    Err(_) => return RespValue::error(msg::NOT_FLOAT),
                }
            }
            None => 0.0,
        };
        let next = current + delta;
        if next.is_nan() || next.is_infinite() {
            return RespValue::error("ERR increment would produce NaN or Infinity");
        }
        db.set_value(key, make_from_f64(next, true), true);
        RespValue::bulk_string(Bytes::from(fmt_f64(next, true)))
    }

    // ========================================================================
    // Key commands
    // ========================================================================

    fn cmd_del(&self, args: &[RespValue]) -> RespValue {
        if args.is_empty() {
            return wrong_arity("del");
        }
        let mut db = self.db().write().unwrap();
        let removed = args
            .iter()
            .filter_map(arg_bytes)
            .filter(|k| db.remove(k))
            .count();
        RespValue::integer(removed as i64)
    }

    fn cmd_exists(&self, args: &[RespValue]) -> RespValue {
        if args.is_empty() {
            return wrong_arity("exists");
        }
        let mut db = self.db().write().unwrap();
        let found = args
            .iter()
            .filter_map(arg_bytes)
            .filter(|k| db.contains(k))
            .count();
        RespValue::integer(found as i64)
    }

    fn cmd_type(&self, args: &[RespValue]) -> RespValue {
        if args.len() != 1 {
            return wrong_arity("type");
        }
        let key = match arg_bytes(&args[0]) {
            Some(k) => k,
            None => return RespValue::error(msg::SYNTAX),
        };
        let mut db = self.db().write().unwrap();
        match db.lookup_read(&key) {
            Some(obj) => RespValue::simple_string(obj.kind().name()),
            None => RespValue::simple_string("none"),
        }
    }

    fn cmd_expire(&self, args: &[RespValue]) -> RespValue {
        if args.len() != 2 {
            return wrong_arity("expire");
        }
        let key = match arg_bytes(&args[0]) {
            Some(k) => k,
            None => return RespValue::error(msg::SYNTAX),
        };
        let seconds = match arg_i64(&args[1]) {
            Some(s) => s,
            None => return RespValue::error(msg::NOT_INTEGER),
        };
        let mut db = self.db().write().unwrap();
        if seconds <= 0 {
            // A non-positive TTL deletes the key outright.
            return RespValue::integer(if db.remove(&key) { 1 } else { 0 });
        }
        let deadline = now_ms() + seconds as u64 * 1000;
        RespValue::integer(if db.set_expire(&key, deadline) { 1 } else { 0 })
    }

    fn cmd_ttl(&self, args: &[RespValue]) -> RespValue {
        if args.len() != 1 {
            return wrong_arity("ttl");
        }
        let key = match arg_bytes(&args[0]) {
            Some(k) => k,
            None => return RespValue::error(msg::SYNTAX),
        };
        let mut db = self.db().write().unwrap();
        match db.ttl_ms(&key) {
            None => RespValue::integer(-2),
            Some(-1) => RespValue::integer(-1),
            Some(ms) => RespValue::integer((ms + 500) / 1000),
        }
    }

    fn cmd_persist(&self, args: &[RespValue]) -> RespValue {
        if args.len() != 1 {
            return wrong_arity("persist");
        }
        let key = match arg_bytes(&args[0]) {
            Some(k) => k,
            None => return RespValue::error(msg::SYNTAX),
        };
        let mut db = self.db().write().unwrap();
        RespValue::integer(if db.persist(&key) { 1 } else { 0 })
    }

    fn cmd_dbsize(&self, args: &[RespValue]) -> RespValue {
        if !args.is_empty() {
            return wrong_arity("dbsize");
        }
        RespValue::integer(self.db().read().unwrap().key_count() as i64)
    }

    fn cmd_flushdb(&self, args: &[RespValue]) -> RespValue {
        if !args.is_empty() {
            return wrong_arity("flushdb");
        }
        self.db().write().unwrap().flush();
        RespValue::ok()
    }

    // ========================================================================
    // List commands
    // ========================================================================

    fn cmd_push(&self, args: &[RespValue], front: bool) -> RespValue {
        if args.len() < 2 {
            return wrong_arity(if front { "lpush" } else { "rpush" });
        }
        let key = match arg_bytes(&args[0]) {
            Some(k) => k,
            None => return RespValue::error(msg::SYNTAX),
        };
        let values: Vec<Bytes> = match args[1..].iter().map(arg_bytes).collect() {
            Some(v) => v,
            None => return RespValue::error(msg::SYNTAX),
        };

        let mut db = self.db().write().unwrap();
        if db.lookup_read(&key).is_none() {
            db.set_value(key.clone(), create_list(), false);
        }
        let obj = db.lookup_write(&key).unwrap();
        if let Some(err) = check_kind(obj, ObjKind::List) {
            return err;
        }
        convert_list_to_quicklist(obj);
        if let Payload::ListQuick(ql) = Object::payload_mut(obj) {
            for v in &values {
                if front {
                    ql.push_front(v);
                } else {
                    ql.push_back(v);
                }
            }
            RespValue::integer(ql.len() as i64)
        } else {
            unreachable!()
        }
    }

    fn cmd_llen(&self, args: &[RespValue]) -> RespValue {
        if args.len() != 1 {
            return wrong_arity("llen");
        }
        let key = match arg_bytes(&args[0]) {
            Some(k) => k,
            None => return RespValue::error(msg::SYNTAX),
        };
        let mut db = self.db().write().unwrap();
        match db.lookup_read(&key) {
            Some(obj) => match check_kind(obj, ObjKind::List) {
                Some(err) => err,
                None => {
                    let len = match obj.payload() {
                        Payload::ListQuick(ql) => ql.len(),
                        Payload::ListZip(zl) => zl.len(),
                        _ => unreachable!(),
                    };
                    RespValue::integer(len as i64)
                }
            },
            None => RespValue::integer(0),
        }
    }

    fn cmd_lrange(&self, args: &[RespValue]) -> RespValue {
        if args.len() != 3 {
            return wrong_arity("lrange");
        }
        let key = match arg_bytes(&args[0]) {
            Some(k) => k,
            None => return RespValue::error(msg::SYNTAX),
        };
        let (start, stop) = match (arg_i64(&args[1]), arg_i64(&args[2])) {
            (Some(a), Some(b)) => (a, b),
            _ => return RespValue::error(msg::NOT_INTEGER),
        };
        let mut db = self.db().write().unwrap();
        let obj = match db.lookup_read(&key) {
            Some(obj) => obj,
            None => return RespValue::array(Vec::new()),
        };
        if let Some(err) = check_kind(obj, ObjKind::List) {
            return err;
        }
        let entries: Vec<Bytes> = match obj.payload() {
            Payload::ListQuick(ql) => ql.iter().map(Bytes::copy_from_slice).collect(),
            Payload::ListZip(zl) => zl.iter().map(Bytes::copy_from_slice).collect(),
            _ => unreachable!(),
        };
        let len = entries.len() as i64;
        let mut from = if start < 0 { len + start } else { start };
        let mut to = if stop < 0 { len + stop } else { stop };
        if from < 0 {
            from = 0;
        }
        if to >= len {
            to = len - 1;
        }
        if from > to || from >= len {
            return RespValue::array(Vec::new());
        }
        RespValue::array(
            entries[from as usize..=to as usize]
                .iter()
                .map(|e| RespValue::bulk_string(e.clone()))
                .collect(),
        )
    }

    // ========================================================================
    // Set commands
    // ========================================================================

    fn cmd_sadd(&self, args: &[RespValue]) -> RespValue {
        if args.len() < 2 {
            return wrong_arity("sadd");
        }
        let key = match arg_bytes(&args[0]) {
            Some(k) => k,
            None => return RespValue::error(msg::SYNTAX),
        };
        let members: Vec<Bytes> = match args[1..].iter().map(arg_bytes).collect() {
            Some(v) => v,
            None => return RespValue::error(msg::SYNTAX),
        };

        let mut db = self.db().write().unwrap();
        if db.lookup_read(&key).is_none() {
            // The first member picks the initial encoding.
            let initial = if parse_i64_strict(&members[0]).is_some() {
                create_intset()
            } else {
                crate::object::create_set()
            };
            db.set_value(key.clone(), initial, false);
        }
        let obj = db.lookup_write(&key).unwrap();
        if let Some(err) = check_kind(obj, ObjKind::Set) {
            return err;
        }

        let mut added = 0;
        for member in members {
            let as_integer = parse_i64_strict(&member);
            let needs_table = matches!(obj.payload(), Payload::SetInt(_))
                && (as_integer.is_none() || set_intset_len(obj) >= SET_MAX_INTSET_ENTRIES);
            if needs_table {
                convert_set_to_table(obj);
            }
            match Object::payload_mut(obj) {
                Payload::SetInt(is) => {
                    if is.add(as_integer.unwrap()) {
                        added += 1;
                    }
                }
                Payload::SetTable(d) => {
                    if d.insert(member, ()).is_none() {
                        added += 1;
                    }
                }
                _ => unreachable!(),
            }
        }
        RespValue::integer(added)
    }

    fn cmd_scard(&self, args: &[RespValue]) -> RespValue {
        if args.len() != 1 {
            return wrong_arity("scard");
        }
        let key = match arg_bytes(&args[0]) {
            Some(k) => k,
            None => return RespValue::error(msg::SYNTAX),
        };
        let mut db = self.db().write().unwrap();
        match db.lookup_read(&key) {
            Some(obj) => match check_kind(obj, ObjKind::Set) {
                Some(err) => err,
                None => {
                    let len = match obj.payload() {
                        Payload::SetInt(is) => is.len(),
                        Payload::SetTable(d) => d.len(),
                        _ => unreachable!(),
                    };
                    RespValue::integer(len as i64)
                }
            },
            None => RespValue::integer(0),
        }
    }

    fn cmd_sismember(&self, args: &[RespValue]) -> RespValue {
        if args.len() != 2 {
            return wrong_arity("sismember");
        }
        let (key, member) = match (arg_bytes(&args[0]), arg_bytes(&args[1])) {
            (Some(k), Some(m)) => (k, m),
            _ => return RespValue::error(msg::SYNTAX),
        };
        let mut db = self.db().write().unwrap();
        match db.lookup_read(&key) {
            Some(obj) => match check_kind(obj, ObjKind::Set) {
                Some(err) => err,
                None => {
                    let found = match obj.payload() {
                        Payload::SetInt(is) => match parse_i64_strict(&member) {
                            Some(v) => is.contains(v),
                            None => false,
                        },
                        Payload::SetTable(d) => d.contains(&member),
                        _ => unreachable!(),
                    };
                    RespValue::integer(if found { 1 } else { 0 })
                }
            },
            None => RespValue::integer(0),
        }
    }

    // ========================================================================
    // Hash commands
    // ========================================================================

    fn cmd_hset(&self, args: &[RespValue]) -> RespValue {
        if args.len() < 3 || args.len() % 2 == 0 {
            return wrong_arity("hset");
        }
        let key = match arg_bytes(&args[0]) {
            Some(k) => k,
            None => return RespValue::error(msg::SYNTAX),
        };
        let mut pairs = Vec::new();
        let mut i = 1;
        while i < args.len() {
            match (arg_bytes(&args[i]), arg_bytes(&args[i + 1])) {
                (Some(f), Some(v)) => pairs.push((f, v)),
                _ => return RespValue::error(msg::SYNTAX),
            }
            i += 2;
        }

        let mut db = self.db().write().unwrap();
        if db.lookup_read(&key).is_none() {
            db.set_value(key.clone(), create_hash(), false);
        }
        let obj = db.lookup_write(&key).unwrap();
        if let Some(err) = check_kind(obj, ObjKind::Hash) {
            return err;
        }

        let mut added = 0;
        for (field, value) in pairs {
            let oversized = field.len() > HASH_MAX_ZIPLIST_VALUE
                || value.len() > HASH_MAX_ZIPLIST_VALUE;
            let too_many = matches!(obj.payload(), Payload::HashZip(zl) if zl.len() / 2 >= HASH_MAX_ZIPLIST_ENTRIES);
            if matches!(obj.payload(), Payload::HashZip(_)) && (oversized || too_many) {
                convert_hash_to_table(obj);
            }
            match Object::payload_mut(obj) {
                Payload::HashZip(zl) => {
                    if hash_zip_insert(zl, &field, &value) {
                        added += 1;
                    }
                }
                Payload::HashTable(d) => {
                    if d.insert(field, value).is_none() {
                        added += 1;
                    }
                }
                _ => unreachable!(),
            }
        }
        RespValue::integer(added)
    }

    fn cmd_hget(&self, args: &[RespValue]) -> RespValue {
        if args.len() != 2 {
            return wrong_arity("hget");
        }
        let (key, field) = match (arg_bytes(&args[0]), arg_bytes(&args[1])) {
            (Some(k), Some(f)) => (k, f),
            _ => return RespValue::error(msg::SYNTAX),
        };
        let mut db = self.db().write().unwrap();
        match db.lookup_read(&key) {
            Some(obj) => match check_kind(obj, ObjKind::Hash) {
                Some(err) => err,
                None => {
                    let value = match obj.payload() {
                        Payload::HashZip(zl) => hash_zip_get(zl, &field),
                        Payload::HashTable(d) => d.get(&field).cloned(),
                        _ => unreachable!(),
                    };
                    match value {
                        Some(v) => RespValue::bulk_string(v),
                        None => RespValue::null(),
                    }
                }
            },
            None => RespValue::null(),
        }
    }

    fn cmd_hlen(&self, args: &[RespValue]) -> RespValue {
        if args.len() != 1 {
            return wrong_arity("hlen");
        }
        let key = match arg_bytes(&args[0]) {
            Some(k) => k,
            None => return RespValue::error(msg::SYNTAX),
        };
        let mut db = self.db().write().unwrap();
        match db.lookup_read(&key) {
            Some(obj) => match check_kind(obj, ObjKind::Hash) {
                Some(err) => err,
                None => {
                    let len = match obj.payload() {
                        Payload::HashZip(zl) => zl.len() / 2,
                        Payload::HashTable(d) => d.len(),
                        _ => unreachable!(),
                    };
                    RespValue::integer(len as i64)
                }
            },
            None => RespValue::integer(0),
        }
    }

    // ========================================================================
    // Sorted-set commands
    // ========================================================================

    fn cmd_zadd(&self, args: &[RespValue]) -> RespValue {
        if args.len() < 3 || args.len() % 2 == 0 {
            return wrong_arity("zadd");
        }
        let key = match arg_bytes(&args[0]) {
            Some(k) => k,
            None => return RespValue::error(msg::SYNTAX),
        };
        let mut pairs = Vec::new();
        let mut i = 1;
        while i < args.len() {
            let score = match arg_f64(&args[i]) {
                Some(s) if !s.is_nan() => s,
                _ => return RespValue::error(msg::NOT_FLOAT),
            };
            let member = match arg_bytes(&args[i + 1]) {
                Some(m) => m,
                None => return RespValue::error(msg::SYNTAX),
            };
            pairs.push((score, member));
            i += 2;
        }

        let mut db = self.db().write().unwrap();
        if db.lookup_read(&key).is_none() {
            db.set_value(key.clone(), create_ziplist_sorted_set(), false);
        }
        let obj = db.lookup_write(&key).unwrap();
        if let Some(err) = check_kind(obj, ObjKind::SortedSet) {
            return err;
        }

        let mut added = 0;
        for (score, member) in pairs {
            let oversized = member.len() > ZSET_MAX_ZIPLIST_VALUE;
            let too_many = matches!(obj.payload(), Payload::ZSetZip(zl) if zl.len() / 2 >= ZSET_MAX_ZIPLIST_ENTRIES);
            if matches!(obj.payload(), Payload::ZSetZip(_)) && (oversized || too_many) {
                convert_zset_to_skiplist(obj);
            }
            match Object::payload_mut(obj) {
                Payload::ZSetZip(zl) => {
                    if zset_zip_insert(zl, &member, score) {
                        added += 1;
                    }
                }
                Payload::ZSetSkip(zs) => {
                    match zs.index.insert(member.clone(), score) {
                        Some(old) => {
                            zs.skip.remove(old, &member);
                            zs.skip.insert(score, member);
                        }
                        None => {
                            zs.skip.insert(score, member);
                            added += 1;
                        }
                    }
                }
                _ => unreachable!(),
            }
        }
        RespValue::integer(added)
    }

    fn cmd_zcard(&self, args: &[RespValue]) -> RespValue {
        if args.len() != 1 {
            return wrong_arity("zcard");
        }
        let key = match arg_bytes(&args[0]) {
            Some(k) => k,
            None => return RespValue::error(msg::SYNTAX),
        };
        let mut db = self.db().write().unwrap();
        match db.lookup_read(&key) {
            Some(obj) => match check_kind(obj, ObjKind::SortedSet) {
                Some(err) => err,
                None => {
                    let len = match obj.payload() {
                        Payload::ZSetZip(zl) => zl.len() / 2,
                        Payload::ZSetSkip(zs) => zs.index.len(),
                        _ => unreachable!(),
                    };
                    RespValue::integer(len as i64)
                }
            },
            None => RespValue::integer(0),
        }
    }

    fn cmd_zscore(&self, args: &[RespValue]) -> RespValue {
        if args.len() != 2 {
            return wrong_arity("zscore");
        }
        let (key, member) = match (arg_bytes(&args[0]), arg_bytes(&args[1])) {
            (Some(k), Some(m)) => (k, m),
            _ => return RespValue::error(msg::SYNTAX),
        };
        let mut db = self.db().write().unwrap();
        match db.lookup_read(&key) {
            Some(obj) => match check_kind(obj, ObjKind::SortedSet) {
                Some(err) => err,
                None => {
                    let score = match obj.payload() {
                        Payload::ZSetZip(zl) => zset_zip_score(zl, &member),
                        Payload::ZSetSkip(zs) => zs.index.get(&member).copied(),
                        _ => unreachable!(),
                    };
                    match score {
                        Some(s) => RespValue::bulk_string(Bytes::from(fmt_f64(s, true))),
                        None => RespValue::null(),
                    }
                }
            },
            None => RespValue::null(),
        }
    }
}

// ============================================================================
// Encoding conversions and ziplist pair helpers
// ============================================================================

fn set_intset_len(obj: &Obj) -> usize {
    match obj.payload() {
        Payload::SetInt(is) => is.len(),
        _ => 0,
    }
}

/// Lists kept in the compact encoding are upgraded before any push.
fn convert_list_to_quicklist(obj: &mut Obj) {
    if let Payload::ListZip(zl) = obj.payload() {
        let mut ql = QuickList::new();
        for entry in zl.iter() {
            ql.push_back(entry);
        }
        *Object::payload_mut(obj) = Payload::ListQuick(Box::new(ql));
    }
}

fn convert_set_to_table(obj: &mut Obj) {
    if let Payload::SetInt(is) = obj.payload() {
        let mut d = Dict::new();
        let mut buf = [0u8; 32];
        for v in is.iter() {
            let n = crate::object::string::fmt_i64(v, &mut buf);
            d.insert(Bytes::copy_from_slice(&buf[..n]), ());
        }
        *Object::payload_mut(obj) = Payload::SetTable(Box::new(d));
    }
}

fn convert_hash_to_table(obj: &mut Obj) {
    if let Payload::HashZip(zl) = obj.payload() {
        let mut d = Dict::new();
        let mut it = zl.iter();
        while let (Some(field), Some(value)) = (it.next(), it.next()) {
            d.insert(Bytes::copy_from_slice(field), Bytes::copy_from_slice(value));
        }
        *Object::payload_mut(obj) = Payload::HashTable(Box::new(d));
    }
}

fn convert_zset_to_skiplist(obj: &mut Obj) {
    if let Payload::ZSetZip(zl) = obj.payload() {
        let mut zs = ZSetPair::default();
        let mut it = zl.iter();
        while let (Some(member), Some(score_text)) = (it.next(), it.next()) {
            let score = parse_f64_strict(score_text).unwrap_or(0.0);
            let member = Bytes::copy_from_slice(member);
            zs.index.insert(member.clone(), score);
            zs.skip.insert(score, member);
        }
        *Object::payload_mut(obj) = Payload::ZSetSkip(Box::new(zs));
    }
}

/// Inserts or updates a field in a ziplist-encoded hash. Returns true
/// when the field is new. Updates rebuild the blob; fine at ziplist sizes.
fn hash_zip_insert(zl: &mut ZipList, field: &[u8], value: &[u8]) -> bool {
    let mut rebuilt = ZipList::new();
    let mut found = false;
    let mut it = zl.iter();
    while let (Some(f), Some(v)) = (it.next(), it.next()) {
        rebuilt.push(f);
        if f == field {
            rebuilt.push(value);
            found = true;
        } else {
            rebuilt.push(v);
        }
    }
    if !found {
        rebuilt.push(field);
        rebuilt.push(value);
    }
    *zl = rebuilt;
    !found
}

fn hash_zip_get(zl: &ZipList, field: &[u8]) -> Option<Bytes> {
    let mut it = zl.iter();
    while let (Some(f), Some(v)) = (it.next(), it.next()) {
        if f == field {
            return Some(Bytes::copy_from_slice(v));
        }
    }
    None
}

/// Inserts or updates a member in a ziplist-encoded sorted set. Scores
/// are stored as their text form next to the member.
fn zset_zip_insert(zl: &mut ZipList, member: &[u8], score: f64) -> bool {
    let score_text = fmt_f64(score, false);
    let mut rebuilt = ZipList::new();
    let mut found = false;
    let mut it = zl.iter();
    while let (Some(m), Some(s)) = (it.next(), it.next()) {
        rebuilt.push(m);
        if m == member {
            rebuilt.push(score_text.as_bytes());
            found = true;
        } else {
            rebuilt.push(s);
        }
    }
    if !found {
        rebuilt.push(member);
        rebuilt.push(score_text.as_bytes());
    }
    *zl = rebuilt;
    !found
}

fn zset_zip_score(zl: &ZipList, member: &[u8]) -> Option<f64> {
    let mut it = zl.iter();
    while let (Some(m), Some(s)) = (it.next(), it.next()) {
        if m == member {
            return parse_f64_strict(s);
        }
    }
    None
}

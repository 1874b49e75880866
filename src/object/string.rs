//! String Values
//!
//! Strings take one of three physical forms, chosen to minimize memory:
//!
//! 1. **Int**: the text is a plain integer; the machine word lives in the
//!    payload slot and nothing is heap-allocated.
//! 2. **EmbStr**: 44 bytes or less; the bytes ride inside the header
//!    allocation itself and are immutable for the header's life.
//! 3. **Raw**: anything longer; an independently allocated dynamic string
//!    with spare capacity for growth.
//!
//! [`try_encode`] re-applies these rules to a freshly parsed value,
//! possibly swapping it for a shared integer singleton, demoting it to an
//! embedded string, or trimming a raw string's slack. The coercion
//! functions ([`as_int`], [`as_f64`]) are deliberately strict: the whole
//! string must parse, with no leading whitespace, trailing garbage or
//! overflow, because callers use them to guard against partially-numeric
//! input.

use std::sync::Arc;

use thiserror::Error;

use crate::ds::DynStr;
use crate::eviction;

use super::shared;
use super::{
    decr_ref, incr_ref, EmbStr, Obj, ObjEncoding, ObjKind, Object, Payload, EMBSTR_LIMIT,
    SHARED_INT_LIMIT,
};

/// A numeric coercion failed. The messages are the exact strings clients
/// see in error replies.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CoercionError {
    #[error("value is not an integer or out of range")]
    NotAnInteger,
    #[error("value is not a valid float")]
    NotAFloat,
}

// ============================================================================
// Construction
// ============================================================================

/// Creates a raw-encoded string: header plus an independent dynamic
/// string allocation.
pub fn make_raw_string(bytes: &[u8]) -> Obj {
    Object::new(Payload::Raw(DynStr::from_bytes(bytes)))
}

/// Creates an embstr-encoded string of `len` bytes sharing the header
/// allocation. A `None` source leaves the bytes zero-filled.
pub fn make_embedded_string(bytes: Option<&[u8]>, len: usize) -> Obj {
    Object::new(Payload::Emb(EmbStr::new(bytes, len)))
}

/// Creates a string value, embedding it when it fits [`EMBSTR_LIMIT`].
pub fn make_string(bytes: &[u8]) -> Obj {
    if bytes.len() <= EMBSTR_LIMIT {
        make_embedded_string(Some(bytes), bytes.len())
    } else {
        make_raw_string(bytes)
    }
}

/// Creates a string value holding the integer `value`.
///
/// Small non-negative integers come from the shared-singleton registry
/// when sharing is enabled; everything else gets a private int-encoded
/// header with no further allocation.
pub fn make_from_int(value: i64) -> Obj {
    if (0..SHARED_INT_LIMIT).contains(&value) && eviction::shared_integers_enabled() {
        incr_ref(shared::integer(value))
    } else {
        Object::new(Payload::Int(value))
    }
}

/// Creates a string value from a float.
///
/// `human_friendly` trades precision for readability: plain decimal with
/// trailing zeros trimmed. Otherwise exponent notation is used and the
/// text converts back to the identical bit pattern.
pub fn make_from_f64(value: f64, human_friendly: bool) -> Obj {
    make_string(fmt_f64(value, human_friendly).as_bytes())
}

/// Duplicates a string value, preserving its encoding. The copy is always
/// unshared with refcount 1, even when the source is a shared singleton.
pub fn dup_string(o: &Object) -> Obj {
    match o.payload() {
        Payload::Int(v) => Object::new(Payload::Int(*v)),
        Payload::Emb(e) => make_embedded_string(Some(e.as_bytes()), e.len()),
        Payload::Raw(s) => make_raw_string(s.as_bytes()),
        _ => panic!("dup_string on a non-string value"),
    }
}

// ============================================================================
// Adaptive re-encoding
// ============================================================================

enum EncodePlan {
    Keep,
    ToSharedInt(i64),
    ToInt(i64),
    ToEmb([u8; EMBSTR_LIMIT], usize),
    Shrink,
}

/// Tries to re-encode a string value to save space.
///
/// Only string values in a textual encoding are candidates, and only when
/// unshared: re-encoding an aliased value would change it under its other
/// holders. The value comes back possibly replaced; the caller's handle is
/// consumed either way.
pub fn try_encode(mut o: Obj) -> Obj {
    if o.kind() != ObjKind::String || o.encoding() == ObjEncoding::Int {
        return o;
    }
    if o.refcount() > 1 {
        return o;
    }

    let plan = {
        let (bytes, is_emb) = match o.payload() {
            Payload::Emb(e) => (e.as_bytes(), true),
            Payload::Raw(s) => (s.as_bytes(), false),
            _ => unreachable!(),
        };
        let len = bytes.len();
        // Strings over 20 bytes cannot be a 64-bit integer.
        let parsed = if len <= 20 {
            parse_i64_strict(bytes)
        } else {
            None
        };
        if let Some(v) = parsed {
            if (0..SHARED_INT_LIMIT).contains(&v) && eviction::shared_integers_enabled() {
                EncodePlan::ToSharedInt(v)
            } else {
                EncodePlan::ToInt(v)
            }
        } else if len <= EMBSTR_LIMIT {
            if is_emb {
                EncodePlan::Keep
            } else {
                let mut buf = [0u8; EMBSTR_LIMIT];
                buf[..len].copy_from_slice(bytes);
                EncodePlan::ToEmb(buf, len)
            }
        } else {
            match o.payload() {
                Payload::Raw(s) if s.avail() > len / 10 => EncodePlan::Shrink,
                _ => EncodePlan::Keep,
            }
        }
    };

    match plan {
        EncodePlan::Keep => o,
        EncodePlan::ToSharedInt(v) => {
            let singleton = incr_ref(shared::integer(v));
            decr_ref(o);
            singleton
        }
        EncodePlan::ToInt(v) => {
            // Replacing the payload drops the raw string allocation;
            // an embedded payload has nothing of its own to free.
            *Object::payload_mut(&mut o) = Payload::Int(v);
            o
        }
        EncodePlan::ToEmb(buf, len) => {
            let emb = make_embedded_string(Some(&buf), len);
            decr_ref(o);
            emb
        }
        EncodePlan::Shrink => {
            if let Payload::Raw(s) = Object::payload_mut(&mut o) {
                s.remove_free_space();
            }
            o
        }
    }
}

/// Returns a value equivalent to `o` but guaranteed to be in a textual
/// string encoding. A textual value is aliased (refcount bumped); an
/// int-encoded one is formatted into a fresh value. `o` is never modified.
pub fn get_decoded(o: &Obj) -> Obj {
    match o.payload() {
        Payload::Emb(_) | Payload::Raw(_) => incr_ref(o),
        Payload::Int(v) => {
            let mut buf = [0u8; 32];
            let n = fmt_i64(*v, &mut buf);
            make_string(&buf[..n])
        }
        _ => panic!("get_decoded on a non-string value"),
    }
}

// ============================================================================
// Accessors and coercions
// ============================================================================

/// Length of the string in bytes; for int-encoded values, the number of
/// decimal digits the integer formats to.
pub fn string_len(o: &Object) -> usize {
    match o.payload() {
        Payload::Int(v) => {
            let mut buf = [0u8; 32];
            fmt_i64(*v, &mut buf)
        }
        Payload::Emb(e) => e.len(),
        Payload::Raw(s) => s.len(),
        _ => panic!("string_len on a non-string value"),
    }
}

/// Extracts a signed integer, requiring the whole string to parse.
pub fn as_int(o: &Object) -> Result<i64, CoercionError> {
    match o.payload() {
        Payload::Int(v) => Ok(*v),
        Payload::Emb(e) => parse_i64_strict(e.as_bytes()).ok_or(CoercionError::NotAnInteger),
        Payload::Raw(s) => parse_i64_strict(s.as_bytes()).ok_or(CoercionError::NotAnInteger),
        _ => panic!("as_int on a non-string value"),
    }
}

/// Extracts a double, requiring the whole string to parse and the result
/// to be an in-range, non-NaN number.
pub fn as_f64(o: &Object) -> Result<f64, CoercionError> {
    match o.payload() {
        Payload::Int(v) => Ok(*v as f64),
        Payload::Emb(e) => parse_f64_strict(e.as_bytes()).ok_or(CoercionError::NotAFloat),
        Payload::Raw(s) => parse_f64_strict(s.as_bytes()).ok_or(CoercionError::NotAFloat),
        _ => panic!("as_f64 on a non-string value"),
    }
}

/// Extended-precision extraction entry point. Rust has no long double, so
/// this shares the double path; kept separate because callers distinguish
/// the two conversions.
pub fn as_long_double(o: &Object) -> Result<f64, CoercionError> {
    as_f64(o)
}

/// How string comparison treats bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareMode {
    /// Byte-wise comparison, shorter string wins ties.
    Binary,
    /// Host-locale collation.
    Collate,
}

fn materialize<'a>(o: &'a Object, buf: &'a mut [u8; 32]) -> &'a [u8] {
    match o.payload() {
        Payload::Int(v) => {
            let n = fmt_i64(*v, buf);
            &buf[..n]
        }
        Payload::Emb(e) => e.as_bytes(),
        Payload::Raw(s) => s.as_bytes(),
        _ => panic!("string accessor on a non-string value"),
    }
}

/// Compares two string values. Int-encoded operands are formatted into
/// stack buffers rather than allocating decoded copies.
pub fn compare(a: &Obj, b: &Obj, mode: CompareMode) -> std::cmp::Ordering {
    if Arc::ptr_eq(a, b) {
        return std::cmp::Ordering::Equal;
    }
    let mut buf_a = [0u8; 32];
    let mut buf_b = [0u8; 32];
    let astr = materialize(a, &mut buf_a);
    let bstr = materialize(b, &mut buf_b);
    match mode {
        CompareMode::Binary => astr.cmp(bstr),
        CompareMode::Collate => collate_bytes(astr, bstr),
    }
}

fn collate_bytes(a: &[u8], b: &[u8]) -> std::cmp::Ordering {
    let mut ca = a.to_vec();
    ca.push(0);
    let mut cb = b.to_vec();
    cb.push(0);
    // SAFETY: both buffers are NUL-terminated; strcoll reads until NUL.
    let r = unsafe {
        libc::strcoll(
            ca.as_ptr() as *const libc::c_char,
            cb.as_ptr() as *const libc::c_char,
        )
    };
    r.cmp(&0)
}

/// String equality. Two int-encoded values compare by payload word,
/// skipping formatting entirely.
pub fn equals(a: &Obj, b: &Obj) -> bool {
    match (a.payload(), b.payload()) {
        (Payload::Int(x), Payload::Int(y)) => x == y,
        _ => compare(a, b, CompareMode::Binary) == std::cmp::Ordering::Equal,
    }
}

// ============================================================================
// Numeric text helpers
// ============================================================================

/// Formats `value` as decimal into the head of `buf`, returning the
/// length written.
pub(crate) fn fmt_i64(value: i64, buf: &mut [u8; 32]) -> usize {
    let mut x = value.unsigned_abs();
    let mut pos = buf.len();
    loop {
        pos -= 1;
        buf[pos] = b'0' + (x % 10) as u8;
        x /= 10;
        if x == 0 {
            break;
        }
    }
    if value < 0 {
        pos -= 1;
        buf[pos] = b'-';
    }
    let len = buf.len() - pos;
    buf.copy_within(pos.., 0);
    len
}

/// Strict decimal integer parse: the canonical text of exactly one i64.
///
/// Rejects empty input, whitespace, a leading `+`, leading zeros and
/// overflow, so a value that round-trips through this parser always
/// formats back to the identical bytes.
pub fn parse_i64_strict(s: &[u8]) -> Option<i64> {
    if s.is_empty() || s.len() > 20 {
        return None;
    }
    let (negative, digits) = match s[0] {
        b'-' => (true, &s[1..]),
        _ => (false, s),
    };
    if digits.is_empty() {
        return None;
    }
    if digits[0] == b'0' {
        // "0" is the only valid text starting with a zero.
        return if digits.len() == 1 && !negative {
            Some(0)
        } else {
            None
        };
    }
    let mut magnitude: u64 = 0;
    for &c in digits {
        if !c.is_ascii_digit() {
            return None;
        }
        magnitude = magnitude
            .checked_mul(10)?
            .checked_add((c - b'0') as u64)?;
    }
    if negative {
        if magnitude > i64::MAX as u64 + 1 {
            None
        } else if magnitude == i64::MAX as u64 + 1 {
            Some(i64::MIN)
        } else {
            Some(-(magnitude as i64))
        }
    } else if magnitude > i64::MAX as u64 {
        None
    } else {
        Some(magnitude as i64)
    }
}

/// Strict double parse: whole string, no leading whitespace, no NaN, and
/// no silent overflow to infinity (a literal "inf" is still accepted).
pub fn parse_f64_strict(s: &[u8]) -> Option<f64> {
    let s = std::str::from_utf8(s).ok()?;
    let first = s.chars().next()?;
    if first.is_whitespace() {
        return None;
    }
    let value: f64 = s.parse().ok()?;
    if value.is_nan() {
        return None;
    }
    if value.is_infinite() {
        let body = s.trim_start_matches(['+', '-']).to_ascii_lowercase();
        if body != "inf" && body != "infinity" {
            return None;
        }
    }
    Some(value)
}

pub(crate) fn fmt_f64(value: f64, human_friendly: bool) -> String {
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if human_friendly {
        // Plain decimal, shortest text that round-trips; never grows
        // trailing zeros.
        format!("{}", value)
    } else {
        format!("{:e}", value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::SHARED_REFCOUNT;

    fn text(o: &Obj) -> Vec<u8> {
        let dec = get_decoded(o);
        let bytes = match dec.payload() {
            Payload::Emb(e) => e.as_bytes().to_vec(),
            Payload::Raw(s) => s.as_bytes().to_vec(),
            _ => unreachable!(),
        };
        decr_ref(dec);
        bytes
    }

    #[test]
    fn test_short_string_is_embedded() {
        let o = make_string(b"hello");
        assert_eq!(o.encoding(), ObjEncoding::EmbStr);
        assert_eq!(string_len(&o), 5);
    }

    #[test]
    fn test_embstr_threshold_is_exact() {
        let at_limit = make_string(&[b'x'; EMBSTR_LIMIT]);
        assert_eq!(at_limit.encoding(), ObjEncoding::EmbStr);
        let over_limit = make_string(&[b'x'; EMBSTR_LIMIT + 1]);
        assert_eq!(over_limit.encoding(), ObjEncoding::Raw);
    }

    #[test]
    fn test_make_from_int_shares_small_integers() {
        let a = make_from_int(7);
        let b = make_from_int(7);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.refcount(), SHARED_REFCOUNT);
        decr_ref(a);
        decr_ref(b);
    }

    #[test]
    fn test_make_from_int_private_outside_range() {
        let o = make_from_int(SHARED_INT_LIMIT);
        assert_eq!(o.encoding(), ObjEncoding::Int);
        assert_eq!(o.refcount(), 1);
        let neg = make_from_int(-5);
        assert_eq!(neg.refcount(), 1);
    }

    #[test]
    fn test_int_round_trip() {
        for v in [0, 1, -1, 42, i64::MAX, i64::MIN, 9_999, 10_000] {
            let o = make_from_int(v);
            assert_eq!(as_int(&o), Ok(v));
            assert_eq!(string_len(&o), v.to_string().len());
        }
    }

    #[test]
    fn test_f64_exact_round_trip() {
        for v in [0.5, -3.75, 1.0e100, f64::MIN_POSITIVE, 12345.6789] {
            let o = make_from_f64(v, false);
            let back = as_f64(&o).unwrap();
            assert_eq!(back.to_bits(), v.to_bits());
        }
    }

    #[test]
    fn test_f64_human_friendly_trims_zeros() {
        let o = make_from_f64(10.5, true);
        assert_eq!(text(&o), b"10.5");
        let whole = make_from_f64(3.0, true);
        assert_eq!(text(&whole), b"3");
    }

    #[test]
    fn test_dup_preserves_encoding_and_unshares() {
        let shared_int = make_from_int(5);
        let d = dup_string(&shared_int);
        assert_eq!(d.encoding(), ObjEncoding::Int);
        assert_eq!(d.refcount(), 1);

        let raw = make_string(&[b'y'; 60]);
        let d2 = dup_string(&raw);
        assert_eq!(d2.encoding(), ObjEncoding::Raw);
        assert_eq!(text(&d2), vec![b'y'; 60]);
    }

    #[test]
    fn test_try_encode_small_int_to_singleton() {
        let o = make_string(b"12345");
        assert_eq!(o.encoding(), ObjEncoding::EmbStr);
        let e = try_encode(o);
        assert!(Arc::ptr_eq(&e, shared::integer(12345)));
        decr_ref(e);
    }

    #[test]
    fn test_try_encode_large_int_in_place() {
        let o = make_string(b"123456789012");
        let e = try_encode(o);
        assert_eq!(e.encoding(), ObjEncoding::Int);
        assert_eq!(as_int(&e), Ok(123_456_789_012));
    }

    #[test]
    fn test_try_encode_raw_to_embstr() {
        let o = make_raw_string(b"short but raw");
        let e = try_encode(o);
        assert_eq!(e.encoding(), ObjEncoding::EmbStr);
        assert_eq!(text(&e), b"short but raw");
    }

    #[test]
    fn test_try_encode_long_string_stays_raw() {
        let o = make_string(&[b'a'; 45]);
        let e = try_encode(o);
        assert_eq!(e.encoding(), ObjEncoding::Raw);
    }

    #[test]
    fn test_try_encode_skips_aliased_values() {
        let o = make_raw_string(b"42");
        let alias = incr_ref(&o);
        let e = try_encode(o);
        assert_eq!(e.encoding(), ObjEncoding::Raw);
        decr_ref(alias);
        decr_ref(e);
    }

    #[test]
    fn test_try_encode_rejects_non_canonical_integers() {
        for text in [&b"012"[..], b"+42", b" 42", b"-0"] {
            let e = try_encode(make_string(text));
            assert_eq!(e.encoding(), ObjEncoding::EmbStr, "{:?}", text);
        }
    }

    #[test]
    fn test_try_encode_shrinks_slack() {
        let mut backing = Vec::with_capacity(200);
        backing.extend_from_slice(&[b'z'; 120]);
        let long = DynStr::from(backing);
        assert!(long.avail() > 12);
        let o = Object::new(Payload::Raw(long));
        let e = try_encode(o);
        if let Payload::Raw(s) = e.payload() {
            assert_eq!(s.avail(), 0);
        } else {
            unreachable!();
        }
    }

    #[test]
    fn test_try_encode_is_idempotent() {
        for src in [&b"hello"[..], b"12345678901234", b" 99", &[b'q'; 50]] {
            let once = try_encode(make_string(src));
            let enc = once.encoding();
            let bytes = text(&once);
            let twice = try_encode(once);
            assert_eq!(twice.encoding(), enc);
            assert_eq!(text(&twice), bytes);
        }
    }

    #[test]
    fn test_get_decoded_aliases_textual_values() {
        let o = make_string(b"abc");
        let dec = get_decoded(&o);
        assert!(Arc::ptr_eq(&o, &dec));
        assert_eq!(o.refcount(), 2);
        decr_ref(dec);
    }

    #[test]
    fn test_get_decoded_formats_int() {
        let o = make_from_int(-456);
        let dec = get_decoded(&o);
        assert_eq!(dec.encoding(), ObjEncoding::EmbStr);
        assert_eq!(text(&dec), b"-456");
    }

    #[test]
    fn test_as_int_strictness() {
        assert_eq!(
            as_int(&make_string(b"   42")),
            Err(CoercionError::NotAnInteger)
        );
        assert_eq!(as_int(&make_string(b"42")), Ok(42));
        assert_eq!(
            as_int(&make_string(b"42x")),
            Err(CoercionError::NotAnInteger)
        );
        assert_eq!(as_int(&make_string(b"")), Err(CoercionError::NotAnInteger));
        assert_eq!(
            as_int(&make_string(b"99999999999999999999999")),
            Err(CoercionError::NotAnInteger)
        );
    }

    #[test]
    fn test_as_f64_strictness() {
        assert_eq!(as_f64(&make_string(b"3.25")), Ok(3.25));
        assert_eq!(as_f64(&make_string(b"inf")).unwrap(), f64::INFINITY);
        assert_eq!(
            as_f64(&make_string(b" 1.0")),
            Err(CoercionError::NotAFloat)
        );
        assert_eq!(
            as_f64(&make_string(b"nan")),
            Err(CoercionError::NotAFloat)
        );
        assert_eq!(
            as_f64(&make_string(b"1e999")),
            Err(CoercionError::NotAFloat)
        );
        assert_eq!(as_f64(&make_string(b"1.5x")), Err(CoercionError::NotAFloat));
        assert_eq!(as_long_double(&make_string(b"2.5")), Ok(2.5));
    }

    #[test]
    fn test_compare_binary_total_order() {
        let a = make_string(b"abc");
        let b = make_string(b"abd");
        let c = make_string(b"abda");
        use std::cmp::Ordering::*;
        assert_eq!(compare(&a, &b, CompareMode::Binary), Less);
        assert_eq!(compare(&b, &c, CompareMode::Binary), Less);
        assert_eq!(compare(&a, &c, CompareMode::Binary), Less);
        assert_eq!(compare(&b, &a, CompareMode::Binary), Greater);
    }

    #[test]
    fn test_compare_shorter_wins_ties() {
        let a = make_string(b"ab");
        let b = make_string(b"abc");
        assert_eq!(compare(&a, &b, CompareMode::Binary), std::cmp::Ordering::Less);
    }

    #[test]
    fn test_compare_materializes_int_operands() {
        let i = make_from_int(100);
        let s = make_string(b"100");
        assert_eq!(
            compare(&i, &s, CompareMode::Binary),
            std::cmp::Ordering::Equal
        );
        assert!(equals(&i, &s));
    }

    #[test]
    fn test_compare_identity_shortcut() {
        let o = make_string(b"same");
        let alias = incr_ref(&o);
        assert_eq!(
            compare(&o, &alias, CompareMode::Binary),
            std::cmp::Ordering::Equal
        );
        decr_ref(alias);
    }

    #[test]
    fn test_equals_agrees_with_compare() {
        let pairs = [
            (make_string(b"x"), make_string(b"x")),
            (make_string(b"x"), make_string(b"y")),
            (make_from_int(12), make_from_int(12)),
            (make_from_int(12), make_from_int(13)),
        ];
        for (a, b) in &pairs {
            assert_eq!(
                equals(a, b),
                compare(a, b, CompareMode::Binary) == std::cmp::Ordering::Equal
            );
        }
    }

    #[test]
    fn test_collate_orders_ascii() {
        let a = make_string(b"apple");
        let b = make_string(b"banana");
        assert_eq!(compare(&a, &b, CompareMode::Collate), std::cmp::Ordering::Less);
    }

    #[test]
    fn test_fmt_i64() {
        let mut buf = [0u8; 32];
        let n = fmt_i64(0, &mut buf);
        assert_eq!(&buf[..n], b"0");
        let n = fmt_i64(-120, &mut buf);
        assert_eq!(&buf[..n], b"-120");
        let n = fmt_i64(i64::MIN, &mut buf);
        assert_eq!(&buf[..n], b"-9223372036854775808");
    }

    #[test]
    fn test_parse_i64_strict_extremes() {
        assert_eq!(parse_i64_strict(b"9223372036854775807"), Some(i64::MAX));
        assert_eq!(parse_i64_strict(b"-9223372036854775808"), Some(i64::MIN));
        assert_eq!(parse_i64_strict(b"9223372036854775808"), None);
        assert_eq!(parse_i64_strict(b"0"), Some(0));
        assert_eq!(parse_i64_strict(b"-0"), None);
    }
}

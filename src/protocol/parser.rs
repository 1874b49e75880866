//! Incremental RESP Parser
//!
//! Parses client requests out of a growing byte buffer. The parser never
//! blocks on incomplete input: it reports how many bytes a complete value
//! consumed, or that more data is needed, and the connection loop owns the
//! buffer bookkeeping.
//!
//! Return contract of [`parse`]:
//! - `Ok(Some((value, consumed)))` — one complete value
//! - `Ok(None)` — the buffer holds a prefix of a value; read more
//! - `Err(_)` — the bytes cannot be valid RESP; drop the client

use bytes::Bytes;
use thiserror::Error;

use super::types::{prefix, RespValue};

/// Largest accepted bulk string (512 MB).
pub const MAX_BULK_SIZE: usize = 512 * 1024 * 1024;

/// Maximum array nesting before the parser refuses the input.
pub const MAX_NESTING_DEPTH: usize = 32;

/// Invalid RESP input.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    #[error("unknown type prefix: {0:#04x}")]
    UnknownPrefix(u8),

    #[error("invalid integer: {0}")]
    InvalidInteger(String),

    #[error("invalid UTF-8 in line")]
    InvalidUtf8,

    #[error("invalid bulk string length: {0}")]
    InvalidBulkLength(i64),

    #[error("invalid array length: {0}")]
    InvalidArrayLength(i64),

    #[error("bulk string too large: {0} bytes")]
    BulkTooLarge(usize),

    #[error("nesting too deep")]
    TooDeep,
}

pub type ParseResult<T> = Result<T, ParseError>;

/// Parses one complete RESP value from the head of `buf`.
pub fn parse(buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
    if buf.is_empty() {
        return Ok(None);
    }
    parse_value(buf, 0)
}

fn parse_value(buf: &[u8], depth: usize) -> ParseResult<Option<(RespValue, usize)>> {
    if depth > MAX_NESTING_DEPTH {
        return Err(ParseError::TooDeep);
    }
    if buf.is_empty() {
        return Ok(None);
    }
    match buf[0] {
        prefix::SIMPLE_STRING => parse_line(buf, RespValue::SimpleString),
        prefix::ERROR => parse_line(buf, RespValue::Error),
        prefix::INTEGER => parse_integer(buf),
        prefix::BULK_STRING => parse_bulk(buf),
        prefix::ARRAY => parse_array(buf, depth),
        _ => parse_inline(buf),
    }
}

/// Finds the first CRLF at or after `from`; returns the index of `\r`.
fn find_crlf(buf: &[u8], from: usize) -> Option<usize> {
    buf[from..]
        .windows(2)
        .position(|w| w == CRLF_PAIR)
        .map(|p| p + from)
}

const CRLF_PAIR: &[u8] = b"\r\n";

fn line_str(buf: &[u8], start: usize, end: usize) -> ParseResult<&str> {
    std::str::from_utf8(&buf[start..end]).map_err(|_| ParseError::InvalidUtf8)
}

fn parse_line(
    buf: &[u8],
    build: impl FnOnce(String) -> RespValue,
) -> ParseResult<Option<(RespValue, usize)>> {
    match find_crlf(buf, 1) {
        Some(end) => {
            let s = line_str(buf, 1, end)?.to_string();
            Ok(Some((build(s), end + 2)))
        }
        None => Ok(None),
    }
}

fn parse_integer(buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
    match find_crlf(buf, 1) {
        Some(end) => {
            let s = line_str(buf, 1, end)?;
            let n: i64 = s
                .parse()
                .map_err(|_| ParseError::InvalidInteger(s.to_string()))?;
            Ok(Some((RespValue::Integer(n), end + 2)))
        }
        None => Ok(None),
    }
}

fn parse_bulk(buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
    let end = match find_crlf(buf, 1) {
        Some(end) => end,
        None => return Ok(None),
    };
    let s = line_str(buf, 1, end)?;
    let declared: i64 = s
        .parse()
        .map_err(|_| ParseError::InvalidInteger(s.to_string()))?;
    if declared == -1 {
        return Ok(Some((RespValue::Null, end + 2)));
    }
    if declared < 0 {
        return Err(ParseError::InvalidBulkLength(declared));
    }
    let len = declared as usize;
    if len > MAX_BULK_SIZE {
        return Err(ParseError::BulkTooLarge(len));
    }
    let data_start = end + 2;
    let total = data_start + len + 2;
    if buf.len() < total {
        return Ok(None);
    }
    let data = Bytes::copy_from_slice(&buf[data_start..data_start + len]);
    Ok(Some((RespValue::BulkString(data), total)))
}

fn parse_array(buf: &[u8], depth: usize) -> ParseResult<Option<(RespValue, usize)>> {
    let end = match find_crlf(buf, 1) {
        Some(end) => end,
        None => return Ok(None),
    };
    let s = line_str(buf, 1, end)?;
    let declared: i64 = s
        .parse()
        .map_err(|_| ParseError::InvalidInteger(s.to_string()))?;
    if declared == -1 {
        return Ok(Some((RespValue::Null, end + 2)));
    }
    if declared < 0 {
        return Err(ParseError::InvalidArrayLength(declared));
    }
    let mut elements = Vec::with_capacity(declared as usize);
    let mut at = end + 2;
    for _ in 0..declared {
        match parse_value(&buf[at..], depth + 1)? {
            Some((value, consumed)) => {
                elements.push(value);
                at += consumed;
            }
            None => return Ok(None),
        }
    }
    Ok(Some((RespValue::Array(elements), at)))
}

/// Inline commands: a bare line of whitespace-separated words, the form a
/// human types into a raw socket.
fn parse_inline(buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
    match find_crlf(buf, 0) {
        Some(end) => {
            let line = line_str(buf, 0, end)?;
            let parts = line
                .split_whitespace()
                .map(|w| RespValue::BulkString(Bytes::copy_from_slice(w.as_bytes())))
                .collect();
            Ok(Some((RespValue::Array(parts), end + 2)))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete(input: &[u8]) -> (RespValue, usize) {
        parse(input).unwrap().unwrap()
    }

    #[test]
    fn test_simple_string() {
        let (v, n) = complete(b"+OK\r\n");
        assert_eq!(v, RespValue::simple_string("OK"));
        assert_eq!(n, 5);
    }

    #[test]
    fn test_integer() {
        let (v, _) = complete(b":-42\r\n");
        assert_eq!(v, RespValue::integer(-42));
    }

    #[test]
    fn test_bulk_string() {
        let (v, n) = complete(b"$5\r\nhello\r\n");
        assert_eq!(v, RespValue::bulk_string(Bytes::from("hello")));
        assert_eq!(n, 11);
    }

    #[test]
    fn test_null_bulk() {
        let (v, _) = complete(b"$-1\r\n");
        assert_eq!(v, RespValue::Null);
    }

    #[test]
    fn test_command_array() {
        let (v, n) = complete(b"*2\r\n$3\r\nGET\r\n$4\r\nname\r\n");
        assert_eq!(
            v,
            RespValue::array(vec![
                RespValue::bulk_string(Bytes::from("GET")),
                RespValue::bulk_string(Bytes::from("name")),
            ])
        );
        assert_eq!(n, 23);
    }

    #[test]
    fn test_incomplete_returns_none() {
        assert_eq!(parse(b"$5\r\nhel").unwrap(), None);
        assert_eq!(parse(b"*2\r\n$3\r\nGET\r\n").unwrap(), None);
        assert_eq!(parse(b"+OK").unwrap(), None);
    }

    #[test]
    fn test_inline_command() {
        let (v, _) = complete(b"SET key value\r\n");
        if let RespValue::Array(parts) = v {
            assert_eq!(parts.len(), 3);
            assert_eq!(parts[0].as_str(), Some("SET"));
        } else {
            unreachable!();
        }
    }

    #[test]
    fn test_negative_bulk_length_rejected() {
        assert!(matches!(
            parse(b"$-2\r\nxx\r\n"),
            Err(ParseError::InvalidBulkLength(-2))
        ));
    }

    #[test]
    fn test_bad_integer_rejected() {
        assert!(matches!(
            parse(b":forty\r\n"),
            Err(ParseError::InvalidInteger(_))
        ));
    }

    #[test]
    fn test_pipelined_values_report_consumed() {
        let input = b"+OK\r\n:1\r\n";
        let (v, n) = complete(input);
        assert_eq!(v, RespValue::simple_string("OK"));
        let (v2, _) = complete(&input[n..]);
        assert_eq!(v2, RespValue::integer(1));
    }
}

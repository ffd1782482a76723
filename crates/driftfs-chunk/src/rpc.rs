//! RPC header codec
//!
//! Control RPCs are blocks of `Key: value` lines terminated by an empty
//! line, optionally followed by `Content-length` bytes of opaque body.
//! Two field dialects exist on the wire: the long format with descriptive
//! keys and decimal integers, and the short format with one/two letter
//! keys and hex integers. The dialect is negotiated per connection: the
//! first request after connect asks for short format, and the first reply
//! reveals which dialect the meta server speaks.

use driftfs_netio::IoBuffer;
use std::collections::HashMap;
use std::fmt::Write as _;

/// Upper bound on a single RPC header block. A connection buffering more
/// than this without a complete block is considered corrupt.
pub const MAX_RPC_HEADER_LEN: usize = 16 << 10;

/// Wire dialect for RPC headers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RpcFormat {
    /// Not yet negotiated; requests are serialized with long keys.
    #[default]
    Undef,
    /// One/two letter keys, hex integers.
    Short,
    /// Descriptive keys, decimal integers.
    Long,
}

impl RpcFormat {
    pub fn is_short(self) -> bool {
        matches!(self, RpcFormat::Short)
    }

    /// Pick the field key for this dialect.
    pub fn key<'a>(self, short: &'a str, long: &'a str) -> &'a str {
        if self.is_short() {
            short
        } else {
            long
        }
    }
}

/// Parsed header block: field name to raw value text.
#[derive(Debug)]
pub struct HeaderProps {
    fields: HashMap<String, String>,
    int_base: u32,
}

impl HeaderProps {
    /// Parse a header block. Lines without a `:` separator (such as the
    /// leading verb or status line) are skipped. `hex` selects the
    /// integer base used by the typed getters.
    pub fn parse(block: &[u8], hex: bool) -> Self {
        let mut fields = HashMap::new();
        for line in block.split(|&b| b == b'\n') {
            let line = match line.last() {
                Some(b'\r') => &line[..line.len() - 1],
                _ => line,
            };
            let Ok(line) = std::str::from_utf8(line) else {
                continue;
            };
            if let Some((key, value)) = line.split_once(':') {
                fields.insert(key.trim().to_string(), value.trim().to_string());
            }
        }
        Self {
            fields,
            int_base: if hex { 16 } else { 10 },
        }
    }

    /// Switch the typed getters to hex, used once the format probe
    /// discovers a short-format peer.
    pub fn set_int_base_hex(&mut self) {
        self.int_base = 16;
    }

    pub fn has(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    pub fn get_i64(&self, key: &str, default: i64) -> i64 {
        match self.fields.get(key) {
            Some(v) => parse_int(v, self.int_base).unwrap_or(default),
            None => default,
        }
    }

    pub fn get_i32(&self, key: &str, default: i32) -> i32 {
        self.get_i64(key, default as i64) as i32
    }

    pub fn get_u64(&self, key: &str, default: u64) -> u64 {
        match self.fields.get(key) {
            Some(v) => u64::from_str_radix(v.trim(), self.int_base).unwrap_or(default),
            None => default,
        }
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.fields.get(key) {
            Some(v) => parse_int(v, self.int_base).map(|n| n != 0).unwrap_or(default),
            None => default,
        }
    }

    /// Dialect-blind getters: try the short key, then the long one.
    /// Ops use these in `parse_response`, which runs before some ops
    /// learn which dialect the peer settled on.
    pub fn get2_u64(&self, short: &str, long: &str, default: u64) -> u64 {
        if self.has(short) {
            self.get_u64(short, default)
        } else {
            self.get_u64(long, default)
        }
    }

    pub fn get2_bool(&self, short: &str, long: &str, default: bool) -> bool {
        if self.has(short) {
            self.get_bool(short, default)
        } else {
            self.get_bool(long, default)
        }
    }

    /// Single-line rendering of every field, for diagnostics.
    pub fn joined(&self) -> String {
        let mut keys: Vec<&String> = self.fields.keys().collect();
        keys.sort_unstable();
        let mut out = String::new();
        for key in keys {
            if !out.is_empty() {
                out.push(' ');
            }
            let _ = write!(out, "{}:{}", key, self.fields[key]);
        }
        out
    }
}

fn parse_int(text: &str, base: u32) -> Option<i64> {
    let text = text.trim();
    match text.strip_prefix('-') {
        Some(rest) => i64::from_str_radix(rest, base).ok().map(|v| -v),
        None => i64::from_str_radix(text, base).ok(),
    }
}

/// Serializer for one header block.
///
/// Writes `Key: value` lines in the connection's dialect; `finish`
/// emits the blank-line terminator.
pub struct HeaderWriter<'a> {
    buf: &'a mut IoBuffer,
    fmt: RpcFormat,
}

impl<'a> HeaderWriter<'a> {
    pub fn new(buf: &'a mut IoBuffer, fmt: RpcFormat) -> Self {
        Self { buf, fmt }
    }

    /// Leading verb or status line, written as-is.
    pub fn verb(&mut self, verb: &str) -> &mut Self {
        let _ = write!(self.buf, "{verb}\r\n");
        self
    }

    pub fn field_i64(&mut self, short: &str, long: &str, value: i64) -> &mut Self {
        let key = self.fmt.key(short, long);
        if self.fmt.is_short() {
            if value < 0 {
                let _ = write!(self.buf, "{}: -{:x}\r\n", key, value.unsigned_abs());
            } else {
                let _ = write!(self.buf, "{key}: {value:x}\r\n");
            }
        } else {
            let _ = write!(self.buf, "{key}: {value}\r\n");
        }
        self
    }

    pub fn field_u64(&mut self, short: &str, long: &str, value: u64) -> &mut Self {
        let key = self.fmt.key(short, long);
        if self.fmt.is_short() {
            let _ = write!(self.buf, "{key}: {value:x}\r\n");
        } else {
            let _ = write!(self.buf, "{key}: {value}\r\n");
        }
        self
    }

    pub fn field_bool(&mut self, short: &str, long: &str, value: bool) -> &mut Self {
        self.field_i64(short, long, i64::from(value))
    }

    pub fn field_str(&mut self, short: &str, long: &str, value: &str) -> &mut Self {
        let key = self.fmt.key(short, long);
        let _ = write!(self.buf, "{key}: {value}\r\n");
        self
    }

    /// Terminate the block.
    pub fn finish(&mut self) {
        let _ = write!(self.buf, "\r\n");
    }
}

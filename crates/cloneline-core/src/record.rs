//! Flat-relation record codec
//!
//! Every persisted relation is a stream of newline-terminated,
//! comma-separated records. String fields are double-quoted with C-style
//! backslash escaping of quote, backslash, and control characters. Numeric
//! and hex fields are written bare.

use std::fmt;
use std::num::ParseIntError;

use crate::digest::ParseDigestError;

/// Token text longer than this is truncated for storage.
pub const MAX_STORED_TEXT: usize = 10 * 1024;

/// Bytes kept from each end of an oversized token text.
const TRUNC_KEEP: usize = 1000;

/// Joiner between the head and tail of a truncated token text.
const TRUNC_JOINER: &str = "......";

/// Error from decoding a record line.
#[derive(Debug)]
pub enum RecordError {
    UnterminatedString,
    BadEscape(String),
    FieldCount { expected: usize, got: usize },
    Int(ParseIntError),
    Digest(ParseDigestError),
    Malformed(String),
}

impl fmt::Display for RecordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnterminatedString => f.write_str("unterminated quoted field"),
            Self::BadEscape(s) => write!(f, "bad escape sequence: {s}"),
            Self::FieldCount { expected, got } => {
                write!(f, "expected {expected} fields, got {got}")
            }
            Self::Int(e) => write!(f, "bad integer field: {e}"),
            Self::Digest(e) => write!(f, "bad digest field: {e}"),
            Self::Malformed(s) => write!(f, "malformed record: {s}"),
        }
    }
}

impl std::error::Error for RecordError {}

impl From<ParseIntError> for RecordError {
    fn from(e: ParseIntError) -> Self {
        Self::Int(e)
    }
}

impl From<ParseDigestError> for RecordError {
    fn from(e: ParseDigestError) -> Self {
        Self::Digest(e)
    }
}

/// Escape a string field: surrounding double quotes, backslash escapes for
/// quote, backslash, and control characters.
pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 || c as u32 == 0x7f => {
                out.push_str(&format!("\\x{:02x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

fn unescape_into(s: &str, out: &mut String) -> Result<(), RecordError> {
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('x') => {
                let hi = chars.next();
                let lo = chars.next();
                let (Some(hi), Some(lo)) = (hi, lo) else {
                    return Err(RecordError::BadEscape("\\x".into()));
                };
                let code = hi
                    .to_digit(16)
                    .zip(lo.to_digit(16))
                    .map(|(h, l)| (h << 4) | l)
                    .ok_or_else(|| RecordError::BadEscape(format!("\\x{hi}{lo}")))?;
                out.push(char::from_u32(code).unwrap_or('\u{fffd}'));
            }
            other => {
                return Err(RecordError::BadEscape(format!(
                    "\\{}",
                    other.map(String::from).unwrap_or_default()
                )));
            }
        }
    }
    Ok(())
}

/// Split one record line into fields, honoring quoted strings.
pub fn split_fields(line: &str) -> Result<Vec<String>, RecordError> {
    let mut fields = Vec::new();
    let mut rest = line.trim_end_matches(['\n', '\r']);
    loop {
        if let Some(body) = rest.strip_prefix('"') {
            // Quoted field: scan for the closing unescaped quote.
            let mut end = None;
            let mut escaped = false;
            for (i, c) in body.char_indices() {
                if escaped {
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == '"' {
                    end = Some(i);
                    break;
                }
            }
            let end = end.ok_or(RecordError::UnterminatedString)?;
            let mut field = String::with_capacity(end);
            unescape_into(&body[..end], &mut field)?;
            fields.push(field);
            rest = &body[end + 1..];
            match rest.strip_prefix(',') {
                Some(r) => rest = r,
                None if rest.is_empty() => return Ok(fields),
                None => {
                    return Err(RecordError::Malformed(
                        "text after closing quote".to_string(),
                    ));
                }
            }
        } else {
            match rest.split_once(',') {
                Some((field, r)) => {
                    fields.push(field.to_string());
                    rest = r;
                }
                None => {
                    fields.push(rest.to_string());
                    return Ok(fields);
                }
            }
        }
    }
}

/// Truncate oversized token text for storage: first and last [`TRUNC_KEEP`]
/// bytes joined by `......`. Identity (the digest) always covers the full
/// text; only the stored form is shortened.
pub fn stored_text(text: &str) -> String {
    if text.len() <= MAX_STORED_TEXT {
        return text.to_string();
    }
    let head_end = floor_char_boundary(text, TRUNC_KEEP);
    let tail_start = ceil_char_boundary(text, text.len() - TRUNC_KEEP);
    let mut out = String::with_capacity(head_end + TRUNC_JOINER.len() + (text.len() - tail_start));
    out.push_str(&text[..head_end]);
    out.push_str(TRUNC_JOINER);
    out.push_str(&text[tail_start..]);
    out
}

fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    while !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn ceil_char_boundary(s: &str, mut idx: usize) -> usize {
    while idx < s.len() && !s.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}

/// Check a decoded record's field count.
pub fn expect_fields(fields: &[String], expected: usize) -> Result<(), RecordError> {
    if fields.len() == expected {
        Ok(())
    } else {
        Err(RecordError::FieldCount {
            expected,
            got: fields.len(),
        })
    }
}

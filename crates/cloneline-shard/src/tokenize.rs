//! Generic punctuation-splitting tokenizer
//!
//! The simplest of the lexer collaborators: identifier-ish runs
//! (`[A-Za-z0-9_$]+`) are tokens, everything else is separator. Good enough
//! for any curly-brace language; language-aware lexers plug in at the same
//! seam by producing the same [`TokenizerOutput`].

use crate::model::TokenFrequencyVector;

/// Everything the tokenizer derives from one file's raw bytes.
#[derive(Debug)]
pub struct TokenizerOutput {
    pub vector: TokenFrequencyVector,
    pub lines: u64,
    /// Non-blank lines.
    pub loc: u64,
    /// Non-blank lines that are not line comments.
    pub sloc: u64,
}

fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$'
}

/// Tokenize raw file bytes.
///
/// Invalid UTF-8 is replaced, not rejected: clone identity only needs the
/// replacement to be deterministic.
pub fn tokenize(source: &[u8]) -> TokenizerOutput {
    let text = String::from_utf8_lossy(source);

    let mut vector = TokenFrequencyVector::new();
    let mut start = None;
    let bytes = text.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        if is_token_byte(b) {
            start.get_or_insert(i);
        } else if let Some(s) = start.take() {
            vector.add(&text[s..i]);
        }
    }
    if let Some(s) = start {
        vector.add(&text[s..]);
    }

    let mut lines = 0u64;
    let mut loc = 0u64;
    let mut sloc = 0u64;
    for line in text.lines() {
        lines += 1;
        let trimmed = line.trim_start();
        if trimmed.is_empty() {
            continue;
        }
        loc += 1;
        if !trimmed.starts_with("//") && !trimmed.starts_with('#') {
            sloc += 1;
        }
    }

    TokenizerOutput {
        vector,
        lines,
        loc,
        sloc,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_punctuation() {
        let out = tokenize(b"for (i = 0; i < n; i++) { sum += a[i]; }");
        assert_eq!(out.vector.get("for"), Some(1));
        assert_eq!(out.vector.get("i"), Some(4));
        assert_eq!(out.vector.get("sum"), Some(1));
        assert_eq!(out.vector.get("0"), Some(1));
        assert_eq!(out.vector.get("("), None);
    }

    #[test]
    fn keeps_identifier_chars() {
        let out = tokenize(b"$scope my_var x9");
        assert_eq!(out.vector.get("$scope"), Some(1));
        assert_eq!(out.vector.get("my_var"), Some(1));
        assert_eq!(out.vector.get("x9"), Some(1));
    }

    #[test]
    fn counts_lines() {
        let src = b"a = 1\n\n// comment\nb = 2\n";
        let out = tokenize(src);
        assert_eq!(out.lines, 4);
        assert_eq!(out.loc, 3);
        assert_eq!(out.sloc, 2);
    }

    #[test]
    fn empty_input() {
        let out = tokenize(b"");
        assert!(out.vector.is_empty());
        assert_eq!(out.lines, 0);
    }

    #[test]
    fn token_at_end_of_input() {
        let out = tokenize(b"trailing");
        assert_eq!(out.vector.get("trailing"), Some(1));
    }

    #[test]
    fn identical_sources_share_sequence_hash() {
        let a = tokenize(b"let x = 1;\nlet y = x + 1;\n");
        let b = tokenize(b"let x = 1;\nlet y = x + 1;\n");
        assert_eq!(a.vector.sequence_hash(), b.vector.sequence_hash());
    }

    #[test]
    fn non_utf8_is_deterministic() {
        let a = tokenize(&[0x66, 0x6f, 0x6f, 0xff, 0x62, 0x61, 0x72]);
        let b = tokenize(&[0x66, 0x6f, 0x6f, 0xff, 0x62, 0x61, 0x72]);
        assert_eq!(a.vector.sequence_hash(), b.vector.sequence_hash());
        assert_eq!(a.vector.get("foo"), Some(1));
        assert_eq!(a.vector.get("bar"), Some(1));
    }
}

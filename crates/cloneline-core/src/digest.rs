//! 128-bit content digests (truncated blake3) with hex encoding
//!
//! Every identity in the corpus — file contents, token text, ordered
//! token-frequency vectors — is a [`Digest`]. Serialization is always the
//! documented hex form, never the in-memory layout.

use std::fmt;
use std::io;
use std::path::Path;
use std::str::FromStr;

/// Digest width in bytes (128 bits).
pub const DIGEST_LEN: usize = 16;

/// A 128-bit content digest: the first 16 bytes of a blake3 hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest([u8; DIGEST_LEN]);

impl Digest {
    /// Digest of a byte slice.
    pub fn of(data: &[u8]) -> Self {
        Self::from_blake3(blake3::hash(data))
    }

    /// Digest of a file's raw contents (memory-mapped for large files).
    pub fn of_file(path: &Path) -> io::Result<Self> {
        let mut hasher = blake3::Hasher::new();
        hasher.update_mmap(path)?;
        Ok(Self::from_blake3(hasher.finalize()))
    }

    pub fn from_bytes(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    /// Lowercase hex, always 32 characters.
    pub fn to_hex(&self) -> String {
        let mut s = String::with_capacity(DIGEST_LEN * 2);
        for b in self.0 {
            s.push(char::from_digit((b >> 4) as u32, 16).unwrap());
            s.push(char::from_digit((b & 0xf) as u32, 16).unwrap());
        }
        s
    }

    fn from_blake3(hash: blake3::Hash) -> Self {
        let mut out = [0u8; DIGEST_LEN];
        out.copy_from_slice(&hash.as_bytes()[..DIGEST_LEN]);
        Self(out)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

/// Error from parsing a hex digest field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseDigestError;

impl fmt::Display for ParseDigestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("invalid hex digest (expected 32 hex characters)")
    }
}

impl std::error::Error for ParseDigestError {}

impl FromStr for Digest {
    type Err = ParseDigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != DIGEST_LEN * 2 {
            return Err(ParseDigestError);
        }
        let mut out = [0u8; DIGEST_LEN];
        for (i, chunk) in s.as_bytes().chunks_exact(2).enumerate() {
            let hi = (chunk[0] as char).to_digit(16).ok_or(ParseDigestError)?;
            let lo = (chunk[1] as char).to_digit(16).ok_or(ParseDigestError)?;
            out[i] = ((hi << 4) | lo) as u8;
        }
        Ok(Self(out))
    }
}

/// Incremental digest over multiple updates.
///
/// Used for the token-sequence hash, which covers the ordered
/// `(text, count)` sequence of a file's frequency vector.
pub struct DigestBuilder {
    hasher: blake3::Hasher,
}

impl DigestBuilder {
    pub fn new() -> Self {
        Self {
            hasher: blake3::Hasher::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) -> &mut Self {
        self.hasher.update(data);
        self
    }

    pub fn finish(&self) -> Digest {
        Digest::from_blake3(self.hasher.finalize())
    }
}

impl Default for DigestBuilder {
    fn default() -> Self {
        Self::new()
    }
}

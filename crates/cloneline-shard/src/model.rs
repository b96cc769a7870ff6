//! Shard data model: projects, tokenized files, frequency vectors, groups

use std::sync::atomic::{AtomicUsize, Ordering};

use cloneline_core::digest::{Digest, DigestBuilder};
use rustc_hash::FxHashMap;

pub type ProjectId = u64;
pub type FileId = u64;
pub type TokenId = u32;

/// One source repository being ingested.
///
/// The pipeline owns the project until every derived file has been durably
/// recorded; the pending-file counter replaces the source system's manual
/// reference counting. Whoever observes the counter reach zero may release
/// the record (in practice: the last `Arc` clone is dropped).
#[derive(Debug)]
pub struct Project {
    pub id: ProjectId,
    pub url: String,
    /// Milliseconds since the Unix epoch.
    pub created_at: i64,
    pending_files: AtomicUsize,
}

impl Project {
    pub fn new(id: ProjectId, url: impl Into<String>, created_at: i64) -> Self {
        Self {
            id,
            url: url.into(),
            created_at,
            pending_files: AtomicUsize::new(0),
        }
    }

    /// Register one derived file awaiting its write acknowledgment.
    pub fn add_file(&self) {
        self.pending_files.fetch_add(1, Ordering::Relaxed);
    }

    /// Acknowledge one file write. Returns true when this was the last
    /// outstanding file, i.e. the project is fully recorded.
    pub fn file_written(&self) -> bool {
        self.pending_files.fetch_sub(1, Ordering::AcqRel) == 1
    }

    pub fn pending_files(&self) -> usize {
        self.pending_files.load(Ordering::Relaxed)
    }
}

/// One source file inside a project, as handed over by the tokenizer.
///
/// The interner assigns `clone_group_id` and rewrites the token vector
/// against the shard vocabulary; nothing else mutates this record.
#[derive(Debug, Clone)]
pub struct TokenizedFile {
    pub id: FileId,
    pub project_id: ProjectId,
    pub relative_path: String,
    /// Digest of the raw file bytes.
    pub content_hash: Digest,
    /// Digest of the ordered token-frequency vector; stable across shards.
    pub token_sequence_hash: Digest,
    pub total_tokens: u64,
    pub unique_tokens: u64,
    pub bytes: u64,
    pub lines: u64,
    pub loc: u64,
    pub sloc: u64,
    /// Milliseconds since the Unix epoch.
    pub created_at: i64,
    /// Absent while this file is the unique representative of its
    /// token-sequence hash.
    pub clone_group_id: Option<FileId>,
}

/// Raw-text token-frequency vector for one file.
///
/// Ephemeral: owned by the file only until the interner translates it to
/// global token ids, after which the text mapping is discarded.
#[derive(Debug, Default, Clone)]
pub struct TokenFrequencyVector {
    counts: FxHashMap<String, u64>,
}

impl TokenFrequencyVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, token: &str) {
        match self.counts.get_mut(token) {
            Some(n) => *n += 1,
            None => {
                self.counts.insert(token.to_string(), 1);
            }
        }
    }

    /// Distinct token texts.
    pub fn unique(&self) -> usize {
        self.counts.len()
    }

    /// Sum of all occurrence counts.
    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn get(&self, token: &str) -> Option<u64> {
        self.counts.get(token).copied()
    }

    /// Entries in text order — the canonical ordering every shard agrees
    /// on, independent of insertion order or map seed.
    pub fn iter_ordered(&self) -> impl Iterator<Item = (&str, u64)> {
        let mut entries: Vec<(&str, u64)> =
            self.counts.iter().map(|(t, &c)| (t.as_str(), c)).collect();
        entries.sort_unstable_by(|a, b| a.0.cmp(b.0));
        entries.into_iter()
    }

    /// Digest of the ordered `(text, count)` sequence.
    ///
    /// Computed over raw text, never token ids, so two shards that interned
    /// the same file independently produce the same hash.
    pub fn sequence_hash(&self) -> Digest {
        let mut b = DigestBuilder::new();
        for (text, count) in self.iter_ordered() {
            b.update(&(text.len() as u64).to_le_bytes());
            b.update(text.as_bytes());
            b.update(&count.to_le_bytes());
        }
        b.finish()
    }

    pub fn into_counts(self) -> FxHashMap<String, u64> {
        self.counts
    }
}

/// A set of files sharing one token-sequence hash.
///
/// The group id is the file id of the first file that created the group and
/// never changes; the oldest member is updated as files join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloneGroup {
    pub id: FileId,
    pub oldest_member: FileId,
    pub oldest_created_at: i64,
    pub members: u64,
}

impl CloneGroup {
    pub fn new(file: &TokenizedFile) -> Self {
        Self {
            id: file.id,
            oldest_member: file.id,
            oldest_created_at: file.created_at,
            members: 1,
        }
    }

    /// Add a member, keeping the oldest by creation time. Equal timestamps
    /// break deterministically toward the lower file id so merges stay
    /// associative.
    pub fn join(&mut self, file: &TokenizedFile) {
        self.members += 1;
        if (file.created_at, file.id) < (self.oldest_created_at, self.oldest_member) {
            self.oldest_member = file.id;
            self.oldest_created_at = file.created_at;
        }
    }
}

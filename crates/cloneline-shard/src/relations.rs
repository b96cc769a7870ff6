//! Per-shard persisted relations
//!
//! Seven newline-terminated record streams per shard directory. Writers
//! buffer through a `.tmp` file and atomically rename on finalize so a
//! half-written shard is never mistaken for a finished one.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use cloneline_core::digest::Digest;
use cloneline_core::record;

use crate::model::{FileId, ProjectId, TokenId, TokenizedFile};

/// Separator between the fixed fields and the token vector in a
/// tokenized-files record.
pub const VECTOR_SEPARATOR: &str = "@#@";

/// Separator inside one `tokenId@@::@@count` vector entry.
pub const COUNT_SEPARATOR: &str = "@@::@@";

/// The relations a finished shard consists of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Relation {
    TokenText,
    TokenUses,
    TokenizedFiles,
    FileStats,
    ClonePairs,
    CloneGroups,
    FileTimes,
}

impl Relation {
    pub fn file_name(self) -> &'static str {
        match self {
            Self::TokenText => "token-text.csv",
            Self::TokenUses => "token-uses.csv",
            Self::TokenizedFiles => "tokenized-files.csv",
            Self::FileStats => "file-stats.csv",
            Self::ClonePairs => "clone-pairs.csv",
            Self::CloneGroups => "clone-groups.csv",
            Self::FileTimes => "file-times.csv",
        }
    }

    pub fn path(self, shard_dir: &Path) -> PathBuf {
        shard_dir.join(self.file_name())
    }

    pub fn all() -> &'static [Relation] {
        &[
            Self::TokenText,
            Self::TokenUses,
            Self::TokenizedFiles,
            Self::FileStats,
            Self::ClonePairs,
            Self::CloneGroups,
            Self::FileTimes,
        ]
    }
}

/// Directory name for a leaf shard or a merged shard range.
pub fn shard_dir_name(first: u32, second: u32) -> String {
    if first == second {
        format!("shard_{first:04}")
    } else {
        format!("shard_{first:04}_{second:04}")
    }
}

/// A finished shard has every relation present in its final name.
pub fn shard_is_complete(dir: &Path) -> bool {
    Relation::all().iter().all(|r| r.path(dir).exists())
}

/// Buffered writer for one relation with atomic tmp→rename finalize.
pub struct RelationWriter {
    inner: BufWriter<File>,
    tmp_path: PathBuf,
    final_path: PathBuf,
    rows: usize,
}

impl RelationWriter {
    pub fn create(shard_dir: &Path, relation: Relation) -> io::Result<Self> {
        let final_path = relation.path(shard_dir);
        let tmp_path = final_path.with_extension("csv.tmp");
        if tmp_path.exists() {
            fs::remove_file(&tmp_path)?;
        }
        Ok(Self {
            inner: BufWriter::new(File::create(&tmp_path)?),
            tmp_path,
            final_path,
            rows: 0,
        })
    }

    pub fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.inner.write_all(line.as_bytes())?;
        self.inner.write_all(b"\n")?;
        self.rows += 1;
        Ok(())
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Flush and atomically rename tmp → final.
    pub fn finalize(mut self) -> io::Result<usize> {
        self.inner.flush()?;
        fs::rename(&self.tmp_path, &self.final_path)?;
        Ok(self.rows)
    }
}

/// Remove stale `.tmp` relation files left by an interrupted run.
pub fn cleanup_tmp_files(shard_dir: &Path) -> io::Result<()> {
    for entry in fs::read_dir(shard_dir)? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "tmp") {
            log::warn!("Removing stale tmp file: {}", path.display());
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

// Row encoders. One function per relation keeps the formats in one place;
// the readers in `reader` are their inverses.

pub fn token_text_row(id: TokenId, text: &str) -> String {
    token_text_row_parts(
        id,
        text.len() as u64,
        &Digest::of(text.as_bytes()),
        &record::stored_text(text),
    )
}

/// Encode a token-text row from already-derived parts. The hash and byte
/// length always describe the full text even when `stored` is truncated.
pub fn token_text_row_parts(id: TokenId, byte_len: u64, hash: &Digest, stored: &str) -> String {
    format!("{id},{byte_len},{},{}", hash.to_hex(), record::escape(stored))
}

pub fn token_uses_row(id: TokenId, uses: u64) -> String {
    format!("{id},{uses}")
}

pub fn tokenized_file_row(file: &TokenizedFile, vector: &[(TokenId, u64)]) -> String {
    tokenized_file_row_parts(
        file.project_id,
        file.id,
        file.total_tokens,
        file.unique_tokens,
        &file.token_sequence_hash,
        vector,
    )
}

pub fn tokenized_file_row_parts(
    project_id: ProjectId,
    file_id: FileId,
    total_tokens: u64,
    unique_tokens: u64,
    sequence_hash: &Digest,
    vector: &[(TokenId, u64)],
) -> String {
    let mut row = format!(
        "{project_id},{file_id},{total_tokens},{unique_tokens},{},{VECTOR_SEPARATOR}",
        sequence_hash.to_hex()
    );
    for (id, count) in vector {
        row.push(',');
        row.push_str(&format!("{id}{COUNT_SEPARATOR}{count}"));
    }
    row
}

pub fn file_stats_row(file: &TokenizedFile) -> String {
    format!(
        "{},{},{},{},{},{},{},{}",
        file.content_hash.to_hex(),
        file.bytes,
        file.lines,
        file.loc,
        file.sloc,
        file.total_tokens,
        file.unique_tokens,
        file.token_sequence_hash.to_hex()
    )
}

pub fn clone_pair_row(file_id: FileId, group_id: FileId) -> String {
    format!("{file_id},{group_id}")
}

pub fn clone_group_row(group_id: FileId, oldest_member: FileId) -> String {
    format!("{group_id},{oldest_member}")
}

pub fn file_time_row(file_id: FileId, created_at: i64) -> String {
    format!("{file_id},{created_at}")
}

/// All relation writers of one shard under production, each behind its own
/// lock so unrelated relations never serialize on each other.
pub struct ShardWriters {
    pub token_text: Mutex<RelationWriter>,
    pub token_uses: Mutex<RelationWriter>,
    pub tokenized_files: Mutex<RelationWriter>,
    pub file_stats: Mutex<RelationWriter>,
    pub clone_pairs: Mutex<RelationWriter>,
    pub clone_groups: Mutex<RelationWriter>,
    pub file_times: Mutex<RelationWriter>,
}

/// Row counts of a finalized shard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShardRowCounts {
    pub tokens: usize,
    pub files: usize,
    pub stats: usize,
    pub clone_pairs: usize,
    pub clone_groups: usize,
}

impl ShardWriters {
    pub fn create(shard_dir: &Path) -> io::Result<Self> {
        fs::create_dir_all(shard_dir)?;
        Ok(Self {
            token_text: Mutex::new(RelationWriter::create(shard_dir, Relation::TokenText)?),
            token_uses: Mutex::new(RelationWriter::create(shard_dir, Relation::TokenUses)?),
            tokenized_files: Mutex::new(RelationWriter::create(
                shard_dir,
                Relation::TokenizedFiles,
            )?),
            file_stats: Mutex::new(RelationWriter::create(shard_dir, Relation::FileStats)?),
            clone_pairs: Mutex::new(RelationWriter::create(shard_dir, Relation::ClonePairs)?),
            clone_groups: Mutex::new(RelationWriter::create(shard_dir, Relation::CloneGroups)?),
            file_times: Mutex::new(RelationWriter::create(shard_dir, Relation::FileTimes)?),
        })
    }

    /// Finalize every relation. The shard is complete only once all seven
    /// renames have happened.
    pub fn finalize(self) -> io::Result<ShardRowCounts> {
        let tokens = self.token_text.into_inner().unwrap().finalize()?;
        let uses = self.token_uses.into_inner().unwrap().finalize()?;
        debug_assert_eq!(tokens, uses);
        let files = self.tokenized_files.into_inner().unwrap().finalize()?;
        let stats = self.file_stats.into_inner().unwrap().finalize()?;
        let clone_pairs = self.clone_pairs.into_inner().unwrap().finalize()?;
        let clone_groups = self.clone_groups.into_inner().unwrap().finalize()?;
        self.file_times.into_inner().unwrap().finalize()?;
        Ok(ShardRowCounts {
            tokens,
            files,
            stats,
            clone_pairs,
            clone_groups,
        })
    }
}

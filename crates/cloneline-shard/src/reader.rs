//! Line-oriented readers for the persisted shard relations
//!
//! Each reader streams typed records from one relation file; the merge
//! stage consumes shards exclusively through these.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Lines};
use std::marker::PhantomData;
use std::path::Path;

use cloneline_core::digest::Digest;
use cloneline_core::record::{self, RecordError};

use crate::error::ShardError;
use crate::model::{FileId, ProjectId, TokenId};
use crate::relations::{self, COUNT_SEPARATOR, Relation, VECTOR_SEPARATOR};

/// One row of the token-text relation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenTextRecord {
    pub id: TokenId,
    pub byte_len: u64,
    pub hash: Digest,
    /// Stored (possibly truncated) text.
    pub text: String,
}

/// One row of the token-uses relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenUsesRecord {
    pub id: TokenId,
    pub uses: u64,
}

/// One row of the tokenized-files relation (representative files only).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub project_id: ProjectId,
    pub file_id: FileId,
    pub total_tokens: u64,
    pub unique_tokens: u64,
    pub sequence_hash: Digest,
    pub vector: Vec<(TokenId, u64)>,
}

/// One row of the file-stats relation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStatsRecord {
    pub content_hash: Digest,
    pub bytes: u64,
    pub lines: u64,
    pub loc: u64,
    pub sloc: u64,
    pub total_tokens: u64,
    pub unique_tokens: u64,
    pub sequence_hash: Digest,
}

/// One row of the clone-pairs relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClonePairRecord {
    pub file_id: FileId,
    pub group_id: FileId,
}

/// One row of the clone-groups relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloneGroupRecord {
    pub group_id: FileId,
    pub oldest_member: FileId,
}

/// One row of the file-times relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileTimeRecord {
    pub file_id: FileId,
    pub created_at: i64,
}

/// Decode one record line into a typed record.
pub trait FromLine: Sized {
    const RELATION: Relation;
    fn from_line(line: &str) -> Result<Self, RecordError>;
}

// Re-encoders, used by the merge stage to emit records it read (possibly
// with rewritten ids) without re-deriving hashes from truncated text.

impl TokenTextRecord {
    pub fn to_row(&self) -> String {
        relations::token_text_row_parts(self.id, self.byte_len, &self.hash, &self.text)
    }
}

impl TokenUsesRecord {
    pub fn to_row(&self) -> String {
        relations::token_uses_row(self.id, self.uses)
    }
}

impl FileRecord {
    pub fn to_row(&self) -> String {
        relations::tokenized_file_row_parts(
            self.project_id,
            self.file_id,
            self.total_tokens,
            self.unique_tokens,
            &self.sequence_hash,
            &self.vector,
        )
    }
}

impl FileStatsRecord {
    pub fn to_row(&self) -> String {
        format!(
            "{},{},{},{},{},{},{},{}",
            self.content_hash.to_hex(),
            self.bytes,
            self.lines,
            self.loc,
            self.sloc,
            self.total_tokens,
            self.unique_tokens,
            self.sequence_hash.to_hex()
        )
    }
}

impl FromLine for TokenTextRecord {
    const RELATION: Relation = Relation::TokenText;

    fn from_line(line: &str) -> Result<Self, RecordError> {
        let fields = record::split_fields(line)?;
        record::expect_fields(&fields, 4)?;
        Ok(Self {
            id: fields[0].parse()?,
            byte_len: fields[1].parse()?,
            hash: fields[2].parse()?,
            text: fields[3].clone(),
        })
    }
}

impl FromLine for TokenUsesRecord {
    const RELATION: Relation = Relation::TokenUses;

    fn from_line(line: &str) -> Result<Self, RecordError> {
        let fields = record::split_fields(line)?;
        record::expect_fields(&fields, 2)?;
        Ok(Self {
            id: fields[0].parse()?,
            uses: fields[1].parse()?,
        })
    }
}

impl FromLine for FileRecord {
    const RELATION: Relation = Relation::TokenizedFiles;

    fn from_line(line: &str) -> Result<Self, RecordError> {
        let fields = record::split_fields(line)?;
        if fields.len() < 6 || fields[5] != VECTOR_SEPARATOR {
            return Err(RecordError::Malformed(format!(
                "expected `{VECTOR_SEPARATOR}` marker in tokenized-files record"
            )));
        }
        let mut vector = Vec::with_capacity(fields.len() - 6);
        for entry in &fields[6..] {
            let (id, count) = entry.split_once(COUNT_SEPARATOR).ok_or_else(|| {
                RecordError::Malformed(format!("bad token-vector entry: {entry}"))
            })?;
            vector.push((id.parse()?, count.parse()?));
        }
        Ok(Self {
            project_id: fields[0].parse()?,
            file_id: fields[1].parse()?,
            total_tokens: fields[2].parse()?,
            unique_tokens: fields[3].parse()?,
            sequence_hash: fields[4].parse()?,
            vector,
        })
    }
}

impl FromLine for FileStatsRecord {
    const RELATION: Relation = Relation::FileStats;

    fn from_line(line: &str) -> Result<Self, RecordError> {
        let fields = record::split_fields(line)?;
        record::expect_fields(&fields, 8)?;
        Ok(Self {
            content_hash: fields[0].parse()?,
            bytes: fields[1].parse()?,
            lines: fields[2].parse()?,
            loc: fields[3].parse()?,
            sloc: fields[4].parse()?,
            total_tokens: fields[5].parse()?,
            unique_tokens: fields[6].parse()?,
            sequence_hash: fields[7].parse()?,
        })
    }
}

impl FromLine for ClonePairRecord {
    const RELATION: Relation = Relation::ClonePairs;

    fn from_line(line: &str) -> Result<Self, RecordError> {
        let fields = record::split_fields(line)?;
        record::expect_fields(&fields, 2)?;
        Ok(Self {
            file_id: fields[0].parse()?,
            group_id: fields[1].parse()?,
        })
    }
}

impl FromLine for CloneGroupRecord {
    const RELATION: Relation = Relation::CloneGroups;

    fn from_line(line: &str) -> Result<Self, RecordError> {
        let fields = record::split_fields(line)?;
        record::expect_fields(&fields, 2)?;
        Ok(Self {
            group_id: fields[0].parse()?,
            oldest_member: fields[1].parse()?,
        })
    }
}

impl FromLine for FileTimeRecord {
    const RELATION: Relation = Relation::FileTimes;

    fn from_line(line: &str) -> Result<Self, RecordError> {
        let fields = record::split_fields(line)?;
        record::expect_fields(&fields, 2)?;
        Ok(Self {
            file_id: fields[0].parse()?,
            created_at: fields[1].parse()?,
        })
    }
}

/// Streaming reader over one relation file.
pub struct RelationReader<R> {
    lines: Lines<BufReader<File>>,
    line_no: usize,
    _marker: PhantomData<R>,
}

impl<R: FromLine> RelationReader<R> {
    /// Open the relation under `shard_dir`.
    pub fn open(shard_dir: &Path) -> io::Result<Self> {
        let file = File::open(R::RELATION.path(shard_dir))?;
        Ok(Self {
            lines: BufReader::new(file).lines(),
            line_no: 0,
            _marker: PhantomData,
        })
    }
}

impl<R: FromLine> Iterator for RelationReader<R> {
    type Item = Result<R, ShardError>;

    fn next(&mut self) -> Option<Self::Item> {
        let line = match self.lines.next()? {
            Ok(line) => line,
            Err(e) => return Some(Err(ShardError::Io(e))),
        };
        self.line_no += 1;
        if line.is_empty() {
            return self.next();
        }
        Some(R::from_line(&line).map_err(|source| ShardError::Record {
            line: self.line_no,
            source,
        }))
    }
}

/// Collect a whole relation into memory (small relations, tests).
pub fn read_all<R: FromLine>(shard_dir: &Path) -> Result<Vec<R>, ShardError> {
    RelationReader::<R>::open(shard_dir)
        .map_err(ShardError::Io)?
        .collect()
}

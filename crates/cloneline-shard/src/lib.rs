//! Cloneline Shard - Per-shard interning and deduplication engine
//!
//! A shard is one independently-produced partition of the corpus. This
//! crate owns the shard data model, the tokenizer collaborator, the
//! interner that assigns token ids and forms clone groups while the shard
//! streams in, and the flat-relation readers/writers of the shard output.

pub mod error;
pub mod interner;
pub mod model;
pub mod reader;
pub mod relations;
pub mod tokenize;

pub use error::ShardError;
pub use interner::{InternOutcome, ShardInterner, ShardSummary};
pub use model::{
    CloneGroup, FileId, Project, ProjectId, TokenFrequencyVector, TokenId, TokenizedFile,
};
pub use relations::{Relation, RelationWriter, ShardWriters, shard_dir_name};
pub use tokenize::{TokenizerOutput, tokenize};

//! Cloneline Merge - Combining finished shards
//!
//! Two finalized shard results merge into one equally valid shard result:
//! vocabularies unify, use counts sum, representative files dedup across
//! the shard boundary, and clone groups union. The combination is
//! associative, so a whole corpus assembles through a binary merge tree
//! instead of a full re-scan whenever a shard completes.

pub mod error;
pub mod merger;
pub mod tree;

pub use error::MergeError;
pub use merger::{CreatedAtLookup, FileTimes, MergeStats, merge_shards};
pub use tree::{
    Evaluation, LeafState, MergeRunner, MergeScheduler, MergeTree, NodeState, ShardCatalog,
    ShardRange,
};

//! End-to-end merge tests over real shard directories
//!
//! Shards are produced through the interner exactly as ingestion produces
//! them, merged on disk, and compared through a semantic view (token uses
//! by hash, representative hashes, group member sets with their oldest
//! member) so group-id renumbering never causes false failures.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use cloneline_core::digest::Digest;
use cloneline_merge::{FileTimes, merge_shards};
use cloneline_shard::model::FileId;
use cloneline_shard::reader::{
    CloneGroupRecord, ClonePairRecord, FileRecord, FileStatsRecord, TokenTextRecord,
    TokenUsesRecord, read_all,
};
use cloneline_shard::{ShardInterner, TokenizedFile, tokenize};

/// Run files through the interner to produce a finished shard.
fn build_shard(dir: &Path, files: &[(FileId, i64, &str)]) {
    let interner = ShardInterner::create(dir).unwrap();
    for &(id, created_at, text) in files {
        let out = tokenize(text.as_bytes());
        let mut file = TokenizedFile {
            id,
            project_id: 1,
            relative_path: format!("f{id}.js"),
            content_hash: Digest::of(text.as_bytes()),
            token_sequence_hash: out.vector.sequence_hash(),
            total_tokens: out.vector.total(),
            unique_tokens: out.vector.unique() as u64,
            bytes: text.len() as u64,
            lines: out.lines,
            loc: out.loc,
            sloc: out.sloc,
            created_at,
            clone_group_id: None,
        };
        interner.intern_file(&mut file, out.vector).unwrap();
    }
    interner.close().unwrap();
}

/// Renumbering-insensitive summary of a shard directory.
#[derive(Debug, PartialEq, Eq)]
struct View {
    /// Token hash → summed use count.
    uses: BTreeMap<Digest, u64>,
    /// Sequence hashes with a persisted representative.
    representatives: BTreeSet<Digest>,
    /// Clone classes: member set → oldest member.
    groups: BTreeMap<BTreeSet<FileId>, FileId>,
    stats_rows: usize,
}

fn view(dir: &Path) -> View {
    let texts: Vec<TokenTextRecord> = read_all(dir).unwrap();
    let by_id: BTreeMap<_, _> = texts.iter().map(|t| (t.id, t.hash)).collect();
    assert_eq!(by_id.len(), texts.len(), "duplicate token ids");
    let hashes: BTreeSet<_> = texts.iter().map(|t| t.hash).collect();
    assert_eq!(hashes.len(), texts.len(), "duplicate token hashes");

    let mut uses = BTreeMap::new();
    for rec in read_all::<TokenUsesRecord>(dir).unwrap() {
        let prev = uses.insert(by_id[&rec.id], rec.uses);
        assert!(prev.is_none(), "token {} listed twice in uses", rec.id);
    }

    let mut representatives = BTreeSet::new();
    for rec in read_all::<FileRecord>(dir).unwrap() {
        assert!(
            representatives.insert(rec.sequence_hash),
            "two representatives for one sequence hash"
        );
    }

    let mut members: BTreeMap<FileId, BTreeSet<FileId>> = BTreeMap::new();
    let mut assigned = BTreeSet::new();
    for rec in read_all::<ClonePairRecord>(dir).unwrap() {
        if rec.file_id != rec.group_id {
            assert!(
                assigned.insert(rec.file_id),
                "file {} belongs to two groups",
                rec.file_id
            );
        }
        members.entry(rec.group_id).or_default().insert(rec.file_id);
    }
    let mut groups = BTreeMap::new();
    for rec in read_all::<CloneGroupRecord>(dir).unwrap() {
        let set = members
            .remove(&rec.group_id)
            .expect("group without any pair rows");
        groups.insert(set, rec.oldest_member);
    }
    assert!(members.is_empty(), "pair rows reference unknown groups");

    let stats_rows = read_all::<FileStatsRecord>(dir).unwrap().len();
    View {
        uses,
        representatives,
        groups,
        stats_rows,
    }
}

#[test]
fn identical_files_across_two_shards_form_one_group() {
    let tmp = tempfile::tempdir().unwrap();
    let (a, b, out) = (
        tmp.path().join("shard_0000"),
        tmp.path().join("shard_0001"),
        tmp.path().join("shard_0000_0001"),
    );
    build_shard(&a, &[(1, 200, "fn main"), (2, 100, "fn main")]);
    build_shard(&b, &[(11, 300, "fn main"), (12, 400, "fn main")]);

    let times = FileTimes::load(&[a.as_path(), b.as_path()]).unwrap();
    let stats = merge_shards(&a, &b, &out, &times).unwrap();

    let v = view(&out);
    // One vocabulary entry per distinct token, summed uses.
    assert_eq!(v.uses.len(), 2);
    assert!(v.uses.values().all(|&u| u == 4));
    assert_eq!(stats.shared_tokens, 2);
    // One representative row for the shared sequence hash.
    assert_eq!(v.representatives.len(), 1);
    assert_eq!(stats.cross_shard_duplicates, 1);
    // All four files in one group, oldest by creation time.
    let all: BTreeSet<FileId> = [1, 2, 11, 12].into();
    assert_eq!(v.groups, BTreeMap::from([(all, 2)]));
    // Stats stay per-shard: one content-hash row from each input.
    assert_eq!(v.stats_rows, 2);
}

#[test]
fn unique_left_file_joins_a_right_group() {
    let tmp = tempfile::tempdir().unwrap();
    let (a, b, out) = (
        tmp.path().join("shard_0000"),
        tmp.path().join("shard_0001"),
        tmp.path().join("shard_0000_0001"),
    );
    build_shard(&a, &[(1, 500, "let x = 1")]);
    build_shard(&b, &[(11, 300, "let x = 1"), (12, 400, "let x = 1")]);

    let times = FileTimes::load(&[a.as_path(), b.as_path()]).unwrap();
    let stats = merge_shards(&a, &b, &out, &times).unwrap();

    let v = view(&out);
    assert_eq!(stats.files_promoted, 1);
    let all: BTreeSet<FileId> = [1, 11, 12].into();
    assert_eq!(v.groups, BTreeMap::from([(all, 11)]));
    assert_eq!(v.representatives.len(), 1);
}

#[test]
fn two_unique_files_become_a_new_group() {
    let tmp = tempfile::tempdir().unwrap();
    let (a, b, out) = (
        tmp.path().join("shard_0000"),
        tmp.path().join("shard_0001"),
        tmp.path().join("shard_0000_0001"),
    );
    build_shard(&a, &[(1, 100, "return 0")]);
    build_shard(&b, &[(11, 50, "return 0")]);

    let times = FileTimes::load(&[a.as_path(), b.as_path()]).unwrap();
    let stats = merge_shards(&a, &b, &out, &times).unwrap();

    let v = view(&out);
    assert_eq!(stats.groups_created, 1);
    let all: BTreeSet<FileId> = [1, 11].into();
    assert_eq!(v.groups, BTreeMap::from([(all, 11)]));
}

#[test]
fn disjoint_shards_concatenate() {
    let tmp = tempfile::tempdir().unwrap();
    let (a, b, out) = (
        tmp.path().join("shard_0000"),
        tmp.path().join("shard_0001"),
        tmp.path().join("shard_0000_0001"),
    );
    build_shard(&a, &[(1, 100, "alpha beta")]);
    build_shard(&b, &[(11, 200, "gamma delta")]);

    let times = FileTimes::load(&[a.as_path(), b.as_path()]).unwrap();
    let stats = merge_shards(&a, &b, &out, &times).unwrap();

    let v = view(&out);
    assert_eq!(v.uses.len(), 4);
    assert_eq!(v.representatives.len(), 2);
    assert!(v.groups.is_empty());
    assert_eq!(stats.shared_tokens, 0);
    assert_eq!(stats.cross_shard_duplicates, 0);
}

#[test]
fn merge_order_does_not_change_the_result() {
    let tmp = tempfile::tempdir().unwrap();
    let dirs: Vec<_> = (0..3)
        .map(|i| tmp.path().join(format!("shard_{i:04}")))
        .collect();
    // Overlapping clone classes spread across three shards.
    let t1 = "alpha beta";
    let t2 = "beta gamma";
    let t3 = "alpha alpha";
    build_shard(&dirs[0], &[(1, 100, t1), (2, 200, t1), (3, 300, t2)]);
    build_shard(&dirs[1], &[(11, 50, t1), (12, 250, t3)]);
    build_shard(&dirs[2], &[(21, 10, t2), (22, 20, t3), (23, 30, t1)]);

    let refs: Vec<&Path> = dirs.iter().map(|d| d.as_path()).collect();
    let times = FileTimes::load(&refs).unwrap();

    // ((0+1)+2)
    let ab = tmp.path().join("left_ab");
    let ab_c = tmp.path().join("left_ab_c");
    merge_shards(&dirs[0], &dirs[1], &ab, &times).unwrap();
    merge_shards(&ab, &dirs[2], &ab_c, &times).unwrap();

    // (0+(1+2))
    let bc = tmp.path().join("right_bc");
    let a_bc = tmp.path().join("right_a_bc");
    merge_shards(&dirs[1], &dirs[2], &bc, &times).unwrap();
    merge_shards(&dirs[0], &bc, &a_bc, &times).unwrap();

    let left = view(&ab_c);
    assert_eq!(left, view(&a_bc));

    // Sanity on the common result itself.
    let g1: BTreeSet<FileId> = [1, 2, 11, 23].into();
    let g2: BTreeSet<FileId> = [3, 21].into();
    let g3: BTreeSet<FileId> = [12, 22].into();
    assert_eq!(
        left.groups,
        BTreeMap::from([(g1, 23), (g2, 21), (g3, 22)])
    );
    assert_eq!(left.representatives.len(), 3);
    // Every token occurrence of every file is still counted.
    let total: u64 = left.uses.values().sum();
    assert_eq!(total, 16);
}

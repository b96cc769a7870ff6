//! Merging two finalized shard results into one
//!
//! Five linear passes, one per derived relation, with in-memory translation
//! tables bounded by the smaller shard: vocabulary unification, use-count
//! summation, representative-file dedup, clone-pair renumbering, and
//! clone-group union. Stats and file-times are carried through. Inputs are
//! never mutated; the output is a new shard directory that later merges
//! treat exactly like a leaf shard.
//!
//! Every id and hash present in either input appears in the output exactly
//! once, and the operation is associative up to group-id renumbering.

use std::path::Path;

use cloneline_core::digest::Digest;
use cloneline_shard::model::{FileId, TokenId};
use cloneline_shard::reader::{
    CloneGroupRecord, ClonePairRecord, FileRecord, FileStatsRecord, FileTimeRecord,
    RelationReader, TokenTextRecord, TokenUsesRecord,
};
use cloneline_shard::relations::{self, ShardWriters};
use rustc_hash::FxHashMap;

use crate::error::MergeError;

/// Creation-timestamp lookup keyed by file id.
///
/// The merge's only external dependency: resolving a cross-shard oldest
/// member needs the creation time of files it only knows by id.
pub trait CreatedAtLookup {
    fn created_at(&self, file: FileId) -> Result<i64, MergeError>;
}

/// In-memory lookup backed by the file-times relations of the input shards.
#[derive(Debug, Default)]
pub struct FileTimes {
    map: FxHashMap<FileId, i64>,
}

impl FileTimes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load file-times from every given shard directory.
    pub fn load(shard_dirs: &[&Path]) -> Result<Self, MergeError> {
        let mut map = FxHashMap::default();
        for dir in shard_dirs {
            for rec in RelationReader::<FileTimeRecord>::open(dir)? {
                let rec = rec?;
                map.insert(rec.file_id, rec.created_at);
            }
        }
        Ok(Self { map })
    }

    pub fn insert(&mut self, file: FileId, created_at: i64) {
        self.map.insert(file, created_at);
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl CreatedAtLookup for FileTimes {
    fn created_at(&self, file: FileId) -> Result<i64, MergeError> {
        self.map
            .get(&file)
            .copied()
            .ok_or(MergeError::MissingCreatedAt(file))
    }
}

/// What one merge produced, for the run summary.
#[derive(Debug, Default, Clone, Copy)]
pub struct MergeStats {
    pub vocabulary: usize,
    pub shared_tokens: usize,
    pub files: usize,
    pub cross_shard_duplicates: usize,
    pub clone_pairs: usize,
    pub clone_groups: usize,
    pub groups_unioned: usize,
    pub files_promoted: usize,
    pub groups_created: usize,
}

impl MergeStats {
    pub fn log(&self, label: &str) {
        log::info!(
            "{label}: {} tokens ({} shared), {} files ({} cross-shard dups), \
             {} groups ({} unioned, {} promoted, {} new)",
            self.vocabulary,
            self.shared_tokens,
            self.files,
            self.cross_shard_duplicates,
            self.clone_groups,
            self.groups_unioned,
            self.files_promoted,
            self.groups_created
        );
    }
}

/// What step 4 decided about one right-side clone group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GroupAction {
    /// The right group is the same clone class as this left group.
    MergeInto(FileId),
    /// This previously-unique left file joins the right group.
    Promote(FileId),
}

/// Merge two finalized shards into `out_dir`.
///
/// Both inputs must be complete; the output becomes complete atomically
/// (every relation is finalized via tmp→rename).
pub fn merge_shards(
    left: &Path,
    right: &Path,
    out_dir: &Path,
    times: &impl CreatedAtLookup,
) -> Result<MergeStats, MergeError> {
    let writers = ShardWriters::create(out_dir)?;
    let mut stats = MergeStats::default();

    let (translation, left_vocab_len) = merge_vocabulary(left, right, &writers, &mut stats)?;
    merge_uses(left, right, &writers, &translation, left_vocab_len)?;
    let duplicates = merge_files(left, right, &writers, &translation, &mut stats)?;
    let outcome = merge_clone_pairs(left, right, &writers, duplicates, &mut stats)?;
    merge_clone_groups(left, right, &writers, &outcome, times)?;
    merge_carried(left, right, &writers)?;

    let counts = writers.finalize()?;
    stats.clone_pairs = counts.clone_pairs;
    stats.clone_groups = counts.clone_groups;
    Ok(stats)
}

/// Step 1: unify vocabularies.
///
/// Left ids stream through unchanged; right tokens either translate to an
/// existing id or continue left's dense id space. Returns the right→output
/// translation table and left's vocabulary size.
fn merge_vocabulary(
    left: &Path,
    right: &Path,
    writers: &ShardWriters,
    stats: &mut MergeStats,
) -> Result<(FxHashMap<TokenId, TokenId>, u32), MergeError> {
    let mut out = writers.token_text.lock().unwrap();
    let mut ids: FxHashMap<Digest, TokenId> = FxHashMap::default();

    for rec in RelationReader::<TokenTextRecord>::open(left)? {
        let rec = rec?;
        if ids.insert(rec.hash, rec.id).is_some() {
            return Err(MergeError::Corrupt(format!(
                "left vocabulary has duplicate hash {}",
                rec.hash
            )));
        }
        out.write_line(&rec.to_row())?;
    }
    let left_vocab_len = ids.len() as u32;

    let mut translation: FxHashMap<TokenId, TokenId> = FxHashMap::default();
    let mut next_id = left_vocab_len;
    for rec in RelationReader::<TokenTextRecord>::open(right)? {
        let mut rec = rec?;
        match ids.get(&rec.hash) {
            Some(&existing) => {
                translation.insert(rec.id, existing);
                stats.shared_tokens += 1;
            }
            None => {
                translation.insert(rec.id, next_id);
                rec.id = next_id;
                out.write_line(&rec.to_row())?;
                next_id += 1;
            }
        }
    }
    stats.vocabulary = next_id as usize;
    Ok((translation, left_vocab_len))
}

/// Step 2: sum use counts.
///
/// Right entries translating into left's id space are buffered and added
/// during the left pass; right entries with new ids are emitted directly.
fn merge_uses(
    left: &Path,
    right: &Path,
    writers: &ShardWriters,
    translation: &FxHashMap<TokenId, TokenId>,
    left_vocab_len: u32,
) -> Result<(), MergeError> {
    let mut out = writers.token_uses.lock().unwrap();
    let mut buffered: FxHashMap<TokenId, u64> = FxHashMap::default();

    for rec in RelationReader::<TokenUsesRecord>::open(right)? {
        let rec = rec?;
        let id = *translation
            .get(&rec.id)
            .ok_or_else(|| MergeError::Corrupt(format!("right uses id {} not in vocabulary", rec.id)))?;
        if id >= left_vocab_len {
            out.write_line(&relations::token_uses_row(id, rec.uses))?;
        } else if buffered.insert(id, rec.uses).is_some() {
            return Err(MergeError::Corrupt(format!("right uses id {id} appears twice")));
        }
    }

    for rec in RelationReader::<TokenUsesRecord>::open(left)? {
        let rec = rec?;
        let uses = rec.uses + buffered.remove(&rec.id).unwrap_or(0);
        out.write_line(&relations::token_uses_row(rec.id, uses))?;
    }

    if !buffered.is_empty() {
        return Err(MergeError::Corrupt(
            "right uses reference tokens absent from left uses".to_string(),
        ));
    }
    Ok(())
}

/// Step 3: dedup representative files across the shard boundary.
///
/// Returns the duplicates table: right representative → the left file that
/// already represents its sequence hash.
fn merge_files(
    left: &Path,
    right: &Path,
    writers: &ShardWriters,
    translation: &FxHashMap<TokenId, TokenId>,
    stats: &mut MergeStats,
) -> Result<FxHashMap<FileId, FileId>, MergeError> {
    let mut out = writers.tokenized_files.lock().unwrap();
    let mut reps: FxHashMap<Digest, FileId> = FxHashMap::default();
    let mut duplicates: FxHashMap<FileId, FileId> = FxHashMap::default();

    for rec in RelationReader::<FileRecord>::open(left)? {
        let rec = rec?;
        if reps.insert(rec.sequence_hash, rec.file_id).is_some() {
            return Err(MergeError::Corrupt(format!(
                "left shard has two representatives for hash {}",
                rec.sequence_hash
            )));
        }
        out.write_line(&rec.to_row())?;
    }

    for rec in RelationReader::<FileRecord>::open(right)? {
        let mut rec = rec?;
        match reps.get(&rec.sequence_hash) {
            Some(&left_file) => {
                duplicates.insert(rec.file_id, left_file);
                stats.cross_shard_duplicates += 1;
            }
            None => {
                for (id, _) in &mut rec.vector {
                    *id = *translation.get(id).ok_or_else(|| {
                        MergeError::Corrupt(format!("file vector id {id} not in vocabulary"))
                    })?;
                }
                rec.vector.sort_unstable_by_key(|&(id, _)| id);
                reps.insert(rec.sequence_hash, rec.file_id);
                out.write_line(&rec.to_row())?;
            }
        }
    }
    stats.files = reps.len();
    Ok(duplicates)
}

/// Everything step 4 learned that step 5 needs.
struct PairOutcome {
    /// Per right-group decision.
    actions: FxHashMap<FileId, GroupAction>,
    /// Left group ← right file that joined it (leftover duplicates).
    joined_left: Vec<(FileId, FileId)>,
    /// Brand-new groups: (group id = right file, left file member).
    created: Vec<(FileId, FileId)>,
}

/// Step 4: renumber clone pairs and discover group unions.
///
/// Left pairs stream through unchanged. Right groups are inspected against
/// the duplicates table: a group whose deduped member maps onto a left
/// clone-class member is the same group; one mapping onto a unique left
/// file pulls that file in; leftover duplicate entries pair two
/// previously-unique files into a brand-new group.
fn merge_clone_pairs(
    left: &Path,
    right: &Path,
    writers: &ShardWriters,
    mut duplicates: FxHashMap<FileId, FileId>,
    stats: &mut MergeStats,
) -> Result<PairOutcome, MergeError> {
    let mut out = writers.clone_pairs.lock().unwrap();

    // Left pairs pass: emit unchanged, remember every member's group.
    // Self-pairs put group ids in the map too, so "is this left file part
    // of a clone class" is one lookup.
    let mut left_member_group: FxHashMap<FileId, FileId> = FxHashMap::default();
    for rec in RelationReader::<ClonePairRecord>::open(left)? {
        let rec = rec?;
        left_member_group.insert(rec.file_id, rec.group_id);
        out.write_line(&relations::clone_pair_row(rec.file_id, rec.group_id))?;
    }

    // Right pass A: decide one action per implicated right group. At most
    // one member of a right group carries a duplicates entry (only the
    // group's representative file appears in the right files relation).
    let mut actions: FxHashMap<FileId, GroupAction> = FxHashMap::default();
    for rec in RelationReader::<ClonePairRecord>::open(right)? {
        let rec = rec?;
        if actions.contains_key(&rec.group_id) {
            continue;
        }
        let hit = duplicates
            .remove(&rec.group_id)
            .or_else(|| duplicates.remove(&rec.file_id));
        if let Some(left_file) = hit {
            let action = match left_member_group.get(&left_file) {
                Some(&left_group) => GroupAction::MergeInto(left_group),
                None => GroupAction::Promote(left_file),
            };
            actions.insert(rec.group_id, action);
        }
    }

    // Promoted left files join their right group.
    let mut promoted: Vec<(FileId, FileId)> = actions
        .iter()
        .filter_map(|(&g, &a)| match a {
            GroupAction::Promote(l) => Some((l, g)),
            GroupAction::MergeInto(_) => None,
        })
        .collect();
    promoted.sort_unstable();
    for (left_file, group) in &promoted {
        out.write_line(&relations::clone_pair_row(*left_file, *group))?;
    }

    // Right pass B: emit every right pair under its resolved group id.
    for rec in RelationReader::<ClonePairRecord>::open(right)? {
        let rec = rec?;
        let group_id = match actions.get(&rec.group_id) {
            Some(GroupAction::MergeInto(left_group)) => *left_group,
            _ => rec.group_id,
        };
        out.write_line(&relations::clone_pair_row(rec.file_id, group_id))?;
    }

    // Leftover duplicates: right files outside any right group that match
    // a left file.
    let mut leftovers: Vec<(FileId, FileId)> = duplicates.drain().collect();
    leftovers.sort_unstable();
    let mut joined_left = Vec::new();
    let mut created = Vec::new();
    for (right_file, left_file) in leftovers {
        match left_member_group.get(&left_file) {
            Some(&left_group) => {
                // The right file joins an existing left group.
                out.write_line(&relations::clone_pair_row(right_file, left_group))?;
                joined_left.push((left_group, right_file));
            }
            None => {
                // Two previously-unique files: synthesize a group under the
                // right file's id.
                out.write_line(&relations::clone_pair_row(left_file, right_file))?;
                out.write_line(&relations::clone_pair_row(right_file, right_file))?;
                created.push((right_file, left_file));
            }
        }
    }

    stats.groups_unioned = actions
        .values()
        .filter(|a| matches!(a, GroupAction::MergeInto(_)))
        .count();
    stats.files_promoted = promoted.len();
    stats.groups_created = created.len();
    Ok(PairOutcome {
        actions,
        joined_left,
        created,
    })
}

/// Step 5: emit the merged clone-groups relation.
///
/// Unaffected groups pass through with their own oldest member; implicated
/// groups resolve a combined oldest through the creation-time lookup.
fn merge_clone_groups(
    left: &Path,
    right: &Path,
    writers: &ShardWriters,
    outcome: &PairOutcome,
    times: &impl CreatedAtLookup,
) -> Result<(), MergeError> {
    let mut out = writers.clone_groups.lock().unwrap();

    let mut right_oldest: FxHashMap<FileId, FileId> = FxHashMap::default();
    let mut right_groups: Vec<CloneGroupRecord> = Vec::new();
    for rec in RelationReader::<CloneGroupRecord>::open(right)? {
        let rec = rec?;
        right_oldest.insert(rec.group_id, rec.oldest_member);
        right_groups.push(rec);
    }

    // Extra oldest-member candidates per left group id.
    let mut extra: FxHashMap<FileId, Vec<FileId>> = FxHashMap::default();
    for (&right_group, action) in &outcome.actions {
        if let GroupAction::MergeInto(left_group) = *action {
            let oldest = *right_oldest.get(&right_group).ok_or_else(|| {
                MergeError::Corrupt(format!("right group {right_group} has no group record"))
            })?;
            extra.entry(left_group).or_default().push(oldest);
        }
    }
    for &(left_group, right_file) in &outcome.joined_left {
        extra.entry(left_group).or_default().push(right_file);
    }

    for rec in RelationReader::<CloneGroupRecord>::open(left)? {
        let rec = rec?;
        let oldest = match extra.remove(&rec.group_id) {
            None => rec.oldest_member,
            Some(mut candidates) => {
                candidates.push(rec.oldest_member);
                resolve_oldest(times, &candidates)?
            }
        };
        out.write_line(&relations::clone_group_row(rec.group_id, oldest))?;
    }
    if !extra.is_empty() {
        return Err(MergeError::Corrupt(
            "pair merge references left groups absent from clone-groups".to_string(),
        ));
    }

    for rec in right_groups {
        match outcome.actions.get(&rec.group_id) {
            Some(GroupAction::MergeInto(_)) => {} // absorbed into a left group
            Some(GroupAction::Promote(left_file)) => {
                let oldest = resolve_oldest(times, &[rec.oldest_member, *left_file])?;
                out.write_line(&relations::clone_group_row(rec.group_id, oldest))?;
            }
            None => {
                out.write_line(&relations::clone_group_row(rec.group_id, rec.oldest_member))?;
            }
        }
    }

    for &(group_id, left_file) in &outcome.created {
        let oldest = resolve_oldest(times, &[group_id, left_file])?;
        out.write_line(&relations::clone_group_row(group_id, oldest))?;
    }
    Ok(())
}

/// Carried relations: stats and file-times stream through from both sides.
fn merge_carried(left: &Path, right: &Path, writers: &ShardWriters) -> Result<(), MergeError> {
    let mut stats_out = writers.file_stats.lock().unwrap();
    for dir in [left, right] {
        for rec in RelationReader::<FileStatsRecord>::open(dir)? {
            stats_out.write_line(&rec?.to_row())?;
        }
    }
    let mut times_out = writers.file_times.lock().unwrap();
    for dir in [left, right] {
        for rec in RelationReader::<FileTimeRecord>::open(dir)? {
            let rec = rec?;
            times_out.write_line(&relations::file_time_row(rec.file_id, rec.created_at))?;
        }
    }
    Ok(())
}

/// Oldest of the candidate files by creation time; equal timestamps break
/// toward the lower file id, keeping merge results order-independent.
fn resolve_oldest(
    times: &impl CreatedAtLookup,
    candidates: &[FileId],
) -> Result<FileId, MergeError> {
    let mut best: Option<(i64, FileId)> = None;
    for &id in candidates {
        let at = times.created_at(id)?;
        if best.is_none_or(|b| (at, id) < b) {
            best = Some((at, id));
        }
    }
    best.map(|(_, id)| id)
        .ok_or_else(|| MergeError::Corrupt("no oldest-member candidates".to_string()))
}

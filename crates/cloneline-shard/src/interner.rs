//! Per-shard interning and deduplication engine
//!
//! One `ShardInterner` accepts tokenized files from any number of worker
//! threads, assigns dense token ids against the shard vocabulary, detects
//! exact duplicates by token-sequence hash, and forms clone groups.
//! Vocabulary, content-hash set, and clone-group table are guarded by
//! separate locks so unrelated files do not serialize on each other, and
//! no lock is ever held across an output write.
//!
//! The Open → Closed state machine is encoded in ownership: `close`
//! consumes the interner, so interning after close or closing twice does
//! not compile.

use std::path::Path;
use std::sync::Mutex;

use cloneline_core::digest::Digest;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::error::ShardError;
use crate::model::{CloneGroup, FileId, TokenFrequencyVector, TokenId, TokenizedFile};
use crate::relations::{self, ShardRowCounts, ShardWriters};

/// What `intern_file` decided about one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InternOutcome {
    /// True when this file is the unique representative of its
    /// token-sequence hash (so far) and its vector was persisted.
    pub representative: bool,
    /// Tokens first seen in this file.
    pub new_tokens: usize,
    /// True when this content hash had not been seen in the shard.
    pub new_content: bool,
}

/// Totals reported by `close`.
#[derive(Debug, Clone, Copy)]
pub struct ShardSummary {
    pub files: usize,
    pub representatives: usize,
    pub vocabulary_size: usize,
    pub clone_groups: usize,
    pub clone_pairs: usize,
}

impl ShardSummary {
    pub fn log(&self, label: &str) {
        log::info!(
            "{label}: {} files ({} representatives), {} tokens, {} groups / {} pairs",
            self.files,
            self.representatives,
            self.vocabulary_size,
            self.clone_groups,
            self.clone_pairs
        );
    }
}

#[derive(Default)]
struct Vocabulary {
    ids: FxHashMap<Digest, TokenId>,
    uses: Vec<u64>,
}

#[derive(Default)]
struct FileTally {
    files: usize,
    representatives: usize,
}

/// Per-shard interning state. All operations are safe to call concurrently.
pub struct ShardInterner {
    writers: ShardWriters,
    vocab: Mutex<Vocabulary>,
    contents: Mutex<FxHashSet<Digest>>,
    groups: Mutex<FxHashMap<Digest, CloneGroup>>,
    tally: Mutex<FileTally>,
}

impl ShardInterner {
    /// Open a new shard writing its relations under `shard_dir`.
    pub fn create(shard_dir: &Path) -> Result<Self, ShardError> {
        Ok(Self {
            writers: ShardWriters::create(shard_dir)?,
            vocab: Mutex::new(Vocabulary::default()),
            contents: Mutex::new(FxHashSet::default()),
            groups: Mutex::new(FxHashMap::default()),
            tally: Mutex::new(FileTally::default()),
        })
    }

    /// Intern one tokenized file, consuming its raw-text vector.
    ///
    /// Assigns token ids, records first-sight vocabulary rows, emits the
    /// per-content stats row once per distinct content hash, and either
    /// persists the file as the representative of its sequence hash or
    /// records it as a clone pair.
    pub fn intern_file(
        &self,
        file: &mut TokenizedFile,
        vector: TokenFrequencyVector,
    ) -> Result<InternOutcome, ShardError> {
        let new_content = self.contents.lock().unwrap().insert(file.content_hash);

        let (translated, new_tokens) = self.translate(vector)?;

        // Clone detection: first file of a hash is the representative and
        // keeps `clone_group_id` absent; later files join its group.
        let group_id = {
            let mut groups = self.groups.lock().unwrap();
            match groups.get_mut(&file.token_sequence_hash) {
                None => {
                    groups.insert(file.token_sequence_hash, CloneGroup::new(file));
                    None
                }
                Some(group) => {
                    group.join(file);
                    Some(group.id)
                }
            }
        };
        file.clone_group_id = group_id;

        if new_content {
            self.writers
                .file_stats
                .lock()
                .unwrap()
                .write_line(&relations::file_stats_row(file))?;
        }
        self.writers
            .file_times
            .lock()
            .unwrap()
            .write_line(&relations::file_time_row(file.id, file.created_at))?;
        match group_id {
            None => {
                self.writers
                    .tokenized_files
                    .lock()
                    .unwrap()
                    .write_line(&relations::tokenized_file_row(file, &translated))?;
            }
            Some(group_id) => {
                self.writers
                    .clone_pairs
                    .lock()
                    .unwrap()
                    .write_line(&relations::clone_pair_row(file.id, group_id))?;
            }
        }

        let mut tally = self.tally.lock().unwrap();
        tally.files += 1;
        if group_id.is_none() {
            tally.representatives += 1;
        }
        drop(tally);

        Ok(InternOutcome {
            representative: group_id.is_none(),
            new_tokens,
            new_content,
        })
    }

    /// Translate a raw-text vector to `(token id, count)` pairs, assigning
    /// fresh dense ids on first sight. Vocabulary rows for new tokens are
    /// written after the lock is released; their order in the output is
    /// immaterial, their uniqueness is guaranteed by the id assignment.
    fn translate(
        &self,
        vector: TokenFrequencyVector,
    ) -> Result<(Vec<(TokenId, u64)>, usize), ShardError> {
        let mut translated = Vec::with_capacity(vector.unique());
        let mut first_seen: Vec<(TokenId, String)> = Vec::new();
        {
            let mut vocab = self.vocab.lock().unwrap();
            for (text, count) in vector.iter_ordered() {
                let hash = Digest::of(text.as_bytes());
                let id = match vocab.ids.get(&hash) {
                    Some(&id) => id,
                    None => {
                        let id = vocab.uses.len() as TokenId;
                        vocab.ids.insert(hash, id);
                        vocab.uses.push(0);
                        first_seen.push((id, text.to_string()));
                        id
                    }
                };
                vocab.uses[id as usize] += count;
                translated.push((id, count));
            }
        }
        if !first_seen.is_empty() {
            let mut out = self.writers.token_text.lock().unwrap();
            for (id, text) in &first_seen {
                out.write_line(&relations::token_text_row(*id, text))?;
            }
        }
        translated.sort_unstable_by_key(|&(id, _)| id);
        Ok((translated, first_seen.len()))
    }

    /// Close the shard: flush the token-uses table, the clone-group table,
    /// and the per-group self-pairs, then finalize every relation.
    ///
    /// A group is only real once a second file joined it — a unique file is
    /// its own representative and is not flushed as a single-member group.
    pub fn close(self) -> Result<ShardSummary, ShardError> {
        let vocab = self.vocab.into_inner().unwrap();
        {
            let mut out = self.writers.token_uses.lock().unwrap();
            for (id, uses) in vocab.uses.iter().enumerate() {
                out.write_line(&relations::token_uses_row(id as TokenId, *uses))?;
            }
        }

        let groups = self.groups.into_inner().unwrap();
        let mut flushed_groups = 0usize;
        {
            let mut pairs = self.writers.clone_pairs.lock().unwrap();
            let mut out = self.writers.clone_groups.lock().unwrap();
            let mut real: Vec<&CloneGroup> =
                groups.values().filter(|g| g.members > 1).collect();
            real.sort_unstable_by_key(|g| g.id);
            for group in real {
                pairs.write_line(&relations::clone_pair_row(group.id, group.id))?;
                out.write_line(&relations::clone_group_row(group.id, group.oldest_member))?;
                flushed_groups += 1;
            }
        }

        let tally = self.tally.into_inner().unwrap();
        let counts: ShardRowCounts = self.writers.finalize()?;
        Ok(ShardSummary {
            files: tally.files,
            representatives: tally.representatives,
            vocabulary_size: vocab.uses.len(),
            clone_groups: flushed_groups,
            clone_pairs: counts.clone_pairs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::{
        ClonePairRecord, CloneGroupRecord, FileRecord, FileStatsRecord, TokenTextRecord,
        TokenUsesRecord, read_all,
    };
    use crate::tokenize::tokenize;

    fn intern_source(
        interner: &ShardInterner,
        id: FileId,
        created_at: i64,
        source: &[u8],
    ) -> TokenizedFile {
        let out = tokenize(source);
        let mut file = TokenizedFile {
            id,
            project_id: 1,
            relative_path: format!("f{id}.js"),
            content_hash: Digest::of(source),
            token_sequence_hash: out.vector.sequence_hash(),
            total_tokens: out.vector.total(),
            unique_tokens: out.vector.unique() as u64,
            bytes: source.len() as u64,
            lines: out.lines,
            loc: out.loc,
            sloc: out.sloc,
            created_at,
            clone_group_id: None,
        };
        interner.intern_file(&mut file, out.vector).unwrap();
        file
    }

    #[test]
    fn assigns_dense_token_ids_from_zero() {
        let dir = tempfile::tempdir().unwrap();
        let interner = ShardInterner::create(dir.path()).unwrap();
        intern_source(&interner, 0, 10, b"alpha beta");
        intern_source(&interner, 1, 20, b"beta gamma");
        let summary = interner.close().unwrap();
        assert_eq!(summary.vocabulary_size, 3);

        let mut tokens = read_all::<TokenTextRecord>(dir.path()).unwrap();
        tokens.sort_by_key(|t| t.id);
        assert_eq!(tokens.len(), 3);
        assert_eq!(
            tokens.iter().map(|t| t.id).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        // Each distinct text appears exactly once.
        let texts: std::collections::HashSet<_> =
            tokens.iter().map(|t| t.text.clone()).collect();
        assert_eq!(texts.len(), 3);
    }

    #[test]
    fn sums_uses_across_files() {
        let dir = tempfile::tempdir().unwrap();
        let interner = ShardInterner::create(dir.path()).unwrap();
        intern_source(&interner, 0, 10, b"x x y");
        intern_source(&interner, 1, 20, b"x z");
        interner.close().unwrap();

        let tokens = read_all::<TokenTextRecord>(dir.path()).unwrap();
        let uses = read_all::<TokenUsesRecord>(dir.path()).unwrap();
        let x_id = tokens.iter().find(|t| t.text == "x").unwrap().id;
        let x_uses = uses.iter().find(|u| u.id == x_id).unwrap().uses;
        assert_eq!(x_uses, 3);
        assert_eq!(uses.len(), tokens.len());
    }

    #[test]
    fn duplicate_files_form_one_group() {
        let dir = tempfile::tempdir().unwrap();
        let interner = ShardInterner::create(dir.path()).unwrap();
        let src = b"function f() { return 1; }";
        let a = intern_source(&interner, 0, 100, src);
        let b = intern_source(&interner, 1, 50, src);
        let c = intern_source(&interner, 2, 200, src);
        assert_eq!(a.clone_group_id, None);
        assert_eq!(b.clone_group_id, Some(0));
        assert_eq!(c.clone_group_id, Some(0));
        let summary = interner.close().unwrap();
        assert_eq!(summary.representatives, 1);
        assert_eq!(summary.clone_groups, 1);

        // Only the representative's vector is persisted.
        let files = read_all::<FileRecord>(dir.path()).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].file_id, 0);

        // Pairs: two members plus the group self-pair.
        let mut pairs = read_all::<ClonePairRecord>(dir.path()).unwrap();
        pairs.sort_by_key(|p| p.file_id);
        assert_eq!(
            pairs,
            vec![
                ClonePairRecord { file_id: 0, group_id: 0 },
                ClonePairRecord { file_id: 1, group_id: 0 },
                ClonePairRecord { file_id: 2, group_id: 0 },
            ]
        );

        // Oldest member is the file with the earliest created_at.
        let groups = read_all::<CloneGroupRecord>(dir.path()).unwrap();
        assert_eq!(groups, vec![CloneGroupRecord { group_id: 0, oldest_member: 1 }]);
    }

    #[test]
    fn unique_file_is_not_a_group() {
        let dir = tempfile::tempdir().unwrap();
        let interner = ShardInterner::create(dir.path()).unwrap();
        intern_source(&interner, 0, 10, b"only one of these");
        let summary = interner.close().unwrap();
        assert_eq!(summary.clone_groups, 0);
        assert!(read_all::<CloneGroupRecord>(dir.path()).unwrap().is_empty());
        assert!(read_all::<ClonePairRecord>(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn stats_written_once_per_content_hash() {
        let dir = tempfile::tempdir().unwrap();
        let interner = ShardInterner::create(dir.path()).unwrap();
        let src = b"same bytes";
        intern_source(&interner, 0, 10, src);
        intern_source(&interner, 1, 20, src);
        intern_source(&interner, 2, 30, b"different bytes");
        interner.close().unwrap();
        let stats = read_all::<FileStatsRecord>(dir.path()).unwrap();
        assert_eq!(stats.len(), 2);
    }

    #[test]
    fn concurrent_interning_is_consistent() {
        use std::sync::Arc;
        let dir = tempfile::tempdir().unwrap();
        let interner = Arc::new(ShardInterner::create(dir.path()).unwrap());

        let mut handles = Vec::new();
        for t in 0..4u64 {
            let interner = Arc::clone(&interner);
            handles.push(std::thread::spawn(move || {
                for i in 0..25u64 {
                    let id = t * 25 + i;
                    // Half the files share one body, half are distinct.
                    let source = if id % 2 == 0 {
                        b"shared clone body here".to_vec()
                    } else {
                        format!("unique body number {id}").into_bytes()
                    };
                    let out = tokenize(&source);
                    let mut file = TokenizedFile {
                        id,
                        project_id: t,
                        relative_path: format!("f{id}.js"),
                        content_hash: Digest::of(&source),
                        token_sequence_hash: out.vector.sequence_hash(),
                        total_tokens: out.vector.total(),
                        unique_tokens: out.vector.unique() as u64,
                        bytes: source.len() as u64,
                        lines: out.lines,
                        loc: out.loc,
                        sloc: out.sloc,
                        created_at: id as i64,
                        clone_group_id: None,
                    };
                    interner.intern_file(&mut file, out.vector).unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let interner = Arc::try_unwrap(interner).ok().expect("sole owner");
        let summary = interner.close().unwrap();
        assert_eq!(summary.files, 100);
        // 50 shared-body files form one group with one representative.
        assert_eq!(summary.representatives, 51);
        assert_eq!(summary.clone_groups, 1);

        // Token ids are dense and unique.
        let mut tokens = read_all::<TokenTextRecord>(dir.path()).unwrap();
        tokens.sort_by_key(|t| t.id);
        for (expect, token) in tokens.iter().enumerate() {
            assert_eq!(token.id as usize, expect);
        }
    }
}

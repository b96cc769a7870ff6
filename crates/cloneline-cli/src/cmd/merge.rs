//! Merge subcommand - fold finished shards into one result via the merge tree

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Args;
use indicatif::ProgressBar;

use cloneline_core::{
    BoundedWorkQueue, DEFAULT_QUEUE_CAPACITY, JobError, PipelineStage, SharedProgress,
    StatsReporter,
};
use cloneline_merge::{
    FileTimes, LeafState, MergeError, MergeRunner, MergeScheduler, NodeState, ShardCatalog,
    ShardRange, merge_shards,
};
use cloneline_shard::relations::{shard_dir_name, shard_is_complete};

use crate::config::Config;

#[derive(Args, Debug)]
pub struct MergeArgs {
    /// Directory holding shard_NNNN results
    #[arg(short, long)]
    pub input: Option<PathBuf>,

    /// Number of leaf shards (default: discovered from directory names)
    #[arg(short, long)]
    pub shards: Option<u32>,

    /// Number of merge workers
    #[arg(short, long)]
    pub workers: Option<usize>,
}

/// Leaf states straight from the filesystem: a shard exists once every
/// relation file is present under its final name.
struct DirCatalog {
    root: PathBuf,
}

impl ShardCatalog for DirCatalog {
    fn leaf_state(&self, shard: u32) -> LeafState {
        if shard_is_complete(&self.root.join(shard_dir_name(shard, shard))) {
            LeafState::Done
        } else {
            LeafState::NotAvailable
        }
    }
}

/// Runs pairwise merges on disk, skipping outputs that already exist.
struct DiskRunner {
    root: PathBuf,
    times: FileTimes,
    bar: ProgressBar,
}

impl DiskRunner {
    fn dir(&self, range: ShardRange) -> PathBuf {
        self.root.join(shard_dir_name(range.0, range.1))
    }
}

impl MergeRunner for DiskRunner {
    fn run(&self, left: ShardRange, right: ShardRange, out: ShardRange) -> Result<(), MergeError> {
        let out_dir = self.dir(out);
        if shard_is_complete(&out_dir) {
            log::debug!("{} already merged, skipping", out_dir.display());
            self.bar.inc(1);
            return Ok(());
        }
        let stats = merge_shards(&self.dir(left), &self.dir(right), &out_dir, &self.times)?;
        stats.log(&shard_dir_name(out.0, out.1));
        self.bar.inc(1);
        Ok(())
    }
}

pub fn run(args: MergeArgs, config: &Config, progress: &SharedProgress) -> Result<()> {
    let root = args
        .input
        .unwrap_or_else(|| config.output.default_dir.clone());
    let workers = args
        .workers
        .unwrap_or(config.workers.default)
        .min(config.workers.max)
        .max(1);

    let count = match args.shards {
        Some(n) if n > 0 => n,
        Some(_) => bail!("--shards must be positive"),
        None => discover_shard_count(&root)?,
    };
    let range = (0, count - 1);
    log::info!(
        "Merging {count} shards under {} with {workers} workers",
        root.display()
    );
    if count == 1 {
        log::info!("Single shard, nothing to merge");
        return Ok(());
    }

    let catalog = DirCatalog { root: root.clone() };
    let missing: Vec<u32> = (0..count)
        .filter(|&s| catalog.leaf_state(s) == LeafState::NotAvailable)
        .collect();
    if !missing.is_empty() {
        bail!(
            "{} of {count} shards incomplete (first missing: {})",
            missing.len(),
            shard_dir_name(missing[0], missing[0])
        );
    }

    let leaf_dirs: Vec<PathBuf> = (0..count)
        .map(|s| root.join(shard_dir_name(s, s)))
        .collect();
    let leaf_refs: Vec<&Path> = leaf_dirs.iter().map(|d| d.as_path()).collect();
    let times = FileTimes::load(&leaf_refs).context("Failed to load file creation times")?;
    log::debug!("Loaded creation times for {} files", times.len());

    let bar = progress.counter_bar("merge", (count - 1) as u64);
    let queue: Arc<BoundedWorkQueue<ShardRange>> =
        Arc::new(BoundedWorkQueue::new("merge", DEFAULT_QUEUE_CAPACITY));
    let reporter = StatsReporter::spawn(vec![queue.stats_handle()], Duration::from_secs(10));

    let scheduler = Arc::new(MergeScheduler::new(
        range,
        Arc::clone(&queue),
        catalog,
        DiskRunner {
            root: root.clone(),
            times,
            bar: bar.clone(),
        },
    ));
    let stage = {
        let scheduler = Arc::clone(&scheduler);
        PipelineStage::spawn(Arc::clone(&queue), workers, move |r: ShardRange| {
            scheduler.process(r).map_err(JobError::fatal)
        })?
    };

    scheduler.seed();
    let outcome = loop {
        match scheduler.root_state() {
            Some(state @ (NodeState::Done | NodeState::NotAvailable)) => break state,
            _ => std::thread::sleep(Duration::from_millis(50)),
        }
    };
    stage.shutdown();
    reporter.stop();
    bar.finish_and_clear();

    match outcome {
        NodeState::Done => {
            let final_dir = root.join(shard_dir_name(range.0, range.1));
            progress.println(format!("Merge complete: {}", final_dir.display()));
            Ok(())
        }
        _ => bail!("merge did not complete; see errors above"),
    }
}

/// Count leaf shards by their directory names: shard indexes must be
/// contiguous from zero.
fn discover_shard_count(root: &Path) -> Result<u32> {
    let mut indexes = Vec::new();
    for entry in std::fs::read_dir(root)
        .with_context(|| format!("Failed to read {}", root.display()))?
    {
        let name = entry?.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(idx) = name.strip_prefix("shard_") {
            if idx.len() == 4 {
                if let Ok(n) = idx.parse::<u32>() {
                    indexes.push(n);
                }
            }
        }
    }
    if indexes.is_empty() {
        bail!("no shard directories under {}", root.display());
    }
    indexes.sort_unstable();
    let count = indexes.len() as u32;
    if indexes.last() != Some(&(count - 1)) {
        bail!(
            "shard indexes not contiguous: found {} shards, highest is {}",
            count,
            indexes.last().unwrap_or(&0)
        );
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloneline_shard::relations::Relation;

    fn fake_shard(root: &Path, idx: u32) {
        let dir = root.join(shard_dir_name(idx, idx));
        std::fs::create_dir_all(&dir).unwrap();
        for r in Relation::all() {
            std::fs::write(r.path(&dir), "").unwrap();
        }
    }

    #[test]
    fn discovers_contiguous_shards() {
        let tmp = tempfile::tempdir().unwrap();
        for i in 0..3 {
            fake_shard(tmp.path(), i);
        }
        // Merged outputs and stray files are ignored.
        std::fs::create_dir_all(tmp.path().join("shard_0000_0002")).unwrap();
        std::fs::write(tmp.path().join("notes.txt"), "x").unwrap();
        assert_eq!(discover_shard_count(tmp.path()).unwrap(), 3);
    }

    #[test]
    fn rejects_gaps() {
        let tmp = tempfile::tempdir().unwrap();
        fake_shard(tmp.path(), 0);
        fake_shard(tmp.path(), 2);
        assert!(discover_shard_count(tmp.path()).is_err());
    }

    #[test]
    fn catalog_reads_completion_from_disk() {
        let tmp = tempfile::tempdir().unwrap();
        fake_shard(tmp.path(), 0);
        std::fs::create_dir_all(tmp.path().join("shard_0001")).unwrap();
        let catalog = DirCatalog {
            root: tmp.path().to_path_buf(),
        };
        assert_eq!(catalog.leaf_state(0), LeafState::Done);
        assert_eq!(catalog.leaf_state(1), LeafState::NotAvailable);
        assert_eq!(catalog.leaf_state(9), LeafState::NotAvailable);
    }
}

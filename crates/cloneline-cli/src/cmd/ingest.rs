//! Ingest subcommand - tokenize and intern one shard of the corpus

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use clap::Args;
use serde::Deserialize;

use cloneline_core::{
    BoundedWorkQueue, Digest, JobError, PipelineStage, SharedProgress, StatsReporter, fmt_num,
};
use cloneline_shard::relations::{cleanup_tmp_files, shard_dir_name, shard_is_complete};
use cloneline_shard::{
    Project, ShardInterner, TokenFrequencyVector, TokenizedFile, tokenize,
};

use crate::config::Config;

#[derive(Args, Debug)]
pub struct IngestArgs {
    /// CSV listing the shard's projects (id,path,url,created_at)
    #[arg(short, long)]
    pub projects: PathBuf,

    /// Shard index of this partition
    #[arg(short, long)]
    pub shard: u32,

    /// Output directory holding shard results
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Number of tokenizer workers
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Maximum number of files to process
    #[arg(short = 'l', long)]
    pub limit: Option<usize>,
}

/// One row of the project list CSV.
#[derive(Debug, Deserialize)]
struct ProjectRow {
    id: u64,
    path: PathBuf,
    url: String,
    created_at: i64,
}

struct TokenizeJob {
    project: Arc<Project>,
    file_id: u64,
    path: PathBuf,
    relative_path: String,
    created_at: i64,
}

impl fmt::Debug for TokenizeJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tokenize {} ({})", self.path.display(), self.file_id)
    }
}

struct InternJob {
    project: Arc<Project>,
    file: TokenizedFile,
    vector: TokenFrequencyVector,
}

impl fmt::Debug for InternJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "intern {} ({})", self.file.relative_path, self.file.id)
    }
}

pub fn run(args: IngestArgs, config: &Config, progress: &SharedProgress) -> Result<()> {
    let output_dir = args
        .output
        .unwrap_or_else(|| config.output.default_dir.clone());
    let workers = args
        .workers
        .unwrap_or(config.workers.default)
        .min(config.workers.max)
        .max(1);

    let shard_name = shard_dir_name(args.shard, args.shard);
    let shard_dir = output_dir.join(&shard_name);
    if shard_is_complete(&shard_dir) {
        log::info!("{shard_name} already complete, skipping");
        return Ok(());
    }
    std::fs::create_dir_all(&shard_dir)
        .with_context(|| format!("Failed to create {}", shard_dir.display()))?;
    cleanup_tmp_files(&shard_dir)?;

    let projects = read_project_list(&args.projects)?;
    log::info!(
        "Ingesting {shard_name}: {} projects with {workers} workers",
        projects.len()
    );

    let interner = Arc::new(ShardInterner::create(&shard_dir)?);
    let bar = progress.counter_bar(&shard_name, 0);

    let intern_queue: Arc<BoundedWorkQueue<InternJob>> = Arc::new(BoundedWorkQueue::new(
        "intern",
        config.ingest.queue_capacity,
    ));
    let tokenize_queue: Arc<BoundedWorkQueue<TokenizeJob>> = Arc::new(BoundedWorkQueue::new(
        "tokenize",
        config.ingest.queue_capacity,
    ));
    let reporter = StatsReporter::spawn(
        vec![tokenize_queue.stats_handle(), intern_queue.stats_handle()],
        Duration::from_secs(10),
    );

    let intern_stage = {
        let interner = Arc::clone(&interner);
        let bar = bar.clone();
        PipelineStage::spawn(Arc::clone(&intern_queue), workers, move |mut job: InternJob| {
            interner
                .intern_file(&mut job.file, job.vector)
                .map_err(JobError::fatal)?;
            bar.inc(1);
            if job.project.file_written() {
                log::debug!("Project done: {}", job.project.url);
            }
            Ok(())
        })?
    };

    let tokenize_stage = {
        let intern_queue = Arc::clone(&intern_queue);
        PipelineStage::spawn(Arc::clone(&tokenize_queue), workers, move |job: TokenizeJob| {
            let source = std::fs::read(&job.path).map_err(|e| {
                // The file stays counted against the project so completion
                // logging never waits on it.
                job.project.file_written();
                JobError::recoverable(format!("read {}: {e}", job.path.display()))
            })?;
            let out = tokenize(&source);
            let file = TokenizedFile {
                id: job.file_id,
                project_id: job.project.id,
                relative_path: job.relative_path,
                content_hash: Digest::of(&source),
                token_sequence_hash: out.vector.sequence_hash(),
                total_tokens: out.vector.total(),
                unique_tokens: out.vector.unique() as u64,
                bytes: source.len() as u64,
                lines: out.lines,
                loc: out.loc,
                sloc: out.sloc,
                created_at: job.created_at,
                clone_group_id: None,
            };
            let next = InternJob {
                project: job.project,
                file,
                vector: out.vector,
            };
            intern_queue
                .schedule(next)
                .map_err(|_| JobError::fatal("intern queue closed"))?;
            Ok(())
        })?
    };

    // Producer: walk each project tree and feed the tokenize queue. The
    // bounded queues provide the backpressure; this loop simply blocks
    // when the stages fall behind.
    let base_id = (args.shard as u64) << 32;
    let mut next_file = 0u64;
    let mut skipped_large = 0usize;
    'walk: for row in &projects {
        let project = Arc::new(Project::new(row.id, row.url.clone(), row.created_at));
        for entry in walkdir::WalkDir::new(&row.path)
            .into_iter()
            .filter_map(|e| match e {
                Ok(e) => Some(e),
                Err(e) => {
                    log::warn!("Walk error under {}: {e}", row.path.display());
                    None
                }
            })
        {
            if !entry.file_type().is_file() || !wanted_extension(entry.path(), config) {
                continue;
            }
            if let Some(limit) = args.limit {
                if next_file as usize >= limit {
                    log::info!("File limit reached ({limit})");
                    break 'walk;
                }
            }
            let meta = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    log::warn!("Stat {}: {e}", entry.path().display());
                    continue;
                }
            };
            if meta.len() > config.ingest.max_file_bytes {
                skipped_large += 1;
                continue;
            }
            let created_at = meta
                .modified()
                .ok()
                .map(system_time_millis)
                .unwrap_or(row.created_at);
            let relative_path = entry
                .path()
                .strip_prefix(&row.path)
                .unwrap_or(entry.path())
                .display()
                .to_string();

            let job = TokenizeJob {
                project: Arc::clone(&project),
                file_id: base_id | next_file,
                path: entry.path().to_path_buf(),
                relative_path,
                created_at,
            };
            project.add_file();
            bar.inc_length(1);
            next_file += 1;
            if tokenize_queue.schedule(job).is_err() {
                bail!("tokenize queue closed unexpectedly");
            }
        }
    }

    // Drain in stage order so derived jobs still have somewhere to go.
    tokenize_stage.shutdown();
    intern_stage.shutdown();
    reporter.stop();
    bar.finish_and_clear();

    let interner = Arc::try_unwrap(interner)
        .map_err(|_| anyhow::anyhow!("intern workers still hold the interner"))?;
    let summary = interner.close()?;
    summary.log(&shard_name);
    if skipped_large > 0 {
        log::info!("Skipped {} oversized files", fmt_num(skipped_large));
    }

    let tok = tokenize_queue.stats().snapshot();
    let int = intern_queue.stats().snapshot();
    progress.println(format!(
        "{shard_name}: {} files tokenized, {} interned ({} read errors)",
        fmt_num(tok.processed),
        fmt_num(int.processed),
        fmt_num(tok.recoverable_errors)
    ));
    if tok.fatal_errors + int.fatal_errors > 0 {
        bail!(
            "{} jobs failed fatally",
            tok.fatal_errors + int.fatal_errors
        );
    }
    Ok(())
}

fn wanted_extension(path: &Path, config: &Config) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| config.ingest.extensions.iter().any(|w| w == ext))
}

fn system_time_millis(t: SystemTime) -> i64 {
    DateTime::<Utc>::from(t).timestamp_millis()
}

fn read_project_list(path: &Path) -> Result<Vec<ProjectRow>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open project list: {}", path.display()))?;
    let mut rows = Vec::new();
    for row in reader.deserialize() {
        let row: ProjectRow =
            row.with_context(|| format!("Bad row in {}", path.display()))?;
        rows.push(row);
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloneline_core::ProgressContext;
    use cloneline_shard::reader::{ClonePairRecord, FileRecord, read_all};

    fn write_project(dir: &Path, files: &[(&str, &str)]) {
        for (name, text) in files {
            let path = dir.join(name);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, text).unwrap();
        }
    }

    #[test]
    fn ingest_produces_a_complete_shard() {
        let tmp = tempfile::tempdir().unwrap();
        let proj = tmp.path().join("proj");
        write_project(
            &proj,
            &[
                ("src/a.js", "let x = 1"),
                ("src/b.js", "let x = 1"),
                ("src/c.js", "other text entirely"),
                ("README.md", "not tokenized"),
            ],
        );
        let list = tmp.path().join("projects.csv");
        std::fs::write(
            &list,
            format!("id,path,url,created_at\n7,{},file:///proj,1000\n", proj.display()),
        )
        .unwrap();

        let out = tmp.path().join("shards");
        let args = IngestArgs {
            projects: list,
            shard: 3,
            output: Some(out.clone()),
            workers: Some(2),
            limit: None,
        };
        let mut config = Config::default();
        config.ingest.extensions = vec!["js".to_string()];
        let progress: SharedProgress = Arc::new(ProgressContext::new());
        run(args, &config, &progress).unwrap();

        let shard = out.join("shard_0003");
        assert!(shard_is_complete(&shard));

        // Two identical files collapse to one representative plus a pair.
        let files: Vec<FileRecord> = read_all(&shard).unwrap();
        assert_eq!(files.len(), 2);
        let pairs: Vec<ClonePairRecord> = read_all(&shard).unwrap();
        assert_eq!(pairs.len(), 2); // member pair + group self-pair
        // File ids carry the shard base.
        assert!(files.iter().all(|f| f.file_id >> 32 == 3));
    }

    #[test]
    fn completed_shard_is_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let proj = tmp.path().join("proj");
        write_project(&proj, &[("a.js", "x")]);
        let list = tmp.path().join("projects.csv");
        std::fs::write(
            &list,
            format!("id,path,url,created_at\n1,{},u,0\n", proj.display()),
        )
        .unwrap();

        let out = tmp.path().join("shards");
        let config = Config::default();
        let progress: SharedProgress = Arc::new(ProgressContext::new());
        let make_args = || IngestArgs {
            projects: list.clone(),
            shard: 0,
            output: Some(out.clone()),
            workers: Some(1),
            limit: None,
        };
        run(make_args(), &config, &progress).unwrap();

        let marker = out.join("shard_0000").join("token-text.csv");
        let before = std::fs::metadata(&marker).unwrap().modified().unwrap();
        run(make_args(), &config, &progress).unwrap();
        let after = std::fs::metadata(&marker).unwrap().modified().unwrap();
        assert_eq!(before, after);
    }
}

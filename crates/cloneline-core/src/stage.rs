//! Pipeline stage: a fixed thread pool draining one bounded queue
//!
//! Each worker runs the same loop forever: take the next job, run the
//! stage handler, count the outcome. Handler errors never stop the loop —
//! a recoverable error is logged with the job's description and the stage
//! moves on; a fatal error is counted separately for operator visibility
//! but likewise never stops the pool.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::JobError;
use crate::work_queue::{BoundedWorkQueue, StageStats};

/// A stage thread pool bound to one work queue.
pub struct PipelineStage<J> {
    queue: Arc<BoundedWorkQueue<J>>,
    workers: Vec<JoinHandle<()>>,
}

impl<J: Send + fmt::Debug + 'static> PipelineStage<J> {
    /// Spawn `threads` identical workers over `queue`.
    ///
    /// The handler owns each job; derived jobs are forwarded by scheduling
    /// them onto the next stage's queue from inside the handler.
    pub fn spawn(
        queue: Arc<BoundedWorkQueue<J>>,
        threads: usize,
        handler: impl Fn(J) -> Result<(), JobError> + Send + Sync + 'static,
    ) -> std::io::Result<Self> {
        let handler = Arc::new(handler);
        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let queue = Arc::clone(&queue);
            let handler = Arc::clone(&handler);
            let handle = std::thread::Builder::new()
                .name(format!("{}-{i}", queue.label()))
                .spawn(move || worker_loop(&queue, &*handler))?;
            workers.push(handle);
        }
        Ok(Self { queue, workers })
    }

    pub fn queue(&self) -> &Arc<BoundedWorkQueue<J>> {
        &self.queue
    }

    /// Close the queue and wait for the workers to drain it and exit.
    pub fn shutdown(self) {
        self.queue.close();
        for w in self.workers {
            // A worker that panicked already logged through the panic hook.
            let _ = w.join();
        }
    }
}

fn worker_loop<J: fmt::Debug>(
    queue: &BoundedWorkQueue<J>,
    handler: &impl Fn(J) -> Result<(), JobError>,
) {
    let stats = queue.stats();
    stats.threads.fetch_add(1, Ordering::Relaxed);
    while let Some(job) = queue.take_next() {
        let desc = format!("{job:?}");
        match handler(job) {
            Ok(()) => {
                stats.processed.fetch_add(1, Ordering::Relaxed);
            }
            Err(JobError::Recoverable(msg)) => {
                stats.recoverable_errors.fetch_add(1, Ordering::Relaxed);
                log::warn!("{}: job {desc} failed: {msg}", queue.label());
            }
            Err(JobError::Fatal(msg)) => {
                stats.fatal_errors.fetch_add(1, Ordering::Relaxed);
                log::error!("{}: job {desc} failed fatally: {msg}", queue.label());
            }
        }
    }
}

/// Periodic stage-health reporter.
///
/// Polls each registered queue's counters and logs one line per stage.
/// Purely observational: never blocks the stages it reports on.
pub struct StatsReporter {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl StatsReporter {
    pub fn spawn(handles: Vec<(String, Arc<StageStats>)>, interval: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop2 = Arc::clone(&stop);
        let handle = std::thread::spawn(move || {
            while !stop2.load(Ordering::Relaxed) {
                std::thread::sleep(interval);
                for (label, stats) in &handles {
                    let s = stats.snapshot();
                    log::debug!(
                        "{label}: {} threads ({} idle, {} stalled), {} done, {} errors ({} fatal)",
                        s.threads,
                        s.idle,
                        s.stalled,
                        s.processed,
                        s.recoverable_errors,
                        s.fatal_errors
                    );
                }
            }
        });
        Self {
            stop,
            handle: Some(handle),
        }
    }

    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for StatsReporter {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn stage_processes_all_jobs() {
        let queue = Arc::new(BoundedWorkQueue::new("double", 8));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        let stage = PipelineStage::spawn(Arc::clone(&queue), 2, move |job: u32| {
            seen2.lock().unwrap().push(job * 2);
            Ok(())
        })
        .unwrap();

        for i in 0..20 {
            queue.schedule(i).unwrap();
        }
        stage.shutdown();

        let mut seen = Arc::into_inner(seen).unwrap().into_inner().unwrap();
        seen.sort_unstable();
        assert_eq!(seen, (0..20).map(|i| i * 2).collect::<Vec<_>>());
        assert_eq!(queue.stats().snapshot().processed, 20);
    }

    #[test]
    fn errors_are_counted_and_loop_continues() {
        let queue = Arc::new(BoundedWorkQueue::new("flaky", 8));
        let stage = PipelineStage::spawn(Arc::clone(&queue), 1, |job: u32| match job % 3 {
            0 => Ok(()),
            1 => Err(JobError::recoverable("bad input")),
            _ => Err(JobError::fatal("stage state broken")),
        })
        .unwrap();

        for i in 0..9 {
            queue.schedule(i).unwrap();
        }
        stage.shutdown();

        let s = queue.stats().snapshot();
        assert_eq!(s.processed, 3);
        assert_eq!(s.recoverable_errors, 3);
        assert_eq!(s.fatal_errors, 3);
    }

    #[test]
    fn reporter_stops_cleanly() {
        let queue: BoundedWorkQueue<u32> = BoundedWorkQueue::new("quiet", 4);
        let reporter = StatsReporter::spawn(vec![queue.stats_handle()], Duration::from_millis(5));
        std::thread::sleep(Duration::from_millis(20));
        reporter.stop();
    }
}

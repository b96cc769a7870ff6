//! Memoized binary merge tree over the shard index space
//!
//! Each node covers an inclusive shard range; a node's result is the merge
//! of its two halves. Evaluation is demand-driven: asking for a range
//! either finds it done, finds an input missing, schedules the two child
//! merges, or parks the range as a waiter on a pending child. Finished
//! nodes are memoized, so re-asking for the root after every new leaf
//! re-merges only the path that actually changed.

use std::sync::{Arc, Mutex};

use cloneline_core::work_queue::BoundedWorkQueue;

use crate::error::MergeError;

/// Inclusive range of shard indexes, the identity of one tree node.
pub type ShardRange = (u32, u32);

/// Lifecycle of a tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Children scheduled or running; waiters parked here get rescheduled
    /// when the node resolves.
    Pending,
    Done,
    /// An input under this range is missing or failed. Terminal until the
    /// leaf becomes ready.
    NotAvailable,
}

/// What the catalog knows about one leaf shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafState {
    Done,
    Pending,
    NotAvailable,
}

/// Source of truth for leaf shards, backed by the filesystem in
/// production and by fixtures in tests.
pub trait ShardCatalog {
    fn leaf_state(&self, shard: u32) -> LeafState;
}

/// Executes one pairwise merge. The scheduler calls this outside the tree
/// lock.
pub trait MergeRunner {
    fn run(&self, left: ShardRange, right: ShardRange, out: ShardRange) -> Result<(), MergeError>;
}

/// Outcome of evaluating a range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Evaluation {
    Done,
    /// Ranges to re-evaluate once the blocking leaves become ready.
    NotAvailable { resched: Vec<ShardRange> },
    /// Both children are done; the caller should merge them now.
    Ready { left: ShardRange, right: ShardRange },
    /// Child merges were scheduled (or are already running); the caller
    /// should enqueue these child ranges and come back when notified.
    Waiting { enqueue: Vec<ShardRange> },
}

#[derive(Debug, Default)]
struct Node {
    state: Option<NodeState>,
    /// Parent ranges to reschedule when this node resolves.
    waiters: Vec<ShardRange>,
    /// Whether this range has already been handed out for execution, so a
    /// re-evaluation never schedules the same merge twice.
    requested: bool,
}

/// The memoized tree itself. Pure state machine, no IO; callers drive it
/// with `evaluate` and feed back results through `complete`/`fail`.
#[derive(Debug, Default)]
pub struct MergeTree {
    nodes: rustc_hash::FxHashMap<ShardRange, Node>,
}

/// Split point of a range: left half is `[a, mid]`, right is `[mid+1, c]`.
fn midpoint((a, c): ShardRange) -> u32 {
    a + (c - a) / 2
}

impl MergeTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, range: ShardRange) -> Option<NodeState> {
        self.nodes.get(&range).and_then(|n| n.state)
    }

    /// Evaluate a range against the catalog.
    ///
    /// Leaves take their state from the catalog directly. An inner node
    /// checks its memoized state first, then its children: both done means
    /// `Ready` (at most once; repeats wait), any child not available
    /// poisons the node, and otherwise the node parks as a waiter on every
    /// unresolved child.
    pub fn evaluate(&mut self, range: ShardRange, catalog: &impl ShardCatalog) -> Evaluation {
        let (a, c) = range;
        if a == c {
            return match catalog.leaf_state(a) {
                LeafState::Done => {
                    self.node(range).state = Some(NodeState::Done);
                    Evaluation::Done
                }
                LeafState::Pending => {
                    self.node(range).state = Some(NodeState::Pending);
                    Evaluation::Waiting { enqueue: vec![] }
                }
                LeafState::NotAvailable => {
                    self.node(range).state = Some(NodeState::NotAvailable);
                    Evaluation::NotAvailable { resched: vec![] }
                }
            };
        }

        match self.state(range) {
            Some(NodeState::Done) => return Evaluation::Done,
            Some(NodeState::NotAvailable) => return Evaluation::NotAvailable { resched: vec![] },
            Some(NodeState::Pending) => {
                if self.node(range).requested {
                    // Merge already handed out; nothing to do until
                    // complete().
                    return Evaluation::Waiting { enqueue: vec![] };
                }
            }
            None => {}
        }

        let mid = midpoint(range);
        let left = (a, mid);
        let right = (mid + 1, c);

        let mut enqueue = Vec::new();
        let mut blocked = false;
        let mut not_available = false;
        for child in [left, right] {
            match self.child_state(child, catalog) {
                Some(NodeState::Done) => {}
                Some(NodeState::NotAvailable) => not_available = true,
                Some(NodeState::Pending) => {
                    blocked = true;
                    self.park(range, child);
                }
                None => {
                    blocked = true;
                    self.park(range, child);
                    enqueue.push(child);
                }
            }
        }

        if not_available {
            self.node(range).state = Some(NodeState::NotAvailable);
            return Evaluation::NotAvailable { resched: vec![] };
        }
        if blocked {
            self.node(range).state = Some(NodeState::Pending);
            return Evaluation::Waiting { enqueue };
        }

        let node = self.node(range);
        node.state = Some(NodeState::Pending);
        node.requested = true;
        Evaluation::Ready { left, right }
    }

    /// Mark a range done and drain its waiters for rescheduling.
    pub fn complete(&mut self, range: ShardRange) -> Vec<ShardRange> {
        let node = self.node(range);
        node.state = Some(NodeState::Done);
        std::mem::take(&mut node.waiters)
    }

    /// Mark a range failed; waiters still get rescheduled so the failure
    /// propagates to the root instead of stranding it.
    pub fn fail(&mut self, range: ShardRange) -> Vec<ShardRange> {
        let node = self.node(range);
        node.state = Some(NodeState::NotAvailable);
        node.requested = false;
        std::mem::take(&mut node.waiters)
    }

    /// A previously pending or missing leaf became ready.
    ///
    /// Every not-available node forgets its state so it re-evaluates;
    /// finished subtrees stay memoized. Returns the ranges to re-evaluate
    /// (the caller should also re-ask for its root).
    pub fn leaf_ready(&mut self, shard: u32) -> Vec<ShardRange> {
        let range = (shard, shard);
        let node = self.node(range);
        node.state = Some(NodeState::Done);
        let mut resched = std::mem::take(&mut node.waiters);
        let poisoned: Vec<ShardRange> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.state == Some(NodeState::NotAvailable))
            .map(|(&r, _)| r)
            .collect();
        for r in poisoned {
            let node = self.node(r);
            node.state = None;
            node.requested = false;
        }
        if resched.is_empty() {
            resched.push(range);
        }
        resched
    }

    fn child_state(
        &mut self,
        child: ShardRange,
        catalog: &impl ShardCatalog,
    ) -> Option<NodeState> {
        if child.0 == child.1 {
            // Leaves re-consult the catalog so an appearing shard is seen
            // without an explicit notification.
            return match self.evaluate(child, catalog) {
                Evaluation::Done => Some(NodeState::Done),
                Evaluation::NotAvailable { .. } => Some(NodeState::NotAvailable),
                _ => Some(NodeState::Pending),
            };
        }
        self.state(child)
    }

    /// Record `parent` as a waiter on `child`, once.
    fn park(&mut self, parent: ShardRange, child: ShardRange) {
        let node = self.node(child);
        if !node.waiters.contains(&parent) {
            node.waiters.push(parent);
        }
    }

    fn node(&mut self, range: ShardRange) -> &mut Node {
        self.nodes.entry(range).or_default()
    }
}

/// Drives a `MergeTree` with a bounded queue of ranges and a pool-agnostic
/// runner. The tree lock is held only for state transitions; merges run
/// outside it.
pub struct MergeScheduler<C, R> {
    tree: Mutex<MergeTree>,
    queue: Arc<BoundedWorkQueue<ShardRange>>,
    catalog: C,
    runner: R,
    root: ShardRange,
}

impl<C: ShardCatalog, R: MergeRunner> MergeScheduler<C, R> {
    pub fn new(
        root: ShardRange,
        queue: Arc<BoundedWorkQueue<ShardRange>>,
        catalog: C,
        runner: R,
    ) -> Self {
        Self {
            tree: Mutex::new(MergeTree::new()),
            queue,
            catalog,
            runner,
            root,
        }
    }

    pub fn queue(&self) -> &Arc<BoundedWorkQueue<ShardRange>> {
        &self.queue
    }

    pub fn root_state(&self) -> Option<NodeState> {
        self.tree.lock().unwrap().state(self.root)
    }

    /// Kick off evaluation from the root.
    pub fn seed(&self) {
        self.enqueue(self.root);
    }

    /// A leaf shard finished ingesting; restart the affected path.
    pub fn leaf_ready(&self, shard: u32) {
        let resched = self.tree.lock().unwrap().leaf_ready(shard);
        for range in resched {
            self.enqueue(range);
        }
        self.enqueue(self.root);
    }

    /// Process one range job. Called by the worker pool for every range
    /// popped from the queue.
    pub fn process(&self, range: ShardRange) -> Result<(), MergeError> {
        let evaluation = self.tree.lock().unwrap().evaluate(range, &self.catalog);
        match evaluation {
            Evaluation::Done => {
                self.resolve(range, true);
                Ok(())
            }
            Evaluation::NotAvailable { resched } => {
                self.resolve(range, false);
                for r in resched {
                    self.enqueue(r);
                }
                Ok(())
            }
            Evaluation::Waiting { enqueue } => {
                for r in enqueue {
                    self.enqueue(r);
                }
                Ok(())
            }
            Evaluation::Ready { left, right } => {
                let result = self.runner.run(left, right, range);
                let ok = result.is_ok();
                if let Err(e) = &result {
                    log::error!(
                        "Merge {:?}+{:?} -> {:?} failed: {e}",
                        left,
                        right,
                        range
                    );
                }
                self.resolve(range, ok);
                result
            }
        }
    }

    /// Record a terminal state and reschedule everything waiting on it.
    fn resolve(&self, range: ShardRange, ok: bool) {
        let waiters = {
            let mut tree = self.tree.lock().unwrap();
            if ok {
                tree.complete(range)
            } else {
                tree.fail(range)
            }
        };
        for w in waiters {
            self.enqueue(w);
        }
    }

    fn enqueue(&self, range: ShardRange) {
        if self.queue.schedule(range).is_err() {
            log::warn!("Merge queue closed; dropping range {range:?}");
        }
    }
}

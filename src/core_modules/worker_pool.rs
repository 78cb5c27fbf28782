// THEORY:
// The `WorkerPool` is the scheduler every item and batch task goes through. It
// is a single dispatcher task that owns the ready queue and hands work to a
// fixed number of blocking workers, replying to the submitter on a oneshot
// channel.
//
// Key architectural principles:
// 1.  **Declared access**: every task carries an `AccessSet` naming the region
//     fields and index ranges it reads or writes. The dispatcher only starts a
//     task when none of the running tasks has an overlapping write (or a write
//     overlapping its reads). Disjoint colors therefore run side by side while
//     two tasks touching the same slot never do.
// 2.  **Priority**: ready tasks are ordered by the placement policy's priority
//     for their kind, then by submission order. Feature work drains before
//     filters, and filters before loads, so compute keeps the workers busy
//     while I/O bound loads fill the gaps.
// 3.  **Predicated dispatch**: `submit_when` defers the enqueue of a task until
//     an upstream boolean has resolved. A task whose predicate resolves to
//     false is never queued at all.
// 4.  **Eager enqueue**: `submit` queues immediately and returns a handle, so a
//     caller can fan out many tasks before awaiting any of them.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::task::{Context, Poll};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::core_modules::partition::IndexRange;
use crate::core_modules::placement::{PlacementPolicy, RegionRole, TaskKind};
use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
}

/// One region field touched by a task over a set of index ranges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldAccess {
    pub role: RegionRole,
    pub mode: AccessMode,
    pub ranges: Vec<IndexRange>,
}

impl FieldAccess {
    fn overlaps(&self, other: &FieldAccess) -> bool {
        self.role == other.role
            && self
                .ranges
                .iter()
                .any(|mine| other.ranges.iter().any(|theirs| mine.overlaps(theirs)))
    }
}

/// The region fields a task declares it will read or write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessSet {
    accesses: Vec<FieldAccess>,
}

impl AccessSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(self, role: RegionRole, range: impl Into<IndexRange>) -> Self {
        self.with(role, AccessMode::Read, vec![range.into()])
    }

    pub fn write(self, role: RegionRole, range: impl Into<IndexRange>) -> Self {
        self.with(role, AccessMode::Write, vec![range.into()])
    }

    /// Declares writes to an arbitrary set of indices, coalesced into ranges.
    pub fn write_indices(self, role: RegionRole, indices: &[usize]) -> Self {
        self.with(role, AccessMode::Write, coalesce(indices))
    }

    fn with(mut self, role: RegionRole, mode: AccessMode, ranges: Vec<IndexRange>) -> Self {
        self.accesses.push(FieldAccess { role, mode, ranges });
        self
    }

    pub fn accesses(&self) -> &[FieldAccess] {
        &self.accesses
    }

    /// Two sets conflict when they overlap on a field and at least one side
    /// writes it.
    pub fn conflicts_with(&self, other: &AccessSet) -> bool {
        self.accesses.iter().any(|mine| {
            other.accesses.iter().any(|theirs| {
                (mine.mode == AccessMode::Write || theirs.mode == AccessMode::Write)
                    && mine.overlaps(theirs)
            })
        })
    }
}

fn coalesce(indices: &[usize]) -> Vec<IndexRange> {
    let mut sorted = indices.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    let mut ranges: Vec<IndexRange> = Vec::new();
    for index in sorted {
        match ranges.last_mut() {
            Some(last) if last.end == index => last.end += 1,
            _ => ranges.push(IndexRange::single(index)),
        }
    }
    ranges
}

/// What the scheduler needs to know about a task before running it.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub kind: TaskKind,
    pub access: AccessSet,
}

impl TaskSpec {
    pub fn new(kind: TaskKind, access: AccessSet) -> Self {
        Self { kind, access }
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

struct QueuedTask {
    id: u64,
    priority: u8,
    kind: TaskKind,
    access: AccessSet,
    job: Job,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    // Max-heap: higher priority first, then the earlier submission.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.id.cmp(&self.id))
    }
}

#[derive(Debug, Default)]
struct PoolCounters {
    submitted: AtomicUsize,
    completed: AtomicUsize,
    skipped: AtomicUsize,
}

/// Counters describing what a pool has done so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub submitted: usize,
    pub completed: usize,
    /// Predicated tasks whose predicate resolved to false.
    pub skipped: usize,
}

/// Sends the completion notice even if the job panics.
struct FinishGuard {
    id: u64,
    done: mpsc::UnboundedSender<u64>,
    counters: Arc<PoolCounters>,
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        self.counters.completed.fetch_add(1, Ordering::Relaxed);
        let _ = self.done.send(self.id);
    }
}

/// Resolves to the task's return value once a worker has run it.
pub struct TaskHandle<T> {
    kind: TaskKind,
    receiver: Option<oneshot::Receiver<T>>,
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let kind = this.kind;
        match this.receiver.as_mut() {
            None => Poll::Ready(Err(PipelineError::PoolClosed)),
            Some(receiver) => Pin::new(receiver)
                .poll(cx)
                .map(|result| result.map_err(|_| PipelineError::TaskLost { kind })),
        }
    }
}

/// A priority and access-aware pool of blocking workers.
///
/// Cloning is cheap; all clones feed the same dispatcher, which shuts down once
/// every clone is dropped and the queued tasks have drained.
#[derive(Clone)]
pub struct WorkerPool {
    task_sender: mpsc::UnboundedSender<QueuedTask>,
    policy: Arc<dyn PlacementPolicy>,
    next_id: Arc<AtomicU64>,
    counters: Arc<PoolCounters>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("policy", &self.policy)
            .field("stats", &self.stats())
            .finish()
    }
}

impl WorkerPool {
    /// Starts the dispatcher. Must be called from within a Tokio runtime.
    pub fn new(workers: usize, policy: Arc<dyn PlacementPolicy>) -> Self {
        let (task_sender, task_receiver) = mpsc::unbounded_channel::<QueuedTask>();
        let counters = Arc::new(PoolCounters::default());

        tokio::spawn(Self::dispatch(
            task_receiver,
            workers.max(1),
            Arc::clone(&counters),
        ));

        Self {
            task_sender,
            policy,
            next_id: Arc::new(AtomicU64::new(0)),
            counters,
        }
    }

    async fn dispatch(
        mut task_receiver: mpsc::UnboundedReceiver<QueuedTask>,
        workers: usize,
        counters: Arc<PoolCounters>,
    ) {
        let (done_sender, mut done_receiver) = mpsc::unbounded_channel::<u64>();
        let mut ready: BinaryHeap<QueuedTask> = BinaryHeap::new();
        let mut running: HashMap<u64, AccessSet> = HashMap::new();
        let mut open = true;

        loop {
            // Everything already submitted competes on priority, not arrival.
            while open {
                match task_receiver.try_recv() {
                    Ok(task) => ready.push(task),
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => open = false,
                }
            }

            Self::start_eligible(&mut ready, &mut running, workers, &done_sender, &counters);

            if !open && ready.is_empty() && running.is_empty() {
                debug!("worker pool drained, dispatcher exiting");
                break;
            }

            tokio::select! {
                task = task_receiver.recv(), if open => match task {
                    Some(task) => ready.push(task),
                    None => open = false,
                },
                Some(id) = done_receiver.recv() => {
                    running.remove(&id);
                }
            }
        }
    }

    fn start_eligible(
        ready: &mut BinaryHeap<QueuedTask>,
        running: &mut HashMap<u64, AccessSet>,
        workers: usize,
        done_sender: &mpsc::UnboundedSender<u64>,
        counters: &Arc<PoolCounters>,
    ) {
        let mut blocked = Vec::new();
        while running.len() < workers {
            let Some(task) = ready.pop() else { break };
            if running.values().any(|access| access.conflicts_with(&task.access)) {
                blocked.push(task);
                continue;
            }

            trace!(id = task.id, kind = ?task.kind, "starting task");
            running.insert(task.id, task.access);
            let guard = FinishGuard {
                id: task.id,
                done: done_sender.clone(),
                counters: Arc::clone(counters),
            };
            let job = task.job;
            tokio::task::spawn_blocking(move || {
                let _guard = guard;
                job();
            });
        }
        ready.extend(blocked);
    }

    /// Queues `f` immediately and returns a handle to its result.
    pub fn submit<T, F>(&self, spec: TaskSpec, f: F) -> TaskHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (result_sender, result_receiver) = oneshot::channel();
        let task = QueuedTask {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            priority: self.policy.priority(spec.kind),
            kind: spec.kind,
            access: spec.access,
            job: Box::new(move || {
                let _ = result_sender.send(f());
            }),
        };

        let receiver = match self.task_sender.send(task) {
            Ok(()) => {
                self.counters.submitted.fetch_add(1, Ordering::Relaxed);
                Some(result_receiver)
            }
            Err(_) => None,
        };
        TaskHandle {
            kind: spec.kind,
            receiver,
        }
    }

    /// Two-phase dispatch: waits for `predicate`, then queues `f` only if it
    /// resolved to `true`. Returns `Ok(None)` when the task was never queued.
    pub async fn submit_when<T, F, P>(&self, predicate: P, spec: TaskSpec, f: F) -> Result<Option<T>>
    where
        P: Future<Output = Result<bool>>,
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        if !predicate.await? {
            self.counters.skipped.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }
        self.submit(spec, f).await.map(Some)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            skipped: self.counters.skipped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::placement::DefaultPlacement;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicBool;

    fn pool(workers: usize) -> WorkerPool {
        WorkerPool::new(workers, Arc::new(DefaultPlacement))
    }

    fn items(range: std::ops::Range<usize>) -> AccessSet {
        AccessSet::new().write(RegionRole::Items, range)
    }

    #[test]
    fn access_sets_conflict_only_on_overlapping_writes() {
        let a = AccessSet::new().read(RegionRole::Items, 0..4);
        let b = AccessSet::new().read(RegionRole::Items, 2..6);
        assert!(!a.conflicts_with(&b), "readers share");

        let c = AccessSet::new().write(RegionRole::Items, 3..4);
        assert!(a.conflicts_with(&c));
        assert!(c.conflicts_with(&a));

        let d = AccessSet::new().write(RegionRole::VectorFlags, 0..4);
        assert!(!a.conflicts_with(&d), "different fields never conflict");

        let e = AccessSet::new().write(RegionRole::Items, 4..8);
        assert!(!c.conflicts_with(&e));
    }

    #[test]
    fn write_indices_coalesces_runs() {
        let set = AccessSet::new().write_indices(RegionRole::VectorData, &[5, 1, 2, 3, 7, 6]);
        assert_eq!(
            set.accesses()[0].ranges,
            vec![IndexRange::new(1, 4), IndexRange::new(5, 8)]
        );
    }

    #[tokio::test]
    async fn submit_returns_the_task_result() {
        let pool = pool(2);
        let handle = pool.submit(TaskSpec::new(TaskKind::Load, items(0..1)), || 21 * 2);
        assert_eq!(handle.await.unwrap(), 42);
        assert_eq!(pool.stats().submitted, 1);
    }

    #[tokio::test]
    async fn ready_tasks_run_in_priority_order() {
        let pool = pool(1);
        let order = Arc::new(Mutex::new(Vec::new()));
        let (release, gate) = std::sync::mpsc::channel::<()>();

        let blocker = pool.submit(TaskSpec::new(TaskKind::Feature, AccessSet::new()), move || {
            let _ = gate.recv();
        });

        let mut handles = Vec::new();
        for kind in [TaskKind::Load, TaskKind::Filter, TaskKind::Feature] {
            let order = Arc::clone(&order);
            handles.push(pool.submit(TaskSpec::new(kind, AccessSet::new()), move || {
                order.lock().unwrap().push(kind);
            }));
        }

        release.send(()).unwrap();
        blocker.await.unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(
            *order.lock().unwrap(),
            vec![TaskKind::Feature, TaskKind::Filter, TaskKind::Load]
        );
    }

    #[tokio::test]
    async fn conflicting_tasks_are_serialised() {
        let pool = pool(2);
        let (release, gate) = std::sync::mpsc::channel::<()>();
        let second_started = Arc::new(AtomicBool::new(false));

        let first = pool.submit(TaskSpec::new(TaskKind::Load, items(0..1)), move || {
            let _ = gate.recv();
        });
        let flag = Arc::clone(&second_started);
        let second = pool.submit(TaskSpec::new(TaskKind::Load, items(0..1)), move || {
            flag.store(true, Ordering::SeqCst);
        });
        let disjoint = pool.submit(TaskSpec::new(TaskKind::Load, items(1..2)), || 7);

        // The disjoint task gets the second worker while the first blocks.
        assert_eq!(disjoint.await.unwrap(), 7);
        assert!(!second_started.load(Ordering::SeqCst));

        release.send(()).unwrap();
        first.await.unwrap();
        second.await.unwrap();
        assert!(second_started.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn false_predicate_never_enqueues() {
        let pool = pool(1);
        let ran = pool
            .submit_when(
                async { Ok(false) },
                TaskSpec::new(TaskKind::Feature, AccessSet::new()),
                || "ran",
            )
            .await
            .unwrap();
        assert_eq!(ran, None);
        assert_eq!(pool.stats().submitted, 0);
        assert_eq!(pool.stats().skipped, 1);

        let ran = pool
            .submit_when(
                async { Ok(true) },
                TaskSpec::new(TaskKind::Feature, AccessSet::new()),
                || "ran",
            )
            .await
            .unwrap();
        assert_eq!(ran, Some("ran"));
    }

    #[tokio::test]
    async fn predicate_errors_propagate() {
        let pool = pool(1);
        let result = pool
            .submit_when(
                async { Err(PipelineError::PoolClosed) },
                TaskSpec::new(TaskKind::Feature, AccessSet::new()),
                || (),
            )
            .await;
        assert!(matches!(result, Err(PipelineError::PoolClosed)));
    }

    #[tokio::test]
    async fn panicking_task_reports_lost_and_frees_its_worker() {
        let pool = pool(1);
        let lost = pool.submit(TaskSpec::new(TaskKind::Filter, items(0..1)), || -> u8 {
            panic!("boom")
        });
        assert!(matches!(
            lost.await,
            Err(PipelineError::TaskLost {
                kind: TaskKind::Filter
            })
        ));
        let next = pool.submit(TaskSpec::new(TaskKind::Filter, items(0..1)), || 1u8);
        assert_eq!(next.await.unwrap(), 1);
    }
}

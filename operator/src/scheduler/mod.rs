//! Slot accounting and the admission/rebalance policy that multiplexes the
//! worker-slot pool across jobs of different priorities.

pub mod queue;
pub mod slots;

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use crds::MPIJob;
use futures::channel::mpsc;
use kube::ResourceExt;
use kube_runtime::reflector::ObjectRef;
use thiserror::Error;
use tracing::{info, warn};

pub use queue::{JobEntry, JobQueue};
pub use slots::{SlotLedger, SlotsExhausted};

use crate::rescale::RescaleSignal;

/// `namespace/name` identity of one MPIJob
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobKey {
    pub namespace: String,
    pub name: String,
}

impl JobKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn for_job(job: &MPIJob) -> Self {
        Self::new(job.job_namespace(), job.name_any())
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    /// Admitted, infrastructure and workers are being brought up
    Created,
    /// Waiting for capacity
    Queued,
    /// Launcher exists, the process group is live
    Running,
}

/// A rescale the controller still owes the launcher. Written when an
/// expansion is detected, cleared once the launcher acknowledged it.
/// The signal sent is purely a function of this record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RescalePlan {
    pub from_workers: i32,
    pub to_workers: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Admit with this many workers
    Admit(i32),
    /// Not enough capacity even after shrinking lower-priority jobs
    Queue,
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("listing worker pods for census: {0}")]
    Census(#[from] kube::Error),
}

/// How many worker pods of a job are currently running. Backed by the
/// cluster in production, by a fixture in tests.
#[async_trait]
pub trait WorkerCensus: Send + Sync {
    async fn running_workers(&self, key: &JobKey) -> Result<i32, SchedulerError>;
}

/// Feeds promoted or shrunk jobs back into the controller's work queue.
#[derive(Clone)]
pub struct Requeuer {
    tx: mpsc::UnboundedSender<ObjectRef<MPIJob>>,
}

impl Requeuer {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ObjectRef<MPIJob>>) {
        let (tx, rx) = mpsc::unbounded();
        (Self { tx }, rx)
    }

    pub fn requeue(&self, key: &JobKey) {
        let reference = ObjectRef::new(&key.name).within(&key.namespace);
        if self.tx.unbounded_send(reference).is_err() {
            warn!("Requeue channel closed, dropping requeue of {key}");
        }
    }
}

struct ShrinkStep {
    key: JobKey,
    from_workers: i32,
    to_workers: i32,
}

/// All controller-owned scheduling state. Lives behind one mutex in the
/// controller context; every reconcile pass holds that mutex throughout.
pub struct SchedulerState {
    pub slots: SlotLedger,
    pub running: JobQueue,
    pub queued: JobQueue,
    pub latest_replicas: HashMap<JobKey, i32>,
    pub phases: HashMap<JobKey, JobPhase>,
    pub committed_hostfiles: HashMap<JobKey, String>,
    pub pending_rescales: HashMap<JobKey, RescalePlan>,
}

impl SchedulerState {
    pub fn new(pool: u32) -> Self {
        Self {
            slots: SlotLedger::new(pool),
            running: JobQueue::default(),
            queued: JobQueue::default(),
            latest_replicas: HashMap::new(),
            phases: HashMap::new(),
            committed_hostfiles: HashMap::new(),
            pending_rescales: HashMap::new(),
        }
    }

    pub fn phase(&self, key: &JobKey) -> Option<JobPhase> {
        self.phases.get(key).copied()
    }

    /// Phase transitions keep the two queues in sync with the phase map:
    /// a job is in `queued` iff its phase is Queued and in `running` iff
    /// its phase is Running.
    pub fn set_created(&mut self, key: &JobKey) {
        self.phases.insert(key.clone(), JobPhase::Created);
        self.queued.remove(key);
        self.running.remove(key);
    }

    pub fn set_queued(&mut self, entry: &JobEntry) {
        self.phases.insert(entry.key.clone(), JobPhase::Queued);
        self.running.remove(&entry.key);
        self.queued.insert(entry.clone());
    }

    pub fn set_running(&mut self, entry: &JobEntry) {
        self.phases.insert(entry.key.clone(), JobPhase::Running);
        self.queued.remove(&entry.key);
        self.running.insert(entry.clone());
    }

    /// Drop every trace of a job. Returns whether the job was still
    /// tracked, so completion cleanup runs exactly once.
    pub fn forget(&mut self, key: &JobKey) -> bool {
        let tracked = self.phases.remove(key).is_some();
        self.latest_replicas.remove(key);
        self.committed_hostfiles.remove(key);
        self.pending_rescales.remove(key);
        self.running.remove(key);
        self.queued.remove(key);
        tracked
    }

    /// Decide the worker count for a job asking for admission.
    ///
    /// If the free pool (minus the launcher slot) covers `min_replicas`,
    /// the job is admitted with as many workers as fit up to
    /// `max_replicas`. Otherwise strictly lower-priority running jobs are
    /// considered for shrinking, worst priority first: a dry run plans
    /// concrete victims, and only if the plan covers the shortfall are
    /// shrink signals actually sent. A dry run that comes up short queues
    /// the job without touching anything.
    pub async fn admit(
        &mut self,
        entry: &JobEntry,
        census: &dyn WorkerCensus,
        signal: &dyn RescaleSignal,
        requeue: &Requeuer,
    ) -> Result<Admission, SchedulerError> {
        // the launcher occupies a slot of its own
        let available = i64::from(self.slots.free()) - 1;
        let fit = available.min(i64::from(entry.max_replicas));
        if fit >= i64::from(entry.min_replicas) {
            return Ok(Admission::Admit(fit as i32));
        }

        let needed = entry.min_replicas - available as i32;

        let mut plan: Vec<ShrinkStep> = Vec::new();
        let mut uncovered = needed;
        for victim in self.running.iter().rev() {
            if uncovered <= 0 {
                break;
            }
            // never preempt equal- or higher-priority work
            if victim.priority <= entry.priority {
                break;
            }
            let current = census.running_workers(&victim.key).await?;
            if current <= victim.min_replicas {
                continue;
            }
            let target = victim.min_replicas.max(current - uncovered);
            uncovered -= current - target;
            plan.push(ShrinkStep {
                key: victim.key.clone(),
                from_workers: current,
                to_workers: target,
            });
        }
        if uncovered > 0 {
            return Ok(Admission::Queue);
        }

        let mut freed = 0;
        for step in plan {
            if self.phases.get(&step.key) != Some(&JobPhase::Running) {
                continue;
            }
            if let Err(err) = signal
                .rescale(&step.key, step.from_workers, step.to_workers)
                .await
            {
                // pods stay, no slots are freed from this victim
                warn!("Shrink signal to {} failed: {err}", step.key);
                continue;
            }
            info!(
                "Shrunk {} from {} to {} workers for {}",
                step.key, step.from_workers, step.to_workers, entry.key
            );
            self.latest_replicas
                .insert(step.key.clone(), step.to_workers);
            self.slots
                .release((step.from_workers - step.to_workers) as u32);
            freed += step.from_workers - step.to_workers;
            requeue.requeue(&step.key);
        }
        if freed < needed {
            return Ok(Admission::Queue);
        }
        Ok(Admission::Admit(entry.min_replicas))
    }

    /// Hand freed slots to the most deserving jobs. Walks the running and
    /// queued queues together in ascending priority order, granting each
    /// head additional workers up to its maximum, until the budget is
    /// spent. Queued jobs granted at least their minimum leave the queue;
    /// the slots themselves are consumed later when their pods are
    /// actually created.
    pub async fn rebalance(
        &mut self,
        census: &dyn WorkerCensus,
        requeue: &Requeuer,
    ) -> Result<(), SchedulerError> {
        let mut budget = self.slots.free() as i32;
        let (mut i_run, mut i_que) = (0, 0);
        let mut promoted = Vec::new();

        while budget > 0 {
            let run_head = self.running.get(i_run).cloned();
            let que_head = self.queued.get(i_que).cloned();
            let (entry, from_queued) = match (run_head, que_head) {
                (None, None) => break,
                (Some(r), None) => {
                    i_run += 1;
                    (r, false)
                }
                (None, Some(q)) => {
                    i_que += 1;
                    (q, true)
                }
                (Some(r), Some(q)) => {
                    if q.priority < r.priority {
                        i_que += 1;
                        (q, true)
                    } else {
                        i_run += 1;
                        (r, false)
                    }
                }
            };

            let current = census.running_workers(&entry.key).await?;
            if current >= entry.max_replicas {
                continue;
            }
            let latest = self.latest_replicas.get(&entry.key).copied().unwrap_or(0);
            let target = entry.max_replicas.min(latest + budget);
            if target < entry.min_replicas || target <= latest {
                continue;
            }
            info!("Granting {} workers {latest} -> {target}", entry.key);
            self.latest_replicas.insert(entry.key.clone(), target);
            budget -= target - latest;
            if from_queued {
                promoted.push(entry.key.clone());
            }
            requeue.requeue(&entry.key);
        }

        for key in &promoted {
            self.queued.remove(key);
        }
        Ok(())
    }

    /// Cheap pass over the queue: any job whose admission now yields a
    /// positive worker count is granted it and handed back to the work
    /// queue.
    pub async fn recheck_queue(
        &mut self,
        census: &dyn WorkerCensus,
        signal: &dyn RescaleSignal,
        requeue: &Requeuer,
    ) -> Result<(), SchedulerError> {
        let entries: Vec<JobEntry> = self.queued.iter().cloned().collect();
        for entry in entries {
            match self.admit(&entry, census, signal, requeue).await? {
                Admission::Admit(replicas) => {
                    info!("Promoting queued job {} with {replicas} workers", entry.key);
                    self.latest_replicas.insert(entry.key.clone(), replicas);
                    self.queued.remove(&entry.key);
                    requeue.requeue(&entry.key);
                }
                Admission::Queue => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rescale::RescaleSignalError;
    use std::sync::Mutex;

    struct FixedCensus(HashMap<JobKey, i32>);

    impl FixedCensus {
        fn of(counts: &[(&JobKey, i32)]) -> Self {
            Self(
                counts
                    .iter()
                    .map(|(k, n)| ((*k).clone(), *n))
                    .collect(),
            )
        }
    }

    #[async_trait]
    impl WorkerCensus for FixedCensus {
        async fn running_workers(&self, key: &JobKey) -> Result<i32, SchedulerError> {
            Ok(self.0.get(key).copied().unwrap_or(0))
        }
    }

    #[derive(Default)]
    struct RecordingSignal {
        calls: Mutex<Vec<(JobKey, i32, i32)>>,
        fail: bool,
    }

    #[async_trait]
    impl RescaleSignal for RecordingSignal {
        async fn rescale(
            &self,
            key: &JobKey,
            from_procs: i32,
            to_procs: i32,
        ) -> Result<(), RescaleSignalError> {
            self.calls
                .lock()
                .unwrap()
                .push((key.clone(), from_procs, to_procs));
            if self.fail {
                Err(RescaleSignalError::NoLauncherPod(key.clone()))
            } else {
                Ok(())
            }
        }
    }

    fn entry(name: &str, priority: i32, min: i32, max: i32) -> JobEntry {
        JobEntry {
            key: JobKey::new("default", name),
            priority,
            min_replicas: min,
            max_replicas: max,
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ObjectRef<MPIJob>>) -> Vec<String> {
        let mut keys = Vec::new();
        while let Ok(Some(r)) = rx.try_next() {
            keys.push(r.name);
        }
        keys
    }

    #[tokio::test]
    async fn admit_fills_to_max_when_capacity_allows() {
        let mut state = SchedulerState::new(10);
        let (requeue, _rx) = Requeuer::channel();
        let job = entry("pi", 0, 2, 4);

        let decision = state
            .admit(&job, &FixedCensus::of(&[]), &RecordingSignal::default(), &requeue)
            .await
            .unwrap();
        assert_eq!(decision, Admission::Admit(4));

        // first-sight bookkeeping: launcher slot plus one per worker pod
        state.latest_replicas.insert(job.key.clone(), 4);
        state.set_created(&job.key);
        state.slots.reserve(1).unwrap();
        state.slots.reserve(4).unwrap();
        assert_eq!(state.slots.free(), 5);
    }

    #[tokio::test]
    async fn admit_queues_when_pool_cannot_fit() {
        let mut state = SchedulerState::new(2);
        let (requeue, _rx) = Requeuer::channel();
        let job = entry("big", 5, 2, 2);

        let decision = state
            .admit(&job, &FixedCensus::of(&[]), &RecordingSignal::default(), &requeue)
            .await
            .unwrap();
        assert_eq!(decision, Admission::Queue);
    }

    #[tokio::test]
    async fn admit_shrinks_lower_priority_jobs_to_fit() {
        let mut state = SchedulerState::new(5);
        let low = entry("low", 10, 1, 4);
        state.set_running(&low);
        state.latest_replicas.insert(low.key.clone(), 3);
        // low's launcher + 3 workers are placed, one slot left
        state.slots.reserve(4).unwrap();

        let census = FixedCensus::of(&[(&low.key, 3)]);
        let signal = RecordingSignal::default();
        let (requeue, mut rx) = Requeuer::channel();
        let high = entry("high", 0, 2, 2);

        let decision = state.admit(&high, &census, &signal, &requeue).await.unwrap();
        assert_eq!(decision, Admission::Admit(2));
        assert_eq!(
            *signal.calls.lock().unwrap(),
            vec![(low.key.clone(), 3, 1)]
        );
        assert_eq!(state.latest_replicas[&low.key], 1);
        assert_eq!(state.slots.free(), 3);
        assert_eq!(drain(&mut rx), vec!["low"]);
    }

    #[tokio::test]
    async fn admit_dry_run_failure_has_no_side_effects() {
        // Low can only shed one worker before hitting its minimum, which
        // does not cover High's demand: no shrink may be signalled.
        let mut state = SchedulerState::new(4);
        let low = entry("low", 10, 2, 4);
        state.set_running(&low);
        state.latest_replicas.insert(low.key.clone(), 3);
        state.slots.reserve(4).unwrap();

        let census = FixedCensus::of(&[(&low.key, 3)]);
        let signal = RecordingSignal::default();
        let (requeue, mut rx) = Requeuer::channel();
        let high = entry("high", 0, 2, 2);

        let decision = state.admit(&high, &census, &signal, &requeue).await.unwrap();
        assert_eq!(decision, Admission::Queue);
        assert!(signal.calls.lock().unwrap().is_empty());
        assert_eq!(state.latest_replicas[&low.key], 3);
        assert_eq!(state.slots.free(), 0);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn admit_keeps_victim_pods_when_shrink_signal_fails() {
        let mut state = SchedulerState::new(5);
        let low = entry("low", 10, 1, 4);
        state.set_running(&low);
        state.latest_replicas.insert(low.key.clone(), 3);
        state.slots.reserve(4).unwrap();

        let census = FixedCensus::of(&[(&low.key, 3)]);
        let signal = RecordingSignal {
            fail: true,
            ..RecordingSignal::default()
        };
        let (requeue, _rx) = Requeuer::channel();
        let high = entry("high", 0, 2, 2);

        let decision = state.admit(&high, &census, &signal, &requeue).await.unwrap();
        assert_eq!(decision, Admission::Queue);
        // the signal was attempted but the victim keeps its pods and slots
        assert_eq!(signal.calls.lock().unwrap().len(), 1);
        assert_eq!(state.latest_replicas[&low.key], 3);
        assert_eq!(state.slots.free(), 1);
    }

    #[tokio::test]
    async fn admit_never_preempts_equal_priority() {
        let mut state = SchedulerState::new(5);
        let peer = entry("peer", 0, 1, 4);
        state.set_running(&peer);
        state.latest_replicas.insert(peer.key.clone(), 3);
        state.slots.reserve(4).unwrap();

        let census = FixedCensus::of(&[(&peer.key, 3)]);
        let signal = RecordingSignal::default();
        let (requeue, _rx) = Requeuer::channel();

        let decision = state
            .admit(&entry("rival", 0, 2, 2), &census, &signal, &requeue)
            .await
            .unwrap();
        assert_eq!(decision, Admission::Queue);
        assert!(signal.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn rebalance_expands_running_job_after_completion() {
        // pool 10: A (4 workers + launcher) just completed and released
        // five slots, B is running at 5 of max 8
        let mut state = SchedulerState::new(10);
        let b = entry("b", 1, 2, 8);
        state.set_running(&b);
        state.latest_replicas.insert(b.key.clone(), 5);
        state.slots.reserve(5).unwrap();

        let census = FixedCensus::of(&[(&b.key, 5)]);
        let (requeue, mut rx) = Requeuer::channel();
        state.rebalance(&census, &requeue).await.unwrap();

        assert_eq!(state.latest_replicas[&b.key], 8);
        // slots are consumed when the pods are created, not here
        assert_eq!(state.slots.free(), 5);
        assert_eq!(drain(&mut rx), vec!["b"]);
    }

    #[tokio::test]
    async fn rebalance_serves_best_priority_first_and_promotes_queued() {
        let mut state = SchedulerState::new(10);
        let running = entry("running", 5, 1, 4);
        state.set_running(&running);
        state.latest_replicas.insert(running.key.clone(), 2);
        let waiting = entry("waiting", 0, 2, 2);
        state.set_queued(&waiting);
        state.slots.reserve(6).unwrap();

        let census = FixedCensus::of(&[(&running.key, 2)]);
        let (requeue, mut rx) = Requeuer::channel();
        state.rebalance(&census, &requeue).await.unwrap();

        // the queued higher-priority job is granted its workers first
        assert_eq!(state.latest_replicas[&waiting.key], 2);
        assert!(!state.queued.contains(&waiting.key));
        assert_eq!(state.latest_replicas[&running.key], 4);
        assert_eq!(drain(&mut rx), vec!["waiting", "running"]);
    }

    #[tokio::test]
    async fn rebalance_skips_jobs_that_cannot_reach_their_minimum() {
        let mut state = SchedulerState::new(4);
        let big = entry("big", 0, 4, 4);
        state.set_queued(&big);
        state.slots.reserve(2).unwrap();

        let census = FixedCensus::of(&[]);
        let (requeue, mut rx) = Requeuer::channel();
        state.rebalance(&census, &requeue).await.unwrap();

        assert!(state.queued.contains(&big.key));
        assert!(!state.latest_replicas.contains_key(&big.key));
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn recheck_promotes_jobs_that_fit_now() {
        let mut state = SchedulerState::new(5);
        let x = entry("x", 5, 2, 2);
        state.set_queued(&x);

        let census = FixedCensus::of(&[]);
        let signal = RecordingSignal::default();
        let (requeue, mut rx) = Requeuer::channel();
        state
            .recheck_queue(&census, &signal, &requeue)
            .await
            .unwrap();

        assert_eq!(state.latest_replicas[&x.key], 2);
        assert!(!state.queued.contains(&x.key));
        assert_eq!(drain(&mut rx), vec!["x"]);
    }

    #[tokio::test]
    async fn recheck_leaves_oversized_jobs_queued() {
        let mut state = SchedulerState::new(3);
        let big = entry("big", 5, 4, 8);
        state.set_queued(&big);

        let census = FixedCensus::of(&[]);
        let signal = RecordingSignal::default();
        let (requeue, mut rx) = Requeuer::channel();
        state
            .recheck_queue(&census, &signal, &requeue)
            .await
            .unwrap();

        assert!(state.queued.contains(&big.key));
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn forget_removes_all_traces_exactly_once() {
        let mut state = SchedulerState::new(10);
        let job = entry("done", 3, 1, 4);
        state.set_running(&job);
        state.latest_replicas.insert(job.key.clone(), 4);
        state
            .committed_hostfiles
            .insert(job.key.clone(), "host done-worker-0.done ++cpus 1\n".into());
        state.pending_rescales.insert(
            job.key.clone(),
            RescalePlan {
                from_workers: 2,
                to_workers: 4,
            },
        );

        assert!(state.forget(&job.key));
        assert!(!state.running.contains(&job.key));
        assert!(!state.latest_replicas.contains_key(&job.key));
        assert!(!state.committed_hostfiles.contains_key(&job.key));
        assert!(!state.pending_rescales.contains_key(&job.key));
        // a second completion observation must be a no-op
        assert!(!state.forget(&job.key));
    }

    #[tokio::test]
    async fn admit_then_rebalance_preserves_free_slots() {
        let mut state = SchedulerState::new(10);
        let (requeue, _rx) = Requeuer::channel();
        let job = entry("j", 0, 2, 4);

        let census = FixedCensus::of(&[]);
        let decision = state
            .admit(&job, &census, &RecordingSignal::default(), &requeue)
            .await
            .unwrap();
        assert_eq!(decision, Admission::Admit(4));
        state.rebalance(&census, &requeue).await.unwrap();
        assert_eq!(state.slots.free(), 10);
    }

    #[test]
    fn phase_transitions_keep_queues_exclusive() {
        let mut state = SchedulerState::new(10);
        let job = entry("flip", 2, 1, 2);
        state.set_queued(&job);
        state.set_running(&job);
        assert!(state.running.contains(&job.key));
        assert!(!state.queued.contains(&job.key));
        state.set_queued(&job);
        assert!(state.queued.contains(&job.key));
        assert!(!state.running.contains(&job.key));
    }
}

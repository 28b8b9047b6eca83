//! The per-job state machine: one reconcile pass drives a single MPIJob
//! from observation through admission, worker population, hostfile
//! commit, launcher lifecycle, and completion cleanup.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use crds::{CleanPodPolicy, MPIJob, ROLE_LAUNCHER, ROLE_WORKER};
use k8s_openapi::api::core::v1::Pod;
use kube::{Client, Resource, ResourceExt};
use kube_runtime::controller::Action;
use kube_runtime::events::Recorder;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::OperatorConfig;
use crate::events;
use crate::job::{self, hostfile, infra, launcher, workers};
use crate::rescale::{RescaleSignal, RescaleSignalError};
use crate::scheduler::{
    Admission, JobEntry, JobKey, JobPhase, Requeuer, RescalePlan, SchedulerError, SchedulerState,
    SlotsExhausted,
};
use crate::status::{self, StatusError};

/// Context shared by every reconcile pass
pub struct Context {
    pub client: Client,
    pub recorder: Recorder,
    pub config: OperatorConfig,
    /// All scheduling state, held for the duration of each pass
    pub scheduler: Mutex<SchedulerState>,
    pub requeue: Requeuer,
    pub census: workers::PodCensus,
    pub rescaler: Arc<dyn RescaleSignal>,
    pub failures: FailureBackoff,
}

/// Per-key retry throttle for failed reconciles. Each consecutive
/// failure of the same job doubles its requeue delay up to a ceiling;
/// one successful pass forgets the key entirely.
pub struct FailureBackoff {
    base: Duration,
    max: Duration,
    attempts: StdMutex<HashMap<JobKey, u32>>,
}

impl FailureBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempts: StdMutex::new(HashMap::new()),
        }
    }

    pub fn next_delay(&self, key: &JobKey) -> Duration {
        let mut attempts = self
            .attempts
            .lock()
            .expect("failure tracker lock poisoned");
        let count = attempts.entry(key.clone()).or_insert(0);
        *count += 1;
        let exp = (*count - 1).min(20);
        self.base.saturating_mul(1 << exp).min(self.max)
    }

    pub fn forget(&self, key: &JobKey) {
        self.attempts
            .lock()
            .expect("failure tracker lock poisoned")
            .remove(key);
    }
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("ensuring job infrastructure: {0}")]
    Infra(#[from] infra::InfraError),
    #[error("reconciling worker pods: {0}")]
    Workers(#[from] workers::WorkersError),
    #[error("reconciling hostfile config: {0}")]
    Hostfile(#[from] hostfile::HostfileError),
    #[error("managing launcher job: {0}")]
    Launcher(#[from] launcher::LauncherError),
    #[error("signalling rescale: {0}")]
    Rescale(#[from] RescaleSignalError),
    #[error("updating job status: {0}")]
    Status(#[from] StatusError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Slots(#[from] SlotsExhausted),
    #[error(transparent)]
    Kube(#[from] kube::Error),
}

pub async fn reconcile(job: Arc<MPIJob>, ctx: Arc<Context>) -> Result<Action, ReconcileError> {
    let result = reconcile_inner(&job, &ctx).await;
    match &result {
        Ok(_) => ctx.failures.forget(&JobKey::for_job(&job)),
        Err(err) => {
            if let Some(note) = ownership_conflict_note(err) {
                events::warning(&ctx.recorder, &job, events::ERR_RESOURCE_EXISTS, note).await;
            }
        }
    }
    result
}

/// Error function to call when the controller receives an error. Failing
/// keys are added back with rate-limited backoff, not a flat interval.
#[allow(clippy::needless_pass_by_value)]
pub fn on_error(job: Arc<MPIJob>, error: &ReconcileError, ctx: Arc<Context>) -> Action {
    let key = JobKey::for_job(&job);
    let delay = ctx.failures.next_delay(&key);
    error!("Reconciliation error for {key}: {error}, retrying in {delay:?}");
    Action::requeue(delay)
}

fn ownership_conflict_note(err: &ReconcileError) -> Option<String> {
    match err {
        ReconcileError::Infra(e @ infra::InfraError::NotOwned { .. }) => Some(e.to_string()),
        ReconcileError::Workers(e @ workers::WorkersError::NotOwned { .. }) => Some(e.to_string()),
        ReconcileError::Hostfile(e @ hostfile::HostfileError::NotOwned { .. }) => {
            Some(e.to_string())
        }
        ReconcileError::Launcher(e @ launcher::LauncherError::NotOwned { .. }) => {
            Some(e.to_string())
        }
        _ => None,
    }
}

enum Scheduled {
    Proceed,
    Queued,
}

async fn reconcile_inner(job: &MPIJob, ctx: &Context) -> Result<Action, ReconcileError> {
    // terminating jobs clean up through owner references
    if job.meta().deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }

    if let Err(err) = job.spec.validate() {
        events::warning(
            &ctx.recorder,
            job,
            events::VALIDATION_ERROR,
            format!("Found validation errors: {err}"),
        )
        .await;
        // invalid specs are not requeued
        return Ok(Action::await_change());
    }

    let key = JobKey::for_job(job);
    let entry = JobEntry::for_job(job);
    let mut state = ctx.scheduler.lock().await;
    debug!(
        "Reconciling {key}: free slots = {}/{}, running = {}, queued = {}",
        state.slots.free(),
        state.slots.pool(),
        state.running.len(),
        state.queued.len()
    );

    // pick up priority edits before any queue decision is made
    state.running.update_priority(&key, entry.priority);
    state.queued.update_priority(&key, entry.priority);

    let mut working_status = job.status.clone().unwrap_or_default();
    if working_status.conditions.is_empty()
        && status::mark_created(&mut working_status, &key.namespace, &key.name)
    {
        events::normal(
            &ctx.recorder,
            job,
            events::MPI_JOB_CREATED,
            format!("MPIJob {key} is created."),
        )
        .await;
    }

    // a recorded completion time means the launcher is done for good
    if working_status.is_finished() && working_status.completion_time.is_some() {
        return handle_completion(job, ctx, &mut state, &key).await;
    }

    if working_status.start_time.is_none() && !job.spec.is_suspended() {
        working_status.start_time = Some(status::now());
    }

    let mut launcher_job = launcher::get_launcher(&ctx.client, job).await?;
    let done = launcher_job.as_ref().is_some_and(job::is_job_finished);

    let mut worker_pods: Vec<Pod> = Vec::new();
    if !done {
        infra::ensure_service(&ctx.client, job).await?;
        infra::ensure_ssh_secret(&ctx.client, job).await?;

        if !job.spec.is_suspended() {
            let scheduled =
                run_scheduling(job, ctx, &mut state, &key, &entry, launcher_job.as_ref()).await?;
            if matches!(scheduled, Scheduled::Queued) {
                info!("Job {key} is queued, waiting for capacity");
                status::update_status(
                    &ctx.client,
                    &ctx.recorder,
                    job,
                    &mut working_status,
                    launcher_job.as_ref(),
                    &worker_pods,
                )
                .await?;
                return Ok(Action::requeue(ctx.config.requeue_interval()));
            }

            let latest = state.latest_replicas.get(&key).copied().unwrap_or(0);
            match reconcile_workers(job, ctx, &mut state, &key, &entry, latest).await? {
                None => {
                    info!("Job {key} no longer fits, back to the queue");
                    status::update_status(
                        &ctx.client,
                        &ctx.recorder,
                        job,
                        &mut working_status,
                        launcher_job.as_ref(),
                        &worker_pods,
                    )
                    .await?;
                    return Ok(Action::requeue(ctx.config.requeue_interval()));
                }
                Some(pods) => worker_pods = pods,
            }

            // commit the hostfile before any rescale so a launcher
            // re-reading its nodelist sees the new worker set
            let committed = hostfile::reconcile_config_map(
                &ctx.client,
                job,
                latest,
                &workers::running_pod_names(&worker_pods),
            )
            .await?;
            state
                .committed_hostfiles
                .insert(key.clone(), committed.hostfile.clone());

            let ready = workers::count_ready(&worker_pods);
            let persisted = hostfile::persisted_hostfile(&committed.config_map).unwrap_or_default();
            let converged = ready == latest
                && state.committed_hostfiles.get(&key).map(String::as_str) == Some(persisted);

            if converged {
                if let Some(plan) = state.pending_rescales.get(&key).copied() {
                    // grace window for pod DNS and SSH to settle
                    tokio::time::sleep(ctx.config.expand_grace()).await;
                    info!(
                        "Sending expand signal for {key}: {} -> {}",
                        plan.from_workers, plan.to_workers
                    );
                    ctx.rescaler
                        .rescale(&key, plan.from_workers, plan.to_workers)
                        .await?;
                    state.pending_rescales.remove(&key);
                } else if launcher_job.is_none() && state.phase(&key) == Some(JobPhase::Created) {
                    launcher_job = Some(
                        launcher::create_launcher(&ctx.client, job, latest, ctx.config.rescale_port)
                            .await?,
                    );
                    state.set_running(&entry);
                }
            } else {
                debug!("Waiting for {key} workers to converge: {ready}/{latest} ready");
            }
        }

        if launcher_job.is_some() {
            let pods = launcher::launcher_pods(&ctx.client, job).await?;
            if pods.iter().any(job::is_pod_running) {
                // idempotent; also the moment queued jobs may fit again
                state.set_running(&entry);
                state
                    .recheck_queue(&ctx.census, ctx.rescaler.as_ref(), &ctx.requeue)
                    .await?;
            }
        }
    }

    if let Some(l) = launcher_job.as_ref() {
        launcher::align_suspension(&ctx.client, job, l).await?;
    }

    if job.spec.is_suspended() {
        let accounted = state.latest_replicas.get(&key).copied().unwrap_or(0);
        workers::cleanup_workers(&ctx.client, job, &mut state.slots, accounted).await?;
        if let Some(ws) = working_status.worker.as_mut() {
            ws.active = 0;
        }
    }

    status::update_status(
        &ctx.client,
        &ctx.recorder,
        job,
        &mut working_status,
        launcher_job.as_ref(),
        &worker_pods,
    )
    .await?;
    Ok(Action::requeue(ctx.config.requeue_interval()))
}

/// Admission on first sight, re-activation of promoted queued jobs, and
/// detection of pending expansions.
async fn run_scheduling(
    job: &MPIJob,
    ctx: &Context,
    state: &mut SchedulerState,
    key: &JobKey,
    entry: &JobEntry,
    launcher_job: Option<&k8s_openapi::api::batch::v1::Job>,
) -> Result<Scheduled, ReconcileError> {
    // a running job whose pod population trails the desired count owes
    // the launcher an expand signal once the new pods are ready
    if state.phase(key) == Some(JobPhase::Running) {
        let existing = workers::list_worker_pods(&ctx.client, job).await?;
        let latest = state.latest_replicas.get(key).copied().unwrap_or(0);
        if (existing.len() as i32) < latest {
            let observed_running = workers::count_running(&existing);
            state
                .pending_rescales
                .entry(key.clone())
                .and_modify(|plan| plan.to_workers = latest)
                .or_insert(RescalePlan {
                    from_workers: observed_running,
                    to_workers: latest,
                });
        }
    }

    match state.phase(key) {
        None => {
            warn_restart_policy_overrides(job, ctx).await;
            let decision = state
                .admit(entry, &ctx.census, ctx.rescaler.as_ref(), &ctx.requeue)
                .await?;
            match decision {
                Admission::Admit(replicas) => {
                    info!("Admitting {key} with {replicas} workers");
                    state.latest_replicas.insert(key.clone(), replicas);
                    state.set_created(key);
                    // the launcher's slot is taken up front
                    state.slots.reserve(1)?;
                }
                Admission::Queue => {
                    state.set_queued(entry);
                    return Ok(Scheduled::Queued);
                }
            }
        }
        Some(JobPhase::Queued) => {
            let granted = state.latest_replicas.get(key).copied().unwrap_or(0);
            if granted == 0 {
                return Ok(Scheduled::Queued);
            }
            if launcher_job.is_none() && state.slots.reserve(1).is_err() {
                // lost the launcher slot to a faster admission
                state.set_queued(entry);
                return Ok(Scheduled::Queued);
            }
            info!("Re-activating queued job {key} with {granted} workers");
            state.set_created(key);
        }
        Some(JobPhase::Created | JobPhase::Running) => {}
    }
    Ok(Scheduled::Proceed)
}

/// The restart policy belongs to the replica spec; a value set directly
/// on a pod template is overridden by the builders and the user is told.
async fn warn_restart_policy_overrides(job: &MPIJob, ctx: &Context) {
    for (role, template) in [
        (ROLE_LAUNCHER, &job.spec.launcher.template),
        (ROLE_WORKER, &job.spec.worker.template),
    ] {
        let template_policy_set = template
            .spec
            .as_ref()
            .is_some_and(|s| s.restart_policy.is_some());
        if template_policy_set {
            let message = format!(
                "Restart policy in {role} pod template overridden by restart policy in replica spec"
            );
            warn!("{message}");
            events::warning(
                &ctx.recorder,
                job,
                events::SET_POD_TEMPLATE_RESTART_POLICY,
                message,
            )
            .await;
        }
    }
}

/// Drive the worker pod population toward `latest`. Returns `None` when
/// the shortfall exceeds the free pool and the job went back to the
/// queue.
async fn reconcile_workers(
    job: &MPIJob,
    ctx: &Context,
    state: &mut SchedulerState,
    key: &JobKey,
    entry: &JobEntry,
    latest: i32,
) -> Result<Option<Vec<Pod>>, ReconcileError> {
    let existing = workers::list_worker_pods(&ctx.client, job).await?;
    let shortfall = latest - existing.len() as i32;
    if shortfall > state.slots.free() as i32 {
        if state.phase(key) == Some(JobPhase::Created) {
            // hand back the launcher slot reserved at admission
            state.slots.release(1);
        }
        state.set_queued(entry);
        return Ok(None);
    }

    workers::delete_workers_beyond(&ctx.client, job, latest).await?;
    let pods = workers::ensure_workers(&ctx.client, job, latest, &mut state.slots).await?;
    Ok(Some(pods))
}

/// First observation of a completion: tear down workers per the clean-pod
/// policy, release the launcher slot, forget the job, and hand the freed
/// capacity to whoever deserves it most.
async fn handle_completion(
    job: &MPIJob,
    ctx: &Context,
    state: &mut SchedulerState,
    key: &JobKey,
) -> Result<Action, ReconcileError> {
    let Some(phase) = state.phase(key) else {
        return Ok(Action::await_change());
    };
    info!("MPIJob {key} completed, releasing its slots");

    if job.spec.run_policy.clean_pod_policy != CleanPodPolicy::None {
        let accounted = state.latest_replicas.get(key).copied().unwrap_or(0);
        workers::cleanup_workers(&ctx.client, job, &mut state.slots, accounted).await?;
    }
    state.forget(key);
    // the launcher's slot, reserved at admission; queued jobs never held one
    if matches!(phase, JobPhase::Created | JobPhase::Running) {
        state.slots.release(1);
    }

    state.rebalance(&ctx.census, &ctx.requeue).await?;
    Ok(Action::await_change())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_failure_and_caps() {
        let backoff =
            FailureBackoff::new(Duration::from_millis(5), Duration::from_secs(1000));
        let key = JobKey::new("default", "flaky");
        assert_eq!(backoff.next_delay(&key), Duration::from_millis(5));
        assert_eq!(backoff.next_delay(&key), Duration::from_millis(10));
        assert_eq!(backoff.next_delay(&key), Duration::from_millis(20));
        for _ in 0..40 {
            backoff.next_delay(&key);
        }
        assert_eq!(backoff.next_delay(&key), Duration::from_secs(1000));
    }

    #[test]
    fn backoff_forgets_on_success() {
        let backoff =
            FailureBackoff::new(Duration::from_millis(5), Duration::from_secs(1000));
        let key = JobKey::new("default", "recovered");
        backoff.next_delay(&key);
        backoff.next_delay(&key);
        backoff.forget(&key);
        assert_eq!(backoff.next_delay(&key), Duration::from_millis(5));
    }

    #[test]
    fn backoff_tracks_keys_independently() {
        let backoff =
            FailureBackoff::new(Duration::from_millis(5), Duration::from_secs(1000));
        let noisy = JobKey::new("default", "noisy");
        backoff.next_delay(&noisy);
        backoff.next_delay(&noisy);
        let quiet = JobKey::new("default", "quiet");
        assert_eq!(backoff.next_delay(&quiet), Duration::from_millis(5));
        assert_eq!(backoff.next_delay(&noisy), Duration::from_millis(20));
    }
}

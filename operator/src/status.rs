//! Maintains the MPIJob status subresource: conditions, per-role replica
//! counts, and the completion bookkeeping the reconciler keys off.

use crds::{JobConditionType, MPIJob, MPIJobStatus, ReplicaStatus};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use k8s_openapi::chrono::Utc;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use kube_runtime::events::Recorder;
use thiserror::Error;

use crate::events;
use crate::job::{
    get_job_condition, is_job_failed, is_job_succeeded, is_pod_failed, is_pod_running,
    is_pod_succeeded, launcher,
};

#[derive(Debug, Error)]
pub enum StatusError {
    #[error(transparent)]
    Kube(#[from] kube::Error),
}

pub fn now() -> Time {
    Time(Utc::now())
}

pub fn mark_created(status: &mut MPIJobStatus, namespace: &str, name: &str) -> bool {
    let message = format!("MPIJob {namespace}/{name} is created.");
    status.set_condition(
        JobConditionType::Created,
        true,
        events::MPI_JOB_CREATED,
        &message,
        now(),
    )
}

/// Fold the observed launcher and worker state into the working status
/// copy, emit events for transitions, and patch the status subresource if
/// anything changed against what the cluster has.
pub async fn update_status(
    client: &Client,
    recorder: &Recorder,
    job: &MPIJob,
    status: &mut MPIJobStatus,
    launcher_job: Option<&Job>,
    workers: &[Pod],
) -> Result<(), StatusError> {
    let qualified = format!("{}/{}", job.job_namespace(), job.name_any());

    if job.spec.is_suspended() {
        if status.set_condition(
            JobConditionType::Suspended,
            true,
            events::MPI_JOB_SUSPENDED,
            "MPIJob suspended",
            now(),
        ) {
            events::normal(
                recorder,
                job,
                events::MPI_JOB_SUSPENDED,
                "MPIJob suspended".to_owned(),
            )
            .await;
        }
    } else if status.condition(JobConditionType::Suspended).is_some() {
        // resumed if the suspension condition was set before
        if status.set_condition(
            JobConditionType::Suspended,
            false,
            events::MPI_JOB_RESUMED,
            "MPIJob resumed",
            now(),
        ) {
            events::normal(
                recorder,
                job,
                events::MPI_JOB_RESUMED,
                "MPIJob resumed".to_owned(),
            )
            .await;
            status.start_time = Some(now());
        }
    }

    let mut launcher_running_pods = 0;
    if let Some(launcher_job) = launcher_job {
        let pods = launcher::launcher_pods(client, job).await?;
        launcher_running_pods = pods.iter().filter(|p| is_pod_running(p)).count();

        let mut replica = ReplicaStatus {
            failed: launcher_job
                .status
                .as_ref()
                .and_then(|s| s.failed)
                .unwrap_or(0),
            ..ReplicaStatus::default()
        };
        if is_job_succeeded(launcher_job) {
            replica.succeeded = 1;
            let message = format!("MPIJob {qualified} successfully completed.");
            if status.set_condition(
                JobConditionType::Succeeded,
                true,
                events::MPI_JOB_SUCCEEDED,
                &message,
                now(),
            ) {
                events::normal(recorder, job, events::MPI_JOB_SUCCEEDED, message).await;
            }
            if status.completion_time.is_none() {
                status.completion_time = launcher_job
                    .status
                    .as_ref()
                    .and_then(|s| s.completion_time.clone())
                    .or_else(|| Some(now()));
            }
        } else if is_job_failed(launcher_job) {
            apply_failed_status(recorder, job, status, launcher_job, &pods, &qualified).await;
        } else {
            replica.active = launcher_running_pods as i32;
        }
        status.launcher = Some(replica);
    }

    let mut worker_replica = ReplicaStatus::default();
    let mut evicted = 0;
    for pod in workers {
        if is_pod_failed(pod) {
            worker_replica.failed += 1;
            let reason = pod.status.as_ref().and_then(|s| s.reason.as_deref());
            if reason == Some("Evicted") {
                evicted += 1;
            }
        } else if is_pod_succeeded(pod) {
            worker_replica.succeeded += 1;
        } else if is_pod_running(pod) {
            worker_replica.active += 1;
        }
    }
    if evicted > 0 {
        let message = format!("{evicted}/{} workers are evicted", workers.len());
        if status.set_condition(
            JobConditionType::Failed,
            true,
            events::MPI_JOB_EVICTED,
            &message,
            now(),
        ) {
            events::warning(recorder, job, events::MPI_JOB_EVICTED, message).await;
        }
    }
    let workers_running = worker_replica.active as usize;
    status.worker = Some(worker_replica);

    if job.spec.is_suspended() {
        status.set_condition(
            JobConditionType::Running,
            false,
            events::MPI_JOB_SUSPENDED,
            &format!("MPIJob {qualified} is suspended."),
            now(),
        );
    } else if launcher_job.is_some()
        && launcher_running_pods >= 1
        && workers_running == workers.len()
    {
        let message = format!("MPIJob {qualified} is running.");
        if status.set_condition(
            JobConditionType::Running,
            true,
            events::MPI_JOB_RUNNING,
            &message,
            now(),
        ) {
            events::normal(recorder, job, events::MPI_JOB_RUNNING, message).await;
        }
    }

    patch_if_changed(client, job, status).await
}

async fn apply_failed_status(
    recorder: &Recorder,
    job: &MPIJob,
    status: &mut MPIJobStatus,
    launcher_job: &Job,
    launcher_pods: &[Pod],
    qualified: &str,
) {
    let condition = get_job_condition(launcher_job, "Failed");
    let mut reason = condition
        .and_then(|c| c.reason.clone())
        .unwrap_or_default();
    if reason.is_empty() {
        reason = events::MPI_JOB_FAILED.to_owned();
    }
    let mut message = condition
        .and_then(|c| c.message.clone())
        .unwrap_or_default();
    if message.is_empty() {
        message = format!("MPIJob {qualified} has failed");
    }
    if reason == "BackoffLimitExceeded" {
        // carry the reason and message of the most recent failed pod
        let last_failed = launcher_pods
            .iter()
            .filter(|p| is_pod_failed(p))
            .max_by_key(|p| p.metadata.creation_timestamp.as_ref().map(|t| t.0));
        if let Some(pod) = last_failed {
            let pod_status = pod.status.as_ref();
            reason = format!(
                "{reason}/{}",
                pod_status
                    .and_then(|s| s.reason.as_deref())
                    .unwrap_or_default()
            );
            message = events::truncate_message(format!(
                "{message}: {}",
                pod_status
                    .and_then(|s| s.message.as_deref())
                    .unwrap_or_default()
            ));
        }
    }
    if status.set_condition(JobConditionType::Failed, true, &reason, &message, now()) {
        events::warning(recorder, job, &reason, message.clone()).await;
    }
    if status.completion_time.is_none() {
        status.completion_time = Some(now());
    }
}

pub async fn patch_if_changed(
    client: &Client,
    job: &MPIJob,
    status: &MPIJobStatus,
) -> Result<(), StatusError> {
    if job.status.as_ref() == Some(status) {
        return Ok(());
    }
    let api: Api<MPIJob> = Api::namespaced(client.clone(), &job.job_namespace());
    api.patch_status(
        &job.name_any(),
        &PatchParams::default(),
        &Patch::Merge(serde_json::json!({ "status": status })),
    )
    .await?;
    Ok(())
}

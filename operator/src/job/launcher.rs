//! The launcher Job: created once the workers and hostfile converged,
//! observed afterwards to learn when the MPI run finished.

use crds::{MPIJob, ROLE_LAUNCHER};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client, ResourceExt};
use serde_json::json;
use thiserror::Error;
use tracing::info;

use super::{is_controlled_by, is_job_suspended, role_selector};

#[derive(Debug, Error)]
pub enum LauncherError {
    #[error("job {name} already exists and is not managed by this MPIJob")]
    NotOwned { name: String },
    #[error(transparent)]
    Kube(#[from] kube::Error),
}

fn jobs_api(client: &Client, job: &MPIJob) -> Api<Job> {
    Api::namespaced(client.clone(), &job.job_namespace())
}

pub async fn get_launcher(client: &Client, job: &MPIJob) -> Result<Option<Job>, LauncherError> {
    let name = job.launcher_name();
    match jobs_api(client, job).get_opt(&name).await? {
        None => Ok(None),
        Some(launcher) => {
            if !is_controlled_by(&launcher.metadata, job) {
                return Err(LauncherError::NotOwned { name });
            }
            Ok(Some(launcher))
        }
    }
}

pub async fn create_launcher(
    client: &Client,
    job: &MPIJob,
    num_workers: i32,
    server_port: u16,
) -> Result<Job, LauncherError> {
    info!(
        "Creating launcher for {}/{} with {num_workers} workers",
        job.job_namespace(),
        job.name_any()
    );
    Ok(jobs_api(client, job)
        .create(
            &PostParams::default(),
            &job.launcher_job_spec(num_workers, server_port),
        )
        .await?)
}

/// Pods belonging to the launcher Job
pub async fn launcher_pods(client: &Client, job: &MPIJob) -> Result<Vec<Pod>, kube::Error> {
    let api: Api<Pod> = Api::namespaced(client.clone(), &job.job_namespace());
    let selector = role_selector(&job.name_any(), ROLE_LAUNCHER);
    Ok(api
        .list(&ListParams::default().labels(&selector))
        .await?
        .items)
}

/// Mirror the CR's suspend toggle onto the launcher Job.
pub async fn align_suspension(
    client: &Client,
    job: &MPIJob,
    launcher: &Job,
) -> Result<(), LauncherError> {
    let desired = job.spec.is_suspended();
    if is_job_suspended(launcher) == desired {
        return Ok(());
    }
    info!(
        "Setting suspend={desired} on launcher {}",
        launcher.name_any()
    );
    jobs_api(client, job)
        .patch(
            &launcher.name_any(),
            &PatchParams::default(),
            &Patch::Merge(json!({ "spec": { "suspend": desired } })),
        )
        .await?;
    Ok(())
}

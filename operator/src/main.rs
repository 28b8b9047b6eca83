//! mpiflex Kubernetes operator: schedules malleable MPI jobs over a fixed
//! pool of worker slots, resizing running jobs in place.
use std::sync::Arc;

use crds::{MPIJob, JOB_NAME_LABEL};
use envconfig::Envconfig;
use futures::stream::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret, Service};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::PostParams;
use kube::core::ErrorResponse;
use kube::{Api, Client, CustomResourceExt, ResourceExt};
use kube_runtime::events::{Recorder, Reporter};
use kube_runtime::reflector::ObjectRef;
use kube_runtime::watcher::{self, Config};
use kube_runtime::Controller;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::config::OperatorConfig;
use crate::job::workers::PodCensus;
use crate::reconciliation::{on_error, reconcile, Context, FailureBackoff};
use crate::rescale::LauncherRescale;
use crate::scheduler::{Requeuer, SchedulerState};

mod config;
mod events;
mod job;
mod reconciliation;
mod rescale;
mod scheduler;
mod status;

/// Main entry point
#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let operator_config =
        OperatorConfig::init_from_env().expect("Expected MPIFLEX_SLOT_POOL to be set");
    info!(
        "Scheduling over a pool of {} worker slots",
        operator_config.slot_pool
    );

    let client: Client = Client::try_default()
        .await
        .expect("Expected a valid KUBECONFIG environment variable.");

    install_crd(&client).await;

    let api: Api<MPIJob> = Api::all(client.clone());
    let (requeue, promoted) = Requeuer::channel();
    let recorder = Recorder::new(
        client.clone(),
        Reporter {
            controller: crds::OPERATOR_NAME.to_owned(),
            instance: None,
        },
    );
    let rescaler = Arc::new(LauncherRescale::new(
        client.clone(),
        operator_config.rescale_port,
        operator_config.rescale_timeout(),
    ));

    let context = Arc::new(Context {
        recorder,
        scheduler: Mutex::new(SchedulerState::new(operator_config.slot_pool)),
        requeue,
        census: PodCensus::new(client.clone()),
        rescaler,
        failures: FailureBackoff::new(
            operator_config.error_backoff_base(),
            operator_config.error_backoff_max(),
        ),
        config: operator_config,
        client: client.clone(),
    });

    info!("Starting controller");
    Controller::new(api, Config::default())
        .owns(Api::<Job>::all(client.clone()), Config::default())
        .owns(Api::<ConfigMap>::all(client.clone()), Config::default())
        .owns(Api::<Service>::all(client.clone()), Config::default())
        .owns(Api::<Secret>::all(client.clone()), Config::default())
        .watches(Api::<Pod>::all(client.clone()), Config::default(), pod_to_job)
        .reconcile_on(promoted)
        .run(reconcile, on_error, context)
        .for_each(|result| async move {
            match result {
                Ok(o) => debug!("Reconciliation OK: {o:?}"),
                Err(kube_runtime::controller::Error::QueueError(err)) => {
                    error!("Watch stream failed: {err}");
                    if is_auth_error(&err) {
                        // never recovers without new credentials, let the
                        // supervisor restart us
                        std::process::exit(1);
                    }
                }
                Err(e) => error!("Reconciliation failed: {e:?}"),
            }
        })
        .await;
}

fn is_auth_error(err: &watcher::Error) -> bool {
    match err {
        watcher::Error::InitialListFailed(kube::Error::Api(e))
        | watcher::Error::WatchStartFailed(kube::Error::Api(e))
        | watcher::Error::WatchFailed(kube::Error::Api(e)) => e.code == 401 || e.code == 403,
        watcher::Error::WatchError(e) => e.code == 401 || e.code == 403,
        _ => false,
    }
}

/// Pods map back to their MPIJob through the job-name label. This covers
/// workers (owned directly) as well as launcher pods, which are owned by
/// the launcher Job rather than the MPIJob itself.
fn pod_to_job(pod: Pod) -> Option<ObjectRef<MPIJob>> {
    let namespace = pod.namespace()?;
    let job_name = pod.labels().get(JOB_NAME_LABEL)?;
    Some(ObjectRef::new(job_name).within(&namespace))
}

/// Register the CRD in the cluster, tolerating a previous registration
async fn install_crd(client: &Client) {
    let crd_api: Api<CustomResourceDefinition> = Api::all(client.clone());
    match crd_api.create(&PostParams::default(), &MPIJob::crd()).await {
        Ok(_) => info!("Created MPIJob CRD"),
        Err(kube::Error::Api(ErrorResponse { code: 409, .. })) => {
            info!("MPIJob CRD already exists")
        }
        Err(e) => panic!("Unable to create MPIJob CRD: {e}"),
    }
}

//! Worker pod population: reconciling the indexed pod set toward the
//! scheduler's desired count, and the census the scheduler reads.

use async_trait::async_trait;
use crds::{CleanPodPolicy, MPIJob, REPLICA_INDEX_LABEL, ROLE_WORKER};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::{Api, Client, ResourceExt};
use thiserror::Error;
use tracing::debug;

use super::{is_controlled_by, is_pod_pending, is_pod_ready, is_pod_running, role_selector};
use crate::scheduler::{JobKey, SchedulerError, SlotLedger, SlotsExhausted, WorkerCensus};

#[derive(Debug, Error)]
pub enum WorkersError {
    #[error("pod {name} already exists and is not managed by this MPIJob")]
    NotOwned { name: String },
    #[error(transparent)]
    Slots(#[from] SlotsExhausted),
    #[error(transparent)]
    Kube(#[from] kube::Error),
}

fn pods_api(client: &Client, job: &MPIJob) -> Api<Pod> {
    Api::namespaced(client.clone(), &job.job_namespace())
}

pub async fn list_worker_pods(client: &Client, job: &MPIJob) -> Result<Vec<Pod>, kube::Error> {
    let selector = role_selector(&job.name_any(), ROLE_WORKER);
    let pods = pods_api(client, job)
        .list(&ListParams::default().labels(&selector))
        .await?;
    Ok(pods.items)
}

pub fn running_pod_names(pods: &[Pod]) -> Vec<String> {
    pods.iter()
        .filter(|p| is_pod_running(p))
        .map(|p| p.name_any())
        .collect()
}

pub fn count_running(pods: &[Pod]) -> i32 {
    pods.iter().filter(|p| is_pod_running(p)).count() as i32
}

pub fn count_ready(pods: &[Pod]) -> i32 {
    pods.iter().filter(|p| is_pod_ready(p)).count() as i32
}

/// Remove pods whose index fell off the desired range. Their slots were
/// already returned to the ledger when the shrink was committed.
pub async fn delete_workers_beyond(
    client: &Client,
    job: &MPIJob,
    keep: i32,
) -> Result<(), WorkersError> {
    let api = pods_api(client, job);
    for pod in list_worker_pods(client, job).await? {
        let Some(index) = pod_index(&pod) else {
            debug!("Worker pod {} has no replica index, skipping", pod.name_any());
            continue;
        };
        if index >= keep {
            delete_ignoring_missing(&api, &pod.name_any()).await?;
        }
    }
    Ok(())
}

/// Bring up the indexed pod set 0..replicas. Each pod actually created
/// takes one slot from the ledger; a failed creation takes none.
pub async fn ensure_workers(
    client: &Client,
    job: &MPIJob,
    replicas: i32,
    slots: &mut SlotLedger,
) -> Result<Vec<Pod>, WorkersError> {
    let api = pods_api(client, job);
    let mut pods = Vec::with_capacity(replicas.max(0) as usize);
    for index in 0..replicas {
        let name = job.worker_name(index);
        match api.get_opt(&name).await? {
            Some(pod) => {
                if !is_controlled_by(&pod.metadata, job) {
                    return Err(WorkersError::NotOwned { name });
                }
                pods.push(pod);
            }
            None => {
                let created = api
                    .create(&PostParams::default(), &job.worker_pod_spec(index))
                    .await?;
                slots.reserve(1)?;
                pods.push(created);
            }
        }
    }
    Ok(pods)
}

/// Tear down all worker pods, releasing one slot per accounted pod
/// actually deleted. Pods with index at or above `accounted_below`
/// returned their slot when the shrink was committed, so only deletion
/// below that bound releases. Used on suspension and completion;
/// repeated invocations converge to zero workers.
pub async fn cleanup_workers(
    client: &Client,
    job: &MPIJob,
    slots: &mut SlotLedger,
    accounted_below: i32,
) -> Result<(), WorkersError> {
    for index in 0..job.spec.worker.max_replicas {
        if remove_worker(client, job, index).await? && index < accounted_below {
            slots.release(1);
        }
    }
    Ok(())
}

async fn remove_worker(client: &Client, job: &MPIJob, index: i32) -> Result<bool, WorkersError> {
    let api = pods_api(client, job);
    let name = job.worker_name(index);
    let Some(pod) = api.get_opt(&name).await? else {
        return Ok(false);
    };
    if !is_controlled_by(&pod.metadata, job) {
        return Err(WorkersError::NotOwned { name });
    }
    // under the Running policy, pods that already finished are kept for
    // inspection; pending pods still go since they may yet start
    if job.spec.run_policy.clean_pod_policy == CleanPodPolicy::Running
        && !is_pod_running(&pod)
        && !is_pod_pending(&pod)
    {
        return Ok(false);
    }
    delete_ignoring_missing(&api, &name).await?;
    Ok(true)
}

async fn delete_ignoring_missing(api: &Api<Pod>, name: &str) -> Result<(), kube::Error> {
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
        Err(e) => Err(e),
    }
}

fn pod_index(pod: &Pod) -> Option<i32> {
    pod.labels().get(REPLICA_INDEX_LABEL)?.parse().ok()
}

/// Census over live worker pods, read by admission and rebalancing.
pub struct PodCensus {
    client: Client,
}

impl PodCensus {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl WorkerCensus for PodCensus {
    async fn running_workers(&self, key: &JobKey) -> Result<i32, SchedulerError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &key.namespace);
        let selector = role_selector(&key.name, ROLE_WORKER);
        let pods = api.list(&ListParams::default().labels(&selector)).await?;
        Ok(count_running(&pods.items))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::PodStatus;
    use std::collections::BTreeMap;

    fn pod(name: &str, index: Option<i32>, phase: &str) -> Pod {
        let mut labels = BTreeMap::new();
        if let Some(i) = index {
            labels.insert(REPLICA_INDEX_LABEL.to_owned(), i.to_string());
        }
        Pod {
            metadata: kube::api::ObjectMeta {
                name: Some(name.to_owned()),
                labels: Some(labels),
                ..Default::default()
            },
            status: Some(PodStatus {
                phase: Some(phase.to_owned()),
                ..PodStatus::default()
            }),
            ..Pod::default()
        }
    }

    #[test]
    fn counts_only_running_pods() {
        let pods = vec![
            pod("a-worker-0", Some(0), "Running"),
            pod("a-worker-1", Some(1), "Pending"),
            pod("a-worker-2", Some(2), "Running"),
        ];
        assert_eq!(count_running(&pods), 2);
        assert_eq!(
            running_pod_names(&pods),
            vec!["a-worker-0".to_owned(), "a-worker-2".to_owned()]
        );
    }

    #[test]
    fn pod_index_reads_the_replica_label() {
        assert_eq!(pod_index(&pod("a-worker-3", Some(3), "Running")), Some(3));
        assert_eq!(pod_index(&pod("stray", None, "Running")), None);
    }
}

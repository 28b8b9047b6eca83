//! Signalling a running launcher to resize its process group.

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::{api::ListParams, Api, Client};
use thiserror::Error;
use tracing::info;

use crate::job::{is_pod_running, role_selector};
use crate::scheduler::JobKey;
use crds::ROLE_LAUNCHER;

#[derive(Debug, Error)]
pub enum RescaleSignalError {
    #[error("no running launcher pod with an IP for {0}")]
    NoLauncherPod(JobKey),
    #[error("looking up launcher pod: {0}")]
    Kube(#[from] kube::Error),
    #[error(transparent)]
    Wire(#[from] rescale_client::RescaleError),
}

/// Seam between the scheduler and the launcher control endpoint. The call
/// blocks until the launcher replied; on failure the process group is
/// guaranteed untouched and the caller decides whether to retry.
#[async_trait]
pub trait RescaleSignal: Send + Sync {
    async fn rescale(
        &self,
        key: &JobKey,
        from_procs: i32,
        to_procs: i32,
    ) -> Result<(), RescaleSignalError>;
}

/// Production signal: resolve the job's launcher pod IP and speak the
/// `set_bitmap` protocol to its control port.
pub struct LauncherRescale {
    client: Client,
    port: u16,
    timeout: Duration,
}

impl LauncherRescale {
    pub fn new(client: Client, port: u16, timeout: Duration) -> Self {
        Self {
            client,
            port,
            timeout,
        }
    }

    async fn launcher_ip(&self, key: &JobKey) -> Result<String, RescaleSignalError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &key.namespace);
        let selector = role_selector(&key.name, ROLE_LAUNCHER);
        let launcher_pods = pods
            .list(&ListParams::default().labels(&selector))
            .await?;
        launcher_pods
            .items
            .iter()
            .filter(|p| is_pod_running(p))
            .find_map(|p| p.status.as_ref().and_then(|s| s.pod_ip.clone()))
            .ok_or_else(|| RescaleSignalError::NoLauncherPod(key.clone()))
    }
}

#[async_trait]
impl RescaleSignal for LauncherRescale {
    async fn rescale(
        &self,
        key: &JobKey,
        from_procs: i32,
        to_procs: i32,
    ) -> Result<(), RescaleSignalError> {
        let ip = self.launcher_ip(key).await?;
        info!(
            "Signalling launcher of {key} at {ip}:{} to rescale {from_procs} -> {to_procs}",
            self.port
        );
        rescale_client::rescale(&ip, self.port, from_procs, to_procs, self.timeout).await?;
        Ok(())
    }
}

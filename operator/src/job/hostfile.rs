//! The per-job configuration artifact: a hostfile naming every worker the
//! launcher should reach, and a discovery script listing the pods that are
//! actually running. The hostfile must be committed before any rescale is
//! signalled so a launcher re-reading its nodelist sees the new set.

use std::collections::BTreeMap;

use crds::{MPIJob, DISCOVER_HOSTS_SCRIPT_NAME, HOSTFILE_NAME};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::PostParams;
use kube::{Api, Client, ResourceExt};
use thiserror::Error;

use super::is_controlled_by;

#[derive(Debug, Error)]
pub enum HostfileError {
    #[error("config map {name} already exists and is not managed by this MPIJob")]
    NotOwned { name: String },
    #[error(transparent)]
    Kube(#[from] kube::Error),
}

/// One line per host the launcher may schedule ranks on. The launcher
/// itself is listed first when it doubles as a worker.
pub fn render_hostfile(job: &MPIJob, worker_replicas: i32) -> String {
    let job_name = job.name_any();
    let slots = job.spec.slots_per_worker;
    let mut out = String::new();
    if job.spec.run_launcher_as_worker {
        out.push_str(&format!(
            "host {}.{job_name} ++cpus {slots}\n",
            job.launcher_name()
        ));
    }
    for index in 0..worker_replicas {
        out.push_str(&format!(
            "host {}.{job_name} ++cpus {slots}\n",
            job.worker_name(index)
        ));
    }
    out
}

/// Shell script echoing the service DNS name of every currently running
/// pod, sorted by name so the output is stable between reconciles.
pub fn render_discover_hosts(job: &MPIJob, running_pods: &[String]) -> String {
    let job_name = job.name_any();
    let namespace = job.job_namespace();
    let mut names = running_pods.to_vec();
    names.sort();

    let mut out = String::from("#!/bin/sh\n");
    if job.spec.run_launcher_as_worker {
        out.push_str(&format!(
            "echo {}.{job_name}.{namespace}.svc\n",
            job.launcher_name()
        ));
    }
    for pod in names {
        out.push_str(&format!("echo {pod}.{job_name}.{namespace}.svc\n"));
    }
    out
}

pub struct CommittedConfig {
    pub config_map: ConfigMap,
    /// The hostfile text this controller now considers committed
    pub hostfile: String,
}

/// Reconcile the config artifact: create it if missing, refuse foreign
/// ownership, update it when the rendered content moved on.
pub async fn reconcile_config_map(
    client: &Client,
    job: &MPIJob,
    worker_replicas: i32,
    running_pods: &[String],
) -> Result<CommittedConfig, HostfileError> {
    let hostfile = render_hostfile(job, worker_replicas);
    let data = BTreeMap::from([
        (HOSTFILE_NAME.to_owned(), hostfile.clone()),
        (
            DISCOVER_HOSTS_SCRIPT_NAME.to_owned(),
            render_discover_hosts(job, running_pods),
        ),
    ]);

    let api: Api<ConfigMap> = Api::namespaced(client.clone(), &job.job_namespace());
    let name = job.config_map_name();
    let config_map = match api.get_opt(&name).await? {
        None => {
            api.create(&PostParams::default(), &job.config_map_spec(data))
                .await?
        }
        Some(existing) => {
            if !is_controlled_by(&existing.metadata, job) {
                return Err(HostfileError::NotOwned { name });
            }
            if existing.data.as_ref() != Some(&data) {
                let mut updated = existing;
                updated.data = Some(data);
                api.replace(&name, &PostParams::default(), &updated).await?
            } else {
                existing
            }
        }
    };
    Ok(CommittedConfig {
        config_map,
        hostfile,
    })
}

/// Hostfile text as persisted in the cluster, if any
pub fn persisted_hostfile(config_map: &ConfigMap) -> Option<&str> {
    config_map
        .data
        .as_ref()
        .and_then(|d| d.get(HOSTFILE_NAME))
        .map(String::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crds::{LauncherSpec, MPIJobSpec, WorkerSpec};

    fn job(run_launcher_as_worker: bool) -> MPIJob {
        let mut job = MPIJob::new(
            "sim",
            MPIJobSpec {
                slots_per_worker: 4,
                run_launcher_as_worker,
                worker: WorkerSpec {
                    min_replicas: 1,
                    max_replicas: 8,
                    ..WorkerSpec::default()
                },
                launcher: LauncherSpec::default(),
                ..MPIJobSpec::default()
            },
        );
        job.metadata.namespace = Some("hpc".to_owned());
        job
    }

    #[test]
    fn hostfile_lists_workers_in_index_order() {
        let rendered = render_hostfile(&job(false), 3);
        assert_eq!(
            rendered,
            "host sim-worker-0.sim ++cpus 4\n\
             host sim-worker-1.sim ++cpus 4\n\
             host sim-worker-2.sim ++cpus 4\n"
        );
    }

    #[test]
    fn hostfile_puts_launcher_first_when_it_runs_ranks() {
        let rendered = render_hostfile(&job(true), 1);
        assert_eq!(
            rendered,
            "host sim-launcher.sim ++cpus 4\nhost sim-worker-0.sim ++cpus 4\n"
        );
    }

    #[test]
    fn rendering_is_stable_for_an_unchanged_pod_set() {
        let job = job(false);
        assert_eq!(render_hostfile(&job, 5), render_hostfile(&job, 5));
    }

    #[test]
    fn discover_hosts_sorts_running_pods() {
        let pods = vec!["sim-worker-1".to_owned(), "sim-worker-0".to_owned()];
        let rendered = render_discover_hosts(&job(false), &pods);
        assert_eq!(
            rendered,
            "#!/bin/sh\n\
             echo sim-worker-0.sim.hpc.svc\n\
             echo sim-worker-1.sim.hpc.svc\n"
        );
    }
}

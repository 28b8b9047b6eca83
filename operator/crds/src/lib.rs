use std::collections::BTreeMap;

use k8s_openapi::{
    api::{
        batch::v1::{Job, JobSpec},
        core::v1::{
            Affinity, ConfigMap, ConfigMapVolumeSource, Container, EnvVar, KeyToPath, Pod,
            PodAffinity, PodAffinityTerm, PodDNSConfig, PodTemplateSpec, Secret,
            SecretVolumeSource, Service, ServiceSpec, Volume, VolumeMount,
            WeightedPodAffinityTerm,
        },
    },
    apimachinery::pkg::apis::meta::v1::{LabelSelector, Time},
};
use kube::{api::ObjectMeta, CustomResource, Resource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reexport of CustomResourceExt so the build script can use it
pub use kube::CustomResourceExt;

pub const OPERATOR_NAME: &str = "mpiflex-operator";

pub const OPERATOR_NAME_LABEL: &str = "mpiflex.io/operator-name";
pub const JOB_NAME_LABEL: &str = "mpiflex.io/job-name";
pub const JOB_ROLE_LABEL: &str = "mpiflex.io/job-role";
pub const REPLICA_INDEX_LABEL: &str = "mpiflex.io/replica-index";

pub const ROLE_LAUNCHER: &str = "launcher";
pub const ROLE_WORKER: &str = "worker";

pub const LAUNCHER_SUFFIX: &str = "-launcher";
pub const WORKER_SUFFIX: &str = "-worker";
pub const CONFIG_SUFFIX: &str = "-config";
pub const SSH_AUTH_SECRET_SUFFIX: &str = "-ssh";

pub const HOSTFILE_NAME: &str = "hostfile";
pub const DISCOVER_HOSTS_SCRIPT_NAME: &str = "discover_hosts.sh";
pub const CONFIG_MOUNT_PATH: &str = "/etc/mpi";
pub const CONFIG_VOLUME_NAME: &str = "mpi-job-config";

pub const SSH_AUTH_VOLUME_NAME: &str = "ssh-auth";
pub const ROOT_SSH_PATH: &str = "/root/.ssh";
pub const SSH_PRIVATE_KEY_DATA_KEY: &str = "ssh-privatekey";
pub const SSH_PUBLIC_KEY_DATA_KEY: &str = "ssh-publickey";
pub const SSH_PRIVATE_KEY_FILE: &str = "id_ed25519";
pub const SSH_PUBLIC_KEY_FILE: &str = "id_ed25519.pub";
pub const SSH_AUTHORIZED_KEYS_FILE: &str = "authorized_keys";

/// MPI flavor the job image is built against. Decides which environment
/// variables the launcher needs to find its hostfile.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, JsonSchema, Default)]
pub enum MPIImplementation {
    #[default]
    OpenMPI,
    Intel,
    MPICH,
}

/// What to do with worker pods once the job finished.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, JsonSchema, Default)]
pub enum CleanPodPolicy {
    #[default]
    All,
    Running,
    None,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, JsonSchema, Default)]
pub enum RestartPolicy {
    #[default]
    Never,
    OnFailure,
    Always,
    /// Restart only on non-zero exit codes. Maps to `Never` on the pod,
    /// retries are driven by the launcher Job's backoff.
    ExitCode,
}

impl RestartPolicy {
    fn pod_restart_policy(self) -> &'static str {
        match self {
            RestartPolicy::Never | RestartPolicy::ExitCode => "Never",
            RestartPolicy::OnFailure => "OnFailure",
            RestartPolicy::Always => "Always",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct RunPolicy {
    /// Worker pod cleanup once the launcher finished
    #[serde(default)]
    pub clean_pod_policy: CleanPodPolicy,

    /// Retry budget for the launcher Job
    pub backoff_limit: Option<i32>,

    /// Seconds to keep the finished launcher Job around
    pub ttl_seconds_after_finished: Option<i32>,

    /// Hard wall-clock limit for the launcher Job
    pub active_deadline_seconds: Option<i64>,

    /// Suspend the job: the launcher is paused and all workers are torn down
    pub suspend: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct LauncherSpec {
    #[serde(default)]
    pub restart_policy: RestartPolicy,

    pub template: PodTemplateSpec,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSpec {
    /// Smallest worker count the job can make progress with
    pub min_replicas: i32,

    /// Worker count the job would ideally run at
    pub max_replicas: i32,

    #[serde(default)]
    pub restart_policy: RestartPolicy,

    pub template: PodTemplateSpec,
}

/// Kubernetes CRD describing a malleable MPI job: one launcher plus a
/// worker group the scheduler may resize between `minReplicas` and
/// `maxReplicas` while the job runs.
#[derive(CustomResource, Serialize, Deserialize, Debug, PartialEq, Clone, JsonSchema, Default)]
#[kube(
    group = "mpiflex.io",
    version = "v1alpha1",
    kind = "MPIJob",
    plural = "mpijobs",
    derive = "PartialEq",
    status = "MPIJobStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct MPIJobSpec {
    /// Scheduling priority. Lower value means scheduled first.
    #[serde(default)]
    pub priority: i32,

    /// MPI slots each worker contributes to the hostfile
    #[serde(default = "default_slots_per_worker")]
    pub slots_per_worker: i32,

    /// Whether the launcher pod also runs ranks
    #[serde(default)]
    pub run_launcher_as_worker: bool,

    #[serde(default)]
    pub mpi_implementation: MPIImplementation,

    #[serde(default)]
    pub run_policy: RunPolicy,

    /// Where the SSH auth secret is mounted in launcher and worker pods
    #[serde(default = "default_ssh_auth_mount_path")]
    pub ssh_auth_mount_path: String,

    pub launcher: LauncherSpec,

    pub worker: WorkerSpec,
}

fn default_slots_per_worker() -> i32 {
    1
}

fn default_ssh_auth_mount_path() -> String {
    ROOT_SSH_PATH.to_owned()
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Copy, JsonSchema)]
pub enum JobConditionType {
    Created,
    Running,
    Suspended,
    Succeeded,
    Failed,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct JobCondition {
    #[serde(rename = "type")]
    pub type_: JobConditionType,
    /// "True" or "False", matching the Kubernetes condition convention
    pub status: String,
    pub reason: String,
    pub message: String,
    pub last_transition_time: Option<Time>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaStatus {
    pub active: i32,
    pub succeeded: i32,
    pub failed: i32,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MPIJobStatus {
    #[serde(default)]
    pub conditions: Vec<JobCondition>,

    pub launcher: Option<ReplicaStatus>,
    pub worker: Option<ReplicaStatus>,

    pub start_time: Option<Time>,
    pub completion_time: Option<Time>,
}

impl MPIJobStatus {
    pub fn condition(&self, type_: JobConditionType) -> Option<&JobCondition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    pub fn condition_is_true(&self, type_: JobConditionType) -> bool {
        self.condition(type_).is_some_and(|c| c.status == "True")
    }

    /// Set a condition, returning whether anything changed.
    /// `last_transition_time` only moves when the status flips.
    pub fn set_condition(
        &mut self,
        type_: JobConditionType,
        active: bool,
        reason: &str,
        message: &str,
        now: Time,
    ) -> bool {
        let status = if active { "True" } else { "False" };
        match self.conditions.iter_mut().find(|c| c.type_ == type_) {
            Some(existing) => {
                if existing.status == status
                    && existing.reason == reason
                    && existing.message == message
                {
                    return false;
                }
                if existing.status != status {
                    existing.last_transition_time = Some(now);
                }
                existing.status = status.to_owned();
                existing.reason = reason.to_owned();
                existing.message = message.to_owned();
                true
            }
            None => {
                self.conditions.push(JobCondition {
                    type_,
                    status: status.to_owned(),
                    reason: reason.to_owned(),
                    message: message.to_owned(),
                    last_transition_time: Some(now),
                });
                true
            }
        }
    }

    /// A job is finished once it either succeeded or stopped retrying.
    pub fn is_finished(&self) -> bool {
        self.condition_is_true(JobConditionType::Succeeded)
            || self.condition_is_true(JobConditionType::Failed)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("worker.minReplicas must be at least 1, got {0}")]
    MinReplicasTooSmall(i32),
    #[error("worker.minReplicas ({min}) must not exceed worker.maxReplicas ({max})")]
    ReplicaBoundsInverted { min: i32, max: i32 },
    #[error("slotsPerWorker must be at least 1, got {0}")]
    SlotsPerWorker(i32),
    #[error("launcher.template must have exactly one main container")]
    LauncherContainerMissing,
    #[error("worker.template must have exactly one main container")]
    WorkerContainerMissing,
}

impl MPIJobSpec {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.worker.min_replicas < 1 {
            return Err(ValidationError::MinReplicasTooSmall(
                self.worker.min_replicas,
            ));
        }
        if self.worker.min_replicas > self.worker.max_replicas {
            return Err(ValidationError::ReplicaBoundsInverted {
                min: self.worker.min_replicas,
                max: self.worker.max_replicas,
            });
        }
        if self.slots_per_worker < 1 {
            return Err(ValidationError::SlotsPerWorker(self.slots_per_worker));
        }
        if template_containers(&self.launcher.template).is_empty() {
            return Err(ValidationError::LauncherContainerMissing);
        }
        if template_containers(&self.worker.template).is_empty() {
            return Err(ValidationError::WorkerContainerMissing);
        }
        Ok(())
    }

    pub fn is_suspended(&self) -> bool {
        self.run_policy.suspend.unwrap_or(false)
    }
}

fn template_containers(template: &PodTemplateSpec) -> &[Container] {
    template
        .spec
        .as_ref()
        .map(|s| s.containers.as_slice())
        .unwrap_or_default()
}

pub fn default_labels(job_name: &str, role: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (OPERATOR_NAME_LABEL.to_owned(), OPERATOR_NAME.to_owned()),
        (JOB_NAME_LABEL.to_owned(), job_name.to_owned()),
        (JOB_ROLE_LABEL.to_owned(), role.to_owned()),
    ])
}

impl MPIJob {
    pub fn job_namespace(&self) -> String {
        self.namespace().unwrap_or_else(|| "default".to_owned())
    }

    pub fn launcher_name(&self) -> String {
        format!("{}{LAUNCHER_SUFFIX}", self.name_any())
    }

    pub fn worker_name(&self, index: i32) -> String {
        format!("{}{WORKER_SUFFIX}-{index}", self.name_any())
    }

    pub fn config_map_name(&self) -> String {
        format!("{}{CONFIG_SUFFIX}", self.name_any())
    }

    pub fn ssh_secret_name(&self) -> String {
        format!("{}{SSH_AUTH_SECRET_SUFFIX}", self.name_any())
    }

    /// Service name doubles as the pod subdomain for both roles
    pub fn service_name(&self) -> String {
        self.name_any()
    }

    fn owner_references(&self) -> Vec<k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference>
    {
        self.controller_owner_ref(&()).into_iter().collect()
    }

    fn child_meta(&self, name: String, labels: BTreeMap<String, String>) -> ObjectMeta {
        ObjectMeta {
            name: Some(name),
            namespace: Some(self.job_namespace()),
            labels: Some(labels),
            owner_references: Some(self.owner_references()),
            ..ObjectMeta::default()
        }
    }

    /// Headless service fronting launcher and worker pods. Gives every pod
    /// a stable `<pod>.<job>.<ns>.svc` DNS name.
    pub fn service_spec(&self) -> Service {
        let name = self.name_any();
        let selector = BTreeMap::from([
            (OPERATOR_NAME_LABEL.to_owned(), OPERATOR_NAME.to_owned()),
            (JOB_NAME_LABEL.to_owned(), name.clone()),
        ]);
        Service {
            metadata: self.child_meta(
                self.service_name(),
                BTreeMap::from([("app".to_owned(), name)]),
            ),
            spec: Some(ServiceSpec {
                cluster_ip: Some("None".to_owned()),
                selector: Some(selector),
                ..ServiceSpec::default()
            }),
            ..Service::default()
        }
    }

    /// SSH auth secret shared by launcher and workers. Key material is
    /// generated by the operator and passed in.
    pub fn ssh_secret_spec(&self, private_key: String, public_key: String) -> Secret {
        Secret {
            metadata: self.child_meta(
                self.ssh_secret_name(),
                BTreeMap::from([("app".to_owned(), self.name_any())]),
            ),
            type_: Some("kubernetes.io/ssh-auth".to_owned()),
            string_data: Some(BTreeMap::from([
                (SSH_PRIVATE_KEY_DATA_KEY.to_owned(), private_key),
                (SSH_PUBLIC_KEY_DATA_KEY.to_owned(), public_key),
            ])),
            ..Secret::default()
        }
    }

    /// Config map envelope for the hostfile and discovery script. The data
    /// itself is rendered by the hostfile manager.
    pub fn config_map_spec(&self, data: BTreeMap<String, String>) -> ConfigMap {
        ConfigMap {
            metadata: self.child_meta(
                self.config_map_name(),
                BTreeMap::from([("app".to_owned(), self.name_any())]),
            ),
            data: Some(data),
            ..ConfigMap::default()
        }
    }

    /// Worker pod with a stable indexed name. Workers run an SSH daemon by
    /// default and get pulled into the process group by the launcher.
    pub fn worker_pod_spec(&self, index: i32) -> Pod {
        let job_name = self.name_any();
        let name = self.worker_name(index);

        let template = &self.spec.worker.template;
        let mut labels = template
            .metadata
            .as_ref()
            .and_then(|m| m.labels.clone())
            .unwrap_or_default();
        labels.extend(default_labels(&job_name, ROLE_WORKER));
        labels.insert(REPLICA_INDEX_LABEL.to_owned(), index.to_string());

        let mut pod_spec = template.spec.clone().unwrap_or_default();
        pod_spec.hostname = Some(name.clone());
        // matches the job service, gives the pod a resolvable DNS name
        pod_spec.subdomain = Some(job_name.clone());
        pod_spec.restart_policy = Some(
            self.spec
                .worker
                .restart_policy
                .pod_restart_policy()
                .to_owned(),
        );
        if pod_spec.host_network.unwrap_or(false) {
            pod_spec.dns_policy = Some("ClusterFirstWithHostNet".to_owned());
        }
        // Intel and MPICH reach the launcher through its bare hostname
        let search = format!("{job_name}.{}.svc.cluster.local", self.job_namespace());
        match pod_spec.dns_config.as_mut() {
            Some(dns) => dns.searches.get_or_insert_with(Vec::new).push(search),
            None => {
                pod_spec.dns_config = Some(PodDNSConfig {
                    searches: Some(vec![search]),
                    ..PodDNSConfig::default()
                })
            }
        }
        if pod_spec.affinity.is_none() {
            pod_spec.affinity = Some(self.worker_affinity());
        }

        if let Some(container) = pod_spec.containers.first_mut() {
            if container.command.is_none() && container.args.is_none() {
                container.command = Some(vec!["/usr/sbin/sshd".to_owned(), "-De".to_owned()]);
            }
            container
                .env
                .get_or_insert_with(Vec::new)
                .push(env_var("K_MPI_JOB_ROLE", ROLE_WORKER));
        }
        self.add_ssh_volume(&mut pod_spec);

        Pod {
            metadata: ObjectMeta {
                annotations: template.metadata.as_ref().and_then(|m| m.annotations.clone()),
                ..self.child_meta(name, labels)
            },
            spec: Some(pod_spec),
            ..Pod::default()
        }
    }

    /// Launcher Job. The launcher binary gets told its initial process
    /// count and where to find the hostfile, and is started in server mode
    /// so the controller can signal rescales.
    pub fn launcher_job_spec(&self, num_workers: i32, server_port: u16) -> Job {
        let job_name = self.name_any();
        let launcher_name = self.launcher_name();

        let template = &self.spec.launcher.template;
        let mut labels = template
            .metadata
            .as_ref()
            .and_then(|m| m.labels.clone())
            .unwrap_or_default();
        labels.extend(default_labels(&job_name, ROLE_LAUNCHER));

        let mut pod_spec = template.spec.clone().unwrap_or_default();
        pod_spec.hostname = Some(launcher_name.clone());
        pod_spec.subdomain = Some(job_name.clone());
        pod_spec.restart_policy = Some(
            self.spec
                .launcher
                .restart_policy
                .pod_restart_policy()
                .to_owned(),
        );
        if pod_spec.host_network.unwrap_or(false) {
            pod_spec.dns_policy = Some("ClusterFirstWithHostNet".to_owned());
        }
        if pod_spec.affinity.is_none() {
            pod_spec.affinity = Some(self.launcher_affinity());
        }

        if let Some(container) = pod_spec.containers.first_mut() {
            let mut args = vec![format!("+p{num_workers}")];
            args.extend(container.args.take().unwrap_or_default());
            args.extend([
                "++nodelist".to_owned(),
                format!("{CONFIG_MOUNT_PATH}/{HOSTFILE_NAME}"),
                "++server".to_owned(),
                "++server-port".to_owned(),
                server_port.to_string(),
            ]);
            container.args = Some(args);

            let env = container.env.get_or_insert_with(Vec::new);
            env.push(env_var("K_MPI_JOB_ROLE", ROLE_LAUNCHER));
            env.extend(self.implementation_env());
            if !self.spec.run_launcher_as_worker {
                // keep GPUs off the launcher, it only drives the ranks
                env.push(env_var("NVIDIA_VISIBLE_DEVICES", ""));
                env.push(env_var("NVIDIA_DRIVER_CAPABILITIES", ""));
            }
            container
                .volume_mounts
                .get_or_insert_with(Vec::new)
                .push(VolumeMount {
                    name: CONFIG_VOLUME_NAME.to_owned(),
                    mount_path: CONFIG_MOUNT_PATH.to_owned(),
                    ..VolumeMount::default()
                });
        }

        pod_spec.volumes.get_or_insert_with(Vec::new).push(Volume {
            name: CONFIG_VOLUME_NAME.to_owned(),
            config_map: Some(ConfigMapVolumeSource {
                name: self.config_map_name(),
                items: Some(vec![
                    KeyToPath {
                        key: HOSTFILE_NAME.to_owned(),
                        path: HOSTFILE_NAME.to_owned(),
                        mode: Some(0o444),
                    },
                    KeyToPath {
                        key: DISCOVER_HOSTS_SCRIPT_NAME.to_owned(),
                        path: DISCOVER_HOSTS_SCRIPT_NAME.to_owned(),
                        mode: Some(0o555),
                    },
                ]),
                ..ConfigMapVolumeSource::default()
            }),
            ..Volume::default()
        });
        self.add_ssh_volume(&mut pod_spec);

        Job {
            metadata: self.child_meta(
                launcher_name,
                BTreeMap::from([("app".to_owned(), job_name)]),
            ),
            spec: Some(JobSpec {
                backoff_limit: self.spec.run_policy.backoff_limit,
                ttl_seconds_after_finished: self.spec.run_policy.ttl_seconds_after_finished,
                active_deadline_seconds: self.spec.run_policy.active_deadline_seconds,
                suspend: Some(self.spec.is_suspended()),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        annotations: template.metadata.as_ref().and_then(|m| m.annotations.clone()),
                        ..ObjectMeta::default()
                    }),
                    spec: Some(pod_spec),
                },
                ..JobSpec::default()
            }),
            ..Job::default()
        }
    }

    fn implementation_env(&self) -> Vec<EnvVar> {
        let hostfile_path = format!("{CONFIG_MOUNT_PATH}/{HOSTFILE_NAME}");
        let slots = self.spec.slots_per_worker.to_string();
        match self.spec.mpi_implementation {
            MPIImplementation::OpenMPI => vec![
                env_var("OMPI_MCA_orte_keep_fqdn_hostnames", "true"),
                env_var("OMPI_MCA_orte_default_hostfile", &hostfile_path),
                env_var("OMPI_MCA_plm_rsh_args", "-o ConnectionAttempts=10"),
                env_var("OMPI_MCA_orte_set_default_slots", &slots),
            ],
            MPIImplementation::Intel => vec![
                env_var("I_MPI_HYDRA_HOST_FILE", &hostfile_path),
                env_var(
                    "I_MPI_HYDRA_BOOTSTRAP_EXEC_EXTRA_ARGS",
                    "-o ConnectionAttempts=10",
                ),
                env_var("I_MPI_PERHOST", &slots),
            ],
            MPIImplementation::MPICH => vec![
                env_var("HYDRA_HOST_FILE", &hostfile_path),
                env_var("HYDRA_LAUNCH_EXTRA_ARGS", "-o ConnectionAttempts=10"),
            ],
        }
    }

    fn worker_affinity(&self) -> Affinity {
        let job_name = self.name_any();
        Affinity {
            pod_affinity: Some(PodAffinity {
                preferred_during_scheduling_ignored_during_execution: Some(vec![
                    zone_affinity_term(50, default_labels(&job_name, ROLE_LAUNCHER)),
                    zone_affinity_term(100, default_labels(&job_name, ROLE_WORKER)),
                ]),
                ..PodAffinity::default()
            }),
            ..Affinity::default()
        }
    }

    fn launcher_affinity(&self) -> Affinity {
        let job_name = self.name_any();
        Affinity {
            pod_affinity: Some(PodAffinity {
                preferred_during_scheduling_ignored_during_execution: Some(vec![
                    zone_affinity_term(100, default_labels(&job_name, ROLE_WORKER)),
                ]),
                ..PodAffinity::default()
            }),
            ..Affinity::default()
        }
    }

    fn add_ssh_volume(&self, pod_spec: &mut k8s_openapi::api::core::v1::PodSpec) {
        let mode = (self.spec.ssh_auth_mount_path == ROOT_SSH_PATH).then_some(0o600);
        pod_spec.volumes.get_or_insert_with(Vec::new).push(Volume {
            name: SSH_AUTH_VOLUME_NAME.to_owned(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(self.ssh_secret_name()),
                default_mode: mode,
                items: Some(vec![
                    KeyToPath {
                        key: SSH_PRIVATE_KEY_DATA_KEY.to_owned(),
                        path: SSH_PRIVATE_KEY_FILE.to_owned(),
                        mode: None,
                    },
                    KeyToPath {
                        key: SSH_PUBLIC_KEY_DATA_KEY.to_owned(),
                        path: SSH_PUBLIC_KEY_FILE.to_owned(),
                        mode: None,
                    },
                    KeyToPath {
                        key: SSH_PUBLIC_KEY_DATA_KEY.to_owned(),
                        path: SSH_AUTHORIZED_KEYS_FILE.to_owned(),
                        mode: None,
                    },
                ]),
                ..SecretVolumeSource::default()
            }),
            ..Volume::default()
        });
        if let Some(container) = pod_spec.containers.first_mut() {
            container
                .volume_mounts
                .get_or_insert_with(Vec::new)
                .push(VolumeMount {
                    name: SSH_AUTH_VOLUME_NAME.to_owned(),
                    mount_path: self.spec.ssh_auth_mount_path.clone(),
                    ..VolumeMount::default()
                });
        }
    }
}

fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_owned(),
        value: Some(value.to_owned()),
        ..EnvVar::default()
    }
}

fn zone_affinity_term(
    weight: i32,
    match_labels: BTreeMap<String, String>,
) -> WeightedPodAffinityTerm {
    WeightedPodAffinityTerm {
        weight,
        pod_affinity_term: PodAffinityTerm {
            label_selector: Some(LabelSelector {
                match_labels: Some(match_labels),
                ..LabelSelector::default()
            }),
            topology_key: "topology.kubernetes.io/zone".to_owned(),
            ..PodAffinityTerm::default()
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::PodSpec;
    use rstest::rstest;

    fn template_with_image(image: &str) -> PodTemplateSpec {
        PodTemplateSpec {
            metadata: None,
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "main".to_owned(),
                    image: Some(image.to_owned()),
                    ..Container::default()
                }],
                ..PodSpec::default()
            }),
        }
    }

    fn test_job(min: i32, max: i32) -> MPIJob {
        let mut job = MPIJob::new(
            "pi",
            MPIJobSpec {
                priority: 0,
                slots_per_worker: 2,
                worker: WorkerSpec {
                    min_replicas: min,
                    max_replicas: max,
                    restart_policy: RestartPolicy::default(),
                    template: template_with_image("mpi-app:latest"),
                },
                launcher: LauncherSpec {
                    restart_policy: RestartPolicy::default(),
                    template: template_with_image("mpi-app:latest"),
                },
                ..MPIJobSpec::default()
            },
        );
        job.metadata.namespace = Some("default".to_owned());
        job.metadata.uid = Some("1234-uid".to_owned());
        job
    }

    #[test]
    fn validate_accepts_sane_spec() {
        assert_eq!(test_job(1, 4).spec.validate(), Ok(()));
    }

    #[rstest]
    #[case(0, 4, ValidationError::MinReplicasTooSmall(0))]
    #[case(5, 4, ValidationError::ReplicaBoundsInverted { min: 5, max: 4 })]
    fn validate_rejects_bad_replica_bounds(
        #[case] min: i32,
        #[case] max: i32,
        #[case] expected: ValidationError,
    ) {
        assert_eq!(test_job(min, max).spec.validate(), Err(expected));
    }

    #[test]
    fn validate_rejects_bad_slots() {
        let mut job = test_job(1, 4);
        job.spec.slots_per_worker = 0;
        assert_eq!(job.spec.validate(), Err(ValidationError::SlotsPerWorker(0)));
    }

    #[test]
    fn validate_rejects_empty_templates() {
        let mut job = test_job(1, 4);
        job.spec.worker.template.spec = None;
        assert_eq!(
            job.spec.validate(),
            Err(ValidationError::WorkerContainerMissing)
        );
    }

    #[test]
    fn child_names_follow_job_name() {
        let job = test_job(1, 4);
        assert_eq!(job.launcher_name(), "pi-launcher");
        assert_eq!(job.worker_name(3), "pi-worker-3");
        assert_eq!(job.config_map_name(), "pi-config");
        assert_eq!(job.ssh_secret_name(), "pi-ssh");
    }

    #[test]
    fn worker_pod_carries_identity_and_dns() {
        let job = test_job(1, 4);
        let pod = job.worker_pod_spec(2);
        let labels = pod.metadata.labels.unwrap();
        assert_eq!(labels[JOB_ROLE_LABEL], ROLE_WORKER);
        assert_eq!(labels[REPLICA_INDEX_LABEL], "2");

        let spec = pod.spec.unwrap();
        assert_eq!(spec.hostname.as_deref(), Some("pi-worker-2"));
        assert_eq!(spec.subdomain.as_deref(), Some("pi"));
        let searches = spec.dns_config.unwrap().searches.unwrap();
        assert_eq!(searches, vec!["pi.default.svc.cluster.local".to_owned()]);
        // default command is an SSH daemon waiting for the launcher
        assert_eq!(
            spec.containers[0].command.as_ref().unwrap()[0],
            "/usr/sbin/sshd"
        );
    }

    #[test]
    fn worker_pod_owned_by_job() {
        let job = test_job(1, 4);
        let pod = job.worker_pod_spec(0);
        let owners = pod.metadata.owner_references.unwrap();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].kind, "MPIJob");
        assert_eq!(owners[0].controller, Some(true));
    }

    #[test]
    fn launcher_args_wrap_user_args() {
        let mut job = test_job(2, 4);
        if let Some(spec) = job.spec.launcher.template.spec.as_mut() {
            spec.containers[0].args = Some(vec!["./pingpong".to_owned()]);
        }
        let launcher = job.launcher_job_spec(4, 1234);
        let pod_spec = launcher.spec.unwrap().template.spec.unwrap();
        let args = pod_spec.containers[0].args.clone().unwrap();
        assert_eq!(
            args,
            vec![
                "+p4",
                "./pingpong",
                "++nodelist",
                "/etc/mpi/hostfile",
                "++server",
                "++server-port",
                "1234"
            ]
        );
    }

    #[test]
    fn launcher_env_matches_implementation() {
        let mut job = test_job(2, 4);
        job.spec.mpi_implementation = MPIImplementation::Intel;
        let launcher = job.launcher_job_spec(4, 1234);
        let pod_spec = launcher.spec.unwrap().template.spec.unwrap();
        let env = pod_spec.containers[0].env.clone().unwrap();
        assert!(env
            .iter()
            .any(|e| e.name == "I_MPI_HYDRA_HOST_FILE"
                && e.value.as_deref() == Some("/etc/mpi/hostfile")));
        assert!(env
            .iter()
            .any(|e| e.name == "I_MPI_PERHOST" && e.value.as_deref() == Some("2")));
    }

    #[test]
    fn launcher_mirrors_suspension() {
        let mut job = test_job(2, 4);
        job.spec.run_policy.suspend = Some(true);
        let launcher = job.launcher_job_spec(2, 1234);
        assert_eq!(launcher.spec.unwrap().suspend, Some(true));
    }

    #[test]
    fn conditions_transition_once() {
        let mut status = MPIJobStatus::default();
        let now = Time(k8s_openapi::chrono::Utc::now());
        assert!(status.set_condition(
            JobConditionType::Created,
            true,
            "MPIJobCreated",
            "created",
            now.clone()
        ));
        // same condition again is a no-op
        assert!(!status.set_condition(
            JobConditionType::Created,
            true,
            "MPIJobCreated",
            "created",
            now
        ));
        assert!(status.condition_is_true(JobConditionType::Created));
        assert!(!status.is_finished());
    }
}

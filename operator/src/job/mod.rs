//! Child resources of one MPIJob and the predicates the state machine
//! needs over them.

pub mod hostfile;
pub mod infra;
pub mod launcher;
pub mod workers;

use crds::{MPIJob, JOB_NAME_LABEL, JOB_ROLE_LABEL, OPERATOR_NAME, OPERATOR_NAME_LABEL};
use kube::Resource;
use k8s_openapi::api::batch::v1::{Job, JobCondition};
use k8s_openapi::api::core::v1::Pod;
use kube::api::ObjectMeta;
use kube::ResourceExt;

pub fn role_selector(job_name: &str, role: &str) -> String {
    format!(
        "{OPERATOR_NAME_LABEL}={OPERATOR_NAME},{JOB_NAME_LABEL}={job_name},{JOB_ROLE_LABEL}={role}"
    )
}

/// Whether this object is controlled by the given MPIJob. Children of the
/// expected name but foreign ownership must never be adopted.
pub fn is_controlled_by(meta: &ObjectMeta, job: &MPIJob) -> bool {
    let Some(owners) = meta.owner_references.as_ref() else {
        return false;
    };
    owners.iter().any(|r| {
        r.controller == Some(true)
            && r.kind == "MPIJob"
            && match job.meta().uid.as_ref() {
                Some(uid) => &r.uid == uid,
                None => r.name == job.name_any(),
            }
    })
}

pub fn is_pod_running(pod: &Pod) -> bool {
    pod_phase(pod) == Some("Running")
}

pub fn is_pod_pending(pod: &Pod) -> bool {
    pod_phase(pod) == Some("Pending")
}

pub fn is_pod_failed(pod: &Pod) -> bool {
    pod_phase(pod) == Some("Failed")
}

pub fn is_pod_succeeded(pod: &Pod) -> bool {
    pod_phase(pod) == Some("Succeeded")
}

fn pod_phase(pod: &Pod) -> Option<&str> {
    pod.status.as_ref().and_then(|s| s.phase.as_deref())
}

pub fn is_pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

pub fn get_job_condition<'a>(job: &'a Job, type_: &str) -> Option<&'a JobCondition> {
    job.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conds| conds.iter().find(|c| c.type_ == type_))
}

pub fn is_job_succeeded(job: &Job) -> bool {
    get_job_condition(job, "Complete").is_some_and(|c| c.status == "True")
}

pub fn is_job_failed(job: &Job) -> bool {
    get_job_condition(job, "Failed").is_some_and(|c| c.status == "True")
}

/// Done either way: succeeded or stopped retrying
pub fn is_job_finished(job: &Job) -> bool {
    is_job_succeeded(job) || is_job_failed(job)
}

pub fn is_job_suspended(job: &Job) -> bool {
    job.spec
        .as_ref()
        .and_then(|s| s.suspend)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PodCondition, PodStatus};

    fn pod_with(phase: &str, ready: bool) -> Pod {
        Pod {
            status: Some(PodStatus {
                phase: Some(phase.to_owned()),
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_owned(),
                    status: if ready { "True" } else { "False" }.to_owned(),
                    ..PodCondition::default()
                }]),
                ..PodStatus::default()
            }),
            ..Pod::default()
        }
    }

    #[test]
    fn pod_predicates() {
        assert!(is_pod_running(&pod_with("Running", true)));
        assert!(!is_pod_running(&pod_with("Pending", false)));
        assert!(is_pod_ready(&pod_with("Running", true)));
        assert!(!is_pod_ready(&pod_with("Running", false)));
    }

    #[test]
    fn selector_pins_operator_job_and_role() {
        assert_eq!(
            role_selector("pi", "worker"),
            "mpiflex.io/operator-name=mpiflex-operator,mpiflex.io/job-name=pi,mpiflex.io/job-role=worker"
        );
    }

    #[test]
    fn foreign_objects_are_not_controlled() {
        let job = MPIJob::new("pi", crds::MPIJobSpec::default());
        let meta = ObjectMeta::default();
        assert!(!is_controlled_by(&meta, &job));
    }
}

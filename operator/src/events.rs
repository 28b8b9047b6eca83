//! Kubernetes event recording for user-visible state transitions.

use crds::MPIJob;
use kube::Resource;
use kube_runtime::events::{Event, EventType, Recorder};
use tracing::warn;

pub const MPI_JOB_CREATED: &str = "MPIJobCreated";
pub const MPI_JOB_RUNNING: &str = "MPIJobRunning";
pub const MPI_JOB_SUCCEEDED: &str = "MPIJobSucceeded";
pub const MPI_JOB_FAILED: &str = "MPIJobFailed";
pub const MPI_JOB_SUSPENDED: &str = "MPIJobSuspended";
pub const MPI_JOB_RESUMED: &str = "MPIJobResumed";
pub const MPI_JOB_EVICTED: &str = "MPIJobEvicted";
pub const ERR_RESOURCE_EXISTS: &str = "ErrResourceExists";
pub const VALIDATION_ERROR: &str = "ValidationError";
pub const SET_POD_TEMPLATE_RESTART_POLICY: &str = "SetPodTemplateRestartPolicy";

/// Maximum size of an event message accepted by the API server
pub const EVENT_MESSAGE_LIMIT: usize = 1024;

pub fn truncate_message(message: String) -> String {
    if message.len() <= EVENT_MESSAGE_LIMIT {
        return message;
    }
    let suffix = "...";
    let mut cut = EVENT_MESSAGE_LIMIT - suffix.len();
    while !message.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}{suffix}", &message[..cut])
}

pub async fn normal(recorder: &Recorder, job: &MPIJob, reason: &str, note: String) {
    publish(recorder, job, EventType::Normal, reason, note).await;
}

pub async fn warning(recorder: &Recorder, job: &MPIJob, reason: &str, note: String) {
    publish(recorder, job, EventType::Warning, reason, note).await;
}

/// Failing to record an event never fails the reconcile.
async fn publish(recorder: &Recorder, job: &MPIJob, type_: EventType, reason: &str, note: String) {
    let event = Event {
        type_,
        reason: reason.to_owned(),
        note: Some(truncate_message(note)),
        action: "Reconcile".to_owned(),
        secondary: None,
    };
    if let Err(err) = recorder.publish(&event, &job.object_ref(&())).await {
        warn!("Failed to record {reason} event: {err}");
    }
}

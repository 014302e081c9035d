use k8s_openapi::api::core::v1::Pod;
use thiserror::Error;

/// Pod lifecycle notifications forwarded from the watch stream to the scale
/// loop.
#[derive(Debug, Clone)]
pub enum PodEvent {
    /// A pod matching the workload selector appeared.
    Added(Pod),
    /// A matching pod changed. Slot arithmetic cannot change on modification,
    /// so the scale loop ignores these.
    Modified(Pod),
    /// A matching pod was removed.
    Deleted(Pod),
}

/// Errors that can occur during orchestrator operations.
#[derive(Debug, Error)]
pub enum KubernetesError {
    #[error("failed to connect to Kubernetes API: {message}")]
    ConnectionFailed { message: String },
    #[error("failed to list nodes matching selector {selector:?}")]
    NodeListFailed { selector: String },
    #[error("failed to list pods bound to node {node_name}")]
    PodListFailed { node_name: String },
    #[error("failed to update node {node_name}")]
    NodeUpdateFailed { node_name: String },
    #[error("failed to watch pods: {message}")]
    WatchFailed { message: String },
    #[error("missing or malformed scheduling mark on node {node_name}")]
    SchedulingMarkInvalid { node_name: String },
}

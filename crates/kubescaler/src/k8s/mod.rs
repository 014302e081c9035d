//! Orchestrator integration module.
//!
//! Provides the typed node/pod view the scaler reasons over and the adapter
//! it talks to the cluster through.
//!
//! The main components are:
//! - [`Kubernetes`]: the capability trait the scaler consumes
//! - [`K8s`]: the kube-client backed implementation
//! - [`Node`] / [`NodeList`]: nodes paired with their pods, plus the
//!   resource arithmetic and cordon bookkeeping built on them
//! - [`PodWatcher`]: converts a pod watch stream into a bounded event channel

pub mod client;
pub mod node;
pub mod pod_watcher;
pub mod types;

pub use client::K8s;
pub use client::Kubernetes;
pub use node::Node;
pub use node::NodeList;
pub use node::Resource;
pub use pod_watcher::PodWatcher;
pub use types::KubernetesError;
pub use types::PodEvent;

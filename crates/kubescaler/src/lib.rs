//! Workload-aware autoscaler for Kubernetes node pools.
//!
//! Maintains a target amount of spare headroom ("buffer slots") for pods of
//! a designated workload class, growing the cloud node pool when headroom
//! drops below the buffer and shrinking it through cordon, expiration and
//! deletion when headroom exceeds it.
//!
//! Note on accounting: spare capacity is computed from container *limits*,
//! not requests, which differs from standard scheduler bookkeeping.

pub mod config;
pub mod k8s;
pub mod logging;
pub mod node_pool;
pub mod scaler;

pub use config::Cli;
pub use k8s::K8s;
pub use k8s::Kubernetes;
pub use node_pool::DriverRegistry;
pub use node_pool::NodePoolProvider;
pub use scaler::Scaler;
pub use scaler::ScalerConfig;

//! The scaling control loop.
//!
//! A single evaluator task, fed by a periodic ticker and the pod watch
//! channel, reconciles the node pool against the configured headroom buffer:
//! scale-up by uncordon-then-resize, scale-down by cordon, deletion of
//! cordoned nodes once they have been empty past the expiration.

use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use error_stack::Report;
use error_stack::ResultExt;
use k8s_openapi::api::core::v1::Pod;
use thiserror::Error;
use tokio::time::interval_at;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::k8s::node::sort_nodes_by_pods;
use crate::k8s::node::sort_nodes_by_pods_desc;
use crate::k8s::Kubernetes;
use crate::k8s::Node;
use crate::k8s::NodeList;
use crate::k8s::PodEvent;
use crate::k8s::PodWatcher;
use crate::k8s::Resource;
use crate::node_pool::NodePoolProvider;

/// Delay before reopening a pod watch that ended unexpectedly.
const WATCH_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Errors produced by the scale loop.
#[derive(Debug, Error)]
pub enum ScaleError {
    /// Sentinel: no cordoned node exists to recover capacity from. Swallowed
    /// by the caller, which proceeds to provisioning.
    #[error("not enough resources")]
    NotEnoughResources,
    /// The cordoned nodes, all uncordoned, still do not cover the requested
    /// resources.
    #[error("cordoned nodes cannot cover the requested resources")]
    InsufficientCordonedCapacity,
    #[error("node pool has no nodes to sample capacity from")]
    EmptyNodePool,
    #[error("node capacity for {resource} is unknown")]
    CapacityUnknown { resource: String },
    #[error("invalid scaler configuration: {message}")]
    InvalidConfig { message: String },
    #[error("failed to list nodes")]
    NodeListFailed,
    #[error("failed to update node {node_name}")]
    NodeUpdateFailed { node_name: String },
    #[error("failed to resize node pool to {count} node(s)")]
    ResizeFailed { count: usize },
    #[error("failed to delete expired nodes")]
    NodeDeleteFailed,
    #[error("failed to open pod watch")]
    WatchFailed,
}

/// Scale loop configuration.
#[derive(Debug, Clone)]
pub struct ScalerConfig {
    /// Label selector identifying pool members.
    pub node_selector: String,
    /// Inclusive pool size bounds.
    pub minimum_node: usize,
    pub maximum_node: usize,
    /// CPU request of one workload slot, in milli-units.
    pub pod_cpu_request: i64,
    /// Label key/value identifying workload pods.
    pub pod_label_name: String,
    pub pod_label_value: String,
    /// Target headroom, in slots.
    pub buffer_slot_size: i64,
    /// How long a node must stay cordoned and workload-free before deletion.
    pub empty_node_expiration: Duration,
    /// Tick period of the scale loop; also the deadline of a single pass.
    pub scale_loop_interval: Duration,
}

impl ScalerConfig {
    fn validate(&self) -> Result<(), Report<ScaleError>> {
        let fail = |message: &str| {
            Err(Report::new(ScaleError::InvalidConfig {
                message: message.to_string(),
            }))
        };

        if self.node_selector.is_empty() {
            return fail("node selector is required");
        }
        if self.pod_label_name.is_empty() || self.pod_label_value.is_empty() {
            return fail("workload pod label name and value are required");
        }
        if self.minimum_node > self.maximum_node {
            return fail("minimum node pool size exceeds maximum");
        }
        if self.pod_cpu_request <= 0 {
            return fail("pod CPU request must be positive");
        }
        if self.buffer_slot_size < 0 {
            return fail("buffer slot size must not be negative");
        }
        if self.scale_loop_interval.is_zero() {
            return fail("scale loop tick must be positive");
        }
        Ok(())
    }
}

/// The autoscaler: owns the decision logic converting (nodes, workload pods,
/// buffer target, bounds, expiration) into resize, cordon/uncordon and
/// delete actions.
pub struct Scaler {
    config: ScalerConfig,
    provider: Arc<dyn NodePoolProvider>,
    kube: Arc<dyn Kubernetes>,
}

impl Scaler {
    /// # Errors
    ///
    /// - [`ScaleError::InvalidConfig`] when the configuration is inconsistent
    pub fn new(
        provider: Arc<dyn NodePoolProvider>,
        kube: Arc<dyn Kubernetes>,
        config: ScalerConfig,
    ) -> Result<Self, Report<ScaleError>> {
        config.validate()?;
        Ok(Self {
            config,
            provider,
            kube,
        })
    }

    /// Run the scale loop until the token is cancelled.
    ///
    /// A pass runs on every tick and on every added/deleted workload pod
    /// event; modifications cannot change slot arithmetic and are ignored.
    /// Passes are strictly serialized, and an in-flight pass completes before
    /// cancellation takes effect.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), Report<ScaleError>> {
        let mut watcher = self.open_pod_watcher().await?;

        let mut ticker = interval_at(
            Instant::now() + self.config.scale_loop_interval,
            self.config.scale_loop_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("scale loop started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("scale loop shutdown requested");
                    break;
                }
                event = watcher.next_event() => match event {
                    Some(PodEvent::Added(_) | PodEvent::Deleted(_)) => {
                        self.run_scale_pass().await;
                    }
                    Some(PodEvent::Modified(_)) => {}
                    None => {
                        warn!("pod watch ended unexpectedly, reopening");
                        tokio::time::sleep(WATCH_RETRY_DELAY).await;
                        match self.open_pod_watcher().await {
                            Ok(reopened) => {
                                let old = std::mem::replace(&mut watcher, reopened);
                                old.stop().await;
                            }
                            Err(e) => error!("failed to reopen pod watch: {e:?}"),
                        }
                    }
                },
                _ = ticker.tick() => {
                    self.run_scale_pass().await;
                }
            }
        }

        // Drain the watch before returning so nothing is left sending.
        watcher.stop().await;
        Ok(())
    }

    async fn run_scale_pass(&self) {
        match tokio::time::timeout(self.config.scale_loop_interval, self.scale()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("error while trying to scale: {e:?}"),
            Err(_) => warn!(
                deadline = ?self.config.scale_loop_interval,
                "scale pass exceeded its deadline"
            ),
        }
    }

    async fn open_pod_watcher(&self) -> Result<PodWatcher, Report<ScaleError>> {
        let selector = format!(
            "{}={}",
            self.config.pod_label_name, self.config.pod_label_value
        );
        self.kube
            .pod_watcher(None, &selector)
            .await
            .change_context(ScaleError::WatchFailed)
    }

    /// One evaluation pass. Issues at most one of resize-up, cordon,
    /// uncordon, then checks for expired cordoned nodes to delete.
    async fn scale(&self) -> Result<(), Report<ScaleError>> {
        debug!("scaling");
        let nodes = self.load_nodes().await?;
        debug!(
            current = nodes.len(),
            available = nodes.available_nodes().len(),
            "loaded node snapshot"
        );

        if nodes.len() < self.config.minimum_node {
            info!(
                current = nodes.len(),
                minimum = self.config.minimum_node,
                "node pool below minimum size, resizing"
            );
            return self
                .provider
                .resize_node(self.config.minimum_node)
                .await
                .change_context(ScaleError::ResizeFailed {
                    count: self.config.minimum_node,
                });
        }

        let need = Resource::cpu(self.config.pod_cpu_request);
        let available_slot = nodes.available_slot(&need);
        info!(
            available_slot,
            buffer = self.config.buffer_slot_size,
            "evaluated headroom"
        );

        if available_slot < self.config.buffer_slot_size {
            // Uncordoning is cheaper than provisioning, so try that first.
            let uncordon_need = Resource::cpu(
                self.config.pod_cpu_request * self.config.buffer_slot_size,
            );
            if let Err(e) = self.check_for_scheduling(&nodes, &[uncordon_need]).await {
                if !matches!(e.current_context(), ScaleError::NotEnoughResources) {
                    return Err(e);
                }
                debug!("no cordoned node to recover capacity from");
            }

            // Freshly uncordoned nodes now contribute headroom.
            let nodes = self.load_nodes().await?;
            let available_slot = nodes.available_slot(&need);
            info!(
                available_slot,
                buffer = self.config.buffer_slot_size,
                "requesting node pool increase"
            );
            let grow_need = Resource::cpu(
                self.config.pod_cpu_request * (self.config.buffer_slot_size - available_slot),
            );
            self.increase_node_pool_size(&nodes, &[grow_need]).await?;
        } else if available_slot > self.config.buffer_slot_size {
            let excess = Resource::cpu(
                self.config.pod_cpu_request * (available_slot - self.config.buffer_slot_size),
            );
            self.check_for_unscheduling(&nodes, &[excess]).await?;
        }

        self.delete_extra_nodes().await
    }

    async fn load_nodes(&self) -> Result<NodeList, Report<ScaleError>> {
        self.kube
            .nodes(&self.config.node_selector)
            .await
            .change_context(ScaleError::NodeListFailed)
    }

    /// Milli-capacity of the pool's node template. The pool is uniform, so
    /// the first node stands in for all of them.
    fn template_capacity(
        &self,
        nodes: &NodeList,
        resource: &str,
    ) -> Result<i64, Report<ScaleError>> {
        let template = nodes
            .nodes
            .first()
            .ok_or_else(|| Report::new(ScaleError::EmptyNodePool))?;
        let capacity = template.resource_capacity(resource);
        if capacity <= 0 {
            return Err(Report::new(ScaleError::CapacityUnknown {
                resource: resource.to_string(),
            }));
        }
        Ok(capacity)
    }

    /// Resize the pool up to cover `needs`, clamped to the maximum.
    async fn increase_node_pool_size(
        &self,
        nodes: &NodeList,
        needs: &[Resource],
    ) -> Result<(), Report<ScaleError>> {
        let mut max_needed: i64 = 0;
        for need in needs {
            let capacity = self.template_capacity(nodes, &need.name)?;
            let needed = {
                let quotient = need.value / capacity;
                let remainder = need.value % capacity;
                if remainder > 0 {
                    quotient + 1
                } else {
                    quotient
                }
            }
            .max(0);
            debug!(
                resource = %need.name,
                value = need.value,
                nodes = needed,
                "resource shortfall"
            );
            max_needed = max_needed.max(needed);
        }

        let available = nodes.available_nodes().len();
        let mut size = max_needed as usize + available;
        debug!(
            needed = max_needed,
            available, size, "computed target pool size"
        );
        if size > self.config.maximum_node {
            size = self.config.maximum_node;
        }

        self.provider
            .resize_node(size)
            .await
            .change_context(ScaleError::ResizeFailed { count: size })
    }

    /// Cordon the least-loaded schedulable nodes covering the excess
    /// headroom, if the excess amounts to at least one whole node.
    async fn check_for_unscheduling(
        &self,
        nodes: &NodeList,
        extras: &[Resource],
    ) -> Result<(), Report<ScaleError>> {
        debug!(
            nodes = nodes.len(),
            extra = extras[0].value,
            resource = %extras[0].name,
            "check for unscheduling"
        );

        let mut min_extra: Option<i64> = None;
        for extra in extras {
            let capacity = self.template_capacity(nodes, &extra.name)?;
            let extra_nodes = extra.value / capacity;
            min_extra = Some(min_extra.map_or(extra_nodes, |m| m.min(extra_nodes)));
        }
        let min_extra = min_extra.unwrap_or(0);

        debug!(extra_nodes = min_extra, "extra node(s) beyond buffer");
        if min_extra <= 0 {
            return Ok(());
        }

        // Only schedulable nodes are candidates: re-cordoning a cordoned
        // node would refresh its scheduling mark without a schedulability
        // flip and keep postponing its expiration.
        let mut candidates: Vec<Node> = nodes
            .schedulable_nodes()
            .into_iter()
            .cloned()
            .collect();
        sort_nodes_by_pods(&mut candidates);

        for node in candidates.iter_mut().take(min_extra as usize) {
            self.mark_node_as_unschedulable(node).await?;
            debug!(
                node = node.name(),
                pods = node.pods.len(),
                "node marked as unschedulable"
            );
        }
        Ok(())
    }

    /// Uncordon nodes until the requested resources are covered, preferring
    /// nodes that still carry pods (minimizing future deletions).
    ///
    /// # Errors
    ///
    /// - [`ScaleError::NotEnoughResources`] when no cordoned node exists
    /// - [`ScaleError::InsufficientCordonedCapacity`] when every cordoned
    ///   node was uncordoned without covering the request
    async fn check_for_scheduling(
        &self,
        nodes: &NodeList,
        needs: &[Resource],
    ) -> Result<(), Report<ScaleError>> {
        debug!(
            nodes = nodes.len(),
            need = needs[0].value,
            resource = %needs[0].name,
            "check for scheduling"
        );

        let mut cordoned: Vec<Node> = nodes
            .unschedulable_nodes()
            .into_iter()
            .cloned()
            .collect();
        if cordoned.is_empty() {
            debug!("no unscheduled node found");
            return Err(Report::new(ScaleError::NotEnoughResources));
        }

        let mut remaining: Vec<(String, i64)> = needs
            .iter()
            .map(|need| (need.name.clone(), need.value))
            .collect();

        sort_nodes_by_pods_desc(&mut cordoned);

        for node in cordoned.iter_mut() {
            self.mark_node_as_schedulable(node).await?;
            debug!(node = node.name(), "node marked as schedulable");

            for (resource, value) in remaining.iter_mut() {
                *value -= node.available_resource(resource);
                debug!(resource = %resource, remaining = *value, "needed resource");
            }
            if remaining.iter().all(|(_, value)| *value <= 0) {
                return Ok(());
            }
        }

        Err(Report::new(ScaleError::InsufficientCordonedCapacity))
    }

    /// Delete cordoned nodes that have been workload-free past the
    /// expiration, never dropping the pool below its minimum.
    async fn delete_extra_nodes(&self) -> Result<(), Report<ScaleError>> {
        debug!("checking for extra nodes to delete");
        let nodes = self.load_nodes().await?;

        let mut live = nodes.len();
        if live <= self.config.minimum_node {
            debug!("already at minimum node pool size");
            return Ok(());
        }

        let mut delete_nodes: Vec<String> = Vec::new();
        for node in nodes.unschedulable_nodes() {
            let marked_at = match node.scheduling_mark_timestamp() {
                Ok(t) => t,
                Err(e) => {
                    warn!(
                        node = node.name(),
                        "skipping node with unreadable scheduling mark: {e:?}"
                    );
                    continue;
                }
            };

            let workload_pods = self.workload_pod_count(&node.pods);
            let expired = self.scheduling_mark_expired(marked_at);
            debug!(
                node = node.name(),
                workload_pods, expired, "checked node for deletion"
            );

            if workload_pods == 0 && expired {
                info!(node = node.name(), "node eligible for deletion");
                delete_nodes.push(node.name().to_string());
                live -= 1;
                if live <= self.config.minimum_node {
                    break;
                }
            }
        }

        if delete_nodes.is_empty() {
            return Ok(());
        }
        self.provider
            .delete_nodes(&delete_nodes)
            .await
            .change_context(ScaleError::NodeDeleteFailed)
    }

    async fn mark_node_as_schedulable(&self, node: &mut Node) -> Result<(), Report<ScaleError>> {
        node.mark_as_schedulable();
        self.kube
            .update_node(node)
            .await
            .change_context(ScaleError::NodeUpdateFailed {
                node_name: node.name().to_string(),
            })
    }

    async fn mark_node_as_unschedulable(&self, node: &mut Node) -> Result<(), Report<ScaleError>> {
        node.mark_as_unschedulable();
        self.kube
            .update_node(node)
            .await
            .change_context(ScaleError::NodeUpdateFailed {
                node_name: node.name().to_string(),
            })
    }

    /// Pods carrying the configured workload label; only these keep a
    /// cordoned node alive.
    fn workload_pod_count(&self, pods: &[Pod]) -> usize {
        pods.iter()
            .filter(|pod| {
                pod.metadata
                    .labels
                    .as_ref()
                    .and_then(|labels| labels.get(&self.config.pod_label_name))
                    .is_some_and(|value| *value == self.config.pod_label_value)
            })
            .count()
    }

    fn scheduling_mark_expired(&self, marked_at: DateTime<Utc>) -> bool {
        // A mark in the future (clock skew) is simply not expired.
        Utc::now()
            .signed_duration_since(marked_at)
            .to_std()
            .map(|elapsed| elapsed >= self.config.empty_node_expiration)
            .unwrap_or(false)
    }
}

use std::collections::BTreeMap;

use chrono::DateTime;
use chrono::SecondsFormat;
use chrono::Utc;
use error_stack::Report;
use error_stack::ResultExt;
use k8s_openapi::api::core::v1::Node as CoreNode;
use k8s_openapi::api::core::v1::NodeSpec;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::k8s::types::KubernetesError;

/// Annotation recording when a node's schedulability last flipped.
pub const SCHEDULING_MARK_ANNOTATION: &str = "kubescaler/timestamp";

/// Resource name of the only dimension the scaler reasons about.
pub const RESOURCE_CPU: &str = "cpu";

/// A named resource amount in milli-units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub name: String,
    pub value: i64,
}

impl Resource {
    pub fn cpu(value: i64) -> Self {
        Self {
            name: RESOURCE_CPU.to_string(),
            value,
        }
    }
}

/// A node together with the pods currently scheduled on it.
///
/// Resource accounting sums container *limits*, not requests. This mirrors
/// the pool's accounting model and differs from standard scheduler
/// bookkeeping.
#[derive(Debug, Clone)]
pub struct Node {
    pub node: CoreNode,
    pub pods: Vec<Pod>,
}

impl Node {
    pub fn name(&self) -> &str {
        self.node.metadata.name.as_deref().unwrap_or_default()
    }

    /// A node is ready iff a condition of type `Ready` has status `True`.
    pub fn is_ready(&self) -> bool {
        self.node
            .status
            .as_ref()
            .and_then(|status| status.conditions.as_ref())
            .is_some_and(|conditions| {
                conditions
                    .iter()
                    .any(|c| c.type_ == "Ready" && c.status == "True")
            })
    }

    /// Cordoned nodes are unschedulable; an absent flag means schedulable.
    pub fn is_schedulable(&self) -> bool {
        !self
            .node
            .spec
            .as_ref()
            .and_then(|spec| spec.unschedulable)
            .unwrap_or(false)
    }

    /// Capacity of the named resource in milli-units, 0 when absent.
    pub fn resource_capacity(&self, resource: &str) -> i64 {
        self.node
            .status
            .as_ref()
            .and_then(|status| status.capacity.as_ref())
            .and_then(|capacity| capacity.get(resource))
            .map(quantity_milli)
            .unwrap_or(0)
    }

    /// Milli-units of the named resource consumed by container limits across
    /// all pods on this node.
    pub fn using_resources(&self, resource: &str) -> i64 {
        self.pods
            .iter()
            .filter_map(|pod| pod.spec.as_ref())
            .flat_map(|spec| spec.containers.iter())
            .filter_map(|container| container.resources.as_ref())
            .filter_map(|resources| resources.limits.as_ref())
            .filter_map(|limits| limits.get(resource))
            .map(quantity_milli)
            .sum()
    }

    pub fn available_resource(&self, resource: &str) -> i64 {
        self.resource_capacity(resource) - self.using_resources(resource)
    }

    /// Uncordon the node and stamp the scheduling mark with the current time.
    pub fn mark_as_schedulable(&mut self) {
        self.node
            .spec
            .get_or_insert_with(NodeSpec::default)
            .unschedulable = Some(false);
        self.stamp_scheduling_mark();
    }

    /// Cordon the node and stamp the scheduling mark with the current time.
    pub fn mark_as_unschedulable(&mut self) {
        self.node
            .spec
            .get_or_insert_with(NodeSpec::default)
            .unschedulable = Some(true);
        self.stamp_scheduling_mark();
    }

    fn stamp_scheduling_mark(&mut self) {
        let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        self.node
            .metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(SCHEDULING_MARK_ANNOTATION.to_string(), stamp);
    }

    /// When the node's schedulability last flipped.
    ///
    /// # Errors
    ///
    /// - [`KubernetesError::SchedulingMarkInvalid`] when the annotation is
    ///   absent or not RFC 3339
    pub fn scheduling_mark_timestamp(&self) -> Result<DateTime<Utc>, Report<KubernetesError>> {
        let raw = self
            .node
            .metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(SCHEDULING_MARK_ANNOTATION))
            .ok_or_else(|| {
                Report::new(KubernetesError::SchedulingMarkInvalid {
                    node_name: self.name().to_string(),
                })
            })?;

        DateTime::parse_from_rfc3339(raw)
            .map(|t| t.with_timezone(&Utc))
            .change_context(KubernetesError::SchedulingMarkInvalid {
                node_name: self.name().to_string(),
            })
    }
}

/// An ordered snapshot of the pool's nodes.
#[derive(Debug, Clone, Default)]
pub struct NodeList {
    pub nodes: Vec<Node>,
}

impl NodeList {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes that are both ready and schedulable; only these contribute
    /// headroom.
    pub fn available_nodes(&self) -> Vec<&Node> {
        self.nodes
            .iter()
            .filter(|n| n.is_ready() && n.is_schedulable())
            .collect()
    }

    pub fn schedulable_nodes(&self) -> Vec<&Node> {
        self.nodes.iter().filter(|n| n.is_schedulable()).collect()
    }

    pub fn unschedulable_nodes(&self) -> Vec<&Node> {
        self.nodes.iter().filter(|n| !n.is_schedulable()).collect()
    }

    pub fn available_resource(&self, resource: &str) -> i64 {
        self.available_nodes()
            .iter()
            .map(|n| n.available_resource(resource))
            .sum()
    }

    /// Number of workload slots of size `need` that fit in the pool's spare
    /// capacity.
    pub fn available_slot(&self, need: &Resource) -> i64 {
        if need.value <= 0 {
            return 0;
        }
        self.available_resource(&need.name) / need.value
    }
}

/// Sort ascending by pod count. Stable: ties keep their input order.
pub fn sort_nodes_by_pods(nodes: &mut [Node]) {
    nodes.sort_by_key(|n| n.pods.len());
}

/// Sort descending by pod count. Stable: ties keep their input order.
pub fn sort_nodes_by_pods_desc(nodes: &mut [Node]) {
    nodes.sort_by_key(|n| std::cmp::Reverse(n.pods.len()));
}

/// Parse a Kubernetes quantity string into milli-units.
///
/// Handles plain and decimal values ("2", "0.1"), the milli suffix ("100m"),
/// and decimal/binary SI suffixes. Exponent notation is not supported; it
/// does not occur for CPU quantities.
fn parse_quantity_milli(value: &str) -> Option<i64> {
    let value = value.trim();
    let (numeric_part, suffix) = match value.find(|c: char| c.is_alphabetic()) {
        Some(pos) => value.split_at(pos),
        None => (value, ""),
    };

    let numeric: f64 = numeric_part.parse().ok()?;

    let milli_per_unit: f64 = match suffix {
        "" => 1_000.0,
        "m" => 1.0,
        "k" => 1_000.0 * 1e3,
        "M" => 1_000.0 * 1e6,
        "G" => 1_000.0 * 1e9,
        "T" => 1_000.0 * 1e12,
        "P" => 1_000.0 * 1e15,
        "E" => 1_000.0 * 1e18,
        "Ki" => 1_000.0 * 1024f64,
        "Mi" => 1_000.0 * 1024f64.powi(2),
        "Gi" => 1_000.0 * 1024f64.powi(3),
        "Ti" => 1_000.0 * 1024f64.powi(4),
        "Pi" => 1_000.0 * 1024f64.powi(5),
        "Ei" => 1_000.0 * 1024f64.powi(6),
        _ => return None,
    };

    Some((numeric * milli_per_unit).round() as i64)
}

/// Milli-value of a quantity; 0 for malformed input, matching the zero value
/// an absent quantity yields.
fn quantity_milli(quantity: &Quantity) -> i64 {
    parse_quantity_milli(&quantity.0).unwrap_or(0)
}

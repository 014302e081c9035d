use std::path::Path;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use http::Uri;
use k8s_openapi::api::core::v1::Node as CoreNode;
use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::api::PostParams;
use kube::api::WatchParams;
use kube::config::KubeConfigOptions;
use kube::config::Kubeconfig;
use kube::Api;
use kube::Client;
use kube::Config;

use crate::k8s::node::Node;
use crate::k8s::node::NodeList;
use crate::k8s::pod_watcher::PodWatcher;
use crate::k8s::types::KubernetesError;

/// Capability set the scaler needs from the orchestrator.
#[async_trait]
pub trait Kubernetes: Send + Sync {
    /// Nodes matching the label selector, each carrying the pods bound to it.
    ///
    /// Any failure to fetch a node's pods fails the whole call; the scaler
    /// must never act on a partially populated snapshot.
    async fn nodes(&self, selector: &str) -> Result<NodeList, Report<KubernetesError>>;

    /// Persist a node record, including its schedulability flag and
    /// annotations.
    async fn update_node(&self, node: &Node) -> Result<(), Report<KubernetesError>>;

    /// Open a long-lived watch on pods matching the label selector, across
    /// all namespaces unless one is given.
    async fn pod_watcher(
        &self,
        namespace: Option<&str>,
        label_selector: &str,
    ) -> Result<PodWatcher, Report<KubernetesError>>;
}

/// Orchestrator adapter backed by a kube client.
pub struct K8s {
    client: Client,
}

impl K8s {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build an adapter from explicit connection settings.
    ///
    /// With neither a master URL nor a kubeconfig path, the in-cluster (or
    /// local default) configuration is used.
    ///
    /// # Errors
    ///
    /// - [`KubernetesError::ConnectionFailed`] if no client can be built
    pub async fn from_kubeconfig(
        master_url: Option<&str>,
        kubeconfig: Option<&Path>,
    ) -> Result<Self, Report<KubernetesError>> {
        let client = match (master_url, kubeconfig) {
            (None, None) => {
                Client::try_default()
                    .await
                    .change_context(KubernetesError::ConnectionFailed {
                        message: "failed to create Kubernetes client from default configuration"
                            .to_string(),
                    })?
            }
            (Some(url), None) => {
                let uri: Uri = url.parse::<Uri>().change_context(KubernetesError::ConnectionFailed {
                    message: format!("invalid master URL: {url}"),
                })?;
                Client::try_from(Config::new(uri)).change_context(
                    KubernetesError::ConnectionFailed {
                        message: format!("failed to create Kubernetes client for {url}"),
                    },
                )?
            }
            (master_url, Some(path)) => {
                let kubeconfig = Kubeconfig::read_from(path).change_context(
                    KubernetesError::ConnectionFailed {
                        message: format!("failed to read kubeconfig file: {}", path.display()),
                    },
                )?;

                let mut config =
                    Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                        .await
                        .change_context(KubernetesError::ConnectionFailed {
                            message: format!(
                                "failed to create config from kubeconfig: {}",
                                path.display()
                            ),
                        })?;

                if let Some(url) = master_url {
                    config.cluster_url =
                        url.parse::<Uri>()
                            .change_context(KubernetesError::ConnectionFailed {
                                message: format!("invalid master URL: {url}"),
                            })?;
                }

                Client::try_from(config).change_context(KubernetesError::ConnectionFailed {
                    message: "failed to create Kubernetes client from custom kubeconfig"
                        .to_string(),
                })?
            }
        };

        Ok(Self::new(client))
    }

    async fn node_pods(&self, node_name: &str) -> Result<Vec<Pod>, Report<KubernetesError>> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let params = ListParams::default().fields(&format!("spec.nodeName={node_name}"));
        let pods = api
            .list(&params)
            .await
            .change_context(KubernetesError::PodListFailed {
                node_name: node_name.to_string(),
            })?;
        Ok(pods.items)
    }
}

#[async_trait]
impl Kubernetes for K8s {
    async fn nodes(&self, selector: &str) -> Result<NodeList, Report<KubernetesError>> {
        let api: Api<CoreNode> = Api::all(self.client.clone());
        let listed = api
            .list(&ListParams::default().labels(selector))
            .await
            .change_context(KubernetesError::NodeListFailed {
                selector: selector.to_string(),
            })?;

        let mut nodes = Vec::with_capacity(listed.items.len());
        for core_node in listed.items {
            let name = core_node.metadata.name.clone().unwrap_or_default();
            let pods = self.node_pods(&name).await?;
            nodes.push(Node {
                node: core_node,
                pods,
            });
        }

        Ok(NodeList { nodes })
    }

    async fn update_node(&self, node: &Node) -> Result<(), Report<KubernetesError>> {
        let api: Api<CoreNode> = Api::all(self.client.clone());
        api.replace(node.name(), &PostParams::default(), &node.node)
            .await
            .change_context(KubernetesError::NodeUpdateFailed {
                node_name: node.name().to_string(),
            })?;
        Ok(())
    }

    async fn pod_watcher(
        &self,
        namespace: Option<&str>,
        label_selector: &str,
    ) -> Result<PodWatcher, Report<KubernetesError>> {
        let api: Api<Pod> = match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };

        let params = WatchParams::default().labels(label_selector);
        let stream = api
            .watch(&params, "0")
            .await
            .change_context(KubernetesError::WatchFailed {
                message: format!("failed to open watch for selector {label_selector:?}"),
            })?;

        Ok(PodWatcher::spawn(stream))
    }
}

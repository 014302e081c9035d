use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;

use crate::node_pool::Driver;
use crate::node_pool::NodePoolProvider;
use crate::node_pool::ProviderConfig;
use crate::node_pool::ProviderError;

pub const DRIVER_NAME: &str = "digitalocean";

const DEFAULT_API_BASE: &str = "https://api.digitalocean.com";

/// DigitalOcean Kubernetes node-pool driver.
pub struct DigitalOceanDriver;

#[async_trait]
impl Driver for DigitalOceanDriver {
    async fn connect(
        &self,
        config: &ProviderConfig,
    ) -> Result<Arc<dyn NodePoolProvider>, Report<ProviderError>> {
        if config.cluster_name.is_empty() {
            return Err(Report::new(ProviderError::InvalidConfig {
                message: "digitalocean provider: cluster name is required".to_string(),
            }));
        }
        if config.node_pool_name.is_empty() {
            return Err(Report::new(ProviderError::InvalidConfig {
                message: "digitalocean provider: node pool name is required".to_string(),
            }));
        }
        if config.token.is_empty() {
            return Err(Report::new(ProviderError::InvalidConfig {
                message: "digitalocean provider: token is required".to_string(),
            }));
        }

        let provider = DigitalOceanProvider::connect(DEFAULT_API_BASE, config).await?;
        Ok(Arc::new(provider))
    }
}

#[derive(Debug, Deserialize)]
struct ClusterList {
    kubernetes_clusters: Vec<Cluster>,
}

#[derive(Debug, Deserialize)]
struct Cluster {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct NodePoolList {
    node_pools: Vec<NodePool>,
}

#[derive(Debug, Deserialize)]
struct NodePoolResponse {
    node_pool: NodePool,
}

#[derive(Debug, Deserialize)]
struct NodePool {
    id: String,
    name: String,
    #[serde(default)]
    nodes: Vec<PoolNode>,
}

#[derive(Debug, Deserialize)]
struct PoolNode {
    id: String,
    name: String,
}

#[derive(Debug, Serialize)]
struct ResizeRequest {
    count: usize,
}

/// Node-pool provider over the DigitalOcean Kubernetes API.
///
/// The cluster and node-pool ids are resolved from their configured names
/// once, at connect time.
#[derive(Debug)]
pub struct DigitalOceanProvider {
    http: reqwest::Client,
    base_url: String,
    token: String,
    cluster_id: String,
    node_pool_id: String,
}

impl DigitalOceanProvider {
    /// Connect against `base_url`, resolving the configured cluster and node
    /// pool by name.
    ///
    /// # Errors
    ///
    /// - [`ProviderError::ClusterNotFound`] / [`ProviderError::NodePoolNotFound`]
    ///   when the configured names do not exist
    /// - [`ProviderError::RequestFailed`] on transport or API failures
    pub async fn connect(
        base_url: &str,
        config: &ProviderConfig,
    ) -> Result<Self, Report<ProviderError>> {
        let http = reqwest::Client::builder().build().change_context(
            ProviderError::RequestFailed {
                message: "failed to build HTTP client".to_string(),
            },
        )?;

        let mut provider = Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            cluster_id: String::new(),
            node_pool_id: String::new(),
        };

        provider.cluster_id = provider.find_cluster(&config.cluster_name).await?;
        provider.node_pool_id = provider.find_node_pool(&config.node_pool_name).await?;

        Ok(provider)
    }

    async fn find_cluster(&self, name: &str) -> Result<String, Report<ProviderError>> {
        let list: ClusterList = self.get_json("/v2/kubernetes/clusters").await?;
        list.kubernetes_clusters
            .into_iter()
            .find(|cluster| cluster.name == name)
            .map(|cluster| cluster.id)
            .ok_or_else(|| {
                Report::new(ProviderError::ClusterNotFound {
                    name: name.to_string(),
                })
            })
    }

    async fn find_node_pool(&self, name: &str) -> Result<String, Report<ProviderError>> {
        let path = format!("/v2/kubernetes/clusters/{}/node_pools", self.cluster_id);
        let list: NodePoolList = self.get_json(&path).await?;
        list.node_pools
            .into_iter()
            .find(|pool| pool.name == name)
            .map(|pool| pool.id)
            .ok_or_else(|| {
                Report::new(ProviderError::NodePoolNotFound {
                    name: name.to_string(),
                })
            })
    }

    async fn node_pool(&self) -> Result<NodePool, Report<ProviderError>> {
        let path = format!(
            "/v2/kubernetes/clusters/{}/node_pools/{}",
            self.cluster_id, self.node_pool_id
        );
        let response: NodePoolResponse = self.get_json(&path).await?;
        Ok(response.node_pool)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, Report<ProviderError>> {
        let response = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.token)
            .send()
            .await
            .change_context(ProviderError::RequestFailed {
                message: format!("request to {path} failed"),
            })?
            .error_for_status()
            .change_context(ProviderError::RequestFailed {
                message: format!("request to {path} rejected"),
            })?;

        response
            .json()
            .await
            .change_context(ProviderError::RequestFailed {
                message: format!("invalid response body from {path}"),
            })
    }
}

#[async_trait]
impl NodePoolProvider for DigitalOceanProvider {
    async fn resize_node(&self, count: usize) -> Result<(), Report<ProviderError>> {
        let path = format!(
            "/v2/kubernetes/clusters/{}/node_pools/{}",
            self.cluster_id, self.node_pool_id
        );
        debug!(count, "resizing node pool");
        self.http
            .put(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.token)
            .json(&ResizeRequest { count })
            .send()
            .await
            .change_context(ProviderError::RequestFailed {
                message: format!("resize request to {path} failed"),
            })?
            .error_for_status()
            .change_context(ProviderError::RequestFailed {
                message: format!("resize request to {path} rejected"),
            })?;
        Ok(())
    }

    async fn delete_nodes(&self, ids: &[String]) -> Result<(), Report<ProviderError>> {
        if ids.is_empty() {
            return Ok(());
        }

        // The scaler hands over orchestrator node names; resolve them to
        // provider node ids through the pool listing where possible, and
        // fall back to treating the value as an id.
        let pool = self.node_pool().await?;
        let id_by_name: HashMap<&str, &str> = pool
            .nodes
            .iter()
            .map(|node| (node.name.as_str(), node.id.as_str()))
            .collect();

        for id in ids {
            let resolved = id_by_name.get(id.as_str()).copied().unwrap_or(id.as_str());
            let path = format!(
                "/v2/kubernetes/clusters/{}/node_pools/{}/nodes/{}",
                self.cluster_id, self.node_pool_id, resolved
            );
            debug!(node = %id, "deleting node");
            self.http
                .delete(format!("{}{}", self.base_url, path))
                .bearer_auth(&self.token)
                .send()
                .await
                .change_context(ProviderError::NodeDeleteFailed { id: id.clone() })?
                .error_for_status()
                .change_context(ProviderError::NodeDeleteFailed { id: id.clone() })?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::matchers::body_json;
    use wiremock::matchers::header;
    use wiremock::matchers::method;
    use wiremock::matchers::path;
    use wiremock::Mock;
    use wiremock::MockServer;
    use wiremock::ResponseTemplate;

    use super::*;

    fn test_config() -> ProviderConfig {
        ProviderConfig {
            token: "test-token".to_string(),
            cluster_name: "test-cluster".to_string(),
            node_pool_name: "test-pool".to_string(),
        }
    }

    async fn mock_discovery(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/v2/kubernetes/clusters"))
            .and(header("authorization", "Bearer test-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "kubernetes_clusters": [
                    {"id": "cluster-1", "name": "other-cluster"},
                    {"id": "cluster-2", "name": "test-cluster"},
                ]
            })))
            .mount(server)
            .await;

        Mock::given(method("GET"))
            .and(path("/v2/kubernetes/clusters/cluster-2/node_pools"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "node_pools": [
                    {"id": "pool-1", "name": "test-pool"},
                ]
            })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn connect_resolves_cluster_and_pool_by_name() {
        let server = MockServer::start().await;
        mock_discovery(&server).await;

        let provider = DigitalOceanProvider::connect(&server.uri(), &test_config())
            .await
            .expect("connect succeeds");
        assert_eq!(provider.cluster_id, "cluster-2");
        assert_eq!(provider.node_pool_id, "pool-1");
    }

    #[tokio::test]
    async fn connect_fails_for_unknown_cluster() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/kubernetes/clusters"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "kubernetes_clusters": []
            })))
            .mount(&server)
            .await;

        let err = DigitalOceanProvider::connect(&server.uri(), &test_config())
            .await
            .expect_err("unknown cluster must fail");
        assert!(matches!(
            err.current_context(),
            ProviderError::ClusterNotFound { .. }
        ));
    }

    #[tokio::test]
    async fn resize_node_puts_absolute_count() {
        let server = MockServer::start().await;
        mock_discovery(&server).await;

        Mock::given(method("PUT"))
            .and(path("/v2/kubernetes/clusters/cluster-2/node_pools/pool-1"))
            .and(body_json(json!({"count": 5})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "node_pool": {"id": "pool-1", "name": "test-pool"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let provider = DigitalOceanProvider::connect(&server.uri(), &test_config())
            .await
            .expect("connect succeeds");
        provider.resize_node(5).await.expect("resize succeeds");
    }

    #[tokio::test]
    async fn delete_nodes_deletes_every_supplied_node() {
        let server = MockServer::start().await;
        mock_discovery(&server).await;

        Mock::given(method("GET"))
            .and(path("/v2/kubernetes/clusters/cluster-2/node_pools/pool-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "node_pool": {
                    "id": "pool-1",
                    "name": "test-pool",
                    "nodes": [
                        {"id": "node-id-0", "name": "test-node-0"},
                        {"id": "node-id-1", "name": "test-node-1"},
                    ]
                }
            })))
            .mount(&server)
            .await;

        Mock::given(method("DELETE"))
            .and(path(
                "/v2/kubernetes/clusters/cluster-2/node_pools/pool-1/nodes/node-id-0",
            ))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path(
                "/v2/kubernetes/clusters/cluster-2/node_pools/pool-1/nodes/node-id-1",
            ))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let provider = DigitalOceanProvider::connect(&server.uri(), &test_config())
            .await
            .expect("connect succeeds");
        provider
            .delete_nodes(&["test-node-0".to_string(), "test-node-1".to_string()])
            .await
            .expect("both nodes deleted");
    }

    #[tokio::test]
    async fn delete_nodes_stops_on_first_error() {
        let server = MockServer::start().await;
        mock_discovery(&server).await;

        Mock::given(method("GET"))
            .and(path("/v2/kubernetes/clusters/cluster-2/node_pools/pool-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "node_pool": {"id": "pool-1", "name": "test-pool", "nodes": []}
            })))
            .mount(&server)
            .await;

        Mock::given(method("DELETE"))
            .and(path(
                "/v2/kubernetes/clusters/cluster-2/node_pools/pool-1/nodes/broken",
            ))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path(
                "/v2/kubernetes/clusters/cluster-2/node_pools/pool-1/nodes/untouched",
            ))
            .respond_with(ResponseTemplate::new(204))
            .expect(0)
            .mount(&server)
            .await;

        let provider = DigitalOceanProvider::connect(&server.uri(), &test_config())
            .await
            .expect("connect succeeds");
        let err = provider
            .delete_nodes(&["broken".to_string(), "untouched".to_string()])
            .await
            .expect_err("first failure must stop the batch");
        assert!(matches!(
            err.current_context(),
            ProviderError::NodeDeleteFailed { id } if id == "broken"
        ));
    }

    #[tokio::test]
    async fn delete_nodes_with_empty_set_issues_no_requests() {
        let server = MockServer::start().await;
        mock_discovery(&server).await;

        let provider = DigitalOceanProvider::connect(&server.uri(), &test_config())
            .await
            .expect("connect succeeds");
        // No DELETE (or pool lookup) mocks are mounted beyond discovery; any
        // request would 404 and fail the call.
        provider.delete_nodes(&[]).await.expect("no-op");
    }
}

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::node_pool::ProviderConfig;
use crate::scaler::ScalerConfig;

/// Command line and environment configuration.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "kubescaler",
    about = "Workload-aware autoscaler for Kubernetes node pools",
    version
)]
pub struct Cli {
    #[arg(
        long,
        env = "CLOUD_PROVIDER",
        default_value = "digitalocean",
        help = "Cloud provider driver name"
    )]
    pub cloud_provider: String,

    #[arg(
        long,
        env = "CLOUD_PROVIDER_TOKEN",
        default_value = "",
        hide_env_values = true,
        help = "Cloud provider API token"
    )]
    pub cloud_provider_token: String,

    #[arg(
        long,
        env = "CLUSTER_NAME",
        default_value = "",
        help = "Cluster name at the cloud provider"
    )]
    pub cluster_name: String,

    #[arg(
        long,
        env = "NODE_POOL_NAME",
        default_value = "",
        help = "Node pool name at the cloud provider"
    )]
    pub node_pool_name: String,

    #[arg(
        long,
        env = "CLUSTER_KUBE_CONFIG_MASTER_URL",
        help = "Kube config master URL (leave empty if using in-cluster config)"
    )]
    pub cluster_kube_config_master_url: Option<String>,

    #[arg(
        long,
        env = "CLUSTER_KUBE_CONFIG_PATH",
        value_hint = clap::ValueHint::FilePath,
        help = "Kube config path (leave empty if using in-cluster config)"
    )]
    pub cluster_kube_config_path: Option<PathBuf>,

    #[arg(
        long,
        env = "NODE_SELECTOR",
        help = "Node selector label identifying pool members (ex: role=scalable)"
    )]
    pub node_selector: String,

    #[arg(
        long,
        env = "MINIMUM_NODE_POOL_SIZE",
        default_value_t = 2,
        help = "Minimum node pool size"
    )]
    pub minimum_node_pool_size: usize,

    #[arg(
        long,
        env = "MAXIMUM_NODE_POOL_SIZE",
        default_value_t = 3,
        help = "Maximum node pool size"
    )]
    pub maximum_node_pool_size: usize,

    #[arg(
        long,
        env = "SERVER_POD_LABEL_NAME",
        help = "Label name identifying workload pods"
    )]
    pub server_pod_label_name: String,

    #[arg(
        long,
        env = "SERVER_POD_LABEL_VALUE",
        help = "Label value identifying workload pods"
    )]
    pub server_pod_label_value: String,

    #[arg(
        long,
        env = "SERVER_CPU_RESOURCE_REQUEST",
        default_value_t = 100,
        help = "CPU request of one workload slot, in milli units"
    )]
    pub server_cpu_resource_request: i64,

    #[arg(
        long,
        env = "BUFFER_SLOT_SIZE",
        default_value_t = 4,
        help = "Target headroom in slots"
    )]
    pub buffer_slot_size: i64,

    #[arg(
        long,
        env = "SCALE_LOOP_TICK_SEC",
        default_value_t = 10,
        help = "Scale loop tick period in seconds"
    )]
    pub scale_loop_tick_sec: u64,

    #[arg(
        long,
        env = "EMPTY_NODE_EXPIRATION_SEC",
        default_value_t = 120,
        help = "How long a node must stay cordoned and workload-free before deletion, in seconds"
    )]
    pub empty_node_expiration_sec: u64,
}

impl Cli {
    pub fn scaler_config(&self) -> ScalerConfig {
        ScalerConfig {
            node_selector: self.node_selector.clone(),
            minimum_node: self.minimum_node_pool_size,
            maximum_node: self.maximum_node_pool_size,
            pod_cpu_request: self.server_cpu_resource_request,
            pod_label_name: self.server_pod_label_name.clone(),
            pod_label_value: self.server_pod_label_value.clone(),
            buffer_slot_size: self.buffer_slot_size,
            empty_node_expiration: Duration::from_secs(self.empty_node_expiration_sec),
            scale_loop_interval: Duration::from_secs(self.scale_loop_tick_sec),
        }
    }

    pub fn provider_config(&self) -> ProviderConfig {
        ProviderConfig {
            token: self.cloud_provider_token.clone(),
            cluster_name: self.cluster_name.clone(),
            node_pool_name: self.node_pool_name.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> Cli {
        let mut args = vec![
            "kubescaler",
            "--node-selector",
            "role=scalable",
            "--server-pod-label-name",
            "session",
            "--server-pod-label-value",
            "dedicated-server",
        ];
        args.extend_from_slice(extra);
        Cli::try_parse_from(args).expect("args parse")
    }

    #[test]
    fn defaults_match_documented_values() {
        let cli = parse(&[]);
        assert_eq!(cli.cloud_provider, "digitalocean");
        assert_eq!(cli.minimum_node_pool_size, 2);
        assert_eq!(cli.maximum_node_pool_size, 3);
        assert_eq!(cli.buffer_slot_size, 4);
        assert_eq!(cli.server_cpu_resource_request, 100);
        assert_eq!(cli.scale_loop_tick_sec, 10);
        assert_eq!(cli.empty_node_expiration_sec, 120);
    }

    #[test]
    fn tick_seconds_become_durations() {
        let cli = parse(&[
            "--scale-loop-tick-sec",
            "30",
            "--empty-node-expiration-sec",
            "600",
        ]);
        let config = cli.scaler_config();
        assert_eq!(config.scale_loop_interval, Duration::from_secs(30));
        assert_eq!(config.empty_node_expiration, Duration::from_secs(600));
    }

    #[test]
    fn workload_selector_is_required() {
        let result = Cli::try_parse_from(["kubescaler", "--node-selector", "role=scalable"]);
        assert!(result.is_err());
    }

    #[test]
    fn provider_config_carries_credentials() {
        let cli = parse(&[
            "--cloud-provider-token",
            "secret",
            "--cluster-name",
            "prod",
            "--node-pool-name",
            "servers",
        ]);
        let config = cli.provider_config();
        assert_eq!(config.token, "secret");
        assert_eq!(config.cluster_name, "prod");
        assert_eq!(config.node_pool_name, "servers");
    }
}

//! The command-line surface.
//!
//! Flag names are part of the deployment contract (Helm charts and scripts
//! pass them); the camelCase spellings are kept stable.
use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::Parser;

#[derive(Debug, PartialEq, Eq, Parser)]
#[command(author, version, about)]
pub struct Settings {
    /// Name of the cluster this process runs in. Recorded on every replica
    /// as the source cluster.
    #[arg(long = "localCluster", env = "KEESS_LOCAL_CLUSTER")]
    pub local_cluster: String,

    /// Path to the multi-context credentials file naming the remote
    /// clusters.
    #[arg(long = "kubeConfigPath", env = "KEESS_KUBE_CONFIG_PATH")]
    pub kube_config_path: PathBuf,

    /// Seconds between LIST rounds for sync candidates.
    #[arg(long = "pollingInterval", env = "KEESS_POLLING_INTERVAL", default_value_t = 60)]
    pub polling_interval: u64,

    /// Seconds between namespace snapshot refreshes. Namespace churn is
    /// slow, so this is independent of the resource polling interval.
    #[arg(
        long = "namespacePollingInterval",
        env = "KEESS_NAMESPACE_POLLING_INTERVAL",
        default_value_t = 300
    )]
    pub namespace_polling_interval: u64,

    /// Seconds between managed-object sweeps of the orphan reaper.
    #[arg(
        long = "housekeepingInterval",
        env = "KEESS_HOUSEKEEPING_INTERVAL",
        default_value_t = 300
    )]
    pub housekeeping_interval: u64,

    /// Enables the Service pollers, synchronizer and reaper.
    #[arg(
        long = "enableServiceSync",
        env = "KEESS_ENABLE_SERVICE_SYNC",
        value_name = "BOOL",
        action = clap::ArgAction::Set,
        default_value_t = false
    )]
    pub enable_service_sync: bool,

    /// Log filter used when the KEESS_LOG environment variable is unset.
    #[arg(long = "logLevel", env = "KEESS_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Address the health and metrics endpoints listen on.
    #[arg(long = "bindAddress", env = "KEESS_BIND_ADDRESS", default_value = "0.0.0.0:8080")]
    pub bind_address: SocketAddr,
}

impl Settings {
    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs(self.polling_interval)
    }

    pub fn namespace_polling_interval(&self) -> Duration {
        Duration::from_secs(self.namespace_polling_interval)
    }

    pub fn housekeeping_interval(&self) -> Duration {
        Duration::from_secs(self.housekeeping_interval)
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn verify_cli() {
        Settings::command().debug_assert();
    }

    #[test]
    fn parse_minimal_invocation() {
        let settings = Settings::parse_from([
            "keess",
            "--localCluster",
            "a",
            "--kubeConfigPath",
            "/etc/keess/kubeconfig",
        ]);
        assert_eq!(settings.local_cluster, "a");
        assert_eq!(settings.polling_interval(), Duration::from_secs(60));
        assert!(!settings.enable_service_sync);
    }

    #[test]
    fn parse_full_invocation() {
        let settings = Settings::parse_from([
            "keess",
            "--localCluster",
            "a",
            "--kubeConfigPath",
            "/etc/keess/kubeconfig",
            "--pollingInterval",
            "10",
            "--namespacePollingInterval",
            "120",
            "--housekeepingInterval",
            "30",
            "--enableServiceSync",
            "true",
            "--logLevel",
            "debug",
            "--bindAddress",
            "127.0.0.1:9999",
        ]);
        assert_eq!(settings.housekeeping_interval(), Duration::from_secs(30));
        assert!(settings.enable_service_sync);
        assert_eq!(settings.bind_address.port(), 9999);
    }
}

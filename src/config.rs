//! Operator configuration
//!
//! Every flag has an environment fallback so the operator can be configured from a
//! Deployment manifest without touching its args.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use crate::controller::dormant::WaitConfig;
use crate::controller::{ControllerConfig, RateLimiter, Settings};
use crate::crd::DatabaseKind;
use crate::error::{Error, Result};

/// KubeDB operator - lifecycle management for Redis, Memcached and PgBouncer
#[derive(Parser, Debug, Clone)]
#[command(name = "kubedb-operator", version, about, long_about = None)]
pub struct OperatorConfig {
    /// Worker tasks per database kind
    #[arg(long, env = "KUBEDB_WORKERS", default_value_t = 2)]
    pub workers: usize,

    /// Rate-limited retries before a key is reported as exhausted
    #[arg(long, env = "KUBEDB_MAX_REQUEUES", default_value_t = 5)]
    pub max_requeues: u32,

    /// First retry delay in milliseconds
    #[arg(long, env = "KUBEDB_BACKOFF_BASE_MS", default_value_t = 5)]
    pub backoff_base_ms: u64,

    /// Retry delay ceiling in seconds
    #[arg(long, env = "KUBEDB_BACKOFF_MAX_SECS", default_value_t = 1000)]
    pub backoff_max_secs: u64,

    /// Deadline for each dormant-protocol wait, in seconds
    #[arg(long, env = "KUBEDB_WAIT_TIMEOUT_SECS", default_value_t = 120)]
    pub wait_timeout_secs: u64,

    /// Poll interval of the dormant-protocol waits, in milliseconds
    #[arg(long, env = "KUBEDB_POLL_INTERVAL_MS", default_value_t = 2000)]
    pub poll_interval_ms: u64,

    /// Re-enqueue every cached object this often; 0 disables resync
    #[arg(long, env = "KUBEDB_RESYNC_SECS", default_value_t = 300)]
    pub resync_secs: u64,

    /// Database kinds to run controllers for (default: all)
    #[arg(long, env = "KUBEDB_KINDS", value_enum, value_delimiter = ',')]
    pub kinds: Vec<DatabaseKind>,

    /// Apply the CRDs at startup
    #[arg(long, env = "KUBEDB_INSTALL_CRDS")]
    pub install_crds: bool,

    /// How long to wait for installed CRDs to become established, in seconds
    #[arg(long, env = "KUBEDB_CRD_TIMEOUT_SECS", default_value_t = 60)]
    pub crd_timeout_secs: u64,

    /// Serve the mutating admission webhook
    #[arg(long, env = "KUBEDB_ENABLE_MUTATING_WEBHOOK")]
    pub enable_mutating_webhook: bool,

    #[arg(long, env = "KUBEDB_WEBHOOK_ADDR", default_value = "0.0.0.0:8443")]
    pub webhook_addr: SocketAddr,

    #[arg(
        long,
        env = "KUBEDB_TLS_CERT",
        default_value = "/var/serving-cert/tls.crt"
    )]
    pub tls_cert: PathBuf,

    #[arg(
        long,
        env = "KUBEDB_TLS_KEY",
        default_value = "/var/serving-cert/tls.key"
    )]
    pub tls_key: PathBuf,

    #[arg(long, env = "KUBEDB_METRICS_ADDR", default_value = "0.0.0.0:8080")]
    pub metrics_addr: SocketAddr,

    /// Emit logs as JSON
    #[arg(long, env = "KUBEDB_LOG_JSON")]
    pub log_json: bool,

    #[arg(long, env = "POD_NAMESPACE", default_value = "default")]
    pub operator_namespace: String,
}

impl OperatorConfig {
    /// Reject settings no controller can run with
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::ConfigError("workers must be at least 1".to_string()));
        }
        if self.backoff_base_ms == 0 {
            return Err(Error::ConfigError(
                "backoff base must be greater than zero".to_string(),
            ));
        }
        if Duration::from_millis(self.backoff_base_ms) > self.backoff_max() {
            return Err(Error::ConfigError(
                "backoff base exceeds the backoff ceiling".to_string(),
            ));
        }
        if self.poll_interval_ms == 0 || self.wait_timeout_secs == 0 {
            return Err(Error::ConfigError(
                "wait timeout and poll interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Kinds to run; an empty list means all of them
    pub fn enabled_kinds(&self) -> Vec<DatabaseKind> {
        if self.kinds.is_empty() {
            DatabaseKind::ALL.to_vec()
        } else {
            let mut kinds = self.kinds.clone();
            kinds.dedup();
            kinds
        }
    }

    fn backoff_max(&self) -> Duration {
        Duration::from_secs(self.backoff_max_secs)
    }

    pub fn crd_timeout(&self) -> Duration {
        Duration::from_secs(self.crd_timeout_secs)
    }

    pub fn controller_config(&self, shutdown: CancellationToken) -> ControllerConfig {
        ControllerConfig {
            workers: self.workers,
            max_requeues: self.max_requeues,
            limiter: RateLimiter {
                base: Duration::from_millis(self.backoff_base_ms),
                max: self.backoff_max(),
            },
            resync: Duration::from_secs(self.resync_secs),
            settings: Settings {
                wait: WaitConfig {
                    timeout: Duration::from_secs(self.wait_timeout_secs),
                    poll_interval: Duration::from_millis(self.poll_interval_ms),
                },
                shutdown,
            },
        }
    }
}

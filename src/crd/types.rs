//! Shared types used by the database CRDs

use std::collections::BTreeMap;
use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// API group of every KubeDB custom resource
pub const GROUP: &str = "kubedb.com";

/// Finalizer the operator places on every managed object
pub const FINALIZER: &str = "kubedb.com";

/// Label carrying the database kind on every offshoot
pub const LABEL_DATABASE_KIND: &str = "kubedb.com/kind";

/// Label carrying the database name on every offshoot
pub const LABEL_DATABASE_NAME: &str = "kubedb.com/name";

/// Label distinguishing the stats service from the primary one
pub const LABEL_ROLE: &str = "kubedb.com/role";

pub const PROMETHEUS_EXPORTER_PORT_NAME: &str = "prom-http";
pub const PROMETHEUS_EXPORTER_PORT_NUMBER: i32 = 56790;

/// The database engines managed by the operator
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, JsonSchema, clap::ValueEnum,
)]
pub enum DatabaseKind {
    Redis,
    Memcached,
    #[value(name = "pgbouncer")]
    PgBouncer,
}

impl DatabaseKind {
    pub const ALL: [DatabaseKind; 3] = [
        DatabaseKind::Redis,
        DatabaseKind::Memcached,
        DatabaseKind::PgBouncer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseKind::Redis => "Redis",
            DatabaseKind::Memcached => "Memcached",
            DatabaseKind::PgBouncer => "PgBouncer",
        }
    }

    pub fn plural(&self) -> &'static str {
        match self {
            DatabaseKind::Redis => "redises",
            DatabaseKind::Memcached => "memcacheds",
            DatabaseKind::PgBouncer => "pgbouncers",
        }
    }
}

impl fmt::Display for DatabaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happens to a database's data when the custom resource is deleted
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
pub enum TerminationPolicy {
    /// Tear down the workload, keep the data, and record a DormantDatabase
    #[default]
    Pause,
    /// Tear down the workload and drop the record, leaving secrets in place
    Delete,
    /// Tear down the workload and every leftover artifact
    WipeOut,
}

/// User overrides applied to the primary service
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceTemplate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,

    #[serde(default)]
    pub spec: ServiceTemplateSpec,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceTemplateSpec {
    /// ClusterIP, NodePort or LoadBalancer
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,

    #[serde(rename = "clusterIP", default, skip_serializing_if = "Option::is_none")]
    pub cluster_ip: Option<String>,

    #[serde(rename = "externalIPs", default, skip_serializing_if = "Vec::is_empty")]
    pub external_ips: Vec<String>,

    #[serde(rename = "loadBalancerIP", default, skip_serializing_if = "Option::is_none")]
    pub load_balancer_ip: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub load_balancer_source_ranges: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_traffic_policy: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check_node_port: Option<i32>,

    /// Extra ports, merged by name into the generated port list
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<ServicePortTemplate>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServicePortTemplate {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_port: Option<i32>,
}

/// Monitoring agents understood by the operator
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum MonitorAgent {
    /// Scraped through a prometheus-operator ServiceMonitor
    #[serde(rename = "prometheus.io/operator")]
    PrometheusOperator,
    /// Scraped by a stock Prometheus through `prometheus.io/*` annotations
    #[serde(rename = "prometheus.io/builtin")]
    PrometheusBuiltin,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MonitorSpec {
    pub agent: MonitorAgent,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prometheus: Option<PrometheusSpec>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PrometheusSpec {
    /// Exporter port; defaulted at admission when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,

    /// Namespace the ServiceMonitor is created in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Labels the prometheus-operator selects ServiceMonitors by
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
}

impl MonitorSpec {
    /// Exporter port, falling back to the standard one
    pub fn port(&self) -> i32 {
        self.prometheus
            .as_ref()
            .and_then(|p| p.port)
            .unwrap_or(PROMETHEUS_EXPORTER_PORT_NUMBER)
    }

    /// Assign the standard exporter port when none is set
    pub fn set_default_port(&mut self) {
        let prometheus = self.prometheus.get_or_insert_with(Default::default);
        if prometheus.port.is_none() {
            prometheus.port = Some(PROMETHEUS_EXPORTER_PORT_NUMBER);
        }
    }
}

/// Lifecycle phase reported in `.status.phase`
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum DatabasePhase {
    Creating,
    Running,
    Failed,
    Paused,
    WipingOut,
}

impl fmt::Display for DatabasePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DatabasePhase::Creating => "Creating",
            DatabasePhase::Running => "Running",
            DatabasePhase::Failed => "Failed",
            DatabasePhase::Paused => "Paused",
            DatabasePhase::WipingOut => "WipingOut",
        };
        f.write_str(s)
    }
}

/// Status subresource shared by every database kind
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<DatabasePhase>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Namespace the ServiceMonitor was last deployed to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_monitor_namespace: Option<String>,
}

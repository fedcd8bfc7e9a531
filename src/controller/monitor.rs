//! Monitoring wiring
//!
//! A database with a monitor spec gets a stats service exposing the exporter sidecar.
//! With the `prometheus.io/operator` agent a ServiceMonitor selecting that service is
//! also maintained; with `prometheus.io/builtin` the stats service carries the
//! `prometheus.io/*` scrape annotations instead.

use std::collections::BTreeMap;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::convergence::{create_or_patch, delete_owned, Outcome, Ownership};
use super::resources::desired_stats_service;
use crate::crd::{Database, MonitorAgent, MonitorSpec, PROMETHEUS_EXPORTER_PORT_NAME};
use crate::error::Result;
use crate::store::ClusterStores;

// ============================================================================
// ServiceMonitor
// ============================================================================

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MonitorLabelSelector {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub match_labels: Option<BTreeMap<String, String>>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceMonitorEndpoint {
    pub port: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceMonitorNamespaceSelector {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub match_names: Option<Vec<String>>,
}

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[kube(
    group = "monitoring.coreos.com",
    version = "v1",
    kind = "ServiceMonitor",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceMonitorSpec {
    pub selector: MonitorLabelSelector,
    pub endpoints: Vec<ServiceMonitorEndpoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace_selector: Option<ServiceMonitorNamespaceSelector>,
}

impl Default for ServiceMonitor {
    fn default() -> Self {
        ServiceMonitor::new("", ServiceMonitorSpec::default())
    }
}

pub fn service_monitor_name<D: Database>(db: &D) -> String {
    format!(
        "kubedb-{}-{}",
        db.namespace().unwrap_or_default(),
        db.name_any()
    )
}

fn desired_service_monitor<'a, D: Database>(
    db: &'a D,
    spec: &'a MonitorSpec,
) -> impl Fn(ServiceMonitor) -> ServiceMonitor + 'a {
    move |mut sm: ServiceMonitor| {
        let prometheus = spec.prometheus.clone().unwrap_or_default();
        let labels = sm.metadata.labels.get_or_insert_with(BTreeMap::new);
        labels.extend(prometheus.labels);
        labels.extend(db.offshoot_selectors());

        sm.spec = ServiceMonitorSpec {
            selector: MonitorLabelSelector {
                match_labels: Some(db.stats_labels()),
            },
            endpoints: vec![ServiceMonitorEndpoint {
                port: PROMETHEUS_EXPORTER_PORT_NAME.to_string(),
                path: Some("/metrics".to_string()),
                interval: prometheus.interval,
            }],
            namespace_selector: Some(ServiceMonitorNamespaceSelector {
                match_names: Some(vec![db.namespace().unwrap_or_default()]),
            }),
        };
        sm
    }
}

// ============================================================================
// Backends
// ============================================================================

/// Monitoring backend selected by a database's monitor spec
#[derive(Clone, Copy, Debug)]
pub enum MonitorBackend<'a> {
    None,
    Prometheus {
        agent: MonitorAgent,
        spec: &'a MonitorSpec,
    },
}

impl<'a> MonitorBackend<'a> {
    pub fn for_database<D: Database>(db: &'a D) -> Self {
        match db.monitor() {
            Some(spec) => MonitorBackend::Prometheus {
                agent: spec.agent,
                spec,
            },
            None => MonitorBackend::None,
        }
    }

    /// Converge the stats service and, for the operator agent, the ServiceMonitor.
    ///
    /// `recorded` is the namespace the ServiceMonitor was last deployed to. A copy
    /// left there by an earlier spec is removed. A disabled monitor removes everything.
    pub async fn ensure<D: Database>(
        &self,
        db: &D,
        stores: &ClusterStores,
        ownership: &Ownership,
        recorded: Option<&str>,
    ) -> Result<Vec<(&'static str, Outcome)>> {
        let MonitorBackend::Prometheus { agent, spec } = *self else {
            remove(db, stores, ownership, recorded).await?;
            return Ok(Vec::new());
        };

        let namespace = db.namespace().unwrap_or_default();
        let port = spec.port();
        let annotations = match agent {
            MonitorAgent::PrometheusBuiltin => BTreeMap::from([
                ("prometheus.io/scrape".to_string(), "true".to_string()),
                ("prometheus.io/port".to_string(), port.to_string()),
                ("prometheus.io/path".to_string(), "/metrics".to_string()),
            ]),
            MonitorAgent::PrometheusOperator => BTreeMap::new(),
        };

        let mut outcomes = Vec::new();
        let (_, outcome) = create_or_patch(
            stores.services.as_ref(),
            &namespace,
            &db.stats_service_name(),
            ownership,
            desired_stats_service(db, port, annotations),
        )
        .await?;
        outcomes.push(("StatsService", outcome));

        let wanted = service_monitor_namespace(db);
        let stale: Vec<String> = candidate_namespaces(db, recorded)
            .into_iter()
            .filter(|ns| Some(ns) != wanted.as_ref())
            .collect();
        remove_service_monitors(db, stores, ownership, stale).await?;

        if let Some(sm_namespace) = wanted {
            let (_, outcome) = create_or_patch(
                stores.service_monitors.as_ref(),
                &sm_namespace,
                &service_monitor_name(db),
                &ownership.labels_only(),
                desired_service_monitor(db, spec),
            )
            .await?;
            outcomes.push(("ServiceMonitor", outcome));
        }
        Ok(outcomes)
    }
}

fn monitor_namespace<D: Database>(db: &D, spec: &MonitorSpec) -> String {
    spec.prometheus
        .as_ref()
        .and_then(|p| p.namespace.clone())
        .unwrap_or_else(|| db.namespace().unwrap_or_default())
}

/// Namespace the ServiceMonitor of `db` belongs in; `None` unless the operator agent
/// is selected
pub fn service_monitor_namespace<D: Database>(db: &D) -> Option<String> {
    db.monitor()
        .filter(|spec| spec.agent == MonitorAgent::PrometheusOperator)
        .map(|spec| monitor_namespace(db, spec))
}

/// Every namespace a ServiceMonitor of `db` may have been left in
fn candidate_namespaces<D: Database>(db: &D, recorded: Option<&str>) -> Vec<String> {
    let mut namespaces: Vec<String> = recorded.map(str::to_string).into_iter().collect();
    let current = db
        .monitor()
        .map(|spec| monitor_namespace(db, spec))
        .unwrap_or_else(|| db.namespace().unwrap_or_default());
    if !namespaces.contains(&current) {
        namespaces.push(current);
    }
    namespaces
}

async fn remove_service_monitors<D: Database>(
    db: &D,
    stores: &ClusterStores,
    ownership: &Ownership,
    namespaces: Vec<String>,
) -> Result<()> {
    let name = service_monitor_name(db);
    for namespace in namespaces {
        if delete_owned(
            stores.service_monitors.as_ref(),
            &namespace,
            &name,
            &ownership.labels_only(),
        )
        .await?
        {
            info!("Removed ServiceMonitor {}/{}", namespace, name);
        }
    }
    Ok(())
}

/// Delete the stats service and ServiceMonitor of `db`, skipping objects it does not
/// own. `recorded` is the namespace the ServiceMonitor was last deployed to.
pub async fn remove<D: Database>(
    db: &D,
    stores: &ClusterStores,
    ownership: &Ownership,
    recorded: Option<&str>,
) -> Result<()> {
    let namespace = db.namespace().unwrap_or_default();
    let stats = delete_owned(
        stores.services.as_ref(),
        &namespace,
        &db.stats_service_name(),
        ownership,
    )
    .await?;
    if stats {
        info!("Removed stats service of {}/{}", namespace, db.name_any());
    }
    remove_service_monitors(db, stores, ownership, candidate_namespaces(db, recorded)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{PrometheusSpec, Redis, RedisSpec, PROMETHEUS_EXPORTER_PORT_NUMBER};
    use crate::store::{MemoryCluster, ObjectKey};
    use k8s_openapi::api::core::v1::Service;

    fn redis(agent: MonitorAgent) -> Redis {
        let mut redis = Redis::new(
            "cache1",
            RedisSpec {
                version: "7.2.4".to_string(),
                monitor: Some(MonitorSpec {
                    agent,
                    prometheus: Some(PrometheusSpec {
                        namespace: Some("monitoring".to_string()),
                        ..Default::default()
                    }),
                }),
                ..Default::default()
            },
        );
        redis.metadata.namespace = Some("demo".to_string());
        redis.metadata.uid = Some("uid-1".to_string());
        redis
    }

    #[tokio::test]
    async fn operator_agent_creates_service_monitor() {
        let cluster = MemoryCluster::new();
        let stores = cluster.stores();
        let db = redis(MonitorAgent::PrometheusOperator);
        let backend = MonitorBackend::for_database(&db);

        let outcomes = backend
            .ensure(&db, &stores, &Ownership::of(&db), None)
            .await
            .unwrap();
        assert_eq!(
            outcomes,
            vec![("StatsService", Outcome::Created), ("ServiceMonitor", Outcome::Created)]
        );

        let sm = cluster
            .service_monitors
            .get_sync("monitoring", "kubedb-demo-cache1")
            .unwrap()
            .unwrap();
        assert!(sm.owner_references().is_empty());
        assert_eq!(sm.spec.endpoints[0].port, PROMETHEUS_EXPORTER_PORT_NAME);

        let stats = cluster.services.get_sync("demo", "cache1-stats").unwrap().unwrap();
        let port = &stats.spec.unwrap().ports.unwrap()[0];
        assert_eq!(port.port, PROMETHEUS_EXPORTER_PORT_NUMBER);
    }

    #[tokio::test]
    async fn builtin_agent_annotates_stats_service() {
        let cluster = MemoryCluster::new();
        let db = redis(MonitorAgent::PrometheusBuiltin);
        MonitorBackend::for_database(&db)
            .ensure(&db, &cluster.stores(), &Ownership::of(&db), None)
            .await
            .unwrap();

        let stats = cluster.services.get_sync("demo", "cache1-stats").unwrap().unwrap();
        assert_eq!(stats.annotations()["prometheus.io/scrape"], "true");
        assert!(cluster.service_monitors.keys().is_empty());
    }

    #[tokio::test]
    async fn remove_deletes_both() {
        let cluster = MemoryCluster::new();
        let stores = cluster.stores();
        let db = redis(MonitorAgent::PrometheusOperator);
        MonitorBackend::for_database(&db)
            .ensure(&db, &stores, &Ownership::of(&db), None)
            .await
            .unwrap();

        remove(&db, &stores, &Ownership::of(&db), None).await.unwrap();
        assert!(cluster.services.keys().is_empty());
        assert!(cluster.service_monitors.keys().is_empty());
    }

    #[tokio::test]
    async fn moved_service_monitor_leaves_nothing_behind() {
        let cluster = MemoryCluster::new();
        let stores = cluster.stores();
        let mut db = redis(MonitorAgent::PrometheusOperator);
        MonitorBackend::for_database(&db)
            .ensure(&db, &stores, &Ownership::of(&db), None)
            .await
            .unwrap();
        assert_eq!(service_monitor_namespace(&db).as_deref(), Some("monitoring"));

        if let Some(prometheus) = db.spec.monitor.as_mut().and_then(|m| m.prometheus.as_mut()) {
            prometheus.namespace = Some("metrics".to_string());
        }
        MonitorBackend::for_database(&db)
            .ensure(&db, &stores, &Ownership::of(&db), Some("monitoring"))
            .await
            .unwrap();

        let keys = cluster.service_monitors.keys();
        assert_eq!(keys, vec![ObjectKey::new("metrics", "kubedb-demo-cache1")]);
    }

    #[tokio::test]
    async fn disabled_monitor_cleans_the_recorded_namespace() {
        let cluster = MemoryCluster::new();
        let stores = cluster.stores();
        let mut db = redis(MonitorAgent::PrometheusOperator);
        MonitorBackend::for_database(&db)
            .ensure(&db, &stores, &Ownership::of(&db), None)
            .await
            .unwrap();

        db.spec.monitor = None;
        assert_eq!(service_monitor_namespace(&db), None);
        MonitorBackend::for_database(&db)
            .ensure(&db, &stores, &Ownership::of(&db), Some("monitoring"))
            .await
            .unwrap();
        assert!(cluster.service_monitors.keys().is_empty());
        assert!(cluster.services.keys().is_empty());
    }

    #[tokio::test]
    async fn unowned_stats_service_survives_removal() {
        let cluster = MemoryCluster::new();
        let stores = cluster.stores();
        let mut db = redis(MonitorAgent::PrometheusOperator);
        db.spec.monitor = None;

        let mut foreign = Service::default();
        foreign.metadata.name = Some("cache1-stats".to_string());
        foreign.metadata.namespace = Some("demo".to_string());
        cluster.services.seed(&foreign).unwrap();

        MonitorBackend::for_database(&db)
            .ensure(&db, &stores, &Ownership::of(&db), None)
            .await
            .unwrap();
        assert!(cluster.services.get_sync("demo", "cache1-stats").unwrap().is_some());
    }
}

//! Memcached Custom Resource Definition

use k8s_openapi::api::core::v1::{Container, ContainerPort};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{DatabaseKind, DatabaseStatus, MonitorSpec, ServiceTemplate, TerminationPolicy};
use super::{Database, OriginSpec, PrimaryPort};

pub const MEMCACHED_PORT: i32 = 11211;

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kubedb.com",
    version = "v1alpha1",
    kind = "Memcached",
    plural = "memcacheds",
    namespaced,
    status = "DatabaseStatus",
    shortname = "mc",
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MemcachedSpec {
    pub version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_template: Option<ServiceTemplate>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitor: Option<MonitorSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination_policy: Option<TerminationPolicy>,
}

impl Database for Memcached {
    const KIND: DatabaseKind = DatabaseKind::Memcached;

    fn version(&self) -> &str {
        &self.spec.version
    }

    fn replicas(&self) -> i32 {
        self.spec.replicas.unwrap_or(1)
    }

    fn service_template(&self) -> Option<&ServiceTemplate> {
        self.spec.service_template.as_ref()
    }

    fn monitor(&self) -> Option<&MonitorSpec> {
        self.spec.monitor.as_ref()
    }

    fn termination_policy(&self) -> TerminationPolicy {
        self.spec.termination_policy.unwrap_or_default()
    }

    fn database_status(&self) -> Option<&DatabaseStatus> {
        self.status.as_ref()
    }

    fn primary_port(&self) -> PrimaryPort {
        PrimaryPort {
            name: "db",
            port: MEMCACHED_PORT,
        }
    }

    fn container(&self) -> Container {
        Container {
            name: "memcached".to_string(),
            image: Some(format!("memcached:{}", self.spec.version)),
            ports: Some(vec![ContainerPort {
                name: Some("db".to_string()),
                container_port: MEMCACHED_PORT,
                ..Default::default()
            }]),
            ..Default::default()
        }
    }

    fn exporter_image(&self) -> &'static str {
        "prom/memcached-exporter:v0.14.2"
    }

    fn origin_spec(&self) -> OriginSpec {
        OriginSpec {
            memcached: Some(self.spec.clone()),
            ..Default::default()
        }
    }

    fn set_defaults(&mut self) {
        let spec = &mut self.spec;
        spec.replicas.get_or_insert(1);
        spec.termination_policy
            .get_or_insert(TerminationPolicy::default());
        if let Some(monitor) = spec.monitor.as_mut() {
            monitor.set_default_port();
        }
    }
}

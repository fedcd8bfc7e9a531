//! PgBouncer Custom Resource Definition
//!
//! A PgBouncer fronts one or more PostgreSQL databases with a connection pool.
//! Unlike the caches it owns a generated `<name>-auth` Secret holding the admin
//! credentials, which survives a `Delete` termination and is removed on `WipeOut`.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, EnvVarSource, SecretKeySelector,
};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{DatabaseKind, DatabaseStatus, MonitorSpec, ServiceTemplate, TerminationPolicy};
use super::{Database, OriginSpec, PrimaryPort};

pub const DEFAULT_POOL_PORT: i32 = 5432;

/// # Example
///
/// ```yaml
/// apiVersion: kubedb.com/v1alpha1
/// kind: PgBouncer
/// metadata:
///   name: pool1
///   namespace: demo
/// spec:
///   version: "1.17.0"
///   databases:
///     - alias: postgres
///       databaseName: postgres
///       databaseRef: quick-postgres
///   connectionPool:
///     maxClientConnections: 20
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kubedb.com",
    version = "v1alpha1",
    kind = "PgBouncer",
    plural = "pgbouncers",
    namespaced,
    status = "DatabaseStatus",
    shortname = "pb",
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PgBouncerSpec {
    /// PgBouncer image tag
    pub version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Backend databases exposed through the pool
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub databases: Vec<PgBouncerDatabase>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_pool: Option<ConnectionPoolConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_template: Option<ServiceTemplate>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitor: Option<MonitorSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination_policy: Option<TerminationPolicy>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PgBouncerDatabase {
    /// Name clients connect with
    pub alias: String,
    pub database_name: String,
    /// Name of the backing Postgres object in the same namespace
    pub database_ref: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionPoolConfig {
    /// Port the pooler listens on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool_mode: Option<PoolMode>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_client_connections: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_pool_size: Option<i32>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PoolMode {
    #[default]
    Session,
    Transaction,
    Statement,
}

impl PoolMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolMode::Session => "session",
            PoolMode::Transaction => "transaction",
            PoolMode::Statement => "statement",
        }
    }
}

impl PgBouncer {
    pub fn pool_port(&self) -> i32 {
        self.spec
            .connection_pool
            .as_ref()
            .and_then(|p| p.port)
            .unwrap_or(DEFAULT_POOL_PORT)
    }

    fn pool_env(&self) -> Vec<EnvVar> {
        let pool = self.spec.connection_pool.clone().unwrap_or_default();
        let mut env = BTreeMap::new();
        env.insert("PGBOUNCER_PORT", self.pool_port().to_string());
        env.insert(
            "PGBOUNCER_POOL_MODE",
            pool.pool_mode.unwrap_or_default().as_str().to_string(),
        );
        if let Some(max) = pool.max_client_connections {
            env.insert("PGBOUNCER_MAX_CLIENT_CONN", max.to_string());
        }
        if let Some(size) = pool.default_pool_size {
            env.insert("PGBOUNCER_DEFAULT_POOL_SIZE", size.to_string());
        }
        if !self.spec.databases.is_empty() {
            let databases = self
                .spec
                .databases
                .iter()
                .map(|db| format!("{}={}/{}", db.alias, db.database_ref, db.database_name))
                .collect::<Vec<_>>()
                .join(",");
            env.insert("PGBOUNCER_DATABASES", databases);
        }

        let mut vars: Vec<EnvVar> = env
            .into_iter()
            .map(|(name, value)| EnvVar {
                name: name.to_string(),
                value: Some(value),
                ..Default::default()
            })
            .collect();
        if let Some(secret) = self.auth_secret_name() {
            vars.push(EnvVar {
                name: "PGBOUNCER_ADMIN_PASSWORD".to_string(),
                value_from: Some(EnvVarSource {
                    secret_key_ref: Some(SecretKeySelector {
                        name: Some(secret),
                        key: "password".to_string(),
                        optional: None,
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            });
        }
        vars
    }
}

impl Database for PgBouncer {
    const KIND: DatabaseKind = DatabaseKind::PgBouncer;

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
            name: "api",
            port: self.pool_port(),
        }
    }

    fn container(&self) -> Container {
        Container {
            name: "pgbouncer".to_string(),
            image: Some(format!("kubedb/pgbouncer:{}", self.spec.version)),
            env: Some(self.pool_env()),
            ports: Some(vec![ContainerPort {
                name: Some("api".to_string()),
                container_port: self.pool_port(),
                ..Default::default()
            }]),
            ..Default::default()
        }
    }

    fn exporter_image(&self) -> &'static str {
        "prometheuscommunity/pgbouncer-exporter:v0.7.0"
    }

    fn origin_spec(&self) -> OriginSpec {
        OriginSpec {
            pg_bouncer: Some(self.spec.clone()),
            ..Default::default()
        }
    }

    fn set_defaults(&mut self) {
        let spec = &mut self.spec;
        spec.replicas.get_or_insert(1);
        spec.termination_policy
            .get_or_insert(TerminationPolicy::default());
        let pool = spec.connection_pool.get_or_insert_with(Default::default);
        pool.port.get_or_insert(DEFAULT_POOL_PORT);
        pool.pool_mode.get_or_insert(PoolMode::default());
        if let Some(monitor) = spec.monitor.as_mut() {
            monitor.set_default_port();
        }
    }

    fn auth_secret_name(&self) -> Option<String> {
        Some(auth_secret_name(&self.name_any()))
    }
}

/// Name of the generated admin credential secret for the pooler `name`
pub fn auth_secret_name(name: &str) -> String {
    format!("{name}-auth")
}

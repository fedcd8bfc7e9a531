//! Custom Resource Definitions for KubeDB
//!
//! This module defines the database CRDs, the DormantDatabase archival record, and
//! the [`Database`] adapter trait the generic reconciler is written against.

mod dormant_database;
mod memcached;
mod pgbouncer;
mod redis;
mod types;

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::time::Duration;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::api::core::v1::Container;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::wait::{await_condition, conditions};
use kube::{Client, CustomResourceExt, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::info;

use crate::error::{Error, Result};

pub use dormant_database::{
    DormantDatabase, DormantDatabaseSpec, Origin, OriginMeta, OriginSpec,
};
pub use memcached::{Memcached, MemcachedSpec, MEMCACHED_PORT};
pub use pgbouncer::{
    auth_secret_name, ConnectionPoolConfig, PgBouncer, PgBouncerDatabase, PgBouncerSpec,
    PoolMode, DEFAULT_POOL_PORT,
};
pub use redis::{Redis, RedisSpec, REDIS_PORT};
pub use types::*;

/// Named port the primary service exposes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PrimaryPort {
    pub name: &'static str,
    pub port: i32,
}

/// Per-kind adapter over a database custom resource.
///
/// The reconciler, the dormant protocol and the admission mutator are written once
/// against this trait; each engine supplies its ports, container and defaults.
pub trait Database:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    const KIND: DatabaseKind;

    fn version(&self) -> &str;
    fn replicas(&self) -> i32;
    fn service_template(&self) -> Option<&ServiceTemplate>;
    fn monitor(&self) -> Option<&MonitorSpec>;
    fn termination_policy(&self) -> TerminationPolicy;
    fn database_status(&self) -> Option<&DatabaseStatus>;
    fn primary_port(&self) -> PrimaryPort;

    /// Engine container placed in the workload's pod template
    fn container(&self) -> Container;

    /// Image of the metrics exporter sidecar used when monitoring is enabled
    fn exporter_image(&self) -> &'static str;

    /// Snapshot of the spec recorded in a DormantDatabase
    fn origin_spec(&self) -> OriginSpec;

    /// Fill unset optional fields with engine defaults. Must be idempotent.
    fn set_defaults(&mut self);

    /// Generated credential secret, if the engine owns one
    fn auth_secret_name(&self) -> Option<String> {
        None
    }

    /// Name shared by the workload, primary service and service account
    fn offshoot_name(&self) -> String {
        self.name_any()
    }

    /// Labels that select this database's pods
    fn offshoot_selectors(&self) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(
            LABEL_DATABASE_KIND.to_string(),
            Self::KIND.as_str().to_string(),
        );
        labels.insert(LABEL_DATABASE_NAME.to_string(), self.name_any());
        labels
    }

    /// User labels of the database plus the selectors
    fn offshoot_labels(&self) -> BTreeMap<String, String> {
        let mut labels = self.labels().clone();
        labels.extend(self.offshoot_selectors());
        labels
    }

    fn stats_service_name(&self) -> String {
        format!("{}-stats", self.name_any())
    }

    fn stats_labels(&self) -> BTreeMap<String, String> {
        let mut labels = self.offshoot_labels();
        labels.insert(LABEL_ROLE.to_string(), "stats".to_string());
        labels
    }
}

/// Every CRD the operator owns
pub fn crds() -> Vec<CustomResourceDefinition> {
    vec![
        Redis::crd(),
        Memcached::crd(),
        PgBouncer::crd(),
        DormantDatabase::crd(),
    ]
}

/// Install the CRDs with server-side apply and wait until the API server serves them
pub async fn install(client: &Client, timeout: Duration) -> Result<()> {
    let api: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply("kubedb-operator").force();

    for crd in crds() {
        let name = crd.name_any();
        info!("Installing {} CRD", name);
        api.patch(&name, &params, &Patch::Apply(&crd)).await?;

        let established = await_condition(api.clone(), &name, conditions::is_crd_established());
        match tokio::time::timeout(timeout, established).await {
            Ok(res) => {
                res.map_err(|e| Error::ConfigError(format!("waiting for CRD {name}: {e}")))?;
            }
            Err(_) => {
                return Err(Error::WaitTimeout {
                    what: format!("CRD {name} is established"),
                    timeout,
                })
            }
        }
    }
    Ok(())
}

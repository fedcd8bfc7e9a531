//! Object store abstraction
//!
//! The reconciler never talks to `kube::Api` directly; it goes through [`Store`], which
//! has a cluster-backed implementation ([`KubeStore`]) and an in-process one
//! ([`MemoryStore`]) with the same conflict, not-found and finalizer semantics.

mod kube_store;
mod memory;

use std::collections::BTreeMap;
use std::fmt;
use std::fmt::Debug;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Pod, Secret, Service, ServiceAccount};
use k8s_openapi::NamespaceResourceScope;
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::controller::monitor::ServiceMonitor;
use crate::crd::DormantDatabase;
use crate::error::{Error, Result};

pub use kube_store::KubeStore;
pub use memory::{Journal, JournalEntry, MemoryCluster, MemoryStore, Verb};

/// Anything the operator reads or writes: a namespaced, serde-capable API object
pub trait StoredObject:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<T> StoredObject for T where
    T: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// `namespace/name` identity of a namespaced object
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn from_resource<K: Resource>(obj: &K) -> Result<Self> {
        let namespace = obj.namespace().ok_or(Error::MissingObjectKey("namespace"))?;
        let name = obj.meta().name.clone().ok_or(Error::MissingObjectKey("name"))?;
        Ok(Self { namespace, name })
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for ObjectKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(Self::new(ns, name))
            }
            _ => Err(Error::InvalidKey(s.to_string())),
        }
    }
}

/// A write against an existing object
#[derive(Clone, Debug)]
pub enum StorePatch {
    /// RFC 6902 operations. The API server rejects a failing `test` op with 422;
    /// both stores report it as a 409 conflict.
    Json(json_patch::Patch),
    /// RFC 7386 merge patch
    Merge(serde_json::Value),
}

/// CRUD over one namespaced kind
#[async_trait]
pub trait Store<K>: Send + Sync
where
    K: Send + Sync + 'static,
{
    /// Fetch an object; absence is `Ok(None)`
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>>;

    /// List objects in `namespace` carrying every label in `labels`
    async fn list(&self, namespace: &str, labels: &BTreeMap<String, String>) -> Result<Vec<K>>;

    /// Create; an existing object with the same name is an `AlreadyExists` error
    async fn create(&self, namespace: &str, obj: &K) -> Result<K>;

    async fn patch(&self, namespace: &str, name: &str, patch: &StorePatch) -> Result<K>;

    /// Merge `status` into the status subresource
    async fn patch_status(&self, namespace: &str, name: &str, status: &serde_json::Value)
        -> Result<K>;

    /// Delete with background propagation; an absent object is success
    async fn delete(&self, namespace: &str, name: &str) -> Result<()>;
}

/// Turn the 422 the API server returns for a failed `test` op into a 409 conflict
pub(crate) fn conflict_on_failed_test(err: kube::Error, patch: &json_patch::Patch) -> kube::Error {
    let guarded = patch
        .0
        .iter()
        .any(|op| matches!(op, json_patch::PatchOperation::Test(_)));
    match err {
        kube::Error::Api(mut e) if guarded && e.code == 422 && e.message.contains("test failed") => {
            e.code = 409;
            e.reason = "Conflict".to_string();
            kube::Error::Api(e)
        }
        other => other,
    }
}

/// Render a label map as a selector string
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Stores for every child kind the reconcilers touch
#[derive(Clone)]
pub struct ClusterStores {
    pub services: Arc<dyn Store<Service>>,
    pub stateful_sets: Arc<dyn Store<StatefulSet>>,
    pub service_accounts: Arc<dyn Store<ServiceAccount>>,
    pub pods: Arc<dyn Store<Pod>>,
    pub secrets: Arc<dyn Store<Secret>>,
    pub service_monitors: Arc<dyn Store<ServiceMonitor>>,
    pub dormant_databases: Arc<dyn Store<DormantDatabase>>,
}

impl ClusterStores {
    pub fn from_client(client: &Client) -> Self {
        Self {
            services: Arc::new(KubeStore::<Service>::new(client.clone())),
            stateful_sets: Arc::new(KubeStore::<StatefulSet>::new(client.clone())),
            service_accounts: Arc::new(KubeStore::<ServiceAccount>::new(client.clone())),
            pods: Arc::new(KubeStore::<Pod>::new(client.clone())),
            secrets: Arc::new(KubeStore::<Secret>::new(client.clone())),
            service_monitors: Arc::new(KubeStore::<ServiceMonitor>::new(client.clone())),
            dormant_databases: Arc::new(KubeStore::<DormantDatabase>::new(client.clone())),
        }
    }
}

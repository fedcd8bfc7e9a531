//! In-process object store used by tests
//!
//! Objects are kept as JSON documents so patches apply exactly as they would on the
//! API server. A failed JSON Patch `test` is rejected with the server's 422 and
//! reported as a 409 conflict, as [`KubeStore`](super::KubeStore) does. Deleting an
//! object with finalizers only stamps its deletion timestamp; removing the last
//! finalizer of a deleting object removes it.

use std::collections::{BTreeMap, HashSet};
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Pod, Secret, Service, ServiceAccount};
use kube::error::ErrorResponse;
use serde_json::{json, Value};

use super::{conflict_on_failed_test, ClusterStores, ObjectKey, Store, StorePatch, StoredObject};
use crate::controller::change_feed::Indexer;
use crate::controller::monitor::ServiceMonitor;
use crate::crd::DormantDatabase;
use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Verb {
    Create,
    Patch,
    PatchStatus,
    Delete,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JournalEntry {
    pub verb: Verb,
    pub kind: String,
    pub key: String,
}

/// Ordered record of every write, shared by all stores of a [`MemoryCluster`]
#[derive(Clone, Default)]
pub struct Journal {
    entries: Arc<Mutex<Vec<JournalEntry>>>,
}

impl Journal {
    fn record(&self, verb: Verb, kind: &str, key: String) {
        lock(&self.entries).push(JournalEntry {
            verb,
            kind: kind.to_string(),
            key,
        });
    }

    pub fn entries(&self) -> Vec<JournalEntry> {
        lock(&self.entries).clone()
    }

    /// Index of the first entry matching `verb` and `kind`
    pub fn position(&self, verb: Verb, kind: &str) -> Option<usize> {
        lock(&self.entries)
            .iter()
            .position(|e| e.verb == verb && e.kind == kind)
    }

    pub fn count(&self, verb: Verb, kind: &str) -> usize {
        lock(&self.entries)
            .iter()
            .filter(|e| e.verb == verb && e.kind == kind)
            .count()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct Inner {
    objects: BTreeMap<ObjectKey, Value>,
    next_version: u64,
    faults: HashSet<Verb>,
}

impl Inner {
    fn bump(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }
}

pub struct MemoryStore<K> {
    inner: Mutex<Inner>,
    journal: Journal,
    _kind: PhantomData<fn() -> K>,
}

impl<K: StoredObject> MemoryStore<K> {
    pub fn new(journal: Journal) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            journal,
            _kind: PhantomData,
        }
    }

    /// Make every subsequent `verb` fail with a 500 until [`clear_faults`](Self::clear_faults)
    pub fn fail_on(&self, verb: Verb) {
        lock(&self.inner).faults.insert(verb);
    }

    pub fn clear_faults(&self) {
        lock(&self.inner).faults.clear();
    }

    /// Insert or replace an object without recording it in the journal
    pub fn seed(&self, obj: &K) -> Result<K> {
        let key = ObjectKey::from_resource(obj)?;
        let mut inner = lock(&self.inner);
        let mut doc = serde_json::to_value(obj)?;
        let version = inner.bump();
        stamp_new(&mut doc, &key, &version);
        inner.objects.insert(key, doc.clone());
        Ok(serde_json::from_value(doc)?)
    }

    pub fn get_sync(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        let inner = lock(&self.inner);
        inner
            .objects
            .get(&ObjectKey::new(namespace, name))
            .map(|doc| serde_json::from_value(doc.clone()).map_err(Error::from))
            .transpose()
    }

    pub fn keys(&self) -> Vec<ObjectKey> {
        lock(&self.inner).objects.keys().cloned().collect()
    }

    fn kind() -> String {
        K::kind(&()).into_owned()
    }

    fn check_fault(&self, inner: &Inner, verb: Verb) -> Result<()> {
        if inner.faults.contains(&verb) {
            return Err(api_error(500, "InternalError", "injected fault"));
        }
        Ok(())
    }
}

fn stamp_new(doc: &mut Value, key: &ObjectKey, version: &str) {
    let meta = &mut doc["metadata"];
    meta["namespace"] = json!(key.namespace);
    meta["resourceVersion"] = json!(version);
    if meta.get("uid").map_or(true, Value::is_null) {
        meta["uid"] = json!(format!("uid-{}-{}", key, version));
    }
    if meta.get("creationTimestamp").map_or(true, Value::is_null) {
        meta["creationTimestamp"] = json!(Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true));
    }
    if meta.get("generation").map_or(true, Value::is_null) {
        meta["generation"] = json!(1);
    }
}

fn api_error(code: u16, reason: &str, message: &str) -> Error {
    Error::KubeError(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: message.to_string(),
        reason: reason.to_string(),
        code,
    }))
}

fn not_found(kind: &str, key: &ObjectKey) -> Error {
    api_error(404, "NotFound", &format!("{kind} \"{key}\" not found"))
}

fn finalizers_empty(doc: &Value) -> bool {
    doc.pointer("/metadata/finalizers")
        .and_then(Value::as_array)
        .map_or(true, Vec::is_empty)
}

fn is_deleting(doc: &Value) -> bool {
    doc.pointer("/metadata/deletionTimestamp")
        .map_or(false, |v| !v.is_null())
}

/// Evaluate the `test` operations of a patch against `doc`
fn check_tests(doc: &Value, patch: &json_patch::Patch) -> Result<()> {
    let ops = serde_json::to_value(patch)?;
    for op in ops.as_array().into_iter().flatten() {
        if op["op"] != "test" {
            continue;
        }
        let path = op["path"].as_str().unwrap_or_default();
        if doc.pointer(path) != Some(&op["value"]) {
            let rejected = kube::Error::Api(ErrorResponse {
                status: "Failure".to_string(),
                message: format!("testing value {path} failed: test failed"),
                reason: "Invalid".to_string(),
                code: 422,
            });
            return Err(Error::KubeError(conflict_on_failed_test(rejected, patch)));
        }
    }
    Ok(())
}

fn labels_match(doc: &Value, selector: &BTreeMap<String, String>) -> bool {
    let labels = doc.pointer("/metadata/labels");
    selector
        .iter()
        .all(|(k, v)| labels.and_then(|l| l.get(k)).and_then(Value::as_str) == Some(v))
}

#[async_trait]
impl<K: StoredObject> Store<K> for MemoryStore<K> {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        self.get_sync(namespace, name)
    }

    async fn list(&self, namespace: &str, labels: &BTreeMap<String, String>) -> Result<Vec<K>> {
        let inner = lock(&self.inner);
        inner
            .objects
            .iter()
            .filter(|(key, doc)| key.namespace == namespace && labels_match(doc, labels))
            .map(|(_, doc)| serde_json::from_value(doc.clone()).map_err(Error::from))
            .collect()
    }

    async fn create(&self, namespace: &str, obj: &K) -> Result<K> {
        let mut inner = lock(&self.inner);
        self.check_fault(&inner, Verb::Create)?;

        let name = obj.meta().name.clone().ok_or(Error::MissingObjectKey("name"))?;
        let key = ObjectKey::new(namespace, name);
        if inner.objects.contains_key(&key) {
            return Err(api_error(
                409,
                "AlreadyExists",
                &format!("{} \"{}\" already exists", Self::kind(), key),
            ));
        }

        let mut doc = serde_json::to_value(obj)?;
        let version = inner.bump();
        stamp_new(&mut doc, &key, &version);
        inner.objects.insert(key.clone(), doc.clone());
        self.journal.record(Verb::Create, &Self::kind(), key.to_string());
        Ok(serde_json::from_value(doc)?)
    }

    async fn patch(&self, namespace: &str, name: &str, patch: &StorePatch) -> Result<K> {
        let mut inner = lock(&self.inner);
        self.check_fault(&inner, Verb::Patch)?;

        let key = ObjectKey::new(namespace, name);
        let mut doc = inner
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| not_found(&Self::kind(), &key))?;

        match patch {
            StorePatch::Json(p) => {
                check_tests(&doc, p)?;
                json_patch::patch(&mut doc, p)
                    .map_err(|e| api_error(422, "Invalid", &e.to_string()))?;
            }
            StorePatch::Merge(v) => json_patch::merge(&mut doc, v),
        }

        doc["metadata"]["resourceVersion"] = json!(inner.bump());
        self.journal.record(Verb::Patch, &Self::kind(), key.to_string());
        if is_deleting(&doc) && finalizers_empty(&doc) {
            inner.objects.remove(&key);
        } else {
            inner.objects.insert(key, doc.clone());
        }
        Ok(serde_json::from_value(doc)?)
    }

    async fn patch_status(&self, namespace: &str, name: &str, status: &Value) -> Result<K> {
        let mut inner = lock(&self.inner);
        self.check_fault(&inner, Verb::PatchStatus)?;

        let key = ObjectKey::new(namespace, name);
        let version = inner.bump();
        let doc = inner
            .objects
            .get_mut(&key)
            .ok_or_else(|| not_found(&Self::kind(), &key))?;
        json_patch::merge(doc, &json!({ "status": status }));
        doc["metadata"]["resourceVersion"] = json!(version);
        let out = serde_json::from_value(doc.clone())?;
        self.journal
            .record(Verb::PatchStatus, &Self::kind(), key.to_string());
        Ok(out)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        let mut inner = lock(&self.inner);
        self.check_fault(&inner, Verb::Delete)?;

        let key = ObjectKey::new(namespace, name);
        let Some(doc) = inner.objects.get(&key).cloned() else {
            return Ok(());
        };
        self.journal.record(Verb::Delete, &Self::kind(), key.to_string());

        if finalizers_empty(&doc) {
            inner.objects.remove(&key);
        } else if !is_deleting(&doc) {
            let version = inner.bump();
            if let Some(doc) = inner.objects.get_mut(&key) {
                doc["metadata"]["deletionTimestamp"] =
                    json!(Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true));
                doc["metadata"]["resourceVersion"] = json!(version);
            }
        }
        Ok(())
    }
}

impl<K: StoredObject> Indexer<K> for MemoryStore<K> {
    fn get_by_key(&self, key: &ObjectKey) -> Result<Option<K>> {
        self.get_sync(&key.namespace, &key.name)
    }
}

/// Memory stores for every child kind, sharing one journal
#[derive(Clone)]
pub struct MemoryCluster {
    pub journal: Journal,
    pub services: Arc<MemoryStore<Service>>,
    pub stateful_sets: Arc<MemoryStore<StatefulSet>>,
    pub service_accounts: Arc<MemoryStore<ServiceAccount>>,
    pub pods: Arc<MemoryStore<Pod>>,
    pub secrets: Arc<MemoryStore<Secret>>,
    pub service_monitors: Arc<MemoryStore<ServiceMonitor>>,
    pub dormant_databases: Arc<MemoryStore<DormantDatabase>>,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCluster {
    pub fn new() -> Self {
        let journal = Journal::default();
        Self {
            services: Arc::new(MemoryStore::new(journal.clone())),
            stateful_sets: Arc::new(MemoryStore::new(journal.clone())),
            service_accounts: Arc::new(MemoryStore::new(journal.clone())),
            pods: Arc::new(MemoryStore::new(journal.clone())),
            secrets: Arc::new(MemoryStore::new(journal.clone())),
            service_monitors: Arc::new(MemoryStore::new(journal.clone())),
            dormant_databases: Arc::new(MemoryStore::new(journal.clone())),
            journal,
        }
    }

    /// A store for a database kind that records into the shared journal
    pub fn database_store<K: StoredObject>(&self) -> Arc<MemoryStore<K>> {
        Arc::new(MemoryStore::new(self.journal.clone()))
    }

    pub fn stores(&self) -> ClusterStores {
        ClusterStores {
            services: self.services.clone(),
            stateful_sets: self.stateful_sets.clone(),
            service_accounts: self.service_accounts.clone(),
            pods: self.pods.clone(),
            secrets: self.secrets.clone(),
            service_monitors: self.service_monitors.clone(),
            dormant_databases: self.dormant_databases.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn secret(name: &str, finalizers: Option<Vec<String>>) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("demo".to_string()),
                finalizers,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_twice_is_already_exists() {
        let store = MemoryStore::<Secret>::new(Journal::default());
        store.create("demo", &secret("s", None)).await.unwrap();
        let err = store.create("demo", &secret("s", None)).await.unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn stale_resource_version_is_a_conflict() {
        let store = MemoryStore::<Secret>::new(Journal::default());
        store.create("demo", &secret("s", None)).await.unwrap();
        let patch: json_patch::Patch = serde_json::from_value(json!([
            { "op": "test", "path": "/metadata/resourceVersion", "value": "0" },
            { "op": "add", "path": "/type", "value": "Opaque" }
        ]))
        .unwrap();
        let err = store
            .patch("demo", "s", &StorePatch::Json(patch))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn finalizers_hold_deletion() {
        let store = MemoryStore::<Secret>::new(Journal::default());
        store
            .create("demo", &secret("s", Some(vec!["kubedb.com".to_string()])))
            .await
            .unwrap();
        store.delete("demo", "s").await.unwrap();

        let held = store.get("demo", "s").await.unwrap().unwrap();
        assert!(held.metadata.deletion_timestamp.is_some());

        let clear = StorePatch::Merge(json!({ "metadata": { "finalizers": null } }));
        store.patch("demo", "s", &clear).await.unwrap();
        assert!(store.get("demo", "s").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_filters_by_labels() {
        let store = MemoryStore::<Secret>::new(Journal::default());
        let mut labelled = secret("a", None);
        labelled.metadata.labels = Some(BTreeMap::from([("app".to_string(), "x".to_string())]));
        store.create("demo", &labelled).await.unwrap();
        store.create("demo", &secret("b", None)).await.unwrap();

        let selector = BTreeMap::from([("app".to_string(), "x".to_string())]);
        let found = store.list("demo", &selector).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(store.list("demo", &BTreeMap::new()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn injected_faults_fail_writes() {
        let store = MemoryStore::<Secret>::new(Journal::default());
        store.fail_on(Verb::Create);
        let err = store.create("demo", &secret("s", None)).await.unwrap_err();
        assert!(err.is_retriable());
        store.clear_faults();
        store.create("demo", &secret("s", None)).await.unwrap();
    }
}

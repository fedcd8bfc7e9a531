//! Finalizer bookkeeping
//!
//! Both helpers write JSON patches guarded by a `test` operation so that a concurrent
//! writer turns into a retryable conflict rather than a lost update. A 404 means the
//! object is already gone and is reported as `Ok(None)`.

use kube::ResourceExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::crd::FINALIZER;
use crate::error::Result;
use crate::store::{ObjectKey, Store, StorePatch, StoredObject};

pub fn has_finalizer<K: ResourceExt>(obj: &K) -> bool {
    obj.finalizers().iter().any(|f| f == FINALIZER)
}

pub fn is_deleting<K: ResourceExt>(obj: &K) -> bool {
    obj.meta().deletion_timestamp.is_some()
}

/// Append the operator finalizer. Returns the patched object.
pub async fn add_finalizer<K: StoredObject>(store: &dyn Store<K>, obj: &K) -> Result<Option<K>> {
    if has_finalizer(obj) {
        return Ok(Some(obj.clone()));
    }
    let key = ObjectKey::from_resource(obj)?;

    let mut ops: Vec<Value> = Vec::new();
    if let Some(rv) = obj.resource_version() {
        ops.push(json!({ "op": "test", "path": "/metadata/resourceVersion", "value": rv }));
    }
    if obj.finalizers().is_empty() {
        ops.push(json!({ "op": "add", "path": "/metadata/finalizers", "value": [FINALIZER] }));
    } else {
        ops.push(json!({ "op": "add", "path": "/metadata/finalizers/-", "value": FINALIZER }));
    }

    debug!(key = %key, "Adding finalizer");
    apply(store, &key, ops).await
}

/// Drop the operator finalizer, leaving any others in place
pub async fn remove_finalizer<K: StoredObject>(
    store: &dyn Store<K>,
    obj: &K,
) -> Result<Option<K>> {
    let Some(idx) = obj.finalizers().iter().position(|f| f == FINALIZER) else {
        return Ok(Some(obj.clone()));
    };
    let key = ObjectKey::from_resource(obj)?;
    let path = format!("/metadata/finalizers/{idx}");
    let ops = vec![
        json!({ "op": "test", "path": path, "value": FINALIZER }),
        json!({ "op": "remove", "path": path }),
    ];

    debug!(key = %key, "Removing finalizer");
    apply(store, &key, ops).await
}

async fn apply<K: StoredObject>(
    store: &dyn Store<K>,
    key: &ObjectKey,
    ops: Vec<Value>,
) -> Result<Option<K>> {
    let patch: json_patch::Patch = serde_json::from_value(Value::Array(ops))?;
    match store
        .patch(&key.namespace, &key.name, &StorePatch::Json(patch))
        .await
    {
        Ok(obj) => Ok(Some(obj)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{Redis, RedisSpec};
    use crate::store::{Journal, MemoryStore};

    fn redis(finalizers: Option<Vec<String>>) -> Redis {
        let mut r = Redis::new("cache1", RedisSpec::default());
        r.metadata.namespace = Some("demo".to_string());
        r.metadata.finalizers = finalizers;
        r
    }

    #[tokio::test]
    async fn add_then_remove_keeps_foreign_finalizers() {
        let store = MemoryStore::<Redis>::new(Journal::default());
        let created = store
            .create("demo", &redis(Some(vec!["other.io/guard".to_string()])))
            .await
            .unwrap();

        let added = add_finalizer(&store, &created).await.unwrap().unwrap();
        assert_eq!(added.finalizers(), &["other.io/guard", FINALIZER]);

        let removed = remove_finalizer(&store, &added).await.unwrap().unwrap();
        assert_eq!(removed.finalizers(), &["other.io/guard"]);
    }

    #[tokio::test]
    async fn stale_snapshot_conflicts() {
        let store = MemoryStore::<Redis>::new(Journal::default());
        let created = store.create("demo", &redis(None)).await.unwrap();
        add_finalizer(&store, &created).await.unwrap();

        let err = add_finalizer(&store, &created).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn missing_object_is_not_an_error() {
        let store = MemoryStore::<Redis>::new(Journal::default());
        let ghost = redis(Some(vec![FINALIZER.to_string()]));
        assert!(remove_finalizer(&store, &ghost).await.unwrap().is_none());
    }
}

use std::collections::BTreeMap;
use std::marker::PhantomData;

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;
use tracing::debug;

use super::{conflict_on_failed_test, label_selector, Store, StoredObject, StorePatch};
use crate::error::{Error, Result};

/// [`Store`] backed by the Kubernetes API server
pub struct KubeStore<K> {
    client: Client,
    _kind: PhantomData<fn() -> K>,
}

impl<K> KubeStore<K> {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            _kind: PhantomData,
        }
    }
}

impl<K: StoredObject> KubeStore<K> {
    fn api(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl<K: StoredObject> Store<K> for KubeStore<K> {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        Ok(self.api(namespace).get_opt(name).await?)
    }

    async fn list(&self, namespace: &str, labels: &BTreeMap<String, String>) -> Result<Vec<K>> {
        let mut params = ListParams::default();
        if !labels.is_empty() {
            params = params.labels(&label_selector(labels));
        }
        Ok(self.api(namespace).list(&params).await?.items)
    }

    async fn create(&self, namespace: &str, obj: &K) -> Result<K> {
        Ok(self
            .api(namespace)
            .create(&PostParams::default(), obj)
            .await?)
    }

    async fn patch(&self, namespace: &str, name: &str, patch: &StorePatch) -> Result<K> {
        let params = PatchParams::default();
        let api = self.api(namespace);
        let res = match patch {
            StorePatch::Json(p) => api
                .patch(name, &params, &Patch::<()>::Json(p.clone()))
                .await
                .map_err(|e| conflict_on_failed_test(e, p)),
            StorePatch::Merge(v) => api.patch(name, &params, &Patch::Merge(v)).await,
        };
        Ok(res?)
    }

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &serde_json::Value,
    ) -> Result<K> {
        let body = json!({ "status": status });
        Ok(self
            .api(namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&body))
            .await?)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        match self
            .api(namespace)
            .delete(name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => {
                debug!("{}/{} already gone", namespace, name);
                Ok(())
            }
            Err(e) => Err(Error::KubeError(e)),
        }
    }
}

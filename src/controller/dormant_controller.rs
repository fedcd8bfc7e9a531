//! DormantDatabase reconciler
//!
//! Keeps `.status.phase` at `Paused` while a record sits idle. Setting
//! `spec.wipeOut` wipes the leftover artifacts of the origin database and deletes
//! the record. A record deleted directly only wipes when `wipeOut` is set.

use std::sync::Arc;

use async_trait::async_trait;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use serde_json::json;
use tracing::{debug, info, instrument};

use super::change_feed::Indexer;
use super::dormant::wipe_out;
use super::events::{reasons, EventSink};
use super::finalizers::{add_finalizer, has_finalizer, is_deleting, remove_finalizer};
use super::workqueue::Process;
use crate::crd::{DatabasePhase, DormantDatabase};
use crate::error::{Error, Result};
use crate::store::{ClusterStores, ObjectKey, Store};

pub struct DormantReconciler {
    store: Arc<dyn Store<DormantDatabase>>,
    stores: ClusterStores,
    indexer: Arc<dyn Indexer<DormantDatabase>>,
    events: Arc<dyn EventSink>,
}

impl DormantReconciler {
    pub fn new(
        store: Arc<dyn Store<DormantDatabase>>,
        stores: ClusterStores,
        indexer: Arc<dyn Indexer<DormantDatabase>>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            store,
            stores,
            indexer,
            events,
        }
    }

    #[instrument(skip(self), fields(key = %key))]
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<()> {
        let Some(ddb) = self.indexer.get_by_key(key)? else {
            debug!("DormantDatabase {} no longer exists", key);
            return Ok(());
        };

        if is_deleting(&ddb) {
            if has_finalizer(&ddb) {
                if ddb.spec.wipe_out {
                    self.wipe(&ddb).await?;
                }
                remove_finalizer(self.store.as_ref(), &ddb).await?;
            }
            return Ok(());
        }

        let ddb = if has_finalizer(&ddb) {
            ddb
        } else {
            match add_finalizer(self.store.as_ref(), &ddb).await? {
                Some(ddb) => ddb,
                None => return Ok(()),
            }
        };

        if ddb.spec.wipe_out {
            self.set_phase(&ddb, DatabasePhase::WipingOut).await?;
            self.wipe(&ddb).await?;
            self.store
                .delete(&key.namespace, &key.name)
                .await?;
            info!("Deleted wiped out DormantDatabase {}", key);
            return Ok(());
        }

        self.set_phase(&ddb, DatabasePhase::Paused).await
    }

    async fn wipe(&self, ddb: &DormantDatabase) -> Result<()> {
        let origin = &ddb.spec.origin;
        if let Err(e) = wipe_out(
            &origin.spec,
            &origin.metadata.namespace,
            &origin.metadata.name,
            &self.stores,
        )
        .await
        {
            self.publish(ddb, EventType::Warning, reasons::FAILED_TO_DELETE, &e.to_string())
                .await;
            return Err(e);
        }
        self.publish(
            ddb,
            EventType::Normal,
            reasons::WIPED_OUT,
            "Leftover artifacts deleted",
        )
        .await;
        Ok(())
    }

    async fn set_phase(&self, ddb: &DormantDatabase, phase: DatabasePhase) -> Result<()> {
        let current = ddb.status.as_ref().and_then(|s| s.phase);
        if current == Some(phase) {
            return Ok(());
        }
        let patch = json!({
            "phase": phase,
            "observedGeneration": ddb.meta().generation,
        });
        let namespace = ddb.namespace().unwrap_or_default();
        match self
            .store
            .patch_status(&namespace, &ddb.name_any(), &patch)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn publish(&self, ddb: &DormantDatabase, type_: EventType, reason: &str, message: &str) {
        self.events
            .publish(&ddb.object_ref(&()), type_, reason, message)
            .await;
    }
}

#[async_trait]
impl Process<ObjectKey> for DormantReconciler {
    fn name(&self) -> &str {
        "dormantdatabase"
    }

    async fn process(&self, key: &ObjectKey) -> Result<()> {
        self.reconcile(key).await
    }

    async fn retries_exhausted(&self, key: &ObjectKey, err: &Error) {
        if let Ok(Some(ddb)) = self.indexer.get_by_key(key) {
            let message = format!("Still failing after repeated retries: {err}");
            self.publish(&ddb, EventType::Warning, reasons::RETRIES_EXHAUSTED, &message)
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::dormant::dormant_database_for;
    use crate::controller::events::MemoryEventSink;
    use crate::crd::{Database, PgBouncer, PgBouncerSpec, FINALIZER};
    use crate::store::{MemoryCluster, MemoryStore};
    use k8s_openapi::api::core::v1::Secret;

    fn setup() -> (MemoryCluster, DormantReconciler, MemoryEventSink) {
        let cluster = MemoryCluster::new();
        let events = MemoryEventSink::default();
        let store: Arc<MemoryStore<DormantDatabase>> = cluster.dormant_databases.clone();
        let reconciler = DormantReconciler::new(
            store.clone(),
            cluster.stores(),
            store,
            Arc::new(events.clone()),
        );
        (cluster, reconciler, events)
    }

    fn seed_pgbouncer_record(cluster: &MemoryCluster, wipe_out: bool) {
        let mut pgb = PgBouncer::new(
            "pool1",
            PgBouncerSpec {
                version: "1.22.0".to_string(),
                ..Default::default()
            },
        );
        pgb.metadata.namespace = Some("demo".to_string());
        let mut ddb = dormant_database_for(&pgb);
        ddb.spec.wipe_out = wipe_out;
        cluster.dormant_databases.seed(&ddb).unwrap();

        let mut secret = Secret::default();
        secret.metadata.name = Some("pool1-auth".to_string());
        secret.metadata.namespace = Some("demo".to_string());
        secret.metadata.labels = Some(pgb.offshoot_selectors());
        cluster.secrets.seed(&secret).unwrap();
    }

    #[tokio::test]
    async fn idle_record_is_paused() {
        let (cluster, reconciler, _) = setup();
        seed_pgbouncer_record(&cluster, false);
        let key = ObjectKey::new("demo", "pool1");

        reconciler.reconcile(&key).await.unwrap();

        let ddb = cluster.dormant_databases.get_sync("demo", "pool1").unwrap().unwrap();
        assert!(ddb.finalizers().contains(&FINALIZER.to_string()));
        assert_eq!(ddb.status.unwrap().phase, Some(DatabasePhase::Paused));
        assert!(cluster.secrets.get_sync("demo", "pool1-auth").unwrap().is_some());
    }

    #[tokio::test]
    async fn wipe_out_removes_secret_and_record() {
        let (cluster, reconciler, events) = setup();
        seed_pgbouncer_record(&cluster, true);
        let key = ObjectKey::new("demo", "pool1");

        reconciler.reconcile(&key).await.unwrap();
        assert!(cluster.secrets.get_sync("demo", "pool1-auth").unwrap().is_none());
        let held = cluster.dormant_databases.get_sync("demo", "pool1").unwrap().unwrap();
        assert!(held.metadata.deletion_timestamp.is_some());

        // the deletion event finishes the job
        reconciler.reconcile(&key).await.unwrap();
        assert!(cluster.dormant_databases.get_sync("demo", "pool1").unwrap().is_none());
        assert!(events.reasons().contains(&reasons::WIPED_OUT.to_string()));
    }

    #[tokio::test]
    async fn direct_delete_keeps_artifacts() {
        let (cluster, reconciler, _) = setup();
        seed_pgbouncer_record(&cluster, false);
        let key = ObjectKey::new("demo", "pool1");
        reconciler.reconcile(&key).await.unwrap();

        cluster.dormant_databases.delete("demo", "pool1").await.unwrap();
        reconciler.reconcile(&key).await.unwrap();

        assert!(cluster.dormant_databases.get_sync("demo", "pool1").unwrap().is_none());
        assert!(cluster.secrets.get_sync("demo", "pool1-auth").unwrap().is_some());
    }
}

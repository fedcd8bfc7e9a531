//! Generic database reconciler
//!
//! One instance runs per database kind. Each pass re-derives what to do from the
//! latest cached object:
//! - deleting with our finalizer: run cleanup for the termination policy, then drop
//!   the finalizer (never before cleanup succeeds);
//! - not deleting and no finalizer: record the finalizer before touching any child;
//! - otherwise converge every owned child and report the phase in status.

use std::sync::Arc;

use async_trait::async_trait;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::change_feed::Indexer;
use super::convergence::{create_or_patch, delete_owned, Outcome, Ownership};
use super::dormant::{
    create_dormant_database, delete_matching_dormant_database, wait_until_paused, wipe_out,
    WaitConfig,
};
use super::events::{reasons, EventSink};
use super::finalizers::{add_finalizer, has_finalizer, is_deleting, remove_finalizer};
use super::monitor::{self, MonitorBackend};
use super::resources::{
    desired_auth_secret, desired_service, desired_service_account, desired_stateful_set,
};
use super::workqueue::Process;
use crate::crd::{Database, DatabasePhase, DatabaseStatus, TerminationPolicy};
use crate::error::{Error, Result};
use crate::store::{ClusterStores, ObjectKey, Store};

/// Tunables shared by every reconciler
#[derive(Clone, Debug, Default)]
pub struct Settings {
    pub wait: WaitConfig,
    /// Cancels in-progress dormant waits on shutdown
    pub shutdown: CancellationToken,
}

pub struct Reconciler<D: Database> {
    name: String,
    store: Arc<dyn Store<D>>,
    stores: ClusterStores,
    indexer: Arc<dyn Indexer<D>>,
    events: Arc<dyn EventSink>,
    settings: Settings,
}

impl<D: Database> Reconciler<D> {
    pub fn new(
        store: Arc<dyn Store<D>>,
        stores: ClusterStores,
        indexer: Arc<dyn Indexer<D>>,
        events: Arc<dyn EventSink>,
        settings: Settings,
    ) -> Self {
        Self {
            name: D::KIND.as_str().to_lowercase(),
            store,
            stores,
            indexer,
            events,
            settings,
        }
    }

    /// Run one pass for `key`
    #[instrument(skip(self), fields(kind = D::KIND.as_str(), key = %key))]
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<()> {
        let Some(db) = self.indexer.get_by_key(key)? else {
            debug!("{} {} no longer exists", D::KIND, key);
            return Ok(());
        };

        if is_deleting(&db) {
            if has_finalizer(&db) {
                self.cleanup(&db).await?;
                remove_finalizer(self.store.as_ref(), &db).await?;
                info!("Finalized {} {}", D::KIND, key);
            }
            return Ok(());
        }

        let db = if has_finalizer(&db) {
            db
        } else {
            match add_finalizer(self.store.as_ref(), &db).await? {
                Some(db) => db,
                None => return Ok(()),
            }
        };

        self.ensure(&db).await
    }

    async fn ensure(&self, db: &D) -> Result<()> {
        let db = match db.database_status().and_then(|s| s.phase) {
            Some(_) => db.clone(),
            None => self
                .set_status(db, DatabasePhase::Creating, None)
                .await?
                .unwrap_or_else(|| db.clone()),
        };

        match self.converge(&db).await {
            Ok(outcomes) => {
                for (kind, outcome) in outcomes {
                    self.announce(&db, kind, outcome).await;
                }
                self.set_status(&db, DatabasePhase::Running, None).await?;
                Ok(())
            }
            Err(e) => {
                warn!("Failed to ensure {} {}: {}", D::KIND, db.name_any(), e);
                self.publish(&db, EventType::Warning, reasons::FAILED_TO_CREATE, &e.to_string())
                    .await;
                if let Err(status_err) = self
                    .set_status(&db, DatabasePhase::Failed, Some(e.to_string()))
                    .await
                {
                    warn!("Failed to record failure status: {}", status_err);
                }
                Err(e)
            }
        }
    }

    /// Converge every owned child, returning what happened to each
    async fn converge(&self, db: &D) -> Result<Vec<(&'static str, Outcome)>> {
        let namespace = db.namespace().ok_or(Error::MissingObjectKey("namespace"))?;
        let name = db.offshoot_name();
        let ownership = Ownership::of(db);
        let mut outcomes = Vec::new();

        if delete_matching_dormant_database(db, self.stores.dormant_databases.as_ref()).await? {
            info!("Reactivated {} {}/{} from its dormant record", D::KIND, namespace, name);
        }

        let (_, outcome) = create_or_patch(
            self.stores.service_accounts.as_ref(),
            &namespace,
            &name,
            &ownership,
            desired_service_account(db),
        )
        .await?;
        outcomes.push(("ServiceAccount", outcome));

        let (_, outcome) = create_or_patch(
            self.stores.services.as_ref(),
            &namespace,
            &name,
            &ownership,
            desired_service(db),
        )
        .await?;
        outcomes.push(("Service", outcome));

        if let Some(secret) = db.auth_secret_name() {
            // not owned: the secret must outlive a Delete termination
            let (_, outcome) = create_or_patch(
                self.stores.secrets.as_ref(),
                &namespace,
                &secret,
                &ownership.labels_only(),
                desired_auth_secret(db),
            )
            .await?;
            outcomes.push(("Secret", outcome));
        }

        let (_, outcome) = create_or_patch(
            self.stores.stateful_sets.as_ref(),
            &namespace,
            &name,
            &ownership,
            desired_stateful_set(db),
        )
        .await?;
        outcomes.push(("StatefulSet", outcome));

        let monitored = MonitorBackend::for_database(db)
            .ensure(db, &self.stores, &ownership, recorded_monitor_namespace(db))
            .await?;
        outcomes.extend(monitored);

        Ok(outcomes)
    }

    async fn cleanup(&self, db: &D) -> Result<()> {
        let policy = db.termination_policy();
        info!("Terminating {} {} with policy {:?}", D::KIND, db.name_any(), policy);

        let res = match policy {
            TerminationPolicy::Pause => self.pause(db).await,
            TerminationPolicy::Delete => self.delete_children(db).await,
            TerminationPolicy::WipeOut => {
                async {
                    self.delete_children(db).await?;
                    let namespace = db.namespace().unwrap_or_default();
                    wipe_out(&db.origin_spec(), &namespace, &db.name_any(), &self.stores).await
                }
                .await
            }
        };

        if let Err(e) = &res {
            let reason = match policy {
                TerminationPolicy::Pause => reasons::FAILED_TO_PAUSE,
                _ => reasons::FAILED_TO_DELETE,
            };
            self.publish(db, EventType::Warning, reason, &e.to_string())
                .await;
        }
        res
    }

    async fn pause(&self, db: &D) -> Result<()> {
        self.delete_children(db).await?;
        wait_until_paused(db, &self.stores, &self.settings.wait, &self.settings.shutdown).await?;
        create_dormant_database(db, self.stores.dormant_databases.as_ref()).await?;
        self.publish(
            db,
            EventType::Normal,
            reasons::PAUSED,
            "Workload removed and DormantDatabase recorded",
        )
        .await;
        Ok(())
    }

    /// Delete the children of `db`. Objects it does not own are left in place.
    async fn delete_children(&self, db: &D) -> Result<()> {
        let namespace = db.namespace().unwrap_or_default();
        let name = db.offshoot_name();
        let ownership = Ownership::of(db);

        monitor::remove(db, &self.stores, &ownership, recorded_monitor_namespace(db)).await?;
        delete_owned(self.stores.stateful_sets.as_ref(), &namespace, &name, &ownership).await?;
        delete_owned(self.stores.services.as_ref(), &namespace, &name, &ownership).await?;
        delete_owned(self.stores.service_accounts.as_ref(), &namespace, &name, &ownership).await?;
        Ok(())
    }

    /// Patch status when it differs. Returns the updated object, `None` if it is gone.
    async fn set_status(
        &self,
        db: &D,
        phase: DatabasePhase,
        reason: Option<String>,
    ) -> Result<Option<D>> {
        // the ServiceMonitor namespace only moves once a pass has converged
        let service_monitor_namespace = match phase {
            DatabasePhase::Running => monitor::service_monitor_namespace(db),
            _ => recorded_monitor_namespace(db).map(str::to_string),
        };
        let desired = DatabaseStatus {
            phase: Some(phase),
            reason,
            observed_generation: db.meta().generation,
            service_monitor_namespace,
        };
        if db.database_status() == Some(&desired) {
            return Ok(Some(db.clone()));
        }

        let patch = json!({
            "phase": desired.phase,
            "reason": desired.reason,
            "observedGeneration": desired.observed_generation,
            "serviceMonitorNamespace": desired.service_monitor_namespace,
        });
        let namespace = db.namespace().unwrap_or_default();
        match self.store.patch_status(&namespace, &db.name_any(), &patch).await {
            Ok(updated) => Ok(Some(updated)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn announce(&self, db: &D, kind: &str, outcome: Outcome) {
        let reason = match outcome {
            Outcome::Created => reasons::CREATED,
            Outcome::Patched => reasons::PATCHED,
            Outcome::Unchanged => return,
        };
        let message = format!("Successfully {} {}", outcome.as_str(), kind);
        self.publish(db, EventType::Normal, reason, &message).await;
    }

    async fn publish(&self, db: &D, type_: EventType, reason: &str, message: &str) {
        self.events
            .publish(&db.object_ref(&()), type_, reason, message)
            .await;
    }
}

fn recorded_monitor_namespace<D: Database>(db: &D) -> Option<&str> {
    db.database_status()
        .and_then(|s| s.service_monitor_namespace.as_deref())
}

#[async_trait]
impl<D: Database> Process<ObjectKey> for Reconciler<D> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, key: &ObjectKey) -> Result<()> {
        self.reconcile(key).await
    }

    async fn retries_exhausted(&self, key: &ObjectKey, err: &Error) {
        if let Ok(Some(db)) = self.indexer.get_by_key(key) {
            let message = format!("Still failing after repeated retries: {err}");
            self.publish(&db, EventType::Warning, reasons::RETRIES_EXHAUSTED, &message)
                .await;
        }
    }
}

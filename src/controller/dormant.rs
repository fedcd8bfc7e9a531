//! Dormant database lifecycle
//!
//! Pausing a database tears its workload down, waits until pods, services and the
//! service account are really gone, and then records a DormantDatabase holding the
//! origin spec. Recreating a database with the same name removes that record, first
//! clearing a pending `wipeOut`, so reactivation never wipes data.

use std::future::Future;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::{Resource, ResourceExt};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::convergence::{delete_owned, Ownership};
use crate::crd::{Database, DormantDatabase, DormantDatabaseSpec, Origin, OriginMeta, OriginSpec};
use crate::error::{Error, Result};
use crate::store::{ClusterStores, Store, StorePatch};

/// Bounds on every dormant-protocol wait
#[derive(Clone, Copy, Debug)]
pub struct WaitConfig {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            poll_interval: Duration::from_secs(2),
        }
    }
}

/// Poll `check` until it reports true, the deadline passes, or `cancel` fires
pub async fn wait_until<F, Fut>(
    what: &str,
    cfg: &WaitConfig,
    cancel: &CancellationToken,
    mut check: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let poll = async {
        loop {
            if check().await? {
                return Ok(());
            }
            tokio::time::sleep(cfg.poll_interval).await;
        }
    };

    tokio::select! {
        _ = cancel.cancelled() => Err(Error::Cancelled(what.to_string())),
        res = tokio::time::timeout(cfg.timeout, poll) => match res {
            Ok(res) => res,
            Err(_) => Err(Error::WaitTimeout {
                what: what.to_string(),
                timeout: cfg.timeout,
            }),
        },
    }
}

/// Wait until the workload of `db` is fully torn down
pub async fn wait_until_paused<D: Database>(
    db: &D,
    stores: &ClusterStores,
    cfg: &WaitConfig,
    cancel: &CancellationToken,
) -> Result<()> {
    let namespace = db.namespace().unwrap_or_default();
    let selectors = db.offshoot_selectors();
    let name = db.offshoot_name();
    let (ns, sel, sa) = (namespace.as_str(), &selectors, name.as_str());

    wait_until("pods are deleted", cfg, cancel, move || async move {
        let pods: Vec<Pod> = stores.pods.list(ns, sel).await?;
        debug!(remaining = pods.len(), "Waiting for pods of {}/{}", ns, sa);
        Ok(pods.is_empty())
    })
    .await?;

    wait_until("services are deleted", cfg, cancel, move || async move {
        Ok(stores.services.list(ns, sel).await?.is_empty())
    })
    .await?;

    // a same-named account the database never owned is not waited on
    let ownership = Ownership::of(db);
    let ownership = &ownership;
    wait_until("service account is deleted", cfg, cancel, move || async move {
        Ok(match stores.service_accounts.get(ns, sa).await? {
            Some(account) => !ownership.claims(account.meta()),
            None => true,
        })
    })
    .await
}

/// The archival record for `db`
pub fn dormant_database_for<D: Database>(db: &D) -> DormantDatabase {
    let mut ddb = DormantDatabase::new(
        &db.name_any(),
        DormantDatabaseSpec {
            origin: Origin {
                metadata: OriginMeta {
                    name: db.name_any(),
                    namespace: db.namespace().unwrap_or_default(),
                    labels: db.labels().clone(),
                    annotations: db.annotations().clone(),
                    creation_timestamp: db
                        .meta()
                        .creation_timestamp
                        .as_ref()
                        .map(|t| t.0.to_rfc3339()),
                },
                spec: db.origin_spec(),
            },
            wipe_out: false,
        },
    );
    ddb.metadata.namespace = db.namespace();
    ddb.metadata.labels = Some(db.offshoot_selectors());
    ddb
}

fn ensure_same_kind<D: Database>(existing: &DormantDatabase) -> Result<()> {
    if existing.spec.origin.spec.kind() == Some(D::KIND) {
        return Ok(());
    }
    Err(Error::NamingConflict {
        kind: "DormantDatabase".to_string(),
        namespace: existing.namespace().unwrap_or_default(),
        name: existing.name_any(),
    })
}

/// Record `db` as dormant. A record left by an earlier attempt is reused.
pub async fn create_dormant_database<D: Database>(
    db: &D,
    store: &dyn Store<DormantDatabase>,
) -> Result<DormantDatabase> {
    let ddb = dormant_database_for(db);
    let namespace = db.namespace().unwrap_or_default();

    match store.create(&namespace, &ddb).await {
        Ok(created) => {
            info!("Created DormantDatabase {}/{}", namespace, created.name_any());
            Ok(created)
        }
        Err(e) if e.is_already_exists() => {
            let existing = store
                .get(&namespace, &db.name_any())
                .await?
                .ok_or(e)?;
            ensure_same_kind::<D>(&existing)?;
            Ok(existing)
        }
        Err(e) => Err(e),
    }
}

/// Remove a stale record left by an earlier incarnation of `db`.
///
/// A record with `wipeOut` set has it cleared before the delete so the record's own
/// cleanup never touches the data the new database is about to use. A record that
/// does not request a wipe is deleted as is.
pub async fn delete_matching_dormant_database<D: Database>(
    db: &D,
    store: &dyn Store<DormantDatabase>,
) -> Result<bool> {
    let namespace = db.namespace().unwrap_or_default();
    let name = db.name_any();
    let Some(existing) = store.get(&namespace, &name).await? else {
        return Ok(false);
    };
    ensure_same_kind::<D>(&existing)?;

    if existing.spec.wipe_out {
        let patch = StorePatch::Merge(json!({ "spec": { "wipeOut": false } }));
        match store.patch(&namespace, &name, &patch).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => return Ok(true),
            Err(e) => return Err(e),
        }
    }
    store.delete(&namespace, &name).await?;
    info!("Deleted stale DormantDatabase {}/{}", namespace, name);
    Ok(true)
}

/// Delete the artifacts an archived database leaves behind.
///
/// Only artifacts labeled as belonging to the database are removed.
pub async fn wipe_out(
    origin: &OriginSpec,
    namespace: &str,
    name: &str,
    stores: &ClusterStores,
) -> Result<()> {
    let Some(kind) = origin.kind() else {
        return Ok(());
    };
    let ownership = Ownership::of_archived(kind, name);
    for secret in origin.leftover_secrets(name) {
        if delete_owned(stores.secrets.as_ref(), namespace, &secret, &ownership).await? {
            info!("Wiped out Secret {}/{}", namespace, secret);
        }
    }
    Ok(())
}

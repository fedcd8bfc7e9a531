//! Create-or-patch convergence for owned children
//!
//! A child is identified by namespace and a deterministic name. The desired state is
//! expressed as a transform over the observed object, so fields the operator does not
//! manage (cluster IPs, node ports, status) survive untouched. Writes are JSON patches
//! holding only the diff, prefixed with a `test` on `metadata.resourceVersion`.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};
use serde_json::{json, Value};
use tracing::{debug, info};

use super::metrics;
use crate::crd::{Database, DatabaseKind, LABEL_DATABASE_KIND, LABEL_DATABASE_NAME};
use crate::error::{Error, Result};
use crate::store::{Store, StorePatch, StoredObject};

/// What a convergence pass did to the child
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Created,
    Patched,
    Unchanged,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Created => "created",
            Outcome::Patched => "patched",
            Outcome::Unchanged => "unchanged",
        }
    }
}

/// The parent a child must belong to
#[derive(Clone, Debug)]
pub struct Ownership {
    /// Controller reference stamped on the child; absent for cross-namespace children
    pub owner: Option<OwnerReference>,
    /// Labels identifying the parent
    pub selectors: BTreeMap<String, String>,
}

impl Ownership {
    pub fn of<D: Database>(db: &D) -> Self {
        Self {
            owner: db.controller_owner_ref(&()),
            selectors: db.offshoot_selectors(),
        }
    }

    /// Label-only ownership for a database that no longer exists
    pub fn of_archived(kind: DatabaseKind, name: &str) -> Self {
        Self {
            owner: None,
            selectors: BTreeMap::from([
                (LABEL_DATABASE_KIND.to_string(), kind.as_str().to_string()),
                (LABEL_DATABASE_NAME.to_string(), name.to_string()),
            ]),
        }
    }

    /// Same parent, but without an owner reference
    pub fn labels_only(&self) -> Self {
        Self {
            owner: None,
            selectors: self.selectors.clone(),
        }
    }

    /// Whether an existing object is owned by, or labeled as belonging to, this parent
    pub fn claims(&self, meta: &ObjectMeta) -> bool {
        let owned = self.owner.as_ref().is_some_and(|owner| {
            meta.owner_references
                .iter()
                .flatten()
                .any(|r| r.uid == owner.uid)
        });
        if owned {
            return true;
        }

        let labels = meta.labels.clone().unwrap_or_default();
        [LABEL_DATABASE_KIND, LABEL_DATABASE_NAME]
            .iter()
            .all(|k| self.selectors.get(*k).is_some() && labels.get(*k) == self.selectors.get(*k))
    }
}

/// Upsert `owner` into the owner references of `meta`, keyed by UID
pub fn ensure_owner_reference(meta: &mut ObjectMeta, owner: &OwnerReference) {
    let refs = meta.owner_references.get_or_insert_with(Vec::new);
    match refs.iter_mut().find(|r| r.uid == owner.uid) {
        Some(existing) => *existing = owner.clone(),
        None => refs.push(owner.clone()),
    }
}

/// Bring the child `namespace/name` to `transform(observed)`.
///
/// An absent child is built from `C::default()`. An existing child that the
/// parent does not claim is left alone and reported as a naming conflict.
pub async fn create_or_patch<C, F>(
    store: &dyn Store<C>,
    namespace: &str,
    name: &str,
    ownership: &Ownership,
    transform: F,
) -> Result<(C, Outcome)>
where
    C: StoredObject + Default,
    F: Fn(C) -> C,
{
    let kind = C::kind(&()).into_owned();

    let (obj, outcome) = match store.get(namespace, name).await? {
        None => {
            let mut blank = C::default();
            blank.meta_mut().name = Some(name.to_string());
            blank.meta_mut().namespace = Some(namespace.to_string());

            let mut desired = transform(blank);
            if let Some(owner) = &ownership.owner {
                ensure_owner_reference(desired.meta_mut(), owner);
            }
            info!("Creating {} {}/{}", kind, namespace, name);
            (store.create(namespace, &desired).await?, Outcome::Created)
        }
        Some(observed) => {
            if !ownership.claims(observed.meta()) {
                return Err(Error::NamingConflict {
                    kind,
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                });
            }

            let mut desired = transform(observed.clone());
            if let Some(owner) = &ownership.owner {
                ensure_owner_reference(desired.meta_mut(), owner);
            }

            match diff_patch(&observed, &desired)? {
                None => (observed, Outcome::Unchanged),
                Some(patch) => {
                    info!("Patching {} {}/{}", kind, namespace, name);
                    let patched = store
                        .patch(namespace, name, &StorePatch::Json(patch))
                        .await?;
                    (patched, Outcome::Patched)
                }
            }
        }
    };

    debug!(kind = %kind, outcome = outcome.as_str(), "{}/{} converged", namespace, name);
    metrics::inc_convergence(&kind, outcome.as_str());
    Ok((obj, outcome))
}

/// Delete the child `namespace/name` if the parent claims it.
///
/// An object the parent does not claim is left in place, mirroring the naming
/// conflict [`create_or_patch`] reports for it. Returns whether a delete was issued.
pub async fn delete_owned<C: StoredObject>(
    store: &dyn Store<C>,
    namespace: &str,
    name: &str,
    ownership: &Ownership,
) -> Result<bool> {
    let Some(observed) = store.get(namespace, name).await? else {
        return Ok(false);
    };
    if !ownership.claims(observed.meta()) {
        info!(
            "Leaving {} {}/{} in place: not owned by this database",
            C::kind(&()),
            namespace,
            name
        );
        return Ok(false);
    }
    store.delete(namespace, name).await?;
    debug!("Deleted {} {}/{}", C::kind(&()), namespace, name);
    Ok(true)
}

/// JSON patch turning `observed` into `desired`, guarded by the observed resourceVersion
fn diff_patch<C: StoredObject>(observed: &C, desired: &C) -> Result<Option<json_patch::Patch>> {
    let before = serde_json::to_value(observed)?;
    let after = serde_json::to_value(desired)?;
    let diff = serde_json::to_value(json_patch::diff(&before, &after))?;

    let mut ops = match diff {
        Value::Array(ops) if !ops.is_empty() => ops,
        _ => return Ok(None),
    };
    if let Some(rv) = observed.resource_version() {
        ops.insert(
            0,
            json!({ "op": "test", "path": "/metadata/resourceVersion", "value": rv }),
        );
    }
    Ok(Some(serde_json::from_value(Value::Array(ops))?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Journal, MemoryStore};
    use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};

    fn ownership() -> Ownership {
        let mut selectors = BTreeMap::new();
        selectors.insert(LABEL_DATABASE_KIND.to_string(), "Redis".to_string());
        selectors.insert(LABEL_DATABASE_NAME.to_string(), "cache1".to_string());
        Ownership {
            owner: Some(OwnerReference {
                api_version: "kubedb.com/v1alpha1".to_string(),
                kind: "Redis".to_string(),
                name: "cache1".to_string(),
                uid: "uid-1".to_string(),
                controller: Some(true),
                block_owner_deletion: Some(true),
            }),
            selectors,
        }
    }

    fn desired(ownership: &Ownership) -> impl Fn(Service) -> Service + '_ {
        move |mut svc: Service| {
            svc.metadata.labels = Some(ownership.selectors.clone());
            let spec = svc.spec.get_or_insert_with(ServiceSpec::default);
            spec.ports = Some(vec![ServicePort {
                name: Some("db".to_string()),
                port: 6379,
                ..Default::default()
            }]);
            svc
        }
    }

    #[tokio::test]
    async fn second_pass_is_unchanged() {
        let store = MemoryStore::<Service>::new(Journal::default());
        let own = ownership();

        let (first, outcome) = create_or_patch(&store, "demo", "cache1", &own, desired(&own))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Created);
        assert_eq!(first.owner_references()[0].uid, "uid-1");

        let (second, outcome) = create_or_patch(&store, "demo", "cache1", &own, desired(&own))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Unchanged);
        assert_eq!(first.spec, second.spec);
        assert_eq!(first.resource_version(), second.resource_version());
    }

    #[tokio::test]
    async fn drift_is_patched() {
        let store = MemoryStore::<Service>::new(Journal::default());
        let own = ownership();
        create_or_patch(&store, "demo", "cache1", &own, desired(&own))
            .await
            .unwrap();

        let (svc, outcome) = create_or_patch(&store, "demo", "cache1", &own, |svc: Service| {
            let mut svc = desired(&own)(svc);
            svc.metadata
                .annotations
                .get_or_insert_with(BTreeMap::new)
                .insert("touched".to_string(), "yes".to_string());
            svc
        })
        .await
        .unwrap();
        assert_eq!(outcome, Outcome::Patched);
        assert_eq!(svc.annotations()["touched"], "yes");
    }

    #[tokio::test]
    async fn foreign_object_is_a_naming_conflict() {
        let store = MemoryStore::<Service>::new(Journal::default());
        let mut foreign = Service::default();
        foreign.metadata.name = Some("cache1".to_string());
        foreign.metadata.namespace = Some("demo".to_string());
        store.create("demo", &foreign).await.unwrap();

        let own = ownership();
        let err = create_or_patch(&store, "demo", "cache1", &own, desired(&own))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NamingConflict { .. }));
        assert!(store.get("demo", "cache1").await.unwrap().unwrap().spec.is_none());
    }

    #[tokio::test]
    async fn labels_alone_claim_the_child() {
        let store = MemoryStore::<Service>::new(Journal::default());
        let own = ownership();
        let mut labelled = Service::default();
        labelled.metadata.name = Some("cache1".to_string());
        labelled.metadata.namespace = Some("demo".to_string());
        labelled.metadata.labels = Some(own.selectors.clone());
        store.create("demo", &labelled).await.unwrap();

        let (svc, outcome) = create_or_patch(&store, "demo", "cache1", &own, desired(&own))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Patched);
        assert_eq!(svc.owner_references().len(), 1);
    }

    #[tokio::test]
    async fn only_claimed_children_are_deleted() {
        let store = MemoryStore::<Service>::new(Journal::default());
        let own = ownership();
        create_or_patch(&store, "demo", "cache1", &own, desired(&own))
            .await
            .unwrap();
        let mut foreign = Service::default();
        foreign.metadata.name = Some("cache1-stats".to_string());
        foreign.metadata.namespace = Some("demo".to_string());
        store.create("demo", &foreign).await.unwrap();

        assert!(!delete_owned(&store, "demo", "cache1-stats", &own).await.unwrap());
        assert!(!delete_owned(&store, "demo", "absent", &own).await.unwrap());
        assert!(delete_owned(&store, "demo", "cache1", &own).await.unwrap());

        assert!(store.get("demo", "cache1").await.unwrap().is_none());
        assert!(store.get("demo", "cache1-stats").await.unwrap().is_some());
    }

    #[test]
    fn archived_ownership_claims_by_labels() {
        let own = Ownership::of_archived(DatabaseKind::Redis, "cache1");
        let mut meta = ObjectMeta {
            labels: Some(ownership().selectors),
            ..Default::default()
        };
        assert!(own.claims(&meta));
        meta.labels = None;
        assert!(!own.claims(&meta));
    }

    #[test]
    fn owner_reference_upserts_by_uid() {
        let own = ownership();
        let owner = own.owner.clone().unwrap();
        let mut meta = ObjectMeta::default();
        ensure_owner_reference(&mut meta, &owner);
        ensure_owner_reference(&mut meta, &owner);
        assert_eq!(meta.owner_references.as_ref().unwrap().len(), 1);
    }
}

//! Mutating admission for the database kinds
//!
//! The mutator fills unset optional fields with engine defaults and answers with the
//! minimal JSON Patch that gets the incoming object there. Defaulting never rejects;
//! only a payload that cannot be decoded, or a patch that cannot be encoded, is denied.

#[cfg(feature = "admission-webhook")]
pub mod server;

use axum::routing::post;
use axum::{Json, Router};
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use kube::core::DynamicObject;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::crd::{Database, Memcached, PgBouncer, Redis, GROUP};
use crate::error::Result;

/// Patch that applies engine defaults to `raw`, or `None` when nothing is unset
pub fn default_patch<K: Database>(raw: &Value) -> Result<Option<json_patch::Patch>> {
    let obj: K = serde_json::from_value(raw.clone())?;
    let before = serde_json::to_value(&obj)?;

    let mut defaulted = obj;
    defaulted.set_defaults();
    let after = serde_json::to_value(&defaulted)?;

    let patch = json_patch::diff(&before, &after);
    if patch.0.is_empty() {
        Ok(None)
    } else {
        Ok(Some(patch))
    }
}

fn reject(resp: AdmissionResponse, code: u16, message: String) -> AdmissionResponse {
    let mut resp = resp.deny(message);
    resp.result.code = code;
    resp
}

/// Review one admission request for kind `K`
pub fn admit<K: Database>(req: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
    let resp = AdmissionResponse::from(req);

    if !matches!(req.operation, Operation::Create | Operation::Update)
        || req.sub_resource.is_some()
        || req.kind.group != GROUP
        || req.kind.kind != K::kind(&())
    {
        debug!(uid = %req.uid, kind = %req.kind.kind, "Skipping admission request");
        return resp;
    }
    let Some(obj) = &req.object else {
        return resp;
    };

    let patch = match serde_json::to_value(obj)
        .map_err(Into::into)
        .and_then(|raw| default_patch::<K>(&raw))
    {
        Ok(Some(patch)) => patch,
        Ok(None) => return resp,
        Err(e) => {
            warn!(uid = %req.uid, "Rejecting undecodable {}: {}", K::KIND, e);
            return reject(resp, 400, format!("failed to decode {}: {e}", K::KIND));
        }
    };

    info!(
        uid = %req.uid,
        name = %req.name,
        ops = patch.0.len(),
        "Defaulting {}",
        K::KIND
    );
    match resp.with_patch(patch) {
        Ok(resp) => resp,
        Err(e) => {
            error!(uid = %req.uid, "Failed to serialize patch: {}", e);
            reject(
                AdmissionResponse::from(req),
                500,
                format!("patch serialization error: {e}"),
            )
        }
    }
}

async fn mutate<K: Database>(
    Json(review): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req: AdmissionRequest<DynamicObject> = match review.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!("Failed to parse admission request: {}", e);
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };
    Json(admit::<K>(&req).into_review())
}

/// One mutating endpoint per database kind
pub fn router() -> Router {
    Router::new()
        .route("/mutate/redises", post(mutate::<Redis>))
        .route("/mutate/memcacheds", post(mutate::<Memcached>))
        .route("/mutate/pgbouncers", post(mutate::<PgBouncer>))
        .route("/healthz", axum::routing::get(|| async { "ok" }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn review(kind: &str, operation: &str, object: Value) -> AdmissionRequest<DynamicObject> {
        let review: AdmissionReview<DynamicObject> = serde_json::from_value(json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "705ab4f5-6393-11e8-b7cc-42010a800002",
                "kind": { "group": "kubedb.com", "version": "v1alpha1", "kind": kind },
                "resource": { "group": "kubedb.com", "version": "v1alpha1", "resource": "redises" },
                "name": "cache1",
                "namespace": "demo",
                "operation": operation,
                "userInfo": {},
                "object": object,
                "dryRun": false
            }
        }))
        .unwrap();
        review.try_into().unwrap()
    }

    fn redis_object(spec: Value) -> Value {
        json!({
            "apiVersion": "kubedb.com/v1alpha1",
            "kind": "Redis",
            "metadata": { "name": "cache1", "namespace": "demo" },
            "spec": spec
        })
    }

    #[test]
    fn defaults_produce_minimal_patch() {
        let raw = redis_object(json!({ "version": "7.2.4", "replicas": 3 }));
        let patch = default_patch::<Redis>(&raw).unwrap().unwrap();
        let paths: Vec<String> = serde_json::to_value(&patch)
            .unwrap()
            .as_array()
            .unwrap()
            .iter()
            .map(|op| op["path"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(paths, vec!["/spec/terminationPolicy"]);
    }

    #[test]
    fn defaulted_object_needs_no_patch() {
        let raw = redis_object(json!({
            "version": "7.2.4",
            "replicas": 1,
            "terminationPolicy": "Pause"
        }));
        assert!(default_patch::<Redis>(&raw).unwrap().is_none());
    }

    #[test]
    fn create_is_patched() {
        let req = review("Redis", "CREATE", redis_object(json!({ "version": "7.2.4" })));
        let resp = admit::<Redis>(&req);
        assert!(resp.allowed);
        assert!(resp.patch.is_some());
    }

    #[test]
    fn delete_and_other_kinds_pass_through() {
        let obj = redis_object(json!({ "version": "7.2.4" }));
        let resp = admit::<Redis>(&review("Redis", "DELETE", obj.clone()));
        assert!(resp.allowed);
        assert!(resp.patch.is_none());

        let resp = admit::<Memcached>(&review("Redis", "CREATE", obj));
        assert!(resp.allowed);
        assert!(resp.patch.is_none());
    }

    #[test]
    fn malformed_object_is_rejected_as_bad_request() {
        let req = review("Redis", "CREATE", redis_object(json!({ "replicas": "three" })));
        let resp = admit::<Redis>(&req);
        assert!(!resp.allowed);
        assert_eq!(resp.result.code, 400);
    }
}

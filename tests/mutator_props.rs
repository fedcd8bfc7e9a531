//! Properties of the defaulting mutator

use proptest::prelude::*;
use serde_json::{json, Value};

use kubedb_operator::admission::default_patch;
use kubedb_operator::crd::{Database, Memcached, PgBouncer, Redis};

fn mutate<K: Database>(raw: &Value) -> Value {
    let mut doc = raw.clone();
    if let Some(patch) = default_patch::<K>(raw).unwrap() {
        json_patch::patch(&mut doc, &patch).unwrap();
    }
    doc
}

fn object(kind: &str, spec: Value) -> Value {
    json!({
        "apiVersion": "kubedb.com/v1alpha1",
        "kind": kind,
        "metadata": { "name": "db1", "namespace": "demo", "labels": { "team": "cache" } },
        "spec": spec
    })
}

fn monitor() -> impl Strategy<Value = Option<Value>> {
    proptest::option::of((
        prop_oneof![Just("prometheus.io/operator"), Just("prometheus.io/builtin")],
        proptest::option::of(1024..65535i32),
    ))
    .prop_map(|m| {
        m.map(|(agent, port)| match port {
            Some(port) => json!({ "agent": agent, "prometheus": { "port": port } }),
            None => json!({ "agent": agent }),
        })
    })
}

fn common_spec() -> impl Strategy<Value = Value> {
    (
        proptest::option::of(1..7i32),
        proptest::option::of(prop_oneof![Just("Pause"), Just("Delete"), Just("WipeOut")]),
        monitor(),
    )
        .prop_map(|(replicas, policy, monitor)| {
            let mut spec = json!({ "version": "1.0.0" });
            if let Some(replicas) = replicas {
                spec["replicas"] = json!(replicas);
            }
            if let Some(policy) = policy {
                spec["terminationPolicy"] = json!(policy);
            }
            if let Some(monitor) = monitor {
                spec["monitor"] = monitor;
            }
            spec
        })
}

fn pgbouncer_spec() -> impl Strategy<Value = Value> {
    (
        common_spec(),
        proptest::option::of((
            proptest::option::of(1024..65535i32),
            proptest::option::of(prop_oneof![
                Just("session"),
                Just("transaction"),
                Just("statement")
            ]),
        )),
    )
        .prop_map(|(mut spec, pool)| {
            if let Some((port, mode)) = pool {
                let mut pool = json!({});
                if let Some(port) = port {
                    pool["port"] = json!(port);
                }
                if let Some(mode) = mode {
                    pool["poolMode"] = json!(mode);
                }
                spec["connectionPool"] = pool;
            }
            spec
        })
}

proptest! {
    #[test]
    fn redis_defaulting_is_idempotent(spec in common_spec()) {
        let once = mutate::<Redis>(&object("Redis", spec));
        prop_assert!(default_patch::<Redis>(&once).unwrap().is_none());
        prop_assert_eq!(mutate::<Redis>(&once), once);
    }

    #[test]
    fn memcached_defaulting_is_idempotent(spec in common_spec()) {
        let once = mutate::<Memcached>(&object("Memcached", spec));
        prop_assert!(default_patch::<Memcached>(&once).unwrap().is_none());
    }

    #[test]
    fn pgbouncer_defaulting_is_idempotent(spec in pgbouncer_spec()) {
        let once = mutate::<PgBouncer>(&object("PgBouncer", spec));
        prop_assert!(default_patch::<PgBouncer>(&once).unwrap().is_none());
    }

    #[test]
    fn explicit_values_survive_defaulting(spec in common_spec()) {
        let raw = object("Redis", spec.clone());
        let once = mutate::<Redis>(&raw);
        for field in ["replicas", "terminationPolicy"] {
            if let Some(value) = spec.get(field) {
                prop_assert_eq!(&once["spec"][field], value);
            }
        }
        if let Some(port) = spec.pointer("/monitor/prometheus/port") {
            prop_assert_eq!(&once["spec"]["monitor"]["prometheus"]["port"], port);
        }
        prop_assert_eq!(&once["metadata"], &raw["metadata"]);
    }
}

#[test]
fn pgbouncer_gets_pool_defaults() {
    let raw = object(
        "PgBouncer",
        json!({ "version": "1.22.0", "monitor": { "agent": "prometheus.io/operator" } }),
    );
    let once = mutate::<PgBouncer>(&raw);

    assert_eq!(once["spec"]["replicas"], 1);
    assert_eq!(once["spec"]["connectionPool"]["port"], 5432);
    assert_eq!(once["spec"]["connectionPool"]["poolMode"], "session");
    assert_eq!(once["spec"]["monitor"]["prometheus"]["port"], 56790);
}

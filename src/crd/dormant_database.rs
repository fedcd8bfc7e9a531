//! DormantDatabase Custom Resource Definition
//!
//! A DormantDatabase is the archival record left behind when a database is deleted
//! with the `Pause` termination policy. It snapshots the origin object's metadata
//! and spec so the database can be recreated later with its data intact. Setting
//! `spec.wipeOut` asks the operator to delete every leftover artifact and then the
//! record itself.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::memcached::MemcachedSpec;
use super::pgbouncer::{auth_secret_name, PgBouncerSpec};
use super::redis::RedisSpec;
use super::types::{DatabaseKind, DatabaseStatus};

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kubedb.com",
    version = "v1alpha1",
    kind = "DormantDatabase",
    plural = "dormantdatabases",
    namespaced,
    status = "DatabaseStatus",
    shortname = "drmn",
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"WipeOut","type":"boolean","jsonPath":".spec.wipeOut"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DormantDatabaseSpec {
    pub origin: Origin,

    /// Request deletion of every leftover artifact along with the record
    #[serde(default)]
    pub wipe_out: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Origin {
    pub metadata: OriginMeta,
    pub spec: OriginSpec,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OriginMeta {
    pub name: String,
    pub namespace: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    /// RFC 3339 timestamp of the origin object's creation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<String>,
}

/// Spec of the origin database. Exactly one field is set.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OriginSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redis: Option<RedisSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memcached: Option<MemcachedSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pg_bouncer: Option<PgBouncerSpec>,
}

impl OriginSpec {
    /// Kind of the archived database, `None` for an empty snapshot
    pub fn kind(&self) -> Option<DatabaseKind> {
        if self.redis.is_some() {
            Some(DatabaseKind::Redis)
        } else if self.memcached.is_some() {
            Some(DatabaseKind::Memcached)
        } else if self.pg_bouncer.is_some() {
            Some(DatabaseKind::PgBouncer)
        } else {
            None
        }
    }

    /// Secrets that outlive the workload and are removed only on wipe-out
    pub fn leftover_secrets(&self, name: &str) -> Vec<String> {
        match self.kind() {
            Some(DatabaseKind::PgBouncer) => vec![auth_secret_name(name)],
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_spec_serializes_under_kind_key() {
        let spec = OriginSpec {
            pg_bouncer: Some(PgBouncerSpec {
                version: "1.17.0".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        };
        let value = serde_json::to_value(&spec).unwrap();
        assert_eq!(value["pgBouncer"]["version"], "1.17.0");
        assert_eq!(spec.kind(), Some(DatabaseKind::PgBouncer));
        assert_eq!(spec.leftover_secrets("pool1"), vec!["pool1-auth".to_string()]);
    }

    #[test]
    fn caches_leave_nothing_behind() {
        let spec = OriginSpec {
            redis: Some(RedisSpec::default()),
            ..Default::default()
        };
        assert!(spec.leftover_secrets("cache1").is_empty());
        assert_eq!(OriginSpec::default().kind(), None);
    }
}

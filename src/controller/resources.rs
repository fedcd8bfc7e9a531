//! Desired state of the children owned by a database
//!
//! Every builder returns a transform `observed -> desired` for
//! [`create_or_patch`](super::convergence::create_or_patch). Transforms only touch the
//! fields the operator manages, so values filled in by the API server (cluster IP,
//! node ports, container defaults) are preserved and a converged child diffs empty.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, PodSpec, Secret, Service, ServiceAccount,
    ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;
use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::crd::{Database, ServiceTemplate, PROMETHEUS_EXPORTER_PORT_NAME};

// ============================================================================
// Helpers
// ============================================================================

fn merge_labels(current: &mut Option<BTreeMap<String, String>>, desired: BTreeMap<String, String>) {
    current.get_or_insert_with(BTreeMap::new).extend(desired);
}

fn named_port(name: &str, port: i32) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        port,
        protocol: Some("TCP".to_string()),
        target_port: Some(IntOrString::String(name.to_string())),
        ..Default::default()
    }
}

/// Union of `current` and `desired` keyed by port name.
///
/// Desired entries replace the number of a same-named current entry and keep its
/// node port, protocol and target port when the desired entry leaves them unset.
/// Current entries that `desired` does not mention are kept in place.
pub fn merge_service_ports(current: &[ServicePort], desired: &[ServicePort]) -> Vec<ServicePort> {
    let mut merged = current.to_vec();
    for want in desired {
        match merged.iter_mut().find(|p| p.name == want.name) {
            Some(have) => {
                have.port = want.port;
                if want.node_port.is_some() {
                    have.node_port = want.node_port;
                }
                if want.protocol.is_some() {
                    have.protocol = want.protocol.clone();
                }
                if want.target_port.is_some() {
                    have.target_port = want.target_port.clone();
                }
            }
            None => merged.push(want.clone()),
        }
    }
    merged
}

/// Ports requested by the primary port plus the user's service template
fn template_ports(primary: ServicePort, template: Option<&ServiceTemplate>) -> Vec<ServicePort> {
    let mut ports = vec![primary];
    let Some(template) = template else {
        return ports;
    };
    for extra in &template.spec.ports {
        match ports.iter_mut().find(|p| p.name.as_deref() == Some(extra.name.as_str())) {
            Some(port) => {
                if let Some(number) = extra.port {
                    port.port = number;
                }
                port.node_port = extra.node_port;
            }
            None => {
                if let Some(number) = extra.port {
                    let mut port = named_port(&extra.name, number);
                    port.target_port = None;
                    port.node_port = extra.node_port;
                    ports.push(port);
                }
            }
        }
    }
    ports
}

fn apply_service_template(spec: &mut ServiceSpec, template: Option<&ServiceTemplate>) {
    let Some(template) = template else {
        return;
    };
    let t = &template.spec;
    if t.type_.is_some() {
        spec.type_ = t.type_.clone();
    }
    if t.cluster_ip.is_some() {
        spec.cluster_ip = t.cluster_ip.clone();
    }
    if !t.external_ips.is_empty() {
        spec.external_ips = Some(t.external_ips.clone());
    }
    if t.load_balancer_ip.is_some() {
        spec.load_balancer_ip = t.load_balancer_ip.clone();
    }
    if !t.load_balancer_source_ranges.is_empty() {
        spec.load_balancer_source_ranges = Some(t.load_balancer_source_ranges.clone());
    }
    if t.external_traffic_policy.is_some() {
        spec.external_traffic_policy = t.external_traffic_policy.clone();
    }
    if t.health_check_node_port.is_some() {
        spec.health_check_node_port = t.health_check_node_port;
    }
}

/// Replace the managed fields of the same-named container, or append it
fn upsert_container(containers: &mut Vec<Container>, want: Container) {
    match containers.iter_mut().find(|c| c.name == want.name) {
        Some(have) => {
            have.image = want.image;
            have.args = want.args;
            have.env = want.env;
            have.ports = want.ports;
        }
        None => containers.push(want),
    }
}

fn exporter_container<D: Database>(db: &D, port: i32) -> Container {
    Container {
        name: "exporter".to_string(),
        image: Some(db.exporter_image().to_string()),
        args: Some(vec![format!("--web.listen-address=:{port}")]),
        ports: Some(vec![ContainerPort {
            name: Some(PROMETHEUS_EXPORTER_PORT_NAME.to_string()),
            container_port: port,
            ..Default::default()
        }]),
        ..Default::default()
    }
}

// ============================================================================
// Core Resources
// ============================================================================

pub fn desired_service_account<D: Database>(db: &D) -> impl Fn(ServiceAccount) -> ServiceAccount + '_ {
    move |mut sa: ServiceAccount| {
        merge_labels(&mut sa.metadata.labels, db.offshoot_labels());
        sa
    }
}

/// Primary service: the engine port merged with the user's template
pub fn desired_service<D: Database>(db: &D) -> impl Fn(Service) -> Service + '_ {
    move |mut svc: Service| {
        merge_labels(&mut svc.metadata.labels, db.offshoot_labels());
        if let Some(annotations) = db.service_template().and_then(|t| t.annotations.clone()) {
            merge_labels(&mut svc.metadata.annotations, annotations);
        }

        let primary = db.primary_port();
        let wanted = template_ports(named_port(primary.name, primary.port), db.service_template());

        let spec = svc.spec.get_or_insert_with(ServiceSpec::default);
        spec.selector = Some(db.offshoot_selectors());
        let current = spec.ports.take().unwrap_or_default();
        spec.ports = Some(merge_service_ports(&current, &wanted));
        apply_service_template(spec, db.service_template());
        svc
    }
}

/// Stats service exposing the exporter port, carrying `annotations` for scrapers
pub fn desired_stats_service<'a, D: Database>(
    db: &'a D,
    port: i32,
    annotations: BTreeMap<String, String>,
) -> impl Fn(Service) -> Service + 'a {
    move |mut svc: Service| {
        merge_labels(&mut svc.metadata.labels, db.stats_labels());
        if !annotations.is_empty() {
            merge_labels(&mut svc.metadata.annotations, annotations.clone());
        }
        let spec = svc.spec.get_or_insert_with(ServiceSpec::default);
        spec.selector = Some(db.offshoot_selectors());
        let current = spec.ports.take().unwrap_or_default();
        spec.ports = Some(merge_service_ports(
            &current,
            &[named_port(PROMETHEUS_EXPORTER_PORT_NAME, port)],
        ));
        svc
    }
}

/// Workload running the engine, plus the exporter sidecar when monitored
pub fn desired_stateful_set<D: Database>(db: &D) -> impl Fn(StatefulSet) -> StatefulSet + '_ {
    move |mut sts: StatefulSet| {
        merge_labels(&mut sts.metadata.labels, db.offshoot_labels());

        let spec = sts.spec.get_or_insert_with(StatefulSetSpec::default);
        spec.replicas = Some(db.replicas());
        spec.service_name = db.offshoot_name();
        // immutable once created
        if spec.selector.match_labels.is_none() && spec.selector.match_expressions.is_none() {
            spec.selector = LabelSelector {
                match_labels: Some(db.offshoot_selectors()),
                match_expressions: None,
            };
        }

        let template = &mut spec.template;
        let meta = template.metadata.get_or_insert_with(Default::default);
        merge_labels(&mut meta.labels, db.offshoot_labels());

        let pod = template.spec.get_or_insert_with(PodSpec::default);
        pod.service_account_name = Some(db.offshoot_name());
        upsert_container(&mut pod.containers, db.container());
        if let Some(monitor) = db.monitor() {
            upsert_container(&mut pod.containers, exporter_container(db, monitor.port()));
        }
        sts
    }
}

/// Generated admin credentials; an existing password is never rotated
pub fn desired_auth_secret<D: Database>(db: &D) -> impl Fn(Secret) -> Secret + '_ {
    move |mut secret: Secret| {
        merge_labels(&mut secret.metadata.labels, db.offshoot_labels());
        secret.type_.get_or_insert_with(|| "Opaque".to_string());

        let data = secret.data.get_or_insert_with(BTreeMap::new);
        data.entry("username".to_string())
            .or_insert_with(|| ByteString(b"pgbouncer".to_vec()));
        data.entry("password".to_string())
            .or_insert_with(|| ByteString(generate_password().into_bytes()));
        secret
    }
}

fn generate_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        MonitorAgent, MonitorSpec, PgBouncer, PgBouncerSpec, Redis, RedisSpec,
        ServicePortTemplate, ServiceTemplateSpec, LABEL_DATABASE_NAME,
    };
    use k8s_openapi::api::core::v1::PodTemplateSpec;

    fn port(name: &str, number: i32) -> ServicePort {
        ServicePort {
            name: Some(name.to_string()),
            port: number,
            ..Default::default()
        }
    }

    #[test]
    fn unmentioned_ports_survive_merge() {
        let current = vec![port("extra", 7000)];
        let merged = merge_service_ports(&current, &[named_port("api", 5432)]);

        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0], port("extra", 7000));
        assert_eq!(merged[1].name.as_deref(), Some("api"));
        assert_eq!(merged[1].port, 5432);
    }

    #[test]
    fn merge_keeps_assigned_node_port() {
        let mut have = port("db", 6379);
        have.node_port = Some(30123);
        let merged = merge_service_ports(&[have], &[port("db", 6380)]);
        assert_eq!(merged[0].port, 6380);
        assert_eq!(merged[0].node_port, Some(30123));
    }

    #[test]
    fn service_applies_template() {
        let mut redis = Redis::new(
            "cache1",
            RedisSpec {
                version: "7.2.4".to_string(),
                service_template: Some(ServiceTemplate {
                    annotations: None,
                    spec: ServiceTemplateSpec {
                        type_: Some("NodePort".to_string()),
                        ports: vec![ServicePortTemplate {
                            name: "db".to_string(),
                            port: None,
                            node_port: Some(30079),
                        }],
                        ..Default::default()
                    },
                }),
                ..Default::default()
            },
        );
        redis.metadata.namespace = Some("demo".to_string());

        let svc = desired_service(&redis)(Service::default());
        let spec = svc.spec.unwrap();
        assert_eq!(spec.type_.as_deref(), Some("NodePort"));
        let ports = spec.ports.unwrap();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].port, 6379);
        assert_eq!(ports[0].node_port, Some(30079));
        assert_eq!(spec.selector.unwrap()[LABEL_DATABASE_NAME], "cache1");
    }

    #[test]
    fn stateful_set_selector_is_not_rewritten() {
        let redis = Redis::new(
            "cache1",
            RedisSpec {
                version: "7.2.4".to_string(),
                monitor: Some(MonitorSpec {
                    agent: MonitorAgent::PrometheusOperator,
                    prometheus: None,
                }),
                ..Default::default()
            },
        );
        let mut existing = StatefulSet::default();
        let spec = existing.spec.get_or_insert_with(Default::default);
        spec.selector.match_labels = Some(BTreeMap::from([("legacy".to_string(), "x".to_string())]));
        spec.template = PodTemplateSpec::default();

        let sts = desired_stateful_set(&redis)(existing);
        let spec = sts.spec.unwrap();
        assert_eq!(spec.selector.match_labels.unwrap().len(), 1);
        assert_eq!(spec.replicas, Some(1));
        let containers = spec.template.spec.unwrap().containers;
        let names: Vec<_> = containers.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["redis", "exporter"]);
    }

    #[test]
    fn auth_secret_password_is_stable() {
        let pool = PgBouncer::new(
            "pool1",
            PgBouncerSpec {
                version: "1.17.0".to_string(),
                ..Default::default()
            },
        );
        let build = desired_auth_secret(&pool);
        let first = build(Secret::default());
        let second = build(first.clone());
        assert_eq!(first.data, second.data);
        assert_eq!(first.data.unwrap()["password"].0.len(), 16);
    }
}

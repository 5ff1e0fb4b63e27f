//! Scenario-level checks of the reconciliation rules: given realistic
//! source objects, what does the controller decide to write?
use std::collections::BTreeMap;

use k8s_openapi::{
    api::core::v1::{ConfigMap, Service, ServicePort, ServiceSpec},
    apimachinery::pkg::apis::meta::v1::ObjectMeta,
};
use keess::{
    constants::{
        CLUSTERS_KEY, MANAGED_LABEL_KEY, MESH_GLOBAL_KEY, MESH_SHARED_KEY, SOURCE_CLUSTER_KEY,
        SOURCE_NAMESPACE_KEY, SOURCE_RESOURCE_VERSION_KEY, SYNC_LABEL_KEY,
    },
    directive::{self, SyncDirective},
    projection::{self, FanoutTarget},
};

fn string_map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect()
}

fn cluster_scoped_meta(name: &str, namespace: &str, clusters: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_owned()),
        namespace: Some(namespace.to_owned()),
        resource_version: Some("41".to_owned()),
        labels: Some(string_map(&[(SYNC_LABEL_KEY, "cluster")])),
        annotations: Some(string_map(&[(CLUSTERS_KEY, clusters)])),
        ..ObjectMeta::default()
    }
}

// A ConfigMap labeled for cluster scope ends up on the target cluster with
// its data intact, the managed label, and all three tracking annotations.
#[test]
fn cluster_scoped_configmap_projects_to_the_target_cluster() {
    let source = ConfigMap {
        metadata: cluster_scoped_meta("cm1", "ns1", "B"),
        data: Some(string_map(&[("k", "v")])),
        ..ConfigMap::default()
    };

    assert_eq!(
        directive::parse(&source.metadata),
        Ok(SyncDirective::Cluster(vec!["B".to_owned()]))
    );

    let target = FanoutTarget {
        cluster: "B".to_owned(),
        namespace: "ns1".to_owned(),
    };
    let replica = projection::project(&source, "A", &target);

    assert_eq!(replica.data, source.data);
    let labels = replica.metadata.labels.as_ref().expect("labels");
    assert_eq!(labels.get(MANAGED_LABEL_KEY).map(String::as_str), Some("true"));
    assert!(!labels.contains_key(SYNC_LABEL_KEY));

    let annotations = replica.metadata.annotations.as_ref().expect("annotations");
    assert_eq!(annotations.get(SOURCE_CLUSTER_KEY).map(String::as_str), Some("A"));
    assert_eq!(
        annotations.get(SOURCE_NAMESPACE_KEY).map(String::as_str),
        Some("ns1")
    );
    assert_eq!(
        annotations.get(SOURCE_RESOURCE_VERSION_KEY).map(String::as_str),
        Some("41")
    );

    // Immediately after the write nothing is left to do.
    assert!(!projection::has_changed(&source, "A", &replica));
}

// Editing the source bumps its resource version; the stale replica must be
// detected and the fresh projection must record the new version.
#[test]
fn source_update_propagates_through_the_changed_check() {
    let mut source = ConfigMap {
        metadata: cluster_scoped_meta("cm1", "ns1", "B"),
        data: Some(string_map(&[("k", "v")])),
        ..ConfigMap::default()
    };
    let target = FanoutTarget {
        cluster: "B".to_owned(),
        namespace: "ns1".to_owned(),
    };
    let replica = projection::project(&source, "A", &target);

    source.metadata.resource_version = Some("42".to_owned());
    source.data = Some(string_map(&[("k", "v2")]));
    assert!(projection::has_changed(&source, "A", &replica));

    let updated = projection::project(&source, "A", &target);
    assert_eq!(updated.data, source.data);
    assert_eq!(
        updated
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(SOURCE_RESOURCE_VERSION_KEY))
            .map(String::as_str),
        Some("42")
    );
}

// A replicated service keeps its ports but loses everything that ties it to
// the source cluster, and gains the mesh annotations that make the target
// cluster publish a global reference service.
#[test]
fn service_projection_prepares_a_mesh_reference() {
    let source = Service {
        metadata: cluster_scoped_meta("mysql-svc", "svc-ns", "B"),
        spec: Some(ServiceSpec {
            selector: Some(string_map(&[("app", "mysql")])),
            cluster_ip: Some("10.96.0.17".to_owned()),
            cluster_ips: Some(vec!["10.96.0.17".to_owned()]),
            type_: Some("ClusterIP".to_owned()),
            ports: Some(vec![ServicePort {
                port: 3306,
                ..ServicePort::default()
            }]),
            ..ServiceSpec::default()
        }),
        ..Service::default()
    };

    let target = FanoutTarget {
        cluster: "B".to_owned(),
        namespace: "svc-ns".to_owned(),
    };
    let replica = projection::project(&source, "A", &target);

    let spec = replica.spec.as_ref().expect("spec");
    assert_eq!(spec.selector, None);
    assert_eq!(spec.cluster_ip, None);
    assert_eq!(spec.cluster_ips, None);
    assert_eq!(spec.type_.as_deref(), Some("ClusterIP"));
    assert_eq!(spec.ports.as_ref().map(Vec::len), Some(1));

    let annotations = replica.metadata.annotations.as_ref().expect("annotations");
    assert_eq!(annotations.get(MESH_GLOBAL_KEY).map(String::as_str), Some("true"));
    assert_eq!(annotations.get(MESH_SHARED_KEY).map(String::as_str), Some("false"));

    assert!(!projection::has_changed(&source, "A", &replica));
}

// A pre-existing object without the managed label must never be claimed,
// however exactly its name collides with a source.
#[test]
fn unmanaged_destination_objects_are_not_ours() {
    let preexisting = Service {
        metadata: ObjectMeta {
            name: Some("mysql-svc".to_owned()),
            namespace: Some("svc-ns".to_owned()),
            ..ObjectMeta::default()
        },
        spec: Some(ServiceSpec {
            ports: Some(vec![ServicePort {
                port: 3307,
                ..ServicePort::default()
            }]),
            ..ServiceSpec::default()
        }),
        ..Service::default()
    };

    assert!(!projection::is_managed(&preexisting.metadata));
}

//! Pure rules for deriving a destination replica from a source object, and
//! for deciding whether an existing replica still matches its source.
use std::collections::BTreeMap;

use k8s_openapi::{
    api::core::v1::Namespace, apimachinery::pkg::apis::meta::v1::ObjectMeta,
};
use kube::Resource;

use crate::{
    constants::{
        MANAGED_LABEL_KEY, MANAGED_LABEL_VALUE, SOURCE_CLUSTER_KEY, SOURCE_NAMESPACE_KEY,
        SOURCE_RESOURCE_VERSION_KEY,
    },
    directive::NamespaceSpread,
    kinds::SyncedResource,
};

/// One destination of a fan-out. A `(source, target)` pair is the unit of
/// synchronization work.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FanoutTarget {
    pub cluster: String,
    pub namespace: String,
}

/// The label set carried by every replica. The sync label is deliberately
/// not part of it: a replica must never itself become a source.
pub fn managed_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(MANAGED_LABEL_KEY.to_owned(), MANAGED_LABEL_VALUE.to_owned())])
}

/// The back-pointer annotations a replica carries to its source.
pub fn tracking_annotations(
    source_cluster: &str,
    source_namespace: &str,
    resource_version: &str,
) -> BTreeMap<String, String> {
    BTreeMap::from([
        (SOURCE_CLUSTER_KEY.to_owned(), source_cluster.to_owned()),
        (SOURCE_NAMESPACE_KEY.to_owned(), source_namespace.to_owned()),
        (
            SOURCE_RESOURCE_VERSION_KEY.to_owned(),
            resource_version.to_owned(),
        ),
    ])
}

/// Whether an object is a replica owned by this controller. Objects without
/// the managed label are never touched, whatever their name.
pub fn is_managed(meta: &ObjectMeta) -> bool {
    meta.labels
        .as_ref()
        .and_then(|labels| labels.get(MANAGED_LABEL_KEY))
        .is_some_and(|value| value == MANAGED_LABEL_VALUE)
}

/// Projects a source object into the replica to be written at `target`.
///
/// Identity fields assigned by the source API server are cleared, labels
/// and annotations are replaced wholesale, and the kind hook applies any
/// payload rewrite (services lose their local networking).
pub fn project<K: SyncedResource>(source: &K, source_cluster: &str, target: &FanoutTarget) -> K {
    let source_namespace = source.meta().namespace.clone().unwrap_or_default();
    let source_version = source.meta().resource_version.clone().unwrap_or_default();

    let mut replica = source.clone();
    let meta = replica.meta_mut();
    meta.uid = None;
    meta.resource_version = None;
    meta.creation_timestamp = None;
    meta.managed_fields = None;
    meta.owner_references = None;
    meta.namespace = Some(target.namespace.clone());
    meta.labels = Some(managed_labels());
    meta.annotations = Some(tracking_annotations(
        source_cluster,
        &source_namespace,
        &source_version,
    ));

    K::finish_projection(&mut replica);
    replica
}

/// Whether an existing replica no longer reflects its source and must be
/// rewritten.
pub fn has_changed<K: SyncedResource>(source: &K, source_cluster: &str, existing: &K) -> bool {
    let source_namespace = source.meta().namespace.as_deref().unwrap_or_default();
    let source_version = source.meta().resource_version.as_deref().unwrap_or_default();
    let recorded = |key: &str| {
        existing
            .meta()
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(key))
            .map(String::as_str)
    };

    recorded(SOURCE_RESOURCE_VERSION_KEY) != Some(source_version)
        || recorded(SOURCE_CLUSTER_KEY) != Some(source_cluster)
        || recorded(SOURCE_NAMESPACE_KEY) != Some(source_namespace)
        || K::replica_drifted(existing)
}

/// Result of resolving a [`NamespaceSpread`] against a namespace snapshot.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct NamespaceExpansion {
    /// Destination namespaces, source namespace already excluded.
    pub targets: Vec<String>,
    /// Explicitly listed namespaces that are absent from the snapshot.
    pub missing: Vec<String>,
}

/// Resolves the destination namespaces of a namespace-scoped source.
pub fn expand_namespaces(
    spread: &NamespaceSpread,
    source_namespace: &str,
    namespaces: &BTreeMap<String, Namespace>,
) -> NamespaceExpansion {
    match spread {
        NamespaceSpread::All => NamespaceExpansion {
            targets: namespaces
                .keys()
                .filter(|name| *name != source_namespace)
                .cloned()
                .collect(),
            missing: Vec::new(),
        },
        NamespaceSpread::List(names) => {
            let mut expansion = NamespaceExpansion::default();
            for name in names {
                if name == source_namespace {
                    continue;
                }
                if namespaces.contains_key(name) {
                    expansion.targets.push(name.clone());
                } else {
                    expansion.missing.push(name.clone());
                }
            }
            expansion
        }
        NamespaceSpread::Label { key, value } => NamespaceExpansion {
            targets: namespaces
                .iter()
                .filter(|(name, _)| *name != source_namespace)
                .filter(|(_, namespace)| {
                    namespace
                        .metadata
                        .labels
                        .as_ref()
                        .and_then(|labels| labels.get(key))
                        .is_some_and(|found| found == value)
                })
                .map(|(name, _)| name.clone())
                .collect(),
            missing: Vec::new(),
        },
    }
}

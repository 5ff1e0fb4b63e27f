//! Interpretation of the sync label and its companion annotations.
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use snafu::{OptionExt, Snafu, ensure};

use crate::constants::{
    ALL_NAMESPACES, CLUSTERS_KEY, NAMESPACE_LABEL_KEY, NAMESPACES_NAMES_KEY, SYNC_LABEL_KEY,
    SYNC_SCOPE_CLUSTER, SYNC_SCOPE_NAMESPACE,
};

type Result<T, E = Error> = std::result::Result<T, E>;

/// A configuration error on a source object. The object is skipped for this
/// poll cycle; the next cycle observes it again, so no retry state is kept.
#[derive(Debug, PartialEq, Eq, Snafu)]
pub enum Error {
    #[snafu(display("object carries no {SYNC_LABEL_KEY} label"))]
    MissingSyncLabel,

    #[snafu(display("unsupported sync scope {scope:?}"))]
    UnsupportedScope { scope: String },

    #[snafu(display(
        "namespace scope requires a {NAMESPACES_NAMES_KEY} or {NAMESPACE_LABEL_KEY} annotation"
    ))]
    MissingNamespaceTargets,

    #[snafu(display("cluster scope requires a non-empty {CLUSTERS_KEY} annotation"))]
    MissingClusterTargets,

    #[snafu(display("namespace label annotation {value:?} is not of the form key=\"value\""))]
    MalformedLabelSpec { value: String },
}

/// How the destination namespaces of a namespace-scoped source are chosen.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NamespaceSpread {
    /// Every namespace in the cluster except the source namespace.
    All,
    /// An explicit list of namespace names.
    List(Vec<String>),
    /// Namespaces whose label `key` equals `value`.
    Label { key: String, value: String },
}

/// The desired fan-out of one source object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncDirective {
    /// Fan out to namespaces within the source cluster.
    Namespace(NamespaceSpread),
    /// Fan out to remote clusters, keeping the namespace name.
    Cluster(Vec<String>),
}

/// Derives the [`SyncDirective`] from a source object's metadata.
pub fn parse(meta: &ObjectMeta) -> Result<SyncDirective> {
    let scope = meta
        .labels
        .as_ref()
        .and_then(|labels| labels.get(SYNC_LABEL_KEY))
        .context(MissingSyncLabelSnafu)?;
    let annotation = |key: &str| {
        meta.annotations
            .as_ref()
            .and_then(|annotations| annotations.get(key))
    };

    match scope.as_str() {
        SYNC_SCOPE_NAMESPACE => {
            if let Some(names) = annotation(NAMESPACES_NAMES_KEY) {
                if names.trim() == ALL_NAMESPACES {
                    return Ok(SyncDirective::Namespace(NamespaceSpread::All));
                }
                let names = parse_comma_list(names);
                ensure!(!names.is_empty(), MissingNamespaceTargetsSnafu);
                Ok(SyncDirective::Namespace(NamespaceSpread::List(names)))
            } else if let Some(spec) = annotation(NAMESPACE_LABEL_KEY) {
                let (key, value) = parse_label_spec(spec)?;
                Ok(SyncDirective::Namespace(NamespaceSpread::Label { key, value }))
            } else {
                MissingNamespaceTargetsSnafu.fail()
            }
        }
        SYNC_SCOPE_CLUSTER => {
            let clusters = annotation(CLUSTERS_KEY).context(MissingClusterTargetsSnafu)?;
            let clusters = parse_comma_list(clusters);
            ensure!(!clusters.is_empty(), MissingClusterTargetsSnafu);
            Ok(SyncDirective::Cluster(clusters))
        }
        other => UnsupportedScopeSnafu { scope: other }.fail(),
    }
}

/// Splits a comma list into trimmed, non-empty tokens, preserving order.
pub fn parse_comma_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

/// Splits `key="value"` on the first `=`. Double quotes around the value are
/// optional and trimmed.
pub fn parse_label_spec(spec: &str) -> Result<(String, String)> {
    let (key, value) = spec
        .split_once('=')
        .context(MalformedLabelSpecSnafu { value: spec })?;
    let value = value.trim();
    let value = value
        .strip_prefix('"')
        .and_then(|inner| inner.strip_suffix('"'))
        .unwrap_or(value);
    Ok((key.trim().to_owned(), value.to_owned()))
}

//! The label and annotation contract shared with end users.
//!
//! These keys are part of the wire contract: objects are opted into
//! synchronization by labeling them, and replicas are recognized by the
//! labels and annotations written here. None of these values may change
//! without breaking every cluster that already carries them.
use const_format::concatcp;

/// Prefix for every label and annotation owned by this controller.
const KEY_PREFIX: &str = "keess.powerhrg.com/";

/// Opt-in label on source objects. Value selects the scope.
pub const SYNC_LABEL_KEY: &str = concatcp!(KEY_PREFIX, "sync");

/// Label marking destination-side replicas created by this controller.
pub const MANAGED_LABEL_KEY: &str = concatcp!(KEY_PREFIX, "managed");
pub const MANAGED_LABEL_VALUE: &str = "true";

/// `sync` label value for fan-out to namespaces within the same cluster.
pub const SYNC_SCOPE_NAMESPACE: &str = "namespace";
/// `sync` label value for fan-out to remote clusters.
pub const SYNC_SCOPE_CLUSTER: &str = "cluster";

/// Source annotation naming destination namespaces: `"all"` or a comma list.
pub const NAMESPACES_NAMES_KEY: &str = concatcp!(KEY_PREFIX, "namespaces-names");
/// Source annotation selecting destination namespaces by label: `key="value"`.
pub const NAMESPACE_LABEL_KEY: &str = concatcp!(KEY_PREFIX, "namespace-label");
/// Source annotation naming destination clusters as a comma list.
pub const CLUSTERS_KEY: &str = concatcp!(KEY_PREFIX, "clusters");

/// Sentinel value of [`NAMESPACES_NAMES_KEY`] meaning every namespace.
pub const ALL_NAMESPACES: &str = "all";

/// Back-pointer annotations carried by every replica.
pub const SOURCE_CLUSTER_KEY: &str = concatcp!(KEY_PREFIX, "source-cluster");
pub const SOURCE_NAMESPACE_KEY: &str = concatcp!(KEY_PREFIX, "source-namespace");
pub const SOURCE_RESOURCE_VERSION_KEY: &str = concatcp!(KEY_PREFIX, "source-resource-version");

/// Cluster-mesh annotations written onto replicated services so the mesh
/// creates a global reference service instead of sharing local endpoints.
pub const MESH_GLOBAL_KEY: &str = "service.cilium.io/global";
pub const MESH_GLOBAL_VALUE: &str = "true";
pub const MESH_SHARED_KEY: &str = "service.cilium.io/shared";
pub const MESH_SHARED_VALUE: &str = "false";

/// Label selector matching every object opted into synchronization.
pub const SYNC_SELECTOR: &str = SYNC_LABEL_KEY;
/// Label selector matching every replica this controller created.
pub const MANAGED_SELECTOR: &str = concatcp!(MANAGED_LABEL_KEY, "=", MANAGED_LABEL_VALUE);

#[cfg(test)]
mod tests {
    use super::*;

    // The user-facing contract must stay bit-exact.
    #[test]
    fn wire_contract() {
        assert_eq!(SYNC_LABEL_KEY, "keess.powerhrg.com/sync");
        assert_eq!(MANAGED_LABEL_KEY, "keess.powerhrg.com/managed");
        assert_eq!(NAMESPACES_NAMES_KEY, "keess.powerhrg.com/namespaces-names");
        assert_eq!(NAMESPACE_LABEL_KEY, "keess.powerhrg.com/namespace-label");
        assert_eq!(CLUSTERS_KEY, "keess.powerhrg.com/clusters");
        assert_eq!(SOURCE_CLUSTER_KEY, "keess.powerhrg.com/source-cluster");
        assert_eq!(SOURCE_NAMESPACE_KEY, "keess.powerhrg.com/source-namespace");
        assert_eq!(
            SOURCE_RESOURCE_VERSION_KEY,
            "keess.powerhrg.com/source-resource-version"
        );
        assert_eq!(MESH_GLOBAL_KEY, "service.cilium.io/global");
        assert_eq!(MESH_SHARED_KEY, "service.cilium.io/shared");
        assert_eq!(MANAGED_SELECTOR, "keess.powerhrg.com/managed=true");
    }
}

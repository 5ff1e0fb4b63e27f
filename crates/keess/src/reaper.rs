//! The orphan reaper: removes replicas whose source disappeared or lost
//! its sync intent.
//!
//! Every decision errs on the side of keeping the object: a failed source
//! list, a missing source cluster, or a failed interlock check all leave
//! the replica in place until a later housekeeping cycle can decide safely.
use std::sync::Arc;

use kube::{Resource, ResourceExt};
use snafu::{ResultExt, Snafu};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::{
    client::{self, ClusterClient},
    constants::{SOURCE_CLUSTER_KEY, SOURCE_NAMESPACE_KEY, SYNC_SELECTOR},
    kinds::{InterlockError, SyncedResource},
    metrics::{self, SkipReason},
    poller::Observation,
    registry::ClusterRegistry,
};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to list sync candidates in {cluster}/{namespace}"))]
    ListSources {
        source: kube::Error,
        cluster: String,
        namespace: String,
    },

    #[snafu(display("deletion interlock failed for {cluster}/{namespace}/{name}"))]
    Interlock {
        source: InterlockError,
        cluster: String,
        namespace: String,
        name: String,
    },

    #[snafu(display("failed to delete the replica at {cluster}/{namespace}/{name}"))]
    DeleteReplica {
        source: kube::Error,
        cluster: String,
        namespace: String,
        name: String,
    },
}

/// The source coordinates a replica points back to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourcePointer {
    pub cluster: String,
    pub namespace: String,
}

/// Reads the back-pointer annotations off a replica. Returns `None` when
/// either is absent or empty; such an object is malformed and must not be
/// touched.
pub fn source_pointer<K: SyncedResource>(replica: &K) -> Option<SourcePointer> {
    let annotations = replica.meta().annotations.as_ref()?;
    let read = |key: &str| {
        annotations
            .get(key)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
            .map(ToOwned::to_owned)
    };
    Some(SourcePointer {
        cluster: read(SOURCE_CLUSTER_KEY)?,
        namespace: read(SOURCE_NAMESPACE_KEY)?,
    })
}

/// One reaper per kind. Consumes the managed poller's output, which sweeps
/// the local cluster and every live remote.
pub struct Reaper<K> {
    registry: Arc<ClusterRegistry>,
    input: mpsc::Receiver<Observation<K>>,
}

impl<K: SyncedResource> Reaper<K> {
    pub fn new(registry: Arc<ClusterRegistry>, input: mpsc::Receiver<Observation<K>>) -> Self {
        Self { registry, input }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<()>) {
        loop {
            let observation = tokio::select! {
                _ = shutdown.changed() => break,
                observation = self.input.recv() => match observation {
                    Some(observation) => observation,
                    None => break,
                },
            };
            if let Err(err) = self.process(&observation).await {
                metrics::REAPER_ERRORS
                    .with_label_values(&[K::KIND.as_str()])
                    .inc();
                error!(
                    kind = K::KIND.as_str(),
                    cluster = %observation.cluster,
                    error = %err,
                    "housekeeping failed for a replica"
                );
            }
        }
    }

    /// Decides the fate of one observed replica.
    pub async fn process(&self, observation: &Observation<K>) -> Result<()> {
        let kind = K::KIND;
        let replica = &observation.object;
        let name = replica.name_any();
        let namespace = replica.namespace().unwrap_or_default();

        let Some(source) = source_pointer(replica) else {
            warn!(
                kind = kind.as_str(),
                cluster = %observation.cluster,
                namespace = %namespace,
                name = %name,
                "replica is missing its source annotations, leaving it alone"
            );
            metrics::record_skip(kind, SkipReason::MalformedTracking);
            return Ok(());
        };

        // Without credentials for the source cluster the orphan status is
        // undecidable; keep the replica.
        let Some(source_client) = self.registry.get(&source.cluster) else {
            debug!(
                kind = kind.as_str(),
                cluster = %observation.cluster,
                source_cluster = %source.cluster,
                name = %name,
                "source cluster is not registered, skipping orphan check"
            );
            return Ok(());
        };

        // A failed list means we cannot prove the source is gone; assume it
        // is not.
        let candidates = source_client
            .list_labeled::<K>(Some(&source.namespace), SYNC_SELECTOR)
            .await
            .context(ListSourcesSnafu {
                cluster: &source.cluster,
                namespace: &source.namespace,
            })?;
        if candidates
            .iter()
            .any(|candidate| candidate.name_any() == name)
        {
            return Ok(());
        }

        metrics::ORPHANS_DETECTED
            .with_label_values(&[kind.as_str()])
            .inc();
        info!(
            kind = kind.as_str(),
            cluster = %observation.cluster,
            namespace = %namespace,
            name = %name,
            source_cluster = %source.cluster,
            source_namespace = %source.namespace,
            "replica no longer has a sync candidate source"
        );

        // The replica lives on the cluster we observed it on; that client
        // can only be missing if a credentials reload raced us.
        let Some(cluster_client) = self.registry.get(&observation.cluster) else {
            debug!(
                kind = kind.as_str(),
                cluster = %observation.cluster,
                "cluster disappeared from the registry mid-cycle, retrying next cycle"
            );
            return Ok(());
        };

        if replica
            .deletion_blocked(&cluster_client)
            .await
            .context(InterlockSnafu {
                cluster: &observation.cluster,
                namespace: &namespace,
                name: &name,
            })?
        {
            info!(
                kind = kind.as_str(),
                cluster = %observation.cluster,
                namespace = %namespace,
                name = %name,
                "orphaned replica still serves local endpoints, keeping it"
            );
            return Ok(());
        }

        self.delete(&cluster_client, &observation.cluster, &namespace, &name)
            .await
    }

    async fn delete(
        &self,
        cluster_client: &ClusterClient,
        cluster: &str,
        namespace: &str,
        name: &str,
    ) -> Result<()> {
        match cluster_client.delete::<K>(name, namespace).await {
            Ok(()) => {
                metrics::ORPHANS_REMOVED
                    .with_label_values(&[K::KIND.as_str()])
                    .inc();
                info!(
                    kind = K::KIND.as_str(),
                    cluster = %cluster,
                    namespace = %namespace,
                    name = %name,
                    "removed orphaned replica"
                );
                Ok(())
            }
            // Someone else already deleted it; that is the outcome we want.
            Err(err) if client::is_not_found(&err) => Ok(()),
            Err(err) => Err(err).context(DeleteReplicaSnafu {
                cluster,
                namespace,
                name,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::{
        api::core::v1::ConfigMap, apimachinery::pkg::apis::meta::v1::ObjectMeta,
    };
    use rstest::rstest;

    use super::*;
    use crate::projection::tracking_annotations;

    fn replica_with_annotations(annotations: Option<BTreeMap<String, String>>) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some("cm1".to_owned()),
                namespace: Some("ns1".to_owned()),
                annotations,
                ..ObjectMeta::default()
            },
            ..ConfigMap::default()
        }
    }

    #[test]
    fn well_formed_pointer_is_read() {
        let replica = replica_with_annotations(Some(tracking_annotations("a", "ns1", "41")));
        assert_eq!(
            source_pointer(&replica),
            Some(SourcePointer {
                cluster: "a".to_owned(),
                namespace: "ns1".to_owned(),
            })
        );
    }

    #[rstest]
    #[case::no_annotations(None)]
    #[case::empty_map(Some(BTreeMap::new()))]
    #[case::empty_cluster(Some(BTreeMap::from([
        (SOURCE_CLUSTER_KEY.to_owned(), String::new()),
        (SOURCE_NAMESPACE_KEY.to_owned(), "ns1".to_owned()),
    ])))]
    #[case::missing_namespace(Some(BTreeMap::from([
        (SOURCE_CLUSTER_KEY.to_owned(), "a".to_owned()),
    ])))]
    fn malformed_pointers_are_rejected(#[case] annotations: Option<BTreeMap<String, String>>) {
        let replica = replica_with_annotations(annotations);
        assert_eq!(source_pointer(&replica), None);
    }
}

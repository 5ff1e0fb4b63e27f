//! The synchronizer: turns one source object into idempotent upserts
//! against every destination its sync directive names.
use std::sync::Arc;

use k8s_openapi::{
    api::core::v1::Namespace, apimachinery::pkg::apis::meta::v1::ObjectMeta,
};
use kube::{Resource, ResourceExt};
use snafu::{ResultExt, Snafu};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::{
    client::{self, ClusterClient},
    directive::{self, SyncDirective},
    kinds::SyncedResource,
    metrics::{self, SkipReason},
    namespaces::NamespaceCache,
    poller::Observation,
    projection::{self, FanoutTarget},
    registry::ClusterRegistry,
};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to fetch the current object at {cluster}/{namespace}/{name}"))]
    FetchExisting {
        source: kube::Error,
        cluster: String,
        namespace: String,
        name: String,
    },

    #[snafu(display("failed to create the replica at {cluster}/{namespace}/{name}"))]
    CreateReplica {
        source: kube::Error,
        cluster: String,
        namespace: String,
        name: String,
    },

    #[snafu(display("failed to update the replica at {cluster}/{namespace}/{name}"))]
    UpdateReplica {
        source: kube::Error,
        cluster: String,
        namespace: String,
        name: String,
    },

    #[snafu(display("failed to look up namespace {namespace:?} on cluster {cluster}"))]
    FetchNamespace {
        source: kube::Error,
        cluster: String,
        namespace: String,
    },

    #[snafu(display("failed to create namespace {namespace:?} on cluster {cluster}"))]
    BootstrapNamespace {
        source: kube::Error,
        cluster: String,
        namespace: String,
    },
}

/// One logical synchronizer per kind. Consumes the sync poller's output and
/// writes replicas to every fan-out target.
pub struct Synchronizer<K> {
    registry: Arc<ClusterRegistry>,
    namespaces: Arc<NamespaceCache>,
    input: mpsc::Receiver<Observation<K>>,
}

impl<K: SyncedResource> Synchronizer<K> {
    pub fn new(
        registry: Arc<ClusterRegistry>,
        namespaces: Arc<NamespaceCache>,
        input: mpsc::Receiver<Observation<K>>,
    ) -> Self {
        Self {
            registry,
            namespaces,
            input,
        }
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
            self.process(observation.object).await;
        }
    }

    /// Synchronizes one source object to all its targets. Each target is
    /// independent: a failed write is logged and counted but does not abort
    /// the rest of the batch.
    pub async fn process(&self, source: K) {
        let kind = K::KIND;
        let name = source.name_any();
        let source_namespace = source.namespace().unwrap_or_default();

        let directive = match directive::parse(source.meta()) {
            Ok(directive) => directive,
            Err(err) => {
                warn!(
                    kind = kind.as_str(),
                    namespace = %source_namespace,
                    name = %name,
                    error = %err,
                    "skipping object with an invalid sync configuration"
                );
                metrics::record_skip(kind, SkipReason::Configuration);
                return;
            }
        };

        if matches!(directive, SyncDirective::Namespace(_)) && !K::supports_namespace_scope() {
            warn!(
                kind = kind.as_str(),
                namespace = %source_namespace,
                name = %name,
                "kind only participates in cluster scope, skipping"
            );
            metrics::record_skip(kind, SkipReason::Configuration);
            return;
        }
        if matches!(directive, SyncDirective::Cluster(_)) {
            if let Some(reason) = source.cluster_scope_rejection() {
                error!(
                    kind = kind.as_str(),
                    namespace = %source_namespace,
                    name = %name,
                    reason = %reason,
                    "object is not eligible for cluster fan-out, skipping"
                );
                metrics::record_skip(kind, SkipReason::Configuration);
                return;
            }
        }

        for (client, target) in self.expand(&directive, &source_namespace) {
            if let Err(err) = self.sync_to(&source, &client, &target).await {
                metrics::SYNC_ERRORS.with_label_values(&[kind.as_str()]).inc();
                error!(
                    kind = kind.as_str(),
                    cluster = %target.cluster,
                    namespace = %target.namespace,
                    name = %name,
                    error = %err,
                    "failed to synchronize target"
                );
            }
        }
    }

    /// Expands a directive into concrete destinations, excluding the source
    /// itself and anything that cannot currently be resolved.
    fn expand(
        &self,
        directive: &SyncDirective,
        source_namespace: &str,
    ) -> Vec<(Arc<ClusterClient>, FanoutTarget)> {
        let kind = K::KIND;
        match directive {
            SyncDirective::Namespace(spread) => {
                let snapshot = self.namespaces.snapshot();
                let expansion =
                    projection::expand_namespaces(spread, source_namespace, &snapshot);
                for missing in &expansion.missing {
                    warn!(
                        kind = kind.as_str(),
                        namespace = %missing,
                        "destination namespace does not exist, skipping"
                    );
                    metrics::record_skip(kind, SkipReason::MissingNamespace);
                }
                let local = self.registry.local();
                expansion
                    .targets
                    .into_iter()
                    .map(|namespace| {
                        let target = FanoutTarget {
                            cluster: local.name().to_owned(),
                            namespace,
                        };
                        (Arc::clone(&local), target)
                    })
                    .collect()
            }
            SyncDirective::Cluster(clusters) => clusters
                .iter()
                .filter(|cluster| cluster.as_str() != self.registry.local_name())
                .filter_map(|cluster| match self.registry.get(cluster) {
                    Some(client) => {
                        let target = FanoutTarget {
                            cluster: cluster.clone(),
                            namespace: source_namespace.to_owned(),
                        };
                        Some((client, target))
                    }
                    None => {
                        warn!(
                            kind = kind.as_str(),
                            cluster = %cluster,
                            "destination cluster is not registered, skipping"
                        );
                        metrics::record_skip(kind, SkipReason::MissingCluster);
                        None
                    }
                })
                .collect(),
        }
    }

    /// Idempotent upsert of one source at one target.
    async fn sync_to(
        &self,
        source: &K,
        client: &ClusterClient,
        target: &FanoutTarget,
    ) -> Result<()> {
        let source_cluster = self.registry.local_name();
        let name = source.name_any();

        if K::bootstraps_namespace() && target.cluster != source_cluster {
            self.ensure_namespace(client, source, target).await?;
        }

        let projected = projection::project(source, source_cluster, target);
        let existing = client
            .get_opt::<K>(&name, &target.namespace)
            .await
            .context(FetchExistingSnafu {
                cluster: &target.cluster,
                namespace: &target.namespace,
                name: &name,
            })?;

        match existing {
            None => match client.create(&projected).await {
                Ok(_) => {
                    info!(
                        kind = K::KIND.as_str(),
                        cluster = %target.cluster,
                        namespace = %target.namespace,
                        name = %name,
                        "created replica"
                    );
                    metrics::SYNC_OPERATIONS
                        .with_label_values(&[K::KIND.as_str(), "create"])
                        .inc();
                    Ok(())
                }
                Err(err) if client::is_already_exists(&err) => {
                    // Lost a create race, re-read and continue as an update.
                    debug!(
                        kind = K::KIND.as_str(),
                        cluster = %target.cluster,
                        namespace = %target.namespace,
                        name = %name,
                        "create raced an existing object, retrying as update"
                    );
                    let existing = client
                        .get_opt::<K>(&name, &target.namespace)
                        .await
                        .context(FetchExistingSnafu {
                            cluster: &target.cluster,
                            namespace: &target.namespace,
                            name: &name,
                        })?;
                    match existing {
                        Some(existing) => {
                            self.update_existing(client, source, existing, projected, target)
                                .await
                        }
                        // Deleted again in between; the next cycle settles it.
                        None => Ok(()),
                    }
                }
                Err(err) => Err(err).context(CreateReplicaSnafu {
                    cluster: &target.cluster,
                    namespace: &target.namespace,
                    name: &name,
                }),
            },
            Some(existing) => {
                self.update_existing(client, source, existing, projected, target)
                    .await
            }
        }
    }

    /// Updates an existing destination object, unless it is unmanaged or
    /// already reflects the source.
    async fn update_existing(
        &self,
        client: &ClusterClient,
        source: &K,
        existing: K,
        mut projected: K,
        target: &FanoutTarget,
    ) -> Result<()> {
        let kind = K::KIND;
        let name = source.name_any();

        if !projection::is_managed(existing.meta()) {
            warn!(
                kind = kind.as_str(),
                cluster = %target.cluster,
                namespace = %target.namespace,
                name = %name,
                "destination object exists but is not managed, leaving it alone"
            );
            metrics::record_skip(kind, SkipReason::UnmanagedConflict);
            return Ok(());
        }
        if !projection::has_changed(source, self.registry.local_name(), &existing) {
            debug!(
                kind = kind.as_str(),
                cluster = %target.cluster,
                namespace = %target.namespace,
                name = %name,
                "replica is up to date"
            );
            return Ok(());
        }

        projected.meta_mut().resource_version = existing.meta().resource_version.clone();
        client
            .replace(&projected)
            .await
            .context(UpdateReplicaSnafu {
                cluster: &target.cluster,
                namespace: &target.namespace,
                name: &name,
            })?;
        info!(
            kind = kind.as_str(),
            cluster = %target.cluster,
            namespace = %target.namespace,
            name = %name,
            "updated replica"
        );
        metrics::SYNC_OPERATIONS
            .with_label_values(&[kind.as_str(), "update"])
            .inc();
        Ok(())
    }

    /// Creates the destination namespace for a service fan-out when it is
    /// absent. Data kinds do not get this treatment: their destination
    /// namespaces are user-managed, and a missing one surfaces as a write
    /// error on the replica itself.
    async fn ensure_namespace(
        &self,
        client: &ClusterClient,
        source: &K,
        target: &FanoutTarget,
    ) -> Result<()> {
        let present = client
            .get_namespace_opt(&target.namespace)
            .await
            .context(FetchNamespaceSnafu {
                cluster: &target.cluster,
                namespace: &target.namespace,
            })?;
        if present.is_some() {
            return Ok(());
        }

        let source_namespace = source.namespace().unwrap_or_default();
        let source_version = source.resource_version().unwrap_or_default();
        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(target.namespace.clone()),
                labels: Some(projection::managed_labels()),
                annotations: Some(projection::tracking_annotations(
                    self.registry.local_name(),
                    &source_namespace,
                    &source_version,
                )),
                ..ObjectMeta::default()
            },
            ..Namespace::default()
        };
        match client.create_namespace(&namespace).await {
            Ok(_) => {
                info!(
                    cluster = %target.cluster,
                    namespace = %target.namespace,
                    "created destination namespace"
                );
                Ok(())
            }
            Err(err) if client::is_already_exists(&err) => Ok(()),
            Err(err) => Err(err).context(BootstrapNamespaceSnafu {
                cluster: &target.cluster,
                namespace: &target.namespace,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashMap};

    use k8s_openapi::api::core::v1::{ConfigMap, Service, ServiceSpec};
    use kube::{Client, Config};

    use super::*;
    use crate::{
        constants::{CLUSTERS_KEY, NAMESPACES_NAMES_KEY, SYNC_LABEL_KEY},
        directive::NamespaceSpread,
        metrics::SYNC_SKIPS,
    };

    fn offline_client(name: &str) -> ClusterClient {
        let config = Config::new("http://127.0.0.1:8001".parse().expect("static url parses"));
        ClusterClient::new(name, Client::try_from(config).expect("offline client builds"))
    }

    fn synchronizer<K: SyncedResource>(
        remotes: &[&str],
    ) -> (Synchronizer<K>, mpsc::Sender<Observation<K>>) {
        let registry = Arc::new(ClusterRegistry::new(offline_client("a")));
        registry.replace_remotes(
            remotes
                .iter()
                .map(|name| ((*name).to_owned(), Arc::new(offline_client(name))))
                .collect::<HashMap<_, _>>(),
        );
        let (tx, rx) = mpsc::channel(1);
        let synchronizer = Synchronizer::new(registry, Arc::new(NamespaceCache::default()), rx);
        (synchronizer, tx)
    }

    #[tokio::test]
    async fn cluster_expansion_skips_self_and_unregistered() {
        let (synchronizer, _tx) = synchronizer::<ConfigMap>(&["b"]);
        let directive = SyncDirective::Cluster(vec![
            "a".to_owned(),
            "b".to_owned(),
            "ghost".to_owned(),
        ]);
        let targets = synchronizer.expand(&directive, "ns1");
        let resolved: Vec<_> = targets
            .iter()
            .map(|(client, target)| (client.name(), target.namespace.as_str()))
            .collect();
        assert_eq!(resolved, vec![("b", "ns1")]);
    }

    #[tokio::test]
    async fn namespace_expansion_targets_the_local_cluster() {
        let (synchronizer, _tx) = synchronizer::<ConfigMap>(&[]);
        let mut snapshot = BTreeMap::new();
        for name in ["ns1", "ns2", "ns3"] {
            snapshot.insert(
                name.to_owned(),
                k8s_openapi::api::core::v1::Namespace::default(),
            );
        }
        synchronizer.namespaces.replace(snapshot);

        let directive = SyncDirective::Namespace(NamespaceSpread::All);
        let targets = synchronizer.expand(&directive, "ns1");
        let resolved: Vec<_> = targets
            .iter()
            .map(|(client, target)| (client.name(), target.namespace.as_str()))
            .collect();
        assert_eq!(resolved, vec![("a", "ns2"), ("a", "ns3")]);
    }

    fn skips(reason: &str) -> u64 {
        SYNC_SKIPS.with_label_values(&["Service", reason]).get()
    }

    #[tokio::test]
    async fn namespace_scoped_service_is_a_configuration_error() {
        let (synchronizer, _tx) = synchronizer::<Service>(&[]);
        let service = Service {
            metadata: ObjectMeta {
                name: Some("svc".to_owned()),
                namespace: Some("ns1".to_owned()),
                labels: Some(BTreeMap::from([(
                    SYNC_LABEL_KEY.to_owned(),
                    "namespace".to_owned(),
                )])),
                annotations: Some(BTreeMap::from([(
                    NAMESPACES_NAMES_KEY.to_owned(),
                    "all".to_owned(),
                )])),
                ..ObjectMeta::default()
            },
            ..Service::default()
        };

        let before = skips("configuration");
        synchronizer.process(service).await;
        assert!(skips("configuration") >= before + 1);
    }

    #[tokio::test]
    async fn node_port_service_cannot_fan_out() {
        let (synchronizer, _tx) = synchronizer::<Service>(&[]);
        let service = Service {
            metadata: ObjectMeta {
                name: Some("svc".to_owned()),
                namespace: Some("ns1".to_owned()),
                labels: Some(BTreeMap::from([(
                    SYNC_LABEL_KEY.to_owned(),
                    "cluster".to_owned(),
                )])),
                annotations: Some(BTreeMap::from([(
                    CLUSTERS_KEY.to_owned(),
                    "b".to_owned(),
                )])),
                ..ObjectMeta::default()
            },
            spec: Some(ServiceSpec {
                type_: Some("NodePort".to_owned()),
                ..ServiceSpec::default()
            }),
            ..Service::default()
        };

        let before = skips("configuration");
        synchronizer.process(service).await;
        assert!(skips("configuration") >= before + 1);
    }
}

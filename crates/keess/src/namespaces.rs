//! Periodically refreshed snapshot of the local cluster's namespaces.
//!
//! The synchronizer needs the namespace list (with labels) to resolve
//! namespace-scoped sync directives. Namespace churn is much slower than
//! resource churn, so the refresh interval is configured independently of
//! the resource polling interval.
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use k8s_openapi::api::core::v1::Namespace;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::{client::ClusterClient, metrics};

/// A mutex-guarded, atomically replaced namespace snapshot.
///
/// Readers take the current snapshot pointer under the lock; a read that
/// straddles a refresh simply sees the previous snapshot, which the next
/// sync cycle corrects.
#[derive(Default)]
pub struct NamespaceCache {
    snapshot: Mutex<Arc<BTreeMap<String, Namespace>>>,
}

impl NamespaceCache {
    /// The most recent snapshot. Empty until the first refresh succeeds.
    pub fn snapshot(&self) -> Arc<BTreeMap<String, Namespace>> {
        Arc::clone(&self.snapshot.lock().expect("namespace cache mutex poisoned"))
    }

    pub(crate) fn replace(&self, namespaces: BTreeMap<String, Namespace>) {
        *self.snapshot.lock().expect("namespace cache mutex poisoned") = Arc::new(namespaces);
    }

    /// Refresh loop. The first refresh runs immediately, subsequent ones
    /// every `interval`. A failed LIST keeps the previous snapshot.
    pub async fn run(
        self: Arc<Self>,
        client: Arc<ClusterClient>,
        interval: Duration,
        mut shutdown: watch::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }
            match client.list_namespaces().await {
                Ok(namespaces) => {
                    let snapshot: BTreeMap<_, _> = namespaces
                        .into_iter()
                        .filter_map(|namespace| {
                            namespace
                                .metadata
                                .name
                                .clone()
                                .map(|name| (name, namespace))
                        })
                        .collect();
                    debug!(
                        cluster = client.name(),
                        namespaces = snapshot.len(),
                        "refreshed namespace snapshot"
                    );
                    self.replace(snapshot);
                }
                Err(err) => {
                    metrics::NAMESPACE_REFRESH_ERRORS.inc();
                    warn!(
                        cluster = client.name(),
                        error = %err,
                        "namespace list failed, keeping the previous snapshot"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::*;

    fn named(name: &str) -> Namespace {
        Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                ..ObjectMeta::default()
            },
            ..Namespace::default()
        }
    }

    #[test]
    fn snapshot_is_replaced_wholesale() {
        let cache = NamespaceCache::default();
        assert!(cache.snapshot().is_empty());

        cache.replace(BTreeMap::from([("ns1".to_owned(), named("ns1"))]));
        let before = cache.snapshot();
        assert!(before.contains_key("ns1"));

        cache.replace(BTreeMap::from([("ns2".to_owned(), named("ns2"))]));
        // The old pointer still reads the old state; fresh reads see the new.
        assert!(before.contains_key("ns1"));
        assert!(cache.snapshot().contains_key("ns2"));
        assert!(!cache.snapshot().contains_key("ns1"));
    }
}

//! Worker supervision and process wiring.
//!
//! The supervisor owns the fixed set of long-lived worker tasks: one
//! credentials watcher, one namespace cache, and four workers per enabled
//! resource kind (sync poller, synchronizer, managed poller, reaper).
//! Workers never exit on transient API errors; an exit is visible on the
//! worker gauges so operators can alert on it.
use std::sync::Arc;

use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service};
use kube::Client;
use snafu::{ResultExt, Snafu};
use tokio::{
    signal::unix::{SignalKind, signal},
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{error, info};

use crate::{
    cli::Settings,
    client::ClusterClient,
    http,
    kinds::SyncedResource,
    metrics,
    namespaces::NamespaceCache,
    poller::{PollScope, Poller, WatchedSelector},
    reaper::Reaper,
    registry::{ClusterRegistry, CredentialsWatcher},
    sync::Synchronizer,
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to construct the local cluster client"))]
    LocalClient { source: kube::Error },

    #[snafu(display("failed to install the termination signal handler"))]
    Signal { source: std::io::Error },
}

/// Spawns and tracks long-lived worker tasks, and fans the shutdown signal
/// out to all of them.
pub struct Supervisor {
    shutdown: watch::Sender<()>,
    workers: Vec<(String, JoinHandle<()>)>,
}

impl Supervisor {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(());
        Self {
            shutdown,
            workers: Vec::new(),
        }
    }

    /// A shutdown handle for a worker about to be spawned.
    pub fn subscribe(&self) -> watch::Receiver<()> {
        self.shutdown.subscribe()
    }

    /// Spawns a named worker. The task accounts itself on the worker gauges
    /// on entry and exit.
    pub fn spawn<F>(&mut self, task: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let name = task.to_owned();
        let handle = tokio::spawn(async move {
            metrics::WORKERS_ACTIVE.with_label_values(&[name.as_str()]).inc();
            future.await;
            metrics::WORKERS_ACTIVE.with_label_values(&[name.as_str()]).dec();
            metrics::WORKERS_INACTIVE.with_label_values(&[name.as_str()]).inc();
            info!(task = %name, "worker exited");
        });
        self.workers.push((task.to_owned(), handle));
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn begin_shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Awaits every worker. Panicked workers are reported, not propagated.
    pub async fn join(self) {
        for (task, handle) in self.workers {
            if let Err(err) = handle.await {
                error!(task = %task, error = %err, "worker did not shut down cleanly");
            }
        }
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

/// The fixed worker-set size: the credentials watcher, the namespace cache,
/// and four workers per enabled kind.
pub fn expected_worker_count(enabled_kinds: usize) -> usize {
    2 + enabled_kinds * 4
}

/// Builds all components and runs them until SIGTERM or SIGINT.
pub async fn run(settings: Settings) -> Result<(), Error> {
    info!(local_cluster = %settings.local_cluster, "starting keess");
    let client = Client::try_default().await.context(LocalClientSnafu)?;
    let registry = Arc::new(ClusterRegistry::new(ClusterClient::new(
        settings.local_cluster.clone(),
        client,
    )));
    let namespaces = Arc::new(NamespaceCache::default());

    let mut supervisor = Supervisor::new();

    let shutdown = supervisor.subscribe();
    let watcher = CredentialsWatcher::new(Arc::clone(&registry), settings.kube_config_path.clone());
    supervisor.spawn("credentials-watcher", watcher.run(shutdown));

    let shutdown = supervisor.subscribe();
    let cache = Arc::clone(&namespaces);
    let local = registry.local();
    let interval = settings.namespace_polling_interval();
    supervisor.spawn(
        "namespace-cache",
        async move { cache.run(local, interval, shutdown).await },
    );

    spawn_kind::<ConfigMap>(&mut supervisor, &settings, &registry, &namespaces);
    spawn_kind::<Secret>(&mut supervisor, &settings, &registry, &namespaces);
    let enabled_kinds = if settings.enable_service_sync {
        spawn_kind::<Service>(&mut supervisor, &settings, &registry, &namespaces);
        3
    } else {
        info!("service synchronization is disabled");
        2
    };

    let expected = expected_worker_count(enabled_kinds);
    if supervisor.worker_count() != expected {
        error!(
            expected,
            actual = supervisor.worker_count(),
            "unexpected worker count at startup"
        );
    }
    debug_assert_eq!(supervisor.worker_count(), expected);

    let shutdown = supervisor.subscribe();
    let address = settings.bind_address;
    supervisor.spawn("http-server", async move {
        if let Err(err) = http::serve(address, shutdown).await {
            error!(error = %err, "health and metrics server exited");
        }
    });

    wait_for_termination().await?;
    info!("shutdown signal received, stopping workers");
    supervisor.begin_shutdown();
    supervisor.join().await;
    Ok(())
}

/// Wires the four workers of one resource kind together. The channels have
/// capacity one so a slow consumer naturally slows its poller.
fn spawn_kind<K: SyncedResource>(
    supervisor: &mut Supervisor,
    settings: &Settings,
    registry: &Arc<ClusterRegistry>,
    namespaces: &Arc<NamespaceCache>,
) {
    let task = K::KIND.as_str().to_ascii_lowercase();

    let (sync_tx, sync_rx) = mpsc::channel(1);
    let shutdown = supervisor.subscribe();
    let poller = Poller::<K>::new(
        PollScope::Local(registry.local()),
        WatchedSelector::Sync,
        settings.polling_interval(),
        sync_tx,
    );
    supervisor.spawn(&format!("{task}-sync-poller"), poller.run(shutdown));

    let shutdown = supervisor.subscribe();
    let synchronizer = Synchronizer::new(Arc::clone(registry), Arc::clone(namespaces), sync_rx);
    supervisor.spawn(&format!("{task}-synchronizer"), synchronizer.run(shutdown));

    let (managed_tx, managed_rx) = mpsc::channel(1);
    let shutdown = supervisor.subscribe();
    let poller = Poller::<K>::new(
        PollScope::AllClusters(Arc::clone(registry)),
        WatchedSelector::Managed,
        settings.housekeeping_interval(),
        managed_tx,
    );
    supervisor.spawn(&format!("{task}-managed-poller"), poller.run(shutdown));

    let shutdown = supervisor.subscribe();
    let reaper = Reaper::<K>::new(Arc::clone(registry), managed_rx);
    supervisor.spawn(&format!("{task}-reaper"), reaper.run(shutdown));
}

async fn wait_for_termination() -> Result<(), Error> {
    let mut sigterm = signal(SignalKind::terminate()).context(SignalSnafu)?;
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = tokio::signal::ctrl_c() => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_count_accounting() {
        assert_eq!(expected_worker_count(2), 10);
        assert_eq!(expected_worker_count(3), 14);
    }

    #[tokio::test]
    async fn workers_record_their_exit() {
        let mut supervisor = Supervisor::new();
        supervisor.spawn("test-noop-worker", async {});
        assert_eq!(supervisor.worker_count(), 1);
        supervisor.join().await;

        let inactive = metrics::WORKERS_INACTIVE
            .with_label_values(&["test-noop-worker"])
            .get();
        assert!(inactive >= 1);
    }

    #[tokio::test]
    async fn shutdown_reaches_every_worker() {
        let mut supervisor = Supervisor::new();
        for task in ["test-shutdown-a", "test-shutdown-b"] {
            let mut shutdown = supervisor.subscribe();
            supervisor.spawn(task, async move {
                let _ = shutdown.changed().await;
            });
        }
        supervisor.begin_shutdown();
        supervisor.join().await;
    }
}

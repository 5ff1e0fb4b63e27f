//! The dynamic remote-cluster registry.
//!
//! A credentials file on disk (a standard multi-context kubeconfig) defines
//! the set of remote clusters. [`CredentialsWatcher`] watches that file,
//! debounces editor save patterns, and rebuilds the remote client map when
//! the file content actually changes. [`ClusterRegistry`] is the shared view
//! consumers query; the local cluster client lives in a dedicated slot so it
//! is always present, while remote entries come and go with the file.
use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use kube::{
    Client, Config,
    config::{KubeConfigOptions, Kubeconfig},
};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use sha2::{Digest, Sha256};
use snafu::{ResultExt, Snafu};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::{client::ClusterClient, metrics};

/// Quiet period after a filesystem event before a reload is attempted.
/// Editors emit several events per save; only the last one within the
/// window triggers work.
const DEBOUNCE: Duration = Duration::from_millis(500);

/// Wait between checks while the credentials file is absent.
const FILE_RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// How many times to check for the credentials file before giving up.
const FILE_RETRY_BUDGET: u32 = 150;

/// Request timeout on remote clients. Remote clusters are probed on every
/// reload and polled often, so a hung endpoint must fail fast.
const REMOTE_REQUEST_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to load context {context:?} from the credentials file"))]
    LoadContext {
        source: kube::config::KubeconfigError,
        context: String,
    },

    #[snafu(display("failed to construct a client for context {context:?}"))]
    BuildClient { source: kube::Error, context: String },
}

/// The live `cluster name → client` mapping.
///
/// The remote map object is created once and only ever mutated in place, so
/// a reference obtained before a credentials reload stays valid afterwards
/// (its contents may differ).
pub struct ClusterRegistry {
    local: Arc<ClusterClient>,
    remotes: Mutex<HashMap<String, Arc<ClusterClient>>>,
}

impl ClusterRegistry {
    pub fn new(local: ClusterClient) -> Self {
        Self {
            local: Arc::new(local),
            remotes: Mutex::new(HashMap::new()),
        }
    }

    /// The client for the cluster this process runs in. Always present.
    pub fn local(&self) -> Arc<ClusterClient> {
        Arc::clone(&self.local)
    }

    pub fn local_name(&self) -> &str {
        self.local.name()
    }

    /// Looks up the client for a cluster name, local or remote.
    pub fn get(&self, cluster: &str) -> Option<Arc<ClusterClient>> {
        if cluster == self.local.name() {
            return Some(self.local());
        }
        self.lock_remotes().get(cluster).cloned()
    }

    /// The local client followed by every live remote client, in a stable
    /// order.
    pub fn clients(&self) -> Vec<Arc<ClusterClient>> {
        let mut clients = vec![self.local()];
        let mut remotes: Vec<_> = self.lock_remotes().values().cloned().collect();
        remotes.sort_by(|a, b| a.name().cmp(b.name()));
        clients.extend(remotes);
        clients
    }

    /// Replaces the remote entries wholesale, keeping the map identity.
    pub(crate) fn replace_remotes(&self, remotes: HashMap<String, Arc<ClusterClient>>) {
        let mut guard = self.lock_remotes();
        guard.clear();
        guard.extend(remotes);
    }

    fn lock_remotes(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<ClusterClient>>> {
        self.remotes.lock().expect("cluster registry mutex poisoned")
    }
}

/// Long-lived task keeping a [`ClusterRegistry`] in step with the
/// credentials file.
pub struct CredentialsWatcher {
    registry: Arc<ClusterRegistry>,
    path: PathBuf,
    last_digest: Option<[u8; 32]>,
}

impl CredentialsWatcher {
    pub fn new(registry: Arc<ClusterRegistry>, path: PathBuf) -> Self {
        Self {
            registry,
            path,
            last_digest: None,
        }
    }

    /// Runs until shutdown, the retry budget is exhausted, or the watcher
    /// cannot be (re)installed. All per-cluster errors are non-fatal; the
    /// watcher never exits because of a bad credentials entry.
    pub async fn run(mut self, mut shutdown: watch::Receiver<()>) {
        if !self.await_file(&mut shutdown).await {
            info!("stopping credentials watcher, the remote set stays empty");
            return;
        }

        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let mut watcher = match notify::recommended_watcher(
            move |event: Result<Event, notify::Error>| {
                let _ = event_tx.send(event);
            },
        ) {
            Ok(watcher) => watcher,
            Err(err) => {
                error!(error = %err, "failed to create the filesystem watcher");
                return;
            }
        };
        if let Err(err) = watcher.watch(&self.path, RecursiveMode::NonRecursive) {
            error!(path = %self.path.display(), error = %err, "failed to watch the credentials file");
            return;
        }

        self.reload().await;

        loop {
            let event = tokio::select! {
                _ = shutdown.changed() => break,
                event = event_rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            let relevant = match event {
                Ok(event) => matches!(
                    event.kind,
                    EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                ),
                Err(err) => {
                    warn!(error = %err, "filesystem watcher reported an error");
                    false
                }
            };
            if !relevant {
                continue;
            }

            if !self.debounce(&mut event_rx, &mut shutdown).await {
                break;
            }

            if self.path.exists() {
                self.reload().await;
                continue;
            }

            // The file is gone. Drop the stale watch, wait for the file to
            // come back, then watch and load it again.
            info!(path = %self.path.display(), "credentials file was removed, awaiting recreation");
            let _ = watcher.unwatch(&self.path);
            if !self.await_file(&mut shutdown).await {
                warn!("credentials file was not recreated, stopping the watcher");
                return;
            }
            if let Err(err) = watcher.watch(&self.path, RecursiveMode::NonRecursive) {
                error!(path = %self.path.display(), error = %err, "failed to re-watch the credentials file");
                return;
            }
            self.reload().await;
        }
        // Dropping the watcher releases the OS watch handles.
    }

    /// Waits for the quiet period, restarting it while events keep coming.
    /// Returns false on shutdown.
    async fn debounce(
        &self,
        events: &mut mpsc::UnboundedReceiver<Result<Event, notify::Error>>,
        shutdown: &mut watch::Receiver<()>,
    ) -> bool {
        loop {
            tokio::select! {
                _ = shutdown.changed() => return false,
                _ = tokio::time::sleep(DEBOUNCE) => return true,
                event = events.recv() => match event {
                    Some(_) => continue,
                    None => return true,
                },
            }
        }
    }

    /// Polls for the credentials file within the bounded retry budget.
    /// Returns false if it never appears or shutdown was requested.
    async fn await_file(&self, shutdown: &mut watch::Receiver<()>) -> bool {
        for attempt in 1..=FILE_RETRY_BUDGET {
            match tokio::fs::try_exists(&self.path).await {
                Ok(true) => return true,
                Ok(false) => {
                    debug!(path = %self.path.display(), attempt, "credentials file not present yet");
                }
                Err(err) => {
                    warn!(path = %self.path.display(), error = %err, "failed to check the credentials file");
                }
            }
            tokio::select! {
                _ = shutdown.changed() => return false,
                _ = tokio::time::sleep(FILE_RETRY_INTERVAL) => {}
            }
        }
        warn!(
            path = %self.path.display(),
            "credentials file did not appear within the retry budget"
        );
        false
    }

    /// Rebuilds the remote client map from the credentials file, unless its
    /// content hash matches the previous load.
    async fn reload(&mut self) {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "failed to read the credentials file");
                return;
            }
        };
        let digest: [u8; 32] = Sha256::digest(&bytes).into();
        if self.last_digest == Some(digest) {
            debug!("credentials file content is unchanged, skipping reload");
            return;
        }

        let text = String::from_utf8_lossy(&bytes);
        let kubeconfig = match Kubeconfig::from_yaml(&text) {
            Ok(kubeconfig) => kubeconfig,
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "failed to parse the credentials file");
                return;
            }
        };
        metrics::CREDENTIALS_RELOADS.inc();

        let mut remotes = HashMap::new();
        for context in &kubeconfig.contexts {
            let name = context.name.clone();
            if name == self.registry.local_name() {
                debug!(cluster = %name, "credentials file names the local cluster, skipping");
                continue;
            }
            let client = match build_cluster_client(&kubeconfig, &name).await {
                Ok(client) => client,
                Err(err) => {
                    warn!(cluster = %name, error = %err, "failed to build remote client");
                    metrics::REMOTE_INIT_FAILED.with_label_values(&[name.as_str()]).set(1);
                    continue;
                }
            };
            // Probe before publishing so consumers only ever see clusters
            // that answered at least once.
            match client.server_version().await {
                Ok(version) => {
                    debug!(cluster = %name, version = %version.git_version, "remote cluster is reachable");
                    metrics::REMOTE_INIT_FAILED.with_label_values(&[name.as_str()]).set(0);
                    remotes.insert(name, Arc::new(client));
                }
                Err(err) => {
                    warn!(cluster = %name, error = %err, "remote cluster probe failed");
                    metrics::REMOTE_INIT_FAILED.with_label_values(&[name.as_str()]).set(1);
                }
            }
        }

        info!(remotes = remotes.len(), "loaded remote cluster credentials");
        self.registry.replace_remotes(remotes);
        self.last_digest = Some(digest);
    }
}

/// Builds a [`ClusterClient`] for one named context of the credentials file,
/// with short request timeouts.
async fn build_cluster_client(kubeconfig: &Kubeconfig, context: &str) -> Result<ClusterClient, Error> {
    let options = KubeConfigOptions {
        context: Some(context.to_owned()),
        ..KubeConfigOptions::default()
    };
    let mut config = Config::from_custom_kubeconfig(kubeconfig.clone(), &options)
        .await
        .context(LoadContextSnafu { context })?;
    config.connect_timeout = Some(REMOTE_REQUEST_TIMEOUT);
    config.read_timeout = Some(REMOTE_REQUEST_TIMEOUT);

    let client = Client::try_from(config).context(BuildClientSnafu { context })?;
    Ok(ClusterClient::new(context, client))
}

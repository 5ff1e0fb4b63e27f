//! Periodic LIST loops feeding the synchronizer and the reaper.
//!
//! A poller repeatedly lists one kind under one label selector and emits
//! every item, tagged with the cluster it came from, on its output channel.
//! The channel has capacity one: a slow consumer slows the poller down,
//! which bounds in-flight work to one item per worker.
use std::{sync::Arc, time::Duration};

use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::{
    client::ClusterClient,
    constants::{MANAGED_SELECTOR, SYNC_SELECTOR},
    kinds::SyncedResource,
    metrics,
    registry::ClusterRegistry,
};

/// One item observed by a poller.
#[derive(Clone, Debug)]
pub struct Observation<K> {
    /// Name of the cluster the object was listed on.
    pub cluster: String,
    pub object: K,
}

/// Which label selector a poller lists under.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchedSelector {
    /// Source objects opted into synchronization.
    Sync,
    /// Destination replicas created by this controller.
    Managed,
}

impl WatchedSelector {
    pub const fn query(self) -> &'static str {
        match self {
            Self::Sync => SYNC_SELECTOR,
            Self::Managed => MANAGED_SELECTOR,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Managed => "managed",
        }
    }
}

/// The set of clusters one poller sweeps each tick.
pub enum PollScope {
    /// Only the local cluster; sources are only ever read from there.
    Local(Arc<ClusterClient>),
    /// The local cluster plus every live remote, re-resolved per tick so
    /// the sweep follows credential reloads.
    AllClusters(Arc<ClusterRegistry>),
}

impl PollScope {
    fn clients(&self) -> Vec<Arc<ClusterClient>> {
        match self {
            Self::Local(client) => vec![Arc::clone(client)],
            Self::AllClusters(registry) => registry.clients(),
        }
    }
}

pub struct Poller<K> {
    scope: PollScope,
    selector: WatchedSelector,
    interval: Duration,
    output: mpsc::Sender<Observation<K>>,
}

impl<K: SyncedResource> Poller<K> {
    pub fn new(
        scope: PollScope,
        selector: WatchedSelector,
        interval: Duration,
        output: mpsc::Sender<Observation<K>>,
    ) -> Self {
        Self {
            scope,
            selector,
            interval,
            output,
        }
    }

    /// Runs until shutdown. The first iteration lists immediately; each
    /// subsequent one waits the poll interval. A failed LIST is logged and
    /// counted, and the loop carries on with the next tick.
    pub async fn run(self, mut shutdown: watch::Receiver<()>) {
        let kind = K::KIND;
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }

            for client in self.scope.clients() {
                let items = match client
                    .list_labeled::<K>(None, self.selector.query())
                    .await
                {
                    Ok(items) => items,
                    Err(err) => {
                        metrics::POLL_ERRORS
                            .with_label_values(&[kind.as_str(), client.name()])
                            .inc();
                        warn!(
                            kind = kind.as_str(),
                            cluster = client.name(),
                            selector = self.selector.as_str(),
                            error = %err,
                            "resource list failed"
                        );
                        continue;
                    }
                };
                metrics::VISIBLE_RESOURCES
                    .with_label_values(&[kind.as_str(), self.selector.as_str(), client.name()])
                    .set(items.len() as i64);

                for object in items {
                    let observation = Observation {
                        cluster: client.name().to_owned(),
                        object,
                    };
                    tokio::select! {
                        _ = shutdown.changed() => return,
                        sent = self.output.send(observation) => {
                            if sent.is_err() {
                                debug!(kind = kind.as_str(), "output channel closed, stopping poller");
                                return;
                            }
                        }
                    }
                }
            }
        }
        // Returning drops the sender, which closes the channel for the
        // consumer.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_queries() {
        assert_eq!(WatchedSelector::Sync.query(), "keess.powerhrg.com/sync");
        assert_eq!(
            WatchedSelector::Managed.query(),
            "keess.powerhrg.com/managed=true"
        );
    }
}

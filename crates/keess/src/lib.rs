//! keess keeps labeled `ConfigMap`, `Secret` and `Service` objects
//! synchronized from a source cluster into other namespaces and clusters.
//!
//! Users opt resources in declaratively: a `keess.powerhrg.com/sync` label
//! selects the scope, companion annotations name the destinations, and the
//! controller projects each source into managed replicas, keeps them up to
//! date, and reaps them when the source disappears. Reconciliation is
//! periodic and idempotent; there is no long-lived watch state to repair.
pub mod cli;
pub mod client;
pub mod constants;
pub mod directive;
pub mod http;
pub mod kinds;
pub mod logging;
pub mod metrics;
pub mod namespaces;
pub mod poller;
pub mod projection;
pub mod reaper;
pub mod registry;
pub mod supervisor;
pub mod sync;

// Re-export the Kubernetes crates so downstream users match our versions.
pub use k8s_openapi;
pub use kube;

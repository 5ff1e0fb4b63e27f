//! The three managed resource kinds and their behavioral differences.
//!
//! The synchronizer and the reaper are generic over [`SyncedResource`]; the
//! handful of documented asymmetries between `ConfigMap`, `Secret` and
//! `Service` live here as trait methods instead of inline kind branching.
use std::{collections::BTreeMap, net::IpAddr};

use async_trait::async_trait;
use ipnet::IpNet;
use k8s_openapi::{
    NamespaceResourceScope,
    api::core::v1::{ConfigMap, Endpoints, Node, Secret, Service, ServiceSpec},
};
use kube::{Resource, ResourceExt};
use serde::{Serialize, de::DeserializeOwned};
use snafu::{ResultExt, Snafu};
use strum::Display;

use crate::{
    client::ClusterClient,
    constants::{MESH_GLOBAL_KEY, MESH_GLOBAL_VALUE, MESH_SHARED_KEY, MESH_SHARED_VALUE},
};

/// Kinds this controller is willing to synchronize.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum ManagedKind {
    ConfigMap,
    Secret,
    Service,
}

impl ManagedKind {
    /// Stable name used for metric labels and log fields.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ConfigMap => "ConfigMap",
            Self::Secret => "Secret",
            Self::Service => "Service",
        }
    }
}

#[derive(Debug, Snafu)]
pub enum InterlockError {
    #[snafu(display("failed to fetch endpoints for service {namespace}/{name}"))]
    FetchEndpoints {
        source: kube::Error,
        namespace: String,
        name: String,
    },

    #[snafu(display("failed to list nodes"))]
    ListNodes { source: kube::Error },

    #[snafu(display("node reports invalid pod CIDR {cidr:?}"))]
    InvalidPodCidr {
        source: ipnet::AddrParseError,
        cidr: String,
    },
}

/// Kind-dispatched behavior of a synchronized resource.
///
/// Default implementations describe the data kinds (`ConfigMap`, `Secret`);
/// `Service` overrides every hook.
#[async_trait]
pub trait SyncedResource:
    Resource<Scope = NamespaceResourceScope, DynamicType = ()>
    + Clone
    + DeserializeOwned
    + Serialize
    + std::fmt::Debug
    + Send
    + Sync
    + Sized
    + 'static
{
    const KIND: ManagedKind;

    /// Whether this kind may be spread to other namespaces in the same
    /// cluster. Services carry cluster topology and only fan out to clusters.
    fn supports_namespace_scope() -> bool {
        true
    }

    /// Whether the destination namespace is created on the remote cluster
    /// when it does not exist. Data kinds expect the namespace to be there.
    fn bootstraps_namespace() -> bool {
        false
    }

    /// Returns the reason this particular object must not fan out to other
    /// clusters, if any.
    fn cluster_scope_rejection(&self) -> Option<String> {
        None
    }

    /// Kind-specific rewrite applied to a freshly projected replica, after
    /// the common metadata handling.
    fn finish_projection(_replica: &mut Self) {}

    /// Kind-specific drift checks on an existing replica, on top of the
    /// tracking-annotation comparison.
    fn replica_drifted(_existing: &Self) -> bool {
        false
    }

    /// Deletion interlock consulted by the reaper before it removes an
    /// orphaned replica from `cluster`.
    async fn deletion_blocked(&self, _cluster: &ClusterClient) -> Result<bool, InterlockError> {
        Ok(false)
    }
}

#[async_trait]
impl SyncedResource for ConfigMap {
    const KIND: ManagedKind = ManagedKind::ConfigMap;
}

#[async_trait]
impl SyncedResource for Secret {
    const KIND: ManagedKind = ManagedKind::Secret;
}

#[async_trait]
impl SyncedResource for Service {
    const KIND: ManagedKind = ManagedKind::Service;

    fn supports_namespace_scope() -> bool {
        false
    }

    fn bootstraps_namespace() -> bool {
        true
    }

    fn cluster_scope_rejection(&self) -> Option<String> {
        // An absent type defaults to ClusterIP on the API server.
        match self.spec.as_ref().and_then(|spec| spec.type_.as_deref()) {
            None | Some("ClusterIP") => None,
            Some(other) => Some(format!("only ClusterIP services can fan out, found {other}")),
        }
    }

    fn finish_projection(replica: &mut Self) {
        let spec = replica.spec.get_or_insert_with(ServiceSpec::default);
        spec.selector = None;
        spec.cluster_ip = None;
        spec.cluster_ips = None;
        spec.type_ = Some("ClusterIP".to_owned());

        let annotations = replica.metadata.annotations.get_or_insert_with(BTreeMap::new);
        annotations.insert(MESH_GLOBAL_KEY.to_owned(), MESH_GLOBAL_VALUE.to_owned());
        annotations.insert(MESH_SHARED_KEY.to_owned(), MESH_SHARED_VALUE.to_owned());
    }

    fn replica_drifted(existing: &Self) -> bool {
        let recorded = |key: &str| {
            existing
                .metadata
                .annotations
                .as_ref()
                .and_then(|annotations| annotations.get(key))
                .map(String::as_str)
        };
        recorded(MESH_GLOBAL_KEY) != Some(MESH_GLOBAL_VALUE)
            || recorded(MESH_SHARED_KEY) != Some(MESH_SHARED_VALUE)
    }

    async fn deletion_blocked(&self, cluster: &ClusterClient) -> Result<bool, InterlockError> {
        has_local_endpoints(self, cluster).await
    }
}

/// Whether the cluster this service lives on serves it locally.
///
/// A non-empty selector means the cluster intends to back the service with
/// its own pods. Without one, the endpoint addresses are checked against the
/// union of the cluster's node pod CIDR ranges.
async fn has_local_endpoints(
    service: &Service,
    cluster: &ClusterClient,
) -> Result<bool, InterlockError> {
    let selector = service.spec.as_ref().and_then(|spec| spec.selector.as_ref());
    if selector.is_some_and(|selector| !selector.is_empty()) {
        return Ok(true);
    }

    let name = service.name_any();
    let namespace = service.namespace().unwrap_or_default();
    let endpoints: Option<Endpoints> = cluster
        .get_opt(&name, &namespace)
        .await
        .context(FetchEndpointsSnafu {
            namespace: &namespace,
            name: &name,
        })?;
    let Some(endpoints) = endpoints else {
        return Ok(false);
    };

    let nodes = cluster.list_nodes().await.context(ListNodesSnafu)?;
    let cidrs = pod_cidrs(&nodes)?;

    Ok(endpoint_addresses(&endpoints).any(|address| address_is_local(address, &cidrs)))
}

/// Union of `spec.podCIDR` and `spec.podCIDRs` over all nodes.
fn pod_cidrs(nodes: &[Node]) -> Result<Vec<IpNet>, InterlockError> {
    let mut cidrs = Vec::new();
    for node in nodes {
        let Some(spec) = &node.spec else { continue };
        for cidr in spec.pod_cidr.iter().chain(spec.pod_cidrs.iter().flatten()) {
            let net = cidr
                .parse::<IpNet>()
                .context(InvalidPodCidrSnafu { cidr })?;
            if !cidrs.contains(&net) {
                cidrs.push(net);
            }
        }
    }
    Ok(cidrs)
}

/// Every endpoint address, ready and not-ready alike.
fn endpoint_addresses(endpoints: &Endpoints) -> impl Iterator<Item = &str> {
    endpoints
        .subsets
        .iter()
        .flatten()
        .flat_map(|subset| {
            subset
                .addresses
                .iter()
                .flatten()
                .chain(subset.not_ready_addresses.iter().flatten())
        })
        .map(|address| address.ip.as_str())
}

/// An address that does not parse as an IP is treated as not local.
fn address_is_local(address: &str, cidrs: &[IpNet]) -> bool {
    match address.parse::<IpAddr>() {
        Ok(ip) => cidrs.iter().any(|net| net.contains(&ip)),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{EndpointAddress, EndpointSubset, NodeSpec};
    use rstest::rstest;

    use super::*;

    fn service_of_type(type_: Option<&str>) -> Service {
        Service {
            spec: Some(ServiceSpec {
                type_: type_.map(ToOwned::to_owned),
                ..ServiceSpec::default()
            }),
            ..Service::default()
        }
    }

    #[rstest]
    #[case::explicit_cluster_ip(Some("ClusterIP"), true)]
    #[case::defaulted(None, true)]
    #[case::node_port(Some("NodePort"), false)]
    #[case::load_balancer(Some("LoadBalancer"), false)]
    fn only_cluster_ip_services_fan_out(#[case] type_: Option<&str>, #[case] eligible: bool) {
        let service = service_of_type(type_);
        assert_eq!(service.cluster_scope_rejection().is_none(), eligible);
    }

    #[test]
    fn service_projection_strips_local_networking() {
        let mut replica = Service {
            spec: Some(ServiceSpec {
                selector: Some(BTreeMap::from([("app".to_owned(), "mysql".to_owned())])),
                cluster_ip: Some("10.96.0.17".to_owned()),
                cluster_ips: Some(vec!["10.96.0.17".to_owned()]),
                type_: Some("ClusterIP".to_owned()),
                ..ServiceSpec::default()
            }),
            ..Service::default()
        };

        Service::finish_projection(&mut replica);

        let spec = replica.spec.expect("spec must survive projection");
        assert_eq!(spec.selector, None);
        assert_eq!(spec.cluster_ip, None);
        assert_eq!(spec.cluster_ips, None);
        assert_eq!(spec.type_.as_deref(), Some("ClusterIP"));

        let annotations = replica.metadata.annotations.expect("mesh annotations");
        assert_eq!(annotations.get(MESH_GLOBAL_KEY).map(String::as_str), Some("true"));
        assert_eq!(annotations.get(MESH_SHARED_KEY).map(String::as_str), Some("false"));
    }

    #[test]
    fn missing_mesh_annotations_count_as_drift() {
        let mut replica = Service::default();
        assert!(Service::replica_drifted(&replica));

        Service::finish_projection(&mut replica);
        assert!(!Service::replica_drifted(&replica));

        replica
            .metadata
            .annotations
            .as_mut()
            .expect("annotations were just written")
            .insert(MESH_SHARED_KEY.to_owned(), "true".to_owned());
        assert!(Service::replica_drifted(&replica));
    }

    fn node_with_cidrs(pod_cidr: Option<&str>, pod_cidrs: &[&str]) -> Node {
        Node {
            spec: Some(NodeSpec {
                pod_cidr: pod_cidr.map(ToOwned::to_owned),
                pod_cidrs: if pod_cidrs.is_empty() {
                    None
                } else {
                    Some(pod_cidrs.iter().map(|c| (*c).to_owned()).collect())
                },
                ..NodeSpec::default()
            }),
            ..Node::default()
        }
    }

    #[test]
    fn pod_cidrs_unions_and_dedups() {
        let nodes = vec![
            node_with_cidrs(Some("10.244.0.0/24"), &["10.244.0.0/24", "fd00::/64"]),
            node_with_cidrs(Some("10.244.1.0/24"), &[]),
            node_with_cidrs(None, &[]),
        ];
        let cidrs = pod_cidrs(&nodes).expect("all entries are valid");
        assert_eq!(cidrs.len(), 3);
    }

    #[test]
    fn invalid_pod_cidr_is_an_error() {
        let nodes = vec![node_with_cidrs(Some("not-a-cidr"), &[])];
        assert!(pod_cidrs(&nodes).is_err());
    }

    fn endpoints(ready: &[&str], not_ready: &[&str]) -> Endpoints {
        let to_addresses = |ips: &[&str]| {
            let addresses: Vec<_> = ips
                .iter()
                .map(|ip| EndpointAddress {
                    ip: (*ip).to_owned(),
                    ..EndpointAddress::default()
                })
                .collect();
            (!addresses.is_empty()).then_some(addresses)
        };
        Endpoints {
            subsets: Some(vec![EndpointSubset {
                addresses: to_addresses(ready),
                not_ready_addresses: to_addresses(not_ready),
                ..EndpointSubset::default()
            }]),
            ..Endpoints::default()
        }
    }

    #[test]
    fn not_ready_addresses_still_count_as_local() {
        let cidrs = vec!["10.244.0.0/16".parse::<IpNet>().expect("valid cidr")];
        let endpoints = endpoints(&[], &["10.244.3.7"]);
        assert!(endpoint_addresses(&endpoints).any(|a| address_is_local(a, &cidrs)));
    }

    #[rstest]
    #[case::inside("10.244.3.7", true)]
    #[case::outside("192.168.1.1", false)]
    #[case::garbage("not-an-ip", false)]
    fn address_locality(#[case] address: &str, #[case] local: bool) {
        let cidrs = vec!["10.244.0.0/16".parse::<IpNet>().expect("valid cidr")];
        assert_eq!(address_is_local(address, &cidrs), local);
    }
}

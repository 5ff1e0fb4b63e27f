//! A thin, cluster-name-aware wrapper around [`kube::Client`].
//!
//! Every component talks to the Kubernetes API through a [`ClusterClient`]
//! so that log lines and metrics can always say *which* cluster an operation
//! ran against. The wrapper provides the handful of verbs the reconciliation
//! engine needs and nothing else.
use k8s_openapi::{
    NamespaceResourceScope,
    api::core::v1::{Namespace, Node},
    apimachinery::pkg::version::Info,
};
use kube::{
    Api, Client, Resource,
    api::{DeleteParams, ListParams, PostParams},
};
use serde::{Serialize, de::DeserializeOwned};

/// A typed handle bound to one Kubernetes API endpoint plus the
/// human-readable name of the cluster it serves.
///
/// Instances are owned by the cluster registry and shared by reference;
/// consumers must never cache one across registry reloads.
#[derive(Clone)]
pub struct ClusterClient {
    name: String,
    client: Client,
}

impl ClusterClient {
    pub fn new(name: impl Into<String>, client: Client) -> Self {
        Self {
            name: name.into(),
            client,
        }
    }

    /// The cluster name this client is bound to.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Fetches a namespaced object, mapping NotFound to `None`.
    pub async fn get_opt<K>(&self, name: &str, namespace: &str) -> Result<Option<K>, kube::Error>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + std::fmt::Debug,
    {
        self.api(namespace).get_opt(name).await
    }

    /// Lists objects matching a label selector, in one namespace or across
    /// all of them. Items are returned in the order the API server listed
    /// them.
    pub async fn list_labeled<K>(
        &self,
        namespace: Option<&str>,
        selector: &str,
    ) -> Result<Vec<K>, kube::Error>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + std::fmt::Debug,
    {
        let api: Api<K> = match namespace {
            Some(namespace) => self.api(namespace),
            None => Api::all(self.client.clone()),
        };
        let params = ListParams::default().labels(selector);
        Ok(api.list(&params).await?.items)
    }

    /// Creates a namespaced object in the namespace recorded in its metadata.
    pub async fn create<K>(&self, resource: &K) -> Result<K, kube::Error>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Serialize
            + std::fmt::Debug,
    {
        let namespace = resource.meta().namespace.clone().unwrap_or_default();
        self.api(&namespace)
            .create(&PostParams::default(), resource)
            .await
    }

    /// Replaces a namespaced object. The resource must carry the
    /// `resourceVersion` of the object it replaces.
    pub async fn replace<K>(&self, resource: &K) -> Result<K, kube::Error>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Serialize
            + std::fmt::Debug,
    {
        let namespace = resource.meta().namespace.clone().unwrap_or_default();
        let name = resource.meta().name.clone().unwrap_or_default();
        self.api(&namespace)
            .replace(&name, &PostParams::default(), resource)
            .await
    }

    pub async fn delete<K>(&self, name: &str, namespace: &str) -> Result<(), kube::Error>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + std::fmt::Debug,
    {
        self.api::<K>(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
    }

    pub async fn get_namespace_opt(&self, name: &str) -> Result<Option<Namespace>, kube::Error> {
        Api::all(self.client.clone()).get_opt(name).await
    }

    pub async fn create_namespace(&self, namespace: &Namespace) -> Result<Namespace, kube::Error> {
        Api::all(self.client.clone())
            .create(&PostParams::default(), namespace)
            .await
    }

    pub async fn list_namespaces(&self) -> Result<Vec<Namespace>, kube::Error> {
        Ok(Api::<Namespace>::all(self.client.clone())
            .list(&ListParams::default())
            .await?
            .items)
    }

    pub async fn list_nodes(&self) -> Result<Vec<Node>, kube::Error> {
        Ok(Api::<Node>::all(self.client.clone())
            .list(&ListParams::default())
            .await?
            .items)
    }

    /// Cheap reachability probe, used before a freshly built remote client
    /// is published to consumers.
    pub async fn server_version(&self) -> Result<Info, kube::Error> {
        self.client.apiserver_version().await
    }
}

/// Returns true if the error is the API server saying the object does not
/// exist. Expected during create races and reaper operation.
pub fn is_not_found(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(response) if response.code == 404)
}

/// Returns true if the error is the API server rejecting a create because
/// the object already exists. Expected when two poll cycles race.
pub fn is_already_exists(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(response) if response.reason == "AlreadyExists")
}

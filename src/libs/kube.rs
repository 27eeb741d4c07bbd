//! The narrow view of the Kubernetes API the autoscaler needs
//!
//! The scaler core only ever lists nodes/pods, patches a node, evicts a pod,
//! or deletes a node object; everything else stays behind this trait so the
//! tests can swap in a recording cluster.

use k8s_openapi::api::core::v1::{Node, Pod};

use super::errors::Error;

mod nodes;
mod pods;

pub use nodes::Nodes;
pub use pods::Pods;

/// The methods required to observe and nudge the target cluster
#[async_trait::async_trait]
pub trait ClusterView: Send + Sync {
    /// List all nodes in the cluster
    async fn list_nodes(&self) -> Result<Vec<Node>, Error>;

    /// List all pods across all namespaces
    async fn list_pods(&self) -> Result<Vec<Pod>, Error>;

    /// Apply a strategic merge patch to a node
    ///
    /// # Arguments
    ///
    /// * `name` - The name of the node to patch
    /// * `patch` - The merge patch to apply
    async fn patch_node(&self, name: &str, patch: serde_json::Value) -> Result<(), Error>;

    /// Evict a pod through the eviction subresource
    ///
    /// # Arguments
    ///
    /// * `namespace` - The namespace of the pod to evict
    /// * `name` - The name of the pod to evict
    async fn evict_pod(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Delete a node object from the cluster
    ///
    /// # Arguments
    ///
    /// * `name` - The name of the node to delete
    async fn delete_node(&self, name: &str) -> Result<(), Error>;
}

/// The production cluster view backed by the k8s api
pub struct KubeCluster {
    /// Wrapper for node commands in k8s
    nodes: Nodes,
    /// Wrapper for pod commands in k8s
    pods: Pods,
}

impl KubeCluster {
    /// Build a cluster view from a kubeconfig path or the in-cluster
    /// service account when no path is given
    ///
    /// # Arguments
    ///
    /// * `kubeconfig` - An optional path to a kubeconfig file
    pub async fn new(kubeconfig: Option<&str>) -> Result<Self, Error> {
        // build the right kube config for this environment
        let config = match kubeconfig {
            Some(path) => {
                // load the kubeconfig from the given path
                let kubeconfig = kube::config::Kubeconfig::read_from(path)?;
                kube::Config::from_custom_kubeconfig(
                    kubeconfig,
                    &kube::config::KubeConfigOptions::default(),
                )
                .await?
            }
            None => kube::Config::infer().await?,
        };
        // build a client from this config
        let client = kube::Client::try_from(config)?;
        Ok(KubeCluster {
            nodes: Nodes::new(&client),
            pods: Pods::new(&client),
        })
    }
}

#[async_trait::async_trait]
impl ClusterView for KubeCluster {
    /// List all nodes in the cluster
    async fn list_nodes(&self) -> Result<Vec<Node>, Error> {
        self.nodes.list().await
    }

    /// List all pods across all namespaces
    async fn list_pods(&self) -> Result<Vec<Pod>, Error> {
        self.pods.list_all().await
    }

    /// Apply a strategic merge patch to a node
    async fn patch_node(&self, name: &str, patch: serde_json::Value) -> Result<(), Error> {
        self.nodes.patch(name, patch).await
    }

    /// Evict a pod through the eviction subresource
    async fn evict_pod(&self, namespace: &str, name: &str) -> Result<(), Error> {
        self.pods.evict(namespace, name).await
    }

    /// Delete a node object from the cluster
    async fn delete_node(&self, name: &str) -> Result<(), Error> {
        self.nodes.delete(name).await
    }
}

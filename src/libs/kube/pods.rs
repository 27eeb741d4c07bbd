use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, EvictParams, ListParams};
use tracing::instrument;

use crate::libs::errors::Error;

/// Pods api wrapper for kubernetes
pub struct Pods {
    /// Client to use for creating namespaced clients
    client: kube::Client,
    /// Pod API client for all namespaces
    api: Api<Pod>,
}

impl Pods {
    /// Creates new pods wrapper
    ///
    /// # Arguments
    ///
    /// * `client` - Kubernetes client
    pub fn new(client: &kube::Client) -> Self {
        // build pods api client
        let api: Api<Pod> = Api::all(client.clone());
        Pods {
            client: client.clone(),
            api,
        }
    }

    /// List all pods across all namespaces
    #[instrument(name = "k8s::Pods::list_all", skip(self), err(Debug))]
    pub async fn list_all(&self) -> Result<Vec<Pod>, Error> {
        // list all pods
        let pods = self.api.list(&ListParams::default()).await?;
        Ok(pods.items)
    }

    /// Evict a pod through the eviction subresource
    ///
    /// # Arguments
    ///
    /// * `namespace` - The namespace of the pod to evict
    /// * `name` - The name of the pod to evict
    #[instrument(name = "k8s::Pods::evict", skip(self), err(Debug))]
    pub async fn evict(&self, namespace: &str, name: &str) -> Result<(), Error> {
        // evictions go through a namespaced client
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        api.evict(name, &EvictParams::default()).await?;
        Ok(())
    }
}

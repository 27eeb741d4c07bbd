use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use tracing::instrument;

use crate::libs::errors::Error;

/// Wrapper for node api routes in k8s
pub struct Nodes {
    /// API client for node commands in k8s
    api: Api<Node>,
}

impl Nodes {
    /// Build new wrapper for k8s functions regarding nodes
    ///
    /// # Arguments
    ///
    /// * `client` - Kubernetes client
    pub fn new(client: &kube::Client) -> Self {
        // get node api
        let api: Api<Node> = Api::all(client.clone());
        Nodes { api }
    }

    /// List all nodes in this cluster
    #[instrument(name = "k8s::Nodes::list", skip(self), err(Debug))]
    pub async fn list(&self) -> Result<Vec<Node>, Error> {
        // get list of all nodes
        let nodes = self.api.list(&ListParams::default()).await?;
        Ok(nodes.items)
    }

    /// Apply a merge patch to a node
    ///
    /// # Arguments
    ///
    /// * `node` - The name of the node to patch
    /// * `patch` - The merge patch to apply
    #[instrument(name = "k8s::Nodes::patch", skip(self, patch), err(Debug))]
    pub async fn patch(&self, node: &str, patch: serde_json::Value) -> Result<(), Error> {
        // cast serde value to a merge patch
        let patch = Patch::Merge(&patch);
        // build patch params
        let params = PatchParams {
            field_manager: Some("acs-engine-autoscaler".to_owned()),
            ..Default::default()
        };
        // patch this node
        self.api.patch(node, &params, &patch).await?;
        Ok(())
    }

    /// Delete a node object
    ///
    /// # Arguments
    ///
    /// * `node` - The name of the node to delete
    #[instrument(name = "k8s::Nodes::delete", skip(self), err(Debug))]
    pub async fn delete(&self, node: &str) -> Result<(), Error> {
        self.api.delete(node, &DeleteParams::default()).await?;
        Ok(())
    }
}

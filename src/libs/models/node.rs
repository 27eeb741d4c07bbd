use k8s_openapi::api::core::v1::Node;
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{event, Level};

use crate::libs::errors::Error;
use crate::libs::kube::ClusterView;
use crate::libs::notify::Notifier;
use crate::libs::resources::{parse_quantity, Resource};

use super::pod::KubePod;

/// The label marking a cordon as placed by the autoscaler
///
/// Only nodes carrying this label are ever uncordoned so an operator placed
/// cordon is never undone by the scaler.
pub const CORDON_LABEL: &str = "autoscaler/cordoned-by-autoscaler";

/// The node label holding the cloud instance type
const INSTANCE_TYPE_LABEL: &str = "beta.kubernetes.io/instance-type";

/// The pool name reserved for master nodes
const MASTER_POOL: &str = "master";

/// The identity encoded in an acs-engine node name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    /// The agent pool this node belongs to
    pub pool: String,
    /// The cluster id segment of the name
    pub cluster_id: String,
    /// The index of this node within its pool
    pub index: u64,
}

impl NodeIdentity {
    /// Whether this identity names a master node
    pub fn is_master(&self) -> bool {
        self.pool == MASTER_POOL
    }

    /// Whether this identity names an agent node
    pub fn is_agent(&self) -> bool {
        !self.is_master()
    }
}

/// Parse an acs-engine node name of the form `k8s-<pool>-<clusterId>-<index>`
///
/// # Arguments
///
/// * `name` - The node name to parse
pub fn parse_node_name(name: &str) -> Result<NodeIdentity, Error> {
    let parts = name.split('-').collect::<Vec<&str>>();
    // exactly four hyphen separated segments with a numeric index
    if parts.len() != 4 {
        return Err(Error::MalformedNodeName(name.to_owned()));
    }
    let index = parts[3]
        .parse::<u64>()
        .map_err(|_| Error::MalformedNodeName(name.to_owned()))?;
    Ok(NodeIdentity {
        pool: parts[1].to_owned(),
        cluster_id: parts[2].to_owned(),
        index,
    })
}

/// A node as seen by the autoscaler
#[derive(Debug, Clone)]
pub struct KubeNode {
    /// The name of this node
    pub name: String,
    /// The agent pool this node belongs to
    pub pool_name: String,
    /// The index of this node within its pool
    pub index: u64,
    /// The cloud instance type backing this node
    pub instance_type: Option<String>,
    /// The labels on this node
    pub labels: BTreeMap<String, String>,
    /// The schedulable capacity of this node
    pub capacity: Resource,
    /// The resources consumed by the pods assigned to this node
    pub used_capacity: Resource,
    /// Whether this node is marked unschedulable
    pub unschedulable: bool,
}

impl KubeNode {
    /// Build the autoscalers view of a node
    ///
    /// # Arguments
    ///
    /// * `node` - The raw node from the cluster listing
    pub fn new(node: &Node) -> Result<Self, Error> {
        let name = match &node.metadata.name {
            Some(name) => name.clone(),
            None => return Err(Error::new("Node has no name")),
        };
        let identity = parse_node_name(&name)?;
        let labels = node.metadata.labels.clone().unwrap_or_default();
        // the status capacity is a placeholder until the control loop
        // swaps in the catalog capacity for this instance type
        let mut capacity = Resource::new();
        if let Some(raw) = node
            .status
            .as_ref()
            .and_then(|status| status.capacity.as_ref())
        {
            for (resource, quantity) in raw {
                capacity.add_quantity(resource, parse_quantity(&quantity.0)?);
            }
        }
        Ok(KubeNode {
            instance_type: labels.get(INSTANCE_TYPE_LABEL).cloned(),
            unschedulable: node
                .spec
                .as_ref()
                .and_then(|spec| spec.unschedulable)
                .unwrap_or(false),
            pool_name: identity.pool,
            index: identity.index,
            name,
            labels,
            capacity,
            used_capacity: Resource::new(),
        })
    }

    /// Whether this node is a master
    pub fn is_master(&self) -> bool {
        self.pool_name == MASTER_POOL
    }

    /// Whether this node is an agent
    pub fn is_agent(&self) -> bool {
        !self.is_master()
    }

    /// Count an assigned pods requests against this nodes capacity
    ///
    /// # Arguments
    ///
    /// * `pod` - The pod assigned to this node
    pub fn count_pod(&mut self, pod: &KubePod) {
        self.used_capacity = self.used_capacity.clone() + &pod.resources;
    }

    /// Whether additional resources fit on this node
    ///
    /// # Arguments
    ///
    /// * `resources` - The resources to fit
    pub fn can_fit(&self, resources: &Resource) -> bool {
        let left = self.used_capacity.clone() + resources - &self.capacity;
        left.possible()
    }

    /// Whether this node matches every selector on a pod
    ///
    /// # Arguments
    ///
    /// * `pod` - The pod whose selectors to check
    pub fn is_match(&self, pod: &KubePod) -> bool {
        pod.selectors
            .iter()
            .all(|(label, value)| self.labels.get(label) == Some(value))
    }

    /// Whether this nodes cordon was placed by the autoscaler
    pub fn cordoned_by_autoscaler(&self) -> bool {
        match self.labels.get(CORDON_LABEL) {
            Some(value) => {
                let lowered = value.to_lowercase();
                lowered == "1" || lowered == "true"
            }
            None => false,
        }
    }

    /// Mark this node unschedulable and label the cordon as ours
    ///
    /// # Arguments
    ///
    /// * `cluster` - The cluster to patch the node through
    pub async fn cordon(&mut self, cluster: &dyn ClusterView) -> bool {
        let patch = json!({
            "spec": {"unschedulable": true},
            "metadata": {"labels": {CORDON_LABEL: "true"}}
        });
        match cluster.patch_node(&self.name, patch).await {
            Ok(()) => {
                self.unschedulable = true;
                self.labels.insert(CORDON_LABEL.to_owned(), "true".to_owned());
                event!(Level::INFO, node = self.name, "cordon");
                true
            }
            Err(error) => {
                event!(Level::INFO, node = self.name, error = %error, "cordon failed");
                false
            }
        }
    }

    /// Clear the unschedulable flag if the cordon was placed by us
    ///
    /// # Arguments
    ///
    /// * `cluster` - The cluster to patch the node through
    pub async fn uncordon(&mut self, cluster: &dyn ClusterView) -> bool {
        // never undo an operator placed cordon
        if !self.cordoned_by_autoscaler() {
            event!(Level::DEBUG, node = self.name, "uncordon ignored");
            return false;
        }
        let patch = json!({"spec": {"unschedulable": false}});
        match cluster.patch_node(&self.name, patch).await {
            Ok(()) => {
                self.unschedulable = false;
                event!(Level::INFO, node = self.name, "uncordon");
                true
            }
            Err(error) => {
                event!(Level::INFO, node = self.name, error = %error, "uncordon failed");
                false
            }
        }
    }

    /// Evict every drainable pod on this node
    ///
    /// # Arguments
    ///
    /// * `pods` - The pods currently assigned to this node
    /// * `cluster` - The cluster to evict pods through
    /// * `notifier` - An optional notifier to tell about the drain
    pub async fn drain(
        &self,
        pods: &[KubePod],
        cluster: &dyn ClusterView,
        notifier: Option<&Notifier>,
    ) -> bool {
        let mut drained = Vec::with_capacity(pods.len());
        for pod in pods {
            // mirror pods restart in place and undrainable pods stay put
            if !pod.is_drainable() {
                continue;
            }
            match cluster.evict_pod(&pod.namespace, &pod.name).await {
                Ok(()) => drained.push(pod.clone()),
                Err(error) => {
                    event!(
                        Level::INFO,
                        node = self.name,
                        pod = %pod,
                        error = %error,
                        "evict failed"
                    );
                    return false;
                }
            }
        }
        event!(Level::INFO, node = self.name, drained = drained.len(), "drain");
        if let Some(notifier) = notifier {
            notifier.notify_drained(&self.name, &drained).await;
        }
        true
    }

    /// Delete this node object from the cluster
    ///
    /// # Arguments
    ///
    /// * `cluster` - The cluster to delete the node through
    pub async fn delete(&self, cluster: &dyn ClusterView) -> bool {
        match cluster.delete_node(&self.name).await {
            Ok(()) => {
                event!(Level::INFO, node = self.name, "delete");
                true
            }
            Err(error) => {
                event!(Level::INFO, node = self.name, error = %error, "delete failed");
                false
            }
        }
    }
}

impl std::fmt::Display for KubeNode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match &self.instance_type {
            Some(kind) => write!(f, "{} ({})", self.name, kind),
            None => write!(f, "{}", self.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_names() {
        let identity = parse_node_name("k8s-agentpool1-16334397-3").unwrap();
        assert_eq!(identity.pool, "agentpool1");
        assert_eq!(identity.cluster_id, "16334397");
        assert_eq!(identity.index, 3);
        assert!(identity.is_agent());
    }

    #[test]
    fn recognizes_masters() {
        let identity = parse_node_name("k8s-master-16334397-0").unwrap();
        assert!(identity.is_master());
        assert!(!identity.is_agent());
    }

    #[test]
    fn rejects_malformed_names() {
        // wrong segment count
        assert!(parse_node_name("k8s-agentpool1-3").is_err());
        assert!(parse_node_name("k8s-agent-pool1-16334397-3").is_err());
        // non numeric index
        assert!(parse_node_name("k8s-agentpool1-16334397-abc").is_err());
        let err = parse_node_name("justonename").unwrap_err();
        assert_eq!(err.kind(), "MalformedNodeName");
    }
}

use std::time::Duration;
use tracing::{event, Level};

use crate::libs::kube::ClusterView;
use crate::libs::resources::Resource;

use super::node::KubeNode;

/// The largest agent pool acs-engine will deploy
pub const MAX_POOL_SIZE: u64 = 100;

/// A homogeneous group of agent nodes sharing an instance type
///
/// Pools are rebuilt from the observed node set on every loop; nothing here
/// survives a tick.
#[derive(Debug, Clone)]
pub struct AgentPool {
    /// The name of this pool
    pub name: String,
    /// The instance type every node in this pool shares
    pub instance_type: String,
    /// The resources one fresh node of this pool provides
    pub unit_capacity: Resource,
    /// The most nodes this pool may grow to
    pub max_size: u64,
    /// The nodes observed in this pool
    pub nodes: Vec<KubeNode>,
}

impl AgentPool {
    /// Build an agent pool around its observed nodes
    ///
    /// # Arguments
    ///
    /// * `name` - The name of this pool
    /// * `instance_type` - The instance type this pool deploys
    /// * `unit_capacity` - The capacity of one fresh node
    /// * `nodes` - The nodes observed in this pool
    pub fn new<T: Into<String>, I: Into<String>>(
        name: T,
        instance_type: I,
        unit_capacity: Resource,
        nodes: Vec<KubeNode>,
    ) -> Self {
        AgentPool {
            name: name.into(),
            instance_type: instance_type.into(),
            unit_capacity,
            max_size: MAX_POOL_SIZE,
            nodes,
        }
    }

    /// The number of nodes currently observed in this pool
    pub fn actual_capacity(&self) -> u64 {
        self.nodes.len() as u64
    }

    /// The number of unschedulable nodes currently in this pool
    pub fn unschedulable_count(&self) -> u64 {
        self.nodes.iter().filter(|node| node.unschedulable).count() as u64
    }

    /// Whether a node with the given index is live in this pool
    ///
    /// # Arguments
    ///
    /// * `index` - The index to look for
    pub fn has_node_with_index(&self, index: u64) -> bool {
        self.nodes.iter().any(|node| node.index == index)
    }

    /// Uncordon our own cordoned nodes until the pool reaches a target size
    ///
    /// Reclaiming is cheaper than deploying: an unschedulable node we
    /// cordoned earlier can fill a scale up request without any cloud call.
    /// After each uncordon the loop pauses so the scheduler can place
    /// pending pods on the reclaimed node.
    ///
    /// # Arguments
    ///
    /// * `target` - The desired schedulable pool size
    /// * `cluster` - The cluster to patch nodes through
    /// * `pause` - How long to pause after each successful uncordon
    pub async fn reclaim_unschedulable(
        &mut self,
        target: u64,
        cluster: &dyn ClusterView,
        pause: Duration,
    ) -> u64 {
        let desired = std::cmp::min(self.max_size, target);
        let actual = self.actual_capacity();
        let mut reclaimed = 0;
        if actual + reclaimed < desired {
            for node in self.nodes.iter_mut().filter(|node| node.unschedulable) {
                if node.uncordon(cluster).await {
                    tokio::time::sleep(pause).await;
                    reclaimed += 1;
                    // uncordon only what we need
                    if actual + reclaimed == desired {
                        break;
                    }
                }
            }
        }
        if reclaimed > 0 {
            event!(Level::INFO, pool = self.name, reclaimed, "reclaimed unschedulable nodes");
        }
        actual + reclaimed
    }
}

//! The shared scaling logic: node classification and pending pod bin packing

use std::collections::BTreeMap;
use std::fmt;
use tracing::{event, Level};

use super::capacity::CapacityCatalog;
use super::errors::Error;
use super::models::{AgentPool, KubePod, KubeNode};
use super::notify::Notifier;
use super::resources::Resource;

/// The utilization threshold under which a node is considered under
/// utilized and a candidate for draining
pub const UTIL_THRESHOLD: f64 = 0.3;

/// Pods in the kube-system infrastructure set that are always treated as
/// drainable when classifying a node
const INFRA_POD_PREFIX: &str = "kube-proxy";

/// The state of a node as classified on every maintenance pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Pods are pending and this node could still take them
    PodPending,
    /// The node is running enough work to be left alone
    Busy,
    /// The node is busy but was left cordoned
    BusyUnschedulable,
    /// The node is idle but still schedulable
    IdleSchedulable,
    /// The node is idle and cordoned, ready for deletion
    IdleUnschedulable,
    /// The node is under utilized and every pod on it can be evicted
    UnderUtilizedDrainable,
    /// The node is under utilized but a pod on it cannot be evicted
    UnderUtilizedUndrainable,
    /// The node is protected to preserve warm spare capacity
    SpareAgent,
    /// Kept for forward compatibility; never produced
    GracePeriod,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let label = match self {
            NodeState::PodPending => "pod-pending",
            NodeState::Busy => "busy",
            NodeState::BusyUnschedulable => "busy-unschedulable",
            NodeState::IdleSchedulable => "idle-schedulable",
            NodeState::IdleUnschedulable => "idle-unschedulable",
            NodeState::UnderUtilizedDrainable => "under-utilized-drainable",
            NodeState::UnderUtilizedUndrainable => "under-utilized-undrainable",
            NodeState::SpareAgent => "spare-agent",
            NodeState::GracePeriod => "grace-period",
        };
        write!(f, "{}", label)
    }
}

/// Classify a node for the maintenance pass
///
/// # Arguments
///
/// * `node` - The node to classify
/// * `node_pods` - The pods currently assigned to this node
/// * `pending` - Whether any pod is pending cluster wide
pub fn get_node_state(node: &KubeNode, node_pods: &[&KubePod], pending: bool) -> NodeState {
    // a node is busy if it runs any pod not managed by a node local component
    let busy = node_pods.iter().filter(|pod| !pod.is_mirrored()).count() > 0;
    // kube-proxy style infrastructure pods never block a drain
    let drainable = node_pods
        .iter()
        .all(|pod| pod.is_drainable() || pod.name.contains(INFRA_POD_PREFIX));
    // sum the requests of the busy pods; a node with no busy pods is idle,
    // not under utilized
    let utilization = node_pods
        .iter()
        .filter(|pod| !pod.is_mirrored())
        .fold(Resource::new(), |acc, pod| acc + &pod.resources);
    let under_utilized =
        busy && (node.capacity.clone() * UTIL_THRESHOLD - &utilization).possible();

    if busy && !under_utilized {
        if node.unschedulable {
            NodeState::BusyUnschedulable
        } else {
            NodeState::Busy
        }
    } else if pending && !node.unschedulable {
        NodeState::PodPending
    } else if under_utilized && (busy || !node.unschedulable) {
        if drainable {
            NodeState::UnderUtilizedDrainable
        } else {
            NodeState::UnderUtilizedUndrainable
        }
    } else if node.unschedulable {
        NodeState::IdleUnschedulable
    } else {
        NodeState::IdleSchedulable
    }
}

/// The methods every scaling backend must provide
///
/// The bin packer is shared: backends supply their pools and a way to drive
/// them toward a size vector, and inherit `fulfill_pending`.
#[async_trait::async_trait]
pub trait Scaler: Send {
    /// The agent pools observed this tick
    fn pools(&self) -> &[AgentPool];

    /// The capacity catalog in use
    fn catalog(&self) -> &CapacityCatalog;

    /// How many nodes to add on top of the bin packed target
    fn over_provision(&self) -> u64;

    /// Whether a pool must never be touched
    ///
    /// # Arguments
    ///
    /// * `pool` - The pool name to check
    fn is_ignored(&self, pool: &str) -> bool;

    /// The notifier to announce scale events through
    fn notifier(&self) -> Option<&Notifier>;

    /// Drive the pools toward a new size vector
    ///
    /// # Arguments
    ///
    /// * `new_sizes` - The desired size for every pool
    async fn scale_pools(&mut self, new_sizes: BTreeMap<String, u64>) -> Result<(), Error>;

    /// Run the maintenance state machine over every node
    ///
    /// # Arguments
    ///
    /// * `pending` - The pending pods waiting for capacity
    /// * `assigned` - The running or pending assigned pods
    async fn maintain(&mut self, pending: &[KubePod], assigned: &[KubePod]) -> Result<(), Error>;

    /// Compute the pool sizes needed to place the pending pods and apply them
    ///
    /// Pools are filled cheapest first; within a pool pods are packed first
    /// fit onto hypothetical fresh nodes. The result is a pure function of
    /// the pending set and the observed pools.
    ///
    /// # Arguments
    ///
    /// * `pods` - The pending pods to place
    async fn fulfill_pending(&mut self, pods: &[KubePod]) -> Result<(), Error> {
        event!(Level::INFO, pending = pods.len(), "scaling for pending pods");
        let mut accounted = vec![false; pods.len()];
        let mut unaccounted = pods.len();
        let mut new_sizes = BTreeMap::default();
        // visit pools cheapest first so cheap capacity soaks up the demand
        let order = self.catalog().order_by_cost_asc(self.pools());
        for pool_idx in order {
            let pool = &self.pools()[pool_idx];
            new_sizes.insert(pool.name.clone(), pool.actual_capacity());
            if self.is_ignored(&pool.name) || unaccounted == 0 {
                continue;
            }
            // each entry is the remaining capacity of one hypothetical new
            // node; the parallel list tracks which pods landed on it
            let mut hypothetical: Vec<Resource> = Vec::new();
            let mut assigned: Vec<Vec<usize>> = Vec::new();
            for (idx, pod) in pods.iter().enumerate() {
                // skip pods already placed or too big for this instance type
                if accounted[idx]
                    || !(pool.unit_capacity.clone() - &pod.resources).possible()
                {
                    continue;
                }
                // first fit over the hypothetical nodes
                let mut found_fit = false;
                for (node_idx, remaining) in hypothetical.iter_mut().enumerate() {
                    let after = remaining.clone() - &pod.resources;
                    if after.possible() {
                        *remaining = after;
                        assigned[node_idx].push(idx);
                        found_fit = true;
                        break;
                    }
                }
                if !found_fit {
                    hypothetical.push(pool.unit_capacity.clone() - &pod.resources);
                    assigned.push(vec![idx]);
                }
            }
            let units_needed = hypothetical.len() as u64 + self.over_provision();
            // clamp to the headroom this pool has left
            let headroom = pool.max_size.saturating_sub(pool.actual_capacity());
            let units_requested = units_needed - units_needed.saturating_sub(headroom);
            let new_capacity = pool.actual_capacity() + units_requested;
            event!(
                Level::INFO,
                pool = pool.name,
                actual = pool.actual_capacity(),
                requested = units_requested,
                new_capacity,
                "new capacity requested"
            );
            new_sizes.insert(pool.name.clone(), new_capacity);
            // only the pods on the nodes we actually requested are placed
            for group in assigned.iter().take(units_requested as usize) {
                for idx in group {
                    if !accounted[*idx] {
                        accounted[*idx] = true;
                        unaccounted -= 1;
                    }
                }
            }
        }
        if unaccounted > 0 {
            event!(Level::WARN, unaccounted, "failed to scale sufficiently");
            if let Some(notifier) = self.notifier() {
                let unplaced = pods
                    .iter()
                    .enumerate()
                    .filter(|(idx, _)| !accounted[*idx])
                    .map(|(_, pod)| pod.clone())
                    .collect::<Vec<KubePod>>();
                notifier.notify_failed_to_scale(&unplaced).await;
            }
        }
        self.scale_pools(new_sizes).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a node with the given capacity and pods worth of usage
    fn test_node(unschedulable: bool) -> KubeNode {
        KubeNode {
            name: "k8s-agentpool1-16334397-0".to_owned(),
            pool_name: "agentpool1".to_owned(),
            index: 0,
            instance_type: Some("Standard_D2_v2".to_owned()),
            labels: Default::default(),
            capacity: Resource::new().set("cpu", 2.0).set("memory", 7.0e9).set("pods", 110.0),
            used_capacity: Resource::new(),
            unschedulable,
        }
    }

    fn test_pod(name: &str, cpu: f64) -> KubePod {
        crate::test_utilities::pending_pod(name, cpu)
    }

    #[test]
    fn busy_node_is_left_alone() {
        let node = test_node(false);
        let pod = test_pod("worker", 1.5);
        let pods = vec![&pod];
        assert_eq!(get_node_state(&node, &pods, false), NodeState::Busy);
    }

    #[test]
    fn busy_cordoned_node_wants_uncordoning() {
        let node = test_node(true);
        let pod = test_pod("worker", 1.5);
        let pods = vec![&pod];
        assert_eq!(get_node_state(&node, &pods, false), NodeState::BusyUnschedulable);
    }

    #[test]
    fn pending_pods_protect_schedulable_nodes() {
        let node = test_node(false);
        assert_eq!(get_node_state(&node, &[], true), NodeState::PodPending);
    }

    #[test]
    fn under_utilized_nodes_are_drain_candidates() {
        let node = test_node(false);
        let pod = test_pod("tiny", 0.1);
        let pods = vec![&pod];
        assert_eq!(
            get_node_state(&node, &pods, false),
            NodeState::UnderUtilizedDrainable
        );
    }

    #[test]
    fn idle_nodes_cordon_then_delete() {
        assert_eq!(get_node_state(&test_node(false), &[], false), NodeState::IdleSchedulable);
        assert_eq!(get_node_state(&test_node(true), &[], false), NodeState::IdleUnschedulable);
    }
}

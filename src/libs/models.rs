//! The autoscalers view of pods, nodes, and agent pools

mod node;
mod pod;
mod pool;

pub use node::{parse_node_name, KubeNode, NodeIdentity, CORDON_LABEL};
pub use pod::{KubePod, PodStatus};
pub use pool::{AgentPool, MAX_POOL_SIZE};

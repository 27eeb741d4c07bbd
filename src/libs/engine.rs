//! The scaler for acs-engine built clusters
//!
//! Scale out is an incremental ARM deployment over explicitly enumerated VM
//! indices; scale in deletes individual VMs with their NIC and OS disk.

use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{event, instrument, Level};
use uuid::Uuid;

use super::azure::{CloudProvider, OsDisk, RESOURCE_DELETE_API};
use super::capacity::CapacityCatalog;
use super::deployments::Deployments;
use super::errors::Error;
use super::kube::ClusterView;
use super::models::{AgentPool, KubeNode, KubePod};
use super::notify::Notifier;
use super::scaler::{get_node_state, NodeState, Scaler};
use super::template;

/// How many times a transient blob delete failure is retried in place
const BLOB_DELETE_ATTEMPTS: usize = 5;

/// The settings shared by every tick of the engine scaler
#[derive(Clone)]
pub struct EngineSettings {
    /// The resource group holding the cluster
    pub resource_group: String,
    /// Extra nodes requested on top of the bin packed target
    pub over_provision: u64,
    /// The per pool floor of schedulable agents never drained
    pub spare_count: u64,
    /// Whether to only log the intended actions
    pub dry_run: bool,
    /// How long to pause after each reclaimed node
    pub reclaim_pause: Duration,
    /// The pools the autoscaler must never touch
    pub ignored_pools: HashSet<String>,
}

/// Scales acs-engine agent pools through ARM deployments
pub struct EngineScaler {
    /// The shared engine settings
    settings: EngineSettings,
    /// The capacity catalog in use
    catalog: Arc<CapacityCatalog>,
    /// The downloaded cluster template
    arm_template: Value,
    /// The downloaded deployment parameters
    arm_parameters: Value,
    /// The agent pools observed this tick
    pools: Vec<AgentPool>,
    /// The cluster to act on
    cluster: Arc<dyn ClusterView>,
    /// The cloud to deploy and delete through
    cloud: Arc<dyn CloudProvider>,
    /// The single flight deployment guard
    deployments: Arc<Deployments>,
    /// The notifier for scale and drain events
    notifier: Option<Notifier>,
}

impl EngineScaler {
    /// Build an engine scaler around the nodes observed this tick
    ///
    /// # Arguments
    ///
    /// * `settings` - The shared engine settings
    /// * `catalog` - The capacity catalog in use
    /// * `arm_template` - The downloaded cluster template
    /// * `arm_parameters` - The downloaded deployment parameters
    /// * `nodes` - The agent nodes observed this tick
    /// * `cluster` - The cluster to act on
    /// * `cloud` - The cloud to deploy and delete through
    /// * `deployments` - The single flight deployment guard
    /// * `notifier` - The notifier for scale and drain events
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: EngineSettings,
        catalog: Arc<CapacityCatalog>,
        arm_template: Value,
        arm_parameters: Value,
        nodes: Vec<KubeNode>,
        cluster: Arc<dyn ClusterView>,
        cloud: Arc<dyn CloudProvider>,
        deployments: Arc<Deployments>,
        notifier: Option<Notifier>,
    ) -> Result<Self, Error> {
        let pools = Self::build_agent_pools(&arm_parameters, nodes, &catalog)?;
        Ok(EngineScaler {
            settings,
            catalog,
            arm_template,
            arm_parameters,
            pools,
            cluster,
            cloud,
            deployments,
            notifier,
        })
    }

    /// Group the observed nodes into the pools the ARM parameters declare
    ///
    /// Every parameter `<pool>VMSize` except the masters declares a pool; a
    /// node whose pool has no such parameter cannot be scaled and is left
    /// out with a warning.
    ///
    /// # Arguments
    ///
    /// * `parameters` - The downloaded deployment parameters
    /// * `nodes` - The agent nodes observed this tick
    /// * `catalog` - The capacity catalog in use
    fn build_agent_pools(
        parameters: &Value,
        nodes: Vec<KubeNode>,
        catalog: &CapacityCatalog,
    ) -> Result<Vec<AgentPool>, Error> {
        let params = parameters
            .as_object()
            .ok_or_else(|| Error::TemplateShape("Parameters must be a json object".to_owned()))?;
        // enumerate the pools from the VMSize parameters
        let mut specs = Vec::default();
        for (param, value) in params {
            if let Some(pool_name) = param.strip_suffix("VMSize") {
                if pool_name == "master" {
                    continue;
                }
                let instance_type = value
                    .get("value")
                    .and_then(|value| value.as_str())
                    .ok_or_else(|| {
                        Error::TemplateShape(format!("Parameter {} has no value", param))
                    })?;
                specs.push((pool_name.to_owned(), instance_type.to_owned()));
            }
        }
        // bucket the nodes into their pools
        let mut grouped: HashMap<String, Vec<KubeNode>> = HashMap::default();
        for node in nodes {
            if specs.iter().any(|(name, _)| name == &node.pool_name) {
                grouped.entry(node.pool_name.clone()).or_default().push(node);
            } else {
                event!(
                    Level::WARN,
                    node = node.name,
                    pool = node.pool_name,
                    "node belongs to a pool with no VMSize parameter, skipping"
                );
            }
        }
        // build each pool with the unit capacity of its instance type
        let mut pools = Vec::with_capacity(specs.len());
        for (name, instance_type) in specs {
            let unit_capacity = catalog.capacity_of(&instance_type)?.clone();
            let nodes = grouped.remove(&name).unwrap_or_default();
            pools.push(AgentPool::new(name, instance_type, unit_capacity, nodes));
        }
        Ok(pools)
    }

    /// The indexes of the pools the autoscaler may touch
    fn scalable_pools(&self) -> Vec<usize> {
        (0..self.pools.len())
            .filter(|idx| !self.settings.ignored_pools.contains(&self.pools[*idx].name))
            .collect()
    }

    /// Build the parameters and template for a scale out and submit it
    ///
    /// # Arguments
    ///
    /// * `new_sizes` - The desired size for every pool
    #[instrument(name = "EngineScaler::deploy_pools", skip_all, err(Debug))]
    async fn deploy_pools(&self, new_sizes: &BTreeMap<String, u64>) -> Result<(), Error> {
        let mut parameters = self.arm_parameters.clone();
        for idx in self.scalable_pools() {
            let pool = &self.pools[idx];
            let size = new_sizes.get(&pool.name).copied().unwrap_or(pool.actual_capacity());
            if size == 0 {
                // ARM rejects a zero count copy loop; a count of one with an
                // offset of one deploys nothing once the pool is excised
                // from the template
                parameters[format!("{}Count", pool.name)] = json!({"value": 1});
                parameters[format!("{}Offset", pool.name)] = json!({"value": 1});
            } else {
                // the offset is left alone since the template now names each
                // new resource explicitly
                parameters[format!("{}Count", pool.name)] = json!({"value": size});
            }
        }
        let transformed = template::prepare_scale_out(&self.arm_template, &self.pools, new_sizes)?;
        let properties = json!({
            "template": transformed,
            "parameters": parameters,
            "mode": "Incremental",
        });
        // short random suffix so retried deployments never collide
        let id = Uuid::new_v4().to_string();
        let short = id.split('-').next().unwrap_or("0").to_owned();
        let name = format!("autoscaler-deployment-{}", short);
        event!(Level::INFO, deployment = name, "deployment started");
        self.cloud
            .create_deployment(&self.settings.resource_group, &name, properties)
            .await
    }
}

#[async_trait::async_trait]
impl Scaler for EngineScaler {
    /// The agent pools observed this tick
    fn pools(&self) -> &[AgentPool] {
        &self.pools
    }

    /// The capacity catalog in use
    fn catalog(&self) -> &CapacityCatalog {
        &self.catalog
    }

    /// How many nodes to add on top of the bin packed target
    fn over_provision(&self) -> u64 {
        self.settings.over_provision
    }

    /// Whether a pool must never be touched
    fn is_ignored(&self, pool: &str) -> bool {
        self.settings.ignored_pools.contains(pool)
    }

    /// The notifier to announce scale events through
    fn notifier(&self) -> Option<&Notifier> {
        self.notifier.as_ref()
    }

    /// Drive the pools toward a new size vector
    ///
    /// Growing pools first reclaim their own cordoned nodes, then all
    /// changed pools ride a single incremental deployment.
    ///
    /// # Arguments
    ///
    /// * `new_sizes` - The desired size for every pool
    #[instrument(name = "EngineScaler::scale_pools", skip_all, err(Debug))]
    async fn scale_pools(&mut self, new_sizes: BTreeMap<String, u64>) -> Result<(), Error> {
        let mut new_sizes = new_sizes;
        let mut has_changes = false;
        let cluster = self.cluster.clone();
        let notifier = self.notifier.clone();
        for idx in self.scalable_pools() {
            let pause = self.settings.reclaim_pause;
            let dry_run = self.settings.dry_run;
            let pool = &mut self.pools[idx];
            let actual = pool.actual_capacity();
            let new_size = new_sizes.get(&pool.name).copied().unwrap_or(actual);
            // never request more than the pool can hold
            let new_size = std::cmp::min(pool.max_size, new_size);
            new_sizes.insert(pool.name.clone(), new_size);
            if new_size == actual {
                event!(
                    Level::INFO,
                    pool = pool.name,
                    capacity = actual,
                    "pool already at desired capacity"
                );
                continue;
            }
            has_changes = true;
            if dry_run {
                event!(
                    Level::INFO,
                    pool = pool.name,
                    target = new_size,
                    actual,
                    "[dry run] would have scaled pool"
                );
                continue;
            }
            if new_size > actual {
                // cordoned nodes we own can fill part of the demand without
                // waiting on a deployment
                pool.reclaim_unschedulable(new_size, &*cluster, pause).await;
                if let Some(notifier) = &notifier {
                    notifier
                        .notify_scale(&pool.name, new_size - actual, new_size, &[])
                        .await;
                }
            }
        }
        if !self.settings.dry_run && has_changes {
            let sizes = new_sizes.clone();
            self.deployments
                .clone()
                .submit(|| self.deploy_pools(&sizes), new_sizes)
                .await?;
        }
        Ok(())
    }

    /// Run the maintenance state machine over every node
    ///
    /// Classification of a whole pool happens before any deletion is
    /// dispatched; deletions then fan out one worker per node since each
    /// worker touches distinct cloud resources.
    ///
    /// # Arguments
    ///
    /// * `pending` - The pending pods waiting for capacity
    /// * `assigned` - The running or pending assigned pods
    #[instrument(name = "EngineScaler::maintain", skip_all, err(Debug))]
    async fn maintain(&mut self, pending: &[KubePod], assigned: &[KubePod]) -> Result<(), Error> {
        event!(Level::INFO, "maintaining nodes");
        // index the assigned pods by their node
        let mut pods_by_node: HashMap<String, Vec<KubePod>> = HashMap::default();
        for pod in assigned {
            if let Some(node_name) = &pod.node_name {
                pods_by_node
                    .entry(node_name.clone())
                    .or_default()
                    .push(pod.clone());
            }
        }
        let pending_exists = !pending.is_empty();
        let cluster = self.cluster.clone();
        let notifier = self.notifier.clone();
        let dry_run = self.settings.dry_run;
        let spare_count = self.settings.spare_count;
        let mut delete_queue: Vec<(String, KubeNode)> = Vec::default();
        for idx in self.scalable_pools() {
            let pool = &mut self.pools[idx];
            // the most nodes we may pull out of service without dipping
            // below the spare floor
            let mut max_drainable = pool.actual_capacity() as i64
                - pool.unschedulable_count() as i64
                - spare_count as i64;
            for node_idx in 0..pool.nodes.len() {
                let node_name = pool.nodes[node_idx].name.clone();
                let node_pods = pods_by_node.get(&node_name).cloned().unwrap_or_default();
                let pod_refs = node_pods.iter().collect::<Vec<&KubePod>>();
                let mut state = get_node_state(&pool.nodes[node_idx], &pod_refs, pending_exists);
                // pulling another node out of service would dip below the
                // spare floor, so protect it instead
                if max_drainable <= 0
                    && matches!(
                        state,
                        NodeState::UnderUtilizedDrainable | NodeState::IdleSchedulable
                    )
                {
                    state = NodeState::SpareAgent;
                }
                event!(Level::INFO, node = node_name, state = %state);
                match state {
                    // nothing to do for these states
                    NodeState::PodPending
                    | NodeState::Busy
                    | NodeState::SpareAgent
                    | NodeState::GracePeriod
                    | NodeState::UnderUtilizedUndrainable => (),
                    NodeState::UnderUtilizedDrainable => {
                        if dry_run {
                            event!(
                                Level::INFO,
                                node = node_name,
                                "[dry run] would have cordoned and drained"
                            );
                        } else {
                            let node = &mut pool.nodes[node_idx];
                            node.cordon(&*cluster).await;
                            node.drain(&node_pods, &*cluster, notifier.as_ref()).await;
                            max_drainable -= 1;
                        }
                    }
                    NodeState::IdleSchedulable => {
                        if dry_run {
                            event!(Level::INFO, node = node_name, "[dry run] would have cordoned");
                        } else {
                            pool.nodes[node_idx].cordon(&*cluster).await;
                            max_drainable -= 1;
                        }
                    }
                    NodeState::BusyUnschedulable => {
                        if dry_run {
                            event!(Level::INFO, node = node_name, "[dry run] would have uncordoned");
                        } else {
                            pool.nodes[node_idx].uncordon(&*cluster).await;
                        }
                    }
                    NodeState::IdleUnschedulable => {
                        if dry_run {
                            event!(Level::INFO, node = node_name, "[dry run] would have scaled in");
                        } else {
                            delete_queue.push((pool.name.clone(), pool.nodes[node_idx].clone()));
                        }
                    }
                }
            }
        }
        if delete_queue.is_empty() {
            return Ok(());
        }
        // snapshot the observed sizes once; the workers compound their own
        // decrements through the deployment guard
        let actual_sizes = self
            .pools
            .iter()
            .map(|pool| (pool.name.clone(), pool.actual_capacity()))
            .collect::<BTreeMap<String, u64>>();
        let mut workers: Vec<JoinHandle<Result<(), Error>>> =
            Vec::with_capacity(delete_queue.len());
        for (pool_name, node) in delete_queue {
            let cloud = self.cloud.clone();
            let cluster = self.cluster.clone();
            let deployments = self.deployments.clone();
            let group = self.settings.resource_group.clone();
            let sizes = actual_sizes.clone();
            workers.push(tokio::spawn(async move {
                delete_node_resources(cloud, cluster, deployments, group, sizes, pool_name, node)
                    .await
            }));
        }
        // wait for every worker and log failures; the next tick re-observes
        // anything left behind
        for result in futures::future::join_all(workers).await {
            match result {
                Ok(Ok(())) => (),
                Ok(Err(error)) => {
                    event!(Level::ERROR, error = %error, "failed to scale in node");
                }
                Err(error) => {
                    event!(Level::ERROR, error = %error, "scale in worker panicked");
                }
            }
        }
        Ok(())
    }
}

/// Delete the cloud resources backing one node
///
/// # Arguments
///
/// * `cloud` - The cloud to delete through
/// * `cluster` - The cluster to drop the node object from
/// * `deployments` - The deployment guard to publish the new sizes to
/// * `group` - The resource group holding the cluster
/// * `actual_sizes` - The observed size of every pool
/// * `pool` - The pool this node belongs to
/// * `node` - The node being deleted
async fn delete_node_resources(
    cloud: Arc<dyn CloudProvider>,
    cluster: Arc<dyn ClusterView>,
    deployments: Arc<Deployments>,
    group: String,
    actual_sizes: BTreeMap<String, u64>,
    pool: String,
    node: KubeNode,
) -> Result<(), Error> {
    // publish the decremented target so a concurrent scale up sees it
    deployments.record_scale_in(actual_sizes, &pool).await;
    event!(Level::INFO, node = node.name, "deleting node");
    // locate the OS disk before the VM disappears
    let vm = cloud.get_virtual_machine(&group, &node.name).await?;
    let os_disk = OsDisk::from_vm(&vm)?;
    // delete the VM itself
    event!(Level::INFO, node = node.name, "deleting VM");
    cloud
        .delete_resource(
            &group,
            "Microsoft.Compute",
            "virtualMachines",
            &node.name,
            RESOURCE_DELETE_API,
        )
        .await?;
    // the NIC shares the node name with a nic infix before the index
    let parts = node.name.split('-').collect::<Vec<&str>>();
    if parts.len() != 4 {
        return Err(Error::MalformedNodeName(node.name.clone()));
    }
    let nic = format!("{}-{}-{}-nic-{}", parts[0], parts[1], parts[2], parts[3]);
    event!(Level::INFO, node = node.name, nic, "deleting NIC");
    cloud
        .delete_resource(
            &group,
            "Microsoft.Network",
            "networkInterfaces",
            &nic,
            RESOURCE_DELETE_API,
        )
        .await?;
    // delete the OS disk wherever it lives
    event!(Level::INFO, node = node.name, "deleting OS disk");
    match os_disk {
        OsDisk::Managed(name) => cloud.delete_managed_disk(&group, &name).await?,
        OsDisk::Vhd {
            account,
            container,
            blob,
        } => {
            let key = cloud.list_storage_keys(&group, &account).await?;
            let mut attempt = 0;
            loop {
                match cloud.delete_blob(&account, &key, &container, &blob).await {
                    Ok(()) => break,
                    Err(error) if attempt + 1 < BLOB_DELETE_ATTEMPTS && error.is_transient() => {
                        attempt += 1;
                        event!(
                            Level::WARN,
                            blob,
                            attempt,
                            error = %error,
                            "transient blob delete failure, retrying"
                        );
                    }
                    Err(error) => return Err(error),
                }
            }
        }
    }
    // the kubelet is gone for good, so drop the node object as well
    node.delete(&*cluster).await;
    Ok(())
}

//! The periodic control loop driving the scaler
//!
//! Each tick rebuilds the world from a fresh cluster listing: nodes become
//! pools, pods become demand, and the scaler decides what to do about the
//! difference. Failed ticks back off exponentially.

use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{event, instrument, Level};

use super::azure::CloudProvider;
use super::capacity::CapacityCatalog;
use super::conf::Conf;
use super::deployments::Deployments;
use super::engine::{EngineScaler, EngineSettings};
use super::errors::Error;
use super::kube::ClusterView;
use super::models::{KubeNode, KubePod, PodStatus};
use super::notify::Notifier;
use super::scaler::Scaler;
use super::template;

/// The ARM parameters that must be refilled with secure values before a
/// template can be resubmitted
const SECURE_KEY_PARAMETERS: [&str; 5] = [
    "caPrivateKey",
    "kubeConfigPrivateKey",
    "apiServerPrivateKey",
    "etcdClientPrivateKey",
    "etcdServerPrivateKey",
];

/// The operator facing knobs of the control loop
#[derive(Debug, Clone)]
pub struct ClusterOptions {
    /// The resource group hosting the cluster
    pub resource_group: String,
    /// The deployment the cluster was created from
    pub acs_deployment: String,
    /// Seconds between ticks on success
    pub sleep: u64,
    /// The per pool floor of schedulable agents never drained
    pub spare_agents: u64,
    /// Extra nodes requested on top of the bin packed target
    pub over_provision: u64,
    /// Informational threshold for how long a node may sit idle
    pub idle_threshold: u64,
    /// Informational estimate of how long a fresh instance takes to join
    pub instance_init_time: u64,
    /// Whether the scale up phase runs
    pub scale_up: bool,
    /// Whether the maintenance phase runs
    pub maintenance: bool,
    /// Whether to only log the intended actions
    pub dry_run: bool,
    /// Whether loop errors propagate instead of backing off
    pub debug: bool,
    /// The pools the autoscaler must never touch
    pub ignore_pools: HashSet<String>,
    /// The client private key for the secure string parameters
    pub client_private_key: Option<String>,
    /// The ca private key for the secure string parameters
    pub ca_private_key: Option<String>,
    /// The service principal app id
    pub sp_app_id: String,
    /// The service principal secret
    pub sp_secret: String,
}

/// The autoscaler control loop
pub struct Cluster {
    /// The operator facing options
    opts: ClusterOptions,
    /// The file based tunables
    conf: Conf,
    /// The capacity catalog in use
    catalog: Arc<CapacityCatalog>,
    /// The cluster being scaled
    cluster: Arc<dyn ClusterView>,
    /// The cloud the cluster runs on
    cloud: Arc<dyn CloudProvider>,
    /// The single flight deployment guard, shared across ticks
    deployments: Arc<Deployments>,
    /// The notifier for scale and drain events
    notifier: Option<Notifier>,
    /// The downloaded cluster template
    arm_template: Value,
    /// The downloaded deployment parameters
    arm_parameters: Value,
}

impl Cluster {
    /// Build the control loop
    ///
    /// # Arguments
    ///
    /// * `opts` - The operator facing options
    /// * `conf` - The file based tunables
    /// * `catalog` - The capacity catalog in use
    /// * `cluster` - The cluster being scaled
    /// * `cloud` - The cloud the cluster runs on
    /// * `notifier` - The notifier for scale and drain events
    pub fn new(
        opts: ClusterOptions,
        conf: Conf,
        catalog: Arc<CapacityCatalog>,
        cluster: Arc<dyn ClusterView>,
        cloud: Arc<dyn CloudProvider>,
        notifier: Option<Notifier>,
    ) -> Self {
        Cluster {
            opts,
            conf,
            catalog,
            cluster,
            cloud,
            deployments: Arc::new(Deployments::new()),
            notifier,
            arm_template: Value::Null,
            arm_parameters: Value::Null,
        }
    }

    /// Download the cluster template and parameters and ready them for
    /// resubmission
    #[instrument(name = "Cluster::login", skip_all, err(Debug))]
    pub async fn login(&mut self) -> Result<(), Error> {
        let template = self
            .cloud
            .download_template(&self.opts.resource_group, &self.opts.acs_deployment)
            .await?;
        self.arm_parameters = self
            .cloud
            .download_parameters(&self.opts.resource_group, &self.opts.acs_deployment)
            .await?;
        self.fill_secure_parameters();
        // re-running the master provisioning extension would wreck the
        // control plane, so it never rides a re-deployment
        self.arm_template = template::delete_master_vm_extension(&template)?;
        Ok(())
    }

    /// Fill the secure string parameters the download left empty
    fn fill_secure_parameters(&mut self) {
        let client_key = self.opts.client_private_key.clone().unwrap_or_default();
        let ca_key = self.opts.ca_private_key.clone().unwrap_or_default();
        self.arm_parameters["clientPrivateKey"] = json!({"value": client_key});
        self.arm_parameters["servicePrincipalClientId"] = json!({"value": self.opts.sp_app_id});
        self.arm_parameters["servicePrincipalClientSecret"] = json!({"value": self.opts.sp_secret});
        for param in SECURE_KEY_PARAMETERS {
            self.arm_parameters[param] = json!({"value": ca_key});
        }
        // etcd peer keys only exist on multi master clusters
        for idx in 0..5 {
            let param = format!("etcdPeerPrivateKey{}", idx);
            if self.arm_parameters.get(&param).is_some() {
                self.arm_parameters[param] = json!({"value": ca_key});
            }
        }
    }

    /// Run the loop forever, backing off exponentially on failed ticks
    pub async fn run(&mut self) -> Result<(), Error> {
        event!(
            Level::INFO,
            idle_threshold = self.opts.idle_threshold,
            instance_init_time = self.opts.instance_init_time,
            spare_agents = self.opts.spare_agents,
            "starting the scaling loop"
        );
        let mut backoff = self.opts.sleep;
        loop {
            let ok = self.tick_guarded().await?;
            if ok {
                backoff = self.opts.sleep;
                tokio::time::sleep(Duration::from_secs(self.opts.sleep)).await;
            } else {
                backoff *= 2;
                event!(Level::WARN, backoff, "tick failed, backing off");
                tokio::time::sleep(Duration::from_secs(backoff)).await;
            }
        }
    }

    /// Run one tick, catching errors unless debug mode wants them raw
    async fn tick_guarded(&mut self) -> Result<bool, Error> {
        event!(Level::INFO, "++++ running scaling loop ++++");
        if self.opts.debug {
            // in debug mode the loop crashes loudly instead of retrying
            self.tick().await
        } else {
            match self.tick().await {
                Ok(ok) => Ok(ok),
                Err(error) => {
                    event!(Level::ERROR, error = %error, "unexpected error");
                    Ok(false)
                }
            }
        }
    }

    /// Observe the cluster and run the scale and maintenance phases
    #[instrument(name = "Cluster::tick", skip_all, err(Debug))]
    pub async fn tick(&mut self) -> Result<bool, Error> {
        // list the nodes; an empty listing means the cluster view is broken
        let raw_nodes = self.cluster.list_nodes().await?;
        if raw_nodes.is_empty() {
            event!(
                Level::WARN,
                "failed to list any nodes, check the kube configuration; ending this loop"
            );
            return Ok(false);
        }
        // keep the agents and attach their catalog capacity
        let mut nodes = Vec::with_capacity(raw_nodes.len());
        for raw in &raw_nodes {
            let mut node = KubeNode::new(raw)?;
            // masters are never part of any scaling decision
            if node.is_master() {
                continue;
            }
            let instance_type = node.instance_type.clone().ok_or_else(|| {
                Error::new(format!("Node {} has no instance type label", node.name))
            })?;
            // the schedulable capacity is what the catalog says a node of
            // this type offers, matching the bin packers unit capacity
            node.capacity = self.catalog.capacity_of(&instance_type)?.clone();
            nodes.push(node);
        }
        event!(Level::INFO, nodes = nodes.len());
        // list the pods and count the assigned ones against their nodes
        let raw_pods = self.cluster.list_pods().await?;
        let pods = raw_pods
            .iter()
            .map(KubePod::new)
            .collect::<Result<Vec<KubePod>, Error>>()?;
        let assigned = pods
            .iter()
            .filter(|pod| {
                matches!(pod.status, PodStatus::Running | PodStatus::ContainerCreating)
                    || (pod.status == PodStatus::Pending && pod.node_name.is_some())
            })
            .cloned()
            .collect::<Vec<KubePod>>();
        for node in &mut nodes {
            for pod in &assigned {
                if pod.node_name.as_deref() == Some(node.name.as_str()) {
                    node.count_pod(pod);
                }
            }
        }
        // the scaler gets its own copy of the nodes; the local list keeps
        // absorbing pods during the pre fit below
        let settings = EngineSettings {
            resource_group: self.opts.resource_group.clone(),
            over_provision: self.opts.over_provision,
            spare_count: self.opts.spare_agents,
            dry_run: self.opts.dry_run,
            reclaim_pause: Duration::from_secs(self.conf.reclaim_pause),
            ignored_pools: self.opts.ignore_pools.clone(),
        };
        let mut scaler = EngineScaler::new(
            settings,
            self.catalog.clone(),
            self.arm_template.clone(),
            self.arm_parameters.clone(),
            nodes.clone(),
            self.cluster.clone(),
            self.cloud.clone(),
            self.deployments.clone(),
            self.notifier.clone(),
        )?;
        // a pending pod only counts as schedulable when some pool could
        // ever fit it
        let mut pods_to_schedule = Vec::default();
        for pod in pods.iter().filter(|pod| {
            pod.status == PodStatus::Pending && pod.node_name.is_none()
        }) {
            if self.catalog.is_possible(pod, scaler.pools()) {
                pods_to_schedule.push(pod.clone());
            } else {
                event!(
                    Level::WARN,
                    pod = %pod,
                    "pending pod cannot fit in any pool; check that its requests \
                     are consistent with the node sizes; scheduling skipped"
                );
                if let Some(notifier) = &self.notifier {
                    notifier.notify_invalid_pod_capacity(pod).await;
                }
            }
        }
        event!(Level::INFO, to_schedule = pods_to_schedule.len(), "pods to schedule");
        if self.opts.scale_up {
            event!(Level::INFO, "++++ scaling up begins ++++");
            let pending = get_pending_pods(&mut nodes, &pods_to_schedule);
            if !pending.is_empty() {
                scaler.fulfill_pending(&pending).await?;
            }
            event!(Level::INFO, "++++ scaling up ends ++++");
        }
        if self.opts.maintenance {
            event!(Level::INFO, "++++ maintenance begins ++++");
            scaler.maintain(&pods_to_schedule, &assigned).await?;
            event!(Level::INFO, "++++ maintenance ends ++++");
        }
        Ok(true)
    }
}

/// Absorb the pending pods that fit on live nodes, returning the rest
///
/// Each placed pod is counted against its node so one node is never handed
/// more pods than it has room for.
///
/// # Arguments
///
/// * `nodes` - The live agent nodes
/// * `pods` - The schedulable pending pods
pub fn get_pending_pods(nodes: &mut [KubeNode], pods: &[KubePod]) -> Vec<KubePod> {
    let mut pending = Vec::default();
    for pod in pods {
        let fitting = nodes
            .iter_mut()
            .find(|node| node.is_match(pod) && node.can_fit(&pod.resources));
        match fitting {
            Some(node) => {
                event!(Level::INFO, pod = %pod, node = node.name, "pod fits on a live node");
                node.count_pod(pod);
            }
            None => pending.push(pod.clone()),
        }
    }
    event!(Level::INFO, pending = pending.len(), "pending pods");
    pending
}

use k8s_openapi::api::core::v1::Pod;
use std::collections::BTreeMap;

use crate::libs::errors::Error;
use crate::libs::resources::{parse_quantity, Resource};

/// The annotation marking a static/mirror pod managed by the kubelet
const MIRROR_ANNOTATION: &str = "kubernetes.io/config.mirror";

/// The annotation an operator sets to keep a pod from ever being evicted
const DO_NOT_DRAIN_ANNOTATION: &str = "autoscaler/do-not-drain";

/// Parse a truthy label/annotation value
///
/// # Arguments
///
/// * `value` - The raw value to check
fn parse_bool_label(value: Option<&String>) -> bool {
    match value {
        Some(value) => {
            let lowered = value.to_lowercase();
            lowered == "1" || lowered == "true"
        }
        None => false,
    }
}

/// The phase of a pod as far as scaling decisions care
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodStatus {
    /// The pod is running
    Running,
    /// The pod is waiting to be scheduled or started
    Pending,
    /// The pod is scheduled and its containers are being created
    ContainerCreating,
    /// The pod ran to completion
    Succeeded,
    /// The pod terminated with a failure
    Failed,
}

impl PodStatus {
    /// Derive the status of a pod from its phase and container states
    ///
    /// # Arguments
    ///
    /// * `pod` - The pod to derive a status for
    fn from_pod(pod: &Pod) -> Self {
        let phase = pod
            .status
            .as_ref()
            .and_then(|status| status.phase.as_deref());
        match phase {
            Some("Running") => PodStatus::Running,
            Some("Succeeded") => PodStatus::Succeeded,
            Some("Pending") => {
                // a pending pod whose containers are already being created
                // has a node and counts as busy rather than waiting
                let creating = pod
                    .status
                    .as_ref()
                    .and_then(|status| status.container_statuses.as_ref())
                    .map(|statuses| {
                        statuses.iter().any(|status| {
                            status
                                .state
                                .as_ref()
                                .and_then(|state| state.waiting.as_ref())
                                .and_then(|waiting| waiting.reason.as_deref())
                                == Some("ContainerCreating")
                        })
                    })
                    .unwrap_or(false);
                if creating {
                    PodStatus::ContainerCreating
                } else {
                    PodStatus::Pending
                }
            }
            // unknown phases come from unreachable kubelets; treat the pod
            // as failed so it never counts toward busyness
            _ => PodStatus::Failed,
        }
    }
}

/// A pod as seen by the autoscaler
#[derive(Debug, Clone)]
pub struct KubePod {
    /// The name of this pod
    pub name: String,
    /// The namespace this pod lives in
    pub namespace: String,
    /// The uid identifying this pod
    pub uid: String,
    /// The node this pod is assigned to if any
    pub node_name: Option<String>,
    /// The phase this pod is in
    pub status: PodStatus,
    /// The aggregate resource requests of this pod plus one pod slot
    pub resources: Resource,
    /// The node selectors on this pod
    pub selectors: BTreeMap<String, String>,
    /// The annotations on this pod
    annotations: BTreeMap<String, String>,
    /// Whether this pod is managed by a node local component
    mirrored: bool,
}

impl KubePod {
    /// Build the autoscalers view of a pod
    ///
    /// # Arguments
    ///
    /// * `pod` - The raw pod from the cluster listing
    pub fn new(pod: &Pod) -> Result<Self, Error> {
        // a pod without a name or uid cannot be tracked
        let name = match &pod.metadata.name {
            Some(name) => name.clone(),
            None => return Err(Error::new("Pod has no name")),
        };
        let uid = match &pod.metadata.uid {
            Some(uid) => uid.clone(),
            None => return Err(Error::new(format!("Pod {} has no uid", name))),
        };
        let namespace = pod.metadata.namespace.clone().unwrap_or_default();
        let annotations = pod.metadata.annotations.clone().unwrap_or_default();
        // sum the resource requests across all containers
        let mut resources = Resource::new();
        if let Some(spec) = &pod.spec {
            for container in &spec.containers {
                if let Some(requests) = container
                    .resources
                    .as_ref()
                    .and_then(|resources| resources.requests.as_ref())
                {
                    for (resource, quantity) in requests {
                        resources.add_quantity(resource, parse_quantity(&quantity.0)?);
                    }
                }
            }
        }
        // every pod consumes one pod slot regardless of its requests
        resources.add_quantity("pods", 1.0);
        // a pod owned by a daemonset or marked as a kubelet mirror does not
        // count toward node busyness
        let daemonset = pod
            .metadata
            .owner_references
            .as_ref()
            .map(|owners| owners.iter().any(|owner| owner.kind == "DaemonSet"))
            .unwrap_or(false);
        let mirrored = daemonset || annotations.contains_key(MIRROR_ANNOTATION);
        Ok(KubePod {
            status: PodStatus::from_pod(pod),
            node_name: pod
                .spec
                .as_ref()
                .and_then(|spec| spec.node_name.clone()),
            selectors: pod
                .spec
                .as_ref()
                .and_then(|spec| spec.node_selector.clone())
                .unwrap_or_default(),
            name,
            namespace,
            uid,
            resources,
            annotations,
            mirrored,
        })
    }

    /// Whether this pods lifecycle is managed by a node local component
    pub fn is_mirrored(&self) -> bool {
        self.mirrored
    }

    /// Whether this pod may be evicted during a drain
    pub fn is_drainable(&self) -> bool {
        !self.mirrored && !parse_bool_label(self.annotations.get(DO_NOT_DRAIN_ANNOTATION))
    }
}

impl std::fmt::Display for KubePod {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

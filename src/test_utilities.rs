//! Utilities for testing the autoscaler against fake clusters and clouds

use k8s_openapi::api::core::v1::{
    Container, Node, NodeSpec, NodeStatus, Pod, PodSpec, PodStatus, ResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use crate::libs::azure::CloudProvider;
use crate::libs::capacity::CapacityCatalog;
use crate::libs::errors::Error;
use crate::libs::kube::ClusterView;
use crate::libs::models::{KubeNode, KubePod, CORDON_LABEL};
use crate::libs::resources::Resource;

/// The catalog every test shares, cheapest instance type first
pub const TEST_CATALOG: &str = r#"{
    "Standard_D1_v2": {"cpu": "1", "memory": "2Gi", "pods": 110},
    "Standard_D2_v2": {"cpu": "2", "memory": "4Gi", "pods": 110},
    "Standard_NC6": {"cpu": "6", "memory": "56Gi", "pods": 110, "gpu": 1}
}"#;

/// Build the shared test catalog
pub fn sample_catalog() -> CapacityCatalog {
    CapacityCatalog::from_json(TEST_CATALOG, 0.0).unwrap()
}

/// The unit capacity of a Standard_D2_v2 in the test catalog
pub fn unit_capacity() -> Resource {
    Resource::new()
        .set("cpu", 2.0)
        .set("memory", 4.0 * 1024.0 * 1024.0 * 1024.0)
        .set("pods", 110.0)
}

/// Build a raw k8s node the way acs-engine names them
///
/// # Arguments
///
/// * `pool` - The pool segment of the node name
/// * `index` - The index segment of the node name
/// * `instance_type` - The instance type label to set
/// * `unschedulable` - Whether the node is cordoned
/// * `cordoned_by_us` - Whether the cordon label is set
pub fn raw_node(
    pool: &str,
    index: u64,
    instance_type: &str,
    unschedulable: bool,
    cordoned_by_us: bool,
) -> Node {
    let mut labels = BTreeMap::new();
    labels.insert(
        "beta.kubernetes.io/instance-type".to_owned(),
        instance_type.to_owned(),
    );
    if cordoned_by_us {
        labels.insert(CORDON_LABEL.to_owned(), "true".to_owned());
    }
    let mut capacity = BTreeMap::new();
    capacity.insert("cpu".to_owned(), Quantity("2".to_owned()));
    capacity.insert("memory".to_owned(), Quantity("4Gi".to_owned()));
    capacity.insert("pods".to_owned(), Quantity("110".to_owned()));
    Node {
        metadata: ObjectMeta {
            name: Some(format!("k8s-{}-16334397-{}", pool, index)),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(NodeSpec {
            unschedulable: Some(unschedulable),
            ..Default::default()
        }),
        status: Some(NodeStatus {
            capacity: Some(capacity),
            ..Default::default()
        }),
    }
}

/// Build an agent node model with the test unit capacity attached
///
/// # Arguments
///
/// * `pool` - The pool segment of the node name
/// * `index` - The index segment of the node name
/// * `unschedulable` - Whether the node is cordoned
/// * `cordoned_by_us` - Whether the cordon label is set
pub fn agent_node(pool: &str, index: u64, unschedulable: bool, cordoned_by_us: bool) -> KubeNode {
    let raw = raw_node(pool, index, "Standard_D2_v2", unschedulable, cordoned_by_us);
    let mut node = KubeNode::new(&raw).unwrap();
    node.capacity = unit_capacity();
    node
}

/// Build a raw k8s pod
///
/// # Arguments
///
/// * `name` - The pod name
/// * `cpu` - The cpu request as a quantity string
/// * `phase` - The pod phase
/// * `node_name` - The node the pod is assigned to
/// * `daemonset` - Whether the pod is owned by a daemonset
pub fn raw_pod(
    name: &str,
    cpu: &str,
    phase: &str,
    node_name: Option<&str>,
    daemonset: bool,
) -> Pod {
    let mut requests = BTreeMap::new();
    requests.insert("cpu".to_owned(), Quantity(cpu.to_owned()));
    let owners = daemonset.then(|| {
        vec![OwnerReference {
            api_version: "apps/v1".to_owned(),
            kind: "DaemonSet".to_owned(),
            name: format!("{}-owner", name),
            uid: format!("{}-owner-uid", name),
            ..Default::default()
        }]
    });
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            namespace: Some("default".to_owned()),
            uid: Some(format!("{}-uid", name)),
            owner_references: owners,
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "main".to_owned(),
                resources: Some(ResourceRequirements {
                    requests: Some(requests),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            node_name: node_name.map(str::to_owned),
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some(phase.to_owned()),
            ..Default::default()
        }),
    }
}

/// Build a pending unassigned pod model
///
/// # Arguments
///
/// * `name` - The pod name
/// * `cpu` - The cpu request in cores
pub fn pending_pod(name: &str, cpu: f64) -> KubePod {
    KubePod::new(&raw_pod(name, &cpu.to_string(), "Pending", None, false)).unwrap()
}

/// Build a running pod model assigned to a node
///
/// # Arguments
///
/// * `name` - The pod name
/// * `cpu` - The cpu request in cores
/// * `node` - The node the pod runs on
pub fn running_pod(name: &str, cpu: f64, node: &str) -> KubePod {
    KubePod::new(&raw_pod(name, &cpu.to_string(), "Running", Some(node), false)).unwrap()
}

/// Build the acs-engine shaped template the transformer expects
///
/// # Arguments
///
/// * `pools` - The pool names to generate resources for
pub fn sample_template(pools: &[&str]) -> Value {
    let mut resources = vec![
        json!({
            "type": "Microsoft.Network/networkSecurityGroups",
            "name": "[variables('nsgName')]",
            "apiVersion": "2016-03-30",
            "properties": {}
        }),
        json!({
            "type": "Microsoft.Network/virtualNetworks",
            "name": "[variables('virtualNetworkName')]",
            "apiVersion": "2016-03-30",
            "dependsOn": [
                "[concat('Microsoft.Network/networkSecurityGroups/', variables('nsgName'))]"
            ],
            "properties": {}
        }),
        json!({
            "type": "Microsoft.Compute/virtualMachines",
            "name": "[concat(variables('masterVMNamePrefix'), copyIndex(variables('masterOffset')))]",
            "copy": {"count": "[variables('masterCount')]", "name": "vmLoopNode"},
            "properties": {}
        }),
        json!({
            "type": "Microsoft.Compute/virtualMachines/extensions",
            "name": "[concat(variables('masterVMNamePrefix'), copyIndex(variables('masterOffset')),'/cse', copyIndex(variables('masterOffset')))]",
            "copy": {"count": "[variables('masterCount')]", "name": "vmLoopNode"},
            "properties": {}
        }),
    ];
    for pool in pools {
        resources.push(json!({
            "type": "Microsoft.Storage/storageAccounts",
            "name": format!("[concat(variables('storageAccountPrefixes')[0], variables('{}AccountName'))]", pool),
            "copy": {"count": format!("[variables('{}StorageAccountsCount')]", pool), "name": "loop"},
            "properties": {}
        }));
        resources.push(json!({
            "type": "Microsoft.Compute/availabilitySets",
            "name": format!("[variables('{}AvailabilitySet')]", pool),
            "properties": {}
        }));
        resources.push(json!({
            "type": "Microsoft.Network/networkInterfaces",
            "name": format!("[concat(variables('{}VMNamePrefix'), 'nic-', copyIndex(variables('{}Offset')))]", pool, pool),
            "copy": {"count": format!("[sub(variables('{}Count'), variables('{}Offset'))]", pool, pool), "name": "loop"},
            "dependsOn": [
                "[concat('Microsoft.Network/networkSecurityGroups/', variables('nsgName'))]",
                "[variables('vnetID')]"
            ],
            "properties": {
                "ipConfigurations": [{
                    "name": format!("[concat('ipconfig', copyIndex(variables('{}Offset')))]", pool)
                }]
            }
        }));
        resources.push(json!({
            "type": "Microsoft.Compute/virtualMachines",
            "name": format!("[concat(variables('{}VMNamePrefix'), copyIndex(variables('{}Offset')))]", pool, pool),
            "copy": {"count": format!("[sub(variables('{}Count'), variables('{}Offset'))]", pool, pool), "name": "vmLoopNode"},
            "dependsOn": [
                format!("[concat('Microsoft.Network/networkInterfaces/', variables('{}VMNamePrefix'), 'nic-', copyIndex(variables('{}Offset')))]", pool, pool)
            ],
            "properties": {
                "osProfile": {
                    "computerName": format!("[concat(variables('{}VMNamePrefix'), copyIndex(variables('{}Offset')))]", pool, pool)
                }
            }
        }));
        resources.push(json!({
            "type": "Microsoft.Compute/virtualMachines/extensions",
            "name": format!("[concat(variables('{}VMNamePrefix'), copyIndex(variables('{}Offset')),'/cse', copyIndex(variables('{}Offset')))]", pool, pool, pool),
            "copy": {"count": format!("[sub(variables('{}Count'), variables('{}Offset'))]", pool, pool), "name": "vmLoopNode"},
            "properties": {}
        }));
    }
    json!({
        "$schema": "https://schema.management.azure.com/schemas/2015-01-01/deploymentTemplate.json#",
        "contentVersion": "1.0.0.0",
        "parameters": {},
        "variables": {},
        "resources": resources,
        "outputs": {
            "masterFQDN": {"type": "string", "value": "[reference(variables('masterFQDN')).dnsSettings.fqdn]"}
        }
    })
}

/// Build deployment parameters declaring the given pools
///
/// # Arguments
///
/// * `pools` - Pool name and instance type pairs
pub fn sample_parameters(pools: &[(&str, &str)]) -> Value {
    let mut parameters = serde_json::Map::new();
    parameters.insert("masterVMSize".to_owned(), json!({"value": "Standard_D2_v2"}));
    for (pool, instance_type) in pools {
        parameters.insert(format!("{}VMSize", pool), json!({"value": instance_type}));
        parameters.insert(format!("{}Count", pool), json!({"value": 1}));
        parameters.insert(format!("{}Offset", pool), json!({"value": 0}));
    }
    Value::Object(parameters)
}

/// A cluster view that records every mutation instead of performing it
#[derive(Default)]
pub struct MockCluster {
    /// The nodes to return from listings
    pub nodes: Mutex<Vec<Node>>,
    /// The pods to return from listings
    pub pods: Mutex<Vec<Pod>>,
    /// Every node patch that was applied
    pub patches: Mutex<Vec<(String, Value)>>,
    /// Every pod eviction that was requested
    pub evictions: Mutex<Vec<String>>,
    /// Every node object that was deleted
    pub deleted_nodes: Mutex<Vec<String>>,
}

impl MockCluster {
    /// Build an empty mock cluster
    pub fn new() -> Self {
        MockCluster::default()
    }

    /// Build a mock cluster with canned nodes and pods
    ///
    /// # Arguments
    ///
    /// * `nodes` - The nodes to list
    /// * `pods` - The pods to list
    pub fn with_state(nodes: Vec<Node>, pods: Vec<Pod>) -> Self {
        MockCluster {
            nodes: Mutex::new(nodes),
            pods: Mutex::new(pods),
            ..Default::default()
        }
    }
}

#[async_trait::async_trait]
impl ClusterView for MockCluster {
    async fn list_nodes(&self) -> Result<Vec<Node>, Error> {
        Ok(self.nodes.lock().unwrap().clone())
    }

    async fn list_pods(&self) -> Result<Vec<Pod>, Error> {
        Ok(self.pods.lock().unwrap().clone())
    }

    async fn patch_node(&self, name: &str, patch: Value) -> Result<(), Error> {
        self.patches.lock().unwrap().push((name.to_owned(), patch));
        Ok(())
    }

    async fn evict_pod(&self, namespace: &str, name: &str) -> Result<(), Error> {
        self.evictions
            .lock()
            .unwrap()
            .push(format!("{}/{}", namespace, name));
        Ok(())
    }

    async fn delete_node(&self, name: &str) -> Result<(), Error> {
        self.deleted_nodes.lock().unwrap().push(name.to_owned());
        Ok(())
    }
}

/// A cloud provider that records every call instead of performing it
pub struct MockCloud {
    /// The template returned from downloads
    pub template: Value,
    /// The parameters returned from downloads
    pub parameters: Value,
    /// Every deployment that was submitted
    pub deployments: Mutex<Vec<(String, Value)>>,
    /// Every raw resource that was deleted, as type/name pairs
    pub deleted_resources: Mutex<Vec<String>>,
    /// Every managed disk that was deleted
    pub deleted_disks: Mutex<Vec<String>>,
    /// Every blob that was deleted
    pub deleted_blobs: Mutex<Vec<String>>,
    /// VM documents to hand out by name
    pub vms: Mutex<HashMap<String, Value>>,
    /// How many transient failures blob deletes should hit first
    pub blob_failures: Mutex<usize>,
    /// An artificial pause before a deployment completes
    pub deploy_pause: Option<Duration>,
}

impl MockCloud {
    /// Build a mock cloud serving the given template and parameters
    ///
    /// # Arguments
    ///
    /// * `template` - The template downloads return
    /// * `parameters` - The parameters downloads return
    pub fn new(template: Value, parameters: Value) -> Self {
        MockCloud {
            template,
            parameters,
            deployments: Mutex::new(Vec::new()),
            deleted_resources: Mutex::new(Vec::new()),
            deleted_disks: Mutex::new(Vec::new()),
            deleted_blobs: Mutex::new(Vec::new()),
            vms: Mutex::new(HashMap::new()),
            blob_failures: Mutex::new(0),
            deploy_pause: None,
        }
    }

    /// Serve a VHD backed VM document for a node
    ///
    /// # Arguments
    ///
    /// * `node` - The node name
    /// * `account` - The storage account of the VHD
    pub fn with_vhd_vm(&self, node: &str, account: &str) {
        let vm = json!({"properties": {"storageProfile": {"osDisk": {
            "vhd": {"uri": format!("https://{}.blob.core.windows.net/vhds/{}-osdisk.vhd", account, node)}
        }}}});
        self.vms.lock().unwrap().insert(node.to_owned(), vm);
    }
}

#[async_trait::async_trait]
impl CloudProvider for MockCloud {
    async fn download_template(&self, _group: &str, _deployment: &str) -> Result<Value, Error> {
        Ok(self.template.clone())
    }

    async fn download_parameters(&self, _group: &str, _deployment: &str) -> Result<Value, Error> {
        Ok(self.parameters.clone())
    }

    async fn create_deployment(
        &self,
        _group: &str,
        name: &str,
        properties: Value,
    ) -> Result<(), Error> {
        if let Some(pause) = self.deploy_pause {
            tokio::time::sleep(pause).await;
        }
        self.deployments
            .lock()
            .unwrap()
            .push((name.to_owned(), properties));
        Ok(())
    }

    async fn get_virtual_machine(&self, _group: &str, name: &str) -> Result<Value, Error> {
        if let Some(vm) = self.vms.lock().unwrap().get(name) {
            return Ok(vm.clone());
        }
        // default to a managed disk VM
        Ok(json!({"properties": {"storageProfile": {"osDisk": {
            "name": format!("{}-osdisk", name),
            "managedDisk": {"id": format!("/disks/{}-osdisk", name)}
        }}}}))
    }

    async fn delete_resource(
        &self,
        _group: &str,
        _provider: &str,
        kind: &str,
        name: &str,
        _api_version: &str,
    ) -> Result<(), Error> {
        self.deleted_resources
            .lock()
            .unwrap()
            .push(format!("{}/{}", kind, name));
        Ok(())
    }

    async fn delete_managed_disk(&self, _group: &str, name: &str) -> Result<(), Error> {
        self.deleted_disks.lock().unwrap().push(name.to_owned());
        Ok(())
    }

    async fn list_storage_keys(&self, _group: &str, _account: &str) -> Result<String, Error> {
        Ok("dGVzdC1rZXk=".to_owned())
    }

    async fn delete_blob(
        &self,
        _account: &str,
        _key: &str,
        container: &str,
        blob: &str,
    ) -> Result<(), Error> {
        // serve the injected transient failures first
        {
            let mut failures = self.blob_failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(Error::Azure {
                    code: reqwest::StatusCode::SERVICE_UNAVAILABLE,
                    msg: Some("try again".to_owned()),
                });
            }
        }
        self.deleted_blobs
            .lock()
            .unwrap()
            .push(format!("{}/{}", container, blob));
        Ok(())
    }
}

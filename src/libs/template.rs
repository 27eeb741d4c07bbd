//! Transformations over the acs-engine ARM template
//!
//! The stock template enumerates each pools VMs with an ARM `copy` loop over
//! `copyIndex(<pool>Offset)..copyIndex+Count-1`. Incremental deployments
//! cannot skip indices, so once scale in has made the live index set sparse a
//! plain Count bump would collide with deleted VMs. These transforms convert
//! the count indexed resources into one explicit resource per new index,
//! computed against the observed live index set.
//!
//! Every transform is pure over an in memory template value: callers get a
//! fresh deep copy and the input is never mutated.

use serde_json::Value;
use std::collections::BTreeMap;

use super::errors::Error;
use super::models::AgentPool;

/// The variable suffixes that tie a template resource name to a pool
const POOL_VARIABLE_SUFFIXES: [&str; 6] = [
    "VMNamePrefix'",
    "Offset'",
    "AvailabilitySet'",
    "StorageAccountOffset'",
    "AccountName'",
    "Count'",
];

/// Compute the indices the new nodes of a pool will occupy
///
/// Walks up from zero skipping live indices until enough free slots are
/// found, so the new set is always the numerically smallest one. A target at
/// or below the current size yields no indices.
///
/// # Arguments
///
/// * `pool` - The pool being grown
/// * `target` - The desired pool size
pub fn new_node_indexes(pool: &AgentPool, target: u64) -> Vec<u64> {
    let need = target.saturating_sub(pool.actual_capacity());
    let mut indexes = Vec::with_capacity(need as usize);
    let mut idx = 0;
    while (indexes.len() as u64) < need {
        if !pool.has_node_with_index(idx) {
            indexes.push(idx);
        }
        idx += 1;
    }
    indexes
}

/// Get a mutable handle on the resources array of a template
///
/// # Arguments
///
/// * `template` - The template to crack open
fn resources_mut(template: &mut Value) -> Result<&mut Vec<Value>, Error> {
    template
        .get_mut("resources")
        .and_then(|resources| resources.as_array_mut())
        .ok_or_else(|| Error::TemplateShape("Template has no resources array".to_owned()))
}

/// Get the name of a template resource
///
/// # Arguments
///
/// * `resource` - The resource to name
fn resource_name(resource: &Value) -> &str {
    resource.get("name").and_then(|name| name.as_str()).unwrap_or("")
}

/// Get the type of a template resource
///
/// # Arguments
///
/// * `resource` - The resource to type
fn resource_type(resource: &Value) -> &str {
    resource.get("type").and_then(|kind| kind.as_str()).unwrap_or("")
}

/// Remove and return the first resource matching a predicate
///
/// # Arguments
///
/// * `template` - The template to take the resource from
/// * `pred` - The predicate identifying the resource
/// * `what` - A description used when the resource is missing
fn take_resource<F: Fn(&Value) -> bool>(
    template: &mut Value,
    pred: F,
    what: &str,
) -> Result<Value, Error> {
    let resources = resources_mut(template)?;
    match resources.iter().position(|resource| pred(resource)) {
        Some(pos) => Ok(resources.remove(pos)),
        None => Err(Error::TemplateShape(format!(
            "Could not find the {} resource for the specified agent pool",
            what
        ))),
    }
}

/// Clone an anchor resource once per index, substituting the copy expression
///
/// # Arguments
///
/// * `anchor` - The count indexed resource to clone
/// * `pool` - The pool the resource belongs to
/// * `index` - The literal index to substitute
/// * `name` - The explicit name for the cloned resource
fn instantiate_for_index(
    anchor: &Value,
    pool: &str,
    index: u64,
    name: String,
) -> Result<Value, Error> {
    let mut clone = anchor.clone();
    // the clone is a singular resource so the copy loop goes away
    if let Some(map) = clone.as_object_mut() {
        map.remove("copy");
        map.insert("name".to_owned(), Value::String(name));
    }
    // replace every remaining copyIndex reference with the literal index
    let needle = format!("copyIndex(variables('{}Offset'))", pool);
    let serial = serde_json::to_string(&clone)?;
    let serial = serial.replace(&needle, &index.to_string());
    let clone = serde_json::from_str(&serial)?;
    Ok(clone)
}

/// Unroll a pools count indexed virtual machine resource into explicit ones
///
/// # Arguments
///
/// * `template` - The template to transform in place
/// * `pool` - The pool being grown
/// * `indexes` - The indices the new nodes will occupy
pub fn unroll_vm(template: &mut Value, pool: &AgentPool, indexes: &[u64]) -> Result<(), Error> {
    let anchor_name = format!(
        "[concat(variables('{}VMNamePrefix'), copyIndex(variables('{}Offset')))]",
        pool.name, pool.name
    );
    let anchor = take_resource(
        template,
        |resource| resource_name(resource) == anchor_name,
        "virtualMachines",
    )?;
    for index in indexes {
        let name = format!("[concat(variables('{}VMNamePrefix'), {})]", pool.name, index);
        let clone = instantiate_for_index(&anchor, &pool.name, *index, name)?;
        resources_mut(template)?.insert(0, clone);
    }
    Ok(())
}

/// Unroll a pools count indexed VM extension resource into explicit ones
///
/// # Arguments
///
/// * `template` - The template to transform in place
/// * `pool` - The pool being grown
/// * `indexes` - The indices the new nodes will occupy
pub fn unroll_vm_extension(
    template: &mut Value,
    pool: &AgentPool,
    indexes: &[u64],
) -> Result<(), Error> {
    let anchor_name = format!(
        "[concat(variables('{}VMNamePrefix'), copyIndex(variables('{}Offset')),'/cse', copyIndex(variables('{}Offset')))]",
        pool.name, pool.name, pool.name
    );
    let anchor = take_resource(
        template,
        |resource| resource_name(resource) == anchor_name,
        "virtualMachines/extensions",
    )?;
    for index in indexes {
        let name = format!(
            "[concat(variables('{}VMNamePrefix'), {},'/cse', {})]",
            pool.name, index, index
        );
        let clone = instantiate_for_index(&anchor, &pool.name, *index, name)?;
        resources_mut(template)?.insert(0, clone);
    }
    Ok(())
}

/// Unroll a pools count indexed NIC resource into explicit ones
///
/// # Arguments
///
/// * `template` - The template to transform in place
/// * `pool` - The pool being grown
/// * `indexes` - The indices the new nodes will occupy
pub fn unroll_nic(template: &mut Value, pool: &AgentPool, indexes: &[u64]) -> Result<(), Error> {
    // NIC names carry the nic infix before the copy index so the anchor is
    // found by prefix rather than the full expression
    let anchor_prefix = format!("[concat(variables('{}VMNamePrefix'), 'nic-'", pool.name);
    let anchor = take_resource(
        template,
        |resource| resource_name(resource).starts_with(&anchor_prefix),
        "networkInterfaces",
    )?;
    for index in indexes {
        let name = format!(
            "[concat(variables('{}VMNamePrefix'), 'nic-', {})]",
            pool.name, index
        );
        let clone = instantiate_for_index(&anchor, &pool.name, *index, name)?;
        resources_mut(template)?.insert(0, clone);
    }
    Ok(())
}

/// Whether a resource name textually identifies a pool
///
/// Matched on the full variable names so that pools whose name is a prefix
/// of another pools name never collide.
///
/// # Arguments
///
/// * `name` - The resource name expression to check
/// * `pool` - The pool name to look for
fn identifies_pool(name: &str, pool: &str) -> bool {
    POOL_VARIABLE_SUFFIXES
        .iter()
        .any(|suffix| name.contains(&format!("variables('{}{}", pool, suffix)))
}

/// Delete every NIC/availability set/storage/VM/extension resource of the
/// given pools so an incremental deployment carries no operations for them
///
/// # Arguments
///
/// * `template` - The template to transform in place
/// * `pools` - The names of the pools to prune
pub fn delete_pool_resources(template: &mut Value, pools: &[&str]) -> Result<(), Error> {
    let resources = resources_mut(template)?;
    resources.retain(|resource| {
        let name = resource_name(resource);
        !pools.iter().any(|pool| identifies_pool(name, pool))
    });
    Ok(())
}

/// Remove the network security group and the dependencies pointing at it
///
/// acs-engine re-creates the NSG on incremental updates which races against
/// rules added out of band, so re-deployments never carry it.
///
/// # Arguments
///
/// * `template` - The template to transform in place
pub fn delete_nsg(template: &mut Value) -> Result<(), Error> {
    let resources = resources_mut(template)?;
    // drop the NSG resource itself
    resources.retain(|resource| {
        resource_type(resource) != "Microsoft.Network/networkSecurityGroups"
    });
    // scrub any dependsOn reference to it from vnet and NIC resources
    for resource in resources.iter_mut() {
        let kind = resource_type(resource).to_owned();
        if kind == "Microsoft.Network/virtualNetworks"
            || kind == "Microsoft.Network/networkInterfaces"
        {
            if let Some(depends) = resource
                .get_mut("dependsOn")
                .and_then(|depends| depends.as_array_mut())
            {
                depends.retain(|dep| {
                    !dep.as_str()
                        .map(|dep| dep.contains("networkSecurityGroups"))
                        .unwrap_or(false)
                });
            }
        }
    }
    Ok(())
}

/// Remove the outputs section, which a re-deployment has no use for
///
/// # Arguments
///
/// * `template` - The template to transform in place
pub fn delete_outputs(template: &mut Value) {
    if let Some(map) = template.as_object_mut() {
        map.remove("outputs");
    }
}

/// Remove the master VM extension so a re-deployment never re-runs the
/// master boot provisioning
///
/// # Arguments
///
/// * `template` - The template to copy and transform
pub fn delete_master_vm_extension(template: &Value) -> Result<Value, Error> {
    let mut template = template.clone();
    let resources = resources_mut(&mut template)?;
    resources.retain(|resource| {
        !(resource_type(resource) == "Microsoft.Compute/virtualMachines/extensions"
            && resource_name(resource).contains("variables('masterVMNamePrefix')"))
    });
    Ok(template)
}

/// Build the template for a scale out deployment
///
/// Pools growing past their observed size have their NIC/VM/extension
/// resources unrolled over the new indices; pools being shrunk are excised
/// entirely; pools staying at their observed size keep their resources
/// untouched so the transform round-trips.
///
/// # Arguments
///
/// * `template` - The downloaded cluster template
/// * `pools` - All agent pools observed this tick
/// * `new_sizes` - The desired size for each pool
pub fn prepare_scale_out(
    template: &Value,
    pools: &[AgentPool],
    new_sizes: &BTreeMap<String, u64>,
) -> Result<Value, Error> {
    // deep copy so the callers template survives for the next tick
    let mut template = template.clone();
    delete_nsg(&mut template)?;
    // prune the pools that are shrinking before unrolling the growing ones
    let pruned = pools
        .iter()
        .filter(|pool| {
            new_sizes
                .get(&pool.name)
                .map(|size| *size < pool.actual_capacity())
                .unwrap_or(false)
        })
        .map(|pool| pool.name.as_str())
        .collect::<Vec<&str>>();
    if !pruned.is_empty() {
        delete_pool_resources(&mut template, &pruned)?;
    }
    // unroll every growing pool over its new indices
    for pool in pools {
        let target = match new_sizes.get(&pool.name) {
            Some(target) => *target,
            None => continue,
        };
        if target <= pool.actual_capacity() {
            continue;
        }
        let indexes = new_node_indexes(pool, target);
        unroll_nic(&mut template, pool, &indexes)?;
        unroll_vm(&mut template, pool, &indexes)?;
        unroll_vm_extension(&mut template, pool, &indexes)?;
    }
    delete_outputs(&mut template);
    Ok(template)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::libs::resources::Resource;
    use crate::libs::models::KubeNode;

    /// Build a bare node for index bookkeeping tests
    fn node(pool: &str, index: u64) -> KubeNode {
        KubeNode {
            name: format!("k8s-{}-16334397-{}", pool, index),
            pool_name: pool.to_owned(),
            index,
            instance_type: Some("Standard_D2_v2".to_owned()),
            labels: Default::default(),
            capacity: Resource::new(),
            used_capacity: Resource::new(),
            unschedulable: false,
        }
    }

    fn pool_with(indexes: &[u64]) -> AgentPool {
        let nodes = indexes.iter().map(|idx| node("cpupool", *idx)).collect();
        AgentPool::new("cpupool", "Standard_D2_v2", Resource::new(), nodes)
    }

    #[test]
    fn new_indexes_fill_the_smallest_free_slots() {
        assert_eq!(new_node_indexes(&pool_with(&[0]), 2), vec![1]);
        assert_eq!(new_node_indexes(&pool_with(&[0, 2]), 3), vec![1]);
        assert_eq!(new_node_indexes(&pool_with(&[0, 1, 2]), 3), Vec::<u64>::new());
        assert_eq!(new_node_indexes(&pool_with(&[4]), 5), vec![0, 1, 2, 3]);
        assert_eq!(new_node_indexes(&pool_with(&[2]), 5), vec![0, 1, 3, 4]);
        assert_eq!(new_node_indexes(&pool_with(&[2, 4]), 5), vec![0, 1, 3]);
    }

    #[test]
    fn new_indexes_ignore_shrinking_targets() {
        assert_eq!(new_node_indexes(&pool_with(&[0, 1, 2]), 0), Vec::<u64>::new());
    }

    #[test]
    fn pool_identification_is_prefix_safe() {
        let name = "[concat(variables('agentpool10VMNamePrefix'), 0)]";
        assert!(identifies_pool(name, "agentpool10"));
        assert!(!identifies_pool(name, "agentpool1"));
    }
}

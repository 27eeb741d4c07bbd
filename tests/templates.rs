//! Template transformation scenarios against the acs-engine template shape

use serde_json::Value;
use std::collections::BTreeMap;

use acs_engine_autoscaler::libs::models::AgentPool;
use acs_engine_autoscaler::libs::template;
use acs_engine_autoscaler::test_utilities::{agent_node, sample_template, unit_capacity};

/// Build a pool holding nodes at the given indexes
fn pool_with(name: &str, indexes: &[u64]) -> AgentPool {
    let nodes = indexes.iter().map(|idx| agent_node(name, *idx, false, false)).collect();
    AgentPool::new(name, "Standard_D2_v2", unit_capacity(), nodes)
}

/// Collect the resource names of a template
fn resource_names(template: &Value) -> Vec<String> {
    template["resources"]
        .as_array()
        .unwrap()
        .iter()
        .map(|resource| resource["name"].as_str().unwrap_or("").to_owned())
        .collect()
}

/// Count the resources whose serialized form mentions a pool
fn resources_mentioning(template: &Value, pool: &str) -> usize {
    template["resources"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|resource| serde_json::to_string(resource).unwrap().contains(pool))
        .count()
}

#[test]
fn sparse_indexes_unroll_into_explicit_resources() {
    // live indices {2, 4} growing to 5 must fill 0, 1 and 3
    let template = sample_template(&["cpupool"]);
    let pool = pool_with("cpupool", &[2, 4]);
    let mut sizes = BTreeMap::new();
    sizes.insert("cpupool".to_owned(), 5);
    let out = template::prepare_scale_out(&template, &[pool], &sizes).unwrap();
    let names = resource_names(&out);
    // three explicit VMs named over the free indices
    for idx in [0, 1, 3] {
        let expected = format!("[concat(variables('cpupoolVMNamePrefix'), {})]", idx);
        assert!(names.contains(&expected), "missing VM {}", expected);
        let nic = format!("[concat(variables('cpupoolVMNamePrefix'), 'nic-', {})]", idx);
        assert!(names.contains(&nic), "missing NIC {}", nic);
        let ext = format!(
            "[concat(variables('cpupoolVMNamePrefix'), {},'/cse', {})]",
            idx, idx
        );
        assert!(names.contains(&ext), "missing extension {}", ext);
    }
    // no copy loop for the pool survives, anywhere in the document
    let serial = serde_json::to_string(&out).unwrap();
    assert!(!serial.contains("copyIndex(variables('cpupoolOffset'))"));
    // unrolled resources must not carry a copy element; storage accounts
    // are allowed to keep their count loop
    for resource in out["resources"].as_array().unwrap() {
        let name = resource["name"].as_str().unwrap_or("");
        if name.contains("cpupoolVMNamePrefix") {
            assert!(resource.get("copy").is_none(), "{} still has a copy loop", name);
        }
    }
    // the master copy loops are untouched
    assert!(serial.contains("copyIndex(variables('masterOffset'))"));
}

#[test]
fn copy_index_is_substituted_inside_resource_bodies() {
    let template = sample_template(&["cpupool"]);
    let pool = pool_with("cpupool", &[]);
    let mut sizes = BTreeMap::new();
    sizes.insert("cpupool".to_owned(), 1);
    let out = template::prepare_scale_out(&template, &[pool], &sizes).unwrap();
    // the VM dependsOn and computerName carry the literal index now
    let vm = out["resources"]
        .as_array()
        .unwrap()
        .iter()
        .find(|resource| {
            resource["name"] == "[concat(variables('cpupoolVMNamePrefix'), 0)]"
        })
        .expect("unrolled VM missing");
    let serial = serde_json::to_string(vm).unwrap();
    assert!(serial.contains("'nic-', 0)"));
    assert!(!serial.contains("copyIndex"));
}

#[test]
fn unchanged_pools_round_trip() {
    // a pool already at its target keeps its resources; only the NSG and
    // outputs disappear
    let template = sample_template(&["cpupool"]);
    let before = template["resources"].as_array().unwrap().len();
    let pool = pool_with("cpupool", &[0, 1]);
    let mut sizes = BTreeMap::new();
    sizes.insert("cpupool".to_owned(), 2);
    let out = template::prepare_scale_out(&template, &[pool], &sizes).unwrap();
    let after = out["resources"].as_array().unwrap().len();
    assert_eq!(after, before - 1, "only the NSG should be gone");
    assert!(out.get("outputs").is_none());
    // the pools copy loops survive untouched
    let serial = serde_json::to_string(&out).unwrap();
    assert!(serial.contains("copyIndex(variables('cpupoolOffset'))"));
}

#[test]
fn shrinking_pools_are_excised() {
    // a pool going to zero must leave no trace in the deployment
    let template = sample_template(&["poolx", "agentpool0"]);
    let poolx = pool_with("poolx", &[0, 1, 2]);
    let other = pool_with("agentpool0", &[0]);
    let mut sizes = BTreeMap::new();
    sizes.insert("poolx".to_owned(), 0);
    sizes.insert("agentpool0".to_owned(), 1);
    let out = template::prepare_scale_out(&template, &[poolx, other], &sizes).unwrap();
    assert_eq!(resources_mentioning(&out, "poolx"), 0);
    // the unchanged pool keeps its resources
    assert!(resources_mentioning(&out, "agentpool0") >= 4);
}

#[test]
fn missing_anchor_resources_fail_hard() {
    // a template without the pools VM resource cannot be transformed
    let mut template = sample_template(&[]);
    let pool = pool_with("cpupool", &[]);
    let err = template::unroll_vm(&mut template, &pool, &[0]).unwrap_err();
    assert_eq!(err.kind(), "TemplateShape");
    let err = template::unroll_nic(&mut template, &pool, &[0]).unwrap_err();
    assert_eq!(err.kind(), "TemplateShape");
    let err = template::unroll_vm_extension(&mut template, &pool, &[0]).unwrap_err();
    assert_eq!(err.kind(), "TemplateShape");
}

#[test]
fn nsg_deletion_scrubs_dependencies() {
    let mut template = sample_template(&["cpupool"]);
    template::delete_nsg(&mut template).unwrap();
    let serial = serde_json::to_string(&template).unwrap();
    // the resource is gone and nothing depends on it anymore
    assert!(!serial.contains("Microsoft.Network/networkSecurityGroups"));
    for resource in template["resources"].as_array().unwrap() {
        if let Some(depends) = resource.get("dependsOn").and_then(|deps| deps.as_array()) {
            for dep in depends {
                assert!(!dep.as_str().unwrap_or("").contains("networkSecurityGroups"));
            }
        }
    }
}

#[test]
fn master_extension_never_rides_a_redeployment() {
    let template = sample_template(&["cpupool"]);
    let out = template::delete_master_vm_extension(&template).unwrap();
    let names = resource_names(&out);
    // the extension is gone but the master VM itself survives
    assert!(!names
        .iter()
        .any(|name| name.contains("masterVMNamePrefix") && name.contains("cse")));
    assert!(names
        .iter()
        .any(|name| name.contains("masterVMNamePrefix")));
}

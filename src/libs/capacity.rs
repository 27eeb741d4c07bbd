//! The instance type capacity catalog
//!
//! The catalog document is a JSON object keyed by instance type, each value a
//! map of resource name to quantity. Its key order is meaningful: entries are
//! listed cheapest first and pools are scaled in that order.

use serde_json::Value;
use std::cmp::Ordering;

use super::conf::CapacityConf;
use super::errors::Error;
use super::models::{AgentPool, KubePod};
use super::resources::{parse_quantity, Resource};

/// The catalog of schedulable resources per instance type
#[derive(Debug, Clone, Default)]
pub struct CapacityCatalog {
    /// The instance types and their unit capacity, in cost ascending order
    entries: Vec<(String, Resource)>,
}

impl CapacityCatalog {
    /// Load the catalog from its json document
    ///
    /// # Arguments
    ///
    /// * `conf` - The capacity settings to load with
    pub fn load(conf: &CapacityConf) -> Result<Self, Error> {
        let raw = std::fs::read_to_string(&conf.data)?;
        Self::from_json(&raw, conf.cpu_reserve)
    }

    /// Build the catalog from a raw json document
    ///
    /// # Arguments
    ///
    /// * `raw` - The raw catalog json
    /// * `cpu_reserve` - The cpu cores to subtract from every entry
    pub fn from_json(raw: &str, cpu_reserve: f64) -> Result<Self, Error> {
        let doc: Value = serde_json::from_str(raw)?;
        let map = match doc.as_object() {
            Some(map) => map,
            None => return Err(Error::new("Capacity catalog must be a json object")),
        };
        let mut entries = Vec::with_capacity(map.len());
        // the serde_json map preserves insertion order, which is the cost order
        for (instance_type, spec) in map {
            let fields = match spec.as_object() {
                Some(fields) => fields,
                None => {
                    return Err(Error::new(format!(
                        "Capacity entry for {} must be a json object",
                        instance_type
                    )))
                }
            };
            let mut resource = Resource::new();
            for (name, value) in fields {
                // quantities may be written as numbers or suffixed strings
                let quantity = match value {
                    Value::Number(num) => num.as_f64().ok_or_else(|| {
                        Error::new(format!("Bad capacity number for {}", instance_type))
                    })?,
                    Value::String(raw) => parse_quantity(raw)?,
                    _ => {
                        return Err(Error::new(format!(
                            "Bad capacity value for {}/{}",
                            instance_type, name
                        )))
                    }
                };
                resource.add_quantity(name, quantity);
            }
            // account for the kubelet/system daemon overhead
            resource.add_quantity("cpu", -cpu_reserve);
            entries.push((instance_type.clone(), resource));
        }
        Ok(CapacityCatalog { entries })
    }

    /// Get the unit capacity of a single fresh node of an instance type
    ///
    /// # Arguments
    ///
    /// * `instance_type` - The instance type to look up
    pub fn capacity_of(&self, instance_type: &str) -> Result<&Resource, Error> {
        self.entries
            .iter()
            .find(|(name, _)| name == instance_type)
            .map(|(_, resource)| resource)
            .ok_or_else(|| Error::MissingInstanceType(instance_type.to_owned()))
    }

    /// The catalog position of an instance type, used as its cost rank
    ///
    /// # Arguments
    ///
    /// * `instance_type` - The instance type to rank
    pub fn cost_rank(&self, instance_type: &str) -> Option<usize> {
        self.entries.iter().position(|(name, _)| name == instance_type)
    }

    /// Sort pool indices into cost ascending order
    ///
    /// Unknown instance types sort last so a misconfigured pool is only used
    /// when nothing cheaper fits.
    ///
    /// # Arguments
    ///
    /// * `pools` - The agent pools to order
    pub fn order_by_cost_asc(&self, pools: &[AgentPool]) -> Vec<usize> {
        let mut order = (0..pools.len()).collect::<Vec<usize>>();
        order.sort_by(|left, right| {
            let left_rank = self.cost_rank(&pools[*left].instance_type);
            let right_rank = self.cost_rank(&pools[*right].instance_type);
            match (left_rank, right_rank) {
                (Some(l), Some(r)) => l.cmp(&r),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            }
        });
        order
    }

    /// Whether a pod could fit on a fresh node of at least one pool
    ///
    /// # Arguments
    ///
    /// * `pod` - The pending pod to check
    /// * `pools` - The agent pools the pod could land in
    pub fn is_possible(&self, pod: &KubePod, pools: &[AgentPool]) -> bool {
        pools.iter().any(|pool| {
            (pool.unit_capacity.clone() - &pod.resources).possible()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"{
        "Standard_D1_v2": {"cpu": "1", "memory": "3584Mi", "pods": 110},
        "Standard_D2_v2": {"cpu": "2", "memory": "7168Mi", "pods": 110},
        "Standard_NC6": {"cpu": "6", "memory": "56Gi", "pods": 110, "gpu": 1}
    }"#;

    #[test]
    fn loads_entries_in_document_order() {
        let catalog = CapacityCatalog::from_json(CATALOG, 0.0).unwrap();
        assert_eq!(catalog.cost_rank("Standard_D1_v2"), Some(0));
        assert_eq!(catalog.cost_rank("Standard_D2_v2"), Some(1));
        assert_eq!(catalog.cost_rank("Standard_NC6"), Some(2));
        assert_eq!(catalog.cost_rank("Standard_F4"), None);
    }

    #[test]
    fn cpu_reserve_is_subtracted() {
        let catalog = CapacityCatalog::from_json(CATALOG, 0.2).unwrap();
        let unit = catalog.capacity_of("Standard_D2_v2").unwrap();
        assert!((unit.get("cpu") - 1.8).abs() < 1e-9);
        assert_eq!(unit.get("pods"), 110.0);
    }

    #[test]
    fn missing_instance_type_errors() {
        let catalog = CapacityCatalog::from_json(CATALOG, 0.0).unwrap();
        let err = catalog.capacity_of("Standard_F4").unwrap_err();
        assert_eq!(err.kind(), "MissingInstanceType");
    }
}

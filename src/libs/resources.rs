//! Multiset arithmetic over Kubernetes resource quantities
//!
//! Every pod request and node capacity is folded into a [`Resource`], a map
//! from resource name (cpu, memory, pods, gpu, ...) to a scalar. The scaler
//! only ever asks two questions of these maps: can this fit (`possible`) and
//! which of two bundles is bigger (`dominance`).

use regex::Regex;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Add, Mul, Sub};

use super::errors::Error;

/// Tolerance when deciding whether a component is still non-negative, since
/// repeated add/subtract on f64 quantities accumulates rounding noise
const EPSILON: f64 = 1e-9;

/// Get the multiplier for a Kubernetes/SI quantity suffix
///
/// The power of two suffixes (Ki..Ei) are the kube specific additions to the
/// standard SI table.
///
/// # Arguments
///
/// * `suffix` - The quantity suffix to look up
fn suffix_multiplier(suffix: &str) -> Option<f64> {
    let mult = match suffix {
        "y" => 1e-24,
        "z" => 1e-21,
        "a" => 1e-18,
        "f" => 1e-15,
        "p" => 1e-12,
        "n" => 1e-9,
        "u" => 1e-6,
        "m" => 1e-3,
        "c" => 1e-2,
        "d" => 1e-1,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        "Z" => 1e21,
        "Y" => 1e24,
        "Ki" => (1u64 << 10) as f64,
        "Mi" => (1u64 << 20) as f64,
        "Gi" => (1u64 << 30) as f64,
        "Ti" => (1u64 << 40) as f64,
        "Pi" => (1u64 << 50) as f64,
        "Ei" => (1u64 << 60) as f64,
        _ => return None,
    };
    Some(mult)
}

/// Parse a Kubernetes quantity string with an optional SI suffix
///
/// # Arguments
///
/// * `raw` - The raw quantity string (e.g. "500m", "4Gi", "110")
pub fn parse_quantity(raw: &str) -> Result<f64, Error> {
    // bare numbers (including floats) are already unitless
    if let Ok(value) = raw.parse::<f64>() {
        return Ok(value);
    }
    // split the digits from the suffix; two character binary suffixes first
    // so that "1Ki" does not parse as kilo followed by a stray 'i'
    let pattern = Regex::new(r"^(\d+)(Ki|Mi|Gi|Ti|Pi|Ei|[yzafpnumcdkMGTPEZY])?$")?;
    let captures = match pattern.captures(raw) {
        Some(captures) => captures,
        None => return Err(Error::new(format!("Unknown quantity: {}", raw))),
    };
    // parse the numeric part
    let num = captures[1].parse::<f64>().map_err(|err| {
        Error::new(format!("Failed to parse quantity {}: {}", raw, err))
    })?;
    // apply the suffix multiplier when one was given
    match captures.get(2) {
        Some(suffix) => match suffix_multiplier(suffix.as_str()) {
            Some(mult) => Ok(num * mult),
            None => Err(Error::new(format!("Unknown quantity suffix: {}", raw))),
        },
        None => Ok(num),
    }
}

/// A bundle of named resource quantities
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resource {
    /// The scalar value for each resource name
    raw: BTreeMap<String, f64>,
}

impl Resource {
    /// Create an empty resource bundle
    pub fn new() -> Self {
        Resource::default()
    }

    /// Set a single component of this bundle
    ///
    /// # Arguments
    ///
    /// * `name` - The resource name to set
    /// * `value` - The value to set it to
    pub fn set<T: Into<String>>(mut self, name: T, value: f64) -> Self {
        self.raw.insert(name.into(), value);
        self
    }

    /// Add a quantity onto a single component of this bundle
    ///
    /// # Arguments
    ///
    /// * `name` - The resource name to add to
    /// * `value` - The value to add
    pub fn add_quantity(&mut self, name: &str, value: f64) {
        *self.raw.entry(name.to_owned()).or_insert(0.0) += value;
    }

    /// Get a single component of this bundle
    ///
    /// # Arguments
    ///
    /// * `name` - The resource name to get
    pub fn get(&self, name: &str) -> f64 {
        self.raw.get(name).copied().unwrap_or(0.0)
    }

    /// Whether every component of this bundle is non-negative
    pub fn possible(&self) -> bool {
        self.raw.values().all(|value| *value >= -EPSILON)
    }

    /// Compare two bundles by how many components strictly exceed the other
    ///
    /// Counts, across all names present in either bundle, the components
    /// where self is strictly greater and those where it is strictly less;
    /// the sign of the difference decides the ordering.
    ///
    /// # Arguments
    ///
    /// * `other` - The bundle to compare against
    pub fn dominance(&self, other: &Resource) -> Ordering {
        let diff = self.clone() - other;
        let mut more = 0i64;
        let mut less = 0i64;
        for value in diff.raw.values() {
            if *value > EPSILON {
                more += 1;
            } else if *value < -EPSILON {
                less += 1;
            }
        }
        more.cmp(&less)
    }
}

impl Add<&Resource> for Resource {
    type Output = Resource;

    /// Componentwise sum over the union of resource names
    fn add(mut self, other: &Resource) -> Resource {
        for (name, value) in &other.raw {
            *self.raw.entry(name.clone()).or_insert(0.0) += value;
        }
        self
    }
}

impl Sub<&Resource> for Resource {
    type Output = Resource;

    /// Componentwise difference over the union of resource names
    fn sub(mut self, other: &Resource) -> Resource {
        for (name, value) in &other.raw {
            *self.raw.entry(name.clone()).or_insert(0.0) -= value;
        }
        self
    }
}

impl Mul<f64> for Resource {
    type Output = Resource;

    /// Scale every component of this bundle
    fn mul(mut self, multiplier: f64) -> Resource {
        for value in self.raw.values_mut() {
            *value *= multiplier;
        }
        self
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let parts = self
            .raw
            .iter()
            .map(|(name, value)| format!("{}: {}", name, value))
            .collect::<Vec<String>>();
        write!(f, "{{{}}}", parts.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_suffixed_quantities() {
        assert_eq!(parse_quantity("2").unwrap(), 2.0);
        assert_eq!(parse_quantity("0.5").unwrap(), 0.5);
        assert_eq!(parse_quantity("500m").unwrap(), 0.5);
        assert_eq!(parse_quantity("4Gi").unwrap(), 4.0 * 1024.0 * 1024.0 * 1024.0);
        assert_eq!(parse_quantity("2k").unwrap(), 2000.0);
        assert_eq!(parse_quantity("1Ki").unwrap(), 1024.0);
    }

    #[test]
    fn rejects_unknown_quantities() {
        assert!(parse_quantity("10Xi").is_err());
        assert!(parse_quantity("abc").is_err());
        assert!(parse_quantity("").is_err());
    }

    #[test]
    fn algebra_spans_the_union_of_names() {
        let left = Resource::new().set("cpu", 2.0).set("memory", 4096.0);
        let right = Resource::new().set("cpu", 0.5).set("gpu", 1.0);
        let sum = left.clone() + &right;
        assert_eq!(sum.get("cpu"), 2.5);
        assert_eq!(sum.get("memory"), 4096.0);
        assert_eq!(sum.get("gpu"), 1.0);
        let diff = left - &right;
        assert_eq!(diff.get("cpu"), 1.5);
        assert_eq!(diff.get("gpu"), -1.0);
        assert!(!diff.possible());
    }

    #[test]
    fn scaling_multiplies_every_component() {
        let unit = Resource::new().set("cpu", 2.0).set("pods", 110.0);
        let scaled = unit * 0.3;
        assert_eq!(scaled.get("cpu"), 0.6);
        assert_eq!(scaled.get("pods"), 33.0);
    }

    #[test]
    fn dominance_counts_components() {
        // self exceeds in cpu and gpu, other exceeds in memory only
        let left = Resource::new().set("cpu", 4.0).set("memory", 1000.0).set("gpu", 1.0);
        let right = Resource::new().set("cpu", 2.0).set("memory", 2000.0);
        assert_eq!(left.dominance(&right), Ordering::Greater);
        assert_eq!(right.dominance(&left), Ordering::Less);
        assert_eq!(left.dominance(&left.clone()), Ordering::Equal);
    }

    #[test]
    fn possible_tolerates_float_noise() {
        let unit = Resource::new().set("cpu", 0.3);
        let spent = unit.clone() - &Resource::new().set("cpu", 0.1);
        let spent = spent - &Resource::new().set("cpu", 0.2);
        assert!(spent.possible());
    }
}

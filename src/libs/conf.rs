//! The config for the autoscaler
//!
//! The command line carries the cluster/credential settings; this file holds
//! the tunables an operator rarely changes per invocation.

use serde::{Deserialize, Serialize};
use tracing_subscriber::filter::LevelFilter;

use super::errors::Error;

/// Helps serde default the capacity catalog path
fn default_capacity_data() -> String {
    "capacity.json".to_owned()
}

/// Helps serde default the catalog cpu reserve to no reservation
fn default_cpu_reserve() -> f64 {
    0.0
}

/// Helps serde default the pause after uncordoning a node to 10 seconds
fn default_reclaim_pause() -> u64 {
    10
}

/// The different log levels supported by the autoscaler
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Log nothing
    Off,
    /// Log at the error level
    Error,
    /// Log at the warn level
    Warn,
    /// Log at the info level
    Info,
    /// Log at the debug level
    Debug,
}

impl Default for LogLevel {
    /// Default to info level logs
    fn default() -> Self {
        LogLevel::Info
    }
}

impl LogLevel {
    /// Convert this log level to a tracing filter
    pub fn to_filter(self) -> LevelFilter {
        match self {
            LogLevel::Off => LevelFilter::OFF,
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
        }
    }

    /// Map the 0..3 verbosity selector from the command line onto a level
    ///
    /// # Arguments
    ///
    /// * `verbose` - The verbosity count passed on the command line
    pub fn from_verbosity(verbose: u8) -> Self {
        match verbose {
            0 => LogLevel::Error,
            1 => LogLevel::Warn,
            2 => LogLevel::Info,
            _ => LogLevel::Debug,
        }
    }
}

/// Settings for the instance type capacity catalog
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CapacityConf {
    /// The path to the capacity catalog json document
    #[serde(default = "default_capacity_data")]
    pub data: String,
    /// The cpu (in cores) reserved on every node for the kubelet and system
    /// daemons, subtracted from each catalog entry
    #[serde(default = "default_cpu_reserve")]
    pub cpu_reserve: f64,
}

impl Default for CapacityConf {
    fn default() -> Self {
        CapacityConf {
            data: default_capacity_data(),
            cpu_reserve: default_cpu_reserve(),
        }
    }
}

/// The config for the autoscaler
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Conf {
    /// The capacity catalog settings
    #[serde(default)]
    pub capacity: CapacityConf,
    /// The log level to use when the command line does not override it
    #[serde(default)]
    pub level: LogLevel,
    /// How long to pause after a successful uncordon so the scheduler can
    /// place pending pods on the reclaimed node
    #[serde(default = "default_reclaim_pause")]
    pub reclaim_pause: u64,
}

impl Conf {
    /// Load a config from a file, falling back to defaults when the file
    /// does not exist
    ///
    /// # Arguments
    ///
    /// * `path` - The path to load this config from
    pub fn new(path: &str) -> Result<Self, Error> {
        // build our config sources with the file being optional
        let conf = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .build()?;
        // deserialize our config
        let conf = conf.try_deserialize()?;
        Ok(conf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let conf = Conf::new("/nonexistent/autoscaler.yml").unwrap();
        assert_eq!(conf, Conf::default());
        assert_eq!(conf.capacity.data, "capacity.json");
        assert_eq!(conf.reclaim_pause, 10);
    }

    #[test]
    fn verbosity_maps_onto_levels() {
        assert_eq!(LogLevel::from_verbosity(0), LogLevel::Error);
        assert_eq!(LogLevel::from_verbosity(2), LogLevel::Info);
        assert_eq!(LogLevel::from_verbosity(3), LogLevel::Debug);
        assert_eq!(LogLevel::from_verbosity(9), LogLevel::Debug);
    }
}

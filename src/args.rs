use clap::Parser;
use std::collections::HashSet;

/// The command line args to pass to the autoscaler
#[derive(Parser, Debug, Clone)]
#[clap(version, author)]
pub struct Args {
    /// The path to load the config file from
    #[clap(short, long, default_value = "autoscaler.yml")]
    pub config: String,
    /// The name of the resource group hosting the acs-engine cluster
    #[clap(long)]
    pub resource_group: String,
    /// The name of the deployment the cluster was created from
    #[clap(long, default_value = "azuredeploy")]
    pub acs_deployment: String,
    /// Time in seconds between successive checks
    #[clap(long, default_value_t = 60)]
    pub sleep: u64,
    /// Full path to a kubeconfig file; when missing the in-cluster service
    /// account is used
    #[clap(long)]
    pub kubeconfig: Option<String>,
    /// The number of agents per pool that should always stay up
    #[clap(long, default_value_t = 1)]
    pub spare_agents: u64,
    /// The Azure service principal application id
    #[clap(long, env = "AZURE_SP_APP_ID")]
    pub service_principal_app_id: Option<String>,
    /// The Azure service principal secret
    #[clap(long, env = "AZURE_SP_SECRET", hide_env_values = true)]
    pub service_principal_secret: Option<String>,
    /// The Azure service principal tenant id
    #[clap(long, env = "AZURE_SP_TENANT_ID")]
    pub service_principal_tenant_id: Option<String>,
    /// The Azure subscription to operate on
    #[clap(long, env = "AZURE_SUBSCRIPTION_ID")]
    pub subscription_id: Option<String>,
    /// The value of the clientPrivateKey secure string parameter
    #[clap(long, env = "CLIENT_PRIVATE_KEY", hide_env_values = true)]
    pub client_private_key: Option<String>,
    /// The value of the caPrivateKey secure string parameter
    #[clap(long, env = "CA_PRIVATE_KEY", hide_env_values = true)]
    pub ca_private_key: Option<String>,
    /// Extra nodes added on top of the bin packed target
    #[clap(long, default_value_t = 0)]
    pub over_provision: u64,
    /// Seconds a node may sit under utilized before draining (informational)
    #[clap(long, default_value_t = 1500)]
    pub idle_threshold: u64,
    /// Seconds a fresh instance may take to join the cluster (informational)
    #[clap(long, default_value_t = 600)]
    pub instance_init_time: u64,
    /// Disable the scale up phase
    #[clap(long, default_value_t)]
    pub no_scale: bool,
    /// Disable the maintenance phase
    #[clap(long, default_value_t)]
    pub no_maintenance: bool,
    /// A comma delimited list of pools the autoscaler must never touch
    #[clap(long, default_value = "")]
    pub ignore_pools: String,
    /// A Slack webhook url to post scaling messages to
    #[clap(long, env = "SLACK_HOOK")]
    pub slack_hook: Option<String>,
    /// A Slack bot token to post scaling messages with
    #[clap(long, env = "SLACK_BOT_TOKEN", hide_env_values = true)]
    pub slack_bot_token: Option<String>,
    /// Compute and log decisions without performing any mutating call
    #[clap(long, default_value_t)]
    pub dry_run: bool,
    /// The log verbosity from 0 (errors only) to 3 (debug); defaults to the
    /// config file level
    #[clap(short, long)]
    pub verbose: Option<u8>,
    /// Let loop errors propagate instead of backing off
    #[clap(long, default_value_t)]
    pub debug: bool,
}

impl Args {
    /// The set of pool names the autoscaler must never touch
    pub fn ignored_pools(&self) -> HashSet<String> {
        self.ignore_pools
            .split(',')
            .filter(|name| !name.is_empty())
            .map(str::to_owned)
            .collect()
    }
}

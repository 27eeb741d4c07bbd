use clap::Parser;
use std::sync::Arc;
use tracing::{event, Level};

use acs_engine_autoscaler::args::Args;
use acs_engine_autoscaler::libs::azure::{AzureCloud, AzureCredentials};
use acs_engine_autoscaler::libs::capacity::CapacityCatalog;
use acs_engine_autoscaler::libs::cluster::{Cluster, ClusterOptions};
use acs_engine_autoscaler::libs::conf::{Conf, LogLevel};
use acs_engine_autoscaler::libs::kube::KubeCluster;
use acs_engine_autoscaler::libs::notify::Notifier;
use acs_engine_autoscaler::libs::trace;

/// The autoscaler for acs-engine built Kubernetes clusters
#[tokio::main]
async fn main() {
    // install a crypto provider for rustls
    // Rustls will complain if this is not run but we can ignore any errors
    let _ = rustls::crypto::ring::default_provider().install_default();
    // get command line args
    let args = Args::parse();
    // try to load a config file
    let conf = Conf::new(&args.config).expect("Failed to load config");
    // setup our tracer; the command line verbosity wins over the config file
    let level = match args.verbose {
        Some(verbose) => LogLevel::from_verbosity(verbose),
        None => conf.level,
    };
    trace::setup("acs-engine-autoscaler", level);
    // the cloud side cannot work without a full service principal
    let creds = match (
        &args.service_principal_app_id,
        &args.service_principal_secret,
        &args.service_principal_tenant_id,
        &args.subscription_id,
    ) {
        (Some(app_id), Some(secret), Some(tenant), Some(subscription)) => AzureCredentials {
            app_id: app_id.clone(),
            secret: secret.clone(),
            tenant: tenant.clone(),
            subscription: subscription.clone(),
        },
        _ => {
            event!(
                Level::ERROR,
                "Missing Azure credentials. Provide service-principal-app-id, \
                 service-principal-secret, service-principal-tenant-id and subscription-id."
            );
            std::process::exit(1);
        }
    };
    if args.client_private_key.is_none() {
        event!(
            Level::ERROR,
            "Missing client private key. Provide it through --client-private-key or the \
             CLIENT_PRIVATE_KEY environment variable"
        );
    }
    if args.ca_private_key.is_none() {
        event!(
            Level::ERROR,
            "Missing ca private key. Provide it through --ca-private-key or the \
             CA_PRIVATE_KEY environment variable"
        );
    }
    // load the instance type catalog
    let catalog = CapacityCatalog::load(&conf.capacity).expect("Failed to load capacity catalog");
    // notifications need both the hook and the bot token
    let notifier = match (&args.slack_hook, &args.slack_bot_token) {
        (Some(hook), Some(token)) => {
            Some(Notifier::new(Some(hook.clone()), Some(token.clone())))
        }
        _ => None,
    };
    // build the cloud and cluster clients
    let cloud = Arc::new(AzureCloud::new(creds));
    let cluster_view = KubeCluster::new(args.kubeconfig.as_deref())
        .await
        .expect("Failed to build a kubernetes client");
    let opts = ClusterOptions {
        resource_group: args.resource_group.clone(),
        acs_deployment: args.acs_deployment.clone(),
        sleep: args.sleep,
        spare_agents: args.spare_agents,
        over_provision: args.over_provision,
        idle_threshold: args.idle_threshold,
        instance_init_time: args.instance_init_time,
        scale_up: !args.no_scale,
        maintenance: !args.no_maintenance,
        dry_run: args.dry_run,
        debug: args.debug,
        ignore_pools: args.ignored_pools(),
        client_private_key: args.client_private_key.clone(),
        ca_private_key: args.ca_private_key.clone(),
        sp_app_id: args.service_principal_app_id.clone().unwrap_or_default(),
        sp_secret: args.service_principal_secret.clone().unwrap_or_default(),
    };
    // build and start the control loop
    let mut cluster = Cluster::new(
        opts,
        conf,
        Arc::new(catalog),
        Arc::new(cluster_view),
        cloud,
        notifier,
    );
    cluster.login().await.expect("Failed to login to Azure");
    cluster.run().await.expect("Scaling loop crashed");
}

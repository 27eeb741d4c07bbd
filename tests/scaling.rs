//! End to end scaling scenarios over the mock cluster and cloud

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use acs_engine_autoscaler::libs::deployments::Deployments;
use acs_engine_autoscaler::libs::engine::{EngineScaler, EngineSettings};
use acs_engine_autoscaler::libs::models::KubeNode;
use acs_engine_autoscaler::libs::resources::Resource;
use acs_engine_autoscaler::libs::scaler::Scaler;
use acs_engine_autoscaler::libs::Error;
use acs_engine_autoscaler::test_utilities::{
    agent_node, pending_pod, raw_pod, running_pod, sample_catalog, sample_parameters,
    sample_template, MockCloud, MockCluster,
};
use acs_engine_autoscaler::libs::models::KubePod;

/// The default engine settings for tests
fn settings() -> EngineSettings {
    EngineSettings {
        resource_group: "my-rg".to_owned(),
        over_provision: 0,
        spare_count: 1,
        dry_run: false,
        reclaim_pause: Duration::ZERO,
        ignored_pools: HashSet::default(),
    }
}

/// Assemble an engine scaler over mocks for the given pools and nodes
fn build_scaler(
    pools: &[(&str, &str)],
    nodes: Vec<KubeNode>,
    settings: EngineSettings,
    cluster: &Arc<MockCluster>,
    cloud: &Arc<MockCloud>,
    deployments: &Arc<Deployments>,
) -> EngineScaler {
    let names = pools.iter().map(|(name, _)| *name).collect::<Vec<&str>>();
    EngineScaler::new(
        settings,
        Arc::new(sample_catalog()),
        sample_template(&names),
        sample_parameters(pools),
        nodes,
        cluster.clone(),
        cloud.clone(),
        deployments.clone(),
        None,
    )
    .unwrap()
}

/// Two pools of the same instance type; the cheaper (first) pool absorbs a
/// pending pod while the other stays put
#[tokio::test]
async fn pending_pod_grows_the_cheapest_pool() {
    let pools = [
        ("agentpool0", "Standard_D2_v2"),
        ("agentpool1", "Standard_D2_v2"),
    ];
    let cluster = Arc::new(MockCluster::new());
    let cloud = Arc::new(MockCloud::new(
        sample_template(&["agentpool0", "agentpool1"]),
        sample_parameters(&pools),
    ));
    let deployments = Arc::new(Deployments::new());
    // both nodes are near saturated so the pod stays pending
    let mut node0 = agent_node("agentpool0", 0, false, false);
    node0.used_capacity = Resource::new().set("cpu", 1.8);
    let mut node1 = agent_node("agentpool1", 0, false, false);
    node1.used_capacity = Resource::new().set("cpu", 1.8);
    let mut scaler = build_scaler(
        &pools,
        vec![node0, node1],
        settings(),
        &cluster,
        &cloud,
        &deployments,
    );
    scaler
        .fulfill_pending(&[pending_pod("busybox", 0.5)])
        .await
        .unwrap();
    // the cheapest pool grows by one, the other is untouched
    let mut expected = BTreeMap::new();
    expected.insert("agentpool0".to_owned(), 2);
    expected.insert("agentpool1".to_owned(), 1);
    assert_eq!(deployments.requested_pool_sizes().await, Some(expected));
    let submitted = cloud.deployments.lock().unwrap();
    assert_eq!(submitted.len(), 1);
    let (name, properties) = &submitted[0];
    assert!(name.starts_with("autoscaler-deployment-"));
    assert_eq!(properties["mode"], "Incremental");
    assert_eq!(properties["parameters"]["agentpool0Count"]["value"], 2);
    assert_eq!(properties["parameters"]["agentpool1Count"]["value"], 1);
}

/// Bin packing is a pure function of its inputs
#[tokio::test]
async fn fulfill_pending_is_deterministic() {
    let pools = [
        ("agentpool0", "Standard_D2_v2"),
        ("agentpool1", "Standard_D2_v2"),
    ];
    let pods = vec![
        pending_pod("first", 0.5),
        pending_pod("second", 0.4),
        pending_pod("third", 1.9),
    ];
    let mut results = Vec::new();
    for _ in 0..2 {
        let cluster = Arc::new(MockCluster::new());
        let cloud = Arc::new(MockCloud::new(
            sample_template(&["agentpool0", "agentpool1"]),
            sample_parameters(&pools),
        ));
        let deployments = Arc::new(Deployments::new());
        let nodes = vec![
            agent_node("agentpool0", 0, false, false),
            agent_node("agentpool1", 0, false, false),
        ];
        let mut scaler =
            build_scaler(&pools, nodes, settings(), &cluster, &cloud, &deployments);
        scaler.fulfill_pending(&pods).await.unwrap();
        results.push(deployments.requested_pool_sizes().await);
    }
    assert_eq!(results[0], results[1]);
    assert!(results[0].is_some());
}

/// A pool at its maximum size never requests past it
#[tokio::test]
async fn pool_growth_is_clamped_to_max_size() {
    let pools = [("agentpool0", "Standard_D1_v2")];
    let cluster = Arc::new(MockCluster::new());
    let cloud = Arc::new(MockCloud::new(
        sample_template(&["agentpool0"]),
        sample_parameters(&pools),
    ));
    let deployments = Arc::new(Deployments::new());
    // a full pool of 100 saturated nodes
    let nodes = (0..100)
        .map(|idx| {
            let mut node = agent_node("agentpool0", idx, false, false);
            node.used_capacity = Resource::new().set("cpu", 1.9);
            node
        })
        .collect::<Vec<KubeNode>>();
    let mut scaler = build_scaler(&pools, nodes, settings(), &cluster, &cloud, &deployments);
    scaler
        .fulfill_pending(&[pending_pod("busybox", 0.5)])
        .await
        .unwrap();
    // no headroom means no deployment at all
    assert!(cloud.deployments.lock().unwrap().is_empty());
}

/// A zero target substitutes the count/offset trick and excises the pool
#[tokio::test]
async fn zero_targets_deploy_nothing_for_the_pool() {
    let pools = [("poolx", "Standard_D2_v2")];
    let cluster = Arc::new(MockCluster::new());
    let cloud = Arc::new(MockCloud::new(
        sample_template(&["poolx"]),
        sample_parameters(&pools),
    ));
    let deployments = Arc::new(Deployments::new());
    let nodes = vec![
        agent_node("poolx", 0, false, false),
        agent_node("poolx", 1, false, false),
        agent_node("poolx", 2, false, false),
    ];
    let mut scaler = build_scaler(&pools, nodes, settings(), &cluster, &cloud, &deployments);
    let mut sizes = BTreeMap::new();
    sizes.insert("poolx".to_owned(), 0);
    scaler.scale_pools(sizes).await.unwrap();
    let submitted = cloud.deployments.lock().unwrap();
    assert_eq!(submitted.len(), 1);
    let (_, properties) = &submitted[0];
    // ARM rejects a zero count loop, so the parameters fake a one node
    // deployment the template no longer contains
    assert_eq!(properties["parameters"]["poolxCount"]["value"], 1);
    assert_eq!(properties["parameters"]["poolxOffset"]["value"], 1);
    let serial = serde_json::to_string(&properties["template"]).unwrap();
    assert!(!serial.contains("poolxVMNamePrefix"));
    assert!(!serial.contains("poolxAvailabilitySet"));
    assert!(!serial.contains("poolxAccountName"));
}

/// Growing a pool reclaims its own cordoned nodes before deploying
#[tokio::test]
async fn growth_reclaims_cordoned_nodes_first() {
    let pools = [("agentpool0", "Standard_D2_v2")];
    let cluster = Arc::new(MockCluster::new());
    let cloud = Arc::new(MockCloud::new(
        sample_template(&["agentpool0"]),
        sample_parameters(&pools),
    ));
    let deployments = Arc::new(Deployments::new());
    let nodes = vec![
        agent_node("agentpool0", 0, false, false),
        // cordoned by us earlier, so reclaimable
        agent_node("agentpool0", 1, true, true),
    ];
    let mut scaler = build_scaler(&pools, nodes, settings(), &cluster, &cloud, &deployments);
    let mut sizes = BTreeMap::new();
    sizes.insert("agentpool0".to_owned(), 3);
    scaler.scale_pools(sizes).await.unwrap();
    // the cordoned node was uncordoned on the way up
    let patches = cluster.patches.lock().unwrap();
    assert!(patches.iter().any(|(node, patch)| {
        node == "k8s-agentpool0-16334397-1" && patch["spec"]["unschedulable"] == false
    }));
    assert_eq!(cloud.deployments.lock().unwrap().len(), 1);
}

/// The spare floor stops the maintainer from pulling the last schedulable
/// node out of service
#[tokio::test]
async fn spare_floor_blocks_the_second_cordon() {
    let pools = [("agentpool0", "Standard_D2_v2")];
    let cluster = Arc::new(MockCluster::new());
    let cloud = Arc::new(MockCloud::new(
        sample_template(&["agentpool0"]),
        sample_parameters(&pools),
    ));
    let deployments = Arc::new(Deployments::new());
    let nodes = vec![
        agent_node("agentpool0", 0, false, false),
        agent_node("agentpool0", 1, false, false),
    ];
    let mut scaler = build_scaler(&pools, nodes, settings(), &cluster, &cloud, &deployments);
    scaler.maintain(&[], &[]).await.unwrap();
    // exactly one node was cordoned, nothing was drained or deleted
    let patches = cluster.patches.lock().unwrap();
    assert_eq!(patches.len(), 1);
    assert_eq!(patches[0].0, "k8s-agentpool0-16334397-0");
    assert_eq!(patches[0].1["spec"]["unschedulable"], true);
    assert!(cluster.evictions.lock().unwrap().is_empty());
    assert!(cloud.deleted_resources.lock().unwrap().is_empty());
}

/// An operator placed cordon is never undone by the autoscaler
#[tokio::test]
async fn uncordon_is_gated_by_the_cordon_label() {
    let pools = [("agentpool0", "Standard_D2_v2")];
    let cluster = Arc::new(MockCluster::new());
    let cloud = Arc::new(MockCloud::new(
        sample_template(&["agentpool0"]),
        sample_parameters(&pools),
    ));
    let deployments = Arc::new(Deployments::new());
    // busy and unschedulable, but cordoned by an operator
    let nodes = vec![agent_node("agentpool0", 0, true, false)];
    let mut scaler = build_scaler(&pools, nodes, settings(), &cluster, &cloud, &deployments);
    let busy = running_pod("worker", 1.5, "k8s-agentpool0-16334397-0");
    scaler.maintain(&[], &[busy]).await.unwrap();
    // the uncordon was refused without an api call
    assert!(cluster.patches.lock().unwrap().is_empty());
}

/// A cordon the autoscaler owns is cleared when the node turns busy
#[tokio::test]
async fn busy_nodes_cordoned_by_us_are_uncordoned() {
    let pools = [("agentpool0", "Standard_D2_v2")];
    let cluster = Arc::new(MockCluster::new());
    let cloud = Arc::new(MockCloud::new(
        sample_template(&["agentpool0"]),
        sample_parameters(&pools),
    ));
    let deployments = Arc::new(Deployments::new());
    let nodes = vec![agent_node("agentpool0", 0, true, true)];
    let mut scaler = build_scaler(&pools, nodes, settings(), &cluster, &cloud, &deployments);
    let busy = running_pod("worker", 1.5, "k8s-agentpool0-16334397-0");
    scaler.maintain(&[], &[busy]).await.unwrap();
    let patches = cluster.patches.lock().unwrap();
    assert_eq!(patches.len(), 1);
    assert_eq!(patches[0].1["spec"]["unschedulable"], false);
}

/// Draining evicts the drainable pods and spares the mirrored ones
#[tokio::test]
async fn drains_skip_mirror_pods() {
    let pools = [("agentpool0", "Standard_D2_v2")];
    let cluster = Arc::new(MockCluster::new());
    let cloud = Arc::new(MockCloud::new(
        sample_template(&["agentpool0"]),
        sample_parameters(&pools),
    ));
    let deployments = Arc::new(Deployments::new());
    let nodes = vec![
        agent_node("agentpool0", 0, false, false),
        agent_node("agentpool0", 1, false, false),
    ];
    let mut settings = settings();
    settings.spare_count = 0;
    let mut scaler = build_scaler(&pools, nodes, settings, &cluster, &cloud, &deployments);
    let node_name = "k8s-agentpool0-16334397-0";
    let tiny = running_pod("tiny", 0.1, node_name);
    let proxy =
        KubePod::new(&raw_pod("kube-proxy-abc12", "0.1", "Running", Some(node_name), true))
            .unwrap();
    let busy = running_pod("worker", 1.5, "k8s-agentpool0-16334397-1");
    scaler.maintain(&[], &[tiny, proxy, busy]).await.unwrap();
    // only the drainable pod was evicted
    let evictions = cluster.evictions.lock().unwrap();
    assert_eq!(evictions.as_slice(), ["default/tiny"]);
    // and the under utilized node was cordoned on the way
    let patches = cluster.patches.lock().unwrap();
    assert!(patches
        .iter()
        .any(|(node, patch)| node == node_name && patch["spec"]["unschedulable"] == true));
}

/// Idle cordoned nodes fan out into parallel VM/NIC/disk deletions
#[tokio::test]
async fn idle_unschedulable_nodes_are_deleted_in_parallel() {
    let pools = [
        ("agentpool0", "Standard_D2_v2"),
        ("agentpool1", "Standard_D2_v2"),
    ];
    let cluster = Arc::new(MockCluster::new());
    let cloud = Arc::new(MockCloud::new(
        sample_template(&["agentpool0", "agentpool1"]),
        sample_parameters(&pools),
    ));
    let deployments = Arc::new(Deployments::new());
    // one node keeps a VHD backed disk to exercise the blob path
    cloud.with_vhd_vm("k8s-agentpool1-16334397-0", "mystore");
    let nodes = vec![
        agent_node("agentpool0", 0, true, true),
        agent_node("agentpool0", 1, true, true),
        agent_node("agentpool1", 0, true, true),
    ];
    let mut scaler = build_scaler(&pools, nodes, settings(), &cluster, &cloud, &deployments);
    scaler.maintain(&[], &[]).await.unwrap();
    // three VMs and three NICs went away
    let deleted = cloud.deleted_resources.lock().unwrap();
    let vms = deleted.iter().filter(|name| name.starts_with("virtualMachines/")).count();
    let nics = deleted
        .iter()
        .filter(|name| name.starts_with("networkInterfaces/"))
        .count();
    assert_eq!(vms, 3);
    assert_eq!(nics, 3);
    assert!(deleted.contains(&"networkInterfaces/k8s-agentpool0-16334397-nic-1".to_owned()));
    // two managed disks and one blob
    assert_eq!(cloud.deleted_disks.lock().unwrap().len(), 2);
    assert_eq!(
        cloud.deleted_blobs.lock().unwrap().as_slice(),
        ["vhds/k8s-agentpool1-16334397-0-osdisk.vhd"]
    );
    // the node objects followed their VMs
    assert_eq!(cluster.deleted_nodes.lock().unwrap().len(), 3);
    // the published target compounds every deletion
    let mut expected = BTreeMap::new();
    expected.insert("agentpool0".to_owned(), 0);
    expected.insert("agentpool1".to_owned(), 0);
    assert_eq!(deployments.requested_pool_sizes().await, Some(expected));
}

/// Transient blob failures are retried in place until they clear
#[tokio::test]
async fn transient_blob_failures_are_retried() {
    let pools = [("agentpool0", "Standard_D2_v2")];
    let cluster = Arc::new(MockCluster::new());
    let cloud = Arc::new(MockCloud::new(
        sample_template(&["agentpool0"]),
        sample_parameters(&pools),
    ));
    let deployments = Arc::new(Deployments::new());
    cloud.with_vhd_vm("k8s-agentpool0-16334397-0", "mystore");
    *cloud.blob_failures.lock().unwrap() = 2;
    let nodes = vec![agent_node("agentpool0", 0, true, true)];
    let mut scaler = build_scaler(&pools, nodes, settings(), &cluster, &cloud, &deployments);
    scaler.maintain(&[], &[]).await.unwrap();
    assert_eq!(cloud.deleted_blobs.lock().unwrap().len(), 1);
    assert_eq!(*cloud.blob_failures.lock().unwrap(), 0);
}

/// Dry run computes decisions without a single mutating call
#[tokio::test]
async fn dry_run_never_mutates() {
    let pools = [("agentpool0", "Standard_D2_v2")];
    let cluster = Arc::new(MockCluster::new());
    let cloud = Arc::new(MockCloud::new(
        sample_template(&["agentpool0"]),
        sample_parameters(&pools),
    ));
    let deployments = Arc::new(Deployments::new());
    let mut settings = settings();
    settings.dry_run = true;
    let nodes = vec![
        // one idle schedulable, one idle cordoned
        agent_node("agentpool0", 0, false, false),
        agent_node("agentpool0", 1, true, true),
    ];
    let mut scaler = build_scaler(&pools, nodes, settings, &cluster, &cloud, &deployments);
    scaler
        .fulfill_pending(&[pending_pod("busybox", 0.5)])
        .await
        .unwrap();
    scaler.maintain(&[], &[]).await.unwrap();
    assert!(cluster.patches.lock().unwrap().is_empty());
    assert!(cluster.evictions.lock().unwrap().is_empty());
    assert!(cloud.deployments.lock().unwrap().is_empty());
    assert!(cloud.deleted_resources.lock().unwrap().is_empty());
}

/// At most one deployment is ever in flight
#[tokio::test]
async fn deployments_are_single_flight() {
    let deployments = Arc::new(Deployments::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let mut first_sizes = BTreeMap::new();
    first_sizes.insert("agentpool0".to_owned(), 2u64);
    let mut second_sizes = BTreeMap::new();
    second_sizes.insert("agentpool0".to_owned(), 3u64);
    let slow_calls = calls.clone();
    let slow = deployments.submit(
        || async move {
            slow_calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok::<(), Error>(())
        },
        first_sizes.clone(),
    );
    let fast_calls = calls.clone();
    let fast = async {
        // let the slow deployment take the slot first
        tokio::time::sleep(Duration::from_millis(5)).await;
        deployments
            .submit(
                || async move {
                    fast_calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), Error>(())
                },
                second_sizes,
            )
            .await
    };
    let (slow_result, fast_result) = tokio::join!(slow, fast);
    slow_result.unwrap();
    fast_result.unwrap();
    // only the first deployment ran; the requested sizes are still its
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(deployments.requested_pool_sizes().await, Some(first_sizes));
}

/// Re-requesting the sizes already in flight is a no op
#[tokio::test]
async fn unchanged_size_requests_are_skipped() {
    let deployments = Arc::new(Deployments::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let mut sizes = BTreeMap::new();
    sizes.insert("agentpool0".to_owned(), 2u64);
    for _ in 0..2 {
        let counter = calls.clone();
        deployments
            .submit(
                || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), Error>(())
                },
                sizes.clone(),
            )
            .await
            .unwrap();
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

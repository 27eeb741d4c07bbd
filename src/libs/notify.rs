//! Posts scale and drain events to a Slack webhook
//!
//! Notifications are write only side effects: a failed post is logged and
//! never fails the tick that triggered it.

use itertools::Itertools;
use serde_json::json;
use tracing::{event, Level};

use super::models::KubePod;

/// The username notifications are posted under
const SLACK_USERNAME: &str = "acs-engine-autoscaler";

/// Compress a pod list into a short human readable string
///
/// # Arguments
///
/// * `pods` - The pods to describe
fn pod_string(pods: &[KubePod]) -> String {
    if pods.len() > 5 {
        let head = pods.iter().take(4).map(|pod| pod.to_string()).join(", ");
        format!("{}, and {} others", head, pods.len() - 4)
    } else {
        pods.iter().map(|pod| pod.to_string()).join(", ")
    }
}

/// A Slack notifier for scale events
#[derive(Clone)]
pub struct Notifier {
    /// The webhook url to post messages to
    hook: Option<String>,
    /// The bot token for direct messages when one is configured
    #[allow(dead_code)]
    bot_token: Option<String>,
    /// The client to post with
    client: reqwest::Client,
}

impl Notifier {
    /// Create a new notifier
    ///
    /// # Arguments
    ///
    /// * `hook` - The Slack webhook url
    /// * `bot_token` - An optional Slack bot token
    pub fn new(hook: Option<String>, bot_token: Option<String>) -> Self {
        Notifier {
            hook,
            bot_token,
            client: reqwest::Client::new(),
        }
    }

    /// Post a message to the configured hook
    ///
    /// # Arguments
    ///
    /// * `text` - The message to post
    async fn post(&self, text: String) {
        // without a hook notifications are a no op
        let hook = match &self.hook {
            Some(hook) => hook,
            None => {
                event!(Level::DEBUG, "slack hook not configured");
                return;
            }
        };
        let body = json!({
            "text": text,
            "username": SLACK_USERNAME,
            "icon_emoji": ":rabbit:",
        });
        // log but never propagate notification failures
        if let Err(error) = self.client.post(hook).json(&body).send().await {
            event!(Level::ERROR, error = %error, "failed to post to slack");
        }
    }

    /// Announce a pool scaling up
    ///
    /// # Arguments
    ///
    /// * `pool` - The name of the pool that scaled
    /// * `units_requested` - How many nodes were added
    /// * `new_capacity` - The pools new target size
    /// * `pods` - The pending pods that triggered the change
    pub async fn notify_scale(
        &self,
        pool: &str,
        units_requested: u64,
        new_capacity: u64,
        pods: &[KubePod],
    ) {
        let message = format!(
            "Pool {} scaled up by {} to new capacity {}\nChange triggered by {}",
            pool,
            units_requested,
            new_capacity,
            pod_string(pods)
        );
        self.post(message).await;
    }

    /// Announce that the pending set could not be fully placed
    ///
    /// # Arguments
    ///
    /// * `pods` - The pods left unplaced
    pub async fn notify_failed_to_scale(&self, pods: &[KubePod]) {
        let message = format!(
            "Failed to scale sufficiently. Backing off...\nPods affected: {}",
            pod_string(pods)
        );
        self.post(message).await;
    }

    /// Announce a pod that fits in no pool
    ///
    /// # Arguments
    ///
    /// * `pod` - The infeasible pod
    pub async fn notify_invalid_pod_capacity(&self, pod: &KubePod) {
        let message = format!(
            "Pending pod {} cannot fit in any agent pool. Please check that the \
             requested resource amount is consistent with the node sizes. \
             Scheduling skipped.",
            pod
        );
        self.post(message).await;
    }

    /// Announce a node drain
    ///
    /// # Arguments
    ///
    /// * `node` - The node that was drained
    /// * `pods` - The pods that were evicted
    pub async fn notify_drained(&self, node: &str, pods: &[KubePod]) {
        let message = format!("Drained {} evicting {}", node, pod_string(pods));
        self.post(message).await;
    }
}

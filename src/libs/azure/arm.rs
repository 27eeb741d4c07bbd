//! The ARM resource plane calls for the autoscaler

use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;
use tracing::{event, instrument, Level};

use crate::libs::errors::Error;

use super::{check, AzureCloud, CloudProvider};

/// The management plane base url
const MANAGEMENT_BASE: &str = "https://management.azure.com";

/// The api version used for deployment operations
const DEPLOYMENT_API: &str = "2017-05-10";

/// The api version used to read virtual machines
const COMPUTE_API: &str = "2017-12-01";

/// The api version used to delete managed disks
const DISK_API: &str = "2017-03-30";

/// The api version used to list storage account keys
pub(super) const STORAGE_API: &str = "2017-10-01";

/// How long to pause between polls of a long running operation
const POLL_PAUSE: Duration = Duration::from_secs(10);

/// The most polls a long running operation gets before we give up
const POLL_LIMIT: usize = 180;

impl AzureCloud {
    /// Build a deployment scoped url
    ///
    /// # Arguments
    ///
    /// * `group` - The resource group of the deployment
    /// * `deployment` - The deployment name
    /// * `suffix` - An action suffix such as /exportTemplate
    fn deployment_url(&self, group: &str, deployment: &str, suffix: &str) -> String {
        format!(
            "{}/subscriptions/{}/resourcegroups/{}/providers/Microsoft.Resources/deployments/{}{}?api-version={}",
            MANAGEMENT_BASE, self.subscription, group, deployment, suffix, DEPLOYMENT_API
        )
    }

    /// Build a provider scoped resource url
    ///
    /// # Arguments
    ///
    /// * `group` - The resource group of the resource
    /// * `provider` - The resource provider namespace
    /// * `kind` - The resource type
    /// * `name` - The resource name
    /// * `api_version` - The api version to address it with
    fn resource_url(
        &self,
        group: &str,
        provider: &str,
        kind: &str,
        name: &str,
        api_version: &str,
    ) -> String {
        format!(
            "{}/subscriptions/{}/resourceGroups/{}/providers/{}/{}/{}?api-version={}",
            MANAGEMENT_BASE, self.subscription, group, provider, kind, name, api_version
        )
    }

    /// Send an authenticated GET and parse the json body
    ///
    /// # Arguments
    ///
    /// * `url` - The url to get
    pub(super) async fn arm_get(&self, url: &str) -> Result<Value, Error> {
        let token = self.tokens.token().await?;
        let resp = self.client.get(url).bearer_auth(token).send().await?;
        let resp = check(resp).await?;
        Ok(resp.json().await?)
    }

    /// Poll a long running operation url until it leaves the accepted state
    ///
    /// # Arguments
    ///
    /// * `url` - The operation url from the Location header
    async fn wait_for_operation(&self, url: &str) -> Result<(), Error> {
        for _ in 0..POLL_LIMIT {
            tokio::time::sleep(POLL_PAUSE).await;
            let token = self.tokens.token().await?;
            let resp = self.client.get(url).bearer_auth(token).send().await?;
            match resp.status() {
                // still running
                StatusCode::ACCEPTED => continue,
                // the resource is gone or the operation completed
                StatusCode::OK | StatusCode::NO_CONTENT | StatusCode::NOT_FOUND => return Ok(()),
                _ => {
                    check(resp).await?;
                    return Ok(());
                }
            }
        }
        Err(Error::new(format!("Operation {} never completed", url)))
    }
}

#[async_trait::async_trait]
impl CloudProvider for AzureCloud {
    /// Download the exported cluster template
    #[instrument(name = "AzureCloud::download_template", skip(self), err(Debug))]
    async fn download_template(&self, group: &str, deployment: &str) -> Result<Value, Error> {
        let url = self.deployment_url(group, deployment, "/exportTemplate");
        let token = self.tokens.token().await?;
        let resp = self.client.post(&url).bearer_auth(token).send().await?;
        let resp = check(resp).await?;
        let mut body: Value = resp.json().await?;
        match body.get_mut("template") {
            Some(template) => Ok(template.take()),
            None => Err(Error::new("Export response carried no template")),
        }
    }

    /// Download the parameters of the cluster deployment
    #[instrument(name = "AzureCloud::download_parameters", skip(self), err(Debug))]
    async fn download_parameters(&self, group: &str, deployment: &str) -> Result<Value, Error> {
        let url = self.deployment_url(group, deployment, "");
        let mut body = self.arm_get(&url).await?;
        let mut parameters = match body.pointer_mut("/properties/parameters") {
            Some(parameters) => parameters.take(),
            None => return Err(Error::new("Deployment carried no parameters")),
        };
        // the parameter type annotations are rejected on resubmission
        if let Some(map) = parameters.as_object_mut() {
            for (_, parameter) in map.iter_mut() {
                if let Some(fields) = parameter.as_object_mut() {
                    fields.remove("type");
                }
            }
        }
        Ok(parameters)
    }

    /// Submit a deployment and wait for it to reach a terminal state
    #[instrument(name = "AzureCloud::create_deployment", skip(self, properties), err(Debug))]
    async fn create_deployment(
        &self,
        group: &str,
        name: &str,
        properties: Value,
    ) -> Result<(), Error> {
        let url = self.deployment_url(group, name, "");
        let body = serde_json::json!({"properties": properties});
        let token = self.tokens.token().await?;
        let resp = self.client.put(&url).bearer_auth(token).json(&body).send().await?;
        check(resp).await?;
        // poll the deployment itself until its provisioning state settles
        for _ in 0..POLL_LIMIT {
            tokio::time::sleep(POLL_PAUSE).await;
            let deployment = self.arm_get(&url).await?;
            let state = deployment
                .pointer("/properties/provisioningState")
                .and_then(|state| state.as_str())
                .unwrap_or("");
            match state {
                "Succeeded" => return Ok(()),
                "Failed" | "Canceled" => {
                    return Err(Error::new(format!(
                        "Deployment {} ended in state {}",
                        name, state
                    )))
                }
                running => {
                    event!(Level::DEBUG, deployment = name, state = running, "deployment running");
                }
            }
        }
        Err(Error::new(format!("Deployment {} never completed", name)))
    }

    /// Get a virtual machine document
    #[instrument(name = "AzureCloud::get_virtual_machine", skip(self), err(Debug))]
    async fn get_virtual_machine(&self, group: &str, name: &str) -> Result<Value, Error> {
        let url = self.resource_url(group, "Microsoft.Compute", "virtualMachines", name, COMPUTE_API);
        self.arm_get(&url).await
    }

    /// Delete a raw ARM resource and wait for completion
    #[instrument(name = "AzureCloud::delete_resource", skip(self), err(Debug))]
    async fn delete_resource(
        &self,
        group: &str,
        provider: &str,
        kind: &str,
        name: &str,
        api_version: &str,
    ) -> Result<(), Error> {
        let url = self.resource_url(group, provider, kind, name, api_version);
        let token = self.tokens.token().await?;
        let resp = self.client.delete(&url).bearer_auth(token).send().await?;
        // accepted deletes hand back an operation url to poll
        if resp.status() == StatusCode::ACCEPTED {
            let operation = resp
                .headers()
                .get("azure-asyncoperation")
                .or_else(|| resp.headers().get("location"))
                .and_then(|header| header.to_str().ok())
                .map(str::to_owned);
            if let Some(operation) = operation {
                return self.wait_for_operation(&operation).await;
            }
            return Ok(());
        }
        check(resp).await?;
        Ok(())
    }

    /// Delete a managed disk
    #[instrument(name = "AzureCloud::delete_managed_disk", skip(self), err(Debug))]
    async fn delete_managed_disk(&self, group: &str, name: &str) -> Result<(), Error> {
        self.delete_resource(group, "Microsoft.Compute", "disks", name, DISK_API)
            .await
    }

    /// Get the primary key of a storage account
    #[instrument(name = "AzureCloud::list_storage_keys", skip(self), err(Debug))]
    async fn list_storage_keys(&self, group: &str, account: &str) -> Result<String, Error> {
        self.list_keys(group, account).await
    }

    /// Delete a block blob
    #[instrument(name = "AzureCloud::delete_blob", skip(self, key), err(Debug))]
    async fn delete_blob(
        &self,
        account: &str,
        key: &str,
        container: &str,
        blob: &str,
    ) -> Result<(), Error> {
        self.delete_block_blob(account, key, container, blob).await
    }
}

//! The narrow view of the Azure APIs the autoscaler needs
//!
//! Scale out submits ARM deployments; scale in deletes VMs, NICs, and OS
//! disks. Everything goes through the [`CloudProvider`] trait so the tests
//! can swap in a recording cloud.

use serde_json::Value;

use super::errors::Error;

mod arm;
mod auth;
mod storage;

pub use auth::AzureCredentials;
use auth::TokenManager;

/// The ARM api version used for raw resource deletion
pub const RESOURCE_DELETE_API: &str = "2016-03-30";

/// Where the OS disk of a VM lives
#[derive(Debug, Clone)]
pub enum OsDisk {
    /// A managed disk deleted through the compute api
    Managed(String),
    /// A VHD backed disk deleted as a storage blob
    Vhd {
        /// The storage account holding the blob
        account: String,
        /// The container holding the blob
        container: String,
        /// The blob name itself
        blob: String,
    },
}

impl OsDisk {
    /// Extract the OS disk location from a virtual machine document
    ///
    /// # Arguments
    ///
    /// * `vm` - The virtual machine json from the compute api
    pub fn from_vm(vm: &Value) -> Result<Self, Error> {
        let os_disk = vm
            .pointer("/properties/storageProfile/osDisk")
            .ok_or_else(|| Error::new("VM document has no osDisk"))?;
        // managed disks carry a managedDisk object and their own name
        if os_disk.get("managedDisk").is_some() {
            let name = os_disk
                .get("name")
                .and_then(|name| name.as_str())
                .ok_or_else(|| Error::new("Managed osDisk has no name"))?;
            return Ok(OsDisk::Managed(name.to_owned()));
        }
        // VHD backed disks are addressed by their blob uri
        let uri = os_disk
            .pointer("/vhd/uri")
            .and_then(|uri| uri.as_str())
            .ok_or_else(|| Error::new("Unmanaged osDisk has no vhd uri"))?;
        // uri shape: https://<account>.blob.core.windows.net/<container>/<blob>
        let parts = uri.split('/').collect::<Vec<&str>>();
        if parts.len() < 5 {
            return Err(Error::new(format!("Unparseable vhd uri: {}", uri)));
        }
        let account = parts[2]
            .split('.')
            .next()
            .unwrap_or_default()
            .to_owned();
        Ok(OsDisk::Vhd {
            account,
            container: parts[3].to_owned(),
            blob: parts[4].to_owned(),
        })
    }
}

/// The methods required to drive the cloud side of the cluster
#[async_trait::async_trait]
pub trait CloudProvider: Send + Sync {
    /// Download the exported cluster template
    ///
    /// # Arguments
    ///
    /// * `group` - The resource group holding the cluster
    /// * `deployment` - The deployment the cluster was created from
    async fn download_template(&self, group: &str, deployment: &str) -> Result<Value, Error>;

    /// Download the parameters of the cluster deployment
    ///
    /// # Arguments
    ///
    /// * `group` - The resource group holding the cluster
    /// * `deployment` - The deployment the cluster was created from
    async fn download_parameters(&self, group: &str, deployment: &str) -> Result<Value, Error>;

    /// Submit a deployment and wait for it to reach a terminal state
    ///
    /// # Arguments
    ///
    /// * `group` - The resource group to deploy into
    /// * `name` - The name of the new deployment
    /// * `properties` - The deployment properties (template/parameters/mode)
    async fn create_deployment(
        &self,
        group: &str,
        name: &str,
        properties: Value,
    ) -> Result<(), Error>;

    /// Get a virtual machine document
    ///
    /// # Arguments
    ///
    /// * `group` - The resource group holding the VM
    /// * `name` - The VM name
    async fn get_virtual_machine(&self, group: &str, name: &str) -> Result<Value, Error>;

    /// Delete a raw ARM resource and wait for completion
    ///
    /// # Arguments
    ///
    /// * `group` - The resource group holding the resource
    /// * `provider` - The resource provider (e.g. Microsoft.Compute)
    /// * `kind` - The resource type (e.g. virtualMachines)
    /// * `name` - The resource name
    /// * `api_version` - The api version to delete with
    async fn delete_resource(
        &self,
        group: &str,
        provider: &str,
        kind: &str,
        name: &str,
        api_version: &str,
    ) -> Result<(), Error>;

    /// Delete a managed disk
    ///
    /// # Arguments
    ///
    /// * `group` - The resource group holding the disk
    /// * `name` - The disk name
    async fn delete_managed_disk(&self, group: &str, name: &str) -> Result<(), Error>;

    /// Get the primary key of a storage account
    ///
    /// # Arguments
    ///
    /// * `group` - The resource group holding the account
    /// * `account` - The storage account name
    async fn list_storage_keys(&self, group: &str, account: &str) -> Result<String, Error>;

    /// Delete a block blob
    ///
    /// # Arguments
    ///
    /// * `account` - The storage account holding the blob
    /// * `key` - The account key to sign with
    /// * `container` - The container holding the blob
    /// * `blob` - The blob name
    async fn delete_blob(
        &self,
        account: &str,
        key: &str,
        container: &str,
        blob: &str,
    ) -> Result<(), Error>;
}

/// The production cloud provider talking to the Azure REST apis
pub struct AzureCloud {
    /// The service principal token manager
    tokens: TokenManager,
    /// The subscription every call is scoped to
    subscription: String,
    /// The client all requests go through
    client: reqwest::Client,
}

impl AzureCloud {
    /// Build a cloud provider from service principal credentials
    ///
    /// # Arguments
    ///
    /// * `creds` - The service principal credentials to use
    pub fn new(creds: AzureCredentials) -> Self {
        let client = reqwest::Client::new();
        AzureCloud {
            subscription: creds.subscription.clone(),
            tokens: TokenManager::new(creds, client.clone()),
            client,
        }
    }
}

/// Turn a non success response into an Azure error
///
/// # Arguments
///
/// * `resp` - The response to check
pub(crate) async fn check(resp: reqwest::Response) -> Result<reqwest::Response, Error> {
    let code = resp.status();
    if code.is_success() {
        return Ok(resp);
    }
    let msg = resp.text().await.ok().filter(|body| !body.is_empty());
    Err(Error::Azure { code, msg })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn managed_disks_are_detected() {
        let vm = json!({"properties": {"storageProfile": {"osDisk": {
            "name": "osdisk-3",
            "managedDisk": {"id": "/subscriptions/x/disks/osdisk-3"}
        }}}});
        match OsDisk::from_vm(&vm).unwrap() {
            OsDisk::Managed(name) => assert_eq!(name, "osdisk-3"),
            OsDisk::Vhd { .. } => panic!("expected a managed disk"),
        }
    }

    #[test]
    fn vhd_uris_are_parsed() {
        let vm = json!({"properties": {"storageProfile": {"osDisk": {
            "vhd": {"uri": "https://mystore.blob.core.windows.net/vhds/osdisk-2.vhd"}
        }}}});
        match OsDisk::from_vm(&vm).unwrap() {
            OsDisk::Vhd { account, container, blob } => {
                assert_eq!(account, "mystore");
                assert_eq!(container, "vhds");
                assert_eq!(blob, "osdisk-2.vhd");
            }
            OsDisk::Managed(_) => panic!("expected a vhd disk"),
        }
    }

    #[test]
    fn disk_detection_fails_on_empty_documents() {
        assert!(OsDisk::from_vm(&json!({})).is_err());
    }
}

//! Storage account keys and VHD blob deletion
//!
//! VHD backed OS disks live as page blobs in the clusters storage accounts
//! and the data plane authenticates with the account key, so deletes are
//! signed with the SharedKey scheme rather than a bearer token.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::prelude::*;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::instrument;

use crate::libs::errors::Error;

use super::arm::STORAGE_API;
use super::{check, AzureCloud};

/// The storage data plane version requests are pinned to
const STORAGE_VERSION: &str = "2017-07-29";

/// Sign a storage string to sign with an account key
///
/// # Arguments
///
/// * `key` - The base64 encoded account key
/// * `string_to_sign` - The canonical string to sign
fn sign(key: &str, string_to_sign: &str) -> Result<String, Error> {
    let key = BASE64
        .decode(key)
        .map_err(|err| Error::new(format!("Bad storage key: {}", err)))?;
    let mut mac = Hmac::<Sha256>::new_from_slice(&key)
        .map_err(|err| Error::new(format!("Bad storage key length: {}", err)))?;
    mac.update(string_to_sign.as_bytes());
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

impl AzureCloud {
    /// Get the primary key of a storage account
    ///
    /// # Arguments
    ///
    /// * `group` - The resource group holding the account
    /// * `account` - The storage account name
    pub(super) async fn list_keys(&self, group: &str, account: &str) -> Result<String, Error> {
        let url = format!(
            "https://management.azure.com/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Storage/storageAccounts/{}/listKeys?api-version={}",
            self.subscription, group, account, STORAGE_API
        );
        let token = self.tokens.token().await?;
        let resp = self.client.post(&url).bearer_auth(token).send().await?;
        let resp = check(resp).await?;
        let body: serde_json::Value = resp.json().await?;
        body.pointer("/keys/0/value")
            .and_then(|key| key.as_str())
            .map(str::to_owned)
            .ok_or_else(|| Error::new(format!("Account {} returned no keys", account)))
    }

    /// Delete a block blob with a SharedKey signed request
    ///
    /// # Arguments
    ///
    /// * `account` - The storage account holding the blob
    /// * `key` - The account key to sign with
    /// * `container` - The container holding the blob
    /// * `blob` - The blob name
    #[instrument(name = "AzureCloud::delete_block_blob", skip(self, key), err(Debug))]
    pub(super) async fn delete_block_blob(
        &self,
        account: &str,
        key: &str,
        container: &str,
        blob: &str,
    ) -> Result<(), Error> {
        let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        // the canonical string for a bare DELETE: verb, eleven empty standard
        // headers, our x-ms headers, then the canonical resource
        let string_to_sign = format!(
            "DELETE\n\n\n\n\n\n\n\n\n\n\n\nx-ms-date:{}\nx-ms-version:{}\n/{}/{}/{}",
            date, STORAGE_VERSION, account, container, blob
        );
        let signature = sign(key, &string_to_sign)?;
        let url = format!(
            "https://{}.blob.core.windows.net/{}/{}",
            account, container, blob
        );
        let resp = self
            .client
            .delete(&url)
            .header("x-ms-date", date)
            .header("x-ms-version", STORAGE_VERSION)
            .header(
                "Authorization",
                format!("SharedKey {}:{}", account, signature),
            )
            .send()
            .await?;
        check(resp).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signing_is_deterministic() {
        let key = BASE64.encode(b"0123456789abcdef0123456789abcdef");
        let first = sign(&key, "DELETE\n\n/acct/vhds/osdisk.vhd").unwrap();
        let second = sign(&key, "DELETE\n\n/acct/vhds/osdisk.vhd").unwrap();
        assert_eq!(first, second);
        // a different payload must produce a different signature
        let third = sign(&key, "DELETE\n\n/acct/vhds/other.vhd").unwrap();
        assert_ne!(first, third);
    }

    #[test]
    fn signing_rejects_invalid_keys() {
        assert!(sign("not-base64!!!", "payload").is_err());
    }
}

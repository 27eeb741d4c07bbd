use chrono::prelude::*;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{event, instrument, Level};

use crate::libs::errors::Error;

/// The AAD endpoint tokens are requested from
const LOGIN_ENDPOINT: &str = "https://login.microsoftonline.com";

/// The resource audience for ARM tokens
const MANAGEMENT_RESOURCE: &str = "https://management.azure.com/";

/// How close to expiry a cached token is refreshed, in seconds
const REFRESH_MARGIN: i64 = 300;

/// The service principal identity the autoscaler acts as
#[derive(Debug, Clone)]
pub struct AzureCredentials {
    /// The application id of the service principal
    pub app_id: String,
    /// The secret of the service principal
    pub secret: String,
    /// The AAD tenant the principal lives in
    pub tenant: String,
    /// The subscription to operate on
    pub subscription: String,
}

/// The wire shape of a client credentials token response
#[derive(Debug, Deserialize)]
struct TokenResponse {
    /// The bearer token itself
    access_token: String,
    /// Seconds since the epoch this token expires at
    expires_on: String,
}

/// A cached bearer token and when it stops being useful
#[derive(Debug, Clone)]
struct CachedToken {
    /// The bearer token
    token: String,
    /// When this token expires
    expires: DateTime<Utc>,
}

/// Acquires and refreshes ARM bearer tokens
pub(crate) struct TokenManager {
    /// The service principal to authenticate as
    creds: AzureCredentials,
    /// The client to request tokens with
    client: reqwest::Client,
    /// The last token we were handed
    cached: Mutex<Option<CachedToken>>,
}

impl TokenManager {
    /// Create a new token manager
    ///
    /// # Arguments
    ///
    /// * `creds` - The service principal credentials
    /// * `client` - The client to request tokens with
    pub fn new(creds: AzureCredentials, client: reqwest::Client) -> Self {
        TokenManager {
            creds,
            client,
            cached: Mutex::new(None),
        }
    }

    /// Get a valid bearer token, refreshing when close to expiry
    #[instrument(name = "TokenManager::token", skip_all, err(Debug))]
    pub async fn token(&self) -> Result<String, Error> {
        let mut cached = self.cached.lock().await;
        // reuse the cached token while it has comfortable life left
        if let Some(current) = cached.as_ref() {
            if current.expires > Utc::now() + chrono::Duration::seconds(REFRESH_MARGIN) {
                return Ok(current.token.clone());
            }
        }
        // request a fresh token with the client credentials grant
        let url = format!("{}/{}/oauth2/token", LOGIN_ENDPOINT, self.creds.tenant);
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", self.creds.app_id.as_str()),
            ("client_secret", self.creds.secret.as_str()),
            ("resource", MANAGEMENT_RESOURCE),
        ];
        let resp = self.client.post(&url).form(&form).send().await?;
        let resp = super::check(resp).await?;
        let token: TokenResponse = resp.json().await?;
        let expires_on = token.expires_on.parse::<i64>()?;
        let expires = DateTime::<Utc>::from_timestamp(expires_on, 0)
            .ok_or_else(|| Error::new("Token expiry out of range"))?;
        event!(Level::DEBUG, expires = %expires, "acquired management token");
        let fresh = CachedToken {
            token: token.access_token,
            expires,
        };
        *cached = Some(fresh.clone());
        Ok(fresh.token)
    }
}

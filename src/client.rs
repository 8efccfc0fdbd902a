use log::{debug, error, warn};
use reqwest::Method;
use serde_json::Value;
use std::sync::Arc;

use crate::auth::TokenAuthority;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::models::{ActuatorsResponse, LockActionRequest, LockActionType, LockAttributes};
use crate::transport::{HttpRequest, HttpResponse, HttpTransport};

/// Authenticated access to the actuator endpoints
pub struct OpendoorsClient {
    transport: Arc<dyn HttpTransport>,
    authority: Arc<TokenAuthority>,
    base_url: String,
}

impl OpendoorsClient {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        authority: Arc<TokenAuthority>,
        base_url: impl Into<String>,
    ) -> Self {
        let base_url: String = base_url.into();
        Self {
            transport,
            authority,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Wire up transport, token authority and client from a config
    pub fn from_config(transport: Arc<dyn HttpTransport>, config: &Config) -> Self {
        let authority = Arc::new(TokenAuthority::from_config(Arc::clone(&transport), config));
        Self::new(transport, authority, config.api_base_url.as_str())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn authority(&self) -> &Arc<TokenAuthority> {
        &self.authority
    }

    /// Send a request to `path` under the API base URL with the current token.
    ///
    /// Error statuses are returned as responses; a 401 also drops the token so
    /// the next request re-authenticates.
    pub async fn authenticated_request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<HttpResponse> {
        let token = self.authority.get_access_token().await?;
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));

        let mut request = HttpRequest::new(method, url).bearer(token.as_str());
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = self.transport.request(request).await?;
        if response.status == 401 {
            // A newer token may have been issued while this request was out
            warn!("Access token rejected by API, invalidating");
            self.authority.invalidate_token(&token);
        }
        Ok(response)
    }

    pub async fn get_locks(&self) -> Result<Vec<LockAttributes>> {
        debug!("Fetching actuator list");

        let response = self.authenticated_request(Method::GET, "actuators", None).await?;
        if !response.is_success() {
            let error_text = response.body_text();
            error!("Failed to fetch actuators: {}", error_text);
            return Err(Error::Api {
                status: response.status,
                body: error_text,
            });
        }

        // Try to parse it as a direct array first
        match serde_json::from_value::<Vec<LockAttributes>>(response.body.clone()) {
            Ok(locks) => {
                debug!("Found {} actuators", locks.len());
                Ok(locks)
            }
            Err(_) => match serde_json::from_value::<ActuatorsResponse>(response.body) {
                Ok(wrapped) => {
                    debug!(
                        "Found {} actuators (wrapped in 'actuators')",
                        wrapped.actuators.len()
                    );
                    Ok(wrapped.actuators)
                }
                Err(e) => {
                    error!("Failed to parse actuators response: {}", e);
                    Err(Error::Parse(format!(
                        "Failed to parse actuators response: {}",
                        e
                    )))
                }
            },
        }
    }

    pub async fn send_lock_action(&self, uid: &str, action: LockActionType) -> Result<()> {
        debug!("Sending {} to actuator: {}", action, uid);

        let body = serde_json::to_value(LockActionRequest { action })?;
        let path = format!("actuators/{}/actions", uid);
        let response = self
            .authenticated_request(Method::POST, &path, Some(body))
            .await?;

        if response.is_success() {
            debug!("Action {} accepted for actuator: {}", action, uid);
            Ok(())
        } else {
            let error_text = response.body_text();
            error!("Failed to send action to actuator {}: {}", uid, error_text);
            Err(Error::Api {
                status: response.status,
                body: error_text,
            })
        }
    }
}

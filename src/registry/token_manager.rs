//! Token management for long-running pulls
//!
//! Large layer downloads can outlive a short-lived bearer token. The manager hands out
//! the current credential, renegotiates it when it has expired, and replays a request
//! once when the registry answers 401.

use crate::error::{RegistryError, Result};
use crate::logging::Logger;
use crate::registry::auth::{AuthNegotiator, Credential};
use crate::registry::client::{GatedResponse, RegistryClient};
use crate::registry::transport::RegistryRequest;
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;

/// Thread-safe credential holder shared by every request for one repository
#[derive(Clone)]
pub struct TokenManager {
    negotiator: AuthNegotiator,
    repository: String,
    credential: Arc<RwLock<Arc<Credential>>>,
    refresh_lock: Arc<Mutex<()>>,
    output: Logger,
}

impl TokenManager {
    pub fn new(
        negotiator: AuthNegotiator,
        repository: &str,
        credential: Credential,
        output: Logger,
    ) -> Self {
        Self {
            negotiator,
            repository: repository.to_string(),
            credential: Arc::new(RwLock::new(Arc::new(credential))),
            refresh_lock: Arc::new(Mutex::new(())),
            output,
        }
    }

    /// Negotiate the first credential for `repository`
    pub async fn initialize(
        negotiator: AuthNegotiator,
        repository: &str,
        output: Logger,
    ) -> Result<Self> {
        let credential = negotiator.negotiate(repository).await?;
        Ok(Self::new(negotiator, repository, credential, output))
    }

    /// Credential currently in use
    pub fn current(&self) -> Result<Arc<Credential>> {
        let guard = self.credential.read().map_err(|_| {
            RegistryError::Auth("Failed to acquire credential read lock".to_string())
        })?;
        Ok(Arc::clone(&guard))
    }

    /// Current credential, renegotiated first if it has expired
    pub async fn valid_credential(&self) -> Result<Arc<Credential>> {
        let credential = self.current()?;
        if credential.is_expired() {
            self.output.verbose("Pull token expired, renegotiating...");
            return self.refresh(&credential).await;
        }
        Ok(credential)
    }

    /// Replace `stale` with a freshly negotiated credential
    ///
    /// When another task already swapped it out, that newer credential is returned
    /// without asking the registry again.
    pub async fn refresh(&self, stale: &Arc<Credential>) -> Result<Arc<Credential>> {
        let _guard = self.refresh_lock.lock().await;

        let current = self.current()?;
        if !Arc::ptr_eq(&current, stale) {
            return Ok(current);
        }

        let fresh = Arc::new(self.negotiator.negotiate(&self.repository).await?);
        let mut guard = self.credential.write().map_err(|_| {
            RegistryError::Auth("Failed to acquire credential write lock".to_string())
        })?;
        *guard = Arc::clone(&fresh);
        self.output.verbose("Pull token refreshed");
        Ok(fresh)
    }

    /// Send an authorized request, refreshing and replaying it once on 401
    ///
    /// A 401 that survives the replay, or one for a credential that cannot be refreshed,
    /// is handed back like any other status so the caller can report it with its own
    /// repository and reference.
    pub async fn send(
        &self,
        client: &RegistryClient,
        request: RegistryRequest,
    ) -> Result<GatedResponse> {
        let credential = self.valid_credential().await?;
        let response = client.send(credential.apply(request.clone())).await?;
        if response.status() != 401 || !credential.is_refreshable() {
            return Ok(response);
        }
        drop(response);

        self.output.warning("Received 401 Unauthorized - attempting token refresh...");
        let credential = self.refresh(&credential).await?;
        client.send(credential.apply(request)).await
    }
}

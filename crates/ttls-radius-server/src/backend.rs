//! Credential backends
//!
//! A backend answers two questions: does this password belong to this user,
//! and does this EAP-MD5 response match the user's password. "No" is an
//! `Ok(false)`; `Err` is reserved for infrastructure failures, which the
//! protocol layer also treats as a rejection.

use crate::cache::TtlCache;
use crate::config::{AuthCacheSettings, User};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use ttls_radius_proto::eap::eap_md5::compute_response_hash;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Backend unavailable: {0}")]
    Unavailable(String),
    #[error("MD5 challenge authentication not supported by this backend")]
    Md5Unsupported,
}

#[async_trait]
pub trait AuthBackend: Send + Sync {
    async fn authenticate(&self, username: &str, password: &[u8]) -> Result<bool, BackendError>;

    /// Checks an EAP-MD5 response. Backends that never see plaintext
    /// passwords cannot support this.
    async fn authenticate_md5_challenge(
        &self,
        _identifier: u8,
        _username: &str,
        _challenge: &[u8],
        _response: &[u8],
    ) -> Result<bool, BackendError> {
        Err(BackendError::Md5Unsupported)
    }
}

/// Runs a password check and folds backend failures into a rejection.
pub async fn check_password(backend: &dyn AuthBackend, username: &str, password: &[u8]) -> bool {
    match backend.authenticate(username, password).await {
        Ok(result) => result,
        Err(e) => {
            warn!(username = %username, error = %e, "Authentication backend failed");
            false
        }
    }
}

/// Runs an EAP-MD5 check and folds backend failures into a rejection.
pub async fn check_md5_challenge(
    backend: &dyn AuthBackend,
    identifier: u8,
    username: &str,
    challenge: &[u8],
    response: &[u8],
) -> bool {
    match backend
        .authenticate_md5_challenge(identifier, username, challenge, response)
        .await
    {
        Ok(result) => result,
        Err(e) => {
            warn!(username = %username, error = %e, "MD5 challenge backend failed");
            false
        }
    }
}

/// In-memory credential list
#[derive(Debug, Default, Clone)]
pub struct StaticBackend {
    users: HashMap<String, Vec<u8>>,
}

impl StaticBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_users(users: &[User]) -> Self {
        let mut backend = Self::new();
        for user in users {
            backend.add_user(&user.username, &user.password);
        }
        backend
    }

    pub fn add_user(&mut self, username: impl Into<String>, password: impl AsRef<[u8]>) {
        self.users.insert(username.into(), password.as_ref().to_vec());
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

#[async_trait]
impl AuthBackend for StaticBackend {
    async fn authenticate(&self, username: &str, password: &[u8]) -> Result<bool, BackendError> {
        Ok(self
            .users
            .get(username)
            .is_some_and(|stored| stored.as_slice() == password))
    }

    async fn authenticate_md5_challenge(
        &self,
        identifier: u8,
        username: &str,
        challenge: &[u8],
        response: &[u8],
    ) -> Result<bool, BackendError> {
        let Some(password) = self.users.get(username) else {
            return Ok(false);
        };
        Ok(compute_response_hash(identifier, password, challenge).as_slice() == response)
    }
}

/// Remembers password check results: successes for a long time,
/// failures briefly so a mistyped password can be retried soon.
pub struct CachingBackend {
    inner: Arc<dyn AuthBackend>,
    results: TtlCache<(String, [u8; 16]), bool>,
    success_ttl: Duration,
    failure_ttl: Duration,
}

impl CachingBackend {
    pub fn new(inner: Arc<dyn AuthBackend>, settings: &AuthCacheSettings) -> Self {
        let success_ttl = Duration::from_secs(settings.success_ttl_secs);
        CachingBackend {
            inner,
            results: TtlCache::new(success_ttl),
            success_ttl,
            failure_ttl: Duration::from_secs(settings.failure_ttl_secs),
        }
    }

    fn key(username: &str, password: &[u8]) -> (String, [u8; 16]) {
        (username.to_string(), md5::compute(password).0)
    }
}

#[async_trait]
impl AuthBackend for CachingBackend {
    async fn authenticate(&self, username: &str, password: &[u8]) -> Result<bool, BackendError> {
        let key = Self::key(username, password);
        if let Some(result) = self.results.get(&key) {
            debug!(username = %username, result, "Authentication cache hit");
            return Ok(result);
        }

        let result = self.inner.authenticate(username, password).await?;
        let ttl = if result { self.success_ttl } else { self.failure_ttl };
        self.results.set_with_ttl(key, result, ttl);
        Ok(result)
    }

    async fn authenticate_md5_challenge(
        &self,
        identifier: u8,
        username: &str,
        challenge: &[u8],
        response: &[u8],
    ) -> Result<bool, BackendError> {
        // Challenges are single use.
        self.inner
            .authenticate_md5_challenge(identifier, username, challenge, response)
            .await
    }
}

/// Builds the configured backend stack.
pub fn backend_from_users(users: &[User], cache: &AuthCacheSettings) -> Arc<dyn AuthBackend> {
    let backend = StaticBackend::from_users(users);
    if backend.is_empty() {
        warn!("No users configured, every authentication will be rejected");
    }
    debug!(users = backend.len(), cached = cache.enabled, "Static credential backend ready");

    let backend: Arc<dyn AuthBackend> = Arc::new(backend);
    if cache.enabled {
        Arc::new(CachingBackend::new(backend, cache))
    } else {
        backend
    }
}

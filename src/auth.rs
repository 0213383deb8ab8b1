//! Bearer-token acquisition and caching.

use std::time::{Duration, Instant};

use tracing::debug;

use crate::client::{StaClient, TransportError};
use crate::config::Config;

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    issued_at: Instant,
}

/// Obtains bearer tokens and reuses them for a configured TTL.
///
/// The TTL is a client-side refresh window and must stay below the
/// server-enforced token expiry. A failed login leaves the state
/// unauthenticated; the next call simply tries again.
pub struct Authenticator {
    client_id: String,
    client_key: String,
    ttl: Duration,
    cached: Option<CachedToken>,
}

impl Authenticator {
    pub fn new(client_id: String, client_key: String, ttl: Duration) -> Self {
        Self {
            client_id,
            client_key,
            ttl,
            cached: None,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.client_id.clone(),
            config.client_key.clone(),
            config.auth_ttl,
        )
    }

    /// Return a bearer token, logging in only when the cached one has aged
    /// past the TTL.
    pub async fn bearer(&mut self, client: &StaClient) -> Result<String, TransportError> {
        if let Some(cached) = &self.cached {
            if cached.issued_at.elapsed() < self.ttl {
                debug!("Reusing cached bearer token");
                return Ok(cached.token.clone());
            }
            debug!("Cached bearer token aged out");
        }

        let token = client.login(&self.client_id, &self.client_key).await?;
        self.cached = Some(CachedToken {
            token: token.clone(),
            issued_at: Instant::now(),
        });
        Ok(token)
    }

    /// Age the cached token artificially, for TTL tests.
    #[cfg(test)]
    pub(crate) fn backdate(&mut self, age: Duration) {
        if let Some(cached) = &mut self.cached {
            match Instant::now().checked_sub(age) {
                Some(issued_at) => cached.issued_at = issued_at,
                // Process younger than the backdate; dropping the cache
                // forces the same re-login
                None => self.cached = None,
            }
        }
    }
}

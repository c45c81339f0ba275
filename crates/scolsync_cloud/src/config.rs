//! Cloud configuration.

use scolsync_model::ConflictPolicy;
use std::time::Duration;

/// Configuration for the cloud server.
///
/// Both secrets are opaque and must come from the deployment environment;
/// nothing in this crate supplies a default value for them.
#[derive(Debug, Clone)]
pub struct CloudConfig {
    /// Secret for HMAC token signing.
    pub token_secret: Vec<u8>,
    /// 32-byte key protecting tenant setup passwords at rest.
    pub password_key: Vec<u8>,
    /// Bearer token lifetime. Defaults to one year.
    pub token_ttl: Duration,
    /// Upsert conflict policy applied to every push.
    pub conflict_policy: ConflictPolicy,
}

impl CloudConfig {
    /// Creates a configuration from the two deployment secrets.
    pub fn new(token_secret: Vec<u8>, password_key: Vec<u8>) -> Self {
        Self {
            token_secret,
            password_key,
            token_ttl: Duration::from_secs(365 * 24 * 60 * 60),
            conflict_policy: ConflictPolicy::default(),
        }
    }

    /// Sets the token lifetime.
    pub fn with_token_ttl(mut self, ttl: Duration) -> Self {
        self.token_ttl = ttl;
        self
    }

    /// Sets the conflict policy.
    pub fn with_conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }
}

//! The cloud server facade.

use crate::config::CloudConfig;
use crate::crypto::PasswordCipher;
use crate::error::ApiResult;
use crate::gateway::Gateway;
use crate::handler::SyncHandler;
use crate::store::CloudStore;
use crate::token::TokenSigner;
use scolsync_model::{Activation, LicenseSnapshot, PullDelta, PushBatch, PushReport, TenantInfo};
use std::path::Path;
use std::sync::Arc;

/// The central server: gateway + sync handlers over one store.
///
/// This type owns no sockets; an HTTP front end maps requests onto these
/// methods and [`crate::ApiError::status_code`] onto response statuses.
pub struct CloudServer {
    config: CloudConfig,
    store: Arc<CloudStore>,
    gateway: Gateway,
    handler: SyncHandler,
}

impl CloudServer {
    /// Creates a server over an in-memory store.
    pub fn new(config: CloudConfig) -> ApiResult<Self> {
        Self::with_store(config, CloudStore::open_in_memory()?)
    }

    /// Creates a server over a store at the given path.
    pub fn open(config: CloudConfig, path: impl AsRef<Path>) -> ApiResult<Self> {
        Self::with_store(config, CloudStore::open(path)?)
    }

    fn with_store(config: CloudConfig, store: CloudStore) -> ApiResult<Self> {
        let store = Arc::new(store);
        let signer = TokenSigner::new(config.token_secret.clone(), config.token_ttl);
        let cipher = PasswordCipher::new(&config.password_key)?;
        let gateway = Gateway::new(Arc::clone(&store), signer.clone(), cipher);
        let handler = SyncHandler::new(Arc::clone(&store), signer);

        Ok(Self {
            config,
            store,
            gateway,
            handler,
        })
    }

    /// Direct store access for administrative tooling and tests.
    pub fn store(&self) -> &Arc<CloudStore> {
        &self.store
    }

    /// `POST /api/license/activate`
    pub fn activate(
        &self,
        key: &str,
        hwid: &str,
        password: Option<&str>,
    ) -> ApiResult<Activation> {
        self.gateway.activate(key, hwid, password)
    }

    /// `GET /api/license/status`
    pub fn status(
        &self,
        token: &str,
        tenant_id: &str,
        hwid: Option<&str>,
    ) -> ApiResult<LicenseSnapshot> {
        self.gateway.status(token, tenant_id, hwid)
    }

    /// `GET /api/sync/pull`
    pub fn pull(
        &self,
        token: &str,
        tenant_id: &str,
        since: Option<&str>,
        hwid: &str,
    ) -> ApiResult<PullDelta> {
        self.handler.pull(token, tenant_id, since, hwid)
    }

    /// `POST /api/sync/push`
    pub fn push(
        &self,
        token: &str,
        tenant_id: &str,
        hwid: &str,
        batch: &PushBatch,
        tenant_info: Option<&TenantInfo>,
    ) -> ApiResult<PushReport> {
        self.handler.push(
            token,
            tenant_id,
            hwid,
            batch,
            tenant_info,
            self.config.conflict_policy,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server() -> CloudServer {
        let config = CloudConfig::new(b"server-secret".to_vec(), vec![3u8; 32]);
        CloudServer::new(config).unwrap()
    }

    #[test]
    fn end_to_end_activation_and_sync() {
        let server = server();
        let tenant = server.store().create_tenant("EP Lumière", "Goma", "").unwrap();
        server
            .store()
            .issue_license(&tenant, "KEY-1", "2027-08-01T00:00:00Z")
            .unwrap();

        let activation = server.activate("KEY-1", "HW-1", Some("secret123")).unwrap();
        assert_eq!(activation.tenant.id, tenant);

        let snapshot = server
            .status(&activation.token, &tenant, Some("HW-1"))
            .unwrap();
        assert!(snapshot.active);

        let delta = server.pull(&activation.token, &tenant, None, "HW-1").unwrap();
        assert!(delta.students.is_empty());
        assert!(!delta.server_time.is_empty());
    }
}

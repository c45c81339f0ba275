//! The license & device gateway.

use crate::crypto::PasswordCipher;
use crate::error::{ApiError, ApiResult};
use crate::store::CloudStore;
use crate::token::TokenSigner;
use scolsync_model::{Activation, LicenseSnapshot};
use std::sync::Arc;

/// Gates which devices may sync.
///
/// Activation binds a device fingerprint to a license and hands out the
/// long-lived bearer token every sync call presents afterwards.
pub struct Gateway {
    store: Arc<CloudStore>,
    signer: TokenSigner,
    cipher: PasswordCipher,
}

impl Gateway {
    /// Creates a gateway over the store.
    pub fn new(store: Arc<CloudStore>, signer: TokenSigner, cipher: PasswordCipher) -> Self {
        Self {
            store,
            signer,
            cipher,
        }
    }

    /// Activates a device against a license.
    ///
    /// The first activation of a tenant that has no setup password yet stores
    /// the supplied password as that tenant's password (trust-on-first-use:
    /// whoever activates first sets it; a hardening gap inherited from the
    /// deployment model, not a guarantee to build on).
    pub fn activate(
        &self,
        key: &str,
        hwid: &str,
        password: Option<&str>,
    ) -> ApiResult<Activation> {
        if key.is_empty() || hwid.is_empty() {
            return Err(ApiError::Validation("missing key or HWID".into()));
        }

        let license = self
            .store
            .license_by_key(key)?
            .ok_or_else(|| ApiError::NotFound("invalid license key".into()))?;

        match self.store.admin_password(&license.tenant_id)? {
            Some(stored) => {
                let supplied = password
                    .ok_or_else(|| ApiError::Authentication("PASSWORD_REQUIRED".into()))?;
                if self.cipher.decrypt(&stored)? != supplied {
                    return Err(ApiError::Authorization("incorrect password".into()));
                }
            }
            None => {
                let supplied = password.ok_or_else(|| {
                    ApiError::Authentication("PASSWORD_REQUIRED_FOR_SETUP".into())
                })?;
                tracing::warn!(
                    tenant = %license.tenant_id,
                    "bootstrapping tenant setup password on first activation"
                );
                let encrypted = self.cipher.encrypt(supplied)?;
                self.store
                    .set_admin_password(&license.tenant_id, &encrypted)?;
            }
        }

        if !license.is_authorized(hwid) {
            self.store.authorize_hwid(key, hwid)?;
            tracing::info!(tenant = %license.tenant_id, hwid, "authorized new device");
        }

        let tenant = self
            .store
            .tenant_profile(&license.tenant_id)?
            .ok_or_else(|| ApiError::NotFound(format!("tenant {}", license.tenant_id)))?;

        Ok(Activation {
            token: self.signer.issue(&license.tenant_id, key)?,
            tenant,
            expires_at: license.expires_at,
        })
    }

    /// Returns a license snapshot for an authenticated device.
    pub fn status(
        &self,
        token: &str,
        tenant_id: &str,
        hwid: Option<&str>,
    ) -> ApiResult<LicenseSnapshot> {
        let claims = self.signer.verify(token)?;
        if claims.tenant_id != tenant_id {
            return Err(ApiError::Authorization("token tenant mismatch".into()));
        }

        let license = self
            .store
            .license_for_tenant(tenant_id)?
            .ok_or_else(|| ApiError::NotFound("license not found".into()))?;

        if let Some(hwid) = hwid {
            if !license.is_authorized(hwid) {
                return Err(ApiError::Authorization("machine not authorized".into()));
            }
        }

        Ok(LicenseSnapshot {
            key: license.key,
            active: license.active,
            expires_at: license.expires_at,
        })
    }
}

//! Transport abstraction over the cloud endpoints.

use crate::error::SyncResult;
use parking_lot::Mutex;
use scolsync_model::{Activation, PullDelta, PushBatch, PushReport, TenantInfo};

/// Typed access to the cloud's activation and sync endpoints.
///
/// Implementations carry the wire (HTTP + JSON) or bridge directly to the
/// cloud handlers for tests; the engine never sees the difference.
pub trait CloudTransport: Send + Sync {
    /// `POST /api/license/activate`.
    fn activate(&self, key: &str, hwid: &str, password: Option<&str>) -> SyncResult<Activation>;

    /// `GET /api/sync/pull`.
    fn pull(
        &self,
        token: &str,
        tenant_id: &str,
        since: Option<&str>,
        hwid: &str,
    ) -> SyncResult<PullDelta>;

    /// `POST /api/sync/push`.
    fn push(
        &self,
        token: &str,
        tenant_id: &str,
        hwid: &str,
        batch: &PushBatch,
        tenant_info: Option<&TenantInfo>,
    ) -> SyncResult<PushReport>;
}

/// A scripted transport for engine unit tests.
#[derive(Default)]
pub struct MockTransport {
    activation: Mutex<Option<Activation>>,
    pull_response: Mutex<Option<PullDelta>>,
    push_response: Mutex<Option<PushReport>>,
    pushed_batches: Mutex<Vec<PushBatch>>,
}

impl MockTransport {
    /// Creates an empty mock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts the activation response.
    pub fn set_activation(&self, activation: Activation) {
        *self.activation.lock() = Some(activation);
    }

    /// Scripts the next pull response.
    pub fn set_pull_response(&self, delta: PullDelta) {
        *self.pull_response.lock() = Some(delta);
    }

    /// Scripts the next push response.
    pub fn set_push_response(&self, report: PushReport) {
        *self.push_response.lock() = Some(report);
    }

    /// Returns every batch the engine pushed.
    pub fn pushed_batches(&self) -> Vec<PushBatch> {
        self.pushed_batches.lock().clone()
    }
}

impl CloudTransport for MockTransport {
    fn activate(&self, _key: &str, _hwid: &str, _password: Option<&str>) -> SyncResult<Activation> {
        self.activation
            .lock()
            .clone()
            .ok_or_else(|| crate::SyncError::transport_fatal("no activation scripted"))
    }

    fn pull(
        &self,
        _token: &str,
        _tenant_id: &str,
        _since: Option<&str>,
        _hwid: &str,
    ) -> SyncResult<PullDelta> {
        self.pull_response
            .lock()
            .clone()
            .ok_or_else(|| crate::SyncError::transport_retryable("no pull scripted"))
    }

    fn push(
        &self,
        _token: &str,
        _tenant_id: &str,
        _hwid: &str,
        batch: &PushBatch,
        _tenant_info: Option<&TenantInfo>,
    ) -> SyncResult<PushReport> {
        self.pushed_batches.lock().push(batch.clone());
        self.push_response
            .lock()
            .clone()
            .ok_or_else(|| crate::SyncError::transport_retryable("no push scripted"))
    }
}

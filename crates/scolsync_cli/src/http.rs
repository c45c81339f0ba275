//! Blocking HTTP transport against the cloud endpoints.

use scolsync_engine::{CloudTransport, SyncError, SyncResult};
use scolsync_model::{Activation, PullDelta, PushBatch, PushReport, TenantInfo};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;

/// Envelope every cloud endpoint wraps its payload in.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(flatten)]
    payload: Option<T>,
}

/// `CloudTransport` over HTTP + JSON.
pub struct HttpTransport {
    base_url: String,
    client: reqwest::blocking::Client,
}

impl HttpTransport {
    /// Creates a transport against the given base URL.
    pub fn new(base_url: impl Into<String>) -> SyncResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| SyncError::transport_fatal(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into(),
            client,
        })
    }

    fn unwrap_envelope<T: DeserializeOwned>(
        response: reqwest::blocking::Response,
    ) -> SyncResult<T> {
        let status = response.status().as_u16();
        let envelope: Envelope<T> = response
            .json()
            .map_err(|e| SyncError::Protocol(format!("malformed cloud response: {e}")))?;

        if !envelope.success {
            return Err(SyncError::Cloud {
                status,
                message: envelope.error.unwrap_or_else(|| "unknown error".into()),
            });
        }
        envelope
            .payload
            .ok_or_else(|| SyncError::Protocol("cloud response missing payload".into()))
    }

    fn send(&self, request: reqwest::blocking::RequestBuilder) -> SyncResult<reqwest::blocking::Response> {
        request
            .send()
            .map_err(|e| SyncError::transport_retryable(e.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct PullPayload {
    data: PullDelta,
}

#[derive(Debug, Deserialize)]
struct PushPayload {
    results: PushReport,
}

impl CloudTransport for HttpTransport {
    fn activate(&self, key: &str, hwid: &str, password: Option<&str>) -> SyncResult<Activation> {
        let response = self.send(
            self.client
                .post(format!("{}/api/license/activate", self.base_url))
                .json(&serde_json::json!({
                    "key": key,
                    "hwid": hwid,
                    "password": password,
                })),
        )?;
        Self::unwrap_envelope(response)
    }

    fn pull(
        &self,
        token: &str,
        tenant_id: &str,
        since: Option<&str>,
        hwid: &str,
    ) -> SyncResult<PullDelta> {
        let mut query = vec![("tenantId", tenant_id.to_string())];
        if let Some(since) = since {
            query.push(("since", since.to_string()));
        }
        let response = self.send(
            self.client
                .get(format!("{}/api/sync/pull", self.base_url))
                .query(&query)
                .bearer_auth(token)
                .header("X-HWID", hwid),
        )?;
        Self::unwrap_envelope::<PullPayload>(response).map(|p| p.data)
    }

    fn push(
        &self,
        token: &str,
        tenant_id: &str,
        hwid: &str,
        batch: &PushBatch,
        tenant_info: Option<&TenantInfo>,
    ) -> SyncResult<PushReport> {
        let response = self.send(
            self.client
                .post(format!("{}/api/sync/push", self.base_url))
                .bearer_auth(token)
                .header("X-HWID", hwid)
                .json(&serde_json::json!({
                    "tenantId": tenant_id,
                    "data": batch,
                    "tenantInfo": tenant_info,
                })),
        )?;
        Self::unwrap_envelope::<PushPayload>(response).map(|p| p.results)
    }
}

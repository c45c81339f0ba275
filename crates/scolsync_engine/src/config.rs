//! Configuration for the sync engine.

use std::time::Duration;

/// Configuration for the device sync engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// This device's fingerprint, sent as the `X-HWID` header.
    pub hwid: String,
    /// Base URL of the cloud (informational for HTTP transports).
    pub cloud_url: String,
    /// Interval between automatic cycles, if any.
    pub sync_interval: Option<Duration>,
}

impl EngineConfig {
    /// Creates a configuration for a device.
    pub fn new(hwid: impl Into<String>, cloud_url: impl Into<String>) -> Self {
        Self {
            hwid: hwid.into(),
            cloud_url: cloud_url.into(),
            sync_interval: None,
        }
    }

    /// Enables automatic cycles at the given interval.
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = Some(interval);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder() {
        let config = EngineConfig::new("HW-1", "https://cloud.example.com")
            .with_sync_interval(Duration::from_secs(300));
        assert_eq!(config.hwid, "HW-1");
        assert_eq!(config.sync_interval, Some(Duration::from_secs(300)));
    }
}

//! The sync cycle state machine.

use crate::config::EngineConfig;
use crate::error::{SyncError, SyncResult};
use crate::transport::CloudTransport;
use parking_lot::RwLock;
use scolsync_model::{EntityKind, PushBatch, PullDelta};
use scolsync_store::{LocalStore, SyncHistoryEntry};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// The current state of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Not syncing.
    Idle,
    /// Uploading local edits.
    Pushing,
    /// Downloading and applying the cloud delta.
    Pulling,
    /// Last cycle completed.
    Synced,
    /// Last cycle failed.
    Error,
}

impl SyncState {
    /// Returns true if a new cycle may start.
    pub fn can_start_cycle(&self) -> bool {
        matches!(self, SyncState::Idle | SyncState::Synced | SyncState::Error)
    }

    /// Returns a stable name for logging.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Idle => "idle",
            SyncState::Pushing => "pushing",
            SyncState::Pulling => "pulling",
            SyncState::Synced => "synced",
            SyncState::Error => "error",
        }
    }
}

/// Running totals across cycles.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Completed cycles.
    pub cycles_completed: u64,
    /// Total rows pushed.
    pub rows_pushed: u64,
    /// Total rows pulled.
    pub rows_pulled: u64,
    /// Last error message.
    pub last_error: Option<String>,
}

/// Result of one cycle.
#[derive(Debug, Clone)]
pub struct CycleResult {
    /// Rows uploaded (deletions included).
    pub pushed: u64,
    /// Rows applied from the pulled delta (tombstones included).
    pub pulled: u64,
    /// Rows the cloud rejected; they stay dirty and retry next cycle.
    pub rejected: u64,
    /// Wall-clock duration.
    pub duration: Duration,
}

/// Drives push-then-pull cycles between the local store and the cloud.
pub struct SyncEngine<T: CloudTransport> {
    config: EngineConfig,
    store: Arc<LocalStore>,
    transport: Arc<T>,
    state: RwLock<SyncState>,
    stats: RwLock<SyncStats>,
}

impl<T: CloudTransport> SyncEngine<T> {
    /// Creates an engine over a store and a transport.
    pub fn new(config: EngineConfig, store: Arc<LocalStore>, transport: T) -> Self {
        Self {
            config,
            store,
            transport: Arc::new(transport),
            state: RwLock::new(SyncState::Idle),
            stats: RwLock::new(SyncStats::default()),
        }
    }

    /// Current state.
    pub fn state(&self) -> SyncState {
        *self.state.read()
    }

    /// Running totals.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    fn set_state(&self, state: SyncState) {
        *self.state.write() = state;
    }

    /// Activates this device and links the store to the returned tenant.
    pub fn activate(&self, key: &str, password: Option<&str>) -> SyncResult<()> {
        let activation = self
            .transport
            .activate(key, &self.config.hwid, password)?;

        self.store.set_tenant_id(&activation.tenant.id)?;
        self.store.set_license_token(&activation.token)?;
        self.store.set_tenant_info(&scolsync_model::TenantInfo {
            name: activation.tenant.name.clone(),
            city: activation.tenant.city.clone(),
            pobox: activation.tenant.pobox.clone(),
        })?;

        tracing::info!(tenant = %activation.tenant.id, "device activated");
        Ok(())
    }

    /// Runs one push-then-pull cycle.
    pub fn sync_cycle(&self) -> SyncResult<CycleResult> {
        if !self.state().can_start_cycle() {
            return Err(SyncError::CycleInProgress(self.state().as_str()));
        }

        let start = Instant::now();
        let cursor = self.store.sync_cursor()?;
        let kind = if cursor.is_some() {
            "DELTA_SYNC"
        } else {
            "FULL_SYNC"
        };

        let outcome = self.run_cycle(cursor.as_deref());
        let duration = start.elapsed();

        match outcome {
            Ok((pushed, pulled, rejected, records)) => {
                self.set_state(SyncState::Synced);
                {
                    let mut stats = self.stats.write();
                    stats.cycles_completed += 1;
                    stats.rows_pushed += pushed;
                    stats.rows_pulled += pulled;
                    stats.last_error = None;
                }
                self.log_history(kind, "SUCCESS", &records, None, duration);
                tracing::info!(kind, pushed, pulled, rejected, "sync cycle completed");
                Ok(CycleResult {
                    pushed,
                    pulled,
                    rejected,
                    duration,
                })
            }
            Err(e) => {
                self.set_state(SyncState::Error);
                self.stats.write().last_error = Some(e.to_string());
                self.log_history(kind, "ERROR", &serde_json::json!({}), Some(&e), duration);
                tracing::error!(kind, error = %e, "sync cycle failed");
                Err(e)
            }
        }
    }

    fn run_cycle(
        &self,
        cursor: Option<&str>,
    ) -> SyncResult<(u64, u64, u64, serde_json::Value)> {
        let tenant_id = self.store.tenant_id()?.ok_or(SyncError::NotLinked)?;
        let token = self.store.license_token()?.ok_or(SyncError::NotLinked)?;

        // Push phase.
        self.set_state(SyncState::Pushing);
        let batch = self.store.dirty_batch()?;
        let mut pushed = 0u64;
        let mut rejected = 0u64;
        if !batch.is_empty() {
            let tenant_info = self.store.tenant_info()?;
            let report = self.transport.push(
                &token,
                &tenant_id,
                &self.config.hwid,
                &batch,
                Some(&tenant_info),
            )?;
            self.store.mark_synced(&report)?;
            rejected = report.failure_count() as u64;
            pushed = batch_len(&batch) - rejected;
        }

        // Pull phase.
        self.set_state(SyncState::Pulling);
        let delta = self
            .transport
            .pull(&token, &tenant_id, cursor, &self.config.hwid)?;
        self.store.apply_delta(&delta)?;
        let pulled = delta_len(&delta);

        Ok((pushed, pulled, rejected, records_synced(&batch, &delta)))
    }

    fn log_history(
        &self,
        kind: &str,
        status: &str,
        records: &serde_json::Value,
        error: Option<&SyncError>,
        duration: Duration,
    ) {
        let entry = SyncHistoryEntry {
            kind: kind.into(),
            status: status.into(),
            records_synced: records.to_string(),
            error_message: error.map(|e| e.to_string()),
            duration_ms: duration.as_millis() as i64,
            created_at: scolsync_store::now_rfc3339(),
        };
        // History is best-effort; a failed log line must not fail the cycle.
        if let Err(e) = self.store.record_sync_history(&entry) {
            tracing::warn!(error = %e, "failed to record sync history");
        }
    }
}

fn batch_len(batch: &PushBatch) -> u64 {
    (batch.deletions.len()
        + batch.academic_years.len()
        + batch.classes.len()
        + batch.domains.len()
        + batch.students.len()
        + batch.subjects.len()
        + batch.grades.len()
        + batch.notes.len()) as u64
}

fn delta_len(delta: &PullDelta) -> u64 {
    (delta.academic_years.len()
        + delta.classes.len()
        + delta.domains.len()
        + delta.students.len()
        + delta.subjects.len()
        + delta.grades.len()
        + delta.notes.len()
        + delta.tombstones.len()) as u64
}

fn records_synced(batch: &PushBatch, delta: &PullDelta) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    for kind in EntityKind::ALL {
        let (pushed, pulled) = match kind {
            EntityKind::AcademicYear => (batch.academic_years.len(), delta.academic_years.len()),
            EntityKind::Class => (batch.classes.len(), delta.classes.len()),
            EntityKind::Domain => (batch.domains.len(), delta.domains.len()),
            EntityKind::Student => (batch.students.len(), delta.students.len()),
            EntityKind::Subject => (batch.subjects.len(), delta.subjects.len()),
            EntityKind::Grade => (batch.grades.len(), delta.grades.len()),
            EntityKind::Note => (batch.notes.len(), delta.notes.len()),
        };
        if pushed > 0 || pulled > 0 {
            map.insert(
                kind.table_name().to_string(),
                serde_json::json!({ "pushed": pushed, "pulled": pulled }),
            );
        }
    }
    serde_json::Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use scolsync_model::{Activation, AcademicYear, PushReport, RowOutcome, TenantProfile};

    fn engine_with_mock() -> (SyncEngine<MockTransport>, Arc<LocalStore>) {
        let store = Arc::new(LocalStore::open_in_memory().unwrap());
        let config = EngineConfig::new("HW-1", "loopback://");
        let engine = SyncEngine::new(config, Arc::clone(&store), MockTransport::new());
        (engine, store)
    }

    #[test]
    fn state_gates_cycles() {
        assert!(SyncState::Idle.can_start_cycle());
        assert!(SyncState::Synced.can_start_cycle());
        assert!(SyncState::Error.can_start_cycle());
        assert!(!SyncState::Pushing.can_start_cycle());
        assert!(!SyncState::Pulling.can_start_cycle());
    }

    #[test]
    fn unlinked_device_cannot_sync() {
        let (engine, _store) = engine_with_mock();
        let result = engine.sync_cycle();
        assert!(matches!(result, Err(SyncError::NotLinked)));
        assert_eq!(engine.state(), SyncState::Error);
    }

    #[test]
    fn activation_links_store() {
        let (engine, store) = engine_with_mock();
        engine.transport.set_activation(Activation {
            token: "tok".into(),
            tenant: TenantProfile {
                id: "tenant-1".into(),
                name: "EP Lumière".into(),
                city: "Goma".into(),
                pobox: String::new(),
            },
            expires_at: "2027-08-01T00:00:00Z".into(),
        });

        engine.activate("KEY-1", Some("pw")).unwrap();
        assert_eq!(store.tenant_id().unwrap().as_deref(), Some("tenant-1"));
        assert_eq!(store.license_token().unwrap().as_deref(), Some("tok"));
        assert_eq!(store.tenant_info().unwrap().name, "EP Lumière");
    }

    #[test]
    fn cycle_pushes_dirty_rows_then_pulls() {
        let (engine, store) = engine_with_mock();
        store.set_tenant_id("tenant-1").unwrap();
        store.set_license_token("tok").unwrap();

        let year = store
            .create_academic_year(&AcademicYear {
                local_id: 0,
                name: "2025-2026".into(),
                start_date: String::new(),
                end_date: String::new(),
                is_current: true,
            })
            .unwrap();

        engine.transport.set_push_response(PushReport {
            academic_years: vec![RowOutcome::applied(year, "srv-1".into())],
            ..Default::default()
        });
        engine.transport.set_pull_response(PullDelta {
            server_time: "2026-02-01T00:00:00.000Z".into(),
            ..Default::default()
        });

        let result = engine.sync_cycle().unwrap();
        assert_eq!(result.pushed, 1);
        assert_eq!(result.rejected, 0);
        assert_eq!(engine.state(), SyncState::Synced);

        // The pushed row is clean now and the cursor advanced.
        assert!(store.dirty_batch().unwrap().is_empty());
        assert_eq!(
            store.sync_cursor().unwrap().as_deref(),
            Some("2026-02-01T00:00:00.000Z")
        );

        // History recorded the cycle.
        let history = store.recent_sync_history(5).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].kind, "FULL_SYNC");
        assert_eq!(history[0].status, "SUCCESS");

        // A second cycle with nothing dirty performs no push.
        engine.transport.set_pull_response(PullDelta {
            server_time: "2026-02-01T00:05:00.000Z".into(),
            ..Default::default()
        });
        let result = engine.sync_cycle().unwrap();
        assert_eq!(result.pushed, 0);
        assert_eq!(engine.transport.pushed_batches().len(), 1);
        assert_eq!(store.recent_sync_history(5).unwrap()[0].kind, "DELTA_SYNC");
    }

    #[test]
    fn failed_pull_marks_error_and_keeps_cursor() {
        let (engine, store) = engine_with_mock();
        store.set_tenant_id("tenant-1").unwrap();
        store.set_license_token("tok").unwrap();
        // No pull scripted: the transport fails.

        let result = engine.sync_cycle();
        assert!(result.is_err());
        assert_eq!(engine.state(), SyncState::Error);
        assert!(store.sync_cursor().unwrap().is_none());
        assert!(engine.stats().last_error.is_some());

        // Error state still allows the next attempt.
        assert!(engine.state().can_start_cycle());
    }
}

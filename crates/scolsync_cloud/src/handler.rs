//! Pull/push protocol handlers.

use crate::error::{ApiError, ApiResult};
use crate::store::{CloudStore, LicenseRow};
use crate::token::TokenSigner;
use scolsync_model::{
    ConflictPolicy, DeletionOutcome, LocalId, PullDelta, PushBatch, PushReport, RowOutcome,
    ServerId, TenantInfo,
};
use std::sync::Arc;

/// Handles authenticated sync requests.
///
/// Both endpoints share one authorization path: the bearer token must match
/// the requested tenant and the device fingerprint must be on the tenant's
/// license. Authorization failures abort before any side effect.
pub struct SyncHandler {
    store: Arc<CloudStore>,
    signer: TokenSigner,
}

impl SyncHandler {
    /// Creates a handler over the store.
    pub fn new(store: Arc<CloudStore>, signer: TokenSigner) -> Self {
        Self { store, signer }
    }

    fn authorize(&self, token: &str, tenant_id: &str, hwid: &str) -> ApiResult<LicenseRow> {
        if tenant_id.is_empty() {
            return Err(ApiError::Validation("missing tenantId".into()));
        }
        if hwid.is_empty() {
            return Err(ApiError::Validation("missing HWID header".into()));
        }

        let claims = self.signer.verify(token)?;
        if claims.tenant_id != tenant_id {
            return Err(ApiError::Authorization("token tenant mismatch".into()));
        }

        let license = self.store.license_for_tenant(tenant_id)?;
        match license {
            Some(license) if license.is_authorized(hwid) => Ok(license),
            _ => Err(ApiError::Authorization(
                "machine not authorized or no license found".into(),
            )),
        }
    }

    /// Handles a pull request. Read-only; safe to retry indefinitely.
    pub fn pull(
        &self,
        token: &str,
        tenant_id: &str,
        since: Option<&str>,
        hwid: &str,
    ) -> ApiResult<PullDelta> {
        self.authorize(token, tenant_id, hwid)?;

        let delta = self.store.pull_delta(tenant_id, since)?;
        tracing::debug!(
            tenant = tenant_id,
            since = since.unwrap_or("full"),
            students = delta.students.len(),
            grades = delta.grades.len(),
            tombstones = delta.tombstones.len(),
            "pull served"
        );
        Ok(delta)
    }

    /// Handles a push request.
    ///
    /// Phases run in referential dependency order; that order is a
    /// correctness requirement, not an optimization. Every row — upsert or
    /// deletion — yields its own outcome and a failed row never aborts its
    /// phase or the batch.
    pub fn push(
        &self,
        token: &str,
        tenant_id: &str,
        hwid: &str,
        batch: &PushBatch,
        tenant_info: Option<&TenantInfo>,
        policy: ConflictPolicy,
    ) -> ApiResult<PushReport> {
        self.authorize(token, tenant_id, hwid)?;

        let mut report = PushReport::default();

        // Phase 0: tenant metadata.
        if let Some(info) = tenant_info {
            self.store.update_tenant_info(tenant_id, info)?;
        }

        // Phase 1: deletions, each attempted independently.
        for deletion in &batch.deletions {
            let success = match self
                .store
                .delete_entity(tenant_id, deletion.kind, deletion.local_id)
            {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(
                        tenant = tenant_id,
                        table = deletion.kind.table_name(),
                        local_id = deletion.local_id,
                        error = %e,
                        "deletion failed"
                    );
                    false
                }
            };
            report.deletions.push(DeletionOutcome {
                local_id: deletion.local_id,
                kind: deletion.kind,
                success,
            });
        }

        // Phases 2-8: upserts, parents before children.
        report.academic_years = self.run_phase(&batch.academic_years, |row| {
            (row.local_id, self.store.upsert_academic_year(tenant_id, row, policy))
        });
        report.classes = self.run_phase(&batch.classes, |row| {
            (row.local_id, self.store.upsert_class(tenant_id, row, policy))
        });
        report.domains = self.run_phase(&batch.domains, |row| {
            (row.local_id, self.store.upsert_domain(tenant_id, row, policy))
        });
        report.students = self.run_phase(&batch.students, |row| {
            (row.local_id, self.store.upsert_student(tenant_id, row, policy))
        });
        report.subjects = self.run_phase(&batch.subjects, |row| {
            (row.local_id, self.store.upsert_subject(tenant_id, row, policy))
        });
        report.grades = self.run_phase(&batch.grades, |row| {
            (row.local_id, self.store.upsert_grade(tenant_id, row, policy))
        });
        report.notes = self.run_phase(&batch.notes, |row| {
            (row.local_id, self.store.upsert_note(tenant_id, row, policy))
        });

        tracing::info!(
            tenant = tenant_id,
            policy = policy.as_str(),
            failures = report.failure_count(),
            "push applied"
        );
        Ok(report)
    }

    /// Runs one upsert phase sequentially, isolating each row's outcome.
    fn run_phase<T>(
        &self,
        rows: &[T],
        upsert: impl Fn(&T) -> (LocalId, ApiResult<ServerId>),
    ) -> Vec<RowOutcome> {
        rows.iter()
            .map(|row| {
                let (local_id, result) = upsert(row);
                match result {
                    Ok(server_id) => RowOutcome::applied(local_id, server_id),
                    Err(e) => {
                        tracing::warn!(local_id, error = %e, "upsert failed");
                        RowOutcome::failed(local_id, e.to_string())
                    }
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::PasswordCipher;
    use crate::gateway::Gateway;
    use scolsync_model::{AcademicYear, Class, Deletion, EntityKind, Student};
    use std::time::Duration;

    struct Fixture {
        handler: SyncHandler,
        tenant: String,
        token: String,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(CloudStore::open_in_memory().unwrap());
        let tenant = store.create_tenant("EP Lumière", "Goma", "").unwrap();
        store
            .issue_license(&tenant, "KEY-1", "2027-08-01T00:00:00Z")
            .unwrap();
        let signer = TokenSigner::new(b"handler-secret".to_vec(), Duration::from_secs(3600));
        let cipher = PasswordCipher::new(&[1u8; 32]).unwrap();
        let gateway = Gateway::new(Arc::clone(&store), signer.clone(), cipher);
        let activation = gateway.activate("KEY-1", "HW-1", Some("pw")).unwrap();

        Fixture {
            handler: SyncHandler::new(store, signer),
            tenant,
            token: activation.token,
        }
    }

    fn year(local_id: i64) -> AcademicYear {
        AcademicYear {
            local_id,
            name: "2025-2026".into(),
            start_date: String::new(),
            end_date: String::new(),
            is_current: true,
        }
    }

    fn class(local_id: i64, year: Option<i64>) -> Class {
        Class {
            local_id,
            name: "7A".into(),
            level: "7".into(),
            option: String::new(),
            section: String::new(),
            academic_year_local_id: year,
        }
    }

    #[test]
    fn unregistered_hwid_is_forbidden() {
        let f = fixture();

        let pull = f.handler.pull(&f.token, &f.tenant, None, "HW-9");
        assert!(matches!(pull, Err(ApiError::Authorization(_))));

        let push = f.handler.push(
            &f.token,
            &f.tenant,
            "HW-9",
            &PushBatch::default(),
            None,
            ConflictPolicy::LastWriteWins,
        );
        assert!(matches!(push, Err(ApiError::Authorization(_))));
    }

    #[test]
    fn missing_hwid_is_invalid() {
        let f = fixture();
        let result = f.handler.pull(&f.token, &f.tenant, None, "");
        assert!(matches!(result, Err(ApiError::Validation(_))));
    }

    #[test]
    fn tenant_mismatch_is_forbidden() {
        let f = fixture();
        let result = f.handler.pull(&f.token, "someone-else", None, "HW-1");
        assert!(matches!(result, Err(ApiError::Authorization(_))));
    }

    #[test]
    fn one_bad_row_does_not_abort_its_phase() {
        let f = fixture();
        let batch = PushBatch {
            academic_years: vec![year(1)],
            classes: vec![
                class(1, Some(99)), // unresolved parent
                class(2, Some(1)),
            ],
            ..Default::default()
        };

        let report = f
            .handler
            .push(
                &f.token,
                &f.tenant,
                "HW-1",
                &batch,
                None,
                ConflictPolicy::LastWriteWins,
            )
            .unwrap();

        assert_eq!(report.classes.len(), 2);
        assert!(!report.classes[0].success);
        assert!(report.classes[0].error.as_deref().unwrap().contains("not found"));
        assert!(report.classes[1].success);
    }

    #[test]
    fn deletions_report_per_item_and_write_tombstones() {
        let f = fixture();
        let batch = PushBatch {
            deletions: vec![Deletion {
                kind: EntityKind::Student,
                local_id: 5,
            }],
            ..Default::default()
        };

        let report = f
            .handler
            .push(
                &f.token,
                &f.tenant,
                "HW-1",
                &batch,
                None,
                ConflictPolicy::LastWriteWins,
            )
            .unwrap();
        assert_eq!(report.deletions.len(), 1);
        assert!(report.deletions[0].success);

        let delta = f.handler.pull(&f.token, &f.tenant, None, "HW-1").unwrap();
        assert_eq!(delta.tombstones.len(), 1);
    }

    #[test]
    fn push_is_idempotent() {
        let f = fixture();
        let batch = PushBatch {
            academic_years: vec![year(1)],
            classes: vec![class(1, Some(1))],
            students: vec![Student {
                local_id: 1,
                first_name: "Amina".into(),
                last_name: "Kalenga".into(),
                post_name: String::new(),
                gender: "F".into(),
                birth_date: String::new(),
                birthplace: String::new(),
                is_abandoned: false,
                abandon_reason: String::new(),
                class_local_id: Some(1),
            }],
            ..Default::default()
        };

        let first = f
            .handler
            .push(
                &f.token,
                &f.tenant,
                "HW-1",
                &batch,
                None,
                ConflictPolicy::LastWriteWins,
            )
            .unwrap();
        let second = f
            .handler
            .push(
                &f.token,
                &f.tenant,
                "HW-1",
                &batch,
                None,
                ConflictPolicy::LastWriteWins,
            )
            .unwrap();

        // Identical localId -> serverId mappings both times.
        assert_eq!(first.academic_years, second.academic_years);
        assert_eq!(first.classes, second.classes);
        assert_eq!(first.students, second.students);

        let delta = f.handler.pull(&f.token, &f.tenant, None, "HW-1").unwrap();
        assert_eq!(delta.students.len(), 1);
    }

    #[test]
    fn ordering_safety_skip_then_succeed() {
        let f = fixture();

        // Class arrives before its academic year: skipped, state intact.
        let report = f
            .handler
            .push(
                &f.token,
                &f.tenant,
                "HW-1",
                &PushBatch {
                    classes: vec![class(1, Some(1))],
                    ..Default::default()
                },
                None,
                ConflictPolicy::LastWriteWins,
            )
            .unwrap();
        assert!(!report.classes[0].success);

        // Push the year, then re-push the class.
        f.handler
            .push(
                &f.token,
                &f.tenant,
                "HW-1",
                &PushBatch {
                    academic_years: vec![year(1)],
                    ..Default::default()
                },
                None,
                ConflictPolicy::LastWriteWins,
            )
            .unwrap();
        let report = f
            .handler
            .push(
                &f.token,
                &f.tenant,
                "HW-1",
                &PushBatch {
                    classes: vec![class(1, Some(1))],
                    ..Default::default()
                },
                None,
                ConflictPolicy::LastWriteWins,
            )
            .unwrap();
        assert!(report.classes[0].success);
    }

    #[test]
    fn tenant_info_overwrite_is_phase_zero() {
        let f = fixture();
        let info = TenantInfo {
            name: "EP Lumière Renamed".into(),
            city: "Bukavu".into(),
            pobox: "BP 9".into(),
        };
        f.handler
            .push(
                &f.token,
                &f.tenant,
                "HW-1",
                &PushBatch::default(),
                Some(&info),
                ConflictPolicy::LastWriteWins,
            )
            .unwrap();

        let delta = f.handler.pull(&f.token, &f.tenant, None, "HW-1").unwrap();
        assert_eq!(delta.tenant.unwrap().name, "EP Lumière Renamed");
    }
}

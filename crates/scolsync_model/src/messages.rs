//! Push/pull envelopes and gateway payloads.

use crate::entity::{
    AcademicYear, Class, Deletion, Domain, EntityKind, Grade, LocalId, Note, ServerId, Student,
    Subject, Tombstone,
};
use serde::{Deserialize, Serialize};

/// Tenant display metadata mirrored between cloud and devices.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantInfo {
    /// School name.
    #[serde(default)]
    pub name: String,
    /// City.
    #[serde(default)]
    pub city: String,
    /// Postal box.
    #[serde(default)]
    pub pobox: String,
}

/// The tenant as returned by activation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantProfile {
    /// Tenant id (cloud-assigned).
    pub id: String,
    /// School name.
    pub name: String,
    /// City.
    #[serde(default)]
    pub city: String,
    /// Postal box.
    #[serde(default)]
    pub pobox: String,
}

/// Successful activation result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Activation {
    /// Signed bearer token for subsequent sync calls.
    pub token: String,
    /// The tenant this license belongs to.
    pub tenant: TenantProfile,
    /// License expiry, RFC 3339.
    pub expires_at: String,
}

/// License snapshot returned by the status endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LicenseSnapshot {
    /// License key.
    pub key: String,
    /// Whether the license is active.
    pub active: bool,
    /// Expiry, RFC 3339.
    pub expires_at: String,
}

/// Everything a device uploads in one push request.
///
/// Arrays are processed in referential dependency order; any of them may be
/// empty. Deletions always run first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushBatch {
    /// Rows removed on the device since the last push.
    #[serde(default)]
    pub deletions: Vec<Deletion>,
    /// Academic years.
    #[serde(default)]
    pub academic_years: Vec<AcademicYear>,
    /// Classes.
    #[serde(default)]
    pub classes: Vec<Class>,
    /// Domains.
    #[serde(default)]
    pub domains: Vec<Domain>,
    /// Students.
    #[serde(default)]
    pub students: Vec<Student>,
    /// Subjects.
    #[serde(default)]
    pub subjects: Vec<Subject>,
    /// Grades.
    #[serde(default)]
    pub grades: Vec<Grade>,
    /// Notes.
    #[serde(default)]
    pub notes: Vec<Note>,
}

impl PushBatch {
    /// Returns true if there is nothing to upload.
    pub fn is_empty(&self) -> bool {
        self.deletions.is_empty()
            && self.academic_years.is_empty()
            && self.classes.is_empty()
            && self.domains.is_empty()
            && self.students.is_empty()
            && self.subjects.is_empty()
            && self.grades.is_empty()
            && self.notes.is_empty()
    }
}

/// The outcome of one upserted row.
///
/// Every row gets an outcome, successful or not; a failed row never aborts
/// its phase. On success `server_id` carries the cloud identity the device
/// must persist next to the row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowOutcome {
    /// The row's client-local id, echoed back.
    pub local_id: LocalId,
    /// Cloud identity, present on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<ServerId>,
    /// Whether the row was applied.
    pub success: bool,
    /// Failure detail, present when `success` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RowOutcome {
    /// An applied row.
    pub fn applied(local_id: LocalId, server_id: ServerId) -> Self {
        Self {
            local_id,
            server_id: Some(server_id),
            success: true,
            error: None,
        }
    }

    /// A failed row, recorded without aborting the phase.
    pub fn failed(local_id: LocalId, error: impl Into<String>) -> Self {
        Self {
            local_id,
            server_id: None,
            success: false,
            error: Some(error.into()),
        }
    }
}

/// The outcome of one pushed deletion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletionOutcome {
    /// The removed row's client-local id.
    pub local_id: LocalId,
    /// Table the row was removed from.
    #[serde(rename = "tableName")]
    pub kind: EntityKind,
    /// Whether the deletion (and its tombstone) was recorded.
    pub success: bool,
}

/// Per-entity outcomes of one push request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushReport {
    /// Deletion outcomes (phase 1).
    #[serde(default)]
    pub deletions: Vec<DeletionOutcome>,
    /// Academic year outcomes.
    #[serde(default)]
    pub academic_years: Vec<RowOutcome>,
    /// Class outcomes.
    #[serde(default)]
    pub classes: Vec<RowOutcome>,
    /// Domain outcomes.
    #[serde(default)]
    pub domains: Vec<RowOutcome>,
    /// Student outcomes.
    #[serde(default)]
    pub students: Vec<RowOutcome>,
    /// Subject outcomes.
    #[serde(default)]
    pub subjects: Vec<RowOutcome>,
    /// Grade outcomes.
    #[serde(default)]
    pub grades: Vec<RowOutcome>,
    /// Note outcomes.
    #[serde(default)]
    pub notes: Vec<RowOutcome>,
}

impl PushReport {
    /// Iterates the upsert outcomes of one entity kind.
    pub fn rows_for(&self, kind: EntityKind) -> &[RowOutcome] {
        match kind {
            EntityKind::AcademicYear => &self.academic_years,
            EntityKind::Class => &self.classes,
            EntityKind::Domain => &self.domains,
            EntityKind::Student => &self.students,
            EntityKind::Subject => &self.subjects,
            EntityKind::Grade => &self.grades,
            EntityKind::Note => &self.notes,
        }
    }

    /// Total rows that failed to apply, deletions included.
    pub fn failure_count(&self) -> usize {
        let rows = EntityKind::ALL
            .into_iter()
            .flat_map(|k| self.rows_for(k))
            .filter(|r| !r.success)
            .count();
        rows + self.deletions.iter().filter(|d| !d.success).count()
    }
}

/// A pulled row: the entity payload plus its cloud bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pulled<T> {
    /// Cloud identity of the row.
    pub server_id: ServerId,
    /// Cloud-side last modification, RFC 3339.
    pub updated_at: String,
    /// The entity payload, parents flattened to the requester's LocalIds.
    #[serde(flatten)]
    pub row: T,
}

/// Everything a device downloads in one pull response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullDelta {
    /// Cloud clock at query time; becomes the device's next cursor.
    pub server_time: String,
    /// Academic years modified since the cursor.
    #[serde(default)]
    pub academic_years: Vec<Pulled<AcademicYear>>,
    /// Classes modified since the cursor.
    #[serde(default)]
    pub classes: Vec<Pulled<Class>>,
    /// Domains modified since the cursor.
    #[serde(default)]
    pub domains: Vec<Pulled<Domain>>,
    /// Students modified since the cursor (unassigned students excluded).
    #[serde(default)]
    pub students: Vec<Pulled<Student>>,
    /// Subjects modified since the cursor.
    #[serde(default)]
    pub subjects: Vec<Pulled<Subject>>,
    /// Grades modified since the cursor.
    #[serde(default)]
    pub grades: Vec<Pulled<Grade>>,
    /// Notes modified since the cursor.
    #[serde(default)]
    pub notes: Vec<Pulled<Note>>,
    /// Tombstones written since the cursor.
    #[serde(default)]
    pub tombstones: Vec<Tombstone>,
    /// Current tenant metadata.
    #[serde(default)]
    pub tenant: Option<TenantInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_batch() {
        let batch = PushBatch::default();
        assert!(batch.is_empty());

        let batch = PushBatch {
            grades: vec![Grade {
                local_id: 1,
                student_id: 1,
                subject_id: 1,
                period: "1".into(),
                points: 12.0,
            }],
            ..Default::default()
        };
        assert!(!batch.is_empty());
    }

    #[test]
    fn push_batch_tolerates_missing_arrays() {
        let batch: PushBatch = serde_json::from_str(r#"{"students":[]}"#).unwrap();
        assert!(batch.is_empty());
    }

    #[test]
    fn row_outcome_constructors() {
        let ok = RowOutcome::applied(7, "srv-7".into());
        assert!(ok.success);
        assert_eq!(ok.server_id.as_deref(), Some("srv-7"));

        let bad = RowOutcome::failed(8, "unresolved parent");
        assert!(!bad.success);
        assert!(bad.server_id.is_none());
    }

    #[test]
    fn report_failure_count() {
        let report = PushReport {
            classes: vec![
                RowOutcome::applied(1, "a".into()),
                RowOutcome::failed(2, "unresolved parent"),
            ],
            deletions: vec![DeletionOutcome {
                local_id: 3,
                kind: EntityKind::Grade,
                success: false,
            }],
            ..Default::default()
        };
        assert_eq!(report.failure_count(), 2);
    }

    #[test]
    fn pulled_rows_flatten_entity_fields() {
        let json = r#"{
            "serverId": "srv-1",
            "updatedAt": "2026-01-10T08:00:00Z",
            "localId": 4,
            "name": "7A",
            "level": "7",
            "academicYearLocalId": 1
        }"#;
        let pulled: Pulled<Class> = serde_json::from_str(json).unwrap();
        assert_eq!(pulled.server_id, "srv-1");
        assert_eq!(pulled.row.local_id, 4);
        assert_eq!(pulled.row.academic_year_local_id, Some(1));
    }
}

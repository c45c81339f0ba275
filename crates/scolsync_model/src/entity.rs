//! Domain entities and the closed union of synchronizable tables.

use serde::{Deserialize, Serialize};

/// Client-assigned row identifier, unique within `(tenant, table)`.
pub type LocalId = i64;

/// Cloud-assigned globally unique identifier, minted on first upsert.
pub type ServerId = String;

/// The closed set of synchronizable tables.
///
/// Replaces string-keyed dispatch on wire table names: every place that used
/// to branch on a table-name string now matches this enum exhaustively.
/// Unknown names are rejected at the wire boundary during deserialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    /// `academic_years`
    #[serde(rename = "academic_years")]
    AcademicYear,
    /// `classes`
    #[serde(rename = "classes")]
    Class,
    /// `domains`
    #[serde(rename = "domains")]
    Domain,
    /// `students`
    #[serde(rename = "students")]
    Student,
    /// `subjects`
    #[serde(rename = "subjects")]
    Subject,
    /// `grades`
    #[serde(rename = "grades")]
    Grade,
    /// `notes`
    #[serde(rename = "notes")]
    Note,
}

impl EntityKind {
    /// All kinds in referential dependency order (parents before children).
    pub const ALL: [EntityKind; 7] = [
        EntityKind::AcademicYear,
        EntityKind::Class,
        EntityKind::Domain,
        EntityKind::Student,
        EntityKind::Subject,
        EntityKind::Grade,
        EntityKind::Note,
    ];

    /// Returns the SQL table name for this kind.
    pub fn table_name(&self) -> &'static str {
        match self {
            EntityKind::AcademicYear => "academic_years",
            EntityKind::Class => "classes",
            EntityKind::Domain => "domains",
            EntityKind::Student => "students",
            EntityKind::Subject => "subjects",
            EntityKind::Grade => "grades",
            EntityKind::Note => "notes",
        }
    }

    /// Parses a wire table name.
    pub fn from_table_name(name: &str) -> Option<Self> {
        EntityKind::ALL.into_iter().find(|k| k.table_name() == name)
    }
}

/// A deletion queued on a device, pushed ahead of every upsert phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deletion {
    /// Table the row was removed from.
    #[serde(rename = "tableName")]
    pub kind: EntityKind,
    /// The removed row's client-local id.
    pub local_id: LocalId,
}

/// The permanent record that a row was intentionally removed.
///
/// Tombstones are append-only: once written they are never deleted, and every
/// pull whose `since` predates `deleted_at` must surface them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tombstone {
    /// Table the row was removed from.
    #[serde(rename = "tableName")]
    pub kind: EntityKind,
    /// The removed row's client-local id.
    pub local_id: LocalId,
    /// RFC 3339 deletion timestamp, assigned by the cloud.
    pub deleted_at: String,
}

/// A school year (e.g. "2025-2026"). Root of the referential tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcademicYear {
    /// Client-local id.
    pub local_id: LocalId,
    /// Display name.
    pub name: String,
    /// Start date (ISO day).
    #[serde(default)]
    pub start_date: String,
    /// End date (ISO day).
    #[serde(default)]
    pub end_date: String,
    /// Whether this is the active year on the device.
    #[serde(default, with = "flag")]
    pub is_current: bool,
}

/// A class (group of students) within one academic year.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Class {
    /// Client-local id.
    pub local_id: LocalId,
    /// Display name.
    pub name: String,
    /// School level; devices may send numbers, stored as text.
    #[serde(default, with = "loose_string")]
    pub level: String,
    /// Study option (track), may be empty.
    #[serde(default)]
    pub option: String,
    /// Section letter, may be empty.
    #[serde(default)]
    pub section: String,
    /// Parent academic year, as the sender's LocalId. Required to sync.
    #[serde(default)]
    pub academic_year_local_id: Option<LocalId>,
}

/// A subject grouping used when laying out report cards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Domain {
    /// Client-local id.
    pub local_id: LocalId,
    /// Display name.
    pub name: String,
    /// Sort position.
    #[serde(default)]
    pub display_order: i64,
}

/// A student. Students without a class assignment stay local-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Student {
    /// Client-local id.
    pub local_id: LocalId,
    /// First name.
    pub first_name: String,
    /// Last name.
    pub last_name: String,
    /// Post name (middle/family extension), may be empty.
    #[serde(default)]
    pub post_name: String,
    /// Gender marker as entered on the device.
    #[serde(default)]
    pub gender: String,
    /// Birth date (ISO day).
    #[serde(default)]
    pub birth_date: String,
    /// Birthplace, may be empty.
    #[serde(default)]
    pub birthplace: String,
    /// Whether the student abandoned during the year.
    #[serde(default, with = "flag")]
    pub is_abandoned: bool,
    /// Abandonment reason, may be empty.
    #[serde(default)]
    pub abandon_reason: String,
    /// Parent class, as the sender's LocalId. Optional (draft students).
    #[serde(default)]
    pub class_local_id: Option<LocalId>,
}

/// A subject taught to one class, with per-period mark maxima.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subject {
    /// Client-local id.
    pub local_id: LocalId,
    /// Display name.
    pub name: String,
    /// Short code, may be empty.
    #[serde(default)]
    pub code: String,
    /// Category label, may be empty.
    #[serde(default)]
    pub category: String,
    /// Sub-domain label, may be empty.
    #[serde(default)]
    pub sub_domain: String,
    /// Maximum mark, period 1.
    #[serde(default = "default_period_max")]
    pub max_p1: f64,
    /// Maximum mark, period 2.
    #[serde(default = "default_period_max")]
    pub max_p2: f64,
    /// Maximum mark, first exam.
    #[serde(default = "default_exam_max")]
    pub max_exam1: f64,
    /// Maximum mark, period 3.
    #[serde(default = "default_period_max")]
    pub max_p3: f64,
    /// Maximum mark, period 4.
    #[serde(default = "default_period_max")]
    pub max_p4: f64,
    /// Maximum mark, second exam.
    #[serde(default = "default_exam_max")]
    pub max_exam2: f64,
    /// Parent class, as the sender's LocalId. Required to sync.
    #[serde(default)]
    pub class_local_id: Option<LocalId>,
    /// Parent domain, as the sender's LocalId. Optional.
    #[serde(default)]
    pub domain_local_id: Option<LocalId>,
}

/// One mark cell: a student's points in a subject for one period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Grade {
    /// Client-local id.
    pub local_id: LocalId,
    /// Parent student, as the sender's LocalId.
    pub student_id: LocalId,
    /// Parent subject, as the sender's LocalId.
    pub subject_id: LocalId,
    /// Period key; devices may send numbers, stored as text.
    #[serde(default, with = "loose_string")]
    pub period: String,
    /// Points obtained.
    #[serde(default)]
    pub points: f64,
}

/// A free-form note attached to an academic year.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    /// Client-local id.
    pub local_id: LocalId,
    /// Title.
    pub title: String,
    /// Body.
    #[serde(default)]
    pub content: String,
    /// Parent academic year, as the sender's LocalId. Required to sync.
    #[serde(default)]
    pub academic_year_local_id: Option<LocalId>,
}

fn default_period_max() -> f64 {
    10.0
}

fn default_exam_max() -> f64 {
    20.0
}

/// Lenient boolean codec: devices with integer-backed stores send 0/1.
mod flag {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &bool, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bool(*value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Bool(bool),
            Int(i64),
        }
        Ok(match Raw::deserialize(deserializer)? {
            Raw::Bool(b) => b,
            Raw::Int(i) => i != 0,
        })
    }
}

/// Lenient string codec: accepts a JSON string or number, stores text.
mod loose_string {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &str, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Int(i64),
            Float(f64),
        }
        Ok(match Raw::deserialize(deserializer)? {
            Raw::Text(s) => s,
            Raw::Int(i) => i.to_string(),
            Raw::Float(f) => f.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_table_names_roundtrip() {
        for kind in EntityKind::ALL {
            assert_eq!(EntityKind::from_table_name(kind.table_name()), Some(kind));
        }
        assert_eq!(EntityKind::from_table_name("settings"), None);
    }

    #[test]
    fn deletion_wire_format() {
        let del: Deletion =
            serde_json::from_str(r#"{"tableName":"students","localId":42}"#).unwrap();
        assert_eq!(del.kind, EntityKind::Student);
        assert_eq!(del.local_id, 42);

        let json = serde_json::to_string(&del).unwrap();
        assert!(json.contains(r#""tableName":"students""#));
    }

    #[test]
    fn deletion_rejects_unknown_table() {
        let result: Result<Deletion, _> =
            serde_json::from_str(r#"{"tableName":"licenses","localId":1}"#);
        assert!(result.is_err());
    }

    #[test]
    fn booleans_accept_sqlite_integers() {
        let year: AcademicYear = serde_json::from_str(
            r#"{"localId":1,"name":"2025-2026","isCurrent":1}"#,
        )
        .unwrap();
        assert!(year.is_current);

        let year: AcademicYear = serde_json::from_str(
            r#"{"localId":1,"name":"2025-2026","isCurrent":false}"#,
        )
        .unwrap();
        assert!(!year.is_current);
    }

    #[test]
    fn class_level_accepts_numbers() {
        let class: Class =
            serde_json::from_str(r#"{"localId":3,"name":"7A","level":7}"#).unwrap();
        assert_eq!(class.level, "7");
        assert_eq!(class.academic_year_local_id, None);
    }

    #[test]
    fn subject_defaults_mark_maxima() {
        let subject: Subject =
            serde_json::from_str(r#"{"localId":5,"name":"Maths","classLocalId":3}"#).unwrap();
        assert_eq!(subject.max_p1, 10.0);
        assert_eq!(subject.max_exam2, 20.0);
        assert_eq!(subject.class_local_id, Some(3));
    }

    #[test]
    fn grade_period_accepts_numbers() {
        let grade: Grade = serde_json::from_str(
            r#"{"localId":9,"studentId":1,"subjectId":2,"period":1,"points":14.5}"#,
        )
        .unwrap();
        assert_eq!(grade.period, "1");
        assert_eq!(grade.points, 14.5);
    }
}

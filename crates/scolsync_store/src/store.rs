//! The device-local store.

use crate::error::{StoreError, StoreResult};
use crate::schema;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use scolsync_model::{
    AcademicYear, Class, Domain, EntityKind, Grade, LocalId, Note, Student, Subject, TenantInfo,
};
use serde::Serialize;
use std::path::Path;

/// The embedded store holding one site's data.
///
/// All access goes through prepared statements on a single connection; the
/// LAN hub and the sync engine share one instance behind an `Arc`.
pub struct LocalStore {
    pub(crate) conn: Mutex<Connection>,
}

impl LocalStore {
    /// Opens (and migrates) the store at the given path.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Opens an in-memory store. Used by tests and the hub's demo mode.
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ===== Settings =====

    /// Reads one setting.
    pub fn setting(&self, key: &str) -> StoreResult<Option<String>> {
        let conn = self.conn.lock();
        let value = conn
            .query_row("SELECT value FROM settings WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    /// Writes one setting.
    pub fn set_setting(&self, key: &str, value: &str) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            [key, value],
        )?;
        Ok(())
    }

    /// The tenant this device is linked to, if activated.
    pub fn tenant_id(&self) -> StoreResult<Option<String>> {
        self.setting("tenant_id")
    }

    /// Links the device to a tenant.
    pub fn set_tenant_id(&self, tenant_id: &str) -> StoreResult<()> {
        self.set_setting("tenant_id", tenant_id)
    }

    /// The stored bearer token, if activated.
    pub fn license_token(&self) -> StoreResult<Option<String>> {
        self.setting("license_token")
    }

    /// Stores the bearer token obtained from activation.
    pub fn set_license_token(&self, token: &str) -> StoreResult<()> {
        self.set_setting("license_token", token)
    }

    /// The pull cursor (server time of the last applied delta).
    pub fn sync_cursor(&self) -> StoreResult<Option<String>> {
        self.setting("last_sync_time")
    }

    /// Advances the pull cursor.
    pub fn set_sync_cursor(&self, server_time: &str) -> StoreResult<()> {
        self.set_setting("last_sync_time", server_time)
    }

    /// Tenant display metadata mirrored from the cloud.
    pub fn tenant_info(&self) -> StoreResult<TenantInfo> {
        Ok(TenantInfo {
            name: self.setting("school_name")?.unwrap_or_default(),
            city: self.setting("school_city")?.unwrap_or_default(),
            pobox: self.setting("school_pobox")?.unwrap_or_default(),
        })
    }

    /// Stores tenant display metadata.
    pub fn set_tenant_info(&self, info: &TenantInfo) -> StoreResult<()> {
        self.set_setting("school_name", &info.name)?;
        self.set_setting("school_city", &info.city)?;
        self.set_setting("school_pobox", &info.pobox)
    }

    // ===== Local creation (rows born dirty) =====

    /// Inserts an academic year; returns the assigned LocalId.
    pub fn create_academic_year(&self, year: &AcademicYear) -> StoreResult<LocalId> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO academic_years (name, start_date, end_date, is_current, last_modified_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                year.name,
                year.start_date,
                year.end_date,
                year.is_current,
                crate::now_rfc3339()
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Inserts a class; returns the assigned LocalId.
    pub fn create_class(&self, class: &Class) -> StoreResult<LocalId> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO classes (name, level, option, section, academic_year_id, last_modified_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                class.name,
                class.level,
                class.option,
                class.section,
                class.academic_year_local_id,
                crate::now_rfc3339()
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Inserts a domain; returns the assigned LocalId.
    pub fn create_domain(&self, domain: &Domain) -> StoreResult<LocalId> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO domains (name, display_order, last_modified_at) VALUES (?1, ?2, ?3)",
            params![domain.name, domain.display_order, crate::now_rfc3339()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Inserts a student; returns the assigned LocalId.
    pub fn create_student(&self, student: &Student) -> StoreResult<LocalId> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO students (first_name, last_name, post_name, gender, birth_date,
                                   birthplace, is_abandoned, abandon_reason, class_id,
                                   last_modified_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                student.first_name,
                student.last_name,
                student.post_name,
                student.gender,
                student.birth_date,
                student.birthplace,
                student.is_abandoned,
                student.abandon_reason,
                student.class_local_id,
                crate::now_rfc3339()
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Inserts a subject; returns the assigned LocalId.
    pub fn create_subject(&self, subject: &Subject) -> StoreResult<LocalId> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO subjects (name, code, category, sub_domain, max_p1, max_p2, max_exam1,
                                   max_p3, max_p4, max_exam2, class_id, domain_id,
                                   last_modified_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                subject.name,
                subject.code,
                subject.category,
                subject.sub_domain,
                subject.max_p1,
                subject.max_p2,
                subject.max_exam1,
                subject.max_p3,
                subject.max_p4,
                subject.max_exam2,
                subject.class_local_id,
                subject.domain_local_id,
                crate::now_rfc3339()
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Inserts a grade cell; returns the assigned LocalId.
    pub fn create_grade(&self, grade: &Grade) -> StoreResult<LocalId> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO grades (student_id, subject_id, period, value, last_modified_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                grade.student_id,
                grade.subject_id,
                grade.period,
                grade.points,
                crate::now_rfc3339()
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Inserts a note; returns the assigned LocalId.
    pub fn create_note(&self, note: &Note) -> StoreResult<LocalId> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO notes (title, content, academic_year_id, last_modified_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                note.title,
                note.content,
                note.academic_year_local_id,
                crate::now_rfc3339()
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    // ===== Deletion =====

    /// Deletes a row and queues the deletion for the next push.
    ///
    /// Returns false when the row did not exist (nothing is queued).
    pub fn delete_row(&self, kind: EntityKind, id: LocalId) -> StoreResult<bool> {
        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction()?;
        let removed = tx.execute(
            &format!("DELETE FROM {} WHERE id = ?1", kind.table_name()),
            [id],
        )?;
        if removed > 0 {
            tx.execute(
                "INSERT OR REPLACE INTO sync_deletions (table_name, local_id, queued_at)
                 VALUES (?1, ?2, ?3)",
                params![kind.table_name(), id, crate::now_rfc3339()],
            )?;
        }
        tx.commit()?;
        Ok(removed > 0)
    }

    // ===== Grade batch (LAN hub) =====

    /// Applies a batch of grade cells in one transaction.
    ///
    /// Cells are keyed by `(student_id, subject_id, period)`; existing cells
    /// are overwritten. Either every cell commits or none do.
    pub fn upsert_grade_cells(&self, cells: &[GradeCell]) -> StoreResult<usize> {
        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction()?;
        let now = crate::now_rfc3339();
        {
            let mut stmt = tx.prepare(
                "INSERT INTO grades (student_id, subject_id, period, value, is_dirty,
                                     last_modified_at)
                 VALUES (?1, ?2, ?3, ?4, 1, ?5)
                 ON CONFLICT(student_id, subject_id, period) DO UPDATE SET
                     value = excluded.value,
                     is_dirty = 1,
                     last_modified_at = excluded.last_modified_at",
            )?;
            for cell in cells {
                stmt.execute(params![
                    cell.student_id,
                    cell.subject_id,
                    cell.period,
                    cell.value,
                    now
                ])?;
            }
        }
        tx.commit()?;
        Ok(cells.len())
    }

    // ===== Projections (LAN hub) =====

    /// Lists every class, ordered for display.
    pub fn list_classes(&self) -> StoreResult<Vec<ClassSummary>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, name, level, option, section, academic_year_id
             FROM classes ORDER BY level, section",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ClassSummary {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    level: row.get(2)?,
                    option: row.get(3)?,
                    section: row.get(4)?,
                    academic_year_id: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Loads one class's students, subjects, and grades.
    pub fn class_full(&self, class_id: LocalId) -> StoreResult<ClassFull> {
        let conn = self.conn.lock();

        let exists: Option<i64> = conn
            .query_row("SELECT id FROM classes WHERE id = ?1", [class_id], |row| {
                row.get(0)
            })
            .optional()?;
        if exists.is_none() {
            return Err(StoreError::RowNotFound {
                table: "classes",
                id: class_id,
            });
        }

        let mut stmt = conn.prepare(
            "SELECT id, first_name, last_name, post_name, gender, is_abandoned, class_id
             FROM students WHERE class_id = ?1 ORDER BY last_name, first_name",
        )?;
        let students = stmt
            .query_map([class_id], |row| {
                Ok(StudentRow {
                    id: row.get(0)?,
                    first_name: row.get(1)?,
                    last_name: row.get(2)?,
                    post_name: row.get(3)?,
                    gender: row.get(4)?,
                    is_abandoned: row.get(5)?,
                    class_id: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare(
            "SELECT id, name, code, category, max_p1, max_p2, max_exam1, max_p3, max_p4,
                    max_exam2, class_id, domain_id
             FROM subjects WHERE class_id = ?1 ORDER BY name",
        )?;
        let subjects = stmt
            .query_map([class_id], |row| {
                Ok(SubjectRow {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    code: row.get(2)?,
                    category: row.get(3)?,
                    max_p1: row.get(4)?,
                    max_p2: row.get(5)?,
                    max_exam1: row.get(6)?,
                    max_p3: row.get(7)?,
                    max_p4: row.get(8)?,
                    max_exam2: row.get(9)?,
                    class_id: row.get(10)?,
                    domain_id: row.get(11)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare(
            "SELECT g.id, g.student_id, g.subject_id, g.period, g.value
             FROM grades g JOIN students s ON g.student_id = s.id
             WHERE s.class_id = ?1",
        )?;
        let grades = stmt
            .query_map([class_id], |row| {
                Ok(GradeRow {
                    id: row.get(0)?,
                    student_id: row.get(1)?,
                    subject_id: row.get(2)?,
                    period: row.get(3)?,
                    value: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ClassFull {
            students,
            subjects,
            grades,
        })
    }

    /// Counts rows of one kind. Test and diagnostics helper.
    pub fn count(&self, kind: EntityKind) -> StoreResult<i64> {
        let conn = self.conn.lock();
        let count = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", kind.table_name()),
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

/// One grade cell as posted by a LAN client.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, Serialize)]
pub struct GradeCell {
    /// Student LocalId.
    pub student_id: LocalId,
    /// Subject LocalId.
    pub subject_id: LocalId,
    /// Period key.
    pub period: String,
    /// Points.
    pub value: f64,
}

/// The full projection of one class: its students, subjects, and grades.
#[derive(Debug, Clone, Serialize)]
pub struct ClassFull {
    /// Students of the class.
    pub students: Vec<StudentRow>,
    /// Subjects taught to the class.
    pub subjects: Vec<SubjectRow>,
    /// Every grade cell belonging to the class's students.
    pub grades: Vec<GradeRow>,
}

/// A class as listed by `GET /api/classes`.
#[derive(Debug, Clone, Serialize)]
pub struct ClassSummary {
    /// LocalId.
    pub id: LocalId,
    /// Display name.
    pub name: String,
    /// Level.
    pub level: String,
    /// Option (track).
    pub option: String,
    /// Section.
    pub section: String,
    /// Parent academic year LocalId.
    pub academic_year_id: Option<LocalId>,
}

/// A student row in the class projection.
#[derive(Debug, Clone, Serialize)]
pub struct StudentRow {
    /// LocalId.
    pub id: LocalId,
    /// First name.
    pub first_name: String,
    /// Last name.
    pub last_name: String,
    /// Post name.
    pub post_name: String,
    /// Gender marker.
    pub gender: String,
    /// Abandonment flag.
    pub is_abandoned: bool,
    /// Parent class LocalId.
    pub class_id: Option<LocalId>,
}

/// A subject row in the class projection.
#[derive(Debug, Clone, Serialize)]
pub struct SubjectRow {
    /// LocalId.
    pub id: LocalId,
    /// Display name.
    pub name: String,
    /// Short code.
    pub code: String,
    /// Category label.
    pub category: String,
    /// Maximum mark, period 1.
    pub max_p1: f64,
    /// Maximum mark, period 2.
    pub max_p2: f64,
    /// Maximum mark, first exam.
    pub max_exam1: f64,
    /// Maximum mark, period 3.
    pub max_p3: f64,
    /// Maximum mark, period 4.
    pub max_p4: f64,
    /// Maximum mark, second exam.
    pub max_exam2: f64,
    /// Parent class LocalId.
    pub class_id: Option<LocalId>,
    /// Parent domain LocalId.
    pub domain_id: Option<LocalId>,
}

/// A grade row in the class projection.
#[derive(Debug, Clone, Serialize)]
pub struct GradeRow {
    /// LocalId.
    pub id: LocalId,
    /// Student LocalId.
    pub student_id: LocalId,
    /// Subject LocalId.
    pub subject_id: LocalId,
    /// Period key.
    pub period: String,
    /// Points.
    pub value: f64,
}

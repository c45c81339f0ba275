//! Sync-facing store operations: dirty collection, acknowledgement, and
//! delta application.

use crate::error::StoreResult;
use crate::store::LocalStore;
use rusqlite::params;
use scolsync_model::{
    AcademicYear, Class, Deletion, Domain, EntityKind, Grade, Note, PullDelta, PushBatch,
    PushReport, Student, Subject,
};
use serde::Serialize;

impl LocalStore {
    /// Collects every dirty row and queued deletion into a push batch.
    ///
    /// Parent references are already LocalIds on the device, so rows map
    /// straight onto their wire payloads.
    pub fn dirty_batch(&self) -> StoreResult<PushBatch> {
        let conn = self.conn.lock();

        let mut batch = PushBatch::default();

        let mut stmt = conn.prepare(
            "SELECT table_name, local_id FROM sync_deletions ORDER BY queued_at",
        )?;
        let deletions = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in deletions {
            let (table, local_id) = row?;
            // delete_row only queues known table names.
            if let Some(kind) = EntityKind::from_table_name(&table) {
                batch.deletions.push(Deletion { kind, local_id });
            }
        }

        let mut stmt = conn.prepare(
            "SELECT id, name, start_date, end_date, is_current
             FROM academic_years WHERE is_dirty = 1",
        )?;
        batch.academic_years = stmt
            .query_map([], |row| {
                Ok(AcademicYear {
                    local_id: row.get(0)?,
                    name: row.get(1)?,
                    start_date: row.get(2)?,
                    end_date: row.get(3)?,
                    is_current: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare(
            "SELECT id, name, level, option, section, academic_year_id
             FROM classes WHERE is_dirty = 1",
        )?;
        batch.classes = stmt
            .query_map([], |row| {
                Ok(Class {
                    local_id: row.get(0)?,
                    name: row.get(1)?,
                    level: row.get(2)?,
                    option: row.get(3)?,
                    section: row.get(4)?,
                    academic_year_local_id: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare(
            "SELECT id, name, display_order FROM domains WHERE is_dirty = 1",
        )?;
        batch.domains = stmt
            .query_map([], |row| {
                Ok(Domain {
                    local_id: row.get(0)?,
                    name: row.get(1)?,
                    display_order: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare(
            "SELECT id, first_name, last_name, post_name, gender, birth_date, birthplace,
                    is_abandoned, abandon_reason, class_id
             FROM students WHERE is_dirty = 1",
        )?;
        batch.students = stmt
            .query_map([], |row| {
                Ok(Student {
                    local_id: row.get(0)?,
                    first_name: row.get(1)?,
                    last_name: row.get(2)?,
                    post_name: row.get(3)?,
                    gender: row.get(4)?,
                    birth_date: row.get(5)?,
                    birthplace: row.get(6)?,
                    is_abandoned: row.get(7)?,
                    abandon_reason: row.get(8)?,
                    class_local_id: row.get(9)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare(
            "SELECT id, name, code, category, sub_domain, max_p1, max_p2, max_exam1, max_p3,
                    max_p4, max_exam2, class_id, domain_id
             FROM subjects WHERE is_dirty = 1",
        )?;
        batch.subjects = stmt
            .query_map([], |row| {
                Ok(Subject {
                    local_id: row.get(0)?,
                    name: row.get(1)?,
                    code: row.get(2)?,
                    category: row.get(3)?,
                    sub_domain: row.get(4)?,
                    max_p1: row.get(5)?,
                    max_p2: row.get(6)?,
                    max_exam1: row.get(7)?,
                    max_p3: row.get(8)?,
                    max_p4: row.get(9)?,
                    max_exam2: row.get(10)?,
                    class_local_id: row.get(11)?,
                    domain_local_id: row.get(12)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare(
            "SELECT id, student_id, subject_id, period, value FROM grades WHERE is_dirty = 1",
        )?;
        batch.grades = stmt
            .query_map([], |row| {
                Ok(Grade {
                    local_id: row.get(0)?,
                    student_id: row.get(1)?,
                    subject_id: row.get(2)?,
                    period: row.get(3)?,
                    points: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare(
            "SELECT id, title, content, academic_year_id FROM notes WHERE is_dirty = 1",
        )?;
        batch.notes = stmt
            .query_map([], |row| {
                Ok(Note {
                    local_id: row.get(0)?,
                    title: row.get(1)?,
                    content: row.get(2)?,
                    academic_year_local_id: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(batch)
    }

    /// Applies a push report: stores server ids, clears dirty flags, and
    /// drops acknowledged deletions.
    ///
    /// Failed rows keep their dirty flag (and queued deletion) so the next
    /// cycle retries them.
    pub fn mark_synced(&self, report: &PushReport) -> StoreResult<()> {
        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction()?;

        for kind in EntityKind::ALL {
            let sql = format!(
                "UPDATE {} SET server_id = ?1, is_dirty = 0 WHERE id = ?2",
                kind.table_name()
            );
            let mut stmt = tx.prepare(&sql)?;
            for outcome in report.rows_for(kind).iter().filter(|r| r.success) {
                stmt.execute(params![outcome.server_id, outcome.local_id])?;
            }
        }

        {
            let mut stmt = tx.prepare(
                "DELETE FROM sync_deletions WHERE table_name = ?1 AND local_id = ?2",
            )?;
            for deletion in report.deletions.iter().filter(|d| d.success) {
                stmt.execute(params![deletion.kind.table_name(), deletion.local_id])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Applies a pulled delta in one transaction.
    ///
    /// Locally dirty rows are never overwritten (the dirty guard); pulled
    /// tombstones remove clean local rows and cancel any queued deletion for
    /// the same row. Finishes by advancing the cursor to `server_time`.
    pub fn apply_delta(&self, delta: &PullDelta) -> StoreResult<()> {
        let conn = self.conn.lock();

        // Rows arrive parents-first but an incremental delta may reference
        // parents that predate the cursor, so constraints are suspended for
        // the duration of the transaction.
        conn.execute_batch("PRAGMA foreign_keys = OFF;")?;
        let applied = (|| -> StoreResult<()> {
            let tx = conn.unchecked_transaction()?;

            {
                let mut stmt = tx.prepare(
                    "INSERT INTO domains (id, name, display_order, server_id, is_dirty,
                                          last_modified_at)
                     VALUES (?1, ?2, ?3, ?4, 0, ?5)
                     ON CONFLICT(id) DO UPDATE SET
                         name = excluded.name,
                         display_order = excluded.display_order,
                         server_id = excluded.server_id,
                         last_modified_at = excluded.last_modified_at
                     WHERE is_dirty = 0",
                )?;
                for pulled in &delta.domains {
                    stmt.execute(params![
                        pulled.row.local_id,
                        pulled.row.name,
                        pulled.row.display_order,
                        pulled.server_id,
                        pulled.updated_at
                    ])?;
                }
            }

            {
                let mut stmt = tx.prepare(
                    "INSERT INTO academic_years (id, name, start_date, end_date, is_current,
                                                 server_id, is_dirty, last_modified_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7)
                     ON CONFLICT(id) DO UPDATE SET
                         name = excluded.name,
                         start_date = excluded.start_date,
                         end_date = excluded.end_date,
                         is_current = excluded.is_current,
                         server_id = excluded.server_id,
                         last_modified_at = excluded.last_modified_at
                     WHERE is_dirty = 0",
                )?;
                for pulled in &delta.academic_years {
                    stmt.execute(params![
                        pulled.row.local_id,
                        pulled.row.name,
                        pulled.row.start_date,
                        pulled.row.end_date,
                        pulled.row.is_current,
                        pulled.server_id,
                        pulled.updated_at
                    ])?;
                }
            }

            {
                let mut stmt = tx.prepare(
                    "INSERT INTO classes (id, name, level, option, section, academic_year_id,
                                          server_id, is_dirty, last_modified_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8)
                     ON CONFLICT(id) DO UPDATE SET
                         name = excluded.name,
                         level = excluded.level,
                         option = excluded.option,
                         section = excluded.section,
                         academic_year_id = excluded.academic_year_id,
                         server_id = excluded.server_id,
                         last_modified_at = excluded.last_modified_at
                     WHERE is_dirty = 0",
                )?;
                for pulled in &delta.classes {
                    stmt.execute(params![
                        pulled.row.local_id,
                        pulled.row.name,
                        pulled.row.level,
                        pulled.row.option,
                        pulled.row.section,
                        pulled.row.academic_year_local_id,
                        pulled.server_id,
                        pulled.updated_at
                    ])?;
                }
            }

            {
                let mut stmt = tx.prepare(
                    "INSERT INTO students (id, first_name, last_name, post_name, gender,
                                           birth_date, birthplace, is_abandoned, abandon_reason,
                                           class_id, server_id, is_dirty, last_modified_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 0, ?12)
                     ON CONFLICT(id) DO UPDATE SET
                         first_name = excluded.first_name,
                         last_name = excluded.last_name,
                         post_name = excluded.post_name,
                         gender = excluded.gender,
                         birth_date = excluded.birth_date,
                         birthplace = excluded.birthplace,
                         is_abandoned = excluded.is_abandoned,
                         abandon_reason = excluded.abandon_reason,
                         class_id = excluded.class_id,
                         server_id = excluded.server_id,
                         last_modified_at = excluded.last_modified_at
                     WHERE is_dirty = 0",
                )?;
                for pulled in &delta.students {
                    stmt.execute(params![
                        pulled.row.local_id,
                        pulled.row.first_name,
                        pulled.row.last_name,
                        pulled.row.post_name,
                        pulled.row.gender,
                        pulled.row.birth_date,
                        pulled.row.birthplace,
                        pulled.row.is_abandoned,
                        pulled.row.abandon_reason,
                        pulled.row.class_local_id,
                        pulled.server_id,
                        pulled.updated_at
                    ])?;
                }
            }

            {
                let mut stmt = tx.prepare(
                    "INSERT INTO subjects (id, name, code, category, sub_domain, max_p1, max_p2,
                                           max_exam1, max_p3, max_p4, max_exam2, class_id,
                                           domain_id, server_id, is_dirty, last_modified_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, 0, ?15)
                     ON CONFLICT(id) DO UPDATE SET
                         name = excluded.name,
                         code = excluded.code,
                         category = excluded.category,
                         sub_domain = excluded.sub_domain,
                         max_p1 = excluded.max_p1,
                         max_p2 = excluded.max_p2,
                         max_exam1 = excluded.max_exam1,
                         max_p3 = excluded.max_p3,
                         max_p4 = excluded.max_p4,
                         max_exam2 = excluded.max_exam2,
                         class_id = excluded.class_id,
                         domain_id = excluded.domain_id,
                         server_id = excluded.server_id,
                         last_modified_at = excluded.last_modified_at
                     WHERE is_dirty = 0",
                )?;
                for pulled in &delta.subjects {
                    stmt.execute(params![
                        pulled.row.local_id,
                        pulled.row.name,
                        pulled.row.code,
                        pulled.row.category,
                        pulled.row.sub_domain,
                        pulled.row.max_p1,
                        pulled.row.max_p2,
                        pulled.row.max_exam1,
                        pulled.row.max_p3,
                        pulled.row.max_p4,
                        pulled.row.max_exam2,
                        pulled.row.class_local_id,
                        pulled.row.domain_local_id,
                        pulled.server_id,
                        pulled.updated_at
                    ])?;
                }
            }

            {
                let mut stmt = tx.prepare(
                    "INSERT INTO grades (id, student_id, subject_id, period, value, server_id,
                                         is_dirty, last_modified_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7)
                     ON CONFLICT(id) DO UPDATE SET
                         student_id = excluded.student_id,
                         subject_id = excluded.subject_id,
                         period = excluded.period,
                         value = excluded.value,
                         server_id = excluded.server_id,
                         last_modified_at = excluded.last_modified_at
                     WHERE is_dirty = 0",
                )?;
                for pulled in &delta.grades {
                    stmt.execute(params![
                        pulled.row.local_id,
                        pulled.row.student_id,
                        pulled.row.subject_id,
                        pulled.row.period,
                        pulled.row.points,
                        pulled.server_id,
                        pulled.updated_at
                    ])?;
                }
            }

            {
                let mut stmt = tx.prepare(
                    "INSERT INTO notes (id, title, content, academic_year_id, server_id,
                                        is_dirty, last_modified_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)
                     ON CONFLICT(id) DO UPDATE SET
                         title = excluded.title,
                         content = excluded.content,
                         academic_year_id = excluded.academic_year_id,
                         server_id = excluded.server_id,
                         last_modified_at = excluded.last_modified_at
                     WHERE is_dirty = 0",
                )?;
                for pulled in &delta.notes {
                    stmt.execute(params![
                        pulled.row.local_id,
                        pulled.row.title,
                        pulled.row.content,
                        pulled.row.academic_year_local_id,
                        pulled.server_id,
                        pulled.updated_at
                    ])?;
                }
            }

            for tombstone in &delta.tombstones {
                tx.execute(
                    &format!(
                        "DELETE FROM {} WHERE id = ?1 AND is_dirty = 0",
                        tombstone.kind.table_name()
                    ),
                    [tombstone.local_id],
                )?;
                tx.execute(
                    "DELETE FROM sync_deletions WHERE table_name = ?1 AND local_id = ?2",
                    params![tombstone.kind.table_name(), tombstone.local_id],
                )?;
            }

            if let Some(tenant) = &delta.tenant {
                let mut stmt =
                    tx.prepare("INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)")?;
                stmt.execute(params!["school_name", tenant.name])?;
                stmt.execute(params!["school_city", tenant.city])?;
                stmt.execute(params!["school_pobox", tenant.pobox])?;
            }

            tx.execute(
                "INSERT OR REPLACE INTO settings (key, value) VALUES ('last_sync_time', ?1)",
                [&delta.server_time],
            )?;

            tx.commit()?;
            Ok(())
        })();
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        applied
    }

    /// Appends one sync cycle to the history log.
    pub fn record_sync_history(&self, entry: &SyncHistoryEntry) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sync_history (kind, status, records_synced, error_message, duration_ms,
                                       created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entry.kind,
                entry.status,
                entry.records_synced,
                entry.error_message,
                entry.duration_ms,
                entry.created_at
            ],
        )?;
        Ok(())
    }

    /// Returns the most recent sync cycles, newest first.
    pub fn recent_sync_history(&self, limit: u32) -> StoreResult<Vec<SyncHistoryEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT kind, status, records_synced, error_message, duration_ms, created_at
             FROM sync_history ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map([limit], |row| {
                Ok(SyncHistoryEntry {
                    kind: row.get(0)?,
                    status: row.get(1)?,
                    records_synced: row.get(2)?,
                    error_message: row.get(3)?,
                    duration_ms: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

/// One line of the device's sync log.
#[derive(Debug, Clone, Serialize)]
pub struct SyncHistoryEntry {
    /// "FULL_SYNC" or "DELTA_SYNC".
    pub kind: String,
    /// "SUCCESS" or "ERROR".
    pub status: String,
    /// JSON object of per-table pushed/pulled counts.
    pub records_synced: String,
    /// Failure detail, if the cycle failed.
    pub error_message: Option<String>,
    /// Wall-clock duration of the cycle.
    pub duration_ms: i64,
    /// RFC 3339 timestamp.
    pub created_at: String,
}

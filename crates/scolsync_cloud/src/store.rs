//! The central multi-tenant store.
//!
//! Every domain table is keyed by `(tenant_id, local_id)` with a unique
//! `server_id` minted on first insert; parent references are stored as the
//! parent's LocalId within the same tenant, so pull responses never need a
//! ServerId join. Tombstones are append-only.

use crate::error::{ApiError, ApiResult};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use scolsync_model::{
    AcademicYear, Class, ConflictPolicy, Domain, EntityKind, Grade, LocalId, Note, Pulled,
    PullDelta, ServerId, Student, Subject, TenantInfo, TenantProfile, Tombstone,
};
use std::path::Path;
use uuid::Uuid;

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS tenants (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        city TEXT NOT NULL DEFAULT '',
        pobox TEXT NOT NULL DEFAULT '',
        admin_password TEXT
    );

    CREATE TABLE IF NOT EXISTS licenses (
        key TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL UNIQUE REFERENCES tenants(id),
        active INTEGER NOT NULL DEFAULT 0,
        expires_at TEXT NOT NULL,
        hwids TEXT NOT NULL DEFAULT '[]'
    );

    CREATE TABLE IF NOT EXISTS academic_years (
        tenant_id TEXT NOT NULL,
        local_id INTEGER NOT NULL,
        server_id TEXT NOT NULL UNIQUE,
        name TEXT NOT NULL,
        start_date TEXT NOT NULL DEFAULT '',
        end_date TEXT NOT NULL DEFAULT '',
        is_current INTEGER NOT NULL DEFAULT 0,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (tenant_id, local_id)
    );

    CREATE TABLE IF NOT EXISTS classes (
        tenant_id TEXT NOT NULL,
        local_id INTEGER NOT NULL,
        server_id TEXT NOT NULL UNIQUE,
        name TEXT NOT NULL,
        level TEXT NOT NULL DEFAULT '',
        option TEXT NOT NULL DEFAULT '',
        section TEXT NOT NULL DEFAULT '',
        academic_year_local_id INTEGER NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (tenant_id, local_id)
    );

    CREATE TABLE IF NOT EXISTS domains (
        tenant_id TEXT NOT NULL,
        local_id INTEGER NOT NULL,
        server_id TEXT NOT NULL UNIQUE,
        name TEXT NOT NULL,
        display_order INTEGER NOT NULL DEFAULT 0,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (tenant_id, local_id)
    );

    CREATE TABLE IF NOT EXISTS students (
        tenant_id TEXT NOT NULL,
        local_id INTEGER NOT NULL,
        server_id TEXT NOT NULL UNIQUE,
        first_name TEXT NOT NULL,
        last_name TEXT NOT NULL,
        post_name TEXT NOT NULL DEFAULT '',
        gender TEXT NOT NULL DEFAULT '',
        birth_date TEXT NOT NULL DEFAULT '',
        birthplace TEXT NOT NULL DEFAULT '',
        is_abandoned INTEGER NOT NULL DEFAULT 0,
        abandon_reason TEXT NOT NULL DEFAULT '',
        class_local_id INTEGER,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (tenant_id, local_id)
    );

    CREATE TABLE IF NOT EXISTS subjects (
        tenant_id TEXT NOT NULL,
        local_id INTEGER NOT NULL,
        server_id TEXT NOT NULL UNIQUE,
        name TEXT NOT NULL,
        code TEXT NOT NULL DEFAULT '',
        category TEXT NOT NULL DEFAULT '',
        sub_domain TEXT NOT NULL DEFAULT '',
        max_p1 REAL NOT NULL DEFAULT 10,
        max_p2 REAL NOT NULL DEFAULT 10,
        max_exam1 REAL NOT NULL DEFAULT 20,
        max_p3 REAL NOT NULL DEFAULT 10,
        max_p4 REAL NOT NULL DEFAULT 10,
        max_exam2 REAL NOT NULL DEFAULT 20,
        class_local_id INTEGER NOT NULL,
        domain_local_id INTEGER,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (tenant_id, local_id)
    );

    CREATE TABLE IF NOT EXISTS grades (
        tenant_id TEXT NOT NULL,
        local_id INTEGER NOT NULL,
        server_id TEXT NOT NULL UNIQUE,
        student_local_id INTEGER NOT NULL,
        subject_local_id INTEGER NOT NULL,
        period TEXT NOT NULL,
        points REAL NOT NULL DEFAULT 0,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (tenant_id, local_id)
    );

    CREATE TABLE IF NOT EXISTS notes (
        tenant_id TEXT NOT NULL,
        local_id INTEGER NOT NULL,
        server_id TEXT NOT NULL UNIQUE,
        title TEXT NOT NULL,
        content TEXT NOT NULL DEFAULT '',
        academic_year_local_id INTEGER NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (tenant_id, local_id)
    );

    CREATE TABLE IF NOT EXISTS tombstones (
        tenant_id TEXT NOT NULL,
        table_name TEXT NOT NULL,
        local_id INTEGER NOT NULL,
        deleted_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_tombstones_tenant ON tombstones(tenant_id, deleted_at);
"#;

/// One license as stored.
#[derive(Debug, Clone)]
pub struct LicenseRow {
    /// License key.
    pub key: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Whether any device has activated.
    pub active: bool,
    /// Expiry, RFC 3339.
    pub expires_at: String,
    /// Authorized device fingerprints. Append-only outside admin action.
    pub hwids: Vec<String>,
}

impl LicenseRow {
    /// Case-insensitive membership check, matching how devices report HWIDs.
    pub fn is_authorized(&self, hwid: &str) -> bool {
        self.hwids.iter().any(|h| h.eq_ignore_ascii_case(hwid))
    }
}

/// The multi-tenant relational store behind the gateway and sync handlers.
pub struct CloudStore {
    conn: Mutex<Connection>,
}

impl CloudStore {
    /// Opens (and initializes) the store at the given path.
    pub fn open(path: impl AsRef<Path>) -> ApiResult<Self> {
        Self::init(Connection::open(path).map_err(ApiError::from)?)
    }

    /// Opens an in-memory store.
    pub fn open_in_memory() -> ApiResult<Self> {
        Self::init(Connection::open_in_memory().map_err(ApiError::from)?)
    }

    fn init(conn: Connection) -> ApiResult<Self> {
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn now(&self) -> String {
        chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
    }

    // ===== Tenants =====

    /// Creates a tenant and returns its id.
    pub fn create_tenant(&self, name: &str, city: &str, pobox: &str) -> ApiResult<String> {
        let id = Uuid::new_v4().to_string();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO tenants (id, name, city, pobox) VALUES (?1, ?2, ?3, ?4)",
            params![id, name, city, pobox],
        )?;
        Ok(id)
    }

    /// Loads a tenant's profile.
    pub fn tenant_profile(&self, tenant_id: &str) -> ApiResult<Option<TenantProfile>> {
        let conn = self.conn.lock();
        let profile = conn
            .query_row(
                "SELECT id, name, city, pobox FROM tenants WHERE id = ?1",
                [tenant_id],
                |row| {
                    Ok(TenantProfile {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        city: row.get(2)?,
                        pobox: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(profile)
    }

    /// Overwrites tenant display metadata (push phase 0).
    pub fn update_tenant_info(&self, tenant_id: &str, info: &TenantInfo) -> ApiResult<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE tenants SET name = ?2, city = ?3, pobox = ?4 WHERE id = ?1",
            params![tenant_id, info.name, info.city, info.pobox],
        )?;
        if changed == 0 {
            return Err(ApiError::NotFound(format!("tenant {tenant_id}")));
        }
        Ok(())
    }

    /// The tenant's encrypted setup password, if one has been set.
    pub fn admin_password(&self, tenant_id: &str) -> ApiResult<Option<String>> {
        let conn = self.conn.lock();
        let value = conn
            .query_row(
                "SELECT admin_password FROM tenants WHERE id = ?1",
                [tenant_id],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        Ok(value)
    }

    /// Stores the encrypted setup password.
    pub fn set_admin_password(&self, tenant_id: &str, encrypted: &str) -> ApiResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE tenants SET admin_password = ?2 WHERE id = ?1",
            params![tenant_id, encrypted],
        )?;
        Ok(())
    }

    // ===== Licenses =====

    /// Issues a license for a tenant. One license per tenant; duplicate keys
    /// or a second license for the same tenant are conflicts.
    pub fn issue_license(&self, tenant_id: &str, key: &str, expires_at: &str) -> ApiResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO licenses (key, tenant_id, expires_at) VALUES (?1, ?2, ?3)",
            params![key, tenant_id, expires_at],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                ApiError::Conflict(format!("tenant {tenant_id} already has a license"))
            }
            other => ApiError::from(other),
        })?;
        Ok(())
    }

    /// Extends a license's validity.
    pub fn extend_license(&self, key: &str, expires_at: &str) -> ApiResult<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE licenses SET expires_at = ?2 WHERE key = ?1",
            params![key, expires_at],
        )?;
        if changed == 0 {
            return Err(ApiError::NotFound(format!("license {key}")));
        }
        Ok(())
    }

    /// Looks a license up by key.
    pub fn license_by_key(&self, key: &str) -> ApiResult<Option<LicenseRow>> {
        let conn = self.conn.lock();
        self.read_license(&conn, "key = ?1", key)
    }

    /// Looks a license up by owning tenant.
    pub fn license_for_tenant(&self, tenant_id: &str) -> ApiResult<Option<LicenseRow>> {
        let conn = self.conn.lock();
        self.read_license(&conn, "tenant_id = ?1", tenant_id)
    }

    fn read_license(
        &self,
        conn: &Connection,
        predicate: &str,
        value: &str,
    ) -> ApiResult<Option<LicenseRow>> {
        let row = conn
            .query_row(
                &format!(
                    "SELECT key, tenant_id, active, expires_at, hwids FROM licenses WHERE {predicate}"
                ),
                [value],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, bool>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(key, tenant_id, active, expires_at, hwids)| {
            let hwids: Vec<String> = serde_json::from_str(&hwids)
                .map_err(|e| ApiError::Internal(format!("corrupt hwid list: {e}")))?;
            Ok(LicenseRow {
                key,
                tenant_id,
                active,
                expires_at,
                hwids,
            })
        })
        .transpose()
    }

    /// Appends a device fingerprint and marks the license active.
    ///
    /// Idempotent when the hwid is already authorized.
    pub fn authorize_hwid(&self, key: &str, hwid: &str) -> ApiResult<()> {
        let conn = self.conn.lock();
        let license = self
            .read_license(&conn, "key = ?1", key)?
            .ok_or_else(|| ApiError::NotFound(format!("license {key}")))?;

        if license.is_authorized(hwid) {
            return Ok(());
        }

        let mut hwids = license.hwids;
        hwids.push(hwid.to_string());
        let encoded = serde_json::to_string(&hwids)
            .map_err(|e| ApiError::Internal(format!("hwid encoding failed: {e}")))?;
        conn.execute(
            "UPDATE licenses SET hwids = ?2, active = 1 WHERE key = ?1",
            params![key, encoded],
        )?;
        Ok(())
    }

    /// Removes a device fingerprint. The one administrative path that may
    /// shrink the HWID set.
    pub fn revoke_hwid(&self, key: &str, hwid: &str) -> ApiResult<()> {
        let conn = self.conn.lock();
        let license = self
            .read_license(&conn, "key = ?1", key)?
            .ok_or_else(|| ApiError::NotFound(format!("license {key}")))?;

        let hwids: Vec<String> = license
            .hwids
            .into_iter()
            .filter(|h| !h.eq_ignore_ascii_case(hwid))
            .collect();
        let encoded = serde_json::to_string(&hwids)
            .map_err(|e| ApiError::Internal(format!("hwid encoding failed: {e}")))?;
        conn.execute(
            "UPDATE licenses SET hwids = ?2 WHERE key = ?1",
            params![key, encoded],
        )?;
        Ok(())
    }

    // ===== Upserts (push phases 2-8) =====

    fn exists(
        &self,
        conn: &Connection,
        kind: EntityKind,
        tenant_id: &str,
        local_id: LocalId,
    ) -> ApiResult<bool> {
        let found: Option<i64> = conn
            .query_row(
                &format!(
                    "SELECT 1 FROM {} WHERE tenant_id = ?1 AND local_id = ?2",
                    kind.table_name()
                ),
                params![tenant_id, local_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn require_parent(
        &self,
        conn: &Connection,
        kind: EntityKind,
        tenant_id: &str,
        local_id: LocalId,
    ) -> ApiResult<()> {
        if self.exists(conn, kind, tenant_id, local_id)? {
            Ok(())
        } else {
            Err(ApiError::Referential(format!(
                "{} {local_id} not found",
                kind.table_name()
            )))
        }
    }

    fn server_id_of(
        &self,
        conn: &Connection,
        kind: EntityKind,
        tenant_id: &str,
        local_id: LocalId,
    ) -> ApiResult<ServerId> {
        conn.query_row(
            &format!(
                "SELECT server_id FROM {} WHERE tenant_id = ?1 AND local_id = ?2",
                kind.table_name()
            ),
            params![tenant_id, local_id],
            |row| row.get(0),
        )
        .map_err(ApiError::from)
    }

    fn conflict_arm(policy: ConflictPolicy, update_set: &str) -> String {
        match policy {
            ConflictPolicy::LastWriteWins => format!(
                "ON CONFLICT(tenant_id, local_id) DO UPDATE SET {update_set}"
            ),
            ConflictPolicy::KeepExisting => {
                "ON CONFLICT(tenant_id, local_id) DO NOTHING".to_string()
            }
        }
    }

    /// Upserts an academic year; returns its ServerId.
    pub fn upsert_academic_year(
        &self,
        tenant_id: &str,
        year: &AcademicYear,
        policy: ConflictPolicy,
    ) -> ApiResult<ServerId> {
        let conn = self.conn.lock();
        let sql = format!(
            "INSERT INTO academic_years (tenant_id, local_id, server_id, name, start_date,
                                         end_date, is_current, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             {}",
            Self::conflict_arm(
                policy,
                "name = excluded.name, start_date = excluded.start_date,
                 end_date = excluded.end_date, is_current = excluded.is_current,
                 updated_at = excluded.updated_at"
            )
        );
        conn.execute(
            &sql,
            params![
                tenant_id,
                year.local_id,
                Uuid::new_v4().to_string(),
                year.name,
                year.start_date,
                year.end_date,
                year.is_current,
                self.now()
            ],
        )?;
        self.server_id_of(&conn, EntityKind::AcademicYear, tenant_id, year.local_id)
    }

    /// Upserts a class. The parent academic year must resolve.
    pub fn upsert_class(
        &self,
        tenant_id: &str,
        class: &Class,
        policy: ConflictPolicy,
    ) -> ApiResult<ServerId> {
        let conn = self.conn.lock();
        let year = class.academic_year_local_id.ok_or_else(|| {
            ApiError::Referential("class has no academic year".into())
        })?;
        self.require_parent(&conn, EntityKind::AcademicYear, tenant_id, year)?;

        let sql = format!(
            "INSERT INTO classes (tenant_id, local_id, server_id, name, level, option, section,
                                  academic_year_local_id, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             {}",
            Self::conflict_arm(
                policy,
                "name = excluded.name, level = excluded.level, option = excluded.option,
                 section = excluded.section,
                 academic_year_local_id = excluded.academic_year_local_id,
                 updated_at = excluded.updated_at"
            )
        );
        conn.execute(
            &sql,
            params![
                tenant_id,
                class.local_id,
                Uuid::new_v4().to_string(),
                class.name,
                class.level,
                class.option,
                class.section,
                year,
                self.now()
            ],
        )?;
        self.server_id_of(&conn, EntityKind::Class, tenant_id, class.local_id)
    }

    /// Upserts a domain.
    pub fn upsert_domain(
        &self,
        tenant_id: &str,
        domain: &Domain,
        policy: ConflictPolicy,
    ) -> ApiResult<ServerId> {
        let conn = self.conn.lock();
        let sql = format!(
            "INSERT INTO domains (tenant_id, local_id, server_id, name, display_order, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             {}",
            Self::conflict_arm(
                policy,
                "name = excluded.name, display_order = excluded.display_order,
                 updated_at = excluded.updated_at"
            )
        );
        conn.execute(
            &sql,
            params![
                tenant_id,
                domain.local_id,
                Uuid::new_v4().to_string(),
                domain.name,
                domain.display_order,
                self.now()
            ],
        )?;
        self.server_id_of(&conn, EntityKind::Domain, tenant_id, domain.local_id)
    }

    /// Upserts a student. The parent class is optional but must resolve when
    /// present.
    pub fn upsert_student(
        &self,
        tenant_id: &str,
        student: &Student,
        policy: ConflictPolicy,
    ) -> ApiResult<ServerId> {
        let conn = self.conn.lock();
        if let Some(class) = student.class_local_id {
            self.require_parent(&conn, EntityKind::Class, tenant_id, class)?;
        }

        let sql = format!(
            "INSERT INTO students (tenant_id, local_id, server_id, first_name, last_name,
                                   post_name, gender, birth_date, birthplace, is_abandoned,
                                   abandon_reason, class_local_id, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             {}",
            Self::conflict_arm(
                policy,
                "first_name = excluded.first_name, last_name = excluded.last_name,
                 post_name = excluded.post_name, gender = excluded.gender,
                 birth_date = excluded.birth_date, birthplace = excluded.birthplace,
                 is_abandoned = excluded.is_abandoned,
                 abandon_reason = excluded.abandon_reason,
                 class_local_id = excluded.class_local_id, updated_at = excluded.updated_at"
            )
        );
        conn.execute(
            &sql,
            params![
                tenant_id,
                student.local_id,
                Uuid::new_v4().to_string(),
                student.first_name,
                student.last_name,
                student.post_name,
                student.gender,
                student.birth_date,
                student.birthplace,
                student.is_abandoned,
                student.abandon_reason,
                student.class_local_id,
                self.now()
            ],
        )?;
        self.server_id_of(&conn, EntityKind::Student, tenant_id, student.local_id)
    }

    /// Upserts a subject. The parent class must resolve; the domain is
    /// optional but must resolve when present.
    pub fn upsert_subject(
        &self,
        tenant_id: &str,
        subject: &Subject,
        policy: ConflictPolicy,
    ) -> ApiResult<ServerId> {
        let conn = self.conn.lock();
        let class = subject
            .class_local_id
            .ok_or_else(|| ApiError::Referential("subject has no class".into()))?;
        self.require_parent(&conn, EntityKind::Class, tenant_id, class)?;
        if let Some(domain) = subject.domain_local_id {
            self.require_parent(&conn, EntityKind::Domain, tenant_id, domain)?;
        }

        let sql = format!(
            "INSERT INTO subjects (tenant_id, local_id, server_id, name, code, category,
                                   sub_domain, max_p1, max_p2, max_exam1, max_p3, max_p4,
                                   max_exam2, class_local_id, domain_local_id, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
             {}",
            Self::conflict_arm(
                policy,
                "name = excluded.name, code = excluded.code, category = excluded.category,
                 sub_domain = excluded.sub_domain, max_p1 = excluded.max_p1,
                 max_p2 = excluded.max_p2, max_exam1 = excluded.max_exam1,
                 max_p3 = excluded.max_p3, max_p4 = excluded.max_p4,
                 max_exam2 = excluded.max_exam2, class_local_id = excluded.class_local_id,
                 domain_local_id = excluded.domain_local_id, updated_at = excluded.updated_at"
            )
        );
        conn.execute(
            &sql,
            params![
                tenant_id,
                subject.local_id,
                Uuid::new_v4().to_string(),
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
                class,
                subject.domain_local_id,
                self.now()
            ],
        )?;
        self.server_id_of(&conn, EntityKind::Subject, tenant_id, subject.local_id)
    }

    /// Upserts a grade. Both the student and the subject must resolve.
    pub fn upsert_grade(
        &self,
        tenant_id: &str,
        grade: &Grade,
        policy: ConflictPolicy,
    ) -> ApiResult<ServerId> {
        let conn = self.conn.lock();
        self.require_parent(&conn, EntityKind::Student, tenant_id, grade.student_id)?;
        self.require_parent(&conn, EntityKind::Subject, tenant_id, grade.subject_id)?;

        let sql = format!(
            "INSERT INTO grades (tenant_id, local_id, server_id, student_local_id,
                                 subject_local_id, period, points, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             {}",
            Self::conflict_arm(
                policy,
                "student_local_id = excluded.student_local_id,
                 subject_local_id = excluded.subject_local_id, period = excluded.period,
                 points = excluded.points, updated_at = excluded.updated_at"
            )
        );
        conn.execute(
            &sql,
            params![
                tenant_id,
                grade.local_id,
                Uuid::new_v4().to_string(),
                grade.student_id,
                grade.subject_id,
                grade.period,
                grade.points,
                self.now()
            ],
        )?;
        self.server_id_of(&conn, EntityKind::Grade, tenant_id, grade.local_id)
    }

    /// Upserts a note. The parent academic year must resolve.
    pub fn upsert_note(
        &self,
        tenant_id: &str,
        note: &Note,
        policy: ConflictPolicy,
    ) -> ApiResult<ServerId> {
        let conn = self.conn.lock();
        let year = note
            .academic_year_local_id
            .ok_or_else(|| ApiError::Referential("note has no academic year".into()))?;
        self.require_parent(&conn, EntityKind::AcademicYear, tenant_id, year)?;

        let sql = format!(
            "INSERT INTO notes (tenant_id, local_id, server_id, title, content,
                                academic_year_local_id, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             {}",
            Self::conflict_arm(
                policy,
                "title = excluded.title, content = excluded.content,
                 academic_year_local_id = excluded.academic_year_local_id,
                 updated_at = excluded.updated_at"
            )
        );
        conn.execute(
            &sql,
            params![
                tenant_id,
                note.local_id,
                Uuid::new_v4().to_string(),
                note.title,
                note.content,
                year,
                self.now()
            ],
        )?;
        self.server_id_of(&conn, EntityKind::Note, tenant_id, note.local_id)
    }

    // ===== Deletion (push phase 1) =====

    /// Removes a row and writes its tombstone.
    ///
    /// The tombstone is written even when the row is already absent, so a
    /// deletion that raced an earlier one still propagates to other devices.
    pub fn delete_entity(
        &self,
        tenant_id: &str,
        kind: EntityKind,
        local_id: LocalId,
    ) -> ApiResult<()> {
        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction()?;
        tx.execute(
            &format!(
                "DELETE FROM {} WHERE tenant_id = ?1 AND local_id = ?2",
                kind.table_name()
            ),
            params![tenant_id, local_id],
        )?;
        tx.execute(
            "INSERT INTO tombstones (tenant_id, table_name, local_id, deleted_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![tenant_id, kind.table_name(), local_id, self.now()],
        )?;
        tx.commit()?;
        Ok(())
    }

    // ===== Pull =====

    /// Builds the delta of everything modified after `since`.
    ///
    /// Every entity query and the tombstone query share the one filter
    /// fragment produced by [`since_clause`]; a divergence there would
    /// silently open gaps between entity and tombstone visibility.
    pub fn pull_delta(&self, tenant_id: &str, since: Option<&str>) -> ApiResult<PullDelta> {
        let conn = self.conn.lock();
        let mut delta = PullDelta {
            server_time: self.now(),
            ..Default::default()
        };

        let mut stmt = conn.prepare(&format!(
            "SELECT server_id, updated_at, local_id, name, start_date, end_date, is_current
             FROM academic_years WHERE tenant_id = ?1 AND {}",
            since_clause("updated_at")
        ))?;
        delta.academic_years = stmt
            .query_map(params![tenant_id, since], |row| {
                Ok(Pulled {
                    server_id: row.get(0)?,
                    updated_at: row.get(1)?,
                    row: AcademicYear {
                        local_id: row.get(2)?,
                        name: row.get(3)?,
                        start_date: row.get(4)?,
                        end_date: row.get(5)?,
                        is_current: row.get(6)?,
                    },
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare(&format!(
            "SELECT server_id, updated_at, local_id, name, level, option, section,
                    academic_year_local_id
             FROM classes WHERE tenant_id = ?1 AND {}",
            since_clause("updated_at")
        ))?;
        delta.classes = stmt
            .query_map(params![tenant_id, since], |row| {
                Ok(Pulled {
                    server_id: row.get(0)?,
                    updated_at: row.get(1)?,
                    row: Class {
                        local_id: row.get(2)?,
                        name: row.get(3)?,
                        level: row.get(4)?,
                        option: row.get(5)?,
                        section: row.get(6)?,
                        academic_year_local_id: row.get(7)?,
                    },
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare(&format!(
            "SELECT server_id, updated_at, local_id, name, display_order
             FROM domains WHERE tenant_id = ?1 AND {}",
            since_clause("updated_at")
        ))?;
        delta.domains = stmt
            .query_map(params![tenant_id, since], |row| {
                Ok(Pulled {
                    server_id: row.get(0)?,
                    updated_at: row.get(1)?,
                    row: Domain {
                        local_id: row.get(2)?,
                        name: row.get(3)?,
                        display_order: row.get(4)?,
                    },
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        // Draft students (no class assignment) never leave their device.
        let mut stmt = conn.prepare(&format!(
            "SELECT server_id, updated_at, local_id, first_name, last_name, post_name, gender,
                    birth_date, birthplace, is_abandoned, abandon_reason, class_local_id
             FROM students WHERE tenant_id = ?1 AND class_local_id IS NOT NULL AND {}",
            since_clause("updated_at")
        ))?;
        delta.students = stmt
            .query_map(params![tenant_id, since], |row| {
                Ok(Pulled {
                    server_id: row.get(0)?,
                    updated_at: row.get(1)?,
                    row: Student {
                        local_id: row.get(2)?,
                        first_name: row.get(3)?,
                        last_name: row.get(4)?,
                        post_name: row.get(5)?,
                        gender: row.get(6)?,
                        birth_date: row.get(7)?,
                        birthplace: row.get(8)?,
                        is_abandoned: row.get(9)?,
                        abandon_reason: row.get(10)?,
                        class_local_id: row.get(11)?,
                    },
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare(&format!(
            "SELECT server_id, updated_at, local_id, name, code, category, sub_domain, max_p1,
                    max_p2, max_exam1, max_p3, max_p4, max_exam2, class_local_id, domain_local_id
             FROM subjects WHERE tenant_id = ?1 AND {}",
            since_clause("updated_at")
        ))?;
        delta.subjects = stmt
            .query_map(params![tenant_id, since], |row| {
                Ok(Pulled {
                    server_id: row.get(0)?,
                    updated_at: row.get(1)?,
                    row: Subject {
                        local_id: row.get(2)?,
                        name: row.get(3)?,
                        code: row.get(4)?,
                        category: row.get(5)?,
                        sub_domain: row.get(6)?,
                        max_p1: row.get(7)?,
                        max_p2: row.get(8)?,
                        max_exam1: row.get(9)?,
                        max_p3: row.get(10)?,
                        max_p4: row.get(11)?,
                        max_exam2: row.get(12)?,
                        class_local_id: row.get(13)?,
                        domain_local_id: row.get(14)?,
                    },
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare(&format!(
            "SELECT server_id, updated_at, local_id, student_local_id, subject_local_id, period,
                    points
             FROM grades WHERE tenant_id = ?1 AND {}",
            since_clause("updated_at")
        ))?;
        delta.grades = stmt
            .query_map(params![tenant_id, since], |row| {
                Ok(Pulled {
                    server_id: row.get(0)?,
                    updated_at: row.get(1)?,
                    row: Grade {
                        local_id: row.get(2)?,
                        student_id: row.get(3)?,
                        subject_id: row.get(4)?,
                        period: row.get(5)?,
                        points: row.get(6)?,
                    },
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare(&format!(
            "SELECT server_id, updated_at, local_id, title, content, academic_year_local_id
             FROM notes WHERE tenant_id = ?1 AND {}",
            since_clause("updated_at")
        ))?;
        delta.notes = stmt
            .query_map(params![tenant_id, since], |row| {
                Ok(Pulled {
                    server_id: row.get(0)?,
                    updated_at: row.get(1)?,
                    row: Note {
                        local_id: row.get(2)?,
                        title: row.get(3)?,
                        content: row.get(4)?,
                        academic_year_local_id: row.get(5)?,
                    },
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare(&format!(
            "SELECT table_name, local_id, deleted_at
             FROM tombstones WHERE tenant_id = ?1 AND {}",
            since_clause("deleted_at")
        ))?;
        let tombstones = stmt.query_map(params![tenant_id, since], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        for row in tombstones {
            let (table, local_id, deleted_at) = row?;
            let kind = EntityKind::from_table_name(&table).ok_or_else(|| {
                ApiError::Internal(format!("tombstone references unknown table {table}"))
            })?;
            delta.tombstones.push(Tombstone {
                kind,
                local_id,
                deleted_at,
            });
        }

        delta.tenant = conn
            .query_row(
                "SELECT name, city, pobox FROM tenants WHERE id = ?1",
                [tenant_id],
                |row| {
                    Ok(TenantInfo {
                        name: row.get(0)?,
                        city: row.get(1)?,
                        pobox: row.get(2)?,
                    })
                },
            )
            .optional()?;

        Ok(delta)
    }
}

/// The shared `since` boundary used by every pull query.
///
/// `?2` is the optional cursor; a NULL cursor means a full pull.
fn since_clause(column: &str) -> String {
    format!("(?2 IS NULL OR {column} > ?2)")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_tenant() -> (CloudStore, String) {
        let store = CloudStore::open_in_memory().unwrap();
        let tenant = store.create_tenant("EP Lumière", "Goma", "BP 123").unwrap();
        (store, tenant)
    }

    fn year(local_id: LocalId) -> AcademicYear {
        AcademicYear {
            local_id,
            name: "2025-2026".into(),
            start_date: String::new(),
            end_date: String::new(),
            is_current: true,
        }
    }

    #[test]
    fn license_lifecycle() {
        let (store, tenant) = store_with_tenant();
        store
            .issue_license(&tenant, "AAAA-BBBB", "2027-01-01T00:00:00Z")
            .unwrap();

        // One license per tenant.
        let dup = store.issue_license(&tenant, "CCCC-DDDD", "2027-01-01T00:00:00Z");
        assert!(matches!(dup, Err(ApiError::Conflict(_))));

        store.authorize_hwid("AAAA-BBBB", "HW-1").unwrap();
        store.authorize_hwid("AAAA-BBBB", "hw-1").unwrap(); // idempotent, case-insensitive

        let license = store.license_by_key("AAAA-BBBB").unwrap().unwrap();
        assert!(license.active);
        assert_eq!(license.hwids, vec!["HW-1"]);
        assert!(license.is_authorized("hw-1"));

        store.extend_license("AAAA-BBBB", "2028-01-01T00:00:00Z").unwrap();
        let license = store.license_by_key("AAAA-BBBB").unwrap().unwrap();
        assert_eq!(license.expires_at, "2028-01-01T00:00:00Z");

        store.revoke_hwid("AAAA-BBBB", "HW-1").unwrap();
        let license = store.license_by_key("AAAA-BBBB").unwrap().unwrap();
        assert!(license.hwids.is_empty());
    }

    #[test]
    fn upsert_mints_server_id_once() {
        let (store, tenant) = store_with_tenant();
        let policy = ConflictPolicy::LastWriteWins;

        let first = store.upsert_academic_year(&tenant, &year(1), policy).unwrap();
        let second = store.upsert_academic_year(&tenant, &year(1), policy).unwrap();
        assert_eq!(first, second);

        let other = store.upsert_academic_year(&tenant, &year(2), policy).unwrap();
        assert_ne!(first, other);
    }

    #[test]
    fn keep_existing_policy_preserves_stored_row() {
        let (store, tenant) = store_with_tenant();
        store
            .upsert_academic_year(&tenant, &year(1), ConflictPolicy::LastWriteWins)
            .unwrap();

        let mut renamed = year(1);
        renamed.name = "overwritten".into();
        store
            .upsert_academic_year(&tenant, &renamed, ConflictPolicy::KeepExisting)
            .unwrap();

        let delta = store.pull_delta(&tenant, None).unwrap();
        assert_eq!(delta.academic_years[0].row.name, "2025-2026");
    }

    #[test]
    fn class_requires_resolvable_year() {
        let (store, tenant) = store_with_tenant();
        let class = Class {
            local_id: 10,
            name: "7A".into(),
            level: "7".into(),
            option: String::new(),
            section: String::new(),
            academic_year_local_id: Some(99),
        };
        let result = store.upsert_class(&tenant, &class, ConflictPolicy::LastWriteWins);
        assert!(matches!(result, Err(ApiError::Referential(_))));
    }

    #[test]
    fn tenant_isolation() {
        let store = CloudStore::open_in_memory().unwrap();
        let tenant_a = store.create_tenant("A", "", "").unwrap();
        let tenant_b = store.create_tenant("B", "", "").unwrap();

        store
            .upsert_academic_year(&tenant_a, &year(1), ConflictPolicy::LastWriteWins)
            .unwrap();

        // Same LocalId under another tenant is a distinct logical row.
        let id_b = store
            .upsert_academic_year(&tenant_b, &year(1), ConflictPolicy::LastWriteWins)
            .unwrap();
        assert_ne!(
            store.pull_delta(&tenant_a, None).unwrap().academic_years[0].server_id,
            id_b
        );
        assert_eq!(store.pull_delta(&tenant_b, None).unwrap().academic_years.len(), 1);
    }

    #[test]
    fn deletion_writes_tombstone_even_for_absent_row() {
        let (store, tenant) = store_with_tenant();
        store
            .delete_entity(&tenant, EntityKind::Student, 42)
            .unwrap();

        let delta = store.pull_delta(&tenant, None).unwrap();
        assert_eq!(delta.tombstones.len(), 1);
        assert_eq!(delta.tombstones[0].kind, EntityKind::Student);
        assert_eq!(delta.tombstones[0].local_id, 42);
    }

    #[test]
    fn unassigned_students_are_not_pulled() {
        let (store, tenant) = store_with_tenant();
        let policy = ConflictPolicy::LastWriteWins;
        store.upsert_academic_year(&tenant, &year(1), policy).unwrap();
        store
            .upsert_class(
                &tenant,
                &Class {
                    local_id: 1,
                    name: "7A".into(),
                    level: "7".into(),
                    option: String::new(),
                    section: String::new(),
                    academic_year_local_id: Some(1),
                },
                policy,
            )
            .unwrap();

        let assigned = Student {
            local_id: 1,
            first_name: "A".into(),
            last_name: "B".into(),
            post_name: String::new(),
            gender: String::new(),
            birth_date: String::new(),
            birthplace: String::new(),
            is_abandoned: false,
            abandon_reason: String::new(),
            class_local_id: Some(1),
        };
        let draft = Student {
            local_id: 2,
            class_local_id: None,
            ..assigned.clone()
        };
        store.upsert_student(&tenant, &assigned, policy).unwrap();
        store.upsert_student(&tenant, &draft, policy).unwrap();

        let delta = store.pull_delta(&tenant, None).unwrap();
        assert_eq!(delta.students.len(), 1);
        assert_eq!(delta.students[0].row.local_id, 1);
    }

    #[test]
    fn since_filter_bounds_entities_and_tombstones_alike() {
        let (store, tenant) = store_with_tenant();
        let policy = ConflictPolicy::LastWriteWins;
        store.upsert_academic_year(&tenant, &year(1), policy).unwrap();
        store.delete_entity(&tenant, EntityKind::Note, 7).unwrap();

        let full = store.pull_delta(&tenant, None).unwrap();
        assert_eq!(full.academic_years.len(), 1);
        assert_eq!(full.tombstones.len(), 1);

        // A cursor taken after both writes sees neither.
        let later = store.pull_delta(&tenant, Some(&full.server_time)).unwrap();
        assert!(later.academic_years.is_empty());
        assert!(later.tombstones.is_empty());

        // A cursor before the writes sees both.
        let earlier = store
            .pull_delta(&tenant, Some("2000-01-01T00:00:00.000Z"))
            .unwrap();
        assert_eq!(earlier.academic_years.len(), 1);
        assert_eq!(earlier.tombstones.len(), 1);
    }

    #[test]
    fn pull_carries_tenant_info() {
        let (store, tenant) = store_with_tenant();
        let delta = store.pull_delta(&tenant, None).unwrap();
        let info = delta.tenant.unwrap();
        assert_eq!(info.name, "EP Lumière");
        assert_eq!(info.city, "Goma");
    }
}

//! Integration tests: two devices syncing through one cloud.

use scolsync_cloud::{ApiError, CloudConfig, CloudServer};
use scolsync_engine::{CloudTransport, EngineConfig, SyncEngine, SyncError, SyncResult};
use scolsync_model::{
    AcademicYear, Activation, Class, EntityKind, PullDelta, PushBatch, PushReport, Student,
    Subject, TenantInfo,
};
use scolsync_store::{GradeCell, LocalStore};
use std::sync::Arc;

/// A transport that calls the cloud handlers directly.
struct LoopbackTransport {
    server: Arc<CloudServer>,
}

fn to_sync_error(e: ApiError) -> SyncError {
    SyncError::Cloud {
        status: e.status_code(),
        message: e.to_string(),
    }
}

impl CloudTransport for LoopbackTransport {
    fn activate(&self, key: &str, hwid: &str, password: Option<&str>) -> SyncResult<Activation> {
        self.server
            .activate(key, hwid, password)
            .map_err(to_sync_error)
    }

    fn pull(
        &self,
        token: &str,
        tenant_id: &str,
        since: Option<&str>,
        hwid: &str,
    ) -> SyncResult<PullDelta> {
        self.server
            .pull(token, tenant_id, since, hwid)
            .map_err(to_sync_error)
    }

    fn push(
        &self,
        token: &str,
        tenant_id: &str,
        hwid: &str,
        batch: &PushBatch,
        tenant_info: Option<&TenantInfo>,
    ) -> SyncResult<PushReport> {
        self.server
            .push(token, tenant_id, hwid, batch, tenant_info)
            .map_err(to_sync_error)
    }
}

struct Site {
    cloud: Arc<CloudServer>,
    key: String,
}

impl Site {
    fn new() -> Self {
        let config = CloudConfig::new(b"integration-secret".to_vec(), vec![5u8; 32]);
        let cloud = Arc::new(CloudServer::new(config).unwrap());
        let tenant = cloud
            .store()
            .create_tenant("EP Lumière", "Goma", "BP 123")
            .unwrap();
        cloud
            .store()
            .issue_license(&tenant, "AAAA-BBBB-CCCC-DDDD", "2027-08-01T00:00:00Z")
            .unwrap();
        Site {
            cloud,
            key: "AAAA-BBBB-CCCC-DDDD".into(),
        }
    }

    fn device(&self, hwid: &str) -> (SyncEngine<LoopbackTransport>, Arc<LocalStore>) {
        let store = Arc::new(LocalStore::open_in_memory().unwrap());
        let engine = SyncEngine::new(
            EngineConfig::new(hwid, "loopback://"),
            Arc::clone(&store),
            LoopbackTransport {
                server: Arc::clone(&self.cloud),
            },
        );
        (engine, store)
    }
}

fn seed_class_with_students(store: &LocalStore, n: usize) -> (i64, Vec<i64>) {
    let year = store
        .create_academic_year(&AcademicYear {
            local_id: 0,
            name: "2025-2026".into(),
            start_date: "2025-09-01".into(),
            end_date: "2026-06-30".into(),
            is_current: true,
        })
        .unwrap();
    let class = store
        .create_class(&Class {
            local_id: 0,
            name: "7A".into(),
            level: "7".into(),
            option: String::new(),
            section: "A".into(),
            academic_year_local_id: Some(year),
        })
        .unwrap();
    let students = (0..n)
        .map(|i| {
            store
                .create_student(&Student {
                    local_id: 0,
                    first_name: format!("Student{i}"),
                    last_name: "Test".into(),
                    post_name: String::new(),
                    gender: String::new(),
                    birth_date: String::new(),
                    birthplace: String::new(),
                    is_abandoned: false,
                    abandon_reason: String::new(),
                    class_local_id: Some(class),
                })
                .unwrap()
        })
        .collect();
    (class, students)
}

#[test]
fn round_trip_between_devices() {
    let site = Site::new();

    // Device 1 activates and uploads a class of students.
    let (engine1, store1) = site.device("HW-1");
    engine1.activate(&site.key, Some("secret123")).unwrap();
    let (_class, students) = seed_class_with_students(&store1, 3);

    let result = engine1.sync_cycle().unwrap();
    assert_eq!(result.pushed, 5); // 1 year + 1 class + 3 students
    assert_eq!(result.rejected, 0);

    // Device 2 activates with the stored password and pulls everything.
    let (engine2, store2) = site.device("HW-2");
    engine2.activate(&site.key, Some("secret123")).unwrap();
    let result = engine2.sync_cycle().unwrap();
    assert_eq!(result.pulled, 5);

    assert_eq!(store2.count(EntityKind::Student).unwrap(), students.len() as i64);

    // Parent references arrived translated into LocalIds.
    let classes = store2.list_classes().unwrap();
    assert_eq!(classes.len(), 1);
    let full = store2.class_full(classes[0].id).unwrap();
    assert_eq!(full.students.len(), 3);
}

#[test]
fn tombstone_propagates_to_second_device() {
    let site = Site::new();

    let (engine1, store1) = site.device("HW-1");
    engine1.activate(&site.key, Some("secret123")).unwrap();
    let (_class, students) = seed_class_with_students(&store1, 2);
    engine1.sync_cycle().unwrap();

    // Device 2 takes the full state first.
    let (engine2, store2) = site.device("HW-2");
    engine2.activate(&site.key, Some("secret123")).unwrap();
    engine2.sync_cycle().unwrap();
    assert_eq!(store2.count(EntityKind::Student).unwrap(), 2);

    // Device 1 deletes a student and pushes the deletion.
    store1.delete_row(EntityKind::Student, students[0]).unwrap();
    engine1.sync_cycle().unwrap();

    // Device 2's cursor predates the deletion, so the next pull surfaces
    // the tombstone and removes the local copy.
    engine2.sync_cycle().unwrap();
    assert_eq!(store2.count(EntityKind::Student).unwrap(), 1);
}

#[test]
fn repeated_cycles_are_idempotent() {
    let site = Site::new();
    let (engine, store) = site.device("HW-1");
    engine.activate(&site.key, Some("secret123")).unwrap();
    seed_class_with_students(&store, 2);

    engine.sync_cycle().unwrap();
    let second = engine.sync_cycle().unwrap();
    assert_eq!(second.pushed, 0);
    assert_eq!(second.pulled, 0); // cursor excludes everything already seen

    assert_eq!(store.count(EntityKind::Student).unwrap(), 2);
}

#[test]
fn unregistered_hwid_cannot_sync() {
    let site = Site::new();

    // HW-1 activates normally.
    let (engine1, _store1) = site.device("HW-1");
    engine1.activate(&site.key, Some("secret123")).unwrap();

    // A second device reuses the first device's token without activating.
    let (engine2, store2) = site.device("HW-ROGUE");
    let tenant = site.cloud.store().license_by_key(&site.key).unwrap().unwrap();
    store2.set_tenant_id(&tenant.tenant_id).unwrap();
    let token = site
        .cloud
        .activate(&site.key, "HW-1", Some("secret123"))
        .unwrap()
        .token;
    store2.set_license_token(&token).unwrap();

    let result = engine2.sync_cycle();
    match result {
        Err(SyncError::Cloud { status, .. }) => assert_eq!(status, 403),
        other => panic!("unexpected: {other:?}"),
    }
}

#[test]
fn lan_edits_reach_cloud_on_next_push() {
    let site = Site::new();
    let (engine, store) = site.device("HW-1");
    engine.activate(&site.key, Some("secret123")).unwrap();
    let (class, students) = seed_class_with_students(&store, 1);
    let subject = store
        .create_subject(&Subject {
            local_id: 0,
            name: "Maths".into(),
            code: "MAT".into(),
            category: String::new(),
            sub_domain: String::new(),
            max_p1: 10.0,
            max_p2: 10.0,
            max_exam1: 20.0,
            max_p3: 10.0,
            max_p4: 10.0,
            max_exam2: 20.0,
            class_local_id: Some(class),
            domain_local_id: None,
        })
        .unwrap();
    engine.sync_cycle().unwrap();

    // A LAN client writes a grade through the hub's batch path.
    store
        .upsert_grade_cells(&[GradeCell {
            student_id: students[0],
            subject_id: subject,
            period: "1".into(),
            value: 8.0,
        }])
        .unwrap();

    let result = engine.sync_cycle().unwrap();
    assert_eq!(result.pushed, 1);

    // The cell is visible to a full pull from another device.
    let (engine2, store2) = site.device("HW-2");
    engine2.activate(&site.key, Some("secret123")).unwrap();
    engine2.sync_cycle().unwrap();
    assert_eq!(store2.count(EntityKind::Grade).unwrap(), 1);
}

#[test]
fn draft_students_stay_local() {
    let site = Site::new();
    let (engine, store) = site.device("HW-1");
    engine.activate(&site.key, Some("secret123")).unwrap();

    // One assigned student, one draft without a class.
    seed_class_with_students(&store, 1);
    store
        .create_student(&Student {
            local_id: 0,
            first_name: "Draft".into(),
            last_name: "Student".into(),
            post_name: String::new(),
            gender: String::new(),
            birth_date: String::new(),
            birthplace: String::new(),
            is_abandoned: false,
            abandon_reason: String::new(),
            class_local_id: None,
        })
        .unwrap();
    engine.sync_cycle().unwrap();

    let (engine2, store2) = site.device("HW-2");
    engine2.activate(&site.key, Some("secret123")).unwrap();
    engine2.sync_cycle().unwrap();
    assert_eq!(store2.count(EntityKind::Student).unwrap(), 1);
}

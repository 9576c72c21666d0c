use chrono::{DateTime, Duration, FixedOffset, Utc};
use rand::Rng;
use rand_core::OsRng;
use serde::Deserialize;
use uuid::Uuid;

use crate::err::Error;
use crate::models::{
    AttendanceHistory, AttendanceRecord, AttendanceSession, AttendanceStatus, Class,
};
use crate::rules::enrollment::check_enrollment;
use crate::store::Transaction;

/// How long students can mark themselves present after a session opens.
pub const ATTENDANCE_WINDOW_MINUTES: i64 = 2;

const CODE_LEN: usize = 6;
// no 0/O or 1/I
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const CODE_ATTEMPTS: usize = 8;

fn generate_code() -> String {
    (0..CODE_LEN)
        .map(|_| CODE_ALPHABET[OsRng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

async fn owned_class(
    tx: &mut dyn Transaction,
    class_id: Uuid,
    faculty_id: Uuid,
) -> Result<Class, Error> {
    let class = tx
        .get_class(class_id)
        .await?
        .filter(|class| class.is_active)
        .ok_or_else(|| Error::not_found("Class not found"))?;
    if class.faculty_id != faculty_id {
        return Err(Error::forbidden(format!(
            "Class {} is not taught by this faculty member",
            class.code
        )));
    }
    Ok(class)
}

async fn owned_session(
    tx: &mut dyn Transaction,
    session_id: Uuid,
    faculty_id: Uuid,
) -> Result<AttendanceSession, Error> {
    let session = tx
        .get_attendance_session(session_id)
        .await?
        .ok_or_else(|| Error::not_found("Attendance session not found"))?;
    if session.faculty_id != faculty_id {
        return Err(Error::forbidden(
            "Attendance session belongs to another faculty member",
        ));
    }
    Ok(session)
}

/// Opens a two-minute attendance window for a class taught by `faculty_id`.
///
/// The lecture date, its number within the day and the HH:MM times follow the campus
/// clock given by `campus`.
pub async fn start_attendance_session(
    tx: &mut dyn Transaction,
    class_id: Uuid,
    faculty_id: Uuid,
    now: DateTime<Utc>,
    campus: FixedOffset,
) -> Result<AttendanceSession, Error> {
    let class = owned_class(tx, class_id, faculty_id).await?;

    let local = now.with_timezone(&campus);
    let lecture_date = local.date_naive();
    let held_today = tx.count_sessions_on(class_id, lecture_date).await?;

    let mut unique_code = None;
    for _ in 0..CODE_ATTEMPTS {
        let candidate = generate_code();
        if tx.find_active_session_by_code(&candidate).await?.is_none() {
            unique_code = Some(candidate);
            break;
        }
    }
    let unique_code = unique_code.ok_or_else(|| {
        Error::internal("CodeGeneration", "Could not generate a free attendance code")
    })?;

    let session = AttendanceSession {
        id: Uuid::new_v4(),
        class_id,
        faculty_id,
        lecture_date,
        start_time: local.format("%H:%M").to_string(),
        end_time: (local + Duration::minutes(ATTENDANCE_WINDOW_MINUTES))
            .format("%H:%M")
            .to_string(),
        unique_code,
        lecture_number: held_today as i32 + 1,
        is_active: true,
        created_at: now,
    };
    tx.insert_attendance_session(&session).await?;

    log::info!(
        "Opened attendance session {} for class {} (lecture {} on {})",
        session.id,
        class.code,
        session.lecture_number,
        session.lecture_date
    );
    Ok(session)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkAttendance {
    pub code: String,
    pub student_id: Uuid,
}

/// Request metadata kept on the record for auditing.
#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

/// Marks an enrolled student present in the open session identified by `mark.code`.
/// A student gets at most one record per session.
pub async fn mark_attendance(
    tx: &mut dyn Transaction,
    mark: MarkAttendance,
    client: ClientInfo,
    now: DateTime<Utc>,
) -> Result<AttendanceRecord, Error> {
    let code = mark.code.trim().to_uppercase();
    let session = tx
        .find_active_session_by_code(&code)
        .await?
        .ok_or_else(|| Error::not_found("Invalid attendance code"))?;

    if now > session.created_at + Duration::minutes(ATTENDANCE_WINDOW_MINUTES) {
        return Err(Error::SessionExpired {
            message: format!("Attendance window closed at {}", session.end_time),
        });
    }

    if check_enrollment(tx, session.class_id, mark.student_id)
        .await?
        .is_none()
    {
        log::warn!(
            "Student {} tried to mark attendance in class {} without an enrollment",
            mark.student_id,
            session.class_id
        );
        return Err(Error::NotEnrolled {
            message: "Student is not enrolled in this class".to_string(),
        });
    }

    if tx
        .find_attendance_record(session.id, mark.student_id)
        .await?
        .is_some()
    {
        return Err(Error::already_marked());
    }

    let record = AttendanceRecord {
        id: Uuid::new_v4(),
        session_id: session.id,
        student_id: mark.student_id,
        class_id: session.class_id,
        status: AttendanceStatus::Present,
        marked_at: now,
        ip_address: client.ip_address,
        user_agent: client.user_agent,
        is_edited: false,
        edited_at: None,
        edited_by: None,
    };
    tx.insert_attendance_record(&record).await?;
    log::info!(
        "Student {} marked present in session {}",
        record.student_id,
        session.id
    );
    Ok(record)
}

pub async fn close_attendance_session(
    tx: &mut dyn Transaction,
    session_id: Uuid,
    faculty_id: Uuid,
) -> Result<Uuid, Error> {
    let session = owned_session(tx, session_id, faculty_id).await?;
    tx.deactivate_attendance_session(session.id).await?;
    log::info!("Closed attendance session {}", session.id);
    Ok(session.id)
}

/// Manual override by the faculty member who owns the session's class.
pub async fn edit_attendance_record(
    tx: &mut dyn Transaction,
    record_id: Uuid,
    status: AttendanceStatus,
    faculty_id: Uuid,
    now: DateTime<Utc>,
) -> Result<AttendanceRecord, Error> {
    let record = tx
        .get_attendance_record(record_id)
        .await?
        .ok_or_else(|| Error::not_found("Attendance record not found"))?;
    owned_session(tx, record.session_id, faculty_id).await?;

    tx.edit_attendance_record(record_id, status, faculty_id, now)
        .await?;
    log::info!(
        "Attendance record {} set to {:?} by faculty {}",
        record_id,
        status,
        faculty_id
    );
    Ok(AttendanceRecord {
        status,
        is_edited: true,
        edited_at: Some(now),
        edited_by: Some(faculty_id),
        ..record
    })
}

/// A student's attendance history, optionally limited to one class. Records whose session
/// or class no longer resolves are left out.
pub async fn get_student_attendance(
    tx: &mut dyn Transaction,
    student_id: Uuid,
    class_id: Option<Uuid>,
) -> Result<Vec<AttendanceHistory>, Error> {
    let records = tx.records_by_student(student_id, class_id).await?;
    let mut history = Vec::with_capacity(records.len());
    for record in records {
        let session = tx.get_attendance_session(record.session_id).await?;
        let class = tx.get_class(record.class_id).await?;
        if let (Some(session), Some(class)) = (session, class) {
            history.push(AttendanceHistory {
                attendance: record,
                session,
                class,
            });
        }
    }
    Ok(history)
}

pub async fn get_session_attendance(
    tx: &mut dyn Transaction,
    session_id: Uuid,
    faculty_id: Uuid,
) -> Result<Vec<AttendanceRecord>, Error> {
    let session = owned_session(tx, session_id, faculty_id).await?;
    tx.records_by_session(session.id).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::enrollment::enroll_student_in_class;
    use crate::rules::fixtures::{self, at};
    use crate::store::{MemoryStore, RecordStore};

    struct Setup {
        store: MemoryStore,
        faculty_id: Uuid,
        class_id: Uuid,
        student_id: Uuid,
    }

    async fn setup() -> Setup {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let faculty = fixtures::faculty(&mut *tx).await;
        let class_id = fixtures::class(&mut *tx, faculty.id, "CS301", 30).await;
        let student_id = fixtures::student(&mut *tx, "123").await;
        enroll_student_in_class(&mut *tx, class_id, student_id, at(8, 30, 0))
            .await
            .unwrap();
        tx.commit().await.unwrap();
        Setup {
            store,
            faculty_id: faculty.id,
            class_id,
            student_id,
        }
    }

    fn utc() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    fn mark(code: &str, student_id: Uuid) -> MarkAttendance {
        MarkAttendance {
            code: code.to_string(),
            student_id,
        }
    }

    #[test]
    fn codes_use_the_unambiguous_alphabet() {
        for _ in 0..32 {
            let code = generate_code();
            assert_eq!(code.len(), CODE_LEN);
            assert!(code.bytes().all(|b| CODE_ALPHABET.contains(&b)));
        }
    }

    #[tokio::test]
    async fn session_window_and_lecture_numbers() {
        let s = setup().await;
        let mut tx = s.store.begin().await.unwrap();

        let first = start_attendance_session(
            &mut *tx,
            s.class_id,
            s.faculty_id,
            at(10, 0, 0),
            utc(),
        )
        .await
        .unwrap();
        assert_eq!(first.start_time, "10:00");
        assert_eq!(first.end_time, "10:02");
        assert_eq!(first.lecture_number, 1);
        assert_eq!(first.lecture_date.to_string(), "2025-09-08");

        let second = start_attendance_session(
            &mut *tx,
            s.class_id,
            s.faculty_id,
            at(14, 59, 0),
            utc(),
        )
        .await
        .unwrap();
        assert_eq!(second.lecture_number, 2);
        assert_eq!(second.end_time, "15:01");
        assert_ne!(first.unique_code, second.unique_code);
    }

    #[tokio::test]
    async fn lecture_day_follows_the_campus_clock() {
        let s = setup().await;
        let mut tx = s.store.begin().await.unwrap();
        let ist = FixedOffset::east_opt(330 * 60).unwrap();

        // 15:30 on the 8th in IST
        let evening = start_attendance_session(
            &mut *tx,
            s.class_id,
            s.faculty_id,
            at(10, 0, 0),
            ist,
        )
        .await
        .unwrap();
        assert_eq!(evening.lecture_date.to_string(), "2025-09-08");
        assert_eq!(evening.start_time, "15:30");

        // 01:30 on the 9th in IST, still the 8th in UTC
        let early = start_attendance_session(
            &mut *tx,
            s.class_id,
            s.faculty_id,
            at(20, 0, 0),
            ist,
        )
        .await
        .unwrap();
        assert_eq!(early.lecture_date.to_string(), "2025-09-09");
        assert_eq!(early.start_time, "01:30");
        assert_eq!(early.end_time, "01:32");
        assert_eq!(early.lecture_number, 1);
        assert_eq!(early.created_at, at(20, 0, 0));
    }

    #[tokio::test]
    async fn only_the_owner_opens_sessions() {
        let s = setup().await;
        let mut tx = s.store.begin().await.unwrap();
        let err = start_attendance_session(
            &mut *tx,
            s.class_id,
            Uuid::new_v4(),
            at(10, 0, 0),
            utc(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Forbidden { .. }));

        let err = start_attendance_session(
            &mut *tx,
            Uuid::new_v4(),
            s.faculty_id,
            at(10, 0, 0),
            utc(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn marking_is_once_per_session() {
        let s = setup().await;
        let mut tx = s.store.begin().await.unwrap();
        let session = start_attendance_session(
            &mut *tx,
            s.class_id,
            s.faculty_id,
            at(10, 0, 0),
            utc(),
        )
        .await
        .unwrap();

        let client = ClientInfo {
            ip_address: Some("10.0.0.7".to_string()),
            user_agent: Some("curl/8.0".to_string()),
        };
        let record = mark_attendance(
            &mut *tx,
            mark(&session.unique_code.to_lowercase(), s.student_id),
            client,
            at(10, 1, 0),
        )
        .await
        .unwrap();
        assert_eq!(record.status, AttendanceStatus::Present);
        assert_eq!(record.class_id, s.class_id);
        assert_eq!(record.ip_address.as_deref(), Some("10.0.0.7"));

        let err = mark_attendance(
            &mut *tx,
            mark(&session.unique_code, s.student_id),
            ClientInfo::default(),
            at(10, 1, 30),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::AlreadyMarked { .. }));
    }

    #[tokio::test]
    async fn marking_after_the_window_expires() {
        let s = setup().await;
        let mut tx = s.store.begin().await.unwrap();
        let session = start_attendance_session(
            &mut *tx,
            s.class_id,
            s.faculty_id,
            at(10, 0, 0),
            utc(),
        )
        .await
        .unwrap();

        let err = mark_attendance(
            &mut *tx,
            mark(&session.unique_code, s.student_id),
            ClientInfo::default(),
            at(10, 2, 1),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::SessionExpired { .. }));
    }

    #[tokio::test]
    async fn unenrolled_students_and_closed_sessions_are_refused() {
        let s = setup().await;
        let mut tx = s.store.begin().await.unwrap();
        let outsider = fixtures::student(&mut *tx, "999").await;
        let session = start_attendance_session(
            &mut *tx,
            s.class_id,
            s.faculty_id,
            at(10, 0, 0),
            utc(),
        )
        .await
        .unwrap();

        let err = mark_attendance(
            &mut *tx,
            mark(&session.unique_code, outsider),
            ClientInfo::default(),
            at(10, 0, 30),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::NotEnrolled { .. }));

        close_attendance_session(&mut *tx, session.id, s.faculty_id)
            .await
            .unwrap();
        let err = mark_attendance(
            &mut *tx,
            mark(&session.unique_code, s.student_id),
            ClientInfo::default(),
            at(10, 0, 40),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn faculty_edits_and_history() {
        let s = setup().await;
        let mut tx = s.store.begin().await.unwrap();
        let session = start_attendance_session(
            &mut *tx,
            s.class_id,
            s.faculty_id,
            at(10, 0, 0),
            utc(),
        )
        .await
        .unwrap();
        let record = mark_attendance(
            &mut *tx,
            mark(&session.unique_code, s.student_id),
            ClientInfo::default(),
            at(10, 1, 0),
        )
        .await
        .unwrap();

        let err = edit_attendance_record(
            &mut *tx,
            record.id,
            AttendanceStatus::Absent,
            Uuid::new_v4(),
            at(11, 0, 0),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Forbidden { .. }));

        let edited = edit_attendance_record(
            &mut *tx,
            record.id,
            AttendanceStatus::Absent,
            s.faculty_id,
            at(11, 0, 0),
        )
        .await
        .unwrap();
        assert!(edited.is_edited);
        assert_eq!(edited.edited_by, Some(s.faculty_id));
        assert_eq!(tx.get_attendance_record(record.id).await.unwrap(), Some(edited));

        let history = get_student_attendance(&mut *tx, s.student_id, Some(s.class_id))
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].attendance.status, AttendanceStatus::Absent);
        assert_eq!(history[0].session.id, session.id);
        assert_eq!(history[0].class.code, "CS301");
        assert!(get_student_attendance(&mut *tx, s.student_id, Some(Uuid::new_v4()))
            .await
            .unwrap()
            .is_empty());

        let records = get_session_attendance(&mut *tx, session.id, s.faculty_id)
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
    }
}

//! In-process record store. Transactions are serialized by one mutex and work on a copy
//! of the tables that replaces the shared state on commit.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::{RecordStore, StoreResult, Transaction};
use crate::err::Error;
use crate::models::{
    AttendanceRecord, AttendanceSession, AttendanceStatus, Class, Enrollment, Faculty,
    LoginSession, Student, TimetableEntry,
};

#[derive(Debug, Clone, Default)]
struct Tables {
    faculty: Vec<Faculty>,
    classes: Vec<Class>,
    students: Vec<Student>,
    enrollments: Vec<Enrollment>,
    timetables: Vec<TimetableEntry>,
    sessions: Vec<AttendanceSession>,
    records: Vec<AttendanceRecord>,
    logins: Vec<LoginSession>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn begin(&self) -> StoreResult<Box<dyn Transaction>> {
        let guard = self.tables.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryTransaction { guard, working }))
    }
}

struct MemoryTransaction {
    guard: OwnedMutexGuard<Tables>,
    working: Tables,
}

fn missing(what: &str, id: Uuid) -> Error {
    Error::not_found(format!("{} `{}` not found", what, id))
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn get_faculty(&mut self, id: Uuid) -> StoreResult<Option<Faculty>> {
        Ok(self.working.faculty.iter().find(|f| f.id == id).cloned())
    }

    async fn find_faculty_by_external_id(
        &mut self,
        external_user_id: &str,
    ) -> StoreResult<Option<Faculty>> {
        Ok(self
            .working
            .faculty
            .iter()
            .find(|f| f.external_user_id == external_user_id)
            .cloned())
    }

    async fn insert_faculty(&mut self, faculty: &Faculty) -> StoreResult<()> {
        if self
            .working
            .faculty
            .iter()
            .any(|f| f.external_user_id == faculty.external_user_id)
        {
            return Err(Error::conflict("Faculty member already exists"));
        }
        self.working.faculty.push(faculty.clone());
        Ok(())
    }

    async fn get_class(&mut self, id: Uuid) -> StoreResult<Option<Class>> {
        Ok(self.working.classes.iter().find(|c| c.id == id).cloned())
    }

    async fn find_active_class_by_code(&mut self, code: &str) -> StoreResult<Option<Class>> {
        Ok(self
            .working
            .classes
            .iter()
            .find(|c| c.is_active && c.code == code)
            .cloned())
    }

    async fn active_classes_by_faculty(&mut self, faculty_id: Uuid) -> StoreResult<Vec<Class>> {
        Ok(self
            .working
            .classes
            .iter()
            .rev()
            .filter(|c| c.is_active && c.faculty_id == faculty_id)
            .cloned()
            .collect())
    }

    async fn insert_class(&mut self, class: &Class) -> StoreResult<()> {
        if class.is_active
            && self
                .working
                .classes
                .iter()
                .any(|c| c.is_active && c.code == class.code)
        {
            return Err(Error::duplicate_code());
        }
        self.working.classes.push(class.clone());
        Ok(())
    }

    async fn increment_enrollment(
        &mut self,
        class_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        match self.working.classes.iter_mut().find(|c| c.id == class_id) {
            Some(class) if !class.is_full() => {
                class.current_enrollment += 1;
                class.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_student(&mut self, id: Uuid) -> StoreResult<Option<Student>> {
        Ok(self.working.students.iter().find(|s| s.id == id).cloned())
    }

    async fn find_student_by_prn(&mut self, prn: &str) -> StoreResult<Option<Student>> {
        Ok(self.working.students.iter().find(|s| s.prn == prn).cloned())
    }

    async fn insert_student(&mut self, student: &Student) -> StoreResult<()> {
        if self.working.students.iter().any(|s| s.prn == student.prn) {
            return Err(Error::conflict(format!(
                "Student with PRN `{}` already exists",
                student.prn
            )));
        }
        self.working.students.push(student.clone());
        Ok(())
    }

    async fn update_student_identity(
        &mut self,
        id: Uuid,
        email: &str,
        name: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let student = self
            .working
            .students
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| missing("Student", id))?;
        student.email = email.to_string();
        student.name = name.to_string();
        student.updated_at = now;
        Ok(())
    }

    async fn find_enrollment(
        &mut self,
        class_id: Uuid,
        student_id: Uuid,
    ) -> StoreResult<Option<Enrollment>> {
        Ok(self
            .working
            .enrollments
            .iter()
            .find(|e| e.class_id == class_id && e.student_id == student_id)
            .cloned())
    }

    async fn active_enrollments_by_student(
        &mut self,
        student_id: Uuid,
    ) -> StoreResult<Vec<Enrollment>> {
        Ok(self
            .working
            .enrollments
            .iter()
            .filter(|e| e.is_active && e.student_id == student_id)
            .cloned()
            .collect())
    }

    async fn insert_enrollment(&mut self, enrollment: &Enrollment) -> StoreResult<()> {
        if self
            .working
            .enrollments
            .iter()
            .any(|e| e.class_id == enrollment.class_id && e.student_id == enrollment.student_id)
        {
            return Err(Error::duplicate_enrollment());
        }
        self.working.enrollments.push(enrollment.clone());
        Ok(())
    }

    async fn set_enrollment_active(&mut self, id: Uuid, active: bool) -> StoreResult<()> {
        let enrollment = self
            .working
            .enrollments
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| missing("Enrollment", id))?;
        enrollment.is_active = active;
        Ok(())
    }

    async fn get_timetable_entry(&mut self, id: Uuid) -> StoreResult<Option<TimetableEntry>> {
        Ok(self.working.timetables.iter().find(|t| t.id == id).cloned())
    }

    async fn active_timetable_by_class(
        &mut self,
        class_id: Uuid,
    ) -> StoreResult<Vec<TimetableEntry>> {
        let mut entries: Vec<TimetableEntry> = self
            .working
            .timetables
            .iter()
            .filter(|t| t.is_active && t.class_id == class_id)
            .cloned()
            .collect();
        entries.sort_by(|a, b| {
            a.day_of_week
                .cmp(&b.day_of_week)
                .then_with(|| a.start_time.cmp(&b.start_time))
        });
        Ok(entries)
    }

    async fn find_active_slot(
        &mut self,
        day_of_week: i32,
        start_time: &str,
    ) -> StoreResult<Option<TimetableEntry>> {
        Ok(self
            .working
            .timetables
            .iter()
            .find(|t| t.is_active && t.day_of_week == day_of_week && t.start_time == start_time)
            .cloned())
    }

    async fn insert_timetable_entry(&mut self, entry: &TimetableEntry) -> StoreResult<()> {
        if entry.is_active
            && self.working.timetables.iter().any(|t| {
                t.is_active
                    && t.day_of_week == entry.day_of_week
                    && t.start_time == entry.start_time
            })
        {
            return Err(Error::schedule_conflict(entry.day_of_week, &entry.start_time));
        }
        self.working.timetables.push(entry.clone());
        Ok(())
    }

    async fn deactivate_timetable_entry(
        &mut self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let entry = self
            .working
            .timetables
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| missing("Timetable entry", id))?;
        entry.is_active = false;
        entry.updated_at = now;
        Ok(())
    }

    async fn deactivate_class_timetable(
        &mut self,
        class_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let mut touched = 0;
        for entry in self
            .working
            .timetables
            .iter_mut()
            .filter(|t| t.class_id == class_id)
        {
            entry.is_active = false;
            entry.updated_at = now;
            touched += 1;
        }
        Ok(touched)
    }

    async fn get_attendance_session(
        &mut self,
        id: Uuid,
    ) -> StoreResult<Option<AttendanceSession>> {
        Ok(self.working.sessions.iter().find(|s| s.id == id).cloned())
    }

    async fn find_active_session_by_code(
        &mut self,
        code: &str,
    ) -> StoreResult<Option<AttendanceSession>> {
        Ok(self
            .working
            .sessions
            .iter()
            .find(|s| s.is_active && s.unique_code == code)
            .cloned())
    }

    async fn count_sessions_on(&mut self, class_id: Uuid, date: NaiveDate) -> StoreResult<i64> {
        Ok(self
            .working
            .sessions
            .iter()
            .filter(|s| s.class_id == class_id && s.lecture_date == date)
            .count() as i64)
    }

    async fn insert_attendance_session(
        &mut self,
        session: &AttendanceSession,
    ) -> StoreResult<()> {
        if session.is_active
            && self
                .working
                .sessions
                .iter()
                .any(|s| s.is_active && s.unique_code == session.unique_code)
        {
            return Err(Error::code_taken(&session.unique_code));
        }
        self.working.sessions.push(session.clone());
        Ok(())
    }

    async fn deactivate_attendance_session(&mut self, id: Uuid) -> StoreResult<()> {
        let session = self
            .working
            .sessions
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| missing("Attendance session", id))?;
        session.is_active = false;
        Ok(())
    }

    async fn get_attendance_record(&mut self, id: Uuid) -> StoreResult<Option<AttendanceRecord>> {
        Ok(self.working.records.iter().find(|r| r.id == id).cloned())
    }

    async fn find_attendance_record(
        &mut self,
        session_id: Uuid,
        student_id: Uuid,
    ) -> StoreResult<Option<AttendanceRecord>> {
        Ok(self
            .working
            .records
            .iter()
            .find(|r| r.session_id == session_id && r.student_id == student_id)
            .cloned())
    }

    async fn records_by_student(
        &mut self,
        student_id: Uuid,
        class_id: Option<Uuid>,
    ) -> StoreResult<Vec<AttendanceRecord>> {
        Ok(self
            .working
            .records
            .iter()
            .filter(|r| r.student_id == student_id)
            .filter(|r| class_id.map_or(true, |class_id| r.class_id == class_id))
            .cloned()
            .collect())
    }

    async fn records_by_session(
        &mut self,
        session_id: Uuid,
    ) -> StoreResult<Vec<AttendanceRecord>> {
        Ok(self
            .working
            .records
            .iter()
            .filter(|r| r.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn insert_attendance_record(&mut self, record: &AttendanceRecord) -> StoreResult<()> {
        if self
            .working
            .records
            .iter()
            .any(|r| r.session_id == record.session_id && r.student_id == record.student_id)
        {
            return Err(Error::already_marked());
        }
        self.working.records.push(record.clone());
        Ok(())
    }

    async fn edit_attendance_record(
        &mut self,
        id: Uuid,
        status: AttendanceStatus,
        edited_by: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let record = self
            .working
            .records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| missing("Attendance record", id))?;
        record.status = status;
        record.is_edited = true;
        record.edited_at = Some(now);
        record.edited_by = Some(edited_by);
        Ok(())
    }

    async fn find_login_session(&mut self, ssid: &str) -> StoreResult<Option<LoginSession>> {
        Ok(self.working.logins.iter().find(|l| l.ssid == ssid).cloned())
    }

    async fn insert_login_session(&mut self, session: &LoginSession) -> StoreResult<()> {
        self.working.logins.push(session.clone());
        Ok(())
    }

    async fn delete_login_session(&mut self, ssid: &str) -> StoreResult<bool> {
        let before = self.working.logins.len();
        self.working.logins.retain(|l| l.ssid != ssid);
        Ok(self.working.logins.len() < before)
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let MemoryTransaction { mut guard, working } = *self;
        *guard = working;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn class(code: &str, active: bool) -> Class {
        let now = Utc::now();
        Class {
            id: Uuid::new_v4(),
            faculty_id: Uuid::new_v4(),
            name: "Data Structures".to_string(),
            code: code.to_string(),
            description: None,
            max_capacity: 2,
            current_enrollment: 0,
            semester: "Fall 2025".to_string(),
            year: 2025,
            is_active: active,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn dropped_transaction_discards_writes() {
        let store = MemoryStore::new();
        let cs301 = class("CS301", true);

        let mut tx = store.begin().await.unwrap();
        tx.insert_class(&cs301).await.unwrap();
        drop(tx);

        let mut tx = store.begin().await.unwrap();
        assert!(tx.get_class(cs301.id).await.unwrap().is_none());
        tx.insert_class(&cs301).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        assert_eq!(tx.get_class(cs301.id).await.unwrap(), Some(cs301));
    }

    #[tokio::test]
    async fn increment_stops_at_capacity() {
        let store = MemoryStore::new();
        let cs301 = class("CS301", true);
        let mut tx = store.begin().await.unwrap();
        tx.insert_class(&cs301).await.unwrap();

        let now = Utc::now();
        assert!(tx.increment_enrollment(cs301.id, now).await.unwrap());
        assert!(tx.increment_enrollment(cs301.id, now).await.unwrap());
        assert!(!tx.increment_enrollment(cs301.id, now).await.unwrap());
        assert!(!tx.increment_enrollment(Uuid::new_v4(), now).await.unwrap());

        let stored = tx.get_class(cs301.id).await.unwrap().unwrap();
        assert_eq!(stored.current_enrollment, 2);
    }

    #[tokio::test]
    async fn inactive_codes_do_not_collide() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.insert_class(&class("IT201", false)).await.unwrap();
        tx.insert_class(&class("IT201", true)).await.unwrap();
        let err = tx.insert_class(&class("IT201", true)).await.unwrap_err();
        assert!(matches!(err, Error::DuplicateCode { .. }));
    }

    fn session(code: &str) -> AttendanceSession {
        let now = Utc::now();
        AttendanceSession {
            id: Uuid::new_v4(),
            class_id: Uuid::new_v4(),
            faculty_id: Uuid::new_v4(),
            lecture_date: now.date_naive(),
            start_time: "10:00".to_string(),
            end_time: "10:02".to_string(),
            unique_code: code.to_string(),
            lecture_number: 1,
            is_active: true,
            created_at: now,
        }
    }

    #[tokio::test]
    async fn racing_duplicates_are_conflicts() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();

        tx.insert_attendance_session(&session("K7M2QX")).await.unwrap();
        let err = tx
            .insert_attendance_session(&session("K7M2QX"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
        assert_eq!(err.status(), axum::http::StatusCode::CONFLICT);

        let closed = session("P3RT9W");
        tx.insert_attendance_session(&closed).await.unwrap();
        tx.deactivate_attendance_session(closed.id).await.unwrap();
        tx.insert_attendance_session(&session("P3RT9W")).await.unwrap();

        let now = Utc::now();
        let student = Student {
            id: Uuid::new_v4(),
            email: "a@uni.edu".to_string(),
            name: "A".to_string(),
            prn: "PRN9".to_string(),
            year: 1,
            department: "CS".to_string(),
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        tx.insert_student(&student).await.unwrap();
        let err = tx
            .insert_student(&Student {
                id: Uuid::new_v4(),
                ..student
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
    }
}

//! Record store collaborator.
//!
//! Rules never talk to a database directly: they receive a [`Transaction`] opened from a
//! [`RecordStore`] and either commit it or drop it. Dropping an uncommitted transaction
//! discards every write made through it.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::err::Error;
use crate::models::{
    AttendanceRecord, AttendanceSession, AttendanceStatus, Class, Enrollment, Faculty,
    LoginSession, Student, TimetableEntry,
};

pub use memory::MemoryStore;
pub use postgres::PgStore;

pub type StoreResult<T> = Result<T, Error>;

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn begin(&self) -> StoreResult<Box<dyn Transaction>>;
}

/// Indexed lookups, ordered scans, inserts and patches over every table.
#[async_trait]
pub trait Transaction: Send {
    // faculty
    async fn get_faculty(&mut self, id: Uuid) -> StoreResult<Option<Faculty>>;
    async fn find_faculty_by_external_id(
        &mut self,
        external_user_id: &str,
    ) -> StoreResult<Option<Faculty>>;
    async fn insert_faculty(&mut self, faculty: &Faculty) -> StoreResult<()>;

    // classes
    async fn get_class(&mut self, id: Uuid) -> StoreResult<Option<Class>>;
    async fn find_active_class_by_code(&mut self, code: &str) -> StoreResult<Option<Class>>;
    /// Active classes of a faculty member, newest first.
    async fn active_classes_by_faculty(&mut self, faculty_id: Uuid) -> StoreResult<Vec<Class>>;
    async fn insert_class(&mut self, class: &Class) -> StoreResult<()>;
    /// Adds one to `current_enrollment` only while it is below `max_capacity`.
    /// Returns `false` when the class is full or missing.
    async fn increment_enrollment(&mut self, class_id: Uuid, now: DateTime<Utc>)
        -> StoreResult<bool>;

    // students
    async fn get_student(&mut self, id: Uuid) -> StoreResult<Option<Student>>;
    async fn find_student_by_prn(&mut self, prn: &str) -> StoreResult<Option<Student>>;
    async fn insert_student(&mut self, student: &Student) -> StoreResult<()>;
    async fn update_student_identity(
        &mut self,
        id: Uuid,
        email: &str,
        name: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<()>;

    // enrollments
    /// Any enrollment for the pair, active or not.
    async fn find_enrollment(
        &mut self,
        class_id: Uuid,
        student_id: Uuid,
    ) -> StoreResult<Option<Enrollment>>;
    async fn active_enrollments_by_student(
        &mut self,
        student_id: Uuid,
    ) -> StoreResult<Vec<Enrollment>>;
    async fn insert_enrollment(&mut self, enrollment: &Enrollment) -> StoreResult<()>;
    async fn set_enrollment_active(&mut self, id: Uuid, active: bool) -> StoreResult<()>;

    // timetables
    async fn get_timetable_entry(&mut self, id: Uuid) -> StoreResult<Option<TimetableEntry>>;
    /// Active entries of a class, ordered by day then start time.
    async fn active_timetable_by_class(
        &mut self,
        class_id: Uuid,
    ) -> StoreResult<Vec<TimetableEntry>>;
    async fn find_active_slot(
        &mut self,
        day_of_week: i32,
        start_time: &str,
    ) -> StoreResult<Option<TimetableEntry>>;
    async fn insert_timetable_entry(&mut self, entry: &TimetableEntry) -> StoreResult<()>;
    async fn deactivate_timetable_entry(&mut self, id: Uuid, now: DateTime<Utc>)
        -> StoreResult<()>;
    /// Deactivates every entry of the class. Returns how many rows were touched.
    async fn deactivate_class_timetable(
        &mut self,
        class_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<u64>;

    // attendance sessions
    async fn get_attendance_session(&mut self, id: Uuid)
        -> StoreResult<Option<AttendanceSession>>;
    async fn find_active_session_by_code(
        &mut self,
        code: &str,
    ) -> StoreResult<Option<AttendanceSession>>;
    async fn count_sessions_on(&mut self, class_id: Uuid, date: NaiveDate) -> StoreResult<i64>;
    async fn insert_attendance_session(&mut self, session: &AttendanceSession)
        -> StoreResult<()>;
    async fn deactivate_attendance_session(&mut self, id: Uuid) -> StoreResult<()>;

    // attendance records
    async fn get_attendance_record(&mut self, id: Uuid) -> StoreResult<Option<AttendanceRecord>>;
    async fn find_attendance_record(
        &mut self,
        session_id: Uuid,
        student_id: Uuid,
    ) -> StoreResult<Option<AttendanceRecord>>;
    async fn records_by_student(
        &mut self,
        student_id: Uuid,
        class_id: Option<Uuid>,
    ) -> StoreResult<Vec<AttendanceRecord>>;
    async fn records_by_session(&mut self, session_id: Uuid)
        -> StoreResult<Vec<AttendanceRecord>>;
    async fn insert_attendance_record(&mut self, record: &AttendanceRecord) -> StoreResult<()>;
    async fn edit_attendance_record(
        &mut self,
        id: Uuid,
        status: AttendanceStatus,
        edited_by: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<()>;

    // login sessions
    async fn find_login_session(&mut self, ssid: &str) -> StoreResult<Option<LoginSession>>;
    async fn insert_login_session(&mut self, session: &LoginSession) -> StoreResult<()>;
    async fn delete_login_session(&mut self, ssid: &str) -> StoreResult<bool>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;
}

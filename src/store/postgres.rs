use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Postgres;
use std::time::Duration;
use uuid::Uuid;

use super::{RecordStore, StoreResult, Transaction};
use crate::err::Error;
use crate::models::{
    AttendanceRecord, AttendanceSession, AttendanceStatus, Class, Enrollment, Faculty,
    LoginSession, Student, TimetableEntry,
};

/// PostgreSQL record store. Uniqueness rules are backed by the partial unique indexes
/// created in `migrations/`.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        log::info!("Connected to PostgreSQL record store");
        Ok(Self { pool })
    }
}

#[async_trait]
impl RecordStore for PgStore {
    async fn begin(&self) -> StoreResult<Box<dyn Transaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTransaction { tx }))
    }
}

struct PgTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
}

/// Maps a unique-index violation to the given domain error, anything else to a
/// database error.
fn on_unique(err: sqlx::Error, conflict: impl FnOnce() -> Error) -> Error {
    match &err {
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => conflict(),
        _ => Error::from(err),
    }
}

#[async_trait]
impl Transaction for PgTransaction {
    async fn get_faculty(&mut self, id: Uuid) -> StoreResult<Option<Faculty>> {
        Ok(
            sqlx::query_as::<_, Faculty>("SELECT * FROM faculty WHERE id = $1")
                .bind(id)
                .fetch_optional(&mut *self.tx)
                .await?,
        )
    }

    async fn find_faculty_by_external_id(
        &mut self,
        external_user_id: &str,
    ) -> StoreResult<Option<Faculty>> {
        Ok(sqlx::query_as::<_, Faculty>(
            "SELECT * FROM faculty WHERE external_user_id = $1 LIMIT 1",
        )
        .bind(external_user_id)
        .fetch_optional(&mut *self.tx)
        .await?)
    }

    async fn insert_faculty(&mut self, faculty: &Faculty) -> StoreResult<()> {
        sqlx::query("INSERT INTO faculty VALUES ($1, $2, $3, $4, $5, $6, $7, $8)")
            .bind(faculty.id)
            .bind(&faculty.external_user_id)
            .bind(&faculty.email)
            .bind(&faculty.name)
            .bind(&faculty.department)
            .bind(faculty.is_active)
            .bind(faculty.created_at)
            .bind(faculty.updated_at)
            .execute(&mut *self.tx)
            .await
            .map_err(|err| on_unique(err, || Error::conflict("Faculty member already exists")))?;
        Ok(())
    }

    async fn get_class(&mut self, id: Uuid) -> StoreResult<Option<Class>> {
        Ok(
            sqlx::query_as::<_, Class>("SELECT * FROM classes WHERE id = $1")
                .bind(id)
                .fetch_optional(&mut *self.tx)
                .await?,
        )
    }

    async fn find_active_class_by_code(&mut self, code: &str) -> StoreResult<Option<Class>> {
        Ok(sqlx::query_as::<_, Class>(
            "SELECT * FROM classes WHERE code = $1 AND is_active LIMIT 1",
        )
        .bind(code)
        .fetch_optional(&mut *self.tx)
        .await?)
    }

    async fn active_classes_by_faculty(&mut self, faculty_id: Uuid) -> StoreResult<Vec<Class>> {
        Ok(sqlx::query_as::<_, Class>(
            "SELECT * FROM classes WHERE faculty_id = $1 AND is_active ORDER BY created_at DESC",
        )
        .bind(faculty_id)
        .fetch_all(&mut *self.tx)
        .await?)
    }

    async fn insert_class(&mut self, class: &Class) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO classes VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        )
        .bind(class.id)
        .bind(class.faculty_id)
        .bind(&class.name)
        .bind(&class.code)
        .bind(&class.description)
        .bind(class.max_capacity)
        .bind(class.current_enrollment)
        .bind(&class.semester)
        .bind(class.year)
        .bind(class.is_active)
        .bind(class.created_at)
        .bind(class.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|err| on_unique(err, Error::duplicate_code))?;
        Ok(())
    }

    async fn increment_enrollment(
        &mut self,
        class_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let res = sqlx::query(
            "UPDATE classes SET current_enrollment = current_enrollment + 1, updated_at = $2 \
             WHERE id = $1 AND current_enrollment < max_capacity",
        )
        .bind(class_id)
        .bind(now)
        .execute(&mut *self.tx)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn get_student(&mut self, id: Uuid) -> StoreResult<Option<Student>> {
        Ok(
            sqlx::query_as::<_, Student>("SELECT * FROM students WHERE id = $1")
                .bind(id)
                .fetch_optional(&mut *self.tx)
                .await?,
        )
    }

    async fn find_student_by_prn(&mut self, prn: &str) -> StoreResult<Option<Student>> {
        Ok(
            sqlx::query_as::<_, Student>("SELECT * FROM students WHERE prn = $1 LIMIT 1")
                .bind(prn)
                .fetch_optional(&mut *self.tx)
                .await?,
        )
    }

    async fn insert_student(&mut self, student: &Student) -> StoreResult<()> {
        sqlx::query("INSERT INTO students VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)")
            .bind(student.id)
            .bind(&student.email)
            .bind(&student.name)
            .bind(&student.prn)
            .bind(student.year)
            .bind(&student.department)
            .bind(student.is_active)
            .bind(student.created_at)
            .bind(student.updated_at)
            .execute(&mut *self.tx)
            .await
            .map_err(|err| {
                on_unique(err, || {
                    Error::conflict(format!(
                        "Student with PRN `{}` already exists",
                        student.prn
                    ))
                })
            })?;
        Ok(())
    }

    async fn update_student_identity(
        &mut self,
        id: Uuid,
        email: &str,
        name: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        sqlx::query("UPDATE students SET email = $2, name = $3, updated_at = $4 WHERE id = $1")
            .bind(id)
            .bind(email)
            .bind(name)
            .bind(now)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn find_enrollment(
        &mut self,
        class_id: Uuid,
        student_id: Uuid,
    ) -> StoreResult<Option<Enrollment>> {
        Ok(sqlx::query_as::<_, Enrollment>(
            "SELECT * FROM enrollments WHERE class_id = $1 AND student_id = $2 LIMIT 1",
        )
        .bind(class_id)
        .bind(student_id)
        .fetch_optional(&mut *self.tx)
        .await?)
    }

    async fn active_enrollments_by_student(
        &mut self,
        student_id: Uuid,
    ) -> StoreResult<Vec<Enrollment>> {
        Ok(sqlx::query_as::<_, Enrollment>(
            "SELECT * FROM enrollments WHERE student_id = $1 AND is_active ORDER BY enrolled_at",
        )
        .bind(student_id)
        .fetch_all(&mut *self.tx)
        .await?)
    }

    async fn insert_enrollment(&mut self, enrollment: &Enrollment) -> StoreResult<()> {
        sqlx::query("INSERT INTO enrollments VALUES ($1, $2, $3, $4, $5)")
            .bind(enrollment.id)
            .bind(enrollment.class_id)
            .bind(enrollment.student_id)
            .bind(enrollment.enrolled_at)
            .bind(enrollment.is_active)
            .execute(&mut *self.tx)
            .await
            .map_err(|err| on_unique(err, Error::duplicate_enrollment))?;
        Ok(())
    }

    async fn set_enrollment_active(&mut self, id: Uuid, active: bool) -> StoreResult<()> {
        sqlx::query("UPDATE enrollments SET is_active = $2 WHERE id = $1")
            .bind(id)
            .bind(active)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn get_timetable_entry(&mut self, id: Uuid) -> StoreResult<Option<TimetableEntry>> {
        Ok(
            sqlx::query_as::<_, TimetableEntry>("SELECT * FROM timetables WHERE id = $1")
                .bind(id)
                .fetch_optional(&mut *self.tx)
                .await?,
        )
    }

    async fn active_timetable_by_class(
        &mut self,
        class_id: Uuid,
    ) -> StoreResult<Vec<TimetableEntry>> {
        Ok(sqlx::query_as::<_, TimetableEntry>(
            "SELECT * FROM timetables WHERE class_id = $1 AND is_active \
             ORDER BY day_of_week, start_time",
        )
        .bind(class_id)
        .fetch_all(&mut *self.tx)
        .await?)
    }

    async fn find_active_slot(
        &mut self,
        day_of_week: i32,
        start_time: &str,
    ) -> StoreResult<Option<TimetableEntry>> {
        Ok(sqlx::query_as::<_, TimetableEntry>(
            "SELECT * FROM timetables WHERE day_of_week = $1 AND start_time = $2 AND is_active \
             LIMIT 1",
        )
        .bind(day_of_week)
        .bind(start_time)
        .fetch_optional(&mut *self.tx)
        .await?)
    }

    async fn insert_timetable_entry(&mut self, entry: &TimetableEntry) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO timetables VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(entry.id)
        .bind(entry.class_id)
        .bind(entry.day_of_week)
        .bind(&entry.start_time)
        .bind(&entry.end_time)
        .bind(&entry.room)
        .bind(&entry.semester)
        .bind(entry.year)
        .bind(entry.is_active)
        .bind(entry.created_at)
        .bind(entry.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|err| {
            on_unique(err, || {
                Error::schedule_conflict(entry.day_of_week, &entry.start_time)
            })
        })?;
        Ok(())
    }

    async fn deactivate_timetable_entry(
        &mut self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        sqlx::query("UPDATE timetables SET is_active = FALSE, updated_at = $2 WHERE id = $1")
            .bind(id)
            .bind(now)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn deactivate_class_timetable(
        &mut self,
        class_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let res = sqlx::query(
            "UPDATE timetables SET is_active = FALSE, updated_at = $2 WHERE class_id = $1",
        )
        .bind(class_id)
        .bind(now)
        .execute(&mut *self.tx)
        .await?;
        Ok(res.rows_affected())
    }

    async fn get_attendance_session(
        &mut self,
        id: Uuid,
    ) -> StoreResult<Option<AttendanceSession>> {
        Ok(sqlx::query_as::<_, AttendanceSession>(
            "SELECT * FROM attendance_sessions WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?)
    }

    async fn find_active_session_by_code(
        &mut self,
        code: &str,
    ) -> StoreResult<Option<AttendanceSession>> {
        Ok(sqlx::query_as::<_, AttendanceSession>(
            "SELECT * FROM attendance_sessions WHERE unique_code = $1 AND is_active LIMIT 1",
        )
        .bind(code)
        .fetch_optional(&mut *self.tx)
        .await?)
    }

    async fn count_sessions_on(&mut self, class_id: Uuid, date: NaiveDate) -> StoreResult<i64> {
        Ok(sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM attendance_sessions WHERE class_id = $1 AND lecture_date = $2",
        )
        .bind(class_id)
        .bind(date)
        .fetch_one(&mut *self.tx)
        .await?)
    }

    async fn insert_attendance_session(
        &mut self,
        session: &AttendanceSession,
    ) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO attendance_sessions VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(session.id)
        .bind(session.class_id)
        .bind(session.faculty_id)
        .bind(session.lecture_date)
        .bind(&session.start_time)
        .bind(&session.end_time)
        .bind(&session.unique_code)
        .bind(session.lecture_number)
        .bind(session.is_active)
        .bind(session.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|err| on_unique(err, || Error::code_taken(&session.unique_code)))?;
        Ok(())
    }

    async fn deactivate_attendance_session(&mut self, id: Uuid) -> StoreResult<()> {
        sqlx::query("UPDATE attendance_sessions SET is_active = FALSE WHERE id = $1")
            .bind(id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn get_attendance_record(&mut self, id: Uuid) -> StoreResult<Option<AttendanceRecord>> {
        Ok(sqlx::query_as::<_, AttendanceRecord>(
            "SELECT * FROM attendance_records WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?)
    }

    async fn find_attendance_record(
        &mut self,
        session_id: Uuid,
        student_id: Uuid,
    ) -> StoreResult<Option<AttendanceRecord>> {
        Ok(sqlx::query_as::<_, AttendanceRecord>(
            "SELECT * FROM attendance_records WHERE session_id = $1 AND student_id = $2 LIMIT 1",
        )
        .bind(session_id)
        .bind(student_id)
        .fetch_optional(&mut *self.tx)
        .await?)
    }

    async fn records_by_student(
        &mut self,
        student_id: Uuid,
        class_id: Option<Uuid>,
    ) -> StoreResult<Vec<AttendanceRecord>> {
        Ok(sqlx::query_as::<_, AttendanceRecord>(
            "SELECT * FROM attendance_records \
             WHERE student_id = $1 AND ($2::uuid IS NULL OR class_id = $2) \
             ORDER BY marked_at",
        )
        .bind(student_id)
        .bind(class_id)
        .fetch_all(&mut *self.tx)
        .await?)
    }

    async fn records_by_session(
        &mut self,
        session_id: Uuid,
    ) -> StoreResult<Vec<AttendanceRecord>> {
        Ok(sqlx::query_as::<_, AttendanceRecord>(
            "SELECT * FROM attendance_records WHERE session_id = $1 ORDER BY marked_at",
        )
        .bind(session_id)
        .fetch_all(&mut *self.tx)
        .await?)
    }

    async fn insert_attendance_record(&mut self, record: &AttendanceRecord) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO attendance_records \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(record.id)
        .bind(record.session_id)
        .bind(record.student_id)
        .bind(record.class_id)
        .bind(record.status)
        .bind(record.marked_at)
        .bind(&record.ip_address)
        .bind(&record.user_agent)
        .bind(record.is_edited)
        .bind(record.edited_at)
        .bind(record.edited_by)
        .execute(&mut *self.tx)
        .await
        .map_err(|err| on_unique(err, Error::already_marked))?;
        Ok(())
    }

    async fn edit_attendance_record(
        &mut self,
        id: Uuid,
        status: AttendanceStatus,
        edited_by: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        sqlx::query(
            "UPDATE attendance_records \
             SET status = $2, is_edited = TRUE, edited_at = $3, edited_by = $4 WHERE id = $1",
        )
        .bind(id)
        .bind(status)
        .bind(now)
        .bind(edited_by)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn find_login_session(&mut self, ssid: &str) -> StoreResult<Option<LoginSession>> {
        Ok(sqlx::query_as::<_, LoginSession>(
            "SELECT * FROM user_sessions WHERE ssid = $1 LIMIT 1",
        )
        .bind(ssid)
        .fetch_optional(&mut *self.tx)
        .await?)
    }

    async fn insert_login_session(&mut self, session: &LoginSession) -> StoreResult<()> {
        let res = sqlx::query("INSERT INTO user_sessions VALUES ($1, $2, $3, $4, $5)")
            .bind(&session.ssid)
            .bind(&session.user_id)
            .bind(&session.email)
            .bind(&session.name)
            .bind(session.expires_at)
            .execute(&mut *self.tx)
            .await?;

        if res.rows_affected() < 1 {
            return Err(Error::internal(
                "DatabaseError",
                "Could not update session ids!",
            ));
        }
        Ok(())
    }

    async fn delete_login_session(&mut self, ssid: &str) -> StoreResult<bool> {
        let affected = sqlx::query("DELETE FROM user_sessions WHERE ssid = $1")
            .bind(ssid)
            .execute(&mut *self.tx)
            .await?;
        Ok(affected.rows_affected() >= 1)
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.tx.commit().await?;
        Ok(())
    }
}

//! JSON endpoints. Each handler runs its rule inside one store transaction and commits
//! only when the rule succeeded.

use std::net::SocketAddr;

use axum::extract::ConnectInfo;
use axum::http::header::USER_AGENT;
use axum::http::HeaderMap;
use axum::Extension;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::CurrentFaculty;
use crate::extract::{Json, Path, Query};
use crate::models::{
    AttendanceHistory, AttendanceRecord, AttendanceSession, AttendanceStatus, Class,
    ClassDetails, Enrollment, ScheduledEntry, Student, StudentClass, TimetableEntry,
};
use crate::rules::attendance::{self, ClientInfo, MarkAttendance};
use crate::rules::class::{self, NewClass};
use crate::rules::enrollment::{self, ClassRegistration, Registered};
use crate::rules::student::{self, NewStudent};
use crate::rules::timetable::{self, Slot};
use crate::store::Transaction;
use crate::{proceeds, AppState, Error, Payload};

async fn owned_class(
    tx: &mut dyn Transaction,
    class_id: Uuid,
    faculty: &CurrentFaculty,
) -> Result<Class, Error> {
    let class = tx
        .get_class(class_id)
        .await?
        .ok_or_else(|| Error::not_found("Class not found"))?;
    if class.faculty_id != faculty.0.id {
        return Err(Error::forbidden(format!(
            "Class {} is not taught by {}",
            class.code, faculty.0.name
        )));
    }
    Ok(class)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassCreated {
    pub class_id: Uuid,
}

pub async fn create_class(
    faculty: CurrentFaculty,
    Extension(state): Extension<AppState>,
    Json(new): Json<NewClass>,
) -> Payload<ClassCreated> {
    let mut tx = state.store.begin().await?;
    let class_id = class::create_class(&mut *tx, faculty.0.id, new, Utc::now()).await?;
    tx.commit().await?;
    proceeds(ClassCreated { class_id })
}

#[derive(Debug, Clone, Serialize)]
pub struct ClassDetailsResponse {
    pub class: Option<ClassDetails>,
}

pub async fn class_details(
    Path(class_id): Path<Uuid>,
    Extension(state): Extension<AppState>,
) -> Payload<ClassDetailsResponse> {
    let mut tx = state.store.begin().await?;
    let class = class::get_class_details(&mut *tx, class_id).await?;
    proceeds(ClassDetailsResponse { class })
}

#[derive(Debug, Clone, Serialize)]
pub struct ClassLookup {
    pub class: Option<Class>,
}

pub async fn class_by_code(
    Path(code): Path<String>,
    Extension(state): Extension<AppState>,
) -> Payload<ClassLookup> {
    let mut tx = state.store.begin().await?;
    let class = class::find_class_by_code(&mut *tx, &code).await?;
    proceeds(ClassLookup { class })
}

#[derive(Debug, Clone, Serialize)]
pub struct ClassList {
    pub classes: Vec<Class>,
}

pub async fn faculty_classes(
    Path(faculty_id): Path<Uuid>,
    Extension(state): Extension<AppState>,
) -> Payload<ClassList> {
    let mut tx = state.store.begin().await?;
    let classes = class::get_faculty_classes(&mut *tx, faculty_id).await?;
    proceeds(ClassList { classes })
}

#[derive(Debug, Clone, Serialize)]
pub struct Schedule {
    pub entries: Vec<ScheduledEntry>,
}

pub async fn faculty_timetable(
    Path(faculty_id): Path<Uuid>,
    Extension(state): Extension<AppState>,
) -> Payload<Schedule> {
    let mut tx = state.store.begin().await?;
    let entries = timetable::get_faculty_timetable(&mut *tx, faculty_id).await?;
    proceeds(Schedule { entries })
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollmentPair {
    pub class_id: Uuid,
    pub student_id: Uuid,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnrollmentStatus {
    pub enrollment: Option<Enrollment>,
}

pub async fn check_enrollment(
    Query(pair): Query<EnrollmentPair>,
    Extension(state): Extension<AppState>,
) -> Payload<EnrollmentStatus> {
    let mut tx = state.store.begin().await?;
    let enrollment =
        enrollment::check_enrollment(&mut *tx, pair.class_id, pair.student_id).await?;
    proceeds(EnrollmentStatus { enrollment })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollmentCreated {
    pub enrollment_id: Uuid,
}

pub async fn enroll(
    Extension(state): Extension<AppState>,
    Json(pair): Json<EnrollmentPair>,
) -> Payload<EnrollmentCreated> {
    let mut tx = state.store.begin().await?;
    let enrollment_id =
        enrollment::enroll_student_in_class(&mut *tx, pair.class_id, pair.student_id, Utc::now())
            .await?;
    tx.commit().await?;
    proceeds(EnrollmentCreated { enrollment_id })
}

pub async fn register_for_class(
    Extension(state): Extension<AppState>,
    Json(registration): Json<ClassRegistration>,
) -> Payload<Registered> {
    let mut tx = state.store.begin().await?;
    let registered = enrollment::register_for_class(&mut *tx, registration, Utc::now()).await?;
    tx.commit().await?;
    proceeds(registered)
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimetableUpdate {
    pub entries: Vec<Slot>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimetableReplaced {
    pub entry_ids: Vec<Uuid>,
}

pub async fn replace_timetable(
    faculty: CurrentFaculty,
    Path(class_id): Path<Uuid>,
    Extension(state): Extension<AppState>,
    Json(update): Json<TimetableUpdate>,
) -> Payload<TimetableReplaced> {
    let mut tx = state.store.begin().await?;
    owned_class(&mut *tx, class_id, &faculty).await?;
    let entry_ids = timetable::create_or_update_class_timetable(
        &mut *tx,
        class_id,
        update.entries,
        Utc::now(),
    )
    .await?;
    tx.commit().await?;
    proceeds(TimetableReplaced { entry_ids })
}

#[derive(Debug, Clone, Serialize)]
pub struct Timetable {
    pub entries: Vec<TimetableEntry>,
}

pub async fn class_timetable(
    Path(class_id): Path<Uuid>,
    Extension(state): Extension<AppState>,
) -> Payload<Timetable> {
    let mut tx = state.store.begin().await?;
    let entries = timetable::get_class_timetable(&mut *tx, class_id).await?;
    proceeds(Timetable { entries })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimetableEntryDeleted {
    pub timetable_id: Uuid,
}

pub async fn delete_timetable_entry(
    faculty: CurrentFaculty,
    Path(timetable_id): Path<Uuid>,
    Extension(state): Extension<AppState>,
) -> Payload<TimetableEntryDeleted> {
    let mut tx = state.store.begin().await?;
    if let Some(entry) = tx.get_timetable_entry(timetable_id).await? {
        owned_class(&mut *tx, entry.class_id, &faculty).await?;
    }
    let timetable_id =
        timetable::delete_timetable_entry(&mut *tx, timetable_id, Utc::now()).await?;
    tx.commit().await?;
    proceeds(TimetableEntryDeleted { timetable_id })
}

#[derive(Debug, Clone, Serialize)]
pub struct StudentResponse {
    pub student: Option<Student>,
}

pub async fn create_or_find_student(
    Extension(state): Extension<AppState>,
    Json(new): Json<NewStudent>,
) -> Payload<StudentResponse> {
    let mut tx = state.store.begin().await?;
    let student = student::create_or_find_student(&mut *tx, new, Utc::now()).await?;
    tx.commit().await?;
    proceeds(StudentResponse {
        student: Some(student),
    })
}

#[derive(Debug, Clone, Deserialize)]
pub struct Credentials {
    pub prn: String,
    pub email: String,
}

pub async fn find_student(
    Extension(state): Extension<AppState>,
    Json(credentials): Json<Credentials>,
) -> Payload<StudentResponse> {
    let mut tx = state.store.begin().await?;
    let student =
        student::find_student_by_credentials(&mut *tx, &credentials.prn, &credentials.email)
            .await?;
    proceeds(StudentResponse { student })
}

#[derive(Debug, Clone, Serialize)]
pub struct StudentClasses {
    pub classes: Vec<StudentClass>,
}

pub async fn student_classes(
    Path(student_id): Path<Uuid>,
    Extension(state): Extension<AppState>,
) -> Payload<StudentClasses> {
    let mut tx = state.store.begin().await?;
    let classes = enrollment::get_student_classes(&mut *tx, student_id).await?;
    proceeds(StudentClasses { classes })
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassFilter {
    pub class_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AttendanceList {
    pub attendance: Vec<AttendanceHistory>,
}

pub async fn student_attendance(
    Path(student_id): Path<Uuid>,
    Query(filter): Query<ClassFilter>,
    Extension(state): Extension<AppState>,
) -> Payload<AttendanceList> {
    let mut tx = state.store.begin().await?;
    let attendance =
        attendance::get_student_attendance(&mut *tx, student_id, filter.class_id).await?;
    proceeds(AttendanceList { attendance })
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSession {
    pub class_id: Uuid,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStarted {
    pub session: AttendanceSession,
}

pub async fn start_session(
    faculty: CurrentFaculty,
    Extension(state): Extension<AppState>,
    Json(start): Json<StartSession>,
) -> Payload<SessionStarted> {
    let mut tx = state.store.begin().await?;
    let session =
        attendance::start_attendance_session(
            &mut *tx,
            start.class_id,
            faculty.0.id,
            Utc::now(),
            state.campus_offset,
        )
        .await?;
    tx.commit().await?;
    proceeds(SessionStarted { session })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionClosed {
    pub session_id: Uuid,
}

pub async fn close_session(
    faculty: CurrentFaculty,
    Path(session_id): Path<Uuid>,
    Extension(state): Extension<AppState>,
) -> Payload<SessionClosed> {
    let mut tx = state.store.begin().await?;
    let session_id =
        attendance::close_attendance_session(&mut *tx, session_id, faculty.0.id).await?;
    tx.commit().await?;
    proceeds(SessionClosed { session_id })
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionRecords {
    pub records: Vec<AttendanceRecord>,
}

pub async fn session_records(
    faculty: CurrentFaculty,
    Path(session_id): Path<Uuid>,
    Extension(state): Extension<AppState>,
) -> Payload<SessionRecords> {
    let mut tx = state.store.begin().await?;
    let records = attendance::get_session_attendance(&mut *tx, session_id, faculty.0.id).await?;
    proceeds(SessionRecords { records })
}

fn client_info(headers: &HeaderMap, peer: Option<SocketAddr>) -> ClientInfo {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(|ip| ip.trim().to_string())
        .filter(|ip| !ip.is_empty());
    ClientInfo {
        ip_address: forwarded.or_else(|| peer.map(|addr| addr.ip().to_string())),
        user_agent: headers
            .get(USER_AGENT)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordResponse {
    pub record: AttendanceRecord,
}

pub async fn mark_attendance(
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Extension(state): Extension<AppState>,
    Json(mark): Json<MarkAttendance>,
) -> Payload<RecordResponse> {
    let client = client_info(&headers, peer.map(|ConnectInfo(addr)| addr));
    let mut tx = state.store.begin().await?;
    let record = attendance::mark_attendance(&mut *tx, mark, client, Utc::now()).await?;
    tx.commit().await?;
    proceeds(RecordResponse { record })
}

#[derive(Debug, Clone, Deserialize)]
pub struct EditRecord {
    pub status: AttendanceStatus,
}

pub async fn edit_record(
    faculty: CurrentFaculty,
    Path(record_id): Path<Uuid>,
    Extension(state): Extension<AppState>,
    Json(edit): Json<EditRecord>,
) -> Payload<RecordResponse> {
    let mut tx = state.store.begin().await?;
    let record = attendance::edit_attendance_record(
        &mut *tx,
        record_id,
        edit.status,
        faculty.0.id,
        Utc::now(),
    )
    .await?;
    tx.commit().await?;
    proceeds(RecordResponse { record })
}

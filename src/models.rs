use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Faculty {
    pub id: Uuid,
    /// User id issued by the identity provider.
    pub external_user_id: String,
    pub email: String,
    pub name: String,
    pub department: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Class {
    pub id: Uuid,
    pub faculty_id: Uuid,
    pub name: String,
    pub code: String,
    pub description: Option<String>,
    pub max_capacity: i32,
    pub current_enrollment: i32,
    pub semester: String,
    pub year: i32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Class {
    pub fn is_full(&self) -> bool {
        self.current_enrollment >= self.max_capacity
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Student {
    pub id: Uuid,
    pub email: String,
    pub name: String,
    pub prn: String,
    pub year: i32,
    pub department: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Enrollment {
    pub id: Uuid,
    pub class_id: Uuid,
    pub student_id: Uuid,
    pub enrolled_at: DateTime<Utc>,
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct TimetableEntry {
    pub id: Uuid,
    pub class_id: Uuid,
    /// 0 is Sunday, 6 is Saturday.
    pub day_of_week: i32,
    pub start_time: String,
    pub end_time: String,
    pub room: Option<String>,
    pub semester: String,
    pub year: i32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceSession {
    pub id: Uuid,
    pub class_id: Uuid,
    pub faculty_id: Uuid,
    pub lecture_date: NaiveDate,
    pub start_time: String,
    pub end_time: String,
    pub unique_code: String,
    pub lecture_number: i32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "attendance_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum AttendanceStatus {
    Present,
    Absent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceRecord {
    pub id: Uuid,
    pub session_id: Uuid,
    pub student_id: Uuid,
    pub class_id: Uuid,
    pub status: AttendanceStatus,
    pub marked_at: DateTime<Utc>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub is_edited: bool,
    pub edited_at: Option<DateTime<Utc>>,
    pub edited_by: Option<Uuid>,
}

/// Cookie-backed session created after the identity provider signs a user in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct LoginSession {
    pub ssid: String,
    pub user_id: String,
    pub email: String,
    pub name: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FacultySummary {
    pub name: String,
    pub email: String,
    pub department: Option<String>,
}

impl From<&Faculty> for FacultySummary {
    fn from(faculty: &Faculty) -> Self {
        Self {
            name: faculty.name.clone(),
            email: faculty.email.clone(),
            department: faculty.department.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassDetails {
    #[serde(flatten)]
    pub class: Class,
    pub faculty: Option<FacultySummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentClass {
    pub class: Class,
    pub enrolled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledEntry {
    #[serde(flatten)]
    pub entry: TimetableEntry,
    pub class: Class,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceHistory {
    pub attendance: AttendanceRecord,
    pub session: AttendanceSession,
    pub class: Class,
}

use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::err::Error;
use crate::models::Student;
use crate::store::Transaction;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewStudent {
    pub email: String,
    pub name: String,
    pub prn: String,
    pub year: i32,
    pub department: String,
}

/// The student registered under `prn`, only if the stored email is exactly `email`.
pub async fn find_student_by_credentials(
    tx: &mut dyn Transaction,
    prn: &str,
    email: &str,
) -> Result<Option<Student>, Error> {
    Ok(tx
        .find_student_by_prn(prn)
        .await?
        .filter(|student| student.email == email))
}

/// Upsert by PRN. An existing student gets a new email/name when either changed; the
/// year and department of an existing record are kept.
pub async fn create_or_find_student(
    tx: &mut dyn Transaction,
    new: NewStudent,
    now: DateTime<Utc>,
) -> Result<Student, Error> {
    if new.prn.trim().is_empty() {
        return Err(Error::invalid("`prn` parameter was empty"));
    }

    if let Some(mut existing) = tx.find_student_by_prn(&new.prn).await? {
        if existing.email != new.email || existing.name != new.name {
            tx.update_student_identity(existing.id, &new.email, &new.name, now)
                .await?;
            log::info!("Updated contact details of student {}", existing.prn);
            existing.email = new.email;
            existing.name = new.name;
            existing.updated_at = now;
        }
        return Ok(existing);
    }

    let student = Student {
        id: Uuid::new_v4(),
        email: new.email,
        name: new.name,
        prn: new.prn,
        year: new.year,
        department: new.department,
        is_active: true,
        created_at: now,
        updated_at: now,
    };
    tx.insert_student(&student).await?;
    log::info!("Registered student {} ({})", student.prn, student.id);
    Ok(student)
}

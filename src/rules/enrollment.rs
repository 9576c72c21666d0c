use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::err::Error;
use crate::models::{Enrollment, StudentClass};
use crate::rules::student::{create_or_find_student, NewStudent};
use crate::store::Transaction;

/// The active enrollment of a student in a class, if any.
pub async fn check_enrollment(
    tx: &mut dyn Transaction,
    class_id: Uuid,
    student_id: Uuid,
) -> Result<Option<Enrollment>, Error> {
    Ok(tx
        .find_enrollment(class_id, student_id)
        .await?
        .filter(|enrollment| enrollment.is_active))
}

/// Enrolls a student, reactivating an earlier inactive enrollment of the same pair.
///
/// Reactivation leaves `current_enrollment` untouched. A fresh enrollment is inserted and
/// counted only while the class is below capacity; both writes share `tx`.
pub async fn enroll_student_in_class(
    tx: &mut dyn Transaction,
    class_id: Uuid,
    student_id: Uuid,
    now: DateTime<Utc>,
) -> Result<Uuid, Error> {
    if let Some(existing) = tx.find_enrollment(class_id, student_id).await? {
        if existing.is_active {
            log::warn!(
                "Student {} is already enrolled in class {}",
                student_id,
                class_id
            );
            return Err(Error::duplicate_enrollment());
        }
        tx.set_enrollment_active(existing.id, true).await?;
        log::info!(
            "Reactivated enrollment {} of student {} in class {}",
            existing.id,
            student_id,
            class_id
        );
        return Ok(existing.id);
    }

    let class = tx
        .get_class(class_id)
        .await?
        .ok_or_else(|| Error::not_found("Class not found"))?;

    if class.is_full() {
        log::warn!(
            "Class {} is full ({}/{})",
            class.code,
            class.current_enrollment,
            class.max_capacity
        );
        return Err(Error::capacity_exceeded());
    }

    let enrollment = Enrollment {
        id: Uuid::new_v4(),
        class_id,
        student_id,
        enrolled_at: now,
        is_active: true,
    };
    tx.insert_enrollment(&enrollment).await?;

    if !tx.increment_enrollment(class_id, now).await? {
        return Err(Error::capacity_exceeded());
    }

    log::info!(
        "Enrolled student {} in class {} ({})",
        student_id,
        class.code,
        enrollment.id
    );
    Ok(enrollment.id)
}

/// Active enrollments of a student joined with their classes. Enrollments in classes that
/// are gone or inactive are skipped.
pub async fn get_student_classes(
    tx: &mut dyn Transaction,
    student_id: Uuid,
) -> Result<Vec<StudentClass>, Error> {
    let enrollments = tx.active_enrollments_by_student(student_id).await?;
    let mut classes = Vec::with_capacity(enrollments.len());
    for enrollment in enrollments {
        match tx.get_class(enrollment.class_id).await? {
            Some(class) if class.is_active => classes.push(StudentClass {
                class,
                enrolled_at: enrollment.enrolled_at,
            }),
            _ => {}
        }
    }
    Ok(classes)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassRegistration {
    pub class_code: String,
    #[serde(flatten)]
    pub student: NewStudent,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Registered {
    pub student_id: Uuid,
    pub class_id: Uuid,
    pub enrollment_id: Uuid,
}

/// Student-facing join flow: upsert the student by PRN, resolve the class by its code and
/// enroll.
pub async fn register_for_class(
    tx: &mut dyn Transaction,
    registration: ClassRegistration,
    now: DateTime<Utc>,
) -> Result<Registered, Error> {
    let code = registration.class_code.trim().to_uppercase();
    let class = tx
        .find_active_class_by_code(&code)
        .await?
        .ok_or_else(|| Error::not_found(format!("No active class with code `{}`", code)))?;
    let student = create_or_find_student(tx, registration.student, now).await?;
    let enrollment_id = enroll_student_in_class(tx, class.id, student.id, now).await?;
    Ok(Registered {
        student_id: student.id,
        class_id: class.id,
        enrollment_id,
    })
}

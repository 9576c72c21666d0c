use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::err::Error;
use crate::models::{Class, ClassDetails, FacultySummary};
use crate::store::Transaction;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewClass {
    pub name: String,
    pub code: String,
    pub description: Option<String>,
    pub max_capacity: i32,
    pub semester: String,
    pub year: i32,
}

impl NewClass {
    /// Trims the text fields, upper-cases the code and drops an empty description.
    fn normalized(self) -> Result<NewClass, Error> {
        let name = self.name.trim().to_string();
        let code = self.code.trim().to_uppercase();
        if name.is_empty() {
            return Err(Error::invalid("Class name is required"));
        }
        if code.is_empty() {
            return Err(Error::invalid("Class code is required"));
        }
        if self.max_capacity < 1 {
            return Err(Error::invalid("Maximum capacity must be at least 1"));
        }
        Ok(NewClass {
            name,
            code,
            description: self
                .description
                .map(|d| d.trim().to_string())
                .filter(|d| !d.is_empty()),
            max_capacity: self.max_capacity,
            semester: self.semester,
            year: self.year,
        })
    }
}

/// Creates an active class owned by `faculty_id` with an empty roster.
///
/// The code only has to be unique among active classes; a retired class's code can be
/// reused.
pub async fn create_class(
    tx: &mut dyn Transaction,
    faculty_id: Uuid,
    new: NewClass,
    now: DateTime<Utc>,
) -> Result<Uuid, Error> {
    let new = new.normalized()?;

    if tx.find_active_class_by_code(&new.code).await?.is_some() {
        log::warn!("Class code {} is already taken", new.code);
        return Err(Error::duplicate_code());
    }

    if tx.get_faculty(faculty_id).await?.is_none() {
        return Err(Error::not_found("Faculty member not found"));
    }

    let class = Class {
        id: Uuid::new_v4(),
        faculty_id,
        name: new.name,
        code: new.code,
        description: new.description,
        max_capacity: new.max_capacity,
        current_enrollment: 0,
        semester: new.semester,
        year: new.year,
        is_active: true,
        created_at: now,
        updated_at: now,
    };
    tx.insert_class(&class).await?;

    log::info!("Created class {} ({}) for faculty {}", class.code, class.id, faculty_id);
    Ok(class.id)
}

/// The class together with its faculty's contact details; `None` if the class is unknown.
pub async fn get_class_details(
    tx: &mut dyn Transaction,
    class_id: Uuid,
) -> Result<Option<ClassDetails>, Error> {
    let class = match tx.get_class(class_id).await? {
        Some(class) => class,
        None => return Ok(None),
    };
    let faculty = tx
        .get_faculty(class.faculty_id)
        .await?
        .as_ref()
        .map(FacultySummary::from);
    Ok(Some(ClassDetails { class, faculty }))
}

pub async fn get_faculty_classes(
    tx: &mut dyn Transaction,
    faculty_id: Uuid,
) -> Result<Vec<Class>, Error> {
    tx.active_classes_by_faculty(faculty_id).await
}

pub async fn find_class_by_code(
    tx: &mut dyn Transaction,
    code: &str,
) -> Result<Option<Class>, Error> {
    tx.find_active_class_by_code(&code.trim().to_uppercase())
        .await
}

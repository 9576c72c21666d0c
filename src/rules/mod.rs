//! Business rules over the record store. Every operation takes the open transaction it
//! runs in; the caller decides whether to commit.

pub mod attendance;
pub mod class;
pub mod enrollment;
pub mod student;
pub mod timetable;

#[cfg(test)]
pub(crate) mod fixtures {
    use chrono::{DateTime, TimeZone, Utc};
    use uuid::Uuid;

    use crate::models::Faculty;
    use crate::rules::class::{create_class, NewClass};
    use crate::rules::student::{create_or_find_student, NewStudent};
    use crate::store::Transaction;

    pub fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 9, 8, h, m, s).unwrap()
    }

    pub async fn faculty(tx: &mut dyn Transaction) -> Faculty {
        let now = at(8, 0, 0);
        let faculty = Faculty {
            id: Uuid::new_v4(),
            external_user_id: format!("user_{}", Uuid::new_v4().simple()),
            email: "turing@uni.edu".to_string(),
            name: "Alan Turing".to_string(),
            department: Some("Computer Science".to_string()),
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        tx.insert_faculty(&faculty).await.unwrap();
        faculty
    }

    pub fn new_class(code: &str, max_capacity: i32) -> NewClass {
        NewClass {
            name: format!("Course {}", code),
            code: code.to_string(),
            description: None,
            max_capacity,
            semester: "Fall 2025".to_string(),
            year: 2025,
        }
    }

    pub async fn class(tx: &mut dyn Transaction, faculty_id: Uuid, code: &str, cap: i32) -> Uuid {
        create_class(tx, faculty_id, new_class(code, cap), at(8, 0, 0))
            .await
            .unwrap()
    }

    pub async fn student(tx: &mut dyn Transaction, prn: &str) -> Uuid {
        let new = NewStudent {
            email: format!("{}@students.uni.edu", prn),
            name: format!("Student {}", prn),
            prn: prn.to_string(),
            year: 2,
            department: "Computer Science".to_string(),
        };
        create_or_find_student(tx, new, at(8, 0, 0)).await.unwrap().id
    }
}

use chrono::{DateTime, NaiveTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::err::Error;
use crate::models::{ScheduledEntry, TimetableEntry};
use crate::store::Transaction;

/// One submitted weekly slot.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Slot {
    pub day_of_week: i32,
    pub start_time: String,
    pub end_time: String,
    pub room: Option<String>,
}

fn parse_clock(value: &str) -> Option<NaiveTime> {
    if value.len() != 5 {
        return None;
    }
    NaiveTime::parse_from_str(value, "%H:%M").ok()
}

fn check_slot(position: usize, slot: &Slot) -> Result<(), Error> {
    let entry = position + 1;
    if !(0..=6).contains(&slot.day_of_week) {
        return Err(Error::invalid(format!(
            "Timetable entry {}: day of week must be between 0 and 6",
            entry
        )));
    }
    let (start, end) = match (parse_clock(&slot.start_time), parse_clock(&slot.end_time)) {
        (Some(start), Some(end)) => (start, end),
        _ => {
            return Err(Error::invalid(format!(
                "Timetable entry {}: times must use the HH:MM format",
                entry
            )))
        }
    };
    if start >= end {
        return Err(Error::invalid(format!(
            "Timetable entry {}: Start time must be before end time",
            entry
        )));
    }
    Ok(())
}

/// Replaces the weekly timetable of a class.
///
/// Every existing entry of the class is deactivated, then the slots are inserted in the
/// given order. A slot whose (day, start time) is held by any active entry, including one
/// inserted earlier in this call, fails the whole call with `ScheduleConflict`; the caller
/// must not commit `tx` in that case.
pub async fn create_or_update_class_timetable(
    tx: &mut dyn Transaction,
    class_id: Uuid,
    slots: Vec<Slot>,
    now: DateTime<Utc>,
) -> Result<Vec<Uuid>, Error> {
    let class = tx
        .get_class(class_id)
        .await?
        .ok_or_else(|| Error::not_found("Class not found"))?;

    for (position, slot) in slots.iter().enumerate() {
        check_slot(position, slot)?;
    }

    let retired = tx.deactivate_class_timetable(class_id, now).await?;
    log::debug!("Deactivated {} timetable entries of class {}", retired, class.code);

    let mut created = Vec::with_capacity(slots.len());
    for slot in slots {
        if let Some(taken) = tx.find_active_slot(slot.day_of_week, &slot.start_time).await? {
            log::warn!(
                "Slot {} {} requested by class {} is held by class {}",
                slot.day_of_week,
                slot.start_time,
                class.code,
                taken.class_id
            );
            return Err(Error::schedule_conflict(slot.day_of_week, &slot.start_time));
        }

        let entry = TimetableEntry {
            id: Uuid::new_v4(),
            class_id,
            day_of_week: slot.day_of_week,
            start_time: slot.start_time,
            end_time: slot.end_time,
            room: slot
                .room
                .map(|room| room.trim().to_string())
                .filter(|room| !room.is_empty()),
            semester: class.semester.clone(),
            year: class.year,
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        tx.insert_timetable_entry(&entry).await?;
        created.push(entry.id);
    }

    log::info!(
        "Replaced timetable of class {} with {} entries",
        class.code,
        created.len()
    );
    Ok(created)
}

/// Soft-deletes a single timetable entry.
pub async fn delete_timetable_entry(
    tx: &mut dyn Transaction,
    timetable_id: Uuid,
    now: DateTime<Utc>,
) -> Result<Uuid, Error> {
    if tx.get_timetable_entry(timetable_id).await?.is_none() {
        return Err(Error::not_found("Timetable entry not found"));
    }
    tx.deactivate_timetable_entry(timetable_id, now).await?;
    log::info!("Deactivated timetable entry {}", timetable_id);
    Ok(timetable_id)
}

pub async fn get_class_timetable(
    tx: &mut dyn Transaction,
    class_id: Uuid,
) -> Result<Vec<TimetableEntry>, Error> {
    tx.active_timetable_by_class(class_id).await
}

/// Weekly schedule of a faculty member across their active classes, by day then time.
pub async fn get_faculty_timetable(
    tx: &mut dyn Transaction,
    faculty_id: Uuid,
) -> Result<Vec<ScheduledEntry>, Error> {
    let classes = tx.active_classes_by_faculty(faculty_id).await?;
    let mut schedule = Vec::new();
    for class in classes {
        for entry in tx.active_timetable_by_class(class.id).await? {
            schedule.push(ScheduledEntry {
                entry,
                class: class.clone(),
            });
        }
    }
    schedule.sort_by(|a, b| {
        a.entry
            .day_of_week
            .cmp(&b.entry.day_of_week)
            .then_with(|| a.entry.start_time.cmp(&b.entry.start_time))
    });
    Ok(schedule)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::fixtures::{self, at};
    use crate::store::{MemoryStore, RecordStore};

    fn slot(day: i32, start: &str, end: &str) -> Slot {
        Slot {
            day_of_week: day,
            start_time: start.to_string(),
            end_time: end.to_string(),
            room: None,
        }
    }

    #[tokio::test]
    async fn replacing_deactivates_previous_entries() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let faculty = fixtures::faculty(&mut *tx).await;
        let class_id = fixtures::class(&mut *tx, faculty.id, "CS301", 30).await;

        let old = create_or_update_class_timetable(
            &mut *tx,
            class_id,
            vec![slot(1, "09:00", "10:30"), slot(3, "09:00", "10:30")],
            at(8, 0, 0),
        )
        .await
        .unwrap();
        assert_eq!(old.len(), 2);

        let new = create_or_update_class_timetable(
            &mut *tx,
            class_id,
            vec![slot(1, "09:00", "10:30")],
            at(9, 0, 0),
        )
        .await
        .unwrap();

        let active = get_class_timetable(&mut *tx, class_id).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, new[0]);
        assert_eq!(active[0].semester, "Fall 2025");
        assert_eq!(active[0].year, 2025);
        for id in old {
            assert!(!tx.get_timetable_entry(id).await.unwrap().unwrap().is_active);
        }
    }

    #[tokio::test]
    async fn conflicting_slot_fails_and_rolls_back() {
        let store = MemoryStore::new();
        let (a, b) = {
            let mut tx = store.begin().await.unwrap();
            let faculty = fixtures::faculty(&mut *tx).await;
            let a = fixtures::class(&mut *tx, faculty.id, "A100", 30).await;
            let b = fixtures::class(&mut *tx, faculty.id, "B200", 30).await;
            create_or_update_class_timetable(
                &mut *tx,
                a,
                vec![slot(2, "11:00", "12:00")],
                at(8, 0, 0),
            )
            .await
            .unwrap();
            create_or_update_class_timetable(
                &mut *tx,
                b,
                vec![slot(4, "14:00", "15:00")],
                at(8, 0, 0),
            )
            .await
            .unwrap();
            tx.commit().await.unwrap();
            (a, b)
        };

        let mut tx = store.begin().await.unwrap();
        let err = create_or_update_class_timetable(
            &mut *tx,
            b,
            vec![slot(5, "08:00", "09:00"), slot(2, "11:00", "12:30")],
            at(9, 0, 0),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::ScheduleConflict { .. }));
        assert!(err.to_string().contains("11:00"));
        // inside the failed transaction the old entries are already retired
        assert!(get_class_timetable(&mut *tx, b)
            .await
            .unwrap()
            .iter()
            .all(|e| e.class_id == b && e.day_of_week == 5));
        drop(tx);

        let mut tx = store.begin().await.unwrap();
        let kept = get_class_timetable(&mut *tx, b).await.unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].day_of_week, 4);
        assert_eq!(get_class_timetable(&mut *tx, a).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn same_slot_twice_in_one_batch_conflicts() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let faculty = fixtures::faculty(&mut *tx).await;
        let class_id = fixtures::class(&mut *tx, faculty.id, "CS301", 30).await;

        let err = create_or_update_class_timetable(
            &mut *tx,
            class_id,
            vec![slot(1, "09:00", "10:00"), slot(1, "09:00", "11:00")],
            at(8, 0, 0),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::ScheduleConflict { .. }));
    }

    #[tokio::test]
    async fn class_can_keep_its_own_slot() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let faculty = fixtures::faculty(&mut *tx).await;
        let class_id = fixtures::class(&mut *tx, faculty.id, "CS301", 30).await;
        let slots = vec![slot(1, "09:00", "10:00")];

        create_or_update_class_timetable(&mut *tx, class_id, slots.clone(), at(8, 0, 0))
            .await
            .unwrap();
        create_or_update_class_timetable(&mut *tx, class_id, slots, at(9, 0, 0))
            .await
            .unwrap();
        assert_eq!(get_class_timetable(&mut *tx, class_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn invalid_slots_are_rejected_before_any_write() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let faculty = fixtures::faculty(&mut *tx).await;
        let class_id = fixtures::class(&mut *tx, faculty.id, "CS301", 30).await;
        create_or_update_class_timetable(
            &mut *tx,
            class_id,
            vec![slot(1, "09:00", "10:00")],
            at(8, 0, 0),
        )
        .await
        .unwrap();

        for bad in [
            slot(7, "09:00", "10:00"),
            slot(1, "9:00", "10:00"),
            slot(1, "10:00", "09:00"),
            slot(1, "25:00", "26:00"),
        ] {
            let err = create_or_update_class_timetable(&mut *tx, class_id, vec![bad], at(9, 0, 0))
                .await
                .unwrap_err();
            assert!(matches!(err, Error::InvalidPayload { .. }));
        }
        assert_eq!(get_class_timetable(&mut *tx, class_id).await.unwrap().len(), 1);

        let err = create_or_update_class_timetable(&mut *tx, Uuid::new_v4(), vec![], at(9, 0, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn delete_is_soft_and_checks_existence() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let faculty = fixtures::faculty(&mut *tx).await;
        let class_id = fixtures::class(&mut *tx, faculty.id, "CS301", 30).await;
        let ids = create_or_update_class_timetable(
            &mut *tx,
            class_id,
            vec![slot(1, "09:00", "10:00")],
            at(8, 0, 0),
        )
        .await
        .unwrap();

        delete_timetable_entry(&mut *tx, ids[0], at(9, 0, 0))
            .await
            .unwrap();
        let entry = tx.get_timetable_entry(ids[0]).await.unwrap().unwrap();
        assert!(!entry.is_active);
        assert_eq!(entry.updated_at, at(9, 0, 0));

        let err = delete_timetable_entry(&mut *tx, Uuid::new_v4(), at(9, 0, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn faculty_timetable_is_sorted_across_classes() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let faculty = fixtures::faculty(&mut *tx).await;
        let a = fixtures::class(&mut *tx, faculty.id, "A100", 30).await;
        let b = fixtures::class(&mut *tx, faculty.id, "B200", 30).await;
        create_or_update_class_timetable(
            &mut *tx,
            a,
            vec![slot(3, "09:00", "10:00"), slot(1, "14:00", "15:00")],
            at(8, 0, 0),
        )
        .await
        .unwrap();
        create_or_update_class_timetable(
            &mut *tx,
            b,
            vec![slot(1, "08:00", "09:00")],
            at(8, 0, 0),
        )
        .await
        .unwrap();

        let schedule = get_faculty_timetable(&mut *tx, faculty.id).await.unwrap();
        let order: Vec<(i32, &str, &str)> = schedule
            .iter()
            .map(|s| (s.entry.day_of_week, s.entry.start_time.as_str(), s.class.code.as_str()))
            .collect();
        assert_eq!(
            order,
            vec![(1, "08:00", "B200"), (1, "14:00", "A100"), (3, "09:00", "A100")]
        );
    }
}

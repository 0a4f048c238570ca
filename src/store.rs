// src/store.rs
//
// In-process store for the schedule facts (courses, trainers, weekly
// assignments, cancellations, holiday weeks, exceptions) and the training
// session ledger. Facts are written by the CRUD handlers only; the
// reconciliation engine reads facts and owns all ledger writes.
//
// The ledger sits behind its own mutex and is handed out as a guard so that
// one reconcile call can read the current state and apply its add/remove
// set under a single lock acquisition. That acquisition is the per-key
// transaction: no other caller can interleave between the read and the
// writes.

use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, info};

use crate::calendar;
use crate::model::{
    CancelledCourse, Course, CourseId, SessionId, SessionKey, SessionStatus, SlotKey, Trainer,
    TrainerId, TrainingSession, WeekNum, Year,
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Trainer not found: {0}")]
    UnknownTrainer(TrainerId),
    #[error("Course not found: {0}")]
    UnknownCourse(CourseId),
    #[error("Training session not found: {0}")]
    UnknownSession(SessionId),
    #[error("Course start time must be before end time")]
    InvalidCourseTimes,
    #[error("Invalid day of week: {0}")]
    InvalidDayName(String),
}

/// Fields of a ledger entry the engine decides; id, status and the
/// modification counter are assigned on insert.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub course_id: Option<CourseId>,
    pub trainer_id: TrainerId,
    pub week_number: WeekNum,
    pub year: Year,
    pub hours: Decimal,
    pub recorded_by: String,
    pub recorded_at: NaiveDateTime,
}

// --- Session Ledger ---

#[derive(Debug, Default)]
pub struct SessionLedger {
    by_id: HashMap<SessionId, TrainingSession>,
    next_id: SessionId,
}

impl SessionLedger {
    /// Trainer ids with a ledger entry for this course instance.
    pub fn trainers_for_slot(&self, slot: SlotKey) -> HashSet<TrainerId> {
        let (course_id, week, year) = slot;
        self.by_id
            .values()
            .filter(|s| {
                s.course_id == Some(course_id) && s.week_number == week && s.year == year
            })
            .map(|s| s.trainer_id)
            .collect()
    }

    pub fn find_by_key(&self, key: SessionKey) -> Option<&TrainingSession> {
        self.by_id.values().find(|s| s.natural_key() == Some(key))
    }

    /// Conflict-safe insert: a row already holding the natural key wins and
    /// the new one is dropped. Returns the stored session id on insert,
    /// None when ignored.
    pub fn insert_ignore(&mut self, new: NewSession) -> Option<SessionId> {
        if let Some(course_id) = new.course_id {
            let key = (course_id, new.week_number, new.year, new.trainer_id);
            if self.find_by_key(key).is_some() {
                debug!(
                    "Duplicate session insert ignored for course {} week {}/{} trainer {}",
                    course_id, new.week_number, new.year, new.trainer_id
                );
                return None;
            }
        }
        Some(self.insert_row(new))
    }

    /// Unconditional insert for ad-hoc activities (no natural key to clash).
    pub fn insert_adhoc(&mut self, new: NewSession) -> SessionId {
        self.insert_row(new)
    }

    fn insert_row(&mut self, new: NewSession) -> SessionId {
        self.next_id += 1;
        let id = self.next_id;
        self.by_id.insert(
            id,
            TrainingSession {
                id,
                course_id: new.course_id,
                trainer_id: new.trainer_id,
                week_number: new.week_number,
                year: new.year,
                hours: new.hours,
                status: SessionStatus::Recorded,
                recorded_by: new.recorded_by,
                modification_count: 0,
                recorded_at: new.recorded_at,
            },
        );
        id
    }

    /// Hard delete by natural key. Removed hours must not linger as soft
    /// flags, or they would double-count in reports.
    pub fn remove_by_key(&mut self, key: SessionKey) -> bool {
        if let Some(id) = self.find_by_key(key).map(|s| s.id) {
            self.by_id.remove(&id);
            true
        } else {
            false
        }
    }

    pub fn remove_by_id(&mut self, id: SessionId) -> Result<TrainingSession, StoreError> {
        self.by_id.remove(&id).ok_or(StoreError::UnknownSession(id))
    }

    /// Administrative hour override. Marks the row corrected and bumps the
    /// modification counter.
    pub fn correct_hours(
        &mut self,
        id: SessionId,
        hours: Decimal,
        corrected_by: &str,
    ) -> Result<TrainingSession, StoreError> {
        let session = self
            .by_id
            .get_mut(&id)
            .ok_or(StoreError::UnknownSession(id))?;
        session.hours = hours.round_dp(2);
        session.status = SessionStatus::Corrected;
        session.modification_count += 1;
        session.recorded_by = corrected_by.to_string();
        Ok(session.clone())
    }

    pub fn get(&self, id: SessionId) -> Option<&TrainingSession> {
        self.by_id.get(&id)
    }

    pub fn all(&self) -> Vec<TrainingSession> {
        let mut sessions: Vec<_> = self.by_id.values().cloned().collect();
        sessions.sort_by_key(|s| s.id);
        sessions
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }
}

// --- Schedule Store ---

#[derive(Debug, Default)]
pub struct ScheduleStore {
    trainers: Mutex<HashMap<TrainerId, Trainer>>,
    courses: Mutex<HashMap<CourseId, Course>>,
    assignments: Mutex<HashMap<SlotKey, Vec<TrainerId>>>,
    cancellations: Mutex<HashMap<SlotKey, String>>,
    holiday_weeks: Mutex<HashSet<(WeekNum, Year)>>,
    exceptions: Mutex<HashSet<SlotKey>>,
    sessions: Mutex<SessionLedger>,
    next_id: Mutex<i64>,
}

impl ScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> i64 {
        let mut id = self.next_id.lock().unwrap();
        *id += 1;
        *id
    }

    // --- Trainers ---

    pub fn create_trainer(
        &self,
        first_name: &str,
        last_name: &str,
        email: Option<String>,
        phone: Option<String>,
    ) -> Trainer {
        let trainer = Trainer {
            id: self.next_id(),
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
            email,
            phone,
            active: true,
        };
        info!("Created trainer {} ({} {})", trainer.id, first_name, last_name);
        self.trainers
            .lock()
            .unwrap()
            .insert(trainer.id, trainer.clone());
        trainer
    }

    pub fn update_trainer(&self, trainer: Trainer) -> Result<Trainer, StoreError> {
        let mut trainers = self.trainers.lock().unwrap();
        if !trainers.contains_key(&trainer.id) {
            return Err(StoreError::UnknownTrainer(trainer.id));
        }
        trainers.insert(trainer.id, trainer.clone());
        Ok(trainer)
    }

    pub fn get_trainer(&self, id: TrainerId) -> Option<Trainer> {
        self.trainers.lock().unwrap().get(&id).cloned()
    }

    pub fn list_trainers(&self) -> Vec<Trainer> {
        let mut trainers: Vec<_> = self.trainers.lock().unwrap().values().cloned().collect();
        trainers.sort_by_key(|t| t.id);
        trainers
    }

    // --- Courses ---

    pub fn create_course(&self, mut course: Course) -> Result<Course, StoreError> {
        Self::validate_course(&course)?;
        course.id = self.next_id();
        course.active = true;
        info!("Created course {} '{}'", course.id, course.name);
        self.courses
            .lock()
            .unwrap()
            .insert(course.id, course.clone());
        Ok(course)
    }

    pub fn update_course(&self, course: Course) -> Result<Course, StoreError> {
        Self::validate_course(&course)?;
        let mut courses = self.courses.lock().unwrap();
        if !courses.contains_key(&course.id) {
            return Err(StoreError::UnknownCourse(course.id));
        }
        courses.insert(course.id, course.clone());
        Ok(course)
    }

    fn validate_course(course: &Course) -> Result<(), StoreError> {
        calendar::parse_day_name(&course.day_of_week)
            .map_err(|_| StoreError::InvalidDayName(course.day_of_week.clone()))?;
        if let (Some(start), Some(end)) = (course.start_time, course.end_time) {
            if start >= end {
                return Err(StoreError::InvalidCourseTimes);
            }
        }
        Ok(())
    }

    /// Removes the course master record. Assignments and ledger entries
    /// referencing it are left for the engine to clean up as zero-occurrence
    /// slots on the next reconcile or resync.
    pub fn delete_course(&self, id: CourseId) -> Result<Course, StoreError> {
        self.courses
            .lock()
            .unwrap()
            .remove(&id)
            .ok_or(StoreError::UnknownCourse(id))
    }

    pub fn get_course(&self, id: CourseId) -> Option<Course> {
        self.courses.lock().unwrap().get(&id).cloned()
    }

    pub fn list_courses(&self) -> Vec<Course> {
        let mut courses: Vec<_> = self.courses.lock().unwrap().values().cloned().collect();
        courses.sort_by_key(|c| c.id);
        courses
    }

    // --- Weekly assignments ---

    /// Wholesale replace of the trainer list for one course instance, the
    /// way the clients submit it. Unresolvable trainer ids are rejected
    /// here, at the write boundary, never silently dropped later.
    pub fn replace_assignments(
        &self,
        slot: SlotKey,
        trainer_ids: Vec<TrainerId>,
    ) -> Result<(), StoreError> {
        let (course_id, week, year) = slot;
        if !self.courses.lock().unwrap().contains_key(&course_id) {
            return Err(StoreError::UnknownCourse(course_id));
        }
        {
            let trainers = self.trainers.lock().unwrap();
            for id in &trainer_ids {
                if !trainers.contains_key(id) {
                    return Err(StoreError::UnknownTrainer(*id));
                }
            }
        }
        let mut deduped: Vec<TrainerId> = Vec::new();
        for id in trainer_ids {
            if !deduped.contains(&id) {
                deduped.push(id);
            }
        }
        let mut assignments = self.assignments.lock().unwrap();
        if deduped.is_empty() {
            assignments.remove(&slot);
        } else {
            assignments.insert(slot, deduped);
        }
        debug!("Replaced assignments for course {} week {}/{}", course_id, week, year);
        Ok(())
    }

    pub fn assignments_for_slot(&self, slot: SlotKey) -> Vec<TrainerId> {
        self.assignments
            .lock()
            .unwrap()
            .get(&slot)
            .cloned()
            .unwrap_or_default()
    }

    /// Trainer list the planner shows for one course instance: the explicit
    /// weekly assignment when present, else the course's default trainer
    /// set. Inactive courses offer no defaults. The ledger only ever
    /// follows explicit assignments, never this fallback.
    pub fn effective_assignments(&self, slot: SlotKey) -> Vec<TrainerId> {
        let explicit = self.assignments_for_slot(slot);
        if !explicit.is_empty() {
            return explicit;
        }
        match self.get_course(slot.0) {
            Some(course) if course.active => course.default_trainers,
            _ => Vec::new(),
        }
    }

    /// Course ids with at least one assignment in the given week.
    pub fn assigned_courses_in_week(&self, week: WeekNum, year: Year) -> Vec<CourseId> {
        let mut ids: Vec<CourseId> = self
            .assignments
            .lock()
            .unwrap()
            .keys()
            .filter(|(_, w, y)| *w == week && *y == year)
            .map(|(course_id, _, _)| *course_id)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Every (course, week, year, trainer) tuple currently assigned. Input
    /// of the bulk resync walk.
    pub fn all_assignment_tuples(&self) -> Vec<(CourseId, WeekNum, Year, TrainerId)> {
        let mut tuples: Vec<_> = self
            .assignments
            .lock()
            .unwrap()
            .iter()
            .flat_map(|((course_id, week, year), trainer_ids)| {
                trainer_ids
                    .iter()
                    .map(|t| (*course_id, *week, *year, *t))
                    .collect::<Vec<_>>()
            })
            .collect();
        tuples.sort_unstable();
        tuples
    }

    // --- Cancellations ---

    pub fn upsert_cancellation(&self, slot: SlotKey, reason: &str) {
        let reason = if reason.trim().is_empty() {
            "Sonstiges".to_string()
        } else {
            reason.to_string()
        };
        self.cancellations.lock().unwrap().insert(slot, reason);
    }

    pub fn remove_cancellation(&self, slot: SlotKey) -> bool {
        self.cancellations.lock().unwrap().remove(&slot).is_some()
    }

    pub fn is_cancelled(&self, slot: SlotKey) -> bool {
        self.cancellations.lock().unwrap().contains_key(&slot)
    }

    pub fn list_cancellations(&self) -> Vec<CancelledCourse> {
        let mut cancellations: Vec<_> = self
            .cancellations
            .lock()
            .unwrap()
            .iter()
            .map(|((course_id, week, year), reason)| CancelledCourse {
                course_id: *course_id,
                week_number: *week,
                year: *year,
                reason: reason.clone(),
            })
            .collect();
        cancellations.sort_by_key(|c| (c.year, c.week_number, c.course_id));
        cancellations
    }

    // --- Holiday weeks ---

    pub fn add_holiday_week(&self, week: WeekNum, year: Year) -> bool {
        self.holiday_weeks.lock().unwrap().insert((week, year))
    }

    pub fn remove_holiday_week(&self, week: WeekNum, year: Year) -> bool {
        self.holiday_weeks.lock().unwrap().remove(&(week, year))
    }

    pub fn is_holiday_week(&self, week: WeekNum, year: Year) -> bool {
        self.holiday_weeks.lock().unwrap().contains(&(week, year))
    }

    pub fn list_holiday_weeks(&self) -> Vec<(WeekNum, Year)> {
        let mut weeks: Vec<_> = self.holiday_weeks.lock().unwrap().iter().cloned().collect();
        weeks.sort_by_key(|(week, year)| (*year, *week));
        weeks
    }

    // --- Course exceptions (course runs despite a holiday week) ---

    pub fn add_exception(&self, slot: SlotKey) -> bool {
        self.exceptions.lock().unwrap().insert(slot)
    }

    pub fn remove_exception(&self, slot: SlotKey) -> bool {
        self.exceptions.lock().unwrap().remove(&slot)
    }

    pub fn has_exception(&self, slot: SlotKey) -> bool {
        self.exceptions.lock().unwrap().contains(&slot)
    }

    pub fn list_exceptions(&self) -> Vec<SlotKey> {
        let mut slots: Vec<_> = self.exceptions.lock().unwrap().iter().cloned().collect();
        slots.sort_unstable();
        slots
    }

    // --- Ledger access ---

    /// Locks the session ledger for the duration of one reconcile or admin
    /// operation. Holding the guard is what makes the read-then-write of a
    /// single key atomic.
    pub fn ledger(&self) -> MutexGuard<'_, SessionLedger> {
        self.sessions.lock().unwrap()
    }

    // --- Health ---

    pub fn counts(&self) -> StoreCounts {
        // One lock at a time. The engine locks facts before the ledger;
        // holding several fact guards here while taking the ledger would
        // invert that order and can wedge against a running resync.
        let trainers = self.trainers.lock().unwrap().len();
        let courses = self.courses.lock().unwrap().len();
        let assignments = self.assignments.lock().unwrap().len();
        let cancellations = self.cancellations.lock().unwrap().len();
        let holiday_weeks = self.holiday_weeks.lock().unwrap().len();
        let exceptions = self.exceptions.lock().unwrap().len();
        let training_sessions = self.ledger().len();
        StoreCounts {
            trainers,
            courses,
            assignments,
            cancellations,
            holiday_weeks,
            exceptions,
            training_sessions,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct StoreCounts {
    pub trainers: usize,
    pub courses: usize,
    pub assignments: usize,
    pub cancellations: usize,
    pub holiday_weeks: usize,
    pub exceptions: usize,
    pub training_sessions: usize,
}

// --- Test Module ---
#[cfg(test)]
mod store_tests {
    use super::*;

    fn add_course(store: &ScheduleStore, active: bool, default_trainers: Vec<TrainerId>) -> CourseId {
        let mut course = store
            .create_course(Course {
                id: 0,
                name: "Eltern-Kind-Turnen".to_string(),
                day_of_week: "Monday".to_string(),
                start_time: None,
                end_time: None,
                location: None,
                category: None,
                required_trainers: 1,
                active: true,
                default_trainers,
            })
            .unwrap();
        if !active {
            course.active = false;
            store.update_course(course.clone()).unwrap();
        }
        course.id
    }

    #[test]
    fn effective_assignments_prefer_explicit_rows_over_defaults() {
        let store = ScheduleStore::new();
        let default_trainer = store.create_trainer("Anna", "Berger", None, None).id;
        let explicit_trainer = store.create_trainer("Ben", "Schulz", None, None).id;
        let course_id = add_course(&store, true, vec![default_trainer]);
        let slot = (course_id, 10, 2026);

        assert_eq!(store.effective_assignments(slot), vec![default_trainer]);

        store
            .replace_assignments(slot, vec![explicit_trainer])
            .unwrap();
        assert_eq!(store.effective_assignments(slot), vec![explicit_trainer]);

        // Clearing the explicit row falls back to the defaults again.
        store.replace_assignments(slot, vec![]).unwrap();
        assert_eq!(store.effective_assignments(slot), vec![default_trainer]);
    }

    #[test]
    fn inactive_courses_offer_no_default_trainers() {
        let store = ScheduleStore::new();
        let trainer = store.create_trainer("Anna", "Berger", None, None).id;
        let course_id = add_course(&store, false, vec![trainer]);
        assert!(store.effective_assignments((course_id, 10, 2026)).is_empty());
    }
}

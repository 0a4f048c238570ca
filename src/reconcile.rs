// src/reconcile.rs
//
// The reconciliation engine. All facts (assignments, cancellations, holiday
// weeks, exceptions) are edited independently and in any order; this module
// turns them into the authoritative training-session ledger. Every fact
// mutation path funnels into the single `reconcile` operation so there is
// exactly one copy of the add/remove logic, and the bulk resync driver
// re-applies it for training days that crossed into the past without any
// triggering edit.

use chrono::{Local, NaiveDate, NaiveDateTime, NaiveTime};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::calendar::{self, CalendarError};
use crate::model::{CourseId, SlotKey, TrainerId, WeekNum, Year};
use crate::store::{NewSession, ScheduleStore};

/// Actor tag on ledger rows written by a request-triggered reconcile.
pub const RECONCILER_ACTOR: &str = "reconciler";
/// Actor tag on ledger rows written by the bulk resync driver.
pub const SYNC_ACTOR: &str = "auto-sync";

// --- Clock ---

/// Injected time source. "Now" is never read from a hidden global so tests
/// can pin arbitrary dates against the temporal gate.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;

    fn today(&self) -> NaiveDate {
        self.now().date()
    }
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// Settable clock shared between a test and the engine under test.
#[derive(Clone)]
pub struct TestClock {
    current_time: Arc<Mutex<NaiveDateTime>>,
}

impl TestClock {
    pub fn new(datetime_str: &str) -> Self {
        let dt = NaiveDateTime::parse_from_str(datetime_str, "%Y-%m-%d %H:%M:%S")
            .expect("Failed to parse datetime string in TestClock::new");
        Self {
            current_time: Arc::new(Mutex::new(dt)),
        }
    }

    pub fn set_time(&self, datetime_str: &str) {
        *self.current_time.lock().unwrap() =
            NaiveDateTime::parse_from_str(datetime_str, "%Y-%m-%d %H:%M:%S")
                .expect("Failed to parse datetime string in TestClock::set_time");
    }
}

impl Clock for TestClock {
    fn now(&self) -> NaiveDateTime {
        *self.current_time.lock().unwrap()
    }
}

// --- Engine ---

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    #[error(transparent)]
    Calendar(#[from] CalendarError),
}

/// Net ledger change of one reconcile call.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ReconcileOutcome {
    pub added: Vec<TrainerId>,
    pub removed: Vec<TrainerId>,
}

impl ReconcileOutcome {
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ResyncSummary {
    pub synced: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct ReconcileEngine {
    store: Arc<ScheduleStore>,
    clock: Arc<dyn Clock>,
    /// No hours are ever posted for training days before this date,
    /// regardless of day-past status.
    activation_date: NaiveDate,
}

impl ReconcileEngine {
    pub fn new(store: Arc<ScheduleStore>, clock: Arc<dyn Clock>, activation_date: NaiveDate) -> Self {
        Self {
            store,
            clock,
            activation_date,
        }
    }

    /// Whether the course instance actually takes place: not individually
    /// cancelled, and either no club-wide holiday week or explicitly
    /// excepted from it.
    pub fn occurs(&self, slot: SlotKey) -> bool {
        let (_, week, year) = slot;
        !self.store.is_cancelled(slot)
            && (!self.store.is_holiday_week(week, year) || self.store.has_exception(slot))
    }

    /// Trainer ids that should hold ledger entries for the slot: the weekly
    /// assignment, emptied entirely when the course does not occur.
    fn effective_trainers(&self, slot: SlotKey) -> HashSet<TrainerId> {
        if !self.occurs(slot) {
            return HashSet::new();
        }
        self.store.assignments_for_slot(slot).into_iter().collect()
    }

    fn gate_open(&self, training_date: NaiveDate) -> bool {
        training_date <= self.clock.today() && training_date >= self.activation_date
    }

    /// Brings the ledger for one (course, week, year) in line with the
    /// current facts. No-op while the training day is still in the future
    /// or before the activation date; otherwise applies the minimal
    /// add/remove set under a single ledger lock.
    pub fn reconcile(
        &self,
        course_id: CourseId,
        week: WeekNum,
        year: Year,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let slot: SlotKey = (course_id, week, year);

        let Some(course) = self.store.get_course(course_id) else {
            // Course no longer exists: zero occurrence. Any surviving ledger
            // rows for the slot are stale and get removed; the gate cannot
            // apply without a weekday to anchor it.
            return Ok(self.remove_all_for_slot(slot));
        };

        let weekday = calendar::parse_day_name(&course.day_of_week)?;
        let training_date = calendar::date_of_weekday_in_week(weekday, week, year)?;

        if !self.gate_open(training_date) {
            debug!(
                "Gate closed for course {} week {}/{} (training day {}), no ledger mutation",
                course_id, week, year, training_date
            );
            return Ok(ReconcileOutcome::default());
        }

        let effective = self.effective_trainers(slot);

        // Single lock acquisition: the read of the current trainer set and
        // the add/remove writes cannot interleave with another caller on
        // the same key.
        let mut ledger = self.store.ledger();
        let current = ledger.trainers_for_slot(slot);

        let mut to_add: Vec<TrainerId> = effective.difference(&current).copied().collect();
        let mut to_remove: Vec<TrainerId> = current.difference(&effective).copied().collect();
        to_add.sort_unstable();
        to_remove.sort_unstable();

        for trainer_id in &to_remove {
            ledger.remove_by_key((course_id, week, year, *trainer_id));
        }
        for trainer_id in &to_add {
            ledger.insert_ignore(NewSession {
                course_id: Some(course_id),
                trainer_id: *trainer_id,
                week_number: week,
                year,
                hours: course.session_hours(),
                recorded_by: RECONCILER_ACTOR.to_string(),
                recorded_at: self.clock.now(),
            });
        }
        drop(ledger);

        let outcome = ReconcileOutcome {
            added: to_add,
            removed: to_remove,
        };
        if !outcome.is_noop() {
            info!(
                "Reconciled course {} week {}/{}: added {:?}, removed {:?}",
                course_id, week, year, outcome.added, outcome.removed
            );
        }
        Ok(outcome)
    }

    fn remove_all_for_slot(&self, slot: SlotKey) -> ReconcileOutcome {
        let (course_id, week, year) = slot;
        let mut ledger = self.store.ledger();
        let mut removed: Vec<TrainerId> = ledger.trainers_for_slot(slot).into_iter().collect();
        removed.sort_unstable();
        for trainer_id in &removed {
            ledger.remove_by_key((course_id, week, year, *trainer_id));
        }
        if !removed.is_empty() {
            info!(
                "Removed {} stale session(s) for vanished course {} week {}/{}",
                removed.len(),
                course_id,
                week,
                year
            );
        }
        ReconcileOutcome {
            added: Vec::new(),
            removed,
        }
    }

    /// Fan-out for holiday add/remove: reconciles every course assigned in
    /// the week that has no exception. Excepted courses keep running either
    /// way, so their ledger state is untouched by the holiday toggle.
    pub fn reconcile_assigned_week(&self, week: WeekNum, year: Year) -> Vec<(CourseId, ReconcileOutcome)> {
        let mut outcomes = Vec::new();
        for course_id in self.store.assigned_courses_in_week(week, year) {
            if self.store.has_exception((course_id, week, year)) {
                continue;
            }
            match self.reconcile(course_id, week, year) {
                Ok(outcome) => outcomes.push((course_id, outcome)),
                Err(e) => {
                    warn!(
                        "Reconcile failed for course {} week {}/{} during week fan-out: {}",
                        course_id, week, year, e
                    );
                }
            }
        }
        outcomes
    }

    /// Bulk resync: walks every assignment tuple and brings past-due ledger
    /// entries up to date, catching training days that crossed into the
    /// past without any fact edit. Safe to run repeatedly; per-tuple
    /// failures are isolated and counted, never aborting the walk.
    pub fn resync_past_days(&self) -> ResyncSummary {
        let today = self.clock.today();
        let mut summary = ResyncSummary::default();

        for (course_id, week, year, trainer_id) in self.store.all_assignment_tuples() {
            let slot: SlotKey = (course_id, week, year);
            let key = (course_id, week, year, trainer_id);

            let Some(course) = self.store.get_course(course_id) else {
                // Orphaned assignment: course gone, zero occurrence.
                self.store.ledger().remove_by_key(key);
                summary.synced += 1;
                continue;
            };

            let training_date = match calendar::parse_day_name(&course.day_of_week)
                .map_err(ReconcileError::from)
                .and_then(|weekday| {
                    calendar::date_of_weekday_in_week(weekday, week, year)
                        .map_err(ReconcileError::from)
                }) {
                Ok(date) => date,
                Err(e) => {
                    warn!(
                        "Skipping resync for course {} week {}/{} trainer {}: {}",
                        course_id, week, year, trainer_id, e
                    );
                    summary.failed += 1;
                    continue;
                }
            };

            if training_date > today || training_date < self.activation_date {
                summary.skipped += 1;
                continue;
            }

            // Occurrence reads the fact mutexes; settle it before taking the
            // ledger guard so every code path locks facts before the ledger.
            let occurs = self.occurs(slot);
            let mut ledger = self.store.ledger();
            if occurs {
                // Delete-then-insert on purpose: the fresh row carries the
                // actual training date as its recorded timestamp even when
                // an earlier, differently-timed run already wrote one.
                ledger.remove_by_key(key);
                let recorded_at =
                    training_date.and_time(course.start_time.unwrap_or(NaiveTime::MIN));
                ledger.insert_ignore(NewSession {
                    course_id: Some(course_id),
                    trainer_id,
                    week_number: week,
                    year,
                    hours: course.session_hours(),
                    recorded_by: SYNC_ACTOR.to_string(),
                    recorded_at,
                });
            } else {
                ledger.remove_by_key(key);
            }
            drop(ledger);
            summary.synced += 1;
        }

        info!(
            "Resync complete: {} synced, {} skipped (future), {} failed",
            summary.synced, summary.skipped, summary.failed
        );
        summary
    }
}

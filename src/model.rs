// src/model.rs

use chrono::{NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

pub type TrainerId = i64;
pub type CourseId = i64;
pub type SessionId = i64;
pub type WeekNum = u32; // ISO week number (1-53)
pub type Year = i32;

/// Key of one concrete course instance: "this course in this ISO week".
pub type SlotKey = (CourseId, WeekNum, Year);

/// Natural key of a course-based ledger entry. At most one non-deleted
/// entry may exist per key.
pub type SessionKey = (CourseId, WeekNum, Year, TrainerId);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trainer {
    pub id: TrainerId,
    pub first_name: String,
    pub last_name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Course {
    pub id: CourseId,
    pub name: String,
    /// Stored as submitted ("Tuesday" or "Dienstag"); validated at the write
    /// boundary, parsed via `calendar::parse_day_name` wherever a date is
    /// derived from it.
    pub day_of_week: String,
    pub start_time: Option<NaiveTime>,
    pub end_time: Option<NaiveTime>,
    pub location: Option<String>,
    pub category: Option<String>,
    pub required_trainers: u32,
    pub active: bool,
    /// Default trainer set, served by the planner read view when a week has
    /// no explicit assignment (and the course is active). The ledger only
    /// ever follows explicit assignment rows.
    pub default_trainers: Vec<TrainerId>,
}

impl Course {
    /// Worked hours of one session, from the start/end time of day.
    /// Falls back to a single hour when either time is missing.
    pub fn session_hours(&self) -> Decimal {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => {
                let minutes = (end - start).num_minutes();
                (Decimal::from(minutes) / dec!(60)).round_dp(2)
            }
            _ => dec!(1.00),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelledCourse {
    pub course_id: CourseId,
    pub week_number: WeekNum,
    pub year: Year,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Recorded,
    Corrected,
}

/// One ledger row: a trainer's recorded hours for a course instance, or an
/// ad-hoc activity when `course_id` is None.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSession {
    pub id: SessionId,
    pub course_id: Option<CourseId>,
    pub trainer_id: TrainerId,
    pub week_number: WeekNum,
    pub year: Year,
    pub hours: Decimal,
    pub status: SessionStatus,
    pub recorded_by: String,
    pub modification_count: u32,
    pub recorded_at: NaiveDateTime,
}

impl TrainingSession {
    pub fn natural_key(&self) -> Option<SessionKey> {
        self.course_id
            .map(|course_id| (course_id, self.week_number, self.year, self.trainer_id))
    }
}

// --- Test Module ---
#[cfg(test)]
mod model_tests {
    use super::*;
    use chrono::NaiveTime;

    fn course_with_times(start: Option<&str>, end: Option<&str>) -> Course {
        let t = |s: &str| NaiveTime::parse_from_str(s, "%H:%M").unwrap();
        Course {
            id: 1,
            name: "Test".to_string(),
            day_of_week: "Tuesday".to_string(),
            start_time: start.map(t),
            end_time: end.map(t),
            location: None,
            category: None,
            required_trainers: 1,
            active: true,
            default_trainers: vec![],
        }
    }

    #[test]
    fn session_hours_from_start_and_end_time() {
        let course = course_with_times(Some("18:00"), Some("19:30"));
        assert_eq!(course.session_hours(), dec!(1.50));
    }

    #[test]
    fn session_hours_rounds_to_two_decimals() {
        // 50 minutes = 0.8333.. hours
        let course = course_with_times(Some("17:10"), Some("18:00"));
        assert_eq!(course.session_hours(), dec!(0.83));
    }

    #[test]
    fn session_hours_falls_back_to_one_hour_without_times() {
        assert_eq!(course_with_times(None, Some("19:30")).session_hours(), dec!(1.00));
        assert_eq!(course_with_times(Some("18:00"), None).session_hours(), dec!(1.00));
        assert_eq!(course_with_times(None, None).session_hours(), dec!(1.00));
    }
}

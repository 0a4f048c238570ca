// src/calendar.rs
//
// ISO week arithmetic for the weekly course schedule. Every course repeats
// on a fixed weekday, so the only date math the rest of the system needs is
// "which calendar date is weekday X in ISO week W of year Y" and the inverse.

use chrono::{Datelike, Duration, NaiveDate, Weekday};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CalendarError {
    #[error("Invalid ISO week/year combination: week {week} of {year}")]
    InvalidWeek { week: u32, year: i32 },
    #[error("Unknown day of week: '{0}'")]
    UnknownDayName(String),
}

/// Parses a stored day-of-week name. The frontend historically submitted
/// German names, newer clients submit English ones; both are accepted.
pub fn parse_day_name(name: &str) -> Result<Weekday, CalendarError> {
    match name.trim().to_lowercase().as_str() {
        "monday" | "montag" | "mon" | "mo" => Ok(Weekday::Mon),
        "tuesday" | "dienstag" | "tue" | "di" => Ok(Weekday::Tue),
        "wednesday" | "mittwoch" | "wed" | "mi" => Ok(Weekday::Wed),
        "thursday" | "donnerstag" | "thu" | "do" => Ok(Weekday::Thu),
        "friday" | "freitag" | "fri" | "fr" => Ok(Weekday::Fri),
        "saturday" | "samstag" | "sat" | "sa" => Ok(Weekday::Sat),
        "sunday" | "sonntag" | "sun" | "so" => Ok(Weekday::Sun),
        _ => Err(CalendarError::UnknownDayName(name.to_string())),
    }
}

/// Monday of ISO week `week` of `year`, computed via the January-4th anchor:
/// January 4 always falls in ISO week 1, so week 1's Monday is the Monday of
/// the week containing it, and every later week is a 7-day offset from there.
pub fn monday_of_iso_week(week: u32, year: i32) -> Result<NaiveDate, CalendarError> {
    if week < 1 || week > 53 {
        return Err(CalendarError::InvalidWeek { week, year });
    }
    let jan4 = NaiveDate::from_ymd_opt(year, 1, 4)
        .ok_or(CalendarError::InvalidWeek { week, year })?;
    let week1_monday = jan4 - Duration::days(jan4.weekday().num_days_from_monday() as i64);
    let monday = week1_monday + Duration::weeks(week as i64 - 1);
    // Week 53 only exists in long ISO years; reject e.g. 53/2026.
    if monday.iso_week().week() != week || monday.iso_week().year() != year {
        return Err(CalendarError::InvalidWeek { week, year });
    }
    Ok(monday)
}

/// Calendar date of `weekday` within ISO week `week` of `year`.
pub fn date_of_weekday_in_week(
    weekday: Weekday,
    week: u32,
    year: i32,
) -> Result<NaiveDate, CalendarError> {
    let monday = monday_of_iso_week(week, year)?;
    Ok(monday + Duration::days(weekday.num_days_from_monday() as i64))
}

/// (ISO week, ISO year) of a calendar date. The ISO year can differ from the
/// calendar year around New Year.
pub fn iso_week_of_date(date: NaiveDate) -> (u32, i32) {
    let iso = date.iso_week();
    (iso.week(), iso.year())
}

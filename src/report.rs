// src/report.rs
//
// Reporting views over the ledger: a CSV dump for the treasurer's
// spreadsheet and a per-trainer hours summary. Read-only consumers; the
// engine is the only writer.

use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use thiserror::Error;

use crate::model::{SessionStatus, Trainer, TrainerId, TrainingSession, Year};

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("CSV serialization failed: {0}")]
    Csv(#[from] csv::Error),
    #[error("CSV output was not valid UTF-8")]
    Encoding,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainerHoursSummary {
    pub trainer_id: TrainerId,
    pub trainer_name: String,
    pub year: Year,
    pub total_hours: Decimal,
    pub session_count: usize,
}

/// Per-trainer totals for one calendar year, ordered by trainer id.
pub fn trainer_hours_summary(
    sessions: &[TrainingSession],
    trainers: &[Trainer],
    year: Year,
) -> Vec<TrainerHoursSummary> {
    let names: HashMap<TrainerId, String> = trainers
        .iter()
        .map(|t| (t.id, format!("{} {}", t.first_name, t.last_name)))
        .collect();

    let mut totals: HashMap<TrainerId, (Decimal, usize)> = HashMap::new();
    for session in sessions.iter().filter(|s| s.year == year) {
        let entry = totals.entry(session.trainer_id).or_default();
        entry.0 += session.hours;
        entry.1 += 1;
    }

    let mut summaries: Vec<TrainerHoursSummary> = totals
        .into_iter()
        .map(|(trainer_id, (total_hours, session_count))| TrainerHoursSummary {
            trainer_id,
            trainer_name: names
                .get(&trainer_id)
                .cloned()
                .unwrap_or_else(|| format!("Trainer {}", trainer_id)),
            year,
            total_hours: total_hours.round_dp(2),
            session_count,
        })
        .collect();
    summaries.sort_by_key(|s| s.trainer_id);
    summaries
}

/// Flat CSV export of ledger rows, every column the treasurer asks for.
pub fn ledger_csv(sessions: &[TrainingSession]) -> Result<String, ReportError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record([
        "id",
        "trainer_id",
        "course_id",
        "week_number",
        "year",
        "hours",
        "status",
        "recorded_by",
        "recorded_at",
    ])?;
    for session in sessions {
        let status = match session.status {
            SessionStatus::Recorded => "recorded",
            SessionStatus::Corrected => "corrected",
        };
        writer.write_record([
            session.id.to_string(),
            session.trainer_id.to_string(),
            session
                .course_id
                .map(|id| id.to_string())
                .unwrap_or_default(),
            session.week_number.to_string(),
            session.year.to_string(),
            session.hours.to_string(),
            status.to_string(),
            session.recorded_by.clone(),
            session.recorded_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        ])?;
    }
    let bytes = writer.into_inner().map_err(|_| ReportError::Encoding)?;
    String::from_utf8(bytes).map_err(|_| ReportError::Encoding)
}

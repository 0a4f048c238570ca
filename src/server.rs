// src/server.rs
//
// HTTP surface. Thin CRUD over the fact store; the one rule every fact
// handler follows is "write the fact, then hand the affected (course, week,
// year) keys to the reconciliation engine" so the ledger can never drift
// from the facts for longer than one request.

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};

use crate::calendar;
use crate::model::{Course, CourseId, SessionId, Trainer, TrainerId, TrainingSession, WeekNum, Year};
use crate::reconcile::{Clock, ReconcileEngine, ReconcileError, ReconcileOutcome};
use crate::report::{self, ReportError};
use crate::store::{NewSession, ScheduleStore, StoreError};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<ScheduleStore>,
    pub engine: Arc<ReconcileEngine>,
    pub clock: Arc<dyn Clock>,
}

// --- Errors ---

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
    #[error(transparent)]
    Report(#[from] ReportError),
    #[error("{0}")]
    BadRequest(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::Store(StoreError::UnknownTrainer(_))
            | AppError::Store(StoreError::UnknownCourse(_))
            | AppError::Store(StoreError::UnknownSession(_)) => StatusCode::NOT_FOUND,
            AppError::Store(StoreError::InvalidCourseTimes)
            | AppError::Store(StoreError::InvalidDayName(_))
            | AppError::Reconcile(_)
            | AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Report(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("Request failed: {:?}", self);
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

// --- Router ---

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/trainers", get(list_trainers).post(create_trainer))
        .route("/api/trainers/{id}", axum::routing::put(update_trainer))
        .route("/api/courses", get(list_courses).post(create_course))
        .route(
            "/api/courses/{id}",
            axum::routing::put(update_course).delete(delete_course),
        )
        .route(
            "/api/weekly-assignments",
            get(list_assignments).post(replace_assignments),
        )
        .route(
            "/api/weekly-assignments/{course_id}/{week}/{year}",
            get(slot_assignments).delete(clear_assignments),
        )
        .route(
            "/api/cancelled-courses",
            get(list_cancellations).post(add_cancellation),
        )
        .route(
            "/api/cancelled-courses/{course_id}/{week}/{year}",
            axum::routing::delete(remove_cancellation),
        )
        .route(
            "/api/holiday-weeks",
            get(list_holiday_weeks).post(add_holiday_week),
        )
        .route(
            "/api/holiday-weeks/{week}/{year}",
            axum::routing::delete(remove_holiday_week),
        )
        .route(
            "/api/course-exceptions",
            get(list_exceptions).post(add_exception),
        )
        .route(
            "/api/course-exceptions/{course_id}/{week}/{year}",
            axum::routing::delete(remove_exception),
        )
        .route(
            "/api/training-sessions",
            get(list_sessions).post(create_adhoc_session),
        )
        .route(
            "/api/training-sessions/{id}",
            axum::routing::put(correct_session).delete(delete_session),
        )
        .route("/api/sync/training-sessions", post(resync_sessions))
        .route("/api/reports/hours.csv", get(hours_csv))
        .route("/api/reports/trainer-hours", get(trainer_hours))
        .route("/api/current-week", get(current_week))
        .route("/api/health", get(health))
        .with_state(state)
}

// --- Trainers ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrainerPayload {
    first_name: String,
    last_name: String,
    email: Option<String>,
    phone: Option<String>,
    #[serde(default = "default_true")]
    active: bool,
}

fn default_true() -> bool {
    true
}

async fn list_trainers(State(state): State<AppState>) -> Json<Vec<Trainer>> {
    Json(state.store.list_trainers())
}

async fn create_trainer(
    State(state): State<AppState>,
    Json(payload): Json<TrainerPayload>,
) -> (StatusCode, Json<Trainer>) {
    let trainer = state.store.create_trainer(
        &payload.first_name,
        &payload.last_name,
        payload.email,
        payload.phone,
    );
    (StatusCode::CREATED, Json(trainer))
}

async fn update_trainer(
    State(state): State<AppState>,
    Path(id): Path<TrainerId>,
    Json(payload): Json<TrainerPayload>,
) -> Result<Json<Trainer>, AppError> {
    let trainer = state.store.update_trainer(Trainer {
        id,
        first_name: payload.first_name,
        last_name: payload.last_name,
        email: payload.email,
        phone: payload.phone,
        active: payload.active,
    })?;
    Ok(Json(trainer))
}

// --- Courses ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CoursePayload {
    name: String,
    day_of_week: String,
    start_time: Option<String>,
    end_time: Option<String>,
    location: Option<String>,
    category: Option<String>,
    #[serde(default = "default_required_trainers")]
    required_trainers: u32,
    #[serde(default = "default_true")]
    active: bool,
    #[serde(default)]
    default_trainers: Vec<TrainerId>,
}

fn default_required_trainers() -> u32 {
    1
}

/// Fact writes reject (week, year) keys the engine could never reconcile,
/// before anything is stored: a 400 must mean nothing was committed.
fn validate_week(week: WeekNum, year: Year) -> Result<(), AppError> {
    calendar::monday_of_iso_week(week, year)
        .map(|_| ())
        .map_err(|e| AppError::BadRequest(e.to_string()))
}

/// Accepts "18:00" and "18:00:00"; the legacy frontend sends both.
fn parse_time(value: &str) -> Result<NaiveTime, AppError> {
    NaiveTime::parse_from_str(value, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M"))
        .map_err(|_| AppError::BadRequest(format!("Invalid time of day: '{}'", value)))
}

fn course_from_payload(id: CourseId, payload: CoursePayload) -> Result<Course, AppError> {
    Ok(Course {
        id,
        name: payload.name,
        day_of_week: payload.day_of_week,
        start_time: payload.start_time.as_deref().map(parse_time).transpose()?,
        end_time: payload.end_time.as_deref().map(parse_time).transpose()?,
        location: payload.location,
        category: payload.category,
        required_trainers: payload.required_trainers,
        active: payload.active,
        default_trainers: payload.default_trainers,
    })
}

async fn list_courses(State(state): State<AppState>) -> Json<Vec<Course>> {
    Json(state.store.list_courses())
}

async fn create_course(
    State(state): State<AppState>,
    Json(payload): Json<CoursePayload>,
) -> Result<(StatusCode, Json<Course>), AppError> {
    let course = state.store.create_course(course_from_payload(0, payload)?)?;
    Ok((StatusCode::CREATED, Json(course)))
}

async fn update_course(
    State(state): State<AppState>,
    Path(id): Path<CourseId>,
    Json(payload): Json<CoursePayload>,
) -> Result<Json<Course>, AppError> {
    let course = state.store.update_course(course_from_payload(id, payload)?)?;
    Ok(Json(course))
}

async fn delete_course(
    State(state): State<AppState>,
    Path(id): Path<CourseId>,
) -> Result<Json<serde_json::Value>, AppError> {
    state.store.delete_course(id)?;
    info!("Deleted course {}; stale sessions will clear on next resync", id);
    Ok(Json(json!({ "success": true })))
}

// --- Weekly assignments ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AssignmentPayload {
    course_id: CourseId,
    week_number: WeekNum,
    year: Year,
    #[serde(default)]
    trainer_ids: Vec<TrainerId>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FactChangeResponse {
    success: bool,
    added: Vec<TrainerId>,
    removed: Vec<TrainerId>,
}

impl From<ReconcileOutcome> for FactChangeResponse {
    fn from(outcome: ReconcileOutcome) -> Self {
        Self {
            success: true,
            added: outcome.added,
            removed: outcome.removed,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SlotAssignmentsResponse {
    course_id: CourseId,
    week_number: WeekNum,
    year: Year,
    trainer_ids: Vec<TrainerId>,
    from_defaults: bool,
}

/// Planner read view for one course instance: the explicit weekly
/// assignment when present, else the course's default trainer set.
async fn slot_assignments(
    State(state): State<AppState>,
    Path((course_id, week, year)): Path<(CourseId, WeekNum, Year)>,
) -> Json<SlotAssignmentsResponse> {
    let slot = (course_id, week, year);
    let explicit = state.store.assignments_for_slot(slot);
    let no_explicit = explicit.is_empty();
    let trainer_ids = if no_explicit {
        state.store.effective_assignments(slot)
    } else {
        explicit
    };
    Json(SlotAssignmentsResponse {
        course_id,
        week_number: week,
        year,
        from_defaults: no_explicit && !trainer_ids.is_empty(),
        trainer_ids,
    })
}

/// Grouped like the legacy API: "courseId-week-year" -> trainer ids.
async fn list_assignments(State(state): State<AppState>) -> Json<HashMap<String, Vec<TrainerId>>> {
    let mut grouped: HashMap<String, Vec<TrainerId>> = HashMap::new();
    for (course_id, week, year, trainer_id) in state.store.all_assignment_tuples() {
        grouped
            .entry(format!("{}-{}-{}", course_id, week, year))
            .or_default()
            .push(trainer_id);
    }
    Json(grouped)
}

async fn replace_assignments(
    State(state): State<AppState>,
    Json(payload): Json<AssignmentPayload>,
) -> Result<Json<FactChangeResponse>, AppError> {
    validate_week(payload.week_number, payload.year)?;
    let slot = (payload.course_id, payload.week_number, payload.year);
    state.store.replace_assignments(slot, payload.trainer_ids)?;
    let outcome = state
        .engine
        .reconcile(payload.course_id, payload.week_number, payload.year)?;
    Ok(Json(outcome.into()))
}

async fn clear_assignments(
    State(state): State<AppState>,
    Path((course_id, week, year)): Path<(CourseId, WeekNum, Year)>,
) -> Result<Json<FactChangeResponse>, AppError> {
    state
        .store
        .replace_assignments((course_id, week, year), Vec::new())?;
    let outcome = state.engine.reconcile(course_id, week, year)?;
    Ok(Json(outcome.into()))
}

// --- Cancelled courses ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancellationPayload {
    course_id: CourseId,
    week_number: WeekNum,
    year: Year,
    reason: Option<String>,
}

async fn list_cancellations(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!(state.store.list_cancellations()))
}

async fn add_cancellation(
    State(state): State<AppState>,
    Json(payload): Json<CancellationPayload>,
) -> Result<(StatusCode, Json<FactChangeResponse>), AppError> {
    validate_week(payload.week_number, payload.year)?;
    let slot = (payload.course_id, payload.week_number, payload.year);
    state
        .store
        .upsert_cancellation(slot, payload.reason.as_deref().unwrap_or(""));
    let outcome = state
        .engine
        .reconcile(payload.course_id, payload.week_number, payload.year)?;
    Ok((StatusCode::CREATED, Json(outcome.into())))
}

async fn remove_cancellation(
    State(state): State<AppState>,
    Path((course_id, week, year)): Path<(CourseId, WeekNum, Year)>,
) -> Result<Json<FactChangeResponse>, AppError> {
    state.store.remove_cancellation((course_id, week, year));
    let outcome = state.engine.reconcile(course_id, week, year)?;
    Ok(Json(outcome.into()))
}

// --- Holiday weeks ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HolidayWeekPayload {
    week_number: WeekNum,
    year: Year,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HolidayWeekEntry {
    week_number: WeekNum,
    year: Year,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WeekFanOutResponse {
    success: bool,
    reconciled: Vec<CourseOutcome>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CourseOutcome {
    course_id: CourseId,
    added: Vec<TrainerId>,
    removed: Vec<TrainerId>,
}

fn fan_out_response(outcomes: Vec<(CourseId, ReconcileOutcome)>) -> WeekFanOutResponse {
    WeekFanOutResponse {
        success: true,
        reconciled: outcomes
            .into_iter()
            .filter(|(_, o)| !o.is_noop())
            .map(|(course_id, o)| CourseOutcome {
                course_id,
                added: o.added,
                removed: o.removed,
            })
            .collect(),
    }
}

async fn list_holiday_weeks(State(state): State<AppState>) -> Json<Vec<HolidayWeekEntry>> {
    Json(
        state
            .store
            .list_holiday_weeks()
            .into_iter()
            .map(|(week_number, year)| HolidayWeekEntry { week_number, year })
            .collect(),
    )
}

async fn add_holiday_week(
    State(state): State<AppState>,
    Json(payload): Json<HolidayWeekPayload>,
) -> Result<(StatusCode, Json<WeekFanOutResponse>), AppError> {
    validate_week(payload.week_number, payload.year)?;
    state
        .store
        .add_holiday_week(payload.week_number, payload.year);
    let outcomes = state
        .engine
        .reconcile_assigned_week(payload.week_number, payload.year);
    Ok((StatusCode::CREATED, Json(fan_out_response(outcomes))))
}

async fn remove_holiday_week(
    State(state): State<AppState>,
    Path((week, year)): Path<(WeekNum, Year)>,
) -> Json<WeekFanOutResponse> {
    state.store.remove_holiday_week(week, year);
    let outcomes = state.engine.reconcile_assigned_week(week, year);
    Json(fan_out_response(outcomes))
}

// --- Course exceptions ---

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExceptionPayload {
    course_id: CourseId,
    week_number: WeekNum,
    year: Year,
}

async fn list_exceptions(State(state): State<AppState>) -> Json<Vec<ExceptionPayload>> {
    Json(
        state
            .store
            .list_exceptions()
            .into_iter()
            .map(|(course_id, week_number, year)| ExceptionPayload {
                course_id,
                week_number,
                year,
            })
            .collect(),
    )
}

async fn add_exception(
    State(state): State<AppState>,
    Json(payload): Json<ExceptionPayload>,
) -> Result<(StatusCode, Json<FactChangeResponse>), AppError> {
    validate_week(payload.week_number, payload.year)?;
    let slot = (payload.course_id, payload.week_number, payload.year);
    state.store.add_exception(slot);
    let outcome = state
        .engine
        .reconcile(payload.course_id, payload.week_number, payload.year)?;
    Ok((StatusCode::CREATED, Json(outcome.into())))
}

async fn remove_exception(
    State(state): State<AppState>,
    Path((course_id, week, year)): Path<(CourseId, WeekNum, Year)>,
) -> Result<Json<FactChangeResponse>, AppError> {
    state.store.remove_exception((course_id, week, year));
    let outcome = state.engine.reconcile(course_id, week, year)?;
    Ok(Json(outcome.into()))
}

// --- Training sessions (ledger administration) ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionFilter {
    trainer_id: Option<TrainerId>,
    year: Option<Year>,
    week_number: Option<WeekNum>,
}

async fn list_sessions(
    State(state): State<AppState>,
    Query(filter): Query<SessionFilter>,
) -> Json<Vec<TrainingSession>> {
    let sessions = state
        .store
        .ledger()
        .all()
        .into_iter()
        .filter(|s| filter.trainer_id.map_or(true, |t| s.trainer_id == t))
        .filter(|s| filter.year.map_or(true, |y| s.year == y))
        .filter(|s| filter.week_number.map_or(true, |w| s.week_number == w))
        .collect();
    Json(sessions)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AdhocSessionPayload {
    trainer_id: TrainerId,
    week_number: WeekNum,
    year: Year,
    hours: Decimal,
    recorded_by: Option<String>,
}

/// Ad-hoc activity outside any course template (course trips, tournaments).
/// No natural key, so no reconcile involvement.
async fn create_adhoc_session(
    State(state): State<AppState>,
    Json(payload): Json<AdhocSessionPayload>,
) -> Result<(StatusCode, Json<TrainingSession>), AppError> {
    if state.store.get_trainer(payload.trainer_id).is_none() {
        return Err(StoreError::UnknownTrainer(payload.trainer_id).into());
    }
    let mut ledger = state.store.ledger();
    let id = ledger.insert_adhoc(NewSession {
        course_id: None,
        trainer_id: payload.trainer_id,
        week_number: payload.week_number,
        year: payload.year,
        hours: payload.hours.round_dp(2),
        recorded_by: payload.recorded_by.unwrap_or_else(|| "admin".to_string()),
        recorded_at: state.clock.now(),
    });
    let session = ledger
        .get(id)
        .cloned()
        .ok_or_else(|| AppError::BadRequest("Session vanished after insert".to_string()))?;
    Ok((StatusCode::CREATED, Json(session)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CorrectionPayload {
    hours: Decimal,
    corrected_by: Option<String>,
}

async fn correct_session(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
    Json(payload): Json<CorrectionPayload>,
) -> Result<Json<TrainingSession>, AppError> {
    let corrected_by = payload.corrected_by.unwrap_or_else(|| "admin".to_string());
    let session = state
        .store
        .ledger()
        .correct_hours(id, payload.hours, &corrected_by)?;
    info!("Corrected session {} to {} hours", id, session.hours);
    Ok(Json(session))
}

async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
) -> Result<Json<serde_json::Value>, AppError> {
    state.store.ledger().remove_by_id(id)?;
    Ok(Json(json!({ "success": true })))
}

// --- Resync / reports / health ---

/// Best-effort batch operation: always answers 200 with the summary, even
/// when individual tuples failed.
async fn resync_sessions(State(state): State<AppState>) -> Json<serde_json::Value> {
    let summary = state.engine.resync_past_days();
    Json(json!(summary))
}

#[derive(Debug, Deserialize)]
struct YearFilter {
    year: Option<Year>,
}

async fn hours_csv(
    State(state): State<AppState>,
    Query(filter): Query<YearFilter>,
) -> Result<Response, AppError> {
    let sessions: Vec<TrainingSession> = state
        .store
        .ledger()
        .all()
        .into_iter()
        .filter(|s| filter.year.map_or(true, |y| s.year == y))
        .collect();
    let csv = report::ledger_csv(&sessions)?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/csv; charset=utf-8")],
        csv,
    )
        .into_response())
}

async fn trainer_hours(
    State(state): State<AppState>,
    Query(filter): Query<YearFilter>,
) -> Json<serde_json::Value> {
    let year = filter.year.unwrap_or_else(|| {
        use chrono::Datelike;
        state.clock.today().year()
    });
    let sessions = state.store.ledger().all();
    let trainers = state.store.list_trainers();
    Json(json!(report::trainer_hours_summary(&sessions, &trainers, year)))
}

/// The week the frontend's planner should open on.
async fn current_week(State(state): State<AppState>) -> Json<serde_json::Value> {
    let (week_number, year) = calendar::iso_week_of_date(state.clock.today());
    Json(json!({ "weekNumber": week_number, "year": year }))
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "OK",
        "counts": state.store.counts(),
    }))
}

// --- Test Module ---
#[cfg(test)]
mod server_tests {
    use super::*;
    use crate::reconcile::TestClock;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::NaiveDate;
    use tower::ServiceExt;

    fn test_app(now_str: &str) -> (Arc<ScheduleStore>, Arc<ReconcileEngine>, Router) {
        let store = Arc::new(ScheduleStore::new());
        let clock = Arc::new(TestClock::new(now_str));
        let engine = Arc::new(ReconcileEngine::new(
            store.clone(),
            clock.clone(),
            NaiveDate::parse_from_str("2025-09-01", "%Y-%m-%d").unwrap(),
        ));
        let router = build_router(AppState {
            store: store.clone(),
            engine: engine.clone(),
            clock,
        });
        (store, engine, router)
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn tuesday_course(store: &ScheduleStore) -> (CourseId, TrainerId) {
        let trainer = store.create_trainer("Anna", "Berger", None, None);
        let course = store
            .create_course(Course {
                id: 0,
                name: "Kinderturnen".to_string(),
                day_of_week: "Tuesday".to_string(),
                start_time: None,
                end_time: None,
                location: None,
                category: None,
                required_trainers: 1,
                active: true,
                default_trainers: vec![],
            })
            .unwrap();
        (course.id, trainer.id)
    }

    #[tokio::test]
    async fn assignment_write_to_invalid_week_commits_nothing() {
        let (store, engine, app) = test_app("2026-03-04 09:00:00");
        let (course_id, trainer_id) = tuesday_course(&store);

        // 2025 is a short ISO year; week 53 does not exist.
        let response = app
            .oneshot(post_json(
                "/api/weekly-assignments",
                json!({
                    "courseId": course_id,
                    "weekNumber": 53,
                    "year": 2025,
                    "trainerIds": [trainer_id],
                }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        // The rejected fact left no trace: nothing listed, nothing for the
        // bulk driver to stumble over.
        assert!(store.all_assignment_tuples().is_empty());
        let summary = engine.resync_past_days();
        assert_eq!(summary.failed, 0);
    }

    #[tokio::test]
    async fn cancellation_write_to_invalid_week_commits_nothing() {
        let (store, _engine, app) = test_app("2026-03-04 09:00:00");
        let (course_id, _) = tuesday_course(&store);

        let response = app
            .oneshot(post_json(
                "/api/cancelled-courses",
                json!({
                    "courseId": course_id,
                    "weekNumber": 54,
                    "year": 2026,
                    "reason": "Hallensperrung",
                }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(store.list_cancellations().is_empty());
    }
}

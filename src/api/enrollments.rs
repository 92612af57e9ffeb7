use super::helper;

use crate::ledger::{self, BadgeTiers, EntityRef};
use crate::model::enrollments::{
    ActivityRosterResponse, EnrollmentResponse, NewEnrollment, STATUS_COMPLETED, STATUS_STARTED,
    StudentEnrollmentsResponse,
};
use crate::payloads::enrollments::{
    BulkCompletePayload, CompleteEnrollmentParams, CreateEnrollmentPayload,
};
use crate::{
    AppState,
    errors::AppError,
    response::ApiResponse,
    schema::{
        activities::dsl as activities_dsl, enrollments::dsl as enroll_dsl,
        students::dsl as students_dsl,
    },
};
use axum::{
    Json,
    extract::{Path, Query, State},
};
use diesel::PgConnection;
use diesel::dsl::exists;
use diesel::prelude::*;
use tracing::log::warn;
use tracing::{debug, info, instrument};

/// Reward fields of one activity, as used by the completion paths.
#[derive(Debug, Clone, Queryable)]
struct ActivityRewards {
    name: String,
    code: String,
    xp_on_completion: i32,
    points_on_completion: f64,
}

fn load_activity_rewards(
    conn: &mut PgConnection,
    activity_id: i64,
) -> Result<ActivityRewards, diesel::result::Error> {
    activities_dsl::activities
        .find(activity_id)
        .select((
            activities_dsl::name,
            activities_dsl::code,
            activities_dsl::xp_on_completion,
            activities_dsl::points_on_completion,
        ))
        .first::<ActivityRewards>(conn)
}

/// Marks one enrollment completed and credits the student, all on the
/// supplied transaction connection: XP, total points and academic score
/// each get their own ledger entry, then the badge set is re-derived.
fn internal_complete_enrollment(
    conn: &mut PgConnection,
    tiers: &BadgeTiers,
    enrollment_id: i64,
    student_id: i64,
    activity: &ActivityRewards,
    score: i32,
) -> Result<(), AppError> {
    diesel::update(enroll_dsl::enrollments.find(enrollment_id))
        .set((
            enroll_dsl::status.eq(STATUS_COMPLETED),
            enroll_dsl::score_in_quest.eq(score),
        ))
        .execute(conn)?;

    let reason = format!("Completion of quest '{}' ({})", activity.name, activity.code);
    let reference = Some(EntityRef::Enrollment(enrollment_id));

    ledger::apply_xp_delta(
        conn,
        student_id,
        activity.xp_on_completion,
        ledger::txn::QUEST_XP_GAIN,
        &reason,
        reference,
    )?;
    ledger::apply_total_points_delta(
        conn,
        student_id,
        score,
        ledger::txn::QUEST_POINTS_GAIN,
        &reason,
        reference,
    )?;
    ledger::apply_academic_score_delta(
        conn,
        student_id,
        activity.points_on_completion,
        ledger::txn::QUEST_ACADEMIC_GAIN,
        &reason,
        reference,
    )?;
    ledger::recompute_badges(conn, tiers, student_id)?;
    Ok(())
}

/// Enrolls a student into an activity.
///
/// Request Body: `CreateEnrollmentPayload`
///
/// Returns (wrapped in `ApiResponse`)
/// * `EnrollmentResponse`: The new enrollment in "started" state (201 Created).
/// * `404 Not Found`: If the student or the activity does not exist.
/// * `409 Conflict`: If the student is already enrolled in the activity.
#[instrument(skip(state, payload))]
pub async fn create_enrollment(
    State(state): State<AppState>,
    Json(payload): Json<CreateEnrollmentPayload>,
) -> Result<ApiResponse<EnrollmentResponse>, AppError> {
    let student_id = payload.student_id;
    let activity_id = payload.activity_id;

    info!(
        "Enrolling student {} into activity {}",
        student_id, activity_id
    );
    debug!("Create enrollment payload: {:?}", payload);

    let student_exists = helper::run_query(&state.pool, move |conn| {
        diesel::select(exists(students_dsl::students.find(student_id))).get_result::<bool>(conn)
    })
    .await?;
    if !student_exists {
        return Err(AppError::NotFound(format!(
            "Student with ID {} not found.",
            student_id
        )));
    }

    let activity_exists = helper::run_query(&state.pool, move |conn| {
        diesel::select(exists(activities_dsl::activities.find(activity_id)))
            .get_result::<bool>(conn)
    })
    .await?;
    if !activity_exists {
        return Err(AppError::NotFound(format!(
            "Activity with ID {} not found.",
            activity_id
        )));
    }

    let already_enrolled = helper::run_query(&state.pool, move |conn| {
        diesel::select(exists(
            enroll_dsl::enrollments
                .filter(enroll_dsl::student_id.eq(student_id))
                .filter(enroll_dsl::activity_id.eq(activity_id)),
        ))
        .get_result::<bool>(conn)
    })
    .await?;
    if already_enrolled {
        warn!(
            "Student {} is already enrolled in activity {}.",
            student_id, activity_id
        );
        return Err(AppError::Conflict(format!(
            "Student {} is already enrolled in activity {}.",
            student_id, activity_id
        )));
    }

    let new_enrollment = NewEnrollment {
        student_id,
        activity_id,
        status: STATUS_STARTED.to_string(),
        score_in_quest: 0,
    };
    let enrollment = helper::run_query(&state.pool, move |conn| {
        diesel::insert_into(enroll_dsl::enrollments)
            .values(&new_enrollment)
            .returning(crate::schema::enrollments::all_columns)
            .get_result::<EnrollmentResponse>(conn)
    })
    .await?;

    info!(
        "Successfully created enrollment {} for student {}",
        enrollment.id, student_id
    );
    Ok(ApiResponse::created(enrollment))
}

/// Lists the activities a student is enrolled in, looked up by partial
/// name.
///
/// Returns (wrapped in `ApiResponse`)
/// * `StudentEnrollmentsResponse` (200 OK).
/// * `404 Not Found`: If no student matches, or the student has no
///   enrollments.
/// * `409 Conflict`: If the fragment matches several students; the message
///   enumerates the candidates (id + name) so the caller can retry by id.
#[instrument(skip(state))]
pub async fn enrollments_by_student(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<ApiResponse<StudentEnrollmentsResponse>, AppError> {
    info!("Fetching enrollments for student matching '{}'", name);

    let pattern = format!("%{}%", name);
    let candidates = helper::run_query(&state.pool, move |conn| {
        students_dsl::students
            .filter(students_dsl::name.ilike(pattern))
            .select((students_dsl::id, students_dsl::name))
            .order_by(students_dsl::id.asc())
            .load::<(i64, String)>(conn)
    })
    .await?;

    let (student_id, student_name) = match candidates.len() {
        0 => {
            return Err(AppError::NotFound(format!(
                "No student found matching '{}'.",
                name
            )));
        }
        1 => candidates.into_iter().next().expect("one candidate"),
        _ => {
            let listing = candidates
                .iter()
                .map(|(id, candidate_name)| format!("{} ({})", id, candidate_name))
                .collect::<Vec<_>>()
                .join(", ");
            warn!("Name fragment '{}' is ambiguous: {}", name, listing);
            return Err(AppError::Ambiguous(format!(
                "Multiple students match '{}': {}. Retry using the student ID.",
                name, listing
            )));
        }
    };

    let activities = helper::run_query(&state.pool, move |conn| {
        enroll_dsl::enrollments
            .inner_join(activities_dsl::activities)
            .filter(enroll_dsl::student_id.eq(student_id))
            .select(activities_dsl::name)
            .load::<String>(conn)
    })
    .await?;

    if activities.is_empty() {
        return Err(AppError::NotFound(format!(
            "Student '{}' has no enrollments.",
            student_name
        )));
    }

    Ok(ApiResponse::ok(StudentEnrollmentsResponse {
        student: student_name,
        activities,
    }))
}

/// Lists the students enrolled in one activity, looked up by code.
///
/// Returns (wrapped in `ApiResponse`)
/// * `ActivityRosterResponse` (200 OK).
/// * `404 Not Found`: If the activity does not exist or nobody is enrolled.
#[instrument(skip(state))]
pub async fn enrollments_by_activity(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<ApiResponse<ActivityRosterResponse>, AppError> {
    info!("Fetching roster for activity with code '{}'", code);

    let lookup_code = code.clone();
    let activity = helper::run_query(&state.pool, move |conn| {
        activities_dsl::activities
            .filter(activities_dsl::code.eq(lookup_code))
            .select((activities_dsl::id, activities_dsl::name))
            .first::<(i64, String)>(conn)
            .optional()
    })
    .await?;

    let Some((activity_id, activity_name)) = activity else {
        return Err(AppError::NotFound(format!(
            "Activity with code '{}' not found.",
            code
        )));
    };

    let students = helper::run_query(&state.pool, move |conn| {
        enroll_dsl::enrollments
            .inner_join(students_dsl::students)
            .filter(enroll_dsl::activity_id.eq(activity_id))
            .select(students_dsl::name)
            .load::<String>(conn)
    })
    .await?;

    if students.is_empty() {
        return Err(AppError::NotFound(format!(
            "No student enrolled in activity '{}'.",
            activity_name
        )));
    }

    Ok(ApiResponse::ok(ActivityRosterResponse {
        activity: activity_name,
        students,
    }))
}

/// Completes an enrollment and credits the student's XP, total points and
/// academic score, atomically with the status change.
///
/// Query Parameters:
/// * `score`: Final score earned in the quest.
///
/// Returns (wrapped in `ApiResponse`)
/// * `EnrollmentResponse` (200 OK).
/// * `404 Not Found`: If the enrollment does not exist.
/// * `409 Conflict`: If the enrollment was already completed.
#[instrument(skip(state, params))]
pub async fn complete_enrollment(
    State(state): State<AppState>,
    Path(enrollment_id): Path<i64>,
    Query(params): Query<CompleteEnrollmentParams>,
) -> Result<ApiResponse<EnrollmentResponse>, AppError> {
    info!(
        "Completing enrollment {} with score {}",
        enrollment_id, params.score
    );

    let score = params.score;
    let tiers = state.badge_tiers.clone();
    let conn = state.pool.get().await?;
    let completed: Result<EnrollmentResponse, AppError> = conn
        .interact(move |conn_sync| {
            conn_sync.transaction(|tx_conn| {
                let enrollment = enroll_dsl::enrollments
                    .find(enrollment_id)
                    .first::<EnrollmentResponse>(tx_conn)
                    .optional()?;
                let Some(enrollment) = enrollment else {
                    return Err(AppError::NotFound(format!(
                        "Enrollment with ID {} not found.",
                        enrollment_id
                    )));
                };

                if enrollment.status == STATUS_COMPLETED {
                    return Err(AppError::Conflict(format!(
                        "Enrollment {} is already completed.",
                        enrollment_id
                    )));
                }

                let activity = load_activity_rewards(tx_conn, enrollment.activity_id)?;
                internal_complete_enrollment(
                    tx_conn,
                    &tiers,
                    enrollment_id,
                    enrollment.student_id,
                    &activity,
                    score,
                )?;

                Ok(enroll_dsl::enrollments
                    .find(enrollment_id)
                    .first::<EnrollmentResponse>(tx_conn)?)
            })
        })
        .await?;

    let enrollment = completed?;
    info!(
        "Enrollment {} completed for student {}",
        enrollment.id, enrollment.student_id
    );
    Ok(ApiResponse::ok(enrollment))
}

/// Completes an activity for every member of a guild that has a
/// non-completed enrollment in it.
///
/// Members without an enrollment are skipped, not auto-enrolled; members
/// whose enrollment is already completed are left untouched. The whole
/// sweep runs in one transaction.
///
/// Request Body: `BulkCompletePayload`
///
/// Returns (wrapped in `ApiResponse`)
/// * `Vec<i64>`: IDs of the students whose enrollment was completed (200 OK).
/// * `404 Not Found`: If the guild or the activity does not exist.
#[instrument(skip(state, payload))]
pub async fn bulk_complete(
    State(state): State<AppState>,
    Json(payload): Json<BulkCompletePayload>,
) -> Result<ApiResponse<Vec<i64>>, AppError> {
    info!(
        "Bulk-completing activity '{}' for guild {}",
        payload.activity_code, payload.guild_id
    );
    debug!("Bulk complete payload: {:?}", payload);

    let guild_id = payload.guild_id;
    let guild_exists = helper::run_query(&state.pool, move |conn| {
        diesel::select(exists(
            crate::schema::guilds::dsl::guilds.find(guild_id),
        ))
        .get_result::<bool>(conn)
    })
    .await?;
    if !guild_exists {
        return Err(AppError::NotFound(format!(
            "Guild with ID {} not found.",
            guild_id
        )));
    }

    let code = payload.activity_code.clone();
    let activity_id = helper::run_query(&state.pool, move |conn| {
        activities_dsl::activities
            .filter(activities_dsl::code.eq(code))
            .select(activities_dsl::id)
            .first::<i64>(conn)
            .optional()
    })
    .await?;
    let Some(activity_id) = activity_id else {
        return Err(AppError::NotFound(format!(
            "Activity with code '{}' not found.",
            payload.activity_code
        )));
    };

    let score = payload.score;
    let tiers = state.badge_tiers.clone();
    let conn = state.pool.get().await?;
    let completed: Result<Vec<i64>, AppError> = conn
        .interact(move |conn_sync| {
            conn_sync.transaction(|tx_conn| {
                let activity = load_activity_rewards(tx_conn, activity_id)?;

                let open_enrollments = enroll_dsl::enrollments
                    .inner_join(students_dsl::students)
                    .filter(students_dsl::guild_id.eq(guild_id))
                    .filter(enroll_dsl::activity_id.eq(activity_id))
                    .filter(enroll_dsl::status.ne(STATUS_COMPLETED))
                    .select((enroll_dsl::id, enroll_dsl::student_id))
                    .load::<(i64, i64)>(tx_conn)?;

                let mut affected = Vec::with_capacity(open_enrollments.len());
                for (enrollment_id, student_id) in open_enrollments {
                    internal_complete_enrollment(
                        tx_conn,
                        &tiers,
                        enrollment_id,
                        student_id,
                        &activity,
                        score,
                    )?;
                    affected.push(student_id);
                }

                Ok(affected)
            })
        })
        .await?;

    let affected = completed?;
    info!(
        "Bulk completion touched {} students in guild {}",
        affected.len(),
        guild_id
    );
    Ok(ApiResponse::ok(affected))
}

/// Deletes an enrollment, reversing its rewards when it was completed.
///
/// A completed enrollment's XP, total-point and academic-score
/// contributions are subtracted again (each clamped by its own floor rule)
/// and logged as reversal ledger entries, then badges are re-derived. A
/// non-completed enrollment is simply deleted with no ledger effect.
///
/// Returns (wrapped in `ApiResponse`)
/// * `EnrollmentResponse`: The enrollment as it was before deletion (200 OK).
/// * `404 Not Found`: If the enrollment does not exist.
#[instrument(skip(state))]
pub async fn revert_enrollment(
    State(state): State<AppState>,
    Path(enrollment_id): Path<i64>,
) -> Result<ApiResponse<EnrollmentResponse>, AppError> {
    info!("Deleting enrollment {} (with reversal if completed)", enrollment_id);

    let tiers = state.badge_tiers.clone();
    let conn = state.pool.get().await?;
    let reverted: Result<EnrollmentResponse, AppError> = conn
        .interact(move |conn_sync| {
            conn_sync.transaction(|tx_conn| {
                let enrollment = enroll_dsl::enrollments
                    .find(enrollment_id)
                    .first::<EnrollmentResponse>(tx_conn)
                    .optional()?;
                let Some(enrollment) = enrollment else {
                    return Err(AppError::NotFound(format!(
                        "Enrollment with ID {} not found.",
                        enrollment_id
                    )));
                };

                if enrollment.status == STATUS_COMPLETED {
                    let activity = load_activity_rewards(tx_conn, enrollment.activity_id)?;
                    let reason =
                        format!("Reversal of quest '{}' ({})", activity.name, activity.code);
                    let reference = Some(EntityRef::Enrollment(enrollment_id));

                    ledger::apply_xp_delta(
                        tx_conn,
                        enrollment.student_id,
                        -activity.xp_on_completion,
                        ledger::txn::REVERSAL_QUEST_XP,
                        &reason,
                        reference,
                    )?;
                    ledger::apply_total_points_delta(
                        tx_conn,
                        enrollment.student_id,
                        -enrollment.score_in_quest,
                        ledger::txn::REVERSAL_QUEST_POINTS,
                        &reason,
                        reference,
                    )?;
                    ledger::apply_academic_score_delta(
                        tx_conn,
                        enrollment.student_id,
                        -activity.points_on_completion,
                        ledger::txn::REVERSAL_QUEST_ACADEMIC,
                        &reason,
                        reference,
                    )?;
                    ledger::recompute_badges(tx_conn, &tiers, enrollment.student_id)?;
                }

                diesel::delete(enroll_dsl::enrollments.find(enrollment_id)).execute(tx_conn)?;
                Ok(enrollment)
            })
        })
        .await?;

    let enrollment = reverted?;
    info!(
        "Enrollment {} deleted (status was '{}')",
        enrollment.id, enrollment.status
    );
    Ok(ApiResponse::ok(enrollment))
}

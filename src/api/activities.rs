use super::helper;

use crate::model::activities::{ActivityChangeset, ActivityResponse, NewActivity};
use crate::payloads::activities::{CreateActivityPayload, UpdateActivityPayload};
use crate::{
    AppState, errors::AppError, response::ApiResponse, schema::activities::dsl as activities_dsl,
};
use axum::{
    Json,
    extract::{Path, State},
};
use diesel::dsl::exists;
use diesel::prelude::*;
use tracing::log::warn;
use tracing::{debug, info, instrument};

/// Creates a new activity (quest) with its completion rewards.
///
/// Request Body: `CreateActivityPayload`
///
/// Returns (wrapped in `ApiResponse`)
/// * `ActivityResponse` (201 Created).
/// * `400 Bad Request`: If a completion reward is negative.
/// * `409 Conflict`: If an activity with the same code already exists.
/// * `500 Internal Server Error`: If a database error occurs.
#[instrument(skip(state, payload))]
pub async fn create_activity(
    State(state): State<AppState>,
    Json(payload): Json<CreateActivityPayload>,
) -> Result<ApiResponse<ActivityResponse>, AppError> {
    info!(
        "Creating activity '{}' with code '{}'",
        payload.name, payload.code
    );
    debug!("Create activity payload: {:?}", payload);

    if payload.xp_on_completion < 0 {
        return Err(AppError::BadRequest(
            "XP on completion cannot be negative.".to_string(),
        ));
    }
    if payload.points_on_completion < 0.0 {
        return Err(AppError::BadRequest(
            "Points on completion cannot be negative.".to_string(),
        ));
    }

    let code = payload.code.clone();
    let code_taken = helper::run_query(&state.pool, move |conn| {
        diesel::select(exists(
            activities_dsl::activities.filter(activities_dsl::code.eq(code)),
        ))
        .get_result::<bool>(conn)
    })
    .await?;

    if code_taken {
        warn!("Activity code '{}' is already taken.", payload.code);
        return Err(AppError::Conflict(format!(
            "Activity with code '{}' already exists.",
            payload.code
        )));
    }

    let new_activity = NewActivity {
        name: payload.name,
        code: payload.code,
        description: payload.description,
        xp_on_completion: payload.xp_on_completion,
        points_on_completion: payload.points_on_completion,
    };
    let activity = helper::run_query(&state.pool, move |conn| {
        diesel::insert_into(activities_dsl::activities)
            .values(&new_activity)
            .returning(crate::schema::activities::all_columns)
            .get_result::<ActivityResponse>(conn)
    })
    .await?;

    info!(
        "Successfully created activity '{}' with ID {}",
        activity.name, activity.id
    );
    Ok(ApiResponse::created(activity))
}

/// Lists all activities with their completion rewards.
#[instrument(skip(state))]
pub async fn list_activities(
    State(state): State<AppState>,
) -> Result<ApiResponse<Vec<ActivityResponse>>, AppError> {
    info!("Listing all activities");

    let activities = helper::run_query(&state.pool, move |conn| {
        activities_dsl::activities
            .order_by(activities_dsl::id.asc())
            .load::<ActivityResponse>(conn)
    })
    .await?;

    info!("Successfully fetched {} activities", activities.len());
    Ok(ApiResponse::ok(activities))
}

/// Retrieves one activity by its unique code.
///
/// Returns (wrapped in `ApiResponse`)
/// * `ActivityResponse` (200 OK).
/// * `404 Not Found`: If no activity carries the code.
#[instrument(skip(state))]
pub async fn get_activity(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<ApiResponse<ActivityResponse>, AppError> {
    info!("Fetching activity with code '{}'", code);

    let lookup_code = code.clone();
    let activity = helper::run_query(&state.pool, move |conn| {
        activities_dsl::activities
            .filter(activities_dsl::code.eq(lookup_code))
            .first::<ActivityResponse>(conn)
            .optional()
    })
    .await?;

    match activity {
        Some(activity) => Ok(ApiResponse::ok(activity)),
        None => Err(AppError::NotFound(format!(
            "Activity with code '{}' not found.",
            code
        ))),
    }
}

/// Updates an activity by its code. The code itself is immutable.
///
/// Request Body: `UpdateActivityPayload`
///
/// Returns (wrapped in `ApiResponse`)
/// * `ActivityResponse` (200 OK).
/// * `400 Bad Request`: If a completion reward would become negative.
/// * `404 Not Found`: If no activity carries the code.
#[instrument(skip(state, payload))]
pub async fn update_activity(
    State(state): State<AppState>,
    Path(code): Path<String>,
    Json(payload): Json<UpdateActivityPayload>,
) -> Result<ApiResponse<ActivityResponse>, AppError> {
    info!("Updating activity with code '{}'", code);
    debug!("Update activity payload: {:?}", payload);

    if let Some(xp) = payload.xp_on_completion {
        if xp < 0 {
            return Err(AppError::BadRequest(
                "XP on completion cannot be negative.".to_string(),
            ));
        }
    }
    if let Some(points) = payload.points_on_completion {
        if points < 0.0 {
            return Err(AppError::BadRequest(
                "Points on completion cannot be negative.".to_string(),
            ));
        }
    }

    let lookup_code = code.clone();
    let activity_id = helper::run_query(&state.pool, move |conn| {
        activities_dsl::activities
            .filter(activities_dsl::code.eq(lookup_code))
            .select(activities_dsl::id)
            .first::<i64>(conn)
            .optional()
    })
    .await?;

    let Some(activity_id) = activity_id else {
        return Err(AppError::NotFound(format!(
            "Activity with code '{}' not found.",
            code
        )));
    };

    let has_changes = payload.name.is_some()
        || payload.description.is_some()
        || payload.xp_on_completion.is_some()
        || payload.points_on_completion.is_some();

    let activity = helper::run_query(&state.pool, move |conn| {
        if has_changes {
            let changeset = ActivityChangeset {
                name: payload.name,
                description: payload.description,
                xp_on_completion: payload.xp_on_completion,
                points_on_completion: payload.points_on_completion,
            };
            diesel::update(activities_dsl::activities.find(activity_id))
                .set(&changeset)
                .execute(conn)?;
        }
        activities_dsl::activities
            .find(activity_id)
            .first::<ActivityResponse>(conn)
    })
    .await?;

    info!("Successfully updated activity {}", activity_id);
    Ok(ApiResponse::ok(activity))
}

use super::helper;

use crate::ledger::{self, EntityRef};
use crate::model::students::{
    ClassChangeset, ClassResponse, GuildChangeset, GuildLeaderboardEntry, GuildResponse,
    LedgerEntryResponse, NewClass, NewGuild, NewLedgerEntry, NewStudent, StudentChangeset,
    StudentRecord, StudentResponse,
};
use crate::payloads::students::{
    AddQuestPointsPayload, AwardBadgePayload, CreateClassPayload, CreateGuildPayload,
    CreateStudentPayload, DeductXpPayload, LeaderboardParams, PenalizeGuildPayload,
    UpdateClassPayload, UpdateGuildPayload, UpdateStudentPayload,
};
use crate::{
    AppState,
    errors::AppError,
    response::ApiResponse,
    schema::{
        activities::dsl as activities_dsl, classes::dsl as classes_dsl,
        enrollments::dsl as enroll_dsl, guilds::dsl as guilds_dsl,
        ledger_entries::dsl as ledger_dsl, students::dsl as students_dsl,
    },
};
use axum::{
    Json,
    extract::{Path, Query, State},
};
use diesel::dsl::{exists, sum};
use diesel::prelude::*;
use float_cmp::approx_eq;
use serde_json::json;
use std::collections::HashMap;
use tracing::log::warn;
use tracing::{debug, info, instrument};

const DEFAULT_UPDATE_REASON: &str = "Manual adjustment via student update";

fn assemble_guilds(
    guild_rows: Vec<(i64, String, i64, String)>,
    student_rows: Vec<(StudentRecord, Option<String>, Option<String>)>,
) -> Vec<GuildResponse> {
    let mut members: HashMap<i64, Vec<StudentResponse>> = HashMap::new();
    for (record, guild_name, class_name) in student_rows {
        if let Some(guild_id) = record.guild_id {
            members
                .entry(guild_id)
                .or_default()
                .push(StudentResponse::from_record(record, guild_name, class_name));
        }
    }

    guild_rows
        .into_iter()
        .map(|(id, name, class_id, class_name)| GuildResponse {
            id,
            name,
            class_id,
            class_name,
            students: members.remove(&id).unwrap_or_default(),
        })
        .collect()
}

// classes

/// Creates a new class.
///
/// Request Body: `CreateClassPayload`
///
/// Returns (wrapped in `ApiResponse`)
/// * `ClassResponse`: The created class with an empty guild list (201 Created).
/// * `409 Conflict`: If a class with the same name already exists.
/// * `500 Internal Server Error`: If a database error occurs.
#[instrument(skip(state, payload))]
pub async fn create_class(
    State(state): State<AppState>,
    Json(payload): Json<CreateClassPayload>,
) -> Result<ApiResponse<ClassResponse>, AppError> {
    info!("Creating class '{}'", payload.name);
    debug!("Create class payload: {:?}", payload);

    let name = payload.name.clone();
    let name_taken = helper::run_query(&state.pool, move |conn| {
        diesel::select(exists(
            classes_dsl::classes.filter(classes_dsl::name.eq(name)),
        ))
        .get_result::<bool>(conn)
    })
    .await?;

    if name_taken {
        warn!("Class name '{}' is already taken.", payload.name);
        return Err(AppError::Conflict(format!(
            "Class with name '{}' already exists.",
            payload.name
        )));
    }

    let new_class = NewClass {
        name: payload.name,
        year: payload.year,
    };
    let (id, name, year) = helper::run_query(&state.pool, move |conn| {
        diesel::insert_into(classes_dsl::classes)
            .values(&new_class)
            .returning((classes_dsl::id, classes_dsl::name, classes_dsl::year))
            .get_result::<(i64, String, Option<i32>)>(conn)
    })
    .await?;

    info!("Successfully created class '{}' with ID {}", name, id);
    Ok(ApiResponse::created(ClassResponse {
        id,
        name,
        year,
        guilds: vec![],
    }))
}

/// Lists all classes with their guilds and each guild's members nested.
#[instrument(skip(state))]
pub async fn list_classes(
    State(state): State<AppState>,
) -> Result<ApiResponse<Vec<ClassResponse>>, AppError> {
    info!("Listing all classes with nested guilds and students");

    let classes = helper::run_query(&state.pool, move |conn| {
        let class_rows = classes_dsl::classes
            .order_by(classes_dsl::id.asc())
            .load::<(i64, String, Option<i32>)>(conn)?;

        let guild_rows = guilds_dsl::guilds
            .inner_join(classes_dsl::classes)
            .select((
                guilds_dsl::id,
                guilds_dsl::name,
                guilds_dsl::class_id,
                classes_dsl::name,
            ))
            .load::<(i64, String, i64, String)>(conn)?;

        let student_rows = students_dsl::students
            .left_join(guilds_dsl::guilds.left_join(classes_dsl::classes))
            .select((
                crate::schema::students::all_columns,
                guilds_dsl::name.nullable(),
                classes_dsl::name.nullable(),
            ))
            .load::<(StudentRecord, Option<String>, Option<String>)>(conn)?;

        let mut guilds_by_class: HashMap<i64, Vec<GuildResponse>> = HashMap::new();
        let class_ids: Vec<i64> = guild_rows.iter().map(|(_, _, class_id, _)| *class_id).collect();
        let assembled = assemble_guilds(guild_rows, student_rows);
        for (guild, class_id) in assembled.into_iter().zip(class_ids) {
            guilds_by_class.entry(class_id).or_default().push(guild);
        }

        Ok(class_rows
            .into_iter()
            .map(|(id, name, year)| ClassResponse {
                id,
                name,
                year,
                guilds: guilds_by_class.remove(&id).unwrap_or_default(),
            })
            .collect::<Vec<_>>())
    })
    .await?;

    info!("Successfully fetched {} classes", classes.len());
    Ok(ApiResponse::ok(classes))
}

/// Retrieves one class with its guilds and members.
///
/// Returns (wrapped in `ApiResponse`)
/// * `ClassResponse` (200 OK).
/// * `404 Not Found`: If the class does not exist.
#[instrument(skip(state))]
pub async fn get_class(
    State(state): State<AppState>,
    Path(class_id): Path<i64>,
) -> Result<ApiResponse<ClassResponse>, AppError> {
    info!("Fetching class with ID {}", class_id);

    let class = helper::run_query(&state.pool, move |conn| {
        classes_dsl::classes
            .find(class_id)
            .first::<(i64, String, Option<i32>)>(conn)
            .optional()
    })
    .await?;

    let Some((id, name, year)) = class else {
        return Err(AppError::NotFound(format!(
            "Class with ID {} not found.",
            class_id
        )));
    };

    let guilds = helper::run_query(&state.pool, move |conn| {
        let guild_rows = guilds_dsl::guilds
            .inner_join(classes_dsl::classes)
            .filter(guilds_dsl::class_id.eq(class_id))
            .select((
                guilds_dsl::id,
                guilds_dsl::name,
                guilds_dsl::class_id,
                classes_dsl::name,
            ))
            .load::<(i64, String, i64, String)>(conn)?;

        let guild_ids: Vec<i64> = guild_rows.iter().map(|(id, _, _, _)| *id).collect();
        let student_rows = students_dsl::students
            .left_join(guilds_dsl::guilds.left_join(classes_dsl::classes))
            .filter(students_dsl::guild_id.eq_any(guild_ids))
            .select((
                crate::schema::students::all_columns,
                guilds_dsl::name.nullable(),
                classes_dsl::name.nullable(),
            ))
            .load::<(StudentRecord, Option<String>, Option<String>)>(conn)?;

        Ok(assemble_guilds(guild_rows, student_rows))
    })
    .await?;

    Ok(ApiResponse::ok(ClassResponse {
        id,
        name,
        year,
        guilds,
    }))
}

/// Updates a class name and/or year.
///
/// Returns (wrapped in `ApiResponse`)
/// * `ClassResponse` (200 OK).
/// * `404 Not Found`: If the class does not exist.
/// * `409 Conflict`: If renaming to a name that is already taken.
#[instrument(skip(state, payload))]
pub async fn update_class(
    State(state): State<AppState>,
    Path(class_id): Path<i64>,
    Json(payload): Json<UpdateClassPayload>,
) -> Result<ApiResponse<ClassResponse>, AppError> {
    info!("Updating class with ID {}", class_id);
    debug!("Update class payload: {:?}", payload);

    let current = helper::run_query(&state.pool, move |conn| {
        classes_dsl::classes
            .find(class_id)
            .select(classes_dsl::name)
            .first::<String>(conn)
            .optional()
    })
    .await?;

    let Some(current_name) = current else {
        return Err(AppError::NotFound(format!(
            "Class with ID {} not found.",
            class_id
        )));
    };

    if let Some(new_name) = payload.name.clone() {
        if new_name != current_name {
            let name_taken = helper::run_query(&state.pool, {
                let new_name = new_name.clone();
                move |conn| {
                    diesel::select(exists(
                        classes_dsl::classes.filter(classes_dsl::name.eq(new_name)),
                    ))
                    .get_result::<bool>(conn)
                }
            })
            .await?;
            if name_taken {
                return Err(AppError::Conflict(format!(
                    "Class with name '{}' already exists.",
                    new_name
                )));
            }
        }
    }

    if payload.name.is_some() || payload.year.is_some() {
        let changeset = ClassChangeset {
            name: payload.name,
            year: payload.year,
        };
        helper::run_query(&state.pool, move |conn| {
            diesel::update(classes_dsl::classes.find(class_id))
                .set(&changeset)
                .execute(conn)
        })
        .await?;
    }

    get_class(State(state), Path(class_id)).await
}

/// Deletes a class and everything under it: its guilds, their students,
/// and those students' enrollments and ledger entries, in one transaction.
///
/// Returns (wrapped in `ApiResponse`)
/// * `bool`: true when the cascade completed (200 OK).
/// * `404 Not Found`: If the class does not exist.
#[instrument(skip(state))]
pub async fn delete_class(
    State(state): State<AppState>,
    Path(class_id): Path<i64>,
) -> Result<ApiResponse<bool>, AppError> {
    info!("Attempting to DELETE class {} with full cascade", class_id);

    let class_exists = helper::run_query(&state.pool, move |conn| {
        diesel::select(exists(classes_dsl::classes.find(class_id))).get_result::<bool>(conn)
    })
    .await?;

    if !class_exists {
        return Err(AppError::NotFound(format!(
            "Class with ID {} not found.",
            class_id
        )));
    }

    let conn = state.pool.get().await?;
    let deletion_result: Result<(), AppError> = conn
        .interact(move |conn_sync| {
            conn_sync.transaction(|tx_conn| {
                let guild_ids = guilds_dsl::guilds
                    .filter(guilds_dsl::class_id.eq(class_id))
                    .select(guilds_dsl::id)
                    .load::<i64>(tx_conn)?;

                let student_ids = students_dsl::students
                    .filter(students_dsl::guild_id.eq_any(guild_ids.clone()))
                    .select(students_dsl::id)
                    .load::<i64>(tx_conn)?;

                // Children first: ledger entries and enrollments, then the
                // students, then the guilds, then the class itself.
                if !student_ids.is_empty() {
                    info!("Deleting dependents of {} students in class {}", student_ids.len(), class_id);
                    diesel::delete(
                        ledger_dsl::ledger_entries
                            .filter(ledger_dsl::student_id.eq_any(student_ids.clone())),
                    )
                    .execute(tx_conn)?;
                    diesel::delete(
                        enroll_dsl::enrollments
                            .filter(enroll_dsl::student_id.eq_any(student_ids.clone())),
                    )
                    .execute(tx_conn)?;
                    diesel::delete(
                        students_dsl::students.filter(students_dsl::id.eq_any(student_ids)),
                    )
                    .execute(tx_conn)?;
                }

                diesel::delete(guilds_dsl::guilds.filter(guilds_dsl::class_id.eq(class_id)))
                    .execute(tx_conn)?;

                let deleted = diesel::delete(classes_dsl::classes.find(class_id))
                    .execute(tx_conn)?;
                if deleted == 1 {
                    Ok(())
                } else {
                    Err(AppError::NotFound(format!(
                        "Class {} not found during final delete step.",
                        class_id
                    )))
                }
            })
        })
        .await?;

    deletion_result?;
    info!("Successfully deleted class {} and its dependents", class_id);
    Ok(ApiResponse::ok(true))
}

// guilds

/// Creates a new guild under an existing class.
///
/// Request Body: `CreateGuildPayload`
///
/// Returns (wrapped in `ApiResponse`)
/// * `GuildResponse`: The created guild with an empty member list (201 Created).
/// * `404 Not Found`: If the class does not exist.
/// * `409 Conflict`: If a guild with the same name already exists.
#[instrument(skip(state, payload))]
pub async fn create_guild(
    State(state): State<AppState>,
    Json(payload): Json<CreateGuildPayload>,
) -> Result<ApiResponse<GuildResponse>, AppError> {
    info!(
        "Creating guild '{}' under class {}",
        payload.name, payload.class_id
    );
    debug!("Create guild payload: {:?}", payload);

    let class_id = payload.class_id;
    let class_name = helper::run_query(&state.pool, move |conn| {
        classes_dsl::classes
            .find(class_id)
            .select(classes_dsl::name)
            .first::<String>(conn)
            .optional()
    })
    .await?;

    let Some(class_name) = class_name else {
        return Err(AppError::NotFound(format!(
            "Class with ID {} not found.",
            payload.class_id
        )));
    };

    let name = payload.name.clone();
    let name_taken = helper::run_query(&state.pool, move |conn| {
        diesel::select(exists(guilds_dsl::guilds.filter(guilds_dsl::name.eq(name))))
            .get_result::<bool>(conn)
    })
    .await?;

    if name_taken {
        warn!("Guild name '{}' is already taken.", payload.name);
        return Err(AppError::Conflict(format!(
            "Guild with name '{}' already exists.",
            payload.name
        )));
    }

    let new_guild = NewGuild {
        name: payload.name,
        class_id: payload.class_id,
    };
    let (id, name) = helper::run_query(&state.pool, move |conn| {
        diesel::insert_into(guilds_dsl::guilds)
            .values(&new_guild)
            .returning((guilds_dsl::id, guilds_dsl::name))
            .get_result::<(i64, String)>(conn)
    })
    .await?;

    info!("Successfully created guild '{}' with ID {}", name, id);
    Ok(ApiResponse::created(GuildResponse {
        id,
        name,
        class_id: payload.class_id,
        class_name,
        students: vec![],
    }))
}

/// Lists all guilds with their class name and members nested.
#[instrument(skip(state))]
pub async fn list_guilds(
    State(state): State<AppState>,
) -> Result<ApiResponse<Vec<GuildResponse>>, AppError> {
    info!("Listing all guilds with nested members");

    let guilds = helper::run_query(&state.pool, move |conn| {
        let guild_rows = guilds_dsl::guilds
            .inner_join(classes_dsl::classes)
            .order_by(guilds_dsl::id.asc())
            .select((
                guilds_dsl::id,
                guilds_dsl::name,
                guilds_dsl::class_id,
                classes_dsl::name,
            ))
            .load::<(i64, String, i64, String)>(conn)?;

        let student_rows = students_dsl::students
            .left_join(guilds_dsl::guilds.left_join(classes_dsl::classes))
            .select((
                crate::schema::students::all_columns,
                guilds_dsl::name.nullable(),
                classes_dsl::name.nullable(),
            ))
            .load::<(StudentRecord, Option<String>, Option<String>)>(conn)?;

        Ok(assemble_guilds(guild_rows, student_rows))
    })
    .await?;

    info!("Successfully fetched {} guilds", guilds.len());
    Ok(ApiResponse::ok(guilds))
}

/// Updates a guild name and/or moves it under a different class.
///
/// Returns (wrapped in `ApiResponse`)
/// * `GuildResponse` (200 OK).
/// * `404 Not Found`: If the guild or the target class does not exist.
/// * `409 Conflict`: If renaming to a name that is already taken.
#[instrument(skip(state, payload))]
pub async fn update_guild(
    State(state): State<AppState>,
    Path(guild_id): Path<i64>,
    Json(payload): Json<UpdateGuildPayload>,
) -> Result<ApiResponse<GuildResponse>, AppError> {
    info!("Updating guild with ID {}", guild_id);
    debug!("Update guild payload: {:?}", payload);

    let current = helper::run_query(&state.pool, move |conn| {
        guilds_dsl::guilds
            .find(guild_id)
            .select(guilds_dsl::name)
            .first::<String>(conn)
            .optional()
    })
    .await?;

    let Some(current_name) = current else {
        return Err(AppError::NotFound(format!(
            "Guild with ID {} not found.",
            guild_id
        )));
    };

    if let Some(new_name) = payload.name.clone() {
        if new_name != current_name {
            let name_taken = helper::run_query(&state.pool, {
                let new_name = new_name.clone();
                move |conn| {
                    diesel::select(exists(
                        guilds_dsl::guilds.filter(guilds_dsl::name.eq(new_name)),
                    ))
                    .get_result::<bool>(conn)
                }
            })
            .await?;
            if name_taken {
                return Err(AppError::Conflict(format!(
                    "Guild with name '{}' already exists.",
                    new_name
                )));
            }
        }
    }

    if let Some(new_class_id) = payload.class_id {
        let class_exists = helper::run_query(&state.pool, move |conn| {
            diesel::select(exists(classes_dsl::classes.find(new_class_id)))
                .get_result::<bool>(conn)
        })
        .await?;
        if !class_exists {
            return Err(AppError::NotFound(format!(
                "Class with ID {} not found.",
                new_class_id
            )));
        }
    }

    if payload.name.is_some() || payload.class_id.is_some() {
        let changeset = GuildChangeset {
            name: payload.name,
            class_id: payload.class_id,
        };
        helper::run_query(&state.pool, move |conn| {
            diesel::update(guilds_dsl::guilds.find(guild_id))
                .set(&changeset)
                .execute(conn)
        })
        .await?;
    }

    let guild = helper::run_query(&state.pool, move |conn| {
        let guild_row = guilds_dsl::guilds
            .inner_join(classes_dsl::classes)
            .filter(guilds_dsl::id.eq(guild_id))
            .select((
                guilds_dsl::id,
                guilds_dsl::name,
                guilds_dsl::class_id,
                classes_dsl::name,
            ))
            .first::<(i64, String, i64, String)>(conn)?;

        let student_rows = students_dsl::students
            .left_join(guilds_dsl::guilds.left_join(classes_dsl::classes))
            .filter(students_dsl::guild_id.eq(guild_id))
            .select((
                crate::schema::students::all_columns,
                guilds_dsl::name.nullable(),
                classes_dsl::name.nullable(),
            ))
            .load::<(StudentRecord, Option<String>, Option<String>)>(conn)?;

        Ok(assemble_guilds(vec![guild_row], student_rows)
            .pop()
            .expect("one guild row was supplied"))
    })
    .await?;

    Ok(ApiResponse::ok(guild))
}

/// Deletes a guild and cascades to its members (their enrollments and
/// ledger entries included), in one transaction.
#[instrument(skip(state))]
pub async fn delete_guild(
    State(state): State<AppState>,
    Path(guild_id): Path<i64>,
) -> Result<ApiResponse<bool>, AppError> {
    info!("Attempting to DELETE guild {} with member cascade", guild_id);

    let guild_exists = helper::run_query(&state.pool, move |conn| {
        diesel::select(exists(guilds_dsl::guilds.find(guild_id))).get_result::<bool>(conn)
    })
    .await?;

    if !guild_exists {
        return Err(AppError::NotFound(format!(
            "Guild with ID {} not found.",
            guild_id
        )));
    }

    let conn = state.pool.get().await?;
    let deletion_result: Result<(), AppError> = conn
        .interact(move |conn_sync| {
            conn_sync.transaction(|tx_conn| {
                let member_ids = students_dsl::students
                    .filter(students_dsl::guild_id.eq(guild_id))
                    .select(students_dsl::id)
                    .load::<i64>(tx_conn)?;

                if !member_ids.is_empty() {
                    diesel::delete(
                        ledger_dsl::ledger_entries
                            .filter(ledger_dsl::student_id.eq_any(member_ids.clone())),
                    )
                    .execute(tx_conn)?;
                    diesel::delete(
                        enroll_dsl::enrollments
                            .filter(enroll_dsl::student_id.eq_any(member_ids.clone())),
                    )
                    .execute(tx_conn)?;
                    diesel::delete(
                        students_dsl::students.filter(students_dsl::id.eq_any(member_ids)),
                    )
                    .execute(tx_conn)?;
                }

                let deleted = diesel::delete(guilds_dsl::guilds.find(guild_id))
                    .execute(tx_conn)?;
                if deleted == 1 {
                    Ok(())
                } else {
                    Err(AppError::NotFound(format!(
                        "Guild {} not found during final delete step.",
                        guild_id
                    )))
                }
            })
        })
        .await?;

    deletion_result?;
    info!("Successfully deleted guild {} and its members", guild_id);
    Ok(ApiResponse::ok(true))
}

/// Ranks guilds by the summed XP of their members, highest first.
///
/// Returns (wrapped in `ApiResponse`)
/// * `Vec<GuildLeaderboardEntry>` (200 OK).
/// * `404 Not Found`: If no guild has any member with XP.
#[instrument(skip(state))]
pub async fn guild_leaderboard(
    State(state): State<AppState>,
) -> Result<ApiResponse<Vec<GuildLeaderboardEntry>>, AppError> {
    info!("Computing guild leaderboard");

    let mut entries = helper::run_query(&state.pool, move |conn| {
        guilds_dsl::guilds
            .inner_join(classes_dsl::classes)
            .inner_join(students_dsl::students)
            .group_by((guilds_dsl::id, guilds_dsl::name, classes_dsl::name))
            .select((
                guilds_dsl::id,
                guilds_dsl::name,
                classes_dsl::name,
                sum(students_dsl::xp),
            ))
            .load::<(i64, String, String, Option<i64>)>(conn)
    })
    .await?
    .into_iter()
    .map(|(guild_id, guild_name, class_name, total_xp)| GuildLeaderboardEntry {
        guild_id,
        guild_name,
        class_name,
        total_xp: total_xp.unwrap_or(0),
    })
    .collect::<Vec<_>>();

    if entries.is_empty() {
        return Err(AppError::NotFound(
            "No guild with registered XP.".to_string(),
        ));
    }

    entries.sort_by(|a, b| b.total_xp.cmp(&a.total_xp));
    info!("Guild leaderboard computed with {} entries", entries.len());
    Ok(ApiResponse::ok(entries))
}

/// Lists the members of one guild, ordered by XP descending.
///
/// Returns (wrapped in `ApiResponse`)
/// * `Vec<StudentResponse>` (200 OK).
/// * `404 Not Found`: If the guild does not exist or has no members.
#[instrument(skip(state))]
pub async fn guild_students(
    State(state): State<AppState>,
    Path(guild_id): Path<i64>,
) -> Result<ApiResponse<Vec<StudentResponse>>, AppError> {
    info!("Listing members of guild {}", guild_id);

    let guild_exists = helper::run_query(&state.pool, move |conn| {
        diesel::select(exists(guilds_dsl::guilds.find(guild_id))).get_result::<bool>(conn)
    })
    .await?;

    if !guild_exists {
        return Err(AppError::NotFound(format!(
            "Guild with ID {} not found.",
            guild_id
        )));
    }

    let members = helper::run_query(&state.pool, move |conn| {
        students_dsl::students
            .left_join(guilds_dsl::guilds.left_join(classes_dsl::classes))
            .filter(students_dsl::guild_id.eq(guild_id))
            .order_by(students_dsl::xp.desc())
            .select((
                crate::schema::students::all_columns,
                guilds_dsl::name.nullable(),
                classes_dsl::name.nullable(),
            ))
            .load::<(StudentRecord, Option<String>, Option<String>)>(conn)
    })
    .await?
    .into_iter()
    .map(|(record, guild_name, class_name)| {
        StudentResponse::from_record(record, guild_name, class_name)
    })
    .collect::<Vec<_>>();

    if members.is_empty() {
        return Err(AppError::NotFound(format!(
            "No students found in guild with ID {}.",
            guild_id
        )));
    }

    Ok(ApiResponse::ok(members))
}

/// Applies an XP penalty to every member of a guild.
///
/// Each member's XP is clamped at zero, their level is recomputed, one
/// ledger entry per member records the requested deduction, and badge sets
/// are re-derived. The whole sweep runs in a single transaction.
///
/// Request Body: `PenalizeGuildPayload`
///
/// Returns (wrapped in `ApiResponse`)
/// * `Vec<i64>`: IDs of the penalized students (200 OK).
/// * `400 Bad Request`: If the amount is not a positive number.
/// * `404 Not Found`: If the guild does not exist.
#[instrument(skip(state, payload))]
pub async fn penalize_guild(
    State(state): State<AppState>,
    Path(guild_id): Path<i64>,
    Json(payload): Json<PenalizeGuildPayload>,
) -> Result<ApiResponse<Vec<i64>>, AppError> {
    info!(
        "Applying guild penalty of {} XP to guild {}",
        payload.amount, guild_id
    );
    debug!("Penalize guild payload: {:?}", payload);

    if payload.amount <= 0 {
        return Err(AppError::BadRequest(
            "Penalty amount must be a positive number of XP.".to_string(),
        ));
    }

    let guild_name = helper::run_query(&state.pool, move |conn| {
        guilds_dsl::guilds
            .find(guild_id)
            .select(guilds_dsl::name)
            .first::<String>(conn)
            .optional()
    })
    .await?;

    let Some(guild_name) = guild_name else {
        return Err(AppError::NotFound(format!(
            "Guild with ID {} not found.",
            guild_id
        )));
    };

    let amount = payload.amount;
    let reason = payload
        .reason
        .unwrap_or_else(|| format!("Guild penalty of {} XP applied to '{}'", amount, guild_name));
    let tiers = state.badge_tiers.clone();

    let conn = state.pool.get().await?;
    let penalized: Result<Vec<i64>, AppError> = conn
        .interact(move |conn_sync| {
            conn_sync.transaction(|tx_conn| {
                let member_ids = students_dsl::students
                    .filter(students_dsl::guild_id.eq(guild_id))
                    .select(students_dsl::id)
                    .load::<i64>(tx_conn)?;

                for &student_id in &member_ids {
                    ledger::apply_xp_delta(
                        tx_conn,
                        student_id,
                        -amount,
                        ledger::txn::GUILD_PENALTY,
                        &reason,
                        Some(EntityRef::Guild(guild_id)),
                    )?;
                    ledger::recompute_badges(tx_conn, &tiers, student_id)?;
                }

                Ok(member_ids)
            })
        })
        .await?;

    let member_ids = penalized?;
    info!(
        "Guild penalty applied to {} members of guild {}",
        member_ids.len(),
        guild_id
    );
    Ok(ApiResponse::ok(member_ids))
}

// students

/// Creates a new student, optionally assigning a guild by name.
///
/// The badge set is derived from the initial XP inside the same
/// transaction, so a freshly created student already satisfies the
/// level/badge invariants.
///
/// Request Body: `CreateStudentPayload`
///
/// Returns (wrapped in `ApiResponse`)
/// * `StudentResponse` (201 Created).
/// * `400 Bad Request`: If initial XP or academic score is negative.
/// * `404 Not Found`: If the named guild does not exist.
#[instrument(skip(state, payload))]
pub async fn create_student(
    State(state): State<AppState>,
    Json(payload): Json<CreateStudentPayload>,
) -> Result<ApiResponse<StudentResponse>, AppError> {
    info!("Creating student '{}'", payload.name);
    debug!("Create student payload: {:?}", payload);

    if payload.xp < 0 {
        return Err(AppError::BadRequest(
            "Initial XP cannot be negative.".to_string(),
        ));
    }
    if payload.academic_score < 0.0 {
        return Err(AppError::BadRequest(
            "Academic score cannot be negative.".to_string(),
        ));
    }

    let guild_id = match payload.guild_name.clone() {
        Some(guild_name) => {
            let lookup_name = guild_name.clone();
            let found = helper::run_query(&state.pool, move |conn| {
                guilds_dsl::guilds
                    .filter(guilds_dsl::name.eq(lookup_name))
                    .select(guilds_dsl::id)
                    .first::<i64>(conn)
                    .optional()
            })
            .await?;
            match found {
                Some(id) => Some(id),
                None => {
                    return Err(AppError::NotFound(format!(
                        "Guild '{}' not found.",
                        guild_name
                    )));
                }
            }
        }
        None => None,
    };

    let new_student = NewStudent {
        name: payload.name,
        nickname: payload.nickname,
        guild_id,
        xp: payload.xp,
        level: ledger::level_for_xp(payload.xp),
        total_points: payload.total_points,
        academic_score: payload.academic_score,
        badges: json!(payload.badges.unwrap_or_default()),
    };
    let tiers = state.badge_tiers.clone();

    let conn = state.pool.get().await?;
    let created: Result<StudentResponse, AppError> = conn
        .interact(move |conn_sync| {
            conn_sync.transaction(|tx_conn| {
                let student_id = diesel::insert_into(students_dsl::students)
                    .values(&new_student)
                    .returning(students_dsl::id)
                    .get_result::<i64>(tx_conn)?;

                ledger::recompute_badges(tx_conn, &tiers, student_id)?;

                Ok(helper::load_student_response(tx_conn, student_id)?)
            })
        })
        .await?;

    let student = created?;
    info!(
        "Successfully created student '{}' with ID {}",
        student.name, student.id
    );
    Ok(ApiResponse::created(student))
}

/// Lists all students with guild and class names resolved.
#[instrument(skip(state))]
pub async fn list_students(
    State(state): State<AppState>,
) -> Result<ApiResponse<Vec<StudentResponse>>, AppError> {
    info!("Listing all students");

    let students = helper::run_query(&state.pool, move |conn| {
        students_dsl::students
            .left_join(guilds_dsl::guilds.left_join(classes_dsl::classes))
            .order_by(students_dsl::id.asc())
            .select((
                crate::schema::students::all_columns,
                guilds_dsl::name.nullable(),
                classes_dsl::name.nullable(),
            ))
            .load::<(StudentRecord, Option<String>, Option<String>)>(conn)
    })
    .await?
    .into_iter()
    .map(|(record, guild_name, class_name)| {
        StudentResponse::from_record(record, guild_name, class_name)
    })
    .collect::<Vec<_>>();

    info!("Successfully fetched {} students", students.len());
    Ok(ApiResponse::ok(students))
}

/// Retrieves one student by ID.
#[instrument(skip(state))]
pub async fn get_student(
    State(state): State<AppState>,
    Path(student_id): Path<i64>,
) -> Result<ApiResponse<StudentResponse>, AppError> {
    info!("Fetching student with ID {}", student_id);

    let student = helper::run_query(&state.pool, move |conn| {
        helper::load_student_response(conn, student_id).optional()
    })
    .await?;

    match student {
        Some(student) => Ok(ApiResponse::ok(student)),
        None => Err(AppError::NotFound(format!(
            "Student with ID {} not found.",
            student_id
        ))),
    }
}

/// Searches students by partial name (case-insensitive).
///
/// Returns (wrapped in `ApiResponse`)
/// * `Vec<StudentResponse>`: All matches (200 OK).
/// * `404 Not Found`: If nothing matches.
#[instrument(skip(state))]
pub async fn search_students(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<ApiResponse<Vec<StudentResponse>>, AppError> {
    info!("Searching students by name fragment '{}'", name);

    let pattern = format!("%{}%", name);
    let matches = helper::run_query(&state.pool, move |conn| {
        students_dsl::students
            .left_join(guilds_dsl::guilds.left_join(classes_dsl::classes))
            .filter(students_dsl::name.ilike(pattern))
            .order_by(students_dsl::id.asc())
            .select((
                crate::schema::students::all_columns,
                guilds_dsl::name.nullable(),
                classes_dsl::name.nullable(),
            ))
            .load::<(StudentRecord, Option<String>, Option<String>)>(conn)
    })
    .await?
    .into_iter()
    .map(|(record, guild_name, class_name)| {
        StudentResponse::from_record(record, guild_name, class_name)
    })
    .collect::<Vec<_>>();

    if matches.is_empty() {
        return Err(AppError::NotFound(format!(
            "No student found matching '{}'.",
            name
        )));
    }

    Ok(ApiResponse::ok(matches))
}

/// Updates a student with a sparse set of field changes.
///
/// Point fields are replaced, not incremented: for each of `xp`,
/// `total_points` and `academic_score` the difference against the stored
/// value is computed and, when nonzero, recorded as one ledger entry with a
/// `manual_adjustment_*` kind and the supplied reason. A caller-supplied
/// badge list overrides tier derivation; when `xp` changed, badges are
/// re-derived afterwards. Everything runs in one transaction.
///
/// Request Body: `UpdateStudentPayload`
///
/// Returns (wrapped in `ApiResponse`)
/// * `StudentResponse` (200 OK).
/// * `400 Bad Request`: If `xp` or `academic_score` would become negative.
/// * `404 Not Found`: If the student or the target guild does not exist.
#[instrument(skip(state, payload))]
pub async fn update_student(
    State(state): State<AppState>,
    Path(student_id): Path<i64>,
    Json(payload): Json<UpdateStudentPayload>,
) -> Result<ApiResponse<StudentResponse>, AppError> {
    info!("Updating student with ID {}", student_id);
    debug!("Update student payload: {:?}", payload);

    if let Some(new_xp) = payload.xp {
        if new_xp < 0 {
            return Err(AppError::BadRequest(
                "XP cannot be set to a negative value.".to_string(),
            ));
        }
    }
    if let Some(new_score) = payload.academic_score {
        if new_score < 0.0 {
            return Err(AppError::BadRequest(
                "Academic score cannot be set to a negative value.".to_string(),
            ));
        }
    }

    let tiers = state.badge_tiers.clone();
    let conn = state.pool.get().await?;
    let updated: Result<StudentResponse, AppError> = conn
        .interact(move |conn_sync| {
            conn_sync.transaction(|tx_conn| {
                let current = students_dsl::students
                    .find(student_id)
                    .first::<StudentRecord>(tx_conn)
                    .optional()?;
                let Some(current) = current else {
                    return Err(AppError::NotFound(format!(
                        "Student with ID {} not found.",
                        student_id
                    )));
                };

                if let Some(guild_id) = payload.guild_id {
                    let guild_exists =
                        diesel::select(exists(guilds_dsl::guilds.find(guild_id)))
                            .get_result::<bool>(tx_conn)?;
                    if !guild_exists {
                        return Err(AppError::NotFound(format!(
                            "Guild with ID {} not found.",
                            guild_id
                        )));
                    }
                }

                let changeset = StudentChangeset {
                    name: payload.name.clone(),
                    nickname: payload.nickname.clone(),
                    guild_id: payload.guild_id,
                    xp: payload.xp,
                    level: payload.xp.map(ledger::level_for_xp),
                    total_points: payload.total_points,
                    academic_score: payload.academic_score,
                    badges: payload.badges.clone().map(|list| json!(list)),
                };

                let has_changes = changeset.name.is_some()
                    || changeset.nickname.is_some()
                    || changeset.guild_id.is_some()
                    || changeset.xp.is_some()
                    || changeset.total_points.is_some()
                    || changeset.academic_score.is_some()
                    || changeset.badges.is_some();
                if has_changes {
                    diesel::update(students_dsl::students.find(student_id))
                        .set(&changeset)
                        .execute(tx_conn)?;
                }

                let reason = payload
                    .reason
                    .clone()
                    .unwrap_or_else(|| DEFAULT_UPDATE_REASON.to_string());
                let student_ref = EntityRef::Student(student_id);

                if let Some(new_xp) = payload.xp {
                    let xp_change = new_xp - current.xp;
                    if xp_change != 0 {
                        ledger::record_entry(
                            tx_conn,
                            NewLedgerEntry {
                                student_id,
                                kind: ledger::txn::MANUAL_ADJUSTMENT_XP.to_string(),
                                xp_delta: xp_change,
                                points_delta: 0.0,
                                reason: reason.clone(),
                                entity_kind: Some(student_ref.kind().to_string()),
                                entity_id: Some(student_ref.id()),
                            },
                        )?;
                    }
                }

                if let Some(new_total) = payload.total_points {
                    let points_change = new_total - current.total_points;
                    if points_change != 0 {
                        ledger::record_entry(
                            tx_conn,
                            NewLedgerEntry {
                                student_id,
                                kind: ledger::txn::MANUAL_ADJUSTMENT_TOTAL_POINTS.to_string(),
                                xp_delta: 0,
                                points_delta: points_change as f64,
                                reason: reason.clone(),
                                entity_kind: Some(student_ref.kind().to_string()),
                                entity_id: Some(student_ref.id()),
                            },
                        )?;
                    }
                }

                if let Some(new_score) = payload.academic_score {
                    if !approx_eq!(f64, new_score, current.academic_score, ulps = 2) {
                        ledger::record_entry(
                            tx_conn,
                            NewLedgerEntry {
                                student_id,
                                kind: ledger::txn::MANUAL_ADJUSTMENT_ACADEMIC_SCORE.to_string(),
                                xp_delta: 0,
                                points_delta: new_score - current.academic_score,
                                reason: reason.clone(),
                                entity_kind: Some(student_ref.kind().to_string()),
                                entity_id: Some(student_ref.id()),
                            },
                        )?;
                    }
                }

                if payload.xp.is_some() {
                    ledger::recompute_badges(tx_conn, &tiers, student_id)?;
                }

                Ok(helper::load_student_response(tx_conn, student_id)?)
            })
        })
        .await?;

    let student = updated?;
    info!("Successfully updated student {}", student_id);
    Ok(ApiResponse::ok(student))
}

/// Deletes a student along with their enrollments and ledger entries.
///
/// Returns (wrapped in `ApiResponse`)
/// * `StudentResponse`: The record as it was before deletion (200 OK).
/// * `404 Not Found`: If the student does not exist.
#[instrument(skip(state))]
pub async fn delete_student(
    State(state): State<AppState>,
    Path(student_id): Path<i64>,
) -> Result<ApiResponse<StudentResponse>, AppError> {
    info!("Attempting to DELETE student {}", student_id);

    let student = helper::run_query(&state.pool, move |conn| {
        helper::load_student_response(conn, student_id).optional()
    })
    .await?;

    let Some(student) = student else {
        return Err(AppError::NotFound(format!(
            "Student with ID {} not found.",
            student_id
        )));
    };

    let conn = state.pool.get().await?;
    let deletion_result: Result<(), AppError> = conn
        .interact(move |conn_sync| {
            conn_sync.transaction(|tx_conn| {
                diesel::delete(
                    ledger_dsl::ledger_entries.filter(ledger_dsl::student_id.eq(student_id)),
                )
                .execute(tx_conn)?;
                diesel::delete(
                    enroll_dsl::enrollments.filter(enroll_dsl::student_id.eq(student_id)),
                )
                .execute(tx_conn)?;

                let deleted = diesel::delete(students_dsl::students.find(student_id))
                    .execute(tx_conn)?;
                if deleted == 1 {
                    Ok(())
                } else {
                    Err(AppError::NotFound(format!(
                        "Student {} not found during final delete step.",
                        student_id
                    )))
                }
            })
        })
        .await?;

    deletion_result?;
    info!("Successfully deleted student {}", student_id);
    Ok(ApiResponse::ok(student))
}

/// Subtracts a positive XP magnitude from a student.
///
/// XP is clamped at zero; the ledger entry records the requested
/// deduction. Level and badges are re-derived in the same transaction.
///
/// Request Body: `DeductXpPayload`
///
/// Returns (wrapped in `ApiResponse`)
/// * `StudentResponse` (200 OK).
/// * `400 Bad Request`: If the amount is not a positive number.
/// * `404 Not Found`: If the student does not exist.
#[instrument(skip(state, payload))]
pub async fn deduct_xp(
    State(state): State<AppState>,
    Path(student_id): Path<i64>,
    Json(payload): Json<DeductXpPayload>,
) -> Result<ApiResponse<StudentResponse>, AppError> {
    info!(
        "Deducting {} XP from student {}",
        payload.amount, student_id
    );
    debug!("Deduct XP payload: {:?}", payload);

    if payload.amount <= 0 {
        return Err(AppError::BadRequest(
            "XP deduction amount must be a positive number.".to_string(),
        ));
    }

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

    let amount = payload.amount;
    let reason = payload
        .reason
        .unwrap_or_else(|| format!("Manual deduction of {} XP", amount));
    let tiers = state.badge_tiers.clone();

    let conn = state.pool.get().await?;
    let updated: Result<StudentResponse, AppError> = conn
        .interact(move |conn_sync| {
            conn_sync.transaction(|tx_conn| {
                ledger::apply_xp_delta(
                    tx_conn,
                    student_id,
                    -amount,
                    ledger::txn::MANUAL_XP_DEDUCTION,
                    &reason,
                    Some(EntityRef::Student(student_id)),
                )?;
                ledger::recompute_badges(tx_conn, &tiers, student_id)?;
                Ok(helper::load_student_response(tx_conn, student_id)?)
            })
        })
        .await?;

    updated.map(ApiResponse::ok)
}

/// Manually grants a badge to a student, outside tier derivation.
///
/// A no-op when the badge is already held (no ledger entry is written).
///
/// Request Body: `AwardBadgePayload`
#[instrument(skip(state, payload))]
pub async fn award_badge(
    State(state): State<AppState>,
    Path(student_id): Path<i64>,
    Json(payload): Json<AwardBadgePayload>,
) -> Result<ApiResponse<StudentResponse>, AppError> {
    info!(
        "Awarding badge '{}' to student {}",
        payload.badge_name, student_id
    );

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

    let badge_name = payload.badge_name;
    let reason = payload
        .reason
        .unwrap_or_else(|| format!("Manual grant of badge '{}'", badge_name));

    let conn = state.pool.get().await?;
    let updated: Result<StudentResponse, AppError> = conn
        .interact(move |conn_sync| {
            conn_sync.transaction(|tx_conn| {
                let granted = ledger::grant_badge(tx_conn, student_id, &badge_name)?;
                if granted {
                    ledger::record_entry(
                        tx_conn,
                        NewLedgerEntry {
                            student_id,
                            kind: ledger::txn::BADGE_GRANT.to_string(),
                            xp_delta: 0,
                            points_delta: 0.0,
                            reason,
                            entity_kind: Some("badge".to_string()),
                            entity_id: None,
                        },
                    )?;
                }
                Ok(helper::load_student_response(tx_conn, student_id)?)
            })
        })
        .await?;

    updated.map(ApiResponse::ok)
}

/// Adds an activity's academic points to a student, looked up by the
/// activity code. Used when crediting quest points outside the enrollment
/// completion flow.
///
/// Request Body: `AddQuestPointsPayload`
#[instrument(skip(state, payload))]
pub async fn add_quest_points(
    State(state): State<AppState>,
    Path(student_id): Path<i64>,
    Json(payload): Json<AddQuestPointsPayload>,
) -> Result<ApiResponse<StudentResponse>, AppError> {
    info!(
        "Adding academic points from activity '{}' to student {}",
        payload.activity_code, student_id
    );

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

    let code = payload.activity_code.clone();
    let activity = helper::run_query(&state.pool, move |conn| {
        activities_dsl::activities
            .filter(activities_dsl::code.eq(code))
            .select((
                activities_dsl::id,
                activities_dsl::name,
                activities_dsl::points_on_completion,
            ))
            .first::<(i64, String, f64)>(conn)
            .optional()
    })
    .await?;

    let Some((activity_id, activity_name, points)) = activity else {
        return Err(AppError::NotFound(format!(
            "Activity with code '{}' not found.",
            payload.activity_code
        )));
    };

    let reason = payload.reason.unwrap_or_else(|| {
        format!(
            "Academic points for activity '{}' ({})",
            activity_name, payload.activity_code
        )
    });

    let conn = state.pool.get().await?;
    let updated: Result<StudentResponse, AppError> = conn
        .interact(move |conn_sync| {
            conn_sync.transaction(|tx_conn| {
                ledger::apply_academic_score_delta(
                    tx_conn,
                    student_id,
                    points,
                    ledger::txn::MANUAL_ACADEMIC_GAIN,
                    &reason,
                    Some(EntityRef::Activity(activity_id)),
                )?;
                Ok(helper::load_student_response(tx_conn, student_id)?)
            })
        })
        .await?;

    updated.map(ApiResponse::ok)
}

/// Returns the full point/XP history of a student, newest entries first.
#[instrument(skip(state))]
pub async fn student_history(
    State(state): State<AppState>,
    Path(student_id): Path<i64>,
) -> Result<ApiResponse<Vec<LedgerEntryResponse>>, AppError> {
    info!("Fetching ledger history for student {}", student_id);

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

    let entries = helper::run_query(&state.pool, move |conn| {
        ledger_dsl::ledger_entries
            .filter(ledger_dsl::student_id.eq(student_id))
            .order_by(ledger_dsl::created_at.desc())
            .load::<LedgerEntryResponse>(conn)
    })
    .await?;

    info!(
        "Fetched {} ledger entries for student {}",
        entries.len(),
        student_id
    );
    Ok(ApiResponse::ok(entries))
}

/// Ranks students by XP, highest first.
///
/// Query Parameters:
/// * `limit`: Maximum number of entries (default 10).
#[instrument(skip(state, params))]
pub async fn leaderboard(
    State(state): State<AppState>,
    Query(params): Query<LeaderboardParams>,
) -> Result<ApiResponse<Vec<StudentResponse>>, AppError> {
    info!("Computing student leaderboard (limit {})", params.limit);

    let limit = params.limit;
    let students = helper::run_query(&state.pool, move |conn| {
        students_dsl::students
            .left_join(guilds_dsl::guilds.left_join(classes_dsl::classes))
            .order_by(students_dsl::xp.desc())
            .limit(limit)
            .select((
                crate::schema::students::all_columns,
                guilds_dsl::name.nullable(),
                classes_dsl::name.nullable(),
            ))
            .load::<(StudentRecord, Option<String>, Option<String>)>(conn)
    })
    .await?
    .into_iter()
    .map(|(record, guild_name, class_name)| {
        StudentResponse::from_record(record, guild_name, class_name)
    })
    .collect::<Vec<_>>();

    Ok(ApiResponse::ok(students))
}

use crate::errors::AppError;
use crate::model::students::{StudentRecord, StudentResponse};
use crate::schema::{
    classes::dsl as classes_dsl, guilds::dsl as guilds_dsl, students::dsl as students_dsl,
};
use diesel::PgConnection;
use diesel::prelude::*;
use tracing::log::{debug, error};

pub(super) async fn run_query<T, F>(
    pool: &deadpool_diesel::postgres::Pool,
    query: F,
) -> Result<T, AppError>
where
    F: FnOnce(&mut diesel::PgConnection) -> Result<T, diesel::result::Error> + Send + 'static,
    T: Send + 'static,
{
    let conn = pool.get().await?;
    debug!("DB connection object obtained from pool for interaction");

    let res = conn.interact(query).await;

    match res {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(diesel_err)) => {
            error!("Diesel query failed within interaction: {:?}", diesel_err);
            Err(AppError::from(diesel_err))
        }
        Err(interact_err) => {
            error!("Deadpool interact error: {:?}", interact_err);
            Err(AppError::from(interact_err))
        }
    }
}

/// Loads one student row together with its guild and class names.
pub(super) fn student_with_names(
    conn: &mut PgConnection,
    student_id: i64,
) -> Result<(StudentRecord, Option<String>, Option<String>), diesel::result::Error> {
    students_dsl::students
        .left_join(guilds_dsl::guilds.left_join(classes_dsl::classes))
        .filter(students_dsl::id.eq(student_id))
        .select((
            crate::schema::students::all_columns,
            guilds_dsl::name.nullable(),
            classes_dsl::name.nullable(),
        ))
        .first::<(StudentRecord, Option<String>, Option<String>)>(conn)
}

pub(super) fn load_student_response(
    conn: &mut PgConnection,
    student_id: i64,
) -> Result<StudentResponse, diesel::result::Error> {
    let (record, guild_name, class_name) = student_with_names(conn, student_id)?;
    Ok(StudentResponse::from_record(record, guild_name, class_name))
}

use crate::schema::activities;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Insertable, Debug)]
#[diesel(table_name = activities)]
pub struct NewActivity {
    pub name: String,
    pub code: String,
    pub description: String,
    pub xp_on_completion: i32,
    pub points_on_completion: f64,
}

/// Partial update applied by code; `None` fields are left untouched.
/// The code itself is immutable once created.
#[derive(AsChangeset, Debug, Default)]
#[diesel(table_name = activities)]
pub struct ActivityChangeset {
    pub name: Option<String>,
    pub description: Option<String>,
    pub xp_on_completion: Option<i32>,
    pub points_on_completion: Option<f64>,
}

#[derive(Serialize, Deserialize, Debug, Queryable)]
pub struct ActivityResponse {
    pub id: i64,
    pub name: String,
    pub code: String,
    pub description: String,
    pub xp_on_completion: i32,
    pub points_on_completion: f64,
}

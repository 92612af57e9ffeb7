use crate::schema::classes;
use crate::schema::guilds;
use crate::schema::ledger_entries;
use crate::schema::students;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

#[derive(Insertable, Debug)]
#[diesel(table_name = classes)]
pub struct NewClass {
    pub name: String,
    pub year: Option<i32>,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = guilds)]
pub struct NewGuild {
    pub name: String,
    pub class_id: i64,
}

#[derive(AsChangeset, Debug, Default)]
#[diesel(table_name = classes)]
pub struct ClassChangeset {
    pub name: Option<String>,
    pub year: Option<i32>,
}

#[derive(AsChangeset, Debug, Default)]
#[diesel(table_name = guilds)]
pub struct GuildChangeset {
    pub name: Option<String>,
    pub class_id: Option<i64>,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = students)]
pub struct NewStudent {
    pub name: String,
    pub nickname: Option<String>,
    pub guild_id: Option<i64>,
    pub xp: i32,
    pub level: i32,
    pub total_points: i32,
    pub academic_score: f64,
    pub badges: JsonValue,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = ledger_entries)]
pub struct NewLedgerEntry {
    pub student_id: i64,
    pub kind: String,
    pub xp_delta: i32,
    pub points_delta: f64,
    pub reason: String,
    pub entity_kind: Option<String>,
    pub entity_id: Option<i64>,
    // created_at has a DB default (CURRENT_TIMESTAMP)
}

/// Sparse PATCH-by-replacement changeset; `None` fields are left untouched.
#[derive(AsChangeset, Debug, Default)]
#[diesel(table_name = students)]
pub struct StudentChangeset {
    pub name: Option<String>,
    pub nickname: Option<String>,
    pub guild_id: Option<i64>,
    pub xp: Option<i32>,
    pub level: Option<i32>,
    pub total_points: Option<i32>,
    pub academic_score: Option<f64>,
    pub badges: Option<JsonValue>,
}

/// Full row of the `students` table, in column order.
#[derive(Queryable, Debug, Clone)]
pub struct StudentRecord {
    pub id: i64,
    pub name: String,
    pub nickname: Option<String>,
    pub guild_id: Option<i64>,
    pub xp: i32,
    pub level: i32,
    pub total_points: i32,
    pub academic_score: f64,
    pub badges: JsonValue,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct StudentResponse {
    pub id: i64,
    pub name: String,
    pub nickname: Option<String>,
    pub guild_id: Option<i64>,
    pub guild_name: Option<String>,
    pub class_name: Option<String>,
    pub xp: i32,
    pub level: i32,
    pub total_points: i32,
    pub academic_score: f64,
    pub badges: Vec<String>,
}

impl StudentResponse {
    pub fn from_record(
        record: StudentRecord,
        guild_name: Option<String>,
        class_name: Option<String>,
    ) -> Self {
        let badges = record
            .badges
            .as_array()
            .map(|array| {
                array
                    .iter()
                    .filter_map(|value| value.as_str().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default();

        StudentResponse {
            id: record.id,
            name: record.name,
            nickname: record.nickname,
            guild_id: record.guild_id,
            guild_name,
            class_name,
            xp: record.xp,
            level: record.level,
            total_points: record.total_points,
            academic_score: record.academic_score,
            badges,
        }
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub struct GuildResponse {
    pub id: i64,
    pub name: String,
    pub class_id: i64,
    pub class_name: String,
    pub students: Vec<StudentResponse>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct ClassResponse {
    pub id: i64,
    pub name: String,
    pub year: Option<i32>,
    pub guilds: Vec<GuildResponse>,
}

#[derive(Serialize, Deserialize, Debug, Queryable)]
pub struct LedgerEntryResponse {
    pub id: i64,
    pub student_id: i64,
    pub kind: String,
    pub xp_delta: i32,
    pub points_delta: f64,
    pub reason: String,
    pub entity_kind: Option<String>,
    pub entity_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct GuildLeaderboardEntry {
    pub guild_id: i64,
    pub guild_name: String,
    pub class_name: String,
    pub total_xp: i64,
}

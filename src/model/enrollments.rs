use crate::schema::enrollments;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

pub const STATUS_STARTED: &str = "started";
pub const STATUS_COMPLETED: &str = "completed";

#[derive(Insertable, Debug)]
#[diesel(table_name = enrollments)]
pub struct NewEnrollment {
    pub student_id: i64,
    pub activity_id: i64,
    pub status: String,
    pub score_in_quest: i32,
}

#[derive(Serialize, Deserialize, Debug, Queryable)]
pub struct EnrollmentResponse {
    pub id: i64,
    pub student_id: i64,
    pub activity_id: i64,
    pub status: String,
    pub score_in_quest: i32,
}

/// Quests a single student is enrolled in, by activity name.
#[derive(Serialize, Deserialize, Debug)]
pub struct StudentEnrollmentsResponse {
    pub student: String,
    pub activities: Vec<String>,
}

/// Roster of students enrolled in one activity, by student name.
#[derive(Serialize, Deserialize, Debug)]
pub struct ActivityRosterResponse {
    pub activity: String,
    pub students: Vec<String>,
}

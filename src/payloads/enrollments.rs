use serde::Deserialize;

#[derive(Deserialize, Debug)]
pub struct CreateEnrollmentPayload {
    pub student_id: i64,
    pub activity_id: i64,
}

#[derive(Deserialize, Debug)]
pub struct CompleteEnrollmentParams {
    /// Final score earned in the quest; also added to the student's
    /// total points.
    pub score: i32,
}

#[derive(Deserialize, Debug)]
pub struct BulkCompletePayload {
    pub guild_id: i64,
    pub activity_code: String,
    pub score: i32,
}

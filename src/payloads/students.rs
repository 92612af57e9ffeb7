use serde::Deserialize;

#[derive(Deserialize, Debug)]
pub struct CreateClassPayload {
    pub name: String,
    pub year: Option<i32>,
}

#[derive(Deserialize, Debug)]
pub struct UpdateClassPayload {
    pub name: Option<String>,
    pub year: Option<i32>,
}

#[derive(Deserialize, Debug)]
pub struct CreateGuildPayload {
    pub name: String,
    pub class_id: i64,
}

#[derive(Deserialize, Debug)]
pub struct UpdateGuildPayload {
    pub name: Option<String>,
    pub class_id: Option<i64>,
}

#[derive(Deserialize, Debug)]
pub struct CreateStudentPayload {
    pub name: String,
    pub nickname: Option<String>,
    /// Guild membership is assigned by guild name, not id.
    pub guild_name: Option<String>,
    #[serde(default)]
    pub xp: i32,
    #[serde(default)]
    pub total_points: i32,
    #[serde(default)]
    pub academic_score: f64,
    pub badges: Option<Vec<String>>,
}

#[derive(Deserialize, Debug)]
pub struct UpdateStudentPayload {
    pub name: Option<String>,
    pub nickname: Option<String>,
    pub guild_id: Option<i64>,
    pub xp: Option<i32>,
    pub total_points: Option<i32>,
    pub academic_score: Option<f64>,
    /// A caller-supplied badge list wins over tier derivation.
    pub badges: Option<Vec<String>>,
    /// Recorded on the ledger entries written for changed point fields.
    pub reason: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct DeductXpPayload {
    /// Positive magnitude to subtract.
    pub amount: i32,
    pub reason: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct PenalizeGuildPayload {
    /// Positive magnitude subtracted from every member.
    pub amount: i32,
    pub reason: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct AwardBadgePayload {
    pub badge_name: String,
    pub reason: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct AddQuestPointsPayload {
    pub activity_code: String,
    pub reason: Option<String>,
}

fn default_leaderboard_limit() -> i64 {
    10
}

#[derive(Deserialize, Debug)]
pub struct LeaderboardParams {
    #[serde(default = "default_leaderboard_limit")]
    pub limit: i64,
}

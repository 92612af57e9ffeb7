use serde::Deserialize;

#[derive(Deserialize, Debug)]
pub struct CreateActivityPayload {
    pub name: String,
    pub code: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub xp_on_completion: i32,
    #[serde(default)]
    pub points_on_completion: f64,
}

#[derive(Deserialize, Debug)]
pub struct UpdateActivityPayload {
    pub name: Option<String>,
    pub description: Option<String>,
    pub xp_on_completion: Option<i32>,
    pub points_on_completion: Option<f64>,
}

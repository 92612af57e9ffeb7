use axum::http::StatusCode;
use classquest_server::model::activities::ActivityResponse;
use classquest_server::response::ApiResponse;
use serde_json::{Value, json};

mod helpers;
use helpers::{create_test_activity, setup_test_environment};

// create_activity

#[tokio::test]
async fn test_create_activity_success() {
    let (server, _pool) = setup_test_environment().await;

    let response = server
        .post("/activities")
        .json(&json!({
            "name": "Algebra Quest",
            "code": "ALG-1",
            "description": "Solve the equation set",
            "xp_on_completion": 150,
            "points_on_completion": 2.5
        }))
        .await;

    assert_eq!(response.status_code(), StatusCode::CREATED);
    let body: ApiResponse<ActivityResponse> = response.json();
    assert_eq!(body.status_code, 201);
    let activity = body.data.unwrap();
    assert_eq!(activity.code, "ALG-1");
    assert_eq!(activity.xp_on_completion, 150);
    assert!((activity.points_on_completion - 2.5).abs() < f64::EPSILON);
}

#[tokio::test]
async fn test_create_activity_defaults_rewards_to_zero() {
    let (server, _pool) = setup_test_environment().await;

    let response = server
        .post("/activities")
        .json(&json!({"name": "Reading Circle", "code": "RC-1"}))
        .await;

    assert_eq!(response.status_code(), StatusCode::CREATED);
    let body: ApiResponse<ActivityResponse> = response.json();
    let activity = body.data.unwrap();
    assert_eq!(activity.xp_on_completion, 0);
    assert_eq!(activity.points_on_completion, 0.0);
}

#[tokio::test]
async fn test_create_activity_conflict_duplicate_code() {
    let (server, pool) = setup_test_environment().await;
    create_test_activity(&pool, "Algebra Quest", "ALG-1", 150, 2.5).await;

    let response = server
        .post("/activities")
        .json(&json!({"name": "Another Quest", "code": "ALG-1"}))
        .await;

    assert_eq!(response.status_code(), StatusCode::CONFLICT);
    let body: ApiResponse<Value> = response.json();
    assert!(body.status_message.contains("already exists"));
}

#[tokio::test]
async fn test_create_activity_rejects_negative_rewards() {
    let (server, _pool) = setup_test_environment().await;

    let response = server
        .post("/activities")
        .json(&json!({"name": "Bad Quest", "code": "BAD-1", "xp_on_completion": -10}))
        .await;

    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
}

// list / get

#[tokio::test]
async fn test_list_activities() {
    let (server, pool) = setup_test_environment().await;
    create_test_activity(&pool, "Algebra Quest", "ALG-1", 150, 2.5).await;
    create_test_activity(&pool, "Reading Circle", "RC-1", 50, 0.0).await;

    let response = server.get("/activities").await;

    assert_eq!(response.status_code(), StatusCode::OK);
    let body: ApiResponse<Vec<ActivityResponse>> = response.json();
    assert_eq!(body.data.unwrap().len(), 2);
}

#[tokio::test]
async fn test_get_activity_by_code() {
    let (server, pool) = setup_test_environment().await;
    create_test_activity(&pool, "Algebra Quest", "ALG-1", 150, 2.5).await;

    let response = server.get("/activities/ALG-1").await;

    assert_eq!(response.status_code(), StatusCode::OK);
    let body: ApiResponse<ActivityResponse> = response.json();
    assert_eq!(body.data.unwrap().name, "Algebra Quest");
}

#[tokio::test]
async fn test_get_activity_unknown_code() {
    let (server, _pool) = setup_test_environment().await;

    let response = server.get("/activities/NOPE").await;

    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
}

// update_activity

#[tokio::test]
async fn test_update_activity_changes_rewards() {
    let (server, pool) = setup_test_environment().await;
    create_test_activity(&pool, "Algebra Quest", "ALG-1", 150, 2.5).await;

    let response = server
        .put("/activities/ALG-1")
        .json(&json!({"xp_on_completion": 200, "description": "Harder equation set"}))
        .await;

    assert_eq!(response.status_code(), StatusCode::OK);
    let body: ApiResponse<ActivityResponse> = response.json();
    let activity = body.data.unwrap();
    assert_eq!(activity.xp_on_completion, 200);
    assert_eq!(activity.description, "Harder equation set");
    // untouched fields are preserved
    assert_eq!(activity.name, "Algebra Quest");
}

#[tokio::test]
async fn test_update_activity_unknown_code() {
    let (server, _pool) = setup_test_environment().await;

    let response = server
        .put("/activities/NOPE")
        .json(&json!({"name": "Ghost"}))
        .await;

    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_update_activity_rejects_negative_rewards() {
    let (server, pool) = setup_test_environment().await;
    create_test_activity(&pool, "Algebra Quest", "ALG-1", 150, 2.5).await;

    let response = server
        .put("/activities/ALG-1")
        .json(&json!({"points_on_completion": -1.0}))
        .await;

    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
}

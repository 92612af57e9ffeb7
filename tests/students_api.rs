use axum::http::StatusCode;
use classquest_server::ledger::txn;
use classquest_server::model::students::{
    ClassResponse, GuildLeaderboardEntry, GuildResponse, LedgerEntryResponse, StudentResponse,
};
use classquest_server::response::ApiResponse;
use serde_json::{Value, json};

mod helpers;
use helpers::{
    badge_names, count_ledger_entries, count_ledger_entries_of_kind, count_table_rows,
    create_test_activity, create_test_class, create_test_enrollment, create_test_guild,
    create_test_ledger_entry, create_test_student, get_student_row, latest_xp_delta_of_kind,
    setup_test_environment,
};

// classes

#[tokio::test]
async fn test_create_class_success() {
    let (server, _pool) = setup_test_environment().await;

    let response = server
        .post("/classes")
        .json(&json!({"name": "Class 9A", "year": 2026}))
        .await;

    assert_eq!(response.status_code(), StatusCode::CREATED);
    let body: ApiResponse<ClassResponse> = response.json();
    assert_eq!(body.status_code, 201);
    let class = body.data.unwrap();
    assert_eq!(class.name, "Class 9A");
    assert_eq!(class.year, Some(2026));
    assert!(class.guilds.is_empty());
}

#[tokio::test]
async fn test_create_class_conflict_duplicate_name() {
    let (server, pool) = setup_test_environment().await;
    create_test_class(&pool, "Class 9A").await;

    let response = server
        .post("/classes")
        .json(&json!({"name": "Class 9A"}))
        .await;

    assert_eq!(response.status_code(), StatusCode::CONFLICT);
    let body: ApiResponse<Value> = response.json();
    assert!(body.status_message.contains("already exists"));
}

#[tokio::test]
async fn test_list_classes_nested_structure() {
    let (server, pool) = setup_test_environment().await;
    let class_id = create_test_class(&pool, "Class 9A").await;
    let guild_id = create_test_guild(&pool, class_id, "Red Dragons").await;
    create_test_student(&pool, Some(guild_id), "Alice Stone", 150).await;
    create_test_class(&pool, "Class 9B").await;

    let response = server.get("/classes").await;

    assert_eq!(response.status_code(), StatusCode::OK);
    let body: ApiResponse<Vec<ClassResponse>> = response.json();
    let classes = body.data.unwrap();
    assert_eq!(classes.len(), 2);
    let class_a = classes.iter().find(|c| c.id == class_id).unwrap();
    assert_eq!(class_a.guilds.len(), 1);
    assert_eq!(class_a.guilds[0].name, "Red Dragons");
    assert_eq!(class_a.guilds[0].students.len(), 1);
    assert_eq!(class_a.guilds[0].students[0].name, "Alice Stone");
    assert_eq!(class_a.guilds[0].students[0].class_name.as_deref(), Some("Class 9A"));
}

#[tokio::test]
async fn test_update_class_rename_conflict() {
    let (server, pool) = setup_test_environment().await;
    let class_id = create_test_class(&pool, "Class 9A").await;
    create_test_class(&pool, "Class 9B").await;

    let response = server
        .put(&format!("/classes/{}", class_id))
        .json(&json!({"name": "Class 9B"}))
        .await;

    assert_eq!(response.status_code(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_update_class_not_found() {
    let (server, _pool) = setup_test_environment().await;

    let response = server
        .put("/classes/9999")
        .json(&json!({"name": "Ghost Class"}))
        .await;

    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_delete_class_cascades_to_all_dependents() {
    let (server, pool) = setup_test_environment().await;
    let class_id = create_test_class(&pool, "Doomed Class").await;
    let guild_id = create_test_guild(&pool, class_id, "Doomed Guild").await;
    let student1 = create_test_student(&pool, Some(guild_id), "First Victim", 100).await;
    let student2 = create_test_student(&pool, Some(guild_id), "Second Victim", 200).await;
    let activity_id = create_test_activity(&pool, "Quest", "Q-1", 50, 0.0).await;
    create_test_enrollment(&pool, student1, activity_id, "started", 0).await;
    create_test_enrollment(&pool, student2, activity_id, "completed", 80).await;
    create_test_ledger_entry(&pool, student1, txn::QUEST_XP_GAIN).await;
    create_test_ledger_entry(&pool, student2, txn::MANUAL_XP_DEDUCTION).await;

    let response = server.delete(&format!("/classes/{}", class_id)).await;

    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(count_table_rows(&pool, "classes").await, 0);
    assert_eq!(count_table_rows(&pool, "guilds").await, 0);
    assert_eq!(count_table_rows(&pool, "students").await, 0);
    assert_eq!(count_table_rows(&pool, "enrollments").await, 0);
    assert_eq!(count_table_rows(&pool, "ledger_entries").await, 0);
}

// guilds

#[tokio::test]
async fn test_create_guild_success() {
    let (server, pool) = setup_test_environment().await;
    let class_id = create_test_class(&pool, "Class 9A").await;

    let response = server
        .post("/guilds")
        .json(&json!({"name": "Red Dragons", "class_id": class_id}))
        .await;

    assert_eq!(response.status_code(), StatusCode::CREATED);
    let body: ApiResponse<GuildResponse> = response.json();
    let guild = body.data.unwrap();
    assert_eq!(guild.name, "Red Dragons");
    assert_eq!(guild.class_name, "Class 9A");
    assert!(guild.students.is_empty());
}

#[tokio::test]
async fn test_create_guild_unknown_class() {
    let (server, _pool) = setup_test_environment().await;

    let response = server
        .post("/guilds")
        .json(&json!({"name": "Orphans", "class_id": 9999}))
        .await;

    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_create_guild_conflict_duplicate_name() {
    let (server, pool) = setup_test_environment().await;
    let class_id = create_test_class(&pool, "Class 9A").await;
    create_test_guild(&pool, class_id, "Red Dragons").await;

    let response = server
        .post("/guilds")
        .json(&json!({"name": "Red Dragons", "class_id": class_id}))
        .await;

    assert_eq!(response.status_code(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_update_guild_moves_to_other_class() {
    let (server, pool) = setup_test_environment().await;
    let class_a = create_test_class(&pool, "Class 9A").await;
    let class_b = create_test_class(&pool, "Class 9B").await;
    let guild_id = create_test_guild(&pool, class_a, "Nomads").await;

    let response = server
        .put(&format!("/guilds/{}", guild_id))
        .json(&json!({"class_id": class_b}))
        .await;

    assert_eq!(response.status_code(), StatusCode::OK);
    let body: ApiResponse<GuildResponse> = response.json();
    let guild = body.data.unwrap();
    assert_eq!(guild.class_id, class_b);
    assert_eq!(guild.class_name, "Class 9B");
}

#[tokio::test]
async fn test_delete_guild_cascades_to_members() {
    let (server, pool) = setup_test_environment().await;
    let class_id = create_test_class(&pool, "Class 9A").await;
    let guild_id = create_test_guild(&pool, class_id, "Doomed Guild").await;
    let student_id = create_test_student(&pool, Some(guild_id), "Member", 100).await;
    create_test_ledger_entry(&pool, student_id, txn::QUEST_XP_GAIN).await;

    let response = server.delete(&format!("/guilds/{}", guild_id)).await;

    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(count_table_rows(&pool, "guilds").await, 0);
    assert_eq!(count_table_rows(&pool, "students").await, 0);
    assert_eq!(count_table_rows(&pool, "ledger_entries").await, 0);
    // the class itself survives
    assert_eq!(count_table_rows(&pool, "classes").await, 1);
}

#[tokio::test]
async fn test_guild_leaderboard_sums_member_xp() {
    let (server, pool) = setup_test_environment().await;
    let class_id = create_test_class(&pool, "Class 9A").await;
    let strong = create_test_guild(&pool, class_id, "Strong Guild").await;
    let weak = create_test_guild(&pool, class_id, "Weak Guild").await;
    create_test_student(&pool, Some(strong), "A", 300).await;
    create_test_student(&pool, Some(strong), "B", 200).await;
    create_test_student(&pool, Some(weak), "C", 100).await;

    let response = server.get("/guilds/leaderboard").await;

    assert_eq!(response.status_code(), StatusCode::OK);
    let body: ApiResponse<Vec<GuildLeaderboardEntry>> = response.json();
    let entries = body.data.unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].guild_name, "Strong Guild");
    assert_eq!(entries[0].total_xp, 500);
    assert_eq!(entries[1].guild_name, "Weak Guild");
    assert_eq!(entries[1].total_xp, 100);
}

#[tokio::test]
async fn test_guild_leaderboard_empty_not_found() {
    let (server, _pool) = setup_test_environment().await;

    let response = server.get("/guilds/leaderboard").await;

    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_guild_students_ordered_by_xp() {
    let (server, pool) = setup_test_environment().await;
    let class_id = create_test_class(&pool, "Class 9A").await;
    let guild_id = create_test_guild(&pool, class_id, "Rankers").await;
    create_test_student(&pool, Some(guild_id), "Low", 50).await;
    create_test_student(&pool, Some(guild_id), "High", 400).await;

    let response = server.get(&format!("/guilds/{}/students", guild_id)).await;

    assert_eq!(response.status_code(), StatusCode::OK);
    let body: ApiResponse<Vec<StudentResponse>> = response.json();
    let members = body.data.unwrap();
    assert_eq!(members.len(), 2);
    assert_eq!(members[0].name, "High");
    assert_eq!(members[1].name, "Low");
}

#[tokio::test]
async fn test_penalize_guild_hits_every_member() {
    let (server, pool) = setup_test_environment().await;
    let class_id = create_test_class(&pool, "Class 9A").await;
    let guild_id = create_test_guild(&pool, class_id, "Rowdy Guild").await;
    let rich = create_test_student(&pool, Some(guild_id), "Rich", 250).await;
    let poor = create_test_student(&pool, Some(guild_id), "Poor", 50).await;

    let response = server
        .post(&format!("/guilds/{}/penalize", guild_id))
        .json(&json!({"amount": 100, "reason": "Too loud"}))
        .await;

    assert_eq!(response.status_code(), StatusCode::OK);
    let body: ApiResponse<Vec<i64>> = response.json();
    let mut affected = body.data.unwrap();
    affected.sort();
    let mut expected = vec![rich, poor];
    expected.sort();
    assert_eq!(affected, expected);

    let rich_row = get_student_row(&pool, rich).await;
    assert_eq!(rich_row.xp, 150);
    assert_eq!(rich_row.level, 2);
    assert_eq!(badge_names(&rich_row), vec!["Novice Explorer"]);

    // clamped at zero, not driven negative
    let poor_row = get_student_row(&pool, poor).await;
    assert_eq!(poor_row.xp, 0);
    assert_eq!(poor_row.level, 1);
    assert!(badge_names(&poor_row).is_empty());

    assert_eq!(
        count_ledger_entries_of_kind(&pool, rich, txn::GUILD_PENALTY).await,
        1
    );
    assert_eq!(
        count_ledger_entries_of_kind(&pool, poor, txn::GUILD_PENALTY).await,
        1
    );
}

#[tokio::test]
async fn test_penalize_guild_rejects_non_positive_amount() {
    let (server, pool) = setup_test_environment().await;
    let class_id = create_test_class(&pool, "Class 9A").await;
    let guild_id = create_test_guild(&pool, class_id, "Guiltless").await;

    let response = server
        .post(&format!("/guilds/{}/penalize", guild_id))
        .json(&json!({"amount": 0}))
        .await;

    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
}

// students

#[tokio::test]
async fn test_create_student_derives_badges_from_initial_xp() {
    let (server, pool) = setup_test_environment().await;
    let class_id = create_test_class(&pool, "Class 9A").await;
    create_test_guild(&pool, class_id, "Red Dragons").await;

    let response = server
        .post("/students")
        .json(&json!({
            "name": "Alice Stone",
            "nickname": "Ali",
            "guild_name": "Red Dragons",
            "xp": 250
        }))
        .await;

    assert_eq!(response.status_code(), StatusCode::CREATED);
    let body: ApiResponse<StudentResponse> = response.json();
    let student = body.data.unwrap();
    assert_eq!(student.xp, 250);
    assert_eq!(student.level, 3);
    assert_eq!(student.badges, vec!["Novice Explorer", "Bronze Explorer"]);
    assert_eq!(student.guild_name.as_deref(), Some("Red Dragons"));
    assert_eq!(student.class_name.as_deref(), Some("Class 9A"));
}

#[tokio::test]
async fn test_create_student_unknown_guild() {
    let (server, _pool) = setup_test_environment().await;

    let response = server
        .post("/students")
        .json(&json!({"name": "Lost Soul", "guild_name": "No Such Guild"}))
        .await;

    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_create_student_rejects_negative_xp() {
    let (server, _pool) = setup_test_environment().await;

    let response = server
        .post("/students")
        .json(&json!({"name": "Cheater", "xp": -10}))
        .await;

    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_update_student_xp_writes_one_ledger_entry() {
    let (server, pool) = setup_test_environment().await;
    let student_id = create_test_student(&pool, None, "Bob Marsh", 50).await;

    let response = server
        .put(&format!("/students/{}", student_id))
        .json(&json!({"xp": 120, "reason": "Homework bonus"}))
        .await;

    assert_eq!(response.status_code(), StatusCode::OK);
    let body: ApiResponse<StudentResponse> = response.json();
    let student = body.data.unwrap();
    assert_eq!(student.xp, 120);
    assert_eq!(student.level, 2);
    assert_eq!(student.badges, vec!["Novice Explorer"]);

    assert_eq!(count_ledger_entries(&pool, student_id).await, 1);
    assert_eq!(
        latest_xp_delta_of_kind(&pool, student_id, txn::MANUAL_ADJUSTMENT_XP).await,
        70
    );
}

#[tokio::test]
async fn test_update_student_noop_points_writes_no_ledger_entry() {
    let (server, pool) = setup_test_environment().await;
    let student_id = create_test_student(&pool, None, "Still Bob", 0).await;
    server
        .put(&format!("/students/{}", student_id))
        .json(&json!({"total_points": 50}))
        .await;
    assert_eq!(count_ledger_entries(&pool, student_id).await, 1);

    // setting the same value again must not produce a new entry
    let response = server
        .put(&format!("/students/{}", student_id))
        .json(&json!({"total_points": 50}))
        .await;

    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(count_ledger_entries(&pool, student_id).await, 1);
}

#[tokio::test]
async fn test_update_student_badge_override_bypasses_derivation() {
    let (server, pool) = setup_test_environment().await;
    let student_id = create_test_student(&pool, None, "Decorated", 150).await;

    let response = server
        .put(&format!("/students/{}", student_id))
        .json(&json!({"badges": ["Hall Monitor"]}))
        .await;

    assert_eq!(response.status_code(), StatusCode::OK);
    let body: ApiResponse<StudentResponse> = response.json();
    assert_eq!(body.data.unwrap().badges, vec!["Hall Monitor"]);
    // no point field changed, so no ledger entry either
    assert_eq!(count_ledger_entries(&pool, student_id).await, 0);
}

#[tokio::test]
async fn test_update_student_rejects_negative_xp() {
    let (server, pool) = setup_test_environment().await;
    let student_id = create_test_student(&pool, None, "Bob Marsh", 50).await;

    let response = server
        .put(&format!("/students/{}", student_id))
        .json(&json!({"xp": -1}))
        .await;

    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_update_student_unknown_guild() {
    let (server, pool) = setup_test_environment().await;
    let student_id = create_test_student(&pool, None, "Bob Marsh", 50).await;

    let response = server
        .put(&format!("/students/{}", student_id))
        .json(&json!({"guild_id": 9999}))
        .await;

    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_delete_student_returns_record_and_cascades() {
    let (server, pool) = setup_test_environment().await;
    let student_id = create_test_student(&pool, None, "Leaver", 100).await;
    let activity_id = create_test_activity(&pool, "Quest", "Q-1", 10, 0.0).await;
    create_test_enrollment(&pool, student_id, activity_id, "started", 0).await;
    create_test_ledger_entry(&pool, student_id, txn::QUEST_XP_GAIN).await;

    let response = server.delete(&format!("/students/{}", student_id)).await;

    assert_eq!(response.status_code(), StatusCode::OK);
    let body: ApiResponse<StudentResponse> = response.json();
    assert_eq!(body.data.unwrap().name, "Leaver");
    assert_eq!(count_table_rows(&pool, "students").await, 0);
    assert_eq!(count_table_rows(&pool, "enrollments").await, 0);
    assert_eq!(count_table_rows(&pool, "ledger_entries").await, 0);
}

#[tokio::test]
async fn test_deduct_xp_clamps_at_zero_and_logs_requested_amount() {
    let (server, pool) = setup_test_environment().await;
    let student_id = create_test_student(&pool, None, "Grounded", 250).await;

    let response = server
        .post(&format!("/students/{}/deduct_xp", student_id))
        .json(&json!({"amount": 400, "reason": "Major infraction"}))
        .await;

    assert_eq!(response.status_code(), StatusCode::OK);
    let body: ApiResponse<StudentResponse> = response.json();
    let student = body.data.unwrap();
    assert_eq!(student.xp, 0);
    assert_eq!(student.level, 1);
    assert!(student.badges.is_empty());

    // the ledger carries the requested deduction, not the clamped delta
    assert_eq!(
        latest_xp_delta_of_kind(&pool, student_id, txn::MANUAL_XP_DEDUCTION).await,
        -400
    );
}

#[tokio::test]
async fn test_deduct_xp_rejects_non_positive_amount() {
    let (server, pool) = setup_test_environment().await;
    let student_id = create_test_student(&pool, None, "Innocent", 100).await;

    for amount in [0, -25] {
        let response = server
            .post(&format!("/students/{}/deduct_xp", student_id))
            .json(&json!({"amount": amount}))
            .await;
        assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
    }
    assert_eq!(count_ledger_entries(&pool, student_id).await, 0);
}

#[tokio::test]
async fn test_deduct_xp_student_not_found() {
    let (server, _pool) = setup_test_environment().await;

    let response = server
        .post("/students/9999/deduct_xp")
        .json(&json!({"amount": 10}))
        .await;

    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_award_badge_grants_once() {
    let (server, pool) = setup_test_environment().await;
    let student_id = create_test_student(&pool, None, "Collector", 0).await;

    let response = server
        .post(&format!("/students/{}/award_badge", student_id))
        .json(&json!({"badge_name": "Hall Monitor"}))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);

    // second grant of the same badge is a no-op
    let response = server
        .post(&format!("/students/{}/award_badge", student_id))
        .json(&json!({"badge_name": "Hall Monitor"}))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: ApiResponse<StudentResponse> = response.json();
    assert_eq!(body.data.unwrap().badges, vec!["Hall Monitor"]);
    assert_eq!(
        count_ledger_entries_of_kind(&pool, student_id, txn::BADGE_GRANT).await,
        1
    );
}

#[tokio::test]
async fn test_add_quest_points_credits_academic_score() {
    let (server, pool) = setup_test_environment().await;
    let student_id = create_test_student(&pool, None, "Scholar", 0).await;
    create_test_activity(&pool, "Essay", "ES-1", 0, 12.5).await;

    let response = server
        .post(&format!("/students/{}/add_quest_points", student_id))
        .json(&json!({"activity_code": "ES-1"}))
        .await;

    assert_eq!(response.status_code(), StatusCode::OK);
    let body: ApiResponse<StudentResponse> = response.json();
    assert!((body.data.unwrap().academic_score - 12.5).abs() < f64::EPSILON);
    assert_eq!(
        count_ledger_entries_of_kind(&pool, student_id, txn::MANUAL_ACADEMIC_GAIN).await,
        1
    );
}

#[tokio::test]
async fn test_add_quest_points_unknown_activity() {
    let (server, pool) = setup_test_environment().await;
    let student_id = create_test_student(&pool, None, "Scholar", 0).await;

    let response = server
        .post(&format!("/students/{}/add_quest_points", student_id))
        .json(&json!({"activity_code": "NOPE"}))
        .await;

    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_student_history_lists_all_entries() {
    let (server, pool) = setup_test_environment().await;
    let student_id = create_test_student(&pool, None, "Tracked", 500).await;

    server
        .post(&format!("/students/{}/deduct_xp", student_id))
        .json(&json!({"amount": 50, "reason": "First"}))
        .await;
    server
        .put(&format!("/students/{}", student_id))
        .json(&json!({"total_points": 10, "reason": "Second"}))
        .await;

    let response = server
        .get(&format!("/students/{}/history", student_id))
        .await;

    assert_eq!(response.status_code(), StatusCode::OK);
    let body: ApiResponse<Vec<LedgerEntryResponse>> = response.json();
    let entries = body.data.unwrap();
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().any(|e| e.kind == txn::MANUAL_XP_DEDUCTION));
    assert!(
        entries
            .iter()
            .any(|e| e.kind == txn::MANUAL_ADJUSTMENT_TOTAL_POINTS)
    );
}

#[tokio::test]
async fn test_search_students_partial_match() {
    let (server, pool) = setup_test_environment().await;
    create_test_student(&pool, None, "Ana Silva", 0).await;
    create_test_student(&pool, None, "Ana Souza", 0).await;
    create_test_student(&pool, None, "Bruno Dias", 0).await;

    let response = server.get("/students/search/ana").await;

    assert_eq!(response.status_code(), StatusCode::OK);
    let body: ApiResponse<Vec<StudentResponse>> = response.json();
    assert_eq!(body.data.unwrap().len(), 2);
}

#[tokio::test]
async fn test_search_students_no_match() {
    let (server, _pool) = setup_test_environment().await;

    let response = server.get("/students/search/nobody").await;

    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_leaderboard_orders_by_xp_and_honors_limit() {
    let (server, pool) = setup_test_environment().await;
    create_test_student(&pool, None, "Third", 100).await;
    create_test_student(&pool, None, "First", 900).await;
    create_test_student(&pool, None, "Second", 500).await;

    let response = server.get("/students/leaderboard?limit=2").await;

    assert_eq!(response.status_code(), StatusCode::OK);
    let body: ApiResponse<Vec<StudentResponse>> = response.json();
    let ranking = body.data.unwrap();
    assert_eq!(ranking.len(), 2);
    assert_eq!(ranking[0].name, "First");
    assert_eq!(ranking[1].name, "Second");
}

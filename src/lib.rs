use crate::cli::Args;
use crate::ledger::BadgeTiers;
use anyhow::Context;
use axum::Router;
use axum::routing::{delete, get, post, put};
use axum_keycloak_auth::PassthroughMode;
use axum_keycloak_auth::instance::{KeycloakAuthInstance, KeycloakConfig};
use axum_keycloak_auth::layer::KeycloakAuthLayer;
use deadpool_diesel::Runtime;
use deadpool_diesel::postgres::{Manager, Pool};
use tracing::log::info;

pub mod cli;
pub mod ledger;
pub mod model;
pub mod payloads;
pub mod response;
pub mod schema;

mod api;
mod errors;

/// Shared handler state: the connection pool plus the badge tier table,
/// which is loaded once at startup and immutable afterwards.
#[derive(Clone)]
pub struct AppState {
    pub pool: Pool,
    pub badge_tiers: BadgeTiers,
}

pub fn init_router(args: &Args) -> anyhow::Result<Router> {
    info!("Initializing database pool...");
    let pool = init_pool(&args.connection_str, args.db_pool_max_size)
        .context("Failed to initialize database pool")?;

    info!("Initializing Keycloak authentication layer...");
    let keycloak_layer =
        init_protection_layer(args).context("Failed to initialize Keycloak layer")?;

    info!("Loading badge tier table...");
    let badge_tiers = BadgeTiers::standard();

    info!("Initializing router...");
    Ok(init_router_internal(
        AppState { pool, badge_tiers },
        keycloak_layer,
    ))
}

pub fn init_test_router(pool: Pool, badge_tiers: BadgeTiers) -> Router {
    let state = AppState { pool, badge_tiers };

    Router::new()
        .nest("/classes", classes_routes())
        .nest("/guilds", guilds_routes())
        .nest("/students", students_routes())
        .nest("/activities", activities_routes())
        .nest("/enrollments", enrollments_routes())
        .with_state(state)
}

fn init_router_internal(state: AppState, keycloak_layer: KeycloakAuthLayer<String>) -> Router {
    let classes_api = classes_routes().layer(keycloak_layer.clone());
    let guilds_api = guilds_routes().layer(keycloak_layer.clone());
    let students_api = students_routes().layer(keycloak_layer.clone());
    let activities_api = activities_routes().layer(keycloak_layer.clone());
    let enrollments_api = enrollments_routes().layer(keycloak_layer.clone());

    Router::new()
        .nest("/classes", classes_api)
        .nest("/guilds", guilds_api)
        .nest("/students", students_api)
        .nest("/activities", activities_api)
        .nest("/enrollments", enrollments_api)
        .with_state(state)
}

fn init_pool(conn_str: &str, max_size: u32) -> anyhow::Result<Pool> {
    let manager = Manager::new(conn_str, Runtime::Tokio1);
    let pool = Pool::builder(manager).max_size(max_size as usize).build()?;
    Ok(pool)
}

fn init_protection_layer(args: &Args) -> anyhow::Result<KeycloakAuthLayer<String>> {
    let config = KeycloakConfig::builder()
        .server(args.keycloak_server_url.clone())
        .realm(args.keycloak_realm.clone())
        .build();

    let instance = KeycloakAuthInstance::new(config);

    let layer = KeycloakAuthLayer::builder()
        .instance(instance)
        .passthrough_mode(PassthroughMode::Block)
        .persist_raw_claims(false)
        .expected_audiences(vec![args.keycloak_audiences.clone()])
        .build();

    Ok(layer)
}

fn classes_routes() -> Router<AppState> {
    Router::new()
        // protected routes go here
        .route(
            "/",
            post(api::students::create_class).get(api::students::list_classes),
        )
        .route(
            "/{class_id}",
            get(api::students::get_class)
                .put(api::students::update_class)
                .delete(api::students::delete_class),
        )
    // public routes go here
}

fn guilds_routes() -> Router<AppState> {
    Router::new()
        // protected routes go here
        .route(
            "/",
            post(api::students::create_guild).get(api::students::list_guilds),
        )
        .route("/leaderboard", get(api::students::guild_leaderboard))
        .route(
            "/{guild_id}",
            put(api::students::update_guild).delete(api::students::delete_guild),
        )
        .route("/{guild_id}/students", get(api::students::guild_students))
        .route("/{guild_id}/penalize", post(api::students::penalize_guild))
    // public routes go here
}

fn students_routes() -> Router<AppState> {
    Router::new()
        // protected routes go here
        .route(
            "/",
            post(api::students::create_student).get(api::students::list_students),
        )
        .route("/leaderboard", get(api::students::leaderboard))
        .route("/search/{name}", get(api::students::search_students))
        .route(
            "/{student_id}",
            get(api::students::get_student)
                .put(api::students::update_student)
                .delete(api::students::delete_student),
        )
        .route("/{student_id}/deduct_xp", post(api::students::deduct_xp))
        .route("/{student_id}/award_badge", post(api::students::award_badge))
        .route(
            "/{student_id}/add_quest_points",
            post(api::students::add_quest_points),
        )
        .route("/{student_id}/history", get(api::students::student_history))
    // public routes go here
}

fn activities_routes() -> Router<AppState> {
    Router::new()
        // protected routes go here
        .route(
            "/",
            post(api::activities::create_activity).get(api::activities::list_activities),
        )
        .route(
            "/{code}",
            get(api::activities::get_activity).put(api::activities::update_activity),
        )
    // public routes go here
}

fn enrollments_routes() -> Router<AppState> {
    Router::new()
        // protected routes go here
        .route("/", post(api::enrollments::create_enrollment))
        .route("/bulk_complete", post(api::enrollments::bulk_complete))
        .route(
            "/student/{name}",
            get(api::enrollments::enrollments_by_student),
        )
        .route(
            "/activity/{code}",
            get(api::enrollments::enrollments_by_activity),
        )
        .route(
            "/{enrollment_id}/complete",
            put(api::enrollments::complete_enrollment),
        )
        .route("/{enrollment_id}", delete(api::enrollments::revert_enrollment))
    // public routes go here
}

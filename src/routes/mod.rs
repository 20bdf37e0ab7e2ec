use axum::{
    middleware,
    routing::{delete, get, post},
    Router,
};

mod auth;
mod evaluate;
mod flags;
mod groups;
mod health;
mod middleware_auth;
mod rules;
mod users;

use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    let flag_router = Router::new()
        .route("/", post(flags::routes::create).get(flags::routes::list))
        .route(
            "/{flag_id}",
            get(flags::routes::get)
                .put(flags::routes::update)
                .delete(flags::routes::delete),
        )
        .route("/{flag_id}/toggle", post(flags::routes::toggle))
        .route(
            "/{flag_id}/rules",
            post(rules::routes::create).get(rules::routes::list),
        );

    let group_router = Router::new()
        .route("/", post(groups::routes::create).get(groups::routes::list))
        .route(
            "/{group_id}",
            get(groups::routes::get)
                .put(groups::routes::update)
                .delete(groups::routes::delete),
        )
        .route("/{group_id}/members", get(groups::routes::members))
        .route(
            "/{group_id}/users/{user_id}",
            post(groups::routes::add_member).delete(groups::routes::remove_member),
        );

    let user_router = Router::new()
        .route("/", get(users::routes::list))
        .route(
            "/{user_id}",
            get(users::routes::get).delete(users::routes::delete),
        );

    Router::new()
        .route("/", get(root))
        .route("/health", get(health::health))
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        // SDK-facing surface, authenticated by nothing but the flag key.
        .route("/evaluate", post(evaluate::routes::evaluate))
        .nest(
            "/api",
            Router::new()
                .nest("/flags", flag_router)
                .nest("/groups", group_router)
                .nest("/users", user_router)
                .route("/rules/{rule_id}", delete(rules::routes::delete))
                .layer(middleware::from_fn(middleware_auth::require_auth)),
        )
}

async fn root() -> &'static str {
    "Feature flag service is running"
}

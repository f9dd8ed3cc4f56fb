use std::sync::Arc;

use axum::{
    middleware,
    routing::{delete, get, post, put},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::server::{auth::auth_middleware, handlers};
use crate::shared::models::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    // Control-plane routes behind shared-secret basic auth
    let control = Router::new()
        .route("/instances", get(handlers::instances::list_instances))
        .route("/instances/create", post(handlers::instances::create_instance))
        .route("/instances/{id}", delete(handlers::instances::delete_instance))
        .route(
            "/instances/redeploy/{id}/{container_id}",
            post(handlers::instances::redeploy_instance),
        )
        .route(
            "/instances/reinstall/{id}/{container_id}",
            post(handlers::instances::reinstall_instance),
        )
        .route("/instances/edit/{id}", put(handlers::instances::edit_instance))
        .route("/state/{volume_id}", get(handlers::state::get_state))
        .route("/stats", get(handlers::stats::get_stats))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    // The session channel shares the listener; its auth is the in-band
    // handshake, not the HTTP header
    Router::new()
        .merge(control)
        .merge(crate::ws::routes())
        .fallback(crate::ws::unknown_kind_fallback)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

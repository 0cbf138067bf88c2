use axum::http::HeaderValue;
use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get, post},
    Router,
};
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::state::AppState;

pub mod api_keys;
pub mod auth;
pub mod documents;
pub mod health;
pub mod search;
pub mod users;
pub mod vaults;
pub mod webdav;

/// Documents arrive as JSON-wrapped bodies; the limit sits a little above
/// the 10 MiB content bound to leave room for the envelope.
const MAX_BODY_BYTES: usize = 11 * 1024 * 1024;

pub fn create_router(state: AppState) -> Router<()> {
    let cors = if let Some(origins) = state.config.cors_allowed_origin.as_ref() {
        let headers: Vec<HeaderValue> = origins
            .split(',')
            .filter_map(|value| {
                let trimmed = value.trim();
                (!trimmed.is_empty()).then(|| {
                    trimmed
                        .parse::<HeaderValue>()
                        .expect("invalid CORS allowed origin")
                })
            })
            .collect();

        CorsLayer::new()
            .allow_origin(AllowOrigin::list(headers))
            .allow_methods(tower_http::cors::AllowMethods::mirror_request())
            .allow_headers(tower_http::cors::AllowHeaders::mirror_request())
            .allow_credentials(true)
    } else {
        CorsLayer::new()
            .allow_origin(AllowOrigin::mirror_request())
            .allow_methods(tower_http::cors::AllowMethods::mirror_request())
            .allow_headers(tower_http::cors::AllowHeaders::mirror_request())
            .allow_credentials(true)
    };

    let auth_routes = Router::new()
        .route("/register", post(auth::register))
        .route("/login", post(auth::login))
        .route("/refresh", post(auth::refresh))
        .route("/logout", post(auth::logout));

    let users_routes = Router::new()
        .route("/me", get(users::me))
        .route("/me/storage", get(users::storage))
        .route("/invite", post(users::invite))
        .route("/invitations", get(users::list_invitations))
        .route("/invitations/:id", delete(users::delete_invitation));

    let vaults_routes = Router::new()
        .route("/", get(vaults::list_vaults).post(vaults::create_vault))
        .route(
            "/:id",
            get(vaults::get_vault)
                .patch(vaults::update_vault)
                .delete(vaults::delete_vault),
        )
        .route("/:id/tree", get(vaults::vault_tree))
        .route("/:id/documents", get(documents::list_documents))
        .route(
            "/:id/documents/*path",
            get(documents::get_document)
                .put(documents::put_document)
                .delete(documents::delete_document)
                .post(documents::document_action),
        );

    let api_key_routes = Router::new()
        .route("/", get(api_keys::list_keys).post(api_keys::create_key))
        .route(
            "/:id",
            axum::routing::patch(api_keys::update_key).delete(api_keys::delete_key),
        );

    let api = Router::new()
        .nest("/auth", auth_routes)
        .nest("/users", users_routes)
        .nest("/vaults", vaults_routes)
        .nest("/api-keys", api_key_routes)
        .route("/search", get(search::search))
        .route("/health", get(health::health_check));

    Router::new()
        .nest("/api/v1", api)
        .nest("/webdav", webdav::create_router())
        .with_state(state)
        .layer(cors)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
}

pub mod api_key;
pub mod jwt;
pub mod password;

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use axum_extra::headers::{authorization::Bearer, Authorization};
use axum_extra::TypedHeader;
use serde::Serialize;
use uuid::Uuid;

use crate::{
    error::AppError,
    models::{SOURCE_API, SOURCE_WEB},
    state::AppState,
};

/// Caller identity attached to API requests. Either a JWT bearer (browser
/// or script) or an API key bearer (`ds_k_` sniffed off the token).
#[derive(Debug, Clone, Serialize)]
pub struct AuthenticatedUser {
    pub user_id: Uuid,
    pub email: String,
    pub role: String,
    #[serde(skip)]
    pub api_key: Option<api_key::ApiKeyIdentity>,
    #[serde(skip)]
    pub web_origin: bool,
}

impl AuthenticatedUser {
    pub fn is_admin(&self) -> bool {
        self.role == crate::models::ROLE_ADMIN
    }

    /// Which surface produced a change, for the version audit trail. The
    /// web UI always sends `X-Requested-With` (its CSRF marker); API-key
    /// and plain bearer callers do not.
    pub fn change_source(&self) -> &'static str {
        if self.web_origin && self.api_key.is_none() {
            SOURCE_WEB
        } else {
            SOURCE_API
        }
    }

    pub fn can_write_vault(&self, vault_id: Uuid) -> bool {
        match &self.api_key {
            None => true,
            Some(key) => {
                key.scopes.iter().any(|s| s == crate::models::SCOPE_WRITE)
                    && key.vault_id.map(|scoped| scoped == vault_id).unwrap_or(true)
            }
        }
    }

    pub fn can_read_vault(&self, vault_id: Uuid) -> bool {
        match &self.api_key {
            None => true,
            Some(key) => key.vault_id.map(|scoped| scoped == vault_id).unwrap_or(true),
        }
    }
}

#[async_trait]
impl FromRequestParts<AppState> for AuthenticatedUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(bearer)) =
            TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, state)
                .await
                .map_err(|_| AppError::unauthorized())?;

        let web_origin = parts
            .headers
            .get("x-requested-with")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("XMLHttpRequest"))
            .unwrap_or(false);

        let token = bearer.token();
        if token.starts_with(api_key::KEY_PREFIX) {
            let pool = state.pool.clone();
            let token = token.to_string();
            let identity = tokio::task::spawn_blocking(move || {
                api_key::verify_api_key(&pool, &token)
            })
            .await
            .map_err(|err| AppError::internal(format!("api key verification panicked: {err}")))?
            .map_err(|_| AppError::unauthorized())?;

            let user = load_active_user(state, identity.user_id)?;
            return Ok(AuthenticatedUser {
                user_id: user.id,
                email: user.email,
                role: user.role,
                api_key: Some(identity),
                web_origin,
            });
        }

        let claims = state
            .jwt
            .verify_token(token)
            .map_err(|_| AppError::unauthorized())?;

        Ok(AuthenticatedUser {
            user_id: claims.sub,
            email: claims.email,
            role: claims.role,
            api_key: None,
            web_origin,
        })
    }
}

fn load_active_user(state: &AppState, user_id: Uuid) -> Result<crate::models::User, AppError> {
    use crate::schema::users::dsl;
    use diesel::prelude::*;

    let mut conn = state.db()?;
    let user: crate::models::User = dsl::users
        .find(user_id)
        .first(&mut conn)
        .map_err(|_| AppError::unauthorized())?;
    if !user.is_active {
        return Err(AppError::unauthorized());
    }
    Ok(user)
}

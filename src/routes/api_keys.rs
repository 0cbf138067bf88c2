use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    auth::{api_key, AuthenticatedUser},
    error::{AppError, AppResult},
    models::{to_json_string_array, ApiKey, NewApiKey, SCOPE_READ, SCOPE_WRITE},
    schema::api_keys,
    state::AppState,
};

use crate::schema::api_keys::dsl as api_keys_dsl;
use crate::schema::vaults::dsl as vaults_dsl;

#[derive(Serialize)]
pub struct ApiKeyResponse {
    pub id: Uuid,
    pub name: String,
    pub key_prefix: String,
    pub scopes: Vec<String>,
    pub vault_id: Option<Uuid>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    /// The full secret, present only in the creation response.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl ApiKeyResponse {
    fn from_row(row: ApiKey, secret: Option<String>) -> Self {
        let scopes = row.scope_list();
        Self {
            id: row.id,
            name: row.name,
            key_prefix: row.key_prefix,
            scopes,
            vault_id: row.vault_id,
            expires_at: row.expires_at,
            last_used_at: row.last_used_at,
            is_active: row.is_active,
            created_at: row.created_at,
            key: secret,
        }
    }
}

pub async fn list_keys(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> AppResult<Json<Vec<ApiKeyResponse>>> {
    let mut conn = state.db()?;
    let rows: Vec<ApiKey> = api_keys_dsl::api_keys
        .filter(api_keys_dsl::user_id.eq(user.user_id))
        .order(api_keys_dsl::created_at.desc())
        .load(&mut conn)?;
    Ok(Json(
        rows.into_iter()
            .map(|row| ApiKeyResponse::from_row(row, None))
            .collect(),
    ))
}

#[derive(Deserialize)]
pub struct CreateKeyRequest {
    pub name: String,
    pub scopes: Option<Vec<String>>,
    pub vault_id: Option<Uuid>,
    pub expires_at: Option<DateTime<Utc>>,
}

fn validate_scopes(scopes: Option<Vec<String>>) -> AppResult<Vec<String>> {
    let scopes =
        scopes.unwrap_or_else(|| vec![SCOPE_READ.to_string(), SCOPE_WRITE.to_string()]);
    if scopes.is_empty() {
        return Err(AppError::bad_request("scopes must not be empty"));
    }
    for scope in &scopes {
        if scope != SCOPE_READ && scope != SCOPE_WRITE {
            return Err(AppError::bad_request(format!("unknown scope '{scope}'")));
        }
    }
    Ok(scopes)
}

pub async fn create_key(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(payload): Json<CreateKeyRequest>,
) -> AppResult<(StatusCode, Json<ApiKeyResponse>)> {
    let name = payload.name.trim().to_string();
    if name.is_empty() || name.len() > 100 {
        return Err(AppError::bad_request("name must be 1-100 characters"));
    }
    let scopes = validate_scopes(payload.scopes)?;

    let mut conn = state.db()?;
    if let Some(vault_id) = payload.vault_id {
        let owned: i64 = vaults_dsl::vaults
            .filter(vaults_dsl::id.eq(vault_id))
            .filter(vaults_dsl::user_id.eq(user.user_id))
            .count()
            .first(&mut conn)?;
        if owned == 0 {
            return Err(AppError::not_found());
        }
    }

    let generated = api_key::generate_api_key()?;
    let row = NewApiKey {
        id: Uuid::new_v4(),
        user_id: user.user_id,
        name,
        key_prefix: generated.prefix,
        key_hash: generated.hash,
        scopes: to_json_string_array(&scopes),
        vault_id: payload.vault_id,
        expires_at: payload.expires_at,
    };
    diesel::insert_into(api_keys::table)
        .values(&row)
        .execute(&mut conn)?;
    let created: ApiKey = api_keys_dsl::api_keys.find(row.id).first(&mut conn)?;

    Ok((
        StatusCode::CREATED,
        Json(ApiKeyResponse::from_row(created, Some(generated.secret))),
    ))
}

#[derive(Deserialize)]
pub struct UpdateKeyRequest {
    pub name: Option<String>,
    pub is_active: Option<bool>,
}

pub async fn update_key(
    State(state): State<AppState>,
    Path(key_id): Path<Uuid>,
    user: AuthenticatedUser,
    Json(payload): Json<UpdateKeyRequest>,
) -> AppResult<Json<ApiKeyResponse>> {
    if payload.name.is_none() && payload.is_active.is_none() {
        return Err(AppError::bad_request("no changes provided"));
    }

    let mut conn = state.db()?;
    let row: ApiKey = api_keys_dsl::api_keys
        .filter(api_keys_dsl::id.eq(key_id))
        .filter(api_keys_dsl::user_id.eq(user.user_id))
        .first(&mut conn)
        .map_err(|_| AppError::not_found())?;

    if let Some(ref name) = payload.name {
        let name = name.trim();
        if name.is_empty() || name.len() > 100 {
            return Err(AppError::bad_request("name must be 1-100 characters"));
        }
        diesel::update(api_keys_dsl::api_keys.find(row.id))
            .set(api_keys_dsl::name.eq(name))
            .execute(&mut conn)?;
    }
    if let Some(is_active) = payload.is_active {
        diesel::update(api_keys_dsl::api_keys.find(row.id))
            .set(api_keys_dsl::is_active.eq(is_active))
            .execute(&mut conn)?;
    }

    let updated: ApiKey = api_keys_dsl::api_keys.find(row.id).first(&mut conn)?;
    Ok(Json(ApiKeyResponse::from_row(updated, None)))
}

pub async fn delete_key(
    State(state): State<AppState>,
    Path(key_id): Path<Uuid>,
    user: AuthenticatedUser,
) -> AppResult<StatusCode> {
    let mut conn = state.db()?;
    let deleted = diesel::delete(
        api_keys_dsl::api_keys
            .filter(api_keys_dsl::id.eq(key_id))
            .filter(api_keys_dsl::user_id.eq(user.user_id)),
    )
    .execute(&mut conn)?;
    if deleted == 0 {
        return Err(AppError::not_found());
    }
    Ok(StatusCode::NO_CONTENT)
}

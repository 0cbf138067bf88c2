use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::result::DatabaseErrorKind;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::{
    auth::AuthenticatedUser,
    engine::{vault_root, TreeNode},
    error::{AppError, AppResult},
    fs,
    models::{NewVault, Vault},
    paths::slugify,
    schema::vaults,
    state::AppState,
};

use crate::schema::vaults::dsl as vaults_dsl;

#[derive(Deserialize)]
pub struct CreateVaultRequest {
    pub name: String,
    pub description: Option<String>,
}

#[derive(Deserialize)]
pub struct UpdateVaultRequest {
    pub name: Option<String>,
    pub description: Option<String>,
}

#[derive(Serialize)]
pub struct VaultResponse {
    pub id: Uuid,
    pub name: String,
    pub slug: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Vault> for VaultResponse {
    fn from(vault: Vault) -> Self {
        Self {
            id: vault.id,
            name: vault.name,
            slug: vault.slug,
            description: vault.description,
            created_at: vault.created_at,
            updated_at: vault.updated_at,
        }
    }
}

fn validate_name(name: &str) -> AppResult<String> {
    let name = name.trim();
    if name.is_empty() || name.len() > 100 {
        return Err(AppError::bad_request("name must be 1-100 characters"));
    }
    Ok(name.to_string())
}

fn validate_description(description: Option<String>) -> AppResult<Option<String>> {
    match description {
        Some(text) => {
            if text.len() > 1000 {
                return Err(AppError::bad_request("description must be at most 1000 characters"));
            }
            Ok(Some(text))
        }
        None => Ok(None),
    }
}

pub async fn list_vaults(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> AppResult<Json<Vec<VaultResponse>>> {
    let mut conn = state.db()?;
    let rows: Vec<Vault> = vaults_dsl::vaults
        .filter(vaults_dsl::user_id.eq(user.user_id))
        .order(vaults_dsl::name.asc())
        .load(&mut conn)?;
    Ok(Json(rows.into_iter().map(Into::into).collect()))
}

pub async fn create_vault(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(payload): Json<CreateVaultRequest>,
) -> AppResult<(StatusCode, Json<VaultResponse>)> {
    let name = validate_name(&payload.name)?;
    let description = validate_description(payload.description)?;

    // The slug names the on-disk directory and never changes afterwards.
    let slug = slugify(&name);
    if slug.is_empty() {
        return Err(AppError::bad_request(
            "name must contain at least one alphanumeric character",
        ));
    }

    let vault = NewVault {
        id: Uuid::new_v4(),
        user_id: user.user_id,
        name,
        slug: slug.clone(),
        description,
    };

    let mut conn = state.db()?;
    match diesel::insert_into(vaults::table)
        .values(&vault)
        .execute(&mut conn)
    {
        Ok(_) => {}
        Err(diesel::result::Error::DatabaseError(DatabaseErrorKind::UniqueViolation, _)) => {
            return Err(AppError::conflict(format!(
                "a vault with slug '{slug}' already exists"
            )));
        }
        Err(err) => return Err(AppError::from(err)),
    }
    let row: Vault = vaults_dsl::vaults.find(vault.id).first(&mut conn)?;
    drop(conn);

    let root = vault_root(&state.config.data_dir, user.user_id, &row.slug);
    fs::ensure_vault_dir(&root)
        .await
        .map_err(AppError::from)?;

    info!(vault_id = %row.id, slug = %row.slug, "vault created");
    Ok((StatusCode::CREATED, Json(row.into())))
}

fn load_owned_vault(state: &AppState, user_id: Uuid, vault_id: Uuid) -> AppResult<Vault> {
    let mut conn = state.db()?;
    let vault: Option<Vault> = vaults_dsl::vaults
        .filter(vaults_dsl::id.eq(vault_id))
        .filter(vaults_dsl::user_id.eq(user_id))
        .first(&mut conn)
        .optional()?;
    vault.ok_or_else(AppError::not_found)
}

pub async fn get_vault(
    State(state): State<AppState>,
    Path(vault_id): Path<Uuid>,
    user: AuthenticatedUser,
) -> AppResult<Json<VaultResponse>> {
    if !user.can_read_vault(vault_id) {
        return Err(AppError::forbidden());
    }
    let vault = load_owned_vault(&state, user.user_id, vault_id)?;
    Ok(Json(vault.into()))
}

/// Rename or re-describe a vault. The slug (and the directory it names)
/// stays frozen.
pub async fn update_vault(
    State(state): State<AppState>,
    Path(vault_id): Path<Uuid>,
    user: AuthenticatedUser,
    Json(payload): Json<UpdateVaultRequest>,
) -> AppResult<Json<VaultResponse>> {
    let vault = load_owned_vault(&state, user.user_id, vault_id)?;

    let name = match payload.name {
        Some(ref name) => Some(validate_name(name)?),
        None => None,
    };
    let description_update = payload.description.is_some();
    let description = validate_description(payload.description)?;

    if name.is_none() && !description_update {
        return Err(AppError::bad_request("no changes provided"));
    }

    let mut conn = state.db()?;
    let now = Utc::now();
    if let Some(name) = name {
        diesel::update(vaults_dsl::vaults.find(vault.id))
            .set((vaults_dsl::name.eq(name), vaults_dsl::updated_at.eq(now)))
            .execute(&mut conn)?;
    }
    if description_update {
        diesel::update(vaults_dsl::vaults.find(vault.id))
            .set((
                vaults_dsl::description.eq(description),
                vaults_dsl::updated_at.eq(now),
            ))
            .execute(&mut conn)?;
    }

    let row: Vault = vaults_dsl::vaults.find(vault.id).first(&mut conn)?;
    Ok(Json(row.into()))
}

pub async fn delete_vault(
    State(state): State<AppState>,
    Path(vault_id): Path<Uuid>,
    user: AuthenticatedUser,
) -> AppResult<StatusCode> {
    if !user.can_write_vault(vault_id) {
        return Err(AppError::forbidden());
    }
    let vault = load_owned_vault(&state, user.user_id, vault_id)?;

    // Row first so the watcher finds no vault for any unlink events the
    // directory removal produces, then the tree.
    let mut conn = state.db()?;
    diesel::delete(vaults_dsl::vaults.find(vault.id)).execute(&mut conn)?;
    drop(conn);

    let root = vault_root(&state.config.data_dir, user.user_id, &vault.slug);
    fs::delete_vault_dir(&root).await.map_err(AppError::from)?;

    info!(vault_id = %vault.id, slug = %vault.slug, "vault deleted");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn vault_tree(
    State(state): State<AppState>,
    Path(vault_id): Path<Uuid>,
    user: AuthenticatedUser,
) -> AppResult<Json<Vec<TreeNode>>> {
    if !user.can_read_vault(vault_id) {
        return Err(AppError::forbidden());
    }
    let tree = state.engine().tree(user.user_id, vault_id)?;
    Ok(Json(tree))
}

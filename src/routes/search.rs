use axum::{
    extract::{Query, State},
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    auth::AuthenticatedUser,
    error::{AppError, AppResult},
    search::{search_documents, SearchHit, DEFAULT_LIMIT, MAX_LIMIT},
    state::AppState,
};

#[derive(Deserialize)]
pub struct SearchQuery {
    pub q: String,
    pub vault: Option<Uuid>,
    pub tags: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub async fn search(
    State(state): State<AppState>,
    Query(params): Query<SearchQuery>,
    user: AuthenticatedUser,
) -> AppResult<Json<Vec<SearchHit>>> {
    let query = params.q.trim();
    if query.is_empty() {
        return Err(AppError::bad_request("q must not be empty"));
    }
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT);
    if !(1..=MAX_LIMIT).contains(&limit) {
        return Err(AppError::bad_request(format!(
            "limit must be between 1 and {MAX_LIMIT}"
        )));
    }
    let offset = params.offset.unwrap_or(0);
    if offset < 0 {
        return Err(AppError::bad_request("offset must not be negative"));
    }
    if let Some(vault_id) = params.vault {
        if !user.can_read_vault(vault_id) {
            return Err(AppError::forbidden());
        }
    }

    let tags: Vec<String> = params
        .tags
        .as_deref()
        .map(|raw| {
            raw.split(',')
                .map(|tag| tag.trim().to_lowercase())
                .filter(|tag| !tag.is_empty())
                .collect()
        })
        .unwrap_or_default();

    let mut conn = state.db()?;
    let hits = search_documents(
        &mut conn,
        user.user_id,
        query,
        params.vault,
        &tags,
        limit,
        offset,
    )?;
    Ok(Json(hits))
}

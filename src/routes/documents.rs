use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::{
    auth::AuthenticatedUser,
    error::{AppError, AppResult},
    models::{Document, DocumentVersion},
    state::AppState,
};

pub const MAX_DOCUMENT_BYTES: usize = 10 * 1024 * 1024;

#[derive(Serialize)]
pub struct DocumentResponse {
    pub id: Uuid,
    pub vault_id: Uuid,
    pub path: String,
    pub title: Option<String>,
    pub content_hash: String,
    pub size_bytes: i64,
    pub frontmatter: Option<Value>,
    pub tags: Vec<String>,
    pub file_created_at: DateTime<Utc>,
    pub file_modified_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Document> for DocumentResponse {
    fn from(doc: Document) -> Self {
        let tags = doc.tag_list();
        Self {
            id: doc.id,
            vault_id: doc.vault_id,
            path: doc.path,
            title: doc.title,
            content_hash: doc.content_hash,
            size_bytes: doc.size_bytes,
            frontmatter: doc.frontmatter,
            tags,
            file_created_at: doc.file_created_at,
            file_modified_at: doc.file_modified_at,
            created_at: doc.created_at,
            updated_at: doc.updated_at,
        }
    }
}

#[derive(Serialize)]
pub struct DocumentDetailResponse {
    pub document: DocumentResponse,
    pub content: String,
}

#[derive(Serialize)]
pub struct VersionResponse {
    pub id: Uuid,
    pub version_num: i32,
    pub content_hash: String,
    pub size_bytes: i64,
    pub change_source: String,
    pub changed_by: Uuid,
    pub created_at: DateTime<Utc>,
}

impl From<DocumentVersion> for VersionResponse {
    fn from(version: DocumentVersion) -> Self {
        Self {
            id: version.id,
            version_num: version.version_num,
            content_hash: version.content_hash,
            size_bytes: version.size_bytes,
            change_source: version.change_source,
            changed_by: version.changed_by,
            created_at: version.created_at,
        }
    }
}

#[derive(Deserialize)]
pub struct ListQuery {
    pub dir: Option<String>,
}

pub async fn list_documents(
    State(state): State<AppState>,
    Path(vault_id): Path<Uuid>,
    Query(params): Query<ListQuery>,
    user: AuthenticatedUser,
) -> AppResult<Json<Vec<DocumentResponse>>> {
    if !user.can_read_vault(vault_id) {
        return Err(AppError::forbidden());
    }
    let docs = state
        .engine()
        .list(user.user_id, vault_id, params.dir.as_deref())?;
    Ok(Json(docs.into_iter().map(Into::into).collect()))
}

/// GET dispatch for the wildcard: a trailing `/versions` segment addresses
/// the version history of the remaining path.
pub async fn get_document(
    State(state): State<AppState>,
    Path((vault_id, path)): Path<(Uuid, String)>,
    user: AuthenticatedUser,
) -> AppResult<Json<serde_json::Value>> {
    if !user.can_read_vault(vault_id) {
        return Err(AppError::forbidden());
    }
    if let Some(doc_path) = path.strip_suffix("/versions") {
        if !doc_path.is_empty() {
            let versions = state.engine().versions(user.user_id, vault_id, doc_path)?;
            let versions: Vec<VersionResponse> = versions.into_iter().map(Into::into).collect();
            return Ok(Json(serde_json::to_value(versions)?));
        }
    }
    let (doc, content) = state.engine().get(user.user_id, vault_id, &path).await?;
    let detail = DocumentDetailResponse {
        document: doc.into(),
        content,
    };
    Ok(Json(serde_json::to_value(detail)?))
}

#[derive(Deserialize)]
pub struct PutDocumentRequest {
    pub content: String,
}

pub async fn put_document(
    State(state): State<AppState>,
    Path((vault_id, path)): Path<(Uuid, String)>,
    user: AuthenticatedUser,
    Json(payload): Json<PutDocumentRequest>,
) -> AppResult<(StatusCode, Json<DocumentResponse>)> {
    if !user.can_write_vault(vault_id) {
        return Err(AppError::forbidden());
    }
    if payload.content.len() > MAX_DOCUMENT_BYTES {
        return Err(AppError::bad_request("document exceeds 10 MiB"));
    }

    let engine = state.engine();
    let existed = engine
        .find_document(vault_id, &path)
        .map(|doc| doc.is_some())
        .unwrap_or(false);
    let (doc, changed) = engine
        .put(
            user.user_id,
            vault_id,
            &path,
            &payload.content,
            user.change_source(),
        )
        .await?;

    info!(vault_id = %vault_id, path = %path, changed, "document written");
    let status = if existed {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(doc.into())))
}

pub async fn delete_document(
    State(state): State<AppState>,
    Path((vault_id, path)): Path<(Uuid, String)>,
    user: AuthenticatedUser,
) -> AppResult<StatusCode> {
    if !user.can_write_vault(vault_id) {
        return Err(AppError::forbidden());
    }
    let removed = state.engine().remove(user.user_id, vault_id, &path).await?;
    info!(vault_id = %vault_id, path = %path, removed, "document(s) deleted");
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct TransferRequest {
    pub destination: String,
    #[serde(default)]
    pub overwrite: bool,
}

/// POST dispatch for the wildcard: `…/move` and `…/copy` act on the
/// remaining path.
pub async fn document_action(
    State(state): State<AppState>,
    Path((vault_id, path)): Path<(Uuid, String)>,
    user: AuthenticatedUser,
    Json(payload): Json<TransferRequest>,
) -> AppResult<StatusCode> {
    if !user.can_write_vault(vault_id) {
        return Err(AppError::forbidden());
    }

    if let Some(src) = path.strip_suffix("/move") {
        if src.is_empty() {
            return Err(AppError::not_found());
        }
        state
            .engine()
            .rename(
                user.user_id,
                vault_id,
                src,
                &payload.destination,
                payload.overwrite,
            )
            .await?;
        info!(vault_id = %vault_id, src, dst = %payload.destination, "document moved");
        return Ok(StatusCode::NO_CONTENT);
    }

    if let Some(src) = path.strip_suffix("/copy") {
        if src.is_empty() {
            return Err(AppError::not_found());
        }
        state
            .engine()
            .copy(
                user.user_id,
                vault_id,
                src,
                &payload.destination,
                payload.overwrite,
                user.change_source(),
            )
            .await?;
        info!(vault_id = %vault_id, src, dst = %payload.destination, "document copied");
        return Ok(StatusCode::NO_CONTENT);
    }

    Err(AppError::not_found())
}

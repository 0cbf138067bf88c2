use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use diesel::prelude::*;
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    auth::AuthenticatedUser,
    error::{AppError, AppResult},
    models::{Invitation, NewInvitation, User},
    routes::auth::UserResponse,
    schema::invitations,
    state::AppState,
};

use crate::schema::invitations::dsl as invitations_dsl;
use crate::schema::users::dsl as users_dsl;

pub async fn me(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> AppResult<Json<UserResponse>> {
    let mut conn = state.db()?;
    let row: User = users_dsl::users.find(user.user_id).first(&mut conn)?;
    Ok(Json(row.into()))
}

#[derive(Serialize)]
pub struct StorageResponse {
    pub documents: i64,
    pub bytes: i64,
}

pub async fn storage(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> AppResult<Json<StorageResponse>> {
    let (documents, bytes) = state.engine().storage_usage(user.user_id)?;
    Ok(Json(StorageResponse { documents, bytes }))
}

#[derive(Deserialize)]
pub struct InviteRequest {
    pub email: String,
}

#[derive(Serialize)]
pub struct InvitationResponse {
    pub id: Uuid,
    pub email: String,
    pub expires_at: DateTime<Utc>,
    pub accepted: bool,
    pub created_at: DateTime<Utc>,
    /// Present only in the response to the creating request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl InvitationResponse {
    fn from_row(invitation: Invitation, token: Option<String>) -> Self {
        Self {
            id: invitation.id,
            email: invitation.email,
            expires_at: invitation.expires_at,
            accepted: invitation.accepted_at.is_some(),
            created_at: invitation.created_at,
            token,
        }
    }
}

pub async fn invite(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(payload): Json<InviteRequest>,
) -> AppResult<(StatusCode, Json<InvitationResponse>)> {
    if !user.is_admin() {
        return Err(AppError::forbidden());
    }
    let email = payload.email.trim().to_lowercase();
    if email.is_empty() || !email.contains('@') {
        return Err(AppError::bad_request("a valid email is required"));
    }

    let token = generate_invitation_token();
    let invitation = NewInvitation {
        id: Uuid::new_v4(),
        email,
        token: token.clone(),
        inviter_id: user.user_id,
        expires_at: Utc::now() + ChronoDuration::days(state.config.invitation_expiry_days),
    };

    let mut conn = state.db()?;
    diesel::insert_into(invitations::table)
        .values(&invitation)
        .execute(&mut conn)?;
    let row: Invitation = invitations_dsl::invitations
        .find(invitation.id)
        .first(&mut conn)?;

    Ok((
        StatusCode::CREATED,
        Json(InvitationResponse::from_row(row, Some(token))),
    ))
}

pub async fn list_invitations(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> AppResult<Json<Vec<InvitationResponse>>> {
    if !user.is_admin() {
        return Err(AppError::forbidden());
    }
    let mut conn = state.db()?;
    let rows: Vec<Invitation> = invitations_dsl::invitations
        .order(invitations_dsl::created_at.desc())
        .load(&mut conn)?;
    Ok(Json(
        rows.into_iter()
            .map(|row| InvitationResponse::from_row(row, None))
            .collect(),
    ))
}

pub async fn delete_invitation(
    State(state): State<AppState>,
    Path(invitation_id): Path<Uuid>,
    user: AuthenticatedUser,
) -> AppResult<StatusCode> {
    if !user.is_admin() {
        return Err(AppError::forbidden());
    }
    let mut conn = state.db()?;
    let deleted =
        diesel::delete(invitations_dsl::invitations.find(invitation_id)).execute(&mut conn)?;
    if deleted == 0 {
        return Err(AppError::not_found());
    }
    Ok(StatusCode::NO_CONTENT)
}

fn generate_invitation_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

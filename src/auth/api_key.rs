use chrono::Utc;
use diesel::prelude::*;
use rand::Rng;
use tracing::warn;
use uuid::Uuid;

use crate::auth::password;
use crate::db::PgPool;
use crate::error::{EngineError, EngineResult};
use crate::models::ApiKey;
use crate::schema::api_keys;

pub const KEY_PREFIX: &str = "ds_k_";
pub const KEY_BODY_LEN: usize = 40;
pub const STORED_PREFIX_LEN: usize = 8;

const KEY_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// A freshly issued key. `secret` is shown to the caller exactly once;
/// only `prefix` and `hash` are persisted.
pub struct GeneratedKey {
    pub secret: String,
    pub prefix: String,
    pub hash: String,
}

pub fn generate_api_key() -> anyhow::Result<GeneratedKey> {
    let mut rng = rand::thread_rng();
    let body: String = (0..KEY_BODY_LEN)
        .map(|_| KEY_CHARSET[rng.gen_range(0..KEY_CHARSET.len())] as char)
        .collect();
    let secret = format!("{KEY_PREFIX}{body}");
    let prefix = body[..STORED_PREFIX_LEN].to_string();
    let hash = password::hash_password(&secret)?;
    Ok(GeneratedKey {
        secret,
        prefix,
        hash,
    })
}

/// The verified identity an API key grants.
#[derive(Debug, Clone)]
pub struct ApiKeyIdentity {
    pub key_id: Uuid,
    pub user_id: Uuid,
    pub scopes: Vec<String>,
    pub vault_id: Option<Uuid>,
}

/// Verify a full API key per the prefix-index scheme: candidates sharing
/// the stored 8-char prefix are hash-compared one by one; expired keys are
/// rejected; `last_used_at` is updated off the request path.
pub fn verify_api_key(pool: &PgPool, full_key: &str) -> EngineResult<ApiKeyIdentity> {
    let body = full_key
        .strip_prefix(KEY_PREFIX)
        .ok_or(EngineError::Unauthenticated)?;
    if body.len() != KEY_BODY_LEN {
        return Err(EngineError::Unauthenticated);
    }
    let prefix = &body[..STORED_PREFIX_LEN];

    let mut conn = pool
        .get()
        .map_err(|err| EngineError::Upstream(format!("database pool error: {err}")))?;

    let candidates: Vec<ApiKey> = api_keys::table
        .filter(api_keys::key_prefix.eq(prefix))
        .filter(api_keys::is_active.eq(true))
        .load(&mut conn)?;
    drop(conn);

    let now = Utc::now();
    for candidate in candidates {
        let matches = password::verify_password(full_key, &candidate.key_hash)
            .map_err(|err| EngineError::Upstream(err.to_string()))?;
        if !matches {
            continue;
        }
        if let Some(expires_at) = candidate.expires_at {
            if now >= expires_at {
                return Err(EngineError::Unauthenticated);
            }
        }
        touch_last_used(pool.clone(), candidate.id);
        return Ok(ApiKeyIdentity {
            key_id: candidate.id,
            user_id: candidate.user_id,
            scopes: candidate.scope_list(),
            vault_id: candidate.vault_id,
        });
    }

    Err(EngineError::Unauthenticated)
}

/// Fire-and-forget usage stamp; the response never waits on it.
fn touch_last_used(pool: PgPool, key_id: Uuid) {
    tokio::spawn(async move {
        let result = tokio::task::spawn_blocking(move || -> EngineResult<()> {
            let mut conn = pool
                .get()
                .map_err(|err| EngineError::Upstream(format!("database pool error: {err}")))?;
            diesel::update(api_keys::table.find(key_id))
                .set(api_keys::last_used_at.eq(Utc::now()))
                .execute(&mut conn)?;
            Ok(())
        })
        .await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(%key_id, error = %err, "failed to update api key last_used_at"),
            Err(err) => warn!(%key_id, error = %err, "last_used_at task panicked"),
        }
    });
}

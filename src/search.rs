use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Float, Nullable, Text, Timestamptz, Uuid as SqlUuid};
use diesel::PgConnection;
use serde::Serialize;
use uuid::Uuid;

use crate::error::EngineResult;

pub const DEFAULT_LIMIT: i64 = 20;
pub const MAX_LIMIT: i64 = 100;

/// Rebuild the stored lexeme vector for one document. Runs inside the same
/// transaction as the row upsert so the vector can never lag the content.
pub fn update_search_vector(
    conn: &mut PgConnection,
    document_id: Uuid,
    title: &Option<String>,
    tags: &[String],
    stripped: &str,
) -> EngineResult<()> {
    let text = format!(
        "{} {} {}",
        title.as_deref().unwrap_or(""),
        tags.join(" "),
        stripped
    );
    diesel::sql_query(
        "UPDATE documents SET search_vector = to_tsvector('english', $1) WHERE id = $2",
    )
    .bind::<Text, _>(text)
    .bind::<SqlUuid, _>(document_id)
    .execute(conn)?;
    Ok(())
}

#[derive(Debug, QueryableByName, Serialize)]
pub struct SearchHit {
    #[diesel(sql_type = SqlUuid)]
    pub id: Uuid,
    #[diesel(sql_type = SqlUuid)]
    pub vault_id: Uuid,
    #[diesel(sql_type = Text)]
    pub path: String,
    #[diesel(sql_type = Nullable<Text>)]
    pub title: Option<String>,
    #[diesel(sql_type = Float)]
    pub rank: f32,
    #[diesel(sql_type = Timestamptz)]
    pub updated_at: DateTime<Utc>,
}

/// Full-text query over the caller's documents. The match and ordering are
/// delegated wholesale to Postgres; this layer only scopes and paginates.
pub fn search_documents(
    conn: &mut PgConnection,
    user_id: Uuid,
    query: &str,
    vault_id: Option<Uuid>,
    tags: &[String],
    limit: i64,
    offset: i64,
) -> EngineResult<Vec<SearchHit>> {
    let mut sql = String::from(
        "SELECT d.id, d.vault_id, d.path, d.title, \
         ts_rank(d.search_vector, q.query) AS rank, d.updated_at \
         FROM documents d \
         JOIN vaults v ON v.id = d.vault_id, \
         plainto_tsquery('english', $1) AS q(query) \
         WHERE v.user_id = $2 AND d.search_vector @@ q.query",
    );

    let mut next_bind = 3;
    let vault_bind = vault_id.map(|_| {
        let n = next_bind;
        sql.push_str(&format!(" AND d.vault_id = ${n}"));
        next_bind += 1;
        n
    });
    let tags_bind = (!tags.is_empty()).then(|| {
        let n = next_bind;
        sql.push_str(&format!(" AND d.tags @> ${n}::jsonb"));
        next_bind += 1;
        n
    });
    sql.push_str(&format!(
        " ORDER BY rank DESC, d.path ASC LIMIT ${} OFFSET ${}",
        next_bind,
        next_bind + 1
    ));

    // Binds must be applied in placeholder order.
    let mut statement = diesel::sql_query(sql)
        .into_boxed::<diesel::pg::Pg>()
        .bind::<Text, _>(query.to_string())
        .bind::<SqlUuid, _>(user_id);
    if vault_bind.is_some() {
        statement = statement.bind::<SqlUuid, _>(vault_id.expect("vault id present"));
    }
    if tags_bind.is_some() {
        let tags_json = serde_json::to_string(tags).unwrap_or_else(|_| "[]".to_string());
        statement = statement.bind::<Text, _>(tags_json);
    }
    let hits = statement
        .bind::<BigInt, _>(limit)
        .bind::<BigInt, _>(offset)
        .load::<SearchHit>(conn)?;
    Ok(hits)
}

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use diesel::dsl::max;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, PooledConnection};
use diesel::result::DatabaseErrorKind;
use diesel::PgConnection;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::db::PgPool;
use crate::error::{EngineError, EngineResult};
use crate::fs;
use crate::markdown;
use crate::models::{
    to_json_string_array, Document, DocumentVersion, NewDocument, NewDocumentVersion, Vault,
};
use crate::paths::{escape_like, validate_rel_path};
use crate::schema::{document_versions, documents, vaults};
use crate::search;
use crate::sync::SyncCoordinator;

type PooledPg = PooledConnection<ConnectionManager<PgConnection>>;

/// Root directory of a vault on disk: `DATA_DIR/{userId}/{vaultSlug}`.
pub fn vault_root(data_dir: &Path, user_id: Uuid, slug: &str) -> PathBuf {
    data_dir.join(user_id.to_string()).join(slug)
}

pub fn content_hash(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Serialize)]
pub struct TreeNode {
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<TreeNode>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    File,
    Directory,
}

/// The upsert/delete/move/copy surface over `(vault, path)`. Every public
/// operation authorizes against the owning user, keeps disk and database in
/// step, and marks its own disk mutations with the sync coordinator before
/// touching the database.
#[derive(Clone)]
pub struct DocumentEngine {
    pool: PgPool,
    config: Arc<AppConfig>,
    sync: Arc<SyncCoordinator>,
}

impl DocumentEngine {
    pub fn new(pool: PgPool, config: Arc<AppConfig>, sync: Arc<SyncCoordinator>) -> Self {
        Self { pool, config, sync }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.sync
    }

    fn db(&self) -> EngineResult<PooledPg> {
        self.pool
            .get()
            .map_err(|err| EngineError::Upstream(format!("database pool error: {err}")))
    }

    /// Load the vault and verify ownership. A vault another user owns is
    /// reported as absent rather than forbidden.
    pub fn load_vault(&self, user_id: Uuid, vault_id: Uuid) -> EngineResult<Vault> {
        let mut conn = self.db()?;
        let vault: Option<Vault> = vaults::table
            .filter(vaults::id.eq(vault_id))
            .filter(vaults::user_id.eq(user_id))
            .first(&mut conn)
            .optional()?;
        vault.ok_or(EngineError::NotFound)
    }

    pub fn user_exists(&self, user_id: Uuid) -> EngineResult<bool> {
        use crate::schema::users;
        let mut conn = self.db()?;
        let found: i64 = users::table
            .filter(users::id.eq(user_id))
            .count()
            .first(&mut conn)?;
        Ok(found > 0)
    }

    pub fn load_vault_by_slug(&self, user_id: Uuid, slug: &str) -> EngineResult<Vault> {
        let mut conn = self.db()?;
        let vault: Option<Vault> = vaults::table
            .filter(vaults::user_id.eq(user_id))
            .filter(vaults::slug.eq(slug))
            .first(&mut conn)
            .optional()?;
        vault.ok_or(EngineError::NotFound)
    }

    fn root_for(&self, vault: &Vault) -> PathBuf {
        vault_root(&self.config.data_dir, vault.user_id, &vault.slug)
    }

    /// Create or update the document at `(vault, path)`.
    ///
    /// Unchanged content (same SHA-256) short-circuits before any disk or
    /// version write, which is what makes watcher replays and reconciler
    /// passes idempotent. Otherwise: write disk atomically, mark the path
    /// recently-written, then upsert row + version + search vector in one
    /// transaction.
    pub async fn put(
        &self,
        user_id: Uuid,
        vault_id: Uuid,
        path: &str,
        content: &str,
        source: &str,
    ) -> EngineResult<(Document, bool)> {
        validate_rel_path(path)?;
        let vault = self.load_vault(user_id, vault_id)?;
        self.put_in_vault(user_id, &vault, path, content, source)
            .await
    }

    /// Same as `put` but with the vault row already resolved; used by the
    /// watcher and reconciler which look vaults up by on-disk location.
    pub async fn put_in_vault(
        &self,
        user_id: Uuid,
        vault: &Vault,
        path: &str,
        content: &str,
        source: &str,
    ) -> EngineResult<(Document, bool)> {
        validate_rel_path(path)?;
        let hash = content_hash(content.as_bytes());
        let size = content.len() as i64;

        {
            let mut conn = self.db()?;
            let existing: Option<Document> = documents::table
                .filter(documents::vault_id.eq(vault.id))
                .filter(documents::path.eq(path))
                .first(&mut conn)
                .optional()?;
            if let Some(doc) = existing {
                if doc.content_hash == hash {
                    debug!(vault_id = %vault.id, path, "content unchanged, skipping write");
                    return Ok((doc, false));
                }
            }
        }

        let root = self.root_for(vault);
        let abs = fs::write_file_atomic(&root, path, content.as_bytes()).await?;
        // Published before the first database await so the watcher observes
        // the marker no matter how quickly the rename event fires.
        self.sync.mark_written(&abs);

        let meta = markdown::extract(content);
        let doc = self.upsert_row(vault.id, user_id, path, &hash, size, &meta, source)?;
        Ok((doc, true))
    }

    fn upsert_row(
        &self,
        vault_id: Uuid,
        user_id: Uuid,
        path: &str,
        hash: &str,
        size: i64,
        meta: &markdown::DocMetadata,
        source: &str,
    ) -> EngineResult<Document> {
        let mut conn = self.db()?;
        let result = self.upsert_row_tx(&mut conn, vault_id, user_id, path, hash, size, meta, source);
        match result {
            Err(EngineError::Conflict(_)) => {
                // Lost a create race; the row exists now, retry as update.
                self.upsert_row_tx(&mut conn, vault_id, user_id, path, hash, size, meta, source)
            }
            other => other,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn upsert_row_tx(
        &self,
        conn: &mut PgConnection,
        vault_id: Uuid,
        user_id: Uuid,
        path: &str,
        hash: &str,
        size: i64,
        meta: &markdown::DocMetadata,
        source: &str,
    ) -> EngineResult<Document> {
        let now = Utc::now();
        let tags = to_json_string_array(&meta.tags);

        let doc = conn
            .transaction::<Document, EngineError, _>(|conn| {
                // FOR UPDATE serializes concurrent appenders on the same
                // document, keeping version numbering contiguous.
                let existing: Option<Document> = documents::table
                    .filter(documents::vault_id.eq(vault_id))
                    .filter(documents::path.eq(path))
                    .for_update()
                    .first(conn)
                    .optional()?;

                let doc: Document = match existing {
                    Some(doc) => {
                        if doc.content_hash == hash {
                            return Ok(doc);
                        }
                        diesel::update(documents::table.find(doc.id))
                            .set((
                                documents::title.eq(meta.title.clone()),
                                documents::content_hash.eq(hash),
                                documents::size_bytes.eq(size),
                                documents::frontmatter.eq(meta.frontmatter.clone()),
                                documents::tags.eq(tags.clone()),
                                documents::stripped_content.eq(&meta.stripped),
                                documents::file_modified_at.eq(now),
                                documents::updated_at.eq(now),
                            ))
                            .execute(conn)?;
                        documents::table.find(doc.id).first(conn)?
                    }
                    None => {
                        let new_doc = NewDocument {
                            id: Uuid::new_v4(),
                            vault_id,
                            path: path.to_string(),
                            title: meta.title.clone(),
                            content_hash: hash.to_string(),
                            size_bytes: size,
                            frontmatter: meta.frontmatter.clone(),
                            tags: tags.clone(),
                            stripped_content: meta.stripped.clone(),
                            file_created_at: now,
                            file_modified_at: now,
                        };
                        match diesel::insert_into(documents::table)
                            .values(&new_doc)
                            .execute(conn)
                        {
                            Ok(_) => {}
                            Err(diesel::result::Error::DatabaseError(
                                DatabaseErrorKind::UniqueViolation,
                                _,
                            )) => {
                                return Err(EngineError::Conflict(
                                    "document created concurrently".into(),
                                ))
                            }
                            Err(err) => return Err(err.into()),
                        }
                        documents::table.find(new_doc.id).first(conn)?
                    }
                };

                let next_version: i32 = document_versions::table
                    .filter(document_versions::document_id.eq(doc.id))
                    .select(max(document_versions::version_num))
                    .first::<Option<i32>>(conn)?
                    .unwrap_or(0)
                    + 1;

                diesel::insert_into(document_versions::table)
                    .values(&NewDocumentVersion {
                        id: Uuid::new_v4(),
                        document_id: doc.id,
                        version_num: next_version,
                        content_hash: hash.to_string(),
                        size_bytes: size,
                        change_source: source.to_string(),
                        changed_by: user_id,
                    })
                    .execute(conn)?;

                search::update_search_vector(conn, doc.id, &meta.title, &meta.tags, &meta.stripped)?;

                Ok(doc)
            })?;

        Ok(doc)
    }

    /// Fetch the document row and its on-disk content.
    pub async fn get(
        &self,
        user_id: Uuid,
        vault_id: Uuid,
        path: &str,
    ) -> EngineResult<(Document, String)> {
        validate_rel_path(path)?;
        let vault = self.load_vault(user_id, vault_id)?;
        let doc = self.find_document(vault.id, path)?.ok_or(EngineError::NotFound)?;
        let bytes = fs::read_file(&self.root_for(&vault), path).await?;
        let content = String::from_utf8(bytes)
            .map_err(|_| EngineError::Upstream("document is not valid UTF-8".into()))?;
        Ok((doc, content))
    }

    pub fn find_document(&self, vault_id: Uuid, path: &str) -> EngineResult<Option<Document>> {
        let mut conn = self.db()?;
        Ok(documents::table
            .filter(documents::vault_id.eq(vault_id))
            .filter(documents::path.eq(path))
            .first(&mut conn)
            .optional()?)
    }

    /// Delete a document, or a directory and every document under it.
    pub async fn remove(&self, user_id: Uuid, vault_id: Uuid, path: &str) -> EngineResult<usize> {
        validate_rel_path(path)?;
        let vault = self.load_vault(user_id, vault_id)?;
        let root = self.root_for(&vault);

        if let Some(doc) = self.find_document(vault.id, path)? {
            let abs = root.join(path);
            self.sync.mark_written(&abs);
            match fs::delete_file(&root, path).await {
                Ok(()) | Err(EngineError::NotFound) => {}
                Err(err) => return Err(err),
            }
            let mut conn = self.db()?;
            diesel::delete(documents::table.find(doc.id)).execute(&mut conn)?;
            return Ok(1);
        }

        if fs::path_kind(&root, path).await? == fs::PathKind::Directory {
            let prefix = format!("{}/%", escape_like(path));
            let mut conn = self.db()?;
            let removed = diesel::delete(
                documents::table
                    .filter(documents::vault_id.eq(vault.id))
                    .filter(documents::path.like(prefix).escape('\\')),
            )
            .execute(&mut conn)?;
            drop(conn);
            self.sync.mark_written(&root.join(path));
            fs::delete_dir(&root, path).await?;
            return Ok(removed);
        }

        Err(EngineError::NotFound)
    }

    /// Rename a document or a directory subtree. Destination collisions
    /// fail `Conflict` unless `overwrite` is set.
    pub async fn rename(
        &self,
        user_id: Uuid,
        vault_id: Uuid,
        src: &str,
        dst: &str,
        overwrite: bool,
    ) -> EngineResult<()> {
        validate_rel_path(src)?;
        validate_rel_path(dst)?;
        if src == dst {
            return Ok(());
        }
        let vault = self.load_vault(user_id, vault_id)?;
        let root = self.root_for(&vault);

        let src_doc = self.find_document(vault.id, src)?;
        let src_kind = fs::path_kind(&root, src).await?;
        if src_doc.is_none() && src_kind != fs::PathKind::Directory {
            return Err(EngineError::NotFound);
        }

        let dst_doc = self.find_document(vault.id, dst)?;
        let dst_kind = fs::path_kind(&root, dst).await?;
        if dst_doc.is_some() || dst_kind != fs::PathKind::Missing {
            if !overwrite {
                return Err(EngineError::Conflict(format!("{dst} already exists")));
            }
            if let Some(doc) = &dst_doc {
                let mut conn = self.db()?;
                diesel::delete(documents::table.find(doc.id)).execute(&mut conn)?;
            }
            match dst_kind {
                fs::PathKind::File => {
                    let _ = fs::delete_file(&root, dst).await;
                }
                fs::PathKind::Directory => {
                    self.remove_dir_rows(vault.id, dst)?;
                    fs::delete_dir(&root, dst).await?;
                }
                fs::PathKind::Missing => {}
            }
        }

        self.sync.mark_written(&root.join(src));
        self.sync.mark_written(&root.join(dst));
        fs::move_path(&root, src, dst).await?;

        let mut conn = self.db()?;
        if let Some(doc) = src_doc {
            let now = Utc::now();
            diesel::update(documents::table.find(doc.id))
                .set((documents::path.eq(dst), documents::updated_at.eq(now)))
                .execute(&mut conn)?;
        } else {
            self.rewrite_prefix(&mut conn, vault.id, src, dst)?;
        }
        Ok(())
    }

    fn remove_dir_rows(&self, vault_id: Uuid, dir: &str) -> EngineResult<usize> {
        let mut conn = self.db()?;
        let prefix = format!("{}/%", escape_like(dir));
        Ok(diesel::delete(
            documents::table
                .filter(documents::vault_id.eq(vault_id))
                .filter(documents::path.like(prefix).escape('\\')),
        )
        .execute(&mut conn)?)
    }

    /// Repoint every document under `src/` to `dst/` in one transaction.
    fn rewrite_prefix(
        &self,
        conn: &mut PgConnection,
        vault_id: Uuid,
        src: &str,
        dst: &str,
    ) -> EngineResult<()> {
        let prefix = format!("{}/%", escape_like(src));
        conn.transaction::<(), EngineError, _>(|conn| {
            let children: Vec<Document> = documents::table
                .filter(documents::vault_id.eq(vault_id))
                .filter(documents::path.like(&prefix).escape('\\'))
                .for_update()
                .load(conn)?;
            let now = Utc::now();
            for child in children {
                let rewritten = format!("{dst}/{}", &child.path[src.len() + 1..]);
                diesel::update(documents::table.find(child.id))
                    .set((
                        documents::path.eq(rewritten),
                        documents::updated_at.eq(now),
                    ))
                    .execute(conn)?;
            }
            Ok(())
        })
    }

    /// Copy a document or directory. Copies are new document identities:
    /// their version chains restart at 1.
    pub async fn copy(
        &self,
        user_id: Uuid,
        vault_id: Uuid,
        src: &str,
        dst: &str,
        overwrite: bool,
        source: &str,
    ) -> EngineResult<()> {
        validate_rel_path(src)?;
        validate_rel_path(dst)?;
        if src == dst {
            return Err(EngineError::Conflict("source and destination are equal".into()));
        }
        let vault = self.load_vault(user_id, vault_id)?;
        let root = self.root_for(&vault);

        let dst_doc = self.find_document(vault.id, dst)?;
        let dst_kind = fs::path_kind(&root, dst).await?;
        if dst_doc.is_some() || dst_kind != fs::PathKind::Missing {
            if !overwrite {
                return Err(EngineError::Conflict(format!("{dst} already exists")));
            }
            if let Some(doc) = &dst_doc {
                let mut conn = self.db()?;
                diesel::delete(documents::table.find(doc.id)).execute(&mut conn)?;
            }
            if dst_kind == fs::PathKind::Directory {
                self.remove_dir_rows(vault.id, dst)?;
                fs::delete_dir(&root, dst).await?;
            }
        }

        match fs::path_kind(&root, src).await? {
            fs::PathKind::File => {
                let bytes = fs::read_file(&root, src).await?;
                let content = String::from_utf8(bytes)
                    .map_err(|_| EngineError::Upstream("document is not valid UTF-8".into()))?;
                self.put_in_vault(user_id, &vault, dst, &content, source)
                    .await?;
            }
            fs::PathKind::Directory => {
                self.sync.mark_written(&root.join(dst));
                fs::copy_dir_recursive(&root, src, dst).await?;
                let copied_root = root.join(dst);
                for rel in fs::list_markdown_files(&copied_root)? {
                    let dst_path = format!("{dst}/{rel}");
                    let bytes = fs::read_file(&root, &dst_path).await?;
                    if let Ok(content) = String::from_utf8(bytes) {
                        self.put_in_vault(user_id, &vault, &dst_path, &content, source)
                            .await?;
                    }
                }
            }
            fs::PathKind::Missing => return Err(EngineError::NotFound),
        }
        Ok(())
    }

    /// Documents in a vault ordered by path, optionally restricted to a
    /// directory prefix. Wildcards in the prefix are escaped, not patterns.
    pub fn list(
        &self,
        user_id: Uuid,
        vault_id: Uuid,
        dir: Option<&str>,
    ) -> EngineResult<Vec<Document>> {
        let vault = self.load_vault(user_id, vault_id)?;
        let mut conn = self.db()?;
        let mut query = documents::table
            .filter(documents::vault_id.eq(vault.id))
            .into_boxed();
        if let Some(dir) = dir {
            validate_rel_path(dir)?;
            let prefix = format!("{}/%", escape_like(dir));
            query = query.filter(documents::path.like(prefix).escape('\\'));
        }
        Ok(query.order(documents::path.asc()).load(&mut conn)?)
    }

    /// Fold the vault's sorted paths into a directory tree.
    pub fn tree(&self, user_id: Uuid, vault_id: Uuid) -> EngineResult<Vec<TreeNode>> {
        let vault = self.load_vault(user_id, vault_id)?;
        let mut conn = self.db()?;
        let paths: Vec<String> = documents::table
            .filter(documents::vault_id.eq(vault.id))
            .select(documents::path)
            .order(documents::path.asc())
            .load(&mut conn)?;
        Ok(fold_tree(&paths))
    }

    pub fn versions(
        &self,
        user_id: Uuid,
        vault_id: Uuid,
        path: &str,
    ) -> EngineResult<Vec<DocumentVersion>> {
        validate_rel_path(path)?;
        let vault = self.load_vault(user_id, vault_id)?;
        let doc = self.find_document(vault.id, path)?.ok_or(EngineError::NotFound)?;
        let mut conn = self.db()?;
        Ok(document_versions::table
            .filter(document_versions::document_id.eq(doc.id))
            .order(document_versions::version_num.desc())
            .load(&mut conn)?)
    }

    /// Database half of an already-performed disk move: repoint the moved
    /// document (or subtree) and drop any rows the overwrite displaced.
    /// Used by the WebDAV layer, whose disk mutation happens first.
    pub fn relocate_rows(&self, vault_id: Uuid, src: &str, dst: &str) -> EngineResult<()> {
        {
            let mut conn = self.db()?;
            diesel::delete(
                documents::table
                    .filter(documents::vault_id.eq(vault_id))
                    .filter(documents::path.eq(dst)),
            )
            .execute(&mut conn)?;
        }
        self.remove_dir_rows(vault_id, dst)?;

        let mut conn = self.db()?;
        let moved: Option<Document> = documents::table
            .filter(documents::vault_id.eq(vault_id))
            .filter(documents::path.eq(src))
            .first(&mut conn)
            .optional()?;
        if let Some(doc) = moved {
            let now = Utc::now();
            diesel::update(documents::table.find(doc.id))
                .set((documents::path.eq(dst), documents::updated_at.eq(now)))
                .execute(&mut conn)?;
        } else {
            drop(conn);
            let mut conn = self.db()?;
            self.rewrite_prefix(&mut conn, vault_id, src, dst)?;
        }
        Ok(())
    }

    /// Drop every document row under `dir/`. Disk is not touched.
    pub fn delete_rows_under(&self, vault_id: Uuid, dir: &str) -> EngineResult<usize> {
        self.remove_dir_rows(vault_id, dir)
    }

    /// Watcher unlink handler: the file is already gone, only the row goes.
    pub fn delete_row(&self, vault_id: Uuid, path: &str) -> EngineResult<usize> {
        let mut conn = self.db()?;
        Ok(diesel::delete(
            documents::table
                .filter(documents::vault_id.eq(vault_id))
                .filter(documents::path.eq(path)),
        )
        .execute(&mut conn)?)
    }

    /// Document count and total bytes across all of a user's vaults.
    pub fn storage_usage(&self, user_id: Uuid) -> EngineResult<(i64, i64)> {
        use diesel::dsl::{count_star, sql};
        use diesel::sql_types::{BigInt, Nullable};
        let mut conn = self.db()?;
        let (count, bytes): (i64, Option<i64>) = documents::table
            .inner_join(vaults::table)
            .filter(vaults::user_id.eq(user_id))
            .select((
                count_star(),
                sql::<Nullable<BigInt>>("CAST(SUM(documents.size_bytes) AS BIGINT)"),
            ))
            .first(&mut conn)?;
        Ok((count, bytes.unwrap_or(0)))
    }
}

fn fold_tree(paths: &[String]) -> Vec<TreeNode> {
    let mut roots: Vec<TreeNode> = Vec::new();
    for path in paths {
        insert_path(&mut roots, path);
    }
    roots
}

fn insert_path(nodes: &mut Vec<TreeNode>, path: &str) {
    let mut current = nodes;
    let segments: Vec<&str> = path.split('/').collect();
    let mut walked = String::new();

    for (index, segment) in segments.iter().enumerate() {
        if !walked.is_empty() {
            walked.push('/');
        }
        walked.push_str(segment);
        let is_leaf = index == segments.len() - 1;

        if is_leaf {
            current.push(TreeNode {
                name: (*segment).to_string(),
                path: walked.clone(),
                kind: NodeKind::File,
                children: None,
            });
            return;
        }

        let position = current
            .iter()
            .position(|node| node.kind == NodeKind::Directory && node.name == *segment);
        let position = match position {
            Some(found) => found,
            None => {
                current.push(TreeNode {
                    name: (*segment).to_string(),
                    path: walked.clone(),
                    kind: NodeKind::Directory,
                    children: Some(Vec::new()),
                });
                current.len() - 1
            }
        };
        current = current[position]
            .children
            .as_mut()
            .expect("directory node has children");
    }
}

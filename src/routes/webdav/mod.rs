use std::path::{Path as FsPath, PathBuf};

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::Response;
use axum::Router;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use percent_encoding::{percent_decode_str, utf8_percent_encode, NON_ALPHANUMERIC};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::auth::api_key;
use crate::engine::{vault_root, DocumentEngine};
use crate::error::{AppError, EngineError};
use crate::fs as vault_fs;
use crate::models::{User, Vault, SCOPE_READ, SCOPE_WRITE, SOURCE_WEBDAV};
use crate::paths::validate_rel_path;
use crate::state::AppState;

const REALM: &str = "mdvault WebDAV";
const ALLOWED_METHODS: &str =
    "OPTIONS, PROPFIND, GET, HEAD, PUT, DELETE, MKCOL, MOVE, COPY, LOCK, UNLOCK";

pub fn create_router() -> Router<AppState> {
    Router::new().fallback(webdav_entrypoint)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Depth {
    Zero,
    One,
    Infinity,
}

struct DavContext {
    user: User,
    vault: Vault,
    root: PathBuf,
    rel: String,
}

async fn webdav_entrypoint(
    State(state): State<AppState>,
    req: axum::http::Request<Body>,
) -> Result<Response, AppError> {
    let method = req.method().clone();
    let headers = req.headers().clone();
    let path = req.uri().path().trim_start_matches('/').to_string();

    debug!(method = %method, %path, "webdav request");

    if method == Method::OPTIONS {
        return Ok(handle_options());
    }

    let user = match authenticate(&state, &headers).await? {
        Some(user) => user,
        None => return Ok(unauthorized_response()),
    };

    let (slug, rel) = match split_vault_path(&path) {
        Ok(parts) => parts,
        Err(response) => return Ok(response),
    };
    if !rel.is_empty() && validate_rel_path(&rel).is_err() {
        return Ok(status_response(StatusCode::FORBIDDEN));
    }

    let (identity, user_row) = user;
    let vault = match state.engine().load_vault_by_slug(user_row.id, &slug) {
        Ok(vault) => vault,
        Err(EngineError::NotFound) => return Ok(status_response(StatusCode::NOT_FOUND)),
        Err(err) => return Err(AppError::from(err)),
    };
    if let Some(scoped) = identity.vault_id {
        if scoped != vault.id {
            return Ok(status_response(StatusCode::FORBIDDEN));
        }
    }

    let mutating = !matches!(
        method.as_str(),
        "GET" | "HEAD" | "PROPFIND" | "LOCK" | "UNLOCK"
    );
    let required = if mutating { SCOPE_WRITE } else { SCOPE_READ };
    if !identity.scopes.iter().any(|s| s == required) {
        return Ok(status_response(StatusCode::FORBIDDEN));
    }

    let ctx = DavContext {
        root: vault_root(&state.config.data_dir, user_row.id, &vault.slug),
        user: user_row,
        vault,
        rel,
    };

    match method.as_str() {
        "PROPFIND" => handle_propfind(&ctx, &headers).await,
        "GET" | "HEAD" => handle_get_or_head(&ctx, &method).await,
        "PUT" => handle_put(&state, &ctx, req.into_body()).await,
        "DELETE" => handle_delete(&state, &ctx).await,
        "MKCOL" => handle_mkcol(&ctx).await,
        "MOVE" => handle_move_or_copy(&state, &ctx, &headers, true).await,
        "COPY" => handle_move_or_copy(&state, &ctx, &headers, false).await,
        "LOCK" => Ok(handle_lock(&ctx)),
        "UNLOCK" => Ok(status_response(StatusCode::NO_CONTENT)),
        _ => Ok(status_response(StatusCode::METHOD_NOT_ALLOWED)),
    }
}

fn handle_options() -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header("DAV", "1, 2")
        .header(header::ALLOW, ALLOWED_METHODS)
        .body(Body::empty())
        .expect("valid OPTIONS response")
}

fn status_response(status: StatusCode) -> Response {
    Response::builder()
        .status(status)
        .body(Body::empty())
        .expect("valid response")
}

fn unauthorized_response() -> Response {
    Response::builder()
        .status(StatusCode::UNAUTHORIZED)
        .header(
            header::WWW_AUTHENTICATE,
            format!("Basic realm=\"{REALM}\", charset=\"UTF-8\""),
        )
        .body(Body::empty())
        .expect("valid response")
}

fn multi_status() -> StatusCode {
    StatusCode::from_u16(207).expect("valid multi-status")
}

/// Basic credentials carry `email:apiKey`. The email must belong to the
/// key's owner; a key pasted next to someone else's address is rejected.
async fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<Option<(api_key::ApiKeyIdentity, User)>, AppError> {
    let encoded = match headers.get(header::AUTHORIZATION) {
        Some(value) => match value.to_str() {
            Ok(header) if header.starts_with("Basic ") => &header[6..],
            _ => return Ok(None),
        },
        None => return Ok(None),
    };

    let decoded = match BASE64.decode(encoded) {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(error = %err, "failed to decode basic credentials");
            return Ok(None);
        }
    };
    let credential_str = match String::from_utf8(decoded) {
        Ok(value) => value,
        Err(_) => return Ok(None),
    };
    let (email, key) = match credential_str.split_once(':') {
        Some((email, key)) if !email.is_empty() => (email.to_string(), key.to_string()),
        _ => return Ok(None),
    };

    let pool = state.pool.clone();
    let identity = match tokio::task::spawn_blocking(move || api_key::verify_api_key(&pool, &key))
        .await
        .map_err(|err| AppError::internal(format!("api key verification panicked: {err}")))?
    {
        Ok(identity) => identity,
        Err(EngineError::Unauthenticated) => return Ok(None),
        Err(err) => return Err(AppError::from(err)),
    };

    use crate::schema::users::dsl as users_dsl;
    let mut conn = state.db()?;
    let user: User = match users_dsl::users.find(identity.user_id).first(&mut conn) {
        Ok(user) => user,
        Err(diesel::result::Error::NotFound) => return Ok(None),
        Err(err) => return Err(AppError::from(err)),
    };
    if !user.is_active || !user.email.eq_ignore_ascii_case(&email) {
        warn!(%email, "webdav credentials do not match key owner");
        return Ok(None);
    }

    Ok(Some((identity, user)))
}

/// `{vaultSlug}/{relPath*}` with each segment percent-decoded once.
fn split_vault_path(path: &str) -> Result<(String, String), Response> {
    let mut segments = Vec::new();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        match percent_decode_str(segment).decode_utf8() {
            Ok(decoded) => segments.push(decoded.into_owned()),
            Err(_) => return Err(status_response(StatusCode::BAD_REQUEST)),
        }
    }
    if segments.is_empty() {
        return Err(status_response(StatusCode::NOT_FOUND));
    }
    let slug = segments.remove(0);
    Ok((slug, segments.join("/")))
}

async fn handle_propfind(ctx: &DavContext, headers: &HeaderMap) -> Result<Response, AppError> {
    let depth = match parse_depth(headers) {
        Ok(depth) => depth,
        Err(response) => return Ok(response),
    };

    let kind = if ctx.rel.is_empty() {
        if ctx.root.is_dir() {
            vault_fs::PathKind::Directory
        } else {
            vault_fs::PathKind::Missing
        }
    } else {
        vault_fs::path_kind(&ctx.root, &ctx.rel).await?
    };
    if kind == vault_fs::PathKind::Missing {
        return Ok(status_response(StatusCode::NOT_FOUND));
    }

    let mut entries = Vec::new();
    collect_entry(&ctx.root, &ctx.rel, kind, &mut entries).await?;
    if kind == vault_fs::PathKind::Directory && depth != Depth::Zero {
        collect_children(&ctx.root, &ctx.rel, depth, &mut entries).await?;
    }

    let body = render_multistatus(&ctx.vault.slug, &entries)
        .map_err(|err| AppError::internal(format!("failed to render multistatus: {err}")))?;

    Ok(Response::builder()
        .status(multi_status())
        .header(header::CONTENT_TYPE, "application/xml; charset=utf-8")
        .body(Body::from(body))
        .expect("valid response"))
}

async fn handle_get_or_head(ctx: &DavContext, method: &Method) -> Result<Response, AppError> {
    if ctx.rel.is_empty() {
        return Ok(status_response(StatusCode::METHOD_NOT_ALLOWED));
    }
    match vault_fs::path_kind(&ctx.root, &ctx.rel).await? {
        vault_fs::PathKind::Missing => return Ok(status_response(StatusCode::NOT_FOUND)),
        vault_fs::PathKind::Directory => {
            return Ok(status_response(StatusCode::METHOD_NOT_ALLOWED))
        }
        vault_fs::PathKind::File => {}
    }

    let abs = ctx.root.join(&ctx.rel);
    let meta = tokio::fs::metadata(&abs).await?;
    let mtime: DateTime<Utc> = meta.modified().map(DateTime::from).unwrap_or_else(|_| Utc::now());
    let content_type = mime_guess::from_path(&abs)
        .first_or_octet_stream()
        .to_string();

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_LENGTH, meta.len())
        .header(header::ETAG, format!("\"{}\"", etag_value(&meta)))
        .header(header::LAST_MODIFIED, format_http_date(mtime));
    builder = builder.header("Accept-Ranges", "bytes");

    if method == Method::HEAD {
        return builder
            .body(Body::empty())
            .map_err(|err| AppError::internal(err));
    }

    let bytes = vault_fs::read_file(&ctx.root, &ctx.rel).await?;
    builder
        .body(Body::from(bytes))
        .map_err(|err| AppError::internal(err))
}

async fn handle_put(
    state: &AppState,
    ctx: &DavContext,
    body: Body,
) -> Result<Response, AppError> {
    if ctx.rel.is_empty() {
        return Ok(status_response(StatusCode::METHOD_NOT_ALLOWED));
    }
    if vault_fs::path_kind(&ctx.root, &ctx.rel).await? == vault_fs::PathKind::Directory {
        return Ok(status_response(StatusCode::METHOD_NOT_ALLOWED));
    }

    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|err| AppError::bad_request(format!("failed to read request body: {err}")))?;

    let existed = vault_fs::path_kind(&ctx.root, &ctx.rel).await? == vault_fs::PathKind::File;
    let abs = vault_fs::write_file_atomic(&ctx.root, &ctx.rel, &bytes).await?;
    state.sync.mark_written(&abs);

    spawn_document_refresh(state, ctx, bytes.to_vec());

    Ok(status_response(if existed {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::CREATED
    }))
}

async fn handle_delete(state: &AppState, ctx: &DavContext) -> Result<Response, AppError> {
    if ctx.rel.is_empty() {
        return Ok(status_response(StatusCode::FORBIDDEN));
    }
    match vault_fs::path_kind(&ctx.root, &ctx.rel).await? {
        vault_fs::PathKind::Missing => Ok(status_response(StatusCode::NOT_FOUND)),
        vault_fs::PathKind::File => {
            state.sync.mark_written(&ctx.root.join(&ctx.rel));
            vault_fs::delete_file(&ctx.root, &ctx.rel).await?;
            if is_synced_markdown(&ctx.rel) {
                let engine = state.engine();
                let vault_id = ctx.vault.id;
                let rel = ctx.rel.clone();
                tokio::spawn(async move {
                    if let Err(err) =
                        tokio::task::spawn_blocking(move || engine.delete_row(vault_id, &rel)).await
                    {
                        warn!(error = %err, "webdav delete row task failed");
                    }
                });
            }
            Ok(status_response(StatusCode::NO_CONTENT))
        }
        vault_fs::PathKind::Directory => {
            state.sync.mark_written(&ctx.root.join(&ctx.rel));
            vault_fs::delete_dir(&ctx.root, &ctx.rel).await?;
            let engine = state.engine();
            let vault_id = ctx.vault.id;
            let rel = ctx.rel.clone();
            tokio::spawn(async move {
                if let Err(err) =
                    tokio::task::spawn_blocking(move || engine.delete_rows_under(vault_id, &rel))
                        .await
                {
                    warn!(error = %err, "webdav delete subtree task failed");
                }
            });
            Ok(status_response(StatusCode::NO_CONTENT))
        }
    }
}

async fn handle_mkcol(ctx: &DavContext) -> Result<Response, AppError> {
    if ctx.rel.is_empty() {
        return Ok(status_response(StatusCode::METHOD_NOT_ALLOWED));
    }
    if vault_fs::path_kind(&ctx.root, &ctx.rel).await? != vault_fs::PathKind::Missing {
        return Ok(status_response(StatusCode::METHOD_NOT_ALLOWED));
    }
    if let Some((parent, _)) = ctx.rel.rsplit_once('/') {
        if vault_fs::path_kind(&ctx.root, parent).await? != vault_fs::PathKind::Directory {
            return Ok(status_response(StatusCode::CONFLICT));
        }
    }
    vault_fs::create_dir(&ctx.root, &ctx.rel).await?;
    Ok(status_response(StatusCode::CREATED))
}

async fn handle_move_or_copy(
    state: &AppState,
    ctx: &DavContext,
    headers: &HeaderMap,
    is_move: bool,
) -> Result<Response, AppError> {
    if ctx.rel.is_empty() {
        return Ok(status_response(StatusCode::FORBIDDEN));
    }
    let src_kind = vault_fs::path_kind(&ctx.root, &ctx.rel).await?;
    if src_kind == vault_fs::PathKind::Missing {
        return Ok(status_response(StatusCode::NOT_FOUND));
    }

    let dst = match parse_destination(headers, &ctx.vault.slug) {
        Ok(dst) => dst,
        Err(response) => return Ok(response),
    };
    let overwrite = headers
        .get("Overwrite")
        .and_then(|v| v.to_str().ok())
        .map(|v| !v.eq_ignore_ascii_case("F"))
        .unwrap_or(true);

    let dst_existed = vault_fs::path_kind(&ctx.root, &dst).await? != vault_fs::PathKind::Missing;
    if dst_existed && !overwrite {
        return Ok(status_response(StatusCode::PRECONDITION_FAILED));
    }

    if is_move {
        if dst_existed {
            match vault_fs::path_kind(&ctx.root, &dst).await? {
                vault_fs::PathKind::Directory => vault_fs::delete_dir(&ctx.root, &dst).await?,
                vault_fs::PathKind::File => vault_fs::delete_file(&ctx.root, &dst).await?,
                vault_fs::PathKind::Missing => {}
            }
        }
        state.sync.mark_written(&ctx.root.join(&ctx.rel));
        state.sync.mark_written(&ctx.root.join(&dst));
        vault_fs::move_path(&ctx.root, &ctx.rel, &dst).await?;

        let engine = state.engine();
        let vault_id = ctx.vault.id;
        let src = ctx.rel.clone();
        let dst_clone = dst.clone();
        tokio::spawn(async move {
            if let Err(err) = tokio::task::spawn_blocking(move || {
                engine.relocate_rows(vault_id, &src, &dst_clone)
            })
            .await
            {
                warn!(error = %err, "webdav move resync task failed");
            }
        });
    } else {
        state.sync.mark_written(&ctx.root.join(&dst));
        match src_kind {
            vault_fs::PathKind::File => {
                vault_fs::copy_file(&ctx.root, &ctx.rel, &dst).await?;
                if is_synced_markdown(&dst) {
                    let bytes = vault_fs::read_file(&ctx.root, &dst).await?;
                    spawn_document_refresh_at(state, ctx, dst.clone(), bytes);
                }
            }
            vault_fs::PathKind::Directory => {
                vault_fs::copy_dir_recursive(&ctx.root, &ctx.rel, &dst).await?;
                spawn_subtree_refresh(state, ctx, dst.clone());
            }
            vault_fs::PathKind::Missing => {}
        }
    }

    Ok(status_response(if dst_existed {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::CREATED
    }))
}

/// Single-writer deployments get a synthetic token; nothing is enforced.
fn handle_lock(ctx: &DavContext) -> Response {
    let token = format!("opaquelocktoken:{}", Uuid::new_v4());
    let href = build_href(&ctx.vault.slug, &ctx.rel, false);
    let body = format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
         <D:prop xmlns:D=\"DAV:\"><D:lockdiscovery><D:activelock>\
         <D:locktype><D:write/></D:locktype>\
         <D:lockscope><D:exclusive/></D:lockscope>\
         <D:depth>infinity</D:depth>\
         <D:timeout>Second-3600</D:timeout>\
         <D:locktoken><D:href>{token}</D:href></D:locktoken>\
         <D:lockroot><D:href>{href}</D:href></D:lockroot>\
         </D:activelock></D:lockdiscovery></D:prop>"
    );
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/xml; charset=utf-8")
        .header("Lock-Token", format!("<{token}>"))
        .body(Body::from(body))
        .expect("valid response")
}

/// Only `.md` files outside `.obsidian/` are mirrored into the database.
fn is_synced_markdown(rel: &str) -> bool {
    rel.ends_with(".md")
        && !rel.starts_with(".obsidian/")
        && !rel.split('/').any(|segment| segment.starts_with('.'))
}

fn spawn_document_refresh(state: &AppState, ctx: &DavContext, bytes: Vec<u8>) {
    spawn_document_refresh_at(state, ctx, ctx.rel.clone(), bytes);
}

/// Re-derive the document row and version chain from the new on-disk state;
/// the response to the DAV client never waits on this.
fn spawn_document_refresh_at(state: &AppState, ctx: &DavContext, rel: String, bytes: Vec<u8>) {
    if !is_synced_markdown(&rel) {
        return;
    }
    let content = match String::from_utf8(bytes) {
        Ok(content) => content,
        Err(_) => {
            warn!(%rel, "skipping non-UTF-8 webdav write");
            return;
        }
    };
    let engine = state.engine();
    let user_id = ctx.user.id;
    let vault = ctx.vault.clone();
    tokio::spawn(async move {
        if let Err(err) = engine
            .put_in_vault(user_id, &vault, &rel, &content, SOURCE_WEBDAV)
            .await
        {
            warn!(error = %err, path = %rel, "webdav document refresh failed");
        }
    });
}

/// After a recursive COPY: register every copied markdown file.
fn spawn_subtree_refresh(state: &AppState, ctx: &DavContext, dst: String) {
    let engine = state.engine();
    let user_id = ctx.user.id;
    let vault = ctx.vault.clone();
    let root = ctx.root.clone();
    let sync = state.sync.clone();
    tokio::spawn(async move {
        if let Err(err) = refresh_subtree(&engine, user_id, &vault, &root, &dst, &sync).await {
            warn!(error = %err, path = %dst, "webdav subtree refresh failed");
        }
    });
}

async fn refresh_subtree(
    engine: &DocumentEngine,
    user_id: Uuid,
    vault: &Vault,
    root: &FsPath,
    dst: &str,
    sync: &crate::sync::SyncCoordinator,
) -> Result<(), EngineError> {
    let copied_root = root.join(dst);
    for rel in vault_fs::list_markdown_files(&copied_root)? {
        let full_rel = format!("{dst}/{rel}");
        sync.mark_written(&root.join(&full_rel));
        let bytes = vault_fs::read_file(root, &full_rel).await?;
        if let Ok(content) = String::from_utf8(bytes) {
            engine
                .put_in_vault(user_id, vault, &full_rel, &content, SOURCE_WEBDAV)
                .await?;
        }
    }
    Ok(())
}

fn parse_depth(headers: &HeaderMap) -> Result<Depth, Response> {
    match headers.get("Depth") {
        None => Ok(Depth::Infinity),
        Some(value) => match value.to_str() {
            Ok("0") => Ok(Depth::Zero),
            Ok("1") => Ok(Depth::One),
            Ok(v) if v.eq_ignore_ascii_case("infinity") => Ok(Depth::Infinity),
            _ => Err(status_response(StatusCode::BAD_REQUEST)),
        },
    }
}

/// The Destination header names either an absolute URL or an absolute path;
/// it is percent-decoded once and must address the same vault.
fn parse_destination(headers: &HeaderMap, slug: &str) -> Result<String, Response> {
    let raw = headers
        .get("Destination")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| status_response(StatusCode::BAD_REQUEST))?;

    let path = if raw.starts_with("http://") || raw.starts_with("https://") {
        match url::Url::parse(raw) {
            Ok(parsed) => parsed.path().to_string(),
            Err(_) => return Err(status_response(StatusCode::BAD_REQUEST)),
        }
    } else {
        raw.to_string()
    };

    let decoded = percent_decode_str(&path)
        .decode_utf8()
        .map_err(|_| status_response(StatusCode::BAD_REQUEST))?;

    let stripped = decoded
        .strip_prefix("/webdav/")
        .ok_or_else(|| status_response(StatusCode::BAD_REQUEST))?;
    let (dst_slug, rel) = match stripped.split_once('/') {
        Some((dst_slug, rel)) => (dst_slug, rel.trim_matches('/')),
        None => (stripped, ""),
    };
    if dst_slug != slug {
        // Cross-vault transfers are not supported.
        return Err(status_response(StatusCode::FORBIDDEN));
    }
    if rel.is_empty() {
        return Err(status_response(StatusCode::BAD_REQUEST));
    }
    validate_rel_path(rel).map_err(|_| status_response(StatusCode::FORBIDDEN))?;
    Ok(rel.to_string())
}

struct DavEntry {
    rel: String,
    is_dir: bool,
    size: u64,
    mtime: DateTime<Utc>,
    etag: Option<String>,
    content_type: Option<String>,
}

async fn collect_entry(
    root: &FsPath,
    rel: &str,
    kind: vault_fs::PathKind,
    entries: &mut Vec<DavEntry>,
) -> Result<(), AppError> {
    let abs = if rel.is_empty() {
        root.to_path_buf()
    } else {
        root.join(rel)
    };
    let meta = tokio::fs::metadata(&abs).await?;
    let mtime: DateTime<Utc> = meta.modified().map(DateTime::from).unwrap_or_else(|_| Utc::now());
    let is_dir = kind == vault_fs::PathKind::Directory;
    entries.push(DavEntry {
        rel: rel.to_string(),
        is_dir,
        size: if is_dir { 0 } else { meta.len() },
        mtime,
        etag: (!is_dir).then(|| etag_value(&meta)),
        content_type: (!is_dir).then(|| {
            mime_guess::from_path(&abs)
                .first_or_octet_stream()
                .to_string()
        }),
    });
    Ok(())
}

/// Depth-first listing under `rel`. `.tmp-*` atomic-write leftovers are
/// never exposed; everything else on disk (including `.obsidian/`) is.
async fn collect_children(
    root: &FsPath,
    rel: &str,
    depth: Depth,
    entries: &mut Vec<DavEntry>,
) -> Result<(), AppError> {
    let mut pending = vec![rel.to_string()];
    while let Some(dir_rel) = pending.pop() {
        let abs = if dir_rel.is_empty() {
            root.to_path_buf()
        } else {
            root.join(&dir_rel)
        };
        let mut read_dir = tokio::fs::read_dir(&abs).await?;
        let mut children = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with(".tmp-") {
                continue;
            }
            let child_rel = if dir_rel.is_empty() {
                name.to_string()
            } else {
                format!("{dir_rel}/{name}")
            };
            let kind = if entry.file_type().await?.is_dir() {
                vault_fs::PathKind::Directory
            } else {
                vault_fs::PathKind::File
            };
            children.push((child_rel, kind));
        }
        children.sort_by(|a, b| a.0.cmp(&b.0));
        for (child_rel, kind) in children {
            collect_entry(root, &child_rel, kind, entries).await?;
            if kind == vault_fs::PathKind::Directory && depth == Depth::Infinity {
                pending.push(child_rel);
            }
        }
    }
    Ok(())
}

/// `"<size>-<mtime36>"`: file size in bytes and modification time in
/// milliseconds rendered base-36.
fn etag_value(meta: &std::fs::Metadata) -> String {
    let mtime_ms = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!("{}-{}", meta.len(), to_base36(mtime_ms))
}

fn to_base36(mut value: u128) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8(out).expect("base36 digits are ascii")
}

fn build_href(slug: &str, rel: &str, is_collection: bool) -> String {
    let mut path = format!("/webdav/{}", utf8_percent_encode(slug, NON_ALPHANUMERIC));
    if !rel.is_empty() {
        for segment in rel.split('/') {
            path.push('/');
            path.push_str(&utf8_percent_encode(segment, NON_ALPHANUMERIC).to_string());
        }
    }
    if is_collection && !path.ends_with('/') {
        path.push('/');
    }
    path
}

fn render_multistatus(slug: &str, entries: &[DavEntry]) -> Result<Vec<u8>, quick_xml::Error> {
    let mut writer = Writer::new(Vec::new());
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

    let mut multistatus = BytesStart::new("D:multistatus");
    multistatus.push_attribute(("xmlns:D", "DAV:"));
    writer.write_event(Event::Start(multistatus))?;

    for entry in entries {
        writer.write_event(Event::Start(BytesStart::new("D:response")))?;

        let href = build_href(slug, &entry.rel, entry.is_dir);
        writer.write_event(Event::Start(BytesStart::new("D:href")))?;
        writer.write_event(Event::Text(BytesText::new(&href)))?;
        writer.write_event(Event::End(BytesEnd::new("D:href")))?;

        writer.write_event(Event::Start(BytesStart::new("D:propstat")))?;
        writer.write_event(Event::Start(BytesStart::new("D:prop")))?;

        writer.write_event(Event::Start(BytesStart::new("D:resourcetype")))?;
        if entry.is_dir {
            writer.write_event(Event::Empty(BytesStart::new("D:collection")))?;
        }
        writer.write_event(Event::End(BytesEnd::new("D:resourcetype")))?;

        writer.write_event(Event::Start(BytesStart::new("D:getcontentlength")))?;
        writer.write_event(Event::Text(BytesText::new(&entry.size.to_string())))?;
        writer.write_event(Event::End(BytesEnd::new("D:getcontentlength")))?;

        writer.write_event(Event::Start(BytesStart::new("D:getlastmodified")))?;
        writer.write_event(Event::Text(BytesText::new(&format_http_date(entry.mtime))))?;
        writer.write_event(Event::End(BytesEnd::new("D:getlastmodified")))?;

        if let Some(content_type) = &entry.content_type {
            writer.write_event(Event::Start(BytesStart::new("D:getcontenttype")))?;
            writer.write_event(Event::Text(BytesText::new(content_type)))?;
            writer.write_event(Event::End(BytesEnd::new("D:getcontenttype")))?;
        }

        if let Some(etag) = &entry.etag {
            writer.write_event(Event::Start(BytesStart::new("D:getetag")))?;
            writer.write_event(Event::Text(BytesText::new(&format!("\"{etag}\""))))?;
            writer.write_event(Event::End(BytesEnd::new("D:getetag")))?;
        }

        writer.write_event(Event::End(BytesEnd::new("D:prop")))?;

        writer.write_event(Event::Start(BytesStart::new("D:status")))?;
        writer.write_event(Event::Text(BytesText::new("HTTP/1.1 200 OK")))?;
        writer.write_event(Event::End(BytesEnd::new("D:status")))?;

        writer.write_event(Event::End(BytesEnd::new("D:propstat")))?;
        writer.write_event(Event::End(BytesEnd::new("D:response")))?;
    }

    writer.write_event(Event::End(BytesEnd::new("D:multistatus")))?;
    Ok(writer.into_inner())
}

fn format_http_date(value: DateTime<Utc>) -> String {
    value.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

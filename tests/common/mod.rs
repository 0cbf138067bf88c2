use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, ensure, Context, Result};
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::PgConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use http_body_util::BodyExt;
use mdvault::auth::jwt::JwtService;
use mdvault::config::AppConfig;
use mdvault::db::{self, PgPool};
use mdvault::engine::DocumentEngine;
use mdvault::models::NewUser;
use mdvault::routes;
use mdvault::state::AppState;
use mdvault::sync::SyncCoordinator;
use once_cell::sync::Lazy;
use serde::Serialize;
use tempfile::TempDir;
use tokio::sync::Mutex;
use tower::util::ServiceExt;
use uuid::Uuid;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

static DB_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

pub struct TestApp {
    pub state: AppState,
    router: Router,
    // Owns DATA_DIR for the lifetime of the test.
    _data_dir: TempDir,
}

impl TestApp {
    pub async fn new() -> Result<Self> {
        let database_url = env::var("TEST_DATABASE_URL")
            .context("TEST_DATABASE_URL must be set for integration tests")?;

        let data_dir = TempDir::new().context("failed to create temp data dir")?;

        let config = AppConfig {
            database_url: database_url.clone(),
            database_max_pool_size: db::DEFAULT_MAX_POOL_SIZE,
            server_host: "127.0.0.1".to_string(),
            server_port: 0,
            data_dir: data_dir.path().to_path_buf(),
            jwt_secret: "test-secret".to_string(),
            jwt_issuer: "test-issuer".to_string(),
            jwt_expiry_minutes: 60,
            refresh_token_expiry_days: 30,
            refresh_cookie_name: "refresh_token".to_string(),
            refresh_cookie_secure: false,
            refresh_cookie_domain: None,
            cors_allowed_origin: None,
            invitation_expiry_days: 7,
            reconcile_interval: Duration::from_secs(3600),
            watch_stability: Duration::from_millis(300),
            debounce_window: Duration::from_millis(50),
            recently_written_ttl: Duration::from_secs(5),
        };

        let pool = db::init_pool_with_size(&config.database_url, config.database_max_pool_size)?;
        prepare_database(&pool).await?;

        let sync = Arc::new(SyncCoordinator::new(
            config.recently_written_ttl,
            config.debounce_window,
        ));
        let jwt = JwtService::from_config(&config)?;
        let state = AppState::new(pool, config, sync, jwt);
        let router = routes::create_router(state.clone());

        Ok(Self {
            state,
            router,
            _data_dir: data_dir,
        })
    }

    pub fn engine(&self) -> DocumentEngine {
        self.state.engine()
    }

    pub fn data_dir(&self) -> PathBuf {
        self.state.config.data_dir.clone()
    }

    pub async fn cleanup(&self) -> Result<()> {
        let pool = self.state.pool.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut conn = pool
                .get()
                .map_err(|err| anyhow!("failed to get cleanup connection: {err}"))?;
            truncate_all(&mut conn)?;
            Ok(())
        })
        .await
        .context("cleanup task panicked")?
    }

    pub async fn insert_user(&self, email: &str, password: &str, role: &str) -> Result<Uuid> {
        let email = email.to_lowercase();
        let password = password.to_string();
        let role = role.to_string();
        self.with_conn(move |conn| {
            let password_hash = mdvault::auth::password::hash_password(&password)?;
            let user = NewUser {
                id: Uuid::new_v4(),
                email,
                display_name: "Test User".to_string(),
                role,
                password_hash,
            };
            diesel::insert_into(mdvault::schema::users::table)
                .values(&user)
                .execute(conn)
                .context("failed to insert user")?;
            Ok(user.id)
        })
        .await
    }

    pub async fn login_token(&self, email: &str, password: &str) -> Result<String> {
        #[derive(Serialize)]
        struct LoginPayload<'a> {
            email: &'a str,
            password: &'a str,
        }

        let response = self
            .post_json("/api/v1/auth/login", &LoginPayload { email, password }, None)
            .await?;

        ensure!(
            response.status() == StatusCode::OK,
            "login failed with status {}",
            response.status()
        );

        let body = body_to_vec(response.into_body()).await?;
        #[derive(serde::Deserialize)]
        struct LoginResponse {
            access_token: String,
        }
        let parsed: LoginResponse = serde_json::from_slice(&body)?;
        Ok(parsed.access_token)
    }

    pub async fn create_vault(&self, token: &str, name: &str) -> Result<Uuid> {
        #[derive(Serialize)]
        struct CreateVault<'a> {
            name: &'a str,
        }

        let response = self
            .post_json("/api/v1/vaults", &CreateVault { name }, Some(token))
            .await?;
        ensure!(
            response.status() == StatusCode::CREATED,
            "vault creation failed with status {}",
            response.status()
        );
        let body = body_to_vec(response.into_body()).await?;
        #[derive(serde::Deserialize)]
        struct VaultResponse {
            id: Uuid,
        }
        let parsed: VaultResponse = serde_json::from_slice(&body)?;
        Ok(parsed.id)
    }

    pub async fn put_document(
        &self,
        token: &str,
        vault_id: Uuid,
        path: &str,
        content: &str,
    ) -> Result<hyper::Response<Body>> {
        #[derive(Serialize)]
        struct PutDocument<'a> {
            content: &'a str,
        }

        let body = serde_json::to_vec(&PutDocument { content })?;
        let request = Request::builder()
            .method(Method::PUT)
            .uri(format!("/api/v1/vaults/{vault_id}/documents/{path}"))
            .header("content-type", "application/json")
            .header("authorization", format!("Bearer {token}"))
            .body(Body::from(body))?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        payload: &T,
        token: Option<&str>,
    ) -> Result<hyper::Response<Body>> {
        let body = serde_json::to_vec(payload)?;
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(path)
            .header("content-type", "application/json");
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let request = builder.body(Body::from(body))?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    pub async fn get(&self, path: &str, token: Option<&str>) -> Result<hyper::Response<Body>> {
        let mut builder = Request::builder().method(Method::GET).uri(path);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let request = builder.body(Body::empty())?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    #[allow(dead_code)]
    pub async fn delete(&self, path: &str, token: Option<&str>) -> Result<hyper::Response<Body>> {
        let builder = Request::builder().method(Method::DELETE).uri(path);
        let builder = if let Some(token) = token {
            builder.header("authorization", format!("Bearer {token}"))
        } else {
            builder
        };
        let request = builder.body(Body::empty())?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    /// Issue a full-access API key for `user_id` directly in the database
    /// and return the secret, for WebDAV Basic auth.
    pub async fn issue_api_key(&self, user_id: Uuid) -> Result<String> {
        self.with_conn(move |conn| {
            let generated = mdvault::auth::api_key::generate_api_key()?;
            let row = mdvault::models::NewApiKey {
                id: Uuid::new_v4(),
                user_id,
                name: "test key".to_string(),
                key_prefix: generated.prefix,
                key_hash: generated.hash,
                scopes: serde_json::json!(["read", "write"]),
                vault_id: None,
                expires_at: None,
            };
            diesel::insert_into(mdvault::schema::api_keys::table)
                .values(&row)
                .execute(conn)
                .context("failed to insert api key")?;
            Ok(generated.secret)
        })
        .await
    }

    /// Arbitrary WebDAV request with Basic `email:apiKey` credentials.
    pub async fn webdav(
        &self,
        method: &str,
        path: &str,
        email: &str,
        api_key: &str,
        headers: &[(&str, &str)],
        body: Vec<u8>,
    ) -> Result<hyper::Response<Body>> {
        let credentials = BASE64.encode(format!("{email}:{api_key}"));
        let mut builder = Request::builder()
            .method(method)
            .uri(path)
            .header("authorization", format!("Basic {credentials}"));
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let request = builder.body(Body::from(body))?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut PgConnection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.state.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|err| anyhow!("failed to get database connection: {err}"))?;
            f(&mut conn)
        })
        .await
        .context("connection task panicked")?
    }
}

pub async fn acquire_db_lock() -> tokio::sync::MutexGuard<'static, ()> {
    DB_LOCK.lock().await
}

pub async fn body_to_vec(body: Body) -> Result<Vec<u8>> {
    let collected = body
        .collect()
        .await
        .map_err(|err| anyhow!("failed to read response body: {err}"))?;
    Ok(collected.to_bytes().to_vec())
}

async fn prepare_database(pool: &PgPool) -> Result<()> {
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut conn = pool
            .get()
            .map_err(|err| anyhow!("failed to acquire connection: {err}"))?;
        conn.run_pending_migrations(MIGRATIONS)
            .map_err(|err| anyhow!("failed to run migrations: {err}"))?;
        truncate_all(&mut conn)?;
        Ok(())
    })
    .await
    .context("migration task panicked")?
}

fn truncate_all(conn: &mut PgConnection) -> Result<()> {
    conn.batch_execute(
        "TRUNCATE TABLE refresh_tokens, api_keys, invitations, document_versions, documents, vaults, users RESTART IDENTITY CASCADE;",
    )
    .context("failed to truncate tables")?;
    Ok(())
}

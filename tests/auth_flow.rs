mod common;

use anyhow::Result;
use axum::http::StatusCode;
use common::{acquire_db_lock, body_to_vec, TestApp};
use serde_json::json;

#[tokio::test]
async fn login_rejects_bad_password() -> Result<()> {
    let _guard = acquire_db_lock().await;
    let app = TestApp::new().await?;
    app.insert_user("user@example.com", "correct-password", "user")
        .await?;

    let response = app
        .post_json(
            "/api/v1/auth/login",
            &json!({"email": "user@example.com", "password": "wrong"}),
            None,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    app.cleanup().await
}

#[tokio::test]
async fn login_issues_token_and_refresh_cookie() -> Result<()> {
    let _guard = acquire_db_lock().await;
    let app = TestApp::new().await?;
    app.insert_user("user@example.com", "password123", "user")
        .await?;

    let response = app
        .post_json(
            "/api/v1/auth/login",
            &json!({"email": "User@Example.com", "password": "password123"}),
            None,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let cookie = response
        .headers()
        .get("set-cookie")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(cookie.starts_with("refresh_token="));
    assert!(cookie.contains("HttpOnly"));
    assert!(cookie.contains("SameSite=Strict"));
    assert!(cookie.contains("Path=/api/v1/auth/refresh"));

    let body: serde_json::Value =
        serde_json::from_slice(&body_to_vec(response.into_body()).await?)?;
    assert_eq!(body["token_type"], "Bearer");
    assert!(body["access_token"].as_str().unwrap().contains('.'));

    app.cleanup().await
}

#[tokio::test]
async fn me_returns_profile() -> Result<()> {
    let _guard = acquire_db_lock().await;
    let app = TestApp::new().await?;
    app.insert_user("user@example.com", "password123", "user")
        .await?;
    let token = app.login_token("user@example.com", "password123").await?;

    let response = app.get("/api/v1/users/me", Some(&token)).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value =
        serde_json::from_slice(&body_to_vec(response.into_body()).await?)?;
    assert_eq!(body["email"], "user@example.com");
    assert_eq!(body["role"], "user");

    app.cleanup().await
}

#[tokio::test]
async fn first_registration_bootstraps_admin() -> Result<()> {
    let _guard = acquire_db_lock().await;
    let app = TestApp::new().await?;

    let response = app
        .post_json(
            "/api/v1/auth/register",
            &json!({
                "email": "first@example.com",
                "password": "password123",
                "display_name": "First"
            }),
            None,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::CREATED);
    let body: serde_json::Value =
        serde_json::from_slice(&body_to_vec(response.into_body()).await?)?;
    assert_eq!(body["role"], "admin");

    // Second registration without an invitation is refused.
    let response = app
        .post_json(
            "/api/v1/auth/register",
            &json!({
                "email": "second@example.com",
                "password": "password123",
                "display_name": "Second"
            }),
            None,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    app.cleanup().await
}

#[tokio::test]
async fn invitation_flow_registers_invited_email_only() -> Result<()> {
    let _guard = acquire_db_lock().await;
    let app = TestApp::new().await?;
    app.insert_user("admin@example.com", "password123", "admin")
        .await?;
    let admin_token = app.login_token("admin@example.com", "password123").await?;

    let response = app
        .post_json(
            "/api/v1/users/invite",
            &json!({"email": "invitee@example.com"}),
            Some(&admin_token),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::CREATED);
    let body: serde_json::Value =
        serde_json::from_slice(&body_to_vec(response.into_body()).await?)?;
    let invitation_token = body["token"].as_str().unwrap().to_string();

    // The wrong email cannot consume the invitation.
    let response = app
        .post_json(
            "/api/v1/auth/register",
            &json!({
                "email": "other@example.com",
                "password": "password123",
                "display_name": "Other",
                "invitation_token": invitation_token
            }),
            None,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app
        .post_json(
            "/api/v1/auth/register",
            &json!({
                "email": "invitee@example.com",
                "password": "password123",
                "display_name": "Invitee",
                "invitation_token": invitation_token
            }),
            None,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::CREATED);

    // Consumed invitations cannot be replayed.
    let response = app
        .post_json(
            "/api/v1/auth/register",
            &json!({
                "email": "invitee@example.com",
                "password": "password123",
                "display_name": "Again",
                "invitation_token": invitation_token
            }),
            None,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    app.cleanup().await
}

#[tokio::test]
async fn non_admin_cannot_invite() -> Result<()> {
    let _guard = acquire_db_lock().await;
    let app = TestApp::new().await?;
    app.insert_user("user@example.com", "password123", "user")
        .await?;
    let token = app.login_token("user@example.com", "password123").await?;

    let response = app
        .post_json(
            "/api/v1/users/invite",
            &json!({"email": "x@example.com"}),
            Some(&token),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    app.cleanup().await
}

#[tokio::test]
async fn api_key_bearer_reaches_the_api() -> Result<()> {
    let _guard = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let user_id = app
        .insert_user("keyed@example.com", "password123", "user")
        .await?;
    let secret = app.issue_api_key(user_id).await?;

    let response = app.get("/api/v1/users/me", Some(&secret)).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value =
        serde_json::from_slice(&body_to_vec(response.into_body()).await?)?;
    assert_eq!(body["email"], "keyed@example.com");

    let response = app.get("/api/v1/users/me", Some("ds_k_not-a-real-key-at-all-0000000000000000")).await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    app.cleanup().await
}

#[tokio::test]
async fn api_key_lifecycle() -> Result<()> {
    let _guard = acquire_db_lock().await;
    let app = TestApp::new().await?;
    app.insert_user("user@example.com", "password123", "user")
        .await?;
    let token = app.login_token("user@example.com", "password123").await?;

    let response = app
        .post_json(
            "/api/v1/api-keys",
            &json!({"name": "obsidian", "scopes": ["read", "write"]}),
            Some(&token),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::CREATED);
    let body: serde_json::Value =
        serde_json::from_slice(&body_to_vec(response.into_body()).await?)?;
    let key_id = body["id"].as_str().unwrap().to_string();
    let secret = body["key"].as_str().unwrap().to_string();
    assert!(secret.starts_with("ds_k_"));
    assert_eq!(secret.len(), 45);
    assert_eq!(body["key_prefix"], secret["ds_k_".len().."ds_k_".len() + 8]);

    // The secret never appears again.
    let response = app.get("/api/v1/api-keys", Some(&token)).await?;
    let listed: serde_json::Value =
        serde_json::from_slice(&body_to_vec(response.into_body()).await?)?;
    assert!(listed[0].get("key").is_none());

    // Deactivating the key cuts access.
    let request = axum::http::Request::builder()
        .method("PATCH")
        .uri(format!("/api/v1/api-keys/{key_id}"))
        .header("content-type", "application/json")
        .header("authorization", format!("Bearer {token}"))
        .body(axum::body::Body::from(
            serde_json::to_vec(&json!({"is_active": false}))?,
        ))?;
    use tower::util::ServiceExt;
    let response = mdvault::routes::create_router(app.state.clone())
        .oneshot(request)
        .await
        .expect("infallible response");
    assert_eq!(response.status(), StatusCode::OK);

    let response = app.get("/api/v1/users/me", Some(&secret)).await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    app.cleanup().await
}

#[tokio::test]
async fn refresh_requires_csrf_header() -> Result<()> {
    let _guard = acquire_db_lock().await;
    let app = TestApp::new().await?;
    app.insert_user("user@example.com", "password123", "user")
        .await?;

    let response = app
        .post_json(
            "/api/v1/auth/login",
            &json!({"email": "user@example.com", "password": "password123"}),
            None,
        )
        .await?;
    let cookie = response
        .headers()
        .get("set-cookie")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    let cookie_pair = cookie.split(';').next().unwrap().to_string();

    use tower::util::ServiceExt;

    // Without the header: refused.
    let request = axum::http::Request::builder()
        .method("POST")
        .uri("/api/v1/auth/refresh")
        .header("cookie", &cookie_pair)
        .body(axum::body::Body::empty())?;
    let response = mdvault::routes::create_router(app.state.clone())
        .oneshot(request)
        .await
        .expect("infallible response");
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // With it: a fresh access token and a rotated cookie.
    let request = axum::http::Request::builder()
        .method("POST")
        .uri("/api/v1/auth/refresh")
        .header("cookie", &cookie_pair)
        .header("x-requested-with", "XMLHttpRequest")
        .body(axum::body::Body::empty())?;
    let response = mdvault::routes::create_router(app.state.clone())
        .oneshot(request)
        .await
        .expect("infallible response");
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("set-cookie"));

    // The old cookie is revoked by rotation.
    let request = axum::http::Request::builder()
        .method("POST")
        .uri("/api/v1/auth/refresh")
        .header("cookie", &cookie_pair)
        .header("x-requested-with", "XMLHttpRequest")
        .body(axum::body::Body::empty())?;
    let response = mdvault::routes::create_router(app.state.clone())
        .oneshot(request)
        .await
        .expect("infallible response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    app.cleanup().await
}

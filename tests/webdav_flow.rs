mod common;

use anyhow::Result;
use axum::http::StatusCode;
use common::{acquire_db_lock, body_to_vec, TestApp};
use uuid::Uuid;

const EMAIL: &str = "dav@example.com";

async fn setup() -> Result<(TestApp, String, Uuid)> {
    let app = TestApp::new().await?;
    let user_id = app.insert_user(EMAIL, "password123", "user").await?;
    let token = app.login_token(EMAIL, "password123").await?;
    let vault_id = app.create_vault(&token, "vs").await?;
    let api_key = app.issue_api_key(user_id).await?;
    Ok((app, api_key, vault_id))
}

#[tokio::test]
async fn options_needs_no_auth() -> Result<()> {
    let _guard = acquire_db_lock().await;
    let app = TestApp::new().await?;

    let response = app
        .webdav("OPTIONS", "/webdav/anything", "", "", &[], Vec::new())
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let dav = response.headers().get("DAV").unwrap().to_str().unwrap();
    assert_eq!(dav, "1, 2");
    assert!(response.headers().contains_key("allow"));

    app.cleanup().await
}

#[tokio::test]
async fn missing_credentials_get_a_challenge() -> Result<()> {
    let _guard = acquire_db_lock().await;
    let (app, _key, _vault) = setup().await?;

    let response = app
        .webdav("PROPFIND", "/webdav/vs/", "", "", &[], Vec::new())
        .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let challenge = response
        .headers()
        .get("www-authenticate")
        .unwrap()
        .to_str()
        .unwrap();
    assert!(challenge.starts_with("Basic realm="));

    app.cleanup().await
}

#[tokio::test]
async fn wrong_email_for_key_is_rejected() -> Result<()> {
    let _guard = acquire_db_lock().await;
    let (app, key, _vault) = setup().await?;

    let response = app
        .webdav(
            "PROPFIND",
            "/webdav/vs/",
            "someone-else@example.com",
            &key,
            &[],
            Vec::new(),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    app.cleanup().await
}

#[tokio::test]
async fn propfind_depth_one_lists_children_with_etags() -> Result<()> {
    let _guard = acquire_db_lock().await;
    let (app, key, _vault) = setup().await?;

    for (path, content) in [("notes/a.md", "# A"), ("readme.md", "# R")] {
        let response = app
            .webdav(
                "PUT",
                &format!("/webdav/vs/{path}"),
                EMAIL,
                &key,
                &[],
                content.as_bytes().to_vec(),
            )
            .await?;
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    let response = app
        .webdav(
            "PROPFIND",
            "/webdav/vs/",
            EMAIL,
            &key,
            &[("Depth", "1")],
            Vec::new(),
        )
        .await?;
    assert_eq!(response.status().as_u16(), 207);
    let body = String::from_utf8(body_to_vec(response.into_body()).await?)?;

    // Root + the notes directory + readme.md.
    assert_eq!(body.matches("<D:response>").count(), 3);
    assert!(body.contains("/webdav/vs/"));
    assert!(body.contains("notes"));
    assert!(body.contains("readme%2Emd"));
    assert!(body.contains("<D:collection/>"));
    // File etags follow "<size>-<mtime36>".
    assert!(body.contains("<D:getetag>\"3-"));

    // Depth 1 does not descend into notes/.
    assert!(!body.contains("a%2Emd"));

    let response = app
        .webdav(
            "PROPFIND",
            "/webdav/vs/",
            EMAIL,
            &key,
            &[("Depth", "infinity")],
            Vec::new(),
        )
        .await?;
    let body = String::from_utf8(body_to_vec(response.into_body()).await?)?;
    assert!(body.contains("a%2Emd"));

    app.cleanup().await
}

#[tokio::test]
async fn propfind_depth_zero_returns_only_the_resource() -> Result<()> {
    let _guard = acquire_db_lock().await;
    let (app, key, _vault) = setup().await?;

    app.webdav("PUT", "/webdav/vs/a.md", EMAIL, &key, &[], b"x".to_vec())
        .await?;

    let response = app
        .webdav(
            "PROPFIND",
            "/webdav/vs/",
            EMAIL,
            &key,
            &[("Depth", "0")],
            Vec::new(),
        )
        .await?;
    let body = String::from_utf8(body_to_vec(response.into_body()).await?)?;
    assert_eq!(body.matches("<D:response>").count(), 1);

    app.cleanup().await
}

#[tokio::test]
async fn put_creates_then_overwrites() -> Result<()> {
    let _guard = acquire_db_lock().await;
    let (app, key, _vault) = setup().await?;

    let response = app
        .webdav("PUT", "/webdav/vs/deep/dir/n.md", EMAIL, &key, &[], b"one".to_vec())
        .await?;
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = app
        .webdav("PUT", "/webdav/vs/deep/dir/n.md", EMAIL, &key, &[], b"two".to_vec())
        .await?;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app
        .webdav("GET", "/webdav/vs/deep/dir/n.md", EMAIL, &key, &[], Vec::new())
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("etag"));
    assert!(response.headers().contains_key("last-modified"));
    let body = body_to_vec(response.into_body()).await?;
    assert_eq!(body, b"two");

    app.cleanup().await
}

#[tokio::test]
async fn get_on_directory_is_method_not_allowed() -> Result<()> {
    let _guard = acquire_db_lock().await;
    let (app, key, _vault) = setup().await?;

    app.webdav("PUT", "/webdav/vs/d/f.md", EMAIL, &key, &[], b"x".to_vec())
        .await?;
    let response = app
        .webdav("GET", "/webdav/vs/d", EMAIL, &key, &[], Vec::new())
        .await?;
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

    app.cleanup().await
}

#[tokio::test]
async fn mkcol_semantics() -> Result<()> {
    let _guard = acquire_db_lock().await;
    let (app, key, _vault) = setup().await?;

    let response = app
        .webdav("MKCOL", "/webdav/vs/folder", EMAIL, &key, &[], Vec::new())
        .await?;
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = app
        .webdav("MKCOL", "/webdav/vs/folder", EMAIL, &key, &[], Vec::new())
        .await?;
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

    let response = app
        .webdav("MKCOL", "/webdav/vs/no/parent", EMAIL, &key, &[], Vec::new())
        .await?;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    app.cleanup().await
}

#[tokio::test]
async fn move_without_overwrite_fails_on_collision() -> Result<()> {
    let _guard = acquire_db_lock().await;
    let (app, key, _vault) = setup().await?;

    app.webdav("PUT", "/webdav/vs/old.md", EMAIL, &key, &[], b"old".to_vec())
        .await?;
    app.webdav("PUT", "/webdav/vs/new.md", EMAIL, &key, &[], b"new".to_vec())
        .await?;

    let response = app
        .webdav(
            "MOVE",
            "/webdav/vs/old.md",
            EMAIL,
            &key,
            &[("Destination", "/webdav/vs/new.md"), ("Overwrite", "F")],
            Vec::new(),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::PRECONDITION_FAILED);

    // Both files untouched.
    let response = app
        .webdav("GET", "/webdav/vs/old.md", EMAIL, &key, &[], Vec::new())
        .await?;
    assert_eq!(body_to_vec(response.into_body()).await?, b"old");
    let response = app
        .webdav("GET", "/webdav/vs/new.md", EMAIL, &key, &[], Vec::new())
        .await?;
    assert_eq!(body_to_vec(response.into_body()).await?, b"new");

    app.cleanup().await
}

#[tokio::test]
async fn move_renames_on_disk() -> Result<()> {
    let _guard = acquire_db_lock().await;
    let (app, key, _vault) = setup().await?;

    app.webdav("PUT", "/webdav/vs/old.md", EMAIL, &key, &[], b"body".to_vec())
        .await?;

    let response = app
        .webdav(
            "MOVE",
            "/webdav/vs/old.md",
            EMAIL,
            &key,
            &[("Destination", "/webdav/vs/sub/new.md")],
            Vec::new(),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = app
        .webdav("GET", "/webdav/vs/old.md", EMAIL, &key, &[], Vec::new())
        .await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let response = app
        .webdav("GET", "/webdav/vs/sub/new.md", EMAIL, &key, &[], Vec::new())
        .await?;
    assert_eq!(body_to_vec(response.into_body()).await?, b"body");

    app.cleanup().await
}

#[tokio::test]
async fn cross_vault_move_is_rejected() -> Result<()> {
    let _guard = acquire_db_lock().await;
    let (app, key, _vault) = setup().await?;

    app.webdav("PUT", "/webdav/vs/a.md", EMAIL, &key, &[], b"x".to_vec())
        .await?;
    let response = app
        .webdav(
            "MOVE",
            "/webdav/vs/a.md",
            EMAIL,
            &key,
            &[("Destination", "/webdav/other-vault/a.md")],
            Vec::new(),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    app.cleanup().await
}

#[tokio::test]
async fn delete_removes_files_and_directories() -> Result<()> {
    let _guard = acquire_db_lock().await;
    let (app, key, _vault) = setup().await?;

    app.webdav("PUT", "/webdav/vs/dir/a.md", EMAIL, &key, &[], b"a".to_vec())
        .await?;
    app.webdav("PUT", "/webdav/vs/dir/b.md", EMAIL, &key, &[], b"b".to_vec())
        .await?;

    let response = app
        .webdav("DELETE", "/webdav/vs/dir", EMAIL, &key, &[], Vec::new())
        .await?;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app
        .webdav("GET", "/webdav/vs/dir/a.md", EMAIL, &key, &[], Vec::new())
        .await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    app.cleanup().await
}

#[tokio::test]
async fn lock_returns_synthetic_token() -> Result<()> {
    let _guard = acquire_db_lock().await;
    let (app, key, _vault) = setup().await?;

    app.webdav("PUT", "/webdav/vs/a.md", EMAIL, &key, &[], b"x".to_vec())
        .await?;
    let response = app
        .webdav("LOCK", "/webdav/vs/a.md", EMAIL, &key, &[], Vec::new())
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let token = response
        .headers()
        .get("lock-token")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(token.starts_with("<opaquelocktoken:"));
    let body = String::from_utf8(body_to_vec(response.into_body()).await?)?;
    assert!(body.contains("lockdiscovery"));

    let response = app
        .webdav("UNLOCK", "/webdav/vs/a.md", EMAIL, &key, &[], Vec::new())
        .await?;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    app.cleanup().await
}

#[tokio::test]
async fn traversal_in_dav_path_is_forbidden() -> Result<()> {
    let _guard = acquire_db_lock().await;
    let (app, key, _vault) = setup().await?;

    let response = app
        .webdav(
            "PUT",
            "/webdav/vs/%2e%2e/escape.md",
            EMAIL,
            &key,
            &[],
            b"x".to_vec(),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    app.cleanup().await
}

#[tokio::test]
async fn put_registers_document_after_refresh() -> Result<()> {
    let _guard = acquire_db_lock().await;
    let (app, key, vault_id) = setup().await?;

    let response = app
        .webdav(
            "PUT",
            "/webdav/vs/synced.md",
            EMAIL,
            &key,
            &[],
            b"# Synced".to_vec(),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::CREATED);

    // The row refresh is fire-and-forget; give it a moment.
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;

    let token = app.login_token(EMAIL, "password123").await?;
    let response = app
        .get(
            &format!("/api/v1/vaults/{vault_id}/documents/synced.md/versions"),
            Some(&token),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let versions: Vec<serde_json::Value> =
        serde_json::from_slice(&body_to_vec(response.into_body()).await?)?;
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0]["change_source"], "webdav");

    app.cleanup().await
}

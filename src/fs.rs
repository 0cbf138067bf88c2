use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::fs;

use crate::error::{EngineError, EngineResult};
use crate::paths::resolve_under;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    Missing,
    File,
    Directory,
}

pub async fn path_kind(root: &Path, rel: &str) -> EngineResult<PathKind> {
    let abs = resolve_under(root, rel)?;
    match fs::metadata(&abs).await {
        Ok(meta) if meta.is_dir() => Ok(PathKind::Directory),
        Ok(_) => Ok(PathKind::File),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(PathKind::Missing),
        Err(err) => Err(err.into()),
    }
}

pub async fn read_file(root: &Path, rel: &str) -> EngineResult<Vec<u8>> {
    let abs = resolve_under(root, rel)?;
    match fs::read(&abs).await {
        Ok(bytes) => Ok(bytes),
        Err(err) if err.kind() == ErrorKind::NotFound => Err(EngineError::NotFound),
        Err(err) => Err(err.into()),
    }
}

/// Atomic write: the content lands in a sibling `.tmp-<rand>` file which is
/// renamed into place, so the watcher never observes a half-written target.
/// The temp file is unlinked on any failure.
pub async fn write_file_atomic(root: &Path, rel: &str, bytes: &[u8]) -> EngineResult<PathBuf> {
    let abs = resolve_under(root, rel)?;
    if let Some(parent) = abs.parent() {
        fs::create_dir_all(parent).await?;
    }

    let tmp = abs.with_file_name(format!(".tmp-{}", rand_suffix()));
    if let Err(err) = fs::write(&tmp, bytes).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(err.into());
    }
    if let Err(err) = fs::rename(&tmp, &abs).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(err.into());
    }
    Ok(abs)
}

pub async fn delete_file(root: &Path, rel: &str) -> EngineResult<()> {
    let abs = resolve_under(root, rel)?;
    match fs::remove_file(&abs).await {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => return Err(EngineError::NotFound),
        Err(err) => return Err(err.into()),
    }
    prune_empty_parents(root, &abs).await;
    Ok(())
}

/// Best-effort removal of empty directories left behind by a delete or move,
/// walking up to but never including the vault root.
pub async fn prune_empty_parents(root: &Path, abs: &Path) {
    let mut current = abs.parent().map(Path::to_path_buf);
    while let Some(dir) = current {
        if dir == root || !dir.starts_with(root) {
            break;
        }
        if fs::remove_dir(&dir).await.is_err() {
            break;
        }
        current = dir.parent().map(Path::to_path_buf);
    }
}

/// Rename `src` to `dst` (file or directory). Falls back to copy+delete when
/// rename fails across devices.
pub async fn move_path(root: &Path, src: &str, dst: &str) -> EngineResult<()> {
    let abs_src = resolve_under(root, src)?;
    let abs_dst = resolve_under(root, dst)?;
    if let Some(parent) = abs_dst.parent() {
        fs::create_dir_all(parent).await?;
    }

    match fs::rename(&abs_src, &abs_dst).await {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => return Err(EngineError::NotFound),
        Err(_) => {
            let meta = fs::metadata(&abs_src).await?;
            if meta.is_dir() {
                copy_dir_recursive_abs(&abs_src, &abs_dst).await?;
                fs::remove_dir_all(&abs_src).await?;
            } else {
                fs::copy(&abs_src, &abs_dst).await?;
                fs::remove_file(&abs_src).await?;
            }
        }
    }
    prune_empty_parents(root, &abs_src).await;
    Ok(())
}

pub async fn copy_file(root: &Path, src: &str, dst: &str) -> EngineResult<()> {
    let abs_src = resolve_under(root, src)?;
    let abs_dst = resolve_under(root, dst)?;
    if let Some(parent) = abs_dst.parent() {
        fs::create_dir_all(parent).await?;
    }
    match fs::copy(&abs_src, &abs_dst).await {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Err(EngineError::NotFound),
        Err(err) => Err(err.into()),
    }
}

pub async fn copy_dir_recursive(root: &Path, src: &str, dst: &str) -> EngineResult<()> {
    let abs_src = resolve_under(root, src)?;
    let abs_dst = resolve_under(root, dst)?;
    copy_dir_recursive_abs(&abs_src, &abs_dst).await
}

async fn copy_dir_recursive_abs(src: &Path, dst: &Path) -> EngineResult<()> {
    fs::create_dir_all(dst).await?;
    let mut stack = vec![(src.to_path_buf(), dst.to_path_buf())];
    while let Some((from, to)) = stack.pop() {
        let mut entries = fs::read_dir(&from).await?;
        while let Some(entry) = entries.next_entry().await? {
            let target = to.join(entry.file_name());
            if entry.file_type().await?.is_dir() {
                fs::create_dir_all(&target).await?;
                stack.push((entry.path(), target));
            } else {
                fs::copy(entry.path(), &target).await?;
            }
        }
    }
    Ok(())
}

pub async fn delete_dir(root: &Path, rel: &str) -> EngineResult<()> {
    let abs = resolve_under(root, rel)?;
    match fs::remove_dir_all(&abs).await {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => return Err(EngineError::NotFound),
        Err(err) => return Err(err.into()),
    }
    prune_empty_parents(root, &abs).await;
    Ok(())
}

pub async fn create_dir(root: &Path, rel: &str) -> EngineResult<()> {
    let abs = resolve_under(root, rel)?;
    fs::create_dir(&abs).await.map_err(EngineError::from)
}

pub async fn ensure_vault_dir(root: &Path) -> EngineResult<()> {
    fs::create_dir_all(root).await.map_err(EngineError::from)
}

pub async fn delete_vault_dir(root: &Path) -> EngineResult<()> {
    match fs::remove_dir_all(root).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// All `.md` files under `root/rel` as vault-relative forward-slash paths,
/// skipping dotfiles and dot-directories (`.obsidian` included).
pub fn list_markdown_files(root: &Path) -> EngineResult<Vec<String>> {
    let mut found = Vec::new();
    if !root.exists() {
        return Ok(found);
    }
    let walker = walkdir::WalkDir::new(root)
        .into_iter()
        .filter_entry(|entry| !is_hidden(entry.file_name()));
    for entry in walker {
        let entry = entry.map_err(|err| EngineError::Upstream(err.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        if entry.path().extension().and_then(|e| e.to_str()) != Some("md") {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .map_err(|err| EngineError::Upstream(err.to_string()))?;
        if let Some(rel) = rel.to_str() {
            found.push(rel.replace(std::path::MAIN_SEPARATOR, "/"));
        }
    }
    found.sort();
    Ok(found)
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_str().map(|n| n.starts_with('.')).unwrap_or(true)
}

fn rand_suffix() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn atomic_write_then_read() {
        let dir = TempDir::new().unwrap();
        write_file_atomic(dir.path(), "notes/a.md", b"hello")
            .await
            .unwrap();
        assert_eq!(read_file(dir.path(), "notes/a.md").await.unwrap(), b"hello");
        // no stray temp files
        let names: Vec<_> = std::fs::read_dir(dir.path().join("notes"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("a.md")]);
    }

    #[tokio::test]
    async fn delete_prunes_empty_parents() {
        let dir = TempDir::new().unwrap();
        write_file_atomic(dir.path(), "a/b/c.md", b"x").await.unwrap();
        delete_file(dir.path(), "a/b/c.md").await.unwrap();
        assert!(!dir.path().join("a").exists());
        assert!(dir.path().exists());
    }

    #[tokio::test]
    async fn delete_keeps_nonempty_parents() {
        let dir = TempDir::new().unwrap();
        write_file_atomic(dir.path(), "a/one.md", b"1").await.unwrap();
        write_file_atomic(dir.path(), "a/two.md", b"2").await.unwrap();
        delete_file(dir.path(), "a/one.md").await.unwrap();
        assert!(dir.path().join("a/two.md").exists());
    }

    #[tokio::test]
    async fn move_renames_and_prunes() {
        let dir = TempDir::new().unwrap();
        write_file_atomic(dir.path(), "old/f.md", b"x").await.unwrap();
        move_path(dir.path(), "old/f.md", "new/f.md").await.unwrap();
        assert!(!dir.path().join("old").exists());
        assert_eq!(read_file(dir.path(), "new/f.md").await.unwrap(), b"x");
    }

    #[tokio::test]
    async fn kind_distinguishes_file_and_directory() {
        let dir = TempDir::new().unwrap();
        write_file_atomic(dir.path(), "d/f.md", b"x").await.unwrap();
        assert_eq!(path_kind(dir.path(), "d").await.unwrap(), PathKind::Directory);
        assert_eq!(path_kind(dir.path(), "d/f.md").await.unwrap(), PathKind::File);
        assert_eq!(path_kind(dir.path(), "nope").await.unwrap(), PathKind::Missing);
    }

    #[tokio::test]
    async fn listing_skips_hidden_and_non_markdown() {
        let dir = TempDir::new().unwrap();
        write_file_atomic(dir.path(), "a.md", b"x").await.unwrap();
        write_file_atomic(dir.path(), "sub/b.md", b"x").await.unwrap();
        write_file_atomic(dir.path(), "sub/c.txt", b"x").await.unwrap();
        std::fs::create_dir_all(dir.path().join(".obsidian")).unwrap();
        std::fs::write(dir.path().join(".obsidian/workspace.md"), "x").unwrap();
        std::fs::write(dir.path().join(".hidden.md"), "x").unwrap();

        let listed = list_markdown_files(dir.path()).unwrap();
        assert_eq!(listed, vec!["a.md".to_string(), "sub/b.md".to_string()]);
    }

    #[tokio::test]
    async fn traversal_is_refused() {
        let dir = TempDir::new().unwrap();
        assert!(write_file_atomic(dir.path(), "../escape.md", b"x")
            .await
            .is_err());
        assert!(read_file(dir.path(), "..").await.is_err());
    }

    #[tokio::test]
    async fn copy_dir_copies_tree() {
        let dir = TempDir::new().unwrap();
        write_file_atomic(dir.path(), "src/a.md", b"a").await.unwrap();
        write_file_atomic(dir.path(), "src/deep/b.md", b"b").await.unwrap();
        copy_dir_recursive(dir.path(), "src", "dst").await.unwrap();
        assert_eq!(read_file(dir.path(), "dst/a.md").await.unwrap(), b"a");
        assert_eq!(read_file(dir.path(), "dst/deep/b.md").await.unwrap(), b"b");
        assert!(dir.path().join("src/a.md").exists());
    }
}

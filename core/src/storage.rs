//! Object storage handed out by `ServiceContainer::scoped` (§4.A). Each
//! extension gets a root rooted under `<data_dir>/ext/<name>/` and cannot
//! address outside it; grounded in the teacher's
//! `repository::storage::RepositoryStorage`, which plays the same
//! root-confinement role for git repository checkouts.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::task;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> anyhow::Result<()>;
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>>;
    async fn delete(&self, key: &str) -> anyhow::Result<()>;
    async fn list(&self, prefix: &str) -> anyhow::Result<Vec<String>>;
}

/// Filesystem-backed store, one per extension, confined to its own root.
#[derive(Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Rejects any key that would escape `root` via `..` or an absolute
    /// path component; an extension only ever sees its own slice of disk.
    fn resolve(&self, key: &str) -> anyhow::Result<PathBuf> {
        let key_path = Path::new(key);
        if key_path
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir | std::path::Component::RootDir))
        {
            anyhow::bail!("object key `{key}` must not escape the extension's storage root");
        }
        Ok(self.root.join(key_path))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> anyhow::Result<()> {
        let path = self.resolve(key)?;
        task::spawn_blocking(move || -> anyhow::Result<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, bytes)?;
            Ok(())
        })
        .await?
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let path = self.resolve(key)?;
        task::spawn_blocking(move || -> anyhow::Result<Option<Vec<u8>>> {
            match std::fs::read(&path) {
                Ok(bytes) => Ok(Some(bytes)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
        .await?
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        let path = self.resolve(key)?;
        task::spawn_blocking(move || -> anyhow::Result<()> {
            match std::fs::remove_file(&path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            }
        })
        .await?
    }

    async fn list(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        let root = self.root.clone();
        let prefix = prefix.to_string();
        task::spawn_blocking(move || -> anyhow::Result<Vec<String>> {
            let mut out = Vec::new();
            if !root.is_dir() {
                return Ok(out);
            }
            for entry in walkdir_shallow(&root, &root)? {
                if entry.starts_with(&prefix) {
                    out.push(entry);
                }
            }
            out.sort();
            Ok(out)
        })
        .await?
    }
}

fn walkdir_shallow(root: &Path, dir: &Path) -> anyhow::Result<Vec<String>> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            out.extend(walkdir_shallow(root, &path)?);
        } else if let Ok(rel) = path.strip_prefix(root) {
            out.push(rel.to_string_lossy().replace('\\', "/"));
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_and_confines_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path().to_path_buf());

        store.put("notes/a.txt", b"hello".to_vec()).await.unwrap();
        let got = store.get("notes/a.txt").await.unwrap();
        assert_eq!(got, Some(b"hello".to_vec()));

        let listed = store.list("notes/").await.unwrap();
        assert_eq!(listed, vec!["notes/a.txt".to_string()]);

        store.delete("notes/a.txt").await.unwrap();
        assert_eq!(store.get("notes/a.txt").await.unwrap(), None);
    }

    #[tokio::test]
    async fn rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path().to_path_buf());
        assert!(store.put("../escape.txt", vec![]).await.is_err());
    }
}

//! Filesystem-backed store.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;

use crate::{Store, StoreError, StoreResult};

/// Store rooted at a local directory. Object names map to relative paths.
///
/// Writes go through a `.tmp` sibling and a rename, so a crashed upload
/// never leaves a listable partial object.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_of(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn walk(dir: &Path, root: &Path, out: &mut Vec<String>) -> std::io::Result<()> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err),
        };
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                Self::walk(&path, root, out)?;
            } else if let Ok(rel) = path.strip_prefix(root) {
                out.push(rel.to_string_lossy().replace('\\', "/"));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Store for FsStore {
    async fn list_files(
        &self,
        prefix: &str,
        exclude_suffix: &str,
        limit: usize,
    ) -> StoreResult<Vec<String>> {
        let root = self.root.clone();
        let prefix = prefix.to_string();
        let exclude = exclude_suffix.to_string();

        let mut names = tokio::task::spawn_blocking(move || -> std::io::Result<Vec<String>> {
            let mut out = Vec::new();
            Self::walk(&root, &root, &mut out)?;
            Ok(out)
        })
        .await
        .map_err(|err| StoreError::Io(std::io::Error::other(err)))??;

        names.retain(|name| {
            name.starts_with(&prefix) && (exclude.is_empty() || !name.ends_with(&exclude))
        });
        names.sort();
        names.truncate(limit);
        Ok(names)
    }

    async fn get_object(&self, name: &str) -> StoreResult<Bytes> {
        match tokio::fs::read(self.path_of(name)).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(name.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn put_object(&self, name: &str, content: Bytes) -> StoreResult<()> {
        let path = self.path_of(name);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension(match path.extension() {
            Some(ext) => format!("{}.tmp", ext.to_string_lossy()),
            None => "tmp".to_string(),
        });
        tokio::fs::write(&tmp, &content).await?;
        tokio::fs::rename(&tmp, &path).await?;
        tracing::debug!(name, bytes = content.len(), "object written");
        Ok(())
    }

    async fn exists(&self, name: &str) -> StoreResult<bool> {
        Ok(tokio::fs::try_exists(self.path_of(name)).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn put_get_exists_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = FsStore::new(dir.path());

        assert!(!store.exists("shards/0000000000.avro").await.unwrap());
        store
            .put_object("shards/0000000000.avro", Bytes::from_static(b"payload"))
            .await
            .unwrap();
        assert!(store.exists("shards/0000000000.avro").await.unwrap());
        assert_eq!(
            store.get_object("shards/0000000000.avro").await.unwrap(),
            Bytes::from_static(b"payload")
        );
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = FsStore::new(dir.path());
        assert!(matches!(
            store.get_object("nope").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn listing_is_sorted_filtered_and_excludes_suffix() {
        let dir = TempDir::new().unwrap();
        let store = FsStore::new(dir.path());

        for name in [
            "shards/0000005000.avro",
            "shards/0000000000.avro",
            "shards/0000010000.avro.tmp",
            "blocks/0000000000.dat",
        ] {
            store
                .put_object(name, Bytes::from_static(b"x"))
                .await
                .unwrap();
        }

        let listed = store.list_files("shards/", ".tmp", 100).await.unwrap();
        assert_eq!(
            listed,
            vec![
                "shards/0000000000.avro".to_string(),
                "shards/0000005000.avro".to_string(),
            ]
        );

        let limited = store.list_files("shards/", ".tmp", 1).await.unwrap();
        assert_eq!(limited, vec!["shards/0000000000.avro".to_string()]);
    }

    #[tokio::test]
    async fn listing_missing_root_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = FsStore::new(dir.path().join("absent"));
        assert!(store.list_files("", "", 10).await.unwrap().is_empty());
    }
}

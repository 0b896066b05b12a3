//! In-memory store for tests and single-process wiring.

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;
use bytes::Bytes;

use crate::{Store, StoreError, StoreResult};

/// Store over a `BTreeMap`, so listings are naturally lexicographic.
#[derive(Debug, Default)]
pub struct MemStore {
    objects: RwLock<BTreeMap<String, Bytes>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.objects.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Store for MemStore {
    async fn list_files(
        &self,
        prefix: &str,
        exclude_suffix: &str,
        limit: usize,
    ) -> StoreResult<Vec<String>> {
        let objects = self.objects.read().unwrap();
        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(name, _)| name.starts_with(prefix))
            .filter(|(name, _)| exclude_suffix.is_empty() || !name.ends_with(exclude_suffix))
            .take(limit)
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn get_object(&self, name: &str) -> StoreResult<Bytes> {
        self.objects
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    async fn put_object(&self, name: &str, content: Bytes) -> StoreResult<()> {
        self.objects
            .write()
            .unwrap()
            .insert(name.to_string(), content);
        Ok(())
    }

    async fn exists(&self, name: &str) -> StoreResult<bool> {
        Ok(self.objects.read().unwrap().contains_key(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn listing_respects_prefix_and_limit() {
        let store = MemStore::new();
        for name in ["a/1", "a/2", "a/3.tmp", "b/1"] {
            store
                .put_object(name, Bytes::from_static(b"x"))
                .await
                .unwrap();
        }

        assert_eq!(
            store.list_files("a/", ".tmp", 10).await.unwrap(),
            vec!["a/1".to_string(), "a/2".to_string()]
        );
        assert_eq!(
            store.list_files("a/", "", 1).await.unwrap(),
            vec!["a/1".to_string()]
        );
        assert!(store.list_files("c/", "", 10).await.unwrap().is_empty());
    }
}

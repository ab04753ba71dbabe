//! Object storage adapter.

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;

use super::{AdapterError, CallLog, record_call};

/// Storage categories (bucket-level namespaces).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectCategory {
    Material,
    Avatar,
}

impl ObjectCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectCategory::Material => "material",
            ObjectCategory::Avatar => "avatar",
        }
    }
}

impl std::fmt::Display for ObjectCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type ObjectReader = Box<dyn AsyncRead + Send + Unpin>;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn upload(&self, category: ObjectCategory, key: &str, bytes: Vec<u8>) -> Result<(), AdapterError>;

    async fn delete(&self, category: ObjectCategory, key: &str) -> Result<(), AdapterError>;

    async fn delete_prefix(&self, category: ObjectCategory, prefix: &str) -> Result<(), AdapterError>;

    async fn download(&self, category: ObjectCategory, key: &str) -> Result<ObjectReader, AdapterError>;

    fn public_url(&self, category: ObjectCategory, key: &str) -> String;
}

/// In-memory object store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryObjectStore {
    objects: RwLock<BTreeMap<(ObjectCategory, String), Vec<u8>>>,
    calls: CallLog,
    base_url: String,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self {
            base_url: "memory://objects".to_string(),
            ..Default::default()
        }
    }

    /// Share a call log with other in-memory adapters.
    pub fn with_call_log(mut self, calls: CallLog) -> Self {
        self.calls = calls;
        self
    }

    pub fn contains(&self, category: ObjectCategory, key: &str) -> bool {
        self.objects
            .read()
            .map(|o| o.contains_key(&(category, key.to_string())))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.objects.read().map(|o| o.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn poisoned() -> AdapterError {
        AdapterError::Unavailable("object store lock poisoned".to_string())
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn upload(&self, category: ObjectCategory, key: &str, bytes: Vec<u8>) -> Result<(), AdapterError> {
        record_call(&self.calls, format!("object.upload({category},{key})"));
        let mut objects = self.objects.write().map_err(|_| Self::poisoned())?;
        objects.insert((category, key.to_string()), bytes);
        Ok(())
    }

    async fn delete(&self, category: ObjectCategory, key: &str) -> Result<(), AdapterError> {
        record_call(&self.calls, format!("object.delete({category},{key})"));
        let mut objects = self.objects.write().map_err(|_| Self::poisoned())?;
        objects
            .remove(&(category, key.to_string()))
            .map(|_| ())
            .ok_or_else(|| AdapterError::NotFound(format!("{category}/{key}")))
    }

    async fn delete_prefix(&self, category: ObjectCategory, prefix: &str) -> Result<(), AdapterError> {
        record_call(&self.calls, format!("object.delete_prefix({category},{prefix})"));
        let mut objects = self.objects.write().map_err(|_| Self::poisoned())?;
        objects.retain(|(c, k), _| !(*c == category && k.starts_with(prefix)));
        Ok(())
    }

    async fn download(&self, category: ObjectCategory, key: &str) -> Result<ObjectReader, AdapterError> {
        let objects = self.objects.read().map_err(|_| Self::poisoned())?;
        let bytes = objects
            .get(&(category, key.to_string()))
            .cloned()
            .ok_or_else(|| AdapterError::NotFound(format!("{category}/{key}")))?;
        Ok(Box::new(std::io::Cursor::new(bytes)))
    }

    fn public_url(&self, category: ObjectCategory, key: &str) -> String {
        format!("{}/{}/{}", self.base_url, category, key)
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;

    use super::*;

    #[tokio::test]
    async fn upload_download_delete() {
        let store = InMemoryObjectStore::new();
        store
            .upload(ObjectCategory::Material, "u1/doc.pdf", b"pdf".to_vec())
            .await
            .unwrap();

        let mut reader = store.download(ObjectCategory::Material, "u1/doc.pdf").await.unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"pdf");

        store.delete(ObjectCategory::Material, "u1/doc.pdf").await.unwrap();
        let err = store.delete(ObjectCategory::Material, "u1/doc.pdf").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn delete_prefix_only_touches_its_category() {
        let store = InMemoryObjectStore::new();
        store.upload(ObjectCategory::Material, "m/1", vec![1]).await.unwrap();
        store.upload(ObjectCategory::Material, "m/2", vec![2]).await.unwrap();
        store.upload(ObjectCategory::Avatar, "m/3", vec![3]).await.unwrap();

        store.delete_prefix(ObjectCategory::Material, "m/").await.unwrap();

        assert_eq!(store.len(), 1);
        assert!(store.contains(ObjectCategory::Avatar, "m/3"));
        assert_eq!(
            store.public_url(ObjectCategory::Avatar, "m/3"),
            "memory://objects/avatar/m/3"
        );
    }
}

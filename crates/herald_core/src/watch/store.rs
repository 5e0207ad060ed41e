use async_trait::async_trait;
use dashmap::DashMap;
use std::fmt::Debug;
use std::path::{Path, PathBuf};

use crate::error::{CoreError, Result};

/// Durable storage for named JSON documents.
///
/// Every write replaces the whole document; readers never observe a partial
/// write.
#[async_trait]
pub trait PersistenceStore: Send + Sync + Debug {
    /// Returns `None` when the document has never been written.
    async fn load(&self, name: &str) -> Result<Option<String>>;

    async fn save(&self, name: &str, contents: &str) -> Result<()>;
}

/// One `<name>.json` file per document, written via temp file and rename.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    directory: PathBuf,
}

impl JsonFileStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.directory.join(format!("{}.json", name))
    }
}

#[async_trait]
impl PersistenceStore for JsonFileStore {
    async fn load(&self, name: &str) -> Result<Option<String>> {
        let path = self.path_for(name);
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CoreError::io("read state", &path, e)),
        }
    }

    async fn save(&self, name: &str, contents: &str) -> Result<()> {
        tokio::fs::create_dir_all(&self.directory)
            .await
            .map_err(|e| CoreError::io("create state directory", &self.directory, e))?;

        let path = self.path_for(name);
        let tmp_path = path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, contents)
            .await
            .map_err(|e| CoreError::io("write state", &tmp_path, e))?;
        tokio::fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| CoreError::io("replace state", &path, e))?;
        Ok(())
    }
}

/// Keeps documents in memory. Used by tests and ephemeral runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    documents: DashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.documents.get(name).map(|doc| doc.value().clone())
    }
}

#[async_trait]
impl PersistenceStore for MemoryStore {
    async fn load(&self, name: &str) -> Result<Option<String>> {
        Ok(self.get(name))
    }

    async fn save(&self, name: &str, contents: &str) -> Result<()> {
        self.documents.insert(name.to_string(), contents.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_document_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        assert!(store.load("weibo").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_replaces_whole_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("state"));

        store.save("weibo", r#"{"user":{"1":{}}}"#).await.unwrap();
        store.save("weibo", r#"{"user":{}}"#).await.unwrap();

        assert_eq!(
            store.load("weibo").await.unwrap().as_deref(),
            Some(r#"{"user":{}}"#)
        );
        assert!(!dir.path().join("state").join("weibo.json.tmp").exists());
    }
}

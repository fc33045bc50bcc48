//! Document Store: parameter sets and pattern coordinate lists.
//!
//! Documents are plain JSON values addressed by `(doc_type, doc_id)`. The
//! engine fetches every document a sequence binds once, at bind time, and
//! never re-reads them while the sequence runs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::DocumentError;

/// Source of named JSON documents.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetches document `doc_id` of type `doc_type`.
    async fn get(&self, doc_type: &str, doc_id: &str) -> Result<Value, DocumentError>;
}

/// Documents held in memory. Used by tests and embedders that load documents
/// from their own storage.
#[derive(Debug, Default)]
pub struct InMemoryDocumentStore {
    docs: RwLock<HashMap<(String, String), Value>>,
}

impl InMemoryDocumentStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert for setup code.
    pub fn with(mut self, doc_type: &str, doc_id: &str, doc: Value) -> Self {
        self.docs
            .get_mut()
            .insert((doc_type.to_string(), doc_id.to_string()), doc);
        self
    }

    /// Adds or replaces a document.
    pub async fn insert(&self, doc_type: &str, doc_id: &str, doc: Value) {
        self.docs
            .write()
            .await
            .insert((doc_type.to_string(), doc_id.to_string()), doc);
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn get(&self, doc_type: &str, doc_id: &str) -> Result<Value, DocumentError> {
        self.docs
            .read()
            .await
            .get(&(doc_type.to_string(), doc_id.to_string()))
            .cloned()
            .ok_or_else(|| DocumentError::NotFound {
                doc_type: doc_type.to_string(),
                doc_id: doc_id.to_string(),
            })
    }
}

/// Documents stored as files: `<root>/<doc_type>/<doc_id>.{json,yaml,yml}`.
#[derive(Debug, Clone)]
pub struct FileDocumentStore {
    root: PathBuf,
}

impl FileDocumentStore {
    /// Store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory documents are read from.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn check_segment(segment: &str) -> Result<(), DocumentError> {
        let bad = segment.is_empty()
            || segment == "."
            || segment == ".."
            || segment.contains(['/', '\\']);
        if bad {
            return Err(DocumentError::InvalidId(segment.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for FileDocumentStore {
    async fn get(&self, doc_type: &str, doc_id: &str) -> Result<Value, DocumentError> {
        Self::check_segment(doc_type)?;
        Self::check_segment(doc_id)?;

        let dir = self.root.join(doc_type);
        for ext in ["json", "yaml", "yml"] {
            let path = dir.join(format!("{doc_id}.{ext}"));
            let text = match tokio::fs::read_to_string(&path).await {
                Ok(text) => text,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(DocumentError::Unreadable {
                        doc_type: doc_type.to_string(),
                        doc_id: doc_id.to_string(),
                        reason: e.to_string(),
                    })
                }
            };
            debug!(path = %path.display(), "loaded document");
            let parsed = if ext == "json" {
                serde_json::from_str(&text).map_err(|e| e.to_string())
            } else {
                serde_yaml::from_str(&text).map_err(|e| e.to_string())
            };
            return parsed.map_err(|reason| DocumentError::Unreadable {
                doc_type: doc_type.to_string(),
                doc_id: doc_id.to_string(),
                reason,
            });
        }

        Err(DocumentError::NotFound {
            doc_type: doc_type.to_string(),
            doc_id: doc_id.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_in_memory_lookup() {
        let store = InMemoryDocumentStore::new().with("parameters", "nominal", json!({"passes": 3}));
        assert_eq!(
            store.get("parameters", "nominal").await.unwrap(),
            json!({"passes": 3})
        );
        assert!(matches!(
            store.get("parameters", "other").await,
            Err(DocumentError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_file_store_reads_json_and_yaml() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("parameters")).unwrap();
        std::fs::create_dir_all(dir.path().join("patterns")).unwrap();
        std::fs::write(
            dir.path().join("parameters/nominal.json"),
            r#"{"gas": {"main_flow": 60.0}}"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("patterns/serpentine.yaml"),
            "start:\n  x: 10.0\n  y: 20.0\n",
        )
        .unwrap();

        let store = FileDocumentStore::new(dir.path());
        assert_eq!(
            store.get("parameters", "nominal").await.unwrap(),
            json!({"gas": {"main_flow": 60.0}})
        );
        assert_eq!(
            store.get("patterns", "serpentine").await.unwrap(),
            json!({"start": {"x": 10.0, "y": 20.0}})
        );
    }

    #[tokio::test]
    async fn test_file_store_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileDocumentStore::new(dir.path());
        assert!(matches!(
            store.get("parameters", "../secrets").await,
            Err(DocumentError::InvalidId(_))
        ));
        assert!(matches!(
            store.get("..", "x").await,
            Err(DocumentError::InvalidId(_))
        ));
    }

    #[tokio::test]
    async fn test_file_store_reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("parameters")).unwrap();
        std::fs::write(dir.path().join("parameters/bad.json"), "{not json").unwrap();
        let store = FileDocumentStore::new(dir.path());
        assert!(matches!(
            store.get("parameters", "bad").await,
            Err(DocumentError::Unreadable { .. })
        ));
    }
}

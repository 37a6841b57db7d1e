#[cfg(test)]
#[path = "document_test.rs"]
mod tests;

use std::path;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Map;
use serde_json::Value;
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Document-style key-value persistence, namespaced per logical file. The
/// session store treats it as a black box.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;
    fn set(&self, key: &str, value: Value);
    async fn save(&self) -> Result<()>;
}

/// One JSON document on disk. A missing or corrupt file starts empty rather
/// than failing the load.
pub struct JsonFileStore {
    file_path: path::PathBuf,
    values: DashMap<String, Value>,
}

impl JsonFileStore {
    pub async fn open(dir: &path::Path, name: &str) -> JsonFileStore {
        let file_path = dir.join(name);
        let values = DashMap::new();

        if file_path.exists() {
            if let Ok(payload) = fs::read_to_string(&file_path).await {
                match serde_json::from_str::<Map<String, Value>>(&payload) {
                    Ok(doc) => {
                        for (key, value) in doc {
                            values.insert(key, value);
                        }
                    }
                    Err(err) => {
                        tracing::warn!(error = ?err, path = ?file_path, "document is corrupt, starting empty");
                    }
                }
            }
        }

        return JsonFileStore { file_path, values };
    }
}

#[async_trait]
impl DocumentStore for JsonFileStore {
    fn get(&self, key: &str) -> Option<Value> {
        return self.values.get(key).map(|e| return e.clone());
    }

    fn set(&self, key: &str, value: Value) {
        self.values.insert(key.to_string(), value);
    }

    async fn save(&self) -> Result<()> {
        let mut doc = Map::new();
        for entry in self.values.iter() {
            doc.insert(entry.key().clone(), entry.value().clone());
        }
        let payload = serde_json::to_string_pretty(&Value::Object(doc))?;

        if let Some(parent) = self.file_path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent).await?;
            }
        }

        let mut file = fs::File::create(&self.file_path).await?;
        file.write_all(payload.as_bytes()).await?;

        return Ok(());
    }
}

/// In-memory document for embedders without a disk, and for tests.
pub struct MemoryStore {
    values: DashMap<String, Value>,
    saves: AtomicUsize,
}

impl Default for MemoryStore {
    fn default() -> MemoryStore {
        return MemoryStore::new();
    }
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        return MemoryStore {
            values: DashMap::new(),
            saves: AtomicUsize::new(0),
        };
    }

    /// How many times `save` ran. Lets tests assert on debounce behavior.
    pub fn saves(&self) -> usize {
        return self.saves.load(Ordering::SeqCst);
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    fn get(&self, key: &str) -> Option<Value> {
        return self.values.get(key).map(|e| return e.clone());
    }

    fn set(&self, key: &str, value: Value) {
        self.values.insert(key.to_string(), value);
    }

    async fn save(&self) -> Result<()> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        return Ok(());
    }
}

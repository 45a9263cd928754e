use crate::backend::StateBackend;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conductor_core::{ConductorError, ConductorResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// On-disk record: the value plus its original key and expiry.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    key: String,
    value: serde_json::Value,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
}

impl Envelope {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Utc::now())
    }
}

/// File-based backend (one JSON file per key).
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    pub async fn new(dir: impl Into<PathBuf>) -> ConductorResult<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn key_path(&self, key: &str) -> PathBuf {
        let file: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{file}.json"))
    }

    async fn read(&self, path: &Path) -> ConductorResult<Option<Envelope>> {
        let data = match tokio::fs::read_to_string(path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let envelope: Envelope = serde_json::from_str(&data).map_err(|e| {
            ConductorError::Storage(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        if envelope.is_expired() {
            remove_if_exists(path).await?;
            return Ok(None);
        }
        Ok(Some(envelope))
    }
}

async fn remove_if_exists(path: &Path) -> ConductorResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl StateBackend for FileBackend {
    async fn get(&self, key: &str) -> ConductorResult<Option<serde_json::Value>> {
        Ok(self
            .read(&self.key_path(key))
            .await?
            .filter(|env| env.key == key)
            .map(|env| env.value))
    }

    async fn set(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> ConductorResult<()> {
        let expires_at = match ttl {
            Some(ttl) => Some(
                Utc::now()
                    + chrono::Duration::from_std(ttl)
                        .map_err(|e| ConductorError::Storage(format!("TTL out of range: {e}")))?,
            ),
            None => None,
        };
        let envelope = Envelope {
            key: key.to_string(),
            value,
            expires_at,
        };
        let path = self.key_path(key);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_string_pretty(&envelope)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> ConductorResult<()> {
        remove_if_exists(&self.key_path(key)).await
    }

    async fn keys(&self, prefix: &str) -> ConductorResult<Vec<String>> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match self.read(&path).await {
                Ok(Some(env)) if env.key.starts_with(prefix) => keys.push(env.key),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable state file");
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn name(&self) -> &str {
        "file"
    }
}

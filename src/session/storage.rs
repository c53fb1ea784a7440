use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use async_trait::async_trait;
use tracing::debug;

use crate::backend::dto::Session;

/// Where a backend keeps the session between app launches.
#[async_trait]
pub trait SessionStorage: Send + Sync {
    async fn load(&self) -> anyhow::Result<Option<Session>>;
    async fn save(&self, session: &Session) -> anyhow::Result<()>;
    async fn clear(&self) -> anyhow::Result<()>;
}

/// JSON file on disk.
pub struct FileSessionStorage {
    path: PathBuf,
}

impl FileSessionStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SessionStorage for FileSessionStorage {
    async fn load(&self) -> anyhow::Result<Option<Session>> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("read session {}", self.path.display()))
            }
        };
        let session = serde_json::from_slice(&raw)
            .with_context(|| format!("parse session {}", self.path.display()))?;
        debug!(path = %self.path.display(), "session loaded");
        Ok(Some(session))
    }

    async fn save(&self, session: &Session) -> anyhow::Result<()> {
        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("create {}", dir.display()))?;
        }
        let raw = serde_json::to_vec_pretty(session)?;
        tokio::fs::write(&self.path, raw)
            .await
            .with_context(|| format!("write session {}", self.path.display()))?;
        Ok(())
    }

    async fn clear(&self) -> anyhow::Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("remove session {}", self.path.display())),
        }
    }
}

/// Process-lifetime storage; nothing survives a restart.
#[derive(Default)]
pub struct MemorySessionStorage {
    slot: Mutex<Option<Session>>,
}

impl MemorySessionStorage {
    pub fn with_session(session: Session) -> Self {
        Self {
            slot: Mutex::new(Some(session)),
        }
    }
}

#[async_trait]
impl SessionStorage for MemorySessionStorage {
    async fn load(&self) -> anyhow::Result<Option<Session>> {
        Ok(self.slot.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    async fn save(&self, session: &Session) -> anyhow::Result<()> {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(session.clone());
        Ok(())
    }

    async fn clear(&self) -> anyhow::Result<()> {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = None;
        Ok(())
    }
}

#[cfg(test)]
mod storage_tests {
    use super::*;
    use crate::backend::dto::SessionUser;
    use uuid::Uuid;

    fn session() -> Session {
        Session {
            access_token: "a".into(),
            refresh_token: "r".into(),
            expires_at: 4_102_444_800,
            user: SessionUser {
                id: Uuid::new_v4(),
                email: "a@b.co".into(),
            },
        }
    }

    #[tokio::test]
    async fn file_storage_persists_and_clears() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileSessionStorage::new(dir.path().join("nested").join("session.json"));

        assert_eq!(storage.load().await.unwrap(), None);

        let s = session();
        storage.save(&s).await.unwrap();
        assert_eq!(storage.load().await.unwrap(), Some(s));

        storage.clear().await.unwrap();
        assert_eq!(storage.load().await.unwrap(), None);
        // clearing twice is fine
        storage.clear().await.unwrap();
    }

    #[tokio::test]
    async fn file_storage_reports_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();
        let err = FileSessionStorage::new(&path).load().await.unwrap_err();
        assert!(err.to_string().contains("parse session"));
    }
}

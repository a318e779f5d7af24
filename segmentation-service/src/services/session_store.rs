use crate::models::{Session, SessionId, SessionStatus};
use crate::nifti::NiftiFormat;
use async_trait::async_trait;
use axum::body::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use service_core::error::AppError;
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::fs;

/// Maps session identifiers to their working directories.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Allocates a fresh session and its directory.
    async fn create(&self) -> Result<Session, AppError>;

    /// Persists the uploaded image unchanged and returns where it landed.
    async fn write_input(
        &self,
        session: &Session,
        format: NiftiFormat,
        data: Bytes,
    ) -> Result<PathBuf, AppError>;

    async fn get(&self, id: &SessionId) -> Option<Session>;

    async fn mark_segmented(&self, id: &SessionId) -> Result<(), AppError>;

    /// Path of a segmented session's artifact; `NotFound` otherwise.
    async fn artifact(&self, id: &SessionId) -> Result<PathBuf, AppError>;

    async fn remove(&self, id: &SessionId) -> Result<(), AppError>;

    /// Removes a session that will never be served, logging instead of failing.
    async fn discard(&self, id: &SessionId) {
        if let Err(e) = self.remove(id).await {
            tracing::warn!(session_id = %id, error = %e, "Failed to discard session");
        }
    }

    /// Segmented sessions created before `cutoff`. Sessions still waiting on
    /// the segmenter are never listed.
    async fn segmented_before(&self, cutoff: DateTime<Utc>) -> Vec<SessionId>;

    /// Removes every tracked session.
    async fn clear(&self) -> Result<(), AppError>;

    async fn is_ready(&self) -> bool;
}

pub struct LocalSessionStore {
    root: PathBuf,
    sessions: DashMap<SessionId, Session>,
}

impl LocalSessionStore {
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self, AppError> {
        let root = root.into();
        if !root.exists() {
            fs::create_dir_all(&root).await?;
        }
        Ok(Self {
            root,
            sessions: DashMap::new(),
        })
    }
}

#[async_trait]
impl SessionStore for LocalSessionStore {
    async fn create(&self) -> Result<Session, AppError> {
        // create_dir (not create_dir_all) so a colliding id is detected
        for _ in 0..3 {
            let id = SessionId::new();
            if self.sessions.contains_key(&id) {
                continue;
            }
            let dir = self.root.join(id.to_string());
            match fs::create_dir(&dir).await {
                Ok(()) => {
                    let session = Session::new(id, dir);
                    self.sessions.insert(id, session.clone());
                    tracing::debug!(session_id = %id, dir = ?session.dir, "Session created");
                    return Ok(session);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    tracing::error!("Failed to create session directory {:?}: {}", dir, e);
                    return Err(e.into());
                }
            }
        }

        Err(AppError::InternalError(anyhow::anyhow!(
            "Could not allocate a unique session directory"
        )))
    }

    async fn write_input(
        &self,
        session: &Session,
        format: NiftiFormat,
        data: Bytes,
    ) -> Result<PathBuf, AppError> {
        let path = session.input_path(format.is_gzipped());
        fs::write(&path, &data).await.map_err(|e| {
            tracing::error!(session_id = %session.id, "Failed to write upload {:?}: {}", path, e);
            AppError::from(e)
        })?;
        Ok(path)
    }

    async fn get(&self, id: &SessionId) -> Option<Session> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    async fn mark_segmented(&self, id: &SessionId) -> Result<(), AppError> {
        let mut entry = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Session not found")))?;
        entry.status = SessionStatus::Segmented;
        Ok(())
    }

    async fn artifact(&self, id: &SessionId) -> Result<PathBuf, AppError> {
        let session = self
            .get(id)
            .await
            .filter(|s| s.status == SessionStatus::Segmented)
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Segmentation not found")))?;

        let path = session.artifact_path();
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(path),
            _ => Err(AppError::NotFound(anyhow::anyhow!("Segmentation not found"))),
        }
    }

    async fn remove(&self, id: &SessionId) -> Result<(), AppError> {
        let Some((_, session)) = self.sessions.remove(id) else {
            return Ok(());
        };

        match fs::remove_dir_all(&session.dir).await {
            Ok(()) => {
                tracing::debug!(session_id = %id, "Session removed");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => {
                tracing::error!(session_id = %id, "Failed to remove session directory: {}", e);
                Err(e.into())
            }
        }
    }

    async fn segmented_before(&self, cutoff: DateTime<Utc>) -> Vec<SessionId> {
        self.sessions
            .iter()
            .filter(|entry| entry.status == SessionStatus::Segmented && entry.created_at < cutoff)
            .map(|entry| *entry.key())
            .collect()
    }

    async fn clear(&self) -> Result<(), AppError> {
        let ids: Vec<SessionId> = self.sessions.iter().map(|entry| *entry.key()).collect();
        for id in &ids {
            self.remove(id).await?;
        }

        // Only drops the root if nothing else lives there.
        if let Err(e) = fs::remove_dir(&self.root).await {
            tracing::debug!(root = ?self.root, "Session root kept: {}", e);
        }

        tracing::info!(removed = ids.len(), "Session store cleared");
        Ok(())
    }

    async fn is_ready(&self) -> bool {
        fs::metadata(&self.root)
            .await
            .map(|meta| meta.is_dir())
            .unwrap_or(false)
    }
}

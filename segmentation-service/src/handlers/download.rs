use crate::models::{SessionId, ARTIFACT_NAME};
use crate::startup::AppState;
use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
};
use service_core::error::AppError;
use tokio_util::io::ReaderStream;

pub async fn download_segmentation(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    // Anything that is not a session id never reaches the filesystem.
    let id: SessionId = session_id
        .parse()
        .map_err(|_| AppError::NotFound(anyhow::anyhow!("Segmentation not found")))?;

    let path = state.sessions.artifact(&id).await?;

    let file = tokio::fs::File::open(&path).await.map_err(|e| {
        tracing::error!(session_id = %id, path = ?path, error = %e, "Failed to open segmentation");
        AppError::NotFound(anyhow::anyhow!("Segmentation not found"))
    })?;
    let size = file.metadata().await?.len();

    tracing::info!(session_id = %id, size, "Segmentation download started");

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_LENGTH, size.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", ARTIFACT_NAME),
            ),
        ],
        Body::from_stream(ReaderStream::new(file)),
    ))
}

use crate::dtos::SegmentResponse;
use crate::models::{Modality, Session, SessionId};
use crate::nifti::{self, NiftiFormat};
use crate::services::SessionStore;
use crate::startup::AppState;
use crate::workers::SegmentationRequest;
use axum::{
    body::Bytes,
    extract::{
        multipart::{MultipartError, MultipartRejection},
        Multipart, State,
    },
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use service_core::error::AppError;
use std::sync::Arc;

const FILE_FIELD: &str = "file";
const MODALITY_FIELD: &str = "image_type";

/// A fully validated upload, ready to be stored.
#[derive(Debug)]
struct SegmentUpload {
    file_name: String,
    format: NiftiFormat,
    data: Bytes,
    modality: Modality,
}

fn multipart_error(e: MultipartError) -> AppError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        AppError::PayloadTooLarge(e.body_text())
    } else {
        AppError::BadRequest(anyhow::anyhow!(
            "Failed to read multipart body: {}",
            e.body_text()
        ))
    }
}

async fn read_upload(multipart: &mut Multipart) -> Result<SegmentUpload, AppError> {
    let mut file: Option<(String, NiftiFormat, Bytes)> = None;
    let mut modality: Option<String> = None;

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some(FILE_FIELD) => {
                let file_name = field.file_name().unwrap_or_default().to_string();
                // Checked before the body is read so bad uploads fail fast.
                let format = NiftiFormat::from_file_name(&file_name).ok_or_else(|| {
                    AppError::BadRequest(anyhow::anyhow!(
                        "Unsupported file type '{}': expected a .nii or .nii.gz file",
                        file_name
                    ))
                })?;
                let data = field.bytes().await.map_err(multipart_error)?;
                file = Some((file_name, format, data));
            }
            Some(MODALITY_FIELD) => {
                modality = Some(field.text().await.map_err(multipart_error)?);
            }
            _ => {
                tracing::debug!(field = ?name, "Ignoring unexpected multipart field");
            }
        }
    }

    let (file_name, format, data) =
        file.ok_or_else(|| AppError::BadRequest(anyhow::anyhow!("No file uploaded")))?;

    let modality = modality
        .filter(|m| !m.trim().is_empty())
        .ok_or_else(|| {
            AppError::BadRequest(anyhow::anyhow!("Missing image_type: expected CT or MR"))
        })?
        .parse::<Modality>()
        .map_err(|e| AppError::BadRequest(anyhow::anyhow!(e)))?;

    if data.is_empty() {
        return Err(AppError::BadRequest(anyhow::anyhow!("Uploaded file is empty")));
    }

    nifti::sniff(format, &data).map_err(|e| {
        AppError::BadRequest(anyhow::anyhow!(
            "Uploaded file is not a valid NIfTI image: {}",
            e
        ))
    })?;

    Ok(SegmentUpload {
        file_name,
        format,
        data,
        modality,
    })
}

/// Discards a session if the request is dropped before it completes.
struct SessionGuard {
    sessions: Arc<dyn SessionStore>,
    id: Option<SessionId>,
}

impl SessionGuard {
    fn new(sessions: Arc<dyn SessionStore>, id: SessionId) -> Self {
        Self {
            sessions,
            id: Some(id),
        }
    }

    fn disarm(mut self) {
        self.id = None;
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };
        tracing::warn!(session_id = %id, "Request dropped before segmentation settled");
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let sessions = self.sessions.clone();
            runtime.spawn(async move { sessions.discard(&id).await });
        }
    }
}

/// Stores the image in a fresh session and runs the segmentation.
///
/// Failed and abandoned requests never leave a session behind: the worker
/// pool settles accepted jobs and the guard covers everything else.
async fn segment_input(
    state: &AppState,
    format: NiftiFormat,
    data: Bytes,
    modality: Modality,
) -> Result<SegmentResponse, AppError> {
    let session = state.sessions.create().await?;
    let guard = SessionGuard::new(state.sessions.clone(), session.id);

    let result = run_segmentation(state, &session, format, data, modality).await;
    if result.is_err() {
        state.sessions.discard(&session.id).await;
    }

    guard.disarm();
    result
}

async fn run_segmentation(
    state: &AppState,
    session: &Session,
    format: NiftiFormat,
    data: Bytes,
    modality: Modality,
) -> Result<SegmentResponse, AppError> {
    let size = data.len();
    let input = state.sessions.write_input(session, format, data).await?;

    tracing::info!(
        session_id = %session.id,
        size,
        modality = %modality,
        "Segmentation input stored"
    );

    let request = SegmentationRequest {
        session_id: session.id,
        input,
        output: session.artifact_path(),
        modality,
    };

    let result = state.jobs.submit(request).await?;
    Ok(SegmentResponse::success(session, modality, result))
}

pub async fn segment_image(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<impl IntoResponse, AppError> {
    let mut multipart = multipart.map_err(|e| {
        AppError::BadRequest(anyhow::anyhow!("Expected a multipart/form-data body: {}", e))
    })?;

    let upload = read_upload(&mut multipart).await?;

    tracing::info!(
        filename = %upload.file_name,
        size = upload.data.len(),
        modality = %upload.modality,
        "Segmentation upload received"
    );

    let response = segment_input(&state, upload.format, upload.data, upload.modality).await?;
    Ok(Json(response))
}

/// Segments the bundled example MR image.
pub async fn segment_example(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    let unavailable = || AppError::NotFound(anyhow::anyhow!("Example image not available"));

    let path = state.config.example.image_path.clone().ok_or_else(unavailable)?;
    let format = path
        .file_name()
        .and_then(|name| name.to_str())
        .and_then(NiftiFormat::from_file_name)
        .ok_or_else(unavailable)?;

    let data = match tokio::fs::read(&path).await {
        Ok(data) => Bytes::from(data),
        Err(e) => {
            tracing::warn!(path = ?path, error = %e, "Example image could not be read");
            return Err(unavailable());
        }
    };

    tracing::info!(path = ?path, "Segmenting example image");

    let response = segment_input(&state, format, data, Modality::Mr).await?;
    Ok(Json(response))
}

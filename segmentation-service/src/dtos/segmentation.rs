use crate::models::{LabelMap, Modality, SegmentationResult, Session, SessionId};
use serde::{Deserialize, Serialize};

/// Errors are rendered by `service_core::error::ErrorResponse`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SegmentResponse {
    pub status: ResponseStatus,
    pub session_id: SessionId,
    pub download_url: String,
    pub modality: Modality,
    pub task: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_map: Option<LabelMap>,
}

impl SegmentResponse {
    pub fn success(session: &Session, modality: Modality, result: SegmentationResult) -> Self {
        Self {
            status: ResponseStatus::Success,
            session_id: session.id,
            download_url: session.download_url(),
            modality,
            task: modality.task().to_string(),
            label_map: result.label_map,
        }
    }
}

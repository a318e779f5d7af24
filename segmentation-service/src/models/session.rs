use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

/// File name of the segmentation artifact inside a session directory.
pub const ARTIFACT_NAME: &str = "segmentation.nii";

/// Label value to anatomical structure name.
pub type LabelMap = BTreeMap<u32, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Uploaded,
    Segmented,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub dir: PathBuf,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: SessionId, dir: PathBuf) -> Self {
        Self {
            id,
            dir,
            status: SessionStatus::Uploaded,
            created_at: Utc::now(),
        }
    }

    /// Upload path, keeping the compression suffix the external tool relies on.
    pub fn input_path(&self, gzipped: bool) -> PathBuf {
        if gzipped {
            self.dir.join("input.nii.gz")
        } else {
            self.dir.join("input.nii")
        }
    }

    pub fn artifact_path(&self) -> PathBuf {
        self.dir.join(ARTIFACT_NAME)
    }

    pub fn download_url(&self) -> String {
        format!("/download/{}/{}", self.id, ARTIFACT_NAME)
    }
}

#[derive(Debug, Clone)]
pub struct SegmentationResult {
    pub artifact: PathBuf,
    pub label_map: Option<LabelMap>,
}

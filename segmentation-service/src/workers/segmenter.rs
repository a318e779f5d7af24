use crate::config::SegmenterConfig;
use crate::models::{Modality, SessionId};
use crate::workers::executor::CommandExecutor;
use async_trait::async_trait;
use service_core::error::AppError;
use std::ffi::OsString;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct SegmentationRequest {
    pub session_id: SessionId,
    pub input: PathBuf,
    pub output: PathBuf,
    pub modality: Modality,
}

/// The external segmentation capability.
///
/// Implementations write a multilabel NIfTI to `request.output` and return
/// its path. Failures must come back as errors, never panics.
#[async_trait]
pub trait Segmenter: Send + Sync {
    async fn segment(&self, request: &SegmentationRequest) -> Result<PathBuf, AppError>;
}

/// Runs the TotalSegmentator CLI as a subprocess.
pub struct TotalSegmentator {
    config: SegmenterConfig,
    executor: CommandExecutor,
}

impl TotalSegmentator {
    pub fn new(config: SegmenterConfig) -> Self {
        let executor = CommandExecutor::new(config.timeout());
        Self { config, executor }
    }

    fn build_args(&self, request: &SegmentationRequest) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "-i".into(),
            request.input.clone().into_os_string(),
            "-o".into(),
            request.output.clone().into_os_string(),
            "--ml".into(),
            "--task".into(),
            request.modality.task().into(),
        ];

        if self.config.fast {
            args.push("--fast".into());
        }
        if let Some(device) = &self.config.device {
            args.push("--device".into());
            args.push(device.into());
        }
        args.extend(self.config.extra_args.iter().map(OsString::from));

        args
    }
}

#[async_trait]
impl Segmenter for TotalSegmentator {
    async fn segment(&self, request: &SegmentationRequest) -> Result<PathBuf, AppError> {
        tracing::info!(
            session_id = %request.session_id,
            modality = %request.modality,
            task = request.modality.task(),
            "Running TotalSegmentator"
        );

        let args = self.build_args(request);
        self.executor
            .execute(&self.config.program, &args, request.output.parent())
            .await?;

        if !tokio::fs::try_exists(&request.output).await.unwrap_or(false) {
            return Err(AppError::ProcessingFailed(format!(
                "{} finished without producing {}",
                self.config.program,
                request.output.display()
            )));
        }

        Ok(request.output.clone())
    }
}

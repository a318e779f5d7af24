#![allow(dead_code)]

use async_trait::async_trait;
use reqwest::multipart;
use segmentation_service::config::SegmentationConfig;
use segmentation_service::models::Modality;
use segmentation_service::startup::Application;
use segmentation_service::workers::{SegmentationRequest, Segmenter};
use service_core::error::AppError;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

pub const LABEL_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?> <CaretExtension>
  <VolumeInformation Index="0">   <LabelTable>
<Label Key="1" Red="1.0" Green="0.0" Blue="0.0" Alpha="1"><![CDATA[spleen]]></Label>
<Label Key="5" Red="0.0" Green="0.0" Blue="1.0" Alpha="1"><![CDATA[liver]]></Label>
  </LabelTable>  <VolumeType><![CDATA[Label]]></VolumeType>   </VolumeInformation></CaretExtension>"#;

/// Little-endian NIfTI-1 single file, optionally carrying a label extension.
pub fn nifti_bytes(extension: Option<&str>) -> Vec<u8> {
    let esize = extension
        .map(|xml| (8 + xml.len()).div_ceil(16) * 16)
        .unwrap_or(0);
    let vox_offset = 352 + esize;

    let mut buf = vec![0u8; 348];
    buf[0..4].copy_from_slice(&348i32.to_le_bytes());
    buf[108..112].copy_from_slice(&(vox_offset as f32).to_le_bytes());
    buf[344..348].copy_from_slice(b"n+1\0");
    buf.extend_from_slice(&[extension.is_some() as u8, 0, 0, 0]);

    if let Some(xml) = extension {
        buf.extend_from_slice(&(esize as i32).to_le_bytes());
        buf.extend_from_slice(&0i32.to_le_bytes());
        buf.extend_from_slice(xml.as_bytes());
        buf.resize(vox_offset, 0);
    }
    buf.extend_from_slice(&[0u8; 128]);
    buf
}

/// Bytes that pass the gzip check for `.nii.gz` uploads.
pub fn gzipped_bytes() -> Vec<u8> {
    let mut data = vec![0x1f, 0x8b, 0x08, 0x00];
    data.extend_from_slice(&[0u8; 64]);
    data
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeMode {
    Succeed,
    Fail,
    Slow(Duration),
}

/// Stand-in for the external tool: writes a labelled NIfTI next to the input.
pub struct FakeSegmenter {
    mode: FakeMode,
    calls: AtomicUsize,
    modalities: Mutex<Vec<Modality>>,
}

impl FakeSegmenter {
    pub fn new(mode: FakeMode) -> Arc<Self> {
        Arc::new(Self {
            mode,
            calls: AtomicUsize::new(0),
            modalities: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn modalities(&self) -> Vec<Modality> {
        self.modalities.lock().unwrap().clone()
    }
}

#[async_trait]
impl Segmenter for FakeSegmenter {
    async fn segment(&self, request: &SegmentationRequest) -> Result<PathBuf, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.modalities.lock().unwrap().push(request.modality);

        assert!(
            request.input.exists(),
            "input must be stored before the segmenter runs"
        );

        match self.mode {
            FakeMode::Fail => {
                return Err(AppError::ProcessingFailed(
                    "TotalSegmentator exited with exit status: 1: corrupt image".into(),
                ))
            }
            FakeMode::Slow(delay) => tokio::time::sleep(delay).await,
            FakeMode::Succeed => {}
        }

        tokio::fs::write(&request.output, nifti_bytes(Some(LABEL_XML)))
            .await
            .map_err(AppError::from)?;
        Ok(request.output.clone())
    }
}

/// Multipart body the upload form would send.
pub fn upload_form(file_name: &str, data: Vec<u8>, image_type: Option<&str>) -> multipart::Form {
    let mut form = multipart::Form::new().part(
        "file",
        multipart::Part::bytes(data)
            .file_name(file_name.to_string())
            .mime_str("application/octet-stream")
            .unwrap(),
    );
    if let Some(image_type) = image_type {
        form = form.text("image_type", image_type.to_string());
    }
    form
}

pub struct TestApp {
    pub address: String,
    pub port: u16,
    pub session_root: PathBuf,
    pub segmenter: Arc<FakeSegmenter>,
    pub client: reqwest::Client,
}

impl TestApp {
    pub async fn spawn() -> Self {
        Self::spawn_with(FakeMode::Succeed, |_| {}).await
    }

    pub async fn spawn_with(mode: FakeMode, configure: impl FnOnce(&mut SegmentationConfig)) -> Self {
        let session_root = PathBuf::from(format!("target/test-sessions-{}", Uuid::new_v4()));

        let mut config = SegmentationConfig::load().expect("Failed to load configuration");
        config.common.port = 0; // Random port for testing
        config.sessions.root = session_root.clone();
        config.sessions.ttl_secs = 0;
        config.sessions.cleanup_on_exit = false;
        config.example.image_path = None;
        configure(&mut config);

        let segmenter = FakeSegmenter::new(mode);
        let app = Application::build_with_segmenter(config, segmenter.clone())
            .await
            .expect("Failed to build test application");

        let port = app.port();
        let address = format!("http://127.0.0.1:{}", port);

        tokio::spawn(async move {
            app.run_until_stopped().await.ok();
        });

        // Wait for HTTP server to be ready by polling health endpoint
        let client = reqwest::Client::new();
        let health_url = format!("{}/health", address);
        for _ in 0..50 {
            if client.get(&health_url).send().await.is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        TestApp {
            address,
            port,
            session_root,
            segmenter,
            client,
        }
    }

    pub async fn upload(
        &self,
        file_name: &str,
        data: Vec<u8>,
        image_type: Option<&str>,
    ) -> reqwest::Response {
        self.client
            .post(format!("{}/segment/", self.address))
            .multipart(upload_form(file_name, data, image_type))
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn get(&self, path: &str) -> reqwest::Response {
        self.client
            .get(format!("{}{}", self.address, path))
            .send()
            .await
            .expect("Failed to execute request")
    }

    /// Session directories currently on disk.
    pub fn session_dirs(&self) -> Vec<PathBuf> {
        std::fs::read_dir(&self.session_root)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .map(|e| e.path())
                    .filter(|p| p.is_dir())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn cleanup(&self) {
        let _ = tokio::fs::remove_dir_all(&self.session_root).await;
    }
}

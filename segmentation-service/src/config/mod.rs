use serde::Deserialize;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct SegmentationConfig {
    #[serde(flatten)]
    pub common: core_config::Config,
    pub sessions: SessionConfig,
    pub segmenter: SegmenterConfig,
    pub worker: WorkerConfig,
    pub upload: UploadConfig,
    pub example: ExampleConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    pub root: PathBuf,
    /// Age after which a session is swept. Zero keeps sessions until exit.
    pub ttl_secs: u64,
    pub sweep_interval_secs: u64,
    pub cleanup_on_exit: bool,
}

impl SessionConfig {
    pub fn ttl(&self) -> Option<Duration> {
        (self.ttl_secs > 0).then(|| Duration::from_secs(self.ttl_secs))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SegmenterConfig {
    pub program: String,
    pub fast: bool,
    pub device: Option<String>,
    pub extra_args: Vec<String>,
    /// Zero disables the timeout.
    pub timeout_secs: u64,
}

impl SegmenterConfig {
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    pub worker_count: usize,
    pub queue_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    pub max_bytes: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExampleConfig {
    pub image_path: Option<PathBuf>,
}

impl SegmentationConfig {
    pub fn load() -> Result<Self, AppError> {
        // Load common config (handles .env and APP__ prefix)
        let common_config = core_config::Config::load()?;

        let is_prod = common_config.is_production();

        let default_root = env::temp_dir().join("totalsegmentator_api");
        let default_root = default_root.to_string_lossy();

        Ok(SegmentationConfig {
            common: common_config,
            sessions: SessionConfig {
                root: PathBuf::from(get_env("SESSION_ROOT", Some(&default_root), is_prod)?),
                ttl_secs: parse_env("SESSION_TTL_SECS", 0)?,
                sweep_interval_secs: parse_env("SESSION_SWEEP_INTERVAL_SECS", 300)?,
                cleanup_on_exit: parse_env("SESSION_CLEANUP_ON_EXIT", true)?,
            },
            segmenter: SegmenterConfig {
                program: get_env("SEGMENTER_PROGRAM", Some("TotalSegmentator"), is_prod)?,
                fast: parse_env("SEGMENTER_FAST", true)?,
                device: env::var("SEGMENTER_DEVICE").ok().filter(|d| !d.is_empty()),
                extra_args: env::var("SEGMENTER_EXTRA_ARGS")
                    .map(|args| args.split_whitespace().map(str::to_string).collect())
                    .unwrap_or_default(),
                timeout_secs: parse_env("SEGMENTER_TIMEOUT_SECS", 3600)?,
            },
            worker: WorkerConfig {
                worker_count: parse_env("WORKER_COUNT", 1usize)?.max(1),
                queue_size: parse_env("WORKER_QUEUE_SIZE", 8usize)?.max(1),
            },
            upload: UploadConfig {
                max_bytes: parse_env("MAX_UPLOAD_MB", 1024usize)?.saturating_mul(1024 * 1024),
            },
            example: ExampleConfig {
                image_path: Some(PathBuf::from(
                    env::var("EXAMPLE_IMAGE_PATH").unwrap_or_else(|_| "./mri.nii.gz".to_string()),
                ))
                .filter(|p| !p.as_os_str().is_empty()),
            },
        })
    }
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required in production but not set",
                    key
                ))))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required but not set",
                    key
                ))))
            }
        }
    }
}

fn parse_env<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(val) => val.trim().parse().map_err(|e: T::Err| {
            AppError::ConfigError(anyhow::anyhow!("Invalid value for {}: {}", key, e))
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_env_falls_back_to_default() {
        let value: u64 = parse_env("SEGMENTATION_TEST_UNSET_VARIABLE", 42).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn parse_env_rejects_garbage() {
        env::set_var("SEGMENTATION_TEST_GARBAGE_WORKERS", "many");
        let result: Result<usize, _> = parse_env("SEGMENTATION_TEST_GARBAGE_WORKERS", 1);
        assert!(matches!(result, Err(AppError::ConfigError(_))));
    }

    #[test]
    fn zero_durations_are_disabled() {
        let sessions = SessionConfig {
            root: PathBuf::from("sessions"),
            ttl_secs: 0,
            sweep_interval_secs: 0,
            cleanup_on_exit: false,
        };
        assert!(sessions.ttl().is_none());
        assert_eq!(sessions.sweep_interval(), Duration::from_secs(1));

        let segmenter = SegmenterConfig {
            program: "TotalSegmentator".into(),
            fast: true,
            device: None,
            extra_args: vec![],
            timeout_secs: 0,
        };
        assert!(segmenter.timeout().is_none());
    }
}

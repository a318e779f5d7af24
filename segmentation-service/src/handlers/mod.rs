pub mod download;
pub mod form;
pub mod health;
pub mod segmentation;

pub use download::download_segmentation;
pub use form::upload_form;
pub use health::{health_check, metrics_endpoint, readiness_check};
pub use segmentation::{segment_example, segment_image};

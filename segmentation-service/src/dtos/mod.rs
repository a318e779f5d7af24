pub mod segmentation;

pub use segmentation::{ResponseStatus, SegmentResponse};

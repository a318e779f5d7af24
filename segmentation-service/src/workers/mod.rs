mod executor;
mod orchestrator;
mod segmenter;

pub use executor::CommandExecutor;
pub use orchestrator::{JobQueue, SegmentationJob, WorkerOrchestrator};
pub use segmenter::{SegmentationRequest, Segmenter, TotalSegmentator};

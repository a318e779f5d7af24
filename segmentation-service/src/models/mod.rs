pub mod modality;
pub mod session;

pub use modality::Modality;
pub use session::{LabelMap, SegmentationResult, Session, SessionId, SessionStatus, ARTIFACT_NAME};

pub mod metrics;
pub mod session_store;
pub mod sweeper;

pub use metrics::{get_metrics, init_metrics};
pub use session_store::{LocalSessionStore, SessionStore};
pub use sweeper::SessionSweeper;

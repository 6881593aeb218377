pub mod config;
pub mod error;
pub mod metrics;
pub mod types;
pub mod util;

pub use config::SnatchConfig;
pub use error::{classify_service_error, SnatchError, SnatchResult};
pub use metrics::SnatchMetrics;
pub use types::{
    Profile, SnatchInstanceDetails, SnatchProgress, Task, TaskResult, TaskRow, TaskStatus,
    TaskType,
};

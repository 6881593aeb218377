pub mod action;
pub mod cloud_init;
pub mod engine;
pub mod quota;

pub use action::{action_task_name, ActionExecutor, InstanceAction, PowerOp};
pub use engine::{SnatchEngine, SnatchRun};
pub use quota::{check_micro_shape_quota, MICRO_SHAPE};

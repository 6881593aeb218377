use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SnatchResult;

/// Credentials and defaults for one cloud tenant, keyed by a user-chosen
/// alias. `private_key` is the literal PEM content, never a path: the
/// provider client writes it to a unique short-lived file when it needs one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub alias: String,
    pub tenancy_id: String,
    pub user_id: String,
    pub fingerprint: String,
    pub region: String,
    pub private_key: String,
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default)]
    pub default_ssh_public_key: Option<String>,
    /// Soft reference, healed transparently by NetworkBootstrapper if the
    /// subnet no longer exists or is not AVAILABLE.
    #[serde(default)]
    pub default_subnet_ocid: Option<String>,
    #[serde(default)]
    pub order_index: i64,
}

/// Lifecycle of a task row. See [`TaskStatus::can_transition_to`] for the
/// permitted sequences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Paused,
    Success,
    Failure,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failure)
    }

    /// Permitted sequences: `pending -> running -> (success|failure)`,
    /// `pending -> running -> paused -> running -> (success|failure)`,
    /// `running -> failure` (recovery-loop give-up). No other transition is
    /// valid; callers that hit `false` here have a bug, not a race.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Running)
                | (Running, Paused)
                | (Running, Success)
                | (Running, Failure)
                | (Paused, Running)
                | (Paused, Failure)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Snatch,
    Action,
    Create,
}

/// Launch parameters for one snatch attempt, carried in `SnatchProgress`
/// across retries and daemon restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnatchInstanceDetails {
    pub account_alias: String,
    pub shape: String,
    pub ocpus: f64,
    pub memory_in_gbs: f64,
    pub os_name: String,
    pub os_version: String,
    #[serde(default)]
    pub ad: Option<String>,
    #[serde(default = "default_boot_volume_size")]
    pub boot_volume_size: u64,
    pub display_name_prefix: String,
    pub min_delay: u64,
    pub max_delay: u64,
    #[serde(default)]
    pub auto_bind_domain: bool,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub startup_script: Option<String>,
    #[serde(default)]
    pub instance_password: Option<String>,
}

fn default_boot_volume_size() -> u64 {
    50
}

/// JSON shape encoded into `Task.result` while `status in {running, paused}`.
/// `run_id` is the only authority on which executor is currently live for
/// this row: any worker whose in-memory run_id disagrees with the persisted
/// one must exit without writing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnatchProgress {
    pub run_id: String,
    pub start_time: DateTime<Utc>,
    pub attempt_count: u64,
    pub last_message: String,
    pub details: SnatchInstanceDetails,
}

/// The task row's `result` column is heterogeneous: most task types store a
/// plain message, the snatch loop stores a structured progress snapshot
/// while running/paused and a plain message once terminal. Encode/decode at
/// the registry edge so SnatchEngine and ActionExecutor work with typed
/// values while the on-disk column stays a single string column.
#[derive(Debug, Clone)]
pub enum TaskResult {
    Message(String),
    Progress(SnatchProgress),
}

impl TaskResult {
    pub fn encode(&self) -> SnatchResult<String> {
        let value = match self {
            TaskResult::Message(msg) => serde_json::json!({ "message": msg }),
            TaskResult::Progress(progress) => serde_json::to_value(progress)
                .map_err(|e| crate::error::SnatchError::Data(e.to_string()))?,
        };
        serde_json::to_string(&value).map_err(|e| crate::error::SnatchError::Data(e.to_string()))
    }

    pub fn decode(raw: &str) -> SnatchResult<TaskResult> {
        let value: serde_json::Value = serde_json::from_str(raw)
            .map_err(|e| crate::error::SnatchError::Data(e.to_string()))?;
        if value.get("run_id").is_some() && value.get("details").is_some() {
            let progress: SnatchProgress = serde_json::from_value(value)
                .map_err(|e| crate::error::SnatchError::Data(e.to_string()))?;
            Ok(TaskResult::Progress(progress))
        } else {
            let message = value
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            Ok(TaskResult::Message(message))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub name: String,
    pub status: TaskStatus,
    pub result: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub account_alias: String,
}

/// Narrow handle the engine and action executor are given at construction
/// instead of the full registry module, so the retry loop can be tested
/// against a fake without pulling in SQLite. Inverts the cyclic
/// engine/registry ownership: the engine never imports `snatch-registry`.
#[async_trait]
pub trait TaskRow: Send + Sync {
    async fn load(&self, task_id: &str) -> SnatchResult<Option<Task>>;

    /// Unconditional state transition; writes `completed_at` when `status`
    /// is terminal. Callers are responsible for only calling this with a
    /// transition permitted by [`TaskStatus::can_transition_to`].
    async fn transition(
        &self,
        task_id: &str,
        status: TaskStatus,
        result: Option<TaskResult>,
    ) -> SnatchResult<()>;

    /// Sets `result` without touching `status` or `completed_at`. Used for
    /// the mid-loop progress updates that must not imply a state change.
    async fn update_progress(&self, task_id: &str, result: TaskResult) -> SnatchResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_table_matches_monotonicity_property() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Running));
        assert!(Running.can_transition_to(Success));
        assert!(Running.can_transition_to(Failure));
        assert!(Paused.can_transition_to(Failure));
        assert!(!Pending.can_transition_to(Success));
        assert!(!Success.can_transition_to(Running));
        assert!(!Failure.can_transition_to(Running));
        assert!(!Pending.can_transition_to(Paused));
    }

    #[test]
    fn task_result_roundtrips_message() {
        let original = TaskResult::Message("done".to_string());
        let encoded = original.encode().unwrap();
        match TaskResult::decode(&encoded).unwrap() {
            TaskResult::Message(m) => assert_eq!(m, "done"),
            TaskResult::Progress(_) => panic!("expected message"),
        }
    }

    #[test]
    fn task_result_roundtrips_progress() {
        let progress = SnatchProgress {
            run_id: "r1".to_string(),
            start_time: Utc::now(),
            attempt_count: 3,
            last_message: "retrying".to_string(),
            details: SnatchInstanceDetails {
                account_alias: "acct".to_string(),
                shape: "VM.Standard.E2.1.Micro".to_string(),
                ocpus: 1.0,
                memory_in_gbs: 1.0,
                os_name: "Canonical Ubuntu".to_string(),
                os_version: "22.04".to_string(),
                ad: Some("AD-2".to_string()),
                boot_volume_size: 50,
                display_name_prefix: "snatch".to_string(),
                min_delay: 30,
                max_delay: 60,
                auto_bind_domain: false,
                domain: None,
                startup_script: None,
                instance_password: None,
            },
        };
        let original = TaskResult::Progress(progress);
        let encoded = original.encode().unwrap();
        match TaskResult::decode(&encoded).unwrap() {
            TaskResult::Progress(p) => {
                assert_eq!(p.attempt_count, 3);
                assert_eq!(p.details.ad.as_deref(), Some("AD-2"));
            }
            TaskResult::Message(_) => panic!("expected progress"),
        }
    }
}

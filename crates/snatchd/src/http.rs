//! The REST surface: profile/session management, instance listing, snatch
//! launches, instance actions, task inspection, and the three singleton
//! config files. Authentication is a single `Authorization: Bearer
//! <panel_api_key>` check against `config.daemon.api_key`; when no api_key
//! is configured the surface is open (local/dev use).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::extract::{Path as AxPath, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use snatch_core::config::SnatchConfig;
use snatch_core::{SnatchError, SnatchInstanceDetails, SnatchProgress, Task, TaskResult, TaskType};
use snatch_engine::{
    action_task_name, check_micro_shape_quota, ActionExecutor, InstanceAction, PowerOp,
    SnatchEngine, SnatchRun, MICRO_SHAPE,
};
use snatch_notify::{CloudflareConfig, NotificationSink, TelegramConfig};
use snatch_profiles::{ProfilePatch, ProfileStore};
use snatch_provider::ProviderClientBundle;
use snatch_registry::TaskRegistry;

use crate::instances;
use crate::metrics::SnatchMetrics;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<SnatchConfig>,
    pub profiles: Arc<ProfileStore>,
    pub registry: Arc<TaskRegistry>,
    pub notify: Arc<NotificationSink>,
    pub metrics: Arc<SnatchMetrics>,
}

pub fn router(state: AppState) -> Router {
    let api_key = state.config.daemon.api_key.clone();
    Router::new()
        .route("/status", get(status))
        .route("/profiles", get(list_profiles).post(upsert_profile))
        .route("/profiles/order", post(set_profile_order))
        .route("/profiles/:alias", get(get_profile).delete(delete_profile))
        .route("/session", post(create_session))
        .route("/instances", get(list_instances_via_session))
        .route("/:alias/instances", get(list_instances_for_alias))
        .route("/:alias/instance-action", post(instance_action))
        .route("/:alias/launch-instance", post(launch_instance))
        .route("/tasks/snatching/running", get(list_running_snatch))
        .route("/tasks/snatching/completed", get(list_completed_snatch))
        .route("/task_status/:id", get(task_status))
        .route("/tasks/:id/stop", post(stop_task))
        .route("/tasks/resume", post(resume_tasks))
        .route("/tasks/:id", delete(delete_task))
        .route("/tg-config", get(get_tg_config).post(set_tg_config))
        .route("/cloudflare-config", get(get_cloudflare_config).post(set_cloudflare_config))
        .route("/default-ssh-key", get(get_default_ssh_key).post(set_default_ssh_key))
        .route_layer(middleware::from_fn_with_state(api_key, require_api_key))
        .with_state(state)
}

async fn require_api_key(
    State(api_key): State<Option<String>>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    let Some(expected) = api_key else {
        return next.run(request).await;
    };
    let provided = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if provided == Some(expected.as_str()) {
        next.run(request).await
    } else {
        ApiError(SnatchError::Auth("invalid or missing panel API key".to_string())).into_response()
    }
}

struct ApiError(SnatchError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

impl From<SnatchError> for ApiError {
    fn from(e: SnatchError) -> ApiError {
        ApiError(e)
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn require_profile(profiles: &ProfileStore, alias: &str) -> ApiResult<snatch_core::Profile> {
    profiles
        .get(alias)?
        .ok_or_else(|| ApiError(SnatchError::Validation(format!("unknown alias: {alias}"))))
}

/// Plain API sanity check, distinct from the Prometheus `/healthz` served
/// on the metrics port: confirms the HTTP surface itself is answering.
async fn status() -> Json<Value> {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

// ── Profiles ────────────────────────────────────────────────────────────

async fn list_profiles(State(state): State<AppState>) -> ApiResult<Json<Vec<String>>> {
    Ok(Json(state.profiles.list()?))
}

#[derive(Deserialize)]
struct UpsertProfileBody {
    alias: String,
    profile_data: ProfilePatch,
}

async fn upsert_profile(
    State(state): State<AppState>,
    Json(body): Json<UpsertProfileBody>,
) -> ApiResult<Json<Value>> {
    state.profiles.upsert(&body.alias, body.profile_data)?;
    Ok(Json(json!({ "success": true, "alias": body.alias })))
}

async fn get_profile(
    State(state): State<AppState>,
    AxPath(alias): AxPath<String>,
) -> ApiResult<Json<snatch_core::Profile>> {
    Ok(Json(require_profile(&state.profiles, &alias)?))
}

async fn delete_profile(State(state): State<AppState>, AxPath(alias): AxPath<String>) -> ApiResult<Json<Value>> {
    state.profiles.delete(&alias)?;
    Ok(Json(json!({ "success": true })))
}

#[derive(Deserialize)]
struct OrderBody {
    order: Vec<String>,
}

async fn set_profile_order(State(state): State<AppState>, Json(body): Json<OrderBody>) -> ApiResult<Json<Value>> {
    state.profiles.set_order(body.order)?;
    Ok(Json(json!({ "success": true })))
}

// ── Session ─────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct SessionBody {
    alias: String,
}

/// Validates credentials against the provider and hands back the alias for
/// the client to echo on subsequent session-scoped calls (`X-Snatch-Alias`
/// header), since this daemon exposes no browser-facing cookie jar of its
/// own — the panel in front of it is expected to own cookie sessions and
/// pass the validated alias through.
async fn create_session(State(state): State<AppState>, Json(body): Json<SessionBody>) -> ApiResult<Json<Value>> {
    let profile = require_profile(&state.profiles, &body.alias)?;
    ProviderClientBundle::build(&profile, true).await?;
    Ok(Json(json!({ "success": true, "alias": body.alias })))
}

async fn list_instances_via_session(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<instances::InstanceView>>> {
    let alias = headers
        .get("x-snatch-alias")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError(SnatchError::Validation("missing X-Snatch-Alias header".to_string())))?
        .to_string();
    list_instances_for_alias(State(state), AxPath(alias)).await
}

async fn list_instances_for_alias(
    State(state): State<AppState>,
    AxPath(alias): AxPath<String>,
) -> ApiResult<Json<Vec<instances::InstanceView>>> {
    let profile = require_profile(&state.profiles, &alias)?;
    let clients = ProviderClientBundle::build(&profile, false).await?;
    let views = instances::list_instances(&clients, &profile.tenancy_id).await?;
    Ok(Json(views))
}

// ── Instance actions ────────────────────────────────────────────────────

#[derive(Deserialize)]
struct InstanceActionBody {
    action: String,
    instance_id: String,
    #[serde(default)]
    new_name: Option<String>,
    #[serde(default)]
    new_shape: Option<String>,
    #[serde(default)]
    ocpus: Option<f64>,
    #[serde(default)]
    memory_in_gbs: Option<f64>,
    #[serde(default)]
    boot_volume_id: Option<String>,
    #[serde(default)]
    new_size_gbs: Option<u64>,
    #[serde(default)]
    from_web: bool,
}

fn parse_action(body: &InstanceActionBody, compartment_id: &str) -> ApiResult<InstanceAction> {
    let action = match body.action.as_str() {
        "start" => InstanceAction::Power(PowerOp::Start),
        "stop" => InstanceAction::Power(PowerOp::Stop),
        "restart" => InstanceAction::Power(PowerOp::Restart),
        "terminate" => InstanceAction::Terminate,
        "changeip" => InstanceAction::ChangePublicIp {
            compartment_id: compartment_id.to_string(),
        },
        "assignipv6" => InstanceAction::AssignIpv6,
        "rename" => InstanceAction::Rename {
            new_name: body
                .new_name
                .clone()
                .ok_or_else(|| ApiError(SnatchError::Validation("rename requires new_name".to_string())))?,
        },
        "reshape" => InstanceAction::Reshape {
            new_shape: body
                .new_shape
                .clone()
                .ok_or_else(|| ApiError(SnatchError::Validation("reshape requires new_shape".to_string())))?,
            ocpus: body.ocpus,
            memory_in_gbs: body.memory_in_gbs,
        },
        "resizebootvolume" => InstanceAction::ResizeBootVolume {
            boot_volume_id: body.boot_volume_id.clone().ok_or_else(|| {
                ApiError(SnatchError::Validation("resizebootvolume requires boot_volume_id".to_string()))
            })?,
            new_size_gbs: body.new_size_gbs.ok_or_else(|| {
                ApiError(SnatchError::Validation("resizebootvolume requires new_size_gbs".to_string()))
            })?,
        },
        other => return Err(ApiError(SnatchError::Validation(format!("unknown action: {other}")))),
    };
    Ok(action)
}

async fn instance_action(
    State(state): State<AppState>,
    AxPath(alias): AxPath<String>,
    Json(body): Json<InstanceActionBody>,
) -> ApiResult<Json<Value>> {
    let profile = require_profile(&state.profiles, &alias)?;
    let compartment_id = profile.tenancy_id.clone();
    let action = parse_action(&body, &compartment_id)?;

    let task_name = action_task_name(&action, &body.instance_id);
    let task_id = state.registry.create(TaskType::Action, &task_name, &alias).await?;
    state.registry.set_running(&task_id, None).await?;

    let clients = ProviderClientBundle::build(&profile, false).await?;
    let notify = NotificationSink::new();
    let telegram = load_telegram_config(&state.config);
    let cloudflare = load_cloudflare_config(&state.config);
    let domain = profile.alias.clone();
    let registry = state.registry.clone();
    let from_web = body.from_web;
    let response_task_id = task_id.clone();

    tokio::spawn(async move {
        let executor = ActionExecutor::new(clients, compartment_id, notify);
        executor
            .run(
                registry.as_ref(),
                &task_id,
                &body.instance_id,
                action,
                telegram.as_ref(),
                cloudflare.as_ref(),
                Some(&domain),
                from_web,
            )
            .await;
    });

    Ok(Json(json!({ "task_id": response_task_id })))
}

// ── Launch ──────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct LaunchInstanceBody {
    #[serde(flatten)]
    details: SnatchInstanceDetails,
    #[serde(default = "default_instance_count")]
    instance_count: u32,
}

fn default_instance_count() -> u32 {
    1
}

async fn launch_instance(
    State(state): State<AppState>,
    AxPath(alias): AxPath<String>,
    Json(body): Json<LaunchInstanceBody>,
) -> ApiResult<Json<Value>> {
    let profile = require_profile(&state.profiles, &alias)?;

    if body.details.shape == MICRO_SHAPE {
        let clients = ProviderClientBundle::build(&profile, false).await?;
        if let Err(e) =
            check_micro_shape_quota(&clients.compute, &profile.tenancy_id, body.instance_count, state.config.engine.micro_shape_quota)
                .await
        {
            state.metrics.quota_refusals_total.inc();
            return Err(e.into());
        }
    }

    let telegram = load_telegram_config(&state.config);
    let cloudflare = load_cloudflare_config(&state.config);

    let mut task_ids = Vec::with_capacity(body.instance_count as usize);
    for _ in 0..body.instance_count {
        let task_id = state
            .registry
            .create(TaskType::Snatch, &format!("snatch {}", body.details.display_name_prefix), &alias)
            .await?;

        let progress = SnatchProgress {
            run_id: Uuid::new_v4().to_string(),
            start_time: Utc::now(),
            attempt_count: 0,
            last_message: String::new(),
            details: body.details.clone(),
        };

        let run = SnatchRun {
            task_id: task_id.clone(),
            profile: profile.clone(),
            progress,
            telegram: telegram.clone(),
            cloudflare: cloudflare.clone(),
        };

        let engine = SnatchEngine::new(
            state.registry.clone(),
            state.profiles.clone(),
            state.notify.clone(),
            state.config.engine.clone(),
            state.metrics.clone(),
        );
        tokio::spawn(async move {
            engine.run(run).await;
        });

        task_ids.push(task_id);
    }

    Ok(Json(json!({ "task_ids": task_ids })))
}

// ── Tasks ───────────────────────────────────────────────────────────────

async fn list_running_snatch(State(state): State<AppState>) -> ApiResult<Json<Vec<Task>>> {
    Ok(Json(state.registry.list_running_snatch().await?))
}

#[derive(Deserialize)]
struct LimitQuery {
    limit: Option<i64>,
}

async fn list_completed_snatch(State(state): State<AppState>, Query(q): Query<LimitQuery>) -> ApiResult<Json<Vec<Task>>> {
    Ok(Json(state.registry.list_completed_snatch(q.limit.unwrap_or(50)).await?))
}

#[derive(Serialize)]
struct TaskStatusView {
    status: snatch_core::TaskStatus,
    result: Option<String>,
    #[serde(rename = "type")]
    task_type: TaskType,
}

async fn task_status(State(state): State<AppState>, AxPath(id): AxPath<String>) -> ApiResult<Json<TaskStatusView>> {
    let task = state
        .registry
        .get(&id)
        .await?
        .ok_or_else(|| ApiError(SnatchError::Validation(format!("unknown task: {id}"))))?;
    Ok(Json(TaskStatusView {
        status: task.status,
        result: task.result,
        task_type: task.task_type,
    }))
}

/// Pauses a running snatch: rewrites `last_message` and clears `run_id` so
/// the owning worker's next ownership check fails and it exits without
/// mutating further state.
async fn stop_task(State(state): State<AppState>, AxPath(id): AxPath<String>) -> ApiResult<Json<Value>> {
    let task = state
        .registry
        .get(&id)
        .await?
        .ok_or_else(|| ApiError(SnatchError::Validation(format!("unknown task: {id}"))))?;
    let raw = task
        .result
        .as_deref()
        .ok_or_else(|| ApiError(SnatchError::Validation("task has no progress to pause".to_string())))?;
    let mut progress = match TaskResult::decode(raw)? {
        TaskResult::Progress(p) => p,
        TaskResult::Message(_) => {
            return Err(ApiError(SnatchError::Validation("task is not a running snatch".to_string())))
        }
    };
    progress.run_id = String::new();
    progress.last_message = "stopped by user".to_string();
    state.registry.set_paused(&id, Some(TaskResult::Progress(progress))).await?;
    Ok(Json(json!({ "success": true })))
}

#[derive(Deserialize)]
struct ResumeBody {
    task_ids: Vec<String>,
}

async fn resume_tasks(State(state): State<AppState>, Json(body): Json<ResumeBody>) -> ApiResult<Json<Value>> {
    let mut resumed = Vec::new();
    for id in body.task_ids {
        let Some(task) = state.registry.get(&id).await? else { continue };
        if task.status != snatch_core::TaskStatus::Paused {
            continue;
        }
        let Some(raw) = &task.result else { continue };
        let TaskResult::Progress(mut progress) = TaskResult::decode(raw)? else { continue };
        let Some(profile) = state.profiles.get(&task.account_alias)? else { continue };

        progress.run_id = Uuid::new_v4().to_string();
        state.registry.set_running(&id, Some(TaskResult::Progress(progress.clone()))).await?;

        let telegram = load_telegram_config(&state.config);
        let cloudflare = load_cloudflare_config(&state.config);
        let run = SnatchRun {
            task_id: id.clone(),
            profile,
            progress,
            telegram,
            cloudflare,
        };
        let engine = SnatchEngine::new(
            state.registry.clone(),
            state.profiles.clone(),
            state.notify.clone(),
            state.config.engine.clone(),
            state.metrics.clone(),
        );
        tokio::spawn(async move {
            engine.run(run).await;
        });
        resumed.push(id);
    }
    Ok(Json(json!({ "resumed": resumed })))
}

async fn delete_task(State(state): State<AppState>, AxPath(id): AxPath<String>) -> ApiResult<Json<Value>> {
    state.registry.delete(&id).await?;
    Ok(Json(json!({ "success": true })))
}

// ── Singleton config files ──────────────────────────────────────────────

fn read_json_file(path: &Path) -> ApiResult<Option<Value>> {
    match std::fs::read_to_string(path) {
        Ok(contents) => {
            let value = serde_json::from_str(&contents).map_err(|e| ApiError(SnatchError::Data(e.to_string())))?;
            Ok(Some(value))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(ApiError(SnatchError::Io(e))),
    }
}

fn write_json_file(path: &Path, value: &Value) -> ApiResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(SnatchError::Io)?;
    }
    let serialized = serde_json::to_string_pretty(value).map_err(|e| ApiError(SnatchError::Data(e.to_string())))?;
    std::fs::write(path, serialized).map_err(|e| ApiError(SnatchError::Io(e)))?;
    Ok(())
}

fn load_telegram_config(config: &SnatchConfig) -> Option<TelegramConfig> {
    let path = config.notify.telegram_config_path.as_ref()?;
    let value = read_json_file(path).ok()??;
    serde_json::from_value(value).ok()
}

fn load_cloudflare_config(config: &SnatchConfig) -> Option<CloudflareConfig> {
    let path = config.notify.cloudflare_config_path.as_ref()?;
    let value = read_json_file(path).ok()??;
    serde_json::from_value(value).ok()
}

fn tg_config_path(config: &SnatchConfig) -> ApiResult<PathBuf> {
    config
        .notify
        .telegram_config_path
        .clone()
        .ok_or_else(|| ApiError(SnatchError::Validation("telegram_config_path not configured".to_string())))
}

fn cloudflare_config_path(config: &SnatchConfig) -> ApiResult<PathBuf> {
    config
        .notify
        .cloudflare_config_path
        .clone()
        .ok_or_else(|| ApiError(SnatchError::Validation("cloudflare_config_path not configured".to_string())))
}

async fn get_tg_config(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let path = tg_config_path(&state.config)?;
    Ok(Json(read_json_file(&path)?.unwrap_or(Value::Null)))
}

async fn set_tg_config(State(state): State<AppState>, Json(body): Json<Value>) -> ApiResult<Json<Value>> {
    let path = tg_config_path(&state.config)?;
    write_json_file(&path, &body)?;
    Ok(Json(json!({ "success": true })))
}

async fn get_cloudflare_config(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let path = cloudflare_config_path(&state.config)?;
    Ok(Json(read_json_file(&path)?.unwrap_or(Value::Null)))
}

async fn set_cloudflare_config(State(state): State<AppState>, Json(body): Json<Value>) -> ApiResult<Json<Value>> {
    let path = cloudflare_config_path(&state.config)?;
    write_json_file(&path, &body)?;
    Ok(Json(json!({ "success": true })))
}

fn default_ssh_key_path(config: &SnatchConfig) -> ApiResult<PathBuf> {
    config
        .profiles
        .default_ssh_key_path
        .clone()
        .ok_or_else(|| ApiError(SnatchError::Validation("default_ssh_key_path not configured".to_string())))
}

async fn get_default_ssh_key(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let path = default_ssh_key_path(&state.config)?;
    Ok(Json(read_json_file(&path)?.unwrap_or(Value::Null)))
}

#[derive(Deserialize)]
struct DefaultSshKeyBody {
    key: String,
}

async fn set_default_ssh_key(State(state): State<AppState>, Json(body): Json<DefaultSshKeyBody>) -> ApiResult<Json<Value>> {
    let path = default_ssh_key_path(&state.config)?;
    snatch_profiles::write_default_ssh_key(&path, &body.key)?;
    Ok(Json(json!({ "success": true })))
}

impl From<std::io::Error> for ApiError {
    fn from(e: std::io::Error) -> ApiError {
        ApiError(SnatchError::Io(e))
    }
}

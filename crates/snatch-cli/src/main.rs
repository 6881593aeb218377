//! snatch: command-line client for snatchd
//!
//! Talks to the daemon's REST surface over HTTP (the daemon has no Unix
//! socket or gRPC endpoint; everything goes through `--daemon-url`).

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::{json, Value};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "snatch", version, about = "OCI instance-snatching CLI")]
struct Cli {
    /// Base URL of the snatchd daemon
    #[arg(long, env = "SNATCH_DAEMON_URL", default_value = "http://127.0.0.1:8080")]
    daemon_url: String,

    /// Panel API key (sent as `Authorization: Bearer`)
    #[arg(long, env = "SNATCH_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage cloud-tenant profiles
    Profile {
        #[command(subcommand)]
        action: ProfileAction,
    },

    /// Validate a profile's credentials against the provider
    Session {
        /// Profile alias
        alias: String,
    },

    /// List non-terminated instances for a profile
    Instances {
        /// Profile alias
        alias: String,
    },

    /// Launch one or more instances under the Always Free snatch loop
    Launch {
        /// Profile alias
        alias: String,
        /// Instance shape (e.g. VM.Standard.A1.Flex, VM.Standard.E2.1.Micro)
        #[arg(long)]
        shape: String,
        /// OCPUs to request (Micro shape ignores this)
        #[arg(long, default_value_t = 1.0)]
        ocpus: f64,
        /// Memory in GBs to request (Micro shape ignores this)
        #[arg(long, default_value_t = 1.0)]
        memory_in_gbs: f64,
        /// Image OS name (e.g. "Canonical Ubuntu")
        #[arg(long, default_value = "Canonical Ubuntu")]
        os_name: String,
        /// Image OS version (e.g. "22.04")
        #[arg(long, default_value = "22.04")]
        os_version: String,
        /// Boot volume size in GBs
        #[arg(long, default_value_t = 50)]
        boot_volume_size: u64,
        /// Prefix used to name launched instances
        #[arg(long, default_value = "snatch")]
        display_name_prefix: String,
        /// Minimum seconds between retries
        #[arg(long, default_value_t = 30)]
        min_delay: u64,
        /// Maximum seconds between retries
        #[arg(long, default_value_t = 60)]
        max_delay: u64,
        /// Number of instances to launch
        #[arg(long, default_value_t = 1)]
        count: u32,
    },

    /// One-shot instance actions
    Action {
        #[command(subcommand)]
        action: InstanceActionArg,
    },

    /// Task inspection and control
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },

    /// Telegram notification config
    #[command(name = "tg-config")]
    TgConfig {
        #[command(subcommand)]
        action: ConfigFileAction,
    },

    /// Cloudflare DNS config
    #[command(name = "cloudflare-config")]
    CloudflareConfig {
        #[command(subcommand)]
        action: ConfigFileAction,
    },
}

#[derive(Subcommand, Debug)]
enum ProfileAction {
    /// List profile aliases
    List,
    /// Add or update a profile
    Upsert {
        alias: String,
        #[arg(long)]
        tenancy_id: Option<String>,
        #[arg(long)]
        user_id: Option<String>,
        #[arg(long)]
        fingerprint: Option<String>,
        #[arg(long)]
        region: Option<String>,
        /// Path to a PEM-encoded private key file
        #[arg(long)]
        private_key_file: Option<std::path::PathBuf>,
        #[arg(long)]
        proxy: Option<String>,
    },
    /// Show one profile
    Show { alias: String },
    /// Delete a profile
    Delete { alias: String },
    /// Set the display order of profiles
    Reorder { aliases: Vec<String> },
}

#[derive(Subcommand, Debug)]
enum InstanceActionArg {
    Start { alias: String, instance_id: String },
    Stop { alias: String, instance_id: String },
    Restart { alias: String, instance_id: String },
    Terminate { alias: String, instance_id: String },
    ChangeIp { alias: String, instance_id: String },
    AssignIpv6 { alias: String, instance_id: String },
    Rename { alias: String, instance_id: String, new_name: String },
    Reshape {
        alias: String,
        instance_id: String,
        new_shape: String,
        #[arg(long)]
        ocpus: Option<f64>,
        #[arg(long)]
        memory_in_gbs: Option<f64>,
    },
    ResizeBootVolume {
        alias: String,
        instance_id: String,
        boot_volume_id: String,
        new_size_gbs: u64,
    },
}

#[derive(Subcommand, Debug)]
enum TaskAction {
    /// List currently running snatch tasks
    Running,
    /// List completed snatch tasks
    Completed {
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    /// Show one task's status
    Status { id: String },
    /// Pause a running snatch task
    Stop { id: String },
    /// Resume one or more paused snatch tasks
    Resume { ids: Vec<String> },
    /// Delete a terminal or paused task
    Delete { id: String },
}

#[derive(Subcommand, Debug)]
enum ConfigFileAction {
    /// Print the current config
    Show,
    /// Replace the config from a JSON file
    Set { path: std::path::PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let cli = Cli::parse();
    let client = DaemonClient::new(cli.daemon_url, cli.api_key)?;

    match cli.command {
        Commands::Profile { action } => cmd_profile(&client, action).await,
        Commands::Session { alias } => cmd_session(&client, &alias).await,
        Commands::Instances { alias } => cmd_instances(&client, &alias).await,
        Commands::Launch {
            alias,
            shape,
            ocpus,
            memory_in_gbs,
            os_name,
            os_version,
            boot_volume_size,
            display_name_prefix,
            min_delay,
            max_delay,
            count,
        } => {
            cmd_launch(
                &client,
                &alias,
                shape,
                ocpus,
                memory_in_gbs,
                os_name,
                os_version,
                boot_volume_size,
                display_name_prefix,
                min_delay,
                max_delay,
                count,
            )
            .await
        }
        Commands::Action { action } => cmd_action(&client, action).await,
        Commands::Task { action } => cmd_task(&client, action).await,
        Commands::TgConfig { action } => cmd_config_file(&client, "/tg-config", action).await,
        Commands::CloudflareConfig { action } => cmd_config_file(&client, "/cloudflare-config", action).await,
    }
}

// ── Daemon HTTP client ──────────────────────────────────────────────────

struct DaemonClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl DaemonClient {
    fn new(base_url: String, api_key: Option<String>) -> Result<DaemonClient> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("building HTTP client")?;
        Ok(DaemonClient { http, base_url, api_key })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{path}", self.base_url);
        let mut req = self.http.request(method, url);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        req
    }

    async fn get(&self, path: &str) -> Result<Value> {
        let resp = self.request(reqwest::Method::GET, path).send().await?;
        Self::handle(resp).await
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value> {
        let resp = self.request(reqwest::Method::POST, path).json(body).send().await?;
        Self::handle(resp).await
    }

    async fn delete(&self, path: &str) -> Result<Value> {
        let resp = self.request(reqwest::Method::DELETE, path).send().await?;
        Self::handle(resp).await
    }

    async fn handle(resp: reqwest::Response) -> Result<Value> {
        let status = resp.status();
        let body: Value = resp.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            let message = body.get("error").and_then(|v| v.as_str()).unwrap_or("request failed");
            bail!("{status}: {message}");
        }
        Ok(body)
    }
}

fn spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::with_template("{spinner} {msg}").unwrap());
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

fn print_json(value: &Value) {
    println!("{}", serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string()));
}

// ── Profiles ────────────────────────────────────────────────────────────

async fn cmd_profile(client: &DaemonClient, action: ProfileAction) -> Result<()> {
    match action {
        ProfileAction::List => {
            let aliases = client.get("/profiles").await?;
            print_json(&aliases);
        }
        ProfileAction::Upsert {
            alias,
            tenancy_id,
            user_id,
            fingerprint,
            region,
            private_key_file,
            proxy,
        } => {
            let private_key = match private_key_file {
                Some(path) => Some(std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?),
                None => None,
            };
            let body = json!({
                "alias": alias,
                "profile_data": {
                    "tenancy_id": tenancy_id,
                    "user_id": user_id,
                    "fingerprint": fingerprint,
                    "region": region,
                    "private_key": private_key,
                    "proxy": proxy,
                }
            });
            let result = client.post("/profiles", &body).await?;
            print_json(&result);
        }
        ProfileAction::Show { alias } => {
            let profile = client.get(&format!("/profiles/{alias}")).await?;
            print_json(&profile);
        }
        ProfileAction::Delete { alias } => {
            let result = client.delete(&format!("/profiles/{alias}")).await?;
            print_json(&result);
        }
        ProfileAction::Reorder { aliases } => {
            let result = client.post("/profiles/order", &json!({ "order": aliases })).await?;
            print_json(&result);
        }
    }
    Ok(())
}

async fn cmd_session(client: &DaemonClient, alias: &str) -> Result<()> {
    let pb = spinner(&format!("validating credentials for {alias}"));
    let result = client.post("/session", &json!({ "alias": alias })).await;
    pb.finish_and_clear();
    print_json(&result?);
    Ok(())
}

async fn cmd_instances(client: &DaemonClient, alias: &str) -> Result<()> {
    let instances = client.get(&format!("/{alias}/instances")).await?;
    print_json(&instances);
    Ok(())
}

// ── Launch ──────────────────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
async fn cmd_launch(
    client: &DaemonClient,
    alias: &str,
    shape: String,
    ocpus: f64,
    memory_in_gbs: f64,
    os_name: String,
    os_version: String,
    boot_volume_size: u64,
    display_name_prefix: String,
    min_delay: u64,
    max_delay: u64,
    count: u32,
) -> Result<()> {
    let body = json!({
        "account_alias": alias,
        "shape": shape,
        "ocpus": ocpus,
        "memory_in_gbs": memory_in_gbs,
        "os_name": os_name,
        "os_version": os_version,
        "boot_volume_size": boot_volume_size,
        "display_name_prefix": display_name_prefix,
        "min_delay": min_delay,
        "max_delay": max_delay,
        "instance_count": count,
    });
    let result = client.post(&format!("/{alias}/launch-instance"), &body).await?;
    print_json(&result);
    Ok(())
}

// ── Actions ─────────────────────────────────────────────────────────────

async fn cmd_action(client: &DaemonClient, action: InstanceActionArg) -> Result<()> {
    let (alias, body) = match action {
        InstanceActionArg::Start { alias, instance_id } => (alias, json!({ "action": "start", "instance_id": instance_id })),
        InstanceActionArg::Stop { alias, instance_id } => (alias, json!({ "action": "stop", "instance_id": instance_id })),
        InstanceActionArg::Restart { alias, instance_id } => (alias, json!({ "action": "restart", "instance_id": instance_id })),
        InstanceActionArg::Terminate { alias, instance_id } => {
            (alias, json!({ "action": "terminate", "instance_id": instance_id }))
        }
        InstanceActionArg::ChangeIp { alias, instance_id } => {
            (alias, json!({ "action": "changeip", "instance_id": instance_id }))
        }
        InstanceActionArg::AssignIpv6 { alias, instance_id } => {
            (alias, json!({ "action": "assignipv6", "instance_id": instance_id }))
        }
        InstanceActionArg::Rename { alias, instance_id, new_name } => (
            alias,
            json!({ "action": "rename", "instance_id": instance_id, "new_name": new_name }),
        ),
        InstanceActionArg::Reshape {
            alias,
            instance_id,
            new_shape,
            ocpus,
            memory_in_gbs,
        } => (
            alias,
            json!({
                "action": "reshape",
                "instance_id": instance_id,
                "new_shape": new_shape,
                "ocpus": ocpus,
                "memory_in_gbs": memory_in_gbs,
            }),
        ),
        InstanceActionArg::ResizeBootVolume {
            alias,
            instance_id,
            boot_volume_id,
            new_size_gbs,
        } => (
            alias,
            json!({
                "action": "resizebootvolume",
                "instance_id": instance_id,
                "boot_volume_id": boot_volume_id,
                "new_size_gbs": new_size_gbs,
            }),
        ),
    };
    let result = client.post(&format!("/{alias}/instance-action"), &body).await?;
    print_json(&result);
    Ok(())
}

// ── Tasks ───────────────────────────────────────────────────────────────

async fn cmd_task(client: &DaemonClient, action: TaskAction) -> Result<()> {
    match action {
        TaskAction::Running => print_json(&client.get("/tasks/snatching/running").await?),
        TaskAction::Completed { limit } => {
            print_json(&client.get(&format!("/tasks/snatching/completed?limit={limit}")).await?)
        }
        TaskAction::Status { id } => print_json(&client.get(&format!("/task_status/{id}")).await?),
        TaskAction::Stop { id } => print_json(&client.post(&format!("/tasks/{id}/stop"), &json!({})).await?),
        TaskAction::Resume { ids } => print_json(&client.post("/tasks/resume", &json!({ "task_ids": ids })).await?),
        TaskAction::Delete { id } => print_json(&client.delete(&format!("/tasks/{id}")).await?),
    }
    Ok(())
}

// ── Singleton config files ──────────────────────────────────────────────

async fn cmd_config_file(client: &DaemonClient, path: &str, action: ConfigFileAction) -> Result<()> {
    match action {
        ConfigFileAction::Show => print_json(&client.get(path).await?),
        ConfigFileAction::Set { path: file } => {
            let contents = std::fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
            let value: Value = serde_json::from_str(&contents).with_context(|| format!("parsing {}", file.display()))?;
            print_json(&client.post(path, &value).await?);
        }
    }
    Ok(())
}

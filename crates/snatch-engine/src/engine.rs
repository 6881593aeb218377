use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use serde_json::json;
use snatch_core::config::EngineConfig;
use snatch_core::util::rotate_ad;
use snatch_core::{
    Profile, SnatchError, SnatchInstanceDetails, SnatchMetrics, SnatchProgress, SnatchResult,
    TaskResult, TaskRow, TaskStatus,
};
use snatch_notify::{CloudflareConfig, NotificationSink, RecordType, TelegramConfig};
use snatch_profiles::ProfileStore;
use snatch_provider::{list_availability_domains, NetworkBootstrapper, ProviderClientBundle};

use crate::quota::MICRO_SHAPE;

/// Everything one `SnatchEngine::run` call needs. Constructed by whoever
/// dispatches the task: the HTTP handler for a fresh snatch, or the
/// recovery loop for a resumed one.
pub struct SnatchRun {
    pub task_id: String,
    pub profile: Profile,
    pub progress: SnatchProgress,
    pub telegram: Option<TelegramConfig>,
    pub cloudflare: Option<CloudflareConfig>,
}

/// The retry loop: rotates availability domains, launches one instance per
/// attempt, backs off on any failure, and waits on success. Takes the
/// narrow `TaskRow` handle rather than the registry crate directly (see the
/// dependency-inversion design note).
pub struct SnatchEngine {
    task_row: Arc<dyn TaskRow>,
    profiles: Arc<ProfileStore>,
    notify: Arc<NotificationSink>,
    config: EngineConfig,
    metrics: Arc<SnatchMetrics>,
}

impl SnatchEngine {
    pub fn new(
        task_row: Arc<dyn TaskRow>,
        profiles: Arc<ProfileStore>,
        notify: Arc<NotificationSink>,
        config: EngineConfig,
        metrics: Arc<SnatchMetrics>,
    ) -> SnatchEngine {
        SnatchEngine {
            task_row,
            profiles,
            notify,
            config,
            metrics,
        }
    }

    pub async fn run(&self, run: SnatchRun) {
        if let Err(e) = self.prepare_and_loop(run).await {
            tracing::error!(error = %e, "snatch task ended with an error");
        }
    }

    /// Preparation phase (details clamp, provider bundle, AD list, subnet,
    /// image, password, cloud-init, launch template). Any failure here is
    /// terminal: the retry loop is never entered.
    async fn prepare_and_loop(&self, run: SnatchRun) -> SnatchResult<()> {
        let SnatchRun {
            task_id,
            profile,
            mut progress,
            telegram,
            cloudflare,
        } = run;

        if progress.details.shape == MICRO_SHAPE {
            progress.details.ocpus = 1.0;
            progress.details.memory_in_gbs = 1.0;
        }

        if let Err(e) = self
            .task_row
            .transition(
                &task_id,
                TaskStatus::Running,
                Some(TaskResult::Progress(progress.clone())),
            )
            .await
        {
            tracing::error!(error = %e, task_id = %task_id, "failed to mark snatch task running");
            return Err(e);
        }

        let clients = match ProviderClientBundle::build(&profile, false).await {
            Ok(c) => c,
            Err(e) => return self.fail(&task_id, format!("❌ credential error: {e}")).await,
        };

        let compartment_id = profile.tenancy_id.clone();
        let ads = match list_availability_domains(&clients.identity, &compartment_id).await {
            Ok(ads) if !ads.is_empty() => ads,
            Ok(_) => {
                return self
                    .fail(&task_id, "❌ tenancy has no availability domains".to_string())
                    .await
            }
            Err(e) => return self.fail(&task_id, format!("❌ failed to list ADs: {e}")).await,
        };

        let bootstrapper = NetworkBootstrapper::new(&clients, compartment_id.clone());
        let progress_task_id = task_id.clone();
        let subnet_id = match bootstrapper
            .ensure_subnet(&profile, &|msg| {
                tracing::info!(task_id = %progress_task_id, "{msg}");
            })
            .await
        {
            Ok(id) => id,
            Err(e) => return self.fail(&task_id, format!("❌ network bootstrap failed: {e}")).await,
        };
        let _ = self.profiles.set_remembered_subnet(&profile.alias, &subnet_id);

        let image_id = match resolve_image(&clients, &compartment_id, &progress.details).await {
            Ok(id) => id,
            Err(e) => return self.fail(&task_id, format!("❌ failed to resolve image: {e}")).await,
        };

        let password = progress
            .details
            .instance_password
            .clone()
            .unwrap_or_else(generate_password);
        progress.details.instance_password = Some(password.clone());

        let user_data = crate::cloud_init::build_user_data_base64(
            &password,
            progress.details.startup_script.as_deref(),
        );

        let launch_template = build_launch_template(
            &compartment_id,
            &subnet_id,
            &image_id,
            &user_data,
            &progress.details,
            profile.default_ssh_public_key.as_deref(),
        );

        self.retry_loop(
            task_id,
            clients,
            compartment_id,
            ads,
            progress,
            launch_template,
            telegram,
            cloudflare,
        )
        .await;
        Ok(())
    }

    async fn fail(&self, task_id: &str, message: String) -> SnatchResult<()> {
        self.task_row
            .transition(task_id, TaskStatus::Failure, Some(TaskResult::Message(message)))
            .await
    }

    /// Rotating-AD round-robin retry loop. Runs until the task either
    /// succeeds or this worker loses ownership (paused or resumed
    /// elsewhere). Every attempt failure, regardless of classification, is
    /// non-terminal: only an ownership check failing or a launch succeeding
    /// ends the loop.
    #[allow(clippy::too_many_arguments)]
    async fn retry_loop(
        &self,
        task_id: String,
        clients: ProviderClientBundle,
        compartment_id: String,
        ads: Vec<String>,
        mut progress: SnatchProgress,
        launch_template: serde_json::Value,
        telegram: Option<TelegramConfig>,
        cloudflare: Option<CloudflareConfig>,
    ) {
        let start_time = progress.start_time;
        let mut last_persist = Utc::now();
        let mut last_classification = String::new();

        loop {
            if !self.still_owns(&task_id, &progress.run_id).await {
                tracing::info!(task_id = %task_id, "ownership lost, exiting snatch loop");
                return;
            }

            progress.attempt_count += 1;
            let ad = rotate_ad(&ads, progress.attempt_count).to_string();
            progress.details.ad = Some(ad.clone());

            let mut attempt_template = launch_template.clone();
            attempt_template["availabilityDomain"] = json!(ad);

            self.metrics.launch_attempts_total.inc();

            match clients.compute.post("/20160918/instances", &attempt_template).await {
                Ok(instance) => {
                    let instance_id = instance
                        .get("id")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string();
                    progress.last_message =
                        format!("attempt {} succeeded, provisioning…", progress.attempt_count);
                    let _ = self
                        .task_row
                        .update_progress(&task_id, TaskResult::Progress(progress.clone()))
                        .await;

                    if let Err(e) =
                        wait_until_running(&clients, &instance_id, self.config.launch_wait_secs).await
                    {
                        tracing::warn!(error = %e, "instance did not reach RUNNING in time");
                    }
                    let public_ip = fetch_public_ip(&clients, &compartment_id, &instance_id)
                        .await
                        .unwrap_or_else(|_| "unknown".to_string());

                    let elapsed = snatch_core::util::format_duration(
                        (Utc::now() - start_time).to_std().unwrap_or(Duration::ZERO),
                    );
                    let mut message = format!(
                        "🎉 {} snatched in {elapsed} after {} attempt(s): AD={ad}, IP={public_ip}, login ubuntu/{}",
                        progress.details.display_name_prefix,
                        progress.attempt_count,
                        progress.details.instance_password.clone().unwrap_or_default()
                    );

                    if progress.details.auto_bind_domain && public_ip != "unknown" {
                        if let (Some(cf), Some(domain)) = (&cloudflare, &progress.details.domain) {
                            let status = self
                                .notify
                                .upsert_dns_record(cf, domain, &public_ip, RecordType::A)
                                .await;
                            message.push_str(&format!(" | {status}"));
                        }
                    }

                    let _ = self
                        .task_row
                        .transition(&task_id, TaskStatus::Success, Some(TaskResult::Message(message.clone())))
                        .await;
                    self.metrics.launch_successes_total.inc();
                    self.metrics.attempts_to_success.observe(progress.attempt_count as f64);
                    if let Some(tg) = &telegram {
                        self.notify.send_telegram(tg, &message).await;
                    }
                    return;
                }
                Err(e) => {
                    let (classification, text) = classify_attempt_error(&ad, &e);
                    if classification == "capacity" {
                        self.metrics.capacity_rejections_total.inc();
                    }
                    progress.last_message = text;

                    let now = Utc::now();
                    let classification_changed = classification != last_classification;
                    let interval_elapsed =
                        (now - last_persist).num_seconds() >= self.config.progress_interval_secs;
                    if classification_changed || interval_elapsed {
                        let _ = self
                            .task_row
                            .update_progress(&task_id, TaskResult::Progress(progress.clone()))
                            .await;
                        last_persist = now;
                    }
                    last_classification = classification;
                }
            }

            if !self.still_owns_or_paused(&task_id, &progress.run_id).await {
                tracing::info!(task_id = %task_id, "ownership lost after failed attempt, exiting");
                return;
            }

            let min_delay = progress.details.min_delay;
            let max_delay = progress.details.max_delay.max(min_delay);
            let delay = rand::thread_rng().gen_range(min_delay..=max_delay);
            tokio::time::sleep(Duration::from_secs(delay)).await;
        }
    }

    async fn still_owns(&self, task_id: &str, run_id: &str) -> bool {
        matches!(
            self.task_row.load(task_id).await,
            Ok(Some(task)) if task.status == TaskStatus::Running && task_run_id(&task) == Some(run_id.to_string())
        )
    }

    /// After a failed attempt the task may have been paused (still our
    /// run); only a status outside `{running, paused}`, or a run_id that no
    /// longer matches, means someone else took over.
    async fn still_owns_or_paused(&self, task_id: &str, run_id: &str) -> bool {
        matches!(
            self.task_row.load(task_id).await,
            Ok(Some(task))
                if matches!(task.status, TaskStatus::Running | TaskStatus::Paused)
                    && task_run_id(&task) == Some(run_id.to_string())
        )
    }
}

fn task_run_id(task: &snatch_core::Task) -> Option<String> {
    let result = task.result.as_deref()?;
    match TaskResult::decode(result).ok()? {
        TaskResult::Progress(p) => Some(p.run_id),
        TaskResult::Message(_) => None,
    }
}

fn classify_attempt_error(ad: &str, e: &SnatchError) -> (String, String) {
    match e {
        SnatchError::Capacity(code) => (
            "capacity".to_string(),
            format!("in {ad} capacity insufficient ({code})"),
        ),
        SnatchError::Transient(code) | SnatchError::Permanent(code) => {
            ("api_error".to_string(), format!("API error ({code})"))
        }
        other => {
            let text = other.to_string();
            let truncated: String = text.chars().take(50).collect();
            ("unknown".to_string(), format!("unknown error: {truncated}"))
        }
    }
}

async fn resolve_image(
    clients: &ProviderClientBundle,
    compartment_id: &str,
    details: &SnatchInstanceDetails,
) -> SnatchResult<String> {
    let response = clients
        .compute
        .get(&format!(
            "/20160918/images?compartmentId={compartment_id}&operatingSystem={}&operatingSystemVersion={}&shape={}&sortBy=TIMECREATED&sortOrder=DESC",
            details.os_name, details.os_version, details.shape
        ))
        .await?;
    response
        .as_array()
        .and_then(|v| v.first())
        .and_then(|img| img.get("id"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| SnatchError::Data("no matching image found".to_string()))
}

fn generate_password() -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..16)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}

fn build_launch_template(
    compartment_id: &str,
    subnet_id: &str,
    image_id: &str,
    user_data_b64: &str,
    details: &SnatchInstanceDetails,
    ssh_public_key: Option<&str>,
) -> serde_json::Value {
    let mut template = json!({
        "compartmentId": compartment_id,
        "shape": details.shape,
        "displayName": details.display_name_prefix,
        "createVnicDetails": {
            "subnetId": subnet_id,
            "assignPublicIp": true,
        },
        "metadata": {
            "ssh_authorized_keys": ssh_public_key.unwrap_or_default(),
            "user_data": user_data_b64,
        },
        "sourceDetails": {
            "sourceType": "image",
            "imageId": image_id,
            "bootVolumeSizeInGBs": details.boot_volume_size,
        },
        "agentConfig": {
            "isMonitoringDisabled": true,
            "pluginsConfig": [
                { "name": "Custom Logs Monitoring", "desiredState": "DISABLED" }
            ],
        },
    });

    if details.shape.contains("Flex") {
        template["shapeConfig"] = json!({
            "ocpus": details.ocpus,
            "memoryInGBs": details.memory_in_gbs,
        });
    }

    template
}

async fn wait_until_running(
    clients: &ProviderClientBundle,
    instance_id: &str,
    timeout_secs: u64,
) -> SnatchResult<()> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);
    loop {
        let instance = clients
            .compute
            .get(&format!("/20160918/instances/{instance_id}"))
            .await?;
        if instance.get("lifecycleState").and_then(|v| v.as_str()) == Some("RUNNING") {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(SnatchError::Transient(
                "timed out waiting for instance to reach RUNNING".to_string(),
            ));
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
    }
}

async fn fetch_public_ip(
    clients: &ProviderClientBundle,
    compartment_id: &str,
    instance_id: &str,
) -> SnatchResult<String> {
    let attachments = clients
        .compute
        .get(&format!(
            "/20160918/vnicAttachments?compartmentId={compartment_id}&instanceId={instance_id}"
        ))
        .await?;
    let vnic_id = attachments
        .as_array()
        .and_then(|v| v.first())
        .and_then(|a| a.get("vnicId"))
        .and_then(|v| v.as_str())
        .ok_or_else(|| SnatchError::Data("no vnic attachment found".to_string()))?;
    let vnic = clients
        .network
        .get(&format!("/20160918/vnics/{vnic_id}"))
        .await?;
    vnic.get("publicIp")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| SnatchError::Data("vnic has no public IP".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use snatch_core::Task;
    use snatch_core::TaskType;
    use std::sync::Mutex as StdMutex;
    use wiremock::matchers::{method, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TEST_KEY_PEM: &str =
        include_str!("../../snatch-provider/tests/fixtures/test_key_pkcs8.pem");

    struct FakeTaskRow {
        task: StdMutex<Task>,
    }

    #[async_trait]
    impl TaskRow for FakeTaskRow {
        async fn load(&self, _task_id: &str) -> SnatchResult<Option<Task>> {
            Ok(Some(self.task.lock().unwrap().clone()))
        }

        async fn transition(
            &self,
            _task_id: &str,
            status: TaskStatus,
            result: Option<TaskResult>,
        ) -> SnatchResult<()> {
            let mut task = self.task.lock().unwrap();
            task.status = status;
            if let Some(r) = result {
                task.result = Some(r.encode()?);
            }
            Ok(())
        }

        async fn update_progress(&self, _task_id: &str, result: TaskResult) -> SnatchResult<()> {
            let mut task = self.task.lock().unwrap();
            task.result = Some(result.encode()?);
            Ok(())
        }
    }

    fn test_profile() -> Profile {
        Profile {
            alias: "acct1".to_string(),
            tenancy_id: "tenancy1".to_string(),
            user_id: "user1".to_string(),
            fingerprint: "fp".to_string(),
            region: "us-phoenix-1".to_string(),
            private_key: TEST_KEY_PEM.to_string(),
            proxy: None,
            default_ssh_public_key: Some("ssh-rsa AAAA".to_string()),
            default_subnet_ocid: Some("subnet-1".to_string()),
            order_index: 0,
        }
    }

    fn test_details() -> SnatchInstanceDetails {
        SnatchInstanceDetails {
            account_alias: "acct1".to_string(),
            shape: MICRO_SHAPE.to_string(),
            ocpus: 1.0,
            memory_in_gbs: 1.0,
            os_name: "Canonical Ubuntu".to_string(),
            os_version: "22.04".to_string(),
            ad: None,
            boot_volume_size: 50,
            display_name_prefix: "snatch-test".to_string(),
            min_delay: 0,
            max_delay: 0,
            auto_bind_domain: false,
            domain: None,
            startup_script: None,
            instance_password: None,
        }
    }

    #[test]
    fn classify_attempt_error_reports_capacity_with_ad() {
        let (cls, text) =
            classify_attempt_error("AD-2", &SnatchError::Capacity("LimitExceeded: x".to_string()));
        assert_eq!(cls, "capacity");
        assert!(text.contains("AD-2"));
    }

    #[test]
    fn classify_attempt_error_truncates_unknown_messages() {
        let long = "x".repeat(200);
        let (cls, text) = classify_attempt_error("AD-1", &SnatchError::Data(long));
        assert_eq!(cls, "unknown");
        assert!(text.len() < 120);
    }

    #[tokio::test]
    async fn succeeds_on_first_attempt_against_mocked_provider() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/20160918/subnets/subnet-1$"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "id": "subnet-1", "lifecycleState": "AVAILABLE" })),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/20160918/availabilityDomains$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{ "name": "AD-1" }])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/20160918/images$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{ "id": "image-1" }])))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path_regex(r"^/20160918/instances$"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "id": "instance-1", "lifecycleState": "RUNNING" })),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/20160918/instances/instance-1$"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "id": "instance-1", "lifecycleState": "RUNNING" })),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/20160918/vnicAttachments$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{ "vnicId": "vnic-1" }])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/20160918/vnics/vnic-1$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "publicIp": "1.2.3.4" })))
            .mount(&server)
            .await;

        let signer =
            Arc::new(snatch_provider::RequestSigner::new("t/u/fp".to_string(), TEST_KEY_PEM).unwrap());
        let clients = ProviderClientBundle {
            identity: snatch_provider::ServiceClient::for_testing(server.uri(), signer.clone()),
            compute: snatch_provider::ServiceClient::for_testing(server.uri(), signer.clone()),
            network: snatch_provider::ServiceClient::for_testing(server.uri(), signer.clone()),
            block_storage: snatch_provider::ServiceClient::for_testing(server.uri(), signer),
        };

        let task_id = "task-1".to_string();
        let run_id = "run-1".to_string();
        let progress = SnatchProgress {
            run_id: run_id.clone(),
            start_time: Utc::now(),
            attempt_count: 0,
            last_message: String::new(),
            details: test_details(),
        };
        let task_row = Arc::new(FakeTaskRow {
            task: StdMutex::new(Task {
                id: task_id.clone(),
                task_type: TaskType::Snatch,
                name: "snatch-test".to_string(),
                status: TaskStatus::Running,
                result: Some(TaskResult::Progress(progress.clone()).encode().unwrap()),
                created_at: Utc::now(),
                completed_at: None,
                account_alias: "acct1".to_string(),
            }),
        });

        let ads = vec!["AD-1".to_string()];
        let compartment_id = "tenancy1".to_string();
        let bootstrapper = NetworkBootstrapper::new(&clients, compartment_id.clone());
        let subnet_id = bootstrapper.ensure_subnet(&test_profile(), &|_| {}).await.unwrap();
        let image_id = resolve_image(&clients, &compartment_id, &progress.details)
            .await
            .unwrap();
        let user_data = crate::cloud_init::build_user_data_base64("pw123456789012", None);
        let launch_template = build_launch_template(
            &compartment_id,
            &subnet_id,
            &image_id,
            &user_data,
            &progress.details,
            Some("ssh-rsa AAAA"),
        );

        let profiles = Arc::new(ProfileStore::new(
            tempfile::tempdir().unwrap().path().join("profiles.json"),
            None,
        ));
        let _ = profiles.upsert(
            "acct1",
            snatch_profiles::ProfilePatch {
                tenancy_id: Some("tenancy1".to_string()),
                user_id: Some("user1".to_string()),
                fingerprint: Some("fp".to_string()),
                region: Some("us-phoenix-1".to_string()),
                private_key: Some(TEST_KEY_PEM.to_string()),
                proxy: None,
                default_ssh_public_key: Some("ssh-rsa AAAA".to_string()),
            },
        );

        let mut registry = prometheus_client::registry::Registry::default();
        let engine = SnatchEngine::new(
            task_row.clone(),
            profiles,
            Arc::new(NotificationSink::new()),
            EngineConfig {
                min_delay_secs: 0,
                max_delay_secs: 0,
                progress_interval_secs: 0,
                launch_wait_secs: 5,
                micro_shape_quota: 2,
            },
            SnatchMetrics::new(&mut registry),
        );

        engine
            .retry_loop(
                task_id.clone(),
                clients,
                compartment_id,
                ads,
                progress,
                launch_template,
                None,
                None,
            )
            .await;

        let final_task = task_row.task.lock().unwrap().clone();
        assert_eq!(final_task.status, TaskStatus::Success);
        let message = final_task.result.unwrap();
        assert!(message.contains("snatched"));
    }
}

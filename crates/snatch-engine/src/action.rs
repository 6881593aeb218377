use std::time::Duration;

use serde_json::json;
use snatch_core::{SnatchError, SnatchResult, TaskResult, TaskRow, TaskStatus};
use snatch_notify::{CloudflareConfig, NotificationSink, RecordType, TelegramConfig};
use snatch_provider::{NetworkBootstrapper, ProviderClientBundle};

const ACTION_WAIT_SECS: u64 = 300;
const ACTION_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// One-shot instance actions, as opposed to the long-running snatch retry
/// loop. Every action is a single attempt: no retrying, no AD rotation.
#[derive(Debug, Clone)]
pub enum InstanceAction {
    Power(PowerOp),
    Terminate,
    ChangePublicIp {
        compartment_id: String,
    },
    AssignIpv6,
    Rename {
        new_name: String,
    },
    Reshape {
        new_shape: String,
        ocpus: Option<f64>,
        memory_in_gbs: Option<f64>,
    },
    ResizeBootVolume {
        boot_volume_id: String,
        new_size_gbs: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerOp {
    Start,
    Stop,
    Restart,
}

impl PowerOp {
    fn oci_action(self) -> &'static str {
        match self {
            PowerOp::Start => "START",
            PowerOp::Stop => "STOP",
            PowerOp::Restart => "SOFTRESET",
        }
    }

    fn target_state(self) -> &'static str {
        match self {
            PowerOp::Start | PowerOp::Restart => "RUNNING",
            PowerOp::Stop => "STOPPED",
        }
    }
}

/// Derives the task name supplement: `"{action} on instance {last 12 chars
/// of instance_id}"`, so the task list stays readable without looking up
/// the full OCID.
pub fn action_task_name(action: &InstanceAction, instance_id: &str) -> String {
    let suffix: String = instance_id.chars().rev().take(12).collect::<Vec<_>>().into_iter().rev().collect();
    let label = match action {
        InstanceAction::Power(PowerOp::Start) => "start",
        InstanceAction::Power(PowerOp::Stop) => "stop",
        InstanceAction::Power(PowerOp::Restart) => "restart",
        InstanceAction::Terminate => "terminate",
        InstanceAction::ChangePublicIp { .. } => "change public IP",
        InstanceAction::AssignIpv6 => "assign IPv6",
        InstanceAction::Rename { .. } => "rename",
        InstanceAction::Reshape { .. } => "reshape",
        InstanceAction::ResizeBootVolume { .. } => "resize boot volume",
    };
    format!("{label} on instance {suffix}")
}

/// Executes one instance action to completion and writes the terminal
/// task status. `from_web` suppresses the Telegram notification: actions
/// triggered from the web console don't need a push, only CLI/automation
/// ones do.
pub struct ActionExecutor {
    clients: ProviderClientBundle,
    compartment_id: String,
    notify: NotificationSink,
}

impl ActionExecutor {
    pub fn new(
        clients: ProviderClientBundle,
        compartment_id: String,
        notify: NotificationSink,
    ) -> ActionExecutor {
        ActionExecutor {
            clients,
            compartment_id,
            notify,
        }
    }

    pub async fn run(
        &self,
        task_row: &dyn TaskRow,
        task_id: &str,
        instance_id: &str,
        action: InstanceAction,
        telegram: Option<&TelegramConfig>,
        cloudflare: Option<&CloudflareConfig>,
        domain: Option<&str>,
        from_web: bool,
    ) {
        let outcome = self.execute(instance_id, action, cloudflare, domain).await;
        let (status, message) = match outcome {
            Ok(msg) => (TaskStatus::Success, format!("✅ {msg}")),
            Err(e) => (TaskStatus::Failure, format!("❌ {e}")),
        };
        let _ = task_row
            .transition(task_id, status, Some(TaskResult::Message(message.clone())))
            .await;
        if !from_web {
            if let Some(tg) = telegram {
                self.notify.send_telegram(tg, &message).await;
            }
        }
    }

    async fn execute(
        &self,
        instance_id: &str,
        action: InstanceAction,
        cloudflare: Option<&CloudflareConfig>,
        domain: Option<&str>,
    ) -> SnatchResult<String> {
        match action {
            InstanceAction::Power(op) => self.power(instance_id, op).await,
            InstanceAction::Terminate => self.terminate(instance_id).await,
            InstanceAction::ChangePublicIp { compartment_id } => {
                self.change_public_ip(instance_id, &compartment_id, cloudflare, domain)
                    .await
            }
            InstanceAction::AssignIpv6 => self.assign_ipv6(instance_id, cloudflare, domain).await,
            InstanceAction::Rename { new_name } => self.rename(instance_id, &new_name).await,
            InstanceAction::Reshape {
                new_shape,
                ocpus,
                memory_in_gbs,
            } => self.reshape(instance_id, &new_shape, ocpus, memory_in_gbs).await,
            InstanceAction::ResizeBootVolume {
                boot_volume_id,
                new_size_gbs,
            } => self.resize_boot_volume(&boot_volume_id, new_size_gbs).await,
        }
    }

    async fn power(&self, instance_id: &str, op: PowerOp) -> SnatchResult<String> {
        self.clients
            .compute
            .post(
                &format!("/20160918/instances/{instance_id}/action?action={}", op.oci_action()),
                &json!({}),
            )
            .await?;
        self.wait_for_instance_state(instance_id, op.target_state()).await?;
        Ok(format!("instance {instance_id} reached {}", op.target_state()))
    }

    async fn terminate(&self, instance_id: &str) -> SnatchResult<String> {
        match self
            .clients
            .compute
            .delete(&format!("/20160918/instances/{instance_id}"))
            .await
        {
            Ok(_) => {}
            Err(SnatchError::Data(_)) => return Ok(format!("instance {instance_id} already gone")),
            Err(e) => return Err(e),
        }

        let deadline = tokio::time::Instant::now() + Duration::from_secs(ACTION_WAIT_SECS);
        loop {
            match self
                .clients
                .compute
                .get(&format!("/20160918/instances/{instance_id}"))
                .await
            {
                Ok(instance)
                    if instance.get("lifecycleState").and_then(|v| v.as_str()) == Some("TERMINATED") =>
                {
                    return Ok(format!("instance {instance_id} terminated"))
                }
                Ok(_) => {}
                Err(SnatchError::Data(_)) => return Ok(format!("instance {instance_id} terminated")),
                Err(e) => return Err(e),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(SnatchError::Transient(format!(
                    "timed out waiting for {instance_id} to terminate"
                )));
            }
            tokio::time::sleep(ACTION_POLL_INTERVAL).await;
        }
    }

    async fn change_public_ip(
        &self,
        instance_id: &str,
        compartment_id: &str,
        cloudflare: Option<&CloudflareConfig>,
        domain: Option<&str>,
    ) -> SnatchResult<String> {
        let attachments = self
            .clients
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
            .ok_or_else(|| SnatchError::Data("no vnic attachment found".to_string()))?
            .to_string();

        let private_ips = self
            .clients
            .network
            .get(&format!("/20160918/privateIps?vnicId={vnic_id}"))
            .await?;
        let primary_private_ip_id = private_ips
            .as_array()
            .into_iter()
            .flatten()
            .find(|ip| ip.get("isPrimary").and_then(|v| v.as_bool()) == Some(true))
            .and_then(|ip| ip.get("id"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| SnatchError::Data("no primary private IP found".to_string()))?
            .to_string();

        let public_ips = self
            .clients
            .network
            .get(&format!("/20160918/publicIps?privateIpId={primary_private_ip_id}"))
            .await?;
        if let Some(existing) = public_ips
            .as_array()
            .into_iter()
            .flatten()
            .find(|ip| ip.get("lifetime").and_then(|v| v.as_str()) == Some("EPHEMERAL"))
            .and_then(|ip| ip.get("id"))
            .and_then(|v| v.as_str())
        {
            self.clients
                .network
                .delete(&format!("/20160918/publicIps/{existing}"))
                .await?;
        }

        tokio::time::sleep(Duration::from_secs(5)).await;

        let created = self
            .clients
            .network
            .post(
                "/20160918/publicIps",
                &json!({
                    "compartmentId": self.compartment_id,
                    "lifetime": "EPHEMERAL",
                    "privateIpId": primary_private_ip_id,
                }),
            )
            .await?;
        let new_ip = created
            .get("ipAddress")
            .and_then(|v| v.as_str())
            .ok_or_else(|| SnatchError::Data("public IP creation returned no address".to_string()))?
            .to_string();

        let mut message = format!("instance {instance_id} 更换IP成功, new public IP {new_ip}");
        if let (Some(cf), Some(domain)) = (cloudflare, domain) {
            let status = self.notify.upsert_dns_record(cf, domain, &new_ip, RecordType::A).await;
            message.push_str(&format!(" | {status}"));
        }
        Ok(message)
    }

    async fn assign_ipv6(
        &self,
        instance_id: &str,
        cloudflare: Option<&CloudflareConfig>,
        domain: Option<&str>,
    ) -> SnatchResult<String> {
        let attachments = self
            .clients
            .compute
            .get(&format!(
                "/20160918/vnicAttachments?compartmentId={}&instanceId={instance_id}",
                self.compartment_id
            ))
            .await?;
        let vnic_id = attachments
            .as_array()
            .and_then(|v| v.first())
            .and_then(|a| a.get("vnicId"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| SnatchError::Data("no vnic attachment found".to_string()))?
            .to_string();

        let bootstrapper = NetworkBootstrapper::new(&self.clients, self.compartment_id.clone());
        bootstrapper.enable_ipv6(&vnic_id, &|msg| tracing::info!("{msg}")).await?;

        let ipv6 = self
            .clients
            .network
            .post("/20160918/ipv6", &json!({ "vnicId": vnic_id }))
            .await?;
        let address = ipv6
            .get("ipAddress")
            .and_then(|v| v.as_str())
            .ok_or_else(|| SnatchError::Data("ipv6 creation returned no address".to_string()))?
            .to_string();

        let mut message = format!("instance {instance_id} assigned IPv6 {address}");
        if let (Some(cf), Some(domain)) = (cloudflare, domain) {
            let status = self
                .notify
                .upsert_dns_record(cf, domain, &address, RecordType::Aaaa)
                .await;
            message.push_str(&format!(" | {status}"));
        }
        Ok(message)
    }

    async fn rename(&self, instance_id: &str, new_name: &str) -> SnatchResult<String> {
        self.clients
            .compute
            .put(
                &format!("/20160918/instances/{instance_id}"),
                &json!({ "displayName": new_name }),
            )
            .await?;
        Ok(format!("instance {instance_id} renamed to {new_name}"))
    }

    async fn reshape(
        &self,
        instance_id: &str,
        new_shape: &str,
        ocpus: Option<f64>,
        memory_in_gbs: Option<f64>,
    ) -> SnatchResult<String> {
        self.require_stopped(instance_id, "reshape").await?;
        let mut body = json!({ "shape": new_shape });
        if new_shape.contains("Flex") {
            body["shapeConfig"] = json!({
                "ocpus": ocpus.unwrap_or(1.0),
                "memoryInGBs": memory_in_gbs.unwrap_or(1.0),
            });
        }
        self.clients
            .compute
            .post(&format!("/20160918/instances/{instance_id}/actions/changeShape"), &body)
            .await?;
        Ok(format!("instance {instance_id} reshaped to {new_shape}"))
    }

    async fn resize_boot_volume(&self, boot_volume_id: &str, new_size_gbs: u64) -> SnatchResult<String> {
        self.clients
            .block_storage
            .put(
                &format!("/20160918/bootVolumes/{boot_volume_id}"),
                &json!({ "sizeInGBs": new_size_gbs }),
            )
            .await?;
        Ok(format!("boot volume {boot_volume_id} resized to {new_size_gbs}GB (reboot required)"))
    }

    async fn require_stopped(&self, instance_id: &str, action_name: &str) -> SnatchResult<()> {
        let instance = self
            .clients
            .compute
            .get(&format!("/20160918/instances/{instance_id}"))
            .await?;
        if instance.get("lifecycleState").and_then(|v| v.as_str()) == Some("STOPPED") {
            Ok(())
        } else {
            Err(SnatchError::Validation(format!(
                "cannot {action_name} instance {instance_id}: must be STOPPED first"
            )))
        }
    }

    async fn wait_for_instance_state(&self, instance_id: &str, target_state: &str) -> SnatchResult<()> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(ACTION_WAIT_SECS);
        loop {
            let instance = self
                .clients
                .compute
                .get(&format!("/20160918/instances/{instance_id}"))
                .await?;
            if instance.get("lifecycleState").and_then(|v| v.as_str()) == Some(target_state) {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(SnatchError::Transient(format!(
                    "timed out waiting for {instance_id} to reach {target_state}"
                )));
            }
            tokio::time::sleep(ACTION_POLL_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use snatch_core::{Task, TaskType};
    use std::sync::{Arc, Mutex as StdMutex};
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

    fn test_bundle(base_url: &str) -> ProviderClientBundle {
        let signer =
            Arc::new(snatch_provider::RequestSigner::new("t/u/fp".to_string(), TEST_KEY_PEM).unwrap());
        ProviderClientBundle {
            identity: snatch_provider::ServiceClient::for_testing(base_url.to_string(), signer.clone()),
            compute: snatch_provider::ServiceClient::for_testing(base_url.to_string(), signer.clone()),
            network: snatch_provider::ServiceClient::for_testing(base_url.to_string(), signer.clone()),
            block_storage: snatch_provider::ServiceClient::for_testing(base_url.to_string(), signer),
        }
    }

    fn fake_task(id: &str) -> Arc<FakeTaskRow> {
        Arc::new(FakeTaskRow {
            task: StdMutex::new(Task {
                id: id.to_string(),
                task_type: TaskType::Action,
                name: "test-action".to_string(),
                status: TaskStatus::Running,
                result: None,
                created_at: chrono::Utc::now(),
                completed_at: None,
                account_alias: "acct1".to_string(),
            }),
        })
    }

    #[test]
    fn action_task_name_uses_last_12_chars_of_instance_id() {
        let name = action_task_name(
            &InstanceAction::Power(PowerOp::Stop),
            "ocid1.instance.oc1..aaaaaaaaabcdefg1234567890",
        );
        assert!(name.starts_with("stop on instance "));
        assert!(name.ends_with("567890"));
    }

    #[tokio::test]
    async fn terminate_treats_404_as_success() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path_regex(r"^/20160918/instances/inst-1$"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let executor = ActionExecutor::new(
            test_bundle(&server.uri()),
            "compartment-1".to_string(),
            NotificationSink::new(),
        );
        let task_row = fake_task("task-1");
        executor
            .run(
                task_row.as_ref(),
                "task-1",
                "inst-1",
                InstanceAction::Terminate,
                None,
                None,
                None,
                true,
            )
            .await;

        let task = task_row.task.lock().unwrap().clone();
        assert_eq!(task.status, TaskStatus::Success);
    }

    #[tokio::test]
    async fn reshape_fails_when_instance_not_stopped() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/20160918/instances/inst-1$"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "lifecycleState": "RUNNING" })),
            )
            .mount(&server)
            .await;

        let executor = ActionExecutor::new(
            test_bundle(&server.uri()),
            "compartment-1".to_string(),
            NotificationSink::new(),
        );
        let task_row = fake_task("task-1");
        executor
            .run(
                task_row.as_ref(),
                "task-1",
                "inst-1",
                InstanceAction::Reshape {
                    new_shape: "VM.Standard.E4.Flex".to_string(),
                    ocpus: Some(2.0),
                    memory_in_gbs: Some(16.0),
                },
                None,
                None,
                None,
                true,
            )
            .await;

        let task = task_row.task.lock().unwrap().clone();
        assert_eq!(task.status, TaskStatus::Failure);
        assert!(task.result.unwrap().contains("STOPPED"));
    }
}

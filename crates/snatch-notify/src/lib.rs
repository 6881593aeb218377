use std::time::Duration;

use serde::Deserialize;
use serde_json::json;

const TELEGRAM_TIMEOUT: Duration = Duration::from_secs(10);
const CLOUDFLARE_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub chat_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CloudflareConfig {
    pub api_token: String,
    pub zone_id: String,
    pub domain: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    A,
    Aaaa,
}

impl RecordType {
    fn as_str(self) -> &'static str {
        match self {
            RecordType::A => "A",
            RecordType::Aaaa => "AAAA",
        }
    }
}

/// Outbound side-effects. Every call is best-effort: failures are logged
/// and surfaced as a status string, never propagated as a hard error, so a
/// notification outage can never change a task's terminal status.
pub struct NotificationSink {
    http: reqwest::Client,
    cloudflare_base_url: String,
}

impl Default for NotificationSink {
    fn default() -> Self {
        NotificationSink::new()
    }
}

impl NotificationSink {
    pub fn new() -> NotificationSink {
        NotificationSink {
            http: reqwest::Client::new(),
            cloudflare_base_url: "https://api.cloudflare.com/client/v4".to_string(),
        }
    }

    #[cfg(test)]
    fn with_cloudflare_base_url(base_url: String) -> NotificationSink {
        NotificationSink {
            http: reqwest::Client::new(),
            cloudflare_base_url: base_url,
        }
    }

    /// POSTs `sendMessage`. Never returns an error; logs and moves on.
    pub async fn send_telegram(&self, cfg: &TelegramConfig, text: &str) {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", cfg.bot_token);
        let body = json!({
            "chat_id": cfg.chat_id,
            "text": text,
            "parse_mode": "Markdown",
        });
        let result = self
            .http
            .post(&url)
            .timeout(TELEGRAM_TIMEOUT)
            .json(&body)
            .send()
            .await;
        match result {
            Ok(resp) if resp.status().is_success() => {
                tracing::debug!("telegram notification sent");
            }
            Ok(resp) => {
                tracing::warn!(status = %resp.status(), "telegram notification rejected");
            }
            Err(e) => {
                tracing::warn!(error = %e, "telegram notification failed");
            }
        }
    }

    /// Upserts a DNS record for `<subdomain>.<domain>`. Returns a single
    /// human-readable status line to be appended to the task result;
    /// failures are reflected in that line, never raised as an error.
    pub async fn upsert_dns_record(
        &self,
        cfg: &CloudflareConfig,
        subdomain: &str,
        ip: &str,
        record_type: RecordType,
    ) -> String {
        match self.try_upsert_dns_record(cfg, subdomain, ip, record_type).await {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(error = %e, "cloudflare DNS upsert failed");
                format!("DNS update failed: {e}")
            }
        }
    }

    async fn try_upsert_dns_record(
        &self,
        cfg: &CloudflareConfig,
        subdomain: &str,
        ip: &str,
        record_type: RecordType,
    ) -> Result<String, reqwest::Error> {
        let name = format!("{subdomain}.{}", cfg.domain);
        let list_url = format!(
            "{}/zones/{}/dns_records?type={}&name={name}",
            self.cloudflare_base_url,
            cfg.zone_id,
            record_type.as_str()
        );
        let existing: CloudflareListResponse = self
            .http
            .get(&list_url)
            .timeout(CLOUDFLARE_TIMEOUT)
            .bearer_auth(&cfg.api_token)
            .send()
            .await?
            .json()
            .await?;

        let payload = json!({
            "type": record_type.as_str(),
            "name": name,
            "content": ip,
            "ttl": 60,
            "proxied": false,
        });

        if let Some(record) = existing.result.first() {
            let update_url = format!(
                "{}/zones/{}/dns_records/{}",
                self.cloudflare_base_url, cfg.zone_id, record.id
            );
            let resp = self
                .http
                .put(&update_url)
                .timeout(CLOUDFLARE_TIMEOUT)
                .bearer_auth(&cfg.api_token)
                .json(&payload)
                .send()
                .await?;
            if resp.status().is_success() {
                Ok(format!("DNS record {name} updated to {ip}"))
            } else {
                Ok(format!("DNS update returned {}", resp.status()))
            }
        } else {
            let create_url = format!(
                "{}/zones/{}/dns_records",
                self.cloudflare_base_url, cfg.zone_id
            );
            let resp = self
                .http
                .post(&create_url)
                .timeout(CLOUDFLARE_TIMEOUT)
                .bearer_auth(&cfg.api_token)
                .json(&payload)
                .send()
                .await?;
            if resp.status().is_success() {
                Ok(format!("DNS record {name} created pointing to {ip}"))
            } else {
                Ok(format!("DNS create returned {}", resp.status()))
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct CloudflareListResponse {
    result: Vec<CloudflareRecord>,
}

#[derive(Debug, Deserialize)]
struct CloudflareRecord {
    id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn cfg(zone_id: &str) -> CloudflareConfig {
        CloudflareConfig {
            api_token: "token".to_string(),
            zone_id: zone_id.to_string(),
            domain: "example.com".to_string(),
        }
    }

    #[tokio::test]
    async fn upsert_dns_record_creates_when_absent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/zones/zone1/dns_records"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "result": [] })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/zones/zone1/dns_records"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "success": true })))
            .mount(&server)
            .await;

        let sink = NotificationSink::with_cloudflare_base_url(server.uri());
        let status = sink
            .upsert_dns_record(&cfg("zone1"), "demo-vm", "1.2.3.4", RecordType::A)
            .await;
        assert!(status.contains("created"));
        assert!(status.contains("1.2.3.4"));
    }

    #[tokio::test]
    async fn upsert_dns_record_updates_when_present() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/zones/zone1/dns_records"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "result": [{ "id": "rec1" }] })),
            )
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/zones/zone1/dns_records/rec1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "success": true })))
            .mount(&server)
            .await;

        let sink = NotificationSink::with_cloudflare_base_url(server.uri());
        let status = sink
            .upsert_dns_record(&cfg("zone1"), "demo-vm", "1.2.3.4", RecordType::A)
            .await;
        assert!(status.contains("updated"));
    }

    #[tokio::test]
    async fn upsert_dns_record_never_panics_on_transport_failure() {
        // No mock server listening at this address: the call must fail
        // internally and return a status string, never panic or propagate.
        let sink = NotificationSink::with_cloudflare_base_url("http://127.0.0.1:1".to_string());
        let status = sink
            .upsert_dns_record(&cfg("zone1"), "demo-vm", "1.2.3.4", RecordType::A)
            .await;
        assert!(status.contains("failed"));
    }
}

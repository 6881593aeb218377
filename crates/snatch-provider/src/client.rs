use std::sync::Arc;
use std::time::Duration;

use secrecy::ExposeSecret;
use serde_json::Value;
use snatch_core::{Profile, SnatchError, SnatchResult};

use crate::signing::RequestSigner;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    Identity,
    Compute,
    Network,
    BlockStorage,
}

impl Service {
    fn host(self, region: &str) -> String {
        match self {
            Service::Identity => format!("identity.{region}.oraclecloud.com"),
            Service::Compute | Service::Network | Service::BlockStorage => {
                format!("iaas.{region}.oraclecloud.com")
            }
        }
    }
}

/// One signed-REST client bound to a single OCI service endpoint for one
/// profile. `ProviderClientBundle` hands out four of these (identity,
/// compute, network, block storage) sharing the same underlying
/// `reqwest::Client` and signer.
#[derive(Clone)]
pub struct ServiceClient {
    http: reqwest::Client,
    base_url: String,
    host: String,
    signer: Arc<RequestSigner>,
}

impl ServiceClient {
    pub async fn get(&self, path: &str) -> SnatchResult<Value> {
        self.call(reqwest::Method::GET, path, None).await
    }

    pub async fn post(&self, path: &str, body: &Value) -> SnatchResult<Value> {
        self.call(reqwest::Method::POST, path, Some(body)).await
    }

    pub async fn put(&self, path: &str, body: &Value) -> SnatchResult<Value> {
        self.call(reqwest::Method::PUT, path, Some(body)).await
    }

    pub async fn delete(&self, path: &str) -> SnatchResult<Value> {
        self.call(reqwest::Method::DELETE, path, None).await
    }

    async fn call(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&Value>,
    ) -> SnatchResult<Value> {
        let encoded_body = body.map(|b| serde_json::to_vec(b)).transpose().map_err(
            |e: serde_json::Error| SnatchError::Data(e.to_string()),
        )?;
        let headers = self.signer.sign(
            method.as_str(),
            path,
            &self.host,
            encoded_body.as_deref(),
        )?;

        let url = format!("{}{}", self.base_url, path);
        let mut req = self.http.request(method, &url);
        for (name, value) in headers {
            req = req.header(name, value);
        }
        if let Some(bytes) = encoded_body {
            req = req.body(bytes);
        }

        let response = req.send().await.map_err(classify_transport_error)?;
        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);

        if status.is_success() {
            Ok(body)
        } else if status.as_u16() == 404 {
            Err(SnatchError::Data(format!("not found: {path}")))
        } else {
            let code = body
                .get("code")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            let message = body
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            Err(snatch_core::classify_service_error(
                status.as_u16(),
                code,
                message,
            ))
        }
    }
}

fn classify_transport_error(e: reqwest::Error) -> SnatchError {
    if e.is_timeout() || e.is_connect() {
        SnatchError::Unreachable(e.to_string())
    } else {
        SnatchError::Transient(e.to_string())
    }
}

pub struct ProviderClientBundle {
    pub identity: ServiceClient,
    pub compute: ServiceClient,
    pub network: ServiceClient,
    pub block_storage: ServiceClient,
}

impl ProviderClientBundle {
    /// Builds the four service clients for `profile`. The private key's
    /// literal PEM content is written to a unique short-lived file (mode
    /// 0600), parsed, and the file deleted before returning — matching the
    /// two supported key-material forms and the "delete after construction"
    /// contract. When `validate` is true, performs a credential validation
    /// call (`GetUser`) before returning.
    pub async fn build(profile: &Profile, validate: bool) -> SnatchResult<ProviderClientBundle> {
        let key_material = materialize_private_key(&profile.private_key)?;
        let signer = Arc::new(RequestSigner::new(
            format!(
                "{}/{}/{}",
                profile.tenancy_id, profile.user_id, profile.fingerprint
            ),
            key_material.pem.expose_secret(),
        )?);
        key_material.cleanup();

        let http = build_http_client(profile.proxy.as_deref())?;

        let bundle = ProviderClientBundle {
            identity: make_client(&http, &signer, Service::Identity, &profile.region),
            compute: make_client(&http, &signer, Service::Compute, &profile.region),
            network: make_client(&http, &signer, Service::Network, &profile.region),
            block_storage: make_client(&http, &signer, Service::BlockStorage, &profile.region),
        };

        if validate {
            bundle
                .identity
                .get(&format!("/20160918/users/{}", profile.user_id))
                .await
                .map_err(|e| match e {
                    SnatchError::Capacity(_) | SnatchError::Transient(_) => e,
                    _ => SnatchError::Credential(format!("credential validation failed: {e}")),
                })?;
        }

        Ok(bundle)
    }
}

fn make_client(
    http: &reqwest::Client,
    signer: &Arc<RequestSigner>,
    service: Service,
    region: &str,
) -> ServiceClient {
    let host = service.host(region);
    ServiceClient {
        http: http.clone(),
        base_url: format!("https://{host}"),
        host,
        signer: signer.clone(),
    }
}

fn build_http_client(proxy: Option<&str>) -> SnatchResult<reqwest::Client> {
    let mut builder = reqwest::Client::builder().timeout(REQUEST_TIMEOUT);
    if let Some(proxy) = proxy {
        let proxy_url = if proxy.contains("://") {
            proxy.to_string()
        } else {
            format!("http://{proxy}")
        };
        let proxy = reqwest::Proxy::all(&proxy_url)
            .map_err(|e| SnatchError::Proxy(format!("invalid proxy '{proxy_url}': {e}")))?;
        builder = builder.proxy(proxy);
    }
    builder
        .build()
        .map_err(|e| SnatchError::Infrastructure(format!("build http client: {e}")))
}

struct MaterializedKey {
    pem: secrecy::SecretString,
    temp_path: Option<std::path::PathBuf>,
}

impl MaterializedKey {
    /// Deletes the short-lived key file, if one was written. No-op for the
    /// path form, where the caller owns the file's lifetime.
    fn cleanup(&self) {
        if let Some(path) = &self.temp_path {
            if let Err(e) = std::fs::remove_file(path) {
                tracing::warn!(path = %path.display(), error = %e, "failed to delete temporary key file");
            }
        }
    }
}

/// `Profile.private_key` is either literal PEM content or a path to a PEM
/// file, per the data model. Literal content is written to a unique,
/// mode-0600, short-lived file so it passes through the filesystem exactly
/// the way the original SDK's key material does, then read back and
/// deleted by the caller via `MaterializedKey::cleanup` once the signer has
/// parsed it. A path is used as-is; its lifetime belongs to the caller.
fn materialize_private_key(material: &str) -> SnatchResult<MaterializedKey> {
    if material.trim_start().starts_with("-----BEGIN") {
        let temp_path = std::env::temp_dir().join(format!("snatchd-key-{}.pem", uuid::Uuid::new_v4()));
        write_key_file(&temp_path, material)?;
        let contents = std::fs::read_to_string(&temp_path)?;
        Ok(MaterializedKey {
            pem: secrecy::SecretString::from(contents),
            temp_path: Some(temp_path),
        })
    } else {
        let contents = std::fs::read_to_string(material)?;
        Ok(MaterializedKey {
            pem: secrecy::SecretString::from(contents),
            temp_path: None,
        })
    }
}

#[cfg(unix)]
fn write_key_file(path: &std::path::Path, contents: &str) -> SnatchResult<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::write(path, contents)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn write_key_file(path: &std::path::Path, contents: &str) -> SnatchResult<()> {
    std::fs::write(path, contents)?;
    Ok(())
}

#[cfg(any(test, feature = "test-util"))]
impl ServiceClient {
    /// Constructs a client pointed at an arbitrary base URL, bypassing
    /// region-derived hostnames. Exists so other crates' tests can drive a
    /// `ServiceClient` against a `wiremock` server.
    pub fn for_testing(base_url: String, signer: Arc<RequestSigner>) -> ServiceClient {
        ServiceClient {
            http: reqwest::Client::new(),
            base_url,
            host: "test-host".to_string(),
            signer,
        }
    }
}

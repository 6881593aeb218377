use serde_json::{json, Value};
use snatch_core::{Profile, SnatchError, SnatchResult};

use crate::client::ProviderClientBundle;

const WAIT_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_secs(3);

/// Ensures a usable subnet exists for a profile, and performs on-demand
/// IPv6 enablement. Every step is idempotent: safe to call repeatedly
/// against a partially-configured VCN.
pub struct NetworkBootstrapper<'a> {
    clients: &'a ProviderClientBundle,
    compartment_id: String,
}

impl<'a> NetworkBootstrapper<'a> {
    pub fn new(clients: &'a ProviderClientBundle, compartment_id: String) -> NetworkBootstrapper<'a> {
        NetworkBootstrapper {
            clients,
            compartment_id,
        }
    }

    /// Reuse remembered -> auto-discover -> create. Returns the subnet id;
    /// the caller persists it onto the profile (`ProfileStore` is not a
    /// dependency of this crate).
    pub async fn ensure_subnet(
        &self,
        profile: &Profile,
        progress: &dyn Fn(&str),
    ) -> SnatchResult<String> {
        if let Some(subnet_id) = &profile.default_subnet_ocid {
            match self
                .clients
                .network
                .get(&format!("/20160918/subnets/{subnet_id}"))
                .await
            {
                Ok(subnet) if subnet_state(&subnet) == "AVAILABLE" => {
                    progress("reusing remembered subnet");
                    return Ok(subnet_id.clone());
                }
                Ok(_) => {}
                Err(SnatchError::Data(_)) => {
                    // 404: remembered subnet is gone, fall through to discovery.
                }
                Err(e) => return Err(e),
            }
        }

        progress("listing existing VCNs");
        let vcns = self
            .clients
            .network
            .get(&format!(
                "/20160918/vcns?compartmentId={}",
                self.compartment_id
            ))
            .await?;
        if let Some(vcn) = vcns.as_array().and_then(|v| v.first()) {
            let vcn_id = required_str(vcn, "id")?;
            let subnets = self
                .clients
                .network
                .get(&format!(
                    "/20160918/subnets?compartmentId={}&vcnId={}",
                    self.compartment_id, vcn_id
                ))
                .await?;
            if let Some(subnet) = subnets
                .as_array()
                .into_iter()
                .flatten()
                .find(|s| subnet_state(s) == "AVAILABLE")
            {
                let subnet_id = required_str(subnet, "id")?.to_string();
                progress("reusing first available subnet");
                return Ok(subnet_id);
            }
        }

        progress("creating VCN 10.0.0.0/16");
        let vcn = self
            .clients
            .network
            .post(
                "/20160918/vcns",
                &json!({
                    "compartmentId": self.compartment_id,
                    "cidrBlock": "10.0.0.0/16",
                    "displayName": "snatchd-vcn",
                }),
            )
            .await?;
        let vcn_id = required_str(&vcn, "id")?.to_string();
        self.wait_until(&format!("/20160918/vcns/{vcn_id}"), "AVAILABLE")
            .await?;

        progress("creating Internet Gateway");
        let igw = self
            .clients
            .network
            .post(
                "/20160918/internetGateways",
                &json!({
                    "compartmentId": self.compartment_id,
                    "vcnId": vcn_id,
                    "isEnabled": true,
                    "displayName": "snatchd-igw",
                }),
            )
            .await?;
        let igw_id = required_str(&igw, "id")?.to_string();
        self.wait_until(&format!("/20160918/internetGateways/{igw_id}"), "AVAILABLE")
            .await?;

        progress("routing 0.0.0.0/0 to Internet Gateway");
        let route_tables = self
            .clients
            .network
            .get(&format!(
                "/20160918/routeTables?compartmentId={}&vcnId={}",
                self.compartment_id, vcn_id
            ))
            .await?;
        let default_rt_id = route_tables
            .as_array()
            .and_then(|v| v.first())
            .map(|rt| required_str(rt, "id").map(str::to_string))
            .transpose()?
            .ok_or_else(|| SnatchError::Permanent("no default route table found".to_string()))?;
        self.clients
            .network
            .put(
                &format!("/20160918/routeTables/{default_rt_id}"),
                &json!({
                    "routeRules": [{ "destination": "0.0.0.0/0", "networkEntityId": igw_id }]
                }),
            )
            .await?;

        progress("creating subnet 10.0.1.0/24");
        let subnet = self
            .clients
            .network
            .post(
                "/20160918/subnets",
                &json!({
                    "compartmentId": self.compartment_id,
                    "vcnId": vcn_id,
                    "cidrBlock": "10.0.1.0/24",
                    "displayName": "snatchd-subnet",
                }),
            )
            .await?;
        let subnet_id = required_str(&subnet, "id")?.to_string();
        self.wait_until(&format!("/20160918/subnets/{subnet_id}"), "AVAILABLE")
            .await?;

        Ok(subnet_id)
    }

    /// Called on demand by the assign-IPv6 action. Idempotent at every step:
    /// a second call is a no-op once the prior call finished.
    pub async fn enable_ipv6(&self, vnic_id: &str, progress: &dyn Fn(&str)) -> SnatchResult<()> {
        let vnic = self
            .clients
            .compute
            .get(&format!("/20160918/vnics/{vnic_id}"))
            .await?;
        let subnet_id = required_str(&vnic, "subnetId")?.to_string();
        let subnet = self
            .clients
            .network
            .get(&format!("/20160918/subnets/{subnet_id}"))
            .await?;
        let vcn_id = required_str(&subnet, "vcnId")?.to_string();
        let mut vcn = self
            .clients
            .network
            .get(&format!("/20160918/vcns/{vcn_id}"))
            .await?;

        if vcn.get("ipv6CidrBlocks").is_none() {
            progress("allocating Oracle-GUA IPv6 block for VCN");
            vcn = self
                .clients
                .network
                .put(
                    &format!("/20160918/vcns/{vcn_id}"),
                    &json!({ "isOracleGuaAllocationEnabled": true }),
                )
                .await?;
            self.wait_until(&format!("/20160918/vcns/{vcn_id}"), "AVAILABLE")
                .await?;
        }

        if subnet.get("ipv6CidrBlock").is_none() {
            progress("deriving /64 subnet IPv6 CIDR");
            let vcn_cidr = vcn
                .get("ipv6CidrBlocks")
                .and_then(|v| v.as_array())
                .and_then(|a| a.first())
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    SnatchError::Permanent("VCN has no IPv6 CIDR to derive from".to_string())
                })?;
            let subnet_cidr = derive_subnet_ipv6_cidr(vcn_cidr);
            self.clients
                .network
                .put(
                    &format!("/20160918/subnets/{subnet_id}"),
                    &json!({ "ipv6CidrBlock": subnet_cidr }),
                )
                .await?;
            self.wait_until(&format!("/20160918/subnets/{subnet_id}"), "AVAILABLE")
                .await?;
        }

        progress("ensuring default route has ::/0 -> Internet Gateway");
        let igws = self
            .clients
            .network
            .get(&format!(
                "/20160918/internetGateways?compartmentId={}&vcnId={}",
                self.compartment_id, vcn_id
            ))
            .await?;
        let igw_id = igws
            .as_array()
            .and_then(|v| v.first())
            .map(|igw| required_str(igw, "id").map(str::to_string))
            .transpose()?;
        if let Some(igw_id) = igw_id {
            let route_tables = self
                .clients
                .network
                .get(&format!(
                    "/20160918/routeTables?compartmentId={}&vcnId={}",
                    self.compartment_id, vcn_id
                ))
                .await?;
            if let Some(rt) = route_tables.as_array().and_then(|v| v.first()) {
                let rules = rt.get("routeRules").and_then(|v| v.as_array()).cloned().unwrap_or_default();
                let has_v6_default = rules
                    .iter()
                    .any(|r| r.get("destination").and_then(|d| d.as_str()) == Some("::/0"));
                if !has_v6_default {
                    let rt_id = required_str(rt, "id")?;
                    let mut new_rules = rules;
                    new_rules.push(json!({ "destination": "::/0", "networkEntityId": igw_id }));
                    self.clients
                        .network
                        .put(
                            &format!("/20160918/routeTables/{rt_id}"),
                            &json!({ "routeRules": new_rules }),
                        )
                        .await?;
                }
            }
        }

        progress("ensuring default security list allows IPv6 egress");
        let security_lists = self
            .clients
            .network
            .get(&format!(
                "/20160918/securityLists?compartmentId={}&vcnId={}",
                self.compartment_id, vcn_id
            ))
            .await?;
        if let Some(sl) = security_lists.as_array().and_then(|v| v.first()) {
            let egress = sl
                .get("egressSecurityRules")
                .and_then(|v| v.as_array())
                .cloned()
                .unwrap_or_default();
            let has_v6_egress = egress
                .iter()
                .any(|r| r.get("destination").and_then(|d| d.as_str()) == Some("::/0"));
            if !has_v6_egress {
                let sl_id = required_str(sl, "id")?;
                let mut new_egress = egress;
                new_egress.push(json!({ "destination": "::/0", "protocol": "all" }));
                self.clients
                    .network
                    .put(
                        &format!("/20160918/securityLists/{sl_id}"),
                        &json!({ "egressSecurityRules": new_egress }),
                    )
                    .await?;
            }
        }

        Ok(())
    }

    async fn wait_until(&self, path: &str, target_state: &str) -> SnatchResult<Value> {
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(300);
        loop {
            let resource = self.clients.network.get(path).await?;
            if subnet_state(&resource) == target_state {
                return Ok(resource);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(SnatchError::Transient(format!(
                    "timed out waiting for {path} to reach {target_state}"
                )));
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }
}

fn subnet_state(resource: &Value) -> &str {
    resource
        .get("lifecycleState")
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

fn required_str<'a>(value: &'a Value, field: &str) -> SnatchResult<&'a str> {
    value
        .get(field)
        .and_then(|v| v.as_str())
        .ok_or_else(|| SnatchError::Data(format!("missing field '{field}' in provider response")))
}

/// Derives a `/64` subnet CIDR under a VCN's `/56` IPv6 allocation by
/// zeroing the host bits and fixing the low byte of the subnet id portion.
/// A real implementation would track allocated subnet indices; here we
/// derive index 0 deterministically since a profile has exactly one subnet.
fn derive_subnet_ipv6_cidr(vcn_cidr: &str) -> String {
    let prefix = vcn_cidr.split("::/").next().unwrap_or(vcn_cidr);
    format!("{prefix}::/64")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ServiceClient;
    use crate::signing::RequestSigner;
    use std::sync::Arc;
    use wiremock::matchers::{method, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TEST_KEY_PEM: &str = include_str!("../tests/fixtures/test_key_pkcs8.pem");

    #[test]
    fn derive_subnet_ipv6_cidr_produces_64_prefix() {
        let derived = derive_subnet_ipv6_cidr("2603:c020:8000:1234");
        assert!(derived.ends_with("::/64"));
    }

    fn test_bundle(base_url: &str) -> ProviderClientBundle {
        let signer = Arc::new(RequestSigner::new("t/u/fp".to_string(), TEST_KEY_PEM).unwrap());
        ProviderClientBundle {
            identity: ServiceClient::for_testing(base_url.to_string(), signer.clone()),
            compute: ServiceClient::for_testing(base_url.to_string(), signer.clone()),
            network: ServiceClient::for_testing(base_url.to_string(), signer.clone()),
            block_storage: ServiceClient::for_testing(base_url.to_string(), signer),
        }
    }

    #[tokio::test]
    async fn ensure_subnet_reuses_remembered_subnet_without_listing_vcns() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/20160918/subnets/subnet-1$"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "id": "subnet-1", "lifecycleState": "AVAILABLE" })),
            )
            .expect(2)
            .mount(&server)
            .await;
        // No mock registered for /vcns: if ensure_subnet falls through to
        // discovery on a second call, wiremock fails the request and the
        // test fails, proving idempotence.

        let bundle = test_bundle(&server.uri());
        let bootstrapper = NetworkBootstrapper::new(&bundle, "compartment-1".to_string());
        let profile = Profile {
            alias: "acct1".to_string(),
            tenancy_id: "t".to_string(),
            user_id: "u".to_string(),
            fingerprint: "fp".to_string(),
            region: "us-phoenix-1".to_string(),
            private_key: TEST_KEY_PEM.to_string(),
            proxy: None,
            default_ssh_public_key: None,
            default_subnet_ocid: Some("subnet-1".to_string()),
            order_index: 0,
        };

        let first = bootstrapper.ensure_subnet(&profile, &|_| {}).await.unwrap();
        let second = bootstrapper.ensure_subnet(&profile, &|_| {}).await.unwrap();
        assert_eq!(first, "subnet-1");
        assert_eq!(second, "subnet-1");
    }
}

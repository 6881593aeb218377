//! Builds the enriched instance list returned by `GET /{alias}/instances`:
//! raw OCI instance records augmented with the fields the panel actually
//! wants (public IP, IPv6, boot-volume size, primary VNIC id) that OCI only
//! exposes through separate calls.

use serde::Serialize;
use serde_json::Value;
use snatch_core::SnatchResult;
use snatch_provider::ProviderClientBundle;

#[derive(Debug, Clone, Serialize)]
pub struct InstanceView {
    pub id: String,
    pub display_name: String,
    pub shape: String,
    pub lifecycle_state: String,
    pub availability_domain: String,
    pub vnic_id: Option<String>,
    pub public_ip: Option<String>,
    pub ipv6: Option<String>,
    pub boot_volume_size_gbs: Option<f64>,
}

pub async fn list_instances(
    clients: &ProviderClientBundle,
    compartment_id: &str,
) -> SnatchResult<Vec<InstanceView>> {
    let response = clients
        .compute
        .get(&format!("/20160918/instances?compartmentId={compartment_id}"))
        .await?;

    let mut views = Vec::new();
    for instance in response.as_array().into_iter().flatten() {
        if instance.get("lifecycleState").and_then(|v| v.as_str()) == Some("TERMINATED") {
            continue;
        }
        views.push(build_view(clients, compartment_id, instance).await);
    }
    Ok(views)
}

async fn build_view(clients: &ProviderClientBundle, compartment_id: &str, instance: &Value) -> InstanceView {
    let id = instance.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_string();
    let display_name = instance
        .get("displayName")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let shape = instance.get("shape").and_then(|v| v.as_str()).unwrap_or_default().to_string();
    let lifecycle_state = instance
        .get("lifecycleState")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let availability_domain = instance
        .get("availabilityDomain")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    let vnic_id = primary_vnic_id(clients, compartment_id, &id).await;
    let (public_ip, ipv6) = match &vnic_id {
        Some(vnic_id) => vnic_fields(clients, vnic_id).await,
        None => (None, None),
    };
    let boot_volume_size_gbs = boot_volume_size(clients, compartment_id, &id).await;

    InstanceView {
        id,
        display_name,
        shape,
        lifecycle_state,
        availability_domain,
        vnic_id,
        public_ip,
        ipv6,
        boot_volume_size_gbs,
    }
}

async fn primary_vnic_id(clients: &ProviderClientBundle, compartment_id: &str, instance_id: &str) -> Option<String> {
    let attachments = clients
        .compute
        .get(&format!(
            "/20160918/vnicAttachments?compartmentId={compartment_id}&instanceId={instance_id}"
        ))
        .await
        .ok()?;
    attachments
        .as_array()?
        .first()?
        .get("vnicId")?
        .as_str()
        .map(str::to_string)
}

async fn vnic_fields(clients: &ProviderClientBundle, vnic_id: &str) -> (Option<String>, Option<String>) {
    let vnic = match clients.network.get(&format!("/20160918/vnics/{vnic_id}")).await {
        Ok(v) => v,
        Err(_) => return (None, None),
    };
    let public_ip = vnic.get("publicIp").and_then(|v| v.as_str()).map(str::to_string);

    let ipv6 = clients
        .network
        .get(&format!("/20160918/ipv6?vnicId={vnic_id}"))
        .await
        .ok()
        .and_then(|resp| resp.as_array().and_then(|a| a.first().cloned()))
        .and_then(|rec| rec.get("ipAddress").and_then(|v| v.as_str()).map(str::to_string));

    (public_ip, ipv6)
}

async fn boot_volume_size(clients: &ProviderClientBundle, compartment_id: &str, instance_id: &str) -> Option<f64> {
    let attachments = clients
        .compute
        .get(&format!(
            "/20160918/bootVolumeAttachments?compartmentId={compartment_id}&instanceId={instance_id}"
        ))
        .await
        .ok()?;
    let boot_volume_id = attachments
        .as_array()?
        .first()?
        .get("bootVolumeId")?
        .as_str()?
        .to_string();
    let volume = clients
        .block_storage
        .get(&format!("/20160918/bootVolumes/{boot_volume_id}"))
        .await
        .ok()?;
    volume.get("sizeInGBs").and_then(|v| v.as_f64())
}

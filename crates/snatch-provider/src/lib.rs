pub mod client;
pub mod network;
pub mod signing;

pub use client::{ProviderClientBundle, Service, ServiceClient};
pub use network::NetworkBootstrapper;
pub use signing::RequestSigner;

use snatch_core::SnatchResult;

/// Ordered list of availability domain names for the tenancy, used by the
/// engine's round-robin rotation.
pub async fn list_availability_domains(
    identity: &ServiceClient,
    compartment_id: &str,
) -> SnatchResult<Vec<String>> {
    let response = identity
        .get(&format!(
            "/20160918/availabilityDomains?compartmentId={compartment_id}"
        ))
        .await?;
    let ads = response
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|ad| ad.get("name").and_then(|v| v.as_str()).map(str::to_string))
        .collect();
    Ok(ads)
}

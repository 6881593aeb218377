use snatch_core::{SnatchError, SnatchResult};
use snatch_provider::ServiceClient;

/// The Always Free AMD shape; the only shape subject to the pre-flight
/// quota check.
pub const MICRO_SHAPE: &str = "VM.Standard.E2.1.Micro";

/// Synchronous pre-flight check run in the request handler before any task
/// row is created: refuses a launch that would push the count of
/// non-terminated Micro-shape instances above `quota`.
pub async fn check_micro_shape_quota(
    compute: &ServiceClient,
    compartment_id: &str,
    requested_count: u32,
    quota: u32,
) -> SnatchResult<()> {
    let existing = count_non_terminated_micro_instances(compute, compartment_id).await?;
    if existing + requested_count > quota {
        return Err(SnatchError::Validation(format!(
            "launching {requested_count} more {MICRO_SHAPE} instance(s) would push the total to \
             {}, above the limit of {quota} (currently {existing} non-terminated)",
            existing + requested_count
        )));
    }
    Ok(())
}

async fn count_non_terminated_micro_instances(
    compute: &ServiceClient,
    compartment_id: &str,
) -> SnatchResult<u32> {
    let response = compute
        .get(&format!(
            "/20160918/instances?compartmentId={compartment_id}&shape={MICRO_SHAPE}"
        ))
        .await?;
    let count = response
        .as_array()
        .into_iter()
        .flatten()
        .filter(|instance| {
            !matches!(
                instance.get("lifecycleState").and_then(|v| v.as_str()),
                Some("TERMINATED") | Some("TERMINATING")
            )
        })
        .count();
    Ok(count as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use snatch_provider::RequestSigner;
    use std::sync::Arc;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TEST_KEY_PEM: &str = include_str!("../../snatch-provider/tests/fixtures/test_key_pkcs8.pem");

    async fn compute_client_with(instances: serde_json::Value) -> (MockServer, ServiceClient) {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/20160918/instances"))
            .respond_with(ResponseTemplate::new(200).set_body_json(instances))
            .mount(&server)
            .await;
        let signer = Arc::new(RequestSigner::new("t/u/fp".to_string(), TEST_KEY_PEM).unwrap());
        let client = ServiceClient::for_testing(server.uri(), signer);
        (server, client)
    }

    #[tokio::test]
    async fn allows_launch_within_quota() {
        let (_server, compute) = compute_client_with(json!([
            { "lifecycleState": "RUNNING" }
        ]))
        .await;
        check_micro_shape_quota(&compute, "compartment-1", 1, 2)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn refuses_launch_that_would_exceed_quota() {
        let (_server, compute) = compute_client_with(json!([
            { "lifecycleState": "RUNNING" },
            { "lifecycleState": "RUNNING" }
        ]))
        .await;
        let err = check_micro_shape_quota(&compute, "compartment-1", 1, 2)
            .await
            .unwrap_err();
        assert!(matches!(err, SnatchError::Validation(_)));
    }

    #[tokio::test]
    async fn terminated_instances_do_not_count_against_quota() {
        let (_server, compute) = compute_client_with(json!([
            { "lifecycleState": "TERMINATED" },
            { "lifecycleState": "TERMINATED" }
        ]))
        .await;
        check_micro_shape_quota(&compute, "compartment-1", 2, 2)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn terminating_instances_do_not_count_against_quota() {
        let (_server, compute) = compute_client_with(json!([
            { "lifecycleState": "TERMINATING" },
            { "lifecycleState": "TERMINATING" }
        ]))
        .await;
        check_micro_shape_quota(&compute, "compartment-1", 2, 2)
            .await
            .unwrap();
    }
}

use rsa::pkcs8::DecodePrivateKey;
use rsa::{Pkcs1v15Sign, RsaPrivateKey};
use sha2::{Digest, Sha256};
use snatch_core::{SnatchError, SnatchResult};

/// Signs outbound requests the way OCI's API expects: a canonical string
/// built from a fixed header set, signed RSA-SHA256/PKCS#1v1.5, carried in
/// an `Authorization: Signature ...` header. Deterministic (no blinding
/// randomness needed for PKCS#1v1.5), so the same request always produces
/// the same signature.
pub struct RequestSigner {
    key_id: String,
    private_key: RsaPrivateKey,
}

impl RequestSigner {
    /// `key_id` is `"<tenancy>/<user>/<fingerprint>"`.
    pub fn new(key_id: String, pem: &str) -> SnatchResult<RequestSigner> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
            .map_err(|e| SnatchError::Credential(format!("invalid private key: {e}")))?;
        Ok(RequestSigner {
            key_id,
            private_key,
        })
    }

    /// Returns the headers to attach to the request, including the
    /// `Authorization` header itself. `body` is `None` for GET/DELETE.
    pub fn sign(
        &self,
        method: &str,
        request_target: &str,
        host: &str,
        body: Option<&[u8]>,
    ) -> SnatchResult<Vec<(&'static str, String)>> {
        let date = httpdate_now();
        let mut headers = vec![
            ("date", date.clone()),
            ("host", host.to_string()),
        ];

        let mut signed_headers = vec!["(request-target)", "host", "date"];
        let request_target_line = format!("{} {}", method.to_lowercase(), request_target);

        let content_sha256;
        let content_length;
        if let Some(body) = body {
            content_sha256 = base64::Engine::encode(
                &base64::engine::general_purpose::STANDARD,
                Sha256::digest(body),
            );
            content_length = body.len().to_string();
            headers.push(("x-content-sha256", content_sha256.clone()));
            headers.push(("content-type", "application/json".to_string()));
            headers.push(("content-length", content_length.clone()));
            signed_headers.extend(["x-content-sha256", "content-type", "content-length"]);
        }

        let mut signing_lines = vec![format!("(request-target): {request_target_line}")];
        for (name, value) in headers.iter() {
            signing_lines.push(format!("{name}: {value}"));
        }
        let signing_string = signing_lines.join("\n");

        let digest = Sha256::digest(signing_string.as_bytes());
        let signature = self
            .private_key
            .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
            .map_err(|e| SnatchError::Credential(format!("signing failed: {e}")))?;
        let signature_b64 =
            base64::Engine::encode(&base64::engine::general_purpose::STANDARD, signature);

        let authorization = format!(
            "Signature version=\"1\",keyId=\"{}\",algorithm=\"rsa-sha256\",headers=\"{}\",signature=\"{}\"",
            self.key_id,
            signed_headers.join(" "),
            signature_b64
        );

        headers.push(("authorization", authorization));
        Ok(headers)
    }
}

fn httpdate_now() -> String {
    chrono::Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_KEY_PEM: &str = include_str!("../tests/fixtures/test_key_pkcs8.pem");

    #[test]
    fn sign_produces_authorization_header_with_expected_fields() {
        let signer = RequestSigner::new("tenancy1/user1/fp1".to_string(), TEST_KEY_PEM).unwrap();
        let headers = signer
            .sign("GET", "/20160918/users/ocid1.user.1", "identity.us-phoenix-1.oraclecloud.com", None)
            .unwrap();
        let auth = headers
            .iter()
            .find(|(name, _)| *name == "authorization")
            .unwrap();
        assert!(auth.1.contains("keyId=\"tenancy1/user1/fp1\""));
        assert!(auth.1.contains("algorithm=\"rsa-sha256\""));
        assert!(!auth.1.contains("x-content-sha256"));
    }

    #[test]
    fn sign_with_body_includes_content_headers() {
        let signer = RequestSigner::new("tenancy1/user1/fp1".to_string(), TEST_KEY_PEM).unwrap();
        let headers = signer
            .sign(
                "POST",
                "/20160918/instances",
                "iaas.us-phoenix-1.oraclecloud.com",
                Some(b"{}"),
            )
            .unwrap();
        assert!(headers.iter().any(|(n, _)| *n == "x-content-sha256"));
        let auth = headers
            .iter()
            .find(|(name, _)| *name == "authorization")
            .unwrap();
        assert!(auth.1.contains("x-content-sha256"));
    }
}

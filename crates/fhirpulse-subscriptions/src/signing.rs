//! Webhook request signing.
//!
//! The signature is the lowercase hex HMAC-SHA256 of the exact request body
//! keyed by the subscription secret.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::config::HeaderPolicy;
use crate::error::{SubscriptionError, SubscriptionResult};

type HmacSha256 = Hmac<Sha256>;

pub const CONTENT_TYPE_FHIR_JSON: &str = "application/fhir+json";

pub fn sign_payload(payload: &str, secret: &str) -> SubscriptionResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| SubscriptionError::Delivery(format!("invalid signing key: {e}")))?;
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Headers for one webhook request.
///
/// Without a secret the content type is sent with every custom header.
/// With a secret the signature is added and `policy` decides whether custom
/// headers are still sent.
pub fn build_headers(
    custom: &[(String, String)],
    secret: Option<&str>,
    body: &str,
    policy: HeaderPolicy,
    signature_header: &str,
) -> SubscriptionResult<Vec<(String, String)>> {
    let mut headers = vec![("Content-Type".to_string(), CONTENT_TYPE_FHIR_JSON.to_string())];

    let Some(secret) = secret else {
        merge(&mut headers, custom);
        return Ok(headers);
    };

    headers.push((signature_header.to_string(), sign_payload(body, secret)?));
    if policy == HeaderPolicy::Merge {
        merge(&mut headers, custom);
    }
    Ok(headers)
}

fn merge(headers: &mut Vec<(String, String)>, custom: &[(String, String)]) {
    for (name, value) in custom {
        match headers.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(name)) {
            Some(existing) => existing.1 = value.clone(),
            None => headers.push((name.clone(), value.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn custom() -> Vec<(String, String)> {
        vec![
            ("Authorization".into(), "Bearer abc".into()),
            ("content-type".into(), "application/json".into()),
        ]
    }

    #[test]
    fn signs_with_hex_hmac_sha256() {
        // RFC 4231 test case 2
        let sig = sign_payload("what do ya want for nothing?", "Jefe").unwrap();
        assert_eq!(
            sig,
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn unsigned_request_sends_custom_headers() {
        let headers = build_headers(
            &custom(),
            None,
            "{}",
            HeaderPolicy::SignatureSupersedes,
            "X-Signature",
        )
        .unwrap();
        assert_eq!(
            headers,
            vec![
                ("Content-Type".into(), "application/json".into()),
                ("Authorization".into(), "Bearer abc".into()),
            ]
        );
    }

    #[test]
    fn signature_supersedes_custom_headers() {
        let headers = build_headers(
            &custom(),
            Some("secret"),
            "{}",
            HeaderPolicy::SignatureSupersedes,
            "X-Signature",
        )
        .unwrap();
        assert_eq!(headers.len(), 2);
        assert_eq!(headers[0].1, CONTENT_TYPE_FHIR_JSON);
        assert_eq!(headers[1].0, "X-Signature");
        assert_eq!(headers[1].1, sign_payload("{}", "secret").unwrap());
    }

    #[test]
    fn merge_policy_keeps_custom_headers_with_signature() {
        let headers =
            build_headers(&custom(), Some("secret"), "{}", HeaderPolicy::Merge, "X-Hub-Sig")
                .unwrap();
        let names: Vec<_> = headers.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["Content-Type", "X-Hub-Sig", "Authorization"]);
    }
}

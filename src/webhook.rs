//! GitHub webhook signature verification.
//!
//! Grounded in the `hmac`+`sha2` pairing used for webhook verification
//! elsewhere in the pack: HMAC-SHA256 over the raw request body,
//! compared against the hex-encoded `x-hub-signature-256` header with a
//! constant-time equality check so the comparison itself can't leak the
//! secret.

use crate::config::WebhookConfig;
use crate::{AgentComError, Result};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, serde::Deserialize)]
pub struct PushEvent {
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub repository: Repository,
}

#[derive(Debug, serde::Deserialize)]
pub struct Repository {
    pub full_name: String,
}

/// Verifies `signature_header` (the raw `x-hub-signature-256` value,
/// including its `sha256=` prefix) against `body` using the configured
/// shared secret. Returns an error if the secret isn't configured, the
/// header is malformed, or the signature doesn't match.
pub fn verify_signature(config: &WebhookConfig, body: &[u8], signature_header: &str) -> Result<()> {
    let secret = config
        .github_secret
        .as_ref()
        .ok_or_else(|| AgentComError::Configuration("no github webhook secret configured".to_string()))?;

    let hex_sig = signature_header
        .strip_prefix("sha256=")
        .ok_or_else(|| AgentComError::Auth("malformed signature header".to_string()))?;
    let expected_bytes = hex::decode(hex_sig).map_err(|_| AgentComError::Auth("non-hex signature".to_string()))?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| AgentComError::Configuration(format!("invalid webhook secret: {e}")))?;
    mac.update(body);
    let computed = mac.finalize().into_bytes();

    if computed.as_slice().ct_eq(&expected_bytes).into() {
        Ok(())
    } else {
        Err(AgentComError::Auth("webhook signature mismatch".to_string()))
    }
}

/// A verified push touching a registered repository nudges the hub
/// toward `improving`; anything else is accepted but ignored.
pub fn should_trigger_improving(config: &WebhookConfig, event: &PushEvent) -> bool {
    config.registered_repos.iter().any(|r| r == &event.repository.full_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(secret: &str, repos: &[&str]) -> WebhookConfig {
        WebhookConfig {
            github_secret: Some(secret.to_string()),
            registered_repos: repos.iter().map(|r| r.to_string()).collect(),
        }
    }

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn test_valid_signature_verifies() {
        let cfg = config("shared-secret", &[]);
        let body = b"{\"ref\":\"refs/heads/main\"}";
        let sig = sign("shared-secret", body);
        assert!(verify_signature(&cfg, body, &sig).is_ok());
    }

    #[test]
    fn test_tampered_body_rejected() {
        let cfg = config("shared-secret", &[]);
        let sig = sign("shared-secret", b"original");
        assert!(verify_signature(&cfg, b"tampered", &sig).is_err());
    }

    #[test]
    fn test_registered_repo_triggers_improving() {
        let cfg = config("s", &["org/repo"]);
        let event = PushEvent {
            git_ref: "refs/heads/main".to_string(),
            repository: Repository {
                full_name: "org/repo".to_string(),
            },
        };
        assert!(should_trigger_improving(&cfg, &event));
    }

    #[test]
    fn test_unregistered_repo_does_not_trigger() {
        let cfg = config("s", &["org/other"]);
        let event = PushEvent {
            git_ref: "refs/heads/main".to_string(),
            repository: Repository {
                full_name: "org/repo".to_string(),
            },
        };
        assert!(!should_trigger_improving(&cfg, &event));
    }
}

//! Bearer token generation and persistence for agent onboarding
//! (`POST /api/onboard/register`).

use crate::AgentComError;
use rand::{distributions::Alphanumeric, thread_rng, Rng};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

/// 64 base62 characters, ~380 bits of entropy.
pub const TOKEN_LENGTH: usize = 64;

pub const TOKEN_FILE: &str = ".agentcom-bearer-token";

pub fn generate_onboarding_token() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LENGTH)
        .map(char::from)
        .collect()
}

pub fn save_token_to_file(token: &str) -> Result<(), AgentComError> {
    fs::write(TOKEN_FILE, token)
        .map_err(|e| AgentComError::Configuration(format!("failed to write token file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(TOKEN_FILE)
            .map_err(|e| AgentComError::Configuration(format!("failed to get file metadata: {e}")))?
            .permissions();
        perms.set_mode(0o600);
        fs::set_permissions(TOKEN_FILE, perms)
            .map_err(|e| AgentComError::Configuration(format!("failed to set file permissions: {e}")))?;
    }

    info!("bearer token saved to {}", TOKEN_FILE);
    Ok(())
}

pub fn load_token_from_file() -> Result<Option<String>, AgentComError> {
    if !Path::new(TOKEN_FILE).exists() {
        return Ok(None);
    }

    let token = fs::read_to_string(TOKEN_FILE)
        .map_err(|e| AgentComError::Configuration(format!("failed to read token file: {e}")))?
        .trim()
        .to_string();

    if token.len() != TOKEN_LENGTH || !token.chars().all(|c| c.is_alphanumeric()) {
        warn!("token file at {} has unexpected format", TOKEN_FILE);
        return Err(AgentComError::Configuration(
            "invalid bearer token format in file".to_string(),
        ));
    }

    Ok(Some(token))
}

/// Uses the configured token if one is set, otherwise loads (or
/// generates and persists) a file-based fallback so a fresh deployment
/// has a usable token without manual setup.
pub fn ensure_bearer_token_exists(configured: Option<&str>) -> Result<String, AgentComError> {
    if let Some(token) = configured {
        if !token.trim().is_empty() {
            return Ok(token.to_string());
        }
    }

    match load_token_from_file()? {
        Some(token) => Ok(token),
        None => {
            let token = generate_onboarding_token();
            save_token_to_file(&token)?;
            info!("generated a new bearer token");
            Ok(token)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_generation_length_and_uniqueness() {
        let a = generate_onboarding_token();
        let b = generate_onboarding_token();
        assert_eq!(a.len(), TOKEN_LENGTH);
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_alphanumeric()));
    }

    #[test]
    fn test_configured_token_takes_priority() {
        let token = ensure_bearer_token_exists(Some("configured-token-value")).unwrap();
        assert_eq!(token, "configured-token-value");
    }
}

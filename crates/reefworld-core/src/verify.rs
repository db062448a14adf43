//! Legacy verification boundary — the external token-issuing service that
//! turns an opaque API key into a verified display name. Consumed as a
//! single call; everything behind the HTTP endpoint is someone else's
//! problem.

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::info;

use crate::config::Config;

pub const VERIFY_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LegacyOutcome {
    pub valid: bool,
    pub agent_name: Option<String>,
    pub persistent_id: Option<String>,
    pub error: Option<String>,
    pub claim_url: Option<String>,
}

fn build_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(VERIFY_TIMEOUT_SECS))
        .build()
        .expect("Failed to build HTTP client")
}

/// Ask the legacy service to verify an API key. Bounded by the client
/// timeout; a transport failure or timeout surfaces as `Err` and the caller
/// rejects the identify instead of hanging.
pub async fn verify_legacy_agent(config: &Config, api_key: &str) -> Result<LegacyOutcome> {
    let url = config
        .legacy_verify_url
        .as_deref()
        .context("legacy_verify_url not configured")?;

    info!("Verifying agent against legacy service");
    let client = build_client();
    let response = client
        .post(url)
        .json(&serde_json::json!({ "apiKey": api_key }))
        .send()
        .await
        .context("Legacy verification request failed")?;

    let ok = response.status().is_success();
    let body: serde_json::Value = response
        .json()
        .await
        .context("Legacy verification returned invalid JSON")?;
    Ok(parse_outcome(ok, body))
}

/// Interpret the service reply. A non-2xx status is invalid no matter what
/// the body claims.
pub fn parse_outcome(ok: bool, body: serde_json::Value) -> LegacyOutcome {
    let mut outcome: LegacyOutcome = serde_json::from_value(body).unwrap_or_default();
    if !ok {
        outcome.valid = false;
    }
    if !outcome.valid && outcome.error.is_none() {
        outcome.error = Some("Verification service rejected the key".to_string());
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_valid_reply() {
        let outcome = parse_outcome(
            true,
            json!({"valid": true, "agentName": "Clacker", "persistentId": "mb_42"}),
        );
        assert!(outcome.valid);
        assert_eq!(outcome.agent_name.as_deref(), Some("Clacker"));
        assert_eq!(outcome.persistent_id.as_deref(), Some("mb_42"));
    }

    #[test]
    fn test_parse_rejection_with_claim_url() {
        let outcome = parse_outcome(
            true,
            json!({"valid": false, "error": "not claimed", "claimUrl": "https://x/claim/1"}),
        );
        assert!(!outcome.valid);
        assert_eq!(outcome.error.as_deref(), Some("not claimed"));
        assert_eq!(outcome.claim_url.as_deref(), Some("https://x/claim/1"));
    }

    #[test]
    fn test_non_2xx_is_invalid_regardless_of_body() {
        let outcome = parse_outcome(false, json!({"valid": true}));
        assert!(!outcome.valid);
        assert!(outcome.error.is_some());
    }
}

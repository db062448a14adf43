//! Self-hosted agent registry — API keys are issued once, stored only as
//! sha256 digests, and become usable after an out-of-band claim step.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{error, info, warn};
use uuid::Uuid;

const API_KEY_PREFIX: &str = "rw_";

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn key_digest(api_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(api_key.as_bytes());
    to_hex(&hasher.finalize())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRecord {
    /// Durable identity; ownership, balances and stats key off this.
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub key_digest: String,
    pub claimed: bool,
    /// Kept after claiming so a replayed claim link reports already-claimed.
    #[serde(default)]
    pub claim_token: Option<String>,
    pub created_at: i64,
    #[serde(default)]
    pub claimed_at: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct Registration {
    /// Returned to the caller exactly once; only the digest survives.
    pub api_key: String,
    pub claim_token: String,
    pub claim_url: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedAgent {
    pub id: String,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verification {
    Valid(VerifiedAgent),
    /// Key is known but its human has not completed the claim step.
    Unclaimed { agent_name: String, claim_token: String },
    UnknownKey,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    Claimed { agent_name: String },
    AlreadyClaimed { agent_name: String },
    UnknownToken,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatus {
    pub registered: bool,
    pub claimed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
}

#[derive(Debug)]
pub struct AgentRegistry {
    path: PathBuf,
    agents: Vec<AgentRecord>,
}

impl AgentRegistry {
    /// Load the registry, or start empty when the file is missing or
    /// unreadable.
    pub fn load(path: &Path) -> Self {
        let agents = if path.is_file() {
            match std::fs::read_to_string(path) {
                Ok(content) => match serde_json::from_str::<Vec<AgentRecord>>(&content) {
                    Ok(agents) => {
                        info!("Loaded {} registered agents", agents.len());
                        agents
                    }
                    Err(e) => {
                        warn!("Agent registry unreadable ({}), starting empty", e);
                        Vec::new()
                    }
                },
                Err(e) => {
                    warn!("Failed to read agent registry ({}), starting empty", e);
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };
        Self {
            path: path.to_path_buf(),
            agents,
        }
    }

    /// Eager write; the registry is small and a lost key record is worse
    /// than a synchronous write.
    fn save(&self) {
        let doc = match serde_json::to_string_pretty(&self.agents) {
            Ok(doc) => doc,
            Err(e) => {
                error!("Failed to serialize agent registry: {}", e);
                return;
            }
        };
        if let Err(e) = std::fs::write(&self.path, doc) {
            error!("Failed to save agent registry: {}", e);
        }
    }

    pub fn register(
        &mut self,
        name: &str,
        description: &str,
        base_url: &str,
        now: i64,
    ) -> Registration {
        let key_bytes: [u8; 24] = rand::random();
        let api_key = format!("{}{}", API_KEY_PREFIX, to_hex(&key_bytes));
        let token_bytes: [u8; 16] = rand::random();
        let claim_token = to_hex(&token_bytes);

        self.agents.push(AgentRecord {
            id: format!("agent_{}", Uuid::new_v4()),
            name: name.to_string(),
            description: description.to_string(),
            key_digest: key_digest(&api_key),
            claimed: false,
            claim_token: Some(claim_token.clone()),
            created_at: now,
            claimed_at: None,
        });
        self.save();
        info!("Registered agent '{}'", name);

        Registration {
            api_key,
            claim_url: format!("{}/claim/{}", base_url.trim_end_matches('/'), claim_token),
            claim_token,
        }
    }

    pub fn claim(&mut self, token: &str, now: i64) -> ClaimOutcome {
        if let Some(agent) = self
            .agents
            .iter_mut()
            .find(|a| a.claim_token.as_deref() == Some(token))
        {
            if agent.claimed {
                return ClaimOutcome::AlreadyClaimed {
                    agent_name: agent.name.clone(),
                };
            }
            agent.claimed = true;
            agent.claimed_at = Some(now);
            let name = agent.name.clone();
            self.save();
            info!("Agent claimed: {}", name);
            return ClaimOutcome::Claimed { agent_name: name };
        }
        ClaimOutcome::UnknownToken
    }

    pub fn verify(&self, api_key: &str) -> Verification {
        let digest = key_digest(api_key);
        match self.agents.iter().find(|a| a.key_digest == digest) {
            Some(agent) if agent.claimed => Verification::Valid(VerifiedAgent {
                id: agent.id.clone(),
                display_name: agent.name.clone(),
            }),
            Some(agent) => Verification::Unclaimed {
                agent_name: agent.name.clone(),
                claim_token: agent.claim_token.clone().unwrap_or_default(),
            },
            None => Verification::UnknownKey,
        }
    }

    pub fn status(&self, api_key: &str) -> AgentStatus {
        let digest = key_digest(api_key);
        match self.agents.iter().find(|a| a.key_digest == digest) {
            Some(agent) => AgentStatus {
                registered: true,
                claimed: agent.claimed,
                agent_name: Some(agent.name.clone()),
            },
            None => AgentStatus {
                registered: false,
                claimed: false,
                agent_name: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(dir: &tempfile::TempDir) -> AgentRegistry {
        AgentRegistry::load(&dir.path().join("agents.json"))
    }

    #[test]
    fn test_register_claim_verify_flow() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = registry(&dir);

        let issued = reg.register("Clacker", "a test agent", "http://localhost:8080", 1);
        assert!(issued.api_key.starts_with("rw_"));
        assert!(issued.claim_url.ends_with(&issued.claim_token));

        // Unclaimed keys verify to a claim hint, not a session.
        match reg.verify(&issued.api_key) {
            Verification::Unclaimed { claim_token, .. } => {
                assert_eq!(claim_token, issued.claim_token)
            }
            other => panic!("expected unclaimed, got {:?}", other),
        }

        assert_eq!(
            reg.claim(&issued.claim_token, 2),
            ClaimOutcome::Claimed {
                agent_name: "Clacker".into()
            }
        );
        // Claiming twice is idempotent.
        assert_eq!(
            reg.claim(&issued.claim_token, 3),
            ClaimOutcome::AlreadyClaimed {
                agent_name: "Clacker".into()
            }
        );

        let first = match reg.verify(&issued.api_key) {
            Verification::Valid(agent) => agent,
            other => panic!("expected valid, got {:?}", other),
        };
        // The persistent id is stable across verifies.
        let second = match reg.verify(&issued.api_key) {
            Verification::Valid(agent) => agent,
            other => panic!("expected valid, got {:?}", other),
        };
        assert_eq!(first.id, second.id);
        assert!(first.id.starts_with("agent_"));
    }

    #[test]
    fn test_unknown_key_and_token() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = registry(&dir);
        assert_eq!(reg.verify("rw_bogus"), Verification::UnknownKey);
        assert_eq!(reg.claim("bogus", 1), ClaimOutcome::UnknownToken);
        assert!(!reg.status("rw_bogus").registered);
    }

    #[test]
    fn test_registry_persists_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let issued = {
            let mut reg = registry(&dir);
            let issued = reg.register("Snapper", "", "http://localhost:8080", 1);
            reg.claim(&issued.claim_token, 2);
            issued
        };

        let reg = registry(&dir);
        match reg.verify(&issued.api_key) {
            Verification::Valid(agent) => assert_eq!(agent.display_name, "Snapper"),
            other => panic!("expected valid after reload, got {:?}", other),
        }
        let status = reg.status(&issued.api_key);
        assert!(status.registered && status.claimed);
    }
}

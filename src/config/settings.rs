use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub chain_id: u64,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    pub validator: ValidatorConfig,
    pub consensus: ConsensusConfig,
    pub evidence: EvidenceConfig,
    pub genesis: GenesisConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub listen_addr: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Prometheus exporter address; disabled when absent.
    pub listen_addr: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    /// Hex ed25519 seed. A random key is generated when absent.
    pub key_seed: Option<String>,
    pub alternate_key_seed: Option<String>,
}

/// Timeouts are in milliseconds; per-round deltas grow them linearly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    pub timeout_propose_ms: u64,
    pub timeout_propose_delta_ms: u64,
    pub timeout_prevote_ms: u64,
    pub timeout_prevote_delta_ms: u64,
    pub timeout_precommit_ms: u64,
    pub timeout_precommit_delta_ms: u64,
    pub timeout_commit_ms: u64,
    pub skip_timeout_commit: bool,
    /// Round 0 waits this long for transactions before proposing an empty
    /// block. Zero proposes immediately.
    pub create_empty_blocks_interval_ms: u64,
    pub queue_capacity: usize,
    pub peer_gossip_sleep_ms: u64,
    pub max_evidence_per_block: usize,
    pub max_transactions_per_block: usize,
    /// Votes switch to the batched version from this height on.
    pub batched_votes_height: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvidenceConfig {
    pub max_age_num_blocks: u64,
    pub cache_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenesisConfig {
    pub timestamp: DateTime<Utc>,
    pub validators: Vec<GenesisValidator>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisValidator {
    pub public_key: String,
    pub alternate_public_key: Option<String>,
    pub voting_power: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            chain_id: 12357,
            api: ApiConfig::default(),
            metrics: MetricsConfig::default(),
            validator: ValidatorConfig::default(),
            consensus: ConsensusConfig::default(),
            evidence: EvidenceConfig::default(),
            genesis: GenesisConfig::default(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
        }
    }
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            timeout_propose_ms: 3000,
            timeout_propose_delta_ms: 500,
            timeout_prevote_ms: 1000,
            timeout_prevote_delta_ms: 500,
            timeout_precommit_ms: 1000,
            timeout_precommit_delta_ms: 500,
            timeout_commit_ms: 1000,
            skip_timeout_commit: false,
            create_empty_blocks_interval_ms: 0,
            queue_capacity: 1000,
            peer_gossip_sleep_ms: 100,
            max_evidence_per_block: 10,
            max_transactions_per_block: 1000,
            batched_votes_height: None,
        }
    }
}

impl Default for EvidenceConfig {
    fn default() -> Self {
        Self {
            max_age_num_blocks: 10000,
            cache_size: 100,
        }
    }
}

impl Default for GenesisConfig {
    fn default() -> Self {
        Self {
            timestamp: DateTime::<Utc>::default(),
            validators: Vec::new(),
        }
    }
}

impl ConsensusConfig {
    pub fn propose_timeout(&self, round: u32) -> Duration {
        with_delta(self.timeout_propose_ms, self.timeout_propose_delta_ms, round)
    }

    pub fn prevote_timeout(&self, round: u32) -> Duration {
        with_delta(self.timeout_prevote_ms, self.timeout_prevote_delta_ms, round)
    }

    pub fn precommit_timeout(&self, round: u32) -> Duration {
        with_delta(self.timeout_precommit_ms, self.timeout_precommit_delta_ms, round)
    }

    pub fn commit_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_commit_ms)
    }

    pub fn empty_block_interval(&self) -> Option<Duration> {
        (self.create_empty_blocks_interval_ms > 0)
            .then(|| Duration::from_millis(self.create_empty_blocks_interval_ms))
    }

    pub fn peer_gossip_sleep(&self) -> Duration {
        Duration::from_millis(self.peer_gossip_sleep_ms)
    }
}

fn with_delta(base_ms: u64, delta_ms: u64, round: u32) -> Duration {
    Duration::from_millis(base_ms.saturating_add(delta_ms.saturating_mul(round as u64)))
}

impl NodeConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config_str = std::fs::read_to_string(path)?;
        let config: NodeConfig = serde_json::from_str(&config_str)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let config_str = serde_json::to_string_pretty(self)?;
        std::fs::write(path, config_str)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.consensus.queue_capacity == 0 {
            return Err(ConfigError::Invalid("consensus.queue_capacity must be positive".to_string()));
        }
        if self.evidence.cache_size == 0 {
            return Err(ConfigError::Invalid("evidence.cache_size must be positive".to_string()));
        }
        if self.genesis.validators.iter().any(|v| v.voting_power == 0) {
            return Err(ConfigError::Invalid("genesis validator with zero voting power".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.json");

        let mut config = NodeConfig::default();
        config.chain_id = 77;
        config.consensus.batched_votes_height = Some(1000);
        config.genesis.validators.push(GenesisValidator {
            public_key: "00".repeat(32),
            alternate_public_key: None,
            voting_power: 5,
        });
        config.save(&path).unwrap();

        let loaded = NodeConfig::load(&path).unwrap();
        assert_eq!(loaded.chain_id, 77);
        assert_eq!(loaded.consensus.batched_votes_height, Some(1000));
        assert_eq!(loaded.genesis.validators.len(), 1);
    }

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.json");
        std::fs::write(&path, r#"{ "consensus": { "timeout_propose_ms": 10 } }"#).unwrap();

        let loaded = NodeConfig::load(&path).unwrap();
        assert_eq!(loaded.consensus.timeout_propose_ms, 10);
        assert_eq!(loaded.consensus.timeout_prevote_ms, 1000);
        assert_eq!(loaded.evidence.cache_size, 100);
    }

    #[test]
    fn timeouts_grow_with_round() {
        let config = ConsensusConfig::default();
        assert_eq!(config.propose_timeout(0), Duration::from_millis(3000));
        assert_eq!(config.propose_timeout(2), Duration::from_millis(4000));
        assert_eq!(config.precommit_timeout(1), Duration::from_millis(1500));
        assert_eq!(config.empty_block_interval(), None);
    }

    #[test]
    fn zero_queue_capacity_is_invalid() {
        let mut config = NodeConfig::default();
        config.consensus.queue_capacity = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}

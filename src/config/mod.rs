pub mod settings;

pub use settings::{
    ApiConfig, ConfigError, ConsensusConfig, EvidenceConfig, GenesisConfig, GenesisValidator,
    MetricsConfig, NodeConfig, ValidatorConfig,
};

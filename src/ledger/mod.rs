pub mod chain;
pub mod driver;
pub mod state;

pub use chain::{genesis_validators, DevChain, GenesisError, OutboundMessage};
pub use driver::BlockDriver;
pub use state::ChainState;

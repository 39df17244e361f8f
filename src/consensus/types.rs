use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        PeerId(id.into())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Position inside a round. Variant order is the protocol order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RoundStepType {
    #[default]
    NewHeight,
    NewRound,
    Propose,
    Prevote,
    PrevoteWait,
    Precommit,
    PrecommitWait,
    Commit,
}

impl RoundStepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoundStepType::NewHeight => "new_height",
            RoundStepType::NewRound => "new_round",
            RoundStepType::Propose => "propose",
            RoundStepType::Prevote => "prevote",
            RoundStepType::PrevoteWait => "prevote_wait",
            RoundStepType::Precommit => "precommit",
            RoundStepType::PrecommitWait => "precommit_wait",
            RoundStepType::Commit => "commit",
        }
    }
}

impl fmt::Display for RoundStepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    Opus,
    Sonnet,
    Haiku,
}

impl std::fmt::Display for ModelTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ModelTier::Opus => "opus",
            ModelTier::Sonnet => "sonnet",
            ModelTier::Haiku => "haiku",
        };
        write!(f, "{s}")
    }
}

/// Where a model-tier decision came from, kept for observability of the
/// executor's selection precedence (explicit > budget > squad default).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelSelectionSource {
    Explicit,
    Budget,
    SquadDefault,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModelSelection {
    pub tier: ModelTier,
    pub source: ModelSelectionSource,
}

use serde::{Deserialize, Serialize};

/// The squad a skill belongs to. Foundation skills belong to no squad.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Squad {
    Strategy,
    Creative,
    Convert,
    Activate,
    Measure,
    Foundation,
}

impl Squad {
    /// `strategy ∪ foundation → opus`, others → `sonnet` (§4.2 step 5).
    pub fn default_model_tier(self) -> crate::ModelTier {
        match self {
            Squad::Strategy | Squad::Foundation => crate::ModelTier::Opus,
            _ => crate::ModelTier::Sonnet,
        }
    }

    pub fn directory_name(self) -> &'static str {
        match self {
            Squad::Strategy => "strategy",
            Squad::Creative => "creative",
            Squad::Convert => "convert",
            Squad::Activate => "activate",
            Squad::Measure => "measure",
            Squad::Foundation => "foundation",
        }
    }
}

impl std::fmt::Display for Squad {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.directory_name())
    }
}

/// A named capability backed by a system-prompt manifest and optional
/// reference materials (§ GLOSSARY).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillManifest {
    pub name: String,
    #[serde(default)]
    pub squad: Option<Squad>,
    /// Raw markdown body used verbatim as the system prompt (§4.3).
    pub system_prompt: String,
    #[serde(default)]
    pub reference_files: Vec<String>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub is_foundation: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_and_foundation_default_to_opus() {
        assert_eq!(Squad::Strategy.default_model_tier(), crate::ModelTier::Opus);
        assert_eq!(
            Squad::Foundation.default_model_tier(),
            crate::ModelTier::Opus
        );
    }

    #[test]
    fn other_squads_default_to_sonnet() {
        for squad in [Squad::Creative, Squad::Convert, Squad::Activate, Squad::Measure] {
            assert_eq!(squad.default_model_tier(), crate::ModelTier::Sonnet);
        }
    }
}

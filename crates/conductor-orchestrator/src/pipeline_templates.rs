//! Pipeline template registry: an immutable, validated lookup table from a
//! configured name to the `PipelineDefinition` the scheduler and event bus
//! ask the pipeline engine to run (§4.10, §4.11). Construction mirrors
//! `conductor_skills::SkillRegistry` — built once from a flat list, globally
//! unique names enforced up front.

use std::collections::HashMap;

use conductor_types::PipelineDefinition;

#[derive(Debug, thiserror::Error)]
pub enum PipelineTemplateError {
    #[error("duplicate pipeline template name `{0}`")]
    DuplicateName(String),
}

#[derive(Debug, Clone, Default)]
pub struct PipelineTemplateRegistry {
    by_name: HashMap<String, PipelineDefinition>,
}

impl PipelineTemplateRegistry {
    pub fn from_definitions(
        definitions: Vec<PipelineDefinition>,
    ) -> Result<Self, PipelineTemplateError> {
        let mut by_name = HashMap::with_capacity(definitions.len());
        for definition in definitions {
            if by_name.contains_key(&definition.name) {
                return Err(PipelineTemplateError::DuplicateName(definition.name));
            }
            by_name.insert(definition.name.clone(), definition);
        }
        Ok(Self { by_name })
    }

    pub fn get(&self, name: &str) -> Option<&PipelineDefinition> {
        self.by_name.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.by_name.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_types::PipelineStep;

    fn def(name: &str) -> PipelineDefinition {
        PipelineDefinition {
            id: format!("{name}-def"),
            name: name.to_string(),
            steps: vec![PipelineStep::Sequential {
                skill: "seo-audit".to_string(),
            }],
        }
    }

    #[test]
    fn looks_up_by_name() {
        let registry = PipelineTemplateRegistry::from_definitions(vec![def("weekly-refresh")]).unwrap();
        assert!(registry.get("weekly-refresh").is_some());
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn rejects_duplicate_names() {
        let err = PipelineTemplateRegistry::from_definitions(vec![def("a"), def("a")]).unwrap_err();
        assert!(matches!(err, PipelineTemplateError::DuplicateName(name) if name == "a"));
    }
}

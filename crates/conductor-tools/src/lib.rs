//! Tool registry (C1): a declarative, validated lookup table built from
//! `.agents/tools.yaml`, consulted by the executor's tool-use loop for
//! schema advertisement and capability-checked stub invocation.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use conductor_wire::{ToolDefinition, ToolInputSchema};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolProvider {
    Stub,
    Mcp,
    Rest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimit {
    pub max_per_minute: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionConfig {
    pub name: String,
    pub description: String,
    pub parameters: ToolInputSchema,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolConfig {
    pub description: String,
    pub provider: ToolProvider,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub credentials_env: Option<String>,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub rate_limit: Option<RateLimit>,
    #[serde(default)]
    pub actions: Vec<ActionConfig>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct ToolsFile {
    #[serde(default)]
    tools: HashMap<String, ToolConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolValidationError {
    pub tool_name: String,
    pub reason: String,
}

impl std::fmt::Display for ToolValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tool `{}`: {}", self.tool_name, self.reason)
    }
}

impl std::error::Error for ToolValidationError {}

/// Qualified tool name in the `{tool}__{action}` form used on the wire.
pub fn qualified_name(tool: &str, action: &str) -> String {
    format!("{tool}__{action}")
}

/// Immutable registry of tool/action definitions, validated once at
/// construction: the caller gets every validation failure at once rather
/// than stopping at the first (mirrors skill-registry construction).
#[derive(Debug, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, ToolConfig>,
}

impl ToolRegistry {
    pub fn load(yaml: &str) -> Result<Self, Vec<ToolValidationError>> {
        let parsed: ToolsFile = serde_yaml::from_str(yaml).map_err(|e| {
            vec![ToolValidationError {
                tool_name: "<root>".to_string(),
                reason: format!("invalid tools.yaml: {e}"),
            }]
        })?;
        Self::from_map(parsed.tools)
    }

    pub fn from_map(tools: HashMap<String, ToolConfig>) -> Result<Self, Vec<ToolValidationError>> {
        let mut errors = Vec::new();
        let mut seen_qualified = std::collections::HashSet::new();

        for (tool_name, config) in &tools {
            if config.actions.is_empty() {
                errors.push(ToolValidationError {
                    tool_name: tool_name.clone(),
                    reason: "must declare at least one action".to_string(),
                });
                continue;
            }
            for action in &config.actions {
                if action.name.trim().is_empty() {
                    errors.push(ToolValidationError {
                        tool_name: tool_name.clone(),
                        reason: "action is missing a name".to_string(),
                    });
                    continue;
                }
                if action.parameters.schema_type != "object" {
                    errors.push(ToolValidationError {
                        tool_name: tool_name.clone(),
                        reason: format!(
                            "action `{}` parameters must declare type: object",
                            action.name
                        ),
                    });
                    continue;
                }
                let qualified = qualified_name(tool_name, &action.name);
                if !seen_qualified.insert(qualified.clone()) {
                    errors.push(ToolValidationError {
                        tool_name: tool_name.clone(),
                        reason: format!("duplicate qualified tool name `{qualified}`"),
                    });
                }
            }
        }

        if !errors.is_empty() {
            return Err(errors);
        }

        Ok(Self { tools })
    }

    pub fn get(&self, tool_name: &str) -> Option<&ToolConfig> {
        self.tools.get(tool_name)
    }

    pub fn is_enabled(&self, tool_name: &str) -> bool {
        self.tools.get(tool_name).map(|t| t.enabled).unwrap_or(false)
    }

    /// Whether `skill` is listed in the tool config's `skills` allowlist.
    /// An empty allowlist means the tool is unrestricted.
    pub fn skill_allowed(&self, tool_name: &str, skill: &str) -> bool {
        match self.tools.get(tool_name) {
            Some(config) => config.skills.is_empty() || config.skills.iter().any(|s| s == skill),
            None => false,
        }
    }

    /// Every enabled tool's action set as wire-format tool definitions,
    /// qualified `{tool}__{action}`, for inclusion in a `createMessage` call.
    pub fn definitions_for_skill(&self, skill: &str) -> Vec<ToolDefinition> {
        let mut out = Vec::new();
        for (tool_name, config) in &self.tools {
            if !config.enabled || !self.skill_allowed(tool_name, skill) {
                continue;
            }
            for action in &config.actions {
                out.push(ToolDefinition {
                    name: qualified_name(tool_name, &action.name),
                    description: action.description.clone(),
                    input_schema: action.parameters.clone(),
                });
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn resolve_qualified<'a>(&self, qualified: &'a str) -> Option<(&'a str, &ActionConfig)> {
        let (tool_name, action_name) = qualified.split_once("__")?;
        let config = self.tools.get(tool_name)?;
        let action = config.actions.iter().find(|a| a.name == action_name)?;
        Some((tool_name, action))
    }

    /// Invokes a tool. Only the `stub` provider actually executes (§4.2 step
    /// 11): it returns a synthetic JSON metadata blob describing the call.
    /// `mcp`/`rest` providers are not dispatched; invoking one is reported
    /// as an error the caller folds into a `tool_result` error block.
    pub fn invoke(&self, qualified: &str, args: &Value) -> Result<Value, String> {
        let (tool_name, action) = self
            .resolve_qualified(qualified)
            .ok_or_else(|| format!("unknown tool `{qualified}`"))?;
        let config = self.tools.get(tool_name).expect("resolved above");
        if !config.enabled {
            return Err(format!("tool `{tool_name}` is disabled"));
        }
        match config.provider {
            ToolProvider::Stub => Ok(json!({
                "stub": true,
                "tool": tool_name,
                "action": action.name,
                "args": args,
            })),
            ToolProvider::Mcp | ToolProvider::Rest => {
                Err(format!("provider for `{tool_name}` is not dispatchable in this build"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object_schema() -> ToolInputSchema {
        ToolInputSchema {
            schema_type: "object".to_string(),
            properties: Some(json!({"query": {"type": "string"}})),
            required: Some(vec!["query".to_string()]),
        }
    }

    fn sample_tool(skills: Vec<String>) -> ToolConfig {
        ToolConfig {
            description: "Search the web".to_string(),
            provider: ToolProvider::Stub,
            enabled: true,
            credentials_env: None,
            skills,
            rate_limit: Some(RateLimit { max_per_minute: 10 }),
            actions: vec![ActionConfig {
                name: "search".to_string(),
                description: "Run a search query".to_string(),
                parameters: object_schema(),
            }],
        }
    }

    #[test]
    fn loads_and_validates_config() {
        let mut tools = HashMap::new();
        tools.insert("web_search".to_string(), sample_tool(vec!["draft-copy".to_string()]));
        let registry = ToolRegistry::from_map(tools).expect("valid registry");
        assert!(registry.skill_allowed("web_search", "draft-copy"));
        assert!(!registry.skill_allowed("web_search", "schedule-posts"));
    }

    #[test]
    fn duplicate_qualified_names_are_aggregated() {
        let mut tools = HashMap::new();
        let mut dup = sample_tool(vec![]);
        dup.actions.push(ActionConfig {
            name: "search".to_string(),
            description: "duplicate action name".to_string(),
            parameters: object_schema(),
        });
        tools.insert("web_search".to_string(), dup);
        let errors = ToolRegistry::from_map(tools).expect_err("duplicate actions rejected");
        assert!(errors.iter().any(|e| e.reason.contains("duplicate qualified")));
    }

    #[test]
    fn missing_object_type_is_a_validation_error() {
        let mut tools = HashMap::new();
        let mut bad = sample_tool(vec![]);
        bad.actions[0].parameters.schema_type = "string".to_string();
        tools.insert("web_search".to_string(), bad);
        let errors = ToolRegistry::from_map(tools).expect_err("non-object schema rejected");
        assert_eq!(errors.len(), 1);
        assert!(errors[0].reason.contains("type: object"));
    }

    #[test]
    fn empty_allowlist_permits_any_skill() {
        let mut tools = HashMap::new();
        tools.insert("web_search".to_string(), sample_tool(vec![]));
        let registry = ToolRegistry::from_map(tools).expect("valid registry");
        assert!(registry.skill_allowed("web_search", "anything"));
    }

    #[test]
    fn definitions_are_qualified_and_skill_filtered() {
        let mut tools = HashMap::new();
        tools.insert("web_search".to_string(), sample_tool(vec!["draft-copy".to_string()]));
        let registry = ToolRegistry::from_map(tools).expect("valid registry");
        let defs = registry.definitions_for_skill("draft-copy");
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, "web_search__search");
        assert!(registry.definitions_for_skill("other-skill").is_empty());
    }

    #[test]
    fn stub_provider_invokes_with_synthetic_metadata() {
        let mut tools = HashMap::new();
        tools.insert("web_search".to_string(), sample_tool(vec![]));
        let registry = ToolRegistry::from_map(tools).expect("valid registry");
        let result = registry
            .invoke("web_search__search", &json!({"query": "conductor"}))
            .expect("stub invocation succeeds");
        assert_eq!(result["tool"], "web_search");
        assert_eq!(result["action"], "search");
    }

    #[test]
    fn non_stub_provider_is_rejected() {
        let mut tools = HashMap::new();
        let mut mcp_tool = sample_tool(vec![]);
        mcp_tool.provider = ToolProvider::Mcp;
        tools.insert("crm".to_string(), mcp_tool);
        let registry = ToolRegistry::from_map(tools).expect("valid registry");
        let err = registry
            .invoke("crm__search", &json!({}))
            .expect_err("mcp not dispatchable");
        assert!(err.contains("not dispatchable"));
    }

    #[test]
    fn unknown_qualified_name_is_an_error() {
        let registry = ToolRegistry::from_map(HashMap::new()).expect("empty registry valid");
        assert!(registry.invoke("nope__search", &json!({})).is_err());
    }
}

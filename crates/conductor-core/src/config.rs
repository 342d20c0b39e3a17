//! Layered configuration (§10.2): global → project → managed → env →
//! runtime → cli, merged with the same `deep_merge` idiom the teacher uses
//! for its own JSON-layer config store, trimmed to this system's actual
//! surface (a single LLM provider, budget, scheduler, and workspace
//! settings rather than a multi-channel bot/multi-provider marketplace).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::fs;
use tokio::sync::RwLock;

use conductor_budget::BudgetThresholds;
use conductor_types::ModelTier;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicConfig {
    pub api_key: Option<String>,
    #[serde(default = "default_anthropic_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub default_model: String,
    /// Per-tier model id overrides; unset tiers fall back to `default_model`.
    #[serde(default)]
    pub opus_model: Option<String>,
    #[serde(default)]
    pub sonnet_model: Option<String>,
    #[serde(default)]
    pub haiku_model: Option<String>,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_max_response_tokens")]
    pub max_response_tokens: u32,
    #[serde(default = "default_prompt_token_budget")]
    pub prompt_token_budget: u32,
}

fn default_anthropic_base_url() -> String {
    "https://api.anthropic.com".to_string()
}

fn default_model() -> String {
    "claude-sonnet-4-6".to_string()
}

fn default_request_timeout_ms() -> u64 {
    120_000
}

fn default_max_response_tokens() -> u32 {
    8_192
}

fn default_prompt_token_budget() -> u32 {
    150_000
}

impl Default for AnthropicConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_anthropic_base_url(),
            default_model: default_model(),
            opus_model: None,
            sonnet_model: None,
            haiku_model: None,
            request_timeout_ms: default_request_timeout_ms(),
            max_response_tokens: default_max_response_tokens(),
            prompt_token_budget: default_prompt_token_budget(),
        }
    }
}

impl AnthropicConfig {
    /// Resolves the wire model id for a selected tier (§4.2 step 5), falling
    /// back to `default_model` when no per-tier override is configured.
    pub fn model_for_tier(&self, tier: ModelTier) -> &str {
        let override_id = match tier {
            ModelTier::Opus => self.opus_model.as_deref(),
            ModelTier::Sonnet => self.sonnet_model.as_deref(),
            ModelTier::Haiku => self.haiku_model.as_deref(),
        };
        override_id.unwrap_or(&self.default_model)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    #[serde(default)]
    pub total_monthly_usd: f64,
    #[serde(default)]
    pub thresholds: BudgetThresholds,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            total_monthly_usd: 0.0,
            thresholds: BudgetThresholds::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_true")]
    pub catch_up: bool,
    #[serde(default = "default_lookback_minutes")]
    pub max_lookback_minutes: u64,
}

fn default_lookback_minutes() -> u64 {
    24 * 60
}

fn default_true() -> bool {
    true
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            catch_up: true,
            max_lookback_minutes: default_lookback_minutes(),
        }
    }
}

/// Application-wide settings (§6 environment variables, §10.2, §10.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub anthropic: AnthropicConfig,
    pub workspace_root: Option<String>,
    pub queue_backend: Option<String>,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default = "default_max_tool_iterations")]
    pub max_tool_iterations: u32,
    /// §10.6 open-question resolution: whether re-running a skill already
    /// consumed by an earlier phase advances the phase index.
    #[serde(default = "default_true")]
    pub advance_on_skill_recurrence: bool,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default = "default_health_check_timeout_ms")]
    pub health_check_timeout_ms: u64,
}

fn default_max_tool_iterations() -> u32 {
    10
}

fn default_health_check_timeout_ms() -> u64 {
    5_000
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            anthropic: AnthropicConfig::default(),
            workspace_root: None,
            queue_backend: None,
            budget: BudgetConfig::default(),
            max_tool_iterations: default_max_tool_iterations(),
            advance_on_skill_recurrence: true,
            scheduler: SchedulerConfig::default(),
            health_check_timeout_ms: default_health_check_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct ConfigLayers {
    global: Value,
    project: Value,
    managed: Value,
    env: Value,
    runtime: Value,
    cli: Value,
}

/// Six-layer JSON config merge, adapted from the teacher's `ConfigStore`.
#[derive(Clone)]
pub struct ConfigStore {
    project_path: PathBuf,
    global_path: PathBuf,
    managed_path: PathBuf,
    layers: Arc<RwLock<ConfigLayers>>,
}

impl ConfigStore {
    pub async fn new(path: impl AsRef<Path>, cli_overrides: Option<Value>) -> anyhow::Result<Self> {
        let project_path = path.as_ref().to_path_buf();
        if let Some(parent) = project_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let managed_path = project_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("managed_config.json");
        let global_path = resolve_global_config_path().await?;

        let mut global = read_json_file(&global_path).await.unwrap_or_else(|_| empty_object());
        let mut project = read_json_file(&project_path).await.unwrap_or_else(|_| empty_object());
        let mut managed = read_json_file(&managed_path).await.unwrap_or_else(|_| empty_object());

        scrub_persisted_secrets(&mut global, &global_path).await?;
        scrub_persisted_secrets(&mut project, &project_path).await?;
        scrub_persisted_secrets(&mut managed, &managed_path).await?;

        let layers = ConfigLayers {
            global,
            project,
            managed,
            env: env_layer(),
            runtime: empty_object(),
            cli: cli_overrides.unwrap_or_else(empty_object),
        };

        let store = Self {
            project_path,
            global_path,
            managed_path,
            layers: Arc::new(RwLock::new(layers)),
        };
        store.save_project().await?;
        store.save_global().await?;
        Ok(store)
    }

    pub async fn get(&self) -> AppConfig {
        let merged = self.get_effective_value().await;
        serde_json::from_value(merged).unwrap_or_default()
    }

    pub async fn get_effective_value(&self) -> Value {
        let layers = self.layers.read().await.clone();
        let mut merged = empty_object();
        deep_merge(&mut merged, &layers.global);
        deep_merge(&mut merged, &layers.project);
        deep_merge(&mut merged, &layers.managed);
        deep_merge(&mut merged, &layers.env);
        deep_merge(&mut merged, &layers.runtime);
        deep_merge(&mut merged, &layers.cli);
        merged
    }

    pub async fn get_project_value(&self) -> Value {
        self.layers.read().await.project.clone()
    }

    pub async fn get_global_value(&self) -> Value {
        self.layers.read().await.global.clone()
    }

    pub async fn get_layers_value(&self) -> Value {
        let layers = self.layers.read().await;
        json!({
            "global": layers.global,
            "project": layers.project,
            "managed": layers.managed,
            "env": layers.env,
            "runtime": layers.runtime,
            "cli": layers.cli,
        })
    }

    pub async fn set(&self, config: AppConfig) -> anyhow::Result<()> {
        let value = serde_json::to_value(config)?;
        self.set_project_value(value).await
    }

    pub async fn patch_project(&self, patch: Value) -> anyhow::Result<Value> {
        {
            let mut layers = self.layers.write().await;
            deep_merge(&mut layers.project, &patch);
        }
        self.save_project().await?;
        Ok(self.get_effective_value().await)
    }

    pub async fn patch_global(&self, patch: Value) -> anyhow::Result<Value> {
        {
            let mut layers = self.layers.write().await;
            deep_merge(&mut layers.global, &patch);
        }
        self.save_global().await?;
        Ok(self.get_effective_value().await)
    }

    pub async fn patch_runtime(&self, patch: Value) -> anyhow::Result<Value> {
        {
            let mut layers = self.layers.write().await;
            deep_merge(&mut layers.runtime, &patch);
        }
        Ok(self.get_effective_value().await)
    }

    pub async fn replace_project_value(&self, value: Value) -> anyhow::Result<Value> {
        self.set_project_value(value).await?;
        Ok(self.get_effective_value().await)
    }

    /// Clears the runtime-layer API key override, forcing the merge to fall
    /// back to whatever the env/global/project layers provide.
    pub async fn clear_runtime_api_key(&self) -> anyhow::Result<Value> {
        {
            let mut layers = self.layers.write().await;
            if let Some(anthropic) = layers
                .runtime
                .as_object_mut()
                .and_then(|root| root.get_mut("anthropic"))
                .and_then(|v| v.as_object_mut())
            {
                anthropic.remove("api_key");
            }
        }
        Ok(self.get_effective_value().await)
    }

    async fn set_project_value(&self, value: Value) -> anyhow::Result<()> {
        self.layers.write().await.project = value;
        self.save_project().await
    }

    async fn save_project(&self) -> anyhow::Result<()> {
        let snapshot = self.layers.read().await.project.clone();
        write_json_file(&self.project_path, &snapshot).await
    }

    async fn save_global(&self) -> anyhow::Result<()> {
        let snapshot = self.layers.read().await.global.clone();
        write_json_file(&self.global_path, &snapshot).await
    }

    #[allow(dead_code)]
    async fn save_managed(&self) -> anyhow::Result<()> {
        let snapshot = self.layers.read().await.managed.clone();
        write_json_file(&self.managed_path, &snapshot).await
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

async fn write_json_file(path: &Path, value: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let mut to_write = value.clone();
    strip_persisted_secrets(&mut to_write);
    let raw = serde_json::to_string_pretty(&to_write)?;
    fs::write(path, raw).await?;
    Ok(())
}

/// Never persist a runtime-sourced API key back to disk (§10.2): if the
/// active key came from `ANTHROPIC_API_KEY`, writing a config snapshot
/// containing it would leak the secret into a plaintext file.
fn strip_persisted_secrets(value: &mut Value) {
    let Value::Object(root) = value else {
        return;
    };
    let Some(anthropic) = root.get_mut("anthropic").and_then(|v| v.as_object_mut()) else {
        return;
    };
    if anthropic_has_runtime_secret() {
        anthropic.remove("api_key");
    }
}

fn anthropic_has_runtime_secret() -> bool {
    std::env::var("ANTHROPIC_API_KEY")
        .map(|v| !v.trim().is_empty())
        .unwrap_or(false)
}

async fn scrub_persisted_secrets(value: &mut Value, path: &Path) -> anyhow::Result<()> {
    let before = value.clone();
    strip_persisted_secrets(value);
    if *value != before {
        write_json_file(path, value).await?;
    }
    Ok(())
}

async fn read_json_file(path: &Path) -> anyhow::Result<Value> {
    if !path.exists() {
        return Ok(empty_object());
    }
    let raw = fs::read_to_string(path).await?;
    Ok(serde_json::from_str::<Value>(&raw).unwrap_or_else(|_| empty_object()))
}

async fn resolve_global_config_path() -> anyhow::Result<PathBuf> {
    if let Ok(path) = std::env::var("CONDUCTOR_GLOBAL_CONFIG") {
        let path = PathBuf::from(path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        return Ok(path);
    }
    if let Some(config_dir) = dirs::config_dir() {
        let path = config_dir.join("conductor").join("config.json");
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        return Ok(path);
    }
    Ok(PathBuf::from(".conductor/global_config.json"))
}

/// Reads the environment-variable layer (§6: API key, workspace root,
/// queue backend host:port, log level/format, budget total/thresholds).
fn env_layer() -> Value {
    let mut root = empty_object();

    if let Ok(api_key) = std::env::var("ANTHROPIC_API_KEY") {
        if !api_key.trim().is_empty() {
            deep_merge(&mut root, &json!({ "anthropic": { "api_key": api_key } }));
        }
    }
    if let Ok(base_url) = std::env::var("CONDUCTOR_ANTHROPIC_BASE_URL") {
        if !base_url.trim().is_empty() {
            deep_merge(&mut root, &json!({ "anthropic": { "base_url": base_url } }));
        }
    }
    if let Ok(model) = std::env::var("CONDUCTOR_ANTHROPIC_MODEL") {
        if !model.trim().is_empty() {
            deep_merge(&mut root, &json!({ "anthropic": { "default_model": model } }));
        }
    }
    if let Ok(root_dir) = std::env::var("CONDUCTOR_WORKSPACE_ROOT") {
        if !root_dir.trim().is_empty() {
            deep_merge(&mut root, &json!({ "workspace_root": root_dir }));
        }
    }
    if let Ok(queue) = std::env::var("CONDUCTOR_QUEUE_BACKEND") {
        if !queue.trim().is_empty() {
            deep_merge(&mut root, &json!({ "queue_backend": queue }));
        }
    }
    if let Ok(total) = std::env::var("CONDUCTOR_BUDGET_TOTAL_USD") {
        if let Ok(v) = total.trim().parse::<f64>() {
            deep_merge(&mut root, &json!({ "budget": { "total_monthly_usd": v } }));
        }
    }
    for (env_key, field) in [
        ("CONDUCTOR_BUDGET_WARNING_PCT", "warning"),
        ("CONDUCTOR_BUDGET_THROTTLE_PCT", "throttle"),
        ("CONDUCTOR_BUDGET_CRITICAL_PCT", "critical"),
        ("CONDUCTOR_BUDGET_EXHAUSTED_PCT", "exhausted"),
    ] {
        if let Ok(raw) = std::env::var(env_key) {
            if let Ok(v) = raw.trim().parse::<f64>() {
                deep_merge(&mut root, &json!({ "budget": { "thresholds": { field: v } } }));
            }
        }
    }
    if let Ok(raw) = std::env::var("CONDUCTOR_MAX_TOOL_ITERATIONS") {
        if let Ok(v) = raw.trim().parse::<u32>() {
            deep_merge(&mut root, &json!({ "max_tool_iterations": v }));
        }
    }
    if let Ok(raw) = std::env::var("CONDUCTOR_ADVANCE_ON_SKILL_RECURRENCE") {
        if let Some(v) = parse_bool_like(&raw) {
            deep_merge(&mut root, &json!({ "advance_on_skill_recurrence": v }));
        }
    }
    if let Ok(raw) = std::env::var("CONDUCTOR_SCHEDULER_CATCH_UP") {
        if let Some(v) = parse_bool_like(&raw) {
            deep_merge(&mut root, &json!({ "scheduler": { "catch_up": v } }));
        }
    }
    if let Ok(raw) = std::env::var("CONDUCTOR_HEALTH_CHECK_TIMEOUT_MS") {
        if let Ok(v) = raw.trim().parse::<u64>() {
            deep_merge(&mut root, &json!({ "health_check_timeout_ms": v }));
        }
    }

    root
}

fn parse_bool_like(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}

//! Skill registry (C1): an immutable, validated lookup table built from
//! declarative `SKILL.md` manifests (frontmatter + body), consulted by the
//! executor for `skill → squad`, `skill → reference files`, and
//! `skill → tools` lookups.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use conductor_types::{SkillManifest, Squad};

#[derive(Debug, Clone)]
pub struct SkillParseError {
    pub path: PathBuf,
    pub message: String,
}

impl std::fmt::Display for SkillParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path.display(), self.message)
    }
}

#[derive(Debug, Deserialize)]
struct SkillFrontmatter {
    name: Option<String>,
    #[serde(default)]
    squad: Option<Squad>,
    #[serde(default)]
    reference_files: Vec<String>,
    #[serde(default)]
    tools: Vec<String>,
    #[serde(default)]
    is_foundation: bool,
}

/// Closed set of skills built once from a manifest directory. Construction
/// never fails on a single bad manifest: malformed files are skipped and
/// recorded in `errors()` so the rest of the registry still loads.
#[derive(Debug, Clone)]
pub struct SkillRegistry {
    skills: HashMap<String, SkillManifest>,
    errors: Vec<SkillParseError>,
}

impl SkillRegistry {
    pub fn load(manifests_dir: &Path) -> std::io::Result<Self> {
        let mut skills = HashMap::new();
        let mut errors = Vec::new();

        let entries = match fs::read_dir(manifests_dir) {
            Ok(rd) => rd,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self {
                    skills,
                    errors,
                })
            }
            Err(err) => return Err(err),
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            let raw = match fs::read_to_string(&path) {
                Ok(v) => v,
                Err(err) => {
                    errors.push(SkillParseError {
                        path: path.clone(),
                        message: err.to_string(),
                    });
                    continue;
                }
            };
            match parse_skill_markdown(&raw, &path) {
                Ok(manifest) => {
                    if skills.contains_key(&manifest.name) {
                        errors.push(SkillParseError {
                            path,
                            message: format!("duplicate skill name `{}`", manifest.name),
                        });
                        continue;
                    }
                    skills.insert(manifest.name.clone(), manifest);
                }
                Err(message) => errors.push(SkillParseError { path, message }),
            }
        }

        Ok(Self { skills, errors })
    }

    pub fn from_manifests(manifests: Vec<SkillManifest>) -> Result<Self, SkillParseError> {
        let mut skills = HashMap::new();
        for manifest in manifests {
            if skills.contains_key(&manifest.name) {
                return Err(SkillParseError {
                    path: PathBuf::new(),
                    message: format!("duplicate skill name `{}`", manifest.name),
                });
            }
            skills.insert(manifest.name.clone(), manifest);
        }
        Ok(Self {
            skills,
            errors: Vec::new(),
        })
    }

    pub fn errors(&self) -> &[SkillParseError] {
        &self.errors
    }

    pub fn get(&self, name: &str) -> Option<&SkillManifest> {
        self.skills.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.skills.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.skills.len()
    }

    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
    }

    /// `skill → squad`; `None` for a foundation skill or an unknown skill.
    pub fn squad_of(&self, skill: &str) -> Option<Squad> {
        self.skills.get(skill).and_then(|m| m.squad)
    }

    /// All skill names belonging to `squad`, sorted for deterministic
    /// phase materialization order.
    pub fn skills_for_squad(&self, squad: Squad) -> Vec<String> {
        let mut names: Vec<String> = self
            .skills
            .values()
            .filter(|m| m.squad == Some(squad))
            .map(|m| m.name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn reference_files_of(&self, skill: &str) -> &[String] {
        self.skills
            .get(skill)
            .map(|m| m.reference_files.as_slice())
            .unwrap_or(&[])
    }

    /// Whether `skill` is authorized to invoke `tool`, per the executor's
    /// capability check.
    pub fn tool_allowed(&self, skill: &str, tool: &str) -> bool {
        self.skills
            .get(skill)
            .map(|m| m.tools.iter().any(|t| t == tool))
            .unwrap_or(false)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SkillManifest> {
        self.skills.values()
    }
}

fn parse_skill_markdown(raw: &str, path: &Path) -> Result<SkillManifest, String> {
    let trimmed = raw.trim_start();
    if !trimmed.starts_with("---") {
        return Err("missing YAML frontmatter".to_string());
    }
    let mut parts = trimmed.splitn(3, "---");
    let _ = parts.next();
    let frontmatter_raw = parts.next().ok_or("unterminated frontmatter")?.trim();
    let body = parts.next().unwrap_or("").trim().to_string();
    let frontmatter: SkillFrontmatter = serde_yaml::from_str(frontmatter_raw)
        .map_err(|e| format!("invalid frontmatter: {e}"))?;
    let default_name = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let name = frontmatter.name.unwrap_or(default_name);
    if name.is_empty() {
        return Err("skill name cannot be empty".to_string());
    }
    if frontmatter.is_foundation && frontmatter.squad.is_some() {
        return Err("a foundation skill cannot declare a squad".to_string());
    }
    Ok(SkillManifest {
        name,
        squad: frontmatter.squad,
        system_prompt: body,
        reference_files: frontmatter.reference_files,
        tools: frontmatter.tools,
        is_foundation: frontmatter.is_foundation,
    })
}

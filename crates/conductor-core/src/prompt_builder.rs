//! Prompt builder (C4, §4.3): assembles the system prompt and user message
//! for one agent-executor call under a fixed token budget.

use conductor_types::{Learning, SkillManifest, Task};

use crate::storage::{Workspace, WorkspaceError};

#[derive(Debug, Clone)]
pub struct PromptBuildResult {
    pub system_prompt: String,
    pub user_message: String,
    pub estimated_tokens: u32,
    pub missing_inputs: Vec<String>,
    pub warnings: Vec<String>,
    pub learnings_included: usize,
}

const MAX_LEARNINGS: usize = 10;
const LEARNINGS_BUDGET_FRACTION: f64 = 0.05;

/// `ceil((chars) / 4)` token estimate (§4.3).
fn estimate_tokens(chars: usize) -> u32 {
    ((chars as f64) / 4.0).ceil() as u32
}

fn wrap(tag: &str, body: &str) -> String {
    format!("<{tag}>\n{body}\n</{tag}>\n\n")
}

pub async fn build_prompt(
    workspace: &Workspace,
    skill: &SkillManifest,
    task: &Task,
    max_tokens: u32,
) -> Result<PromptBuildResult, WorkspaceError> {
    let system_prompt = skill.system_prompt.clone();
    let mut missing_inputs = Vec::new();
    let mut warnings = Vec::new();

    let mut product_context_section = String::new();
    if let Some(context) = workspace.read_context().await? {
        product_context_section = wrap("product_context", &context);
    }

    let mut learnings = workspace.read_learnings(Some(&skill.name)).await?;
    learnings.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    learnings.truncate(MAX_LEARNINGS);
    let learnings_char_budget =
        ((max_tokens as f64) * LEARNINGS_BUDGET_FRACTION * 4.0).floor() as usize;
    let (capped_learnings, learnings_section) = cap_learnings_to_budget(&learnings, learnings_char_budget);

    let requirements_section = wrap("requirements", &task.requirements);

    let mut previous_output_section = String::new();
    if task.revision_count > 0 {
        if let Some(previous) = workspace.read_output(&task.output.path).await? {
            previous_output_section = wrap("previous_output", &previous);
        }
    }

    let mut input_sections = String::new();
    for input in &task.inputs {
        match workspace.read_file(&input.path).await? {
            Some(bytes) => {
                let text = String::from_utf8_lossy(&bytes);
                input_sections.push_str(&wrap(&format!("input path=\"{}\"", input.path), &text));
            }
            None => missing_inputs.push(input.path.clone()),
        }
    }

    let mut reference_sections: Vec<(String, String)> = Vec::new();
    for reference_path in &skill.reference_files {
        if let Some(bytes) = workspace.read_file(reference_path).await? {
            let text = String::from_utf8_lossy(&bytes).into_owned();
            reference_sections.push((reference_path.clone(), text));
        }
    }

    let core_user_message = format!(
        "{product_context_section}{learnings_section}{requirements_section}{previous_output_section}{input_sections}"
    );

    let mut included_references = reference_sections.clone();
    loop {
        let references_rendered: String = included_references
            .iter()
            .map(|(path, text)| wrap(&format!("reference path=\"{path}\""), text))
            .collect();
        let user_message = format!("{core_user_message}{references_rendered}");
        let estimated_tokens = estimate_tokens(system_prompt.len() + user_message.len());

        if estimated_tokens <= max_tokens || included_references.is_empty() {
            if estimated_tokens > max_tokens {
                warnings.push(format!(
                    "core prompt content ({estimated_tokens} tokens) exceeds the configured budget ({max_tokens}) even with all reference files dropped"
                ));
            }
            return Ok(PromptBuildResult {
                system_prompt,
                user_message,
                estimated_tokens,
                missing_inputs,
                warnings,
                learnings_included: capped_learnings,
            });
        }

        let dropped = included_references.pop().expect("non-empty checked above");
        warnings.push(format!(
            "dropped reference file `{}` to stay within the token budget",
            dropped.0
        ));
    }
}

/// Appends learnings newest-first until `char_budget` would be exceeded,
/// stopping before a partially-included entry rather than truncating mid-entry.
fn cap_learnings_to_budget(learnings: &[Learning], char_budget: usize) -> (usize, String) {
    let mut included = 0;
    let mut rendered = String::new();
    let mut running_chars = 0;
    for learning in learnings {
        let entry = render_learning(learning);
        if running_chars + entry.len() > char_budget && included > 0 {
            break;
        }
        running_chars += entry.len();
        rendered.push_str(&entry);
        included += 1;
    }
    if included == 0 {
        return (0, String::new());
    }
    (included, wrap("learnings", rendered.trim_end()))
}

fn render_learning(learning: &Learning) -> String {
    format!(
        "- [{}] {}: {} (action: {})\n",
        learning.timestamp.format("%Y-%m-%d"),
        learning.outcome,
        learning.learning,
        learning.action_taken
    )
}

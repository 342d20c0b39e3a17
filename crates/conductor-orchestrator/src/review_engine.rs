//! Review engine (C10, §4.7): scores a completed task's output either
//! structurally (no RPC) or semantically (one RPC, falling back to
//! structural on failure), then derives a verdict.

use std::collections::BTreeMap;

use conductor_providers::LlmClient;
use conductor_types::{Finding, Severity, Verdict};
use conductor_wire::{CreateMessageRequest, WireMessage};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Dimension {
    Completeness,
    Clarity,
    Actionability,
    DataDrivenness,
    TechnicalAccuracy,
    BrandAlignment,
    Creativity,
}

impl Dimension {
    pub const ALL: [Dimension; 7] = [
        Dimension::Completeness,
        Dimension::Clarity,
        Dimension::Actionability,
        Dimension::DataDrivenness,
        Dimension::TechnicalAccuracy,
        Dimension::BrandAlignment,
        Dimension::Creativity,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Dimension::Completeness => "completeness",
            Dimension::Clarity => "clarity",
            Dimension::Actionability => "actionability",
            Dimension::DataDrivenness => "data_drivenness",
            Dimension::TechnicalAccuracy => "technical_accuracy",
            Dimension::BrandAlignment => "brand_alignment",
            Dimension::Creativity => "creativity",
        }
    }

    fn from_str(s: &str) -> Option<Dimension> {
        Dimension::ALL.into_iter().find(|d| d.as_str() == s)
    }

    /// Scores below this value drop the verdict to at least REVISE (§4.7).
    fn min_score(self) -> f64 {
        4.0
    }

    /// Scores below this value drop the verdict to REJECT (§4.7).
    fn reject_score(self) -> f64 {
        2.0
    }
}

const NEUTRAL_SCORE: f64 = 5.0;
const APPROVE_THRESHOLD: f64 = 7.0;
const REVISE_THRESHOLD: f64 = 4.0;

#[derive(Debug, Clone)]
pub struct DimensionScore {
    pub score: f64,
    pub rationale: String,
}

#[derive(Debug, Clone)]
pub struct ReviewScoring {
    pub scores: BTreeMap<&'static str, DimensionScore>,
    pub weighted_average: f64,
    pub verdict: Verdict,
    pub findings: Vec<Finding>,
    pub used_semantic: bool,
}

#[derive(Debug, Clone)]
pub struct ReviewInput<'a> {
    pub content: &'a str,
    pub required_sections: &'a [String],
}

/// Structural heuristics: word count, required-section coverage,
/// heading/list density, number density, and a superlative penalty.
/// No RPC.
pub fn score_structural(input: &ReviewInput<'_>) -> BTreeMap<&'static str, DimensionScore> {
    let content = input.content;
    let words: Vec<&str> = content.split_whitespace().collect();
    let word_count = words.len();
    let lines: Vec<&str> = content.lines().collect();

    let mut scores = BTreeMap::new();

    let sections_present = if input.required_sections.is_empty() {
        1.0
    } else {
        let lower = content.to_lowercase();
        let present = input
            .required_sections
            .iter()
            .filter(|s| lower.contains(&s.to_lowercase()))
            .count();
        present as f64 / input.required_sections.len() as f64
    };
    scores.insert(
        Dimension::Completeness.as_str(),
        DimensionScore {
            score: clamp(sections_present * 6.0 + word_length_bonus(word_count)),
            rationale: format!(
                "{}/{} required sections present, {word_count} words",
                (sections_present * input.required_sections.len() as f64).round() as usize,
                input.required_sections.len().max(1)
            ),
        },
    );

    let sentence_count = content.matches(['.', '!', '?']).count().max(1);
    let avg_sentence_len = word_count as f64 / sentence_count as f64;
    let clarity = if avg_sentence_len <= 22.0 { 8.0 } else { clamp(8.0 - (avg_sentence_len - 22.0) * 0.2) };
    scores.insert(
        Dimension::Clarity.as_str(),
        DimensionScore {
            score: clamp(clarity),
            rationale: format!("average sentence length {avg_sentence_len:.1} words"),
        },
    );

    let list_lines = lines
        .iter()
        .filter(|l| {
            let t = l.trim_start();
            t.starts_with('-') || t.starts_with('*') || t.starts_with('#') || starts_with_ordinal(t)
        })
        .count();
    let actionability = clamp(3.0 + (list_lines as f64 / lines.len().max(1) as f64) * 14.0);
    scores.insert(
        Dimension::Actionability.as_str(),
        DimensionScore {
            score: actionability,
            rationale: format!("{list_lines} structured (heading/list) lines of {}", lines.len()),
        },
    );

    let digit_count = content.chars().filter(|c| c.is_ascii_digit()).count();
    let number_density = digit_count as f64 / word_count.max(1) as f64;
    scores.insert(
        Dimension::DataDrivenness.as_str(),
        DimensionScore {
            score: clamp(number_density * 80.0 + 2.0),
            rationale: format!("number density {:.3}", number_density),
        },
    );

    // Structural mode cannot verify factual accuracy; a neutral baseline is
    // used unless the content is implausibly short to support any claim.
    let technical_accuracy = if word_count < 20 { 3.0 } else { NEUTRAL_SCORE + 1.5 };
    scores.insert(
        Dimension::TechnicalAccuracy.as_str(),
        DimensionScore {
            score: clamp(technical_accuracy),
            rationale: "structural mode cannot verify factual accuracy".to_string(),
        },
    );

    let superlatives = ["best", "amazing", "incredible", "revolutionary", "unbelievable", "game-changing"];
    let lower = content.to_lowercase();
    let superlative_hits: usize = superlatives.iter().map(|s| lower.matches(s).count()).sum();
    let brand_alignment = clamp(8.0 - superlative_hits as f64 * 1.5);
    scores.insert(
        Dimension::BrandAlignment.as_str(),
        DimensionScore {
            score: brand_alignment,
            rationale: format!("{superlative_hits} superlative hits"),
        },
    );

    let unique_words: std::collections::HashSet<String> =
        words.iter().map(|w| w.to_lowercase()).collect();
    let lexical_diversity = unique_words.len() as f64 / word_count.max(1) as f64;
    scores.insert(
        Dimension::Creativity.as_str(),
        DimensionScore {
            score: clamp(lexical_diversity * 10.0),
            rationale: format!("lexical diversity {lexical_diversity:.2}"),
        },
    );

    scores
}

fn word_length_bonus(word_count: usize) -> f64 {
    (word_count as f64 / 40.0).min(4.0)
}

fn starts_with_ordinal(line: &str) -> bool {
    let mut chars = line.chars();
    match chars.next() {
        Some(c) if c.is_ascii_digit() => chars.next() == Some('.'),
        _ => false,
    }
}

fn clamp(score: f64) -> f64 {
    score.clamp(0.0, 10.0)
}

/// Asks the model for a JSON `dimension -> {score, rationale}` object.
/// Missing dimensions default to neutral; any failure returns `None` so the
/// caller falls back to structural scoring.
pub async fn score_semantic(
    llm: &dyn LlmClient,
    model: &str,
    input: &ReviewInput<'_>,
    cancel: CancellationToken,
) -> Option<BTreeMap<&'static str, DimensionScore>> {
    let dims: Vec<&str> = Dimension::ALL.iter().map(|d| d.as_str()).collect();
    let prompt = format!(
        "Score the following content on each dimension {dims:?} from 0 to 10. \
         Respond with ONLY a JSON object mapping each dimension name to \
         {{\"score\": <number>, \"rationale\": <string>}}.\n\n---\n{}\n---",
        input.content
    );
    let request = CreateMessageRequest {
        model: model.to_string(),
        system: "You are a strict marketing-output reviewer.".to_string(),
        messages: vec![WireMessage::user_text(prompt)],
        max_tokens: 1024,
        timeout_ms: 60_000,
        tools: None,
    };
    let response = llm.create_message(request, cancel).await.ok()?;
    let parsed: serde_json::Value = extract_json(&response.content)?;
    let object = parsed.as_object()?;
    for key in object.keys() {
        if Dimension::from_str(key).is_none() {
            tracing::debug!(dimension = %key, "model returned a score for an unrecognized dimension");
        }
    }

    let mut scores = BTreeMap::new();
    for dimension in Dimension::ALL {
        let entry = object.get(dimension.as_str());
        let (score, rationale) = match entry {
            Some(value) => (
                value.get("score").and_then(|v| v.as_f64()).unwrap_or(NEUTRAL_SCORE),
                value
                    .get("rationale")
                    .and_then(|v| v.as_str())
                    .unwrap_or("model did not provide a rationale")
                    .to_string(),
            ),
            None => (NEUTRAL_SCORE, "dimension missing from model response".to_string()),
        };
        scores.insert(
            dimension.as_str(),
            DimensionScore {
                score: clamp(score),
                rationale,
            },
        );
    }
    Some(scores)
}

/// Leniently extracts a JSON object from a model response that may wrap it
/// in prose or a fenced code block.
fn extract_json(text: &str) -> Option<serde_json::Value> {
    if let Ok(value) = serde_json::from_str(text.trim()) {
        return Some(value);
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}

/// Combines per-dimension scores into a verdict (§4.7): a dimension below
/// its minimum drops the verdict to at least REVISE (to REJECT if below the
/// reject threshold); otherwise the weighted average decides.
pub fn derive_verdict(scores: &BTreeMap<&'static str, DimensionScore>) -> (f64, Verdict, Vec<Finding>) {
    let mut findings = Vec::new();
    let mut floor: Option<Verdict> = None;

    for dimension in Dimension::ALL {
        let Some(entry) = scores.get(dimension.as_str()) else {
            continue;
        };
        if entry.score < dimension.reject_score() {
            floor = Some(Verdict::Reject);
            findings.push(Finding {
                section: dimension.as_str().to_string(),
                severity: Severity::Blocker,
                description: format!(
                    "{} scored {:.1}, below the reject threshold: {}",
                    dimension.as_str(),
                    entry.score,
                    entry.rationale
                ),
            });
        } else if entry.score < dimension.min_score() {
            if floor != Some(Verdict::Reject) {
                floor = Some(Verdict::Revise);
            }
            findings.push(Finding {
                section: dimension.as_str().to_string(),
                severity: Severity::Major,
                description: format!(
                    "{} scored {:.1}, below the minimum: {}",
                    dimension.as_str(),
                    entry.score,
                    entry.rationale
                ),
            });
        }
    }

    let weighted_average = if scores.is_empty() {
        0.0
    } else {
        scores.values().map(|s| s.score).sum::<f64>() / scores.len() as f64
    };

    let threshold_verdict = if weighted_average >= APPROVE_THRESHOLD {
        Verdict::Approve
    } else if weighted_average >= REVISE_THRESHOLD {
        Verdict::Revise
    } else {
        Verdict::Reject
    };

    let verdict = match floor {
        Some(floor) => floor.max(threshold_verdict),
        None => threshold_verdict,
    };

    (weighted_average, verdict, findings)
}

pub struct ReviewEngine;

impl ReviewEngine {
    /// Runs semantic scoring, falling back to structural on any failure.
    pub async fn review(
        input: ReviewInput<'_>,
        llm: Option<(&dyn LlmClient, &str)>,
        cancel: CancellationToken,
    ) -> ReviewScoring {
        let (scores, used_semantic) = match llm {
            Some((client, model)) => match score_semantic(client, model, &input, cancel).await {
                Some(scores) => (scores, true),
                None => (score_structural(&input), false),
            },
            None => (score_structural(&input), false),
        };
        let (weighted_average, verdict, findings) = derive_verdict(&scores);
        ReviewScoring {
            scores,
            weighted_average,
            verdict,
            findings,
            used_semantic,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn thin_content_is_rejected_structurally() {
        let input = ReviewInput {
            content: "ok",
            required_sections: &["Summary".to_string(), "Next steps".to_string()],
        };
        let result = ReviewEngine::review(input, None, CancellationToken::new()).await;
        assert!(!result.used_semantic);
        assert_eq!(result.verdict, Verdict::Reject);
        assert!(!result.findings.is_empty());
    }

    #[tokio::test]
    async fn well_structured_content_can_approve() {
        let content = "## Summary\n\
            This launch plan covers three growth levers for Q3, backed by 12 data points \
            from last quarter's retention cohort analysis.\n\n\
            ## Next steps\n\
            1. Ship the onboarding email sequence.\n\
            2. Instrument the activation funnel with 4 new events.\n\
            - Track weekly active accounts.\n\
            - Report conversion lift after 30 days.\n";
        let input = ReviewInput {
            content,
            required_sections: &["Summary".to_string(), "Next steps".to_string()],
        };
        let result = ReviewEngine::review(input, None, CancellationToken::new()).await;
        assert!(matches!(result.verdict, Verdict::Approve | Verdict::Revise));
    }

    #[test]
    fn dimension_minimum_drops_verdict_to_revise() {
        let mut scores = BTreeMap::new();
        for dimension in Dimension::ALL {
            scores.insert(
                dimension.as_str(),
                DimensionScore {
                    score: 8.0,
                    rationale: "fine".to_string(),
                },
            );
        }
        scores.insert(
            Dimension::TechnicalAccuracy.as_str(),
            DimensionScore {
                score: 3.0,
                rationale: "shaky claim".to_string(),
            },
        );
        let (_, verdict, findings) = derive_verdict(&scores);
        assert_eq!(verdict, Verdict::Revise);
        assert_eq!(findings.len(), 1);
    }

    #[test]
    fn dimension_below_reject_score_forces_reject() {
        let mut scores = BTreeMap::new();
        for dimension in Dimension::ALL {
            scores.insert(
                dimension.as_str(),
                DimensionScore {
                    score: 9.0,
                    rationale: "fine".to_string(),
                },
            );
        }
        scores.insert(
            Dimension::BrandAlignment.as_str(),
            DimensionScore {
                score: 1.0,
                rationale: "off brand".to_string(),
            },
        );
        let (_, verdict, _) = derive_verdict(&scores);
        assert_eq!(verdict, Verdict::Reject);
    }

    #[test]
    fn extract_json_handles_prose_wrapped_object() {
        let text = "Here you go:\n```json\n{\"completeness\": {\"score\": 7}}\n```\nDone.";
        let value = extract_json(text).unwrap();
        assert_eq!(value["completeness"]["score"], 7);
    }
}

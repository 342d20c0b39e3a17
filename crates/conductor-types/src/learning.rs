use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One append-only entry in `memory/learnings.md` (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Learning {
    pub timestamp: DateTime<Utc>,
    pub agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal_id: Option<String>,
    pub outcome: String,
    pub learning: String,
    pub action_taken: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn learning_round_trips_through_json() {
        let entry = Learning {
            timestamp: Utc::now(),
            agent: "copywriting".to_string(),
            goal_id: Some("goal-20260801-abcdef".to_string()),
            outcome: "approved".to_string(),
            learning: "shorter headlines converted better".to_string(),
            action_taken: "trimmed headline length guidance".to_string(),
        };
        let json = serde_json::to_string(&entry).unwrap();
        let back: Learning = serde_json::from_str(&json).unwrap();
        assert_eq!(back.agent, entry.agent);
        assert_eq!(back.learning, entry.learning);
    }
}

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use conductor_types::{ModelTier, Priority};

/// The five-state degradation driven by cumulative cost vs. configured total
/// (§3, §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetLevel {
    Normal,
    Warning,
    Throttle,
    Critical,
    Exhausted,
}

impl BudgetLevel {
    /// `allowedPriorities` is monotonically shrinking as level increases
    /// (invariant I2): `normal ⊇ warning ⊇ throttle ⊇ critical ⊇ exhausted = ∅`.
    pub fn allowed_priorities(self) -> BTreeSet<Priority> {
        match self {
            BudgetLevel::Normal => Priority::P3.and_higher(),
            BudgetLevel::Warning => Priority::P2.and_higher(),
            BudgetLevel::Throttle => Priority::P1.and_higher(),
            BudgetLevel::Critical => Priority::P0.and_higher(),
            BudgetLevel::Exhausted => BTreeSet::new(),
        }
    }

    /// The level mapping also carries an optional forced model override
    /// (typically `haiku` at `critical`/`exhausted`, §3).
    pub fn forced_model_tier(self) -> Option<ModelTier> {
        match self {
            BudgetLevel::Critical | BudgetLevel::Exhausted => Some(ModelTier::Haiku),
            _ => None,
        }
    }

    pub fn allows(self, priority: Priority) -> bool {
        self.allowed_priorities().contains(&priority)
    }
}

/// Percent-used thresholds that separate consecutive budget levels. Defaults
/// are 80/90/95/100 (§4.1). Comparisons are strictly-less-than, so a value
/// exactly at a threshold belongs to the lower level (§8 B2, resolved in
/// SPEC_FULL §10.6).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BudgetThresholds {
    pub warning: f64,
    pub throttle: f64,
    pub critical: f64,
    pub exhausted: f64,
}

impl Default for BudgetThresholds {
    fn default() -> Self {
        Self {
            warning: 80.0,
            throttle: 90.0,
            critical: 95.0,
            exhausted: 100.0,
        }
    }
}

impl BudgetThresholds {
    pub fn level_for_percent(self, percent_used: f64) -> BudgetLevel {
        if percent_used < self.warning {
            BudgetLevel::Normal
        } else if percent_used < self.throttle {
            BudgetLevel::Warning
        } else if percent_used < self.critical {
            BudgetLevel::Throttle
        } else if percent_used < self.exhausted {
            BudgetLevel::Critical
        } else {
            BudgetLevel::Exhausted
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetState {
    pub level: BudgetLevel,
    pub percent_used: f64,
    pub allowed_priorities: BTreeSet<Priority>,
    pub model_override: Option<ModelTier>,
}

impl BudgetState {
    pub fn derive(spent_usd: f64, total_monthly_usd: f64, thresholds: BudgetThresholds) -> Self {
        let percent_used = if total_monthly_usd == 0.0 {
            if spent_usd > 0.0 {
                // totalMonthly == 0 and spent > 0 forces `exhausted` (B1).
                f64::INFINITY
            } else {
                0.0
            }
        } else {
            100.0 * spent_usd / total_monthly_usd
        };
        let level = if percent_used.is_infinite() {
            BudgetLevel::Exhausted
        } else {
            thresholds.level_for_percent(percent_used)
        };
        Self {
            level,
            percent_used: if percent_used.is_finite() {
                percent_used
            } else {
                100.0
            },
            allowed_priorities: level.allowed_priorities(),
            model_override: level.forced_model_tier(),
        }
    }

    pub fn allows(&self, priority: Priority) -> bool {
        self.allowed_priorities.contains(&priority)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowed_priorities_shrink_monotonically() {
        let normal = BudgetLevel::Normal.allowed_priorities();
        let warning = BudgetLevel::Warning.allowed_priorities();
        let throttle = BudgetLevel::Throttle.allowed_priorities();
        let critical = BudgetLevel::Critical.allowed_priorities();
        let exhausted = BudgetLevel::Exhausted.allowed_priorities();
        assert!(warning.is_subset(&normal));
        assert!(throttle.is_subset(&warning));
        assert!(critical.is_subset(&throttle));
        assert!(exhausted.is_subset(&critical));
        assert!(exhausted.is_empty());
    }

    #[test]
    fn zero_total_with_positive_spend_is_exhausted() {
        let state = BudgetState::derive(5.0, 0.0, BudgetThresholds::default());
        assert_eq!(state.level, BudgetLevel::Exhausted);
    }

    #[test]
    fn zero_total_with_zero_spend_is_normal() {
        let state = BudgetState::derive(0.0, 0.0, BudgetThresholds::default());
        assert_eq!(state.level, BudgetLevel::Normal);
    }

    #[test]
    fn boundary_percent_belongs_to_lower_level() {
        let thresholds = BudgetThresholds::default();
        // Exactly at 80.00% is strictly-less-than 80 == false, so it is the
        // *next* level per the strict-less-than rule: warning starts at 80.
        assert_eq!(
            BudgetState::derive(80.0, 100.0, thresholds).level,
            BudgetLevel::Warning
        );
        assert_eq!(
            BudgetState::derive(79.999, 100.0, thresholds).level,
            BudgetLevel::Normal
        );
    }

    #[test]
    fn critical_forces_haiku_and_restricts_to_p0() {
        let state = BudgetState::derive(96.0, 100.0, BudgetThresholds::default());
        assert_eq!(state.level, BudgetLevel::Critical);
        assert_eq!(state.model_override, Some(ModelTier::Haiku));
        assert_eq!(state.allowed_priorities, Priority::P0.and_higher());
    }

    #[test]
    fn e2e_normal_to_warning_scenario() {
        let thresholds = BudgetThresholds::default();
        let after_79 = BudgetState::derive(79.0, 100.0, thresholds);
        assert_eq!(after_79.level, BudgetLevel::Normal);
        let after_81 = BudgetState::derive(81.0, 100.0, thresholds);
        assert_eq!(after_81.level, BudgetLevel::Warning);
        assert!(!after_81.allowed_priorities.contains(&Priority::P3));
        assert!(after_81.allowed_priorities.contains(&Priority::P2));
    }

    #[test]
    fn e2e_exhausted_scenario() {
        let state = BudgetState::derive(101.0, 100.0, BudgetThresholds::default());
        assert_eq!(state.level, BudgetLevel::Exhausted);
        assert!(!state.allows(Priority::P0));
    }
}

//! Health monitor (C16, §4.12): fans registered component checks out under a
//! per-check timeout and derives one system-wide level, adjusted for the
//! current budget state.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use conductor_budget::BudgetState;
use conductor_orchestrator::{run_bounded, HarnessTask};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentStatus {
    Up,
    Degraded,
    Offline,
}

#[derive(Debug, Clone)]
pub struct ComponentCheck {
    pub name: String,
    pub status: ComponentStatus,
    pub details: String,
}

#[async_trait]
pub trait HealthCheck: Send + Sync {
    fn name(&self) -> &str;
    async fn check(&self) -> ComponentCheck;
}

/// System health level (§4.12). `SingleOffline` and `DegradedComponent` are
/// both labeled "degraded" externally; they're kept as distinct variants
/// internally so the numeric code (used by the CLI's exit status) is exact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HealthLevel {
    Healthy,
    DegradedComponent,
    SingleOffline,
    Paused,
    Offline,
}

impl HealthLevel {
    pub fn code(self) -> u8 {
        match self {
            HealthLevel::Healthy => 0,
            HealthLevel::DegradedComponent => 1,
            HealthLevel::SingleOffline => 2,
            HealthLevel::Paused => 3,
            HealthLevel::Offline => 4,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            HealthLevel::Healthy => "healthy",
            HealthLevel::DegradedComponent | HealthLevel::SingleOffline => "degraded",
            HealthLevel::Paused => "paused",
            HealthLevel::Offline => "offline",
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthReport {
    pub level: HealthLevel,
    pub checks: Vec<ComponentCheck>,
    pub active_agents: u32,
    pub queue_depth: u64,
    pub budget_percent_used: Option<f64>,
}

/// Derives the level from component checks alone (§4.12 bullets).
fn derive_level(checks: &[ComponentCheck]) -> HealthLevel {
    let total = checks.len();
    let offline = checks.iter().filter(|c| c.status == ComponentStatus::Offline).count();
    let degraded = checks.iter().any(|c| c.status == ComponentStatus::Degraded);

    if total > 0 && offline == total {
        HealthLevel::Offline
    } else if offline >= 2 {
        HealthLevel::Paused
    } else if offline == 1 {
        HealthLevel::SingleOffline
    } else if degraded {
        HealthLevel::DegradedComponent
    } else {
        HealthLevel::Healthy
    }
}

pub struct HealthMonitor {
    checks: Vec<Arc<dyn HealthCheck>>,
    check_timeout: Duration,
}

impl HealthMonitor {
    pub fn new(checks: Vec<Arc<dyn HealthCheck>>, check_timeout: Duration) -> Self {
        Self { checks, check_timeout }
    }

    pub async fn check_health(
        &self,
        active_agents: u32,
        queue_depth: u64,
        budget: Option<&BudgetState>,
    ) -> HealthReport {
        let timeout = self.check_timeout;
        let tasks: Vec<HarnessTask<ComponentCheck>> = self
            .checks
            .iter()
            .cloned()
            .map(|check| -> HarnessTask<ComponentCheck> {
                Box::new(move |_child: CancellationToken| {
                    Box::pin(async move {
                        match tokio::time::timeout(timeout, check.check()).await {
                            Ok(result) => result,
                            Err(_) => ComponentCheck {
                                name: check.name().to_string(),
                                status: ComponentStatus::Offline,
                                details: format!("health check timed out after {timeout:?}"),
                            },
                        }
                    })
                })
            })
            .collect();

        let outcome = run_bounded(tasks, self.checks.len().max(1), CancellationToken::new(), |_| false).await;
        let mut checks: Vec<ComponentCheck> = outcome.results.into_iter().map(|item| item.output).collect();
        checks.sort_by(|a, b| a.name.cmp(&b.name));

        let level = derive_level(&checks);
        HealthReport {
            level,
            checks,
            active_agents,
            queue_depth,
            budget_percent_used: budget.map(|b| b.percent_used),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_budget::BudgetThresholds;

    struct FixedCheck {
        name: String,
        status: ComponentStatus,
    }

    #[async_trait]
    impl HealthCheck for FixedCheck {
        fn name(&self) -> &str {
            &self.name
        }
        async fn check(&self) -> ComponentCheck {
            ComponentCheck {
                name: self.name.clone(),
                status: self.status,
                details: String::new(),
            }
        }
    }

    struct HangingCheck;

    #[async_trait]
    impl HealthCheck for HangingCheck {
        fn name(&self) -> &str {
            "hanging"
        }
        async fn check(&self) -> ComponentCheck {
            tokio::time::sleep(Duration::from_secs(60)).await;
            ComponentCheck {
                name: "hanging".to_string(),
                status: ComponentStatus::Up,
                details: String::new(),
            }
        }
    }

    fn check(name: &str, status: ComponentStatus) -> Arc<dyn HealthCheck> {
        Arc::new(FixedCheck { name: name.to_string(), status })
    }

    #[tokio::test]
    async fn all_up_is_healthy() {
        let monitor = HealthMonitor::new(
            vec![check("queue", ComponentStatus::Up), check("llm", ComponentStatus::Up)],
            Duration::from_millis(50),
        );
        let report = monitor.check_health(2, 0, None).await;
        assert_eq!(report.level, HealthLevel::Healthy);
    }

    #[tokio::test]
    async fn one_offline_component_is_single_offline() {
        let monitor = HealthMonitor::new(
            vec![check("queue", ComponentStatus::Offline), check("llm", ComponentStatus::Up)],
            Duration::from_millis(50),
        );
        let report = monitor.check_health(2, 0, None).await;
        assert_eq!(report.level, HealthLevel::SingleOffline);
    }

    #[tokio::test]
    async fn two_offline_components_pause() {
        let monitor = HealthMonitor::new(
            vec![
                check("queue", ComponentStatus::Offline),
                check("llm", ComponentStatus::Offline),
                check("workspace", ComponentStatus::Up),
            ],
            Duration::from_millis(50),
        );
        let report = monitor.check_health(2, 0, None).await;
        assert_eq!(report.level, HealthLevel::Paused);
    }

    #[tokio::test]
    async fn all_offline_is_offline() {
        let monitor = HealthMonitor::new(vec![check("queue", ComponentStatus::Offline)], Duration::from_millis(50));
        let report = monitor.check_health(0, 0, None).await;
        assert_eq!(report.level, HealthLevel::Offline);
    }

    #[tokio::test]
    async fn a_timed_out_check_counts_as_offline() {
        let monitor = HealthMonitor::new(
            vec![Arc::new(HangingCheck), check("llm", ComponentStatus::Up)],
            Duration::from_millis(10),
        );
        let report = monitor.check_health(1, 0, None).await;
        assert_eq!(report.level, HealthLevel::SingleOffline);
    }

    #[tokio::test]
    async fn budget_is_reported_but_does_not_change_the_level() {
        let monitor = HealthMonitor::new(vec![check("queue", ComponentStatus::Up)], Duration::from_millis(50));
        let exhausted = BudgetState::derive(200.0, 100.0, BudgetThresholds::default());
        let report = monitor.check_health(1, 0, Some(&exhausted)).await;
        assert_eq!(report.level, HealthLevel::Healthy);
        assert_eq!(report.budget_percent_used, Some(100.0));
    }
}

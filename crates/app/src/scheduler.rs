use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};

use crate::health::HealthCheckService;

/// Background worker that triggers a health-check run on a fixed cadence.
#[derive(Clone)]
pub struct HealthCheckScheduler {
    service: HealthCheckService,
    interval: Duration,
}

impl HealthCheckScheduler {
    pub fn new(service: HealthCheckService, interval: Duration) -> Self {
        Self { service, interval }
    }

    /// Runs the scheduler loop in the background.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run_loop().await;
        })
    }

    async fn run_loop(self) {
        info!(
            stage = "app",
            interval_secs = self.interval.as_secs(),
            "health check scheduler started"
        );
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.tick().await;
        }
    }

    /// Executes one scheduled run. Failures are logged; the next tick tries again.
    pub async fn tick(&self) {
        if let Err(err) = self.service.run_once().await {
            error!(stage = "app", error = %err, "scheduled health check failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    use mirrorwatch_core::DomainStatus;

    use crate::test_support::{fixed_now, Harness};

    #[tokio::test]
    async fn tick_runs_a_full_check() {
        let harness = Harness::new().await;
        let a = harness.add("a.example", 10).await;
        harness.head.set("a.example", 200);

        let scheduler = HealthCheckScheduler::new(harness.service(1), Duration::from_secs(60));
        scheduler.tick().await;

        let stored = harness.domain(&a.id).await;
        assert_eq!(stored.status, DomainStatus::Active);
        assert_eq!(stored.last_checked_at, Some(fixed_now()));
    }

    #[tokio::test]
    async fn spawned_loop_runs_immediately() {
        let harness = Harness::new().await;
        let a = harness.add("a.example", 10).await;
        harness.head.set("a.example", 200);

        let handle =
            HealthCheckScheduler::new(harness.service(1), Duration::from_secs(3600)).spawn();

        let checked = timeout(Duration::from_secs(5), async {
            loop {
                if harness.domain(&a.id).await.last_checked_at.is_some() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        handle.abort();
        assert!(checked.is_ok(), "first tick should fire without waiting a full interval");
    }
}

use crate::orchestrator::{SyncOrchestrator, TriggerOutcome};
use chrono::Utc;
use cloudmon_common::{SyncDomain, SyncTrigger};
use std::sync::Arc;
use tokio::time::{interval, Duration, MissedTickBehavior};

/// Fires the aggregate sync whenever it is due.
pub struct SyncScheduler {
    orchestrator: Arc<SyncOrchestrator>,
    tick_secs: u64,
    run_on_startup: bool,
}

impl SyncScheduler {
    pub fn new(orchestrator: Arc<SyncOrchestrator>, tick_secs: u64, run_on_startup: bool) -> Self {
        Self {
            orchestrator,
            tick_secs: tick_secs.max(1),
            run_on_startup,
        }
    }

    pub async fn run(&self) {
        tracing::info!(
            tick_secs = self.tick_secs,
            run_on_startup = self.run_on_startup,
            "Sync scheduler started"
        );

        if self.run_on_startup {
            self.run_once(SyncTrigger::Startup).await;
        } else {
            self.orchestrator.defer_schedule(Utc::now());
        }

        let mut tick = interval(Duration::from_secs(self.tick_secs));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        tick.tick().await;
        loop {
            tick.tick().await;
            if self.orchestrator.due_for_schedule(Utc::now()) {
                self.run_once(SyncTrigger::Scheduled).await;
            }
        }
    }

    async fn run_once(&self, trigger: SyncTrigger) {
        match self.orchestrator.trigger(SyncDomain::All, trigger).await {
            TriggerOutcome::Completed(report) => {
                for failure in &report.failures {
                    tracing::error!(
                        provider = %failure.provider,
                        error = %failure.error,
                        "Provider sync failed"
                    );
                }
            }
            TriggerOutcome::NotStarted { reason, .. } => {
                tracing::debug!(?reason, trigger = %trigger, "Aggregate sync not started");
            }
        }
    }
}

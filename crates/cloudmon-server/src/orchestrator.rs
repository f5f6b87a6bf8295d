//! Run-state tracking and snapshot commits for sync domains.

use anyhow::Context;
use chrono::{DateTime, Utc};
use cloudmon_cloud::ProviderCollector;
use cloudmon_common::id::next_sync_token;
use cloudmon_common::{Provider, SyncDomain, SyncRunSummary, SyncState, SyncStatus, SyncTrigger};
use cloudmon_storage::{ReplaceOptions, SnapshotStore};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Why a trigger did not start a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotStartedReason {
    /// A run of the same domain is already in flight.
    Conflict,
    /// No collector for the domain has usable credentials.
    NotConfigured,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderFailure {
    pub provider: Provider,
    pub error: String,
}

/// Result of one run that actually started.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub domain: SyncDomain,
    pub trigger: SyncTrigger,
    pub status: SyncStatus,
    /// One entry per provider whose snapshot was replaced.
    pub summaries: Vec<SyncRunSummary>,
    pub failures: Vec<ProviderFailure>,
    /// Providers an aggregate run passed over: unconfigured, or busy with
    /// their own run.
    pub skipped: Vec<Provider>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TriggerOutcome {
    Completed(RunReport),
    NotStarted {
        domain: SyncDomain,
        reason: NotStartedReason,
    },
}

impl TriggerOutcome {
    pub fn started(&self) -> bool {
        matches!(self, TriggerOutcome::Completed(_))
    }
}

type StateMap = BTreeMap<SyncDomain, SyncState>;

/// Owns the run state of every sync domain and commits collector output
/// to the snapshot store, one replace-latest per provider.
pub struct SyncOrchestrator {
    collectors: BTreeMap<Provider, Arc<dyn ProviderCollector>>,
    store: Arc<dyn SnapshotStore>,
    interval: chrono::Duration,
    states: Mutex<StateMap>,
}

/// Marks a domain as running for as long as it is held. Dropping it without
/// [`RunGuard::finish`] records the run as aborted.
struct RunGuard<'a> {
    orchestrator: &'a SyncOrchestrator,
    domain: SyncDomain,
    finished: bool,
}

impl RunGuard<'_> {
    fn finish(mut self, status: SyncStatus, error: Option<String>) {
        self.finished = true;
        self.orchestrator.complete(self.domain, status, error);
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.orchestrator.complete(
                self.domain,
                SyncStatus::Error,
                Some("sync run aborted".to_string()),
            );
        }
    }
}

impl SyncOrchestrator {
    pub fn new(
        collectors: Vec<Arc<dyn ProviderCollector>>,
        store: Arc<dyn SnapshotStore>,
        interval: Duration,
    ) -> Self {
        let mut states = StateMap::new();
        states.insert(SyncDomain::All, SyncState::default());
        for provider in Provider::ALL {
            states.insert(SyncDomain::Provider(provider), SyncState::default());
        }
        Self {
            collectors: collectors.into_iter().map(|c| (c.provider(), c)).collect(),
            store,
            interval: chrono::Duration::from_std(interval)
                .unwrap_or_else(|_| chrono::Duration::seconds(900)),
            states: Mutex::new(states),
        }
    }

    /// Lock the state map, recovering from a poisoned Mutex if necessary.
    fn lock_states(&self) -> MutexGuard<'_, StateMap> {
        self.states.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Current state of every domain.
    pub fn status(&self) -> BTreeMap<SyncDomain, SyncState> {
        self.lock_states().clone()
    }

    pub fn state(&self, domain: SyncDomain) -> SyncState {
        self.lock_states().get(&domain).cloned().unwrap_or_default()
    }

    pub fn is_configured(&self, provider: Provider) -> bool {
        self.collectors
            .get(&provider)
            .is_some_and(|c| c.is_configured())
    }

    /// Whether the aggregate domain is idle and its next run time has passed.
    pub fn due_for_schedule(&self, now: DateTime<Utc>) -> bool {
        let states = self.lock_states();
        match states.get(&SyncDomain::All) {
            Some(state) => !state.running && state.next_run_at.map_or(true, |at| now >= at),
            None => true,
        }
    }

    /// Push the aggregate domain's next run one interval out without running it.
    pub fn defer_schedule(&self, now: DateTime<Utc>) {
        let mut states = self.lock_states();
        states.entry(SyncDomain::All).or_default().next_run_at = Some(now + self.interval);
    }

    /// Check-and-set the running flag. Must be called before the first
    /// `.await` of a run.
    fn try_begin(&self, domain: SyncDomain) -> Option<RunGuard<'_>> {
        let mut states = self.lock_states();
        let state = states.entry(domain).or_default();
        if state.running {
            return None;
        }
        state.running = true;
        state.last_started_at = Some(Utc::now());
        state.last_error = None;
        Some(RunGuard {
            orchestrator: self,
            domain,
            finished: false,
        })
    }

    fn complete(&self, domain: SyncDomain, status: SyncStatus, error: Option<String>) {
        let now = Utc::now();
        let mut states = self.lock_states();
        let state = states.entry(domain).or_default();
        state.running = false;
        state.last_finished_at = Some(now);
        state.last_status = Some(status);
        state.last_error = error;
        state.next_run_at = Some(now + self.interval);
    }

    fn record_skipped(&self, domain: SyncDomain, reason: &str) {
        let now = Utc::now();
        let mut states = self.lock_states();
        let state = states.entry(domain).or_default();
        if state.running {
            return;
        }
        state.last_status = Some(SyncStatus::Skipped);
        state.last_error = Some(reason.to_string());
        state.next_run_at = Some(now + self.interval);
    }

    /// Run one domain now. A domain already running is reported as
    /// not started rather than queued.
    pub async fn trigger(&self, domain: SyncDomain, trigger: SyncTrigger) -> TriggerOutcome {
        match domain {
            SyncDomain::Provider(provider) => self.trigger_provider(provider, trigger).await,
            SyncDomain::All => self.trigger_all(trigger).await,
        }
    }

    async fn trigger_provider(&self, provider: Provider, trigger: SyncTrigger) -> TriggerOutcome {
        let domain = SyncDomain::Provider(provider);
        if !self.is_configured(provider) {
            self.record_skipped(domain, "not configured");
            tracing::info!(provider = %provider, "Sync skipped, provider not configured");
            return TriggerOutcome::NotStarted {
                domain,
                reason: NotStartedReason::NotConfigured,
            };
        }
        let Some(guard) = self.try_begin(domain) else {
            tracing::warn!(provider = %provider, "Sync already running, request rejected");
            return TriggerOutcome::NotStarted {
                domain,
                reason: NotStartedReason::Conflict,
            };
        };

        let mut report = RunReport::new(domain, trigger);
        match self.run_provider(provider, trigger).await {
            Ok(summary) => {
                report.summaries.push(summary);
                guard.finish(SyncStatus::Ok, None);
            }
            Err(e) => {
                let message = format!("{e:#}");
                report.status = SyncStatus::Error;
                report.failures.push(ProviderFailure {
                    provider,
                    error: message.clone(),
                });
                guard.finish(SyncStatus::Error, Some(message));
            }
        }
        TriggerOutcome::Completed(report)
    }

    async fn trigger_all(&self, trigger: SyncTrigger) -> TriggerOutcome {
        let domain = SyncDomain::All;
        let (configured, unconfigured): (Vec<Provider>, Vec<Provider>) = Provider::ALL
            .into_iter()
            .partition(|p| self.is_configured(*p));
        if configured.is_empty() {
            self.record_skipped(domain, "no provider configured");
            tracing::info!("Sync skipped, no provider configured");
            return TriggerOutcome::NotStarted {
                domain,
                reason: NotStartedReason::NotConfigured,
            };
        }
        let Some(guard) = self.try_begin(domain) else {
            tracing::warn!("Aggregate sync already running, request rejected");
            return TriggerOutcome::NotStarted {
                domain,
                reason: NotStartedReason::Conflict,
            };
        };

        tracing::info!(trigger = %trigger, providers = configured.len(), "Aggregate sync started");
        let mut report = RunReport::new(domain, trigger);
        report.skipped = unconfigured;

        for provider in configured {
            let Some(provider_guard) = self.try_begin(SyncDomain::Provider(provider)) else {
                tracing::warn!(provider = %provider, "Provider busy, skipped in aggregate sync");
                report.skipped.push(provider);
                continue;
            };
            match self.run_provider(provider, trigger).await {
                Ok(summary) => {
                    report.summaries.push(summary);
                    provider_guard.finish(SyncStatus::Ok, None);
                }
                Err(e) => {
                    let message = format!("{e:#}");
                    report.failures.push(ProviderFailure {
                        provider,
                        error: message.clone(),
                    });
                    provider_guard.finish(SyncStatus::Error, Some(message));
                }
            }
        }

        if report.failures.is_empty() {
            guard.finish(SyncStatus::Ok, None);
        } else {
            report.status = SyncStatus::Error;
            let message = report
                .failures
                .iter()
                .map(|f| format!("{}: {}", f.provider, f.error))
                .collect::<Vec<_>>()
                .join("; ");
            guard.finish(SyncStatus::Error, Some(message));
        }
        tracing::info!(
            status = %report.status,
            committed = report.summaries.len(),
            failed = report.failures.len(),
            skipped = report.skipped.len(),
            "Aggregate sync finished"
        );
        TriggerOutcome::Completed(report)
    }

    /// Collect one provider and replace its snapshot. Nothing is written
    /// unless collection succeeds.
    async fn run_provider(
        &self,
        provider: Provider,
        trigger: SyncTrigger,
    ) -> anyhow::Result<SyncRunSummary> {
        let collector = self
            .collectors
            .get(&provider)
            .cloned()
            .with_context(|| format!("no collector registered for {provider}"))?;

        tracing::info!(provider = %provider, trigger = %trigger, "Sync started");
        let report = match collector.collect().await {
            Ok(report) => report,
            Err(e) => {
                tracing::error!(provider = %provider, error = %e, "Sync failed, previous snapshot kept");
                return Err(e).with_context(|| format!("{provider} collection failed"));
            }
        };
        // the snapshot is as fresh as the end of collection
        let fetched_at = Utc::now();

        let sync_token = next_sync_token();
        let options = ReplaceOptions {
            fetched_at,
            sync_token: sync_token.clone(),
        };
        let store = self.store.clone();
        let records = report.records;
        let outcome = tokio::task::spawn_blocking(move || {
            store.replace_latest(provider, &records, &options)
        })
        .await
        .context("snapshot commit task panicked")?
        .with_context(|| format!("failed to commit {provider} snapshot"))?;

        let summary = SyncRunSummary {
            provider,
            trigger,
            fetched_at,
            resources_discovered: report.resources_discovered,
            resources_processed: report.resources_processed,
            errors: report.errors,
            truncated: report.truncated,
            sync_token,
            upserted_count: outcome.upserted_count,
            stale_deleted_count: outcome.stale_deleted_count,
        };
        tracing::info!(
            provider = %provider,
            discovered = summary.resources_discovered,
            processed = summary.resources_processed,
            errors = summary.errors.total(),
            truncated = summary.truncated,
            upserted = summary.upserted_count,
            stale_deleted = summary.stale_deleted_count,
            "Sync finished"
        );
        Ok(summary)
    }
}

impl RunReport {
    fn new(domain: SyncDomain, trigger: SyncTrigger) -> Self {
        Self {
            domain,
            trigger,
            status: SyncStatus::Ok,
            summaries: Vec::new(),
            failures: Vec::new(),
            skipped: Vec::new(),
        }
    }
}

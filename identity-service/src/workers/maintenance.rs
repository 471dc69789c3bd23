//! Periodic housekeeping: expired role assignments, stale outbox claims,
//! old processed outbox rows, expired inbox entries and expired cache keys.

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::services::{IdentityStore, InboxService, OutboxStore, ServiceError, TrustCache};

#[derive(Debug, Clone)]
pub struct MaintenanceSettings {
    pub interval_seconds: u64,
    pub outbox_cleanup_after_days: i64,
    pub stale_claim_seconds: i64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub expired_assignments: u64,
    pub released_claims: u64,
    pub purged_outbox: u64,
    pub purged_inbox: u64,
    pub purged_cache: u64,
}

pub struct MaintenanceWorker {
    store: Arc<dyn IdentityStore>,
    outbox: Arc<dyn OutboxStore>,
    inbox: InboxService,
    cache: Arc<dyn TrustCache>,
    settings: MaintenanceSettings,
}

impl MaintenanceWorker {
    pub fn new(
        store: Arc<dyn IdentityStore>,
        outbox: Arc<dyn OutboxStore>,
        inbox: InboxService,
        cache: Arc<dyn TrustCache>,
        settings: MaintenanceSettings,
    ) -> Self {
        Self {
            store,
            outbox,
            inbox,
            cache,
            settings,
        }
    }

    /// One full pass. Stops at the first failing step.
    pub async fn run_once(&self) -> Result<MaintenanceReport, ServiceError> {
        let now = Utc::now();
        let report = MaintenanceReport {
            expired_assignments: self.store.cleanup_expired_assignments(now).await?,
            released_claims: self
                .outbox
                .release_stale(now - ChronoDuration::seconds(self.settings.stale_claim_seconds))
                .await?,
            purged_outbox: self
                .outbox
                .cleanup(self.settings.outbox_cleanup_after_days)
                .await?,
            purged_inbox: self.inbox.cleanup_expired().await?,
            purged_cache: self.cache.purge_expired().await?,
        };

        if report != MaintenanceReport::default() {
            tracing::info!(
                expired_assignments = report.expired_assignments,
                released_claims = report.released_claims,
                purged_outbox = report.purged_outbox,
                purged_inbox = report.purged_inbox,
                purged_cache = report.purged_cache,
                "Maintenance pass completed"
            );
        }
        Ok(report)
    }

    pub fn start(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let interval = Duration::from_secs(self.settings.interval_seconds.max(1));
        tracing::info!(interval_seconds = interval.as_secs(), "Starting maintenance worker");

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                if let Err(e) = self.run_once().await {
                    tracing::error!(error = %e, "Maintenance pass failed");
                }
            }
            tracing::info!("Maintenance worker stopped");
        })
    }
}

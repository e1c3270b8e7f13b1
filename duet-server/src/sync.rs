//! Periodic reconciliation of the hot cache into the durable store.
//!
//! Each run walks every cached conversation, inserts the entries newer than
//! its watermark, advances the watermark to the newest inserted timestamp and
//! trims the cache back to capacity. Conversations fail independently: a
//! failed insert leaves the watermark untouched and is retried next run.

use std::sync::Arc;
use std::time::Duration;

use duet_proto::message::ConversationId;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::durable::{DurableMessage, DurableStore, StoreError};
use crate::hot_cache::HotCache;

/// Default interval between runs.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(60);

/// Totals for one sync run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Conversations whose unsynced entries were written.
    pub conversations_synced: usize,
    /// Conversations with nothing to write.
    pub conversations_skipped: usize,
    /// Conversations whose write failed.
    pub failures: usize,
    /// Durable rows actually inserted.
    pub messages_inserted: usize,
    /// Cache entries removed by trimming.
    pub entries_trimmed: usize,
}

/// Drains the hot cache into the durable store.
pub struct SyncJob<S> {
    cache: Arc<HotCache>,
    store: Arc<S>,
}

impl<S: DurableStore> SyncJob<S> {
    /// Creates a sync job.
    #[must_use]
    pub const fn new(cache: Arc<HotCache>, store: Arc<S>) -> Self {
        Self { cache, store }
    }

    /// Runs one pass over every cached conversation.
    pub async fn run_once(&self) -> SyncReport {
        let mut report = SyncReport::default();
        for conversation_id in self.cache.conversations().await {
            match self.sync_conversation(conversation_id).await {
                Ok(None) => report.conversations_skipped += 1,
                Ok(Some((inserted, trimmed))) => {
                    report.conversations_synced += 1;
                    report.messages_inserted += inserted;
                    report.entries_trimmed += trimmed;
                }
                Err(e) => {
                    tracing::warn!(
                        conversation_id = %conversation_id,
                        error = %e,
                        "sync failed, will retry next run"
                    );
                    report.failures += 1;
                }
            }
        }
        if report.conversations_synced > 0 || report.failures > 0 {
            tracing::info!(
                synced = report.conversations_synced,
                failures = report.failures,
                inserted = report.messages_inserted,
                trimmed = report.entries_trimmed,
                "sync run complete"
            );
        }
        report
    }

    async fn sync_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Option<(usize, usize)>, StoreError> {
        let claimed = self.cache.claim_unsynced(conversation_id).await;
        let Some(newest) = claimed.iter().map(|m| m.timestamp).max() else {
            return Ok(None);
        };
        let rows = claimed.iter().map(DurableMessage::from).collect();
        let inserted = self.store.insert_messages(rows).await?;
        let watermark = self.cache.advance_watermark(conversation_id, newest).await;
        let trimmed = self.cache.trim(conversation_id).await;
        tracing::debug!(
            conversation_id = %conversation_id,
            claimed = claimed.len(),
            inserted,
            watermark = %watermark,
            trimmed,
            "conversation synced"
        );
        Ok(Some((inserted, trimmed)))
    }

    /// Runs the job every `interval` until `shutdown` flips to `true` (or its
    /// sender is dropped), then runs once more to flush the cache.
    pub fn spawn(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<SyncReport> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            tracing::info!(interval_secs = interval.as_secs(), "sync job started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.run_once().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            let report = self.run_once().await;
            tracing::info!(inserted = report.messages_inserted, "final sync complete");
            report
        })
    }
}

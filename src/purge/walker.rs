use super::classify::{classify, Classification};
use super::error::{PurgeError, SourceError};
use super::filter::message_age;
use super::policy::{ChannelTarget, RetentionPolicy};
use super::source::{DeleteOutcome, MessageDeleter, MessageRecord, MessageSource};
use chrono::{DateTime, Utc};
use serenity::all::{ChannelId, GuildId, MessageId, RoleId, UserId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Largest page the platform will return in one history request.
pub const MAX_PAGE_SIZE: u8 = 100;

/// Messages at or beyond this age can no longer be bulk deleted.
pub const BULK_DELETE_MAX_AGE: Duration = Duration::from_secs(14 * 24 * 60 * 60);

/// Slack kept below the bulk ceiling for the time between classifying a page and the
/// platform receiving the bulk request.
pub const BULK_DELETE_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunStats {
    pub deleted: usize,
    pub bulk_deleted: usize,
    pub individually_deleted: usize,
    pub already_gone: usize,
    pub pages: usize,
    pub scanned: usize,
}

/// State of one walk over a channel's history. Never outlives the call that created it.
struct PurgeRun {
    channel_id: ChannelId,
    started_at: DateTime<Utc>,
    started: Instant,
    cursor: Option<MessageId>,
    stats: RunStats,
}

impl PurgeRun {
    /// The run's notion of "now", advanced by however long the run has taken so far.
    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.started.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.started_at + elapsed
    }

    fn fetch_failed(&self, err: SourceError) -> PurgeError {
        match err {
            SourceError::NotFound | SourceError::Forbidden => PurgeError::ChannelUnavailable {
                channel_id: self.channel_id,
                deleted: self.stats.deleted,
                reason: err,
            },
            other => self.delete_failed(other),
        }
    }

    fn delete_failed(&self, err: SourceError) -> PurgeError {
        PurgeError::RunFailed {
            channel_id: self.channel_id,
            deleted: self.stats.deleted,
            source: err,
        }
    }
}

/// Walks a channel's history from newest to oldest, deleting whatever the policy lets expire.
///
/// Pagination is strictly sequential: a page's deletions are dispatched before the next
/// page is requested. The walk ends when the platform runs out of history (an empty or
/// short page). A page with nothing eligible does not end it, because older pages may
/// still hold expired messages.
#[derive(Clone)]
pub struct PurgeWalker {
    source: Arc<dyn MessageSource>,
    deleter: Arc<dyn MessageDeleter>,
    page_size: u8,
    bulk_ceiling: Duration,
}

impl PurgeWalker {
    pub fn new(source: Arc<dyn MessageSource>, deleter: Arc<dyn MessageDeleter>) -> Self {
        Self {
            source,
            deleter,
            page_size: MAX_PAGE_SIZE,
            bulk_ceiling: BULK_DELETE_MAX_AGE,
        }
    }

    pub fn with_page_size(mut self, page_size: u8) -> Self {
        self.page_size = page_size.clamp(1, MAX_PAGE_SIZE);
        self
    }

    /// Lowers the bulk-delete ceiling. It can never exceed [`BULK_DELETE_MAX_AGE`].
    pub fn with_bulk_ceiling(mut self, ceiling: Duration) -> Self {
        self.bulk_ceiling = ceiling.min(BULK_DELETE_MAX_AGE);
        self
    }

    /// Ages below which a page's messages are sent to the bulk endpoint.
    fn bulk_window(&self) -> Duration {
        self.bulk_ceiling.saturating_sub(BULK_DELETE_MARGIN)
    }

    pub fn source(&self) -> &Arc<dyn MessageSource> {
        &self.source
    }

    pub async fn purge(
        &self,
        target: &ChannelTarget,
        policy: &RetentionPolicy,
    ) -> Result<RunStats, PurgeError> {
        self.purge_at(target, policy, Utc::now()).await
    }

    /// Runs a purge as if the current time were `now`.
    pub async fn purge_at(
        &self,
        target: &ChannelTarget,
        policy: &RetentionPolicy,
        now: DateTime<Utc>,
    ) -> Result<RunStats, PurgeError> {
        let mut run = PurgeRun {
            channel_id: target.channel_id,
            started_at: now,
            started: Instant::now(),
            cursor: None,
            stats: RunStats::default(),
        };
        let mut roles: HashMap<UserId, HashSet<RoleId>> = HashMap::new();

        loop {
            let mut page = self
                .source
                .fetch_messages_before(run.channel_id, run.cursor, self.page_size)
                .await
                .map_err(|e| run.fetch_failed(e))?;
            if page.is_empty() {
                break;
            }

            run.stats.pages += 1;
            run.stats.scanned += page.len();
            let exhausted = page.len() < usize::from(self.page_size);
            let oldest = page.iter().map(|m| m.id).min();

            // Ages are measured per page: a long run can carry a message past the ceiling.
            let page_now = run.now();
            if policy.filters_by_role() {
                self.attach_roles(target.guild_id, policy, page_now, &mut page, &mut roles)
                    .await;
            }

            let batch = classify(&page, policy, page_now, self.bulk_window());
            debug!(
                "Purge {}: page {} scanned {} messages, {} eligible ({} bulk), {} kept",
                target,
                run.stats.pages,
                page.len(),
                batch.eligible(),
                batch.bulk.len(),
                batch.kept
            );

            if !batch.is_empty() {
                self.delete_batch(&mut run, &batch).await?;
            }

            if exhausted {
                break;
            }
            match (run.cursor, oldest) {
                (Some(prev), Some(next)) if next >= prev => {
                    warn!(
                        "Purge {}: history cursor did not move past {}, stopping",
                        target, prev
                    );
                    break;
                }
                _ => run.cursor = oldest,
            }
        }

        Ok(run.stats)
    }

    async fn delete_batch(
        &self,
        run: &mut PurgeRun,
        batch: &Classification,
    ) -> Result<(), PurgeError> {
        if !batch.bulk.is_empty() {
            let removed = self
                .deleter
                .bulk_delete(run.channel_id, &batch.bulk)
                .await
                .map_err(|e| run.delete_failed(e))?;
            run.stats.bulk_deleted += removed;
            run.stats.deleted += removed;
        }

        // One request per message, in order, so the rate limiter sees a steady trickle.
        for id in &batch.individual {
            match self.deleter.delete_one(run.channel_id, *id).await {
                Ok(DeleteOutcome::Deleted) => {
                    run.stats.individually_deleted += 1;
                    run.stats.deleted += 1;
                }
                Ok(DeleteOutcome::AlreadyGone) => {
                    debug!("Message {} was already deleted", id);
                    run.stats.already_gone += 1;
                }
                Err(e) => return Err(run.delete_failed(e)),
            }
        }

        Ok(())
    }

    /// Fills in author roles for messages old enough to be deleted, one lookup per author.
    /// A failed lookup counts as "no roles".
    async fn attach_roles(
        &self,
        guild_id: GuildId,
        policy: &RetentionPolicy,
        now: DateTime<Utc>,
        page: &mut [MessageRecord],
        known: &mut HashMap<UserId, HashSet<RoleId>>,
    ) {
        for message in page.iter_mut() {
            if message.author_role_ids.is_some()
                || message_age(message.created_at, now) < policy.retention
            {
                continue;
            }

            if let Some(roles) = known.get(&message.author_id) {
                message.author_role_ids = Some(roles.clone());
                continue;
            }

            let roles = match self
                .source
                .resolve_author_roles(guild_id, message.author_id)
                .await
            {
                Ok(roles) => roles,
                Err(e) => {
                    debug!(
                        "Could not resolve roles for user {} in guild {}: {}",
                        message.author_id, guild_id, e
                    );
                    HashSet::new()
                }
            };
            known.insert(message.author_id, roles.clone());
            message.author_role_ids = Some(roles);
        }
    }
}

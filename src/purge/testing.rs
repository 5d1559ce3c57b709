//! In-memory platform used by the engine's tests.

use super::error::SourceError;
use super::filter::message_age;
use super::source::{ChannelKind, DeleteOutcome, MessageDeleter, MessageRecord, MessageSource};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serenity::all::{ChannelId, GuildId, MessageId, RoleId, UserId};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

pub fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).unwrap()
}

pub fn hours(n: u64) -> Duration {
    Duration::from_secs(n * 60 * 60)
}

pub fn days(n: u64) -> Duration {
    hours(n * 24)
}

/// A message from user 1 with the given id, `age` old at `now`.
pub fn message_aged(id: u64, age: Duration, now: DateTime<Utc>) -> MessageRecord {
    let created_at = now - chrono::Duration::from_std(age).unwrap();
    MessageRecord::new(MessageId::new(id), UserId::new(1), created_at)
}

/// Ids `first..first + count`, all `age` old.
pub fn messages_aged(
    first: u64,
    count: u64,
    age: Duration,
    now: DateTime<Utc>,
) -> Vec<MessageRecord> {
    (first..first + count).map(|id| message_aged(id, age, now)).collect()
}

#[derive(Debug, Default, Clone)]
pub struct CallLog {
    pub fetches: Vec<(ChannelId, Option<MessageId>)>,
    pub bulk_batches: Vec<usize>,
    pub single_deletes: usize,
    pub role_lookups: usize,
}

/// The platform's clock: `base` at `started`, moving with tokio time afterwards.
struct PlatformClock {
    base: DateTime<Utc>,
    started: tokio::time::Instant,
    bulk_limit: Duration,
}

impl PlatformClock {
    fn now(&self) -> DateTime<Utc> {
        self.base + chrono::Duration::from_std(self.started.elapsed()).unwrap()
    }
}

/// Blocks the first fetch until released, after announcing it has started.
pub struct FetchGate {
    pub entered: Arc<Notify>,
    pub release: Arc<Notify>,
}

#[derive(Default)]
pub struct MockPlatform {
    history: Mutex<HashMap<ChannelId, Vec<MessageRecord>>>,
    kinds: Mutex<HashMap<ChannelId, ChannelKind>>,
    roles: Mutex<HashMap<UserId, HashSet<RoleId>>>,
    fetch_errors: Mutex<HashMap<ChannelId, SourceError>>,
    fail_single_after: Mutex<Option<usize>>,
    gate: Mutex<Option<FetchGate>>,
    fetch_delay: Mutex<Option<Duration>>,
    clock: Mutex<Option<PlatformClock>>,
    calls: Mutex<CallLog>,
}

impl MockPlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_messages(&self, channel_id: ChannelId, messages: Vec<MessageRecord>) {
        self.history
            .lock()
            .unwrap()
            .entry(channel_id)
            .or_default()
            .extend(messages);
    }

    pub fn remaining(&self, channel_id: ChannelId) -> usize {
        self.history
            .lock()
            .unwrap()
            .get(&channel_id)
            .map_or(0, Vec::len)
    }

    pub fn set_kind(&self, channel_id: ChannelId, kind: ChannelKind) {
        self.kinds.lock().unwrap().insert(channel_id, kind);
    }

    pub fn set_roles(&self, user_id: UserId, roles: HashSet<RoleId>) {
        self.roles.lock().unwrap().insert(user_id, roles);
    }

    pub fn fail_fetches(&self, channel_id: ChannelId, error: SourceError) {
        self.fetch_errors.lock().unwrap().insert(channel_id, error);
    }

    /// Single deletes succeed `n` times, then fail as rate limited.
    pub fn fail_single_deletes_after(&self, n: usize) {
        *self.fail_single_after.lock().unwrap() = Some(n);
    }

    pub fn gate_next_fetch(&self) -> (Arc<Notify>, Arc<Notify>) {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some(FetchGate {
            entered: entered.clone(),
            release: release.clone(),
        });
        (entered, release)
    }

    /// Every fetch takes `delay` of tokio time before answering.
    pub fn delay_fetches(&self, delay: Duration) {
        *self.fetch_delay.lock().unwrap() = Some(delay);
    }

    /// Bulk requests are refused, like the real endpoint does, when any message is `limit`
    /// old or older at the moment the request arrives. The platform's clock reads `now`
    /// when this is called.
    pub fn reject_stale_bulk(&self, limit: Duration, now: DateTime<Utc>) {
        *self.clock.lock().unwrap() = Some(PlatformClock {
            base: now,
            started: tokio::time::Instant::now(),
            bulk_limit: limit,
        });
    }

    pub fn calls(&self) -> CallLog {
        self.calls.lock().unwrap().clone()
    }

    fn remove(&self, channel_id: ChannelId, id: MessageId) -> bool {
        let mut history = self.history.lock().unwrap();
        let Some(messages) = history.get_mut(&channel_id) else {
            return false;
        };
        let before = messages.len();
        messages.retain(|m| m.id != id);
        messages.len() != before
    }
}

#[async_trait]
impl MessageSource for MockPlatform {
    async fn fetch_messages_before(
        &self,
        channel_id: ChannelId,
        before: Option<MessageId>,
        limit: u8,
    ) -> Result<Vec<MessageRecord>, SourceError> {
        self.calls.lock().unwrap().fetches.push((channel_id, before));

        let gate = self.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }

        let delay = *self.fetch_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(err) = self.fetch_errors.lock().unwrap().get(&channel_id) {
            return Err(err.clone());
        }

        let mut page: Vec<MessageRecord> = self
            .history
            .lock()
            .unwrap()
            .get(&channel_id)
            .map(|messages| {
                messages
                    .iter()
                    .filter(|m| before.map_or(true, |cursor| m.id < cursor))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        page.sort_by(|a, b| b.id.cmp(&a.id));
        page.truncate(usize::from(limit));
        Ok(page)
    }

    async fn resolve_author_roles(
        &self,
        _guild_id: GuildId,
        user_id: UserId,
    ) -> Result<HashSet<RoleId>, SourceError> {
        self.calls.lock().unwrap().role_lookups += 1;
        self.roles
            .lock()
            .unwrap()
            .get(&user_id)
            .cloned()
            .ok_or(SourceError::NotFound)
    }

    async fn channel_kind(&self, channel_id: ChannelId) -> Result<ChannelKind, SourceError> {
        Ok(self
            .kinds
            .lock()
            .unwrap()
            .get(&channel_id)
            .copied()
            .unwrap_or(ChannelKind::Text))
    }
}

#[async_trait]
impl MessageDeleter for MockPlatform {
    async fn bulk_delete(
        &self,
        channel_id: ChannelId,
        message_ids: &[MessageId],
    ) -> Result<usize, SourceError> {
        self.calls.lock().unwrap().bulk_batches.push(message_ids.len());
        if let Some(clock) = self.clock.lock().unwrap().as_ref() {
            let now = clock.now();
            let history = self.history.lock().unwrap();
            let stale = history.get(&channel_id).is_some_and(|messages| {
                messages
                    .iter()
                    .filter(|m| message_ids.contains(&m.id))
                    .any(|m| message_age(m.created_at, now) >= clock.bulk_limit)
            });
            if stale {
                return Err(SourceError::Other(
                    "HTTP 400: bulk delete only accepts messages under 14 days old".to_string(),
                ));
            }
        }
        Ok(message_ids
            .iter()
            .filter(|id| self.remove(channel_id, **id))
            .count())
    }

    async fn delete_one(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
    ) -> Result<DeleteOutcome, SourceError> {
        {
            let mut budget = self.fail_single_after.lock().unwrap();
            if let Some(left) = budget.as_mut() {
                if *left == 0 {
                    return Err(SourceError::RateLimited {
                        retry_after: Some(Duration::from_secs(2)),
                    });
                }
                *left -= 1;
            }
        }
        self.calls.lock().unwrap().single_deletes += 1;
        if self.remove(channel_id, message_id) {
            Ok(DeleteOutcome::Deleted)
        } else {
            Ok(DeleteOutcome::AlreadyGone)
        }
    }
}

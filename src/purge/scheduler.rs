use super::error::PurgeError;
use super::policy::{ChannelEntry, ChannelTarget};
use super::store::PolicyStore;
use super::walker::{PurgeWalker, RunStats};
use crate::db::{Database, NewPurgeRun};
use chrono::{DateTime, Utc};
use serenity::all::{ChannelId, GuildId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Longest check interval a channel may be configured with, in minutes (30 days).
pub const MAX_CHECK_INTERVAL_MINUTES: u64 = 30 * 24 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunTrigger {
    Scheduled,
    Manual,
}

impl RunTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            RunTrigger::Scheduled => "scheduled",
            RunTrigger::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AlreadyRunning,
    OutsideActiveHours,
}

#[derive(Debug)]
pub enum TickOutcome {
    Skipped(SkipReason),
    Completed(RunStats),
    Failed(PurgeError),
}

#[derive(Debug, Clone)]
pub struct SchedulerStatus {
    pub active_channel_ids: Vec<ChannelId>,
    /// True while any timer is installed.
    pub running: bool,
    pub in_flight: Vec<ChannelId>,
    pub last_runs: HashMap<ChannelId, DateTime<Utc>>,
    pub default_check_interval: Duration,
}

struct ChannelTimer {
    guild_id: GuildId,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct RunSlot {
    guild_id: GuildId,
    flag: Arc<AtomicBool>,
}

/// Clears the channel's running flag when the run ends, however it ends.
struct RunGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

struct Inner {
    store: Arc<dyn PolicyStore>,
    walker: PurgeWalker,
    default_interval: Duration,
    run_log: Option<Database>,
    timers: Mutex<HashMap<ChannelId, ChannelTimer>>,
    // Kept across reloads so a reinstalled timer still sees an in-flight run.
    running: Mutex<HashMap<ChannelId, RunSlot>>,
    last_runs: Mutex<HashMap<ChannelId, DateTime<Utc>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Drives purges for every configured channel, each on its own timer.
///
/// At most one purge runs per channel at any time, whether it was started by a timer
/// or by hand. Stopping or reloading cancels pending timer firings; runs that have
/// already started are left to finish.
#[derive(Clone)]
pub struct PurgeScheduler {
    inner: Arc<Inner>,
}

impl PurgeScheduler {
    pub fn new(
        store: Arc<dyn PolicyStore>,
        walker: PurgeWalker,
        default_interval: Duration,
        run_log: Option<Database>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                walker,
                default_interval,
                run_log,
                timers: Mutex::new(HashMap::new()),
                running: Mutex::new(HashMap::new()),
                last_runs: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Purges every enabled channel once, then installs the recurring timers.
    pub async fn start(&self) -> Result<(), PurgeError> {
        info!("Starting purge scheduler");
        self.seed_last_runs().await;

        let entries = self.load_channels().await?;
        for entry in &entries {
            let scheduler = self.clone();
            let entry = entry.clone();
            tokio::spawn(async move {
                scheduler.tick(&entry).await;
            });
        }

        let installed = self.install_timers(entries);
        info!("Purge scheduler running for {} channels", installed);
        Ok(())
    }

    /// Cancels every timer. In-flight runs are not interrupted.
    pub fn stop(&self) {
        let timers: Vec<_> = lock(&self.inner.timers).drain().collect();
        let count = timers.len();
        for (channel_id, timer) in timers {
            timer.cancel.cancel();
            debug!("Stopped auto-purge for channel {}", channel_id);
        }
        info!("Stopped purge scheduler ({} timers cancelled)", count);
    }

    /// Re-reads the policy store and reinstalls all timers from it. No immediate run.
    /// If the store fails to refresh, the current timers stay in place.
    pub async fn reload(&self) -> Result<usize, PurgeError> {
        info!("Reloading purge configuration");
        self.inner.store.refresh().await?;
        let entries = self.load_channels().await?;
        Ok(self.install_timers(entries))
    }

    /// Purges one configured channel now, ignoring its active hours.
    pub async fn trigger_manual(&self, channel_id: ChannelId) -> Result<usize, PurgeError> {
        let entry = self
            .inner
            .store
            .find_channel(channel_id)
            .await?
            .ok_or(PurgeError::ConfigNotFound { channel_id })?;
        let guard = self
            .claim(&entry.target)
            .ok_or(PurgeError::AlreadyRunning { channel_id })?;

        info!("Manual purge requested for {}", entry.target);
        self.execute(&entry, RunTrigger::Manual, guard, Utc::now())
            .await
            .map(|stats| stats.deleted)
    }

    /// Manually purges every enabled channel configured for `guild_id`, one after another.
    pub async fn trigger_guild(
        &self,
        guild_id: GuildId,
    ) -> Result<Vec<(ChannelTarget, Result<usize, PurgeError>)>, PurgeError> {
        let entries: Vec<_> = self
            .inner
            .store
            .list_enabled_channels()
            .await?
            .into_iter()
            .filter(|e| e.target.guild_id == guild_id)
            .collect();

        let mut results = Vec::with_capacity(entries.len());
        for entry in entries {
            let result = self.trigger_manual(entry.target.channel_id).await;
            results.push((entry.target, result));
        }
        Ok(results)
    }

    pub fn status(&self) -> SchedulerStatus {
        self.snapshot(None)
    }

    /// Like [`status`](Self::status), limited to one guild's channels. `running` still
    /// reflects the scheduler as a whole.
    pub fn status_for_guild(&self, guild_id: GuildId) -> SchedulerStatus {
        let running = self.status().running;
        SchedulerStatus {
            running,
            ..self.snapshot(Some(guild_id))
        }
    }

    fn snapshot(&self, guild: Option<GuildId>) -> SchedulerStatus {
        let in_scope = |id: GuildId| guild.map_or(true, |wanted| wanted == id);
        let mut active_channel_ids: Vec<_> = lock(&self.inner.timers)
            .iter()
            .filter(|(_, timer)| in_scope(timer.guild_id) && !timer.handle.is_finished())
            .map(|(id, _)| *id)
            .collect();
        active_channel_ids.sort();

        let mut in_flight: Vec<_> = lock(&self.inner.running)
            .iter()
            .filter(|(_, slot)| in_scope(slot.guild_id) && slot.flag.load(Ordering::Acquire))
            .map(|(id, _)| *id)
            .collect();
        in_flight.sort();

        // Seeded history carries no guild; within a guild only scheduled channels are shown.
        let last_runs = lock(&self.inner.last_runs)
            .iter()
            .filter(|(id, _)| guild.is_none() || active_channel_ids.contains(id))
            .map(|(id, at)| (*id, *at))
            .collect();

        SchedulerStatus {
            running: !active_channel_ids.is_empty(),
            active_channel_ids,
            in_flight,
            last_runs,
            default_check_interval: self.inner.default_interval,
        }
    }

    /// One scheduled firing for `entry`.
    pub async fn tick(&self, entry: &ChannelEntry) -> TickOutcome {
        self.tick_at(entry, Utc::now()).await
    }

    pub async fn tick_at(&self, entry: &ChannelEntry, now: DateTime<Utc>) -> TickOutcome {
        if !entry.schedule.is_active_at(now) {
            debug!("Skipping purge for {} - outside active hours", entry.target);
            return TickOutcome::Skipped(SkipReason::OutsideActiveHours);
        }

        let Some(guard) = self.claim(&entry.target) else {
            debug!("Skipping purge for {} - previous run still in progress", entry.target);
            return TickOutcome::Skipped(SkipReason::AlreadyRunning);
        };

        match self.execute(entry, RunTrigger::Scheduled, guard, now).await {
            Ok(stats) => TickOutcome::Completed(stats),
            Err(e) => TickOutcome::Failed(e),
        }
    }

    fn claim(&self, target: &ChannelTarget) -> Option<RunGuard> {
        let flag = lock(&self.inner.running)
            .entry(target.channel_id)
            .or_insert_with(|| RunSlot {
                guild_id: target.guild_id,
                flag: Arc::default(),
            })
            .flag
            .clone();
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        Some(RunGuard { flag })
    }

    async fn execute(
        &self,
        entry: &ChannelEntry,
        trigger: RunTrigger,
        _guard: RunGuard,
        now: DateTime<Utc>,
    ) -> Result<RunStats, PurgeError> {
        let policy = Arc::clone(&entry.policy);
        let result = self.inner.walker.purge_at(&entry.target, &policy, now).await;
        let finished_at = Utc::now();
        lock(&self.inner.last_runs).insert(entry.target.channel_id, finished_at);

        match &result {
            Ok(stats) if stats.deleted > 0 => info!(
                "Purged {} messages from {} ({} bulk, {} individually, {} pages, {})",
                stats.deleted,
                entry.target,
                stats.bulk_deleted,
                stats.individually_deleted,
                stats.pages,
                trigger.as_str()
            ),
            Ok(stats) => debug!(
                "No messages to purge in {} ({} scanned)",
                entry.target, stats.scanned
            ),
            Err(e) if e.is_rate_limited() => warn!(
                "Purge of {} stopped by rate limiting after {} deletions, next run resumes",
                entry.target,
                e.deleted()
            ),
            Err(e) => error!("Error purging {}: {}", entry.target, e),
        }

        self.record_run(entry, trigger, now, finished_at, &result).await;
        result
    }

    async fn record_run(
        &self,
        entry: &ChannelEntry,
        trigger: RunTrigger,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        result: &Result<RunStats, PurgeError>,
    ) {
        let Some(db) = &self.inner.run_log else {
            return;
        };
        let run = NewPurgeRun {
            guild_id: entry.target.guild_id.to_string(),
            channel_id: entry.target.channel_id.to_string(),
            trigger: trigger.as_str().to_string(),
            deleted: match result {
                Ok(stats) => stats.deleted,
                Err(e) => e.deleted(),
            },
            error: result.as_ref().err().map(ToString::to_string),
            started_at,
            finished_at,
        };
        if let Err(e) = db.run_blocking(move |db| db.record_purge_run(&run)).await {
            warn!("Failed to record purge run for {}: {}", entry.target, e);
        }
    }

    async fn seed_last_runs(&self) {
        let Some(db) = &self.inner.run_log else {
            return;
        };
        match db.run_blocking(|db| db.last_run_per_channel()).await {
            Ok(rows) => {
                let mut last_runs = lock(&self.inner.last_runs);
                for (channel_id, at) in rows {
                    if let Ok(id) = channel_id.parse::<u64>() {
                        if id != 0 {
                            last_runs.entry(ChannelId::new(id)).or_insert(at);
                        }
                    }
                }
            }
            Err(e) => warn!("Could not load previous purge runs: {}", e),
        }
    }

    /// Enabled channels from the store that are text channels the platform still knows about.
    async fn load_channels(&self) -> Result<Vec<ChannelEntry>, PurgeError> {
        let entries = self.inner.store.list_enabled_channels().await?;
        let source = self.inner.walker.source();

        let mut usable = Vec::with_capacity(entries.len());
        for entry in entries.into_iter().filter(|e| e.enabled) {
            match source.channel_kind(entry.target.channel_id).await {
                Ok(kind) if kind.is_purgeable() => usable.push(entry),
                Ok(kind) => warn!(
                    "Channel {} is not a text channel ({:?}), not scheduling it",
                    entry.target, kind
                ),
                Err(e) => warn!(
                    "Channel {} could not be fetched ({}), not scheduling it",
                    entry.target, e
                ),
            }
        }
        Ok(usable)
    }

    fn install_timers(&self, entries: Vec<ChannelEntry>) -> usize {
        let mut timers = lock(&self.inner.timers);
        for (_, timer) in timers.drain() {
            timer.cancel.cancel();
        }

        for entry in entries {
            let period = entry.schedule.interval_or(self.inner.default_interval);
            let cancel = CancellationToken::new();
            let handle = spawn_timer(
                Arc::downgrade(&self.inner),
                entry.clone(),
                period,
                cancel.clone(),
            );
            info!(
                "Set up auto-purge for {} with interval of {} seconds",
                entry.target,
                period.as_secs()
            );
            timers.insert(
                entry.target.channel_id,
                ChannelTimer {
                    guild_id: entry.target.guild_id,
                    cancel,
                    handle,
                },
            );
        }
        timers.len()
    }
}

fn spawn_timer(
    inner: Weak<Inner>,
    entry: ChannelEntry,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(strong) = inner.upgrade() else { break };
                    let scheduler = PurgeScheduler { inner: strong };
                    let entry = entry.clone();
                    // Spawned so a long purge never holds up cancellation of this timer.
                    tokio::spawn(async move {
                        scheduler.tick(&entry).await;
                    });
                }
            }
        }
        debug!("Timer for {} finished", entry.target);
    })
}

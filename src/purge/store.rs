//! Where channel policies come from.
//!
//! [`FilePolicyStore`] reads `purge.toml` (or a `.json` file of the same shape) and
//! re-reads it on [`PolicyStore::refresh`]. [`StaticPolicyStore`] holds settings built in code.

use super::error::PurgeError;
use super::policy::{
    ActiveHours, ChannelEntry, ChannelTarget, RetentionPolicy, Schedule, STAR_MARKER,
};
use super::scheduler::MAX_CHECK_INTERVAL_MINUTES;
use async_trait::async_trait;
use chrono_tz::Tz;
use serde::Deserialize;
use serenity::all::{ChannelId, GuildId, RoleId, UserId};
use std::collections::HashSet;
use std::num::NonZeroU64;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info};

#[async_trait]
pub trait PolicyStore: Send + Sync {
    /// Every channel that should be purged on a schedule: enabled channels in enabled guilds.
    async fn list_enabled_channels(&self) -> Result<Vec<ChannelEntry>, PurgeError>;

    /// Any configured channel, enabled or not.
    async fn find_channel(&self, channel_id: ChannelId) -> Result<Option<ChannelEntry>, PurgeError>;

    /// Re-reads the backing configuration. Stores without one have nothing to do.
    async fn refresh(&self) -> Result<(), PurgeError> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct GuildPolicies {
    pub guild_id: GuildId,
    pub enabled: bool,
    pub channels: Vec<ChannelEntry>,
}

/// A validated policy configuration.
#[derive(Debug, Clone, Default)]
pub struct PurgeSettings {
    pub default_check_interval: Option<Duration>,
    pub guilds: Vec<GuildPolicies>,
}

impl PurgeSettings {
    pub fn enabled_channels(&self) -> Vec<ChannelEntry> {
        self.guilds
            .iter()
            .filter(|g| g.enabled)
            .flat_map(|g| g.channels.iter().filter(|c| c.enabled).cloned())
            .collect()
    }

    pub fn find_channel(&self, channel_id: ChannelId) -> Option<ChannelEntry> {
        self.guilds
            .iter()
            .flat_map(|g| g.channels.iter())
            .find(|c| c.target.channel_id == channel_id)
            .cloned()
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, PurgeError> {
        let file: PurgeFile =
            toml::from_str(raw).map_err(|e| PurgeError::InvalidConfig(e.to_string()))?;
        file.validate()
    }

    pub fn from_json_str(raw: &str) -> Result<Self, PurgeError> {
        let file: PurgeFile =
            serde_json::from_str(raw).map_err(|e| PurgeError::InvalidConfig(e.to_string()))?;
        file.validate()
    }

    /// Parses `raw` as JSON when `path` ends in `.json`, TOML otherwise.
    pub fn parse_for_path(path: &Path, raw: &str) -> Result<Self, PurgeError> {
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            Self::from_json_str(raw)
        } else {
            Self::from_toml_str(raw)
        }
    }
}

pub struct FilePolicyStore {
    path: PathBuf,
    settings: RwLock<PurgeSettings>,
}

impl FilePolicyStore {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, PurgeError> {
        let path = path.into();
        let raw = std::fs::read_to_string(&path).map_err(|e| {
            PurgeError::Store(format!("failed to read {}: {}", path.display(), e))
        })?;
        let settings = PurgeSettings::parse_for_path(&path, &raw)?;
        info!(
            "Loaded purge policies for {} channels from {}",
            settings.enabled_channels().len(),
            path.display()
        );
        Ok(Self {
            path,
            settings: RwLock::new(settings),
        })
    }

    pub fn default_check_interval(&self) -> Option<Duration> {
        self.read().default_check_interval
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, PurgeSettings> {
        self.settings.read().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl PolicyStore for FilePolicyStore {
    async fn list_enabled_channels(&self) -> Result<Vec<ChannelEntry>, PurgeError> {
        Ok(self.read().enabled_channels())
    }

    async fn find_channel(
        &self,
        channel_id: ChannelId,
    ) -> Result<Option<ChannelEntry>, PurgeError> {
        Ok(self.read().find_channel(channel_id))
    }

    async fn refresh(&self) -> Result<(), PurgeError> {
        let raw = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            PurgeError::Store(format!("failed to read {}: {}", self.path.display(), e))
        })?;
        let settings = PurgeSettings::parse_for_path(&self.path, &raw)?;
        debug!("Re-read purge policies from {}", self.path.display());
        *self.settings.write().unwrap_or_else(PoisonError::into_inner) = settings;
        Ok(())
    }
}

#[derive(Default)]
pub struct StaticPolicyStore {
    settings: RwLock<PurgeSettings>,
}

impl StaticPolicyStore {
    pub fn new(settings: PurgeSettings) -> Arc<Self> {
        Arc::new(Self {
            settings: RwLock::new(settings),
        })
    }

    pub fn replace(&self, settings: PurgeSettings) {
        *self.settings.write().unwrap_or_else(PoisonError::into_inner) = settings;
    }
}

#[async_trait]
impl PolicyStore for StaticPolicyStore {
    async fn list_enabled_channels(&self) -> Result<Vec<ChannelEntry>, PurgeError> {
        Ok(self
            .settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .enabled_channels())
    }

    async fn find_channel(
        &self,
        channel_id: ChannelId,
    ) -> Result<Option<ChannelEntry>, PurgeError> {
        Ok(self
            .settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .find_channel(channel_id))
    }
}

// ---- file format ----

/// Discord ids show up as numbers in TOML and as strings in most JSON exports.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawId {
    Number(u64),
    Text(String),
}

impl RawId {
    fn parse(&self, what: &str) -> Result<u64, PurgeError> {
        let value = match self {
            RawId::Number(n) => *n,
            RawId::Text(s) => s.trim().parse().map_err(|_| {
                PurgeError::InvalidConfig(format!("{what} '{s}' is not a valid id"))
            })?,
        };
        NonZeroU64::new(value)
            .map(NonZeroU64::get)
            .ok_or_else(|| PurgeError::InvalidConfig(format!("{what} must not be zero")))
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct PurgeFile {
    default_check_interval_minutes: Option<u64>,
    #[serde(default, alias = "purgeChannels")]
    guilds: Vec<GuildSection>,
}

#[derive(Debug, Deserialize)]
struct GuildSection {
    #[serde(alias = "guildId")]
    guild_id: RawId,
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default)]
    channels: Vec<ChannelSection>,
}

#[derive(Debug, Deserialize)]
struct ChannelSection {
    id: RawId,
    #[serde(default)]
    name: Option<String>,
    #[serde(default = "default_true")]
    enabled: bool,
    filters: FilterSection,
    #[serde(default)]
    schedule: Option<ScheduleSection>,
}

#[derive(Debug, Deserialize)]
struct FilterSection {
    /// Humantime duration, e.g. "6h" or "2d 12h".
    retention: Option<String>,
    #[serde(alias = "retentionHours")]
    retention_hours: Option<u64>,
    #[serde(default = "default_true", alias = "skipPinned")]
    skip_pinned: bool,
    #[serde(default, alias = "includeBots")]
    include_bots: bool,
    #[serde(default, alias = "includeUsers")]
    include_users: Vec<RawId>,
    #[serde(default, alias = "excludeUsers")]
    exclude_users: Vec<RawId>,
    #[serde(default, alias = "includeRoles")]
    include_roles: Vec<RawId>,
    #[serde(default, alias = "excludeRoles")]
    exclude_roles: Vec<RawId>,
    #[serde(default, alias = "includeKeywords")]
    include_keywords: Vec<String>,
    #[serde(default, alias = "excludeKeywords")]
    exclude_keywords: Vec<String>,
    #[serde(default, alias = "minReactions")]
    min_reactions: Option<u32>,
    #[serde(default, alias = "skipStarred")]
    skip_starred: bool,
    #[serde(default)]
    skip_reaction_marker: Option<String>,
    #[serde(default, alias = "includeFiles")]
    include_files: bool,
    #[serde(default, alias = "includeImages")]
    include_images: bool,
    #[serde(default, alias = "includeEmbeds")]
    include_embeds: bool,
}

#[derive(Debug, Deserialize)]
struct ScheduleSection {
    #[serde(default)]
    timezone: Option<String>,
    #[serde(default, alias = "activeHours")]
    active_hours: Option<HoursSection>,
    #[serde(default, alias = "checkIntervalMinutes")]
    check_interval_minutes: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct HoursSection {
    start: u8,
    end: u8,
}

fn minutes(value: u64, what: &str) -> Result<Duration, PurgeError> {
    if value == 0 {
        return Err(PurgeError::InvalidConfig(format!("{what} must be at least one minute")));
    }
    if value > MAX_CHECK_INTERVAL_MINUTES {
        return Err(PurgeError::InvalidConfig(format!(
            "{what} must be at most {MAX_CHECK_INTERVAL_MINUTES} minutes"
        )));
    }
    Ok(Duration::from_secs(value * 60))
}

fn keywords(raw: Vec<String>) -> Vec<String> {
    raw.into_iter()
        .map(|k| k.trim().to_lowercase())
        .filter(|k| !k.is_empty())
        .collect()
}

fn id_set<T>(raw: &[RawId], what: &str, make: impl Fn(u64) -> T) -> Result<HashSet<T>, PurgeError>
where
    T: std::hash::Hash + Eq,
{
    raw.iter().map(|id| id.parse(what).map(&make)).collect()
}

impl PurgeFile {
    fn validate(self) -> Result<PurgeSettings, PurgeError> {
        let default_check_interval = self
            .default_check_interval_minutes
            .map(|m| minutes(m, "default_check_interval_minutes"))
            .transpose()?;

        let mut seen = HashSet::new();
        let mut guilds = Vec::with_capacity(self.guilds.len());
        for guild in self.guilds {
            let guild_id = GuildId::new(guild.guild_id.parse("guild_id")?);
            let mut channels = Vec::with_capacity(guild.channels.len());
            for channel in guild.channels {
                let entry = channel.validate(guild_id)?;
                if !seen.insert(entry.target.channel_id) {
                    return Err(PurgeError::InvalidConfig(format!(
                        "channel {} is configured more than once",
                        entry.target.channel_id
                    )));
                }
                channels.push(entry);
            }
            guilds.push(GuildPolicies {
                guild_id,
                enabled: guild.enabled,
                channels,
            });
        }

        Ok(PurgeSettings {
            default_check_interval,
            guilds,
        })
    }
}

impl ChannelSection {
    fn validate(self, guild_id: GuildId) -> Result<ChannelEntry, PurgeError> {
        let channel_id = ChannelId::new(self.id.parse("channel id")?);
        let policy = self
            .filters
            .validate()
            .map_err(|e| PurgeError::InvalidConfig(format!("channel {channel_id}: {e}")))?;
        let schedule = match self.schedule {
            Some(section) => section.validate()?,
            None => Schedule::default(),
        };

        Ok(ChannelEntry {
            target: ChannelTarget {
                guild_id,
                channel_id,
                name: self.name.unwrap_or_else(|| channel_id.to_string()),
            },
            policy: Arc::new(policy),
            schedule,
            enabled: self.enabled,
        })
    }
}

impl FilterSection {
    fn validate(self) -> Result<RetentionPolicy, PurgeError> {
        let retention = match (&self.retention, self.retention_hours) {
            (Some(text), _) => humantime::parse_duration(text.trim()).map_err(|e| {
                PurgeError::InvalidConfig(format!("invalid retention '{text}': {e}"))
            })?,
            (None, Some(h)) => h.checked_mul(60 * 60).map(Duration::from_secs).ok_or_else(|| {
                PurgeError::InvalidConfig(format!("retention_hours {h} is out of range"))
            })?,
            (None, None) => {
                return Err(PurgeError::InvalidConfig(
                    "either retention or retention_hours is required".to_string(),
                ))
            }
        };

        let skip_reaction_marker = self
            .skip_reaction_marker
            .filter(|m| !m.trim().is_empty())
            .or_else(|| self.skip_starred.then(|| STAR_MARKER.to_string()));

        let policy = RetentionPolicy {
            retention,
            skip_pinned: self.skip_pinned,
            include_bots: self.include_bots,
            include_users: id_set(&self.include_users, "include_users", UserId::new)?,
            exclude_users: id_set(&self.exclude_users, "exclude_users", UserId::new)?,
            include_roles: id_set(&self.include_roles, "include_roles", RoleId::new)?,
            exclude_roles: id_set(&self.exclude_roles, "exclude_roles", RoleId::new)?,
            include_keywords: keywords(self.include_keywords),
            exclude_keywords: keywords(self.exclude_keywords),
            min_reactions: self.min_reactions.filter(|n| *n > 0),
            skip_reaction_marker,
            include_files: self.include_files,
            include_images: self.include_images,
            include_embeds: self.include_embeds,
        };
        policy.validate()?;
        Ok(policy)
    }
}

impl ScheduleSection {
    fn validate(self) -> Result<Schedule, PurgeError> {
        let timezone = match self.timezone.as_deref().map(str::trim) {
            None | Some("") => Tz::UTC,
            Some(name) => name
                .parse::<Tz>()
                .map_err(|_| PurgeError::InvalidConfig(format!("unknown timezone '{name}'")))?,
        };
        let active_hours = self
            .active_hours
            .map(|h| ActiveHours::new(h.start, h.end))
            .transpose()?;
        let check_interval = self
            .check_interval_minutes
            .map(|m| minutes(m, "check_interval_minutes"))
            .transpose()?;

        Ok(Schedule {
            timezone,
            active_hours,
            check_interval,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::purge::testing::hours;

    const SAMPLE: &str = r#"
default_check_interval_minutes = 10

[[guilds]]
guild_id = 123

[[guilds.channels]]
id = 456
name = "general"

[guilds.channels.filters]
retention = "6h"
include_bots = true
exclude_roles = [789]
include_keywords = ["  LFG "]
min_reactions = 3
skip_starred = true

[guilds.channels.schedule]
timezone = "Europe/Berlin"
active_hours = { start = 22, end = 6 }
check_interval_minutes = 30

[[guilds.channels]]
id = 457
enabled = false

[guilds.channels.filters]
retention_hours = 24

[[guilds]]
guild_id = "999"
enabled = false

[[guilds.channels]]
id = "1000"

[guilds.channels.filters]
retention = "1d"
"#;

    #[test]
    fn parses_full_toml() {
        let settings = PurgeSettings::from_toml_str(SAMPLE).unwrap();
        assert_eq!(settings.default_check_interval, Some(Duration::from_secs(600)));

        let enabled = settings.enabled_channels();
        assert_eq!(enabled.len(), 1);
        let general = &enabled[0];
        assert_eq!(general.target.name, "general");
        assert_eq!(general.target.guild_id, GuildId::new(123));

        let policy = &general.policy;
        assert_eq!(policy.retention, hours(6));
        assert!(policy.skip_pinned);
        assert!(policy.include_bots);
        assert!(!policy.include_files);
        assert_eq!(policy.exclude_roles, HashSet::from([RoleId::new(789)]));
        assert_eq!(policy.include_keywords, vec!["lfg".to_string()]);
        assert_eq!(policy.min_reactions, Some(3));
        assert_eq!(policy.skip_reaction_marker.as_deref(), Some(STAR_MARKER));

        let schedule = &general.schedule;
        assert_eq!(schedule.timezone, Tz::Europe__Berlin);
        assert_eq!(schedule.active_hours, Some(ActiveHours::new(22, 6).unwrap()));
        assert_eq!(schedule.check_interval, Some(Duration::from_secs(1800)));
    }

    #[test]
    fn disabled_entries_are_still_findable() {
        let settings = PurgeSettings::from_toml_str(SAMPLE).unwrap();
        let disabled = settings.find_channel(ChannelId::new(457)).unwrap();
        assert!(!disabled.enabled);
        assert_eq!(disabled.policy.retention, hours(24));
        assert_eq!(disabled.target.name, "457");

        // Channel of a disabled guild.
        assert!(settings.find_channel(ChannelId::new(1000)).is_some());
        assert!(settings.find_channel(ChannelId::new(1)).is_none());
    }

    #[test]
    fn parses_json_with_string_ids() {
        let raw = r#"{
            "purgeChannels": [{
                "guildId": "42",
                "enabled": true,
                "channels": [{
                    "id": "43",
                    "name": "memes",
                    "enabled": true,
                    "filters": { "retentionHours": 48, "skipPinned": false, "includeFiles": true },
                    "schedule": { "timezone": "UTC", "checkIntervalMinutes": 15 }
                }]
            }]
        }"#;
        let settings = PurgeSettings::parse_for_path(Path::new("channels.json"), raw).unwrap();
        let entry = settings.find_channel(ChannelId::new(43)).unwrap();
        assert_eq!(entry.policy.retention, hours(48));
        assert!(!entry.policy.skip_pinned);
        assert!(entry.policy.include_files);
        assert_eq!(entry.schedule.check_interval, Some(Duration::from_secs(900)));
    }

    #[test]
    fn rejects_invalid_configuration() {
        let channel = |filters: &str, schedule: &str| {
            let mut raw = String::from("[[guilds]]\nguild_id = 1\n[[guilds.channels]]\nid = 2\n");
            raw.push_str(&format!("[guilds.channels.filters]\n{filters}\n"));
            if !schedule.is_empty() {
                raw.push_str(&format!("[guilds.channels.schedule]\n{schedule}\n"));
            }
            raw
        };
        let cases = [
            ("zero retention", channel("retention_hours = 0", "")),
            ("huge retention", channel("retention_hours = 9000000000000000000", "")),
            ("missing retention", channel("skip_pinned = true", "")),
            ("bad duration", channel("retention = \"soon\"", "")),
            ("zero id", "[[guilds]]\nguild_id = 0\n".to_string()),
            ("bad timezone", channel("retention = \"1h\"", "timezone = \"Mars/Olympus\"")),
            (
                "bad hours",
                channel("retention = \"1h\"", "active_hours = { start = 25, end = 3 }"),
            ),
            ("zero interval", channel("retention = \"1h\"", "check_interval_minutes = 0")),
            (
                "huge interval",
                channel("retention = \"1h\"", "check_interval_minutes = 9000000000000000000"),
            ),
            (
                "huge default interval",
                format!(
                    "default_check_interval_minutes = 9000000000000000000\n{}",
                    channel("retention = \"1h\"", "")
                ),
            ),
            (
                "duplicate channel",
                channel("retention = \"1h\"", "")
                    + "[[guilds.channels]]\nid = 2\n"
                    + "[guilds.channels.filters]\nretention = \"2h\"\n",
            ),
        ];
        for (name, raw) in cases {
            let result = PurgeSettings::from_toml_str(&raw);
            assert!(
                matches!(result, Err(PurgeError::InvalidConfig(_))),
                "{name}: {result:?}"
            );
        }
    }

    #[tokio::test]
    async fn file_store_refreshes_from_disk() {
        let path = std::env::temp_dir()
            .join(format!("sweeper-store-{}.toml", std::process::id()));
        std::fs::write(&path, SAMPLE).unwrap();

        let store = FilePolicyStore::load(&path).unwrap();
        assert_eq!(store.list_enabled_channels().await.unwrap().len(), 1);
        assert_eq!(store.default_check_interval(), Some(Duration::from_secs(600)));

        let enabled = SAMPLE.replace(
            "guild_id = \"999\"\nenabled = false",
            "guild_id = \"999\"",
        );
        std::fs::write(&path, enabled).unwrap();
        store.refresh().await.unwrap();
        assert_eq!(store.list_enabled_channels().await.unwrap().len(), 2);

        // A broken file leaves the previous settings in place.
        std::fs::write(&path, "this is not toml [").unwrap();
        assert!(store.refresh().await.is_err());
        assert_eq!(store.list_enabled_channels().await.unwrap().len(), 2);

        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn static_store_can_be_replaced() {
        let store = StaticPolicyStore::new(PurgeSettings::default());
        assert!(store.list_enabled_channels().await.unwrap().is_empty());
        store.replace(PurgeSettings::from_toml_str(SAMPLE).unwrap());
        assert_eq!(store.list_enabled_channels().await.unwrap().len(), 1);
    }

    #[test]
    fn shipped_sample_file_parses() {
        let settings = PurgeSettings::from_toml_str(include_str!("../../purge.toml")).unwrap();
        assert_eq!(settings.default_check_interval, Some(Duration::from_secs(300)));
        assert_eq!(settings.enabled_channels().len(), 2);

        let archive = settings
            .find_channel(ChannelId::new(444444444444444444))
            .unwrap();
        assert!(!archive.enabled);

        let bot_log = settings
            .find_channel(ChannelId::new(333333333333333333))
            .unwrap();
        assert!(bot_log.policy.include_bots);
        assert_eq!(bot_log.schedule.check_interval, Some(Duration::from_secs(30 * 60)));
    }
}

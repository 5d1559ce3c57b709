use super::error::PurgeError;
use chrono::{DateTime, Timelike, Utc};
use chrono_tz::Tz;
use serenity::all::{ChannelId, GuildId, RoleId, UserId};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Reaction used by the `skip_starred` shorthand.
pub const STAR_MARKER: &str = "⭐";

/// What a channel keeps and what it lets expire.
///
/// The `include_*` content flags gate deletion eligibility: when a flag is false,
/// a message carrying that kind of content is exempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub retention: Duration,
    pub skip_pinned: bool,
    pub include_bots: bool,
    pub include_users: HashSet<UserId>,
    pub exclude_users: HashSet<UserId>,
    pub include_roles: HashSet<RoleId>,
    pub exclude_roles: HashSet<RoleId>,
    pub include_keywords: Vec<String>,
    pub exclude_keywords: Vec<String>,
    pub min_reactions: Option<u32>,
    pub skip_reaction_marker: Option<String>,
    pub include_files: bool,
    pub include_images: bool,
    pub include_embeds: bool,
}

impl RetentionPolicy {
    /// A policy with no exemptions: everything older than `retention` goes.
    pub fn new(retention: Duration) -> Self {
        Self {
            retention,
            skip_pinned: false,
            include_bots: true,
            include_users: HashSet::new(),
            exclude_users: HashSet::new(),
            include_roles: HashSet::new(),
            exclude_roles: HashSet::new(),
            include_keywords: Vec::new(),
            exclude_keywords: Vec::new(),
            min_reactions: None,
            skip_reaction_marker: None,
            include_files: true,
            include_images: true,
            include_embeds: true,
        }
    }

    pub fn validate(&self) -> Result<(), PurgeError> {
        if self.retention.is_zero() {
            return Err(PurgeError::InvalidConfig(
                "retention must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether evaluating this policy needs the author's roles.
    pub fn filters_by_role(&self) -> bool {
        !self.include_roles.is_empty() || !self.exclude_roles.is_empty()
    }
}

/// Hours of the day (local to the schedule's timezone) in which scheduled purges may run.
/// Half-open `[start, end)`; `start > end` wraps past midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveHours {
    start: u8,
    end: u8,
}

impl ActiveHours {
    pub fn new(start: u8, end: u8) -> Result<Self, PurgeError> {
        if start > 23 || end > 23 {
            return Err(PurgeError::InvalidConfig(format!(
                "active hours must be within 0-23, got {start}-{end}"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> u8 {
        self.start
    }

    pub fn end(&self) -> u8 {
        self.end
    }

    pub fn contains(&self, hour: u32) -> bool {
        let (start, end) = (u32::from(self.start), u32::from(self.end));
        if start <= end {
            hour >= start && hour < end
        } else {
            hour >= start || hour < end
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Schedule {
    pub timezone: Tz,
    pub active_hours: Option<ActiveHours>,
    pub check_interval: Option<Duration>,
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            timezone: Tz::UTC,
            active_hours: None,
            check_interval: None,
        }
    }
}

impl Schedule {
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        match self.active_hours {
            None => true,
            Some(window) => window.contains(now.with_timezone(&self.timezone).hour()),
        }
    }

    pub fn interval_or(&self, default: Duration) -> Duration {
        self.check_interval.unwrap_or(default)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelTarget {
    pub guild_id: GuildId,
    pub channel_id: ChannelId,
    pub name: String,
}

impl std::fmt::Display for ChannelTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{} ({})", self.name, self.channel_id)
    }
}

/// One configured channel as handed out by a policy store.
#[derive(Debug, Clone)]
pub struct ChannelEntry {
    pub target: ChannelTarget,
    pub policy: Arc<RetentionPolicy>,
    pub schedule: Schedule,
    pub enabled: bool,
}

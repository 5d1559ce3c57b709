use serenity::all::ChannelId;
use std::time::Duration;
use thiserror::Error;

/// Failure reported by the platform capabilities (fetching, deleting, role lookup).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("not found")]
    NotFound,
    #[error("missing access")]
    Forbidden,
    #[error("rate limited by the platform")]
    RateLimited { retry_after: Option<Duration> },
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum PurgeError {
    #[error("no purge configuration for channel {channel_id}")]
    ConfigNotFound { channel_id: ChannelId },

    #[error("channel {channel_id} is unavailable ({reason}) after deleting {deleted} messages")]
    ChannelUnavailable {
        channel_id: ChannelId,
        deleted: usize,
        #[source]
        reason: SourceError,
    },

    #[error("purge of channel {channel_id} failed after deleting {deleted} messages: {source}")]
    RunFailed {
        channel_id: ChannelId,
        deleted: usize,
        #[source]
        source: SourceError,
    },

    #[error("a purge of channel {channel_id} is already running")]
    AlreadyRunning { channel_id: ChannelId },

    #[error("invalid purge configuration: {0}")]
    InvalidConfig(String),

    #[error("policy store error: {0}")]
    Store(String),
}

impl PurgeError {
    /// Messages removed before the run aborted. Zero for errors raised before any run started.
    pub fn deleted(&self) -> usize {
        match self {
            PurgeError::ChannelUnavailable { deleted, .. }
            | PurgeError::RunFailed { deleted, .. } => *deleted,
            _ => 0,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(
            self,
            PurgeError::RunFailed {
                source: SourceError::RateLimited { .. },
                ..
            } | PurgeError::ChannelUnavailable {
                reason: SourceError::RateLimited { .. },
                ..
            }
        )
    }
}

//! Capabilities the engine consumes from the chat platform.
//!
//! The engine never talks to Discord directly; it is handed a [`MessageSource`]
//! and a [`MessageDeleter`] and only sees [`MessageRecord`]s.

use super::error::SourceError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serenity::all::{ChannelId, GuildId, MessageId, RoleId, UserId};
use std::collections::HashSet;

/// The attributes of a fetched message that the retention filter looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub id: MessageId,
    pub created_at: DateTime<Utc>,
    pub author_id: UserId,
    pub author_is_bot: bool,
    /// `None` until resolved. The walker fills this in lazily when a policy filters by role.
    pub author_role_ids: Option<HashSet<RoleId>>,
    pub pinned: bool,
    pub content: String,
    pub reaction_count: u32,
    pub reaction_markers: Vec<String>,
    pub has_attachments: bool,
    pub has_image_attachment: bool,
    pub has_embeds: bool,
}

impl MessageRecord {
    pub fn new(id: MessageId, author_id: UserId, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            created_at,
            author_id,
            author_is_bot: false,
            author_role_ids: None,
            pinned: false,
            content: String::new(),
            reaction_count: 0,
            reaction_markers: Vec::new(),
            has_attachments: false,
            has_image_attachment: false,
            has_embeds: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Text,
    Announcement,
    Thread,
    Voice,
    Other,
}

impl ChannelKind {
    pub fn is_purgeable(self) -> bool {
        matches!(self, ChannelKind::Text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    /// The message was already gone; not an error.
    AlreadyGone,
}

#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Up to `limit` messages strictly older than `before` (or the newest when `None`),
    /// newest first.
    async fn fetch_messages_before(
        &self,
        channel_id: ChannelId,
        before: Option<MessageId>,
        limit: u8,
    ) -> Result<Vec<MessageRecord>, SourceError>;

    async fn resolve_author_roles(
        &self,
        guild_id: GuildId,
        user_id: UserId,
    ) -> Result<HashSet<RoleId>, SourceError>;

    async fn channel_kind(&self, channel_id: ChannelId) -> Result<ChannelKind, SourceError>;
}

#[async_trait]
pub trait MessageDeleter: Send + Sync {
    /// Removes every id in one request. Returns how many were actually deleted.
    async fn bulk_delete(
        &self,
        channel_id: ChannelId,
        message_ids: &[MessageId],
    ) -> Result<usize, SourceError>;

    async fn delete_one(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
    ) -> Result<DeleteOutcome, SourceError>;
}

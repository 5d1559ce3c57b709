//! Serenity-backed implementation of the purge engine's platform capabilities.

use crate::purge::error::SourceError;
use crate::purge::source::{
    ChannelKind, DeleteOutcome, MessageDeleter, MessageRecord, MessageSource,
};
use async_trait::async_trait;
use chrono::DateTime;
use serenity::all::{
    Attachment, Channel, ChannelId, ChannelType, GetMessages, GuildId, Message, MessageId, RoleId,
    UserId,
};
use serenity::http::{Http, HttpError};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

#[derive(Clone)]
pub struct SerenityBackend {
    http: Arc<Http>,
}

impl SerenityBackend {
    pub fn new(http: Arc<Http>) -> Self {
        Self { http }
    }
}

fn source_error(err: serenity::Error) -> SourceError {
    match &err {
        serenity::Error::Http(HttpError::UnsuccessfulRequest(resp)) => {
            status_error(resp.status_code.as_u16(), &resp.error.message)
        }
        _ => SourceError::Other(err.to_string()),
    }
}

fn status_error(status: u16, message: &str) -> SourceError {
    match status {
        404 => SourceError::NotFound,
        403 => SourceError::Forbidden,
        // Serenity's ratelimiter already waited once; the header is not surfaced here.
        429 => SourceError::RateLimited { retry_after: None },
        _ => SourceError::Other(format!("HTTP {}: {}", status, message)),
    }
}

fn kind_of(kind: ChannelType) -> ChannelKind {
    match kind {
        ChannelType::Text => ChannelKind::Text,
        ChannelType::News => ChannelKind::Announcement,
        ChannelType::PublicThread | ChannelType::PrivateThread | ChannelType::NewsThread => {
            ChannelKind::Thread
        }
        ChannelType::Voice | ChannelType::Stage => ChannelKind::Voice,
        _ => ChannelKind::Other,
    }
}

fn is_image(content_type: Option<&str>, width: Option<u32>) -> bool {
    match content_type {
        Some(ct) => ct.starts_with("image/"),
        None => width.is_some(),
    }
}

fn is_image_attachment(attachment: &Attachment) -> bool {
    is_image(attachment.content_type.as_deref(), attachment.width)
}

/// Converts a fetched message into the shape the retention filter reads.
pub fn to_record(message: &Message) -> MessageRecord {
    let created_at =
        DateTime::from_timestamp(message.timestamp.unix_timestamp(), 0).unwrap_or_default();
    let mut record = MessageRecord::new(message.id, message.author.id, created_at);

    record.author_is_bot = message.author.bot;
    record.author_role_ids = message
        .member
        .as_ref()
        .map(|member| member.roles.iter().copied().collect());
    record.pinned = message.pinned;
    record.content = message.content.clone();
    // Distinct reactions, not the number of users who reacted.
    record.reaction_count = u32::try_from(message.reactions.len()).unwrap_or(u32::MAX);
    record.reaction_markers = message
        .reactions
        .iter()
        .map(|r| r.reaction_type.to_string())
        .collect();
    record.has_attachments = !message.attachments.is_empty();
    record.has_image_attachment = message.attachments.iter().any(is_image_attachment);
    record.has_embeds = !message.embeds.is_empty();
    record
}

#[async_trait]
impl MessageSource for SerenityBackend {
    async fn fetch_messages_before(
        &self,
        channel_id: ChannelId,
        before: Option<MessageId>,
        limit: u8,
    ) -> Result<Vec<MessageRecord>, SourceError> {
        let mut builder = GetMessages::new().limit(limit);
        if let Some(before) = before {
            builder = builder.before(before);
        }
        let messages = channel_id
            .messages(&self.http, builder)
            .await
            .map_err(source_error)?;
        debug!("Fetched {} messages from channel {}", messages.len(), channel_id);
        Ok(messages.iter().map(to_record).collect())
    }

    async fn resolve_author_roles(
        &self,
        guild_id: GuildId,
        user_id: UserId,
    ) -> Result<HashSet<RoleId>, SourceError> {
        let member = self
            .http
            .get_member(guild_id, user_id)
            .await
            .map_err(source_error)?;
        Ok(member.roles.into_iter().collect())
    }

    async fn channel_kind(&self, channel_id: ChannelId) -> Result<ChannelKind, SourceError> {
        match channel_id.to_channel(&self.http).await.map_err(source_error)? {
            Channel::Guild(channel) => Ok(kind_of(channel.kind)),
            _ => Ok(ChannelKind::Other),
        }
    }
}

#[async_trait]
impl MessageDeleter for SerenityBackend {
    async fn bulk_delete(
        &self,
        channel_id: ChannelId,
        message_ids: &[MessageId],
    ) -> Result<usize, SourceError> {
        match message_ids {
            [] => Ok(0),
            // The bulk endpoint rejects fewer than two ids.
            [single] => match self.delete_one(channel_id, *single).await? {
                DeleteOutcome::Deleted => Ok(1),
                DeleteOutcome::AlreadyGone => Ok(0),
            },
            ids => {
                let map = serde_json::json!({ "messages": ids });
                self.http
                    .delete_messages(channel_id, &map, None)
                    .await
                    .map_err(source_error)?;
                Ok(ids.len())
            }
        }
    }

    async fn delete_one(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
    ) -> Result<DeleteOutcome, SourceError> {
        match self.http.delete_message(channel_id, message_id, None).await {
            Ok(()) => Ok(DeleteOutcome::Deleted),
            Err(e) => match source_error(e) {
                SourceError::NotFound => Ok(DeleteOutcome::AlreadyGone),
                other => Err(other),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serenity::all::{MessageReaction, Timestamp};
    use serde_json::json;

    fn reaction(emoji: &str, count: u64) -> MessageReaction {
        serde_json::from_value(json!({
            "count": count,
            "count_details": { "burst": 0, "normal": count },
            "me": false,
            "me_burst": false,
            "emoji": { "id": null, "name": emoji },
            "burst_colors": [],
        }))
        .unwrap()
    }

    #[test]
    fn test_record_from_message() {
        let mut message = Message::default();
        message.id = MessageId::new(10);
        message.author.id = UserId::new(20);
        message.author.bot = true;
        message.pinned = true;
        message.content = "Weekly announcement".to_string();
        message.timestamp = Timestamp::from_unix_timestamp(1_700_000_000).unwrap();
        message.reactions = vec![reaction("⭐", 7), reaction("👍", 3)];

        let record = to_record(&message);
        assert_eq!(record.id, MessageId::new(10));
        assert_eq!(record.author_id, UserId::new(20));
        assert_eq!(record.created_at.timestamp(), 1_700_000_000);
        assert!(record.author_is_bot);
        assert!(record.pinned);
        assert_eq!(record.content, "Weekly announcement");
        assert_eq!(record.reaction_count, 2);
        assert_eq!(record.reaction_markers, vec!["⭐".to_string(), "👍".to_string()]);
        assert_eq!(record.author_role_ids, None);
        assert!(!record.has_attachments);
        assert!(!record.has_embeds);
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_error(404, "Unknown Message"), SourceError::NotFound);
        assert_eq!(status_error(403, "Missing Access"), SourceError::Forbidden);
        assert_eq!(
            status_error(429, "You are being rate limited."),
            SourceError::RateLimited { retry_after: None }
        );
        assert_eq!(
            status_error(500, "oops"),
            SourceError::Other("HTTP 500: oops".to_string())
        );
    }

    #[test]
    fn test_channel_kinds() {
        assert!(kind_of(ChannelType::Text).is_purgeable());
        assert_eq!(kind_of(ChannelType::News), ChannelKind::Announcement);
        assert_eq!(kind_of(ChannelType::PublicThread), ChannelKind::Thread);
        assert_eq!(kind_of(ChannelType::Voice), ChannelKind::Voice);
        assert_eq!(kind_of(ChannelType::Category), ChannelKind::Other);
    }

    #[test]
    fn test_image_detection() {
        assert!(is_image(Some("image/png"), None));
        assert!(!is_image(Some("application/pdf"), Some(100)));
        assert!(is_image(None, Some(640)));
        assert!(!is_image(None, None));
    }
}

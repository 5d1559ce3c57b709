use super::policy::RetentionPolicy;
use super::source::MessageRecord;
use chrono::{DateTime, Utc};
use serenity::all::RoleId;
use std::collections::HashSet;
use std::time::Duration;

/// Why a message survived a purge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepReason {
    TooRecent,
    Pinned,
    BotAuthor,
    UserNotIncluded,
    UserExcluded,
    RoleNotIncluded,
    RoleExcluded,
    EnoughReactions,
    ReactionMarker,
    KeywordNotIncluded,
    KeywordExcluded,
    HasFiles,
    HasImages,
    HasEmbeds,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Delete,
    Keep(KeepReason),
}

impl Verdict {
    pub fn is_delete(self) -> bool {
        self == Verdict::Delete
    }
}

/// Age of a message at `now`. Timestamps in the future count as age zero.
pub fn message_age(created_at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - created_at).to_std().unwrap_or(Duration::ZERO)
}

pub fn should_delete(
    message: &MessageRecord,
    policy: &RetentionPolicy,
    author_roles: &HashSet<RoleId>,
    now: DateTime<Utc>,
) -> bool {
    evaluate(message, policy, author_roles, now).is_delete()
}

/// Applies every exemption in `policy` to `message`.
///
/// Each exemption alone is enough to keep a message, so the order only decides
/// which [`KeepReason`] gets reported.
pub fn evaluate(
    message: &MessageRecord,
    policy: &RetentionPolicy,
    author_roles: &HashSet<RoleId>,
    now: DateTime<Utc>,
) -> Verdict {
    use KeepReason::*;

    if message_age(message.created_at, now) < policy.retention {
        return Verdict::Keep(TooRecent);
    }

    if policy.skip_pinned && message.pinned {
        return Verdict::Keep(Pinned);
    }

    if message.author_is_bot && !policy.include_bots {
        return Verdict::Keep(BotAuthor);
    }

    if !policy.include_users.is_empty() {
        if !policy.include_users.contains(&message.author_id) {
            return Verdict::Keep(UserNotIncluded);
        }
    } else if policy.exclude_users.contains(&message.author_id) {
        return Verdict::Keep(UserExcluded);
    }

    if !policy.include_roles.is_empty() {
        if policy.include_roles.is_disjoint(author_roles) {
            return Verdict::Keep(RoleNotIncluded);
        }
    } else if !policy.exclude_roles.is_disjoint(author_roles) {
        return Verdict::Keep(RoleExcluded);
    }

    if let Some(min) = policy.min_reactions {
        if message.reaction_count >= min {
            return Verdict::Keep(EnoughReactions);
        }
    }
    if let Some(marker) = &policy.skip_reaction_marker {
        if message.reaction_markers.iter().any(|m| m == marker) {
            return Verdict::Keep(ReactionMarker);
        }
    }

    if !policy.include_keywords.is_empty() || !policy.exclude_keywords.is_empty() {
        let content = message.content.to_lowercase();
        let mentions = |keyword: &String| content.contains(&keyword.to_lowercase());
        if !policy.include_keywords.is_empty() {
            if !policy.include_keywords.iter().any(mentions) {
                return Verdict::Keep(KeywordNotIncluded);
            }
        } else if policy.exclude_keywords.iter().any(mentions) {
            return Verdict::Keep(KeywordExcluded);
        }
    }

    if message.has_attachments && !policy.include_files {
        return Verdict::Keep(HasFiles);
    }
    if message.has_image_attachment && !policy.include_images {
        return Verdict::Keep(HasImages);
    }
    if message.has_embeds && !policy.include_embeds {
        return Verdict::Keep(HasEmbeds);
    }

    Verdict::Delete
}

use super::filter::{evaluate, message_age, Verdict};
use super::policy::RetentionPolicy;
use super::source::MessageRecord;
use chrono::{DateTime, Utc};
use serenity::all::MessageId;
use std::collections::HashSet;
use std::time::Duration;
use tracing::trace;

/// How one page splits up: messages the platform can still bulk delete, messages that
/// must be deleted one request at a time, and how many were kept.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Classification {
    pub bulk: Vec<MessageId>,
    pub individual: Vec<MessageId>,
    pub kept: usize,
}

impl Classification {
    /// True when nothing on the page is eligible for deletion.
    pub fn is_empty(&self) -> bool {
        self.bulk.is_empty() && self.individual.is_empty()
    }

    pub fn eligible(&self) -> usize {
        self.bulk.len() + self.individual.len()
    }
}

/// Partitions `page` by deletion path. Messages younger than `bulk_ceiling` are
/// bulk-eligible; a message exactly at the ceiling is not.
///
/// Author roles are read from [`MessageRecord::author_role_ids`]; unresolved authors
/// are treated as having no roles.
pub fn classify(
    page: &[MessageRecord],
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
    bulk_ceiling: Duration,
) -> Classification {
    let no_roles = HashSet::new();
    let mut batch = Classification::default();

    for message in page {
        let roles = message.author_role_ids.as_ref().unwrap_or(&no_roles);
        match evaluate(message, policy, roles, now) {
            Verdict::Keep(reason) => {
                trace!("Keeping message {}: {:?}", message.id, reason);
                batch.kept += 1;
            }
            Verdict::Delete => {
                if message_age(message.created_at, now) < bulk_ceiling {
                    batch.bulk.push(message.id);
                } else {
                    batch.individual.push(message.id);
                }
            }
        }
    }

    batch
}

//! Retention engine: decides which messages in a channel have outlived their policy and
//! removes them, on a per-channel schedule.
//!
//! [`filter`] judges one message, [`classify`] splits a page by deletion path,
//! [`walker`] pages backward through a channel, and [`scheduler`] runs the walker on
//! timers with at most one run per channel at a time.

pub mod classify;
pub mod error;
pub mod filter;
pub mod policy;
pub mod scheduler;
pub mod source;
pub mod store;
pub mod walker;

#[cfg(test)]
pub(crate) mod testing;

pub use classify::{classify, Classification};
pub use error::{PurgeError, SourceError};
pub use filter::{should_delete, KeepReason, Verdict};
pub use policy::{ActiveHours, ChannelEntry, ChannelTarget, RetentionPolicy, Schedule};
pub use scheduler::{
    PurgeScheduler, RunTrigger, SchedulerStatus, SkipReason, TickOutcome, DEFAULT_CHECK_INTERVAL,
    MAX_CHECK_INTERVAL_MINUTES,
};
pub use source::{ChannelKind, DeleteOutcome, MessageDeleter, MessageRecord, MessageSource};
pub use store::{FilePolicyStore, GuildPolicies, PolicyStore, PurgeSettings, StaticPolicyStore};
pub use walker::{PurgeWalker, RunStats, BULK_DELETE_MAX_AGE};

use crate::config::DISCORD_MESSAGE_LIMIT;
use crate::db::PurgeRunRecord;
use crate::purge::{ChannelTarget, PurgeError};
use crate::{Context, Error};
use poise::serenity_prelude as serenity;

/// Message retention controls
#[poise::command(
    slash_command,
    subcommands("run", "status", "reload", "history"),
    required_permissions = "MANAGE_MESSAGES",
    guild_only
)]
pub async fn purge(_ctx: Context<'_>) -> Result<(), Error> {
    Ok(())
}

/// Purge a configured channel now, or every configured channel in this server
#[poise::command(slash_command)]
pub async fn run(
    ctx: Context<'_>,
    #[description = "Channel to purge (defaults to all configured channels)"]
    #[channel_types("Text")]
    channel: Option<serenity::GuildChannel>,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be run in a guild")?;
    ctx.defer_ephemeral().await?;

    let scheduler = &ctx.data().scheduler;
    let reply = match channel {
        Some(channel) => match scheduler.trigger_manual(channel.id).await {
            Ok(deleted) => format!("🧹 Purged **{}** messages from <#{}>.", deleted, channel.id),
            Err(PurgeError::ConfigNotFound { .. }) => {
                format!("❌ <#{}> has no purge configuration.", channel.id)
            }
            Err(PurgeError::AlreadyRunning { .. }) => {
                format!("⏳ A purge of <#{}> is already in progress.", channel.id)
            }
            Err(e) => format!("❌ Purge failed: {}", e),
        },
        None => {
            let results = scheduler.trigger_guild(guild_id).await?;
            format_guild_results(&results)
        }
    };

    ctx.say(fit_message(reply)).await?;
    Ok(())
}

/// Show the scheduler's state for this server
#[poise::command(slash_command)]
pub async fn status(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be run in a guild")?;
    let status = ctx.data().scheduler.status_for_guild(guild_id);

    let channels = if status.active_channel_ids.is_empty() {
        "None".to_string()
    } else {
        status
            .active_channel_ids
            .iter()
            .map(|id| match status.last_runs.get(id) {
                Some(at) => format!("<#{}> · last run <t:{}:R>", id, at.timestamp()),
                None => format!("<#{}> · not run yet", id),
            })
            .collect::<Vec<_>>()
            .join("\n")
    };

    let embed = serenity::CreateEmbed::new()
        .title("🧹 Purge Scheduler")
        .field(
            "State",
            if status.running { "Running" } else { "Stopped" },
            true,
        )
        .field(
            "Default interval",
            format!("`{}` minutes", status.default_check_interval.as_secs() / 60),
            true,
        )
        .field("In progress", format!("`{}`", status.in_flight.len()), true)
        .field("Scheduled channels", fit_field(channels), false)
        .color(0x5865F2);

    ctx.send(poise::CreateReply::default().embed(embed).ephemeral(true))
        .await?;
    Ok(())
}

/// Re-read the purge configuration file and reschedule (bot owner only)
#[poise::command(slash_command, owners_only)]
pub async fn reload(ctx: Context<'_>) -> Result<(), Error> {
    ctx.defer_ephemeral().await?;

    match ctx.data().scheduler.reload().await {
        Ok(count) => {
            ctx.say(format!("✅ Configuration reloaded. **{}** channels scheduled.", count))
                .await?
        }
        Err(e) => {
            ctx.say(format!("❌ Reload failed, keeping the previous schedule: {}", e))
                .await?
        }
    };
    Ok(())
}

/// Show recent purge runs in this server
#[poise::command(slash_command)]
pub async fn history(
    ctx: Context<'_>,
    #[description = "Number of runs to show"]
    #[min = 1]
    #[max = 25]
    limit: Option<usize>,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be run in a guild")?.to_string();
    let limit = limit.unwrap_or(10);

    let runs = ctx
        .data()
        .db
        .run_blocking(move |db| db.recent_purge_runs(Some(&guild_id), limit))
        .await?;

    ctx.send(
        poise::CreateReply::default()
            .content(fit_message(format_history(&runs)))
            .ephemeral(true),
    )
    .await?;
    Ok(())
}

fn format_guild_results(results: &[(ChannelTarget, Result<usize, PurgeError>)]) -> String {
    if results.is_empty() {
        return "No purge-enabled channels are configured for this server.".to_string();
    }

    let total: usize = results
        .iter()
        .map(|(_, result)| match result {
            Ok(deleted) => *deleted,
            Err(e) => e.deleted(),
        })
        .sum();

    let mut lines = vec![format!(
        "🧹 Purged **{}** messages across {} channels:",
        total,
        results.len()
    )];
    for (target, result) in results {
        lines.push(match result {
            Ok(deleted) => format!("• <#{}>: {}", target.channel_id, deleted),
            Err(e) => format!("• <#{}>: ⚠️ {}", target.channel_id, e),
        });
    }
    lines.join("\n")
}

fn format_history(runs: &[PurgeRunRecord]) -> String {
    if runs.is_empty() {
        return "No purge runs recorded yet.".to_string();
    }

    runs.iter()
        .map(|run| {
            let outcome = match &run.error {
                Some(error) => format!("⚠️ {} deleted, then failed: {}", run.deleted, error),
                None => format!("{} deleted", run.deleted),
            };
            format!(
                "<t:{}:f> · <#{}> · {} · {}",
                run.finished_at.timestamp(),
                run.channel_id,
                run.trigger,
                outcome
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn truncate_to(text: String, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text;
    }
    let mut out: String = text.chars().take(limit.saturating_sub(1)).collect();
    out.push('…');
    out
}

fn fit_message(text: String) -> String {
    truncate_to(text, DISCORD_MESSAGE_LIMIT)
}

// Embed field values are capped at 1024 characters.
fn fit_field(text: String) -> String {
    truncate_to(text, 1024)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::purge::SourceError;
    use chrono::TimeZone;
    use poise::serenity_prelude::{ChannelId, GuildId};

    fn target(id: u64) -> ChannelTarget {
        ChannelTarget {
            guild_id: GuildId::new(1),
            channel_id: ChannelId::new(id),
            name: format!("chan-{id}"),
        }
    }

    #[test]
    fn test_guild_results_sum_partial_counts() {
        let results = vec![
            (target(10), Ok(4)),
            (
                target(11),
                Err(PurgeError::RunFailed {
                    channel_id: ChannelId::new(11),
                    deleted: 2,
                    source: SourceError::Forbidden,
                }),
            ),
        ];
        let text = format_guild_results(&results);
        assert!(text.starts_with("🧹 Purged **6** messages across 2 channels:"));
        assert!(text.contains("• <#10>: 4"));
        assert!(text.contains("• <#11>: ⚠️"));
    }

    #[test]
    fn test_guild_results_empty() {
        assert_eq!(
            format_guild_results(&[]),
            "No purge-enabled channels are configured for this server."
        );
    }

    #[test]
    fn test_history_lines() {
        let at = chrono::Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
        let runs = vec![PurgeRunRecord {
            id: 1,
            guild_id: "1".to_string(),
            channel_id: "10".to_string(),
            trigger: "manual".to_string(),
            deleted: 3,
            error: None,
            started_at: at,
            finished_at: at,
        }];
        assert_eq!(
            format_history(&runs),
            format!("<t:{}:f> · <#10> · manual · 3 deleted", at.timestamp())
        );
        assert_eq!(format_history(&[]), "No purge runs recorded yet.");
    }

    #[test]
    fn test_truncation() {
        let long = "a".repeat(DISCORD_MESSAGE_LIMIT + 10);
        let fitted = fit_message(long);
        assert_eq!(fitted.chars().count(), DISCORD_MESSAGE_LIMIT);
        assert!(fitted.ends_with('…'));
        assert_eq!(fit_field("short".to_string()), "short");
    }
}

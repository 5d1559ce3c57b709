use poise::serenity_prelude as serenity;
use std::sync::Arc;
use sweeper::commands::purge;
use sweeper::discord::SerenityBackend;
use sweeper::purge::{FilePolicyStore, PurgeScheduler, PurgeWalker};
use sweeper::{config::Config, db::Database, Data};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration
    let config = Config::from_env()?;
    let discord_token = config.discord_token.clone();
    info!("Loaded configuration: {:?}", config);

    let framework = poise::Framework::builder()
        .options(poise::FrameworkOptions {
            commands: vec![purge::purge()],
            owners: config
                .owner_id
                .map(|id| std::iter::once(serenity::UserId::new(id)).collect())
                .unwrap_or_default(),
            ..Default::default()
        })
        .setup(|ctx, _ready, framework| {
            Box::pin(async move {
                info!("Bot is ready!");
                if config.register_commands {
                    match config.dev_guild_id {
                        Some(guild_id) => {
                            poise::builtins::register_in_guild(
                                ctx,
                                &framework.options().commands,
                                serenity::GuildId::new(guild_id),
                            )
                            .await?;
                            info!("Registered commands in guild {}", guild_id);
                        }
                        None => {
                            poise::builtins::register_globally(ctx, &framework.options().commands)
                                .await?;
                            info!("Registered commands globally");
                        }
                    }
                }

                // Set bot status
                ctx.set_activity(Some(serenity::ActivityData::custom(&config.status_message)));

                let db = Database::new(&config)?;
                db.execute_init()?;
                let retention_days = config.run_history_retention_days;
                match db.prune_purge_runs(retention_days) {
                    Ok(0) => {}
                    Ok(n) => info!("Pruned {} purge runs older than {} days", n, retention_days),
                    Err(e) => warn!("Failed to prune purge history: {}", e),
                }

                let store = Arc::new(FilePolicyStore::load(&config.purge_config_path)?);
                let default_interval = store
                    .default_check_interval()
                    .unwrap_or_else(|| config.default_check_interval());

                let backend = Arc::new(SerenityBackend::new(ctx.http.clone()));
                let walker = PurgeWalker::new(backend.clone(), backend)
                    .with_page_size(config.purge_page_size)
                    .with_bulk_ceiling(config.bulk_delete_max_age());
                let scheduler =
                    PurgeScheduler::new(store, walker, default_interval, Some(db.clone()));
                scheduler.start().await?;

                let shutdown = scheduler.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        info!("Shutting down purge scheduler");
                        shutdown.stop();
                    }
                });

                Ok(Data {
                    config,
                    db,
                    scheduler,
                })
            })
        })
        .build();

    // Keyword filters need message content.
    let intents =
        serenity::GatewayIntents::non_privileged() | serenity::GatewayIntents::MESSAGE_CONTENT;

    let mut client = serenity::ClientBuilder::new(&discord_token, intents)
        .framework(framework)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create client: {}", e))?;

    let shard_manager = client.shard_manager.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shard_manager.shutdown_all().await;
        }
    });

    info!("Starting bot...");
    if let Err(why) = client.start().await {
        error!("Client error: {:?}", why);
    }

    Ok(())
}

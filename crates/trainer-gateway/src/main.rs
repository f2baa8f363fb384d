use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use teloxide::Bot;
use tracing::{error, info, warn};

use trainer_channels::{BroadcastHandler, DeliveryAdapter, LoopHandle, WeeklyEntryHandler};
use trainer_core::render::{DefaultRenderer, PayloadRenderer};
use trainer_core::{TrainerConfig, ZonedClock};
use trainer_scheduler::reconfigure::{BROADCAST_HANDLER, REMINDER_HANDLER, REPORT_HANDLER};
use trainer_scheduler::{
    EngineOptions, JobStore, Reconfigurator, SchedulerEngine, SqliteWeeklyStore, WeeklyScheduleStore,
};
use trainer_telegram::{Allowlist, BotState, TelegramAdapter, TelegramChannel, TelegramError};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "trainer_gateway=info,trainer_scheduler=info,trainer_channels=info,trainer_telegram=info"
                    .into()
            }),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        git = env!("TRAINER_GIT_SHA"),
        "trainer gateway starting"
    );

    // explicit ENTRENA_CONFIG > ~/.entrena/entrena.toml
    let config_path = std::env::var("ENTRENA_CONFIG").ok();
    let config = TrainerConfig::load(config_path.as_deref())
        .inspect_err(|e| error!(code = e.code(), error = %e, "configuration rejected"))
        .context("loading configuration")?;
    let telegram = config
        .channels
        .telegram
        .clone()
        .filter(|t| !t.bot_token.is_empty())
        .ok_or(TelegramError::NoToken)?;

    let db_path = config.database.path.clone();
    ensure_parent_dir(&db_path);
    info!(path = %db_path, "opening SQLite database");

    let clock = ZonedClock::system(&config.timezone)?;
    let jobs = JobStore::open(&db_path)?;
    let weekly = Arc::new(SqliteWeeklyStore::open(&db_path)?);
    let engine = Arc::new(SchedulerEngine::new(
        jobs,
        clock.inner(),
        EngineOptions::from_config(&config.scheduler),
    ));

    // deliveries from the scheduler thread run on this runtime
    let loop_handle = LoopHandle::empty();
    loop_handle.bind_current();

    let bot = Bot::new(&telegram.bot_token);
    let delivery = Arc::new(DeliveryAdapter::new(
        loop_handle.clone(),
        Arc::new(TelegramChannel::new(bot.clone())),
        Duration::from_secs(config.scheduler.delivery_timeout_secs),
    ));
    let renderer: Arc<dyn PayloadRenderer> = Arc::new(DefaultRenderer);
    let entries = Arc::new(WeeklyEntryHandler::new(Arc::clone(&delivery), Arc::clone(&renderer)));
    engine.register_handler(REMINDER_HANDLER, entries.clone());
    engine.register_handler(REPORT_HANDLER, entries);
    engine.register_handler(
        BROADCAST_HANDLER,
        Arc::new(BroadcastHandler::new(
            delivery,
            renderer,
            weekly.clone() as Arc<dyn WeeklyScheduleStore>,
        )),
    );

    let reconfig = Arc::new(Reconfigurator::new(
        Arc::clone(&engine),
        weekly.clone(),
        clock.clone(),
        config.reminders.lead_minutes,
    ));

    let startup = Arc::clone(&reconfig);
    let reports = config.reports.clone();
    let report = tokio::task::spawn_blocking(move || {
        let report = startup.reconcile_all()?;
        startup.sync_broadcast(&reports)?;
        Ok::<_, trainer_scheduler::SchedulerError>(report)
    })
    .await??;
    if report.failed > 0 {
        warn!(failed = report.failed, "some weekly entries could not be scheduled");
    }

    engine.start()?;

    let state = BotState::new(
        Allowlist::from_config(&telegram),
        Arc::clone(&reconfig),
        weekly,
        clock.timezone(),
    );
    let bot_task = tokio::spawn(TelegramAdapter::new(bot, state).run());
    info!("telegram bot started");

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");

    bot_task.abort();
    let stopping = Arc::clone(&engine);
    tokio::task::spawn_blocking(move || stopping.stop()).await?;
    loop_handle.clear();
    info!("trainer gateway stopped");
    Ok(())
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            warn!(path = %parent.display(), error = %e, "could not create database directory");
        }
    }
}

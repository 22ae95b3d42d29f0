use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use taskbot::bot::Bot;
use taskbot::channels::{Channel, CliChannel, TelegramChannel};
use taskbot::commands::Dispatcher;
use taskbot::config::BotConfig;
use taskbot::queue::{JobWorker, spawn_job_worker};
use taskbot::reminders::{REMINDER_JOB, ReminderJobHandler, ReminderScheduler};
use taskbot::scanner::{DeadlineScanner, spawn_scanner};
use taskbot::session::SessionManager;
use taskbot::store::LibSqlBackend;
use taskbot::tasks::TaskService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = BotConfig::from_env().context("Invalid configuration")?;

    eprintln!("📋 Taskbot v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!(
        "   Scanner: every {}s, job poll every {}s",
        config.scanner.interval.as_secs(),
        config.jobs.poll_interval.as_secs()
    );

    // ── Store ────────────────────────────────────────────────────────────
    let db = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .context("Failed to open database")?,
    );

    // ── Channel ──────────────────────────────────────────────────────────
    let channel: Arc<dyn Channel> = match (&config.telegram_token, config.use_cli) {
        (Some(token), false) => {
            eprintln!(
                "   Telegram: enabled (allowed: {})",
                if config.allowed_users.iter().any(|u| u == "*") {
                    "everyone".to_string()
                } else {
                    config.allowed_users.join(", ")
                }
            );
            Arc::new(TelegramChannel::new(
                token.clone(),
                config.allowed_users.clone(),
            ))
        }
        _ => {
            eprintln!("   Channel: cli (type /help)");
            Arc::new(CliChannel::new())
        }
    };
    channel
        .health_check()
        .await
        .with_context(|| format!("Channel {} failed its health check", channel.name()))?;

    // ── Services ─────────────────────────────────────────────────────────
    let reminders = ReminderScheduler::new(db.clone(), db.clone());
    let dispatcher = Dispatcher::new(
        SessionManager::new(db.clone(), config.session_ttl),
        TaskService::new(db.clone(), reminders.clone()),
    );

    let cancel = CancellationToken::new();

    let scanner = Arc::new(DeadlineScanner::new(
        db.clone(),
        db.clone(),
        reminders,
        channel.clone(),
        config.scanner.clone(),
    ));
    let scanner_handle = spawn_scanner(scanner, cancel.clone());

    let mut worker = JobWorker::new(db.clone(), config.jobs.clone());
    worker.register(
        REMINDER_JOB,
        Arc::new(ReminderJobHandler::new(db.clone(), channel.clone())),
    );
    let worker_handle = spawn_job_worker(Arc::new(worker), cancel.clone());

    // Ctrl+C stops every loop.
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Ctrl+C received, shutting down...");
                shutdown.cancel();
            }
            Err(e) => tracing::warn!(error = %e, "Could not listen for Ctrl+C"),
        }
    });

    let bot = Bot::new(channel, dispatcher);
    let result = bot.run(cancel.clone()).await;

    cancel.cancel();
    let _ = tokio::join!(scanner_handle, worker_handle);

    result.context("Message loop failed")?;
    Ok(())
}

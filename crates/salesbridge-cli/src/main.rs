use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use salesbridge_sync::{
    maybe_build_scheduler, notifier_from_config, BridgeConfig, HttpClients, PassSteps, PgStore,
    Reconciler, RunSummary, Store,
};
use salesbridge_web::AppState;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "salesbridge")]
#[command(about = "Scheduling-to-CRM reconciliation")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// One full pass over every location.
    Run,
    /// Block and run passes on the configured cron schedule.
    Schedule,
    /// Serve webhooks (and the schedule, when enabled).
    Serve,
    /// Apply database migrations.
    Migrate,
    SyncCalendars,
    UpdateStages,
    RefreshNotes {
        /// Rewrite guest-link notes even when present.
        #[arg(long)]
        force: bool,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init();
    }
}

async fn connect(config: &BridgeConfig) -> Result<Arc<PgStore>> {
    let store = PgStore::connect(&config.database_url)
        .await
        .context("connecting to database")?;
    Ok(Arc::new(store))
}

async fn reconciler(config: BridgeConfig) -> Result<Arc<Reconciler>> {
    let store: Arc<dyn Store> = connect(&config).await?;
    let clients = Arc::new(HttpClients::new(config.clone(), store.clone()));
    let notifier = notifier_from_config(&config.notify);
    Ok(Arc::new(Reconciler::new(config, store, clients, notifier)))
}

fn print_summary(summary: &RunSummary) {
    println!(
        "pass complete: run_id={} locations={} failed={} skipped={}",
        summary.run_id,
        summary.locations.len(),
        summary.failed(),
        summary.skipped.len()
    );
    for report in &summary.locations {
        println!(
            "  {}: bookings={} sales={} slots(+{} ~{} -{} !{}){}",
            report.location_id,
            report.bookings_moved,
            report.sales_registered,
            report.slots.created,
            report.slots.updated,
            report.slots.deleted,
            report.slots.failed,
            report
                .error
                .as_deref()
                .map(|err| format!(" error={err}"))
                .unwrap_or_default()
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = BridgeConfig::from_env().context("loading configuration")?;
    init_tracing(config.log_json);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let summary = reconciler(config).await?.run_once().await?;
            print_summary(&summary);
        }
        Commands::SyncCalendars => {
            let summary = reconciler(config)
                .await?
                .run_pass(PassSteps::CALENDARS)
                .await?;
            print_summary(&summary);
        }
        Commands::UpdateStages => {
            let summary = reconciler(config).await?.run_pass(PassSteps::STAGES).await?;
            print_summary(&summary);
        }
        Commands::RefreshNotes { force } => {
            let refreshed = reconciler(config).await?.refresh_notes(force).await?;
            println!("notes refreshed: opportunities={refreshed}");
        }
        Commands::Migrate => {
            connect(&config).await?.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Schedule => {
            let engine = reconciler(config).await?;
            let mut sched = maybe_build_scheduler(engine)
                .await?
                .context("scheduler disabled; set SALESBRIDGE_SCHEDULER_ENABLED=1")?;
            sched.start().await.context("starting scheduler")?;
            info!("scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Serve => {
            let port = config.web_port;
            let engine = reconciler(config).await?;
            let sched = maybe_build_scheduler(engine.clone()).await?;
            if let Some(sched) = &sched {
                sched.start().await.context("starting scheduler")?;
                info!("scheduler running alongside webhooks");
            }
            salesbridge_web::serve(AppState::new(engine), port).await?;
        }
    }

    Ok(())
}

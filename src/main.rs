use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use feed_relay::{
    AppConfig, Crawler, DigestGenerator, Dispatcher, Fetcher, FsDocumentStore, HistoryStore,
    HttpSummarizer, NotifierRegistry,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Each subcommand is one externally-scheduled trigger: the scheduler
/// invokes the binary with a payload (source name, digest window) and the
/// process exits when the work for that trigger is done.
#[derive(Parser)]
#[command(name = "feed-relay", version, about = "RSS/Atom update relay")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "feed-relay.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Poll feeds and record unseen entries (one cycle).
    Crawl {
        /// Restrict the cycle to a single configured source.
        #[arg(long)]
        source: Option<String>,
    },
    /// Crawl, then summarize and deliver the resulting notifications
    /// until the change stream goes idle.
    Run {
        /// Seconds of stream silence before the run is considered done.
        #[arg(long, default_value_t = 10)]
        idle_secs: u64,
    },
    /// Generate and publish a digest over the trailing window.
    Digest {
        /// Window size in days; defaults to the configured value.
        #[arg(long)]
        days: Option<i64>,
    },
    /// Load and validate the configuration, then exit.
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = AppConfig::load(&cli.config)
        .await
        .with_context(|| format!("loading {}", cli.config.display()))?;

    match cli.command {
        Command::Validate => {
            println!(
                "configuration OK: {} sources, {} notifiers, {} summarizer profiles",
                config.sources.len(),
                config.notifiers.len(),
                config.summarizers.len()
            );
            Ok(())
        }
        Command::Crawl { source } => crawl(&config, source.as_deref()).await,
        Command::Run { idle_secs } => run(&config, idle_secs).await,
        Command::Digest { days } => digest(&config, days).await,
    }
}

async fn open_store(config: &AppConfig) -> anyhow::Result<Arc<HistoryStore>> {
    let store = HistoryStore::open(&config.database.path)
        .await
        .with_context(|| format!("opening history database {}", config.database.path))?;
    Ok(Arc::new(store))
}

async fn crawl(config: &AppConfig, only: Option<&str>) -> anyhow::Result<()> {
    let store = open_store(config).await?;
    let fetcher = Arc::new(Fetcher::new(&config.fetch)?);
    let crawler = Crawler::new(fetcher, store.clone(), config.retention.clone());

    let sources = match only {
        Some(name) => {
            let Some(source) = config.source(name) else {
                bail!("unknown source '{}'", name);
            };
            vec![source.clone()]
        }
        None => config.sources.clone(),
    };

    let outcomes = crawler.crawl_all(&sources).await;
    store.purge_expired().await?;

    let new: usize = outcomes.iter().map(|o| o.new).sum();
    let failed: Vec<_> = outcomes
        .iter()
        .filter(|o| o.error.is_some())
        .map(|o| o.source.as_str())
        .collect();
    info!("crawl done: {} new entries", new);

    // A single explicitly-requested source failing should fail the
    // invocation so the external scheduler's retry policy kicks in.
    if only.is_some() && !failed.is_empty() {
        bail!("source '{}' failed this cycle", failed.join(", "));
    }
    Ok(())
}

async fn run(config: &AppConfig, idle_secs: u64) -> anyhow::Result<()> {
    let store = open_store(config).await?;
    let fetcher = Arc::new(Fetcher::new(&config.fetch)?);
    let registry = NotifierRegistry::from_config(
        &config.notifiers,
        config.dispatcher.delivery_timeout_seconds,
    )?;
    let summarizer = Arc::new(HttpSummarizer::new(&config.summarizer_backend)?);

    let dispatcher = Dispatcher::new(
        store.clone(),
        fetcher.clone(),
        summarizer,
        registry,
        config.summarizers.clone(),
        config.summarizer_backend.model_id.clone(),
        config.dispatcher.clone(),
    );

    // Subscribe before crawling so no insertion slips past the dispatcher.
    let rx = store.subscribe();

    let crawler = Crawler::new(fetcher, store.clone(), config.retention.clone());
    crawler.crawl_all(&config.sources).await;

    let stats = dispatcher
        .drain(rx, Duration::from_secs(idle_secs))
        .await;
    store.purge_expired().await?;

    info!(
        "run done: {} delivered, {} fallbacks, {} skipped, {} duplicates dropped, {} permanent failures",
        stats.delivered,
        stats.summary_fallbacks,
        stats.skipped,
        stats.duplicates_dropped,
        stats.permanent_failures
    );
    Ok(())
}

async fn digest(config: &AppConfig, days: Option<i64>) -> anyhow::Result<()> {
    let store = open_store(config).await?;
    let docstore = Arc::new(FsDocumentStore::new(config.digest.output_dir.clone()));

    let announce = match &config.digest.notifier {
        Some(name) => {
            let registry = NotifierRegistry::from_config(
                &config.notifiers,
                config.dispatcher.delivery_timeout_seconds,
            )?;
            registry.get(name).map(|binding| binding.channel.clone())
        }
        None => None,
    };

    let generator = DigestGenerator::new(store, docstore, announce);
    let window_days = days.unwrap_or(config.digest.window_days);
    let (report, location) = generator.run(window_days).await?;

    info!(
        "digest published to {} ({} entries, {} categories)",
        location,
        report.total_entries,
        report.sections.len()
    );
    Ok(())
}

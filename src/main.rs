//! Progressive Filter - demo driver
//!
//! Runs the filtering engine against an in-memory feed: a simulated document
//! of posts, a keyword classifier with artificial latency and a hand-fed
//! mutation source. The driver scrolls the feed, appends new posts while
//! scrolling, then prints telemetry and Prometheus metrics.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use progressive_filter::config::{AppConfig, LoggingConfig};
use progressive_filter::engine::{
    AddedNode, Criteria, Orchestrator, RawChange, ScrollPosition, SessionCause,
};
use progressive_filter::simulation::{ChannelMutationSource, ScriptedClassifier, SimulatedDocument};

/// Command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "PROGRESSIVE_CONFIG", default_value = "progressive.toml")]
    config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json: bool,

    /// Deny term, replaces the configured criteria (repeatable)
    #[arg(long = "deny")]
    deny: Vec<String>,

    /// Allow term, replaces the configured criteria (repeatable)
    #[arg(long = "allow")]
    allow: Vec<String>,

    /// How long to keep running after the last scroll step (seconds)
    #[arg(long, default_value = "2")]
    linger_secs: u64,

    /// Print the Prometheus exposition after the run
    #[arg(long)]
    metrics: bool,
}

/// Where the configuration came from
enum ConfigSource {
    File,
    Defaults,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let (config, source) = load_config(&args.config)?;
    init_logging(&config.logging, args.verbose, args.json)?;

    info!("Starting progressive filter demo");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    match source {
        ConfigSource::File => info!("Configuration loaded from: {}", args.config),
        ConfigSource::Defaults => warn!("Config file '{}' not found, using defaults", args.config),
    }

    let criteria = if args.allow.is_empty() && args.deny.is_empty() {
        config.simulation.criteria.clone()
    } else {
        Criteria::new(args.allow.clone(), args.deny.clone())
    };

    let sim = &config.simulation;
    let document = Arc::new(SimulatedDocument::with_posts(
        sim.viewport_height_px,
        sim.post_spacing_px,
        sim.posts.iter().cloned(),
    ));
    let classifier = Arc::new(
        ScriptedClassifier::topics(sim.classifier_topics.iter().cloned())
            .with_delay(Duration::from_millis(sim.classifier_delay_ms)),
    );
    let mutations = Arc::new(ChannelMutationSource::new());

    info!(
        posts = document.len(),
        allow = criteria.allow.len(),
        deny = criteria.deny.len(),
        classifier_delay_ms = sim.classifier_delay_ms,
        "Simulated feed ready"
    );

    let orchestrator = Orchestrator::builder(config.engine.clone())
        .document(document.clone())
        .classifier(classifier.clone())
        .mutation_source(mutations.clone())
        .criteria(criteria.clone())
        .build()
        .context("Failed to build orchestrator")?;
    orchestrator.start()?;

    let outcome = orchestrator.start_session(SessionCause::Manual, criteria)?;
    info!(
        success = outcome.success,
        session = ?outcome.session_id,
        processed = outcome.viewport.processed,
        filtered = outcome.viewport.filtered,
        elapsed_us = outcome.viewport.elapsed.as_micros() as u64,
        "Initial viewport pass"
    );
    if !outcome.success {
        warn!(error = ?outcome.error, "Filtering session could not start");
    }

    run_driver(&orchestrator, &document, &mutations, &config, &args).await;

    let health = orchestrator.health_check();
    info!(
        state = ?health.state,
        lock_held = health.lock_held,
        queue_depth = health.queue_depth,
        pending_requests = health.pending_requests,
        hidden = document.hidden().len(),
        "Run finished"
    );

    println!("{}", orchestrator.telemetry().snapshot_json());
    if args.metrics {
        println!("{}", orchestrator.metrics().gather_text()?);
    }

    orchestrator.shutdown().await;
    info!("Shut down gracefully");
    Ok(())
}

/// Initialize logging subsystem
fn init_logging(logging: &LoggingConfig, verbose: bool, json: bool) -> Result<()> {
    let env_filter = if verbose {
        "progressive_filter=debug,info".to_string()
    } else {
        format!("progressive_filter={},warn", logging.level)
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| env_filter.into());

    if json || logging.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()?;
    }

    Ok(())
}

/// Load configuration from file with fallback to defaults
fn load_config(path: &str) -> Result<(AppConfig, ConfigSource)> {
    if std::path::Path::new(path).exists() {
        let config = AppConfig::from_file_with_env(path)
            .with_context(|| format!("Failed to load config from {}", path))?;
        Ok((config, ConfigSource::File))
    } else {
        dotenvy::dotenv().ok();
        let mut config = AppConfig::default();
        config
            .engine
            .from_env()
            .context("Invalid PROGRESSIVE_* environment override")?;
        Ok((config, ConfigSource::Defaults))
    }
}

/// Scroll through the feed, appending a post every few steps
async fn run_driver(
    orchestrator: &Arc<Orchestrator>,
    document: &Arc<SimulatedDocument>,
    mutations: &Arc<ChannelMutationSource>,
    config: &AppConfig,
    args: &Args,
) {
    let sim = &config.simulation;
    let mut scroll = tokio::time::interval(Duration::from_millis(sim.scroll_interval_ms.max(1)));
    let mut stats = tokio::time::interval(Duration::from_secs(sim.stats_interval_secs));
    stats.tick().await;

    let linger = tokio::time::sleep(Duration::MAX);
    tokio::pin!(linger);

    let mut step = 0u32;
    let mut lingering = false;
    let mut bottom = sim.posts.len() as f64 * sim.post_spacing_px;

    loop {
        tokio::select! {
            _ = scroll.tick(), if !lingering => {
                step += 1;
                let position: ScrollPosition = document.scroll_to(step as f64 * sim.scroll_step_px);
                if let Some(report) = orchestrator.on_scroll(position) {
                    info!(
                        top = position.top,
                        processed = report.processed,
                        filtered = report.filtered,
                        "Scroll handled"
                    );
                }

                if step % 4 == 0 {
                    let text = format!(
                        "Election recount update {} from the district office, more results tonight",
                        step
                    );
                    let fragment = document.add_fragment(text, bottom);
                    bottom += sim.post_spacing_px;
                    if !mutations.emit(RawChange::added([AddedNode::element(fragment, 3)])) {
                        warn!(%fragment, "Mutation feed detached, new post not announced");
                    }
                }

                if step >= sim.scroll_steps {
                    lingering = true;
                    linger
                        .as_mut()
                        .reset(tokio::time::Instant::now() + Duration::from_secs(args.linger_secs));
                }
            }

            _ = &mut linger => {
                info!("Scroll script finished");
                break;
            }

            _ = stats.tick() => {
                let snapshot = orchestrator.telemetry().snapshot();
                info!(
                    processed = snapshot.fragments_processed,
                    filtered = snapshot.fragments_filtered,
                    kept = snapshot.fragments_kept,
                    classifier_requests = snapshot.classifier_requests,
                    queue_depth = snapshot.queue_depth,
                    "Statistics"
                );
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
        }
    }
}

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use oprad_core::{Opportunity, Profile, SortMode, ViewOptions};
use oprad_engine::{load_profile_file, AnalysisOutcome, Engine, EngineConfig, ProfileExtractor};
use oprad_storage::StateStore;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "oprad")]
#[command(about = "Continuous opportunity discovery for a developer profile")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the discovery loop until Ctrl-C.
    Run {
        /// YAML or JSON profile. Defaults to the last saved profile.
        #[arg(long)]
        profile: Option<PathBuf>,
    },
    /// Print discovered opportunities, best first.
    List {
        #[arg(long, default_value = "match")]
        sort: SortMode,
        /// Only digital products and micro-SaaS.
        #[arg(long)]
        lab: bool,
    },
    /// Run competitor analysis for one opportunity.
    Analyze { id: String },
    /// Print cited research sources.
    Sources,
    /// Build a profile from a free-text description.
    ExtractProfile {
        text: String,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Clear discovered opportunities and sources.
    Reset,
}

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().without_time())
        .init();
}

fn saved_or_default_profile(store: &StateStore) -> Profile {
    store.load_profile().unwrap_or_default()
}

fn print_opportunity(opportunity: &Opportunity) {
    let roi = opportunity
        .dollar_per_hour()
        .map(|value| format!("${value:.0}/h"))
        .unwrap_or_else(|| "-".to_string());
    println!(
        "{:<32} {:>3}% {:>8}  {:<15} {}",
        opportunity.id, opportunity.match_score, roi, opportunity.kind, opportunity.title
    );
}

async fn run(config: &EngineConfig, profile_path: Option<PathBuf>) -> Result<()> {
    let store = config.open_store()?;
    let profile = match profile_path {
        Some(path) => {
            let profile = load_profile_file(&path)?;
            store
                .save_profile(&profile)
                .context("saving profile for later runs")?;
            profile
        }
        None => match store.load_profile() {
            Some(profile) => profile,
            None => bail!("no saved profile; pass --profile <file>"),
        },
    };
    let engine = Engine::new(config, store, config.inference_context()?, profile);

    engine.start();
    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    engine.stop();

    let snapshot = engine.snapshot();
    info!(
        iterations = snapshot.stats.iterations,
        successes = snapshot.stats.successes,
        failures = snapshot.stats.failures,
        total = snapshot.opportunities.len(),
        "discovery stopped"
    );
    Ok(())
}

async fn analyze(config: &EngineConfig, id: &str) -> Result<()> {
    let store = config.open_store()?;
    let profile = saved_or_default_profile(&store);
    let engine = Engine::new(config, store, config.inference_context()?, profile);

    let Some(handle) = engine.analyze(id) else {
        bail!("analysis for {id} is already running");
    };
    match handle.await.context("analysis task panicked")? {
        AnalysisOutcome::Merged => {
            let opportunity = engine
                .store()
                .opportunity(id)
                .with_context(|| format!("{id} disappeared after merge"))?;
            if let Some(report) = &opportunity.spy_report {
                println!("{}", opportunity.title);
                println!("  market:     {}", report.market_status);
                println!("  competitors: {}", report.competitors.join(", "));
                println!("  angle:      {}", report.winning_angle);
                if let Some(valuation) = &report.valuation {
                    println!(
                        "  valuation:  {}h for {} (${:.2}/h)",
                        valuation.estimated_effort_hours,
                        valuation.projected_revenue,
                        valuation.dollar_per_hour
                    );
                }
            }
            Ok(())
        }
        AnalysisOutcome::Failed(reason) => bail!("analysis failed: {reason}"),
    }
}

async fn extract_profile(config: &EngineConfig, text: &str, out: Option<PathBuf>) -> Result<()> {
    let store = config.open_store()?;
    let draft = ProfileExtractor::new(config.inference_context()?)
        .extract(text)
        .await?;
    let profile = draft.merge_into(saved_or_default_profile(&store));
    let yaml = serde_yaml::to_string(&profile)?;
    match out {
        Some(path) => {
            std::fs::write(&path, yaml).with_context(|| format!("writing {}", path.display()))?;
            println!("profile written to {}", path.display());
        }
        None => print!("{yaml}"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();
    let config = EngineConfig::from_env();

    match cli.command {
        Commands::Run { profile } => run(&config, profile).await?,
        Commands::List { sort, lab } => {
            let store = config.open_store()?;
            let ranked = oprad_core::view(
                &store.opportunities(),
                ViewOptions {
                    sort,
                    products_only: lab,
                },
            );
            if ranked.is_empty() {
                println!("no opportunities yet; try `oprad run`");
            }
            ranked.iter().for_each(print_opportunity);
        }
        Commands::Analyze { id } => analyze(&config, &id).await?,
        Commands::Sources => {
            let store = config.open_store()?;
            for source in store.sources() {
                println!("{}\n  {}", source.title, source.uri);
            }
        }
        Commands::ExtractProfile { text, out } => extract_profile(&config, &text, out).await?,
        Commands::Reset => {
            config.open_store()?.reset();
            println!("cleared opportunities and sources in {}", config.data_dir.display());
        }
    }

    Ok(())
}

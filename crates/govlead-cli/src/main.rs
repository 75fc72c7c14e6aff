use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use govlead_adapters::FixtureSearchProvider;
use govlead_core::{AggregatedCompany, JobState, Lead, SearchFilters};
use govlead_engine::{aggregate_awards, score_company};
use govlead_storage::JobStore;
use govlead_worker::{AppConfig, LeadWorker};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "govlead")]
#[command(about = "Government contract lead intelligence")]
struct Cli {
    /// YAML config file; GOVLEAD_* environment variables override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the worker pool and the job HTTP API.
    Serve,
    /// Enqueue one search, run it to a terminal state and print the leads.
    Run {
        /// Filter JSON, inline or as a file path.
        #[arg(long)]
        filters: Option<String>,
        /// Print the full status document as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Aggregate and score an award file offline.
    Score {
        #[arg(long)]
        awards: PathBuf,
        #[arg(long, default_value_t = 20)]
        top: usize,
    },
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("govlead=info"))
        .context("building log filter")?;
    let json = std::env::var("GOVLEAD_LOG_JSON")
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false);
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing()?;
    let config = AppConfig::load(cli.config.as_deref())?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => govlead_web::serve(&config).await?,
        Commands::Run { filters, json } => {
            let filters = match filters {
                Some(raw) => parse_filters(&raw)?,
                None => SearchFilters::default(),
            };
            run_once(&config, filters, json).await?;
        }
        Commands::Score { awards, top } => score_file(&awards, top)?,
    }

    Ok(())
}

fn parse_filters(raw: &str) -> Result<SearchFilters> {
    let text = if raw.trim_start().starts_with('{') {
        raw.to_string()
    } else {
        std::fs::read_to_string(raw).with_context(|| format!("reading filters {raw}"))?
    };
    serde_json::from_str(&text).context("parsing filters")
}

async fn run_once(config: &AppConfig, filters: SearchFilters, json: bool) -> Result<()> {
    let worker_config = config.worker_config();
    let store = Arc::new(JobStore::new(worker_config.job_store_config()));
    let worker = LeadWorker::new(store.clone(), config.collaborators()?, worker_config).start();

    let job_id = store.enqueue(filters).await?;
    info!(%job_id, "job enqueued");

    let mut last_step = String::new();
    let job = loop {
        let job = store.get(&job_id).await?;
        if job.progress.step != last_step {
            info!(
                step = %job.progress.step,
                percentage = job.progress.percentage,
                "{}",
                job.progress.message
            );
            last_step = job.progress.step.clone();
        }
        if job.state.is_terminal() {
            break job;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    };
    worker.shutdown().await?;

    if json {
        let view = govlead_core::JobStatusView::from(job.as_ref());
        println!("{}", serde_json::to_string_pretty(&view)?);
    }
    match (job.state, &job.result, &job.failure) {
        (JobState::Completed, Some(output), _) => {
            if !json {
                println!(
                    "job {job_id} completed after {} attempt(s): {} contracts, {} companies",
                    job.attempts, output.total_contracts, output.total_companies
                );
                print_leads(&output.leads);
            }
            Ok(())
        }
        (_, _, Some(failure)) => bail!(
            "job {job_id} failed after {} attempt(s): {} (retryable: {})",
            job.attempts,
            failure.message,
            failure.resubmit_is_safe()
        ),
        _ => bail!("job {job_id} ended without a result"),
    }
}

fn print_leads(leads: &[Lead]) {
    println!(
        "{:<40} {:>5} {:<12} {:>16} {:>8}",
        "company", "score", "strength", "total awards", "contacts"
    );
    for lead in leads {
        println!(
            "{:<40} {:>5} {:<12} {:>16.2} {:>8}",
            truncate(&lead.company.name, 40),
            lead.intelligence.opportunity_score,
            format!("{:?}", lead.intelligence.relationship_strength),
            lead.company.total_awards,
            lead.contacts.len()
        );
    }
}

fn score_file(path: &Path, top: usize) -> Result<()> {
    let provider = FixtureSearchProvider::from_path(path)?;
    let today = Utc::now().date_naive();
    let companies = aggregate_awards(provider.awards(), today);
    println!(
        "{} awards, {} companies",
        provider.awards().len(),
        companies.len()
    );
    println!(
        "{:<40} {:>5} {:<12} {:<8} {:>16} {:>6}",
        "company", "score", "strength", "trend", "total awards", "active"
    );
    for company in companies.iter().take(top) {
        print_company(company, today);
    }
    Ok(())
}

fn print_company(company: &AggregatedCompany, today: chrono::NaiveDate) {
    let intel = score_company(company, today);
    println!(
        "{:<40} {:>5} {:<12} {:<8} {:>16.2} {:>6}",
        truncate(&company.name, 40),
        intel.opportunity_score,
        format!("{:?}", intel.relationship_strength),
        format!("{:?}", intel.spending_trend),
        company.total_awards,
        company.active_contracts
    );
    for insight in &intel.insights {
        println!("    - {insight}");
    }
}

fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        text.to_string()
    } else {
        let mut out = text.chars().take(width.saturating_sub(1)).collect::<String>();
        out.push('~');
        out
    }
}

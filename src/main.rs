use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use delver::agents::Planner;
use delver::config::Config;
use delver::models::{RunOutcome, RunReport, SearchQuery, When};
use delver::orchestrator::Orchestrator;
use delver::search::{SearchGateway, SerpApiGateway};

#[derive(Parser)]
#[command(name = "delver", version, about = "Iterative web research agent")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Research a question end to end and print the final answer
    Run {
        /// Question to research
        question: String,
        /// Override the configured round cap
        #[arg(long)]
        rounds: Option<u32>,
        /// Print the full run trace as JSON after the answer
        #[arg(long)]
        trace: bool,
    },
    /// Show the planner's opening move without running the loop
    Plan {
        /// Question to plan for
        question: String,
    },
    /// Run one web search and print the result rows
    Search {
        /// Search query
        query: String,
        /// Recency filter: day, week, month or any
        #[arg(long, default_value = "week")]
        when: When,
        /// Result rows to request; defaults to the configured count
        #[arg(long)]
        max_results: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "delver=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    // Load configuration
    let mut config = Config::from_env()?;
    info!("Configuration loaded: {:?}", config.run);

    match cli.command {
        Command::Run {
            question,
            rounds,
            trace,
        } => {
            if let Some(rounds) = rounds {
                config.run.max_rounds = rounds;
            }
            let orchestrator = Orchestrator::from_config(&config)?;
            let report = orchestrator.run(&question).await;
            print_report(&report, trace);
        }
        Command::Plan { question } => {
            let planner = Planner::from_config(&config)?;
            let exchange = planner.plan(&question).await?;
            println!("{}", serde_json::to_string_pretty(&exchange.value)?);
        }
        Command::Search {
            query,
            when,
            max_results,
        } => {
            let gateway = SerpApiGateway::from_config(&config.search)
                .ok_or_else(|| anyhow::anyhow!("SERPAPI_KEY is not set"))?;
            let max_results = max_results.unwrap_or(config.search.max_results);
            let results = gateway
                .search(&SearchQuery::new(query, when, max_results))
                .await?;
            if results.is_empty() {
                println!("No results.");
            }
            for doc in &results {
                println!("[{}] {} ({})", doc.id, doc.title, doc.url);
                if !doc.snippet.is_empty() {
                    println!("     {}", doc.snippet);
                }
            }
        }
    }

    Ok(())
}

fn print_report(report: &RunReport, with_trace: bool) {
    println!();
    println!("===== FINAL ANSWER (Markdown) =====");
    match &report.answer {
        Some(answer) => {
            println!("{}", answer.answer);
            if !answer.key_points.is_empty() {
                println!();
                println!("Key points:");
                for (i, point) in answer.key_points.iter().enumerate() {
                    println!("  {}. {}", i + 1, point);
                }
            }
            if !answer.used_results.is_empty() {
                println!();
                println!("Evidence used: {}", answer.used_results.join(", "));
            }
            if let Some(notes) = &answer.notes {
                println!();
                println!("Notes: {}", notes);
            }
        }
        None => {
            println!("(no answer produced)");
            if let Some(raw) = &report.raw_synthesis {
                println!();
                println!("Raw synthesis output:");
                println!("{}", raw);
            }
        }
    }
    println!("===================================");
    println!(
        "outcome: {}  rounds: {}  evidence: {}  tokens: {}",
        outcome_label(&report.outcome),
        report.rounds,
        report.ledger.len(),
        report.total_tokens
    );
    if with_trace {
        println!();
        println!("{}", report.trace.to_json());
    }
}

fn outcome_label(outcome: &RunOutcome) -> String {
    match outcome {
        RunOutcome::DirectAnswer => "direct answer".to_string(),
        RunOutcome::Researched => "researched".to_string(),
        RunOutcome::ForcedSynthesis { reason } => format!("forced synthesis ({})", reason),
        RunOutcome::SynthesisFailed => "synthesis failed".to_string(),
    }
}

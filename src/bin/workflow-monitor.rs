//! Workflow inspection utility.
//!
//! Reads workflow and step records from the configured repository.
//!
//! ## Usage
//!
//! ```bash
//! # All workflows
//! workflow-monitor list
//!
//! # Only failures
//! workflow-monitor list --status failed
//!
//! # One workflow with its step history
//! workflow-monitor show 4f8a2e90-...-c1
//! ```

use clap::{Parser, Subcommand};
use paigeant::config::PaigeantConfig;
use paigeant::observability::init_default_logging;
use paigeant::repository::{connect_repository, WorkflowFilter, WorkflowRepository, WorkflowStatus};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "workflow-monitor",
    about = "Inspect paigeant workflow and step records"
)]
struct Args {
    /// Configuration file (defaults to PAIGEANT_CONFIG / paigeant.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List workflows, optionally filtered by status
    List {
        /// pending | running | completed | failed
        #[arg(long)]
        status: Option<String>,
    },
    /// Show one workflow and its step history
    Show { correlation_id: String },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => PaigeantConfig::load_from_file(path)?,
        None => PaigeantConfig::load()?,
    };
    init_default_logging(&config);
    let repository = connect_repository(&config.repository).await?;

    match args.command {
        Command::List { status } => {
            let status = match status.as_deref() {
                Some(raw) => Some(
                    WorkflowStatus::parse(raw)
                        .ok_or_else(|| format!("unknown status '{raw}'"))?,
                ),
                None => None,
            };
            let workflows = repository.list_workflows(&WorkflowFilter { status }).await?;
            if workflows.is_empty() {
                println!("no workflows");
                return Ok(());
            }
            for workflow in workflows {
                println!(
                    "{}  {:<9}  {} remaining / {} executed  updated {}",
                    workflow.correlation_id,
                    workflow.status.as_str(),
                    workflow.snapshot.routing_slip.itinerary.len(),
                    workflow.snapshot.routing_slip.executed.len(),
                    workflow.updated_at.to_rfc3339(),
                );
            }
        }
        Command::Show { correlation_id } => {
            let Some(workflow) = repository.get_workflow(&correlation_id).await? else {
                return Err(format!("no workflow with correlation id '{correlation_id}'").into());
            };
            println!("correlation_id: {}", workflow.correlation_id);
            println!("status:         {}", workflow.status.as_str());
            println!("created_at:     {}", workflow.created_at.to_rfc3339());
            println!("updated_at:     {}", workflow.updated_at.to_rfc3339());
            println!(
                "itinerary:      {:?}",
                workflow
                    .snapshot
                    .routing_slip
                    .itinerary
                    .iter()
                    .map(|spec| spec.agent_name.as_str())
                    .collect::<Vec<_>>()
            );
            println!(
                "executed:       {:?}",
                workflow
                    .snapshot
                    .routing_slip
                    .executed
                    .iter()
                    .map(|record| record.agent_name.as_str())
                    .collect::<Vec<_>>()
            );
            println!("inserted_count: {}", workflow.snapshot.routing_slip.inserted_count);

            let steps = repository.get_steps(&correlation_id).await?;
            if steps.is_empty() {
                println!("steps:          none recorded");
            } else {
                println!("steps:");
                for step in steps {
                    println!(
                        "  {:<20} {:<9} attempt={} started={} error={}",
                        step.agent_name,
                        step.status.as_str(),
                        step.attempt,
                        step.started_at.to_rfc3339(),
                        step.error.as_deref().unwrap_or("-"),
                    );
                }
            }
        }
    }
    Ok(())
}

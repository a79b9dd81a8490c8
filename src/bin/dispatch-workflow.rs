//! Workflow dispatch utility.
//!
//! Reads a workflow definition file, dispatches it over the configured
//! transport and prints the correlation id to stdout.
//!
//! ## Usage
//!
//! ```bash
//! # Dispatch a two-step workflow
//! dispatch-workflow pipeline.json
//!
//! # Override the initial payload variables
//! dispatch-workflow pipeline.json --variables '{"city": "Lisbon"}'
//!
//! # Forward a delegation token
//! dispatch-workflow pipeline.json --obo-token "$USER_TOKEN"
//! ```
//!
//! The workflow file is JSON:
//!
//! ```json
//! {
//!   "activities": [
//!     {"agent_name": "summarizer", "prompt": "Summarize the report"},
//!     {"agent_name": "notifier", "prompt": "Post to the ops channel"}
//!   ],
//!   "variables": {"report_url": "https://example.com/report"}
//! }
//! ```

use clap::Parser;
use paigeant::config::{PaigeantConfig, TransportBackend};
use paigeant::contracts::ActivitySpec;
use paigeant::dispatch::{DispatchOptions, WorkflowDispatcher};
use paigeant::observability::init_default_logging;
use paigeant::repository::{connect_repository, WorkflowRepository};
use paigeant::transport::{InMemoryTransport, MqttTransport, Transport};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(
    name = "dispatch-workflow",
    about = "Dispatch a paigeant workflow from a definition file"
)]
struct Args {
    /// Workflow definition file (JSON)
    workflow_file: PathBuf,

    /// Configuration file (defaults to PAIGEANT_CONFIG / paigeant.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Extra payload variables as a JSON object, merged over the file's
    #[arg(long)]
    variables: Option<String>,

    /// On-behalf-of token, forwarded opaquely in the envelope
    #[arg(long)]
    obo_token: Option<String>,

    /// Trace id propagated verbatim through the workflow
    #[arg(long)]
    trace_id: Option<String>,
}

#[derive(Deserialize)]
struct WorkflowFile {
    activities: Vec<ActivitySpec>,
    #[serde(default)]
    variables: Map<String, Value>,
}

async fn dispatch<T: Transport>(
    transport: Arc<T>,
    repository: Arc<dyn WorkflowRepository>,
    activities: Vec<ActivitySpec>,
    options: DispatchOptions,
) -> Result<String, Box<dyn std::error::Error>> {
    transport.connect().await?;
    let mut dispatcher = WorkflowDispatcher::new(transport.clone(), repository);
    for spec in activities {
        dispatcher.add_to_runway(spec);
    }
    let correlation_id = dispatcher.dispatch_workflow(options).await?;
    transport.disconnect().await?;
    Ok(correlation_id)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => PaigeantConfig::load_from_file(path)?,
        None => PaigeantConfig::load()?,
    };
    init_default_logging(&config);

    let raw = std::fs::read_to_string(&args.workflow_file)?;
    let workflow: WorkflowFile = serde_json::from_str(&raw)?;
    if workflow.activities.is_empty() {
        return Err("workflow file declares no activities".into());
    }

    let mut variables = workflow.variables;
    if let Some(extra) = &args.variables {
        let extra: Map<String, Value> = serde_json::from_str(extra)?;
        variables.extend(extra);
    }

    let options = DispatchOptions {
        variables,
        obo_token: args.obo_token,
        trace_id: args.trace_id,
    };

    let repository = connect_repository(&config.repository).await?;
    let correlation_id = match config.transport.backend {
        TransportBackend::Mqtt => {
            let transport = Arc::new(MqttTransport::new(config.transport.mqtt.clone()));
            dispatch(transport, repository, workflow.activities, options).await?
        }
        TransportBackend::InMemory => {
            let transport = Arc::new(InMemoryTransport::new());
            dispatch(transport, repository, workflow.activities, options).await?
        }
    };

    println!("{correlation_id}");
    Ok(())
}

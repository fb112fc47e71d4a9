use schema_synth::grounding::{name_variants, EvidenceGrounder};
use schema_synth::llm::LlmClient;
use schema_synth::step::{OfflineOracle, Oracle};
use schema_synth::{PipelineConfig, PipelineReport, SchemaInput, SchemaPipeline};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "schema-synth")]
#[command(about = "Validate, repair and type a relational schema from upstream phase output")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the core phases over a JSON snapshot of upstream output
    Run {
        /// Snapshot file (source text, entities, attributes, relations, keys, formulas)
        input: PathBuf,

        /// Never call the oracle; every step uses its deterministic fallback
        #[arg(long)]
        offline: bool,

        /// Write the JSON report here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Check whether a claim is grounded verbatim in a source file
    Ground {
        /// Claimed evidence snippet
        claim: String,

        /// Source text file
        source_file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Run { input, offline, output } => run(input, offline, output).await,
        Commands::Ground { claim, source_file } => ground(claim, source_file),
    }
}

async fn run(input: PathBuf, offline: bool, output: Option<PathBuf>) -> Result<()> {
    let config = PipelineConfig::from_env()?;
    let raw = fs::read_to_string(&input).with_context(|| format!("reading {}", input.display()))?;
    let snapshot: SchemaInput =
        serde_json::from_str(&raw).with_context(|| format!("parsing snapshot {}", input.display()))?;

    let oracle: Arc<dyn Oracle> = match LlmClient::from_config(&config.oracle) {
        Some(client) if !offline => Arc::new(client),
        Some(_) => Arc::new(OfflineOracle),
        None => {
            if !offline {
                warn!("⚠️  OPENAI_API_KEY not set, running offline");
            }
            Arc::new(OfflineOracle)
        }
    };

    let pipeline = SchemaPipeline::new(oracle, &config);
    let state = pipeline.run(snapshot).await?;
    let report = PipelineReport::from_state(&state, pipeline.oracle_name());
    let rendered = serde_json::to_string_pretty(&report)?;

    match output {
        Some(path) => {
            fs::write(&path, rendered).with_context(|| format!("writing {}", path.display()))?;
            info!("✅ Report written to {}", path.display());
        }
        None => println!("{}", rendered),
    }
    Ok(())
}

fn ground(claim: String, source_file: PathBuf) -> Result<()> {
    let source = fs::read_to_string(&source_file).with_context(|| format!("reading {}", source_file.display()))?;
    let grounder = EvidenceGrounder::new(&source);

    if grounder.verify(&claim) {
        println!("✅ grounded: {:?} occurs verbatim in {}", claim, source_file.display());
    } else {
        println!("⚠️  not grounded: {:?} does not occur verbatim in {}", claim, source_file.display());
        let variants: Vec<String> = name_variants(&claim).into_iter().collect();
        println!("   recognised name variants: {}", variants.join(", "));
    }
    Ok(())
}
